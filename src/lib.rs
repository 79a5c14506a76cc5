// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration and deployment of a fleet of web apps.
//!
//! Every app of the fleet is described by one section of an INI-style apps
//! file. The [`registry`] loads that file into typed [`app::App`] records,
//! and the [`task`] module runs deployment tasks for one app against the
//! host serving it in a given environment.

pub mod app;
pub mod config;
pub mod path;
pub mod registry;
pub mod task;

pub use app::{App, Stack};
pub use registry::{Registry, SortOrder};
pub use task::{Dispatcher, Environment, Task, TaskContext};
