// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Operator prompts.
//!
//! Some deployment steps need input only the operator can give, e.g.,
//! passwords for HTTP authentication or whether to upgrade a database.

use inquire::{Confirm, Password, Text};
use tracing::{info, instrument};

/// Ask the operator questions.
pub trait Prompter {
    /// Ask a yes/no question.
    fn confirm(&self, message: &str, default: bool) -> Result<bool>;

    /// Ask for a secret without echoing it.
    fn password(&self, message: &str) -> Result<String>;

    /// Ask for free text.
    fn text(&self, message: &str, default: &str) -> Result<String>;
}

/// Interactive terminal prompter.
#[derive(Debug, Default, Clone, Copy)]
pub struct InquirePrompter;

impl Prompter for InquirePrompter {
    #[instrument(skip(self), level = "debug")]
    fn confirm(&self, message: &str, default: bool) -> Result<bool> {
        Ok(Confirm::new(message).with_default(default).prompt()?)
    }

    #[instrument(skip(self), level = "debug")]
    fn password(&self, message: &str) -> Result<String> {
        info!("secret required: {message}");
        Ok(Password::new(message).without_confirmation().prompt()?)
    }

    #[instrument(skip(self), level = "debug")]
    fn text(&self, message: &str, default: &str) -> Result<String> {
        Ok(Text::new(message).with_default(default).prompt()?)
    }
}

/// Prompt error types.
#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    /// Terminal prompt fails or is cancelled.
    #[error(transparent)]
    Inquire(#[from] inquire::InquireError),

    /// No more answers available.
    #[error("no answer for prompt {0:?}")]
    NoAnswer(String),
}

/// Friendly result alias :3
pub type Result<T, E = PromptError> = std::result::Result<T, E>;
