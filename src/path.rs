// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevant path information for files that need to be interacted
//! with, both locally and on the remote hosts that run the apps.
//!
//! # Remote Layout
//!
//! Every app owns a fixed set of locations on its host. All of them are
//! derived from the app's name joined onto one of the root prefixes below,
//! so two apps can never collide as long as their names differ.

use std::path::{Path, PathBuf};

/// Root of the per-app virtual environments.
pub const VENVS_ROOT: &str = "/usr/venvs";

/// Root of the per-app home directories.
pub const HOME_ROOT: &str = "/home";

/// Root of the per-app log directories.
pub const LOG_ROOT: &str = "/var/log";

/// Directory holding logrotate snippets.
pub const LOGROTATE_ROOT: &str = "/etc/logrotate.d";

/// Directory holding supervisor program configurations.
pub const SUPERVISOR_ROOT: &str = "/etc/supervisor/conf.d";

/// Directory holding enabled nginx sites.
pub const NGINX_SITES_ROOT: &str = "/etc/nginx/sites-enabled";

/// Directory holding nginx location snippets for the test environment.
pub const NGINX_LOCATIONS_ROOT: &str = "/etc/nginx/locations.d";

/// Default nginx site shared by all apps on a test host.
pub const NGINX_DEFAULT_SITE: &str = "/etc/nginx/sites-available/default";

/// Join an app name onto a root prefix.
pub fn app_path(root: &str, name: &str) -> PathBuf {
    Path::new(root).join(name)
}

/// Join an app name with a file extension onto a root prefix.
pub fn app_file(root: &str, name: &str, extension: &str) -> PathBuf {
    Path::new(root).join(format!("{name}.{extension}"))
}

/// Determine default absolute path to the apps configuration file.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/appconfig/apps.ini` as the
/// default. Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if the configuration directory cannot be
///   determined.
pub fn default_config_file() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("appconfig").join("apps.ini"))
        .ok_or(NoWayHome)
}

/// Expand `~` and environment variables in a user supplied path.
///
/// Leaves the path untouched when expansion fails, so the caller reports the
/// missing file instead of a lookup error.
pub fn expand(path: impl AsRef<Path>) -> PathBuf {
    let raw = path.as_ref().to_string_lossy();
    match shellexpand::full(raw.as_ref()) {
        Ok(expanded) => PathBuf::from(expanded.into_owned()),
        Err(_) => path.as_ref().to_path_buf(),
    }
}

/// No way to determine user's configuration directory.
///
/// # See Also
///
/// - [`dirs::config_dir`](https://docs.rs/dirs/latest/dirs/fn.config_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's configuration directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;
