// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Application records.
//!
//! An __app__ is one deployable web application of the fleet. Each section
//! of the apps file describes exactly one app through a fixed set of
//! fields. Every field has a conversion rule that turns its raw text into a
//! typed value, and every field must be given, either in the section itself
//! or through the `[DEFAULT]` section.
//!
//! # Derived Paths
//!
//! Apps never store filesystem locations. Locations such as the virtual
//! environment, the supervisor program file, or the nginx site are computed
//! from the app's name on every access. Renaming an app through
//! [`App::replace`] therefore moves all of its locations along with it.
//!
//! # See Also
//!
//! 1. [`path`](crate::path)
//! 2. [`Registry`](crate::registry::Registry)

use crate::{
    config::escape,
    path::{
        app_file, app_path, HOME_ROOT, LOGROTATE_ROOT, LOG_ROOT, NGINX_DEFAULT_SITE,
        NGINX_LOCATIONS_ROOT, NGINX_SITES_ROOT, SUPERVISOR_ROOT, VENVS_ROOT,
    },
    task::Environment,
};

use std::{
    collections::HashMap,
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
    str::FromStr,
};

/// All recognized fields of an app section, in serialization order.
pub const FIELDS: &[&str] = &[
    "name",
    "port",
    "domain",
    "test",
    "production",
    "workers",
    "deploy_duration",
    "with_blog",
    "pg_collkey",
    "pg_unaccent",
    "require_deb",
    "require_pip",
    "app_pkg",
    "error_email",
    "stack",
    "public",
];

/// Deployable application.
///
/// # Invariants
///
/// - Port is never zero.
/// - At least one worker.
/// - Records are immutable once built. Use [`App::replace`] to derive a
///   modified copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct App {
    name: String,
    port: u16,
    domain: Option<String>,
    test: Option<String>,
    production: Option<String>,
    workers: u32,
    deploy_duration: u32,
    with_blog: bool,
    pg_collkey: bool,
    pg_unaccent: bool,
    require_deb: Vec<String>,
    require_pip: Vec<String>,
    app_pkg: String,
    error_email: String,
    stack: Stack,
    public: bool,
}

impl App {
    /// Construct app from raw key/value pairs of a section.
    ///
    /// Each recognized field is converted by its own rule. Keys are matched
    /// case-insensitively.
    ///
    /// # Errors
    ///
    /// - Return [`AppError::MissingField`] if any recognized field is absent.
    /// - Return [`AppError::UnknownField`] listing every unrecognized key.
    /// - Return [`AppError::InvalidValue`] if a value cannot be converted.
    pub fn from_entries(
        section: &str,
        entries: impl IntoIterator<Item = (impl AsRef<str>, impl AsRef<str>)>,
    ) -> Result<Self> {
        let mut values = entries
            .into_iter()
            .map(|(key, value)| (key.as_ref().to_lowercase(), value.as_ref().to_string()))
            .collect::<HashMap<_, _>>();

        let mut app = Self::blank();
        for &field in FIELDS {
            let raw = values.remove(field).ok_or_else(|| AppError::MissingField {
                app: section.to_string(),
                field,
            })?;
            app.assign(section, field, &raw)?;
        }

        if !values.is_empty() {
            let mut fields = values.into_keys().collect::<Vec<_>>();
            fields.sort();
            return Err(AppError::UnknownField {
                app: section.to_string(),
                fields,
            });
        }

        Ok(app)
    }

    /// Derive new app with some fields replaced.
    ///
    /// Overrides are raw text, converted by the same rules as
    /// [`App::from_entries`]. All other fields are copied. The current app is
    /// left untouched.
    ///
    /// # Errors
    ///
    /// - Return [`AppError::UnknownField`] listing every unrecognized key.
    /// - Return [`AppError::InvalidValue`] if a value cannot be converted.
    pub fn replace(
        &self,
        overrides: impl IntoIterator<Item = (impl AsRef<str>, impl AsRef<str>)>,
    ) -> Result<Self> {
        let overrides = overrides
            .into_iter()
            .map(|(key, value)| (key.as_ref().to_lowercase(), value.as_ref().to_string()))
            .collect::<Vec<_>>();

        let mut unknown = overrides
            .iter()
            .filter(|(key, _)| !FIELDS.contains(&key.as_str()))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        if !unknown.is_empty() {
            unknown.sort();
            return Err(AppError::UnknownField {
                app: self.name.clone(),
                fields: unknown,
            });
        }

        let mut app = self.clone();
        for (field, raw) in &overrides {
            app.assign(&self.name, field, raw)?;
        }

        Ok(app)
    }

    /// Raw key/value pairs that reconstruct this app.
    ///
    /// Values are escaped for interpolation, so they can be written into an
    /// [`IniDocument`](crate::config::IniDocument) as is.
    pub fn to_entries(&self) -> Vec<(&'static str, String)> {
        let optional = |value: &Option<String>| value.as_deref().map(escape).unwrap_or_default();
        let words = |value: &[String]| escape(&value.join(" "));

        vec![
            ("name", escape(&self.name)),
            ("port", self.port.to_string()),
            ("domain", optional(&self.domain)),
            ("test", optional(&self.test)),
            ("production", optional(&self.production)),
            ("workers", self.workers.to_string()),
            ("deploy_duration", self.deploy_duration.to_string()),
            ("with_blog", self.with_blog.to_string()),
            ("pg_collkey", self.pg_collkey.to_string()),
            ("pg_unaccent", self.pg_unaccent.to_string()),
            ("require_deb", words(&self.require_deb)),
            ("require_pip", words(&self.require_pip)),
            ("app_pkg", escape(&self.app_pkg)),
            ("error_email", escape(&self.error_email)),
            ("stack", self.stack.to_string()),
            ("public", self.public.to_string()),
        ]
    }

    fn blank() -> Self {
        Self {
            name: String::new(),
            port: 0,
            domain: None,
            test: None,
            production: None,
            workers: 0,
            deploy_duration: 0,
            with_blog: false,
            pg_collkey: false,
            pg_unaccent: false,
            require_deb: Vec::new(),
            require_pip: Vec::new(),
            app_pkg: String::new(),
            error_email: String::new(),
            stack: Stack::Clld,
            public: false,
        }
    }

    fn assign(&mut self, app: &str, field: &str, raw: &str) -> Result<()> {
        let invalid = |reason: String| AppError::InvalidValue {
            app: app.to_string(),
            field: field.to_string(),
            value: raw.to_string(),
            reason,
        };
        let integer = |minimum: u32| -> Result<u32> {
            let value = raw
                .trim()
                .parse::<u32>()
                .map_err(|err| invalid(err.to_string()))?;
            if value < minimum {
                return Err(invalid(format!("must be at least {minimum}")));
            }
            Ok(value)
        };
        let boolean = || parse_bool(raw).ok_or_else(|| invalid("not a boolean".into()));

        match field {
            "name" => self.name = raw.trim().to_string(),
            "port" => {
                self.port = u16::try_from(integer(1)?).map_err(|err| invalid(err.to_string()))?
            }
            "domain" => self.domain = parse_optional(raw),
            "test" => self.test = parse_optional(raw),
            "production" => self.production = parse_optional(raw),
            "workers" => self.workers = integer(1)?,
            "deploy_duration" => self.deploy_duration = integer(0)?,
            "with_blog" => self.with_blog = boolean()?,
            "pg_collkey" => self.pg_collkey = boolean()?,
            "pg_unaccent" => self.pg_unaccent = boolean()?,
            "require_deb" => self.require_deb = parse_words(raw),
            "require_pip" => self.require_pip = parse_words(raw),
            "app_pkg" => self.app_pkg = raw.trim().to_string(),
            "error_email" => self.error_email = raw.trim().to_string(),
            "stack" => self.stack = raw.parse().map_err(|err: AppError| invalid(err.to_string()))?,
            "public" => self.public = boolean()?,
            _ => {
                return Err(AppError::UnknownField {
                    app: app.to_string(),
                    fields: vec![field.to_string()],
                })
            }
        }

        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn test(&self) -> Option<&str> {
        self.test.as_deref()
    }

    pub fn production(&self) -> Option<&str> {
        self.production.as_deref()
    }

    /// Host serving the app in the given environment, if any.
    pub fn host(&self, environment: Environment) -> Option<&str> {
        match environment {
            Environment::Production => self.production(),
            Environment::Test => self.test(),
        }
    }

    pub fn workers(&self) -> u32 {
        self.workers
    }

    /// Expected downtime of a deployment in hours.
    pub fn deploy_duration(&self) -> u32 {
        self.deploy_duration
    }

    pub fn with_blog(&self) -> bool {
        self.with_blog
    }

    pub fn pg_collkey(&self) -> bool {
        self.pg_collkey
    }

    pub fn pg_unaccent(&self) -> bool {
        self.pg_unaccent
    }

    /// Extra Debian packages the app needs.
    pub fn require_deb(&self) -> &[String] {
        &self.require_deb
    }

    /// Extra Python packages the app needs.
    pub fn require_pip(&self) -> &[String] {
        &self.require_pip
    }

    /// Python package spec of the app itself.
    pub fn app_pkg(&self) -> &str {
        &self.app_pkg
    }

    pub fn error_email(&self) -> &str {
        &self.error_email
    }

    pub fn stack(&self) -> Stack {
        self.stack
    }

    /// Whether the production site is reachable without HTTP authentication.
    pub fn public(&self) -> bool {
        self.public
    }

    pub fn home_dir(&self) -> PathBuf {
        app_path(HOME_ROOT, &self.name)
    }

    pub fn www_dir(&self) -> PathBuf {
        self.home_dir().join("www")
    }

    /// Path of the app's configuration file.
    pub fn config(&self) -> PathBuf {
        self.home_dir().join("config.ini")
    }

    pub fn gunicorn_pid(&self) -> PathBuf {
        self.home_dir().join("gunicorn.pid")
    }

    pub fn venv_dir(&self) -> PathBuf {
        app_path(VENVS_ROOT, &self.name)
    }

    pub fn venv_bin(&self) -> PathBuf {
        self.venv_dir().join("bin")
    }

    /// Clone of the app's source repository inside the virtual environment.
    pub fn src_dir(&self) -> PathBuf {
        self.venv_dir().join("src").join(&self.name)
    }

    pub fn download_dir(&self) -> PathBuf {
        self.src_dir().join(&self.name).join("static").join("download")
    }

    pub fn alembic(&self) -> PathBuf {
        self.venv_bin().join("alembic")
    }

    pub fn gunicorn(&self) -> PathBuf {
        self.venv_bin().join("gunicorn_paster")
    }

    pub fn log_dir(&self) -> PathBuf {
        app_path(LOG_ROOT, &self.name)
    }

    pub fn access_log(&self) -> PathBuf {
        self.log_dir().join("access.log")
    }

    pub fn error_log(&self) -> PathBuf {
        self.log_dir().join("error.log")
    }

    pub fn logrotate(&self) -> PathBuf {
        app_path(LOGROTATE_ROOT, &self.name)
    }

    pub fn supervisor(&self) -> PathBuf {
        app_file(SUPERVISOR_ROOT, &self.name, "conf")
    }

    pub fn nginx_default_site(&self) -> PathBuf {
        PathBuf::from(NGINX_DEFAULT_SITE)
    }

    pub fn nginx_site(&self) -> PathBuf {
        app_path(NGINX_SITES_ROOT, &self.name)
    }

    pub fn nginx_location(&self) -> PathBuf {
        app_file(NGINX_LOCATIONS_ROOT, &self.name, "conf")
    }

    pub fn nginx_htpasswd(&self) -> PathBuf {
        app_file(NGINX_LOCATIONS_ROOT, &self.name, "htpasswd")
    }

    pub fn sqlalchemy_url(&self) -> String {
        format!("postgresql://{0}@/{0}", self.name)
    }
}

/// Software stack an app is built on.
///
/// Selects which deployment steps apply, e.g., only `clld` apps get a
/// virtual environment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stack {
    #[default]
    Clld,
    Django,
    Soundcomparisons,
    Static,
}

impl FromStr for Stack {
    type Err = AppError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        match data.trim().to_lowercase().as_str() {
            "clld" => Ok(Self::Clld),
            "django" => Ok(Self::Django),
            "soundcomparisons" => Ok(Self::Soundcomparisons),
            "static" => Ok(Self::Static),
            other => Err(AppError::UnknownStack(other.to_string())),
        }
    }
}

impl Display for Stack {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(match self {
            Self::Clld => "clld",
            Self::Django => "django",
            Self::Soundcomparisons => "soundcomparisons",
            Self::Static => "static",
        })
    }
}

/// Parse boolean token.
///
/// Accepts `1`, `yes`, `true`, `on` and `0`, `no`, `false`, `off` in any
/// letter case.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Some(true),
        "0" | "no" | "false" | "off" => Some(false),
        _ => None,
    }
}

/// Split value into whitespace-delimited words.
pub fn parse_words(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_owned).collect()
}

/// Treat empty values and `None` as absent.
pub fn parse_optional(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("none") {
        return None;
    }

    Some(raw.to_string())
}

/// App record error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppError {
    /// Recognized field not given.
    #[error("app {app:?}: missing field {field:?}")]
    MissingField { app: String, field: &'static str },

    /// Unrecognized fields given.
    #[error("app {app:?}: unknown field(s) {fields:?}")]
    UnknownField { app: String, fields: Vec<String> },

    /// Field value cannot be converted.
    #[error("app {app:?}: invalid value {value:?} for field {field:?}: {reason}")]
    InvalidValue {
        app: String,
        field: String,
        value: String,
        reason: String,
    },

    /// Stack name not supported.
    #[error("unknown stack {0:?}")]
    UnknownStack(String),
}

/// Friendly result alias :3
type Result<T, E = AppError> = std::result::Result<T, E>;
