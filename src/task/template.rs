// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration file templates.
//!
//! All files a deployment writes to a host are rendered from templates
//! bundled into the binary. Rendering is strict: referencing a variable the
//! context does not provide is an error rather than an empty string, so a
//! half-rendered nginx site never reaches a host.

use crate::app::App;

use minijinja::{context, Environment, UndefinedBehavior, Value};

/// Every bundled template, by name.
pub const BUNDLED: &[(&str, &str)] = &[
    ("503.html", include_str!("../../templates/503.html")),
    ("config.ini", include_str!("../../templates/config.ini")),
    ("logrotate.conf", include_str!("../../templates/logrotate.conf")),
    ("nginx-app.conf", include_str!("../../templates/nginx-app.conf")),
    ("nginx-default.conf", include_str!("../../templates/nginx-default.conf")),
    ("supervisor.conf", include_str!("../../templates/supervisor.conf")),
];

/// Bundled template set.
#[derive(Debug)]
pub struct Templates {
    env: Environment<'static>,
}

impl Templates {
    /// Load all bundled templates.
    ///
    /// # Errors
    ///
    /// - Return [`TemplateError::Syntax`] if a bundled template is malformed.
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        for &(name, body) in BUNDLED {
            env.add_template(name, body)
                .map_err(|source| TemplateError::Syntax {
                    source,
                    name: name.to_string(),
                })?;
        }

        Ok(Self { env })
    }

    /// Render template by name with a context.
    ///
    /// # Errors
    ///
    /// - Return [`TemplateError::Render`] if the template does not exist or
    ///   references a variable missing from `vars`.
    pub fn render(&self, name: &str, vars: Value) -> Result<String> {
        self.env
            .get_template(name)
            .and_then(|template| template.render(vars))
            .map_err(|source| TemplateError::Render {
                source,
                name: name.to_string(),
            })
    }
}

/// Template view of an app and its derived paths.
pub fn app_value(app: &App) -> Value {
    context! {
        name => app.name(),
        port => app.port(),
        domain => app.domain().unwrap_or_default(),
        error_email => app.error_email(),
        stack => app.stack().to_string(),
        config => app.config().to_string_lossy(),
        www_dir => app.www_dir().to_string_lossy(),
        venv_dir => app.venv_dir().to_string_lossy(),
        src_dir => app.src_dir().to_string_lossy(),
        log_dir => app.log_dir().to_string_lossy(),
        access_log => app.access_log().to_string_lossy(),
        error_log => app.error_log().to_string_lossy(),
        sqlalchemy_url => app.sqlalchemy_url(),
    }
}

/// Template error types.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// Bundled template cannot be parsed.
    #[error("malformed template {name:?}")]
    Syntax {
        #[source]
        source: minijinja::Error,
        name: String,
    },

    /// Template cannot be rendered.
    #[error("failed to render template {name:?}")]
    Render {
        #[source]
        source: minijinja::Error,
        name: String,
    },
}

/// Friendly result alias :3
pub type Result<T, E = TemplateError> = std::result::Result<T, E>;
