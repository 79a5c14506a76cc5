// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Environment-scoped task dispatch.
//!
//! A __task__ is an operation performed on the host(s) serving one app, like
//! deploying it, stopping it, or putting it behind a cache. Task bodies are
//! plain functions taking a [`TaskContext`] and the [`App`] they operate on.
//! They never look up hosts themselves. Instead, a [`Dispatcher`] resolves
//! the __environment__ the caller asked for into concrete hosts, builds the
//! context, and calls the body.
//!
//! # Environments
//!
//! Every app may be served by a `test` host and a `production` host. The
//! environment decides which one a task targets, and also changes what some
//! tasks do, e.g., production sites get their own nginx site file while test
//! sites share the default site of their host.
//!
//! Some tasks only make sense in production. These are __pinned__, and are
//! dispatched without asking the caller for an environment.
//!
//! # Composition
//!
//! Since task bodies are ordinary functions, one task can run another by
//! calling it with its own context. The inner task runs against the same
//! host and environment without going through dispatch again.
//!
//! # Side Effects
//!
//! Task bodies reach the outside world only through the collaborators held
//! by the context: a [`Remote`] to run commands and upload files, a set of
//! [`Templates`] to render configuration files, and a [`Prompter`] to ask
//! the operator questions. Failures of any collaborator propagate unchanged.
//! Nothing is retried, and steps that already completed stay in place.

pub mod deployment;
pub mod other;
pub mod prompt;
pub mod remote;
pub mod template;
pub mod varnish;

use crate::{
    app::App,
    task::{
        deployment::DeployOptions,
        prompt::{InquirePrompter, Prompter},
        remote::{quote, Remote, SshRemote},
        template::Templates,
    },
};

use std::{
    cell::Cell,
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, info, instrument, warn};

/// Environment a task targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Environment {
    Production,
    Test,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

impl FromStr for Environment {
    type Err = TaskError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        match data {
            "production" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(TaskError::InvalidEnvironment(other.to_string())),
        }
    }
}

impl Display for Environment {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

/// Progress of a single dispatch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Dispatch requested, nothing resolved yet.
    #[default]
    Pending,

    /// Hosts looked up from the app record.
    HostResolved,

    /// Task body running.
    Executing,

    /// Task body returned successfully on every host.
    Completed,

    /// Dispatch or task body failed.
    Failed,
}

/// Execution context of a dispatched task.
///
/// Binds the environment and current host to the collaborators that carry
/// out side effects. Valid only for the duration of one dispatch.
pub struct TaskContext<'a> {
    environment: Environment,
    host: &'a str,
    hosts: &'a [String],
    remote: &'a dyn Remote,
    templates: &'a Templates,
    prompter: &'a dyn Prompter,
}

impl<'a> TaskContext<'a> {
    /// Construct new task context.
    pub fn new(
        environment: Environment,
        host: &'a str,
        hosts: &'a [String],
        remote: &'a dyn Remote,
        templates: &'a Templates,
        prompter: &'a dyn Prompter,
    ) -> Self {
        Self {
            environment,
            host,
            hosts,
            remote,
            templates,
            prompter,
        }
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    pub fn is_test(&self) -> bool {
        self.environment == Environment::Test
    }

    /// Host the task currently runs against.
    pub fn host(&self) -> &str {
        self.host
    }

    /// All hosts of this dispatch.
    pub fn hosts(&self) -> &[String] {
        self.hosts
    }

    pub fn templates(&self) -> &Templates {
        self.templates
    }

    /// Run command on current host as the connecting user.
    pub fn run(&self, command: &str) -> Result<String> {
        Ok(self.remote.run(self.host, command)?)
    }

    /// Run command on current host with root privileges.
    pub fn sudo(&self, command: &str) -> Result<String> {
        Ok(self.remote.sudo(self.host, command, None)?)
    }

    /// Run command on current host as another user.
    pub fn sudo_as(&self, command: &str, user: &str) -> Result<String> {
        Ok(self.remote.sudo(self.host, command, Some(user))?)
    }

    /// Check if path exists on current host.
    pub fn exists(&self, path: impl AsRef<Path>) -> Result<bool> {
        Ok(self.remote.exists(self.host, path.as_ref())?)
    }

    /// Write file on current host with root privileges.
    pub fn put(&self, dest: impl AsRef<Path>, contents: &[u8], mode: Option<&str>) -> Result<()> {
        Ok(self.remote.put(self.host, dest.as_ref(), contents, mode)?)
    }

    /// Copy local file to current host.
    pub fn upload(&self, source: &Path, dest: impl AsRef<Path>) -> Result<()> {
        Ok(self.remote.upload(self.host, source, dest.as_ref())?)
    }

    /// Remove file or directory on current host.
    pub fn remove(&self, path: impl AsRef<Path>, recursive: bool) -> Result<()> {
        Ok(self.remote.remove(self.host, path.as_ref(), recursive)?)
    }

    /// Render bundled template and write result to current host.
    pub fn upload_template(
        &self,
        name: &str,
        dest: impl AsRef<Path>,
        vars: minijinja::Value,
        mode: Option<&str>,
    ) -> Result<()> {
        let rendered = self.templates.render(name, vars)?;
        info!("[{}] upload {name} to {:?}", self.host, dest.as_ref().display());
        self.put(dest, rendered.as_bytes(), mode)
    }

    /// Make sure Debian packages are installed on current host.
    pub fn ensure_packages(&self, names: &[impl AsRef<str>]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }

        let names = names
            .iter()
            .map(|name| quote(name.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        self.sudo(&format!(
            "DEBIAN_FRONTEND=noninteractive apt-get install -y --no-install-recommends {}",
            names.join(" ")
        ))?;

        Ok(())
    }

    /// Make sure directory exists on current host.
    pub fn ensure_directory(&self, path: impl AsRef<Path>, mode: Option<&str>) -> Result<()> {
        let path = quote(&path.as_ref().to_string_lossy())?;
        self.sudo(&format!("mkdir -p {path}"))?;
        if let Some(mode) = mode {
            self.sudo(&format!("chmod {} {path}", quote(mode)?))?;
        }

        Ok(())
    }

    /// Reload system service on current host.
    pub fn reload_service(&self, name: &str) -> Result<()> {
        self.sudo(&format!("systemctl reload {}", quote(name)?))?;
        Ok(())
    }

    /// Restart system service on current host.
    pub fn restart_service(&self, name: &str) -> Result<()> {
        self.sudo(&format!("systemctl restart {}", quote(name)?))?;
        Ok(())
    }

    /// Make supervisor pick up changed program configurations.
    pub fn supervisor_update(&self) -> Result<()> {
        self.sudo("supervisorctl update")?;
        Ok(())
    }

    /// Check if system user exists on current host.
    pub fn user_exists(&self, name: &str) -> Result<bool> {
        let output = self.run(&format!("getent passwd {} || true", quote(name)?))?;
        Ok(!output.trim().is_empty())
    }

    /// Ask the operator a yes/no question.
    pub fn confirm(&self, message: &str, default: bool) -> Result<bool> {
        Ok(self.prompter.confirm(message, default)?)
    }

    /// Ask the operator for a secret.
    pub fn password(&self, message: &str) -> Result<String> {
        Ok(self.prompter.password(message)?)
    }

    /// Ask the operator for free text.
    pub fn text(&self, message: &str, default: &str) -> Result<String> {
        Ok(self.prompter.text(message, default)?)
    }
}

/// Task dispatcher bound to one app.
///
/// Building a dispatcher selects the app every dispatched task operates on.
/// Hosts come from the app record unless overridden through
/// [`Dispatcher::with_hosts`].
pub struct Dispatcher<'a, R = SshRemote, P = InquirePrompter>
where
    R: Remote,
    P: Prompter,
{
    app: &'a App,
    remote: R,
    templates: Templates,
    prompter: P,
    hosts: Option<Vec<String>>,
    state: Cell<TaskState>,
}

impl<'a, R, P> Dispatcher<'a, R, P>
where
    R: Remote,
    P: Prompter,
{
    /// Construct new dispatcher for an app.
    pub fn new(app: &'a App, remote: R, templates: Templates, prompter: P) -> Self {
        Self {
            app,
            remote,
            templates,
            prompter,
            hosts: None,
            state: Cell::new(TaskState::Pending),
        }
    }

    /// Override host resolution with a fixed host list.
    ///
    /// An empty list leaves host resolution in place.
    pub fn with_hosts(mut self, hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let hosts = hosts.into_iter().map(Into::into).collect::<Vec<_>>();
        self.hosts = (!hosts.is_empty()).then_some(hosts);
        self
    }

    pub fn app(&self) -> &App {
        self.app
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// State reached by the most recent dispatch.
    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    /// Dispatch operation against the environment named by a token.
    ///
    /// # Errors
    ///
    /// - Return [`TaskError::InvalidEnvironment`] if the token is neither
    ///   `production` nor `test`. No collaborator is touched in this case.
    /// - Return any error of [`Dispatcher::dispatch_in`].
    pub fn dispatch<F>(&self, environment: &str, op: F) -> Result<()>
    where
        F: FnMut(&TaskContext<'_>, &App) -> Result<()>,
    {
        self.state.set(TaskState::Pending);
        let environment = environment.parse::<Environment>().inspect_err(|_| {
            self.state.set(TaskState::Failed);
        })?;

        self.dispatch_in(environment, op)
    }

    /// Dispatch operation against an environment.
    ///
    /// Runs the operation once per target host, serially, in host order.
    /// Without a host override there is exactly one target host.
    ///
    /// # Errors
    ///
    /// - Return [`TaskError::MissingHost`] if the app has no host in the
    ///   environment and no override is set.
    /// - Return the first error of the operation unchanged.
    #[instrument(skip(self, op), fields(app = self.app.name()), level = "debug")]
    pub fn dispatch_in<F>(&self, environment: Environment, mut op: F) -> Result<()>
    where
        F: FnMut(&TaskContext<'_>, &App) -> Result<()>,
    {
        self.state.set(TaskState::Pending);
        let result = self.resolve_hosts(environment).and_then(|hosts| {
            self.state.set(TaskState::Executing);
            for host in &hosts {
                info!("[{host}] {} ({environment})", self.app.name());
                let ctx = TaskContext::new(
                    environment,
                    host,
                    &hosts,
                    &self.remote,
                    &self.templates,
                    &self.prompter,
                );
                op(&ctx, self.app)?;
            }
            Ok(())
        });

        self.state.set(match result {
            Ok(()) => TaskState::Completed,
            Err(_) => TaskState::Failed,
        });
        debug!("dispatch finished in state {:?}", self.state.get());

        result
    }

    /// Run a task, honoring its pinned environment.
    ///
    /// # Errors
    ///
    /// - Return [`TaskError::MissingEnvironment`] if the task is not pinned
    ///   and no environment was given.
    /// - Return any error of [`Dispatcher::dispatch`].
    pub fn run_task(&self, environment: Option<&str>, task: &Task) -> Result<()> {
        match (task.pinned(), environment) {
            (Some(pinned), given) => {
                if let Some(given) = given.filter(|given| *given != pinned.as_str()) {
                    warn!("task {} always runs in {pinned}, ignoring {given}", task.name());
                }
                self.dispatch_in(pinned, |ctx, app| task.run(ctx, app))
            }
            (None, Some(environment)) => self.dispatch(environment, |ctx, app| task.run(ctx, app)),
            (None, None) => Err(TaskError::MissingEnvironment(task.name())),
        }
    }

    fn resolve_hosts(&self, environment: Environment) -> Result<Vec<String>> {
        if let Some(hosts) = &self.hosts {
            debug!("host override in place: {hosts:?}");
            return Ok(hosts.clone());
        }

        let host = self
            .app
            .host(environment)
            .ok_or_else(|| TaskError::MissingHost {
                app: self.app.name().to_string(),
                environment,
            })?;
        self.state.set(TaskState::HostResolved);

        Ok(vec![host.to_string()])
    }
}

/// Every task that can be dispatched by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    Deploy(DeployOptions),
    Start,
    Stop { maintenance_hours: Option<u32> },
    Uninstall,
    Cache,
    Uncache,
    RunScript { script: String, args: Vec<String> },
    CreateDownloads,
    CopyDownloads { local_dir: PathBuf, pattern: String },
    CopyRdfdump { local_dir: PathBuf },
    PipFreeze { target_dir: PathBuf },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Deploy(_) => "deploy",
            Self::Start => "start",
            Self::Stop { .. } => "stop",
            Self::Uninstall => "uninstall",
            Self::Cache => "cache",
            Self::Uncache => "uncache",
            Self::RunScript { .. } => "run-script",
            Self::CreateDownloads => "create-downloads",
            Self::CopyDownloads { .. } => "copy-downloads",
            Self::CopyRdfdump { .. } => "copy-rdfdump",
            Self::PipFreeze { .. } => "pip-freeze",
        }
    }

    /// Environment the task is fixed to, if any.
    pub fn pinned(&self) -> Option<Environment> {
        match self {
            Self::Cache | Self::Uncache | Self::PipFreeze { .. } => Some(Environment::Production),
            _ => None,
        }
    }

    /// Run task body directly against a context.
    pub fn run(&self, ctx: &TaskContext<'_>, app: &App) -> Result<()> {
        match self {
            Self::Deploy(opts) => deployment::deploy(ctx, app, opts),
            Self::Start => deployment::start(ctx, app),
            Self::Stop { maintenance_hours } => deployment::stop(ctx, app, *maintenance_hours),
            Self::Uninstall => deployment::uninstall(ctx, app),
            Self::Cache => varnish::cache(ctx, app),
            Self::Uncache => varnish::uncache(ctx, app),
            Self::RunScript { script, args } => other::run_script(ctx, app, script, args),
            Self::CreateDownloads => other::create_downloads(ctx, app),
            Self::CopyDownloads { local_dir, pattern } => {
                other::copy_downloads(ctx, app, local_dir, pattern)
            }
            Self::CopyRdfdump { local_dir } => other::copy_rdfdump(ctx, app, local_dir),
            Self::PipFreeze { target_dir } => other::pip_freeze(ctx, app, target_dir),
        }
    }
}

/// Task dispatch and execution error types.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Environment token is neither `production` nor `test`.
    #[error("invalid environment {0:?}, expected \"production\" or \"test\"")]
    InvalidEnvironment(String),

    /// Task needs an environment but none was given.
    #[error("task {0} needs an environment")]
    MissingEnvironment(&'static str),

    /// App has no host for the requested environment.
    #[error("app {app:?} has no {environment} host")]
    MissingHost {
        app: String,
        environment: Environment,
    },

    /// Remote host runs an unsupported distribution or release.
    #[error("unsupported platform: {distribution} {codename}")]
    UnsupportedPlatform {
        distribution: String,
        codename: String,
    },

    /// App did not answer its health check after deployment.
    #[error("app {app:?} failed health check: {response:?}")]
    HealthCheck { app: String, response: String },

    /// Maintenance window ends outside the representable calendar.
    #[error("maintenance window of {hours} hour(s) is too long")]
    InvalidDuration { hours: u32 },

    /// Blog integration requested without a blog password.
    #[error("app {app:?} needs a blog password")]
    BlogPassword { app: String },

    /// Local file operation fails.
    #[error("failed to access local path {:?}", path.display())]
    Local {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Local file pattern is malformed.
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    /// App record cannot be derived.
    #[error(transparent)]
    App(#[from] crate::app::AppError),

    /// Remote command or upload fails.
    #[error(transparent)]
    Remote(#[from] crate::task::remote::RemoteError),

    /// Template rendering fails.
    #[error(transparent)]
    Template(#[from] crate::task::template::TemplateError),

    /// Operator prompt fails.
    #[error(transparent)]
    Prompt(#[from] crate::task::prompt::PromptError),
}

/// Friendly result alias :3
pub type Result<T, E = TaskError> = std::result::Result<T, E>;
