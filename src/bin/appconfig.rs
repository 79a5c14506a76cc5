// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use appconfig::{
    path::{default_config_file, expand},
    task::{
        deployment::{DeployOptions, DEFAULT_MAINTENANCE_HOURS},
        prompt::InquirePrompter,
        remote::SshRemote,
        template::Templates,
    },
    Dispatcher, Registry, SortOrder, Task,
};

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use reqwest::StatusCode;
use std::{path::PathBuf, process::exit};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  appconfig [options] <command>\n  appconfig [options] <task> <app> [<environment>]",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to apps file.
    #[arg(long, global = true, env = "APPCONFIG_FILE", value_name = "file")]
    pub config: Option<PathBuf>,

    /// Run tasks against these hosts instead of the app's own.
    #[arg(short = 'H', long, global = true, value_delimiter = ',', value_name = "host")]
    pub hosts: Vec<String>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let registry = Registry::from_file(self.config_file()?, true)?;
        match self.command {
            Command::Ls(opts) => run_ls(&registry, opts),
            Command::TestError(opts) => run_test_error(&registry, opts).await,
            Command::Deploy(opts) => {
                let task = Task::Deploy(DeployOptions {
                    with_blog: opts.with_blog.then_some(true).or(opts.without_blog.then_some(false)),
                    with_alembic: opts.with_alembic,
                    ..DeployOptions::default()
                });
                run_task(&registry, &self.hosts, &opts.target, task)
            }
            Command::Start(target) => run_task(&registry, &self.hosts, &target, Task::Start),
            Command::Stop(opts) => {
                let task = Task::Stop {
                    maintenance_hours: (!opts.no_maintenance).then_some(opts.maintenance_hours),
                };
                run_task(&registry, &self.hosts, &opts.target, task)
            }
            Command::Uninstall(target) => {
                run_task(&registry, &self.hosts, &target, Task::Uninstall)
            }
            Command::RunScript(opts) => {
                let task = Task::RunScript {
                    script: opts.script,
                    args: opts.args,
                };
                run_task(&registry, &self.hosts, &opts.target, task)
            }
            Command::CreateDownloads(target) => {
                run_task(&registry, &self.hosts, &target, Task::CreateDownloads)
            }
            Command::CopyDownloads(opts) => {
                let local_dir = download_dir(&registry, &opts.target.app, opts.from)?;
                let task = Task::CopyDownloads {
                    local_dir,
                    pattern: opts.pattern,
                };
                run_task(&registry, &self.hosts, &opts.target, task)
            }
            Command::CopyRdfdump(opts) => {
                let local_dir = download_dir(&registry, &opts.target.app, opts.from)?;
                run_task(&registry, &self.hosts, &opts.target, Task::CopyRdfdump { local_dir })
            }
            Command::Cache(opts) => run_pinned(&registry, &self.hosts, &opts.app, Task::Cache),
            Command::Uncache(opts) => run_pinned(&registry, &self.hosts, &opts.app, Task::Uncache),
            Command::PipFreeze(opts) => {
                let target_dir = registry.source_dir(registry.get(&opts.app)?);
                run_pinned(&registry, &self.hosts, &opts.app, Task::PipFreeze { target_dir })
            }
        }
    }

    fn config_file(&self) -> Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(expand(path)),
            None => Ok(default_config_file()?),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// List registered apps.
    #[command(override_usage = "appconfig ls [options]")]
    Ls(LsOptions),

    /// Make an app raise an error to check error reporting.
    #[command(override_usage = "appconfig test-error <app>")]
    TestError(AppOptions),

    /// Deploy app.
    #[command(override_usage = "appconfig deploy [options] <app> <environment>")]
    Deploy(DeployArgs),

    /// Start app.
    #[command(override_usage = "appconfig start <app> <environment>")]
    Start(TargetOptions),

    /// Pause app, showing a maintenance page.
    #[command(override_usage = "appconfig stop [options] <app> <environment>")]
    Stop(StopOptions),

    /// Remove app from its host.
    #[command(override_usage = "appconfig uninstall <app> <environment>")]
    Uninstall(TargetOptions),

    /// Run a maintenance script of the app.
    #[command(override_usage = "appconfig run-script <app> <environment> <script> [<args>]...")]
    RunScript(RunScriptOptions),

    /// Create all configured downloads of the app.
    #[command(override_usage = "appconfig create-downloads <app> <environment>")]
    CreateDownloads(TargetOptions),

    /// Copy local download files to the app.
    #[command(override_usage = "appconfig copy-downloads [options] <app> <environment>")]
    CopyDownloads(CopyDownloadsOptions),

    /// Copy local RDF dumps to the app.
    #[command(override_usage = "appconfig copy-rdfdump [options] <app> <environment>")]
    CopyRdfdump(CopyRdfdumpOptions),

    /// Put production app behind varnish.
    #[command(override_usage = "appconfig cache <app>")]
    Cache(AppOptions),

    /// Route production app past varnish.
    #[command(override_usage = "appconfig uncache <app>")]
    Uncache(AppOptions),

    /// Write installed versions of production app to requirements.txt.
    #[command(override_usage = "appconfig pip-freeze <app>")]
    PipFreeze(AppOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct LsOptions {
    /// Sort by port instead of server.
    #[arg(short, long)]
    pub port: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct AppOptions {
    /// Name of app.
    #[arg(required = true, value_name = "app")]
    pub app: String,
}

#[derive(Args, Clone, Debug)]
struct TargetOptions {
    /// Name of app.
    #[arg(required = true, value_name = "app")]
    pub app: String,

    /// Environment to run in, "production" or "test".
    #[arg(required = true, value_name = "environment")]
    pub environment: String,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct DeployArgs {
    #[command(flatten)]
    pub target: TargetOptions,

    /// Configure blog integration.
    #[arg(long, conflicts_with = "without_blog")]
    pub with_blog: bool,

    /// Skip blog integration.
    #[arg(long)]
    pub without_blog: bool,

    /// Upgrade database without asking.
    #[arg(long)]
    pub with_alembic: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct StopOptions {
    #[command(flatten)]
    pub target: TargetOptions,

    /// Hours until the app is expected back.
    #[arg(long, value_name = "hours", default_value_t = DEFAULT_MAINTENANCE_HOURS)]
    pub maintenance_hours: u32,

    /// Pause without maintenance page.
    #[arg(long, conflicts_with = "maintenance_hours")]
    pub no_maintenance: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RunScriptOptions {
    #[command(flatten)]
    pub target: TargetOptions,

    /// Name of script without extension.
    #[arg(required = true, value_name = "script")]
    pub script: String,

    /// Arguments passed to the script.
    #[arg(value_name = "args", trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct CopyDownloadsOptions {
    #[command(flatten)]
    pub target: TargetOptions,

    /// Glob pattern of files to copy.
    #[arg(short, long, value_name = "glob", default_value = "*")]
    pub pattern: String,

    /// Local download directory.
    #[arg(short, long, value_name = "path")]
    pub from: Option<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct CopyRdfdumpOptions {
    #[command(flatten)]
    pub target: TargetOptions,

    /// Local download directory.
    #[arg(short, long, value_name = "path")]
    pub from: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    Cli::parse().run().await
}

fn run_ls(registry: &Registry, opts: LsOptions) -> Result<()> {
    let order = if opts.port {
        SortOrder::Port
    } else {
        SortOrder::Server
    };
    print!("{}", registry.table(order));

    Ok(())
}

async fn run_test_error(registry: &Registry, opts: AppOptions) -> Result<()> {
    let app = registry.get(&opts.app)?;
    let Some(domain) = app.domain() else {
        bail!("app {:?} has no domain", app.name());
    };

    let url = format!("https://{domain}/_raise");
    info!("request {url}");
    let status = reqwest::get(&url).await?.status();
    if status != StatusCode::INTERNAL_SERVER_ERROR {
        bail!("expected {url} to answer with 500, got {status}");
    }

    info!("{url} answered with {status}");
    Ok(())
}

fn run_task(registry: &Registry, hosts: &[String], target: &TargetOptions, task: Task) -> Result<()> {
    let app = registry.get(&target.app)?;
    let dispatcher = Dispatcher::new(app, SshRemote::default(), Templates::new()?, InquirePrompter)
        .with_hosts(hosts.iter().cloned());
    dispatcher.run_task(Some(&target.environment), &task)?;

    Ok(())
}

fn run_pinned(registry: &Registry, hosts: &[String], app: &str, task: Task) -> Result<()> {
    let app = registry.get(app)?;
    let dispatcher = Dispatcher::new(app, SshRemote::default(), Templates::new()?, InquirePrompter)
        .with_hosts(hosts.iter().cloned());
    dispatcher.run_task(None, &task)?;

    Ok(())
}

fn download_dir(registry: &Registry, app: &str, from: Option<PathBuf>) -> Result<PathBuf> {
    match from {
        Some(path) => Ok(expand(path)),
        None => {
            let app = registry.get(app)?;
            Ok(registry
                .source_dir(app)
                .join(app.name())
                .join("static")
                .join("download"))
        }
    }
}
