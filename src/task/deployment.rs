// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Deployment tasks.
//!
//! Install, start, pause, and remove an app on its host. An app runs as a
//! gunicorn program under supervisor, behind nginx, backed by a PostgreSQL
//! database of the same name as the app.
//!
//! Every step is idempotent as far as the host tools allow, so a failed
//! deployment can simply be dispatched again.

use crate::{
    app::{parse_words, App, Stack},
    task::{
        remote::quote,
        template::app_value,
        Result, TaskContext, TaskError,
    },
};

use chrono::{Duration as Hours, Local};
use minijinja::{context, Value};
use serde::Deserialize;
use std::{thread, time::Duration};
use tracing::{debug, info, instrument, warn};

/// Ubuntu releases apps can be deployed to.
pub const SUPPORTED_RELEASES: &[&str] = &["xenial", "bionic", "focal"];

/// Packages every app host needs regardless of the app.
pub const BASE_PACKAGES: &[&str] = &[
    "curl",
    "git",
    "apache2-utils",
    "python3-dev",
    "virtualenv",
    "supervisor",
];

/// Host names of local virtual machines.
///
/// Production sites on these hosts must not claim `localhost` in the
/// default nginx site.
pub const LOCAL_HOSTNAMES: &[&str] = &["vbox", "xenial"];

/// Time given to gunicorn to come up before the health check.
pub const HEALTH_CHECK_DELAY: Duration = Duration::from_secs(5);

/// Hours announced by the maintenance page unless told otherwise.
pub const DEFAULT_MAINTENANCE_HOURS: u32 = 1;

const MAX_TEST_WORKERS: u32 = 3;

/// Switches of the deploy task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOptions {
    /// Configure blog integration. Defaults to the app's own setting.
    pub with_blog: Option<bool>,

    /// Run database migrations without asking.
    pub with_alembic: bool,

    /// Wait before the health check.
    pub health_check_delay: Duration,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            with_blog: None,
            with_alembic: false,
            health_check_delay: HEALTH_CHECK_DELAY,
        }
    }
}

/// Start the app by making supervisor run it.
#[instrument(skip(ctx, app), fields(app = app.name()), level = "debug")]
pub fn start(ctx: &TaskContext<'_>, app: &App) -> Result<()> {
    require_supervisor(ctx, app, false)?;
    ctx.supervisor_update()?;
    ctx.reload_service("nginx")
}

/// Pause the app.
///
/// With `maintenance_hours`, visitors get a maintenance page announcing the
/// service will be back that many hours from now.
///
/// # Errors
///
/// - Return [`TaskError::InvalidDuration`] if the announced time cannot be
///   represented. Nothing is touched on the host in this case.
#[instrument(skip(ctx, app), fields(app = app.name()), level = "debug")]
pub fn stop(ctx: &TaskContext<'_>, app: &App, maintenance_hours: Option<u32>) -> Result<()> {
    if let Some(hours) = maintenance_hours {
        let timestamp = maintenance_until(hours)?;
        ctx.ensure_directory(app.www_dir(), None)?;
        ctx.upload_template(
            "503.html",
            app.www_dir().join("503.html"),
            context! {
                app_name => app.name(),
                timestamp => timestamp,
            },
            None,
        )?;
    }

    require_supervisor(ctx, app, true)?;
    ctx.supervisor_update()?;
    ctx.reload_service("nginx")
}

/// Remove the app with its database and system user.
///
/// Visitors get the maintenance page while the app is torn down.
#[instrument(skip(ctx, app), fields(app = app.name()), level = "debug")]
pub fn uninstall(ctx: &TaskContext<'_>, app: &App) -> Result<()> {
    for path in [app.nginx_location(), app.nginx_site(), app.venv_dir()] {
        if ctx.exists(&path)? {
            ctx.remove(&path, true)?;
        }
    }

    stop(ctx, app, Some(DEFAULT_MAINTENANCE_HOURS))?;
    if ctx.user_exists(app.name())? {
        let name = quote(app.name())?;
        ctx.sudo_as(&format!("dropdb --if-exists {name}"), "postgres")?;
        ctx.sudo(&format!("userdel -rf {name}"))?;
    }

    if ctx.exists(app.supervisor())? {
        ctx.remove(app.supervisor(), true)?;
    }

    ctx.supervisor_update()?;
    ctx.reload_service("nginx")
}

/// Deploy the app.
///
/// # Errors
///
/// - Return [`TaskError::UnsupportedPlatform`] if the host does not run a
///   supported Ubuntu release.
/// - Return [`TaskError::HealthCheck`] if the app does not answer its ping
///   after starting.
#[instrument(skip(ctx, app), fields(app = app.name()), level = "debug")]
pub fn deploy(ctx: &TaskContext<'_>, app: &App, opts: &DeployOptions) -> Result<()> {
    let codename = require_platform(ctx)?;
    info!("[{}] deploy {} to ubuntu {codename}", ctx.host(), app.name());

    let mut packages = BASE_PACKAGES.iter().map(ToString::to_string).collect::<Vec<_>>();
    packages.extend(app.require_deb().iter().cloned());
    ctx.ensure_packages(&packages)?;

    require_user(ctx, app)?;
    ctx.ensure_directory(app.www_dir(), None)?;
    ctx.ensure_directory(app.www_dir().join("files"), None)?;
    require_logging(ctx, app)?;

    let workers = if ctx.is_test() {
        app.workers().min(MAX_TEST_WORKERS)
    } else {
        app.workers()
    };
    let with_blog = opts.with_blog.unwrap_or(app.with_blog());
    let vars = template_context(ctx, app, workers, with_blog)?;

    if app.stack() == Stack::Clld {
        require_venv(ctx, app)?;
    }

    require_nginx(ctx, app, &vars)?;

    if app.stack() == Stack::Soundcomparisons {
        return ctx.reload_service("nginx");
    }

    require_postgres(ctx, app)?;
    require_config(ctx, app, &vars)?;

    // INVARIANT: Running gunicorn reloads gracefully on HUP.
    let pid_file = quote(&app.gunicorn_pid().to_string_lossy())?;
    ctx.sudo(&format!(
        "( [ -f {pid_file} ] && kill -0 $(cat {pid_file}) 2> /dev/null \
         && kill -HUP $(cat {pid_file}) ) || echo no reload"
    ))?;

    if ctx.exists(app.src_dir().join("alembic.ini"))?
        && (opts.with_alembic || ctx.confirm("Upgrade database?", false)?)
    {
        stop(ctx, app, Some(app.deploy_duration()))?;
        alembic_upgrade_head(ctx, app)?;
    }

    start(ctx, app)?;

    thread::sleep(opts.health_check_delay);
    health_check(ctx, app)
}

/// Variables shared by all templates of a deployment.
///
/// # Errors
///
/// - Return [`TaskError::BlogPassword`] if blog integration is requested
///   but no blog password is given.
pub fn template_context(
    ctx: &TaskContext<'_>,
    app: &App,
    workers: u32,
    with_blog: bool,
) -> Result<Value> {
    let (mut bloghost, mut bloguser, mut blogpassword) = (String::new(), String::new(), String::new());
    if with_blog {
        let domain = app.domain().unwrap_or_default();
        bloghost = blog_setting(ctx, app, "host", &format!("blog.{domain}"))?;
        bloguser = blog_setting(ctx, app, "user", app.name())?;
        blogpassword = blog_setting(ctx, app, "password", "")?;
        if blogpassword.is_empty() {
            return Err(TaskError::BlogPassword {
                app: app.name().to_string(),
            });
        }
    }

    Ok(context! {
        SITE => ctx.is_production(),
        TEST => ctx.is_test(),
        VBOX_LOCALHOST => LOCAL_HOSTNAMES.contains(&ctx.host()),
        app => app_value(app),
        env => context! {
            host => ctx.host(),
            environment => ctx.environment().as_str(),
        },
        workers => workers,
        auth => "",
        bloghost => bloghost,
        bloguser => bloguser,
        blogpassword => blogpassword,
    })
}

/// Set up HTTP basic authentication for the app.
///
/// Returns the nginx snippet guarding the whole site, empty when the site is
/// public, and the snippet guarding the admin area.
pub fn http_auth(ctx: &TaskContext<'_>, app: &App) -> Result<(String, String)> {
    let user = app.name();
    let userpass = if app.public() && ctx.is_production() {
        String::new()
    } else {
        ctx.password(&format!("HTTP Basic Auth password for user {user}:"))?
    };

    let mut admin = String::new();
    while admin.is_empty() {
        admin = ctx.password("HTTP Basic Auth password for user admin:")?;
    }

    let htpasswd = app.nginx_htpasswd();
    if let Some(parent) = htpasswd.parent() {
        ctx.ensure_directory(parent, None)?;
    }

    let file = quote(&htpasswd.to_string_lossy())?;
    let pairs = [(user, userpass.as_str()), ("admin", admin.as_str())];
    for (index, (name, password)) in pairs
        .into_iter()
        .filter(|(_, password)| !password.is_empty())
        .enumerate()
    {
        // INVARIANT: First entry recreates the file.
        let flags = if index == 0 { "-bdc" } else { "-bd" };
        ctx.sudo(&format!(
            "htpasswd {flags} {file} {} {}",
            quote(name)?,
            quote(password)?
        ))?;
    }

    let auth = format!(
        "proxy_set_header Authorization $http_authorization;\n\
         proxy_pass_header Authorization;\n\
         auth_basic \"{user}\";\n\
         auth_basic_user_file {};\n",
        htpasswd.display()
    );
    let site_auth = if userpass.is_empty() {
        String::new()
    } else {
        auth.clone()
    };

    Ok((site_auth, auth))
}

/// Check the app answers its ping endpoint.
pub fn health_check(ctx: &TaskContext<'_>, app: &App) -> Result<()> {
    let response = ctx.run(&format!("curl -s http://localhost:{}/_ping", app.port()))?;
    if !is_ping_ok(&response) {
        return Err(TaskError::HealthCheck {
            app: app.name().to_string(),
            response,
        });
    }

    info!("[{}] {} is up", ctx.host(), app.name());
    Ok(())
}

#[derive(Deserialize)]
struct Ping {
    status: String,
}

fn is_ping_ok(response: &str) -> bool {
    serde_json::from_str::<Ping>(response)
        .map(|ping| ping.status == "ok")
        .unwrap_or(false)
}

fn maintenance_until(hours: u32) -> Result<String> {
    let until = Hours::try_hours(i64::from(hours))
        .and_then(|delta| Local::now().checked_add_signed(delta))
        .ok_or(TaskError::InvalidDuration { hours })?;

    Ok(until.format("%Y-%m-%d %H:%M %Z").to_string())
}

fn blog_setting(ctx: &TaskContext<'_>, app: &App, key: &str, default: &str) -> Result<String> {
    let var = format!("{}_BLOG{}", app.name(), key).to_uppercase();
    match std::env::var(&var) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => ctx.text(&format!("Blog {key}:"), default),
    }
}

fn require_platform(ctx: &TaskContext<'_>) -> Result<String> {
    let distribution = ctx.run("lsb_release --id --short")?;
    let codename = ctx.run("lsb_release --codename --short")?;
    let (distribution, codename) = (distribution.trim(), codename.trim());
    if distribution != "Ubuntu" || !SUPPORTED_RELEASES.contains(&codename) {
        return Err(TaskError::UnsupportedPlatform {
            distribution: distribution.to_string(),
            codename: codename.to_string(),
        });
    }

    Ok(codename.to_string())
}

fn require_user(ctx: &TaskContext<'_>, app: &App) -> Result<()> {
    if ctx.user_exists(app.name())? {
        debug!("user {} already exists", app.name());
        return Ok(());
    }

    ctx.sudo(&format!(
        "useradd --create-home --shell /bin/bash {}",
        quote(app.name())?
    ))?;
    Ok(())
}

fn require_supervisor(ctx: &TaskContext<'_>, app: &App, pause: bool) -> Result<()> {
    ctx.upload_template(
        "supervisor.conf",
        app.supervisor(),
        context! {
            name => app.name(),
            gunicorn => app.gunicorn().to_string_lossy(),
            config => app.config().to_string_lossy(),
            user => app.name(),
            group => app.name(),
            pid_file => app.gunicorn_pid().to_string_lossy(),
            error_log => app.error_log().to_string_lossy(),
            PAUSE => pause,
        },
        Some("644"),
    )
}

fn require_logging(ctx: &TaskContext<'_>, app: &App) -> Result<()> {
    ctx.ensure_directory(app.log_dir(), None)?;
    if ctx.is_production() {
        ctx.upload_template(
            "logrotate.conf",
            app.logrotate(),
            context! {
                access_log => app.access_log().to_string_lossy(),
                error_log => app.error_log().to_string_lossy(),
            },
            None,
        )?;
    }

    Ok(())
}

fn require_venv(ctx: &TaskContext<'_>, app: &App) -> Result<()> {
    let venv_dir = app.venv_dir();
    let venv_bin = app.venv_bin();
    ctx.ensure_directory(&venv_dir, None)?;
    if !ctx.exists(venv_bin.join("python"))? {
        ctx.sudo(&format!(
            "virtualenv -q -p python3 {}",
            quote(&venv_dir.to_string_lossy())?
        ))?;
    }

    let packages = parse_words(app.app_pkg())
        .iter()
        .chain(app.require_pip())
        .map(|package| quote(package))
        .collect::<Result<Vec<_>, _>>()?;
    let bin = |name: &str| quote(&venv_bin.join(name).to_string_lossy());
    ctx.sudo(&format!("{} install -q {}", bin("pip")?, packages.join(" ")))?;
    ctx.sudo(&format!(
        "{} -m {}.assets build",
        bin("webassets")?,
        quote(app.name())?
    ))?;

    Ok(())
}

fn require_nginx(ctx: &TaskContext<'_>, app: &App, vars: &Value) -> Result<()> {
    ctx.ensure_packages(&["nginx"])?;
    let (auth, admin_auth) = http_auth(ctx, app)?;
    let clld_dir = match app.stack() {
        Stack::Clld => clld_dir(ctx, app)?,
        _ => String::new(),
    };
    let vars = context! {
        clld_dir => clld_dir,
        auth => auth,
        admin_auth => admin_auth,
        ..vars.clone()
    };

    if ctx.is_production() {
        ctx.upload_template("nginx-app.conf", app.nginx_site(), vars, None)?;
        if LOCAL_HOSTNAMES.contains(&ctx.host()) {
            ctx.sudo(&format!(
                "sed -i 's/^\\s*server_name localhost;/#server_name localhost;/' {}",
                quote(&app.nginx_default_site().to_string_lossy())?
            ))?;
        }
    } else {
        if let Some(parent) = app.nginx_location().parent() {
            ctx.ensure_directory(parent, None)?;
        }
        ctx.upload_template("nginx-app.conf", app.nginx_location(), vars, None)?;
        ctx.upload_template(
            "nginx-default.conf",
            app.nginx_default_site(),
            context! {},
            None,
        )?;
    }

    Ok(())
}

fn clld_dir(ctx: &TaskContext<'_>, app: &App) -> Result<String> {
    let python = quote(&app.venv_bin().join("python").to_string_lossy())?;
    let stdout = ctx.sudo(&format!(
        "{python} -c 'import clld, os; print(os.path.dirname(clld.__file__))'"
    ))?;

    Ok(stdout.split_whitespace().last().unwrap_or_default().to_string())
}

const COLLKEY_SQL: &str = "CREATE OR REPLACE FUNCTION collkey (text, text, bool, int4, bool) \
    RETURNS bytea LANGUAGE 'c' IMMUTABLE STRICT \
    AS '$libdir/collkey_icu.so', 'pgsqlext_collkey';";

fn require_postgres(ctx: &TaskContext<'_>, app: &App) -> Result<()> {
    ctx.ensure_packages(&["postgresql"])?;
    let name = app.name();
    let psql = |sql: &str| -> Result<String> {
        ctx.sudo_as(&format!("psql -tAc {}", quote(sql)?), "postgres")
    };

    if psql(&format!("SELECT 1 FROM pg_roles WHERE rolname='{name}'"))?.trim() != "1" {
        ctx.sudo_as(
            &format!("createuser --no-superuser --no-createdb --no-createrole {}", quote(name)?),
            "postgres",
        )?;
        psql(&format!("ALTER USER \"{name}\" WITH PASSWORD '{name}'"))?;
    }

    if psql(&format!("SELECT 1 FROM pg_database WHERE datname='{name}'"))?.trim() != "1" {
        ctx.sudo_as(&format!("createdb -O {0} {0}", quote(name)?), "postgres")?;
    }

    let in_database = |sql: &str| -> Result<String> {
        ctx.sudo_as(
            &format!("psql -d {} -c {}", quote(name)?, quote(sql)?),
            "postgres",
        )
    };

    if app.pg_unaccent() {
        in_database("CREATE EXTENSION IF NOT EXISTS unaccent WITH SCHEMA public;")?;
    }

    if app.pg_collkey() {
        let versions = ctx.run("find /usr/lib/postgresql/ -mindepth 1 -maxdepth 1 -type d")?;
        let version = versions
            .lines()
            .next()
            .and_then(|dir| dir.trim_end_matches('/').rsplit('/').next())
            .unwrap_or_default()
            .to_string();
        let library = format!("/usr/lib/postgresql/{version}/lib/collkey_icu.so");
        if ctx.exists(&library)? {
            in_database(COLLKEY_SQL)?;
        } else {
            warn!("[{}] {library} not installed, skipping collkey", ctx.host());
        }
    }

    Ok(())
}

fn require_config(ctx: &TaskContext<'_>, app: &App, vars: &Value) -> Result<()> {
    // INVARIANT: Only reference files directory when it exists, else the app
    // fails on startup.
    let files_dir = app.www_dir().join("files");
    let files = if ctx.exists(&files_dir)? {
        files_dir.to_string_lossy().into_owned()
    } else {
        String::new()
    };

    ctx.upload_template(
        "config.ini",
        app.config(),
        context! { files => files, ..vars.clone() },
        None,
    )
}

fn alembic_upgrade_head(ctx: &TaskContext<'_>, app: &App) -> Result<()> {
    ctx.sudo_as(
        &format!(
            "cd {} && {} -n production upgrade head",
            quote(&app.src_dir().to_string_lossy())?,
            quote(&app.alembic().to_string_lossy())?
        ),
        app.name(),
    )?;

    if ctx.confirm("Vacuum database?", false)? {
        let flag = if ctx.confirm("VACUUM FULL?", false)? {
            "-f "
        } else {
            ""
        };
        ctx.sudo_as(
            &format!("vacuumdb {flag}-z -d {}", quote(app.name())?),
            "postgres",
        )?;
    }

    Ok(())
}
