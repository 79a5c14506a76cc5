// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Maintenance tasks of deployed apps.

use crate::{
    app::App,
    task::{remote::quote, Result, TaskContext, TaskError},
};

use std::{fs, path::Path};
use tracing::{info, instrument, warn};

/// Python packages left out of frozen requirements.
const FREEZE_IGNORE: &[&str] = &[
    "babel", "fabric", "fabtools", "newrelic", "paramiko", "pycrypto", "pyx",
];

/// Run one of the app's maintenance scripts as the app user.
///
/// Scripts live in the `scripts` directory of the app's package and receive
/// the app's config file as first argument.
#[instrument(skip(ctx, app), fields(app = app.name()), level = "debug")]
pub fn run_script(ctx: &TaskContext<'_>, app: &App, script: &str, args: &[String]) -> Result<()> {
    let script_path = app
        .src_dir()
        .join(app.name())
        .join("scripts")
        .join(format!("{script}.py"));
    let config_name = app
        .config()
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut command = vec![
        quote(&app.venv_bin().join("python").to_string_lossy())?,
        quote(&script_path.to_string_lossy())?,
        quote(&format!("{config_name}#{}", app.name()))?,
    ];
    for arg in args {
        command.push(quote(arg)?);
    }

    ctx.sudo_as(
        &format!(
            "cd {} && {}",
            quote(&app.home_dir().to_string_lossy())?,
            command.join(" ")
        ),
        app.name(),
    )?;

    Ok(())
}

/// Create all configured downloads of the app.
pub fn create_downloads(ctx: &TaskContext<'_>, app: &App) -> Result<()> {
    ctx.ensure_directory(app.download_dir(), Some("777"))?;
    run_script(ctx, app, "create_downloads", &[])?;
    ctx.ensure_directory(app.download_dir(), Some("755"))
}

/// Copy local download files matching a glob pattern to the app.
///
/// # Errors
///
/// - Return [`TaskError::Pattern`] if the pattern is malformed.
#[instrument(skip(ctx, app), fields(app = app.name()), level = "debug")]
pub fn copy_downloads(
    ctx: &TaskContext<'_>,
    app: &App,
    local_dir: &Path,
    pattern: &str,
) -> Result<()> {
    ctx.ensure_directory(app.download_dir(), Some("777"))?;

    let pattern = local_dir.join(pattern);
    let mut copied = 0;
    for entry in glob::glob(&pattern.to_string_lossy())? {
        let source = match entry {
            Ok(path) if path.is_file() => path,
            Ok(_) => continue,
            Err(error) => {
                warn!("cannot read {:?}: {error}", error.path().display());
                continue;
            }
        };

        let Some(name) = source.file_name() else {
            continue;
        };
        let dest = app.download_dir().join(name);
        ctx.upload(&source, &dest)?;
        let owner = quote(&format!("{0}:{0}", app.name()))?;
        ctx.sudo(&format!(
            "chown {owner} {}",
            quote(&dest.to_string_lossy())?
        ))?;
        copied += 1;
    }

    info!("[{}] copied {copied} download(s) of {}", ctx.host(), app.name());
    ctx.ensure_directory(app.download_dir(), Some("755"))
}

/// Copy the app's RDF dumps.
pub fn copy_rdfdump(ctx: &TaskContext<'_>, app: &App, local_dir: &Path) -> Result<()> {
    copy_downloads(ctx, app, local_dir, "*.n3.gz")
}

/// Write installed package versions of the app to `requirements.txt`.
///
/// # Errors
///
/// - Return [`TaskError::Local`] if the requirements file cannot be written.
#[instrument(skip(ctx, app), fields(app = app.name()), level = "debug")]
pub fn pip_freeze(ctx: &TaskContext<'_>, app: &App, target_dir: &Path) -> Result<()> {
    let pip = quote(&app.venv_bin().join("pip").to_string_lossy())?;
    let stdout = ctx.run(&format!("{pip} freeze 2> /dev/null"))?;
    let requirements = freeze_requirements(app.name(), &stdout);

    let target = target_dir.join("requirements.txt");
    fs::write(&target, requirements).map_err(|source| TaskError::Local {
        source,
        path: target.clone(),
    })?;
    info!("wrote {:?}", target.display());

    Ok(())
}

/// Filter `pip freeze` output down to pinnable requirements.
///
/// Drops pip warnings, the app itself, and tooling packages. Editable
/// installs of `clld` and `clldmpg` are replaced by their plain names.
pub fn freeze_requirements(app_name: &str, stdout: &str) -> String {
    let app_git = format!("{}.git", app_name.to_lowercase());
    let mut requirements = String::new();
    for line in stdout.lines() {
        let package = line.split("==").next().unwrap_or_default().to_lowercase();
        let line = if line.starts_with("\x1b[33m")
            || line.starts_with("You should ")
            || line.contains("SNIMissingWarning")
            || line.contains("InsecurePlatformWarning")
            || line.contains(&app_git)
            || FREEZE_IGNORE.contains(&package.as_str())
        {
            continue;
        } else if line.contains("clldmpg.git") {
            "clldmpg"
        } else if line.contains("clld.git") {
            "clld"
        } else {
            line
        };

        requirements.push_str(line);
        requirements.push('\n');
    }

    requirements
}
