// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{AppsFixture, Call, RecordingRemote, ScriptedPrompter, APPS};

use appconfig::{task::template::Templates, Dispatcher, Registry, Task};

use anyhow::Result;
use indoc::indoc;
use pretty_assertions::assert_eq;
use std::{
    fs::{read_to_string, write},
    path::PathBuf,
};
use tempfile::TempDir;

fn registry() -> Result<(AppsFixture, Registry)> {
    let fixture = AppsFixture::new(APPS)?;
    let registry = Registry::from_file(fixture.path(), true)?;
    Ok((fixture, registry))
}

#[test]
fn pip_freeze_writes_local_requirements() -> Result<()> {
    let (_fixture, registry) = registry()?;
    let app = registry.get("wals3")?;
    let remote = RecordingRemote::ubuntu();
    remote.respond(
        "pip freeze",
        indoc! {"
            -e git+https://github.com/clld/clld.git@abc#egg=clld
            -e git+https://github.com/clld/wals3.git@123#egg=wals3
            SQLAlchemy==1.0.12
        "},
    );
    let dispatcher = Dispatcher::new(app, remote, Templates::new()?, ScriptedPrompter::default());
    let target_dir = TempDir::new()?;

    // INVARIANT: Pinned to production, the given environment is ignored.
    let task = Task::PipFreeze {
        target_dir: target_dir.path().to_path_buf(),
    };
    dispatcher.run_task(Some("test"), &task)?;

    let requirements = read_to_string(target_dir.path().join("requirements.txt"))?;
    assert_eq!(requirements, "clld\nSQLAlchemy==1.0.12\n");
    assert!(dispatcher
        .remote()
        .calls()
        .iter()
        .all(|call| call.host() == "prod.example.org"));
    Ok(())
}

#[test]
fn copy_rdfdump_uploads_only_dumps() -> Result<()> {
    let (_fixture, registry) = registry()?;
    let app = registry.get("wals3")?;
    let dispatcher = Dispatcher::new(
        app,
        RecordingRemote::ubuntu(),
        Templates::new()?,
        ScriptedPrompter::default(),
    );
    let local_dir = TempDir::new()?;
    write(local_dir.path().join("wals3-dataset.n3.gz"), "dump")?;
    write(local_dir.path().join("wals3-dataset.csv.zip"), "csv")?;

    let task = Task::CopyRdfdump {
        local_dir: local_dir.path().to_path_buf(),
    };
    dispatcher.run_task(Some("test"), &task)?;

    let uploads = dispatcher
        .remote()
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::Upload { source, dest, .. } => Some((source, dest)),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(
        uploads,
        [(
            local_dir.path().join("wals3-dataset.n3.gz"),
            PathBuf::from("/usr/venvs/wals3/src/wals3/wals3/static/download/wals3-dataset.n3.gz"),
        )]
    );

    let commands = dispatcher.remote().commands();
    assert!(commands
        .iter()
        .any(|command| command.starts_with("chown wals3:wals3 ")));
    assert_eq!(
        commands.last().map(String::as_str),
        Some("chmod 755 /usr/venvs/wals3/src/wals3/wals3/static/download")
    );
    Ok(())
}

#[test]
fn run_script_as_app_user() -> Result<()> {
    let (_fixture, registry) = registry()?;
    let app = registry.get("wals3")?;
    let dispatcher = Dispatcher::new(
        app,
        RecordingRemote::ubuntu(),
        Templates::new()?,
        ScriptedPrompter::default(),
    );

    let task = Task::RunScript {
        script: "initializedb".into(),
        args: vec!["--force".into()],
    };
    dispatcher.run_task(Some("test"), &task)?;

    let calls = dispatcher.remote().calls();
    assert_eq!(calls.len(), 1);
    let Call::Sudo { host, command, user } = &calls[0] else {
        panic!("expected sudo call, got {:?}", calls[0]);
    };
    assert_eq!(host, "test.example.org");
    assert_eq!(user.as_deref(), Some("wals3"));
    assert!(command.starts_with("cd /home/wals3 && /usr/venvs/wals3/bin/python "));
    assert!(command.contains("/usr/venvs/wals3/src/wals3/wals3/scripts/initializedb.py"));
    assert!(command.ends_with(" --force"));
    Ok(())
}

#[test]
fn create_downloads_opens_directory_temporarily() -> Result<()> {
    let (_fixture, registry) = registry()?;
    let app = registry.get("wals3")?;
    let dispatcher = Dispatcher::new(
        app,
        RecordingRemote::ubuntu(),
        Templates::new()?,
        ScriptedPrompter::default(),
    );

    dispatcher.run_task(Some("production"), &Task::CreateDownloads)?;

    let commands = dispatcher.remote().commands();
    let download_dir = "/usr/venvs/wals3/src/wals3/wals3/static/download";
    assert_eq!(commands.len(), 5);
    assert_eq!(commands[1], format!("chmod 777 {download_dir}"));
    assert!(commands[2].contains("scripts/create_downloads.py"));
    assert_eq!(commands[4], format!("chmod 755 {download_dir}"));
    Ok(())
}

#[test]
fn uninstall_removes_app() -> Result<()> {
    let (_fixture, registry) = registry()?;
    let app = registry.get("wals3")?;
    let remote = RecordingRemote::ubuntu();
    remote.create("/etc/nginx/locations.d/wals3.conf");
    remote.create("/usr/venvs/wals3");
    remote.respond("getent passwd", "wals3:x:1001:1001::/home/wals3:/bin/bash");
    let dispatcher = Dispatcher::new(app, remote, Templates::new()?, ScriptedPrompter::default());

    dispatcher.run_task(Some("test"), &Task::Uninstall)?;

    let remote = dispatcher.remote();
    let removed = remote
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::Remove { path, .. } => Some(path),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(
        removed,
        [
            PathBuf::from("/etc/nginx/locations.d/wals3.conf"),
            PathBuf::from("/usr/venvs/wals3"),
            PathBuf::from("/etc/supervisor/conf.d/wals3.conf"),
        ]
    );

    // INVARIANT: Visitors see the maintenance page during teardown.
    let maintenance = remote.puts("/home/wals3/www/503.html");
    assert_eq!(maintenance.len(), 1);
    assert!(maintenance[0].contains("wals3 is down for maintenance"));
    let commands = remote.commands();
    assert!(commands.contains(&"dropdb --if-exists wals3".to_string()));
    assert!(commands.contains(&"userdel -rf wals3".to_string()));
    Ok(())
}
