// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{AppsFixture, Call, RecordingRemote, ScriptedPrompter, APPS};

use appconfig::{
    task::{template::Templates, TaskError, TaskState},
    Dispatcher, Environment, Registry, Task,
};

use anyhow::Result;
use pretty_assertions::assert_eq;
use std::path::Path;

fn registry() -> Result<(AppsFixture, Registry)> {
    let fixture = AppsFixture::new(APPS)?;
    let registry = Registry::from_file(fixture.path(), true)?;
    Ok((fixture, registry))
}

#[test]
fn invalid_environment_fails_before_any_remote_call() -> Result<()> {
    let (_fixture, registry) = registry()?;
    let app = registry.get("wals3")?;
    let dispatcher = Dispatcher::new(
        app,
        RecordingRemote::ubuntu(),
        Templates::new()?,
        ScriptedPrompter::default(),
    );

    let result = dispatcher.run_task(Some("staging"), &Task::Start);

    assert!(matches!(result, Err(TaskError::InvalidEnvironment(token)) if token == "staging"));
    assert_eq!(dispatcher.remote().calls(), Vec::new());
    assert_eq!(dispatcher.state(), TaskState::Failed);
    Ok(())
}

#[test]
fn start_runs_against_test_host() -> Result<()> {
    let (_fixture, registry) = registry()?;
    let app = registry.get("wals3")?;
    let dispatcher = Dispatcher::new(
        app,
        RecordingRemote::ubuntu(),
        Templates::new()?,
        ScriptedPrompter::default(),
    );

    dispatcher.run_task(Some("test"), &Task::Start)?;

    let remote = dispatcher.remote();
    assert!(remote.calls().iter().all(|call| call.host() == "test.example.org"));
    let supervisor = remote.puts("/etc/supervisor/conf.d/wals3.conf");
    assert_eq!(supervisor.len(), 1);
    assert!(supervisor[0].contains("autostart=true"));
    assert_eq!(
        remote.commands(),
        ["supervisorctl update", "systemctl reload nginx"]
    );
    assert_eq!(dispatcher.state(), TaskState::Completed);
    Ok(())
}

#[test]
fn production_resolves_production_host() -> Result<()> {
    let (_fixture, registry) = registry()?;
    let app = registry.get("wals3")?;
    let dispatcher = Dispatcher::new(
        app,
        RecordingRemote::ubuntu(),
        Templates::new()?,
        ScriptedPrompter::default(),
    );

    let mut hosts = Vec::new();
    dispatcher.dispatch("production", |ctx, app| {
        hosts.push((ctx.host().to_string(), app.name().to_string()));
        Ok(())
    })?;

    assert_eq!(hosts, [("prod.example.org".to_string(), "wals3".to_string())]);
    Ok(())
}

#[test]
fn host_override_wins() -> Result<()> {
    let (_fixture, registry) = registry()?;
    let app = registry.get("glottolog3")?;
    let dispatcher = Dispatcher::new(
        app,
        RecordingRemote::ubuntu(),
        Templates::new()?,
        ScriptedPrompter::default(),
    )
    .with_hosts(["vbox"]);

    // INVARIANT: glottolog3 has no test host, the override supplies one.
    dispatcher.run_task(Some("test"), &Task::Stop { maintenance_hours: None })?;

    let calls = dispatcher.remote().calls();
    assert!(!calls.is_empty());
    assert!(calls.iter().all(|call| call.host() == "vbox"));
    Ok(())
}

#[test]
fn missing_host_touches_nothing() -> Result<()> {
    let (_fixture, registry) = registry()?;
    let app = registry.get("glottolog3")?;
    let dispatcher = Dispatcher::new(
        app,
        RecordingRemote::ubuntu(),
        Templates::new()?,
        ScriptedPrompter::default(),
    );

    let result = dispatcher.run_task(Some("test"), &Task::Start);

    assert!(matches!(
        result,
        Err(TaskError::MissingHost { app, environment: Environment::Test }) if app == "glottolog3"
    ));
    assert_eq!(dispatcher.remote().calls(), Vec::new());
    Ok(())
}

#[test]
fn pinned_task_runs_in_production() -> Result<()> {
    let (_fixture, registry) = registry()?;
    let app = registry.get("wals3")?;
    let dispatcher = Dispatcher::new(
        app,
        RecordingRemote::ubuntu(),
        Templates::new()?,
        ScriptedPrompter::default(),
    );

    dispatcher.run_task(None, &Task::Cache)?;

    let remote = dispatcher.remote();
    assert!(remote.calls().iter().all(|call| call.host() == "prod.example.org"));
    let site = remote.puts("/etc/nginx/sites-enabled/wals3");
    assert_eq!(site.len(), 1);
    assert!(site[0].contains("proxy_pass http://127.0.0.1:6081/"));
    assert!(!site[0].contains("8887"));

    let vcl = remote.puts("/etc/varnish/sites/wals3.vcl");
    assert!(vcl[0].contains(".port = \"8887\";"));
    assert_eq!(
        remote.puts("/etc/varnish/sites.vcl"),
        ["include \"/etc/varnish/sites/wals3.vcl\";\n"]
    );
    assert!(remote.commands().contains(&"systemctl restart varnish".to_string()));
    Ok(())
}

#[test]
fn deploy_composes_stop_without_environment() -> Result<()> {
    let (_fixture, registry) = registry()?;
    let app = registry.get("wals3")?;
    let remote = RecordingRemote::ubuntu();
    remote.create(app.src_dir().join("alembic.ini"));
    let dispatcher = Dispatcher::new(
        app,
        remote,
        Templates::new()?,
        ScriptedPrompter::with_passwords(["secret", "admin"]),
    );

    let task = Task::Deploy(appconfig::task::deployment::DeployOptions {
        with_blog: None,
        with_alembic: true,
        health_check_delay: std::time::Duration::ZERO,
    });
    dispatcher.run_task(Some("production"), &task)?;

    let remote = dispatcher.remote();
    let maintenance = remote.puts("/home/wals3/www/503.html");
    assert_eq!(maintenance.len(), 1);
    assert!(maintenance[0].contains("wals3 is down for maintenance"));

    // INVARIANT: Paused by the composed stop, then running again.
    let supervisor = remote.puts("/etc/supervisor/conf.d/wals3.conf");
    assert_eq!(supervisor.len(), 2);
    assert!(supervisor[0].contains("autostart=false"));
    assert!(supervisor[1].contains("autostart=true"));

    assert!(remote
        .commands()
        .iter()
        .any(|command| command.contains("alembic -n production upgrade head")));
    assert!(remote.calls().iter().all(|call| call.host() == "prod.example.org"));
    assert!(matches!(
        remote.calls().last(),
        Some(Call::Run { command, .. }) if command.contains("/_ping")
    ));
    assert_eq!(dispatcher.state(), TaskState::Completed);
    Ok(())
}

#[test]
fn stop_rejects_endless_maintenance() -> Result<()> {
    let (_fixture, registry) = registry()?;
    let app = registry.get("wals3")?;
    let dispatcher = Dispatcher::new(
        app,
        RecordingRemote::ubuntu(),
        Templates::new()?,
        ScriptedPrompter::default(),
    );

    let task = Task::Stop {
        maintenance_hours: Some(u32::MAX),
    };
    let result = dispatcher.run_task(Some("production"), &task);

    assert!(matches!(result, Err(TaskError::InvalidDuration { hours: u32::MAX })));
    assert_eq!(dispatcher.remote().calls(), Vec::new());
    assert_eq!(dispatcher.state(), TaskState::Failed);
    Ok(())
}

#[test]
fn deploy_rejects_endless_upgrade_window() -> Result<()> {
    let (_fixture, registry) = registry()?;
    let app = registry.get("wals3")?.replace([("deploy_duration", "4294967295")])?;
    let remote = RecordingRemote::ubuntu();
    remote.create(app.src_dir().join("alembic.ini"));
    let dispatcher = Dispatcher::new(
        &app,
        remote,
        Templates::new()?,
        ScriptedPrompter::with_passwords(["secret", "admin"]),
    );

    let task = Task::Deploy(appconfig::task::deployment::DeployOptions {
        with_alembic: true,
        health_check_delay: std::time::Duration::ZERO,
        ..Default::default()
    });
    let result = dispatcher.run_task(Some("production"), &task);

    assert!(matches!(result, Err(TaskError::InvalidDuration { .. })));
    assert!(dispatcher.remote().puts("/home/wals3/www/503.html").is_empty());
    Ok(())
}

#[test]
fn deploy_rejects_unsupported_release() -> Result<()> {
    let (_fixture, registry) = registry()?;
    let app = registry.get("wals3")?;
    let remote = RecordingRemote::ubuntu();
    remote.respond("lsb_release --codename", "trusty");
    let dispatcher = Dispatcher::new(app, remote, Templates::new()?, ScriptedPrompter::default());

    let result = dispatcher.run_task(Some("test"), &Task::Deploy(Default::default()));

    assert!(matches!(
        result,
        Err(TaskError::UnsupportedPlatform { codename, .. }) if codename == "trusty"
    ));
    assert_eq!(dispatcher.remote().commands().len(), 2);
    assert_eq!(dispatcher.state(), TaskState::Failed);
    Ok(())
}

#[test]
fn deploy_fails_health_check() -> Result<()> {
    let (_fixture, registry) = registry()?;
    let app = registry.get("glottolog3")?;
    let remote = RecordingRemote::ubuntu();
    remote.respond("/_ping", "<html>502 Bad Gateway</html>");
    let dispatcher = Dispatcher::new(
        app,
        remote,
        Templates::new()?,
        ScriptedPrompter::with_passwords(["admin"]),
    );

    let task = Task::Deploy(appconfig::task::deployment::DeployOptions {
        health_check_delay: std::time::Duration::ZERO,
        ..Default::default()
    });
    let result = dispatcher.run_task(Some("production"), &task);

    assert!(matches!(result, Err(TaskError::HealthCheck { app, .. }) if app == "glottolog3"));
    Ok(())
}

#[test]
fn deploy_to_test_caps_workers() -> Result<()> {
    let (_fixture, registry) = registry()?;
    let app = registry.get("wals3")?;
    let dispatcher = Dispatcher::new(
        app,
        RecordingRemote::ubuntu(),
        Templates::new()?,
        ScriptedPrompter::with_passwords(["secret", "admin"]).confirming([false]),
    );

    let task = Task::Deploy(appconfig::task::deployment::DeployOptions {
        health_check_delay: std::time::Duration::ZERO,
        ..Default::default()
    });
    dispatcher.run_task(Some("test"), &task)?;

    let remote = dispatcher.remote();
    let config = remote.puts("/home/wals3/config.ini");
    assert_eq!(config.len(), 1);
    assert!(config[0].contains("workers = 3"));
    assert!(config[0].contains("clld.environment = test"));

    // INVARIANT: Test sites live in a location of the shared default site.
    assert_eq!(remote.puts("/etc/nginx/sites-enabled/wals3"), Vec::<String>::new());
    let location = remote.puts(Path::new("/etc/nginx/locations.d/wals3.conf"));
    assert!(location[0].contains("location /wals3 {"));
    assert!(location[0].contains("auth_basic \"wals3\";"));
    assert!(remote.puts("/etc/logrotate.d/wals3").is_empty());
    Ok(())
}
