// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{AppsFixture, APPS};

use appconfig::{
    app::AppError,
    registry::RegistryError,
    Registry, SortOrder, Stack,
};

use anyhow::Result;
use indoc::indoc;
use pretty_assertions::assert_eq;
use std::fs::{create_dir, write};

/// Shared apps file followed by more sections.
fn apps_with(extra: &str) -> String {
    format!("{APPS}\n{extra}")
}

#[test]
fn load_apps_file() -> Result<()> {
    let fixture = AppsFixture::new(APPS)?;
    let registry = Registry::from_file(fixture.path(), true)?;

    assert_eq!(registry.len(), 2);
    let wals3 = registry.get("wals3")?;
    assert_eq!(wals3.port(), 8887);
    assert_eq!(wals3.domain(), Some("wals3.info"));
    assert_eq!(wals3.test(), Some("test.example.org"));
    assert_eq!(wals3.workers(), 5);
    assert_eq!(wals3.stack(), Stack::Clld);
    assert_eq!(wals3.app_pkg(), "-e git+https://github.com/clld/wals3.git#egg=wals3");

    let glottolog3 = registry.get("glottolog3")?;
    assert_eq!(glottolog3.test(), None);
    assert!(glottolog3.public());

    assert_eq!(registry.hostnames(), ["prod.example.org"]);
    assert_eq!(registry.source_dir(wals3), fixture.dir().join("wals3"));
    Ok(())
}

#[test]
fn lookup_unknown_app() -> Result<()> {
    let fixture = AppsFixture::new(APPS)?;
    let registry = Registry::from_file(fixture.path(), true)?;

    let result = registry.get("wals4");
    assert!(matches!(result, Err(RegistryError::UnknownApp(name)) if name == "wals4"));
    Ok(())
}

#[test]
fn list_by_server() -> Result<()> {
    let fixture = AppsFixture::new(APPS)?;
    create_dir(fixture.dir().join("wals3"))?;
    let registry = Registry::from_file(fixture.path(), true)?;

    let expect = indoc! {"
        #  id            url                            server            port  stack  public
        -  ------------  -----------------------------  ----------------  ----  -----  ------
        1  glottolog3    https://glottolog3.info        prod.example.org  8886  clld   true
        2  wals3         https://wals3.info             prod.example.org  8887  clld   false
        3  wals3 [test]  http://test.example.org/wals3  test.example.org  8887  clld   false
    "};
    assert_eq!(registry.table(SortOrder::default()), expect);
    Ok(())
}

#[test]
fn reject_shared_port() -> Result<()> {
    let fixture = AppsFixture::new(apps_with(indoc! {"
        [appA]
        name = appA
        port = 8001

        [appB]
        name = appB
        port = 8001
    "}))?;

    let result = Registry::from_file(fixture.path(), true);
    assert!(matches!(result, Err(RegistryError::DuplicatePort(ports)) if ports == [8001]));

    // INVARIANT: Shared ports are rejected even without validation.
    let result = Registry::from_file(fixture.path(), false);
    assert!(matches!(result, Err(RegistryError::DuplicatePort(ports)) if ports == [8001]));
    Ok(())
}

#[test]
fn reject_section_name_mismatch() -> Result<()> {
    let fixture = AppsFixture::new(apps_with(indoc! {"
        [wals4]
        name = wals5
        port = 8888
    "}))?;

    let result = Registry::from_file(fixture.path(), true);
    assert!(matches!(
        result,
        Err(RegistryError::NameMismatch(mismatch))
            if mismatch == [("wals4".to_string(), "wals5".to_string())]
    ));
    Ok(())
}

#[test]
fn reject_missing_field() -> Result<()> {
    let fixture = AppsFixture::new(indoc! {"
        [wals3]
        name = wals3
        port = 8887
    "})?;

    let result = Registry::from_file(fixture.path(), true);
    assert!(matches!(
        result,
        Err(RegistryError::App(AppError::MissingField { app, .. })) if app == "wals3"
    ));
    Ok(())
}

#[test]
fn reject_unknown_field() -> Result<()> {
    let fixture = AppsFixture::new(apps_with(indoc! {"
        [wals4]
        name = wals4
        port = 8888
        colour = blue
    "}))?;

    let result = Registry::from_file(fixture.path(), true);
    assert!(matches!(
        result,
        Err(RegistryError::App(AppError::UnknownField { fields, .. })) if fields == ["colour"]
    ));
    Ok(())
}

#[test]
fn skip_internal_sections() -> Result<()> {
    let fixture = AppsFixture::new(apps_with(indoc! {"
        [_shared]
        server = shared.example.org

        [wals4]
        name = wals4
        port = 8888
        production = ${_shared:server}
    "}))?;

    let registry = Registry::from_file(fixture.path(), true)?;
    assert_eq!(registry.len(), 3);
    assert_eq!(registry.get("wals4")?.production(), Some("shared.example.org"));
    assert!(registry.get("_shared").is_err());
    Ok(())
}

#[test]
fn read_byte_order_mark() -> Result<()> {
    let fixture = AppsFixture::new(format!("\u{feff}{APPS}"))?;
    let registry = Registry::from_file(fixture.path(), true)?;

    assert_eq!(registry.len(), 2);
    Ok(())
}

#[test]
fn write_back_loads_same_apps() -> Result<()> {
    let fixture = AppsFixture::new(APPS)?;
    let registry = Registry::from_file(fixture.path(), true)?;

    let copy = fixture.dir().join("copy.ini");
    write(&copy, registry.to_ini()?.to_string())?;
    let reloaded = Registry::from_file(&copy, true)?;

    assert_eq!(reloaded, registry);
    Ok(())
}

#[test]
fn missing_apps_file() {
    let result = Registry::from_file("/no/such/apps.ini", true);
    assert!(matches!(result, Err(RegistryError::Config(_))));
}
