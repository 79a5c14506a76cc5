// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! App registry.
//!
//! The __registry__ holds every app of the fleet, loaded from one apps file.
//! Each section of the file becomes one [`App`] keyed by the section name.
//! Sections whose name starts with `_` are internal, e.g., shared values
//! referenced through interpolation, and never become apps.
//!
//! # Local Source Directories
//!
//! Every app has a local source directory next to the apps file, named
//! after the app. Tasks that write files back to the operator's machine,
//! like freezing requirements, write into it.
//!
//! # Validation
//!
//! Every registry guarantees that each app's name equals its section name,
//! and that no two apps share a port. A registry is either fully loaded or
//! not at all. Validation mode additionally warns about apps whose local
//! source directory is missing, without failing the load.

use crate::{
    app::App,
    config::IniDocument,
};

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Every app of the fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    apps: Vec<(String, App)>,
    base_dir: PathBuf,
}

impl Registry {
    /// Load registry from an apps file.
    ///
    /// Local source directories are resolved relative to the directory of
    /// the apps file.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::Config`] if the file cannot be read or
    ///   parsed.
    /// - Return any error of [`Registry::from_ini`].
    pub fn from_file(path: impl AsRef<Path>, validate: bool) -> Result<Self> {
        let path = path.as_ref();
        debug!("load apps from {:?}", path.display());
        let doc = IniDocument::from_file(path)?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        Self::from_ini(&doc, base_dir, validate)
    }

    /// Build registry from a parsed document.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::App`] for the first section that does not
    ///   describe a valid app.
    /// - Return [`RegistryError::NameMismatch`] listing every section whose
    ///   app is named differently.
    /// - Return [`RegistryError::DuplicatePort`] listing every port used
    ///   more than once.
    pub fn from_ini(doc: &IniDocument, base_dir: impl Into<PathBuf>, validate: bool) -> Result<Self> {
        let mut apps = Vec::new();
        for section in doc.sections().filter(|section| !section.starts_with('_')) {
            let entries = doc.section(section)?;
            apps.push((section.to_string(), App::from_entries(section, entries)?));
        }

        let registry = Self {
            apps,
            base_dir: base_dir.into(),
        };
        registry.check()?;
        if validate {
            registry.warn_missing_sources();
        }

        Ok(registry)
    }

    fn check(&self) -> Result<()> {
        let mismatch = self
            .apps
            .iter()
            .filter(|(section, app)| section != app.name())
            .map(|(section, app)| (section.clone(), app.name().to_string()))
            .collect::<Vec<_>>();
        if !mismatch.is_empty() {
            return Err(RegistryError::NameMismatch(mismatch));
        }

        let duplicates = duplicates(self.apps.iter().map(|(_, app)| app.port()));
        if !duplicates.is_empty() {
            return Err(RegistryError::DuplicatePort(duplicates));
        }

        Ok(())
    }

    fn warn_missing_sources(&self) {
        for (_, app) in &self.apps {
            let source_dir = self.source_dir(app);
            if !source_dir.exists() {
                warn!("missing source directory {:?} of {}", source_dir.display(), app.name());
            }
        }
    }

    /// Lookup app by name.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::UnknownApp`] if no app has that name.
    pub fn get(&self, name: &str) -> Result<&App> {
        self.apps
            .iter()
            .find(|(section, _)| section == name)
            .map(|(_, app)| app)
            .ok_or_else(|| RegistryError::UnknownApp(name.to_string()))
    }

    /// Iterate over section names and apps in file order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &App)> {
        self.apps.iter().map(|(section, app)| (section.as_str(), app))
    }

    /// Iterate over apps in file order.
    pub fn values(&self) -> impl Iterator<Item = &App> {
        self.apps.iter().map(|(_, app)| app)
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Distinct production hosts in order of first appearance.
    pub fn hostnames(&self) -> Vec<&str> {
        let mut hosts = Vec::new();
        for host in self.values().filter_map(App::production) {
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }

        hosts
    }

    /// Directory holding the local sources of an app.
    pub fn source_dir(&self, app: &App) -> PathBuf {
        self.base_dir.join(app.name())
    }

    /// Serialize registry back into a document.
    pub fn to_ini(&self) -> Result<IniDocument> {
        let mut doc = IniDocument::new();
        for (section, app) in &self.apps {
            doc.push_section(section.as_str(), app.to_entries())?;
        }

        Ok(doc)
    }

    /// Render fixed-width table of all apps.
    ///
    /// Every app gets one row for production, and another row for test if
    /// it has a test host.
    pub fn table(&self, order: SortOrder) -> String {
        let mut rows = Vec::new();
        for app in self.values() {
            let port = app.port().to_string();
            let stack = app.stack().to_string();
            rows.push(Row {
                id: app.name().to_string(),
                url: format!("https://{}", app.domain().unwrap_or_default()),
                server: app.production().unwrap_or_default().to_string(),
                port: app.port(),
                cells: [port.clone(), stack.clone(), app.public().to_string()],
            });

            if let Some(test) = app.test() {
                rows.push(Row {
                    id: format!("{} [test]", app.name()),
                    url: format!("http://{test}/{}", app.name()),
                    server: test.to_string(),
                    port: app.port(),
                    cells: [port, stack, false.to_string()],
                });
            }
        }

        match order {
            SortOrder::Port => rows.sort_by_key(|row| row.port),
            SortOrder::Server => rows.sort_by(|a, b| (&a.server, &a.id).cmp(&(&b.server, &b.id))),
        }

        let header = ["#", "id", "url", "server", "port", "stack", "public"].map(String::from);
        let lines = rows
            .into_iter()
            .enumerate()
            .map(|(index, row)| {
                let [port, stack, public] = row.cells;
                [(index + 1).to_string(), row.id, row.url, row.server, port, stack, public]
            })
            .collect::<Vec<_>>();

        let mut widths = header.clone().map(|cell| cell.len());
        for line in &lines {
            for (width, cell) in widths.iter_mut().zip(line) {
                *width = (*width).max(cell.chars().count());
            }
        }

        let rule = widths.map(|width| "-".repeat(width));
        let mut table = String::new();
        for line in std::iter::once(&header).chain([&rule]).chain(&lines) {
            let cells = line
                .iter()
                .zip(widths)
                .enumerate()
                .map(|(column, (cell, width))| match column {
                    // INVARIANT: Numeric columns align right.
                    0 | 4 => format!("{cell:>width$}"),
                    _ => format!("{cell:<width$}"),
                })
                .collect::<Vec<_>>();
            table.push_str(cells.join("  ").trim_end());
            table.push('\n');
        }

        table
    }
}

/// Row order of [`Registry::table`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Port,

    /// By server, then id.
    #[default]
    Server,
}

struct Row {
    id: String,
    url: String,
    server: String,
    port: u16,
    cells: [String; 3],
}

/// Values occurring more than once, each listed once in ascending order.
fn duplicates(values: impl IntoIterator<Item = u16>) -> Vec<u16> {
    let mut counts = HashMap::new();
    for value in values {
        *counts.entry(value).or_insert(0_usize) += 1;
    }

    let mut duplicates = counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(value, _)| value)
        .collect::<Vec<_>>();
    duplicates.sort_unstable();

    duplicates
}

/// Registry error types.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Apps file cannot be read or parsed.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// Section does not describe a valid app.
    #[error(transparent)]
    App(#[from] crate::app::AppError),

    /// Apps named differently from their section, as (section, name).
    #[error("section/name mismatch: {0:?}")]
    NameMismatch(Vec<(String, String)>),

    /// Ports used by more than one app.
    #[error("duplicate port(s): {0:?}")]
    DuplicatePort(Vec<u16>),

    /// No app with that name.
    #[error("unknown app {0:?}")]
    UnknownApp(String),
}

/// Friendly result alias :3
pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppError;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use std::{
        io::Write,
        sync::{Arc, Mutex},
    };

    const APPS: &str = indoc! {"
        [DEFAULT]
        domain = ${name}.info
        test =
        production =
        workers = 3
        deploy_duration = 1
        with_blog = false
        pg_collkey = false
        pg_unaccent = false
        require_deb =
        require_pip =
        app_pkg = ${name}
        error_email = lingweb@example.org
        stack = clld
        public = false

        [_hosts]
        main = main.example.org

        [wals3]
        name = wals3
        port = 8887
        production = ${_hosts:main}
        test = test.example.org

        [glottolog3]
        name = glottolog3
        port = 8886
        production = ${_hosts:main}
        public = true
    "};

    fn load(data: &str, validate: bool) -> Result<Registry> {
        let doc: IniDocument = data.parse()?;
        Registry::from_ini(&doc, "/srv/apps", validate)
    }

    #[test]
    fn load_apps_skipping_internal_sections() {
        let registry = load(APPS, true).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.iter().map(|(section, _)| section).collect::<Vec<_>>(),
            ["wals3", "glottolog3"]
        );
        let wals3 = registry.get("wals3").unwrap();
        assert_eq!(wals3.domain(), Some("wals3.info"));
        assert_eq!(wals3.production(), Some("main.example.org"));
        assert_eq!(wals3.test(), Some("test.example.org"));
        assert_eq!(registry.get("glottolog3").unwrap().test(), None);
    }

    #[test]
    fn names_match_sections() {
        let registry = load(APPS, true).unwrap();
        for (section, app) in registry.iter() {
            assert_eq!(section, app.name());
        }
    }

    #[test]
    fn unknown_app() {
        let registry = load(APPS, true).unwrap();
        assert!(matches!(
            registry.get("nope"),
            Err(RegistryError::UnknownApp(name)) if name == "nope"
        ));
    }

    #[test]
    fn duplicate_ports_are_listed_once() {
        let mut data = APPS.replace("port = 8886", "port = 8887");
        data.push_str(indoc! {"

            [appa]
            name = appa
            port = 8001

            [appb]
            name = appb
            port = 8001

            [appc]
            name = appc
            port = 8001
        "});

        let result = load(&data, true);
        assert!(matches!(
            result,
            Err(RegistryError::DuplicatePort(ports)) if ports == [8001, 8887]
        ));
    }

    #[test]
    fn name_mismatches_are_collected() {
        let data = APPS
            .replace("name = wals3", "name = wals")
            .replace("name = glottolog3", "name = glottolog");

        let result = load(&data, true);
        assert!(matches!(
            result,
            Err(RegistryError::NameMismatch(mismatch)) if mismatch == [
                ("wals3".to_string(), "wals".to_string()),
                ("glottolog3".to_string(), "glottolog".to_string()),
            ]
        ));
    }

    #[test]
    fn checks_hold_without_validation() {
        let data = APPS.replace("port = 8886", "port = 8887");
        assert!(matches!(
            load(&data, false),
            Err(RegistryError::DuplicatePort(ports)) if ports == [8887]
        ));

        let data = APPS.replace("name = glottolog3", "name = wals3");
        assert!(matches!(
            load(&data, false),
            Err(RegistryError::NameMismatch(mismatch))
                if mismatch == [("glottolog3".to_string(), "wals3".to_string())]
        ));
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn load_captured(data: &str, validate: bool) -> (Result<Registry>, String) {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .without_time()
            .finish();

        let result = tracing::subscriber::with_default(subscriber, || load(data, validate));
        (result, captured.contents())
    }

    #[test]
    fn missing_source_dir_only_warns() {
        let (result, logs) = load_captured(APPS, true);

        assert_eq!(result.unwrap().len(), 2);
        assert!(logs.contains("WARN"));
        assert!(logs.contains("missing source directory \"/srv/apps/wals3\" of wals3"));
        assert!(logs.contains("missing source directory \"/srv/apps/glottolog3\" of glottolog3"));
    }

    #[test]
    fn source_dirs_unchecked_without_validation() {
        let (result, logs) = load_captured(APPS, false);

        assert_eq!(result.unwrap().len(), 2);
        assert_eq!(logs, "");
    }

    #[test]
    fn field_errors_fail_fast() {
        let data = APPS.replace("port = 8887\n", "");
        let result = load(&data, true);
        assert!(matches!(
            result,
            Err(RegistryError::App(AppError::MissingField { app, field: "port" })) if app == "wals3"
        ));
    }

    #[test]
    fn hostnames_are_distinct() {
        let registry = load(APPS, true).unwrap();
        assert_eq!(registry.hostnames(), ["main.example.org"]);
    }

    #[test]
    fn source_dir_next_to_apps_file() {
        let registry = load(APPS, true).unwrap();
        let app = registry.get("wals3").unwrap();
        assert_eq!(registry.source_dir(app), PathBuf::from("/srv/apps/wals3"));
    }

    #[test]
    fn serialize_round_trip() {
        let registry = load(APPS, true).unwrap();
        let data = registry.to_ini().unwrap().to_string();
        assert_eq!(load(&data, true).unwrap(), registry);
    }

    #[test]
    fn table_sorted_by_port() {
        let registry = load(APPS, true).unwrap();
        let expect = indoc! {"
            #  id            url                            server            port  stack  public
            -  ------------  -----------------------------  ----------------  ----  -----  ------
            1  glottolog3    https://glottolog3.info        main.example.org  8886  clld   true
            2  wals3         https://wals3.info             main.example.org  8887  clld   false
            3  wals3 [test]  http://test.example.org/wals3  test.example.org  8887  clld   false
        "};

        assert_eq!(registry.table(SortOrder::Port), expect);
    }

    #[test]
    fn table_sorted_by_server() {
        let registry = load(APPS, true).unwrap();
        let table = registry.table(SortOrder::Server);

        let ids = table
            .lines()
            .skip(2)
            .map(|line| line.split("  ").map(str::trim).filter(|cell| !cell.is_empty()).nth(1))
            .collect::<Vec<_>>();
        assert_eq!(
            ids,
            [Some("glottolog3"), Some("wals3"), Some("wals3 [test]")]
        );
    }

    #[test]
    fn duplicates_of_nothing() {
        assert_eq!(duplicates([1, 2, 3]), Vec::<u16>::new());
        assert_eq!(duplicates([3, 1, 3, 1, 1]), [1, 3]);
    }
}
