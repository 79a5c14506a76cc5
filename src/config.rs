// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Parse the INI-style apps file into a document of sections, and resolve
//! values with extended interpolation. Turning sections into typed app
//! records is left to [`crate::app`].
//!
//! # General Layout
//!
//! The apps file is a list of sections, one per app, each made up of
//! `key = value` lines. Lines starting with `#` are comments, and a `#`
//! preceded by whitespace starts an inline comment. Indented lines continue
//! the value of the previous key. Blank lines between continuation lines
//! stay part of the value, while trailing blank lines do not.
//!
//! A `[DEFAULT]` section provides fallback values for every other section.
//!
//! # Interpolation
//!
//! Values may reference other values with `${key}` (same section, or
//! `[DEFAULT]`) and `${section:key}` (any section). A literal dollar sign is
//! written as `$$`.
//!
//! ```ini
//! [DEFAULT]
//! workers = 3
//!
//! [wals3]
//! name = wals3
//! domain = ${name}.info
//! ```

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::read,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Name of the section providing fallback values.
pub const DEFAULT_SECTION: &str = "DEFAULT";

/// Maximum nesting of interpolation references.
pub const MAX_INTERPOLATION_DEPTH: usize = 10;

const BOM: char = '\u{feff}';

/// Parsed INI document.
///
/// Values are stored raw, i.e., before interpolation, so serializing a
/// parsed document reproduces it.
///
/// # Invariants
///
/// - Section names are unique.
/// - Keys are lowercase and unique within their section.
/// - Sections keep the order of the source file.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct IniDocument {
    defaults: Vec<(String, String)>,
    sections: Vec<Section>,
}

#[derive(Default, Debug, PartialEq, Eq, Clone)]
struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    fn get(&self, key: &str) -> Option<&str> {
        lookup(&self.entries, key)
    }
}

fn lookup<'a>(entries: &'a [(String, String)], key: &str) -> Option<&'a str> {
    entries
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, value)| value.as_str())
}

impl IniDocument {
    /// Construct new empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read and parse document from file.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if the file cannot be read.
    /// - Return [`ConfigError::Encoding`] if the file is not UTF-8.
    /// - Return any parse error of [`IniDocument::from_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = read(path.as_ref()).map_err(|err| ConfigError::Read {
            source: err,
            path: path.as_ref().to_path_buf(),
        })?;
        let data = String::from_utf8(bytes).map_err(|err| ConfigError::Encoding {
            source: err,
            path: path.as_ref().to_path_buf(),
        })?;

        data.parse()
    }

    /// Append a section with raw values.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::DuplicateSection`] if the section exists.
    pub fn push_section(
        &mut self,
        name: impl Into<String>,
        entries: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<()> {
        let name = name.into();
        if self.has_section(&name) {
            return Err(ConfigError::DuplicateSection { line: 0, name });
        }

        let entries = entries
            .into_iter()
            .map(|(key, value)| (key.into().to_lowercase(), value.into()))
            .collect();
        if name == DEFAULT_SECTION {
            self.defaults = entries;
        } else {
            self.sections.push(Section { name, entries });
        }

        Ok(())
    }

    /// List section names in file order, excluding `[DEFAULT]`.
    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|section| section.name.as_str())
    }

    /// Check if section exists.
    pub fn has_section(&self, name: &str) -> bool {
        self.sections.iter().any(|section| section.name == name)
    }

    /// Raw value of a key, falling back to `[DEFAULT]`.
    pub fn raw(&self, section: &str, key: &str) -> Option<&str> {
        let key = key.to_lowercase();
        if section == DEFAULT_SECTION {
            return lookup(&self.defaults, &key);
        }

        self.find(section)
            .and_then(|section| section.get(&key))
            .or_else(|| lookup(&self.defaults, &key))
    }

    /// Interpolated value of a key, falling back to `[DEFAULT]`.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::MissingSection`] if section does not exist.
    /// - Return any interpolation error.
    pub fn get(&self, section: &str, key: &str) -> Result<Option<String>> {
        self.ensure_section(section)?;
        match self.raw(section, key) {
            Some(raw) => Ok(Some(self.interpolate(section, key, raw, 1)?)),
            None => Ok(None),
        }
    }

    /// All interpolated key/value pairs of a section.
    ///
    /// Own keys come first in file order, then inherited `[DEFAULT]` keys
    /// that the section does not override.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::MissingSection`] if section does not exist.
    /// - Return any interpolation error.
    pub fn section(&self, name: &str) -> Result<Vec<(String, String)>> {
        let section = self.find(name).ok_or_else(|| ConfigError::MissingSection {
            name: name.to_string(),
        })?;

        let inherited = self
            .defaults
            .iter()
            .filter(|(key, _)| section.get(key).is_none());

        section
            .entries
            .iter()
            .chain(inherited)
            .map(|(key, raw)| {
                Ok::<_, ConfigError>((key.clone(), self.interpolate(name, key, raw, 1)?))
            })
            .collect()
    }

    fn find(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|section| section.name == name)
    }

    fn ensure_section(&self, name: &str) -> Result<()> {
        if name == DEFAULT_SECTION || self.has_section(name) {
            return Ok(());
        }

        Err(ConfigError::MissingSection {
            name: name.to_string(),
        })
    }

    fn interpolate(&self, section: &str, key: &str, raw: &str, depth: usize) -> Result<String> {
        if depth > MAX_INTERPOLATION_DEPTH {
            return Err(ConfigError::InterpolationDepth {
                section: section.to_string(),
                key: key.to_string(),
            });
        }

        let syntax = |rest: &str| ConfigError::InterpolationSyntax {
            section: section.to_string(),
            key: key.to_string(),
            rest: rest.to_string(),
        };

        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(index) = rest.find('$') {
            out.push_str(&rest[..index]);
            rest = &rest[index..];

            if let Some(tail) = rest.strip_prefix("$$") {
                out.push('$');
                rest = tail;
                continue;
            }

            let body = rest.strip_prefix("${").ok_or_else(|| syntax(rest))?;
            let end = body.find('}').ok_or_else(|| syntax(rest))?;
            let reference = &body[..end];

            let (target_section, target_key) = match reference.split(':').collect::<Vec<_>>()[..] {
                [target_key] => (section, target_key),
                [target_section, target_key] => (target_section, target_key),
                _ => return Err(syntax(rest)),
            };
            let target_key = target_key.to_lowercase();

            let missing = || ConfigError::InterpolationMissing {
                section: section.to_string(),
                key: key.to_string(),
                reference: reference.to_string(),
            };
            if target_section != DEFAULT_SECTION && !self.has_section(target_section) {
                return Err(missing());
            }
            let value = self.raw(target_section, &target_key).ok_or_else(missing)?;
            out.push_str(&self.interpolate(target_section, &target_key, value, depth + 1)?);

            rest = &body[end + 1..];
        }
        out.push_str(rest);

        Ok(out)
    }
}

impl FromStr for IniDocument {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let data = data.strip_prefix(BOM).unwrap_or(data);
        let mut document = IniDocument::new();

        // Index of the section being filled, where `None` means `[DEFAULT]`.
        let mut current: Option<Option<usize>> = None;
        let mut last_key: Option<String> = None;
        let mut blank_lines = 0;

        for (index, line) in data.lines().enumerate() {
            let line_no = index + 1;
            let trimmed = line.trim();

            if trimmed.is_empty() {
                blank_lines += 1;
                continue;
            }

            if trimmed.starts_with('#') {
                continue;
            }

            let content = strip_inline_comment(line);
            let is_indented = line.starts_with(char::is_whitespace);

            // INVARIANT: Indented lines continue the previous value.
            if is_indented {
                if let (Some(target), Some(key)) = (current, last_key.as_ref()) {
                    let entries = document.entries_mut(target);
                    if let Some((_, value)) = entries.iter_mut().find(|(k, _)| k == key) {
                        if !value.is_empty() {
                            value.push_str(&"\n".repeat(blank_lines + 1));
                        }
                        value.push_str(content.trim());
                    }
                    blank_lines = 0;
                    continue;
                }
            }

            blank_lines = 0;

            let content = content.trim();
            if let Some(name) = content
                .strip_prefix('[')
                .and_then(|header| header.strip_suffix(']'))
            {
                let name = name.trim().to_string();
                last_key = None;
                if name == DEFAULT_SECTION {
                    current = Some(None);
                    continue;
                }

                if document.has_section(&name) {
                    return Err(ConfigError::DuplicateSection {
                        line: line_no,
                        name,
                    });
                }
                document.sections.push(Section {
                    name,
                    entries: Vec::new(),
                });
                current = Some(Some(document.sections.len() - 1));
                continue;
            }

            let target = current.ok_or(ConfigError::MissingSectionHeader { line: line_no })?;
            let (key, value) = content.split_once('=').ok_or_else(|| ConfigError::Parse {
                line: line_no,
                content: line.to_string(),
            })?;
            let key = key.trim().to_lowercase();
            if key.is_empty() {
                return Err(ConfigError::Parse {
                    line: line_no,
                    content: line.to_string(),
                });
            }

            let entries = document.entries_mut(target);
            if lookup(entries, &key).is_some() {
                return Err(ConfigError::DuplicateKey { line: line_no, key });
            }
            entries.push((key.clone(), value.trim().to_string()));
            last_key = Some(key);
        }

        Ok(document)
    }
}

impl IniDocument {
    fn entries_mut(&mut self, target: Option<usize>) -> &mut Vec<(String, String)> {
        match target {
            Some(index) => &mut self.sections[index].entries,
            None => &mut self.defaults,
        }
    }
}

fn strip_inline_comment(line: &str) -> &str {
    let mut previous = None;
    for (index, ch) in line.char_indices() {
        if ch == '#' && previous.is_some_and(char::is_whitespace) {
            return &line[..index];
        }
        previous = Some(ch);
    }

    line
}

impl Display for IniDocument {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let mut blocks = Vec::new();
        if !self.defaults.is_empty() {
            blocks.push((DEFAULT_SECTION, &self.defaults));
        }
        blocks.extend(
            self.sections
                .iter()
                .map(|section| (section.name.as_str(), &section.entries)),
        );

        for (index, (name, entries)) in blocks.into_iter().enumerate() {
            if index > 0 {
                writeln!(fmt)?;
            }
            writeln!(fmt, "[{name}]")?;
            for (key, value) in entries {
                let mut lines = value.lines();
                match lines.next() {
                    Some(first) => writeln!(fmt, "{key} = {first}")?,
                    None => writeln!(fmt, "{key} =")?,
                }
                for line in lines {
                    writeln!(fmt, "    {line}")?;
                }
            }
        }

        Ok(())
    }
}

/// Escape a literal value so interpolation leaves it untouched.
pub fn escape(value: &str) -> String {
    value.replace('$', "$$")
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file cannot be read.
    #[error("failed to read configuration file {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Configuration file is not valid UTF-8.
    #[error("configuration file {:?} is not valid UTF-8", path.display())]
    Encoding {
        #[source]
        source: std::string::FromUtf8Error,
        path: PathBuf,
    },

    /// Key/value line appears before any section header.
    #[error("line {line}: key/value pair outside of any section")]
    MissingSectionHeader { line: usize },

    /// Line is neither a section header, comment, nor key/value pair.
    #[error("line {line}: cannot parse {content:?}")]
    Parse { line: usize, content: String },

    /// Section defined twice.
    #[error("line {line}: duplicate section {name:?}")]
    DuplicateSection { line: usize, name: String },

    /// Key defined twice within one section.
    #[error("line {line}: duplicate key {key:?}")]
    DuplicateKey { line: usize, key: String },

    /// Requested section does not exist.
    #[error("no section {name:?}")]
    MissingSection { name: String },

    /// Interpolation refers to an unknown section or key.
    #[error("[{section}] {key}: bad interpolation reference ${{{reference}}}")]
    InterpolationMissing {
        section: String,
        key: String,
        reference: String,
    },

    /// Malformed `$` expression.
    #[error("[{section}] {key}: '$' must be followed by '$' or '{{', found {rest:?}")]
    InterpolationSyntax {
        section: String,
        key: String,
        rest: String,
    },

    /// Interpolation nested too deeply, most likely a reference cycle.
    #[error("[{section}] {key}: interpolation nested deeper than {}", MAX_INTERPOLATION_DEPTH)]
    InterpolationDepth { section: String, key: String },
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
