// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote host control.
//!
//! Tasks change hosts exclusively through the [`Remote`] trait. The default
//! implementation, [`SshRemote`], shells out to the system's `ssh` binary,
//! so the operator's own ssh configuration (keys, agents, jump hosts) applies
//! unchanged.

use std::{
    ffi::{OsStr, OsString},
    io::Write,
    path::Path,
    process::{Command, Stdio},
};
use tracing::{debug, info, instrument};

/// Side effects on remote hosts.
pub trait Remote {
    /// Run shell command as the connecting user, returning its stdout.
    fn run(&self, host: &str, command: &str) -> Result<String>;

    /// Run shell command with root privileges, or as `user` if given.
    fn sudo(&self, host: &str, command: &str, user: Option<&str>) -> Result<String>;

    /// Check if path exists.
    fn exists(&self, host: &str, path: &Path) -> Result<bool>;

    /// Write contents to file with root privileges.
    fn put(&self, host: &str, dest: &Path, contents: &[u8], mode: Option<&str>) -> Result<()>;

    /// Copy local file to host with root privileges.
    fn upload(&self, host: &str, source: &Path, dest: &Path) -> Result<()>;

    /// Remove file, or directory tree if recursive.
    fn remove(&self, host: &str, path: &Path, recursive: bool) -> Result<()>;
}

/// Remote host control through the `ssh` binary.
#[derive(Debug, Clone)]
pub struct SshRemote {
    program: OsString,
    options: Vec<OsString>,
}

impl Default for SshRemote {
    fn default() -> Self {
        Self::new("ssh")
    }
}

impl SshRemote {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            options: Vec::new(),
        }
    }

    /// Pass extra options to every ssh invocation.
    pub fn with_options(mut self, options: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        self.options.extend(options.into_iter().map(Into::into));
        self
    }

    fn expand_bin_args(&self, host: &str, command: &str) -> Vec<OsString> {
        let mut bin_args = self.options.clone();
        bin_args.extend([host.into(), "--".into(), command.into()]);
        bin_args
    }

    fn status(&self, host: &str, command: &str) -> Result<bool> {
        let output = Command::new(&self.program)
            .args(self.expand_bin_args(host, command))
            .stdin(Stdio::null())
            .output()
            .map_err(|source| RemoteError::Spawn {
                source,
                program: self.program.clone(),
            })?;

        Ok(output.status.success())
    }
}

impl Remote for SshRemote {
    #[instrument(skip(self), level = "debug")]
    fn run(&self, host: &str, command: &str) -> Result<String> {
        info!("[{host}] run: {command}");
        syscall_non_interactive(
            &self.program,
            self.expand_bin_args(host, command),
            None,
            host,
            command,
        )
    }

    #[instrument(skip(self), level = "debug")]
    fn sudo(&self, host: &str, command: &str, user: Option<&str>) -> Result<String> {
        info!("[{host}] sudo: {command}");
        let wrapped = sudo_command(command, user)?;
        syscall_non_interactive(
            &self.program,
            self.expand_bin_args(host, &wrapped),
            None,
            host,
            command,
        )
    }

    fn exists(&self, host: &str, path: &Path) -> Result<bool> {
        let command = format!("test -e {}", quote(&path.to_string_lossy())?);
        let exists = self.status(host, &sudo_command(&command, None)?)?;
        debug!("[{host}] {:?} exists: {exists}", path.display());
        Ok(exists)
    }

    #[instrument(skip(self, contents), level = "debug")]
    fn put(&self, host: &str, dest: &Path, contents: &[u8], mode: Option<&str>) -> Result<()> {
        let dest = quote(&dest.to_string_lossy())?;
        let mut command = format!("tee {dest} > /dev/null");
        if let Some(mode) = mode {
            command.push_str(&format!(" && chmod {} {dest}", quote(mode)?));
        }

        let wrapped = sudo_command(&command, None)?;
        syscall_non_interactive(
            &self.program,
            self.expand_bin_args(host, &wrapped),
            Some(contents),
            host,
            &command,
        )?;

        Ok(())
    }

    fn upload(&self, host: &str, source: &Path, dest: &Path) -> Result<()> {
        info!("[{host}] upload {:?} to {:?}", source.display(), dest.display());
        let contents = std::fs::read(source).map_err(|err| RemoteError::LocalRead {
            source: err,
            path: source.to_path_buf(),
        })?;

        self.put(host, dest, &contents, None)
    }

    fn remove(&self, host: &str, path: &Path, recursive: bool) -> Result<()> {
        let flags = if recursive { "-rf" } else { "-f" };
        let command = format!("rm {flags} {}", quote(&path.to_string_lossy())?);
        self.sudo(host, &command, None)?;

        Ok(())
    }
}

/// Quote a single word for a POSIX shell.
///
/// # Errors
///
/// - Return [`RemoteError::Quote`] if the word contains a nul byte.
pub fn quote(word: &str) -> Result<String> {
    Ok(shlex::try_quote(word)?.into_owned())
}

/// Wrap command so it runs through `sudo`.
///
/// The command runs in a fresh `bash` so redirections and `&&` chains are
/// evaluated with the target user's privileges.
pub fn sudo_command(command: &str, user: Option<&str>) -> Result<String> {
    let user = match user {
        Some(user) => format!("-u {} ", quote(user)?),
        None => String::new(),
    };

    Ok(format!("sudo -H {user}bash -c {}", quote(command)?))
}

fn syscall_non_interactive(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
    stdin: Option<&[u8]>,
    host: &str,
    command: &str,
) -> Result<String> {
    let spawn_error = |source| RemoteError::Spawn {
        source,
        program: cmd.as_ref().to_os_string(),
    };

    let mut child = Command::new(cmd.as_ref())
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(spawn_error)?;

    if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(data).map_err(spawn_error)?;
    }

    let output = child.wait_with_output().map_err(spawn_error)?;
    let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(output.stderr.as_slice());
        return Err(RemoteError::Command {
            host: host.to_string(),
            command: command.to_string(),
            message: stderr.trim_end().to_string(),
        });
    }

    // INVARIANT: Chomp trailing newlines.
    Ok(stdout.trim_end_matches(['\r', '\n']).to_string())
}

/// Remote host control error types.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Local helper program cannot be run.
    #[error("failed to run {program:?}")]
    Spawn {
        #[source]
        source: std::io::Error,
        program: OsString,
    },

    /// Command exits with failure on remote host.
    #[error("[{host}] command {command:?} failed: {message}")]
    Command {
        host: String,
        command: String,
        message: String,
    },

    /// Local file to upload cannot be read.
    #[error("failed to read {:?}", path.display())]
    LocalRead {
        #[source]
        source: std::io::Error,
        path: std::path::PathBuf,
    },

    /// Word cannot be quoted for the shell.
    #[error(transparent)]
    Quote(#[from] shlex::QuoteError),
}

/// Friendly result alias :3
pub type Result<T, E = RemoteError> = std::result::Result<T, E>;
