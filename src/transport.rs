// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote execution transport.
//!
//! Hostenv never talks to a deployment target directly. Instead, every file
//! transfer and command execution goes through a [`Transport`]. The default
//! transport shells out to the system's `ssh` binary, so connection settings,
//! agents, jump hosts, and timeouts all come from the user's own SSH setup.
//!
//! # Whole-File Stores
//!
//! All transports store files by first writing a sibling temporary file, and
//! then renaming it over the destination. A store that fails half way through
//! never leaves a truncated file behind.

use crate::config::Target;

use std::{
    ffi::OsString,
    fs::{self, File},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
};
use tracing::{debug, instrument};

/// Primitive capabilities needed from a deployment target.
pub trait Transport {
    /// Retrieve full contents of file relative to working directory.
    ///
    /// Returns `None` if the file does not exist.
    fn retrieve(&self, path: &Path) -> Result<Option<Vec<u8>>>;

    /// Store full contents of file relative to working directory.
    fn store(&self, path: &Path, contents: &[u8]) -> Result<()>;

    /// Run shell command inside working directory, returning its stdout.
    fn run(&self, command: &str) -> Result<String>;
}

/// Transport through the system's `ssh` binary.
#[derive(Debug, Clone)]
pub struct SshTransport {
    destination: String,
    port: Option<u16>,
    identity: Option<PathBuf>,
    work_dir: Option<String>,
    program: OsString,
}

impl SshTransport {
    /// Construct new SSH transport to `[user@]host`.
    pub fn new(host: impl Into<String>, user: Option<&str>) -> Self {
        let host = host.into();
        let destination = match user {
            Some(user) => format!("{user}@{host}"),
            None => host,
        };

        Self {
            destination,
            port: None,
            identity: None,
            work_dir: None,
            program: "ssh".into(),
        }
    }

    /// Connect to non-default SSH port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Authenticate with given private key.
    pub fn with_identity(mut self, identity: impl Into<PathBuf>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Run everything inside given remote working directory.
    pub fn with_work_dir(mut self, work_dir: impl Into<String>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }

    /// Use another program in place of `ssh`.
    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    fn expand_bin_args(&self, script: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-o".into(), "BatchMode=yes".into()];

        if let Some(port) = self.port {
            args.extend(["-p".into(), port.to_string().into()]);
        }

        if let Some(identity) = &self.identity {
            args.extend(["-i".into(), identity.as_os_str().to_owned()]);
        }

        args.push(self.destination.clone().into());
        args.push("--".into());
        args.push(self.in_work_dir(script).into());

        args
    }

    fn in_work_dir(&self, script: &str) -> String {
        match &self.work_dir {
            Some(work_dir) => format!("cd {} && {script}", remote_dir(work_dir)),
            None => script.to_string(),
        }
    }
}

impl Transport for SshTransport {
    #[instrument(skip(self), level = "debug")]
    fn retrieve(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let path = quote(path.to_string_lossy());
        let script = format!("if [ -f {path} ]; then printf 'found\\n'; cat {path}; fi");
        let output = syscall_non_interactive(&self.program, self.expand_bin_args(&script), None)?;

        // INVARIANT: Remote side announces existing file before its contents.
        Ok(output.strip_prefix(b"found\n").map(<[u8]>::to_vec))
    }

    #[instrument(skip(self, contents), level = "debug")]
    fn store(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let path = quote(path.to_string_lossy());

        // INVARIANT: Staged file takes on mode of file it replaces, falling
        //   back to the umask for new files.
        let script = format!(
            "[ ! -d {path} ] && tmp=$(mktemp {path}.XXXXXX) && cat > \"$tmp\" \
             && {{ {{ [ -e {path} ] && chmod --reference={path} \"$tmp\"; }} \
             || chmod \"$(umask -S),a-x\" \"$tmp\"; }} \
             && mv -f \"$tmp\" {path} || {{ rm -f \"$tmp\"; exit 1; }}"
        );
        syscall_non_interactive(
            &self.program,
            self.expand_bin_args(&script),
            Some(contents),
        )?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn run(&self, command: &str) -> Result<String> {
        let output = syscall_non_interactive(&self.program, self.expand_bin_args(command), None)?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }
}

/// Transport to a working directory on this machine.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    work_dir: PathBuf,
}

impl LocalTransport {
    /// Construct new local transport rooted at `work_dir`.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    fn temp_path(&self, path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{}.tmp", std::process::id()));
        self.work_dir.join(path).with_file_name(name)
    }
}

impl Transport for LocalTransport {
    #[instrument(skip(self), level = "debug")]
    fn retrieve(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let full_path = self.work_dir.join(path);
        match fs::read(&full_path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(TransportError::Read {
                source: err,
                path: full_path,
            }),
        }
    }

    #[instrument(skip(self, contents), level = "debug")]
    fn store(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let full_path = self.work_dir.join(path);
        let temp_path = self.temp_path(path);
        debug!("stage {} through {}", full_path.display(), temp_path.display());

        let staged = File::create(&temp_path)
            .and_then(|mut file| {
                file.write_all(contents)?;

                // INVARIANT: Keep permissions of file being replaced.
                if let Ok(metadata) = fs::metadata(&full_path) {
                    file.set_permissions(metadata.permissions())?;
                }

                file.sync_all()
            })
            .and_then(|_| fs::rename(&temp_path, &full_path));

        // INVARIANT: Never leave temporary file behind on failure.
        if let Err(err) = staged {
            let _ = fs::remove_file(&temp_path);
            return Err(TransportError::Write {
                source: err,
                path: full_path,
            });
        }

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn run(&self, command: &str) -> Result<String> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.work_dir)
            .output()
            .map_err(|err| TransportError::Spawn {
                source: err,
                program: "sh".into(),
            })?;
        let output = check_output("sh", output)?;

        Ok(String::from_utf8_lossy(&output).into_owned())
    }
}

/// Transport picked from target settings.
#[derive(Debug, Clone)]
pub enum TargetTransport {
    /// Remote target over SSH.
    Ssh(SshTransport),

    /// Local target.
    Local(LocalTransport),
}

impl From<&Target> for TargetTransport {
    fn from(target: &Target) -> Self {
        match &target.host {
            Some(host) => {
                let mut ssh = SshTransport::new(host, target.user.as_deref());
                if let Some(port) = target.port {
                    ssh = ssh.with_port(port);
                }

                if let Some(identity) = &target.identity {
                    ssh = ssh.with_identity(identity);
                }

                if let Some(work_dir) = &target.work_dir {
                    ssh = ssh.with_work_dir(work_dir);
                }

                Self::Ssh(ssh)
            }
            None => Self::Local(LocalTransport::new(
                target.work_dir.as_deref().unwrap_or("."),
            )),
        }
    }
}

impl Transport for TargetTransport {
    fn retrieve(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Ssh(ssh) => ssh.retrieve(path),
            Self::Local(local) => local.retrieve(path),
        }
    }

    fn store(&self, path: &Path, contents: &[u8]) -> Result<()> {
        match self {
            Self::Ssh(ssh) => ssh.store(path, contents),
            Self::Local(local) => local.store(path, contents),
        }
    }

    fn run(&self, command: &str) -> Result<String> {
        match self {
            Self::Ssh(ssh) => ssh.run(command),
            Self::Local(local) => local.run(command),
        }
    }
}

/// Quote string for POSIX shells.
///
/// Wraps the string in single quotes, and splices in escaped single quotes
/// wherever the string contains one.
pub fn quote(value: impl AsRef<str>) -> String {
    format!("'{}'", value.as_ref().replace('\'', r"'\''"))
}

// INVARIANT: Leave leading tilde unquoted so the remote shell expands it.
fn remote_dir(work_dir: &str) -> String {
    match work_dir.strip_prefix("~/") {
        Some(rest) => format!("~/{}", quote(rest)),
        None if work_dir == "~" => "~".into(),
        None => quote(work_dir),
    }
}

fn syscall_non_interactive(
    program: &OsString,
    args: impl IntoIterator<Item = OsString>,
    stdin: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let spawn_err = |err| TransportError::Spawn {
        source: err,
        program: program.to_string_lossy().into_owned(),
    };

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(spawn_err)?;

    // INVARIANT: Broken pipe means the program bailed early, so let its exit
    //   status do the talking.
    if let (Some(contents), Some(mut pipe)) = (stdin, child.stdin.take()) {
        match pipe.write_all(contents) {
            Err(err) if err.kind() != ErrorKind::BrokenPipe => return Err(spawn_err(err)),
            _ => {}
        }
    }

    let output = child.wait_with_output().map_err(spawn_err)?;
    check_output(program.to_string_lossy().as_ref(), output)
}

fn check_output(program: &str, output: Output) -> Result<Vec<u8>> {
    if output.status.success() {
        return Ok(output.stdout);
    }

    let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();

    // INVARIANT: Chomp trailing newlines.
    let stderr = stderr
        .strip_suffix("\r\n")
        .or(stderr.strip_suffix('\n'))
        .map(ToString::to_string)
        .unwrap_or(stderr);

    Err(TransportError::Syscall {
        program: program.to_string(),
        code: output.status.code(),
        stderr,
    })
}

/// Transport error types.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Program could not be started or talked to.
    #[error("failed to run {program:?}")]
    Spawn {
        #[source]
        source: std::io::Error,
        program: String,
    },

    /// Program exited unsuccessfully.
    #[error("command {program:?} failed with exit code {code:?}:\n{stderr}")]
    Syscall {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Local file cannot be read.
    #[error("failed to read from {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Local file cannot be written.
    #[error("failed to write to {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

impl TransportError {
    /// Exit code of failed command, if any.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Syscall { code, .. } => *code,
            _ => None,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = TransportError> = std::result::Result<T, E>;
