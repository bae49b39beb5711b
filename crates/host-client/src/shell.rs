//! Remote shell
//!
//! Commands run through the system `ssh` binary. One master connection per
//! host is opened with `ControlMaster`; every command then multiplexes over
//! the control socket.

use crate::error::HostError;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Exit code (-1 when killed by a signal)
    pub exit_code: i32,
}

impl ExecOutput {
    /// Exit code zero
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Quote a string for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=,@%+".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Quote and join arguments
pub fn shell_join<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| shell_quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Command execution and file management on one host
///
/// File helpers are expressed with plain POSIX tools on top of `exec` so
/// that any shell transport gets them for free.
#[async_trait::async_trait]
pub trait RemoteShell: Send + Sync {
    /// Host address
    fn address(&self) -> &str;

    /// Run a command, optionally feeding `stdin`
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<ExecOutput, HostError>;

    /// Run a command and return stdout, failing on non-zero exit
    async fn run(&self, command: &str) -> Result<String, HostError> {
        let output = self.exec(command, None).await?;
        check(self.address(), command, output)
    }

    /// Create directories (with parents)
    async fn make_dirs(&self, paths: &[String]) -> Result<(), HostError> {
        if paths.is_empty() {
            return Ok(());
        }
        self.run(&format!("mkdir -p {}", shell_join(paths))).await?;
        Ok(())
    }

    /// Atomically install `content` at `path` unless identical; returns whether it changed
    async fn write_file(&self, path: &str, content: &[u8], mode: u32) -> Result<bool, HostError> {
        let p = shell_quote(path);
        let command = format!(
            "f=$(mktemp) && cat > \"$f\" && if cmp -s \"$f\" {p}; then rm -f \"$f\"; echo unchanged; \
             else install -D -m {mode:o} \"$f\" {p} && rm -f \"$f\" && echo changed; fi"
        );
        let output = self.exec(&command, Some(content)).await?;
        let stdout = check(self.address(), &command, output)?;
        Ok(stdout.trim() == "changed")
    }

    /// Read a file, `None` if absent
    async fn read_file(&self, path: &str) -> Result<Option<String>, HostError> {
        let command = format!("test -f {p} && cat {p}", p = shell_quote(path));
        let output = self.exec(&command, None).await?;
        match output.exit_code {
            0 => Ok(Some(output.stdout)),
            1 => Ok(None),
            _ => check(self.address(), &command, output).map(Some),
        }
    }

    /// Regular files directly inside the given directories
    async fn list_files(&self, dirs: &[String]) -> Result<BTreeSet<String>, HostError> {
        let command = format!(
            "find {} -maxdepth 1 -type f 2>/dev/null; true",
            shell_join(dirs)
        );
        let stdout = self.run(&command).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Remove files or directories recursively
    async fn remove_paths(&self, paths: &[String]) -> Result<(), HostError> {
        if paths.is_empty() {
            return Ok(());
        }
        self.run(&format!("rm -rf {}", shell_join(paths))).await?;
        Ok(())
    }

    /// `systemctl is-active` state of a unit
    async fn unit_state(&self, unit: &str) -> Result<String, HostError> {
        let output = self
            .exec(&format!("systemctl is-active {}", shell_quote(unit)), None)
            .await?;
        Ok(output.stdout.trim().to_string())
    }

    /// Tear down the underlying connection
    async fn close(&self) -> Result<(), HostError> {
        Ok(())
    }
}

fn check(address: &str, command: &str, output: ExecOutput) -> Result<String, HostError> {
    if output.success() {
        Ok(output.stdout)
    } else {
        Err(HostError::Exec {
            address: address.to_string(),
            command: command.to_string(),
            code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// SSH connection settings shared by every host
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Private key file (`-i`)
    pub identity_file: Option<PathBuf>,
    /// Port
    pub port: u16,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Directory for control sockets
    pub control_dir: PathBuf,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            identity_file: None,
            port: 22,
            connect_timeout: Duration::from_secs(10),
            control_dir: std::env::temp_dir(),
        }
    }
}

/// Remote shell over a multiplexed SSH connection
#[derive(Debug)]
pub struct SshShell {
    address: String,
    destination: String,
    config: SshConfig,
    control_path: PathBuf,
}

impl SshShell {
    /// Open the master connection to `user@address`
    pub async fn connect(address: &str, user: &str, config: SshConfig) -> Result<Self, HostError> {
        let control_path = config
            .control_dir
            .join(format!("cke-{}-{}.sock", user, address.replace([':', '/'], "_")));
        let shell = Self {
            address: address.to_string(),
            destination: format!("{user}@{address}"),
            config,
            control_path,
        };

        let mut cmd = shell.ssh_command();
        cmd.args(["-M", "-N", "-f", "-o", "ControlPersist=yes"])
            .arg(&shell.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(HostError::Connect {
                address: shell.address.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        info!("Opened SSH master connection to {}", shell.destination);
        Ok(shell)
    }

    fn ssh_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .args(["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=no"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout.as_secs().max(1)))
            .arg("-p")
            .arg(self.config.port.to_string());
        if let Some(identity) = &self.config.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd
    }
}

#[async_trait::async_trait]
impl RemoteShell for SshShell {
    fn address(&self) -> &str {
        &self.address
    }

    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<ExecOutput, HostError> {
        debug!("ssh {}: {}", self.destination, command);
        let mut cmd = self.ssh_command();
        cmd.arg(&self.destination)
            .arg("--")
            .arg(command)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn()?;
        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(data).await?;
            pipe.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        // ssh reserves 255 for its own failures.
        if exit_code == 255 {
            return Err(HostError::Connect {
                address: self.address.clone(),
                message: stderr.trim().to_string(),
            });
        }
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
            exit_code,
        })
    }

    async fn close(&self) -> Result<(), HostError> {
        let mut cmd = self.ssh_command();
        cmd.args(["-O", "exit"])
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd.status().await?;
        debug!("Closed SSH master connection to {}", self.destination);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/etc/cke/pki"), "/etc/cke/pki");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("{{.Names}}"), "'{{.Names}}'");
    }

    #[test]
    fn test_shell_join() {
        assert_eq!(
            shell_join(&["mkdir", "-p", "/var/lib/my dir"]),
            "mkdir -p '/var/lib/my dir'"
        );
    }

    #[test]
    fn test_exec_output_success() {
        let ok = ExecOutput::default();
        assert!(ok.success());
        let failed = ExecOutput {
            exit_code: 2,
            ..Default::default()
        };
        assert!(!failed.success());
    }
}
