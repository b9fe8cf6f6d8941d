use std::io::Write;
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::debug;

use crate::features::{BackendMode, Features};
use crate::{Error, Result};

/// Reads and writes one table in the `iptables-save` text format.
pub trait Backend: Send {
    fn save(&self, table: &str) -> Result<String>;
    fn restore(&self, input: &str) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    fn command_prefix(&self) -> &'static str {
        match self {
            IpVersion::V4 => "iptables",
            IpVersion::V6 => "ip6tables",
        }
    }
}

/// Shells out to the `*-save` and `*-restore` binaries.
#[derive(Clone, Debug)]
pub struct CommandBackend {
    save_cmd: String,
    restore_cmd: String,
    /// Passed as `--wait` when restore takes the lock itself.
    native_lock_wait: Option<Duration>,
}

impl CommandBackend {
    pub fn new(ip_version: IpVersion, features: &Features, lock_timeout: Duration) -> Self {
        let prefix = ip_version.command_prefix();
        let flavour = match features.mode {
            BackendMode::Legacy => "legacy",
            BackendMode::Nft => "nft",
        };
        Self {
            save_cmd: format!("{prefix}-{flavour}-save"),
            restore_cmd: format!("{prefix}-{flavour}-restore"),
            native_lock_wait: features.restore_supports_lock.then_some(lock_timeout),
        }
    }

    /// Uses the unsuffixed binaries, whatever mode they were built with.
    pub fn system(ip_version: IpVersion, features: &Features, lock_timeout: Duration) -> Self {
        let prefix = ip_version.command_prefix();
        Self {
            save_cmd: format!("{prefix}-save"),
            restore_cmd: format!("{prefix}-restore"),
            native_lock_wait: features.restore_supports_lock.then_some(lock_timeout),
        }
    }
}

impl Backend for CommandBackend {
    fn save(&self, table: &str) -> Result<String> {
        let output = Command::new(&self.save_cmd).args(["-t", table]).output()?;
        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: format!("{} -t {table}", self.save_cmd),
                message: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn restore(&self, input: &str) -> Result<()> {
        let mut args = vec!["--noflush".to_owned()];
        if let Some(wait) = self.native_lock_wait {
            args.push("--wait".to_owned());
            args.push(wait.as_secs().max(1).to_string());
        }
        debug!(command = %self.restore_cmd, ?args, "running restore");
        let mut child = Command::new(&self.restore_cmd)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: format!("{} {}", self.restore_cmd, args.join(" ")),
                message: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }
}
