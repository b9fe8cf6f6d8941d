use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;
use semver::Version;
use tracing::{debug, info};

use crate::{Error, Result};

static VERSION_REGEX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"v(\d+\.\d+\.\d+)(?:\s+\((legacy|nf_tables)\))?").ok());

/// First iptables-restore release that takes the xtables lock itself.
const RESTORE_LOCK_VERSION: Version = Version::new(1, 6, 2);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BackendMode {
    #[default]
    Legacy,
    Nft,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Features {
    pub version: Version,
    pub mode: BackendMode,
    /// The restore binary acquires the xtables lock on its own.
    pub restore_supports_lock: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            version: Version::new(1, 4, 21),
            mode: BackendMode::Legacy,
            restore_supports_lock: false,
        }
    }
}

impl Features {
    pub fn nftables(&self) -> bool {
        self.mode == BackendMode::Nft
    }

    /// Parses the output of `iptables --version`, e.g.
    /// `iptables v1.8.7 (nf_tables)`.
    pub fn from_version_output(output: &str) -> Result<Self> {
        let regex = VERSION_REGEX
            .as_ref()
            .ok_or_else(|| Error::VersionParse("invalid version pattern".into()))?;
        let captures = regex
            .captures(output)
            .ok_or_else(|| Error::VersionParse(output.trim().to_owned()))?;
        let version = Version::parse(&captures[1])
            .map_err(|e| Error::VersionParse(format!("{}: {e}", &captures[1])))?;
        let mode = match captures.get(2).map(|m| m.as_str()) {
            Some("nf_tables") => BackendMode::Nft,
            _ => BackendMode::Legacy,
        };
        Ok(Self {
            restore_supports_lock: version >= RESTORE_LOCK_VERSION,
            version,
            mode,
        })
    }
}

/// Runs `<command> --version` and parses the result.
pub fn detect(command: &str) -> Result<Features> {
    let output = Command::new(command).arg("--version").output()?;
    if !output.status.success() {
        return Err(Error::CommandFailed {
            command: format!("{command} --version"),
            message: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    debug!(%stdout, "iptables version output");
    let features = Features::from_version_output(&stdout)?;
    info!(
        version = %features.version,
        mode = ?features.mode,
        restore_supports_lock = features.restore_supports_lock,
        "detected iptables features"
    );
    Ok(features)
}
