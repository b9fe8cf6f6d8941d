use std::collections::{BTreeMap, BTreeSet};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ipnetwork::IpNetwork;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::{Error, Result};

/// Kernel limit on set names, excluding the terminating NUL.
pub const MAX_IPSET_NAME_LEN: usize = 31;

pub const PREFIX_SRC_V4: &str = "egress-src-v4-";
pub const PREFIX_SRC_V6: &str = "egress-src-v6-";
pub const PREFIX_DST_V4: &str = "egress-dst-v4-";
pub const PREFIX_DST_V6: &str = "egress-dst-v6-";
pub const IGNORE_V4: &str = "egress-ignore-cidr-v4";
pub const IGNORE_V6: &str = "egress-ignore-cidr-v6";

/// Every set the agent manages starts with this.
pub const OWNED_PREFIX: &str = "egress-";

/// Derives a set name from `prefix` and an arbitrary key. The key is hashed
/// so the result never exceeds [`MAX_IPSET_NAME_LEN`].
pub fn format_ipset_name(prefix: &str, name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    let mut set_name = format!("{prefix}{}", URL_SAFE_NO_PAD.encode(digest));
    set_name.truncate(MAX_IPSET_NAME_LEN);
    set_name
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IpFamily {
    Inet,
    Inet6,
}

impl IpFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpFamily::Inet => "inet",
            IpFamily::Inet6 => "inet6",
        }
    }

    pub fn matches(&self, net: &IpNetwork) -> bool {
        match self {
            IpFamily::Inet => net.is_ipv4(),
            IpFamily::Inet6 => net.is_ipv6(),
        }
    }
}

/// Canonical form `ipset list` prints for a `hash:net` member: host routes
/// lose their prefix and networks are masked. `None` for unparsable input.
pub fn normalize_entry(entry: &str) -> Option<String> {
    let net: IpNetwork = entry.trim().parse().ok()?;
    let max_prefix = if net.is_ipv4() { 32 } else { 128 };
    if net.prefix() == max_prefix {
        return Some(net.ip().to_string());
    }
    let masked = IpNetwork::new(net.network(), net.prefix()).ok()?;
    Some(masked.to_string())
}

/// `hash:net` sets as exposed by the `ipset` tool.
pub trait IpSet: Send + Sync {
    /// Succeeds when the set already exists.
    fn create(&self, name: &str, family: IpFamily) -> Result<()>;
    fn destroy(&self, name: &str) -> Result<()>;
    fn add(&self, name: &str, entry: &str) -> Result<()>;
    fn del(&self, name: &str, entry: &str) -> Result<()>;
    fn list(&self, name: &str) -> Result<Vec<String>>;
    fn list_names(&self) -> Result<Vec<String>>;
}

/// Shells out to the `ipset` binary.
#[derive(Clone, Debug)]
pub struct CommandIpSet {
    command: String,
}

impl Default for CommandIpSet {
    fn default() -> Self {
        Self {
            command: "ipset".into(),
        }
    }
}

impl CommandIpSet {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        debug!(command = %self.command, ?args, "running ipset");
        let output = Command::new(&self.command).args(args).output()?;
        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: format!("{} {}", self.command, args.join(" ")),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl IpSet for CommandIpSet {
    fn create(&self, name: &str, family: IpFamily) -> Result<()> {
        self.run(&[
            "create",
            name,
            "hash:net",
            "family",
            family.as_str(),
            "-exist",
        ])?;
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<()> {
        self.run(&["destroy", name])?;
        Ok(())
    }

    fn add(&self, name: &str, entry: &str) -> Result<()> {
        self.run(&["add", name, entry, "-exist"])?;
        Ok(())
    }

    fn del(&self, name: &str, entry: &str) -> Result<()> {
        self.run(&["del", name, entry, "-exist"])?;
        Ok(())
    }

    fn list(&self, name: &str) -> Result<Vec<String>> {
        Ok(parse_members(&self.run(&["list", name])?))
    }

    fn list_names(&self) -> Result<Vec<String>> {
        Ok(self
            .run(&["list", "-n"])?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect())
    }
}

/// Entries following the `Members:` header of `ipset list` output.
pub fn parse_members(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.starts_with("Members:"))
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_owned)
        .collect()
}

#[derive(Clone, Debug)]
struct MemorySet {
    family: IpFamily,
    members: BTreeSet<String>,
}

/// In-process sets with the same error behaviour as the tool for missing
/// sets.
#[derive(Clone, Debug, Default)]
pub struct MemoryIpSet {
    sets: Arc<Mutex<BTreeMap<String, MemorySet>>>,
}

impl MemoryIpSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn sets(&self) -> MutexGuard<'_, BTreeMap<String, MemorySet>> {
        self.sets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn members(&self, name: &str) -> Option<Vec<String>> {
        self.sets()
            .get(name)
            .map(|s| s.members.iter().cloned().collect())
    }

    pub fn family(&self, name: &str) -> Option<IpFamily> {
        self.sets().get(name).map(|s| s.family)
    }

    fn missing(command: &str, name: &str) -> Error {
        Error::CommandFailed {
            command: format!("ipset {command} {name}"),
            message: "The set with the given name does not exist".into(),
        }
    }
}

impl IpSet for MemoryIpSet {
    fn create(&self, name: &str, family: IpFamily) -> Result<()> {
        self.sets()
            .entry(name.to_owned())
            .or_insert_with(|| MemorySet {
                family,
                members: BTreeSet::new(),
            });
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<()> {
        self.sets()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::missing("destroy", name))
    }

    fn add(&self, name: &str, entry: &str) -> Result<()> {
        let mut sets = self.sets();
        let set = sets.get_mut(name).ok_or_else(|| Self::missing("add", name))?;
        set.members.insert(entry.to_owned());
        Ok(())
    }

    fn del(&self, name: &str, entry: &str) -> Result<()> {
        let mut sets = self.sets();
        let set = sets.get_mut(name).ok_or_else(|| Self::missing("del", name))?;
        set.members.remove(entry);
        Ok(())
    }

    fn list(&self, name: &str) -> Result<Vec<String>> {
        self.members(name)
            .ok_or_else(|| Self::missing("list", name))
    }

    fn list_names(&self) -> Result<Vec<String>> {
        Ok(self.sets().keys().cloned().collect())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpSetSpec {
    pub family: IpFamily,
    pub members: BTreeSet<String>,
}

impl IpSetSpec {
    /// Keeps the entries of `family`, normalized. Invalid entries are
    /// skipped.
    pub fn from_entries<'a, I>(family: IpFamily, entries: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let members = entries
            .into_iter()
            .filter_map(|e| {
                let net: IpNetwork = e.trim().parse().ok()?;
                family.matches(&net).then(|| normalize_entry(e)).flatten()
            })
            .collect();
        Self { family, members }
    }
}

/// Desired set membership in front of an [`IpSet`]. Only the difference
/// between the cached and desired members is written.
pub struct IpSetManager<S: IpSet> {
    ipset: S,
    owned_prefix: String,
    desired: BTreeMap<String, IpSetSpec>,
    cache: BTreeMap<String, BTreeSet<String>>,
    loaded: bool,
}

impl<S: IpSet> IpSetManager<S> {
    pub fn new(ipset: S, owned_prefix: impl Into<String>) -> Self {
        Self {
            ipset,
            owned_prefix: owned_prefix.into(),
            desired: BTreeMap::new(),
            cache: BTreeMap::new(),
            loaded: false,
        }
    }

    pub fn ipset(&self) -> &S {
        &self.ipset
    }

    pub fn set_desired(&mut self, desired: BTreeMap<String, IpSetSpec>) {
        self.desired = desired;
    }

    /// Forgets the cache so the next update re-reads every owned set.
    pub fn invalidate(&mut self) {
        self.loaded = false;
        self.cache.clear();
    }

    fn load(&mut self) -> Result<()> {
        self.cache.clear();
        for name in self.ipset.list_names()? {
            if !name.starts_with(&self.owned_prefix) {
                continue;
            }
            let members = self.ipset.list(&name)?.into_iter().collect();
            self.cache.insert(name, members);
        }
        debug!(sets = self.cache.len(), "loaded ipsets");
        self.loaded = true;
        Ok(())
    }

    /// Creates missing sets and converges members. Stale sets are left for
    /// [`IpSetManager::apply_deletions`], after the rules using them are gone.
    pub fn apply_updates(&mut self) -> Result<()> {
        if !self.loaded {
            self.load()?;
        }
        for (name, spec) in &self.desired {
            if !self.cache.contains_key(name) {
                self.ipset.create(name, spec.family)?;
                info!(set = %name, family = spec.family.as_str(), "created ipset");
            }
            let current = self.cache.entry(name.clone()).or_default();
            let missing: Vec<String> = spec.members.difference(current).cloned().collect();
            for entry in missing {
                self.ipset.add(name, &entry)?;
                current.insert(entry);
            }
            let extra: Vec<String> = current.difference(&spec.members).cloned().collect();
            for entry in extra {
                self.ipset.del(name, &entry)?;
                current.remove(&entry);
            }
        }
        Ok(())
    }

    pub fn apply_deletions(&mut self) -> Result<()> {
        let stale: Vec<String> = self
            .cache
            .keys()
            .filter(|name| !self.desired.contains_key(*name))
            .cloned()
            .collect();
        for name in stale {
            self.ipset.destroy(&name)?;
            self.cache.remove(&name);
            info!(set = %name, "destroyed ipset");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(family: IpFamily, entries: &[&str]) -> IpSetSpec {
        IpSetSpec::from_entries(family, entries.iter().copied())
    }

    #[test]
    fn test_format_ipset_name() {
        let name = format_ipset_name(PREFIX_SRC_V4, "policy1");
        assert_eq!(name, format_ipset_name(PREFIX_SRC_V4, "policy1"));
        assert!(name.len() <= MAX_IPSET_NAME_LEN);
        assert!(name.starts_with(PREFIX_SRC_V4));
        assert_ne!(name, format_ipset_name(PREFIX_SRC_V4, "policy2"));
        assert_ne!(name, format_ipset_name(PREFIX_DST_V4, "policy1"));

        let long = format_ipset_name(PREFIX_SRC_V6, &"x".repeat(300));
        assert_eq!(long.len(), MAX_IPSET_NAME_LEN);
    }

    #[test]
    fn test_normalize_entry() {
        assert_eq!(normalize_entry("10.0.0.5/24").as_deref(), Some("10.0.0.0/24"));
        assert_eq!(normalize_entry("10.0.0.5/32").as_deref(), Some("10.0.0.5"));
        assert_eq!(normalize_entry("10.0.0.5").as_deref(), Some("10.0.0.5"));
        assert_eq!(normalize_entry("fd00::1/64").as_deref(), Some("fd00::/64"));
        assert_eq!(normalize_entry("nonsense"), None);
    }

    #[test]
    fn test_spec_filters_family() {
        let v4 = spec(IpFamily::Inet, &["10.0.0.1", "fd00::1", "bad", "10.1.0.0/16"]);
        assert_eq!(
            v4.members.into_iter().collect::<Vec<_>>(),
            vec!["10.0.0.1", "10.1.0.0/16"]
        );
        let v6 = spec(IpFamily::Inet6, &["10.0.0.1", "fd00::1"]);
        assert_eq!(v6.members.into_iter().collect::<Vec<_>>(), vec!["fd00::1"]);
    }

    #[test]
    fn test_parse_members() {
        let output = "Name: egress-src-v4-abc\n\
                      Type: hash:net\n\
                      Revision: 7\n\
                      Header: family inet hashsize 1024 maxelem 65536\n\
                      Size in memory: 504\n\
                      References: 1\n\
                      Number of entries: 2\n\
                      Members:\n\
                      10.0.0.1\n\
                      10.1.0.0/16 timeout 0\n";
        assert_eq!(parse_members(output), vec!["10.0.0.1", "10.1.0.0/16"]);
        assert!(parse_members("Name: x\nMembers:\n").is_empty());
    }

    #[test]
    fn test_manager_converges_members() {
        let ipset = MemoryIpSet::new();
        let mut manager = IpSetManager::new(ipset.clone(), OWNED_PREFIX);
        manager.set_desired(BTreeMap::from([(
            "egress-a".to_owned(),
            spec(IpFamily::Inet, &["10.0.0.1", "10.0.0.2"]),
        )]));
        manager.apply_updates().unwrap();
        assert_eq!(ipset.members("egress-a").unwrap(), vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(ipset.family("egress-a"), Some(IpFamily::Inet));

        manager.set_desired(BTreeMap::from([(
            "egress-a".to_owned(),
            spec(IpFamily::Inet, &["10.0.0.2", "10.0.0.3"]),
        )]));
        manager.apply_updates().unwrap();
        assert_eq!(ipset.members("egress-a").unwrap(), vec!["10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn test_manager_destroys_stale_sets_only_on_deletion_pass() {
        let ipset = MemoryIpSet::new();
        ipset.create("egress-leftover", IpFamily::Inet).unwrap();
        ipset.create("kube-foreign", IpFamily::Inet).unwrap();

        let mut manager = IpSetManager::new(ipset.clone(), OWNED_PREFIX);
        manager.set_desired(BTreeMap::from([(
            "egress-a".to_owned(),
            spec(IpFamily::Inet, &["10.0.0.1"]),
        )]));
        manager.apply_updates().unwrap();
        assert!(ipset.members("egress-leftover").is_some());

        manager.apply_deletions().unwrap();
        assert!(ipset.members("egress-leftover").is_none());
        assert!(ipset.members("kube-foreign").is_some());
        assert!(ipset.members("egress-a").is_some());
    }

    #[test]
    fn test_manager_repairs_after_invalidate() {
        let ipset = MemoryIpSet::new();
        let mut manager = IpSetManager::new(ipset.clone(), OWNED_PREFIX);
        manager.set_desired(BTreeMap::from([(
            "egress-a".to_owned(),
            spec(IpFamily::Inet, &["10.0.0.1"]),
        )]));
        manager.apply_updates().unwrap();

        ipset.del("egress-a", "10.0.0.1").unwrap();
        manager.apply_updates().unwrap();
        assert!(ipset.members("egress-a").unwrap().is_empty());

        manager.invalidate();
        manager.apply_updates().unwrap();
        assert_eq!(ipset.members("egress-a").unwrap(), vec!["10.0.0.1"]);
    }
}
