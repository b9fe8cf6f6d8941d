use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, IpVersion};
use crate::chain::{Chain, calculate_rule_hashes};
use crate::lock::{DataplaneLock, LockGuard};
use crate::restore::RestoreInputBuilder;
use crate::rule::Rule;
use crate::{Error, Result};

/// Post-write rechecks stop once the interval reaches this value.
pub const MAX_POST_WRITE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Where rules handed to [`Table::insert_or_append_rules`] are placed in
/// chains we do not own.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InsertMode {
    #[default]
    Insert,
    Append,
}

#[derive(Clone, Debug)]
pub struct TableOptions {
    pub hash_comment_prefix: String,
    /// Chains whose names start with one of these are owned by the table.
    pub our_chain_prefixes: Vec<String>,
    pub insert_mode: InsertMode,
    /// Forced re-read of the dataplane. Zero disables it.
    pub refresh_interval: Duration,
    /// First recheck after a write. Zero disables post-write rechecks.
    pub post_write_interval: Duration,
    pub initial_retry_backoff: Duration,
    pub max_retries: usize,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            hash_comment_prefix: "egw:".into(),
            our_chain_prefixes: vec!["EGRESSGATEWAY-".into()],
            insert_mode: InsertMode::Insert,
            refresh_interval: Duration::from_secs(90),
            post_write_interval: Duration::from_secs(1),
            initial_retry_backoff: Duration::from_millis(1),
            max_retries: 10,
        }
    }
}

/// Desired state of one iptables table plus what we believe is programmed.
/// `apply` converges the kernel to the desired state in one `--noflush`
/// restore transaction.
pub struct Table<B: Backend> {
    name: String,
    ip_version: IpVersion,
    backend: B,
    lock: Arc<dyn DataplaneLock>,
    nftables: bool,
    options: TableOptions,

    chain_name_to_chain: HashMap<String, Chain>,
    chain_ref_counts: HashMap<String, usize>,
    dirty_chains: BTreeSet<String>,

    chain_to_inserted_rules: HashMap<String, Vec<Rule>>,
    chain_to_appended_rules: HashMap<String, Vec<Rule>>,
    dirty_insert_append: BTreeSet<String>,

    chain_to_dataplane_hashes: HashMap<String, Vec<String>>,
    /// Full rule text of chains we do not own. Rules that are not ours are
    /// recorded as `-`.
    chain_to_full_rules: HashMap<String, Vec<String>>,

    in_sync: bool,
    last_read_time: Option<Instant>,
    last_write_time: Option<Instant>,
    post_write_interval: Duration,

    hash_comment_regex: Regex,
    our_chains_regex: Option<Regex>,
}

impl<B: Backend> Table<B> {
    pub fn new(
        name: &str,
        ip_version: IpVersion,
        backend: B,
        lock: Arc<dyn DataplaneLock>,
        nftables: bool,
        options: TableOptions,
    ) -> Result<Self> {
        let hash_comment_regex = Regex::new(&format!(
            r#"--comment "?{}([a-zA-Z0-9_-]+)"?"#,
            regex::escape(&options.hash_comment_prefix)
        ))?;
        let our_chains_regex = if options.our_chain_prefixes.is_empty() {
            None
        } else {
            let alternatives: Vec<String> = options
                .our_chain_prefixes
                .iter()
                .map(|p| regex::escape(p))
                .collect();
            Some(Regex::new(&format!("^(?:{})", alternatives.join("|")))?)
        };
        Ok(Self {
            name: name.to_owned(),
            ip_version,
            backend,
            lock,
            nftables,
            post_write_interval: options.post_write_interval,
            options,
            chain_name_to_chain: HashMap::new(),
            chain_ref_counts: HashMap::new(),
            dirty_chains: BTreeSet::new(),
            chain_to_inserted_rules: HashMap::new(),
            chain_to_appended_rules: HashMap::new(),
            dirty_insert_append: BTreeSet::new(),
            chain_to_dataplane_hashes: HashMap::new(),
            chain_to_full_rules: HashMap::new(),
            in_sync: false,
            last_read_time: None,
            last_write_time: None,
            hash_comment_regex,
            our_chains_regex,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip_version(&self) -> IpVersion {
        self.ip_version
    }

    pub fn in_sync(&self) -> bool {
        self.in_sync
    }

    pub fn post_write_interval(&self) -> Duration {
        self.post_write_interval
    }

    pub fn chain_ref_count(&self, name: &str) -> usize {
        self.chain_ref_counts.get(name).copied().unwrap_or(0)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn is_our_chain(&self, name: &str) -> bool {
        self.our_chains_regex
            .as_ref()
            .is_some_and(|r| r.is_match(name))
    }

    /// Sets the rules we insert (or append, per [`InsertMode`]) into a chain
    /// owned by someone else, typically a kernel chain.
    pub fn insert_or_append_rules(&mut self, chain_name: &str, rules: Vec<Rule>) {
        let new_refs = referenced(&rules);
        let old = self
            .chain_to_inserted_rules
            .insert(chain_name.to_owned(), rules)
            .unwrap_or_default();
        self.apply_ref_changes(&new_refs, &referenced(&old));
        self.dirty_insert_append.insert(chain_name.to_owned());
        self.invalidate_dataplane_cache("insertion");
    }

    /// Sets the rules we always append to the end of a chain we do not own.
    pub fn append_rules(&mut self, chain_name: &str, rules: Vec<Rule>) {
        let new_refs = referenced(&rules);
        let old = self
            .chain_to_appended_rules
            .insert(chain_name.to_owned(), rules)
            .unwrap_or_default();
        self.apply_ref_changes(&new_refs, &referenced(&old));
        self.dirty_insert_append.insert(chain_name.to_owned());
        self.invalidate_dataplane_cache("append");
    }

    pub fn update_chains(&mut self, chains: Vec<Chain>) {
        for chain in chains {
            self.update_chain(chain);
        }
    }

    pub fn update_chain(&mut self, chain: Chain) {
        let name = chain.name.clone();
        let new_refs: Vec<String> = chain.referenced_chains().map(str::to_owned).collect();
        let old = self.chain_name_to_chain.insert(name.clone(), chain);
        if self.chain_ref_count(&name) > 0 {
            let old_refs: Vec<String> = old
                .as_ref()
                .map(|c| c.referenced_chains().map(str::to_owned).collect())
                .unwrap_or_default();
            self.apply_ref_changes(&new_refs, &old_refs);
            self.dirty_chains.insert(name);
        }
        self.invalidate_dataplane_cache("chain update");
    }

    pub fn remove_chains(&mut self, names: &[String]) {
        for name in names {
            self.remove_chain_by_name(name);
        }
    }

    pub fn remove_chain_by_name(&mut self, name: &str) {
        let Some(old) = self.chain_name_to_chain.remove(name) else {
            return;
        };
        if self.chain_ref_count(name) > 0 {
            let old_refs: Vec<String> = old.referenced_chains().map(str::to_owned).collect();
            self.apply_ref_changes(&[], &old_refs);
            self.dirty_chains.insert(name.to_owned());
        }
        self.invalidate_dataplane_cache("chain removal");
    }

    /// Increments before decrementing so a chain referenced by both the old
    /// and new rules never drops to zero in between.
    fn apply_ref_changes(&mut self, new_refs: &[String], old_refs: &[String]) {
        for name in new_refs {
            self.incref_chain(name);
        }
        for name in old_refs {
            self.decref_chain(name);
        }
    }

    fn incref_chain(&mut self, name: &str) {
        let count = self.chain_ref_counts.entry(name.to_owned()).or_insert(0);
        *count += 1;
        if *count == 1 {
            debug!(table = %self.name, chain = name, "chain became referenced");
            self.dirty_chains.insert(name.to_owned());
            let refs: Vec<String> = self
                .chain_name_to_chain
                .get(name)
                .map(|c| c.referenced_chains().map(str::to_owned).collect())
                .unwrap_or_default();
            for r in refs {
                self.incref_chain(&r);
            }
        }
    }

    fn decref_chain(&mut self, name: &str) {
        let Some(count) = self.chain_ref_counts.get_mut(name) else {
            warn!(table = %self.name, chain = name, "decref of unreferenced chain");
            return;
        };
        *count -= 1;
        if *count == 0 {
            debug!(table = %self.name, chain = name, "chain no longer referenced");
            self.chain_ref_counts.remove(name);
            self.dirty_chains.insert(name.to_owned());
            let refs: Vec<String> = self
                .chain_name_to_chain
                .get(name)
                .map(|c| c.referenced_chains().map(str::to_owned).collect())
                .unwrap_or_default();
            for r in refs {
                self.decref_chain(&r);
            }
        }
    }

    /// The chain as it should be programmed, `None` if it should not exist.
    fn desired_state_of_chain(&self, name: &str) -> Option<&Chain> {
        if self.chain_ref_count(name) == 0 {
            return None;
        }
        self.chain_name_to_chain.get(name)
    }

    pub fn invalidate_dataplane_cache(&mut self, reason: &str) {
        if self.in_sync {
            debug!(table = %self.name, reason, "invalidating dataplane cache");
        }
        self.in_sync = false;
    }

    /// Converges the dataplane and returns how long the caller may wait
    /// before the next forced recheck is due.
    pub fn apply(&mut self) -> Result<Option<Duration>> {
        let now = Instant::now();
        let mut invalidated = false;
        if !self.options.refresh_interval.is_zero()
            && self
                .last_read_time
                .is_none_or(|t| now.duration_since(t) > self.options.refresh_interval)
        {
            self.invalidate_dataplane_cache("refresh timer");
            invalidated = true;
        }

        // Other writers may clobber what we just wrote, so re-read at doubling
        // intervals after each write.
        if let Some(last_write) = self.last_write_time {
            while !self.post_write_interval.is_zero()
                && self.post_write_interval < MAX_POST_WRITE_INTERVAL
                && now >= last_write + self.post_write_interval
            {
                self.post_write_interval *= 2;
                debug!(
                    table = %self.name,
                    interval = ?self.post_write_interval,
                    "updated post-write interval"
                );
                if !invalidated {
                    self.invalidate_dataplane_cache("post update");
                    invalidated = true;
                }
            }
        }

        let mut backoff = self.options.initial_retry_backoff;
        let mut retries = self.options.max_retries;
        let mut failed_at_least_once = false;
        loop {
            match self.try_apply() {
                Ok(()) => break,
                Err(e) if retries > 0 => {
                    retries -= 1;
                    warn!(table = %self.name, %e, ?backoff, "failed to program iptables, will retry");
                    self.invalidate_dataplane_cache("failed update");
                    thread::sleep(backoff);
                    backoff *= 2;
                    failed_at_least_once = true;
                }
                Err(e) => {
                    error!(table = %self.name, %e, "failed to program iptables, loading diagnostics");
                    match self.backend.save(&self.name) {
                        Ok(dump) => error!(table = %self.name, %dump, "current dataplane state"),
                        Err(save_err) => {
                            error!(table = %self.name, %save_err, "failed to load diagnostics")
                        }
                    }
                    self.invalidate_dataplane_cache("failed update");
                    return Err(Error::RetriesExhausted {
                        table: self.name.clone(),
                        attempts: self.options.max_retries + 1,
                        source: Box::new(e),
                    });
                }
            }
        }
        if failed_at_least_once {
            info!(table = %self.name, "succeeded after retry");
        }

        let now = Instant::now();
        let mut reschedule = None;
        if !self.options.refresh_interval.is_zero() {
            let since_read = self
                .last_read_time
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or_default();
            reschedule = Some(self.options.refresh_interval.saturating_sub(since_read));
        }
        if let Some(last_write) = self.last_write_time {
            if !self.post_write_interval.is_zero()
                && self.post_write_interval < MAX_POST_WRITE_INTERVAL
            {
                let mut after = (last_write + self.post_write_interval).saturating_duration_since(now);
                if after.is_zero() {
                    after = Duration::from_millis(1);
                }
                reschedule = Some(reschedule.map_or(after, |r: Duration| r.min(after)));
            }
        }
        Ok(reschedule)
    }

    fn try_apply(&mut self) -> Result<()> {
        if !self.in_sync {
            self.load_dataplane_state()?;
        }
        self.apply_updates()
    }

    fn load_dataplane_state(&mut self) -> Result<()> {
        debug!(table = %self.name, "loading dataplane state");
        self.last_read_time = Some(Instant::now());
        let saved = self.backend.save(&self.name)?;
        let (dataplane_hashes, dataplane_rules) = self.read_hashes_and_rules(&saved);

        let mut dirty_chains = Vec::new();
        let mut dirty_inserts = Vec::new();
        for (chain_name, expected) in &self.chain_to_dataplane_hashes {
            if self.dirty_chains.contains(chain_name)
                || self.dirty_insert_append.contains(chain_name)
            {
                continue;
            }
            let actual = dataplane_hashes.get(chain_name);
            if self.is_our_chain(chain_name) {
                if actual != Some(expected) {
                    warn!(table = %self.name, chain = %chain_name, "detected out-of-sync chain, marking for resync");
                    dirty_chains.push(chain_name.clone());
                }
                continue;
            }
            let actual = actual.cloned().unwrap_or_default();
            let (expected, _, _) =
                self.expected_hashes_for_insert_append(chain_name, num_empty(&actual));
            if actual != expected {
                warn!(
                    table = %self.name,
                    chain = %chain_name,
                    ?expected,
                    ?actual,
                    "detected out-of-sync inserts, marking for resync"
                );
                dirty_inserts.push(chain_name.clone());
            }
        }

        for (chain_name, hashes) in &dataplane_hashes {
            if self.dirty_chains.contains(chain_name)
                || self.dirty_insert_append.contains(chain_name)
                || self.chain_to_dataplane_hashes.contains_key(chain_name)
            {
                continue;
            }
            if !self.is_our_chain(chain_name) {
                if hashes.iter().any(|h| !h.is_empty()) {
                    info!(table = %self.name, chain = %chain_name, "found unexpected insert, marking for cleanup");
                    dirty_inserts.push(chain_name.clone());
                }
                continue;
            }
            info!(table = %self.name, chain = %chain_name, "found unexpected chain, marking for cleanup");
            dirty_chains.push(chain_name.clone());
        }

        self.dirty_chains.extend(dirty_chains);
        self.dirty_insert_append.extend(dirty_inserts);
        self.chain_to_dataplane_hashes = dataplane_hashes;
        self.chain_to_full_rules = dataplane_rules;
        self.in_sync = true;
        Ok(())
    }

    /// Per-chain hashes recovered from save output. Rules without one of our
    /// hash comments get an empty hash.
    fn read_hashes_and_rules(
        &self,
        saved: &str,
    ) -> (HashMap<String, Vec<String>>, HashMap<String, Vec<String>>) {
        let mut hashes: HashMap<String, Vec<String>> = HashMap::new();
        let mut rules: HashMap<String, Vec<String>> = HashMap::new();
        for line in saved.lines() {
            if let Some(decl) = line.strip_prefix(':') {
                if let Some(chain) = decl.split_whitespace().next() {
                    hashes.insert(chain.to_owned(), Vec::new());
                }
                continue;
            }
            let Some(rest) = line.strip_prefix("-A ") else {
                continue;
            };
            let Some(chain) = rest.split_whitespace().next() else {
                continue;
            };
            let hash = self
                .hash_comment_regex
                .captures(line)
                .map(|c| c[1].to_owned())
                .unwrap_or_default();
            if !self.is_our_chain(chain) {
                let full_rule = if hash.is_empty() {
                    "-".to_owned()
                } else {
                    line.to_owned()
                };
                rules.entry(chain.to_owned()).or_default().push(full_rule);
            }
            hashes.entry(chain.to_owned()).or_default().push(hash);
        }
        (hashes, rules)
    }

    /// Expected hashes of a foreign chain given how many foreign rules it
    /// currently holds, plus our inserted and appended hashes.
    fn expected_hashes_for_insert_append(
        &self,
        chain_name: &str,
        num_foreign: usize,
    ) -> (Vec<String>, Vec<String>, Vec<String>) {
        let inserted = self
            .chain_to_inserted_rules
            .get(chain_name)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let appended = self
            .chain_to_appended_rules
            .get(chain_name)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let inserted_hashes = calculate_rule_hashes(chain_name, inserted);
        // Distinct seed so identical inserted and appended rules hash differently.
        let appended_hashes = calculate_rule_hashes(&format!("{chain_name}append"), appended);

        let mut all = vec![String::new(); inserted.len() + appended.len() + num_foreign];
        let offset = match self.options.insert_mode {
            InsertMode::Insert => 0,
            InsertMode::Append => num_foreign,
        };
        for (i, hash) in inserted_hashes.iter().enumerate() {
            all[i + offset] = hash.clone();
        }
        let offset = inserted.len() + num_foreign;
        for (i, hash) in appended_hashes.iter().enumerate() {
            all[i + offset] = hash.clone();
        }
        (all, inserted_hashes, appended_hashes)
    }

    fn comment_frag(&self, hash: &str) -> String {
        format!(
            "-m comment --comment \"{}{}\"",
            self.options.hash_comment_prefix, hash
        )
    }

    fn render_delete_by_value_line(&self, chain_name: &str, index: usize) -> Result<String> {
        let rules = self
            .chain_to_full_rules
            .get(chain_name)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let rule = rules.get(index).ok_or_else(|| {
            Error::DeleteRendering(format!(
                "rule {index} of {chain_name} does not exist ({} rules)",
                rules.len()
            ))
        })?;
        Ok(rule.replacen("-A", "-D", 1))
    }

    fn apply_updates(&mut self) -> Result<()> {
        let mut buf = RestoreInputBuilder::new();
        buf.start_transaction(&self.name);

        // Chains we are about to delete that never made it to the dataplane
        // need no work.
        let nothing_to_delete: Vec<String> = self
            .dirty_chains
            .iter()
            .filter(|name| {
                self.desired_state_of_chain(name).is_none()
                    && !self.chain_to_dataplane_hashes.contains_key(*name)
            })
            .cloned()
            .collect();
        for name in nothing_to_delete {
            self.dirty_chains.remove(&name);
        }

        // First pass: forward references create missing chains and flush
        // chains that are rewritten or about to be deleted.
        let mut already_correct = Vec::new();
        for name in &self.dirty_chains {
            let desired = self.desired_state_of_chain(name);
            let needs_flush = if self.nftables {
                let current = desired.map(Chain::rule_hashes).unwrap_or_default();
                let previous = self.chain_to_dataplane_hashes.get(name);
                if desired.is_some() && previous.is_some_and(|p| !p.is_empty() && *p == current) {
                    already_correct.push(name.clone());
                    continue;
                }
                true
            } else {
                desired.is_none() || !self.chain_to_dataplane_hashes.contains_key(name)
            };
            if needs_flush {
                buf.write_forward_reference(name);
            }
        }
        for name in already_correct {
            self.dirty_chains.remove(&name);
        }

        // Second pass: rule level changes to the chains we own.
        let mut new_hashes: HashMap<String, Option<Vec<String>>> = HashMap::new();
        for name in &self.dirty_chains {
            let Some(chain) = self.desired_state_of_chain(name) else {
                continue;
            };
            // nft mode always rewrites the whole chain after the flush above.
            let previous = if self.nftables {
                Vec::new()
            } else {
                self.chain_to_dataplane_hashes
                    .get(name)
                    .cloned()
                    .unwrap_or_default()
            };
            let current = chain.rule_hashes();
            for i in 0..previous.len().max(current.len()) {
                let line = if i < previous.len() && i < current.len() {
                    if previous[i] == current[i] {
                        continue;
                    }
                    chain.rules[i].render_replace(name, i + 1, &self.comment_frag(&current[i]))
                } else if i < previous.len() {
                    format!("-D {} {}", name, current.len() + 1)
                } else {
                    chain.rules[i].render_append(name, &self.comment_frag(&current[i]))
                };
                buf.write_line(&line);
            }
            new_hashes.insert(name.clone(), Some(current));
        }

        // Rules inserted into or appended to chains owned by others. When out
        // of sync, delete all of ours by value and write them again.
        let mut new_full_rules: HashMap<String, Vec<String>> = HashMap::new();
        let mut unchanged = Vec::new();
        for name in &self.dirty_insert_append {
            let previous = self
                .chain_to_dataplane_hashes
                .get(name)
                .cloned()
                .unwrap_or_default();
            let (current, inserted_hashes, appended_hashes) =
                self.expected_hashes_for_insert_append(name, num_empty(&previous));
            if current == previous {
                unchanged.push(name.clone());
                continue;
            }
            for (i, hash) in previous.iter().enumerate() {
                if !hash.is_empty() {
                    buf.write_line(&self.render_delete_by_value_line(name, i)?);
                }
            }

            let full_rules = self
                .chain_to_full_rules
                .get(name)
                .cloned()
                .unwrap_or_default();
            let mut remaining: Vec<String> = full_rules
                .into_iter()
                .zip(previous.iter())
                .filter(|(_, hash)| hash.is_empty())
                .map(|(rule, _)| rule)
                .collect();

            let inserted = self
                .chain_to_inserted_rules
                .get(name)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let mut ours: Vec<String> = inserted
                .iter()
                .zip(inserted_hashes.iter())
                .map(|(rule, hash)| rule.render_append(name, &self.comment_frag(hash)))
                .collect();
            match self.options.insert_mode {
                InsertMode::Insert => {
                    // Each insert lands at the top, so go in reverse.
                    for (rule, hash) in inserted.iter().zip(inserted_hashes.iter()).rev() {
                        buf.write_line(&rule.render_insert(name, &self.comment_frag(hash)));
                    }
                    ours.append(&mut remaining);
                    remaining = ours;
                }
                InsertMode::Append => {
                    for (rule, hash) in inserted.iter().zip(inserted_hashes.iter()) {
                        buf.write_line(&rule.render_append(name, &self.comment_frag(hash)));
                    }
                    remaining.append(&mut ours);
                }
            }

            let appended = self
                .chain_to_appended_rules
                .get(name)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for (rule, hash) in appended.iter().zip(appended_hashes.iter()) {
                let line = rule.render_append(name, &self.comment_frag(hash));
                buf.write_line(&line);
                remaining.push(line);
            }

            new_hashes.insert(name.clone(), Some(current));
            new_full_rules.insert(name.clone(), remaining);
        }
        for name in unchanged {
            self.dirty_insert_append.remove(&name);
        }

        if self.nftables {
            // nft restore only recomputes chain references at transaction
            // start, so deletions go into their own transaction.
            buf.end_transaction();
            buf.start_transaction(&self.name);
            for name in &self.dirty_chains {
                if self.desired_state_of_chain(name).is_none() {
                    buf.write_forward_reference(name);
                }
            }
        }

        // Deletions last, after every reference to them has been removed.
        for name in &self.dirty_chains {
            if self.desired_state_of_chain(name).is_none() {
                buf.write_line(&format!("--delete-chain {name}"));
                new_hashes.insert(name.clone(), None);
            }
        }
        buf.end_transaction();

        if buf.is_empty() {
            debug!(table = %self.name, "update was a no-op, skipping restore");
        } else {
            debug!(table = %self.name, input = %buf.as_str(), "writing to dataplane");
            let result = {
                let _guard = LockGuard::new(self.lock.as_ref());
                self.backend.restore(buf.as_str())
            };
            if let Err(e) = result {
                warn!(table = %self.name, input = %buf.as_str(), "restore failed");
                return Err(e);
            }
            self.last_write_time = Some(Instant::now());
            self.post_write_interval = self.options.post_write_interval;
        }

        self.dirty_chains.clear();
        self.dirty_insert_append.clear();
        for (name, hashes) in new_hashes {
            match hashes {
                Some(hashes) => {
                    self.chain_to_dataplane_hashes.insert(name, hashes);
                }
                None => {
                    self.chain_to_dataplane_hashes.remove(&name);
                    self.chain_to_full_rules.remove(&name);
                }
            }
        }
        self.chain_to_full_rules.extend(new_full_rules);
        Ok(())
    }
}

fn referenced(rules: &[Rule]) -> Vec<String> {
    rules
        .iter()
        .filter_map(|r| r.action.referenced_chain().map(str::to_owned))
        .collect()
}

fn num_empty(hashes: &[String]) -> usize {
    hashes.iter().filter(|h| h.is_empty()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::DummyLock;
    use crate::memory::MemoryBackend;
    use crate::rule::{Action, MatchCriteria};

    const CHAIN_A: &str = "EGRESSGATEWAY-A";
    const CHAIN_B: &str = "EGRESSGATEWAY-B";

    fn table_with(backend: &MemoryBackend, nftables: bool, options: TableOptions) -> Table<MemoryBackend> {
        Table::new(
            "mangle",
            IpVersion::V4,
            backend.clone(),
            Arc::new(DummyLock),
            nftables,
            options,
        )
        .unwrap()
    }

    fn table(backend: &MemoryBackend) -> Table<MemoryBackend> {
        table_with(backend, false, TableOptions::default())
    }

    fn mark_rules(count: u32) -> Vec<Rule> {
        (0..count)
            .map(|i| {
                Rule::new(
                    MatchCriteria::new().source_ip_set(&format!("egress-src-v4-{i}")),
                    Action::SetMaskedMark {
                        mark: 0x26000000 + i,
                        mask: 0xffffffff,
                    },
                )
            })
            .collect()
    }

    fn jump(target: &str) -> Rule {
        Rule::new(MatchCriteria::new(), Action::Jump(target.into()))
    }

    fn ours(rules: &[String]) -> usize {
        rules.iter().filter(|r| r.contains("egw:")).count()
    }

    #[test]
    fn test_programs_chain_and_insert() {
        let backend = MemoryBackend::new();
        let mut t = table(&backend);
        t.update_chain(Chain::new(CHAIN_A, mark_rules(2)));
        t.insert_or_append_rules("PREROUTING", vec![jump(CHAIN_A)]);
        t.apply().unwrap();

        let chain = backend.rules("mangle", CHAIN_A).unwrap();
        assert_eq!(chain.len(), 2);
        assert!(chain[0].starts_with("-m comment --comment \"egw:"));
        assert!(chain[1].contains("--set-mark 0x26000001/0xffffffff"));

        let prerouting = backend.rules("mangle", "PREROUTING").unwrap();
        assert_eq!(prerouting.len(), 1);
        assert!(prerouting[0].ends_with("--jump EGRESSGATEWAY-A"));
        assert!(t.in_sync());
    }

    #[test]
    fn test_second_apply_is_noop() {
        let backend = MemoryBackend::new();
        let mut t = table(&backend);
        t.update_chain(Chain::new(CHAIN_A, mark_rules(3)));
        t.insert_or_append_rules("PREROUTING", vec![jump(CHAIN_A)]);
        t.apply().unwrap();
        backend.clear_restore_inputs();

        t.apply().unwrap();
        assert!(backend.restore_inputs().is_empty());

        // A forced re-read finds everything in place.
        t.invalidate_dataplane_cache("test");
        t.apply().unwrap();
        assert!(backend.restore_inputs().is_empty());

        // So does setting identical desired state.
        t.update_chain(Chain::new(CHAIN_A, mark_rules(3)));
        t.apply().unwrap();
        assert!(backend.restore_inputs().is_empty());
    }

    #[test]
    fn test_unreferenced_chain_lifecycle() {
        let backend = MemoryBackend::new();
        let mut t = table(&backend);
        t.update_chain(Chain::new(CHAIN_B, mark_rules(1)));
        t.apply().unwrap();
        assert!(!backend.chains("mangle").contains(&CHAIN_B.to_owned()));
        assert!(backend.restore_inputs().is_empty());

        t.insert_or_append_rules("PREROUTING", vec![jump(CHAIN_B)]);
        assert_eq!(t.chain_ref_count(CHAIN_B), 1);
        t.apply().unwrap();
        assert!(backend.chains("mangle").contains(&CHAIN_B.to_owned()));

        t.insert_or_append_rules("PREROUTING", vec![]);
        assert_eq!(t.chain_ref_count(CHAIN_B), 0);
        t.apply().unwrap();
        assert!(!backend.chains("mangle").contains(&CHAIN_B.to_owned()));
        assert!(backend.rules("mangle", "PREROUTING").unwrap().is_empty());
    }

    #[test]
    fn test_nested_references() {
        let backend = MemoryBackend::new();
        let mut t = table(&backend);
        t.update_chain(Chain::new(CHAIN_A, vec![jump(CHAIN_B)]));
        t.update_chain(Chain::new(CHAIN_B, mark_rules(1)));
        t.insert_or_append_rules("PREROUTING", vec![jump(CHAIN_A)]);
        assert_eq!(t.chain_ref_count(CHAIN_B), 1);
        t.apply().unwrap();
        assert_eq!(backend.rules("mangle", CHAIN_B).unwrap().len(), 1);

        t.remove_chain_by_name(CHAIN_A);
        assert_eq!(t.chain_ref_count(CHAIN_B), 0);
        t.insert_or_append_rules("PREROUTING", vec![]);
        t.apply().unwrap();
        let chains = backend.chains("mangle");
        assert!(!chains.contains(&CHAIN_A.to_owned()));
        assert!(!chains.contains(&CHAIN_B.to_owned()));
    }

    #[test]
    fn test_minimal_rule_updates() {
        let backend = MemoryBackend::new();
        let mut t = table(&backend);
        t.update_chain(Chain::new(CHAIN_A, mark_rules(3)));
        t.insert_or_append_rules("PREROUTING", vec![jump(CHAIN_A)]);
        t.apply().unwrap();
        backend.clear_restore_inputs();

        let mut rules = mark_rules(3);
        rules[1].action = Action::Accept;
        t.update_chain(Chain::new(CHAIN_A, rules));
        t.apply().unwrap();
        let inputs = backend.restore_inputs();
        assert_eq!(inputs.len(), 1);
        assert!(!inputs[0].contains("-R EGRESSGATEWAY-A 1 "));
        assert!(inputs[0].contains("-R EGRESSGATEWAY-A 2 "));
        assert!(inputs[0].contains("-R EGRESSGATEWAY-A 3 "));
        assert!(!inputs[0].contains(":EGRESSGATEWAY-A"));
        assert_eq!(
            backend.rules("mangle", CHAIN_A).unwrap()[1],
            format!(
                "-m comment --comment \"egw:{}\" -m set --match-set egress-src-v4-1 src --jump ACCEPT",
                t.chain_name_to_chain[CHAIN_A].rule_hashes()[1]
            )
        );
        backend.clear_restore_inputs();

        t.update_chain(Chain::new(CHAIN_A, mark_rules(1)));
        t.apply().unwrap();
        let inputs = backend.restore_inputs();
        assert_eq!(inputs[0].matches("-D EGRESSGATEWAY-A 2").count(), 2);
        assert_eq!(backend.rules("mangle", CHAIN_A).unwrap().len(), 1);
    }

    #[test]
    fn test_repairs_foreign_insert_ahead_of_ours() {
        let backend = MemoryBackend::new();
        let mut t = table(&backend);
        t.update_chain(Chain::new(CHAIN_A, mark_rules(1)));
        t.insert_or_append_rules("PREROUTING", vec![jump(CHAIN_A)]);
        t.apply().unwrap();

        backend.insert_foreign_rule("mangle", "PREROUTING", 0, "-m comment --comment other --jump ACCEPT");
        t.invalidate_dataplane_cache("test");
        t.apply().unwrap();

        let prerouting = backend.rules("mangle", "PREROUTING").unwrap();
        assert_eq!(prerouting.len(), 2);
        assert!(prerouting[0].ends_with("--jump EGRESSGATEWAY-A"));
        assert_eq!(prerouting[1], "-m comment --comment other --jump ACCEPT");
    }

    #[test]
    fn test_repairs_external_deletion() {
        let backend = MemoryBackend::new();
        let mut t = table(&backend);
        t.update_chain(Chain::new(CHAIN_A, mark_rules(2)));
        t.insert_or_append_rules("PREROUTING", vec![jump(CHAIN_A)]);
        t.apply().unwrap();
        let expected = backend.rules("mangle", CHAIN_A).unwrap();

        backend.remove_rule("mangle", CHAIN_A, 0);
        t.invalidate_dataplane_cache("test");
        t.apply().unwrap();
        assert_eq!(backend.rules("mangle", CHAIN_A).unwrap(), expected);
    }

    #[test]
    fn test_repairs_deleted_chain() {
        let backend = MemoryBackend::new();
        let mut t = table(&backend);
        t.update_chain(Chain::new(CHAIN_A, mark_rules(2)));
        t.insert_or_append_rules("PREROUTING", vec![jump(CHAIN_A)]);
        t.apply().unwrap();
        let expected = backend.rules("mangle", CHAIN_A).unwrap();

        backend.remove_rule("mangle", "PREROUTING", 0);
        backend.delete_chain("mangle", CHAIN_A);
        t.invalidate_dataplane_cache("test");
        t.apply().unwrap();
        assert_eq!(backend.rules("mangle", CHAIN_A).unwrap(), expected);
        assert_eq!(backend.rules("mangle", "PREROUTING").unwrap().len(), 1);
    }

    #[test]
    fn test_append_mode_and_appended_rules() {
        let backend = MemoryBackend::new();
        backend.insert_foreign_rule("mangle", "POSTROUTING", 0, "--jump ACCEPT");
        let options = TableOptions {
            insert_mode: InsertMode::Append,
            ..Default::default()
        };
        let mut t = table_with(&backend, false, options);
        t.update_chain(Chain::new(CHAIN_A, mark_rules(1)));
        t.update_chain(Chain::new(CHAIN_B, mark_rules(2)));
        t.insert_or_append_rules("POSTROUTING", vec![jump(CHAIN_A)]);
        t.append_rules("POSTROUTING", vec![jump(CHAIN_B)]);
        t.apply().unwrap();

        let postrouting = backend.rules("mangle", "POSTROUTING").unwrap();
        assert_eq!(postrouting.len(), 3);
        assert_eq!(postrouting[0], "--jump ACCEPT");
        assert!(postrouting[1].ends_with("--jump EGRESSGATEWAY-A"));
        assert!(postrouting[2].ends_with("--jump EGRESSGATEWAY-B"));

        backend.clear_restore_inputs();
        t.invalidate_dataplane_cache("test");
        t.apply().unwrap();
        assert!(backend.restore_inputs().is_empty());
    }

    #[test]
    fn test_insert_order_preserved() {
        let backend = MemoryBackend::new();
        let mut t = table(&backend);
        t.update_chain(Chain::new(CHAIN_A, mark_rules(1)));
        t.update_chain(Chain::new(CHAIN_B, mark_rules(1)));
        t.insert_or_append_rules("PREROUTING", vec![jump(CHAIN_A), jump(CHAIN_B)]);
        t.apply().unwrap();
        let prerouting = backend.rules("mangle", "PREROUTING").unwrap();
        assert!(prerouting[0].ends_with("--jump EGRESSGATEWAY-A"));
        assert!(prerouting[1].ends_with("--jump EGRESSGATEWAY-B"));
    }

    #[test]
    fn test_cleans_up_previous_run() {
        let backend = MemoryBackend::new();
        backend
            .restore(
                "*mangle\n:EGRESSGATEWAY-OLD - -\n\
                 -A EGRESSGATEWAY-OLD -m comment --comment \"egw:AAAAAAAAAAAAAAAA\" --jump ACCEPT\n\
                 -A PREROUTING --jump ACCEPT\n\
                 -A PREROUTING -m comment --comment \"egw:BBBBBBBBBBBBBBBB\" --jump EGRESSGATEWAY-OLD\n\
                 COMMIT\n",
            )
            .unwrap();
        let mut t = table(&backend);
        t.apply().unwrap();
        assert!(!backend.chains("mangle").contains(&"EGRESSGATEWAY-OLD".to_owned()));
        let prerouting = backend.rules("mangle", "PREROUTING").unwrap();
        assert_eq!(prerouting, vec!["--jump ACCEPT".to_owned()]);
        assert_eq!(ours(&prerouting), 0);
    }

    #[test]
    fn test_removes_stale_rule_from_untouched_builtin_chain() {
        let backend = MemoryBackend::new();
        let mut t = table(&backend);
        t.update_chain(Chain::new(CHAIN_A, mark_rules(1)));
        t.insert_or_append_rules("PREROUTING", vec![jump(CHAIN_A)]);
        t.apply().unwrap();

        // POSTROUTING was read on the first load but we never write to it.
        backend.insert_foreign_rule("mangle", "POSTROUTING", 0, "--jump ACCEPT");
        backend.insert_foreign_rule(
            "mangle",
            "POSTROUTING",
            0,
            "-m comment --comment \"egw:CCCCCCCCCCCCCCCC\" --jump ACCEPT",
        );
        t.invalidate_dataplane_cache("test");
        t.apply().unwrap();

        let postrouting = backend.rules("mangle", "POSTROUTING").unwrap();
        assert_eq!(postrouting, vec!["--jump ACCEPT".to_owned()]);
        assert_eq!(ours(&backend.rules("mangle", "PREROUTING").unwrap()), 1);

        backend.clear_restore_inputs();
        t.invalidate_dataplane_cache("test");
        t.apply().unwrap();
        assert!(backend.restore_inputs().is_empty());
    }

    #[test]
    fn test_retries_until_success() {
        let backend = MemoryBackend::new();
        let mut t = table(&backend);
        t.update_chain(Chain::new(CHAIN_A, mark_rules(1)));
        t.insert_or_append_rules("PREROUTING", vec![jump(CHAIN_A)]);
        backend.fail_next_restores(3);
        t.apply().unwrap();
        assert_eq!(backend.restore_inputs().len(), 4);
        assert_eq!(backend.rules("mangle", CHAIN_A).unwrap().len(), 1);
    }

    #[test]
    fn test_gives_up_after_retries_and_keeps_desired_state() {
        let backend = MemoryBackend::new();
        let options = TableOptions {
            max_retries: 2,
            ..Default::default()
        };
        let mut t = table_with(&backend, false, options);
        t.update_chain(Chain::new(CHAIN_A, mark_rules(1)));
        t.insert_or_append_rules("PREROUTING", vec![jump(CHAIN_A)]);
        backend.fail_next_restores(10);
        let err = t.apply().unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(backend.restore_inputs().len(), 3);
        assert!(!t.in_sync());

        backend.fail_next_restores(0);
        t.apply().unwrap();
        assert_eq!(backend.rules("mangle", "PREROUTING").unwrap().len(), 1);
    }

    #[test]
    fn test_nft_mode_deletes_in_separate_transaction() {
        let backend = MemoryBackend::new();
        let mut t = table_with(&backend, true, TableOptions::default());
        t.update_chain(Chain::new(CHAIN_A, mark_rules(2)));
        t.insert_or_append_rules("PREROUTING", vec![jump(CHAIN_A)]);
        t.apply().unwrap();
        backend.clear_restore_inputs();

        t.apply().unwrap();
        assert!(backend.restore_inputs().is_empty());

        t.insert_or_append_rules("PREROUTING", vec![]);
        t.remove_chain_by_name(CHAIN_A);
        t.apply().unwrap();
        let inputs = backend.restore_inputs();
        assert_eq!(inputs.len(), 1);
        let transactions: Vec<&str> = inputs[0].split("*mangle\n").skip(1).collect();
        assert_eq!(transactions.len(), 2);
        assert!(transactions[0].contains("-D PREROUTING"));
        assert!(transactions[1].contains("--delete-chain EGRESSGATEWAY-A"));
        assert!(!backend.chains("mangle").contains(&CHAIN_A.to_owned()));
    }

    #[test]
    fn test_nft_mode_rewrites_whole_chain() {
        let backend = MemoryBackend::new();
        let mut t = table_with(&backend, true, TableOptions::default());
        t.update_chain(Chain::new(CHAIN_A, mark_rules(3)));
        t.insert_or_append_rules("PREROUTING", vec![jump(CHAIN_A)]);
        t.apply().unwrap();
        backend.clear_restore_inputs();

        let mut rules = mark_rules(3);
        rules[2].action = Action::Drop;
        t.update_chain(Chain::new(CHAIN_A, rules));
        t.apply().unwrap();
        let inputs = backend.restore_inputs();
        assert!(inputs[0].contains(":EGRESSGATEWAY-A - -"));
        assert_eq!(inputs[0].matches("-A EGRESSGATEWAY-A ").count(), 3);
        assert_eq!(backend.rules("mangle", CHAIN_A).unwrap().len(), 3);
    }

    #[test]
    fn test_reschedule_after_write() {
        let backend = MemoryBackend::new();
        let mut t = table(&backend);
        t.update_chain(Chain::new(CHAIN_A, mark_rules(1)));
        t.insert_or_append_rules("PREROUTING", vec![jump(CHAIN_A)]);
        let reschedule = t.apply().unwrap().unwrap();
        assert!(reschedule <= Duration::from_secs(1));
        assert!(reschedule > Duration::ZERO);
    }

    #[test]
    fn test_post_write_interval_doubles_and_resets() {
        let backend = MemoryBackend::new();
        let options = TableOptions {
            post_write_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let mut t = table_with(&backend, false, options);
        t.update_chain(Chain::new(CHAIN_A, mark_rules(1)));
        t.insert_or_append_rules("PREROUTING", vec![jump(CHAIN_A)]);
        t.apply().unwrap();
        assert_eq!(t.post_write_interval(), Duration::from_millis(10));

        thread::sleep(Duration::from_millis(15));
        t.apply().unwrap();
        assert!(t.post_write_interval() > Duration::from_millis(10));

        t.update_chain(Chain::new(CHAIN_A, mark_rules(2)));
        t.apply().unwrap();
        assert_eq!(t.post_write_interval(), Duration::from_millis(10));
    }
}
