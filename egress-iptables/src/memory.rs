use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::backend::Backend;
use crate::{Error, Result};

const STANDARD_TARGETS: &[&str] = &[
    "ACCEPT",
    "DROP",
    "RETURN",
    "REJECT",
    "LOG",
    "MARK",
    "CONNMARK",
    "SNAT",
    "DNAT",
    "MASQUERADE",
];

fn builtin_chains(table: &str) -> &'static [&'static str] {
    match table {
        "filter" => &["INPUT", "FORWARD", "OUTPUT"],
        "nat" => &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"],
        "mangle" => &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"],
        "raw" => &["PREROUTING", "OUTPUT"],
        _ => &[],
    }
}

#[derive(Clone, Debug)]
struct MemoryChain {
    name: String,
    builtin: bool,
    rules: Vec<String>,
}

type MemoryTable = Vec<MemoryChain>;

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    restores: Vec<String>,
    failing_restores: usize,
}

impl MemoryState {
    fn table_mut(&mut self, name: &str) -> &mut MemoryTable {
        self.tables
            .entry(name.to_owned())
            .or_insert_with(|| new_table(name))
    }
}

fn new_table(name: &str) -> MemoryTable {
    builtin_chains(name)
        .iter()
        .map(|chain| MemoryChain {
            name: (*chain).to_owned(),
            builtin: true,
            rules: Vec::new(),
        })
        .collect()
}

/// In-process stand-in for the kernel tables. Executes restore input with
/// `--noflush` semantics and renders save output.
#[derive(Clone, Debug, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every restore input received, including failed ones.
    pub fn restore_inputs(&self) -> Vec<String> {
        self.state().restores.clone()
    }

    pub fn clear_restore_inputs(&self) {
        self.state().restores.clear();
    }

    /// Makes the next `count` restores fail without touching any table.
    pub fn fail_next_restores(&self, count: usize) {
        self.state().failing_restores = count;
    }

    pub fn chains(&self, table: &str) -> Vec<String> {
        let mut state = self.state();
        state
            .table_mut(table)
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    /// Rule bodies of a chain, without the leading `-A <chain>`.
    pub fn rules(&self, table: &str, chain: &str) -> Option<Vec<String>> {
        let mut state = self.state();
        state
            .table_mut(table)
            .iter()
            .find(|c| c.name == chain)
            .map(|c| c.rules.clone())
    }

    /// Mutates a chain the way an unrelated tool would.
    pub fn insert_foreign_rule(&self, table: &str, chain: &str, index: usize, rule: &str) {
        let mut state = self.state();
        let chains = state.table_mut(table);
        if let Some(c) = chains.iter_mut().find(|c| c.name == chain) {
            let index = index.min(c.rules.len());
            c.rules.insert(index, rule.to_owned());
        }
    }

    pub fn remove_rule(&self, table: &str, chain: &str, index: usize) {
        let mut state = self.state();
        let chains = state.table_mut(table);
        if let Some(c) = chains.iter_mut().find(|c| c.name == chain) {
            if index < c.rules.len() {
                c.rules.remove(index);
            }
        }
    }

    pub fn delete_chain(&self, table: &str, chain: &str) {
        let mut state = self.state();
        state.table_mut(table).retain(|c| c.name != chain);
    }
}

impl Backend for MemoryBackend {
    fn save(&self, table: &str) -> Result<String> {
        let mut state = self.state();
        let chains = state.table_mut(table);
        let mut out = String::from("# Generated by egress-iptables\n");
        out.push_str(&format!("*{table}\n"));
        for chain in chains.iter() {
            if chain.builtin {
                out.push_str(&format!(":{} ACCEPT [0:0]\n", chain.name));
            } else {
                out.push_str(&format!(":{} - [0:0]\n", chain.name));
            }
        }
        for chain in chains.iter() {
            for rule in &chain.rules {
                out.push_str(&format!("-A {} {}\n", chain.name, rule));
            }
        }
        out.push_str("COMMIT\n");
        Ok(out)
    }

    fn restore(&self, input: &str) -> Result<()> {
        let mut state = self.state();
        state.restores.push(input.to_owned());
        if state.failing_restores > 0 {
            state.failing_restores -= 1;
            return Err(Error::CommandFailed {
                command: "iptables-restore --noflush".into(),
                message: "injected failure".into(),
            });
        }

        let mut transaction: Option<(String, MemoryTable)> = None;
        for (number, raw) in input.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let invalid = |message: String| Error::InvalidRestoreInput {
                line: number + 1,
                message,
            };
            if let Some(table) = line.strip_prefix('*') {
                if transaction.is_some() {
                    return Err(invalid("table started inside a transaction".into()));
                }
                let chains = state.table_mut(table).clone();
                transaction = Some((table.to_owned(), chains));
                continue;
            }
            let Some((table, chains)) = transaction.as_mut() else {
                return Err(invalid(format!("`{line}` outside a transaction")));
            };
            if line == "COMMIT" {
                let committed = std::mem::take(chains);
                let table = table.clone();
                state.tables.insert(table, committed);
                transaction = None;
                continue;
            }
            apply_line(chains, line).map_err(invalid)?;
        }
        if transaction.is_some() {
            return Err(Error::InvalidRestoreInput {
                line: input.lines().count(),
                message: "missing COMMIT".into(),
            });
        }
        Ok(())
    }
}

fn find_chain<'a>(
    chains: &'a mut MemoryTable,
    name: &str,
) -> std::result::Result<&'a mut MemoryChain, String> {
    chains
        .iter_mut()
        .find(|c| c.name == name)
        .ok_or_else(|| format!("chain {name} does not exist"))
}

fn jump_target(rule: &str) -> Option<&str> {
    let mut tokens = rule.split_whitespace();
    while let Some(token) = tokens.next() {
        if matches!(token, "--jump" | "-j" | "--goto" | "-g") {
            return tokens.next();
        }
    }
    None
}

fn check_target(chains: &MemoryTable, rule: &str) -> std::result::Result<(), String> {
    match jump_target(rule) {
        Some(target)
            if !STANDARD_TARGETS.contains(&target) && !chains.iter().any(|c| c.name == target) =>
        {
            Err(format!("jump to unknown chain {target}"))
        }
        _ => Ok(()),
    }
}

fn apply_line(chains: &mut MemoryTable, line: &str) -> std::result::Result<(), String> {
    if let Some(decl) = line.strip_prefix(':') {
        let name = decl
            .split_whitespace()
            .next()
            .ok_or_else(|| "empty chain declaration".to_owned())?;
        match chains.iter_mut().find(|c| c.name == name) {
            Some(chain) => chain.rules.clear(),
            None => chains.push(MemoryChain {
                name: name.to_owned(),
                builtin: false,
                rules: Vec::new(),
            }),
        }
        return Ok(());
    }

    let mut parts = line.splitn(3, ' ');
    let op = parts.next().unwrap_or_default();
    let chain_name = parts
        .next()
        .ok_or_else(|| format!("missing chain in `{line}`"))?;
    let rest = parts.next().unwrap_or_default();

    match op {
        "-A" | "--append" => {
            check_target(chains, rest)?;
            find_chain(chains, chain_name)?.rules.push(rest.to_owned());
        }
        "-I" | "--insert" => {
            let (index, rule) = match rest.split_once(' ') {
                Some((num, rule)) if num.parse::<usize>().is_ok() => {
                    (num.parse::<usize>().unwrap_or(1).saturating_sub(1), rule)
                }
                _ => (0, rest),
            };
            check_target(chains, rule)?;
            let chain = find_chain(chains, chain_name)?;
            if index > chain.rules.len() {
                return Err(format!("insert index {} out of range", index + 1));
            }
            chain.rules.insert(index, rule.to_owned());
        }
        "-R" | "--replace" => {
            let (num, rule) = rest
                .split_once(' ')
                .ok_or_else(|| format!("malformed replace `{line}`"))?;
            let num: usize = num.parse().map_err(|_| format!("bad rule number {num}"))?;
            check_target(chains, rule)?;
            let chain = find_chain(chains, chain_name)?;
            if num == 0 || num > chain.rules.len() {
                return Err(format!("replace index {num} out of range"));
            }
            chain.rules[num - 1] = rule.to_owned();
        }
        "-D" | "--delete" => {
            let chain = find_chain(chains, chain_name)?;
            if let Ok(num) = rest.trim().parse::<usize>() {
                if num == 0 || num > chain.rules.len() {
                    return Err(format!("delete index {num} out of range"));
                }
                chain.rules.remove(num - 1);
            } else {
                let position = chain
                    .rules
                    .iter()
                    .position(|r| r == rest)
                    .ok_or_else(|| format!("no rule `{rest}` in {chain_name}"))?;
                chain.rules.remove(position);
            }
        }
        "-X" | "--delete-chain" => {
            let position = chains
                .iter()
                .position(|c| c.name == chain_name)
                .ok_or_else(|| format!("chain {chain_name} does not exist"))?;
            if chains[position].builtin {
                return Err(format!("cannot delete built-in chain {chain_name}"));
            }
            if !chains[position].rules.is_empty() {
                return Err(format!("chain {chain_name} is not empty"));
            }
            let referenced = chains
                .iter()
                .flat_map(|c| c.rules.iter())
                .any(|r| jump_target(r) == Some(chain_name));
            if referenced {
                return Err(format!("chain {chain_name} is still referenced"));
            }
            chains.remove(position);
        }
        "-F" | "--flush" => {
            find_chain(chains, chain_name)?.rules.clear();
        }
        _ => return Err(format!("unsupported command `{op}`")),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_and_save() {
        let backend = MemoryBackend::new();
        backend
            .restore(
                "*mangle\n:EGRESSGATEWAY-A - -\n-A EGRESSGATEWAY-A --jump ACCEPT\n\
                 -I PREROUTING --jump EGRESSGATEWAY-A\nCOMMIT\n",
            )
            .unwrap();
        let saved = backend.save("mangle").unwrap();
        assert!(saved.contains(":EGRESSGATEWAY-A - [0:0]"));
        assert!(saved.contains("-A PREROUTING --jump EGRESSGATEWAY-A"));
        assert!(saved.contains("-A EGRESSGATEWAY-A --jump ACCEPT"));
    }

    #[test]
    fn test_failed_transaction_not_committed() {
        let backend = MemoryBackend::new();
        let err = backend
            .restore("*mangle\n:EGRESSGATEWAY-A - -\n-A PREROUTING --jump EGRESSGATEWAY-MISSING\nCOMMIT\n")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRestoreInput { line: 3, .. }));
        assert!(!backend.chains("mangle").contains(&"EGRESSGATEWAY-A".to_owned()));
    }

    #[test]
    fn test_delete_referenced_chain_fails() {
        let backend = MemoryBackend::new();
        backend
            .restore("*nat\n:EGRESSGATEWAY-B - -\n-A POSTROUTING --jump EGRESSGATEWAY-B\nCOMMIT\n")
            .unwrap();
        assert!(
            backend
                .restore("*nat\n--delete-chain EGRESSGATEWAY-B\nCOMMIT\n")
                .is_err()
        );
        backend
            .restore("*nat\n-D POSTROUTING --jump EGRESSGATEWAY-B\n--delete-chain EGRESSGATEWAY-B\nCOMMIT\n")
            .unwrap();
        assert!(!backend.chains("nat").contains(&"EGRESSGATEWAY-B".to_owned()));
    }

    #[test]
    fn test_injected_failures() {
        let backend = MemoryBackend::new();
        backend.fail_next_restores(1);
        assert!(backend.restore("*filter\nCOMMIT\n").is_err());
        assert!(backend.restore("*filter\nCOMMIT\n").is_ok());
        assert_eq!(backend.restore_inputs().len(), 2);
    }
}
