//! In-memory rule index resolving packet destinations to actions.
//!
//! Readers are the data-plane runners (one `lookup` per packet); writers
//! are the control-plane handlers. All mutations go through a single write
//! guard so a `switch` is observed either fully applied or not at all.

use crate::{Action, Rule, RuleSpec, RuleStore, StoreError};
use ip_network::IpNetwork;
use ip_network_table::IpNetworkTable;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown rule")]
    NotFound,
    #[error("a rule with the same enabled match already exists")]
    Duplicate,
    #[error("invalid rule: {0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct RulesRegistry {
    store: Arc<dyn RuleStore>,
    index: RwLock<Index>,
}

struct Index {
    by_id: HashMap<Uuid, IndexedRule>,
    /// Enabled rules only, keyed by their match prefix.
    enabled: IpNetworkTable<Vec<Uuid>>,
    enable_seq: u64,
}

struct IndexedRule {
    rule: Rule,
    enabled_at: u64,
}

impl RulesRegistry {
    /// Hydrates the index from everything the store holds.
    pub fn from_store(store: Arc<dyn RuleStore>) -> Result<Self, RegistryError> {
        let mut index = Index {
            by_id: HashMap::new(),
            enabled: IpNetworkTable::new(),
            enable_seq: 0,
        };

        for rule in store.all_rules()? {
            index.insert(rule);
        }

        Ok(Self {
            store,
            index: RwLock::new(index),
        })
    }

    /// Persists and indexes a new rule. The store assigns the uuid.
    pub fn add(&self, spec: RuleSpec) -> Result<Uuid, RegistryError> {
        let mut index = self.index.write();

        if spec.enabled && index.has_enabled(spec.matcher.ue_prefix) {
            return Err(RegistryError::Duplicate);
        }

        let id = match spec.kind {
            crate::RuleKind::Uplink => {
                let teid = spec
                    .matcher
                    .teid
                    .ok_or(RegistryError::Invalid("uplink rule without teid"))?;
                let srgw = spec
                    .matcher
                    .srgw
                    .ok_or(RegistryError::Invalid("uplink rule without srgw"))?;
                let gnb = spec
                    .matcher
                    .gnb
                    .ok_or(RegistryError::Invalid("uplink rule without gnb"))?;

                self.store.insert_uplink_rule(
                    spec.enabled,
                    teid,
                    srgw,
                    gnb,
                    spec.matcher.ue_prefix,
                    spec.action.clone(),
                )?
            }
            crate::RuleKind::Downlink => self.store.insert_downlink_rule(
                spec.enabled,
                spec.matcher.ue_prefix,
                spec.action.clone(),
            )?,
        };

        index.insert(spec.into_rule(id));

        Ok(id)
    }

    pub fn enable(&self, id: Uuid) -> Result<(), RegistryError> {
        let mut index = self.index.write();

        index.check_can_enable(id)?;
        self.store.enable_rule(id)?;
        index.set_enabled(id, true);

        Ok(())
    }

    pub fn disable(&self, id: Uuid) -> Result<(), RegistryError> {
        let mut index = self.index.write();

        if !index.by_id.contains_key(&id) {
            return Err(RegistryError::NotFound);
        }

        self.store.disable_rule(id)?;
        index.set_enabled(id, false);

        Ok(())
    }

    /// Atomically disables one rule and enables another. Readers observe
    /// either both transitions or neither.
    pub fn switch(&self, enable_id: Uuid, disable_id: Uuid) -> Result<(), RegistryError> {
        let mut index = self.index.write();

        if !index.by_id.contains_key(&enable_id) || !index.by_id.contains_key(&disable_id) {
            return Err(RegistryError::NotFound);
        }

        self.store.disable_rule(disable_id)?;
        index.set_enabled(disable_id, false);

        if let Err(e) = index.check_can_enable(enable_id) {
            // Roll the first transition back rather than black-holing.
            self.store.enable_rule(disable_id)?;
            index.set_enabled(disable_id, true);

            return Err(e);
        }

        self.store.enable_rule(enable_id)?;
        index.set_enabled(enable_id, true);

        Ok(())
    }

    pub fn delete(&self, id: Uuid) -> Result<(), RegistryError> {
        let mut index = self.index.write();

        if !index.by_id.contains_key(&id) {
            return Err(RegistryError::NotFound);
        }

        self.store.delete_rule(id)?;
        index.set_enabled(id, false);
        index.by_id.remove(&id);

        Ok(())
    }

    pub fn update_action(&self, id: Uuid, action: Action) -> Result<(), RegistryError> {
        let mut index = self.index.write();

        let entry = index.by_id.get_mut(&id).ok_or(RegistryError::NotFound)?;

        self.store.update_action(id, action.clone())?;
        entry.rule.action = action;

        Ok(())
    }

    /// Longest-prefix match across enabled rules; ties (transient
    /// duplicates on one prefix) go to the most recently enabled rule.
    pub fn lookup(&self, addr: IpAddr) -> Option<Action> {
        let index = self.index.read();
        let (_, ids) = index.enabled.longest_match(addr)?;

        ids.iter()
            .filter_map(|id| index.by_id.get(id))
            .max_by_key(|entry| entry.enabled_at)
            .map(|entry| entry.rule.action.clone())
    }

    pub fn get(&self, id: Uuid) -> Option<Rule> {
        self.index.read().by_id.get(&id).map(|e| e.rule.clone())
    }

    pub fn list(&self) -> Vec<Rule> {
        self.index
            .read()
            .by_id
            .values()
            .map(|e| e.rule.clone())
            .collect()
    }
}

impl Index {
    fn insert(&mut self, rule: Rule) {
        let id = rule.uuid;
        let enabled = rule.enabled;

        self.enable_seq += 1;
        self.by_id.insert(
            id,
            IndexedRule {
                rule,
                enabled_at: self.enable_seq,
            },
        );

        if enabled {
            self.attach(id);
        }
    }

    fn has_enabled(&self, prefix: IpNetwork) -> bool {
        self.enabled
            .exact_match(prefix)
            .is_some_and(|ids| !ids.is_empty())
    }

    fn check_can_enable(&self, id: Uuid) -> Result<(), RegistryError> {
        let entry = self.by_id.get(&id).ok_or(RegistryError::NotFound)?;

        if entry.rule.enabled {
            return Ok(());
        }

        if self.has_enabled(entry.rule.matcher.ue_prefix) {
            return Err(RegistryError::Duplicate);
        }

        Ok(())
    }

    fn set_enabled(&mut self, id: Uuid, enabled: bool) {
        let Some(entry) = self.by_id.get_mut(&id) else {
            return;
        };

        if entry.rule.enabled == enabled {
            return;
        }

        entry.rule.enabled = enabled;

        if enabled {
            self.enable_seq += 1;
            entry.enabled_at = self.enable_seq;
            self.attach(id);
        } else {
            self.detach(id);
        }
    }

    fn attach(&mut self, id: Uuid) {
        let Some(prefix) = self.prefix_of(id) else {
            return;
        };

        let mut ids = self.enabled.remove(prefix).unwrap_or_default();

        if let Some(previous) = ids.first() {
            tracing::warn!(%id, %previous, %prefix, "Broken invariant: match already has an enabled rule");
        }

        ids.push(id);
        self.enabled.insert(prefix, ids);
    }

    fn detach(&mut self, id: Uuid) {
        let Some(prefix) = self.prefix_of(id) else {
            return;
        };

        let mut ids = self.enabled.remove(prefix).unwrap_or_default();
        ids.retain(|other| *other != id);

        if !ids.is_empty() {
            self.enabled.insert(prefix, ids);
        }
    }

    fn prefix_of(&self, id: Uuid) -> Option<IpNetwork> {
        self.by_id.get(&id).map(|e| e.rule.matcher.ue_prefix)
    }
}
