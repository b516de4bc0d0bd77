//! Persistent rule store binding.
//!
//! The backing database exposes fixed-arity stored procedures; any store
//! that satisfies [`PROCEDURES`] can sit behind [`RuleStore`]. The
//! in-memory implementation is both the test double and the default
//! backend when no database is configured.

use crate::{Action, Rule, RuleKind, RuleMatch, RuleSpec};
use ip_network::IpNetwork;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use uuid::Uuid;

/// Stored procedure signatures (name, in-arity, out-arity) the store
/// contract is built against.
pub const PROCEDURES: [(&str, usize, usize); 9] = [
    ("insert_uplink_rule", 5, 1),
    ("insert_downlink_rule", 4, 1),
    ("enable_rule", 1, 0),
    ("disable_rule", 1, 0),
    ("delete_rule", 1, 0),
    ("get_uplink_action", 3, 2),
    ("set_uplink_action", 3, 2),
    ("get_downlink_action", 1, 2),
    ("get_rule", 1, 6),
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("rule not found")]
    NotFound,
    #[error("rule already exists")]
    Duplicate,
    #[error("store failure: {0}")]
    Backend(String),
}

pub trait RuleStore: Send + Sync {
    /// `insert_uplink_rule`: persists an uplink rule keyed by
    /// (teid, srgw, gnb) over a UE prefix; returns the assigned uuid.
    fn insert_uplink_rule(
        &self,
        enabled: bool,
        teid: u32,
        srgw: IpAddr,
        gnb: IpAddr,
        ue_prefix: IpNetwork,
        action: Action,
    ) -> Result<Uuid, StoreError>;

    /// `insert_downlink_rule`: persists a downlink rule over a UE prefix.
    fn insert_downlink_rule(
        &self,
        enabled: bool,
        ue_prefix: IpNetwork,
        action: Action,
    ) -> Result<Uuid, StoreError>;

    fn enable_rule(&self, id: Uuid) -> Result<(), StoreError>;

    fn disable_rule(&self, id: Uuid) -> Result<(), StoreError>;

    fn delete_rule(&self, id: Uuid) -> Result<(), StoreError>;

    /// `get_uplink_action`: the action of the enabled uplink rule pinned to
    /// this tunnel.
    fn get_uplink_action(&self, teid: u32, srgw: IpAddr, gnb: IpAddr)
    -> Result<Action, StoreError>;

    /// `set_uplink_action`: replaces the action of the enabled uplink rule
    /// pinned to this tunnel and returns the new value.
    fn set_uplink_action(
        &self,
        teid: u32,
        srgw: IpAddr,
        gnb: IpAddr,
        action: Action,
    ) -> Result<Action, StoreError>;

    /// `get_downlink_action`: the action of the enabled downlink rule with
    /// the longest prefix containing `ue`.
    fn get_downlink_action(&self, ue: IpAddr) -> Result<Action, StoreError>;

    fn get_rule(&self, id: Uuid) -> Result<Rule, StoreError>;

    fn update_action(&self, id: Uuid, action: Action) -> Result<(), StoreError>;

    /// Full dump, used to hydrate the in-memory registry at startup.
    fn all_rules(&self) -> Result<Vec<Rule>, StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    rules: RwLock<HashMap<Uuid, Rule>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryStore {
    fn insert(&self, spec: RuleSpec) -> Uuid {
        let id = Uuid::new_v4();
        self.rules.write().insert(id, spec.into_rule(id));

        id
    }

    fn with_rule<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Rule) -> T,
    ) -> Result<T, StoreError> {
        let mut rules = self.rules.write();
        let rule = rules.get_mut(&id).ok_or(StoreError::NotFound)?;

        Ok(f(rule))
    }
}

impl RuleStore for MemoryStore {
    fn insert_uplink_rule(
        &self,
        enabled: bool,
        teid: u32,
        srgw: IpAddr,
        gnb: IpAddr,
        ue_prefix: IpNetwork,
        action: Action,
    ) -> Result<Uuid, StoreError> {
        Ok(self.insert(RuleSpec {
            kind: RuleKind::Uplink,
            enabled,
            matcher: RuleMatch {
                ue_prefix,
                teid: Some(teid),
                gnb: Some(gnb),
                srgw: Some(srgw),
            },
            action,
        }))
    }

    fn insert_downlink_rule(
        &self,
        enabled: bool,
        ue_prefix: IpNetwork,
        action: Action,
    ) -> Result<Uuid, StoreError> {
        Ok(self.insert(RuleSpec {
            kind: RuleKind::Downlink,
            enabled,
            matcher: RuleMatch {
                ue_prefix,
                teid: None,
                gnb: None,
                srgw: None,
            },
            action,
        }))
    }

    fn enable_rule(&self, id: Uuid) -> Result<(), StoreError> {
        self.with_rule(id, |rule| rule.enabled = true)
    }

    fn disable_rule(&self, id: Uuid) -> Result<(), StoreError> {
        self.with_rule(id, |rule| rule.enabled = false)
    }

    fn delete_rule(&self, id: Uuid) -> Result<(), StoreError> {
        self.rules
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    fn get_uplink_action(
        &self,
        teid: u32,
        srgw: IpAddr,
        gnb: IpAddr,
    ) -> Result<Action, StoreError> {
        self.rules
            .read()
            .values()
            .find(|rule| {
                rule.enabled
                    && rule.kind == RuleKind::Uplink
                    && rule.matcher.teid == Some(teid)
                    && rule.matcher.srgw == Some(srgw)
                    && rule.matcher.gnb == Some(gnb)
            })
            .map(|rule| rule.action.clone())
            .ok_or(StoreError::NotFound)
    }

    fn set_uplink_action(
        &self,
        teid: u32,
        srgw: IpAddr,
        gnb: IpAddr,
        action: Action,
    ) -> Result<Action, StoreError> {
        let mut rules = self.rules.write();

        let rule = rules
            .values_mut()
            .find(|rule| {
                rule.enabled
                    && rule.kind == RuleKind::Uplink
                    && rule.matcher.teid == Some(teid)
                    && rule.matcher.srgw == Some(srgw)
                    && rule.matcher.gnb == Some(gnb)
            })
            .ok_or(StoreError::NotFound)?;

        rule.action = action;

        Ok(rule.action.clone())
    }

    fn get_downlink_action(&self, ue: IpAddr) -> Result<Action, StoreError> {
        self.rules
            .read()
            .values()
            .filter(|rule| {
                rule.enabled
                    && rule.kind == RuleKind::Downlink
                    && rule.matcher.ue_prefix.contains(ue)
            })
            .max_by_key(|rule| rule.matcher.ue_prefix.netmask())
            .map(|rule| rule.action.clone())
            .ok_or(StoreError::NotFound)
    }

    fn get_rule(&self, id: Uuid) -> Result<Rule, StoreError> {
        self.rules
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn update_action(&self, id: Uuid, action: Action) -> Result<(), StoreError> {
        self.with_rule(id, |rule| rule.action = action)
    }

    fn all_rules(&self) -> Result<Vec<Rule>, StoreError> {
        Ok(self.rules.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn procedure_arities_match_the_store_contract() {
        let expect = |name: &str| {
            PROCEDURES
                .iter()
                .find(|(n, _, _)| *n == name)
                .copied()
                .unwrap()
        };

        assert_eq!(expect("insert_uplink_rule"), ("insert_uplink_rule", 5, 1));
        assert_eq!(
            expect("insert_downlink_rule"),
            ("insert_downlink_rule", 4, 1)
        );
        assert_eq!(expect("enable_rule"), ("enable_rule", 1, 0));
        assert_eq!(expect("disable_rule"), ("disable_rule", 1, 0));
        assert_eq!(expect("delete_rule"), ("delete_rule", 1, 0));
        assert_eq!(expect("get_uplink_action"), ("get_uplink_action", 3, 2));
        assert_eq!(expect("set_uplink_action"), ("set_uplink_action", 3, 2));
        assert_eq!(expect("get_downlink_action"), ("get_downlink_action", 1, 2));
        assert_eq!(expect("get_rule"), ("get_rule", 1, 6));
    }

    #[test]
    fn downlink_action_prefers_longest_prefix() {
        let store = MemoryStore::new();
        let wide = Action::Gtp {
            teid: 1,
            peer: "10.0.0.1".parse().unwrap(),
        };
        let narrow = Action::Gtp {
            teid: 2,
            peer: "10.0.0.2".parse().unwrap(),
        };

        store
            .insert_downlink_rule(true, "10.45.0.0/16".parse().unwrap(), wide)
            .unwrap();
        store
            .insert_downlink_rule(true, "10.45.1.0/24".parse().unwrap(), narrow.clone())
            .unwrap();

        assert_eq!(
            store
                .get_downlink_action("10.45.1.9".parse().unwrap())
                .unwrap(),
            narrow
        );
    }

    #[test]
    fn uplink_action_is_pinned_to_the_tunnel() {
        let store = MemoryStore::new();
        let srgw: IpAddr = "10.0.200.1".parse().unwrap();
        let gnb: IpAddr = "10.0.100.1".parse().unwrap();
        let action = Action::Srh(vec!["fd00:1::1".parse().unwrap()]);

        store
            .insert_uplink_rule(
                true,
                7,
                srgw,
                gnb,
                "10.45.0.0/16".parse().unwrap(),
                action.clone(),
            )
            .unwrap();

        assert_eq!(store.get_uplink_action(7, srgw, gnb).unwrap(), action);
        assert_eq!(
            store.get_uplink_action(8, srgw, gnb),
            Err(StoreError::NotFound)
        );
    }

    #[test]
    fn get_rule_returns_the_stored_record() {
        let store = MemoryStore::new();
        let action = Action::Gtp {
            teid: 3,
            peer: "10.0.100.1".parse().unwrap(),
        };

        let id = store
            .insert_downlink_rule(false, "10.45.0.0/16".parse().unwrap(), action.clone())
            .unwrap();

        let rule = store.get_rule(id).unwrap();
        assert_eq!(rule.uuid, id);
        assert_eq!(rule.kind, RuleKind::Downlink);
        assert!(!rule.enabled);
        assert_eq!(rule.action, action);
        assert_eq!(store.get_rule(Uuid::new_v4()), Err(StoreError::NotFound));
    }
}
