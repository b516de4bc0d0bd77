//! Traffic rules: the JSON-facing model, the persistent store binding and
//! the in-memory registry the data plane resolves actions against.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod registry;
mod store;

pub use registry::{RegistryError, RulesRegistry};
pub use store::{MemoryStore, PROCEDURES, RuleStore, StoreError};

use ip_network::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv6Addr};
use uuid::Uuid;

/// A persisted traffic rule, as exchanged over the control API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub uuid: Uuid,
    #[serde(rename = "type")]
    pub kind: RuleKind,
    pub enabled: bool,
    #[serde(rename = "match")]
    pub matcher: RuleMatch,
    pub action: Action,
}

/// A rule as posted by the control plane; the store assigns the uuid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    #[serde(rename = "type")]
    pub kind: RuleKind,
    pub enabled: bool,
    #[serde(rename = "match")]
    pub matcher: RuleMatch,
    pub action: Action,
}

impl RuleSpec {
    pub fn into_rule(self, uuid: Uuid) -> Rule {
        Rule {
            uuid,
            kind: self.kind,
            enabled: self.enabled,
            matcher: self.matcher,
            action: self.action,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Uplink,
    Downlink,
}

/// What a rule matches on. Downlink rules match the UE prefix alone;
/// uplink rules additionally pin the GTP tunnel (TEID + gNB + SR gateway).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    #[serde(rename = "ue-prefix")]
    pub ue_prefix: IpNetwork,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gnb: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srgw: Option<IpAddr>,
}

/// What to do with a matched packet: push an SR policy (the segment list,
/// first hop last) or re-encapsulate towards a GTP peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Srh(Vec<Ipv6Addr>),
    #[serde(rename = "gtp4", alias = "gtp6")]
    Gtp { teid: u32, peer: IpAddr },
}
