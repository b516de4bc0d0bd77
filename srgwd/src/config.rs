//! YAML configuration of the gateway.

use anyhow::{Context as _, Result};
use ip_network::{IpNetwork, Ipv6Network};
use serde::{Deserialize, Deserializer, de};
use std::fmt;
use std::net::{Ipv6Addr, SocketAddr};
use std::path::Path;

pub fn load(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    serde_yaml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Where the rules control plane listens.
    #[serde(rename = "http-address", default = "default_http_address")]
    pub http_address: SocketAddr,
    /// TTL of rewritten outer IPv4 headers.
    #[serde(default = "default_hops")]
    pub ttl: u8,
    /// Hop limit of rewritten outer IPv6 headers.
    #[serde(rename = "hop-limit", default = "default_hops")]
    pub hop_limit: u8,
    /// MTU applied to the tunnel devices, when set.
    #[serde(default)]
    pub mtu: Option<u32>,
    #[serde(default)]
    pub headends: Vec<Headend>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

fn default_http_address() -> SocketAddr {
    "[::1]:8080".parse().expect("literal address parses")
}

fn default_hops() -> u8 {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct Headend {
    /// Also names the tunnel device the function is bound to.
    pub name: String,
    /// Prefix of the traffic this headend handles.
    pub to: IpNetwork,
    pub provider: Provider,
    pub behavior: Behavior,
    #[serde(default)]
    pub policy: Option<Policy>,
    /// /64 base of the egress IPv6 source addresses (H.M.GTP4.D).
    #[serde(rename = "set-source-prefix", default)]
    pub source_prefix: Option<Ipv6Addr>,
    /// Egress IPv6 source address (End.M.GTP6.D).
    #[serde(rename = "set-source-address", default)]
    pub source_address: Option<Ipv6Addr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    pub name: String,
    /// The SID prefix terminating at this endpoint.
    pub to: Ipv6Network,
    pub provider: Provider,
    pub behavior: Behavior,
    /// Egress IPv6 source address (End.M.GTP6.E).
    #[serde(rename = "set-source-address", default)]
    pub source_address: Option<Ipv6Addr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Policy {
    #[serde(rename = "match", default)]
    pub matcher: Option<PolicyMatch>,
    /// Binding SID naming this policy.
    pub bsid: Ipv6Addr,
    /// Segments in travel order; the last one is the endpoint SID base.
    pub segments: Vec<Ipv6Addr>,
    /// Prefix length of the endpoint the last segment belongs to.
    #[serde(
        rename = "endpoint-prefix-length",
        default = "default_endpoint_prefix_len"
    )]
    pub endpoint_prefix_len: u8,
}

fn default_endpoint_prefix_len() -> u8 {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyMatch {
    pub prefix: IpNetwork,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Linux,
    NextMn,
    NextMnWithController,
}

impl<'de> Deserialize<'de> for Provider {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;

        match raw.to_lowercase().as_str() {
            "linux" => Ok(Provider::Linux),
            "nextmn" => Ok(Provider::NextMn),
            "nextmn-ctrl" | "nextmnwithcontroller" | "nextmn-with-controller"
            | "nextmn-via-controller" => Ok(Provider::NextMnWithController),
            other => Err(de::Error::custom(format!("unknown provider: {other}"))),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Linux => write!(f, "Linux"),
            Provider::NextMn => write!(f, "NextMN"),
            Provider::NextMnWithController => write!(f, "NextMN (via controller)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    HMGtp4D,
    EndMGtp4E,
    EndMGtp6D,
    EndMGtp6E,
}

impl<'de> Deserialize<'de> for Behavior {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;

        match raw.as_str() {
            "H.M.GTP4.D" => Ok(Behavior::HMGtp4D),
            "End.M.GTP4.E" => Ok(Behavior::EndMGtp4E),
            "End.M.GTP6.D" => Ok(Behavior::EndMGtp6D),
            "End.M.GTP6.E" => Ok(Behavior::EndMGtp6E),
            other => Err(de::Error::custom(format!("unknown behavior: {other}"))),
        }
    }
}

impl fmt::Display for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Behavior::HMGtp4D => write!(f, "H.M.GTP4.D"),
            Behavior::EndMGtp4E => write!(f, "End.M.GTP4.E"),
            Behavior::EndMGtp6D => write!(f, "End.M.GTP6.D"),
            Behavior::EndMGtp6E => write!(f, "End.M.GTP6.E"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_config() {
        let config: Config = serde_yaml::from_str(
            r#"
http-address: "127.0.0.1:8080"
ttl: 32
hop-limit: 48
headends:
  - name: sr-he-gtp4
    to: "10.0.0.0/8"
    provider: nextmn
    behavior: H.M.GTP4.D
    set-source-prefix: "fd00:cafe::"
    policy:
      bsid: "fd00:b51d::1"
      segments: ["fd00:1::1", "fd00:2::2"]
      endpoint-prefix-length: 64
endpoints:
  - name: sr-ep-gtp4
    to: "fd00:2::/64"
    provider: nextmn
    behavior: End.M.GTP4.E
"#,
        )
        .unwrap();

        assert_eq!(config.ttl, 32);
        assert_eq!(config.hop_limit, 48);
        assert_eq!(config.mtu, None);
        assert_eq!(config.headends.len(), 1);
        assert_eq!(config.headends[0].behavior, Behavior::HMGtp4D);
        assert_eq!(config.headends[0].provider, Provider::NextMn);
        assert_eq!(config.endpoints[0].behavior, Behavior::EndMGtp4E);
        assert_eq!(config.endpoints[0].to.netmask(), 64);
    }

    #[test]
    fn accepts_all_controller_provider_spellings() {
        for spelling in [
            "nextmn-ctrl",
            "nextmnwithcontroller",
            "nextmn-with-controller",
            "nextmn-via-controller",
        ] {
            let provider: Provider = serde_yaml::from_str(spelling).unwrap();

            assert_eq!(provider, Provider::NextMnWithController, "{spelling}");
        }

        assert_eq!(
            serde_yaml::from_str::<Provider>("Linux").unwrap(),
            Provider::Linux
        );
        assert!(serde_yaml::from_str::<Provider>("frr").is_err());
    }

    #[test]
    fn rejects_unknown_behaviors() {
        assert!(serde_yaml::from_str::<Behavior>("End.DT6").is_err());
    }
}
