//! Mobile user-plane network functions.
//!
//! Each behavior of RFC 9433 the gateway supports is one handler: raw
//! datagram in, freshly allocated datagram out. Handlers are pure packet
//! transformations (plus at most one registry lookup); the [`Runner`]
//! drives one handler over one tunnel device.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod endpoint;
mod headend;
mod runner;

pub use endpoint::{EndpointGtp4, EndpointGtp6};
pub use headend::{HeadendGtp4, HeadendGtp6, PolicySource, RegistryKey};
pub use runner::{Counters, CountersSnapshot, Runner};

use sr_packet::PacketError;
use std::net::IpAddr;

/// Per-packet failure. Fatal to the packet, never to the runner.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("segments left is not zero")]
    SegmentsLeftNonZero,
    #[error("no rule matches the packet")]
    NoMatchingRule,
    #[error("the matched action does not fit this behavior")]
    ActionMismatch,
    #[error("the SR policy has no segments")]
    EmptyPolicy,
    #[error(transparent)]
    Encoding(#[from] mup::EncodingError),
    #[error("packet rebuild failed: {0}")]
    Build(String),
}

/// Coarse error classes the runner keeps counters for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Malformed,
    OutOfRange,
    SegmentsLeftNonZero,
    NoMatchingRule,
    Encoding,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Packet(PacketError::OutOfRange) => ErrorKind::OutOfRange,
            Error::Packet(_) => ErrorKind::Malformed,
            Error::SegmentsLeftNonZero => ErrorKind::SegmentsLeftNonZero,
            Error::NoMatchingRule => ErrorKind::NoMatchingRule,
            Error::Encoding(_) => ErrorKind::Encoding,
            Error::ActionMismatch | Error::EmptyPolicy | Error::Build(_) => ErrorKind::Other,
        }
    }
}

/// The closed set of behaviors a runner can host.
pub enum NetFunc {
    HeadendGtp4(HeadendGtp4),
    EndpointGtp4(EndpointGtp4),
    HeadendGtp6(HeadendGtp6),
    EndpointGtp6(EndpointGtp6),
}

impl NetFunc {
    pub fn handle(&self, packet: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            NetFunc::HeadendGtp4(h) => h.handle(packet),
            NetFunc::EndpointGtp4(e) => e.handle(packet),
            NetFunc::HeadendGtp6(h) => h.handle(packet),
            NetFunc::EndpointGtp6(e) => e.handle(packet),
        }
    }

    /// The RFC 9433 name of the hosted behavior.
    pub fn behavior(&self) -> &'static str {
        match self {
            NetFunc::HeadendGtp4(_) => "H.M.GTP4.D",
            NetFunc::EndpointGtp4(_) => "End.M.GTP4.E",
            NetFunc::HeadendGtp6(_) => "End.M.GTP6.D",
            NetFunc::EndpointGtp6(_) => "End.M.GTP6.E",
        }
    }
}

/// Source address of the encapsulated UE packet, judged by its version
/// nibble.
fn inner_source(pdu: &[u8]) -> Option<IpAddr> {
    match pdu.first()? >> 4 {
        4 => {
            let octets: [u8; 4] = pdu.get(12..16)?.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        6 => {
            let octets: [u8; 16] = pdu.get(8..24)?.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

/// Destination address of the encapsulated UE packet.
fn inner_destination(pdu: &[u8]) -> Option<IpAddr> {
    match pdu.first()? >> 4 {
        4 => {
            let octets: [u8; 4] = pdu.get(16..20)?.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        6 => {
            let octets: [u8; 16] = pdu.get(24..40)?.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

/// IP protocol number of the encapsulated PDU, or No-Next-Header when the
/// version nibble is unrecognizable.
fn inner_protocol(pdu: &[u8]) -> etherparse::IpNumber {
    match pdu.first().map(|b| b >> 4) {
        Some(4) => etherparse::IpNumber::IPV4,
        Some(6) => etherparse::IpNumber::IPV6,
        _ => etherparse::IpNumber(59),
    }
}

#[cfg(test)]
mod tests;
