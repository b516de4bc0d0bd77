//! Headend behaviors: GTP-U ingress, SRv6 egress.

use crate::{Error, inner_protocol, inner_source};
use etherparse::{IpNumber, Ipv6FlowLabel, Ipv6Header, UdpSlice};
use ip_network::IpNetwork;
use mup::{ArgsMobSession, Gtp4DstFields, Gtp4SrcFields, Gtp6SidFields};
use rules::{Action, RulesRegistry};
use sr_packet::{GTPU_PORT, GtpuSlice, MESSAGE_TYPE_GPDU, Packet, PacketError, srh};
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;

/// Where a headend takes its segment list from.
pub enum PolicySource {
    /// Statically configured policy, segments in travel order (the last
    /// one is the endpoint SID base that becomes the destination).
    Static(Vec<Ipv6Addr>),
    /// Resolved per packet against the rules registry.
    Registry {
        registry: Arc<RulesRegistry>,
        key: RegistryKey,
    },
}

/// Which address keys the registry lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKey {
    /// The destination of the outer GTP-U transport.
    OuterDestination,
    /// The source of the encapsulated UE packet (uplink).
    InnerSource,
}

impl PolicySource {
    fn resolve(&self, outer_destination: IpAddr, pdu: &[u8]) -> Result<Vec<Ipv6Addr>, Error> {
        let segments = match self {
            PolicySource::Static(segments) => segments.clone(),
            PolicySource::Registry { registry, key } => {
                let addr = match key {
                    RegistryKey::OuterDestination => outer_destination,
                    RegistryKey::InnerSource => inner_source(pdu)
                        .ok_or(PacketError::Malformed("inner PDU is not an IP packet"))?,
                };

                match registry.lookup(addr) {
                    Some(Action::Srh(segments)) => segments,
                    Some(Action::Gtp { .. }) => return Err(Error::ActionMismatch),
                    None => return Err(Error::NoMatchingRule),
                }
            }
        };

        if segments.is_empty() {
            return Err(Error::EmptyPolicy);
        }

        Ok(segments)
    }
}

/// H.M.GTP4.D: IPv4/UDP/GTP-U ingress, IPv6(+SRH) egress.
///
/// The GTP-U state moves into the addresses: the final segment carries the
/// embedded IPv4 destination and Args.Mob.Session, the source address the
/// IPv4 source and UDP source port.
pub struct HeadendGtp4 {
    prefix: IpNetwork,
    policy: PolicySource,
    endpoint_prefix_len: u8,
    source_prefix: Ipv6Addr,
    hop_limit: u8,
}

impl HeadendGtp4 {
    pub fn new(
        prefix: IpNetwork,
        policy: PolicySource,
        endpoint_prefix_len: u8,
        source_prefix: Ipv6Addr,
        hop_limit: u8,
    ) -> Result<Self, mup::EncodingError> {
        mup::check_gtp4_prefix(endpoint_prefix_len)?;

        Ok(Self {
            prefix,
            policy,
            endpoint_prefix_len,
            source_prefix,
            hop_limit,
        })
    }

    pub fn handle(&self, packet: &[u8]) -> Result<Vec<u8>, Error> {
        let pqt = Packet::parse_v4(packet)?;
        pqt.check_da_in_prefix(&self.prefix)?;

        let layers = pqt.pop_gtp4_headers()?;
        let pdu = layers.gtpu.payload();
        let (qfi, session_id) = session_of(&layers.gtpu);

        let segments = self.policy.resolve(pqt.destination(), pdu)?;
        // resolve() refuses empty policies.
        let (last, rest) = segments.split_last().ok_or(Error::EmptyPolicy)?;

        let args = ArgsMobSession::new(qfi, false, false, session_id)?;
        let destination =
            Gtp4DstFields::encode(*last, self.endpoint_prefix_len, layers.destination, args)?;
        let source = Gtp4SrcFields::encode(self.source_prefix, layers.source, layers.udp_source);

        emit_srv6(source, destination, rest, self.hop_limit, pdu)
    }
}

/// End.M.GTP6.D: IPv6/UDP/GTP-U ingress, IPv6(+SRH) egress.
///
/// The IPv6-transport sibling of [`HeadendGtp4`]: nothing of the outer
/// transport needs embedding, so the egress source address comes from
/// configuration and only Args.Mob.Session rides in the final SID.
pub struct HeadendGtp6 {
    prefix: IpNetwork,
    policy: PolicySource,
    endpoint_prefix_len: u8,
    source: Ipv6Addr,
    hop_limit: u8,
}

impl HeadendGtp6 {
    pub fn new(
        prefix: IpNetwork,
        policy: PolicySource,
        endpoint_prefix_len: u8,
        source: Ipv6Addr,
        hop_limit: u8,
    ) -> Result<Self, mup::EncodingError> {
        mup::check_gtp6_prefix(endpoint_prefix_len)?;

        Ok(Self {
            prefix,
            policy,
            endpoint_prefix_len,
            source,
            hop_limit,
        })
    }

    pub fn handle(&self, packet: &[u8]) -> Result<Vec<u8>, Error> {
        let pqt = Packet::parse_v6(packet)?;
        pqt.check_da_in_prefix(&self.prefix)?;

        let gtpu = pop_gtp6_headers(&pqt)?;
        let pdu = gtpu.payload();
        let (qfi, session_id) = session_of(&gtpu);

        let segments = self.policy.resolve(pqt.destination(), pdu)?;
        let (last, rest) = segments.split_last().ok_or(Error::EmptyPolicy)?;

        let args = ArgsMobSession::new(qfi, false, false, session_id)?;
        let destination = Gtp6SidFields::encode(*last, self.endpoint_prefix_len, args)?;

        emit_srv6(self.source, destination, rest, self.hop_limit, pdu)
    }
}

/// The GTP6 equivalent of `pop_gtp4_headers`: IPv6 (plus extensions) /
/// UDP towards 2152 / G-PDU.
fn pop_gtp6_headers<'a>(pqt: &Packet<'a>) -> Result<GtpuSlice<'a>, Error> {
    let inner = pqt.pop_ipv6_headers()?;

    if inner.protocol != IpNumber::UDP {
        return Err(PacketError::Malformed("no UDP layer").into());
    }

    let udp =
        UdpSlice::from_slice(inner.bytes).map_err(|_| PacketError::Malformed("bad UDP header"))?;

    if udp.destination_port() != GTPU_PORT {
        return Err(PacketError::NotGtpu.into());
    }

    let gtpu = GtpuSlice::from_slice(udp.payload())?;

    if gtpu.message_type() != MESSAGE_TYPE_GPDU {
        return Err(PacketError::UnexpectedMessageType(gtpu.message_type()).into());
    }

    Ok(gtpu)
}

/// QFI and PDU session id of an ingress G-PDU. Without a PDU Session
/// Container the TEID stands in for the session id.
fn session_of(gtpu: &GtpuSlice<'_>) -> (u8, u32) {
    let container = gtpu.pdu_session_container();
    let qfi = container.map(|c| c.qfi).unwrap_or(0);
    let session_id = container
        .and_then(|c| c.pdu_session_id)
        .unwrap_or_else(|| gtpu.teid());

    (qfi, session_id)
}

/// IPv6 | SRH (unless the policy collapsed into the DA) | PDU.
///
/// `transit` holds the non-final segments in travel order; the SRH stores
/// them reversed per RFC 8754 with SegmentsLeft = LastEntry = len - 1.
fn emit_srv6(
    source: Ipv6Addr,
    destination: Ipv6Addr,
    transit: &[Ipv6Addr],
    hop_limit: u8,
    pdu: &[u8],
) -> Result<Vec<u8>, Error> {
    let inner = inner_protocol(pdu);

    let srh_len = if transit.is_empty() {
        0
    } else {
        8 + 16 * transit.len()
    };

    let payload_length = u16::try_from(srh_len + pdu.len())
        .map_err(|_| Error::Build("payload exceeds an IPv6 payload".to_owned()))?;

    let header = Ipv6Header {
        traffic_class: 0,
        flow_label: Ipv6FlowLabel::ZERO,
        payload_length,
        next_header: if transit.is_empty() {
            inner
        } else {
            IpNumber::IPV6_ROUTE_HEADER
        },
        hop_limit,
        source: source.octets(),
        destination: destination.octets(),
    };

    let mut out = Vec::with_capacity(Ipv6Header::LEN + srh_len + pdu.len());
    header
        .write(&mut out)
        .map_err(|e| Error::Build(e.to_string()))?;

    if !transit.is_empty() {
        let reversed: Vec<Ipv6Addr> = transit.iter().rev().copied().collect();
        let segments_left = (reversed.len() - 1) as u8;

        srh::write_segment_routing_header(&mut out, inner, segments_left, &reversed);
    }

    out.extend_from_slice(pdu);

    Ok(out)
}
