//! Endpoint behaviors: SRv6 ingress, GTP-U egress.

use crate::{Error, inner_destination};
use etherparse::{
    IpFragOffset, IpNumber, Ipv4Dscp, Ipv4Ecn, Ipv4Header, Ipv4Options, Ipv6FlowLabel, Ipv6Header,
    UdpHeader,
};
use ip_network::{IpNetwork, Ipv6Network};
use mup::{Gtp4DstFields, Gtp4SrcFields, Gtp6SidFields};
use rules::{Action, RulesRegistry};
use sr_packet::{GTPU_PORT, Packet, PacketError, PduSessionContainer, gtpu};
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;

/// End.M.GTP4.E: SRv6 ingress, IPv4/UDP/GTP-U egress.
///
/// The whole GTP tunnel is reconstructed from the two addresses: the
/// destination yields the IPv4 peer, QFI and PDU session id (the TEID),
/// the source the IPv4 source and the original UDP source port.
pub struct EndpointGtp4 {
    prefix: IpNetwork,
    prefix_len: u8,
    ttl: u8,
}

impl EndpointGtp4 {
    /// Fails when the SID prefix leaves no room for the embedded IPv4
    /// address. Fatal at startup, per configuration.
    pub fn new(prefix: Ipv6Network, ttl: u8) -> Result<Self, mup::EncodingError> {
        mup::check_gtp4_prefix(prefix.netmask())?;

        Ok(Self {
            prefix_len: prefix.netmask(),
            prefix: IpNetwork::V6(prefix),
            ttl,
        })
    }

    pub fn handle(&self, packet: &[u8]) -> Result<Vec<u8>, Error> {
        let pqt = Packet::parse_v6(packet)?;
        pqt.check_da_in_prefix(&self.prefix)?;

        // The SRH is optional here: a one-segment policy collapses into
        // the destination address.
        if let Some(srh) = pqt.srh()
            && srh.segments_left() != 0
        {
            // TODO: send an ICMPv6 Parameter Problem (code 0, pointer on
            // Segments Left) back to the source before dropping.
            return Err(Error::SegmentsLeftNonZero);
        }

        let (source, destination) = v6_endpoints(&pqt)?;
        let da = Gtp4DstFields::decode(destination, self.prefix_len)?;
        let sa = Gtp4SrcFields::decode(source);

        let pdu = pqt.pop_ipv6_headers()?;

        let container = PduSessionContainer {
            pdu_type: 0,
            qfi: da.qfi(),
            pdu_session_id: Some(da.pdu_session_id()),
        };

        let mut gtp = Vec::with_capacity(20 + pdu.bytes.len());
        gtpu::write_gpdu(&mut gtp, da.pdu_session_id(), Some(&container), pdu.bytes)?;

        let udp_len = UdpHeader::LEN + gtp.len();
        let total_len = u16::try_from(Ipv4Header::MIN_LEN + udp_len)
            .map_err(|_| Error::Build("PDU exceeds an IPv4 payload".to_owned()))?;

        let mut ip = Ipv4Header {
            options: Ipv4Options::default(),
            // The QFI travels on as the DSCP.
            dscp: Ipv4Dscp::try_new(da.qfi()).map_err(|e| Error::Build(e.to_string()))?,
            ecn: Ipv4Ecn::default(),
            total_len,
            identification: 0,
            // Fragmenting GTP-U is a waste; TS 29.281 wants DF and a sane
            // inner MTU instead.
            dont_fragment: true,
            more_fragments: false,
            fragment_offset: IpFragOffset::ZERO,
            time_to_live: self.ttl,
            protocol: IpNumber::UDP,
            header_checksum: 0,
            source: sa.ipv4().octets(),
            destination: da.ipv4().octets(),
        };
        ip.header_checksum = ip.calc_header_checksum();

        let udp = UdpHeader::with_ipv4_checksum(sa.udp_port(), GTPU_PORT, &ip, &gtp)
            .map_err(|e| Error::Build(e.to_string()))?;

        let mut out = Vec::with_capacity(Ipv4Header::MIN_LEN + udp_len);
        ip.write(&mut out).map_err(|e| Error::Build(e.to_string()))?;
        udp.write(&mut out).map_err(|e| Error::Build(e.to_string()))?;
        out.extend_from_slice(&gtp);

        Ok(out)
    }
}

/// End.M.GTP6.E: SRv6 ingress, IPv6/UDP/GTP-U egress.
///
/// QFI and session id ride in the SID arguments, but a GTP peer address
/// cannot: it is resolved through the registry's downlink action for the
/// encapsulated destination.
pub struct EndpointGtp6 {
    prefix: IpNetwork,
    prefix_len: u8,
    source: Ipv6Addr,
    hop_limit: u8,
    registry: Arc<RulesRegistry>,
}

impl EndpointGtp6 {
    pub fn new(
        prefix: Ipv6Network,
        source: Ipv6Addr,
        hop_limit: u8,
        registry: Arc<RulesRegistry>,
    ) -> Result<Self, mup::EncodingError> {
        mup::check_gtp6_prefix(prefix.netmask())?;

        Ok(Self {
            prefix_len: prefix.netmask(),
            prefix: IpNetwork::V6(prefix),
            source,
            hop_limit,
            registry,
        })
    }

    pub fn handle(&self, packet: &[u8]) -> Result<Vec<u8>, Error> {
        let pqt = Packet::parse_v6(packet)?;
        pqt.check_da_in_prefix(&self.prefix)?;

        if let Some(srh) = pqt.srh()
            && srh.segments_left() != 0
        {
            return Err(Error::SegmentsLeftNonZero);
        }

        let (_, destination) = v6_endpoints(&pqt)?;
        let sid = Gtp6SidFields::decode(destination, self.prefix_len)?;

        let pdu = pqt.pop_ipv6_headers()?;

        let ue = inner_destination(pdu.bytes)
            .ok_or(PacketError::Malformed("inner PDU is not an IP packet"))?;

        let (teid, peer) = match self.registry.lookup(ue) {
            Some(Action::Gtp { teid, peer }) => (teid, peer),
            Some(Action::Srh(_)) => return Err(Error::ActionMismatch),
            None => return Err(Error::NoMatchingRule),
        };
        let IpAddr::V6(peer) = peer else {
            return Err(Error::ActionMismatch);
        };

        let container = PduSessionContainer {
            pdu_type: 0,
            qfi: sid.qfi(),
            pdu_session_id: Some(sid.pdu_session_id()),
        };

        let mut gtp = Vec::with_capacity(20 + pdu.bytes.len());
        gtpu::write_gpdu(&mut gtp, teid, Some(&container), pdu.bytes)?;

        let udp_len = UdpHeader::LEN + gtp.len();
        let payload_length = u16::try_from(udp_len)
            .map_err(|_| Error::Build("PDU exceeds an IPv6 payload".to_owned()))?;

        let ip = Ipv6Header {
            traffic_class: 0,
            flow_label: Ipv6FlowLabel::ZERO,
            payload_length,
            next_header: IpNumber::UDP,
            hop_limit: self.hop_limit,
            source: self.source.octets(),
            destination: peer.octets(),
        };

        let udp = UdpHeader::with_ipv6_checksum(GTPU_PORT, GTPU_PORT, &ip, &gtp)
            .map_err(|e| Error::Build(e.to_string()))?;

        let mut out = Vec::with_capacity(Ipv6Header::LEN + udp_len);
        ip.write(&mut out).map_err(|e| Error::Build(e.to_string()))?;
        udp.write(&mut out).map_err(|e| Error::Build(e.to_string()))?;
        out.extend_from_slice(&gtp);

        Ok(out)
    }
}

fn v6_endpoints(pqt: &Packet<'_>) -> Result<(Ipv6Addr, Ipv6Addr), Error> {
    match (pqt.source(), pqt.destination()) {
        (IpAddr::V6(src), IpAddr::V6(dst)) => Ok((src, dst)),
        _ => Err(PacketError::Malformed("expected an IPv6 packet").into()),
    }
}
