//! Typed views over raw user-plane packets.
//!
//! A [`Packet`] borrows the datagram read from the tunnel device for the
//! duration of one handler invocation and exposes the layers the mobile
//! uplane behaviors need: the outer IPv4/IPv6 header, the IPv6 extension
//! header chain (including the SRH), UDP and GTP-U.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod gtpu;
pub mod srh;

pub use gtpu::{GTPU_PORT, GtpuSlice, MESSAGE_TYPE_GPDU, PduSessionContainer};
pub use srh::{SRH_ROUTING_TYPE, SegmentRoutingHeaderSlice};

use etherparse::{IpNumber, Ipv4Slice, Ipv6Slice, UdpSlice};
use ip_network::IpNetwork;
use std::net::{IpAddr, Ipv4Addr};

/// Length of the fixed IPv6 header.
const IPV6_HEADER_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("destination address is outside the handled prefix")]
    OutOfRange,
    #[error("nothing left after the IPv6 header chain")]
    NoInner,
    #[error("UDP destination port is not {GTPU_PORT}")]
    NotGtpu,
    #[error("unexpected GTP-U message type {0:#04x}")]
    UnexpectedMessageType(u8),
}

/// A read-only view over one datagram.
///
/// The version tag is authoritative: a packet tagged [`IpVersion::V6`]
/// parses as IPv6 at offset 0, `V4` as IPv4. Construction fails otherwise.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    buf: &'a [u8],
    version: IpVersion,
    source: IpAddr,
    destination: IpAddr,
}

/// The first layer after the popped header stack.
#[derive(Debug, Clone, Copy)]
pub struct InnerLayer<'a> {
    pub protocol: IpNumber,
    pub bytes: &'a [u8],
}

/// The decoded IPv4 / UDP / GTP-U ingress stack.
#[derive(Debug, Clone, Copy)]
pub struct Gtp4Layers<'a> {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub udp_source: u16,
    pub gtpu: GtpuSlice<'a>,
}

/// Result of walking the IPv6 extension header chain.
struct ExtensionWalk<'a> {
    srh: Option<SegmentRoutingHeaderSlice<'a>>,
    inner_protocol: IpNumber,
    inner_offset: usize,
    end: usize,
}

impl<'a> Packet<'a> {
    pub fn parse_v4(buf: &'a [u8]) -> Result<Self, PacketError> {
        if version_nibble(buf)? != 4 {
            return Err(PacketError::Malformed("expected an IPv4 packet"));
        }

        let ipv4 =
            Ipv4Slice::from_slice(buf).map_err(|_| PacketError::Malformed("bad IPv4 header"))?;

        Ok(Self {
            buf,
            version: IpVersion::V4,
            source: ipv4.header().source_addr().into(),
            destination: ipv4.header().destination_addr().into(),
        })
    }

    pub fn parse_v6(buf: &'a [u8]) -> Result<Self, PacketError> {
        if version_nibble(buf)? != 6 {
            return Err(PacketError::Malformed("expected an IPv6 packet"));
        }

        let ipv6 =
            Ipv6Slice::from_slice(buf).map_err(|_| PacketError::Malformed("bad IPv6 header"))?;

        Ok(Self {
            buf,
            version: IpVersion::V6,
            source: ipv6.header().source_addr().into(),
            destination: ipv6.header().destination_addr().into(),
        })
    }

    pub fn version(&self) -> IpVersion {
        self.version
    }

    pub fn packet(&self) -> &'a [u8] {
        self.buf
    }

    pub fn source(&self) -> IpAddr {
        self.source
    }

    pub fn destination(&self) -> IpAddr {
        self.destination
    }

    /// The destination address of the outer layer must lie within `prefix`.
    pub fn check_da_in_prefix(&self, prefix: &IpNetwork) -> Result<(), PacketError> {
        if prefix.contains(self.destination) {
            Ok(())
        } else {
            Err(PacketError::OutOfRange)
        }
    }

    pub fn as_ipv4(&self) -> Option<Ipv4Slice<'a>> {
        if self.version != IpVersion::V4 {
            return None;
        }

        Ipv4Slice::from_slice(self.buf).ok()
    }

    pub fn as_ipv6(&self) -> Option<Ipv6Slice<'a>> {
        if self.version != IpVersion::V6 {
            return None;
        }

        Ipv6Slice::from_slice(self.buf).ok()
    }

    /// The Segment Routing Header, if the extension chain carries a Routing
    /// header with routing type 4.
    pub fn srh(&self) -> Option<SegmentRoutingHeaderSlice<'a>> {
        self.walk_extensions().ok()?.srh
    }

    /// Returns the first layer after the IPv6 base header and any chain of
    /// extension headers.
    ///
    /// Hop-by-Hop, Routing (including the SRH), Fragment, Destination
    /// Options and AH are skipped in order; any other next-header value
    /// terminates the chain.
    pub fn pop_ipv6_headers(&self) -> Result<InnerLayer<'a>, PacketError> {
        let walk = self.walk_extensions()?;

        if walk.inner_offset >= walk.end {
            return Err(PacketError::NoInner);
        }

        Ok(InnerLayer {
            protocol: walk.inner_protocol,
            bytes: &self.buf[walk.inner_offset..walk.end],
        })
    }

    /// Requires the outer stack to be IPv4 / UDP (destination port 2152) /
    /// GTP-U carrying a G-PDU, and returns views over it.
    pub fn pop_gtp4_headers(&self) -> Result<Gtp4Layers<'a>, PacketError> {
        let ipv4 = self
            .as_ipv4()
            .ok_or(PacketError::Malformed("not an IPv4 packet"))?;

        if ipv4.is_payload_fragmented() {
            return Err(PacketError::Malformed("fragmented IPv4 payload"));
        }

        if ipv4.payload_ip_number() != IpNumber::UDP {
            return Err(PacketError::Malformed("no UDP layer"));
        }

        let udp = UdpSlice::from_slice(ipv4.payload().payload)
            .map_err(|_| PacketError::Malformed("bad UDP header"))?;

        if udp.destination_port() != GTPU_PORT {
            return Err(PacketError::NotGtpu);
        }

        let gtpu = GtpuSlice::from_slice(udp.payload())?;

        if gtpu.message_type() != MESSAGE_TYPE_GPDU {
            return Err(PacketError::UnexpectedMessageType(gtpu.message_type()));
        }

        Ok(Gtp4Layers {
            source: ipv4.header().source_addr(),
            destination: ipv4.header().destination_addr(),
            udp_source: udp.source_port(),
            gtpu,
        })
    }

    fn walk_extensions(&self) -> Result<ExtensionWalk<'a>, PacketError> {
        if self.version != IpVersion::V6 {
            return Err(PacketError::Malformed("not an IPv6 packet"));
        }

        let payload_len = usize::from(u16::from_be_bytes([self.buf[4], self.buf[5]]));
        let end = IPV6_HEADER_LEN + payload_len;

        if end > self.buf.len() {
            return Err(PacketError::Malformed("IPv6 payload length overflows"));
        }

        let mut srh = None;
        let mut next = self.buf[6];
        let mut offset = IPV6_HEADER_LEN;

        loop {
            let header_len = match next {
                // Hop-by-Hop, Routing, Destination Options
                0 | 43 | 60 => {
                    if offset + 8 > end {
                        return Err(PacketError::Malformed("truncated extension header"));
                    }

                    if next == 43 && self.buf[offset + 2] == SRH_ROUTING_TYPE {
                        srh = Some(SegmentRoutingHeaderSlice::from_slice(
                            &self.buf[offset..end],
                        )?);
                    }

                    (usize::from(self.buf[offset + 1]) + 1) * 8
                }
                // Fragment header has a fixed size, its length octet is reserved.
                44 => {
                    if offset + 8 > end {
                        return Err(PacketError::Malformed("truncated fragment header"));
                    }

                    8
                }
                // AH counts in 4-octet units.
                51 => {
                    if offset + 2 > end {
                        return Err(PacketError::Malformed("truncated authentication header"));
                    }

                    (usize::from(self.buf[offset + 1]) + 2) * 4
                }
                // ESP payloads are opaque; like unknown values they end the chain.
                _ => {
                    return Ok(ExtensionWalk {
                        srh,
                        inner_protocol: IpNumber(next),
                        inner_offset: offset,
                        end,
                    });
                }
            };

            if offset + header_len > end {
                return Err(PacketError::Malformed("truncated extension header"));
            }

            next = self.buf[offset];
            offset += header_len;
        }
    }
}

fn version_nibble(buf: &[u8]) -> Result<u8, PacketError> {
    let first = buf.first().ok_or(PacketError::Malformed("empty packet"))?;

    Ok(first >> 4)
}
