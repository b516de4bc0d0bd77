//! Segment Routing Header view and writer (RFC 8754).

use crate::PacketError;
use etherparse::IpNumber;
use std::net::Ipv6Addr;

/// IPv6 Routing Type assigned to the SRH.
pub const SRH_ROUTING_TYPE: u8 = 4;

const FIXED_LEN: usize = 8;
const SEGMENT_LEN: usize = 16;

/// View over an IPv6 Routing extension header of routing type 4.
///
/// The segment list is kept in network order: segment 0 is the final
/// segment of the policy, the last entry is the first hop.
#[derive(Debug, Clone, Copy)]
pub struct SegmentRoutingHeaderSlice<'a> {
    slice: &'a [u8],
}

impl<'a> SegmentRoutingHeaderSlice<'a> {
    pub fn from_slice(slice: &'a [u8]) -> Result<Self, PacketError> {
        if slice.len() < FIXED_LEN {
            return Err(PacketError::Malformed("truncated routing header"));
        }

        let total = (usize::from(slice[1]) + 1) * 8;

        if total > slice.len() {
            return Err(PacketError::Malformed("routing header length overflows"));
        }

        if slice[2] != SRH_ROUTING_TYPE {
            return Err(PacketError::Malformed("routing type is not 4"));
        }

        if (total - FIXED_LEN) % SEGMENT_LEN != 0 {
            return Err(PacketError::Malformed("segment list is not 16-byte aligned"));
        }

        let this = Self {
            slice: &slice[..total],
        };

        if usize::from(this.last_entry()) >= this.segment_count().max(1) {
            return Err(PacketError::Malformed("last entry exceeds segment list"));
        }

        Ok(this)
    }

    pub fn next_header(&self) -> IpNumber {
        IpNumber(self.slice[0])
    }

    pub fn segments_left(&self) -> u8 {
        self.slice[3]
    }

    pub fn last_entry(&self) -> u8 {
        self.slice[4]
    }

    pub fn flags(&self) -> u8 {
        self.slice[5]
    }

    pub fn tag(&self) -> u16 {
        u16::from_be_bytes([self.slice[6], self.slice[7]])
    }

    /// Total byte length of the extension header.
    pub fn header_len(&self) -> usize {
        self.slice.len()
    }

    pub fn segment_count(&self) -> usize {
        (self.slice.len() - FIXED_LEN) / SEGMENT_LEN
    }

    pub fn segment(&self, index: usize) -> Option<Ipv6Addr> {
        let start = FIXED_LEN + index.checked_mul(SEGMENT_LEN)?;
        let octets: [u8; 16] = self.slice.get(start..start + SEGMENT_LEN)?.try_into().ok()?;

        Some(Ipv6Addr::from(octets))
    }

    pub fn segments(&self) -> impl Iterator<Item = Ipv6Addr> + '_ {
        (0..self.segment_count()).filter_map(|i| self.segment(i))
    }
}

/// Appends an SRH carrying `segments` (given in network order, segment 0 =
/// final segment). The last entry is derived from the list length.
pub fn write_segment_routing_header(
    out: &mut Vec<u8>,
    next_header: IpNumber,
    segments_left: u8,
    segments: &[Ipv6Addr],
) {
    debug_assert!(!segments.is_empty());
    debug_assert!(segments.len() <= 127);

    out.push(next_header.0);
    out.push((segments.len() * 2) as u8);
    out.push(SRH_ROUTING_TYPE);
    out.push(segments_left);
    out.push(segments.len().saturating_sub(1) as u8);
    out.push(0); // flags
    out.extend_from_slice(&0u16.to_be_bytes()); // tag

    for segment in segments {
        out.extend_from_slice(&segment.octets());
    }
}
