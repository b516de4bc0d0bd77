//! GTPv1-U header view and writer (TS 29.281).

use crate::PacketError;

/// UDP port registered for GTP-U.
pub const GTPU_PORT: u16 = 2152;

/// G-PDU message type. The only GTP-U message the data plane forwards.
pub const MESSAGE_TYPE_GPDU: u8 = 0xff;

/// Extension header type of the PDU Session Container (TS 38.415).
pub const EXTENSION_PDU_SESSION_CONTAINER: u8 = 0x85;

const MANDATORY_LEN: usize = 8;
const OPTIONAL_LEN: usize = 4;

/// PDU Session Container contents carried in a GTP-U extension header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduSessionContainer {
    /// 0 = downlink, 1 = uplink.
    pub pdu_type: u8,
    pub qfi: u8,
    pub pdu_session_id: Option<u32>,
}

/// View over one GTPv1-U message.
///
/// Sequence number, N-PDU number and extension headers count as payload in
/// the message length; [`GtpuSlice::payload`] starts after all of them.
#[derive(Debug, Clone, Copy)]
pub struct GtpuSlice<'a> {
    slice: &'a [u8],
    payload_offset: usize,
    container: Option<PduSessionContainer>,
}

impl<'a> GtpuSlice<'a> {
    pub fn from_slice(slice: &'a [u8]) -> Result<Self, PacketError> {
        if slice.len() < MANDATORY_LEN {
            return Err(PacketError::Malformed("truncated GTP-U header"));
        }

        let flags = slice[0];

        if flags >> 5 != 1 {
            return Err(PacketError::Malformed("GTP-U version is not 1"));
        }

        if flags & 0x10 == 0 {
            return Err(PacketError::Malformed("GTP' is not supported"));
        }

        let length = usize::from(u16::from_be_bytes([slice[2], slice[3]]));

        if MANDATORY_LEN + length > slice.len() {
            return Err(PacketError::Malformed("GTP-U length overflows"));
        }

        let end = MANDATORY_LEN + length;
        let mut payload_offset = MANDATORY_LEN;
        let mut container = None;

        // E, S or PN: the optional octets (and any extension chain) are present.
        if flags & 0x07 != 0 {
            if MANDATORY_LEN + OPTIONAL_LEN > end {
                return Err(PacketError::Malformed("truncated GTP-U options"));
            }

            payload_offset = MANDATORY_LEN + OPTIONAL_LEN;

            let mut next_extension = if flags & 0x04 != 0 { slice[11] } else { 0 };

            while next_extension != 0 {
                if payload_offset >= end {
                    return Err(PacketError::Malformed("truncated GTP-U extension"));
                }

                let units = usize::from(slice[payload_offset]);

                if units == 0 || payload_offset + units * 4 > end {
                    return Err(PacketError::Malformed("bad GTP-U extension length"));
                }

                let content = &slice[payload_offset + 1..payload_offset + units * 4 - 1];

                if next_extension == EXTENSION_PDU_SESSION_CONTAINER {
                    container = Some(parse_pdu_session_container(content)?);
                }

                next_extension = slice[payload_offset + units * 4 - 1];
                payload_offset += units * 4;
            }
        }

        Ok(Self {
            slice: &slice[..end],
            payload_offset,
            container,
        })
    }

    pub fn message_type(&self) -> u8 {
        self.slice[1]
    }

    pub fn length(&self) -> u16 {
        u16::from_be_bytes([self.slice[2], self.slice[3]])
    }

    pub fn teid(&self) -> u32 {
        u32::from_be_bytes([self.slice[4], self.slice[5], self.slice[6], self.slice[7]])
    }

    pub fn pdu_session_container(&self) -> Option<PduSessionContainer> {
        self.container
    }

    /// The encapsulated PDU, after any optional octets and extension headers.
    pub fn payload(&self) -> &'a [u8] {
        &self.slice[self.payload_offset..]
    }
}

fn parse_pdu_session_container(content: &[u8]) -> Result<PduSessionContainer, PacketError> {
    if content.len() < 2 {
        return Err(PacketError::Malformed("short PDU session container"));
    }

    let pdu_session_id = content
        .get(2..6)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]));

    Ok(PduSessionContainer {
        pdu_type: content[0] >> 4,
        qfi: content[1] & 0x3f,
        pdu_session_id,
    })
}

/// Serializes a G-PDU in front of `payload`.
///
/// With a container the flags carry E=1 (S and PN stay 0), the optional
/// octets are emitted zeroed and the container is the only extension.
pub fn write_gpdu(
    out: &mut Vec<u8>,
    teid: u32,
    container: Option<&PduSessionContainer>,
    payload: &[u8],
) -> Result<(), PacketError> {
    let extension_len = match container {
        Some(c) if c.pdu_session_id.is_some() => OPTIONAL_LEN + 8,
        Some(_) => OPTIONAL_LEN + 4,
        None => 0,
    };

    let length = u16::try_from(payload.len() + extension_len)
        .map_err(|_| PacketError::Malformed("GTP-U payload too large"))?;

    let flags = if container.is_some() { 0x34 } else { 0x30 };

    out.push(flags);
    out.push(MESSAGE_TYPE_GPDU);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&teid.to_be_bytes());

    if let Some(container) = container {
        // Sequence number and N-PDU number are unused for G-PDUs.
        out.extend_from_slice(&[0, 0, 0, EXTENSION_PDU_SESSION_CONTAINER]);

        match container.pdu_session_id {
            Some(session) => {
                out.push(2);
                out.push(container.pdu_type << 4);
                out.push(container.qfi & 0x3f);
                out.extend_from_slice(&session.to_be_bytes());
                out.push(0);
            }
            None => {
                out.extend_from_slice(&[1, container.pdu_type << 4, container.qfi & 0x3f, 0]);
            }
        }
    }

    out.extend_from_slice(payload);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn parses_plain_gpdu() {
        let buf = hex!(
            "30 ff 0004 00000001" // flags, G-PDU, length 4, TEID 1
            "deadbeef"
        );

        let gtpu = GtpuSlice::from_slice(&buf).unwrap();

        assert_eq!(gtpu.message_type(), MESSAGE_TYPE_GPDU);
        assert_eq!(gtpu.teid(), 1);
        assert_eq!(gtpu.payload(), hex!("deadbeef"));
        assert_eq!(gtpu.pdu_session_container(), None);
    }

    #[test]
    fn round_trips_with_container() {
        let container = PduSessionContainer {
            pdu_type: 0,
            qfi: 9,
            pdu_session_id: Some(0x42),
        };

        let mut buf = Vec::new();
        write_gpdu(&mut buf, 0x42, Some(&container), b"pdu").unwrap();

        let gtpu = GtpuSlice::from_slice(&buf).unwrap();

        assert_eq!(gtpu.teid(), 0x42);
        assert_eq!(gtpu.length() as usize, buf.len() - MANDATORY_LEN);
        assert_eq!(gtpu.pdu_session_container(), Some(container));
        assert_eq!(gtpu.payload(), b"pdu");
    }

    #[test]
    fn rejects_version_2() {
        let buf = hex!("50 ff 0000 00000000");

        assert!(GtpuSlice::from_slice(&buf).is_err());
    }

    #[test]
    fn rejects_overflowing_length() {
        let buf = hex!("30 ff ffff 00000001 00");

        assert!(GtpuSlice::from_slice(&buf).is_err());
    }

    #[test]
    fn qfi_only_container_is_one_unit() {
        let container = PduSessionContainer {
            pdu_type: 1,
            qfi: 5,
            pdu_session_id: None,
        };

        let mut buf = Vec::new();
        write_gpdu(&mut buf, 7, Some(&container), &[]).unwrap();

        // flags E=1, length covers the 4 optional octets + 4 container octets.
        assert_eq!(buf[0], 0x34);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 8);

        let parsed = GtpuSlice::from_slice(&buf).unwrap();
        assert_eq!(parsed.pdu_session_container(), Some(container));
        assert_eq!(parsed.payload(), &[] as &[u8]);
    }
}
