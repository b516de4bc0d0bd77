//! Mobile user-plane address codecs (RFC 9433 §6).
//!
//! The SRv6 mobile behaviors smuggle GTP-U state through specially
//! structured IPv6 addresses. Encoders and decoders here are bit-exact:
//! fields are placed at the configured prefix length, which need not be a
//! multiple of 8, so the embedded IPv4 address and the Args.Mob.Session
//! block may straddle byte boundaries.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::net::{Ipv4Addr, Ipv6Addr};

/// Nominal width of Args.Mob.Session: QFI(6) R(1) U(1) PDU Session ID(32).
const ARGS_BITS: usize = 40;

/// Width of the control octet in front of the PDU session id.
const ARGS_CONTROL_BITS: usize = 8;

const ADDR_BITS: usize = 128;
const IPV4_BITS: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("prefix length {prefix_len} leaves no room for the embedded fields")]
    Overflow { prefix_len: u8 },
    #[error("QFI {0} exceeds 6 bits")]
    QfiTooLarge(u8),
    #[error("QFI/R/U do not fit behind a prefix of length {prefix_len}")]
    ArgsTruncated { prefix_len: u8 },
    #[error("PDU session id {session_id:#x} does not fit in {bits} bits")]
    SessionIdTooLarge { session_id: u32, bits: usize },
}

/// Args.Mob.Session (RFC 9433 §6.1).
///
/// The 32-bit identifier doubles as the GTP-U TEID on re-encapsulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArgsMobSession {
    qfi: u8,
    r: bool,
    u: bool,
    session_id: u32,
}

impl ArgsMobSession {
    pub fn new(qfi: u8, r: bool, u: bool, session_id: u32) -> Result<Self, EncodingError> {
        if qfi > 0x3f {
            return Err(EncodingError::QfiTooLarge(qfi));
        }

        Ok(Self {
            qfi,
            r,
            u,
            session_id,
        })
    }

    pub fn qfi(&self) -> u8 {
        self.qfi
    }

    pub fn r(&self) -> bool {
        self.r
    }

    pub fn u(&self) -> bool {
        self.u
    }

    pub fn pdu_session_id(&self) -> u32 {
        self.session_id
    }

    /// The PDU session id, in its role as tunnel endpoint identifier.
    pub fn teid(&self) -> u32 {
        self.session_id
    }

    fn control_octet(&self) -> u8 {
        self.qfi << 2 | u8::from(self.r) << 1 | u8::from(self.u)
    }

    /// Writes the block into `window` bits at `offset`.
    ///
    /// A window shorter than the nominal 40 bits narrows the session id
    /// field (low-order bits are kept); values that cannot be represented
    /// are refused rather than silently truncated.
    fn write(
        &self,
        octets: &mut [u8; 16],
        offset: usize,
        window: usize,
        prefix_len: u8,
    ) -> Result<(), EncodingError> {
        if window < ARGS_CONTROL_BITS {
            if self.control_octet() != 0 || self.session_id != 0 {
                return Err(EncodingError::ArgsTruncated { prefix_len });
            }

            return Ok(());
        }

        let session_bits = (window - ARGS_CONTROL_BITS).min(32);

        if session_bits < 32 && u64::from(self.session_id) >= 1 << session_bits {
            return Err(EncodingError::SessionIdTooLarge {
                session_id: self.session_id,
                bits: session_bits,
            });
        }

        write_bits(
            octets,
            offset,
            ARGS_CONTROL_BITS,
            u64::from(self.control_octet()),
        );
        write_bits(
            octets,
            offset + ARGS_CONTROL_BITS,
            session_bits,
            u64::from(self.session_id),
        );

        Ok(())
    }

    fn read(octets: &[u8; 16], offset: usize, window: usize) -> Self {
        if window < ARGS_CONTROL_BITS {
            return Self::default();
        }

        let control = read_bits(octets, offset, ARGS_CONTROL_BITS) as u8;
        let session_bits = (window - ARGS_CONTROL_BITS).min(32);
        let session_id = read_bits(octets, offset + ARGS_CONTROL_BITS, session_bits) as u32;

        Self {
            qfi: control >> 2,
            r: control & 0b10 != 0,
            u: control & 0b01 != 0,
            session_id,
        }
    }
}

/// Decoded End.M.GTP4.E destination:
/// `prefix(P) | IPv4 DA(32) | Args.Mob.Session | padding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gtp4DstFields {
    ipv4: Ipv4Addr,
    args: ArgsMobSession,
}

impl Gtp4DstFields {
    /// Fails when the embedded IPv4 address does not fit behind the prefix.
    pub fn decode(addr: Ipv6Addr, prefix_len: u8) -> Result<Self, EncodingError> {
        check_gtp4_prefix(prefix_len)?;

        let octets = addr.octets();
        let offset = usize::from(prefix_len);
        let ipv4 = Ipv4Addr::from(read_bits(&octets, offset, IPV4_BITS) as u32);
        let window = args_window(offset + IPV4_BITS);
        let args = ArgsMobSession::read(&octets, offset + IPV4_BITS, window);

        Ok(Self { ipv4, args })
    }

    pub fn encode(
        prefix: Ipv6Addr,
        prefix_len: u8,
        ipv4: Ipv4Addr,
        args: ArgsMobSession,
    ) -> Result<Ipv6Addr, EncodingError> {
        check_gtp4_prefix(prefix_len)?;

        let mut octets = prefix.octets();
        let offset = usize::from(prefix_len);

        zero_bits_from(&mut octets, offset);
        write_bits(&mut octets, offset, IPV4_BITS, u64::from(u32::from(ipv4)));

        let window = args_window(offset + IPV4_BITS);
        args.write(&mut octets, offset + IPV4_BITS, window, prefix_len)?;

        Ok(Ipv6Addr::from(octets))
    }

    pub fn ipv4(&self) -> Ipv4Addr {
        self.ipv4
    }

    pub fn qfi(&self) -> u8 {
        self.args.qfi()
    }

    pub fn pdu_session_id(&self) -> u32 {
        self.args.pdu_session_id()
    }

    pub fn args(&self) -> ArgsMobSession {
        self.args
    }
}

/// Startup gate shared with the endpoint constructors.
pub fn check_gtp4_prefix(prefix_len: u8) -> Result<(), EncodingError> {
    if usize::from(prefix_len) + IPV4_BITS > ADDR_BITS {
        return Err(EncodingError::Overflow { prefix_len });
    }

    Ok(())
}

/// Decoded End.M.GTP4.E source: `prefix(64) | IPv4 SA(32) | UDP port(16) |
/// zero(16)`. The layout is fixed, so decoding cannot fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gtp4SrcFields {
    ipv4: Ipv4Addr,
    udp_port: u16,
}

impl Gtp4SrcFields {
    pub const PREFIX_BITS: u8 = 64;

    pub fn decode(addr: Ipv6Addr) -> Self {
        let octets = addr.octets();

        Self {
            ipv4: Ipv4Addr::new(octets[8], octets[9], octets[10], octets[11]),
            udp_port: u16::from_be_bytes([octets[12], octets[13]]),
        }
    }

    /// Bits of `prefix` past /64 are discarded.
    pub fn encode(prefix: Ipv6Addr, ipv4: Ipv4Addr, udp_port: u16) -> Ipv6Addr {
        let mut octets = prefix.octets();

        octets[8..12].copy_from_slice(&ipv4.octets());
        octets[12..14].copy_from_slice(&udp_port.to_be_bytes());
        octets[14..16].copy_from_slice(&[0, 0]);

        Ipv6Addr::from(octets)
    }

    pub fn ipv4(&self) -> Ipv4Addr {
        self.ipv4
    }

    pub fn udp_port(&self) -> u16 {
        self.udp_port
    }
}

/// Decoded End.M.GTP6.E SID: `prefix(P) | Args.Mob.Session | padding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gtp6SidFields {
    args: ArgsMobSession,
}

impl Gtp6SidFields {
    pub fn decode(addr: Ipv6Addr, prefix_len: u8) -> Result<Self, EncodingError> {
        check_gtp6_prefix(prefix_len)?;

        let octets = addr.octets();
        let offset = usize::from(prefix_len);
        let args = ArgsMobSession::read(&octets, offset, args_window(offset));

        Ok(Self { args })
    }

    pub fn encode(
        prefix: Ipv6Addr,
        prefix_len: u8,
        args: ArgsMobSession,
    ) -> Result<Ipv6Addr, EncodingError> {
        check_gtp6_prefix(prefix_len)?;

        let mut octets = prefix.octets();
        let offset = usize::from(prefix_len);

        zero_bits_from(&mut octets, offset);
        args.write(&mut octets, offset, args_window(offset), prefix_len)?;

        Ok(Ipv6Addr::from(octets))
    }

    pub fn qfi(&self) -> u8 {
        self.args.qfi()
    }

    pub fn pdu_session_id(&self) -> u32 {
        self.args.pdu_session_id()
    }

    pub fn args(&self) -> ArgsMobSession {
        self.args
    }
}

/// The GTP6 SID must at least hold the QFI/R/U octet.
pub fn check_gtp6_prefix(prefix_len: u8) -> Result<(), EncodingError> {
    if usize::from(prefix_len) + ARGS_CONTROL_BITS > ADDR_BITS {
        return Err(EncodingError::Overflow { prefix_len });
    }

    Ok(())
}

fn args_window(offset: usize) -> usize {
    (ADDR_BITS - offset).min(ARGS_BITS)
}

/// Reads `len` bits (at most 64) starting `offset` bits into the address.
fn read_bits(octets: &[u8; 16], offset: usize, len: usize) -> u64 {
    debug_assert!(len <= 64 && offset + len <= ADDR_BITS);

    let mut value = 0u64;

    for i in 0..len {
        let bit = offset + i;
        let set = octets[bit / 8] >> (7 - bit % 8) & 1;
        value = value << 1 | u64::from(set);
    }

    value
}

/// Writes the low `len` bits of `value` starting `offset` bits in.
fn write_bits(octets: &mut [u8; 16], offset: usize, len: usize, value: u64) {
    debug_assert!(len <= 64 && offset + len <= ADDR_BITS);

    for i in 0..len {
        let bit = offset + i;
        let mask = 1 << (7 - bit % 8);

        if value >> (len - 1 - i) & 1 == 1 {
            octets[bit / 8] |= mask;
        } else {
            octets[bit / 8] &= !mask;
        }
    }
}

fn zero_bits_from(octets: &mut [u8; 16], offset: usize) {
    for bit in offset..ADDR_BITS {
        octets[bit / 8] &= !(1 << (7 - bit % 8));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn prefix_bits_match(a: Ipv6Addr, b: Ipv6Addr, prefix_len: u8) -> bool {
        let (a, b) = (a.octets(), b.octets());

        (0..usize::from(prefix_len)).all(|bit| {
            let mask = 1 << (7 - bit % 8);
            a[bit / 8] & mask == b[bit / 8] & mask
        })
    }

    #[test]
    fn dst_encodes_at_a_64_bit_prefix() {
        let prefix: Ipv6Addr = "fd00:2::".parse().unwrap();
        let args = ArgsMobSession::new(9, false, false, 0x42).unwrap();

        let addr = Gtp4DstFields::encode(prefix, 64, Ipv4Addr::new(10, 0, 0, 2), args).unwrap();

        // fd00:2:: | 10.0.0.2 | QFI 9 | session id 0x42 narrowed to 24 bits
        assert_eq!(addr, "fd00:2::a00:2:2400:42".parse::<Ipv6Addr>().unwrap());

        let fields = Gtp4DstFields::decode(addr, 64).unwrap();
        assert_eq!(fields.ipv4(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(fields.qfi(), 9);
        assert_eq!(fields.pdu_session_id(), 0x42);
    }

    #[test]
    fn dst_rejects_prefix_with_no_room_for_ipv4() {
        let prefix: Ipv6Addr = "fd00::".parse().unwrap();

        assert_eq!(
            Gtp4DstFields::encode(prefix, 100, Ipv4Addr::LOCALHOST, ArgsMobSession::default()),
            Err(EncodingError::Overflow { prefix_len: 100 })
        );
        assert_eq!(
            Gtp4DstFields::decode(prefix, 100),
            Err(EncodingError::Overflow { prefix_len: 100 })
        );
    }

    #[test]
    fn dst_refuses_session_id_that_does_not_fit() {
        let prefix: Ipv6Addr = "fd00:2::".parse().unwrap();
        let args = ArgsMobSession::new(0, false, false, 0x0100_0000).unwrap();

        // /64 leaves 24 bits for the session id.
        assert!(matches!(
            Gtp4DstFields::encode(prefix, 64, Ipv4Addr::LOCALHOST, args),
            Err(EncodingError::SessionIdTooLarge { bits: 24, .. })
        ));
    }

    #[test]
    fn ipv4_may_straddle_byte_boundaries() {
        let prefix: Ipv6Addr = "fd00:1200::".parse().unwrap();
        let ipv4 = Ipv4Addr::new(0xab, 0xcd, 0xef, 0x01);

        for prefix_len in [21, 27, 33, 42, 55] {
            let addr =
                Gtp4DstFields::encode(prefix, prefix_len, ipv4, ArgsMobSession::default()).unwrap();
            let fields = Gtp4DstFields::decode(addr, prefix_len).unwrap();

            assert_eq!(fields.ipv4(), ipv4, "prefix length {prefix_len}");
        }
    }

    #[test]
    fn src_layout_is_fixed() {
        let prefix: Ipv6Addr = "fd00:cafe::".parse().unwrap();

        let addr = Gtp4SrcFields::encode(prefix, Ipv4Addr::new(10, 0, 0, 1), 2152);

        assert_eq!(addr, "fd00:cafe::a00:1:868:0".parse::<Ipv6Addr>().unwrap());

        let fields = Gtp4SrcFields::decode(addr);
        assert_eq!(fields.ipv4(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(fields.udp_port(), 2152);
    }

    #[test]
    fn gtp6_sid_round_trips() {
        let prefix: Ipv6Addr = "fd00:6::".parse().unwrap();
        let args = ArgsMobSession::new(5, true, false, 0xdead_beef).unwrap();

        let addr = Gtp6SidFields::encode(prefix, 64, args).unwrap();
        let fields = Gtp6SidFields::decode(addr, 64).unwrap();

        assert_eq!(fields.args(), args);
    }

    #[test]
    fn gtp6_sid_rejects_prefix_past_120() {
        assert_eq!(
            check_gtp6_prefix(121),
            Err(EncodingError::Overflow { prefix_len: 121 })
        );
    }

    #[test_strategy::proptest]
    fn dst_round_trip(
        #[strategy(any::<[u8; 16]>())] prefix: [u8; 16],
        #[strategy(0u8..=96)] prefix_len: u8,
        #[strategy(any::<u32>())] ipv4: u32,
        #[strategy(0u8..64)] qfi: u8,
        r: bool,
        u: bool,
        #[strategy(any::<u32>())] session_id: u32,
    ) {
        let window = 96 - usize::from(prefix_len);
        let (qfi, r, u) = if window < 8 { (0, false, false) } else { (qfi, r, u) };
        let session_bits = window.saturating_sub(8).min(32);
        let session_id = if session_bits == 0 {
            0
        } else {
            session_id & (((1u64 << session_bits) - 1) as u32)
        };

        let args = ArgsMobSession::new(qfi, r, u, session_id).unwrap();
        let prefix = Ipv6Addr::from(prefix);
        let ipv4 = Ipv4Addr::from(ipv4);

        let addr = Gtp4DstFields::encode(prefix, prefix_len, ipv4, args).unwrap();
        let fields = Gtp4DstFields::decode(addr, prefix_len).unwrap();

        prop_assert_eq!(fields.ipv4(), ipv4);
        prop_assert_eq!(fields.args(), args);
        prop_assert!(prefix_bits_match(addr, prefix, prefix_len));
    }

    #[test_strategy::proptest]
    fn src_round_trip(
        #[strategy(any::<[u8; 16]>())] prefix: [u8; 16],
        #[strategy(any::<u32>())] ipv4: u32,
        #[strategy(any::<u16>())] port: u16,
    ) {
        let prefix = Ipv6Addr::from(prefix);
        let ipv4 = Ipv4Addr::from(ipv4);

        let addr = Gtp4SrcFields::encode(prefix, ipv4, port);
        let fields = Gtp4SrcFields::decode(addr);

        prop_assert_eq!(fields.ipv4(), ipv4);
        prop_assert_eq!(fields.udp_port(), port);
        prop_assert!(prefix_bits_match(addr, prefix, 64));
    }
}
