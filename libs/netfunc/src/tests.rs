use crate::*;
use etherparse::{Ipv4Slice, Ipv6Slice, PacketBuilder, UdpSlice};
use rules::{Action, MemoryStore, RuleKind, RuleMatch, RuleSpec, RulesRegistry};
use sr_packet::gtpu::{self, PduSessionContainer};
use sr_packet::{GtpuSlice, Packet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tun::Tun;

fn gtp4_ingress(teid: u32, qfi: u8, session: u32, pdu: &[u8]) -> Vec<u8> {
    let container = PduSessionContainer {
        pdu_type: 1,
        qfi,
        pdu_session_id: Some(session),
    };

    let mut gtp = Vec::new();
    gtpu::write_gpdu(&mut gtp, teid, Some(&container), pdu).unwrap();

    let mut buf = Vec::new();
    PacketBuilder::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .udp(2152, 2152)
        .write(&mut buf, &gtp)
        .unwrap();

    buf
}

/// A 100-byte UE PDU that reads as an IPv4 packet.
fn ue_pdu_v4() -> Vec<u8> {
    let mut pdu = Vec::new();
    PacketBuilder::ipv4([10, 45, 0, 9], [1, 1, 1, 1], 63)
        .udp(40000, 53)
        .write(&mut pdu, &[0xab; 72])
        .unwrap();

    assert_eq!(pdu.len(), 100);

    pdu
}

fn headend_gtp4() -> HeadendGtp4 {
    HeadendGtp4::new(
        "10.0.0.0/8".parse().unwrap(),
        PolicySource::Static(vec![
            "fd00:1::1".parse().unwrap(),
            "fd00:2::2".parse().unwrap(),
        ]),
        64,
        "fd00:cafe::".parse().unwrap(),
        64,
    )
    .unwrap()
}

fn endpoint_gtp4() -> EndpointGtp4 {
    EndpointGtp4::new("fd00:2::/64".parse().unwrap(), 64).unwrap()
}

#[test]
fn headend_gtp4_builds_the_expected_srv6_packet() {
    let pdu = ue_pdu_v4();
    let ingress = gtp4_ingress(0x0000_0001, 9, 0x42, &pdu);

    let egress = headend_gtp4().handle(&ingress).unwrap();

    let packet = Packet::parse_v6(&egress).unwrap();

    assert_eq!(
        packet.source(),
        "fd00:cafe::a00:1:868:0".parse::<IpAddr>().unwrap(),
    );
    assert_eq!(
        packet.destination(),
        "fd00:2::a00:2:2400:42".parse::<IpAddr>().unwrap(),
    );

    let srh = packet.srh().unwrap();
    assert_eq!(srh.segments_left(), 0);
    assert_eq!(srh.last_entry(), 0);
    assert_eq!(
        srh.segments().collect::<Vec<_>>(),
        vec!["fd00:1::1".parse::<Ipv6Addr>().unwrap()]
    );

    let inner = packet.pop_ipv6_headers().unwrap();
    assert_eq!(inner.protocol, etherparse::IpNumber::IPV4);
    assert_eq!(inner.bytes, pdu);
}

#[test]
fn endpoint_gtp4_inverts_the_headend() {
    let pdu = ue_pdu_v4();
    let ingress = gtp4_ingress(0x0000_0001, 9, 0x42, &pdu);

    let egress = endpoint_gtp4()
        .handle(&headend_gtp4().handle(&ingress).unwrap())
        .unwrap();

    let ipv4 = Ipv4Slice::from_slice(&egress).unwrap();
    assert_eq!(ipv4.header().source_addr(), Ipv4Addr::new(10, 0, 0, 1));
    assert_eq!(ipv4.header().destination_addr(), Ipv4Addr::new(10, 0, 0, 2));
    assert!(ipv4.header().dont_fragment());
    assert_eq!(ipv4.header().dcp().value(), 9);
    assert_eq!(ipv4.header().ttl(), 64);

    let udp = UdpSlice::from_slice(ipv4.payload().payload).unwrap();
    assert_eq!(udp.source_port(), 2152);
    assert_eq!(udp.destination_port(), 2152);

    let gtp = GtpuSlice::from_slice(udp.payload()).unwrap();
    assert_eq!(gtp.teid(), 0x42);
    assert_eq!(gtp.pdu_session_container().unwrap().qfi, 9);
    assert_eq!(gtp.payload(), pdu);
}

#[test]
fn endpoint_gtp4_rejects_pending_segments() {
    let ingress = gtp4_ingress(1, 9, 0x42, &ue_pdu_v4());
    let mut egress = headend_gtp4().handle(&ingress).unwrap();

    // Segments Left sits 3 bytes into the SRH.
    egress[40 + 3] = 1;

    assert!(matches!(
        endpoint_gtp4().handle(&egress),
        Err(Error::SegmentsLeftNonZero)
    ));
}

#[test]
fn endpoint_gtp4_rejects_foreign_destinations() {
    let ingress = gtp4_ingress(1, 9, 0x42, &ue_pdu_v4());
    let egress = headend_gtp4().handle(&ingress).unwrap();

    let other = EndpointGtp4::new("fd00:bad::/64".parse().unwrap(), 64).unwrap();

    assert!(matches!(
        other.handle(&egress),
        Err(Error::Packet(sr_packet::PacketError::OutOfRange))
    ));
}

#[test]
fn endpoint_gtp4_overflowing_prefix_is_a_startup_error() {
    assert!(matches!(
        EndpointGtp4::new("fd00::/100".parse().unwrap(), 64),
        Err(mup::EncodingError::Overflow { prefix_len: 100 })
    ));
}

#[test]
fn headend_gtp4_rejects_non_gpdu_messages() {
    // Echo Request to port 2152.
    let echo = hex_literal::hex!("32 01 0004 00000000 0000 0000");
    let mut buf = Vec::new();
    PacketBuilder::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .udp(2152, 2152)
        .write(&mut buf, &echo)
        .unwrap();

    assert!(matches!(
        headend_gtp4().handle(&buf),
        Err(Error::Packet(sr_packet::PacketError::UnexpectedMessageType(
            0x01
        )))
    ));
}

#[test]
fn headend_gtp4_resolves_policy_from_registry() {
    let registry = Arc::new(RulesRegistry::from_store(Arc::new(MemoryStore::new())).unwrap());

    registry
        .add(RuleSpec {
            kind: RuleKind::Uplink,
            enabled: true,
            matcher: RuleMatch {
                ue_prefix: "10.45.0.0/16".parse().unwrap(),
                teid: Some(1),
                gnb: Some("10.0.0.1".parse().unwrap()),
                srgw: Some("10.0.0.2".parse().unwrap()),
            },
            action: Action::Srh(vec![
                "fd00:1::1".parse().unwrap(),
                "fd00:2::2".parse().unwrap(),
            ]),
        })
        .unwrap();

    let headend = HeadendGtp4::new(
        "10.0.0.0/8".parse().unwrap(),
        PolicySource::Registry {
            registry: Arc::clone(&registry),
            key: RegistryKey::InnerSource,
        },
        64,
        "fd00:cafe::".parse().unwrap(),
        64,
    )
    .unwrap();

    // The UE PDU source 10.45.0.9 selects the rule.
    let egress = headend.handle(&gtp4_ingress(1, 9, 0x42, &ue_pdu_v4())).unwrap();
    assert_eq!(
        Packet::parse_v6(&egress).unwrap().destination(),
        "fd00:2::a00:2:2400:42".parse::<IpAddr>().unwrap()
    );

    // No rule for this flow once the rule is gone.
    let only = registry.list().pop().unwrap();
    registry.disable(only.uuid).unwrap();

    assert!(matches!(
        headend.handle(&gtp4_ingress(1, 9, 0x42, &ue_pdu_v4())),
        Err(Error::NoMatchingRule)
    ));
}

#[test]
fn gtp6_headend_and_endpoint_are_inverse() {
    let registry = Arc::new(RulesRegistry::from_store(Arc::new(MemoryStore::new())).unwrap());

    // Inner UE traffic towards fd00:aaaa::7.
    let mut pdu = Vec::new();
    PacketBuilder::ipv6(
        "fd00:bbbb::9".parse::<Ipv6Addr>().unwrap().octets(),
        "fd00:aaaa::7".parse::<Ipv6Addr>().unwrap().octets(),
        63,
    )
    .udp(40000, 53)
    .write(&mut pdu, &[0x5a; 64])
    .unwrap();

    registry
        .add(RuleSpec {
            kind: RuleKind::Downlink,
            enabled: true,
            matcher: RuleMatch {
                ue_prefix: "fd00:aaaa::/64".parse().unwrap(),
                teid: None,
                gnb: None,
                srgw: None,
            },
            action: Action::Gtp {
                teid: 0x99,
                peer: "fd00:9::1".parse().unwrap(),
            },
        })
        .unwrap();

    let headend = HeadendGtp6::new(
        "fd00:d::/64".parse().unwrap(),
        PolicySource::Static(vec!["fd00:6::".parse().unwrap()]),
        64,
        "fd00:e::1".parse().unwrap(),
        64,
    )
    .unwrap();

    let endpoint = EndpointGtp6::new(
        "fd00:6::/64".parse().unwrap(),
        "fd00:e::2".parse().unwrap(),
        64,
        Arc::clone(&registry),
    )
    .unwrap();

    let container = PduSessionContainer {
        pdu_type: 0,
        qfi: 5,
        pdu_session_id: Some(0x77),
    };
    let mut gtp = Vec::new();
    gtpu::write_gpdu(&mut gtp, 0x1234, Some(&container), &pdu).unwrap();

    let mut ingress = Vec::new();
    PacketBuilder::ipv6(
        "fd00:9::1".parse::<Ipv6Addr>().unwrap().octets(),
        "fd00:d::1".parse::<Ipv6Addr>().unwrap().octets(),
        64,
    )
    .udp(2152, 2152)
    .write(&mut ingress, &gtp)
    .unwrap();

    let mid = headend.handle(&ingress).unwrap();

    // Single-segment policy: everything lives in the destination address.
    let mid_packet = Packet::parse_v6(&mid).unwrap();
    assert!(mid_packet.srh().is_none());

    let egress = endpoint.handle(&mid).unwrap();

    let ipv6 = Ipv6Slice::from_slice(&egress).unwrap();
    assert_eq!(
        ipv6.header().destination_addr(),
        "fd00:9::1".parse::<Ipv6Addr>().unwrap()
    );
    assert_eq!(
        ipv6.header().source_addr(),
        "fd00:e::2".parse::<Ipv6Addr>().unwrap()
    );

    let udp = UdpSlice::from_slice(ipv6.payload().payload).unwrap();
    assert_eq!(udp.destination_port(), 2152);

    let gtp = GtpuSlice::from_slice(udp.payload()).unwrap();
    assert_eq!(gtp.teid(), 0x99);

    let parsed = gtp.pdu_session_container().unwrap();
    assert_eq!(parsed.qfi, 5);
    assert_eq!(parsed.pdu_session_id, Some(0x77));
    assert_eq!(gtp.payload(), pdu);
}

struct FakeTun {
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    tx: mpsc::Sender<Vec<u8>>,
}

#[async_trait::async_trait]
impl Tun for FakeTun {
    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let packet = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))?;

        buf[..packet.len()].copy_from_slice(&packet);

        Ok(packet.len())
    }

    async fn send(&self, packet: &[u8]) -> std::io::Result<usize> {
        self.tx
            .send(packet.to_vec())
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))?;

        Ok(packet.len())
    }

    fn name(&self) -> &str {
        "tun-test"
    }
}

#[tokio::test]
async fn runner_forwards_and_counts_drops() {
    let (ingress_tx, ingress_rx) = mpsc::channel(16);
    let (egress_tx, mut egress_rx) = mpsc::channel(16);

    let mut runner = Runner::new(NetFunc::HeadendGtp4(headend_gtp4()));
    let counters = runner.counters();

    runner.start(FakeTun {
        rx: Mutex::new(ingress_rx),
        tx: egress_tx,
    });

    let good = gtp4_ingress(1, 9, 0x42, &ue_pdu_v4());

    ingress_tx.send(good.clone()).await.unwrap();
    let first = egress_rx.recv().await.unwrap();
    assert!(Packet::parse_v6(&first).is_ok());

    // Garbage is dropped and counted, the runner keeps going.
    ingress_tx.send(vec![0xff; 32]).await.unwrap();
    ingress_tx.send(good).await.unwrap();
    let second = egress_rx.recv().await.unwrap();
    assert!(Packet::parse_v6(&second).is_ok());

    assert_eq!(counters.snapshot().malformed, 1);

    runner.stop().await;
}
