mod common;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use common::*;
use rustrial_net::net::config::{NetConfig, IPFRAG_TIMEOUT_SWEEPS, SWEEP_TICKS};
use rustrial_net::net::ethernet::ETHERTYPE_IPV4;
use rustrial_net::net::ipv4::{flags, protocol, Ipv4Error, Ipv4Header, MIN_HEADER_SIZE};
use rustrial_net::net::socket::{Domain, MsgFlags, SockType};
use rustrial_net::net::udp::UdpHeader;
use rustrial_net::NetError;

/// Split a transport payload from B into fragments of `chunk` bytes each
fn fragments_from_b(proto: u8, id: u16, payload: &[u8], chunk: usize) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + chunk).min(payload.len());
        let mut header = Ipv4Header::new(IP_B, IP_A, proto, (end - offset) as u16);
        header.identification = id;
        header.fragment_offset = (offset / 8) as u16;
        header.flags = if end < payload.len() { flags::MORE_FRAGMENTS } else { 0 };

        let mut packet = vec![0u8; MIN_HEADER_SIZE];
        header.write(&mut packet);
        packet.extend_from_slice(&payload[offset..end]);
        frames.push(eth_frame(MAC_A, MAC_B, ETHERTYPE_IPV4, &packet));
        offset = end;
    }
    frames
}

fn bound_udp(stack: &rustrial_net::NetStack, port: u16) -> rustrial_net::net::socket::Socket {
    let sock = stack.socket(Domain::Inet, SockType::Datagram).unwrap();
    stack.bind(&sock, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).unwrap();
    sock
}

#[test]
fn test_header_fields() {
    let header = Ipv4Header::new(IP_A, IP_B, protocol::TCP, 100);
    assert_eq!(header.ihl, 5);
    assert_eq!(header.total_length, 120);
    assert_eq!(header.header_length(), 20);
    assert!(!header.is_fragmented());

    let mut raw = [0u8; 20];
    header.write(&mut raw);
    assert_eq!(raw[0], 0x45);
    assert_eq!(raw[9], protocol::TCP);
    assert_eq!(&raw[12..16], &IP_A.octets());
    assert_eq!(&raw[16..20], &IP_B.octets());
}

#[test]
fn test_truncated_packet_rejected() {
    let header = Ipv4Header::new(IP_A, IP_B, protocol::UDP, 100);
    let mut raw = [0u8; 40];
    header.write(&mut raw);
    assert!(Ipv4Header::from_bytes(&raw).is_err());
    assert_eq!(Ipv4Header::from_bytes(&raw[..10]), Err(Ipv4Error::PacketTooShort));
}

#[test]
fn test_datagram_for_other_host_is_dropped() {
    let (stack, link) = capture_stack();
    let sock = bound_udp(&stack, 9000);

    let datagram = udp_datagram(IP_B, Ipv4Addr::new(10, 0, 0, 99), 1234, 9000, b"lost");
    let packet = ip_packet(IP_B, Ipv4Addr::new(10, 0, 0, 99), protocol::UDP, &datagram);
    link.inject(eth_frame(MAC_A, MAC_B, ETHERTYPE_IPV4, &packet));
    stack.poll();

    let mut buf = [0u8; 16];
    assert_eq!(stack.recvfrom(&sock, &mut buf, MsgFlags::DONTWAIT), Err(NetError::Again));
}

#[test]
fn test_subnet_broadcast_is_accepted() {
    let (stack, link) = capture_stack();
    let sock = bound_udp(&stack, 9000);

    let bcast = Ipv4Addr::new(10, 0, 0, 255);
    let datagram = udp_datagram(IP_B, bcast, 1234, 9000, b"all");
    let packet = ip_packet(IP_B, bcast, protocol::UDP, &datagram);
    link.inject(eth_frame([0xFF; 6], MAC_B, ETHERTYPE_IPV4, &packet));
    stack.poll();

    let mut buf = [0u8; 16];
    let (n, from) = stack.recvfrom(&sock, &mut buf, MsgFlags::DONTWAIT).unwrap();
    assert_eq!(&buf[..n], b"all");
    assert_eq!(from, SocketAddrV4::new(IP_B, 1234));
}

#[test]
fn test_out_of_order_fragments_reassemble() {
    let (stack, link) = capture_stack();
    let sock = bound_udp(&stack, 9000);

    let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
    let datagram = udp_datagram(IP_B, IP_A, 1234, 9000, &data);
    let mut frames = fragments_from_b(protocol::UDP, 0x77, &datagram, 256);
    assert_eq!(frames.len(), 4);

    // Last first, then the rest backwards, with one duplicate
    frames.reverse();
    let duplicate = frames[1].clone();
    frames.insert(2, duplicate);
    let count = frames.len();
    for frame in frames.into_iter().take(count - 1) {
        link.inject(frame);
    }
    stack.poll();
    assert_eq!(stack.reassembly_count(), 1);

    let mut buf = [0u8; 1500];
    assert_eq!(stack.recvfrom(&sock, &mut buf, MsgFlags::DONTWAIT), Err(NetError::Again));

    // The first fragment completes it
    let first = fragments_from_b(protocol::UDP, 0x77, &datagram, 256).remove(0);
    link.inject(first);
    stack.poll();
    assert_eq!(stack.reassembly_count(), 0);

    let (n, _) = stack.recvfrom(&sock, &mut buf, MsgFlags::DONTWAIT).unwrap();
    assert_eq!(&buf[..n], &data[..]);
}

#[test]
fn test_incomplete_datagram_times_out() {
    let (stack, link) = capture_stack();
    let datagram = udp_datagram(IP_B, IP_A, 1234, 9000, &[7u8; 600]);
    let frames = fragments_from_b(protocol::UDP, 0x99, &datagram, 256);
    link.inject(frames[0].clone());
    stack.poll();
    assert_eq!(stack.reassembly_count(), 1);

    for _ in 0..(IPFRAG_TIMEOUT_SWEEPS as u64 + 1) * SWEEP_TICKS {
        stack.tick();
    }
    assert_eq!(stack.reassembly_count(), 1, "ticks alone run no timer");
    stack.run_timers();
    assert_eq!(stack.reassembly_count(), 0);
}

#[test]
fn test_large_datagram_is_fragmented_to_mtu() {
    let (stack, link) = capture_stack_with(NetConfig::default(), 576);
    stack.arp_register(IP_B, MAC_B, true);
    let sock = bound_udp(&stack, 5000);

    let data: Vec<u8> = (0..2000u32).map(|i| (i * 7) as u8).collect();
    stack
        .sendto(&sock, &data, SocketAddrV4::new(IP_B, 6000), MsgFlags::empty())
        .unwrap();

    let sent = link.take_sent();
    assert_eq!(sent.len(), 4);

    let mut reassembled = Vec::new();
    let mut id = None;
    for (i, frame) in sent.iter().enumerate() {
        let (ip, payload) = parse_ip(frame).unwrap();
        assert!(ip.total_length as usize <= 576);
        assert_eq!(ip.fragment_offset as usize * 8, reassembled.len());
        assert_eq!(ip.more_fragments(), i + 1 < sent.len());
        assert_eq!(*id.get_or_insert(ip.identification), ip.identification);
        if ip.more_fragments() {
            assert_eq!(payload.len() % 8, 0);
        }
        reassembled.extend_from_slice(&payload);
    }

    let udp = UdpHeader::parse(&reassembled, IP_A, IP_B).unwrap();
    assert_eq!(udp.dest_port, 6000);
    assert_eq!(&reassembled[8..], &data[..]);
}

#[test]
fn test_fragmented_round_trip_between_stacks() {
    let pair = Pair::new();
    let rx = bound_udp(&pair.b, 7000);
    let tx = pair.a.socket(Domain::Inet, SockType::Datagram).unwrap();

    let data: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
    pair.a
        .sendto(&tx, &data, SocketAddrV4::new(IP_B, 7000), MsgFlags::empty())
        .unwrap();

    let mut buf = vec![0u8; 8192];
    pair.b.set_recv_timeout(&rx, Some(2000)).unwrap();
    let (n, from) = pair.b.recvfrom(&rx, &mut buf, MsgFlags::empty()).unwrap();
    assert_eq!(n, data.len());
    assert_eq!(&buf[..n], &data[..]);
    assert_eq!(*from.ip(), IP_A);
    assert!(wait_for(Duration::from_secs(1), || pair.b.reassembly_count() == 0));
}

#[test]
fn test_no_route_without_gateway() {
    let (stack, _link) = capture_stack();
    let sock = stack.socket(Domain::Inet, SockType::Datagram).unwrap();
    let far = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 1), 53);
    assert_eq!(stack.sendto(&sock, b"q", far, MsgFlags::empty()), Err(NetError::NoRoute));
}

#[test]
fn test_off_link_goes_through_gateway() {
    let config = NetConfig {
        gateway: Some(Ipv4Addr::new(10, 0, 0, 254)),
        ..NetConfig::default()
    };
    let (stack, link) = capture_stack_with(config, 1500);
    let gw_mac = [0x02, 0, 0, 0, 0, 0xFE];
    stack.arp_register(Ipv4Addr::new(10, 0, 0, 254), gw_mac, true);

    let sock = stack.socket(Domain::Inet, SockType::Datagram).unwrap();
    let far = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 1), 53);
    stack.sendto(&sock, b"q", far, MsgFlags::empty()).unwrap();

    let sent = link.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(&sent[0][0..6], &gw_mac);
    let (ip, _) = parse_ip(&sent[0]).unwrap();
    assert_eq!(ip.dest_ip, Ipv4Addr::new(192, 168, 1, 1));
    assert_eq!(ip.src_ip, IP_A);
}
