mod common;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::thread;
use std::time::Duration;

use common::*;
use rustrial_net::net::socket::{Domain, MsgFlags, SockType, Socket};
use rustrial_net::net::tcp::TcpState;
use rustrial_net::{NetError, NetStack};

const PORT: u16 = 8080;

fn listener(stack: &NetStack, backlog: usize) -> Socket {
    let sock = stack.socket(Domain::Inet, SockType::Stream).unwrap();
    stack.bind(&sock, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, PORT)).unwrap();
    stack.listen(&sock, backlog).unwrap();
    sock
}

fn recv_all(stack: &NetStack, sock: &Socket) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buf = [0u8; 700];
    loop {
        match stack.recv(sock, &mut buf, MsgFlags::empty()) {
            Ok(n) => data.extend_from_slice(&buf[..n]),
            Err(NetError::ConnClosing) => return data,
            Err(e) => panic!("recv failed: {}", e),
        }
    }
}

#[test]
fn test_connect_send_close() {
    let pair = Pair::new();
    let server = listener(&pair.b, 4);

    let b = pair.b.clone();
    let handle = thread::spawn(move || {
        let (conn, peer) = b.accept(&server, MsgFlags::empty()).unwrap();
        assert_eq!(*peer.ip(), IP_A);
        assert_eq!(b.tcp_state(&conn), Some(TcpState::Established));
        let received = recv_all(&b, &conn);
        b.close(conn).unwrap();
        received
    });

    let client = pair.a.socket(Domain::Inet, SockType::Stream).unwrap();
    pair.a.connect(&client, SocketAddrV4::new(IP_B, PORT)).unwrap();
    assert_eq!(pair.a.tcp_state(&client), Some(TcpState::Established));
    let local = pair.a.local_addr(&client).unwrap();
    assert_eq!(*local.ip(), IP_A);

    assert_eq!(pair.a.send(&client, b"hello ", MsgFlags::empty()), Ok(6));
    assert_eq!(pair.a.send(&client, b"world", MsgFlags::empty()), Ok(5));
    pair.a.close(client.clone()).unwrap();

    assert_eq!(handle.join().unwrap(), b"hello world");

    // Both ends wind down and the client's block is freed
    assert!(wait_for(Duration::from_secs(5), || pair.a.tcp_state(&client).is_none()));
}

#[test]
fn test_recv_sees_eof_after_peer_close() {
    let pair = Pair::new();
    let server = listener(&pair.b, 1);

    let b = pair.b.clone();
    let handle = thread::spawn(move || {
        let (conn, _) = b.accept(&server, MsgFlags::empty()).unwrap();
        b.close(conn).unwrap();
    });

    let client = pair.a.socket(Domain::Inet, SockType::Stream).unwrap();
    pair.a.connect(&client, SocketAddrV4::new(IP_B, PORT)).unwrap();
    handle.join().unwrap();

    // EOF once the FIN arrived; sending in CLOSE_WAIT is still allowed
    let mut buf = [0u8; 16];
    assert_eq!(pair.a.recv(&client, &mut buf, MsgFlags::empty()), Err(NetError::ConnClosing));
    assert_eq!(pair.a.tcp_state(&client), Some(TcpState::CloseWait));
    assert_eq!(pair.a.send(&client, b"late", MsgFlags::empty()), Ok(4));

    pair.a.close(client.clone()).unwrap();
    assert!(pair.a.send(&client, b"x", MsgFlags::empty()).is_err());
}

#[test]
fn test_connect_refused() {
    let pair = Pair::new();
    let client = pair.a.socket(Domain::Inet, SockType::Stream).unwrap();
    assert_eq!(
        pair.a.connect(&client, SocketAddrV4::new(IP_B, 4444)),
        Err(NetError::ConnRefused)
    );
    assert_eq!(pair.a.tcp_state(&client), Some(TcpState::Closed));

    // The block can be used again
    let server = listener(&pair.b, 1);
    let b = pair.b.clone();
    let handle = thread::spawn(move || b.accept(&server, MsgFlags::empty()).map(|_| ()));
    pair.a.connect(&client, SocketAddrV4::new(IP_B, PORT)).unwrap();
    handle.join().unwrap().unwrap();
}

#[test]
fn test_bulk_transfer_with_flow_control() {
    let pair = Pair::new();
    let server = listener(&pair.b, 1);
    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();

    let b = pair.b.clone();
    let handle = thread::spawn(move || {
        let (conn, _) = b.accept(&server, MsgFlags::empty()).unwrap();
        // Read slowly so the sender hits a closed window
        thread::sleep(Duration::from_millis(50));
        let received = recv_all(&b, &conn);
        b.close(conn).unwrap();
        received
    });

    let client = pair.a.socket(Domain::Inet, SockType::Stream).unwrap();
    pair.a.connect(&client, SocketAddrV4::new(IP_B, PORT)).unwrap();
    assert_eq!(pair.a.send(&client, &data, MsgFlags::empty()), Ok(data.len()));
    pair.a.close(client).unwrap();

    assert_eq!(handle.join().unwrap(), data);
}

#[test]
fn test_lost_segment_is_retransmitted() {
    let pair = Pair::new();
    let server = listener(&pair.b, 1);

    let b = pair.b.clone();
    let handle = thread::spawn(move || {
        let (conn, _) = b.accept(&server, MsgFlags::empty()).unwrap();
        recv_all(&b, &conn)
    });

    let client = pair.a.socket(Domain::Inet, SockType::Stream).unwrap();
    pair.a.connect(&client, SocketAddrV4::new(IP_B, PORT)).unwrap();

    *pair.drop_from_a.lock().unwrap() = 1;
    pair.a.send(&client, b"resent", MsgFlags::empty()).unwrap();
    pair.a.close(client).unwrap();

    assert_eq!(handle.join().unwrap(), b"resent");
}

#[test]
fn test_lost_syn_is_retransmitted() {
    let pair = Pair::new();
    let server = listener(&pair.b, 1);
    let b = pair.b.clone();
    let handle = thread::spawn(move || b.accept(&server, MsgFlags::empty()).map(|(_, peer)| peer));

    // The ARP request goes through; the first SYN after it is lost
    pair.a.arp_register(IP_B, MAC_B, false);
    *pair.drop_from_a.lock().unwrap() = 1;

    let client = pair.a.socket(Domain::Inet, SockType::Stream).unwrap();
    pair.a.connect(&client, SocketAddrV4::new(IP_B, PORT)).unwrap();
    let peer = handle.join().unwrap().unwrap();
    assert_eq!(peer, pair.a.local_addr(&client).unwrap());
}

#[test]
fn test_accept_errors() {
    let pair = Pair::new();

    let unbound = pair.b.socket(Domain::Inet, SockType::Stream).unwrap();
    assert_eq!(
        pair.b.accept(&unbound, MsgFlags::DONTWAIT).map(|_| ()),
        Err(NetError::NotListening)
    );

    let server = listener(&pair.b, 1);
    assert_eq!(pair.b.accept(&server, MsgFlags::DONTWAIT).map(|_| ()), Err(NetError::Again));

    let udp = pair.b.socket(Domain::Inet, SockType::Datagram).unwrap();
    assert_eq!(pair.b.listen(&udp, 1), Err(NetError::NotSupported));
}

#[test]
fn test_calls_on_unconnected_socket() {
    let pair = Pair::new();
    let sock = pair.a.socket(Domain::Inet, SockType::Stream).unwrap();
    let mut buf = [0u8; 4];

    assert_eq!(pair.a.send(&sock, b"x", MsgFlags::empty()), Err(NetError::ConnNotExist));
    assert_eq!(pair.a.recv(&sock, &mut buf, MsgFlags::empty()), Err(NetError::ConnNotExist));

    let server = listener(&pair.b, 1);
    assert_eq!(pair.b.send(&server, b"x", MsgFlags::empty()), Err(NetError::ConnNotExist));

    // A listener may turn into an active open; nobody answers on port 1
    assert_eq!(
        pair.b.connect(&server, SocketAddrV4::new(IP_A, 1)),
        Err(NetError::ConnRefused)
    );
}

#[test]
fn test_bind_conflicts() {
    let pair = Pair::new();
    let _server = listener(&pair.a, 1);
    let other = pair.a.socket(Domain::Inet, SockType::Stream).unwrap();
    assert_eq!(
        pair.a.bind(&other, SocketAddrV4::new(IP_A, PORT)),
        Err(NetError::AddrInUse)
    );
}

#[test]
fn test_connect_twice_fails() {
    let pair = Pair::new();
    let server = listener(&pair.b, 1);
    let b = pair.b.clone();
    let handle = thread::spawn(move || b.accept(&server, MsgFlags::empty()).map(|(conn, _)| conn));

    let client = pair.a.socket(Domain::Inet, SockType::Stream).unwrap();
    pair.a.connect(&client, SocketAddrV4::new(IP_B, PORT)).unwrap();
    assert_eq!(
        pair.a.connect(&client, SocketAddrV4::new(IP_B, PORT)),
        Err(NetError::ConnExist)
    );
    handle.join().unwrap().unwrap();
}

#[test]
fn test_nonblocking_recv() {
    let pair = Pair::new();
    let server = listener(&pair.b, 1);
    let b = pair.b.clone();
    let handle = thread::spawn(move || b.accept(&server, MsgFlags::empty()).map(|(conn, _)| conn));

    let client = pair.a.socket(Domain::Inet, SockType::Stream).unwrap();
    pair.a.connect(&client, SocketAddrV4::new(IP_B, PORT)).unwrap();
    let conn = handle.join().unwrap().unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(pair.b.recv(&conn, &mut buf, MsgFlags::DONTWAIT), Err(NetError::Again));

    pair.a.send(&client, b"ping", MsgFlags::empty()).unwrap();
    assert!(wait_for(Duration::from_secs(2), || {
        pair.b.recv(&conn, &mut buf, MsgFlags::DONTWAIT) == Ok(4)
    }));
    assert_eq!(&buf[..4], b"ping");
}
