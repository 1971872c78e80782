mod common;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::CondvarScheduler;
use rustrial_net::drivers::net::{LinkStatus, NetworkDevice, TransmitError};
use rustrial_net::net::config::{InterfaceConfig, NetConfig, MTU};
use rustrial_net::net::ethernet;
use rustrial_net::net::loopback::LoopbackDevice;
use rustrial_net::net::socket::{Domain, MsgFlags, SockType};
use rustrial_net::net::tcp::TcpState;
use rustrial_net::NetStack;

const LOCALHOST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

fn loopback_stack() -> NetStack {
    let mut stack = NetStack::new(NetConfig::default(), Arc::new(CondvarScheduler::default()));
    stack
        .add_interface(
            InterfaceConfig::new("lo", LOCALHOST, Ipv4Addr::new(255, 0, 0, 0)),
            Box::new(LoopbackDevice::default()),
        )
        .unwrap();
    stack
}

#[test]
fn test_loopback_device_basics() {
    let lo = LoopbackDevice::new(8);
    assert_eq!(lo.mac_address(), [0; 6]);
    assert_eq!(lo.link_status(), LinkStatus::Up);
    assert!(lo.is_ready());
    assert_eq!(lo.device_name(), "lo (loopback)");
    assert_eq!(lo.pending(), 0);
}

#[test]
fn test_frames_come_back_in_order() {
    let mut lo = LoopbackDevice::new(8);
    lo.transmit(&[1, 2, 3]).unwrap();
    lo.transmit(&[4, 5]).unwrap();
    assert_eq!(lo.pending(), 2);

    assert_eq!(lo.receive(), Some(vec![1, 2, 3]));
    assert_eq!(lo.receive(), Some(vec![4, 5]));
    assert_eq!(lo.receive(), None);
}

#[test]
fn test_full_queue_rejects() {
    let mut lo = LoopbackDevice::new(2);
    lo.transmit(&[1]).unwrap();
    lo.transmit(&[2]).unwrap();
    assert_eq!(lo.transmit(&[3]), Err(TransmitError::BufferFull));

    // Draining one makes room again
    assert_eq!(lo.receive(), Some(vec![1]));
    lo.transmit(&[3]).unwrap();
}

#[test]
fn test_oversized_frame_rejected() {
    let mut lo = LoopbackDevice::default();
    let frame = vec![0u8; MTU + ethernet::HEADER_SIZE + 1];
    assert_eq!(lo.transmit(&frame), Err(TransmitError::PacketTooLarge));
    assert_eq!(lo.pending(), 0);
}

#[test]
fn test_udp_to_self() {
    let stack = loopback_stack();
    let rx = stack.socket(Domain::Inet, SockType::Datagram).unwrap();
    stack.bind(&rx, SocketAddrV4::new(LOCALHOST, 4000)).unwrap();
    let tx = stack.socket(Domain::Inet, SockType::Datagram).unwrap();

    stack
        .sendto(&tx, b"hello, me", SocketAddrV4::new(LOCALHOST, 4000), MsgFlags::empty())
        .unwrap();
    assert_eq!(stack.poll(), 1);

    let mut buf = [0u8; 32];
    let (n, from) = stack.recvfrom(&rx, &mut buf, MsgFlags::DONTWAIT).unwrap();
    assert_eq!(&buf[..n], b"hello, me");
    assert_eq!(*from.ip(), LOCALHOST);
    assert_eq!(from.port(), stack.local_addr(&tx).unwrap().port());
}

#[test]
fn test_ping_self() {
    let stack = loopback_stack();
    stack.ping(LOCALHOST, 1, 1, b"echo").unwrap();
    // The request and the reply it triggers both come back on one poll
    assert_eq!(stack.poll(), 2);
    assert_eq!(stack.poll(), 0);
}

#[test]
fn test_tcp_to_self() {
    let stack = Arc::new(loopback_stack());
    let running = Arc::new(AtomicBool::new(true));
    let pump = {
        let (stack, running) = (stack.clone(), running.clone());
        thread::spawn(move || {
            while running.load(Ordering::Acquire) {
                if stack.poll() == 0 {
                    stack.tick();
                    stack.run_timers();
                    thread::sleep(Duration::from_micros(200));
                }
            }
        })
    };

    let listener = stack.socket(Domain::Inet, SockType::Stream).unwrap();
    stack.bind(&listener, SocketAddrV4::new(LOCALHOST, 8080)).unwrap();
    stack.listen(&listener, 4).unwrap();

    let server = {
        let stack = stack.clone();
        thread::spawn(move || {
            let (conn, _) = stack.accept(&listener, MsgFlags::empty()).unwrap();
            let mut buf = [0u8; 64];
            let n = stack.recv(&conn, &mut buf, MsgFlags::empty()).unwrap();
            stack.send(&conn, &buf[..n], MsgFlags::empty()).unwrap();
            stack.close(conn).unwrap();
        })
    };

    let client = stack.socket(Domain::Inet, SockType::Stream).unwrap();
    stack.connect(&client, SocketAddrV4::new(LOCALHOST, 8080)).unwrap();
    assert_eq!(stack.tcp_state(&client), Some(TcpState::Established));
    stack.send(&client, b"round trip", MsgFlags::empty()).unwrap();

    let mut buf = [0u8; 64];
    let n = stack.recv(&client, &mut buf, MsgFlags::empty()).unwrap();
    assert_eq!(&buf[..n], b"round trip");

    server.join().unwrap();
    stack.close(client).unwrap();

    running.store(false, Ordering::Release);
    pump.join().unwrap();
}
