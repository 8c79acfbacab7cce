//! End-to-end tests for the timing-event listener.
//!
//! These tests exercise the real socket path: the listener binds its
//! wildcard port and joins the multicast group, and the test injects
//! datagrams over loopback. Tests run serially because they bind the
//! fixed DAQ port range.

use std::time::{Duration, Instant};

use serial_test::serial;

use camsim::timing::{TimestampListener, TimingEvent};

fn event(group_mask: u32, fiducial_high: u32, commands: Vec<u8>) -> TimingEvent {
    TimingEvent {
        nanoseconds: 250_000_000,
        seconds: 1_700_000_000,
        fiducial_low: 0,
        fiducial_high,
        group_mask,
        event_code: 40,
        commands,
    }
}

async fn inject(port: u16, event: &TimingEvent) {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&event.encode(), ("127.0.0.1", port))
        .await
        .unwrap();
}

#[tokio::test]
#[serial]
async fn matching_event_is_delivered_with_commands() {
    // Platform 0, readout group 2, datagram carrying groupMask 0b0100
    let listener = TimestampListener::new(0, 2, None);
    listener.start().await.unwrap();

    inject(listener.port(), &event(0b0100, 0x2_AAAA, vec![1, 2])).await;

    let received = listener.get(Duration::from_secs(2)).await.unwrap();
    assert_eq!(received.group_mask, 0b0100);
    assert_eq!(received.commands, vec![1, 2]);
    assert_eq!(received.fiducial(), 0x2_AAAA & 0x1ffff);

    listener.stop(true).await;
    assert!(!listener.is_running().await);
}

#[tokio::test]
#[serial]
async fn event_outside_readout_group_is_never_yielded() {
    // Same datagram, but this client is readout group 0
    let listener = TimestampListener::new(1, 0, None);
    listener.start().await.unwrap();

    inject(listener.port(), &event(0b0100, 1, vec![1, 2])).await;

    let started = Instant::now();
    let err = listener.get(Duration::from_millis(200)).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(started.elapsed() >= Duration::from_millis(200));

    listener.stop(true).await;
}

#[tokio::test]
#[serial]
async fn events_are_delivered_in_arrival_order() {
    let listener = TimestampListener::new(2, 1, None);
    listener.start().await.unwrap();

    for fiducial in 1..=3 {
        inject(listener.port(), &event(0b0010, fiducial, Vec::new())).await;
    }

    for expected in 1..=3 {
        let received = listener.get(Duration::from_secs(2)).await.unwrap();
        assert_eq!(received.fiducial_high, expected);
    }

    listener.stop(true).await;
}

#[tokio::test]
#[serial]
async fn malformed_datagrams_are_dropped_without_killing_the_loop() {
    let listener = TimestampListener::new(3, 0, None);
    listener.start().await.unwrap();

    // Too short, then command-count mismatch, then a good one
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&[0u8; 5], ("127.0.0.1", listener.port()))
        .await
        .unwrap();
    let mut bad = event(0b0001, 9, vec![1, 2, 3]).encode();
    bad.pop();
    socket
        .send_to(&bad, ("127.0.0.1", listener.port()))
        .await
        .unwrap();
    inject(listener.port(), &event(0b0001, 9, Vec::new())).await;

    let received = listener.get(Duration::from_secs(2)).await.unwrap();
    assert_eq!(received.fiducial_high, 9);

    listener.stop(true).await;
}

#[tokio::test]
#[serial]
async fn start_and_stop_are_idempotent() {
    let listener = TimestampListener::new(4, 0, None);
    listener.start().await.unwrap();
    // Second start while running is a no-op
    listener.start().await.unwrap();
    assert!(listener.is_running().await);

    listener.stop(true).await;
    listener.stop(true).await;
    assert!(!listener.is_running().await);
}
