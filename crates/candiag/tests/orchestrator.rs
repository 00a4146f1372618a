//! Orchestrator scheduling and recovery behavior

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use candiag::config::MockConfig;
use candiag::transport::TransportError;
use candiag::{
    priority, ConnectionState, DiagError, DiagEvent, ErrorKind, Request, SessionTimeouts,
    SessionType, UdsError,
};
use common::{drain, next_event, scripted, BLOCKER};

#[tokio::test]
async fn test_priority_order_within_and_across_tiers() {
    let (_bus, factory, orchestrator) = scripted().await;
    let script = factory.script.clone();
    let mut events = orchestrator.subscribe();

    orchestrator
        .enqueue(Request::new("Raw", BLOCKER.to_vec()).priority(priority::SESSION))
        .unwrap();
    script.blocker_started.notified().await;

    let order = Arc::new(Mutex::new(Vec::new()));
    for (tag, prio) in [(2u8, priority::KEEPALIVE), (0, priority::SESSION), (1, priority::ROUTINE)] {
        let order = order.clone();
        orchestrator
            .enqueue(
                Request::new("Raw", vec![0x22, 0x00, tag])
                    .priority(prio)
                    .on_success(move |_| {
                        order.lock().push(tag);
                        Ok(())
                    }),
            )
            .unwrap();
    }
    script.release.notify_one();

    // Blocker plus the three tagged requests
    for _ in 0..4 {
        next_event(&mut events, |e| matches!(e, DiagEvent::ResponseReceived { .. })).await;
    }
    common::wait_until(|| order.lock().len() == 3).await;
    assert_eq!(*order.lock(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_fifo_within_priority() {
    let (_bus, factory, orchestrator) = scripted().await;
    let script = factory.script.clone();
    let mut events = orchestrator.subscribe();

    orchestrator.enqueue(Request::new("Raw", BLOCKER.to_vec())).unwrap();
    script.blocker_started.notified().await;
    for tag in 1..=4u8 {
        orchestrator
            .enqueue(Request::new("Raw", vec![0x22, 0x00, tag]))
            .unwrap();
    }
    script.release.notify_one();

    for _ in 0..5 {
        next_event(&mut events, |e| matches!(e, DiagEvent::ResponseReceived { .. })).await;
    }
    let tags: Vec<u8> = script.payloads()[1..].iter().map(|p| p[2]).collect();
    assert_eq!(tags, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_disconnect_drops_queued_requests() {
    let (_bus, factory, orchestrator) = scripted().await;
    let script = factory.script.clone();

    orchestrator.enqueue(Request::new("Raw", BLOCKER.to_vec())).unwrap();
    script.blocker_started.notified().await;

    let fired = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let on_success = fired.clone();
        let on_failure = fired.clone();
        orchestrator
            .enqueue(
                Request::new("Raw", vec![0x22, 0xF1, 0x90])
                    .on_success(move |_| {
                        on_success.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .on_failure(move |_| {
                        on_failure.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .unwrap();
    }

    orchestrator.disconnect().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(script.payloads(), vec![BLOCKER.to_vec()]);
    assert_eq!(orchestrator.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_request_expired_in_queue_is_dropped_silently() {
    let (_bus, factory, orchestrator) = scripted().await;
    let script = factory.script.clone();
    let mut events = orchestrator.subscribe();

    orchestrator.enqueue(Request::new("Raw", BLOCKER.to_vec())).unwrap();
    script.blocker_started.notified().await;

    let fired = Arc::new(AtomicUsize::new(0));
    let on_success = fired.clone();
    let on_failure = fired.clone();
    let expired = orchestrator
        .enqueue(
            Request::new("ReadDataByIdentifier", vec![0x22, 0xF1, 0x90])
                .timeout(Duration::from_millis(30))
                .on_success(move |_| {
                    on_success.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .on_failure(move |_| {
                    on_failure.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .unwrap();
    let follow_up = orchestrator
        .enqueue(Request::new("Raw", vec![0x3E, 0x00]))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    script.release.notify_one();

    let mut seen = Vec::new();
    loop {
        let event = next_event(&mut events, |e| matches!(e, DiagEvent::ResponseReceived { .. })).await;
        if let DiagEvent::ResponseReceived { id, .. } = event {
            seen.push(id);
            if id == follow_up {
                break;
            }
        }
    }

    assert!(!seen.contains(&expired));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(!script.payloads().contains(&vec![0x22, 0xF1, 0x90]));
    assert!(orchestrator.is_connected());
}

#[tokio::test]
async fn test_enqueue_rejected_when_disconnected() {
    let bus = common::mock_bus(MockConfig::default());
    let orchestrator = candiag::Orchestrator::new(bus, common::fast_options());
    let mut events = orchestrator.subscribe();

    let err = orchestrator.read_data_by_identifier(0xF190).unwrap_err();
    assert!(matches!(err, DiagError::NotConnected));
    let event = next_event(&mut events, |e| matches!(e, DiagEvent::ErrorOccurred { .. })).await;
    match event {
        DiagEvent::ErrorOccurred { kind, .. } => assert_eq!(kind, ErrorKind::Precondition),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_connect_requires_transport() {
    let bus = common::mock_bus(MockConfig::default());
    bus.set_connected(false);
    let orchestrator = candiag::Orchestrator::new(bus, common::fast_options());

    let err = orchestrator
        .connect(candiag::Addressing::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DiagError::TransportNotConnected));
    assert_eq!(orchestrator.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_session_change_reasserts_timeouts() {
    let (_bus, factory, orchestrator) = scripted().await;
    let script = factory.script.clone();
    let mut events = orchestrator.subscribe();

    orchestrator.change_session(SessionType::Extended).unwrap();
    next_event(&mut events, |e| matches!(e, DiagEvent::SessionChanged { .. })).await;
    orchestrator.read_data_by_identifier(0xF190).unwrap();
    next_event(&mut events, |e| matches!(e, DiagEvent::DataRead { .. })).await;

    let table = SessionTimeouts::default();
    let calls = script.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].profile, table.profile_for(SessionType::Default));
    assert_eq!(calls[1].profile, table.profile_for(SessionType::Extended));
    assert_eq!(orchestrator.timeouts(), table.profile_for(SessionType::Extended));
    assert_eq!(orchestrator.session().session_type, SessionType::Extended);
}

#[tokio::test]
async fn test_timeout_recycles_connection() {
    let (_bus, factory, orchestrator) = scripted().await;
    factory.script.fail(0x22, UdsError::Timeout);
    let mut events = orchestrator.subscribe();

    orchestrator.change_session(SessionType::Extended).unwrap();
    next_event(&mut events, |e| matches!(e, DiagEvent::SessionChanged { .. })).await;

    orchestrator.read_data_by_identifier(0xF190).unwrap();
    let event = next_event(&mut events, |e| matches!(e, DiagEvent::ErrorOccurred { .. })).await;
    match event {
        DiagEvent::ErrorOccurred { kind, .. } => assert_eq!(kind, ErrorKind::Timeout),
        _ => unreachable!(),
    }

    assert_eq!(factory.built(), 2);
    assert_eq!(orchestrator.state(), ConnectionState::Connected);
    // The rebuilt connection starts over in the default session
    assert_eq!(orchestrator.session().session_type, SessionType::Default);

    orchestrator.ecu_reset(0x01).unwrap();
    next_event(&mut events, |e| {
        matches!(e, DiagEvent::ResponseReceived { success: true, .. })
    })
    .await;
}

#[tokio::test]
async fn test_negative_response_keeps_connection() {
    let (_bus, orchestrator) = common::connected(MockConfig::default()).await;
    let mut events = orchestrator.subscribe();

    orchestrator.read_data_by_identifier(0xABCD).unwrap();
    let event = next_event(&mut events, |e| matches!(e, DiagEvent::ResponseReceived { .. })).await;
    match event {
        DiagEvent::ResponseReceived {
            success, nrc, data, ..
        } => {
            assert!(!success);
            assert_eq!(nrc, Some(candiag::Nrc::REQUEST_OUT_OF_RANGE));
            assert_eq!(data, vec![0x7F, 0x22, 0x31]);
        }
        _ => unreachable!(),
    }
    assert_eq!(orchestrator.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_fatal_transport_error_reconnects() {
    let (_bus, factory, orchestrator) = scripted().await;
    factory.script.fail(
        0x22,
        UdsError::Transport(TransportError::DeviceRemoved("can0".to_string())),
    );
    let mut events = orchestrator.subscribe();

    orchestrator.read_data_by_identifier(0xF190).unwrap();
    next_event(&mut events, |e| {
        matches!(
            e,
            DiagEvent::ConnectionStateChanged {
                state: ConnectionState::Disconnected
            }
        )
    })
    .await;
    next_event(&mut events, |e| {
        matches!(
            e,
            DiagEvent::ConnectionStateChanged {
                state: ConnectionState::Connected
            }
        )
    })
    .await;
    assert_eq!(factory.built(), 2);
    assert!(orchestrator.is_connected());
}

#[tokio::test]
async fn test_fatal_transport_error_without_transport_stays_disconnected() {
    let (bus, factory, orchestrator) = scripted().await;
    factory.script.fail(
        0x22,
        UdsError::Transport(TransportError::DeviceRemoved("can0".to_string())),
    );
    bus.set_connected(false);
    let mut events = orchestrator.subscribe();

    orchestrator.read_data_by_identifier(0xF190).unwrap();
    next_event(&mut events, |e| {
        matches!(e, DiagEvent::ErrorOccurred { message, .. } if message.starts_with("Reconnect failed"))
    })
    .await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(orchestrator.state(), ConnectionState::Disconnected);
    assert_eq!(factory.built(), 1);
    assert!(matches!(
        orchestrator.keep_alive(false),
        Err(DiagError::NotConnected)
    ));
}

#[tokio::test]
async fn test_keepalive_failure_is_quiet() {
    let (_bus, factory, orchestrator) = scripted().await;
    factory.script.fail(0x3E, UdsError::Timeout);
    let mut events = orchestrator.subscribe();

    orchestrator.keep_alive(false).unwrap();
    common::wait_until(|| !factory.script.calls().is_empty()).await;
    orchestrator.read_data_by_identifier(0xF190).unwrap();

    let events = common::collect_until(&mut events, |e| matches!(e, DiagEvent::DataRead { .. })).await;
    assert!(!events
        .iter()
        .any(|e| matches!(e, DiagEvent::ErrorOccurred { .. })));
    // Only the DID read is reported
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, DiagEvent::ResponseReceived { .. }))
            .count(),
        1
    );
    assert_eq!(factory.built(), 1);
    assert_eq!(factory.script.payloads()[0], vec![0x3E, 0x00]);
}

#[tokio::test]
async fn test_callback_panic_does_not_kill_worker() {
    let (_bus, orchestrator) = common::connected(MockConfig::default()).await;
    let mut events = orchestrator.subscribe();

    orchestrator
        .enqueue(Request::new("Raw", vec![0x3E, 0x00]).on_success(|_| panic!("boom")))
        .unwrap();
    let event = next_event(&mut events, |e| matches!(e, DiagEvent::ErrorOccurred { .. })).await;
    match event {
        DiagEvent::ErrorOccurred { kind, message } => {
            assert_eq!(kind, ErrorKind::Callback);
            assert!(message.contains("boom"));
        }
        _ => unreachable!(),
    }

    orchestrator.read_data_by_identifier(0xF190).unwrap();
    let event = next_event(&mut events, |e| matches!(e, DiagEvent::DataRead { .. })).await;
    match event {
        DiagEvent::DataRead { data, .. } => assert_eq!(data, b"WDB1234567890ABCD".to_vec()),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_callback_error_is_reported() {
    let (_bus, orchestrator) = common::connected(MockConfig::default()).await;
    let mut events = orchestrator.subscribe();

    orchestrator
        .enqueue(
            Request::new("Raw", vec![0x3E, 0x00])
                .on_success(|_| Err(DiagError::Callback("rejected by host".to_string()))),
        )
        .unwrap();
    let event = next_event(&mut events, |e| matches!(e, DiagEvent::ErrorOccurred { .. })).await;
    match event {
        DiagEvent::ErrorOccurred { message, .. } => assert!(message.contains("rejected by host")),
        _ => unreachable!(),
    }
    assert!(orchestrator.is_connected());
}

#[tokio::test]
async fn test_invalid_arguments_never_enqueued() {
    let (bus, orchestrator) = common::connected(MockConfig::default()).await;

    assert!(matches!(
        orchestrator.request_seed(0x02),
        Err(DiagError::InvalidArgument(_))
    ));
    assert!(matches!(
        orchestrator.read_dtcs(0x01, 0xFF),
        Err(DiagError::InvalidArgument(_))
    ));
    assert!(matches!(
        orchestrator.clear_dtcs(0x0100_0000),
        Err(DiagError::InvalidArgument(_))
    ));
    assert!(matches!(
        orchestrator.write_data_by_identifier(0xF190, &[]),
        Err(DiagError::InvalidArgument(_))
    ));
    assert!(matches!(
        orchestrator.send_raw(Vec::new()),
        Err(DiagError::InvalidArgument(_))
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bus.sent_frames().is_empty());
}

#[tokio::test]
async fn test_reconnect_while_connected() {
    let (_bus, orchestrator) = common::connected(MockConfig::default()).await;
    let mut events = orchestrator.subscribe();

    orchestrator
        .connect(candiag::Addressing::new(0x7E0, 0x7E8))
        .await
        .unwrap();
    let states: Vec<ConnectionState> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            DiagEvent::ConnectionStateChanged { state } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Disconnecting,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
}
