//! Full diagnostic conversations against the simulated ECU

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;

use candiag::config::MockConfig;
use candiag::security::XorKey;
use candiag::uds::dtc::{dtc_group, sub_function};
use candiag::{DiagError, DiagEvent, DtcCategory, KeyAlgorithm, KeyProvider, SessionType};
use common::{connected, next_event};

#[tokio::test]
async fn test_session_and_security_unlock() {
    let (_bus, orchestrator) = connected(MockConfig::default()).await;
    let mut events = orchestrator.subscribe();

    orchestrator.change_session(SessionType::Extended).unwrap();
    let event = next_event(&mut events, |e| matches!(e, DiagEvent::SessionChanged { .. })).await;
    match event {
        DiagEvent::SessionChanged { session_type, name } => {
            assert_eq!(session_type.code(), 0x03);
            assert_eq!(name, "Extended Diagnostic Session");
        }
        _ => unreachable!(),
    }

    orchestrator.request_seed(0x01).unwrap();
    let event = next_event(&mut events, |e| {
        matches!(e, DiagEvent::SecurityStatusChanged { .. })
    })
    .await;
    let seed = match event {
        DiagEvent::SecurityStatusChanged {
            level,
            unlocked,
            seed,
        } => {
            assert_eq!(level, 0x01);
            assert!(!unlocked);
            seed
        }
        _ => unreachable!(),
    };
    assert_eq!(seed.len(), 4);

    let key = XorKey(0x1234).calculate(&seed, 0x01).unwrap();
    orchestrator.send_key(0x02, key.clone()).unwrap();
    let event = next_event(&mut events, |e| {
        matches!(e, DiagEvent::SecurityStatusChanged { unlocked: true, .. })
    })
    .await;
    match event {
        DiagEvent::SecurityStatusChanged { level, .. } => assert_eq!(level, 0x01),
        _ => unreachable!(),
    }
    let security = orchestrator.security();
    assert!(security.unlocked);
    assert_eq!(security.key, key);

    orchestrator.disconnect().await;
    assert!(!orchestrator.security().unlocked);
    assert!(!orchestrator.session().active);
}

#[tokio::test]
async fn test_send_key_without_seed_is_rejected_locally() {
    let (bus, orchestrator) = connected(MockConfig::default()).await;

    let err = orchestrator
        .send_key(0x02, vec![0x00, 0x00, 0x44, 0x4C])
        .unwrap_err();
    assert!(matches!(err, DiagError::SequenceError(_)));
    assert!(bus.sent_frames().is_empty());
}

#[tokio::test]
async fn test_wrong_key_locks_and_consumes_seed() {
    let (_bus, orchestrator) = connected(MockConfig::default()).await;
    let mut events = orchestrator.subscribe();

    orchestrator.request_seed(0x01).unwrap();
    next_event(&mut events, |e| {
        matches!(e, DiagEvent::SecurityStatusChanged { .. })
    })
    .await;
    orchestrator
        .send_key(0x02, vec![0xDE, 0xAD, 0xBE, 0xEF])
        .unwrap();

    let event = next_event(&mut events, |e| matches!(e, DiagEvent::ResponseReceived { .. })).await;
    match event {
        DiagEvent::ResponseReceived { success, nrc, .. } => {
            assert!(!success);
            assert_eq!(nrc, Some(candiag::Nrc::INVALID_KEY));
        }
        _ => unreachable!(),
    }
    common::wait_until(|| !orchestrator.security().seed_pending).await;
    assert!(!orchestrator.security().unlocked);

    // A stale seed is never reused
    assert!(matches!(
        orchestrator.send_key(0x02, vec![0x00, 0x00, 0x44, 0x4C]),
        Err(DiagError::SequenceError(_))
    ));
}

#[tokio::test]
async fn test_unlock_with_provider() {
    let config = MockConfig {
        key: KeyAlgorithm::Crc16,
        ..Default::default()
    };
    let (_bus, orchestrator) = connected(config).await;
    let mut events = orchestrator.subscribe();

    let provider: Arc<dyn KeyProvider> = KeyAlgorithm::Crc16.provider();
    orchestrator.unlock(0x01, provider).unwrap();
    next_event(&mut events, |e| {
        matches!(e, DiagEvent::SecurityStatusChanged { unlocked: true, .. })
    })
    .await;
    assert!(orchestrator.security().unlocked);
    assert_eq!(orchestrator.security().level, 0x01);
}

#[tokio::test]
async fn test_seed_request_after_unlock_keeps_state() {
    let (_bus, orchestrator) = connected(MockConfig::default()).await;
    let mut events = orchestrator.subscribe();

    orchestrator
        .unlock(0x01, KeyAlgorithm::default().provider())
        .unwrap();
    next_event(&mut events, |e| {
        matches!(e, DiagEvent::SecurityStatusChanged { unlocked: true, .. })
    })
    .await;
    let before = orchestrator.security();

    // The ECU answers an unlocked level with a zero seed
    orchestrator.request_seed(0x01).unwrap();
    orchestrator
        .read_data_by_identifier(candiag::uds::standard_did::ACTIVE_DIAGNOSTIC_SESSION)
        .unwrap();
    let seen = common::collect_until(&mut events, |e| matches!(e, DiagEvent::DataRead { .. })).await;
    assert!(!seen
        .iter()
        .any(|e| matches!(e, DiagEvent::SecurityStatusChanged { .. })));

    let after = orchestrator.security();
    assert!(after.unlocked);
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_zero_seed_does_not_assert_unlock() {
    let config = MockConfig {
        seed: vec![0x00, 0x00, 0x00, 0x00],
        ..Default::default()
    };
    let (_bus, orchestrator) = connected(config).await;
    let mut events = orchestrator.subscribe();

    orchestrator.request_seed(0x01).unwrap();
    next_event(&mut events, |e| {
        matches!(e, DiagEvent::ResponseReceived { success: true, .. })
    })
    .await;
    common::wait_until(|| orchestrator.security().seed_pending).await;

    let security = orchestrator.security();
    assert!(!security.unlocked);
    assert!(security.seed.is_empty());
    assert_eq!(security.level, 0x01);
}

#[tokio::test]
async fn test_read_dtcs_and_clear() {
    let (_bus, orchestrator) = connected(MockConfig::default()).await;
    let mut events = orchestrator.subscribe();

    orchestrator
        .read_dtcs(sub_function::REPORT_DTC_BY_STATUS_MASK, 0xFF)
        .unwrap();
    let event = next_event(&mut events, |e| matches!(e, DiagEvent::DtcsReceived { .. })).await;
    match event {
        DiagEvent::DtcsReceived {
            sub_function,
            status_availability_mask,
            dtcs,
        } => {
            assert_eq!(sub_function, 0x02);
            assert_eq!(status_availability_mask, 0xFF);
            assert_eq!(dtcs.len(), 1);
            assert_eq!(dtcs[0].code, "P0103");
            assert_eq!(dtcs[0].category, DtcCategory::Powertrain);
            assert_eq!(dtcs[0].status.flags(), vec!["ConfirmedDTC"]);
        }
        _ => unreachable!(),
    }

    orchestrator.clear_dtcs(dtc_group::ALL).unwrap();
    orchestrator.read_dtc_count(0xFF).unwrap();
    let event = next_event(&mut events, |e| {
        matches!(e, DiagEvent::DtcCountReceived { .. })
    })
    .await;
    match event {
        DiagEvent::DtcCountReceived { count, .. } => assert_eq!(count, 0),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_multi_frame_write_and_read_back() {
    let (_bus, orchestrator) = connected(MockConfig::default()).await;
    let mut events = orchestrator.subscribe();
    let vin = b"ZZZ98765432109876".to_vec();

    orchestrator.write_data_by_identifier(0xF190, &vin).unwrap();
    orchestrator.read_data_by_identifier(0xF190).unwrap();
    let event = next_event(&mut events, |e| matches!(e, DiagEvent::DataRead { .. })).await;
    match event {
        DiagEvent::DataRead { did, data } => {
            assert_eq!(did, 0xF190);
            assert_eq!(data, vin);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_ecu_reset_returns_to_default_session() {
    let (bus, orchestrator) = connected(MockConfig::default()).await;
    let mut events = orchestrator.subscribe();

    orchestrator.change_session(SessionType::Programming).unwrap();
    next_event(&mut events, |e| matches!(e, DiagEvent::SessionChanged { .. })).await;
    assert_eq!(bus.ecu_session(), 0x02);

    // Response pending before the reset confirmation
    bus.set_response_pending(0x11, 1);
    orchestrator.ecu_reset(0x01).unwrap();
    let event = next_event(&mut events, |e| matches!(e, DiagEvent::SessionChanged { .. })).await;
    match event {
        DiagEvent::SessionChanged { session_type, .. } => {
            assert_eq!(session_type, SessionType::Default)
        }
        _ => unreachable!(),
    }
    assert_eq!(bus.ecu_session(), 0x01);
}

#[tokio::test]
async fn test_suppressed_keepalive_and_raw_request() {
    let (bus, orchestrator) = connected(MockConfig::default()).await;
    let mut events = orchestrator.subscribe();

    orchestrator.keep_alive(true).unwrap();
    let id = orchestrator.send_raw(vec![0x22, 0xF1, 0x86]).unwrap();
    let event = next_event(&mut events, |e| matches!(e, DiagEvent::ResponseReceived { .. })).await;
    match event {
        DiagEvent::ResponseReceived {
            id: got,
            service,
            data,
            ..
        } => {
            assert_eq!(got, id);
            assert_eq!(service, "ReadDataByIdentifier");
            assert_eq!(data, vec![0x62, 0xF1, 0x86, 0x01]);
        }
        _ => unreachable!(),
    }
    common::wait_until(|| bus.sent_frames().iter().any(|f| f.data[1] == 0x3E)).await;
    let tester_present = bus
        .sent_frames()
        .into_iter()
        .find(|f| f.data[1] == 0x3E)
        .unwrap();
    assert_eq!(&tester_present.data[..3], &[0x02, 0x3E, 0x80]);
}
