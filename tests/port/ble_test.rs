// BLE Port Tests
// Tests the BLE port lifecycle and relaying against the in-memory GATT central

use modbus_ports::port::{
    BlePort, BlePortConfig, CloseReason, DeviceHandle, MockFailure, MockGattCentral, Port,
    PortError, PortEvent, PortState,
};
use std::sync::Arc;
use tokio::time::{timeout, Duration};

const SERVICE: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
const WRITE_CHAR: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";
const NOTIFY_CHAR: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

fn mock_central() -> MockGattCentral {
    MockGattCentral::new().with_device(
        DeviceHandle::new("AA:BB:CC:DD:EE:FF").with_name("RTU-BLE"),
        &[(SERVICE, WRITE_CHAR), (SERVICE, NOTIFY_CHAR)],
    )
}

fn port_with(central: &Arc<MockGattCentral>) -> BlePort {
    crate::init_tracing();
    BlePort::new(central.clone(), BlePortConfig::default())
}

async fn open_port() -> (Arc<MockGattCentral>, BlePort) {
    let central = Arc::new(mock_central());
    let mut port = port_with(&central);
    port.open().await.unwrap();
    (central, port)
}

// ============================================================================
// OPEN
// ============================================================================

#[tokio::test]
async fn test_open_success() {
    let (central, port) = open_port().await;

    assert!(port.is_open());
    assert_eq!(port.state(), PortState::Open);
    assert_eq!(port.device().map(|d| d.id()), Some("AA:BB:CC:DD:EE:FF"));
    assert!(central.connected());
    assert!(central.notifying());
    // Disconnect listener and value-change listener
    assert_eq!(central.active_listeners(), 2);
}

#[tokio::test]
async fn test_open_twice_fails() {
    let (_central, mut port) = open_port().await;

    assert!(matches!(port.open().await, Err(PortError::AlreadyOpen)));
}

#[tokio::test]
async fn test_open_selection_cancelled() {
    let central = Arc::new(MockGattCentral::new());
    let mut port = port_with(&central);

    let result = port.open().await;

    assert!(matches!(result, Err(PortError::DeviceNotSelected(_))));
    assert!(!port.is_open());
    assert_eq!(port.state(), PortState::Closed);
    assert_eq!(central.listeners_registered(), 0);
}

#[tokio::test]
async fn test_open_device_without_service_not_offered() {
    let central = Arc::new(
        MockGattCentral::new().with_device(DeviceHandle::new("other"), &[("0000180f-0000-1000-8000-00805f9b34fb", "2a19")]),
    );
    let mut port = port_with(&central);

    assert!(matches!(port.open().await, Err(PortError::DeviceNotSelected(_))));
    assert_eq!(central.listeners_registered(), 0);
}

#[tokio::test]
async fn test_open_connect_failure_releases_listener() {
    let central = Arc::new(mock_central().with_failure(MockFailure::Connect));
    let mut port = port_with(&central);

    let result = port.open().await;

    assert!(matches!(result, Err(PortError::OpenFailed { ref step, .. }) if step == "GATT connect"));
    assert_eq!(central.active_listeners(), 0);
    assert!(!central.connected());
}

#[tokio::test]
async fn test_open_missing_characteristic_disconnects() {
    let central = Arc::new(MockGattCentral::new().with_device(
        DeviceHandle::new("AA:BB:CC:DD:EE:FF"),
        &[(SERVICE, WRITE_CHAR)],
    ));
    let mut port = port_with(&central);

    let result = port.open().await;

    assert!(matches!(result, Err(PortError::OpenFailed { ref step, .. }) if step == "notify characteristic"));
    assert!(!central.connected());
    assert_eq!(central.disconnect_calls(), 1);
    assert_eq!(central.active_listeners(), 0);
    assert!(!port.is_open());
}

#[tokio::test]
async fn test_open_subscribe_failure_disconnects() {
    let central = Arc::new(mock_central().with_failure(MockFailure::StartNotifications));
    let mut port = port_with(&central);

    let result = port.open().await;

    assert!(matches!(result, Err(PortError::OpenFailed { .. })));
    assert!(!central.connected());
    assert!(!central.notifying());
}

#[tokio::test]
async fn test_open_invalid_config() {
    let central = Arc::new(mock_central());
    let mut port = BlePort::new(central.clone(), BlePortConfig::new().with_write_service(""));

    assert!(matches!(port.open().await, Err(PortError::InvalidConfig(_))));
    assert_eq!(central.listeners_registered(), 0);
}

// ============================================================================
// WRITE
// ============================================================================

#[tokio::test]
async fn test_write_single_characteristic_write() {
    let (central, mut port) = open_port().await;
    let frame = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A];

    port.write(&frame).await.unwrap();

    assert_eq!(central.written(), vec![frame]);
    assert_eq!(port.stats().frames_sent, 1);
}

#[tokio::test]
async fn test_write_not_fragmented() {
    let (central, mut port) = open_port().await;
    let frame = vec![0x5A; 300];

    port.write(&frame).await.unwrap();

    assert_eq!(central.written().len(), 1);
    assert_eq!(central.written()[0].len(), 300);
}

#[tokio::test]
async fn test_write_when_closed() {
    let central = Arc::new(mock_central());
    let mut port = port_with(&central);

    assert!(matches!(port.write(&[0x01, 0x02]).await, Err(PortError::NotOpen)));
}

#[tokio::test]
async fn test_write_backend_failure() {
    let central = Arc::new(mock_central().with_failure(MockFailure::Write));
    let mut port = port_with(&central);
    port.open().await.unwrap();

    assert!(matches!(port.write(&[0x01, 0x02]).await, Err(PortError::SendFailed(_))));
}

// ============================================================================
// NOTIFICATIONS
// ============================================================================

#[tokio::test]
async fn test_notification_relayed_unmodified() {
    let (central, mut port) = open_port().await;

    // No validation: even a truncated frame is passed through
    central.notify(&[0x01, 0x03, 0x02]);

    let event = timeout(Duration::from_secs(1), port.next_event()).await.unwrap();
    assert_eq!(event, Some(PortEvent::DataReceived { frame: vec![0x01, 0x03, 0x02] }));
    assert_eq!(port.stats().frames_received, 1);
}

#[tokio::test]
async fn test_poll_events_preserves_order() {
    let (central, mut port) = open_port().await;

    central.notify(&[0x01]);
    central.notify(&[0x02, 0x03]);

    let events = port.poll_events().await;
    assert_eq!(
        events,
        vec![
            PortEvent::DataReceived { frame: vec![0x01] },
            PortEvent::DataReceived { frame: vec![0x02, 0x03] },
        ]
    );
}

#[tokio::test]
async fn test_no_notifications_after_close() {
    let (central, mut port) = open_port().await;
    port.close().await.unwrap();

    central.notify(&[0x01, 0x02]);

    let events = port.poll_events().await;
    assert_eq!(events, vec![PortEvent::Closed { reason: CloseReason::Requested }]);
}

// ============================================================================
// CLOSE
// ============================================================================

#[tokio::test]
async fn test_close_tears_down() {
    let (central, mut port) = open_port().await;

    port.close().await.unwrap();

    assert!(!port.is_open());
    assert_eq!(port.state(), PortState::Closed);
    assert!(!central.connected());
    assert!(!central.notifying());
    assert_eq!(central.active_listeners(), 0);
}

#[tokio::test]
async fn test_close_when_closed_is_noop() {
    let central = Arc::new(mock_central());
    let mut port = port_with(&central);

    assert!(port.close().await.is_ok());
    assert!(port.poll_events().await.is_empty());
    assert_eq!(central.disconnect_calls(), 0);
}

#[tokio::test]
async fn test_close_collects_teardown_errors() {
    let central = Arc::new(
        mock_central()
            .with_failure(MockFailure::StopNotifications)
            .with_failure(MockFailure::Disconnect),
    );
    let mut port = port_with(&central);
    port.open().await.unwrap();

    let result = port.close().await;

    match result {
        Err(PortError::CloseFailed(errors)) => assert_eq!(errors.len(), 2),
        other => panic!("expected CloseFailed, got {:?}", other),
    }
    // The port still converges to closed
    assert_eq!(port.state(), PortState::Closed);
    assert_eq!(port.poll_events().await.len(), 1);
}

#[tokio::test]
async fn test_reopen_after_close() {
    let (central, mut port) = open_port().await;

    port.close().await.unwrap();
    port.open().await.unwrap();

    assert!(port.is_open());
    assert!(central.connected());
    assert_eq!(port.stats().opens, 2);
}

// ============================================================================
// TRANSPORT DISCONNECT
// ============================================================================

#[tokio::test]
async fn test_unsolicited_disconnect_emits_one_closed() {
    let (central, mut port) = open_port().await;

    central.trigger_disconnect();

    let event = timeout(Duration::from_secs(1), port.next_event()).await.unwrap();
    assert_eq!(
        event,
        Some(PortEvent::Closed {
            reason: CloseReason::TransportDisconnected
        })
    );
    assert!(port.next_event().await.is_none());
    assert!(port.poll_events().await.is_empty());
    assert_eq!(port.stats().closes, 1);
}

#[tokio::test]
async fn test_close_after_disconnect_adds_nothing() {
    let (central, mut port) = open_port().await;

    central.trigger_disconnect();
    let events = port.poll_events().await;
    port.close().await.unwrap();

    assert_eq!(events.len(), 1);
    assert!(port.poll_events().await.is_empty());
    assert_eq!(port.state(), PortState::Closed);
    assert_eq!(central.disconnect_calls(), 0);
}

#[tokio::test]
async fn test_is_open_follows_backend_connection() {
    let (central, port) = open_port().await;

    central.trigger_disconnect();

    // Not yet observed as an event, but the connection is gone
    assert!(!port.is_open());
}

#[tokio::test]
async fn test_data_before_disconnect_delivered_first() {
    let (central, mut port) = open_port().await;

    central.notify(&[0x01, 0x83, 0x02, 0xC0, 0xF1]);
    central.trigger_disconnect();

    let first = port.next_event().await.unwrap();
    let second = port.next_event().await.unwrap();

    assert!(matches!(first, PortEvent::DataReceived { .. }));
    assert!(second.is_closed());
}

#[tokio::test]
async fn test_close_after_undrained_disconnect_succeeds() {
    let (central, mut port) = open_port().await;

    central.trigger_disconnect();
    let result = port.close().await;

    assert!(result.is_ok());
    assert_eq!(
        port.poll_events().await,
        vec![PortEvent::Closed {
            reason: CloseReason::TransportDisconnected
        }]
    );
    assert_eq!(central.disconnect_calls(), 0);
    assert_eq!(port.stats().closes, 1);
}

#[tokio::test]
async fn test_state_reports_closed_after_disconnect() {
    let (central, port) = open_port().await;

    central.trigger_disconnect();

    assert_eq!(port.state(), PortState::Closed);
}

#[tokio::test]
async fn test_reopen_after_undrained_disconnect() {
    let (central, mut port) = open_port().await;

    central.trigger_disconnect();
    port.open().await.unwrap();

    assert!(port.is_open());
    assert_eq!(port.state(), PortState::Open);
    assert!(central.connected());
    // The earlier cycle's close is still reported, once
    assert_eq!(
        port.poll_events().await,
        vec![PortEvent::Closed {
            reason: CloseReason::TransportDisconnected
        }]
    );
}

#[tokio::test]
async fn test_write_after_undrained_disconnect() {
    let (central, mut port) = open_port().await;

    central.notify(&[0x01, 0x83, 0x02, 0xC0, 0xF1]);
    central.trigger_disconnect();

    assert!(matches!(port.write(&[0x01, 0x03]).await, Err(PortError::NotOpen)));
    // Data that arrived before the drop is kept ahead of the close
    let events = port.poll_events().await;
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], PortEvent::DataReceived { .. }));
    assert!(events[1].is_closed());
}

// ============================================================================
// NOTIFICATION STREAM END
// ============================================================================

#[tokio::test]
async fn test_notification_stream_end_disconnects() {
    let (central, mut port) = open_port().await;

    central.end_notifications();

    let event = timeout(Duration::from_secs(1), port.next_event()).await.unwrap();
    assert_eq!(
        event,
        Some(PortEvent::Closed {
            reason: CloseReason::TransportDisconnected
        })
    );
    assert_eq!(central.disconnect_calls(), 1);
    assert!(!central.connected());
    assert_eq!(port.state(), PortState::Closed);
}

#[tokio::test]
async fn test_notification_stream_end_seen_by_poll() {
    let (central, mut port) = open_port().await;

    central.end_notifications();

    let events = port.poll_events().await;
    assert_eq!(events.len(), 1);
    assert!(events[0].is_closed());
    assert_eq!(central.disconnect_calls(), 1);
    assert!(port.poll_events().await.is_empty());
}
