//! Startup handshake: no camera frames before the renderer confirms.

mod common;

use common::{wait_for, ControlClient, JsonLines};
use isi_daq::bus::SENTINEL_CAMERA_NAME;
use isi_daq::startup::SystemState;
use serde_json::json;
use serial_test::serial;
use tempfile::tempdir;

#[test]
#[serial]
fn camera_starts_only_after_subscriber_confirmation() {
    let dir = tempdir().unwrap();
    let backend = common::test_backend(dir.path());

    assert_eq!(backend.startup.state(), SystemState::WaitingFrontend);
    assert!(!backend.camera.is_streaming());

    let mut control = ControlClient::connect(&backend);

    // Subscribe to the channels before announcing readiness so the
    // sentinel cannot be missed.
    let mut events = JsonLines::connect(control.ports.event);
    let mut camera_sideband = JsonLines::connect(control.ports.camera);
    wait_for(|| backend.events.subscriber_count() >= 1);
    wait_for(|| backend.bus.camera_subscriber_count() >= 1);

    control.request_ok(json!({"type": "shared_memory_readers_ready", "messageId": "h1"}));

    // The sentinel proves the sideband path end to end.
    let sentinel = camera_sideband.read_until_type("camera_frame");
    assert_eq!(sentinel["camera_name"], SENTINEL_CAMERA_NAME);

    // Still waiting: the capture loop must not be running.
    assert_eq!(backend.startup.state(), SystemState::WaitingFrontend);
    assert!(!backend.camera.is_streaming());
    assert_eq!(backend.bus.camera_frames_written(), 1);

    control.request_ok(json!({"type": "camera_subscriber_confirmed", "messageId": "h2"}));

    // Ready is broadcast and camera frames begin flowing.
    let state = events.read_until_type("system_state");
    assert_eq!(state["state"], "ready");
    assert_eq!(backend.startup.state(), SystemState::Ready);

    let frame = camera_sideband.read_until_type("camera_frame");
    // Skip any further sentinel reads; the first real frame names the mock.
    let frame = if frame["camera_name"] == SENTINEL_CAMERA_NAME {
        camera_sideband.read_until_type("camera_frame")
    } else {
        frame
    };
    assert_eq!(frame["camera_name"], "Mock-0");
    assert_eq!(frame["channels"], 1);
    assert_eq!(frame["timestamp_source"], "hardware");

    wait_for(|| backend.camera.is_streaming());
    backend.shutdown();
}

#[test]
#[serial]
fn confirmation_without_readers_ready_fails() {
    let dir = tempdir().unwrap();
    let backend = common::test_backend(dir.path());
    let mut control = ControlClient::connect(&backend);

    let reply = control.request(json!({"type": "camera_subscriber_confirmed", "messageId": "x"}));
    assert_eq!(reply["success"], false);
    assert_eq!(reply["messageId"], "x");
    assert!(reply["error"]
        .as_str()
        .unwrap()
        .contains("Subscriber not ready"));
    assert_eq!(backend.startup.state(), SystemState::WaitingFrontend);
    backend.shutdown();
}
