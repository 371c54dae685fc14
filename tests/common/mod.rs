//! Shared fixtures for the scenario tests.

#![allow(dead_code)]

use isi_daq::params::{ParamMap, ParamValue};
use isi_daq::{Backend, BackendConfig};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Build a backend on ephemeral ports with a tiny virtual display, fast
/// stimulus parameters, and the mock camera selected.
pub fn test_backend(dir: &Path) -> Arc<Backend> {
    let backend = Backend::build(BackendConfig {
        data_dir: dir.join("data"),
        config_path: dir.join("config/isi_parameters.json"),
        control_port: 0,
        event_port: 0,
        stimulus_port: 0,
        camera_port: 0,
        dev_mode: Some(true),
        memory_budget_bytes: 1 << 30,
        slot_bytes: 256 * 1024,
        slot_count: 8,
    })
    .unwrap();

    // Shrink the virtual display so pre-generation is fast, and speed the
    // sweep up. These are trusted backend-side updates.
    let mut monitor = ParamMap::new();
    monitor.insert("width_px".into(), ParamValue::Int(64));
    monitor.insert("height_px".into(), ParamValue::Int(32));
    monitor.insert("refresh_rate_hz".into(), ParamValue::Float(60.0));
    backend.params.update("monitor", monitor).unwrap();

    let mut stimulus = ParamMap::new();
    stimulus.insert(
        "drift_speed_deg_per_sec".into(),
        ParamValue::Float(100.0),
    );
    backend.params.update("stimulus", stimulus).unwrap();

    let mut camera = ParamMap::new();
    camera.insert("selected_camera".into(), ParamValue::Str("Mock-0".into()));
    backend.params.update("camera", camera).unwrap();

    backend
}

/// A newline-delimited JSON client over one TCP stream.
pub struct JsonLines {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl JsonLines {
    pub fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(20)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Self {
            reader,
            writer: stream,
        }
    }

    pub fn send(&mut self, value: &Value) {
        self.writer
            .write_all(value.to_string().as_bytes())
            .unwrap();
        self.writer.write_all(b"\n").unwrap();
        self.writer.flush().unwrap();
    }

    pub fn read(&mut self) -> Value {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        assert!(!line.is_empty(), "peer closed the connection");
        serde_json::from_str(&line).unwrap()
    }

    /// Read until a message with the given `type` arrives; panics on
    /// timeout. Other messages are skipped.
    pub fn read_until_type(&mut self, kind: &str) -> Value {
        let deadline = Instant::now() + Duration::from_secs(20);
        while Instant::now() < deadline {
            let message = self.read();
            if message.get("type").and_then(|v| v.as_str()) == Some(kind) {
                return message;
            }
        }
        panic!("no '{kind}' message before timeout");
    }

    /// Send a command and read its (single) reply.
    pub fn request(&mut self, command: Value) -> Value {
        self.send(&command);
        self.read()
    }
}

/// A control-channel client that has consumed the greeting.
pub struct ControlClient {
    pub lines: JsonLines,
    pub ports: Ports,
}

#[derive(Debug, Clone, Copy)]
pub struct Ports {
    pub event: u16,
    pub stimulus: u16,
    pub camera: u16,
}

impl ControlClient {
    pub fn connect(backend: &Backend) -> Self {
        let mut lines = JsonLines::connect(backend.control.port());
        let greeting = lines.read();
        assert_eq!(greeting["type"], "transport_ready");
        let ports = Ports {
            event: greeting["ports"]["event"].as_u64().unwrap() as u16,
            stimulus: greeting["ports"]["stimulus"].as_u64().unwrap() as u16,
            camera: greeting["ports"]["camera"].as_u64().unwrap() as u16,
        };
        Self { lines, ports }
    }

    pub fn request(&mut self, command: Value) -> Value {
        self.lines.request(command)
    }

    pub fn request_ok(&mut self, command: Value) -> Value {
        let reply = self.lines.request(command.clone());
        assert_eq!(
            reply["success"], true,
            "command {command} failed: {reply}"
        );
        reply
    }
}

/// Perform the full startup handshake over the wire.
///
/// Returns the event and camera-sideband connections, subscribed before the
/// sentinel so nothing is missed.
pub fn perform_handshake(
    backend: &Backend,
    control: &mut ControlClient,
) -> (JsonLines, JsonLines, JsonLines) {
    let events = JsonLines::connect(control.ports.event);
    let stimulus = JsonLines::connect(control.ports.stimulus);
    let camera = JsonLines::connect(control.ports.camera);

    wait_for(|| {
        backend.events.subscriber_count() >= 1
            && backend.bus.stimulus_subscriber_count() >= 1
            && backend.bus.camera_subscriber_count() >= 1
    });

    control.request_ok(json!({"type": "shared_memory_readers_ready"}));
    control.request_ok(json!({"type": "camera_subscriber_confirmed"}));

    (events, stimulus, camera)
}

pub fn wait_for<F: FnMut() -> bool>(mut cond: F) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached before timeout");
}
