//! The control channel server.
//!
//! Request/response over localhost TCP, newline-delimited JSON. Each new
//! connection immediately receives the `transport_ready` greeting naming
//! every channel's port, then commands are read line by line and answered in
//! order through the [`CommandDispatcher`]. Replies carry no timeout on
//! either side: a handler that hangs is a user-visible bug, not something to
//! paper over with retries.

use crate::control::dispatch::CommandDispatcher;
use crate::control::protocol::error_reply;
use crate::error::{IsiError, IsiResult};
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

/// Ports of all backend channels, sent in the greeting.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ChannelPorts {
    /// Control (this) channel.
    pub control: u16,
    /// Event broadcast channel.
    pub event: u16,
    /// Stimulus frame-metadata sideband.
    pub stimulus: u16,
    /// Camera frame-metadata sideband.
    pub camera: u16,
}

/// Accepts control connections and serves the command surface.
pub struct ControlServer {
    port: u16,
    stop: Arc<AtomicBool>,
}

impl ControlServer {
    /// Bind on `127.0.0.1:port` (0 picks an ephemeral port).
    pub fn bind(
        port: u16,
        dispatcher: Arc<CommandDispatcher>,
        ports: ChannelPorts,
    ) -> IsiResult<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        let port = listener.local_addr()?.port();
        let stop = Arc::new(AtomicBool::new(false));

        {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("control-accept".into())
                .spawn(move || {
                    for stream in listener.incoming() {
                        if stop.load(Ordering::Acquire) {
                            break;
                        }
                        match stream {
                            Ok(stream) => {
                                let dispatcher = Arc::clone(&dispatcher);
                                let greeting = greeting(port, ports);
                                let spawned = thread::Builder::new()
                                    .name("control-conn".into())
                                    .spawn(move || serve_connection(stream, &dispatcher, greeting));
                                if let Err(err) = spawned {
                                    warn!(error = %err, "could not spawn control connection thread");
                                }
                            }
                            Err(err) => warn!(error = %err, "control accept failed"),
                        }
                    }
                })
                .map_err(IsiError::Io)?;
        }

        Ok(Self { port, stop })
    }

    /// Port clients connect to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting connections.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = TcpStream::connect(("127.0.0.1", self.port));
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn greeting(control_port: u16, mut ports: ChannelPorts) -> Value {
    ports.control = control_port;
    serde_json::json!({
        "type": "transport_ready",
        "ports": ports,
    })
}

fn serve_connection(stream: TcpStream, dispatcher: &CommandDispatcher, greeting: Value) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".into());
    debug!(peer = %peer, "control connection opened");

    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(err) => {
            warn!(error = %err, "could not clone control stream");
            return;
        }
    };
    let _ = stream.set_nodelay(true);

    if write_line(&mut writer, &greeting).is_err() {
        return;
    }

    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Value>(&line) {
            Ok(command) => dispatcher.dispatch(&command),
            Err(err) => error_reply(format!("invalid JSON command: {err}")),
        };

        if write_line(&mut writer, &reply).is_err() {
            break;
        }
    }
    debug!(peer = %peer, "control connection closed");
}

fn write_line(writer: &mut TcpStream, value: &Value) -> std::io::Result<()> {
    writer.write_all(value.to_string().as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}
