//! Lossy broadcast publishers for metadata and events.
//!
//! A [`SidebandPublisher`] accepts TCP subscribers on a localhost port and
//! broadcasts newline-delimited JSON to all of them. Delivery is lossy by
//! design: each subscriber has a bounded outbox, and a subscriber that reads
//! slower than the publisher writes loses the overflow; the publisher never
//! blocks. The same type backs the event channel and both frame-metadata
//! sidebands.

use crate::error::{IsiError, IsiResult};
use crossbeam_channel::{bounded, Sender, TrySendError};
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, trace, warn};

/// Per-subscriber outbox depth. Overflow is dropped, not buffered.
const OUTBOX_CAPACITY: usize = 256;

struct Client {
    tx: Sender<String>,
}

/// Broadcast publisher with per-subscriber bounded outboxes.
pub struct SidebandPublisher {
    name: String,
    port: u16,
    clients: Arc<Mutex<Vec<Client>>>,
    stop: Arc<AtomicBool>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl SidebandPublisher {
    /// Bind on `127.0.0.1:port` (0 picks an ephemeral port) and start
    /// accepting subscribers.
    pub fn bind(name: &str, port: u16) -> IsiResult<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        let port = listener.local_addr()?.port();

        let clients: Arc<Mutex<Vec<Client>>> = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        {
            let clients = Arc::clone(&clients);
            let stop = Arc::clone(&stop);
            let thread_name = format!("sideband-{name}");
            let channel = name.to_string();
            thread::Builder::new()
                .name(thread_name)
                .spawn(move || {
                    for stream in listener.incoming() {
                        if stop.load(Ordering::Acquire) {
                            break;
                        }
                        match stream {
                            Ok(stream) => {
                                debug!(channel = %channel, "sideband subscriber connected");
                                let client = spawn_client_writer(stream, &channel);
                                lock(&clients).push(client);
                            }
                            Err(err) => {
                                warn!(channel = %channel, error = %err, "sideband accept failed");
                            }
                        }
                    }
                })
                .map_err(IsiError::Io)?;
        }

        Ok(Self {
            name: name.to_string(),
            port,
            clients,
            stop,
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Port subscribers connect to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Broadcast one JSON value to all current subscribers.
    ///
    /// Subscribers whose outbox is full lose this message; subscribers whose
    /// connection has died are pruned.
    pub fn publish(&self, value: &serde_json::Value) {
        let line = value.to_string();
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut clients = lock(&self.clients);
        clients.retain(|client| match client.tx.try_send(line.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(channel = %self.name, "slow sideband subscriber; message dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(channel = %self.name, "sideband subscriber disconnected");
                false
            }
        });
    }

    /// Number of live subscriber connections.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.clients).len()
    }

    /// Total messages handed to `publish`.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Messages dropped on full subscriber outboxes.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting subscribers and drop existing ones.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        // Unblock the accept loop with a throwaway connection.
        let _ = TcpStream::connect(("127.0.0.1", self.port));
        lock(&self.clients).clear();
    }
}

impl Drop for SidebandPublisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_client_writer(stream: TcpStream, channel: &str) -> Client {
    let (tx, rx) = bounded::<String>(OUTBOX_CAPACITY);
    let _ = stream.set_nodelay(true);
    let channel = channel.to_string();

    let spawned = thread::Builder::new()
        .name(format!("sideband-writer-{channel}"))
        .spawn(move || {
            let mut stream = stream;
            for line in rx {
                if stream
                    .write_all(line.as_bytes())
                    .and_then(|_| stream.write_all(b"\n"))
                    .is_err()
                {
                    // Receiver half drops with this thread; the publisher
                    // prunes the client on its next try_send.
                    break;
                }
            }
        });
    if let Err(err) = spawned {
        warn!(channel = %channel, error = %err, "could not spawn sideband writer");
    }

    Client { tx }
}

fn lock(clients: &Mutex<Vec<Client>>) -> std::sync::MutexGuard<'_, Vec<Client>> {
    match clients.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{BufRead, BufReader};
    use std::time::Duration;

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn subscriber_receives_published_lines() {
        let publisher = SidebandPublisher::bind("test", 0).unwrap();
        let stream = TcpStream::connect(("127.0.0.1", publisher.port())).unwrap();
        wait_for(|| publisher.subscriber_count() == 1);

        publisher.publish(&json!({"type": "hello", "n": 1}));
        publisher.publish(&json!({"type": "hello", "n": 2}));

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["type"], "hello");
        assert_eq!(v["n"], 1);

        line.clear();
        reader.read_line(&mut line).unwrap();
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["n"], 2);
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let publisher = SidebandPublisher::bind("test", 0).unwrap();
        publisher.publish(&json!({"type": "lonely"}));
        assert_eq!(publisher.published_count(), 1);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[test]
    fn disconnected_subscriber_is_pruned() {
        let publisher = SidebandPublisher::bind("test", 0).unwrap();
        {
            let _stream = TcpStream::connect(("127.0.0.1", publisher.port())).unwrap();
            wait_for(|| publisher.subscriber_count() == 1);
        }
        // The writer thread notices the closed socket once it tries to
        // write; after that the next publish prunes.
        wait_for(|| {
            publisher.publish(&json!({"type": "ping"}));
            thread::sleep(Duration::from_millis(5));
            publisher.publish(&json!({"type": "ping"}));
            publisher.subscriber_count() == 0
        });
    }

    #[test]
    fn slow_subscriber_loses_messages_but_publisher_never_blocks() {
        let publisher = SidebandPublisher::bind("test", 0).unwrap();
        let _stream = TcpStream::connect(("127.0.0.1", publisher.port())).unwrap();
        wait_for(|| publisher.subscriber_count() == 1);

        // Far more than the outbox and the socket buffer hold, with the
        // subscriber never reading.
        let padding = "x".repeat(1024);
        for i in 0..20_000 {
            publisher.publish(&json!({"n": i, "padding": padding}));
        }
        assert!(publisher.dropped_count() > 0);
        assert_eq!(publisher.subscriber_count(), 1);
    }
}
