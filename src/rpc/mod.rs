//! Symmetric synchronous RPC channel (component A).
//!
//! One [`Channel`] type is used for both the forward channel (host → guest
//! routine calls) and the reverse channel (guest → host callback
//! invocations): either side can issue a [`Channel::call`] and either side
//! can receive one, dispatched to whatever `Handler` was installed. A single
//! bidirectional type fits better than separate client/server bindings here,
//! because unlike MS-RPC, a call in this protocol has no privileged
//! direction — a callback invocation *is* a call, just issued by the peer
//! that is usually the callee.
//!
//! A background reader thread owns the socket's read half and demultiplexes
//! incoming frames: a `Response` is routed to the `call()` that is blocked
//! waiting for it; a `Request` is handed to a freshly spawned worker thread
//! so that handling it (which may itself issue a nested `call()` back over
//! this same channel — the re-entrant callback case) never blocks the
//! reader loop.

pub mod wire;

use std::collections::HashMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::BridgeError;
use wire::Envelope;

/// Handles an inbound request, returning the reply body. Invoked on its own
/// worker thread; may call back into the channel it was dispatched from.
pub type Handler = Arc<dyn Fn(&str, Vec<u8>) -> Vec<u8> + Send + Sync>;

struct Shared {
    writer: Mutex<TcpStream>,
    pending: Mutex<HashMap<u64, mpsc::Sender<Vec<u8>>>>,
    next_id: AtomicU64,
}

/// A bidirectional request/reply channel over a single TCP stream.
pub struct Channel {
    shared: Arc<Shared>,
    reader: Option<thread::JoinHandle<()>>,
}

impl Channel {
    /// Connects to `addr`, retrying roughly every 10ms until `timeout`
    /// elapses, matching the guest launcher's startup handshake poll.
    pub fn connect_with_timeout<A: ToSocketAddrs + Clone>(
        addr: A,
        timeout: Duration,
        handler: Handler,
    ) -> Result<Self, BridgeError> {
        let deadline = Instant::now() + timeout;
        loop {
            match TcpStream::connect(addr.clone()) {
                Ok(stream) => return Ok(Self::from_stream(stream, handler)),
                Err(err) => {
                    if Instant::now() >= deadline {
                        tracing::debug!(error = %err, "connect_with_timeout giving up");
                        return Err(BridgeError::TransportTimeout {
                            method: "connect".to_string(),
                            elapsed_ms: timeout.as_millis() as u64,
                        });
                    }
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    /// Wraps an already-connected stream (e.g. one accepted by a listener)
    /// and starts the reader thread.
    pub fn from_stream(stream: TcpStream, handler: Handler) -> Self {
        let writer_half = stream.try_clone().expect("tcp stream clone");
        let shared = Arc::new(Shared {
            writer: Mutex::new(writer_half),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        });

        let reader_shared = shared.clone();
        let mut reader_stream = stream;
        let reader = thread::spawn(move || {
            loop {
                let envelope = match wire::read_frame(&mut reader_stream) {
                    Ok(e) => e,
                    Err(_) => break,
                };
                match envelope {
                    Envelope::Response { id, body } => {
                        if let Some(tx) = reader_shared.pending.lock().expect("pending lock poisoned").remove(&id) {
                            let _ = tx.send(body);
                        }
                    }
                    Envelope::Request { id, method, body } => {
                        let worker_shared = reader_shared.clone();
                        let handler = handler.clone();
                        thread::spawn(move || {
                            let reply_body = handler(&method, body);
                            let mut writer = worker_shared.writer.lock().expect("writer lock poisoned");
                            let _ = wire::write_frame(&mut *writer, &Envelope::Response { id, body: reply_body });
                        });
                    }
                }
            }
            // Stream closed: wake every call() still waiting for a reply.
            reader_shared.pending.lock().expect("pending lock poisoned").clear();
        });

        Self { shared, reader: Some(reader) }
    }

    /// Issues a call and blocks for the reply, up to `timeout`.
    pub fn call(&self, method: &str, body: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, BridgeError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        self.shared.pending.lock().expect("pending lock poisoned").insert(id, tx);

        {
            let mut writer = self.shared.writer.lock().expect("writer lock poisoned");
            if let Err(err) = wire::write_frame(
                &mut *writer,
                &Envelope::Request { id, method: method.to_string(), body },
            ) {
                self.shared.pending.lock().expect("pending lock poisoned").remove(&id);
                return Err(err);
            }
        }

        match rx.recv_timeout(timeout) {
            Ok(body) => Ok(body),
            Err(RecvTimeoutError::Disconnected) => Err(BridgeError::TransportClosed),
            Err(RecvTimeoutError::Timeout) => {
                self.shared.pending.lock().expect("pending lock poisoned").remove(&id);
                Err(BridgeError::TransportTimeout {
                    method: method.to_string(),
                    elapsed_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // The reader thread exits on its own once the peer closes the
        // socket or a read fails; detach rather than block the caller
        // joining it.
        self.reader.take();
    }
}
