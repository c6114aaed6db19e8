//! The singleton inference daemon.
//!
//! Exactly one daemon runs per runtime dir, enforced by the singleton lock.
//! The daemon binds the well-known Unix socket, accepts connections
//! concurrently (one reader thread per connection, so a slow sender never
//! delays a faster one), validates and enqueues speak requests, and answers
//! each with a queuing acknowledgment. Synthesis and playback happen on the
//! single worker thread, strictly in arrival order.

use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::lock::{self, LockState};
use super::playback::AudioPlayer;
use super::protocol::{
    ErrorCode, ErrorResponse, FramedMessage, PROTOCOL_VERSION, Request, Response, SpeakAck,
    StatusResponse, decode_message, read_frame, write_frame,
};
use super::resource::ResourceGuard;
use super::worker::{QueuedRequest, Worker};
use crate::config::ServiceConfig;
use crate::engine::EngineLoader;

/// Arrival-order assignment and enqueue, fused under one mutex so the queue
/// order always matches the assigned order even with racing connections.
struct EnqueueSlot {
    next_order: u64,
    tx: Sender<QueuedRequest>,
}

/// Shared daemon state, referenced by every connection thread.
pub struct TtsDaemon {
    config: ServiceConfig,
    guard: ResourceGuard,
    enqueue: Mutex<EnqueueSlot>,
    queue_tx: Sender<QueuedRequest>,
    model_loaded: Arc<AtomicBool>,
    start_time: Instant,
    total_requests: AtomicU64,
    shutdown: AtomicBool,
}

/// Run the daemon until a shutdown request arrives.
///
/// Observing a live peer is success, not an error: the caller's goal (a
/// running daemon) is already satisfied, so losing spawners exit cleanly.
/// A bind failure after winning the lock is fatal; returning the error
/// drops the lock guard so future clients are not wedged.
pub fn run_daemon(
    config: ServiceConfig,
    loader: Box<dyn EngineLoader>,
    player: Box<dyn AudioPlayer>,
) -> anyhow::Result<()> {
    let _lock = match lock::acquire_or_detect_live(&config.lock_path)? {
        LockState::AcquiredAsOwner(guard) => guard,
        LockState::LiveElsewhere { pid } => {
            info!(pid, "Daemon already running, exiting");
            return Ok(());
        }
    };

    let guard = ResourceGuard::new(config.memory_threshold, config.critical_threshold);
    guard.apply_nice(config.nice_value);

    // We own the lock, so any leftover socket file is stale
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create runtime dir {}", parent.display()))?;
    }
    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)
            .with_context(|| format!("remove stale socket {}", config.socket_path.display()))?;
    }
    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("bind {}", config.socket_path.display()))?;
    listener.set_nonblocking(true)?;

    let (tx, rx) = crossbeam_channel::unbounded();
    let model_loaded = Arc::new(AtomicBool::new(false));
    let worker = Worker::new(
        rx,
        loader,
        player,
        guard.clone(),
        config.idle_timeout,
        model_loaded.clone(),
    );
    let worker_handle = std::thread::spawn(move || worker.run());

    let daemon = Arc::new(TtsDaemon {
        guard,
        enqueue: Mutex::new(EnqueueSlot {
            next_order: 0,
            tx: tx.clone(),
        }),
        queue_tx: tx,
        model_loaded,
        start_time: Instant::now(),
        total_requests: AtomicU64::new(0),
        shutdown: AtomicBool::new(false),
        config,
    });

    info!(
        socket = %daemon.config.socket_path.display(),
        idle_secs = daemon.config.idle_timeout.as_secs(),
        "Daemon listening"
    );

    loop {
        if daemon.shutdown.load(Ordering::SeqCst) {
            info!("Shutdown requested, stopping daemon");
            break;
        }

        match listener.accept() {
            Ok((stream, _addr)) => {
                let daemon = Arc::clone(&daemon);
                std::thread::spawn(move || {
                    if let Err(e) = daemon.handle_connection(stream) {
                        debug!(error = %e, "Connection error");
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                error!(error = %e, "Accept error");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    if let Err(e) = std::fs::remove_file(&daemon.config.socket_path) {
        debug!(error = %e, "Socket cleanup failed");
    }

    // Dropping our handle (connection threads are short-lived) disconnects
    // the queue, letting the worker drain and exit
    drop(daemon);
    if worker_handle.join().is_err() {
        warn!("Worker thread panicked");
    }

    info!("Daemon stopped");
    Ok(())
}

/// `UnixStream::peek` for stable Rust: `recv` with `MSG_PEEK`, honoring the
/// stream's read timeout like the std method would.
fn peek(stream: &UnixStream, buf: &mut [u8]) -> std::io::Result<usize> {
    use std::os::unix::io::AsRawFd;
    let n = unsafe {
        libc::recv(
            stream.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_PEEK,
        )
    };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

impl TtsDaemon {
    /// Handle one client connection: frames are answered in order until EOF.
    ///
    /// Between frames the stream is only peeked, in short slices, so an idle
    /// connection notices a daemon shutdown promptly instead of pinning its
    /// thread for the whole request timeout. Once a frame starts arriving it
    /// is read with the full timeout, never cut off mid-frame.
    fn handle_connection(&self, mut stream: UnixStream) -> std::io::Result<()> {
        const READ_POLL: Duration = Duration::from_millis(200);

        stream.set_write_timeout(Some(self.config.request_timeout))?;

        let mut idle = Duration::ZERO;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                debug!("Dropping connection, daemon shutting down");
                return Ok(());
            }

            stream.set_read_timeout(Some(READ_POLL))?;
            let mut first = [0u8; 1];
            match peek(&stream, &mut first) {
                Ok(0) => {
                    debug!("Client disconnected");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    idle += READ_POLL;
                    if idle >= self.config.request_timeout {
                        debug!("Connection timed out");
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }
            idle = Duration::ZERO;

            stream.set_read_timeout(Some(self.config.request_timeout))?;
            let payload = match read_frame(&mut stream) {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    debug!("Client disconnected");
                    return Ok(());
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    debug!("Connection timed out");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let response = match decode_message::<Request>(&payload) {
                Ok(msg) if msg.version != PROTOCOL_VERSION => FramedMessage::new(
                    msg.request_id,
                    Response::Error(ErrorResponse {
                        code: ErrorCode::VersionMismatch,
                        message: format!(
                            "expected protocol {}, got {}",
                            PROTOCOL_VERSION, msg.version
                        ),
                    }),
                ),
                Ok(msg) => {
                    let response = self.handle_request(&msg.request_id, msg.payload);
                    FramedMessage::new(msg.request_id, response)
                }
                Err(e) => {
                    warn!(error = %e, "Failed to decode request");
                    FramedMessage::new(
                        "error",
                        Response::Error(ErrorResponse {
                            code: ErrorCode::InvalidRequest,
                            message: e.to_string(),
                        }),
                    )
                }
            };

            write_frame(&mut stream, &response)?;

            if matches!(response.payload, Response::Shutdown { .. }) {
                return Ok(());
            }
        }
    }

    fn handle_request(&self, request_id: &str, request: Request) -> Response {
        match request {
            Request::Speak { text, voice_path } => {
                Response::Ack(self.enqueue_speak(request_id, text, voice_path))
            }

            Request::Status => {
                let snap = self.guard.snapshot();
                Response::Status(StatusResponse {
                    uptime_secs: self.start_time.elapsed().as_secs(),
                    version: PROTOCOL_VERSION,
                    model_loaded: self.model_loaded.load(Ordering::SeqCst),
                    queue_depth: self.queue_tx.len(),
                    used_memory_fraction: snap.used_memory_fraction,
                    rss_bytes: self.guard.rss_bytes(),
                    total_requests: self.total_requests.load(Ordering::Relaxed),
                })
            }

            Request::Shutdown => {
                info!(request_id, "Shutdown requested");
                self.shutdown.store(true, Ordering::SeqCst);
                Response::Shutdown {
                    message: "daemon shutting down".to_string(),
                }
            }
        }
    }

    /// Validate and enqueue one speak request, returning its queuing ack.
    fn enqueue_speak(
        &self,
        request_id: &str,
        text: String,
        voice_path: Option<String>,
    ) -> SpeakAck {
        if let Err(reason) = validate_speak(&text, voice_path.as_deref()) {
            debug!(request_id, reason = %reason, "Rejected speak request");
            return SpeakAck::rejected(reason);
        }
        if !self.guard.allow_enqueue() {
            return SpeakAck::rejected("overloaded");
        }

        // Hold the slot across assignment and send so arrival order and
        // queue order can never diverge
        let mut slot = self.enqueue.lock();
        let order = slot.next_order;
        let accepted = slot
            .tx
            .send(QueuedRequest {
                order,
                text,
                voice_path: voice_path.map(Into::into),
                enqueued_at: Instant::now(),
            })
            .is_ok();
        if !accepted {
            // Worker is gone; daemon is shutting down
            return SpeakAck::rejected("service shutting down");
        }
        slot.next_order += 1;
        drop(slot);

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        debug!(request_id, order, "Enqueued speak request");
        SpeakAck::accepted(order)
    }
}

/// Request validation: non-empty text, readable voice reference.
/// The voice path is checked here on the daemon's filesystem view, not by
/// the client, to avoid validating a path the daemon can no longer see.
fn validate_speak(text: &str, voice_path: Option<&str>) -> Result<(), String> {
    if text.trim().is_empty() {
        return Err("empty text".to_string());
    }
    if let Some(path) = voice_path {
        let file = std::path::Path::new(path);
        // is_file rules out directories, open rules out permission problems
        if !file.is_file() || std::fs::File::open(file).is_err() {
            return Err(format!("voice path not readable: {}", path));
        }
    }
    Ok(())
}
