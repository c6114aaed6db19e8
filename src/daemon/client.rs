//! Client for the singleton TTS daemon.
//!
//! Connects to the well-known socket; if nothing answers and auto-spawn is
//! enabled, launches the daemon as a detached process and polls for the
//! endpoint with bounded, capped backoff. Several clients may race to
//! spawn — the singleton lock inside the daemon picks the winner, and the
//! losers' daemons exit cleanly, so spawning here is best-effort.
//!
//! The client returns as soon as the queuing ack arrives; it never waits
//! for synthesis or playback.

use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use super::protocol::{
    AckStatus, FramedMessage, PROTOCOL_VERSION, Request, Response, SpeakAck, StatusResponse,
    decode_message, read_frame, write_frame,
};
use crate::config::ClientConfig;

/// Client-side errors, mapped from transport and daemon failures.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Request invalid before any transport was attempted.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Could not reach or spawn a daemon within the retry budget.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    /// The daemon did not answer in time.
    #[error("request timed out: {0}")]
    Timeout(String),
    /// The daemon answered with an error.
    #[error("daemon error: {0}")]
    Daemon(String),
    /// Unexpected or incompatible wire traffic.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Per-caller client for the daemon socket. One connection per request;
/// the daemon holds no long-lived client connections.
pub struct SpeakClient {
    config: ClientConfig,
    request_counter: AtomicU64,
}

impl SpeakClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            request_counter: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ClientConfig::from_env())
    }

    /// Queue text for synthesis and playback. Returns once the daemon has
    /// acknowledged the request as enqueued (or rejected it).
    pub fn speak(&self, text: &str, voice_path: Option<&Path>) -> Result<SpeakAck, ClientError> {
        // Cheap local validation: an empty request never needs a daemon
        if text.trim().is_empty() {
            return Err(ClientError::InvalidRequest("empty text".to_string()));
        }

        let request = Request::Speak {
            text: text.to_string(),
            voice_path: voice_path.map(|p| p.display().to_string()),
        };
        match self.send_request(request)? {
            Response::Ack(ack) => Ok(ack),
            other => Err(ClientError::Protocol(format!(
                "unexpected response: {:?}",
                other
            ))),
        }
    }

    /// Fetch daemon status.
    pub fn status(&self) -> Result<StatusResponse, ClientError> {
        match self.send_request(Request::Status)? {
            Response::Status(status) => Ok(status),
            other => Err(ClientError::Protocol(format!(
                "unexpected response: {:?}",
                other
            ))),
        }
    }

    /// Ask the daemon to shut down gracefully.
    pub fn shutdown(&self) -> Result<(), ClientError> {
        match self.send_request(Request::Shutdown)? {
            Response::Shutdown { .. } => Ok(()),
            other => Err(ClientError::Protocol(format!(
                "unexpected response: {:?}",
                other
            ))),
        }
    }

    /// Whether a daemon currently answers on the socket.
    pub fn is_running(&self) -> bool {
        self.try_connect().is_ok()
    }

    fn try_connect(&self) -> std::io::Result<UnixStream> {
        let stream = UnixStream::connect(&self.config.socket_path)?;
        stream.set_read_timeout(Some(self.config.request_timeout))?;
        stream.set_write_timeout(Some(self.config.request_timeout))?;
        Ok(stream)
    }

    /// Connect, spawning the daemon and polling with capped backoff if the
    /// endpoint is absent. The retry budget is bounded; exhausting it is
    /// `ServiceUnavailable`.
    fn connect_or_spawn(&self) -> Result<UnixStream, ClientError> {
        if let Ok(stream) = self.try_connect() {
            return Ok(stream);
        }

        if !self.config.auto_spawn {
            return Err(ClientError::ServiceUnavailable(format!(
                "daemon not running at {}",
                self.config.socket_path.display()
            )));
        }

        info!("Daemon not running, attempting to spawn");
        self.spawn_daemon()?;

        for attempt in 0..self.config.spawn_attempts {
            std::thread::sleep(Duration::from_millis(100 * (attempt as u64 + 1)));
            if let Ok(stream) = self.try_connect() {
                debug!(attempts = attempt + 1, "Connected to newly spawned daemon");
                return Ok(stream);
            }
        }

        Err(ClientError::ServiceUnavailable(
            "daemon failed to start within retry budget".to_string(),
        ))
    }

    /// Launch the daemon as a detached background process. Best-effort: if
    /// another client's daemon wins the singleton lock, ours exits cleanly.
    fn spawn_daemon(&self) -> Result<(), ClientError> {
        let binary = self
            .config
            .daemon_binary
            .clone()
            .or_else(|| std::env::current_exe().ok())
            .ok_or_else(|| {
                ClientError::ServiceUnavailable("cannot determine daemon binary path".to_string())
            })?;

        let result = Command::new(&binary)
            .arg("daemon")
            .arg("--socket")
            .arg(&self.config.socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // Own process group: a terminal signal aimed at the caller
            // must not take the daemon down with it
            .process_group(0)
            .spawn();

        match result {
            Ok(child) => {
                info!(
                    pid = child.id(),
                    binary = %binary.display(),
                    socket = %self.config.socket_path.display(),
                    "Spawned daemon process"
                );
                Ok(())
            }
            Err(e) => Err(ClientError::ServiceUnavailable(format!(
                "failed to spawn daemon: {}",
                e
            ))),
        }
    }

    fn send_request(&self, request: Request) -> Result<Response, ClientError> {
        let request_id = format!(
            "ltts-{}-{}",
            std::process::id(),
            self.request_counter.fetch_add(1, Ordering::Relaxed)
        );
        let msg = FramedMessage::new(&request_id, request);

        let mut stream = self.connect_or_spawn()?;

        write_frame(&mut stream, &msg).map_err(map_io_error)?;

        let payload = read_frame(&mut stream)
            .map_err(map_io_error)?
            .ok_or_else(|| {
                ClientError::ServiceUnavailable("connection closed before response".to_string())
            })?;

        let response: FramedMessage<Response> = decode_message(&payload)
            .map_err(|e| ClientError::Protocol(format!("failed to decode response: {}", e)))?;

        if response.version != PROTOCOL_VERSION {
            return Err(ClientError::Protocol(format!(
                "protocol version mismatch: expected {}, got {}",
                PROTOCOL_VERSION, response.version
            )));
        }

        match response.payload {
            Response::Error(err) => Err(ClientError::Daemon(err.message)),
            other => Ok(other),
        }
    }
}

fn map_io_error(e: std::io::Error) -> ClientError {
    if e.kind() == std::io::ErrorKind::TimedOut || e.kind() == std::io::ErrorKind::WouldBlock {
        ClientError::Timeout(e.to_string())
    } else {
        // Mid-exchange transport failures read as "service unavailable";
        // the caller may retry through the discover/spawn path
        ClientError::ServiceUnavailable(e.to_string())
    }
}

/// Upward tool contract: always a short human-readable line, never a raw
/// error payload.
pub fn speak_tool(client: &SpeakClient, text: &str, voice_path: Option<&Path>) -> String {
    match client.speak(text, voice_path) {
        Ok(ack) => match ack.status {
            AckStatus::Accepted => "Audio queued for playback.".to_string(),
            AckStatus::Rejected => format!(
                "Speech request rejected: {}",
                ack.reason.unwrap_or_else(|| "unknown reason".to_string())
            ),
        },
        Err(e) => format!("Error: {}", e),
    }
}
