//! Runtime paths and environment-driven configuration.
//!
//! Every client process and the daemon must agree on the socket and lock
//! locations, so both are derived from a single well-known runtime directory.
//! Everything else is tunable through `LOCAL_TTS_*` environment variables,
//! read once at startup.

use std::path::PathBuf;
use std::time::Duration;

/// Well-known per-user runtime directory shared by clients and the daemon.
pub fn runtime_dir() -> PathBuf {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".into());
    // Sanitize: keep only alphanumeric, dash, underscore to prevent path traversal
    let safe_user: String = user
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .take(64)
        .collect();
    let safe_user = if safe_user.is_empty() {
        "unknown".to_string()
    } else {
        safe_user
    };
    std::env::temp_dir().join(format!("local-tts-mcp-{}", safe_user))
}

/// Default path of the daemon's listening socket.
pub fn default_socket_path() -> PathBuf {
    runtime_dir().join("inference.sock")
}

/// Default path of the singleton lock marker.
pub fn default_lock_path() -> PathBuf {
    runtime_dir().join("inference.lock")
}

/// Default voice-clone reference file, if configured and readable.
///
/// Re-read on every call rather than cached: voice precedence is evaluated
/// at dequeue time, so a change between enqueue and dequeue is honored.
pub fn default_voice_path() -> Option<PathBuf> {
    let path = PathBuf::from(dotenvy::var("LOCAL_TTS_VOICE_PATH").ok()?);
    path.is_file().then_some(path)
}

/// Configuration for the daemon.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Path to the Unix socket.
    pub socket_path: PathBuf,
    /// Path to the singleton lock marker.
    pub lock_path: PathBuf,
    /// Per-connection read/write timeout.
    pub request_timeout: Duration,
    /// Unload the model after this long with no requests.
    pub idle_timeout: Duration,
    /// Used-memory fraction above which model loads are refused.
    pub memory_threshold: f64,
    /// Used-memory fraction above which new enqueues are rejected.
    pub critical_threshold: f64,
    /// Nice value applied at daemon startup.
    pub nice_value: i32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            lock_path: default_lock_path(),
            request_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            memory_threshold: 0.85,
            critical_threshold: 0.95,
            nice_value: 10,
        }
    }
}

impl ServiceConfig {
    /// Load config from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(path) = dotenvy::var("LOCAL_TTS_SOCKET") {
            cfg.socket_path = PathBuf::from(path);
        }

        if let Ok(path) = dotenvy::var("LOCAL_TTS_LOCK") {
            cfg.lock_path = PathBuf::from(path);
        }

        if let Ok(val) = dotenvy::var("LOCAL_TTS_REQUEST_TIMEOUT_SECS")
            && let Ok(secs) = val.parse()
        {
            cfg.request_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = dotenvy::var("LOCAL_TTS_IDLE_TIMEOUT_SECS")
            && let Ok(secs) = val.parse()
        {
            cfg.idle_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = dotenvy::var("LOCAL_TTS_MEMORY_THRESHOLD")
            && let Ok(frac) = val.parse()
        {
            cfg.memory_threshold = frac;
        }

        if let Ok(val) = dotenvy::var("LOCAL_TTS_CRITICAL_THRESHOLD")
            && let Ok(frac) = val.parse()
        {
            cfg.critical_threshold = frac;
        }

        if let Ok(val) = dotenvy::var("LOCAL_TTS_NICE")
            && let Ok(n) = val.parse()
        {
            cfg.nice_value = n;
        }

        cfg
    }
}

/// Configuration for the client side.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path to the Unix socket.
    pub socket_path: PathBuf,
    /// Request timeout (covers the SpeakAck round trip).
    pub request_timeout: Duration,
    /// Whether to spawn the daemon if no socket answers.
    pub auto_spawn: bool,
    /// Daemon binary override; defaults to the current executable.
    pub daemon_binary: Option<PathBuf>,
    /// Spawn-retry attempts before giving up.
    pub spawn_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            request_timeout: Duration::from_secs(30),
            auto_spawn: true,
            daemon_binary: None,
            spawn_attempts: 10,
        }
    }
}

impl ClientConfig {
    /// Load config from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(path) = dotenvy::var("LOCAL_TTS_SOCKET") {
            cfg.socket_path = PathBuf::from(path);
        }

        if let Ok(val) = dotenvy::var("LOCAL_TTS_REQUEST_TIMEOUT_SECS")
            && let Ok(secs) = val.parse()
        {
            cfg.request_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = dotenvy::var("LOCAL_TTS_AUTO_SPAWN") {
            cfg.auto_spawn = val.eq_ignore_ascii_case("true") || val == "1";
        }

        if let Ok(path) = dotenvy::var("LOCAL_TTS_DAEMON_BINARY") {
            cfg.daemon_binary = Some(PathBuf::from(path));
        }

        cfg
    }
}
