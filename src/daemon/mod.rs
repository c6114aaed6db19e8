//! Singleton TTS daemon: lifecycle, protocol, queue, and client.
//!
//! Many independent caller processes share one heavyweight synthesis model
//! by routing requests to a single background daemon over a Unix Domain
//! Socket. First-come spawns the daemon, others connect; the singleton
//! lock guarantees at most one daemon per runtime dir no matter how many
//! clients race to spawn it.
//!
//! ```text
//!  caller A ──┐                         ┌─> engine (load/unload on idle)
//!  caller B ──┼─> client ─> UDS ─> daemon ─> FIFO queue ─> playback
//!  caller C ──┘   (spawn-if-absent)        (one request at a time)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use local_tts::daemon::{client::SpeakClient, core::run_daemon};
//!
//! // Client usage (auto-spawns the daemon if not running)
//! let client = SpeakClient::with_defaults();
//! let ack = client.speak("hello world", None)?;
//!
//! // Server usage (for the daemon subprocess)
//! run_daemon(config, loader, player)?;
//! ```

pub mod client;
pub mod core;
pub mod lock;
pub mod playback;
pub mod protocol;
pub mod resource;
mod worker;

// Re-export key types for convenience
pub use client::{ClientError, SpeakClient, speak_tool};
pub use core::run_daemon;
pub use lock::{LockState, acquire_or_detect_live};
pub use playback::{AudioPlayer, SystemPlayer};
pub use protocol::{AckStatus, PROTOCOL_VERSION, Request, Response, SpeakAck};
pub use resource::{ResourceGuard, ResourceSnapshot};
