//! Downward playback contract: hand a WAV file to the OS audio player.
//!
//! Behind a trait so the worker can be tested without a sound device. A
//! playback failure is request-scoped, identical to a synthesis failure.

use std::path::Path;
use std::process::Command;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("player {0} not available: {1}")]
    Spawn(String, std::io::Error),
    #[error("player {0} exited with {1}")]
    Exit(String, std::process::ExitStatus),
}

/// Plays one audio file to completion.
pub trait AudioPlayer: Send {
    fn play(&self, path: &Path) -> Result<(), PlaybackError>;
}

/// System player: `afplay` on macOS (slightly sped up), `aplay` elsewhere.
#[derive(Debug, Clone, Default)]
pub struct SystemPlayer;

impl AudioPlayer for SystemPlayer {
    fn play(&self, path: &Path) -> Result<(), PlaybackError> {
        let (program, args): (&str, Vec<String>) = if cfg!(target_os = "macos") {
            ("afplay", vec!["-r".into(), "1.2".into()])
        } else {
            ("aplay", vec!["-q".into()])
        };

        debug!(player = program, file = %path.display(), "Playing audio");
        let status = Command::new(program)
            .args(&args)
            .arg(path)
            .status()
            .map_err(|e| PlaybackError::Spawn(program.to_string(), e))?;

        if !status.success() {
            return Err(PlaybackError::Exit(program.to_string(), status));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_fails_without_panicking() {
        // Whatever the host has installed, playing a nonexistent file must
        // surface an error, not crash
        let player = SystemPlayer;
        assert!(player.play(Path::new("/nonexistent/audio.wav")).is_err());
    }
}
