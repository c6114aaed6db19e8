//! Downward synthesis-engine contract.
//!
//! The daemon never depends on a concrete model; it consumes the engine
//! through the [`Engine`] / [`EngineLoader`] traits so the heavyweight
//! implementation can be swapped (or mocked in tests). The shipped
//! [`CommandEngine`] shells out to an external synthesizer process.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use rand::seq::SliceRandom;
use thiserror::Error;

use crate::config;

/// Built-in named voice catalog.
pub const VOICES: [&str; 8] = [
    "alba", "marius", "javert", "jean", "fantine", "cosette", "eponine", "azelma",
];

/// Errors from the synthesis engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine load failed: {0}")]
    Load(String),
    #[error("synthesis failed: {0}")]
    Synthesis(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Which voice a request should be synthesized with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceSelector {
    /// A named entry from the built-in catalog.
    Named(String),
    /// Clone the voice from a reference audio file.
    CloneFrom(PathBuf),
}

impl std::fmt::Display for VoiceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoiceSelector::Named(name) => write!(f, "{}", name),
            VoiceSelector::CloneFrom(path) => write!(f, "clone:{}", path.display()),
        }
    }
}

/// Resolve the voice for one request.
///
/// Precedence: explicit request path > configured default clone path >
/// random pick from the catalog. Called at dequeue time, never earlier.
pub fn resolve_voice(request_path: Option<&Path>) -> VoiceSelector {
    if let Some(path) = request_path {
        return VoiceSelector::CloneFrom(path.to_path_buf());
    }
    if let Some(path) = config::default_voice_path() {
        return VoiceSelector::CloneFrom(path);
    }
    let name = VOICES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("alba");
    VoiceSelector::Named(name.to_string())
}

/// A loaded synthesis model.
pub trait Engine: Send {
    /// Synthesize `text` with `voice`, returning WAV bytes.
    fn synthesize(&mut self, text: &str, voice: &VoiceSelector) -> Result<Vec<u8>, EngineError>;
}

/// Factory for [`Engine`] instances; the daemon calls this lazily on the
/// first request that needs synthesis, and drops the result on idle unload.
pub trait EngineLoader: Send {
    fn load(&self) -> Result<Box<dyn Engine>, EngineError>;
}

/// Engine that delegates to an external synthesizer command.
///
/// The command line comes from `LOCAL_TTS_ENGINE_CMD`; a `{voice}` argument
/// placeholder is replaced with the voice name or clone-reference path. Text
/// goes to the child's stdin, WAV bytes come back on stdout.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Engine for CommandEngine {
    fn synthesize(&mut self, text: &str, voice: &VoiceSelector) -> Result<Vec<u8>, EngineError> {
        let voice_arg = match voice {
            VoiceSelector::Named(name) => name.clone(),
            VoiceSelector::CloneFrom(path) => path.display().to_string(),
        };
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace("{voice}", &voice_arg))
            .collect();

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::Synthesis(format!("spawn {}: {}", self.program, e)))?;

        child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Synthesis("child stdin unavailable".into()))?
            .write_all(text.as_bytes())?;

        let output = child.wait_with_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Synthesis(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(EngineError::Synthesis("engine produced no audio".into()));
        }
        Ok(output.stdout)
    }
}

/// Loader for [`CommandEngine`] configured via `LOCAL_TTS_ENGINE_CMD`.
#[derive(Debug, Clone, Default)]
pub struct CommandEngineLoader;

impl EngineLoader for CommandEngineLoader {
    fn load(&self) -> Result<Box<dyn Engine>, EngineError> {
        let cmdline = dotenvy::var("LOCAL_TTS_ENGINE_CMD")
            .map_err(|_| EngineError::Load("LOCAL_TTS_ENGINE_CMD is not set".into()))?;
        let words = shell_words::split(&cmdline)
            .map_err(|e| EngineError::Load(format!("LOCAL_TTS_ENGINE_CMD parse: {}", e)))?;
        let (program, args) = words
            .split_first()
            .ok_or_else(|| EngineError::Load("LOCAL_TTS_ENGINE_CMD is empty".into()))?;
        Ok(Box::new(CommandEngine::new(program.clone(), args.to_vec())))
    }
}

/// Split text into synthesis-sized chunks on sentence boundaries.
///
/// Sentences are packed up to `max_len` characters; an over-long sentence
/// falls back to word packing, and an over-long word is hard-split.
pub fn chunk_text(text: &str, max_len: usize) -> Vec<String> {
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for sentence in split_sentences(&text) {
        if sentence.len() <= max_len {
            push_unit(&mut chunks, &mut current, sentence, max_len);
            continue;
        }
        for word in sentence.split(' ') {
            if word.len() <= max_len {
                push_unit(&mut chunks, &mut current, word, max_len);
            } else {
                // Hard split on char boundaries, never mid-codepoint
                let mut piece = String::new();
                for ch in word.chars() {
                    if !piece.is_empty() && piece.len() + ch.len_utf8() > max_len {
                        push_unit(&mut chunks, &mut current, &piece, max_len);
                        piece.clear();
                    }
                    piece.push(ch);
                }
                if !piece.is_empty() {
                    push_unit(&mut chunks, &mut current, &piece, max_len);
                }
            }
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn push_unit(chunks: &mut Vec<String>, current: &mut String, unit: &str, max_len: usize) {
    let needed = if current.is_empty() {
        unit.len()
    } else {
        current.len() + 1 + unit.len()
    };
    if needed > max_len && !current.is_empty() {
        chunks.push(std::mem::take(current));
    }
    if !current.is_empty() {
        current.push(' ');
    }
    current.push_str(unit);
}

/// Split on sentence-ending punctuation followed by a space.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut prev_end = false;
    for (i, ch) in text.char_indices() {
        if prev_end && ch == ' ' {
            out.push(text[start..i].trim());
            start = i + 1;
        }
        prev_end = matches!(ch, '.' | '!' | '?');
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out.retain(|s| !s.is_empty());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_precedence_request_path_wins() {
        let voice = resolve_voice(Some(Path::new("/tmp/ref.wav")));
        assert_eq!(
            voice,
            VoiceSelector::CloneFrom(PathBuf::from("/tmp/ref.wav"))
        );
    }

    #[test]
    fn test_voice_fallback_is_catalog_entry() {
        // Only meaningful when no default clone source is configured
        if config::default_voice_path().is_none() {
            match resolve_voice(None) {
                VoiceSelector::Named(name) => assert!(VOICES.contains(&name.as_str())),
                VoiceSelector::CloneFrom(_) => panic!("expected catalog voice"),
            }
        }
    }

    #[test]
    fn test_chunk_short_text_is_single_chunk() {
        let chunks = chunk_text("Hello there. How are you?", 200);
        assert_eq!(chunks, vec!["Hello there. How are you?"]);
    }

    #[test]
    fn test_chunk_respects_sentence_boundaries() {
        let chunks = chunk_text("First sentence here. Second sentence here.", 25);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "First sentence here.");
        assert_eq!(chunks[1], "Second sentence here.");
    }

    #[test]
    fn test_chunk_hard_splits_long_word() {
        let word = "a".repeat(50);
        let chunks = chunk_text(&word, 20);
        assert!(chunks.iter().all(|c| c.len() <= 20));
        assert_eq!(chunks.concat().len(), 50);
    }

    #[test]
    fn test_chunk_long_multibyte_word_stays_intact() {
        let word = "好".repeat(120);
        let chunks = chunk_text(&word, 50);
        assert!(chunks.iter().all(|c| c.len() <= 50));
        assert!(chunks.iter().all(|c| !c.contains('\u{FFFD}')));
        assert_eq!(chunks.concat(), word);
    }

    #[test]
    fn test_chunk_collapses_whitespace() {
        let chunks = chunk_text("  hello    world  ", 200);
        assert_eq!(chunks, vec!["hello world"]);
    }

    #[test]
    fn test_chunk_empty_text() {
        assert!(chunk_text("   ", 200).is_empty());
    }

    #[test]
    fn test_voice_selector_display() {
        assert_eq!(VoiceSelector::Named("alba".into()).to_string(), "alba");
        assert_eq!(
            VoiceSelector::CloneFrom(PathBuf::from("/x/ref.wav")).to_string(),
            "clone:/x/ref.wav"
        );
    }
}
