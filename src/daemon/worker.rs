//! Single queue-consumer for synthesis and playback.
//!
//! Exactly one worker thread exists per daemon; it is the only code that
//! touches the engine handle. Requests are processed strictly in arrival
//! order, one at a time through synthesis and playback, so two audio
//! streams can never overlap. The worker also owns the idle-unload timer,
//! implemented as a `recv_timeout` poll: the model is dropped once no
//! request has arrived for the configured idle window.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info, warn};

use super::playback::AudioPlayer;
use super::resource::ResourceGuard;
use crate::engine::{self, Engine, EngineError, EngineLoader};

/// Longest chunk handed to the engine in one synthesis call.
const MAX_CHUNK_CHARS: usize = 200;

/// Idle-timer poll granularity.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One accepted speak request, queued for playback.
#[derive(Debug)]
pub(crate) struct QueuedRequest {
    pub order: u64,
    pub text: String,
    pub voice_path: Option<PathBuf>,
    pub enqueued_at: Instant,
}

pub(crate) struct Worker {
    rx: Receiver<QueuedRequest>,
    loader: Box<dyn EngineLoader>,
    player: Box<dyn AudioPlayer>,
    guard: ResourceGuard,
    idle_timeout: Duration,
    model_loaded: Arc<AtomicBool>,
    engine: Option<Box<dyn Engine>>,
    last_activity: Instant,
}

impl Worker {
    pub fn new(
        rx: Receiver<QueuedRequest>,
        loader: Box<dyn EngineLoader>,
        player: Box<dyn AudioPlayer>,
        guard: ResourceGuard,
        idle_timeout: Duration,
        model_loaded: Arc<AtomicBool>,
    ) -> Self {
        Self {
            rx,
            loader,
            player,
            guard,
            idle_timeout,
            model_loaded,
            engine: None,
            last_activity: Instant::now(),
        }
    }

    /// Consume the queue until every sender is gone.
    pub fn run(mut self) {
        debug!("Playback worker started");
        loop {
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(req) => {
                    self.last_activity = Instant::now();
                    self.process(req);
                    // Completion re-arms the idle timer
                    self.last_activity = Instant::now();
                }
                Err(RecvTimeoutError::Timeout) => self.maybe_unload(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.unload();
        debug!("Playback worker stopped");
    }

    fn maybe_unload(&mut self) {
        if self.engine.is_some()
            && self.rx.is_empty()
            && self.last_activity.elapsed() >= self.idle_timeout
        {
            self.unload();
        }
    }

    fn unload(&mut self) {
        if self.engine.take().is_some() {
            self.model_loaded.store(false, Ordering::SeqCst);
            info!("Unloaded model after idle period");
        }
    }

    fn ensure_loaded(&mut self) -> Result<(), EngineError> {
        if self.engine.is_some() {
            return Ok(());
        }
        if !self.guard.allow_load() {
            return Err(EngineError::Load("insufficient memory".into()));
        }
        info!("Loading synthesis model");
        let start = Instant::now();
        let engine = self.loader.load()?;
        self.engine = Some(engine);
        self.model_loaded.store(true, Ordering::SeqCst);
        info!(elapsed_ms = start.elapsed().as_millis() as u64, "Model ready");
        Ok(())
    }

    /// Run one request through synthesis and playback. Failures are logged
    /// and isolated; the queue always proceeds to the next request.
    fn process(&mut self, req: QueuedRequest) {
        let preview: String = req.text.chars().take(30).collect();
        debug!(
            order = req.order,
            queued_ms = req.enqueued_at.elapsed().as_millis() as u64,
            "Dequeued request"
        );

        if let Err(e) = self.ensure_loaded() {
            error!(order = req.order, error = %e, "Request failed: model unavailable");
            return;
        }
        // Voice precedence is resolved here, at dequeue time
        let voice = engine::resolve_voice(req.voice_path.as_deref());
        let start = Instant::now();

        let Some(model) = self.engine.as_mut() else {
            return;
        };

        // Synthesize chunk by chunk; a failed chunk is skipped, not fatal
        let mut artifacts: Vec<tempfile::NamedTempFile> = Vec::new();
        for chunk in engine::chunk_text(&req.text, MAX_CHUNK_CHARS) {
            match model.synthesize(&chunk, &voice) {
                Ok(wav) => match write_artifact(&wav) {
                    Ok(file) => artifacts.push(file),
                    Err(e) => {
                        error!(order = req.order, error = %e, "Failed to write audio artifact")
                    }
                },
                Err(e) => {
                    error!(order = req.order, error = %e, "Chunk synthesis failed");
                }
            }
        }

        if artifacts.is_empty() {
            warn!(order = req.order, text = %preview, "Request produced no audio");
            return;
        }

        for artifact in &artifacts {
            if let Err(e) = self.player.play(artifact.path()) {
                error!(order = req.order, error = %e, "Playback failed");
                break;
            }
        }
        // Artifacts are dropped here, deleting the temp files on every path

        info!(
            order = req.order,
            voice = %voice,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Spoken: '{}'",
            preview
        );
    }
}

fn write_artifact(wav: &[u8]) -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("local-tts-")
        .suffix(".wav")
        .tempfile()?;
    file.write_all(wav)?;
    file.flush()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::VoiceSelector;
    use crossbeam_channel::unbounded;
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct RecordingEngine {
        spoken: Arc<Mutex<Vec<String>>>,
    }

    impl Engine for RecordingEngine {
        fn synthesize(
            &mut self,
            text: &str,
            _voice: &VoiceSelector,
        ) -> Result<Vec<u8>, EngineError> {
            if text.contains("FAIL") {
                return Err(EngineError::Synthesis("induced failure".into()));
            }
            self.spoken.lock().push(text.to_string());
            Ok(b"RIFFfake".to_vec())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingLoader {
        engine: RecordingEngine,
        loads: Arc<Mutex<u32>>,
    }

    impl EngineLoader for RecordingLoader {
        fn load(&self) -> Result<Box<dyn Engine>, EngineError> {
            *self.loads.lock() += 1;
            Ok(Box::new(self.engine.clone()))
        }
    }

    #[derive(Clone, Default)]
    struct NullPlayer {
        played: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl AudioPlayer for NullPlayer {
        fn play(&self, path: &std::path::Path) -> Result<(), super::super::playback::PlaybackError> {
            assert!(path.exists(), "artifact must exist while playing");
            self.played.lock().push(path.to_path_buf());
            Ok(())
        }
    }

    fn spawn_worker(
        idle_timeout: Duration,
        loader: RecordingLoader,
        player: NullPlayer,
    ) -> (
        crossbeam_channel::Sender<QueuedRequest>,
        Arc<AtomicBool>,
        std::thread::JoinHandle<()>,
    ) {
        let (tx, rx) = unbounded();
        let loaded = Arc::new(AtomicBool::new(false));
        let worker = Worker::new(
            rx,
            Box::new(loader),
            Box::new(player),
            ResourceGuard::new(1.0, 1.0),
            idle_timeout,
            loaded.clone(),
        );
        let handle = std::thread::spawn(move || worker.run());
        (tx, loaded, handle)
    }

    fn request(order: u64, text: &str) -> QueuedRequest {
        QueuedRequest {
            order,
            text: text.to_string(),
            voice_path: None,
            enqueued_at: Instant::now(),
        }
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_fifo_processing_and_cleanup() {
        let loader = RecordingLoader::default();
        let player = NullPlayer::default();
        let spoken = loader.engine.spoken.clone();
        let played = player.played.clone();

        let (tx, _loaded, handle) = spawn_worker(Duration::from_secs(60), loader, player);
        for i in 0..5 {
            tx.send(request(i, &format!("message {}", i))).unwrap();
        }
        assert!(wait_until(Duration::from_secs(5), || spoken.lock().len() == 5));
        assert_eq!(
            *spoken.lock(),
            (0..5).map(|i| format!("message {}", i)).collect::<Vec<_>>()
        );

        // All temp artifacts removed after completion
        assert!(wait_until(Duration::from_secs(5), || played.lock().len() == 5));
        for path in played.lock().iter() {
            assert!(!path.exists(), "artifact should be deleted: {:?}", path);
        }

        drop(tx);
        handle.join().unwrap();
    }

    #[test]
    fn test_idle_unload_and_reload() {
        let loader = RecordingLoader::default();
        let loads = loader.loads.clone();
        let player = NullPlayer::default();
        let played = player.played.clone();

        let (tx, loaded, handle) = spawn_worker(Duration::from_millis(400), loader, player);

        tx.send(request(0, "first")).unwrap();
        assert!(wait_until(Duration::from_secs(5), || loaded
            .load(Ordering::SeqCst)));

        // Model should drop after the idle window with no new requests
        assert!(wait_until(Duration::from_secs(5), || !loaded
            .load(Ordering::SeqCst)));
        assert_eq!(*loads.lock(), 1);

        // Next request triggers a fresh load
        tx.send(request(1, "second")).unwrap();
        assert!(wait_until(Duration::from_secs(5), || played.lock().len() == 2));
        assert_eq!(*loads.lock(), 2);

        drop(tx);
        handle.join().unwrap();
    }

    #[test]
    fn test_failed_request_does_not_stop_queue() {
        let loader = RecordingLoader::default();
        let player = NullPlayer::default();
        let spoken = loader.engine.spoken.clone();
        let played = player.played.clone();

        let (tx, _loaded, handle) = spawn_worker(Duration::from_secs(60), loader, player);
        tx.send(request(0, "before")).unwrap();
        tx.send(request(1, "FAIL now")).unwrap();
        tx.send(request(2, "after")).unwrap();

        assert!(wait_until(Duration::from_secs(5), || played.lock().len() == 2));
        assert_eq!(*spoken.lock(), vec!["before", "after"]);

        drop(tx);
        handle.join().unwrap();
    }

    #[test]
    fn test_load_blocked_by_memory_guard() {
        let loader = RecordingLoader::default();
        let loads = loader.loads.clone();
        let (tx, rx) = unbounded();
        let loaded = Arc::new(AtomicBool::new(false));
        // Zero thresholds: every load attempt is refused
        let worker = Worker::new(
            rx,
            Box::new(loader),
            Box::new(NullPlayer::default()),
            ResourceGuard::new(0.0, 0.0),
            Duration::from_secs(60),
            loaded.clone(),
        );
        let handle = std::thread::spawn(move || worker.run());

        tx.send(request(0, "blocked")).unwrap();
        drop(tx);
        handle.join().unwrap();

        #[cfg(target_os = "linux")]
        {
            assert_eq!(*loads.lock(), 0);
            assert!(!loaded.load(Ordering::SeqCst));
        }
        #[cfg(not(target_os = "linux"))]
        let _ = loads;
    }
}
