//! One playback pass on a dedicated decode thread.
//!
//! `start()` hands the decoder to a named thread, which opens and starts the sink (CPAL
//! streams must live on the thread that drives them) and reports back before decoding.
//! When the decode loop returns, the thread tears the sink down and fires the completion
//! callback. Teardown runs once no matter how many `stop()` calls race with it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;

use crate::config::PlayerConfig;
use crate::decode::{Decoder, DecoderHandle, RunOutcome};
use crate::device::DeviceOpener;
use crate::error::{PlayerError, Result};
use crate::format::{PlaybackState, SharedParameters};
use crate::sink::{OutputSink, SinkKind};

/// Called once when a session ends, with `Ok` for end of stream or stop.
pub type CompletionCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

const DECODE_THREAD_NAME: &str = "stretch-player-decode";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything the decode thread needs, held until `start()`.
struct Pending {
    decoder: Decoder,
    opener: Arc<dyn DeviceOpener>,
    config: PlayerConfig,
}

struct SessionInner {
    kind: SinkKind,
    handle: DecoderHandle,
    params: Arc<SharedParameters>,
    pending: Mutex<Option<Pending>>,
    completion: Mutex<Option<CompletionCallback>>,
    started: AtomicBool,
    torn_down: AtomicBool,
}

impl SessionInner {
    /// Mark the session finished and fire the completion callback, once.
    fn complete(&self, result: Result<()>) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        match &result {
            Ok(()) => tracing::info!("session finished"),
            Err(e) => tracing::warn!("session finished with error: {e}"),
        }
        let callback = lock(&self.completion).take();
        if let Some(callback) = callback {
            callback(result);
        }
    }

    /// Finish without notifying; used when `start()` itself reports the failure.
    fn abandon(&self) {
        self.torn_down.store(true, Ordering::Release);
        lock(&self.completion).take();
    }

    fn run(&self, pending: Pending, ready: Sender<Result<()>>) {
        let Pending {
            mut decoder,
            opener,
            config,
        } = pending;
        let format = decoder.format();

        let opened = OutputSink::open(self.kind, format, opener.as_ref(), self.params.clone(), &config)
            .and_then(|mut sink| sink.start().map(|()| sink));
        let mut sink = match opened {
            Ok(sink) => sink,
            Err(e) => {
                tracing::error!("failed to open output: {e}");
                decoder.handle().stop();
                self.abandon();
                let _ = ready.send(Err(e));
                return;
            }
        };

        let wanted = sink.min_buffer_samples().max(decoder.buffer_size());
        if wanted != decoder.buffer_size() {
            match decoder.set_buffer_size(wanted) {
                Ok(()) => tracing::debug!(samples = wanted, "decoder buffer matched to sink"),
                Err(e) => tracing::debug!("keeping decoder buffer size: {e}"),
            }
        }
        let _ = ready.send(Ok(()));

        let outcome = decoder.run(&mut sink);
        let teardown = match outcome {
            Ok(RunOutcome::EndOfStream) => sink.finish(),
            _ => Ok(()),
        };
        if !sink.is_stopped()
            && let Err(e) = sink.stop()
        {
            tracing::warn!("sink stop failed: {e}");
        }

        let result = match outcome {
            Ok(_) => teardown,
            Err(e) => Err(e),
        };
        self.complete(result);
    }
}

/// A single decode pass bound to one decoder and one sink kind.
///
/// States run `Idle → Playing → {Paused ⇄ Playing} → Stopped`; a stopped session can't be
/// restarted.
pub struct PlaybackSession {
    inner: Arc<SessionInner>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackSession {
    pub fn new(
        decoder: Decoder,
        kind: SinkKind,
        opener: Arc<dyn DeviceOpener>,
        config: PlayerConfig,
        on_stopped: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Self {
        let handle = decoder.handle();
        Self {
            inner: Arc::new(SessionInner {
                kind,
                handle,
                params: Arc::new(SharedParameters::default()),
                pending: Mutex::new(Some(Pending {
                    decoder,
                    opener,
                    config,
                })),
                completion: Mutex::new(Some(Box::new(on_stopped))),
                started: AtomicBool::new(false),
                torn_down: AtomicBool::new(false),
            }),
            join: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> SinkKind {
        self.inner.kind
    }

    /// Launch the decode thread and wait until the sink is playing.
    ///
    /// If the sink can't be opened the error is returned here and the completion callback
    /// is never invoked.
    pub fn start(&self) -> Result<()> {
        let pending = lock(&self.inner.pending)
            .take()
            .ok_or_else(|| PlayerError::invalid_state("session already started or stopped"))?;
        self.inner.started.store(true, Ordering::Release);

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name(DECODE_THREAD_NAME.to_string())
            .spawn(move || inner.run(pending, ready_tx));
        let join = match spawned {
            Ok(join) => join,
            Err(e) => {
                self.inner.abandon();
                return Err(PlayerError::Io(e));
            }
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *lock(&self.join) = Some(join);
                tracing::info!(kind = ?self.inner.kind, "session started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => {
                let _ = join.join();
                self.inner.abandon();
                Err(PlayerError::InvariantViolation(
                    "decode thread exited before reporting readiness".to_string(),
                ))
            }
        }
    }

    /// Suspend decoding. No-op unless playing.
    pub fn pause(&self) {
        if self.state() == PlaybackState::Playing {
            self.inner.handle.pause();
        }
    }

    /// Continue decoding. No-op unless paused.
    pub fn resume(&self) {
        if self.state() == PlaybackState::Paused {
            self.inner.handle.resume();
        }
    }

    /// Request the end of the session. Idempotent; resources are released asynchronously
    /// by the decode thread.
    pub fn stop(&self) {
        let pending = lock(&self.inner.pending).take();
        if let Some(pending) = pending {
            pending.decoder.handle().stop();
            drop(pending);
            tracing::info!("session stopped before start");
            self.inner.complete(Ok(()));
            return;
        }
        self.inner.handle.stop();
    }

    pub fn set_speed(&self, speed: f32) -> Result<()> {
        self.require_stretching("speed")?;
        self.inner.params.set_speed(speed)
    }

    pub fn set_pitch(&self, pitch: f32) -> Result<()> {
        self.require_stretching("pitch")?;
        self.inner.params.set_pitch(pitch)
    }

    pub fn set_rate(&self, rate: f32) -> Result<()> {
        self.require_stretching("rate")?;
        self.inner.params.set_rate(rate)
    }

    fn require_stretching(&self, what: &str) -> Result<()> {
        match self.inner.kind {
            SinkKind::Stretching => Ok(()),
            SinkKind::Direct => Err(PlayerError::UnsupportedOperation(format!(
                "{what} changes need a stretching player"
            ))),
        }
    }

    /// Playback position, or 0 before start and after teardown.
    pub fn elapsed_millis(&self) -> u64 {
        if !self.inner.started.load(Ordering::Acquire) || self.is_finished() {
            return 0;
        }
        self.inner.handle.elapsed_millis()
    }

    pub fn state(&self) -> PlaybackState {
        if self.is_finished() {
            return PlaybackState::Stopped;
        }
        if !self.inner.started.load(Ordering::Acquire) {
            return PlaybackState::Idle;
        }
        match self.inner.handle.state() {
            // The thread is up but the loop hasn't begun yet.
            PlaybackState::Idle => PlaybackState::Playing,
            other => other,
        }
    }

    /// Whether teardown has completed.
    pub fn is_finished(&self) -> bool {
        self.inner.torn_down.load(Ordering::Acquire)
    }

    /// Block until the decode thread exits. Must not be called from the completion callback.
    pub fn wait(&self) {
        let join = lock(&self.join).take();
        if let Some(join) = join
            && join.join().is_err()
        {
            tracing::error!("decode thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDeviceOpener;
    use crate::testing::{FakeExtractor, FakeTrack, fake_decoder};
    use crossbeam_channel::{Receiver, unbounded};
    use std::time::{Duration, Instant};

    fn completion() -> (impl FnOnce(Result<()>) + Send + 'static, Receiver<Result<()>>) {
        let (tx, rx) = unbounded();
        (
            move |result| {
                let _ = tx.send(result);
            },
            rx,
        )
    }

    fn session(
        decoder: Decoder,
        kind: SinkKind,
        opener: &MemoryDeviceOpener,
    ) -> (PlaybackSession, Receiver<Result<()>>) {
        let (done, rx) = completion();
        let s = PlaybackSession::new(
            decoder,
            kind,
            Arc::new(opener.clone()),
            PlayerConfig::default(),
            done,
        );
        (s, rx)
    }

    fn expect_one(rx: &Receiver<Result<()>>) -> Result<()> {
        let result = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("completion callback");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        result
    }

    #[test]
    fn stop_before_start_completes_once_without_a_device() {
        let opener = MemoryDeviceOpener::new();
        let (s, rx) = session(fake_decoder(44_100, 1, 10, 441), SinkKind::Direct, &opener);
        assert_eq!(s.state(), PlaybackState::Idle);
        s.stop();
        s.stop();
        expect_one(&rx).unwrap();
        assert_eq!(s.state(), PlaybackState::Stopped);
        assert_eq!(s.elapsed_millis(), 0);
        assert!(matches!(s.start(), Err(PlayerError::InvalidState(_))));
        assert_eq!(opener.stats().opened(), 0);
    }

    #[test]
    fn plays_to_end_of_stream() {
        let opener = MemoryDeviceOpener::new();
        let stats = opener.stats();
        let (s, rx) = session(fake_decoder(44_100, 1, 100, 441), SinkKind::Direct, &opener);
        s.start().unwrap();
        expect_one(&rx).unwrap();
        s.wait();
        assert_eq!(stats.written_samples(), 44_100);
        assert_eq!(stats.live(), 0);
        assert_eq!(stats.drains(), 1);
        assert_eq!(s.state(), PlaybackState::Stopped);
        assert_eq!(s.elapsed_millis(), 0);

        s.stop();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(matches!(s.start(), Err(PlayerError::InvalidState(_))));
    }

    #[test]
    fn concurrent_stops_yield_one_completion() {
        let opener = MemoryDeviceOpener::new().realtime();
        let stats = opener.stats();
        let (s, rx) = session(fake_decoder(8_000, 1, 500, 80), SinkKind::Stretching, &opener);
        s.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        thread::scope(|scope| {
            scope.spawn(|| s.stop());
            scope.spawn(|| s.stop());
        });
        expect_one(&rx).unwrap();
        s.wait();
        assert_eq!(stats.live(), 0);
        assert_eq!(stats.drains(), 0);
    }

    #[test]
    fn stop_mid_stream_discards_queued_audio_instead_of_draining() {
        let opener = MemoryDeviceOpener::new().realtime();
        let stats = opener.stats();
        let (s, rx) = session(fake_decoder(8_000, 1, 400, 80), SinkKind::Direct, &opener);
        s.start().unwrap();
        thread::sleep(Duration::from_millis(300));
        s.stop();
        expect_one(&rx).unwrap();
        s.wait();
        assert!(stats.discarded_samples() > 0);
        assert_eq!(stats.drains(), 0);
        assert_eq!(stats.live(), 0);
        assert!(stats.written_samples() < 32_000);
    }

    #[test]
    fn parameter_changes_need_a_stretching_sink() {
        let opener = MemoryDeviceOpener::new();
        let (direct, _rx) = session(fake_decoder(44_100, 1, 1, 10), SinkKind::Direct, &opener);
        assert!(matches!(
            direct.set_speed(2.0),
            Err(PlayerError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            direct.set_rate(2.0),
            Err(PlayerError::UnsupportedOperation(_))
        ));

        let (stretch, _rx) =
            session(fake_decoder(44_100, 1, 1, 10), SinkKind::Stretching, &opener);
        stretch.set_pitch(1.2).unwrap();
        assert!(matches!(
            stretch.set_speed(0.0),
            Err(PlayerError::InvalidArgument(_))
        ));
        assert_eq!(stretch.inner.params.snapshot().pitch, 1.2);
        assert_eq!(stretch.inner.params.snapshot().speed, 1.0);
    }

    #[test]
    fn sink_open_failure_is_returned_from_start() {
        let opener = MemoryDeviceOpener::new();
        let fake = FakeExtractor::new(vec![FakeTrack::audio(44_100, 6, 4, 600)]);
        let decoder = Decoder::from_extractor(Box::new(fake)).unwrap();
        let (s, rx) = session(decoder, SinkKind::Direct, &opener);
        assert!(matches!(s.start(), Err(PlayerError::InvalidArgument(_))));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(s.state(), PlaybackState::Stopped);
        assert_eq!(opener.stats().opened(), 0);
    }

    #[test]
    fn invariant_violation_reaches_the_completion_callback() {
        let opener = MemoryDeviceOpener::new();
        let track = FakeTrack::audio(44_100, 2, 10, 400).with_offset_at(3, 2);
        let decoder = Decoder::from_extractor(Box::new(FakeExtractor::new(vec![track]))).unwrap();
        let (s, rx) = session(decoder, SinkKind::Stretching, &opener);
        s.start().unwrap();
        let result = expect_one(&rx);
        assert!(matches!(result, Err(PlayerError::InvariantViolation(_))));
        s.wait();
        assert_eq!(opener.stats().live(), 0);
    }

    #[test]
    fn pause_freezes_elapsed_time() {
        let opener = MemoryDeviceOpener::new().realtime();
        let (s, rx) = session(fake_decoder(8_000, 1, 400, 80), SinkKind::Direct, &opener);
        s.start().unwrap();
        thread::sleep(Duration::from_millis(300));
        s.pause();
        assert_eq!(s.state(), PlaybackState::Paused);
        // Let a write already blocked on the paced device return.
        thread::sleep(Duration::from_millis(300));
        let frozen = s.elapsed_millis();
        assert!(frozen > 0);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(s.elapsed_millis(), frozen);

        s.resume();
        assert_eq!(s.state(), PlaybackState::Playing);
        thread::sleep(Duration::from_millis(300));
        assert!(s.elapsed_millis() >= frozen);
        s.stop();
        expect_one(&rx).unwrap();
    }

    #[test]
    fn half_rate_doubles_output_at_the_same_device_rate() {
        let opener = MemoryDeviceOpener::new();
        let stats = opener.stats();
        let (s, rx) = session(fake_decoder(44_100, 1, 100, 441), SinkKind::Stretching, &opener);
        s.set_rate(0.5).unwrap();
        s.start().unwrap();
        expect_one(&rx).unwrap();
        let ratio = stats.written_samples() as f64 / 44_100.0;
        assert!((ratio - 2.0).abs() < 0.1, "ratio {ratio}");
        assert_eq!(stats.output_rate(), 44_100);
    }

    #[test]
    fn double_speed_roughly_halves_wall_clock_time() {
        let run = |speed: Option<f32>| {
            let opener = MemoryDeviceOpener::new().realtime();
            let (s, rx) = session(fake_decoder(8_000, 1, 100, 80), SinkKind::Stretching, &opener);
            if let Some(speed) = speed {
                s.set_speed(speed).unwrap();
            }
            let started = Instant::now();
            s.start().unwrap();
            expect_one(&rx).unwrap();
            started.elapsed()
        };
        let normal = run(None);
        let fast = run(Some(2.0));
        assert!(
            fast.as_secs_f64() < normal.as_secs_f64() * 0.8,
            "normal {normal:?}, fast {fast:?}"
        );
    }
}
