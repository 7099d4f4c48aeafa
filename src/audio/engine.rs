//! Capture and playback engine
//!
//! Capture: the device callback re-chunks input into `buffer_size` frames,
//! publishes the frame's mean absolute amplitude, hands the frame to the
//! caller's sink synchronously and fans it out to frame subscribers.
//!
//! Playback: segments wait in a [`PlaybackQueue`]. A single worker thread,
//! started when work arrives and no worker is running, drains the queue one
//! segment at a time. A segment that fails to decode or open a stream is
//! reported to error subscribers and skipped.

use super::backend::{AudioBackend, StreamErrorCallback, StreamHandle, StreamSpec};
use super::codec;
use super::dump::SegmentDumper;
use super::queue::{EnqueueOutcome, PlaybackQueue};
use super::segment::{SegmentKey, SpeechSegment};
use super::{AudioConfig, AudioFrame, PlaybackState, RecordingState};
use crate::error::{ErrorCode, Result, VocalsError};
use crate::subscription::{HandlerRegistry, Subscription};
use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Receives every captured frame on the capture thread
pub type FrameSink = Box<dyn FnMut(&AudioFrame) + Send + 'static>;

/// Slice used when waiting for a segment to finish
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Lower bound on the completion wait for very short segments
const MIN_PLAYBACK_TIMEOUT: Duration = Duration::from_millis(250);

/// Playback operations other components drive
pub trait PlaybackControl: Send + Sync {
    /// Ramp the active segment down to silence and drop pending segments
    fn fade_out(&self, duration: Duration);

    /// Latest capture amplitude
    fn current_amplitude(&self) -> f32;
}

struct Inner {
    config: AudioConfig,
    backend: Arc<dyn AudioBackend>,
    errors: HandlerRegistry<VocalsError>,
    frames: HandlerRegistry<AudioFrame>,

    capture: Mutex<Option<StreamHandle>>,
    recording_state: Mutex<RecordingState>,
    /// f32 bits of the latest frame amplitude
    amplitude: Arc<AtomicU32>,

    queue: Mutex<PlaybackQueue>,
    active: Mutex<Option<Arc<PlaybackCursor>>>,
    auto_playback: AtomicBool,
    paused: Arc<AtomicBool>,
    dumper: Option<SegmentDumper>,
    debug_audio: AtomicBool,
}

/// Audio capture and speech playback for one client
#[derive(Clone)]
pub struct AudioEngine {
    inner: Arc<Inner>,
}

impl AudioEngine {
    pub fn new(
        config: AudioConfig,
        backend: Arc<dyn AudioBackend>,
        errors: HandlerRegistry<VocalsError>,
    ) -> Result<Self> {
        config.validate()?;

        let dumper = match &config.debug_dump_dir {
            Some(dir) => Some(SegmentDumper::new(dir)?),
            None => None,
        };

        info!(
            "Audio engine using {} backend ({} Hz, {} ch, buffer {})",
            backend.name(),
            config.sample_rate,
            config.channels,
            config.buffer_size
        );

        Ok(Self {
            inner: Arc::new(Inner {
                auto_playback: AtomicBool::new(config.auto_playback),
                config,
                backend,
                errors,
                frames: HandlerRegistry::new("audio-frame"),
                capture: Mutex::new(None),
                recording_state: Mutex::new(RecordingState::Idle),
                amplitude: Arc::new(AtomicU32::new(0f32.to_bits())),
                queue: Mutex::new(PlaybackQueue::new()),
                active: Mutex::new(None),
                paused: Arc::new(AtomicBool::new(false)),
                dumper,
                debug_audio: AtomicBool::new(false),
            }),
        })
    }

    /// Log every captured frame and played segment at debug level.
    /// Capture picks the setting up on the next `start_recording`.
    pub fn set_debug_audio(&self, enabled: bool) {
        self.inner.debug_audio.store(enabled, Ordering::Relaxed);
    }

    pub fn config(&self) -> &AudioConfig {
        &self.inner.config
    }

    // ── Capture ────────────────────────────────────────────────────────────

    /// Open the capture stream; `sink` sees every frame before subscribers do
    pub fn start_recording(&self, sink: FrameSink) -> Result<()> {
        let mut capture = self.inner.capture.lock();
        if capture.is_some() {
            return Err(VocalsError::new(
                ErrorCode::AlreadyRecording,
                "recording already in progress",
            ));
        }

        let config = &self.inner.config;
        let callback = capture_callback(
            config,
            sink,
            Arc::clone(&self.inner.amplitude),
            self.inner.frames.clone(),
            self.inner.debug_audio.load(Ordering::Relaxed),
        );

        let state = self.recording_state_handle();
        let errors = self.inner.errors.clone();
        let on_error: StreamErrorCallback = Arc::new(move |e: VocalsError| {
            error!("Capture stream error: {}", e);
            state(RecordingState::Error);
            errors.dispatch(e);
        });

        match self
            .inner
            .backend
            .open_input(&config.capture_spec(), callback, on_error)
        {
            Ok(handle) => {
                *capture = Some(handle);
                *self.inner.recording_state.lock() = RecordingState::Recording;
                info!("Recording started");
                Ok(())
            }
            Err(e) => {
                *self.inner.recording_state.lock() = RecordingState::Error;
                self.inner.errors.dispatch(e.clone());
                Err(e)
            }
        }
    }

    /// Close the capture stream; does nothing if not recording
    pub fn stop_recording(&self) {
        let handle = self.inner.capture.lock().take();
        if let Some(handle) = handle {
            handle.stop();
            self.inner.amplitude.store(0f32.to_bits(), Ordering::Relaxed);
            info!("Recording stopped");
        }
        *self.inner.recording_state.lock() = RecordingState::Idle;
    }

    fn recording_state_handle(&self) -> impl Fn(RecordingState) + Send + Sync + 'static {
        let inner = Arc::downgrade(&self.inner);
        move |state| {
            if let Some(inner) = inner.upgrade() {
                *inner.recording_state.lock() = state;
            }
        }
    }

    pub fn is_recording(&self) -> bool {
        self.inner.capture.lock().is_some()
    }

    pub fn recording_state(&self) -> RecordingState {
        *self.inner.recording_state.lock()
    }

    /// Mean absolute amplitude of the latest captured frame
    pub fn current_amplitude(&self) -> f32 {
        f32::from_bits(self.inner.amplitude.load(Ordering::Relaxed))
    }

    /// Receive a copy of every captured frame on a dedicated thread
    pub fn on_frame<F>(&self, handler: F) -> Subscription
    where
        F: Fn(AudioFrame) + Send + Sync + 'static,
    {
        self.inner.frames.subscribe(handler)
    }

    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(VocalsError) + Send + Sync + 'static,
    {
        self.inner.errors.subscribe(handler)
    }

    // ── Playback ───────────────────────────────────────────────────────────

    /// Queue a segment; duplicates of a pending or playing segment are dropped
    pub fn enqueue(&self, segment: SpeechSegment) -> EnqueueOutcome {
        let key = segment.key();
        let (outcome, start) = {
            let mut queue = self.inner.queue.lock();
            let outcome = queue.push(segment);
            let start = matches!(outcome, EnqueueOutcome::Queued(_))
                && self.inner.auto_playback.load(Ordering::SeqCst)
                && queue.claim_worker();
            (outcome, start)
        };

        match outcome {
            EnqueueOutcome::Duplicate => info!("Skipping duplicate segment {}", key),
            EnqueueOutcome::Queued(len) => debug!("Queued segment {} ({} pending)", key, len),
        }

        if start {
            self.spawn_worker();
        }
        outcome
    }

    /// Start draining the queue when auto playback is off
    pub fn play_queued(&self) -> bool {
        let start = self.inner.queue.lock().claim_worker();
        if start {
            self.spawn_worker();
        }
        start
    }

    fn spawn_worker(&self) {
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("vocals-playback-worker".to_string())
            .spawn(move || inner.run_worker());

        if let Err(e) = spawned {
            error!("Failed to start playback worker: {}", e);
            // Release the claim so a later enqueue can retry
            self.inner.queue.lock().release_worker();
            self.inner
                .errors
                .dispatch(VocalsError::playback(format!("playback worker failed to start: {}", e)));
        }
    }

    /// Drop pending segments and cut the active one short
    pub fn clear_queue(&self) {
        let dropped = self.inner.queue.lock().clear();
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.cancel_active();
        info!("Audio queue cleared ({} pending dropped)", dropped);
    }

    pub fn pause(&self) -> Result<()> {
        let mut queue = self.inner.queue.lock();
        if queue.state() != PlaybackState::Playing {
            return Err(VocalsError::playback("not currently playing"));
        }
        self.inner.paused.store(true, Ordering::SeqCst);
        queue.set_state(PlaybackState::Paused);
        info!("Playback paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let mut queue = self.inner.queue.lock();
        if queue.state() != PlaybackState::Paused {
            return Err(VocalsError::playback("not paused"));
        }
        self.inner.paused.store(false, Ordering::SeqCst);
        let state = if queue.is_playing() {
            PlaybackState::Playing
        } else if queue.is_empty() {
            PlaybackState::Idle
        } else {
            PlaybackState::Queued
        };
        queue.set_state(state);
        info!("Playback resumed");
        Ok(())
    }

    /// Skip the active segment; queued segments continue
    pub fn stop_playback(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        if self.inner.cancel_active() {
            info!("Playback stopped");
        }
    }

    /// Ramp the active segment to silence over `duration` and drop pending
    pub fn fade_out(&self, duration: Duration) {
        let dropped = self.inner.queue.lock().clear();
        let active = self.inner.active.lock().clone();
        match active {
            // A paused segment would never finish its ramp
            Some(cursor) if self.inner.paused.swap(false, Ordering::SeqCst) => {
                cursor.cancel();
                info!("Stopped paused segment ({} pending dropped)", dropped);
            }
            Some(cursor) => {
                cursor.start_fade(duration);
                info!("Fading out over {:?} ({} pending dropped)", duration, dropped);
            }
            None => debug!("Fade requested with nothing playing"),
        }
    }

    pub fn set_auto_playback(&self, enabled: bool) {
        self.inner.auto_playback.store(enabled, Ordering::SeqCst);
        if enabled {
            self.play_queued();
        }
    }

    pub fn auto_playback(&self) -> bool {
        self.inner.auto_playback.load(Ordering::SeqCst)
    }

    /// Hand pending segments to `callback` instead of the speaker.
    ///
    /// Takes one segment, or all of them when `consume_all` is set, and
    /// returns how many were handed over.
    pub fn process_queue<F>(&self, mut callback: F, consume_all: bool) -> usize
    where
        F: FnMut(SpeechSegment),
    {
        let taken = {
            let mut queue = self.inner.queue.lock();
            let max = if consume_all { usize::MAX } else { 1 };
            queue.drain_front(max)
        };

        let count = taken.len();
        for segment in taken {
            callback(segment);
        }
        count
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.inner.queue.lock().state()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.queue.lock().is_playing()
    }

    pub fn current_segment(&self) -> Option<SegmentKey> {
        self.inner.queue.lock().active().cloned()
    }

    /// Segments that have finished, failed or been skipped
    pub fn completed_segments(&self) -> u64 {
        self.inner.queue.lock().completed()
    }

    /// Stop capture and playback and drop queued audio
    pub fn cleanup(&self) {
        self.stop_recording();
        self.clear_queue();
        self.inner.frames.clear();
    }
}

impl PlaybackControl for AudioEngine {
    fn fade_out(&self, duration: Duration) {
        AudioEngine::fade_out(self, duration)
    }

    fn current_amplitude(&self) -> f32 {
        AudioEngine::current_amplitude(self)
    }
}

impl Inner {
    fn run_worker(self: Arc<Self>) {
        debug!("Playback worker started");
        loop {
            let segment = match self.queue.lock().next_or_release() {
                Some(segment) => segment,
                None => break,
            };

            let key = segment.key();
            let failed = match self.play_segment(&segment) {
                Ok(()) => false,
                Err(mut e) => {
                    e.add_detail("segment_id", key.segment_id.clone());
                    e.add_detail("sentence_number", key.sentence_number);
                    warn!("Segment {} failed, skipping: {}", key, e);
                    self.errors.dispatch(e);
                    true
                }
            };

            self.queue.lock().finish_active(failed);
        }
        debug!("Playback worker finished");
    }

    fn play_segment(&self, segment: &SpeechSegment) -> Result<()> {
        let decoded = codec::decode_payload(&segment.audio_data, segment.sample_rate)
            .map_err(|e| VocalsError::playback(format!("failed to decode segment: {}", e.message)))?;

        if let Some(dumper) = &self.dumper {
            if let Err(e) = dumper.write(segment, &decoded) {
                warn!("Failed to dump segment {}: {}", segment.key(), e);
            }
        }

        if decoded.samples.is_empty() {
            debug!("Segment {} has no samples", segment.key());
            return Ok(());
        }

        let channels = decoded.channels.max(1);
        let frames = decoded.samples.len() / channels as usize;
        let nominal = Duration::from_secs_f64(frames as f64 / decoded.sample_rate.max(1) as f64);
        let timeout = nominal.mul_f64(1.5).max(MIN_PLAYBACK_TIMEOUT);

        if self.debug_audio.load(Ordering::Relaxed) {
            debug!(
                "Playing segment {} ({} frames at {} Hz, {:?}): {}",
                segment.key(),
                frames,
                decoded.sample_rate,
                nominal,
                segment.text
            );
        }

        let cursor = Arc::new(PlaybackCursor::new(
            decoded.samples,
            channels as usize,
            decoded.sample_rate,
            Arc::clone(&self.paused),
        ));
        *self.active.lock() = Some(Arc::clone(&cursor));

        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let render_cursor = Arc::clone(&cursor);
        let render = Box::new(move |out: &mut [f32]| {
            if render_cursor.render(out) {
                let _ = done_tx.try_send(());
            }
        });

        let errors = self.errors.clone();
        let on_error: StreamErrorCallback = Arc::new(move |e: VocalsError| {
            warn!("Playback stream error: {}", e);
            errors.dispatch(e);
        });

        let spec = StreamSpec {
            sample_rate: decoded.sample_rate,
            channels,
            buffer_size: self.config.buffer_size as u32,
            device_index: self.config.output_device_index,
        };

        let stream = match self.backend.open_output(&spec, render, on_error) {
            Ok(stream) => stream,
            Err(e) => {
                *self.active.lock() = None;
                return Err(VocalsError::playback(format!(
                    "failed to open output stream: {}",
                    e.message
                )));
            }
        };

        let started = Instant::now();
        let mut waited = Duration::ZERO;
        loop {
            match done_rx.recv_timeout(WAIT_SLICE) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            if cursor.is_cancelled() {
                break;
            }
            if !self.paused.load(Ordering::SeqCst) {
                waited += WAIT_SLICE;
            }
            if waited >= timeout {
                warn!(
                    "Segment {} did not finish within {:?}, moving on",
                    segment.key(),
                    timeout
                );
                break;
            }
        }

        stream.stop();
        *self.active.lock() = None;
        debug!("Segment {} done after {:?}", segment.key(), started.elapsed());
        Ok(())
    }

    fn cancel_active(&self) -> bool {
        match self.active.lock().as_ref() {
            Some(cursor) => {
                cursor.cancel();
                true
            }
            None => false,
        }
    }
}

fn capture_callback(
    config: &AudioConfig,
    mut sink: FrameSink,
    amplitude: Arc<AtomicU32>,
    frames: HandlerRegistry<AudioFrame>,
    debug_audio: bool,
) -> super::CaptureCallback {
    let frame_len = config.buffer_size * config.channels as usize;
    let sample_rate = config.sample_rate;
    let channels = config.channels;
    let frames_per_buffer = config.buffer_size as u64;
    let mut pending: Vec<f32> = Vec::with_capacity(frame_len);
    let mut emitted_frames: u64 = 0;

    Box::new(move |data: &[f32]| {
        let mut rest = data;
        while !rest.is_empty() {
            let take = (frame_len - pending.len()).min(rest.len());
            pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if pending.len() < frame_len {
                break;
            }

            let timestamp_ms = emitted_frames * 1000 / sample_rate as u64;
            emitted_frames += frames_per_buffer;
            let frame = AudioFrame::new(
                std::mem::replace(&mut pending, Vec::with_capacity(frame_len)),
                sample_rate,
                channels,
                timestamp_ms,
            );

            amplitude.store(frame.amplitude.to_bits(), Ordering::Relaxed);
            if debug_audio {
                debug!(
                    "Captured frame at {} ms, amplitude {:.4}",
                    frame.timestamp_ms, frame.amplitude
                );
            }

            sink(&frame);
            if !frames.is_empty() {
                frames.dispatch(frame);
            }
        }
    })
}

struct CursorState {
    position: usize,
    /// (frames left, total frames) while fading
    fade: Option<(usize, usize)>,
}

/// Feeds one segment's samples to the output callback
struct PlaybackCursor {
    samples: Vec<f32>,
    channels: usize,
    sample_rate: u32,
    state: Mutex<CursorState>,
    cancelled: AtomicBool,
    paused: Arc<AtomicBool>,
}

impl PlaybackCursor {
    fn new(samples: Vec<f32>, channels: usize, sample_rate: u32, paused: Arc<AtomicBool>) -> Self {
        Self {
            samples,
            channels,
            sample_rate,
            state: Mutex::new(CursorState {
                position: 0,
                fade: None,
            }),
            cancelled: AtomicBool::new(false),
            paused,
        }
    }

    /// Fill `out`; returns true once the segment has nothing left to play.
    /// Past the end, while paused or after cancel, the buffer is silence.
    fn render(&self, out: &mut [f32]) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            out.fill(0.0);
            return true;
        }
        if self.paused.load(Ordering::SeqCst) {
            out.fill(0.0);
            return false;
        }

        let mut state = self.state.lock();
        for frame in out.chunks_mut(self.channels) {
            let gain = match state.fade {
                Some((0, _)) => 0.0,
                Some((left, total)) => {
                    state.fade = Some((left - 1, total));
                    left as f32 / total as f32
                }
                None => 1.0,
            };

            for sample in frame.iter_mut() {
                *sample = match self.samples.get(state.position) {
                    Some(s) => {
                        state.position += 1;
                        s * gain
                    }
                    None => 0.0,
                };
            }
        }

        state.position >= self.samples.len() || matches!(state.fade, Some((0, _)))
    }

    fn start_fade(&self, duration: Duration) {
        let total = (duration.as_secs_f64() * self.sample_rate as f64).round() as usize;
        if total == 0 {
            self.cancel();
            return;
        }
        let mut state = self.state.lock();
        if state.fade.is_none() {
            state.fade = Some((total, total));
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
