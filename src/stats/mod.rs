//! Streaming statistics
//!
//! `StatsAggregator` observes captured frames and keeps a running
//! [`StreamStats`] under one lock. Callbacks are invoked after the lock is
//! released so a slow callback never holds up other frames' bookkeeping.

use crate::audio::{codec, AudioFrame};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Peak amplitude a healthy session must exceed
const HEALTHY_PEAK: f32 = 0.001;

/// Voice-activity ratio a healthy session must exceed
const HEALTHY_ACTIVITY: f64 = 0.1;

/// Statistics for one streaming session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamStats {
    /// When the session started
    pub started_at: DateTime<Utc>,

    /// When the session was finalized
    pub ended_at: Option<DateTime<Utc>>,

    /// Elapsed wall-clock seconds
    pub duration_secs: f64,

    /// Samples observed across all channels
    pub total_samples: u64,

    /// Bytes those samples occupy on the wire (4 per sample)
    pub total_bytes: u64,

    /// Frames observed
    pub frames: u64,

    /// Mean of per-frame average amplitude
    pub average_amplitude: f32,

    /// Largest absolute sample
    pub max_amplitude: f32,

    /// Smallest absolute sample
    pub min_amplitude: f32,

    /// Root mean square over every sample so far
    pub rms: f32,

    /// Closed silence intervals, plus the trailing one once finalized
    pub silence_duration_secs: f64,

    /// Time spent above the silence threshold
    pub voice_active_secs: f64,

    /// `voice_active_secs / duration_secs`, within [0, 1]
    pub voice_activity_ratio: f64,

    /// Audio messages sent during the session
    pub packets_sent: u64,

    /// Reconnections observed during the session
    pub reconnects: u64,

    /// Sample rate of the observed frames
    pub sample_rate: u32,

    /// Channel count of the observed frames
    pub channels: u16,
}

impl StreamStats {
    pub fn is_healthy(&self) -> bool {
        self.max_amplitude > HEALTHY_PEAK
            && self.voice_activity_ratio > HEALTHY_ACTIVITY
            && self.total_samples > 0
    }

    /// 0..=1; the mean of activity (full marks at 50%) and level (full
    /// marks at 0.1 average amplitude). Unhealthy sessions score 0.
    pub fn quality_score(&self) -> f64 {
        if !self.is_healthy() {
            return 0.0;
        }
        let activity = (self.voice_activity_ratio / 0.5).min(1.0);
        let level = (self.average_amplitude as f64 / 0.1).min(1.0);
        (activity + level) / 2.0
    }

    pub fn voice_activity_percentage(&self) -> f64 {
        self.voice_activity_ratio * 100.0
    }

    /// Frames per second actually observed
    pub fn effective_sample_rate(&self) -> f64 {
        if self.duration_secs <= 0.0 {
            return 0.0;
        }
        self.total_samples as f64 / self.channels.max(1) as f64 / self.duration_secs
    }

    pub fn bytes_per_second(&self) -> f64 {
        if self.duration_secs <= 0.0 {
            return 0.0;
        }
        self.total_bytes as f64 / self.duration_secs
    }
}

type StatsCallback = Box<dyn Fn(&StreamStats) + Send + Sync>;
type SilenceCallback = Box<dyn Fn(Duration) + Send + Sync>;
type LevelCallback = Box<dyn Fn(f32, f32) + Send + Sync>;

/// Optional observers of a running aggregation
#[derive(Default)]
pub struct StatsCallbacks {
    on_stats: Option<StatsCallback>,
    on_silence: Option<SilenceCallback>,
    on_level: Option<LevelCallback>,
}

impl StatsCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot after every frame
    pub fn on_stats(mut self, f: impl Fn(&StreamStats) + Send + Sync + 'static) -> Self {
        self.on_stats = Some(Box::new(f));
        self
    }

    /// Length of each silence interval when speech resumes
    pub fn on_silence(mut self, f: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.on_silence = Some(Box::new(f));
        self
    }

    /// Per-frame (average, peak) amplitude
    pub fn on_level(mut self, f: impl Fn(f32, f32) + Send + Sync + 'static) -> Self {
        self.on_level = Some(Box::new(f));
        self
    }
}

struct AggregatorState {
    stats: StreamStats,
    started: Instant,
    last_frame: Option<Instant>,
    amplitude_sum: f64,
    sum_squares: f64,
    /// Length of the silence interval still open
    open_silence: Duration,
    in_silence: bool,
    finished: bool,
}

/// Accumulates [`StreamStats`] from captured frames
pub struct StatsAggregator {
    threshold: f32,
    state: Mutex<AggregatorState>,
    callbacks: StatsCallbacks,
}

impl StatsAggregator {
    pub fn new(silence_threshold: f32, callbacks: StatsCallbacks) -> Self {
        Self::starting_at(silence_threshold, callbacks, Instant::now())
    }

    pub fn starting_at(silence_threshold: f32, callbacks: StatsCallbacks, started: Instant) -> Self {
        Self {
            threshold: silence_threshold,
            state: Mutex::new(AggregatorState {
                stats: StreamStats {
                    started_at: Utc::now(),
                    min_amplitude: f32::MAX,
                    ..StreamStats::default()
                },
                started,
                last_frame: None,
                amplitude_sum: 0.0,
                sum_squares: 0.0,
                open_silence: Duration::ZERO,
                in_silence: false,
                finished: false,
            }),
            callbacks,
        }
    }

    pub fn silence_threshold(&self) -> f32 {
        self.threshold
    }

    /// Account for `frame` at the moment it was captured
    pub fn observe(&self, frame: &AudioFrame) {
        self.observe_at(frame, frame.captured_at)
    }

    /// Account for `frame` as if it arrived at `now`
    pub fn observe_at(&self, frame: &AudioFrame, now: Instant) {
        let samples = &frame.samples[..];
        let average = frame.amplitude;
        let peak = codec::peak(samples);

        let (snapshot, closed_silence) = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }

            let since = state.last_frame.unwrap_or(state.started);
            let delta = now.saturating_duration_since(since);
            state.last_frame = Some(now);

            state.amplitude_sum += average as f64;
            state.sum_squares += samples.iter().map(|s| (*s as f64) * (*s as f64)).sum::<f64>();

            let mut closed_silence = None;
            if average > self.threshold {
                if state.in_silence {
                    let interval = state.open_silence;
                    state.stats.silence_duration_secs += interval.as_secs_f64();
                    state.open_silence = Duration::ZERO;
                    state.in_silence = false;
                    closed_silence = Some(interval);
                }
                state.stats.voice_active_secs += delta.as_secs_f64();
            } else {
                state.in_silence = true;
                state.open_silence += delta;
            }

            let AggregatorState {
                stats,
                started,
                amplitude_sum,
                sum_squares,
                ..
            } = &mut *state;

            stats.frames += 1;
            stats.total_samples += samples.len() as u64;
            stats.total_bytes += samples.len() as u64 * 4;
            stats.sample_rate = frame.sample_rate;
            stats.channels = frame.channels;
            stats.max_amplitude = stats.max_amplitude.max(peak);
            if !samples.is_empty() {
                stats.min_amplitude = stats.min_amplitude.min(codec::min_abs(samples));
            }
            stats.average_amplitude = (*amplitude_sum / stats.frames as f64) as f32;
            if stats.total_samples > 0 {
                stats.rms = (*sum_squares / stats.total_samples as f64).sqrt() as f32;
            }
            stats.duration_secs = now.saturating_duration_since(*started).as_secs_f64();
            stats.voice_activity_ratio = activity_ratio(stats.voice_active_secs, stats.duration_secs);

            (stats.clone(), closed_silence)
        };

        if let (Some(interval), Some(cb)) = (closed_silence, &self.callbacks.on_silence) {
            cb(interval);
        }
        if let Some(cb) = &self.callbacks.on_level {
            cb(average, peak);
        }
        if let Some(cb) = &self.callbacks.on_stats {
            cb(&snapshot);
        }
    }

    pub fn record_packet(&self) {
        self.state.lock().stats.packets_sent += 1;
    }

    pub fn record_reconnect(&self) {
        self.state.lock().stats.reconnects += 1;
    }

    /// Current accumulator contents
    pub fn snapshot(&self) -> StreamStats {
        normalized(&self.state.lock().stats)
    }

    pub fn finish(&self) -> StreamStats {
        self.finish_at(Instant::now())
    }

    /// Finalize at `now`: fix the duration and fold in the open silence.
    /// Frames observed afterwards are ignored.
    pub fn finish_at(&self, now: Instant) -> StreamStats {
        let mut state = self.state.lock();
        if !state.finished {
            state.finished = true;

            let trailing = state
                .last_frame
                .map(|last| now.saturating_duration_since(last))
                .unwrap_or_default();
            if state.in_silence {
                let open = state.open_silence + trailing;
                state.stats.silence_duration_secs += open.as_secs_f64();
                state.open_silence = Duration::ZERO;
            }

            let duration = now.saturating_duration_since(state.started).as_secs_f64();
            state.stats.duration_secs = duration;
            state.stats.ended_at = Some(Utc::now());
            state.stats.voice_activity_ratio =
                activity_ratio(state.stats.voice_active_secs, duration);

            debug!(
                "Stream stats finalized: {:.2}s, {} samples, activity {:.1}%",
                duration,
                state.stats.total_samples,
                state.stats.voice_activity_percentage()
            );
        }
        normalized(&state.stats)
    }
}

fn activity_ratio(active: f64, duration: f64) -> f64 {
    if duration <= 0.0 {
        return 0.0;
    }
    (active / duration).clamp(0.0, 1.0)
}

/// Present an untouched minimum as 0
fn normalized(stats: &StreamStats) -> StreamStats {
    let mut stats = stats.clone();
    if stats.min_amplitude == f32::MAX {
        stats.min_amplitude = 0.0;
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(level: f32) -> AudioFrame {
        AudioFrame::new(vec![level; 100], 1000, 1, 0)
    }

    #[test]
    fn empty_session_is_unhealthy() {
        let agg = StatsAggregator::new(0.01, StatsCallbacks::new());
        let stats = agg.finish();
        assert_eq!(stats.total_samples, 0);
        assert_eq!(stats.min_amplitude, 0.0);
        assert!(!stats.is_healthy());
        assert_eq!(stats.quality_score(), 0.0);
    }

    #[test]
    fn quality_score_caps_each_component() {
        let stats = StreamStats {
            total_samples: 10,
            max_amplitude: 0.5,
            average_amplitude: 0.2,
            voice_activity_ratio: 0.8,
            ..StreamStats::default()
        };
        assert!(stats.is_healthy());
        assert!((stats.quality_score() - 1.0).abs() < 1e-9);

        let quieter = StreamStats {
            average_amplitude: 0.05,
            voice_activity_ratio: 0.25,
            ..stats
        };
        assert!((quieter.quality_score() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn trailing_silence_is_folded_in_at_finish() {
        let start = Instant::now();
        let agg = StatsAggregator::starting_at(0.1, StatsCallbacks::new(), start);

        agg.observe_at(&frame(0.5), start + Duration::from_millis(100));
        agg.observe_at(&frame(0.0), start + Duration::from_millis(200));
        assert_eq!(agg.snapshot().silence_duration_secs, 0.0);

        let stats = agg.finish_at(start + Duration::from_millis(400));
        assert!((stats.silence_duration_secs - 0.3).abs() < 1e-9);
        assert!((stats.voice_active_secs - 0.1).abs() < 1e-9);
        assert!((stats.duration_secs - 0.4).abs() < 1e-9);

        // ignored after finish
        agg.observe_at(&frame(0.5), start + Duration::from_millis(500));
        assert_eq!(agg.snapshot().frames, 2);
    }
}
