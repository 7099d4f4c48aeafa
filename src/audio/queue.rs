use super::segment::{SegmentKey, SpeechSegment};
use super::PlaybackState;
use std::collections::VecDeque;

/// Result of offering a segment to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended; carries the pending length after the push
    Queued(usize),
    /// Same identity already pending or playing; payload discarded
    Duplicate,
}

/// FIFO of speech segments with a single active slot.
///
/// Holds no audio resources; the engine guards it with one mutex and every
/// transition happens under that lock.
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    pending: VecDeque<SpeechSegment>,
    active: Option<SegmentKey>,
    state: PlaybackState,
    worker_running: bool,
    completed: u64,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, segment: SpeechSegment) -> EnqueueOutcome {
        let key = segment.key();
        let duplicate = self.active.as_ref() == Some(&key)
            || self.pending.iter().any(|s| s.key() == key);
        if duplicate {
            return EnqueueOutcome::Duplicate;
        }

        self.pending.push_back(segment);
        if self.active.is_none() && self.state != PlaybackState::Paused {
            self.state = PlaybackState::Queued;
        }
        EnqueueOutcome::Queued(self.pending.len())
    }

    /// Claim the playback worker slot if there is work and no worker running
    pub fn claim_worker(&mut self) -> bool {
        if self.worker_running || self.pending.is_empty() {
            return false;
        }
        self.worker_running = true;
        true
    }

    /// Pop the head into the active slot, or release the worker slot when
    /// the queue is empty
    pub fn next_or_release(&mut self) -> Option<SpeechSegment> {
        match self.pending.pop_front() {
            Some(segment) => {
                self.active = Some(segment.key());
                self.state = PlaybackState::Playing;
                Some(segment)
            }
            None => {
                self.worker_running = false;
                self.active = None;
                self.state = PlaybackState::Idle;
                None
            }
        }
    }

    /// Give up a worker claim without taking a segment
    pub fn release_worker(&mut self) {
        self.worker_running = false;
    }

    /// Remove up to `max` segments from the head, leaving the active slot alone
    pub fn drain_front(&mut self, max: usize) -> Vec<SpeechSegment> {
        let n = max.min(self.pending.len());
        let drained: Vec<SpeechSegment> = self.pending.drain(..n).collect();
        if self.pending.is_empty() && self.active.is_none() {
            self.state = PlaybackState::Idle;
        }
        drained
    }

    /// Clear the active slot after a segment finished, failed or was skipped
    pub fn finish_active(&mut self, failed: bool) {
        if self.active.take().is_some() {
            self.completed += 1;
        }
        self.state = if failed {
            PlaybackState::Error
        } else if self.pending.is_empty() {
            PlaybackState::Idle
        } else {
            PlaybackState::Queued
        };
    }

    /// Drop every pending segment; returns how many were dropped
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        if self.active.is_none() {
            self.state = PlaybackState::Idle;
        }
        dropped
    }

    pub fn set_state(&mut self, state: PlaybackState) {
        self.state = state;
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn active(&self) -> Option<&SegmentKey> {
        self.active.as_ref()
    }

    pub fn is_playing(&self) -> bool {
        self.active.is_some()
    }

    pub fn worker_running(&self) -> bool {
        self.worker_running
    }

    /// Segments that left the active slot since creation
    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn pending(&self) -> impl Iterator<Item = &SpeechSegment> {
        self.pending.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(id: &str, n: u32) -> SpeechSegment {
        SpeechSegment {
            segment_id: id.to_string(),
            sentence_number: n,
            audio_data: format!("{}-{}", id, n),
            sample_rate: 24000,
            text: String::new(),
            format: "pcm_f32le".to_string(),
            duration_seconds: 0.0,
        }
    }

    #[test]
    fn duplicate_identity_is_dropped() {
        let mut queue = PlaybackQueue::new();
        assert_eq!(queue.push(segment("a", 0)), EnqueueOutcome::Queued(1));

        let mut dup = segment("a", 0);
        dup.audio_data = "other".to_string();
        assert_eq!(queue.push(dup), EnqueueOutcome::Duplicate);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending().next().map(|s| s.audio_data.as_str()), Some("a-0"));

        // same id, different sentence is distinct
        assert_eq!(queue.push(segment("a", 1)), EnqueueOutcome::Queued(2));
    }

    #[test]
    fn active_segment_counts_as_duplicate() {
        let mut queue = PlaybackQueue::new();
        queue.push(segment("a", 0));
        assert!(queue.claim_worker());
        assert!(queue.next_or_release().is_some());

        assert_eq!(queue.push(segment("a", 0)), EnqueueOutcome::Duplicate);
        queue.finish_active(false);
        assert_eq!(queue.push(segment("a", 0)), EnqueueOutcome::Queued(1));
    }

    #[test]
    fn single_worker_and_state_transitions() {
        let mut queue = PlaybackQueue::new();
        assert!(!queue.claim_worker());

        queue.push(segment("a", 0));
        queue.push(segment("b", 0));
        assert_eq!(queue.state(), PlaybackState::Queued);
        assert!(queue.claim_worker());
        assert!(!queue.claim_worker());

        let first = queue.next_or_release().unwrap();
        assert_eq!(first.segment_id, "a");
        assert_eq!(queue.state(), PlaybackState::Playing);
        queue.finish_active(false);
        assert_eq!(queue.state(), PlaybackState::Queued);

        queue.next_or_release().unwrap();
        queue.finish_active(true);
        assert_eq!(queue.state(), PlaybackState::Error);

        assert!(queue.next_or_release().is_none());
        assert!(!queue.worker_running());
        assert_eq!(queue.completed(), 2);
    }

    #[test]
    fn clear_keeps_active_slot() {
        let mut queue = PlaybackQueue::new();
        queue.push(segment("a", 0));
        queue.push(segment("b", 0));
        queue.claim_worker();
        queue.next_or_release();

        assert_eq!(queue.clear(), 1);
        assert!(queue.is_playing());
        assert_eq!(queue.state(), PlaybackState::Playing);
    }
}
