//! Amplitude-driven interrupt debounce
//!
//! A frame above the threshold arms a timer; any frame at or below it
//! disarms the timer. The action fires only if the timer survives the whole
//! window, and fires once per sustained burst: it re-arms after the level
//! has dropped back below the threshold.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

/// Window the level must stay above the threshold
pub const INTERRUPT_DEBOUNCE: Duration = Duration::from_millis(500);

type FireFn = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Default)]
struct DebounceState {
    timer: Option<JoinHandle<()>>,
    /// Set when the current burst already fired
    latched: bool,
    /// Bumped on every disarm so a stale timer can tell it lost the race
    generation: u64,
}

pub struct InterruptDebouncer {
    window: Duration,
    runtime: Handle,
    state: Arc<Mutex<DebounceState>>,
    on_fire: FireFn,
}

impl InterruptDebouncer {
    pub fn new(runtime: Handle, on_fire: impl Fn() + Send + Sync + 'static) -> Self {
        Self::with_window(INTERRUPT_DEBOUNCE, runtime, on_fire)
    }

    pub fn with_window(
        window: Duration,
        runtime: Handle,
        on_fire: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            window,
            runtime,
            state: Arc::new(Mutex::new(DebounceState::default())),
            on_fire: Arc::new(on_fire),
        }
    }

    /// Feed one amplitude reading
    pub fn observe(&self, amplitude: f32, threshold: f32) {
        if amplitude > threshold {
            self.arm();
        } else {
            self.disarm();
        }
    }

    /// Whether a timer is currently counting down
    pub fn is_armed(&self) -> bool {
        self.state.lock().timer.is_some()
    }

    /// Cancel any running timer and forget the current burst
    pub fn disarm(&self) {
        let mut state = self.state.lock();
        state.latched = false;
        state.generation = state.generation.wrapping_add(1);
        if let Some(timer) = state.timer.take() {
            timer.abort();
            debug!("Interrupt timer cancelled");
        }
    }

    fn arm(&self) {
        let mut state = self.state.lock();
        if state.latched || state.timer.is_some() {
            return;
        }

        let generation = state.generation;
        let window = self.window;
        let shared = Arc::clone(&self.state);
        let on_fire = Arc::clone(&self.on_fire);

        debug!("Interrupt timer armed ({:?})", window);
        state.timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(window).await;
            {
                let mut state = shared.lock();
                if state.generation != generation {
                    return;
                }
                state.timer = None;
                state.latched = true;
            }
            on_fire();
        }));
    }
}

impl Drop for InterruptDebouncer {
    fn drop(&mut self) {
        if let Some(timer) = self.state.lock().timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (InterruptDebouncer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let debouncer = InterruptDebouncer::new(Handle::current(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (debouncer, fired)
    }

    async fn feed(debouncer: &InterruptDebouncer, amplitude: f32, total: Duration) {
        let step = Duration::from_millis(50);
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            debouncer.observe(amplitude, 0.5);
            tokio::time::advance(step).await;
            tokio::task::yield_now().await;
            elapsed += step;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn short_burst_does_not_fire() {
        let (debouncer, fired) = counting();
        feed(&debouncer, 0.9, Duration::from_millis(400)).await;
        debouncer.observe(0.1, 0.5);
        tokio::time::advance(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!debouncer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_burst_fires_once() {
        let (debouncer, fired) = counting();
        feed(&debouncer, 0.9, Duration::from_millis(1500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // A new burst after a quiet frame fires again
        debouncer.observe(0.0, 0.5);
        feed(&debouncer, 0.9, Duration::from_millis(700)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_is_exclusive() {
        let (debouncer, fired) = counting();
        feed(&debouncer, 0.5, Duration::from_millis(1000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
