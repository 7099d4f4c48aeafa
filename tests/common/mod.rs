// Test doubles shared by the integration tests
//
// MockTransport: in-memory duplex connection with scripted failures
// MockAudioBackend: drives capture and render callbacks from plain threads

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use vocals::audio::{
    codec, AudioBackend, CaptureCallback, RenderCallback, SpeechSegment, StreamErrorCallback,
    StreamHandle, StreamSpec,
};
use vocals::connection::{Transport, TransportSink, TransportStream};
use vocals::{Result, VocalsError};

/// Poll `condition` every 10 ms until it holds or `timeout` passes
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A segment whose samples all equal `level`
pub fn segment(id: &str, sentence: u32, level: f32, samples: usize) -> SpeechSegment {
    SpeechSegment {
        segment_id: id.to_string(),
        sentence_number: sentence,
        audio_data: codec::encode_base64(&vec![level; samples]),
        sample_rate: 24000,
        text: format!("{} sentence {}", id, sentence),
        format: "pcm_f32le".to_string(),
        duration_seconds: samples as f64 / 24000.0,
    }
}

// ── Transport ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockTransport {
    /// Attempts still to fail; `u32::MAX` fails forever
    failures_left: AtomicU32,
    attempts: AtomicU32,
    sent: Arc<Mutex<Vec<String>>>,
    headers: Mutex<Vec<Vec<(String, String)>>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Result<String>>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the first `n` connection attempts
    pub fn failing(n: u32) -> Arc<Self> {
        let transport = Self::default();
        transport.failures_left.store(n, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn always_failing() -> Arc<Self> {
        Self::failing(u32::MAX)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Raw text of every message written so far
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Parsed messages written so far
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent()
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    /// Event names of the messages written so far
    pub fn sent_events(&self) -> Vec<String> {
        self.sent_json()
            .iter()
            .filter_map(|m| m["event"].as_str().map(str::to_string))
            .collect()
    }

    /// Headers passed to each successful connect
    pub fn headers(&self) -> Vec<Vec<(String, String)>> {
        self.headers.lock().clone()
    }

    /// Deliver `text` on the current connection
    pub fn push(&self, text: &str) {
        if let Some(tx) = self.inbound.lock().as_ref() {
            let _ = tx.send(Ok(text.to_string()));
        }
    }

    /// Fail the current connection's next read
    pub fn drop_connection(&self) {
        if let Some(tx) = self.inbound.lock().take() {
            let _ = tx.send(Err(VocalsError::websocket("connection reset")));
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        _url: &str,
        headers: &[(String, String)],
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>)> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            if left != u32::MAX {
                self.failures_left.store(left - 1, Ordering::SeqCst);
            }
            return Err(VocalsError::websocket("connection refused"));
        }

        self.headers.lock().push(headers.to_vec());
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock() = Some(tx);

        Ok((
            Box::new(MockSink {
                sent: Arc::clone(&self.sent),
            }),
            Box::new(MockStream { rx }),
        ))
    }
}

struct MockSink {
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl TransportSink for MockSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.sent.lock().push(text);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<Result<String>>,
}

#[async_trait]
impl TransportStream for MockStream {
    async fn next_text(&mut self) -> Option<Result<String>> {
        self.rx.recv().await
    }
}

// ── Audio ──────────────────────────────────────────────────────────────────

pub struct MockAudioBackend {
    /// Value of every captured sample
    level: Arc<Mutex<f32>>,
    capture_period: Duration,
    /// Buffers handed to capture callbacks
    captured_buffers: Arc<AtomicUsize>,
    outputs_opened: AtomicUsize,
    /// First non-silent sample rendered by each output stream, in open order
    first_samples: Arc<Mutex<Vec<f32>>>,
    active_outputs: Arc<AtomicUsize>,
    max_active_outputs: Arc<AtomicUsize>,
}

impl MockAudioBackend {
    pub fn new() -> Arc<Self> {
        Self::with_level(0.0)
    }

    pub fn with_level(level: f32) -> Arc<Self> {
        Arc::new(Self {
            level: Arc::new(Mutex::new(level)),
            capture_period: Duration::from_millis(5),
            captured_buffers: Arc::new(AtomicUsize::new(0)),
            outputs_opened: AtomicUsize::new(0),
            first_samples: Arc::new(Mutex::new(Vec::new())),
            active_outputs: Arc::new(AtomicUsize::new(0)),
            max_active_outputs: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn set_level(&self, level: f32) {
        *self.level.lock() = level;
    }

    pub fn captured_buffers(&self) -> usize {
        self.captured_buffers.load(Ordering::SeqCst)
    }

    pub fn outputs_opened(&self) -> usize {
        self.outputs_opened.load(Ordering::SeqCst)
    }

    pub fn first_samples(&self) -> Vec<f32> {
        self.first_samples.lock().clone()
    }

    pub fn max_active_outputs(&self) -> usize {
        self.max_active_outputs.load(Ordering::SeqCst)
    }
}

impl AudioBackend for MockAudioBackend {
    fn open_input(
        &self,
        spec: &StreamSpec,
        mut on_data: CaptureCallback,
        _on_error: StreamErrorCallback,
    ) -> Result<StreamHandle> {
        let len = spec.buffer_size as usize * spec.channels as usize;
        let level = Arc::clone(&self.level);
        let period = self.capture_period;
        let captured = Arc::clone(&self.captured_buffers);
        let stop = Arc::new(AtomicBool::new(false));
        let running = Arc::clone(&stop);

        let thread = thread::spawn(move || {
            while !running.load(Ordering::SeqCst) {
                let value = *level.lock();
                on_data(&vec![value; len]);
                captured.fetch_add(1, Ordering::SeqCst);
                thread::sleep(period);
            }
        });

        Ok(StreamHandle::new(move || {
            stop.store(true, Ordering::SeqCst);
            let _ = thread.join();
        }))
    }

    fn open_output(
        &self,
        spec: &StreamSpec,
        mut render: RenderCallback,
        _on_error: StreamErrorCallback,
    ) -> Result<StreamHandle> {
        self.outputs_opened.fetch_add(1, Ordering::SeqCst);
        let active = self.active_outputs.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_outputs.fetch_max(active, Ordering::SeqCst);

        let len = 256 * spec.channels as usize;
        let first_samples = Arc::clone(&self.first_samples);
        let stop = Arc::new(AtomicBool::new(false));
        let running = Arc::clone(&stop);

        let thread = thread::spawn(move || {
            let mut recorded = false;
            let mut buffer = vec![0.0f32; len];
            while !running.load(Ordering::SeqCst) {
                render(&mut buffer);
                if !recorded {
                    if let Some(sample) = buffer.iter().copied().find(|s| *s != 0.0) {
                        first_samples.lock().push(sample);
                        recorded = true;
                    }
                }
                thread::sleep(Duration::from_millis(1));
            }
        });

        let active_outputs = Arc::clone(&self.active_outputs);
        Ok(StreamHandle::new(move || {
            stop.store(true, Ordering::SeqCst);
            let _ = thread.join();
            active_outputs.fetch_sub(1, Ordering::SeqCst);
        }))
    }

    fn name(&self) -> &str {
        "mock"
    }
}
