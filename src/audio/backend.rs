use crate::error::{Result, VocalsError};
use std::fmt;
use std::sync::Arc;

/// Parameters for opening a device stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSpec {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of interleaved channels
    pub channels: u16,
    /// Frames per hardware buffer
    pub buffer_size: u32,
    /// Device index; the host default when `None`
    pub device_index: Option<usize>,
}

/// Receives interleaved captured samples on the device thread
pub type CaptureCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Fills an interleaved output buffer on the device thread
pub type RenderCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// Receives asynchronous stream failures
pub type StreamErrorCallback = Arc<dyn Fn(VocalsError) + Send + Sync + 'static>;

/// Audio device backend
///
/// Implementations:
/// - `CpalBackend`: the host audio system through cpal
/// - test doubles that drive the callbacks from plain threads
pub trait AudioBackend: Send + Sync {
    /// Open and start a capture stream
    fn open_input(
        &self,
        spec: &StreamSpec,
        on_data: CaptureCallback,
        on_error: StreamErrorCallback,
    ) -> Result<StreamHandle>;

    /// Open and start a playback stream
    fn open_output(
        &self,
        spec: &StreamSpec,
        render: RenderCallback,
        on_error: StreamErrorCallback,
    ) -> Result<StreamHandle>;

    /// Get backend name for logging
    fn name(&self) -> &str;
}

/// Owner of a running stream; stopping or dropping it releases the device
pub struct StreamHandle {
    stop: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl StreamHandle {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop: Some(Box::new(stop)),
        }
    }

    pub fn stop(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("running", &self.stop.is_some())
            .finish()
    }
}
