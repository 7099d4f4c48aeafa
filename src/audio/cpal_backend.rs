use super::backend::{
    AudioBackend, CaptureCallback, RenderCallback, StreamErrorCallback, StreamHandle, StreamSpec,
};
use super::device::{self, Direction};
use crate::error::{Result, VocalsError};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use std::thread;
use tracing::{debug, info};

/// Host audio through cpal.
///
/// `cpal::Stream` is not `Send`, so every stream is built, played and dropped
/// on a thread of its own. The returned handle signals that thread to stop
/// and waits for the device to be released.
#[derive(Debug, Default, Clone)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for CpalBackend {
    fn open_input(
        &self,
        spec: &StreamSpec,
        on_data: CaptureCallback,
        on_error: StreamErrorCallback,
    ) -> Result<StreamHandle> {
        let spec = spec.clone();
        spawn_stream("vocals-capture", move || build_input(&spec, on_data, on_error))
    }

    fn open_output(
        &self,
        spec: &StreamSpec,
        render: RenderCallback,
        on_error: StreamErrorCallback,
    ) -> Result<StreamHandle> {
        let spec = spec.clone();
        spawn_stream("vocals-playback", move || build_output(&spec, render, on_error))
    }

    fn name(&self) -> &str {
        "cpal"
    }
}

fn spawn_stream<F>(name: &str, build: F) -> Result<StreamHandle>
where
    F: FnOnce() -> Result<cpal::Stream> + Send + 'static,
{
    let (open_tx, open_rx) = crossbeam_channel::bounded::<Result<()>>(1);
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    let label = name.to_string();

    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let stream = match build() {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = open_tx.send(Err(e.into()));
                return;
            }
            let _ = open_tx.send(Ok(()));

            // Blocks until the handle sends or is dropped
            let _ = stop_rx.recv();
            drop(stream);
            debug!("{} stream released", label);
        })
        .map_err(|e| VocalsError::audio_device(format!("failed to spawn {} thread: {}", name, e)))?;

    match open_rx.recv() {
        Ok(Ok(())) => Ok(StreamHandle::new(move || {
            let _ = stop_tx.send(());
            let _ = handle.join();
        })),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(VocalsError::audio_device(format!(
            "{} thread exited before the stream opened",
            name
        ))),
    }
}

fn stream_config(spec: &StreamSpec) -> StreamConfig {
    StreamConfig {
        channels: spec.channels,
        sample_rate: cpal::SampleRate(spec.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

fn build_input(
    spec: &StreamSpec,
    mut on_data: CaptureCallback,
    on_error: StreamErrorCallback,
) -> Result<cpal::Stream> {
    let device = device::resolve(spec.device_index, Direction::Input)?;
    let format = device.default_input_config()?.sample_format();
    let config = stream_config(spec);
    info!(
        "Opening input '{}' at {} Hz, {} channel(s), {:?}",
        device.name().unwrap_or_default(),
        spec.sample_rate,
        spec.channels,
        format
    );

    let err_fn = move |e: cpal::StreamError| {
        on_error(VocalsError::audio_device(format!("input stream error: {}", e)))
    };

    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| on_data(data),
            err_fn,
            None,
        )?,
        SampleFormat::I16 => {
            let mut scratch = Vec::new();
            device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    scratch.clear();
                    scratch.extend(data.iter().map(|s| *s as f32 / 32768.0));
                    on_data(&scratch);
                },
                err_fn,
                None,
            )?
        }
        other => {
            return Err(VocalsError::audio_device(format!(
                "unsupported input sample format {:?}",
                other
            )))
        }
    };

    Ok(stream)
}

fn build_output(
    spec: &StreamSpec,
    mut render: RenderCallback,
    on_error: StreamErrorCallback,
) -> Result<cpal::Stream> {
    let device = device::resolve(spec.device_index, Direction::Output)?;
    let format = device.default_output_config()?.sample_format();
    let config = stream_config(spec);
    debug!(
        "Opening output '{}' at {} Hz, {:?}",
        device.name().unwrap_or_default(),
        spec.sample_rate,
        format
    );

    let err_fn = move |e: cpal::StreamError| {
        on_error(VocalsError::playback(format!("output stream error: {}", e)))
    };

    let stream = match format {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| render(data),
            err_fn,
            None,
        )?,
        SampleFormat::I16 => {
            let mut scratch = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);
                    render(&mut scratch);
                    for (out, s) in data.iter_mut().zip(scratch.iter()) {
                        *out = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                    }
                },
                err_fn,
                None,
            )?
        }
        other => {
            return Err(VocalsError::audio_device(format!(
                "unsupported output sample format {:?}",
                other
            )))
        }
    };

    Ok(stream)
}
