//! cpal-backed microphone and speaker.
//!
//! `cpal::Stream` is not `Send`, so each stream lives on a dedicated thread
//! that builds it, reports readiness, and parks until told to stop. Waiting
//! on that thread is blocking; on a multi-threaded runtime it is done through
//! `block_in_place` so other tasks move off the worker meanwhile.

use std::collections::VecDeque;
use std::fmt;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::runtime::RuntimeFlavor;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info};

use parley_core::error::{ParleyError, Result};
use parley_core::types::{AudioChunk, AudioFormat};

use crate::capture::{AudioSource, CaptureEvent, CaptureSpec};
use crate::playback::{AudioSink, SinkFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

fn device_err(e: impl fmt::Display) -> ParleyError {
    ParleyError::Device(e.to_string())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Run a blocking wait without starving the runtime's other tasks.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// An audio device as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub direction: Direction,
    pub is_default: bool,
}

/// List input and output devices on the default host.
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let default_in = host.default_input_device().and_then(|d| d.name().ok());
    let default_out = host.default_output_device().and_then(|d| d.name().ok());

    let mut devices = Vec::new();
    for device in host.input_devices().map_err(device_err)? {
        if let Ok(name) = device.name() {
            devices.push(DeviceInfo {
                is_default: default_in.as_deref() == Some(name.as_str()),
                name,
                direction: Direction::Input,
            });
        }
    }
    for device in host.output_devices().map_err(device_err)? {
        if let Ok(name) = device.name() {
            devices.push(DeviceInfo {
                is_default: default_out.as_deref() == Some(name.as_str()),
                name,
                direction: Direction::Output,
            });
        }
    }
    Ok(devices)
}

fn find_device(name: Option<&str>, direction: Direction) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match (name, direction) {
        (None, Direction::Input) => host
            .default_input_device()
            .ok_or_else(|| device_err("no default input device")),
        (None, Direction::Output) => host
            .default_output_device()
            .ok_or_else(|| device_err("no default output device")),
        (Some(wanted), dir) => {
            let mut devices = match dir {
                Direction::Input => host.input_devices().map_err(device_err)?,
                Direction::Output => host.output_devices().map_err(device_err)?,
            };
            devices
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                .ok_or_else(|| device_err(format!("audio device not found: {wanted}")))
        }
    }
}

fn stream_config(format: AudioFormat, channels: u16) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

fn f32_to_i16(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Re-chunks device callbacks into fixed-size capture chunks.
///
/// Whatever is left over is sent as a short final chunk when the chunker is
/// dropped together with its stream.
struct Chunker {
    buf: Vec<u8>,
    chunk_bytes: usize,
    format: AudioFormat,
    tx: mpsc::UnboundedSender<CaptureEvent>,
}

impl Chunker {
    fn push(&mut self, samples: impl Iterator<Item = i16>) {
        for s in samples {
            self.buf.extend_from_slice(&s.to_le_bytes());
            if self.buf.len() >= self.chunk_bytes {
                let data = std::mem::replace(&mut self.buf, Vec::with_capacity(self.chunk_bytes));
                let _ = self
                    .tx
                    .send(CaptureEvent::Chunk(AudioChunk::new(data, self.format)));
            }
        }
    }

    fn flush(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let data = std::mem::take(&mut self.buf);
        let _ = self
            .tx
            .send(CaptureEvent::Chunk(AudioChunk::new(data, self.format)));
    }
}

impl Drop for Chunker {
    fn drop(&mut self) {
        self.flush();
    }
}

struct StreamThread {
    stop: std_mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl StreamThread {
    /// Run `build` on a new thread and wait until it reports the stream playing.
    fn spawn<F>(name: &str, build: F) -> Result<Self>
    where
        F: FnOnce() -> Result<cpal::Stream> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<()>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let started = build().and_then(|stream| {
                    stream.play().map_err(device_err)?;
                    Ok(stream)
                });
                let stream = match started {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Sender dropped or explicit stop both end the stream
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        match blocking(|| ready_rx.recv()) {
            Ok(Ok(())) => Ok(Self {
                stop: stop_tx,
                handle,
            }),
            Ok(Err(e)) => {
                let _ = blocking(|| handle.join());
                Err(e)
            }
            Err(_) => {
                let _ = blocking(|| handle.join());
                Err(device_err("audio thread exited before the stream started"))
            }
        }
    }

    /// Joining waits until the stream and its callback have been dropped.
    fn stop(self, join: bool) {
        let _ = self.stop.send(());
        if join {
            let handle = self.handle;
            let _ = blocking(|| handle.join());
        }
    }
}

/// Microphone capture through cpal.
pub struct CpalSource {
    device_name: Option<String>,
    running: Option<StreamThread>,
}

impl CpalSource {
    /// `None` selects the host default input device.
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            running: None,
        }
    }
}

impl AudioSource for CpalSource {
    fn start(&mut self, spec: CaptureSpec, tx: mpsc::UnboundedSender<CaptureEvent>) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        let device_name = self.device_name.clone();
        let thread = StreamThread::spawn("parley-capture", move || {
            let device = find_device(device_name.as_deref(), Direction::Input)?;
            let sample_format = device
                .default_input_config()
                .map_err(device_err)?
                .sample_format();
            let config = stream_config(spec.format, spec.format.channels);
            info!(
                device = %device.name().unwrap_or_default(),
                format = %spec.format,
                ?sample_format,
                "Opening input stream"
            );

            let err_tx = tx.clone();
            let on_error = move |e: cpal::StreamError| {
                error!(%e, "Input stream error");
                let _ = err_tx.send(CaptureEvent::Error(e.to_string()));
            };
            let mut chunker = Chunker {
                buf: Vec::with_capacity(spec.chunk_bytes),
                chunk_bytes: spec.chunk_bytes.max(spec.format.frame_size()),
                format: spec.format,
                tx,
            };

            let stream = match sample_format {
                cpal::SampleFormat::I16 => device.build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        chunker.push(data.iter().copied())
                    },
                    on_error,
                    None,
                ),
                cpal::SampleFormat::F32 => device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        chunker.push(data.iter().map(|&s| f32_to_i16(s)))
                    },
                    on_error,
                    None,
                ),
                other => {
                    return Err(device_err(format!("unsupported input sample format: {other:?}")));
                }
            };
            stream.map_err(device_err)
        })?;
        self.running = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(thread) = self.running.take() {
            thread.stop(true);
            debug!("Input stream closed");
        }
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Opens cpal output streams for playback.
#[derive(Debug, Clone, Default)]
pub struct CpalSinkFactory {
    device_name: Option<String>,
}

impl CpalSinkFactory {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

/// Samples queued for the device callback.
struct Ring {
    samples: VecDeque<i16>,
    capacity: usize,
    error: Option<String>,
}

impl SinkFactory for CpalSinkFactory {
    fn open(&self, format: AudioFormat) -> Result<Box<dyn AudioSink>> {
        // One second of mono audio
        let capacity = format.sample_rate as usize;
        let ring = Arc::new(Mutex::new(Ring {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            error: None,
        }));
        let drained = Arc::new(Notify::new());

        let device_name = self.device_name.clone();
        let cb_ring = ring.clone();
        let cb_drained = drained.clone();
        let thread = StreamThread::spawn("parley-playback", move || {
            let device = find_device(device_name.as_deref(), Direction::Output)?;
            let default = device.default_output_config().map_err(device_err)?;
            let sample_format = default.sample_format();
            // Mono source fanned out to whatever the device wants
            let channels = default.channels().max(1);
            let config = stream_config(format, channels);
            info!(
                device = %device.name().unwrap_or_default(),
                %format,
                channels,
                ?sample_format,
                "Opening output stream"
            );

            let err_ring = cb_ring.clone();
            let err_notify = cb_drained.clone();
            let on_error = move |e: cpal::StreamError| {
                error!(%e, "Output stream error");
                lock(&err_ring).error = Some(e.to_string());
                err_notify.notify_one();
            };

            let stream = match sample_format {
                cpal::SampleFormat::I16 => device.build_output_stream(
                    &config,
                    move |out: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        fill(out, channels, &cb_ring, &cb_drained, |s| s)
                    },
                    on_error,
                    None,
                ),
                cpal::SampleFormat::F32 => device.build_output_stream(
                    &config,
                    move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        fill(out, channels, &cb_ring, &cb_drained, |s| {
                            s as f32 / i16::MAX as f32
                        })
                    },
                    on_error,
                    None,
                ),
                other => {
                    return Err(device_err(format!("unsupported output sample format: {other:?}")));
                }
            };
            stream.map_err(device_err)
        })?;

        Ok(Box::new(CpalSink {
            ring,
            drained,
            thread: Some(thread),
        }))
    }
}

/// Device callback: pop one mono sample per frame, silence on underrun.
fn fill<T: Copy + Default>(
    out: &mut [T],
    channels: u16,
    ring: &Mutex<Ring>,
    drained: &Notify,
    convert: impl Fn(i16) -> T,
) {
    let mut ring = lock(ring);
    for frame in out.chunks_mut(channels as usize) {
        let value = ring.samples.pop_front().map(&convert).unwrap_or_default();
        frame.fill(value);
    }
    if ring.samples.len() < ring.capacity / 2 {
        drained.notify_one();
    }
}

fn le_i16(b: &[u8]) -> i16 {
    i16::from_le_bytes([b[0], b[1]])
}

struct CpalSink {
    ring: Arc<Mutex<Ring>>,
    drained: Arc<Notify>,
    thread: Option<StreamThread>,
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn write(&mut self, pcm: &[u8]) -> Result<()> {
        let mut samples = pcm
            .chunks_exact(2)
            .map(le_i16)
            .peekable();
        while samples.peek().is_some() {
            {
                let mut ring = lock(&self.ring);
                if let Some(e) = ring.error.take() {
                    return Err(ParleyError::Device(e));
                }
                let room = ring.capacity.saturating_sub(ring.samples.len());
                ring.samples.extend(samples.by_ref().take(room));
            }
            if samples.peek().is_some() {
                self.drained.notified().await;
            }
        }
        Ok(())
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        lock(&self.ring).samples.clear();
        if let Some(thread) = self.thread.take() {
            // The stream thread drops the stream on its own; dropping must not block.
            thread.stop(false);
        }
    }
}
