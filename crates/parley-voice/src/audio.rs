//! Audio device abstraction: CPAL capture and Rodio playback
//!
//! Input and output handles are `!Send` on some platforms, so each is opened on
//! the thread that uses it: the capture thread owns the [`FrameSource`], the
//! output thread owns the [`AudioSink`]. [`AudioDevice`] is the `Send + Sync`
//! factory handed to those threads.

use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a read waits before reporting [`FrameRead::Idle`].
const READ_POLL: Duration = Duration::from_millis(100);

/// Frames buffered between the CPAL callback and the capture thread (~2s at 30ms).
const CAPTURE_QUEUE_FRAMES: usize = 64;

/// Audio configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Frame duration in milliseconds (10, 20 or 30; default: 30)
    pub frame_ms: u32,

    /// Input device name (substring match); `None` uses the default device
    pub input_device: Option<String>,

    /// Output device name (substring match); `None` uses the default device
    pub output_device: Option<String>,

    /// Consecutive transient read failures tolerated before capture is degraded
    pub read_retries: u32,

    /// Initial backoff between read retries, doubled on each attempt
    pub retry_backoff_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_ms: 30,
            input_device: None,
            output_device: None,
            read_retries: 3,
            retry_backoff_ms: 50,
        }
    }
}

impl AudioConfig {
    /// Samples per frame (480 for 30ms at 16kHz).
    pub fn frame_len(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }
}

/// Speech/silence label assigned by the segmenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameLabel {
    Speech,
    Silence,
}

/// Fixed-duration mono PCM buffer with a monotonic sequence number.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Sequence number assigned by the capture thread
    pub seq: u64,

    /// Audio samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,

    /// Set once the segmenter has classified the frame
    pub label: Option<FrameLabel>,
}

impl AudioFrame {
    pub fn new(seq: u64, samples: Vec<f32>) -> Self {
        Self {
            seq,
            samples,
            label: None,
        }
    }
}

/// Result of a single blocking read from the input device.
#[derive(Debug)]
pub enum FrameRead {
    /// One frame of exactly `frame_len` samples
    Frame(Vec<f32>),
    /// Nothing arrived within the poll interval; the caller should check for shutdown
    Idle,
    /// The stream has ended and will produce no more frames
    Closed,
}

/// A live input stream. Errors from `read_frame` are transient stream failures.
pub trait FrameSource {
    fn read_frame(&mut self) -> VoiceResult<FrameRead>;
}

/// How a playback call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    Finished,
    Interrupted,
}

/// A live output device. `play` blocks until the audio ends or `cancel` fires.
pub trait AudioSink {
    fn play(&mut self, audio: &[u8], cancel: &CancellationToken) -> VoiceResult<PlayOutcome>;
}

/// Opens input and output streams. Enumeration and selection live behind this trait.
pub trait AudioDevice: Send + Sync {
    fn open_input(
        &self,
        device: Option<&str>,
        sample_rate: u32,
        frame_len: usize,
    ) -> VoiceResult<Box<dyn FrameSource>>;

    fn open_output(&self, device: Option<&str>, sample_rate: u32) -> VoiceResult<Box<dyn AudioSink>>;
}

/// Host audio through CPAL (capture) and Rodio (playback).
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevice;

impl CpalDevice {
    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;

        let mut device_names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                device_names.push(name);
            }
        }

        Ok(device_names)
    }

    fn find_input(name: Option<&str>) -> VoiceResult<Device> {
        let host = cpal::default_host();
        if let Some(wanted) = name {
            let wanted = wanted.to_lowercase();
            for device in host.input_devices()? {
                if device
                    .name()
                    .map(|n| n.to_lowercase().contains(&wanted))
                    .unwrap_or(false)
                {
                    return Ok(device);
                }
            }
            return Err(VoiceError::AudioDevice(format!(
                "No input device matching '{}'",
                wanted
            )));
        }
        host.default_input_device()
            .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))
    }

    fn find_output(name: Option<&str>) -> VoiceResult<Option<rodio::cpal::Device>> {
        use rodio::cpal::traits::{DeviceTrait as _, HostTrait as _};

        let Some(wanted) = name else {
            return Ok(None);
        };
        let wanted = wanted.to_lowercase();
        let host = rodio::cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| VoiceError::AudioDevice(e.to_string()))?;
        for device in devices {
            if device
                .name()
                .map(|n| n.to_lowercase().contains(&wanted))
                .unwrap_or(false)
            {
                return Ok(Some(device));
            }
        }
        Err(VoiceError::AudioDevice(format!(
            "No output device matching '{}'",
            wanted
        )))
    }
}

impl AudioDevice for CpalDevice {
    fn open_input(
        &self,
        device: Option<&str>,
        sample_rate: u32,
        frame_len: usize,
    ) -> VoiceResult<Box<dyn FrameSource>> {
        info!("🎤 Initializing audio capture ({}Hz, mono)", sample_rate);

        let device = Self::find_input(device)?;
        info!("📱 Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

        let default_config = device.default_input_config()?;
        debug!("🔧 Default config: {:?}", default_config);

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (frame_tx, frame_rx) = std_mpsc::sync_channel::<Result<Vec<f32>, String>>(CAPTURE_QUEUE_FRAMES);
        let error_tx = frame_tx.clone();
        let mut sample_buffer = Vec::with_capacity(frame_len);

        let stream = device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    sample_buffer.push(sample);

                    if sample_buffer.len() >= frame_len {
                        let frame = std::mem::replace(&mut sample_buffer, Vec::with_capacity(frame_len));
                        if let Err(e) = frame_tx.try_send(Ok(frame)) {
                            warn!("Capture queue full, frame lost: {}", e);
                        }
                    }
                }
            },
            move |err| {
                let _ = error_tx.try_send(Err(err.to_string()));
            },
            None,
        )?;

        stream.play()?;

        info!("✅ Audio capture started");

        Ok(Box::new(CpalSource {
            _stream: stream,
            frame_rx,
        }))
    }

    fn open_output(&self, device: Option<&str>, _sample_rate: u32) -> VoiceResult<Box<dyn AudioSink>> {
        info!("🔊 Initializing audio playback");

        let (stream, handle) = match Self::find_output(device)? {
            Some(device) => rodio::OutputStream::try_from_device(&device),
            None => rodio::OutputStream::try_default(),
        }
        .map_err(|e| VoiceError::AudioDevice(e.to_string()))?;

        info!("✅ Audio playback initialized");

        Ok(Box::new(RodioSink {
            _stream: stream,
            handle,
        }))
    }
}

/// Capture stream kept alive for as long as frames are read.
struct CpalSource {
    _stream: Stream,
    frame_rx: std_mpsc::Receiver<Result<Vec<f32>, String>>,
}

impl FrameSource for CpalSource {
    fn read_frame(&mut self) -> VoiceResult<FrameRead> {
        match self.frame_rx.recv_timeout(READ_POLL) {
            Ok(Ok(frame)) => Ok(FrameRead::Frame(frame)),
            Ok(Err(e)) => Err(VoiceError::AudioStream(e)),
            Err(std_mpsc::RecvTimeoutError::Timeout) => Ok(FrameRead::Idle),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Ok(FrameRead::Closed),
        }
    }
}

/// Rodio output; a fresh `Sink` per reply so an interrupted reply leaves nothing queued.
struct RodioSink {
    _stream: rodio::OutputStream,
    handle: rodio::OutputStreamHandle,
}

impl AudioSink for RodioSink {
    fn play(&mut self, audio: &[u8], cancel: &CancellationToken) -> VoiceResult<PlayOutcome> {
        if audio.is_empty() {
            return Ok(PlayOutcome::Finished);
        }
        let source = rodio::Decoder::new(Cursor::new(audio.to_vec()))
            .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;
        let sink = rodio::Sink::try_new(&self.handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
        sink.append(source);

        while !sink.empty() {
            if cancel.is_cancelled() {
                sink.stop();
                info!("⏹️ Audio playback stopped");
                return Ok(PlayOutcome::Interrupted);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(PlayOutcome::Finished)
    }
}
