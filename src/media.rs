//! Local microphone capture.
//!
//! The capture device runs on a dedicated thread (cpal streams are not
//! `Send`) and broadcasts mono `f32` frames. Muting zeroes frames at the
//! source, so the encoder and the level monitor both observe silence while
//! the handle itself stays alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::MediaConstraints;
use crate::error::SessionError;

/// One capture callback's worth of mono samples.
pub type AudioFrame = Arc<Vec<f32>>;

/// Capacity of the frame broadcast; slow subscribers lag, they do not block
/// the capture callback.
const FRAME_CHANNEL_CAPACITY: usize = 32;

/// Frames quieter than this are zeroed when noise suppression is on.
const NOISE_GATE_RMS: f32 = 0.015;

const AGC_TARGET_PEAK: f32 = 0.7;
const AGC_MIN_GAIN: f32 = 0.5;
const AGC_MAX_GAIN: f32 = 4.0;
const AGC_SMOOTHING: f32 = 0.05;

type StopFn = Box<dyn FnOnce() + Send>;

/// Ownership of a captured audio source. Exactly one exists per session.
///
/// The track flag is mutable without destroying the handle; `release` is
/// idempotent and stops the underlying capture.
pub struct LocalMediaHandle {
    sample_rate: u32,
    enabled: Arc<AtomicBool>,
    released: AtomicBool,
    frames: broadcast::Sender<AudioFrame>,
    stop: Mutex<Option<StopFn>>,
}

impl LocalMediaHandle {
    pub fn new(
        sample_rate: u32,
        frames: broadcast::Sender<AudioFrame>,
        enabled: Arc<AtomicBool>,
        stop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            sample_rate,
            enabled,
            released: AtomicBool::new(false),
            frames,
            stop: Mutex::new(Some(Box::new(stop))),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AudioFrame> {
        self.frames.subscribe()
    }

    pub fn is_enabled(&self) -> bool {
        !self.is_released() && self.enabled.load(Ordering::SeqCst)
    }

    /// Sets the track flag and returns the resulting state. Returns `false`
    /// without error once the handle is released (no track exists anymore).
    pub fn set_enabled(&self, on: bool) -> bool {
        if self.is_released() {
            return false;
        }
        self.enabled.store(on, Ordering::SeqCst);
        on
    }

    /// Flips the track flag; mute without destroying the handle.
    pub fn toggle(&self) -> bool {
        if self.is_released() {
            return false;
        }
        let new_state = !self.enabled.load(Ordering::SeqCst);
        self.enabled.store(new_state, Ordering::SeqCst);
        new_state
    }

    /// Stops the underlying capture. Calling it twice is safe.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            debug!("releasing local media");
            if let Some(stop) = self.stop.lock().unwrap_or_else(|e| e.into_inner()).take() {
                stop();
            }
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Drop for LocalMediaHandle {
    fn drop(&mut self) {
        self.release();
    }
}

pub fn frame_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Per-frame processing derived from the configured constraints: a noise
/// gate for `noise_suppression` and a running peak normalizer for
/// `auto_gain_control`. `echo_cancellation` has no DSP stage here; it is a
/// capture-level flag only.
pub struct FrameProcessor {
    constraints: MediaConstraints,
    gain: f32,
}

impl FrameProcessor {
    pub fn new(constraints: MediaConstraints) -> Self {
        Self {
            constraints,
            gain: 1.0,
        }
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        if self.constraints.noise_suppression && frame_rms(samples) < NOISE_GATE_RMS {
            samples.fill(0.0);
            return;
        }
        if self.constraints.auto_gain_control {
            let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
            if peak > 1e-4 {
                let desired = (AGC_TARGET_PEAK / peak).clamp(AGC_MIN_GAIN, AGC_MAX_GAIN);
                self.gain += (desired - self.gain) * AGC_SMOOTHING;
            }
            for sample in samples.iter_mut() {
                *sample = (*sample * self.gain).clamp(-1.0, 1.0);
            }
        }
    }
}

/// Linear interpolation between sample rates; bridges the capture device's
/// native rate to the 48 kHz track.
pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).round() as usize;
    let last = input.len() - 1;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = (pos as usize).min(last);
        let frac = (pos - idx as f64) as f32;
        let a = input[idx];
        let b = input[(idx + 1).min(last)];
        out.push(a + (b - a) * frac);
    }
    out
}

/// Acquires the default microphone.
///
/// Fails with `DeviceUnavailable` when no usable input device exists and
/// `PermissionDenied` when the operating environment refuses capture access.
pub async fn acquire_microphone(
    constraints: &MediaConstraints,
) -> Result<LocalMediaHandle, SessionError> {
    let constraints = *constraints;
    let enabled = Arc::new(AtomicBool::new(true));
    let (frames_tx, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

    let thread_enabled = enabled.clone();
    let thread_frames = frames_tx.clone();
    std::thread::Builder::new()
        .name("avatarlink-capture".into())
        .spawn(move || capture_thread(constraints, thread_enabled, thread_frames, ready_tx, stop_rx))
        .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))?;

    let sample_rate = ready_rx
        .await
        .map_err(|_| SessionError::DeviceUnavailable("capture thread died".into()))??;
    debug!(sample_rate, "microphone acquired");

    Ok(LocalMediaHandle::new(sample_rate, frames_tx, enabled, move || {
        let _ = stop_tx.send(());
    }))
}

fn capture_thread(
    constraints: MediaConstraints,
    enabled: Arc<AtomicBool>,
    frames: broadcast::Sender<AudioFrame>,
    ready: tokio::sync::oneshot::Sender<Result<u32, SessionError>>,
    stop_rx: std::sync::mpsc::Receiver<()>,
) {
    let built = build_stream(constraints, enabled, frames);
    match built {
        Ok((stream, sample_rate)) => {
            let _ = ready.send(Ok(sample_rate));
            // Hold the stream alive until release; receiving an error means
            // the handle's stop sender dropped, which also means release.
            let _ = stop_rx.recv();
            drop(stream);
        }
        Err(err) => {
            let _ = ready.send(Err(err));
        }
    }
}

fn build_stream(
    constraints: MediaConstraints,
    enabled: Arc<AtomicBool>,
    frames: broadcast::Sender<AudioFrame>,
) -> Result<(cpal::Stream, u32), SessionError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| SessionError::DeviceUnavailable("no default input device".into()))?;
    let supported = device
        .default_input_config()
        .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))?;
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels() as usize;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    let mut processor = FrameProcessor::new(constraints);
    let err_fn = |err: cpal::StreamError| warn!(%err, "input stream error");

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &_| {
                publish_frame(data, channels, &enabled, &mut processor, &frames);
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &_| {
                let converted: Vec<f32> =
                    data.iter().map(|s| *s as f32 / i16::MAX as f32).collect();
                publish_frame(&converted, channels, &enabled, &mut processor, &frames);
            },
            err_fn,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &_| {
                let converted: Vec<f32> = data
                    .iter()
                    .map(|s| (*s as f32 - 32768.0) / 32768.0)
                    .collect();
                publish_frame(&converted, channels, &enabled, &mut processor, &frames);
            },
            err_fn,
            None,
        ),
        other => {
            return Err(SessionError::DeviceUnavailable(format!(
                "unsupported sample format {other:?}"
            )))
        }
    }
    .map_err(map_build_error)?;

    stream
        .play()
        .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))?;
    Ok((stream, sample_rate))
}

fn publish_frame(
    data: &[f32],
    channels: usize,
    enabled: &AtomicBool,
    processor: &mut FrameProcessor,
    frames: &broadcast::Sender<AudioFrame>,
) {
    let mut mono: Vec<f32> = data.chunks(channels.max(1)).map(|c| c[0]).collect();
    if enabled.load(Ordering::Relaxed) {
        processor.process(&mut mono);
    } else {
        mono.fill(0.0);
    }
    // No subscribers yet is fine; the frame is simply dropped.
    let _ = frames.send(Arc::new(mono));
}

fn map_build_error(err: cpal::BuildStreamError) -> SessionError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            SessionError::DeviceUnavailable("input device went away".into())
        }
        cpal::BuildStreamError::BackendSpecific { err } => {
            let text = err.to_string();
            if text.to_lowercase().contains("permission") || text.to_lowercase().contains("denied")
            {
                SessionError::PermissionDenied(text)
            } else {
                SessionError::DeviceUnavailable(text)
            }
        }
        other => SessionError::DeviceUnavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn test_handle() -> (LocalMediaHandle, Arc<AtomicUsize>) {
        let (frames, _) = broadcast::channel(4);
        let stops = Arc::new(AtomicUsize::new(0));
        let counter = stops.clone();
        let handle = LocalMediaHandle::new(48_000, frames, Arc::new(AtomicBool::new(true)), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (handle, stops)
    }

    #[test]
    fn toggle_flips_and_reports_state() {
        let (handle, _) = test_handle();
        assert!(handle.is_enabled());
        assert!(!handle.toggle());
        assert!(!handle.is_enabled());
        assert!(handle.toggle());
        assert!(handle.is_enabled());
    }

    #[test]
    fn release_is_idempotent_and_kills_the_track() {
        let (handle, stops) = test_handle();
        handle.release();
        handle.release();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(handle.is_released());
        // No track exists anymore: toggles report false without error.
        assert!(!handle.toggle());
        assert!(!handle.set_enabled(true));
    }

    #[test]
    fn drop_releases_exactly_once() {
        let (handle, stops) = test_handle();
        handle.release();
        drop(handle);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn noise_gate_zeroes_quiet_frames() {
        let mut processor = FrameProcessor::new(MediaConstraints::default());
        let mut quiet = vec![0.001f32; 480];
        processor.process(&mut quiet);
        assert!(quiet.iter().all(|s| *s == 0.0));

        let mut loud = vec![0.5f32; 480];
        processor.process(&mut loud);
        assert!(loud.iter().any(|s| *s != 0.0));
    }

    #[test]
    fn gate_disabled_passes_quiet_frames() {
        let constraints = MediaConstraints {
            noise_suppression: false,
            auto_gain_control: false,
            ..MediaConstraints::default()
        };
        let mut processor = FrameProcessor::new(constraints);
        let mut quiet = vec![0.001f32; 480];
        processor.process(&mut quiet);
        assert!(quiet.iter().all(|s| *s == 0.001));
    }

    #[test]
    fn agc_never_clips() {
        let mut processor = FrameProcessor::new(MediaConstraints::default());
        let mut frame = vec![0.9f32; 480];
        for _ in 0..100 {
            processor.process(&mut frame);
        }
        assert!(frame.iter().all(|s| s.abs() <= 1.0));
    }

    #[test]
    fn resample_identity_when_rates_match() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&input, 48_000, 48_000), input);
    }

    #[test]
    fn resample_upsamples_to_expected_length() {
        let input = vec![0.0f32; 441];
        let out = resample_linear(&input, 44_100, 48_000);
        assert_eq!(out.len(), 480);
    }

    #[test]
    fn resample_interpolates_between_samples() {
        let out = resample_linear(&[0.0, 1.0], 2, 4);
        assert_eq!(out.len(), 4);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(frame_rms(&[]), 0.0);
        assert_eq!(frame_rms(&[0.0; 64]), 0.0);
        assert!((frame_rms(&[0.5; 64]) - 0.5).abs() < 1e-6);
    }
}
