//! Input level metering for UI feedback.
//!
//! Taps the capture broadcast and publishes a 0–100 amplitude metric,
//! recomputed per frame with fast attack and slow decay. Independent of
//! session state; it runs for as long as the capture stream lives.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::media::{frame_rms, AudioFrame};

/// Speech at normal input gain lands in the upper half of the meter.
const RMS_SCALE: f32 = 300.0;

/// Per-frame decay applied while the signal falls.
const DECAY: f32 = 0.8;

pub fn scale_rms(rms: f32) -> f32 {
    (rms * RMS_SCALE).clamp(0.0, 100.0)
}

/// Background observer producing the continuously updating level metric.
pub struct AudioLevelMonitor {
    task: JoinHandle<()>,
}

impl AudioLevelMonitor {
    /// Consumes capture frames and writes the smoothed level into `level_tx`.
    /// Exits (and zeroes the metric) when the capture stream closes.
    pub fn spawn(
        mut frames: broadcast::Receiver<AudioFrame>,
        level_tx: Arc<watch::Sender<u8>>,
    ) -> Self {
        let task = tokio::spawn(async move {
            let mut current = 0.0f32;
            loop {
                match frames.recv().await {
                    Ok(frame) => {
                        let target = scale_rms(frame_rms(&frame));
                        current = if target > current {
                            target
                        } else {
                            current * DECAY
                        };
                        let _ = level_tx.send(current as u8);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "level monitor lagged behind capture");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = level_tx.send(0);
                        break;
                    }
                }
            }
        });
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for AudioLevelMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
