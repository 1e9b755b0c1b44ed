use serde::{Deserialize, Serialize};

/// Index-aligned history series, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySeries {
    /// Seconds since the receive session started.
    pub timestamps: Vec<f64>,
    /// Total (video + audio) kbps.
    pub bitrate: Vec<f64>,
    pub latency: Vec<f64>,
    /// Mean S11 of the decision in effect, `None` before the first decision.
    pub s11: Vec<Option<f64>>,
}

/// Everything the receiver knows about the link at one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub video_bitrate_kbps: f64,
    pub audio_bitrate_kbps: f64,
    pub video_fps: f64,
    pub video_latency_ms: f64,
    pub audio_latency_ms: f64,
    pub packet_loss_percent: f64,
    pub connected: bool,
    pub history: HistorySeries,
}

impl TelemetrySnapshot {
    pub fn total_bitrate_kbps(&self) -> f64 {
        self.video_bitrate_kbps + self.audio_bitrate_kbps
    }
}
