//! Channel quality sampling: one S11 sweep reduced to a mean in dB.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::SamplerError;
use crate::instrument::{ChannelSample, Instrument, InstrumentSession, SweepRequest};

pub struct ChannelQualitySampler {
    instrument: Arc<dyn Instrument>,
    request: SweepRequest,
    sweep_timeout: Duration,
    // 仪器独占，防止并发采样
    lock: Mutex<()>,
}

impl ChannelQualitySampler {
    pub fn new(instrument: Arc<dyn Instrument>, request: SweepRequest, sweep_timeout: Duration) -> Self {
        Self {
            instrument,
            request,
            sweep_timeout,
            lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &Config, instrument: Arc<dyn Instrument>) -> Self {
        Self::new(
            instrument,
            SweepRequest::from_config(config),
            Duration::from_millis(config.sweep_timeout_ms),
        )
    }

    /// Acquires the instrument, sweeps S11 and returns the mean magnitude in dB.
    /// The session is opened and closed within this call.
    pub async fn sample(&self) -> Result<f64, SamplerError> {
        let _guard = self.lock.lock().await;

        if self.instrument.device_count().await? == 0 {
            return Err(SamplerError::NoDeviceFound);
        }

        let mut session = self.connect().await?;
        let result = self.sweep(session.as_mut()).await;
        session.close().await;
        // 已关闭的句柄仍然有效属于程序错误
        assert!(!session.is_valid(), "instrument session still valid after close");

        mean_db(&result?)
    }

    async fn connect(&self) -> Result<Box<dyn InstrumentSession>, SamplerError> {
        let mut attempted = Vec::new();
        for interface in self.instrument.interfaces() {
            match self.instrument.connect(interface).await {
                Ok(session) => {
                    log::debug!("Instrument connected via {}", interface);
                    return Ok(session);
                }
                Err(SamplerError::ResourceBusy) => return Err(SamplerError::ResourceBusy),
                Err(e) => {
                    log::debug!("Instrument connect via {} failed: {}", interface, e);
                    attempted.push(interface.to_string());
                }
            }
        }
        Err(SamplerError::ConnectFailed { attempted })
    }

    async fn sweep(&self, session: &mut dyn InstrumentSession) -> Result<ChannelSample, SamplerError> {
        if !session.is_valid() {
            return Err(SamplerError::SweepFailed("instrument handle is not valid".into()));
        }
        match tokio::time::timeout(self.sweep_timeout, session.sweep_s11(&self.request)).await {
            Ok(result) => result,
            Err(_) => Err(SamplerError::MeasurementTimeout),
        }
    }
}

/// Arithmetic mean of `20·log10(|S11|)` over the sweep.
pub fn mean_db(sample: &ChannelSample) -> Result<f64, SamplerError> {
    if sample.s11.is_empty() {
        return Err(SamplerError::MeasurementCorrupt("sweep returned no points".into()));
    }
    let mut sum = 0.0;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for db in sample.magnitudes_db() {
        if !db.is_finite() {
            return Err(SamplerError::MeasurementCorrupt(format!("non-finite point {}", db)));
        }
        sum += db;
        min = min.min(db);
        max = max.max(db);
    }
    let mean = sum / sample.point_count() as f64;
    log::debug!(
        "S11 sweep {:.3e}..{:.3e} Hz, {} points: mean {:.2} dB (min {:.2}, max {:.2})",
        sample.start_hz,
        sample.end_hz,
        sample.point_count(),
        mean,
        min,
        max
    );
    Ok(mean)
}
