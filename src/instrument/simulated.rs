use async_trait::async_trait;
use num_complex::Complex64;
use std::f64::consts::PI;
use std::sync::Mutex;

use super::{ChannelSample, ConnectionInterface, Instrument, InstrumentSession, SweepRequest};
use crate::error::SamplerError;

/// Ripple amplitude (dB) laid over the simulated sweep.
const RIPPLE_DB: f64 = 3.0;

/// Bench stand-in for the VNA: one device on HID whose sweep averages to a
/// configurable S11.
pub struct SimulatedInstrument {
    mean_db: Mutex<f64>,
}

impl SimulatedInstrument {
    pub fn new(mean_db: f64) -> Self {
        Self {
            mean_db: Mutex::new(mean_db),
        }
    }

    pub fn set_mean_db(&self, mean_db: f64) {
        if let Ok(mut guard) = self.mean_db.lock() {
            *guard = mean_db;
        }
    }

    fn mean_db(&self) -> f64 {
        self.mean_db.lock().map(|g| *g).unwrap_or(f64::NAN)
    }
}

#[async_trait]
impl Instrument for SimulatedInstrument {
    async fn device_count(&self) -> Result<usize, SamplerError> {
        Ok(1)
    }

    fn interfaces(&self) -> Vec<ConnectionInterface> {
        vec![ConnectionInterface::Hid]
    }

    async fn connect(
        &self,
        interface: ConnectionInterface,
    ) -> Result<Box<dyn InstrumentSession>, SamplerError> {
        if interface != ConnectionInterface::Hid {
            return Err(SamplerError::ConnectFailed {
                attempted: vec![interface.to_string()],
            });
        }
        Ok(Box::new(SimulatedSession {
            mean_db: self.mean_db(),
            open: true,
        }))
    }
}

struct SimulatedSession {
    mean_db: f64,
    open: bool,
}

#[async_trait]
impl InstrumentSession for SimulatedSession {
    fn is_valid(&self) -> bool {
        self.open
    }

    async fn sweep_s11(&mut self, request: &SweepRequest) -> Result<ChannelSample, SamplerError> {
        if !self.open {
            return Err(SamplerError::SweepFailed("session closed".into()));
        }
        let n = request.points;
        // A full sine period over the sweep keeps the dB mean at `mean_db`.
        let s11 = (0..n)
            .map(|i| {
                let phase = 2.0 * PI * i as f64 / n.max(1) as f64;
                let db = self.mean_db + RIPPLE_DB * phase.sin();
                Complex64::from_polar(10f64.powf(db / 20.0), phase)
            })
            .collect();
        Ok(ChannelSample {
            start_hz: request.start_hz,
            end_hz: request.end_hz,
            s11,
        })
    }

    async fn close(&mut self) {
        self.open = false;
    }
}

/// Backend for hosts without an instrument; enumeration is always empty.
pub struct NoInstrument;

#[async_trait]
impl Instrument for NoInstrument {
    async fn device_count(&self) -> Result<usize, SamplerError> {
        Ok(0)
    }

    fn interfaces(&self) -> Vec<ConnectionInterface> {
        Vec::new()
    }

    async fn connect(
        &self,
        interface: ConnectionInterface,
    ) -> Result<Box<dyn InstrumentSession>, SamplerError> {
        Err(SamplerError::ConnectFailed {
            attempted: vec![interface.to_string()],
        })
    }
}
