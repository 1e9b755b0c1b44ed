//! RF measurement instrument seam.
//!
//! The native driver is reached through [`Instrument`]; a connection is an
//! [`InstrumentSession`] that lives for a single sweep and is closed by the
//! caller whether or not the sweep succeeds.

mod command;
mod simulated;

pub use command::CommandInstrument;
pub use simulated::{NoInstrument, SimulatedInstrument};

use async_trait::async_trait;
use num_complex::Complex64;
use std::fmt;
use std::sync::Arc;

use crate::config::Config;
use crate::error::SamplerError;

/// Physical interface used to reach the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionInterface {
    Hid,
    Vci,
    Serial,
}

impl ConnectionInterface {
    /// Preferred connection order.
    pub const PREFERRED: [ConnectionInterface; 3] =
        [ConnectionInterface::Hid, ConnectionInterface::Vci, ConnectionInterface::Serial];

    pub fn name(self) -> &'static str {
        match self {
            ConnectionInterface::Hid => "HID",
            ConnectionInterface::Vci => "VCI",
            ConnectionInterface::Serial => "SERIAL",
        }
    }
}

impl fmt::Display for ConnectionInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Linear S11 sweep parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepRequest {
    pub start_hz: f64,
    pub end_hz: f64,
    pub points: usize,
    /// Instrument-side averaging count per point.
    pub average: u16,
}

impl SweepRequest {
    pub fn from_config(config: &Config) -> Self {
        Self {
            start_hz: config.start_freq_hz,
            end_hz: config.end_freq_hz,
            points: config.sweep_points,
            average: config.sweep_average,
        }
    }

    pub fn frequencies(&self) -> Vec<f64> {
        match self.points {
            0 => Vec::new(),
            1 => vec![self.start_hz],
            n => {
                let step = (self.end_hz - self.start_hz) / (n - 1) as f64;
                (0..n).map(|i| self.start_hz + i as f64 * step).collect()
            }
        }
    }
}

/// One sweep of complex reflection coefficients.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSample {
    pub start_hz: f64,
    pub end_hz: f64,
    pub s11: Vec<Complex64>,
}

impl ChannelSample {
    pub fn point_count(&self) -> usize {
        self.s11.len()
    }

    /// Per-point `20·log10(|S11|)`.
    pub fn magnitudes_db(&self) -> impl Iterator<Item = f64> + '_ {
        self.s11.iter().map(|s| 20.0 * s.norm().log10())
    }
}

#[async_trait]
pub trait Instrument: Send + Sync {
    async fn device_count(&self) -> Result<usize, SamplerError>;

    /// Interfaces this driver build supports, in connection order.
    fn interfaces(&self) -> Vec<ConnectionInterface>;

    async fn connect(
        &self,
        interface: ConnectionInterface,
    ) -> Result<Box<dyn InstrumentSession>, SamplerError>;
}

#[async_trait]
pub trait InstrumentSession: Send {
    fn is_valid(&self) -> bool;

    /// Requests only the S11 parameter.
    async fn sweep_s11(&mut self, request: &SweepRequest) -> Result<ChannelSample, SamplerError>;

    async fn close(&mut self);
}

/// Builds the backend named by `instrument_backend` in the config.
pub fn from_config(config: &Config) -> Arc<dyn Instrument> {
    match config.instrument_backend {
        "command" => Arc::new(CommandInstrument::new(
            config.instrument_command,
            std::time::Duration::from_millis(config.sweep_timeout_ms),
        )),
        "none" => Arc::new(NoInstrument),
        "simulated" => Arc::new(SimulatedInstrument::new(config.simulated_s11_db)),
        other => {
            log::warn!("Unknown instrument backend '{}', no instrument will be used", other);
            Arc::new(NoInstrument)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequencies_are_linear_and_inclusive() {
        let req = SweepRequest { start_hz: 1.5e9, end_hz: 3.0e9, points: 100, average: 10 };
        let f = req.frequencies();
        assert_eq!(f.len(), 100);
        assert_eq!(f[0], 1.5e9);
        assert!((f[99] - 3.0e9).abs() < 1.0);
        assert!((f[1] - f[0] - 1.5e9 / 99.0).abs() < 1e-3);
    }

    #[test]
    fn magnitude_in_db() {
        let sample = ChannelSample {
            start_hz: 0.0,
            end_hz: 1.0,
            s11: vec![Complex64::new(0.1, 0.0), Complex64::new(0.0, 0.01)],
        };
        let db: Vec<f64> = sample.magnitudes_db().collect();
        assert!((db[0] + 20.0).abs() < 1e-9);
        assert!((db[1] + 40.0).abs() < 1e-9);
    }
}
