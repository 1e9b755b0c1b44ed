//! Receiver-side link telemetry.

mod collector;
mod counters;
mod frame_rate;
mod history;
mod latency;
mod snapshot;

pub use collector::{SharedFrameRate, TelemetryCollector, VIDEO_SHARE};
pub use counters::{InterfaceCounters, SystemCounters};
pub use frame_rate::FrameRateWindow;
pub use history::RollingHistory;
pub use latency::{EchoOutcome, EchoProbe, LATENCY_RANGE_MS, PingProbe, Pinger, UdpEchoProbe, parse_ping_time};
pub use snapshot::{HistorySeries, TelemetrySnapshot};
