//! Adaptive audio/video link control: a sender measures channel quality and
//! serves a processing-mode decision, a receiver polls it, keeps telemetry
//! and records sessions tagged with the decision in effect.

pub mod backoff;
pub mod config;
pub mod decision;
pub mod decision_client;
pub mod decision_service;
pub mod echo_service;
pub mod enhancer;
pub mod error;
pub mod events;
pub mod frames;
pub mod fuzzy;
pub mod gui_bridge;
pub mod instrument;
pub mod protocol;
pub mod receiver;
pub mod recording;
pub mod sampler;
pub mod sender;
pub mod shutdown;
pub mod telemetry;
pub mod transport;

pub use config::Config;
pub use decision::{Decision, ProcessingMode};
pub use fuzzy::FuzzyModeController;
