//! Processing-mode decision shared by the sender and the receiver.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Discrete processing mode, ordered from least to most enhancement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProcessingMode {
    #[serde(rename = "No Enhancement Mode")]
    NoEnhancement,
    #[serde(rename = "Audio-Only Enhancement Mode")]
    AudioOnly,
    #[serde(rename = "Light AV Mode")]
    Light,
    #[serde(rename = "Standard AV Mode")]
    Standard,
    #[serde(rename = "Advanced AV Mode")]
    Advanced,
}

impl ProcessingMode {
    pub const ALL: [ProcessingMode; 5] = [
        ProcessingMode::NoEnhancement,
        ProcessingMode::AudioOnly,
        ProcessingMode::Light,
        ProcessingMode::Standard,
        ProcessingMode::Advanced,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.get(usize::try_from(code).ok()?).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            ProcessingMode::NoEnhancement => "No Enhancement Mode",
            ProcessingMode::AudioOnly => "Audio-Only Enhancement Mode",
            ProcessingMode::Light => "Light AV Mode",
            ProcessingMode::Standard => "Standard AV Mode",
            ProcessingMode::Advanced => "Advanced AV Mode",
        }
    }

    /// Thresholds the defuzzified enhancement value.
    /// Bands include their lower bound and exclude their upper bound.
    pub fn from_defuzzified(value: f64) -> Self {
        if value >= 39.0 {
            ProcessingMode::Advanced
        } else if value >= 25.0 {
            ProcessingMode::Standard
        } else if value >= 12.0 {
            ProcessingMode::Light
        } else if value >= 9.0 {
            ProcessingMode::AudioOnly
        } else {
            ProcessingMode::NoEnhancement
        }
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A processing-mode recommendation and the measurement behind it.
///
/// Field names match the decision wire record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub mode: ProcessingMode,
    pub mode_code: u8,
    /// Mean S11 in dB that produced this decision.
    pub s11_mean: f64,
    pub defuzzified_value: f64,
}

impl Decision {
    pub const FALLBACK_S11_DB: f64 = -30.0;
    pub const FALLBACK_DEFUZZIFIED: f64 = 40.0;

    pub fn new(s11_mean: f64, defuzzified_value: f64) -> Self {
        let mode = ProcessingMode::from_defuzzified(defuzzified_value);
        Self {
            mode,
            mode_code: mode.code(),
            s11_mean,
            defuzzified_value,
        }
    }

    /// Worst-case decision used when the link cannot be measured.
    pub fn fallback() -> Self {
        Self {
            mode: ProcessingMode::Advanced,
            mode_code: ProcessingMode::Advanced.code(),
            s11_mean: Self::FALLBACK_S11_DB,
            defuzzified_value: Self::FALLBACK_DEFUZZIFIED,
        }
    }

    /// A record off the wire is only trusted when its code agrees with its label
    /// and its numbers are finite.
    pub fn is_consistent(&self) -> bool {
        self.mode_code == self.mode.code()
            && self.s11_mean.is_finite()
            && self.defuzzified_value.is_finite()
    }

    /// True when `other` differs in mode or code, the only changes worth surfacing.
    pub fn mode_changed(&self, other: &Decision) -> bool {
        self.mode != other.mode || self.mode_code != other.mode_code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_table_boundaries() {
        assert_eq!(ProcessingMode::from_defuzzified(39.0), ProcessingMode::Advanced);
        assert_eq!(ProcessingMode::from_defuzzified(38.999), ProcessingMode::Standard);
        assert_eq!(ProcessingMode::from_defuzzified(25.0), ProcessingMode::Standard);
        assert_eq!(ProcessingMode::from_defuzzified(24.999), ProcessingMode::Light);
        assert_eq!(ProcessingMode::from_defuzzified(12.0), ProcessingMode::Light);
        assert_eq!(ProcessingMode::from_defuzzified(11.999), ProcessingMode::AudioOnly);
        assert_eq!(ProcessingMode::from_defuzzified(9.0), ProcessingMode::AudioOnly);
        assert_eq!(ProcessingMode::from_defuzzified(8.999), ProcessingMode::NoEnhancement);
        assert_eq!(ProcessingMode::from_defuzzified(0.0), ProcessingMode::NoEnhancement);
    }

    #[test]
    fn codes_match_ordinals() {
        for (i, mode) in ProcessingMode::ALL.iter().enumerate() {
            assert_eq!(mode.code() as usize, i);
            assert_eq!(ProcessingMode::from_code(i as i64), Some(*mode));
        }
        assert_eq!(ProcessingMode::from_code(-1), None);
        assert_eq!(ProcessingMode::from_code(5), None);
    }

    #[test]
    fn fallback_is_advanced_worst_case() {
        let d = Decision::fallback();
        assert_eq!(d.mode, ProcessingMode::Advanced);
        assert_eq!(d.mode_code, 4);
        assert_eq!(d.s11_mean, -30.0);
        assert_eq!(d.defuzzified_value, 40.0);
        assert!(d.is_consistent());
    }

    #[test]
    fn wire_record_uses_labels_and_snake_case_fields() {
        let d = Decision::new(-80.0, 3.9);
        let json = serde_json::to_value(d).unwrap();
        assert_eq!(json["mode"], "No Enhancement Mode");
        assert_eq!(json["mode_code"], 0);
        assert_eq!(json["s11_mean"], -80.0);

        let parsed: Decision = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn mismatched_code_is_inconsistent() {
        let raw = r#"{"mode":"Light AV Mode","mode_code":4,"s11_mean":-50.0,"defuzzified_value":12.5}"#;
        let d: Decision = serde_json::from_str(raw).unwrap();
        assert!(!d.is_consistent());
    }
}
