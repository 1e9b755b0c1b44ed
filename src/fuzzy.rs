//! Fuzzy controller mapping mean S11 to a processing mode.
//!
//! Three channel-loss sets on the input, five enhancement sets on the output,
//! min/max (Mamdani) inference and centroid defuzzification over a sampled
//! output domain.

use crate::decision::Decision;

/// Four-point trapezoid `[a, b, c, d]`: 0 outside `[a, d]`, 1 on `[b, c]`,
/// linear ramps in between. `a == b` or `c == d` give a vertical edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trapezoid {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
}

impl Trapezoid {
    pub const fn new(a: f64, b: f64, c: f64, d: f64) -> Self {
        Self { a, b, c, d }
    }

    pub fn membership(&self, x: f64) -> f64 {
        let m = if x < self.a || x > self.d {
            0.0
        } else if x < self.b {
            (x - self.a) / (self.b - self.a)
        } else if x <= self.c {
            1.0
        } else {
            (self.d - x) / (self.d - self.c)
        };
        m.clamp(0.0, 1.0)
    }

    /// Distance from `x` to the support `[a, d]`, zero inside it.
    fn distance(&self, x: f64) -> f64 {
        if x < self.a {
            self.a - x
        } else if x > self.d {
            x - self.d
        } else {
            0.0
        }
    }
}

// 信道损耗 (channel loss) 输入集合
pub const CL_LOW: Trapezoid = Trapezoid::new(-85.0, -75.0, -65.0, -60.0);
pub const CL_MID: Trapezoid = Trapezoid::new(-55.0, -50.0, -45.0, -40.0);
pub const CL_HIGH: Trapezoid = Trapezoid::new(-35.0, -30.0, -25.0, -20.0);

// 语音增强 (speech enhancement) 输出集合
pub const SE_NOT_NEEDED: Trapezoid = Trapezoid::new(0.0, 0.0, 5.0, 10.0);
pub const SE_LITTLE: Trapezoid = Trapezoid::new(5.0, 10.0, 15.0, 20.0);
pub const SE_MID: Trapezoid = Trapezoid::new(15.0, 20.0, 25.0, 30.0);
pub const SE_HIGH: Trapezoid = Trapezoid::new(25.0, 30.0, 35.0, 40.0);
pub const SE_VERY_HIGH: Trapezoid = Trapezoid::new(35.0, 40.0, 45.0, 50.0);

pub const INPUT_DOMAIN: (f64, f64) = (-85.0, -25.0);
pub const OUTPUT_DOMAIN: (f64, f64) = (0.0, 46.0);
const OUTPUT_STEP: f64 = 0.01;

/// Result of one inference pass, kept for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct Inference {
    /// Membership of the input in each rule antecedent, in rule order.
    pub memberships: Vec<f64>,
    /// Set when no rule fired and the input was snapped to its nearest set.
    pub snapped_to: Option<usize>,
    pub defuzzified: f64,
}

#[derive(Debug, Clone)]
struct Rule {
    antecedent: Trapezoid,
    consequent: Trapezoid,
}

#[derive(Debug, Clone)]
pub struct FuzzyModeController {
    rules: Vec<Rule>,
    output_grid: Vec<f64>,
}

impl Default for FuzzyModeController {
    fn default() -> Self {
        Self::new()
    }
}

impl FuzzyModeController {
    /// Rule base: Low→NotNeeded, Mid→Little, High→High.
    pub fn new() -> Self {
        let rules = vec![
            Rule { antecedent: CL_LOW, consequent: SE_NOT_NEEDED },
            Rule { antecedent: CL_MID, consequent: SE_LITTLE },
            Rule { antecedent: CL_HIGH, consequent: SE_HIGH },
        ];
        let (lo, hi) = OUTPUT_DOMAIN;
        let steps = ((hi - lo) / OUTPUT_STEP).round() as usize;
        let output_grid = (0..=steps).map(|i| lo + i as f64 * OUTPUT_STEP).collect();
        Self { rules, output_grid }
    }

    /// Maps a mean S11 in dB to a decision. Non-finite input yields the
    /// conservative fallback decision.
    pub fn evaluate(&self, quality_metric_db: f64) -> Decision {
        if !quality_metric_db.is_finite() {
            return Decision::fallback();
        }
        let inference = self.infer(quality_metric_db);
        Decision::new(quality_metric_db, inference.defuzzified)
    }

    pub fn infer(&self, x: f64) -> Inference {
        let mut strengths: Vec<f64> = self.rules.iter().map(|r| r.antecedent.membership(x)).collect();
        let memberships = strengths.clone();

        let mut snapped_to = None;
        if strengths.iter().all(|s| *s <= 0.0) {
            // No rule fires: fire the nearest set instead, ties going to the worse link.
            let mut nearest = 0;
            let mut best = f64::INFINITY;
            for (i, rule) in self.rules.iter().enumerate() {
                let dist = rule.antecedent.distance(x);
                if dist <= best {
                    best = dist;
                    nearest = i;
                }
            }
            strengths[nearest] = 1.0;
            snapped_to = Some(nearest);
        }

        let aggregated: Vec<f64> = self
            .output_grid
            .iter()
            .map(|&y| {
                self.rules
                    .iter()
                    .zip(&strengths)
                    .map(|(rule, &s)| s.min(rule.consequent.membership(y)))
                    .fold(0.0, f64::max)
            })
            .collect();

        let defuzzified = centroid(&self.output_grid, &aggregated)
            .unwrap_or(Decision::FALLBACK_DEFUZZIFIED);

        Inference {
            memberships,
            snapped_to,
            defuzzified,
        }
    }
}

/// Centroid of a piecewise-linear curve sampled at `xs`. `None` when the area is zero.
pub fn centroid(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let mut area = 0.0;
    let mut moment = 0.0;
    for (x, y) in xs.windows(2).zip(ys.windows(2)) {
        let (x1, x2) = (x[0], x[1]);
        let (y1, y2) = (y[0], y[1]);
        let dx = x2 - x1;
        let seg_area = 0.5 * (y1 + y2) * dx;
        if seg_area <= 0.0 {
            continue;
        }
        let seg_centroid = x1 + dx * (y1 + 2.0 * y2) / (3.0 * (y1 + y2));
        area += seg_area;
        moment += seg_area * seg_centroid;
    }
    if area > 0.0 { Some(moment / area) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::ProcessingMode;

    const EPS: f64 = 1e-3;

    #[test]
    fn trapezoid_edges() {
        assert_eq!(CL_LOW.membership(-85.0), 0.0);
        assert_eq!(CL_LOW.membership(-75.0), 1.0);
        assert!((CL_LOW.membership(-62.0) - 0.4).abs() < 1e-9);
        assert_eq!(CL_LOW.membership(-60.0), 0.0);
        assert_eq!(SE_NOT_NEEDED.membership(0.0), 1.0);
        assert_eq!(SE_VERY_HIGH.membership(46.0), 0.8);
    }

    #[test]
    fn centroid_of_rectangle_is_midpoint() {
        let xs = [0.0, 1.0, 2.0, 3.0, 4.0];
        let ys = [1.0, 1.0, 1.0, 1.0, 1.0];
        assert!((centroid(&xs, &ys).unwrap() - 2.0).abs() < 1e-12);
        assert_eq!(centroid(&xs, &[0.0; 5]), None);
    }

    #[test]
    fn good_link_needs_no_enhancement() {
        let controller = FuzzyModeController::new();
        // Low 隶属度 0.5：截顶后面积 4.375，矩 19.2708
        let d = controller.evaluate(-80.0);
        assert_eq!(d.mode, ProcessingMode::NoEnhancement);
        assert_eq!(d.mode_code, 0);
        assert!((d.defuzzified_value - 4.40476).abs() < EPS);

        // Low 完全成立时得到整个 Not Needed 集合的质心
        let d = controller.evaluate(-75.0);
        assert_eq!(d.mode_code, 0);
        assert!((d.defuzzified_value - 3.8889).abs() < EPS);
    }

    #[test]
    fn mid_loss_maps_to_light() {
        let d = FuzzyModeController::new().evaluate(-50.0);
        assert!((d.defuzzified_value - 12.5).abs() < EPS);
        assert_eq!(d.mode, ProcessingMode::Light);
    }

    #[test]
    fn high_loss_maps_to_the_high_set_centroid() {
        // High→High peaks at 32.5, which the threshold table calls Standard AV.
        let d = FuzzyModeController::new().evaluate(-27.0);
        assert!((d.defuzzified_value - 32.5).abs() < EPS);
        assert_eq!(d.mode, ProcessingMode::Standard);
        assert_eq!(d.mode_code, 3);
    }

    #[test]
    fn partial_membership_clips_consequent() {
        let controller = FuzzyModeController::new();
        let inference = controller.infer(-62.0);
        assert!((inference.memberships[0] - 0.4).abs() < 1e-9);
        assert_eq!(inference.snapped_to, None);
        assert_eq!(ProcessingMode::from_defuzzified(inference.defuzzified), ProcessingMode::NoEnhancement);
    }

    #[test]
    fn gap_between_sets_snaps_to_nearest() {
        let controller = FuzzyModeController::new();

        let near_low = controller.infer(-59.0);
        assert_eq!(near_low.snapped_to, Some(0));

        // Equidistant from Low and Mid: the worse link wins.
        let tie = controller.infer(-57.5);
        assert_eq!(tie.snapped_to, Some(1));
        assert!((tie.defuzzified - 12.5).abs() < EPS);

        let outside = controller.infer(-10.0);
        assert_eq!(outside.snapped_to, Some(2));
        assert!((outside.defuzzified - 32.5).abs() < EPS);
    }

    #[test]
    fn every_input_in_domain_yields_a_consistent_code() {
        let controller = FuzzyModeController::new();
        let mut x = INPUT_DOMAIN.0;
        while x <= INPUT_DOMAIN.1 {
            let d = controller.evaluate(x);
            assert!(d.mode_code <= 4);
            assert!(d.defuzzified_value >= OUTPUT_DOMAIN.0 && d.defuzzified_value <= OUTPUT_DOMAIN.1);
            assert_eq!(d.mode, ProcessingMode::from_defuzzified(d.defuzzified_value));
            assert_eq!(d.mode_code, d.mode.code());
            x += 0.25;
        }
    }

    #[test]
    fn worse_link_never_lowers_mode_at_breakpoints() {
        let controller = FuzzyModeController::new();
        let mut breakpoints: Vec<f64> = [CL_LOW, CL_MID, CL_HIGH]
            .iter()
            .flat_map(|t| [t.a, t.b, t.c, t.d])
            .collect();
        breakpoints.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let codes: Vec<u8> = breakpoints.iter().map(|x| controller.evaluate(*x).mode_code).collect();
        for pair in codes.windows(2) {
            assert!(pair[0] <= pair[1], "codes not monotone: {:?}", codes);
        }
    }

    #[test]
    fn non_finite_metric_falls_back() {
        let d = FuzzyModeController::new().evaluate(f64::NAN);
        assert_eq!(d, Decision::fallback());
    }
}
