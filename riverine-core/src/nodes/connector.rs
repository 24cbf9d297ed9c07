//! Hydraulic connector nodes: resistances, rating curves, pumps and outlets.
//!
//! Each node owns its current parameter set plus per-control-state variants;
//! applying a control state is an idempotent rewrite of the current set. Flow
//! laws are generic over [`Scalar`] so the same code path yields plain values
//! and dual-number derivatives.

use crate::graph::NodeId;
use crate::interpolate::Interpolation;
use crate::math::{Scalar, reduction_factor, relaxed_root};
use std::collections::HashMap;

/// Threshold below which `relaxed_root` replaces the square root in the
/// Manning law, in head-slope units.
const MANNING_RELAXATION: f64 = 1e-5;

/// Head span over which an outlet fades out as its upstream level drops to
/// the crest.
const CREST_FADE_BAND: f64 = 0.1;

#[derive(Debug, Clone, Copy)]
pub struct LinearResistanceParams {
    pub active: bool,
    pub resistance: f64,
    pub max_flow_rate: f64,
}

#[derive(Debug, Clone)]
pub struct LinearResistance {
    pub node_id: NodeId,
    pub params: LinearResistanceParams,
    pub control_states: HashMap<String, LinearResistanceParams>,
}

impl LinearResistance {
    /// `q = Δh / R`, clipped to the configured symmetric capacity.
    pub fn flow<S: Scalar>(&self, h_up: S, h_dn: S) -> S {
        if !self.params.active {
            return S::constant(0.0);
        }
        let q = (h_up - h_dn) / self.params.resistance;
        q.clamp(-self.params.max_flow_rate, self.params.max_flow_rate)
    }

    pub fn apply_control_state(&mut self, state: &str) {
        if let Some(params) = self.control_states.get(state) {
            self.params = *params;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ManningResistanceParams {
    pub active: bool,
    pub length: f64,
    pub manning_n: f64,
    pub profile_width: f64,
    pub profile_slope: f64,
}

/// Open-channel reach with a trapezoidal cross-section solved by the Manning
/// formula. Bed elevations at the two ends are resolved once from the
/// neighbouring basin bottoms.
#[derive(Debug, Clone)]
pub struct ManningResistance {
    pub node_id: NodeId,
    pub params: ManningResistanceParams,
    pub bed_up: f64,
    pub bed_dn: f64,
    pub control_states: HashMap<String, ManningResistanceParams>,
}

impl ManningResistance {
    fn section<S: Scalar>(&self, depth: S) -> (S, S) {
        let z = self.params.profile_slope;
        let width = self.params.profile_width;
        let area = depth * (depth * z + width);
        let perimeter = depth * 2.0 * (1.0 + z * z).sqrt() + width;
        (area, perimeter)
    }

    /// Manning formula with the head-slope square root replaced by
    /// `relaxed_root` so the derivative stays bounded at `Δh = 0`.
    pub fn flow<S: Scalar>(&self, h_up: S, h_dn: S) -> S {
        if !self.params.active {
            return S::constant(0.0);
        }
        let depth_up = (h_up - self.bed_up).max(S::constant(0.0));
        let depth_dn = (h_dn - self.bed_dn).max(S::constant(0.0));
        let (area_up, perimeter_up) = self.section(depth_up);
        let (area_dn, perimeter_dn) = self.section(depth_dn);

        let area = (area_up + area_dn) * 0.5;
        if area.value() <= 0.0 {
            return S::constant(0.0);
        }
        let radius_up = area_up / (perimeter_up + 1e-12);
        let radius_dn = area_dn / (perimeter_dn + 1e-12);
        let radius = (radius_up + radius_dn) * 0.5;

        let slope = (h_up - h_dn) / self.params.length;
        let conveyance = area * (radius * radius).cbrt() / self.params.manning_n;
        conveyance * relaxed_root(slope, MANNING_RELAXATION)
    }

    pub fn apply_control_state(&mut self, state: &str) {
        if let Some(params) = self.control_states.get(state) {
            self.params = *params;
        }
    }
}

#[derive(Debug, Clone)]
pub struct RatingCurveParams {
    pub active: bool,
    /// Piecewise-linear `q(h_up)`: constant below the table, linear above.
    pub table: Interpolation,
}

#[derive(Debug, Clone)]
pub struct TabulatedRatingCurve {
    pub node_id: NodeId,
    pub params: RatingCurveParams,
    pub control_states: HashMap<String, RatingCurveParams>,
}

impl TabulatedRatingCurve {
    pub fn flow<S: Scalar>(&self, h_up: S) -> S {
        if !self.params.active {
            return S::constant(0.0);
        }
        let (value, slope) = self.params.table.value_and_derivative(h_up.value());
        h_up.chain(value, slope)
    }

    pub fn apply_control_state(&mut self, state: &str) {
        if let Some(params) = self.control_states.get(state) {
            self.params = params.clone();
        }
    }
}

#[derive(Debug, Clone)]
pub struct PumpParams {
    pub active: bool,
    pub flow_rate: Interpolation,
    pub min_flow_rate: f64,
    pub max_flow_rate: f64,
    /// Outlets only: flow fades out as the upstream level drops to this crest.
    pub min_upstream_level: Option<f64>,
}

/// Pump and Outlet share one container; the direction of gravity is the only
/// behavioural difference and it lives in the crest fade.
#[derive(Debug, Clone)]
pub struct Pump {
    pub node_id: NodeId,
    pub params: PumpParams,
    pub control_states: HashMap<String, PumpParams>,
    /// True when an allocation network commands this node.
    pub allocation_controlled: bool,
    /// True when a PidControl node drives this node; the commanded rate is
    /// then computed inside the RHS instead of read from parameters.
    pub pid_controlled: bool,

    // Mutable run state, written from allocation writeback or control only.
    /// Override installed by allocation writeback or continuous control.
    pub commanded_flow_rate: Option<f64>,
}

impl Pump {
    /// The currently commanded rate, before any availability reduction.
    pub fn target_flow_rate(&self, t: f64) -> f64 {
        if !self.params.active {
            return 0.0;
        }
        let rate = self.commanded_flow_rate.unwrap_or_else(|| self.params.flow_rate.value(t));
        rate.clamp(self.params.min_flow_rate, self.params.max_flow_rate)
    }

    /// Availability factor: smooth shutdown near an empty upstream basin and,
    /// for outlets, near the crest level.
    pub fn availability<S: Scalar>(&self, storage_up: Option<S>, level_up: Option<S>, low_storage_threshold: f64) -> S {
        let mut factor = match storage_up {
            Some(storage) => reduction_factor(storage, low_storage_threshold),
            None => S::constant(1.0),
        };
        if let (Some(crest), Some(level)) = (self.params.min_upstream_level, level_up) {
            factor = factor * reduction_factor(level - crest, CREST_FADE_BAND);
        }
        factor
    }

    pub fn flow<S: Scalar>(
        &self,
        t: f64,
        storage_up: Option<S>,
        level_up: Option<S>,
        low_storage_threshold: f64,
    ) -> S {
        self.availability(storage_up, level_up, low_storage_threshold) * self.target_flow_rate(t)
    }

    pub fn apply_control_state(&mut self, state: &str) {
        if let Some(params) = self.control_states.get(state) {
            self.params = params.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeType;
    use crate::interpolate::Extrapolation;
    use crate::math::Dual;
    use float_cmp::assert_approx_eq;

    fn linear_resistance(resistance: f64, max_flow_rate: f64) -> LinearResistance {
        LinearResistance {
            node_id: NodeId::new(NodeType::LinearResistance, 1, 0),
            params: LinearResistanceParams {
                active: true,
                resistance,
                max_flow_rate,
            },
            control_states: HashMap::new(),
        }
    }

    #[test]
    fn linear_resistance_flow_and_clip() {
        let node = linear_resistance(2.0, 0.4);
        assert_approx_eq!(f64, node.flow(1.0, 0.0), 0.4); // clipped from 0.5
        assert_approx_eq!(f64, node.flow(0.5, 0.0), 0.25);
        assert_approx_eq!(f64, node.flow(0.0, 1.5), -0.4); // clipped reverse
    }

    #[test]
    fn linear_resistance_derivative() {
        let node = linear_resistance(4.0, f64::INFINITY);
        let q = node.flow(Dual::variable(1.0), Dual::constant(0.25));
        assert_approx_eq!(f64, q.re, 0.1875);
        assert_approx_eq!(f64, q.eps, 0.25);
    }

    #[test]
    fn manning_flow_is_odd_and_smooth_at_zero_head() {
        let node = ManningResistance {
            node_id: NodeId::new(NodeType::ManningResistance, 1, 0),
            params: ManningResistanceParams {
                active: true,
                length: 1000.0,
                manning_n: 0.04,
                profile_width: 5.0,
                profile_slope: 1.0,
            },
            bed_up: 0.0,
            bed_dn: 0.0,
            control_states: HashMap::new(),
        };
        let forward = node.flow(1.2, 1.0);
        let backward = node.flow(1.0, 1.2);
        assert!(forward > 0.0);
        assert_approx_eq!(f64, forward, -backward, epsilon = 1e-9);

        let at_zero = node.flow(Dual::variable(1.0), Dual::constant(1.0));
        assert_approx_eq!(f64, at_zero.re, 0.0);
        assert!(at_zero.eps.is_finite());
    }

    #[test]
    fn rating_curve_extrapolation() {
        let table = Interpolation::new(
            vec![1.0, 2.0],
            vec![0.0, 10.0],
            Extrapolation::Constant,
            Extrapolation::Linear,
        )
        .unwrap();
        let node = TabulatedRatingCurve {
            node_id: NodeId::new(NodeType::TabulatedRatingCurve, 1, 0),
            params: RatingCurveParams { active: true, table },
            control_states: HashMap::new(),
        };
        assert_approx_eq!(f64, node.flow(0.5), 0.0); // constant below
        assert_approx_eq!(f64, node.flow(1.5), 5.0);
        assert_approx_eq!(f64, node.flow(3.0), 20.0); // linear above

        let q = node.flow(Dual::variable(1.5));
        assert_approx_eq!(f64, q.eps, 10.0);
    }

    #[test]
    fn pump_low_storage_shutdown() {
        let pump = Pump {
            node_id: NodeId::new(NodeType::Pump, 1, 0),
            params: PumpParams {
                active: true,
                flow_rate: Interpolation::constant(1.0),
                min_flow_rate: 0.0,
                max_flow_rate: f64::INFINITY,
                min_upstream_level: None,
            },
            control_states: HashMap::new(),
            allocation_controlled: false,
            pid_controlled: false,
            commanded_flow_rate: None,
        };
        let threshold = 10.0;
        assert_approx_eq!(f64, pump.flow(0.0, Some(0.0), None, threshold), 0.0);
        assert_approx_eq!(f64, pump.flow(0.0, Some(5.0), None, threshold), 0.5);
        assert_approx_eq!(f64, pump.flow(0.0, Some(20.0), None, threshold), 1.0);
    }

    #[test]
    fn commanded_rate_overrides_interpolation() {
        let mut pump = Pump {
            node_id: NodeId::new(NodeType::Pump, 1, 0),
            params: PumpParams {
                active: true,
                flow_rate: Interpolation::constant(1.0),
                min_flow_rate: 0.0,
                max_flow_rate: 0.8,
                min_upstream_level: None,
            },
            control_states: HashMap::new(),
            allocation_controlled: true,
            pid_controlled: false,
            commanded_flow_rate: None,
        };
        assert_approx_eq!(f64, pump.target_flow_rate(0.0), 0.8); // clamped
        pump.commanded_flow_rate = Some(0.3);
        assert_approx_eq!(f64, pump.target_flow_rate(0.0), 0.3);
    }
}
