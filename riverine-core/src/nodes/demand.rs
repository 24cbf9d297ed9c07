//! Demand nodes: water users and flow/level targets for allocation.

use crate::graph::NodeId;
use crate::interpolate::Interpolation;
use crate::math::{Scalar, reduction_factor};

/// Head span over which a user demand fades out as the source level drops to
/// the user's minimum abstraction level.
const MIN_LEVEL_FADE_BAND: f64 = 0.1;

/// A user abstracting water at prioritized demands and returning a fraction
/// downstream. The inflow side behaves like any other connector; the outflow
/// carries `return_factor · q`.
#[derive(Debug, Clone)]
pub struct UserDemand {
    pub node_id: NodeId,
    pub active: bool,
    /// One demand series per global priority; `None` when this user has no
    /// demand at that priority.
    pub demands: Vec<Option<Interpolation>>,
    pub return_factor: Interpolation,
    pub min_level: Interpolation,

    // Mutable run state.
    /// Allocated flow per global priority, written by allocation writeback.
    /// Starts as `f64::INFINITY` so an unallocated run follows raw demand.
    pub allocated: Vec<f64>,
}

impl UserDemand {
    pub fn has_priority(&self, priority_index: usize) -> bool {
        self.demands.get(priority_index).map(|d| d.is_some()).unwrap_or(false)
    }

    pub fn demand(&self, priority_index: usize, t: f64) -> f64 {
        match self.demands.get(priority_index) {
            Some(Some(series)) => series.value(t),
            _ => 0.0,
        }
    }

    /// Total abstraction request at `t`: each priority's demand clipped by
    /// the allocated volume rate.
    pub fn requested_flow(&self, t: f64) -> f64 {
        self.demands
            .iter()
            .enumerate()
            .filter_map(|(p, series)| series.as_ref().map(|s| s.value(t).min(self.allocated[p])))
            .sum()
    }

    /// Inflow after availability reductions: low upstream storage and the
    /// minimum abstraction level both fade the intake smoothly.
    pub fn inflow<S: Scalar>(
        &self,
        t: f64,
        storage_up: Option<S>,
        level_up: Option<S>,
        low_storage_threshold: f64,
    ) -> S {
        if !self.active {
            return S::constant(0.0);
        }
        let mut factor = match storage_up {
            Some(storage) => reduction_factor(storage, low_storage_threshold),
            None => S::constant(1.0),
        };
        if let Some(level) = level_up {
            let min_level = self.min_level.value(t);
            factor = factor * reduction_factor(level - min_level, MIN_LEVEL_FADE_BAND);
        }
        factor * self.requested_flow(t)
    }

    pub fn return_factor(&self, t: f64) -> f64 {
        self.return_factor.value(t)
    }
}

/// A minimum-flow target on a connector, expressed per priority.
#[derive(Debug, Clone)]
pub struct FlowDemand {
    pub node_id: NodeId,
    /// The connector node this demand constrains (via a control link).
    pub target: NodeId,
    pub demands: Vec<Option<Interpolation>>,
}

impl FlowDemand {
    pub fn has_priority(&self, priority_index: usize) -> bool {
        self.demands.get(priority_index).map(|d| d.is_some()).unwrap_or(false)
    }

    pub fn demand(&self, priority_index: usize, t: f64) -> f64 {
        match self.demands.get(priority_index) {
            Some(Some(series)) => series.value(t),
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LevelDemandSeries {
    pub min_level: Option<Interpolation>,
    pub max_level: Option<Interpolation>,
}

/// A storage band target on a basin, expressed per priority.
#[derive(Debug, Clone)]
pub struct LevelDemand {
    pub node_id: NodeId,
    /// The basin this demand constrains (via a control link).
    pub target: NodeId,
    pub demands: Vec<Option<LevelDemandSeries>>,
}

impl LevelDemand {
    pub fn has_priority(&self, priority_index: usize) -> bool {
        self.demands.get(priority_index).map(|d| d.is_some()).unwrap_or(false)
    }

    pub fn min_level(&self, priority_index: usize, t: f64) -> Option<f64> {
        self.demands
            .get(priority_index)
            .and_then(|d| d.as_ref())
            .and_then(|d| d.min_level.as_ref())
            .map(|s| s.value(t))
    }

    pub fn max_level(&self, priority_index: usize, t: f64) -> Option<f64> {
        self.demands
            .get(priority_index)
            .and_then(|d| d.as_ref())
            .and_then(|d| d.max_level.as_ref())
            .map(|s| s.value(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeType;
    use float_cmp::assert_approx_eq;

    fn user() -> UserDemand {
        UserDemand {
            node_id: NodeId::new(NodeType::UserDemand, 1, 0),
            active: true,
            demands: vec![Some(Interpolation::constant(0.1)), None, Some(Interpolation::constant(0.2))],
            return_factor: Interpolation::constant(0.5),
            min_level: Interpolation::constant(f64::NEG_INFINITY),
            allocated: vec![f64::INFINITY; 3],
        }
    }

    #[test]
    fn requested_flow_sums_allocated_priorities() {
        let mut node = user();
        assert_approx_eq!(f64, node.requested_flow(0.0), 0.3);
        node.allocated = vec![0.05, 0.0, 1.0];
        assert_approx_eq!(f64, node.requested_flow(0.0), 0.25);
    }

    #[test]
    fn inflow_fades_with_storage() {
        let node = user();
        let q: f64 = node.inflow(0.0, Some(5.0), None, 10.0);
        assert_approx_eq!(f64, q, 0.3 * 0.5);
        let full: f64 = node.inflow(0.0, Some(100.0), None, 10.0);
        assert_approx_eq!(f64, full, 0.3);
    }

    #[test]
    fn priority_bits() {
        let node = user();
        assert!(node.has_priority(0));
        assert!(!node.has_priority(1));
        assert!(node.has_priority(2));
        assert!(!node.has_priority(7));
    }
}
