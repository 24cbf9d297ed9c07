use crate::graph::NodeId;
use crate::interpolate::Interpolation;

/// A boundary with a prescribed level; never stores water.
#[derive(Debug, Clone)]
pub struct LevelBoundary {
    pub node_id: NodeId,
    pub active: bool,
    pub level: Interpolation,
}

impl LevelBoundary {
    pub fn level(&self, t: f64) -> f64 {
        self.level.value(t)
    }
}

/// A boundary with a prescribed non-negative inflow, integrated exactly into
/// the receiving basin as a piecewise-constant forcing.
#[derive(Debug, Clone)]
pub struct FlowBoundary {
    pub node_id: NodeId,
    pub active: bool,
    pub flow_rate: Interpolation,

    /// Current constant rate, refreshed at forcing step changes.
    pub current_rate: f64,
    /// Cumulative discharged volume up to the last step change.
    pub cumulative_volume: f64,
    pub t_mark: f64,
}

impl FlowBoundary {
    pub fn new(node_id: NodeId, active: bool, flow_rate: Interpolation) -> Self {
        let current_rate = if active { flow_rate.value(0.0) } else { 0.0 };
        Self {
            node_id,
            active,
            flow_rate,
            current_rate,
            cumulative_volume: 0.0,
            t_mark: 0.0,
        }
    }

    pub fn volume(&self, t: f64) -> f64 {
        self.cumulative_volume + self.current_rate * (t - self.t_mark)
    }

    /// Roll the exact integral forward and install the rate at `t`.
    pub fn apply_forcing_step(&mut self, t: f64) {
        self.cumulative_volume = self.volume(t);
        self.t_mark = t;
        self.current_rate = if self.active { self.flow_rate.value(t) } else { 0.0 };
    }

    /// Breakpoint instants of the flow series up to `end`, for the event
    /// clock.
    pub fn change_times(&self, end: f64) -> Vec<f64> {
        let series = &self.flow_rate;
        if series.xs().len() > 2 || series.ys()[0] != series.ys()[series.ys().len() - 1] || series.is_cyclic() {
            series.breakpoints_within(end)
        } else {
            Vec::new()
        }
    }
}
