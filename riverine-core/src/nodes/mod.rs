//! The parameter store: one flat container per node class, indexed by the
//! dense per-type position in [`crate::graph::NodeId::index`].
//!
//! Structural data is immutable after construction; the explicitly mutable
//! fields (control overrides, allocation-driven flow rates, cumulative
//! counters) are written only from callbacks or allocation writeback.

pub mod basin;
pub mod boundary;
pub mod connector;
pub mod demand;

pub use basin::{Basin, BasinProfile, ForcingIntegral, ForcingKind, Forcings, ProfileError, SubgridElement};
pub use boundary::{FlowBoundary, LevelBoundary};
pub use connector::{
    LinearResistance, LinearResistanceParams, ManningResistance, ManningResistanceParams, Pump, PumpParams,
    RatingCurveParams, TabulatedRatingCurve,
};
pub use demand::{FlowDemand, LevelDemand, LevelDemandSeries, UserDemand};

use crate::graph::{NodeId, NodeType};
use ndarray::Array2;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum NodesError {
    #[error("node {0} is not controllable")]
    NotControllable(NodeId),
    #[error("node {0} has no parameter `{1}`")]
    NoSuchParameter(NodeId, String),
}

#[derive(Debug, Clone, Default)]
pub struct Nodes {
    pub basins: Vec<Basin>,
    pub linear_resistances: Vec<LinearResistance>,
    pub manning_resistances: Vec<ManningResistance>,
    pub rating_curves: Vec<TabulatedRatingCurve>,
    pub pumps: Vec<Pump>,
    pub outlets: Vec<Pump>,
    pub level_boundaries: Vec<LevelBoundary>,
    pub flow_boundaries: Vec<FlowBoundary>,
    pub user_demands: Vec<UserDemand>,
    pub flow_demands: Vec<FlowDemand>,
    pub level_demands: Vec<LevelDemand>,

    /// Per basin index, the flow-boundary indices discharging into it.
    pub basin_boundary_inflows: Vec<Vec<usize>>,
    /// The ascending, deduplicated demand priorities across all demand nodes.
    pub demand_priorities: Vec<i32>,
}

impl Nodes {
    /// Re-read piecewise-constant forcings at `t` and roll the exact
    /// integrals forward. Runs inside the forcing-change callback only.
    pub fn apply_forcing_step(&mut self, t: f64) {
        for boundary in &mut self.flow_boundaries {
            boundary.apply_forcing_step(t);
        }
        for (basin_index, basin) in self.basins.iter_mut().enumerate() {
            basin.apply_forcing_step(t);
            let boundary_rate: f64 = self.basin_boundary_inflows[basin_index]
                .iter()
                .map(|&b| self.flow_boundaries[b].current_rate)
                .sum();
            basin.exact_inflow.rate += boundary_rate;
        }
    }

    /// All forcing step-change instants up to `end`, for the event clock.
    pub fn forcing_change_times(&self, end: f64) -> Vec<f64> {
        let mut times = Vec::new();
        for basin in &self.basins {
            times.extend(basin.forcings.change_times(end));
        }
        for boundary in &self.flow_boundaries {
            times.extend(boundary.change_times(end));
        }
        times.sort_by(|a, b| a.total_cmp(b));
        times.dedup();
        times
    }

    /// Switch a controlled node to a named control state. Nodes without a
    /// parameter set for the state keep their current parameters; that makes
    /// re-application idempotent.
    pub fn apply_control_state(&mut self, target: &NodeId, state: &str) -> Result<(), NodesError> {
        match target.node_type {
            NodeType::LinearResistance => self.linear_resistances[target.index].apply_control_state(state),
            NodeType::ManningResistance => self.manning_resistances[target.index].apply_control_state(state),
            NodeType::TabulatedRatingCurve => self.rating_curves[target.index].apply_control_state(state),
            NodeType::Pump => self.pumps[target.index].apply_control_state(state),
            NodeType::Outlet => self.outlets[target.index].apply_control_state(state),
            _ => return Err(NodesError::NotControllable(*target)),
        }
        Ok(())
    }

    /// Read back a controlled scalar, for change detection.
    pub fn get_scalar(&self, target: &NodeId, parameter: &str) -> Option<f64> {
        match (target.node_type, parameter) {
            (NodeType::Pump, "flow_rate") => self.pumps[target.index].commanded_flow_rate,
            (NodeType::Outlet, "flow_rate") => self.outlets[target.index].commanded_flow_rate,
            (NodeType::LinearResistance, "resistance") => Some(self.linear_resistances[target.index].params.resistance),
            (NodeType::ManningResistance, "manning_n") => Some(self.manning_resistances[target.index].params.manning_n),
            _ => None,
        }
    }

    /// Write one scalar parameter of a controlled node, as driven by
    /// continuous control.
    pub fn set_scalar(&mut self, target: &NodeId, parameter: &str, value: f64) -> Result<(), NodesError> {
        match (target.node_type, parameter) {
            (NodeType::Pump, "flow_rate") => {
                self.pumps[target.index].commanded_flow_rate = Some(value);
            }
            (NodeType::Outlet, "flow_rate") => {
                self.outlets[target.index].commanded_flow_rate = Some(value);
            }
            (NodeType::LinearResistance, "resistance") => {
                self.linear_resistances[target.index].params.resistance = value;
            }
            (NodeType::ManningResistance, "manning_n") => {
                self.manning_resistances[target.index].params.manning_n = value;
            }
            _ => return Err(NodesError::NoSuchParameter(*target, parameter.to_string())),
        }
        Ok(())
    }

    pub fn priority_index(&self, priority: i32) -> Option<usize> {
        self.demand_priorities.binary_search(&priority).ok()
    }

    /// The `has_demand_priority` bit matrix over all demand nodes: users
    /// first, then flow demands, then level demands, one column per global
    /// priority. Row offsets come from [`Nodes::demand_row`].
    pub fn demand_priority_matrix(&self) -> Array2<bool> {
        let rows = self.user_demands.len() + self.flow_demands.len() + self.level_demands.len();
        let mut matrix = Array2::from_elem((rows, self.demand_priorities.len()), false);
        for p in 0..self.demand_priorities.len() {
            for (i, user) in self.user_demands.iter().enumerate() {
                matrix[(i, p)] = user.has_priority(p);
            }
            for (i, demand) in self.flow_demands.iter().enumerate() {
                matrix[(self.user_demands.len() + i, p)] = demand.has_priority(p);
            }
            for (i, demand) in self.level_demands.iter().enumerate() {
                matrix[(self.user_demands.len() + self.flow_demands.len() + i, p)] = demand.has_priority(p);
            }
        }
        matrix
    }

    /// Row of a demand node in the [`Nodes::demand_priority_matrix`].
    pub fn demand_row(&self, node: &NodeId) -> Option<usize> {
        match node.node_type {
            NodeType::UserDemand => Some(node.index),
            NodeType::FlowDemand => Some(self.user_demands.len() + node.index),
            NodeType::LevelDemand => Some(self.user_demands.len() + self.flow_demands.len() + node.index),
            _ => None,
        }
    }

    /// Pump or outlet lookup for the two node classes sharing a container.
    pub fn pump_like(&self, node: &NodeId) -> Option<&Pump> {
        match node.node_type {
            NodeType::Pump => self.pumps.get(node.index),
            NodeType::Outlet => self.outlets.get(node.index),
            _ => None,
        }
    }

    pub fn pump_like_mut(&mut self, node: &NodeId) -> Option<&mut Pump> {
        match node.node_type {
            NodeType::Pump => self.pumps.get_mut(node.index),
            NodeType::Outlet => self.outlets.get_mut(node.index),
            _ => None,
        }
    }
}
