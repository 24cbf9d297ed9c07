//! Discrete, continuous and PID control.
//!
//! Discrete control watches compound variables through hysteresis thresholds,
//! maps the resulting truth state to a control state, and rewrites the
//! controlled nodes' parameter sets. Continuous control maps one compound
//! variable through a monotone cubic and writes a single scalar every
//! accepted step. PID control lives partly in the ODE state (the integral)
//! and is evaluated inside the right-hand side.

use crate::graph::{NodeId, NodeType};
use crate::interpolate::{Interpolation, PchipInterpolation};
use crate::nodes::{Nodes, NodesError};
use crate::physics::{BasinState, Physics};
use crate::state::ComponentClass;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ControlError {
    #[error("{node}: truth state `{truth_state}` has no entry in the logic mapping")]
    TruthStateNotMapped { node: NodeId, truth_state: String },
    #[error("{node}: control update failed: {source}")]
    Update {
        node: NodeId,
        #[source]
        source: NodesError,
    },
}

/// A resolved observation of one `(node, variable)` pair.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ObservedVariable {
    BasinLevel(usize),
    BasinStorage(usize),
    /// Instantaneous rate of a connector, via its state component class.
    Flow { class: ComponentClass, index: usize },
    LevelBoundaryLevel(usize),
    FlowBoundaryRate(usize),
}

#[derive(Debug, Clone)]
pub struct Subvariable {
    pub listen: ObservedVariable,
    pub weight: f64,
    /// Seconds of forward shift, valid only on time-interpolated sources.
    pub look_ahead: f64,
}

/// Weighted sum of observed subvariables.
#[derive(Debug, Clone, Default)]
pub struct CompoundVariable {
    pub subvariables: Vec<Subvariable>,
}

impl CompoundVariable {
    pub fn evaluate(&self, t: f64, physics: &Physics, nodes: &Nodes, basins: &BasinState) -> f64 {
        self.subvariables
            .iter()
            .map(|sub| {
                let shifted = t + sub.look_ahead;
                let value = match sub.listen {
                    ObservedVariable::BasinLevel(b) => basins.level[b],
                    ObservedVariable::BasinStorage(b) => basins.storage[b],
                    ObservedVariable::Flow { class, index } => {
                        physics.component_value(class, index, t, nodes, basins, &|b: usize| basins.storage[b])
                    }
                    ObservedVariable::LevelBoundaryLevel(i) => nodes.level_boundaries[i].level(shifted),
                    ObservedVariable::FlowBoundaryRate(i) => nodes.flow_boundaries[i].flow_rate.value(shifted),
                };
                sub.weight * value
            })
            .sum()
    }
}

/// One hysteresis condition on a compound variable: flips true crossing
/// `high` upward, back to false crossing `low` downward.
#[derive(Debug, Clone)]
pub struct Condition {
    pub variable: usize,
    pub threshold_low: Interpolation,
    pub threshold_high: Interpolation,
}

impl Condition {
    fn next_truth(&self, currently_true: bool, value: f64, t: f64) -> bool {
        if currently_true {
            value >= self.threshold_low.value(t)
        } else {
            value > self.threshold_high.value(t)
        }
    }
}

/// A control transition, appended to the control record stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlTransition {
    pub t: f64,
    pub node_id: NodeId,
    pub truth_state: String,
    pub control_state: String,
}

#[derive(Debug, Clone)]
pub struct DiscreteControl {
    pub node_id: NodeId,
    pub variables: Vec<CompoundVariable>,
    /// Conditions in fixed order; their truth values concatenate to the
    /// truth state.
    pub conditions: Vec<Condition>,
    /// Truth-state string (e.g. `"TF"`) → control state.
    pub logic: HashMap<String, String>,
    pub controlled_nodes: Vec<NodeId>,

    // Mutable run state.
    pub truth_state: Vec<bool>,
    pub control_state: Option<String>,
}

fn truth_key(truth: &[bool]) -> String {
    truth.iter().map(|&b| if b { 'T' } else { 'F' }).collect()
}

impl DiscreteControl {
    /// Evaluate all thresholds and, when the truth state changed, look up and
    /// apply the new control state. Returns the transition if one occurred.
    pub fn update(
        &mut self,
        t: f64,
        physics: &Physics,
        nodes: &mut Nodes,
        basins: &BasinState,
    ) -> Result<Option<ControlTransition>, ControlError> {
        let values: Vec<f64> = self
            .variables
            .iter()
            .map(|v| v.evaluate(t, physics, nodes, basins))
            .collect();

        let initial = self.truth_state.is_empty();
        let mut truth = Vec::with_capacity(self.conditions.len());
        for (c, condition) in self.conditions.iter().enumerate() {
            let currently_true = !initial && self.truth_state[c];
            truth.push(condition.next_truth(currently_true, values[condition.variable], t));
        }

        if !initial && truth == self.truth_state {
            return Ok(None);
        }

        let key = truth_key(&truth);
        let control_state = self
            .logic
            .get(&key)
            .ok_or_else(|| ControlError::TruthStateNotMapped {
                node: self.node_id,
                truth_state: key.clone(),
            })?
            .clone();
        self.truth_state = truth;

        if self.control_state.as_deref() == Some(control_state.as_str()) {
            // Truth bits moved within the same control state; no update.
            return Ok(None);
        }

        for target in &self.controlled_nodes {
            nodes
                .apply_control_state(target, &control_state)
                .map_err(|source| ControlError::Update {
                    node: self.node_id,
                    source,
                })?;
        }
        self.control_state = Some(control_state.clone());

        Ok(Some(ControlTransition {
            t,
            node_id: self.node_id,
            truth_state: key,
            control_state,
        }))
    }
}

/// A controlled scalar write, appended to the controlled-flow record stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlledValue {
    pub t: f64,
    pub node_id: NodeId,
    pub value: f64,
}

#[derive(Debug, Clone)]
pub struct ContinuousControl {
    pub node_id: NodeId,
    pub variable: CompoundVariable,
    pub function: PchipInterpolation,
    pub target: NodeId,
    pub parameter: String,
}

impl ContinuousControl {
    /// Returns the written value and whether it materially changed the
    /// controlled parameter.
    pub fn update(
        &self,
        t: f64,
        physics: &Physics,
        nodes: &mut Nodes,
        basins: &BasinState,
    ) -> Result<(ControlledValue, bool), ControlError> {
        let input = self.variable.evaluate(t, physics, nodes, basins);
        let output = self.function.value(input);
        let previous = nodes.get_scalar(&self.target, &self.parameter);
        nodes
            .set_scalar(&self.target, &self.parameter, output)
            .map_err(|source| ControlError::Update {
                node: self.node_id,
                source,
            })?;
        let changed = previous.map(|p| (p - output).abs() > 1e-12).unwrap_or(true);
        Ok((
            ControlledValue {
                t,
                node_id: self.target,
                value: output,
            },
            changed,
        ))
    }
}

#[derive(Debug, Clone)]
pub struct PidControl {
    pub node_id: NodeId,
    pub active: bool,
    pub listen_basin: usize,
    /// The pump or outlet receiving the control output.
    pub target: NodeId,
    /// `+1` when the target discharges into the listened basin, `−1` when it
    /// drains it.
    pub sign: f64,
    pub setpoint: Interpolation,
    pub proportional: Interpolation,
    pub integral: Interpolation,
    pub derivative: Interpolation,
}

/// All control nodes of a model.
#[derive(Debug, Clone, Default)]
pub struct ControlSet {
    pub discrete: Vec<DiscreteControl>,
    pub continuous: Vec<ContinuousControl>,
    pub pids: Vec<PidControl>,
}

impl ControlSet {
    /// The discrete-control callback plus the per-step continuous writes.
    /// Returns the transitions and controlled values to record, and whether
    /// any parameter changed (which invalidates integrator history).
    pub fn apply(
        &mut self,
        t: f64,
        physics: &Physics,
        nodes: &mut Nodes,
        basins: &BasinState,
    ) -> Result<(Vec<ControlTransition>, Vec<ControlledValue>, bool), ControlError> {
        let mut transitions = Vec::new();
        for control in &mut self.discrete {
            if let Some(transition) = control.update(t, physics, nodes, basins)? {
                transitions.push(transition);
            }
        }
        let mut values = Vec::new();
        let mut continuous_changed = false;
        for control in &self.continuous {
            let (value, changed) = control.update(t, physics, nodes, basins)?;
            continuous_changed |= changed;
            values.push(value);
        }
        let changed = !transitions.is_empty() || continuous_changed;
        Ok((transitions, values, changed))
    }

    /// Pump/outlet indices driven by a PID controller, marked on the nodes
    /// at build time.
    pub fn mark_pid_targets(&self, nodes: &mut Nodes) {
        for pid in &self.pids {
            if let Some(pump) = nodes.pump_like_mut(&pid.target) {
                pump.pid_controlled = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Graph, LinkType};
    use crate::nodes::{Basin, BasinProfile, Forcings, Pump, PumpParams};
    use float_cmp::assert_approx_eq;

    /// Basin watched by a discrete control driving a pump on/off.
    fn hysteresis_setup() -> (Physics, Nodes, DiscreteControl) {
        let mut graph = Graph::default();
        let b = graph.add_node(NodeType::Basin, 1, None, None).unwrap();
        let p = graph.add_node(NodeType::Pump, 2, None, None).unwrap();
        let t = graph.add_node(NodeType::Terminal, 3, None, None).unwrap();
        let dc = graph.add_node(NodeType::DiscreteControl, 4, None, None).unwrap();
        graph.add_link(1, b, p, LinkType::Flow).unwrap();
        graph.add_link(2, p, t, LinkType::Flow).unwrap();
        graph.add_link(3, dc, p, LinkType::Control).unwrap();

        let mut nodes = Nodes::default();
        let id = NodeId::new(NodeType::Basin, 1, 0);
        let profile = BasinProfile::new(id, vec![0.0, 2.0], vec![100.0, 100.0]).unwrap();
        nodes.basins.push(Basin::new(id, profile, Forcings::default(), 0.5));
        let off = PumpParams {
            active: true,
            flow_rate: Interpolation::constant(0.0),
            min_flow_rate: 0.0,
            max_flow_rate: f64::INFINITY,
            min_upstream_level: None,
        };
        let mut on = off.clone();
        on.flow_rate = Interpolation::constant(1.0);
        let mut control_states = HashMap::new();
        control_states.insert("off".to_string(), off.clone());
        control_states.insert("on".to_string(), on);
        nodes.pumps.push(Pump {
            node_id: NodeId::new(NodeType::Pump, 2, 0),
            params: off,
            control_states,
            allocation_controlled: false,
            pid_controlled: false,
            commanded_flow_rate: None,
        });
        nodes.basin_boundary_inflows = vec![Vec::new()];

        let physics = Physics::new(&graph).unwrap();

        let mut logic = HashMap::new();
        logic.insert("T".to_string(), "on".to_string());
        logic.insert("F".to_string(), "off".to_string());
        let control = DiscreteControl {
            node_id: NodeId::new(NodeType::DiscreteControl, 4, 0),
            variables: vec![CompoundVariable {
                subvariables: vec![Subvariable {
                    listen: ObservedVariable::BasinLevel(0),
                    weight: 1.0,
                    look_ahead: 0.0,
                }],
            }],
            conditions: vec![Condition {
                variable: 0,
                threshold_low: Interpolation::constant(0.8),
                threshold_high: Interpolation::constant(1.0),
            }],
            logic,
            controlled_nodes: vec![NodeId::new(NodeType::Pump, 2, 0)],
            truth_state: Vec::new(),
            control_state: None,
        };
        (physics, nodes, control)
    }

    fn set_level(physics: &Physics, nodes: &Nodes, basins: &mut BasinState, level: f64) {
        // Storage offset via the pump's cumulative flow component.
        let comp = physics.layout.index(ComponentClass::Pump, 0);
        let mut u = vec![0.0; physics.layout.len()];
        u[comp] = nodes.basins[0].initial_storage - 100.0 * level;
        physics.update_basins(0.0, &u, nodes, basins);
    }

    #[test]
    fn hysteresis_band_keeps_state() {
        let (physics, mut nodes, mut control) = hysteresis_setup();
        let mut basins = BasinState::new(&physics.layout);

        // Start below the low threshold: pump off.
        set_level(&physics, &nodes, &mut basins, 0.5);
        let transition = control.update(0.0, &physics, &mut nodes, &basins).unwrap().unwrap();
        assert_eq!(transition.control_state, "off");
        assert_eq!(transition.truth_state, "F");
        assert_approx_eq!(f64, nodes.pumps[0].target_flow_rate(0.0), 0.0);

        // Rising above the high threshold turns it on.
        set_level(&physics, &nodes, &mut basins, 1.1);
        let transition = control.update(1.0, &physics, &mut nodes, &basins).unwrap().unwrap();
        assert_eq!(transition.control_state, "on");
        assert_approx_eq!(f64, nodes.pumps[0].target_flow_rate(1.0), 1.0);

        // Falling to 0.9 stays in the hysteresis band: still on.
        set_level(&physics, &nodes, &mut basins, 0.9);
        assert!(control.update(2.0, &physics, &mut nodes, &basins).unwrap().is_none());
        assert_approx_eq!(f64, nodes.pumps[0].target_flow_rate(2.0), 1.0);

        // Crossing the low threshold downward turns it off.
        set_level(&physics, &nodes, &mut basins, 0.7);
        let transition = control.update(3.0, &physics, &mut nodes, &basins).unwrap().unwrap();
        assert_eq!(transition.control_state, "off");
        assert_approx_eq!(f64, nodes.pumps[0].target_flow_rate(3.0), 0.0);
    }

    #[test]
    fn unmapped_truth_state_is_an_error() {
        let (physics, mut nodes, mut control) = hysteresis_setup();
        control.logic.remove("F");
        let mut basins = BasinState::new(&physics.layout);
        set_level(&physics, &nodes, &mut basins, 0.5);
        let err = control.update(0.0, &physics, &mut nodes, &basins).unwrap_err();
        assert!(matches!(err, ControlError::TruthStateNotMapped { .. }));
    }
}
