//! Batch startup validation.
//!
//! Every check runs over the whole schema and all failures are reported in
//! one batch before aborting; no error is silently ignored. Build-phase
//! failures (profile construction, connectivity resolution) are appended to
//! the same batch by [`crate::model::Model::from_schema`].

use crate::graph::NodeType;
use crate::schema::Schema;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("node #{node_id}: unknown node type `{node_type}`")]
    UnknownNodeType { node_id: i32, node_type: String },
    #[error("link #{link_id}: unknown link type `{link_type}`")]
    UnknownLinkType { link_id: i32, link_type: String },
    #[error("link #{link_id}: node #{node_id} does not exist")]
    LinkEndpointMissing { link_id: i32, node_id: i32 },
    #[error("link #{link_id}: {from_type} #{from_id} may not flow into {to_type} #{to_id}")]
    InvalidFlowNeighbour {
        link_id: i32,
        from_type: NodeType,
        from_id: i32,
        to_type: NodeType,
        to_id: i32,
    },
    #[error("link #{link_id}: {from_type} #{from_id} may not control {to_type} #{to_id}")]
    InvalidControlNeighbour {
        link_id: i32,
        from_type: NodeType,
        from_id: i32,
        to_type: NodeType,
        to_id: i32,
    },
    #[error("{node_type} #{node_id}: both static and time data supplied")]
    DuplicateStaticAndTime { node_type: NodeType, node_id: i32 },
    #[error("{node_type} #{node_id}: time column is not strictly increasing")]
    TimeNotIncreasing { node_type: NodeType, node_id: i32 },
    #[error("{node_type} #{node_id}: required data is missing")]
    MissingData { node_type: NodeType, node_id: i32 },
    #[error("{node_type} #{node_id}: negative flow rate {value} specified")]
    NegativeFlowRate {
        node_type: NodeType,
        node_id: i32,
        value: f64,
    },
    #[error("subnetwork {subnetwork_id} is disconnected ({components} components)")]
    DisconnectedSubnetwork { subnetwork_id: i32, components: usize },
    #[error(
        "link #{link_id}: links between subnetworks must go from a primary pump or outlet to a basin in the secondary"
    )]
    InvalidSubnetworkLink { link_id: i32 },
    #[error("demand priority {priority} mixes flow and storage units")]
    MixedDemandPriority { priority: i32 },
    #[error("DiscreteControl #{node_id}: truth state `{truth_state}` does not match the {conditions} conditions")]
    MalformedLogic {
        node_id: i32,
        truth_state: String,
        conditions: usize,
    },
    #[error("DiscreteControl #{node_id}: duplicate truth state `{truth_state}`")]
    DuplicateTruthState { node_id: i32, truth_state: String },
    #[error("DiscreteControl #{node_id}: condition {condition_id} has threshold_low {low} above threshold_high {high}")]
    ThresholdsInverted {
        node_id: i32,
        condition_id: i32,
        low: f64,
        high: f64,
    },
    #[error("DiscreteControl #{node_id}: repeated condition {condition_id} on compound variable {variable_id}")]
    RepeatedThreshold {
        node_id: i32,
        variable_id: i32,
        condition_id: i32,
    },
    #[error("{message}")]
    Build { message: String },
}

/// The full batch of validation failures.
#[derive(Debug)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl Display for ValidationErrors {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} validation error(s):", self.0.len())?;
        for error in &self.0 {
            writeln!(f, "  - {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Flow-link admissibility: which node types may receive water from `from`.
fn allowed_flow_neighbours(from: NodeType) -> &'static [NodeType] {
    use NodeType::*;
    match from {
        Basin => &[
            LinearResistance,
            ManningResistance,
            TabulatedRatingCurve,
            Pump,
            Outlet,
            UserDemand,
            Junction,
        ],
        LevelBoundary => &[LinearResistance, TabulatedRatingCurve, Pump, Outlet],
        FlowBoundary => &[Basin, Terminal],
        LinearResistance | ManningResistance | TabulatedRatingCurve | Pump | Outlet => {
            &[Basin, Terminal, Junction, LevelBoundary]
        }
        UserDemand => &[Basin, Terminal],
        Junction => &[
            Basin,
            Terminal,
            Junction,
            LinearResistance,
            ManningResistance,
            TabulatedRatingCurve,
            Pump,
            Outlet,
            UserDemand,
        ],
        Terminal | LevelDemand | FlowDemand | DiscreteControl | ContinuousControl | PidControl => &[],
    }
}

/// Control-link admissibility: which node types `from` may control or listen
/// against.
fn allowed_control_neighbours(from: NodeType) -> &'static [NodeType] {
    use NodeType::*;
    match from {
        DiscreteControl => &[Pump, Outlet, LinearResistance, ManningResistance, TabulatedRatingCurve],
        ContinuousControl => &[Pump, Outlet, LinearResistance, ManningResistance],
        PidControl => &[Pump, Outlet],
        FlowDemand => &[LinearResistance, ManningResistance, TabulatedRatingCurve, Pump, Outlet],
        LevelDemand => &[Basin],
        _ => &[],
    }
}

pub fn validate(schema: &Schema) -> Result<(), ValidationErrors> {
    let mut errors = Vec::new();

    // Node and link identity.
    let mut node_types: HashMap<i32, NodeType> = HashMap::new();
    for node in &schema.nodes {
        match NodeType::from_str(&node.node_type) {
            Ok(node_type) => {
                node_types.insert(node.node_id, node_type);
            }
            Err(_) => errors.push(ValidationError::UnknownNodeType {
                node_id: node.node_id,
                node_type: node.node_type.clone(),
            }),
        }
    }

    for link in &schema.links {
        if link.link_type != "flow" && link.link_type != "control" {
            errors.push(ValidationError::UnknownLinkType {
                link_id: link.link_id,
                link_type: link.link_type.clone(),
            });
            continue;
        }
        let mut endpoint = |node_id: i32| -> Option<NodeType> {
            match node_types.get(&node_id) {
                Some(node_type) => Some(*node_type),
                None => {
                    errors.push(ValidationError::LinkEndpointMissing {
                        link_id: link.link_id,
                        node_id,
                    });
                    None
                }
            }
        };
        let from = endpoint(link.from_node_id);
        let to = endpoint(link.to_node_id);
        let (Some(from), Some(to)) = (from, to) else { continue };

        if link.link_type == "flow" {
            if !allowed_flow_neighbours(from).contains(&to) {
                errors.push(ValidationError::InvalidFlowNeighbour {
                    link_id: link.link_id,
                    from_type: from,
                    from_id: link.from_node_id,
                    to_type: to,
                    to_id: link.to_node_id,
                });
            }
        } else if !allowed_control_neighbours(from).contains(&to) {
            errors.push(ValidationError::InvalidControlNeighbour {
                link_id: link.link_id,
                from_type: from,
                from_id: link.from_node_id,
                to_type: to,
                to_id: link.to_node_id,
            });
        }
    }

    // Static XOR time data, strictly increasing time columns, negative rates.
    check_static_time(
        &mut errors,
        NodeType::Pump,
        schema.pump_static.iter().map(|r| r.node_id).collect(),
        schema.pump_time.iter().map(|r| (r.node_id, r.time)).collect(),
    );
    check_static_time(
        &mut errors,
        NodeType::Outlet,
        schema.outlet_static.iter().map(|r| r.node_id).collect(),
        schema.outlet_time.iter().map(|r| (r.node_id, r.time)).collect(),
    );
    check_static_time(
        &mut errors,
        NodeType::LevelBoundary,
        schema.level_boundary_static.iter().map(|r| r.node_id).collect(),
        schema.level_boundary_time.iter().map(|r| (r.node_id, r.time)).collect(),
    );
    check_static_time(
        &mut errors,
        NodeType::FlowBoundary,
        schema.flow_boundary_static.iter().map(|r| r.node_id).collect(),
        schema.flow_boundary_time.iter().map(|r| (r.node_id, r.time)).collect(),
    );
    check_static_time(
        &mut errors,
        NodeType::UserDemand,
        schema.user_demand_static.iter().map(|r| r.node_id).collect(),
        schema.user_demand_time.iter().map(|r| (r.node_id, r.time)).collect(),
    );
    check_time_increasing(
        &mut errors,
        NodeType::Basin,
        schema.basin_time.iter().map(|r| (r.node_id, r.time)).collect(),
    );

    for row in &schema.pump_static {
        if row.flow_rate < 0.0 {
            errors.push(ValidationError::NegativeFlowRate {
                node_type: NodeType::Pump,
                node_id: row.node_id,
                value: row.flow_rate,
            });
        }
    }
    for row in &schema.outlet_static {
        if row.flow_rate < 0.0 {
            errors.push(ValidationError::NegativeFlowRate {
                node_type: NodeType::Outlet,
                node_id: row.node_id,
                value: row.flow_rate,
            });
        }
    }
    for row in &schema.flow_boundary_static {
        if row.flow_rate < 0.0 {
            errors.push(ValidationError::NegativeFlowRate {
                node_type: NodeType::FlowBoundary,
                node_id: row.node_id,
                value: row.flow_rate,
            });
        }
    }

    // Required data per node.
    let profile_nodes: HashSet<i32> = schema.basin_profile.iter().map(|r| r.node_id).collect();
    for (node_id, node_type) in &node_types {
        let present = match node_type {
            NodeType::Basin => profile_nodes.contains(node_id),
            NodeType::LinearResistance => schema.linear_resistance_static.iter().any(|r| r.node_id == *node_id),
            NodeType::ManningResistance => schema.manning_resistance_static.iter().any(|r| r.node_id == *node_id),
            NodeType::TabulatedRatingCurve => {
                schema.tabulated_rating_curve_static.iter().any(|r| r.node_id == *node_id)
                    || schema.tabulated_rating_curve_time.iter().any(|r| r.node_id == *node_id)
            }
            NodeType::Pump => {
                schema.pump_static.iter().any(|r| r.node_id == *node_id)
                    || schema.pump_time.iter().any(|r| r.node_id == *node_id)
            }
            NodeType::Outlet => {
                schema.outlet_static.iter().any(|r| r.node_id == *node_id)
                    || schema.outlet_time.iter().any(|r| r.node_id == *node_id)
            }
            NodeType::LevelBoundary => {
                schema.level_boundary_static.iter().any(|r| r.node_id == *node_id)
                    || schema.level_boundary_time.iter().any(|r| r.node_id == *node_id)
            }
            NodeType::FlowBoundary => {
                schema.flow_boundary_static.iter().any(|r| r.node_id == *node_id)
                    || schema.flow_boundary_time.iter().any(|r| r.node_id == *node_id)
            }
            NodeType::UserDemand => {
                schema.user_demand_static.iter().any(|r| r.node_id == *node_id)
                    || schema.user_demand_time.iter().any(|r| r.node_id == *node_id)
            }
            NodeType::FlowDemand => {
                schema.flow_demand_static.iter().any(|r| r.node_id == *node_id)
                    || schema.flow_demand_time.iter().any(|r| r.node_id == *node_id)
            }
            NodeType::LevelDemand => {
                schema.level_demand_static.iter().any(|r| r.node_id == *node_id)
                    || schema.level_demand_time.iter().any(|r| r.node_id == *node_id)
            }
            NodeType::PidControl => schema.pid_control_static.iter().any(|r| r.node_id == *node_id),
            NodeType::DiscreteControl => schema.discrete_control_logic.iter().any(|r| r.node_id == *node_id),
            _ => true,
        };
        if !present {
            errors.push(ValidationError::MissingData {
                node_type: *node_type,
                node_id: *node_id,
            });
        }
    }

    // Demand priorities: a priority is a flow-unit or a storage-unit
    // priority, never both.
    let mut flow_priorities: HashSet<i32> = HashSet::new();
    flow_priorities.extend(schema.user_demand_static.iter().map(|r| r.demand_priority));
    flow_priorities.extend(schema.user_demand_time.iter().map(|r| r.demand_priority));
    flow_priorities.extend(schema.flow_demand_static.iter().map(|r| r.demand_priority));
    flow_priorities.extend(schema.flow_demand_time.iter().map(|r| r.demand_priority));
    let mut storage_priorities: HashSet<i32> = HashSet::new();
    storage_priorities.extend(schema.level_demand_static.iter().map(|r| r.demand_priority));
    storage_priorities.extend(schema.level_demand_time.iter().map(|r| r.demand_priority));
    for priority in flow_priorities.intersection(&storage_priorities) {
        errors.push(ValidationError::MixedDemandPriority { priority: *priority });
    }

    // Discrete control structure.
    let mut conditions_per_node: HashMap<i32, usize> = HashMap::new();
    let mut seen_conditions: HashSet<(i32, i32, i32)> = HashSet::new();
    for row in &schema.discrete_control_condition {
        if row.time.is_none() && !seen_conditions.insert((row.node_id, row.compound_variable_id, row.condition_id)) {
            errors.push(ValidationError::RepeatedThreshold {
                node_id: row.node_id,
                variable_id: row.compound_variable_id,
                condition_id: row.condition_id,
            });
        }
        if row.threshold_low > row.threshold_high {
            errors.push(ValidationError::ThresholdsInverted {
                node_id: row.node_id,
                condition_id: row.condition_id,
                low: row.threshold_low,
                high: row.threshold_high,
            });
        }
    }
    for (node_id, _, _) in &seen_conditions {
        *conditions_per_node.entry(*node_id).or_insert(0) += 1;
    }
    let mut seen_truth_states: HashSet<(i32, String)> = HashSet::new();
    for row in &schema.discrete_control_logic {
        let conditions = conditions_per_node.get(&row.node_id).copied().unwrap_or(0);
        let well_formed = row.truth_state.len() == conditions && row.truth_state.chars().all(|c| c == 'T' || c == 'F');
        if !well_formed {
            errors.push(ValidationError::MalformedLogic {
                node_id: row.node_id,
                truth_state: row.truth_state.clone(),
                conditions,
            });
        }
        if !seen_truth_states.insert((row.node_id, row.truth_state.clone())) {
            errors.push(ValidationError::DuplicateTruthState {
                node_id: row.node_id,
                truth_state: row.truth_state.clone(),
            });
        }
    }

    // Subnetworks: connectivity and inter-subnetwork link rule.
    let subnetwork_of: HashMap<i32, i32> = schema
        .nodes
        .iter()
        .filter_map(|n| n.subnetwork_id.map(|s| (n.node_id, s)))
        .collect();
    for link in &schema.links {
        if link.link_type != "flow" {
            continue;
        }
        let from_subnet = subnetwork_of.get(&link.from_node_id);
        let to_subnet = subnetwork_of.get(&link.to_node_id);
        if let (Some(&from_subnet), Some(&to_subnet)) = (from_subnet, to_subnet) {
            if from_subnet != to_subnet {
                let from_type = node_types.get(&link.from_node_id);
                let to_type = node_types.get(&link.to_node_id);
                let valid = from_subnet == 1
                    && matches!(from_type, Some(NodeType::Pump) | Some(NodeType::Outlet))
                    && matches!(to_type, Some(NodeType::Basin));
                if !valid {
                    errors.push(ValidationError::InvalidSubnetworkLink { link_id: link.link_id });
                }
            }
        }
    }
    for subnetwork_id in subnetwork_of.values().copied().collect::<HashSet<_>>() {
        let members: HashSet<i32> = subnetwork_of
            .iter()
            .filter(|(_, s)| **s == subnetwork_id)
            .map(|(n, _)| *n)
            .collect();
        if members.is_empty() {
            continue;
        }
        let components = count_components(&members, schema);
        if components > 1 {
            errors.push(ValidationError::DisconnectedSubnetwork {
                subnetwork_id,
                components,
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors(errors))
    }
}

fn check_static_time(
    errors: &mut Vec<ValidationError>,
    node_type: NodeType,
    static_nodes: Vec<i32>,
    time_rows: Vec<(i32, f64)>,
) {
    let static_set: HashSet<i32> = static_nodes.into_iter().collect();
    let time_set: HashSet<i32> = time_rows.iter().map(|(n, _)| *n).collect();
    for node_id in static_set.intersection(&time_set) {
        errors.push(ValidationError::DuplicateStaticAndTime {
            node_type,
            node_id: *node_id,
        });
    }
    check_time_increasing(errors, node_type, time_rows);
}

fn check_time_increasing(errors: &mut Vec<ValidationError>, node_type: NodeType, time_rows: Vec<(i32, f64)>) {
    let mut last: HashMap<i32, f64> = HashMap::new();
    let mut flagged: HashSet<i32> = HashSet::new();
    for (node_id, time) in time_rows {
        if let Some(&previous) = last.get(&node_id) {
            if time <= previous && flagged.insert(node_id) {
                errors.push(ValidationError::TimeNotIncreasing { node_type, node_id });
            }
        }
        last.insert(node_id, time);
    }
}

/// Connected components of a subnetwork over its flow links (undirected).
fn count_components(members: &HashSet<i32>, schema: &Schema) -> usize {
    let mut adjacency: HashMap<i32, Vec<i32>> = HashMap::new();
    for link in &schema.links {
        if link.link_type != "flow" {
            continue;
        }
        if members.contains(&link.from_node_id) && members.contains(&link.to_node_id) {
            adjacency.entry(link.from_node_id).or_default().push(link.to_node_id);
            adjacency.entry(link.to_node_id).or_default().push(link.from_node_id);
        }
    }
    let mut unvisited: HashSet<i32> = members.clone();
    let mut components = 0;
    while let Some(&start) = unvisited.iter().next() {
        components += 1;
        let mut queue = VecDeque::from([start]);
        unvisited.remove(&start);
        while let Some(current) = queue.pop_front() {
            for neighbour in adjacency.get(&current).into_iter().flatten() {
                if unvisited.remove(neighbour) {
                    queue.push_back(*neighbour);
                }
            }
        }
    }
    components
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{LinkRow, NodeRow, PumpStaticRow};

    fn node(node_id: i32, node_type: &str) -> NodeRow {
        NodeRow {
            node_id,
            node_type: node_type.to_string(),
            subnetwork_id: None,
            cyclic_time: None,
            source_priority: None,
        }
    }

    fn flow_link(link_id: i32, from: i32, to: i32) -> LinkRow {
        LinkRow {
            link_id,
            from_node_id: from,
            to_node_id: to,
            link_type: "flow".to_string(),
        }
    }

    #[test]
    fn collects_multiple_errors_in_one_batch() {
        let schema = Schema {
            nodes: vec![node(1, "Basin"), node(2, "Windmill"), node(3, "Pump")],
            links: vec![flow_link(1, 1, 3), flow_link(2, 3, 99)],
            pump_static: vec![PumpStaticRow {
                node_id: 3,
                control_state: None,
                active: None,
                flow_rate: -1.0,
                min_flow_rate: None,
                max_flow_rate: None,
            }],
            ..Schema::default()
        };
        let errors = validate(&schema).unwrap_err();
        assert!(errors.0.iter().any(|e| matches!(e, ValidationError::UnknownNodeType { node_id: 2, .. })));
        assert!(errors.0.iter().any(|e| matches!(e, ValidationError::LinkEndpointMissing { node_id: 99, .. })));
        assert!(errors.0.iter().any(|e| matches!(e, ValidationError::NegativeFlowRate { node_id: 3, .. })));
        // Basin without profile rows.
        assert!(errors.0.iter().any(|e| matches!(e, ValidationError::MissingData { node_id: 1, .. })));
    }

    #[test]
    fn invalid_flow_neighbour_is_reported() {
        let schema = Schema {
            nodes: vec![node(1, "Basin"), node(2, "Basin")],
            links: vec![flow_link(1, 1, 2)],
            ..Schema::default()
        };
        let errors = validate(&schema).unwrap_err();
        assert!(errors.0.iter().any(|e| matches!(e, ValidationError::InvalidFlowNeighbour { .. })));
    }

    #[test]
    fn mixed_priority_units_are_rejected() {
        use crate::schema::{LevelDemandStaticRow, UserDemandStaticRow};
        let schema = Schema {
            nodes: vec![node(1, "UserDemand"), node(2, "LevelDemand")],
            user_demand_static: vec![UserDemandStaticRow {
                node_id: 1,
                active: None,
                demand: 1.0,
                return_factor: 0.0,
                min_level: 0.0,
                demand_priority: 3,
            }],
            level_demand_static: vec![LevelDemandStaticRow {
                node_id: 2,
                min_level: Some(1.0),
                max_level: None,
                demand_priority: 3,
            }],
            ..Schema::default()
        };
        let errors = validate(&schema).unwrap_err();
        assert!(errors.0.iter().any(|e| matches!(e, ValidationError::MixedDemandPriority { priority: 3 })));
    }
}
