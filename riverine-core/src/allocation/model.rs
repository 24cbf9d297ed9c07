//! Per-subnetwork allocation model.
//!
//! One persistent LP per subnetwork: variables and constraint rows are laid
//! out once at startup; every solve mutates bounds, right-hand sides and a
//! small set of coefficients, then walks the goal-programming objective
//! stack. Flows and storages live in scaled units; conversion happens only
//! through [`Scaling`].

use crate::allocation::builder::{Bounds, Lp, LpBuilder, RowBuilder};
use crate::graph::{Graph, LinkId, NodeId, NodeType};
use crate::math::{Dual, Scalar};
use crate::nodes::Nodes;
use crate::physics::{BasinState, Physics};
use crate::state::{ComponentClass, WaterSource};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, error};

/// Slack added when pinning an achieved objective, to keep later stages
/// feasible under simplex round-off.
const PIN_SLACK: f64 = 1e-8;

/// Unset source priority; makes unprioritized sources the least preferred.
const DEFAULT_SOURCE_PRIORITY: i32 = 1000;

#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("subnetwork {subnetwork}: allocation LP infeasible in objective stage `{stage}`: {source}")]
    Infeasible {
        subnetwork: i32,
        stage: String,
        source: microlp::Error,
    },
}

/// Subnetwork-specific unit scaling for LP conditioning. Storage is scaled
/// by the allocation interval so a unit of scaled storage change is a unit
/// of flow.
#[derive(Debug, Clone, Copy)]
pub struct Scaling {
    pub flow: f64,
    pub storage: f64,
}

impl Scaling {
    pub fn new(allocation_dt: f64) -> Self {
        Self {
            flow: 1.0,
            storage: allocation_dt,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Side {
    Lower,
    Upper,
}

/// Typed key of one LP column.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AllocVar {
    Flow(LinkId),
    /// Storage change of a basin over the allocation interval.
    StorageChange(usize),
    LowStorageFactor(usize),
    UserAllocated(usize, usize),
    UserErrorFirst(usize, usize),
    UserErrorSecond(usize, usize),
    FlowDemandAllocated(usize, usize),
    FlowDemandErrorFirst(usize, usize),
    FlowDemandErrorSecond(usize, usize),
    LevelAllocated(usize, usize, Side),
    LevelErrorFirst(usize, usize, Side),
    LevelErrorSecond(usize, usize, Side),
    /// Inter-subnetwork inlet treated as a prioritized demand on the primary.
    InletAllocated(LinkId, usize),
    InletErrorFirst(LinkId, usize),
    InletErrorSecond(LinkId, usize),
    AverageFlowError(usize),
    AverageStorageError(usize, Side),
}

/// A variable row whose bounds/coefficients are rewritten before each solve.
#[derive(Debug, Clone)]
enum RefreshRow {
    /// `Δs·ss/Δt − Σ inflow + Σ outflow + f_out·lsf = f_in`
    WaterBalance { basin: usize, row: usize },
    /// `(threshold/ss)·lsf − Δs ≤ s_now/ss`
    LowStorageAvailability { basin: usize, row: usize },
    /// `flow − Σ_b (∂q/∂s_b)(ss/fs)·Δs_b = q₀/fs`
    Linearized {
        class: ComponentClass,
        index: usize,
        row: usize,
    },
    /// `fs·flow − q_sim·lsf_up = 0` for pumps the allocation does not command.
    FixedPump {
        node: NodeId,
        link: LinkId,
        upstream_basin: Option<usize>,
        row: usize,
    },
    /// `flow_out − rf(t)·flow_in = 0`
    ReturnFlow { user: usize, row: usize },
    /// `d·error_first + scale·allocated ≥ d`
    ErrorFirst { demand: DemandRef, row: usize },
}

/// Identifies one demand entry for bound and error refreshes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
enum DemandRef {
    User(usize, usize),
    FlowDemand(usize, usize),
    Level(usize, usize, Side),
    Inlet(LinkId, usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageKind {
    FirstError(usize),
    SecondError(usize),
    LowStoragePenalty,
    SourcePriority,
}

#[derive(Debug, Clone)]
struct Stage {
    kind: StageKind,
    label: String,
    terms: Vec<(usize, f64)>,
}

/// Which of the sequencing passes a solve serves.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SolvePass {
    /// Secondary with unclamped inlets, recording per-priority inlet demand.
    Collect,
    /// Ordinary allocation (primary, or secondary with fixed inlets).
    Allocate,
}

/// Everything a refresh needs from the physical layer, precomputed by the
/// sequencing driver.
pub struct RefreshContext<'a> {
    pub t: f64,
    pub dt: f64,
    pub graph: &'a Graph,
    pub nodes: &'a Nodes,
    pub physics: &'a Physics,
    pub basins: &'a BasinState,
    /// Mean positive/negative forcing rate per basin since last allocation.
    pub forcing_in_rate: &'a [f64],
    pub forcing_out_rate: &'a [f64],
    /// Mean discharge per flow boundary since last allocation.
    pub boundary_mean_flow: &'a [f64],
}

pub struct SolveResult {
    /// Final column values in scaled units.
    pub values: Vec<f64>,
    /// Inlet flow recorded after each flow-priority stage (collect pass).
    pub inlet_flow_per_priority: HashMap<(LinkId, usize), f64>,
}

pub struct AllocationModel {
    pub subnetwork_id: i32,
    pub is_primary: bool,
    lp: Lp<usize>,
    vars: HashMap<AllocVar, usize>,
    refresh_rows: Vec<RefreshRow>,
    stages: Vec<Stage>,
    pub scaling: Scaling,

    pub links: Vec<LinkId>,
    pub member_basins: Vec<usize>,
    pub member_users: Vec<usize>,
    pub member_flow_demands: Vec<usize>,
    pub member_level_demands: Vec<usize>,
    /// Links feeding this subnetwork from the primary (secondary models).
    pub source_inlets: Vec<LinkId>,
    /// Links leaving this subnetwork into secondaries (primary model).
    pub demand_inlets: Vec<LinkId>,
    /// Collected per-priority demand at the primary's inlet links.
    pub inlet_demands: HashMap<(LinkId, usize), f64>,
    /// Total inlet flow granted by the primary, fixed in the final pass.
    pub inlet_grants: HashMap<LinkId, f64>,

    pub last_solution: Option<Vec<f64>>,
}

impl AllocationModel {
    pub fn col(&self, var: AllocVar) -> Option<usize> {
        self.vars.get(&var).copied()
    }

    /// Column value of a variable in the given solution, in physical units.
    pub fn value(&self, values: &[f64], var: AllocVar) -> f64 {
        let scale = match var {
            AllocVar::Flow(_) | AllocVar::UserAllocated(..) | AllocVar::FlowDemandAllocated(..) | AllocVar::InletAllocated(..) => {
                self.scaling.flow
            }
            AllocVar::StorageChange(_) | AllocVar::LevelAllocated(..) => self.scaling.storage,
            _ => 1.0,
        };
        self.col(var).map(|c| values[c] * scale).unwrap_or(0.0)
    }

    pub fn new(
        subnetwork_id: i32,
        graph: &Graph,
        nodes: &Nodes,
        physics: &Physics,
        allocation_dt: f64,
    ) -> Self {
        let scaling = Scaling::new(allocation_dt);
        let n_priorities = nodes.demand_priorities.len();
        let has_priority = nodes.demand_priority_matrix();
        let is_primary = subnetwork_id == 1 && graph.subnetwork_ids().count() > 1;

        let mut builder: LpBuilder<usize> = LpBuilder::default();
        let mut vars: HashMap<AllocVar, usize> = HashMap::new();
        let mut refresh_rows = Vec::new();

        let members: Vec<NodeId> = graph.nodes_in_subnetwork(subnetwork_id).to_vec();

        // Inter-subnetwork inlets.
        let mut source_inlets = Vec::new();
        let mut demand_inlets = Vec::new();
        for link in graph.links() {
            if link.link_type != crate::graph::LinkType::Flow {
                continue;
            }
            let from_subnet = graph.subnetwork_id(&link.from);
            let to_subnet = graph.subnetwork_id(&link.to);
            if from_subnet == Some(1) && to_subnet == Some(subnetwork_id) && subnetwork_id != 1 {
                source_inlets.push(link.id);
            }
            if is_primary && from_subnet == Some(1) && to_subnet.map(|s| s != 1).unwrap_or(false) {
                demand_inlets.push(link.id);
            }
        }

        // Flow variables: every flow link adjacent to a member node.
        let mut links: Vec<LinkId> = Vec::new();
        for node in &members {
            for link in graph.inflow_links(node).iter().chain(graph.outflow_links(node)) {
                if !links.contains(link) {
                    links.push(*link);
                }
            }
        }
        links.sort();

        for &link in &links {
            let bounds = link_capacity_bounds(graph, nodes, link, scaling.flow);
            let col = builder.add_column(bounds);
            vars.insert(AllocVar::Flow(link), col);
        }

        // Basin variables.
        let member_basins: Vec<usize> = members
            .iter()
            .filter(|n| n.node_type == NodeType::Basin)
            .map(|n| n.index)
            .collect();
        for &b in &member_basins {
            let change = builder.add_column(Bounds::Free);
            vars.insert(AllocVar::StorageChange(b), change);
            let factor = builder.add_column(Bounds::Double(0.0, 1.0));
            vars.insert(AllocVar::LowStorageFactor(b), factor);
        }

        // Demand variables.
        let member_users: Vec<usize> = members
            .iter()
            .filter(|n| n.node_type == NodeType::UserDemand)
            .map(|n| n.index)
            .collect();
        let member_flow_demands: Vec<usize> = members
            .iter()
            .filter(|n| n.node_type == NodeType::FlowDemand)
            .map(|n| n.index)
            .collect();
        let member_level_demands: Vec<usize> = members
            .iter()
            .filter(|n| n.node_type == NodeType::LevelDemand)
            .map(|n| n.index)
            .collect();

        for &user in &member_users {
            let row = nodes.demand_row(&nodes.user_demands[user].node_id).expect("demand node");
            for p in 0..n_priorities {
                if has_priority[(row, p)] {
                    vars.insert(AllocVar::UserAllocated(user, p), builder.add_column(Bounds::Lower(0.0)));
                    vars.insert(
                        AllocVar::UserErrorFirst(user, p),
                        builder.add_column(Bounds::Lower(0.0)),
                    );
                    vars.insert(
                        AllocVar::UserErrorSecond(user, p),
                        builder.add_column(Bounds::Lower(0.0)),
                    );
                }
            }
        }
        for &fd in &member_flow_demands {
            let row = nodes.demand_row(&nodes.flow_demands[fd].node_id).expect("demand node");
            for p in 0..n_priorities {
                if has_priority[(row, p)] {
                    vars.insert(
                        AllocVar::FlowDemandAllocated(fd, p),
                        builder.add_column(Bounds::Lower(0.0)),
                    );
                    vars.insert(
                        AllocVar::FlowDemandErrorFirst(fd, p),
                        builder.add_column(Bounds::Lower(0.0)),
                    );
                    vars.insert(
                        AllocVar::FlowDemandErrorSecond(fd, p),
                        builder.add_column(Bounds::Lower(0.0)),
                    );
                }
            }
        }
        for &ld in &member_level_demands {
            let row = nodes.demand_row(&nodes.level_demands[ld].node_id).expect("demand node");
            for p in 0..n_priorities {
                if has_priority[(row, p)] {
                    for side in [Side::Lower, Side::Upper] {
                        vars.insert(
                            AllocVar::LevelAllocated(ld, p, side),
                            builder.add_column(Bounds::Lower(0.0)),
                        );
                        vars.insert(
                            AllocVar::LevelErrorFirst(ld, p, side),
                            builder.add_column(Bounds::Lower(0.0)),
                        );
                        vars.insert(
                            AllocVar::LevelErrorSecond(ld, p, side),
                            builder.add_column(Bounds::Lower(0.0)),
                        );
                    }
                }
            }
        }
        for &inlet in &demand_inlets {
            for p in 0..n_priorities {
                vars.insert(AllocVar::InletAllocated(inlet, p), builder.add_column(Bounds::Lower(0.0)));
                vars.insert(
                    AllocVar::InletErrorFirst(inlet, p),
                    builder.add_column(Bounds::Lower(0.0)),
                );
                vars.insert(
                    AllocVar::InletErrorSecond(inlet, p),
                    builder.add_column(Bounds::Lower(0.0)),
                );
            }
        }

        // Average error variables per priority.
        for p in 0..n_priorities {
            vars.insert(AllocVar::AverageFlowError(p), builder.add_column(Bounds::Lower(0.0)));
            for side in [Side::Lower, Side::Upper] {
                vars.insert(
                    AllocVar::AverageStorageError(p, side),
                    builder.add_column(Bounds::Lower(0.0)),
                );
            }
        }

        // ---- Constraint rows ----
        let flow_col = |vars: &HashMap<AllocVar, usize>, link: LinkId| vars[&AllocVar::Flow(link)];

        // Conservation at junctions and connectors; return-flow for users.
        for node in &members {
            match node.node_type {
                NodeType::Junction => {
                    let mut row = RowBuilder::default();
                    for link in graph.inflow_links(node) {
                        row.add_element(flow_col(&vars, *link), 1.0);
                    }
                    for link in graph.outflow_links(node) {
                        row.add_element(flow_col(&vars, *link), -1.0);
                    }
                    row.set_equal(0.0);
                    builder.add_fixed_row(row);
                }
                NodeType::Pump
                | NodeType::Outlet
                | NodeType::LinearResistance
                | NodeType::ManningResistance
                | NodeType::TabulatedRatingCurve => {
                    if let (Ok(inflow), Ok(outflow)) = (graph.single_inflow(node), graph.single_outflow(node)) {
                        let mut row = RowBuilder::default();
                        row.add_element(flow_col(&vars, inflow), 1.0);
                        row.add_element(flow_col(&vars, outflow), -1.0);
                        row.set_equal(0.0);
                        builder.add_fixed_row(row);
                    }
                }
                NodeType::UserDemand => {
                    if let (Ok(inflow), Ok(outflow)) = (graph.single_inflow(node), graph.single_outflow(node)) {
                        let mut row = RowBuilder::default();
                        row.add_element(flow_col(&vars, outflow), 1.0);
                        row.add_element(flow_col(&vars, inflow), 0.0);
                        let id = builder.add_variable_row(row);
                        refresh_rows.push(RefreshRow::ReturnFlow {
                            user: node.index,
                            row: id,
                        });
                    }
                }
                _ => {}
            }
        }

        // Basin water balance and low-storage availability.
        for &b in &member_basins {
            let basin_node = nodes.basins[b].node_id;
            let mut row = RowBuilder::default();
            row.add_element(vars[&AllocVar::StorageChange(b)], scaling.storage / (allocation_dt * scaling.flow));
            for link in graph.inflow_links(&basin_node) {
                row.add_element(flow_col(&vars, *link), -1.0);
            }
            for link in graph.outflow_links(&basin_node) {
                row.add_element(flow_col(&vars, *link), 1.0);
            }
            // Negative forcing rides on the low-storage factor.
            row.add_element(vars[&AllocVar::LowStorageFactor(b)], 0.0);
            let id = builder.add_variable_row(row);
            refresh_rows.push(RefreshRow::WaterBalance { basin: b, row: id });

            let mut availability = RowBuilder::default();
            availability.add_element(
                vars[&AllocVar::LowStorageFactor(b)],
                nodes.basins[b].low_storage_threshold / scaling.storage,
            );
            availability.add_element(vars[&AllocVar::StorageChange(b)], -1.0);
            let id = builder.add_variable_row(availability);
            refresh_rows.push(RefreshRow::LowStorageAvailability { basin: b, row: id });
        }

        // Linearized flow laws of passive connectors.
        for node in &members {
            let class = match node.node_type {
                NodeType::LinearResistance => ComponentClass::LinearResistance,
                NodeType::ManningResistance => ComponentClass::ManningResistance,
                NodeType::TabulatedRatingCurve => ComponentClass::RatingCurve,
                _ => continue,
            };
            if let Ok(inflow) = graph.single_inflow(node) {
                let ends = physics.connectivity.of_class(class).expect("connector class")[node.index];
                let mut row = RowBuilder::default();
                row.add_element(flow_col(&vars, inflow), 1.0);
                for source in [ends.up, ends.dn] {
                    if let WaterSource::Basin(b) = source {
                        if let Some(&change) = vars.get(&AllocVar::StorageChange(b)) {
                            row.add_element(change, 0.0);
                        }
                    }
                }
                let id = builder.add_variable_row(row);
                refresh_rows.push(RefreshRow::Linearized {
                    class,
                    index: node.index,
                    row: id,
                });
            }
        }

        // Pumps and outlets the allocation does not command: flow rides the
        // upstream low-storage factor.
        for node in &members {
            if !matches!(node.node_type, NodeType::Pump | NodeType::Outlet) {
                continue;
            }
            let pump = nodes.pump_like(node).expect("container matches type");
            if pump.allocation_controlled {
                continue;
            }
            let Ok(inflow) = graph.single_inflow(node) else { continue };
            let class = if node.node_type == NodeType::Pump {
                ComponentClass::Pump
            } else {
                ComponentClass::Outlet
            };
            let ends = physics.connectivity.of_class(class).expect("connector class")[node.index];
            let upstream_basin = match ends.up {
                WaterSource::Basin(b) if member_basins.contains(&b) => Some(b),
                _ => None,
            };
            let mut row = RowBuilder::default();
            row.add_element(flow_col(&vars, inflow), scaling.flow);
            if let Some(b) = upstream_basin {
                row.add_element(vars[&AllocVar::LowStorageFactor(b)], 0.0);
            }
            let id = builder.add_variable_row(row);
            refresh_rows.push(RefreshRow::FixedPump {
                node: *node,
                link: inflow,
                upstream_basin,
                row: id,
            });
        }

        // Allocated sums and error definitions per demand.
        for &user in &member_users {
            let node = nodes.user_demands[user].node_id;
            if let Ok(inflow) = graph.single_inflow(&node) {
                let mut sum = RowBuilder::default();
                sum.add_element(flow_col(&vars, inflow), 1.0);
                for p in 0..n_priorities {
                    if let Some(&col) = vars.get(&AllocVar::UserAllocated(user, p)) {
                        sum.add_element(col, -1.0);
                    }
                }
                sum.set_equal(0.0);
                builder.add_fixed_row(sum);
            }
            for p in 0..n_priorities {
                if nodes.user_demands[user].has_priority(p) {
                    let demand = DemandRef::User(user, p);
                    let id = error_first_row(
                        &mut builder,
                        vars[&AllocVar::UserErrorFirst(user, p)],
                        vars[&AllocVar::UserAllocated(user, p)],
                    );
                    refresh_rows.push(RefreshRow::ErrorFirst { demand, row: id });
                    fairness_row(
                        &mut builder,
                        vars[&AllocVar::UserErrorSecond(user, p)],
                        vars[&AllocVar::UserErrorFirst(user, p)],
                        vars[&AllocVar::AverageFlowError(p)],
                    );
                }
            }
        }
        for &fd in &member_flow_demands {
            let target = nodes.flow_demands[fd].target;
            if let Some(&target_flow) = graph
                .single_inflow(&target)
                .ok()
                .and_then(|link| vars.get(&AllocVar::Flow(link)))
            {
                let mut sum = RowBuilder::default();
                sum.add_element(target_flow, 1.0);
                for p in 0..n_priorities {
                    if let Some(&col) = vars.get(&AllocVar::FlowDemandAllocated(fd, p)) {
                        sum.add_element(col, -1.0);
                    }
                }
                // Excess flow through the target is not "allocated".
                sum.set_lower(0.0);
                builder.add_fixed_row(sum);
            }
            for p in 0..n_priorities {
                if nodes.flow_demands[fd].has_priority(p) {
                    let id = error_first_row(
                        &mut builder,
                        vars[&AllocVar::FlowDemandErrorFirst(fd, p)],
                        vars[&AllocVar::FlowDemandAllocated(fd, p)],
                    );
                    refresh_rows.push(RefreshRow::ErrorFirst {
                        demand: DemandRef::FlowDemand(fd, p),
                        row: id,
                    });
                    fairness_row(
                        &mut builder,
                        vars[&AllocVar::FlowDemandErrorSecond(fd, p)],
                        vars[&AllocVar::FlowDemandErrorFirst(fd, p)],
                        vars[&AllocVar::AverageFlowError(p)],
                    );
                }
            }
        }
        for &ld in &member_level_demands {
            let target = nodes.level_demands[ld].target;
            let basin = target.index;
            if let Some(&change) = vars.get(&AllocVar::StorageChange(basin)) {
                // Claimed storage increases (decreases) cannot exceed the
                // actual change.
                let mut lower_sum = RowBuilder::default();
                lower_sum.add_element(change, 1.0);
                let mut upper_sum = RowBuilder::default();
                upper_sum.add_element(change, -1.0);
                for p in 0..n_priorities {
                    if let Some(&col) = vars.get(&AllocVar::LevelAllocated(ld, p, Side::Lower)) {
                        lower_sum.add_element(col, -1.0);
                    }
                    if let Some(&col) = vars.get(&AllocVar::LevelAllocated(ld, p, Side::Upper)) {
                        upper_sum.add_element(col, -1.0);
                    }
                }
                lower_sum.set_lower(0.0);
                builder.add_fixed_row(lower_sum);
                upper_sum.set_lower(0.0);
                builder.add_fixed_row(upper_sum);
            }
            for p in 0..n_priorities {
                if nodes.level_demands[ld].has_priority(p) {
                    for side in [Side::Lower, Side::Upper] {
                        let id = error_first_row(
                            &mut builder,
                            vars[&AllocVar::LevelErrorFirst(ld, p, side)],
                            vars[&AllocVar::LevelAllocated(ld, p, side)],
                        );
                        refresh_rows.push(RefreshRow::ErrorFirst {
                            demand: DemandRef::Level(ld, p, side),
                            row: id,
                        });
                        fairness_row(
                            &mut builder,
                            vars[&AllocVar::LevelErrorSecond(ld, p, side)],
                            vars[&AllocVar::LevelErrorFirst(ld, p, side)],
                            vars[&AllocVar::AverageStorageError(p, side)],
                        );
                    }
                }
            }
        }
        for &inlet in &demand_inlets {
            let mut sum = RowBuilder::default();
            sum.add_element(flow_col(&vars, inlet), 1.0);
            for p in 0..n_priorities {
                sum.add_element(vars[&AllocVar::InletAllocated(inlet, p)], -1.0);
            }
            sum.set_equal(0.0);
            builder.add_fixed_row(sum);
            for p in 0..n_priorities {
                let id = error_first_row(
                    &mut builder,
                    vars[&AllocVar::InletErrorFirst(inlet, p)],
                    vars[&AllocVar::InletAllocated(inlet, p)],
                );
                refresh_rows.push(RefreshRow::ErrorFirst {
                    demand: DemandRef::Inlet(inlet, p),
                    row: id,
                });
                fairness_row(
                    &mut builder,
                    vars[&AllocVar::InletErrorSecond(inlet, p)],
                    vars[&AllocVar::InletErrorFirst(inlet, p)],
                    vars[&AllocVar::AverageFlowError(p)],
                );
            }
        }

        // Average error definitions: n·avg = Σ error_first.
        for p in 0..n_priorities {
            let mut flow_terms = Vec::new();
            for &user in &member_users {
                if let Some(&col) = vars.get(&AllocVar::UserErrorFirst(user, p)) {
                    flow_terms.push(col);
                }
            }
            for &fd in &member_flow_demands {
                if let Some(&col) = vars.get(&AllocVar::FlowDemandErrorFirst(fd, p)) {
                    flow_terms.push(col);
                }
            }
            for &inlet in &demand_inlets {
                if let Some(&col) = vars.get(&AllocVar::InletErrorFirst(inlet, p)) {
                    flow_terms.push(col);
                }
            }
            if !flow_terms.is_empty() {
                let mut row = RowBuilder::default();
                row.add_element(vars[&AllocVar::AverageFlowError(p)], flow_terms.len() as f64);
                for col in &flow_terms {
                    row.add_element(*col, -1.0);
                }
                row.set_equal(0.0);
                builder.add_fixed_row(row);
            }
            for side in [Side::Lower, Side::Upper] {
                let mut storage_terms = Vec::new();
                for &ld in &member_level_demands {
                    if let Some(&col) = vars.get(&AllocVar::LevelErrorFirst(ld, p, side)) {
                        storage_terms.push(col);
                    }
                }
                if !storage_terms.is_empty() {
                    let mut row = RowBuilder::default();
                    row.add_element(vars[&AllocVar::AverageStorageError(p, side)], storage_terms.len() as f64);
                    for col in &storage_terms {
                        row.add_element(*col, -1.0);
                    }
                    row.set_equal(0.0);
                    builder.add_fixed_row(row);
                }
            }
        }

        // ---- Objective stack ----
        let mut stages = Vec::new();
        for p in 0..n_priorities {
            let mut terms = Vec::new();
            for (var, col) in &vars {
                let hit = matches!(var,
                    AllocVar::UserErrorFirst(_, q)
                    | AllocVar::FlowDemandErrorFirst(_, q)
                    | AllocVar::InletErrorFirst(_, q)
                    | AllocVar::LevelErrorFirst(_, q, _) if *q == p);
                if hit {
                    terms.push((*col, 1.0));
                }
            }
            if !terms.is_empty() {
                terms.sort_by_key(|(col, _)| *col);
                stages.push(Stage {
                    kind: StageKind::FirstError(p),
                    label: format!("priority {} shortfall", nodes.demand_priorities[p]),
                    terms,
                });
            }
        }
        for p in 0..n_priorities {
            let mut terms = Vec::new();
            for (var, col) in &vars {
                let hit = matches!(var,
                    AllocVar::UserErrorSecond(_, q)
                    | AllocVar::FlowDemandErrorSecond(_, q)
                    | AllocVar::InletErrorSecond(_, q)
                    | AllocVar::LevelErrorSecond(_, q, _) if *q == p);
                if hit {
                    terms.push((*col, 1.0));
                }
            }
            if !terms.is_empty() {
                terms.sort_by_key(|(col, _)| *col);
                stages.push(Stage {
                    kind: StageKind::SecondError(p),
                    label: format!("priority {} fairness", nodes.demand_priorities[p]),
                    terms,
                });
            }
        }
        let low_storage_terms: Vec<(usize, f64)> = {
            let mut terms: Vec<(usize, f64)> = member_basins
                .iter()
                .map(|&b| (vars[&AllocVar::LowStorageFactor(b)], -1.0))
                .collect();
            terms.sort_by_key(|(col, _)| *col);
            terms
        };
        if !low_storage_terms.is_empty() {
            stages.push(Stage {
                kind: StageKind::LowStoragePenalty,
                label: "low-storage penalty".to_string(),
                terms: low_storage_terms,
            });
        }
        let mut source_terms: Vec<(usize, f64)> = links
            .iter()
            .map(|&link| {
                let from = graph.link(link).from;
                let priority = graph
                    .source_priority(&from)
                    .unwrap_or(DEFAULT_SOURCE_PRIORITY)
                    .max(1);
                (vars[&AllocVar::Flow(link)], 1.0 / priority as f64)
            })
            .collect();
        source_terms.sort_by(|a, b| a.0.cmp(&b.0));
        if !source_terms.is_empty() {
            stages.push(Stage {
                kind: StageKind::SourcePriority,
                label: "source priority".to_string(),
                terms: source_terms,
            });
        }

        debug!(
            subnetwork_id,
            columns = builder.num_cols(),
            stages = stages.len(),
            "built allocation model"
        );

        Self {
            subnetwork_id,
            is_primary,
            lp: builder.build(),
            vars,
            refresh_rows,
            stages,
            scaling,
            links,
            member_basins,
            member_users,
            member_flow_demands,
            member_level_demands,
            source_inlets,
            demand_inlets,
            inlet_demands: HashMap::new(),
            inlet_grants: HashMap::new(),
            last_solution: None,
        }
    }

    /// The refresh protocol: rewrite bounds, right-hand sides and refreshable
    /// coefficients from the physical layer, then prepare inlet bounds for
    /// the given pass.
    pub fn refresh(&mut self, ctx: &RefreshContext<'_>, pass: SolvePass) {
        let nodes = ctx.nodes;
        let scaling = self.scaling;
        self.lp.reset_variable_row_bounds();

        // Storage-change bounds from current storages.
        for &b in &self.member_basins {
            let col = self.vars[&AllocVar::StorageChange(b)];
            let s_now = ctx.basins.storage[b];
            let s_max = nodes.basins[b].profile.max_storage();
            self.lp
                .set_col_bounds(col, Bounds::Double(-s_now / scaling.storage, (s_max - s_now) / scaling.storage));
        }

        let refresh_rows = self.refresh_rows.clone();
        for entry in &refresh_rows {
            match entry {
                RefreshRow::WaterBalance { basin, row } => {
                    let f_in = ctx.forcing_in_rate[*basin] / scaling.flow;
                    let f_out = ctx.forcing_out_rate[*basin] / scaling.flow;
                    let factor_col = self.vars[&AllocVar::LowStorageFactor(*basin)];
                    self.lp.set_coefficient(*row, factor_col, f_out);
                    self.lp.apply_row_bounds(*row, f_in, f_in);
                }
                RefreshRow::LowStorageAvailability { basin, row } => {
                    let upper = ctx.basins.storage[*basin] / scaling.storage;
                    self.lp.apply_row_bounds(*row, -1e30, upper);
                }
                RefreshRow::Linearized { class, index, row } => {
                    // Implicit-Euler consistency: linearize at the levels of
                    // the end of the step, boundary series at t + Δt.
                    let t_end = ctx.t + ctx.dt;
                    let ends = ctx.physics.connectivity.of_class(*class).expect("connector class")[*index];
                    let mut evaluated = None;
                    for source in [ends.up, ends.dn] {
                        let WaterSource::Basin(b) = source else { continue };
                        let Some(&change_col) = self.vars.get(&AllocVar::StorageChange(b)) else {
                            continue;
                        };
                        let seeded = |basin: usize| {
                            if basin == b {
                                Dual::variable(ctx.basins.storage[basin])
                            } else {
                                Dual::constant(ctx.basins.storage[basin])
                            }
                        };
                        let q: Dual = ctx
                            .physics
                            .component_value(*class, *index, t_end, nodes, ctx.basins, &seeded);
                        evaluated = Some(q.re);
                        self.lp
                            .set_coefficient(*row, change_col, -q.eps * scaling.storage / scaling.flow);
                    }
                    let q0 = evaluated.unwrap_or_else(|| {
                        // No basin ends in this subnetwork: evaluate plainly.
                        let plain = |basin: usize| ctx.basins.storage[basin];
                        ctx.physics
                            .component_value(*class, *index, t_end, nodes, ctx.basins, &plain)
                    });
                    self.lp.apply_row_bounds(*row, q0 / scaling.flow, q0 / scaling.flow);
                }
                RefreshRow::FixedPump {
                    node,
                    link,
                    upstream_basin,
                    row,
                } => {
                    let pump = nodes.pump_like(node).expect("container matches type");
                    let rate = pump.target_flow_rate(ctx.t);
                    match upstream_basin {
                        Some(b) => {
                            let factor_col = self.vars[&AllocVar::LowStorageFactor(*b)];
                            self.lp.set_coefficient(*row, factor_col, -rate);
                            self.lp.apply_row_bounds(*row, 0.0, 0.0);
                        }
                        None => {
                            let col = self.vars[&AllocVar::Flow(*link)];
                            self.lp.set_col_bounds(col, Bounds::Fixed(rate / scaling.flow));
                            self.lp.apply_row_bounds(*row, -1e30, 1e30);
                        }
                    }
                }
                RefreshRow::ReturnFlow { user, row } => {
                    // flow_out − rf(t)·flow_in = 0; the inflow coefficient
                    // was built as a pattern placeholder.
                    let rf = nodes.user_demands[*user].return_factor(ctx.t);
                    let ends = &ctx.physics.connectivity.user_demands[*user];
                    let in_col = self.vars[&AllocVar::Flow(ends.inflow_link)];
                    self.lp.set_coefficient(*row, in_col, -rf);
                    self.lp.apply_row_bounds(*row, 0.0, 0.0);
                }
                RefreshRow::ErrorFirst { demand, row } => {
                    let (demand_value, alloc_var, error_var, scale) = match demand {
                        DemandRef::User(user, p) => (
                            nodes.user_demands[*user].demand(*p, ctx.t),
                            AllocVar::UserAllocated(*user, *p),
                            AllocVar::UserErrorFirst(*user, *p),
                            scaling.flow,
                        ),
                        DemandRef::FlowDemand(fd, p) => (
                            nodes.flow_demands[*fd].demand(*p, ctx.t),
                            AllocVar::FlowDemandAllocated(*fd, *p),
                            AllocVar::FlowDemandErrorFirst(*fd, *p),
                            scaling.flow,
                        ),
                        DemandRef::Level(ld, p, side) => {
                            let basin = nodes.level_demands[*ld].target.index;
                            let s_now = ctx.basins.storage[basin];
                            let profile = &nodes.basins[basin].profile;
                            let target = match side {
                                Side::Lower => nodes.level_demands[*ld]
                                    .min_level(*p, ctx.t)
                                    .map(|level| (profile.storage(level) - s_now).max(0.0)),
                                Side::Upper => nodes.level_demands[*ld]
                                    .max_level(*p, ctx.t)
                                    .map(|level| (s_now - profile.storage(level)).max(0.0)),
                            };
                            (
                                target.unwrap_or(0.0),
                                AllocVar::LevelAllocated(*ld, *p, *side),
                                AllocVar::LevelErrorFirst(*ld, *p, *side),
                                scaling.storage,
                            )
                        }
                        DemandRef::Inlet(link, p) => (
                            match pass {
                                SolvePass::Collect => 0.0,
                                SolvePass::Allocate => self.inlet_demands.get(&(*link, *p)).copied().unwrap_or(0.0),
                            },
                            AllocVar::InletAllocated(*link, *p),
                            AllocVar::InletErrorFirst(*link, *p),
                            scaling.flow,
                        ),
                    };
                    let alloc_col = self.vars[&alloc_var];
                    let error_col = self.vars[&error_var];
                    // Allocated is bounded by the demand; the error row only
                    // binds for a positive demand.
                    self.lp
                        .set_col_bounds(alloc_col, Bounds::Double(0.0, demand_value / scale));
                    if demand_value > 0.0 {
                        self.lp.set_coefficient(*row, error_col, demand_value);
                        self.lp.set_coefficient(*row, alloc_col, scale);
                        self.lp.apply_row_bounds(*row, demand_value, 1e30);
                    } else {
                        self.lp.set_coefficient(*row, error_col, 1.0);
                        self.lp.set_coefficient(*row, alloc_col, 0.0);
                        self.lp.apply_row_bounds(*row, 0.0, 1e30);
                    }
                }
            }
        }

        // Flow boundaries: fix discharge at the interval mean.
        for (fb_index, boundary) in nodes.flow_boundaries.iter().enumerate() {
            for link in ctx.graph.outflow_links(&boundary.node_id) {
                if let Some(&col) = self.vars.get(&AllocVar::Flow(*link)) {
                    let mean = ctx.boundary_mean_flow[fb_index];
                    self.lp.set_col_bounds(col, Bounds::Fixed(mean / scaling.flow));
                }
            }
        }

        // Inlet links: free while collecting, granted when allocating.
        for &inlet in &self.source_inlets {
            if let Some(&col) = self.vars.get(&AllocVar::Flow(inlet)) {
                match pass {
                    SolvePass::Collect => self.lp.set_col_bounds(col, Bounds::Lower(0.0)),
                    SolvePass::Allocate => {
                        let grant = self.inlet_grants.get(&inlet).copied().unwrap_or(0.0);
                        self.lp.set_col_bounds(col, Bounds::Fixed(grant / scaling.flow));
                    }
                }
            }
        }
    }

    /// Walk the goal-programming stack: each stage minimizes its objective
    /// with every previous stage pinned at its achieved value.
    pub fn solve(&mut self, pass: SolvePass) -> Result<SolveResult, AllocationError> {
        let mut pins: Vec<(Vec<(usize, f64)>, f64)> = Vec::new();
        let mut inlet_flow_per_priority = HashMap::new();
        let mut final_values: Vec<f64> = self.last_solution.clone().unwrap_or_else(|| vec![0.0; self.lp.num_cols()]);

        for stage in &self.stages {
            self.lp.zero_obj_coefficients();
            for (col, coef) in &stage.terms {
                self.lp.add_obj_coefficient(*col, *coef);
            }
            let (problem, variables) = self.lp.to_problem(&pins);
            let solution = match problem.solve() {
                Ok(solution) => solution,
                Err(source) => {
                    self.diagnose_infeasibility(&stage.label);
                    return Err(AllocationError::Infeasible {
                        subnetwork: self.subnetwork_id,
                        stage: stage.label.clone(),
                        source,
                    });
                }
            };
            let achieved = solution.objective();
            pins.push((stage.terms.clone(), achieved + PIN_SLACK));

            final_values = variables.iter().map(|v| *solution.var_value(*v)).collect();

            // After each flow-priority stage of a collection pass, record the
            // minimal inlet flow supporting the achieved allocations: the
            // increment over the previous priority is that priority's demand
            // on the primary. The auxiliary objective is not pinned.
            if pass == SolvePass::Collect {
                if let StageKind::FirstError(p) = stage.kind {
                    let inlet_cols: Vec<usize> = self
                        .source_inlets
                        .iter()
                        .filter_map(|inlet| self.vars.get(&AllocVar::Flow(*inlet)).copied())
                        .collect();
                    if !inlet_cols.is_empty() {
                        self.lp.zero_obj_coefficients();
                        for &col in &inlet_cols {
                            self.lp.add_obj_coefficient(col, 1.0);
                        }
                        let (problem, variables) = self.lp.to_problem(&pins);
                        let minimal = problem.solve().map_err(|source| AllocationError::Infeasible {
                            subnetwork: self.subnetwork_id,
                            stage: format!("{} (inlet measurement)", stage.label),
                            source,
                        })?;
                        for &inlet in &self.source_inlets {
                            if let Some(&col) = self.vars.get(&AllocVar::Flow(inlet)) {
                                inlet_flow_per_priority
                                    .insert((inlet, p), *minimal.var_value(variables[col]) * self.scaling.flow);
                            }
                        }
                    }
                }
            }
        }

        self.last_solution = Some(final_values.clone());
        Ok(SolveResult {
            values: final_values,
            inlet_flow_per_priority,
        })
    }

    /// Whether each link's flow ended on its lower/upper bound, for the
    /// bound-hit flags of the flow output stream.
    pub fn flow_bound_hits(&self, values: &[f64]) -> Vec<(LinkId, bool, bool)> {
        self.links
            .iter()
            .map(|&link| {
                let col = self.vars[&AllocVar::Flow(link)];
                let (lb, ub) = self.lp.col_bounds(col);
                let value = values[col];
                let at_lower = (value - lb).abs() < 1e-9;
                let at_upper = ub < 1e29 && (ub - value).abs() < 1e-9;
                (link, at_lower, at_upper)
            })
            .collect()
    }

    /// On a non-optimal termination: log the model shape and every row whose
    /// refreshed bounds are contradictory, then let the caller abort.
    fn diagnose_infeasibility(&self, stage: &str) {
        error!(
            subnetwork = self.subnetwork_id,
            stage,
            columns = self.lp.num_cols(),
            rows = self.lp.num_rows(),
            "allocation LP infeasible; dumping model diagnostics"
        );
        for col in 0..self.lp.num_cols() {
            let (lb, ub) = self.lp.col_bounds(col);
            if lb > ub {
                error!(col, lb, ub, "contradictory column bounds");
            }
        }
        for (var, col) in &self.vars {
            let (lb, ub) = self.lp.col_bounds(*col);
            if lb > ub {
                error!(?var, lb, ub, "variable with contradictory bounds");
            }
        }
    }
}

/// Row `d·error_first + scale·allocated ≥ d`, coefficients refreshed per
/// solve; built with pattern placeholders.
fn error_first_row(builder: &mut LpBuilder<usize>, error_col: usize, alloc_col: usize) -> usize {
    let mut row = RowBuilder::default();
    row.add_element(error_col, 1.0);
    row.add_element(alloc_col, 0.0);
    builder.add_variable_row(row)
}

/// Fixed fairness row `error_second − error_first + average ≥ 0`.
fn fairness_row(builder: &mut LpBuilder<usize>, second_col: usize, first_col: usize, average_col: usize) {
    let mut row = RowBuilder::default();
    row.add_element(second_col, 1.0);
    row.add_element(first_col, -1.0);
    row.add_element(average_col, 1.0);
    row.set_lower(0.0);
    builder.add_fixed_row(row);
}

/// Capacity bounds of a link from its endpoint nodes.
fn link_capacity_bounds(graph: &Graph, nodes: &Nodes, link: LinkId, flow_scale: f64) -> Bounds {
    let link = graph.link(link);
    let mut upper = f64::INFINITY;
    let mut lower: f64 = 0.0;
    for node in [&link.from, &link.to] {
        match node.node_type {
            NodeType::Pump | NodeType::Outlet => {
                if let Some(pump) = nodes.pump_like(node) {
                    upper = upper.min(pump.params.max_flow_rate);
                }
            }
            NodeType::LinearResistance => {
                let max = nodes.linear_resistances[node.index].params.max_flow_rate;
                upper = upper.min(max);
                lower = lower.min(-max);
            }
            _ => {}
        }
    }
    if upper.is_finite() {
        Bounds::Double(lower / flow_scale, upper / flow_scale)
    } else if lower < 0.0 {
        Bounds::Free
    } else {
        Bounds::Lower(0.0)
    }
}
