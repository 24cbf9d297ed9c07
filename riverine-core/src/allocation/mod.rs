//! The allocation optimizer.
//!
//! Every `allocation_timestep` seconds, each subnetwork's LP is refreshed
//! from the physical layer and solved through the goal-programming stack.
//! With nested subnetworks the sequencing is: demand collection on each
//! secondary (inlets unclamped), then the primary (collected demands treated
//! as prioritized inlet demands), then each secondary again with its inlet
//! fixed to what the primary granted. Results are written back as commanded
//! flow rates on allocation-controlled pumps and outlets.

mod builder;
mod model;

pub use builder::{Bounds, Lp, LpBuilder, RowBuilder};
pub use model::{AllocVar, AllocationError, AllocationModel, RefreshContext, Scaling, Side, SolvePass, SolveResult};

use crate::callbacks::CumulativeTracker;
use crate::graph::{Graph, NodeType};
use crate::nodes::Nodes;
use crate::physics::{BasinState, Physics};
use crate::records::{AllocationFlowRecord, DemandRecord, Records};
use crate::state::ComponentClass;
use std::collections::HashMap;
use tracing::debug;

pub struct AllocationSet {
    pub models: Vec<AllocationModel>,
    /// Per link: whether the last allocation solution sat on its bounds.
    pub bound_hits: HashMap<crate::graph::LinkId, (bool, bool)>,
    dt: f64,
}

impl AllocationSet {
    /// Build one persistent model per subnetwork. Pumps and outlets inside a
    /// subnetwork become allocation-controlled unless another controller
    /// already owns them.
    pub fn new(graph: &Graph, nodes: &mut Nodes, physics: &Physics, dt: f64) -> Self {
        for subnetwork_id in graph.subnetwork_ids() {
            for node in graph.nodes_in_subnetwork(subnetwork_id) {
                if matches!(node.node_type, NodeType::Pump | NodeType::Outlet) {
                    let has_controller = !graph.control_in_links(node).is_empty();
                    if let Some(pump) = nodes.pump_like_mut(node) {
                        pump.allocation_controlled = !has_controller && !pump.pid_controlled;
                    }
                }
            }
        }

        let models = graph
            .subnetwork_ids()
            .map(|subnetwork_id| AllocationModel::new(subnetwork_id, graph, nodes, physics, dt))
            .collect();
        Self {
            models,
            bound_hits: HashMap::new(),
            dt,
        }
    }

    /// One allocation tick at time `t`. `basins` must be updated at `(t, u)`.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &mut self,
        t: f64,
        graph: &Graph,
        nodes: &mut Nodes,
        physics: &Physics,
        basins: &BasinState,
        tracker: &mut CumulativeTracker,
        u: &[f64],
        records: &mut Records,
    ) -> Result<(), AllocationError> {
        let elapsed = (t - tracker.t_last_allocation).max(self.dt * 1e-9);

        // Mean forcing and boundary rates over the finished interval.
        let n_basins = nodes.basins.len();
        let mut forcing_in_rate = vec![0.0; n_basins];
        let mut forcing_out_rate = vec![0.0; n_basins];
        let boundary_mean_flow: Vec<f64> = nodes
            .flow_boundaries
            .iter()
            .enumerate()
            .map(|(i, boundary)| (boundary.volume(t) - tracker.boundary_volume_last_allocation[i]) / elapsed)
            .collect();
        for (b, basin) in nodes.basins.iter().enumerate() {
            let boundary_volume: f64 = nodes.basin_boundary_inflows[b]
                .iter()
                .map(|&i| nodes.flow_boundaries[i].volume(t) - tracker.boundary_volume_last_allocation[i])
                .sum();
            let exact = basin.exact_inflow.volume(t) - tracker.basin_forcing_last_allocation[b];
            // Boundary inflows enter the LP as link flows, not as forcing.
            forcing_in_rate[b] = (exact - boundary_volume) / elapsed;

            let evap = physics.layout.index(ComponentClass::BasinEvaporation, b);
            let infiltration = physics.layout.index(ComponentClass::BasinInfiltration, b);
            forcing_out_rate[b] = (u[evap] - tracker.u_last_allocation[evap] + u[infiltration]
                - tracker.u_last_allocation[infiltration])
                / elapsed;
        }

        // The refresh context immutably borrows the node store, while
        // writeback mutates it; scope each refresh+solve so the borrows
        // alternate cleanly.
        let dt = self.dt;
        let refresh_and_solve = |model: &mut AllocationModel,
                                 nodes: &Nodes,
                                 pass: SolvePass|
         -> Result<SolveResult, AllocationError> {
            let ctx = RefreshContext {
                t,
                dt,
                graph,
                nodes,
                physics,
                basins,
                forcing_in_rate: &forcing_in_rate,
                forcing_out_rate: &forcing_out_rate,
                boundary_mean_flow: &boundary_mean_flow,
            };
            model.refresh(&ctx, pass);
            model.solve(pass)
        };

        let mut bound_hits: HashMap<crate::graph::LinkId, (bool, bool)> = HashMap::new();
        let has_primary = self.models.iter().any(|m| m.is_primary);
        if has_primary {
            // Demand collection on every secondary.
            let mut collected: HashMap<(crate::graph::LinkId, usize), f64> = HashMap::new();
            for model in self.models.iter_mut().filter(|m| !m.is_primary) {
                let result = refresh_and_solve(model, nodes, SolvePass::Collect)?;
                record_allocation_flows(records, graph, model, &result.values, t, "collect_demands");

                // Per-priority demand = increment of inlet flow across the
                // ascending priority stages.
                let mut per_inlet: HashMap<crate::graph::LinkId, Vec<(usize, f64)>> = HashMap::new();
                for ((link, priority), flow) in &result.inlet_flow_per_priority {
                    per_inlet.entry(*link).or_default().push((*priority, *flow));
                }
                for (link, mut flows) in per_inlet {
                    flows.sort_by_key(|(priority, _)| *priority);
                    let mut previous = 0.0;
                    for (priority, flow) in flows {
                        collected.insert((link, priority), (flow - previous).max(0.0));
                        previous = flow;
                    }
                }
            }
            debug!(?collected, t, "collected secondary inlet demands");

            // Primary allocation with the collected inlet demands.
            let mut grants: HashMap<crate::graph::LinkId, f64> = HashMap::new();
            {
                let primary = self
                    .models
                    .iter_mut()
                    .find(|m| m.is_primary)
                    .expect("has_primary checked");
                primary.inlet_demands = collected.clone();
                let result = refresh_and_solve(primary, nodes, SolvePass::Allocate)?;
                record_allocation_flows(records, graph, primary, &result.values, t, "allocate");
                for (link, lower, upper) in primary.flow_bound_hits(&result.values) {
                    bound_hits.insert(link, (lower, upper));
                }
                for &inlet in &primary.demand_inlets.clone() {
                    grants.insert(inlet, primary.value(&result.values, AllocVar::Flow(inlet)));
                    for p in 0..nodes.demand_priorities.len() {
                        let demand = collected.get(&(inlet, p)).copied().unwrap_or(0.0);
                        if demand > 0.0 {
                            records.allocation_demand.push(DemandRecord {
                                time: t,
                                subnetwork_id: 1,
                                node_type: graph.link(inlet).from.node_type.to_string(),
                                node_id: graph.link(inlet).from.ordinal,
                                priority: nodes.demand_priorities[p],
                                demand,
                                allocated: primary.value(&result.values, AllocVar::InletAllocated(inlet, p)),
                                realized: 0.0,
                            });
                        }
                    }
                }
                write_back(primary, &result.values, graph, nodes, physics, basins, tracker, u, records, t, elapsed);
            }

            // Secondaries with granted inlet flows.
            for model in self.models.iter_mut().filter(|m| !m.is_primary) {
                for &inlet in &model.source_inlets.clone() {
                    if let Some(&grant) = grants.get(&inlet) {
                        model.inlet_grants.insert(inlet, grant);
                    }
                }
                let result = refresh_and_solve(model, nodes, SolvePass::Allocate)?;
                record_allocation_flows(records, graph, model, &result.values, t, "allocate");
                for (link, lower, upper) in model.flow_bound_hits(&result.values) {
                    bound_hits.insert(link, (lower, upper));
                }
                write_back(model, &result.values, graph, nodes, physics, basins, tracker, u, records, t, elapsed);
            }
        } else {
            for model in &mut self.models {
                let result = refresh_and_solve(model, nodes, SolvePass::Allocate)?;
                record_allocation_flows(records, graph, model, &result.values, t, "allocate");
                for (link, lower, upper) in model.flow_bound_hits(&result.values) {
                    bound_hits.insert(link, (lower, upper));
                }
                write_back(model, &result.values, graph, nodes, physics, basins, tracker, u, records, t, elapsed);
            }
        }

        self.bound_hits = bound_hits;
        tracker.mark_allocation(u, t, nodes, &basins.storage);
        Ok(())
    }
}

/// Append one allocation-flow record per link of the model.
fn record_allocation_flows(
    records: &mut Records,
    graph: &Graph,
    model: &AllocationModel,
    values: &[f64],
    t: f64,
    optimization_type: &'static str,
) {
    for &link_id in &model.links {
        let link = graph.link(link_id);
        records.allocation_flow.push(AllocationFlowRecord {
            time: t,
            link_id: link.external_id,
            from_node: link.from,
            to_node: link.to,
            subnetwork_id: model.subnetwork_id,
            flow_rate: model.value(values, AllocVar::Flow(link_id)),
            optimization_type,
        });
    }
}

/// Install the solution on the physical layer and append demand records.
#[allow(clippy::too_many_arguments)]
fn write_back(
    model: &AllocationModel,
    values: &[f64],
    graph: &Graph,
    nodes: &mut Nodes,
    physics: &Physics,
    basins: &BasinState,
    tracker: &CumulativeTracker,
    u: &[f64],
    records: &mut Records,
    t: f64,
    elapsed: f64,
) {
    let subnetwork_id = model.subnetwork_id;

    // Commanded flow rates for allocation-controlled pumps and outlets.
    for node in graph.nodes_in_subnetwork(subnetwork_id) {
        if !matches!(node.node_type, NodeType::Pump | NodeType::Outlet) {
            continue;
        }
        let Ok(inflow) = graph.single_inflow(node) else { continue };
        let Some(col) = model.col(AllocVar::Flow(inflow)) else { continue };
        let flow = values[col] * model.scaling.flow;
        if let Some(pump) = nodes.pump_like_mut(node) {
            if pump.allocation_controlled {
                pump.commanded_flow_rate = Some(flow);
            }
        }
    }

    // User allocations plus their demand records.
    for &user in &model.member_users {
        let node = nodes.user_demands[user].node_id;
        let inflow_comp = physics.layout.index(ComponentClass::UserDemandInflow, user);
        let realized = tracker.mean_since_allocation(inflow_comp, u, t);
        for p in 0..nodes.demand_priorities.len() {
            if !nodes.user_demands[user].has_priority(p) {
                continue;
            }
            let allocated = model.value(values, AllocVar::UserAllocated(user, p));
            let demand = nodes.user_demands[user].demand(p, t);
            nodes.user_demands[user].allocated[p] = allocated;
            records.allocation_demand.push(DemandRecord {
                time: t,
                subnetwork_id,
                node_type: node.node_type.to_string(),
                node_id: node.ordinal,
                priority: nodes.demand_priorities[p],
                demand,
                allocated,
                realized,
            });
        }
    }

    for &fd in &model.member_flow_demands {
        let node = nodes.flow_demands[fd].node_id;
        let target = nodes.flow_demands[fd].target;
        let realized = match target.node_type {
            NodeType::LinearResistance => {
                tracker.mean_since_allocation(physics.layout.index(ComponentClass::LinearResistance, target.index), u, t)
            }
            NodeType::ManningResistance => {
                tracker.mean_since_allocation(physics.layout.index(ComponentClass::ManningResistance, target.index), u, t)
            }
            NodeType::TabulatedRatingCurve => {
                tracker.mean_since_allocation(physics.layout.index(ComponentClass::RatingCurve, target.index), u, t)
            }
            NodeType::Pump => tracker.mean_since_allocation(physics.layout.index(ComponentClass::Pump, target.index), u, t),
            NodeType::Outlet => {
                tracker.mean_since_allocation(physics.layout.index(ComponentClass::Outlet, target.index), u, t)
            }
            _ => 0.0,
        };
        for p in 0..nodes.demand_priorities.len() {
            if !nodes.flow_demands[fd].has_priority(p) {
                continue;
            }
            records.allocation_demand.push(DemandRecord {
                time: t,
                subnetwork_id,
                node_type: node.node_type.to_string(),
                node_id: node.ordinal,
                priority: nodes.demand_priorities[p],
                demand: nodes.flow_demands[fd].demand(p, t),
                allocated: model.value(values, AllocVar::FlowDemandAllocated(fd, p)),
                realized,
            });
        }
    }

    for &ld in &model.member_level_demands {
        let node = nodes.level_demands[ld].node_id;
        let basin = nodes.level_demands[ld].target.index;
        let realized = (basins.storage[basin] - tracker.basin_storage_last_allocation[basin]) / elapsed;
        for p in 0..nodes.demand_priorities.len() {
            if !nodes.level_demands[ld].has_priority(p) {
                continue;
            }
            for side in [Side::Lower, Side::Upper] {
                let allocated = model.value(values, AllocVar::LevelAllocated(ld, p, side));
                let demand = match side {
                    Side::Lower => nodes.level_demands[ld]
                        .min_level(p, t)
                        .map(|level| (nodes.basins[basin].profile.storage(level) - basins.storage[basin]).max(0.0)),
                    Side::Upper => nodes.level_demands[ld]
                        .max_level(p, t)
                        .map(|level| (basins.storage[basin] - nodes.basins[basin].profile.storage(level)).max(0.0)),
                };
                let Some(demand) = demand else { continue };
                records.allocation_demand.push(DemandRecord {
                    time: t,
                    subnetwork_id,
                    node_type: node.node_type.to_string(),
                    node_id: node.ordinal,
                    priority: nodes.demand_priorities[p],
                    demand,
                    allocated,
                    realized,
                });
            }
        }
    }
}
