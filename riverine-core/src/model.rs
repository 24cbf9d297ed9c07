//! Model construction and the simulation loop.
//!
//! [`Model::from_schema`] validates the input tables in one batch, builds the
//! graph, the parameter store, the physics, the control set and the
//! allocation models. [`Model::run`] owns the main loop: one accepted
//! integrator step at a time, followed by the callbacks in their documented
//! order, with every scheduled instant hit exactly.

use crate::allocation::{AllocationError, AllocationSet};
use crate::callbacks::{CumulativeTracker, EventClock};
use crate::control::{
    CompoundVariable, Condition, ContinuousControl, ControlError, ControlSet, DiscreteControl, ObservedVariable,
    PidControl, Subvariable,
};
use crate::graph::{Graph, LinkId, LinkType, NodeId, NodeType};
use crate::interpolate::{Extrapolation, Interpolation, PchipInterpolation};
use crate::jacobian::ReducedJacobian;
use crate::nodes::{
    Basin, BasinProfile, FlowBoundary, FlowDemand, Forcings, LevelBoundary, LevelDemand, LevelDemandSeries,
    LinearResistance, LinearResistanceParams, ManningResistance, ManningResistanceParams, Nodes, Pump, PumpParams,
    RatingCurveParams, SubgridElement, TabulatedRatingCurve, UserDemand,
};
use crate::physics::{BasinState, Physics};
use crate::records::{
    BasinStateRecord, ControlRecord, ControlledFlowRecord, FlowRecord, Records, SolverStatsRecord, SubgridLevelRecord,
};
use crate::schema::Schema;
use crate::settings::Settings;
use crate::solver::{Integrator, SolverError, SolverStats};
use crate::state::{ComponentClass, WaterSource};
use crate::validate::{ValidationError, ValidationErrors, validate};
use chrono::NaiveDateTime;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("storage of {node} is negative ({storage:.6} m³) at {time}")]
    NegativeStorage { node: NodeId, storage: f64, time: String },
    #[error("water balance of {node} violated at {time}: residual {residual:.3e} m³ exceeds tolerance {tolerance:.3e} m³")]
    WaterBalance {
        node: NodeId,
        residual: f64,
        tolerance: f64,
        time: String,
    },
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),
    #[error(transparent)]
    Solver(#[from] SolverError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// How the flow of one link derives from the cumulative state.
#[derive(Debug, Clone)]
enum LinkFlowSource {
    /// A state component (connector flow or user return flow).
    Component(usize),
    /// A flow boundary's exact integral.
    Boundary(usize),
    /// Junction-adjacent link: signed sum of components on the far side.
    Aggregate(Vec<(usize, f64)>),
    None,
}

pub struct Model {
    pub graph: Graph,
    pub nodes: Nodes,
    pub physics: Physics,
    pub controls: ControlSet,
    pub settings: Settings,
    pub records: Records,

    integrator: Integrator,
    jacobian: ReducedJacobian,
    basins: BasinState,
    clock: EventClock,
    tracker: CumulativeTracker,
    allocation: Option<AllocationSet>,
    link_flow_sources: Vec<LinkFlowSource>,
    du_scratch: Vec<f64>,
    stats_at_last_save: SolverStats,
}

impl Model {
    pub fn from_schema(schema: &Schema, settings: Settings) -> Result<Self, ModelError> {
        validate(schema)?;

        let mut build_errors: Vec<ValidationError> = Vec::new();
        let mut graph = Graph::default();
        let mut ordered_nodes = schema.nodes.clone();
        ordered_nodes.sort_by_key(|n| n.node_id);
        for row in &ordered_nodes {
            let node_type = NodeType::from_str(&row.node_type).expect("validated");
            if let Err(e) = graph.add_node(node_type, row.node_id, row.subnetwork_id, row.source_priority) {
                build_errors.push(ValidationError::Build { message: e.to_string() });
            }
        }
        for row in &schema.links {
            let link_type = if row.link_type == "flow" {
                LinkType::Flow
            } else {
                LinkType::Control
            };
            let endpoints = (
                graph.nodes().iter().find(|n| n.ordinal == row.from_node_id).copied(),
                graph.nodes().iter().find(|n| n.ordinal == row.to_node_id).copied(),
            );
            if let (Some(from), Some(to)) = endpoints {
                if let Err(e) = graph.add_link(row.link_id, from, to, link_type) {
                    build_errors.push(ValidationError::Build { message: e.to_string() });
                }
            }
        }

        let cyclic: HashSet<i32> = schema
            .nodes
            .iter()
            .filter(|n| n.cyclic_time.unwrap_or(false))
            .map(|n| n.node_id)
            .collect();

        let mut nodes = build_nodes(schema, &graph, &cyclic, &settings, &mut build_errors);

        let physics = match Physics::new(&graph) {
            Ok(physics) => physics,
            Err(e) => {
                build_errors.push(ValidationError::Build { message: e.to_string() });
                return Err(ValidationErrors(build_errors).into());
            }
        };

        let controls = build_controls(schema, &graph, &physics, &cyclic, &mut build_errors);
        if !build_errors.is_empty() {
            return Err(ValidationErrors(build_errors).into());
        }
        controls.mark_pid_targets(&mut nodes);

        let allocation = settings
            .allocation_timestep
            .map(|dt| AllocationSet::new(&graph, &mut nodes, &physics, dt));

        let layout_len = physics.layout.len();
        let integrator = Integrator::new(layout_len, settings.abstol, settings.reltol, settings.maxiters);
        let jacobian = ReducedJacobian::new(&physics, &controls.pids, settings.parallel_jacobian);
        let basins = BasinState::new(&physics.layout);
        let clock = EventClock::new(&settings, &nodes.forcing_change_times(settings.duration));
        let tracker = CumulativeTracker::new(layout_len, nodes.basins.len(), nodes.flow_boundaries.len());
        let link_flow_sources = resolve_link_flow_sources(&graph, &physics);

        // Install the t = 0 forcing rates including boundary inflows.
        nodes.apply_forcing_step(0.0);

        info!(
            nodes = graph.nodes().len(),
            links = graph.links().len(),
            state = layout_len,
            basins = nodes.basins.len(),
            "model built"
        );

        Ok(Self {
            graph,
            nodes,
            physics,
            controls,
            settings,
            records: Records::default(),
            integrator,
            jacobian,
            basins,
            clock,
            tracker,
            allocation,
            link_flow_sources,
            du_scratch: vec![0.0; layout_len],
            stats_at_last_save: SolverStats::default(),
        })
    }

    pub fn stats(&self) -> &SolverStats {
        &self.integrator.stats
    }

    pub fn current_time(&self) -> f64 {
        self.integrator.t
    }

    pub fn basin_storage(&self, ordinal: i32) -> Option<f64> {
        let node = self.graph.node(NodeType::Basin, ordinal).ok()?;
        self.basins.storage.get(node.index).copied()
    }

    pub fn basin_level(&self, ordinal: i32) -> Option<f64> {
        let node = self.graph.node(NodeType::Basin, ordinal).ok()?;
        self.basins.level.get(node.index).copied()
    }

    fn timestamp(&self, t: f64) -> String {
        let shifted = self.settings.start + chrono::Duration::milliseconds((t * 1000.0).round() as i64);
        shifted.format("%Y-%m-%d %H:%M:%S").to_string()
    }

    /// Run the model from `t = 0` to `settings.duration`.
    ///
    /// After each accepted step the callbacks run in this order: negative
    /// storage guard, save basin state, cumulative-flow accounting, (tracer
    /// slot), forcing step changes, (boundary-concentration slot), save flows
    /// with the water-balance check, save subgrid levels, discrete control,
    /// tolerance tightening. Allocation runs on its own clock between steps.
    pub fn run(&mut self) -> Result<(), ModelError> {
        let run_start = Instant::now();
        let mut wall_at_last_save = Instant::now();

        // Initial derived state, truth states and first records at t = 0.
        self.physics.rhs(
            0.0,
            &self.integrator.u,
            &self.nodes,
            &self.controls.pids,
            &mut self.basins,
            &mut self.du_scratch,
        );
        let (transitions, controlled, _) =
            self.controls
                .apply(0.0, &self.physics, &mut self.nodes, &self.basins)?;
        self.append_control_records(&transitions, &controlled);
        for (b, basin) in self.nodes.basins.iter().enumerate() {
            self.records.basin_state.push(BasinStateRecord {
                time: 0.0,
                node_id: basin.node_id.ordinal,
                storage: self.basins.storage[b],
                level: self.basins.level[b],
            });
        }
        self.tracker
            .mark_save(&self.integrator.u, 0.0, &self.nodes, &self.basins.storage);
        self.tracker
            .mark_allocation(&self.integrator.u, 0.0, &self.nodes, &self.basins.storage);

        let duration = self.settings.duration;
        while self.integrator.t < duration - 1e-9 {
            let target = self.clock.next_after(self.integrator.t).unwrap_or(duration).min(duration);
            self.integrator.step_once(
                target,
                &self.physics,
                &self.nodes,
                &self.controls.pids,
                &mut self.jacobian,
                &mut self.basins,
            )?;
            // Snap onto the event instant so saved times are exact.
            if (self.integrator.t - target).abs() <= 1e-9 {
                self.integrator.t = target;
            }
            let t = self.integrator.t;
            let events = self.clock.take_events_at(t);

            // 1. Negative-storage guard; runs the RHS first so every derived
            //    cache is current.
            self.physics.rhs(
                t,
                &self.integrator.u,
                &self.nodes,
                &self.controls.pids,
                &mut self.basins,
                &mut self.du_scratch,
            );
            let guard = -2.0 * self.settings.abstol;
            for (b, &storage) in self.basins.storage.iter().enumerate() {
                if storage < guard {
                    return Err(RuntimeError::NegativeStorage {
                        node: self.nodes.basins[b].node_id,
                        storage,
                        time: self.timestamp(t),
                    }
                    .into());
                }
            }

            // 2. Save basin state.
            if events.save {
                for (b, basin) in self.nodes.basins.iter().enumerate() {
                    self.records.basin_state.push(BasinStateRecord {
                        time: t,
                        node_id: basin.node_id.ordinal,
                        storage: self.basins.storage[b],
                        level: self.basins.level[b],
                    });
                }
            }

            // 3. Cumulative flows are the integrator state itself; the
            //    interval accounting happens at the save/allocation marks.

            // 5. Forcing step changes.
            if events.forcing_change {
                self.nodes.apply_forcing_step(t);
                self.basins.invalidate();
                self.integrator.reset_history();
                debug!(t, "applied stepwise forcing change");
            }

            // 7. Save flows averaged over the interval + water balance check.
            if events.save {
                self.save_flows(t)?;
            }

            // 8. Save subgrid levels.
            if events.save {
                for (b, basin) in self.nodes.basins.iter().enumerate() {
                    for element in &basin.subgrid {
                        self.records.subgrid_level.push(SubgridLevelRecord {
                            time: t,
                            subgrid_id: element.subgrid_id,
                            subgrid_level: element.table.value(self.basins.level[b]),
                        });
                    }
                }
            }

            // 9. Discrete control (and the per-step continuous writes).
            let (transitions, controlled, changed) =
                self.controls
                    .apply(t, &self.physics, &mut self.nodes, &self.basins)?;
            self.append_control_records(&transitions, &controlled);
            if changed {
                self.integrator.reset_history();
            }

            // Allocation runs at its own tick, after the regular callbacks.
            if events.allocation {
                if let Some(allocation) = self.allocation.as_mut() {
                    allocation.run(
                        t,
                        &self.graph,
                        &mut self.nodes,
                        &self.physics,
                        &self.basins,
                        &mut self.tracker,
                        &self.integrator.u,
                        &mut self.records,
                    )?;
                    self.integrator.reset_history();
                }
            }

            // 10. Tighten relative tolerances at logarithmic checkpoints.
            if let Some(checkpoint) = events.checkpoint {
                self.integrator.tighten_tolerances(&self.physics, checkpoint);
            }

            if events.save {
                let now = Instant::now();
                self.records.solver_stats.push(SolverStatsRecord::from_delta(
                    t,
                    now.duration_since(wall_at_last_save).as_secs_f64(),
                    &self.integrator.stats,
                    &self.stats_at_last_save,
                ));
                wall_at_last_save = now;
                self.stats_at_last_save = self.integrator.stats;
                self.tracker
                    .mark_save(&self.integrator.u, t, &self.nodes, &self.basins.storage);
            }
        }

        let stats = self.integrator.stats;
        info!(
            accepted = stats.accepted_steps,
            rejected = stats.rejected_steps,
            rhs_calls = stats.rhs_calls,
            linear_solves = stats.linear_solves,
            wall_seconds = run_start.elapsed().as_secs_f64(),
            "run finished"
        );
        Ok(())
    }

    /// Callback 7: append one flow record per flow link (interval mean) and
    /// check the water balance of every basin over the same interval.
    fn save_flows(&mut self, t: f64) -> Result<(), ModelError> {
        let dt = t - self.tracker.t_last_save;
        if dt <= 0.0 {
            return Ok(());
        }
        let u = &self.integrator.u;

        for link in self.graph.links() {
            if link.link_type != LinkType::Flow {
                continue;
            }
            let mean = match &self.link_flow_sources[*link.id] {
                LinkFlowSource::Component(comp) => (u[*comp] - self.tracker.u_last_save[*comp]) / dt,
                LinkFlowSource::Boundary(i) => {
                    (self.nodes.flow_boundaries[*i].volume(t) - self.tracker.boundary_volume_last_save[*i]) / dt
                }
                LinkFlowSource::Aggregate(parts) => parts
                    .iter()
                    .map(|(comp, sign)| sign * (u[*comp] - self.tracker.u_last_save[*comp]) / dt)
                    .sum(),
                LinkFlowSource::None => continue,
            };
            let (hit_lower_bound, hit_upper_bound) = self
                .allocation
                .as_ref()
                .and_then(|a| a.bound_hits.get(&link.id).copied())
                .unwrap_or((false, false));
            self.records.flow.push(FlowRecord {
                time: t,
                link_id: link.external_id,
                from_node: link.from,
                to_node: link.to,
                subnetwork_id: link.subnetwork_id_source,
                flow_rate: mean,
                hit_lower_bound,
                hit_upper_bound,
            });
        }

        // Water balance: storage change versus integrated fluxes.
        for (b, basin) in self.nodes.basins.iter().enumerate() {
            let delta_storage = self.basins.storage[b] - self.tracker.basin_storage_last_save[b];
            let mut fluxes = basin.exact_inflow.volume(t) - self.tracker.basin_forcing_last_save[b];
            if let Some(row) = self.physics.aggregation.outer_view(self.physics.layout.reduced_basin(b)) {
                for (comp, &coef) in row.iter() {
                    fluxes += coef * (u[comp] - self.tracker.u_last_save[comp]);
                }
            }
            // Compare as rates, per the water-balance tolerance contract.
            let residual = (delta_storage - fluxes) / dt;
            let mean_flow = (delta_storage.abs() + fluxes.abs()) / (2.0 * dt);
            let tolerance = self.settings.water_balance_abstol + self.settings.water_balance_reltol * mean_flow;
            if residual.abs() > tolerance {
                return Err(RuntimeError::WaterBalance {
                    node: basin.node_id,
                    residual,
                    tolerance,
                    time: self.timestamp(t),
                }
                .into());
            }
        }
        Ok(())
    }

    fn append_control_records(
        &mut self,
        transitions: &[crate::control::ControlTransition],
        controlled: &[crate::control::ControlledValue],
    ) {
        for transition in transitions {
            self.records.control.push(ControlRecord {
                time: transition.t,
                control_node_id: transition.node_id.ordinal,
                truth_state: transition.truth_state.clone(),
                control_state: transition.control_state.clone(),
            });
        }
        for value in controlled {
            self.records.controlled_flow.push(ControlledFlowRecord {
                time: value.t,
                node_id: value.node_id.ordinal,
                node_type: value.node_id.node_type.to_string(),
                flow_rate: value.value,
            });
        }
    }

    /// Write all output streams as CSV files under `dir`.
    pub fn write_results(&self, dir: &std::path::Path) -> Result<(), crate::records::RecordsError> {
        self.records.write_csv(dir, self.settings.start)
    }
}

/// Origin timestamp helper for tests and the CLI.
pub fn default_origin() -> NaiveDateTime {
    NaiveDateTime::default()
}

fn series_or_constant(
    xs: Vec<f64>,
    ys: Vec<f64>,
    cyclic: bool,
    errors: &mut Vec<ValidationError>,
    what: &str,
) -> Interpolation {
    if ys.is_empty() {
        return Interpolation::constant(0.0);
    }
    if ys.len() == 1 {
        return Interpolation::constant(ys[0]);
    }
    let result = if cyclic {
        Interpolation::new_cyclic(xs, ys)
    } else {
        Interpolation::new(xs, ys, Extrapolation::Constant, Extrapolation::Constant)
    };
    match result {
        Ok(interp) => interp,
        Err(e) => {
            errors.push(ValidationError::Build {
                message: format!("{what}: {e}"),
            });
            Interpolation::constant(0.0)
        }
    }
}

fn build_nodes(
    schema: &Schema,
    graph: &Graph,
    cyclic: &HashSet<i32>,
    settings: &Settings,
    errors: &mut Vec<ValidationError>,
) -> Nodes {
    let mut nodes = Nodes::default();

    // Global demand priorities, ascending.
    let mut priorities: Vec<i32> = Vec::new();
    priorities.extend(schema.user_demand_static.iter().map(|r| r.demand_priority));
    priorities.extend(schema.user_demand_time.iter().map(|r| r.demand_priority));
    priorities.extend(schema.flow_demand_static.iter().map(|r| r.demand_priority));
    priorities.extend(schema.flow_demand_time.iter().map(|r| r.demand_priority));
    priorities.extend(schema.level_demand_static.iter().map(|r| r.demand_priority));
    priorities.extend(schema.level_demand_time.iter().map(|r| r.demand_priority));
    priorities.sort();
    priorities.dedup();
    nodes.demand_priorities = priorities;
    let n_priorities = nodes.demand_priorities.len();

    for node in graph.nodes() {
        let ordinal = node.ordinal;
        match node.node_type {
            NodeType::Basin => {
                let mut levels = Vec::new();
                let mut areas = Vec::new();
                for row in schema.basin_profile.iter().filter(|r| r.node_id == ordinal) {
                    levels.push(row.level);
                    areas.push(row.area);
                }
                let profile = match BasinProfile::new(*node, levels, areas) {
                    Ok(profile) => profile,
                    Err(e) => {
                        errors.push(ValidationError::Build { message: e.to_string() });
                        continue;
                    }
                };

                let is_cyclic = cyclic.contains(&ordinal);
                let mut forcings = Forcings::default();
                if let Some(row) = schema.basin_static.iter().find(|r| r.node_id == ordinal) {
                    forcings.precipitation = Interpolation::constant(row.precipitation.unwrap_or(0.0));
                    forcings.potential_evaporation =
                        Interpolation::constant(row.potential_evaporation.unwrap_or(0.0));
                    forcings.drainage = Interpolation::constant(row.drainage.unwrap_or(0.0));
                    forcings.infiltration = Interpolation::constant(row.infiltration.unwrap_or(0.0));
                    forcings.surface_runoff = Interpolation::constant(row.surface_runoff.unwrap_or(0.0));
                } else {
                    let rows: Vec<_> = schema.basin_time.iter().filter(|r| r.node_id == ordinal).collect();
                    if !rows.is_empty() {
                        let xs: Vec<f64> = rows.iter().map(|r| r.time).collect();
                        let pick = |f: fn(&crate::schema::BasinTimeRow) -> Option<f64>| -> Vec<f64> {
                            rows.iter().map(|&r| f(r).unwrap_or(0.0)).collect()
                        };
                        forcings.precipitation = series_or_constant(
                            xs.clone(),
                            pick(|r| r.precipitation),
                            is_cyclic,
                            errors,
                            "basin precipitation",
                        );
                        forcings.potential_evaporation = series_or_constant(
                            xs.clone(),
                            pick(|r| r.potential_evaporation),
                            is_cyclic,
                            errors,
                            "basin potential evaporation",
                        );
                        forcings.drainage =
                            series_or_constant(xs.clone(), pick(|r| r.drainage), is_cyclic, errors, "basin drainage");
                        forcings.infiltration = series_or_constant(
                            xs.clone(),
                            pick(|r| r.infiltration),
                            is_cyclic,
                            errors,
                            "basin infiltration",
                        );
                        forcings.surface_runoff = series_or_constant(
                            xs,
                            pick(|r| r.surface_runoff),
                            is_cyclic,
                            errors,
                            "basin surface runoff",
                        );
                    }
                }

                let initial_level = schema
                    .basin_state
                    .iter()
                    .find(|r| r.node_id == ordinal)
                    .map(|r| r.level)
                    .unwrap_or_else(|| profile.bottom_level());
                let mut basin = Basin::new(*node, profile, forcings, initial_level);
                if let Some(threshold) = settings.low_storage_threshold {
                    basin.low_storage_threshold = threshold;
                }

                let mut subgrid: HashMap<i32, (Vec<f64>, Vec<f64>)> = HashMap::new();
                for row in schema.basin_subgrid.iter().filter(|r| r.node_id == ordinal) {
                    let entry = subgrid.entry(row.subgrid_id).or_default();
                    entry.0.push(row.basin_level);
                    entry.1.push(row.subgrid_level);
                }
                let mut subgrid: Vec<(i32, (Vec<f64>, Vec<f64>))> = subgrid.into_iter().collect();
                subgrid.sort_by_key(|(id, _)| *id);
                for (subgrid_id, (xs, ys)) in subgrid {
                    match Interpolation::new(xs, ys, Extrapolation::Constant, Extrapolation::Constant) {
                        Ok(table) => basin.subgrid.push(SubgridElement { subgrid_id, table }),
                        Err(e) => errors.push(ValidationError::Build {
                            message: format!("basin #{ordinal} subgrid {subgrid_id}: {e}"),
                        }),
                    }
                }
                nodes.basins.push(basin);
            }
            NodeType::LinearResistance => {
                let rows: Vec<_> = schema
                    .linear_resistance_static
                    .iter()
                    .filter(|r| r.node_id == ordinal)
                    .collect();
                let params_of = |r: &crate::schema::LinearResistanceStaticRow| LinearResistanceParams {
                    active: r.active.unwrap_or(true),
                    resistance: r.resistance,
                    max_flow_rate: r.max_flow_rate.unwrap_or(f64::INFINITY),
                };
                let Some(first) = rows.first() else { continue };
                let mut control_states = HashMap::new();
                for row in &rows {
                    if let Some(state) = &row.control_state {
                        control_states.insert(state.clone(), params_of(row));
                    }
                }
                nodes.linear_resistances.push(LinearResistance {
                    node_id: *node,
                    params: params_of(first),
                    control_states,
                });
            }
            NodeType::ManningResistance => {
                let rows: Vec<_> = schema
                    .manning_resistance_static
                    .iter()
                    .filter(|r| r.node_id == ordinal)
                    .collect();
                let params_of = |r: &crate::schema::ManningResistanceStaticRow| ManningResistanceParams {
                    active: r.active.unwrap_or(true),
                    length: r.length,
                    manning_n: r.manning_n,
                    profile_width: r.profile_width,
                    profile_slope: r.profile_slope,
                };
                let Some(first) = rows.first() else { continue };
                let mut control_states = HashMap::new();
                for row in &rows {
                    if let Some(state) = &row.control_state {
                        control_states.insert(state.clone(), params_of(row));
                    }
                }
                // Bed elevations resolved after all basins exist; store a
                // placeholder and fix up below.
                nodes.manning_resistances.push(ManningResistance {
                    node_id: *node,
                    params: params_of(first),
                    bed_up: 0.0,
                    bed_dn: 0.0,
                    control_states,
                });
            }
            NodeType::TabulatedRatingCurve => {
                let static_rows: Vec<_> = schema
                    .tabulated_rating_curve_static
                    .iter()
                    .filter(|r| r.node_id == ordinal)
                    .collect();
                let mut by_state: HashMap<Option<String>, (Vec<f64>, Vec<f64>, bool)> = HashMap::new();
                for row in &static_rows {
                    let entry = by_state.entry(row.control_state.clone()).or_insert((
                        Vec::new(),
                        Vec::new(),
                        row.active.unwrap_or(true),
                    ));
                    entry.0.push(row.level);
                    entry.1.push(row.flow_rate);
                }
                let make_table = |xs: Vec<f64>, ys: Vec<f64>, errors: &mut Vec<ValidationError>| {
                    match Interpolation::new(xs, ys, Extrapolation::Constant, Extrapolation::Linear) {
                        Ok(table) => Some(table),
                        Err(e) => {
                            errors.push(ValidationError::Build {
                                message: format!("rating curve #{ordinal}: {e}"),
                            });
                            None
                        }
                    }
                };
                let mut control_states = HashMap::new();
                let mut current: Option<RatingCurveParams> = None;
                let mut states: Vec<(Option<String>, (Vec<f64>, Vec<f64>, bool))> = by_state.into_iter().collect();
                states.sort_by(|a, b| a.0.cmp(&b.0));
                for (state, (xs, ys, active)) in states {
                    let Some(table) = make_table(xs, ys, errors) else { continue };
                    let params = RatingCurveParams { active, table };
                    match state {
                        Some(state) => {
                            if current.is_none() {
                                current = Some(params.clone());
                            }
                            control_states.insert(state, params);
                        }
                        None => current = Some(params),
                    }
                }
                let Some(params) = current else {
                    errors.push(ValidationError::Build {
                        message: format!("rating curve #{ordinal}: no usable table"),
                    });
                    continue;
                };
                nodes.rating_curves.push(TabulatedRatingCurve {
                    node_id: *node,
                    params,
                    control_states,
                });
            }
            NodeType::Pump | NodeType::Outlet => {
                let pump = build_pump_like(schema, *node, cyclic.contains(&ordinal), errors);
                if let Some(pump) = pump {
                    match node.node_type {
                        NodeType::Pump => nodes.pumps.push(pump),
                        _ => nodes.outlets.push(pump),
                    }
                }
            }
            NodeType::LevelBoundary => {
                let is_cyclic = cyclic.contains(&ordinal);
                let (active, level) =
                    if let Some(row) = schema.level_boundary_static.iter().find(|r| r.node_id == ordinal) {
                        (row.active.unwrap_or(true), Interpolation::constant(row.level))
                    } else {
                        let rows: Vec<_> = schema
                            .level_boundary_time
                            .iter()
                            .filter(|r| r.node_id == ordinal)
                            .collect();
                        let xs = rows.iter().map(|r| r.time).collect();
                        let ys = rows.iter().map(|r| r.level).collect();
                        (true, series_or_constant(xs, ys, is_cyclic, errors, "level boundary"))
                    };
                nodes.level_boundaries.push(LevelBoundary {
                    node_id: *node,
                    active,
                    level,
                });
            }
            NodeType::FlowBoundary => {
                let is_cyclic = cyclic.contains(&ordinal);
                let (active, flow_rate) =
                    if let Some(row) = schema.flow_boundary_static.iter().find(|r| r.node_id == ordinal) {
                        (row.active.unwrap_or(true), Interpolation::constant(row.flow_rate))
                    } else {
                        let rows: Vec<_> = schema
                            .flow_boundary_time
                            .iter()
                            .filter(|r| r.node_id == ordinal)
                            .collect();
                        let xs = rows.iter().map(|r| r.time).collect();
                        let ys = rows.iter().map(|r| r.flow_rate).collect();
                        (true, series_or_constant(xs, ys, is_cyclic, errors, "flow boundary"))
                    };
                nodes
                    .flow_boundaries
                    .push(FlowBoundary::new(*node, active, flow_rate));
            }
            NodeType::UserDemand => {
                let is_cyclic = cyclic.contains(&ordinal);
                let mut demands: Vec<Option<Interpolation>> = vec![None; n_priorities];
                let mut return_factor = Interpolation::constant(0.0);
                let mut min_level = Interpolation::constant(f64::NEG_INFINITY);
                let mut active = true;

                let static_rows: Vec<_> = schema
                    .user_demand_static
                    .iter()
                    .filter(|r| r.node_id == ordinal)
                    .collect();
                if !static_rows.is_empty() {
                    for row in &static_rows {
                        let p = nodes
                            .demand_priorities
                            .binary_search(&row.demand_priority)
                            .expect("collected above");
                        demands[p] = Some(Interpolation::constant(row.demand));
                        return_factor = Interpolation::constant(row.return_factor);
                        min_level = Interpolation::constant(row.min_level);
                        active = row.active.unwrap_or(true);
                    }
                } else {
                    let mut per_priority: HashMap<i32, (Vec<f64>, Vec<f64>)> = HashMap::new();
                    let mut rf_series: (Vec<f64>, Vec<f64>) = (Vec::new(), Vec::new());
                    let mut level_series: (Vec<f64>, Vec<f64>) = (Vec::new(), Vec::new());
                    for row in schema.user_demand_time.iter().filter(|r| r.node_id == ordinal) {
                        let entry = per_priority.entry(row.demand_priority).or_default();
                        entry.0.push(row.time);
                        entry.1.push(row.demand);
                        rf_series.0.push(row.time);
                        rf_series.1.push(row.return_factor);
                        level_series.0.push(row.time);
                        level_series.1.push(row.min_level);
                    }
                    for (priority, (xs, ys)) in per_priority {
                        let p = nodes.demand_priorities.binary_search(&priority).expect("collected above");
                        demands[p] = Some(series_or_constant(xs, ys, is_cyclic, errors, "user demand"));
                    }
                    return_factor =
                        series_or_constant(rf_series.0, rf_series.1, is_cyclic, errors, "user return factor");
                    min_level = series_or_constant(level_series.0, level_series.1, is_cyclic, errors, "user min level");
                }

                nodes.user_demands.push(UserDemand {
                    node_id: *node,
                    active,
                    demands,
                    return_factor,
                    min_level,
                    allocated: vec![f64::INFINITY; n_priorities],
                });
            }
            NodeType::FlowDemand => {
                let target = graph
                    .control_out_links(node)
                    .first()
                    .map(|l| graph.link(*l).to)
                    .unwrap_or(*node);
                let mut demands: Vec<Option<Interpolation>> = vec![None; n_priorities];
                for row in schema.flow_demand_static.iter().filter(|r| r.node_id == ordinal) {
                    let p = nodes
                        .demand_priorities
                        .binary_search(&row.demand_priority)
                        .expect("collected above");
                    demands[p] = Some(Interpolation::constant(row.demand));
                }
                let mut per_priority: HashMap<i32, (Vec<f64>, Vec<f64>)> = HashMap::new();
                for row in schema.flow_demand_time.iter().filter(|r| r.node_id == ordinal) {
                    let entry = per_priority.entry(row.demand_priority).or_default();
                    entry.0.push(row.time);
                    entry.1.push(row.demand);
                }
                for (priority, (xs, ys)) in per_priority {
                    let p = nodes.demand_priorities.binary_search(&priority).expect("collected above");
                    demands[p] = Some(series_or_constant(
                        xs,
                        ys,
                        cyclic.contains(&ordinal),
                        errors,
                        "flow demand",
                    ));
                }
                nodes.flow_demands.push(FlowDemand {
                    node_id: *node,
                    target,
                    demands,
                });
            }
            NodeType::LevelDemand => {
                let target = graph
                    .control_out_links(node)
                    .first()
                    .map(|l| graph.link(*l).to)
                    .unwrap_or(*node);
                let mut demands: Vec<Option<LevelDemandSeries>> = vec![None; n_priorities];
                for row in schema.level_demand_static.iter().filter(|r| r.node_id == ordinal) {
                    let p = nodes
                        .demand_priorities
                        .binary_search(&row.demand_priority)
                        .expect("collected above");
                    demands[p] = Some(LevelDemandSeries {
                        min_level: row.min_level.map(Interpolation::constant),
                        max_level: row.max_level.map(Interpolation::constant),
                    });
                }
                nodes.level_demands.push(LevelDemand {
                    node_id: *node,
                    target,
                    demands,
                });
            }
            _ => {}
        }
    }

    // Manning bed elevations from the neighbouring basin bottoms.
    if let Ok(connectivity) = crate::state::Connectivity::new(graph) {
        for (i, ends) in connectivity.manning_resistances.iter().enumerate() {
            let bed = |source: WaterSource, nodes: &Nodes| match source {
                WaterSource::Basin(b) => nodes.basins.get(b).map(|basin| basin.profile.bottom_level()),
                _ => None,
            };
            let bed_up = bed(ends.up, &nodes).unwrap_or(0.0);
            let bed_dn = bed(ends.dn, &nodes).unwrap_or(bed_up);
            if let Some(manning) = nodes.manning_resistances.get_mut(i) {
                manning.bed_up = bed_up;
                manning.bed_dn = bed_dn;
            }
        }
    }

    // Flow boundaries discharging into basins, for the exact integrals.
    nodes.basin_boundary_inflows = vec![Vec::new(); nodes.basins.len()];
    for (i, boundary) in nodes.flow_boundaries.iter().enumerate() {
        for target in graph.outflow_ids(&boundary.node_id) {
            if target.node_type == NodeType::Basin {
                nodes.basin_boundary_inflows[target.index].push(i);
            }
        }
    }

    nodes
}

fn build_pump_like(
    schema: &Schema,
    node: NodeId,
    is_cyclic: bool,
    errors: &mut Vec<ValidationError>,
) -> Option<Pump> {
    let ordinal = node.ordinal;
    let (static_rows, time_rows): (Vec<PumpParamsRow>, Vec<(f64, f64)>) = match node.node_type {
        NodeType::Pump => (
            schema
                .pump_static
                .iter()
                .filter(|r| r.node_id == ordinal)
                .map(|r| PumpParamsRow {
                    control_state: r.control_state.clone(),
                    active: r.active,
                    flow_rate: r.flow_rate,
                    min_flow_rate: r.min_flow_rate,
                    max_flow_rate: r.max_flow_rate,
                    min_upstream_level: None,
                })
                .collect(),
            schema
                .pump_time
                .iter()
                .filter(|r| r.node_id == ordinal)
                .map(|r| (r.time, r.flow_rate))
                .collect(),
        ),
        _ => (
            schema
                .outlet_static
                .iter()
                .filter(|r| r.node_id == ordinal)
                .map(|r| PumpParamsRow {
                    control_state: r.control_state.clone(),
                    active: r.active,
                    flow_rate: r.flow_rate,
                    min_flow_rate: r.min_flow_rate,
                    max_flow_rate: r.max_flow_rate,
                    min_upstream_level: r.min_upstream_level,
                })
                .collect(),
            schema
                .outlet_time
                .iter()
                .filter(|r| r.node_id == ordinal)
                .map(|r| (r.time, r.flow_rate))
                .collect(),
        ),
    };

    let params_of = |row: &PumpParamsRow, flow_rate: Interpolation| PumpParams {
        active: row.active.unwrap_or(true),
        flow_rate,
        min_flow_rate: row.min_flow_rate.unwrap_or(0.0),
        max_flow_rate: row.max_flow_rate.unwrap_or(f64::INFINITY),
        min_upstream_level: row.min_upstream_level,
    };

    let (params, control_states) = if !time_rows.is_empty() {
        let xs = time_rows.iter().map(|r| r.0).collect();
        let ys = time_rows.iter().map(|r| r.1).collect();
        let series = series_or_constant(xs, ys, is_cyclic, errors, "pump flow rate");
        (
            PumpParams {
                active: true,
                flow_rate: series,
                min_flow_rate: 0.0,
                max_flow_rate: f64::INFINITY,
                min_upstream_level: None,
            },
            HashMap::new(),
        )
    } else {
        let first = static_rows.first()?;
        let mut control_states = HashMap::new();
        for row in &static_rows {
            if let Some(state) = &row.control_state {
                control_states.insert(state.clone(), params_of(row, Interpolation::constant(row.flow_rate)));
            }
        }
        (params_of(first, Interpolation::constant(first.flow_rate)), control_states)
    };

    Some(Pump {
        node_id: node,
        params,
        control_states,
        allocation_controlled: false,
        pid_controlled: false,
        commanded_flow_rate: None,
    })
}

struct PumpParamsRow {
    control_state: Option<String>,
    active: Option<bool>,
    flow_rate: f64,
    min_flow_rate: Option<f64>,
    max_flow_rate: Option<f64>,
    min_upstream_level: Option<f64>,
}

fn resolve_listen(
    graph: &Graph,
    node_type: &str,
    node_id: i32,
    variable: &str,
) -> Result<ObservedVariable, String> {
    let node_type = NodeType::from_str(node_type).map_err(|e| e.to_string())?;
    let node = graph
        .node(node_type, node_id)
        .map_err(|e| e.to_string())?;
    match (node_type, variable) {
        (NodeType::Basin, "level") => Ok(ObservedVariable::BasinLevel(node.index)),
        (NodeType::Basin, "storage") => Ok(ObservedVariable::BasinStorage(node.index)),
        (NodeType::LevelBoundary, "level") => Ok(ObservedVariable::LevelBoundaryLevel(node.index)),
        (NodeType::FlowBoundary, "flow_rate") => Ok(ObservedVariable::FlowBoundaryRate(node.index)),
        (node_type, "flow_rate") => {
            let class = match node_type {
                NodeType::LinearResistance => ComponentClass::LinearResistance,
                NodeType::ManningResistance => ComponentClass::ManningResistance,
                NodeType::TabulatedRatingCurve => ComponentClass::RatingCurve,
                NodeType::Pump => ComponentClass::Pump,
                NodeType::Outlet => ComponentClass::Outlet,
                NodeType::UserDemand => ComponentClass::UserDemandInflow,
                _ => return Err(format!("{node_type} #{node_id} has no flow_rate to listen to")),
            };
            Ok(ObservedVariable::Flow {
                class,
                index: node.index,
            })
        }
        _ => Err(format!("{node_type} #{node_id} has no listenable variable `{variable}`")),
    }
}

fn build_compound_variables(
    rows: &[crate::schema::CompoundVariableRow],
    ordinal: i32,
    graph: &Graph,
    errors: &mut Vec<ValidationError>,
) -> Vec<(i32, CompoundVariable)> {
    let mut by_id: HashMap<i32, CompoundVariable> = HashMap::new();
    for row in rows.iter().filter(|r| r.node_id == ordinal) {
        match resolve_listen(graph, &row.listen_node_type, row.listen_node_id, &row.variable) {
            Ok(listen) => {
                let look_ahead = row.look_ahead.unwrap_or(0.0);
                let time_interpolated = matches!(
                    listen,
                    ObservedVariable::LevelBoundaryLevel(_) | ObservedVariable::FlowBoundaryRate(_)
                );
                if look_ahead != 0.0 && !time_interpolated {
                    errors.push(ValidationError::Build {
                        message: format!(
                            "control #{ordinal}: look_ahead is only valid on level or flow boundaries"
                        ),
                    });
                    continue;
                }
                by_id
                    .entry(row.compound_variable_id)
                    .or_default()
                    .subvariables
                    .push(Subvariable {
                        listen,
                        weight: row.weight.unwrap_or(1.0),
                        look_ahead,
                    });
            }
            Err(message) => errors.push(ValidationError::Build {
                message: format!("control #{ordinal}: {message}"),
            }),
        }
    }
    let mut result: Vec<(i32, CompoundVariable)> = by_id.into_iter().collect();
    result.sort_by_key(|(id, _)| *id);
    result
}

fn build_controls(
    schema: &Schema,
    graph: &Graph,
    physics: &Physics,
    cyclic: &HashSet<i32>,
    errors: &mut Vec<ValidationError>,
) -> ControlSet {
    let mut controls = ControlSet::default();

    for node in graph.nodes() {
        let ordinal = node.ordinal;
        match node.node_type {
            NodeType::DiscreteControl => {
                let variables =
                    build_compound_variables(&schema.discrete_control_variable, ordinal, graph, errors);
                let variable_position: HashMap<i32, usize> =
                    variables.iter().enumerate().map(|(i, (id, _))| (*id, i)).collect();

                // Conditions in (variable, condition) order; time rows of the
                // same condition id form a threshold series.
                let mut grouped: HashMap<(i32, i32), (Vec<f64>, Vec<f64>, Vec<f64>)> = HashMap::new();
                for row in schema
                    .discrete_control_condition
                    .iter()
                    .filter(|r| r.node_id == ordinal)
                {
                    let entry = grouped.entry((row.compound_variable_id, row.condition_id)).or_default();
                    entry.0.push(row.time.unwrap_or(0.0));
                    entry.1.push(row.threshold_low);
                    entry.2.push(row.threshold_high);
                }
                let mut keys: Vec<(i32, i32)> = grouped.keys().copied().collect();
                keys.sort();
                let mut conditions = Vec::new();
                for key in keys {
                    let (xs, lows, highs) = grouped.remove(&key).expect("key from map");
                    let Some(&variable) = variable_position.get(&key.0) else {
                        errors.push(ValidationError::Build {
                            message: format!(
                                "DiscreteControl #{ordinal}: condition references unknown compound variable {}",
                                key.0
                            ),
                        });
                        continue;
                    };
                    let is_cyclic = cyclic.contains(&ordinal);
                    conditions.push(Condition {
                        variable,
                        threshold_low: series_or_constant(xs.clone(), lows, is_cyclic, errors, "threshold_low"),
                        threshold_high: series_or_constant(xs, highs, is_cyclic, errors, "threshold_high"),
                    });
                }

                let logic: HashMap<String, String> = schema
                    .discrete_control_logic
                    .iter()
                    .filter(|r| r.node_id == ordinal)
                    .map(|r| (r.truth_state.clone(), r.control_state.clone()))
                    .collect();
                let controlled_nodes: Vec<NodeId> = graph
                    .control_out_links(node)
                    .iter()
                    .map(|l| graph.link(*l).to)
                    .collect();

                controls.discrete.push(DiscreteControl {
                    node_id: *node,
                    variables: variables.into_iter().map(|(_, v)| v).collect(),
                    conditions,
                    logic,
                    controlled_nodes,
                    truth_state: Vec::new(),
                    control_state: None,
                });
            }
            NodeType::ContinuousControl => {
                let variables =
                    build_compound_variables(&schema.continuous_control_variable, ordinal, graph, errors);
                let Some((_, variable)) = variables.into_iter().next() else {
                    errors.push(ValidationError::Build {
                        message: format!("ContinuousControl #{ordinal}: no compound variable"),
                    });
                    continue;
                };
                let rows: Vec<_> = schema
                    .continuous_control_function
                    .iter()
                    .filter(|r| r.node_id == ordinal)
                    .collect();
                let Some(first) = rows.first() else {
                    errors.push(ValidationError::Build {
                        message: format!("ContinuousControl #{ordinal}: no function rows"),
                    });
                    continue;
                };
                let xs: Vec<f64> = rows.iter().map(|r| r.input).collect();
                let ys: Vec<f64> = rows.iter().map(|r| r.output).collect();
                let function = match PchipInterpolation::new(xs, ys) {
                    Ok(function) => function,
                    Err(e) => {
                        errors.push(ValidationError::Build {
                            message: format!("ContinuousControl #{ordinal}: {e}"),
                        });
                        continue;
                    }
                };
                let Some(target) = graph.control_out_links(node).first().map(|l| graph.link(*l).to) else {
                    errors.push(ValidationError::Build {
                        message: format!("ContinuousControl #{ordinal}: no controlled node"),
                    });
                    continue;
                };
                controls.continuous.push(ContinuousControl {
                    node_id: *node,
                    variable,
                    function,
                    target,
                    parameter: first.controlled_variable.clone(),
                });
            }
            NodeType::PidControl => {
                let Some(static_row) = schema.pid_control_static.iter().find(|r| r.node_id == ordinal) else {
                    continue;
                };
                let listen = match graph.node(
                    NodeType::from_str(&static_row.listen_node_type).unwrap_or(NodeType::Basin),
                    static_row.listen_node_id,
                ) {
                    Ok(node) if node.node_type == NodeType::Basin => node,
                    _ => {
                        errors.push(ValidationError::Build {
                            message: format!("PidControl #{ordinal}: listen node must be a basin"),
                        });
                        continue;
                    }
                };
                let Some(target) = graph.control_out_links(node).first().map(|l| graph.link(*l).to) else {
                    errors.push(ValidationError::Build {
                        message: format!("PidControl #{ordinal}: no controlled pump or outlet"),
                    });
                    continue;
                };

                // Sign: +1 when the target discharges into the listened
                // basin, −1 when it drains it.
                let ends = match target.node_type {
                    NodeType::Pump => physics.connectivity.pumps.get(target.index),
                    NodeType::Outlet => physics.connectivity.outlets.get(target.index),
                    _ => None,
                };
                let sign = match ends {
                    Some(ends) if ends.dn == WaterSource::Basin(listen.index) => 1.0,
                    Some(ends) if ends.up == WaterSource::Basin(listen.index) => -1.0,
                    _ => {
                        errors.push(ValidationError::Build {
                            message: format!(
                                "PidControl #{ordinal}: controlled node is not adjacent to the listened basin"
                            ),
                        });
                        continue;
                    }
                };

                let time_rows: Vec<_> = schema.pid_control_time.iter().filter(|r| r.node_id == ordinal).collect();
                let is_cyclic = cyclic.contains(&ordinal);
                let series = |f: fn(&crate::schema::PidControlTimeRow) -> f64,
                              fallback: f64,
                              errors: &mut Vec<ValidationError>| {
                    if time_rows.is_empty() {
                        Interpolation::constant(fallback)
                    } else {
                        let xs = time_rows.iter().map(|r| r.time).collect();
                        let ys = time_rows.iter().map(|&r| f(r)).collect();
                        series_or_constant(xs, ys, is_cyclic, errors, "pid control")
                    }
                };
                controls.pids.push(PidControl {
                    node_id: *node,
                    active: static_row.active.unwrap_or(true),
                    listen_basin: listen.index,
                    target,
                    sign,
                    setpoint: series(|r| r.target, static_row.target, errors),
                    proportional: series(|r| r.proportional, static_row.proportional, errors),
                    integral: series(|r| r.integral, static_row.integral, errors),
                    derivative: series(|r| r.derivative, static_row.derivative, errors),
                });
            }
            _ => {}
        }
    }

    controls
}

/// Map every flow link to the state information its flow derives from.
fn resolve_link_flow_sources(graph: &Graph, physics: &Physics) -> Vec<LinkFlowSource> {
    let layout = &physics.layout;

    // Direct connector components per link.
    let mut direct: HashMap<LinkId, (usize, f64)> = HashMap::new();
    let connector_classes = [
        (ComponentClass::RatingCurve, &physics.connectivity.rating_curves),
        (ComponentClass::Pump, &physics.connectivity.pumps),
        (ComponentClass::Outlet, &physics.connectivity.outlets),
        (ComponentClass::LinearResistance, &physics.connectivity.linear_resistances),
        (ComponentClass::ManningResistance, &physics.connectivity.manning_resistances),
    ];
    for (class, ends_list) in connector_classes {
        for (i, ends) in ends_list.iter().enumerate() {
            let comp = layout.index(class, i);
            direct.entry(ends.inflow_link).or_insert((comp, 1.0));
            direct.entry(ends.outflow_link).or_insert((comp, 1.0));
        }
    }
    for (i, ends) in physics.connectivity.user_demands.iter().enumerate() {
        direct
            .entry(ends.inflow_link)
            .or_insert((layout.index(ComponentClass::UserDemandInflow, i), 1.0));
        direct.insert(ends.outflow_link, (layout.index(ComponentClass::UserDemandOutflow, i), 1.0));
    }

    graph
        .links()
        .iter()
        .map(|link| {
            if link.link_type != LinkType::Flow {
                return LinkFlowSource::None;
            }
            if let Some((comp, _)) = direct.get(&link.id) {
                return LinkFlowSource::Component(*comp);
            }
            if link.from.node_type == NodeType::FlowBoundary {
                return LinkFlowSource::Boundary(link.from.index);
            }
            // Junction-adjacent link: walk through junctions away from the
            // non-junction end, summing the components found there.
            let (junction, outward) = if link.to.node_type == NodeType::Junction {
                (link.to, true)
            } else if link.from.node_type == NodeType::Junction {
                (link.from, false)
            } else {
                return LinkFlowSource::None;
            };
            let mut parts: Vec<(usize, f64)> = Vec::new();
            let mut visited: HashSet<LinkId> = HashSet::from([link.id]);
            collect_junction_flows(graph, &direct, junction, outward, &mut visited, &mut parts);
            if parts.is_empty() {
                LinkFlowSource::None
            } else {
                LinkFlowSource::Aggregate(parts)
            }
        })
        .collect()
}

/// Sum the component flows on the far side of a junction. `outward` is true
/// when water flows from the link into the junction.
fn collect_junction_flows(
    graph: &Graph,
    direct: &HashMap<LinkId, (usize, f64)>,
    junction: NodeId,
    outward: bool,
    visited: &mut HashSet<LinkId>,
    parts: &mut Vec<(usize, f64)>,
) {
    let links = if outward {
        graph.outflow_links(&junction)
    } else {
        graph.inflow_links(&junction)
    };
    for &next in links {
        if !visited.insert(next) {
            continue;
        }
        if let Some((comp, sign)) = direct.get(&next) {
            parts.push((*comp, *sign));
            continue;
        }
        let far = if outward {
            graph.link(next).to
        } else {
            graph.link(next).from
        };
        if far.node_type == NodeType::Junction {
            collect_junction_flows(graph, direct, far, outward, visited, parts);
        }
    }
}
