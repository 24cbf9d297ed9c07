//! The right-hand side of the cumulative-flow ODE.
//!
//! A pure function of `(u, t)` over the parameter store: connector flows from
//! upstream/downstream levels, basin vertical fluxes, PID integral dynamics.
//! Everything is written against [`Scalar`] so the Jacobian assembly reuses
//! the same laws with dual numbers.

use crate::control::PidControl;
use crate::graph::Graph;
use crate::math::Scalar;
use crate::nodes::Nodes;
use crate::state::{
    ComponentClass, Connectivity, StateError, StateLayout, WaterSource, aggregation_operator, apply_operator,
};
use sprs::CsMat;

/// Derived basin quantities at one `(t, u)` evaluation point.
///
/// Acts as the time-dependent cache of spec §4.7: `update` recomputes only
/// when either `t` or the reduced state changed since the previous call.
#[derive(Debug, Clone, Default)]
pub struct BasinState {
    pub u_red: Vec<f64>,
    pub storage: Vec<f64>,
    pub level: Vec<f64>,
    pub area: Vec<f64>,
    u_red_next: Vec<f64>,
    t_prev: f64,
    valid: bool,
}

impl BasinState {
    pub fn new(layout: &StateLayout) -> Self {
        Self {
            u_red: vec![0.0; layout.reduced_len()],
            storage: vec![0.0; layout.n_basins()],
            level: vec![0.0; layout.n_basins()],
            area: vec![0.0; layout.n_basins()],
            u_red_next: vec![0.0; layout.reduced_len()],
            t_prev: f64::NAN,
            valid: false,
        }
    }

    /// Force recomputation on the next update, e.g. after a forcing step
    /// change invalidated the exact integrals.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// PID integral value from the cached reduced state.
    pub fn pid_integral(&self, layout: &StateLayout, pid_index: usize) -> f64 {
        self.u_red[layout.reduced_pid(pid_index)]
    }
}

pub struct Physics {
    pub layout: StateLayout,
    pub connectivity: Connectivity,
    pub aggregation: CsMat<f64>,
}

impl Physics {
    pub fn new(graph: &Graph) -> Result<Self, StateError> {
        let layout = StateLayout::new(graph);
        let connectivity = Connectivity::new(graph)?;
        let aggregation = aggregation_operator(&layout, &connectivity);
        Ok(Self {
            layout,
            connectivity,
            aggregation,
        })
    }

    /// Refresh the derived basin caches for `(t, u)`.
    pub fn update_basins(&self, t: f64, u: &[f64], nodes: &Nodes, basins: &mut BasinState) {
        apply_operator(&self.aggregation, u, &mut basins.u_red_next);
        if basins.valid && basins.t_prev == t && basins.u_red_next == basins.u_red {
            return;
        }
        std::mem::swap(&mut basins.u_red, &mut basins.u_red_next);

        for (b, basin) in nodes.basins.iter().enumerate() {
            let storage = basin.storage(basins.u_red[self.layout.reduced_basin(b)], t);
            let level = basin.profile.level(storage);
            basins.storage[b] = storage;
            basins.level[b] = level;
            basins.area[b] = basin.profile.area(level);
        }
        basins.t_prev = t;
        basins.valid = true;
    }

    /// Level at a connector end, chained through the basin profile so
    /// derivative seeds propagate.
    fn level_at<S, F>(&self, source: WaterSource, t: f64, nodes: &Nodes, basins: &BasinState, basin_value: &F) -> S
    where
        S: Scalar,
        F: Fn(usize) -> S,
    {
        match source {
            WaterSource::Basin(b) => {
                let storage = basin_value(b);
                let level = nodes.basins[b].profile.level(basins.storage[b]);
                let slope = nodes.basins[b].profile.level_derivative(basins.storage[b]);
                storage.chain(level, slope)
            }
            WaterSource::LevelBoundary(i) => S::constant(nodes.level_boundaries[i].level(t)),
            WaterSource::External => S::constant(0.0),
        }
    }

    fn storage_at<S, F>(&self, source: WaterSource, basin_value: &F) -> Option<S>
    where
        S: Scalar,
        F: Fn(usize) -> S,
    {
        match source {
            WaterSource::Basin(b) => Some(basin_value(b)),
            _ => None,
        }
    }

    /// Low-storage threshold of the basin behind a source, if any.
    fn threshold_of(&self, source: WaterSource, nodes: &Nodes) -> f64 {
        match source {
            WaterSource::Basin(b) => nodes.basins[b].low_storage_threshold,
            _ => 1.0,
        }
    }

    /// Evaluate the flow (or vertical flux, or integral rate) of one state
    /// component. `basin_value(b)` supplies the storage of basin `b`, either
    /// plain or seeded with a derivative.
    ///
    /// PID-driven pumps and outlets must be evaluated through
    /// [`Physics::pid_flow`] instead; here they report zero so the main loop
    /// can fill them in after the residual flux is known.
    pub fn component_value<S, F>(
        &self,
        class: ComponentClass,
        i: usize,
        t: f64,
        nodes: &Nodes,
        basins: &BasinState,
        basin_value: &F,
    ) -> S
    where
        S: Scalar,
        F: Fn(usize) -> S,
    {
        match class {
            ComponentClass::RatingCurve => {
                let ends = &self.connectivity.rating_curves[i];
                let h_up = self.level_at(ends.up, t, nodes, basins, basin_value);
                nodes.rating_curves[i].flow(h_up)
            }
            ComponentClass::LinearResistance => {
                let ends = &self.connectivity.linear_resistances[i];
                let h_up = self.level_at(ends.up, t, nodes, basins, basin_value);
                let h_dn = self.level_at(ends.dn, t, nodes, basins, basin_value);
                nodes.linear_resistances[i].flow(h_up, h_dn)
            }
            ComponentClass::ManningResistance => {
                let ends = &self.connectivity.manning_resistances[i];
                let h_up = self.level_at(ends.up, t, nodes, basins, basin_value);
                let h_dn = self.level_at(ends.dn, t, nodes, basins, basin_value);
                nodes.manning_resistances[i].flow(h_up, h_dn)
            }
            ComponentClass::Pump => {
                let pump = &nodes.pumps[i];
                if pump.pid_controlled {
                    return S::constant(0.0);
                }
                let ends = &self.connectivity.pumps[i];
                let storage_up = self.storage_at(ends.up, basin_value);
                pump.flow(t, storage_up, None, self.threshold_of(ends.up, nodes))
            }
            ComponentClass::Outlet => {
                let outlet = &nodes.outlets[i];
                if outlet.pid_controlled {
                    return S::constant(0.0);
                }
                let ends = &self.connectivity.outlets[i];
                let storage_up = self.storage_at(ends.up, basin_value);
                let level_up = Some(self.level_at(ends.up, t, nodes, basins, basin_value));
                outlet.flow(t, storage_up, level_up, self.threshold_of(ends.up, nodes))
            }
            ComponentClass::UserDemandInflow => {
                let ends = &self.connectivity.user_demands[i];
                let storage_up = self.storage_at(ends.up, basin_value);
                let level_up = Some(self.level_at(ends.up, t, nodes, basins, basin_value));
                nodes.user_demands[i].inflow(t, storage_up, level_up, self.threshold_of(ends.up, nodes))
            }
            ComponentClass::UserDemandOutflow => {
                let inflow: S = self.component_value(ComponentClass::UserDemandInflow, i, t, nodes, basins, basin_value);
                inflow * nodes.user_demands[i].return_factor(t)
            }
            ComponentClass::BasinEvaporation => {
                let basin = &nodes.basins[i];
                let storage = basin_value(i);
                let level = storage.chain(basins.level[i], basin.profile.level_derivative(basins.storage[i]));
                let area = level.chain(basins.area[i], basin.profile.area_derivative(basins.level[i]));
                let factor = crate::math::reduction_factor(storage, basin.low_storage_threshold);
                area * factor * basin.current_rates[1]
            }
            ComponentClass::BasinInfiltration => {
                let basin = &nodes.basins[i];
                let storage = basin_value(i);
                let factor = crate::math::reduction_factor(storage, basin.low_storage_threshold);
                factor * basin.infiltration_rate()
            }
            ComponentClass::PidIntegral => S::constant(0.0),
        }
    }

    /// PID error `setpoint − listened level` for integral dynamics.
    pub fn pid_error<S, F>(&self, pid: &PidControl, t: f64, nodes: &Nodes, basins: &BasinState, basin_value: &F) -> S
    where
        S: Scalar,
        F: Fn(usize) -> S,
    {
        let level = self.level_at(WaterSource::Basin(pid.listen_basin), t, nodes, basins, basin_value);
        -level + pid.setpoint.value(t)
    }

    /// Flow of a PID-driven pump or outlet.
    ///
    /// The pump's own effect on the listened level derivative is eliminated
    /// analytically: with `σ = +1` when the target discharges into the
    /// listened basin, the control output solves
    /// `u·(1 + K_d·h′) = K_p·e + K_i·I + K_d·(ṡp − h′·F_other)`.
    /// `f_other` is the net residual flux into the listened basin from every
    /// other component, held frozen during derivative seeding.
    #[allow(clippy::too_many_arguments)]
    pub fn pid_flow<S, F>(
        &self,
        pid: &PidControl,
        t: f64,
        nodes: &Nodes,
        basins: &BasinState,
        f_other: f64,
        integral: S,
        basin_value: &F,
    ) -> S
    where
        S: Scalar,
        F: Fn(usize) -> S,
    {
        if !pid.active {
            return S::constant(0.0);
        }
        let pump = nodes.pump_like(&pid.target).expect("validated PID target");

        let error: S = self.pid_error(pid, t, nodes, basins, basin_value);
        let listen = pid.listen_basin;
        let level_slope = nodes.basins[listen].profile.level_derivative(basins.storage[listen]);
        let kp = pid.proportional.value(t);
        let ki = pid.integral.value(t);
        let kd = pid.derivative.value(t);
        let setpoint_rate = pid.setpoint.derivative(t);

        let numerator = error * kp + integral * ki + S::constant(kd * (setpoint_rate - level_slope * f_other));
        let control = numerator / (1.0 + kd * level_slope);
        let flow = (control * pid.sign).clamp(pump.params.min_flow_rate.max(0.0), pump.params.max_flow_rate);

        let ends = match pid.target.node_type {
            crate::graph::NodeType::Pump => &self.connectivity.pumps[pid.target.index],
            _ => &self.connectivity.outlets[pid.target.index],
        };
        let availability = pump.availability(
            self.storage_at(ends.up, basin_value),
            Some(self.level_at(ends.up, t, nodes, basins, basin_value)),
            self.threshold_of(ends.up, nodes),
        );
        flow * availability
    }

    /// Net residual flux into the listened basin of `pid`: the aggregation
    /// row applied to the current derivative vector (the PID target's own
    /// column still zero) plus the exactly-integrated forcing rate.
    pub fn residual_flux(&self, pid: &PidControl, nodes: &Nodes, du: &[f64]) -> f64 {
        let row = self.layout.reduced_basin(pid.listen_basin);
        let mut flux = nodes.basins[pid.listen_basin].exact_inflow.rate;
        if let Some(vec) = self.aggregation.outer_view(row) {
            for (col, &value) in vec.iter() {
                flux += value * du[col];
            }
        }
        flux
    }

    /// Evaluate the full derivative vector at `(t, u)`.
    ///
    /// Mutates only the scratch caches and `du`; the parameter store is read
    /// exclusively, per the callback-safe resource discipline.
    pub fn rhs(
        &self,
        t: f64,
        u: &[f64],
        nodes: &Nodes,
        pids: &[PidControl],
        basins: &mut BasinState,
        du: &mut [f64],
    ) {
        self.update_basins(t, u, nodes, basins);
        du.fill(0.0);

        let identity = |b: usize| basins.storage[b];

        for class in ComponentClass::ALL {
            if class == ComponentClass::PidIntegral {
                continue;
            }
            for offset in 0..self.layout.range(class).len() {
                let value: f64 = self.component_value(class, offset, t, nodes, basins, &identity);
                du[self.layout.index(class, offset)] = value;
            }
        }

        // Integral dynamics, then the PID-driven flows that need the
        // residual flux of every other component.
        for (k, pid) in pids.iter().enumerate() {
            let error: f64 = self.pid_error(pid, t, nodes, basins, &identity);
            du[self.layout.index(ComponentClass::PidIntegral, k)] = if pid.active { error } else { 0.0 };
        }
        for (k, pid) in pids.iter().enumerate() {
            if !pid.active {
                continue;
            }
            let f_other = self.residual_flux(pid, nodes, du);
            let integral = basins.u_red[self.layout.reduced_pid(k)];
            let flow: f64 = self.pid_flow(pid, t, nodes, basins, f_other, integral, &identity);
            let class = match pid.target.node_type {
                crate::graph::NodeType::Pump => ComponentClass::Pump,
                _ => ComponentClass::Outlet,
            };
            du[self.layout.index(class, pid.target.index)] = flow;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{LinkType, NodeId, NodeType};
    use crate::nodes::{Basin, BasinProfile, Forcings, LinearResistance, LinearResistanceParams};
    use float_cmp::assert_approx_eq;
    use std::collections::HashMap;

    /// Two identical basins joined by a linear resistance, R = 1.
    fn two_basin_model() -> (Graph, Nodes, Physics) {
        let mut graph = Graph::default();
        let b1 = graph.add_node(NodeType::Basin, 1, None, None).unwrap();
        let r = graph.add_node(NodeType::LinearResistance, 2, None, None).unwrap();
        let b2 = graph.add_node(NodeType::Basin, 3, None, None).unwrap();
        graph.add_link(1, b1, r, LinkType::Flow).unwrap();
        graph.add_link(2, r, b2, LinkType::Flow).unwrap();

        let profile = |ordinal, index| {
            BasinProfile::new(
                NodeId::new(NodeType::Basin, ordinal, index),
                vec![0.0, 10.0],
                vec![100.0, 100.0],
            )
            .unwrap()
        };
        let mut nodes = Nodes::default();
        nodes.basins.push(Basin::new(
            NodeId::new(NodeType::Basin, 1, 0),
            profile(1, 0),
            Forcings::default(),
            2.0,
        ));
        nodes.basins.push(Basin::new(
            NodeId::new(NodeType::Basin, 3, 1),
            profile(3, 1),
            Forcings::default(),
            0.0,
        ));
        nodes.linear_resistances.push(LinearResistance {
            node_id: NodeId::new(NodeType::LinearResistance, 2, 0),
            params: LinearResistanceParams {
                active: true,
                resistance: 1.0,
                max_flow_rate: f64::INFINITY,
            },
            control_states: HashMap::new(),
        });
        nodes.basin_boundary_inflows = vec![Vec::new(), Vec::new()];

        let physics = Physics::new(&graph).unwrap();
        (graph, nodes, physics)
    }

    #[test]
    fn resistance_flow_from_level_difference() {
        let (_, nodes, physics) = two_basin_model();
        let mut basins = BasinState::new(&physics.layout);
        let u = vec![0.0; physics.layout.len()];
        let mut du = vec![0.0; physics.layout.len()];

        physics.rhs(0.0, &u, &nodes, &[], &mut basins, &mut du);

        // storages 200 / 0 → levels 2 / 0 → q = 2
        assert_approx_eq!(f64, basins.storage[0], 200.0);
        assert_approx_eq!(f64, basins.level[0], 2.0);
        let comp = physics.layout.index(ComponentClass::LinearResistance, 0);
        assert_approx_eq!(f64, du[comp], 2.0);
    }

    #[test]
    fn cumulative_flow_shifts_storage() {
        let (_, nodes, physics) = two_basin_model();
        let mut basins = BasinState::new(&physics.layout);
        let comp = physics.layout.index(ComponentClass::LinearResistance, 0);
        let mut u = vec![0.0; physics.layout.len()];
        u[comp] = 50.0; // 50 m³ have moved left → right
        let mut du = vec![0.0; physics.layout.len()];

        physics.rhs(0.0, &u, &nodes, &[], &mut basins, &mut du);

        assert_approx_eq!(f64, basins.storage[0], 150.0);
        assert_approx_eq!(f64, basins.storage[1], 50.0);
        assert_approx_eq!(f64, du[comp], 1.0);
    }

    #[test]
    fn scratch_cache_skips_unchanged_evaluations() {
        let (_, nodes, physics) = two_basin_model();
        let mut basins = BasinState::new(&physics.layout);
        let u = vec![0.0; physics.layout.len()];
        physics.update_basins(0.0, &u, &nodes, &mut basins);
        let storage_before = basins.storage.clone();
        // Same (t, u): no recomputation requirement, same result.
        physics.update_basins(0.0, &u, &nodes, &mut basins);
        assert_eq!(storage_before, basins.storage);
    }
}
