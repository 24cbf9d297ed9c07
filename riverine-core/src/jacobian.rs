//! Reduced-space Jacobian and the two-step linear solve.
//!
//! All physics depend on `u` only through `u_red = A·u`, so the full Jacobian
//! factors as `J = J_int·A` with `J_int = ∂g/∂u_red` of size |u| × |u_red|.
//! The Newton matrix `W = γ⁻¹·I − J_int·A` is never materialized: solving
//! `W·a = b` reduces to `(γ⁻¹·I − A·J_int)·c = A·b` in storage space
//! followed by the recovery `a = γ·(b + J_int·c)`, as substituting
//! `c = A·a` into `γ⁻¹·a − J_int·c = b` shows.
//!
//! The sparsity of `J_int` comes from graph adjacency once; numerical updates
//! seed dual numbers per reduced coordinate, optionally in parallel.

use crate::control::PidControl;
use crate::graph::NodeType;
use crate::math::{Dual, Scalar};
use crate::nodes::Nodes;
use crate::physics::{BasinState, Physics};
use crate::state::{ComponentClass, ConnectorEnds, WaterSource};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JacobianError {
    #[error("linear solve failed: Newton matrix is singular in both reduced and full space")]
    Singular,
}

/// How one `J_int` entry is evaluated.
#[derive(Debug, Copy, Clone)]
enum EntryEval {
    /// An ordinary component via its flow law.
    Flow { class: ComponentClass, index: usize },
    /// A PID-driven pump/outlet column.
    PidTarget { pid: usize },
    /// A PID integral error row.
    PidError { pid: usize },
}

/// Entries of one reduced coordinate's column, contiguous in `values`.
#[derive(Debug, Clone)]
struct ColumnPlan {
    reduced: usize,
    /// `(state component, evaluation)` pairs.
    entries: Vec<(usize, EntryEval)>,
}

pub struct ReducedJacobian {
    n_state: usize,
    n_reduced: usize,
    columns: Vec<ColumnPlan>,
    /// Entry values grouped per column, same order as `columns`.
    values: Vec<f64>,
    /// Per state component, the `(reduced row, coefficient)` entries of the
    /// aggregation operator's column, for forming `A·J_int` without sprs
    /// transposition.
    a_by_component: Vec<Vec<(usize, f64)>>,
    /// Residual flux per PID controller, frozen at the evaluation point.
    pid_fluxes: Vec<f64>,
    parallel: bool,
}

impl ReducedJacobian {
    /// Symbolic pass: derive the sparsity pattern of `J_int` from connector
    /// adjacency. Errors in flow laws surface here as missing patterns, not
    /// at solve time.
    pub fn new(physics: &Physics, pids: &[PidControl], parallel: bool) -> Self {
        let layout = &physics.layout;
        let n_state = layout.len();
        let n_reduced = layout.reduced_len();

        // deps[comp] = reduced coordinates the component depends on
        let mut deps: Vec<Vec<(usize, EntryEval)>> = vec![Vec::new(); n_state];

        let mut add = |comp: usize, reduced: usize, eval: EntryEval, deps: &mut Vec<Vec<(usize, EntryEval)>>| {
            if !deps[comp].iter().any(|(r, _)| *r == reduced) {
                deps[comp].push((reduced, eval));
            }
        };

        let basin_deps = |ends: &ConnectorEnds| {
            let mut reduced = Vec::new();
            if let WaterSource::Basin(b) = ends.up {
                reduced.push(layout.reduced_basin(b));
            }
            if let WaterSource::Basin(b) = ends.dn {
                reduced.push(layout.reduced_basin(b));
            }
            reduced
        };

        for (i, ends) in physics.connectivity.rating_curves.iter().enumerate() {
            // Rating curves depend on the upstream level only.
            if let WaterSource::Basin(b) = ends.up {
                let comp = layout.index(ComponentClass::RatingCurve, i);
                let eval = EntryEval::Flow {
                    class: ComponentClass::RatingCurve,
                    index: i,
                };
                add(comp, layout.reduced_basin(b), eval, &mut deps);
            }
        }
        for (i, ends) in physics.connectivity.linear_resistances.iter().enumerate() {
            let comp = layout.index(ComponentClass::LinearResistance, i);
            let eval = EntryEval::Flow {
                class: ComponentClass::LinearResistance,
                index: i,
            };
            for reduced in basin_deps(ends) {
                add(comp, reduced, eval, &mut deps);
            }
        }
        for (i, ends) in physics.connectivity.manning_resistances.iter().enumerate() {
            let comp = layout.index(ComponentClass::ManningResistance, i);
            let eval = EntryEval::Flow {
                class: ComponentClass::ManningResistance,
                index: i,
            };
            for reduced in basin_deps(ends) {
                add(comp, reduced, eval, &mut deps);
            }
        }
        for (i, ends) in physics.connectivity.user_demands.iter().enumerate() {
            // Both components depend on the source basin; the outflow is the
            // inflow scaled by the return factor.
            if let WaterSource::Basin(b) = ends.up {
                let reduced = layout.reduced_basin(b);
                add(
                    layout.index(ComponentClass::UserDemandInflow, i),
                    reduced,
                    EntryEval::Flow {
                        class: ComponentClass::UserDemandInflow,
                        index: i,
                    },
                    &mut deps,
                );
                add(
                    layout.index(ComponentClass::UserDemandOutflow, i),
                    reduced,
                    EntryEval::Flow {
                        class: ComponentClass::UserDemandOutflow,
                        index: i,
                    },
                    &mut deps,
                );
            }
        }

        for (class, ends_list, pid_of) in [
            (
                ComponentClass::Pump,
                &physics.connectivity.pumps,
                NodeType::Pump,
            ),
            (
                ComponentClass::Outlet,
                &physics.connectivity.outlets,
                NodeType::Outlet,
            ),
        ] {
            for (i, ends) in ends_list.iter().enumerate() {
                let comp = layout.index(class, i);
                let pid = pids
                    .iter()
                    .position(|p| p.target.node_type == pid_of && p.target.index == i);
                match pid {
                    Some(k) => {
                        // Approximation: only the listened basin, the own
                        // integral and the upstream availability enter the
                        // pattern; cross terms through the frozen residual
                        // flux are dropped.
                        let eval = EntryEval::PidTarget { pid: k };
                        add(comp, layout.reduced_basin(pids[k].listen_basin), eval, &mut deps);
                        add(comp, layout.reduced_pid(k), eval, &mut deps);
                        if let WaterSource::Basin(b) = ends.up {
                            add(comp, layout.reduced_basin(b), eval, &mut deps);
                        }
                    }
                    None => {
                        if let WaterSource::Basin(b) = ends.up {
                            let eval = EntryEval::Flow { class, index: i };
                            add(comp, layout.reduced_basin(b), eval, &mut deps);
                        }
                    }
                }
            }
        }

        for b in 0..layout.n_basins() {
            let reduced = layout.reduced_basin(b);
            add(
                layout.index(ComponentClass::BasinEvaporation, b),
                reduced,
                EntryEval::Flow {
                    class: ComponentClass::BasinEvaporation,
                    index: b,
                },
                &mut deps,
            );
            add(
                layout.index(ComponentClass::BasinInfiltration, b),
                reduced,
                EntryEval::Flow {
                    class: ComponentClass::BasinInfiltration,
                    index: b,
                },
                &mut deps,
            );
        }
        for (k, pid) in pids.iter().enumerate() {
            add(
                layout.index(ComponentClass::PidIntegral, k),
                layout.reduced_basin(pid.listen_basin),
                EntryEval::PidError { pid: k },
                &mut deps,
            );
        }

        // Regroup by reduced coordinate into column plans.
        let mut columns: Vec<ColumnPlan> = (0..n_reduced)
            .map(|reduced| ColumnPlan {
                reduced,
                entries: Vec::new(),
            })
            .collect();
        for (comp, comp_deps) in deps.iter().enumerate() {
            for (reduced, eval) in comp_deps {
                columns[*reduced].entries.push((comp, *eval));
            }
        }
        let nnz = columns.iter().map(|c| c.entries.len()).sum();

        // A's columns, for the reduced product.
        let mut a_by_component: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n_state];
        for (row, vec) in physics.aggregation.outer_iterator().enumerate() {
            for (col, &value) in vec.iter() {
                a_by_component[col].push((row, value));
            }
        }

        Self {
            n_state,
            n_reduced,
            columns,
            values: vec![0.0; nnz],
            a_by_component,
            pid_fluxes: vec![0.0; pids.len()],
            parallel,
        }
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Numerical update of `J_int` at the evaluation point of the latest RHS
    /// call. `du` is that derivative vector, used to freeze the residual
    /// fluxes seen by PID formulas.
    #[allow(clippy::too_many_arguments)]
    pub fn refresh(
        &mut self,
        physics: &Physics,
        t: f64,
        nodes: &Nodes,
        pids: &[PidControl],
        basins: &BasinState,
        du: &[f64],
    ) {
        for (k, pid) in pids.iter().enumerate() {
            self.pid_fluxes[k] = physics.residual_flux(pid, nodes, du);
        }

        // Column-by-column dual seeding. Each column owns a disjoint slice
        // of `values`, so the loop is data-parallel.
        let mut slices: Vec<(&ColumnPlan, &mut [f64])> = Vec::with_capacity(self.columns.len());
        let mut rest = self.values.as_mut_slice();
        for column in &self.columns {
            let (head, tail) = rest.split_at_mut(column.entries.len());
            slices.push((column, head));
            rest = tail;
        }

        let layout = &physics.layout;
        let pid_fluxes = &self.pid_fluxes;
        let eval_column = |column: &ColumnPlan, out: &mut [f64]| {
            let seed = column.reduced;
            let basin_value = |b: usize| {
                let storage = basins.storage[b];
                if layout.reduced_basin(b) == seed {
                    Dual::variable(storage)
                } else {
                    Dual::constant(storage)
                }
            };
            for ((comp, eval), slot) in column.entries.iter().zip(out.iter_mut()) {
                let derivative = match eval {
                    EntryEval::Flow { class, index } => {
                        let value: Dual = physics.component_value(*class, *index, t, nodes, basins, &basin_value);
                        value.eps
                    }
                    EntryEval::PidTarget { pid } => {
                        let k = *pid;
                        let integral = if layout.reduced_pid(k) == seed {
                            Dual::variable(basins.pid_integral(layout, k))
                        } else {
                            Dual::constant(basins.pid_integral(layout, k))
                        };
                        let value: Dual =
                            physics.pid_flow(&pids[k], t, nodes, basins, pid_fluxes[k], integral, &basin_value);
                        value.eps
                    }
                    EntryEval::PidError { pid } => {
                        let value: Dual = physics.pid_error(&pids[*pid], t, nodes, basins, &basin_value);
                        value.eps
                    }
                };
                let _ = comp;
                *slot = derivative;
            }
        };

        if self.parallel {
            slices
                .into_par_iter()
                .for_each(|(column, out)| eval_column(column, out));
        } else {
            for (column, out) in slices {
                eval_column(column, out);
            }
        }
    }

    /// `out[comp] += scale · (J_int·c)[comp]`.
    fn add_j_int_product(&self, c: &[f64], scale: f64, out: &mut [f64]) {
        let mut offset = 0;
        for column in &self.columns {
            let coeff = c[column.reduced] * scale;
            if coeff != 0.0 {
                for ((comp, _), value) in column.entries.iter().zip(&self.values[offset..]) {
                    out[*comp] += coeff * value;
                }
            }
            offset += column.entries.len();
        }
    }

    /// Dense `A·J_int` (reduced × reduced).
    fn reduced_product(&self) -> DMatrix<f64> {
        let mut m = DMatrix::zeros(self.n_reduced, self.n_reduced);
        let mut offset = 0;
        for column in &self.columns {
            for ((comp, _), value) in column.entries.iter().zip(&self.values[offset..]) {
                for (row, coeff) in &self.a_by_component[*comp] {
                    m[(*row, column.reduced)] += coeff * value;
                }
            }
            offset += column.entries.len();
        }
        m
    }

    /// Factorize `W = γ⁻¹·I − J_int·A` through the reduced system
    /// `γ⁻¹·I − A·J_int`, falling back to a dense full-space factorization
    /// when the reduced matrix is singular.
    pub fn factorize(&self, physics: &Physics, gamma: f64) -> Result<NewtonFactor, JacobianError> {
        let inv_gamma = 1.0 / gamma;
        let mut reduced = self.reduced_product();
        reduced *= -1.0;
        for i in 0..self.n_reduced {
            reduced[(i, i)] += inv_gamma;
        }
        let lu = reduced.lu();
        if lu.is_invertible() {
            return Ok(NewtonFactor {
                gamma,
                inner: FactorInner::Reduced(lu),
            });
        }

        // Direct factorization of the full-space Newton matrix.
        let mut full = DMatrix::zeros(self.n_state, self.n_state);
        let mut offset = 0;
        for column in &self.columns {
            for ((comp, _), value) in column.entries.iter().zip(&self.values[offset..]) {
                // J = J_int·A: spread the entry over A's row `column.reduced`.
                if let Some(vec) = physics.aggregation.outer_view(column.reduced) {
                    for (a_col, &a_val) in vec.iter() {
                        full[(*comp, a_col)] -= value * a_val;
                    }
                }
            }
            offset += column.entries.len();
        }
        for i in 0..self.n_state {
            full[(i, i)] += inv_gamma;
        }
        let lu = full.lu();
        if !lu.is_invertible() {
            return Err(JacobianError::Singular);
        }
        Ok(NewtonFactor {
            gamma,
            inner: FactorInner::Full(lu),
        })
    }

    /// Solve `W·a = b` with a prepared factorization: reduced solve in
    /// storage space, then the recovery `a = γ·(b + J_int·c)`.
    pub fn solve(
        &self,
        physics: &Physics,
        factor: &NewtonFactor,
        b: &[f64],
        out: &mut [f64],
    ) -> Result<(), JacobianError> {
        match &factor.inner {
            FactorInner::Reduced(lu) => {
                let mut rhs = DVector::zeros(self.n_reduced);
                crate::state::apply_operator(&physics.aggregation, b, rhs.as_mut_slice());
                let c = lu.solve(&rhs).ok_or(JacobianError::Singular)?;
                out.copy_from_slice(b);
                self.add_j_int_product(c.as_slice(), 1.0, out);
                for value in out.iter_mut() {
                    *value *= factor.gamma;
                }
                Ok(())
            }
            FactorInner::Full(lu) => {
                let rhs = DVector::from_column_slice(b);
                let solution = lu.solve(&rhs).ok_or(JacobianError::Singular)?;
                out.copy_from_slice(solution.as_slice());
                Ok(())
            }
        }
    }
}

enum FactorInner {
    Reduced(nalgebra::LU<f64, nalgebra::Dyn, nalgebra::Dyn>),
    Full(nalgebra::LU<f64, nalgebra::Dyn, nalgebra::Dyn>),
}

pub struct NewtonFactor {
    gamma: f64,
    inner: FactorInner,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Graph, LinkType, NodeId};
    use crate::nodes::{Basin, BasinProfile, Forcings, LinearResistance, LinearResistanceParams};
    use float_cmp::assert_approx_eq;
    use std::collections::HashMap;

    fn two_basin_setup() -> (Physics, Nodes) {
        let mut graph = Graph::default();
        let b1 = graph.add_node(NodeType::Basin, 1, None, None).unwrap();
        let r = graph.add_node(NodeType::LinearResistance, 2, None, None).unwrap();
        let b2 = graph.add_node(NodeType::Basin, 3, None, None).unwrap();
        graph.add_link(1, b1, r, LinkType::Flow).unwrap();
        graph.add_link(2, r, b2, LinkType::Flow).unwrap();

        let mut nodes = Nodes::default();
        for (ordinal, index, level) in [(1, 0, 2.0), (3, 1, 0.0)] {
            let id = NodeId::new(NodeType::Basin, ordinal, index);
            let profile = BasinProfile::new(id, vec![0.0, 10.0], vec![100.0, 100.0]).unwrap();
            nodes.basins.push(Basin::new(id, profile, Forcings::default(), level));
        }
        nodes.linear_resistances.push(LinearResistance {
            node_id: NodeId::new(NodeType::LinearResistance, 2, 0),
            params: LinearResistanceParams {
                active: true,
                resistance: 2.0,
                max_flow_rate: f64::INFINITY,
            },
            control_states: HashMap::new(),
        });
        nodes.basin_boundary_inflows = vec![Vec::new(), Vec::new()];
        let physics = Physics::new(&graph).unwrap();
        (physics, nodes)
    }

    #[test]
    fn sparsity_covers_both_basins() {
        let (physics, nodes) = two_basin_setup();
        let jac = ReducedJacobian::new(&physics, &[], false);
        // Resistance depends on both basins, two vertical fluxes per basin
        // have zero rates but still carry pattern entries.
        assert_eq!(jac.nnz(), 2 + 4);
    }

    #[test]
    fn jacobian_matches_linear_law() {
        let (physics, nodes) = two_basin_setup();
        let mut basins = BasinState::new(&physics.layout);
        let u = vec![0.0; physics.layout.len()];
        let mut du = vec![0.0; physics.layout.len()];
        physics.rhs(0.0, &u, &nodes, &[], &mut basins, &mut du);

        let mut jac = ReducedJacobian::new(&physics, &[], false);
        jac.refresh(&physics, 0.0, &nodes, &[], &basins, &du);

        // q = (h1 − h2)/R with h = s/100, R = 2: ∂q/∂s1 = 1/200.
        let comp = physics.layout.index(ComponentClass::LinearResistance, 0);
        let mut offset = 0;
        let mut seen = Vec::new();
        for column in &jac.columns {
            for ((entry_comp, _), value) in column.entries.iter().zip(&jac.values[offset..]) {
                if *entry_comp == comp {
                    seen.push((column.reduced, *value));
                }
            }
            offset += column.entries.len();
        }
        seen.sort_by_key(|(reduced, _)| *reduced);
        assert_eq!(seen.len(), 2);
        assert_approx_eq!(f64, seen[0].1, 0.005);
        assert_approx_eq!(f64, seen[1].1, -0.005);
    }

    #[test]
    fn reduced_solve_matches_full_solve() {
        let (physics, nodes) = two_basin_setup();
        let mut basins = BasinState::new(&physics.layout);
        let u = vec![0.0; physics.layout.len()];
        let mut du = vec![0.0; physics.layout.len()];
        physics.rhs(0.0, &u, &nodes, &[], &mut basins, &mut du);

        let mut jac = ReducedJacobian::new(&physics, &[], false);
        jac.refresh(&physics, 0.0, &nodes, &[], &basins, &du);

        let gamma = 10.0;
        let factor = jac.factorize(&physics, gamma).unwrap();
        let b: Vec<f64> = (0..physics.layout.len()).map(|i| 1.0 + i as f64).collect();
        let mut a = vec![0.0; b.len()];
        jac.solve(&physics, &factor, &b, &mut a).unwrap();

        // Verify W·a = b by explicit residual: W = γ⁻¹·I − J_int·A.
        let mut u_red = vec![0.0; physics.layout.reduced_len()];
        crate::state::apply_operator(&physics.aggregation, &a, &mut u_red);
        let mut j_a = vec![0.0; b.len()];
        jac.add_j_int_product(&u_red, 1.0, &mut j_a);
        for i in 0..b.len() {
            let residual = a[i] / gamma - j_a[i] - b[i];
            assert!(residual.abs() < 1e-9, "residual {residual} at component {i}");
        }
    }
}
