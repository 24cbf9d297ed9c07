//! Adaptive implicit integrator.
//!
//! BDF-class driver over the cumulative-flow state: backward Euler on the
//! first step (and after every parameter discontinuity), variable-step BDF2
//! once history exists. Each step solves the implicit equation with a Newton
//! iteration whose linear solves go through the reduced-space factorization
//! of [`crate::jacobian::ReducedJacobian`]. Steps whose candidate state
//! projects a negative storage are rejected out of domain.

use crate::control::PidControl;
use crate::jacobian::{JacobianError, NewtonFactor, ReducedJacobian};
use crate::nodes::Nodes;
use crate::physics::{BasinState, Physics};
use crate::state::ComponentClass;
use thiserror::Error;
use tracing::{debug, trace};

const MAX_NEWTON_ITERS: usize = 10;
/// Newton convergence threshold on the WRMS norm of the update.
const NEWTON_KAPPA: f64 = 0.33;
/// Consecutive step-failure limit before aborting with a diagnostic.
const MAX_CONSECUTIVE_FAILURES: usize = 20;
const MIN_STEP_SCALE: f64 = 0.2;
const MAX_STEP_SCALE: f64 = 5.0;
const SAFETY: f64 = 0.9;

#[derive(Error, Debug)]
pub enum SolverError {
    #[error("integrator exceeded maxiters ({maxiters}) at t = {t} s")]
    MaxIters { maxiters: usize, t: f64 },
    #[error("Newton iteration failed {failures} times in a row at t = {t} s (dt = {dt} s)")]
    RepeatedNewtonFailure { failures: usize, t: f64, dt: f64 },
    #[error(transparent)]
    Linear(#[from] JacobianError),
}

/// Counters reported with the solver-stats output stream.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SolverStats {
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub rhs_calls: usize,
    pub jacobian_refreshes: usize,
    pub linear_solves: usize,
}

pub struct Integrator {
    pub t: f64,
    pub u: Vec<f64>,
    /// State at the previous accepted step, for the BDF2 history.
    u_prev: Vec<f64>,
    dt_prev: Option<f64>,
    dt: f64,
    /// Per-component relative tolerance; cumulative components tighten over
    /// logarithmic checkpoints.
    pub reltol: Vec<f64>,
    abstol: f64,
    base_reltol: f64,
    maxiters: usize,
    pub stats: SolverStats,

    // Work buffers.
    du: Vec<f64>,
    u_pred: Vec<f64>,
    u_iter: Vec<f64>,
    residual: Vec<f64>,
    delta: Vec<f64>,
    bdf_const: Vec<f64>,
}

impl Integrator {
    pub fn new(n: usize, abstol: f64, reltol: f64, maxiters: usize) -> Self {
        Self {
            t: 0.0,
            u: vec![0.0; n],
            u_prev: vec![0.0; n],
            dt_prev: None,
            dt: 1.0,
            reltol: vec![reltol; n],
            abstol,
            base_reltol: reltol,
            maxiters,
            stats: SolverStats::default(),
            du: vec![0.0; n],
            u_pred: vec![0.0; n],
            u_iter: vec![0.0; n],
            residual: vec![0.0; n],
            delta: vec![0.0; n],
            bdf_const: vec![0.0; n],
        }
    }

    /// Drop the multistep history, forcing a backward-Euler restart. Called
    /// after any parameter discontinuity (control transition, forcing step,
    /// allocation writeback).
    pub fn reset_history(&mut self) {
        self.dt_prev = None;
    }

    /// Weighted RMS norm of `e` against the current state and tolerances.
    fn wrms(&self, e: &[f64], reference: &[f64]) -> f64 {
        let n = e.len().max(1);
        let sum: f64 = e
            .iter()
            .zip(reference)
            .zip(&self.reltol)
            .map(|((e, u), reltol)| {
                let weight = self.abstol + reltol * u.abs();
                (e / weight).powi(2)
            })
            .sum();
        (sum / n as f64).sqrt()
    }

    /// Tighten cumulative-component relative tolerances at a logarithmic
    /// time checkpoint so late, large cumulative values keep precision:
    /// `reltol ← max(10^(log₁₀ reltol − log₁₀(cum/avg_rate)), 1e-14)` with
    /// the average rate taken over the whole run so far.
    pub fn tighten_tolerances(&mut self, physics: &Physics, checkpoint: f64) {
        if checkpoint <= 1.0 {
            return;
        }
        for class in ComponentClass::ALL {
            if !class.is_cumulative_flow() {
                continue;
            }
            for i in physics.layout.range(class) {
                let cumulative = self.u[i].abs();
                if cumulative == 0.0 {
                    continue;
                }
                // The ratio cumulative/average-rate is the elapsed time, so
                // the tolerance scales with the checkpoint itself.
                self.reltol[i] = (self.base_reltol / checkpoint).max(1e-14);
            }
        }
        debug!(checkpoint, "tightened cumulative relative tolerances");
    }

    /// Advance to exactly `target`, hitting it with the final step. Events
    /// (saveat, forcing changes, allocation ticks) are scheduled by passing
    /// the next event time as `target`.
    #[allow(clippy::too_many_arguments)]
    pub fn advance_to(
        &mut self,
        target: f64,
        physics: &Physics,
        nodes: &Nodes,
        pids: &[PidControl],
        jacobian: &mut ReducedJacobian,
        basins: &mut BasinState,
    ) -> Result<(), SolverError> {
        while self.t < target - 1e-9 {
            self.step_once(target, physics, nodes, pids, jacobian, basins)?;
        }
        Ok(())
    }

    /// Take exactly one accepted step towards `target` (clamped so `target`
    /// is never overshot), retrying internally on rejections.
    #[allow(clippy::too_many_arguments)]
    pub fn step_once(
        &mut self,
        target: f64,
        physics: &Physics,
        nodes: &Nodes,
        pids: &[PidControl],
        jacobian: &mut ReducedJacobian,
        basins: &mut BasinState,
    ) -> Result<(), SolverError> {
        let mut consecutive_failures = 0usize;

        while self.t < target - 1e-9 {
            if self.stats.accepted_steps + self.stats.rejected_steps >= self.maxiters {
                return Err(SolverError::MaxIters {
                    maxiters: self.maxiters,
                    t: self.t,
                });
            }

            let dt = self.dt.min(target - self.t);
            match self.try_step(dt, physics, nodes, pids, jacobian, basins)? {
                StepResult::Accepted { error } => {
                    self.stats.accepted_steps += 1;
                    // Standard controller; order p ⇒ exponent 1/(p+1).
                    let order = if self.dt_prev.is_some() { 2.0 } else { 1.0 };
                    let scale = if error > 0.0 {
                        (SAFETY * error.powf(-1.0 / (order + 1.0))).clamp(MIN_STEP_SCALE, MAX_STEP_SCALE)
                    } else {
                        MAX_STEP_SCALE
                    };
                    self.dt = (dt * scale).max(1e-9);
                    trace!(t = self.t, dt = self.dt, error, "accepted step");
                    return Ok(());
                }
                StepResult::Rejected { reason } => {
                    consecutive_failures += 1;
                    self.stats.rejected_steps += 1;
                    if consecutive_failures > MAX_CONSECUTIVE_FAILURES {
                        return Err(SolverError::RepeatedNewtonFailure {
                            failures: consecutive_failures,
                            t: self.t,
                            dt,
                        });
                    }
                    let scale = match reason {
                        RejectReason::ErrorTooLarge { error } => {
                            (SAFETY * error.powf(-0.5)).clamp(MIN_STEP_SCALE, 0.9)
                        }
                        RejectReason::NewtonDiverged => 0.25,
                        RejectReason::NegativeStorage => 0.5,
                    };
                    self.dt = (dt * scale).max(1e-9);
                    trace!(t = self.t, dt = self.dt, ?reason, "rejected step");
                }
            }
        }
        Ok(())
    }

    fn try_step(
        &mut self,
        dt: f64,
        physics: &Physics,
        nodes: &Nodes,
        pids: &[PidControl],
        jacobian: &mut ReducedJacobian,
        basins: &mut BasinState,
    ) -> Result<StepResult, SolverError> {
        let t_new = self.t + dt;

        // Predictor and BDF coefficients. With history, variable-step BDF2:
        //   u⁺ = (1+ρ)²/(1+2ρ)·uₙ − ρ²/(1+2ρ)·uₙ₋₁ + γ·f(u⁺),
        //   γ = dt·(1+ρ)/(1+2ρ), ρ = dt/dtₙ₋₁.
        let gamma = match self.dt_prev {
            Some(dt_prev) => {
                let rho = dt / dt_prev;
                let denominator = 1.0 + 2.0 * rho;
                let a0 = (1.0 + rho).powi(2) / denominator;
                let a1 = -rho.powi(2) / denominator;
                for i in 0..self.u.len() {
                    self.bdf_const[i] = a0 * self.u[i] + a1 * self.u_prev[i];
                    // Linear extrapolation through the last two states.
                    self.u_pred[i] = self.u[i] + rho * (self.u[i] - self.u_prev[i]);
                }
                dt * (1.0 + rho) / denominator
            }
            None => {
                self.bdf_const.copy_from_slice(&self.u);
                self.u_pred.copy_from_slice(&self.u);
                dt
            }
        };

        // Newton iteration on F(v) = v − γ·f(v) − const. The linear solver
        // factors W = γ⁻¹·I − J, and F′ = I − γ·J = γ·W, so each update
        // solves W·δ = F/γ.
        self.u_iter.copy_from_slice(&self.u_pred);
        let mut factor: Option<NewtonFactor> = None;
        let mut converged = false;

        for iteration in 0..MAX_NEWTON_ITERS {
            physics.rhs(t_new, &self.u_iter, nodes, pids, basins, &mut self.du);
            self.stats.rhs_calls += 1;

            for i in 0..self.u.len() {
                self.residual[i] = (self.u_iter[i] - gamma * self.du[i] - self.bdf_const[i]) / gamma;
            }

            if factor.is_none() {
                jacobian.refresh(physics, t_new, nodes, pids, basins, &self.du);
                self.stats.jacobian_refreshes += 1;
                factor = Some(jacobian.factorize(physics, gamma)?);
            }

            jacobian.solve(physics, factor.as_ref().expect("set above"), &self.residual, &mut self.delta)?;
            self.stats.linear_solves += 1;

            for i in 0..self.u.len() {
                self.u_iter[i] -= self.delta[i];
            }

            let update_norm = self.wrms(&self.delta, &self.u_iter);
            if update_norm < NEWTON_KAPPA {
                converged = true;
                break;
            }
            // Slow contraction: refresh the Jacobian at the newest iterate.
            if iteration >= 2 {
                factor = None;
            }
        }

        if !converged {
            return Ok(StepResult::Rejected {
                reason: RejectReason::NewtonDiverged,
            });
        }

        // Out-of-domain rejection: a candidate that projects any storage
        // negative (beyond tolerance) shrinks the step instead of crossing.
        physics.update_basins(t_new, &self.u_iter, nodes, basins);
        if basins.storage.iter().any(|&s| s < -self.abstol) {
            return Ok(StepResult::Rejected {
                reason: RejectReason::NegativeStorage,
            });
        }

        // Local error from the predictor-corrector difference.
        for i in 0..self.u.len() {
            self.delta[i] = self.u_iter[i] - self.u_pred[i];
        }
        let error_coefficient = match self.dt_prev {
            Some(dt_prev) => {
                let rho = dt / dt_prev;
                // LTE coefficient of variable-step BDF2.
                (1.0 + rho) / (1.0 + 3.0 * rho + 2.0 * rho.powi(2) + rho.powi(2) / (1.0 + rho))
            }
            None => 0.5,
        };
        let error = error_coefficient * self.wrms(&self.delta, &self.u_iter);

        if error > 1.0 {
            return Ok(StepResult::Rejected {
                reason: RejectReason::ErrorTooLarge { error },
            });
        }

        // Accept.
        self.u_prev.copy_from_slice(&self.u);
        self.u.copy_from_slice(&self.u_iter);
        self.dt_prev = Some(dt);
        self.t = t_new;
        Ok(StepResult::Accepted { error })
    }
}

enum StepResult {
    Accepted { error: f64 },
    Rejected { reason: RejectReason },
}

#[derive(Debug)]
enum RejectReason {
    ErrorTooLarge { error: f64 },
    NewtonDiverged,
    NegativeStorage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Graph, LinkType, NodeId, NodeType};
    use crate::nodes::{Basin, BasinProfile, Forcings, LinearResistance, LinearResistanceParams};
    use float_cmp::assert_approx_eq;
    use std::collections::HashMap;

    /// Basin (200 m³) draining into an empty basin through R = 1 s/m².
    fn drainage_pair() -> (Physics, Nodes) {
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
                resistance: 1.0,
                max_flow_rate: f64::INFINITY,
            },
            control_states: HashMap::new(),
        });
        nodes.basin_boundary_inflows = vec![Vec::new(), Vec::new()];
        (Physics::new(&graph).unwrap(), nodes)
    }

    #[test]
    fn equilibrates_two_basins() {
        let (physics, nodes) = drainage_pair();
        let mut basins = BasinState::new(&physics.layout);
        let mut jacobian = ReducedJacobian::new(&physics, &[], false);
        let mut integrator = Integrator::new(physics.layout.len(), 1e-8, 1e-8, 100_000);

        // Δh decays with time constant R·A/2 = 50 s; by 10 000 s the levels
        // have converged to 1 m each.
        integrator
            .advance_to(10_000.0, &physics, &nodes, &[], &mut jacobian, &mut basins)
            .unwrap();

        physics.update_basins(integrator.t, &integrator.u, &nodes, &mut basins);
        assert_approx_eq!(f64, basins.level[0], 1.0, epsilon = 1e-4);
        assert_approx_eq!(f64, basins.level[1], 1.0, epsilon = 1e-4);
        // Mass conserved exactly by construction of A.
        assert_approx_eq!(f64, basins.storage[0] + basins.storage[1], 200.0, epsilon = 1e-6);
        assert!(integrator.stats.accepted_steps > 0);
    }

    #[test]
    fn analytic_decay_rate() {
        let (physics, nodes) = drainage_pair();
        let mut basins = BasinState::new(&physics.layout);
        let mut jacobian = ReducedJacobian::new(&physics, &[], false);
        let mut integrator = Integrator::new(physics.layout.len(), 1e-10, 1e-10, 100_000);

        // Δh(t) = Δh₀·exp(−t/50)
        integrator
            .advance_to(25.0, &physics, &nodes, &[], &mut jacobian, &mut basins)
            .unwrap();
        physics.update_basins(integrator.t, &integrator.u, &nodes, &mut basins);
        let dh = basins.level[0] - basins.level[1];
        assert_approx_eq!(f64, dh, 2.0 * (-25.0_f64 / 50.0).exp(), epsilon = 1e-4);
    }

    #[test]
    fn tightening_shrinks_reltol_of_active_components() {
        let (physics, nodes) = drainage_pair();
        let mut basins = BasinState::new(&physics.layout);
        let mut jacobian = ReducedJacobian::new(&physics, &[], false);
        let mut integrator = Integrator::new(physics.layout.len(), 1e-8, 1e-6, 100_000);
        integrator
            .advance_to(100.0, &physics, &nodes, &[], &mut jacobian, &mut basins)
            .unwrap();

        let comp = physics.layout.index(ComponentClass::LinearResistance, 0);
        let before = integrator.reltol[comp];
        integrator.tighten_tolerances(&physics, 100.0);
        assert!(integrator.reltol[comp] < before);
        assert!(integrator.reltol[comp] >= 1e-14);
    }
}
