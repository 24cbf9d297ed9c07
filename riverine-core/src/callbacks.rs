//! Event clock and post-step bookkeeping.
//!
//! The integrator clamps every step to the next scheduled instant, so saveat
//! points, forcing step changes, allocation ticks and tolerance checkpoints
//! are hit exactly. After each accepted step the model runs its callbacks in
//! the fixed order documented on [`crate::model::Model::run`].

use crate::settings::Settings;

/// Which events fall on an instant the integrator just reached.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Events {
    pub save: bool,
    pub forcing_change: bool,
    pub allocation: bool,
    /// Tolerance checkpoint value when one is due.
    pub checkpoint: Option<f64>,
}

impl Events {
    pub fn any(&self) -> bool {
        self.save || self.forcing_change || self.allocation || self.checkpoint.is_some()
    }
}

/// Merged schedule of all instants the integrator must land on.
#[derive(Debug, Clone, Default)]
pub struct EventClock {
    saveat: Vec<f64>,
    forcing: Vec<f64>,
    allocation: Vec<f64>,
    checkpoints: Vec<f64>,
    cursors: [usize; 4],
}

impl EventClock {
    pub fn new(settings: &Settings, forcing_times: &[f64]) -> Self {
        let duration = settings.duration;

        let mut saveat = Vec::new();
        let mut t = settings.saveat;
        while t < duration + settings.saveat * 0.5 {
            saveat.push(t.min(duration));
            t += settings.saveat;
        }
        if saveat.last() != Some(&duration) {
            saveat.push(duration);
        }

        let forcing: Vec<f64> = forcing_times
            .iter()
            .copied()
            .filter(|&t| t > 0.0 && t < duration)
            .collect();

        let mut allocation = Vec::new();
        if let Some(interval) = settings.allocation_timestep {
            let mut t = interval;
            while t <= duration + 1e-9 {
                allocation.push(t.min(duration));
                t += interval;
            }
        }

        // Logarithmic instants for cumulative-tolerance tightening.
        let mut checkpoints = Vec::new();
        let mut checkpoint = 10.0;
        while checkpoint < duration {
            checkpoints.push(checkpoint);
            checkpoint *= 10.0;
        }

        Self {
            saveat,
            forcing,
            allocation,
            checkpoints,
            cursors: [0; 4],
        }
    }

    fn streams(&self) -> [&[f64]; 4] {
        [&self.saveat, &self.forcing, &self.allocation, &self.checkpoints]
    }

    /// The next scheduled instant strictly after `t`, if any.
    pub fn next_after(&self, t: f64) -> Option<f64> {
        self.streams()
            .iter()
            .zip(&self.cursors)
            .filter_map(|(stream, &cursor)| stream[cursor..].iter().find(|&&instant| instant > t + 1e-9))
            .fold(None, |best: Option<f64>, &candidate| {
                Some(best.map_or(candidate, |b| b.min(candidate)))
            })
    }

    /// Consume every event falling on `t` (within clock tolerance).
    pub fn take_events_at(&mut self, t: f64) -> Events {
        let mut events = Events::default();
        let streams = [
            self.saveat.as_slice(),
            self.forcing.as_slice(),
            self.allocation.as_slice(),
            self.checkpoints.as_slice(),
        ];
        let mut hits = [false; 4];
        let mut checkpoint = None;
        for (slot, stream) in streams.iter().enumerate() {
            let mut cursor = self.cursors[slot];
            while cursor < stream.len() && stream[cursor] <= t + 1e-9 {
                hits[slot] = true;
                if slot == 3 {
                    checkpoint = Some(stream[cursor]);
                }
                cursor += 1;
            }
            self.cursors[slot] = cursor;
        }
        events.save = hits[0];
        events.forcing_change = hits[1];
        events.allocation = hits[2];
        events.checkpoint = checkpoint;
        events
    }
}

/// Snapshots of the cumulative state used to turn cumulative flows into
/// interval means for outputs and allocation coefficients.
#[derive(Debug, Clone, Default)]
pub struct CumulativeTracker {
    pub u_last_save: Vec<f64>,
    pub t_last_save: f64,
    /// Basin storages, exact forcing integrals and boundary volumes at the
    /// last save, for interval means and the water-balance check.
    pub basin_storage_last_save: Vec<f64>,
    pub basin_forcing_last_save: Vec<f64>,
    pub boundary_volume_last_save: Vec<f64>,
    pub u_last_allocation: Vec<f64>,
    pub t_last_allocation: f64,
    /// Exactly-integrated forcing volume per basin at the last allocation.
    pub basin_forcing_last_allocation: Vec<f64>,
    /// Discharged volume per flow boundary at the last allocation.
    pub boundary_volume_last_allocation: Vec<f64>,
    /// Basin storages at the last allocation, for realized storage rates.
    pub basin_storage_last_allocation: Vec<f64>,
}

impl CumulativeTracker {
    pub fn new(n_state: usize, n_basins: usize, n_boundaries: usize) -> Self {
        Self {
            u_last_save: vec![0.0; n_state],
            t_last_save: 0.0,
            basin_storage_last_save: vec![0.0; n_basins],
            basin_forcing_last_save: vec![0.0; n_basins],
            boundary_volume_last_save: vec![0.0; n_boundaries],
            u_last_allocation: vec![0.0; n_state],
            t_last_allocation: 0.0,
            basin_forcing_last_allocation: vec![0.0; n_basins],
            boundary_volume_last_allocation: vec![0.0; n_boundaries],
            basin_storage_last_allocation: vec![0.0; n_basins],
        }
    }

    /// Mean of a state component's rate over the save interval ending at `t`.
    pub fn mean_since_save(&self, component: usize, u: &[f64], t: f64) -> f64 {
        let dt = t - self.t_last_save;
        if dt <= 0.0 {
            return 0.0;
        }
        (u[component] - self.u_last_save[component]) / dt
    }

    /// Mean of a state component's rate over the allocation interval.
    pub fn mean_since_allocation(&self, component: usize, u: &[f64], t: f64) -> f64 {
        let dt = t - self.t_last_allocation;
        if dt <= 0.0 {
            return 0.0;
        }
        (u[component] - self.u_last_allocation[component]) / dt
    }

    pub fn mark_save(&mut self, u: &[f64], t: f64, nodes: &crate::nodes::Nodes, storages: &[f64]) {
        self.u_last_save.copy_from_slice(u);
        self.t_last_save = t;
        for (b, basin) in nodes.basins.iter().enumerate() {
            self.basin_storage_last_save[b] = storages[b];
            self.basin_forcing_last_save[b] = basin.exact_inflow.volume(t);
        }
        for (i, boundary) in nodes.flow_boundaries.iter().enumerate() {
            self.boundary_volume_last_save[i] = boundary.volume(t);
        }
    }

    pub fn mark_allocation(&mut self, u: &[f64], t: f64, nodes: &crate::nodes::Nodes, storages: &[f64]) {
        self.u_last_allocation.copy_from_slice(u);
        self.t_last_allocation = t;
        for (b, basin) in nodes.basins.iter().enumerate() {
            self.basin_forcing_last_allocation[b] = basin.exact_inflow.volume(t);
            self.basin_storage_last_allocation[b] = storages[b];
        }
        for (i, boundary) in nodes.flow_boundaries.iter().enumerate() {
            self.boundary_volume_last_allocation[i] = boundary.volume(t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    fn settings(duration: f64, saveat: f64, allocation: Option<f64>) -> Settings {
        Settings {
            duration,
            saveat,
            allocation_timestep: allocation,
            ..Settings::default()
        }
    }

    #[test]
    fn saveat_instants_cover_the_run() {
        let clock = EventClock::new(&settings(100.0, 30.0, None), &[]);
        assert_eq!(clock.saveat, vec![30.0, 60.0, 90.0, 100.0]);
    }

    #[test]
    fn next_event_merges_streams() {
        let mut clock = EventClock::new(&settings(100.0, 40.0, Some(25.0)), &[10.0, 50.0]);
        assert_approx_eq!(f64, clock.next_after(0.0).unwrap(), 10.0);
        let events = clock.take_events_at(10.0);
        assert!(events.forcing_change && !events.save && !events.allocation);
        assert_approx_eq!(f64, clock.next_after(10.0).unwrap(), 25.0);
        clock.take_events_at(25.0);
        assert_approx_eq!(f64, clock.next_after(25.0).unwrap(), 40.0);
    }

    #[test]
    fn coinciding_events_fire_together() {
        let mut clock = EventClock::new(&settings(100.0, 50.0, Some(50.0)), &[50.0]);
        let events = clock.take_events_at(50.0);
        assert!(events.save && events.forcing_change && events.allocation);
        assert!(clock.take_events_at(50.0) == Events::default());
    }

    #[test]
    fn interval_means() {
        let mut tracker = CumulativeTracker::new(2, 0, 0);
        let u0 = vec![0.0, 10.0];
        tracker.mark_save(&u0, 0.0, &crate::nodes::Nodes::default(), &[]);
        let u1 = vec![5.0, 12.0];
        assert_approx_eq!(f64, tracker.mean_since_save(0, &u1, 10.0), 0.5);
        assert_approx_eq!(f64, tracker.mean_since_save(1, &u1, 10.0), 0.2);
    }
}
