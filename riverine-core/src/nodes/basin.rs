use crate::graph::NodeId;
use crate::interpolate::{Extrapolation, Interpolation};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ProfileError {
    #[error("basin {node}: profile needs at least 2 rows")]
    TooFewRows { node: NodeId },
    #[error("basin {node}: profile levels are not strictly increasing")]
    NonUniqueLevels { node: NodeId },
    #[error("basin {node}: bottom area {area} is not positive")]
    NonPositiveBottomArea { node: NodeId, area: f64 },
    #[error("basin {node}: top area {top} is smaller than the area below it ({below})")]
    DecreasingTopArea { node: NodeId, top: f64, below: f64 },
    #[error("basin {node}: area {area} at level {level} is not positive")]
    NonPositiveArea { node: NodeId, level: f64, area: f64 },
}

/// Storage ↔ level ↔ area profile of a basin.
///
/// Input rows are `(level, area)`; storage breakpoints come from trapezoidal
/// integration of area over level, so storage is strictly increasing whenever
/// area is positive. Both lookup directions share the same breakpoints, which
/// makes `level(storage(h)) = h` exact on the profile domain.
#[derive(Debug, Clone)]
pub struct BasinProfile {
    /// Level as a piecewise-linear function of storage.
    storage_to_level: Interpolation,
    /// Area as a piecewise-linear function of level.
    level_to_area: Interpolation,
    bottom_level: f64,
    max_storage: f64,
    max_area: f64,
}

impl BasinProfile {
    pub fn new(node: NodeId, levels: Vec<f64>, areas: Vec<f64>) -> Result<Self, ProfileError> {
        if levels.len() < 2 || levels.len() != areas.len() {
            return Err(ProfileError::TooFewRows { node });
        }
        if levels.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ProfileError::NonUniqueLevels { node });
        }
        if areas[0] <= 0.0 {
            return Err(ProfileError::NonPositiveBottomArea { node, area: areas[0] });
        }
        if let Some(i) = areas.iter().position(|&a| a <= 0.0) {
            return Err(ProfileError::NonPositiveArea {
                node,
                level: levels[i],
                area: areas[i],
            });
        }
        let n = areas.len();
        if areas[n - 1] < areas[n - 2] {
            return Err(ProfileError::DecreasingTopArea {
                node,
                top: areas[n - 1],
                below: areas[n - 2],
            });
        }

        let mut storages = Vec::with_capacity(n);
        storages.push(0.0);
        for i in 1..n {
            let slab = (levels[i] - levels[i - 1]) * 0.5 * (areas[i] + areas[i - 1]);
            storages.push(storages[i - 1] + slab);
        }

        let max_storage = storages[n - 1];
        let max_area = areas.iter().cloned().fold(f64::MIN, f64::max);
        let bottom_level = levels[0];

        // Linear extrapolation above the profile keeps overfull basins
        // physical; below the bottom the level pins to the bed.
        let storage_to_level = Interpolation::new(storages, levels.clone(), Extrapolation::Constant, Extrapolation::Linear)
            .expect("storage breakpoints are strictly increasing for positive areas");
        let level_to_area = Interpolation::new(levels, areas, Extrapolation::Constant, Extrapolation::Constant)
            .expect("levels checked strictly increasing above");

        Ok(Self {
            storage_to_level,
            level_to_area,
            bottom_level,
            max_storage,
            max_area,
        })
    }

    pub fn level(&self, storage: f64) -> f64 {
        self.storage_to_level.value(storage)
    }

    /// `∂level/∂storage` at the given storage (one-sided at breakpoints).
    pub fn level_derivative(&self, storage: f64) -> f64 {
        self.storage_to_level.derivative(storage)
    }

    pub fn storage(&self, level: f64) -> f64 {
        self.storage_to_level.inverse(level)
    }

    pub fn area(&self, level: f64) -> f64 {
        self.level_to_area.value(level)
    }

    /// `∂area/∂level` at the given level (one-sided at breakpoints).
    pub fn area_derivative(&self, level: f64) -> f64 {
        self.level_to_area.derivative(level)
    }

    pub fn bottom_level(&self) -> f64 {
        self.bottom_level
    }

    pub fn max_storage(&self) -> f64 {
        self.max_storage
    }

    pub fn max_area(&self) -> f64 {
        self.max_area
    }
}

/// Index into [`Forcings`] interpolations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ForcingKind {
    Precipitation,
    PotentialEvaporation,
    Drainage,
    Infiltration,
    SurfaceRunoff,
}

impl ForcingKind {
    pub const ALL: [ForcingKind; 5] = [
        Self::Precipitation,
        Self::PotentialEvaporation,
        Self::Drainage,
        Self::Infiltration,
        Self::SurfaceRunoff,
    ];
}

/// Time series of the five basin forcings, applied piecewise-constant.
#[derive(Debug, Clone)]
pub struct Forcings {
    pub precipitation: Interpolation,
    pub potential_evaporation: Interpolation,
    pub drainage: Interpolation,
    pub infiltration: Interpolation,
    pub surface_runoff: Interpolation,
}

impl Default for Forcings {
    fn default() -> Self {
        Self {
            precipitation: Interpolation::constant(0.0),
            potential_evaporation: Interpolation::constant(0.0),
            drainage: Interpolation::constant(0.0),
            infiltration: Interpolation::constant(0.0),
            surface_runoff: Interpolation::constant(0.0),
        }
    }
}

impl Forcings {
    pub fn get(&self, kind: ForcingKind) -> &Interpolation {
        match kind {
            ForcingKind::Precipitation => &self.precipitation,
            ForcingKind::PotentialEvaporation => &self.potential_evaporation,
            ForcingKind::Drainage => &self.drainage,
            ForcingKind::Infiltration => &self.infiltration,
            ForcingKind::SurfaceRunoff => &self.surface_runoff,
        }
    }

    /// The union of breakpoint instants across all five series up to `end`,
    /// for the event clock. Constant series contribute nothing; cyclic
    /// series repeat every period.
    pub fn change_times(&self, end: f64) -> Vec<f64> {
        let mut times = Vec::new();
        for kind in ForcingKind::ALL {
            let interp = self.get(kind);
            if interp.xs().len() > 2 || interp.ys()[0] != interp.ys()[interp.ys().len() - 1] || interp.is_cyclic() {
                times.extend(interp.breakpoints_within(end));
            }
        }
        times.sort_by(|a, b| a.total_cmp(b));
        times.dedup();
        times
    }
}

/// Exact integrals of the storage-independent forcings (precipitation,
/// drainage, surface runoff). The rates are piecewise constant; between step
/// changes the integral is linear in time, so the accumulated volume is exact.
#[derive(Debug, Clone, Default)]
pub struct ForcingIntegral {
    /// Accumulated volume up to `t_mark`.
    pub volume_at_mark: f64,
    /// Net volumetric rate currently in force.
    pub rate: f64,
    pub t_mark: f64,
}

impl ForcingIntegral {
    pub fn volume(&self, t: f64) -> f64 {
        self.volume_at_mark + self.rate * (t - self.t_mark)
    }

    /// Roll the mark forward to `t` and install a new rate.
    pub fn restep(&mut self, t: f64, rate: f64) {
        self.volume_at_mark = self.volume(t);
        self.t_mark = t;
        self.rate = rate;
    }
}

/// One subgrid element: a finer-resolution level derived from the basin level
/// by piecewise-linear lookup at save instants.
#[derive(Debug, Clone)]
pub struct SubgridElement {
    pub subgrid_id: i32,
    pub table: Interpolation,
}

/// A water body with a storage↔level↔area profile, forcing inputs and the
/// cumulative counters used for exact-integration outputs.
#[derive(Debug, Clone)]
pub struct Basin {
    pub node_id: NodeId,
    pub profile: BasinProfile,
    pub forcings: Forcings,
    pub subgrid: Vec<SubgridElement>,
    pub initial_storage: f64,
    /// Storage below which vertical fluxes and abstractions fade out; about
    /// a 10 cm water layer over the bottom area.
    pub low_storage_threshold: f64,

    // Mutable run state, written only from callbacks.
    /// Current constant rates per [`ForcingKind`], refreshed at step changes.
    pub current_rates: [f64; 5],
    /// Exact integral of precipitation + drainage + surface runoff.
    pub exact_inflow: ForcingIntegral,
    /// Cumulative positive-forcing volume, for allocation accounting.
    pub cumulative_forcing_in: f64,
    /// Cumulative potential evaporation + infiltration volume drawn from the
    /// state vector, for allocation accounting.
    pub cumulative_forcing_out: f64,
}

impl Basin {
    pub fn new(node_id: NodeId, profile: BasinProfile, forcings: Forcings, initial_level: f64) -> Self {
        let initial_storage = profile.storage(initial_level);
        let low_storage_threshold = 0.1 * profile.area(profile.bottom_level());
        let mut basin = Self {
            node_id,
            profile,
            forcings,
            subgrid: Vec::new(),
            initial_storage,
            low_storage_threshold,
            current_rates: [0.0; 5],
            exact_inflow: ForcingIntegral::default(),
            cumulative_forcing_in: 0.0,
            cumulative_forcing_out: 0.0,
        };
        basin.apply_forcing_step(0.0);
        basin
    }

    /// Net volumetric rate of the exactly-integrated forcings at the current
    /// rate set: precipitation falls on the full cell area.
    fn exact_rate(&self) -> f64 {
        let precipitation = self.current_rates[0] * self.profile.max_area();
        let drainage = self.current_rates[2];
        let surface_runoff = self.current_rates[4];
        precipitation + drainage + surface_runoff
    }

    /// Re-read all forcing series at `t` and restep the exact integral.
    /// Called from the forcing-change callback only.
    pub fn apply_forcing_step(&mut self, t: f64) {
        for (slot, kind) in ForcingKind::ALL.iter().enumerate() {
            self.current_rates[slot] = self.forcings.get(*kind).value(t);
        }
        let rate = self.exact_rate();
        self.exact_inflow.restep(t, rate);
    }

    /// Volumetric potential evaporation rate at the given storage.
    pub fn potential_evaporation_rate(&self, storage: f64) -> f64 {
        let level = self.profile.level(storage);
        self.current_rates[1] * self.profile.area(level)
    }

    pub fn infiltration_rate(&self) -> f64 {
        self.current_rates[3]
    }

    /// Storage at time `t` given the aggregated cumulative-flow contribution.
    pub fn storage(&self, aggregated: f64, t: f64) -> f64 {
        self.initial_storage + aggregated + self.exact_inflow.volume(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeType;
    use float_cmp::assert_approx_eq;

    fn node() -> NodeId {
        NodeId::new(NodeType::Basin, 1, 0)
    }

    #[test]
    fn profile_round_trip() {
        let profile = BasinProfile::new(node(), vec![0.0, 1.0, 3.0], vec![100.0, 100.0, 300.0]).unwrap();
        for level in [0.0, 0.4, 1.0, 2.2, 3.0] {
            let storage = profile.storage(level);
            assert_approx_eq!(f64, profile.level(storage), level, epsilon = 1e-12);
        }
        // Trapezoid: 1·100 + 2·(100+300)/2 = 500
        assert_approx_eq!(f64, profile.max_storage(), 500.0);
    }

    #[test]
    fn profile_invariants() {
        assert!(matches!(
            BasinProfile::new(node(), vec![0.0, 0.0], vec![100.0, 100.0]),
            Err(ProfileError::NonUniqueLevels { .. })
        ));
        assert!(matches!(
            BasinProfile::new(node(), vec![0.0, 1.0], vec![0.0, 100.0]),
            Err(ProfileError::NonPositiveBottomArea { .. })
        ));
        assert!(matches!(
            BasinProfile::new(node(), vec![0.0, 1.0, 2.0], vec![100.0, 200.0, 150.0]),
            Err(ProfileError::DecreasingTopArea { .. })
        ));
    }

    #[test]
    fn exact_forcing_integral_steps() {
        let mut integral = ForcingIntegral::default();
        integral.restep(0.0, 2.0);
        assert_approx_eq!(f64, integral.volume(10.0), 20.0);
        integral.restep(10.0, 0.5);
        assert_approx_eq!(f64, integral.volume(30.0), 30.0);
    }

    #[test]
    fn evaporation_uses_wetted_area() {
        let profile = BasinProfile::new(node(), vec![0.0, 1.0], vec![100.0, 100.0]).unwrap();
        let mut forcings = Forcings::default();
        forcings.potential_evaporation = Interpolation::constant(1e-6);
        let basin = Basin::new(node(), profile, forcings, 0.5);
        assert_approx_eq!(f64, basin.initial_storage, 50.0);
        assert_approx_eq!(f64, basin.potential_evaporation_rate(50.0), 1e-4);
    }
}
