use chrono::NaiveDateTime;

/// All user-exposed knobs of a run.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Wall-clock origin of the run; model time is seconds since this point.
    pub start: NaiveDateTime,
    /// Run duration in seconds.
    pub duration: f64,
    /// Interval between saved outputs, in seconds.
    pub saveat: f64,

    pub abstol: f64,
    pub reltol: f64,
    pub water_balance_abstol: f64,
    pub water_balance_reltol: f64,
    /// Upper bound on integrator steps (accepted plus rejected).
    pub maxiters: usize,

    /// Interval of the allocation clock, in seconds. `None` disables the
    /// optimizer; demand nodes then follow raw demand.
    pub allocation_timestep: Option<f64>,
    /// Override of the per-basin low-storage threshold. The default is the
    /// volume of a 10 cm layer over the basin's bottom area.
    pub low_storage_threshold: Option<f64>,
    /// Update the reduced Jacobian columns in parallel. Off by default: the
    /// first call allocates the sparse storage, which must happen serially.
    pub parallel_jacobian: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            start: NaiveDateTime::default(),
            duration: 86_400.0,
            saveat: 86_400.0,
            abstol: 1e-7,
            reltol: 1e-7,
            water_balance_abstol: 1e-3,
            water_balance_reltol: 1e-2,
            maxiters: 1_000_000_000,
            allocation_timestep: None,
            low_storage_threshold: None,
            parallel_jacobian: false,
        }
    }
}
