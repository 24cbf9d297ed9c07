//! In-memory input schema.
//!
//! Upstream readers (SQL tables or columnar files) produce these plain rows;
//! the simulator consumes them through [`crate::model::Model::from_schema`].
//! Times are seconds since the run origin. Within one node a time column must
//! be strictly increasing unless the node is marked `cyclic_time`, in which
//! case the first and last rows must agree in values.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRow {
    pub node_id: i32,
    pub node_type: String,
    #[serde(default)]
    pub subnetwork_id: Option<i32>,
    #[serde(default)]
    pub cyclic_time: Option<bool>,
    #[serde(default)]
    pub source_priority: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRow {
    pub link_id: i32,
    pub from_node_id: i32,
    pub to_node_id: i32,
    pub link_type: String,
}

/// One `(level, area)` breakpoint of a basin profile. Storage breakpoints are
/// derived by trapezoidal integration of area over level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasinProfileRow {
    pub node_id: i32,
    pub level: f64,
    pub area: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasinStaticRow {
    pub node_id: i32,
    #[serde(default)]
    pub precipitation: Option<f64>,
    #[serde(default)]
    pub potential_evaporation: Option<f64>,
    #[serde(default)]
    pub drainage: Option<f64>,
    #[serde(default)]
    pub infiltration: Option<f64>,
    #[serde(default)]
    pub surface_runoff: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasinTimeRow {
    pub node_id: i32,
    pub time: f64,
    #[serde(default)]
    pub precipitation: Option<f64>,
    #[serde(default)]
    pub potential_evaporation: Option<f64>,
    #[serde(default)]
    pub drainage: Option<f64>,
    #[serde(default)]
    pub infiltration: Option<f64>,
    #[serde(default)]
    pub surface_runoff: Option<f64>,
}

/// Initial condition: basin level at `t = 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasinStateRow {
    pub node_id: i32,
    pub level: f64,
}

/// Piecewise-linear lookup from a basin level to a subgrid element level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasinSubgridRow {
    pub subgrid_id: i32,
    pub node_id: i32,
    pub basin_level: f64,
    pub subgrid_level: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearResistanceStaticRow {
    pub node_id: i32,
    #[serde(default)]
    pub control_state: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    pub resistance: f64,
    #[serde(default)]
    pub max_flow_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManningResistanceStaticRow {
    pub node_id: i32,
    #[serde(default)]
    pub control_state: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    pub length: f64,
    pub manning_n: f64,
    pub profile_width: f64,
    pub profile_slope: f64,
}

/// One `(level, flow_rate)` breakpoint of a rating curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabulatedRatingCurveStaticRow {
    pub node_id: i32,
    #[serde(default)]
    pub control_state: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    pub level: f64,
    pub flow_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabulatedRatingCurveTimeRow {
    pub node_id: i32,
    pub time: f64,
    pub level: f64,
    pub flow_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpStaticRow {
    pub node_id: i32,
    #[serde(default)]
    pub control_state: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    pub flow_rate: f64,
    #[serde(default)]
    pub min_flow_rate: Option<f64>,
    #[serde(default)]
    pub max_flow_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpTimeRow {
    pub node_id: i32,
    pub time: f64,
    pub flow_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutletStaticRow {
    pub node_id: i32,
    #[serde(default)]
    pub control_state: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    pub flow_rate: f64,
    #[serde(default)]
    pub min_flow_rate: Option<f64>,
    #[serde(default)]
    pub max_flow_rate: Option<f64>,
    /// Crest level; flow fades out as the upstream level drops to it.
    #[serde(default)]
    pub min_upstream_level: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutletTimeRow {
    pub node_id: i32,
    pub time: f64,
    pub flow_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelBoundaryStaticRow {
    pub node_id: i32,
    #[serde(default)]
    pub active: Option<bool>,
    pub level: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelBoundaryTimeRow {
    pub node_id: i32,
    pub time: f64,
    pub level: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowBoundaryStaticRow {
    pub node_id: i32,
    #[serde(default)]
    pub active: Option<bool>,
    pub flow_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowBoundaryTimeRow {
    pub node_id: i32,
    pub time: f64,
    pub flow_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDemandStaticRow {
    pub node_id: i32,
    #[serde(default)]
    pub active: Option<bool>,
    pub demand: f64,
    pub return_factor: f64,
    pub min_level: f64,
    pub demand_priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDemandTimeRow {
    pub node_id: i32,
    pub time: f64,
    pub demand: f64,
    pub return_factor: f64,
    pub min_level: f64,
    pub demand_priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDemandStaticRow {
    pub node_id: i32,
    pub demand: f64,
    pub demand_priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDemandTimeRow {
    pub node_id: i32,
    pub time: f64,
    pub demand: f64,
    pub demand_priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelDemandStaticRow {
    pub node_id: i32,
    #[serde(default)]
    pub min_level: Option<f64>,
    #[serde(default)]
    pub max_level: Option<f64>,
    pub demand_priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelDemandTimeRow {
    pub node_id: i32,
    pub time: f64,
    #[serde(default)]
    pub min_level: Option<f64>,
    #[serde(default)]
    pub max_level: Option<f64>,
    pub demand_priority: i32,
}

/// One weighted subvariable of a compound variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompoundVariableRow {
    pub node_id: i32,
    pub compound_variable_id: i32,
    pub listen_node_type: String,
    pub listen_node_id: i32,
    /// Observed quantity: `level`, `storage` or `flow_rate`.
    pub variable: String,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub look_ahead: Option<f64>,
}

/// Hysteresis thresholds of one condition; time-varying rows share a
/// `condition_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscreteControlConditionRow {
    pub node_id: i32,
    pub compound_variable_id: i32,
    #[serde(default)]
    pub condition_id: i32,
    #[serde(default)]
    pub time: Option<f64>,
    pub threshold_low: f64,
    pub threshold_high: f64,
}

/// Maps the concatenated truth state (e.g. `"TFF"`) to a control state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscreteControlLogicRow {
    pub node_id: i32,
    pub truth_state: String,
    pub control_state: String,
}

/// One `(input, output)` breakpoint of a continuous control function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuousControlFunctionRow {
    pub node_id: i32,
    pub input: f64,
    pub output: f64,
    /// Parameter of the controlled node receiving the output, e.g. `flow_rate`.
    pub controlled_variable: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidControlStaticRow {
    pub node_id: i32,
    #[serde(default)]
    pub control_state: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    pub listen_node_type: String,
    pub listen_node_id: i32,
    pub target: f64,
    pub proportional: f64,
    pub integral: f64,
    pub derivative: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidControlTimeRow {
    pub node_id: i32,
    pub time: f64,
    pub target: f64,
    pub proportional: f64,
    pub integral: f64,
    pub derivative: f64,
}

/// The complete in-memory input: every table of §6, possibly empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    pub nodes: Vec<NodeRow>,
    pub links: Vec<LinkRow>,

    #[serde(default)]
    pub basin_profile: Vec<BasinProfileRow>,
    #[serde(default)]
    pub basin_static: Vec<BasinStaticRow>,
    #[serde(default)]
    pub basin_time: Vec<BasinTimeRow>,
    #[serde(default)]
    pub basin_state: Vec<BasinStateRow>,
    #[serde(default)]
    pub basin_subgrid: Vec<BasinSubgridRow>,

    #[serde(default)]
    pub linear_resistance_static: Vec<LinearResistanceStaticRow>,
    #[serde(default)]
    pub manning_resistance_static: Vec<ManningResistanceStaticRow>,
    #[serde(default)]
    pub tabulated_rating_curve_static: Vec<TabulatedRatingCurveStaticRow>,
    #[serde(default)]
    pub tabulated_rating_curve_time: Vec<TabulatedRatingCurveTimeRow>,

    #[serde(default)]
    pub pump_static: Vec<PumpStaticRow>,
    #[serde(default)]
    pub pump_time: Vec<PumpTimeRow>,
    #[serde(default)]
    pub outlet_static: Vec<OutletStaticRow>,
    #[serde(default)]
    pub outlet_time: Vec<OutletTimeRow>,

    #[serde(default)]
    pub level_boundary_static: Vec<LevelBoundaryStaticRow>,
    #[serde(default)]
    pub level_boundary_time: Vec<LevelBoundaryTimeRow>,
    #[serde(default)]
    pub flow_boundary_static: Vec<FlowBoundaryStaticRow>,
    #[serde(default)]
    pub flow_boundary_time: Vec<FlowBoundaryTimeRow>,

    #[serde(default)]
    pub user_demand_static: Vec<UserDemandStaticRow>,
    #[serde(default)]
    pub user_demand_time: Vec<UserDemandTimeRow>,
    #[serde(default)]
    pub flow_demand_static: Vec<FlowDemandStaticRow>,
    #[serde(default)]
    pub flow_demand_time: Vec<FlowDemandTimeRow>,
    #[serde(default)]
    pub level_demand_static: Vec<LevelDemandStaticRow>,
    #[serde(default)]
    pub level_demand_time: Vec<LevelDemandTimeRow>,

    #[serde(default)]
    pub discrete_control_variable: Vec<CompoundVariableRow>,
    #[serde(default)]
    pub discrete_control_condition: Vec<DiscreteControlConditionRow>,
    #[serde(default)]
    pub discrete_control_logic: Vec<DiscreteControlLogicRow>,
    #[serde(default)]
    pub continuous_control_variable: Vec<CompoundVariableRow>,
    #[serde(default)]
    pub continuous_control_function: Vec<ContinuousControlFunctionRow>,
    #[serde(default)]
    pub pid_control_static: Vec<PidControlStaticRow>,
    #[serde(default)]
    pub pid_control_time: Vec<PidControlTimeRow>,
}
