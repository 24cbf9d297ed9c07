//! Append-only output record streams and their CSV writers.
//!
//! Every stream is a plain `Vec` of rows appended at save instants (or at
//! allocation ticks and control transitions); `write_csv` renders each
//! non-empty stream to `<dir>/<stream>.csv`. Times are seconds since the run
//! origin and are written as ISO timestamps alongside.

use crate::graph::NodeId;
use crate::solver::SolverStats;
use chrono::NaiveDateTime;
use csv::Writer;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecordsError {
    #[error("CSV error with file at `{path}`: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("could not create `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasinStateRecord {
    pub time: f64,
    pub node_id: i32,
    pub storage: f64,
    pub level: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowRecord {
    pub time: f64,
    pub link_id: i32,
    pub from_node: NodeId,
    pub to_node: NodeId,
    pub subnetwork_id: i32,
    /// Mean flow over the save interval ending at `time`.
    pub flow_rate: f64,
    pub hit_lower_bound: bool,
    pub hit_upper_bound: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DemandRecord {
    pub time: f64,
    pub subnetwork_id: i32,
    pub node_type: String,
    pub node_id: i32,
    pub priority: i32,
    pub demand: f64,
    pub allocated: f64,
    /// Mean realized flow (or storage rate) since the previous allocation.
    pub realized: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AllocationFlowRecord {
    pub time: f64,
    pub link_id: i32,
    pub from_node: NodeId,
    pub to_node: NodeId,
    pub subnetwork_id: i32,
    pub flow_rate: f64,
    pub optimization_type: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlRecord {
    pub time: f64,
    pub control_node_id: i32,
    pub truth_state: String,
    pub control_state: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlledFlowRecord {
    pub time: f64,
    pub node_id: i32,
    pub node_type: String,
    pub flow_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubgridLevelRecord {
    pub time: f64,
    pub subgrid_id: i32,
    pub subgrid_level: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolverStatsRecord {
    pub time: f64,
    pub wall_time: f64,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub rhs_calls: usize,
    pub linear_solves: usize,
}

impl SolverStatsRecord {
    /// Per-interval deltas between two cumulative counters.
    pub fn from_delta(time: f64, wall_time: f64, now: &SolverStats, prev: &SolverStats) -> Self {
        Self {
            time,
            wall_time,
            accepted_steps: now.accepted_steps - prev.accepted_steps,
            rejected_steps: now.rejected_steps - prev.rejected_steps,
            rhs_calls: now.rhs_calls - prev.rhs_calls,
            linear_solves: now.linear_solves - prev.linear_solves,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Records {
    pub basin_state: Vec<BasinStateRecord>,
    pub flow: Vec<FlowRecord>,
    pub allocation_demand: Vec<DemandRecord>,
    pub allocation_flow: Vec<AllocationFlowRecord>,
    pub control: Vec<ControlRecord>,
    pub controlled_flow: Vec<ControlledFlowRecord>,
    pub subgrid_level: Vec<SubgridLevelRecord>,
    pub solver_stats: Vec<SolverStatsRecord>,
}

fn timestamp(origin: NaiveDateTime, t: f64) -> String {
    let shifted = origin + chrono::Duration::milliseconds((t * 1000.0).round() as i64);
    shifted.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

fn open_writer(dir: &Path, name: &str) -> Result<(Writer<File>, PathBuf), RecordsError> {
    let path = dir.join(name);
    let writer = Writer::from_path(&path).map_err(|source| RecordsError::Csv {
        path: path.clone(),
        source,
    })?;
    Ok((writer, path))
}

fn write_rows<R, F>(
    dir: &Path,
    name: &str,
    header: &[&str],
    rows: &[R],
    mut to_fields: F,
) -> Result<(), RecordsError>
where
    F: FnMut(&R) -> Vec<String>,
{
    if rows.is_empty() {
        return Ok(());
    }
    let (mut writer, path) = open_writer(dir, name)?;
    let as_csv_err = |source| RecordsError::Csv {
        path: path.clone(),
        source,
    };
    writer.write_record(header).map_err(as_csv_err)?;
    for row in rows {
        writer.write_record(to_fields(row)).map_err(as_csv_err)?;
    }
    writer.flush().map_err(|source| RecordsError::Io {
        path: path.clone(),
        source: source.into(),
    })?;
    Ok(())
}

impl Records {
    /// Write every non-empty stream to CSV files under `dir`.
    pub fn write_csv(&self, dir: &Path, origin: NaiveDateTime) -> Result<(), RecordsError> {
        write_rows(
            dir,
            "basin_state.csv",
            &["time", "node_id", "storage", "level"],
            &self.basin_state,
            |r| {
                vec![
                    timestamp(origin, r.time),
                    r.node_id.to_string(),
                    format!("{:.6}", r.storage),
                    format!("{:.6}", r.level),
                ]
            },
        )?;
        write_rows(
            dir,
            "flow.csv",
            &[
                "time",
                "link_id",
                "from_node_type",
                "from_node_id",
                "to_node_type",
                "to_node_id",
                "subnetwork_id",
                "flow_rate",
                "hit_lower_bound",
                "hit_upper_bound",
            ],
            &self.flow,
            |r| {
                vec![
                    timestamp(origin, r.time),
                    r.link_id.to_string(),
                    r.from_node.node_type.to_string(),
                    r.from_node.ordinal.to_string(),
                    r.to_node.node_type.to_string(),
                    r.to_node.ordinal.to_string(),
                    r.subnetwork_id.to_string(),
                    format!("{:.9}", r.flow_rate),
                    r.hit_lower_bound.to_string(),
                    r.hit_upper_bound.to_string(),
                ]
            },
        )?;
        write_rows(
            dir,
            "allocation_demand.csv",
            &[
                "time",
                "subnetwork_id",
                "node_type",
                "node_id",
                "priority",
                "demand",
                "allocated",
                "realized",
            ],
            &self.allocation_demand,
            |r| {
                vec![
                    timestamp(origin, r.time),
                    r.subnetwork_id.to_string(),
                    r.node_type.clone(),
                    r.node_id.to_string(),
                    r.priority.to_string(),
                    format!("{:.9}", r.demand),
                    format!("{:.9}", r.allocated),
                    format!("{:.9}", r.realized),
                ]
            },
        )?;
        write_rows(
            dir,
            "allocation_flow.csv",
            &[
                "time",
                "link_id",
                "from_node_type",
                "from_node_id",
                "to_node_type",
                "to_node_id",
                "subnetwork_id",
                "flow_rate",
                "optimization_type",
            ],
            &self.allocation_flow,
            |r| {
                vec![
                    timestamp(origin, r.time),
                    r.link_id.to_string(),
                    r.from_node.node_type.to_string(),
                    r.from_node.ordinal.to_string(),
                    r.to_node.node_type.to_string(),
                    r.to_node.ordinal.to_string(),
                    r.subnetwork_id.to_string(),
                    format!("{:.9}", r.flow_rate),
                    r.optimization_type.to_string(),
                ]
            },
        )?;
        write_rows(
            dir,
            "control.csv",
            &["time", "control_node_id", "truth_state", "control_state"],
            &self.control,
            |r| {
                vec![
                    timestamp(origin, r.time),
                    r.control_node_id.to_string(),
                    r.truth_state.clone(),
                    r.control_state.clone(),
                ]
            },
        )?;
        write_rows(
            dir,
            "controlled_flow.csv",
            &["time", "node_id", "node_type", "flow_rate"],
            &self.controlled_flow,
            |r| {
                vec![
                    timestamp(origin, r.time),
                    r.node_id.to_string(),
                    r.node_type.clone(),
                    format!("{:.9}", r.flow_rate),
                ]
            },
        )?;
        write_rows(
            dir,
            "subgrid_level.csv",
            &["time", "subgrid_id", "subgrid_level"],
            &self.subgrid_level,
            |r| {
                vec![
                    timestamp(origin, r.time),
                    r.subgrid_id.to_string(),
                    format!("{:.6}", r.subgrid_level),
                ]
            },
        )?;
        write_rows(
            dir,
            "solver_stats.csv",
            &[
                "time",
                "wall_time",
                "accepted_steps",
                "rejected_steps",
                "rhs_calls",
                "linear_solves",
            ],
            &self.solver_stats,
            |r| {
                vec![
                    timestamp(origin, r.time),
                    format!("{:.6}", r.wall_time),
                    r.accepted_steps.to_string(),
                    r.rejected_steps.to_string(),
                    r.rhs_calls.to_string(),
                    r.linear_solves.to_string(),
                ]
            },
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeType;

    #[test]
    fn writes_only_non_empty_streams() {
        let dir = tempfile::tempdir().unwrap();
        let mut records = Records::default();
        records.basin_state.push(BasinStateRecord {
            time: 3600.0,
            node_id: 1,
            storage: 42.0,
            level: 0.42,
        });
        records.flow.push(FlowRecord {
            time: 3600.0,
            link_id: 7,
            from_node: NodeId::new(NodeType::Basin, 1, 0),
            to_node: NodeId::new(NodeType::Pump, 2, 0),
            subnetwork_id: 0,
            flow_rate: 0.25,
            hit_lower_bound: false,
            hit_upper_bound: true,
        });
        records.write_csv(dir.path(), NaiveDateTime::default()).unwrap();

        assert!(dir.path().join("basin_state.csv").exists());
        assert!(dir.path().join("flow.csv").exists());
        assert!(!dir.path().join("control.csv").exists());

        let contents = std::fs::read_to_string(dir.path().join("flow.csv")).unwrap();
        assert!(contents.contains("Basin"));
        assert!(contents.contains("true"));
    }
}
