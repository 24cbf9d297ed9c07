//! The cumulative ODE state and its aggregation into basin storage.
//!
//! Every state component is a time-integral from model start: one cumulative
//! flow per connector (two for user demands), one cumulative evaporation and
//! infiltration volume per basin, one integral per PID controller. Storages
//! derive as `s₀ + A·u + exact_forcing_integrals(t)` where `A` is a sparse
//! {−1, 0, +1} operator; all physics depend on `u` only through `A·u`.

use crate::graph::{Graph, GraphError, LinkId, NodeId, NodeType};
use sprs::{CsMat, TriMat};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// The fixed ordering of state sub-ranges.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ComponentClass {
    RatingCurve,
    Pump,
    Outlet,
    UserDemandInflow,
    UserDemandOutflow,
    LinearResistance,
    ManningResistance,
    BasinEvaporation,
    BasinInfiltration,
    PidIntegral,
}

impl ComponentClass {
    pub const ALL: [ComponentClass; 10] = [
        Self::RatingCurve,
        Self::Pump,
        Self::Outlet,
        Self::UserDemandInflow,
        Self::UserDemandOutflow,
        Self::LinearResistance,
        Self::ManningResistance,
        Self::BasinEvaporation,
        Self::BasinInfiltration,
        Self::PidIntegral,
    ];

    /// Classes whose components are cumulative flows subject to the
    /// tolerance-tightening schedule (PID integrals are not volumes).
    pub fn is_cumulative_flow(&self) -> bool {
        !matches!(self, Self::PidIntegral)
    }
}

impl Display for ComponentClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RatingCurve => "tabulated_rating_curve",
            Self::Pump => "pump",
            Self::Outlet => "outlet",
            Self::UserDemandInflow => "user_demand_inflow",
            Self::UserDemandOutflow => "user_demand_outflow",
            Self::LinearResistance => "linear_resistance",
            Self::ManningResistance => "manning_resistance",
            Self::BasinEvaporation => "basin_evaporation",
            Self::BasinInfiltration => "basin_infiltration",
            Self::PidIntegral => "pid_integral",
        };
        f.write_str(name)
    }
}

/// Where a connector end draws its level from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaterSource {
    Basin(usize),
    LevelBoundary(usize),
    /// Terminal or junction sink: no level defined, flow simply leaves.
    External,
}

/// Resolved ends of one connector: the unique inflow and outflow link plus
/// the level sources behind them (junction chains already followed).
#[derive(Debug, Copy, Clone)]
pub struct ConnectorEnds {
    pub node_id: NodeId,
    pub inflow_link: LinkId,
    pub outflow_link: LinkId,
    pub up: WaterSource,
    pub dn: WaterSource,
}

#[derive(Error, Debug, PartialEq)]
pub enum StateError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("{node}: junction chain upstream of a connector must resolve to a single basin or level boundary")]
    AmbiguousJunction { node: NodeId },
    #[error("{node}: invalid neighbour {neighbour} on a flow link")]
    InvalidNeighbour { node: NodeId, neighbour: NodeId },
}

/// Named sub-ranges of the state vector, one per component class.
#[derive(Debug, Clone, Default)]
pub struct StateLayout {
    counts: [usize; 10],
    offsets: [usize; 10],
    n_basins: usize,
}

impl StateLayout {
    pub fn new(graph: &Graph) -> Self {
        let counts = [
            graph.num_nodes_of_type(NodeType::TabulatedRatingCurve),
            graph.num_nodes_of_type(NodeType::Pump),
            graph.num_nodes_of_type(NodeType::Outlet),
            graph.num_nodes_of_type(NodeType::UserDemand),
            graph.num_nodes_of_type(NodeType::UserDemand),
            graph.num_nodes_of_type(NodeType::LinearResistance),
            graph.num_nodes_of_type(NodeType::ManningResistance),
            graph.num_nodes_of_type(NodeType::Basin),
            graph.num_nodes_of_type(NodeType::Basin),
            graph.num_nodes_of_type(NodeType::PidControl),
        ];
        let mut offsets = [0usize; 10];
        for i in 1..10 {
            offsets[i] = offsets[i - 1] + counts[i - 1];
        }
        Self {
            counts,
            offsets,
            n_basins: graph.num_nodes_of_type(NodeType::Basin),
        }
    }

    pub fn len(&self) -> usize {
        self.offsets[9] + self.counts[9]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length of the reduced state: one coordinate per basin, then one per
    /// PID integral.
    pub fn reduced_len(&self) -> usize {
        self.n_basins + self.counts[9]
    }

    pub fn n_basins(&self) -> usize {
        self.n_basins
    }

    fn class_slot(class: ComponentClass) -> usize {
        ComponentClass::ALL.iter().position(|c| *c == class).expect("closed set")
    }

    /// Global index of the `i`-th component of a class.
    pub fn index(&self, class: ComponentClass, i: usize) -> usize {
        let slot = Self::class_slot(class);
        debug_assert!(i < self.counts[slot]);
        self.offsets[slot] + i
    }

    pub fn range(&self, class: ComponentClass) -> std::ops::Range<usize> {
        let slot = Self::class_slot(class);
        self.offsets[slot]..self.offsets[slot] + self.counts[slot]
    }

    /// The class and within-class position of a global component index.
    pub fn class_of(&self, index: usize) -> (ComponentClass, usize) {
        for (slot, class) in ComponentClass::ALL.iter().enumerate() {
            if index < self.offsets[slot] + self.counts[slot] {
                return (*class, index - self.offsets[slot]);
            }
        }
        panic!("state index {index} out of range");
    }

    /// Reduced coordinate of a basin.
    pub fn reduced_basin(&self, basin_index: usize) -> usize {
        basin_index
    }

    /// Reduced coordinate of a PID integral.
    pub fn reduced_pid(&self, pid_index: usize) -> usize {
        self.n_basins + pid_index
    }
}

/// Follow a junction chain in the given direction until a non-junction node.
/// Each junction traversed must have exactly one link on the far side.
fn resolve_through_junctions(graph: &Graph, start: NodeId, upstream: bool) -> Result<NodeId, StateError> {
    let mut current = start;
    let mut hops = 0;
    while current.node_type == NodeType::Junction {
        let next: Vec<NodeId> = if upstream {
            graph.inflow_ids(&current).collect()
        } else {
            graph.outflow_ids(&current).collect()
        };
        if next.len() != 1 {
            return Err(StateError::AmbiguousJunction { node: current });
        }
        current = next[0];
        hops += 1;
        if hops > graph.nodes().len() {
            return Err(StateError::AmbiguousJunction { node: current });
        }
    }
    Ok(current)
}

fn water_source(graph: &Graph, connector: NodeId, neighbour: NodeId, upstream: bool) -> Result<WaterSource, StateError> {
    let resolved = resolve_through_junctions(graph, neighbour, upstream)?;
    match resolved.node_type {
        NodeType::Basin => Ok(WaterSource::Basin(resolved.index)),
        NodeType::LevelBoundary => Ok(WaterSource::LevelBoundary(resolved.index)),
        NodeType::Terminal if !upstream => Ok(WaterSource::External),
        // A demand or connector immediately downstream still receives the
        // flow; for level purposes the end is external.
        _ if !upstream => Ok(WaterSource::External),
        _ => Err(StateError::InvalidNeighbour {
            node: connector,
            neighbour: resolved,
        }),
    }
}

/// Resolve the ends of every connector of a class, in dense-index order.
pub fn resolve_connector_ends(graph: &Graph, node_type: NodeType) -> Result<Vec<ConnectorEnds>, StateError> {
    let mut ends: Vec<ConnectorEnds> = graph
        .nodes()
        .iter()
        .filter(|n| n.node_type == node_type)
        .map(|node| {
            let inflow_link = graph.single_inflow(node)?;
            let outflow_link = graph.single_outflow(node)?;
            let up = water_source(graph, *node, graph.link(inflow_link).from, true)?;
            let dn = water_source(graph, *node, graph.link(outflow_link).to, false)?;
            Ok(ConnectorEnds {
                node_id: *node,
                inflow_link,
                outflow_link,
                up,
                dn,
            })
        })
        .collect::<Result<_, StateError>>()?;
    ends.sort_by_key(|e| e.node_id.index);
    Ok(ends)
}

/// Resolved connectivity for every connector class, in state order.
#[derive(Debug, Clone, Default)]
pub struct Connectivity {
    pub rating_curves: Vec<ConnectorEnds>,
    pub pumps: Vec<ConnectorEnds>,
    pub outlets: Vec<ConnectorEnds>,
    pub user_demands: Vec<ConnectorEnds>,
    pub linear_resistances: Vec<ConnectorEnds>,
    pub manning_resistances: Vec<ConnectorEnds>,
}

impl Connectivity {
    pub fn new(graph: &Graph) -> Result<Self, StateError> {
        Ok(Self {
            rating_curves: resolve_connector_ends(graph, NodeType::TabulatedRatingCurve)?,
            pumps: resolve_connector_ends(graph, NodeType::Pump)?,
            outlets: resolve_connector_ends(graph, NodeType::Outlet)?,
            user_demands: resolve_connector_ends(graph, NodeType::UserDemand)?,
            linear_resistances: resolve_connector_ends(graph, NodeType::LinearResistance)?,
            manning_resistances: resolve_connector_ends(graph, NodeType::ManningResistance)?,
        })
    }

    pub fn of_class(&self, class: ComponentClass) -> Option<&[ConnectorEnds]> {
        match class {
            ComponentClass::RatingCurve => Some(&self.rating_curves),
            ComponentClass::Pump => Some(&self.pumps),
            ComponentClass::Outlet => Some(&self.outlets),
            ComponentClass::UserDemandInflow | ComponentClass::UserDemandOutflow => Some(&self.user_demands),
            ComponentClass::LinearResistance => Some(&self.linear_resistances),
            ComponentClass::ManningResistance => Some(&self.manning_resistances),
            _ => None,
        }
    }
}

/// Build the sparse aggregation operator `A` (reduced_len × len).
///
/// Flow components subtract from their upstream basin and add to their
/// downstream basin; a user demand's inflow component only drains its source
/// while the outflow component only feeds the return destination. Evaporation
/// and infiltration subtract from their own basin. PID integrals pass through
/// unchanged so the reduced state carries them.
pub fn aggregation_operator(layout: &StateLayout, connectivity: &Connectivity) -> CsMat<f64> {
    let mut triplets = TriMat::new((layout.reduced_len(), layout.len()));

    let mut add_flow = |column: usize, up: Option<WaterSource>, dn: Option<WaterSource>| {
        if let Some(WaterSource::Basin(b)) = up {
            triplets.add_triplet(layout.reduced_basin(b), column, -1.0);
        }
        if let Some(WaterSource::Basin(b)) = dn {
            triplets.add_triplet(layout.reduced_basin(b), column, 1.0);
        }
    };

    for (i, ends) in connectivity.rating_curves.iter().enumerate() {
        add_flow(layout.index(ComponentClass::RatingCurve, i), Some(ends.up), Some(ends.dn));
    }
    for (i, ends) in connectivity.pumps.iter().enumerate() {
        add_flow(layout.index(ComponentClass::Pump, i), Some(ends.up), Some(ends.dn));
    }
    for (i, ends) in connectivity.outlets.iter().enumerate() {
        add_flow(layout.index(ComponentClass::Outlet, i), Some(ends.up), Some(ends.dn));
    }
    for (i, ends) in connectivity.user_demands.iter().enumerate() {
        add_flow(layout.index(ComponentClass::UserDemandInflow, i), Some(ends.up), None);
        add_flow(layout.index(ComponentClass::UserDemandOutflow, i), None, Some(ends.dn));
    }
    for (i, ends) in connectivity.linear_resistances.iter().enumerate() {
        add_flow(
            layout.index(ComponentClass::LinearResistance, i),
            Some(ends.up),
            Some(ends.dn),
        );
    }
    for (i, ends) in connectivity.manning_resistances.iter().enumerate() {
        add_flow(
            layout.index(ComponentClass::ManningResistance, i),
            Some(ends.up),
            Some(ends.dn),
        );
    }

    for b in 0..layout.n_basins() {
        triplets.add_triplet(layout.reduced_basin(b), layout.index(ComponentClass::BasinEvaporation, b), -1.0);
        triplets.add_triplet(
            layout.reduced_basin(b),
            layout.index(ComponentClass::BasinInfiltration, b),
            -1.0,
        );
    }

    for k in 0..layout.range(ComponentClass::PidIntegral).len() {
        triplets.add_triplet(layout.reduced_pid(k), layout.index(ComponentClass::PidIntegral, k), 1.0);
    }

    triplets.to_csr()
}

/// `out = A·u` without allocating.
pub fn apply_operator(a: &CsMat<f64>, u: &[f64], out: &mut [f64]) {
    debug_assert_eq!(a.rows(), out.len());
    debug_assert_eq!(a.cols(), u.len());
    for (row, vec) in a.outer_iterator().enumerate() {
        let mut sum = 0.0;
        for (col, &value) in vec.iter() {
            sum += value * u[col];
        }
        out[row] = sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::LinkType;
    use float_cmp::assert_approx_eq;

    /// basin1 → resistance → basin2, basin2 → pump → terminal
    fn build_graph() -> Graph {
        let mut graph = Graph::default();
        let b1 = graph.add_node(NodeType::Basin, 1, None, None).unwrap();
        let r = graph.add_node(NodeType::LinearResistance, 2, None, None).unwrap();
        let b2 = graph.add_node(NodeType::Basin, 3, None, None).unwrap();
        let p = graph.add_node(NodeType::Pump, 4, None, None).unwrap();
        let t = graph.add_node(NodeType::Terminal, 5, None, None).unwrap();
        graph.add_link(1, b1, r, LinkType::Flow).unwrap();
        graph.add_link(2, r, b2, LinkType::Flow).unwrap();
        graph.add_link(3, b2, p, LinkType::Flow).unwrap();
        graph.add_link(4, p, t, LinkType::Flow).unwrap();
        graph
    }

    #[test]
    fn layout_ranges_are_contiguous() {
        let graph = build_graph();
        let layout = StateLayout::new(&graph);
        // 1 pump + 1 linear resistance + 2×2 basin verticals = 6 components
        assert_eq!(layout.len(), 6);
        assert_eq!(layout.reduced_len(), 2);
        assert_eq!(layout.range(ComponentClass::Pump), 0..1);
        assert_eq!(layout.range(ComponentClass::LinearResistance), 1..2);
        assert_eq!(layout.range(ComponentClass::BasinEvaporation), 2..4);
        assert_eq!(layout.range(ComponentClass::BasinInfiltration), 4..6);
        assert_eq!(layout.class_of(1), (ComponentClass::LinearResistance, 0));
    }

    #[test]
    fn connectivity_resolves_sources() {
        let graph = build_graph();
        let connectivity = Connectivity::new(&graph).unwrap();
        let resistance = &connectivity.linear_resistances[0];
        assert_eq!(resistance.up, WaterSource::Basin(0));
        assert_eq!(resistance.dn, WaterSource::Basin(1));
        let pump = &connectivity.pumps[0];
        assert_eq!(pump.up, WaterSource::Basin(1));
        assert_eq!(pump.dn, WaterSource::External);
    }

    #[test]
    fn junctions_resolve_transitively() {
        let mut graph = Graph::default();
        let b = graph.add_node(NodeType::Basin, 1, None, None).unwrap();
        let j = graph.add_node(NodeType::Junction, 2, None, None).unwrap();
        let p1 = graph.add_node(NodeType::Pump, 3, None, None).unwrap();
        let p2 = graph.add_node(NodeType::Pump, 4, None, None).unwrap();
        let t = graph.add_node(NodeType::Terminal, 5, None, None).unwrap();
        graph.add_link(1, b, j, LinkType::Flow).unwrap();
        graph.add_link(2, j, p1, LinkType::Flow).unwrap();
        graph.add_link(3, j, p2, LinkType::Flow).unwrap();
        graph.add_link(4, p1, t, LinkType::Flow).unwrap();
        graph.add_link(5, p2, t, LinkType::Flow).unwrap();

        let connectivity = Connectivity::new(&graph).unwrap();
        assert_eq!(connectivity.pumps[0].up, WaterSource::Basin(0));
        assert_eq!(connectivity.pumps[1].up, WaterSource::Basin(0));
    }

    #[test]
    fn aggregation_signs() {
        let graph = build_graph();
        let layout = StateLayout::new(&graph);
        let connectivity = Connectivity::new(&graph).unwrap();
        let a = aggregation_operator(&layout, &connectivity);

        // u = [pump, resistance, evap1, evap2, inf1, inf2]
        let u = vec![2.0, 5.0, 0.5, 0.25, 0.125, 0.0625];
        let mut reduced = vec![0.0; layout.reduced_len()];
        apply_operator(&a, &u, &mut reduced);

        // basin1: −resistance − evap1 − inf1
        assert_approx_eq!(f64, reduced[0], -5.0 - 0.5 - 0.125);
        // basin2: +resistance − pump − evap2 − inf2
        assert_approx_eq!(f64, reduced[1], 5.0 - 2.0 - 0.25 - 0.0625);
    }
}
