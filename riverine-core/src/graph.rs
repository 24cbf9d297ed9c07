use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display, Formatter};
use std::ops::Deref;
use std::str::FromStr;
use thiserror::Error;

/// The closed set of node types understood by the simulator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeType {
    Basin,
    LevelBoundary,
    FlowBoundary,
    LinearResistance,
    ManningResistance,
    TabulatedRatingCurve,
    Pump,
    Outlet,
    Terminal,
    Junction,
    UserDemand,
    FlowDemand,
    LevelDemand,
    DiscreteControl,
    ContinuousControl,
    PidControl,
}

impl NodeType {
    /// Node types that move water along a unique inflow/outflow link pair.
    pub fn is_connector(&self) -> bool {
        matches!(
            self,
            Self::Pump
                | Self::Outlet
                | Self::LinearResistance
                | Self::ManningResistance
                | Self::TabulatedRatingCurve
                | Self::UserDemand
        )
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Self::DiscreteControl | Self::ContinuousControl | Self::PidControl)
    }
}

impl Display for NodeType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Basin => "Basin",
            Self::LevelBoundary => "LevelBoundary",
            Self::FlowBoundary => "FlowBoundary",
            Self::LinearResistance => "LinearResistance",
            Self::ManningResistance => "ManningResistance",
            Self::TabulatedRatingCurve => "TabulatedRatingCurve",
            Self::Pump => "Pump",
            Self::Outlet => "Outlet",
            Self::Terminal => "Terminal",
            Self::Junction => "Junction",
            Self::UserDemand => "UserDemand",
            Self::FlowDemand => "FlowDemand",
            Self::LevelDemand => "LevelDemand",
            Self::DiscreteControl => "DiscreteControl",
            Self::ContinuousControl => "ContinuousControl",
            Self::PidControl => "PidControl",
        };
        f.write_str(name)
    }
}

impl FromStr for NodeType {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Basin" => Ok(Self::Basin),
            "LevelBoundary" => Ok(Self::LevelBoundary),
            "FlowBoundary" => Ok(Self::FlowBoundary),
            "LinearResistance" => Ok(Self::LinearResistance),
            "ManningResistance" => Ok(Self::ManningResistance),
            "TabulatedRatingCurve" => Ok(Self::TabulatedRatingCurve),
            "Pump" => Ok(Self::Pump),
            "Outlet" => Ok(Self::Outlet),
            "Terminal" => Ok(Self::Terminal),
            "Junction" => Ok(Self::Junction),
            "UserDemand" => Ok(Self::UserDemand),
            "FlowDemand" => Ok(Self::FlowDemand),
            "LevelDemand" => Ok(Self::LevelDemand),
            "DiscreteControl" => Ok(Self::DiscreteControl),
            "ContinuousControl" => Ok(Self::ContinuousControl),
            "PidControl" => Ok(Self::PidControl),
            other => Err(GraphError::UnknownNodeType(other.to_string())),
        }
    }
}

/// Identity of a node: its type, the user-facing ordinal and the dense
/// position within the per-type array. Equality and ordering are by
/// `(node_type, ordinal)` only; `index` is derived bookkeeping.
#[derive(Debug, Copy, Clone)]
pub struct NodeId {
    pub node_type: NodeType,
    pub ordinal: i32,
    pub index: usize,
}

impl NodeId {
    pub fn new(node_type: NodeType, ordinal: i32, index: usize) -> Self {
        Self {
            node_type,
            ordinal,
            index,
        }
    }
}

impl PartialEq for NodeId {
    fn eq(&self, other: &Self) -> bool {
        self.node_type == other.node_type && self.ordinal == other.ordinal
    }
}

impl Eq for NodeId {}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.node_type, self.ordinal).cmp(&(other.node_type, other.ordinal))
    }
}

impl std::hash::Hash for NodeId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (self.node_type, self.ordinal).hash(state);
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.node_type, self.ordinal)
    }
}

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Debug, Hash)]
pub struct LinkId(pub(crate) usize);

impl Deref for LinkId {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for LinkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkType {
    /// Carries water.
    Flow,
    /// Carries a parameter override or listen relationship.
    Control,
}

#[derive(Debug, Clone)]
pub struct Link {
    pub id: LinkId,
    /// The user-facing link id from the input schema.
    pub external_id: i32,
    pub from: NodeId,
    pub to: NodeId,
    pub link_type: LinkType,
    /// Subnetwork id of the source node at build time.
    pub subnetwork_id_source: i32,
}

#[derive(Error, Debug, PartialEq)]
pub enum GraphError {
    #[error("unknown node type `{0}`")]
    UnknownNodeType(String),
    #[error("node {0} #{1} not found")]
    NodeNotFound(NodeType, i32),
    #[error("node {0} already exists")]
    DuplicateNode(NodeId),
    #[error("link #{0} references missing node {1} #{2}")]
    LinkEndpointNotFound(i32, NodeType, i32),
    #[error("{node} requires exactly one {direction} flow link, found {found}")]
    NotExactlyOneFlowLink {
        node: NodeId,
        direction: &'static str,
        found: usize,
    },
}

#[derive(Debug, Clone, Default)]
struct Adjacency {
    inflow: Vec<LinkId>,
    outflow: Vec<LinkId>,
    control_in: Vec<LinkId>,
    control_out: Vec<LinkId>,
}

/// Directed multigraph over [`NodeId`] with per-node metadata and
/// subnetwork indices. Nodes and links are stored in arrays; all
/// cross-references are integer indices.
#[derive(Debug, Default, Clone)]
pub struct Graph {
    nodes: Vec<NodeId>,
    subnetwork_ids: Vec<Option<i32>>,
    source_priorities: Vec<Option<i32>>,
    links: Vec<Link>,
    adjacency: Vec<Adjacency>,
    positions: HashMap<(NodeType, i32), usize>,
    counts_by_type: HashMap<NodeType, usize>,
    node_ids_by_subnetwork: BTreeMap<i32, Vec<NodeId>>,
}

impl Graph {
    pub fn add_node(
        &mut self,
        node_type: NodeType,
        ordinal: i32,
        subnetwork_id: Option<i32>,
        source_priority: Option<i32>,
    ) -> Result<NodeId, GraphError> {
        let type_index = *self.counts_by_type.get(&node_type).unwrap_or(&0);
        let id = NodeId::new(node_type, ordinal, type_index);
        if self.positions.contains_key(&(node_type, ordinal)) {
            return Err(GraphError::DuplicateNode(id));
        }
        self.positions.insert((node_type, ordinal), self.nodes.len());
        self.counts_by_type.insert(node_type, type_index + 1);
        self.nodes.push(id);
        self.subnetwork_ids.push(subnetwork_id);
        self.source_priorities.push(source_priority);
        self.adjacency.push(Adjacency::default());
        if let Some(subnetwork_id) = subnetwork_id {
            self.node_ids_by_subnetwork.entry(subnetwork_id).or_default().push(id);
        }
        Ok(id)
    }

    pub fn add_link(
        &mut self,
        external_id: i32,
        from: NodeId,
        to: NodeId,
        link_type: LinkType,
    ) -> Result<LinkId, GraphError> {
        let from_pos = self.position(&from)?;
        let to_pos = self.position(&to)?;
        let id = LinkId(self.links.len());
        let link = Link {
            id,
            external_id,
            from,
            to,
            link_type,
            subnetwork_id_source: self.subnetwork_ids[from_pos].unwrap_or(0),
        };
        match link_type {
            LinkType::Flow => {
                self.adjacency[from_pos].outflow.push(id);
                self.adjacency[to_pos].inflow.push(id);
            }
            LinkType::Control => {
                self.adjacency[from_pos].control_out.push(id);
                self.adjacency[to_pos].control_in.push(id);
            }
        }
        self.links.push(link);
        Ok(id)
    }

    fn position(&self, node: &NodeId) -> Result<usize, GraphError> {
        self.positions
            .get(&(node.node_type, node.ordinal))
            .copied()
            .ok_or(GraphError::NodeNotFound(node.node_type, node.ordinal))
    }

    pub fn node(&self, node_type: NodeType, ordinal: i32) -> Result<NodeId, GraphError> {
        self.positions
            .get(&(node_type, ordinal))
            .map(|&pos| self.nodes[pos])
            .ok_or(GraphError::NodeNotFound(node_type, ordinal))
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn link(&self, id: LinkId) -> &Link {
        &self.links[id.0]
    }

    pub fn num_nodes_of_type(&self, node_type: NodeType) -> usize {
        *self.counts_by_type.get(&node_type).unwrap_or(&0)
    }

    pub fn subnetwork_id(&self, node: &NodeId) -> Option<i32> {
        self.position(node).ok().and_then(|pos| self.subnetwork_ids[pos])
    }

    pub fn source_priority(&self, node: &NodeId) -> Option<i32> {
        self.position(node).ok().and_then(|pos| self.source_priorities[pos])
    }

    /// Subnetwork ids in ascending order. Id 1 is the primary subnetwork.
    pub fn subnetwork_ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.node_ids_by_subnetwork.keys().copied()
    }

    pub fn nodes_in_subnetwork(&self, subnetwork_id: i32) -> &[NodeId] {
        self.node_ids_by_subnetwork
            .get(&subnetwork_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn inflow_links(&self, node: &NodeId) -> &[LinkId] {
        match self.position(node) {
            Ok(pos) => &self.adjacency[pos].inflow,
            Err(_) => &[],
        }
    }

    pub fn outflow_links(&self, node: &NodeId) -> &[LinkId] {
        match self.position(node) {
            Ok(pos) => &self.adjacency[pos].outflow,
            Err(_) => &[],
        }
    }

    pub fn control_in_links(&self, node: &NodeId) -> &[LinkId] {
        match self.position(node) {
            Ok(pos) => &self.adjacency[pos].control_in,
            Err(_) => &[],
        }
    }

    pub fn control_out_links(&self, node: &NodeId) -> &[LinkId] {
        match self.position(node) {
            Ok(pos) => &self.adjacency[pos].control_out,
            Err(_) => &[],
        }
    }

    pub fn inflow_ids(&self, node: &NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.inflow_links(node).iter().map(|l| self.links[l.0].from)
    }

    pub fn outflow_ids(&self, node: &NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.outflow_links(node).iter().map(|l| self.links[l.0].to)
    }

    /// The unique inflow link of a connector node.
    pub fn single_inflow(&self, node: &NodeId) -> Result<LinkId, GraphError> {
        let links = self.inflow_links(node);
        if links.len() == 1 {
            Ok(links[0])
        } else {
            Err(GraphError::NotExactlyOneFlowLink {
                node: *node,
                direction: "incoming",
                found: links.len(),
            })
        }
    }

    /// The unique outflow link of a connector node.
    pub fn single_outflow(&self, node: &NodeId) -> Result<LinkId, GraphError> {
        let links = self.outflow_links(node);
        if links.len() == 1 {
            Ok(links[0])
        } else {
            Err(GraphError::NotExactlyOneFlowLink {
                node: *node,
                direction: "outgoing",
                found: links.len(),
            })
        }
    }

    /// Flow links whose endpoints both belong to `subnetwork_id`, plus links
    /// entering the subnetwork from a primary-network source.
    pub fn flow_links_in_subnetwork(&self, subnetwork_id: i32) -> Vec<LinkId> {
        self.links
            .iter()
            .filter(|l| l.link_type == LinkType::Flow)
            .filter(|l| {
                let to_subnet = self.subnetwork_id(&l.to);
                to_subnet == Some(subnetwork_id)
                    || (self.subnetwork_id(&l.from) == Some(subnetwork_id) && to_subnet.is_none())
            })
            .map(|l| l.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_basin_graph() -> (Graph, NodeId, NodeId, NodeId) {
        let mut graph = Graph::default();
        let left = graph.add_node(NodeType::Basin, 1, Some(1), None).unwrap();
        let resistance = graph.add_node(NodeType::LinearResistance, 2, Some(1), None).unwrap();
        let right = graph.add_node(NodeType::Basin, 3, Some(1), None).unwrap();
        graph.add_link(1, left, resistance, LinkType::Flow).unwrap();
        graph.add_link(2, resistance, right, LinkType::Flow).unwrap();
        (graph, left, resistance, right)
    }

    #[test]
    fn node_identity_is_type_and_ordinal() {
        let a = NodeId::new(NodeType::Basin, 5, 0);
        let b = NodeId::new(NodeType::Basin, 5, 3);
        let c = NodeId::new(NodeType::Pump, 5, 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(format!("{a}"), "Basin #5");
    }

    #[test]
    fn dense_per_type_indices() {
        let (graph, left, _, right) = two_basin_graph();
        assert_eq!(left.index, 0);
        assert_eq!(right.index, 1);
        assert_eq!(graph.num_nodes_of_type(NodeType::Basin), 2);
        assert_eq!(graph.num_nodes_of_type(NodeType::LinearResistance), 1);
    }

    #[test]
    fn duplicate_nodes_are_rejected() {
        let mut graph = Graph::default();
        graph.add_node(NodeType::Basin, 1, None, None).unwrap();
        assert!(matches!(
            graph.add_node(NodeType::Basin, 1, None, None),
            Err(GraphError::DuplicateNode(_))
        ));
    }

    #[test]
    fn connector_adjacency() {
        let (graph, left, resistance, right) = two_basin_graph();
        assert_eq!(graph.single_inflow(&resistance).unwrap(), LinkId(0));
        assert_eq!(graph.single_outflow(&resistance).unwrap(), LinkId(1));
        assert_eq!(graph.inflow_ids(&resistance).next().unwrap(), left);
        assert_eq!(graph.outflow_ids(&resistance).next().unwrap(), right);
        assert!(graph.single_inflow(&left).is_err());
    }

    #[test]
    fn subnetwork_index_is_ordered() {
        let mut graph = Graph::default();
        graph.add_node(NodeType::Basin, 1, Some(3), None).unwrap();
        graph.add_node(NodeType::Basin, 2, Some(1), None).unwrap();
        graph.add_node(NodeType::Basin, 3, Some(1), None).unwrap();
        let ids: Vec<i32> = graph.subnetwork_ids().collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(graph.nodes_in_subnetwork(1).len(), 2);
    }
}
