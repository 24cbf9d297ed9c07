//! Utilities for unit and integration tests: small hand-built schemas
//! covering the common network shapes.

use crate::schema::{
    BasinProfileRow, BasinStateRow, BasinStaticRow, FlowBoundaryStaticRow, LinearResistanceStaticRow, LinkRow,
    NodeRow, PumpStaticRow, Schema, UserDemandStaticRow,
};
use crate::settings::Settings;

pub fn node_row(node_id: i32, node_type: &str) -> NodeRow {
    NodeRow {
        node_id,
        node_type: node_type.to_string(),
        subnetwork_id: None,
        cyclic_time: None,
        source_priority: None,
    }
}

pub fn subnetwork_node_row(node_id: i32, node_type: &str, subnetwork_id: i32) -> NodeRow {
    NodeRow {
        node_id,
        node_type: node_type.to_string(),
        subnetwork_id: Some(subnetwork_id),
        cyclic_time: None,
        source_priority: None,
    }
}

pub fn flow_link(link_id: i32, from: i32, to: i32) -> LinkRow {
    LinkRow {
        link_id,
        from_node_id: from,
        to_node_id: to,
        link_type: "flow".to_string(),
    }
}

pub fn control_link(link_id: i32, from: i32, to: i32) -> LinkRow {
    LinkRow {
        link_id,
        from_node_id: from,
        to_node_id: to,
        link_type: "control".to_string(),
    }
}

/// A flat-walled basin profile: `area` m² between `bottom` and `top` m.
pub fn box_profile(node_id: i32, bottom: f64, top: f64, area: f64) -> Vec<BasinProfileRow> {
    vec![
        BasinProfileRow {
            node_id,
            level: bottom,
            area,
        },
        BasinProfileRow {
            node_id,
            level: top,
            area,
        },
    ]
}

pub fn default_settings(duration: f64) -> Settings {
    Settings {
        duration,
        saveat: duration,
        ..Settings::default()
    }
}

/// A single basin with potential evaporation and no links.
pub fn evaporating_basin_schema(potential_evaporation: f64, initial_level: f64) -> Schema {
    Schema {
        nodes: vec![node_row(1, "Basin")],
        basin_profile: box_profile(1, 0.0, 1.0, 100.0),
        basin_static: vec![BasinStaticRow {
            node_id: 1,
            precipitation: None,
            potential_evaporation: Some(potential_evaporation),
            drainage: None,
            infiltration: None,
            surface_runoff: None,
        }],
        basin_state: vec![BasinStateRow {
            node_id: 1,
            level: initial_level,
        }],
        ..Schema::default()
    }
}

/// Two identical basins joined by a linear resistance.
pub fn basin_pair_schema(resistance: f64, level_left: f64, level_right: f64) -> Schema {
    Schema {
        nodes: vec![node_row(1, "Basin"), node_row(2, "LinearResistance"), node_row(3, "Basin")],
        links: vec![flow_link(1, 1, 2), flow_link(2, 2, 3)],
        basin_profile: [box_profile(1, 0.0, 10.0, 100.0), box_profile(3, 0.0, 10.0, 100.0)].concat(),
        basin_state: vec![
            BasinStateRow {
                node_id: 1,
                level: level_left,
            },
            BasinStateRow {
                node_id: 3,
                level: level_right,
            },
        ],
        linear_resistance_static: vec![LinearResistanceStaticRow {
            node_id: 2,
            control_state: None,
            active: None,
            resistance,
            max_flow_rate: None,
        }],
        ..Schema::default()
    }
}

/// One basin feeding a user that returns part of the abstraction.
///
/// The return flow loops back to the source basin, so the basin depletes at
/// `(1 − return_factor)·demand`.
pub fn user_demand_schema(demand: f64, return_factor: f64, initial_level: f64) -> Schema {
    Schema {
        nodes: vec![
            subnetwork_node_row(1, "Basin", 1),
            subnetwork_node_row(2, "UserDemand", 1),
        ],
        links: vec![flow_link(1, 1, 2), flow_link(2, 2, 1)],
        basin_profile: box_profile(1, 0.0, 10.0, 100.0),
        basin_state: vec![BasinStateRow {
            node_id: 1,
            level: initial_level,
        }],
        user_demand_static: vec![UserDemandStaticRow {
            node_id: 2,
            active: None,
            demand,
            return_factor,
            min_level: 0.0,
            demand_priority: 1,
        }],
        ..Schema::default()
    }
}

/// Boundary inflow into a nearly-empty basin shared by two users with
/// different priorities; the users discharge to terminals.
pub fn two_user_schema(inflow: f64, demand_a: f64, demand_b: f64) -> Schema {
    Schema {
        nodes: vec![
            subnetwork_node_row(1, "FlowBoundary", 1),
            subnetwork_node_row(2, "Basin", 1),
            subnetwork_node_row(3, "UserDemand", 1),
            subnetwork_node_row(4, "UserDemand", 1),
            subnetwork_node_row(5, "Terminal", 1),
        ],
        links: vec![
            flow_link(1, 1, 2),
            flow_link(2, 2, 3),
            flow_link(3, 2, 4),
            flow_link(4, 3, 5),
            flow_link(5, 4, 5),
        ],
        basin_profile: box_profile(2, 0.0, 10.0, 100.0),
        basin_state: vec![BasinStateRow { node_id: 2, level: 0.0 }],
        flow_boundary_static: vec![FlowBoundaryStaticRow {
            node_id: 1,
            active: None,
            flow_rate: inflow,
        }],
        user_demand_static: vec![
            UserDemandStaticRow {
                node_id: 3,
                active: None,
                demand: demand_a,
                return_factor: 0.0,
                min_level: -10.0,
                demand_priority: 1,
            },
            UserDemandStaticRow {
                node_id: 4,
                active: None,
                demand: demand_b,
                return_factor: 0.0,
                min_level: -10.0,
                demand_priority: 2,
            },
        ],
        ..Schema::default()
    }
}

/// Primary basin supplying a secondary subnetwork through a pump; the
/// secondary holds one user.
pub fn nested_subnetwork_schema(user_demand: f64) -> Schema {
    Schema {
        nodes: vec![
            subnetwork_node_row(1, "Basin", 1),
            subnetwork_node_row(2, "Pump", 1),
            subnetwork_node_row(3, "Basin", 2),
            subnetwork_node_row(4, "UserDemand", 2),
            subnetwork_node_row(5, "Terminal", 2),
        ],
        links: vec![
            flow_link(1, 1, 2),
            flow_link(2, 2, 3),
            flow_link(3, 3, 4),
            flow_link(4, 4, 5),
        ],
        basin_profile: [box_profile(1, 0.0, 10.0, 1000.0), box_profile(3, 0.0, 10.0, 100.0)].concat(),
        basin_state: vec![
            BasinStateRow { node_id: 1, level: 5.0 },
            // The secondary basin starts empty so its user depends entirely
            // on the inter-subnetwork inlet.
            BasinStateRow { node_id: 3, level: 0.0 },
        ],
        pump_static: vec![PumpStaticRow {
            node_id: 2,
            control_state: None,
            active: None,
            flow_rate: 0.0,
            min_flow_rate: None,
            max_flow_rate: Some(10.0),
        }],
        user_demand_static: vec![UserDemandStaticRow {
            node_id: 4,
            active: None,
            demand: user_demand,
            return_factor: 0.0,
            min_level: -10.0,
            demand_priority: 1,
        }],
        ..Schema::default()
    }
}
