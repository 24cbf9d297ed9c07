//! End-to-end scenarios over small hand-built networks.

use float_cmp::assert_approx_eq;
use riverine_core::schema::{
    BasinStateRow, DiscreteControlConditionRow, DiscreteControlLogicRow, FlowBoundaryStaticRow, PumpStaticRow, Schema,
};
use riverine_core::test_utils::{
    basin_pair_schema, box_profile, control_link, default_settings, evaporating_basin_schema, flow_link,
    nested_subnetwork_schema, node_row, two_user_schema, user_demand_schema,
};
use riverine_core::{Model, Settings};

/// A lone basin under constant potential evaporation loses exactly
/// `rate · area · t` while it stays well above the low-storage threshold.
#[test]
fn single_basin_evaporation() {
    let schema = evaporating_basin_schema(1e-6, 0.5);
    let mut model = Model::from_schema(&schema, default_settings(86_400.0)).unwrap();
    model.run().unwrap();

    let storage = model.basin_storage(1).unwrap();
    assert_approx_eq!(f64, storage, 50.0 - 1e-6 * 100.0 * 86_400.0, epsilon = 1e-4);
    assert_approx_eq!(f64, storage, 41.36, epsilon = 1e-4);

    let record = model.records.basin_state.last().unwrap();
    assert_approx_eq!(f64, record.storage, 41.36, epsilon = 1e-4);
}

/// Two identical basins joined by a linear resistance approach a common
/// level; mass is conserved exactly and the saved mean flow matches the
/// transferred volume.
#[test]
fn basin_pair_equilibrates() {
    let schema = basin_pair_schema(1.0, 2.0, 0.0);
    let mut model = Model::from_schema(&schema, default_settings(1e6)).unwrap();
    model.run().unwrap();

    let left = model.basin_level(1).unwrap();
    let right = model.basin_level(3).unwrap();
    assert!((left - right).abs() < 1e-4, "levels {left} and {right} have not converged");
    assert_approx_eq!(f64, left, 1.0, epsilon = 1e-3);

    let total = model.basin_storage(1).unwrap() + model.basin_storage(3).unwrap();
    assert_approx_eq!(f64, total, 200.0, epsilon = 1e-6);

    // 100 m³ crossed the resistance over the run; both of its links carry
    // the same mean (exact flow conservation through the connector).
    let flows: Vec<_> = model.records.flow.iter().filter(|r| r.time == 1e6).collect();
    assert_eq!(flows.len(), 2);
    for flow in flows {
        assert_approx_eq!(f64, flow.flow_rate, 100.0 / 1e6, epsilon = 1e-8);
    }
}

/// A user at 0.1 m³/s with return factor 0.5 looping back to its source
/// basin: allocated 0.1, realized 0.1, return 0.05, depletion 0.05 m³/s.
#[test]
fn user_demand_with_return_flow() {
    let schema = user_demand_schema(0.1, 0.5, 5.0);
    let settings = Settings {
        duration: 7_200.0,
        saveat: 3_600.0,
        allocation_timestep: Some(3_600.0),
        ..Settings::default()
    };
    let mut model = Model::from_schema(&schema, settings).unwrap();
    model.run().unwrap();

    // Basin depletes at (1 − 0.5)·0.1.
    let storage = model.basin_storage(1).unwrap();
    assert_approx_eq!(f64, storage, 500.0 - 0.05 * 7_200.0, epsilon = 1e-3);

    let demand_record = model
        .records
        .allocation_demand
        .iter()
        .find(|r| r.node_id == 2)
        .expect("user demand record");
    assert_eq!(demand_record.priority, 1);
    assert_approx_eq!(f64, demand_record.demand, 0.1, epsilon = 1e-9);
    assert_approx_eq!(f64, demand_record.allocated, 0.1, epsilon = 1e-6);

    let late_records: Vec<_> = model
        .records
        .allocation_demand
        .iter()
        .filter(|r| r.time == 7_200.0)
        .collect();
    assert!(!late_records.is_empty());
    for record in late_records {
        assert_approx_eq!(f64, record.realized, 0.1, epsilon = 1e-4);
    }

    // Abstraction and return links, averaged over the last save interval.
    let inflow = model
        .records
        .flow
        .iter()
        .find(|r| r.time == 7_200.0 && r.link_id == 1)
        .unwrap();
    let return_flow = model
        .records
        .flow
        .iter()
        .find(|r| r.time == 7_200.0 && r.link_id == 2)
        .unwrap();
    assert_approx_eq!(f64, inflow.flow_rate, 0.1, epsilon = 1e-4);
    assert_approx_eq!(f64, return_flow.flow_rate, 0.05, epsilon = 1e-4);
}

/// Goal programming: priority 1 is served in full before priority 2 gets the
/// remainder, and later objectives leave earlier allocations untouched.
#[test]
fn goal_programming_priorities() {
    let schema = two_user_schema(1.5, 1.0, 1.0);
    let settings = Settings {
        duration: 86_400.0,
        saveat: 86_400.0,
        allocation_timestep: Some(86_400.0),
        ..Settings::default()
    };
    let mut model = Model::from_schema(&schema, settings).unwrap();
    model.run().unwrap();

    let allocated = |node_id: i32| {
        model
            .records
            .allocation_demand
            .iter()
            .find(|r| r.node_id == node_id)
            .map(|r| r.allocated)
            .expect("demand record")
    };
    assert_approx_eq!(f64, allocated(3), 1.0, epsilon = 1e-6);
    assert_approx_eq!(f64, allocated(4), 0.5, epsilon = 1e-2);

    // The user nodes' own allocation caches follow the LP.
    assert_approx_eq!(f64, model.nodes.user_demands[0].allocated[0], 1.0, epsilon = 1e-6);
}

/// Nested subnetworks: the collection pass reports the secondary user's
/// demand at the inlet, the primary grants it, and the secondary user
/// receives it.
#[test]
fn nested_subnetwork_demand_collection() {
    let schema = nested_subnetwork_schema(0.2);
    let settings = Settings {
        duration: 7_200.0,
        saveat: 3_600.0,
        allocation_timestep: Some(3_600.0),
        ..Settings::default()
    };
    let mut model = Model::from_schema(&schema, settings).unwrap();
    model.run().unwrap();

    // The primary saw the collected inlet demand of 0.2 on its pump.
    let inlet_record = model
        .records
        .allocation_demand
        .iter()
        .find(|r| r.node_id == 2)
        .expect("inlet demand record");
    assert_approx_eq!(f64, inlet_record.demand, 0.2, epsilon = 1e-6);
    assert_approx_eq!(f64, inlet_record.allocated, 0.2, epsilon = 1e-6);

    // The pump was commanded to the granted flow.
    let commanded = model.nodes.pumps[0].commanded_flow_rate.expect("pump commanded");
    assert_approx_eq!(f64, commanded, 0.2, epsilon = 1e-6);

    // The secondary user received the full demand.
    let user_record = model
        .records
        .allocation_demand
        .iter()
        .find(|r| r.node_id == 4)
        .expect("user demand record");
    assert_approx_eq!(f64, user_record.allocated, 0.2, epsilon = 1e-6);
}

/// Discrete control with hysteresis: rising through the high threshold turns
/// the pump on, the band keeps it on, and only crossing the low threshold
/// downward turns it off again.
#[test]
fn discrete_control_hysteresis() {
    let schema = Schema {
        nodes: vec![
            node_row(1, "FlowBoundary"),
            node_row(2, "Basin"),
            node_row(3, "Pump"),
            node_row(4, "Terminal"),
            node_row(5, "DiscreteControl"),
        ],
        links: vec![
            flow_link(1, 1, 2),
            flow_link(2, 2, 3),
            flow_link(3, 3, 4),
            control_link(4, 5, 3),
        ],
        basin_profile: box_profile(2, 0.0, 2.0, 100.0),
        basin_state: vec![BasinStateRow { node_id: 2, level: 0.5 }],
        flow_boundary_static: vec![FlowBoundaryStaticRow {
            node_id: 1,
            active: None,
            flow_rate: 0.05,
        }],
        pump_static: vec![
            PumpStaticRow {
                node_id: 3,
                control_state: Some("off".to_string()),
                active: None,
                flow_rate: 0.0,
                min_flow_rate: None,
                max_flow_rate: None,
            },
            PumpStaticRow {
                node_id: 3,
                control_state: Some("on".to_string()),
                active: None,
                flow_rate: 1.0,
                min_flow_rate: None,
                max_flow_rate: None,
            },
        ],
        discrete_control_variable: vec![riverine_core::schema::CompoundVariableRow {
            node_id: 5,
            compound_variable_id: 1,
            listen_node_type: "Basin".to_string(),
            listen_node_id: 2,
            variable: "level".to_string(),
            weight: None,
            look_ahead: None,
        }],
        discrete_control_condition: vec![DiscreteControlConditionRow {
            node_id: 5,
            compound_variable_id: 1,
            condition_id: 1,
            time: None,
            threshold_low: 0.8,
            threshold_high: 1.0,
        }],
        discrete_control_logic: vec![
            DiscreteControlLogicRow {
                node_id: 5,
                truth_state: "T".to_string(),
                control_state: "on".to_string(),
            },
            DiscreteControlLogicRow {
                node_id: 5,
                truth_state: "F".to_string(),
                control_state: "off".to_string(),
            },
        ],
        ..Schema::default()
    };

    let settings = Settings {
        duration: 4_000.0,
        saveat: 25.0,
        ..Settings::default()
    };
    let mut model = Model::from_schema(&schema, settings).unwrap();
    model.run().unwrap();

    let control = &model.records.control;
    assert!(
        control.len() >= 3,
        "expected the pump to toggle, got {} transitions",
        control.len()
    );
    // Starting below the low threshold: off.
    assert_eq!(control[0].control_state, "off");
    assert_eq!(control[0].truth_state, "F");
    // First toggle happens on the upward crossing of the high threshold;
    // filling 0.5 m of level at 5e-4 m/s takes about 1000 s.
    assert_eq!(control[1].control_state, "on");
    assert_eq!(control[1].truth_state, "T");
    assert!(control[1].time >= 900.0, "pump switched on too early at {}", control[1].time);
    // States strictly alternate: inside the hysteresis band nothing
    // switches, so there is never on→on or off→off.
    for pair in control.windows(2) {
        assert_ne!(pair[0].control_state, pair[1].control_state);
    }
    // The basin never ran far above the high threshold or dry.
    for record in &model.records.basin_state {
        assert!(record.level < 1.5, "level escaped the control band: {}", record.level);
        assert!(record.level > 0.0);
    }
}

/// Cyclic forcing repeats with its period.
#[test]
fn cyclic_forcing_round_trip() {
    use riverine_core::schema::BasinTimeRow;
    let mut schema = evaporating_basin_schema(0.0, 0.5);
    schema.nodes[0].cyclic_time = Some(true);
    schema.basin_static.clear();
    // One day of precipitation peaking at noon, repeated.
    schema.basin_time = vec![
        BasinTimeRow {
            node_id: 1,
            time: 0.0,
            precipitation: Some(0.0),
            potential_evaporation: None,
            drainage: None,
            infiltration: None,
            surface_runoff: None,
        },
        BasinTimeRow {
            node_id: 1,
            time: 43_200.0,
            precipitation: Some(1e-7),
            potential_evaporation: None,
            drainage: None,
            infiltration: None,
            surface_runoff: None,
        },
        BasinTimeRow {
            node_id: 1,
            time: 86_400.0,
            precipitation: Some(0.0),
            potential_evaporation: None,
            drainage: None,
            infiltration: None,
            surface_runoff: None,
        },
    ];

    let settings = Settings {
        duration: 3.0 * 86_400.0,
        saveat: 86_400.0,
        ..Settings::default()
    };
    let mut model = Model::from_schema(&schema, settings).unwrap();
    model.run().unwrap();

    // Same gain every day: storage increases linearly across the three days.
    let storages: Vec<f64> = model.records.basin_state.iter().map(|r| r.storage).collect();
    assert_eq!(storages.len(), 4);
    let day1 = storages[1] - storages[0];
    let day2 = storages[2] - storages[1];
    let day3 = storages[3] - storages[2];
    assert!(day1 > 0.0);
    assert_approx_eq!(f64, day1, day2, epsilon = 1e-6);
    assert_approx_eq!(f64, day2, day3, epsilon = 1e-6);
}
