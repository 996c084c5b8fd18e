//! Repeated sweeps of one chip reconciled into a single series.

use chip_daq::config::AcquisitionConfig;
use chip_daq::data::{reconcile, MeasurementStore, MemoryStore};
use chip_daq::instrument::{InstrumentSession, MockChannel};
use chip_daq::measurement::iv::{FixedSensor, IvAcquisition, ChipRequest};
use chip_daq::measurement::{RunMode, ScriptedOperator};

const SINGLE_CHIP: &str = r#"
[instrument]
id = 1
name = "SMU"
resource = "MOCK::26::INSTR"
commands = [
    { command = "print(v)", type = "query_ascii_values", name = "voltage_input" },
    { command = "print(i)", type = "query_ascii_values", name = "anode_current" },
]

[[measurements]]
name = "sweep"

[[chips]]
voltage_input = ""
anode_current = ""
"#;

async fn sweep(config: &AcquisitionConfig, mock: &MockChannel, store: &mut MemoryStore, v: &str, i: &str) {
    mock.on_query("print(v)", v);
    mock.on_query("print(i)", i);
    let mut session = InstrumentSession::new("SMU", Box::new(mock.clone()));
    let operator = ScriptedOperator::default();
    let request = ChipRequest {
        chip_names: vec!["A0101".to_string()],
        wafer: "AC0001".to_string(),
        chip_state_id: 1,
    };
    IvAcquisition::new(config, RunMode::Automatic, &operator)
        .run(&mut session, &mut FixedSensor(25.0), store, &request)
        .await
        .unwrap();
}

fn voltages(store: &MemoryStore) -> Vec<(String, f64)> {
    reconcile(store.all_conditions())
        .iter()
        .map(|row| (row.measurement.voltage_input.to_string(), row.measurement.anode_current))
        .collect()
}

#[tokio::test]
async fn test_narrow_resweep_replaces_overlapping_points() {
    let config = AcquisitionConfig::from_toml_str(SINGLE_CHIP).unwrap();
    let mock = MockChannel::new("MOCK::26::INSTR");
    let mut store = MemoryStore::new();

    sweep(&config, &mock, &mut store, "-0.2 -0.1 0 0.1 0.2", "-2 -1 0 1 2").await;
    sweep(&config, &mock, &mut store, "-0.1 0 0.1", "-10 0.5 10").await;

    assert_eq!(store.all_conditions().len(), 2);
    assert_eq!(
        voltages(&store),
        vec![
            ("-0.20000".to_string(), -2.0),
            ("-0.10000".to_string(), -10.0),
            ("0.00000".to_string(), 0.5),
            ("0.10000".to_string(), 10.0),
            ("0.20000".to_string(), 2.0),
        ]
    );
}

#[tokio::test]
async fn test_single_point_resweep_updates_one_voltage() {
    let config = AcquisitionConfig::from_toml_str(SINGLE_CHIP).unwrap();
    let mock = MockChannel::new("MOCK::26::INSTR");
    let mut store = MemoryStore::new();

    sweep(&config, &mock, &mut store, "-0.1 0 0.1", "-1 0 1").await;
    sweep(&config, &mock, &mut store, "0", "7").await;

    let reconciled = voltages(&store);
    assert_eq!(reconciled.len(), 3);
    assert_eq!(reconciled[0], ("-0.10000".to_string(), -1.0));
    assert_eq!(reconciled[1], ("0.00000".to_string(), 7.0));
}

#[cfg(feature = "storage_csv")]
#[tokio::test]
async fn test_export_reconciled_series() {
    let config = AcquisitionConfig::from_toml_str(SINGLE_CHIP).unwrap();
    let mock = MockChannel::new("MOCK::26::INSTR");
    let mut store = MemoryStore::new();
    sweep(&config, &mock, &mut store, "0 0.5 1", "0 0.25 0.5").await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out").join("a0101.csv");
    let rows = reconcile(store.all_conditions());
    chip_daq::data::export_csv(&path, &rows, |id| {
        store.chip(id).map(|chip| chip.name).unwrap_or_default()
    })
    .unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("chip,voltage_input,anode_current"));
    assert!(lines[1].starts_with("A0101,0.00000,"));
    assert!(lines[3].starts_with("A0101,1.00000,0.5,"));
}
