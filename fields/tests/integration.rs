//! Cross-module integration tests: the three-file fixture under
//! `tests/fixtures/` exercises the database loader across several blocks
//! and classes at once, then drives the result through the dispatcher the
//! same way a real client command stream would.

use std::sync::Arc;

use fields::dispatch::Dispatcher;
use fields::dispatch::Session;
use fields::hardware::mock::MockHardware;
use fields::Runtime;

const CONFIG: &str = include_str!("fixtures/config");
const REGISTERS: &str = include_str!("fixtures/registers");
const DESCRIPTION: &str = include_str!("fixtures/description");

fn runtime() -> Runtime {
    Runtime::load(CONFIG, REGISTERS, DESCRIPTION, Arc::new(MockHardware::new())).unwrap()
}

#[test]
fn fixture_loads_every_block_with_its_description() {
    let rt = runtime();
    let ttlin = rt.db.block("TTLIN").unwrap();
    assert_eq!(ttlin.count(), 6);
    assert_eq!(ttlin.description(), "TTL input block");
    assert_eq!(ttlin.field("VAL").unwrap().description(), "input level");

    let pulse = rt.db.block("PULSE").unwrap();
    assert_eq!(pulse.count(), 4);
    assert_eq!(pulse.field("DELAY").unwrap().description(), "pulse delay");

    let seq = rt.db.block("SEQ").unwrap();
    assert_eq!(seq.count(), 1);
    assert!(seq.field("TABLE").is_some());
}

#[test]
fn dispatcher_round_trips_a_param_write_across_instances() {
    let rt = Arc::new(runtime());
    let dispatcher = Dispatcher::new(rt);
    let mut session = Session::new();

    assert_eq!(dispatcher.handle_line(&mut session, "PULSE2.WIDTH=12"), Some("OK\n".to_string()));
    assert_eq!(dispatcher.handle_line(&mut session, "PULSE2.WIDTH?"), Some("OK =12\n".to_string()));
}

#[test]
fn dispatcher_reports_time_raw_attribute_across_the_fixture() {
    let rt = Arc::new(runtime());
    let dispatcher = Dispatcher::new(rt);
    let mut session = Session::new();

    assert_eq!(dispatcher.handle_line(&mut session, "PULSE1.DELAY=1"), Some("OK\n".to_string()));
    assert_eq!(dispatcher.handle_line(&mut session, "PULSE1.DELAY.RAW?"), Some("OK =125000000\n".to_string()));
}

#[test]
fn dispatcher_writes_and_reads_back_a_sequencer_table() {
    let rt = Arc::new(runtime());
    let dispatcher = Dispatcher::new(rt);
    let mut session = Session::new();

    assert_eq!(dispatcher.handle_line(&mut session, "SEQ1.TABLE<"), None);
    assert_eq!(dispatcher.handle_line(&mut session, "5 100"), None);
    assert_eq!(dispatcher.handle_line(&mut session, ""), Some("OK\n".to_string()));

    assert_eq!(dispatcher.handle_line(&mut session, "SEQ1.TABLE.LENGTH?"), Some("OK =1\n".to_string()));
}

#[test]
fn load_from_dir_reads_the_same_fixture_from_a_temp_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config"), CONFIG).unwrap();
    std::fs::write(dir.path().join("registers"), REGISTERS).unwrap();
    std::fs::write(dir.path().join("description"), DESCRIPTION).unwrap();

    let rt = Runtime::load_from_dir(dir.path(), Arc::new(MockHardware::new())).unwrap();
    assert_eq!(rt.db.block("TTLIN").unwrap().count(), 6);
    assert_eq!(rt.db.block("SEQ").unwrap().count(), 1);
}

#[test]
fn load_from_dir_tolerates_a_missing_description_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config"), CONFIG).unwrap();
    std::fs::write(dir.path().join("registers"), REGISTERS).unwrap();

    let rt = Runtime::load_from_dir(dir.path(), Arc::new(MockHardware::new())).unwrap();
    assert_eq!(rt.db.block("PULSE").unwrap().description(), "");
}
