//! Object-bridge integration tests (spec sections 3.11, 4.9), driven through
//! the host-facing API in [`cscript::host`] against the demo in-memory
//! [`sim_host`] scaffolding rather than any crate-internal simulation model.

#[path = "../demos/sim_host.rs"]
mod sim_host;

use cscript::{ObjectFinder, Value, Vm, VmConfig};
use sim_host::{SimHost, SimObjectClass};

#[test]
fn creating_a_named_object_registers_it_with_the_host_finder() {
    let mut vm = Vm::new(VmConfig::default());
    let class_id = vm.register_class(Box::new(SimObjectClass));
    let host = SimHost::new();

    let obj = vm.create_object(class_id, Some("Ship1"), false, &[]).unwrap();
    host.register(obj, Some("Ship1"), None);

    assert_eq!(host.find_by_name("Ship1"), Some(obj));
    assert!(host.find_by_name("NoSuchObject").is_none());
}

#[test]
fn dynamic_fields_round_trip_through_set_and_get() {
    let mut vm = Vm::new(VmConfig::default());
    let class_id = vm.register_class(Box::new(SimObjectClass));
    let obj = vm.create_object(class_id, Some("Player1"), false, &[]).unwrap();

    let changed = vm.set_object_field(obj, "position", None, Value::empty_string()).unwrap();
    assert!(changed);
    assert!(vm.get_object_field(obj, "position", None).unwrap().unwrap().is_null());
    assert!(vm.get_object_field(obj, "missingField", None).unwrap().is_none());
}

#[test]
fn find_by_path_resolves_to_the_final_path_segment() {
    let mut vm = Vm::new(VmConfig::default());
    let class_id = vm.register_class(Box::new(SimObjectClass));
    let host = SimHost::new();

    let obj = vm.create_object(class_id, Some("Turret"), false, &[]).unwrap();
    host.register(obj, Some("Turret"), None);

    assert_eq!(host.find_by_path("MissionGroup/Turret"), Some(obj));
}
