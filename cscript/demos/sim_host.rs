//! A minimal in-memory object manager, standing in for a real host's scene
//! graph (spec section 4.9, 6.2). Grounded on the shape of `simManager.cc`/
//! `scriptObject.cc`: objects are named, optionally have an internal name,
//! and are looked up by name/path/id/internal-name. This is demo/test
//! scaffolding, not a crate feature — `cscript` itself never assumes any
//! particular simulation model.

use std::cell::RefCell;

use ahash::AHashMap;

use cscript::object::{ClassDescriptor, FieldDescriptor, HeapId, ObjectFinder};
use cscript::value::Value;
use cscript::RuntimeFault;

/// A bare-bones scripted object: a name, an optional internal name, and a
/// small set of named string fields (spec section 3.11's "dynamic fields"
/// fallback, without a static field table).
#[derive(Default)]
pub struct SimObject {
    pub name: Option<String>,
    pub internal_name: Option<String>,
    pub dynamic_fields: AHashMap<String, Value>,
}

/// The one class this demo host registers: a generic scripted object with no
/// static fields, matching `scriptObject.cc`'s baseline `SimObject` before
/// any subclassing.
pub struct SimObjectClass;

impl ClassDescriptor for SimObjectClass {
    fn name(&self) -> &str {
        "SimObject"
    }

    fn fields(&self) -> &[FieldDescriptor] {
        &[]
    }

    fn create(&self) -> Box<dyn std::any::Any> {
        Box::new(SimObject::default())
    }

    fn process_args(
        &self,
        instance: &mut dyn std::any::Any,
        name: Option<&str>,
        _is_datablock: bool,
        is_internal_name: bool,
        _argv: &[Value],
    ) -> Result<(), RuntimeFault> {
        let obj = instance
            .downcast_mut::<SimObject>()
            .ok_or_else(|| RuntimeFault::BadCodeblock("wrong instance type for SimObject".into()))?;
        if is_internal_name {
            obj.internal_name = name.map(str::to_owned);
        } else {
            obj.name = name.map(str::to_owned);
        }
        Ok(())
    }

    fn get_id(&self, _instance: &dyn std::any::Any) -> Value {
        Value::empty_string()
    }

    fn get_field_by_name(&self, instance: &dyn std::any::Any, name: &str, _array_index: Option<u32>) -> Option<Value> {
        let obj = instance.downcast_ref::<SimObject>()?;
        obj.dynamic_fields.get(name).cloned()
    }

    fn set_field_by_name(&self, instance: &mut dyn std::any::Any, name: &str, _array_index: Option<u32>, value: Value) -> bool {
        let Some(obj) = instance.downcast_mut::<SimObject>() else {
            return false;
        };
        obj.dynamic_fields.insert(name.to_owned(), value);
        true
    }
}

/// Tracks name/path/internal-name/id indices alongside whatever
/// [`cscript::object::ObjectBridge`] already owns, since the bridge itself
/// has no notion of a name registry (spec section 4.9: name resolution is
/// entirely the host's job).
#[derive(Default)]
pub struct SimHost {
    by_name: RefCell<AHashMap<String, HeapId>>,
    by_internal_name: RefCell<AHashMap<String, HeapId>>,
    by_id: RefCell<AHashMap<u64, HeapId>>,
    next_id: RefCell<u64>,
}

impl SimHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `heap_id` under `name`/`internal_name` and assigns it the
    /// next sequential sim id, returning that id.
    pub fn register(&self, heap_id: HeapId, name: Option<&str>, internal_name: Option<&str>) -> u64 {
        if let Some(name) = name {
            self.by_name.borrow_mut().insert(name.to_owned(), heap_id);
        }
        if let Some(internal_name) = internal_name {
            self.by_internal_name.borrow_mut().insert(internal_name.to_owned(), heap_id);
        }
        let mut next_id = self.next_id.borrow_mut();
        let id = *next_id;
        *next_id += 1;
        self.by_id.borrow_mut().insert(id, heap_id);
        id
    }
}

impl ObjectFinder for SimHost {
    fn find_by_name(&self, name: &str) -> Option<HeapId> {
        self.by_name.borrow().get(name).copied()
    }

    /// No nested-group hierarchy in this demo host: a "path" is just its
    /// final name segment.
    fn find_by_path(&self, path: &str) -> Option<HeapId> {
        let last_segment = path.rsplit('/').next().unwrap_or(path);
        self.find_by_name(last_segment)
    }

    fn find_by_internal_name(&self, name: &str) -> Option<HeapId> {
        self.by_internal_name.borrow().get(name).copied()
    }

    fn find_by_id(&self, id: u64) -> Option<HeapId> {
        self.by_id.borrow().get(&id).copied()
    }
}
