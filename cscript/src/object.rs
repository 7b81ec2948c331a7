//! The object model bridge (spec sections 3.11 and 4.9, component J).
//!
//! Host objects are owned by the host; the VM only ever holds a handle. Field
//! access is routed through the class's field table (static fields) or a
//! dynamic-fields fallback, both ultimately going through the [`crate::types`]
//! registry's `Cast` callback to convert between the field's raw backing
//! storage and a [`Value`].

use ahash::AHashMap;

use crate::error::RuntimeFault;
use crate::intern::Interned;
use crate::types::TypeId;
use crate::value::Value;

/// Opaque reference into a VM-managed heap block (spec section 3.2, `ZoneVmHeap`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(pub u32);

/// Identifies a host-registered object class (spec section 4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u32);

/// A field in a class's static field table.
pub struct FieldDescriptor {
    pub name: Interned,
    pub type_id: TypeId,
    /// Byte offset into the object's backing memory where this field lives.
    pub offset: usize,
    /// `None` for scalar fields, `Some(n)` for a fixed-size array field.
    pub array_len: Option<usize>,
}

/// The six (plus optional iterator) callbacks a host supplies per class (spec
/// sections 3.11, 4.9, 6.2).
pub trait ClassDescriptor {
    fn name(&self) -> &str;

    fn fields(&self) -> &[FieldDescriptor] {
        &[]
    }

    /// Allocates user-backing memory for a new instance.
    fn create(&self) -> Box<dyn std::any::Any>;

    /// Called once after creation with declared name, datablock-vs-object
    /// flag, internal-name flag, and argv.
    fn process_args(
        &self,
        instance: &mut dyn std::any::Any,
        name: Option<&str>,
        is_datablock: bool,
        is_internal_name: bool,
        argv: &[Value],
    ) -> Result<(), RuntimeFault>;

    fn add_object(&self, instance: &mut dyn std::any::Any) {
        let _ = instance;
    }

    fn remove_object(&self, instance: &mut dyn std::any::Any) {
        let _ = instance;
    }

    /// Returns a stable identifier for the instance, typically a small
    /// integer (spec section 4.9: `GetId`).
    fn get_id(&self, instance: &dyn std::any::Any) -> Value;

    fn get_field_by_name(&self, instance: &dyn std::any::Any, name: &str, array_index: Option<u32>) -> Option<Value> {
        let _ = (instance, name, array_index);
        None
    }

    fn set_field_by_name(
        &self,
        instance: &mut dyn std::any::Any,
        name: &str,
        array_index: Option<u32>,
        value: Value,
    ) -> bool {
        let _ = (instance, name, array_index, value);
        false
    }

    fn iterate_fields(&self, instance: &dyn std::any::Any) -> Vec<String> {
        let _ = instance;
        Vec::new()
    }
}

/// Generates the small bitflag-esque struct used for a host object's status
/// flags (spec section 3.11), without pulling in the `bitflags` crate for
/// five booleans that are only ever read/written individually.
macro_rules! bitflags_like_object_flags {
    ($($variant:ident),* $(,)?) => {
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        #[allow(non_snake_case)]
        pub struct ObjectFlags {
            $(pub $variant: bool,)*
        }

        #[allow(non_snake_case)]
        impl ObjectFlags {
            $(
                #[must_use]
                pub fn $variant(self) -> bool {
                    self.$variant
                }
            )*
        }
    };
}

bitflags_like_object_flags! {
    Deleted, Removed, Added, ModStaticFields, ModDynamicFields
}

/// A handle the VM holds to a host-owned object (spec section 3.11).
pub struct ObjectHandle {
    pub class_id: ClassId,
    pub instance: Box<dyn std::any::Any>,
    /// Overrides the class's default namespace for method dispatch, if set.
    pub namespace_override: Option<Interned>,
    pub flags: ObjectFlags,
    vm_ref_count: u32,
}

impl ObjectHandle {
    #[must_use]
    pub fn new(class_id: ClassId, instance: Box<dyn std::any::Any>) -> Self {
        Self {
            class_id,
            instance,
            namespace_override: None,
            flags: ObjectFlags::default(),
            vm_ref_count: 0,
        }
    }

    pub fn inc_vm_ref(&mut self) {
        self.vm_ref_count += 1;
    }

    /// Decrements the VM reference count. Returns `true` if this was the last
    /// reference (the caller should run `Destroy`). Never runs destroy while
    /// the count is still positive (spec section 8, "reference safety").
    pub fn dec_vm_ref(&mut self) -> bool {
        debug_assert!(self.vm_ref_count > 0, "dec_vm_ref underflow");
        self.vm_ref_count = self.vm_ref_count.saturating_sub(1);
        self.vm_ref_count == 0
    }

    #[must_use]
    pub fn vm_ref_count(&self) -> u32 {
        self.vm_ref_count
    }
}

/// Host callbacks for resolving objects by name/path/id (spec sections 4.9,
/// 6.2). The VM never maintains its own global object registry — every find
/// operation is delegated.
pub trait ObjectFinder {
    fn find_by_name(&self, name: &str) -> Option<HeapId>;
    fn find_by_path(&self, path: &str) -> Option<HeapId>;
    fn find_by_internal_name(&self, name: &str) -> Option<HeapId>;
    fn find_by_id(&self, id: u64) -> Option<HeapId>;
}

/// Registry of object classes and live object handles.
#[derive(Default)]
pub struct ObjectBridge {
    classes: Vec<Box<dyn ClassDescriptor>>,
    objects: AHashMap<HeapId, ObjectHandle>,
    next_id: u32,
}

impl ObjectBridge {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_class(&mut self, descriptor: Box<dyn ClassDescriptor>) -> ClassId {
        let id = ClassId(u32::try_from(self.classes.len()).expect("class registry overflow"));
        self.classes.push(descriptor);
        id
    }

    #[must_use]
    pub fn class(&self, id: ClassId) -> Option<&dyn ClassDescriptor> {
        self.classes.get(id.0 as usize).map(std::convert::AsRef::as_ref)
    }

    /// Creates a host object of `class_id`, running `Create` then `ProcessArgs`.
    pub fn create_object(
        &mut self,
        class_id: ClassId,
        name: Option<&str>,
        is_datablock: bool,
        is_internal_name: bool,
        argv: &[Value],
    ) -> Result<HeapId, RuntimeFault> {
        let class = self
            .class(class_id)
            .ok_or_else(|| RuntimeFault::BadCodeblock("unknown class id".into()))?;
        let mut instance = class.create();
        class.process_args(instance.as_mut(), name, is_datablock, is_internal_name, argv)?;

        let id = HeapId(self.next_id);
        self.next_id += 1;
        let mut handle = ObjectHandle::new(class_id, instance);
        handle.inc_vm_ref();
        self.objects.insert(id, handle);
        Ok(id)
    }

    /// Runs `AddObject`, attaching the instance to the host's scene graph
    /// (spec section 4.9).
    pub fn add_object(&mut self, id: HeapId) -> Result<(), RuntimeFault> {
        let handle = self
            .objects
            .get_mut(&id)
            .ok_or_else(|| RuntimeFault::BadCodeblock("stale object handle".into()))?;
        let class = self
            .classes
            .get(handle.class_id.0 as usize)
            .ok_or_else(|| RuntimeFault::BadCodeblock("unknown class id".into()))?;
        class.add_object(handle.instance.as_mut());
        handle.flags.Added = true;
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: HeapId) -> Option<&ObjectHandle> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: HeapId) -> Option<&mut ObjectHandle> {
        self.objects.get_mut(&id)
    }

    pub fn inc_vm_ref(&mut self, id: HeapId) {
        if let Some(handle) = self.objects.get_mut(&id) {
            handle.inc_vm_ref();
        }
    }

    /// Decrements the reference count; destroys (and removes) the object if
    /// it reaches zero.
    pub fn dec_vm_ref(&mut self, id: HeapId) {
        let should_destroy = self.objects.get_mut(&id).map(ObjectHandle::dec_vm_ref).unwrap_or(false);
        if should_destroy {
            if let Some(mut handle) = self.objects.remove(&id) {
                if let Some(class) = self.classes.get(handle.class_id.0 as usize) {
                    class.remove_object(handle.instance.as_mut());
                }
            }
        }
    }

    /// Reads `obj.field`, walking the class's static field table first, then
    /// falling back to the class's dynamic-fields hook (spec section 4.9).
    pub fn get_field(&self, id: HeapId, name: &str, array_index: Option<u32>) -> Result<Option<Value>, RuntimeFault> {
        let handle = self
            .objects
            .get(&id)
            .ok_or_else(|| RuntimeFault::BadCodeblock("stale object handle".into()))?;
        let class = self
            .class(handle.class_id)
            .ok_or_else(|| RuntimeFault::BadCodeblock("unknown class id".into()))?;
        Ok(class.get_field_by_name(handle.instance.as_ref(), name, array_index))
    }

    pub fn set_field(
        &mut self,
        id: HeapId,
        name: &str,
        array_index: Option<u32>,
        value: Value,
    ) -> Result<bool, RuntimeFault> {
        let handle = self
            .objects
            .get_mut(&id)
            .ok_or_else(|| RuntimeFault::BadCodeblock("stale object handle".into()))?;
        let class = self
            .classes
            .get(handle.class_id.0 as usize)
            .ok_or_else(|| RuntimeFault::BadCodeblock("unknown class id".into()))?;
        Ok(class.set_field_by_name(handle.instance.as_mut(), name, array_index, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;
    struct DummyClass;
    impl ClassDescriptor for DummyClass {
        fn name(&self) -> &str {
            "Dummy"
        }
        fn create(&self) -> Box<dyn std::any::Any> {
            Box::new(Dummy)
        }
        fn process_args(
            &self,
            _instance: &mut dyn std::any::Any,
            _name: Option<&str>,
            _is_datablock: bool,
            _is_internal_name: bool,
            _argv: &[Value],
        ) -> Result<(), RuntimeFault> {
            Ok(())
        }
        fn get_id(&self, _instance: &dyn std::any::Any) -> Value {
            Value::Uint(1)
        }
    }

    #[test]
    fn refcount_zero_destroys_and_removes() {
        let mut bridge = ObjectBridge::new();
        let class_id = bridge.register_class(Box::new(DummyClass));
        let id = bridge.create_object(class_id, Some("obj"), false, false, &[]).unwrap();
        assert!(bridge.get(id).is_some());
        bridge.dec_vm_ref(id);
        assert!(bridge.get(id).is_none());
    }
}
