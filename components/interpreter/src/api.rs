//! The embedding API: slots and handles.
//!
//! The host exchanges values with the VM through an indexed window of
//! stack slots on the current fiber. `ensure_slots` sizes the window
//! (creating a scratch fiber when nothing is running), typed accessors
//! read and write it, and handles pin values across collections. A call
//! handle wraps a tiny compiled stub that dispatches one method over a
//! pre-populated argument window.

use core_types::{InterpretResult, Value};

use crate::fiber::{FiberState, ObjFiber};
use crate::heap::{ObjForeign, ObjKind};
use crate::map::ObjMap;
use crate::vm::{ApiStack, Vm};

/// A host-owned, collection-proof reference to a value.
///
/// The value stays alive until the handle is released; handles are not
/// `Clone`, so each one is released exactly once.
#[derive(Debug)]
pub struct Handle {
    index: usize,
}

/// The type of value in a slot, as visible to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotType {
    /// A boolean.
    Bool,
    /// A number.
    Num,
    /// A foreign object.
    Foreign,
    /// A list.
    List,
    /// A map.
    Map,
    /// Null.
    Null,
    /// A string.
    String,
    /// Anything else (classes, fibers, closures, instances).
    Unknown,
}

impl Vm {
    fn api(&self) -> ApiStack {
        self.api_stack.expect("no slots: call ensure_slots first")
    }

    /// Make at least `num_slots` slots available, growing the current
    /// fiber's stack if needed. Creates a scratch fiber when the VM is
    /// idle.
    pub fn ensure_slots(&mut self, num_slots: usize) {
        if self.api_stack.is_none() {
            let fiber = self.alloc_obj(
                ObjKind::Fiber(Box::new(ObjFiber::bare())),
                self.core.fiber,
            );
            self.fiber = Some(fiber);
            self.api_stack = Some(ApiStack { fiber, start: 0 });
        }
        let api = self.api();
        let current = self.heap.fiber(api.fiber).stack.len() - api.start;
        if current >= num_slots {
            return;
        }
        let needed = api.start + num_slots;
        let added = self.heap.fiber_mut(api.fiber).ensure_stack(needed);
        self.heap.add_bytes(added);
        let stack = &mut self.heap.fiber_mut(api.fiber).stack;
        while stack.len() < needed {
            stack.push(Value::NULL);
        }
    }

    /// Number of slots currently available.
    pub fn slot_count(&self) -> usize {
        let api = self.api();
        self.heap.fiber(api.fiber).stack.len() - api.start
    }

    pub(crate) fn slot_value(&self, slot: usize) -> Value {
        let api = self.api();
        self.heap.fiber(api.fiber).stack[api.start + slot]
    }

    pub(crate) fn set_slot_value(&mut self, slot: usize, value: Value) {
        let api = self.api();
        self.heap.fiber_mut(api.fiber).stack[api.start + slot] = value;
    }

    /// The type of the value in `slot`.
    pub fn get_slot_type(&self, slot: usize) -> SlotType {
        let value = self.slot_value(slot);
        if value.is_num() {
            return SlotType::Num;
        }
        if value.is_bool() {
            return SlotType::Bool;
        }
        if value.is_null() {
            return SlotType::Null;
        }
        match &self.heap.get(value.as_obj()).kind {
            ObjKind::Str(_) => SlotType::String,
            ObjKind::List(_) => SlotType::List,
            ObjKind::Map(_) => SlotType::Map,
            ObjKind::Foreign(_) => SlotType::Foreign,
            _ => SlotType::Unknown,
        }
    }

    /// Read a number from `slot`.
    pub fn get_slot_double(&self, slot: usize) -> f64 {
        self.slot_value(slot).as_num()
    }

    /// Read a boolean from `slot`.
    pub fn get_slot_bool(&self, slot: usize) -> bool {
        self.slot_value(slot).is_true()
    }

    /// Read a string from `slot`, replacing invalid UTF-8.
    pub fn get_slot_string(&self, slot: usize) -> String {
        self.heap.string(self.slot_value(slot).as_obj()).as_text().into_owned()
    }

    /// Read a string's raw bytes from `slot`.
    pub fn get_slot_bytes(&self, slot: usize) -> &[u8] {
        &self.heap.string(self.slot_value(slot).as_obj()).bytes
    }

    /// Write a number into `slot`.
    pub fn set_slot_double(&mut self, slot: usize, value: f64) {
        self.set_slot_value(slot, Value::num(value));
    }

    /// Write a boolean into `slot`.
    pub fn set_slot_bool(&mut self, slot: usize, value: bool) {
        self.set_slot_value(slot, Value::from_bool(value));
    }

    /// Write null into `slot`.
    pub fn set_slot_null(&mut self, slot: usize) {
        self.set_slot_value(slot, Value::NULL);
    }

    /// Write a string into `slot`.
    pub fn set_slot_string(&mut self, slot: usize, text: &str) {
        let value = self.string_value(text);
        self.set_slot_value(slot, value);
    }

    /// Write a byte string into `slot`.
    pub fn set_slot_bytes(&mut self, slot: usize, bytes: &[u8]) {
        let id = self.new_string(bytes.to_vec());
        self.set_slot_value(slot, Value::obj(id));
    }

    /// Put a fresh empty list into `slot`.
    pub fn set_slot_new_list(&mut self, slot: usize) {
        let id = self.new_list(Vec::new());
        self.set_slot_value(slot, Value::obj(id));
    }

    /// Put a fresh empty map into `slot`.
    pub fn set_slot_new_map(&mut self, slot: usize) {
        let id = self.new_map();
        self.set_slot_value(slot, Value::obj(id));
    }

    /// Create the foreign instance for the class in `class_slot` with
    /// `size` zeroed payload bytes, writing it into `slot`.
    ///
    /// A foreign class's allocate callback must call this exactly once.
    pub fn set_slot_new_foreign(&mut self, slot: usize, class_slot: usize, size: usize) {
        let class = self.slot_value(class_slot).as_obj();
        let foreign = self.alloc_obj(
            ObjKind::Foreign(ObjForeign { data: vec![0; size] }),
            Some(class),
        );
        self.set_slot_value(slot, Value::obj(foreign));
    }

    /// Borrow the payload bytes of the foreign object in `slot`.
    pub fn get_slot_foreign(&self, slot: usize) -> &[u8] {
        match &self.heap.get(self.slot_value(slot).as_obj()).kind {
            ObjKind::Foreign(foreign) => &foreign.data,
            kind => unreachable!("expected foreign, found {kind:?}"),
        }
    }

    /// Mutably borrow the payload bytes of the foreign object in `slot`.
    pub fn get_slot_foreign_mut(&mut self, slot: usize) -> &mut [u8] {
        let id = self.slot_value(slot).as_obj();
        match &mut self.heap.get_mut(id).kind {
            ObjKind::Foreign(foreign) => &mut foreign.data,
            kind => unreachable!("expected foreign, found {kind:?}"),
        }
    }

    // -- lists --------------------------------------------------------------

    /// Number of elements in the list in `list_slot`.
    pub fn get_list_count(&self, list_slot: usize) -> usize {
        self.heap.list(self.slot_value(list_slot).as_obj()).elements.len()
    }

    /// Copy `list[index]` into `element_slot`.
    pub fn get_list_element(&mut self, list_slot: usize, index: usize, element_slot: usize) {
        let value = self.heap.list(self.slot_value(list_slot).as_obj()).elements[index];
        self.set_slot_value(element_slot, value);
    }

    /// Store the value in `element_slot` at `list[index]`.
    pub fn set_list_element(&mut self, list_slot: usize, index: usize, element_slot: usize) {
        let value = self.slot_value(element_slot);
        let list = self.slot_value(list_slot).as_obj();
        self.heap.list_mut(list).elements[index] = value;
    }

    /// Insert the value in `element_slot` at `list[index]`.
    pub fn insert_in_list(&mut self, list_slot: usize, index: usize, element_slot: usize) {
        let value = self.slot_value(element_slot);
        let list = self.slot_value(list_slot).as_obj();
        self.heap.list_mut(list).elements.insert(index, value);
        self.heap.add_bytes(std::mem::size_of::<Value>());
    }

    // -- maps ---------------------------------------------------------------

    /// Number of entries in the map in `map_slot`.
    pub fn get_map_count(&self, map_slot: usize) -> usize {
        self.map_ref(self.slot_value(map_slot).as_obj()).len()
    }

    /// Whether the map contains the key in `key_slot`.
    pub fn get_map_contains_key(&self, map_slot: usize, key_slot: usize) -> bool {
        let key = self.slot_value(key_slot);
        let map = self.slot_value(map_slot).as_obj();
        self.map_ref(map).contains_key(&self.heap, key)
    }

    /// Copy `map[key]` (or null) into `value_slot`.
    pub fn get_map_value(&mut self, map_slot: usize, key_slot: usize, value_slot: usize) {
        let key = self.slot_value(key_slot);
        let map = self.slot_value(map_slot).as_obj();
        let value = self.map_get(map, key).unwrap_or(Value::NULL);
        self.set_slot_value(value_slot, value);
    }

    /// Store the value in `value_slot` under the key in `key_slot`.
    pub fn set_map_value(&mut self, map_slot: usize, key_slot: usize, value_slot: usize) {
        let key = self.slot_value(key_slot);
        let value = self.slot_value(value_slot);
        let map = self.slot_value(map_slot).as_obj();
        debug_assert!(ObjMap::is_valid_key(&self.heap, key), "invalid map key");
        self.map_set(map, key, value);
    }

    /// Remove the key in `key_slot`, placing the removed value (or null)
    /// into `removed_value_slot`.
    pub fn remove_map_value(&mut self, map_slot: usize, key_slot: usize, removed_value_slot: usize) {
        let key = self.slot_value(key_slot);
        let map = self.slot_value(map_slot).as_obj();
        let removed = self.map_remove(map, key).unwrap_or(Value::NULL);
        self.set_slot_value(removed_value_slot, removed);
    }

    // -- variables and modules ----------------------------------------------

    /// Whether the named module has been loaded.
    pub fn has_module(&mut self, module: &str) -> bool {
        self.find_module(module).is_some()
    }

    /// Whether the named module has a top-level variable with this name.
    pub fn has_variable(&mut self, module: &str, name: &str) -> bool {
        self.find_module(module)
            .is_some_and(|module| self.heap.module(module).vars.lookup(name).is_some())
    }

    /// Copy the named top-level variable into `slot`.
    ///
    /// The module must be loaded and the variable defined.
    pub fn get_variable(&mut self, module: &str, name: &str, slot: usize) {
        let module = self.find_module(module).expect("module not loaded");
        let var_slot = self
            .heap
            .module(module)
            .vars
            .lookup(name)
            .expect("variable not defined");
        let value = self.heap.module(module).vars.value(var_slot);
        self.set_slot_value(slot, value);
    }

    /// Abort the current fiber with the value in `slot`.
    pub fn abort_fiber(&mut self, slot: usize) {
        let error = self.slot_value(slot);
        let fiber = self.current_fiber();
        self.heap.fiber_mut(fiber).error = error;
    }

    // -- handles ------------------------------------------------------------

    /// Pin the value in `slot` so it survives collection.
    pub fn get_slot_handle(&mut self, slot: usize) -> Handle {
        let value = self.slot_value(slot);
        Handle { index: self.heap.add_handle(value) }
    }

    /// Copy a handle's value into `slot`.
    pub fn set_slot_handle(&mut self, slot: usize, handle: &Handle) {
        let value = self.heap.handle_value(handle.index);
        self.set_slot_value(slot, value);
    }

    /// Release a handle, letting its value be collected.
    pub fn release_handle(&mut self, handle: Handle) {
        self.heap.release_handle_at(handle.index);
    }

    /// Compile a call stub for a method signature.
    ///
    /// The resulting handle drives dispatch over a pre-populated argument
    /// window: place the receiver in slot 0 and arguments in slots 1…n,
    /// then `call` it.
    pub fn make_call_handle(&mut self, signature: &str) -> Handle {
        let arity = signature.matches('_').count();
        let symbol = self.method_names.ensure(signature);

        self.heap.pause_gc();
        let code = vec![
            bytecode_system::Op::call(arity) as u8,
            (symbol >> 8) as u8,
            symbol as u8,
            bytecode_system::Op::Return as u8,
            bytecode_system::Op::End as u8,
        ];
        let source_lines = vec![0; code.len()];
        let data = crate::heap::FnData {
            code,
            constants: Vec::new(),
            module: self.core_module,
            max_slots: arity + 1,
            num_upvalues: 0,
            arity,
            name: signature.to_string(),
            source_lines,
        };
        let fn_obj = self.alloc_obj(
            ObjKind::Fn(crate::heap::ObjFn { data: std::rc::Rc::new(data) }),
            self.core.fn_,
        );
        let closure = self.new_closure(fn_obj, Vec::new());
        self.heap.resume_gc();

        Handle { index: self.heap.add_handle(Value::obj(closure)) }
    }

    /// Invoke a call handle against the slots set up by the host.
    ///
    /// Slot 0 holds the receiver; on success it holds the result.
    pub fn call(&mut self, handle: &Handle) -> InterpretResult {
        let closure_value = self.heap.handle_value(handle.index);
        let closure = closure_value.as_obj();
        let api = self.api();
        let fiber = api.fiber;

        let arity = {
            let fn_obj = self.heap.closure(closure).fn_obj;
            self.heap.fn_data(fn_obj).arity
        };

        // Trim or pad the window to receiver + arguments.
        let wanted = api.start + arity + 1;
        let stack = &mut self.heap.fiber_mut(fiber).stack;
        stack.truncate(wanted);
        while stack.len() < wanted {
            stack.push(Value::NULL);
        }

        self.heap.fiber_mut(fiber).state = FiberState::Root;
        self.heap.fiber_mut(fiber).error = Value::NULL;
        if self.push_frame(fiber, closure, api.start).is_err() {
            return InterpretResult::RuntimeError;
        }
        self.run_interpreter(fiber)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;

    #[test]
    fn test_slots_round_trip() {
        let mut vm = Vm::new(Configuration::default());
        vm.ensure_slots(3);
        vm.set_slot_double(0, 1.5);
        vm.set_slot_bool(1, true);
        vm.set_slot_string(2, "hello");

        assert_eq!(vm.get_slot_type(0), SlotType::Num);
        assert_eq!(vm.get_slot_double(0), 1.5);
        assert!(vm.get_slot_bool(1));
        assert_eq!(vm.get_slot_type(2), SlotType::String);
        assert_eq!(vm.get_slot_string(2), "hello");
    }

    #[test]
    fn test_list_slots() {
        let mut vm = Vm::new(Configuration::default());
        vm.ensure_slots(2);
        vm.set_slot_new_list(0);
        vm.set_slot_double(1, 9.0);
        vm.insert_in_list(0, 0, 1);
        vm.set_slot_double(1, 7.0);
        vm.insert_in_list(0, 0, 1);

        assert_eq!(vm.get_list_count(0), 2);
        vm.get_list_element(0, 1, 1);
        assert_eq!(vm.get_slot_double(1), 9.0);
    }

    #[test]
    fn test_map_slots() {
        let mut vm = Vm::new(Configuration::default());
        vm.ensure_slots(3);
        vm.set_slot_new_map(0);
        vm.set_slot_string(1, "key");
        vm.set_slot_double(2, 3.0);
        vm.set_map_value(0, 1, 2);

        assert_eq!(vm.get_map_count(0), 1);
        assert!(vm.get_map_contains_key(0, 1));
        vm.get_map_value(0, 1, 2);
        assert_eq!(vm.get_slot_double(2), 3.0);

        vm.remove_map_value(0, 1, 2);
        assert_eq!(vm.get_map_count(0), 0);
        assert_eq!(vm.get_slot_double(2), 3.0);
    }

    #[test]
    fn test_handles_survive_collection() {
        let mut vm = Vm::new(Configuration::default());
        vm.ensure_slots(1);
        vm.set_slot_string(0, "pinned");
        let handle = vm.get_slot_handle(0);

        vm.set_slot_null(0);
        vm.collect_garbage();

        vm.set_slot_handle(0, &handle);
        assert_eq!(vm.get_slot_string(0), "pinned");
        vm.release_handle(handle);
    }

    #[test]
    fn test_get_variable_from_interpreted_module() {
        let mut vm = Vm::new(Configuration::default());
        let result = vm.interpret("main", "var exported = 42");
        assert_eq!(result, InterpretResult::Success);

        assert!(vm.has_module("main"));
        assert!(vm.has_variable("main", "exported"));
        vm.ensure_slots(1);
        vm.get_variable("main", "exported", 0);
        assert_eq!(vm.get_slot_double(0), 42.0);
    }
}
