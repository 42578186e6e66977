//! The object heap.
//!
//! Objects live in a slab indexed by `ObjId`. Every object begins with a
//! header carrying its kind-independent state: the class reference (which
//! may be absent while the core library bootstraps), the mark bit, and a
//! `next` link threading every live object into one list for the sweep
//! phase. Freed slab slots are recycled through a free list.
//!
//! The heap also owns the pieces of GC machinery that are not traversal:
//! byte accounting with the next-collection threshold, the gray worklist,
//! the temporary-root stack used to protect objects mid-construction, and
//! the handle table that keeps host-referenced values alive.

use std::rc::Rc;

use core_types::{ModuleVars, ObjId, Value};

use crate::config::{ForeignClassMethods, PrimitiveFn};
use crate::fiber::ObjFiber;
use crate::map::ObjMap;

/// Depth of the temporary-root stack needed by ordinary primitive
/// construction sequences.
pub const MAX_TEMP_ROOTS: usize = 8;

/// Kind-independent state at the start of every object.
#[derive(Debug)]
pub struct ObjHeader {
    /// The object's class, absent only during core-library bootstrap.
    pub class: Option<ObjId>,
    /// Mark bit for the collector.
    pub is_dark: bool,
    /// Next object in the all-objects list.
    pub next: Option<ObjId>,
}

/// A heap object: header plus kind-specific payload.
#[derive(Debug)]
pub struct Obj {
    /// Kind-independent header.
    pub header: ObjHeader,
    /// Kind-specific state.
    pub kind: ObjKind,
}

/// The payload of a heap object.
#[derive(Debug)]
pub enum ObjKind {
    /// An immutable byte string.
    Str(ObjString),
    /// A growable list of values.
    List(ObjList),
    /// An open-addressed hash map.
    Map(ObjMap),
    /// A numeric range.
    Range(ObjRange),
    /// A module: named variables plus their values.
    Module(Box<ObjModule>),
    /// A compiled function.
    Fn(ObjFn),
    /// A function plus its captured upvalues.
    Closure(ObjClosure),
    /// A cell shared by closures closing over the same local.
    Upvalue(ObjUpvalue),
    /// A user-level coroutine.
    Fiber(Box<ObjFiber>),
    /// A class.
    Class(Box<ObjClass>),
    /// An instance of a script-defined class.
    Instance(ObjInstance),
    /// An instance whose bytes belong to the host.
    Foreign(ObjForeign),
}

/// An immutable UTF-8 byte string.
///
/// Content is byte-addressed: escape sequences and slicing can produce
/// bytes that are not valid UTF-8, which is tolerated everywhere.
#[derive(Debug)]
pub struct ObjString {
    /// FNV-1a hash of the bytes.
    pub hash: u32,
    /// The content.
    pub bytes: Box<[u8]>,
}

impl ObjString {
    /// Create a string, computing its hash.
    pub fn new(bytes: Vec<u8>) -> ObjString {
        ObjString {
            hash: fnv1a(&bytes),
            bytes: bytes.into_boxed_slice(),
        }
    }

    /// The content as text, replacing invalid sequences.
    pub fn as_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// FNV-1a over a byte slice.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// A growable sequence of values.
#[derive(Debug, Default)]
pub struct ObjList {
    /// The elements.
    pub elements: Vec<Value>,
}

/// A numeric range.
#[derive(Debug, Clone, Copy)]
pub struct ObjRange {
    /// Start of the range.
    pub from: f64,
    /// End of the range.
    pub to: f64,
    /// Whether `to` itself is included.
    pub is_inclusive: bool,
}

/// A module: a name and its variable table.
#[derive(Debug, Default)]
pub struct ObjModule {
    /// The module's name.
    pub name: String,
    /// Variable names and values.
    pub vars: ModuleVars,
}

/// Runtime state of a compiled function.
#[derive(Debug, Clone)]
pub struct FnData {
    /// The instruction stream.
    pub code: Vec<u8>,
    /// Linked constants.
    pub constants: Vec<Value>,
    /// The module the function was compiled in.
    pub module: ObjId,
    /// Maximum stack slots the function occupies.
    pub max_slots: usize,
    /// Number of upvalues closures over this function capture.
    pub num_upvalues: usize,
    /// Declared parameter count.
    pub arity: usize,
    /// Name for stack traces.
    pub name: String,
    /// One source line per bytecode byte.
    pub source_lines: Vec<u32>,
}

/// A compiled function object.
///
/// The payload is reference-counted so a call frame can hold the running
/// function without borrowing the heap on every instruction.
#[derive(Debug)]
pub struct ObjFn {
    /// The shared function data.
    pub data: Rc<FnData>,
}

/// A closure: a function and the upvalues it captured.
#[derive(Debug)]
pub struct ObjClosure {
    /// The wrapped function.
    pub fn_obj: ObjId,
    /// Captured upvalues, one per slot the function declares.
    pub upvalues: Vec<ObjId>,
}

/// The two states of an upvalue.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    /// Still on the owning fiber's stack, at this slot index.
    Open {
        /// The fiber whose stack holds the value.
        fiber: ObjId,
        /// The stack slot.
        slot: usize,
    },
    /// Moved into the upvalue itself when its local left scope.
    Closed(Value),
}

/// A cell shared by closures capturing the same variable.
#[derive(Debug)]
pub struct ObjUpvalue {
    /// Where the captured value currently lives.
    pub state: UpvalueState,
}

/// How a method slot is implemented.
#[derive(Clone)]
pub enum Method {
    /// No method bound at this symbol.
    None,
    /// A Rust function following the primitive calling convention.
    Primitive(PrimitiveFn),
    /// Direct invocation of the closure in the receiver slot (`Fn.call`).
    FunctionCall,
    /// A host function using the slot API.
    Foreign(crate::config::ForeignMethodFn),
    /// A compiled method body.
    Block(ObjId),
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::None => write!(f, "None"),
            Method::Primitive(_) => write!(f, "Primitive"),
            Method::FunctionCall => write!(f, "FunctionCall"),
            Method::Foreign(_) => write!(f, "Foreign"),
            Method::Block(id) => write!(f, "Block({})", id.index()),
        }
    }
}

/// A class.
#[derive(Debug)]
pub struct ObjClass {
    /// The class's name.
    pub name: String,
    /// Superclass, absent only for `Object`.
    pub superclass: Option<ObjId>,
    /// Number of instance fields including inherited ones, or `None` for a
    /// foreign class whose payload is opaque bytes.
    pub num_fields: Option<usize>,
    /// Method table indexed by global method symbol.
    pub methods: Vec<Method>,
    /// Compile-time attributes, or null.
    pub attributes: Value,
    /// Allocator and finalizer for foreign classes.
    pub foreign_methods: Option<ForeignClassMethods>,
}

impl ObjClass {
    /// Create a class with no superclass wired yet.
    pub fn bare(name: &str, num_fields: Option<usize>) -> ObjClass {
        ObjClass {
            name: name.to_string(),
            superclass: None,
            num_fields,
            methods: Vec::new(),
            attributes: Value::NULL,
            foreign_methods: None,
        }
    }

    /// The method bound at `symbol`, if any.
    pub fn method(&self, symbol: usize) -> Method {
        match self.methods.get(symbol) {
            Some(method) => method.clone(),
            None => Method::None,
        }
    }

    /// Bind a method at `symbol`, growing the table as needed.
    pub fn bind_method(&mut self, symbol: usize, method: Method) {
        if self.methods.len() <= symbol {
            self.methods.resize(symbol + 1, Method::None);
        }
        self.methods[symbol] = method;
    }
}

/// An instance of a script-defined class.
#[derive(Debug)]
pub struct ObjInstance {
    /// Field storage, sized by the class.
    pub fields: Vec<Value>,
}

/// An instance whose payload bytes belong to the host.
#[derive(Debug)]
pub struct ObjForeign {
    /// Host-managed bytes.
    pub data: Vec<u8>,
}

// ---------------------------------------------------------------------------

/// The object heap and allocation accounting.
#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Option<Obj>>,
    free_slots: Vec<usize>,
    /// Head of the all-objects list threaded through `header.next`.
    pub(crate) first: Option<ObjId>,
    pub(crate) bytes_allocated: usize,
    pub(crate) next_gc: usize,
    pub(crate) min_heap_size: usize,
    pub(crate) heap_growth_percent: usize,
    pub(crate) gray: Vec<ObjId>,
    pub(crate) temp_roots: Vec<ObjId>,
    handles: Vec<Option<Value>>,
    handle_free: Vec<usize>,
    gc_pause: usize,
}

impl Heap {
    /// Create a heap with the configured thresholds.
    pub fn new(initial_heap_size: usize, min_heap_size: usize, heap_growth_percent: usize) -> Heap {
        Heap {
            next_gc: initial_heap_size,
            min_heap_size,
            heap_growth_percent,
            ..Heap::default()
        }
    }

    /// Allocate an object, threading it onto the all-objects list.
    ///
    /// Callers are responsible for triggering collection first; the new
    /// object is not yet reachable from any root.
    pub fn alloc(&mut self, mut obj: Obj) -> ObjId {
        obj.header.next = self.first;
        let id = match self.free_slots.pop() {
            Some(index) => {
                self.bytes_allocated += size_of_obj(&obj);
                self.slots[index] = Some(obj);
                ObjId::new(index)
            }
            None => {
                self.bytes_allocated += size_of_obj(&obj);
                self.slots.push(Some(obj));
                ObjId::new(self.slots.len() - 1)
            }
        };
        self.first = Some(id);
        id
    }

    /// Whether the accounting says it is time to collect.
    pub fn should_collect(&self) -> bool {
        if self.gc_pause > 0 {
            return false;
        }
        if cfg!(feature = "gc_stress") {
            return true;
        }
        self.bytes_allocated > self.next_gc
    }

    /// Suspend collection while a graph of objects is built that has no
    /// root yet (module linking). Nests.
    pub fn pause_gc(&mut self) {
        self.gc_pause += 1;
    }

    /// Resume collection after `pause_gc`.
    pub fn resume_gc(&mut self) {
        debug_assert!(self.gc_pause > 0);
        self.gc_pause -= 1;
    }

    /// Record growth of an object's owned storage (list pushes, map
    /// resizes, stack growth) so the trigger stays honest between
    /// collections.
    pub fn add_bytes(&mut self, bytes: usize) {
        self.bytes_allocated += bytes;
    }

    /// Bytes currently attributed to live objects.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub(crate) fn free(&mut self, id: ObjId) {
        let obj = self.slots[id.index()].take().expect("double free");
        drop(obj);
        self.free_slots.push(id.index());
    }

    /// Borrow an object.
    pub fn get(&self, id: ObjId) -> &Obj {
        self.slots[id.index()].as_ref().expect("stale object id")
    }

    /// Mutably borrow an object.
    pub fn get_mut(&mut self, id: ObjId) -> &mut Obj {
        self.slots[id.index()].as_mut().expect("stale object id")
    }

    pub(crate) fn try_get(&self, id: ObjId) -> Option<&Obj> {
        self.slots.get(id.index()).and_then(|slot| slot.as_ref())
    }

    /// Iterate over the ids of all live objects.
    pub fn iter_ids(&self) -> impl Iterator<Item = ObjId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| ObjId::new(index))
    }

    // -- typed accessors ----------------------------------------------------

    /// The string payload of `id`.
    pub fn string(&self, id: ObjId) -> &ObjString {
        match &self.get(id).kind {
            ObjKind::Str(s) => s,
            kind => unreachable!("expected string, found {kind:?}"),
        }
    }

    /// The list payload of `id`.
    pub fn list(&self, id: ObjId) -> &ObjList {
        match &self.get(id).kind {
            ObjKind::List(l) => l,
            kind => unreachable!("expected list, found {kind:?}"),
        }
    }

    /// The list payload of `id`, mutably.
    pub fn list_mut(&mut self, id: ObjId) -> &mut ObjList {
        match &mut self.get_mut(id).kind {
            ObjKind::List(l) => l,
            kind => unreachable!("expected list, found {kind:?}"),
        }
    }

    /// The range payload of `id`.
    pub fn range(&self, id: ObjId) -> ObjRange {
        match &self.get(id).kind {
            ObjKind::Range(r) => *r,
            kind => unreachable!("expected range, found {kind:?}"),
        }
    }

    /// The module payload of `id`.
    pub fn module(&self, id: ObjId) -> &ObjModule {
        match &self.get(id).kind {
            ObjKind::Module(m) => m,
            kind => unreachable!("expected module, found {kind:?}"),
        }
    }

    /// The module payload of `id`, mutably.
    pub fn module_mut(&mut self, id: ObjId) -> &mut ObjModule {
        match &mut self.get_mut(id).kind {
            ObjKind::Module(m) => m,
            kind => unreachable!("expected module, found {kind:?}"),
        }
    }

    /// The shared function data of function object `id`.
    pub fn fn_data(&self, id: ObjId) -> Rc<FnData> {
        match &self.get(id).kind {
            ObjKind::Fn(f) => Rc::clone(&f.data),
            kind => unreachable!("expected function, found {kind:?}"),
        }
    }

    /// The closure payload of `id`.
    pub fn closure(&self, id: ObjId) -> &ObjClosure {
        match &self.get(id).kind {
            ObjKind::Closure(c) => c,
            kind => unreachable!("expected closure, found {kind:?}"),
        }
    }

    /// The upvalue payload of `id`.
    pub fn upvalue(&self, id: ObjId) -> &ObjUpvalue {
        match &self.get(id).kind {
            ObjKind::Upvalue(u) => u,
            kind => unreachable!("expected upvalue, found {kind:?}"),
        }
    }

    /// The upvalue payload of `id`, mutably.
    pub fn upvalue_mut(&mut self, id: ObjId) -> &mut ObjUpvalue {
        match &mut self.get_mut(id).kind {
            ObjKind::Upvalue(u) => u,
            kind => unreachable!("expected upvalue, found {kind:?}"),
        }
    }

    /// The fiber payload of `id`.
    pub fn fiber(&self, id: ObjId) -> &ObjFiber {
        match &self.get(id).kind {
            ObjKind::Fiber(f) => f,
            kind => unreachable!("expected fiber, found {kind:?}"),
        }
    }

    /// The fiber payload of `id`, mutably.
    pub fn fiber_mut(&mut self, id: ObjId) -> &mut ObjFiber {
        match &mut self.get_mut(id).kind {
            ObjKind::Fiber(f) => f,
            kind => unreachable!("expected fiber, found {kind:?}"),
        }
    }

    /// The class payload of `id`.
    pub fn class(&self, id: ObjId) -> &ObjClass {
        match &self.get(id).kind {
            ObjKind::Class(c) => c,
            kind => unreachable!("expected class, found {kind:?}"),
        }
    }

    /// The class payload of `id`, mutably.
    pub fn class_mut(&mut self, id: ObjId) -> &mut ObjClass {
        match &mut self.get_mut(id).kind {
            ObjKind::Class(c) => c,
            kind => unreachable!("expected class, found {kind:?}"),
        }
    }

    /// The instance payload of `id`.
    pub fn instance(&self, id: ObjId) -> &ObjInstance {
        match &self.get(id).kind {
            ObjKind::Instance(i) => i,
            kind => unreachable!("expected instance, found {kind:?}"),
        }
    }

    /// The instance payload of `id`, mutably.
    pub fn instance_mut(&mut self, id: ObjId) -> &mut ObjInstance {
        match &mut self.get_mut(id).kind {
            ObjKind::Instance(i) => i,
            kind => unreachable!("expected instance, found {kind:?}"),
        }
    }

    /// The foreign payload of `id`, mutably.
    pub fn foreign_mut(&mut self, id: ObjId) -> &mut ObjForeign {
        match &mut self.get_mut(id).kind {
            ObjKind::Foreign(f) => f,
            kind => unreachable!("expected foreign, found {kind:?}"),
        }
    }

    /// Whether `id` is a string object.
    pub fn is_string(&self, id: ObjId) -> bool {
        matches!(self.get(id).kind, ObjKind::Str(_))
    }

    /// Whether `value` references a closure object.
    pub fn value_is_closure(&self, value: Value) -> bool {
        value
            .try_obj()
            .is_some_and(|id| matches!(self.get(id).kind, ObjKind::Closure(_)))
    }

    // -- temporary roots ----------------------------------------------------

    /// Protect an object through a multi-step construction.
    pub fn push_temp_root(&mut self, id: ObjId) {
        self.temp_roots.push(id);
    }

    /// Release the most recent temporary root.
    pub fn pop_temp_root(&mut self) {
        self.temp_roots.pop().expect("temp root underflow");
    }

    // -- handles ------------------------------------------------------------

    pub(crate) fn add_handle(&mut self, value: Value) -> usize {
        match self.handle_free.pop() {
            Some(index) => {
                self.handles[index] = Some(value);
                index
            }
            None => {
                self.handles.push(Some(value));
                self.handles.len() - 1
            }
        }
    }

    pub(crate) fn release_handle_at(&mut self, index: usize) {
        self.handles[index] = None;
        self.handle_free.push(index);
    }

    pub(crate) fn handle_value(&self, index: usize) -> Value {
        self.handles[index].expect("released handle")
    }

    pub(crate) fn handle_values(&self) -> Vec<Value> {
        self.handles.iter().flatten().copied().collect()
    }

    // -- equality -----------------------------------------------------------

    /// Deep equality: identity, plus structural equality for strings and
    /// ranges.
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        if a.same(b) {
            return true;
        }
        let (Some(a), Some(b)) = (a.try_obj(), b.try_obj()) else {
            return false;
        };
        match (&self.get(a).kind, &self.get(b).kind) {
            (ObjKind::Str(a), ObjKind::Str(b)) => a.hash == b.hash && a.bytes == b.bytes,
            (ObjKind::Range(a), ObjKind::Range(b)) => {
                a.from == b.from && a.to == b.to && a.is_inclusive == b.is_inclusive
            }
            _ => false,
        }
    }
}

/// Approximate heap footprint of an object, counting owned storage.
pub fn size_of_obj(obj: &Obj) -> usize {
    let base = std::mem::size_of::<Obj>();
    base + match &obj.kind {
        ObjKind::Str(s) => s.bytes.len() + 1,
        ObjKind::List(l) => l.elements.capacity() * std::mem::size_of::<Value>(),
        ObjKind::Map(m) => m.capacity() * std::mem::size_of::<Value>() * 2,
        ObjKind::Range(_) => 0,
        ObjKind::Module(m) => m.vars.count() * std::mem::size_of::<Value>() * 2,
        ObjKind::Fn(f) => f.data.code.len() + f.data.constants.len() * std::mem::size_of::<Value>(),
        ObjKind::Closure(c) => c.upvalues.len() * std::mem::size_of::<ObjId>(),
        ObjKind::Upvalue(_) => 0,
        ObjKind::Fiber(f) => {
            f.stack.capacity() * std::mem::size_of::<Value>()
                + f.frames.capacity() * std::mem::size_of::<crate::fiber::CallFrame>()
        }
        ObjKind::Class(c) => c.methods.capacity() * std::mem::size_of::<Method>(),
        ObjKind::Instance(i) => i.fields.len() * std::mem::size_of::<Value>(),
        ObjKind::Foreign(f) => f.data.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_heap() -> Heap {
        Heap::new(10 * 1024 * 1024, 1024 * 1024, 50)
    }

    #[test]
    fn test_alloc_threads_all_objects_list() {
        let mut heap = test_heap();
        let a = heap.alloc(Obj {
            header: ObjHeader { class: None, is_dark: false, next: None },
            kind: ObjKind::Str(ObjString::new(b"a".to_vec())),
        });
        let b = heap.alloc(Obj {
            header: ObjHeader { class: None, is_dark: false, next: None },
            kind: ObjKind::Str(ObjString::new(b"b".to_vec())),
        });
        assert_eq!(heap.first, Some(b));
        assert_eq!(heap.get(b).header.next, Some(a));
        assert_eq!(heap.get(a).header.next, None);
    }

    #[test]
    fn test_free_slot_reuse() {
        let mut heap = test_heap();
        let a = heap.alloc(Obj {
            header: ObjHeader { class: None, is_dark: false, next: None },
            kind: ObjKind::List(ObjList::default()),
        });
        heap.first = None;
        heap.free(a);
        let b = heap.alloc(Obj {
            header: ObjHeader { class: None, is_dark: false, next: None },
            kind: ObjKind::List(ObjList::default()),
        });
        assert_eq!(a.index(), b.index());
    }

    #[test]
    fn test_fnv1a_known_values() {
        // FNV-1a reference vectors.
        assert_eq!(fnv1a(b""), 2166136261);
        assert_eq!(fnv1a(b"a"), 0xe40c292c);
        assert_eq!(fnv1a(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_values_equal_strings() {
        let mut heap = test_heap();
        let a = heap.alloc(Obj {
            header: ObjHeader { class: None, is_dark: false, next: None },
            kind: ObjKind::Str(ObjString::new(b"hi".to_vec())),
        });
        let b = heap.alloc(Obj {
            header: ObjHeader { class: None, is_dark: false, next: None },
            kind: ObjKind::Str(ObjString::new(b"hi".to_vec())),
        });
        assert!(heap.values_equal(Value::obj(a), Value::obj(b)));
        assert!(!Value::obj(a).same(Value::obj(b)));
    }

    #[test]
    fn test_values_equal_ranges() {
        let mut heap = test_heap();
        let header = || ObjHeader { class: None, is_dark: false, next: None };
        let a = heap.alloc(Obj {
            header: header(),
            kind: ObjKind::Range(ObjRange { from: 1.0, to: 3.0, is_inclusive: true }),
        });
        let b = heap.alloc(Obj {
            header: header(),
            kind: ObjKind::Range(ObjRange { from: 1.0, to: 3.0, is_inclusive: true }),
        });
        let c = heap.alloc(Obj {
            header: header(),
            kind: ObjKind::Range(ObjRange { from: 1.0, to: 3.0, is_inclusive: false }),
        });
        assert!(heap.values_equal(Value::obj(a), Value::obj(b)));
        assert!(!heap.values_equal(Value::obj(a), Value::obj(c)));
    }

    #[test]
    fn test_handles_survive() {
        let mut heap = test_heap();
        let index = heap.add_handle(Value::num(7.0));
        assert!(heap.handle_value(index).same(Value::num(7.0)));
        heap.release_handle_at(index);
        let reused = heap.add_handle(Value::TRUE);
        assert_eq!(index, reused);
    }

    #[test]
    fn test_method_table_grows() {
        let mut class = ObjClass::bare("Thing", Some(0));
        assert!(matches!(class.method(5), Method::None));
        class.bind_method(5, Method::FunctionCall);
        assert!(matches!(class.method(5), Method::FunctionCall));
        assert!(matches!(class.method(4), Method::None));
    }
}
