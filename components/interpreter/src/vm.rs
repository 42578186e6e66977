//! The virtual machine.
//!
//! `Vm` owns the heap, the module registry, the global method-name symbol
//! table, and the currently running fiber. Compilation is delegated to the
//! pure compiler crate; the VM links the resulting prototypes into heap
//! objects, wraps them in closures, and executes them on fibers.

use std::rc::Rc;

use bytecode_system::{Constant, FnProto, Op, Operands};
use compiler::CompilerOptions;
use core_types::{ErrorKind, InterpretResult, ObjId, SymbolTable, Value, MAX_FIELDS};

use crate::config::Configuration;
use crate::fiber::{CallFrame, FiberState, ObjFiber};
use crate::heap::{
    FnData, Heap, Method, Obj, ObjClass, ObjClosure, ObjFn, ObjHeader, ObjInstance, ObjKind,
    ObjList, ObjModule, ObjRange, ObjString, ObjUpvalue, UpvalueState,
};
use crate::map::ObjMap;

/// Hard ceiling on call-frame depth; exceeding it is a runtime error
/// rather than unbounded memory growth.
pub(crate) const MAX_FRAMES: usize = 16384;

/// Cached identities of the classes the dispatcher needs constantly.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CoreClasses {
    pub object: Option<ObjId>,
    pub class: Option<ObjId>,
    pub bool_: Option<ObjId>,
    pub null: Option<ObjId>,
    pub num: Option<ObjId>,
    pub string: Option<ObjId>,
    pub list: Option<ObjId>,
    pub map: Option<ObjId>,
    pub range: Option<ObjId>,
    pub fiber: Option<ObjId>,
    pub fn_: Option<ObjId>,
}

impl CoreClasses {
    fn iter(&self) -> impl Iterator<Item = ObjId> {
        [
            self.object,
            self.class,
            self.bool_,
            self.null,
            self.num,
            self.string,
            self.list,
            self.map,
            self.range,
            self.fiber,
            self.fn_,
        ]
        .into_iter()
        .flatten()
    }
}

/// The slot window exposed to the host.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ApiStack {
    pub fiber: ObjId,
    pub start: usize,
}

/// A Siskin virtual machine instance.
///
/// Instances are fully independent; nothing is shared between them.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) config: Configuration,
    pub(crate) method_names: SymbolTable,
    /// Map from module-name string to module object. The core module is
    /// registered under the key `null`.
    pub(crate) modules: ObjId,
    pub(crate) core_module: ObjId,
    pub(crate) core: CoreClasses,
    /// The running fiber, if any.
    pub(crate) fiber: Option<ObjId>,
    /// The slot window for the embedding API.
    pub(crate) api_stack: Option<ApiStack>,
    /// The most recently imported module, for `ImportVariable`.
    pub(crate) last_module: Option<ObjId>,
}

impl Vm {
    /// Create a VM with the given configuration and a fully initialized
    /// core library.
    pub fn new(config: Configuration) -> Vm {
        let mut heap = Heap::new(
            config.initial_heap_size,
            config.min_heap_size,
            config.heap_growth_percent,
        );

        let modules = heap.alloc(Obj {
            header: ObjHeader { class: None, is_dark: false, next: None },
            kind: ObjKind::Map(ObjMap::new()),
        });
        let core_module = heap.alloc(Obj {
            header: ObjHeader { class: None, is_dark: false, next: None },
            kind: ObjKind::Module(Box::new(ObjModule {
                name: "core".to_string(),
                vars: Default::default(),
            })),
        });

        let mut vm = Vm {
            heap,
            config,
            method_names: SymbolTable::new(),
            modules,
            core_module,
            core: CoreClasses::default(),
            fiber: None,
            api_stack: None,
            last_module: None,
        };
        vm.map_set(vm.modules, Value::NULL, Value::obj(core_module));
        crate::core::initialize(&mut vm);
        vm
    }

    /// Compile and run `source` as the body of the named module.
    ///
    /// On success the result of the module body is available in slot 0.
    pub fn interpret(&mut self, module_name: &str, source: &str) -> InterpretResult {
        self.interpret_ext(module_name, source, false, true)
    }

    /// Compile and run `source` as a single expression.
    ///
    /// On success its value is available in slot 0. Used by REPLs;
    /// `print_errors` silences compile diagnostics so a caller can fall
    /// back to statement interpretation.
    pub fn interpret_expression(
        &mut self,
        module_name: &str,
        source: &str,
        print_errors: bool,
    ) -> InterpretResult {
        self.interpret_ext(module_name, source, true, print_errors)
    }

    fn interpret_ext(
        &mut self,
        module_name: &str,
        source: &str,
        is_expression: bool,
        print_errors: bool,
    ) -> InterpretResult {
        let module = self.get_or_create_module(module_name);
        let Some(closure) = self.compile_in_module(module, source, is_expression, print_errors)
        else {
            return InterpretResult::CompileError;
        };
        // compile_in_module leaves the closure temp-rooted.
        let fiber = self.new_fiber(closure);
        self.heap.pop_temp_root();
        self.heap.fiber_mut(fiber).state = FiberState::Root;
        self.api_stack = None;
        self.run_interpreter(fiber)
    }

    /// Compile without executing and return a disassembly listing, or
    /// `None` after reporting compile errors.
    pub fn compile_only(&mut self, module_name: &str, source: &str) -> Option<String> {
        let module = self.get_or_create_module(module_name);
        let module_name = self.heap.module(module).name.clone();
        let mut vars = std::mem::take(&mut self.heap.module_mut(module).vars);
        let options = CompilerOptions {
            module_name,
            is_expression: false,
            accepts_trailing_semicolons: self.config.accepts_trailing_semicolons,
        };
        let result = compiler::compile(&mut vars, &mut self.method_names, source, &options);
        self.heap.module_mut(module).vars = vars;
        match result {
            Ok(proto) => Some(bytecode_system::dump_proto(&proto)),
            Err(errors) => {
                for error in errors {
                    self.report_error(
                        ErrorKind::Compile,
                        &error.module,
                        error.line as i32,
                        &error.message,
                    );
                }
                None
            }
        }
    }

    /// Run the garbage collector now.
    pub fn collect_garbage(&mut self) {
        let mut roots: Vec<ObjId> = vec![self.modules, self.core_module];
        roots.extend(self.core.iter());
        roots.extend(self.fiber);
        roots.extend(self.api_stack.map(|api| api.fiber));
        roots.extend(self.last_module);
        self.heap.collect(roots);
    }

    /// Read-only access to the heap, mainly for tests and diagnostics.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Mutable access to the configuration, for installing callbacks after
    /// construction.
    pub fn config_mut(&mut self) -> &mut Configuration {
        &mut self.config
    }

    // -- diagnostics --------------------------------------------------------

    pub(crate) fn write(&mut self, text: &str) {
        match &mut self.config.write_fn {
            Some(f) => f(text),
            None => print!("{text}"),
        }
    }

    pub(crate) fn report_error(&mut self, kind: ErrorKind, module: &str, line: i32, message: &str) {
        match &mut self.config.error_fn {
            Some(f) => f(kind, module, line, message),
            None => match kind {
                ErrorKind::Compile => eprintln!("[{module} line {line}] [Error] {message}"),
                ErrorKind::Runtime => eprintln!("{message}"),
                ErrorKind::StackTrace => eprintln!("[{module} line {line}] in {message}"),
            },
        }
    }

    // -- allocation ---------------------------------------------------------

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    pub(crate) fn alloc_obj(&mut self, kind: ObjKind, class: Option<ObjId>) -> ObjId {
        self.maybe_collect();
        self.heap.alloc(Obj {
            header: ObjHeader { class, is_dark: false, next: None },
            kind,
        })
    }

    pub(crate) fn new_string(&mut self, bytes: Vec<u8>) -> ObjId {
        self.alloc_obj(ObjKind::Str(ObjString::new(bytes)), self.core.string)
    }

    /// Allocate a string value from text.
    pub(crate) fn string_value(&mut self, text: &str) -> Value {
        Value::obj(self.new_string(text.as_bytes().to_vec()))
    }

    pub(crate) fn new_list(&mut self, elements: Vec<Value>) -> ObjId {
        self.alloc_obj(ObjKind::List(ObjList { elements }), self.core.list)
    }

    pub(crate) fn new_map(&mut self) -> ObjId {
        self.alloc_obj(ObjKind::Map(ObjMap::new()), self.core.map)
    }

    pub(crate) fn new_range(&mut self, from: f64, to: f64, is_inclusive: bool) -> ObjId {
        self.alloc_obj(
            ObjKind::Range(ObjRange { from, to, is_inclusive }),
            self.core.range,
        )
    }

    pub(crate) fn new_closure(&mut self, fn_obj: ObjId, upvalues: Vec<ObjId>) -> ObjId {
        self.alloc_obj(ObjKind::Closure(ObjClosure { fn_obj, upvalues }), self.core.fn_)
    }

    pub(crate) fn new_upvalue(&mut self, state: UpvalueState) -> ObjId {
        self.alloc_obj(ObjKind::Upvalue(ObjUpvalue { state }), None)
    }

    pub(crate) fn new_fiber(&mut self, closure: ObjId) -> ObjId {
        let max_slots = {
            let fn_obj = self.heap.closure(closure).fn_obj;
            self.heap.fn_data(fn_obj).max_slots
        };
        self.alloc_obj(
            ObjKind::Fiber(Box::new(ObjFiber::new(closure, max_slots))),
            self.core.fiber,
        )
    }

    pub(crate) fn new_instance(&mut self, class: ObjId) -> ObjId {
        let num_fields = self.heap.class(class).num_fields.expect("not foreign");
        self.alloc_obj(
            ObjKind::Instance(ObjInstance { fields: vec![Value::NULL; num_fields] }),
            Some(class),
        )
    }

    // -- map convenience ----------------------------------------------------

    pub(crate) fn map_get(&self, map: ObjId, key: Value) -> Option<Value> {
        match &self.heap.get(map).kind {
            ObjKind::Map(m) => m.get(&self.heap, key),
            kind => unreachable!("expected map, found {kind:?}"),
        }
    }

    pub(crate) fn map_set(&mut self, map: ObjId, key: Value, value: Value) {
        let mut taken = self.take_map(map);
        let before = taken.capacity();
        taken.insert(&self.heap, key, value);
        let grown = taken.capacity().saturating_sub(before);
        self.put_map(map, taken);
        if grown > 0 {
            self.heap
                .add_bytes(grown * std::mem::size_of::<Value>() * 2);
        }
    }

    pub(crate) fn map_remove(&mut self, map: ObjId, key: Value) -> Option<Value> {
        let mut taken = self.take_map(map);
        let removed = taken.remove(&self.heap, key);
        self.put_map(map, taken);
        removed
    }

    pub(crate) fn map_ref(&self, map: ObjId) -> &ObjMap {
        match &self.heap.get(map).kind {
            ObjKind::Map(m) => m,
            kind => unreachable!("expected map, found {kind:?}"),
        }
    }

    pub(crate) fn map_clear(&mut self, map: ObjId) {
        match &mut self.heap.get_mut(map).kind {
            ObjKind::Map(m) => m.clear(),
            kind => unreachable!("expected map, found {kind:?}"),
        }
    }

    fn take_map(&mut self, map: ObjId) -> ObjMap {
        match &mut self.heap.get_mut(map).kind {
            ObjKind::Map(m) => std::mem::take(m),
            kind => unreachable!("expected map, found {kind:?}"),
        }
    }

    fn put_map(&mut self, map: ObjId, value: ObjMap) {
        match &mut self.heap.get_mut(map).kind {
            ObjKind::Map(m) => *m = value,
            kind => unreachable!("expected map, found {kind:?}"),
        }
    }

    // -- modules ------------------------------------------------------------

    /// Find or create the module with the given name, seeding a fresh one
    /// with the core module's variables.
    pub(crate) fn get_or_create_module(&mut self, name: &str) -> ObjId {
        let key_id = self.new_string(name.as_bytes().to_vec());
        self.heap.push_temp_root(key_id);
        let key = Value::obj(key_id);

        if let Some(existing) = self.map_get(self.modules, key) {
            self.heap.pop_temp_root();
            return existing.as_obj();
        }

        let module = self.alloc_obj(
            ObjKind::Module(Box::new(ObjModule {
                name: name.to_string(),
                vars: Default::default(),
            })),
            None,
        );
        self.heap.push_temp_root(module);

        // Every module starts with the core module's variables in scope.
        let core_vars: Vec<(String, Value)> = self
            .heap
            .module(self.core_module)
            .vars
            .iter()
            .map(|(_, var_name, value)| (var_name.to_string(), value))
            .collect();
        for (var_name, value) in core_vars {
            self.heap
                .module_mut(module)
                .vars
                .define(&var_name, value)
                .expect("fresh module cannot collide");
        }

        self.map_set(self.modules, key, Value::obj(module));
        self.heap.pop_temp_root();
        self.heap.pop_temp_root();
        module
    }

    /// Look up a loaded module by name.
    pub(crate) fn find_module(&mut self, name: &str) -> Option<ObjId> {
        let key_id = self.new_string(name.as_bytes().to_vec());
        let found = self.map_get(self.modules, Value::obj(key_id));
        found.map(Value::as_obj)
    }

    /// Compile source into a module and wrap the result in a closure.
    ///
    /// Returns `None` after reporting compile errors. On success the
    /// returned closure is protected by a temporary root the caller must
    /// pop once it is otherwise reachable.
    pub(crate) fn compile_in_module(
        &mut self,
        module: ObjId,
        source: &str,
        is_expression: bool,
        print_errors: bool,
    ) -> Option<ObjId> {
        let module_name = self.heap.module(module).name.clone();
        let mut vars = std::mem::take(&mut self.heap.module_mut(module).vars);
        let options = CompilerOptions {
            module_name,
            is_expression,
            accepts_trailing_semicolons: self.config.accepts_trailing_semicolons,
        };
        let result = compiler::compile(&mut vars, &mut self.method_names, source, &options);
        self.heap.module_mut(module).vars = vars;

        match result {
            Err(errors) => {
                if print_errors {
                    for error in errors {
                        self.report_error(
                            ErrorKind::Compile,
                            &error.module,
                            error.line as i32,
                            &error.message,
                        );
                    }
                }
                None
            }
            Ok(proto) => {
                let fn_obj = self.link_proto(&proto, module);
                self.heap.push_temp_root(fn_obj);
                let closure = self.new_closure(fn_obj, Vec::new());
                self.heap.pop_temp_root();
                self.heap.push_temp_root(closure);
                Some(closure)
            }
        }
    }

    // -- prototype linking --------------------------------------------------

    /// Link a compiled prototype into heap objects.
    ///
    /// Collection is paused for the duration: the tree under construction
    /// has no root until the caller stores the result.
    pub(crate) fn link_proto(&mut self, proto: &FnProto, module: ObjId) -> ObjId {
        self.heap.pause_gc();
        let fn_obj = self.link_proto_inner(proto, module);
        self.heap.resume_gc();
        fn_obj
    }

    fn link_proto_inner(&mut self, proto: &FnProto, module: ObjId) -> ObjId {
        let mut constants = Vec::with_capacity(proto.constants.len());
        for constant in &proto.constants {
            let value = self.link_constant(constant, module);
            constants.push(value);
        }
        let data = FnData {
            code: proto.code.clone(),
            constants,
            module,
            max_slots: proto.max_slots,
            num_upvalues: proto.num_upvalues,
            arity: proto.arity,
            name: proto.debug.name.clone(),
            source_lines: proto.debug.source_lines.clone(),
        };
        self.alloc_obj(ObjKind::Fn(ObjFn { data: Rc::new(data) }), self.core.fn_)
    }

    fn link_constant(&mut self, constant: &Constant, module: ObjId) -> Value {
        match constant {
            Constant::Null => Value::NULL,
            Constant::Bool(b) => Value::from_bool(*b),
            Constant::Num(n) => Value::num(*n),
            Constant::Str(bytes) => Value::obj(self.new_string(bytes.clone())),
            Constant::Fn(inner) => Value::obj(self.link_proto_inner(inner, module)),
            Constant::Map(entries) => {
                let map = self.new_map();
                for (key, value) in entries {
                    let key = self.link_constant(key, module);
                    let value = self.link_constant(value, module);
                    self.map_set(map, key, value);
                }
                Value::obj(map)
            }
            Constant::List(items) => {
                let elements = items
                    .iter()
                    .map(|item| self.link_constant(item, module))
                    .collect();
                Value::obj(self.new_list(elements))
            }
        }
    }

    // -- classes ------------------------------------------------------------

    /// The class of any value.
    pub(crate) fn class_of(&self, value: Value) -> ObjId {
        if value.is_num() {
            return self.core.num.expect("core initialized");
        }
        if value.is_bool() {
            return self.core.bool_.expect("core initialized");
        }
        if value.is_null() {
            return self.core.null.expect("core initialized");
        }
        let id = value.as_obj();
        match self.heap.get(id).header.class {
            Some(class) => class,
            None => self.core.object.expect("core initialized"),
        }
    }

    /// Create a class and its metaclass, wiring both into the hierarchy.
    pub(crate) fn new_class(
        &mut self,
        superclass: ObjId,
        num_fields: Option<usize>,
        name: &str,
    ) -> ObjId {
        let metaclass_name = format!("{name} metaclass");
        let metaclass = self.alloc_obj(
            ObjKind::Class(Box::new(ObjClass::bare(&metaclass_name, Some(0)))),
            self.core.class,
        );
        self.heap.push_temp_root(metaclass);
        self.bind_superclass(metaclass, self.core.class.expect("core initialized"));

        let class = self.alloc_obj(
            ObjKind::Class(Box::new(ObjClass::bare(name, num_fields))),
            Some(metaclass),
        );
        self.heap.push_temp_root(class);
        self.bind_superclass(class, superclass);
        self.heap.pop_temp_root();
        self.heap.pop_temp_root();
        class
    }

    /// Wire a superclass: record it, include its fields, and copy its
    /// methods down so dispatch is a single table load.
    pub(crate) fn bind_superclass(&mut self, class: ObjId, superclass: ObjId) {
        let (super_methods, super_fields) = {
            let superclass = self.heap.class(superclass);
            (superclass.methods.clone(), superclass.num_fields.unwrap_or(0))
        };
        let class_obj = self.heap.class_mut(class);
        class_obj.superclass = Some(superclass);
        if let Some(fields) = &mut class_obj.num_fields {
            *fields += super_fields;
        }
        class_obj.methods = super_methods;
    }

    pub(crate) fn validate_superclass(
        &self,
        name: &str,
        superclass_value: Value,
        num_fields: Option<usize>,
    ) -> Result<ObjId, String> {
        let id = superclass_value
            .try_obj()
            .filter(|id| matches!(self.heap.get(*id).kind, ObjKind::Class(_)))
            .ok_or_else(|| format!("Class '{name}' cannot inherit from a non-class object."))?;

        let builtin = [
            self.core.class,
            self.core.bool_,
            self.core.null,
            self.core.num,
            self.core.string,
            self.core.list,
            self.core.map,
            self.core.range,
            self.core.fiber,
            self.core.fn_,
        ];
        let superclass = self.heap.class(id);
        if builtin.contains(&Some(id)) {
            return Err(format!(
                "Class '{name}' cannot inherit from built-in class '{}'.",
                superclass.name
            ));
        }
        if superclass.num_fields.is_none() {
            return Err(format!(
                "Class '{name}' cannot inherit from foreign class '{}'.",
                superclass.name
            ));
        }
        let super_fields = superclass.num_fields.unwrap_or(0);
        if num_fields.is_none() && super_fields > 0 {
            return Err(format!(
                "Foreign class '{name}' may not inherit from a class with fields."
            ));
        }
        if num_fields.unwrap_or(0) + super_fields > MAX_FIELDS {
            return Err(format!(
                "Class '{name}' may not have more than {MAX_FIELDS} fields, including inherited ones."
            ));
        }
        Ok(id)
    }

    /// Execute the `Class`/`ForeignClass` instruction: consume the name
    /// and superclass from the stack and leave the new class in their
    /// place.
    pub(crate) fn create_class(
        &mut self,
        fiber: ObjId,
        num_fields: Option<usize>,
        module: ObjId,
    ) -> Result<(), String> {
        let len = self.heap.fiber(fiber).stack.len();
        let superclass_value = self.heap.fiber(fiber).stack[len - 1];
        let name_value = self.heap.fiber(fiber).stack[len - 2];
        let name = self.heap.string(name_value.as_obj()).as_text().into_owned();

        let superclass = self.validate_superclass(&name, superclass_value, num_fields)?;
        let class = self.new_class(superclass, num_fields, &name);

        if num_fields.is_none() {
            self.heap.push_temp_root(class);
            let bound = self.bind_foreign_class(class, module);
            self.heap.pop_temp_root();
            bound?;
        }

        let f = self.heap.fiber_mut(fiber);
        f.stack.pop();
        let top = f.stack.len() - 1;
        f.stack[top] = Value::obj(class);
        Ok(())
    }

    /// Attach foreign allocate/finalize callbacks to a freshly created
    /// foreign class.
    pub(crate) fn bind_foreign_class(&mut self, class: ObjId, module: ObjId) -> Result<(), String> {
        let class_name = self.heap.class(class).name.clone();
        let module_name = self.heap.module(module).name.clone();
        let methods = self
            .config
            .bind_foreign_class_fn
            .as_mut()
            .and_then(|f| f(&module_name, &class_name));
        match methods {
            Some(methods) => {
                self.heap.class_mut(class).foreign_methods = Some(methods);
                Ok(())
            }
            None => Err(format!(
                "Could not configure foreign class '{class_name}' in module '{module_name}'."
            )),
        }
    }

    /// Bind a method to a class (or its metaclass for statics).
    pub(crate) fn bind_method(
        &mut self,
        is_static: bool,
        symbol: usize,
        module: ObjId,
        class: ObjId,
        method_value: Value,
    ) -> Result<(), String> {
        let class_name = self.heap.class(class).name.clone();
        let id = method_value.as_obj();

        let method = if self.heap.is_string(id) {
            let signature = self.heap.string(id).as_text().into_owned();
            let module_name = self.heap.module(module).name.clone();
            let bound = self
                .config
                .bind_foreign_method_fn
                .as_mut()
                .and_then(|f| f(&module_name, &class_name, is_static, &signature));
            match bound {
                Some(f) => Method::Foreign(f),
                None => {
                    return Err(format!(
                        "Could not find foreign method '{signature}' for class {class_name} in module '{module_name}'."
                    ));
                }
            }
        } else {
            let fn_obj = self.heap.closure(id).fn_obj;
            self.bind_method_code(class, fn_obj);
            Method::Block(id)
        };

        let target = if is_static { self.class_of(Value::obj(class)) } else { class };
        self.heap.class_mut(target).bind_method(symbol, method);
        Ok(())
    }

    /// Patch a freshly bound method body for its class: fill in superclass
    /// constants for super calls and shift field offsets past the
    /// inherited fields. Recurses into nested functions.
    pub(crate) fn bind_method_code(&mut self, class: ObjId, fn_obj: ObjId) {
        let superclass = self.heap.class(class).superclass;
        let field_offset = superclass
            .map(|superclass| self.heap.class(superclass).num_fields.unwrap_or(0))
            .unwrap_or(0);
        let superclass_value = superclass.map(Value::obj).unwrap_or(Value::NULL);

        let mut data = self.heap.fn_data(fn_obj);
        let mut nested: Vec<ObjId> = Vec::new();
        {
            let data = Rc::make_mut(&mut data);
            let mut offset = 0;
            while offset < data.code.len() {
                let byte = data.code[offset];
                let op = Op::from_byte(byte).expect("valid bytecode");
                match op {
                    Op::LoadField | Op::StoreField | Op::LoadFieldThis | Op::StoreFieldThis => {
                        data.code[offset + 1] += field_offset as u8;
                    }
                    Op::Closure => {
                        let constant = read_short(&data.code, offset + 1) as usize;
                        if let Some(inner) = data.constants[constant].try_obj() {
                            nested.push(inner);
                        }
                    }
                    _ if (Op::Super0 as u8..=Op::Super16 as u8).contains(&byte) => {
                        let constant = read_short(&data.code, offset + 3) as usize;
                        data.constants[constant] = superclass_value;
                    }
                    _ => {}
                }
                offset += 1 + operand_width(self, data, offset, op);
            }
        }
        match &mut self.heap.get_mut(fn_obj).kind {
            ObjKind::Fn(f) => f.data = data,
            kind => unreachable!("expected function, found {kind:?}"),
        }

        for inner in nested {
            self.bind_method_code(class, inner);
        }
    }

    // -- fibers and errors --------------------------------------------------

    pub(crate) fn current_fiber(&self) -> ObjId {
        self.fiber.expect("no running fiber")
    }

    /// Set the current fiber's error to a fresh string.
    pub(crate) fn set_error_str(&mut self, message: &str) {
        let error = self.string_value(message);
        if let Some(fiber) = self.fiber {
            self.heap.fiber_mut(fiber).error = error;
        }
    }

    /// Unwind after a fiber error: the nearest `try` ancestor catches it;
    /// otherwise the trace is reported and execution stops.
    pub(crate) fn raise_runtime_error(&mut self) {
        let errored = self.current_fiber();
        let error = self.heap.fiber(errored).error;

        let mut current = Some(errored);
        while let Some(id) = current {
            // Every fiber along the chain is aborted with the same error.
            self.heap.fiber_mut(id).error = error;

            if self.heap.fiber(id).state == FiberState::Try {
                let caller = self.heap.fiber(id).caller;
                if let Some(caller) = caller {
                    // The caller's try call returns the error value.
                    let stack = &mut self.heap.fiber_mut(caller).stack;
                    let top = stack.len() - 1;
                    stack[top] = error;
                }
                self.fiber = caller;
                return;
            }

            let caller = self.heap.fiber(id).caller;
            self.heap.fiber_mut(id).caller = None;
            current = caller;
        }

        self.print_stack_trace(errored);
        self.fiber = None;
    }

    fn print_stack_trace(&mut self, fiber: ObjId) {
        let error = self.heap.fiber(fiber).error;
        let message = match error.try_obj() {
            Some(id) if self.heap.is_string(id) => self.heap.string(id).as_text().into_owned(),
            _ => "[error object]".to_string(),
        };
        self.report_error(ErrorKind::Runtime, "", -1, &message);

        let frames: Vec<CallFrame> = self.heap.fiber(fiber).frames.iter().rev().copied().collect();
        for frame in frames {
            let fn_obj = self.heap.closure(frame.closure).fn_obj;
            let data = self.heap.fn_data(fn_obj);
            let module_name = self.heap.module(data.module).name.clone();
            let line = data
                .source_lines
                .get(frame.ip.saturating_sub(1))
                .copied()
                .unwrap_or(0);
            self.report_error(ErrorKind::StackTrace, &module_name, line as i32, &data.name);
        }
    }

    // -- upvalues -----------------------------------------------------------

    /// Find or create the open upvalue for a stack slot, keeping the
    /// fiber's list sorted by descending slot index.
    pub(crate) fn capture_upvalue(&mut self, fiber: ObjId, slot: usize) -> ObjId {
        let mut insert_at = None;
        {
            let open = &self.heap.fiber(fiber).open_upvalues;
            for (position, &upvalue) in open.iter().enumerate() {
                match self.heap.upvalue(upvalue).state {
                    UpvalueState::Open { slot: existing, .. } if existing == slot => {
                        return upvalue;
                    }
                    UpvalueState::Open { slot: existing, .. } if existing < slot => {
                        insert_at = Some(position);
                        break;
                    }
                    _ => {}
                }
            }
        }
        let created = self.new_upvalue(UpvalueState::Open { fiber, slot });
        let open = &mut self.heap.fiber_mut(fiber).open_upvalues;
        match insert_at {
            Some(position) => open.insert(position, created),
            None => open.push(created),
        }
        created
    }

    /// Close every open upvalue at or above `from_slot`: move the value
    /// into the upvalue itself.
    pub(crate) fn close_upvalues(&mut self, fiber: ObjId, from_slot: usize) {
        loop {
            let Some(&head) = self.heap.fiber(fiber).open_upvalues.first() else {
                break;
            };
            let slot = match self.heap.upvalue(head).state {
                UpvalueState::Open { slot, .. } => slot,
                UpvalueState::Closed(_) => unreachable!("closed upvalue in open list"),
            };
            if slot < from_slot {
                break;
            }
            let value = self.heap.fiber(fiber).stack[slot];
            self.heap.upvalue_mut(head).state = UpvalueState::Closed(value);
            self.heap.fiber_mut(fiber).open_upvalues.remove(0);
        }
    }
}

fn read_short(code: &[u8], offset: usize) -> u16 {
    (code[offset] as u16) << 8 | code[offset + 1] as u16
}

/// Operand width of the instruction at `offset` in linked code.
fn operand_width(vm: &Vm, data: &FnData, offset: usize, op: Op) -> usize {
    match op.operands() {
        Operands::None => 0,
        Operands::Byte => 1,
        Operands::Short => 2,
        Operands::ShortShort => 4,
        Operands::ClosureSpec => {
            let constant = read_short(&data.code, offset + 1) as usize;
            let num_upvalues = data.constants[constant]
                .try_obj()
                .map(|id| vm.heap.fn_data(id).num_upvalues)
                .unwrap_or(0);
            2 + num_upvalues * 2
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_vm_has_core_classes() {
        let vm = Vm::new(Configuration::default());
        assert!(vm.core.object.is_some());
        assert!(vm.core.class.is_some());
        assert!(vm.core.num.is_some());
        assert!(vm.core.string.is_some());
        assert!(vm.core.fiber.is_some());
    }

    #[test]
    fn test_metaclass_cycle() {
        let vm = Vm::new(Configuration::default());
        let object = vm.core.object.unwrap();
        let class = vm.core.class.unwrap();

        // Class's class is Class itself.
        assert_eq!(vm.heap.get(class).header.class, Some(class));

        // Object's metaclass is a subclass of Class.
        let object_meta = vm.heap.get(object).header.class.unwrap();
        assert_eq!(vm.heap.class(object_meta).superclass, Some(class));
        assert_eq!(vm.heap.get(object_meta).header.class, Some(class));
    }

    #[test]
    fn test_class_of_immediates() {
        let vm = Vm::new(Configuration::default());
        assert_eq!(vm.class_of(Value::num(1.0)), vm.core.num.unwrap());
        assert_eq!(vm.class_of(Value::TRUE), vm.core.bool_.unwrap());
        assert_eq!(vm.class_of(Value::NULL), vm.core.null.unwrap());
    }

    #[test]
    fn test_every_object_has_a_class_after_init() {
        let vm = Vm::new(Configuration::default());
        for id in vm.heap.iter_ids() {
            let obj = vm.heap.get(id);
            match obj.kind {
                // Modules and upvalues are never dispatch receivers.
                ObjKind::Module(_) | ObjKind::Upvalue(_) => {}
                ObjKind::Map(_) if id == vm.modules => {}
                _ => assert!(
                    obj.header.class.is_some(),
                    "object {id:?} has no class: {:?}",
                    obj.kind
                ),
            }
        }
    }

    #[test]
    fn test_get_or_create_module_copies_core_variables() {
        let mut vm = Vm::new(Configuration::default());
        let module = vm.get_or_create_module("main");
        assert!(vm.heap.module(module).vars.lookup("Object").is_some());
        assert!(vm.heap.module(module).vars.lookup("List").is_some());
        assert!(vm.heap.module(module).vars.lookup("System").is_some());

        // Idempotent.
        let again = vm.get_or_create_module("main");
        assert_eq!(module, again);
    }

    #[test]
    fn test_collect_garbage_is_idempotent() {
        let mut vm = Vm::new(Configuration::default());
        // The first collection may reclaim bootstrap leftovers.
        vm.collect_garbage();
        let live = vm.heap.iter_ids().count();
        let bytes = vm.heap.bytes_allocated();
        vm.collect_garbage();
        assert_eq!(vm.heap.iter_ids().count(), live);
        assert_eq!(vm.heap.bytes_allocated(), bytes);
        assert!(vm.core.object.is_some());
    }
}
