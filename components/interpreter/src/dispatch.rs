//! The bytecode dispatch loop.
//!
//! Executes in the currently selected fiber. The hot state (current frame
//! and the running function's data) is held in locals and re-materialized
//! after anything that can change the frame stack or switch fibers: calls,
//! returns, imports, fiber primitives, and runtime-error unwinding.

use std::rc::Rc;

use core_types::{InterpretResult, ObjId, Value};

use bytecode_system::Op;

use crate::config::PrimitiveResult;
use crate::fiber::CallFrame;
use crate::heap::{FnData, Method, ObjKind, UpvalueState};
use crate::vm::{ApiStack, Vm, MAX_FRAMES};

/// What `import_module` handed back.
pub(crate) enum ImportResult {
    /// The module was already loaded; its value is ready to push.
    Existing(Value),
    /// A freshly compiled module body to execute (temp-rooted).
    Run(ObjId),
}

impl Vm {
    /// Run a fiber to completion (or until the VM is suspended).
    pub(crate) fn run_interpreter(&mut self, start_fiber: ObjId) -> InterpretResult {
        self.fiber = Some(start_fiber);
        let mut fiber = start_fiber;
        let (mut frame, mut data) = self.load_frame(fiber);

        macro_rules! runtime_error {
            () => {{
                self.store_frame(fiber, frame);
                self.raise_runtime_error();
                match self.fiber {
                    None => return InterpretResult::RuntimeError,
                    Some(next) => {
                        fiber = next;
                        (frame, data) = self.load_frame(fiber);
                        continue;
                    }
                }
            }};
        }

        loop {
            let byte = data.code[frame.ip];
            frame.ip += 1;
            let op = Op::from_byte(byte).expect("compiler emits valid opcodes");

            match op {
                Op::Constant => {
                    let index = read_short(&data, &mut frame);
                    let value = data.constants[index];
                    self.heap.fiber_mut(fiber).stack.push(value);
                }
                Op::Null => self.heap.fiber_mut(fiber).stack.push(Value::NULL),
                Op::False => self.heap.fiber_mut(fiber).stack.push(Value::FALSE),
                Op::True => self.heap.fiber_mut(fiber).stack.push(Value::TRUE),

                Op::LoadLocal0
                | Op::LoadLocal1
                | Op::LoadLocal2
                | Op::LoadLocal3
                | Op::LoadLocal4
                | Op::LoadLocal5
                | Op::LoadLocal6
                | Op::LoadLocal7
                | Op::LoadLocal8 => {
                    let slot = frame.stack_start + op.local_slot();
                    let f = self.heap.fiber_mut(fiber);
                    let value = f.stack[slot];
                    f.stack.push(value);
                }
                Op::LoadLocal => {
                    let slot = frame.stack_start + read_byte(&data, &mut frame);
                    let f = self.heap.fiber_mut(fiber);
                    let value = f.stack[slot];
                    f.stack.push(value);
                }
                Op::StoreLocal => {
                    let slot = frame.stack_start + read_byte(&data, &mut frame);
                    let f = self.heap.fiber_mut(fiber);
                    let value = *f.stack.last().expect("store needs a value");
                    f.stack[slot] = value;
                }

                Op::LoadUpvalue => {
                    let index = read_byte(&data, &mut frame);
                    let upvalue = self.heap.closure(frame.closure).upvalues[index];
                    let value = match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open { fiber: owner, slot } => {
                            self.heap.fiber(owner).stack[slot]
                        }
                        UpvalueState::Closed(value) => value,
                    };
                    self.heap.fiber_mut(fiber).stack.push(value);
                }
                Op::StoreUpvalue => {
                    let index = read_byte(&data, &mut frame);
                    let upvalue = self.heap.closure(frame.closure).upvalues[index];
                    let value = *self.heap.fiber(fiber).stack.last().expect("store needs a value");
                    match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open { fiber: owner, slot } => {
                            self.heap.fiber_mut(owner).stack[slot] = value;
                        }
                        UpvalueState::Closed(_) => {
                            self.heap.upvalue_mut(upvalue).state = UpvalueState::Closed(value);
                        }
                    }
                }

                Op::LoadModuleVar => {
                    let slot = read_short(&data, &mut frame);
                    let value = self.heap.module(data.module).vars.value(slot);
                    self.heap.fiber_mut(fiber).stack.push(value);
                }
                Op::StoreModuleVar => {
                    let slot = read_short(&data, &mut frame);
                    let value = *self.heap.fiber(fiber).stack.last().expect("store needs a value");
                    self.heap.module_mut(data.module).vars.set_value(slot, value);
                }

                Op::LoadFieldThis => {
                    let field = read_byte(&data, &mut frame);
                    let receiver = self.heap.fiber(fiber).stack[frame.stack_start];
                    match self.instance_field(receiver, field) {
                        Some(value) => self.heap.fiber_mut(fiber).stack.push(value),
                        None => {
                            self.set_error_str("Only instances have fields.");
                            runtime_error!();
                        }
                    }
                }
                Op::StoreFieldThis => {
                    let field = read_byte(&data, &mut frame);
                    let receiver = self.heap.fiber(fiber).stack[frame.stack_start];
                    let value = *self.heap.fiber(fiber).stack.last().expect("store needs a value");
                    if !self.store_instance_field(receiver, field, value) {
                        self.set_error_str("Only instances have fields.");
                        runtime_error!();
                    }
                }
                Op::LoadField => {
                    let field = read_byte(&data, &mut frame);
                    let receiver = self.heap.fiber_mut(fiber).stack.pop().expect("field receiver");
                    match self.instance_field(receiver, field) {
                        Some(value) => self.heap.fiber_mut(fiber).stack.push(value),
                        None => {
                            self.set_error_str("Only instances have fields.");
                            runtime_error!();
                        }
                    }
                }
                Op::StoreField => {
                    let field = read_byte(&data, &mut frame);
                    let receiver = self.heap.fiber_mut(fiber).stack.pop().expect("field receiver");
                    let value = *self.heap.fiber(fiber).stack.last().expect("store needs a value");
                    if !self.store_instance_field(receiver, field, value) {
                        self.set_error_str("Only instances have fields.");
                        runtime_error!();
                    }
                }

                Op::Pop => {
                    self.heap.fiber_mut(fiber).stack.pop();
                }

                op if (Op::Call0 as u8..=Op::Call16 as u8).contains(&byte) => {
                    let symbol = read_short(&data, &mut frame);
                    let num_args = op.call_args() + 1;
                    let args_start = self.heap.fiber(fiber).stack.len() - num_args;
                    let receiver = self.heap.fiber(fiber).stack[args_start];
                    let class = self.class_of(receiver);

                    match self.complete_call(fiber, &mut frame, class, symbol, args_start) {
                        CallOutcome::Inline => {}
                        CallOutcome::Reload => {
                            match self.fiber {
                                None => {
                                    self.api_stack = None;
                                    return InterpretResult::Success;
                                }
                                Some(next) => {
                                    fiber = next;
                                    (frame, data) = self.load_frame(fiber);
                                }
                            }
                        }
                        CallOutcome::Error => runtime_error!(),
                    }
                }

                op if (Op::Super0 as u8..=Op::Super16 as u8).contains(&byte) => {
                    let symbol = read_short(&data, &mut frame);
                    let superclass_slot = read_short(&data, &mut frame);
                    let num_args = op.super_args() + 1;
                    let args_start = self.heap.fiber(fiber).stack.len() - num_args;
                    let class = data.constants[superclass_slot].as_obj();

                    match self.complete_call(fiber, &mut frame, class, symbol, args_start) {
                        CallOutcome::Inline => {}
                        CallOutcome::Reload => {
                            match self.fiber {
                                None => {
                                    self.api_stack = None;
                                    return InterpretResult::Success;
                                }
                                Some(next) => {
                                    fiber = next;
                                    (frame, data) = self.load_frame(fiber);
                                }
                            }
                        }
                        CallOutcome::Error => runtime_error!(),
                    }
                }

                Op::Jump => {
                    let offset = read_short(&data, &mut frame);
                    frame.ip += offset;
                }
                Op::Loop => {
                    let offset = read_short(&data, &mut frame);
                    frame.ip -= offset;
                }
                Op::JumpIf => {
                    let offset = read_short(&data, &mut frame);
                    let condition = self.heap.fiber_mut(fiber).stack.pop().expect("condition");
                    if condition.is_falsy() {
                        frame.ip += offset;
                    }
                }
                Op::And => {
                    let offset = read_short(&data, &mut frame);
                    let condition = *self.heap.fiber(fiber).stack.last().expect("condition");
                    if condition.is_falsy() {
                        frame.ip += offset;
                    } else {
                        self.heap.fiber_mut(fiber).stack.pop();
                    }
                }
                Op::Or => {
                    let offset = read_short(&data, &mut frame);
                    let condition = *self.heap.fiber(fiber).stack.last().expect("condition");
                    if condition.is_falsy() {
                        self.heap.fiber_mut(fiber).stack.pop();
                    } else {
                        frame.ip += offset;
                    }
                }

                Op::CloseUpvalue => {
                    let top = self.heap.fiber(fiber).stack.len() - 1;
                    self.close_upvalues(fiber, top);
                    self.heap.fiber_mut(fiber).stack.pop();
                }

                Op::Return => {
                    let result = self.heap.fiber_mut(fiber).stack.pop().expect("return value");
                    self.close_upvalues(fiber, frame.stack_start);
                    self.heap.fiber_mut(fiber).frames.pop();

                    if self.heap.fiber(fiber).frames.is_empty() {
                        // The fiber is done.
                        match self.heap.fiber(fiber).caller {
                            None => {
                                let f = self.heap.fiber_mut(fiber);
                                f.stack.clear();
                                f.stack.push(result);
                                self.api_stack = Some(ApiStack { fiber, start: 0 });
                                return InterpretResult::Success;
                            }
                            Some(caller) => {
                                self.heap.fiber_mut(fiber).caller = None;
                                self.fiber = Some(caller);
                                let cf = self.heap.fiber_mut(caller);
                                let top = cf.stack.len() - 1;
                                cf.stack[top] = result;
                                fiber = caller;
                                (frame, data) = self.load_frame(fiber);
                            }
                        }
                    } else {
                        let f = self.heap.fiber_mut(fiber);
                        f.stack.truncate(frame.stack_start);
                        f.stack.push(result);
                        (frame, data) = self.load_frame(fiber);
                    }
                }

                Op::Closure => {
                    let constant = read_short(&data, &mut frame);
                    let fn_obj = data.constants[constant].as_obj();
                    let num_upvalues = self.heap.fn_data(fn_obj).num_upvalues;

                    let closure = self.new_closure(fn_obj, Vec::new());
                    self.heap.fiber_mut(fiber).stack.push(Value::obj(closure));

                    for _ in 0..num_upvalues {
                        let is_local = read_byte(&data, &mut frame) == 1;
                        let index = read_byte(&data, &mut frame);
                        let upvalue = if is_local {
                            self.capture_upvalue(fiber, frame.stack_start + index)
                        } else {
                            self.heap.closure(frame.closure).upvalues[index]
                        };
                        match &mut self.heap.get_mut(closure).kind {
                            ObjKind::Closure(c) => c.upvalues.push(upvalue),
                            kind => unreachable!("expected closure, found {kind:?}"),
                        }
                    }
                }

                Op::Construct => {
                    let class_value = self.heap.fiber(fiber).stack[frame.stack_start];
                    let class = class_value.as_obj();
                    let instance = self.new_instance(class);
                    self.heap.fiber_mut(fiber).stack[frame.stack_start] = Value::obj(instance);
                }

                Op::ForeignConstruct => {
                    let class_value = self.heap.fiber(fiber).stack[frame.stack_start];
                    let class = class_value.as_obj();
                    let allocate = self.heap.class(class).foreign_methods.map(|m| m.allocate);
                    match allocate {
                        Some(allocate) => {
                            self.api_stack = Some(ApiStack { fiber, start: frame.stack_start });
                            allocate(self);
                            self.api_stack = None;
                            if self.heap.fiber(fiber).has_error() {
                                runtime_error!();
                            }
                        }
                        None => {
                            let name = self.heap.class(class).name.clone();
                            self.set_error_str(&format!(
                                "Foreign class '{name}' has no allocator."
                            ));
                            runtime_error!();
                        }
                    }
                }

                Op::Class | Op::ForeignClass => {
                    let num_fields = if op == Op::Class {
                        Some(read_byte(&data, &mut frame))
                    } else {
                        None
                    };
                    if let Err(message) = self.create_class(fiber, num_fields, data.module) {
                        self.set_error_str(&message);
                        runtime_error!();
                    }
                }

                Op::EndClass => {
                    let class = self.heap.fiber_mut(fiber).stack.pop().expect("class");
                    let attributes = self.heap.fiber_mut(fiber).stack.pop().expect("attributes");
                    self.heap.class_mut(class.as_obj()).attributes = attributes;
                }

                Op::MethodInstance | Op::MethodStatic => {
                    let symbol = read_short(&data, &mut frame);
                    let stack_len = self.heap.fiber(fiber).stack.len();
                    let class = self.heap.fiber(fiber).stack[stack_len - 1].as_obj();
                    let method = self.heap.fiber(fiber).stack[stack_len - 2];
                    let is_static = op == Op::MethodStatic;

                    match self.bind_method(is_static, symbol, data.module, class, method) {
                        Ok(()) => {
                            let f = self.heap.fiber_mut(fiber);
                            f.stack.pop();
                            f.stack.pop();
                        }
                        Err(message) => {
                            self.set_error_str(&message);
                            runtime_error!();
                        }
                    }
                }

                Op::EndModule => {
                    self.last_module = Some(data.module);
                    self.heap.fiber_mut(fiber).stack.push(Value::NULL);
                }

                Op::ImportModule => {
                    let constant = read_short(&data, &mut frame);
                    let name_value = data.constants[constant];
                    self.store_frame(fiber, frame);

                    match self.import_module(data.module, name_value) {
                        Err(()) => runtime_error!(),
                        Ok(ImportResult::Existing(value)) => {
                            self.heap.fiber_mut(fiber).stack.push(value);
                        }
                        Ok(ImportResult::Run(closure)) => {
                            self.heap.fiber_mut(fiber).stack.push(Value::obj(closure));
                            self.heap.pop_temp_root();
                            let stack_start = self.heap.fiber(fiber).stack.len() - 1;
                            if let Err(message) = self.push_frame(fiber, closure, stack_start) {
                                self.set_error_str(message);
                                runtime_error!();
                            }
                            (frame, data) = self.load_frame(fiber);
                        }
                    }
                }

                Op::ImportVariable => {
                    let constant = read_short(&data, &mut frame);
                    let name_value = data.constants[constant];
                    match self.import_variable(name_value) {
                        Ok(value) => self.heap.fiber_mut(fiber).stack.push(value),
                        Err(message) => {
                            self.set_error_str(&message);
                            runtime_error!();
                        }
                    }
                }

                Op::End => unreachable!("End is never executed"),

                other => unreachable!("unhandled opcode {other:?}"),
            }
        }
    }

    fn load_frame(&self, fiber: ObjId) -> (CallFrame, Rc<FnData>) {
        let frame = *self
            .heap
            .fiber(fiber)
            .frames
            .last()
            .expect("fiber has a frame");
        let data = self.heap.fn_data(self.heap.closure(frame.closure).fn_obj);
        (frame, data)
    }

    fn store_frame(&mut self, fiber: ObjId, frame: CallFrame) {
        *self
            .heap
            .fiber_mut(fiber)
            .frames
            .last_mut()
            .expect("fiber has a frame") = frame;
    }

    fn instance_field(&self, receiver: Value, field: usize) -> Option<Value> {
        let id = receiver.try_obj()?;
        match &self.heap.get(id).kind {
            ObjKind::Instance(instance) => instance.fields.get(field).copied(),
            _ => None,
        }
    }

    fn store_instance_field(&mut self, receiver: Value, field: usize, value: Value) -> bool {
        let Some(id) = receiver.try_obj() else {
            return false;
        };
        match &mut self.heap.get_mut(id).kind {
            ObjKind::Instance(instance) if field < instance.fields.len() => {
                instance.fields[field] = value;
                true
            }
            _ => false,
        }
    }

    /// Dispatch a method call. `args_start` indexes the receiver.
    fn complete_call(
        &mut self,
        fiber: ObjId,
        frame: &mut CallFrame,
        class: ObjId,
        symbol: usize,
        args_start: usize,
    ) -> CallOutcome {
        let method = self.heap.class(class).method(symbol);
        match method {
            Method::None => {
                let class_name = self.heap.class(class).name.clone();
                let signature = self.method_names.name(symbol).to_string();
                self.set_error_str(&format!(
                    "{class_name} does not implement '{signature}'."
                ));
                CallOutcome::Error
            }
            Method::Primitive(primitive) => match primitive(self, args_start) {
                PrimitiveResult::Value(value) => {
                    let f = self.heap.fiber_mut(fiber);
                    f.stack.truncate(args_start);
                    f.stack.push(value);
                    CallOutcome::Inline
                }
                PrimitiveResult::Error => CallOutcome::Error,
                PrimitiveResult::FiberAction => {
                    self.store_frame(fiber, *frame);
                    CallOutcome::Reload
                }
            },
            Method::FunctionCall => {
                let receiver = self.heap.fiber(fiber).stack[args_start];
                let closure = receiver.as_obj();
                let arity = {
                    let fn_obj = self.heap.closure(closure).fn_obj;
                    self.heap.fn_data(fn_obj).arity
                };
                let num_args = self.heap.fiber(fiber).stack.len() - args_start;
                if num_args - 1 < arity {
                    self.set_error_str("Function expects more arguments.");
                    return CallOutcome::Error;
                }
                // Extra arguments are discarded so the body's locals line
                // up with their compiled slots.
                self.heap.fiber_mut(fiber).stack.truncate(args_start + arity + 1);
                self.store_frame(fiber, *frame);
                match self.push_frame(fiber, closure, args_start) {
                    Ok(()) => CallOutcome::Reload,
                    Err(message) => {
                        self.set_error_str(message);
                        CallOutcome::Error
                    }
                }
            }
            Method::Block(closure) => {
                self.store_frame(fiber, *frame);
                match self.push_frame(fiber, closure, args_start) {
                    Ok(()) => CallOutcome::Reload,
                    Err(message) => {
                        self.set_error_str(message);
                        CallOutcome::Error
                    }
                }
            }
            Method::Foreign(foreign) => {
                self.api_stack = Some(ApiStack { fiber, start: args_start });
                foreign(self);
                self.api_stack = None;
                let f = self.heap.fiber_mut(fiber);
                f.stack.truncate(args_start + 1);
                if self.heap.fiber(fiber).has_error() {
                    CallOutcome::Error
                } else {
                    CallOutcome::Inline
                }
            }
        }
    }

    /// Push a frame for `closure`, reserving its stack space.
    pub(crate) fn push_frame(
        &mut self,
        fiber: ObjId,
        closure: ObjId,
        stack_start: usize,
    ) -> Result<(), &'static str> {
        if self.heap.fiber(fiber).frames.len() >= MAX_FRAMES {
            return Err("Stack overflow.");
        }
        let max_slots = {
            let fn_obj = self.heap.closure(closure).fn_obj;
            self.heap.fn_data(fn_obj).max_slots
        };
        let added = self
            .heap
            .fiber_mut(fiber)
            .ensure_stack(stack_start + max_slots);
        self.heap.add_bytes(added);
        self.heap.fiber_mut(fiber).frames.push(CallFrame {
            closure,
            ip: 0,
            stack_start,
        });
        Ok(())
    }

    // -- imports ------------------------------------------------------------

    fn import_module(&mut self, importer: ObjId, name_value: Value) -> Result<ImportResult, ()> {
        let name = self.heap.string(name_value.as_obj()).as_text().into_owned();
        let importer_name = self.heap.module(importer).name.clone();

        let resolved = match &mut self.config.resolve_module_fn {
            Some(resolve) => match resolve(&importer_name, &name) {
                Some(resolved) => resolved,
                None => {
                    self.set_error_str(&format!(
                        "Could not resolve module '{name}' imported from '{importer_name}'."
                    ));
                    return Err(());
                }
            },
            None => name.clone(),
        };

        if let Some(module) = self.find_module(&resolved) {
            self.last_module = Some(module);
            return Ok(ImportResult::Existing(Value::obj(module)));
        }

        let source = match self.config.load_module_fn.as_mut().and_then(|f| f(&resolved)) {
            Some(source) => source,
            None => {
                self.set_error_str(&format!("Could not load module '{resolved}'."));
                return Err(());
            }
        };

        let module = self.get_or_create_module(&resolved);
        match self.compile_in_module(module, &source, false, true) {
            Some(closure) => Ok(ImportResult::Run(closure)),
            None => {
                self.set_error_str(&format!("Could not compile module '{resolved}'."));
                Err(())
            }
        }
    }

    fn import_variable(&mut self, name_value: Value) -> Result<Value, String> {
        let module = self.last_module.expect("import variable follows import module");
        let name = self.heap.string(name_value.as_obj()).as_text().into_owned();
        match self.heap.module(module).vars.lookup(&name) {
            Some(slot) => Ok(self.heap.module(module).vars.value(slot)),
            None => {
                let module_name = self.heap.module(module).name.clone();
                Err(format!(
                    "Could not find a variable named '{name}' in module '{module_name}'."
                ))
            }
        }
    }
}

enum CallOutcome {
    /// The call completed in place; keep executing the same frame.
    Inline,
    /// Frames or fibers changed; re-materialize dispatch state.
    Reload,
    /// A runtime error was raised.
    Error,
}

fn read_byte(data: &FnData, frame: &mut CallFrame) -> usize {
    let value = data.code[frame.ip];
    frame.ip += 1;
    value as usize
}

fn read_short(data: &FnData, frame: &mut CallFrame) -> usize {
    let value = (data.code[frame.ip] as usize) << 8 | data.code[frame.ip + 1] as usize;
    frame.ip += 2;
    value
}
