//! The single-pass compiler.
//!
//! Parses recursively and emits bytecode directly into a function
//! prototype; there is no AST. Expressions use a Pratt table keyed by token
//! kind, with an entry per token for its prefix behavior, infix behavior,
//! and (inside class bodies) its method-signature behavior.
//!
//! Nested function bodies are compiled by pushing a fresh function scope
//! onto a stack; name resolution walks outward through the stack, marking
//! captured locals and recording deduplicated upvalue descriptors along the
//! way. Module-level variables may be referenced before their definition:
//! the first use creates an implicit declaration whose stored value is the
//! line number, which either a later definition replaces or the end of
//! compilation reports as an error.

use std::collections::HashMap;

use bytecode_system::{Constant, FnProto, Op, Operands};
use core_types::{
    CompileError, DefineError, ModuleVars, SymbolTable, MAX_CONSTANTS, MAX_FIELDS, MAX_JUMP,
    MAX_LOCALS, MAX_PARAMETERS, MAX_UPVALUES,
};

use crate::lexer::Lexer;
use crate::signature::{SigKind, Signature};
use crate::token::{Token, TokenKind, TokenValue};

/// Options controlling one compilation.
pub struct CompilerOptions {
    /// The name of the module being compiled, used in diagnostics.
    pub module_name: String,
    /// Compile a single expression instead of a module body.
    pub is_expression: bool,
    /// Permit a single `;` after imports, statements, and declarations.
    pub accepts_trailing_semicolons: bool,
}

/// Compile `source` against a module's variable table.
///
/// Returns the top-level function prototype, or every diagnostic collected
/// during the failed pass.
pub fn compile(
    module: &mut ModuleVars,
    method_names: &mut SymbolTable,
    source: &str,
    options: &CompilerOptions,
) -> Result<FnProto, Vec<CompileError>> {
    let mut compiler = Compiler::new(module, method_names, source, options);
    compiler.run()
}

// ---------------------------------------------------------------------------
// Precedence and grammar rules

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    None,
    Lowest,
    Assignment,
    Conditional,
    LogicalOr,
    LogicalAnd,
    Equality,
    Is,
    Comparison,
    BitwiseOr,
    BitwiseXor,
    BitwiseAnd,
    BitwiseShift,
    Range,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

const ALL_PRECS: &[Prec] = &[
    Prec::None,
    Prec::Lowest,
    Prec::Assignment,
    Prec::Conditional,
    Prec::LogicalOr,
    Prec::LogicalAnd,
    Prec::Equality,
    Prec::Is,
    Prec::Comparison,
    Prec::BitwiseOr,
    Prec::BitwiseXor,
    Prec::BitwiseAnd,
    Prec::BitwiseShift,
    Prec::Range,
    Prec::Term,
    Prec::Factor,
    Prec::Unary,
    Prec::Call,
    Prec::Primary,
];

impl Prec {
    fn one_higher(self) -> Prec {
        let index = ALL_PRECS.iter().position(|p| *p == self).unwrap();
        ALL_PRECS[(index + 1).min(ALL_PRECS.len() - 1)]
    }
}

type PrefixFn = fn(&mut Compiler<'_>, bool);
type InfixFn = fn(&mut Compiler<'_>, bool);
type SignatureFn = fn(&mut Compiler<'_>, &mut Signature);

struct GrammarRule {
    prefix: Option<PrefixFn>,
    infix: Option<InfixFn>,
    method: Option<SignatureFn>,
    prec: Prec,
    name: Option<&'static str>,
}

impl GrammarRule {
    const fn unused() -> GrammarRule {
        GrammarRule { prefix: None, infix: None, method: None, prec: Prec::None, name: None }
    }

    const fn prefix(f: PrefixFn) -> GrammarRule {
        GrammarRule { prefix: Some(f), infix: None, method: None, prec: Prec::None, name: None }
    }

    const fn infix(f: InfixFn, prec: Prec) -> GrammarRule {
        GrammarRule { prefix: None, infix: Some(f), method: None, prec, name: None }
    }

    const fn operator(name: &'static str, prec: Prec) -> GrammarRule {
        GrammarRule {
            prefix: None,
            infix: Some(infix_op),
            method: Some(infix_signature),
            prec,
            name: Some(name),
        }
    }
}

fn get_rule(kind: TokenKind) -> GrammarRule {
    use TokenKind::*;
    match kind {
        LeftParen => GrammarRule::prefix(grouping),
        LeftBracket => GrammarRule {
            prefix: Some(list_literal),
            infix: Some(subscript),
            method: Some(subscript_signature),
            prec: Prec::Call,
            name: None,
        },
        LeftBrace => GrammarRule::prefix(map_literal),
        Dot => GrammarRule::infix(dot_call, Prec::Call),
        DotDot => GrammarRule::operator("..", Prec::Range),
        DotDotDot => GrammarRule::operator("...", Prec::Range),
        Star => GrammarRule::operator("*", Prec::Factor),
        Slash => GrammarRule::operator("/", Prec::Factor),
        Percent => GrammarRule::operator("%", Prec::Factor),
        Plus => GrammarRule::operator("+", Prec::Term),
        Minus => GrammarRule {
            prefix: Some(unary_op),
            infix: Some(infix_op),
            method: Some(mixed_signature),
            prec: Prec::Term,
            name: Some("-"),
        },
        LtLt => GrammarRule::operator("<<", Prec::BitwiseShift),
        GtGt => GrammarRule::operator(">>", Prec::BitwiseShift),
        Pipe => GrammarRule::operator("|", Prec::BitwiseOr),
        PipePipe => GrammarRule::infix(or_expr, Prec::LogicalOr),
        Caret => GrammarRule::operator("^", Prec::BitwiseXor),
        Amp => GrammarRule::operator("&", Prec::BitwiseAnd),
        AmpAmp => GrammarRule::infix(and_expr, Prec::LogicalAnd),
        Bang => GrammarRule {
            prefix: Some(unary_op),
            infix: None,
            method: Some(unary_signature),
            prec: Prec::None,
            name: Some("!"),
        },
        Tilde => GrammarRule {
            prefix: Some(unary_op),
            infix: None,
            method: Some(unary_signature),
            prec: Prec::None,
            name: Some("~"),
        },
        Question => GrammarRule::infix(conditional, Prec::Assignment),
        Lt => GrammarRule::operator("<", Prec::Comparison),
        Gt => GrammarRule::operator(">", Prec::Comparison),
        LtEq => GrammarRule::operator("<=", Prec::Comparison),
        GtEq => GrammarRule::operator(">=", Prec::Comparison),
        EqEq => GrammarRule::operator("==", Prec::Equality),
        BangEq => GrammarRule::operator("!=", Prec::Equality),
        Is => GrammarRule::operator("is", Prec::Is),
        False | True => GrammarRule::prefix(boolean_literal),
        Null => GrammarRule::prefix(null_literal),
        Field => GrammarRule::prefix(field_access),
        StaticField => GrammarRule::prefix(static_field_access),
        Name => GrammarRule {
            prefix: Some(name_expr),
            infix: None,
            method: Some(named_signature),
            prec: Prec::None,
            name: None,
        },
        Number | String => GrammarRule::prefix(literal),
        DollarString => GrammarRule::prefix(dollar_string),
        Interpolation => GrammarRule::prefix(string_interpolation),
        Super => GrammarRule::prefix(super_expr),
        This => GrammarRule::prefix(this_expr),
        Construct => GrammarRule {
            prefix: None,
            infix: None,
            method: Some(constructor_signature),
            prec: Prec::None,
            name: None,
        },
        _ => GrammarRule::unused(),
    }
}

// ---------------------------------------------------------------------------
// Compiler state

#[derive(Debug)]
struct Local {
    name: String,
    depth: i32,
    is_upvalue: bool,
}

#[derive(Debug, PartialEq, Eq)]
struct UpvalueDesc {
    is_local: bool,
    index: usize,
}

struct LoopCtx {
    start: usize,
    exit_jump: usize,
    body: usize,
    scope_depth: i32,
}

/// Key for constant deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CKey {
    Null,
    Num(u64),
    Str(Vec<u8>),
}

struct FnScope {
    parent: Option<usize>,
    proto: FnProto,
    constant_keys: HashMap<CKey, u16>,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    num_slots: i32,
    loops: Vec<LoopCtx>,
    is_method: bool,
    is_initializer: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum AttrValue {
    Null,
    Bool(bool),
    Num(f64),
    Str(Vec<u8>),
}

#[derive(Debug, Clone)]
struct AttrEntry {
    group: Option<String>,
    name: String,
    value: AttrValue,
}

struct ClassInfo {
    name: String,
    /// Function scope the class definition runs in; static fields become
    /// locals there.
    scope: usize,
    fields: SymbolTable,
    methods: Vec<usize>,
    static_methods: Vec<usize>,
    is_foreign: bool,
    in_static: bool,
    signature: Option<Signature>,
    class_attributes: Vec<AttrEntry>,
    method_attributes: Vec<(String, Vec<AttrEntry>)>,
}

#[derive(Debug, Clone, Copy)]
enum VarRef {
    Local(usize),
    Upvalue(usize),
    Module(usize),
}

pub(crate) struct Compiler<'a> {
    lexer: Lexer<'a>,
    previous: Token,
    current: Token,
    next: Token,
    errors: Vec<CompileError>,
    module: &'a mut ModuleVars,
    method_names: &'a mut SymbolTable,
    options: &'a CompilerOptions,
    fns: Vec<FnScope>,
    classes: Vec<ClassInfo>,
    pending_attributes: Vec<AttrEntry>,
    has_pending_attributes: bool,
    num_existing_vars: usize,
}

impl<'a> Compiler<'a> {
    fn new(
        module: &'a mut ModuleVars,
        method_names: &'a mut SymbolTable,
        source: &'a str,
        options: &'a CompilerOptions,
    ) -> Compiler<'a> {
        let lexer = Lexer::new(source, options.accepts_trailing_semicolons);
        let num_existing_vars = module.count();
        let mut compiler = Compiler {
            lexer,
            previous: Token::empty(),
            current: Token::empty(),
            next: Token::empty(),
            errors: Vec::new(),
            module,
            method_names,
            options,
            fns: Vec::new(),
            classes: Vec::new(),
            pending_attributes: Vec::new(),
            has_pending_attributes: false,
            num_existing_vars,
        };
        compiler.advance();
        compiler.advance();
        compiler
    }

    fn run(&mut self) -> Result<FnProto, Vec<CompileError>> {
        self.push_module_scope();

        if self.options.is_expression {
            self.ignore_newlines();
            self.expression();
            self.ignore_newlines();
            self.consume(TokenKind::Eof, "Expect end of expression.");
        } else {
            self.ignore_newlines();
            while !self.match_token(TokenKind::Eof) {
                self.definition();
                self.match_semicolon();
                if !self.match_line() {
                    self.consume(TokenKind::Eof, "Expect end of file.");
                    break;
                }
            }
            self.emit_op(Op::EndModule);
        }
        self.emit_op(Op::Return);
        self.emit_op(Op::End);

        // Any implicit declarations created by this compilation that were
        // never filled in are undefined-variable errors at their first use.
        for slot in self.num_existing_vars..self.module.count() {
            if self.module.is_implicit(slot) {
                let line = self.module.value(slot).as_num() as u32;
                let name = self.module.name(slot).to_string();
                self.error_at_line(line, &format!("Variable '{name}' is used but not defined."));
            }
        }

        let mut scope = self.fns.pop().unwrap();
        scope.proto.debug.name = "(script)".to_string();
        scope.proto.max_slots = scope.proto.max_slots.max(1);

        if self.errors.is_empty() {
            Ok(scope.proto)
        } else {
            Err(std::mem::take(&mut self.errors))
        }
    }

    // -- token stream -------------------------------------------------------

    fn advance(&mut self) {
        self.previous = std::mem::replace(
            &mut self.current,
            std::mem::replace(&mut self.next, Token::empty()),
        );
        self.next = loop {
            let token = self.lexer.next_token();
            if token.kind == TokenKind::Error {
                let message = token.text.clone();
                self.error_at_line(token.line, &message);
                continue;
            }
            break token;
        };
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn match_line(&mut self) -> bool {
        if !self.match_token(TokenKind::Line) {
            return false;
        }
        while self.match_token(TokenKind::Line) {}
        true
    }

    fn ignore_newlines(&mut self) {
        self.match_line();
    }

    /// Consume an optional trailing semicolon when the host allows them.
    fn match_semicolon(&mut self) {
        if self.options.accepts_trailing_semicolons {
            self.match_token(TokenKind::Semicolon);
        }
    }

    fn consume_line(&mut self, message: &str) {
        self.match_semicolon();
        self.consume(TokenKind::Line, message);
        while self.match_token(TokenKind::Line) {}
    }

    // -- error reporting ----------------------------------------------------

    fn error_at_line(&mut self, line: u32, message: &str) {
        self.errors.push(CompileError {
            module: self.options.module_name.clone(),
            line,
            message: message.to_string(),
        });
    }

    fn error_at_token(&mut self, token: &Token, message: &str) {
        let label = match token.kind {
            TokenKind::Line => "Error at newline".to_string(),
            TokenKind::Eof => "Error at end of file".to_string(),
            _ => format!("Error at '{}'", token.text),
        };
        let line = token.line;
        self.error_at_line(line, &format!("{label}: {message}"));
    }

    fn error(&mut self, message: &str) {
        let token = self.previous.clone();
        self.error_at_token(&token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current.clone();
        self.error_at_token(&token, message);
    }

    // -- function scopes ----------------------------------------------------

    fn push_module_scope(&mut self) {
        self.fns.push(FnScope {
            parent: None,
            proto: FnProto::new("(script)"),
            constant_keys: HashMap::new(),
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: -1,
            num_slots: 0,
            loops: Vec::new(),
            is_method: false,
            is_initializer: false,
        });
    }

    fn push_fn_scope(&mut self, is_method: bool) {
        let parent = self.fns.len() - 1;
        let receiver = Local {
            name: if is_method { "this".to_string() } else { String::new() },
            depth: -1,
            is_upvalue: false,
        };
        self.fns.push(FnScope {
            parent: Some(parent),
            proto: FnProto::new(""),
            constant_keys: HashMap::new(),
            locals: vec![receiver],
            upvalues: Vec::new(),
            scope_depth: 0,
            num_slots: 1,
            loops: Vec::new(),
            is_method,
            is_initializer: false,
        });
    }

    /// Finish the innermost function and emit a `Closure` for it in its
    /// parent.
    fn end_fn_scope(&mut self, debug_name: &str) {
        self.emit_op(Op::End);
        let mut scope = self.fns.pop().unwrap();
        scope.proto.num_upvalues = scope.upvalues.len();
        scope.proto.debug.name = debug_name.to_string();
        scope.proto.max_slots = scope.proto.max_slots.max(scope.proto.arity + 1);

        let upvalues = scope.upvalues;
        let constant = self.make_constant_raw(None, Constant::Fn(Box::new(scope.proto)));
        self.emit_op_short(Op::Closure, constant);
        for upvalue in &upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index as u8);
        }
    }

    /// Discard an unfinished function scope (foreign method signatures).
    fn abandon_fn_scope(&mut self) {
        self.fns.pop();
    }

    fn f(&mut self) -> &mut FnScope {
        self.fns.last_mut().unwrap()
    }

    fn top(&self) -> usize {
        self.fns.len() - 1
    }

    // -- emission -----------------------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        let scope = self.f();
        scope.proto.code.push(byte);
        scope.proto.debug.source_lines.push(line);
    }

    fn emit_op(&mut self, op: Op) {
        self.emit_op_in(self.top(), op);
    }

    fn emit_op_in(&mut self, scope_index: usize, op: Op) {
        let line = self.previous.line;
        let scope = &mut self.fns[scope_index];
        scope.proto.code.push(op as u8);
        scope.proto.debug.source_lines.push(line);
        scope.num_slots += op.stack_effect();
        if scope.num_slots > scope.proto.max_slots as i32 {
            scope.proto.max_slots = scope.num_slots as usize;
        }
    }

    fn emit_short(&mut self, value: u16) {
        self.emit_byte((value >> 8) as u8);
        self.emit_byte(value as u8);
    }

    fn emit_op_byte(&mut self, op: Op, arg: u8) {
        self.emit_op(op);
        self.emit_byte(arg);
    }

    fn emit_op_short(&mut self, op: Op, arg: u16) {
        self.emit_op(op);
        self.emit_short(arg);
    }

    /// Emit a forward jump and return the offset of its operand for
    /// patching.
    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        self.emit_short(0xffff);
        self.f().proto.code.len() - 2
    }

    fn patch_jump(&mut self, operand_offset: usize) {
        let scope = self.f();
        let jump = scope.proto.code.len() - operand_offset - 2;
        if jump > MAX_JUMP {
            self.error("Too much code to jump over.");
            return;
        }
        let scope = self.f();
        scope.proto.code[operand_offset] = (jump >> 8) as u8;
        scope.proto.code[operand_offset + 1] = jump as u8;
    }

    /// Emit a backward jump to `start` (the offset of the first loop
    /// instruction).
    fn emit_loop_to(&mut self, start: usize) {
        let offset = self.f().proto.code.len() + 3 - start;
        if offset > MAX_JUMP {
            self.error("Loop body too large.");
        }
        self.emit_op_short(Op::Loop, offset as u16);
    }

    fn make_constant_raw(&mut self, key: Option<CKey>, constant: Constant) -> u16 {
        let scope = self.f();
        if let Some(key) = &key {
            if let Some(existing) = scope.constant_keys.get(key) {
                return *existing;
            }
        }
        if scope.proto.constants.len() >= MAX_CONSTANTS {
            self.error(&format!(
                "A function may only contain {MAX_CONSTANTS} unique constants."
            ));
            return 0;
        }
        let scope = self.f();
        let index = scope.proto.constants.len() as u16;
        scope.proto.constants.push(constant);
        if let Some(key) = key {
            scope.constant_keys.insert(key, index);
        }
        index
    }

    fn make_constant(&mut self, constant: Constant) -> u16 {
        let key = match &constant {
            Constant::Null => Some(CKey::Null),
            Constant::Num(n) => Some(CKey::Num(n.to_bits())),
            Constant::Str(bytes) => Some(CKey::Str(bytes.clone())),
            _ => None,
        };
        self.make_constant_raw(key, constant)
    }

    fn emit_constant(&mut self, constant: Constant) {
        let index = self.make_constant(constant);
        self.emit_op_short(Op::Constant, index);
    }

    // -- scopes and variables -----------------------------------------------

    fn push_scope(&mut self) {
        self.f().scope_depth += 1;
    }

    fn pop_scope(&mut self) {
        let depth = self.f().scope_depth;
        let popped = self.discard_locals(depth);
        let scope = self.f();
        scope.locals.truncate(scope.locals.len() - popped);
        scope.num_slots -= popped as i32;
        scope.scope_depth -= 1;
    }

    /// Emit code to release locals at or above `depth` without forgetting
    /// them. Used directly by `break`/`continue`, which jump out of scopes
    /// that remain open for the code that follows.
    fn discard_locals(&mut self, depth: i32) -> usize {
        let mut popped = 0;
        let count = self.f().locals.len();
        while popped < count {
            let local = &self.f().locals[count - popped - 1];
            if local.depth < depth {
                break;
            }
            let close = local.is_upvalue;
            // A raw byte, not emit_op: the stack-effect bookkeeping must not
            // change for code paths that keep these locals live.
            self.emit_byte(if close { Op::CloseUpvalue as u8 } else { Op::Pop as u8 });
            popped += 1;
        }
        popped
    }

    fn add_local_in(&mut self, scope_index: usize, name: &str) -> usize {
        let depth = self.fns[scope_index].scope_depth;
        let scope = &mut self.fns[scope_index];
        scope.locals.push(Local {
            name: name.to_string(),
            depth,
            is_upvalue: false,
        });
        if scope.locals.len() as i32 > scope.num_slots {
            scope.num_slots = scope.locals.len() as i32;
            if scope.num_slots > scope.proto.max_slots as i32 {
                scope.proto.max_slots = scope.num_slots as usize;
            }
        }
        scope.locals.len() - 1
    }

    fn add_local(&mut self, name: &str) -> usize {
        self.add_local_in(self.top(), name)
    }

    /// Declare a variable named by `previous` in the current scope.
    fn declare_variable(&mut self) -> VarRef {
        let name = self.previous.text.clone();
        if self.f().scope_depth == -1 {
            // Module scope.
            let line = self.previous.line;
            match self.module.define(&name, core_types::Value::NULL) {
                Ok(slot) => VarRef::Module(slot),
                Err(DefineError::AlreadyDefined) => {
                    self.error("Module variable is already defined.");
                    VarRef::Module(0)
                }
                Err(DefineError::TooManyVariables) => {
                    self.error("Too many module variables defined.");
                    VarRef::Module(0)
                }
                Err(DefineError::UsedBeforeDefinition(use_line)) => {
                    self.error_at_line(
                        line,
                        &format!(
                            "Variable '{name}' referenced before this definition (first use at line {use_line})."
                        ),
                    );
                    VarRef::Module(0)
                }
            }
        } else {
            let duplicate = {
                let scope = self.f();
                let depth = scope.scope_depth;
                scope
                    .locals
                    .iter()
                    .rev()
                    .take_while(|local| local.depth >= depth)
                    .any(|local| local.name == name)
            };
            if duplicate {
                self.error("Variable is already declared in this scope.");
                return VarRef::Local(0);
            }
            if self.f().locals.len() >= MAX_LOCALS {
                self.error(&format!(
                    "Cannot declare more than {MAX_LOCALS} variables in one scope."
                ));
                return VarRef::Local(0);
            }
            VarRef::Local(self.add_local(&name))
        }
    }

    fn declare_named_variable(&mut self) -> VarRef {
        self.consume(TokenKind::Name, "Expect variable name.");
        self.declare_variable()
    }

    /// Finish a variable definition: module variables are stored from the
    /// stack, locals simply keep their slot.
    fn define_variable(&mut self, var: VarRef) {
        if let VarRef::Module(slot) = var {
            self.emit_op_short(Op::StoreModuleVar, slot as u16);
            self.emit_op(Op::Pop);
        }
    }

    fn resolve_local_in(&self, scope_index: usize, name: &str) -> Option<usize> {
        self.fns[scope_index]
            .locals
            .iter()
            .rposition(|local| local.name == name)
    }

    fn add_upvalue(&mut self, scope_index: usize, is_local: bool, index: usize) -> usize {
        let desc = UpvalueDesc { is_local, index };
        let scope = &mut self.fns[scope_index];
        if let Some(existing) = scope.upvalues.iter().position(|u| *u == desc) {
            return existing;
        }
        if scope.upvalues.len() >= MAX_UPVALUES {
            self.error(&format!(
                "A function may not close over more than {MAX_UPVALUES} variables."
            ));
            return 0;
        }
        self.fns[scope_index].upvalues.push(desc);
        self.fns[scope_index].upvalues.len() - 1
    }

    /// Resolve `name` as an upvalue for the function at `scope_index`,
    /// walking outward and chaining captures through the intermediate
    /// functions.
    fn find_upvalue(&mut self, scope_index: usize, name: &str) -> Option<usize> {
        let parent = self.fns[scope_index].parent?;
        if let Some(local) = self.resolve_local_in(parent, name) {
            self.fns[parent].locals[local].is_upvalue = true;
            return Some(self.add_upvalue(scope_index, true, local));
        }
        let outer = self.find_upvalue(parent, name)?;
        Some(self.add_upvalue(scope_index, false, outer))
    }

    /// Resolve a name against locals and upvalues only.
    fn resolve_nonmodule(&mut self, name: &str) -> Option<VarRef> {
        if let Some(local) = self.resolve_local_in(self.top(), name) {
            return Some(VarRef::Local(local));
        }
        self.find_upvalue(self.top(), name).map(VarRef::Upvalue)
    }

    fn load_local(&mut self, slot: usize) {
        if slot <= 8 {
            let op = Op::from_byte(Op::LoadLocal0 as u8 + slot as u8).unwrap();
            self.emit_op(op);
        } else {
            self.emit_op_byte(Op::LoadLocal, slot as u8);
        }
    }

    fn load_variable(&mut self, var: VarRef) {
        match var {
            VarRef::Local(slot) => self.load_local(slot),
            VarRef::Upvalue(index) => self.emit_op_byte(Op::LoadUpvalue, index as u8),
            VarRef::Module(slot) => self.emit_op_short(Op::LoadModuleVar, slot as u16),
        }
    }

    /// Load or assign a resolved variable reference.
    fn bare_name(&mut self, can_assign: bool, var: VarRef) {
        if can_assign && self.match_token(TokenKind::Eq) {
            self.ignore_newlines();
            self.expression();
            match var {
                VarRef::Local(slot) => self.emit_op_byte(Op::StoreLocal, slot as u8),
                VarRef::Upvalue(index) => self.emit_op_byte(Op::StoreUpvalue, index as u8),
                VarRef::Module(slot) => self.emit_op_short(Op::StoreModuleVar, slot as u16),
            }
            return;
        }
        self.load_variable(var);
    }

    /// Load a variable the core module is expected to provide.
    fn load_core_variable(&mut self, name: &str) {
        let slot = match self.module.lookup(name) {
            Some(slot) => slot,
            None => {
                let line = self.previous.line;
                match self.module.declare_implicit(name, line) {
                    Ok(slot) => slot,
                    Err(_) => {
                        self.error("Too many module variables defined.");
                        0
                    }
                }
            }
        };
        self.emit_op_short(Op::LoadModuleVar, slot as u16);
    }

    fn load_this(&mut self) {
        match self.resolve_nonmodule("this") {
            Some(var) => self.load_variable(var),
            None => self.error("Cannot use 'this' outside of a method."),
        }
    }

    // -- calls and signatures -----------------------------------------------

    fn signature_symbol(&mut self, signature: &Signature) -> u16 {
        self.method_names.ensure(&signature.to_string()) as u16
    }

    fn call_method(&mut self, arity: usize, name: &str) {
        let symbol = self.method_names.ensure(name) as u16;
        self.emit_op_short(Op::call(arity), symbol);
    }

    /// Emit the call (or super call) for a finished signature.
    fn call_signature(&mut self, is_super: bool, signature: &Signature) {
        let symbol = self.signature_symbol(signature);
        // Over-limit arities were already reported; keep the encoding valid.
        let arity = signature.arity.min(MAX_PARAMETERS);
        if is_super {
            self.emit_op_short(Op::super_call(arity), symbol);
            // Reserve a constant slot for the superclass; the method binder
            // fills it in when the surrounding method is bound to a class.
            let superclass_slot = self.make_constant(Constant::Null);
            self.emit_short(superclass_slot);
        } else {
            self.emit_op_short(Op::call(arity), symbol);
        }
    }

    fn validate_num_parameters(&mut self, count: usize) {
        if count == MAX_PARAMETERS + 1 {
            self.error(&format!(
                "Methods cannot have more than {MAX_PARAMETERS} parameters."
            ));
        }
    }

    /// Parse comma-separated call arguments; updates the signature arity.
    fn finish_argument_list(&mut self, signature: &mut Signature) {
        loop {
            self.ignore_newlines();
            signature.arity += 1;
            self.validate_num_parameters(signature.arity);
            self.expression();
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        self.ignore_newlines();
    }

    /// Parse comma-separated parameter declarations; updates the arity.
    fn finish_parameter_list(&mut self, signature: &mut Signature) {
        loop {
            self.ignore_newlines();
            signature.arity += 1;
            self.validate_num_parameters(signature.arity);
            self.declare_named_variable();
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
    }

    /// Parse the argument list, optional block argument, and emit the call.
    fn method_call(&mut self, is_super: bool, signature: &Signature) {
        let mut called = Signature {
            name: signature.name.clone(),
            kind: SigKind::Getter,
            arity: 0,
        };

        if self.match_token(TokenKind::LeftParen) {
            called.kind = SigKind::Method;
            self.ignore_newlines();
            if !self.check(TokenKind::RightParen) {
                self.finish_argument_list(&mut called);
            }
            self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        }

        // A block argument is sugar for a trailing function parameter.
        if self.match_token(TokenKind::LeftBrace) {
            called.kind = SigKind::Method;
            called.arity += 1;
            self.validate_num_parameters(called.arity);

            self.push_fn_scope(false);
            let mut block_signature = Signature::method("", 0);
            if self.match_token(TokenKind::Pipe) {
                self.finish_parameter_list(&mut block_signature);
                self.consume(TokenKind::Pipe, "Expect '|' after function parameters.");
            }
            self.f().proto.arity = block_signature.arity;
            self.finish_body();
            let block_name = format!("{} block argument", called.name);
            self.end_fn_scope(&block_name);
        }

        if signature.kind == SigKind::Initializer {
            if called.kind != SigKind::Method {
                self.error("A superclass constructor must have an argument list.");
            }
            called.kind = SigKind::Initializer;
        }

        self.call_signature(is_super, &called);
    }

    /// A named access that may be a getter, setter, or call.
    fn named_call(&mut self, can_assign: bool, is_super: bool) {
        let name = self.previous.text.clone();
        if can_assign && self.match_token(TokenKind::Eq) {
            self.ignore_newlines();
            let signature = Signature {
                name,
                kind: SigKind::Setter,
                arity: 1,
            };
            self.expression();
            self.call_signature(is_super, &signature);
        } else {
            let signature = Signature::getter(&name);
            self.method_call(is_super, &signature);
        }
    }

    // -- expressions --------------------------------------------------------

    fn parse_precedence(&mut self, prec: Prec) {
        self.advance();
        let prefix = get_rule(self.previous.kind).prefix;
        let Some(prefix) = prefix else {
            self.error("Expected expression.");
            return;
        };

        // Assignment is only allowed when the target can still claim the
        // whole right-hand side.
        let can_assign = prec <= Prec::Conditional;
        prefix(self, can_assign);

        while prec <= get_rule(self.current.kind).prec {
            self.advance();
            let infix = get_rule(self.previous.kind).infix.unwrap();
            infix(self, can_assign);
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Prec::Lowest);
    }

    // -- statements ---------------------------------------------------------

    fn definition(&mut self) {
        while self.match_attribute() {}

        if self.match_token(TokenKind::Class) {
            self.class_definition(false);
            return;
        }
        if self.match_token(TokenKind::Foreign) {
            self.consume(TokenKind::Class, "Expect 'class' after 'foreign'.");
            self.class_definition(true);
            return;
        }

        if self.has_pending_attributes {
            self.error("Attributes can only be specified before a class or a method.");
            self.pending_attributes.clear();
            self.has_pending_attributes = false;
        }

        if self.match_token(TokenKind::Import) {
            self.import_statement();
        } else if self.match_token(TokenKind::Var) {
            self.variable_definition();
        } else {
            self.statement();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Break) {
            if self.f().loops.is_empty() {
                self.error("Cannot use 'break' outside of a loop.");
                return;
            }
            let depth = self.f().loops.last().unwrap().scope_depth + 1;
            self.discard_locals(depth);
            // A placeholder `End` marks the jump; the loop epilogue rewrites
            // it into a real `Jump` once the exit offset is known.
            self.emit_jump(Op::End);
        } else if self.match_token(TokenKind::Continue) {
            if self.f().loops.is_empty() {
                self.error("Cannot use 'continue' outside of a loop.");
                return;
            }
            let ctx = self.f().loops.last().unwrap();
            let depth = ctx.scope_depth + 1;
            let start = ctx.start;
            self.discard_locals(depth);
            self.emit_loop_to(start);
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            let ends = self.check(TokenKind::Line)
                || self.check(TokenKind::Eof)
                || (self.options.accepts_trailing_semicolons && self.check(TokenKind::Semicolon));
            if ends {
                if self.f().is_initializer {
                    self.emit_op(Op::LoadLocal0);
                } else {
                    self.emit_op(Op::Null);
                }
            } else {
                if self.f().is_initializer {
                    self.error("A constructor cannot return a value.");
                }
                self.expression();
            }
            self.emit_op(Op::Return);
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.push_scope();
            if self.finish_block() {
                // Block was an expression statement; discard its value.
                self.emit_op(Op::Pop);
            }
            self.pop_scope();
        } else {
            self.expression();
            self.emit_op(Op::Pop);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.ignore_newlines();
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after if condition.");

        let if_jump = self.emit_jump(Op::JumpIf);
        self.statement();

        if self.match_token(TokenKind::Else) {
            let else_jump = self.emit_jump(Op::Jump);
            self.patch_jump(if_jump);
            self.statement();
            self.patch_jump(else_jump);
        } else {
            self.patch_jump(if_jump);
        }
    }

    fn start_loop(&mut self) {
        let start = self.f().proto.code.len();
        let scope_depth = self.f().scope_depth;
        self.f().loops.push(LoopCtx {
            start,
            exit_jump: 0,
            body: 0,
            scope_depth,
        });
    }

    fn test_exit_loop(&mut self) {
        let exit = self.emit_jump(Op::JumpIf);
        self.f().loops.last_mut().unwrap().exit_jump = exit;
    }

    fn loop_body(&mut self) {
        let body = self.f().proto.code.len();
        self.f().loops.last_mut().unwrap().body = body;
        self.statement();
    }

    fn end_loop(&mut self) {
        let ctx_start = self.f().loops.last().unwrap().start;
        self.emit_loop_to(ctx_start);
        let ctx = self.f().loops.pop().unwrap();
        self.patch_jump(ctx.exit_jump);

        // Rewrite break placeholders in the body into exit jumps.
        let mut offset = ctx.body;
        while offset < self.f().proto.code.len() {
            if self.f().proto.code[offset] == Op::End as u8 {
                self.f().proto.code[offset] = Op::Jump as u8;
                self.patch_jump(offset + 1);
                offset += 3;
            } else {
                offset += 1 + self.operand_width_at(offset);
            }
        }
    }

    /// Width in bytes of the operands of the instruction at `offset`.
    fn operand_width_at(&mut self, offset: usize) -> usize {
        let scope = self.f();
        let op = Op::from_byte(scope.proto.code[offset]).expect("compiler emitted valid opcode");
        match op.operands() {
            Operands::None => 0,
            Operands::Byte => 1,
            Operands::Short => 2,
            Operands::ShortShort => 4,
            Operands::ClosureSpec => {
                let constant = scope.proto.read_short(offset + 1) as usize;
                match &scope.proto.constants[constant] {
                    Constant::Fn(proto) => 2 + proto.num_upvalues * 2,
                    _ => 2,
                }
            }
        }
    }

    fn while_statement(&mut self) {
        self.start_loop();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.ignore_newlines();
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after while condition.");
        self.test_exit_loop();
        self.loop_body();
        self.end_loop();
    }

    /// Desugar `for (x in sequence) body` onto the iterator protocol with
    /// two hidden locals.
    fn for_statement(&mut self) {
        self.push_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        self.consume(TokenKind::Name, "Expect for loop variable name.");
        let variable_name = self.previous.text.clone();
        self.consume(TokenKind::In, "Expect 'in' after loop variable.");
        self.ignore_newlines();

        self.expression();
        if self.f().locals.len() + 2 > MAX_LOCALS {
            self.error(&format!(
                "Cannot declare more than {MAX_LOCALS} variables in one scope."
            ));
        }
        // The space in the hidden names makes them unmentionable.
        let seq_slot = self.add_local("seq ");
        self.emit_op(Op::Null);
        let iter_slot = self.add_local("iter ");
        self.consume(TokenKind::RightParen, "Expect ')' after loop expression.");

        self.start_loop();

        self.load_local(seq_slot);
        self.load_local(iter_slot);
        self.call_method(1, "iterate(_)");
        self.emit_op_byte(Op::StoreLocal, iter_slot as u8);
        self.test_exit_loop();

        self.load_local(seq_slot);
        self.load_local(iter_slot);
        self.call_method(1, "iteratorValue(_)");

        self.push_scope();
        self.add_local(&variable_name);
        self.loop_body();
        self.pop_scope();

        self.end_loop();
        self.pop_scope();
    }

    fn variable_definition(&mut self) {
        self.consume(TokenKind::Name, "Expect variable name.");
        let name_token = self.previous.clone();

        if self.match_token(TokenKind::Eq) {
            self.ignore_newlines();
            self.expression();
        } else {
            self.emit_op(Op::Null);
        }

        // Declared after the initializer so it cannot shadow itself.
        self.previous = name_token;
        let var = self.declare_variable();
        self.define_variable(var);
    }

    fn import_statement(&mut self) {
        self.ignore_newlines();
        self.consume(TokenKind::String, "Expect a string after 'import'.");
        let module_name = self.previous.str_bytes().to_vec();
        let module_constant = self.make_constant(Constant::Str(module_name));

        self.emit_op_short(Op::ImportModule, module_constant);
        self.emit_op(Op::Pop);

        if !self.match_token(TokenKind::For) {
            return;
        }
        loop {
            self.ignore_newlines();
            self.consume(TokenKind::Name, "Expect variable name.");
            let source_name = self.previous.text.clone();

            let slot_name = if self.match_token(TokenKind::As) {
                self.consume(TokenKind::Name, "Expect variable name after 'as'.");
                self.previous.text.clone()
            } else {
                source_name.clone()
            };

            // Declare under the local alias.
            self.previous.text = slot_name;
            let var = self.declare_variable();

            let name_constant = self.make_constant(Constant::Str(source_name.into_bytes()));
            self.emit_op_short(Op::ImportVariable, name_constant);
            self.define_variable(var);

            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
    }

    // -- blocks and bodies --------------------------------------------------

    /// Parse a `{ … }` body. Returns true when the block was a single
    /// expression whose value is on the stack.
    fn finish_block(&mut self) -> bool {
        if self.match_token(TokenKind::RightBrace) {
            return false;
        }

        if !self.match_line() {
            self.expression();
            self.consume(TokenKind::RightBrace, "Expect '}' at end of block.");
            return true;
        }

        if self.match_token(TokenKind::RightBrace) {
            return false;
        }

        loop {
            self.definition();
            self.consume_line("Expect newline after statement.");
            if self.check(TokenKind::RightBrace) || self.check(TokenKind::Eof) {
                break;
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' at end of block.");
        false
    }

    /// Compile a method or function body, including the implicit return.
    fn finish_body(&mut self) {
        let is_expression_body = self.finish_block();
        if self.f().is_initializer {
            if is_expression_body {
                self.emit_op(Op::Pop);
            }
            // The receiver always sits in the first slot.
            self.emit_op(Op::LoadLocal0);
        } else if !is_expression_body {
            self.emit_op(Op::Null);
        }
        self.emit_op(Op::Return);
    }

    // -- attributes ---------------------------------------------------------

    fn match_attribute(&mut self) -> bool {
        if !self.match_token(TokenKind::Hash) {
            return false;
        }
        self.has_pending_attributes = true;
        let runtime_access = self.match_token(TokenKind::Bang);

        if self.match_token(TokenKind::Name) {
            let group_or_name = self.previous.text.clone();
            if self.match_token(TokenKind::LeftParen) {
                self.ignore_newlines();
                loop {
                    self.ignore_newlines();
                    self.consume(TokenKind::Name, "Expect attribute name.");
                    let name = self.previous.text.clone();
                    let value = if self.match_token(TokenKind::Eq) {
                        self.consume_attribute_value()
                    } else {
                        AttrValue::Null
                    };
                    if runtime_access {
                        self.pending_attributes.push(AttrEntry {
                            group: Some(group_or_name.clone()),
                            name,
                            value,
                        });
                    }
                    if !self.match_token(TokenKind::Comma) {
                        break;
                    }
                }
                self.ignore_newlines();
                self.consume(TokenKind::RightParen, "Expect ')' after grouped attributes.");
            } else {
                let value = if self.match_token(TokenKind::Eq) {
                    self.consume_attribute_value()
                } else {
                    AttrValue::Null
                };
                if runtime_access {
                    self.pending_attributes.push(AttrEntry {
                        group: None,
                        name: group_or_name,
                        value,
                    });
                }
            }
        } else {
            self.error_at_current("Expect an attribute definition after '#'.");
        }

        self.consume_line("Expect newline after attribute.");
        true
    }

    fn consume_attribute_value(&mut self) -> AttrValue {
        if self.match_token(TokenKind::False) {
            AttrValue::Bool(false)
        } else if self.match_token(TokenKind::True) {
            AttrValue::Bool(true)
        } else if self.match_token(TokenKind::Null) {
            AttrValue::Null
        } else if self.match_token(TokenKind::Name) {
            AttrValue::Str(self.previous.text.clone().into_bytes())
        } else if self.match_token(TokenKind::Number) {
            AttrValue::Num(self.previous.num())
        } else if self.match_token(TokenKind::String) {
            AttrValue::Str(self.previous.str_bytes().to_vec())
        } else {
            self.error_at_current("Expect an attribute value.");
            AttrValue::Null
        }
    }

    fn take_pending_attributes(&mut self) -> Vec<AttrEntry> {
        self.has_pending_attributes = false;
        std::mem::take(&mut self.pending_attributes)
    }

    /// Convert an attribute bag to its constant-map shape:
    /// group (or null) → name → list of values.
    fn attributes_to_constant(entries: &[AttrEntry]) -> Constant {
        let mut groups: Vec<(Option<String>, Vec<(String, Vec<AttrValue>)>)> = Vec::new();
        for entry in entries {
            let group = groups.iter_mut().find(|(g, _)| *g == entry.group);
            let group = match group {
                Some(found) => &mut found.1,
                None => {
                    groups.push((entry.group.clone(), Vec::new()));
                    &mut groups.last_mut().unwrap().1
                }
            };
            match group.iter_mut().find(|(n, _)| *n == entry.name) {
                Some((_, values)) => values.push(entry.value.clone()),
                None => group.push((entry.name.clone(), vec![entry.value.clone()])),
            }
        }

        let mut map = Vec::new();
        for (group, names) in groups {
            let key = match group {
                Some(name) => Constant::Str(name.into_bytes()),
                None => Constant::Null,
            };
            let mut name_map = Vec::new();
            for (name, values) in names {
                let list = values.into_iter().map(attr_value_to_constant).collect();
                name_map.push((Constant::Str(name.into_bytes()), Constant::List(list)));
            }
            map.push((key, Constant::Map(name_map)));
        }
        Constant::Map(map)
    }

    // -- classes ------------------------------------------------------------

    fn class_definition(&mut self, is_foreign: bool) {
        // The variable the class object is stored in.
        let class_variable = self.declare_named_variable();
        let class_name = self.previous.text.clone();

        self.emit_constant(Constant::Str(class_name.clone().into_bytes()));

        if self.match_token(TokenKind::Is) {
            self.parse_precedence(Prec::Call);
        } else {
            self.load_core_variable("Object");
        }

        // The field count is patched once the body has been compiled.
        let mut num_fields_offset = None;
        if is_foreign {
            self.emit_op(Op::ForeignClass);
        } else {
            self.emit_op_byte(Op::Class, 255);
            num_fields_offset = Some(self.f().proto.code.len() - 1);
        }

        self.define_variable(class_variable);

        // Static fields become locals in this scope, closed over by the
        // methods that use them.
        self.push_scope();

        let class_attributes = self.take_pending_attributes();
        self.classes.push(ClassInfo {
            name: class_name,
            scope: self.top(),
            fields: SymbolTable::new(),
            methods: Vec::new(),
            static_methods: Vec::new(),
            is_foreign,
            in_static: false,
            signature: None,
            class_attributes,
            method_attributes: Vec::new(),
        });

        self.consume(TokenKind::LeftBrace, "Expect '{' after class declaration.");
        self.match_line();

        while !self.match_token(TokenKind::RightBrace) {
            if !self.method(class_variable) {
                break;
            }
            if self.match_token(TokenKind::RightBrace) {
                break;
            }
            self.consume_line("Expect newline after definition in class.");
        }

        let class_info = self.classes.pop().unwrap();

        let has_attributes =
            !class_info.class_attributes.is_empty() || !class_info.method_attributes.is_empty();
        if has_attributes {
            self.emit_class_attributes(&class_info);
            self.load_variable(class_variable);
            self.emit_op(Op::EndClass);
        }

        if let Some(offset) = num_fields_offset {
            let count = class_info.fields.len();
            if count > MAX_FIELDS {
                self.error(&format!("A class can only have {MAX_FIELDS} fields."));
            }
            self.f().proto.code[offset] = count.min(MAX_FIELDS) as u8;
        }

        self.pop_scope();
    }

    fn emit_class_attributes(&mut self, class_info: &ClassInfo) {
        let self_map = if class_info.class_attributes.is_empty() {
            Constant::Null
        } else {
            Self::attributes_to_constant(&class_info.class_attributes)
        };
        let mut methods = Vec::new();
        for (signature, entries) in &class_info.method_attributes {
            methods.push((
                Constant::Str(signature.clone().into_bytes()),
                Self::attributes_to_constant(entries),
            ));
        }
        let attributes = Constant::Map(vec![
            (Constant::Str(b"self".to_vec()), self_map),
            (Constant::Str(b"methods".to_vec()), Constant::Map(methods)),
        ]);
        self.emit_constant(attributes);
    }

    /// Compile one method definition inside a class body.
    fn method(&mut self, class_variable: VarRef) -> bool {
        while self.match_attribute() {}

        let is_foreign_method = self.match_token(TokenKind::Foreign);
        let is_static = self.match_token(TokenKind::Static);
        self.classes.last_mut().unwrap().in_static = is_static;

        let signature_fn = get_rule(self.current.kind).method;
        self.advance();
        let Some(signature_fn) = signature_fn else {
            self.error("Expect method definition.");
            return false;
        };

        let mut signature = Signature::getter(&self.previous.text);
        self.classes.last_mut().unwrap().signature = Some(signature.clone());

        self.push_fn_scope(true);
        signature_fn(self, &mut signature);
        self.f().proto.arity = signature.arity;
        self.f().is_initializer = signature.kind == SigKind::Initializer;
        self.classes.last_mut().unwrap().signature = Some(signature.clone());

        if is_static && signature.kind == SigKind::Initializer {
            self.error("A constructor cannot be static.");
        }

        let full_signature = signature.to_string();

        // Claim any attributes parsed before this method.
        let attributes = self.take_pending_attributes();
        if !attributes.is_empty() {
            self.classes
                .last_mut()
                .unwrap()
                .method_attributes
                .push((full_signature.clone(), attributes));
        }

        let method_symbol = self.declare_method(&signature, is_static, &full_signature);

        if is_foreign_method {
            self.abandon_fn_scope();
            // The VM resolves the signature through the host's foreign
            // method binder when the class definition executes.
            self.emit_constant(Constant::Str(full_signature.clone().into_bytes()));
        } else {
            self.consume(TokenKind::LeftBrace, "Expect '{' to begin method body.");
            self.finish_body();
            self.end_fn_scope(&full_signature);
        }

        self.define_method(class_variable, is_static, method_symbol);

        if signature.kind == SigKind::Initializer {
            // The metaclass gets a matching constructor that allocates the
            // instance and runs this initializer.
            let mut constructor = signature.clone();
            constructor.kind = SigKind::Method;
            let constructor_symbol = self.signature_symbol(&constructor);

            self.create_constructor(&signature, method_symbol);
            self.define_method(class_variable, true, constructor_symbol);
        }
        true
    }

    fn declare_method(&mut self, signature: &Signature, is_static: bool, full: &str) -> u16 {
        let symbol = self.signature_symbol(signature) as usize;
        let class_info = self.classes.last_mut().unwrap();
        let list = if is_static {
            &mut class_info.static_methods
        } else {
            &mut class_info.methods
        };
        if list.contains(&symbol) {
            let class_name = class_info.name.clone();
            let kind = if is_static { "static " } else { "" };
            self.error(&format!(
                "Class {class_name} already defines a {kind}method '{full}'."
            ));
        } else {
            list.push(symbol);
        }
        symbol as u16
    }

    fn define_method(&mut self, class_variable: VarRef, is_static: bool, symbol: u16) {
        self.load_variable(class_variable);
        let op = if is_static { Op::MethodStatic } else { Op::MethodInstance };
        self.emit_op_short(op, symbol);
    }

    /// Synthesize the metaclass constructor: allocate, run the initializer,
    /// return the instance.
    fn create_constructor(&mut self, signature: &Signature, initializer_symbol: u16) {
        self.push_fn_scope(true);
        let is_foreign = self.classes.last().unwrap().is_foreign;
        self.emit_op(if is_foreign { Op::ForeignConstruct } else { Op::Construct });
        self.emit_op_short(Op::call(signature.arity.min(MAX_PARAMETERS)), initializer_symbol);
        self.emit_op(Op::Return);
        self.f().proto.arity = signature.arity;
        let name = format!("{} init", signature);
        self.end_fn_scope(&name);
    }
}

// ---------------------------------------------------------------------------
// Prefix and infix rule implementations

fn grouping(c: &mut Compiler<'_>, _can_assign: bool) {
    c.expression();
    c.consume(TokenKind::RightParen, "Expect ')' after expression.");
}

fn list_literal(c: &mut Compiler<'_>, _can_assign: bool) {
    c.load_core_variable("List");
    c.call_method(0, "new()");

    loop {
        c.ignore_newlines();
        if c.check(TokenKind::RightBracket) {
            break;
        }
        c.expression();
        c.call_method(1, "addCore_(_)");
        if !c.match_token(TokenKind::Comma) {
            break;
        }
    }
    c.ignore_newlines();
    c.consume(TokenKind::RightBracket, "Expect ']' after list elements.");
}

fn map_literal(c: &mut Compiler<'_>, _can_assign: bool) {
    c.load_core_variable("Map");
    c.call_method(0, "new()");

    loop {
        c.ignore_newlines();
        if c.check(TokenKind::RightBrace) {
            break;
        }
        // Restrict keys to unary precedence so ':' stays unambiguous.
        c.parse_precedence(Prec::Unary);
        c.consume(TokenKind::Colon, "Expect ':' after map key.");
        c.ignore_newlines();
        c.expression();
        c.call_method(2, "addCore_(_,_)");
        if !c.match_token(TokenKind::Comma) {
            break;
        }
    }
    c.ignore_newlines();
    c.consume(TokenKind::RightBrace, "Expect '}' after map entries.");
}

fn boolean_literal(c: &mut Compiler<'_>, _can_assign: bool) {
    let op = if c.previous.kind == TokenKind::True { Op::True } else { Op::False };
    c.emit_op(op);
}

fn null_literal(c: &mut Compiler<'_>, _can_assign: bool) {
    c.emit_op(Op::Null);
}

fn literal(c: &mut Compiler<'_>, _can_assign: bool) {
    let constant = match &c.previous.value {
        TokenValue::Num(n) => Constant::Num(*n),
        TokenValue::Str(bytes) => Constant::Str(bytes.clone()),
        TokenValue::None => unreachable!("literal token always has a value"),
    };
    c.emit_constant(constant);
}

fn dollar_string(c: &mut Compiler<'_>, _can_assign: bool) {
    let bytes = c.previous.str_bytes().to_vec();
    c.emit_constant(Constant::Str(bytes));
    c.call_method(0, "$");
}

fn string_interpolation(c: &mut Compiler<'_>, _can_assign: bool) {
    // Lowered to building a list of pieces and joining them.
    c.load_core_variable("List");
    c.call_method(0, "new()");

    loop {
        literal(c, false);
        c.call_method(1, "addCore_(_)");

        c.ignore_newlines();
        c.expression();
        c.call_method(1, "addCore_(_)");
        c.ignore_newlines();

        if !c.match_token(TokenKind::Interpolation) {
            break;
        }
    }

    c.consume(TokenKind::String, "Expect end of string interpolation.");
    literal(c, false);
    c.call_method(1, "addCore_(_)");
    c.call_method(0, "join()");
}

fn field_access(c: &mut Compiler<'_>, can_assign: bool) {
    let name = c.previous.text.clone();
    let mut field = MAX_FIELDS;

    if c.classes.is_empty() {
        c.error("Cannot reference a field outside of a class definition.");
    } else if c.classes.last().unwrap().is_foreign {
        c.error("Cannot define fields in a foreign class.");
    } else if c.classes.last().unwrap().in_static {
        c.error("Cannot use an instance field in a static method.");
    } else {
        field = c.classes.last_mut().unwrap().fields.ensure(&name);
        if field >= MAX_FIELDS {
            c.error(&format!("A class can only have {MAX_FIELDS} fields."));
        }
    }

    let mut is_load = true;
    if can_assign && c.match_token(TokenKind::Eq) {
        c.ignore_newlines();
        c.expression();
        is_load = false;
    }

    // Directly inside a method the receiver is local slot zero and a
    // shortcut instruction applies; in a nested function, load `this`
    // through the closure first.
    if c.f().is_method {
        let op = if is_load { Op::LoadFieldThis } else { Op::StoreFieldThis };
        c.emit_op_byte(op, field as u8);
    } else {
        c.load_this();
        let op = if is_load { Op::LoadField } else { Op::StoreField };
        c.emit_op_byte(op, field as u8);
    }
}

fn static_field_access(c: &mut Compiler<'_>, can_assign: bool) {
    if c.classes.is_empty() {
        c.error("Cannot use a static field outside of a class definition.");
        return;
    }
    let name = c.previous.text.clone();
    let class_scope = c.classes.last().unwrap().scope;

    // First mention hoists the field into a null-initialized local in the
    // scope surrounding the class body; methods then close over it.
    if c.resolve_local_in(class_scope, &name).is_none() {
        c.emit_op_in(class_scope, Op::Null);
        c.add_local_in(class_scope, &name);
    }

    match c.resolve_nonmodule(&name) {
        Some(var) => c.bare_name(can_assign, var),
        None => c.error("Could not resolve static field."),
    }
}

fn name_expr(c: &mut Compiler<'_>, can_assign: bool) {
    let name = c.previous.text.clone();

    if let Some(var) = c.resolve_nonmodule(&name) {
        c.bare_name(can_assign, var);
        return;
    }

    // Inside a method, a bare lowercase name is a call on `this`.
    if core_types::module::is_local_name(&name) && !c.classes.is_empty() {
        c.load_this();
        c.named_call(can_assign, false);
        return;
    }

    let slot = match c.module.lookup(&name) {
        Some(slot) => slot,
        None => {
            let line = c.previous.line;
            match c.module.declare_implicit(&name, line) {
                Ok(slot) => slot,
                Err(_) => {
                    c.error("Too many module variables defined.");
                    0
                }
            }
        }
    };
    c.bare_name(can_assign, VarRef::Module(slot));
}

fn dot_call(c: &mut Compiler<'_>, can_assign: bool) {
    c.ignore_newlines();
    c.consume(TokenKind::Name, "Expect method name after '.'.");
    c.named_call(can_assign, false);
}

fn subscript(c: &mut Compiler<'_>, can_assign: bool) {
    let mut signature = Signature {
        name: String::new(),
        kind: SigKind::Subscript,
        arity: 0,
    };
    c.finish_argument_list(&mut signature);
    c.consume(TokenKind::RightBracket, "Expect ']' after arguments.");

    if can_assign && c.match_token(TokenKind::Eq) {
        signature.kind = SigKind::SubscriptSetter;
        signature.arity += 1;
        c.validate_num_parameters(signature.arity);
        c.expression();
    }
    c.call_signature(false, &signature);
}

fn and_expr(c: &mut Compiler<'_>, _can_assign: bool) {
    c.ignore_newlines();
    let jump = c.emit_jump(Op::And);
    c.parse_precedence(Prec::LogicalAnd.one_higher());
    c.patch_jump(jump);
}

fn or_expr(c: &mut Compiler<'_>, _can_assign: bool) {
    c.ignore_newlines();
    let jump = c.emit_jump(Op::Or);
    c.parse_precedence(Prec::LogicalOr.one_higher());
    c.patch_jump(jump);
}

fn conditional(c: &mut Compiler<'_>, _can_assign: bool) {
    c.ignore_newlines();
    let if_jump = c.emit_jump(Op::JumpIf);

    c.parse_precedence(Prec::Conditional);
    c.consume(TokenKind::Colon, "Expect ':' after then branch of conditional operator.");
    c.ignore_newlines();

    let else_jump = c.emit_jump(Op::Jump);
    c.patch_jump(if_jump);
    c.parse_precedence(Prec::Assignment);
    c.patch_jump(else_jump);
}

fn infix_op(c: &mut Compiler<'_>, _can_assign: bool) {
    let rule = get_rule(c.previous.kind);
    let name = rule.name.expect("infix operators carry a name");
    c.ignore_newlines();
    c.parse_precedence(rule.prec.one_higher());
    let signature = Signature::method(name, 1);
    c.call_signature(false, &signature);
}

fn unary_op(c: &mut Compiler<'_>, _can_assign: bool) {
    let name = get_rule(c.previous.kind).name.expect("unary operators carry a name");
    c.ignore_newlines();
    c.parse_precedence(Prec::Unary.one_higher());
    c.call_method(0, name);
}

fn super_expr(c: &mut Compiler<'_>, can_assign: bool) {
    if c.classes.is_empty() {
        c.error("Cannot use 'super' outside of a method.");
    }
    c.load_this();

    if c.match_token(TokenKind::Dot) {
        c.consume(TokenKind::Name, "Expect method name after 'super.'.");
        c.named_call(can_assign, true);
    } else if let Some(signature) = c.classes.last().and_then(|info| info.signature.clone()) {
        c.method_call(true, &signature);
    }
}

fn this_expr(c: &mut Compiler<'_>, _can_assign: bool) {
    if c.classes.is_empty() {
        c.error("Cannot use 'this' outside of a method.");
        return;
    }
    c.load_this();
}

// ---------------------------------------------------------------------------
// Signature rule implementations

fn named_signature(c: &mut Compiler<'_>, signature: &mut Signature) {
    signature.kind = SigKind::Getter;

    if c.match_token(TokenKind::Eq) {
        signature.kind = SigKind::Setter;
        signature.arity = 1;
        c.consume(TokenKind::LeftParen, "Expect '(' after '='.");
        c.declare_named_variable();
        c.consume(TokenKind::RightParen, "Expect ')' after parameter name.");
        return;
    }

    parameter_list(c, signature);
}

fn parameter_list(c: &mut Compiler<'_>, signature: &mut Signature) {
    if !c.match_token(TokenKind::LeftParen) {
        return;
    }
    signature.kind = SigKind::Method;
    if c.match_token(TokenKind::RightParen) {
        return;
    }
    c.finish_parameter_list(signature);
    c.consume(TokenKind::RightParen, "Expect ')' after parameters.");
}

fn infix_signature(c: &mut Compiler<'_>, signature: &mut Signature) {
    signature.kind = SigKind::Method;
    signature.arity = 1;
    c.consume(TokenKind::LeftParen, "Expect '(' after operator name.");
    c.declare_named_variable();
    c.consume(TokenKind::RightParen, "Expect ')' after parameter name.");
}

fn unary_signature(_c: &mut Compiler<'_>, signature: &mut Signature) {
    signature.kind = SigKind::Getter;
}

fn mixed_signature(c: &mut Compiler<'_>, signature: &mut Signature) {
    signature.kind = SigKind::Getter;
    if c.match_token(TokenKind::LeftParen) {
        signature.kind = SigKind::Method;
        signature.arity = 1;
        c.declare_named_variable();
        c.consume(TokenKind::RightParen, "Expect ')' after parameter name.");
    }
}

fn subscript_signature(c: &mut Compiler<'_>, signature: &mut Signature) {
    signature.kind = SigKind::Subscript;
    signature.name.clear();

    c.finish_parameter_list(signature);
    c.consume(TokenKind::RightBracket, "Expect ']' after parameters.");

    if c.match_token(TokenKind::Eq) {
        signature.kind = SigKind::SubscriptSetter;
        signature.arity += 1;
        c.validate_num_parameters(signature.arity);
        c.consume(TokenKind::LeftParen, "Expect '(' after '='.");
        c.declare_named_variable();
        c.consume(TokenKind::RightParen, "Expect ')' after parameter name.");
    }
}

fn constructor_signature(c: &mut Compiler<'_>, signature: &mut Signature) {
    c.consume(TokenKind::Name, "Expect constructor name after 'construct'.");
    signature.name = c.previous.text.clone();
    signature.kind = SigKind::Initializer;

    if c.match_token(TokenKind::Eq) {
        c.error("A constructor cannot be a setter.");
    }
    if !c.match_token(TokenKind::LeftParen) {
        c.error("A constructor cannot be a getter.");
        return;
    }
    if c.match_token(TokenKind::RightParen) {
        return;
    }
    c.finish_parameter_list(signature);
    c.consume(TokenKind::RightParen, "Expect ')' after parameters.");
}

fn attr_value_to_constant(value: AttrValue) -> Constant {
    match value {
        AttrValue::Null => Constant::Null,
        AttrValue::Bool(b) => Constant::Bool(b),
        AttrValue::Num(n) => Constant::Num(n),
        AttrValue::Str(bytes) => Constant::Str(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::Value;

    fn compile_module(source: &str) -> Result<FnProto, Vec<CompileError>> {
        let mut module = ModuleVars::new();
        // Core names the compiler expects to find.
        for name in ["Object", "List", "Map"] {
            module.define(name, Value::NULL).unwrap();
        }
        let mut method_names = SymbolTable::new();
        let options = CompilerOptions {
            module_name: "test".to_string(),
            is_expression: false,
            accepts_trailing_semicolons: false,
        };
        compile(&mut module, &mut method_names, source, &options)
    }

    fn ops_of(proto: &FnProto) -> Vec<Op> {
        let mut ops = Vec::new();
        let mut offset = 0;
        while offset < proto.code.len() {
            let op = Op::from_byte(proto.code[offset]).unwrap();
            ops.push(op);
            offset += 1;
            offset += match op.operands() {
                Operands::None => 0,
                Operands::Byte => 1,
                Operands::Short => 2,
                Operands::ShortShort => 4,
                Operands::ClosureSpec => {
                    let constant = proto.read_short(offset) as usize;
                    match &proto.constants[constant] {
                        Constant::Fn(inner) => 2 + inner.num_upvalues * 2,
                        _ => 2,
                    }
                }
            };
        }
        ops
    }

    #[test]
    fn test_empty_module() {
        let proto = compile_module("").unwrap();
        assert_eq!(ops_of(&proto), vec![Op::EndModule, Op::Return, Op::End]);
    }

    #[test]
    fn test_expression_statement_pops() {
        let proto = compile_module("1 + 2").unwrap();
        let ops = ops_of(&proto);
        assert!(ops.contains(&Op::Call1));
        assert!(ops.contains(&Op::Pop));
    }

    #[test]
    fn test_expression_mode_returns_value() {
        let mut module = ModuleVars::new();
        let mut method_names = SymbolTable::new();
        let options = CompilerOptions {
            module_name: "repl".to_string(),
            is_expression: true,
            accepts_trailing_semicolons: false,
        };
        let proto = compile(&mut module, &mut method_names, "1 + 2", &options).unwrap();
        let ops = ops_of(&proto);
        assert_eq!(ops.last(), Some(&Op::End));
        assert!(ops.contains(&Op::Return));
        assert!(!ops.contains(&Op::EndModule));
    }

    #[test]
    fn test_var_declaration_stores_module_var() {
        let proto = compile_module("var x = 3").unwrap();
        let ops = ops_of(&proto);
        assert!(ops.contains(&Op::StoreModuleVar));
    }

    #[test]
    fn test_undefined_variable_reported() {
        let errors = compile_module("missing").unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.message.contains("is used but not defined")));
    }

    #[test]
    fn test_forward_reference_to_class_is_allowed() {
        let source = "var a = Later\nclass Later {}";
        assert!(compile_module(source).is_ok());
    }

    #[test]
    fn test_too_many_parameters_rejected() {
        // 17 parameters exceeds the limit of 16.
        let params: Vec<String> = (0..17).map(|i| format!("p{i}")).collect();
        let source = format!("class A {{ m({}) {{ }} }}", params.join(", "));
        let errors = compile_module(&source).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.message.contains("more than 16 parameters")));
    }

    #[test]
    fn test_sixteen_parameters_accepted() {
        let params: Vec<String> = (0..16).map(|i| format!("p{i}")).collect();
        let source = format!("class A {{ m({}) {{ }} }}", params.join(", "));
        assert!(compile_module(&source).is_ok());
    }

    #[test]
    fn test_break_outside_loop() {
        let errors = compile_module("break").unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.message.contains("Cannot use 'break' outside of a loop.")));
    }

    #[test]
    fn test_while_loop_emits_loop_op() {
        let proto = compile_module("while (false) { }").unwrap();
        let ops = ops_of(&proto);
        assert!(ops.contains(&Op::JumpIf));
        assert!(ops.contains(&Op::Loop));
    }

    #[test]
    fn test_break_placeholder_replaced() {
        let proto = compile_module("while (true) break").unwrap();
        let ops = ops_of(&proto);
        // The placeholder End inside the body must have been rewritten; the
        // only End left is the terminator.
        let end_count = ops.iter().filter(|op| **op == Op::End).count();
        assert_eq!(end_count, 1);
        assert_eq!(ops.last(), Some(&Op::End));
    }

    #[test]
    fn test_for_loop_desugars_to_iterator_protocol() {
        let mut module = ModuleVars::new();
        for name in ["Object", "List", "Map"] {
            module.define(name, Value::NULL).unwrap();
        }
        let mut method_names = SymbolTable::new();
        let options = CompilerOptions {
            module_name: "test".to_string(),
            is_expression: false,
            accepts_trailing_semicolons: false,
        };
        let proto = compile(&mut module, &mut method_names, "for (i in x) { }", &options);
        // `x` is undefined, so this errors, but the iterator protocol
        // symbols must have been interned by the desugaring.
        assert!(proto.is_err());
        assert!(method_names.find("iterate(_)").is_some());
        assert!(method_names.find("iteratorValue(_)").is_some());
    }

    #[test]
    fn test_class_definition_emits_class_ops() {
        let proto = compile_module("class Point {\n  x { 1 }\n}").unwrap();
        let ops = ops_of(&proto);
        assert!(ops.contains(&Op::Class));
        assert!(ops.contains(&Op::MethodInstance));
        assert!(ops.contains(&Op::Closure));
    }

    #[test]
    fn test_constructor_defines_two_methods() {
        let proto = compile_module("class Point {\n  construct new() { }\n}").unwrap();
        let ops = ops_of(&proto);
        assert!(ops.contains(&Op::MethodInstance));
        assert!(ops.contains(&Op::MethodStatic));
    }

    #[test]
    fn test_duplicate_method_rejected() {
        let source = "class A {\n  foo { 1 }\n  foo { 2 }\n}";
        let errors = compile_module(source).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.message.contains("already defines a method 'foo'")));
    }

    #[test]
    fn test_field_outside_class_rejected() {
        let errors = compile_module("_x").unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.message.contains("outside of a class definition")));
    }

    #[test]
    fn test_closure_captures_upvalue() {
        let source = "class A {\n  m() {\n    var x = 1\n    return Fn.new { x }\n  }\n}";
        let proto = compile_module(source).unwrap();
        // Find the method fn, then the block argument fn inside it.
        fn find_fn<'p>(proto: &'p FnProto, name: &str) -> Option<&'p FnProto> {
            for constant in &proto.constants {
                if let Constant::Fn(inner) = constant {
                    if inner.debug.name.contains(name) {
                        return Some(inner);
                    }
                    if let Some(found) = find_fn(inner, name) {
                        return Some(found);
                    }
                }
            }
            None
        }
        let block = find_fn(&proto, "block argument").expect("block argument fn");
        assert_eq!(block.num_upvalues, 1);
        let ops = ops_of(block);
        assert!(ops.contains(&Op::LoadUpvalue));
    }

    #[test]
    fn test_interpolation_lowers_to_join() {
        let mut module = ModuleVars::new();
        for name in ["Object", "List", "Map"] {
            module.define(name, Value::NULL).unwrap();
        }
        let mut method_names = SymbolTable::new();
        let options = CompilerOptions {
            module_name: "test".to_string(),
            is_expression: false,
            accepts_trailing_semicolons: false,
        };
        let source = "var x = 1\nvar s = \"a %(x) b\"";
        compile(&mut module, &mut method_names, source, &options).unwrap();
        assert!(method_names.find("addCore_(_)").is_some());
        assert!(method_names.find("join()").is_some());
    }

    #[test]
    fn test_trailing_semicolon_option() {
        let mut module = ModuleVars::new();
        module.define("Object", Value::NULL).unwrap();
        let mut method_names = SymbolTable::new();
        let options = CompilerOptions {
            module_name: "test".to_string(),
            is_expression: false,
            accepts_trailing_semicolons: true,
        };
        let source = "var x = 1;\nvar y = 2;\n";
        assert!(compile(&mut module, &mut method_names, source, &options).is_ok());
    }

    #[test]
    fn test_semicolon_rejected_by_default() {
        assert!(compile_module("var x = 1;\n").is_err());
    }

    #[test]
    fn test_super_reserves_constant_slot() {
        let source = "class A {\n  foo { 1 }\n}\nclass B is A {\n  foo { super.foo }\n}";
        let proto = compile_module(source).unwrap();
        fn find_method<'p>(proto: &'p FnProto, name: &str) -> Option<&'p FnProto> {
            for constant in &proto.constants {
                if let Constant::Fn(inner) = constant {
                    if inner.debug.name == name {
                        return Some(inner);
                    }
                    if let Some(found) = find_method(inner, name) {
                        return Some(found);
                    }
                }
            }
            None
        }
        let method = find_method(&proto, "foo").expect("method fn");
        let ops = ops_of(method);
        assert!(ops.contains(&Op::Super0));
        // The reserved superclass slot starts as null.
        assert!(method
            .constants
            .iter()
            .any(|constant| matches!(constant, Constant::Null)));
    }

    #[test]
    fn test_attributes_emit_end_class() {
        let source = "#!key = 1\nclass A {}";
        let proto = compile_module(source).unwrap();
        let ops = ops_of(&proto);
        assert!(ops.contains(&Op::EndClass));
    }

    #[test]
    fn test_plain_attributes_are_discarded() {
        let source = "#key = 1\nclass A {}";
        let proto = compile_module(source).unwrap();
        let ops = ops_of(&proto);
        assert!(!ops.contains(&Op::EndClass));
    }

    #[test]
    fn test_static_field_hoisted_to_local() {
        let source = "class Counter {\n  static inc() { __count = 1 }\n}";
        let proto = compile_module(source).unwrap();
        let ops = ops_of(&proto);
        // The implicit null initializer for the hoisted static field lives
        // in the class-definition scope.
        assert!(ops.contains(&Op::Null));
    }
}
