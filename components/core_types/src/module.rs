//! Module-level variable storage.
//!
//! A module owns a symbol table of variable names and a parallel array of
//! values. Both the compiler and the VM mutate it: the compiler declares
//! variables (including implicit forward references), and the VM reads and
//! writes the slots while executing `LOAD_MODULE_VAR` / `STORE_MODULE_VAR`.

use crate::symbol::SymbolTable;
use crate::value::Value;
use crate::MAX_MODULE_VARS;

/// Why a variable definition was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefineError {
    /// The name is already explicitly defined in the module.
    AlreadyDefined,
    /// The module has reached its variable limit.
    TooManyVariables,
    /// A local-style (lowercase) name was used before this definition; the
    /// payload is the line of the first use.
    UsedBeforeDefinition(u32),
}

/// The variable table of one module.
///
/// A forward reference creates an *implicit* declaration whose stored value
/// is the line number it was first used on (a plain number, which scripts
/// can never observe because the slot is either replaced by the real
/// definition or reported as an error at the end of compilation).
#[derive(Debug, Default, Clone)]
pub struct ModuleVars {
    names: SymbolTable,
    values: Vec<Value>,
}

/// Whether a name follows the local-variable convention (leading lowercase
/// letter or underscore). Such names may not be referenced at module scope
/// before their definition.
pub fn is_local_name(name: &str) -> bool {
    name.chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
}

impl ModuleVars {
    /// Create an empty table.
    pub fn new() -> ModuleVars {
        ModuleVars::default()
    }

    /// Number of declared variables, implicit ones included.
    pub fn count(&self) -> usize {
        self.values.len()
    }

    /// Look up a variable's slot by name.
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.names.find(name)
    }

    /// The name of a slot.
    pub fn name(&self, slot: usize) -> &str {
        self.names.name(slot)
    }

    /// The value currently stored in a slot.
    pub fn value(&self, slot: usize) -> Value {
        self.values[slot]
    }

    /// Overwrite the value in a slot.
    pub fn set_value(&mut self, slot: usize, value: Value) {
        self.values[slot] = value;
    }

    /// Whether a slot is still an implicit (forward) declaration.
    pub fn is_implicit(&self, slot: usize) -> bool {
        self.values[slot].is_num()
    }

    /// Implicitly declare a variable on first forward use, recording the
    /// line for later diagnostics.
    pub fn declare_implicit(&mut self, name: &str, line: u32) -> Result<usize, DefineError> {
        if self.values.len() >= MAX_MODULE_VARS {
            return Err(DefineError::TooManyVariables);
        }
        let slot = self.names.add(name);
        self.values.push(Value::num(line as f64));
        Ok(slot)
    }

    /// Explicitly define a variable.
    ///
    /// Filling in an earlier implicit declaration succeeds unless the name
    /// is local-style, in which case the forward use was an error.
    pub fn define(&mut self, name: &str, value: Value) -> Result<usize, DefineError> {
        match self.names.find(name) {
            Some(slot) => {
                if !self.is_implicit(slot) {
                    return Err(DefineError::AlreadyDefined);
                }
                if is_local_name(name) {
                    let line = self.values[slot].as_num() as u32;
                    return Err(DefineError::UsedBeforeDefinition(line));
                }
                self.values[slot] = value;
                Ok(slot)
            }
            None => {
                if self.values.len() >= MAX_MODULE_VARS {
                    return Err(DefineError::TooManyVariables);
                }
                let slot = self.names.add(name);
                self.values.push(value);
                Ok(slot)
            }
        }
    }

    /// Iterate over `(slot, name, value)` triples.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str, Value)> {
        self.names
            .iter()
            .map(|(slot, name)| (slot, name, self.values[slot]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_and_lookup() {
        let mut vars = ModuleVars::new();
        let slot = vars.define("Answer", Value::num(42.0)).unwrap();
        assert_eq!(vars.lookup("Answer"), Some(slot));
        assert_eq!(vars.value(slot).as_num(), 42.0);
    }

    #[test]
    fn test_duplicate_definition_rejected() {
        let mut vars = ModuleVars::new();
        vars.define("x", Value::NULL).unwrap();
        assert_eq!(vars.define("x", Value::NULL), Err(DefineError::AlreadyDefined));
    }

    #[test]
    fn test_forward_reference_filled_in() {
        let mut vars = ModuleVars::new();
        let slot = vars.declare_implicit("Widget", 7).unwrap();
        assert!(vars.is_implicit(slot));

        let defined = vars.define("Widget", Value::NULL).unwrap();
        assert_eq!(defined, slot);
        assert!(!vars.is_implicit(slot));
    }

    #[test]
    fn test_local_name_used_before_definition() {
        let mut vars = ModuleVars::new();
        vars.declare_implicit("count", 12).unwrap();
        assert_eq!(
            vars.define("count", Value::NULL),
            Err(DefineError::UsedBeforeDefinition(12))
        );
    }

    #[test]
    fn test_is_local_name() {
        assert!(is_local_name("count"));
        assert!(is_local_name("_private"));
        assert!(!is_local_name("Widget"));
    }
}
