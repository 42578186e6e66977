//! Host configuration.
//!
//! Everything the VM needs from its host flows through this structure:
//! output and diagnostics, module resolution and loading, foreign method
//! and class binding, heap sizing, and the optional language toggles. All
//! callbacks are optional; the defaults keep the VM self-contained.

use crate::vm::Vm;
use core_types::Value;

pub use core_types::ErrorKind;

/// A host function bound as a foreign method.
///
/// Foreign methods read their arguments and write their result through the
/// slot API; slot 0 holds the receiver on entry and the result on exit.
pub type ForeignMethodFn = fn(&mut Vm);

/// A finalizer run on a foreign object's bytes just before the collector
/// frees it.
pub type ForeignFinalizerFn = fn(&mut [u8]);

/// The callbacks a foreign class is built from.
#[derive(Clone, Copy)]
pub struct ForeignClassMethods {
    /// Invoked to populate a new instance; must call
    /// `set_slot_new_foreign` exactly once.
    pub allocate: ForeignMethodFn,
    /// Invoked when the instance is collected.
    pub finalize: Option<ForeignFinalizerFn>,
}

impl std::fmt::Debug for ForeignClassMethods {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignClassMethods")
            .field("finalize", &self.finalize.is_some())
            .finish()
    }
}

/// The result of a primitive method.
///
/// This is the explicit rendering of the primitive convention: a value
/// means the result goes into the argument window's first slot; an error
/// means the current fiber's error field was set; a fiber action means the
/// current fiber changed (or went away) and the interpreter must reload
/// its dispatch state.
pub enum PrimitiveResult {
    /// Completed with this result.
    Value(Value),
    /// Aborted; the fiber error is set.
    Error,
    /// Switched fibers (or suspended the VM).
    FiberAction,
}

/// A Rust function bound as a primitive method.
///
/// `args_start` indexes the receiver in the current fiber's stack; the
/// arguments follow it.
pub type PrimitiveFn = fn(&mut Vm, usize) -> PrimitiveResult;

/// Host configuration for a VM instance.
pub struct Configuration {
    /// Receives everything scripts print.
    pub write_fn: Option<Box<dyn FnMut(&str)>>,
    /// Receives compile errors, runtime errors, and stack-trace frames.
    pub error_fn: Option<Box<dyn FnMut(ErrorKind, &str, i32, &str)>>,
    /// Rewrites an imported module name relative to the importing module.
    pub resolve_module_fn: Option<Box<dyn FnMut(&str, &str) -> Option<String>>>,
    /// Produces the source of an imported module.
    pub load_module_fn: Option<Box<dyn FnMut(&str) -> Option<String>>>,
    /// Resolves a foreign method declaration to a host function.
    pub bind_foreign_method_fn:
        Option<Box<dyn FnMut(&str, &str, bool, &str) -> Option<ForeignMethodFn>>>,
    /// Resolves a foreign class declaration to its allocate/finalize pair.
    pub bind_foreign_class_fn: Option<Box<dyn FnMut(&str, &str) -> Option<ForeignClassMethods>>>,
    /// Invoked by the `$` string method; absent means `$` yields null.
    pub dollar_operator_fn: Option<ForeignMethodFn>,
    /// Heap size that triggers the first collection.
    pub initial_heap_size: usize,
    /// Floor for the next-collection threshold.
    pub min_heap_size: usize,
    /// Growth of the threshold after each collection, in percent.
    pub heap_growth_percent: usize,
    /// Permit a single `;` after imports, statements, and declarations.
    pub accepts_trailing_semicolons: bool,
}

impl Default for Configuration {
    fn default() -> Configuration {
        Configuration {
            write_fn: None,
            error_fn: None,
            resolve_module_fn: None,
            load_module_fn: None,
            bind_foreign_method_fn: None,
            bind_foreign_class_fn: None,
            dollar_operator_fn: None,
            initial_heap_size: 10 * 1024 * 1024,
            min_heap_size: 1024 * 1024,
            heap_growth_percent: 50,
            accepts_trailing_semicolons: false,
        }
    }
}

impl std::fmt::Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration")
            .field("initial_heap_size", &self.initial_heap_size)
            .field("min_heap_size", &self.min_heap_size)
            .field("heap_growth_percent", &self.heap_growth_percent)
            .field("accepts_trailing_semicolons", &self.accepts_trailing_semicolons)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Configuration::default();
        assert_eq!(config.initial_heap_size, 10 * 1024 * 1024);
        assert_eq!(config.min_heap_size, 1024 * 1024);
        assert_eq!(config.heap_growth_percent, 50);
        assert!(!config.accepts_trailing_semicolons);
        assert!(config.write_fn.is_none());
        assert!(config.dollar_operator_fn.is_none());
    }
}
