//! Method signatures.
//!
//! A signature canonically identifies a method by name, shape, and arity:
//! `name`, `name(_,…,_)`, `name=(_)`, `[_,…]`, `[_,…]=(_)`, or the
//! initializer form `init name(_,…,_)`. Definition sites and call sites
//! build the same string, which is then interned into the global
//! method-name symbol table.

use std::fmt;

/// The shape of a method signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigKind {
    /// A name with no parameter list: `count`.
    Getter,
    /// A named assignment target: `count=(_)`.
    Setter,
    /// A named call: `insert(_,_)`.
    Method,
    /// A subscript read: `[_]`.
    Subscript,
    /// A subscript write: `[_]=(_)`.
    SubscriptSetter,
    /// A constructor body: `init new(_)`.
    Initializer,
}

/// A method signature under construction or comparison.
#[derive(Debug, Clone)]
pub struct Signature {
    /// The bare method name (empty for subscript forms).
    pub name: String,
    /// The signature shape.
    pub kind: SigKind,
    /// Number of parameters.
    pub arity: usize,
}

impl Signature {
    /// A getter signature for `name`.
    pub fn getter(name: &str) -> Signature {
        Signature {
            name: name.to_string(),
            kind: SigKind::Getter,
            arity: 0,
        }
    }

    /// A method signature for `name` with `arity` parameters.
    pub fn method(name: &str, arity: usize) -> Signature {
        Signature {
            name: name.to_string(),
            kind: SigKind::Method,
            arity,
        }
    }
}

fn write_params(f: &mut fmt::Formatter<'_>, arity: usize) -> fmt::Result {
    write!(f, "(")?;
    for i in 0..arity {
        if i > 0 {
            write!(f, ",")?;
        }
        write!(f, "_")?;
    }
    write!(f, ")")
}

fn write_brackets(f: &mut fmt::Formatter<'_>, arity: usize) -> fmt::Result {
    write!(f, "[")?;
    for i in 0..arity {
        if i > 0 {
            write!(f, ",")?;
        }
        write!(f, "_")?;
    }
    write!(f, "]")
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SigKind::Getter => write!(f, "{}", self.name),
            SigKind::Setter => write!(f, "{}=(_)", self.name),
            SigKind::Method => {
                write!(f, "{}", self.name)?;
                write_params(f, self.arity)
            }
            SigKind::Subscript => write_brackets(f, self.arity),
            SigKind::SubscriptSetter => {
                write_brackets(f, self.arity)?;
                write!(f, "=(_)")
            }
            SigKind::Initializer => {
                write!(f, "init {}", self.name)?;
                write_params(f, self.arity)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_getter() {
        assert_eq!(Signature::getter("count").to_string(), "count");
    }

    #[test]
    fn test_method_arities() {
        assert_eq!(Signature::method("f", 0).to_string(), "f()");
        assert_eq!(Signature::method("insert", 2).to_string(), "insert(_,_)");
    }

    #[test]
    fn test_setter() {
        let sig = Signature {
            name: "x".to_string(),
            kind: SigKind::Setter,
            arity: 1,
        };
        assert_eq!(sig.to_string(), "x=(_)");
    }

    #[test]
    fn test_subscripts() {
        let get = Signature {
            name: String::new(),
            kind: SigKind::Subscript,
            arity: 2,
        };
        assert_eq!(get.to_string(), "[_,_]");

        let set = Signature {
            name: String::new(),
            kind: SigKind::SubscriptSetter,
            arity: 1,
        };
        assert_eq!(set.to_string(), "[_]=(_)");
    }

    #[test]
    fn test_initializer() {
        let sig = Signature {
            name: "new".to_string(),
            kind: SigKind::Initializer,
            arity: 1,
        };
        assert_eq!(sig.to_string(), "init new(_)");
    }
}
