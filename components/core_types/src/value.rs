//! The uniform value representation.
//!
//! A `Value` is a 64-bit cell holding either an immediate (a number, a
//! boolean, `null`, or the internal `undefined` sentinel) or a reference to
//! a heap object. Two representations are provided behind a compile-time
//! choice:
//!
//! - The default is a plain Rust enum: readable, safe, and portable.
//! - With the `nan_boxing` feature, values pack into a single `u64`. A
//!   non-NaN bit pattern is a double. A quiet NaN with the sign bit set
//!   carries an object identifier in its payload; with the sign bit clear,
//!   three low tag bits select one of the singletons.
//!
//! Both expose an identical API, so no other component can tell them apart.
//!
//! `undefined` is never visible to scripts. It marks unused map slots and
//! module variables that have been referenced but not yet declared.

use std::fmt;

/// Identifier of a heap-allocated object.
///
/// An `ObjId` is an index into the heap's object slab. It is `Copy` and
/// meaningless without the heap that issued it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ObjId(u32);

impl ObjId {
    /// Create an identifier from a slab index.
    pub fn new(index: usize) -> ObjId {
        ObjId(index as u32)
    }

    /// The slab index this identifier refers to.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[cfg(not(feature = "nan_boxing"))]
pub use self::enum_repr::Value;

#[cfg(feature = "nan_boxing")]
pub use self::nan_repr::Value;

#[cfg(not(feature = "nan_boxing"))]
mod enum_repr {
    use super::ObjId;

    /// A Siskin value: the tagged-union representation.
    #[derive(Clone, Copy)]
    pub enum Value {
        /// The boolean `false`.
        False,
        /// The `null` value.
        Null,
        /// A double-precision number.
        Num(f64),
        /// The boolean `true`.
        True,
        /// The internal sentinel, never visible to scripts.
        Undefined,
        /// A reference to a heap object.
        Obj(ObjId),
    }

    impl Value {
        /// The `null` value.
        pub const NULL: Value = Value::Null;
        /// The boolean `true`.
        pub const TRUE: Value = Value::True;
        /// The boolean `false`.
        pub const FALSE: Value = Value::False;
        /// The internal undefined sentinel.
        pub const UNDEFINED: Value = Value::Undefined;

        /// Wrap a number.
        pub fn num(n: f64) -> Value {
            Value::Num(n)
        }

        /// Wrap a boolean.
        pub fn from_bool(b: bool) -> Value {
            if b {
                Value::True
            } else {
                Value::False
            }
        }

        /// Wrap an object reference.
        pub fn obj(id: ObjId) -> Value {
            Value::Obj(id)
        }

        /// Whether this value is a number.
        pub fn is_num(self) -> bool {
            matches!(self, Value::Num(_))
        }

        /// Whether this value is an object reference.
        pub fn is_obj(self) -> bool {
            matches!(self, Value::Obj(_))
        }

        /// Whether this value is `null`.
        pub fn is_null(self) -> bool {
            matches!(self, Value::Null)
        }

        /// Whether this value is the undefined sentinel.
        pub fn is_undefined(self) -> bool {
            matches!(self, Value::Undefined)
        }

        /// Whether this value is `true` or `false`.
        pub fn is_bool(self) -> bool {
            matches!(self, Value::True | Value::False)
        }

        /// Whether this value is the boolean `true`.
        pub fn is_true(self) -> bool {
            matches!(self, Value::True)
        }

        /// Whether this value counts as false in a condition: only `false`
        /// and `null` do.
        pub fn is_falsy(self) -> bool {
            matches!(self, Value::False | Value::Null)
        }

        /// The number stored in this value, or `None` if it is not one.
        pub fn try_num(self) -> Option<f64> {
            match self {
                Value::Num(n) => Some(n),
                _ => None,
            }
        }

        /// The number stored in this value.
        ///
        /// Callers must have checked `is_num` first.
        pub fn as_num(self) -> f64 {
            match self {
                Value::Num(n) => n,
                _ => unreachable!("value is not a number"),
            }
        }

        /// The object identifier stored in this value, or `None`.
        pub fn try_obj(self) -> Option<ObjId> {
            match self {
                Value::Obj(id) => Some(id),
                _ => None,
            }
        }

        /// The object identifier stored in this value.
        ///
        /// Callers must have checked `is_obj` first.
        pub fn as_obj(self) -> ObjId {
            match self {
                Value::Obj(id) => id,
                _ => unreachable!("value is not an object"),
            }
        }

        /// Identity equality: numbers compare by value, objects by
        /// identifier, singletons by kind. Deep equality for strings and
        /// ranges is layered on top of this by the VM.
        pub fn same(self, other: Value) -> bool {
            match (self, other) {
                (Value::Num(a), Value::Num(b)) => a == b,
                (Value::Obj(a), Value::Obj(b)) => a == b,
                (Value::False, Value::False) => true,
                (Value::True, Value::True) => true,
                (Value::Null, Value::Null) => true,
                (Value::Undefined, Value::Undefined) => true,
                _ => false,
            }
        }
    }
}

#[cfg(feature = "nan_boxing")]
mod nan_repr {
    use super::ObjId;

    // A quiet NaN has all exponent bits and the quiet bit set. Any double
    // produced by arithmetic keeps at least one of these clear or carries a
    // zero payload, so the tag space below never collides with real numbers.
    const SIGN_BIT: u64 = 1 << 63;
    const QNAN: u64 = 0x7ffc_0000_0000_0000;

    const TAG_NULL: u64 = 1;
    const TAG_FALSE: u64 = 2;
    const TAG_TRUE: u64 = 3;
    const TAG_UNDEFINED: u64 = 4;

    /// A Siskin value: the NaN-tagged representation.
    #[derive(Clone, Copy)]
    pub struct Value(u64);

    impl Value {
        /// The `null` value.
        pub const NULL: Value = Value(QNAN | TAG_NULL);
        /// The boolean `true`.
        pub const TRUE: Value = Value(QNAN | TAG_TRUE);
        /// The boolean `false`.
        pub const FALSE: Value = Value(QNAN | TAG_FALSE);
        /// The internal undefined sentinel.
        pub const UNDEFINED: Value = Value(QNAN | TAG_UNDEFINED);

        /// Wrap a number.
        pub fn num(n: f64) -> Value {
            Value(n.to_bits())
        }

        /// Wrap a boolean.
        pub fn from_bool(b: bool) -> Value {
            if b {
                Value::TRUE
            } else {
                Value::FALSE
            }
        }

        /// Wrap an object reference.
        pub fn obj(id: ObjId) -> Value {
            Value(SIGN_BIT | QNAN | id.index() as u64)
        }

        /// Whether this value is a number.
        pub fn is_num(self) -> bool {
            (self.0 & QNAN) != QNAN
        }

        /// Whether this value is an object reference.
        pub fn is_obj(self) -> bool {
            (self.0 & (QNAN | SIGN_BIT)) == (QNAN | SIGN_BIT)
        }

        /// Whether this value is `null`.
        pub fn is_null(self) -> bool {
            self.0 == Value::NULL.0
        }

        /// Whether this value is the undefined sentinel.
        pub fn is_undefined(self) -> bool {
            self.0 == Value::UNDEFINED.0
        }

        /// Whether this value is `true` or `false`.
        pub fn is_bool(self) -> bool {
            self.0 == Value::TRUE.0 || self.0 == Value::FALSE.0
        }

        /// Whether this value is the boolean `true`.
        pub fn is_true(self) -> bool {
            self.0 == Value::TRUE.0
        }

        /// Whether this value counts as false in a condition: only `false`
        /// and `null` do.
        pub fn is_falsy(self) -> bool {
            self.0 == Value::FALSE.0 || self.0 == Value::NULL.0
        }

        /// The number stored in this value, or `None` if it is not one.
        pub fn try_num(self) -> Option<f64> {
            if self.is_num() {
                Some(f64::from_bits(self.0))
            } else {
                None
            }
        }

        /// The number stored in this value.
        ///
        /// Callers must have checked `is_num` first.
        pub fn as_num(self) -> f64 {
            debug_assert!(self.is_num());
            f64::from_bits(self.0)
        }

        /// The object identifier stored in this value, or `None`.
        pub fn try_obj(self) -> Option<ObjId> {
            if self.is_obj() {
                Some(self.as_obj())
            } else {
                None
            }
        }

        /// The object identifier stored in this value.
        ///
        /// Callers must have checked `is_obj` first.
        pub fn as_obj(self) -> ObjId {
            debug_assert!(self.is_obj());
            ObjId::new((self.0 & !(SIGN_BIT | QNAN)) as usize)
        }

        /// Identity equality. With NaN tagging two values are identical
        /// exactly when their bit patterns match.
        pub fn same(self, other: Value) -> bool {
            self.0 == other.0
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_num() {
            write!(f, "Num({})", self.as_num())
        } else if self.is_obj() {
            write!(f, "Obj({})", self.as_obj().index())
        } else if self.is_null() {
            write!(f, "Null")
        } else if self.is_undefined() {
            write!(f, "Undefined")
        } else if self.is_true() {
            write!(f, "True")
        } else {
            write!(f, "False")
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::NULL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singletons_are_distinct() {
        assert!(!Value::NULL.same(Value::FALSE));
        assert!(!Value::NULL.same(Value::UNDEFINED));
        assert!(!Value::TRUE.same(Value::FALSE));
        assert!(Value::NULL.same(Value::NULL));
    }

    #[test]
    fn test_num_round_trip() {
        for n in [0.0, -0.0, 1.5, -3.25, 1e300, f64::MIN_POSITIVE] {
            let v = Value::num(n);
            assert!(v.is_num());
            assert_eq!(v.as_num(), n);
        }
    }

    #[test]
    fn test_nan_is_still_a_number() {
        let v = Value::num(f64::NAN);
        assert!(v.is_num());
        assert!(v.as_num().is_nan());
        assert!(!v.is_obj());
        assert!(!v.is_null());
    }

    #[test]
    fn test_obj_round_trip() {
        let id = ObjId::new(12345);
        let v = Value::obj(id);
        assert!(v.is_obj());
        assert!(!v.is_num());
        assert_eq!(v.as_obj(), id);
    }

    #[test]
    fn test_falsiness() {
        assert!(Value::FALSE.is_falsy());
        assert!(Value::NULL.is_falsy());
        assert!(!Value::TRUE.is_falsy());
        assert!(!Value::num(0.0).is_falsy());
        assert!(!Value::obj(ObjId::new(0)).is_falsy());
    }

    #[test]
    fn test_same_compares_numbers_by_value() {
        assert!(Value::num(2.0).same(Value::num(2.0)));
        assert!(!Value::num(2.0).same(Value::num(3.0)));
    }

    #[test]
    fn test_same_compares_objects_by_identity() {
        assert!(Value::obj(ObjId::new(7)).same(Value::obj(ObjId::new(7))));
        assert!(!Value::obj(ObjId::new(7)).same(Value::obj(ObjId::new(8))));
    }

    #[test]
    fn test_bool_queries() {
        assert!(Value::TRUE.is_bool());
        assert!(Value::FALSE.is_bool());
        assert!(!Value::NULL.is_bool());
        assert!(Value::from_bool(true).is_true());
        assert!(!Value::from_bool(false).is_true());
    }
}
