//! Tagged runtime values.
//!
//! A `Value` is one scalar slot on the operand stack or in a frame's
//! locals. It either carries a number inline or a handle to a heap
//! object. Every payload read goes through a tag-guarded accessor or an
//! exhaustive `match`, so reading the wrong variant is unrepresentable.

use std::fmt;

use crate::heap::Handle;

/// A single VM value: a number carried inline, or a handle to a
/// garbage-collected heap object.
#[derive(Clone, Copy, PartialEq)]
pub enum Value {
    Number(f64),
    Obj(Handle),
}

impl Value {
    /// Returns `true` if this value is a number.
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Number(_))
    }

    /// Returns `true` if this value references a heap object.
    pub fn is_obj(&self) -> bool {
        matches!(self, Value::Obj(_))
    }

    /// Unpack the numeric payload. Returns `None` for object handles.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Obj(_) => None,
        }
    }

    /// Unpack the heap handle. Returns `None` for numbers.
    pub fn as_obj(&self) -> Option<Handle> {
        match self {
            Value::Obj(h) => Some(*h),
            Value::Number(_) => None,
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<Handle> for Value {
    fn from(h: Handle) -> Self {
        Value::Obj(h)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "Number({n})"),
            Value::Obj(h) => write!(f, "Obj({h:?})"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Obj(h) => write!(f, "<pair #{}>", h.index()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_accessors() {
        let v = Value::Number(42.0);
        assert!(v.is_number());
        assert!(!v.is_obj());
        assert_eq!(v.as_number(), Some(42.0));
        assert_eq!(v.as_obj(), None);
    }

    #[test]
    fn test_obj_accessors() {
        let h = Handle::from_raw(3, 1);
        let v = Value::Obj(h);
        assert!(v.is_obj());
        assert!(!v.is_number());
        assert_eq!(v.as_obj(), Some(h));
        assert_eq!(v.as_number(), None);
    }

    #[test]
    fn test_from_impls() {
        assert_eq!(Value::from(1.5), Value::Number(1.5));
        let h = Handle::from_raw(0, 0);
        assert_eq!(Value::from(h), Value::Obj(h));
    }

    #[test]
    fn test_equality() {
        assert_eq!(Value::Number(2.0), Value::Number(2.0));
        assert_ne!(Value::Number(2.0), Value::Number(3.0));
        let a = Handle::from_raw(1, 0);
        let b = Handle::from_raw(1, 1);
        assert_ne!(Value::Obj(a), Value::Obj(b));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Value::Number(5.0)), "5");
        let v = Value::Obj(Handle::from_raw(7, 2));
        assert_eq!(format!("{v}"), "<pair #7>");
    }
}
