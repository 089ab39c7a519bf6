//! Operator semantics: checked integer arithmetic, IEEE floats, strict
//! comparison between kinds.

use super::VmError;
use skein_compiler::compiler::ast::{BinOp, UnaryOp};
use skein_core::Value;
use std::cmp::Ordering;

pub(crate) fn binary(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, VmError> {
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => arith(op, lhs, rhs),
        BinOp::Eq => Ok(Value::Bool(values_equal(&lhs, &rhs)?)),
        BinOp::NotEq => Ok(Value::Bool(!values_equal(&lhs, &rhs)?)),
        BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq => {
            let ord = compare(&lhs, &rhs).ok_or_else(|| mismatch(op, &lhs, &rhs))?;
            // NaN compares false against everything.
            let result = match ord {
                None => false,
                Some(ord) => match op {
                    BinOp::Lt => ord == Ordering::Less,
                    BinOp::LtEq => ord != Ordering::Greater,
                    BinOp::Gt => ord == Ordering::Greater,
                    _ => ord != Ordering::Less,
                },
            };
            Ok(Value::Bool(result))
        }
        BinOp::And | BinOp::Or => match (&lhs, &rhs) {
            (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(if op == BinOp::And { *a && *b } else { *a || *b })),
            _ => Err(mismatch(op, &lhs, &rhs)),
        },
    }
}

pub(crate) fn unary(op: UnaryOp, operand: Value) -> Result<Value, VmError> {
    match (op, operand) {
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Neg, Value::Int(n)) => {
            n.checked_neg().map(Value::Int).ok_or_else(|| VmError::Arithmetic(format!("integer overflow negating {}", n)))
        }
        (UnaryOp::Neg, Value::Float(x)) => Ok(Value::Float(-x)),
        (op, v) => Err(VmError::Type(format!("cannot apply {} to {}", op, v.type_name()))),
    }
}

fn arith(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, VmError> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => int_arith(op, a, b).map(Value::Int),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(float_arith(op, a as f64, b))),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(float_arith(op, a, b as f64))),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(float_arith(op, a, b))),
        (Value::Str(mut a), Value::Str(b)) if op == BinOp::Add => {
            a.push_str(&b);
            Ok(Value::Str(a))
        }
        (lhs, rhs) => Err(mismatch(op, &lhs, &rhs)),
    }
}

fn int_arith(op: BinOp, a: i64, b: i64) -> Result<i64, VmError> {
    if b == 0 && matches!(op, BinOp::Div | BinOp::Mod) {
        return Err(VmError::Arithmetic("division by zero".into()));
    }
    // Rust's `/` and `%` on integers truncate toward zero.
    let result = match op {
        BinOp::Add => a.checked_add(b),
        BinOp::Sub => a.checked_sub(b),
        BinOp::Mul => a.checked_mul(b),
        BinOp::Div => a.checked_div(b),
        _ => a.checked_rem(b),
    };
    result.ok_or_else(|| VmError::Arithmetic(format!("integer overflow in {} {} {}", a, op, b)))
}

fn float_arith(op: BinOp, a: f64, b: f64) -> f64 {
    match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        _ => a % b,
    }
}

/// Equality. Different kinds are an error, except int/float pairs and
/// comparisons against null. Lists compare element-wise under the same
/// rules; lists of different length are unequal.
pub(crate) fn values_equal(lhs: &Value, rhs: &Value) -> Result<bool, VmError> {
    match (lhs, rhs) {
        (Value::Null, other) | (other, Value::Null) => Ok(matches!(other, Value::Null)),
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => Ok((*a as f64) == *b),
        (Value::List(a), Value::List(b)) => {
            if a.len() != b.len() {
                return Ok(false);
            }
            for (x, y) in a.iter().zip(b) {
                if !values_equal(x, y)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        (a, b) if std::mem::discriminant(a) == std::mem::discriminant(b) => Ok(a == b),
        (a, b) => Err(VmError::Type(format!("cannot compare {} with {}", a.type_name(), b.type_name()))),
    }
}

/// Ordering for `< <= > >=`. The outer `None` means the kinds are not
/// ordered; the inner `None` is an unordered float pair.
fn compare(lhs: &Value, rhs: &Value) -> Option<Option<Ordering>> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Some(Some(a.cmp(b))),
        (Value::Int(a), Value::Float(b)) => Some((*a as f64).partial_cmp(b)),
        (Value::Float(a), Value::Int(b)) => Some(a.partial_cmp(&(*b as f64))),
        (Value::Float(a), Value::Float(b)) => Some(a.partial_cmp(b)),
        (Value::Str(a), Value::Str(b)) => Some(Some(a.cmp(b))),
        _ => None,
    }
}

fn mismatch(op: BinOp, lhs: &Value, rhs: &Value) -> VmError {
    VmError::Type(format!("cannot apply {} to {} and {}", op, lhs.type_name(), rhs.type_name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bin(op: BinOp, a: impl Into<Value>, b: impl Into<Value>) -> Result<Value, VmError> {
        binary(op, a.into(), b.into())
    }

    #[test]
    fn int_arithmetic_is_checked() {
        assert_eq!(bin(BinOp::Add, 2i64, 3i64).unwrap(), Value::Int(5));
        assert_eq!(bin(BinOp::Div, -7i64, 2i64).unwrap(), Value::Int(-3));
        assert_eq!(bin(BinOp::Mod, -7i64, 2i64).unwrap(), Value::Int(-1));
        assert!(matches!(bin(BinOp::Add, i64::MAX, 1i64), Err(VmError::Arithmetic(_))));
        assert!(matches!(bin(BinOp::Div, 1i64, 0i64), Err(VmError::Arithmetic(_))));
        assert!(matches!(bin(BinOp::Mod, 1i64, 0i64), Err(VmError::Arithmetic(_))));
        assert!(matches!(bin(BinOp::Div, i64::MIN, -1i64), Err(VmError::Arithmetic(_))));
        assert!(matches!(unary(UnaryOp::Neg, Value::Int(i64::MIN)), Err(VmError::Arithmetic(_))));
    }

    #[test]
    fn mixed_numbers_promote_to_float() {
        assert_eq!(bin(BinOp::Add, 1i64, 0.5f64).unwrap(), Value::Float(1.5));
        assert_eq!(bin(BinOp::Div, 1.0f64, 0i64).unwrap(), Value::Float(f64::INFINITY));
        assert_eq!(bin(BinOp::Gt, 0.7f64, 0.5f64).unwrap(), Value::Bool(true));
        assert_eq!(bin(BinOp::Lt, 1i64, 1.5f64).unwrap(), Value::Bool(true));
        assert_eq!(bin(BinOp::Eq, 2i64, 2.0f64).unwrap(), Value::Bool(true));
        assert_eq!(bin(BinOp::GtEq, f64::NAN, 1.0f64).unwrap(), Value::Bool(false));
    }

    #[test]
    fn strings_concat_and_order() {
        assert_eq!(bin(BinOp::Add, "ab", "cd").unwrap(), Value::Str("abcd".into()));
        assert_eq!(bin(BinOp::Lt, "a", "b").unwrap(), Value::Bool(true));
        assert!(matches!(bin(BinOp::Sub, "a", "b"), Err(VmError::Type(_))));
        assert!(matches!(bin(BinOp::Add, "a", 1i64), Err(VmError::Type(_))));
    }

    #[test]
    fn equality_across_kinds() {
        assert!(matches!(bin(BinOp::Eq, "yes", true), Err(VmError::Type(_))));
        assert!(matches!(bin(BinOp::Lt, "yes", true), Err(VmError::Type(_))));
        assert_eq!(binary(BinOp::Eq, Value::Null, Value::Int(1)).unwrap(), Value::Bool(false));
        assert_eq!(binary(BinOp::NotEq, Value::Str("x".into()), Value::Null).unwrap(), Value::Bool(true));
        assert_eq!(binary(BinOp::Eq, Value::Null, Value::Null).unwrap(), Value::Bool(true));
        let list = Value::List(vec![Value::Int(1)]);
        assert_eq!(binary(BinOp::Eq, list.clone(), list).unwrap(), Value::Bool(true));
    }

    #[test]
    fn list_equality_follows_element_rules() {
        let ints = Value::List(vec![Value::Int(1), Value::Null]);
        let floats = Value::List(vec![Value::Float(1.0), Value::Null]);
        assert_eq!(binary(BinOp::Eq, ints.clone(), floats).unwrap(), Value::Bool(true));
        let longer = Value::List(vec![Value::Int(1), Value::Null, Value::Int(2)]);
        assert_eq!(binary(BinOp::NotEq, ints, longer).unwrap(), Value::Bool(true));

        let strs = Value::List(vec![Value::Str("a".into())]);
        let bools = Value::List(vec![Value::Bool(true)]);
        assert!(matches!(binary(BinOp::Eq, strs, bools), Err(VmError::Type(_))));
        let nested = |v| Value::List(vec![Value::List(vec![v])]);
        assert!(matches!(binary(BinOp::Eq, nested(Value::Int(1)), nested(Value::Bool(true))), Err(VmError::Type(_))));
    }

    #[test]
    fn logic_requires_bools() {
        assert_eq!(bin(BinOp::And, true, false).unwrap(), Value::Bool(false));
        assert_eq!(bin(BinOp::Or, true, false).unwrap(), Value::Bool(true));
        assert!(matches!(bin(BinOp::And, 1i64, true), Err(VmError::Type(_))));
        assert_eq!(unary(UnaryOp::Not, Value::Bool(true)).unwrap(), Value::Bool(false));
        assert!(matches!(unary(UnaryOp::Not, Value::Int(0)), Err(VmError::Type(_))));
    }
}
