//! The value/type registry (spec sections 3.3 and 4.2, component B).
//!
//! Custom types are registered by the host as a [`TypeDescriptor`] trait
//! object; builtin `STRING`/`UINT`/`FLOAT` have fixed implementations baked
//! into [`perform_op`] and friends so the common path never goes through
//! dynamic dispatch.

use crate::error::RuntimeFault;
use crate::value::{checked_div_uint, checked_rem_uint, CustomValue, StringValue, Value};

/// Identifies a value's type: the three builtins plus any host-registered
/// custom type (spec section 3.2, `id >= 3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u16);

impl TypeId {
    pub const STRING: TypeId = TypeId(0);
    pub const UINT: TypeId = TypeId(1);
    pub const FLOAT: TypeId = TypeId(2);
    const CUSTOM_BASE: u16 = 3;

    #[must_use]
    pub fn is_custom(self) -> bool {
        self.0 >= Self::CUSTOM_BASE
    }

    #[must_use]
    pub fn raw(self) -> u16 {
        self.0
    }

    /// Reconstructs a `TypeId` from its raw id, for [`crate::serialize`]
    /// restoring a custom value's type across a save/load round trip.
    #[must_use]
    pub fn from_raw(raw: u16) -> Self {
        TypeId(raw)
    }
}

/// A storage interface presented to a custom type's `cast` callback (spec
/// section 3.3): either a raw host-interpreted address, a register of `N`
/// values, or a single stack slot.
pub enum Storage<'a> {
    Address(u64),
    Register(&'a mut [Value]),
    StackSlot(&'a mut Value),
}

/// The binary/unary operator selector passed to `PerformOp` (spec section 3.3
/// opcode inventory subset relevant to operator dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    Xor,
    Shl,
    Shr,
    Neg,
    OnesComplement,
    Not,
    NotFloat,
    CmpEq,
    CmpNe,
    CmpLt,
    CmpLe,
    CmpGr,
    CmpGe,
    Concat,
    ConcatSpace,
    ConcatTab,
    ConcatNewline,
}

/// Four callbacks a host supplies for each registered custom type (spec
/// section 3.3).
pub trait TypeDescriptor {
    fn type_class_name(&self) -> &str;

    /// Optional separator inserted when this type is concatenated with
    /// another during string assembly (spec section 3.3).
    fn type_prefix(&self) -> Option<&str> {
        None
    }

    /// Field-layout size in bytes, for object field storage.
    fn field_size(&self) -> usize;

    /// In-register value size, or `None` if variable-sized.
    fn register_size(&self) -> Option<usize>;

    /// Converts between this type and another, via the abstract storage
    /// interfaces (spec section 3.3).
    fn cast(&self, from: Storage<'_>, to: Storage<'_>) -> Result<(), RuntimeFault>;

    /// Executes a binary or unary operator (spec section 3.3).
    fn perform_op(&self, op: Op, lhs: &Value, rhs: Option<&Value>) -> Result<Value, RuntimeFault>;
}

/// Owns the host-registered custom type descriptors, keyed by [`TypeId`].
#[derive(Default)]
pub struct TypeRegistry {
    custom: Vec<Box<dyn TypeDescriptor>>,
}

impl TypeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a custom type, assigning the next available id (spec
    /// section 4.2: `register_type(descriptor) -> type_id`, ids start at 3).
    pub fn register_type(&mut self, descriptor: Box<dyn TypeDescriptor>) -> TypeId {
        let id = TypeId(u16::try_from(self.custom.len()).expect("type registry overflow") + TypeId::CUSTOM_BASE);
        self.custom.push(descriptor);
        id
    }

    #[must_use]
    pub fn get(&self, id: TypeId) -> Option<&dyn TypeDescriptor> {
        if id.is_custom() {
            self.custom
                .get((id.raw() - TypeId::CUSTOM_BASE) as usize)
                .map(std::convert::AsRef::as_ref)
        } else {
            None
        }
    }

    /// Display name for error messages (spec section 4.2).
    #[must_use]
    pub fn class_name(&self, id: TypeId) -> &str {
        match id {
            TypeId::STRING => "string",
            TypeId::UINT => "int",
            TypeId::FLOAT => "float",
            other => self.get(other).map_or("unknown", TypeDescriptor::type_class_name),
        }
    }

    /// `value_as_int` (spec section 4.2): dispatches on tag; custom types
    /// invoke their `Cast` callback with an `UINT` output target.
    pub fn as_uint(&self, v: &Value, resolved_str: Option<&str>) -> Result<u64, RuntimeFault> {
        match v {
            Value::Uint(n) => Ok(*n),
            Value::Float(f) => Ok(*f as i64 as u64),
            Value::Str(_) => Ok(crate::value::str_to_uint(resolved_str.unwrap_or(""))),
            Value::Custom(c) => {
                let descriptor = self
                    .get(c.type_id)
                    .ok_or_else(|| RuntimeFault::BadCodeblock("unregistered custom type".into()))?;
                let mut out = Value::Uint(0);
                descriptor.cast(Storage::Address(c.bits), Storage::StackSlot(&mut out))?;
                match out {
                    Value::Uint(n) => Ok(n),
                    other => self.as_uint(&other, resolved_str),
                }
            }
        }
    }

    pub fn as_float(&self, v: &Value, resolved_str: Option<&str>) -> Result<f64, RuntimeFault> {
        match v {
            Value::Uint(n) => Ok(*n as f64),
            Value::Float(f) => Ok(*f),
            Value::Str(_) => Ok(crate::value::str_to_float(resolved_str.unwrap_or(""))),
            Value::Custom(c) => {
                let descriptor = self
                    .get(c.type_id)
                    .ok_or_else(|| RuntimeFault::BadCodeblock("unregistered custom type".into()))?;
                let mut out = Value::Float(0.0);
                descriptor.cast(Storage::Address(c.bits), Storage::StackSlot(&mut out))?;
                match out {
                    Value::Float(f) => Ok(f),
                    other => self.as_float(&other, resolved_str),
                }
            }
        }
    }

    /// `perform_op` (spec section 4.2): the RHS type is used for binary ops
    /// (LHS for unary); if one side is an immediate and the other custom, the
    /// immediate passes through unmodified — callbacks must accept either.
    /// Numeric and string comparison shortcuts avoid dispatch for the common
    /// path entirely.
    pub fn perform_op(&self, op: Op, lhs: &Value, rhs: Option<&Value>) -> Result<Value, RuntimeFault> {
        if let Some((a, b)) = numeric_pair(lhs, rhs) {
            return Ok(numeric_shortcut(op, a, b));
        }

        let dispatch_on = rhs.unwrap_or(lhs);
        match dispatch_on {
            Value::Custom(c) => {
                let descriptor = self
                    .get(c.type_id)
                    .ok_or_else(|| RuntimeFault::BadCodeblock("unregistered custom type".into()))?;
                descriptor.perform_op(op, lhs, rhs)
            }
            _ => Err(RuntimeFault::TypeMismatch(format!(
                "unsupported operand type(s) for {op:?}"
            ))),
        }
    }
}

/// Numeric representation used by the comparison/arithmetic fast path.
#[derive(Clone, Copy)]
enum Num {
    Uint(u64),
    Float(f64),
}

fn numeric_pair(lhs: &Value, rhs: Option<&Value>) -> Option<(Num, Num)> {
    let a = as_num(lhs)?;
    let b = match rhs {
        Some(v) => as_num(v)?,
        None => a,
    };
    Some((a, b))
}

fn as_num(v: &Value) -> Option<Num> {
    match v {
        Value::Uint(n) => Some(Num::Uint(*n)),
        Value::Float(f) => Some(Num::Float(*f)),
        _ => None,
    }
}

fn numeric_shortcut(op: Op, a: Num, b: Num) -> Value {
    use Num::{Float, Uint};
    let both_uint = matches!((a, b), (Uint(_), Uint(_)));
    match op {
        Op::Add | Op::Sub | Op::Mul if both_uint => {
            let (Uint(x), Uint(y)) = (a, b) else { unreachable!() };
            Value::Uint(match op {
                Op::Add => x.wrapping_add(y),
                Op::Sub => x.wrapping_sub(y),
                Op::Mul => x.wrapping_mul(y),
                _ => unreachable!(),
            })
        }
        Op::Add | Op::Sub | Op::Mul => {
            let (x, y) = (to_f(a), to_f(b));
            Value::Float(match op {
                Op::Add => x + y,
                Op::Sub => x - y,
                Op::Mul => x * y,
                _ => unreachable!(),
            })
        }
        Op::Div => Value::Float(to_f(a) / to_f(b)),
        Op::Mod if both_uint => {
            let (Uint(x), Uint(y)) = (a, b) else { unreachable!() };
            Value::Uint(checked_rem_uint(x, y))
        }
        Op::Mod => Value::Float(to_f(a) % to_f(b)),
        Op::BitAnd | Op::BitOr | Op::Xor | Op::Shl | Op::Shr => {
            let (x, y) = (to_u(a), to_u(b));
            Value::Uint(match op {
                Op::BitAnd => x & y,
                Op::BitOr => x | y,
                Op::Xor => x ^ y,
                Op::Shl => x.wrapping_shl(y as u32 & 63),
                Op::Shr => x.wrapping_shr(y as u32 & 63),
                _ => unreachable!(),
            })
        }
        Op::Neg if matches!(a, Uint(_)) => {
            let Uint(x) = a else { unreachable!() };
            Value::Uint((x as i64).wrapping_neg() as u64)
        }
        Op::Neg => Value::Float(-to_f(a)),
        Op::OnesComplement => Value::Uint(!to_u(a)),
        Op::Not => Value::Uint(u64::from(to_f(a) == 0.0)),
        Op::NotFloat => Value::Float(f64::from(to_f(a) == 0.0)),
        Op::CmpEq => Value::Uint(u64::from(to_f(a) == to_f(b))),
        Op::CmpNe => Value::Uint(u64::from(to_f(a) != to_f(b))),
        Op::CmpLt => Value::Uint(u64::from(to_f(a) < to_f(b))),
        Op::CmpLe => Value::Uint(u64::from(to_f(a) <= to_f(b))),
        Op::CmpGr => Value::Uint(u64::from(to_f(a) > to_f(b))),
        Op::CmpGe => Value::Uint(u64::from(to_f(a) >= to_f(b))),
        Op::Concat | Op::ConcatSpace | Op::ConcatTab | Op::ConcatNewline => {
            unreachable!("concatenation is not a numeric operator")
        }
    }
}

fn to_f(n: Num) -> f64 {
    match n {
        Num::Uint(v) => v as f64,
        Num::Float(v) => v,
    }
}
fn to_u(n: Num) -> u64 {
    match n {
        Num::Uint(v) => v,
        Num::Float(v) => v as i64 as u64,
    }
}

/// Hard-coded string comparison shortcut (spec section 4.2): the common path
/// for `==`/`!=` between two already-resolved string slices never dispatches
/// through a callback.
#[must_use]
pub fn string_cmp_eq(a: &str, b: &str) -> bool {
    a == b
}

#[must_use]
pub fn custom_value_is_null(v: &CustomValue) -> bool {
    v.bits == 0
}

#[must_use]
pub fn string_value_is_null(v: &StringValue) -> bool {
    matches!(v, StringValue::Empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_add_stays_integer() {
        let result = perform_op_test(Op::Add, Value::Uint(3), Some(Value::Uint(4)));
        assert!(matches!(result, Value::Uint(7)));
    }

    #[test]
    fn mixed_int_float_promotes_to_float() {
        let result = perform_op_test(Op::Add, Value::Uint(3), Some(Value::Float(4.5)));
        match result {
            Value::Float(f) => assert!((f - 7.5).abs() < f64::EPSILON),
            other => panic!("expected float, got {other:?}"),
        }
    }

    fn perform_op_test(op: Op, lhs: Value, rhs: Option<Value>) -> Value {
        let registry = TypeRegistry::new();
        registry.perform_op(op, &lhs, rhs.as_ref()).expect("builtin op")
    }
}
