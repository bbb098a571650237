//! Mini-language for selecting nodes with appropriate resources (memory,
//! cores etc.). Expressions travel inside kernel headers and are evaluated
//! by the routing layer against the candidate node's resource context.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::kernel_buffer::KernelBuffer;

/// A dynamically typed value: boolean or unsigned. Narrower unsigned wire
/// forms are accepted on read and widen to 64 bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Boolean(bool),
    Unsigned(u64),
}

const TYPE_BOOLEAN: u8 = 0;
const TYPE_U8: u8 = 1;
const TYPE_U16: u8 = 2;
const TYPE_U32: u8 = 3;
const TYPE_U64: u8 = 4;

impl Value {
    pub fn as_bool(self) -> bool {
        match self {
            Value::Boolean(b) => b,
            Value::Unsigned(u) => u != 0,
        }
    }

    pub fn as_u64(self) -> u64 {
        match self {
            Value::Boolean(b) => b as u64,
            Value::Unsigned(u) => u,
        }
    }

    pub fn write(&self, out: &mut KernelBuffer) {
        match self {
            Value::Boolean(b) => {
                out.write_u8(TYPE_BOOLEAN);
                out.write_bool(*b);
            }
            Value::Unsigned(u) => {
                out.write_u8(TYPE_U64);
                out.write_u64(*u);
            }
        }
    }

    pub fn read(input: &mut KernelBuffer) -> Result<Value> {
        match input.read_u8()? {
            TYPE_BOOLEAN => Ok(Value::Boolean(input.read_bool()?)),
            TYPE_U8 => Ok(Value::Unsigned(input.read_u8()? as u64)),
            TYPE_U16 => Ok(Value::Unsigned(input.read_u16()? as u64)),
            TYPE_U32 => Ok(Value::Unsigned(input.read_u32()? as u64)),
            TYPE_U64 => Ok(Value::Unsigned(input.read_u64()?)),
            t => Err(Error::protocol(format!("bad value type {}", t))),
        }
    }
}

/// A named resource. The well-known symbols are published by every daemon;
/// applications may define further ones.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Symbol(pub u32);

pub const TOTAL_THREADS: Symbol = Symbol(0);
pub const TOTAL_MEMORY: Symbol = Symbol(1);

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TOTAL_THREADS => f.write_str("total-threads"),
            TOTAL_MEMORY => f.write_str("total-memory"),
            Symbol(n) => write!(f, "symbol-{}", n),
        }
    }
}

/// Where symbols get their values during evaluation.
pub trait ResourceContext {
    fn get(&self, symbol: Symbol) -> Value;
}

/// The daemon's resource table. Unknown symbols evaluate to zero.
#[derive(Default)]
pub struct ResourceMap {
    values: HashMap<Symbol, Value>,
}

impl ResourceMap {
    pub fn new() -> ResourceMap {
        ResourceMap::default()
    }

    /// A map pre-populated with this machine's well-known resources.
    pub fn for_this_node() -> ResourceMap {
        let mut map = ResourceMap::new();
        let threads = std::thread::available_parallelism()
            .map(|n| n.get() as u64)
            .unwrap_or(1);
        map.set(TOTAL_THREADS, Value::Unsigned(threads));
        map
    }

    pub fn set(&mut self, symbol: Symbol, value: Value) {
        self.values.insert(symbol, value);
    }
}

impl ResourceContext for ResourceMap {
    fn get(&self, symbol: Symbol) -> Value {
        self.values
            .get(&symbol)
            .copied()
            .unwrap_or(Value::Unsigned(0))
    }
}

const EXPR_SYMBOL: u8 = 0;
const EXPR_CONSTANT: u8 = 1;
const EXPR_NOT: u8 = 2;
const EXPR_AND: u8 = 3;
const EXPR_OR: u8 = 4;
const EXPR_XOR: u8 = 5;
const EXPR_LESS_THAN: u8 = 6;
const EXPR_LESS_OR_EQUAL: u8 = 7;
const EXPR_EQUAL: u8 = 8;
const EXPR_GREATER_THAN: u8 = 9;
const EXPR_GREATER_OR_EQUAL: u8 = 10;

const MAX_DEPTH: u32 = 64;

/// A resource filter: boolean combinators over comparisons of symbols and
/// constants. Serialized pre-order with one op byte per node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Symbol(Symbol),
    Constant(Value),
    Not(Box<Expression>),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Xor(Box<Expression>, Box<Expression>),
    LessThan(Box<Expression>, Box<Expression>),
    LessOrEqual(Box<Expression>, Box<Expression>),
    Equal(Box<Expression>, Box<Expression>),
    GreaterThan(Box<Expression>, Box<Expression>),
    GreaterOrEqual(Box<Expression>, Box<Expression>),
}

impl Expression {
    pub fn evaluate(&self, ctx: &dyn ResourceContext) -> Value {
        use Expression::*;
        match self {
            Symbol(s) => ctx.get(*s),
            Constant(v) => *v,
            Not(a) => Value::Boolean(!a.evaluate(ctx).as_bool()),
            And(a, b) => Value::Boolean(a.evaluate(ctx).as_bool() && b.evaluate(ctx).as_bool()),
            Or(a, b) => Value::Boolean(a.evaluate(ctx).as_bool() || b.evaluate(ctx).as_bool()),
            Xor(a, b) => Value::Boolean(a.evaluate(ctx).as_bool() ^ b.evaluate(ctx).as_bool()),
            LessThan(a, b) => Value::Boolean(a.evaluate(ctx).as_u64() < b.evaluate(ctx).as_u64()),
            LessOrEqual(a, b) => {
                Value::Boolean(a.evaluate(ctx).as_u64() <= b.evaluate(ctx).as_u64())
            }
            Equal(a, b) => Value::Boolean(a.evaluate(ctx).as_u64() == b.evaluate(ctx).as_u64()),
            GreaterThan(a, b) => {
                Value::Boolean(a.evaluate(ctx).as_u64() > b.evaluate(ctx).as_u64())
            }
            GreaterOrEqual(a, b) => {
                Value::Boolean(a.evaluate(ctx).as_u64() >= b.evaluate(ctx).as_u64())
            }
        }
    }

    pub fn write(&self, out: &mut KernelBuffer) {
        use Expression::*;
        match self {
            Symbol(s) => {
                out.write_u8(EXPR_SYMBOL);
                out.write_u32(s.0);
            }
            Constant(v) => {
                out.write_u8(EXPR_CONSTANT);
                v.write(out);
            }
            Not(a) => {
                out.write_u8(EXPR_NOT);
                a.write(out);
            }
            And(a, b) => Self::write_binary(out, EXPR_AND, a, b),
            Or(a, b) => Self::write_binary(out, EXPR_OR, a, b),
            Xor(a, b) => Self::write_binary(out, EXPR_XOR, a, b),
            LessThan(a, b) => Self::write_binary(out, EXPR_LESS_THAN, a, b),
            LessOrEqual(a, b) => Self::write_binary(out, EXPR_LESS_OR_EQUAL, a, b),
            Equal(a, b) => Self::write_binary(out, EXPR_EQUAL, a, b),
            GreaterThan(a, b) => Self::write_binary(out, EXPR_GREATER_THAN, a, b),
            GreaterOrEqual(a, b) => Self::write_binary(out, EXPR_GREATER_OR_EQUAL, a, b),
        }
    }

    fn write_binary(out: &mut KernelBuffer, op: u8, a: &Expression, b: &Expression) {
        out.write_u8(op);
        a.write(out);
        b.write(out);
    }

    pub fn read(input: &mut KernelBuffer) -> Result<Expression> {
        Self::read_at_depth(input, 0)
    }

    fn read_at_depth(input: &mut KernelBuffer, depth: u32) -> Result<Expression> {
        use Expression::*;
        if depth > MAX_DEPTH {
            return Err(Error::protocol("resource expression is too deep"));
        }
        let op = input.read_u8()?;
        let mut binary = |input: &mut KernelBuffer| -> Result<(Box<Expression>, Box<Expression>)> {
            let a = Self::read_at_depth(input, depth + 1)?;
            let b = Self::read_at_depth(input, depth + 1)?;
            Ok((Box::new(a), Box::new(b)))
        };
        match op {
            EXPR_SYMBOL => Ok(Symbol(self::Symbol(input.read_u32()?))),
            EXPR_CONSTANT => Ok(Constant(Value::read(input)?)),
            EXPR_NOT => Ok(Not(Box::new(Self::read_at_depth(input, depth + 1)?))),
            EXPR_AND => binary(input).map(|(a, b)| And(a, b)),
            EXPR_OR => binary(input).map(|(a, b)| Or(a, b)),
            EXPR_XOR => binary(input).map(|(a, b)| Xor(a, b)),
            EXPR_LESS_THAN => binary(input).map(|(a, b)| LessThan(a, b)),
            EXPR_LESS_OR_EQUAL => binary(input).map(|(a, b)| LessOrEqual(a, b)),
            EXPR_EQUAL => binary(input).map(|(a, b)| Equal(a, b)),
            EXPR_GREATER_THAN => binary(input).map(|(a, b)| GreaterThan(a, b)),
            EXPR_GREATER_OR_EQUAL => binary(input).map(|(a, b)| GreaterOrEqual(a, b)),
            t => Err(Error::protocol(format!("bad expression op {}", t))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ResourceMap {
        let mut ctx = ResourceMap::new();
        ctx.set(TOTAL_THREADS, Value::Unsigned(8));
        ctx.set(TOTAL_MEMORY, Value::Unsigned(1 << 30));
        ctx
    }

    #[test]
    fn comparisons() {
        let ctx = context();
        let e = Expression::GreaterOrEqual(
            Box::new(Expression::Symbol(TOTAL_THREADS)),
            Box::new(Expression::Constant(Value::Unsigned(4))),
        );
        assert!(e.evaluate(&ctx).as_bool());
        let e = Expression::LessThan(
            Box::new(Expression::Symbol(TOTAL_MEMORY)),
            Box::new(Expression::Constant(Value::Unsigned(1024))),
        );
        assert!(!e.evaluate(&ctx).as_bool());
    }

    #[test]
    fn combinators() {
        let ctx = context();
        let threads_ok = Expression::GreaterThan(
            Box::new(Expression::Symbol(TOTAL_THREADS)),
            Box::new(Expression::Constant(Value::Unsigned(1))),
        );
        let memory_ok = Expression::Equal(
            Box::new(Expression::Symbol(TOTAL_MEMORY)),
            Box::new(Expression::Constant(Value::Unsigned(1 << 30))),
        );
        let both = Expression::And(Box::new(threads_ok.clone()), Box::new(memory_ok));
        assert!(both.evaluate(&ctx).as_bool());
        let neither = Expression::Not(Box::new(threads_ok));
        assert!(!neither.evaluate(&ctx).as_bool());
    }

    #[test]
    fn unknown_symbols_are_zero() {
        let ctx = ResourceMap::new();
        let e = Expression::Symbol(Symbol(999));
        assert_eq!(e.evaluate(&ctx).as_u64(), 0);
    }

    #[test]
    fn serialization_round_trip() {
        let e = Expression::Or(
            Box::new(Expression::Not(Box::new(Expression::Symbol(TOTAL_THREADS)))),
            Box::new(Expression::LessOrEqual(
                Box::new(Expression::Constant(Value::Unsigned(2))),
                Box::new(Expression::Symbol(TOTAL_MEMORY)),
            )),
        );
        let mut buf = KernelBuffer::new();
        e.write(&mut buf);
        buf.flip();
        let d = Expression::read(&mut buf).unwrap();
        assert_eq!(e, d);
        assert_eq!(buf.position(), buf.limit());
    }

    #[test]
    fn bad_opcode_is_a_protocol_error() {
        let mut buf = KernelBuffer::new();
        buf.write_u8(200);
        buf.flip();
        assert!(Expression::read(&mut buf).is_err());
    }
}
