//! Abstract value domain: a symbolic interval lattice plus a byte-granular
//! memory formula.
//!
//! `Value` elements are either unreachable (`Bottom`), a single symbolic
//! expression, an interval with symbolic bounds (possibly open on one or
//! both sides), or top (`Open`). `join` widens interval bounds that
//! disagree at the right end into a right-open interval, which bounds the
//! chain height on monotonically increasing counters. Where precision is
//! lost the domain degrades to `Open` and emits a warning; degradation is
//! not an error.

use std::collections::BTreeMap;
use std::fmt;

use log::warn;

// ─── Symbolic expressions ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SymOp {
    Plus,
    Minus,
    Times,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl fmt::Display for SymOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SymOp::Plus => "+",
            SymOp::Minus => "-",
            SymOp::Times => "*",
            SymOp::Lt => "<",
            SymOp::Le => "<=",
            SymOp::Gt => ">",
            SymOp::Ge => ">=",
            SymOp::Eq => "=",
        };
        write!(f, "{}", s)
    }
}

/// A symbolic scalar: constant, function parameter, global at entry, a
/// dereference of an address value, or a binary expression over values.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Symbolic {
    Const(i64),
    Parameter(usize),
    Global(usize),
    Deref(Box<Value>),
    Op(SymOp, Box<Value>, Box<Value>),
}

impl fmt::Display for Symbolic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbolic::Const(c) => write!(f, "{}", c),
            Symbolic::Parameter(i) => write!(f, "p{}", i),
            Symbolic::Global(i) => write!(f, "g{}", i),
            Symbolic::Deref(v) => write!(f, "*{}", v),
            Symbolic::Op(op, a, b) => write!(f, "({}{}{})", a, op, b),
        }
    }
}

// ─── Values ──────────────────────────────────────────────────────────────────

/// Element of the abstract value lattice.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    /// Unreachable.
    Bottom,
    Symbolic(Symbolic),
    /// Closed interval with symbolic bounds.
    Interval(Symbolic, Symbolic),
    /// (−∞, bound].
    LeftOpen(Symbolic),
    /// [bound, +∞).
    RightOpen(Symbolic),
    /// No information.
    Open,
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bottom => write!(f, "bot"),
            Value::Symbolic(s) => write!(f, "{}", s),
            Value::Interval(a, b) => write!(f, "[{},{}]", a, b),
            Value::LeftOpen(b) => write!(f, "(-inf,{}]", b),
            Value::RightOpen(a) => write!(f, "[{},+inf)", a),
            Value::Open => write!(f, "top"),
        }
    }
}

impl Value {
    pub fn constant(c: i64) -> Value {
        Value::Symbolic(Symbolic::Const(c))
    }

    pub fn parameter(i: usize) -> Value {
        Value::Symbolic(Symbolic::Parameter(i))
    }

    pub fn global(i: usize) -> Value {
        Value::Symbolic(Symbolic::Global(i))
    }

    pub fn op(op: SymOp, a: Value, b: Value) -> Value {
        Value::Symbolic(Symbolic::Op(op, Box::new(a), Box::new(b))).simplify()
    }

    pub fn deref(addr: Value) -> Value {
        Value::Symbolic(Symbolic::Deref(Box::new(addr)))
    }

    fn as_const(&self) -> Option<i64> {
        match self {
            Value::Symbolic(Symbolic::Const(c)) => Some(*c),
            _ => None,
        }
    }

    /// `true` if the expression mentions a function parameter anywhere.
    pub fn contains_parameter(&self) -> bool {
        fn sym(s: &Symbolic) -> bool {
            match s {
                Symbolic::Parameter(_) => true,
                Symbolic::Const(_) | Symbolic::Global(_) => false,
                Symbolic::Deref(v) => v.contains_parameter(),
                Symbolic::Op(_, a, b) => a.contains_parameter() || b.contains_parameter(),
            }
        }
        match self {
            Value::Bottom | Value::Open => false,
            Value::Symbolic(s) => sym(s),
            Value::Interval(a, b) => sym(a) || sym(b),
            Value::LeftOpen(b) => sym(b),
            Value::RightOpen(a) => sym(a),
        }
    }

    // ─── Simplification ──────────────────────────────────────────────────

    /// Normalise symbolic expressions:
    /// `(a-x)+x = a`, `(a+c)+c' = a+(c+c')`, `a+0 = a`, constant folding,
    /// `(a<b)=0 ⇒ a>=b`.
    pub fn simplify(&self) -> Value {
        match self {
            Value::Symbolic(Symbolic::Op(op, a, b)) => {
                let a = a.simplify();
                let b = b.simplify();
                match (*op, a, b) {
                    // Constant folding.
                    (
                        op,
                        Value::Symbolic(Symbolic::Const(x)),
                        Value::Symbolic(Symbolic::Const(y)),
                    ) => Value::constant(match op {
                        SymOp::Plus => x.wrapping_add(y),
                        SymOp::Minus => x.wrapping_sub(y),
                        SymOp::Times => x.wrapping_mul(y),
                        SymOp::Lt => i64::from(x < y),
                        SymOp::Le => i64::from(x <= y),
                        SymOp::Gt => i64::from(x > y),
                        SymOp::Ge => i64::from(x >= y),
                        SymOp::Eq => i64::from(x == y),
                    }),
                    // a + 0 = a, a - 0 = a.
                    (SymOp::Plus | SymOp::Minus, a, Value::Symbolic(Symbolic::Const(0))) => a,
                    // 0 + a = a.
                    (SymOp::Plus, Value::Symbolic(Symbolic::Const(0)), b) => b,
                    // (a - x) + x = a.
                    (
                        SymOp::Plus,
                        Value::Symbolic(Symbolic::Op(SymOp::Minus, inner_a, inner_x)),
                        b,
                    ) if *inner_x == b => *inner_a,
                    // (a + c) + c' = a + (c + c').
                    (
                        SymOp::Plus,
                        Value::Symbolic(Symbolic::Op(SymOp::Plus, inner_a, inner_c)),
                        Value::Symbolic(Symbolic::Const(y)),
                    ) if inner_c.as_const().is_some() => {
                        let x = inner_c.as_const().unwrap_or(0);
                        Value::op(SymOp::Plus, *inner_a, Value::constant(x.wrapping_add(y)))
                    }
                    // (a < b) = 0  ⇒  a >= b, and its dual.
                    (
                        SymOp::Eq,
                        Value::Symbolic(Symbolic::Op(SymOp::Lt, inner_a, inner_b)),
                        Value::Symbolic(Symbolic::Const(0)),
                    ) => Value::Symbolic(Symbolic::Op(SymOp::Ge, inner_a, inner_b)),
                    (
                        SymOp::Eq,
                        Value::Symbolic(Symbolic::Op(SymOp::Ge, inner_a, inner_b)),
                        Value::Symbolic(Symbolic::Const(0)),
                    ) => Value::Symbolic(Symbolic::Op(SymOp::Lt, inner_a, inner_b)),
                    (op, a, b) => Value::Symbolic(Symbolic::Op(op, Box::new(a), Box::new(b))),
                }
            }
            Value::Symbolic(Symbolic::Deref(v)) => {
                Value::Symbolic(Symbolic::Deref(Box::new(v.simplify())))
            }
            Value::Interval(a, b) if a == b => Value::Symbolic(a.clone()),
            other => other.clone(),
        }
    }

    // ─── Lattice operations ──────────────────────────────────────────────

    /// Least upper bound with right-end widening.
    pub fn join(&self, other: &Value) -> Value {
        use Value::*;
        let a = self.simplify();
        let b = other.simplify();
        if a == b {
            return a;
        }
        match (&a, &b) {
            (Bottom, v) | (v, Bottom) => v.clone(),
            (Open, _) | (_, Open) => Open,
            (Symbolic(x), Symbolic(y)) => match (x, y) {
                (self::Symbolic::Const(cx), self::Symbolic::Const(cy)) => {
                    Interval(
                        self::Symbolic::Const(*cx.min(cy)),
                        self::Symbolic::Const(*cx.max(cy)),
                    )
                }
                _ => {
                    warn!("value join degrades to top: {} ⊔ {}", a, b);
                    Open
                }
            },
            (Symbolic(x), Interval(lo, hi)) | (Interval(lo, hi), Symbolic(x)) => {
                Value::Interval(lo.clone(), hi.clone()).join_interval(x)
            }
            (Interval(alo, ahi), Interval(blo, bhi)) => {
                let lo = lower_bound(alo, blo);
                match lo {
                    Some(lo) => {
                        if ahi == bhi {
                            Interval(lo, ahi.clone())
                        } else {
                            // Right ends disagree: widen.
                            RightOpen(lo)
                        }
                    }
                    None => {
                        warn!("value join degrades to top: {} ⊔ {}", a, b);
                        Open
                    }
                }
            }
            (RightOpen(x), RightOpen(y)) => match lower_bound(x, y) {
                Some(lo) => RightOpen(lo),
                None => Open,
            },
            (RightOpen(x), Symbolic(y)) | (Symbolic(y), RightOpen(x)) => {
                match lower_bound(x, y) {
                    Some(lo) => RightOpen(lo),
                    None => Open,
                }
            }
            (RightOpen(x), Interval(lo, _)) | (Interval(lo, _), RightOpen(x)) => {
                match lower_bound(x, lo) {
                    Some(l) => RightOpen(l),
                    None => Open,
                }
            }
            (LeftOpen(x), LeftOpen(y)) => match upper_bound(x, y) {
                Some(hi) => LeftOpen(hi),
                None => Open,
            },
            (LeftOpen(x), Symbolic(y)) | (Symbolic(y), LeftOpen(x)) => {
                match upper_bound(x, y) {
                    Some(hi) => LeftOpen(hi),
                    None => Open,
                }
            }
            (LeftOpen(x), Interval(_, hi)) | (Interval(_, hi), LeftOpen(x)) => {
                match upper_bound(x, hi) {
                    Some(h) => LeftOpen(h),
                    None => Open,
                }
            }
            _ => {
                warn!("value join degrades to top: {} ⊔ {}", a, b);
                Open
            }
        }
    }

    fn join_interval(&self, x: &Symbolic) -> Value {
        // self is Interval(lo, hi); join with the singleton x.
        if let Value::Interval(lo, hi) = self {
            if let (Symbolic::Const(l), Symbolic::Const(h), Symbolic::Const(c)) = (lo, hi, x) {
                if c < l {
                    return Value::Interval(x.clone(), hi.clone());
                }
                if c > h {
                    // The right end moves: widen.
                    return Value::RightOpen(lo.clone());
                }
                return self.clone();
            }
            if x == lo || x == hi {
                return self.clone();
            }
        }
        warn!("value join degrades to top: {} ⊔ {}", self, x);
        Value::Open
    }

    /// Greatest lower bound. Returns `Bottom` on provably disjoint constant
    /// ranges; where precision is impossible, prefers the side that carries
    /// a parameter.
    pub fn meet(&self, other: &Value) -> Value {
        use Value::*;
        let a = self.simplify();
        let b = other.simplify();
        if a == b {
            return a;
        }
        match (&a, &b) {
            (Bottom, _) | (_, Bottom) => Bottom,
            (Open, v) | (v, Open) => v.clone(),
            (Symbolic(self::Symbolic::Const(x)), Symbolic(self::Symbolic::Const(y))) => {
                if x == y {
                    a.clone()
                } else {
                    Bottom
                }
            }
            (Symbolic(self::Symbolic::Const(c)), Interval(lo, hi))
            | (Interval(lo, hi), Symbolic(self::Symbolic::Const(c))) => {
                match (lo, hi) {
                    (self::Symbolic::Const(l), self::Symbolic::Const(h)) => {
                        if l <= c && c <= h {
                            Value::constant(*c)
                        } else {
                            Bottom
                        }
                    }
                    _ => Value::constant(*c),
                }
            }
            (Interval(alo, ahi), Interval(blo, bhi)) => {
                if let (
                    self::Symbolic::Const(al),
                    self::Symbolic::Const(ah),
                    self::Symbolic::Const(bl),
                    self::Symbolic::Const(bh),
                ) = (alo, ahi, blo, bhi)
                {
                    let lo = al.max(bl);
                    let hi = ah.min(bh);
                    if lo > hi {
                        return Bottom;
                    }
                    return Interval(self::Symbolic::Const(*lo), self::Symbolic::Const(*hi));
                }
                prefer_parameter(&a, &b)
            }
            _ => prefer_parameter(&a, &b),
        }
    }

    /// `self ⊒ other`: every concretisation of `other` is admitted by
    /// `self`. Conservative: `false` when unknown.
    pub fn subsumes(&self, other: &Value) -> bool {
        use Value::*;
        let a = self.simplify();
        let b = other.simplify();
        if a == b {
            return true;
        }
        match (&a, &b) {
            (Open, _) => true,
            (_, Bottom) => true,
            (Interval(lo, hi), Symbolic(self::Symbolic::Const(c))) => {
                matches!((lo, hi), (self::Symbolic::Const(l), self::Symbolic::Const(h)) if l <= c && c <= h)
            }
            (Interval(alo, ahi), Interval(blo, bhi)) => {
                matches!(
                    (alo, ahi, blo, bhi),
                    (
                        self::Symbolic::Const(al),
                        self::Symbolic::Const(ah),
                        self::Symbolic::Const(bl),
                        self::Symbolic::Const(bh),
                    ) if al <= bl && bh <= ah
                )
            }
            (RightOpen(a0), Symbolic(self::Symbolic::Const(c))) => {
                matches!(a0, self::Symbolic::Const(l) if l <= c)
            }
            (RightOpen(a0), Interval(blo, _)) | (RightOpen(a0), RightOpen(blo)) => {
                matches!((a0, blo), (self::Symbolic::Const(l), self::Symbolic::Const(bl)) if l <= bl)
            }
            (LeftOpen(a0), Symbolic(self::Symbolic::Const(c))) => {
                matches!(a0, self::Symbolic::Const(h) if c <= h)
            }
            (LeftOpen(a0), Interval(_, bhi)) | (LeftOpen(a0), LeftOpen(bhi)) => {
                matches!((a0, bhi), (self::Symbolic::Const(h), self::Symbolic::Const(bh)) if bh <= h)
            }
            _ => false,
        }
    }

    /// Add a constant byte offset to the value (address arithmetic).
    pub fn add_offset(&self, offset: i64) -> Value {
        if offset == 0 {
            return self.clone();
        }
        match self {
            Value::Bottom => Value::Bottom,
            Value::Open => Value::Open,
            Value::Symbolic(s) => {
                Value::op(SymOp::Plus, Value::Symbolic(s.clone()), Value::constant(offset))
            }
            Value::Interval(lo, hi) => {
                let lo = Value::op(
                    SymOp::Plus,
                    Value::Symbolic(lo.clone()),
                    Value::constant(offset),
                );
                let hi = Value::op(
                    SymOp::Plus,
                    Value::Symbolic(hi.clone()),
                    Value::constant(offset),
                );
                match (lo, hi) {
                    (Value::Symbolic(l), Value::Symbolic(h)) => Value::Interval(l, h),
                    _ => Value::Open,
                }
            }
            Value::LeftOpen(b) => {
                match Value::op(SymOp::Plus, Value::Symbolic(b.clone()), Value::constant(offset)) {
                    Value::Symbolic(s) => Value::LeftOpen(s),
                    _ => Value::Open,
                }
            }
            Value::RightOpen(a) => {
                match Value::op(SymOp::Plus, Value::Symbolic(a.clone()), Value::constant(offset)) {
                    Value::Symbolic(s) => Value::RightOpen(s),
                    _ => Value::Open,
                }
            }
        }
    }

    /// Substitute `Parameter i` / `Global i` leaves with the caller's
    /// values: the `adapt` operation used when a callee summary is applied
    /// at a call site.
    pub fn adapt(&self, params: &[Value], globals: &[Value]) -> Value {
        fn adapt_sym(s: &Symbolic, params: &[Value], globals: &[Value]) -> Value {
            match s {
                Symbolic::Const(c) => Value::constant(*c),
                Symbolic::Parameter(i) => params.get(*i).cloned().unwrap_or(Value::Open),
                Symbolic::Global(i) => globals.get(*i).cloned().unwrap_or(Value::Open),
                Symbolic::Deref(v) => Value::deref(v.adapt(params, globals)),
                Symbolic::Op(op, a, b) => {
                    Value::op(*op, a.adapt(params, globals), b.adapt(params, globals))
                }
            }
        }
        fn adapt_bound(s: &Symbolic, params: &[Value], globals: &[Value]) -> Option<Symbolic> {
            match adapt_sym(s, params, globals) {
                Value::Symbolic(s) => Some(s),
                _ => None,
            }
        }
        match self {
            Value::Bottom => Value::Bottom,
            Value::Open => Value::Open,
            Value::Symbolic(s) => adapt_sym(s, params, globals).simplify(),
            Value::Interval(lo, hi) => {
                match (
                    adapt_bound(lo, params, globals),
                    adapt_bound(hi, params, globals),
                ) {
                    (Some(l), Some(h)) => Value::Interval(l, h).simplify(),
                    _ => Value::Open,
                }
            }
            Value::LeftOpen(b) => match adapt_bound(b, params, globals) {
                Some(s) => Value::LeftOpen(s),
                None => Value::Open,
            },
            Value::RightOpen(a) => match adapt_bound(a, params, globals) {
                Some(s) => Value::RightOpen(s),
                None => Value::Open,
            },
        }
    }

    /// Definitely zero?
    pub fn is_zero(&self) -> bool {
        self.simplify().as_const() == Some(0)
    }

    /// Definitely non-zero?
    pub fn is_not_zero(&self) -> bool {
        match self.simplify() {
            Value::Symbolic(Symbolic::Const(c)) => c != 0,
            Value::Interval(Symbolic::Const(l), Symbolic::Const(h)) => l > 0 || h < 0,
            Value::RightOpen(Symbolic::Const(l)) => l > 0,
            Value::LeftOpen(Symbolic::Const(h)) => h < 0,
            _ => false,
        }
    }
}

/// Smaller of two symbolic lower bounds, when comparable.
fn lower_bound(a: &Symbolic, b: &Symbolic) -> Option<Symbolic> {
    if a == b {
        return Some(a.clone());
    }
    match (a, b) {
        (Symbolic::Const(x), Symbolic::Const(y)) => Some(Symbolic::Const(*x.min(y))),
        _ => None,
    }
}

/// Larger of two symbolic upper bounds, when comparable.
fn upper_bound(a: &Symbolic, b: &Symbolic) -> Option<Symbolic> {
    if a == b {
        return Some(a.clone());
    }
    match (a, b) {
        (Symbolic::Const(x), Symbolic::Const(y)) => Some(Symbolic::Const(*x.max(y))),
        _ => None,
    }
}

/// Meet fallback when no precise result exists: keep the operand carrying a
/// parameter, which stays meaningful across summary adaptation.
fn prefer_parameter(a: &Value, b: &Value) -> Value {
    if a.contains_parameter() {
        a.clone()
    } else if b.contains_parameter() {
        b.clone()
    } else {
        a.clone()
    }
}

/// May the byte ranges `[a, a+4)` and `[b, b+4)` overlap? `false` only when
/// both addresses are constants at least a word apart; everything else is
/// conservatively overlapping.
pub fn may_overlap(a: &Value, b: &Value) -> bool {
    let a = a.simplify();
    let b = b.simplify();
    if a == b {
        return true;
    }
    match (a.as_const(), b.as_const()) {
        (Some(x), Some(y)) => (x - y).abs() < 4,
        _ => true,
    }
}

// ─── Memory formula ──────────────────────────────────────────────────────────

/// One byte of an abstract value: the value and which of its four bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteInValue {
    pub value: Value,
    pub byte: u8,
}

/// Contents of a memory cell: a known byte, or nothing known.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AbstractByte {
    Byte(ByteInValue),
    Top,
}

/// Separation-style points-to formula at byte granularity. Keys are the
/// bytes of the *address* value, entries the bytes of the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryFormula {
    pub points_to: BTreeMap<ByteInValue, AbstractByte>,
}

impl MemoryFormula {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a 32-bit store: four consecutive points-to entries, one per
    /// byte of the stored value.
    pub fn store(&mut self, addr: &Value, value: &Value) {
        for byte in 0..4u8 {
            self.points_to.insert(
                ByteInValue {
                    value: addr.clone(),
                    byte,
                },
                AbstractByte::Byte(ByteInValue {
                    value: value.clone(),
                    byte,
                }),
            );
        }
    }

    /// Read a 32-bit load: all four byte entries at the address must agree
    /// on the source value (with matching byte indices), else `Open`.
    pub fn load(&self, addr: &Value) -> Value {
        let mut source: Option<Value> = None;
        for byte in 0..4u8 {
            let key = ByteInValue {
                value: addr.clone(),
                byte,
            };
            match self.points_to.get(&key) {
                Some(AbstractByte::Byte(b)) if b.byte == byte => match &source {
                    None => source = Some(b.value.clone()),
                    Some(v) if *v == b.value => {}
                    Some(_) => {
                        warn!("memory load at {} reads mixed sources", addr);
                        return Value::Open;
                    }
                },
                _ => return Value::Open,
            }
        }
        source.unwrap_or(Value::Open)
    }

    /// Join two formulas: union of assertions, conflicting entries fall to
    /// `Top`.
    pub fn join(&self, other: &MemoryFormula) -> MemoryFormula {
        let mut points_to = self.points_to.clone();
        for (key, byte) in &other.points_to {
            match points_to.get(key) {
                None => {
                    points_to.insert(key.clone(), byte.clone());
                }
                Some(existing) if existing == byte => {}
                Some(_) => {
                    points_to.insert(key.clone(), AbstractByte::Top);
                }
            }
        }
        MemoryFormula { points_to }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn c(v: i64) -> Value {
        Value::constant(v)
    }

    #[test]
    fn simplify_add_zero() {
        let v = Value::op(SymOp::Plus, Value::parameter(0), c(0));
        assert_eq!(v, Value::parameter(0));
    }

    #[test]
    fn simplify_sub_then_add_cancels() {
        // (p0 - 4) + 4 = p0
        let minus = Value::op(SymOp::Minus, Value::parameter(0), c(4));
        let v = Value::op(SymOp::Plus, minus, c(4));
        assert_eq!(v, Value::parameter(0));
    }

    #[test]
    fn simplify_reassociates_constant_sums() {
        // (p0 + 4) + 8 = p0 + 12
        let inner = Value::op(SymOp::Plus, Value::parameter(0), c(4));
        let v = Value::op(SymOp::Plus, inner, c(8));
        assert_eq!(v, Value::op(SymOp::Plus, Value::parameter(0), c(12)));
    }

    #[test]
    fn simplify_negated_comparison() {
        // (p0 < p1) = 0  becomes  p0 >= p1
        let lt = Value::op(SymOp::Lt, Value::parameter(0), Value::parameter(1));
        let v = Value::op(SymOp::Eq, lt, c(0));
        assert_eq!(
            v,
            Value::Symbolic(Symbolic::Op(
                SymOp::Ge,
                Box::new(Value::parameter(0)),
                Box::new(Value::parameter(1)),
            ))
        );
    }

    #[test]
    fn constant_folding() {
        assert_eq!(Value::op(SymOp::Plus, c(2), c(3)), c(5));
        assert_eq!(Value::op(SymOp::Lt, c(2), c(3)), c(1));
        assert_eq!(Value::op(SymOp::Eq, c(2), c(3)), c(0));
    }

    #[test]
    fn join_of_constants_is_interval() {
        assert_eq!(
            c(1).join(&c(5)),
            Value::Interval(Symbolic::Const(1), Symbolic::Const(5))
        );
        assert_eq!(c(3).join(&c(3)), c(3));
    }

    #[test]
    fn join_widens_moving_right_end() {
        let i1 = Value::Interval(Symbolic::Const(0), Symbolic::Const(1));
        let i2 = Value::Interval(Symbolic::Const(0), Symbolic::Const(2));
        assert_eq!(i1.join(&i2), Value::RightOpen(Symbolic::Const(0)));
        // A counter that keeps growing stays at the widened element.
        let widened = Value::RightOpen(Symbolic::Const(0));
        assert_eq!(widened.join(&c(100)), widened);
    }

    #[test]
    fn join_laws() {
        let samples = [
            Value::Bottom,
            c(0),
            c(7),
            Value::parameter(1),
            Value::Interval(Symbolic::Const(0), Symbolic::Const(4)),
            Value::RightOpen(Symbolic::Const(2)),
            Value::Open,
        ];
        for a in &samples {
            // Idempotent.
            assert_eq!(a.join(a), a.simplify());
            for b in &samples {
                // Commutative.
                assert_eq!(a.join(b), b.join(a));
                // Join subsumes both operands when comparable.
                let j = a.join(b);
                assert!(j.subsumes(a) || !matches!(a, Value::Symbolic(Symbolic::Const(_))));
            }
        }
    }

    #[test]
    fn meet_of_disjoint_constants_is_bottom() {
        assert_eq!(c(1).meet(&c(2)), Value::Bottom);
        let i1 = Value::Interval(Symbolic::Const(0), Symbolic::Const(3));
        let i2 = Value::Interval(Symbolic::Const(10), Symbolic::Const(12));
        assert_eq!(i1.meet(&i2), Value::Bottom);
    }

    #[test]
    fn meet_prefers_parameter_on_imprecision() {
        let p = Value::RightOpen(Symbolic::Parameter(0));
        let other = Value::RightOpen(Symbolic::Global(0));
        assert_eq!(p.meet(&other), p);
        assert_eq!(other.meet(&p), p);
    }

    #[test]
    fn subsumes_is_reflexive_and_ordered() {
        let i = Value::Interval(Symbolic::Const(0), Symbolic::Const(10));
        assert!(i.subsumes(&i));
        assert!(i.subsumes(&c(5)));
        assert!(!i.subsumes(&c(11)));
        assert!(Value::Open.subsumes(&i));
        assert!(i.subsumes(&Value::Bottom));
        assert!(Value::RightOpen(Symbolic::Const(0)).subsumes(&c(3)));
    }

    #[test]
    fn add_offset_folds_into_existing_sum() {
        let addr = Value::op(SymOp::Plus, Value::parameter(0), c(4));
        assert_eq!(
            addr.add_offset(4),
            Value::op(SymOp::Plus, Value::parameter(0), c(8))
        );
        assert_eq!(c(8).add_offset(-8), c(0));
        assert_eq!(Value::parameter(2).add_offset(0), Value::parameter(2));
    }

    #[test]
    fn adapt_substitutes_parameters_and_globals() {
        let v = Value::op(SymOp::Plus, Value::parameter(0), Value::global(1));
        let adapted = v.adapt(&[c(10)], &[c(0), c(32)]);
        assert_eq!(adapted, c(42));
        // Missing substitutions degrade to top.
        assert_eq!(Value::parameter(3).adapt(&[], &[]), Value::Open);
    }

    #[test]
    fn zero_predicates() {
        assert!(c(0).is_zero());
        assert!(!c(0).is_not_zero());
        assert!(c(4).is_not_zero());
        assert!(Value::Interval(Symbolic::Const(1), Symbolic::Const(9)).is_not_zero());
        assert!(!Value::Interval(Symbolic::Const(-1), Symbolic::Const(1)).is_not_zero());
        assert!(!Value::parameter(0).is_zero());
    }

    #[test]
    fn may_overlap_separates_distant_constants() {
        assert!(!may_overlap(&c(0), &c(8)));
        assert!(may_overlap(&c(0), &c(2)));
        assert!(may_overlap(&c(0), &Value::parameter(0)));
        assert!(may_overlap(&Value::parameter(0), &Value::parameter(0)));
    }

    #[test]
    fn memory_store_then_load_roundtrips() {
        let mut mem = MemoryFormula::new();
        mem.store(&Value::parameter(0), &c(99));
        assert_eq!(mem.load(&Value::parameter(0)), c(99));
        assert_eq!(mem.load(&Value::parameter(1)), Value::Open);
    }

    #[test]
    fn memory_join_keeps_agreement_and_tops_conflicts() {
        let mut m1 = MemoryFormula::new();
        m1.store(&Value::parameter(0), &c(1));
        m1.store(&Value::parameter(1), &c(7));
        let mut m2 = MemoryFormula::new();
        m2.store(&Value::parameter(0), &c(2));
        m2.store(&Value::parameter(1), &c(7));
        let joined = m1.join(&m2);
        // Agreeing entry survives; conflicting entry is top.
        assert_eq!(joined.load(&Value::parameter(1)), c(7));
        assert_eq!(joined.load(&Value::parameter(0)), Value::Open);
    }

    #[test]
    fn memory_join_laws() {
        let mut m1 = MemoryFormula::new();
        m1.store(&Value::parameter(0), &c(1));
        let mut m2 = MemoryFormula::new();
        m2.store(&Value::parameter(1), &c(2));
        assert_eq!(m1.join(&m2), m2.join(&m1));
        assert_eq!(m1.join(&m1), m1);
        let m3 = MemoryFormula::new();
        assert_eq!(m1.join(&m3), m1);
        // Associative.
        assert_eq!(m1.join(&m2).join(&m3), m1.join(&m2.join(&m3)));
    }
}
