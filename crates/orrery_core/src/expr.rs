use crate::logic::Logical;
use crate::registry::{AuxBody, AuxId, Registry, SlotId};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Log,
    Exp,
    Sqrt,
    Abs,
    Sign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Atan2,
    Max,
    Min,
    Rand,
    Gauss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TernaryOp {
    /// `mod(x, lo, hi)` wraps x into the interval [lo, hi).
    Mod,
    /// `step(x, t0, y)` is y once x has reached t0, zero before.
    Step,
}

/// A symbolic scalar expression.
///
/// Named leaves do not own their name or value; they index a slot in the
/// compilation's [`Registry`], so every tree mentioning a declared name
/// aliases the same slot. All transformation methods (`diff`, `optimize`,
/// `replace`) are pure and return new trees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Expr {
    Constant(f64),
    Leaf(SlotId),
    Aux(AuxId),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary(TernaryOp, Box<Expr>, Box<Expr>, Box<Expr>),
    /// `clip(x, lo, hi, y)`: y while lo <= x <= hi, zero outside.
    Clip(Box<Expr>, Box<Expr>, Box<Expr>, Box<Expr>),
    IfThenElse(Box<Logical>, Box<Expr>, Box<Expr>),
}

impl PartialEq for Expr {
    /// Structural equality; addition and multiplication also match with
    /// swapped operands, which is what `replace` and the diffusion-term
    /// search rely on.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Expr::Constant(a), Expr::Constant(b)) => a == b,
            (Expr::Leaf(a), Expr::Leaf(b)) => a == b,
            (Expr::Aux(a), Expr::Aux(b)) => a == b,
            (Expr::Unary(op_a, a), Expr::Unary(op_b, b)) => op_a == op_b && a == b,
            (Expr::Binary(op_a, a1, a2), Expr::Binary(op_b, b1, b2)) => {
                op_a == op_b
                    && ((a1 == b1 && a2 == b2)
                        || (matches!(op_a, BinaryOp::Add | BinaryOp::Mul) && a1 == b2 && a2 == b1))
            }
            (Expr::Ternary(op_a, a1, a2, a3), Expr::Ternary(op_b, b1, b2, b3)) => {
                op_a == op_b && a1 == b1 && a2 == b2 && a3 == b3
            }
            (Expr::Clip(a1, a2, a3, a4), Expr::Clip(b1, b2, b3, b4)) => {
                a1 == b1 && a2 == b2 && a3 == b3 && a4 == b4
            }
            (Expr::IfThenElse(ca, a1, a2), Expr::IfThenElse(cb, b1, b2)) => {
                ca == cb && a1 == b1 && a2 == b2
            }
            _ => false,
        }
    }
}

impl Expr {
    pub fn constant(value: f64) -> Expr {
        Expr::Constant(value)
    }

    pub fn neg(a: Expr) -> Expr {
        Expr::Unary(UnaryOp::Neg, Box::new(a))
    }

    pub fn add(a: Expr, b: Expr) -> Expr {
        Expr::Binary(BinaryOp::Add, Box::new(a), Box::new(b))
    }

    pub fn sub(a: Expr, b: Expr) -> Expr {
        Expr::Binary(BinaryOp::Sub, Box::new(a), Box::new(b))
    }

    pub fn mul(a: Expr, b: Expr) -> Expr {
        Expr::Binary(BinaryOp::Mul, Box::new(a), Box::new(b))
    }

    pub fn div(a: Expr, b: Expr) -> Expr {
        Expr::Binary(BinaryOp::Div, Box::new(a), Box::new(b))
    }

    pub fn pow(a: Expr, b: Expr) -> Expr {
        Expr::Binary(BinaryOp::Pow, Box::new(a), Box::new(b))
    }

    pub fn unary(op: UnaryOp, a: Expr) -> Expr {
        Expr::Unary(op, Box::new(a))
    }

    /// Recursively evaluates the tree against the current slot values.
    /// Domain errors and division by zero follow IEEE semantics (NaN or an
    /// infinity comes back), never an error.
    pub fn eval(&self, registry: &Registry) -> f64 {
        match self {
            Expr::Constant(v) => *v,
            Expr::Leaf(id) => registry.value(*id),
            Expr::Aux(id) => match &registry.auxiliary(*id).body {
                AuxBody::Scalar(e) => e.eval(registry),
                AuxBody::Truth(l) => {
                    if l.eval(registry) {
                        1.0
                    } else {
                        0.0
                    }
                }
            },
            Expr::Unary(op, a) => apply_unary(*op, a.eval(registry)),
            Expr::Binary(op, a, b) => {
                let a = a.eval(registry);
                let b = b.eval(registry);
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Pow => a.powf(b),
                    BinaryOp::Atan2 => a.atan2(b),
                    BinaryOp::Max => a.max(b),
                    BinaryOp::Min => a.min(b),
                    BinaryOp::Rand => a + (b - a) * rand::rng().random::<f64>(),
                    BinaryOp::Gauss => a + b * gaussian_sample(),
                }
            }
            Expr::Ternary(op, a, b, c) => {
                let a = a.eval(registry);
                let b = b.eval(registry);
                let c = c.eval(registry);
                match op {
                    TernaryOp::Mod => b + (a - b).rem_euclid(c - b),
                    TernaryOp::Step => {
                        if a >= b {
                            c
                        } else {
                            0.0
                        }
                    }
                }
            }
            Expr::Clip(x, lo, hi, y) => {
                let x = x.eval(registry);
                if x >= lo.eval(registry) && x <= hi.eval(registry) {
                    y.eval(registry)
                } else {
                    0.0
                }
            }
            Expr::IfThenElse(cond, a, b) => {
                if cond.eval(registry) {
                    a.eval(registry)
                } else {
                    b.eval(registry)
                }
            }
        }
    }

    /// Whether a symbolic derivative exists. Clip and if-then-else report
    /// false regardless of their operands; everything else is the AND of
    /// its children.
    pub fn is_differentiable(&self, registry: &Registry) -> bool {
        match self {
            Expr::Constant(_) | Expr::Leaf(_) => true,
            Expr::Aux(id) => match &registry.auxiliary(*id).body {
                AuxBody::Scalar(e) => e.is_differentiable(registry),
                AuxBody::Truth(_) => false,
            },
            Expr::Unary(_, a) => a.is_differentiable(registry),
            Expr::Binary(_, a, b) => {
                a.is_differentiable(registry) && b.is_differentiable(registry)
            }
            Expr::Ternary(_, a, b, c) => {
                a.is_differentiable(registry)
                    && b.is_differentiable(registry)
                    && c.is_differentiable(registry)
            }
            Expr::Clip(..) | Expr::IfThenElse(..) => false,
        }
    }

    /// Whether the tree can be rendered in the Taylor-operation vocabulary.
    /// Only the constructs the series propagator knows qualify; `pow` needs
    /// a constant exponent.
    pub fn is_expandable(&self, registry: &Registry) -> bool {
        match self {
            Expr::Constant(_) | Expr::Leaf(_) => true,
            Expr::Aux(id) => match &registry.auxiliary(*id).body {
                AuxBody::Scalar(e) => e.is_expandable(registry),
                AuxBody::Truth(_) => false,
            },
            Expr::Unary(op, a) => {
                matches!(
                    op,
                    UnaryOp::Neg
                        | UnaryOp::Sin
                        | UnaryOp::Cos
                        | UnaryOp::Tan
                        | UnaryOp::Log
                        | UnaryOp::Exp
                        | UnaryOp::Sqrt
                ) && a.is_expandable(registry)
            }
            Expr::Binary(BinaryOp::Pow, a, b) => {
                matches!(**b, Expr::Constant(_)) && a.is_expandable(registry)
            }
            Expr::Binary(op, a, b) => {
                matches!(
                    op,
                    BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div
                ) && a.is_expandable(registry)
                    && b.is_expandable(registry)
            }
            Expr::Ternary(..) | Expr::Clip(..) | Expr::IfThenElse(..) => false,
        }
    }

    /// Structural derivative with respect to the named leaf `x`. The result
    /// is generally unsimplified; run `optimize` over it afterwards.
    pub fn diff(&self, x: SlotId, registry: &Registry) -> Expr {
        match self {
            Expr::Constant(_) => Expr::Constant(0.0),
            Expr::Leaf(id) => {
                if *id == x {
                    Expr::Constant(1.0)
                } else {
                    Expr::Constant(0.0)
                }
            }
            Expr::Aux(id) => match &registry.auxiliary(*id).body {
                AuxBody::Scalar(e) => e.diff(x, registry),
                AuxBody::Truth(_) => Expr::Constant(0.0),
            },
            Expr::Unary(op, a) => {
                let da = a.diff(x, registry);
                let a = (**a).clone();
                match op {
                    UnaryOp::Neg => Expr::neg(da),
                    UnaryOp::Sin => Expr::mul(Expr::unary(UnaryOp::Cos, a), da),
                    UnaryOp::Cos => Expr::neg(Expr::mul(Expr::unary(UnaryOp::Sin, a), da)),
                    UnaryOp::Tan => Expr::div(
                        da,
                        Expr::pow(Expr::unary(UnaryOp::Cos, a), Expr::Constant(2.0)),
                    ),
                    UnaryOp::Asin => Expr::div(
                        da,
                        Expr::unary(
                            UnaryOp::Sqrt,
                            Expr::sub(Expr::Constant(1.0), Expr::pow(a, Expr::Constant(2.0))),
                        ),
                    ),
                    UnaryOp::Acos => Expr::neg(Expr::div(
                        da,
                        Expr::unary(
                            UnaryOp::Sqrt,
                            Expr::sub(Expr::Constant(1.0), Expr::pow(a, Expr::Constant(2.0))),
                        ),
                    )),
                    UnaryOp::Atan => Expr::div(
                        da,
                        Expr::add(Expr::Constant(1.0), Expr::pow(a, Expr::Constant(2.0))),
                    ),
                    UnaryOp::Log => Expr::div(da, a),
                    UnaryOp::Exp => Expr::mul(Expr::unary(UnaryOp::Exp, a), da),
                    UnaryOp::Sqrt => Expr::div(
                        da,
                        Expr::mul(Expr::Constant(2.0), Expr::unary(UnaryOp::Sqrt, a)),
                    ),
                    UnaryOp::Abs => Expr::mul(Expr::unary(UnaryOp::Sign, a), da),
                    UnaryOp::Sign => Expr::Constant(0.0),
                }
            }
            Expr::Binary(op, a, b) => {
                let da = a.diff(x, registry);
                let db = b.diff(x, registry);
                let a = (**a).clone();
                let b = (**b).clone();
                match op {
                    BinaryOp::Add => Expr::add(da, db),
                    BinaryOp::Sub => Expr::sub(da, db),
                    BinaryOp::Mul => {
                        Expr::add(Expr::mul(da, b), Expr::mul(a, db))
                    }
                    BinaryOp::Div => Expr::div(
                        Expr::sub(Expr::mul(da, b.clone()), Expr::mul(a, db)),
                        Expr::pow(b, Expr::Constant(2.0)),
                    ),
                    BinaryOp::Pow => {
                        if let Expr::Constant(c) = b {
                            // d(u^c) = c * u^(c-1) * u'
                            Expr::mul(
                                Expr::mul(
                                    Expr::Constant(c),
                                    Expr::pow(a, Expr::Constant(c - 1.0)),
                                ),
                                da,
                            )
                        } else {
                            // d(u^v) = u^v * (v' log u + v u' / u)
                            Expr::mul(
                                Expr::pow(a.clone(), b.clone()),
                                Expr::add(
                                    Expr::mul(db, Expr::unary(UnaryOp::Log, a.clone())),
                                    Expr::div(Expr::mul(b, da), a),
                                ),
                            )
                        }
                    }
                    BinaryOp::Atan2 => {
                        // d atan2(y, x) = (y' x - y x') / (x^2 + y^2)
                        Expr::div(
                            Expr::sub(Expr::mul(da, b.clone()), Expr::mul(a.clone(), db)),
                            Expr::add(
                                Expr::pow(b, Expr::Constant(2.0)),
                                Expr::pow(a, Expr::Constant(2.0)),
                            ),
                        )
                    }
                    BinaryOp::Max => Expr::IfThenElse(
                        Box::new(Logical::Cmp(
                            crate::logic::CmpOp::Ge,
                            Box::new(a),
                            Box::new(b),
                        )),
                        Box::new(da),
                        Box::new(db),
                    ),
                    BinaryOp::Min => Expr::IfThenElse(
                        Box::new(Logical::Cmp(
                            crate::logic::CmpOp::Le,
                            Box::new(a),
                            Box::new(b),
                        )),
                        Box::new(da),
                        Box::new(db),
                    ),
                    BinaryOp::Rand | BinaryOp::Gauss => Expr::Constant(0.0),
                }
            }
            Expr::Ternary(op, a, b, c) => match op {
                // Wrapping has slope one almost everywhere.
                TernaryOp::Mod => a.diff(x, registry),
                TernaryOp::Step => Expr::Ternary(
                    TernaryOp::Step,
                    a.clone(),
                    b.clone(),
                    Box::new(c.diff(x, registry)),
                ),
            },
            Expr::Clip(..) | Expr::IfThenElse(..) => Expr::Constant(0.0),
        }
    }

    /// One local-rewrite pass: children first, then constant folding and
    /// identity elimination at this node. Not a fixed point; callers apply
    /// it a configurable number of times.
    pub fn optimize(&self, registry: &Registry) -> Expr {
        match self {
            Expr::Constant(_) | Expr::Leaf(_) | Expr::Aux(_) => self.clone(),
            Expr::Unary(op, a) => optimize_unary(*op, a.optimize(registry)),
            Expr::Binary(op, a, b) => {
                optimize_binary(*op, a.optimize(registry), b.optimize(registry))
            }
            Expr::Ternary(op, a, b, c) => {
                let a = a.optimize(registry);
                let b = b.optimize(registry);
                let c = c.optimize(registry);
                if let (Expr::Constant(x), Expr::Constant(lo), Expr::Constant(y)) = (&a, &b, &c) {
                    return Expr::Constant(match op {
                        TernaryOp::Mod => lo + (x - lo).rem_euclid(y - lo),
                        TernaryOp::Step => {
                            if x >= lo {
                                *y
                            } else {
                                0.0
                            }
                        }
                    });
                }
                Expr::Ternary(*op, Box::new(a), Box::new(b), Box::new(c))
            }
            Expr::Clip(x, lo, hi, y) => Expr::Clip(
                Box::new(x.optimize(registry)),
                Box::new(lo.optimize(registry)),
                Box::new(hi.optimize(registry)),
                Box::new(y.optimize(registry)),
            ),
            Expr::IfThenElse(cond, a, b) => Expr::IfThenElse(
                Box::new(cond.optimize(registry)),
                Box::new(a.optimize(registry)),
                Box::new(b.optimize(registry)),
            ),
        }
    }

    /// Returns a new tree with every subtree structurally equal to `target`
    /// replaced by `replacement`. Untouched subtrees are cloned as-is.
    pub fn replace(&self, target: &Expr, replacement: &Expr) -> Expr {
        if self == target {
            return replacement.clone();
        }
        match self {
            Expr::Constant(_) | Expr::Leaf(_) | Expr::Aux(_) => self.clone(),
            Expr::Unary(op, a) => Expr::Unary(*op, Box::new(a.replace(target, replacement))),
            Expr::Binary(op, a, b) => Expr::Binary(
                *op,
                Box::new(a.replace(target, replacement)),
                Box::new(b.replace(target, replacement)),
            ),
            Expr::Ternary(op, a, b, c) => Expr::Ternary(
                *op,
                Box::new(a.replace(target, replacement)),
                Box::new(b.replace(target, replacement)),
                Box::new(c.replace(target, replacement)),
            ),
            Expr::Clip(x, lo, hi, y) => Expr::Clip(
                Box::new(x.replace(target, replacement)),
                Box::new(lo.replace(target, replacement)),
                Box::new(hi.replace(target, replacement)),
                Box::new(y.replace(target, replacement)),
            ),
            Expr::IfThenElse(cond, a, b) => Expr::IfThenElse(
                Box::new(cond.replace(target, replacement)),
                Box::new(a.replace(target, replacement)),
                Box::new(b.replace(target, replacement)),
            ),
        }
    }

    pub fn contains(&self, needle: &Expr) -> bool {
        if self == needle {
            return true;
        }
        match self {
            Expr::Constant(_) | Expr::Leaf(_) | Expr::Aux(_) => false,
            Expr::Unary(_, a) => a.contains(needle),
            Expr::Binary(_, a, b) => a.contains(needle) || b.contains(needle),
            Expr::Ternary(_, a, b, c) => {
                a.contains(needle) || b.contains(needle) || c.contains(needle)
            }
            Expr::Clip(x, lo, hi, y) => {
                x.contains(needle) || lo.contains(needle) || hi.contains(needle) || y.contains(needle)
            }
            Expr::IfThenElse(cond, a, b) => {
                cond.contains(needle) || a.contains(needle) || b.contains(needle)
            }
        }
    }

    /// Flattened subtree list: this node first, then each operand's list in
    /// left-to-right order. The diffusion-term search walks this.
    pub fn elements(&self) -> Vec<&Expr> {
        let mut out = Vec::new();
        self.collect_elements(&mut out);
        out
    }

    fn collect_elements<'a>(&'a self, out: &mut Vec<&'a Expr>) {
        out.push(self);
        match self {
            Expr::Constant(_) | Expr::Leaf(_) | Expr::Aux(_) => {}
            Expr::Unary(_, a) => a.collect_elements(out),
            Expr::Binary(_, a, b) => {
                a.collect_elements(out);
                b.collect_elements(out);
            }
            Expr::Ternary(_, a, b, c) => {
                a.collect_elements(out);
                b.collect_elements(out);
                c.collect_elements(out);
            }
            Expr::Clip(x, lo, hi, y) => {
                x.collect_elements(out);
                lo.collect_elements(out);
                hi.collect_elements(out);
                y.collect_elements(out);
            }
            Expr::IfThenElse(_, a, b) => {
                a.collect_elements(out);
                b.collect_elements(out);
            }
        }
    }

    /// Best-effort symbolic solve: given `self == f`, tries to rewrite into
    /// an expression for `e`. `None` means the shape was not recognized —
    /// an expected outcome, not an error.
    pub fn isolate(&self, f: Expr, e: &Expr) -> Option<Expr> {
        if self == e {
            return Some(f);
        }
        match self {
            Expr::Binary(BinaryOp::Add, a, b) => {
                let in_left = a.contains(e);
                let in_right = b.contains(e);
                match (in_left, in_right) {
                    (false, false) => None,
                    (true, true) => {
                        let fa = a.factor(e)?;
                        let fb = b.factor(e)?;
                        Some(Expr::div(f, Expr::add(fa, fb)))
                    }
                    (true, false) => a.isolate(Expr::sub(f, (**b).clone()), e),
                    (false, true) => b.isolate(Expr::sub(f, (**a).clone()), e),
                }
            }
            Expr::Binary(BinaryOp::Sub, a, b) => {
                let in_left = a.contains(e);
                let in_right = b.contains(e);
                match (in_left, in_right) {
                    (false, false) => None,
                    (true, true) => {
                        let fa = a.factor(e)?;
                        let fb = b.factor(e)?;
                        Some(Expr::div(f, Expr::sub(fa, fb)))
                    }
                    (true, false) => a.isolate(Expr::add(f, (**b).clone()), e),
                    (false, true) => b.isolate(Expr::sub((**a).clone(), f), e),
                }
            }
            Expr::Binary(BinaryOp::Mul, a, b) => {
                let in_left = a.contains(e);
                let in_right = b.contains(e);
                match (in_left, in_right) {
                    (true, false) => a.isolate(Expr::div(f, (**b).clone()), e),
                    (false, true) => b.isolate(Expr::div(f, (**a).clone()), e),
                    _ => None,
                }
            }
            Expr::Binary(BinaryOp::Div, a, b) => {
                let in_left = a.contains(e);
                let in_right = b.contains(e);
                match (in_left, in_right) {
                    (true, false) => a.isolate(Expr::mul(f, (**b).clone()), e),
                    (false, true) => b.isolate(Expr::div((**a).clone(), f), e),
                    _ => None,
                }
            }
            Expr::Binary(BinaryOp::Pow, a, b) => {
                if let Expr::Constant(c) = **b {
                    if c != 0.0 && a.contains(e) {
                        return a.isolate(Expr::pow(f, Expr::Constant(1.0 / c)), e);
                    }
                }
                None
            }
            Expr::Unary(op, a) => {
                if !a.contains(e) {
                    return None;
                }
                let inverted = match op {
                    UnaryOp::Neg => Expr::neg(f),
                    UnaryOp::Sin => Expr::unary(UnaryOp::Asin, f),
                    UnaryOp::Cos => Expr::unary(UnaryOp::Acos, f),
                    UnaryOp::Tan => Expr::unary(UnaryOp::Atan, f),
                    UnaryOp::Asin => Expr::unary(UnaryOp::Sin, f),
                    UnaryOp::Acos => Expr::unary(UnaryOp::Cos, f),
                    UnaryOp::Atan => Expr::unary(UnaryOp::Tan, f),
                    UnaryOp::Exp => Expr::unary(UnaryOp::Log, f),
                    UnaryOp::Log => Expr::unary(UnaryOp::Exp, f),
                    UnaryOp::Sqrt => Expr::pow(f, Expr::Constant(2.0)),
                    UnaryOp::Abs | UnaryOp::Sign => return None,
                };
                a.isolate(inverted, e)
            }
            _ => None,
        }
    }

    /// Best-effort linear-coefficient extraction: if `self` can be written
    /// as `g * e` with `g` free of `e`, returns `g`. The diffusion pass
    /// uses this to pull process coefficients out of drift terms.
    pub fn factor(&self, e: &Expr) -> Option<Expr> {
        if self == e {
            return Some(Expr::Constant(1.0));
        }
        match self {
            Expr::Binary(BinaryOp::Add, a, b) => {
                let fa = a.factor(e)?;
                let fb = b.factor(e)?;
                Some(Expr::add(fa, fb))
            }
            Expr::Binary(BinaryOp::Sub, a, b) => {
                let fa = a.factor(e)?;
                let fb = b.factor(e)?;
                Some(Expr::sub(fa, fb))
            }
            Expr::Binary(BinaryOp::Mul, a, b) => {
                match (a.factor(e), b.factor(e)) {
                    (Some(_), Some(_)) => None,
                    (Some(fa), None) => {
                        if b.contains(e) {
                            None
                        } else {
                            Some(Expr::mul(fa, (**b).clone()))
                        }
                    }
                    (None, Some(fb)) => {
                        if a.contains(e) {
                            None
                        } else {
                            Some(Expr::mul((**a).clone(), fb))
                        }
                    }
                    (None, None) => None,
                }
            }
            Expr::Binary(BinaryOp::Div, a, b) => {
                if b.contains(e) {
                    return None;
                }
                let fa = a.factor(e)?;
                Some(Expr::div(fa, (**b).clone()))
            }
            Expr::Unary(UnaryOp::Neg, a) => a.factor(e).map(Expr::neg),
            _ => None,
        }
    }

    /// Fully parenthesized human-readable rendering, used by the
    /// compilation transcript.
    pub fn render_infix(&self, registry: &Registry) -> String {
        match self {
            Expr::Constant(v) => fmt_f64(*v),
            Expr::Leaf(id) => registry.name(*id).to_string(),
            Expr::Aux(id) => registry.auxiliary(*id).name.clone(),
            Expr::Unary(UnaryOp::Neg, a) => format!("(-{})", a.render_infix(registry)),
            Expr::Unary(op, a) => format!("{}({})", unary_token(*op), a.render_infix(registry)),
            Expr::Binary(op, a, b) => {
                let a = a.render_infix(registry);
                let b = b.render_infix(registry);
                match op {
                    BinaryOp::Add => format!("({a}+{b})"),
                    BinaryOp::Sub => format!("({a}-{b})"),
                    BinaryOp::Mul => format!("({a}*{b})"),
                    BinaryOp::Div => format!("({a}/{b})"),
                    BinaryOp::Pow => format!("({a}^{b})"),
                    BinaryOp::Atan2 => format!("atan2({a},{b})"),
                    BinaryOp::Max => format!("max({a},{b})"),
                    BinaryOp::Min => format!("min({a},{b})"),
                    BinaryOp::Rand => format!("rand({a},{b})"),
                    BinaryOp::Gauss => format!("gauss({a},{b})"),
                }
            }
            Expr::Ternary(op, a, b, c) => format!(
                "{}({},{},{})",
                match op {
                    TernaryOp::Mod => "mod",
                    TernaryOp::Step => "step",
                },
                a.render_infix(registry),
                b.render_infix(registry),
                c.render_infix(registry)
            ),
            Expr::Clip(x, lo, hi, y) => format!(
                "clip({},{},{},{})",
                x.render_infix(registry),
                lo.render_infix(registry),
                hi.render_infix(registry),
                y.render_infix(registry)
            ),
            Expr::IfThenElse(cond, a, b) => format!(
                "ifte({},{},{})",
                cond.render_infix(registry),
                a.render_infix(registry),
                b.render_infix(registry)
            ),
        }
    }
}

pub(crate) fn unary_token(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Neg => "minus",
        UnaryOp::Sin => "sin",
        UnaryOp::Cos => "cos",
        UnaryOp::Tan => "tan",
        UnaryOp::Asin => "asin",
        UnaryOp::Acos => "acos",
        UnaryOp::Atan => "atan",
        UnaryOp::Log => "log",
        UnaryOp::Exp => "exp",
        UnaryOp::Sqrt => "sqrt",
        UnaryOp::Abs => "abs",
        UnaryOp::Sign => "sign",
    }
}

fn apply_unary(op: UnaryOp, a: f64) -> f64 {
    match op {
        UnaryOp::Neg => -a,
        UnaryOp::Sin => a.sin(),
        UnaryOp::Cos => a.cos(),
        UnaryOp::Tan => a.tan(),
        UnaryOp::Asin => a.asin(),
        UnaryOp::Acos => a.acos(),
        UnaryOp::Atan => a.atan(),
        UnaryOp::Log => a.ln(),
        UnaryOp::Exp => a.exp(),
        UnaryOp::Sqrt => a.sqrt(),
        UnaryOp::Abs => a.abs(),
        UnaryOp::Sign => sign(a),
    }
}

// f64::signum maps zero to one; the sign node keeps zero at zero.
fn sign(a: f64) -> f64 {
    if a > 0.0 {
        1.0
    } else if a < 0.0 {
        -1.0
    } else {
        a
    }
}

fn gaussian_sample() -> f64 {
    let mut rng = rand::rng();
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

fn optimize_unary(op: UnaryOp, a: Expr) -> Expr {
    match (op, a) {
        (op, Expr::Constant(v)) => Expr::Constant(apply_unary(op, v)),
        // --a -> a
        (UnaryOp::Neg, Expr::Unary(UnaryOp::Neg, inner)) => *inner,
        (op, a) => Expr::Unary(op, Box::new(a)),
    }
}

fn optimize_binary(op: BinaryOp, a: Expr, b: Expr) -> Expr {
    // Stochastic nodes must stay stochastic: folding them would freeze one
    // sample into the tree.
    if !matches!(op, BinaryOp::Rand | BinaryOp::Gauss) {
        if let (Expr::Constant(x), Expr::Constant(y)) = (&a, &b) {
            let folded = match op {
                BinaryOp::Add => x + y,
                BinaryOp::Sub => x - y,
                BinaryOp::Mul => x * y,
                BinaryOp::Div => x / y,
                BinaryOp::Pow => x.powf(*y),
                BinaryOp::Atan2 => x.atan2(*y),
                BinaryOp::Max => x.max(*y),
                BinaryOp::Min => x.min(*y),
                BinaryOp::Rand | BinaryOp::Gauss => unreachable!(),
            };
            return Expr::Constant(folded);
        }
    }

    match op {
        BinaryOp::Add => optimize_add(a, b),
        BinaryOp::Sub => optimize_sub(a, b),
        BinaryOp::Mul => optimize_mul(a, b),
        BinaryOp::Div => optimize_div(a, b),
        BinaryOp::Pow => optimize_pow(a, b),
        BinaryOp::Max | BinaryOp::Min if a == b => a,
        _ => Expr::Binary(op, Box::new(a), Box::new(b)),
    }
}

fn is_const(e: &Expr, v: f64) -> bool {
    matches!(e, Expr::Constant(c) if *c == v)
}

fn optimize_add(a: Expr, b: Expr) -> Expr {
    if is_const(&a, 0.0) {
        return b;
    }
    if is_const(&b, 0.0) {
        return a;
    }

    // Merge a constant with a constant one level down a nested addition.
    if let Expr::Constant(c) = a {
        if let Expr::Binary(BinaryOp::Add, ba, bb) = &b {
            if let Expr::Constant(c2) = **ba {
                return Expr::add(Expr::Constant(c + c2), (**bb).clone());
            }
            if let Expr::Constant(c2) = **bb {
                return Expr::add(Expr::Constant(c + c2), (**ba).clone());
            }
        }
    }
    if let Expr::Constant(c) = b {
        if let Expr::Binary(BinaryOp::Add, aa, ab) = &a {
            if let Expr::Constant(c2) = **aa {
                return Expr::add(Expr::Constant(c + c2), (**ab).clone());
            }
            if let Expr::Constant(c2) = **ab {
                return Expr::add(Expr::Constant(c + c2), (**aa).clone());
            }
        }
    }

    match (a, b) {
        // -a + -b -> -(a + b)
        (Expr::Unary(UnaryOp::Neg, a), Expr::Unary(UnaryOp::Neg, b)) => {
            Expr::neg(Expr::add(*a, *b))
        }
        // -a + b -> b - a
        (Expr::Unary(UnaryOp::Neg, a), b) => Expr::sub(b, *a),
        // a + -b -> a - b
        (a, Expr::Unary(UnaryOp::Neg, b)) => Expr::sub(a, *b),
        // log a + log b -> log(a * b)
        (Expr::Unary(UnaryOp::Log, a), Expr::Unary(UnaryOp::Log, b)) => {
            Expr::unary(UnaryOp::Log, Expr::mul(*a, *b))
        }
        (a, b) => {
            if a == b {
                Expr::mul(Expr::Constant(2.0), a)
            } else {
                Expr::add(a, b)
            }
        }
    }
}

fn optimize_sub(a: Expr, b: Expr) -> Expr {
    if is_const(&b, 0.0) {
        return a;
    }
    if is_const(&a, 0.0) {
        return Expr::neg(b);
    }
    if a == b {
        return Expr::Constant(0.0);
    }
    match b {
        // a - -b -> a + b
        Expr::Unary(UnaryOp::Neg, inner) => Expr::add(a, *inner),
        b => Expr::sub(a, b),
    }
}

fn optimize_mul(a: Expr, b: Expr) -> Expr {
    if is_const(&a, 0.0) || is_const(&b, 0.0) {
        return Expr::Constant(0.0);
    }
    if is_const(&a, 1.0) {
        return b;
    }
    if is_const(&b, 1.0) {
        return a;
    }
    if is_const(&a, -1.0) {
        return Expr::neg(b);
    }
    if is_const(&b, -1.0) {
        return Expr::neg(a);
    }

    // Merge a constant with a constant one level down a nested product.
    if let Expr::Constant(c) = a {
        if let Expr::Binary(BinaryOp::Mul, ba, bb) = &b {
            if let Expr::Constant(c2) = **ba {
                return Expr::mul(Expr::Constant(c * c2), (**bb).clone());
            }
            if let Expr::Constant(c2) = **bb {
                return Expr::mul(Expr::Constant(c * c2), (**ba).clone());
            }
        }
    }
    if let Expr::Constant(c) = b {
        if let Expr::Binary(BinaryOp::Mul, aa, ab) = &a {
            if let Expr::Constant(c2) = **aa {
                return Expr::mul(Expr::Constant(c * c2), (**ab).clone());
            }
            if let Expr::Constant(c2) = **ab {
                return Expr::mul(Expr::Constant(c * c2), (**aa).clone());
            }
        }
    }

    match (a, b) {
        // -a * -b -> a * b
        (Expr::Unary(UnaryOp::Neg, a), Expr::Unary(UnaryOp::Neg, b)) => Expr::mul(*a, *b),
        // -a * b -> -(a * b)
        (Expr::Unary(UnaryOp::Neg, a), b) => Expr::neg(Expr::mul(*a, b)),
        // a * -b -> -(a * b)
        (a, Expr::Unary(UnaryOp::Neg, b)) => Expr::neg(Expr::mul(a, *b)),
        // exp a * exp b -> exp(a + b)
        (Expr::Unary(UnaryOp::Exp, a), Expr::Unary(UnaryOp::Exp, b)) => {
            Expr::unary(UnaryOp::Exp, Expr::add(*a, *b))
        }
        (a, b) => {
            if a == b {
                return Expr::pow(a, Expr::Constant(2.0));
            }
            // a^p * a^q -> a^(p+q), a^p * a -> a^(p+1), a * a^p -> a^(p+1)
            if let (Expr::Binary(BinaryOp::Pow, base_a, exp_a), Expr::Binary(BinaryOp::Pow, base_b, exp_b)) =
                (&a, &b)
            {
                if base_a == base_b {
                    return Expr::pow((**base_a).clone(), Expr::add((**exp_a).clone(), (**exp_b).clone()));
                }
            }
            if let Expr::Binary(BinaryOp::Pow, base, exp) = &a {
                if **base == b {
                    return Expr::pow(b, Expr::add((**exp).clone(), Expr::Constant(1.0)));
                }
            }
            if let Expr::Binary(BinaryOp::Pow, base, exp) = &b {
                if **base == a {
                    return Expr::pow(a, Expr::add((**exp).clone(), Expr::Constant(1.0)));
                }
            }
            Expr::mul(a, b)
        }
    }
}

fn optimize_div(a: Expr, b: Expr) -> Expr {
    if is_const(&b, 1.0) {
        return a;
    }
    if is_const(&a, 0.0) {
        return Expr::Constant(0.0);
    }
    if a == b {
        return Expr::Constant(1.0);
    }
    if let (Expr::Unary(UnaryOp::Neg, a), Expr::Unary(UnaryOp::Neg, b)) = (&a, &b) {
        return Expr::div((**a).clone(), (**b).clone());
    }
    Expr::div(a, b)
}

fn optimize_pow(a: Expr, b: Expr) -> Expr {
    if is_const(&b, 1.0) {
        return a;
    }
    if is_const(&b, 0.0) {
        return Expr::Constant(1.0);
    }
    if is_const(&a, 1.0) {
        return Expr::Constant(1.0);
    }
    Expr::pow(a, b)
}

pub(crate) fn fmt_f64(v: f64) -> String {
    if v.is_finite() && v == v.trunc() && v.abs() < 1e15 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    fn leaf(registry: &mut Registry, name: &str, value: f64) -> (SlotId, Expr) {
        let id = registry.intern_variable(name, value);
        (id, Expr::Leaf(id))
    }

    #[test]
    fn eval_follows_ieee_semantics() {
        let registry = Registry::new();
        let division = Expr::div(Expr::Constant(1.0), Expr::Constant(0.0));
        assert!(division.eval(&registry).is_infinite());
        let domain = Expr::unary(UnaryOp::Log, Expr::Constant(-1.0));
        assert!(domain.eval(&registry).is_nan());
    }

    #[test]
    fn leaf_values_are_shared_through_the_registry() {
        let mut registry = Registry::new();
        let (id, x) = leaf(&mut registry, "x", 2.0);
        let left = Expr::mul(x.clone(), Expr::Constant(3.0));
        let right = Expr::add(x, Expr::Constant(1.0));
        assert_eq!(left.eval(&registry), 6.0);
        assert_eq!(right.eval(&registry), 3.0);

        registry.set_value(id, 10.0);
        assert_eq!(left.eval(&registry), 30.0);
        assert_eq!(right.eval(&registry), 11.0);
    }

    #[test]
    fn derivative_matches_finite_differences() {
        let mut registry = Registry::new();
        let (id, x) = leaf(&mut registry, "x", 0.0);
        // f = x + sin(3 x)
        let f = Expr::add(
            x.clone(),
            Expr::unary(UnaryOp::Sin, Expr::mul(Expr::Constant(3.0), x)),
        );
        let mut df = f.diff(id, &registry);
        for _ in 0..3 {
            df = df.optimize(&registry);
        }

        let h = 1e-6;
        for sample in [-1.3, -0.4, 0.0, 0.7, 2.1] {
            registry.set_value(id, sample + h);
            let up = f.eval(&registry);
            registry.set_value(id, sample - h);
            let down = f.eval(&registry);
            registry.set_value(id, sample);
            let expected = (up - down) / (2.0 * h);
            let got = df.eval(&registry);
            assert!(
                (got - expected).abs() < 1e-5,
                "df({sample}) = {got}, finite difference {expected}"
            );
        }
    }

    #[test]
    fn derivative_of_leaf_is_one_or_zero() {
        let mut registry = Registry::new();
        let (x_id, x) = leaf(&mut registry, "x", 0.0);
        let (y_id, _) = leaf(&mut registry, "y", 0.0);
        assert_eq!(x.diff(x_id, &registry), Expr::Constant(1.0));
        assert_eq!(x.diff(y_id, &registry), Expr::Constant(0.0));
    }

    #[test]
    fn one_pass_identities() {
        let mut registry = Registry::new();
        let (_, a) = leaf(&mut registry, "a", 1.5);

        let cases = [
            (Expr::add(a.clone(), Expr::Constant(0.0)), a.clone()),
            (Expr::mul(a.clone(), Expr::Constant(0.0)), Expr::Constant(0.0)),
            (Expr::pow(a.clone(), Expr::Constant(1.0)), a.clone()),
            (Expr::pow(a.clone(), Expr::Constant(0.0)), Expr::Constant(1.0)),
            (Expr::mul(Expr::Constant(1.0), a.clone()), a.clone()),
            (Expr::div(a.clone(), Expr::Constant(1.0)), a.clone()),
        ];
        for (input, expected) in cases {
            assert_eq!(input.optimize(&registry), expected);
        }
    }

    #[test]
    fn constants_fold_for_random_pairs() {
        let registry = Registry::new();
        let mut rng = rand::rng();
        for _ in 0..100 {
            let p: f64 = rng.random_range(-1e3..1e3);
            let q: f64 = rng.random_range(-1e3..1e3);
            let sum = Expr::add(Expr::Constant(p), Expr::Constant(q));
            assert_eq!(sum.optimize(&registry), Expr::Constant(p + q));
        }
    }

    #[test]
    fn repeated_optimize_reaches_the_bare_leaf() {
        let mut registry = Registry::new();
        let (_, x) = leaf(&mut registry, "x", 0.0);
        let (_, y) = leaf(&mut registry, "y", 0.0);
        // x*1 + 0*y
        let mut e = Expr::add(
            Expr::mul(x.clone(), Expr::Constant(1.0)),
            Expr::mul(Expr::Constant(0.0), y),
        );
        for _ in 0..5 {
            e = e.optimize(&registry);
        }
        assert_eq!(e, x);
    }

    #[test]
    fn stochastic_nodes_do_not_fold() {
        let registry = Registry::new();
        let noise = Expr::Binary(
            BinaryOp::Rand,
            Box::new(Expr::Constant(0.0)),
            Box::new(Expr::Constant(1.0)),
        );
        assert_eq!(noise.optimize(&registry), noise);
    }

    #[test]
    fn replace_substitutes_every_occurrence() {
        let mut registry = Registry::new();
        let (_, x) = leaf(&mut registry, "x", 2.0);
        let (_, y) = leaf(&mut registry, "y", 5.0);
        // x + x*3
        let e = Expr::add(x.clone(), Expr::mul(x.clone(), Expr::Constant(3.0)));
        assert_eq!(e.eval(&registry), 8.0);

        let swapped = e.replace(&x, &y);
        assert_eq!(swapped.eval(&registry), 20.0);

        // No occurrence: the tree is observably unchanged.
        let untouched = e.replace(&Expr::Constant(42.0), &y);
        assert_eq!(untouched, e);
    }

    #[test]
    fn addition_equality_is_commutative() {
        let mut registry = Registry::new();
        let (_, x) = leaf(&mut registry, "x", 0.0);
        let a = Expr::add(x.clone(), Expr::Constant(1.0));
        let b = Expr::add(Expr::Constant(1.0), x.clone());
        assert_eq!(a, b);
        let s = Expr::sub(x.clone(), Expr::Constant(1.0));
        let t = Expr::sub(Expr::Constant(1.0), x);
        assert_ne!(s, t);
    }

    #[test]
    fn elements_lists_self_then_operands() {
        let mut registry = Registry::new();
        let (_, x) = leaf(&mut registry, "x", 0.0);
        let e = Expr::add(x.clone(), Expr::Constant(1.0));
        let elements = e.elements();
        assert_eq!(elements.len(), 3);
        assert_eq!(*elements[0], e);
        assert_eq!(*elements[1], x);
        assert_eq!(*elements[2], Expr::Constant(1.0));
    }

    #[test]
    fn factor_extracts_linear_coefficients() {
        let mut registry = Registry::new();
        let (_, x) = leaf(&mut registry, "x", 0.0);
        let (_, w) = leaf(&mut registry, "w", 0.0);

        // 3 * w factors to 3.
        let term = Expr::mul(Expr::Constant(3.0), w.clone());
        let factor = term.factor(&w).expect("linear term should factor");
        assert_eq!(factor.eval(&registry), 3.0);

        // x * w factors to x; w * w does not.
        let linear = Expr::mul(x.clone(), w.clone());
        assert!(linear.factor(&w).is_some());
        let quadratic = Expr::mul(w.clone(), w.clone());
        assert!(quadratic.factor(&w).is_none());

        // sin(w) is not linear in w.
        let wrapped = Expr::unary(UnaryOp::Sin, w.clone());
        assert!(wrapped.factor(&w).is_none());
    }

    #[test]
    fn isolate_inverts_simple_shapes() {
        let mut registry = Registry::new();
        let (x_id, x) = leaf(&mut registry, "x", 0.0);
        let f = Expr::Constant(7.0);

        // 2*x + 1 == 7  =>  x == (7-1)/2
        let shape = Expr::add(Expr::mul(Expr::Constant(2.0), x.clone()), Expr::Constant(1.0));
        let solved = shape.isolate(f.clone(), &x).expect("shape should isolate");
        assert!((solved.eval(&registry) - 3.0).abs() < 1e-12);

        // exp(x) == 7  =>  x == log(7)
        let exp_shape = Expr::unary(UnaryOp::Exp, x.clone());
        let solved = exp_shape.isolate(f, &x).expect("exp should isolate");
        assert!((solved.eval(&registry) - 7.0_f64.ln()).abs() < 1e-12);

        // x*x is not recognized.
        let quadratic = Expr::mul(x.clone(), x.clone());
        assert!(quadratic.isolate(Expr::Constant(4.0), &x).is_none());
        let _ = x_id;
    }

    #[test]
    fn clip_and_ifte_are_never_differentiable() {
        let mut registry = Registry::new();
        let (_, x) = leaf(&mut registry, "x", 0.0);
        let clip = Expr::Clip(
            Box::new(x.clone()),
            Box::new(Expr::Constant(0.0)),
            Box::new(Expr::Constant(1.0)),
            Box::new(Expr::Constant(1.0)),
        );
        assert!(!clip.is_differentiable(&registry));
        assert!(Expr::add(x.clone(), x.clone()).is_differentiable(&registry));
        assert!(!Expr::add(x, clip).is_differentiable(&registry));
    }

    #[test]
    fn expandability_requires_the_taylor_vocabulary() {
        let mut registry = Registry::new();
        let (_, x) = leaf(&mut registry, "x", 0.0);
        assert!(Expr::unary(UnaryOp::Sin, x.clone()).is_expandable(&registry));
        assert!(!Expr::unary(UnaryOp::Abs, x.clone()).is_expandable(&registry));
        assert!(Expr::pow(x.clone(), Expr::Constant(3.0)).is_expandable(&registry));
        assert!(!Expr::pow(x.clone(), x.clone()).is_expandable(&registry));
        let _ = x;
    }

    #[test]
    fn render_infix_parenthesizes_fully() {
        let mut registry = Registry::new();
        let (_, x) = leaf(&mut registry, "x", 0.0);
        let e = Expr::add(
            x.clone(),
            Expr::unary(UnaryOp::Sin, Expr::mul(Expr::Constant(3.0), x)),
        );
        assert_eq!(e.render_infix(&registry), "(x+sin((3.0*x)))");
    }

    #[test]
    fn step_mod_clip_semantics() {
        let registry = Registry::new();
        let step = |x: f64| {
            Expr::Ternary(
                TernaryOp::Step,
                Box::new(Expr::Constant(x)),
                Box::new(Expr::Constant(1.0)),
                Box::new(Expr::Constant(5.0)),
            )
            .eval(&registry)
        };
        assert_eq!(step(0.5), 0.0);
        assert_eq!(step(1.0), 5.0);

        let wrapped = Expr::Ternary(
            TernaryOp::Mod,
            Box::new(Expr::Constant(7.5)),
            Box::new(Expr::Constant(0.0)),
            Box::new(Expr::Constant(2.0)),
        );
        assert!((wrapped.eval(&registry) - 1.5).abs() < 1e-12);

        let gate = |x: f64| {
            Expr::Clip(
                Box::new(Expr::Constant(x)),
                Box::new(Expr::Constant(0.0)),
                Box::new(Expr::Constant(1.0)),
                Box::new(Expr::Constant(3.0)),
            )
            .eval(&registry)
        };
        assert_eq!(gate(0.5), 3.0);
        assert_eq!(gate(2.0), 0.0);
    }
}
