use crate::expr::Expr;
use crate::registry::Registry;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Neq,
}

impl CmpOp {
    pub fn token(self) -> &'static str {
        match self {
            CmpOp::Gt => "gt",
            CmpOp::Ge => "ge",
            CmpOp::Lt => "lt",
            CmpOp::Le => "le",
            CmpOp::Eq => "eq",
            CmpOp::Neq => "neq",
        }
    }

    pub fn apply(self, a: f64, b: f64) -> bool {
        match self {
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Eq => a == b,
            CmpOp::Neq => a != b,
        }
    }
}

/// Truth-valued sub-expression: comparisons between scalar expressions,
/// combined with not/and/or/xor. Used by `ifte` nodes and event conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Logical {
    Not(Box<Logical>),
    And(Box<Logical>, Box<Logical>),
    Or(Box<Logical>, Box<Logical>),
    Xor(Box<Logical>, Box<Logical>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
}

impl Logical {
    pub fn eval(&self, registry: &Registry) -> bool {
        match self {
            Logical::Not(a) => !a.eval(registry),
            Logical::And(a, b) => a.eval(registry) && b.eval(registry),
            Logical::Or(a, b) => a.eval(registry) || b.eval(registry),
            Logical::Xor(a, b) => a.eval(registry) != b.eval(registry),
            Logical::Cmp(op, a, b) => op.apply(a.eval(registry), b.eval(registry)),
        }
    }

    /// Rebuilds the tree with every scalar subtree structurally equal to
    /// `target` replaced by `replacement`.
    pub fn replace(&self, target: &Expr, replacement: &Expr) -> Logical {
        match self {
            Logical::Not(a) => Logical::Not(Box::new(a.replace(target, replacement))),
            Logical::And(a, b) => Logical::And(
                Box::new(a.replace(target, replacement)),
                Box::new(b.replace(target, replacement)),
            ),
            Logical::Or(a, b) => Logical::Or(
                Box::new(a.replace(target, replacement)),
                Box::new(b.replace(target, replacement)),
            ),
            Logical::Xor(a, b) => Logical::Xor(
                Box::new(a.replace(target, replacement)),
                Box::new(b.replace(target, replacement)),
            ),
            Logical::Cmp(op, a, b) => Logical::Cmp(
                *op,
                Box::new(a.replace(target, replacement)),
                Box::new(b.replace(target, replacement)),
            ),
        }
    }

    pub fn contains(&self, needle: &Expr) -> bool {
        match self {
            Logical::Not(a) => a.contains(needle),
            Logical::And(a, b) | Logical::Or(a, b) | Logical::Xor(a, b) => {
                a.contains(needle) || b.contains(needle)
            }
            Logical::Cmp(_, a, b) => a.contains(needle) || b.contains(needle),
        }
    }

    /// One simplification pass over the scalar operands. The logical
    /// connectives themselves are left alone.
    pub fn optimize(&self, registry: &Registry) -> Logical {
        match self {
            Logical::Not(a) => Logical::Not(Box::new(a.optimize(registry))),
            Logical::And(a, b) => Logical::And(
                Box::new(a.optimize(registry)),
                Box::new(b.optimize(registry)),
            ),
            Logical::Or(a, b) => Logical::Or(
                Box::new(a.optimize(registry)),
                Box::new(b.optimize(registry)),
            ),
            Logical::Xor(a, b) => Logical::Xor(
                Box::new(a.optimize(registry)),
                Box::new(b.optimize(registry)),
            ),
            Logical::Cmp(op, a, b) => Logical::Cmp(
                *op,
                Box::new(a.optimize(registry)),
                Box::new(b.optimize(registry)),
            ),
        }
    }

    pub fn render_infix(&self, registry: &Registry) -> String {
        match self {
            Logical::Not(a) => format!("not({})", a.render_infix(registry)),
            Logical::And(a, b) => format!(
                "and({},{})",
                a.render_infix(registry),
                b.render_infix(registry)
            ),
            Logical::Or(a, b) => format!(
                "or({},{})",
                a.render_infix(registry),
                b.render_infix(registry)
            ),
            Logical::Xor(a, b) => format!(
                "xor({},{})",
                a.render_infix(registry),
                b.render_infix(registry)
            ),
            Logical::Cmp(op, a, b) => format!(
                "{}({},{})",
                op.token(),
                a.render_infix(registry),
                b.render_infix(registry)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;

    #[test]
    fn comparisons_and_connectives_evaluate() {
        let registry = Registry::new();
        let lt = Logical::Cmp(
            CmpOp::Lt,
            Box::new(Expr::Constant(1.0)),
            Box::new(Expr::Constant(2.0)),
        );
        let ge = Logical::Cmp(
            CmpOp::Ge,
            Box::new(Expr::Constant(1.0)),
            Box::new(Expr::Constant(2.0)),
        );
        assert!(lt.eval(&registry));
        assert!(!ge.eval(&registry));

        let both = Logical::And(Box::new(lt.clone()), Box::new(ge.clone()));
        let either = Logical::Or(Box::new(lt.clone()), Box::new(ge.clone()));
        let differ = Logical::Xor(Box::new(lt.clone()), Box::new(ge));
        assert!(!both.eval(&registry));
        assert!(either.eval(&registry));
        assert!(differ.eval(&registry));
        assert!(!Logical::Not(Box::new(lt)).eval(&registry));
    }

    #[test]
    fn replace_descends_into_comparison_operands() {
        let mut registry = Registry::new();
        let x = registry.intern_variable("x", 5.0);
        let guard = Logical::Cmp(
            CmpOp::Gt,
            Box::new(Expr::Leaf(x)),
            Box::new(Expr::Constant(0.0)),
        );
        let swapped = guard.replace(&Expr::Leaf(x), &Expr::Constant(-1.0));
        assert!(!swapped.eval(&registry));
        assert!(guard.eval(&registry));
    }
}
