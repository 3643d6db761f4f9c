//! Taylor-plan emitter: renders the equation trees in the vocabulary of a
//! Taylor-series propagator. Only meaningful for expandable models; the
//! vocabulary is deliberately small and `pow` requires a constant exponent.

use crate::compiler::CompiledModel;
use crate::error::{CompileError, Result};
use crate::expr::{fmt_f64, BinaryOp, Expr, UnaryOp};
use crate::registry::{AuxBody, SlotId};
use std::fmt::Write as _;

/// Renders one `T<name>' = ...` line per dynamic equation.
pub fn emit_taylor(model: &CompiledModel) -> Result<String> {
    if !model.class.expandable {
        return Err(CompileError::semantic("System is not expandable."));
    }

    let mut out = String::new();
    for (i, equation) in model.equations.iter().enumerate() {
        let name = model.registry.name(model.variables[i]);
        let _ = writeln!(out, "T{name}' = {}", render(model, equation)?);
    }
    Ok(out)
}

fn slot_operand(model: &CompiledModel, id: SlotId) -> Result<String> {
    if model.time_slot == Some(id) {
        return Ok("TaylorTime".to_string());
    }
    if let Some(index) = model.variables.iter().position(|v| *v == id) {
        return Ok(format!("TaylorState({index})"));
    }
    if let Some(index) = model.parameters.iter().position(|p| *p == id) {
        return Ok(format!("TaylorParameter({index})"));
    }
    Err(CompileError::semantic(format!(
        "Leaf {} has no Taylor operand.",
        model.registry.name(id)
    )))
}

fn render(model: &CompiledModel, e: &Expr) -> Result<String> {
    match e {
        Expr::Constant(v) => Ok(format!("TaylorConstant({})", fmt_f64(*v))),
        Expr::Leaf(id) => slot_operand(model, *id),
        Expr::Aux(id) => match &model.registry.auxiliary(*id).body {
            AuxBody::Scalar(body) => render(model, body),
            AuxBody::Truth(_) => Err(CompileError::semantic(
                "Logical auxiliary has no Taylor form.",
            )),
        },
        Expr::Unary(op, a) => {
            let a = render(model, a)?;
            match op {
                UnaryOp::Neg => Ok(format!("TaylorNegate({a})")),
                UnaryOp::Sin => Ok(format!("TaylorSin({a})")),
                UnaryOp::Cos => Ok(format!("TaylorCos({a})")),
                // tan propagates as the quotient of its series.
                UnaryOp::Tan => Ok(format!("TaylorDivide(TaylorSin({a}),TaylorCos({a}))")),
                UnaryOp::Log => Ok(format!("TaylorLog({a})")),
                UnaryOp::Exp => Ok(format!("TaylorExp({a})")),
                UnaryOp::Sqrt => Ok(format!("TaylorSqrt({a})")),
                _ => Err(CompileError::semantic(format!(
                    "Operator {:?} has no Taylor form.",
                    op
                ))),
            }
        }
        Expr::Binary(op, a, b) => {
            if *op == BinaryOp::Pow {
                let Expr::Constant(exponent) = **b else {
                    return Err(CompileError::semantic(
                        "Exponent in a Taylor pow must be constant.",
                    ));
                };
                let a = render(model, a)?;
                return Ok(format!("TaylorPow({a},{})", fmt_f64(exponent)));
            }
            let a = render(model, a)?;
            let b = render(model, b)?;
            match op {
                BinaryOp::Add => Ok(format!("TaylorAdd({a},{b})")),
                BinaryOp::Sub => Ok(format!("TaylorSubtract({a},{b})")),
                BinaryOp::Mul => Ok(format!("TaylorMultiply({a},{b})")),
                BinaryOp::Div => Ok(format!("TaylorDivide({a},{b})")),
                _ => Err(CompileError::semantic(format!(
                    "Operator {:?} has no Taylor form.",
                    op
                ))),
            }
        }
        Expr::Ternary(..) | Expr::Clip(..) | Expr::IfThenElse(..) => Err(CompileError::semantic(
            "Conditional operators have no Taylor form.",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;

    #[test]
    fn expandable_model_renders_the_plan() {
        let model = compile(
            "type ode;
             variable x, y;
             parameter a;
             x' = a*sin(y);
             y' = x^2 - 1;",
        )
        .expect("model should compile");

        let plan = emit_taylor(&model).expect("expandable model has a plan");
        assert_eq!(
            plan,
            "Tx' = TaylorMultiply(TaylorParameter(0),TaylorSin(TaylorState(1)))\n\
             Ty' = TaylorSubtract(TaylorPow(TaylorState(0),2.0),TaylorConstant(1.0))\n"
        );
    }

    #[test]
    fn emission_is_deterministic() {
        let model = compile(
            "type ode;
             variable x;
             x' = exp(x)/x;",
        )
        .expect("model should compile");
        let first = emit_taylor(&model).expect("plan renders");
        let second = emit_taylor(&model).expect("plan renders");
        assert_eq!(first, second);
    }

    #[test]
    fn nonexpandable_model_is_refused() {
        let model = compile(
            "type ode;
             variable x;
             x' = abs(x);",
        )
        .expect("model should compile");
        let err = emit_taylor(&model).expect_err("abs is not expandable");
        assert!(err.message.contains("not expandable"));
    }

    #[test]
    fn time_renders_as_the_independent_operand() {
        let model = compile(
            "type ode;
             variable x;
             x' = t*x;",
        )
        .expect("model should compile");
        let plan = emit_taylor(&model).expect("plan renders");
        assert!(plan.contains("TaylorMultiply(TaylorTime,TaylorState(0))"));
    }
}
