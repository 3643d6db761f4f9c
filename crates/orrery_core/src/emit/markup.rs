//! Structured-markup emitter: renders the declarations and equations of a
//! compiled model as nested tagged elements, preserving declaration order.
//! The output is for interchange and inspection only.

use crate::compiler::CompiledModel;
use crate::expr::{fmt_f64, unary_token, BinaryOp, Expr, TernaryOp};
use crate::logic::Logical;
use crate::registry::{AuxBody, SlotKind};
use std::fmt::Write as _;

/// Renders the whole model as one `<model>` element.
pub fn emit_markup(model: &CompiledModel) -> String {
    let mut out = String::new();
    out.push_str("<model>\n");

    out.push_str(" <variables>\n");
    for id in &model.variables {
        out.push_str("  <variable>\n");
        let _ = writeln!(out, "   {}", model.registry.name(*id));
        out.push_str("  </variable>\n");
    }
    out.push_str(" </variables>\n");

    if !model.process_names.is_empty() {
        out.push_str(" <processes>\n");
        for name in &model.process_names {
            out.push_str("  <process>\n");
            out.push_str("   <name>\n");
            let _ = writeln!(out, "    {name}");
            out.push_str("   </name>\n");
            out.push_str("  </process>\n");
        }
        out.push_str(" </processes>\n");
    }

    if !model.parameters.is_empty() {
        out.push_str(" <parameters>\n");
        for id in &model.parameters {
            out.push_str("  <parameter>\n");
            let _ = writeln!(out, "   {}", model.registry.name(*id));
            out.push_str("  </parameter>\n");
        }
        out.push_str(" </parameters>\n");
    }

    if model.registry.auxiliary_count() > 0 {
        out.push_str(" <auxiliaries>\n");
        for aux in model.registry.auxiliaries() {
            out.push_str("  <auxiliary>\n");
            out.push_str("   <name>\n");
            let _ = writeln!(out, "    {}", aux.name);
            out.push_str("   </name>\n");
            let body = match &aux.body {
                AuxBody::Scalar(e) => render_expr(model, e),
                AuxBody::Truth(l) => render_logical(model, l),
            };
            let _ = writeln!(out, "    {body}");
            out.push_str("  </auxiliary>\n");
        }
        out.push_str(" </auxiliaries>\n");
    }

    out.push_str(" <equations>\n");
    for (i, equation) in model.equations.iter().enumerate() {
        out.push_str("  <lhs>\n");
        let _ = writeln!(out, "   {}", model.registry.name(model.variables[i]));
        out.push_str("  </lhs>\n");
        out.push_str("  <rhs>\n");
        out.push_str("   <expression>\n");
        let _ = writeln!(out, "    {}", render_expr(model, equation));
        out.push_str("   </expression>\n");
        out.push_str("  </rhs>\n");
    }
    out.push_str(" </equations>\n");

    if let Some(diffusion) = &model.diffusion {
        out.push_str(" <diffusionmatrix>\n");
        for row in diffusion {
            out.push_str("  <row>\n");
            for entry in row {
                out.push_str("   <element>\n");
                out.push_str("    <expression>\n");
                let _ = writeln!(out, "     {}", render_expr(model, entry));
                out.push_str("    </expression>\n");
                out.push_str("   </element>\n");
            }
            out.push_str("  </row>\n");
        }
        out.push_str(" </diffusionmatrix>\n");
    }

    out.push_str("</model>");
    out
}

fn tagged(tag: &str, inner: &[String]) -> String {
    format!("<{tag}> {} </{tag}>", inner.join(" "))
}

fn render_expr(model: &CompiledModel, e: &Expr) -> String {
    match e {
        Expr::Constant(v) => tagged("constant", &[fmt_f64(*v)]),
        Expr::Leaf(id) => {
            let name = model.registry.name(*id).to_string();
            let tag = match model.registry.kind(*id) {
                SlotKind::Variable => "variable",
                SlotKind::Parameter => "parameter",
            };
            tagged(tag, &[name])
        }
        Expr::Aux(id) => tagged("auxiliary", &[model.registry.auxiliary(*id).name.clone()]),
        Expr::Unary(op, a) => tagged(unary_token(*op), &[render_expr(model, a)]),
        Expr::Binary(op, a, b) => {
            let tag = match op {
                BinaryOp::Add => "addition",
                BinaryOp::Sub => "subtraction",
                BinaryOp::Mul => "multiplication",
                BinaryOp::Div => "division",
                BinaryOp::Pow => "pow",
                BinaryOp::Atan2 => "atan2",
                BinaryOp::Max => "max",
                BinaryOp::Min => "min",
                BinaryOp::Rand => "rand",
                BinaryOp::Gauss => "gauss",
            };
            tagged(tag, &[render_expr(model, a), render_expr(model, b)])
        }
        Expr::Ternary(op, a, b, c) => {
            let tag = match op {
                TernaryOp::Mod => "mod",
                TernaryOp::Step => "step",
            };
            tagged(
                tag,
                &[
                    render_expr(model, a),
                    render_expr(model, b),
                    render_expr(model, c),
                ],
            )
        }
        Expr::Clip(x, lo, hi, y) => tagged(
            "clip",
            &[
                render_expr(model, x),
                render_expr(model, lo),
                render_expr(model, hi),
                render_expr(model, y),
            ],
        ),
        Expr::IfThenElse(cond, a, b) => tagged(
            "ifte",
            &[
                render_logical(model, cond),
                render_expr(model, a),
                render_expr(model, b),
            ],
        ),
    }
}

fn render_logical(model: &CompiledModel, l: &Logical) -> String {
    match l {
        Logical::Not(a) => tagged("not", &[render_logical(model, a)]),
        Logical::And(a, b) => tagged(
            "and",
            &[render_logical(model, a), render_logical(model, b)],
        ),
        Logical::Or(a, b) => tagged("or", &[render_logical(model, a), render_logical(model, b)]),
        Logical::Xor(a, b) => tagged(
            "xor",
            &[render_logical(model, a), render_logical(model, b)],
        ),
        Logical::Cmp(op, a, b) => tagged(
            op.token(),
            &[render_expr(model, a), render_expr(model, b)],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;

    #[test]
    fn markup_preserves_declaration_order() {
        let model = compile(
            "type ode;
             variable x, y;
             parameter a, b;
             x' = a*x;
             y' = b*y;",
        )
        .expect("model should compile");
        let markup = emit_markup(&model);

        let x = markup.find("   x\n").expect("x is listed");
        let y = markup.find("   y\n").expect("y is listed");
        assert!(x < y);
        let a = markup.find("   a\n").expect("a is listed");
        let b = markup.find("   b\n").expect("b is listed");
        assert!(a < b);

        assert!(markup.starts_with("<model>\n"));
        assert!(markup.ends_with("</model>"));
        assert!(markup.contains(
            "<multiplication> <parameter> a </parameter> <variable> x </variable> </multiplication>"
        ));
    }

    #[test]
    fn emission_is_deterministic() {
        let source = "type sde;
             variable x;
             process w;
             auxiliary u;
             u = x*x;
             x' = -u + 0.1*w;";
        let model = compile(source).expect("model should compile");
        let first = emit_markup(&model);
        let second = emit_markup(&model);
        assert_eq!(first, second);
        assert!(first.contains("<diffusionmatrix>"));
        assert!(first.contains("<auxiliaries>"));
    }
}
