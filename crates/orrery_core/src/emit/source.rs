//! Executable-source emitter: renders a compiled model as a self-contained
//! Rust evaluator. Every sub-expression is emitted fully parenthesized from
//! a fixed per-operator template, so the output never depends on operator
//! precedence. Identical models emit byte-identical text.

use crate::compiler::{CompiledModel, TimeDomain};
use crate::emit::rust_literal;
use crate::expr::{BinaryOp, Expr, TernaryOp, UnaryOp};
use crate::logic::{CmpOp, Logical};
use crate::registry::AuxBody;
use anyhow::Context;
use std::fmt::Write as _;
use std::path::Path;

/// Renders the model as Rust source defining `pub struct <type_name>`.
pub fn emit_source(model: &CompiledModel, type_name: &str) -> String {
    let mut out = String::new();
    let dim = model.dimension();
    let state_names = model.state_names();
    let parameter_names = model.parameter_names();
    let has_parameters = !parameter_names.is_empty();
    let has_aux = model.registry.auxiliary_count() > 0;
    let autonomous = model.class.autonomous;
    let time = model.time_name().unwrap_or("t").to_string();
    let noise = uses_noise(model);
    let signum = uses_sign(model);

    out.push_str("// Machine-generated model evaluator. Do not edit.\n");
    out.push_str("#![allow(non_snake_case, dead_code, unused_variables)]\n\n");

    // Struct definition: state, parameters, auxiliaries, noise state.
    let _ = writeln!(out, "pub struct {type_name} {{");
    for name in &state_names {
        let _ = writeln!(out, "    {name}: f64,");
    }
    for name in &parameter_names {
        let _ = writeln!(out, "    {name}: f64,");
    }
    for aux in model.registry.auxiliaries() {
        let ty = match aux.body {
            AuxBody::Scalar(_) => "f64",
            AuxBody::Truth(_) => "bool",
        };
        let _ = writeln!(out, "    {}: {ty},", aux.name);
    }
    if noise {
        out.push_str("    rng_state: u64,\n");
    }
    out.push_str("}\n\n");

    let _ = writeln!(out, "impl {type_name} {{");

    // Constructor with declared initial values.
    out.push_str("    pub fn new() -> Self {\n");
    out.push_str("        Self {\n");
    for (i, name) in state_names.iter().enumerate() {
        let value = model
            .initial_state
            .as_ref()
            .and_then(|values| values.get(i).copied())
            .unwrap_or(0.0);
        let _ = writeln!(out, "            {name}: {},", rust_literal(value));
    }
    for (i, name) in parameter_names.iter().enumerate() {
        let value = model
            .initial_parameters
            .as_ref()
            .and_then(|values| values.get(i).copied())
            .unwrap_or(0.0);
        let _ = writeln!(out, "            {name}: {},", rust_literal(value));
    }
    for aux in model.registry.auxiliaries() {
        let init = match aux.body {
            AuxBody::Scalar(_) => "0.0",
            AuxBody::Truth(_) => "false",
        };
        let _ = writeln!(out, "            {}: {init},", aux.name);
    }
    if noise {
        out.push_str("            rng_state: 1,\n");
    }
    out.push_str("        }\n");
    out.push_str("    }\n\n");

    // State accessors.
    let _ = writeln!(out, "    pub fn dimension(&self) -> usize {{");
    let _ = writeln!(out, "        {dim}");
    out.push_str("    }\n\n");

    out.push_str("    pub fn state(&self) -> Vec<f64> {\n");
    let list = state_names
        .iter()
        .map(|name| format!("self.{name}"))
        .collect::<Vec<_>>()
        .join(", ");
    let _ = writeln!(out, "        vec![{list}]");
    out.push_str("    }\n\n");

    out.push_str("    pub fn set_state(&mut self, state: &[f64]) {\n");
    for (i, name) in state_names.iter().enumerate() {
        let _ = writeln!(out, "        self.{name} = state[{i}];");
    }
    out.push_str("    }\n\n");

    out.push_str("    pub fn name_of_state(&self, index: usize) -> &'static str {\n");
    out.push_str("        match index {\n");
    for (i, name) in state_names.iter().enumerate() {
        let _ = writeln!(out, "            {i} => \"{name}\",");
    }
    out.push_str("            _ => \"\",\n");
    out.push_str("        }\n");
    out.push_str("    }\n\n");

    out.push_str("    pub fn index_of(&self, name: &str) -> Option<usize> {\n");
    out.push_str("        match name {\n");
    for (i, name) in state_names.iter().enumerate() {
        let _ = writeln!(out, "            \"{name}\" => Some({i}),");
    }
    out.push_str("            _ => None,\n");
    out.push_str("        }\n");
    out.push_str("    }\n\n");

    if has_parameters {
        let _ = writeln!(out, "    pub fn parameter_dimension(&self) -> usize {{");
        let _ = writeln!(out, "        {}", parameter_names.len());
        out.push_str("    }\n\n");

        out.push_str("    pub fn set_parameter(&mut self, index: usize, value: f64) {\n");
        out.push_str("        match index {\n");
        for (i, name) in parameter_names.iter().enumerate() {
            let _ = writeln!(out, "            {i} => self.{name} = value,");
        }
        out.push_str("            _ => {}\n");
        out.push_str("        }\n");
        out.push_str("    }\n\n");

        out.push_str("    pub fn parameter(&self, index: usize) -> f64 {\n");
        out.push_str("        match index {\n");
        for (i, name) in parameter_names.iter().enumerate() {
            let _ = writeln!(out, "            {i} => self.{name},");
        }
        out.push_str("            _ => 0.0,\n");
        out.push_str("        }\n");
        out.push_str("    }\n\n");

        out.push_str("    pub fn name_of_parameter(&self, index: usize) -> &'static str {\n");
        out.push_str("        match index {\n");
        for (i, name) in parameter_names.iter().enumerate() {
            let _ = writeln!(out, "            {i} => \"{name}\",");
        }
        out.push_str("            _ => \"\",\n");
        out.push_str("        }\n");
        out.push_str("    }\n\n");

        out.push_str("    pub fn set_named_parameter(&mut self, name: &str, value: f64) {\n");
        for name in &parameter_names {
            let _ = writeln!(
                out,
                "        if name == \"{name}\" {{\n            self.{name} = value;\n        }}"
            );
        }
        out.push_str("    }\n\n");

        out.push_str("    pub fn named_parameter(&self, name: &str) -> f64 {\n");
        for name in &parameter_names {
            let _ = writeln!(
                out,
                "        if name == \"{name}\" {{\n            return self.{name};\n        }}"
            );
        }
        out.push_str("        0.0\n");
        out.push_str("    }\n\n");
    }

    if has_aux {
        let _ = writeln!(out, "    pub fn auxiliary_dimension(&self) -> usize {{");
        let _ = writeln!(out, "        {}", model.registry.auxiliary_count());
        out.push_str("    }\n\n");

        out.push_str("    pub fn named_auxiliary(&self, name: &str) -> f64 {\n");
        for aux in model.registry.auxiliaries() {
            let value = match aux.body {
                AuxBody::Scalar(_) => format!("self.{}", aux.name),
                AuxBody::Truth(_) => format!(
                    "if self.{} {{\n                1.0\n            }} else {{\n                0.0\n            }}",
                    aux.name
                ),
            };
            let _ = writeln!(
                out,
                "        if name == \"{}\" {{\n            return {value};\n        }}",
                aux.name
            );
        }
        out.push_str("        0.0\n");
        out.push_str("    }\n\n");

        let _ = writeln!(
            out,
            "    pub fn compute_auxiliaries(&mut self, input: &[f64], {}: f64) {{",
            if autonomous {
                format!("_{time}")
            } else {
                time.clone()
            }
        );
        for (i, name) in state_names.iter().enumerate() {
            let _ = writeln!(out, "        self.{name} = input[{i}];");
        }
        for aux in model.registry.auxiliaries() {
            let rhs = match &aux.body {
                AuxBody::Scalar(e) => render_expr(model, e),
                AuxBody::Truth(l) => render_logical(model, l),
            };
            let _ = writeln!(out, "        self.{} = {rhs};", aux.name);
        }
        out.push_str("    }\n\n");
    }

    if model.class.periodically_forced {
        if let Some(aux) = model
            .registry
            .auxiliaries()
            .iter()
            .find(|aux| aux.name == "period")
        {
            if let AuxBody::Scalar(e) = &aux.body {
                out.push_str("    pub fn period(&self) -> f64 {\n");
                let _ = writeln!(out, "        {}", render_expr(model, e));
                out.push_str("    }\n\n");
            }
        }
    }

    // The right-hand side of the dynamic equations.
    emit_vector_method(&mut out, model, "eval", &model.equations, autonomous, &time, has_aux);

    if model.class.invertible && !model.inverse_equations.is_empty() {
        emit_vector_method(
            &mut out,
            model,
            "eval_inverse",
            &model.inverse_equations,
            autonomous,
            &time,
            has_aux,
        );
    }

    if let Some(jacobian) = &model.jacobian {
        emit_matrix_method(&mut out, model, "jacobi_matrix", jacobian, autonomous, &time, has_aux);
    }
    if let Some(jacobian) = &model.parameter_jacobian {
        emit_matrix_method(
            &mut out,
            model,
            "parameter_jacobi_matrix",
            jacobian,
            autonomous,
            &time,
            has_aux,
        );
    }
    if let Some(diffusion) = &model.diffusion {
        let _ = writeln!(out, "    pub fn process_dimension(&self) -> usize {{");
        let _ = writeln!(out, "        {}", model.process_names.len());
        out.push_str("    }\n\n");
        emit_matrix_method(
            &mut out,
            model,
            "diffusion_matrix",
            diffusion,
            autonomous,
            &time,
            has_aux,
        );
    }

    if model.class.poincare_section {
        if model
            .registry
            .auxiliaries()
            .iter()
            .any(|aux| aux.name == "cutValue")
        {
            let _ = writeln!(
                out,
                "    pub fn cut_value(&mut self, input: &[f64], {time}: f64) -> f64 {{"
            );
            let _ = writeln!(out, "        self.compute_auxiliaries(input, {time});");
            out.push_str("        self.cutValue\n");
            out.push_str("    }\n\n");
        }
    }

    if let Some(values) = &model.initial_state {
        emit_vec_accessor(&mut out, "initial_state", values);
    }
    if let Some(values) = &model.initial_parameters {
        emit_vec_accessor(&mut out, "initial_parameters", values);
    }
    if let Some(ranges) = &model.state_ranges {
        let minimums: Vec<f64> = ranges.iter().map(|(lo, _)| *lo).collect();
        let maximums: Vec<f64> = ranges.iter().map(|(_, hi)| *hi).collect();
        emit_vec_accessor(&mut out, "state_minimum", &minimums);
        emit_vec_accessor(&mut out, "state_maximum", &maximums);
    }
    if let Some(ranges) = &model.parameter_ranges {
        let minimums: Vec<f64> = ranges.iter().map(|(lo, _)| *lo).collect();
        let maximums: Vec<f64> = ranges.iter().map(|(_, hi)| *hi).collect();
        emit_vec_accessor(&mut out, "parameter_minimum", &minimums);
        emit_vec_accessor(&mut out, "parameter_maximum", &maximums);
    }

    if model.class.expandable && model.class.time == TimeDomain::Continuous {
        if let Ok(plan) = crate::emit::taylor::emit_taylor(model) {
            out.push_str("    pub fn taylor_map(&self) -> &'static str {\n");
            let _ = writeln!(out, "        \"{}\"", plan.escape_default());
            out.push_str("    }\n\n");
        }
    }

    out.push_str("    pub fn description(&self) -> &'static str {\n");
    let description = model
        .description
        .as_deref()
        .unwrap_or("Compiled dynamical-system model.");
    let _ = writeln!(out, "        \"{}\"", description.escape_default());
    out.push_str("    }\n");

    if signum {
        out.push_str("\n    fn sign(value: f64) -> f64 {\n");
        out.push_str("        if value > 0.0 {\n");
        out.push_str("            1.0\n");
        out.push_str("        } else if value < 0.0 {\n");
        out.push_str("            -1.0\n");
        out.push_str("        } else {\n");
        out.push_str("            value\n");
        out.push_str("        }\n");
        out.push_str("    }\n");
    }

    if noise {
        out.push_str("\n    fn next_uniform(&mut self) -> f64 {\n");
        out.push_str("        self.rng_state = self\n");
        out.push_str("            .rng_state\n");
        out.push_str("            .wrapping_mul(6364136223846793005)\n");
        out.push_str("            .wrapping_add(1442695040888963407);\n");
        out.push_str("        (self.rng_state >> 11) as f64 / (1u64 << 53) as f64\n");
        out.push_str("    }\n\n");
        out.push_str("    fn uniform(&mut self, lo: f64, hi: f64) -> f64 {\n");
        out.push_str("        lo + (hi - lo) * self.next_uniform()\n");
        out.push_str("    }\n\n");
        out.push_str("    fn gaussian(&mut self, mean: f64, sigma: f64) -> f64 {\n");
        out.push_str("        let u1 = self.next_uniform().max(f64::MIN_POSITIVE);\n");
        out.push_str("        let u2 = self.next_uniform();\n");
        out.push_str(
            "        mean + sigma * (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()\n",
        );
        out.push_str("    }\n");
    }

    out.push_str("}\n\n");

    let _ = writeln!(out, "impl Default for {type_name} {{");
    out.push_str("    fn default() -> Self {\n");
    out.push_str("        Self::new()\n");
    out.push_str("    }\n");
    out.push_str("}\n");

    out
}

/// Writes the emitted source to `path`, deriving the type name from the
/// file stem.
pub fn write_source(model: &CompiledModel, path: impl AsRef<Path>) -> anyhow::Result<()> {
    let path = path.as_ref();
    let type_name = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .with_context(|| format!("Cannot derive a type name from {}", path.display()))?
        .to_string();
    let source = emit_source(model, &type_name);
    std::fs::write(path, source)
        .with_context(|| format!("Failed to write generated source {}", path.display()))?;
    Ok(())
}

fn emit_vector_method(
    out: &mut String,
    model: &CompiledModel,
    name: &str,
    expressions: &[Expr],
    autonomous: bool,
    time: &str,
    has_aux: bool,
) {
    let _ = writeln!(
        out,
        "    pub fn {name}(&mut self, input: &[f64]{}) -> Vec<f64> {{",
        if autonomous {
            String::new()
        } else {
            format!(", {time}: f64")
        }
    );
    emit_state_prologue(out, model, autonomous, time, has_aux);
    let _ = writeln!(out, "        let mut output = vec![0.0; {}];", expressions.len());
    for (i, expression) in expressions.iter().enumerate() {
        let _ = writeln!(out, "        output[{i}] = {};", render_expr(model, expression));
    }
    out.push_str("        output\n");
    out.push_str("    }\n\n");
}

fn emit_matrix_method(
    out: &mut String,
    model: &CompiledModel,
    name: &str,
    matrix: &[Vec<Expr>],
    autonomous: bool,
    time: &str,
    has_aux: bool,
) {
    let columns = matrix.first().map(Vec::len).unwrap_or(0);
    let _ = writeln!(
        out,
        "    pub fn {name}(&mut self, input: &[f64]{}) -> Vec<Vec<f64>> {{",
        if autonomous {
            String::new()
        } else {
            format!(", {time}: f64")
        }
    );
    emit_state_prologue(out, model, autonomous, time, has_aux);
    let _ = writeln!(
        out,
        "        let mut matrix = vec![vec![0.0; {columns}]; {}];",
        matrix.len()
    );
    for (i, row) in matrix.iter().enumerate() {
        for (j, entry) in row.iter().enumerate() {
            let _ = writeln!(out, "        matrix[{i}][{j}] = {};", render_expr(model, entry));
        }
    }
    out.push_str("        matrix\n");
    out.push_str("    }\n\n");
}

fn emit_state_prologue(
    out: &mut String,
    model: &CompiledModel,
    autonomous: bool,
    time: &str,
    has_aux: bool,
) {
    if has_aux {
        let argument = if autonomous { "0.0" } else { time };
        let _ = writeln!(out, "        self.compute_auxiliaries(input, {argument});");
    } else {
        for (i, name) in model.state_names().iter().enumerate() {
            let _ = writeln!(out, "        self.{name} = input[{i}];");
        }
    }
}

fn emit_vec_accessor(out: &mut String, name: &str, values: &[f64]) {
    let list = values
        .iter()
        .map(|v| rust_literal(*v))
        .collect::<Vec<_>>()
        .join(", ");
    let _ = writeln!(out, "    pub fn {name}(&self) -> Vec<f64> {{");
    let _ = writeln!(out, "        vec![{list}]");
    out.push_str("    }\n\n");
}

fn render_expr(model: &CompiledModel, e: &Expr) -> String {
    match e {
        Expr::Constant(v) => rust_literal(*v),
        Expr::Leaf(id) => {
            if model.time_slot == Some(*id) {
                model.registry.name(*id).to_string()
            } else {
                format!("self.{}", model.registry.name(*id))
            }
        }
        Expr::Aux(id) => format!("self.{}", model.registry.auxiliary(*id).name),
        Expr::Unary(op, a) => {
            let a = render_expr(model, a);
            match op {
                UnaryOp::Neg => format!("(-{a})"),
                UnaryOp::Sin => format!("f64::sin({a})"),
                UnaryOp::Cos => format!("f64::cos({a})"),
                UnaryOp::Tan => format!("f64::tan({a})"),
                UnaryOp::Asin => format!("f64::asin({a})"),
                UnaryOp::Acos => format!("f64::acos({a})"),
                UnaryOp::Atan => format!("f64::atan({a})"),
                UnaryOp::Log => format!("f64::ln({a})"),
                UnaryOp::Exp => format!("f64::exp({a})"),
                UnaryOp::Sqrt => format!("f64::sqrt({a})"),
                UnaryOp::Abs => format!("f64::abs({a})"),
                UnaryOp::Sign => format!("Self::sign({a})"),
            }
        }
        Expr::Binary(op, a, b) => {
            let a = render_expr(model, a);
            let b = render_expr(model, b);
            match op {
                BinaryOp::Add => format!("({a} + {b})"),
                BinaryOp::Sub => format!("({a} - {b})"),
                BinaryOp::Mul => format!("({a} * {b})"),
                BinaryOp::Div => format!("({a} / {b})"),
                BinaryOp::Pow => format!("f64::powf({a}, {b})"),
                BinaryOp::Atan2 => format!("f64::atan2({a}, {b})"),
                BinaryOp::Max => format!("f64::max({a}, {b})"),
                BinaryOp::Min => format!("f64::min({a}, {b})"),
                BinaryOp::Rand => format!("self.uniform({a}, {b})"),
                BinaryOp::Gauss => format!("self.gaussian({a}, {b})"),
            }
        }
        Expr::Ternary(op, a, b, c) => {
            let a = render_expr(model, a);
            let b = render_expr(model, b);
            let c = render_expr(model, c);
            match op {
                TernaryOp::Mod => format!("({b} + ({a} - {b}).rem_euclid({c} - {b}))"),
                TernaryOp::Step => format!("(if {a} >= {b} {{ {c} }} else {{ 0.0 }})"),
            }
        }
        Expr::Clip(x, lo, hi, y) => {
            let x = render_expr(model, x);
            let lo = render_expr(model, lo);
            let hi = render_expr(model, hi);
            let y = render_expr(model, y);
            format!("(if {x} >= {lo} && {x} <= {hi} {{ {y} }} else {{ 0.0 }})")
        }
        Expr::IfThenElse(cond, a, b) => format!(
            "(if {} {{ {} }} else {{ {} }})",
            render_logical(model, cond),
            render_expr(model, a),
            render_expr(model, b)
        ),
    }
}

fn render_logical(model: &CompiledModel, l: &Logical) -> String {
    match l {
        Logical::Not(a) => format!("(!{})", render_logical(model, a)),
        Logical::And(a, b) => format!(
            "({} && {})",
            render_logical(model, a),
            render_logical(model, b)
        ),
        Logical::Or(a, b) => format!(
            "({} || {})",
            render_logical(model, a),
            render_logical(model, b)
        ),
        Logical::Xor(a, b) => format!(
            "({} != {})",
            render_logical(model, a),
            render_logical(model, b)
        ),
        Logical::Cmp(op, a, b) => {
            let symbol = match op {
                CmpOp::Gt => ">",
                CmpOp::Ge => ">=",
                CmpOp::Lt => "<",
                CmpOp::Le => "<=",
                CmpOp::Eq => "==",
                CmpOp::Neq => "!=",
            };
            format!(
                "({} {symbol} {})",
                render_expr(model, a),
                render_expr(model, b)
            )
        }
    }
}

fn expr_mentions(e: &Expr, pred: &dyn Fn(&Expr) -> bool) -> bool {
    if pred(e) {
        return true;
    }
    match e {
        Expr::Constant(_) | Expr::Leaf(_) | Expr::Aux(_) => false,
        Expr::Unary(_, a) => expr_mentions(a, pred),
        Expr::Binary(_, a, b) => expr_mentions(a, pred) || expr_mentions(b, pred),
        Expr::Ternary(_, a, b, c) => {
            expr_mentions(a, pred) || expr_mentions(b, pred) || expr_mentions(c, pred)
        }
        Expr::Clip(x, lo, hi, y) => {
            expr_mentions(x, pred)
                || expr_mentions(lo, pred)
                || expr_mentions(hi, pred)
                || expr_mentions(y, pred)
        }
        Expr::IfThenElse(cond, a, b) => {
            logical_mentions(cond, pred) || expr_mentions(a, pred) || expr_mentions(b, pred)
        }
    }
}

fn logical_mentions(l: &Logical, pred: &dyn Fn(&Expr) -> bool) -> bool {
    match l {
        Logical::Not(a) => logical_mentions(a, pred),
        Logical::And(a, b) | Logical::Or(a, b) | Logical::Xor(a, b) => {
            logical_mentions(a, pred) || logical_mentions(b, pred)
        }
        Logical::Cmp(_, a, b) => expr_mentions(a, pred) || expr_mentions(b, pred),
    }
}

fn any_tree_mentions(model: &CompiledModel, pred: &dyn Fn(&Expr) -> bool) -> bool {
    let matrices = [
        model.jacobian.as_ref(),
        model.parameter_jacobian.as_ref(),
        model.diffusion.as_ref(),
    ];
    model.equations.iter().any(|e| expr_mentions(e, pred))
        || model
            .inverse_equations
            .iter()
            .any(|e| expr_mentions(e, pred))
        || model.registry.auxiliaries().iter().any(|aux| match &aux.body {
            AuxBody::Scalar(e) => expr_mentions(e, pred),
            AuxBody::Truth(l) => logical_mentions(l, pred),
        })
        || matrices.into_iter().flatten().any(|matrix| {
            matrix
                .iter()
                .any(|row| row.iter().any(|e| expr_mentions(e, pred)))
        })
}

fn uses_noise(model: &CompiledModel) -> bool {
    any_tree_mentions(model, &|e| {
        matches!(e, Expr::Binary(BinaryOp::Rand | BinaryOp::Gauss, _, _))
    })
}

fn uses_sign(model: &CompiledModel) -> bool {
    any_tree_mentions(model, &|e| matches!(e, Expr::Unary(UnaryOp::Sign, _)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;

    #[test]
    fn emission_is_deterministic() {
        let model = compile(
            "type ode, stateinitializer;
             variable x, y;
             parameter a;
             x' = a*x - y;
             y' = x;
             x = 1;
             y = 0;",
        )
        .expect("model should compile");

        let first = emit_source(&model, "Spiral");
        let second = emit_source(&model, "Spiral");
        assert_eq!(first, second);
    }

    #[test]
    fn emitted_source_has_the_expected_surface() {
        let model = compile(
            "type ode, stateinitializer;
             variable x;
             parameter a;
             x' = a*x;
             x = 1;",
        )
        .expect("model should compile");
        let source = emit_source(&model, "Growth");

        assert!(source.contains("pub struct Growth {"));
        assert!(source.contains("pub fn dimension(&self) -> usize"));
        assert!(source.contains("pub fn eval(&mut self, input: &[f64]) -> Vec<f64>"));
        assert!(source.contains("output[0] = (self.a * self.x);"));
        assert!(source.contains("pub fn jacobi_matrix"));
        assert!(source.contains("pub fn parameter_jacobi_matrix"));
        assert!(source.contains("x: 1.0,"));
        assert!(source.contains("pub fn taylor_map"));
        // Autonomous model: eval takes no time argument.
        assert!(!source.contains("pub fn eval(&mut self, input: &[f64], t: f64)"));
    }

    #[test]
    fn nonautonomous_models_take_a_time_argument() {
        let model = compile(
            "type ode;
             variable x;
             x' = sin(t)*x;",
        )
        .expect("model should compile");
        let source = emit_source(&model, "Forced");
        assert!(source.contains("pub fn eval(&mut self, input: &[f64], t: f64) -> Vec<f64>"));
        assert!(source.contains("f64::sin(t)"));
    }

    #[test]
    fn stochastic_models_emit_diffusion_and_noise_free_drift() {
        let model = compile(
            "type sde;
             variable x;
             process w;
             parameter s;
             x' = -x + s*w;",
        )
        .expect("model should compile");
        let source = emit_source(&model, "Noisy");
        assert!(source.contains("pub fn diffusion_matrix"));
        assert!(source.contains("matrix[0][0] = self.s;"));
        assert!(source.contains("pub fn process_dimension"));
        // The extracted drift no longer mentions the process.
        assert!(source.contains("output[0] = (-self.x);"));
    }

    #[test]
    fn invertible_models_emit_the_inverse() {
        let model = compile(
            "type map, invertible;
             variable x;
             parameter a;
             x' = a*x;
             x~ = x/a;",
        )
        .expect("model should compile");
        let source = emit_source(&model, "Scale");
        assert!(source.contains("pub fn eval_inverse"));
        assert!(source.contains("(self.x / self.a)"));
    }
}
