use crate::error::{CompileError, Result};
use crate::expr::{BinaryOp, Expr, TernaryOp, UnaryOp};
use crate::logic::{CmpOp, Logical};
use crate::registry::{AuxBody, AuxId, Registry, SlotId, SlotKind};
use serde::{Deserialize, Serialize};

/// A user-defined function: declared name, formal parameters (interned as
/// registry slots while the body was parsed), and the parsed body.
/// Application clones the body and substitutes arguments for the formal
/// leaves via `replace`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFunction {
    pub name: String,
    pub formals: Vec<(String, SlotId)>,
    pub body: Expr,
}

/// Explicit declaration context for parsing. The parser holds no state of
/// its own; every lookup goes through a scope borrowed from the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub variables: Vec<(String, SlotId)>,
    pub parameters: Vec<(String, SlotId)>,
    pub constants: Vec<(String, f64)>,
    /// Declared auxiliary names in declaration order; definitions live in
    /// the registry and may lag behind while the definition block is being
    /// read.
    pub auxiliary_names: Vec<String>,
    pub function_names: Vec<String>,
    pub functions: Vec<UserFunction>,
    /// The reserved time identifier, when the model is clocked.
    pub time: Option<SlotId>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience scope exposing every slot already interned in the
    /// registry; handy for parsing standalone expressions.
    pub fn from_registry(registry: &Registry) -> Self {
        let mut scope = Scope::new();
        for (index, slot) in registry.slots().iter().enumerate() {
            let entry = (slot.name.clone(), SlotId(index));
            match slot.kind {
                SlotKind::Variable => scope.variables.push(entry),
                SlotKind::Parameter => scope.parameters.push(entry),
            }
        }
        for aux in registry.auxiliaries() {
            scope.auxiliary_names.push(aux.name.clone());
        }
        scope
    }

    fn find_variable(&self, name: &str) -> Option<SlotId> {
        self.variables
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
    }

    fn find_parameter(&self, name: &str) -> Option<SlotId> {
        self.parameters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
    }

    fn find_constant(&self, name: &str) -> Option<f64> {
        self.constants
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    fn is_auxiliary(&self, name: &str) -> bool {
        self.auxiliary_names.iter().any(|n| n == name)
    }

    fn is_user_function(&self, name: &str) -> bool {
        self.function_names.iter().any(|n| n == name)
    }

    fn time_name<'a>(&self, registry: &'a Registry) -> Option<&'a str> {
        self.time.map(|id| registry.name(id))
    }
}

/// Result of parsing: a scalar expression or a truth-valued one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParsedExpr {
    Scalar(Expr),
    Truth(Logical),
}

const FUNCTION_TOKENS: &[&str] = &[
    "sin", "cos", "tan", "asin", "acos", "atan", "atan2", "exp", "log", "pow", "sqrt", "minus",
    "plus", "abs", "step", "clip", "mod", "max", "min", "diff", "rand", "gauss", "sign",
];

const LOGICAL_TOKENS: &[&str] = &["not", "and", "or", "xor", "ifte"];

const COMPARISON_TOKENS: &[&str] = &["gt", "ge", "lt", "le", "eq", "neq"];

fn is_function_token(token: &str) -> bool {
    FUNCTION_TOKENS.contains(&token)
}

fn is_logical_token(token: &str) -> bool {
    LOGICAL_TOKENS.contains(&token)
}

fn is_comparison_token(token: &str) -> bool {
    COMPARISON_TOKENS.contains(&token)
}

fn is_operator_token(token: &str) -> bool {
    matches!(token, "+" | "-" | "*" | "/" | "^" | "minus" | "plus")
}

/// Operator precedence. The `>=` pop rule in [`infix_to_postfix`] makes `^`
/// effectively left-associative, and lets the unary sign operators bind
/// tighter than `^`; both behaviors are kept for compatibility with the
/// model corpus this grammar comes from.
fn precedence(token: &str) -> u8 {
    match token {
        "minus" | "plus" => 14,
        "^" => 13,
        "*" | "/" => 12,
        "+" | "-" => 11,
        _ => 0,
    }
}

fn is_number(token: &str) -> bool {
    token.parse::<f64>().is_ok()
}

/// Splits an expression into tokens: whitespace is discarded entirely, the
/// single-character delimiters `( ) + - * / ^ ,` are tokens of their own,
/// and floating literals split across an exponent suffix (`1.5e` `-` `3`)
/// are glued back together.
pub fn tokenize(text: &str) -> Vec<String> {
    let stripped: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let mut raw: Vec<String> = Vec::new();
    let mut current = String::new();
    for ch in stripped.chars() {
        if "()+-*/^,".contains(ch) {
            if !current.is_empty() {
                raw.push(std::mem::take(&mut current));
            }
            raw.push(ch.to_string());
        } else {
            current.push(ch);
        }
    }
    if !current.is_empty() {
        raw.push(current);
    }

    let mut tokens: Vec<String> = Vec::new();
    let mut i = 0;
    while i < raw.len() {
        let token = &raw[i];
        let splits_exponent = token.len() > 1
            && token.ends_with(['e', 'E'])
            && token.chars().next().is_some_and(|c| c.is_ascii_digit())
            && i + 2 < raw.len()
            && (raw[i + 1] == "+" || raw[i + 1] == "-");
        if splits_exponent {
            let glued = format!("{}{}{}", token, raw[i + 1], raw[i + 2]);
            if is_number(&glued) {
                tokens.push(glued);
                i += 3;
                continue;
            }
        }
        tokens.push(token.clone());
        i += 1;
    }
    tokens
}

/// Shunting-yard conversion from infix tokens to postfix order.
///
/// An explicit flag tracks whether the next `-`/`+` is a sign: true at the
/// start of an expression, after `(`, and after a binary operator or comma.
/// Sign operators are pushed as the pseudo-operators `minus`/`plus`.
pub fn infix_to_postfix(tokens: &[String], scope: &Scope, registry: &Registry) -> Result<Vec<String>> {
    let mut output: Vec<String> = Vec::new();
    let mut stack: Vec<String> = vec!["(".to_string()];
    let mut next_sign_is_unary = true;

    let mut input: Vec<String> = tokens.to_vec();
    input.push(")".to_string());

    let time_name = scope.time_name(registry);

    let is_name = |token: &str| {
        scope.find_constant(token).is_some()
            || scope.find_variable(token).is_some()
            || scope.find_parameter(token).is_some()
            || scope.is_auxiliary(token)
            || time_name == Some(token)
    };
    let pops_on_close = |token: &str| {
        is_operator_token(token)
            || is_function_token(token)
            || is_logical_token(token)
            || is_comparison_token(token)
            || scope.is_user_function(token)
    };
    let trails_close = |token: &str| {
        is_function_token(token)
            || is_logical_token(token)
            || is_comparison_token(token)
            || scope.is_user_function(token)
    };

    for symbol in input {
        if stack.is_empty() {
            break;
        }
        let symbol = symbol.as_str();

        if is_number(symbol) || is_name(symbol) {
            output.push(symbol.to_string());
            next_sign_is_unary = false;
        } else if symbol == "(" {
            stack.push(symbol.to_string());
            next_sign_is_unary = true;
        } else if symbol == ")" {
            while stack.last().is_some_and(|top| pops_on_close(top)) {
                output.push(stack.pop().expect("stack top was just observed"));
            }
            if stack.last().map(String::as_str) == Some("(") {
                stack.pop();
            }
            while stack.last().is_some_and(|top| trails_close(top)) {
                output.push(stack.pop().expect("stack top was just observed"));
            }
            next_sign_is_unary = false;
        } else if is_function_token(symbol)
            || is_logical_token(symbol)
            || is_comparison_token(symbol)
            || scope.is_user_function(symbol)
        {
            stack.push(symbol.to_string());
        } else if is_operator_token(symbol) {
            if symbol == "-" && next_sign_is_unary {
                stack.push("minus".to_string());
            } else if symbol == "+" && next_sign_is_unary {
                stack.push("plus".to_string());
            } else {
                while stack
                    .last()
                    .is_some_and(|top| is_operator_token(top) && precedence(top) >= precedence(symbol))
                {
                    output.push(stack.pop().expect("stack top was just observed"));
                }
                stack.push(symbol.to_string());
            }
            next_sign_is_unary = true;
        } else if symbol == "," {
            while stack.last().is_some_and(|top| is_operator_token(top)) {
                output.push(stack.pop().expect("stack top was just observed"));
            }
            next_sign_is_unary = true;
        } else {
            return Err(CompileError::lexical(format!(
                "Unknown token {symbol} in infix to postfix conversion."
            )));
        }
    }

    while let Some(top) = stack.pop() {
        output.push(top);
    }

    Ok(output)
}

/// Stack machine turning postfix tokens into an expression tree, resolving
/// names against the scope. Named leaves push the slot registered under
/// that name, so every mention of a declared name aliases the same slot.
pub fn postfix_to_expr(
    tokens: &[String],
    scope: &Scope,
    registry: &Registry,
) -> Result<ParsedExpr> {
    let mut stack: Vec<ParsedExpr> = Vec::new();
    let time_name = scope.time_name(registry);

    for symbol in tokens.iter().map(String::as_str) {
        if let Ok(value) = symbol.parse::<f64>() {
            stack.push(ParsedExpr::Scalar(Expr::Constant(value)));
        } else if let Some(value) = scope.find_constant(symbol) {
            stack.push(ParsedExpr::Scalar(Expr::Constant(value)));
        } else if let Some(id) = scope.find_variable(symbol) {
            stack.push(ParsedExpr::Scalar(Expr::Leaf(id)));
        } else if let Some(id) = scope.find_parameter(symbol) {
            stack.push(ParsedExpr::Scalar(Expr::Leaf(id)));
        } else if scope.is_auxiliary(symbol) {
            let defined = registry
                .auxiliaries()
                .iter()
                .position(|aux| aux.name == symbol);
            match defined {
                Some(index) => match &registry.auxiliary(AuxId(index)).body {
                    AuxBody::Scalar(_) => stack.push(ParsedExpr::Scalar(Expr::Aux(AuxId(index)))),
                    AuxBody::Truth(logical) => stack.push(ParsedExpr::Truth(logical.clone())),
                },
                None => {
                    return Err(CompileError::namespace(format!(
                        "Attempt to use undefined auxiliary {symbol}."
                    )))
                }
            }
        } else if time_name == Some(symbol) {
            let id = scope.time.expect("time slot exists when its name resolves");
            stack.push(ParsedExpr::Scalar(Expr::Leaf(id)));
        } else if is_function_token(symbol) {
            apply_function(symbol, &mut stack, registry)?;
        } else if is_logical_token(symbol) {
            apply_logical(symbol, &mut stack)?;
        } else if is_comparison_token(symbol) {
            apply_comparison(symbol, &mut stack)?;
        } else if scope.is_user_function(symbol) {
            apply_user_function(symbol, scope, &mut stack)?;
        } else if is_operator_token(symbol) {
            let b = pop_scalar(&mut stack, symbol)?;
            let a = pop_scalar(&mut stack, symbol)?;
            let op = match symbol {
                "+" => BinaryOp::Add,
                "-" => BinaryOp::Sub,
                "*" => BinaryOp::Mul,
                "/" => BinaryOp::Div,
                "^" => BinaryOp::Pow,
                _ => unreachable!("minus and plus are handled as functions"),
            };
            stack.push(ParsedExpr::Scalar(Expr::Binary(op, Box::new(a), Box::new(b))));
        } else {
            return Err(CompileError::lexical(format!(
                "Unknown symbol {symbol} received in postfix to expression conversion."
            )));
        }
    }

    if stack.len() > 1 {
        return Err(CompileError::arity(
            "Too many objects on the parse stack; an operand is missing its operator.",
        ));
    }
    stack.pop().ok_or_else(|| {
        CompileError::lexical("Empty parse stack; the expression produced no value.")
    })
}

fn pop_scalar(stack: &mut Vec<ParsedExpr>, symbol: &str) -> Result<Expr> {
    match stack.pop() {
        Some(ParsedExpr::Scalar(e)) => Ok(e),
        Some(ParsedExpr::Truth(_)) => Err(CompileError::semantic(
            "Logical expression was not expected.",
        )),
        None => Err(CompileError::arity(format!(
            "Not enough operands on stack for {symbol}."
        ))),
    }
}

fn pop_truth(stack: &mut Vec<ParsedExpr>, symbol: &str) -> Result<Logical> {
    match stack.pop() {
        Some(ParsedExpr::Truth(l)) => Ok(l),
        Some(ParsedExpr::Scalar(_)) => Err(CompileError::semantic(format!(
            "Argument to {symbol} was not logical."
        ))),
        None => Err(CompileError::arity(format!(
            "Missing argument for {symbol}."
        ))),
    }
}

fn apply_function(symbol: &str, stack: &mut Vec<ParsedExpr>, registry: &Registry) -> Result<()> {
    let unary = |op: UnaryOp, stack: &mut Vec<ParsedExpr>| -> Result<ParsedExpr> {
        let a = pop_scalar(stack, symbol)?;
        Ok(ParsedExpr::Scalar(Expr::unary(op, a)))
    };
    let binary = |op: BinaryOp, stack: &mut Vec<ParsedExpr>| -> Result<ParsedExpr> {
        let second = pop_scalar(stack, symbol)?;
        let first = pop_scalar(stack, symbol)?;
        Ok(ParsedExpr::Scalar(Expr::Binary(
            op,
            Box::new(first),
            Box::new(second),
        )))
    };

    let result = match symbol {
        "sin" => unary(UnaryOp::Sin, stack)?,
        "cos" => unary(UnaryOp::Cos, stack)?,
        "tan" => unary(UnaryOp::Tan, stack)?,
        "asin" => unary(UnaryOp::Asin, stack)?,
        "acos" => unary(UnaryOp::Acos, stack)?,
        "atan" => unary(UnaryOp::Atan, stack)?,
        "log" => unary(UnaryOp::Log, stack)?,
        "exp" => unary(UnaryOp::Exp, stack)?,
        "sqrt" => unary(UnaryOp::Sqrt, stack)?,
        "abs" => unary(UnaryOp::Abs, stack)?,
        "sign" => unary(UnaryOp::Sign, stack)?,
        "minus" => unary(UnaryOp::Neg, stack)?,
        "plus" => {
            let a = pop_scalar(stack, symbol)?;
            ParsedExpr::Scalar(a)
        }
        "pow" => binary(BinaryOp::Pow, stack)?,
        "atan2" => binary(BinaryOp::Atan2, stack)?,
        "max" => binary(BinaryOp::Max, stack)?,
        "min" => binary(BinaryOp::Min, stack)?,
        "rand" => binary(BinaryOp::Rand, stack)?,
        "gauss" => binary(BinaryOp::Gauss, stack)?,
        "diff" => {
            let target = pop_scalar(stack, symbol)?;
            let body = pop_scalar(stack, symbol)?;
            let Expr::Leaf(id) = target else {
                return Err(CompileError::semantic(
                    "Differentiation has to be with respect to a variable or parameter.",
                ));
            };
            if !body.is_differentiable(registry) {
                return Err(CompileError::semantic("Expression is not differentiable."));
            }
            ParsedExpr::Scalar(body.diff(id, registry))
        }
        "mod" | "step" => {
            let third = pop_scalar(stack, symbol)?;
            let second = pop_scalar(stack, symbol)?;
            let first = pop_scalar(stack, symbol)?;
            let op = if symbol == "mod" {
                TernaryOp::Mod
            } else {
                TernaryOp::Step
            };
            ParsedExpr::Scalar(Expr::Ternary(
                op,
                Box::new(first),
                Box::new(second),
                Box::new(third),
            ))
        }
        "clip" => {
            let fourth = pop_scalar(stack, symbol)?;
            let third = pop_scalar(stack, symbol)?;
            let second = pop_scalar(stack, symbol)?;
            let first = pop_scalar(stack, symbol)?;
            ParsedExpr::Scalar(Expr::Clip(
                Box::new(first),
                Box::new(second),
                Box::new(third),
                Box::new(fourth),
            ))
        }
        _ => unreachable!("function token list is closed"),
    };
    stack.push(result);
    Ok(())
}

fn apply_logical(symbol: &str, stack: &mut Vec<ParsedExpr>) -> Result<()> {
    let result = match symbol {
        "not" => Logical::Not(Box::new(pop_truth(stack, symbol)?)),
        "and" | "or" | "xor" => {
            let b = pop_truth(stack, symbol)?;
            let a = pop_truth(stack, symbol)?;
            match symbol {
                "and" => Logical::And(Box::new(a), Box::new(b)),
                "or" => Logical::Or(Box::new(a), Box::new(b)),
                _ => Logical::Xor(Box::new(a), Box::new(b)),
            }
        }
        "ifte" => {
            let otherwise = pop_scalar(stack, symbol)?;
            let then = pop_scalar(stack, symbol)?;
            let condition = pop_truth(stack, symbol)?;
            stack.push(ParsedExpr::Scalar(Expr::IfThenElse(
                Box::new(condition),
                Box::new(then),
                Box::new(otherwise),
            )));
            return Ok(());
        }
        _ => unreachable!("logical token list is closed"),
    };
    stack.push(ParsedExpr::Truth(result));
    Ok(())
}

fn apply_comparison(symbol: &str, stack: &mut Vec<ParsedExpr>) -> Result<()> {
    let b = pop_scalar(stack, symbol)?;
    let a = pop_scalar(stack, symbol)?;
    let op = match symbol {
        "gt" => CmpOp::Gt,
        "ge" => CmpOp::Ge,
        "lt" => CmpOp::Lt,
        "le" => CmpOp::Le,
        "eq" => CmpOp::Eq,
        "neq" => CmpOp::Neq,
        _ => unreachable!("comparison token list is closed"),
    };
    stack.push(ParsedExpr::Truth(Logical::Cmp(op, Box::new(a), Box::new(b))));
    Ok(())
}

fn apply_user_function(symbol: &str, scope: &Scope, stack: &mut Vec<ParsedExpr>) -> Result<()> {
    let Some(function) = scope.functions.iter().find(|f| f.name == symbol) else {
        return Err(CompileError::namespace(format!(
            "Attempt to use undefined user function {symbol}."
        )));
    };

    let mut body = function.body.clone();
    for (_, id) in function.formals.iter().rev() {
        let argument = stack.pop().ok_or_else(|| {
            CompileError::arity(format!(
                "Not enough arguments on stack for user function {symbol}: {} expected.",
                function.formals.len()
            ))
        })?;
        let ParsedExpr::Scalar(argument) = argument else {
            return Err(CompileError::semantic(
                "Logical expression was not expected.",
            ));
        };
        body = body.replace(&Expr::Leaf(*id), &argument);
    }
    stack.push(ParsedExpr::Scalar(body));
    Ok(())
}

/// Parses one infix expression against the given declaration context.
/// Whole-token numeric literals short-circuit to a constant, as the
/// original grammar did.
pub fn parse_str(text: &str, scope: &Scope, registry: &Registry) -> Result<ParsedExpr> {
    let stripped: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if let Ok(value) = stripped.parse::<f64>() {
        return Ok(ParsedExpr::Scalar(Expr::Constant(value)));
    }
    let tokens = tokenize(&stripped);
    let postfix = infix_to_postfix(&tokens, scope, registry)?;
    postfix_to_expr(&postfix, scope, registry)
}

/// Like [`parse_str`], but requires a scalar result.
pub fn parse_scalar(text: &str, scope: &Scope, registry: &Registry) -> Result<Expr> {
    match parse_str(text, scope, registry)? {
        ParsedExpr::Scalar(e) => Ok(e),
        ParsedExpr::Truth(_) => Err(CompileError::semantic(
            "Logical expression was not expected.",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare() -> (Scope, Registry) {
        (Scope::new(), Registry::new())
    }

    #[test]
    fn parses_and_evaluates_a_constant_expression() {
        let (scope, registry) = bare();
        let e = parse_scalar("1+sin(3/2.0)", &scope, &registry).expect("expression should parse");
        let expected = 1.0 + (3.0 / 2.0_f64).sin();
        assert!((e.eval(&registry) - expected).abs() < 1e-12);
    }

    #[test]
    fn whole_literals_short_circuit() {
        let (scope, registry) = bare();
        let e = parse_scalar(" 2.5e-3 ", &scope, &registry).expect("literal should parse");
        assert_eq!(e, Expr::Constant(2.5e-3));
    }

    #[test]
    fn exponent_literals_survive_tokenization() {
        let (scope, registry) = bare();
        let e = parse_scalar("1+2e-2", &scope, &registry).expect("expression should parse");
        assert!((e.eval(&registry) - 1.02).abs() < 1e-12);
        let e = parse_scalar("1.5E+2*2", &scope, &registry).expect("expression should parse");
        assert_eq!(e.eval(&registry), 300.0);
    }

    #[test]
    fn declared_names_alias_registry_slots() {
        let mut registry = Registry::new();
        let x = registry.intern_variable("x", 2.3);
        let scope = Scope::from_registry(&registry);

        let e = parse_scalar("x+sin(3*x)", &scope, &registry).expect("expression should parse");
        let expected = 2.3 + (3.0_f64 * 2.3).sin();
        assert!((e.eval(&registry) - expected).abs() < 1e-12);

        registry.set_value(x, 0.0);
        assert_eq!(e.eval(&registry), 0.0);
    }

    #[test]
    fn unary_signs_and_precedence() {
        let (scope, registry) = bare();
        let eval = |text: &str| {
            parse_scalar(text, &scope, &registry)
                .expect("expression should parse")
                .eval(&registry)
        };
        assert_eq!(eval("-3+5"), 2.0);
        assert_eq!(eval("2*-3"), -6.0);
        assert_eq!(eval("-(2+3)"), -5.0);
        assert_eq!(eval("+4"), 4.0);
        assert_eq!(eval("1+2*3"), 7.0);
        assert_eq!(eval("(1+2)*3"), 9.0);
    }

    #[test]
    fn pow_is_left_associative() {
        // The >= pop rule: 2^3^2 groups as (2^3)^2, not 2^(3^2).
        let (scope, registry) = bare();
        let e = parse_scalar("2^3^2", &scope, &registry).expect("expression should parse");
        assert_eq!(e.eval(&registry), 64.0);
    }

    #[test]
    fn unary_minus_binds_tighter_than_pow() {
        let (scope, registry) = bare();
        let e = parse_scalar("-2^2", &scope, &registry).expect("expression should parse");
        assert_eq!(e.eval(&registry), 4.0);
    }

    #[test]
    fn two_argument_functions_take_comma_lists() {
        let (scope, registry) = bare();
        let eval = |text: &str| {
            parse_scalar(text, &scope, &registry)
                .expect("expression should parse")
                .eval(&registry)
        };
        assert_eq!(eval("max(2,3)"), 3.0);
        assert_eq!(eval("min(2,1+1)"), 2.0);
        assert_eq!(eval("pow(2,1+2)"), 8.0);
        assert_eq!(eval("atan2(0,1)"), 0.0);
        assert_eq!(eval("mod(7.5,0,2)"), 1.5);
        assert_eq!(eval("step(2,1,5)"), 5.0);
        assert_eq!(eval("clip(0.5,0,1,3)"), 3.0);
    }

    #[test]
    fn ifte_and_comparisons_parse() {
        let mut registry = Registry::new();
        registry.intern_variable("x", 2.0);
        let scope = Scope::from_registry(&registry);
        let e = parse_scalar("ifte(gt(x,1),10,20)", &scope, &registry)
            .expect("expression should parse");
        assert_eq!(e.eval(&registry), 10.0);
    }

    #[test]
    fn inline_diff_applies_at_parse_time() {
        let mut registry = Registry::new();
        registry.intern_variable("x", 0.5);
        let scope = Scope::from_registry(&registry);
        let e = parse_scalar("diff(sin(x),x)", &scope, &registry).expect("diff should parse");
        assert!((e.eval(&registry) - 0.5_f64.cos()).abs() < 1e-12);

        let err = parse_scalar("diff(sin(x),2)", &scope, &registry)
            .expect_err("differentiation target must be named");
        assert!(err.message.contains("variable or parameter"));
    }

    #[test]
    fn unknown_identifiers_are_rejected() {
        let (scope, registry) = bare();
        let err = parse_scalar("nope+1", &scope, &registry).expect_err("unknown name");
        assert!(err.message.contains("nope"));
    }

    #[test]
    fn missing_operands_are_reported() {
        let (scope, registry) = bare();
        let err = parse_scalar("1+", &scope, &registry).expect_err("dangling operator");
        assert!(
            err.message.contains("operand"),
            "unexpected message: {}",
            err.message
        );
    }

    #[test]
    fn user_functions_substitute_arguments() {
        let mut registry = Registry::new();
        let a = registry.intern_variable("a", 0.0);
        let b = registry.intern_variable("b", 0.0);
        let body = Expr::add(
            Expr::Leaf(a),
            Expr::mul(Expr::Constant(2.0), Expr::Leaf(b)),
        );
        let mut scope = Scope::new();
        scope.function_names.push("f".to_string());
        scope.functions.push(UserFunction {
            name: "f".to_string(),
            formals: vec![("a".to_string(), a), ("b".to_string(), b)],
            body,
        });

        let e = parse_scalar("f(3,4)", &scope, &registry).expect("application should parse");
        assert_eq!(e.eval(&registry), 11.0);
    }
}
