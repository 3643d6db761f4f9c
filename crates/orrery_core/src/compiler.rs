use crate::error::{CompileError, Result};
use crate::expr::Expr;
use crate::parser::{parse_scalar, parse_str, ParsedExpr, Scope, UserFunction};
use crate::registry::{AuxBody, AuxId, Registry, SlotId};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::f64::consts::{E, PI};

/// Reserved identifier for time in time-continuous models.
pub const TIME_CONTINUOUS_NAME: &str = "t";
/// Reserved identifier for the step counter in time-discrete models.
pub const TIME_DISCRETE_NAME: &str = "n";

const PRIME_SYMBOLS: &[char] = &['\'', '`'];
const INVERSE_SYMBOLS: &[char] = &['~', '*', '#'];

const TYPE_KEYWORDS: &[&str] = &[
    "map",
    "ode",
    "sde",
    "invertible",
    "differentiable",
    "nondifferentiable",
    "stateinitializer",
    "parameterinitializer",
    "staterangeinitializer",
    "parameterrangeinitializer",
    "event",
];

const SECTION_KEYWORDS: &[&str] = &[
    "type",
    "variable",
    "process",
    "parameter",
    "constant",
    "auxiliary",
    "function",
    "event",
    "input",
    "output",
    "param",
];

const OPERATOR_NAMES: &[&str] = &[
    "sin", "cos", "tan", "asin", "acos", "atan", "atan2", "exp", "log", "pow", "sqrt", "minus",
    "plus", "abs", "step", "clip", "mod", "max", "min", "diff", "rand", "gauss", "sign", "not",
    "and", "or", "xor", "ifte", "gt", "ge", "lt", "le", "eq", "neq",
];

// Declared names end up verbatim as fields and locals in the emitted Rust
// source, so the target language's keywords are off limits too.
const RUST_KEYWORDS: &[&str] = &[
    "as", "async", "await", "break", "const", "continue", "crate", "dyn", "else", "enum",
    "extern", "false", "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod", "move",
    "mut", "pub", "ref", "return", "self", "static", "struct", "super", "trait", "true", "type",
    "unsafe", "use", "where", "while",
];

fn is_reserved(name: &str) -> bool {
    SECTION_KEYWORDS.contains(&name)
        || TYPE_KEYWORDS.contains(&name)
        || OPERATOR_NAMES.contains(&name)
        || RUST_KEYWORDS.contains(&name)
        || name == "pi"
        || name == "e"
        || name == TIME_CONTINUOUS_NAME
        || name == TIME_DISCRETE_NAME
}

fn is_legal_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeDomain {
    Discrete,
    Continuous,
}

/// Derived classification of a compiled model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemClass {
    pub time: TimeDomain,
    pub autonomous: bool,
    pub differentiable: bool,
    pub parameter_differentiable: bool,
    pub expandable: bool,
    pub invertible: bool,
    pub stochastic: bool,
    pub periodically_forced: bool,
    pub poincare_section: bool,
}

/// A discrete event: fire `target = value` whenever `condition` holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub condition: ParsedExpr,
    pub target: SlotId,
    pub value: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileOptions {
    /// Number of times the one-pass rewriter runs over each tree.
    pub optimization_level: u32,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            optimization_level: 3,
        }
    }
}

/// A fully compiled model: the registry owning every named leaf, the
/// optimized equation trees, derived matrices, and classification flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledModel {
    pub registry: Registry,
    pub variables: Vec<SlotId>,
    pub parameters: Vec<SlotId>,
    pub process_names: Vec<String>,
    pub constants: Vec<(String, f64)>,
    pub functions: Vec<UserFunction>,
    pub events: Vec<Event>,
    pub equations: Vec<Expr>,
    pub inverse_equations: Vec<Expr>,
    pub jacobian: Option<Vec<Vec<Expr>>>,
    pub parameter_jacobian: Option<Vec<Vec<Expr>>>,
    pub diffusion: Option<Vec<Vec<Expr>>>,
    pub initial_state: Option<Vec<f64>>,
    pub initial_parameters: Option<Vec<f64>>,
    pub state_ranges: Option<Vec<(f64, f64)>>,
    pub parameter_ranges: Option<Vec<(f64, f64)>>,
    pub class: SystemClass,
    pub time_slot: Option<SlotId>,
    pub description: Option<String>,
    /// Human-readable compilation transcript.
    pub information: String,
}

impl CompiledModel {
    pub fn dimension(&self) -> usize {
        self.variables.len()
    }

    pub fn state_names(&self) -> Vec<&str> {
        self.variables
            .iter()
            .map(|id| self.registry.name(*id))
            .collect()
    }

    pub fn parameter_names(&self) -> Vec<&str> {
        self.parameters
            .iter()
            .map(|id| self.registry.name(*id))
            .collect()
    }

    pub fn time_name(&self) -> Option<&str> {
        self.time_slot.map(|id| self.registry.name(id))
    }

    fn load_state(&mut self, state: &[f64], t: f64) {
        for (value, id) in state.iter().zip(self.variables.iter()) {
            self.registry.set_value(*id, *value);
        }
        if let Some(id) = self.time_slot {
            self.registry.set_value(id, t);
        }
    }

    /// Evaluates the right-hand sides at the given state and time.
    pub fn eval_rhs(&mut self, state: &[f64], t: f64) -> Vec<f64> {
        self.load_state(state, t);
        self.equations
            .iter()
            .map(|e| e.eval(&self.registry))
            .collect()
    }

    /// Evaluates the inverse equations, when the model is invertible.
    pub fn eval_inverse(&mut self, state: &[f64], t: f64) -> Option<Vec<f64>> {
        if self.inverse_equations.is_empty() {
            return None;
        }
        self.load_state(state, t);
        Some(
            self.inverse_equations
                .iter()
                .map(|e| e.eval(&self.registry))
                .collect(),
        )
    }

    /// Numerically evaluates the symbolic Jacobian at the given state.
    pub fn jacobian_at(&mut self, state: &[f64], t: f64) -> Option<DMatrix<f64>> {
        self.load_state(state, t);
        let jacobian = self.jacobian.as_ref()?;
        let rows = jacobian.len();
        let cols = self.variables.len();
        Some(DMatrix::from_fn(rows, cols, |i, j| {
            jacobian[i][j].eval(&self.registry)
        }))
    }

    /// Numerically evaluates the symbolic parameter Jacobian.
    pub fn parameter_jacobian_at(&mut self, state: &[f64], t: f64) -> Option<DMatrix<f64>> {
        self.load_state(state, t);
        let jacobian = self.parameter_jacobian.as_ref()?;
        let rows = jacobian.len();
        let cols = self.parameters.len();
        Some(DMatrix::from_fn(rows, cols, |i, j| {
            jacobian[i][j].eval(&self.registry)
        }))
    }

    /// Numerically evaluates the diffusion matrix of a stochastic model.
    pub fn diffusion_at(&mut self, state: &[f64], t: f64) -> Option<DMatrix<f64>> {
        self.load_state(state, t);
        let diffusion = self.diffusion.as_ref()?;
        let rows = diffusion.len();
        let cols = self.process_names.len();
        Some(DMatrix::from_fn(rows, cols, |i, j| {
            diffusion[i][j].eval(&self.registry)
        }))
    }
}

/// Compiles a model program with default options.
pub fn compile(source: &str) -> Result<CompiledModel> {
    compile_with(source, &CompileOptions::default())
}

/// Reads a model program from a file and compiles it.
pub fn compile_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<CompiledModel> {
    use anyhow::Context;
    let path = path.as_ref();
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read model source {}", path.display()))?;
    compile(&source).map_err(anyhow::Error::from)
}

/// Compiles a model program. The grammar is order-sensitive and the first
/// structural or semantic violation aborts the compilation.
pub fn compile_with(source: &str, options: &CompileOptions) -> Result<CompiledModel> {
    Builder::new(*options).run(source)
}

struct Builder {
    options: CompileOptions,
    registry: Registry,
    scope: Scope,
    process_names: Vec<String>,
    constant_names: Vec<String>,
    event_names: Vec<String>,
    events: Vec<Event>,
    equations: Vec<Expr>,
    inverse_equations: Vec<Expr>,
    aux_ids: Vec<AuxId>,
    info: String,
    description: Option<String>,

    time_discrete: bool,
    time_continuous: bool,
    invertible: bool,
    forced_differentiable: bool,
    nondifferentiable: bool,
    stochastic: bool,
    contains_events: bool,
    contains_state_init: bool,
    contains_parameter_init: bool,
    contains_state_range: bool,
    contains_parameter_range: bool,
    periodically_forced: bool,
    poincare_section: bool,
}

impl Builder {
    fn new(options: CompileOptions) -> Self {
        Self {
            options,
            registry: Registry::new(),
            scope: Scope::new(),
            process_names: Vec::new(),
            constant_names: Vec::new(),
            event_names: Vec::new(),
            events: Vec::new(),
            equations: Vec::new(),
            inverse_equations: Vec::new(),
            aux_ids: Vec::new(),
            info: String::new(),
            description: None,
            time_discrete: false,
            time_continuous: false,
            invertible: false,
            forced_differentiable: false,
            nondifferentiable: false,
            stochastic: false,
            contains_events: false,
            contains_state_init: false,
            contains_parameter_init: false,
            contains_state_range: false,
            contains_parameter_range: false,
            periodically_forced: false,
            poincare_section: false,
        }
    }

    fn note(&mut self, line: impl AsRef<str>) {
        self.info.push_str(line.as_ref());
        self.info.push('\n');
    }

    fn run(mut self, source: &str) -> Result<CompiledModel> {
        self.note("Compilation starting.");
        if source.trim().is_empty() {
            return Err(CompileError::lexical("No source code."));
        }

        let cleaned = self.strip_comments(source);
        let statements: Vec<String> = cleaned
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let mut cursor = StatementCursor::new(&statements);

        self.read_type_statement(&mut cursor)?;
        self.intern_time();
        self.read_variable_declarations(&mut cursor)?;
        if self.stochastic {
            self.read_process_declarations(&mut cursor)?;
        }
        let has_parameters = self.read_parameter_declarations(&mut cursor)?;
        self.scope.constants.push(("pi".to_string(), PI));
        self.scope.constants.push(("e".to_string(), E));
        self.read_constant_declarations(&mut cursor)?;
        self.read_auxiliary_declarations(&mut cursor)?;
        self.read_function_declarations(&mut cursor)?;
        if self.contains_events {
            self.read_event_declarations(&mut cursor)?;
        }

        self.read_constant_definitions(&mut cursor)?;
        self.read_auxiliary_definitions(&mut cursor)?;
        self.read_function_definitions(&mut cursor)?;
        self.read_event_definitions(&mut cursor)?;
        self.read_dynamic_equations(&mut cursor)?;
        if self.invertible {
            self.read_inverse_equations(&mut cursor)?;
        }
        let initial_state = if self.contains_state_init {
            Some(self.read_initial_values(&mut cursor, ValueBlock::State)?)
        } else {
            None
        };
        let initial_parameters = if has_parameters && self.contains_parameter_init {
            Some(self.read_initial_values(&mut cursor, ValueBlock::Parameter)?)
        } else {
            None
        };
        let state_ranges = if self.contains_state_range {
            Some(self.read_ranges(&mut cursor, ValueBlock::State)?)
        } else {
            None
        };
        let parameter_ranges = if has_parameters && self.contains_parameter_range {
            Some(self.read_ranges(&mut cursor, ValueBlock::Parameter)?)
        } else {
            None
        };
        // Remaining statements, if any, are deliberately ignored: everything
        // the grammar needs has been read.

        let diffusion = if self.stochastic {
            Some(self.extract_diffusion()?)
        } else {
            None
        };

        self.optimize_everything();
        let class_and_matrices = self.classify(has_parameters)?;

        self.note("Compilation done.");
        let Builder {
            registry,
            scope,
            process_names,
            event_names: _,
            events,
            equations,
            inverse_equations,
            info,
            description,
            ..
        } = self;

        let (class, jacobian, parameter_jacobian, time_slot) = class_and_matrices;
        Ok(CompiledModel {
            registry,
            variables: scope.variables.iter().map(|(_, id)| *id).collect(),
            parameters: scope.parameters.iter().map(|(_, id)| *id).collect(),
            process_names,
            constants: scope.constants,
            functions: scope.functions,
            events,
            equations,
            inverse_equations,
            jacobian,
            parameter_jacobian,
            diffusion,
            initial_state,
            initial_parameters,
            state_ranges,
            parameter_ranges,
            class,
            time_slot,
            description,
            information: info,
        })
    }

    /// Removes `/* ... */` comments; the first one found becomes the model
    /// description.
    fn strip_comments(&mut self, source: &str) -> String {
        let mut text = source.to_string();
        while let (Some(start), Some(end)) = (text.find("/*"), text.find("*/")) {
            if end < start {
                break;
            }
            if self.description.is_none() {
                let comment = text[start + 2..end].trim();
                if !comment.is_empty() {
                    self.note("Initial comment found.");
                    self.description = Some(comment.to_string());
                }
            }
            text.replace_range(start..end + 2, "");
        }
        text
    }

    fn read_type_statement(&mut self, cursor: &mut StatementCursor) -> Result<()> {
        let statement = cursor
            .next()
            .ok_or_else(|| CompileError::lexical("Initial statement is not a type statement."))?;
        let mut words = split_names(&statement);
        if words.first().map(String::as_str) != Some("type") {
            return Err(CompileError::lexical(
                "Initial statement is not a type statement.",
            ));
        }
        words.remove(0);

        for key in &words {
            if !TYPE_KEYWORDS.contains(&key.as_str()) {
                return Err(CompileError::lexical(format!("{key} is not a type.")));
            }
            match key.as_str() {
                "map" => {
                    self.time_discrete = true;
                    self.note("System is declared discrete.");
                }
                "ode" => {
                    self.time_continuous = true;
                    self.note("System is declared timecontinuous.");
                }
                "sde" => {
                    self.time_continuous = true;
                    self.stochastic = true;
                    self.note("System is declared timecontinuous.");
                }
                "invertible" => {
                    self.invertible = true;
                    self.note("System is declared invertible.");
                }
                "differentiable" => {
                    self.forced_differentiable = true;
                    self.note("System is declared differentiable.");
                }
                "nondifferentiable" => {
                    self.nondifferentiable = true;
                    self.note("System is declared nondifferentiable.");
                }
                "stateinitializer" => self.contains_state_init = true,
                "parameterinitializer" => self.contains_parameter_init = true,
                "staterangeinitializer" => self.contains_state_range = true,
                "parameterrangeinitializer" => self.contains_parameter_range = true,
                "event" => self.contains_events = true,
                _ => unreachable!("type keyword list is closed"),
            }
        }

        if !(self.time_discrete || self.time_continuous) {
            return Err(CompileError::semantic(
                "System has been declared neither discrete (map) nor time continuous (ode).",
            ));
        }
        if self.time_discrete && self.time_continuous {
            return Err(CompileError::semantic(
                "System has been declared both discrete (map) and time continuous (ode).",
            ));
        }
        Ok(())
    }

    fn intern_time(&mut self) {
        let name = if self.time_continuous {
            TIME_CONTINUOUS_NAME
        } else {
            TIME_DISCRETE_NAME
        };
        let id = self.registry.intern_variable(name, 0.0);
        self.scope.time = Some(id);
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if !is_legal_identifier(name) {
            return Err(CompileError::namespace(format!(
                "Name {name} is not a legal identifier."
            )));
        }
        if is_reserved(name) {
            return Err(CompileError::namespace(format!(
                "Name {name} is a reserved name."
            )));
        }
        if self.process_names.iter().any(|n| n == name) {
            return Err(CompileError::namespace(format!(
                "Name {name} is in use as a process name."
            )));
        }
        if self.scope.variables.iter().any(|(n, _)| n == name) {
            return Err(CompileError::namespace(format!(
                "Name {name} is in use as a variable name."
            )));
        }
        if self.scope.parameters.iter().any(|(n, _)| n == name) {
            return Err(CompileError::namespace(format!(
                "Name {name} is in use as a parameter name."
            )));
        }
        if self.constant_names.iter().any(|n| n == name)
            || self.scope.constants.iter().any(|(n, _)| n == name)
        {
            return Err(CompileError::namespace(format!(
                "Name {name} is in use as a constant name."
            )));
        }
        if self.scope.auxiliary_names.iter().any(|n| n == name) {
            return Err(CompileError::namespace(format!(
                "Name {name} is in use as an auxiliary name."
            )));
        }
        if self.scope.function_names.iter().any(|n| n == name) {
            return Err(CompileError::namespace(format!(
                "Name {name} is in use as a function name."
            )));
        }
        if self.event_names.iter().any(|n| n == name) {
            return Err(CompileError::namespace(format!(
                "Name {name} is in use as an event name."
            )));
        }
        Ok(())
    }

    fn read_variable_declarations(&mut self, cursor: &mut StatementCursor) -> Result<()> {
        self.note("Reading variable declarations.");
        let statement = cursor
            .next()
            .ok_or_else(|| CompileError::lexical("Keyword variable is missing."))?;
        let mut names = split_names(&statement);
        if names.first().map(String::as_str) != Some("variable") {
            return Err(CompileError::ordering(format!(
                "Token {} read where keyword variable was expected.",
                names.first().map(String::as_str).unwrap_or("")
            )));
        }
        names.remove(0);
        if names.is_empty() {
            return Err(CompileError::lexical("The source code has no variables."));
        }
        for name in names {
            self.check_name(&name)?;
            let id = self.registry.intern_variable(&name, 0.0);
            self.scope.variables.push((name.clone(), id));
            self.note(format!("Variable {name} added."));
        }
        Ok(())
    }

    fn read_process_declarations(&mut self, cursor: &mut StatementCursor) -> Result<()> {
        self.note("Reading process declarations.");
        let statement = cursor
            .next()
            .ok_or_else(|| CompileError::lexical("The source code has no processes."))?;
        let mut names = split_names(&statement);
        if names.first().map(String::as_str) != Some("process") {
            return Err(CompileError::ordering(format!(
                "Token {} read where keyword process was expected.",
                names.first().map(String::as_str).unwrap_or("")
            )));
        }
        names.remove(0);
        if names.is_empty() {
            return Err(CompileError::lexical("The source code has no processes."));
        }
        for name in names {
            self.check_name(&name)?;
            // A process behaves like a variable while the drift equations
            // are being parsed; it is removed again after the diffusion
            // terms have been extracted.
            let id = self.registry.intern_variable(&name, 0.0);
            self.process_names.push(name.clone());
            self.scope.variables.push((name.clone(), id));
            self.note(format!("Process {name} added."));
        }
        Ok(())
    }

    fn read_parameter_declarations(&mut self, cursor: &mut StatementCursor) -> Result<bool> {
        if cursor.peek_keyword() != Some("parameter") {
            return Ok(false);
        }
        self.note("Reading parameter declarations.");
        let statement = cursor.next().expect("peeked statement exists");
        let mut names = split_names(&statement);
        names.remove(0);
        if names.is_empty() {
            self.note("System declared parameter dependent but no parameters were defined.");
            return Ok(false);
        }
        for name in names {
            self.check_name(&name)?;
            let id = self.registry.intern_parameter(&name, 0.0);
            self.scope.parameters.push((name.clone(), id));
            self.note(format!("Parameter {name} added."));
        }
        Ok(true)
    }

    fn read_constant_declarations(&mut self, cursor: &mut StatementCursor) -> Result<()> {
        if cursor.peek_keyword() != Some("constant") {
            return Ok(());
        }
        self.note("Reading constant declarations.");
        let statement = cursor.next().expect("peeked statement exists");
        let mut names = split_names(&statement);
        names.remove(0);
        if names.is_empty() {
            self.note("System declared constant dependent but no constants were defined.");
            return Ok(());
        }
        for name in names {
            self.check_name(&name)?;
            // Declared now; the value lands in the scope with the
            // definition, so a constant cannot be used before it exists.
            self.constant_names.push(name.clone());
            self.note(format!("Constant {name} added."));
        }
        Ok(())
    }

    fn read_auxiliary_declarations(&mut self, cursor: &mut StatementCursor) -> Result<()> {
        if cursor.peek_keyword() != Some("auxiliary") {
            return Ok(());
        }
        self.note("Reading auxiliary declarations.");
        let statement = cursor.next().expect("peeked statement exists");
        let mut names = split_names(&statement);
        names.remove(0);
        if names.is_empty() {
            self.note("System declared auxiliary dependent but no auxiliaries were defined.");
            return Ok(());
        }
        for name in names {
            self.check_name(&name)?;
            if name == "period" {
                self.periodically_forced = true;
            }
            self.scope.auxiliary_names.push(name.clone());
            self.note(format!("Auxiliary {name} added."));
        }
        Ok(())
    }

    fn read_function_declarations(&mut self, cursor: &mut StatementCursor) -> Result<()> {
        if cursor.peek_keyword() != Some("function") {
            return Ok(());
        }
        self.note("Reading user function declarations.");
        let statement = cursor.next().expect("peeked statement exists");
        let mut names = split_names(&statement);
        names.remove(0);
        if names.is_empty() {
            self.note("System declared function dependent but no functions were defined.");
            return Ok(());
        }
        for name in names {
            self.check_name(&name)?;
            self.scope.function_names.push(name.clone());
            self.note(format!("User function {name} added."));
        }
        Ok(())
    }

    fn read_event_declarations(&mut self, cursor: &mut StatementCursor) -> Result<()> {
        self.note("Reading event declarations.");
        let statement = cursor
            .next()
            .ok_or_else(|| CompileError::lexical("No events were defined."))?;
        let mut names = split_names(&statement);
        if names.first().map(String::as_str) != Some("event") {
            return Err(CompileError::ordering(format!(
                "Token {} read where keyword event was expected.",
                names.first().map(String::as_str).unwrap_or("")
            )));
        }
        names.remove(0);
        if names.is_empty() {
            self.note("System declared event dependent but no events were defined.");
            self.contains_events = false;
            return Ok(());
        }
        for name in names {
            self.check_name(&name)?;
            self.event_names.push(name.clone());
            self.note(format!("Event {name} added."));
        }
        Ok(())
    }

    /// Scope used for constant-valued right-hand sides: only the constants
    /// defined so far are visible.
    fn constants_scope(&self) -> Scope {
        Scope {
            constants: self.scope.constants.clone(),
            ..Scope::default()
        }
    }

    fn eval_constant_rhs(&self, rhs: &str) -> Result<f64> {
        let scope = self.constants_scope();
        let expr = parse_scalar(rhs, &scope, &self.registry)?;
        Ok(expr.eval(&self.registry))
    }

    fn read_constant_definitions(&mut self, cursor: &mut StatementCursor) -> Result<()> {
        if self.constant_names.is_empty() {
            return Ok(());
        }
        self.note("Reading constant definitions.");
        for k in 0..self.constant_names.len() {
            let statement = cursor.next().ok_or_else(|| {
                CompileError::lexical("No more statements while reading constant definitions.")
            })?;
            self.note(format!("Processing: {statement}"));
            let (lhs, rhs) = split_assignment(&statement)?;
            if !self.constant_names.iter().any(|n| *n == lhs) {
                return Err(CompileError::namespace(format!(
                    "{lhs} is not a constant name."
                )));
            }
            if lhs != self.constant_names[k] {
                return Err(CompileError::ordering("Constant definitions in wrong order."));
            }
            let value = self.eval_constant_rhs(&rhs)?;
            self.scope.constants.push((lhs.clone(), value));
            self.note(format!("{lhs}={value}"));
        }
        Ok(())
    }

    fn read_auxiliary_definitions(&mut self, cursor: &mut StatementCursor) -> Result<()> {
        if self.scope.auxiliary_names.is_empty() {
            return Ok(());
        }
        self.note("Reading auxiliary definitions.");
        for k in 0..self.scope.auxiliary_names.len() {
            let statement = cursor.next().ok_or_else(|| {
                CompileError::lexical("No more statements while reading auxiliary definitions.")
            })?;
            self.note(format!("Processing: {statement}"));
            let (lhs, rhs) = split_assignment(&statement)?;
            let position = self
                .scope
                .auxiliary_names
                .iter()
                .position(|n| *n == lhs)
                .ok_or_else(|| {
                    CompileError::namespace(format!("{lhs} is not an auxiliary name."))
                })?;
            if position != k {
                return Err(CompileError::ordering("Auxiliary equations in wrong order."));
            }
            if self.time_continuous && lhs == "cutValue" {
                self.note("System defines Poincare section.");
                self.poincare_section = true;
            }
            let body = match parse_str(&rhs, &self.scope, &self.registry)? {
                ParsedExpr::Scalar(e) => AuxBody::Scalar(e),
                ParsedExpr::Truth(l) => AuxBody::Truth(l),
            };
            let rendered = match &body {
                AuxBody::Scalar(e) => e.render_infix(&self.registry),
                AuxBody::Truth(l) => l.render_infix(&self.registry),
            };
            let id = self.registry.define_auxiliary(&lhs, body);
            self.aux_ids.push(id);
            self.note(format!("Auxiliary {lhs}={rendered}"));
        }
        Ok(())
    }

    fn read_function_definitions(&mut self, cursor: &mut StatementCursor) -> Result<()> {
        if self.scope.function_names.is_empty() {
            return Ok(());
        }
        self.note("Reading user function definitions.");
        for k in 0..self.scope.function_names.len() {
            let statement = cursor.next().ok_or_else(|| {
                CompileError::lexical("No more statements while reading user function definitions.")
            })?;
            self.note(format!("Processing: {statement}"));
            let (lhs, rhs) = split_assignment(&statement)?;

            let open = lhs.find('(').ok_or_else(|| {
                CompileError::lexical(format!(
                    "User function definition {lhs} has no parameter list."
                ))
            })?;
            let name = lhs[..open].to_string();
            let args = lhs[open..]
                .trim_start_matches('(')
                .trim_end_matches(')')
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>();

            let position = self
                .scope
                .function_names
                .iter()
                .position(|n| *n == name)
                .ok_or_else(|| {
                    CompileError::namespace(format!("{name} is not a user function name."))
                })?;
            if position != k {
                return Err(CompileError::ordering(
                    "User function equations in wrong order.",
                ));
            }

            let mut formals: Vec<(String, SlotId)> = Vec::new();
            for formal in &args {
                if self.scope.constants.iter().any(|(n, _)| n == formal) {
                    return Err(CompileError::namespace(format!(
                        "Name {formal} is already in use for a constant."
                    )));
                }
                if self.scope.variables.iter().any(|(n, _)| n == formal) {
                    return Err(CompileError::namespace(format!(
                        "Name {formal} is already in use for a variable."
                    )));
                }
                if self.scope.parameters.iter().any(|(n, _)| n == formal) {
                    return Err(CompileError::namespace(format!(
                        "Name {formal} is already in use for a parameter."
                    )));
                }
                if self.scope.auxiliary_names.iter().any(|n| n == formal) {
                    return Err(CompileError::namespace(format!(
                        "Name {formal} is already in use for an auxiliary."
                    )));
                }
                if formals.iter().any(|(n, _)| n == formal) {
                    return Err(CompileError::namespace(format!(
                        "Name {formal} is already in use in user function {name}."
                    )));
                }
                let id = self.registry.intern_variable(formal, 0.0);
                formals.push((formal.clone(), id));
            }

            // Formals are visible only while the body is parsed.
            for (formal, id) in &formals {
                self.scope.variables.push((formal.clone(), *id));
            }
            let body = parse_scalar(&rhs, &self.scope, &self.registry);
            self.scope
                .variables
                .truncate(self.scope.variables.len() - formals.len());
            let body = body?;

            let signature = formals
                .iter()
                .map(|(n, _)| n.as_str())
                .collect::<Vec<_>>()
                .join(",");
            self.note(format!(
                "User function {name}({signature})={}",
                body.render_infix(&self.registry)
            ));
            self.scope.functions.push(UserFunction {
                name,
                formals,
                body,
            });
        }
        Ok(())
    }

    fn read_event_definitions(&mut self, cursor: &mut StatementCursor) -> Result<()> {
        if self.event_names.is_empty() {
            return Ok(());
        }
        self.note("Reading event definitions.");
        for k in 0..self.event_names.len() {
            let statement = cursor.next().ok_or_else(|| {
                CompileError::lexical("No more statements while reading event definitions.")
            })?;
            self.note(format!("Processing: {statement}"));
            let (lhs, rhs) = split_assignment(&statement)?;
            let position = self
                .event_names
                .iter()
                .position(|n| *n == lhs)
                .ok_or_else(|| CompileError::namespace(format!("{lhs} is not an event name.")))?;
            if position != k {
                return Err(CompileError::ordering("Event definitions in wrong order."));
            }

            let parts: Vec<&str> = rhs.split(':').map(str::trim).collect();
            match parts.len() {
                0 => return Err(CompileError::lexical("No rhs in event definition.")),
                1 => {
                    return Err(CompileError::lexical(
                        "Missing two arguments in event definition.",
                    ))
                }
                2 => {
                    return Err(CompileError::lexical(
                        "Missing one argument in event definition.",
                    ))
                }
                3 => {}
                _ => {
                    return Err(CompileError::lexical(
                        "Too many tokens in event definition.",
                    ))
                }
            }

            let condition = parse_str(parts[0], &self.scope, &self.registry)?;
            let target = parse_scalar(parts[1], &self.scope, &self.registry)?;
            let Expr::Leaf(target) = target else {
                return Err(CompileError::semantic(
                    "Event target must be variable or parameter.",
                ));
            };
            let value = parse_scalar(parts[2], &self.scope, &self.registry)?;

            self.events.push(Event {
                name: lhs,
                condition,
                target,
                value,
            });
        }
        Ok(())
    }

    fn read_dynamic_equations(&mut self, cursor: &mut StatementCursor) -> Result<()> {
        self.note("Reading dynamic equations.");
        let count = self.scope.variables.len() - self.process_names.len();
        for _ in 0..count {
            let statement = cursor
                .next()
                .ok_or_else(|| CompileError::ordering("Too few dynamic equations."))?;
            self.note(format!("Processing: {statement}"));
            let (lhs, rhs) = split_assignment(&statement)?;

            let Some(base) = lhs.strip_suffix(PRIME_SYMBOLS) else {
                return Err(CompileError::lexical(format!(
                    "{lhs} is not derivative of variable (prime symbol is not right)."
                )));
            };
            if !self.scope.variables.iter().any(|(n, _)| n == base) {
                return Err(CompileError::namespace(format!(
                    "{lhs} is not derivative of variable."
                )));
            }
            let index = self
                .scope
                .variables
                .iter()
                .position(|(n, _)| n == base)
                .expect("variable membership was just checked");
            if index != self.equations.len() {
                return Err(CompileError::ordering("Dynamic equations in wrong order."));
            }

            let rhs = parse_scalar(&rhs, &self.scope, &self.registry)?;
            self.note(format!("{base}'={}", rhs.render_infix(&self.registry)));
            self.equations.push(rhs);
        }
        Ok(())
    }

    fn read_inverse_equations(&mut self, cursor: &mut StatementCursor) -> Result<()> {
        self.note("Reading inverse dynamic equations.");
        let count = self.scope.variables.len() - self.process_names.len();
        for _ in 0..count {
            let statement = cursor
                .next()
                .ok_or_else(|| CompileError::ordering("Too few inverse equations."))?;
            self.note(format!("Processing: {statement}"));
            let (lhs, rhs) = split_assignment(&statement)?;

            let Some(base) = lhs.strip_suffix(INVERSE_SYMBOLS) else {
                return Err(CompileError::lexical(format!(
                    "{lhs} is not inverse function (inverse symbol is not right)."
                )));
            };
            if !self.scope.variables.iter().any(|(n, _)| n == base) {
                return Err(CompileError::namespace(format!(
                    "{lhs} is not inverse function."
                )));
            }
            let index = self
                .scope
                .variables
                .iter()
                .position(|(n, _)| n == base)
                .expect("variable membership was just checked");
            if index != self.inverse_equations.len() {
                return Err(CompileError::ordering("Inverse equations in wrong order."));
            }

            let rhs = parse_scalar(&rhs, &self.scope, &self.registry)?;
            self.note(format!("{base}~={}", rhs.render_infix(&self.registry)));
            self.inverse_equations.push(rhs);
        }
        Ok(())
    }

    fn read_initial_values(
        &mut self,
        cursor: &mut StatementCursor,
        block: ValueBlock,
    ) -> Result<Vec<f64>> {
        let (label, names): (&str, Vec<(String, SlotId)>) = match block {
            ValueBlock::State => {
                let n = self.scope.variables.len() - self.process_names.len();
                ("initial state", self.scope.variables[..n].to_vec())
            }
            ValueBlock::Parameter => ("initial parameter", self.scope.parameters.clone()),
        };
        self.note(format!("Reading {label} definitions."));

        let mut values = Vec::with_capacity(names.len());
        for (expected, id) in names.iter() {
            let statement = cursor.next().ok_or_else(|| {
                CompileError::lexical(format!(
                    "No more statements while reading {label} definitions."
                ))
            })?;
            self.note(format!("Processing: {statement}"));
            let (lhs, rhs) = split_assignment(&statement)?;
            if !names.iter().any(|(n, _)| *n == lhs) {
                return Err(CompileError::namespace(match block {
                    ValueBlock::State => format!("{lhs} is not a variable name."),
                    ValueBlock::Parameter => format!("{lhs} is not a parameter name."),
                }));
            }
            if lhs != *expected {
                return Err(CompileError::ordering(format!(
                    "Initial {} definitions in wrong order.",
                    match block {
                        ValueBlock::State => "state",
                        ValueBlock::Parameter => "parameter",
                    }
                )));
            }
            let value = self.eval_constant_rhs(&rhs)?;
            self.registry.set_value(*id, value);
            values.push(value);
            self.note(format!("{lhs}={value}"));
        }
        Ok(values)
    }

    fn read_ranges(
        &mut self,
        cursor: &mut StatementCursor,
        block: ValueBlock,
    ) -> Result<Vec<(f64, f64)>> {
        let (label, names): (&str, Vec<String>) = match block {
            ValueBlock::State => {
                let n = self.scope.variables.len() - self.process_names.len();
                (
                    "state range",
                    self.scope.variables[..n]
                        .iter()
                        .map(|(n, _)| n.clone())
                        .collect(),
                )
            }
            ValueBlock::Parameter => (
                "parameter range",
                self.scope.parameters.iter().map(|(n, _)| n.clone()).collect(),
            ),
        };
        self.note(format!("Reading {label} definitions."));

        let mut ranges = Vec::with_capacity(names.len());
        for expected in &names {
            let statement = cursor.next().ok_or_else(|| {
                CompileError::lexical(format!(
                    "No more statements while reading {label} definitions."
                ))
            })?;
            self.note(format!("Processing: {statement}"));
            let (lhs, rhs) = split_assignment(&statement)?;
            if !names.iter().any(|n| *n == lhs) {
                return Err(CompileError::namespace(match block {
                    ValueBlock::State => format!("{lhs} is not a variable name."),
                    ValueBlock::Parameter => format!("{lhs} is not a parameter name."),
                }));
            }
            if lhs != *expected {
                return Err(CompileError::ordering(format!(
                    "{} definitions in wrong order.",
                    match block {
                        ValueBlock::State => "Initial state range",
                        ValueBlock::Parameter => "Initial parameter range",
                    }
                )));
            }

            let separator = if rhs.contains(':') { ':' } else { ',' };
            let mut bounds = rhs.splitn(2, separator);
            let min = bounds.next().map(str::trim).unwrap_or("");
            let max = bounds.next().map(str::trim).ok_or_else(|| {
                CompileError::lexical("Encountered end of statement where separator was expected.")
            })?;
            if min.is_empty() {
                return Err(CompileError::lexical(
                    "Encountered empty minimum where range value was expected.",
                ));
            }
            let min = self.eval_constant_rhs(min)?;
            let max = self.eval_constant_rhs(max)?;
            ranges.push((min, max));
            self.note(format!("{min}<={lhs}<={max}"));
        }
        Ok(ranges)
    }

    /// For every declared stochastic process and every drift equation,
    /// locates the subtree carrying the process, factors its linear
    /// coefficient into the diffusion matrix and removes the term from the
    /// equation. A process that survives the sweep is non-linear and fatal.
    fn extract_diffusion(&mut self) -> Result<Vec<Vec<Expr>>> {
        self.note("Analyzing diffusion processes.");
        let process_slots: Vec<SlotId> = self
            .scope
            .variables
            .iter()
            .filter(|(n, _)| self.process_names.iter().any(|p| p == n))
            .map(|(_, id)| *id)
            .collect();

        let mut diffusion =
            vec![vec![Expr::Constant(0.0); process_slots.len()]; self.equations.len()];

        for i in 0..self.equations.len() {
            self.note(format!(
                "Analyzing {}",
                self.equations[i].render_infix(&self.registry)
            ));
            for (j, process) in process_slots.iter().enumerate() {
                let leaf = Expr::Leaf(*process);
                if !self.equations[i].contains(&leaf) {
                    continue;
                }
                let occurrences = self.equations[i]
                    .elements()
                    .into_iter()
                    .filter(|sub| **sub == leaf)
                    .count();
                let mut found: Option<(Expr, Expr)> = None;
                for sub in self.equations[i].elements() {
                    // The bare leaf only counts as a term of its own when it
                    // occurs exactly once; replacing it would otherwise wipe
                    // every other (non-linear) occurrence as well.
                    if *sub == leaf && occurrences > 1 {
                        continue;
                    }
                    if let Some(factor) = sub.factor(&leaf) {
                        found = Some((sub.clone(), factor));
                        break;
                    }
                }
                if let Some((sub, factor)) = found {
                    self.equations[i] = self.equations[i].replace(&sub, &Expr::Constant(0.0));
                    diffusion[i][j] = factor;
                    self.note(format!(
                        "diffusion({i},{j})={}",
                        diffusion[i][j].render_infix(&self.registry)
                    ));
                }
            }
        }

        let mut illegal = None;
        'sweep: for equation in &self.equations {
            for process in &process_slots {
                if equation.contains(&Expr::Leaf(*process)) {
                    illegal = Some(equation.render_infix(&self.registry));
                    break 'sweep;
                }
            }
        }
        if let Some(rendered) = illegal {
            self.note(format!("Illegal process found in {rendered}"));
            return Err(CompileError::semantic(format!(
                "Illegal process found in {rendered}"
            )));
        }

        for row in &mut diffusion {
            for entry in row.iter_mut() {
                for _ in 0..self.options.optimization_level {
                    *entry = entry.optimize(&self.registry);
                }
            }
        }

        // The processes were only variables for the duration of parsing.
        self.scope
            .variables
            .truncate(self.scope.variables.len() - self.process_names.len());

        Ok(diffusion)
    }

    fn optimize_everything(&mut self) {
        let level = self.options.optimization_level;
        if level > 0 {
            self.note(format!("Optimization level is {level}."));
        }

        for id in &self.aux_ids {
            let body = match &self.registry.auxiliary(*id).body {
                AuxBody::Scalar(e) => {
                    let mut e = e.clone();
                    for _ in 0..level {
                        e = e.optimize(&self.registry);
                    }
                    AuxBody::Scalar(e)
                }
                AuxBody::Truth(l) => {
                    let mut l = l.clone();
                    for _ in 0..level {
                        l = l.optimize(&self.registry);
                    }
                    AuxBody::Truth(l)
                }
            };
            self.registry.set_auxiliary_body(*id, body);
        }

        self.note("Dynamic equations:");
        for i in 0..self.equations.len() {
            for _ in 0..level {
                self.equations[i] = self.equations[i].optimize(&self.registry);
            }
            let name = self.scope.variables[i].0.clone();
            let rendered = self.equations[i].render_infix(&self.registry);
            self.note(format!("{name}'={rendered}"));
        }

        for i in 0..self.inverse_equations.len() {
            for _ in 0..level {
                self.inverse_equations[i] = self.inverse_equations[i].optimize(&self.registry);
            }
        }

        for event in &mut self.events {
            match &mut event.condition {
                ParsedExpr::Scalar(e) => {
                    for _ in 0..level {
                        *e = e.optimize(&self.registry);
                    }
                }
                ParsedExpr::Truth(l) => {
                    for _ in 0..level {
                        *l = l.optimize(&self.registry);
                    }
                }
            }
            for _ in 0..level {
                event.value = event.value.optimize(&self.registry);
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn classify(
        &mut self,
        has_parameters: bool,
    ) -> Result<(
        SystemClass,
        Option<Vec<Vec<Expr>>>,
        Option<Vec<Vec<Expr>>>,
        Option<SlotId>,
    )> {
        let mut differentiable = true;
        if !self.forced_differentiable {
            for equation in &self.equations {
                differentiable = differentiable && equation.is_differentiable(&self.registry);
            }
            for id in &self.aux_ids {
                differentiable = differentiable
                    && match &self.registry.auxiliary(*id).body {
                        AuxBody::Scalar(e) => e.is_differentiable(&self.registry),
                        AuxBody::Truth(_) => false,
                    };
            }
        }

        let parameter_differentiable =
            differentiable && has_parameters && !self.nondifferentiable;
        if differentiable {
            if self.nondifferentiable {
                self.note("System is differentiable but derivatives will not be generated.");
            } else {
                self.note("System is differentiable.");
            }
        } else {
            self.note("System is not differentiable.");
        }
        let differentiable = differentiable && !self.nondifferentiable;

        let mut jacobian = None;
        let mut parameter_jacobian = None;
        if differentiable {
            self.note("Computing Jacobi matrix.");
            let level = self.options.optimization_level;
            let variables = self.scope.variables.clone();
            let mut matrix = Vec::with_capacity(self.equations.len());
            for equation in &self.equations {
                if !equation.is_differentiable(&self.registry) {
                    return Err(CompileError::semantic(
                        "System is declared differentiable but isn't.",
                    ));
                }
                let mut row = Vec::with_capacity(variables.len());
                for (_, id) in &variables {
                    let mut entry = equation.diff(*id, &self.registry);
                    for _ in 0..level {
                        entry = entry.optimize(&self.registry);
                    }
                    row.push(entry);
                }
                matrix.push(row);
            }
            for (i, row) in matrix.iter().enumerate() {
                for (j, entry) in row.iter().enumerate() {
                    self.note(format!(
                        "d{}'/d{}={}",
                        variables[i].0,
                        variables[j].0,
                        entry.render_infix(&self.registry)
                    ));
                }
            }
            jacobian = Some(matrix);

            if has_parameters {
                self.note("System is parameter differentiable.");
                self.note("Computing parameter Jacobi matrix.");
                let parameters = self.scope.parameters.clone();
                let mut matrix = Vec::with_capacity(self.equations.len());
                for equation in &self.equations {
                    if !equation.is_differentiable(&self.registry) {
                        return Err(CompileError::semantic(
                            "System is declared differentiable but isn't parameter differentiable.",
                        ));
                    }
                    let mut row = Vec::with_capacity(parameters.len());
                    for (_, id) in &parameters {
                        let mut entry = equation.diff(*id, &self.registry);
                        for _ in 0..level {
                            entry = entry.optimize(&self.registry);
                        }
                        row.push(entry);
                    }
                    matrix.push(row);
                }
                parameter_jacobian = Some(matrix);
            }
        }

        let mut expandable = true;
        for equation in &self.equations {
            expandable = expandable && equation.is_expandable(&self.registry);
        }
        for id in &self.aux_ids {
            expandable = expandable
                && match &self.registry.auxiliary(*id).body {
                    AuxBody::Scalar(e) => e.is_expandable(&self.registry),
                    AuxBody::Truth(_) => false,
                };
        }
        if expandable {
            self.note("System is expandable.");
        } else {
            self.note("System is not expandable.");
        }

        let autonomous = self.detect_autonomous();
        let class = SystemClass {
            time: if self.time_discrete {
                TimeDomain::Discrete
            } else {
                TimeDomain::Continuous
            },
            autonomous,
            differentiable,
            parameter_differentiable,
            expandable,
            invertible: self.invertible,
            stochastic: self.stochastic,
            periodically_forced: self.periodically_forced,
            poincare_section: self.poincare_section,
        };
        Ok((class, jacobian, parameter_jacobian, self.scope.time))
    }

    /// The model is non-autonomous the moment any parsed tree mentions the
    /// reserved time identifier.
    fn detect_autonomous(&self) -> bool {
        let Some(time) = self.scope.time else {
            return true;
        };
        let leaf = Expr::Leaf(time);

        let in_equations = self.equations.iter().any(|e| e.contains(&leaf));
        let in_inverse = self.inverse_equations.iter().any(|e| e.contains(&leaf));
        let in_aux = self.registry.auxiliaries().iter().any(|aux| match &aux.body {
            AuxBody::Scalar(e) => e.contains(&leaf),
            AuxBody::Truth(l) => l.contains(&leaf),
        });
        let in_functions = self.scope.functions.iter().any(|f| f.body.contains(&leaf));
        let in_events = self.events.iter().any(|event| {
            let in_condition = match &event.condition {
                ParsedExpr::Scalar(e) => e.contains(&leaf),
                ParsedExpr::Truth(l) => l.contains(&leaf),
            };
            in_condition || event.value.contains(&leaf)
        });

        !(in_equations || in_inverse || in_aux || in_functions || in_events)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueBlock {
    State,
    Parameter,
}

struct StatementCursor<'a> {
    statements: &'a [String],
    index: usize,
}

impl<'a> StatementCursor<'a> {
    fn new(statements: &'a [String]) -> Self {
        Self {
            statements,
            index: 0,
        }
    }

    fn next(&mut self) -> Option<String> {
        let statement = self.statements.get(self.index)?;
        self.index += 1;
        Some(statement.clone())
    }

    fn peek_keyword(&self) -> Option<&str> {
        self.statements
            .get(self.index)
            .and_then(|s| s.split_whitespace().next())
    }
}

fn split_names(statement: &str) -> Vec<String> {
    statement
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Splits `lhs = rhs` on the first `=`; the left side has every space
/// removed so `x ' = ...` and `x'=...` read the same.
fn split_assignment(statement: &str) -> Result<(String, String)> {
    let position = statement.find('=').ok_or_else(|| {
        CompileError::lexical(format!("No = found in definition: {statement}"))
    })?;
    let lhs: String = statement[..position]
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let rhs = statement[position + 1..].trim().to_string();
    if rhs.is_empty() {
        return Err(CompileError::lexical(format!(
            "No right hand side in definition: {statement}"
        )));
    }
    Ok((lhs, rhs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        assert!(
            err.message.contains(needle),
            "expected error to contain \"{needle}\", got \"{}\"",
            err.message
        );
    }

    #[test]
    fn minimal_ode_compiles_and_classifies() {
        let mut model = compile(
            "type ode, stateinitializer;
             variable x;
             x' = x;
             x = 1;",
        )
        .expect("model should compile");

        assert_eq!(model.dimension(), 1);
        assert_eq!(model.class.time, TimeDomain::Continuous);
        assert!(model.class.autonomous);
        assert!(model.class.differentiable);
        assert!(model.class.expandable);
        assert!(!model.class.invertible);
        assert_eq!(model.initial_state, Some(vec![1.0]));

        let rhs = model.eval_rhs(&[1.0], 0.0);
        assert_eq!(rhs, vec![1.0]);
    }

    #[test]
    fn jacobian_is_computed_and_evaluates() {
        let mut model = compile(
            "type ode;
             variable x, y;
             parameter a;
             x' = a*x + y;
             y' = x*y;",
        )
        .expect("model should compile");

        let a = model.parameters[0];
        model.registry.set_value(a, 2.0);
        let jacobian = model
            .jacobian_at(&[3.0, 5.0], 0.0)
            .expect("differentiable model has a Jacobian");
        // d(ax+y)/dx = a, d(ax+y)/dy = 1, d(xy)/dx = y, d(xy)/dy = x
        assert_eq!(jacobian[(0, 0)], 2.0);
        assert_eq!(jacobian[(0, 1)], 1.0);
        assert_eq!(jacobian[(1, 0)], 5.0);
        assert_eq!(jacobian[(1, 1)], 3.0);

        let pj = model
            .parameter_jacobian_at(&[3.0, 5.0], 0.0)
            .expect("parameter Jacobian exists");
        assert_eq!(pj[(0, 0)], 3.0); // d(ax+y)/da = x
        assert_eq!(pj[(1, 0)], 0.0);
    }

    #[test]
    fn name_collisions_fail_compilation() {
        assert_err_contains(
            compile(
                "type ode;
                 variable x;
                 parameter x;
                 x' = x;",
            ),
            "in use as a variable name",
        );
    }

    #[test]
    fn reserved_names_are_rejected() {
        assert_err_contains(
            compile(
                "type ode;
                 variable sin;
                 sin' = 1;",
            ),
            "reserved name",
        );
    }

    #[test]
    fn definitions_out_of_order_fail() {
        assert_err_contains(
            compile(
                "type ode;
                 variable x;
                 auxiliary u, v;
                 v = 1;
                 u = 2;
                 x' = x;",
            ),
            "wrong order",
        );

        assert_err_contains(
            compile(
                "type ode;
                 variable x, y;
                 y' = x;
                 x' = y;",
            ),
            "wrong order",
        );
    }

    #[test]
    fn missing_type_statement_fails() {
        assert_err_contains(
            compile("variable x; x' = x;"),
            "not a type statement",
        );
        assert_err_contains(
            compile("type invertible; variable x; x' = x;"),
            "neither discrete",
        );
    }

    #[test]
    fn incomplete_inverse_set_fails() {
        assert_err_contains(
            compile(
                "type map, invertible;
                 variable x, y;
                 x' = y;
                 y' = x;
                 x~ = y;",
            ),
            "Too few inverse equations",
        );
    }

    #[test]
    fn invertible_map_roundtrips() {
        let mut model = compile(
            "type map, invertible;
             variable x;
             parameter a;
             x' = a*x;
             x~ = x/a;",
        )
        .expect("model should compile");
        assert!(model.class.invertible);

        let a = model.parameters[0];
        model.registry.set_value(a, 4.0);
        let forward = model.eval_rhs(&[2.0], 0.0);
        assert_eq!(forward, vec![8.0]);
        let back = model
            .eval_inverse(&forward, 0.0)
            .expect("inverse equations exist");
        assert_eq!(back, vec![2.0]);
    }

    #[test]
    fn time_reference_makes_the_system_nonautonomous() {
        let model = compile(
            "type ode;
             variable x;
             x' = sin(t);",
        )
        .expect("model should compile");
        assert!(!model.class.autonomous);
        assert!(model.class.differentiable);
    }

    #[test]
    fn discrete_systems_use_the_step_counter() {
        let model = compile(
            "type map;
             variable x;
             x' = x + n;",
        )
        .expect("model should compile");
        assert_eq!(model.class.time, TimeDomain::Discrete);
        assert!(!model.class.autonomous);
    }

    #[test]
    fn constants_and_auxiliaries_resolve_in_order() {
        let mut model = compile(
            "type ode;
             variable x;
             constant c;
             auxiliary u;
             c = 2*pi;
             u = c*x;
             x' = u;",
        )
        .expect("model should compile");

        let c = model
            .constants
            .iter()
            .find(|(n, _)| n == "c")
            .map(|(_, v)| *v)
            .expect("constant c is defined");
        assert!((c - 2.0 * PI).abs() < 1e-12);

        let rhs = model.eval_rhs(&[1.0], 0.0);
        assert!((rhs[0] - 2.0 * PI).abs() < 1e-12);
    }

    #[test]
    fn sde_diffusion_extraction() {
        let mut model = compile(
            "type sde;
             variable x;
             process w;
             parameter s;
             x' = -x + s*w;",
        )
        .expect("model should compile");

        assert!(model.class.stochastic);
        assert_eq!(model.dimension(), 1);
        let s = model.parameters[0];
        model.registry.set_value(s, 0.5);

        // The drift lost its stochastic term.
        let rhs = model.eval_rhs(&[2.0], 0.0);
        assert_eq!(rhs, vec![-2.0]);

        let diffusion = model
            .diffusion_at(&[2.0], 0.0)
            .expect("stochastic model has a diffusion matrix");
        assert_eq!(diffusion[(0, 0)], 0.5);
    }

    #[test]
    fn nonlinear_process_is_fatal() {
        assert_err_contains(
            compile(
                "type sde;
                 variable x;
                 process w;
                 x' = -x + w*w;",
            ),
            "Illegal process",
        );
    }

    #[test]
    fn nondifferentiable_declaration_suppresses_jacobians() {
        let model = compile(
            "type ode, nondifferentiable;
             variable x;
             x' = x;",
        )
        .expect("model should compile");
        assert!(!model.class.differentiable);
        assert!(model.jacobian.is_none());
    }

    #[test]
    fn forced_differentiable_that_is_not_fails() {
        assert_err_contains(
            compile(
                "type ode, differentiable;
                 variable x;
                 x' = clip(x, 0, 1, x);",
            ),
            "declared differentiable but isn't",
        );
    }

    #[test]
    fn abs_makes_expandability_fail_but_not_differentiability() {
        let model = compile(
            "type ode;
             variable x;
             x' = abs(x);",
        )
        .expect("model should compile");
        assert!(model.class.differentiable);
        assert!(!model.class.expandable);
    }

    #[test]
    fn user_functions_apply_in_equations() {
        let mut model = compile(
            "type ode;
             variable x;
             function f;
             f(u) = u*u + 1;
             x' = f(x);",
        )
        .expect("model should compile");
        let rhs = model.eval_rhs(&[3.0], 0.0);
        assert_eq!(rhs, vec![10.0]);
    }

    #[test]
    fn events_are_parsed_and_optimized() {
        let model = compile(
            "type map, event;
             variable x;
             parameter a;
             event kick;
             kick = gt(x, 1+1) : a : 0;
             x' = a*x;",
        )
        .expect("model should compile");
        assert_eq!(model.events.len(), 1);
        let event = &model.events[0];
        assert_eq!(event.name, "kick");
        match &event.condition {
            ParsedExpr::Truth(_) => {}
            other => panic!("expected logical condition, got {other:?}"),
        }
        assert_eq!(model.registry.kind(event.target), crate::registry::SlotKind::Parameter);
    }

    #[test]
    fn period_auxiliary_marks_forcing() {
        let model = compile(
            "type ode;
             variable x;
             auxiliary period;
             period = 2*pi;
             x' = sin(t)*x;",
        )
        .expect("model should compile");
        assert!(model.class.periodically_forced);
        assert!(!model.class.autonomous);
    }

    #[test]
    fn transcript_reports_the_passes() {
        let model = compile(
            "type ode;
             variable x;
             x' = x;",
        )
        .expect("model should compile");
        for needle in [
            "Compilation starting.",
            "Variable x added.",
            "Reading dynamic equations.",
            "Computing Jacobi matrix.",
            "Compilation done.",
        ] {
            assert!(
                model.information.contains(needle),
                "transcript is missing {needle:?}"
            );
        }
    }

    #[test]
    fn ranges_are_read_in_declaration_order() {
        let model = compile(
            "type map, staterangeinitializer;
             variable x, y;
             x' = y;
             y' = x;
             x = -1 : 1;
             y = 0 : 10;",
        )
        .expect("model should compile");
        assert_eq!(model.state_ranges, Some(vec![(-1.0, 1.0), (0.0, 10.0)]));
    }
}
