use crate::traits::{lift, Scalar};
use std::collections::HashMap;
use thiserror::Error;

/// Single-argument functions understood by the parser.
pub const BUILTIN_FUNCTIONS: &[&str] = &[
    "sin", "cos", "tan", "asin", "acos", "atan", "sinh", "cosh", "tanh", "exp", "ln", "log",
    "sqrt", "abs",
];

/// Named constants understood by the parser.
pub const BUILTIN_CONSTANTS: &[(&str, f64)] =
    &[("pi", std::f64::consts::PI), ("e", std::f64::consts::E)];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("expression is empty")]
    Empty,
    #[error("unexpected token '{token}' at position {position}")]
    UnexpectedToken { token: String, position: usize },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("expected ')'")]
    UnclosedParen,
    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
}

/// OpCodes for the stack machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant.
    LoadConst(f64),
    /// Pushes an independent variable by index.
    LoadVar(usize),
    /// Pushes a named value (parameter or previously evaluated entity) by slot index.
    LoadParam(usize),
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
    Call(Function),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Ln,
    Log10,
    Sqrt,
    Abs,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        let f = match name {
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "asin" => Function::Asin,
            "acos" => Function::Acos,
            "atan" => Function::Atan,
            "sinh" => Function::Sinh,
            "cosh" => Function::Cosh,
            "tanh" => Function::Tanh,
            "exp" => Function::Exp,
            "ln" => Function::Ln,
            "log" => Function::Log10,
            "sqrt" => Function::Sqrt,
            "abs" => Function::Abs,
            _ => return None,
        };
        Some(f)
    }

    fn apply<T: Scalar>(self, a: T) -> T {
        match self {
            Function::Sin => a.sin(),
            Function::Cos => a.cos(),
            Function::Tan => a.tan(),
            Function::Asin => a.asin(),
            Function::Acos => a.acos(),
            Function::Atan => a.atan(),
            Function::Sinh => a.sinh(),
            Function::Cosh => a.cosh(),
            Function::Tanh => a.tanh(),
            Function::Exp => a.exp(),
            Function::Ln => a.ln(),
            Function::Log10 => a.log10(),
            Function::Sqrt => a.sqrt(),
            Function::Abs => a.abs(),
        }
    }
}

/// A compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

/// Stateless stack machine.
///
/// Bytecode produced by [`Compiler`] is always balanced, so the stack never underflows;
/// malformed hand-built bytecode evaluates to NaN instead of panicking.
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(bytecode: &Bytecode, vars: &[T], params: &[T], stack: &mut Vec<T>) -> T {
        stack.clear();

        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(val) => stack.push(lift(val)),
                OpCode::LoadVar(idx) => stack.push(vars.get(idx).copied().unwrap_or_else(T::nan)),
                OpCode::LoadParam(idx) => {
                    stack.push(params.get(idx).copied().unwrap_or_else(T::nan))
                }
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => {
                    let b = pop(stack);
                    let a = pop(stack);
                    stack.push(match op {
                        OpCode::Add => a + b,
                        OpCode::Sub => a - b,
                        OpCode::Mul => a * b,
                        OpCode::Div => a / b,
                        _ => a.powf(b),
                    });
                }
                OpCode::Neg => {
                    let a = pop(stack);
                    stack.push(-a);
                }
                OpCode::Call(f) => {
                    let a = pop(stack);
                    stack.push(f.apply(a));
                }
            }
        }

        pop(stack)
    }
}

fn pop<T: Scalar>(stack: &mut Vec<T>) -> T {
    stack.pop().unwrap_or_else(T::nan)
}

// --- AST & Compiler ---

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>),
    Unary(char, Box<Expr>),
    Call(String, Box<Expr>),
}

impl Expr {
    /// Identifiers the expression reads, excluding function names, in first-use order.
    pub fn identifiers(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_identifiers(&mut out);
        out
    }

    fn collect_identifiers(&self, out: &mut Vec<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Variable(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Binary(left, _, right) => {
                left.collect_identifiers(out);
                right.collect_identifiers(out);
            }
            Expr::Unary(_, operand) | Expr::Call(_, operand) => operand.collect_identifiers(out),
        }
    }
}

/// Compiles an [`Expr`] into [`Bytecode`], resolving names to variable and parameter slots.
/// Variables shadow parameters; built-in constants are used only when neither matches.
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
    pub param_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new<S: AsRef<str>>(var_names: &[S], param_names: &[S]) -> Self {
        let index = |names: &[S]| {
            names
                .iter()
                .enumerate()
                .map(|(i, name)| (name.as_ref().to_string(), i))
                .collect::<HashMap<_, _>>()
        };
        Self {
            var_map: index(var_names),
            param_map: index(param_names),
        }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode, ExpressionError> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<(), ExpressionError> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                if let Some(&idx) = self.var_map.get(name) {
                    ops.push(OpCode::LoadVar(idx));
                } else if let Some(&idx) = self.param_map.get(name) {
                    ops.push(OpCode::LoadParam(idx));
                } else if let Some((_, value)) = BUILTIN_CONSTANTS.iter().find(|(c, _)| c == name) {
                    ops.push(OpCode::LoadConst(*value));
                } else {
                    return Err(ExpressionError::UnknownIdentifier(name.clone()));
                }
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    _ => OpCode::Pow,
                });
            }
            Expr::Unary(_, operand) => {
                self.compile_recursive(operand, ops)?;
                ops.push(OpCode::Neg);
            }
            Expr::Call(func, arg) => {
                let f = Function::lookup(func)
                    .ok_or_else(|| ExpressionError::UnknownFunction(func.clone()))?;
                self.compile_recursive(arg, ops)?;
                ops.push(OpCode::Call(f));
            }
        }
        Ok(())
    }
}

/// Parses and compiles in one go.
pub fn compile<S: AsRef<str>>(
    source: &str,
    var_names: &[S],
    param_names: &[S],
) -> Result<Bytecode, ExpressionError> {
    let expr = parse(source)?;
    Compiler::new(var_names, param_names).compile(&expr)
}

// --- Parser ---

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ExpressionError::Empty);
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    match parser.tokens.get(parser.pos) {
        None => Ok(expr),
        Some((token, position)) => Err(ExpressionError::UnexpectedToken {
            token: token.to_string(),
            position: *position,
        }),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Op(char),
    LParen,
    RParen,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{n}"),
            Token::Identifier(s) => write!(f, "{s}"),
            Token::Op(c) => write!(f, "{c}"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || c == '.' {
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            // Decimal exponent: 1e-3, 2.5E+4
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    while j < chars.len() && chars[j].is_ascii_digit() {
                        j += 1;
                    }
                    i = j;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let value = text.parse::<f64>().map_err(|_| ExpressionError::UnexpectedToken {
                token: text.clone(),
                position: start,
            })?;
            tokens.push((Token::Number(value), start));
        } else if c.is_alphabetic() || c == '_' {
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push((Token::Identifier(chars[start..i].iter().collect()), start));
        } else {
            let token = match c {
                '+' | '-' | '*' | '/' | '^' => Token::Op(c),
                '(' => Token::LParen,
                ')' => Token::RParen,
                _ => {
                    return Err(ExpressionError::UnexpectedToken {
                        token: c.to_string(),
                        position: start,
                    })
                }
            };
            tokens.push((token, start));
            i += 1;
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn consume(&mut self) -> Option<(Token, usize)> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_expression(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_product()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.consume();
            let right = self.parse_product()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_product(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek().cloned() {
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    // Unary minus binds looser than '^': -x^2 == -(x^2)
    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.consume();
                Ok(Expr::Unary('-', Box::new(self.parse_unary()?)))
            }
            Some(Token::Op('+')) => {
                self.consume();
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    // Right associative: 2^3^2 == 2^(3^2)
    fn parse_power(&mut self) -> Result<Expr, ExpressionError> {
        let base = self.parse_primary()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.consume() {
            Some((Token::Number(n), _)) => Ok(Expr::Number(n)),
            Some((Token::Identifier(name), _)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let arg = self.parse_expression()?;
                    self.expect_close()?;
                    Ok(Expr::Call(name, Box::new(arg)))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some((Token::LParen, _)) => {
                let expr = self.parse_expression()?;
                self.expect_close()?;
                Ok(expr)
            }
            Some((token, position)) => Err(ExpressionError::UnexpectedToken {
                token: token.to_string(),
                position,
            }),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }

    fn expect_close(&mut self) -> Result<(), ExpressionError> {
        match self.consume() {
            Some((Token::RParen, _)) => Ok(()),
            _ => Err(ExpressionError::UnclosedParen),
        }
    }
}

// --- Program ---

/// One compiled definition inside a [`Program`]: evaluates `code` and stores the
/// result in `slot`.
#[derive(Debug, Clone)]
struct Step {
    slot: usize,
    code: Bytecode,
}

/// An ordered chain of compiled definitions sharing one slot table.
///
/// Slots `0..inputs` are supplied by the caller; every later slot is produced by a step
/// that may read any earlier slot. The program's value is the last step's slot.
#[derive(Debug, Clone)]
pub struct Program {
    inputs: usize,
    slot_names: Vec<String>,
    steps: Vec<Step>,
}

impl Program {
    pub fn input_count(&self) -> usize {
        self.inputs
    }

    pub fn slot_names(&self) -> &[String] {
        &self.slot_names
    }

    pub fn run<T: Scalar>(&self, vars: &[T], inputs: &[T], stack: &mut Vec<T>) -> T {
        let mut slots: Vec<T> = Vec::with_capacity(self.slot_names.len());
        slots.extend(inputs.iter().copied().take(self.inputs));
        slots.resize(self.inputs, T::nan());
        let mut last = T::nan();
        for step in &self.steps {
            last = VM::execute(&step.code, vars, &slots, stack);
            debug_assert_eq!(step.slot, slots.len());
            slots.push(last);
        }
        last
    }
}

/// Builds a [`Program`]: declare all inputs first, then definitions in dependency order.
#[derive(Debug)]
pub struct ProgramBuilder {
    var_names: Vec<String>,
    slot_names: Vec<String>,
    inputs: usize,
    steps: Vec<Step>,
}

impl ProgramBuilder {
    pub fn new(var_names: &[String]) -> Self {
        Self {
            var_names: var_names.to_vec(),
            slot_names: Vec::new(),
            inputs: 0,
            steps: Vec::new(),
        }
    }

    pub fn input(&mut self, name: &str) -> &mut Self {
        debug_assert!(self.steps.is_empty(), "inputs must precede definitions");
        self.slot_names.push(name.to_string());
        self.inputs += 1;
        self
    }

    /// Compiles `source` against the variables and every slot declared so far.
    pub fn define(&mut self, name: &str, source: &str) -> Result<&mut Self, ExpressionError> {
        let code = compile(source, &self.var_names, &self.slot_names)?;
        self.steps.push(Step {
            slot: self.slot_names.len(),
            code,
        });
        self.slot_names.push(name.to_string());
        Ok(self)
    }

    pub fn build(self) -> Program {
        Program {
            inputs: self.inputs,
            slot_names: self.slot_names,
            steps: self.steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::Dual;

    fn eval(source: &str, vars: &[(&str, f64)], params: &[(&str, f64)]) -> f64 {
        let var_names: Vec<&str> = vars.iter().map(|(n, _)| *n).collect();
        let param_names: Vec<&str> = params.iter().map(|(n, _)| *n).collect();
        let code = compile(source, &var_names, &param_names).expect("compiles");
        let var_values: Vec<f64> = vars.iter().map(|(_, v)| *v).collect();
        let param_values: Vec<f64> = params.iter().map(|(_, v)| *v).collect();
        VM::execute(&code, &var_values, &param_values, &mut Vec::new())
    }

    #[test]
    fn precedence_and_associativity() {
        assert_eq!(eval("1 + 2 * 3", &[], &[]), 7.0);
        assert_eq!(eval("(1 + 2) * 3", &[], &[]), 9.0);
        assert_eq!(eval("2 ^ 3 ^ 2", &[], &[]), 512.0);
        assert_eq!(eval("-2 ^ 2", &[], &[]), -4.0);
        assert_eq!(eval("8 / 4 / 2", &[], &[]), 1.0);
        assert_eq!(eval("10 - 4 - 3", &[], &[]), 3.0);
    }

    #[test]
    fn names_functions_and_constants() {
        let value = eval("a * sin(x) + sqrt(b)", &[("x", 0.0)], &[("a", 3.0), ("b", 16.0)]);
        assert_eq!(value, 4.0);
        assert!((eval("cos(pi)", &[], &[]) + 1.0).abs() < 1e-15);
        assert!((eval("ln(e)", &[], &[]) - 1.0).abs() < 1e-15);
        assert_eq!(eval("1.5e2 + 2E-1", &[], &[]), 150.2);
    }

    #[test]
    fn variables_shadow_parameters() {
        assert_eq!(eval("x", &[("x", 1.0)], &[("x", 2.0)]), 1.0);
    }

    #[test]
    fn reports_malformed_expressions() {
        assert_eq!(parse(""), Err(ExpressionError::Empty));
        assert_eq!(parse("1 +"), Err(ExpressionError::UnexpectedEnd));
        assert_eq!(parse("(1 + 2"), Err(ExpressionError::UnclosedParen));
        assert!(matches!(parse("1 2"), Err(ExpressionError::UnexpectedToken { .. })));
        assert!(matches!(parse("a = 2"), Err(ExpressionError::UnexpectedToken { position: 2, .. })));
        assert_eq!(
            compile::<&str>("foo(1)", &[], &[]),
            Err(ExpressionError::UnknownFunction("foo".into()))
        );
        assert_eq!(
            compile::<&str>("q + 1", &[], &[]),
            Err(ExpressionError::UnknownIdentifier("q".into()))
        );
    }

    #[test]
    fn identifiers_skip_function_names() {
        let expr = parse("a * sin(x) + a / b").unwrap();
        assert_eq!(expr.identifiers(), vec!["a", "x", "b"]);
    }

    #[test]
    fn program_chains_definitions() {
        let mut builder = ProgramBuilder::new(&["x".to_string()]);
        builder.input("k");
        builder.define("c", "2 * k").unwrap();
        builder.define("f", "c * x + 1").unwrap();
        let program = builder.build();
        assert_eq!(program.input_count(), 1);
        assert_eq!(program.slot_names(), &["k", "c", "f"]);

        let value = program.run(&[3.0], &[5.0], &mut Vec::new());
        assert_eq!(value, 31.0);

        // d/dk (2k x + 1) = 2x
        let dual = program.run(&[Dual::constant(3.0)], &[Dual::new(5.0, 1.0)], &mut Vec::new());
        assert_eq!(dual.eps, 6.0);
    }

    #[test]
    fn program_rejects_forward_references() {
        let mut builder = ProgramBuilder::new(&[]);
        assert!(builder.define("c", "later + 1").is_err());
    }
}
