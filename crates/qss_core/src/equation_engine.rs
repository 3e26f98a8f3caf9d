use crate::error::DerivativeError;
use crate::time::Time;
use crate::traits::DerivativeFunction;
use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;

/// OpCodes for the stack-based virtual machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant value onto the stack.
    LoadConst(f64),
    /// Pushes the value of a state variable (by index) onto the stack.
    /// Indices follow the order variables were declared (e.g., 0=x, 1=y).
    LoadVar(usize),
    /// Pushes the value of an input variable (by index) onto the stack.
    LoadInput(usize),
    /// Pushes the value of a parameter (by index) onto the stack.
    LoadParam(usize),
    /// Pushes the simulation time.
    LoadTime,
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    Sin,
    Cos,
    Exp,
    /// Natural logarithm.
    Ln,
    Sqrt,
    Abs,
    /// Pops top value (a), pushes -a.
    Neg,
}

impl OpCode {
    /// Net change in stack depth.
    fn stack_effect(self) -> isize {
        match self {
            OpCode::LoadConst(_)
            | OpCode::LoadVar(_)
            | OpCode::LoadInput(_)
            | OpCode::LoadParam(_)
            | OpCode::LoadTime => 1,
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => -1,
            OpCode::Sin
            | OpCode::Cos
            | OpCode::Exp
            | OpCode::Ln
            | OpCode::Sqrt
            | OpCode::Abs
            | OpCode::Neg => 0,
        }
    }
}

/// A compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }
}

/// Everything an expression can read while it runs.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub time: f64,
    pub vars: &'a [f64],
    pub inputs: &'a [f64],
    pub params: &'a [f64],
}

/// Stack-based virtual machine for evaluating compiled equations.
///
/// The VM is stateless; `execute` takes the bytecode, the values it reads
/// and a reusable stack buffer, and returns the value left on the stack.
pub struct VM;

impl VM {
    pub fn execute(bytecode: &Bytecode, frame: Frame<'_>, stack: &mut Vec<f64>) -> f64 {
        stack.clear();

        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(val) => stack.push(val),
                OpCode::LoadVar(idx) => stack.push(frame.vars[idx]),
                OpCode::LoadInput(idx) => stack.push(frame.inputs[idx]),
                OpCode::LoadParam(idx) => stack.push(frame.params[idx]),
                OpCode::LoadTime => stack.push(frame.time),
                OpCode::Add => binary(stack, |a, b| a + b),
                OpCode::Sub => binary(stack, |a, b| a - b),
                OpCode::Mul => binary(stack, |a, b| a * b),
                OpCode::Div => binary(stack, |a, b| a / b),
                OpCode::Pow => binary(stack, f64::powf),
                OpCode::Sin => unary(stack, f64::sin),
                OpCode::Cos => unary(stack, f64::cos),
                OpCode::Exp => unary(stack, f64::exp),
                OpCode::Ln => unary(stack, f64::ln),
                OpCode::Sqrt => unary(stack, f64::sqrt),
                OpCode::Abs => unary(stack, f64::abs),
                OpCode::Neg => unary(stack, |a| -a),
            }
        }

        // Compiled bytecode leaves exactly one value; anything else reads as NaN.
        stack.pop().unwrap_or(f64::NAN)
    }
}

fn binary(stack: &mut Vec<f64>, op: impl Fn(f64, f64) -> f64) {
    let b = stack.pop().unwrap_or(f64::NAN);
    let a = stack.pop().unwrap_or(f64::NAN);
    stack.push(op(a, b));
}

fn unary(stack: &mut Vec<f64>, op: impl Fn(f64) -> f64) {
    let a = stack.pop().unwrap_or(f64::NAN);
    stack.push(op(a));
}

// --- AST & Parser ---

/// Abstract syntax tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>), // char is operator +, -, *, /, ^
    Unary(char, Box<Expr>),             // -
    Call(String, Box<Expr>),            // functions like sin(x)
}

/// Name of the simulation time inside equations.
pub const TIME_NAME: &str = "t";

/// Compiles an `Expr` into `Bytecode`, resolving names to indices.
///
/// Lookup order is state variables, input variables, parameters, then the
/// time `t`, so a variable named `t` shadows the time.
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
    pub input_map: HashMap<String, usize>,
    pub param_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(var_names: &[String], param_names: &[String]) -> Self {
        Self::with_inputs(var_names, &[], param_names)
    }

    pub fn with_inputs(var_names: &[String], input_names: &[String], param_names: &[String]) -> Self {
        let index = |names: &[String]| {
            names
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), i))
                .collect::<HashMap<_, _>>()
        };
        Self {
            var_map: index(var_names),
            input_map: index(input_names),
            param_map: index(param_names),
        }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        let depth = ops.iter().map(|op| op.stack_effect()).sum::<isize>();
        if depth != 1 {
            bail!("Compiled expression leaves {depth} values on the stack");
        }
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<()> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                if let Some(&idx) = self.var_map.get(name) {
                    ops.push(OpCode::LoadVar(idx));
                } else if let Some(&idx) = self.input_map.get(name) {
                    ops.push(OpCode::LoadInput(idx));
                } else if let Some(&idx) = self.param_map.get(name) {
                    ops.push(OpCode::LoadParam(idx));
                } else if name == TIME_NAME {
                    ops.push(OpCode::LoadTime);
                } else {
                    bail!("Unknown variable or parameter: {}", name);
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
                    '^' => OpCode::Pow,
                    _ => bail!("Unknown binary operator: {}", op),
                });
            }
            Expr::Unary(op, operand) => {
                self.compile_recursive(operand, ops)?;
                match op {
                    '-' => ops.push(OpCode::Neg),
                    _ => bail!("Unknown unary operator: {}", op),
                }
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, ops)?;
                ops.push(match func.as_str() {
                    "sin" => OpCode::Sin,
                    "cos" => OpCode::Cos,
                    "exp" => OpCode::Exp,
                    "ln" | "log" => OpCode::Ln,
                    "sqrt" => OpCode::Sqrt,
                    "abs" => OpCode::Abs,
                    _ => bail!("Unknown function: {}", func),
                });
            }
        }
        Ok(())
    }
}

// --- Simple Parser ---

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    if let Some(token) = parser.peek() {
        bail!("Unexpected trailing token {:?} in '{}'", token, input);
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                let exponent_sign = (d == '-' || d == '+') && num_str.ends_with(['e', 'E']);
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                    num_str.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| anyhow!("Invalid number literal '{}'", num_str))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            tokens.push(match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                _ => bail!("Unexpected character '{}'", c),
            });
            chars.next();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_rparen(&mut self) -> Result<()> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => bail!("Expected ')'"),
        }
    }

    fn parse_expression(&mut self) -> Result<Expr> {
        let mut left = self.parse_product()?;

        while let Some(op) = self.peek().and_then(|token| match token {
            Token::Plus => Some('+'),
            Token::Minus => Some('-'),
            _ => None,
        }) {
            self.consume();
            let right = self.parse_product()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_product(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;

        while let Some(op) = self.peek().and_then(|token| match token {
            Token::Star => Some('*'),
            Token::Slash => Some('/'),
            _ => None,
        }) {
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    /// Unary minus binds looser than `^`, so `-x^2` is `-(x^2)`.
    fn parse_unary(&mut self) -> Result<Expr> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary('-', Box::new(expr)));
        }
        self.parse_power()
    }

    /// `^` is right-associative.
    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume(); // eat '('
                    let arg = self.parse_expression()?;
                    self.expect_rparen()?;
                    Ok(Expr::Call(name, Box::new(arg)))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            Some(token) => bail!("Unexpected token {:?}", token),
            None => bail!("Unexpected end of expression"),
        }
    }
}

// --- EquationSystem ---

/// A derivative function made of one compiled expression per state
/// variable, evaluated by the VM.
#[derive(Debug, Clone)]
pub struct EquationSystem {
    pub equations: Vec<Bytecode>,
    pub params: Vec<f64>,
    input_count: usize,
    event_indicator_count: usize,
    stack: Vec<f64>,
}

impl EquationSystem {
    pub fn new(equations: Vec<Bytecode>, params: Vec<f64>) -> Self {
        Self {
            equations,
            params,
            input_count: 0,
            event_indicator_count: 0,
            stack: Vec::with_capacity(64),
        }
    }

    /// Parses and compiles `equations[i]` as `d(var_names[i])/dt`.
    pub fn compile(
        equations: &[String],
        var_names: &[String],
        input_names: &[String],
        param_names: &[String],
        params: Vec<f64>,
    ) -> Result<Self> {
        if equations.len() != var_names.len() {
            bail!(
                "Expected one equation per variable; got {} equations for {} variables",
                equations.len(),
                var_names.len()
            );
        }
        if params.len() != param_names.len() {
            bail!(
                "Expected {} parameter values; got {}",
                param_names.len(),
                params.len()
            );
        }
        let compiler = Compiler::with_inputs(var_names, input_names, param_names);
        let bytecodes = equations
            .iter()
            .zip(var_names)
            .map(|(equation, name)| {
                let expr = parse(equation).map_err(|e| e.context(format!("in equation for {name}")))?;
                compiler
                    .compile(&expr)
                    .map_err(|e| e.context(format!("in equation for {name}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut system = Self::new(bytecodes, params);
        system.input_count = input_names.len();
        Ok(system)
    }

    /// Declares event indicators, which switches the higher-order methods
    /// to their extra derivative samples.
    pub fn with_event_indicators(mut self, count: usize) -> Self {
        self.event_indicator_count = count;
        self
    }
}

impl DerivativeFunction for EquationSystem {
    fn state_count(&self) -> usize {
        self.equations.len()
    }

    fn input_variable_count(&self) -> usize {
        self.input_count
    }

    fn event_indicator_count(&self) -> usize {
        self.event_indicator_count
    }

    fn evaluate(
        &mut self,
        time: Time,
        states: &[f64],
        inputs: &[f64],
        derivatives: &mut [f64],
    ) -> Result<(), DerivativeError> {
        let frame = Frame {
            time: time.value(),
            vars: states,
            inputs,
            params: &self.params,
        };
        for (index, (out, eq)) in derivatives.iter_mut().zip(&self.equations).enumerate() {
            let value = VM::execute(eq, frame, &mut self.stack);
            if !value.is_finite() {
                return Err(DerivativeError::NonFinite { index, value });
            }
            *out = value;
        }
        Ok(())
    }
}
