use crate::error::{EvaluationError, ParseError};
use crate::traits::Scalar;
use std::collections::HashMap;
use std::iter;

/// Name of the independent variable unless a system declares another one.
pub const DEFAULT_INDEPENDENT_VARIABLE: &str = "t";

/// Named constants, shadowed by any declared symbol of the same name.
const CONSTANTS: &[(&str, f64)] = &[("pi", std::f64::consts::PI)];

/// Built-in functions of one argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sin,
    Cos,
    Tan,
    Sec,
    Csc,
    Cot,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Log,
    Sqrt,
    Abs,
}

const FUNCTIONS: &[(&str, Function)] = &[
    ("sin", Function::Sin),
    ("cos", Function::Cos),
    ("tan", Function::Tan),
    ("sec", Function::Sec),
    ("csc", Function::Csc),
    ("cot", Function::Cot),
    ("asin", Function::Asin),
    ("acos", Function::Acos),
    ("atan", Function::Atan),
    ("sinh", Function::Sinh),
    ("cosh", Function::Cosh),
    ("tanh", Function::Tanh),
    ("exp", Function::Exp),
    ("log", Function::Log),
    ("ln", Function::Log),
    ("sqrt", Function::Sqrt),
    ("abs", Function::Abs),
];

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        FUNCTIONS
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, function)| *function)
    }

    pub fn name(self) -> &'static str {
        match self {
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::Tan => "tan",
            Function::Sec => "sec",
            Function::Csc => "csc",
            Function::Cot => "cot",
            Function::Asin => "asin",
            Function::Acos => "acos",
            Function::Atan => "atan",
            Function::Sinh => "sinh",
            Function::Cosh => "cosh",
            Function::Tanh => "tanh",
            Function::Exp => "exp",
            Function::Log => "log",
            Function::Sqrt => "sqrt",
            Function::Abs => "abs",
        }
    }

    fn apply<T: Scalar>(self, a: T) -> Result<T, EvaluationError> {
        let x = a.real();
        let domain = |function: &'static str| EvaluationError::Domain {
            function,
            argument: x,
        };
        let value = match self {
            Function::Sin => a.sin(),
            Function::Cos => a.cos(),
            Function::Tan => a.tan(),
            Function::Sec => divide(T::one(), a.cos())?,
            Function::Csc => divide(T::one(), a.sin())?,
            Function::Cot => divide(a.cos(), a.sin())?,
            Function::Asin if !(-1.0..=1.0).contains(&x) => return Err(domain("asin")),
            Function::Asin => a.asin(),
            Function::Acos if !(-1.0..=1.0).contains(&x) => return Err(domain("acos")),
            Function::Acos => a.acos(),
            Function::Atan => a.atan(),
            Function::Sinh => a.sinh(),
            Function::Cosh => a.cosh(),
            Function::Tanh => a.tanh(),
            Function::Exp => a.exp(),
            Function::Log if x <= 0.0 => return Err(domain("log")),
            Function::Log => a.ln(),
            Function::Sqrt if x < 0.0 => return Err(domain("sqrt")),
            Function::Sqrt => a.sqrt(),
            Function::Abs => a.abs(),
        };
        finite(value, self.name())
    }
}

fn finite<T: Scalar>(value: T, operation: &'static str) -> Result<T, EvaluationError> {
    if value.real().is_finite() {
        Ok(value)
    } else {
        Err(EvaluationError::NonFinite { operation })
    }
}

fn divide<T: Scalar>(a: T, b: T) -> Result<T, EvaluationError> {
    if b.real() == 0.0 {
        return Err(EvaluationError::DivisionByZero);
    }
    finite(a / b, "division")
}

fn power<T: Scalar>(a: T, b: T) -> Result<T, EvaluationError> {
    let (base, exponent) = (a.real(), b.real());
    if base == 0.0 && exponent < 0.0 {
        return Err(EvaluationError::DivisionByZero);
    }
    if base < 0.0 && exponent.fract() != 0.0 {
        return Err(EvaluationError::Domain {
            function: "pow",
            argument: base,
        });
    }
    finite(a.powf(b), "power")
}

/// OpCodes for the stack-based virtual machine.
/// The VM operates on a stack of `Scalar` values (f64 or Dual).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant.
    LoadConst(f64),
    /// Pushes a state variable by its declared index (0 = x, 1 = y).
    LoadVar(usize),
    /// Pushes a parameter value by index into the parameter slice.
    LoadParam(usize),
    /// Pushes the independent variable.
    LoadTime,
    /// Pops (b, a), pushes a + b.
    Add,
    /// Pops (b, a), pushes a - b.
    Sub,
    /// Pops (b, a), pushes a * b.
    Mul,
    /// Pops (b, a), pushes a / b.
    Div,
    /// Pops (b, a), pushes a ^ b.
    Pow,
    /// Pops a, pushes a ^ n for a literal integer exponent.
    PowI(i32),
    /// Pops a, pushes -a.
    Neg,
    /// Pops a, pushes f(a).
    Call(Function),
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

    /// Largest stack height reached while executing, for preallocating buffers.
    pub fn max_stack_depth(&self) -> usize {
        let mut depth = 0usize;
        let mut max_depth = 0usize;
        for op in &self.ops {
            match op {
                OpCode::LoadConst(_)
                | OpCode::LoadVar(_)
                | OpCode::LoadParam(_)
                | OpCode::LoadTime => depth += 1,
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => {
                    depth = depth.saturating_sub(1)
                }
                OpCode::PowI(_) | OpCode::Neg | OpCode::Call(_) => {}
            }
            max_depth = max_depth.max(depth);
        }
        max_depth
    }
}

/// Stack-based virtual machine for evaluating compiled expressions.
///
/// The VM is stateless; `execute` takes all necessary context. Every
/// intermediate result is checked, so a division by zero or a domain error
/// deep inside an expression is reported even if later operations would
/// have hidden it (e.g. `exp(-1/0)`).
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(
        bytecode: &Bytecode,
        t: T,
        vars: &[T],
        params: &[f64],
        stack: &mut Vec<T>,
    ) -> Result<T, EvaluationError> {
        stack.clear();

        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(value) => stack.push(T::from_real(value)),
                OpCode::LoadVar(idx) => {
                    let value = vars.get(idx).copied().ok_or(EvaluationError::InputLength {
                        expected: idx + 1,
                        found: vars.len(),
                    })?;
                    stack.push(value);
                }
                OpCode::LoadParam(idx) => {
                    let value = params.get(idx).copied().ok_or(EvaluationError::InputLength {
                        expected: idx + 1,
                        found: params.len(),
                    })?;
                    stack.push(T::from_real(value));
                }
                OpCode::LoadTime => stack.push(t),
                OpCode::Add => binary(stack, |a, b| finite(a + b, "addition"))?,
                OpCode::Sub => binary(stack, |a, b| finite(a - b, "subtraction"))?,
                OpCode::Mul => binary(stack, |a, b| finite(a * b, "multiplication"))?,
                OpCode::Div => binary(stack, divide)?,
                OpCode::Pow => binary(stack, power)?,
                OpCode::PowI(n) => unary(stack, |a| {
                    if n < 0 && a.real() == 0.0 {
                        return Err(EvaluationError::DivisionByZero);
                    }
                    finite(a.powi(n), "power")
                })?,
                OpCode::Neg => unary(stack, |a| Ok(-a))?,
                OpCode::Call(function) => unary(stack, |a| function.apply(a))?,
            }
        }

        match (stack.pop(), stack.is_empty()) {
            (Some(value), true) => Ok(value),
            _ => Err(EvaluationError::StackUnderflow),
        }
    }
}

fn unary<T: Scalar>(
    stack: &mut Vec<T>,
    op: impl FnOnce(T) -> Result<T, EvaluationError>,
) -> Result<(), EvaluationError> {
    let a = stack.pop().ok_or(EvaluationError::StackUnderflow)?;
    stack.push(op(a)?);
    Ok(())
}

fn binary<T: Scalar>(
    stack: &mut Vec<T>,
    op: impl FnOnce(T, T) -> Result<T, EvaluationError>,
) -> Result<(), EvaluationError> {
    let b = stack.pop().ok_or(EvaluationError::StackUnderflow)?;
    let a = stack.pop().ok_or(EvaluationError::StackUnderflow)?;
    stack.push(op(a, b)?);
    Ok(())
}

// --- Symbols ---

/// What a name in an expression resolves to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Symbol {
    Variable(usize),
    Time,
    Parameter(usize),
    Constant(f64),
}

/// The names an expression may reference: state variables, the independent
/// variable, parameters and the built-in constants.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    symbols: HashMap<String, Symbol>,
    longest: usize,
    var_count: usize,
    param_count: usize,
}

impl SymbolTable {
    pub fn new(
        state_vars: &[String],
        indep_var: &str,
        param_names: &[String],
    ) -> Result<Self, ParseError> {
        let mut symbols = HashMap::new();
        let declared = state_vars
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), Symbol::Variable(i)))
            .chain(iter::once((indep_var, Symbol::Time)))
            .chain(
                param_names
                    .iter()
                    .enumerate()
                    .map(|(i, name)| (name.as_str(), Symbol::Parameter(i))),
            );
        for (name, symbol) in declared {
            validate_name(name)?;
            if symbols.insert(name.to_string(), symbol).is_some() {
                return Err(ParseError::DuplicateSymbol(name.to_string()));
            }
        }
        for (name, value) in CONSTANTS {
            symbols
                .entry((*name).to_string())
                .or_insert(Symbol::Constant(*value));
        }
        let longest = symbols.keys().map(String::len).max().unwrap_or(0);

        Ok(Self {
            symbols,
            longest,
            var_count: state_vars.len(),
            param_count: param_names.len(),
        })
    }

    pub fn lookup(&self, name: &str) -> Option<Symbol> {
        self.symbols.get(name).copied()
    }

    pub fn var_count(&self) -> usize {
        self.var_count
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }
}

/// Declared names are ASCII identifiers that do not shadow a function.
pub fn validate_name(name: &str) -> Result<(), ParseError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_start || !valid_rest || Function::from_name(name).is_some() {
        return Err(ParseError::InvalidName(name.to_string()));
    }
    Ok(())
}

// --- Tokenizer ---

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Symbol(Symbol),
    Function(Function),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    position: usize,
}

impl Token {
    fn describe(&self) -> String {
        match &self.kind {
            TokenKind::Number(n) => format!("number {n}"),
            TokenKind::Symbol(_) => "symbol".to_string(),
            TokenKind::Function(f) => format!("function `{}`", f.name()),
            TokenKind::Plus => "`+`".to_string(),
            TokenKind::Minus => "`-`".to_string(),
            TokenKind::Star => "`*`".to_string(),
            TokenKind::Slash => "`/`".to_string(),
            TokenKind::Caret => "`^`".to_string(),
            TokenKind::LParen => "`(`".to_string(),
            TokenKind::RParen => "`)`".to_string(),
        }
    }

    /// Whether this token can begin an operand, i.e. sit on the right of an
    /// implicit multiplication.
    fn starts_operand(&self) -> bool {
        matches!(
            self.kind,
            TokenKind::Number(_) | TokenKind::Symbol(_) | TokenKind::Function(_) | TokenKind::LParen
        )
    }
}

fn tokenize(input: &str, table: &SymbolTable) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let byte_at = |i: usize| chars.get(i).map_or(input.len(), |(pos, _)| *pos);
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (position, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || c == '.' {
            let end = scan_number(&chars, i);
            let text = &input[position..byte_at(end)];
            let value = text
                .parse::<f64>()
                .ok()
                .filter(|_| chars.get(end).map_or(true, |(_, next)| *next != '.'))
                .ok_or_else(|| ParseError::InvalidNumber {
                    text: text.to_string(),
                    position,
                })?;
            tokens.push(Token {
                kind: TokenKind::Number(value),
                position,
            });
            i = end;
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '_') {
                i += 1;
            }
            let run = &input[chars[start].0..byte_at(i)];
            let followed_by_paren = chars[i..]
                .iter()
                .find(|(_, next)| !next.is_whitespace())
                .is_some_and(|(_, next)| *next == '(');
            tokens.extend(split_run(run, position, followed_by_paren, table)?);
        } else {
            let kind = match c {
                '+' => TokenKind::Plus,
                '-' => TokenKind::Minus,
                '*' if chars.get(i + 1).is_some_and(|(_, next)| *next == '*') => {
                    i += 1;
                    TokenKind::Caret
                }
                '*' => TokenKind::Star,
                '/' => TokenKind::Slash,
                '^' => TokenKind::Caret,
                '(' => TokenKind::LParen,
                ')' => TokenKind::RParen,
                _ => {
                    return Err(ParseError::UnexpectedCharacter { found: c, position });
                }
            };
            tokens.push(Token { kind, position });
            i += 1;
        }
    }
    Ok(tokens)
}

/// Index one past the numeric literal starting at `start`: digits, an
/// optional fraction and an optional exponent. An `e` not followed by digits
/// is left alone so `2e` can mean `2*e`.
fn scan_number(chars: &[(usize, char)], start: usize) -> usize {
    let is_digit = |i: usize| chars.get(i).is_some_and(|(_, c)| c.is_ascii_digit());
    let mut i = start;
    while is_digit(i) {
        i += 1;
    }
    if chars.get(i).is_some_and(|(_, c)| *c == '.') {
        i += 1;
        while is_digit(i) {
            i += 1;
        }
    }
    if chars.get(i).is_some_and(|(_, c)| *c == 'e' || *c == 'E') {
        let signed = chars.get(i + 1).is_some_and(|(_, c)| *c == '+' || *c == '-');
        let digits_at = if signed { i + 2 } else { i + 1 };
        if is_digit(digits_at) {
            i = digits_at;
            while is_digit(i) {
                i += 1;
            }
        }
    }
    i
}

/// Splits an identifier run such as `axy` into known symbols, longest match
/// first, falling back to shorter matches when the greedy choice strands an
/// unknown remainder.
fn split_run(
    run: &str,
    offset: usize,
    followed_by_paren: bool,
    table: &SymbolTable,
) -> Result<Vec<Token>, ParseError> {
    if let Some(pieces) = segment(run, followed_by_paren, table) {
        return Ok(pieces
            .into_iter()
            .map(|(start, kind)| Token {
                kind,
                position: offset + start,
            })
            .collect());
    }

    let stuck = greedy_prefix(run, table);
    let rest = &run[stuck..];
    let position = offset + stuck;
    if followed_by_paren && stuck == 0 {
        Err(ParseError::UnknownFunction {
            name: run.to_string(),
            position,
        })
    } else if Function::from_name(rest).is_some() {
        Err(ParseError::MissingArguments {
            name: rest.to_string(),
            position,
        })
    } else {
        Err(ParseError::UnknownSymbol {
            symbol: rest.to_string(),
            position,
        })
    }
}

/// Splits the whole run, preferring at each position the candidates of
/// [`pieces_at`] in order. Works back from the end of the run so that
/// `choice[i]` is the first candidate at `i` whose remainder also splits.
fn segment(
    run: &str,
    followed_by_paren: bool,
    table: &SymbolTable,
) -> Option<Vec<(usize, TokenKind)>> {
    let end = run.len();
    let mut choice: Vec<Option<(usize, TokenKind)>> = vec![None; end + 1];
    for start in (0..end).rev() {
        let piece = pieces_at(&run[start..], followed_by_paren, table)
            .into_iter()
            .find(|(len, _)| start + len == end || choice[start + len].is_some());
        choice[start] = piece;
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    while start < end {
        let (len, kind) = choice[start].take()?;
        pieces.push((start, kind));
        start += len;
    }
    Some(pieces)
}

/// Pieces that may open `rest`: a trailing function name, then known
/// symbols longest first, then a run of digits.
fn pieces_at(rest: &str, followed_by_paren: bool, table: &SymbolTable) -> Vec<(usize, TokenKind)> {
    let mut candidates = Vec::new();
    // A function name only counts when it ends the run right before `(`.
    if followed_by_paren {
        if let Some(function) = Function::from_name(rest) {
            candidates.push((rest.len(), TokenKind::Function(function)));
        }
    }
    for len in (1..=rest.len().min(table.longest)).rev() {
        if let Some(symbol) = table.lookup(&rest[..len]) {
            candidates.push((len, TokenKind::Symbol(symbol)));
        }
    }
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits > 0 {
        if let Ok(value) = rest[..digits].parse::<f64>() {
            candidates.push((digits, TokenKind::Number(value)));
        }
    }
    candidates
}

/// How far a purely greedy split gets before it finds no known symbol.
fn greedy_prefix(run: &str, table: &SymbolTable) -> usize {
    let mut start = 0;
    'outer: while start < run.len() {
        let rest = &run[start..];
        for len in (1..=rest.len().min(table.longest)).rev() {
            if table.lookup(&rest[..len]).is_some() {
                start += len;
                continue 'outer;
            }
        }
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            break;
        }
        start += digits;
    }
    start
}

// --- AST & Parser ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

/// Abstract syntax tree with every name already resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(usize),
    Parameter(usize),
    Time,
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    Negate(Box<Expr>),
    Call(Function, Box<Expr>),
}

/// Parses an expression string into an AST against the given symbol table.
///
/// Grammar, loosest first:
/// ```text
/// sum     := product (('+' | '-') product)*
/// product := unary (('*' | '/') unary | power)*   // juxtaposition multiplies
/// unary   := ('-' | '+') unary | power
/// power   := primary ('^' unary)?                 // right-associative
/// primary := number | symbol | function '(' sum ')' | '(' sum ')'
/// ```
pub fn parse(input: &str, table: &SymbolTable) -> Result<Expr, ParseError> {
    if input.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    let length = input.chars().count();
    if length > MAX_EXPRESSION_LENGTH {
        return Err(ParseError::TooLong {
            length,
            limit: MAX_EXPRESSION_LENGTH,
        });
    }
    let tokens = tokenize(input, table)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_sum()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(ParseError::UnexpectedToken {
            found: token.describe(),
            position: token.position,
        }),
    }
}

/// Longest accepted expression, in characters.
pub const MAX_EXPRESSION_LENGTH: usize = 4096;

/// Deepest accepted nesting of unary, power and parenthesised operands.
pub const MAX_NESTING: usize = 512;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
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

    fn parse_sum(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_product()?;

        while let Some(token) = self.peek() {
            let op = match token.kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.consume();
            let right = self.parse_product()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_product(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;

        while let Some(token) = self.peek() {
            // `None` marks juxtaposition.
            let explicit = match token.kind {
                TokenKind::Star => Some(BinaryOp::Mul),
                TokenKind::Slash => Some(BinaryOp::Div),
                _ if token.starts_operand() => None,
                _ => break,
            };
            let right = match explicit {
                Some(_) => {
                    self.consume();
                    self.parse_unary()?
                }
                None => self.parse_power()?,
            };
            let op = explicit.unwrap_or(BinaryOp::Mul);
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    /// Runs `parse` one nesting level down.
    fn nested(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<Expr, ParseError>,
    ) -> Result<Expr, ParseError> {
        if self.depth >= MAX_NESTING {
            return Err(ParseError::TooDeep { limit: MAX_NESTING });
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        self.nested(Self::unary)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        match self.peek().map(|token| &token.kind) {
            Some(TokenKind::Minus) => {
                self.consume();
                Ok(match self.parse_unary()? {
                    Expr::Number(n) => Expr::Number(-n),
                    expr => Expr::Negate(Box::new(expr)),
                })
            }
            Some(TokenKind::Plus) => {
                self.consume();
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        self.nested(Self::power)
    }

    fn power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_primary()?;
        if let Some(TokenKind::Caret) = self.peek().map(|token| &token.kind) {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), BinaryOp::Pow, Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let token = self.consume().ok_or(ParseError::UnexpectedEnd)?;
        match token.kind {
            TokenKind::Number(n) => Ok(Expr::Number(n)),
            TokenKind::Symbol(Symbol::Variable(idx)) => Ok(Expr::Variable(idx)),
            TokenKind::Symbol(Symbol::Parameter(idx)) => Ok(Expr::Parameter(idx)),
            TokenKind::Symbol(Symbol::Time) => Ok(Expr::Time),
            TokenKind::Symbol(Symbol::Constant(value)) => Ok(Expr::Number(value)),
            TokenKind::Function(function) => {
                let open = self.consume().ok_or(ParseError::UnexpectedEnd)?;
                if open.kind != TokenKind::LParen {
                    return Err(ParseError::MissingArguments {
                        name: function.name().to_string(),
                        position: token.position,
                    });
                }
                let arg = self.parse_group(open.position)?;
                Ok(Expr::Call(function, Box::new(arg)))
            }
            TokenKind::LParen => self.parse_group(token.position),
            _ => Err(ParseError::UnexpectedToken {
                found: token.describe(),
                position: token.position,
            }),
        }
    }

    /// Parses the inside of a parenthesised group whose `(` was already consumed.
    fn parse_group(&mut self, open_position: usize) -> Result<Expr, ParseError> {
        let inner = self.parse_sum()?;
        match self.consume() {
            Some(Token {
                kind: TokenKind::RParen,
                ..
            }) => Ok(inner),
            Some(token) => Err(ParseError::UnexpectedToken {
                found: token.describe(),
                position: token.position,
            }),
            None => Err(ParseError::UnclosedParen {
                position: open_position,
            }),
        }
    }
}

// --- Compiler ---

/// Largest literal integer exponent lowered to `PowI`.
const MAX_INTEGER_EXPONENT: f64 = 64.0;

/// Compiles an AST (`Expr`) into `Bytecode`.
pub struct Compiler;

impl Compiler {
    pub fn compile(expr: &Expr) -> Bytecode {
        let mut ops = Vec::new();
        Self::compile_recursive(expr, &mut ops);
        Bytecode { ops }
    }

    fn compile_recursive(expr: &Expr, ops: &mut Vec<OpCode>) {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(idx) => ops.push(OpCode::LoadVar(*idx)),
            Expr::Parameter(idx) => ops.push(OpCode::LoadParam(*idx)),
            Expr::Time => ops.push(OpCode::LoadTime),
            Expr::Binary(base, BinaryOp::Pow, exponent) => match exponent.as_ref() {
                Expr::Number(n) if n.fract() == 0.0 && n.abs() <= MAX_INTEGER_EXPONENT => {
                    Self::compile_recursive(base, ops);
                    ops.push(OpCode::PowI(*n as i32));
                }
                _ => {
                    Self::compile_recursive(base, ops);
                    Self::compile_recursive(exponent, ops);
                    ops.push(OpCode::Pow);
                }
            },
            Expr::Binary(left, op, right) => {
                Self::compile_recursive(left, ops);
                Self::compile_recursive(right, ops);
                ops.push(match op {
                    BinaryOp::Add => OpCode::Add,
                    BinaryOp::Sub => OpCode::Sub,
                    BinaryOp::Mul => OpCode::Mul,
                    BinaryOp::Div => OpCode::Div,
                    BinaryOp::Pow => OpCode::Pow,
                });
            }
            Expr::Negate(operand) => {
                Self::compile_recursive(operand, ops);
                ops.push(OpCode::Neg);
            }
            Expr::Call(function, arg) => {
                Self::compile_recursive(arg, ops);
                ops.push(OpCode::Call(*function));
            }
        }
    }
}

// --- CompiledExpression ---

/// A parsed and compiled scalar expression, callable at any
/// `(t, state, params)` without re-parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpression {
    source: String,
    bytecode: Bytecode,
    state_count: usize,
    param_count: usize,
}

/// Compiles `expression` against the declared state variables, independent
/// variable and parameter names.
pub fn compile(
    expression: &str,
    state_vars: &[String],
    indep_var: &str,
    param_names: &[String],
) -> Result<CompiledExpression, ParseError> {
    let table = SymbolTable::new(state_vars, indep_var, param_names)?;
    compile_with(expression, &table)
}

/// Compiles against a prepared symbol table, so a whole system shares one.
pub fn compile_with(expression: &str, table: &SymbolTable) -> Result<CompiledExpression, ParseError> {
    let expr = parse(expression, table)?;
    Ok(CompiledExpression {
        source: expression.to_string(),
        bytecode: Compiler::compile(&expr),
        state_count: table.var_count(),
        param_count: table.param_count(),
    })
}

impl CompiledExpression {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn bytecode(&self) -> &Bytecode {
        &self.bytecode
    }

    pub fn state_count(&self) -> usize {
        self.state_count
    }

    /// Evaluates at a single point.
    pub fn evaluate(&self, t: f64, state: &[f64], params: &[f64]) -> Result<f64, EvaluationError> {
        let mut stack = Vec::with_capacity(self.bytecode.max_stack_depth());
        self.evaluate_with(t, state, params, &mut stack)
    }

    /// Evaluates with a caller-owned stack; generic so the same bytecode runs on dual numbers.
    pub fn evaluate_with<T: Scalar>(
        &self,
        t: T,
        state: &[T],
        params: &[f64],
        stack: &mut Vec<T>,
    ) -> Result<T, EvaluationError> {
        if state.len() != self.state_count {
            return Err(EvaluationError::InputLength {
                expected: self.state_count,
                found: state.len(),
            });
        }
        if params.len() != self.param_count {
            return Err(EvaluationError::InputLength {
                expected: self.param_count,
                found: params.len(),
            });
        }
        VM::execute(&self.bytecode, t, state, params, stack)
    }

    /// Evaluates at every state of a flattened, row-major array
    /// (`states.len() / state_count` points) at a common time.
    pub fn evaluate_batch(
        &self,
        t: f64,
        states: &[f64],
        params: &[f64],
    ) -> Vec<Result<f64, EvaluationError>> {
        if self.state_count == 0 {
            return Vec::new();
        }
        let mut stack = Vec::with_capacity(self.bytecode.max_stack_depth());
        states
            .chunks_exact(self.state_count)
            .map(|state| self.evaluate_with(t, state, params, &mut stack))
            .collect()
    }

    /// Like [`evaluate_batch`](Self::evaluate_batch) with one time per point.
    pub fn evaluate_batch_at(
        &self,
        times: &[f64],
        states: &[f64],
        params: &[f64],
    ) -> Vec<Result<f64, EvaluationError>> {
        if self.state_count == 0 {
            return Vec::new();
        }
        let mut stack = Vec::with_capacity(self.bytecode.max_stack_depth());
        times
            .iter()
            .zip(states.chunks_exact(self.state_count))
            .map(|(&t, state)| self.evaluate_with(t, state, params, &mut stack))
            .collect()
    }

    /// Indices of the parameters the expression actually reads, ascending.
    pub fn referenced_parameters(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .bytecode
            .ops
            .iter()
            .filter_map(|op| match op {
                OpCode::LoadParam(idx) => Some(*idx),
                _ => None,
            })
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    pub fn depends_on_state(&self) -> bool {
        self.bytecode
            .ops
            .iter()
            .any(|op| matches!(op, OpCode::LoadVar(_)))
    }

    pub fn depends_on_time(&self) -> bool {
        self.bytecode.ops.contains(&OpCode::LoadTime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::Dual;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    fn compile_xy(expression: &str, params: &[&str]) -> Result<CompiledExpression, ParseError> {
        compile(expression, &names(&["x", "y"]), "t", &names(params))
    }

    fn eval_xy(expression: &str, params: &[(&str, f64)], x: f64, y: f64) -> f64 {
        let param_names: Vec<&str> = params.iter().map(|(name, _)| *name).collect();
        let values: Vec<f64> = params.iter().map(|(_, value)| *value).collect();
        compile_xy(expression, &param_names)
            .expect("expression should compile")
            .evaluate(0.0, &[x, y], &values)
            .expect("expression should evaluate")
    }

    #[test]
    fn evaluates_affine_expression() {
        let compiled = compile("2*x+3", &names(&["x"]), "t", &[]).expect("should compile");
        assert_eq!(compiled.evaluate(0.0, &[1.0], &[]), Ok(5.0));
    }

    #[test]
    fn implicit_multiplication_splits_known_symbols() {
        let value = eval_xy("axy", &[("a", 2.0)], 3.0, 4.0);
        assert_eq!(value, 24.0);
    }

    #[test]
    fn implicit_multiplication_before_parentheses_and_functions() {
        let value = eval_xy("b(x^2-y^2) + 2x sin(y)", &[("b", 3.0)], 2.0, 0.0);
        assert_eq!(value, 12.0);
        assert_eq!(eval_xy("(x+1)(x-1)", &[], 3.0, 0.0), 8.0);
        assert_eq!(eval_xy("2(3)", &[], 0.0, 0.0), 6.0);
    }

    #[test]
    fn longest_declared_symbol_wins() {
        let value = eval_xy("abx", &[("a", 2.0), ("ab", 5.0)], 3.0, 0.0);
        assert_eq!(value, 15.0);
    }

    #[test]
    fn splitting_backtracks_when_greedy_choice_fails() {
        let value = eval_xy("abcd", &[("ab", 2.0), ("abc", 100.0), ("cd", 7.0)], 0.0, 0.0);
        assert_eq!(value, 14.0);
    }

    #[test]
    fn independent_variable_and_parameters_split_like_state() {
        let compiled = compile("eftx", &names(&["x"]), "t", &names(&["e", "f"]))
            .expect("should compile");
        assert_eq!(compiled.evaluate(0.5, &[2.0], &[3.0, 4.0]), Ok(12.0));
        assert!(compiled.depends_on_time());
    }

    #[test]
    fn trailing_digits_multiply_unless_declared() {
        assert_eq!(eval_xy("x2", &[], 3.0, 0.0), 6.0);
        assert_eq!(eval_xy("x2", &[("x2", 10.0)], 3.0, 0.0), 10.0);
    }

    #[test]
    fn power_binds_tighter_than_negation_and_is_right_associative() {
        assert_eq!(eval_xy("-x^2", &[], 3.0, 0.0), -9.0);
        assert_eq!(eval_xy("2^3^2", &[], 0.0, 0.0), 512.0);
        assert_eq!(eval_xy("x**2", &[], 3.0, 0.0), 9.0);
        assert_eq!(eval_xy("2^-1", &[], 0.0, 0.0), 0.5);
        assert_eq!(eval_xy("2x^2", &[], 3.0, 0.0), 18.0);
    }

    #[test]
    fn numbers_with_exponents_and_constants() {
        assert!((eval_xy("1e-3x", &[], 2.0, 0.0) - 0.002).abs() < 1e-15);
        assert_eq!(eval_xy("2e", &[("e", 4.0)], 0.0, 0.0), 8.0);
        assert!((eval_xy("sin(pi/2)", &[], 0.0, 0.0) - 1.0).abs() < 1e-15);
        assert!((eval_xy("ln(exp(2))", &[], 0.0, 0.0) - 2.0).abs() < 1e-15);
    }

    #[test]
    fn rejects_undeclared_symbols() {
        let err = compile_xy("x + q", &[]).expect_err("q is not declared");
        assert_eq!(
            err,
            ParseError::UnknownSymbol {
                symbol: "q".to_string(),
                position: 4
            }
        );
        let err = compile_xy("xq", &[]).expect_err("q is not declared");
        assert!(matches!(err, ParseError::UnknownSymbol { ref symbol, position: 1 } if symbol == "q"));
    }

    #[test]
    fn rejects_unknown_functions_and_bare_function_names() {
        assert!(matches!(
            compile_xy("foo(x)", &[]),
            Err(ParseError::UnknownFunction { .. })
        ));
        assert!(matches!(
            compile_xy("sin + 1", &[]),
            Err(ParseError::MissingArguments { .. })
        ));
    }

    #[test]
    fn rejects_malformed_syntax() {
        assert_eq!(compile_xy("   ", &[]), Err(ParseError::Empty));
        assert_eq!(compile_xy("1 +", &[]), Err(ParseError::UnexpectedEnd));
        assert_eq!(
            compile_xy("(x", &[]),
            Err(ParseError::UnclosedParen { position: 0 })
        );
        assert!(matches!(
            compile_xy("x)", &[]),
            Err(ParseError::UnexpectedToken { position: 1, .. })
        ));
        assert!(matches!(
            compile_xy("x $ y", &[]),
            Err(ParseError::UnexpectedCharacter { found: '$', .. })
        ));
        assert!(matches!(
            compile_xy("1.2.3", &[]),
            Err(ParseError::InvalidNumber { .. })
        ));
        assert!(matches!(
            compile_xy("x * / y", &[]),
            Err(ParseError::UnexpectedToken { .. })
        ));
    }

    #[test]
    fn deep_nesting_is_an_error() {
        let parens = format!("{}x{}", "(".repeat(500), ")".repeat(500));
        assert_eq!(
            compile_xy(&parens, &[]),
            Err(ParseError::TooDeep { limit: MAX_NESTING })
        );
        let negations = format!("{}x", "-".repeat(1000));
        assert_eq!(
            compile_xy(&negations, &[]),
            Err(ParseError::TooDeep { limit: MAX_NESTING })
        );

        let shallow = format!("{}x{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(eval_xy(&shallow, &[], 2.0, 0.0), 2.0);
    }

    #[test]
    fn long_identifier_runs_split_without_recursion() {
        assert_eq!(eval_xy(&"x".repeat(1000), &[], 1.0, 0.0), 1.0);
        assert_eq!(eval_xy(&"xy".repeat(20), &[], 1.0, -1.0), 1.0);
        assert_eq!(
            compile_xy(&"x".repeat(20_000), &[]),
            Err(ParseError::TooLong {
                length: 20_000,
                limit: MAX_EXPRESSION_LENGTH
            })
        );
    }

    #[test]
    fn rejects_invalid_declarations() {
        assert_eq!(
            compile("x", &names(&["x"]), "t", &names(&["x"])),
            Err(ParseError::DuplicateSymbol("x".to_string()))
        );
        assert_eq!(
            compile("x", &names(&["x"]), "t", &names(&["sin"])),
            Err(ParseError::InvalidName("sin".to_string()))
        );
        assert_eq!(
            compile("x", &names(&["x"]), "t", &names(&["2a"])),
            Err(ParseError::InvalidName("2a".to_string()))
        );
    }

    #[test]
    fn evaluation_errors_are_typed() {
        let compiled = compile("1/(x-1)", &names(&["x"]), "t", &[]).expect("should compile");
        assert_eq!(
            compiled.evaluate(0.0, &[1.0], &[]),
            Err(EvaluationError::DivisionByZero)
        );
        let compiled = compile("log(x)", &names(&["x"]), "t", &[]).expect("should compile");
        assert!(matches!(
            compiled.evaluate(0.0, &[-1.0], &[]),
            Err(EvaluationError::Domain { function: "log", .. })
        ));
        let compiled = compile("exp(x)", &names(&["x"]), "t", &[]).expect("should compile");
        assert!(matches!(
            compiled.evaluate(0.0, &[1000.0], &[]),
            Err(EvaluationError::NonFinite { .. })
        ));
        let compiled = compile("exp(-1/x)", &names(&["x"]), "t", &[]).expect("should compile");
        assert_eq!(
            compiled.evaluate(0.0, &[0.0], &[]),
            Err(EvaluationError::DivisionByZero)
        );
    }

    #[test]
    fn batch_evaluation_matches_pointwise() {
        let compiled = compile_xy("x/y", &[]).expect("should compile");
        let states = [1.0, 2.0, 3.0, 0.0, -4.0, 8.0];
        let batch = compiled.evaluate_batch(0.0, &states, &[]);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0], Ok(0.5));
        assert_eq!(batch[1], Err(EvaluationError::DivisionByZero));
        assert_eq!(batch[2], Ok(-0.5));

        let timed = compile("t*x", &names(&["x"]), "t", &[]).expect("should compile");
        let values = timed.evaluate_batch_at(&[1.0, 2.0], &[3.0, 4.0], &[]);
        assert_eq!(values, vec![Ok(3.0), Ok(8.0)]);
    }

    #[test]
    fn reports_referenced_parameters() {
        let compiled = compile_xy("c*x + a - c", &["a", "b", "c"]).expect("should compile");
        assert_eq!(compiled.referenced_parameters(), vec![0, 2]);
        assert!(compiled.depends_on_state());
        let constant = compile_xy("b + 1", &["b"]).expect("should compile");
        assert!(!constant.depends_on_state());
    }

    #[test]
    fn compilation_is_idempotent() {
        let first = compile_xy("axy - sin(x)", &["a"]).expect("should compile");
        let second = compile_xy("axy - sin(x)", &["a"]).expect("should compile");
        assert_eq!(first, second);
    }

    #[test]
    fn integer_powers_lower_to_powi_and_differentiate() {
        let compiled = compile("x^3", &names(&["x"]), "t", &[]).expect("should compile");
        assert!(compiled.bytecode().ops.contains(&OpCode::PowI(3)));
        let mut stack = Vec::new();
        let value = compiled
            .evaluate_with(Dual::constant(0.0), &[Dual::new(2.0, 1.0)], &[], &mut stack)
            .expect("should evaluate");
        assert_eq!(value.val, 8.0);
        assert_eq!(value.eps, 12.0);
    }

    #[test]
    fn max_stack_depth_tracks_nesting() {
        let compiled = compile_xy("x + (y * (x - y))", &[]).expect("should compile");
        assert_eq!(compiled.bytecode().max_stack_depth(), 4);
    }
}
