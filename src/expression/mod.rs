//! The live-query expression language.
//!
//! A statement is a literal (`3`, `0.5`, `"text"`), a call such as
//! `Add(a.b, 2)`, or a bare dotted field path. Statements are parsed once per
//! session into an [`Expression`] tree which is then evaluated against every
//! record the session receives. Window and counter nodes keep their state
//! inside the tree, so each tree belongs to exactly one session.
//!
//! Recognized functions:
//!
//! | Function | Result |
//! |---|---|
//! | `Add`, `Subtract`, `Multiply`, `Divide` | number |
//! | `Equal`, `NotEqual`, `Greater`, `GreaterEqual`, `Less`, `LessEqual` | bool |
//! | `RandomSample(rate)` | bool, true with probability `rate` |
//! | `EveryNth(n)` | bool, true on every nth evaluation |
//! | `GetDeep(path)` | field value at a computed path |
//! | `RollingWindow(expr, size)`, `TimedWindow(expr, seconds)` | newest element |
//! | `WindowAverage(window)`, `WindowSum(window)`, `WindowCount(window)` | aggregate |

mod parse;

pub use parse::{parse, parse_literal, split_call};

use crate::error::{EvalError, ParseError};
use crate::field::get_deep;
use crate::window::{type_name, AggregateFunction, Bound, RunningAggregate, Window};
use rand::Rng;
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

/// Binary numeric operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl Display for ArithmeticOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ArithmeticOp::Add => write!(f, "Add"),
            ArithmeticOp::Subtract => write!(f, "Subtract"),
            ArithmeticOp::Multiply => write!(f, "Multiply"),
            ArithmeticOp::Divide => write!(f, "Divide"),
        }
    }
}

/// Binary comparison predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
}

impl Display for CompareOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CompareOp::Equal => write!(f, "Equal"),
            CompareOp::NotEqual => write!(f, "NotEqual"),
            CompareOp::Greater => write!(f, "Greater"),
            CompareOp::GreaterEqual => write!(f, "GreaterEqual"),
            CompareOp::Less => write!(f, "Less"),
            CompareOp::LessEqual => write!(f, "LessEqual"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    /// Bounded by element count
    Rolling,
    /// Bounded by element age in seconds
    Timed,
}

impl Display for WindowKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            WindowKind::Rolling => write!(f, "RollingWindow"),
            WindowKind::Timed => write!(f, "TimedWindow"),
        }
    }
}

/// A `RollingWindow` or `TimedWindow` node and the window it fills.
#[derive(Debug)]
pub struct WindowExpression {
    kind: WindowKind,
    inner: Box<Expression>,
    size: Box<Expression>,
    window: Window,
}

impl WindowExpression {
    pub fn window(&self) -> &Window {
        &self.window
    }

    fn evaluate(&mut self, record: &Value) -> Result<Value, EvalError> {
        let value = self.inner.evaluate(record)?;
        let size = self.size.evaluate(record)?;
        let size = size.as_u64().ok_or_else(|| EvalError::TypeMismatch {
            function: self.kind.to_string(),
            operand: "size".to_string(),
            expected: "non-negative int",
            actual: type_name(&size),
        })?;
        let bound = match self.kind {
            WindowKind::Rolling => Bound::Count(usize::try_from(size).unwrap_or(usize::MAX)),
            WindowKind::Timed => Bound::Age(Duration::from_secs(size)),
        };
        // A null element is skipped rather than admitted.
        if !value.is_null() {
            self.window.push(value, bound)?;
        }
        Ok(self.window.latest().cloned().unwrap_or(Value::Null))
    }
}

/// A node in a parsed statement.
#[derive(Debug)]
pub enum Expression {
    Literal(Value),
    /// Bare dotted path, e.g. `extra.user.id`
    Field(String),
    /// `GetDeep(path)` where `path` evaluates to the dotted path string
    GetDeep(Box<Expression>),
    Arithmetic {
        op: ArithmeticOp,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    Compare {
        op: CompareOp,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    RandomSample(Box<Expression>),
    EveryNth {
        n: Box<Expression>,
        counter: u64,
    },
    Window(WindowExpression),
    Aggregate {
        function: AggregateFunction,
        window: WindowExpression,
    },
}

impl Expression {
    /// Builds a call node from its already-parsed arguments, checking arity
    /// and argument roles.
    pub fn build(name: &str, args: Vec<Expression>) -> Result<Self, ParseError> {
        let expr = match name {
            "Add" | "Subtract" | "Multiply" | "Divide" => {
                let op = match name {
                    "Add" => ArithmeticOp::Add,
                    "Subtract" => ArithmeticOp::Subtract,
                    "Multiply" => ArithmeticOp::Multiply,
                    _ => ArithmeticOp::Divide,
                };
                let [lhs, rhs] = take(name, args)?;
                Expression::Arithmetic {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                }
            }
            "Equal" | "NotEqual" | "Greater" | "GreaterEqual" | "Less" | "LessEqual" => {
                let op = match name {
                    "Equal" => CompareOp::Equal,
                    "NotEqual" => CompareOp::NotEqual,
                    "Greater" => CompareOp::Greater,
                    "GreaterEqual" => CompareOp::GreaterEqual,
                    "Less" => CompareOp::Less,
                    _ => CompareOp::LessEqual,
                };
                let [lhs, rhs] = take(name, args)?;
                Expression::Compare {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                }
            }
            "RandomSample" => {
                let [rate] = take(name, args)?;
                Expression::RandomSample(Box::new(rate))
            }
            "EveryNth" => {
                let [n] = take(name, args)?;
                Expression::EveryNth {
                    n: Box::new(n),
                    counter: 0,
                }
            }
            "GetDeep" => {
                let [path] = take(name, args)?;
                match path {
                    Expression::Literal(Value::String(path)) if !path.is_empty() => {
                        Expression::Field(path)
                    }
                    Expression::Literal(other) => {
                        return Err(ParseError::InvalidArgument {
                            function: name.to_string(),
                            message: format!("expected a non-empty path string, got {}", other),
                        })
                    }
                    dynamic => Expression::GetDeep(Box::new(dynamic)),
                }
            }
            "RollingWindow" | "TimedWindow" => {
                let kind = if name == "RollingWindow" {
                    WindowKind::Rolling
                } else {
                    WindowKind::Timed
                };
                let [inner, size] = take(name, args)?;
                Expression::Window(WindowExpression {
                    kind,
                    inner: Box::new(inner),
                    size: Box::new(size),
                    window: Window::new(),
                })
            }
            "WindowAverage" | "WindowAve" | "WindowSum" | "WindowCount" => {
                let function = match name {
                    "WindowSum" => AggregateFunction::Sum,
                    "WindowCount" => AggregateFunction::Count,
                    _ => AggregateFunction::Average,
                };
                let [window] = take(name, args)?;
                let mut window = match window {
                    Expression::Window(window) => window,
                    other => {
                        return Err(ParseError::InvalidArgument {
                            function: name.to_string(),
                            message: format!("expected a window argument, got {}", other),
                        })
                    }
                };
                if window.window.has_listener() {
                    return Err(ParseError::InvalidArgument {
                        function: name.to_string(),
                        message: "window already has an aggregate attached".to_string(),
                    });
                }
                window
                    .window
                    .set_listener(Box::new(RunningAggregate::new(function)));
                Expression::Aggregate { function, window }
            }
            unknown => return Err(ParseError::UnknownFunction(unknown.to_string())),
        };
        Ok(expr)
    }

    /// Evaluates this node against one record, updating any window or
    /// counter state it holds.
    pub fn evaluate(&mut self, record: &Value) -> Result<Value, EvalError> {
        match self {
            Expression::Literal(value) => Ok(value.clone()),
            Expression::Field(path) => get_deep(path, record)
                .cloned()
                .ok_or_else(|| EvalError::FieldNotFound(path.clone())),
            Expression::GetDeep(path) => {
                let path = path.evaluate(record)?;
                match path.as_str() {
                    Some(path) if !path.is_empty() => get_deep(path, record)
                        .cloned()
                        .ok_or_else(|| EvalError::FieldNotFound(path.to_string())),
                    _ => Err(EvalError::TypeMismatch {
                        function: "GetDeep".to_string(),
                        operand: "path".to_string(),
                        expected: "non-empty string",
                        actual: type_name(&path),
                    }),
                }
            }
            Expression::Arithmetic { op, lhs, rhs } => {
                let a = lhs.evaluate(record)?;
                let b = rhs.evaluate(record)?;
                arithmetic(*op, &a, &b)
            }
            Expression::Compare { op, lhs, rhs } => {
                let a = lhs.evaluate(record)?;
                let b = rhs.evaluate(record)?;
                compare(*op, &a, &b).map(Value::Bool)
            }
            Expression::RandomSample(rate) => {
                let rate = rate.evaluate(record)?;
                let p = rate.as_f64().ok_or_else(|| EvalError::TypeMismatch {
                    function: "RandomSample".to_string(),
                    operand: "rate".to_string(),
                    expected: "number",
                    actual: type_name(&rate),
                })?;
                if !(0.0..=1.0).contains(&p) {
                    return Err(EvalError::InvalidValue {
                        function: "RandomSample".to_string(),
                        message: format!("rate {} is outside [0, 1]", p),
                    });
                }
                Ok(Value::Bool(rand::thread_rng().gen_bool(p)))
            }
            Expression::EveryNth { n, counter } => {
                let n = n.evaluate(record)?;
                let every = match n.as_u64() {
                    Some(every) if every > 0 => every,
                    _ => {
                        return Err(EvalError::TypeMismatch {
                            function: "EveryNth".to_string(),
                            operand: "n".to_string(),
                            expected: "positive int",
                            actual: type_name(&n),
                        })
                    }
                };
                *counter += 1;
                if *counter >= every {
                    *counter = 0;
                    Ok(Value::Bool(true))
                } else {
                    Ok(Value::Bool(false))
                }
            }
            Expression::Window(window) => window.evaluate(record),
            Expression::Aggregate { window, .. } => {
                window.evaluate(record)?;
                window.window.report()
            }
        }
    }
}

impl Display for Expression {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Literal(value) => write!(f, "{}", value),
            Expression::Field(path) => write!(f, "{}", path),
            Expression::GetDeep(path) => write!(f, "GetDeep({})", path),
            Expression::Arithmetic { op, lhs, rhs } => write!(f, "{}({},{})", op, lhs, rhs),
            Expression::Compare { op, lhs, rhs } => write!(f, "{}({},{})", op, lhs, rhs),
            Expression::RandomSample(rate) => write!(f, "RandomSample({})", rate),
            Expression::EveryNth { n, .. } => write!(f, "EveryNth({})", n),
            Expression::Window(window) => write!(f, "{}", window),
            Expression::Aggregate { function, window } => write!(f, "{}({})", function, window),
        }
    }
}

impl Display for WindowExpression {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}({},{})", self.kind, self.inner, self.size)
    }
}

/// Wraps a float as a JSON number; non-finite values become `null`.
pub(crate) fn number(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

fn take<const N: usize>(function: &str, args: Vec<Expression>) -> Result<[Expression; N], ParseError> {
    let actual = args.len();
    args.try_into().map_err(|_| ParseError::Arity {
        function: function.to_string(),
        expected: format!("{} argument(s)", N),
        actual,
    })
}

fn is_integer(value: &Value) -> bool {
    matches!(value, Value::Number(n) if !n.is_f64())
}

fn numeric_operand(op: &str, operand: &str, value: &Value) -> Result<f64, EvalError> {
    value.as_f64().ok_or_else(|| EvalError::TypeMismatch {
        function: op.to_string(),
        operand: operand.to_string(),
        expected: "number",
        actual: type_name(value),
    })
}

fn arithmetic(op: ArithmeticOp, a: &Value, b: &Value) -> Result<Value, EvalError> {
    let name = op.to_string();
    let x = numeric_operand(&name, "left operand", a)?;
    let y = numeric_operand(&name, "right operand", b)?;

    if op != ArithmeticOp::Divide && is_integer(a) && is_integer(b) {
        if let (Some(i), Some(j)) = (a.as_i64(), b.as_i64()) {
            let result = match op {
                ArithmeticOp::Add => i.checked_add(j),
                ArithmeticOp::Subtract => i.checked_sub(j),
                _ => i.checked_mul(j),
            };
            return result.map(Value::from).ok_or(EvalError::Overflow(name));
        }
    }

    let result = match op {
        ArithmeticOp::Add => x + y,
        ArithmeticOp::Subtract => x - y,
        ArithmeticOp::Multiply => x * y,
        ArithmeticOp::Divide => {
            if y == 0.0 {
                return Err(EvalError::DivisionByZero(name));
            }
            x / y
        }
    };
    if result.is_finite() {
        Ok(number(result))
    } else {
        Err(EvalError::Overflow(name))
    }
}

fn compare(op: CompareOp, a: &Value, b: &Value) -> Result<bool, EvalError> {
    if let CompareOp::Equal | CompareOp::NotEqual = op {
        let equal = match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        };
        return Ok(equal == (op == CompareOp::Equal));
    }

    let ordering = match (a, b) {
        (Value::Number(_), _) => {
            let x = numeric_operand(&op.to_string(), "left operand", a)?;
            let y = numeric_operand(&op.to_string(), "right operand", b)?;
            x.partial_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::String(_), _) => {
            return Err(EvalError::TypeMismatch {
                function: op.to_string(),
                operand: "right operand".to_string(),
                expected: "string",
                actual: type_name(b),
            })
        }
        _ => {
            return Err(EvalError::TypeMismatch {
                function: op.to_string(),
                operand: "left operand".to_string(),
                expected: "number or string",
                actual: type_name(a),
            })
        }
    };

    Ok(match (op, ordering) {
        (CompareOp::Greater, Some(o)) => o == Ordering::Greater,
        (CompareOp::GreaterEqual, Some(o)) => o != Ordering::Less,
        (CompareOp::Less, Some(o)) => o == Ordering::Less,
        (CompareOp::LessEqual, Some(o)) => o != Ordering::Greater,
        _ => false,
    })
}
