//! Count- and age-bounded windows with incremental aggregate maintenance.
//!
//! A [`Window`] keeps the most recent admitted values, oldest at the front.
//! It may carry one [`WindowListener`] that is told about every admission and
//! every eviction (oldest first), so that a statistic such as a running
//! average is updated in O(1) per push instead of rescanning the window.
//!
//! Time-bounded windows are trimmed lazily: expired elements are evicted only
//! when the next element is pushed.

use crate::error::EvalError;
use crate::expression::number;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt::{self, Debug, Display, Formatter};
use std::time::{Duration, Instant};

/// How a window decides which elements to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    /// Keep at most this many elements.
    Count(usize),
    /// Keep elements admitted no longer than this ago.
    Age(Duration),
}

/// Observer notified synchronously as a window changes.
pub trait WindowListener: Send {
    /// Called before `value` is admitted. An error rejects the element.
    fn admit(&mut self, value: &Value) -> Result<(), EvalError>;

    /// Called for each evicted element, oldest first.
    fn evict(&mut self, value: &Value);

    /// Reports the maintained statistic for a window currently holding `len` elements.
    fn report(&self, len: usize) -> Result<Value, EvalError>;
}

/// Aggregations that can be maintained incrementally over a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    /// Number of elements in the window
    Count,
    /// Sum of the elements
    Sum,
    /// Mean of the elements
    Average,
}

impl Display for AggregateFunction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AggregateFunction::Count => write!(f, "WindowCount"),
            AggregateFunction::Sum => write!(f, "WindowSum"),
            AggregateFunction::Average => write!(f, "WindowAverage"),
        }
    }
}

/// Running sum listener backing `WindowSum`, `WindowCount` and `WindowAverage`.
#[derive(Debug, Clone)]
pub struct RunningAggregate {
    function: AggregateFunction,
    sum: f64,
}

impl RunningAggregate {
    pub fn new(function: AggregateFunction) -> Self {
        Self { function, sum: 0.0 }
    }
}

impl WindowListener for RunningAggregate {
    fn admit(&mut self, value: &Value) -> Result<(), EvalError> {
        if self.function == AggregateFunction::Count {
            return Ok(());
        }
        match value.as_f64() {
            Some(v) => {
                self.sum += v;
                Ok(())
            }
            None => Err(EvalError::TypeMismatch {
                function: self.function.to_string(),
                operand: "window element".to_string(),
                expected: "number",
                actual: type_name(value),
            }),
        }
    }

    fn evict(&mut self, value: &Value) {
        if self.function == AggregateFunction::Count {
            return;
        }
        // Only numbers get past admit().
        if let Some(v) = value.as_f64() {
            self.sum -= v;
        }
    }

    fn report(&self, len: usize) -> Result<Value, EvalError> {
        match self.function {
            AggregateFunction::Count => Ok(Value::from(len as u64)),
            AggregateFunction::Sum => Ok(number(if len == 0 { 0.0 } else { self.sum })),
            AggregateFunction::Average => {
                if len == 0 {
                    Err(EvalError::EmptyWindow)
                } else {
                    Ok(number(self.sum / len as f64))
                }
            }
        }
    }
}

struct Entry {
    value: Value,
    admitted: Instant,
}

/// An ordered run of recently admitted values.
#[derive(Default)]
pub struct Window {
    elements: VecDeque<Entry>,
    listener: Option<Box<dyn WindowListener>>,
}

impl Window {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    /// Attaches the window's listener. A window holds at most one; the
    /// caller checks [`Window::has_listener`] first.
    pub fn set_listener(&mut self, listener: Box<dyn WindowListener>) {
        debug_assert!(self.listener.is_none(), "window already has a listener");
        self.listener = Some(listener);
    }

    /// Most recently admitted value.
    pub fn latest(&self) -> Option<&Value> {
        self.elements.back().map(|e| &e.value)
    }

    /// Values from newest to oldest.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.elements.iter().rev().map(|e| &e.value)
    }

    /// The listener's statistic for the current contents.
    pub fn report(&self) -> Result<Value, EvalError> {
        match &self.listener {
            Some(listener) => listener.report(self.len()),
            None => Err(EvalError::InvalidValue {
                function: "Window".to_string(),
                message: "no aggregate attached".to_string(),
            }),
        }
    }

    pub fn push(&mut self, value: Value, bound: Bound) -> Result<(), EvalError> {
        self.push_at(value, bound, Instant::now())
    }

    /// Admits `value` as of `now`, then evicts whatever `bound` no longer allows.
    pub fn push_at(&mut self, value: Value, bound: Bound, now: Instant) -> Result<(), EvalError> {
        if let Some(listener) = self.listener.as_mut() {
            listener.admit(&value)?;
        }
        self.elements.push_back(Entry {
            value,
            admitted: now,
        });
        self.trim(bound, now);
        Ok(())
    }

    fn trim(&mut self, bound: Bound, now: Instant) {
        while let Some(oldest) = self.elements.front() {
            let expired = match bound {
                Bound::Count(capacity) => self.elements.len() > capacity,
                Bound::Age(duration) => now.saturating_duration_since(oldest.admitted) > duration,
            };
            if !expired {
                break;
            }
            if let Some(entry) = self.elements.pop_front() {
                if let Some(listener) = self.listener.as_mut() {
                    listener.evict(&entry.value);
                }
            }
        }
    }
}

impl Debug for Window {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Window")
            .field("len", &self.elements.len())
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}
