//! Explicit coercion rules
//!
//! Numbers stay integers while every operand is an integer and the result
//! fits in an i64; anything else is computed in f64.

use serde_json::Value;

/// A numeric operand
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    Int(i64),
    Float(f64),
}

impl Numeric {
    /// Returns the value as f64
    pub fn as_f64(self) -> f64 {
        match self {
            Numeric::Int(i) => i as f64,
            Numeric::Float(f) => f,
        }
    }

    /// Returns true for integers
    pub fn is_int(self) -> bool {
        matches!(self, Numeric::Int(_))
    }

    /// Returns true for zero of either kind
    pub fn is_zero(self) -> bool {
        match self {
            Numeric::Int(i) => i == 0,
            Numeric::Float(f) => f == 0.0,
        }
    }

    /// Converts back into a JSON value (non-finite floats become null)
    pub fn into_value(self) -> Value {
        match self {
            Numeric::Int(i) => Value::from(i),
            Numeric::Float(f) => float_value(f),
        }
    }
}

/// Extracts a numeric operand; `None` for non-numbers
pub fn numeric(value: &Value) -> Option<Numeric> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(Numeric::Int(i)),
            None => n.as_f64().map(Numeric::Float),
        },
        _ => None,
    }
}

/// Builds a float value; non-finite results become null
pub fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Expression truthiness: false, null and zero are falsy
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(_) => numeric(value).map(|n| !n.is_zero()).unwrap_or(false),
        _ => true,
    }
}

/// Type name as reported by `$type`
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => match numeric(value) {
            Some(Numeric::Int(i)) if i >= i32::MIN as i64 && i <= i32::MAX as i64 => "int",
            Some(Numeric::Int(_)) => "long",
            _ => "double",
        },
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Running numeric sum matching the embedded engine's `SUM`.
///
/// Integers are summed exactly until a float arrives or the sum overflows;
/// from then on a Kahan-Babuska-Neumaier compensated float sum is kept.
#[derive(Debug, Clone, Default)]
pub struct NumericSum {
    int_sum: i64,
    approx: bool,
    sum: f64,
    err: f64,
    count: u64,
}

impl NumericSum {
    /// Creates an empty sum
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a numeric operand
    pub fn add(&mut self, value: Numeric) {
        self.count += 1;
        if !self.approx {
            match value {
                Numeric::Int(i) => match self.int_sum.checked_add(i) {
                    Some(s) => self.int_sum = s,
                    None => {
                        self.switch_to_float();
                        self.step(i as f64);
                    }
                },
                Numeric::Float(f) => {
                    self.switch_to_float();
                    self.step(f);
                }
            }
        } else {
            self.step(value.as_f64());
        }
    }

    /// Adds a JSON value, ignoring non-numbers
    pub fn add_value(&mut self, value: &Value) {
        if let Some(n) = numeric(value) {
            self.add(n);
        }
    }

    /// Number of numeric operands seen
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Final sum (0 when empty)
    pub fn total(&self) -> Numeric {
        if self.approx {
            Numeric::Float(self.sum + self.err)
        } else {
            Numeric::Int(self.int_sum)
        }
    }

    /// Average, or `None` when no numeric operand was seen
    pub fn average(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let total = if self.approx {
            self.sum + self.err
        } else {
            self.int_sum as f64
        };
        Some(total / self.count as f64)
    }

    fn switch_to_float(&mut self) {
        self.approx = true;
        self.sum = self.int_sum as f64;
        self.err = 0.0;
    }

    fn step(&mut self, r: f64) {
        let s = self.sum;
        let t = s + r;
        if s.abs() > r.abs() {
            self.err += (s - t) + r;
        } else {
            self.err += (r - t) + s;
        }
        self.sum = t;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_extraction() {
        assert_eq!(numeric(&json!(3)), Some(Numeric::Int(3)));
        assert_eq!(numeric(&json!(2.5)), Some(Numeric::Float(2.5)));
        assert_eq!(numeric(&json!("3")), None);
        assert_eq!(numeric(&json!(null)), None);
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!(0.0)));
        assert!(is_truthy(&json!("")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
        assert!(is_truthy(&json!(-1)));
    }

    #[test]
    fn test_type_names() {
        assert_eq!(type_name(&json!(1)), "int");
        assert_eq!(type_name(&json!(5_000_000_000i64)), "long");
        assert_eq!(type_name(&json!(1.5)), "double");
        assert_eq!(type_name(&json!("s")), "string");
        assert_eq!(type_name(&json!(true)), "bool");
    }

    #[test]
    fn test_integer_sum_stays_integer() {
        let mut sum = NumericSum::new();
        sum.add(Numeric::Int(2));
        sum.add(Numeric::Int(3));
        assert_eq!(sum.total(), Numeric::Int(5));
        assert_eq!(sum.average(), Some(2.5));
    }

    #[test]
    fn test_mixed_sum_is_float() {
        let mut sum = NumericSum::new();
        sum.add(Numeric::Int(1));
        sum.add(Numeric::Float(0.5));
        assert_eq!(sum.total(), Numeric::Float(1.5));
    }

    #[test]
    fn test_compensated_sum() {
        let mut sum = NumericSum::new();
        for _ in 0..10 {
            sum.add(Numeric::Float(0.1));
        }
        assert_eq!(sum.total(), Numeric::Float(1.0));
    }

    #[test]
    fn test_empty_sum() {
        let sum = NumericSum::new();
        assert_eq!(sum.total(), Numeric::Int(0));
        assert_eq!(sum.average(), None);
    }

    #[test]
    fn test_non_finite_becomes_null() {
        assert_eq!(float_value(f64::NAN), Value::Null);
        assert_eq!(Numeric::Float(f64::INFINITY).into_value(), Value::Null);
    }
}
