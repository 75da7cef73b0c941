use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::types::Bindings;

/// Predicate could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid predicate '{expr}': {message}")]
pub struct PredicateError {
    pub expr: String,
    pub message: String,
}

impl PredicateError {
    fn new(expr: &str, message: impl Into<String>) -> Self {
        Self {
            expr: expr.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compare {
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Truthy(String),
    Falsy(String),
    Eq(String, Value),
    Ne(String, Value),
    Contains(String, Value),
    Cmp(String, Compare, f64),
}

/// A parsed condition over run variables.
///
/// Supported forms:
/// - `key` and `!key` for truthiness
/// - `key == "value"` / `key != "value"`
/// - `key contains "substr"` for strings and arrays
/// - `key > n`, `>=`, `<`, `<=` for numbers
///
/// A missing key is falsy and never compares equal, unequal or ordered.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    source: String,
    expr: Expr,
}

const KEY: &str = r"[A-Za-z_][A-Za-z0-9_.\-]*";

fn cached(cell: &'static OnceLock<Result<Regex, regex::Error>>, pattern: impl FnOnce() -> String) -> Result<&'static Regex, String> {
    cell.get_or_init(|| Regex::new(&pattern()))
        .as_ref()
        .map_err(|e| e.to_string())
}

fn unary_re() -> Result<&'static Regex, String> {
    static RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    cached(&RE, || format!(r"^(!)?\s*({})$", KEY))
}

fn binary_re() -> Result<&'static Regex, String> {
    static RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    cached(&RE, || format!(r"^({})\s*(==|!=|>=|<=|>|<)\s*(.+)$", KEY))
}

fn contains_re() -> Result<&'static Regex, String> {
    static RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    cached(&RE, || format!(r"^({})\s+contains\s+(.+)$", KEY))
}

/// Parse a literal: quoted string, JSON scalar, or bare word.
fn parse_literal(raw: &str) -> Value {
    let raw = raw.trim();
    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return Value::String(raw[1..raw.len() - 1].to_string());
        }
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => v,
        _ => Value::String(raw.to_string()),
    }
}

impl Predicate {
    pub fn parse(source: &str) -> Result<Self, PredicateError> {
        let text = source.trim();
        if text.is_empty() {
            return Err(PredicateError::new(source, "empty expression"));
        }
        let err = |m: String| PredicateError::new(source, m);

        if let Some(caps) = contains_re().map_err(err)?.captures(text) {
            let key = caps[1].to_string();
            return Ok(Self {
                source: text.to_string(),
                expr: Expr::Contains(key, parse_literal(&caps[2])),
            });
        }

        if let Some(caps) = binary_re().map_err(err)?.captures(text) {
            let key = caps[1].to_string();
            let literal = &caps[3];
            let expr = match &caps[2] {
                "==" => Expr::Eq(key, parse_literal(literal)),
                "!=" => Expr::Ne(key, parse_literal(literal)),
                op => {
                    let n: f64 = literal.trim().parse().map_err(|_| {
                        PredicateError::new(source, format!("'{}' needs a number, got '{}'", op, literal.trim()))
                    })?;
                    let cmp = match op {
                        ">" => Compare::Gt,
                        ">=" => Compare::Ge,
                        "<" => Compare::Lt,
                        _ => Compare::Le,
                    };
                    Expr::Cmp(key, cmp, n)
                }
            };
            return Ok(Self {
                source: text.to_string(),
                expr,
            });
        }

        if let Some(caps) = unary_re().map_err(err)?.captures(text) {
            let key = caps[2].to_string();
            let expr = if caps.get(1).is_some() {
                Expr::Falsy(key)
            } else {
                Expr::Truthy(key)
            };
            return Ok(Self {
                source: text.to_string(),
                expr,
            });
        }

        Err(PredicateError::new(source, "unrecognized expression"))
    }

    /// Evaluate against the run's variables.
    pub fn evaluate(&self, bindings: &Bindings) -> bool {
        match &self.expr {
            Expr::Truthy(key) => bindings.get(key).is_some_and(is_truthy),
            Expr::Falsy(key) => !bindings.get(key).is_some_and(is_truthy),
            Expr::Eq(key, lit) => bindings.get(key).is_some_and(|v| loosely_equal(v, lit)),
            Expr::Ne(key, lit) => bindings.get(key).is_some_and(|v| !loosely_equal(v, lit)),
            Expr::Contains(key, lit) => bindings.get(key).is_some_and(|v| match v {
                Value::String(s) => s.contains(&as_text(lit)),
                Value::Array(items) => items.iter().any(|item| loosely_equal(item, lit)),
                _ => false,
            }),
            Expr::Cmp(key, cmp, n) => bindings
                .get(key)
                .and_then(as_number)
                .is_some_and(|v| match cmp {
                    Compare::Gt => v > *n,
                    Compare::Ge => v >= *n,
                    Compare::Lt => v < *n,
                    Compare::Le => v <= *n,
                }),
        }
    }

    /// The variable this predicate reads.
    pub fn key(&self) -> &str {
        match &self.expr {
            Expr::Truthy(k)
            | Expr::Falsy(k)
            | Expr::Eq(k, _)
            | Expr::Ne(k, _)
            | Expr::Contains(k, _)
            | Expr::Cmp(k, _, _) => k,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for Predicate {
    type Err = PredicateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// `true`, non-zero numbers, non-empty strings other than "false"/"0", and
/// non-empty arrays and objects are truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    if let (Value::Number(x), Value::Number(y)) = (a, b) {
        return x.as_f64() == y.as_f64();
    }
    a == b || as_text(a) == as_text(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> Bindings {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn eval(expr: &str, bindings: &Bindings) -> bool {
        Predicate::parse(expr).unwrap().evaluate(bindings)
    }

    #[test]
    fn truthiness() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(2)));
        assert!(is_truthy(&json!("yes")));
        assert!(is_truthy(&json!([1])));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("false")));
        assert!(!is_truthy(&json!("0")));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!({})));
        assert!(!is_truthy(&Value::Null));
    }

    #[test]
    fn bare_key_and_negation() {
        let b = vars(&[("tests_pass", json!(true)), ("flaky", json!(false))]);
        assert!(eval("tests_pass", &b));
        assert!(!eval("!tests_pass", &b));
        assert!(eval("!flaky", &b));
        assert!(!eval("missing", &b));
        assert!(eval("!missing", &b));
    }

    #[test]
    fn equality() {
        let b = vars(&[("status", json!("success")), ("count", json!(3)), ("ok", json!(true))]);
        assert!(eval(r#"status == "success""#, &b));
        assert!(eval("status == success", &b));
        assert!(!eval(r#"status == "failure""#, &b));
        assert!(eval(r#"status != "failure""#, &b));
        assert!(eval("count == 3", &b));
        assert!(eval("count == 3.0", &b));
        assert!(eval("ok == true", &b));
        assert!(eval(r#"ok == "true""#, &b));
    }

    #[test]
    fn missing_key_compares_false() {
        let b = Bindings::new();
        assert!(!eval(r#"x == "a""#, &b));
        assert!(!eval(r#"x != "a""#, &b));
        assert!(!eval("x > 0", &b));
        assert!(!eval(r#"x contains "a""#, &b));
    }

    #[test]
    fn contains_strings_and_arrays() {
        let b = vars(&[
            ("output", json!("The file was created successfully.")),
            ("tags", json!(["fast", "stable"])),
        ]);
        assert!(eval(r#"output contains "created""#, &b));
        assert!(!eval(r#"output contains "deleted""#, &b));
        assert!(eval(r#"tags contains "stable""#, &b));
        assert!(!eval(r#"tags contains "slow""#, &b));
    }

    #[test]
    fn numeric_comparisons() {
        let b = vars(&[("coverage", json!(82.5)), ("retries", json!("2"))]);
        assert!(eval("coverage > 80", &b));
        assert!(eval("coverage >= 82.5", &b));
        assert!(!eval("coverage < 50", &b));
        assert!(eval("retries <= 2", &b));
    }

    #[test]
    fn parse_errors() {
        assert!(Predicate::parse("").is_err());
        assert!(Predicate::parse("this is not valid").is_err());
        assert!(Predicate::parse("x > high").is_err());
        assert!(Predicate::parse("== 3").is_err());
    }

    #[test]
    fn key_and_display() {
        let p = Predicate::parse("  score >= 3 ").unwrap();
        assert_eq!(p.key(), "score");
        assert_eq!(p.to_string(), "score >= 3");
    }
}
