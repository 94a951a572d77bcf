//! Variable validation declared with `@constraint` on the operation.
//!
//! ```graphql
//! mutation @constraint(variable: "email", format: "email", required: true) { ... }
//! ```
//!
//! Every failing rule is collected so the caller sees all problems at once.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::ast::{Directive, Node};

use super::CompileError;

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern"));
static UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("uuid pattern")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidErr {
    pub field: String,
    pub msg: String,
}

impl ValidErr {
    pub fn new(field: &str, msg: &str) -> Self {
        Self {
            field: field.to_string(),
            msg: msg.to_string(),
        }
    }
}

impl fmt::Display for ValidErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Email,
    Number,
    Alpha,
    AlphaNumeric,
    Uuid,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    Required,
    Format(Format),
    /// Minimum value for numbers, minimum length for strings and lists
    Min(f64),
    Max(f64),
    Length(usize),
    OneOf(Vec<Value>),
    Equals(String),
    NotEquals(String),
    GreaterThan(String),
    GreaterThanOrEquals(String),
    LessThan(String),
    LessThanOrEquals(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub var: String,
    pub rules: Vec<Rule>,
    /// Replaces the message of every failed rule
    pub error: Option<String>,
}

fn num(n: &Node) -> Option<f64> {
    match n {
        Node::Int(i) => Some(*i as f64),
        Node::Float(f) => Some(*f),
        _ => None,
    }
}

fn name(n: &Node) -> Option<String> {
    match n {
        Node::Str(s) | Node::Label(s) | Node::Var(s) => Some(s.clone()),
        _ => None,
    }
}

impl Constraint {
    pub fn from_directive(d: &Directive) -> Result<Self, CompileError> {
        let bad = |msg: String| CompileError::InvalidDirective {
            field: String::new(),
            name: d.name.clone(),
            msg,
        };

        let mut c = Constraint {
            var: String::new(),
            rules: Vec::new(),
            error: None,
        };

        for a in &d.args {
            let v = &a.val;
            let expect = |what: &str| bad(format!("{} expects {}, found {}", a.name, what, v.kind()));

            let rule = match a.name.as_str() {
                "variable" => {
                    c.var = name(v).ok_or_else(|| expect("a variable name"))?;
                    continue;
                }
                "error" => {
                    c.error = Some(name(v).ok_or_else(|| expect("a string"))?);
                    continue;
                }
                "required" => match v {
                    Node::Bool(true) => Rule::Required,
                    Node::Bool(false) => continue,
                    _ => return Err(expect("a boolean")),
                },
                "format" => {
                    let f = match name(v).as_deref() {
                        Some("email") => Format::Email,
                        Some("number") => Format::Number,
                        Some("alpha") => Format::Alpha,
                        Some("alphaNumeric") | Some("alphanumeric") => Format::AlphaNumeric,
                        Some("uuid") => Format::Uuid,
                        _ => return Err(expect("email, number, alpha, alphanumeric or uuid")),
                    };
                    Rule::Format(f)
                }
                "min" => Rule::Min(num(v).ok_or_else(|| expect("a number"))?),
                "max" => Rule::Max(num(v).ok_or_else(|| expect("a number"))?),
                "length" => match v {
                    Node::Int(n) if *n >= 0 => Rule::Length(*n as usize),
                    _ => return Err(expect("a positive integer")),
                },
                "oneOf" => match v {
                    Node::List(items) => Rule::OneOf(items.iter().map(Node::to_json).collect()),
                    _ => return Err(expect("a list")),
                },
                "equals" => Rule::Equals(name(v).ok_or_else(|| expect("a variable name"))?),
                "notEquals" => Rule::NotEquals(name(v).ok_or_else(|| expect("a variable name"))?),
                "greaterThan" => Rule::GreaterThan(name(v).ok_or_else(|| expect("a variable name"))?),
                "greaterThanOrEquals" => {
                    Rule::GreaterThanOrEquals(name(v).ok_or_else(|| expect("a variable name"))?)
                }
                "lessThan" => Rule::LessThan(name(v).ok_or_else(|| expect("a variable name"))?),
                "lessThanOrEquals" => {
                    Rule::LessThanOrEquals(name(v).ok_or_else(|| expect("a variable name"))?)
                }
                other => return Err(bad(format!("unknown validator '{}'", other))),
            };
            c.rules.push(rule);
        }

        if c.var.is_empty() {
            return Err(bad("variable is required".into()));
        }
        Ok(c)
    }

    fn check(&self, vars: &Map<String, Value>, errs: &mut Vec<ValidErr>) {
        let val = vars.get(&self.var).filter(|v| !v.is_null());
        let mut fail = |msg: String| {
            let msg = self.error.clone().unwrap_or(msg);
            errs.push(ValidErr {
                field: self.var.clone(),
                msg,
            });
        };

        for r in &self.rules {
            let Some(v) = val else {
                if *r == Rule::Required {
                    fail("is required".into());
                }
                continue;
            };

            match r {
                Rule::Required => {}
                Rule::Format(f) => {
                    let s = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                    let ok = match f {
                        Format::Email => EMAIL.is_match(&s),
                        Format::Number => s.parse::<f64>().is_ok(),
                        Format::Alpha => !s.is_empty() && s.chars().all(char::is_alphabetic),
                        Format::AlphaNumeric => !s.is_empty() && s.chars().all(char::is_alphanumeric),
                        Format::Uuid => UUID.is_match(&s),
                    };
                    if !ok {
                        let what = match f {
                            Format::Email => "email",
                            Format::Number => "number",
                            Format::Alpha => "alpha",
                            Format::AlphaNumeric => "alphanumeric",
                            Format::Uuid => "uuid",
                        };
                        fail(format!("must be a valid {}", what));
                    }
                }
                Rule::Min(n) => {
                    if size(v).is_some_and(|s| s < *n) {
                        fail(format!("must be at least {}", n));
                    }
                }
                Rule::Max(n) => {
                    if size(v).is_some_and(|s| s > *n) {
                        fail(format!("must be at most {}", n));
                    }
                }
                Rule::Length(n) => {
                    if len(v).is_some_and(|l| l != *n) {
                        fail(format!("must have length {}", n));
                    }
                }
                Rule::OneOf(list) => {
                    if !list.contains(v) {
                        fail("is not an allowed value".into());
                    }
                }
                Rule::Equals(o) => {
                    if vars.get(o) != Some(v) {
                        fail(format!("must equal {}", o));
                    }
                }
                Rule::NotEquals(o) => {
                    if vars.get(o) == Some(v) {
                        fail(format!("must not equal {}", o));
                    }
                }
                Rule::GreaterThan(o)
                | Rule::GreaterThanOrEquals(o)
                | Rule::LessThan(o)
                | Rule::LessThanOrEquals(o) => {
                    let (Some(a), Some(b)) = (v.as_f64(), vars.get(o).and_then(Value::as_f64)) else {
                        fail(format!("cannot be compared with {}", o));
                        continue;
                    };
                    let (ok, what) = match r {
                        Rule::GreaterThan(_) => (a > b, "greater than"),
                        Rule::GreaterThanOrEquals(_) => (a >= b, "greater than or equal to"),
                        Rule::LessThan(_) => (a < b, "less than"),
                        _ => (a <= b, "less than or equal to"),
                    };
                    if !ok {
                        fail(format!("must be {} {}", what, o));
                    }
                }
            }
        }
    }
}

fn len(v: &Value) -> Option<usize> {
    match v {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        _ => None,
    }
}

fn size(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        v => len(v).map(|l| l as f64),
    }
}

/// Check all constraints, returning every failure.
pub fn validate(constraints: &[Constraint], vars: &Map<String, Value>) -> Result<(), Vec<ValidErr>> {
    let mut errs = Vec::new();
    for c in constraints {
        c.check(vars, &mut errs);
    }
    if errs.is_empty() { Ok(()) } else { Err(errs) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use serde_json::json;

    fn constraints(q: &str) -> Vec<Constraint> {
        parse(q)
            .unwrap()
            .directives
            .iter()
            .map(|d| Constraint::from_directive(d).unwrap())
            .collect()
    }

    fn vars(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_collects_all_failures() {
        let c = constraints(
            r#"mutation m @constraint(variable: "email", format: "email", required: true)
                @constraint(variable: "age", min: 18)
                @constraint(variable: "name", max: 3) { users { id } }"#,
        );
        let errs = validate(&c, &vars(json!({"email": "nope", "age": 12, "name": "Jo"}))).unwrap_err();
        assert_eq!(
            errs,
            vec![
                ValidErr::new("email", "must be a valid email"),
                ValidErr::new("age", "must be at least 18"),
            ]
        );
        assert!(validate(&c, &vars(json!({"email": "a@b.com", "age": 30}))).is_ok());
    }

    #[test]
    fn test_required_and_custom_error() {
        let c = constraints(
            r#"query q @validate(variable: "id", required: true, error: "id please") { users { id } }"#,
        );
        let errs = validate(&c, &vars(json!({}))).unwrap_err();
        assert_eq!(errs[0].to_string(), "id: id please");
    }

    #[test]
    fn test_cross_variable_rules() {
        let c = constraints(
            r#"mutation m @constraint(variable: "password", equals: "confirm")
                @constraint(variable: "max", greaterThan: "min") { users { id } }"#,
        );
        assert!(validate(&c, &vars(json!({"password": "a", "confirm": "a", "max": 5, "min": 1}))).is_ok());
        let errs = validate(&c, &vars(json!({"password": "a", "confirm": "b", "max": 1, "min": 5}))).unwrap_err();
        assert_eq!(errs.len(), 2);
    }

    #[test]
    fn test_one_of_and_formats() {
        let c = constraints(
            r#"query q @constraint(variable: "color", oneOf: ["red", "blue"])
                @constraint(variable: "key", format: "uuid") { users { id } }"#,
        );
        assert!(validate(
            &c,
            &vars(json!({"color": "red", "key": "123e4567-e89b-12d3-a456-426614174000"}))
        )
        .is_ok());
        assert_eq!(validate(&c, &vars(json!({"color": "green", "key": "x"}))).unwrap_err().len(), 2);
    }

    #[test]
    fn test_bad_directive() {
        let op = parse(r#"query q @constraint(format: "email") { users { id } }"#).unwrap();
        assert!(Constraint::from_directive(&op.directives[0]).is_err());
    }
}
