//! Declarative type expressions used by the escape table.
//!
//! A type expression is drawn from configuration and is one of:
//!
//! * a primitive tag: `str`, `int`, `float`, `bool`, `list`, `dict`, `none`;
//! * a pipe-separated union of expressions: `"str|int|none"`;
//! * a parametrized list: `"list[T]"`, every element must satisfy `T`;
//! * a JSON object mapping field names to expressions, validating a dict value
//!   field by field while ignoring fields it does not declare.
//!
//! A JSON array of tag strings is read as a union (`["str", "none"]`), and a
//! single-element array holding an object is read as a list of that object.
//!
//! Validation is three-valued: `Some(true)`, `Some(false)`, or `None` when the
//! expression contains a tag the validator does not recognize.

use std::fmt;

use serde_json::Value;

/// Leaf type tags understood by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Str,
    Int,
    Float,
    Bool,
    List,
    Dict,
    None,
}

impl Primitive {
    fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "str" => Self::Str,
            "int" => Self::Int,
            "float" => Self::Float,
            "bool" => Self::Bool,
            "list" => Self::List,
            "dict" => Self::Dict,
            "none" => Self::None,
            _ => return None,
        })
    }

    fn tag(self) -> &'static str {
        match self {
            Self::Str => "str",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Dict => "dict",
            Self::None => "none",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match (self, value) {
            (Self::Str, Value::String(_)) => true,
            (Self::Int, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Self::Float, Value::Number(n)) => n.is_f64(),
            (Self::Bool, Value::Bool(_)) => true,
            (Self::List, Value::Array(_)) => true,
            (Self::Dict, Value::Object(_)) => true,
            (Self::None, Value::Null) => true,
            _ => false,
        }
    }
}

/// Parsed form of a type expression.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeExpr {
    Primitive(Primitive),
    Union(Vec<TypeExpr>),
    List(Box<TypeExpr>),
    /// Declared fields in configuration order.
    Object(Vec<(String, TypeExpr)>),
}

impl TypeExpr {
    /// Parses a configuration value into a type expression.
    ///
    /// Returns `None` when any tag in the expression is unrecognized.
    ///
    /// # Examples
    ///
    /// ```
    /// use serde_json::json;
    /// use llm_bridge::validate::TypeExpr;
    ///
    /// let expr = TypeExpr::parse(&json!("list[str|int]")).unwrap();
    /// assert_eq!(expr.to_string(), "list[str|int]");
    /// assert!(TypeExpr::parse(&json!("list[bogus]")).is_none());
    /// ```
    pub fn parse(expr: &Value) -> Option<Self> {
        match expr {
            Value::String(text) => {
                let normalized: String = text
                    .chars()
                    .filter(|ch| !ch.is_whitespace())
                    .flat_map(char::to_lowercase)
                    .collect();
                parse_text(&normalized)
            }
            Value::Array(items) if !items.is_empty() && items.iter().all(Value::is_string) => {
                let alternatives = items.iter().map(Self::parse).collect::<Option<Vec<_>>>()?;
                Some(collapse(alternatives))
            }
            Value::Array(items) if items.len() == 1 => {
                Self::parse(&items[0]).map(|inner| Self::List(Box::new(inner)))
            }
            Value::Object(fields) => fields
                .iter()
                .map(|(name, field_expr)| Self::parse(field_expr).map(|e| (name.clone(), e)))
                .collect::<Option<Vec<_>>>()
                .map(Self::Object),
            _ => None,
        }
    }

    /// Checks `value` against this expression.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Primitive(primitive) => primitive.matches(value),
            Self::Union(alternatives) => alternatives.iter().any(|alt| alt.matches(value)),
            Self::List(element) => match value {
                Value::Array(items) => items.iter().all(|item| element.matches(item)),
                _ => false,
            },
            Self::Object(fields) => match value {
                Value::Object(map) => fields.iter().all(|(name, field_expr)| {
                    map.get(name).is_none_or(|field| field_expr.matches(field))
                }),
                _ => false,
            },
        }
    }
}

impl fmt::Display for TypeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive(primitive) => f.write_str(primitive.tag()),
            Self::Union(alternatives) => {
                for (idx, alt) in alternatives.iter().enumerate() {
                    if idx > 0 {
                        f.write_str("|")?;
                    }
                    write!(f, "{alt}")?;
                }
                Ok(())
            }
            Self::List(element) => write!(f, "list[{element}]"),
            Self::Object(fields) => {
                f.write_str("{")?;
                for (idx, (name, field_expr)) in fields.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{name}: {field_expr}")?;
                }
                f.write_str("}")
            }
        }
    }
}

fn parse_text(text: &str) -> Option<TypeExpr> {
    let alternatives = split_top_level(text)?
        .into_iter()
        .map(parse_alternative)
        .collect::<Option<Vec<_>>>()?;
    Some(collapse(alternatives))
}

fn parse_alternative(text: &str) -> Option<TypeExpr> {
    if let Some(inner) = text.strip_prefix("list[").and_then(|rest| rest.strip_suffix(']')) {
        return parse_text(inner).map(|element| TypeExpr::List(Box::new(element)));
    }
    Primitive::from_tag(text).map(TypeExpr::Primitive)
}

/// Splits on `|` outside of brackets. Unbalanced brackets or empty alternatives are
/// unrecognizable.
fn split_top_level(text: &str) -> Option<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (idx, ch) in text.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => depth = depth.checked_sub(1)?,
            '|' if depth == 0 => {
                parts.push(&text[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return None;
    }
    parts.push(&text[start..]);
    if parts.iter().any(|part| part.is_empty()) {
        return None;
    }
    Some(parts)
}

fn collapse(mut alternatives: Vec<TypeExpr>) -> TypeExpr {
    if alternatives.len() == 1 {
        alternatives.remove(0)
    } else {
        TypeExpr::Union(alternatives)
    }
}

/// Runtime type tag of a JSON value, using the same vocabulary as type expressions.
pub fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "none",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// Validates `value` against the type expression `expr`.
///
/// Returns `Some(true)` on a match, `Some(false)` on a mismatch and `None` when the
/// expression cannot be judged because it contains an unrecognized tag.
///
/// # Examples
///
/// ```
/// use serde_json::{Value, json};
/// use llm_bridge::validate::parse_types;
///
/// assert_eq!(parse_types(&json!("str|int"), &json!(3)), Some(true));
/// assert_eq!(parse_types(&json!("str"), &json!(3)), Some(false));
/// assert_eq!(parse_types(&json!("none"), &Value::Null), Some(true));
/// assert_eq!(parse_types(&json!("bogus"), &json!(3)), None);
/// ```
pub fn parse_types(expr: &Value, value: &Value) -> Option<bool> {
    TypeExpr::parse(expr).map(|parsed| parsed.matches(value))
}
