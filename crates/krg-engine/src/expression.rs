//! `${...}` expressions embedded in resource templates
//!
//! An expression is a field path rooted at a resource id or at `schema`
//! (the composite instance itself):
//!
//! ```text
//! ${schema.spec.name}
//! ${deployment.status.availableReplicas}
//! ${service.spec.ports[0].port}
//! ${configmap.metadata.labels["app.kubernetes.io/name"]}
//! ```
//!
//! A string that is exactly one expression is *standalone* and is replaced by
//! the referenced value whatever its type. Any other string containing
//! expressions is an *interpolation* and only accepts scalar values.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::ExpressionError;

static EXPRESSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([^}]*)\}").expect("valid regex"));

/// Values available to expressions, keyed by resource id (or `schema`)
pub type Bindings = BTreeMap<String, JsonValue>;

/// One step of a field path
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// Location inside a document
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldPath(pub Vec<PathSegment>);

impl FieldPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// This path extended by one segment
    pub fn child(&self, segment: PathSegment) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment);
        Self(segments)
    }

    /// Name of the first segment when it is a field
    pub fn first_field(&self) -> Option<&str> {
        match self.0.first() {
            Some(PathSegment::Field(name)) => Some(name),
            _ => None,
        }
    }

    pub fn lookup<'a>(&self, value: &'a JsonValue) -> Option<&'a JsonValue> {
        self.0.iter().try_fold(value, |current, segment| match segment {
            PathSegment::Field(name) => current.get(name.as_str()),
            PathSegment::Index(i) => current.get(*i),
        })
    }

    /// Write `value` at this path, creating intermediate containers
    pub fn set(&self, root: &mut JsonValue, value: JsonValue) {
        let mut current = root;
        for segment in &self.0 {
            current = match segment {
                PathSegment::Field(name) => {
                    if !current.is_object() {
                        *current = JsonValue::Object(Default::default());
                    }
                    let JsonValue::Object(map) = current else {
                        return;
                    };
                    map.entry(name.clone()).or_insert(JsonValue::Null)
                }
                PathSegment::Index(i) => {
                    if !current.is_array() {
                        *current = JsonValue::Array(Vec::new());
                    }
                    let JsonValue::Array(items) = current else {
                        return;
                    };
                    if items.len() <= *i {
                        items.resize(*i + 1, JsonValue::Null);
                    }
                    &mut items[*i]
                }
            };
        }
        *current = value;
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.0 {
            match segment {
                PathSegment::Field(name) if is_identifier(name) => write!(f, ".{}", name)?,
                PathSegment::Field(name) => write!(f, "[\"{}\"]", name)?,
                PathSegment::Index(i) => write!(f, "[{}]", i)?,
            }
        }
        Ok(())
    }
}

/// A `(target, field path)` pair found inside an expression
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reference {
    /// Resource id, or `schema`
    pub target: String,
    pub path: FieldPath,
}

impl Reference {
    pub fn new(target: impl Into<String>, path: FieldPath) -> Self {
        Self {
            target: target.into(),
            path,
        }
    }

    /// Parse the inside of `${...}`
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        Parser::new(source).parse()
    }

    /// Look the reference up in a set of bindings
    pub fn resolve<'a>(&self, bindings: &'a Bindings) -> Result<&'a JsonValue, ExpressionError> {
        bindings
            .get(&self.target)
            .and_then(|doc| self.path.lookup(doc))
            .ok_or_else(|| ExpressionError::Unresolved {
                reference: self.clone(),
            })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.target, self.path)
    }
}

/// An expression-bearing string leaf of a document
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    /// Where the leaf sits in the document
    pub location: FieldPath,
    /// The raw string, expressions included
    pub source: String,
    pub references: Vec<Reference>,
    /// Whether the string is exactly one expression
    pub standalone: bool,
}

/// Every distinct reference in a document
pub fn extract_references(value: &JsonValue) -> Result<BTreeSet<Reference>, ExpressionError> {
    Ok(extract_fields(value)?
        .into_iter()
        .flat_map(|field| field.references)
        .collect())
}

/// Every expression-bearing string leaf of a document, in document order
pub fn extract_fields(value: &JsonValue) -> Result<Vec<FieldDescriptor>, ExpressionError> {
    let mut fields = Vec::new();
    collect_fields(value, FieldPath::root(), &mut fields)?;
    Ok(fields)
}

fn collect_fields(
    value: &JsonValue,
    location: FieldPath,
    out: &mut Vec<FieldDescriptor>,
) -> Result<(), ExpressionError> {
    match value {
        JsonValue::String(s) => {
            if let Some((references, standalone)) = parse_string(s)? {
                out.push(FieldDescriptor {
                    location,
                    source: s.clone(),
                    references,
                    standalone,
                });
            }
        }
        JsonValue::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                collect_fields(item, location.child(PathSegment::Index(i)), out)?;
            }
        }
        JsonValue::Object(map) => {
            for (key, item) in map {
                collect_fields(item, location.child(PathSegment::Field(key.clone())), out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// References of a string and whether it is standalone; `None` without expressions
fn parse_string(s: &str) -> Result<Option<(Vec<Reference>, bool)>, ExpressionError> {
    let mut references = Vec::new();
    let mut standalone = false;

    for captures in EXPRESSION.captures_iter(s) {
        let (Some(whole), Some(inner)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        standalone = whole.start() == 0 && whole.end() == s.len();
        references.push(Reference::parse(inner.as_str())?);
    }

    if EXPRESSION.replace_all(s, "").contains("${") {
        return Err(ExpressionError::Syntax {
            expression: s.to_string(),
            message: "unterminated '${'".to_string(),
        });
    }

    if references.is_empty() {
        return Ok(None);
    }
    Ok(Some((references, standalone)))
}

/// Substitute every expression in a document
pub fn render(value: &JsonValue, bindings: &Bindings) -> Result<JsonValue, ExpressionError> {
    match value {
        JsonValue::String(s) => render_string(s, bindings),
        JsonValue::Array(items) => items
            .iter()
            .map(|item| render(item, bindings))
            .collect::<Result<Vec<_>, _>>()
            .map(JsonValue::Array),
        JsonValue::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                rendered.insert(key.clone(), render(item, bindings)?);
            }
            Ok(JsonValue::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

/// Substitute the expressions of one string
pub fn render_string(s: &str, bindings: &Bindings) -> Result<JsonValue, ExpressionError> {
    let Some((references, standalone)) = parse_string(s)? else {
        return Ok(JsonValue::String(s.to_string()));
    };
    if standalone {
        return references[0].resolve(bindings).cloned();
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for (captures, reference) in EXPRESSION.captures_iter(s).zip(&references) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        out.push_str(&s[last..whole.start()]);
        out.push_str(&scalar_text(reference, reference.resolve(bindings)?)?);
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(JsonValue::String(out))
}

fn scalar_text(reference: &Reference, value: &JsonValue) -> Result<String, ExpressionError> {
    match value {
        JsonValue::String(s) => Ok(s.clone()),
        JsonValue::Number(n) => Ok(n.to_string()),
        JsonValue::Bool(b) => Ok(b.to_string()),
        // Declared but not populated yet
        JsonValue::Null => Err(ExpressionError::Unresolved {
            reference: reference.clone(),
        }),
        JsonValue::Array(_) | JsonValue::Object(_) => Err(ExpressionError::TypeMismatch {
            expression: reference.to_string(),
            message: "cannot interpolate a list or map into a string".to_string(),
        }),
    }
}

/// The single reference of a `readyWhen` / `includeWhen` condition
pub fn condition_reference(expression: &str) -> Result<Reference, ExpressionError> {
    match parse_string(expression)? {
        Some((mut references, true)) => Ok(references.remove(0)),
        _ => Err(ExpressionError::Syntax {
            expression: expression.to_string(),
            message: "a condition must be a single ${...} expression".to_string(),
        }),
    }
}

/// Evaluate a condition to a boolean
///
/// Accepts JSON booleans and the `"True"`/`"False"` strings Kubernetes
/// conditions use.
pub fn evaluate_condition(expression: &str, bindings: &Bindings) -> Result<bool, ExpressionError> {
    let reference = condition_reference(expression)?;
    match reference.resolve(bindings)? {
        JsonValue::Bool(b) => Ok(*b),
        JsonValue::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        JsonValue::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
        JsonValue::Null => Err(ExpressionError::Unresolved { reference }),
        other => Err(ExpressionError::TypeMismatch {
            expression: reference.to_string(),
            message: format!("expected a boolean, got {}", other),
        }),
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

struct Parser<'a> {
    source: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.trim().chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::Syntax {
            expression: self.source.to_string(),
            message: message.into(),
        }
    }

    fn parse(mut self) -> Result<Reference, ExpressionError> {
        let target = self
            .identifier()
            .ok_or_else(|| self.error("expected a resource id or 'schema'"))?;

        let mut segments = Vec::new();
        while let Some(&c) = self.chars.get(self.pos) {
            self.pos += 1;
            match c {
                '.' => {
                    let name = self
                        .identifier()
                        .ok_or_else(|| self.error("expected a field name after '.'"))?;
                    segments.push(PathSegment::Field(name));
                }
                '[' => {
                    segments.push(self.bracket()?);
                    if self.chars.get(self.pos) != Some(&']') {
                        return Err(self.error("expected ']'"));
                    }
                    self.pos += 1;
                }
                other => return Err(self.error(format!("unexpected character '{}'", other))),
            }
        }

        Ok(Reference::new(target, FieldPath(segments)))
    }

    fn identifier(&mut self) -> Option<String> {
        let start = self.pos;
        while let Some(&c) = self.chars.get(self.pos) {
            let valid = if self.pos == start {
                c.is_ascii_alphabetic() || c == '_'
            } else {
                c.is_ascii_alphanumeric() || c == '_' || c == '-'
            };
            if !valid {
                break;
            }
            self.pos += 1;
        }
        (self.pos > start).then(|| self.chars[start..self.pos].iter().collect())
    }

    /// Body of `[...]`: an index or a quoted field name
    fn bracket(&mut self) -> Result<PathSegment, ExpressionError> {
        match self.chars.get(self.pos).copied() {
            Some(quote @ ('"' | '\'')) => {
                self.pos += 1;
                let start = self.pos;
                while self.chars.get(self.pos).is_some_and(|&c| c != quote) {
                    self.pos += 1;
                }
                if self.pos >= self.chars.len() {
                    return Err(self.error("unterminated quoted field"));
                }
                let name: String = self.chars[start..self.pos].iter().collect();
                self.pos += 1;
                Ok(PathSegment::Field(name))
            }
            _ => {
                let start = self.pos;
                while self.chars.get(self.pos).is_some_and(char::is_ascii_digit) {
                    self.pos += 1;
                }
                let digits: String = self.chars[start..self.pos].iter().collect();
                digits
                    .parse()
                    .map(PathSegment::Index)
                    .map_err(|_| self.error("expected an index or a quoted field name"))
            }
        }
    }
}
