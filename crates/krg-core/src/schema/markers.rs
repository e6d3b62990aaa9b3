//! Parsing of the shorthand field grammar
//!
//! A field is written as `<type> [| <marker>=<value> ...]`:
//!
//! ```text
//! replicas: integer | default=3 minimum=1
//! name: string | required=true description="Name of the app"
//! ports: "[]integer"
//! labels: map[string]string
//! ```

use crate::error::SchemaError;

/// Type part of a shorthand field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeToken {
    String,
    Integer,
    Number,
    Boolean,
    /// Free-form object
    Object,
    Array(Box<TypeToken>),
    /// `map[string]T`
    Map(Box<TypeToken>),
    /// Name of a type declared in the `types` section
    Custom(String),
}

impl TypeToken {
    /// Parse a type token such as `[]map[string]integer`
    pub fn parse(token: &str, field: &str) -> Result<Self, SchemaError> {
        let token = token.trim();
        let unknown = || SchemaError::UnknownTypeToken {
            field: field.to_string(),
            token: token.to_string(),
        };

        if let Some(inner) = token.strip_prefix("[]") {
            return Ok(Self::Array(Box::new(Self::parse(inner, field)?)));
        }
        if let Some(rest) = token.strip_prefix("map[") {
            let (key, value) = rest.split_once(']').ok_or_else(unknown)?;
            if key.trim() != "string" {
                return Err(unknown());
            }
            return Ok(Self::Map(Box::new(Self::parse(value, field)?)));
        }

        match token {
            "string" => Ok(Self::String),
            "integer" => Ok(Self::Integer),
            "number" | "float" => Ok(Self::Number),
            "boolean" | "bool" => Ok(Self::Boolean),
            "object" => Ok(Self::Object),
            _ if is_type_name(token) => Ok(Self::Custom(token.to_string())),
            _ => Err(unknown()),
        }
    }

    /// Whether values of this type are single scalars
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Self::String | Self::Integer | Self::Number | Self::Boolean
        )
    }
}

fn is_type_name(token: &str) -> bool {
    let mut chars = token.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A modifier following the `|` separator
#[derive(Debug, Clone, PartialEq)]
pub enum Marker {
    Required(bool),
    /// Raw default, parsed once the field type is known
    Default(String),
    Description(String),
    Enum(Vec<String>),
    Minimum(f64),
    Maximum(f64),
    Nullable(bool),
}

/// Split a shorthand field into its type token and markers
pub fn parse_field(raw: &str, field: &str) -> Result<(TypeToken, Vec<Marker>), SchemaError> {
    let (type_part, marker_part) = match raw.split_once('|') {
        Some((t, m)) => (t, m),
        None => (raw, ""),
    };
    let token = TypeToken::parse(type_part, field)?;
    let markers = parse_markers(marker_part, field)?;
    Ok((token, markers))
}

/// Parse `key=value key="quoted value"` pairs
pub fn parse_markers(input: &str, field: &str) -> Result<Vec<Marker>, SchemaError> {
    let invalid = |message: String| SchemaError::InvalidMarker {
        field: field.to_string(),
        message,
    };

    let mut markers = Vec::new();
    let mut chars = input.trim().chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                break;
            }
            key.push(c);
            chars.next();
        }
        if chars.next() != Some('=') {
            return Err(invalid(format!("expected '=' after '{}'", key)));
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    _ => value.push(c),
                }
            }
            if !closed {
                return Err(invalid(format!("unterminated quote in '{}'", key)));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }

        markers.push(to_marker(&key, value, field)?);
    }

    Ok(markers)
}

fn to_marker(key: &str, value: String, field: &str) -> Result<Marker, SchemaError> {
    let invalid = |message: String| SchemaError::InvalidMarker {
        field: field.to_string(),
        message,
    };
    let parse_bool = |v: &str| {
        v.parse::<bool>()
            .map_err(|_| invalid(format!("{} must be true or false, got '{}'", key, v)))
    };
    let parse_number = |v: &str| {
        v.parse::<f64>()
            .map_err(|_| invalid(format!("{} must be a number, got '{}'", key, v)))
    };

    match key {
        "required" => Ok(Marker::Required(parse_bool(&value)?)),
        "nullable" => Ok(Marker::Nullable(parse_bool(&value)?)),
        "default" => Ok(Marker::Default(value)),
        "description" => Ok(Marker::Description(value)),
        "enum" => Ok(Marker::Enum(
            value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        )),
        "minimum" => Ok(Marker::Minimum(parse_number(&value)?)),
        "maximum" => Ok(Marker::Maximum(parse_number(&value)?)),
        other => Err(invalid(format!("unknown marker '{}'", other))),
    }
}
