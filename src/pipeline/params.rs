use serde::{Deserialize, Serialize};
use std::fmt;

/// Typed stage parameter value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "int",
            ParamValue::Float(_) => "float",
            ParamValue::Str(_) => "string",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            ParamValue::Bool(_) | ParamValue::Str(_) => None,
        }
    }

    /// Parse a command-line value using `like` to pick the type.
    pub fn parse_as(raw: &str, like: &ParamValue) -> Option<ParamValue> {
        let raw = raw.trim();
        match like {
            ParamValue::Bool(_) => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "on" => Some(ParamValue::Bool(true)),
                "false" | "0" | "off" => Some(ParamValue::Bool(false)),
                _ => None,
            },
            ParamValue::Int(_) => raw.parse().ok().map(ParamValue::Int),
            ParamValue::Float(_) => raw.parse().ok().map(ParamValue::Float),
            ParamValue::Str(_) => Some(ParamValue::Str(raw.to_string())),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Str(v) => write!(f, "\"{}\"", v),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

/// Declared parameter: name, default and (for numbers) an inclusive range.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub default: ParamValue,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ParamSpec {
    pub fn int(name: &'static str, default: i64, min: i64, max: i64) -> Self {
        Self {
            name,
            default: ParamValue::Int(default),
            min: Some(min as f64),
            max: Some(max as f64),
        }
    }

    pub fn float(name: &'static str, default: f64, min: f64, max: f64) -> Self {
        Self {
            name,
            default: ParamValue::Float(default),
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn bool(name: &'static str, default: bool) -> Self {
        Self {
            name,
            default: ParamValue::Bool(default),
            min: None,
            max: None,
        }
    }

    pub fn string(name: &'static str, default: &str) -> Self {
        Self {
            name,
            default: ParamValue::Str(default.to_string()),
            min: None,
            max: None,
        }
    }

    /// Accept `value` if it has the declared type and lies in range.
    ///
    /// An integer is accepted for a float parameter and widened.
    pub fn accept(&self, value: ParamValue) -> Option<ParamValue> {
        let value = match (&self.default, value) {
            (ParamValue::Float(_), ParamValue::Int(v)) => ParamValue::Float(v as f64),
            (ParamValue::Float(_), ParamValue::Float(v)) if v.is_nan() => return None,
            (default, value) if default.type_name() == value.type_name() => value,
            _ => return None,
        };
        if let Some(v) = value.as_f64() {
            if self.min.is_some_and(|min| v < min) || self.max.is_some_and(|max| v > max) {
                return None;
            }
        }
        Some(value)
    }
}

/// Current parameter values of one stage, in declaration order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StageParams {
    values: Vec<(String, ParamValue)>,
}

impl StageParams {
    pub fn from_schema(schema: &[ParamSpec]) -> Self {
        Self {
            values: schema
                .iter()
                .map(|spec| (spec.name.to_string(), spec.default.clone()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        self.get(name)?.as_f64()
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            ParamValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Overwrite an existing entry. Returns false for unknown names.
    pub(crate) fn replace(&mut self, name: &str, value: ParamValue) -> bool {
        match self.values.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}
