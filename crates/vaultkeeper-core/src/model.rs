use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::CoreError;

/// Entity type label in `namespace.typename` form, always lowercase.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct ModelId(String);

impl ModelId {
    /// Parse and normalize a model label.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when the label is not `namespace.typename`.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let normalized = raw.trim().to_ascii_lowercase();
        let Some((namespace, type_name)) = normalized.split_once('.') else {
            return Err(CoreError::Validation(format!(
                "model label `{raw}` must be namespace.typename"
            )));
        };
        if namespace.is_empty() || type_name.is_empty() || type_name.contains('.') {
            return Err(CoreError::Validation(format!(
                "model label `{raw}` must be namespace.typename"
            )));
        }
        Ok(Self(normalized))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        self.0
            .split_once('.')
            .map_or("", |(namespace, _)| namespace)
    }
}

impl Display for ModelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ModelId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ModelId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ModelId> for String {
    fn from(value: ModelId) -> Self {
        value.0
    }
}

/// Primary key of a record. Integer keys sort before string keys.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(untagged)]
pub enum PrimaryKey {
    Int(i64),
    Str(String),
}

impl PrimaryKey {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Str(_) => "str",
        }
    }

    /// Interpret a raw JSON value as a key. Null, floats, booleans and containers are not keys.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number.as_i64().map(Self::Int),
            Value::String(text) => Some(Self::Str(text.clone())),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Int(value) => Value::from(*value),
            Self::Str(value) => Value::String(value.clone()),
        }
    }

    /// Rebuild a key from its stored `(kind, raw)` pair.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] for an unknown kind or a non-numeric integer key.
    pub fn decode(kind: &str, raw: &str) -> Result<Self, CoreError> {
        match kind {
            "int" => raw
                .parse::<i64>()
                .map(Self::Int)
                .map_err(|err| {
                    CoreError::Validation(format!("invalid integer key `{raw}`: {err}"))
                }),
            "str" => Ok(Self::Str(raw.to_string())),
            other => Err(CoreError::Validation(format!("unknown primary key kind `{other}`"))),
        }
    }
}

impl Ord for PrimaryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Int(left), Self::Int(right)) => left.cmp(right),
            (Self::Str(left), Self::Str(right)) => left.cmp(right),
            (Self::Int(_), Self::Str(_)) => Ordering::Less,
            (Self::Str(_), Self::Int(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for PrimaryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for PrimaryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Str(value) => f.write_str(value),
        }
    }
}

/// One persisted entity instance, serialized exactly as a Record Document element.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub model: ModelId,
    pub pk: PrimaryKey,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Record {
    #[must_use]
    pub fn new(model: ModelId, pk: PrimaryKey, fields: Map<String, Value>) -> Self {
        Self { model, pk, fields }
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Foreign-key value held in `field`, if it is set to a usable key.
    #[must_use]
    pub fn fk_value(&self, field: &str) -> Option<PrimaryKey> {
        self.fields.get(field).and_then(PrimaryKey::from_json)
    }

    /// True when `field` is absent, null, or an empty string.
    #[must_use]
    pub fn is_blank(&self, field: &str) -> bool {
        match self.fields.get(field) {
            None | Some(Value::Null) => true,
            Some(Value::String(text)) => text.is_empty(),
            Some(_) => false,
        }
    }
}
