//! Message decoding and required-field validation
//!
//! Two wire formats are understood:
//! - `json`: a JSON object, unknown keys are kept in [`Message::body`]
//! - `string` / `str`: values separated by a delimiter, zipped with the field
//!   names listed in `format` (no quoting or escaping)
//!
//! Canonical fields are looked up through a data-driven mapping so wire keys
//! can be renamed without code changes.

use crate::config::{FieldSpec, MessageConfig};
use crate::error::DecodeError;
use pipeline_common::Message;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

pub const FIELD_UUID: &str = "uuid";
pub const FIELD_TYPE: &str = "type";
pub const FIELD_METADATA: &str = "metadata";
pub const FIELD_DATA_LOCATION: &str = "data_location";
pub const FIELD_META_LOCATION: &str = "meta_location";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parser {
    Json,
    Delimited { fields: Vec<String>, delimiter: String },
}

impl Parser {
    pub fn from_config(config: &MessageConfig) -> Result<Self, DecodeError> {
        match config.parser.to_lowercase().as_str() {
            "json" => Ok(Parser::Json),
            "string" | "str" => {
                let format = config.format.as_deref().ok_or_else(|| {
                    DecodeError::Malformed("the string parser requires a format".to_string())
                })?;
                Ok(Parser::Delimited {
                    fields: format.split(config.delimiter.as_str()).map(str::to_string).collect(),
                    delimiter: config.delimiter.clone(),
                })
            }
            "" => Err(DecodeError::UnsupportedParser("undefined".to_string())),
            other => Err(DecodeError::UnsupportedParser(other.to_string())),
        }
    }

    fn parse(&self, raw: &[u8]) -> Result<Map<String, Value>, DecodeError> {
        match self {
            Parser::Json => match serde_json::from_slice::<Value>(raw) {
                Ok(Value::Object(body)) => Ok(body),
                Ok(other) => Err(DecodeError::Malformed(format!(
                    "expected a JSON object, got {}",
                    json_kind(&other)
                ))),
                Err(e) => Err(DecodeError::Malformed(e.to_string())),
            },
            Parser::Delimited { fields, delimiter } => {
                let text = std::str::from_utf8(raw)
                    .map_err(|e| DecodeError::Malformed(format!("payload is not UTF-8: {e}")))?;
                Ok(fields
                    .iter()
                    .zip(text.split(delimiter.as_str()))
                    .map(|(k, v)| (k.clone(), Value::String(v.to_string())))
                    .collect())
            }
        }
    }

    fn render(&self, body: &Map<String, Value>) -> Result<Vec<u8>, DecodeError> {
        match self {
            Parser::Json => serde_json::to_vec(body).map_err(|e| DecodeError::Malformed(e.to_string())),
            Parser::Delimited { fields, delimiter } => {
                let values: Vec<String> = fields
                    .iter()
                    .map(|field| body.get(field).map(value_as_text).unwrap_or_default())
                    .collect();
                Ok(values.join(delimiter).into_bytes())
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Canonical field name to wire key and requirement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    fields: BTreeMap<String, FieldSpec>,
}

impl Default for FieldMapping {
    fn default() -> Self {
        let spec = |key: &str, required: bool| FieldSpec {
            key: Some(key.to_string()),
            required,
        };
        let mut fields = BTreeMap::new();
        fields.insert(FIELD_UUID.to_string(), spec(FIELD_UUID, true));
        fields.insert(FIELD_TYPE.to_string(), spec(FIELD_TYPE, false));
        fields.insert(FIELD_METADATA.to_string(), spec(FIELD_METADATA, false));
        fields.insert(FIELD_DATA_LOCATION.to_string(), spec(FIELD_DATA_LOCATION, true));
        fields.insert(FIELD_META_LOCATION.to_string(), spec(FIELD_META_LOCATION, true));
        Self { fields }
    }
}

impl FieldMapping {
    /// A configured mapping replaces the defaults; `data_location` is always required
    pub fn new(configured: Option<&BTreeMap<String, FieldSpec>>) -> Self {
        let mut mapping = match configured {
            Some(fields) => Self { fields: fields.clone() },
            None => Self::default(),
        };
        let data_location = mapping
            .fields
            .entry(FIELD_DATA_LOCATION.to_string())
            .or_default();
        data_location.required = true;
        mapping
    }

    /// Wire key of a canonical field
    pub fn key<'a>(&'a self, field: &'a str) -> &'a str {
        self.fields
            .get(field)
            .and_then(|spec| spec.key.as_deref())
            .unwrap_or(field)
    }

    /// Lowercased wire keys that must be present
    fn required_keys(&self) -> BTreeSet<String> {
        self.fields
            .iter()
            .filter(|(_, spec)| spec.required)
            .map(|(field, _)| self.key(field).to_lowercase())
            .collect()
    }

    /// Every missing required key, compared case-insensitively
    pub fn missing(&self, body: &Map<String, Value>) -> Vec<String> {
        let present: BTreeSet<String> = body.keys().map(|k| k.to_lowercase()).collect();
        self.required_keys()
            .into_iter()
            .filter(|key| !present.contains(key))
            .collect()
    }

    fn lookup<'b>(&self, body: &'b Map<String, Value>, field: &str) -> Option<&'b Value> {
        let key = self.key(field);
        body.get(key).or_else(|| {
            body.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
    }
}

/// Turns raw broker payloads into [`Message`]s
#[derive(Debug, Clone)]
pub struct MessageDecoder {
    parser: Parser,
    mapping: FieldMapping,
}

impl MessageDecoder {
    pub fn new(config: &MessageConfig) -> Result<Self, DecodeError> {
        Ok(Self {
            parser: Parser::from_config(config)?,
            mapping: FieldMapping::new(config.message_fields.as_ref()),
        })
    }

    pub fn parser(&self) -> &Parser {
        &self.parser
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    pub fn decode(&self, raw: &[u8]) -> Result<Message, DecodeError> {
        let body = self.parser.parse(raw)?;

        let missing = self.mapping.missing(&body);
        if !missing.is_empty() {
            debug!("Message is missing required fields: {:?}", missing);
            return Err(DecodeError::MissingFields(missing));
        }

        let text = |field: &str| self.mapping.lookup(&body, field).and_then(value_as_string);
        let data_location = text(FIELD_DATA_LOCATION).ok_or_else(|| {
            DecodeError::MissingFields(vec![self.mapping.key(FIELD_DATA_LOCATION).to_lowercase()])
        })?;

        let mut message = Message::new(data_location);
        message.uuid = text(FIELD_UUID);
        message.mime_type = text(FIELD_TYPE);
        message.meta_location = text(FIELD_META_LOCATION);
        message.metadata = self
            .mapping
            .lookup(&body, FIELD_METADATA)
            .filter(|value| !value.is_null())
            .cloned();
        message.body = body;
        Ok(message)
    }

    /// Render a message back to the wire format, canonical fields under their mapped keys
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, DecodeError> {
        let mut body = message.body.clone();
        let mut put = |field: &str, value: Option<Value>| {
            if let Some(value) = value {
                body.insert(self.mapping.key(field).to_string(), value);
            }
        };
        put(FIELD_UUID, message.uuid.clone().map(Value::String));
        put(FIELD_TYPE, message.mime_type.clone().map(Value::String));
        put(FIELD_METADATA, message.metadata.clone());
        put(FIELD_DATA_LOCATION, Some(Value::String(message.data_location.clone())));
        put(FIELD_META_LOCATION, message.meta_location.clone().map(Value::String));
        self.parser.render(&body)
    }
}

/// One-shot decode with a configuration
pub fn decode(raw: &[u8], config: &MessageConfig) -> Result<Message, DecodeError> {
    MessageDecoder::new(config)?.decode(raw)
}
