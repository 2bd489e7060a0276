//! Data-described message schemas, validation and schema digests.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Textual prefix of schema digests.
pub const DIGEST_PREFIX: &str = "model:";

/// Semantic type of a schema field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    String,
    Int,
    Float,
    Bool,
    Record(Box<Schema>),
    List(Box<FieldKind>),
}

impl FieldKind {
    pub fn record(schema: Schema) -> Self {
        FieldKind::Record(Box::new(schema))
    }

    pub fn list(item: FieldKind) -> Self {
        FieldKind::List(Box::new(item))
    }

    fn canonical(&self) -> Value {
        match self {
            FieldKind::String => json!("string"),
            FieldKind::Int => json!("int"),
            FieldKind::Float => json!("float"),
            FieldKind::Bool => json!("bool"),
            FieldKind::Record(schema) => json!({ "record": schema.canonical() }),
            FieldKind::List(item) => json!({ "list": item.canonical() }),
        }
    }

    fn label(&self) -> String {
        match self {
            FieldKind::String => "string".to_string(),
            FieldKind::Int => "int".to_string(),
            FieldKind::Float => "float".to_string(),
            FieldKind::Bool => "bool".to_string(),
            FieldKind::Record(schema) => format!("record {}", schema.name()),
            FieldKind::List(item) => format!("list of {}", item.label()),
        }
    }
}

/// Named, typed field of a schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

/// Stable digest of a schema, used for wire-level dispatch.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaDigest([u8; 32]);

impl SchemaDigest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for SchemaDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", DIGEST_PREFIX, hex::encode(self.0))
    }
}

impl fmt::Debug for SchemaDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SchemaDigest({})", self)
    }
}

impl FromStr for SchemaDigest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let hex_part = s
            .strip_prefix(DIGEST_PREFIX)
            .ok_or_else(|| Error::Validation(format!("schema digest must start with '{}'", DIGEST_PREFIX)))?;
        let bytes = hex::decode(hex_part)
            .map_err(|e| Error::Validation(format!("invalid schema digest hex: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Validation("schema digest must be 32 bytes".to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for SchemaDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SchemaDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A named, versioned message schema. The digest is computed once at build time.
#[derive(Debug, Clone)]
pub struct Schema {
    name: String,
    version: String,
    fields: Vec<Field>,
    digest: SchemaDigest,
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Schema {
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            name: name.into(),
            version: "1.0".to_string(),
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn digest(&self) -> SchemaDigest {
        self.digest
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Canonical JSON description: name plus fields sorted by name.
    pub fn canonical(&self) -> Value {
        let mut fields: Vec<&Field> = self.fields.iter().collect();
        fields.sort_by(|a, b| a.name.cmp(&b.name));
        let fields: Vec<Value> = fields
            .into_iter()
            .map(|f| json!({ "name": f.name, "kind": f.kind.canonical(), "required": f.required }))
            .collect();
        json!({ "name": self.name, "fields": fields })
    }

    /// Check that `value` is a complete, well-typed instance of this schema.
    pub fn validate(&self, value: &Value) -> Result<()> {
        self.validate_at(value, "")
    }

    fn validate_at(&self, value: &Value, path: &str) -> Result<()> {
        let object = value.as_object().ok_or_else(|| {
            Error::Validation(format!(
                "{}: expected record {}, got {}",
                display_path(path, &self.name),
                self.name,
                json_type(value)
            ))
        })?;

        for field in &self.fields {
            let field_path = join_path(path, &field.name);
            match object.get(&field.name) {
                None | Some(Value::Null) if !field.required => {}
                None | Some(Value::Null) => {
                    return Err(Error::Validation(format!(
                        "{}: missing required field '{}'",
                        self.name, field_path
                    )))
                }
                Some(v) => validate_kind(&field.kind, v, &field_path)?,
            }
        }

        if let Some(unknown) = object.keys().find(|k| self.field(k).is_none()) {
            return Err(Error::Validation(format!(
                "{}: unknown field '{}'",
                self.name,
                join_path(path, unknown)
            )));
        }

        Ok(())
    }

    pub fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        self.validate(value)?;
        Ok(serde_json::to_vec(value)?)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::Validation(format!("{}: malformed payload: {}", self.name, e)))?;
        self.validate(&value)?;
        Ok(value)
    }
}

/// Builder for [`Schema`]. A later field with the same name replaces the earlier one.
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    name: String,
    version: String,
    fields: Vec<Field>,
}

impl SchemaBuilder {
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn field(self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.push(name.into(), kind, true)
    }

    pub fn optional(self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.push(name.into(), kind, false)
    }

    fn push(mut self, name: String, kind: FieldKind, required: bool) -> Self {
        self.fields.retain(|f| f.name != name);
        self.fields.push(Field { name, kind, required });
        self
    }

    pub fn build(self) -> Schema {
        let mut schema = Schema {
            name: self.name,
            version: self.version,
            fields: self.fields,
            digest: SchemaDigest([0u8; 32]),
        };
        let canonical = serde_json::to_string(&schema.canonical()).unwrap_or_default();
        schema.digest = SchemaDigest(Sha256::digest(canonical.as_bytes()).into());
        schema
    }
}

/// A typed message with a data-described schema.
pub trait Model: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn schema() -> Schema;

    fn to_value(&self) -> Result<Value> {
        let value = serde_json::to_value(self)?;
        Self::schema().validate(&value)?;
        Ok(value)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let value = serde_json::to_value(self)?;
        Self::schema().encode(&value)
    }

    fn decode(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized,
    {
        let value = Self::schema().decode(bytes)?;
        Self::from_value(value)
    }

    fn from_value(value: Value) -> Result<Self>
    where
        Self: Sized,
    {
        serde_json::from_value(value).map_err(|e| Error::Validation(e.to_string()))
    }
}

fn validate_kind(kind: &FieldKind, value: &Value, path: &str) -> Result<()> {
    match (kind, value) {
        (FieldKind::String, Value::String(_)) => Ok(()),
        (FieldKind::Int, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(()),
        (FieldKind::Float, Value::Number(_)) => Ok(()),
        (FieldKind::Bool, Value::Bool(_)) => Ok(()),
        (FieldKind::Record(schema), v) => schema.validate_at(v, path),
        (FieldKind::List(item), Value::Array(items)) => items
            .iter()
            .enumerate()
            .try_for_each(|(i, v)| validate_kind(item, v, &format!("{}[{}]", path, i))),
        (kind, other) => Err(Error::Validation(format!(
            "field '{}' expected {}, got {}",
            path,
            kind.label(),
            json_type(other)
        ))),
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

fn display_path<'a>(path: &'a str, fallback: &'a str) -> &'a str {
    if path.is_empty() {
        fallback
    } else {
        path
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "record",
    }
}

/// Empty record, handy for building instances by hand.
pub fn record() -> Map<String, Value> {
    Map::new()
}
