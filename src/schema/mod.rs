//! Normalized description of the JSON shape a request asks for.
//!
//! A [`SchemaDescriptor`] is an ordered list of [`FieldSpec`]s. Its
//! complexity score is derived from the fields on construction and is never
//! set directly; any change goes through a constructor that recomputes it.

pub mod analyzer;

pub use analyzer::Domain;

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The JSON type a field is expected to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Null,
    Any,
}

impl FieldType {
    /// The JSON type of a concrete value.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => FieldType::Null,
            Value::Bool(_) => FieldType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => FieldType::Integer,
            Value::Number(_) => FieldType::Number,
            Value::String(_) => FieldType::String,
            Value::Array(_) => FieldType::Array,
            Value::Object(_) => FieldType::Object,
        }
    }

    /// Whether `value` satisfies this type. Integers satisfy `Number`, and
    /// whole floats satisfy `Integer`.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::Any => true,
            FieldType::String => value.is_string(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Null => value.is_null(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => match value {
                Value::Number(n) => {
                    n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
                }
                _ => false,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Null => "null",
            FieldType::Any => "any",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named textual format a string field must follow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Email,
    Phone,
    Url,
    Date,
    DateTime,
    Uuid,
    IpAddress,
    PostalCode,
    /// A caller-supplied regular expression.
    Custom(String),
}

impl PatternKind {
    /// Human-readable format description used in prompts.
    pub fn describe(&self) -> String {
        match self {
            PatternKind::Email => "valid email address".into(),
            PatternKind::Phone => "phone number, e.g. +1-555-123-4567".into(),
            PatternKind::Url => "absolute http(s) URL".into(),
            PatternKind::Date => "calendar date as YYYY-MM-DD".into(),
            PatternKind::DateTime => "ISO 8601 timestamp, e.g. 2024-01-15T10:30:00Z".into(),
            PatternKind::Uuid => "UUID, e.g. 550e8400-e29b-41d4-a716-446655440000".into(),
            PatternKind::IpAddress => "IPv4 address".into(),
            PatternKind::PostalCode => "postal code, e.g. 12345 or 12345-6789".into(),
            PatternKind::Custom(re) => format!("string matching /{re}/"),
        }
    }

    /// Regular expression a value must match.
    pub fn regex_source(&self) -> &str {
        match self {
            PatternKind::Email => r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$",
            PatternKind::Phone => {
                r"^\+?(?:\d{1,3}[-\s.]?)?\(?\d{3}\)?[-\s.]?\d{3}[-\s.]?\d{4,6}$"
            }
            PatternKind::Url => r"^https?://(?:www\.)?[-a-zA-Z0-9@:%._+~#=]{1,256}\.[a-zA-Z0-9()]{1,6}\b",
            PatternKind::Date => r"^\d{4}-\d{2}-\d{2}$",
            PatternKind::DateTime => r"^\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}",
            PatternKind::Uuid => {
                r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$"
            }
            PatternKind::IpAddress => r"^(?:[0-9]{1,3}\.){3}[0-9]{1,3}$",
            PatternKind::PostalCode => r"^\d{5}(?:-\d{4})?$",
            PatternKind::Custom(re) => re,
        }
    }
}

/// Constraints layered on top of a field's type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default)]
    pub pattern: Option<PatternKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Value>,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
    /// String length or array item count lower bound.
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub nullable: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            pattern: None,
            enum_values: Vec::new(),
            min_value: None,
            max_value: None,
            min_length: None,
            max_length: None,
            required: true,
            nullable: false,
        }
    }
}

impl Constraints {
    /// Whether anything beyond type and presence is constrained.
    pub fn is_constrained(&self) -> bool {
        !self.enum_values.is_empty()
            || self.min_value.is_some()
            || self.max_value.is_some()
            || self.min_length.is_some()
            || self.max_length.is_some()
            || matches!(self.pattern, Some(PatternKind::Custom(_)))
    }
}

/// One named field of a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub constraints: Constraints,
    /// Element type for arrays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<FieldType>,
    /// Shape of an object field, or of each element of an array of objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nested: Option<Box<SchemaDescriptor>>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            constraints: Constraints::default(),
            item_type: None,
            nested: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Integer)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Number)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    /// A string field constrained to a named pattern.
    pub fn pattern(name: impl Into<String>, kind: PatternKind) -> Self {
        Self::string(name).with_pattern(kind)
    }

    pub fn object(name: impl Into<String>, schema: SchemaDescriptor) -> Self {
        let mut field = Self::new(name, FieldType::Object);
        field.nested = Some(Box::new(schema));
        field
    }

    pub fn array(name: impl Into<String>, item_type: FieldType) -> Self {
        let mut field = Self::new(name, FieldType::Array);
        field.item_type = Some(item_type);
        field
    }

    pub fn array_of(name: impl Into<String>, item_schema: SchemaDescriptor) -> Self {
        let mut field = Self::array(name, FieldType::Object);
        field.nested = Some(Box::new(item_schema));
        field
    }

    pub fn with_pattern(mut self, kind: PatternKind) -> Self {
        self.constraints.pattern = Some(kind);
        self
    }

    pub fn with_enum<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.constraints.enum_values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.constraints.min_value = min;
        self.constraints.max_value = max;
        self
    }

    pub fn with_length(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.constraints.min_length = min;
        self.constraints.max_length = max;
        self
    }

    pub fn optional(mut self) -> Self {
        self.constraints.required = false;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.constraints.nullable = true;
        self
    }
}

/// An ordered set of fields plus a derived complexity score in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawSchema")]
pub struct SchemaDescriptor {
    fields: Vec<FieldSpec>,
    complexity_score: f64,
}

#[derive(Deserialize)]
struct RawSchema {
    fields: Vec<FieldSpec>,
}

impl From<RawSchema> for SchemaDescriptor {
    fn from(raw: RawSchema) -> Self {
        SchemaDescriptor::new(raw.fields)
    }
}

impl SchemaDescriptor {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        let complexity_score = complexity(&fields);
        Self {
            fields,
            complexity_score,
        }
    }

    /// A copy of this descriptor with one more field.
    pub fn with_field(&self, field: FieldSpec) -> Self {
        let mut fields = self.fields.clone();
        fields.push(field);
        Self::new(fields)
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn complexity_score(&self) -> f64 {
        self.complexity_score
    }

    /// Number of fields including nested object and array-item fields.
    pub fn field_count(&self) -> usize {
        self.fields
            .iter()
            .map(|f| 1 + f.nested.as_ref().map_or(0, |n| n.field_count()))
            .sum()
    }

    /// Nesting depth; a flat schema has depth 1.
    pub fn depth(&self) -> usize {
        1 + self
            .fields
            .iter()
            .filter_map(|f| f.nested.as_ref().map(|n| n.depth()))
            .max()
            .unwrap_or(0)
    }

    /// Whether any field, at any depth, carries a named pattern.
    pub fn has_patterns(&self) -> bool {
        self.fields.iter().any(|f| {
            f.constraints.pattern.is_some() || f.nested.as_ref().is_some_and(|n| n.has_patterns())
        })
    }

    /// Every pattern used anywhere in the schema, with its dotted field path.
    pub fn patterns(&self) -> Vec<(String, PatternKind)> {
        let mut out = Vec::new();
        self.collect_patterns("", &mut out);
        out
    }

    fn collect_patterns(&self, prefix: &str, out: &mut Vec<(String, PatternKind)>) {
        for field in &self.fields {
            let path = join_path(prefix, &field.name);
            if let Some(ref kind) = field.constraints.pattern {
                out.push((path.clone(), kind.clone()));
            }
            if let Some(ref nested) = field.nested {
                nested.collect_patterns(&path, out);
            }
        }
    }

    /// Structural hash of the field list. Equal descriptors always share a
    /// fingerprint.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        // Canonical JSON of the fields; complexity is derived so it is left out.
        match serde_json::to_string(&self.fields) {
            Ok(canonical) => canonical.hash(&mut hasher),
            Err(_) => format!("{:?}", self.fields).hash(&mut hasher),
        }
        hasher.finish()
    }
}

pub(crate) fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn complexity(fields: &[FieldSpec]) -> f64 {
    if fields.is_empty() {
        return 0.0;
    }

    let mut total = 0usize;
    let mut structural = 0usize;
    let mut patterned = 0usize;
    let mut constrained = 0usize;
    let mut depth = 1usize;
    walk(fields, 1, &mut |field, level| {
        total += 1;
        depth = depth.max(level);
        if field.nested.is_some() || field.field_type == FieldType::Array {
            structural += 1;
        }
        if field.constraints.pattern.is_some() {
            patterned += 1;
        }
        if field.constraints.is_constrained() {
            constrained += 1;
        }
    });

    let n = total as f64;
    let size = (n / 20.0).min(1.0) * 0.25;
    let nesting = ((depth - 1) as f64 / 3.0).min(1.0) * 0.25;
    let structure = structural as f64 / n * 0.2;
    let patterns = patterned as f64 / n * 0.15;
    let density = constrained as f64 / n * 0.15;

    (size + nesting + structure + patterns + density).clamp(0.0, 1.0)
}

fn walk<F: FnMut(&FieldSpec, usize)>(fields: &[FieldSpec], level: usize, visit: &mut F) {
    for field in fields {
        visit(field, level);
        if let Some(ref nested) = field.nested {
            walk(nested.fields(), level + 1, visit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_schema() -> SchemaDescriptor {
        SchemaDescriptor::new(vec![
            FieldSpec::pattern("id", PatternKind::Uuid),
            FieldSpec::string("name"),
            FieldSpec::pattern("email", PatternKind::Email),
        ])
    }

    #[test]
    fn test_simple_schema_is_low_complexity() {
        let schema = user_schema();
        assert!(schema.complexity_score() < 0.2, "{}", schema.complexity_score());
        assert_eq!(schema.field_count(), 3);
        assert_eq!(schema.depth(), 1);
    }

    #[test]
    fn test_complexity_tracks_field_changes() {
        let schema = user_schema();
        let address = SchemaDescriptor::new(vec![
            FieldSpec::string("street"),
            FieldSpec::pattern("zip", PatternKind::PostalCode),
        ]);
        let bigger = schema.with_field(FieldSpec::object("address", address));
        assert!(bigger.complexity_score() > schema.complexity_score());
        assert_eq!(bigger.depth(), 2);
        assert_eq!(bigger.field_count(), 6);
        // the original is untouched
        assert_eq!(schema.field_count(), 3);
    }

    #[test]
    fn test_complexity_is_bounded() {
        let leaf = SchemaDescriptor::new(
            (0..30)
                .map(|i| FieldSpec::integer(format!("f{i}")).with_range(Some(0.0), Some(9.0)))
                .collect(),
        );
        let mid = SchemaDescriptor::new(vec![FieldSpec::array_of("items", leaf)]);
        let top = SchemaDescriptor::new(vec![
            FieldSpec::object("a", mid.clone()),
            FieldSpec::object("b", SchemaDescriptor::new(vec![FieldSpec::object("c", mid)])),
        ]);
        let score = top.complexity_score();
        assert!((0.0..=1.0).contains(&score));
        assert!(score > 0.5);
    }

    #[test]
    fn test_fingerprint_is_structural() {
        let a = user_schema();
        let b = user_schema();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = a.with_field(FieldSpec::boolean("active"));
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_deserialize_recomputes_complexity() {
        let raw = json!({
            "fields": [
                {"name": "id", "field_type": "string", "constraints": {"pattern": "uuid"}},
                {"name": "age", "field_type": "integer", "constraints": {"min_value": 0.0, "max_value": 150.0}}
            ],
            "complexity_score": 0.99
        });
        let schema: SchemaDescriptor = serde_json::from_value(raw).unwrap();
        assert!(schema.complexity_score() < 0.5);
        assert!(schema.field("id").unwrap().constraints.required);
        assert_eq!(schema.patterns(), vec![("id".to_string(), PatternKind::Uuid)]);
    }

    #[test]
    fn test_integer_accepts_whole_floats() {
        assert!(FieldType::Integer.accepts(&json!(3)));
        assert!(FieldType::Integer.accepts(&json!(3.0)));
        assert!(!FieldType::Integer.accepts(&json!(3.5)));
        assert!(FieldType::Number.accepts(&json!(3)));
        assert!(!FieldType::String.accepts(&json!(3)));
    }
}
