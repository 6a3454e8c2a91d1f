//! Build a [`SchemaDescriptor`] from what a caller actually has on hand:
//! an example record, or a compact type map.
//!
//! ```
//! use llm_jsongen::schema::{PatternKind, SchemaDescriptor};
//! use serde_json::json;
//!
//! let schema = SchemaDescriptor::infer(
//!     &json!({"user_email": "a@b.io", "age": 31, "tags": ["x"]}),
//!     None,
//! ).unwrap();
//! let email = schema.field("user_email").unwrap();
//! assert_eq!(email.constraints.pattern, Some(PatternKind::Email));
//! assert_eq!(schema.field("age").unwrap().constraints.max_value, Some(150.0));
//! ```

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{FieldSpec, FieldType, PatternKind, SchemaDescriptor};
use crate::error::{GenerationError, Result};

/// Business domain hinted at by a request's free-text context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Domain {
    Commerce,
    Healthcare,
    Finance,
    General,
}

impl Domain {
    pub fn detect(context: &str) -> Self {
        let lower = context.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));
        if has(&["commerce", "shop", "store", "product", "order"]) {
            Domain::Commerce
        } else if has(&["health", "medical", "patient", "clinic"]) {
            Domain::Healthcare
        } else if has(&["finance", "bank", "transaction", "account"]) {
            Domain::Finance
        } else {
            Domain::General
        }
    }
}

impl SchemaDescriptor {
    /// Infer a descriptor from an example record.
    ///
    /// Types come from the values, pattern kinds from field names and value
    /// shapes, numeric ranges from well-known names. `context` enables
    /// domain-specific constraints.
    pub fn infer(example: &Value, context: Option<&str>) -> Result<Self> {
        let Value::Object(map) = example else {
            return Err(GenerationError::InvalidRequest(format!(
                "example record must be a JSON object, got {}",
                FieldType::of(example)
            )));
        };
        if map.is_empty() {
            return Err(GenerationError::InvalidRequest(
                "example record has no fields".into(),
            ));
        }
        let domain = context.map(Domain::detect).unwrap_or(Domain::General);
        Ok(infer_object(map, domain))
    }

    /// Build a descriptor from a type map such as
    /// `{"id": "uuid", "email": "email", "age": "integer?", "tags": ["string"]}`.
    ///
    /// A trailing `?` marks a field optional. Nested objects and single-element
    /// arrays describe nested shapes.
    pub fn from_type_map(map: &Value) -> Result<Self> {
        let Value::Object(map) = map else {
            return Err(GenerationError::InvalidRequest(
                "type map must be a JSON object".into(),
            ));
        };
        if map.is_empty() {
            return Err(GenerationError::InvalidRequest("type map has no fields".into()));
        }
        let fields = map
            .iter()
            .map(|(name, spec)| typed_field(name, spec))
            .collect::<Result<Vec<_>>>()?;
        Ok(SchemaDescriptor::new(fields))
    }
}

fn infer_object(map: &Map<String, Value>, domain: Domain) -> SchemaDescriptor {
    SchemaDescriptor::new(
        map.iter()
            .map(|(name, value)| infer_field(name, value, domain))
            .collect(),
    )
}

fn infer_field(name: &str, value: &Value, domain: Domain) -> FieldSpec {
    let tokens = name_tokens(name);
    let mut field = match value {
        Value::Null => FieldSpec::new(name, FieldType::Any).nullable(),
        Value::String(s) => {
            let mut field = FieldSpec::string(name);
            field.constraints.pattern = detect_pattern(&tokens, s);
            field
        }
        Value::Number(_) => {
            let mut field = FieldSpec::new(name, FieldType::of(value));
            let (min, max) = numeric_range(&tokens);
            field.constraints.min_value = min;
            field.constraints.max_value = max;
            field
        }
        Value::Array(items) => match items.first() {
            Some(Value::Object(first)) => FieldSpec::array_of(name, infer_object(first, domain)),
            Some(first) => FieldSpec::array(name, FieldType::of(first)),
            None => FieldSpec::array(name, FieldType::Any),
        },
        Value::Object(inner) if !inner.is_empty() => {
            FieldSpec::object(name, infer_object(inner, domain))
        }
        other => FieldSpec::new(name, FieldType::of(other)),
    };
    apply_domain(&mut field, &tokens, domain);
    field
}

/// Split `userEmail`, `user_email` and `user-email` into lowercase words.
fn name_tokens(name: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for ch in name.chars() {
        if !ch.is_alphanumeric() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower && !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        current.extend(ch.to_lowercase());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn detect_pattern(tokens: &[String], value: &str) -> Option<PatternKind> {
    let has = |words: &[&str]| tokens.iter().any(|t| words.contains(&t.as_str()));

    let by_name = if has(&["email", "mail"]) {
        Some(PatternKind::Email)
    } else if has(&["phone", "telephone", "mobile", "fax"]) {
        Some(PatternKind::Phone)
    } else if has(&["url", "website", "link", "homepage"]) {
        Some(PatternKind::Url)
    } else if has(&["datetime", "timestamp"]) || tokens.last().is_some_and(|t| t == "at") {
        Some(PatternKind::DateTime)
    } else if has(&["date", "dob", "birthday"]) {
        Some(PatternKind::Date)
    } else if has(&["uuid", "guid"]) {
        Some(PatternKind::Uuid)
    } else if has(&["ip"]) {
        Some(PatternKind::IpAddress)
    } else if has(&["zip", "zipcode", "postal", "postcode"]) {
        Some(PatternKind::PostalCode)
    } else {
        None
    };
    if by_name.is_some() {
        return by_name;
    }

    // `id` alone is too generic; only trust it when the value agrees.
    shape_detectors()
        .iter()
        .find(|(_, re)| re.is_match(value))
        .map(|(kind, _)| kind.clone())
}

fn shape_detectors() -> &'static [(PatternKind, Regex)] {
    static DETECTORS: OnceLock<Vec<(PatternKind, Regex)>> = OnceLock::new();
    DETECTORS.get_or_init(|| {
        [
            PatternKind::Uuid,
            PatternKind::Email,
            PatternKind::DateTime,
            PatternKind::Date,
            PatternKind::Url,
            PatternKind::IpAddress,
        ]
        .into_iter()
        .filter_map(|kind| {
            let re = Regex::new(kind.regex_source()).ok()?;
            Some((kind, re))
        })
        .collect()
    })
}

fn numeric_range(tokens: &[String]) -> (Option<f64>, Option<f64>) {
    let has = |words: &[&str]| tokens.iter().any(|t| words.contains(&t.as_str()));
    if has(&["age"]) {
        (Some(0.0), Some(150.0))
    } else if has(&["percent", "percentage", "pct"]) {
        (Some(0.0), Some(100.0))
    } else if has(&["year"]) {
        (Some(1900.0), Some(2100.0))
    } else if has(&["price", "cost", "amount"]) {
        (Some(0.01), None)
    } else if has(&["count", "quantity", "qty"]) {
        (Some(0.0), None)
    } else {
        (None, None)
    }
}

fn apply_domain(field: &mut FieldSpec, tokens: &[String], domain: Domain) {
    let has = |word: &str| tokens.iter().any(|t| t == word);
    let c = &mut field.constraints;
    match domain {
        Domain::Commerce => {
            if has("price") && field.field_type != FieldType::String {
                c.min_value = Some(0.01);
                c.max_value = Some(999_999.99);
            } else if has("sku") && field.field_type == FieldType::String {
                c.pattern = Some(PatternKind::Custom(r"^[A-Z]{3}\d{3,6}$".into()));
            } else if has("quantity") && field.field_type != FieldType::String {
                c.min_value = Some(1.0);
                c.max_value = Some(9999.0);
            }
        }
        Domain::Healthcare => {
            if has("patient") && has("id") && field.field_type == FieldType::String {
                c.pattern = Some(PatternKind::Custom(r"^PT\d{6,10}$".into()));
            }
        }
        Domain::Finance => {
            if field.field_type != FieldType::String {
                return;
            }
            if has("account") {
                c.pattern = Some(PatternKind::Custom(r"^\d{10,16}$".into()));
            } else if has("routing") {
                c.pattern = Some(PatternKind::Custom(r"^\d{9}$".into()));
            }
        }
        Domain::General => {}
    }
}

fn typed_field(name: &str, spec: &Value) -> Result<FieldSpec> {
    match spec {
        Value::String(type_name) => {
            let (type_name, optional) = match type_name.trim().strip_suffix('?') {
                Some(stripped) => (stripped.trim(), true),
                None => (type_name.trim(), false),
            };
            let field = named_type(name, type_name).ok_or_else(|| {
                GenerationError::InvalidRequest(format!(
                    "unknown type '{type_name}' for field '{name}'"
                ))
            })?;
            Ok(if optional { field.optional() } else { field })
        }
        Value::Object(_) => Ok(FieldSpec::object(name, SchemaDescriptor::from_type_map(spec)?)),
        Value::Array(items) => match items.as_slice() {
            [] => Ok(FieldSpec::array(name, FieldType::Any)),
            [Value::Object(_)] => Ok(FieldSpec::array_of(
                name,
                SchemaDescriptor::from_type_map(&items[0])?,
            )),
            [item] => {
                let element = typed_field(name, item)?;
                if element.field_type == FieldType::Array || element.field_type == FieldType::Object {
                    return Err(GenerationError::InvalidRequest(format!(
                        "nested collection types are not supported for field '{name}'"
                    )));
                }
                Ok(FieldSpec::array(name, element.field_type))
            }
            _ => Err(GenerationError::InvalidRequest(format!(
                "array type for field '{name}' must have exactly one element"
            ))),
        },
        other => Err(GenerationError::InvalidRequest(format!(
            "field '{name}' has unsupported type description {other}"
        ))),
    }
}

fn named_type(name: &str, type_name: &str) -> Option<FieldSpec> {
    let field = match type_name.to_lowercase().as_str() {
        "string" | "str" | "text" => FieldSpec::string(name),
        "integer" | "int" => FieldSpec::integer(name),
        "number" | "float" | "double" | "decimal" => FieldSpec::number(name),
        "boolean" | "bool" => FieldSpec::boolean(name),
        "null" => FieldSpec::new(name, FieldType::Null),
        "any" => FieldSpec::new(name, FieldType::Any),
        "array" | "list" => FieldSpec::array(name, FieldType::Any),
        "object" => FieldSpec::new(name, FieldType::Object),
        "email" => FieldSpec::pattern(name, PatternKind::Email),
        "phone" => FieldSpec::pattern(name, PatternKind::Phone),
        "url" | "uri" => FieldSpec::pattern(name, PatternKind::Url),
        "date" => FieldSpec::pattern(name, PatternKind::Date),
        "datetime" | "date-time" | "timestamp" => FieldSpec::pattern(name, PatternKind::DateTime),
        "uuid" | "guid" => FieldSpec::pattern(name, PatternKind::Uuid),
        "ip" | "ipv4" | "ip_address" => FieldSpec::pattern(name, PatternKind::IpAddress),
        "zip" | "postal_code" | "postcode" => FieldSpec::pattern(name, PatternKind::PostalCode),
        _ => return None,
    };
    Some(field)
}
