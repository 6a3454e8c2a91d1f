//! Compiled validators and the per-schema cache shared across records.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use parking_lot::RwLock;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{quality_score, Coercion, Validation, ValidationLevel, Violation, ViolationKind};
use crate::output_parser::extract_json;
use crate::schema::{join_path, FieldSpec, FieldType, PatternKind, SchemaDescriptor};

/// A schema with its pattern matchers compiled.
#[derive(Debug)]
pub struct CompiledSchema {
    schema: SchemaDescriptor,
    fields: Vec<CompiledField>,
}

#[derive(Debug)]
struct CompiledField {
    spec: FieldSpec,
    matcher: Option<Regex>,
    nested: Option<CompiledSchema>,
}

impl CompiledSchema {
    /// Compile every pattern in `schema`. A custom pattern that is not a
    /// valid regex is skipped with a warning.
    pub fn compile(schema: &SchemaDescriptor) -> Self {
        let fields = schema
            .fields()
            .iter()
            .map(|spec| CompiledField {
                matcher: spec.constraints.pattern.as_ref().and_then(|kind| {
                    Regex::new(kind.regex_source())
                        .map_err(|e| warn!(field = %spec.name, error = %e, "skipping invalid pattern"))
                        .ok()
                }),
                nested: spec.nested.as_deref().map(CompiledSchema::compile),
                spec: spec.clone(),
            })
            .collect();
        Self {
            schema: schema.clone(),
            fields,
        }
    }

    pub fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    /// Parse `raw`, check it against the schema and score it.
    pub fn validate(&self, raw: &str, level: ValidationLevel) -> Validation {
        self.run(raw, level, false)
    }

    /// Like [`validate`](Self::validate), but first rewrites values of the
    /// wrong type that convert losslessly (`"42"` for an integer, `"true"`
    /// for a boolean, `7` for a string). Each rewrite is listed in
    /// [`Validation::coercions`].
    pub fn validate_coerced(&self, raw: &str, level: ValidationLevel) -> Validation {
        self.run(raw, level, true)
    }

    fn run(&self, raw: &str, level: ValidationLevel, coerce: bool) -> Validation {
        let extracted = match extract_json(raw) {
            Ok(extracted) => extracted,
            Err(e) => {
                let violations = vec![Violation::new("$", ViolationKind::ParsingError, e.to_string())];
                return Validation {
                    parsed: None,
                    quality_score: 0.0,
                    accepted: false,
                    violations,
                    extraction: None,
                    repairs: Vec::new(),
                    coercions: Vec::new(),
                };
            }
        };

        let mut value = unwrap_singleton(extracted.value);
        let mut coercions = Vec::new();
        if coerce {
            if let Value::Object(map) = &mut value {
                self.coerce_object(map, "", &mut coercions);
            }
            if !coercions.is_empty() {
                debug!(count = coercions.len(), "coerced field types");
            }
        }
        let (violations, score) = match value {
            Value::Object(ref map) => {
                let violations = self.check(map);
                let score = quality_score(&violations, self.schema.field_count());
                (violations, score)
            }
            ref other => {
                let message = format!("expected a JSON object, got {}", FieldType::of(other));
                (vec![Violation::new("$", ViolationKind::TypeMismatch, message)], 0.0)
            }
        };

        Validation {
            accepted: level.accepts(true, score, &violations),
            parsed: Some(value),
            violations,
            quality_score: score,
            extraction: Some(extracted.method),
            repairs: extracted.repairs,
            coercions,
        }
    }

    fn coerce_object(&self, record: &mut Map<String, Value>, prefix: &str, out: &mut Vec<Coercion>) {
        for field in &self.fields {
            if let Some(value) = record.get_mut(&field.spec.name) {
                field.coerce(value, &join_path(prefix, &field.spec.name), out);
            }
        }
    }

    /// All violations of `record`, in schema order followed by extra fields.
    pub fn check(&self, record: &Map<String, Value>) -> Vec<Violation> {
        let mut out = Vec::new();
        self.check_object(record, "", &mut out);
        out
    }

    fn check_object(&self, record: &Map<String, Value>, prefix: &str, out: &mut Vec<Violation>) {
        for field in &self.fields {
            let path = join_path(prefix, &field.spec.name);
            match record.get(&field.spec.name) {
                None if field.spec.constraints.required => {
                    out.push(Violation::new(path, ViolationKind::MissingField, "missing required field"));
                }
                None => {}
                Some(value) => field.check(value, &path, out),
            }
        }
        for key in record.keys() {
            if !self.fields.iter().any(|f| &f.spec.name == key) {
                out.push(Violation::new(
                    join_path(prefix, key),
                    ViolationKind::ExtraField,
                    "field is not part of the schema",
                ));
            }
        }
    }
}

impl CompiledField {
    fn coerce(&self, value: &mut Value, path: &str, out: &mut Vec<Coercion>) {
        if value.is_null() {
            return;
        }
        if !self.spec.field_type.accepts(value) {
            coerce_in_place(value, self.spec.field_type, path, out);
            return;
        }
        match value {
            Value::Object(map) => {
                if let Some(ref nested) = self.nested {
                    nested.coerce_object(map, path, out);
                }
            }
            Value::Array(items) => {
                let item_type = self.spec.item_type.unwrap_or(FieldType::Any);
                for (i, item) in items.iter_mut().enumerate() {
                    let item_path = format!("{path}[{i}]");
                    if !item_type.accepts(item) {
                        coerce_in_place(item, item_type, &item_path, out);
                    } else if let (Some(nested), Value::Object(map)) = (&self.nested, item) {
                        nested.coerce_object(map, &item_path, out);
                    }
                }
            }
            _ => {}
        }
    }

    fn check(&self, value: &Value, path: &str, out: &mut Vec<Violation>) {
        let spec = &self.spec;
        let c = &spec.constraints;

        if value.is_null() && (c.nullable || matches!(spec.field_type, FieldType::Null | FieldType::Any)) {
            return;
        }
        if !spec.field_type.accepts(value) {
            out.push(Violation::new(
                path,
                ViolationKind::TypeMismatch,
                format!("expected {}, got {}", spec.field_type, FieldType::of(value)),
            ));
            return;
        }

        if !c.enum_values.is_empty() && !c.enum_values.contains(value) {
            out.push(Violation::new(
                path,
                ViolationKind::PatternMismatch,
                format!("value {value} is not one of {}", Value::Array(c.enum_values.clone())),
            ));
        }

        match value {
            Value::String(s) => {
                self.check_pattern(s, path, out);
                check_length(s.chars().count(), c.min_length, c.max_length, path, out);
            }
            Value::Number(n) => {
                if let Some(x) = n.as_f64() {
                    let below = c.min_value.is_some_and(|min| x < min);
                    let above = c.max_value.is_some_and(|max| x > max);
                    if below || above {
                        out.push(Violation::new(
                            path,
                            ViolationKind::OutOfRange,
                            format!("{x} is outside {}", describe_range(c.min_value, c.max_value)),
                        ));
                    }
                }
            }
            Value::Array(items) => {
                check_length(items.len(), c.min_length, c.max_length, path, out);
                let item_type = spec.item_type.unwrap_or(FieldType::Any);
                for (i, item) in items.iter().enumerate() {
                    let item_path = format!("{path}[{i}]");
                    if !item_type.accepts(item) {
                        out.push(Violation::new(
                            item_path,
                            ViolationKind::TypeMismatch,
                            format!("expected {item_type} item, got {}", FieldType::of(item)),
                        ));
                    } else if let (Some(nested), Value::Object(map)) = (&self.nested, item) {
                        nested.check_object(map, &item_path, out);
                    }
                }
            }
            Value::Object(map) => {
                if let Some(ref nested) = self.nested {
                    nested.check_object(map, path, out);
                }
            }
            _ => {}
        }
    }

    fn check_pattern(&self, s: &str, path: &str, out: &mut Vec<Violation>) {
        let (Some(kind), Some(matcher)) = (&self.spec.constraints.pattern, &self.matcher) else {
            return;
        };
        let valid = matcher.is_match(s)
            && match kind {
                PatternKind::Date => NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok(),
                PatternKind::DateTime => is_calendar_datetime(s),
                _ => true,
            };
        if !valid {
            out.push(Violation::new(
                path,
                ViolationKind::PatternMismatch,
                format!("{s:?} is not a {}", kind.describe()),
            ));
        }
    }
}

fn coerce_in_place(value: &mut Value, target: FieldType, path: &str, out: &mut Vec<Coercion>) {
    if let Some(to) = coerced(value, target) {
        let from = std::mem::replace(value, to.clone());
        out.push(Coercion {
            field_path: path.to_string(),
            from,
            to,
        });
    }
}

/// Lossless conversion of `value` to `target`, if one exists.
fn coerced(value: &Value, target: FieldType) -> Option<Value> {
    match (target, value) {
        (FieldType::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
        (FieldType::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        (FieldType::String, Value::Number(n)) => Some(Value::String(n.to_string())),
        (FieldType::String, Value::Bool(b)) => Some(Value::String(b.to_string())),
        (FieldType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(Value::Bool(true)),
            "false" | "no" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        (FieldType::Boolean, Value::Number(n)) => match n.as_u64() {
            Some(0) => Some(Value::Bool(false)),
            Some(1) => Some(Value::Bool(true)),
            _ => None,
        },
        _ => None,
    }
}

fn is_calendar_datetime(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok()
        || ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
            .iter()
            .any(|fmt| NaiveDateTime::parse_from_str(s, fmt).is_ok())
}

fn check_length(len: usize, min: Option<usize>, max: Option<usize>, path: &str, out: &mut Vec<Violation>) {
    if min.is_some_and(|m| len < m) || max.is_some_and(|m| len > m) {
        let bounds = describe_range(min.map(|m| m as f64), max.map(|m| m as f64));
        out.push(Violation::new(
            path,
            ViolationKind::OutOfRange,
            format!("length {len} is outside {bounds}"),
        ));
    }
}

fn describe_range(min: Option<f64>, max: Option<f64>) -> String {
    match (min, max) {
        (Some(lo), Some(hi)) => format!("[{lo}, {hi}]"),
        (Some(lo), None) => format!("[{lo}, ∞)"),
        (None, Some(hi)) => format!("(-∞, {hi}]"),
        (None, None) => "(-∞, ∞)".to_string(),
    }
}

/// Models asked for one object sometimes wrap it in a list.
fn unwrap_singleton(value: Value) -> Value {
    match value {
        Value::Array(mut items) if items.len() == 1 && items[0].is_object() => items.remove(0),
        other => other,
    }
}

/// Compiled validators keyed by the structural fingerprint of their schema.
///
/// Shared read-mostly across concurrent record loops. Concurrent misses on
/// the same schema may both compile; the first insert wins and the loser's
/// copy is dropped.
#[derive(Debug, Default)]
pub struct ValidatorCache {
    entries: RwLock<HashMap<u64, Arc<CompiledSchema>>>,
    compilations: AtomicUsize,
}

impl ValidatorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(&self, schema: &SchemaDescriptor) -> Arc<CompiledSchema> {
        let key = schema.fingerprint();
        if let Some(hit) = self.entries.read().get(&key) {
            if hit.schema() == schema {
                return Arc::clone(hit);
            }
        }

        let compiled = Arc::new(CompiledSchema::compile(schema));
        self.compilations.fetch_add(1, Ordering::Relaxed);

        match self.entries.write().entry(key) {
            Entry::Vacant(slot) => Arc::clone(slot.insert(compiled)),
            Entry::Occupied(existing) if existing.get().schema() == schema => {
                Arc::clone(existing.get())
            }
            Entry::Occupied(_) => {
                debug!(fingerprint = key, "fingerprint collision, serving uncached validator");
                compiled
            }
        }
    }

    /// Validate `raw` with the cached validator for `schema`.
    pub fn validate(&self, raw: &str, schema: &SchemaDescriptor, level: ValidationLevel) -> Validation {
        self.get_or_compile(schema).validate(raw, level)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// How many times a schema has been compiled, cached or not.
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_schema() -> SchemaDescriptor {
        let item = SchemaDescriptor::new(vec![
            FieldSpec::string("sku").with_pattern(PatternKind::Custom(r"^[A-Z]{3}\d{3}$".into())),
            FieldSpec::integer("qty").with_range(Some(1.0), Some(99.0)),
        ]);
        SchemaDescriptor::new(vec![
            FieldSpec::pattern("placed", PatternKind::Date),
            FieldSpec::string("status").with_enum(["open", "shipped"]),
            FieldSpec::array_of("items", item).with_length(Some(1), None),
            FieldSpec::string("note").optional().nullable(),
        ])
    }

    fn check(value: Value) -> Vec<Violation> {
        let compiled = CompiledSchema::compile(&order_schema());
        compiled.check(value.as_object().unwrap())
    }

    #[test]
    fn test_nested_paths() {
        let violations = check(json!({
            "placed": "2024-02-30",
            "status": "lost",
            "items": [{"sku": "ABC123", "qty": 0}, {"sku": "abc", "qty": 2}, 7],
            "note": null
        }));
        let got: Vec<_> = violations
            .iter()
            .map(|v| (v.field_path.as_str(), v.kind))
            .collect();
        assert_eq!(
            got,
            vec![
                ("placed", ViolationKind::PatternMismatch),
                ("status", ViolationKind::PatternMismatch),
                ("items[0].qty", ViolationKind::OutOfRange),
                ("items[1].sku", ViolationKind::PatternMismatch),
                ("items[2]", ViolationKind::TypeMismatch),
            ]
        );
    }

    #[test]
    fn test_optional_and_empty_array() {
        let violations = check(json!({"placed": "2024-02-28", "status": "open", "items": []}));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::OutOfRange);
        assert_eq!(violations[0].field_path, "items");
    }

    #[test]
    fn test_datetime_formats() {
        let schema = SchemaDescriptor::new(vec![FieldSpec::pattern("at", PatternKind::DateTime)]);
        let compiled = CompiledSchema::compile(&schema);
        for ok in ["2024-01-15T10:30:00Z", "2024-01-15 10:30:00", "2024-01-15T10:30:00.250+02:00"] {
            assert!(compiled.check(json!({"at": ok}).as_object().unwrap()).is_empty(), "{ok}");
        }
        let bad = compiled.check(json!({"at": "2024-13-15T10:30:00Z"}).as_object().unwrap());
        assert_eq!(bad[0].kind, ViolationKind::PatternMismatch);
    }

    #[test]
    fn test_singleton_array_unwrapped() {
        let schema = SchemaDescriptor::new(vec![FieldSpec::string("name")]);
        let v = CompiledSchema::compile(&schema).validate(r#"[{"name": "Ada"}]"#, ValidationLevel::Strict);
        assert!(v.accepted);
        assert_eq!(v.parsed, Some(json!({"name": "Ada"})));
    }

    #[test]
    fn test_non_object_root() {
        let schema = SchemaDescriptor::new(vec![FieldSpec::string("name")]);
        let v = CompiledSchema::compile(&schema).validate("[1, 2, 3]", ValidationLevel::Moderate);
        assert_eq!(v.violations[0].field_path, "$");
        assert_eq!(v.violations[0].kind, ViolationKind::TypeMismatch);
        assert_eq!(v.quality_score, 0.0);
    }

    #[test]
    fn test_invalid_custom_pattern_is_skipped() {
        let schema = SchemaDescriptor::new(vec![
            FieldSpec::string("code").with_pattern(PatternKind::Custom("([unclosed".into())),
        ]);
        let compiled = CompiledSchema::compile(&schema);
        assert!(compiled.check(json!({"code": "anything"}).as_object().unwrap()).is_empty());
    }

    #[test]
    fn test_cache_compiles_once_per_schema() {
        let cache = ValidatorCache::new();
        let a = cache.get_or_compile(&order_schema());
        let b = cache.get_or_compile(&order_schema());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.compilations(), 1);

        let other = SchemaDescriptor::new(vec![FieldSpec::boolean("flag")]);
        cache.get_or_compile(&other);
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_shared_across_threads() {
        let cache = Arc::new(ValidatorCache::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    cache
                        .validate(r#"{"flag": true}"#, &SchemaDescriptor::new(vec![FieldSpec::boolean("flag")]), ValidationLevel::Strict)
                        .accepted
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(cache.len(), 1);
    }

    fn typed_schema() -> SchemaDescriptor {
        SchemaDescriptor::new(vec![
            FieldSpec::integer("age").with_range(Some(18.0), Some(99.0)),
            FieldSpec::boolean("active"),
            FieldSpec::array("scores", FieldType::Number),
            FieldSpec::object("address", SchemaDescriptor::new(vec![FieldSpec::string("zip")])),
        ])
    }

    const LOOSE: &str = r#"{"age": "42", "active": "yes", "scores": [1.5, "2.5"], "address": {"zip": 10115}}"#;

    #[test]
    fn test_types_not_coerced_by_default() {
        let v = CompiledSchema::compile(&typed_schema()).validate(LOOSE, ValidationLevel::Strict);
        assert!(!v.accepted);
        assert!(v.coercions.is_empty());
        let paths: Vec<_> = v.violations.iter().map(|v| (v.field_path.as_str(), v.kind)).collect();
        assert_eq!(
            paths,
            vec![
                ("age", ViolationKind::TypeMismatch),
                ("active", ViolationKind::TypeMismatch),
                ("scores[1]", ViolationKind::TypeMismatch),
                ("address.zip", ViolationKind::TypeMismatch),
            ]
        );
    }

    #[test]
    fn test_coerced_validation_records_rewrites() {
        let v = CompiledSchema::compile(&typed_schema()).validate_coerced(LOOSE, ValidationLevel::Strict);
        assert!(v.accepted, "{:?}", v.violations);
        assert_eq!(v.quality_score, 1.0);
        assert_eq!(
            v.parsed,
            Some(json!({"age": 42, "active": true, "scores": [1.5, 2.5], "address": {"zip": "10115"}}))
        );
        let got: Vec<_> = v.coercions.iter().map(|c| c.to_string()).collect();
        assert_eq!(
            got,
            vec![
                r#"age: "42" -> 42"#,
                r#"active: "yes" -> true"#,
                r#"scores[1]: "2.5" -> 2.5"#,
                r#"address.zip: 10115 -> "10115""#,
            ]
        );
    }

    #[test]
    fn test_uncoercible_value_keeps_violation() {
        let compiled = CompiledSchema::compile(&typed_schema());
        let v = compiled.validate_coerced(
            r#"{"age": "forty", "active": 2, "scores": [], "address": {"zip": "x"}}"#,
            ValidationLevel::Strict,
        );
        assert!(v.coercions.is_empty());
        assert_eq!(v.violations.len(), 2);
        assert_eq!(v.violations[0].field_path, "age");
        assert_eq!(v.violations[1].field_path, "active");

        // Coerced values still meet their range checks.
        let v = compiled.validate_coerced(
            r#"{"age": "7", "active": true, "scores": [], "address": {"zip": "x"}}"#,
            ValidationLevel::Strict,
        );
        assert_eq!(v.coercions.len(), 1);
        assert_eq!(v.violations[0].kind, ViolationKind::OutOfRange);
    }
}
