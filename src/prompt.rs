//! Prompt construction for each [`Strategy`].
//!
//! Every prompt asks for exactly one JSON record. The builder is a pure
//! function of its inputs; nothing here touches the network.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use crate::schema::{Domain, FieldSpec, FieldType, PatternKind, SchemaDescriptor};
use crate::strategy::Strategy;
use crate::validator::Violation;

/// At most this many violations are quoted back to the model.
const MAX_FEEDBACK: usize = 5;
/// At most this many example records go into a prompt.
const MAX_EXAMPLES: usize = 3;

/// Substitute `{key}` placeholders from `vars` in a single pass.
///
/// `{{` and `}}` produce literal braces. Unknown placeholders are left as
/// they are, and substituted values are never rescanned.
///
/// ```
/// use std::collections::HashMap;
/// use llm_jsongen::prompt::render;
///
/// let vars = HashMap::from([("name", "Alice".to_string())]);
/// let out = render("Hello {name}, JSON: {{\"key\": \"val\"}}", &vars);
/// assert_eq!(out, r#"Hello Alice, JSON: {"key": "val"}"#);
/// ```
pub fn render(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('{') {
            if let Some(end) = tail.find('}') {
                if let Some(value) = vars.get(&tail[1..end]) {
                    out.push_str(value);
                    rest = &tail[end + 1..];
                    continue;
                }
            }
        }
        out.push_str(&tail[..1]);
        rest = &tail[1..];
    }
    out.push_str(rest);
    out
}

/// Create a numbered list from items (1-indexed).
pub fn numbered_list(items: &[String]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {}", i + 1, item))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Wrap text in a labeled markdown section.
pub fn section(label: &str, content: &str) -> String {
    format!("## {}\n{}", label, content)
}

/// Inputs to [`build_prompt`].
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub schema: &'a SchemaDescriptor,
    /// Free-text description of the records' domain.
    pub context: &'a str,
    /// Caller-supplied or previously accepted records.
    pub examples: &'a [Value],
    /// Violations from the previous attempt, quoted back as corrections.
    pub feedback: &'a [Violation],
}

impl<'a> PromptContext<'a> {
    pub fn new(schema: &'a SchemaDescriptor, context: &'a str) -> Self {
        Self {
            schema,
            context,
            examples: &[],
            feedback: &[],
        }
    }

    pub fn with_examples(mut self, examples: &'a [Value]) -> Self {
        self.examples = examples;
        self
    }

    pub fn with_feedback(mut self, feedback: &'a [Violation]) -> Self {
        self.feedback = feedback;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub system: Option<String>,
    pub user: String,
}

const ZERO_SHOT: &str = "Generate one realistic JSON record for {context}.

{schema}

{constraints}

Respond with a single JSON object and nothing else.";

const FEW_SHOT: &str = "Generate one realistic JSON record for {context}.

{schema}

{constraints}

{examples}

Follow the shape of the examples but use new, varied values. Respond with a \
single JSON object and nothing else.";

const CHAIN_OF_THOUGHT: &str = "Let's generate one JSON record for {context} step by step.

{schema}

{analysis}

Work through it in order:
1. Identify the domain and the values typical for it.
2. Make sure every required field is present.
3. Give each formatted field a value in exactly the stated format.
4. Check every value against its type and constraints.

Keep the reasoning brief, then give the final record as a single JSON object \
in a ```json code block.";

const STRUCTURED: &str = "Generate one JSON record for {context}.

{field_specs}

Output rules:
- A single JSON object, no surrounding prose or markdown.
- Exactly the fields listed above, spelled exactly as shown.
- Strings in double quotes; numbers and booleans unquoted.
- Every formatted field must match its format exactly.";

const COMBINED: &str = "I'll generate one JSON record for {context} using every guide available.

{analysis}

{examples}

{field_specs}

Reason through the fields briefly, then give the final record as a single \
JSON object in a ```json code block.";

/// Build the prompt for one attempt.
pub fn build_prompt(strategy: Strategy, ctx: &PromptContext<'_>) -> RenderedPrompt {
    let schema = ctx.schema;
    let context = if ctx.context.trim().is_empty() {
        "general use"
    } else {
        ctx.context.trim()
    };

    let mut vars: HashMap<&str, String> = HashMap::new();
    vars.insert("context", context.to_string());
    let template = match strategy {
        Strategy::ZeroShot => {
            vars.insert("schema", schema_section(schema));
            vars.insert("constraints", constraints_section(schema));
            ZERO_SHOT
        }
        Strategy::FewShot => {
            vars.insert("schema", schema_section(schema));
            vars.insert("constraints", constraints_section(schema));
            vars.insert("examples", examples_section(schema, context, ctx.examples));
            FEW_SHOT
        }
        Strategy::ChainOfThought => {
            vars.insert("schema", schema_section(schema));
            vars.insert("analysis", analysis_section(schema));
            CHAIN_OF_THOUGHT
        }
        Strategy::Structured => {
            vars.insert("field_specs", field_specs_section(schema));
            STRUCTURED
        }
        Strategy::MultiStrategy => {
            vars.insert("analysis", analysis_section(schema));
            vars.insert("examples", examples_section(schema, context, ctx.examples));
            vars.insert("field_specs", field_specs_section(schema));
            COMBINED
        }
    };

    let mut user = render(template, &vars);
    if !ctx.feedback.is_empty() {
        user.push_str("\n\n");
        user.push_str(&feedback_section(ctx.feedback));
    }

    RenderedPrompt {
        system: Some(system_instruction(schema.complexity_score()).to_string()),
        user,
    }
}

/// Templates run side by side for a multi-strategy attempt. Always at
/// least two, and always ending with the combined template.
pub fn multi_strategy_variants(schema: &SchemaDescriptor, has_examples: bool) -> Vec<Strategy> {
    let complexity = schema.complexity_score();
    let mut variants = Vec::with_capacity(4);
    if complexity > 0.5 {
        variants.push(Strategy::ChainOfThought);
    }
    if has_examples {
        variants.push(Strategy::FewShot);
    }
    if schema.has_patterns() || complexity > 0.3 {
        variants.push(Strategy::Structured);
    }
    if variants.is_empty() {
        variants.push(Strategy::Structured);
    }
    variants.push(Strategy::MultiStrategy);
    variants
}

fn system_instruction(complexity: f64) -> &'static str {
    if complexity > 0.7 {
        "You are an expert data generator specializing in complex, realistic JSON \
         structures. Pay careful attention to nesting and field constraints."
    } else if complexity > 0.3 {
        "You are a data generator creating realistic JSON records. Keep values \
         consistent and appropriate for the domain."
    } else {
        "You are a JSON data generator. Create simple, valid records."
    }
}

fn schema_section(schema: &SchemaDescriptor) -> String {
    let mut lines = Vec::new();
    outline(schema, 0, &mut lines);
    section("Schema", &lines.join("\n"))
}

fn outline(schema: &SchemaDescriptor, depth: usize, lines: &mut Vec<String>) {
    let indent = "  ".repeat(depth);
    for field in schema.fields() {
        let mut line = format!("{indent}- {}: {}", field.name, type_label(field));
        line.push_str(if field.constraints.required {
            " (required"
        } else {
            " (optional"
        });
        if field.constraints.nullable {
            line.push_str(", may be null");
        }
        line.push(')');
        lines.push(line);
        if let Some(ref nested) = field.nested {
            outline(nested, depth + 1, lines);
        }
    }
}

fn type_label(field: &FieldSpec) -> String {
    match (field.field_type, field.item_type) {
        (FieldType::Array, Some(FieldType::Object)) if field.nested.is_some() => {
            "array of objects".to_string()
        }
        (FieldType::Array, Some(item)) => format!("array of {item}"),
        (ty, _) => ty.to_string(),
    }
}

fn constraints_section(schema: &SchemaDescriptor) -> String {
    let mut rules = Vec::new();
    collect_rules(schema, "", &mut rules);
    if rules.is_empty() {
        rules.push("Use realistic values of the stated types.".to_string());
    }
    section("Requirements", &numbered_list(&rules))
}

fn collect_rules(schema: &SchemaDescriptor, prefix: &str, rules: &mut Vec<String>) {
    for field in schema.fields() {
        let path = crate::schema::join_path(prefix, &field.name);
        if let Some(rule) = field_rule(field) {
            rules.push(format!("{path}: {rule}"));
        }
        if let Some(ref nested) = field.nested {
            let child = if field.field_type == FieldType::Array {
                format!("{path}[]")
            } else {
                path
            };
            collect_rules(nested, &child, rules);
        }
    }
}

/// One-line summary of a field's constraints, if it has any.
fn field_rule(field: &FieldSpec) -> Option<String> {
    let c = &field.constraints;
    let mut parts = Vec::new();
    if let Some(ref kind) = c.pattern {
        parts.push(kind.describe());
    }
    if !c.enum_values.is_empty() {
        let allowed: Vec<String> = c.enum_values.iter().map(|v| v.to_string()).collect();
        parts.push(format!("one of {}", allowed.join(", ")));
    }
    match (c.min_value, c.max_value) {
        (Some(min), Some(max)) => parts.push(format!("between {min} and {max}")),
        (Some(min), None) => parts.push(format!("at least {min}")),
        (None, Some(max)) => parts.push(format!("at most {max}")),
        (None, None) => {}
    }
    match (c.min_length, c.max_length) {
        (Some(min), Some(max)) => parts.push(format!("length {min} to {max}")),
        (Some(min), None) => parts.push(format!("length at least {min}")),
        (None, Some(max)) => parts.push(format!("length at most {max}")),
        (None, None) => {}
    }
    (!parts.is_empty()).then(|| parts.join("; "))
}

fn analysis_section(schema: &SchemaDescriptor) -> String {
    let required: Vec<&str> = schema
        .fields()
        .iter()
        .filter(|f| f.constraints.required)
        .map(|f| f.name.as_str())
        .collect();
    let mut notes = vec![format!(
        "{} fields in total, nesting depth {}, complexity {:.2}.",
        schema.field_count(),
        schema.depth(),
        schema.complexity_score()
    )];
    if !required.is_empty() {
        notes.push(format!("Required top-level fields: {}.", required.join(", ")));
    }
    for (path, kind) in schema.patterns() {
        notes.push(format!("{path} must be a {}.", kind.describe()));
    }
    section("Schema analysis", &notes.join("\n"))
}

fn field_specs_section(schema: &SchemaDescriptor) -> String {
    let mut specs = Vec::new();
    collect_specs(schema, "", &mut specs);
    section("Field specifications", &specs.join("\n"))
}

fn collect_specs(schema: &SchemaDescriptor, prefix: &str, specs: &mut Vec<String>) {
    for field in schema.fields() {
        let path = crate::schema::join_path(prefix, &field.name);
        let mut line = format!("- {path}: {}", type_label(field));
        if !field.constraints.required {
            line.push_str(", optional");
        }
        if let Some(rule) = field_rule(field) {
            line.push_str(", ");
            line.push_str(&rule);
        }
        specs.push(line);
        if let Some(ref nested) = field.nested {
            let child = if field.field_type == FieldType::Array {
                format!("{path}[]")
            } else {
                path
            };
            collect_specs(nested, &child, specs);
        }
    }
}

fn examples_section(schema: &SchemaDescriptor, context: &str, supplied: &[Value]) -> String {
    let examples: Vec<Value> = if supplied.is_empty() {
        library_examples(schema, Domain::detect(context))
    } else {
        supplied.iter().take(MAX_EXAMPLES).cloned().collect()
    };
    let rendered: Vec<String> = examples
        .iter()
        .map(|e| serde_json::to_string_pretty(e).unwrap_or_else(|_| e.to_string()))
        .map(|e| format!("```json\n{e}\n```"))
        .collect();
    section("Examples", &rendered.join("\n"))
}

/// Domain library records that share most of the schema's top-level fields,
/// or a synthesized record when none do.
fn library_examples(schema: &SchemaDescriptor, domain: Domain) -> Vec<Value> {
    let wanted = schema.fields().len().max(1);
    let matching: Vec<Value> = domain_library(domain)
        .into_iter()
        .filter(|example| {
            let shared = schema
                .fields()
                .iter()
                .filter(|f| example.get(&f.name).is_some())
                .count();
            shared * 2 >= wanted
        })
        .take(MAX_EXAMPLES)
        .collect();
    if matching.is_empty() {
        vec![sample_record(schema)]
    } else {
        matching
    }
}

fn domain_library(domain: Domain) -> Vec<Value> {
    match domain {
        Domain::Commerce => vec![
            json!({
                "productId": "PROD-12345",
                "name": "Wireless Bluetooth Headphones",
                "price": 79.99,
                "category": "Electronics",
                "inStock": true,
                "ratings": {"average": 4.5, "count": 324}
            }),
            json!({
                "orderId": "ORD-67890",
                "customerId": "CUST-11111",
                "items": [{"productId": "PROD-12345", "quantity": 2, "price": 79.99}],
                "total": 159.98,
                "status": "shipped"
            }),
        ],
        Domain::Healthcare => vec![json!({
            "patientId": "PT000123",
            "firstName": "John",
            "lastName": "Doe",
            "dateOfBirth": "1980-05-15",
            "conditions": ["hypertension", "diabetes"],
            "medications": [{"name": "Metformin", "dosage": "500mg", "frequency": "twice daily"}]
        })],
        Domain::Finance => vec![json!({
            "accountNumber": "1234567890",
            "accountType": "savings",
            "balance": 5432.10,
            "transactions": [{
                "date": "2024-01-15",
                "type": "deposit",
                "amount": 1000.00,
                "description": "Salary"
            }]
        })],
        Domain::General => vec![json!({
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "name": "Example",
            "value": 100,
            "active": true
        })],
    }
}

/// A record that satisfies `schema`, built from placeholder values.
pub fn sample_record(schema: &SchemaDescriptor) -> Value {
    let mut record = Map::new();
    for field in schema.fields() {
        record.insert(field.name.clone(), sample_value(field));
    }
    Value::Object(record)
}

fn sample_value(field: &FieldSpec) -> Value {
    let c = &field.constraints;
    if let Some(first) = c.enum_values.first() {
        return first.clone();
    }
    if let Some(ref kind) = c.pattern {
        return Value::String(pattern_sample(kind).to_string());
    }
    match field.field_type {
        FieldType::String | FieldType::Any => {
            let len = c.min_length.unwrap_or(0).max(7);
            let len = c.max_length.map_or(len, |max| len.min(max));
            Value::String("example".chars().cycle().take(len).collect())
        }
        FieldType::Integer => json!(c.min_value.map_or(1, |min| min.ceil() as i64)),
        FieldType::Number => json!(c.min_value.unwrap_or(1.5)),
        FieldType::Boolean => Value::Bool(true),
        FieldType::Null => Value::Null,
        FieldType::Object => field
            .nested
            .as_deref()
            .map_or_else(|| json!({}), sample_record),
        FieldType::Array => {
            let item = match (&field.nested, field.item_type) {
                (Some(nested), _) => sample_record(nested),
                (None, Some(FieldType::Integer)) => json!(1),
                (None, Some(FieldType::Number)) => json!(1.5),
                (None, Some(FieldType::Boolean)) => json!(true),
                _ => json!("example"),
            };
            Value::Array(vec![item])
        }
    }
}

fn pattern_sample(kind: &PatternKind) -> &'static str {
    match kind {
        PatternKind::Email => "jane.doe@example.com",
        PatternKind::Phone => "+1-555-123-4567",
        PatternKind::Url => "https://www.example.com/item",
        PatternKind::Date => "2024-01-15",
        PatternKind::DateTime => "2024-01-15T10:30:00Z",
        PatternKind::Uuid => "550e8400-e29b-41d4-a716-446655440000",
        PatternKind::IpAddress => "192.168.1.10",
        PatternKind::PostalCode => "94103",
        PatternKind::Custom(_) => "example",
    }
}

fn feedback_section(feedback: &[Violation]) -> String {
    let mut items: Vec<String> = feedback.iter().take(MAX_FEEDBACK).map(|v| v.to_string()).collect();
    if feedback.len() > MAX_FEEDBACK {
        items.push(format!("...and {} more", feedback.len() - MAX_FEEDBACK));
    }
    section(
        "Corrections",
        &format!(
            "The previous answer had these problems:\n{}\nFix all of them in this answer.",
            numbered_list(&items)
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::{validate, ValidationLevel, ViolationKind};

    fn user_schema() -> SchemaDescriptor {
        SchemaDescriptor::new(vec![
            FieldSpec::pattern("id", PatternKind::Uuid),
            FieldSpec::string("name"),
            FieldSpec::pattern("email", PatternKind::Email),
        ])
    }

    fn order_schema() -> SchemaDescriptor {
        let item = SchemaDescriptor::new(vec![
            FieldSpec::string("sku").with_length(Some(3), Some(12)),
            FieldSpec::integer("qty").with_range(Some(1.0), Some(100.0)),
        ]);
        SchemaDescriptor::new(vec![
            FieldSpec::string("orderId"),
            FieldSpec::string("status").with_enum(["pending", "shipped"]),
            FieldSpec::pattern("placed", PatternKind::Date),
            FieldSpec::array_of("items", item),
            FieldSpec::string("note").optional().nullable(),
        ])
    }

    #[test]
    fn test_render_basic() {
        let vars = HashMap::from([("name", "Alice".to_string()), ("task", "data".to_string())]);
        assert_eq!(render("Hello {name}, process {task}", &vars), "Hello Alice, process data");
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        let vars = HashMap::new();
        assert_eq!(render("static {prompt}", &vars), "static {prompt}");
    }

    #[test]
    fn test_render_escaped_braces() {
        let vars = HashMap::from([("schema", "string".to_string())]);
        let out = render("Type is {schema}, format: {{\"result\": {{\"v\": 42}}}}", &vars);
        assert_eq!(out, r#"Type is string, format: {"result": {"v": 42}}"#);
    }

    #[test]
    fn test_render_does_not_rescan_values() {
        let vars = HashMap::from([("a", "{b}".to_string()), ("b", "oops".to_string())]);
        assert_eq!(render("{a}", &vars), "{b}");
    }

    #[test]
    fn test_numbered_list() {
        let items = vec!["First".to_string(), "Second".to_string()];
        assert_eq!(numbered_list(&items), "1. First\n2. Second");
        assert_eq!(numbered_list(&[]), "");
    }

    #[test]
    fn test_section() {
        assert_eq!(section("Context", "body"), "## Context\nbody");
    }

    #[test]
    fn test_every_strategy_mentions_every_field() {
        let schema = order_schema();
        for strategy in Strategy::ALL {
            let prompt = build_prompt(strategy, &PromptContext::new(&schema, "online store orders"));
            for name in ["orderId", "status", "placed", "items", "sku", "qty", "note"] {
                assert!(prompt.user.contains(name), "{strategy} prompt lacks {name}");
            }
            assert!(prompt.user.contains("online store orders"));
            assert!(prompt.system.is_some());
            assert!(!prompt.user.contains("{context}"));
        }
    }

    #[test]
    fn test_structured_lists_constraints() {
        let schema = order_schema();
        let prompt = build_prompt(Strategy::Structured, &PromptContext::new(&schema, ""));
        assert!(prompt.user.contains("items[].qty: integer, between 1 and 100"));
        assert!(prompt.user.contains(r#"one of "pending", "shipped""#));
        assert!(prompt.user.contains("calendar date as YYYY-MM-DD"));
        assert!(prompt.user.contains("general use"));
    }

    #[test]
    fn test_few_shot_prefers_supplied_examples() {
        let schema = user_schema();
        let examples = vec![json!({"id": "x", "name": "Grace Hopper", "email": "g@navy.mil"})];
        let prompt = build_prompt(
            Strategy::FewShot,
            &PromptContext::new(&schema, "users").with_examples(&examples),
        );
        assert!(prompt.user.contains("Grace Hopper"));
    }

    #[test]
    fn test_few_shot_falls_back_to_sample_record() {
        let schema = user_schema();
        let prompt = build_prompt(Strategy::FewShot, &PromptContext::new(&schema, "users"));
        assert!(prompt.user.contains("jane.doe@example.com"));
    }

    #[test]
    fn test_library_example_used_when_shape_matches() {
        let schema = SchemaDescriptor::new(vec![
            FieldSpec::string("accountNumber"),
            FieldSpec::string("accountType"),
            FieldSpec::number("balance"),
        ]);
        let prompt = build_prompt(Strategy::FewShot, &PromptContext::new(&schema, "bank accounts"));
        assert!(prompt.user.contains("5432.1"));
    }

    #[test]
    fn test_feedback_is_capped() {
        let schema = user_schema();
        let feedback: Vec<_> = (0..7)
            .map(|i| Violation::new(format!("f{i}"), ViolationKind::MissingField, "missing"))
            .collect();
        let prompt = build_prompt(
            Strategy::ZeroShot,
            &PromptContext::new(&schema, "users").with_feedback(&feedback),
        );
        assert!(prompt.user.contains("## Corrections"));
        assert!(prompt.user.contains("f4: missing"));
        assert!(!prompt.user.contains("f5: missing"));
        assert!(prompt.user.contains("and 2 more"));
    }

    #[test]
    fn test_sample_record_validates() {
        for schema in [user_schema(), order_schema()] {
            let raw = sample_record(&schema).to_string();
            let v = validate(&raw, &schema, ValidationLevel::Strict);
            assert!(v.accepted, "{raw}: {:?}", v.violations);
        }
    }

    #[test]
    fn test_multi_strategy_variants() {
        let simple = SchemaDescriptor::new(vec![FieldSpec::string("name")]);
        assert_eq!(
            multi_strategy_variants(&simple, false),
            vec![Strategy::Structured, Strategy::MultiStrategy]
        );

        let patterned = user_schema();
        let variants = multi_strategy_variants(&patterned, true);
        assert_eq!(
            variants,
            vec![Strategy::FewShot, Strategy::Structured, Strategy::MultiStrategy]
        );
    }
}
