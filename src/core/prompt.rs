// src/core/prompt.rs — Attempt prompt construction

use serde_json::{json, Map, Value};

/// Recovery instruction used when the program declares none.
const DEFAULT_RECOVERY: &str = "Last attempt did not satisfy output_schema. \
     Respond with only a valid JSON object that satisfies output_schema.";

/// Maximum nesting depth when deriving an example instance from a schema.
const EXAMPLE_DEPTH_LIMIT: u32 = 4;

/// Builds the full prompt for each attempt: rendered base prompt plus the
/// output contract, plus a recovery instruction on retries.
pub struct PromptBuilder<'a> {
    rendered_prompt: &'a str,
    output_schema: &'a Value,
    recovery_prompt: &'a str,
}

impl<'a> PromptBuilder<'a> {
    pub fn new(rendered_prompt: &'a str, output_schema: &'a Value, recovery_prompt: &'a str) -> Self {
        Self {
            rendered_prompt,
            output_schema,
            recovery_prompt,
        }
    }

    pub fn attempt_prompt(&self, attempt: u32) -> String {
        let contract = output_contract(self.output_schema);
        let prompt = format!("{}\n\n{}", self.rendered_prompt, contract);
        if attempt == 0 {
            return prompt;
        }
        let recovery = if self.recovery_prompt.is_empty() {
            DEFAULT_RECOVERY
        } else {
            self.recovery_prompt
        };
        format!("{prompt}\n\nRecovery instruction:\n{recovery}")
    }
}

/// The schema-plus-example text injected into every attempt's prompt.
pub fn output_contract(output_schema: &Value) -> String {
    let schema_json =
        serde_json::to_string_pretty(output_schema).unwrap_or_else(|_| "{}".to_string());
    let example_json = serde_json::to_string_pretty(&schema_example(output_schema, 0))
        .unwrap_or_else(|_| "null".to_string());
    format!(
        "Output contract:\n\
         - Return ONLY one valid JSON object.\n\
         - No markdown, no prose, no extra wrappers.\n\n\
         Output schema (JSON):\n{schema_json}\n\n\
         Example output (JSON):\n{example_json}"
    )
}

/// Derive an example instance from a schema: first enum member, required
/// object properties, single-element arrays, zero-ish primitives. Type
/// lists drop `null` when another type is available.
fn schema_example(schema: &Value, depth: u32) -> Value {
    if depth > EXAMPLE_DEPTH_LIMIT {
        return Value::Null;
    }
    let Some(schema) = schema.as_object() else {
        return Value::Null;
    };

    if let Some(Value::Array(members)) = schema.get("enum") {
        if let Some(first) = members.first() {
            return first.clone();
        }
    }

    let schema_type = match schema.get("type") {
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(|t| t.as_str())
            .find(|t| *t != "null")
            .or_else(|| types.first().and_then(|t| t.as_str())),
        Some(Value::String(t)) => Some(t.as_str()),
        _ => None,
    };

    match schema_type {
        Some("object") => {
            let Some(props) = schema.get("properties").and_then(Value::as_object) else {
                return json!({});
            };
            let required: Vec<String> = match schema.get("required").and_then(Value::as_array) {
                Some(keys) => keys
                    .iter()
                    .filter_map(|k| k.as_str().map(str::to_string))
                    .collect(),
                None => props.keys().cloned().collect(),
            };
            let mut out = Map::new();
            for key in required {
                let child = props.get(&key).cloned().unwrap_or(json!({}));
                out.insert(key, schema_example(&child, depth + 1));
            }
            Value::Object(out)
        }
        Some("array") => {
            let items = schema.get("items").cloned().unwrap_or(json!({}));
            json!([schema_example(&items, depth + 1)])
        }
        Some("string") => json!("example"),
        Some("integer") => json!(0),
        Some("number") => json!(0.0),
        Some("boolean") => json!(false),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn summary_schema() -> Value {
        json!({
            "type": "object",
            "properties": {"summary": {"type": "string"}},
            "required": ["summary"],
        })
    }

    #[test]
    fn test_first_attempt_has_no_recovery() {
        let schema = summary_schema();
        let builder = PromptBuilder::new("Summarize.", &schema, "");
        let prompt = builder.attempt_prompt(0);
        assert!(prompt.starts_with("Summarize.\n\nOutput contract:"));
        assert!(!prompt.contains("Recovery instruction:"));
    }

    #[test]
    fn test_retry_appends_default_recovery() {
        let schema = summary_schema();
        let builder = PromptBuilder::new("Summarize.", &schema, "");
        let prompt = builder.attempt_prompt(1);
        assert!(prompt.contains("Recovery instruction:"));
        assert!(prompt.contains("did not satisfy output_schema"));
    }

    #[test]
    fn test_retry_prefers_program_recovery_prompt() {
        let schema = summary_schema();
        let builder = PromptBuilder::new("Summarize.", &schema, "Only JSON this time.");
        let prompt = builder.attempt_prompt(2);
        assert!(prompt.contains("Recovery instruction:\nOnly JSON this time."));
        assert!(!prompt.contains("did not satisfy output_schema"));
    }

    #[test]
    fn test_contract_embeds_schema_and_example() {
        let contract = output_contract(&summary_schema());
        assert!(contract.contains("\"summary\""));
        assert!(contract.contains("Example output (JSON):"));
        assert!(contract.contains("\"example\""));
    }

    #[test]
    fn test_schema_example_object_uses_required_keys() {
        let schema = json!({
            "type": "object",
            "properties": {
                "a": {"type": "integer"},
                "b": {"type": "string"},
            },
            "required": ["a"],
        });
        assert_eq!(schema_example(&schema, 0), json!({"a": 0}));
    }

    #[test]
    fn test_schema_example_enum_wins() {
        let schema = json!({"type": "string", "enum": ["high", "low"]});
        assert_eq!(schema_example(&schema, 0), json!("high"));
    }

    #[test]
    fn test_schema_example_type_list_skips_null() {
        let schema = json!({"type": ["null", "integer"]});
        assert_eq!(schema_example(&schema, 0), json!(0));
    }

    #[test]
    fn test_schema_example_array() {
        let schema = json!({"type": "array", "items": {"type": "boolean"}});
        assert_eq!(schema_example(&schema, 0), json!([false]));
    }

    #[test]
    fn test_schema_example_depth_cap() {
        // Deeply self-nesting object bottoms out as null instead of recursing.
        let mut schema = json!({"type": "string"});
        for _ in 0..8 {
            schema = json!({
                "type": "object",
                "properties": {"x": schema},
                "required": ["x"],
            });
        }
        let example = schema_example(&schema, 0);
        let text = serde_json::to_string(&example).unwrap();
        assert!(text.contains("null"));
    }
}
