// src/core/template.rs — Prompt templating

use minijinja::value::ValueKind;
use minijinja::{Environment, UndefinedBehavior};
use serde_json::Value;

use crate::infra::errors::RllmError;

/// Render `{{dotted.path}}` placeholders against `context`.
///
/// Contract (shared with the `uses.with` mappings): unresolved paths and
/// nulls render as empty strings; objects and arrays render as their
/// JSON text form.
pub fn render(template: &str, context: &Value) -> Result<String, RllmError> {
    let mut env = Environment::new();
    // Chainable lets `{{a.b.c}}` stay undefined through the whole path
    // instead of erroring on attribute access of an undefined base.
    env.set_undefined_behavior(UndefinedBehavior::Chainable);
    env.set_formatter(|out, _state, value| match value.kind() {
        ValueKind::Undefined | ValueKind::None => Ok(()),
        ValueKind::Bool => out
            .write_str(if value.is_true() { "true" } else { "false" })
            .map_err(|_| {
                minijinja::Error::new(
                    minijinja::ErrorKind::WriteFailure,
                    "failed to write rendered value",
                )
            }),
        ValueKind::Map | ValueKind::Seq | ValueKind::Iterable => {
            let text = serde_json::to_string(value).map_err(|e| {
                minijinja::Error::new(minijinja::ErrorKind::BadSerialization, e.to_string())
            })?;
            out.write_str(&text).map_err(|_| {
                minijinja::Error::new(
                    minijinja::ErrorKind::WriteFailure,
                    "failed to write rendered value",
                )
            })
        }
        _ => {
            write!(out, "{value}").map_err(|_| {
                minijinja::Error::new(
                    minijinja::ErrorKind::WriteFailure,
                    "failed to write rendered value",
                )
            })
        }
    });

    env.render_str(template, minijinja::Value::from_serialize(context))
        .map_err(|e| RllmError::Template {
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_dotted_path_substitution() {
        let ctx = json!({"input": {"text": "hello"}});
        assert_eq!(render("Say: {{input.text}}!", &ctx).unwrap(), "Say: hello!");
    }

    #[test]
    fn test_unresolved_path_renders_empty() {
        let ctx = json!({"input": {}});
        assert_eq!(render("[{{input.missing}}]", &ctx).unwrap(), "[]");
        assert_eq!(render("[{{nothing.at.all}}]", &ctx).unwrap(), "[]");
    }

    #[test]
    fn test_null_renders_empty() {
        let ctx = json!({"input": {"x": null}});
        assert_eq!(render("[{{input.x}}]", &ctx).unwrap(), "[]");
    }

    #[test]
    fn test_structured_values_render_as_json() {
        let ctx = json!({"uses": {"kw": {"keywords": ["a", "b"]}}});
        assert_eq!(render("{{uses.kw.keywords}}", &ctx).unwrap(), r#"["a","b"]"#);
        assert_eq!(render("{{uses.kw}}", &ctx).unwrap(), r#"{"keywords":["a","b"]}"#);
    }

    #[test]
    fn test_numbers_and_bools_render_plainly() {
        let ctx = json!({"input": {"n": 3, "b": true, "f": false}});
        assert_eq!(
            render("{{input.n}}/{{input.b}}/{{input.f}}", &ctx).unwrap(),
            "3/true/false"
        );
    }

    #[test]
    fn test_malformed_template_is_an_error() {
        let err = render("{{ unclosed", &json!({})).unwrap_err();
        assert_eq!(err.code(), "RLLM_003");
    }
}
