// src/util.rs — Token estimation heuristics

use serde_json::Value;

/// Conservative fallback when the provider returns no usage counters:
/// characters divided by four, floor of one.
pub fn estimate_tokens(text: &str) -> u64 {
    std::cmp::max(1, (text.len() / 4) as u64)
}

/// Estimated token cost of sending `payload` alongside `prompt`.
/// The payload is measured in its compact JSON form.
pub fn estimate_context_tokens(payload: &Value, prompt: &str) -> u64 {
    let data_text = serde_json::to_string(payload).unwrap_or_default();
    estimate_tokens(&data_text) + estimate_tokens(prompt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_estimate_tokens_floor() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }

    #[test]
    fn test_estimate_context_tokens() {
        // {"k":"v"} is 9 chars -> 2 tokens; prompt 8 chars -> 2 tokens
        let est = estimate_context_tokens(&json!({"k": "v"}), "abcdefgh");
        assert_eq!(est, 4);
    }

    #[test]
    fn test_estimate_context_tokens_minimum() {
        assert_eq!(estimate_context_tokens(&json!({}), ""), 2);
    }
}
