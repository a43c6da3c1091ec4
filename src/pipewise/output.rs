//! Structured output decoding.
//!
//! An agent's final assistant text is decoded against the typed output
//! schema its descriptor declares. Models frequently wrap JSON in a
//! markdown code fence; the decoder strips one before parsing. Validation
//! failures carry the offending path so the runner can feed a corrective
//! message back into the loop (once) before giving up.

use serde_json::Value;
use std::error::Error;
use std::fmt;

/// A failed decode: where in the document, and why.
#[derive(Debug, Clone)]
pub struct DecodeError {
    /// JSON pointer to the offending location; `/` for document-level
    /// failures (e.g. unparseable text).
    pub path: String,
    pub message: String,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "output invalid at {}: {}", self.path, self.message)
    }
}

impl Error for DecodeError {}

/// Compiled decoder for one agent's output schema.
pub struct OutputDecoder {
    validator: jsonschema::Validator,
}

impl OutputDecoder {
    /// Compile a decoder. The schema was already validated at descriptor
    /// registration, so failures here indicate a registry bypass.
    pub fn new(schema: &Value) -> Result<Self, DecodeError> {
        let validator = jsonschema::validator_for(schema).map_err(|e| DecodeError {
            path: "/".into(),
            message: format!("schema did not compile: {}", e),
        })?;
        Ok(Self { validator })
    }

    /// Parse and validate a final assistant text.
    pub fn decode(&self, text: &str) -> Result<Value, DecodeError> {
        let stripped = strip_code_fence(text);
        let value: Value = serde_json::from_str(stripped).map_err(|e| DecodeError {
            path: "/".into(),
            message: format!("not valid JSON: {}", e),
        })?;
        match self.validator.validate(&value) {
            Ok(()) => Ok(value),
            Err(violation) => Err(DecodeError {
                path: violation.instance_path.to_string(),
                message: violation.to_string(),
            }),
        }
    }
}

/// Strip a single surrounding markdown code fence, if present.
///
/// Handles both ```` ``` ```` and ```` ```json ```` openers.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an optional language tag up to the first newline.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => return trimmed,
    };
    match body.rfind("```") {
        Some(idx) => body[..idx].trim(),
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn qualifier_decoder() -> OutputDecoder {
        OutputDecoder::new(&json!({
            "type": "object",
            "properties": {
                "qualified": {"type": "boolean"},
                "reason": {"type": "string", "minLength": 1},
            },
            "required": ["qualified", "reason"],
        }))
        .unwrap()
    }

    #[test]
    fn decodes_plain_json() {
        let value = qualifier_decoder()
            .decode(r#"{"qualified": true, "reason": "team of 25"}"#)
            .unwrap();
        assert_eq!(value["qualified"], true);
    }

    #[test]
    fn strips_fenced_json() {
        let text = "```json\n{\"qualified\": false, \"reason\": \"no fit\"}\n```";
        let value = qualifier_decoder().decode(text).unwrap();
        assert_eq!(value["reason"], "no fit");
    }

    #[test]
    fn reports_offending_path() {
        let err = qualifier_decoder()
            .decode(r#"{"qualified": "yes", "reason": "x"}"#)
            .unwrap_err();
        assert_eq!(err.path, "/qualified");
    }

    #[test]
    fn unparseable_text_fails_at_root() {
        let err = qualifier_decoder().decode("I think they qualify!").unwrap_err();
        assert_eq!(err.path, "/");
    }

    #[test]
    fn fence_without_language_tag() {
        assert_eq!(
            strip_code_fence("```\n{\"a\": 1}\n```"),
            "{\"a\": 1}"
        );
        assert_eq!(strip_code_fence("  plain  "), "plain");
    }
}
