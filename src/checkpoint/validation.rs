/// Structural validation of snapshot blobs
///
/// Snapshots are JSON documents. Before anything is stored they must be
/// non-empty, free of `NaN`/`Infinity` tokens, no deeper than the configured
/// nesting limit (deeper nesting is what serializing a self-referential
/// structure produces) and rooted at an object or array.
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of validating one snapshot
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapshotValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl SnapshotValidation {
    pub fn valid() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }

    /// Valid exactly when `errors` is empty
    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Combine two results; invalid if either is
    pub fn merge(mut self, other: SnapshotValidation) -> Self {
        self.valid = self.valid && other.valid;
        self.errors.extend(other.errors);
        if !self.valid && self.errors.is_empty() {
            self.errors.push("snapshot rejected by validator".to_string());
        }
        self
    }
}

/// Run every structural check on `blob`
pub fn validate_snapshot(blob: &[u8], max_depth: usize) -> SnapshotValidation {
    if blob.iter().all(u8::is_ascii_whitespace) {
        return SnapshotValidation::invalid(vec!["snapshot is empty".to_string()]);
    }

    let mut errors = scan_non_finite(blob);
    if !errors.is_empty() {
        // serde_json would only report the first bad token as a syntax error
        return SnapshotValidation::invalid(errors);
    }

    match serde_json::from_slice::<Value>(blob) {
        Ok(value) => {
            if !(value.is_object() || value.is_array()) {
                errors.push(format!(
                    "snapshot root must be an object or array, found {}",
                    kind(&value)
                ));
            }
            let depth = nesting_depth(&value);
            if depth > max_depth {
                errors.push(format!(
                    "nesting depth {} exceeds limit {} (circular reference?)",
                    depth, max_depth
                ));
            }
        }
        Err(e) if e.to_string().contains("recursion limit") => {
            errors.push(format!(
                "nesting exceeds parser recursion limit (circular reference?): {}",
                e
            ));
        }
        Err(e) if e.to_string().contains("number out of range") => {
            errors.push(format!("non-finite number: {}", e));
        }
        Err(e) => errors.push(format!("snapshot is not valid JSON: {}", e)),
    }

    SnapshotValidation::from_errors(errors)
}

/// Find bare `NaN`, `Infinity` and `-Infinity` tokens outside strings
fn scan_non_finite(blob: &[u8]) -> Vec<String> {
    const TOKENS: [&[u8]; 3] = [b"-Infinity", b"Infinity", b"NaN"];

    let mut errors = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < blob.len() {
        let b = blob[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        if b == b'"' {
            in_string = true;
            i += 1;
            continue;
        }

        if let Some(token) = TOKENS.iter().find(|t| blob[i..].starts_with(t)) {
            errors.push(format!(
                "non-finite number {} at byte {}",
                String::from_utf8_lossy(token),
                i
            ));
            i += token.len();
            continue;
        }
        i += 1;
    }

    errors
}

/// Depth of the deepest container, iteratively so hostile input cannot
/// overflow the stack
fn nesting_depth(value: &Value) -> usize {
    let mut max = 0;
    let mut stack = vec![(value, 1usize)];

    while let Some((node, depth)) = stack.pop() {
        match node {
            Value::Array(items) => {
                max = max.max(depth);
                stack.extend(items.iter().map(|v| (v, depth + 1)));
            }
            Value::Object(map) => {
                max = max.max(depth);
                stack.extend(map.values().map(|v| (v, depth + 1)));
            }
            _ => {}
        }
    }

    max
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
