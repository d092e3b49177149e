//! Bound untrusted bridge payloads before the host keeps them.
//!
//! Console arguments are stored verbatim in the host log, so a sandbox could
//! otherwise hand the host an arbitrarily deep value to walk on every render.

use anyhow::{anyhow, Result};
use serde_json::Value;

/// Maximum nesting depth for objects/arrays in a bridge payload
pub const MAX_DEPTH: usize = 32;

/// Check that a payload nests no deeper than [`MAX_DEPTH`].
///
/// # Errors
/// Returns an error naming the limit if any branch is too deep.
pub fn check_depth(value: &Value) -> Result<()> {
    check_recursive(value, 0)
}

fn check_recursive(value: &Value, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(anyhow!(
            "Payload nesting too deep (max {} levels)",
            MAX_DEPTH
        ));
    }

    match value {
        Value::Object(map) => map.values().try_for_each(|v| check_recursive(v, depth + 1)),
        Value::Array(arr) => arr.iter().try_for_each(|v| check_recursive(v, depth + 1)),
        // Primitives are leaves
        _ => Ok(()),
    }
}
