//! Output schemas for structured generation.
//!
//! Schemas are derived from the Rust response types with `schemars` and
//! rewritten into the plain JSON-schema subset generation services accept:
//! every `$ref` is inlined and `$schema`, `definitions` and `title` keys are
//! dropped.

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// JSON schema for `T`, ready to send as a request's output schema.
pub fn response_schema<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(schema).unwrap_or_default();

    inline_refs(&mut value);
    strip_keys(&mut value, &["$schema", "definitions", "title"]);

    value
}

/// Replace every `$ref` with the referenced definition.
fn inline_refs(value: &mut Value) {
    let definitions = match value {
        Value::Object(map) => map.get("definitions").cloned(),
        _ => None,
    };

    if let Some(defs) = definitions {
        inline_refs_recursive(value, &defs);
    }
}

fn inline_refs_recursive(value: &mut Value, definitions: &Value) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(ref_path)) = map.get("$ref").cloned() {
                if let Some(type_name) = ref_path.strip_prefix("#/definitions/") {
                    if let Some(def) = definitions.get(type_name) {
                        *value = def.clone();
                        inline_refs_recursive(value, definitions);
                        return;
                    }
                }
            }

            for (_, v) in map.iter_mut() {
                inline_refs_recursive(v, definitions);
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                inline_refs_recursive(item, definitions);
            }
        }
        _ => {}
    }
}

/// Remove metadata keys at every level, except inside `properties` maps
/// where they would be field names.
fn strip_keys(value: &mut Value, keys: &[&str]) {
    match value {
        Value::Object(map) => {
            for key in keys {
                map.remove(*key);
            }
            for (name, v) in map.iter_mut() {
                if name == "properties" {
                    if let Value::Object(props) = v {
                        for (_, prop) in props.iter_mut() {
                            strip_keys(prop, keys);
                        }
                    }
                } else {
                    strip_keys(v, keys);
                }
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                strip_keys(item, keys);
            }
        }
        _ => {}
    }
}
