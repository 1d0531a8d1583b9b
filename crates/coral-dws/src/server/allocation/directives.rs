use serde::Deserialize;
use serde_json::Value;

use crate::Map;
use crate::common::error::RequestError;

const DIRECTIVE_PREFIX: &str = "#DW ";

/// Named shortcut for one or more `#DW` directives.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DirectivePreset {
    Single(String),
    Multiple(Vec<String>),
}

/// Splits a string that may hold several `#DW` directives.
fn split_directives(text: &str, output: &mut Vec<String>) {
    output.extend(
        text.split(DIRECTIVE_PREFIX)
            .map(str::trim)
            .filter(|piece| !piece.is_empty())
            .map(|piece| format!("{DIRECTIVE_PREFIX}{piece}")),
    );
}

fn expand_entry(entry: &str, presets: &Map<String, DirectivePreset>, output: &mut Vec<String>) {
    match presets.get(entry.trim()) {
        Some(DirectivePreset::Single(text)) => split_directives(text, output),
        Some(DirectivePreset::Multiple(texts)) => {
            for text in texts {
                split_directives(text, output);
            }
        }
        None => split_directives(entry, output),
    }
}

/// Normalizes the `dw_directives` attribute of a job into a list of single directives.
pub fn parse_dw_directives(
    directives: &Value,
    presets: &Map<String, DirectivePreset>,
) -> Result<Vec<String>, RequestError> {
    let mut output = Vec::new();
    match directives {
        Value::String(text) => expand_entry(text, presets, &mut output),
        Value::Array(items) => {
            for item in items {
                let Value::String(text) = item else {
                    return Err(malformed(directives));
                };
                expand_entry(text, presets, &mut output);
            }
        }
        _ => return Err(malformed(directives)),
    }
    Ok(output)
}

fn malformed(directives: &Value) -> RequestError {
    RequestError::User(format!(
        "Malformed dw_directives, not list or string: {directives}"
    ))
}

/// Persistent file systems outlive the job, only the instance owner may create them.
pub fn check_persistent(
    directives: &[String],
    user_id: u32,
    instance_owner: u32,
) -> Result<(), RequestError> {
    if user_id != instance_owner && directives.iter().any(|d| d.contains("create_persistent")) {
        return Err(RequestError::User(
            "only the instance owner can create persistent file systems".to_string(),
        ));
    }
    Ok(())
}
