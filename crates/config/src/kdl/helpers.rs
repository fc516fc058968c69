//! Typed access to the children of a KDL block.
//!
//! Each getter returns `Ok(None)` when the child is absent and an error when
//! it is present with the wrong type, so a typo like `staging "true"` is
//! reported instead of falling back to the default.

use anyhow::{anyhow, bail, Result};
use kdl::{KdlNode, KdlValue};

/// Convert a byte offset to line and column numbers (1-indexed)
pub fn offset_to_line_col(content: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in content.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// First argument of the child node `name`
fn child_value<'a>(node: &'a KdlNode, name: &str) -> Result<Option<&'a KdlValue>> {
    let Some(child) = node.children().and_then(|children| children.get(name)) else {
        return Ok(None);
    };
    match child.entries().first() {
        Some(entry) => Ok(Some(entry.value())),
        None => bail!("'{}' requires a value", name),
    }
}

fn type_mismatch(name: &str, expected: &str, found: &KdlValue) -> anyhow::Error {
    anyhow!("'{}' must be {}, found {}", name, expected, found)
}

pub fn get_string_entry(node: &KdlNode, name: &str) -> Result<Option<String>> {
    child_value(node, name)?
        .map(|value| {
            value
                .as_string()
                .map(str::to_string)
                .ok_or_else(|| type_mismatch(name, "a string", value))
        })
        .transpose()
}

pub fn get_int_entry(node: &KdlNode, name: &str) -> Result<Option<i128>> {
    child_value(node, name)?
        .map(|value| {
            value
                .as_integer()
                .ok_or_else(|| type_mismatch(name, "an integer", value))
        })
        .transpose()
}

/// Booleans are KDL v2 keywords: `#true` or `#false`
pub fn get_bool_entry(node: &KdlNode, name: &str) -> Result<Option<bool>> {
    child_value(node, name)?
        .map(|value| {
            value
                .as_bool()
                .ok_or_else(|| type_mismatch(name, "#true or #false", value))
        })
        .transpose()
}
