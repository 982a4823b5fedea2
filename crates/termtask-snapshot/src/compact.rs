//! Compact structural JSON
//!
//! The compact form describes structure only. A tree is a single-key object
//! mapping the root name to its body; a file body is `null` and a directory
//! body is an object of its children:
//!
//! ```json
//! {"dir1": {"dir2": {"dir3": {"file3": null}}, "file1": null, "file2": null}}
//! ```

use crate::node::FsNode;
use crate::SnapshotError;
use serde_json::{Map, Value};

/// Parse a compact tree
///
/// # Errors
/// Returns error unless `value` is an object with exactly one entry whose
/// nested bodies are all `null` or objects
pub fn from_value(value: &Value) -> Result<FsNode, SnapshotError> {
    let object = value
        .as_object()
        .ok_or_else(|| SnapshotError::Compact("top level must be an object".to_string()))?;
    if object.len() != 1 {
        return Err(SnapshotError::Compact(format!(
            "expected exactly one root entry, found {}",
            object.len()
        )));
    }
    let (name, body) = object
        .iter()
        .next()
        .ok_or_else(|| SnapshotError::Compact("missing root entry".to_string()))?;
    node_from_body(name, body)
}

/// Parse a compact tree from text
///
/// # Errors
/// See [`from_value`]
pub fn from_str(json: &str) -> Result<FsNode, SnapshotError> {
    let value: Value = serde_json::from_str(json)?;
    from_value(&value)
}

fn node_from_body(name: &str, body: &Value) -> Result<FsNode, SnapshotError> {
    match body {
        Value::Null => Ok(FsNode::file(name)),
        Value::Object(children) => {
            let children = children
                .iter()
                .map(|(child, body)| node_from_body(child, body))
                .collect::<Result<Vec<_>, _>>()?;
            FsNode::dir(name, children)
        }
        other => Err(SnapshotError::Compact(format!(
            "entry '{name}' must be null or an object, found {other}"
        ))),
    }
}

/// Render a tree in compact form; attributes are dropped
#[must_use]
pub fn to_value(node: &FsNode) -> Value {
    let mut root = Map::new();
    root.insert(node.name().to_string(), body_of(node));
    Value::Object(root)
}

fn body_of(node: &FsNode) -> Value {
    match node {
        FsNode::File(_) => Value::Null,
        FsNode::Directory(dir) => Value::Object(
            dir.children()
                .iter()
                .map(|c| (c.name().to_string(), body_of(c)))
                .collect(),
        ),
    }
}
