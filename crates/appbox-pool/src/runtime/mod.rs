//! Runtime Port implementations.

mod local;
mod memory;

pub use local::{LocalHandle, LocalRuntime};
pub use memory::{MemoryHandle, MemoryRuntime};

use appbox_common::RuntimeError;

/// Split a runtime path into components. `""`, `"."` and `"/"` are the root;
/// `..` is rejected so no path can escape the runtime's tree.
pub(crate) fn components(path: &str) -> Result<Vec<&str>, RuntimeError> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(RuntimeError::InvalidPath(path.to_string())),
            other => parts.push(other),
        }
    }
    Ok(parts)
}

pub(crate) fn normalize(path: &str) -> Result<String, RuntimeError> {
    components(path).map(|parts| parts.join("/"))
}
