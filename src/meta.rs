// ABOUTME: Object identity accessors used to derive coalescing keys
// ABOUTME: Keys are "namespace/name" for namespaced objects and "name" otherwise

use crate::error::{ReflectorError, Result};

/// Identity metadata of an object delivered by a change source.
///
/// The coalescing key is only used to merge events for the same object within
/// one window. It is unrelated to the primary key the target table indexes by.
pub trait ObjectMeta {
    /// The object's name. `None` or an empty name means the object has no
    /// usable identity.
    fn name(&self) -> Option<&str>;

    /// The object's namespace, if it is namespaced.
    fn namespace(&self) -> Option<&str> {
        None
    }
}

/// Derives the coalescing key of `obj`.
pub fn object_key<O: ObjectMeta>(obj: &O) -> Result<String> {
    let name = match obj.name() {
        Some(name) if !name.is_empty() => name,
        _ => {
            return Err(ReflectorError::Identity {
                type_name: std::any::type_name::<O>(),
                reason: "object has no name".to_string(),
            })
        }
    };
    match obj.namespace() {
        Some(namespace) if !namespace.is_empty() => Ok(format!("{namespace}/{name}")),
        _ => Ok(name.to_string()),
    }
}
