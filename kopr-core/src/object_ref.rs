use crate::resource::Resource;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

/// A namespaced (if relevant) reference to an object of one resource type
///
/// This is the unique identity of a watched object, used as the cache key and as the work queue item.
///
/// ```
/// use kopr_core::ObjectRef;
/// assert_ne!(ObjectRef::new("a").within("ns1"), ObjectRef::new("a").within("ns2"));
/// assert_eq!(ObjectRef::new("a").within("ns1").to_string(), "a.ns1");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    /// The namespace of the object
    ///
    /// May only be `None` if the kind is cluster-scoped (not located in a namespace).
    pub namespace: Option<String>,
    /// The name of the object
    pub name: String,
}

impl ObjectRef {
    /// Reference a cluster-scoped object by name
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Place the reference in a namespace
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Creates `ObjectRef` from the resource
    #[must_use]
    pub fn from_obj<K: Resource + ?Sized>(obj: &K) -> Self {
        let meta = obj.meta();
        Self {
            namespace: meta.namespace.clone(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(namespace) = &self.namespace {
            write!(f, ".{namespace}")?;
        }
        Ok(())
    }
}
