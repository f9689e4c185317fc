//! Contains types for using resource kinds not known at compile-time.
use crate::{
    metadata::{ObjectMeta, TypeMeta},
    resource::Resource,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to parse this DynamicObject into a Resource: {source}")]
/// Failed to parse `DynamicObject` into `Resource`
pub struct ParseDynamicObjectError {
    #[from]
    source: serde_json::Error,
}

/// Information about a resource type needed to list, watch and describe it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResource {
    /// Resource kind, e.g. `ConfigMap`
    pub kind: String,
    /// apiVersion of the resource, e.g. `v1`
    pub api_version: String,
    /// Plural name of the resource, e.g. `configmaps`
    pub plural: String,
}

impl ApiResource {
    /// Describe a kind, deriving its plural from the kind name
    #[must_use]
    pub fn new(api_version: &str, kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            api_version: api_version.to_string(),
            plural: to_plural(&kind.to_ascii_lowercase()),
        }
    }

    /// Override the derived plural name
    #[must_use]
    pub fn plural(mut self, plural: &str) -> Self {
        self.plural = plural.to_string();
        self
    }
}

// Only the common english suffixes used by built-in kinds.
fn to_plural(word: &str) -> String {
    if word.ends_with('s') || word.ends_with('x') || word.ends_with("ch") || word.ends_with("sh") {
        format!("{word}es")
    } else if let Some(stem) = word.strip_suffix('y').filter(|s| !s.ends_with(['a', 'e', 'i', 'o', 'u'])) {
        format!("{stem}ies")
    } else {
        format!("{word}s")
    }
}

/// A dynamic representation of a cluster object
///
/// This will work with any non-list type object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DynamicObject {
    /// The type fields, not always present
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,
    /// Object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// All other keys
    #[serde(flatten)]
    pub data: serde_json::Value,
}

impl DynamicObject {
    /// Create a DynamicObject with minimal values set from ApiResource.
    #[must_use]
    pub fn new(name: &str, resource: &ApiResource) -> Self {
        Self {
            types: Some(TypeMeta {
                api_version: resource.api_version.clone(),
                kind: resource.kind.clone(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: serde_json::Value::Object(Default::default()),
        }
    }

    /// Attach dynamic data to a DynamicObject
    #[must_use]
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Attach a namespace to a DynamicObject
    #[must_use]
    pub fn within(mut self, ns: &str) -> Self {
        self.metadata.namespace = Some(ns.into());
        self
    }

    /// Attach a label to a DynamicObject
    #[must_use]
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    /// Attempt to convert this `DynamicObject` to a `Resource`
    pub fn try_parse<K: Resource + for<'a> Deserialize<'a>>(self) -> Result<K, ParseDynamicObjectError> {
        Ok(serde_json::from_value(serde_json::to_value(self)?)?)
    }
}

impl Resource for DynamicObject {
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod test {
    use super::{ApiResource, DynamicObject};
    use crate::ResourceExt;

    #[test]
    fn plural_is_derived_from_kind() {
        assert_eq!(ApiResource::new("v1", "ConfigMap").plural, "configmaps");
        assert_eq!(ApiResource::new("v1", "Ingress").plural, "ingresses");
        assert_eq!(ApiResource::new("v1", "NetworkPolicy").plural, "networkpolicies");
        assert_eq!(ApiResource::new("v1", "Gateway").plural, "gateways");
        assert_eq!(ApiResource::new("v1", "Widget").plural("widgetz").plural, "widgetz");
    }

    #[test]
    fn dynamic_object_roundtrips_through_json() {
        let ar = ApiResource::new("v1", "ConfigMap");
        let obj = DynamicObject::new("a", &ar)
            .within("default")
            .label("app", "web")
            .data(serde_json::json!({ "data": { "k": "v" } }));
        let json = serde_json::to_value(&obj).unwrap();
        assert_eq!(json["kind"], "ConfigMap");
        assert_eq!(json["metadata"]["namespace"], "default");
        assert_eq!(json["data"]["k"], "v");
        let parsed: DynamicObject = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.name_any(), "a");
        assert_eq!(parsed.labels().get("app").map(String::as_str), Some("web"));
    }
}
