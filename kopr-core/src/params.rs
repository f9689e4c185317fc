//! A port of request parameter *Optionals from apimachinery/types.go
use crate::labels::Selector;
use serde::{Deserialize, Serialize};

/// Which part of a collection a list or watch covers
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Scope {
    /// Every namespace (or a cluster-scoped collection)
    #[default]
    All,
    /// A single namespace
    Namespace(String),
}

impl Scope {
    /// The namespace this scope is restricted to, if any
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Scope::All => None,
            Scope::Namespace(ns) => Some(ns),
        }
    }
}

/// Common query parameters used in list calls on collections
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListParams {
    /// The part of the collection to list
    pub scope: Scope,

    /// A selector to restrict the list of returned objects by their labels.
    ///
    /// Defaults to everything if `None`.
    pub label_selector: Option<String>,

    /// Limit the number of results.
    ///
    /// Collaborators may ignore this and return the whole collection.
    pub limit: Option<u32>,
}

impl ListParams {
    /// Configure the scope of the list
    #[must_use]
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Configure the selector to restrict the list of returned objects by their labels.
    ///
    /// Takes a comma separated string of selector expressions, e.g. `app=web,tier!=db`.
    #[must_use]
    pub fn labels(mut self, label_selector: &str) -> Self {
        self.label_selector = Some(label_selector.to_string());
        self
    }

    /// Configure typed label selectors
    #[must_use]
    pub fn labels_from(mut self, selector: &Selector) -> Self {
        self.label_selector = Some(selector.to_selector_string());
        self
    }

    /// Sets a result limit.
    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Common query parameters used in watch calls on collections
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchParams {
    /// The part of the collection to watch
    pub scope: Scope,

    /// A selector to restrict the watched objects by their labels.
    pub label_selector: Option<String>,

    /// Request periodic [`Bookmark`](crate::watch::Bookmark) events.
    pub bookmarks: bool,
}

impl From<&ListParams> for WatchParams {
    fn from(lp: &ListParams) -> Self {
        Self {
            scope: lp.scope.clone(),
            label_selector: lp.label_selector.clone(),
            bookmarks: true,
        }
    }
}
