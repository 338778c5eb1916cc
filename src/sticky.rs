use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Variation assignments persisted for one attribute value.
///
/// `assignments` maps `<experiment key>__<bucket version>` to the key of the assigned variation.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StickyAssignmentsDocument {
    /// Hash or fallback attribute the assignments belong to.
    pub attribute_name: String,
    /// Value of that attribute.
    pub attribute_value: String,
    /// Variation keys by `<experiment key>__<bucket version>`.
    pub assignments: HashMap<String, String>,
}

impl StickyAssignmentsDocument {
    /// Creates a document without assignments.
    pub fn new(attribute_name: &str, attribute_value: &str) -> Self {
        Self {
            attribute_name: attribute_name.to_owned(),
            attribute_value: attribute_value.to_owned(),
            assignments: HashMap::new(),
        }
    }
}

/// A storage API used to keep experiment assignments stable across weight and
/// coverage changes.
///
/// # Examples
///
/// ```rust
/// use featgate::{StickyAssignmentsDocument, StickyBucketStore};
///
/// struct LoggingStore {}
///
/// impl StickyBucketStore for LoggingStore {
///     fn get_assignments(&self, attribute_name: &str, attribute_value: &str) -> Option<StickyAssignmentsDocument> {
///         // read from a database
///         None
///     }
///
///     fn save_assignments(&self, doc: StickyAssignmentsDocument) {
///         // write to a database
///     }
/// }
/// ```
pub trait StickyBucketStore: Send + Sync {
    /// Gets the assignments stored for the given attribute.
    fn get_assignments(
        &self,
        attribute_name: &str,
        attribute_value: &str,
    ) -> Option<StickyAssignmentsDocument>;

    /// Replaces the stored assignments of the document's attribute.
    fn save_assignments(&self, doc: StickyAssignmentsDocument);
}

/// [`StickyBucketStore`] keeping documents in process memory.
#[derive(Default)]
pub struct InMemoryStickyBucketStore {
    docs: RwLock<HashMap<String, StickyAssignmentsDocument>>,
}

impl InMemoryStickyBucketStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(attribute_name: &str, attribute_value: &str) -> String {
        format!("{attribute_name}||{attribute_value}")
    }
}

impl StickyBucketStore for InMemoryStickyBucketStore {
    fn get_assignments(
        &self,
        attribute_name: &str,
        attribute_value: &str,
    ) -> Option<StickyAssignmentsDocument> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        docs.get(&Self::key(attribute_name, attribute_value)).cloned()
    }

    fn save_assignments(&self, doc: StickyAssignmentsDocument) {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        docs.insert(
            Self::key(&doc.attribute_name, &doc.attribute_value),
            doc,
        );
    }
}

#[cfg(test)]
mod sticky_tests {
    use crate::sticky::{InMemoryStickyBucketStore, StickyAssignmentsDocument, StickyBucketStore};

    #[test]
    fn save_and_get() {
        let store = InMemoryStickyBucketStore::new();
        assert!(store.get_assignments("id", "u1").is_none());

        let mut doc = StickyAssignmentsDocument::new("id", "u1");
        doc.assignments.insert("exp__0".to_owned(), "1".to_owned());
        store.save_assignments(doc.clone());

        assert_eq!(store.get_assignments("id", "u1"), Some(doc));
        assert!(store.get_assignments("deviceId", "u1").is_none());
    }
}
