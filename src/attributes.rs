use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};
use std::ops::Index;

static NULL: Value = Value::Null;

/// Describes the evaluated user. Attributes are free-form JSON values referenced by
/// conditions and used for hashing.
///
/// Conditions address nested attributes with dot-separated paths (`company.size`), and
/// hashing uses the `id` attribute unless the rule names another one.
///
/// # Examples:
///
/// ```rust
/// use featgate::Attributes;
/// use serde_json::json;
///
/// let attributes = Attributes::new()
///     .id("user-42")
///     .with("country", "US")
///     .with("age", 31)
///     .with("roles", vec!["admin", "editor"])
///     .with("company", json!({"name": "Acme", "size": 50}));
///
/// assert_eq!(attributes["country"], "US");
/// ```
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct Attributes {
    attributes: Map<String, Value>,
}

impl Attributes {
    /// Initializes an empty attribute set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the `id` attribute, the default hash attribute.
    ///
    /// # Examples:
    ///
    /// ```rust
    /// use featgate::Attributes;
    ///
    /// let attributes = Attributes::new().id("user-42");
    /// ```
    pub fn id(self, id: &str) -> Self {
        self.with("id", id)
    }

    /// Sets a custom attribute.
    ///
    /// # Examples:
    ///
    /// ```rust
    /// use featgate::Attributes;
    ///
    /// let attributes = Attributes::new()
    ///     .with("rating", 4.5)
    ///     .with("beta", true);
    /// ```
    pub fn with<T: Into<Value>>(mut self, key: &str, value: T) -> Self {
        self.attributes.insert(key.to_owned(), value.into());
        self
    }

    /// Gets the attribute identified by `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub(crate) fn to_value(&self) -> Value {
        Value::Object(self.attributes.clone())
    }
}

impl From<Map<String, Value>> for Attributes {
    fn from(attributes: Map<String, Value>) -> Self {
        Self { attributes }
    }
}

impl Index<&str> for Attributes {
    type Output = Value;

    fn index(&self, key: &str) -> &Self::Output {
        self.attributes.get(key).unwrap_or(&NULL)
    }
}

impl Display for Attributes {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(str) => write!(f, "{str}"),
            Err(_) => f.write_str("<invalid attributes>"),
        }
    }
}
