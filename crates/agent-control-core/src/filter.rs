//! Process filters pushed to agents.

use serde::Deserialize;
use serde_json::{Value, json};

/// Which processes an agent should watch or block.
///
/// The wire form is always an object tagged by `type`. Agents decode it
/// with the derived `Deserialize`; the server side builds it with
/// [`ProcessFilter::to_wire_form`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessFilter {
    /// Block the listed executable paths.
    Blacklist {
        /// Executable paths, kept in the given order.
        #[serde(rename = "list")]
        paths: Vec<String>,
    },
}

impl ProcessFilter {
    /// Create a blacklist filter.
    #[must_use]
    pub fn blacklist<I>(paths: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self::Blacklist {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// Wire tag of this filter kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Blacklist { .. } => "blacklist",
        }
    }

    /// Canonical wire encoding: `{"type": <tag>, ...fields}`.
    #[must_use]
    pub fn to_wire_form(&self) -> Value {
        match self {
            Self::Blacklist { paths } => json!({
                "type": self.kind(),
                "list": paths,
            }),
        }
    }

    /// Decode a filter from its wire form.
    ///
    /// # Errors
    /// Returns error on an unknown `type` tag or missing fields.
    pub fn from_wire_form(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blacklist_wire_form() {
        let filter = ProcessFilter::blacklist(["a", "b"]);
        assert_eq!(
            filter.to_wire_form(),
            json!({"type": "blacklist", "list": ["a", "b"]})
        );
    }

    #[test]
    fn test_blacklist_keeps_order_and_duplicates() {
        let filter = ProcessFilter::blacklist(["z", "a", "z"]);
        let wire = serde_json::to_string(&filter.to_wire_form()).unwrap();
        assert_eq!(wire, r#"{"type":"blacklist","list":["z","a","z"]}"#);
    }

    #[test]
    fn test_empty_blacklist() {
        let filter = ProcessFilter::blacklist(Vec::<String>::new());
        assert_eq!(
            filter.to_wire_form(),
            json!({"type": "blacklist", "list": []})
        );
    }

    #[test]
    fn test_decode_wire_form() {
        let filter =
            ProcessFilter::from_wire_form(json!({"type": "blacklist", "list": ["x.exe"]})).unwrap();
        assert_eq!(filter, ProcessFilter::blacklist(["x.exe"]));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let result = ProcessFilter::from_wire_form(json!({"type": "whitelist", "list": []}));
        assert!(result.is_err());
    }
}
