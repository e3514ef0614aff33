use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A flat set of claims from an id_token or a userinfo document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Claims(Map<String, Value>);

impl Claims {
    /// The `sub` claim.
    pub fn subject(&self) -> Option<String> {
        self.string("sub")
    }

    /// A claim rendered as a string. Numbers are accepted since several
    /// providers use numeric ids; empty strings count as absent.
    pub fn string(&self, name: &str) -> Option<String> {
        match self.0.get(name)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.0.get(name)?.as_bool()
    }

    /// The first present, non-empty claim among `names`, in order.
    pub fn first_of<S: AsRef<str>>(&self, names: &[S]) -> Option<String> {
        names.iter().find_map(|name| self.string(name.as_ref()))
    }

    /// Overlays `other` onto these claims; values in `other` win.
    pub fn merge(&mut self, other: Claims) {
        self.0.extend(other.0);
    }
}

impl From<Map<String, Value>> for Claims {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims(value: Value) -> Claims {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_first_of_skips_missing_and_empty() {
        let c = claims(json!({
            "preferred_username": "",
            "login": "octocat",
            "nickname": "cat"
        }));
        assert_eq!(
            c.first_of(&["missing", "preferred_username", "login", "nickname"]),
            Some("octocat".to_string())
        );
        assert_eq!(c.first_of::<&str>(&[]), None);
    }

    #[test]
    fn test_numbers_are_strings_and_objects_are_not() {
        let c = claims(json!({"id": 42, "address": {"city": "x"}, "verified": true}));
        assert_eq!(c.string("id"), Some("42".to_string()));
        assert_eq!(c.string("address"), None);
        assert_eq!(c.bool("verified"), Some(true));
    }

    #[test]
    fn test_merge_overrides() {
        let mut base = claims(json!({"sub": "1", "email": "old@example.com"}));
        base.merge(claims(json!({"email": "new@example.com", "name": "N"})));
        assert_eq!(base.string("email"), Some("new@example.com".to_string()));
        assert_eq!(base.string("name"), Some("N".to_string()));
        assert_eq!(base.subject(), Some("1".to_string()));
    }
}
