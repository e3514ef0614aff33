use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The platform-internal principal produced by a successful authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Unique, human readable user name.
    pub name: String,

    /// Stable identifier assigned when the user was created.
    pub uid: String,

    /// Groups the user belongs to.
    #[serde(default)]
    pub groups: Vec<String>,

    /// Additional attributes attached by authenticators.
    #[serde(default)]
    pub extra: HashMap<String, Vec<String>>,
}

impl User {
    pub fn new(name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: uid.into(),
            groups: Vec::new(),
            extra: HashMap::new(),
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }
}
