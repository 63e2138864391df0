//! Logical topic names.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A logical channel name such as `USER_AUTH`.
///
/// The broker-level name is the lower-cased logical name (`user_auth`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(Cow<'static, str>);

impl Topic {
    pub const USER_AUTH: Topic = Topic::from_static("USER_AUTH");
    pub const USER_LIFECYCLE: Topic = Topic::from_static("USER_LIFECYCLE");
    pub const CONSENT: Topic = Topic::from_static("CONSENT");
    pub const AUDIT_FINDING: Topic = Topic::from_static("AUDIT_FINDING");

    /// Reserved: failed records awaiting a redeliver-or-quarantine decision.
    pub const DEAD_LETTER_RETRY: Topic = Topic::from_static("DEAD_LETTER_RETRY");
    /// Reserved: optional notification of newly hospitalized events.
    pub const DEAD_LETTER_HOSPITAL: Topic = Topic::from_static("DEAD_LETTER_HOSPITAL");

    pub const fn from_static(name: &'static str) -> Self {
        Topic(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Topic(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the topic on the broker.
    pub fn broker_name(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Topic::new(name)
    }
}
