//! Composite identity keys for jobs and triggers.
//!
//! Keys are always compared as `(group, name)` tuples: they are never
//! joined into a single string for identity or storage. Joining with a
//! separator token would collide whenever the token is itself a legal name
//! character, so the store keeps both columns and every map in the core
//! keys off the tuple. `Display` output is for logs only.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Group assigned when the caller does not name one.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// A `(name, group)` identity pair.
///
/// Ordering is `(group, name)` lexicographic; the store relies on this for
/// deterministic tie-breaking during acquisition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    pub group: String,
    pub name: String,
}

impl Key {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    /// Key in the default group.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

macro_rules! typed_key {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Key);

        impl $name {
            pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
                Self(Key::new(name, group))
            }

            pub fn named(name: impl Into<String>) -> Self {
                Self(Key::named(name))
            }

            pub fn name(&self) -> &str {
                &self.0.name
            }

            pub fn group(&self) -> &str {
                &self.0.group
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

typed_key!(
    /// Identity of a job definition. Jobs and triggers are independent key
    /// spaces: a `JobKey` never equals a `TriggerKey` at the type level.
    JobKey
);

typed_key!(
    /// Identity of a trigger.
    TriggerKey
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_is_componentwise() {
        assert_eq!(Key::new("a", "g"), Key::new("a", "g"));
        assert_ne!(Key::new("a", "g"), Key::new("a", "h"));
        // The classic separator collision: ("a_b", "c") vs ("a", "b_c")
        // must be distinct keys.
        assert_ne!(Key::new("a_b", "c"), Key::new("a", "b_c"));
    }

    #[test]
    fn test_ordering_group_then_name() {
        let mut keys = vec![
            Key::new("z", "alpha"),
            Key::new("a", "beta"),
            Key::new("a", "alpha"),
        ];
        keys.sort();
        assert_eq!(keys[0], Key::new("a", "alpha"));
        assert_eq!(keys[1], Key::new("z", "alpha"));
        assert_eq!(keys[2], Key::new("a", "beta"));
    }

    #[test]
    fn test_default_group() {
        let k = TriggerKey::named("nightly");
        assert_eq!(k.group(), DEFAULT_GROUP);
        assert_eq!(k.to_string(), "DEFAULT.nightly");
    }
}
