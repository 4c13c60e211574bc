//! Branded ID newtypes for type safety.
//!
//! Generated IDs are UUID v7 (time-ordered) with a short kind prefix, e.g.
//! `job_0192f6a4-...`. Because UUID v7 values are never reused, a freshly
//! assigned job ID cannot collide with one that was already pruned.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Prefix used for generated IDs of this kind.
            pub const PREFIX: &'static str = $prefix;

            /// Create a new random ID (prefixed UUID v7).
            #[must_use]
            pub fn new() -> Self {
                Self(format!("{}{}", Self::PREFIX, Uuid::now_v7()))
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identifier of one submitted unit of asynchronous work, shared by all
    /// of its watchers.
    JobId, "job_"
}

branded_id! {
    /// Identifier of one live client connection (local to this instance).
    ConnectionId, "conn_"
}
