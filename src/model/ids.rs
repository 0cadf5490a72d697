//! Opaque identifier newtypes.
//!
//! Each identifier validates at construction, so a `UserId` can never be
//! passed where an `IdempotencyKey` is expected and nothing downstream has to
//! re-check the string.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};

const MAX_ID_LEN: usize = 256;

fn validate(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Validation(format!("{kind} must not be empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(Error::Validation(format!(
            "{kind} exceeds {MAX_ID_LEN} bytes"
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(Error::Validation(format!(
            "{kind} contains control characters"
        )));
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Result<Self> {
                let value = value.into();
                validate($label, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(value: String) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
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
    };
}

string_id!(
    /// Immutable task identity.
    TaskId,
    "task id"
);

string_id!(
    /// Owner of a user task. Background tasks have none.
    UserId,
    "user id"
);

string_id!(
    /// Identifies a logically unique submission.
    IdempotencyKey,
    "idempotency key"
);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl IdempotencyKey {
    /// Derives the key for `(name, input, user_id)`.
    ///
    /// The digest is taken over compact JSON with sorted keys, so two inputs
    /// that differ only in object key order map to the same key. The full
    /// SHA-256 digest is kept.
    pub fn derive(name: &str, input: &Value, user_id: Option<&UserId>) -> Self {
        let canonical = serde_json::json!({
            "input": input,
            "name": name,
            "userId": user_id.map(UserId::as_str),
        });
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        Self(hex::encode(digest))
    }
}
