//! Typed identifiers.
//!
//! Every id wraps a ULID, so ids sort by creation time. On the wire an id is
//! the bare ULID; `Display` adds a short kind prefix (`exec_01H...`) for logs
//! and URLs. Parsing accepts either form but rejects a prefix that belongs to
//! a different kind.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Error returned when a string is not a valid id of the requested kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// Name of the id type being parsed.
    pub id_type: &'static str,
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

/// Shared behavior of the ULID-backed id types.
pub trait TypedId: Copy + From<Ulid> {
    /// Prefix used by `Display`.
    const PREFIX: &'static str;
    /// Type name reported in parse errors.
    const NAME: &'static str;

    fn ulid(self) -> Ulid;
}

fn parse_typed<T: TypedId>(raw: &str) -> Result<T, ParseIdError> {
    let error = |reason: String| ParseIdError {
        id_type: T::NAME,
        reason,
    };
    let body = match raw.split_once('_') {
        Some((prefix, body)) if prefix == T::PREFIX => body,
        Some((prefix, _)) => {
            return Err(error(format!(
                "expected prefix '{}', found '{prefix}'",
                T::PREFIX
            )));
        }
        None => raw,
    };
    Ulid::from_string(body)
        .map(T::from)
        .map_err(|e| error(e.to_string()))
}

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident => $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a fresh id.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }
        }

        impl TypedId for $name {
            const PREFIX: &'static str = $prefix;
            const NAME: &'static str = stringify!($name);

            fn ulid(self) -> Ulid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Ulid> for $name {
            fn from(ulid: Ulid) -> Self {
                Self(ulid)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_typed(s)
            }
        }
    };
}

typed_id!(
    /// Owner of a workflow or the user who triggered an execution.
    UserId => "usr"
);

typed_id!(
    /// A workflow definition.
    WorkflowId => "wf"
);

typed_id!(
    /// One immutable snapshot of a workflow's graph.
    WorkflowVersionId => "wfv"
);

typed_id!(
    /// One run attempt of a workflow.
    ExecutionId => "exec"
);

typed_id!(
    CredentialId => "cred"
);

typed_id!(
    /// A single node run inside an execution.
    NodeRunId => "nrun"
);
