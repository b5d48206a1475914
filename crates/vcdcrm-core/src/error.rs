use std::fmt;

use thiserror::Error;

/// Failure reported by the platform client for a single API call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("{kind} {name} not found")]
    NotFound { kind: ObjectKind, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: ObjectKind, name: String },

    /// The platform rejected a manual address because something else holds it.
    #[error("address {address} is already in use")]
    AddressConflict { address: String },

    #[error("{message}")]
    Api { message: String },
}

impl PlatformError {
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            message: message.into(),
        }
    }

    pub fn not_found(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.into(),
        }
    }
}

/// Kind of platform object an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Org,
    Vdc,
    Network,
    Catalog,
    Template,
    Group,
    Vm,
    Media,
    Task,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Org => "org",
            Self::Vdc => "vdc",
            Self::Network => "network",
            Self::Catalog => "catalog",
            Self::Template => "template",
            Self::Group => "group",
            Self::Vm => "vm",
            Self::Media => "media",
            Self::Task => "task",
        };
        f.write_str(s)
    }
}

/// Orchestration error taxonomy.
///
/// Callers match on the variant: `NotFound` drives create-vs-update decisions,
/// `AlreadyExists` is normally absorbed before it reaches them, and everything
/// else is terminal for the operation that produced it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} {name} does not exist")]
    NotFound { kind: ObjectKind, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: ObjectKind, name: String },

    /// A bare name matched objects in more than one group.
    #[error("{kind} {name} exists in several groups ({}), qualify it as group/name", .groups.join(", "))]
    Ambiguous {
        kind: ObjectKind,
        name: String,
        groups: Vec<String>,
    },

    #[error("no free entry left in {pool}")]
    PoolExhausted { pool: String },

    #[error("{object} is {actual}, expected {expected}")]
    InvalidState {
        object: String,
        expected: String,
        actual: String,
    },

    #[error("timed out waiting for {what} after {attempts} attempts")]
    Timeout { what: String, attempts: u32 },

    #[error("cancelled while waiting for {what}")]
    Cancelled { what: String },

    #[error("invalid orchestration request: {0}")]
    InvalidSpec(String),

    #[error("{op} failed for {object}: {source}")]
    Platform {
        op: &'static str,
        object: String,
        #[source]
        source: PlatformError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap a platform failure with the operation and object it concerns.
    ///
    /// `NotFound` and `AlreadyExists` keep their kind so callers can still
    /// branch on them after the annotation.
    pub fn platform(op: &'static str, object: impl Into<String>, source: PlatformError) -> Self {
        match source {
            PlatformError::NotFound { kind, name } => Self::NotFound { kind, name },
            PlatformError::AlreadyExists { kind, name } => Self::AlreadyExists { kind, name },
            source => Self::Platform {
                op,
                object: object.into(),
                source,
            },
        }
    }

    pub fn invalid_state(
        object: impl Into<String>,
        expected: impl fmt::Display,
        actual: impl fmt::Display,
    ) -> Self {
        Self::InvalidState {
            object: object.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Extension for platform results: annotate failures with operation context.
pub trait PlatformResultExt<T> {
    fn op(self, op: &'static str, object: &str) -> Result<T>;
}

impl<T> PlatformResultExt<T> for std::result::Result<T, PlatformError> {
    fn op(self, op: &'static str, object: &str) -> Result<T> {
        self.map_err(|e| Error::platform(op, object, e))
    }
}

/// Treat an "already exists" outcome as success.
pub fn ok_if_exists(res: Result<()>) -> Result<()> {
    match res {
        Err(Error::AlreadyExists { kind, name }) => {
            tracing::info!(%kind, name = %name, "already exists, treating as success");
            Ok(())
        }
        other => other,
    }
}
