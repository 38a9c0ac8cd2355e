use anyhow::anyhow;

pub type Result<T> = std::result::Result<T, LibError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any mutation or network call.
    Validation,
    /// A create/update/delete/load call against the persistence collaborator failed.
    Persistence,
    Forbidden,
    NotFound,
    Unknown,
}

/// Library error carrying a stable machine code, a user-facing message, and an
/// internal cause chain. Persistence errors are returned as values so batch
/// operations can report partial failure.
#[derive(Debug)]
pub struct LibError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub public: &'static str,
    pub source: anyhow::Error,
}

impl LibError {
    pub fn validation(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Validation,
            code: "validation_error",
            public,
            source,
        }
    }

    pub fn validation_with_code(
        code: &'static str,
        public: &'static str,
        source: anyhow::Error,
    ) -> Self {
        Self {
            kind: ErrorKind::Validation,
            code,
            public,
            source,
        }
    }

    pub fn persistence(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Persistence,
            code: "persistence_error",
            public,
            source,
        }
    }

    pub fn forbidden(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Forbidden,
            code: "forbidden",
            public,
            source,
        }
    }

    pub fn not_found(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            code: "not_found",
            public,
            source,
        }
    }

    pub fn unknown(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            code: "unknown_error",
            public,
            source,
        }
    }
}

impl std::fmt::Display for LibError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.public, self.code, self.source)
    }
}

impl std::error::Error for LibError {}

impl From<anyhow::Error> for LibError {
    fn from(value: anyhow::Error) -> Self {
        Self::unknown("An unexpected error occurred", value)
    }
}

impl From<serde_json::Error> for LibError {
    fn from(value: serde_json::Error) -> Self {
        Self::validation("Malformed record payload", anyhow!(value))
    }
}
