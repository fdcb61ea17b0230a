//! Error taxonomy shared by every DecentDB crate.
//!
//! Errors propagate as `Result<T, DecentError>` at every API boundary. A
//! layer may prefix a context string via [`ResultExt::context`] but must not
//! change the kind on pass-through: `Io` stays `Io` all the way up.

use thiserror::Error;

/// Convenience alias used across the workspace.
pub type Result<T, E = DecentError> = std::result::Result<T, E>;

/// The complete error surface of the storage core.
///
/// - `Io`: raised by the VFS; never recovered locally.
/// - `Corruption`: invalid magic, checksum, or structural invariant; fatal
///   for the engine, which degrades to read-only.
/// - `Constraint`: NOT NULL / UNIQUE / FK / RESTRICT violations; the
///   current statement rolls back, the transaction stays open.
/// - `Transaction`: busy lock, timeout, aborted reader, or misuse such as
///   commit without begin.
/// - `Sql`: produced by the external SQL layer and surfaced verbatim.
/// - `Internal`: invariant violation inside the engine; fatal for the
///   transaction, the engine remains usable.
#[derive(Debug, Error)]
pub enum DecentError {
    #[error("io error: {source}{}", fmt_ctx(.context))]
    Io {
        #[source]
        source: std::io::Error,
        context: Option<String>,
    },

    #[error("corruption: {message}{}", fmt_ctx(.context))]
    Corruption {
        message: String,
        context: Option<String>,
    },

    #[error("constraint violation: {message}{}", fmt_ctx(.context))]
    Constraint {
        message: String,
        context: Option<String>,
    },

    #[error("transaction error: {message}{}", fmt_ctx(.context))]
    Transaction {
        message: String,
        context: Option<String>,
    },

    #[error("sql error: {message}{}", fmt_ctx(.context))]
    Sql {
        message: String,
        context: Option<String>,
    },

    #[error("internal error: {message}{}", fmt_ctx(.context))]
    Internal {
        message: String,
        context: Option<String>,
    },
}

fn fmt_ctx(context: &Option<String>) -> String {
    context
        .as_deref()
        .map_or_else(String::new, |c| format!(" ({c})"))
}

impl From<std::io::Error> for DecentError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            source,
            context: None,
        }
    }
}

impl DecentError {
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
            context: None,
        }
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::Constraint {
            message: message.into(),
            context: None,
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            context: None,
        }
    }

    pub fn sql(message: impl Into<String>) -> Self {
        Self::Sql {
            message: message.into(),
            context: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            context: None,
        }
    }

    /// The writer lock is held by another transaction.
    pub fn busy() -> Self {
        Self::transaction("busy")
    }

    /// A reader was aborted by a forced checkpoint truncation.
    pub fn aborted() -> Self {
        Self::transaction("aborted")
    }

    /// Attach (or extend) the context string without changing the kind.
    #[must_use]
    pub fn with_context(mut self, ctx: &str) -> Self {
        let slot = match &mut self {
            Self::Io { context, .. }
            | Self::Corruption { context, .. }
            | Self::Constraint { context, .. }
            | Self::Transaction { context, .. }
            | Self::Sql { context, .. }
            | Self::Internal { context, .. } => context,
        };
        *slot = Some(match slot.take() {
            Some(existing) => format!("{ctx}: {existing}"),
            None => ctx.to_owned(),
        });
        self
    }

    /// Whether this error makes the whole engine unusable for writes.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }

    /// Stable lowercase kind name, used by the statement-boundary latch.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io",
            Self::Corruption { .. } => "corruption",
            Self::Constraint { .. } => "constraint",
            Self::Transaction { .. } => "transaction",
            Self::Sql { .. } => "sql",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Context-prefixing extension for `Result`.
pub trait ResultExt<T> {
    /// Prefix the error's context string, preserving the kind.
    fn context(self, ctx: &str) -> Result<T>;
}

impl<T, E: Into<DecentError>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, ctx: &str) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }
}
