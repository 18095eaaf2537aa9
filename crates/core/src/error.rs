//! Error taxonomy for the deploy pipeline.

use std::fmt;

/// Errors surfaced by pipeline stages. Every variant carries enough identity
/// (kind, name, namespace) to be actionable once [`Error::context`] has been
/// applied by the stage that produced it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input: bad `kind name` tokens, unsupported load balancer kinds.
    #[error("validation: {0}")]
    Validation(String),
    /// A namespace-scoped account touching a cluster-scoped kind or foreign namespace.
    #[error("scope: {0}")]
    Scope(String),
    #[error("not_found: {0}")]
    NotFound(String),
    /// Label-set overlap, empty selector on attach.
    #[error("invariant: {0}")]
    Invariant(String),
    #[error("upstream: {context}: {source}")]
    Upstream {
        context: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("persistence: {0}")]
    Persistence(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn upstream(context: impl fmt::Display, source: impl Into<anyhow::Error>) -> Self {
        Error::Upstream { context: context.to_string(), source: source.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Prefix the error with `ctx` without changing its category.
    pub fn context(self, ctx: impl fmt::Display) -> Self {
        match self {
            Error::Validation(m) => Error::Validation(format!("{}: {}", ctx, m)),
            Error::Scope(m) => Error::Scope(format!("{}: {}", ctx, m)),
            Error::NotFound(m) => Error::NotFound(format!("{}: {}", ctx, m)),
            Error::Invariant(m) => Error::Invariant(format!("{}: {}", ctx, m)),
            Error::Upstream { context, source } => Error::Upstream { context: format!("{}: {}", ctx, context), source },
            Error::Persistence(e) => Error::Persistence(e.context(ctx.to_string())),
        }
    }
}
