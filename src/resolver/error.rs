use http::StatusCode;

/// Errors that can abort (or, at the binding stage, degrade) a resolution.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    /// The configured cloud credential could not be used.
    #[error("cloud credential rejected: {0}")]
    Auth(String),

    /// A single upstream API call failed.
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// The resolver was built from unusable configuration.
    #[error("resolver configuration error: {0}")]
    Config(String),
}

impl ResolveError {
    /// Map a non-success HTTP status from a cloud API into the error taxonomy.
    ///
    /// 401 and 403 mean the credential itself is unusable; everything else is
    /// a failure of that one call.
    pub fn from_status(status: StatusCode, context: &str, body: &str) -> Self {
        let body = truncate_body(body);
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ResolveError::Auth(format!("{context} returned {status}: {body}"))
            }
            _ => ResolveError::Upstream(format!("{context} returned {status}: {body}")),
        }
    }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ResolveError::Auth(_) => "auth",
            ResolveError::Upstream(_) => "upstream",
            ResolveError::Config(_) => "config",
        }
    }
}

impl From<reqwest::Error> for ResolveError {
    fn from(err: reqwest::Error) -> Self {
        ResolveError::Upstream(err.to_string())
    }
}

const MAX_ERROR_BODY_CHARS: usize = 512;

fn truncate_body(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
