use thiserror::Error;

/// Core error type for lmgate.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("upstream unreachable: {message}")]
    UpstreamUnreachable { message: String },

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("upstream protocol error: {message}")]
    UpstreamProtocolError { message: String },

    #[error("upstream rejected request: {status} {message}")]
    UpstreamRejected { status: u16, message: String },

    #[error("malformed upstream response: missing {field}")]
    MalformedUpstreamResponse { field: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GatewayError {
    /// Stable machine-readable discriminant, used in error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_request_error",
            Self::UpstreamUnreachable { .. } => "upstream_unreachable",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::UpstreamProtocolError { .. } => "upstream_protocol_error",
            Self::UpstreamRejected { .. } => "upstream_rejected",
            Self::MalformedUpstreamResponse { .. } => "malformed_upstream_response",
            Self::Io(_) | Self::Other(_) => "internal_error",
        }
    }

    /// Map a reqwest transport failure onto the upstream taxonomy.
    pub(crate) fn from_transport(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::UpstreamTimeout
        } else if e.is_decode() {
            Self::UpstreamProtocolError {
                message: e.to_string(),
            }
        } else {
            Self::UpstreamUnreachable {
                message: e.to_string(),
            }
        }
    }

    /// Map a failure while reading a response body that is already flowing.
    ///
    /// reqwest tags every body read error as a decode error, including resets
    /// and truncated chunked bodies, so only timeouts are told apart here.
    /// Payloads that arrive intact but do not parse are caught by the decoder.
    pub(crate) fn from_body_read(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::UpstreamTimeout;
        }
        let mut message = e.to_string();
        let mut source = std::error::Error::source(e);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self::UpstreamUnreachable { message }
    }
}

pub type CoreResult<T> = std::result::Result<T, GatewayError>;
