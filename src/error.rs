use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no upload items")]
    EmptyUploadSet,

    /// The source exists but cannot be transferred (native document types, no range support).
    #[error("unsupported source: {0}")]
    UnsupportedSource(String),

    /// Non-success response from a remote endpoint. `body` is the raw payload.
    #[error("service returned status {status}: {body}")]
    Service { status: u16, body: String },

    #[error("checkpoint for transfer {transfer_id} belongs to a different source")]
    CheckpointConflict { transfer_id: String },

    #[error("function `{0}` is not registered")]
    UnknownFunction(String),

    #[error("function `{name}` failed")]
    Function {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("model kept calling functions after {0} rounds")]
    FunctionRoundsExceeded(usize),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("checkpoint store: {0}")]
    Store(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn service(status: u16, body: impl Into<String>) -> Self {
        Error::Service {
            status,
            body: body.into(),
        }
    }

    /// 5xx responses are the only ones worth resending.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Service { status, .. } if (500..600).contains(status))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
