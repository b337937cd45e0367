use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The callback listener could not take its port.
    #[error("failed to bind callback listener on port {port}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Transport failure or unusable HTTP status from the platform.
    #[error("request to {url} failed{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Remote {
        url: String,
        status: Option<u16>,
        message: String,
    },

    /// The platform answered, but not with the shape we expected.
    #[error("unexpected response from {url}: {message}")]
    Parse { url: String, message: String },

    /// A required credential is missing, or the session file is unusable.
    #[error("{0}")]
    Config(String),

    #[error("no authorization code received within {secs}s")]
    AuthTimeout { secs: u64 },

    #[error("callback listener stopped before an authorization code arrived")]
    ListenerClosed,

    #[error("invalid device type: {0}")]
    UnknownDeviceType(String),

    #[error("{device_type} \"{name}\" does not exist!")]
    UnknownDevice { device_type: String, name: String },

    #[error("malformed {keyword} command: {reason}")]
    MalformedCommand { keyword: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit code for a fatal error.
    ///
    /// `Config` keeps code 1, which scripts already treat as "not set up".
    /// The remaining fatal kinds get their own codes so callers can tell a busy
    /// port from a platform outage.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 1,
            Error::Bind { .. } => 2,
            Error::Remote { .. } => 3,
            Error::Parse { .. } => 4,
            Error::AuthTimeout { .. } | Error::ListenerClosed => 5,
            Error::Io(_) => 6,
            Error::UnknownDeviceType(_)
            | Error::UnknownDevice { .. }
            | Error::MalformedCommand { .. } => 1,
        }
    }

    pub(crate) fn remote(url: &str, status: Option<u16>, message: impl Into<String>) -> Self {
        Error::Remote {
            url: url.to_string(),
            status,
            message: message.into(),
        }
    }

    pub(crate) fn parse(url: &str, message: impl Into<String>) -> Self {
        Error::Parse {
            url: url.to_string(),
            message: message.into(),
        }
    }
}
