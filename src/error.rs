use datafusion::arrow::error::ArrowError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {message}")]
    ConfigValidation { message: String },

    #[error("Configuration is improperly authorized: {message}")]
    AuthConfig { message: String },

    #[error("Failed to parse date '{date}'")]
    DateParse { date: String },

    #[error("Report API responded with error: {message}")]
    RemoteReport { message: String },

    #[error("Report API returned an unexpected response: {message}")]
    MalformedResponse { message: String },

    #[error("HTTP request failed: {0}")]
    ApiFailure(#[from] reqwest::Error),

    #[error("Failed to parse URL: {0}")]
    UrlParsingFailed(#[from] url::ParseError),

    #[error("Arrow: {0}")]
    Arrow(#[from] ArrowError),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Errors caused by configuration or by the remote API rejecting the
    /// request, as opposed to bugs or infrastructure failures.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::ConfigValidation { .. }
                | Error::AuthConfig { .. }
                | Error::DateParse { .. }
                | Error::RemoteReport { .. }
        )
    }

    /// Process exit status for this error: 1 for user errors, 2 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.is_user_error() {
            1
        } else {
            2
        }
    }
}
