//! An error from the VPSie autoscaler

use reqwest::StatusCode;

/// An error from the VPSie autoscaler
#[derive(Debug)]
pub enum Error {
    /// An error returned by the VPSie API
    Vpsie {
        code: StatusCode,
        msg: Option<String>,
    },
    /// A generic error with a message
    Generic(String),
    /// A spec violated a user input invariant
    Validation(String),
    /// The operation was cancelled before it completed
    Cancelled,
    /// An error from sending or recieving a request
    Reqwest(reqwest::Error),
    /// An IO Error
    IO(std::io::Error),
    /// An error from parsing a timestamp/date
    ChronoParse(chrono::ParseError),
    /// An error from loading a config
    Config(config::ConfigError),
    /// An error from converting a value with serde
    Serde(serde_json::Error),
    /// An error from parsing an int
    ParseInt(std::num::ParseIntError),
    /// An error from joining a tokio task
    JoinError(tokio::task::JoinError),
    /// An error from parsing a semver version
    Semver(semver::Error),
    /// An error from the k8s client
    K8s(kube::Error),
    /// An error from getting a k8s config
    K8sConfig(kube::config::KubeconfigError),
}

impl Error {
    /// Create a new generic error
    ///
    /// # Arguments
    ///
    /// * `msg` - The error message to set
    pub fn new<T: Into<String>>(msg: T) -> Self {
        Error::Generic(msg.into())
    }

    /// Get the status code from this error if one exists
    pub fn status(&self) -> Option<StatusCode> {
        // get the status code from any error types that support it
        match self {
            Error::Vpsie { code, .. } => Some(code.to_owned()),
            Error::Reqwest(err) => err.status(),
            Error::K8s(err) => match err {
                kube::Error::Api(resp) => StatusCode::from_u16(resp.code).ok(),
                _ => None,
            },
            _ => None,
        }
    }

    /// Get the error message for this error if one exists
    pub fn msg(&self) -> Option<String> {
        // get the msg from any error types that support it
        match self {
            Error::Vpsie { msg, .. } => msg.clone(),
            Error::Generic(msg) => Some(msg.clone()),
            Error::Validation(msg) => Some(msg.clone()),
            Error::Cancelled => Some("operation cancelled".to_owned()),
            Error::Reqwest(err) => Some(err.to_string()),
            Error::IO(err) => Some(err.to_string()),
            Error::ChronoParse(err) => Some(err.to_string()),
            Error::Config(err) => Some(err.to_string()),
            Error::Serde(err) => Some(err.to_string()),
            Error::ParseInt(err) => Some(err.to_string()),
            Error::JoinError(err) => Some(err.to_string()),
            Error::Semver(err) => Some(err.to_string()),
            Error::K8s(err) => Some(err.to_string()),
            Error::K8sConfig(err) => Some(err.to_string()),
        }
    }

    /// Get the kind of error as a str
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Vpsie { .. } => "Vpsie",
            Error::Generic(_) => "Generic",
            Error::Validation(_) => "Validation",
            Error::Cancelled => "Cancelled",
            Error::Reqwest(_) => "Reqwest",
            Error::IO(_) => "IO",
            Error::ChronoParse(_) => "ChronoParse",
            Error::Config(_) => "Config",
            Error::Serde(_) => "Serde",
            Error::ParseInt(_) => "ParseInt",
            Error::JoinError(_) => "JoinError",
            Error::Semver(_) => "Semver",
            Error::K8s(_) => "K8s",
            Error::K8sConfig(_) => "K8sConfig",
        }
    }

    /// Check whether retrying this operation later may succeed
    ///
    /// Server side errors, throttles, and transport failures are retried with
    /// backoff. Everything else needs intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Vpsie { code, .. } => {
                code.is_server_error()
                    || *code == StatusCode::TOO_MANY_REQUESTS
                    || *code == StatusCode::REQUEST_TIMEOUT
            }
            Error::Reqwest(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err
                        .status()
                        .map(|code| code.is_server_error())
                        .unwrap_or(true)
            }
            Error::K8s(kube::Error::Api(resp)) => resp.code >= 500 || resp.code == 429,
            Error::K8s(_) => true,
            _ => false,
        }
    }

    /// Check whether this is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::K8s(kube::Error::Api(resp)) if resp.code == 409)
    }

    /// Check whether this is a not found error
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Vpsie { code, .. } => *code == StatusCode::NOT_FOUND,
            Error::K8s(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.msg() {
            Some(msg) => write!(f, "{}: {}", self.kind(), msg),
            None => write!(f, "{}", self.kind()),
        }
    }
}

impl std::error::Error for Error {}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::Reqwest(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IO(error)
    }
}

impl From<chrono::ParseError> for Error {
    fn from(error: chrono::ParseError) -> Self {
        Error::ChronoParse(error)
    }
}

impl From<config::ConfigError> for Error {
    fn from(error: config::ConfigError) -> Self {
        Error::Config(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serde(error)
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(error: std::num::ParseIntError) -> Self {
        Error::ParseInt(error)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(error: tokio::task::JoinError) -> Self {
        Error::JoinError(error)
    }
}

impl From<semver::Error> for Error {
    fn from(error: semver::Error) -> Self {
        Error::Semver(error)
    }
}

impl From<kube::Error> for Error {
    fn from(error: kube::Error) -> Self {
        Error::K8s(error)
    }
}

impl From<kube::config::KubeconfigError> for Error {
    fn from(error: kube::config::KubeconfigError) -> Self {
        Error::K8sConfig(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_side_vpsie_errors_are_transient() {
        let error = Error::Vpsie {
            code: StatusCode::BAD_GATEWAY,
            msg: None,
        };
        assert!(error.is_transient());
        let error = Error::Vpsie {
            code: StatusCode::UNPROCESSABLE_ENTITY,
            msg: None,
        };
        assert!(!error.is_transient());
    }

    #[test]
    fn validation_errors_are_permanent() {
        assert!(!Error::Validation("bad spec".to_owned()).is_transient());
        assert!(!Error::Cancelled.is_transient());
    }
}
