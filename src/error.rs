use snafu::{Backtrace, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Invalid filter: {message}"))]
    InvalidFilter {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid message: {message}"))]
    InvalidMessage {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Relay error: {message}"))]
    Relay {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Cache error: {message}"))]
    Cache {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Internal error: {message}"))]
    Internal {
        message: String,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn invalid_filter<S: Into<String>>(message: S) -> Self {
        Error::InvalidFilter {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn invalid_message<S: Into<String>>(message: S) -> Self {
        Error::InvalidMessage {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn relay<S: Into<String>>(message: S) -> Self {
        Error::Relay {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn cache<S: Into<String>>(message: S) -> Self {
        Error::Cache {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::invalid_message(format!("JSON error: {}", error))
    }
}
