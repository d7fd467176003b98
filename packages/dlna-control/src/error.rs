use thiserror::Error;

use tick_http::HttpError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{source}")]
    Http {
        #[from]
        source: HttpError,
    },
    #[error("{source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("The device answered with status {0}")]
    Remote(u16),
    #[error("Subscription was not accepted: {0}")]
    Subscription(String),
    #[error("{0}")]
    Parse(String),
    #[error("Invalid device description: {0}")]
    Description(String),
    #[error("Unusable location URL: {0}")]
    Location(String),
    #[error("The control point is not running")]
    NotRunning,
}

impl From<xml::reader::Error> for Error {
    fn from(source: xml::reader::Error) -> Self {
        Error::Parse(source.to_string())
    }
}

impl From<xml::writer::Error> for Error {
    fn from(source: xml::writer::Error) -> Self {
        Error::Parse(source.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(source: url::ParseError) -> Self {
        Error::Location(source.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
