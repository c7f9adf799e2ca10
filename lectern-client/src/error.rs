use crate::api_client::ApiClientError;
use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Api(#[from] ApiClientError),
    #[error(transparent)]
    Lectern(#[from] lectern_core::LecternError),
    #[error("Telemetry error: {0}")]
    Telemetry(String),
}

impl From<lectern_core::FetchError> for ClientError {
    fn from(err: lectern_core::FetchError) -> Self {
        Self::Lectern(err.into())
    }
}

impl From<lectern_core::MutationError> for ClientError {
    fn from(err: lectern_core::MutationError) -> Self {
        Self::Lectern(err.into())
    }
}

impl From<lectern_core::ConfigError> for ClientError {
    fn from(err: lectern_core::ConfigError) -> Self {
        Self::Config(err.into())
    }
}

impl From<lectern_core::InvalidKeyError> for ClientError {
    fn from(err: lectern_core::InvalidKeyError) -> Self {
        Self::Lectern(err.into())
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
