use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("SerdeAPI::init failed: {0}")]
    Init(String),
    #[error("Simulation failed: {0}")]
    Simulation(String),
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(format!("{err:?}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
