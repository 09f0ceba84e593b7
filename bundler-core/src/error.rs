use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Worker Error - {0}")]
    Worker(String),

    #[error("Downstream Error - {0}")]
    Downstream(String),

    #[error("KeyDrain Error - {0}")]
    KeyDrain(String),

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),

    #[error("Operator Terminated - {0}")]
    Terminated(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Worker(err.to_string())
    }
}
