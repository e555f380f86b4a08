use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to open serial port: {0}")]
    Port(String),
    #[error("no ACK for data frame after {0} attempts")]
    AckTimeout(u32),
    #[error("link failure: {0} consecutive NAKs")]
    LinkFailed(u32),
    #[error("the link is shutting down")]
    Stopping,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serialport::Error> for Error {
    fn from(e: serialport::Error) -> Self {
        Error::Port(e.to_string())
    }
}
