use thiserror::Error;
use zwusb_core::definitions::NodeId;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Serial(#[from] zwusb_serial::Error),
    #[error(transparent)]
    Core(#[from] zwusb_core::error::Error),
    #[error("operation timed out")]
    Timeout,
    #[error("the driver is stopping")]
    Stopping,
    #[error("unit {0} is unknown")]
    UnknownUnit(NodeId),
    #[error("unit {0} is not viable")]
    NotViable(NodeId),
    #[error("device info error: {0}")]
    DeviceInfo(String),
    #[error("extra info error: {0}")]
    ExtraInfo(String),
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
