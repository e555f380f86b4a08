pub mod consts;
pub mod error;
pub mod frame;
pub mod link;
pub mod raw;

pub use error::{Error, Result};
