pub mod ccimpl;
pub mod device_info;
pub mod driver;
pub mod error;
pub mod fields;
pub mod scheduler;
pub mod timings;
pub mod units;

pub use driver::{ZwDriver, ZwDriverConfig};
pub use error::{Error, Result};
