mod driver;
pub use driver::DriverLogger;

mod security;
pub use security::SecurityLogger;

mod serial;
pub use serial::SerialLogger;

mod unit;
pub use unit::UnitLogger;
