mod definitions;
pub use definitions::*;

mod console;
pub use console::ConsoleLogger;

pub mod loggers;
