use chrono::{DateTime, Utc};
use std::borrow::Cow;
use typed_builder::TypedBuilder;

/// A trait for logging messages
pub trait Logger {
    fn log(&mut self, log: LogInfo, level: Loglevel);

    fn log_level(&self) -> Loglevel;
    fn set_log_level(&mut self, level: Loglevel);
}

/// A variant of the [Logger] trait that does not require mutability. This
/// is what the component loggers hold, since reader, writer and API
/// threads all trace concurrently.
pub trait ImmutableLogger: Send + Sync {
    fn log(&self, log: LogInfo, level: Loglevel);

    fn log_level(&self) -> Loglevel;
    fn set_log_level(&self, level: Loglevel);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Loglevel {
    Error,
    Warn,
    Info,
    Verbose,
    Debug,
    Silly,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    #[default]
    None,
    Inbound,
    Outbound,
}

impl Direction {
    pub fn symbol(&self) -> &'static str {
        match self {
            Direction::None => "  ",
            Direction::Inbound => "« ",
            Direction::Outbound => "» ",
        }
    }
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct LogInfo {
    #[builder(default = Utc::now())]
    pub timestamp: DateTime<Utc>,
    #[builder(default)]
    pub direction: Direction,
    pub label: &'static str,
    #[builder(default, setter(strip_option))]
    pub primary_tag: Option<Cow<'static, str>>,
    #[builder(default, setter(strip_option))]
    pub secondary_tag: Option<Cow<'static, str>>,
    pub payload: LogPayload,
}

#[derive(Debug, Clone)]
pub enum LogPayload {
    Empty,
    Text(Cow<'static, str>),
    Lines(Vec<Cow<'static, str>>),
}

impl LogPayload {
    pub fn empty() -> Self {
        LogPayload::Empty
    }
}

impl<T> From<T> for LogPayload
where
    T: Into<Cow<'static, str>>,
{
    fn from(text: T) -> Self {
        LogPayload::Text(text.into())
    }
}

/// A logger that swallows everything. Used where no trace sink was wired.
#[derive(Default)]
pub struct NullLogger;

impl ImmutableLogger for NullLogger {
    fn log(&self, _log: LogInfo, _level: Loglevel) {}

    fn log_level(&self) -> Loglevel {
        Loglevel::Error
    }

    fn set_log_level(&self, _level: Loglevel) {}
}
