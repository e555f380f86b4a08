use crate::{ImmutableLogger, LogInfo, LogPayload, Loglevel};
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// A line-oriented console sink. One line per record:
/// `HH:MM:SS.mmm LABEL « [tag] payload`.
pub struct ConsoleLogger {
    out: Mutex<StandardStream>,
    level: AtomicU8,
}

fn level_to_u8(level: Loglevel) -> u8 {
    level as u8
}

fn u8_to_level(raw: u8) -> Loglevel {
    match raw {
        0 => Loglevel::Error,
        1 => Loglevel::Warn,
        2 => Loglevel::Info,
        3 => Loglevel::Verbose,
        4 => Loglevel::Debug,
        _ => Loglevel::Silly,
    }
}

fn level_color(level: Loglevel) -> Option<Color> {
    match level {
        Loglevel::Error => Some(Color::Red),
        Loglevel::Warn => Some(Color::Yellow),
        Loglevel::Info => None,
        Loglevel::Verbose => Some(Color::Cyan),
        Loglevel::Debug | Loglevel::Silly => Some(Color::Blue),
    }
}

impl ConsoleLogger {
    pub fn new(level: Loglevel) -> Self {
        Self {
            out: Mutex::new(StandardStream::stdout(ColorChoice::Auto)),
            level: AtomicU8::new(level_to_u8(level)),
        }
    }

    fn write_record(&self, log: &LogInfo, level: Loglevel) -> std::io::Result<()> {
        let mut out = self.out.lock().expect("console lock poisoned");

        let mut spec = ColorSpec::new();
        spec.set_fg(level_color(level));
        out.set_color(&spec)?;

        let head = format!(
            "{} {:<8}{}",
            log.timestamp.format("%H:%M:%S%.3f"),
            log.label,
            log.direction.symbol(),
        );
        write!(out, "{head}")?;
        if let Some(tag) = &log.primary_tag {
            write!(out, "[{tag}] ")?;
        }
        match &log.payload {
            LogPayload::Empty => {}
            LogPayload::Text(text) => write!(out, "{text}")?,
            LogPayload::Lines(lines) => {
                for line in lines {
                    write!(out, "\n    {line}")?;
                }
            }
        }
        if let Some(tag) = &log.secondary_tag {
            write!(out, " ({tag})")?;
        }
        out.reset()?;
        writeln!(out)
    }
}

impl ImmutableLogger for ConsoleLogger {
    fn log(&self, log: LogInfo, level: Loglevel) {
        if level > self.log_level() {
            return;
        }
        // A full console is no reason to take the driver down
        let _ = self.write_record(&log, level);
    }

    fn log_level(&self) -> Loglevel {
        u8_to_level(self.level.load(Ordering::Relaxed))
    }

    fn set_log_level(&self, level: Loglevel) {
        self.level.store(level_to_u8(level), Ordering::Relaxed);
    }
}
