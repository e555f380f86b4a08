use crate::{Direction, ImmutableLogger, LogInfo, LogPayload, Loglevel};
use std::sync::Arc;

const SERIAL_LOGLEVEL: Loglevel = Loglevel::Debug;

/// Raw byte and control-flow tracing for the codec.
#[derive(Clone)]
pub struct SerialLogger {
    inner: Arc<dyn ImmutableLogger>,
}

impl SerialLogger {
    pub fn new(inner: Arc<dyn ImmutableLogger>) -> Self {
        Self { inner }
    }

    pub fn data(&self, data: &[u8], direction: Direction) {
        if self.inner.log_level() < SERIAL_LOGLEVEL {
            return;
        }

        let message = format!("0x{}", hex::encode(data));
        let log = LogInfo::builder()
            .label("SERIAL")
            .direction(direction)
            .secondary_tag(format!("{} bytes", data.len()).into())
            .payload(LogPayload::Text(message.into()))
            .build();
        self.inner.log(log, SERIAL_LOGLEVEL);
    }

    pub fn control_flow(&self, name: &'static str, direction: Direction) {
        if self.inner.log_level() < SERIAL_LOGLEVEL {
            return;
        }

        let log = LogInfo::builder()
            .label("SERIAL")
            .direction(direction)
            .primary_tag(name.into())
            .payload(LogPayload::empty())
            .build();
        self.inner.log(log, SERIAL_LOGLEVEL);
    }

    pub fn discarded(&self, data: &[u8]) {
        if self.inner.log_level() < SERIAL_LOGLEVEL {
            return;
        }

        let message = format!("invalid data: 0x{}", hex::encode(data));
        let log = LogInfo::builder()
            .label("SERIAL")
            .direction(Direction::Inbound)
            .primary_tag("DISCARDED".into())
            .secondary_tag(format!("{} bytes", data.len()).into())
            .payload(LogPayload::Text(message.into()))
            .build();
        self.inner.log(log, SERIAL_LOGLEVEL);
    }

    pub fn link_failure(&self, consecutive_naks: u32) {
        let log = LogInfo::builder()
            .label("SERIAL")
            .payload(LogPayload::Text(
                format!("link failure after {consecutive_naks} consecutive NAKs").into(),
            ))
            .build();
        self.inner.log(log, Loglevel::Error);
    }
}
