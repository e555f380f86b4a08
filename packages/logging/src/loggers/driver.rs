use crate::{Direction, ImmutableLogger, LogInfo, LogPayload, Loglevel};
use std::sync::Arc;
use zwusb_core::prelude::*;

const DRIVER_LOGLEVEL: Loglevel = Loglevel::Verbose;

/// Scheduler and transaction tracing.
#[derive(Clone)]
pub struct DriverLogger {
    inner: Arc<dyn ImmutableLogger>,
}

impl DriverLogger {
    pub fn new(inner: Arc<dyn ImmutableLogger>) -> Self {
        Self { inner }
    }

    pub fn message(&self, message: impl Into<String>) {
        self.log_text(message.into(), DRIVER_LOGLEVEL);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log_text(message.into(), Loglevel::Warn);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log_text(message.into(), Loglevel::Error);
    }

    pub fn sent(&self, target: NodeId, ack_id: u32, callback: Option<u8>) {
        if self.inner.log_level() < DRIVER_LOGLEVEL {
            return;
        }
        let tag = match callback {
            Some(cb) => format!("node {target}, ack {ack_id}, cb {cb:#04x}"),
            None => format!("node {target}, ack {ack_id}"),
        };
        let log = LogInfo::builder()
            .label("DRIVER")
            .direction(Direction::Outbound)
            .secondary_tag(tag.into())
            .payload(LogPayload::empty())
            .build();
        self.inner.log(log, DRIVER_LOGLEVEL);
    }

    pub fn trans_ack(&self, callback: u8, status: TransmitStatus) {
        if self.inner.log_level() < DRIVER_LOGLEVEL {
            return;
        }
        let log = LogInfo::builder()
            .label("DRIVER")
            .direction(Direction::Inbound)
            .primary_tag(format!("cb {callback:#04x}").into())
            .payload(LogPayload::Text(format!("transmit status {status:?}").into()))
            .build();
        self.inner.log(log, DRIVER_LOGLEVEL);
    }

    pub fn unhandled_frame(&self, function_id: u8) {
        let log = LogInfo::builder()
            .label("DRIVER")
            .direction(Direction::Inbound)
            .payload(LogPayload::Text(
                format!("dropping unhandled frame, function {function_id:#04x}").into(),
            ))
            .build();
        self.inner.log(log, Loglevel::Info);
    }

    fn log_text(&self, text: String, level: Loglevel) {
        if self.inner.log_level() < level {
            return;
        }
        let log = LogInfo::builder()
            .label("DRIVER")
            .payload(LogPayload::Text(text.into()))
            .build();
        self.inner.log(log, level);
    }
}
