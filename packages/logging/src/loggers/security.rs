use crate::{Direction, ImmutableLogger, LogInfo, LogPayload, Loglevel};
use std::sync::Arc;
use zwusb_core::prelude::*;

const SECURITY_LOGLEVEL: Loglevel = Loglevel::Verbose;

/// One-line traces for the S0 engine. Dropped frames are never more than
/// a single line here.
#[derive(Clone)]
pub struct SecurityLogger {
    inner: Arc<dyn ImmutableLogger>,
}

impl SecurityLogger {
    pub fn new(inner: Arc<dyn ImmutableLogger>) -> Self {
        Self { inner }
    }

    pub fn dropped(&self, src: NodeId, reason: &'static str) {
        let log = LogInfo::builder()
            .label("SECURITY")
            .direction(Direction::Inbound)
            .primary_tag("DROPPED".into())
            .payload(LogPayload::Text(
                format!("frame from node {src}: {reason}").into(),
            ))
            .build();
        self.inner.log(log, SECURITY_LOGLEVEL);
    }

    pub fn nonce_issued(&self, target: NodeId, nonce_id: u8) {
        if self.inner.log_level() < SECURITY_LOGLEVEL {
            return;
        }
        let log = LogInfo::builder()
            .label("SECURITY")
            .direction(Direction::Outbound)
            .payload(LogPayload::Text(
                format!("nonce {nonce_id:#04x} issued to node {target}").into(),
            ))
            .build();
        self.inner.log(log, SECURITY_LOGLEVEL);
    }

    pub fn nonce_requested(&self, target: NodeId) {
        if self.inner.log_level() < SECURITY_LOGLEVEL {
            return;
        }
        let log = LogInfo::builder()
            .label("SECURITY")
            .direction(Direction::Outbound)
            .payload(LogPayload::Text(
                format!("requesting nonce from node {target}").into(),
            ))
            .build();
        self.inner.log(log, SECURITY_LOGLEVEL);
    }
}
