use crate::{ImmutableLogger, LogInfo, LogPayload, Loglevel};
use std::sync::Arc;
use zwusb_core::prelude::*;

const UNIT_LOGLEVEL: Loglevel = Loglevel::Verbose;

/// Per-unit lifecycle tracing: error states, polls, wakeups.
#[derive(Clone)]
pub struct UnitLogger {
    inner: Arc<dyn ImmutableLogger>,
}

impl UnitLogger {
    pub fn new(inner: Arc<dyn ImmutableLogger>) -> Self {
        Self { inner }
    }

    pub fn message(&self, node: NodeId, text: impl Into<String>) {
        if self.inner.log_level() < UNIT_LOGLEVEL {
            return;
        }
        self.emit(node, text.into(), UNIT_LOGLEVEL);
    }

    pub fn error_state(&self, node: NodeId, desc: &str) {
        self.emit(node, format!("{desc} entered error state"), Loglevel::Warn);
    }

    pub fn recovered(&self, node: NodeId, desc: &str) {
        self.emit(node, format!("{desc} left error state"), Loglevel::Info);
    }

    pub fn not_viable(&self, node: NodeId, reason: &str) {
        self.emit(
            node,
            format!("unit is not viable and will be skipped: {reason}"),
            Loglevel::Error,
        );
    }

    fn emit(&self, node: NodeId, text: String, level: Loglevel) {
        let log = LogInfo::builder()
            .label("UNIT")
            .primary_tag(format!("node {node}").into())
            .payload(LogPayload::Text(text.into()))
            .build();
        self.inner.log(log, level);
    }
}
