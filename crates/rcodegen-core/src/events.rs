//! Observability events emitted by the Orchestrator to a caller-supplied
//! sink. Delivery is synchronous with state transitions — a slow sink
//! blocks forward progress, by design (spec.md §6.5).

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use crate::bundle::StepKind;
use crate::envelope::Envelope;

#[derive(Clone, Debug)]
pub enum Event {
    RunStarted {
        bundle_name: String,
        job_id: String,
        inputs: HashMap<String, String>,
    },
    StepStarted {
        step_name: String,
        kind: StepKind,
        tool: Option<String>,
        model: Option<String>,
    },
    StepFinished {
        step_name: String,
        envelope: Envelope,
    },
    StepSkipped {
        step_name: String,
    },
    RunFinished {
        envelope: Envelope,
    },
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event);
}

/// Default sink: logs every event via `tracing`, so a bare CLI invocation
/// produces useful output with no wiring.
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: Event) {
        match event {
            Event::RunStarted { bundle_name, job_id, .. } => {
                info!(bundle = %bundle_name, job_id = %job_id, "run started");
            }
            Event::StepStarted { step_name, kind, tool, .. } => {
                info!(step = %step_name, kind = ?kind, tool = tool.as_deref(), "step started");
            }
            Event::StepFinished { step_name, envelope } => {
                info!(step = %step_name, status = %envelope.status, "step finished");
            }
            Event::StepSkipped { step_name } => {
                info!(step = %step_name, "step skipped");
            }
            Event::RunFinished { envelope } => {
                info!(status = %envelope.status, "run finished");
            }
        }
    }
}

/// Forwards every event to an `mpsc` channel for a live external
/// consumer (e.g. a terminal UI). Send failures (receiver dropped) are
/// swallowed: observability must never abort a run.
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<Event>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Metrics;

    #[tokio::test]
    async fn channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelEventSink::new();
        sink.emit(Event::StepSkipped { step_name: "s".into() }).await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::StepSkipped { step_name } if step_name == "s"));
    }

    #[tokio::test]
    async fn channel_sink_emit_does_not_panic_after_receiver_dropped() {
        let (sink, rx) = ChannelEventSink::new();
        drop(rx);
        sink.emit(Event::RunFinished { envelope: Envelope::success(None, Metrics::default()) }).await;
    }

    #[tokio::test]
    async fn tracing_sink_emit_does_not_panic() {
        let sink = TracingEventSink;
        sink.emit(Event::RunStarted {
            bundle_name: "b".into(),
            job_id: "j".into(),
            inputs: HashMap::new(),
        })
        .await;
    }
}
