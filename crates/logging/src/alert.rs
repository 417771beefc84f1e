use tokio::sync::mpsc::UnboundedSender;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// One `WARN`/`ERROR` record mirrored out of the tracing pipeline, destined
/// for the manager's alerter.
#[derive(Debug, Clone)]
pub struct AlertRecord {
    pub level: &'static str,
    pub target: String,
    pub message: String,
}

/// Forwards every `WARN`+ event onto `tx`. Never blocks the logging
/// pipeline: the channel is unbounded and a full receiver (or none at all)
/// only means alerts pile up or are dropped, it never stalls a log write.
pub struct AlertLayer {
    tx: UnboundedSender<AlertRecord>,
}

impl AlertLayer {
    pub fn new(tx: UnboundedSender<AlertRecord>) -> Self {
        Self { tx }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

impl<S> Layer<S> for AlertLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let record = AlertRecord {
            level: if level == Level::ERROR { "error" } else { "warning" },
            target: event.metadata().target().to_string(),
            message: visitor.message,
        };

        let _ = self.tx.send(record);
    }
}
