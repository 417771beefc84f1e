//! Coalescing and templating of `alert` messages before they reach a
//! transport agent (email, SMS, ...), grounded in
//! `modules/notification.py::AlertMessageFormatter`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sensorflow_protocol::Header;
use serde_json::Value;

use crate::prototype::{HandlerTable, Publish, Worker};

#[derive(Debug, Clone, Default)]
pub struct Templates {
    pub header: String,
    pub body: String,
    pub footer: String,
}

/// Minimal `{{key}}` substitution -- the original's formatter does the same
/// thing with `string.Template`, and nothing here needs a templating
/// crate's feature set (conditionals, loops, partials).
fn render(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        rest = &rest[start + 2..];
        let Some(end) = rest.find("}}") else {
            out.push_str("{{");
            out.push_str(rest);
            return out;
        };
        let key = rest[..end].trim();
        if let Some(value) = vars.get(key) {
            out.push_str(value);
        } else {
            out.push_str("{{");
            out.push_str(key);
            out.push_str("}}");
        }
        rest = &rest[end + 2..];
    }
    out.push_str(rest);
    out
}

struct CachedAlert {
    payload: Value,
}

pub struct AlertMessageFormatter {
    name: String,
    running: bool,
    handlers: HandlerTable,
    receiver: String,
    transport_topic: String,
    message_type: String,
    templates: Templates,
    project: String,
    node: String,
    collection_enabled: bool,
    collection_window: Duration,
    pending: Vec<CachedAlert>,
    first_pending_at: Option<Instant>,
}

impl AlertMessageFormatter {
    pub fn new(
        name: impl Into<String>,
        receiver: impl Into<String>,
        transport_topic: impl Into<String>,
        message_type: impl Into<String>,
        templates: Templates,
        project: impl Into<String>,
        node: impl Into<String>,
        collection_enabled: bool,
        collection_window: Duration,
    ) -> Self {
        let mut handlers = HandlerTable::with_defaults();
        handlers.register(sensorflow_protocol::message_type::ALERT);
        Self {
            name: name.into(),
            running: true,
            handlers,
            receiver: receiver.into(),
            transport_topic: transport_topic.into(),
            message_type: message_type.into(),
            templates,
            project: project.into(),
            node: node.into(),
            collection_enabled,
            collection_window,
            pending: Vec::new(),
            first_pending_at: None,
        }
    }

    fn cache_or_send(&mut self, payload: Value, publish: &Publish<'_>) {
        if !self.collection_enabled {
            self.send(&[payload], publish);
            return;
        }
        if self.pending.is_empty() {
            self.first_pending_at = Some(Instant::now());
        }
        self.pending.push(CachedAlert { payload });
    }

    /// Called periodically by whatever owns this worker's tick (the
    /// manager's alerter loop); flushes the cache once the collection
    /// window has elapsed.
    pub fn flush_if_due(&mut self, publish: &Publish<'_>) {
        if !self.collection_enabled {
            return;
        }
        let Some(first) = self.first_pending_at else {
            return;
        };
        if first.elapsed() < self.collection_window {
            return;
        }
        let payloads: Vec<Value> = self.pending.drain(..).map(|c| c.payload).collect();
        self.first_pending_at = None;
        self.send(&payloads, publish);
    }

    fn send(&self, alerts: &[Value], publish: &Publish<'_>) {
        if self.receiver.is_empty() {
            tracing::warn!(worker = %self.name, "no receiver defined for alert message");
            return;
        }

        let messages: Vec<String> = alerts
            .iter()
            .map(|a| a.get("message").and_then(Value::as_str).unwrap_or("").to_string())
            .collect();
        let joined = messages.join("\n");

        let mut vars = HashMap::new();
        vars.insert("receiver", self.receiver.clone());
        vars.insert("project", self.project.clone());
        vars.insert("node", self.node.clone());
        vars.insert("message", joined);

        let header_text = render(&self.templates.header, &vars);
        let body_text = render(&self.templates.body, &vars);
        let footer_text = render(&self.templates.footer, &vars);

        let payload = serde_json::json!({
            "type": self.message_type,
            "receiver": self.receiver,
            "header": header_text,
            "body": body_text,
            "footer": footer_text,
        });

        publish(
            &self.transport_topic,
            Header::new(self.message_type.clone(), self.name.clone()),
            payload,
            false,
        );
    }
}

impl Worker for AlertMessageFormatter {
    fn name(&self) -> &str {
        &self.name
    }

    fn worker_type(&self) -> &str {
        "modules.notification.AlertMessageFormatter"
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    fn start(&mut self) {
        self.running = true;
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn handle_custom(&mut self, _header: &Header, payload: &Value, publish: &Publish<'_>) {
        self.cache_or_send(payload.clone(), publish);
    }

    fn tick_interval(&self) -> Option<Duration> {
        if self.collection_enabled {
            Some(self.collection_window.max(Duration::from_millis(50)))
        } else {
            None
        }
    }

    fn on_tick(&mut self, publish: &Publish<'_>) {
        self.flush_if_due(publish);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_known_keys() {
        let mut vars = HashMap::new();
        vars.insert("project", "demo".to_string());
        assert_eq!(render("Project: {{project}}", &vars), "Project: demo");
    }

    #[test]
    fn render_leaves_unknown_keys_untouched() {
        let vars = HashMap::new();
        assert_eq!(render("{{missing}}", &vars), "{{missing}}");
    }

    #[test]
    fn immediate_send_when_collection_disabled() {
        let mut formatter = AlertMessageFormatter::new(
            "fmt1",
            "ops",
            "transport/email",
            "email",
            Templates { header: "{{project}}".into(), body: "{{message}}".into(), footer: String::new() },
            "demo",
            "node1",
            false,
            Duration::from_secs(60),
        );
        let seen = std::cell::Cell::new(0);
        let publish: &Publish<'_> = &|_t, _h, _p, _r| seen.set(seen.get() + 1);
        formatter.cache_or_send(serde_json::json!({ "message": "disk full" }), publish);
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn coalesces_until_window_elapses() {
        let mut formatter = AlertMessageFormatter::new(
            "fmt1",
            "ops",
            "transport/email",
            "email",
            Templates::default(),
            "demo",
            "node1",
            true,
            Duration::from_millis(0),
        );
        let seen = std::cell::Cell::new(0);
        let publish: &Publish<'_> = &|_t, _h, _p, _r| seen.set(seen.get() + 1);
        formatter.cache_or_send(serde_json::json!({ "message": "a" }), publish);
        assert_eq!(seen.get(), 0, "first alert must be cached, not sent immediately");
        formatter.flush_if_due(publish);
        assert_eq!(seen.get(), 1);
    }
}
