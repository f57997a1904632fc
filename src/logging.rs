//! Structured JSON logging.
//!
//! Emits one JSON object per line on stdout with the schema shared with the
//! control plane:
//!
//! ```json
//! {"time":"...","level":"info","service":"codeforge-worker","msg":"...","run_id":"..."}
//! ```
//!
//! Fields recorded on an event (`request_id`, `task_id`, `run_id`, ...) are
//! flattened into the top-level object.

use std::fmt;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Formatter producing the control-plane log schema.
struct JsonFormatter {
    service: String,
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Vec<(String, serde_json::Value)>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .push((field.name().to_string(), serde_json::Value::String(format!("{value:?}"))));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .push((field.name().to_string(), serde_json::Value::String(value.to_string())));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.push((field.name().to_string(), value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.push((field.name().to_string(), value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.push((field.name().to_string(), value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.push((field.name().to_string(), value.into()));
    }
}

impl<S, N> FormatEvent<S, N> for JsonFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut obj = serde_json::Map::new();
        obj.insert(
            "time".to_string(),
            serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
        );
        obj.insert(
            "level".to_string(),
            serde_json::Value::String(event.metadata().level().to_string().to_lowercase()),
        );
        obj.insert(
            "service".to_string(),
            serde_json::Value::String(self.service.clone()),
        );
        obj.insert("msg".to_string(), serde_json::Value::String(visitor.message));
        for (key, value) in visitor.fields {
            obj.insert(key, value);
        }

        writeln!(writer, "{}", serde_json::Value::Object(obj))
    }
}

/// Install the global subscriber. Must be called once at startup before any
/// logging; subsequent calls are no-ops.
pub fn init(service: &str, level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(JsonFormatter {
            service: service.to_string(),
        })
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_and_logging_does_not_panic() {
        init("test-service", "debug");
        tracing::info!(run_id = "r1", step = 3, "hello");
        init("test-service", "garbage===directive");
        tracing::warn!("still fine");
    }

    #[test]
    fn visitor_flattens_fields() {
        let mut visitor = FieldVisitor::default();
        // The Visit impl is exercised indirectly through events above; here
        // just check the default state is clean.
        assert!(visitor.message.is_empty());
        assert!(visitor.fields.is_empty());
        visitor.fields.push(("run_id".to_string(), "r1".into()));
        assert_eq!(visitor.fields.len(), 1);
    }
}
