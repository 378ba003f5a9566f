//! Structured logging.
//!
//! [`init_logging`] installs a global `tracing` subscriber that renders every
//! event as one JSON line on stdout. Between filtering and rendering sits the
//! [`CallbackLayer`], which hands a copy of each event to the registered
//! [`LogCallback`] (see [`register_log_callback`]).
//!
//! A callback that returns an error or panics never reaches the caller that
//! logged: the failure is written as a `log_callback_failed` warning line and
//! the original event is still rendered. Events emitted from inside a callback
//! are dropped by the `tracing` dispatcher, so a callback cannot re-enter
//! itself.

use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, RwLock};

use anyhow::Result;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::AppConfig;

type CallbackFn = dyn Fn(&Value) -> Result<()> + Send + Sync;

/// External hook receiving every structured log event as a JSON object.
#[derive(Clone)]
pub struct LogCallback(Arc<CallbackFn>);

impl LogCallback {
    pub fn new(f: impl Fn(&Value) -> Result<()> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    fn call(&self, event: &Value) -> Result<()> {
        (self.0)(event)
    }
}

impl std::fmt::Debug for LogCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LogCallback")
    }
}

/// Shared, replaceable callback registration.
#[derive(Clone, Default)]
pub struct CallbackSlot(Arc<RwLock<Option<LogCallback>>>);

impl CallbackSlot {
    pub fn set(&self, callback: LogCallback) {
        *self.0.write().expect("log callback lock poisoned") = Some(callback);
    }

    pub fn clear(&self) {
        *self.0.write().expect("log callback lock poisoned") = None;
    }

    fn get(&self) -> Option<LogCallback> {
        self.0.read().expect("log callback lock poisoned").clone()
    }
}

fn global_slot() -> &'static CallbackSlot {
    static SLOT: OnceLock<CallbackSlot> = OnceLock::new();
    SLOT.get_or_init(CallbackSlot::default)
}

/// Register the process-wide log callback, replacing any previous one.
pub fn register_log_callback(callback: LogCallback) {
    global_slot().set(callback);
}

pub fn clear_log_callback() {
    global_slot().clear();
}

/// Install the global subscriber. Only the first call has an effect;
/// returns whether this call installed it.
///
/// `RUST_LOG` overrides `config.log_level`. A callback present in
/// `config.log_callback` is registered on every call.
pub fn init_logging(config: &AppConfig) -> bool {
    static INSTALLED: OnceLock<()> = OnceLock::new();

    if let Some(cb) = &config.log_callback {
        register_log_callback(cb.clone());
    }

    let mut installed_now = false;
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_lowercase()));
        let fmt_layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(std::io::stdout);

        // Another subscriber may already be global (embedding applications, tests).
        installed_now = tracing_subscriber::registry()
            .with(filter)
            .with(CallbackLayer::new(global_slot().clone()))
            .with(fmt_layer)
            .try_init()
            .is_ok();
    });
    installed_now
}

// ============ Callback layer ============

/// `tracing` layer that forwards events to a [`LogCallback`].
pub struct CallbackLayer<W = fn() -> std::io::Stdout> {
    slot: CallbackSlot,
    fallback: W,
}

impl CallbackLayer {
    pub fn new(slot: CallbackSlot) -> Self {
        Self {
            slot,
            fallback: std::io::stdout,
        }
    }
}

impl<W> CallbackLayer<W>
where
    W: for<'w> MakeWriter<'w> + 'static,
{
    /// Write callback failures to `writer` instead of stdout.
    pub fn with_fallback_writer<W2>(self, writer: W2) -> CallbackLayer<W2>
    where
        W2: for<'w> MakeWriter<'w> + 'static,
    {
        CallbackLayer {
            slot: self.slot,
            fallback: writer,
        }
    }

    fn report_failure(&self, source: &Map<String, Value>, error: String) {
        let line = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "level": "WARN",
            "target": module_path!(),
            "message": "log_callback_failed",
            "error": error,
            "event": source.get("message").cloned().unwrap_or(Value::Null),
        });
        let mut writer = self.fallback.make_writer();
        // Nowhere left to report a failed write.
        let _ = writeln!(writer, "{}", line);
    }
}

/// Span fields captured at creation, merged into callback payloads.
struct SpanFields(Map<String, Value>);

impl<S, W> Layer<S> for CallbackLayer<W>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    W: for<'w> MakeWriter<'w> + 'static,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = Map::new();
        attrs.record(&mut JsonVisitor(&mut fields));
        span.extensions_mut().insert(SpanFields(fields));
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut ext = span.extensions_mut();
        if let Some(SpanFields(fields)) = ext.get_mut::<SpanFields>() {
            values.record(&mut JsonVisitor(fields));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(callback) = self.slot.get() else {
            return;
        };

        let mut payload = Map::new();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                if let Some(SpanFields(fields)) = span.extensions().get::<SpanFields>() {
                    for (k, v) in fields {
                        payload.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        event.record(&mut JsonVisitor(&mut payload));

        let meta = event.metadata();
        payload.insert("level".into(), Value::String(meta.level().to_string()));
        payload.insert("target".into(), Value::String(meta.target().to_string()));
        payload
            .entry("message")
            .or_insert_with(|| Value::String(String::new()));

        let event_value = Value::Object(payload);
        let outcome = catch_unwind(AssertUnwindSafe(|| callback.call(&event_value)));
        let Value::Object(payload) = event_value else {
            return;
        };
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.report_failure(&payload, e.to_string()),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "callback panicked".to_string());
                self.report_failure(&payload, reason);
            }
        }
    }
}

struct JsonVisitor<'a>(&'a mut Map<String, Value>);

impl Visit for JsonVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0
            .insert(field.name().to_string(), Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), Value::Bool(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), Value::String(format!("{:?}", value)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Buffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn with_layer(slot: &CallbackSlot, fallback: &Buffer, f: impl FnOnce()) {
        let writer = fallback.clone();
        let layer = CallbackLayer::new(slot.clone()).with_fallback_writer(move || writer.clone());
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, f);
    }

    #[test]
    fn test_callback_receives_event_and_span_fields() {
        let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
        let sink = seen.clone();
        let slot = CallbackSlot::default();
        slot.set(LogCallback::new(move |event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        }));

        with_layer(&slot, &Buffer::default(), || {
            let span = tracing::info_span!("request", tenant_id = "acme", project_code = "support");
            let _guard = span.enter();
            tracing::info!(results = 3, "search_done");
        });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["message"], "search_done");
        assert_eq!(seen[0]["results"], 3);
        assert_eq!(seen[0]["tenant_id"], "acme");
        assert_eq!(seen[0]["level"], "INFO");
    }

    #[test]
    fn test_failing_callback_is_demoted_to_warning() {
        let slot = CallbackSlot::default();
        slot.set(LogCallback::new(|_| anyhow::bail!("sink offline")));
        let fallback = Buffer::default();

        with_layer(&slot, &fallback, || {
            tracing::info!("still_logged");
        });

        let out = fallback.contents();
        assert!(out.contains("log_callback_failed"));
        assert!(out.contains("sink offline"));
        assert!(out.contains("still_logged"));
    }

    #[test]
    fn test_panicking_callback_does_not_propagate() {
        let slot = CallbackSlot::default();
        slot.set(LogCallback::new(|_| panic!("boom")));
        let fallback = Buffer::default();

        with_layer(&slot, &fallback, || {
            tracing::warn!("before_panic");
        });

        assert!(fallback.contents().contains("boom"));
    }

    #[test]
    fn test_no_callback_is_silent() {
        let fallback = Buffer::default();
        with_layer(&CallbackSlot::default(), &fallback, || {
            tracing::info!("nothing_registered");
        });
        assert!(fallback.contents().is_empty());
    }
}
