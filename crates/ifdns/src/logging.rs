use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::level_filters::LevelFilter;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::stream::{BufferedStream, Cursor, CursorAware};

pub const LOGGING_ENV: &str = "IFDNS_LOG";

/// One tracing event, as it appears on the logs stream.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub cursor: Cursor,
    pub time: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
}

impl CursorAware for LogEntry {
    fn set_cursor(&mut self, cursor: Cursor) {
        self.cursor = cursor;
    }
}

/// Mirrors every accepted tracing event into a bounded in-memory stream.
pub struct LogRecorder {
    stream: Arc<BufferedStream<LogEntry>>,
}

impl LogRecorder {
    pub fn new(stream: Arc<BufferedStream<LogEntry>>) -> Self {
        LogRecorder { stream }
    }
}

impl<S: Subscriber> Layer<S> for LogRecorder {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.stream.append(LogEntry {
            cursor: Cursor::HEAD,
            time: Utc::now(),
            level: event.metadata().level().to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.finish(),
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }
}

/// Installs the fmt subscriber and the log recorder; returns the logs stream.
pub fn setup_logging(debug: bool, history_size: usize) -> anyhow::Result<Arc<BufferedStream<LogEntry>>> {
    let stream = Arc::new(BufferedStream::new(history_size));

    let default_level = if debug { "debug" } else { "info" };
    let env_filter = EnvFilter::builder()
        .with_env_var(LOGGING_ENV)
        .try_from_env()
        .unwrap_or_else(|_| format!("ifdns={default_level}").into());

    let recorder_level = if debug { LevelFilter::DEBUG } else { LevelFilter::INFO };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .with(LogRecorder::new(stream.clone()).with_filter(recorder_level))
        .try_init()
        .context("failed to initialize tracing subscriber")?;

    Ok(stream)
}
