use anyhow::Result;
use chrono::Utc;
use crossbeam_channel::{self, RecvError, Sender};
use nebula_utils::get_hostname;
use serde::Serialize;
use std::{collections::BTreeMap, io::Write, sync::Mutex, thread};
use tracing::{
    field::{Field, Visit},
    level_filters::LevelFilter,
    Level, Subscriber,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, Layer,
};

const LOG_NAME: &str = "nebula-dialplan";

/// Hands formatted log lines to a background thread so the emitting call
/// never blocks on stderr.
pub struct LogWriter {
    sender: Sender<Vec<u8>>,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct LogSourceLocation {
    file: Option<String>,
    line: Option<String>,
    module_path: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct LogEntry {
    log_name: String,
    severity: LogSeverity,
    timestamp: String,
    source_location: Option<LogSourceLocation>,
    json_payload: serde_json::Value,
}

#[derive(Debug, Default, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogSeverity {
    /// Log entry has no assigned severity level
    #[default]
    Default,
    /// Debug or trace information
    Debug,
    /// Routine information, such as ongoing status or performance
    Info,
    /// Warning events might cause problems
    Warning,
    /// Error events are likely to cause problems
    Error,
}

impl From<&Level> for LogSeverity {
    fn from(level: &Level) -> Self {
        match level {
            &Level::DEBUG | &Level::TRACE => Self::Debug,
            &Level::INFO => Self::Info,
            &Level::WARN => Self::Warning,
            &Level::ERROR => Self::Error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LevelFilter,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            json: false,
        }
    }
}

impl Default for LogWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl LogWriter {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(1000);
        thread::spawn(move || -> Result<usize, RecvError> {
            let mut stderr = std::io::stderr();
            loop {
                let data: Vec<u8> = receiver.recv()?;
                let _ = stderr.write_all(&data);
            }
        });
        Self { sender }
    }
}

impl std::io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = self.sender.try_send(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Installs the global subscriber. Keep the returned guard alive until
/// exit; dropping it flushes lines still queued for stderr.
#[must_use]
pub fn init() -> WorkerGuard {
    init_with(LogConfig::default())
}

#[must_use]
pub fn init_with(config: LogConfig) -> WorkerGuard {
    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(config.level.into())
        .from_env_lossy();
    let json = if config.json {
        Some(JsonLayer::new(LogWriter::new()))
    } else {
        None
    };
    let fmt = if config.json {
        None
    } else {
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking)
                .compact(),
        )
    };
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(fmt)
        .try_init();
    guard
}

/// Writes every event as one JSON line.
struct JsonLayer {
    hostname: String,
    writer: Mutex<LogWriter>,
}

impl JsonLayer {
    fn new(writer: LogWriter) -> Self {
        let hostname = get_hostname().unwrap_or_default();
        Self {
            hostname,
            writer: Mutex::new(writer),
        }
    }

    fn entry(&self, event: &tracing::Event<'_>) -> Option<LogEntry> {
        let meta = event.metadata();
        let source_location = meta.file().map(|file| LogSourceLocation {
            file: Some(file.to_string()),
            line: meta.line().map(|line| line.to_string()),
            module_path: meta.module_path().map(|path| path.to_string()),
        });
        let mut visitor = Visitor::new(&self.hostname);
        visitor
            .values
            .insert("target", serde_json::Value::from(meta.target()));
        event.record(&mut visitor);
        let json_payload = serde_json::to_value(&visitor.values).ok()?;
        Some(LogEntry {
            log_name: LOG_NAME.to_string(),
            severity: LogSeverity::from(meta.level()),
            timestamp: Utc::now().to_rfc3339(),
            source_location,
            json_payload,
        })
    }
}

impl<S> Layer<S> for JsonLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(entry) = self.entry(event) {
            if let Ok(mut line) = serde_json::to_vec(&entry) {
                line.push(b'\n');
                if let Ok(mut writer) = self.writer.lock() {
                    let _ = writer.write_all(&line);
                }
            }
        }
    }
}

/// Visitor that collects event fields into a JSON object
pub(crate) struct Visitor<'a> {
    values: BTreeMap<&'a str, serde_json::Value>,
}

impl<'a> Visitor<'a> {
    pub(crate) fn new(hostname: &str) -> Self {
        let mut values = BTreeMap::new();
        values.insert("hostname", serde_json::Value::from(hostname));
        Self { values }
    }
}

impl<'a> Visit for Visitor<'a> {
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.values
            .insert(field.name(), serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.values
            .insert(field.name(), serde_json::Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.values
            .insert(field.name(), serde_json::Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.values
            .insert(field.name(), serde_json::Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.values.insert(
            field.name(),
            serde_json::Value::from(format!("{:?}", value)),
        );
    }
}

impl<'a> std::fmt::Debug for Visitor<'a> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter
            .debug_struct("Visitor")
            .field("values", &self.values)
            .finish()
    }
}
