//! Append-only file logging layer for `tracing`.
//!
//! The stderr `fmt` layer is what operators watch live; this layer keeps a
//! persistent history on devices where the service runs unattended. Lines
//! are grep-friendly: the `event` key comes first, then the message, then
//! the remaining fields as `key=value`.
//!
//! ```text
//! 2024-05-01T09:12:44.120Z WARN  pilink::core::transfer::listener event=transfer_rejected "Rejected" filename=a.txt reason="no active transfer"
//! ```

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// The fields of one event, split the way a line is written.
#[derive(Default, Debug, PartialEq)]
struct Record {
    event: Option<String>,
    message: Option<String>,
    fields: Vec<(&'static str, String)>,
}

impl Record {
    fn push(&mut self, field: &Field, value: String) {
        match field.name() {
            "event" => self.event = Some(value),
            "message" => self.message = Some(value),
            name => self.fields.push((name, value)),
        }
    }

    fn render(&self, timestamp: &str, level: Level, target: &str) -> String {
        let mut line = format!("{timestamp} {:<5} {target}", level.as_str());
        if let Some(event) = &self.event {
            line.push_str(&format!(" event={event}"));
        }
        if let Some(message) = &self.message {
            line.push_str(&format!(" {message:?}"));
        }
        for (name, value) in &self.fields {
            line.push_str(&format!(" {name}={}", quote(value)));
        }
        line
    }
}

fn quote(value: &str) -> String {
    if value.is_empty() || value.contains(char::is_whitespace) || value.contains('"') {
        format!("{value:?}")
    } else {
        value.to_string()
    }
}

impl Visit for Record {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, value.to_string());
    }
}

/// A tracing layer that appends every event to a file, one line each, with
/// a UTC ISO 8601 timestamp.
pub struct FileLogLayer {
    writer: Arc<Mutex<File>>,
}

impl FileLogLayer {
    /// Open (or create) `path` for appending. Parent directories are created.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Arc::new(Mutex::new(file)),
        })
    }
}

impl<S: Subscriber> Layer<S> for FileLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();

        let mut record = Record::default();
        event.record(&mut record);

        let timestamp = chrono::Utc::now()
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string();
        let line = record.render(&timestamp, *meta.level(), meta.target());

        if let Ok(mut writer) = self.writer.lock() {
            let _ = writeln!(writer, "{line}");
            let _ = writer.flush();
        }
    }
}
