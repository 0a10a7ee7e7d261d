//! Diagnostic tracing setup and the plain-text session transcript log.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;

/// Set up tracing-subscriber to write to `assistant.log` in `dir`. Call once
/// from the embedding application; later calls are no-ops.
pub fn init_file_tracing(dir: &Path) {
    let file_appender = tracing_appender::rolling::never(dir, "assistant.log");
    let subscriber = tracing_subscriber::fmt()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_target(true)
        .with_max_level(tracing::Level::INFO)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Appends each successful user/assistant exchange to a per-session text
/// file. Write failures are swallowed -- transcript logging must never take
/// down the host application.
pub struct SessionLog {
    path: PathBuf,
}

impl SessionLog {
    /// Create the log file with a header. Returns `None` when the directory
    /// or file cannot be created.
    pub fn create(dir: &Path, session_name: Option<&str>) -> Option<SessionLog> {
        fs::create_dir_all(dir).ok()?;

        let slug = session_name
            .unwrap_or("Session")
            .replace(' ', "-")
            .replace(|c: char| !c.is_alphanumeric() && c != '-', "");

        let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let path = dir.join(format!("{slug}_{timestamp}.txt"));

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)
            .ok()?;

        let header = format!(
            "=== Screen Assistant - Session Log ===\nSession: {}\nDate: {}\n========================================\n\n",
            session_name.unwrap_or("Session"),
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        file.write_all(header.as_bytes()).ok()?;

        Some(SessionLog { path })
    }

    /// Append one exchange. Call after each successful model response.
    pub fn log_exchange(&self, user_msg: &str, assistant_msg: &str) {
        let mut file = match OpenOptions::new().append(true).open(&self.path) {
            Ok(f) => f,
            Err(_) => return,
        };

        let now = Local::now().format("%H:%M:%S");
        let entry = format!("[{now}] You:\n{user_msg}\n\n[{now}] Assistant:\n{assistant_msg}\n\n");

        let _ = file.write_all(entry.as_bytes());
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
