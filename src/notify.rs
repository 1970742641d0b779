//! Notifications about finished backup runs.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use derive_more::{Display, Error, From};

use crate::model::{BackupConfig, BackupResult, BackupStatus};

#[derive(Debug, Display, Error, From)]
pub enum NotifyError {
    #[display("sending notification failed: {_0}")]
    Io(io::Error),
    #[display("sendmail exited with {_0}")]
    #[from(ignore)]
    Sendmail(#[error(ignore)] String),
}

/// Notification collaborator.
pub trait Notifier: Send + Sync {
    fn send(&self, recipients: &[String], subject: &str, html_body: &str) -> Result<(), NotifyError>;
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, recipients: &[String], subject: &str, _html_body: &str) -> Result<(), NotifyError> {
        log::info!(target: "notify", "{subject} (to {})", recipients.join(", "));
        Ok(())
    }
}

/// Hands notifications to `sendmail -t` as HTML mail.
#[derive(Debug, Clone)]
pub struct SendmailNotifier {
    command: PathBuf,
    from: String,
}

impl SendmailNotifier {
    pub fn new(command: impl Into<PathBuf>, from: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            from: from.into(),
        }
    }
}

impl Notifier for SendmailNotifier {
    fn send(&self, recipients: &[String], subject: &str, html_body: &str) -> Result<(), NotifyError> {
        let mut child = Command::new(&self.command)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            write!(
                stdin,
                "From: {}\r\nTo: {}\r\nSubject: {subject}\r\nMIME-Version: 1.0\r\nContent-Type: text/html; charset=utf-8\r\n\r\n{html_body}\r\n",
                self.from,
                recipients.join(", "),
            )?;
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(NotifyError::Sendmail(status.to_string()));
        }
        log::debug!(target: "notify", "Mailed '{subject}' to {} recipients", recipients.len());
        Ok(())
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Subject and HTML body describing `result`.
pub fn render(config: &BackupConfig, result: &BackupResult) -> (String, String) {
    let name = escape(&config.name);
    let mut body = String::new();

    let subject = match result.status {
        BackupStatus::Success => format!("Backup '{}' succeeded", config.name),
        BackupStatus::Partial => format!("Backup '{}' partially failed", config.name),
        BackupStatus::Failed => format!("Backup '{}' failed", config.name),
    };

    body.push_str(&format!("<h2>{}</h2>\n<ul>\n", escape(&subject)));
    body.push_str(&format!("<li>Configuration: {name}</li>\n"));
    body.push_str(&format!("<li>Type: {}</li>\n", result.backup_type));
    body.push_str(&format!("<li>Started: {}</li>\n", result.timestamp.to_rfc3339()));
    body.push_str(&format!("<li>Duration: {:.1}s</li>\n", result.duration_secs));
    body.push_str(&format!("<li>Size: {} bytes</li>\n", result.size));
    if let Some(checksum) = &result.checksum {
        body.push_str(&format!("<li>SHA-256: {checksum}</li>\n"));
    }
    if let Some(error) = &result.error {
        body.push_str(&format!("<li>Error: {}</li>\n", escape(error)));
    }
    body.push_str("</ul>\n");

    if !result.locations.is_empty() {
        let heading = match result.status {
            BackupStatus::Partial => "Destinations that succeeded",
            _ => "Stored at",
        };
        body.push_str(&format!("<p>{heading}:</p>\n<ul>\n"));
        for location in &result.locations {
            body.push_str(&format!(
                "<li>{}: {}</li>\n",
                location.kind,
                escape(&location.handle)
            ));
        }
        body.push_str("</ul>\n");
    }

    (subject, body)
}

/// Sends the success or failure notification of `result`, logging errors.
pub fn notify(notifier: &dyn Notifier, config: &BackupConfig, result: &BackupResult) {
    let recipients = match result.status {
        BackupStatus::Success => &config.notifications.on_success,
        BackupStatus::Partial | BackupStatus::Failed => &config.notifications.on_failure,
    };
    if recipients.is_empty() {
        return;
    }

    let (subject, body) = render(config, result);
    if let Err(e) = notifier.send(recipients, &subject, &body) {
        log::warn!(target: "notify", "Notification for backup '{}' failed: {e}", config.name);
    }
}
