//! External command invocation per delivered file
//!
//! The template is expanded with file metadata tokens and run through the
//! platform shell. Synchronous invocations observe the exit status;
//! asynchronous ones are spawned and reaped in the background.

use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::InvokeConfig;
use crate::event::FileEvent;

/// Result of one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// Ran to completion with a zero exit status
    Completed,
    /// Started without waiting
    Spawned,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct InvocationExecutor {
    template: String,
    asynchronous: bool,
    date_format: String,
}

impl InvocationExecutor {
    pub fn new(config: &InvokeConfig, date_format: &str) -> Self {
        Self {
            template: config.command.clone(),
            asynchronous: config.asynchronous,
            date_format: date_format.to_string(),
        }
    }

    /// Expand `$tokens` in the template in one pass. Each value is quoted
    /// as a single shell word; unknown tokens are left as written.
    pub fn render(&self, event: &FileEvent) -> String {
        let format_time = |t: Option<chrono::DateTime<chrono::Utc>>| {
            t.map(|t| t.format(&self.date_format).to_string()).unwrap_or_default()
        };
        let path = event
            .local_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        let tokens: [(&str, String); 9] = [
            ("$filename", event.name.clone().unwrap_or_default()),
            ("$filepath", path),
            ("$filetype", event.file_type.clone()),
            ("$servergroup", event.server_group.clone()),
            ("$filesize", event.size.to_string()),
            ("$modtime", format_time(event.modified)),
            ("$createtime", format_time(event.created)),
            ("$checksum", event.checksum.clone().unwrap_or_default()),
            ("$receipt", event.receipt_id.clone().unwrap_or_default()),
        ];

        let mut rendered = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();
        while let Some(at) = rest.find('$') {
            rendered.push_str(&rest[..at]);
            rest = &rest[at..];
            match tokens.iter().find(|(token, _)| rest.starts_with(token)) {
                Some((token, value)) => {
                    rendered.push_str(&quote(value));
                    rest = &rest[token.len()..];
                }
                None => {
                    rendered.push('$');
                    rest = &rest[1..];
                }
            }
        }
        rendered.push_str(rest);
        rendered
    }

    pub async fn run(&self, event: &FileEvent) -> InvocationOutcome {
        let command_line = self.render(event);
        debug!(command = %command_line, file = %event.display_name(), "Invoking");

        let mut command = shell(&command_line);

        if self.asynchronous {
            return match command.spawn() {
                Ok(mut child) => {
                    let file = event.display_name().to_string();
                    tokio::spawn(async move {
                        match child.wait().await {
                            Ok(status) if status.success() => debug!(file = %file, "Async invocation finished"),
                            Ok(status) => warn!(file = %file, %status, "Async invocation failed"),
                            Err(e) => warn!(file = %file, error = %e, "Async invocation lost"),
                        }
                    });
                    InvocationOutcome::Spawned
                }
                Err(e) => {
                    error!(command = %command_line, error = %e, "Failed to spawn invocation");
                    InvocationOutcome::Failed(format!("spawn failed: {}", e))
                }
            };
        }

        match command.status().await {
            Ok(status) if status.success() => {
                info!(file = %event.display_name(), "Invocation completed");
                InvocationOutcome::Completed
            }
            Ok(status) => {
                error!(command = %command_line, %status, "Invocation failed");
                InvocationOutcome::Failed(format!("exit status {}", status))
            }
            Err(e) => {
                error!(command = %command_line, error = %e, "Failed to run invocation");
                InvocationOutcome::Failed(e.to_string())
            }
        }
    }
}

#[cfg(unix)]
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(windows)]
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

#[cfg(unix)]
fn shell(command_line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(command_line);
    command
}

#[cfg(windows)]
fn shell(command_line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(command_line);
    command
}
