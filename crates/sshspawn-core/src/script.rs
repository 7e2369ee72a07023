//! Launch script construction.
//!
//! The script runs under `bash -s` on the remote side. Its only stdout is the
//! pid of the backgrounded process, which is how the caller learns it.
//!
//! ```text
//! #!/bin/bash
//! export NAME='value'          # one per environment entry, single-quoted
//! unset XDG_RUNTIME_DIR
//! touch '<log>'
//! chmod 600 '<log>'
//! { <pre-launch line> ; } >> '<log>' 2>&1
//! <command> < /dev/null >> '<log>' 2>&1 &
//! echo $!
//! ```

use std::collections::BTreeMap;

use crate::constants::RUNTIME_DIR_ENV;
use crate::error::{SpawnError, SpawnResult};
use crate::ssh::CommandOutput;

/// Quote a string for POSIX shells.
///
/// Strings made only of unambiguous characters are returned bare; everything
/// else is single-quoted with embedded quotes spliced as `'\''`.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '%' | ':' | '=' | ',' | '+' | '@')
    }) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Valid shell variable name: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Inputs for one launch script.
#[derive(Debug, Clone, Default)]
pub struct LaunchScript {
    /// Exported before anything else runs. Sorted for stable output.
    pub environment: BTreeMap<String, String>,
    /// Full command line, already quoted where needed.
    pub command: String,
    /// Log file, relative to the remote home directory.
    pub log_path: String,
    /// Trusted shell lines run before the launch, output sent to the log.
    pub pre_launch: Vec<String>,
}

impl LaunchScript {
    pub fn new(command: impl Into<String>, log_path: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            log_path: log_path.into(),
            ..Default::default()
        }
    }

    pub fn with_environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_pre_launch(mut self, lines: Vec<String>) -> Self {
        self.pre_launch = lines;
        self
    }

    /// Render the script text.
    ///
    /// Fails if an environment key is not a valid shell name; values are
    /// always quoted and cannot break out of the assignment.
    pub fn render(&self) -> SpawnResult<String> {
        let log = shell_quote(&self.log_path);
        let mut lines = vec!["#!/bin/bash".to_string()];

        for (key, value) in &self.environment {
            if !is_valid_env_name(key) {
                return Err(SpawnError::InvalidEnvironment(key.clone()));
            }
            lines.push(format!("export {}={}", key, shell_quote_always(value)));
        }

        lines.push(format!("unset {}", RUNTIME_DIR_ENV));
        lines.push(format!("touch {}", log));
        lines.push(format!("chmod 600 {}", log));
        for setup in &self.pre_launch {
            lines.push(format!("{{ {} ; }} >> {} 2>&1", setup, log));
        }
        lines.push(format!("{} < /dev/null >> {} 2>&1 &", self.command, log));
        lines.push("echo $!".to_string());

        let mut script = lines.join("\n");
        script.push('\n');
        Ok(script)
    }
}

/// Single-quote unconditionally. Used for values so empty and numeric
/// strings look the same as everything else in the rendered script.
fn shell_quote_always(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Parse the pid the launch script echoed.
///
/// Exactly one line holding a positive integer. Empty output is a
/// [`SpawnError::CommandFailure`]; anything else malformed is a
/// [`SpawnError::Protocol`].
pub fn parse_pid(output: &CommandOutput) -> SpawnResult<u32> {
    let trimmed = output.stdout.trim();
    if trimmed.is_empty() {
        return Err(SpawnError::CommandFailure {
            exit_status: output.exit_status,
            stderr: output.stderr.trim().to_string(),
        });
    }
    if trimmed.lines().count() != 1 {
        return Err(SpawnError::Protocol(format!(
            "expected a single pid line, got {:?}",
            trimmed
        )));
    }
    match trimmed.parse::<u32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(SpawnError::Protocol(format!("not a pid: {:?}", trimmed))),
    }
}
