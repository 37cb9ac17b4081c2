//! Cross-step environment store.
//!
//! Steps publish variables for later steps by appending `KEY=VALUE` lines
//! (or `KEY<<DELIM` heredoc blocks) to the file named by `$KILN_ENV`. The
//! step driver reads that file back after each step and appends the parsed
//! entries here. Entries are never rewritten; the latest entry for a key
//! wins on read.

use crate::{Error, Result};
use std::collections::BTreeMap;

/// Append-only key/value store scoped to one job.
#[derive(Debug, Clone, Default)]
pub struct EnvStore {
    entries: Vec<EnvEntry>,
}

/// One recorded assignment and the step that made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvEntry {
    pub key: String,
    pub value: String,
    pub step: String,
}

impl EnvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, step: &str, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push(EnvEntry {
            key: key.into(),
            value: value.into(),
            step: step.to_string(),
        });
    }

    /// Parse an env file written by `step` and append its assignments.
    /// Returns the number of entries appended.
    pub fn append_file(&mut self, step: &str, content: &str) -> Result<usize> {
        let parsed = parse_env_file(content)?;
        let count = parsed.len();
        for (key, value) in parsed {
            self.append(step, key, value);
        }
        Ok(count)
    }

    /// Latest value recorded for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }

    /// Current view: every key mapped to its latest value.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect()
    }

    pub fn entries(&self) -> &[EnvEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse the `$KILN_ENV` / `$KILN_OUTPUT` file format.
///
/// ```text
/// NAME=value
/// NOTES<<EOF
/// line one
/// line two
/// EOF
/// ```
pub fn parse_env_file(content: &str) -> Result<Vec<(String, String)>> {
    let mut parsed = Vec::new();
    let mut lines = content.lines();

    while let Some(line) = lines.next() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }

        let heredoc = line.find("<<");
        let assign = line.find('=');
        match (heredoc, assign) {
            (Some(h), a) if a.is_none_or(|a| h < a) => {
                let key = line[..h].trim();
                let delimiter = line[h + 2..].trim();
                validate_key(key)?;
                if delimiter.is_empty() {
                    return Err(Error::Serialization(format!(
                        "heredoc for {} has no delimiter",
                        key
                    )));
                }
                let mut body: Vec<&str> = Vec::new();
                let mut terminated = false;
                for next in lines.by_ref() {
                    let next = next.trim_end_matches('\r');
                    if next == delimiter {
                        terminated = true;
                        break;
                    }
                    body.push(next);
                }
                if !terminated {
                    return Err(Error::Serialization(format!(
                        "unterminated heredoc for {} (expected {})",
                        key, delimiter
                    )));
                }
                parsed.push((key.to_string(), body.join("\n")));
            }
            (_, Some(eq_pos)) => {
                let key = line[..eq_pos].trim();
                validate_key(key)?;
                parsed.push((key.to_string(), line[eq_pos + 1..].to_string()));
            }
            _ => {
                return Err(Error::Serialization(format!(
                    "malformed env line: {:?}",
                    line
                )));
            }
        }
    }

    Ok(parsed)
}

/// Whether `key` can be exported as a shell variable.
pub fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn validate_key(key: &str) -> Result<()> {
    if is_valid_env_key(key) {
        Ok(())
    } else {
        Err(Error::Serialization(format!(
            "invalid environment variable name: {:?}",
            key
        )))
    }
}
