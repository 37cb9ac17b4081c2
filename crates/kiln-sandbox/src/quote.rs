//! Shell script assembly for the command channel.

use kiln_core::env::is_valid_env_key;
use kiln_core::{Error, Result};
use std::collections::BTreeMap;

/// Single-quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// One script: exports, then a mandatory `cd`, then the command itself.
pub fn build_script(
    env: &BTreeMap<String, String>,
    workdir: Option<&str>,
    command: &str,
) -> Result<String> {
    let mut script = String::new();
    for (key, value) in env {
        if !is_valid_env_key(key) {
            return Err(Error::InvalidJob(format!(
                "invalid environment variable name {:?}",
                key
            )));
        }
        script.push_str(&format!("export {}={}\n", key, shell_quote(value)));
    }
    if let Some(dir) = workdir {
        script.push_str(&format!("cd {} || exit 1\n", shell_quote(dir)));
    }
    script.push_str(command);
    Ok(script)
}
