//! Reading `$KILN_ENV` and `$KILN_OUTPUT` back after a step.
//!
//! Both files live on the sandbox's temp volume. One extra command prints
//! them separated by a marker and removes them, so the next step starts
//! with empty files.

use kiln_core::Result;
use kiln_core::env::parse_env_file;
use kiln_sandbox::TEMP_DIR;

pub const ENV_FILE_VAR: &str = "KILN_ENV";
pub const OUTPUT_FILE_VAR: &str = "KILN_OUTPUT";

const MARKER: &str = "::kiln-output::";

pub fn env_file() -> String {
    format!("{}/kiln_env", TEMP_DIR)
}

pub fn output_file() -> String {
    format!("{}/kiln_output", TEMP_DIR)
}

/// Script printing the env file, the marker, then the output file.
pub fn script() -> String {
    format!(
        "touch \"${env}\" \"${out}\"\n\
         cat \"${env}\"\n\
         echo '{marker}'\n\
         cat \"${out}\"\n\
         rm -f \"${env}\" \"${out}\"",
        env = ENV_FILE_VAR,
        out = OUTPUT_FILE_VAR,
        marker = MARKER,
    )
}

/// Script removing both files without reading them.
pub fn discard_script() -> String {
    format!(
        "rm -f \"${env}\" \"${out}\"",
        env = ENV_FILE_VAR,
        out = OUTPUT_FILE_VAR,
    )
}

/// Files written by one step.
#[derive(Debug, Default, PartialEq)]
pub struct StepFiles {
    pub env: String,
    pub outputs: Vec<(String, String)>,
}

/// Split the read-back output. A file without a trailing newline leaves
/// the marker mid-line, so the split is on the marker text itself.
pub fn split(stdout: &str) -> Result<StepFiles> {
    let (env, outputs) = stdout.split_once(MARKER).unwrap_or((stdout, ""));
    Ok(StepFiles {
        env: env.to_string(),
        outputs: parse_env_file(outputs)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_env_and_outputs() {
        let files = split("A=1\nB=2\n::kiln-output::\nversion=1.2.3\n").unwrap();
        assert_eq!(files.env, "A=1\nB=2\n");
        assert_eq!(
            files.outputs,
            vec![("version".to_string(), "1.2.3".to_string())]
        );
    }

    #[test]
    fn test_split_without_trailing_newline() {
        let files = split("A=1::kiln-output::\n").unwrap();
        assert_eq!(files.env, "A=1");
        assert!(files.outputs.is_empty());
    }

    #[test]
    fn test_discard_script_removes_both_files() {
        assert_eq!(discard_script(), "rm -f \"$KILN_ENV\" \"$KILN_OUTPUT\"");
    }

    #[test]
    fn test_malformed_output_file() {
        assert!(split("::kiln-output::\nnot an assignment\n").is_err());
    }

    #[test]
    fn test_script_reads_both_files() {
        let script = script();
        assert!(script.contains("cat \"$KILN_ENV\""));
        assert!(script.ends_with("rm -f \"$KILN_ENV\" \"$KILN_OUTPUT\""));
    }
}
