//! Bash executor adapter and the environment-capture protocol
//!
//! The only impure leaf the engine depends on. A [`BashScript`] stages a
//! script into a fresh executable temp file and runs it; the capture
//! template wraps arbitrary Bash commands so that every global variable
//! they assign is reported on stdout as a triple of lines:
//!
//! ```text
//! <identifier>
//! <value, possibly empty>
//! <rw | ro>
//! ```
//!
//! The wrapped commands run in a sanitised child shell (`env -i`,
//! `--noprofile --norc`, `set -u`, `set -e`). The permission of each
//! reported variable is probed with a subshell `unset` test, so `readonly`
//! declarations surface as `ro`.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::process::{Command, ExitStatus};

use tempfile::{NamedTempFile, TempPath};
use thiserror::Error;

use crate::parser::{is_valid_value, Variable};
use crate::state::{Binding, Permission, Valuation};

/// Failures of the shell adapter
#[derive(Debug, Error)]
pub enum ShellError {
    /// Staging or spawning the script failed
    #[error("failed to run script: {0}")]
    Io(#[from] std::io::Error),

    /// The script ran but exited non-zero
    #[error("script failed with {status}: {stderr}")]
    NonZeroExit {
        /// Exit status of the child
        status: ExitStatus,
        /// Captured standard error of the child
        stderr: String,
    },

    /// The captured stdout does not follow the triple protocol
    #[error("malformed capture output: {0}")]
    Protocol(String),
}

/// A Bash script staged into an executable temporary file
pub struct BashScript {
    // The handle is closed after writing; executing a file that is still
    // open for writing fails with ETXTBSY on Linux. The path guard keeps
    // the file on disk for as long as the value lives.
    path: TempPath,
}

impl BashScript {
    /// Write the source into a fresh temp file with execute permission
    pub fn stage(source: &str) -> Result<Self, ShellError> {
        let mut file = NamedTempFile::new()?;
        file.write_all(source.as_bytes())?;
        file.flush()?;
        let mut permissions = file.as_file().metadata()?.permissions();
        permissions.set_mode(0o700);
        file.as_file().set_permissions(permissions)?;
        Ok(Self {
            path: file.into_temp_path(),
        })
    }

    /// Execute the script with the given arguments and return its raw
    /// stdout. Non-zero exit is an error carrying the child's stderr.
    pub fn execute(&self, args: &[String]) -> Result<Vec<u8>, ShellError> {
        let output = Command::new(self.path.as_os_str()).args(args).output()?;
        if !output.status.success() {
            return Err(ShellError::NonZeroExit {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr)
                    .trim_end()
                    .to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// Escape a fragment for inclusion in the template's double-quoted
/// `bash -c` string.
fn escape_double_quoted(fragment: &str) -> String {
    fragment.replace(r#"\""#, r#"\\""#).replace('"', r#"\""#)
}

/// Render the capture script around `setup` and `main` commands.
///
/// `setup` runs before the first environment snapshot, so its assignments
/// are not captured; everything `main` assigns afterwards is diffed with
/// `comm -13` and reported. Shell-internal variables that change on every
/// run are filtered out. `xargs` strips the quoting that `set` adds around
/// values, and the `${attr//=/<newline>}` expansion (the replacement is a
/// real newline) splits each `NAME=value` line at its first `=` under an
/// IFS of newline + backspace.
pub fn render_capture_script(setup: &str, main: &str) -> String {
    format!(
        r#"#!/bin/bash
env -i bash --noprofile --norc -c "
    set -u
    set -e
    {setup}
    ENV0=\$(mktemp)
    ENVF=\$(mktemp)
    (set -o posix; BASH_EXECUTION_STRING=; IFS=; :; set > \$ENV0)
    {main}
    (set -o posix; BASH_EXECUTION_STRING=; IFS=; :; set > \$ENVF)
    IFS=\$(echo -en '{ifs}')
    attrs=\$(comm -13 \$ENV0 \$ENVF |
        grep -v '^PIPESTATUS=' |
        grep -v '^_=' |
        grep -v '^BASH_LINENO=' |
        grep -v '^FUNCNAME=' |
        grep -v '^SHELLOPTS=' |
        xargs -I{{lin}} echo \"{{lin}}\")
    for attr in \$attrs; do
        attr_assign=(\${{attr//=/{split}}})
        echo \${{attr_assign[0]}}
        if [ \${{#attr_assign[@]}} = 2 ]; then
            echo \${{attr_assign[1]}}
        else
            echo
        fi
        (unset \${{attr_assign[0]}} 2> /dev/null) && echo rw
        (unset \${{attr_assign[0]}} 2> /dev/null) || echo ro
    done
"
"#,
        setup = escape_double_quoted(setup),
        main = escape_double_quoted(main),
        ifs = "\n\u{8}",
        split = "\n",
    )
}

/// Parse capture-protocol stdout into a valuation
pub fn parse_capture_output(stdout: &[u8]) -> Result<Valuation, ShellError> {
    let text = std::str::from_utf8(stdout)
        .map_err(|_| ShellError::Protocol("capture output is not valid UTF-8".to_string()))?;
    let trimmed = text.trim();
    let mut valuation = Valuation::new();
    if trimmed.is_empty() {
        return Ok(valuation);
    }
    let lines: Vec<&str> = trimmed.split('\n').collect();
    if lines.len() % 3 != 0 {
        return Err(ShellError::Protocol(format!(
            "expected identifier/value/permission triples, got {} lines",
            lines.len()
        )));
    }
    for triple in lines.chunks(3) {
        let identifier = triple[0];
        if !Variable::is_valid_identifier(identifier) {
            return Err(ShellError::Protocol(format!(
                "invalid variable identifier {identifier:?}"
            )));
        }
        let value = triple[1];
        if !is_valid_value(value) {
            return Err(ShellError::Protocol(format!(
                "invalid value for variable {identifier}"
            )));
        }
        let permission = Permission::parse(triple[2]).ok_or_else(|| {
            ShellError::Protocol(format!(
                "invalid permission {:?} for variable {identifier}",
                triple[2]
            ))
        })?;
        valuation.insert(identifier, Binding::new(value, permission));
    }
    Ok(valuation)
}

/// Stage, execute, and parse a capture run in one step
pub fn run_capture(setup: &str, main: &str, args: &[String]) -> Result<Valuation, ShellError> {
    let script = BashScript::stage(&render_capture_script(setup, main))?;
    let stdout = script.execute(args)?;
    parse_capture_output(&stdout)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_triples() {
        let valuation = parse_capture_output(b"A\nvalue\nrw\nB_X\n\nro\n").unwrap();
        assert_eq!(valuation.value("A"), "value");
        assert_eq!(valuation.permission("A"), Permission::ReadWrite);
        assert_eq!(valuation.value("B_X"), "");
        assert!(valuation.is_readonly("B_X"));
    }

    #[test]
    fn empty_output_is_an_empty_valuation() {
        assert!(parse_capture_output(b"").unwrap().is_empty());
        assert!(parse_capture_output(b"\n").unwrap().is_empty());
    }

    #[test]
    fn rejects_malformed_output() {
        assert!(matches!(
            parse_capture_output(b"A\nvalue\n"),
            Err(ShellError::Protocol(_))
        ));
        assert!(matches!(
            parse_capture_output(b"9bad\nvalue\nrw\n"),
            Err(ShellError::Protocol(_))
        ));
        assert!(matches!(
            parse_capture_output(b"A\nvalue\nrx\n"),
            Err(ShellError::Protocol(_))
        ));
    }

    #[test]
    fn captures_assignments_and_permissions() {
        let valuation = run_capture(
            "",
            "X=\"a b\"\nreadonly Y=\"z\"\nEMPTY=\"\"",
            &[],
        )
        .unwrap();
        assert_eq!(valuation.value("X"), "a b");
        assert_eq!(valuation.permission("X"), Permission::ReadWrite);
        assert_eq!(valuation.value("Y"), "z");
        assert!(valuation.is_readonly("Y"));
        assert_eq!(valuation.value("EMPTY"), "");
        assert_eq!(valuation.len(), 3);
    }

    #[test]
    fn unset_variables_drop_out_of_the_capture() {
        let valuation = run_capture("", "X=\"1\"\nunset X\nY=\"2\"", &[]).unwrap();
        assert!(valuation.get("X").is_none());
        assert_eq!(valuation.value("Y"), "2");
    }

    #[test]
    fn setup_assignments_are_not_captured() {
        let valuation = run_capture("HIDDEN=\"1\"", "SEEN=\"2\"", &[]).unwrap();
        assert!(valuation.get("HIDDEN").is_none());
        assert_eq!(valuation.value("SEEN"), "2");
    }

    #[test]
    fn failing_main_reports_nonzero_exit() {
        let error = run_capture("", "false", &[]).unwrap_err();
        assert!(matches!(error, ShellError::NonZeroExit { .. }));
    }
}
