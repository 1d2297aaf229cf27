//! Task runner
//!
//! Drives one task execution end to end: packs the task's dependent
//! variables into the single packed argument, renders the prelude that
//! rebuilds the variable environment in the child shell, runs the body
//! through the capture template, validates the captured variables against
//! the task's declared dependencies, and reduces the capture to a delta
//! relative to the snapshot the task was given. The runner never touches
//! the shared state; merging the delta is the scheduler's job.

use std::path::Path;

use chrono::Local;

use crate::error::{WedError, WedResult};
use crate::parser::Task;
use crate::shell;
use crate::state::Valuation;

/// Escape a packed-argument component: commas separate components, so
/// embedded ones become `\,` (undone by the child shell's `read`).
fn escape_commas(component: &str) -> String {
    component.replace(',', "\\,")
}

/// Pack `(identifier, value, permission)` triples for every dependent
/// variable into one comma-joined argument. Missing bindings read as
/// `("", rw)`.
fn pack_arguments(task: &Task, snapshot: &Valuation) -> String {
    let mut components = Vec::new();
    for variable in task.on_variables() {
        let identifier = variable.identifier();
        components.push(escape_commas(identifier));
        components.push(escape_commas(snapshot.value(identifier)));
        components.push(snapshot.permission(identifier).as_str().to_string());
    }
    components.join(",")
}

/// Render the capture setup for a task body: a `main` function that
/// unpacks the packed argument back into shell variables and then runs
/// the body. Bindings are reconstructed as plain assignments regardless
/// of permission; read-only enforcement happens when the delta is merged,
/// so that a violation surfaces as such instead of as a dead shell.
fn render_prelude(body: &str) -> String {
    let escaped_body = body.replace(r"\$", r"\\$").replace('$', r"\$");
    format!(
        r#"function main {{
        local _ifs_backup=\$IFS
        IFS=,
        local _params
        read -a _params <<< "$1"
        local _i=0
        while [ \$_i -lt \${{#_params[@]}} ]; do
            eval "\${{_params[\$_i]}}=\"\${{_params[\$_i+1]}}\""
            let _i=_i+3
        done
        IFS=\$_ifs_backup
        unset _ifs_backup
        unset _params
        unset _i
{body}
    }}"#,
        body = escaped_body
    )
}

/// Where the body's stdout and stderr go: timestamped files under the
/// instance log directory, or `/dev/null`.
fn output_paths(task: &Task, log_dir: Option<&Path>) -> (String, String) {
    match log_dir {
        Some(dir) => {
            let timestamp = Local::now().format("%Y%m%d%H%M%S");
            let stdout = dir.join(format!("{}_{}.out", task.name(), timestamp));
            let stderr = dir.join(format!("{}_{}.err", task.name(), timestamp));
            (
                stdout.display().to_string(),
                stderr.display().to_string(),
            )
        }
        None => ("/dev/null".to_string(), "/dev/null".to_string()),
    }
}

/// Execute a task against a snapshot of its dependent variables and
/// return the resulting state delta.
pub fn execute_task(
    task: &Task,
    snapshot: &Valuation,
    log_dir: Option<&Path>,
) -> WedResult<Valuation> {
    let packed = pack_arguments(task, snapshot);
    let (stdout_path, stderr_path) = output_paths(task, log_dir);
    let setup = render_prelude(task.script());
    let main = format!("main 1> {stdout_path} 2> {stderr_path}");
    let captured = shell::run_capture(&setup, &main, &[packed]).map_err(|error| {
        tracing::error!(task = task.name(), %error, "task shell execution failed");
        WedError::TaskExecution {
            task: task.name().to_string(),
        }
    })?;
    for (identifier, _) in captured.iter() {
        let declared = task
            .on_variables()
            .binary_search_by(|variable| variable.identifier().cmp(identifier))
            .is_ok();
        if !declared {
            return Err(WedError::UndeclaredDependency {
                variable: identifier.to_string(),
                task: task.name().to_string(),
            });
        }
    }
    Ok(captured.delta_from(snapshot))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::parser::Guard;
    use crate::state::{Binding, Permission};

    fn task(name: &str, clauses: &[&str], body: &str) -> Task {
        Task::new(name, Guard::parse(clauses.iter().copied()).unwrap(), body).unwrap()
    }

    fn snapshot(bindings: &[(&str, &str, Permission)]) -> Valuation {
        let mut valuation = Valuation::new();
        for (identifier, value, permission) in bindings {
            valuation.insert(*identifier, Binding::new(*value, *permission));
        }
        valuation
    }

    #[test]
    fn declared_assignment_becomes_a_delta() {
        let advance = task("advance", &["$S = \"init\""], "S=\"done\"");
        let delta = execute_task(
            &advance,
            &snapshot(&[("S", "init", Permission::ReadWrite)]),
            None,
        )
        .unwrap();
        assert_eq!(delta.value("S"), "done");
        assert_eq!(delta.len(), 1);
    }

    #[test]
    fn untouched_arguments_produce_no_delta() {
        let idle = task("idle", &["$S != \"\""], "true");
        let delta = execute_task(
            &idle,
            &snapshot(&[("S", "init", Permission::ReadWrite)]),
            None,
        )
        .unwrap();
        assert!(delta.is_empty());
    }

    #[test]
    fn values_with_commas_and_spaces_round_trip() {
        let derive = task("derive", &["$A != ''", "$B = ''"], "B=\"${A}X\"");
        let delta = execute_task(
            &derive,
            &snapshot(&[("A", "va,l ue", Permission::ReadWrite)]),
            None,
        )
        .unwrap();
        assert_eq!(delta.value("B"), "va,l ueX");
        assert!(delta.get("A").is_none());
    }

    #[test]
    fn readonly_escalation_is_kept_in_the_delta() {
        let seal = task("seal", &["$S = \"init\""], "readonly S=\"mid\"");
        let delta = execute_task(
            &seal,
            &snapshot(&[("S", "init", Permission::ReadWrite)]),
            None,
        )
        .unwrap();
        assert_eq!(delta.value("S"), "mid");
        assert!(delta.is_readonly("S"));
    }

    #[test]
    fn readonly_arguments_are_not_enforced_in_the_shell() {
        // The overwrite succeeds in the child; rejecting it is the merge's
        // responsibility.
        let clobber = task("clobber", &["$S = \"mid\""], "S=\"done\"");
        let delta = execute_task(
            &clobber,
            &snapshot(&[("S", "mid", Permission::ReadOnly)]),
            None,
        )
        .unwrap();
        assert_eq!(delta.value("S"), "done");
        assert!(!delta.is_readonly("S"));
    }

    #[test]
    fn undeclared_mutation_is_rejected() {
        let rogue = task("rogue", &["$A = ''"], "B=\"oops\"");
        let error = execute_task(&rogue, &snapshot(&[]), None).unwrap_err();
        match error {
            WedError::UndeclaredDependency { variable, task } => {
                assert_eq!(variable, "B");
                assert_eq!(task, "rogue");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn failing_body_is_a_task_execution_error() {
        let broken = task("broken", &["$A = ''"], "exit 3");
        let error = execute_task(&broken, &snapshot(&[]), None).unwrap_err();
        assert!(matches!(error, WedError::TaskExecution { .. }));
    }
}
