//! Experiment instance and the concurrent scheduler
//!
//! An [`ExperimentInstance`] binds a parsed [`WedMakefile`] to the state
//! captured from a configuration script and drives it with a pool of
//! worker threads. Each worker repeatedly performs one step: terminate if
//! the final guard holds, a fatal error was recorded, or the instance is
//! stuck; otherwise fire one uniformly-chosen ready task and back off.
//!
//! Lock choreography: the coordination mutex serialises every
//! lock-acquisition phase; per-variable locks are only ever try-locked,
//! in lexicographic order, and a failed sweep releases everything it
//! acquired. Holding every variable lock proves no worker is mid-task,
//! which is what the terminal predicates rely on.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::Local;
use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::error::{WedError, WedResult};
use crate::parser::{Task, WedMakefile};
use crate::runner;
use crate::shell;
use crate::state::{StateStore, Valuation};

/// Back-off between scheduler steps
const STEP_BACKOFF: Duration = Duration::from_millis(100);

/// Instantiation options
#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceOptions {
    /// Create a timestamped log directory and per-execution stdout/stderr
    /// files for task bodies
    pub log: bool,
}

/// A running experiment instance
#[derive(Debug)]
pub struct ExperimentInstance {
    makefile: WedMakefile,
    store: StateStore,
    errors: Mutex<Vec<WedError>>,
    log_dir: Option<PathBuf>,
}

fn identifiers_of(task: &Task) -> Vec<&str> {
    task.on_variables()
        .iter()
        .map(|variable| variable.identifier())
        .collect()
}

impl ExperimentInstance {
    /// Instantiate an experiment: run the configuration script through
    /// the capture template, check the initial guard, and build the
    /// shared store with one lock per experiment variable.
    pub fn new(
        makefile: WedMakefile,
        config_path: &Path,
        options: InstanceOptions,
    ) -> WedResult<Self> {
        let config = fs::read_to_string(config_path)?;
        let initial = shell::run_capture("", config.trim(), &[])
            .map_err(|error| WedError::Config(format!("initial state capture failed: {error}")))?;
        for dependency in makefile.initial_guard().dependencies() {
            if !dependency.is_satisfied_by(&initial) {
                return Err(WedError::UnsatisfiedInitialGuard {
                    clause: dependency.clause(),
                });
            }
        }
        let log_dir = if options.log {
            let dir = PathBuf::from(format!(
                "log-{}",
                Local::now().format("%Y-%m-%d-%H-%M-%S")
            ));
            fs::create_dir(&dir)?;
            Some(dir)
        } else {
            None
        };
        let store = StateStore::new(
            initial,
            makefile
                .variables()
                .iter()
                .map(|variable| variable.identifier().to_string()),
        );
        Ok(Self {
            makefile,
            store,
            errors: Mutex::new(Vec::new()),
            log_dir,
        })
    }

    /// The specification this instance executes
    pub fn makefile(&self) -> &WedMakefile {
        &self.makefile
    }

    /// Consistent copy of the current state
    pub fn snapshot(&self) -> Valuation {
        self.store.snapshot()
    }

    /// True if a final state has been reached: every variable lock could
    /// be taken (no worker is mid-task) and the final guard holds.
    pub fn is_final(&self) -> bool {
        let _coordination = self.store.coordinate();
        let Some(_locks) = self.store.try_lock_all() else {
            return false;
        };
        let state = self.store.read();
        self.makefile.final_guard().is_satisfied_by(&state)
    }

    /// True if the instance is stuck: no worker is mid-task, the final
    /// guard does not hold, and no task's guard holds either.
    pub fn is_inconsistent(&self) -> bool {
        let _coordination = self.store.coordinate();
        let Some(_locks) = self.store.try_lock_all() else {
            return false;
        };
        let state = self.store.read();
        if self.makefile.final_guard().is_satisfied_by(&state) {
            return false;
        }
        !self
            .makefile
            .tasks()
            .iter()
            .any(|task| task.guard().is_satisfied_by(&state))
    }

    /// Advisory readiness probe: the task's variable locks could be taken
    /// and its guard held at that moment. May go stale before `execute`.
    fn is_ready(&self, task: &Task) -> bool {
        let _coordination = self.store.coordinate();
        let identifiers = identifiers_of(task);
        let Some(_locks) = self.store.try_lock(&identifiers) else {
            return false;
        };
        let state = self.store.read();
        task.guard().is_satisfied_by(&state)
    }

    /// Every task that is currently ready
    pub fn ready_tasks(&self) -> Vec<&Task> {
        self.makefile
            .tasks()
            .iter()
            .filter(|task| self.is_ready(task))
            .collect()
    }

    fn record_error(&self, error: WedError) {
        tracing::error!(%error, "fatal instance error");
        self.errors.lock().push(error);
    }

    /// True once any worker has recorded a fatal error
    pub fn fatal_error_seen(&self) -> bool {
        !self.errors.lock().is_empty()
    }

    /// Execute one task under its variable locks. Returns false if the
    /// locks could not be taken, readiness went stale, or the execution
    /// recorded a fatal error.
    fn execute(&self, task: &Task) -> bool {
        let identifiers = identifiers_of(task);
        let _locks = {
            let _coordination = self.store.coordinate();
            match self.store.try_lock(&identifiers) {
                Some(locks) => locks,
                None => return false,
            }
        };
        let snapshot = self.store.snapshot_of(&identifiers);
        if !task.guard().is_satisfied_by(&snapshot) {
            // readiness went stale between discovery and acquisition
            return false;
        }
        tracing::info!(task = task.name(), "triggered task execution");
        let delta = match runner::execute_task(task, &snapshot, self.log_dir.as_deref()) {
            Ok(delta) => delta,
            Err(error) => {
                self.record_error(error);
                return false;
            }
        };
        {
            // Probes only ever try-lock the variable locks held here, so
            // blocking on the coordination mutex cannot form a cycle.
            let _coordination = self.store.coordinate();
            if let Err(violation) = self.store.merge(&delta) {
                self.record_error(WedError::PermissionViolation {
                    variable: violation.variable,
                    task: task.name().to_string(),
                });
                return false;
            }
        }
        for (identifier, binding) in delta.iter() {
            tracing::debug!(
                task = task.name(),
                variable = identifier,
                value = %binding.value,
                permission = %binding.permission,
                "variable updated"
            );
        }
        tracing::info!(task = task.name(), "finished task execution");
        true
    }

    /// One worker's step loop
    fn run_worker(&self) {
        let mut rng = rand::thread_rng();
        loop {
            if self.is_final() {
                return;
            }
            if self.fatal_error_seen() {
                return;
            }
            if self.is_inconsistent() {
                self.record_error(WedError::InconsistentState);
                return;
            }
            let ready = self.ready_tasks();
            if let Some(task) = ready.choose(&mut rng) {
                self.execute(task);
            }
            thread::sleep(STEP_BACKOFF);
        }
    }

    /// Drive the instance to termination with the given number of worker
    /// threads. Returns the final state, or the first fatal error
    /// recorded by any worker.
    pub fn run(&self, workers: usize) -> WedResult<Valuation> {
        let workers = workers.max(1);
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| self.run_worker());
            }
        });
        {
            let mut errors = self.errors.lock();
            if !errors.is_empty() {
                return Err(errors.remove(0));
            }
        }
        let state = self.store.snapshot();
        for (identifier, binding) in state.iter() {
            tracing::debug!(
                variable = identifier,
                value = %binding.value,
                permission = %binding.permission,
                "final state"
            );
        }
        tracing::info!("reached a final state");
        Ok(state)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn options() -> InstanceOptions {
        InstanceOptions { log: false }
    }

    #[test]
    fn instantiation_requires_the_initial_guard() {
        let makefile = WedMakefile::parse_str(
            r#"
initial_guard: $S = "init"
final_guard: $S = "done"
tasks:
  - name: advance
    guard: $S = "init"
    bash: S="done"
"#,
        )
        .unwrap();
        let config = config_file("S=\"other\"\n");
        let error =
            ExperimentInstance::new(makefile, config.path(), options()).unwrap_err();
        match error {
            WedError::UnsatisfiedInitialGuard { clause } => {
                assert_eq!(clause, "$S = \"init\"");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn single_task_reaches_the_final_state() {
        let makefile = WedMakefile::parse_str(
            r#"
initial_guard: $S = "init"
final_guard: $S = "done"
tasks:
  - name: advance
    guard: $S = "init"
    bash: S="done"
"#,
        )
        .unwrap();
        let config = config_file("S=\"init\"\n");
        let instance = ExperimentInstance::new(makefile, config.path(), options()).unwrap();
        let state = instance.run(1).unwrap();
        assert_eq!(state.value("S"), "done");
        assert!(instance.is_final());
    }

    #[test]
    fn ready_tasks_reflect_the_current_state() {
        let makefile = WedMakefile::parse_str(
            r#"
initial_guard: $S = "init"
final_guard: $S = "done"
tasks:
  - name: fires
    guard: $S = "init"
    bash: S="done"
  - name: blocked
    guard: $S = "mid"
    bash: S="done"
"#,
        )
        .unwrap();
        let config = config_file("S=\"init\"\n");
        let instance = ExperimentInstance::new(makefile, config.path(), options()).unwrap();
        let ready: Vec<&str> = instance.ready_tasks().iter().map(|t| t.name()).collect();
        assert_eq!(ready, ["fires"]);
        assert!(!instance.is_final());
        assert!(!instance.is_inconsistent());
    }
}
