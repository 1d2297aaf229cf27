//! WED-Makefile specification model and parser
//!
//! A WED-Makefile declares an experiment: an initial guard, a final guard,
//! and a set of tasks, each pairing a guard with a Bash script. Guards are
//! conjunctions of single-variable dependency clauses written in a small
//! Bash-flavoured grammar:
//!
//! ```text
//! $WEB_HTTPD_VERSION = "2.2.22"
//! $WEB_HTTPD_HOMEDIR != ""
//! $WEB_HARDWARE_TYPE in ["c8220", "pc3000"]
//! $CLIENT_JAVA_VERSION not in ["1.6", "1.7"]
//! ```
//!
//! Everything in this module is an immutable value object; all identifier,
//! value, and clause constraints are checked at construction time.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::error::{WedError, WedResult};
use crate::state::Valuation;

/// Identifier grammar shared by variables and task names
const IDENTIFIER_PATTERN: &str = "[a-zA-Z][_a-zA-Z0-9]{0,62}[a-zA-Z0-9]|[a-zA-Z]";
/// Value grammar: anything but newlines, at most 2048 characters
const VALUE_PATTERN: &str = ".{0,2048}";
/// Upper bound on the dependencies of a single guard
pub const MAX_GUARD_DEPENDENCIES: usize = 256;

#[allow(clippy::expect_used)]
fn compiled(pattern: String) -> Regex {
    Regex::new(&pattern).expect("grammar patterns are compile-time constants")
}

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| compiled(format!("^(?:{IDENTIFIER_PATTERN})$")));
static EQUALITY_RE: Lazy<Regex> = Lazy::new(|| {
    compiled(format!(
        r#"^\$({IDENTIFIER_PATTERN})\s*=\s*(?:'({VALUE_PATTERN})'|"({VALUE_PATTERN})")$"#
    ))
});
static INEQUALITY_RE: Lazy<Regex> = Lazy::new(|| {
    compiled(format!(
        r#"^\$({IDENTIFIER_PATTERN})\s*!=\s*(?:'({VALUE_PATTERN})'|"({VALUE_PATTERN})")$"#
    ))
});
static MEMBERSHIP_RE: Lazy<Regex> =
    Lazy::new(|| compiled(format!(r"^\$({IDENTIFIER_PATTERN})\s+in\s+(\[.+\])$")));
static NOMEMBERSHIP_RE: Lazy<Regex> =
    Lazy::new(|| compiled(format!(r"^\$({IDENTIFIER_PATTERN})\s+not\s+in\s+(\[.+\])$")));

/// True if `value` may be assigned to a variable: at most 2048 characters,
/// none of them newlines.
pub fn is_valid_value(value: &str) -> bool {
    !value.contains('\n') && value.chars().count() <= 2048
}

fn validate_value(value: &str) -> WedResult<&str> {
    if is_valid_value(value) {
        Ok(value)
    } else {
        Err(WedError::Syntax(
            "a value assigned to a variable must have at most 2048 characters, \
             none of them newlines"
                .to_string(),
        ))
    }
}

/// An experiment variable, identified by name
///
/// Identifiers have at most 64 alphanumeric and underscore characters,
/// start with an alphabetic character, and do not end with an underscore.
/// Equality and ordering are lexicographic on the identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Variable {
    identifier: String,
}

impl Variable {
    /// Construct a variable, validating the identifier grammar
    pub fn new(identifier: impl Into<String>) -> WedResult<Self> {
        let identifier = identifier.into();
        if Self::is_valid_identifier(&identifier) {
            Ok(Self { identifier })
        } else {
            Err(WedError::Syntax(format!(
                "a variable identifier must have at most 64 alphanumeric and underscore \
                 characters, start with an alphabetic character, and not end with an \
                 underscore character: {identifier:?}"
            )))
        }
    }

    /// True if `identifier` matches the identifier grammar
    pub fn is_valid_identifier(identifier: &str) -> bool {
        IDENTIFIER_RE.is_match(identifier)
    }

    /// The identifier
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The namespace: the prefix up to the last `_`, or `""` if the
    /// identifier contains no underscore.
    ///
    /// `WEB_HTTPD_VERSION` → `WEB_HTTPD`; `SSHKEY` → ``.
    pub fn namespace(&self) -> &str {
        match self.identifier.rfind('_') {
            Some(index) => &self.identifier[..index],
            None => "",
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier)
    }
}

/// A single-variable dependency clause
///
/// Exactly one of four forms; the right-hand literals are parsed once at
/// construction. Clause strings are matched in the order equality,
/// inequality, membership, no-membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    /// `$V = "literal"`
    Equality {
        /// Tested variable
        variable: Variable,
        /// Expected value
        literal: String,
    },
    /// `$V != "literal"`
    Inequality {
        /// Tested variable
        variable: Variable,
        /// Rejected value
        literal: String,
    },
    /// `$V in ["l1", "l2"]`
    Membership {
        /// Tested variable
        variable: Variable,
        /// Accepted values
        literals: Vec<String>,
    },
    /// `$V not in ["l1", "l2"]`
    NoMembership {
        /// Tested variable
        variable: Variable,
        /// Rejected values
        literals: Vec<String>,
    },
}

impl Dependency {
    /// Parse a clause string into a dependency
    pub fn parse(clause: &str) -> WedResult<Self> {
        if let Some(captures) = EQUALITY_RE.captures(clause) {
            return Ok(Dependency::Equality {
                variable: Variable::new(&captures[1])?,
                literal: quoted_literal(&captures)?,
            });
        }
        if let Some(captures) = INEQUALITY_RE.captures(clause) {
            return Ok(Dependency::Inequality {
                variable: Variable::new(&captures[1])?,
                literal: quoted_literal(&captures)?,
            });
        }
        if let Some(captures) = MEMBERSHIP_RE.captures(clause) {
            return Ok(Dependency::Membership {
                variable: Variable::new(&captures[1])?,
                literals: parse_literal_list(&captures[2])
                    .map_err(|reason| invalid_clause(clause, &reason))?,
            });
        }
        if let Some(captures) = NOMEMBERSHIP_RE.captures(clause) {
            return Ok(Dependency::NoMembership {
                variable: Variable::new(&captures[1])?,
                literals: parse_literal_list(&captures[2])
                    .map_err(|reason| invalid_clause(clause, &reason))?,
            });
        }
        Err(WedError::Syntax(format!(
            "invalid dependency clause: {clause}"
        )))
    }

    /// The variable this clause depends on
    pub fn on_variable(&self) -> &Variable {
        match self {
            Dependency::Equality { variable, .. }
            | Dependency::Inequality { variable, .. }
            | Dependency::Membership { variable, .. }
            | Dependency::NoMembership { variable, .. } => variable,
        }
    }

    /// Canonical clause rendering; parses back to an equal dependency
    pub fn clause(&self) -> String {
        self.to_string()
    }

    /// Evaluate the clause against a valuation. Unset variables read as
    /// the empty string.
    pub fn is_satisfied_by(&self, state: &Valuation) -> bool {
        match self {
            Dependency::Equality { variable, literal } => {
                state.value(variable.identifier()) == literal
            }
            Dependency::Inequality { variable, literal } => {
                state.value(variable.identifier()) != literal
            }
            Dependency::Membership { variable, literals } => {
                let value = state.value(variable.identifier());
                literals.iter().any(|literal| literal == value)
            }
            Dependency::NoMembership { variable, literals } => {
                let value = state.value(variable.identifier());
                literals.iter().all(|literal| literal != value)
            }
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::Equality { variable, literal } => {
                write!(f, "${variable} = {}", quote(literal))
            }
            Dependency::Inequality { variable, literal } => {
                write!(f, "${variable} != {}", quote(literal))
            }
            Dependency::Membership { variable, literals } => {
                write!(f, "${variable} in [{}]", quote_list(literals))
            }
            Dependency::NoMembership { variable, literals } => {
                write!(f, "${variable} not in [{}]", quote_list(literals))
            }
        }
    }
}

fn invalid_clause(clause: &str, reason: &str) -> WedError {
    WedError::Syntax(format!("invalid dependency clause: {clause}: {reason}"))
}

/// Extract the quoted literal from an equality/inequality match: group 2
/// is the single-quoted form, group 3 the double-quoted one.
fn quoted_literal(captures: &regex::Captures<'_>) -> WedResult<String> {
    let literal = captures
        .get(2)
        .or_else(|| captures.get(3))
        .map_or("", |m| m.as_str());
    Ok(validate_value(literal)?.to_string())
}

/// Parse a bracketed list of quoted literals: `["a", 'b']`
fn parse_literal_list(list: &str) -> Result<Vec<String>, String> {
    let inner = list
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or("expected a bracketed list")?;
    let mut literals = Vec::new();
    let mut rest = inner.trim_start();
    while !rest.is_empty() {
        let quote_char = rest.chars().next().unwrap_or_default();
        if quote_char != '\'' && quote_char != '"' {
            return Err(format!("expected a quoted literal at {rest:?}"));
        }
        let body = &rest[1..];
        let end = body.find(quote_char).ok_or("unterminated literal")?;
        let literal = &body[..end];
        if !is_valid_value(literal) {
            return Err(format!("invalid literal {literal:?}"));
        }
        literals.push(literal.to_string());
        rest = body[end + 1..].trim_start();
        match rest.strip_prefix(',') {
            Some(after) => rest = after.trim_start(),
            None if rest.is_empty() => break,
            None => return Err(format!("expected ',' between literals at {rest:?}")),
        }
    }
    Ok(literals)
}

fn quote(literal: &str) -> String {
    if literal.contains('"') {
        format!("'{literal}'")
    } else {
        format!("\"{literal}\"")
    }
}

fn quote_list(literals: &[String]) -> String {
    literals
        .iter()
        .map(|literal| quote(literal))
        .collect::<Vec<_>>()
        .join(", ")
}

/// An AND-conjunction of 1 to 256 dependency clauses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    dependencies: Vec<Dependency>,
    on_variables: Vec<Variable>,
}

impl Guard {
    /// Build a guard from its dependencies, enforcing the arity bounds
    pub fn new(dependencies: Vec<Dependency>) -> WedResult<Self> {
        if dependencies.is_empty() || dependencies.len() > MAX_GUARD_DEPENDENCIES {
            return Err(WedError::Syntax(format!(
                "a guard must have between 1 and {MAX_GUARD_DEPENDENCIES} dependencies"
            )));
        }
        let on_variables: Vec<Variable> = dependencies
            .iter()
            .map(|dependency| dependency.on_variable().clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        Ok(Self {
            dependencies,
            on_variables,
        })
    }

    /// Parse a guard from clause strings
    pub fn parse<I, S>(clauses: I) -> WedResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let dependencies = clauses
            .into_iter()
            .map(|clause| Dependency::parse(clause.as_ref()))
            .collect::<WedResult<Vec<_>>>()?;
        Self::new(dependencies)
    }

    /// The dependencies, in declaration order
    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Sorted, deduplicated dependent variables
    pub fn on_variables(&self) -> &[Variable] {
        &self.on_variables
    }

    /// Sorted, deduplicated namespaces of the dependent variables
    pub fn namespaces(&self) -> Vec<String> {
        namespaces_of(&self.on_variables)
    }

    /// True if every dependency is satisfied by the valuation
    pub fn is_satisfied_by(&self, state: &Valuation) -> bool {
        self.dependencies
            .iter()
            .all(|dependency| dependency.is_satisfied_by(state))
    }
}

fn namespaces_of(variables: &[Variable]) -> Vec<String> {
    variables
        .iter()
        .map(|variable| variable.namespace().to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// A guarded unit of shell work
#[derive(Debug, Clone)]
pub struct Task {
    name: String,
    guard: Guard,
    script: String,
}

impl Task {
    /// Construct a task, validating the name grammar
    pub fn new(name: impl Into<String>, guard: Guard, script: impl Into<String>) -> WedResult<Self> {
        let name = name.into();
        if !Variable::is_valid_identifier(&name) {
            return Err(WedError::Syntax(format!(
                "a task name must have at most 64 alphanumeric and underscore characters, \
                 start with an alphabetic character, and not end with an underscore \
                 character: {name:?}"
            )));
        }
        Ok(Self {
            name,
            guard,
            script: script.into(),
        })
    }

    /// The task name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The guard controlling execution
    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    /// The Bash script body
    pub fn script(&self) -> &str {
        &self.script
    }

    /// The variables the task may read and write
    pub fn on_variables(&self) -> &[Variable] {
        self.guard.on_variables()
    }
}

/// A parsed experiment specification
#[derive(Debug, Clone)]
pub struct WedMakefile {
    initial_guard: Guard,
    final_guard: Guard,
    tasks: Vec<Task>,
    variables: Vec<Variable>,
}

/// A clause or a list of clauses, as either appears in the YAML document
#[derive(Deserialize)]
#[serde(untagged)]
enum Clauses {
    One(String),
    Many(Vec<String>),
}

impl Clauses {
    fn into_vec(self) -> Vec<String> {
        match self {
            Clauses::One(clause) => vec![clause],
            Clauses::Many(clauses) => clauses,
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMakefile {
    initial_guard: Clauses,
    final_guard: Clauses,
    tasks: Vec<RawTask>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTask {
    name: String,
    guard: Clauses,
    bash: String,
}

impl WedMakefile {
    /// Assemble a specification from already-validated parts
    pub fn new(initial_guard: Guard, final_guard: Guard, tasks: Vec<Task>) -> Self {
        let variables = initial_guard
            .on_variables()
            .iter()
            .chain(final_guard.on_variables())
            .chain(tasks.iter().flat_map(Task::on_variables))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        Self {
            initial_guard,
            final_guard,
            tasks,
            variables,
        }
    }

    /// Parse a WED-Makefile from its YAML source
    pub fn parse_str(source: &str) -> WedResult<Self> {
        let raw: RawMakefile = serde_yaml::from_str(source)
            .map_err(|error| WedError::Syntax(format!("invalid WED-Makefile: {error}")))?;
        let initial_guard = Guard::parse(raw.initial_guard.into_vec())?;
        let final_guard = Guard::parse(raw.final_guard.into_vec())?;
        let tasks = raw
            .tasks
            .into_iter()
            .map(|task| Task::new(task.name, Guard::parse(task.guard.into_vec())?, task.bash))
            .collect::<WedResult<Vec<_>>>()?;
        Ok(Self::new(initial_guard, final_guard, tasks))
    }

    /// Load and parse a WED-Makefile from disk
    pub fn from_path(path: impl AsRef<Path>) -> WedResult<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::parse_str(&source)
    }

    /// The guard the initial state must satisfy
    pub fn initial_guard(&self) -> &Guard {
        &self.initial_guard
    }

    /// The guard a final state satisfies
    pub fn final_guard(&self) -> &Guard {
        &self.final_guard
    }

    /// The declared tasks, in document order
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Sorted union of the variables of every guard in the specification
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Sorted, deduplicated namespaces of the experiment variables
    pub fn namespaces(&self) -> Vec<String> {
        namespaces_of(&self.variables)
    }
}
