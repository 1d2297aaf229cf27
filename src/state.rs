//! Shared experiment-instance state
//!
//! A [`Valuation`] is an ordered mapping from variable identifiers to
//! `(value, permission)` bindings; it serves both as the live state of an
//! instance and as the deltas exchanged with task executions. The
//! [`StateStore`] wraps one valuation together with a per-variable lock
//! table and the coordination mutex that serialises lock-acquisition
//! phases across workers.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};

/// Write permission of a variable binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// The binding may be overwritten
    ReadWrite,
    /// The binding may never be overwritten again
    ReadOnly,
}

impl Permission {
    /// Wire representation used by the capture protocol
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::ReadWrite => "rw",
            Permission::ReadOnly => "ro",
        }
    }

    /// Parse the wire representation (`rw` | `ro`)
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rw" => Some(Permission::ReadWrite),
            "ro" => Some(Permission::ReadOnly),
            _ => None,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value and permission currently assigned to a variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Assigned character-string value
    pub value: String,
    /// Write permission of the binding
    pub permission: Permission,
}

impl Binding {
    /// Convenience constructor
    pub fn new(value: impl Into<String>, permission: Permission) -> Self {
        Self {
            value: value.into(),
            permission,
        }
    }
}

/// An ordered valuation of variables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Valuation {
    bindings: BTreeMap<String, Binding>,
}

impl Valuation {
    /// Create an empty valuation
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a binding
    pub fn insert(&mut self, identifier: impl Into<String>, binding: Binding) {
        self.bindings.insert(identifier.into(), binding);
    }

    /// Binding assigned to the identifier, if any
    pub fn get(&self, identifier: &str) -> Option<&Binding> {
        self.bindings.get(identifier)
    }

    /// Value assigned to the identifier; unset variables read as `""`
    pub fn value(&self, identifier: &str) -> &str {
        self.get(identifier).map_or("", |b| b.value.as_str())
    }

    /// Permission of the identifier; unset variables default to `rw`
    pub fn permission(&self, identifier: &str) -> Permission {
        self.get(identifier)
            .map_or(Permission::ReadWrite, |b| b.permission)
    }

    /// True if the identifier is bound read-only
    pub fn is_readonly(&self, identifier: &str) -> bool {
        self.permission(identifier) == Permission::ReadOnly
    }

    /// Iterate bindings in identifier order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Binding)> {
        self.bindings.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of bindings
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// True if no variable is bound
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Reduce this valuation (a capture result) to the delta it represents
    /// relative to `base` (the snapshot handed to the task).
    ///
    /// An entry survives iff its value differs from the base, or it was
    /// captured read-only while the base held it read-write. A captured
    /// `rw` never downgrades a read-only base binding whose value the task
    /// left untouched: the capture probes permissions with a shell `unset`
    /// test and reports plain pass-through arguments as `rw`.
    pub fn delta_from(&self, base: &Valuation) -> Valuation {
        let mut delta = Valuation::new();
        for (identifier, binding) in self.iter() {
            let changed = match base.get(identifier) {
                Some(prev) => {
                    prev.value != binding.value
                        || (binding.permission == Permission::ReadOnly
                            && prev.permission == Permission::ReadWrite)
                }
                None => true,
            };
            if changed {
                delta.insert(identifier, binding.clone());
            }
        }
        delta
    }
}

/// Attempted overwrite of a read-only binding, reported by [`StateStore::merge`]
#[derive(Debug)]
pub struct ReadOnlyViolation {
    /// Identifier of the read-only variable
    pub variable: String,
}

/// A set of held per-variable locks; dropping it releases them
pub struct LockSet<'a> {
    guards: Vec<MutexGuard<'a, ()>>,
}

impl LockSet<'_> {
    /// Number of held locks
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    /// True if no lock is held
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

/// The shared mutable state of one experiment instance
///
/// The lock table's key set equals the experiment's variable set and is
/// fixed at creation. All per-variable acquisitions are non-blocking and
/// happen in lexicographic identifier order, which keeps the wait-for
/// graph acyclic; the coordination mutex serialises acquisition phases so
/// two workers cannot interleave partial acquire/release sweeps.
#[derive(Debug)]
pub struct StateStore {
    bindings: RwLock<Valuation>,
    locks: BTreeMap<String, Mutex<()>>,
    coordination: Mutex<()>,
}

impl StateStore {
    /// Create a store over the initial valuation, with one lock per
    /// experiment variable.
    pub fn new(initial: Valuation, variables: impl IntoIterator<Item = String>) -> Self {
        let locks = variables
            .into_iter()
            .map(|identifier| (identifier, Mutex::new(())))
            .collect();
        Self {
            bindings: RwLock::new(initial),
            locks,
            coordination: Mutex::new(()),
        }
    }

    /// Acquire the coordination mutex. Hold the returned guard for the
    /// duration of a lock-acquisition phase, never across task execution.
    pub fn coordinate(&self) -> MutexGuard<'_, ()> {
        self.coordination.lock()
    }

    /// Try to acquire the locks of the given variables, in lexicographic
    /// order, without blocking. On any failure every lock acquired so far
    /// is released and `None` is returned.
    pub fn try_lock(&self, identifiers: &[&str]) -> Option<LockSet<'_>> {
        let mut wanted: Vec<&str> = identifiers.to_vec();
        wanted.sort_unstable();
        wanted.dedup();
        let mut guards = Vec::with_capacity(wanted.len());
        for identifier in wanted {
            match self.locks.get(identifier).and_then(|lock| lock.try_lock()) {
                Some(guard) => guards.push(guard),
                // Dropping the partial set releases everything acquired so far.
                None => return None,
            }
        }
        Some(LockSet { guards })
    }

    /// Try to acquire every per-variable lock. Succeeding proves that no
    /// worker is mid-task.
    pub fn try_lock_all(&self) -> Option<LockSet<'_>> {
        let mut guards = Vec::with_capacity(self.locks.len());
        for lock in self.locks.values() {
            match lock.try_lock() {
                Some(guard) => guards.push(guard),
                None => return None,
            }
        }
        Some(LockSet { guards })
    }

    /// Read access to the live valuation, for predicate evaluation under
    /// held locks. Does not touch the coordination mutex.
    pub fn read(&self) -> RwLockReadGuard<'_, Valuation> {
        self.bindings.read()
    }

    /// Consistent copy of the whole valuation. Takes the coordination
    /// mutex for the duration of the copy; do not call while holding it.
    pub fn snapshot(&self) -> Valuation {
        let _coordination = self.coordinate();
        self.bindings.read().clone()
    }

    /// Copy of the bindings of the given variables, materialising missing
    /// ones as `("", rw)`. The caller is expected to hold their locks.
    pub fn snapshot_of(&self, identifiers: &[&str]) -> Valuation {
        let bindings = self.bindings.read();
        let mut snapshot = Valuation::new();
        for identifier in identifiers {
            let binding = bindings
                .get(identifier)
                .cloned()
                .unwrap_or_else(|| Binding::new("", Permission::ReadWrite));
            snapshot.insert(*identifier, binding);
        }
        snapshot
    }

    /// Apply a delta, assuming the caller holds all locks covering its
    /// keys. If any key is currently bound read-only the whole merge is
    /// rejected and nothing is written.
    pub fn merge(&self, delta: &Valuation) -> Result<(), ReadOnlyViolation> {
        let mut bindings = self.bindings.write();
        for (identifier, _) in delta.iter() {
            if bindings.is_readonly(identifier) {
                return Err(ReadOnlyViolation {
                    variable: identifier.to_string(),
                });
            }
        }
        for (identifier, binding) in delta.iter() {
            bindings.insert(identifier, binding.clone());
        }
        Ok(())
    }

    /// Identifiers of the lock table, in lexicographic order
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.locks.keys().map(String::as_str)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn rw(value: &str) -> Binding {
        Binding::new(value, Permission::ReadWrite)
    }

    fn ro(value: &str) -> Binding {
        Binding::new(value, Permission::ReadOnly)
    }

    #[test]
    fn unset_variables_read_as_empty_readwrite() {
        let valuation = Valuation::new();
        assert_eq!(valuation.value("MISSING"), "");
        assert_eq!(valuation.permission("MISSING"), Permission::ReadWrite);
        assert!(!valuation.is_readonly("MISSING"));
    }

    #[test]
    fn delta_keeps_changed_values_and_escalations() {
        let mut base = Valuation::new();
        base.insert("A", rw("1"));
        base.insert("B", rw("2"));
        base.insert("C", ro("3"));

        let mut captured = Valuation::new();
        captured.insert("A", rw("changed"));
        captured.insert("B", ro("2"));
        // pass-through of a read-only argument, reported rw by the probe
        captured.insert("C", rw("3"));
        captured.insert("D", rw("new"));

        let delta = captured.delta_from(&base);
        assert_eq!(delta.get("A"), Some(&rw("changed")));
        assert_eq!(delta.get("B"), Some(&ro("2")));
        assert_eq!(delta.get("C"), None);
        assert_eq!(delta.get("D"), Some(&rw("new")));
    }

    #[test]
    fn merge_rejects_readonly_overwrite_atomically() {
        let mut initial = Valuation::new();
        initial.insert("A", rw("1"));
        initial.insert("B", ro("2"));
        let store = StateStore::new(initial, ["A".to_string(), "B".to_string()]);

        let mut delta = Valuation::new();
        delta.insert("A", rw("10"));
        delta.insert("B", rw("20"));
        let violation = store.merge(&delta).unwrap_err();
        assert_eq!(violation.variable, "B");
        // nothing was applied
        assert_eq!(store.snapshot().value("A"), "1");
        assert_eq!(store.snapshot().value("B"), "2");
    }

    #[test]
    fn merge_allows_escalation_to_readonly() {
        let mut initial = Valuation::new();
        initial.insert("A", rw("1"));
        let store = StateStore::new(initial, ["A".to_string()]);

        let mut delta = Valuation::new();
        delta.insert("A", ro("2"));
        store.merge(&delta).unwrap();
        let state = store.snapshot();
        assert_eq!(state.value("A"), "2");
        assert!(state.is_readonly("A"));
    }

    #[test]
    fn try_lock_rolls_back_partial_acquisitions() {
        let store = StateStore::new(
            Valuation::new(),
            ["A", "B", "C"].into_iter().map(String::from),
        );
        let held = store.try_lock(&["B"]).unwrap();
        assert_eq!(held.len(), 1);

        // B is taken, so the sweep over {A, B} must fail and release A.
        assert!(store.try_lock(&["A", "B"]).is_none());
        let a = store.try_lock(&["A"]).unwrap();
        assert!(!a.is_empty());

        assert!(store.try_lock_all().is_none());
        drop(held);
        drop(a);
        assert!(store.try_lock_all().is_some());
    }

    #[test]
    fn snapshot_of_materialises_missing_bindings() {
        let mut initial = Valuation::new();
        initial.insert("A", ro("1"));
        let store = StateStore::new(initial, ["A".to_string(), "B".to_string()]);
        let snapshot = store.snapshot_of(&["A", "B"]);
        assert_eq!(snapshot.get("A"), Some(&ro("1")));
        assert_eq!(snapshot.get("B"), Some(&rw("")));
    }
}
