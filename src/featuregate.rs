//! Process-wide feature gate registry.
//!
//! Gates are named boolean toggles consulted by the sync loops at decision
//! points to enable optional, potentially risky behaviors. The table is
//! read-mostly: written during configuration load, read concurrently by
//! every loop, so a plain `RwLock` lookup table is sufficient.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

/// Gate controlling whether tenant PVC status phase is synchronized upward
pub const SYNC_TENANT_PVC_STATUS_PHASE: &str = "SyncTenantPVCStatusPhase";

/// All known gates with their process-wide defaults
const DEFAULTS: &[(&str, bool)] = &[(SYNC_TENANT_PVC_STATUS_PHASE, false)];

fn registry() -> &'static RwLock<HashMap<&'static str, bool>> {
    static REGISTRY: OnceLock<RwLock<HashMap<&'static str, bool>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(DEFAULTS.iter().copied().collect()))
}

/// Check whether the named gate is enabled.
///
/// Unknown gate names read as disabled; gates are a closed set defined by
/// [`DEFAULTS`], so an unknown name is a programmer error surfaced by tests
/// rather than a runtime fault.
pub fn enabled(name: &str) -> bool {
    registry()
        .read()
        .map(|table| table.get(name).copied().unwrap_or(false))
        .unwrap_or(false)
}

/// Set a gate's value. Intended for configuration load/update only.
pub fn set(name: &'static str, value: bool) {
    if let Ok(mut table) = registry().write() {
        table.insert(name, value);
    }
}

/// Scoped gate override for tests: restores the prior value on drop.
///
/// Mirrors the scoped-acquisition pattern: the override is guaranteed to be
/// undone on every exit path, including panics, so one test's gate flip
/// cannot leak into another.
#[must_use = "the override is reverted when the guard is dropped"]
pub struct FeatureGateGuard {
    name: &'static str,
    previous: bool,
}

/// Enable or disable a gate for the lifetime of the returned guard.
pub fn set_during_test(name: &'static str, value: bool) -> FeatureGateGuard {
    let previous = enabled(name);
    set(name, value);
    FeatureGateGuard { name, previous }
}

impl Drop for FeatureGateGuard {
    fn drop(&mut self) {
        set(self.name, self.previous);
    }
}

/// Serialize tests that flip a shared gate.
///
/// The registry is process-global, so tests overriding the same gate name
/// must not interleave; poisoning is ignored because a panicking test has
/// already restored its override via the guard's drop.
#[cfg(test)]
pub(crate) fn exclusive_gate_access() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
