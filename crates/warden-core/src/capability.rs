//! The capability registry (spec §2 C2, §3 "Capability").
//!
//! A capability is a named system property provided by at most one
//! component at a time. Capabilities live for the lifetime of the process;
//! once an index is assigned to a name it is never reused, matching the
//! append-only-table discipline in spec §9 "Linked identifiers vs. indices".

use crate::component::ComponentIdx;
use std::collections::HashMap;

/// Stable index into [`CapabilityRegistry`]. Never recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapabilityIdx(pub usize);

#[derive(Debug, Clone)]
pub struct Capability {
    pub name: String,
    pub active: bool,
    pub degraded: bool,
    pub provider: Option<ComponentIdx>,
}

impl Capability {
    fn new(name: String) -> Self {
        Self { name, active: false, degraded: false, provider: None }
    }
}

/// Index-addressed table mapping capability name to provider/liveness/degraded.
///
/// Invariant (spec §3): at any instant, `active` implies `provider` refers
/// to a component whose supervision state is ACTIVE or DEGRADED. Enforcing
/// that invariant is the caller's (supervisor/resolver's) job; this type
/// only stores the bits and never inspects component state itself, keeping
/// the registry decoupled from component identity per spec §3 "Ownership".
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    capabilities: Vec<Capability>,
    by_name: HashMap<String, CapabilityIdx>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a capability index by name without creating it.
    pub fn find(&self, name: &str) -> Option<CapabilityIdx> {
        self.by_name.get(name).copied()
    }

    /// Returns the index for `name`, creating the capability row (inactive,
    /// no provider) on first mention, per spec §3 "Lifecycle: created on
    /// first mention".
    pub fn get_or_create(&mut self, name: &str) -> CapabilityIdx {
        if let Some(idx) = self.by_name.get(name) {
            return *idx;
        }
        let idx = CapabilityIdx(self.capabilities.len());
        self.capabilities.push(Capability::new(name.to_owned()));
        self.by_name.insert(name.to_owned(), idx);
        idx
    }

    pub fn get(&self, idx: CapabilityIdx) -> &Capability {
        &self.capabilities[idx.0]
    }

    pub fn name(&self, idx: CapabilityIdx) -> &str {
        &self.capabilities[idx.0].name
    }

    pub fn is_active(&self, idx: CapabilityIdx) -> bool {
        self.capabilities[idx.0].active
    }

    pub fn is_degraded(&self, idx: CapabilityIdx) -> bool {
        self.capabilities[idx.0].degraded
    }

    pub fn provider(&self, idx: CapabilityIdx) -> Option<ComponentIdx> {
        self.capabilities[idx.0].provider
    }

    /// Promotes a capability to active with the given provider. Used when a
    /// component transitions into ACTIVE/DEGRADED (or a oneshot exits 0).
    pub fn activate(&mut self, idx: CapabilityIdx, provider: ComponentIdx) {
        let cap = &mut self.capabilities[idx.0];
        cap.active = true;
        cap.degraded = false;
        cap.provider = Some(provider);
    }

    /// Withdraws a capability. Used when its provider leaves a live state.
    /// Clears the provider too: a withdrawn capability has no claimant until
    /// resolution re-promotes something, which keeps the "exactly one
    /// provider at a time" invariant honest during the gap.
    pub fn deactivate(&mut self, idx: CapabilityIdx) {
        let cap = &mut self.capabilities[idx.0];
        cap.active = false;
        cap.degraded = false;
        cap.provider = None;
    }

    /// Sets the degraded flag without touching `active`. Spec §4.6: a
    /// DEGRADED provider's capability stays active (satisfies requirements)
    /// but is flagged for inspection.
    pub fn set_degraded(&mut self, idx: CapabilityIdx, degraded: bool) {
        self.capabilities[idx.0].degraded = degraded;
    }

    /// Atomically retargets the provider of a capability without ever
    /// passing through an inactive state. Used by the handoff engine
    /// (spec §4.4 strategy 2, step 6) so the registry never shows the
    /// capability inactive during a zero-gap upgrade.
    pub fn retarget(&mut self, idx: CapabilityIdx, new_provider: ComponentIdx) {
        let cap = &mut self.capabilities[idx.0];
        cap.active = true;
        cap.provider = Some(new_provider);
    }

    pub fn iter(&self) -> impl Iterator<Item = (CapabilityIdx, &Capability)> {
        self.capabilities.iter().enumerate().map(|(i, c)| (CapabilityIdx(i), c))
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_idempotent() {
        let mut reg = CapabilityRegistry::new();
        let a = reg.get_or_create("network.configured");
        let b = reg.get_or_create("network.configured");
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn activate_sets_provider_and_clears_degraded() {
        let mut reg = CapabilityRegistry::new();
        let cap = reg.get_or_create("cap-a");
        reg.set_degraded(cap, true);
        reg.activate(cap, ComponentIdx(3));
        assert!(reg.is_active(cap));
        assert!(!reg.is_degraded(cap));
        assert_eq!(reg.provider(cap), Some(ComponentIdx(3)));
    }

    #[test]
    fn deactivate_clears_provider() {
        let mut reg = CapabilityRegistry::new();
        let cap = reg.get_or_create("cap-a");
        reg.activate(cap, ComponentIdx(0));
        reg.deactivate(cap);
        assert!(!reg.is_active(cap));
        assert_eq!(reg.provider(cap), None);
    }

    #[test]
    fn retarget_never_clears_active() {
        let mut reg = CapabilityRegistry::new();
        let cap = reg.get_or_create("echo.listening");
        reg.activate(cap, ComponentIdx(0));
        reg.retarget(cap, ComponentIdx(1));
        assert!(reg.is_active(cap));
        assert_eq!(reg.provider(cap), Some(ComponentIdx(1)));
    }
}
