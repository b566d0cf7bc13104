//! The `System` aggregate: owns the component table and capability
//! registry together, and drives the resolver to a fixed point (spec §4.3
//! "Resolution ... runs to a fixed point").
//!
//! This is the owner the removed `resolver::resolve_to_fixed_point`
//! combinator was meant to be called from. Because [`resolver::single_pass`]
//! returns an owned `Vec<ResolverRequest>` with no lifetime tied to its
//! `&ComponentTable`/`&CapabilityRegistry` arguments, the immutable borrow
//! ends as soon as that call returns — letting `apply_request` take `&mut
//! self` afterward with no combinator needed in between.

use crate::capability::CapabilityRegistry;
use crate::component::{Component, ComponentIdx, ComponentTable, SupervisionState};
use crate::resolver::{self, ResolverRequest};
use crate::supervisor;
use log::{debug, info, warn};
use nix::unistd::Pid;
use std::collections::HashSet;

pub struct System {
    pub components: ComponentTable,
    pub capabilities: CapabilityRegistry,
}

impl System {
    pub fn new() -> Self {
        Self { components: ComponentTable::new(), capabilities: CapabilityRegistry::new() }
    }

    /// Interns a freshly-loaded component's `requires_names`/`provides_names`
    /// into capability indices and inserts it (spec §4.1: the loader itself
    /// "does not resolve capability names to indices", deferred here so the
    /// registry that owns them is this `System`'s, not the loader's).
    pub fn load_component(&mut self, mut component: Component) -> ComponentIdx {
        component.requires =
            component.requires_names.iter().map(|n| self.capabilities.get_or_create(n)).collect();
        component.provides =
            component.provides_names.iter().map(|n| self.capabilities.get_or_create(n)).collect();
        self.components.insert(component)
    }

    /// Applies one resolver request: promotion is a request to the
    /// supervisor to fork (the caller still has to actually spawn the
    /// process — this only flips bookkeeping that doesn't require a live
    /// pid yet); demotion withdraws the component's provided capabilities
    /// and marks it inactive immediately, matching spec §4.2 "loses a
    /// required capability -> demoted to INACTIVE without delay."
    fn apply_request(&mut self, request: ResolverRequest) {
        match request {
            ResolverRequest::Promote(idx) => {
                debug!("resolver: {} eligible for promotion", self.components.get(idx).name);
                // Left for the caller loop to actually spawn; flagging here
                // would race the supervisor's own STARTING transition, so
                // this pass only surfaces eligibility (see `resolve_to_fixed_point`).
            }
            ResolverRequest::Demote(idx) => {
                let provided = self.components.get(idx).provides.clone();
                for cap in provided {
                    self.capabilities.deactivate(cap);
                }
                let component = self.components.get_mut(idx);
                info!("{}: demoted to INACTIVE (lost a required capability)", component.name);
                let pid = component.pid;
                component.state = SupervisionState::Inactive;
                // The pid stays on the record until the exit is actually
                // reaped (spec §4.2 "the supervisor ensures the process is
                // reaped") — nulling it here would discard the only handle
                // left to signal or, if it ignores the signal, force-kill.
                if let Some(pid) = pid {
                    let _ = supervisor::request_stop(Pid::from_raw(pid));
                }
            }
        }
    }

    /// Runs the resolver to a fixed point, applying every demotion inline
    /// and returning the set of components newly eligible for promotion
    /// (which the caller must actually spawn — see [`crate::supervisor`]).
    /// `apply_request` doesn't change a component's state for a `Promote`
    /// (that happens once the caller actually forks it), so a pass with no
    /// `Demote` requests is already stable: every remaining request is a
    /// `Promote` that would just be re-emitted forever. Demotions, on the
    /// other hand, can cascade (withdrawing one capability can make another
    /// component's requirement unmet), so passes keep running while any are
    /// present, capped by [`resolver::pass_guard`] as a design-time
    /// non-convergence backstop.
    pub fn resolve_to_fixed_point(&mut self) -> Vec<ComponentIdx> {
        let guard = resolver::pass_guard(&self.components);
        let mut newly_promotable = Vec::new();
        let mut seen = HashSet::new();
        for pass in 0..=guard {
            let requests = resolver::single_pass(&self.components, &self.capabilities);
            if requests.is_empty() {
                return newly_promotable;
            }
            let any_demotion = requests.iter().any(|r| matches!(r, ResolverRequest::Demote(_)));
            for request in requests {
                if let ResolverRequest::Promote(idx) = request {
                    if self.components.get(idx).state == SupervisionState::Inactive && seen.insert(idx) {
                        newly_promotable.push(idx);
                    }
                }
                self.apply_request(request);
            }
            if !any_demotion {
                return newly_promotable;
            }
            if pass == guard {
                warn!(
                    "resolver did not converge after {guard} passes; component graph likely ill-formed"
                );
                return newly_promotable;
            }
        }
        newly_promotable
    }

    /// Call when a component reaches ACTIVE or DEGRADED: activates every
    /// capability it provides, which may unblock further promotions on the
    /// next `resolve_to_fixed_point` call.
    pub fn publish_capabilities(&mut self, idx: ComponentIdx) {
        let provided = self.components.get(idx).provides.clone();
        for cap in provided {
            self.capabilities.activate(cap, idx);
        }
    }

    /// Call when a component leaves a live state outside of the resolver's
    /// own demotion path (e.g. it crashed): withdraws its capabilities so
    /// the next resolve pass can cascade the demotion to dependents.
    pub fn withdraw_capabilities(&mut self, idx: ComponentIdx) {
        let provided = self.components.get(idx).provides.clone();
        for cap in provided {
            self.capabilities.deactivate(cap);
        }
    }
}

impl Default for System {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Commandline, Component, Kind, RestartAccounting};
    use std::path::PathBuf;
    use std::time::Duration;

    fn make_component(name: &str) -> Component {
        Component {
            name: name.to_owned(),
            kind: Kind::Service,
            command: Commandline { program: PathBuf::from("/bin/true"), arguments: vec![] },
            env: Default::default(),
            requires_names: vec![],
            provides_names: vec![],
            requires: vec![],
            provides: vec![],
            state: SupervisionState::Inactive,
            pid: None,
            restart: RestartAccounting::new(Duration::from_secs(60), 5),
            readiness: Default::default(),
            health: None,
            isolation: Default::default(),
            upgrade_strategy: crate::component::UpgradeStrategy::Restart,
            restart_count: 0,
            started_at: None,
            health_fail_streak: 0,
        }
    }

    #[test]
    fn fixed_point_surfaces_only_inactive_promotions() {
        let mut system = System::new();
        let cap_a = system.capabilities.get_or_create("cap-a");
        let mut a = make_component("a");
        a.provides = vec![cap_a];
        let a_idx = system.components.insert(a);

        let mut b = make_component("b");
        b.requires = vec![cap_a];
        let b_idx = system.components.insert(b);

        let promotable = system.resolve_to_fixed_point();
        assert_eq!(promotable, vec![a_idx]);

        system.components.get_mut(a_idx).state = SupervisionState::Active;
        system.publish_capabilities(a_idx);

        let promotable = system.resolve_to_fixed_point();
        assert_eq!(promotable, vec![b_idx]);
    }

    #[test]
    fn withdrawing_a_capability_cascades_demotion_on_next_pass() {
        let mut system = System::new();
        let cap_a = system.capabilities.get_or_create("cap-a");
        let mut a = make_component("a");
        a.provides = vec![cap_a];
        a.state = SupervisionState::Active;
        let a_idx = system.components.insert(a);
        system.publish_capabilities(a_idx);

        let mut b = make_component("b");
        b.requires = vec![cap_a];
        b.state = SupervisionState::Active;
        let b_idx = system.components.insert(b);

        system.withdraw_capabilities(a_idx);
        system.components.get_mut(a_idx).state = SupervisionState::Failed;

        let promotable = system.resolve_to_fixed_point();
        assert!(promotable.is_empty());
        assert_eq!(system.components.get(b_idx).state, SupervisionState::Inactive);
    }
}
