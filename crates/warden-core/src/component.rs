//! The component table and its supervision state machine (spec §2 C3/C5,
//! §3 "Component", §4.2).

use crate::capability::CapabilityIdx;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Stable index into [`ComponentTable`]. Never recycled while any in-flight
/// event might still carry an old index (spec §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentIdx(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Service,
    Oneshot,
}

/// Supervision state machine (spec §4.2 transition table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisionState {
    Inactive,
    Starting,
    ReadyWait,
    Active,
    Degraded,
    Failed,
    Done,
    Cycle,
}

impl SupervisionState {
    /// A component in this state owns a live process identifier (spec §3
    /// global invariant: "A component in ACTIVE or DEGRADED must have a
    /// live process identifier", extended here to cover the in-between
    /// STARTING/READY_WAIT states where the process already exists).
    pub fn is_live(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::ReadyWait | Self::Active | Self::Degraded
        )
    }

    pub fn provides_capability(self) -> bool {
        matches!(self, Self::Active | Self::Degraded)
    }
}

#[derive(Debug, Clone)]
pub struct Commandline {
    pub program: PathBuf,
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Timeout(pub Option<Duration>);

#[derive(Debug, Clone)]
pub enum ReadinessPolicy {
    None,
    File { path: PathBuf },
    Signal,
    Command { probe: Commandline, interval: Duration },
}

#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    pub policy: ReadinessPolicy,
    pub timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self { policy: ReadinessPolicy::None, timeout: Duration::from_secs(90) }
    }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub probe: Commandline,
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub degrade_after: u32,
    pub fail_after: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Mount,
    Pid,
    Net,
    Uts,
    Ipc,
    User,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    pub memory_max: Option<u64>,
    pub memory_high: Option<u64>,
    pub cpu_weight: Option<u32>,
    pub cpu_max: Option<f64>,
    pub io_weight: Option<u32>,
    pub pids_max: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct IsolationProfile {
    pub resources: ResourceLimits,
    pub namespaces: Vec<Namespace>,
    pub hostname: Option<String>,
    pub root: Option<PathBuf>,
}

impl IsolationProfile {
    pub fn is_trivial(&self) -> bool {
        self.resources.memory_max.is_none()
            && self.resources.memory_high.is_none()
            && self.resources.cpu_weight.is_none()
            && self.resources.cpu_max.is_none()
            && self.resources.io_weight.is_none()
            && self.resources.pids_max.is_none()
            && self.namespaces.is_empty()
            && self.hostname.is_none()
            && self.root.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStrategy {
    Restart,
    FdPassing,
    CheckpointRestore,
}

/// Sliding window of recent start timestamps plus the current exponential
/// backoff index, per spec §4.2 "Restart rate limiting".
#[derive(Debug, Clone)]
pub struct RestartAccounting {
    window: Duration,
    max_starts: u32,
    ring: VecDeque<Instant>,
    backoff_index: usize,
    active_since: Option<Instant>,
}

/// 30s, 60s, 120s, 300s, capped at 300s (spec §4.2).
const BACKOFF_SEQUENCE: &[Duration] = &[
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(120),
    Duration::from_secs(300),
];

impl RestartAccounting {
    pub fn new(window: Duration, max_starts: u32) -> Self {
        Self { window, max_starts, ring: VecDeque::new(), backoff_index: 0, active_since: None }
    }

    /// Prunes expired entries and returns the delay to wait before the next
    /// restart may be attempted, given `now`. `Duration::ZERO` means
    /// immediate.
    pub fn next_restart_delay(&mut self, now: Instant) -> Duration {
        self.prune(now);
        if (self.ring.len() as u32) < self.max_starts {
            return Duration::ZERO;
        }
        let idx = self.backoff_index.min(BACKOFF_SEQUENCE.len() - 1);
        BACKOFF_SEQUENCE[idx]
    }

    /// Records that a start is happening now. Call right before forking.
    pub fn record_start(&mut self, now: Instant) {
        self.prune(now);
        if (self.ring.len() as u32) >= self.max_starts {
            self.backoff_index = (self.backoff_index + 1).min(BACKOFF_SEQUENCE.len() - 1);
        }
        self.ring.push_back(now);
        self.active_since = None;
    }

    /// Call when a component reaches ACTIVE. The ring and backoff index
    /// reset once that promotion has lasted longer than the window (spec
    /// §4.2: "reset on a successful promotion to ACTIVE that lasts longer
    /// than the window").
    pub fn note_active(&mut self, now: Instant) {
        self.active_since = Some(now);
    }

    /// Must be polled (e.g. on health/readiness ticks, or before the next
    /// restart decision) so a long-lived ACTIVE period resets the limiter.
    pub fn maybe_reset_after_stability(&mut self, now: Instant) {
        if let Some(since) = self.active_since {
            if now.duration_since(since) > self.window {
                self.ring.clear();
                self.backoff_index = 0;
                self.active_since = None;
            }
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.ring.front() {
            if now.duration_since(*front) > self.window {
                self.ring.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn start_count_in_window(&self) -> usize {
        self.ring.len()
    }
}

pub struct Component {
    pub name: String,
    pub kind: Kind,
    pub command: Commandline,
    pub env: HashMap<String, String>,
    pub requires_names: Vec<String>,
    pub provides_names: Vec<String>,
    pub requires: Vec<CapabilityIdx>,
    pub provides: Vec<CapabilityIdx>,
    pub state: SupervisionState,
    pub pid: Option<i32>,
    pub restart: RestartAccounting,
    pub readiness: ReadinessConfig,
    pub health: Option<HealthConfig>,
    pub isolation: IsolationProfile,
    pub upgrade_strategy: UpgradeStrategy,
    pub restart_count: u64,
    pub started_at: Option<Instant>,
    pub health_fail_streak: u32,
}

impl Component {
    pub fn provides_capability(&self, idx: CapabilityIdx) -> bool {
        self.provides.contains(&idx)
    }

    pub fn requires_capability(&self, idx: CapabilityIdx) -> bool {
        self.requires.contains(&idx)
    }
}

#[derive(Debug, Default)]
pub struct ComponentTable {
    components: Vec<Component>,
    by_name: HashMap<String, ComponentIdx>,
}

impl ComponentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, component: Component) -> ComponentIdx {
        let idx = ComponentIdx(self.components.len());
        self.by_name.insert(component.name.clone(), idx);
        self.components.push(component);
        idx
    }

    pub fn find(&self, name: &str) -> Option<ComponentIdx> {
        self.by_name.get(name).copied()
    }

    /// Unlinks `name` from the lookup table without touching the slot
    /// itself, so the `ComponentIdx` stays valid for anything still holding
    /// it (spec §9: indices are never recycled). Used when a manifest
    /// reload drops a component: it is stopped and its slot lives on,
    /// unreachable by name and excluded from future resolver passes once
    /// its state is `Inactive`.
    pub fn forget_name(&mut self, name: &str) {
        self.by_name.remove(name);
    }

    pub fn get(&self, idx: ComponentIdx) -> &Component {
        &self.components[idx.0]
    }

    pub fn get_mut(&mut self, idx: ComponentIdx) -> &mut Component {
        &mut self.components[idx.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = (ComponentIdx, &Component)> {
        self.components.iter().enumerate().map(|(i, c)| (ComponentIdx(i), c))
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_rate_limiter_allows_bursts_then_backs_off() {
        let mut acc = RestartAccounting::new(Duration::from_secs(60), 5);
        let t0 = Instant::now();
        for i in 0..5 {
            let now = t0 + Duration::from_millis(i);
            assert_eq!(acc.next_restart_delay(now), Duration::ZERO);
            acc.record_start(now);
        }
        // The 6th restart within the window should be delayed.
        let now = t0 + Duration::from_millis(10);
        assert_eq!(acc.next_restart_delay(now), Duration::from_secs(30));
    }

    #[test]
    fn restart_rate_limiter_escalates_backoff() {
        let mut acc = RestartAccounting::new(Duration::from_secs(60), 1);
        let t0 = Instant::now();
        acc.record_start(t0);
        assert_eq!(acc.next_restart_delay(t0), Duration::from_secs(30));
        acc.record_start(t0);
        assert_eq!(acc.next_restart_delay(t0), Duration::from_secs(60));
        acc.record_start(t0);
        assert_eq!(acc.next_restart_delay(t0), Duration::from_secs(120));
        acc.record_start(t0);
        assert_eq!(acc.next_restart_delay(t0), Duration::from_secs(300));
        acc.record_start(t0);
        // Capped at 300s.
        assert_eq!(acc.next_restart_delay(t0), Duration::from_secs(300));
    }

    #[test]
    fn stability_window_resets_ring_and_backoff() {
        let mut acc = RestartAccounting::new(Duration::from_secs(60), 1);
        let t0 = Instant::now();
        acc.record_start(t0);
        acc.note_active(t0);
        let later = t0 + Duration::from_secs(120);
        acc.maybe_reset_after_stability(later);
        assert_eq!(acc.start_count_in_window(), 0);
        assert_eq!(acc.next_restart_delay(later), Duration::ZERO);
    }

    #[test]
    fn old_entries_prune_out_of_the_window() {
        let mut acc = RestartAccounting::new(Duration::from_secs(10), 2);
        let t0 = Instant::now();
        acc.record_start(t0);
        acc.record_start(t0);
        let later = t0 + Duration::from_secs(20);
        assert_eq!(acc.next_restart_delay(later), Duration::ZERO);
    }
}
