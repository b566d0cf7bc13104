//! The health monitor (spec §2 C7, §4.6).

/// What the supervisor should do in response to a health probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    NoChange,
    Degrade,
    Fail,
    RecoverToActive,
}

/// Applies one probe result to the running failure-streak counter and
/// returns the resulting transition, per spec §4.6's threshold rules:
/// `d` consecutive failures while ACTIVE degrades; `f` additional
/// consecutive failures while DEGRADED fails; a single success while
/// DEGRADED recovers and resets both counters.
pub fn apply_probe_result(
    currently_degraded: bool,
    fail_streak: &mut u32,
    degrade_after: u32,
    fail_after: u32,
    success: bool,
) -> HealthOutcome {
    if success {
        let was_degraded = currently_degraded;
        *fail_streak = 0;
        return if was_degraded { HealthOutcome::RecoverToActive } else { HealthOutcome::NoChange };
    }

    *fail_streak += 1;

    if !currently_degraded {
        if *fail_streak >= degrade_after {
            *fail_streak = 0;
            return HealthOutcome::Degrade;
        }
        return HealthOutcome::NoChange;
    }

    if *fail_streak >= fail_after {
        return HealthOutcome::Fail;
    }
    HealthOutcome::NoChange
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degrades_after_d_consecutive_failures() {
        let mut streak = 0;
        assert_eq!(apply_probe_result(false, &mut streak, 3, 2, false), HealthOutcome::NoChange);
        assert_eq!(apply_probe_result(false, &mut streak, 3, 2, false), HealthOutcome::NoChange);
        assert_eq!(apply_probe_result(false, &mut streak, 3, 2, false), HealthOutcome::Degrade);
    }

    #[test]
    fn fails_after_f_additional_failures_while_degraded() {
        let mut streak = 0;
        assert_eq!(apply_probe_result(true, &mut streak, 3, 2, false), HealthOutcome::NoChange);
        assert_eq!(apply_probe_result(true, &mut streak, 3, 2, false), HealthOutcome::Fail);
    }

    #[test]
    fn single_success_while_degraded_recovers_and_resets() {
        let mut streak = 1;
        assert_eq!(apply_probe_result(true, &mut streak, 3, 2, true), HealthOutcome::RecoverToActive);
        assert_eq!(streak, 0);
    }

    #[test]
    fn success_while_active_is_a_no_op() {
        let mut streak = 0;
        assert_eq!(apply_probe_result(false, &mut streak, 3, 2, true), HealthOutcome::NoChange);
    }
}
