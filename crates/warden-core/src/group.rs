//! Observer state machines: accounting, limit detection, session rollover

use std::io;

use tracing::warn;
use warden_util::{EntityId, ObserverId, Uid, UserId};

use crate::notify::CallbackToken;
use crate::timer::{TimerKind, TimerService};

/// Which observer family a group belongs to. The two families keep
/// disjoint observer-id namespaces per uid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum GroupKind {
    App,
    Session,
}

/// Stable key for a group: owning user, registering uid, observer id,
/// family. Timer payloads carry this key instead of a reference; the
/// handler resolves it under the engine lock, and a missing or
/// re-occupied slot means the firing is stale and does nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct GroupId {
    pub user_id: UserId,
    pub uid: Uid,
    pub observer_id: ObserverId,
    pub kind: GroupKind,
}

/// Variant-specific state.
#[derive(Debug)]
pub(crate) enum GroupVariant {
    App,
    Session {
        /// When the group last went fully inactive.
        last_usage_end_ms: u64,
        /// Idle gap that separates two sessions.
        new_session_threshold_ms: u64,
        end_callback: CallbackToken,
    },
}

/// One observer registration: a set of watched entities, a time budget,
/// and the accounting needed to detect the moment the budget runs out.
#[derive(Debug)]
pub(crate) struct UsageGroup {
    pub id: GroupId,
    pub observed: Vec<EntityId>,
    pub time_limit_ms: u64,
    pub usage_time_ms: u64,
    /// Count of concurrently active observed entities. Signed so that
    /// unbalanced reports can be detected, clamped, and logged.
    pub actives: i32,
    /// Timestamp at which `actives` last rose from zero.
    pub last_known_usage_ms: u64,
    pub limit_callback: CallbackToken,
    pub variant: GroupVariant,
}

impl UsageGroup {
    pub fn new_app(
        id: GroupId,
        observed: Vec<EntityId>,
        time_limit_ms: u64,
        limit_callback: CallbackToken,
    ) -> Self {
        Self {
            id,
            observed,
            time_limit_ms,
            usage_time_ms: 0,
            actives: 0,
            last_known_usage_ms: 0,
            limit_callback,
            variant: GroupVariant::App,
        }
    }

    pub fn new_session(
        id: GroupId,
        observed: Vec<EntityId>,
        time_limit_ms: u64,
        limit_callback: CallbackToken,
        new_session_threshold_ms: u64,
        end_callback: CallbackToken,
    ) -> Self {
        Self {
            id,
            observed,
            time_limit_ms,
            usage_time_ms: 0,
            actives: 0,
            last_known_usage_ms: 0,
            limit_callback,
            variant: GroupVariant::Session {
                last_usage_end_ms: 0,
                new_session_threshold_ms,
                end_callback,
            },
        }
    }

    /// Records one activation of an observed entity.
    ///
    /// `start_ms` may precede `now_ms`; the difference is credited back
    /// when the check timeout is armed.
    pub fn note_usage_start(&mut self, start_ms: u64, now_ms: u64, timers: &TimerService) {
        let session_gate = match &self.variant {
            GroupVariant::Session {
                last_usage_end_ms,
                new_session_threshold_ms,
                ..
            } => Some((*last_usage_end_ms, *new_session_threshold_ms)),
            GroupVariant::App => None,
        };
        if let Some((last_end_ms, threshold_ms)) = session_gate
            && self.actives == 0
        {
            if start_ms.saturating_sub(last_end_ms) > threshold_ms {
                // The idle gap outlasted the threshold: a new session.
                self.usage_time_ms = 0;
            }
            timers.cancel(TimerKind::SessionEnd, self.id);
        }

        self.actives += 1;
        if self.actives == 1 {
            self.last_known_usage_ms = start_ms;
            let time_remaining_ms = self.time_limit_ms as i64 - self.usage_time_ms as i64
                + now_ms as i64
                - start_ms as i64;
            if time_remaining_ms > 0 {
                timers.post_delayed(TimerKind::CheckTimeout, self.id, time_remaining_ms as u64);
            }
        } else if self.actives as usize > self.observed.len() {
            warn!(
                observer_id = %self.id.observer_id,
                actives = self.actives,
                observed = ?self.observed,
                "too many usage starts noted"
            );
            self.actives = self.observed.len() as i32;
        }
    }

    /// Records one deactivation of an observed entity. When the group
    /// goes fully inactive the elapsed interval is committed, and
    /// crossing the limit on commit schedules the limit notification.
    pub fn note_usage_stop(&mut self, stop_ms: u64, timers: &TimerService) {
        self.actives -= 1;
        if self.actives == 0 {
            let limit_not_crossed = self.usage_time_ms < self.time_limit_ms;
            self.usage_time_ms += stop_ms.saturating_sub(self.last_known_usage_ms);
            if limit_not_crossed && self.usage_time_ms >= self.time_limit_ms {
                timers.post(TimerKind::LimitReached, self.id);
            }
            timers.cancel(TimerKind::CheckTimeout, self.id);
        } else if self.actives < 0 {
            warn!(
                observer_id = %self.id.observer_id,
                observed = ?self.observed,
                "too many usage stops noted"
            );
            self.actives = 0;
        }

        if let GroupVariant::Session {
            last_usage_end_ms,
            new_session_threshold_ms,
            ..
        } = &mut self.variant
            && self.actives == 0
        {
            *last_usage_end_ms = stop_ms;
            if self.usage_time_ms >= self.time_limit_ms {
                // Usage has ended past the limit; the session ends once
                // the idle gap reaches the threshold.
                timers.post_delayed(TimerKind::SessionEnd, self.id, *new_session_threshold_ms);
            }
        }
    }

    /// Re-examines a running group when its armed deadline fires.
    ///
    /// `any_observed_active` is the caller's reading of the user's active
    /// set; a stop that raced this firing makes it false and the firing
    /// is dropped.
    pub fn check_timeout(&mut self, now_ms: u64, any_observed_active: bool, timers: &TimerService) {
        let time_remaining_ms = self.time_limit_ms as i64 - self.usage_time_ms as i64;
        // Already reached the limit, nothing left to report.
        if time_remaining_ms <= 0 {
            return;
        }
        if !any_observed_active {
            return;
        }
        let time_used_ms = now_ms.saturating_sub(self.last_known_usage_ms);
        if time_remaining_ms as u64 <= time_used_ms {
            self.usage_time_ms += time_used_ms;
            self.last_known_usage_ms = now_ms;
            timers.post(TimerKind::LimitReached, self.id);
        } else {
            // Not there yet. The interim usage stays uncommitted; the
            // stop path recomputes it from last_known_usage_ms.
            timers.post_delayed(
                TimerKind::CheckTimeout,
                self.id,
                time_remaining_ms as u64 - time_used_ms,
            );
        }
    }

    pub fn dump(&self, w: &mut dyn io::Write) -> io::Result<()> {
        let observed = self
            .observed
            .iter()
            .map(|e| e.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        write!(
            w,
            "    group id={} limit_ms={} used_ms={} last_known_ms={} actives={} observed=[{}]",
            self.id.observer_id,
            self.time_limit_ms,
            self.usage_time_ms,
            self.last_known_usage_ms,
            self.actives,
            observed,
        )?;
        if let GroupVariant::Session {
            last_usage_end_ms,
            new_session_threshold_ms,
            ..
        } = &self.variant
        {
            write!(
                w,
                " last_usage_end_ms={last_usage_end_ms} session_threshold_ms={new_session_threshold_ms}"
            )?;
        }
        writeln!(w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use warden_util::ManualClock;

    fn test_group_id(kind: GroupKind) -> GroupId {
        GroupId {
            user_id: UserId::new(0),
            uid: Uid::new(100),
            observer_id: ObserverId::new(1),
            kind,
        }
    }

    fn recording_timers(clock: Arc<ManualClock>) -> (TimerService, Arc<Mutex<Vec<TimerKind>>>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let timers = TimerService::manual(
            clock,
            Box::new(move |msg| sink.lock().unwrap().push(msg.kind)),
        );
        (timers, fired)
    }

    #[test]
    fn actives_clamped_on_extra_starts() {
        let clock = Arc::new(ManualClock::new());
        let (timers, _fired) = recording_timers(clock);
        let mut group = UsageGroup::new_app(
            test_group_id(GroupKind::App),
            vec![EntityId::new("a")],
            60_000,
            CallbackToken::new(()),
        );

        group.note_usage_start(0, 0, &timers);
        group.note_usage_start(0, 0, &timers);

        assert_eq!(group.actives, 1);
    }

    #[test]
    fn actives_clamped_on_extra_stops() {
        let clock = Arc::new(ManualClock::new());
        let (timers, fired) = recording_timers(clock.clone());
        let mut group = UsageGroup::new_app(
            test_group_id(GroupKind::App),
            vec![EntityId::new("a")],
            60_000,
            CallbackToken::new(()),
        );

        group.note_usage_stop(1_000, &timers);

        assert_eq!(group.actives, 0);
        clock.set_ms(120_000);
        timers.fire_due();
        assert!(fired.lock().unwrap().is_empty());
    }

    #[test]
    fn back_credit_extends_the_armed_deadline() {
        let clock = Arc::new(ManualClock::starting_at(4_000));
        let (timers, fired) = recording_timers(clock.clone());
        let mut group = UsageGroup::new_app(
            test_group_id(GroupKind::App),
            vec![EntityId::new("a")],
            60_000,
            CallbackToken::new(()),
        );

        // Start reported 3s before "now": the armed delay is the full
        // budget plus the 3s credit, so the deadline lands at 67s.
        group.note_usage_start(1_000, 4_000, &timers);

        clock.set_ms(66_999);
        timers.fire_due();
        assert!(fired.lock().unwrap().is_empty());

        clock.set_ms(67_000);
        timers.fire_due();
        assert_eq!(&*fired.lock().unwrap(), &[TimerKind::CheckTimeout]);
    }

    #[test]
    fn no_check_timeout_when_budget_exhausted() {
        let clock = Arc::new(ManualClock::new());
        let (timers, fired) = recording_timers(clock.clone());
        let mut group = UsageGroup::new_session(
            test_group_id(GroupKind::Session),
            vec![EntityId::new("a")],
            60_000,
            CallbackToken::new(()),
            30_000,
            CallbackToken::new(()),
        );
        group.usage_time_ms = 60_000;
        if let GroupVariant::Session {
            last_usage_end_ms, ..
        } = &mut group.variant
        {
            *last_usage_end_ms = 50_000;
        }

        // Gap below the threshold keeps the session; nothing to arm.
        clock.set_ms(60_000);
        group.note_usage_start(60_000, 60_000, &timers);
        assert_eq!(group.usage_time_ms, 60_000);

        clock.set_ms(500_000);
        timers.fire_due();
        assert!(fired.lock().unwrap().is_empty());
    }
}
