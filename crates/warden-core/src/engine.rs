//! Engine façade: observer registration, usage events, timer routing

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info};
use warden_util::{Clock, EntityId, ObserverId, Result, SystemClock, Uid, UserId, WardenError};

use crate::config::EngineConfig;
use crate::group::{GroupId, GroupKind, GroupVariant, UsageGroup};
use crate::notify::{CallbackToken, LimitNotifier};
use crate::observer::ObserverTable;
use crate::timer::{TimerKind, TimerMsg, TimerService};
use crate::user::UserState;

/// All mutable engine state, guarded by one lock.
#[derive(Default)]
struct EngineState {
    users: HashMap<UserId, UserState>,
    observers: HashMap<Uid, ObserverTable>,
}

/// Tracks cumulative foreground time of named entities per user and
/// fires notifications when an observer's budget runs out or when a
/// usage session ends.
///
/// The engine must be told when an entity enters the foreground
/// ([`Self::note_usage_start`]) and when it leaves
/// ([`Self::note_usage_stop`]). All public operations serialize on one
/// internal lock; deferred work runs on a dedicated timer thread that
/// re-validates state under the same lock before acting, so a firing
/// that races a removal is a no-op.
pub struct LimitEngine {
    state: Mutex<EngineState>,
    timers: TimerService,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn LimitNotifier>,
    config: EngineConfig,
}

impl LimitEngine {
    /// Engine on the system clock with default limits.
    pub fn new(notifier: Arc<dyn LimitNotifier>) -> Arc<Self> {
        Self::with_clock(Arc::new(SystemClock::new()), notifier, EngineConfig::default())
    }

    /// Engine on an injected clock and configuration.
    pub fn with_clock(
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn LimitNotifier>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Self::build(clock, notifier, config, true)
    }

    /// Engine whose timers are pumped explicitly; used by tests.
    #[cfg(test)]
    pub(crate) fn new_manual(
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn LimitNotifier>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Self::build(clock, notifier, config, false)
    }

    fn build(
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn LimitNotifier>,
        config: EngineConfig,
        threaded: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<LimitEngine>| {
            // The dispatch closure holds a weak handle so pending timers
            // never keep a dropped engine alive.
            let dispatch = {
                let weak = weak.clone();
                Box::new(move |msg: TimerMsg| {
                    if let Some(engine) = weak.upgrade() {
                        engine.handle_timer(msg);
                    }
                })
            };
            let timers = if threaded {
                TimerService::spawn(clock.clone(), dispatch)
            } else {
                TimerService::manual(clock.clone(), dispatch)
            };
            Self {
                state: Mutex::new(EngineState::default()),
                timers,
                clock,
                notifier,
                config,
            }
        })
    }

    /// Registers an app usage observer watching `observed` against
    /// `time_limit_ms`. An existing app observer with the same id for
    /// this uid is replaced.
    pub fn add_app_usage_observer(
        &self,
        uid: Uid,
        observer_id: ObserverId,
        observed: &[EntityId],
        time_limit_ms: u64,
        callback: CallbackToken,
        user_id: UserId,
    ) -> Result<()> {
        self.add_observer(
            uid,
            observer_id,
            observed,
            time_limit_ms,
            user_id,
            GroupKind::App,
            |id, observed| UsageGroup::new_app(id, observed, time_limit_ms, callback),
        )
    }

    /// Removes an app usage observer. No-op if absent.
    pub fn remove_app_usage_observer(&self, uid: Uid, observer_id: ObserverId, user_id: UserId) {
        self.remove_observer(uid, observer_id, GroupKind::App, user_id);
    }

    /// Registers a usage session observer. On top of the limit budget it
    /// tracks session boundaries: once usage past the limit goes idle
    /// for longer than `new_session_threshold_ms`, the session-end
    /// notification fires, and the next activation after such a gap
    /// starts a fresh session. An existing session observer with the
    /// same id for this uid is replaced.
    #[allow(clippy::too_many_arguments)]
    pub fn add_usage_session_observer(
        &self,
        uid: Uid,
        observer_id: ObserverId,
        observed: &[EntityId],
        time_limit_ms: u64,
        new_session_threshold_ms: u64,
        limit_callback: CallbackToken,
        session_end_callback: CallbackToken,
        user_id: UserId,
    ) -> Result<()> {
        self.add_observer(
            uid,
            observer_id,
            observed,
            time_limit_ms,
            user_id,
            GroupKind::Session,
            |id, observed| {
                UsageGroup::new_session(
                    id,
                    observed,
                    time_limit_ms,
                    limit_callback,
                    new_session_threshold_ms,
                    session_end_callback,
                )
            },
        )
    }

    /// Removes a usage session observer. No-op if absent.
    pub fn remove_usage_session_observer(&self, uid: Uid, observer_id: ObserverId, user_id: UserId) {
        self.remove_observer(uid, observer_id, GroupKind::Session, user_id);
    }

    fn add_observer(
        &self,
        uid: Uid,
        observer_id: ObserverId,
        observed: &[EntityId],
        time_limit_ms: u64,
        user_id: UserId,
        kind: GroupKind,
        build: impl FnOnce(GroupId, Vec<EntityId>) -> UsageGroup,
    ) -> Result<()> {
        if time_limit_ms < self.config.min_time_limit_ms {
            return Err(WardenError::invalid_argument(format!(
                "time limit {time_limit_ms}ms is below the minimum {}ms",
                self.config.min_time_limit_ms
            )));
        }
        if observed.is_empty() {
            return Err(WardenError::invalid_argument(
                "observed entity list is empty",
            ));
        }

        let mut state = self.state.lock().unwrap();
        let state = &mut *state;

        // Replace an existing registration under the same id first so it
        // does not count against the quota.
        if let Some(existing) = state
            .observers
            .get(&uid)
            .and_then(|t| t.occupant(kind, observer_id))
        {
            remove_group(state, existing, &self.timers);
            debug!(%uid, %observer_id, "replacing existing observer registration");
        }

        let registered = state.observers.get(&uid).map_or(0, |t| t.len(kind));
        if registered >= self.config.max_observers_per_uid {
            return Err(WardenError::quota_exceeded(format!(
                "uid {uid} already has {registered} observers registered"
            )));
        }

        let id = GroupId {
            user_id,
            uid,
            observer_id,
            kind,
        };
        let now_ms = self.clock.now_ms();
        let user = state
            .users
            .entry(user_id)
            .or_insert_with(|| UserState::new(user_id));
        let mut group = build(id, observed.to_vec());
        user.add_group(id, &group.observed);

        // Kick off accounting for observed entities that are already
        // active: one start per match, mirroring the per-entity starts
        // the group would have seen had it been registered earlier.
        for i in 0..group.observed.len() {
            if user.is_active(group.observed[i].as_str()) {
                group.note_usage_start(now_ms, now_ms, &self.timers);
            }
        }

        state
            .observers
            .entry(uid)
            .or_insert_with(|| ObserverTable::new(uid))
            .insert(group);

        info!(%uid, %observer_id, %user_id, time_limit_ms, kind = ?kind, "observer registered");
        Ok(())
    }

    fn remove_observer(&self, uid: Uid, observer_id: ObserverId, kind: GroupKind, user_id: UserId) {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let Some(existing) = state
            .observers
            .get(&uid)
            .and_then(|t| t.occupant(kind, observer_id))
        else {
            return;
        };
        remove_group(state, existing, &self.timers);
        debug!(%uid, %observer_id, %user_id, kind = ?kind, "observer removed");
    }

    /// Records that `name` entered the foreground for `user_id`.
    pub fn note_usage_start(&self, name: &EntityId, user_id: UserId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let user = state
            .users
            .entry(user_id)
            .or_insert_with(|| UserState::new(user_id));
        if user.is_active(name.as_str()) {
            return Err(WardenError::state_conflict(format!(
                "unable to start usage for {name}, already in use"
            )));
        }
        let now_ms = self.clock.now_ms();
        debug!(%name, %user_id, "usage entity became active");
        for id in user.mark_active(name) {
            if let Some(group) = group_mut(&mut state.observers, id) {
                group.note_usage_start(now_ms, now_ms, &self.timers);
            }
        }
        Ok(())
    }

    /// Records that `name` left the foreground for `user_id`.
    pub fn note_usage_stop(&self, name: &EntityId, user_id: UserId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let user = state
            .users
            .entry(user_id)
            .or_insert_with(|| UserState::new(user_id));
        if !user.is_active(name.as_str()) {
            return Err(WardenError::state_conflict(format!(
                "unable to stop usage for {name}, not in use"
            )));
        }
        let now_ms = self.clock.now_ms();
        debug!(%name, %user_id, "usage entity became inactive");
        for id in user.mark_inactive(name) {
            if let Some(group) = group_mut(&mut state.observers, id) {
                group.note_usage_stop(now_ms, &self.timers);
            }
        }
        Ok(())
    }

    /// Drops per-user state when a user is removed. Observer
    /// registrations made by that user's clients survive; any of their
    /// timers still in flight resolve against current state and no-op.
    pub fn on_user_removed(&self, user_id: UserId) {
        let mut state = self.state.lock().unwrap();
        // TODO: cancel pending timers for this user's groups so a firing
        // cannot observe a user re-created under the same id.
        if state.users.remove(&user_id).is_some() {
            info!(%user_id, "user state dropped");
        }
    }

    /// Writes a diagnostic snapshot of all users and observer tables.
    pub fn dump(&self, w: &mut dyn io::Write) -> io::Result<()> {
        let state = self.state.lock().unwrap();
        writeln!(w, "usage limits:")?;

        let mut user_ids: Vec<_> = state.users.keys().copied().collect();
        user_ids.sort_unstable();
        for user_id in user_ids {
            state.users[&user_id].dump(w)?;
        }

        let mut uids: Vec<_> = state.observers.keys().copied().collect();
        uids.sort_unstable();
        for uid in uids {
            state.observers[&uid].dump(w)?;
        }
        Ok(())
    }

    fn handle_timer(&self, msg: TimerMsg) {
        match msg.kind {
            TimerKind::CheckTimeout => self.handle_check_timeout(msg.group),
            TimerKind::LimitReached => self.handle_limit_reached(msg.group),
            TimerKind::SessionEnd => self.handle_session_end(msg.group),
        }
    }

    fn handle_check_timeout(&self, id: GroupId) {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let Some(group) = group_mut(&mut state.observers, id) else {
            return;
        };
        let Some(user) = state.users.get(&id.user_id) else {
            return;
        };
        let any_observed_active = user.is_any_active(&group.observed);
        group.check_timeout(self.clock.now_ms(), any_observed_active, &self.timers);
    }

    fn handle_limit_reached(&self, id: GroupId) {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let Some(group) = group_mut(&mut state.observers, id) else {
            return;
        };
        if state.users.contains_key(&id.user_id) {
            info!(
                observer_id = %id.observer_id,
                user_id = %id.user_id,
                time_limit_ms = group.time_limit_ms,
                time_elapsed_ms = group.usage_time_ms,
                "usage limit reached"
            );
            self.notifier.on_limit_reached(
                id.observer_id,
                id.user_id,
                group.time_limit_ms,
                group.usage_time_ms,
                &group.limit_callback,
            );
        }
        if id.kind == GroupKind::App {
            // App observers fire once; unregister after informing.
            remove_group(state, id, &self.timers);
        }
    }

    fn handle_session_end(&self, id: GroupId) {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let Some(group) = group_mut(&mut state.observers, id) else {
            return;
        };
        if !state.users.contains_key(&id.user_id) {
            return;
        }
        let GroupVariant::Session { end_callback, .. } = &group.variant else {
            return;
        };
        info!(
            observer_id = %id.observer_id,
            user_id = %id.user_id,
            time_elapsed_ms = group.usage_time_ms,
            "session ended"
        );
        self.notifier
            .on_session_end(id.observer_id, id.user_id, group.usage_time_ms, end_callback);
    }
}

/// Resolves a timer key against the live tables. The full key must
/// match: a slot re-registered for another user rejects stale firings.
fn group_mut(
    observers: &mut HashMap<Uid, ObserverTable>,
    id: GroupId,
) -> Option<&mut UsageGroup> {
    let group = observers.get_mut(&id.uid)?.get_mut(id.kind, id.observer_id)?;
    if group.id == id { Some(group) } else { None }
}

/// Two-sided removal: detach from the user's index, drop from the
/// observer table (evicting the table if it emptied), and cancel every
/// pending timer for the key so a removed group can never fire.
fn remove_group(state: &mut EngineState, id: GroupId, timers: &TimerService) {
    let Some(table) = state.observers.get_mut(&id.uid) else {
        return;
    };
    let Some(group) = table.remove(id.kind, id.observer_id) else {
        return;
    };
    if table.is_empty() {
        state.observers.remove(&id.uid);
    }
    if let Some(user) = state.users.get_mut(&id.user_id) {
        user.remove_group(id, &group.observed);
    }
    timers.cancel(TimerKind::CheckTimeout, id);
    timers.cancel(TimerKind::LimitReached, id);
    timers.cancel(TimerKind::SessionEnd, id);
}

#[cfg(test)]
impl LimitEngine {
    /// Delivers every timer entry currently due.
    pub(crate) fn pump_timers(&self) -> usize {
        self.timers.fire_due()
    }

    /// `(actives, usage_time_ms)` for a registered group.
    pub(crate) fn group_snapshot(
        &self,
        uid: Uid,
        observer_id: ObserverId,
        kind: GroupKind,
    ) -> Option<(i32, u64)> {
        let state = self.state.lock().unwrap();
        state
            .observers
            .get(&uid)?
            .get(kind, observer_id)
            .map(|g| (g.actives, g.usage_time_ms))
    }

    /// Asserts that every live group's `actives` equals the number of
    /// its observed entities currently active for its user.
    pub(crate) fn check_actives_invariant(&self) {
        let state = self.state.lock().unwrap();
        for table in state.observers.values() {
            for group in table.groups() {
                let Some(user) = state.users.get(&group.id.user_id) else {
                    continue;
                };
                let expected = group
                    .observed
                    .iter()
                    .filter(|e| user.is_active(e.as_str()))
                    .count() as i32;
                assert_eq!(
                    group.actives, expected,
                    "actives drift for observer {}",
                    group.id.observer_id
                );
            }
        }
    }
}
