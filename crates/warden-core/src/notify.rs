//! Notification sink and the opaque callback token

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use warden_util::{ObserverId, UserId};

/// Client-supplied token handed back unchanged with each notification.
///
/// The engine never looks inside the payload; it only clones the handle
/// and returns it through [`LimitNotifier`]. The host decides what a
/// token means (an IPC handle, a queue id, ...).
#[derive(Clone)]
pub struct CallbackToken(Arc<dyn Any + Send + Sync>);

impl CallbackToken {
    pub fn new<T: Any + Send + Sync>(payload: T) -> Self {
        Self(Arc::new(payload))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for CallbackToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackToken").finish_non_exhaustive()
    }
}

/// Sink for deferred engine notifications.
///
/// Callbacks run on the timer thread while the engine lock is held, so
/// implementations must return quickly and must not call back into the
/// engine. Delivery is best-effort; the engine does not observe the
/// outcome.
pub trait LimitNotifier: Send + Sync {
    /// A group's accumulated usage reached its time limit.
    fn on_limit_reached(
        &self,
        observer_id: ObserverId,
        user_id: UserId,
        time_limit_ms: u64,
        time_elapsed_ms: u64,
        callback: &CallbackToken,
    );

    /// Idle time after a limit-exceeding session persisted past the
    /// session threshold.
    fn on_session_end(
        &self,
        observer_id: ObserverId,
        user_id: UserId,
        time_elapsed_ms: u64,
        callback: &CallbackToken,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips_payload() {
        let token = CallbackToken::new(42u32);
        assert_eq!(token.downcast_ref::<u32>(), Some(&42));
        assert_eq!(token.downcast_ref::<String>(), None);

        let cloned = token.clone();
        assert_eq!(cloned.downcast_ref::<u32>(), Some(&42));
    }
}
