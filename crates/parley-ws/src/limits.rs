use crate::GatewayConfig;
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use parley_models::gateway::{SignalKind, EVENT_HEARTBEAT, EVENT_TYPING};
use parley_models::UserId;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Global and per-user connection caps.
pub(crate) struct ConnectionSlots {
    active: AtomicUsize,
    per_user: DashMap<UserId, usize>,
    max_global: usize,
    max_per_user: usize,
}

impl ConnectionSlots {
    pub(crate) fn new(max_global: usize, max_per_user: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            per_user: DashMap::new(),
            max_global,
            max_per_user,
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Claim a global slot, released when the guard drops.
    pub(crate) fn try_acquire(self: &Arc<Self>) -> Option<ConnectionGuard> {
        let mut current = self.active.load(Ordering::SeqCst);
        loop {
            if current >= self.max_global {
                return None;
            }
            match self.active.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(ConnectionGuard {
                        slots: self.clone(),
                        user_id: None,
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    fn try_acquire_user(&self, user_id: UserId) -> bool {
        let mut count = self.per_user.entry(user_id).or_insert(0);
        if *count >= self.max_per_user {
            return false;
        }
        *count += 1;
        true
    }

    fn release_user(&self, user_id: UserId) {
        if let Some(mut count) = self.per_user.get_mut(&user_id) {
            if *count <= 1 {
                drop(count);
                self.per_user.remove(&user_id);
            } else {
                *count -= 1;
            }
        }
    }
}

pub(crate) struct ConnectionGuard {
    slots: Arc<ConnectionSlots>,
    user_id: Option<UserId>,
}

impl ConnectionGuard {
    /// Count this connection against `user_id`. False when the user is at
    /// their cap.
    pub(crate) fn bind_user(&mut self, user_id: UserId) -> bool {
        if !self.slots.try_acquire_user(user_id) {
            return false;
        }
        self.user_id = Some(user_id);
        true
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(user_id) = self.user_id.take() {
            self.slots.release_user(user_id);
        }
        self.slots.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Which limiter an inbound event counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventClass {
    Heartbeat,
    Typing,
    Signal,
    Other,
}

impl EventClass {
    pub(crate) fn of(event: &str) -> Self {
        match event {
            EVENT_HEARTBEAT => Self::Heartbeat,
            EVENT_TYPING => Self::Typing,
            name if SignalKind::from_event(name).is_some() => Self::Signal,
            _ => Self::Other,
        }
    }

    /// Over-limit events of this class are dropped without telling the client.
    pub(crate) fn drops_silently(self) -> bool {
        self == Self::Typing
    }
}

/// Limiters keyed by user so extra tabs do not buy extra budget.
pub(crate) struct UserRateLimits {
    /// Every event except heartbeats.
    events: DefaultKeyedRateLimiter<UserId>,
    typing: DefaultKeyedRateLimiter<UserId>,
    signals: DefaultKeyedRateLimiter<UserId>,
}

fn per_minute(n: u32) -> Quota {
    Quota::per_minute(NonZeroU32::new(n).unwrap_or(NonZeroU32::MIN))
}

impl UserRateLimits {
    pub(crate) fn new(config: &GatewayConfig) -> Self {
        Self {
            events: RateLimiter::keyed(per_minute(config.events_per_minute)),
            typing: RateLimiter::keyed(per_minute(config.typing_per_minute)),
            signals: RateLimiter::keyed(per_minute(config.signals_per_minute)),
        }
    }

    /// `Err(retry_after_ms)` when the user is over a limit.
    pub(crate) fn check(&self, user_id: UserId, class: EventClass) -> Result<(), u64> {
        if class == EventClass::Heartbeat {
            return Ok(());
        }
        let now = DefaultClock::default().now();

        if let Err(not_until) = self.events.check_key(&user_id) {
            return Err(not_until.wait_time_from(now).as_millis().max(1) as u64);
        }
        let not_until = match class {
            EventClass::Typing => self.typing.check_key(&user_id).err(),
            EventClass::Signal => self.signals.check_key(&user_id).err(),
            EventClass::Heartbeat | EventClass::Other => None,
        };
        match not_until {
            Some(not_until) => Err(not_until.wait_time_from(now).as_millis().max(1) as u64),
            None => Ok(()),
        }
    }

    pub(crate) fn prune(&self) {
        for limiter in [&self.events, &self.typing, &self.signals] {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_events() {
        assert_eq!(EventClass::of("heartbeat"), EventClass::Heartbeat);
        assert_eq!(EventClass::of("typing"), EventClass::Typing);
        assert_eq!(EventClass::of("ice-candidate"), EventClass::Signal);
        assert_eq!(EventClass::of("call-offer"), EventClass::Signal);
        assert_eq!(EventClass::of("send-message"), EventClass::Other);
        assert!(EventClass::Typing.drops_silently());
        assert!(!EventClass::Signal.drops_silently());
    }

    #[test]
    fn limits_are_per_user_and_skip_heartbeats() {
        let limits = UserRateLimits::new(&GatewayConfig {
            events_per_minute: 3,
            typing_per_minute: 1,
            ..GatewayConfig::default()
        });

        assert!(limits.check(1, EventClass::Typing).is_ok());
        let retry = limits.check(1, EventClass::Typing).unwrap_err();
        assert!(retry > 0);
        assert!(limits.check(1, EventClass::Other).is_ok());
        assert!(limits.check(1, EventClass::Other).is_err());
        for _ in 0..10 {
            assert!(limits.check(1, EventClass::Heartbeat).is_ok());
        }
        assert!(limits.check(2, EventClass::Other).is_ok());
    }

    #[test]
    fn slots_enforce_caps_and_release_on_drop() {
        let slots = Arc::new(ConnectionSlots::new(3, 2));
        let mut first = slots.try_acquire().unwrap();
        let mut second = slots.try_acquire().unwrap();
        let mut third = slots.try_acquire().unwrap();
        assert!(slots.try_acquire().is_none());

        assert!(first.bind_user(7));
        assert!(second.bind_user(7));
        assert!(!third.bind_user(7));
        assert!(third.bind_user(8));

        drop(first);
        assert_eq!(slots.active(), 2);
        let mut again = slots.try_acquire().unwrap();
        assert!(again.bind_user(7));

        drop((second, third, again));
        assert_eq!(slots.active(), 0);
        assert!(slots.per_user.is_empty());
    }
}
