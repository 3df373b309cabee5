//! Host-owned session state for idle auto-lock.
//!
//! The engine never schedules anything itself. The host records activity
//! with [`SessionState::touch`] and periodically calls
//! `WalletEngine::enforce_idle_lock`.

use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct SessionState {
    idle_timeout: Duration,
    last_activity: Instant,
}

impl SessionState {
    /// A zero timeout disables auto-lock.
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.touch_at(Instant::now());
    }

    pub fn touch_at(&mut self, now: Instant) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        !self.idle_timeout.is_zero() && now.saturating_duration_since(self.last_activity) >= self.idle_timeout
    }

    /// Time left before the session counts as idle.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.idle_timeout
            .saturating_sub(now.saturating_duration_since(self.last_activity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_after_timeout() {
        let session = SessionState::new(Duration::from_secs(60));
        let start = session.last_activity();
        assert!(!session.is_idle(start + Duration::from_secs(59)));
        assert!(session.is_idle(start + Duration::from_secs(60)));
        assert_eq!(session.remaining(start + Duration::from_secs(45)), Duration::from_secs(15));
    }

    #[test]
    fn touch_resets_clock() {
        let mut session = SessionState::new(Duration::from_secs(60));
        let start = session.last_activity();
        session.touch_at(start + Duration::from_secs(50));
        assert!(!session.is_idle(start + Duration::from_secs(100)));
        assert!(session.is_idle(start + Duration::from_secs(110)));
    }

    #[test]
    fn touch_never_moves_backwards() {
        let mut session = SessionState::new(Duration::from_secs(60));
        let start = session.last_activity();
        session.touch_at(start + Duration::from_secs(30));
        session.touch_at(start);
        assert_eq!(session.last_activity(), start + Duration::from_secs(30));
    }

    #[test]
    fn zero_timeout_never_idles() {
        let session = SessionState::new(Duration::ZERO);
        assert!(!session.is_idle(session.last_activity() + Duration::from_secs(86_400)));
    }
}
