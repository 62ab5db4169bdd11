use std::time::Duration;
use tokio::time::Instant;

/// Coalesces save requests into at most one pending save that runs once
/// the index has been idle for `idle`
#[derive(Debug)]
pub struct SaveScheduler {
    idle: Duration,
    deadline: Option<Instant>,
}

impl SaveScheduler {
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            deadline: None,
        }
    }

    pub fn set_idle(&mut self, idle: Duration) {
        self.idle = idle;
    }

    /// Note a change; the pending save moves out to `now + idle`
    pub fn request(&mut self, now: Instant) {
        self.deadline = Some(now + self.idle);
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True (once) when the pending save is due
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Drop the pending save, e.g. because a forced save just ran
    pub fn clear(&mut self) {
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rapid_requests_coalesce() {
        let now = Instant::now();
        let idle = Duration::from_secs(30);
        let mut scheduler = SaveScheduler::new(idle);
        assert!(!scheduler.take_due(now + idle));

        for i in 0..10 {
            scheduler.request(now + Duration::from_secs(i));
        }
        assert!(scheduler.is_pending());
        assert!(!scheduler.take_due(now + idle));
        assert!(scheduler.take_due(now + Duration::from_secs(39)));
        assert!(!scheduler.take_due(now + Duration::from_secs(100)));
    }

    #[test]
    fn test_clear() {
        let now = Instant::now();
        let mut scheduler = SaveScheduler::new(Duration::from_secs(1));
        scheduler.request(now);
        scheduler.clear();
        assert_eq!(scheduler.deadline(), None);
    }
}
