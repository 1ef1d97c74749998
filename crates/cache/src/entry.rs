use std::time::Duration;
use tokio::time::Instant;

/// A cached value together with its fixed lifetime.
///
/// The expiry is absolute: it is measured from the moment the entry was
/// inserted (or last replaced by an update) and is never extended by reads.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    value: V,
    lifetime: Duration,
    inserted_at: Instant,
}

impl<V> CacheEntry<V> {
    pub(crate) fn new(value: V, lifetime: Duration, inserted_at: Instant) -> Self {
        Self {
            value,
            lifetime,
            inserted_at,
        }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    /// Total lifetime the entry was stored with.
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn inserted_at(&self) -> Instant {
        self.inserted_at
    }

    /// Instant at which the entry stops being observable, or `None` when the
    /// lifetime is too large to represent (the entry never expires).
    pub fn expires_at(&self) -> Option<Instant> {
        self.inserted_at.checked_add(self.lifetime)
    }

    /// Time left before expiry, saturating at zero.
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.expires_at() {
            Some(deadline) => deadline.saturating_duration_since(now),
            None => Duration::MAX,
        }
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at().is_some_and(|deadline| now >= deadline)
    }

    pub(crate) fn into_value(self) -> V {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_exclusive_of_deadline() {
        let start = Instant::now();
        let entry = CacheEntry::new("v", Duration::from_millis(100), start);

        assert!(!entry.is_expired_at(start));
        assert!(!entry.is_expired_at(start + Duration::from_millis(99)));
        assert!(entry.is_expired_at(start + Duration::from_millis(100)));
        assert_eq!(entry.remaining(start + Duration::from_millis(40)), Duration::from_millis(60));
        assert_eq!(entry.remaining(start + Duration::from_secs(5)), Duration::ZERO);
    }

    #[test]
    fn unrepresentable_deadline_never_expires() {
        let start = Instant::now();
        let entry = CacheEntry::new(1u8, Duration::MAX, start);

        assert_eq!(entry.expires_at(), None);
        assert!(!entry.is_expired_at(start + Duration::from_secs(3600 * 24 * 365)));
        assert_eq!(entry.remaining(start), Duration::MAX);
    }
}
