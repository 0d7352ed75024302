//! Small time-boxed value cache for per-process state such as the trusted
//! author list and the latest baseline label.

use chrono::{DateTime, Duration, Utc};

/// A single cached value with an absolute expiry.
///
/// `ttl = None` keeps the value until [`invalidate`](Self::invalidate).
#[derive(Debug, Clone)]
pub struct TimedCache<T> {
    ttl: Option<Duration>,
    slot: Option<Entry<T>>,
}

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    expires: Option<DateTime<Utc>>,
}

impl<T> Entry<T> {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_none_or(|at| now < at)
    }
}

impl<T> TimedCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            slot: None,
        }
    }

    /// Cache that only refreshes on explicit invalidation.
    pub fn until_invalidated() -> Self {
        Self { ttl: None, slot: None }
    }

    pub fn from_secs(secs: u64) -> Self {
        let secs = i64::try_from(secs).unwrap_or(i64::MAX);
        Self::new(Duration::try_seconds(secs).unwrap_or(Duration::MAX))
    }

    /// The cached value if it has not expired at `now`.
    pub fn get(&self, now: DateTime<Utc>) -> Option<&T> {
        self.slot
            .as_ref()
            .filter(|entry| entry.is_fresh(now))
            .map(|entry| &entry.value)
    }

    pub fn insert(&mut self, value: T, now: DateTime<Utc>) -> &T {
        let entry = self.entry(value, now);
        &self.slot.insert(entry).value
    }

    /// Return the cached value, calling `refresh` first when it is missing
    /// or stale. A failed refresh leaves the old entry in place.
    pub fn get_or_try_refresh<E>(
        &mut self,
        now: DateTime<Utc>,
        refresh: impl FnOnce() -> Result<T, E>,
    ) -> Result<&T, E> {
        let entry = match self.slot.take() {
            Some(entry) if entry.is_fresh(now) => entry,
            previous => match refresh() {
                Ok(value) => self.entry(value, now),
                Err(e) => {
                    self.slot = previous;
                    return Err(e);
                }
            },
        };
        Ok(&self.slot.insert(entry).value)
    }

    fn entry(&self, value: T, now: DateTime<Utc>) -> Entry<T> {
        Entry {
            value,
            expires: self.ttl.and_then(|ttl| now.checked_add_signed(ttl)),
        }
    }

    pub fn invalidate(&mut self) {
        self.slot = None;
    }
}
