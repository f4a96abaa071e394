use std::time::Duration;

use tokio::time::Instant;

use crate::entity::EntityId;
use crate::map::geo::Coordinate;

/// Enough to put a relocated entity back where it was.
#[derive(Debug, Clone, PartialEq)]
pub struct UndoRecord {
    pub entity_id: EntityId,
    pub name: String,
    pub origin: Coordinate,
    pub moved_to: Coordinate,
    pub expires_at: Instant,
}

/// Holds at most one live [`UndoRecord`]; a newer commit replaces it.
#[derive(Debug)]
pub struct UndoSlot {
    record: Option<UndoRecord>,
    window: Duration,
}

impl UndoSlot {
    pub fn new(window: Duration) -> Self {
        Self { record: None, window }
    }

    pub fn replace(&mut self, entity_id: EntityId, name: String, origin: Coordinate, moved_to: Coordinate, now: Instant) -> Option<UndoRecord> {
        self.record.replace(UndoRecord {
            entity_id,
            name,
            origin,
            moved_to,
            expires_at: now + self.window,
        })
    }

    /// The live record, if it has not expired by `now`.
    pub fn current(&self, now: Instant) -> Option<&UndoRecord> {
        self.record.as_ref().filter(|r| r.expires_at > now)
    }

    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.current(now).map(|r| r.expires_at - now)
    }

    /// Drops the record once its window has passed.
    pub fn expire(&mut self, now: Instant) -> Option<UndoRecord> {
        if self.record.as_ref().is_some_and(|r| r.expires_at <= now) {
            return self.record.take();
        }
        None
    }

    pub fn dismiss(&mut self) -> Option<UndoRecord> {
        self.record.take()
    }

    /// Removes the live record so it can be undone.
    pub fn take(&mut self, now: Instant) -> Option<UndoRecord> {
        self.expire(now);
        self.record.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_with_record(now: Instant) -> UndoSlot {
        let mut slot = UndoSlot::new(Duration::from_secs(15));
        slot.replace("a".into(), "Alpha".into(), Coordinate::new(1.0, 1.0), Coordinate::new(2.0, 2.0), now);
        slot
    }

    #[test]
    fn record_expires_after_window() {
        let now = Instant::now();
        let mut slot = slot_with_record(now);
        assert!(slot.current(now + Duration::from_secs(14)).is_some());
        assert_eq!(slot.remaining(now + Duration::from_secs(10)), Some(Duration::from_secs(5)));
        assert!(slot.expire(now + Duration::from_secs(14)).is_none());
        let gone = slot.expire(now + Duration::from_millis(15_001));
        assert_eq!(gone.unwrap().entity_id, "a");
        assert!(slot.current(now).is_none());
    }

    #[test]
    fn new_commit_replaces_record() {
        let now = Instant::now();
        let mut slot = slot_with_record(now);
        let old = slot.replace("b".into(), "Beta".into(), Coordinate::new(3.0, 3.0), Coordinate::new(4.0, 4.0), now);
        assert_eq!(old.unwrap().entity_id, "a");
        assert_eq!(slot.current(now).unwrap().entity_id, "b");
    }

    #[test]
    fn take_after_expiry_is_empty() {
        let now = Instant::now();
        let mut slot = slot_with_record(now);
        assert!(slot.take(now + Duration::from_secs(16)).is_none());
        let mut slot = slot_with_record(now);
        assert!(slot.take(now + Duration::from_secs(1)).is_some());
        assert!(slot.dismiss().is_none());
    }
}
