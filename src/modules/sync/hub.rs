use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use log::{debug, info};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::modules::sync::events::SyncEvent;

pub type ObserverId = u64;

struct Observer {
    room: Option<i32>,
    tx: UnboundedSender<SyncEvent>,
}

/// Per-race broadcast groups. The hub owns the room membership table and
/// routes events without ever inspecting their payload; delivery is best
/// effort and a dead observer never blocks the others.
pub struct RaceHub {
    next_id: AtomicU64,
    observers: DashMap<ObserverId, Observer>,
}

impl Default for RaceHub {
    fn default() -> Self {
        RaceHub::new()
    }
}

impl RaceHub {
    pub fn new() -> RaceHub {
        RaceHub {
            next_id: AtomicU64::new(1),
            observers: DashMap::new(),
        }
    }

    /// # register a new observer
    /// returns its handle and the channel its events arrive on. the
    /// observer is in no room until it joins one.
    pub fn register(&self) -> (ObserverId, UnboundedReceiver<SyncEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        self.observers.insert(id, Observer { room: None, tx });
        info!(target:"sync/hub", "observer {} connected", id);
        (id, rx)
    }

    /// # drop an observer entirely
    pub fn unregister(&self, observer: ObserverId) {
        self.observers.remove(&observer);
        info!(target:"sync/hub", "observer {} disconnected", observer);
    }

    /// # put an observer in a race room
    /// an observer watches at most one race at a time; joining a new room
    /// leaves the previous one.
    pub fn join(&self, observer: ObserverId, race_id: i32) {
        if let Some(mut entry) = self.observers.get_mut(&observer) {
            entry.room = Some(race_id);
            info!(target:"sync/hub", "observer {} joined race {}", observer, race_id);
        }
    }

    /// # take an observer out of a race room
    pub fn leave(&self, observer: ObserverId, race_id: i32) {
        if let Some(mut entry) = self.observers.get_mut(&observer) {
            if entry.room == Some(race_id) {
                entry.room = None;
                info!(target:"sync/hub", "observer {} left race {}", observer, race_id);
            }
        }
    }

    pub fn room_of(&self, observer: ObserverId) -> Option<i32> {
        self.observers.get(&observer).and_then(|entry| entry.room)
    }

    /// # number of observers currently watching a race
    pub fn room_size(&self, race_id: i32) -> usize {
        self.observers
            .iter()
            .filter(|entry| entry.room == Some(race_id))
            .count()
    }

    /// # fan an event out to a race room
    /// every member except the originator receives it; the originator
    /// already applied the mutation locally and must not re-process its own
    /// echo. send failures are logged and skipped, never propagated: the
    /// channel is a best-effort notification path, not part of the write.
    pub fn broadcast(&self, race_id: i32, event: SyncEvent, exclude: Option<ObserverId>) {
        let mut stale: Vec<ObserverId> = Vec::new();

        for entry in self.observers.iter() {
            let id = *entry.key();
            if entry.room != Some(race_id) || Some(id) == exclude {
                continue;
            }

            if entry.tx.send(event.clone()).is_err() {
                debug!(target:"sync/hub", "observer {} is gone, dropping from race {}", id, race_id);
                stale.push(id);
            }
        }

        for id in stale {
            self.observers.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(race_id: i32) -> SyncEvent {
        SyncEvent::RaceStarted {
            race_id,
            start_time: 1_749_800_000_000,
            current_stint_start: 1_749_800_000_000,
        }
    }

    #[tokio::test]
    async fn events_reach_the_room_but_not_the_originator() {
        let hub = RaceHub::new();
        let (a, mut rx_a) = hub.register();
        let (b, mut rx_b) = hub.register();
        let (c, mut rx_c) = hub.register();

        hub.join(a, 1);
        hub.join(b, 1);
        hub.join(c, 2);

        hub.broadcast(1, started(1), Some(a));

        assert_eq!(rx_b.try_recv().unwrap(), started(1));
        assert!(rx_a.try_recv().is_err(), "originator must not get its own echo");
        assert!(rx_c.try_recv().is_err(), "other rooms must stay quiet");
    }

    #[tokio::test]
    async fn joining_a_new_room_leaves_the_previous_one() {
        let hub = RaceHub::new();
        let (a, _rx_a) = hub.register();
        let (b, mut rx_b) = hub.register();

        hub.join(b, 1);
        hub.join(b, 2);

        hub.broadcast(1, started(1), Some(a));
        assert!(rx_b.try_recv().is_err());

        hub.broadcast(2, started(2), Some(a));
        assert_eq!(rx_b.try_recv().unwrap(), started(2));
        assert_eq!(hub.room_of(b), Some(2));
    }

    #[tokio::test]
    async fn leaving_stops_delivery() {
        let hub = RaceHub::new();
        let (a, _rx_a) = hub.register();
        let (b, mut rx_b) = hub.register();

        hub.join(b, 1);
        hub.leave(b, 1);

        hub.broadcast(1, started(1), Some(a));
        assert!(rx_b.try_recv().is_err());
        assert_eq!(hub.room_size(1), 0);
    }

    #[tokio::test]
    async fn a_dead_observer_never_blocks_the_others() {
        let hub = RaceHub::new();
        let (a, rx_a) = hub.register();
        let (b, mut rx_b) = hub.register();

        hub.join(a, 1);
        hub.join(b, 1);
        drop(rx_a);

        hub.broadcast(1, started(1), None);

        assert_eq!(rx_b.try_recv().unwrap(), started(1));
        // the dead observer was dropped from the table
        assert_eq!(hub.room_size(1), 1);
    }

    #[tokio::test]
    async fn unregister_removes_the_observer_from_its_room() {
        let hub = RaceHub::new();
        let (a, _rx_a) = hub.register();

        hub.join(a, 1);
        assert_eq!(hub.room_size(1), 1);

        hub.unregister(a);
        assert_eq!(hub.room_size(1), 0);
    }
}
