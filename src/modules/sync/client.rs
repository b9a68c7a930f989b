use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::modules::models::race::RaceSettingsUpdate;
use crate::modules::sync::events::{RaceStateSnapshot, SyncEvent};

/// A lap as seen through the event stream.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MirrorLap {
    pub lap_id: i32,
    pub driver_name: String,
    pub lap_time: i64,
    pub timestamp: i64,
}

/// A roster entry as seen through the event stream.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MirrorDriver {
    pub driver_id: i32,
    pub driver_name: String,
    pub color: String,
}

/// One observer's local view of a race, fed exclusively by inbound events
/// and full-state snapshots. The authoritative store stays the only source
/// of truth; this mirror exists so a dashboard can render without a fetch
/// on every event.
///
/// Every apply is idempotent: the channel makes no delivery or ordering
/// promise, so the same event may arrive twice.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct RaceMirror {
    pub race_id: Option<i32>,
    pub race_started: bool,
    pub is_running: bool,
    pub stint_running: bool,
    pub current_driver_id: Option<i32>,
    pub current_driver_name: Option<String>,
    pub current_driver_index: Option<i32>,
    pub current_stint_start: Option<i64>,
    pub race_start_time: Option<i64>,
    pub settings: RaceSettingsUpdate,
    pub roster: Vec<MirrorDriver>,
    pub laps: Vec<MirrorLap>,
    pub last_snapshot: Option<i64>,
}

impl RaceMirror {
    pub fn watch(race_id: Option<i32>) -> RaceMirror {
        RaceMirror {
            race_id,
            ..Default::default()
        }
    }

    /// # merge one inbound event into the local view
    /// events for other races are ignored, everything here is scoped by
    /// race id. reapplying the same event leaves the state unchanged.
    pub fn apply(&mut self, event: &SyncEvent) {
        if self.race_id != Some(event.race_id()) {
            return;
        }

        match event {
            SyncEvent::RaceStarted {
                start_time,
                current_stint_start,
                ..
            } => {
                self.race_started = true;
                self.is_running = true;
                self.stint_running = true;
                self.race_start_time = Some(*start_time);
                self.current_stint_start = Some(*current_stint_start);
            }
            SyncEvent::RaceFinished { .. } => {
                self.is_running = false;
                self.stint_running = false;
                self.current_stint_start = None;
            }
            SyncEvent::RaceReset { .. } => {
                // wholesale: back to a fresh pending view of the same room
                *self = RaceMirror::watch(self.race_id);
            }
            SyncEvent::StintStarted {
                driver_id,
                driver_name,
                timestamp,
                ..
            } => {
                self.stint_running = true;
                self.current_driver_id = Some(*driver_id);
                self.current_driver_name = Some(driver_name.clone());
                self.current_driver_index = self.index_of(*driver_id);
                self.current_stint_start = Some(*timestamp);
            }
            SyncEvent::StintEnded {
                driver_name,
                lap_id,
                lap_time,
                timestamp,
                ..
            } => {
                self.stint_running = false;
                self.current_stint_start = None;
                if !self.laps.iter().any(|lap| lap.lap_id == *lap_id) {
                    self.laps.push(MirrorLap {
                        lap_id: *lap_id,
                        driver_name: driver_name.clone(),
                        lap_time: *lap_time,
                        timestamp: *timestamp,
                    });
                }
            }
            SyncEvent::DriverChanged {
                driver_id,
                driver_name,
                timestamp,
                ..
            } => {
                self.current_driver_id = Some(*driver_id);
                self.current_driver_name = Some(driver_name.clone());
                self.current_driver_index = self.index_of(*driver_id);
                self.current_stint_start = Some(*timestamp);
            }
            SyncEvent::DriverAdded {
                driver_id,
                driver_name,
                color,
                ..
            } => {
                if !self.roster.iter().any(|entry| entry.driver_id == *driver_id) {
                    self.roster.push(MirrorDriver {
                        driver_id: *driver_id,
                        driver_name: driver_name.clone(),
                        color: color.clone(),
                    });
                }
            }
            SyncEvent::DriverRemoved { driver_id, .. } => {
                self.roster.retain(|entry| entry.driver_id != *driver_id);
                self.current_driver_index = self
                    .current_driver_id
                    .and_then(|current| self.roster.iter().position(|e| e.driver_id == current))
                    .map(|index| index as i32);
            }
            SyncEvent::RaceSettingsUpdated { settings, .. } => {
                if settings.min_stint_time.is_some() {
                    self.settings.min_stint_time = settings.min_stint_time;
                }
                if settings.max_stint_time.is_some() {
                    self.settings.max_stint_time = settings.max_stint_time;
                }
                if settings.target_laps.is_some() {
                    self.settings.target_laps = settings.target_laps;
                }
                if settings.city.is_some() {
                    self.settings.city = settings.city.clone();
                }
            }
            SyncEvent::RaceStateUpdated { state, .. } | SyncEvent::EmitRaceState { state, .. } => {
                self.apply_snapshot(state);
            }
            // membership chatter carries no race state
            SyncEvent::JoinRace { .. }
            | SyncEvent::LeaveRace { .. }
            | SyncEvent::UserJoinedRace { .. }
            | SyncEvent::RequestRaceState { .. }
            | SyncEvent::RaceStateRequested { .. } => {}
        }
    }

    /// # apply a full-state snapshot
    /// unconditional: the last snapshot wins, there is no merge.
    pub fn apply_snapshot(&mut self, state: &RaceStateSnapshot) {
        self.race_started = state.race_started;
        self.is_running = state.is_running;
        self.stint_running = state.stint_running;
        self.current_driver_index = state.current_driver_index;
        self.current_stint_start = state.current_lap_start;
        self.race_start_time = state.race_start_time;
        self.last_snapshot = Some(state.timestamp);
    }

    /// # the answer payload for a state request
    pub fn snapshot(&self, timestamp: i64) -> RaceStateSnapshot {
        RaceStateSnapshot {
            race_started: self.race_started,
            is_running: self.is_running,
            stint_running: self.stint_running,
            current_driver_index: self.current_driver_index,
            current_lap_start: self.current_stint_start,
            race_start_time: self.race_start_time,
            timestamp,
        }
    }

    fn index_of(&self, driver_id: i32) -> Option<i32> {
        self.roster
            .iter()
            .position(|entry| entry.driver_id == driver_id)
            .map(|index| index as i32)
    }
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub is_connected: bool,
    pub current_race_id: Option<i32>,
}

type Callback = Box<dyn Fn(&SyncEvent) + Send + Sync>;

struct ClientInner {
    connected: bool,
    current_race: Option<i32>,
    mirror: RaceMirror,
}

/// The connection manager an observing dashboard composes in. It owns the
/// lifecycle explicitly (no module-wide singleton): the transport hands
/// inbound events to [`SyncClient::handle_incoming`] and drains the
/// outbound receiver returned by [`SyncClient::connect`].
///
/// Disconnected is a first-class state, not an error: emits while
/// disconnected are dropped with a warning and the next
/// [`SyncClient::on_connected`] rejoins the watched race and asks the room
/// for fresh state.
pub struct SyncClient {
    outbound: UnboundedSender<SyncEvent>,
    inner: Mutex<ClientInner>,
    listeners: Mutex<HashMap<&'static str, Vec<(u64, Callback)>>>,
    next_subscription: Mutex<u64>,
}

impl SyncClient {
    /// # create a client and its outbound event stream
    pub fn connect() -> (Arc<SyncClient>, UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let client = Arc::new(SyncClient {
            outbound: tx,
            inner: Mutex::new(ClientInner {
                connected: false,
                current_race: None,
                mirror: RaceMirror::watch(None),
            }),
            listeners: Mutex::new(HashMap::new()),
            next_subscription: Mutex::new(1),
        });

        (client, rx)
    }

    /// # the transport established (or re-established) the link
    /// rejoins the watched race and requests a state resync rather than
    /// trusting whatever the mirror last saw.
    pub fn on_connected(&self) {
        let current_race = {
            let mut inner = self.inner.lock().unwrap();
            inner.connected = true;
            inner.current_race
        };

        if let Some(race_id) = current_race {
            let _ = self.outbound.send(SyncEvent::JoinRace { race_id });
            let _ = self.outbound.send(SyncEvent::RequestRaceState { race_id });
        }
    }

    /// # the transport lost the link
    pub fn on_disconnected(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = false;
    }

    /// # watch a race
    /// an observer watches at most one race; joining a new one leaves the
    /// previous room first and starts a fresh mirror.
    pub fn join_race(&self, race_id: i32) {
        let mut inner = self.inner.lock().unwrap();

        if inner.current_race == Some(race_id) {
            return;
        }

        if inner.connected {
            if let Some(previous) = inner.current_race {
                let _ = self.outbound.send(SyncEvent::LeaveRace { race_id: previous });
            }
            let _ = self.outbound.send(SyncEvent::JoinRace { race_id });
        }

        inner.current_race = Some(race_id);
        inner.mirror = RaceMirror::watch(Some(race_id));
    }

    /// # stop watching a race
    pub fn leave_race(&self, race_id: i32) {
        let mut inner = self.inner.lock().unwrap();

        if inner.connected {
            let _ = self.outbound.send(SyncEvent::LeaveRace { race_id });
        }
        if inner.current_race == Some(race_id) {
            inner.current_race = None;
            inner.mirror = RaceMirror::watch(None);
        }
    }

    /// # emit an event to the room
    /// dropped with a warning while disconnected; the mutation this
    /// notifies about already went through the store, losing the
    /// notification only costs the peers a resync.
    pub fn emit(&self, event: SyncEvent) -> bool {
        let connected = self.inner.lock().unwrap().connected;
        if !connected {
            warn!(target:"sync/client", "not connected, dropping {} event", event.kind());
            return false;
        }

        self.outbound.send(event).is_ok()
    }

    /// # merge an inbound event and notify subscribers
    /// a state request from a late joiner is answered with the local
    /// snapshot; everything else lands in the mirror.
    pub fn handle_incoming(&self, event: SyncEvent) {
        {
            let mut inner = self.inner.lock().unwrap();

            if let SyncEvent::RaceStateRequested {
                race_id, timestamp, ..
            } = &event
            {
                if inner.current_race == Some(*race_id) && inner.mirror.race_started {
                    let answer = SyncEvent::EmitRaceState {
                        race_id: *race_id,
                        state: inner.mirror.snapshot(*timestamp),
                    };
                    let _ = self.outbound.send(answer);
                }
            }

            inner.mirror.apply(&event);
        }

        let listeners = self.listeners.lock().unwrap();
        if let Some(callbacks) = listeners.get(event.kind()) {
            for (_, callback) in callbacks {
                callback(&event);
            }
        }
    }

    /// # listen for one event kind
    /// the returned subscription unsubscribes on drop. callbacks run on the
    /// delivery path and must not call back into the client.
    pub fn subscribe(
        self: &Arc<Self>,
        kind: &'static str,
        callback: impl Fn(&SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = {
            let mut next = self.next_subscription.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };

        self.listeners
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push((id, Box::new(callback)));

        Subscription {
            client: Arc::downgrade(self),
            kind,
            id,
        }
    }

    fn unsubscribe(&self, kind: &'static str, id: u64) {
        let mut listeners = self.listeners.lock().unwrap();
        if let Some(callbacks) = listeners.get_mut(kind) {
            callbacks.retain(|(callback_id, _)| *callback_id != id);
            if callbacks.is_empty() {
                listeners.remove(kind);
            }
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        let inner = self.inner.lock().unwrap();
        ConnectionStatus {
            is_connected: inner.connected,
            current_race_id: inner.current_race,
        }
    }

    pub fn mirror(&self) -> RaceMirror {
        self.inner.lock().unwrap().mirror.clone()
    }

    /// # tear the client down
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock().unwrap();

        if inner.connected {
            if let Some(race_id) = inner.current_race {
                let _ = self.outbound.send(SyncEvent::LeaveRace { race_id });
            }
        }

        inner.connected = false;
        inner.current_race = None;
        inner.mirror = RaceMirror::watch(None);
        self.listeners.lock().unwrap().clear();
    }
}

/// Disposer handed out by [`SyncClient::subscribe`].
pub struct Subscription {
    client: Weak<SyncClient>,
    kind: &'static str,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(client) = self.client.upgrade() {
            client.unsubscribe(self.kind, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stint_ended(race_id: i32, lap_id: i32) -> SyncEvent {
        SyncEvent::StintEnded {
            race_id,
            driver_name: "Alice".to_string(),
            lap_id,
            lap_time: 95_000,
            timestamp: 1_749_800_000_000,
        }
    }

    #[test]
    fn applying_the_same_event_twice_is_idempotent() {
        let mut mirror = RaceMirror::watch(Some(1));

        mirror.apply(&stint_ended(1, 4));
        let once = mirror.clone();
        mirror.apply(&stint_ended(1, 4));

        assert_eq!(mirror, once);
        assert_eq!(mirror.laps.len(), 1);
    }

    #[test]
    fn events_for_another_race_are_ignored() {
        let mut mirror = RaceMirror::watch(Some(1));

        mirror.apply(&stint_ended(2, 4));

        assert!(mirror.laps.is_empty());
        assert!(!mirror.stint_running);
    }

    #[test]
    fn race_started_sets_the_flags_and_survives_a_duplicate() {
        let mut mirror = RaceMirror::watch(Some(1));
        let event = SyncEvent::RaceStarted {
            race_id: 1,
            start_time: 1_749_800_000_000,
            current_stint_start: 1_749_800_000_000,
        };

        mirror.apply(&event);
        let once = mirror.clone();
        mirror.apply(&event);

        assert_eq!(mirror, once);
        assert!(mirror.race_started && mirror.is_running && mirror.stint_running);
        assert_eq!(mirror.race_start_time, Some(1_749_800_000_000));
    }

    #[test]
    fn reset_clears_the_view_but_keeps_the_room() {
        let mut mirror = RaceMirror::watch(Some(1));
        mirror.apply(&SyncEvent::RaceStarted {
            race_id: 1,
            start_time: 1,
            current_stint_start: 1,
        });
        mirror.apply(&stint_ended(1, 4));

        mirror.apply(&SyncEvent::RaceReset { race_id: 1 });

        assert_eq!(mirror, RaceMirror::watch(Some(1)));
    }

    #[test]
    fn the_last_snapshot_wins() {
        let mut mirror = RaceMirror::watch(Some(1));

        mirror.apply(&SyncEvent::RaceStateUpdated {
            race_id: 1,
            state: RaceStateSnapshot {
                race_started: true,
                is_running: true,
                stint_running: true,
                current_driver_index: Some(0),
                current_lap_start: Some(10),
                race_start_time: Some(5),
                timestamp: 100,
            },
        });
        mirror.apply(&SyncEvent::RaceStateUpdated {
            race_id: 1,
            state: RaceStateSnapshot {
                race_started: true,
                is_running: false,
                stint_running: false,
                current_driver_index: Some(1),
                current_lap_start: None,
                race_start_time: Some(5),
                timestamp: 200,
            },
        });

        assert!(!mirror.is_running);
        assert_eq!(mirror.current_driver_index, Some(1));
        assert_eq!(mirror.last_snapshot, Some(200));
    }

    #[test]
    fn roster_changes_keep_the_current_driver_index_in_step() {
        let mut mirror = RaceMirror::watch(Some(1));
        for (id, name) in [(10, "Alice"), (11, "Bob"), (12, "Carol")] {
            mirror.apply(&SyncEvent::DriverAdded {
                race_id: 1,
                driver_id: id,
                driver_name: name.to_string(),
                color: "#1f2937".to_string(),
            });
        }
        mirror.apply(&SyncEvent::DriverChanged {
            race_id: 1,
            driver_id: 12,
            driver_name: "Carol".to_string(),
            timestamp: 50,
        });
        assert_eq!(mirror.current_driver_index, Some(2));

        mirror.apply(&SyncEvent::DriverRemoved {
            race_id: 1,
            driver_id: 10,
        });

        assert_eq!(mirror.roster.len(), 2);
        assert_eq!(mirror.current_driver_index, Some(1));
    }

    #[test]
    fn joining_a_new_race_leaves_the_previous_room_first() {
        let (client, mut rx) = SyncClient::connect();
        client.on_connected();
        client.join_race(1);

        client.join_race(2);

        assert_eq!(rx.try_recv().unwrap(), SyncEvent::JoinRace { race_id: 1 });
        assert_eq!(rx.try_recv().unwrap(), SyncEvent::LeaveRace { race_id: 1 });
        assert_eq!(rx.try_recv().unwrap(), SyncEvent::JoinRace { race_id: 2 });
        assert_eq!(client.status().current_race_id, Some(2));
    }

    #[test]
    fn emits_are_dropped_while_disconnected() {
        let (client, mut rx) = SyncClient::connect();
        client.join_race(1);

        let sent = client.emit(SyncEvent::RaceFinished { race_id: 1 });

        assert!(!sent);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn reconnecting_rejoins_and_asks_for_fresh_state() {
        let (client, mut rx) = SyncClient::connect();
        client.on_connected();
        client.join_race(1);
        client.on_disconnected();
        while rx.try_recv().is_ok() {}

        client.on_connected();

        assert_eq!(rx.try_recv().unwrap(), SyncEvent::JoinRace { race_id: 1 });
        assert_eq!(
            rx.try_recv().unwrap(),
            SyncEvent::RequestRaceState { race_id: 1 }
        );
    }

    #[test]
    fn a_state_request_is_answered_with_the_local_snapshot() {
        let (client, mut rx) = SyncClient::connect();
        client.on_connected();
        client.join_race(1);
        client.handle_incoming(SyncEvent::RaceStarted {
            race_id: 1,
            start_time: 1_749_800_000_000,
            current_stint_start: 1_749_800_000_000,
        });

        client.handle_incoming(SyncEvent::RaceStateRequested {
            race_id: 1,
            requester_id: 99,
            timestamp: 1_749_800_001_000,
        });

        match rx.try_recv().unwrap() {
            SyncEvent::EmitRaceState { race_id, state } => {
                assert_eq!(race_id, 1);
                assert!(state.race_started && state.is_running);
                assert_eq!(state.timestamp, 1_749_800_001_000);
            }
            other => panic!("expected emit-race-state, got {:?}", other),
        }
    }

    #[test]
    fn a_client_with_nothing_to_share_stays_quiet() {
        let (client, mut rx) = SyncClient::connect();
        client.on_connected();
        client.join_race(1);

        client.handle_incoming(SyncEvent::RaceStateRequested {
            race_id: 1,
            requester_id: 99,
            timestamp: 1_749_800_001_000,
        });

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn subscriptions_fire_and_dispose_on_drop() {
        let (client, _rx) = SyncClient::connect();
        client.join_race(1);
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        let subscription = client.subscribe("stint-ended", move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        client.handle_incoming(stint_ended(1, 4));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        drop(subscription);
        client.handle_incoming(stint_ended(1, 5));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
