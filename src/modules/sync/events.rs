use serde::{Deserialize, Serialize};

use crate::modules::models::race::RaceSettingsUpdate;

/// A full-state snapshot exchanged between observers when a late joiner
/// asks for the current race state. Applied wholesale, last one wins.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct RaceStateSnapshot {
    pub race_started: bool,
    pub is_running: bool,
    pub stint_running: bool,
    pub current_driver_index: Option<i32>,
    pub current_lap_start: Option<i64>,
    pub race_start_time: Option<i64>,
    pub timestamp: i64,
}

/// The wire contract of the realtime channel. Everything is scoped by a
/// race id; timestamps travel as epoch milliseconds.
///
/// Serialized as `{"event": "<kebab-case name>", "data": {...}}`.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum SyncEvent {
    #[serde(rename_all = "camelCase")]
    JoinRace { race_id: i32 },
    #[serde(rename_all = "camelCase")]
    LeaveRace { race_id: i32 },
    #[serde(rename_all = "camelCase")]
    UserJoinedRace {
        race_id: i32,
        user_id: u64,
        timestamp: i64,
    },

    #[serde(rename_all = "camelCase")]
    RaceStarted {
        race_id: i32,
        start_time: i64,
        current_stint_start: i64,
    },
    #[serde(rename_all = "camelCase")]
    RaceFinished { race_id: i32 },
    #[serde(rename_all = "camelCase")]
    RaceReset { race_id: i32 },

    #[serde(rename_all = "camelCase")]
    StintStarted {
        race_id: i32,
        driver_id: i32,
        driver_name: String,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    StintEnded {
        race_id: i32,
        driver_name: String,
        lap_id: i32,
        lap_time: i64,
        timestamp: i64,
    },

    #[serde(rename_all = "camelCase")]
    DriverChanged {
        race_id: i32,
        driver_id: i32,
        driver_name: String,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    DriverAdded {
        race_id: i32,
        driver_id: i32,
        driver_name: String,
        color: String,
    },
    #[serde(rename_all = "camelCase")]
    DriverRemoved { race_id: i32, driver_id: i32 },

    #[serde(rename_all = "camelCase")]
    RaceSettingsUpdated {
        race_id: i32,
        settings: RaceSettingsUpdate,
    },

    #[serde(rename_all = "camelCase")]
    RequestRaceState { race_id: i32 },
    #[serde(rename_all = "camelCase")]
    RaceStateRequested {
        race_id: i32,
        requester_id: u64,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    EmitRaceState {
        race_id: i32,
        #[serde(flatten)]
        state: RaceStateSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    RaceStateUpdated {
        race_id: i32,
        #[serde(flatten)]
        state: RaceStateSnapshot,
    },
}

impl SyncEvent {
    /// every event is scoped to exactly one race room.
    pub fn race_id(&self) -> i32 {
        match self {
            SyncEvent::JoinRace { race_id }
            | SyncEvent::LeaveRace { race_id }
            | SyncEvent::UserJoinedRace { race_id, .. }
            | SyncEvent::RaceStarted { race_id, .. }
            | SyncEvent::RaceFinished { race_id }
            | SyncEvent::RaceReset { race_id }
            | SyncEvent::StintStarted { race_id, .. }
            | SyncEvent::StintEnded { race_id, .. }
            | SyncEvent::DriverChanged { race_id, .. }
            | SyncEvent::DriverAdded { race_id, .. }
            | SyncEvent::DriverRemoved { race_id, .. }
            | SyncEvent::RaceSettingsUpdated { race_id, .. }
            | SyncEvent::RequestRaceState { race_id }
            | SyncEvent::RaceStateRequested { race_id, .. }
            | SyncEvent::EmitRaceState { race_id, .. }
            | SyncEvent::RaceStateUpdated { race_id, .. } => *race_id,
        }
    }

    /// the wire name, also used as the subscription key on clients.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::JoinRace { .. } => "join-race",
            SyncEvent::LeaveRace { .. } => "leave-race",
            SyncEvent::UserJoinedRace { .. } => "user-joined-race",
            SyncEvent::RaceStarted { .. } => "race-started",
            SyncEvent::RaceFinished { .. } => "race-finished",
            SyncEvent::RaceReset { .. } => "race-reset",
            SyncEvent::StintStarted { .. } => "stint-started",
            SyncEvent::StintEnded { .. } => "stint-ended",
            SyncEvent::DriverChanged { .. } => "driver-changed",
            SyncEvent::DriverAdded { .. } => "driver-added",
            SyncEvent::DriverRemoved { .. } => "driver-removed",
            SyncEvent::RaceSettingsUpdated { .. } => "race-settings-updated",
            SyncEvent::RequestRaceState { .. } => "request-race-state",
            SyncEvent::RaceStateRequested { .. } => "race-state-requested",
            SyncEvent::EmitRaceState { .. } => "emit-race-state",
            SyncEvent::RaceStateUpdated { .. } => "race-state-updated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_use_kebab_case_wire_names() {
        let event = SyncEvent::StintEnded {
            race_id: 3,
            driver_name: "Alice".to_string(),
            lap_id: 17,
            lap_time: 92_500,
            timestamp: 1_749_800_000_000,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"stint-ended""#));
        assert!(json.contains(r#""raceId":3"#));
        assert!(json.contains(r#""lapId":17"#));
        assert!(json.contains(r#""lapTime":92500"#));
    }

    #[test]
    fn events_round_trip() {
        let event = SyncEvent::RaceStarted {
            race_id: 1,
            start_time: 1_749_800_000_000,
            current_stint_start: 1_749_800_000_000,
        };

        let json = serde_json::to_string(&event).unwrap();
        let parsed: SyncEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn snapshot_events_flatten_the_state() {
        let event = SyncEvent::EmitRaceState {
            race_id: 5,
            state: RaceStateSnapshot {
                race_started: true,
                is_running: true,
                stint_running: false,
                current_driver_index: Some(2),
                current_lap_start: None,
                race_start_time: Some(1_749_800_000_000),
                timestamp: 1_749_800_500_000,
            },
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"emit-race-state""#));
        assert!(json.contains(r#""raceStarted":true"#));
        assert!(json.contains(r#""currentDriverIndex":2"#));

        let parsed: SyncEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn kind_matches_the_wire_name() {
        let event = SyncEvent::RaceReset { race_id: 9 };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(&format!(r#""event":"{}""#, event.kind())));
    }
}
