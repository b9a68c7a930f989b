use std::sync::Arc;

use chrono::Utc;
use log::{debug, warn};
use rocket::futures::{SinkExt, StreamExt};
use rocket::get;
use rocket::State;
use rocket_ws as ws;

use crate::modules::sync::events::SyncEvent;
use crate::modules::sync::hub::{ObserverId, RaceHub};

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// # route one inbound client event through the hub
/// `join-race`/`leave-race` manage room membership, the state exchange
/// events are rewritten to their answer form, everything else is relayed
/// verbatim to the rest of the room. the sender never gets its own echo.
pub(crate) fn handle_inbound(hub: &RaceHub, observer: ObserverId, event: SyncEvent) {
    match event {
        SyncEvent::JoinRace { race_id } => {
            hub.join(observer, race_id);
            hub.broadcast(
                race_id,
                SyncEvent::UserJoinedRace {
                    race_id,
                    user_id: observer,
                    timestamp: now_millis(),
                },
                Some(observer),
            );
        }
        SyncEvent::LeaveRace { race_id } => {
            hub.leave(observer, race_id);
        }
        SyncEvent::RequestRaceState { race_id } => {
            // any other observer holding fresher state may answer
            hub.broadcast(
                race_id,
                SyncEvent::RaceStateRequested {
                    race_id,
                    requester_id: observer,
                    timestamp: now_millis(),
                },
                Some(observer),
            );
        }
        SyncEvent::EmitRaceState { race_id, state } => {
            hub.broadcast(
                race_id,
                SyncEvent::RaceStateUpdated { race_id, state },
                Some(observer),
            );
        }
        other => {
            hub.broadcast(other.race_id(), other, Some(observer));
        }
    }
}

/// # the realtime endpoint
/// each connected dashboard holds one of these sockets. inbound frames are
/// parsed and routed through the hub, outbound events from the hub are
/// forwarded as text frames. a malformed frame is logged and skipped; the
/// connection itself only ends when the peer goes away.
#[get("/ws")]
pub fn race_events(ws: ws::WebSocket, hub: &State<Arc<RaceHub>>) -> ws::Channel<'static> {
    let hub = hub.inner().clone();

    ws.channel(move |mut stream| {
        Box::pin(async move {
            let (observer, mut rx) = hub.register();

            loop {
                tokio::select! {
                    outbound = rx.recv() => {
                        match outbound {
                            Some(event) => {
                                let frame = match serde_json::to_string(&event) {
                                    Ok(frame) => frame,
                                    Err(error) => {
                                        warn!(target:"sync/socket", "failed serializing event: {}", error);
                                        continue;
                                    }
                                };
                                if stream.send(ws::Message::Text(frame)).await.is_err() {
                                    debug!(target:"sync/socket", "observer {} hung up mid-send", observer);
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    inbound = stream.next() => {
                        match inbound {
                            Some(Ok(ws::Message::Text(frame))) => {
                                match serde_json::from_str::<SyncEvent>(&frame) {
                                    Ok(event) => handle_inbound(&hub, observer, event),
                                    Err(error) => {
                                        warn!(target:"sync/socket", "ignoring malformed frame from observer {}: {}", observer, error);
                                    }
                                }
                            }
                            Some(Ok(ws::Message::Close(_))) | None => break,
                            Some(Ok(_)) => {
                                // pings are answered by the transport, binary is ignored
                            }
                            Some(Err(error)) => {
                                debug!(target:"sync/socket", "observer {} socket error: {}", observer, error);
                                break;
                            }
                        }
                    }
                }
            }

            hub.unregister(observer);
            Ok(())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::sync::events::RaceStateSnapshot;

    #[tokio::test]
    async fn join_race_announces_the_newcomer_to_the_room() {
        let hub = RaceHub::new();
        let (a, _rx_a) = hub.register();
        let (b, mut rx_b) = hub.register();
        handle_inbound(&hub, b, SyncEvent::JoinRace { race_id: 1 });

        handle_inbound(&hub, a, SyncEvent::JoinRace { race_id: 1 });

        match rx_b.try_recv().unwrap() {
            SyncEvent::UserJoinedRace { race_id, user_id, .. } => {
                assert_eq!(race_id, 1);
                assert_eq!(user_id, a);
            }
            other => panic!("expected user-joined-race, got {:?}", other),
        }
        assert_eq!(hub.room_of(a), Some(1));
    }

    #[tokio::test]
    async fn mutation_events_are_relayed_to_the_room_only() {
        let hub = RaceHub::new();
        let (a, mut rx_a) = hub.register();
        let (b, mut rx_b) = hub.register();
        let (c, mut rx_c) = hub.register();
        hub.join(a, 1);
        hub.join(b, 1);
        hub.join(c, 2);

        let event = SyncEvent::StintEnded {
            race_id: 1,
            driver_name: "Alice".to_string(),
            lap_id: 4,
            lap_time: 95_000,
            timestamp: 1_749_800_000_000,
        };
        handle_inbound(&hub, a, event.clone());

        assert_eq!(rx_b.try_recv().unwrap(), event);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn state_request_and_answer_are_rewritten() {
        let hub = RaceHub::new();
        let (a, mut rx_a) = hub.register();
        let (b, mut rx_b) = hub.register();
        hub.join(a, 1);
        hub.join(b, 1);

        handle_inbound(&hub, a, SyncEvent::RequestRaceState { race_id: 1 });
        match rx_b.try_recv().unwrap() {
            SyncEvent::RaceStateRequested { requester_id, .. } => assert_eq!(requester_id, a),
            other => panic!("expected race-state-requested, got {:?}", other),
        }

        let snapshot = RaceStateSnapshot {
            race_started: true,
            is_running: true,
            ..Default::default()
        };
        handle_inbound(
            &hub,
            b,
            SyncEvent::EmitRaceState {
                race_id: 1,
                state: snapshot.clone(),
            },
        );
        match rx_a.try_recv().unwrap() {
            SyncEvent::RaceStateUpdated { race_id, state } => {
                assert_eq!(race_id, 1);
                assert_eq!(state, snapshot);
            }
            other => panic!("expected race-state-updated, got {:?}", other),
        }
    }
}
