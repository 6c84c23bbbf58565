//! Scenario: Topic Routing
//!
//! # Invariant under test
//! A published event reaches every connection subscribed to its topic
//! exactly once and nobody else. Tracking subscriptions are opt-in per block
//! and location updates are relayed verbatim.

use blk_fanout::Fanout;
use blk_schemas::{
    BlockId, ClaimId, DriverId, Envelope, Event, EventSink, GeoLocation, Topic,
};
use serde_json::json;

fn drain(rx: &mut tokio::sync::mpsc::Receiver<Envelope>) -> Vec<Envelope> {
    let mut out = Vec::new();
    while let Ok(env) = rx.try_recv() {
        out.push(env);
    }
    out
}

#[tokio::test]
async fn available_blocks_reaches_everyone_once() {
    let f = Fanout::new(16);
    let mut a = f.connect(DriverId(1));
    let mut b = f.connect(DriverId(2));
    let mut a2 = f.connect(DriverId(1));

    let n = f.publish(
        Topic::AvailableBlocks,
        Event::BlockClaimed {
            block_id: BlockId(42),
            claimed_by: DriverId(7),
        },
    );
    assert_eq!(n, 3);
    for sub in [&mut a, &mut b, &mut a2] {
        let got = drain(&mut sub.rx);
        assert_eq!(got.len(), 1, "at most once per connection");
        assert_eq!(got[0].topic, Topic::AvailableBlocks);
    }
}

#[tokio::test]
async fn personal_topics_stay_personal() {
    let f = Fanout::new(16);
    let mut seven = f.connect(DriverId(7));
    let mut nine = f.connect(DriverId(9));

    let n = f.publish(
        Topic::Schedule(DriverId(7)),
        Event::ScheduleUpdated {
            driver_id: DriverId(7),
        },
    );
    assert_eq!(n, 1);
    assert_eq!(drain(&mut seven.rx).len(), 1);
    assert!(drain(&mut nine.rx).is_empty());

    let n = f.publish(
        Topic::Personal(DriverId(9)),
        Event::PenaltyApplied {
            driver_id: DriverId(9),
            block_id: BlockId(1),
            points: -20,
        },
    );
    assert_eq!(n, 1);
    assert!(drain(&mut seven.rx).is_empty());
    assert_eq!(drain(&mut nine.rx).len(), 1);
}

#[tokio::test]
async fn tracking_is_opt_in_and_relays_location_verbatim() {
    let f = Fanout::new(16);
    let driver = f.connect(DriverId(7));
    let mut dispatcher = f.connect(DriverId(100));
    let mut bystander = f.connect(DriverId(101));

    assert!(f.track(dispatcher.conn_id, BlockId(42)));

    let location: GeoLocation = serde_json::from_value(json!({
        "latitude": 40.71,
        "longitude": -74.0,
        "heading": 90
    }))
    .unwrap();
    let n = f
        .relay_location(driver.conn_id, ClaimId(5), BlockId(42), location.clone())
        .expect("driver connection is live");
    assert_eq!(n, 1);

    let got = drain(&mut dispatcher.rx);
    assert_eq!(
        got,
        vec![Envelope {
            topic: Topic::Tracking(BlockId(42)),
            event: Event::DriverLocation {
                driver_id: DriverId(7),
                claim_id: ClaimId(5),
                block_id: BlockId(42),
                location,
            },
        }]
    );
    let wire = serde_json::to_value(&got[0]).unwrap();
    assert_eq!(wire["event"]["location"]["heading"], json!(90));
    assert!(drain(&mut bystander.rx).is_empty());

    assert!(f.untrack(dispatcher.conn_id, BlockId(42)));
    assert_eq!(f.subscriber_count(Topic::Tracking(BlockId(42))), 0);
}

#[tokio::test]
async fn relay_from_unknown_connection_is_refused() {
    let f = Fanout::new(4);
    let gone = f.connect(DriverId(1));
    f.disconnect(gone.conn_id);
    let location: GeoLocation =
        serde_json::from_value(json!({"latitude": 0.0, "longitude": 0.0})).unwrap();
    assert!(f
        .relay_location(gone.conn_id, ClaimId(1), BlockId(1), location)
        .is_none());
}

#[tokio::test]
async fn usable_through_event_sink_trait() {
    let f = std::sync::Arc::new(Fanout::new(4));
    let mut sub = f.connect(DriverId(3));
    let sink: std::sync::Arc<dyn EventSink> = f.clone();
    assert_eq!(
        sink.publish(Topic::AvailableBlocks, Event::BlockExpired { block_id: BlockId(8) }),
        1
    );
    assert_eq!(drain(&mut sub.rx).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_track_and_disconnect_leave_no_stale_members() {
    let f = std::sync::Arc::new(Fanout::new(4));
    let block = BlockId(9);

    for _ in 0..200 {
        let sub = f.connect(DriverId(1));
        let conn = sub.conn_id;
        let tracker = {
            let f = f.clone();
            tokio::spawn(async move { f.track(conn, block) })
        };
        let closer = {
            let f = f.clone();
            tokio::spawn(async move { f.disconnect(conn) })
        };
        tracker.await.unwrap();
        closer.await.unwrap();
    }

    assert_eq!(f.connection_count(), 0);
    assert_eq!(f.subscriber_count(Topic::Tracking(block)), 0);
}
