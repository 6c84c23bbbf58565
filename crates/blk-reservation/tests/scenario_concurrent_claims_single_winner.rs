//! Scenario: Concurrent Claims Have Exactly One Winner
//!
//! # Invariant under test
//! However many drivers race for one available block, exactly one claim
//! commits, the block ends `accepted`, and every loser sees
//! `AlreadyClaimed`. Events for the claim go out once.
//!
//! Pure in-process (memory store); no DB required.

use std::sync::{Arc, Mutex};

use blk_reservation::{
    ClaimCoordinator, EligibilityGate, ManualClock, MemoryReservationStore, ReservationError,
};
use blk_schemas::{
    BlockId, BlockStatus, DriverId, EligibilityFacts, Event, EventSink, NewBlock,
    ReservationPolicy, Topic,
};
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingSink {
    seen: Mutex<Vec<(Topic, Event)>>,
}

impl EventSink for RecordingSink {
    fn publish(&self, topic: Topic, event: Event) -> usize {
        self.seen.lock().unwrap().push((topic, event));
        1
    }
}

fn facts() -> EligibilityFacts {
    let far = NaiveDate::from_ymd_opt(2030, 1, 1).unwrap();
    EligibilityFacts {
        license_expiry: far,
        registration_expiry: far,
        insurance_end: far,
    }
}

async fn setup(drivers: i64) -> (Arc<MemoryReservationStore>, Arc<RecordingSink>, ClaimCoordinator, BlockId) {
    let store = Arc::new(MemoryReservationStore::new());
    let loc = store.insert_location("North Depot", "10 Harbor Rd").await;
    let block = store
        .insert_block(&NewBlock {
            location_id: loc,
            date: NaiveDate::from_ymd_opt(2026, 6, 10).unwrap(),
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            amount_cents: 5400,
        })
        .await
        .unwrap();
    for d in 1..=drivers {
        store.upsert_driver_compliance(DriverId(d), facts()).await;
    }

    let sink = Arc::new(RecordingSink::default());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 6, 9, 12, 0, 0).unwrap(),
    ));
    let coordinator = ClaimCoordinator::new(
        store.clone(),
        EligibilityGate::new(store.clone()),
        sink.clone(),
        clock,
        ReservationPolicy::default(),
    );
    (store, sink, coordinator, block.block_id)
}

// ---------------------------------------------------------------------------
// 1. N concurrent claims -> exactly one success
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_yield_single_winner() {
    const N: i64 = 16;
    let (store, sink, coordinator, block_id) = setup(N).await;

    let mut handles = Vec::new();
    for d in 1..=N {
        let c = coordinator.clone();
        handles.push(tokio::spawn(async move { c.claim_block(block_id, DriverId(d)).await }));
    }

    let mut winners = Vec::new();
    let mut already_claimed = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(claim) => winners.push(claim),
            Err(ReservationError::AlreadyClaimed) => already_claimed += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(winners.len(), 1, "exactly one claim must commit");
    assert_eq!(already_claimed, N - 1);

    let claims = store.claims_for_block(block_id).await;
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].driver_id, winners[0].driver_id);
    assert_eq!(store.block(block_id).await.unwrap().status, BlockStatus::Accepted);

    let seen = sink.seen.lock().unwrap();
    let claimed: Vec<_> = seen
        .iter()
        .filter(|(_, e)| matches!(e, Event::BlockClaimed { .. }))
        .collect();
    assert_eq!(claimed.len(), 1, "BlockClaimed must be published once");
    assert_eq!(seen.len(), 2, "BlockClaimed + ScheduleUpdated only");
}

// ---------------------------------------------------------------------------
// 2. Second driver on a claimed block
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_driver_gets_already_claimed_and_no_events() {
    let (_store, sink, coordinator, block_id) = setup(9).await;

    let claim = coordinator.claim_block(block_id, DriverId(7)).await.unwrap();
    assert_eq!(claim.driver_id, DriverId(7));
    {
        let seen = sink.seen.lock().unwrap();
        assert_eq!(
            seen[0],
            (
                Topic::AvailableBlocks,
                Event::BlockClaimed {
                    block_id,
                    claimed_by: DriverId(7)
                }
            )
        );
        assert_eq!(
            seen[1],
            (
                Topic::Schedule(DriverId(7)),
                Event::ScheduleUpdated {
                    driver_id: DriverId(7)
                }
            )
        );
    }

    let err = coordinator
        .claim_block(block_id, DriverId(9))
        .await
        .unwrap_err();
    assert!(matches!(err, ReservationError::AlreadyClaimed));
    assert_eq!(sink.seen.lock().unwrap().len(), 2, "rejection publishes nothing");
}

#[tokio::test]
async fn reclaim_by_holder_reports_already_claimed() {
    let (_store, _sink, coordinator, block_id) = setup(1).await;
    coordinator.claim_block(block_id, DriverId(1)).await.unwrap();
    let err = coordinator
        .claim_block(block_id, DriverId(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ReservationError::AlreadyClaimed));
}

#[tokio::test]
async fn unknown_block_is_not_found() {
    let (_store, _sink, coordinator, _block_id) = setup(1).await;
    let err = coordinator
        .claim_block(BlockId(999), DriverId(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReservationError::NotFound(blk_reservation::Resource::Block)
    ));
}
