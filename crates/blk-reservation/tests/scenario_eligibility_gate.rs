//! Scenario: Eligibility Gate
//!
//! # Invariant under test
//! A driver with any expired compliance fact cannot claim, and the error
//! names the fact. Nothing is written and nothing is published. Claims and
//! listings judge eligibility on the same date: the block's own day, or
//! today if that is later.

use std::sync::{Arc, Mutex};

use blk_reservation::{
    ClaimCoordinator, EligibilityGate, ManualClock, MemoryReservationStore, ReservationError,
    Resource,
};
use blk_schemas::{
    BlockId, BlockStatus, DriverId, EligibilityFact, EligibilityFacts, Event, EventSink,
    NewBlock, ReservationPolicy, Topic,
};
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};

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

fn date(m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, m, d).unwrap()
}

fn facts(license: NaiveDate, registration: NaiveDate, insurance: NaiveDate) -> EligibilityFacts {
    EligibilityFacts {
        license_expiry: license,
        registration_expiry: registration,
        insurance_end: insurance,
    }
}

struct Harness {
    store: Arc<MemoryReservationStore>,
    sink: Arc<RecordingSink>,
    coordinator: ClaimCoordinator,
}

/// Clock reads 2026-06-09 noon in New York.
async fn harness() -> Harness {
    let store = Arc::new(MemoryReservationStore::new());
    let sink = Arc::new(RecordingSink::default());
    let coordinator = ClaimCoordinator::new(
        store.clone(),
        EligibilityGate::new(store.clone()),
        sink.clone(),
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 6, 9, 16, 0, 0).unwrap(),
        )),
        ReservationPolicy::default(),
    );
    Harness {
        store,
        sink,
        coordinator,
    }
}

async fn block_on(h: &Harness, day: NaiveDate) -> BlockId {
    let loc = h.store.insert_location("Depot", "1 Main St").await;
    h.store
        .insert_block(&NewBlock {
            location_id: loc,
            date: day,
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            amount_cents: 5400,
        })
        .await
        .unwrap()
        .block_id
}

#[tokio::test]
async fn expired_license_is_named_and_nothing_changes() {
    let h = harness().await;
    let id = block_on(&h, date(6, 20)).await;
    h.store
        .upsert_driver_compliance(DriverId(1), facts(date(6, 1), date(12, 1), date(12, 1)))
        .await;

    let err = h.coordinator.claim_block(id, DriverId(1)).await.unwrap_err();
    assert!(matches!(
        err,
        ReservationError::NotEligible(EligibilityFact::License)
    ));
    assert_eq!(h.store.block(id).await.unwrap().status, BlockStatus::Available);
    assert!(h.store.claims_for_block(id).await.is_empty());
    assert!(h.sink.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn expiry_on_the_day_itself_fails() {
    let h = harness().await;
    let id = block_on(&h, date(6, 20)).await;
    h.store
        .upsert_driver_compliance(DriverId(2), facts(date(12, 1), date(6, 9), date(12, 1)))
        .await;

    let err = h.coordinator.claim_block(id, DriverId(2)).await.unwrap_err();
    assert!(matches!(
        err,
        ReservationError::NotEligible(EligibilityFact::Registration)
    ));
}

#[tokio::test]
async fn insurance_is_checked_last() {
    let h = harness().await;
    let id = block_on(&h, date(6, 20)).await;
    h.store
        .upsert_driver_compliance(DriverId(3), facts(date(12, 1), date(12, 1), date(5, 1)))
        .await;

    let err = h.coordinator.claim_block(id, DriverId(3)).await.unwrap_err();
    assert!(matches!(
        err,
        ReservationError::NotEligible(EligibilityFact::Insurance)
    ));
}

#[tokio::test]
async fn unknown_driver_is_not_found() {
    let h = harness().await;
    let id = block_on(&h, date(6, 20)).await;
    let err = h.coordinator.claim_block(id, DriverId(77)).await.unwrap_err();
    assert!(matches!(err, ReservationError::NotFound(Resource::Driver)));
}

#[tokio::test]
async fn listing_hides_blocks_after_expiry_date() {
    let h = harness().await;
    let soon = block_on(&h, date(6, 12)).await;
    let later = block_on(&h, date(6, 25)).await;
    h.store
        .upsert_driver_compliance(DriverId(4), facts(date(6, 20), date(12, 1), date(12, 1)))
        .await;

    let listing = h.coordinator.list_available_blocks(DriverId(4)).await.unwrap();
    let ids: Vec<BlockId> = listing
        .iter()
        .flat_map(|day| day.blocks.iter().map(|d| d.block.block_id))
        .collect();
    assert_eq!(ids, vec![soon]);
    assert!(!ids.contains(&later));
    assert_eq!(listing[0].date, date(6, 12));
}

#[tokio::test]
async fn claim_and_listing_agree_on_expiry_before_block_date() {
    let h = harness().await;
    let soon = block_on(&h, date(6, 12)).await;
    let later = block_on(&h, date(6, 25)).await;
    // Valid today, lapses before the later block.
    h.store
        .upsert_driver_compliance(DriverId(5), facts(date(6, 20), date(12, 1), date(12, 1)))
        .await;

    let listing = h.coordinator.list_available_blocks(DriverId(5)).await.unwrap();
    let listed: Vec<BlockId> = listing
        .iter()
        .flat_map(|day| day.blocks.iter().map(|d| d.block.block_id))
        .collect();
    assert_eq!(listed, vec![soon]);

    let err = h.coordinator.claim_block(later, DriverId(5)).await.unwrap_err();
    assert!(matches!(
        err,
        ReservationError::NotEligible(EligibilityFact::License)
    ));
    assert!(h.store.claims_for_block(later).await.is_empty());

    h.coordinator.claim_block(soon, DriverId(5)).await.unwrap();
}

#[tokio::test]
async fn claim_on_unknown_block_is_block_not_found() {
    let h = harness().await;
    h.store
        .upsert_driver_compliance(DriverId(6), facts(date(12, 1), date(12, 1), date(12, 1)))
        .await;
    let err = h
        .coordinator
        .claim_block(BlockId(9999), DriverId(6))
        .await
        .unwrap_err();
    assert!(matches!(err, ReservationError::NotFound(Resource::Block)));
}
