//! Scenario: Slow Subscriber Never Blocks Publisher
//!
//! # Invariant under test
//! A subscriber whose queue is full loses events (counted as dropped) while
//! other subscribers keep receiving. A subscriber that went away is pruned
//! on the next publish. `publish` itself never waits.

use blk_fanout::Fanout;
use blk_schemas::{BlockId, DriverId, Event, Topic};

fn expired(id: i64) -> Event {
    Event::BlockExpired {
        block_id: BlockId(id),
    }
}

#[tokio::test]
async fn full_queue_drops_without_blocking_others() {
    let f = Fanout::new(2);
    let _slow = f.connect(DriverId(1));
    let mut fast = f.connect(DriverId(2));

    for i in 0..5 {
        f.publish(Topic::AvailableBlocks, expired(i));
        // fast drains as it goes; slow never reads.
        assert!(fast.rx.try_recv().is_ok());
    }

    assert_eq!(f.dropped_count(), 3, "slow subscriber holds 2 and drops 3");
    assert_eq!(f.connection_count(), 2, "full is not the same as gone");
}

#[tokio::test]
async fn closed_receiver_is_pruned_on_publish() {
    let f = Fanout::new(4);
    let gone = f.connect(DriverId(1));
    let mut live = f.connect(DriverId(2));
    drop(gone.rx);

    let n = f.publish(Topic::AvailableBlocks, expired(1));
    assert_eq!(n, 1);
    assert_eq!(f.connection_count(), 1);
    assert_eq!(f.driver_connection_count(DriverId(1)), 0);
    assert!(live.rx.try_recv().is_ok());
}

#[tokio::test]
async fn no_replay_for_late_subscribers() {
    let f = Fanout::new(4);
    assert_eq!(f.publish(Topic::AvailableBlocks, expired(1)), 0);
    let mut late = f.connect(DriverId(1));
    assert!(late.rx.try_recv().is_err());
}
