//! The delete-then-work cycle and lost-work recovery.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use common::{CouponWork, FailingWork, Harness};
use futures::future::join_all;
use peerwork_queue::recovery::{overdue_work, run_cycle, OverdueWork};
use peerwork_queue::{ultimately_perform, Outcome, QueueError};

const PROCESSING_TIMEOUT: Duration = Duration::from_secs(600);

fn an_hour_ago() -> chrono::DateTime<Utc> {
    Utc::now() - chrono::Duration::hours(1)
}

// ---------------------------------------------------------------------------
// ultimately_perform
// ---------------------------------------------------------------------------

#[tokio::test]
async fn perform_deletes_row_and_runs_work() {
    let h = Harness::new();
    let id = h
        .insert_pending(&CouponWork { customer_id: 42 }, Utc::now())
        .await;

    let outcome = ultimately_perform(&h.store, &h.registry, "coupon_work", id)
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Performed);
    assert_eq!(h.issued_coupons().await, vec![42]);
    assert!(h.pending::<CouponWork>().await.is_empty());
}

#[tokio::test]
async fn second_delivery_is_a_no_op() {
    let h = Harness::new();
    let id = h
        .insert_pending(&CouponWork { customer_id: 42 }, Utc::now())
        .await;

    ultimately_perform(&h.store, &h.registry, "coupon_work", id)
        .await
        .unwrap();
    let again = ultimately_perform(&h.store, &h.registry, "coupon_work", id)
        .await
        .unwrap();

    assert_eq!(again, Outcome::AlreadyPerformed);
    assert_eq!(h.issued_coupons().await, vec![42]);
}

#[tokio::test]
async fn concurrent_deliveries_perform_at_most_once() {
    let h = Harness::new();
    let id = h
        .insert_pending(&CouponWork { customer_id: 7 }, Utc::now())
        .await;

    let attempts = (0..5).map(|_| ultimately_perform(&h.store, &h.registry, "coupon_work", id));
    let outcomes: Vec<Outcome> = join_all(attempts)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let performed = outcomes.iter().filter(|o| **o == Outcome::Performed).count();
    assert_eq!(performed, 1);
    assert_eq!(h.issued_coupons().await, vec![7]);
}

#[tokio::test]
async fn failed_work_restores_row() {
    let h = Harness::new();
    let id = h
        .insert_pending(
            &FailingWork {
                reason: "nope".into(),
            },
            Utc::now(),
        )
        .await;

    let err = ultimately_perform(&h.store, &h.registry, "failing_work", id)
        .await
        .unwrap_err();

    assert_matches!(err, QueueError::Execution(_));
    assert_eq!(h.pending::<FailingWork>().await, vec![id]);
}

#[tokio::test]
async fn unknown_table_is_rejected() {
    let h = Harness::new();
    let err = ultimately_perform(&h.store, &h.registry, "no_such_work", 1)
        .await
        .unwrap_err();
    assert_matches!(err, QueueError::UnknownTable(table) if table == "no_such_work");
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn overdue_scan_is_repeatable() {
    let h = Harness::new();
    let stale = h
        .insert_pending(&CouponWork { customer_id: 1 }, an_hour_ago())
        .await;
    h.insert_pending(&CouponWork { customer_id: 2 }, Utc::now())
        .await;

    let cutoff = Utc::now() - chrono::Duration::minutes(10);
    let first = overdue_work(&h.store, &h.registry, cutoff).await.unwrap();
    let second = overdue_work(&h.store, &h.registry, cutoff).await.unwrap();

    let expected = vec![OverdueWork {
        table: "coupon_work".into(),
        work_id: stale,
    }];
    assert_eq!(first, expected);
    assert_eq!(second, expected);
}

#[tokio::test]
async fn recovery_resubmits_only_overdue_rows() {
    let h = Harness::new();
    h.insert_pending(&CouponWork { customer_id: 1 }, an_hour_ago())
        .await;
    let fresh = h
        .insert_pending(&CouponWork { customer_id: 2 }, Utc::now())
        .await;

    let local = h.local_performer();
    let completed = run_cycle(&h.store, &h.registry, &local, PROCESSING_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(completed, 1);
    assert_eq!(h.issued_coupons().await, vec![1]);
    assert_eq!(h.pending::<CouponWork>().await, vec![fresh]);
}

#[tokio::test]
async fn failed_recovery_is_retried_next_cycle() {
    let h = Harness::new();
    let id = h
        .insert_pending(
            &FailingWork {
                reason: "still broken".into(),
            },
            an_hour_ago(),
        )
        .await;

    let local = h.local_performer();
    for _ in 0..2 {
        let completed = run_cycle(&h.store, &h.registry, &local, PROCESSING_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(completed, 0);
        assert_eq!(h.pending::<FailingWork>().await, vec![id]);
    }
}

#[tokio::test]
async fn empty_tables_recover_nothing() {
    let h = Harness::new();
    let local = h.local_performer();
    let completed = run_cycle(&h.store, &h.registry, &local, PROCESSING_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(completed, 0);
}
