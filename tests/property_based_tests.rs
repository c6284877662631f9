mod common;

use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use backfill_core::channel::VariableCapacityChannel;
use backfill_core::client::{BatchSource, GetNextBatchRangeRequest};
use backfill_core::clock::{FakeClock, SharedClock};
use backfill_core::models::PrimaryKey;
use backfill_core::rate_counter::RateCounter;

use common::static_connector;

fn request(
    source_len: u32,
    previous_end: Option<u32>,
    batch_size: i64,
    scan_size: i64,
    batch_limit: usize,
) -> GetNextBatchRangeRequest {
    GetNextBatchRangeRequest {
        backfill_run_id: Uuid::nil(),
        backfill_name: "prop".to_string(),
        partition_name: "only".to_string(),
        backfill_range: backfill_core::models::KeyRange::new("0", source_len.to_string()),
        previous_end_key: previous_end.map(|end| PrimaryKey::from(end.to_string())),
        batch_size,
        scan_size,
        batch_limit,
        compute_time_limit: None,
        precomputing: false,
        parameters: HashMap::new(),
        dry_run: true,
    }
}

proptest! {
    /// Property: static batches are contiguous from the cursor and respect every limit
    #[test]
    fn static_batches_are_contiguous_and_bounded(
        len in 1u32..500,
        cursor_fraction in 0.0f64..1.0,
        batch_size in 1i64..50,
        scan_size in 1i64..200,
        batch_limit in 1usize..20,
    ) {
        let (_, datasource, _) = static_connector(len);
        let cursor = (f64::from(len) * cursor_fraction) as u32;
        let response = tokio_test::block_on(
            datasource.get_next_batch_range(request(len, Some(cursor), batch_size, scan_size, batch_limit)),
        ).unwrap();

        prop_assert!(response.batches.len() <= batch_limit);
        let mut expected_start = cursor;
        for batch in &response.batches {
            let start: u32 = batch.start.utf8().parse().unwrap();
            let end: u32 = batch.end.utf8().parse().unwrap();
            prop_assert_eq!(start, expected_start);
            prop_assert!(end > start);
            prop_assert!(i64::from(end - start) <= batch_size);
            prop_assert!(end <= len);
            prop_assert!(i64::from(start - cursor) < scan_size);
            expected_start = end;
        }
        prop_assert_eq!(response.batches.is_empty(), cursor >= len);
    }

    /// Property: the projection never undercounts while the window is filling
    #[test]
    fn projected_rate_is_at_least_the_window_sum(
        adds in proptest::collection::vec((0i64..30, 0i64..1_000), 1..40),
    ) {
        let clock = FakeClock::new();
        let shared: SharedClock = Arc::new(clock.clone());
        let mut counter = RateCounter::new(shared);
        for (advance_secs, count) in adds {
            clock.add(chrono::Duration::seconds(advance_secs));
            counter.add(count);
            let sum = counter.sum();
            prop_assert!(counter.projected_rate() >= sum);
        }
    }

    /// Property: the channel delivers every item exactly once, in order, whatever the capacity
    #[test]
    fn channel_preserves_order_across_capacity_changes(
        capacities in proptest::collection::vec(1usize..8, 1..10),
        items in 1usize..60,
    ) {
        let delivered = tokio_test::block_on(async {
            let channel = VariableCapacityChannel::new(capacities[0]).unwrap();
            let sender = channel.upstream();
            let stop = backfill_core::stop::StopSignal::new();
            let mut receiver = channel.proxy(&stop);

            let producer = tokio::spawn(async move {
                for item in 0..items {
                    sender.send(item).await.unwrap();
                }
                sender.close();
            });

            let mut delivered = Vec::new();
            let mut step = 0usize;
            while let Ok(item) = receiver.recv().await {
                delivered.push(item);
                step += 1;
                channel.set_capacity(capacities[step % capacities.len()]).unwrap();
            }
            producer.await.unwrap();
            delivered
        });
        prop_assert_eq!(delivered, (0..items).collect::<Vec<_>>());
    }
}
