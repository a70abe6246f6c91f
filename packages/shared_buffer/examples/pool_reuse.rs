//! Demonstrates recycling through a `BufferPool` and its deferred teardown.
//!
//! Run with `RUST_LOG=shared_buffer=trace` to see the pool events.

use std::sync::Arc;

use shared_buffer::{BufferPool, ReusePolicy, TrackingAllocator};
use tracing_subscriber::EnvFilter;

fn main() -> shared_buffer::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== BufferPool Examples ===");
    println!();

    let allocator = Arc::new(TrackingAllocator::new());
    let pool = BufferPool::builder()
        .buffer_size(1500)
        .allocator(allocator.clone())
        .reuse_policy(ReusePolicy::PreserveContents)
        .build();

    for round in 0..3 {
        let mut packet = pool.get()?;
        if let Some(contents) = packet.get_mut() {
            contents[0] = round;
        }

        println!(
            "Round {round}: first byte {}, {} allocations so far",
            packet[0],
            allocator.allocations()
        );
    }

    let kept = pool.get()?;
    println!(
        "Outstanding: {}, available: {}",
        pool.outstanding(),
        pool.available()
    );

    pool.uninit();
    println!(
        "After uninit with one buffer outstanding: {} live allocations",
        allocator.live_allocations()
    );

    drop(kept);
    println!(
        "After releasing the last buffer: {} live allocations",
        allocator.live_allocations()
    );

    Ok(())
}
