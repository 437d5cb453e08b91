//! Basic usage of the `block_pool` crate:
//!
//! * Creating a bounded pool with verbose diagnostics.
//! * Allocating items.
//! * Using an item.
//! * Releasing all items.
//!
//! Run with `cargo run --example block_pool_basic` to see the allocation trace on stderr.

use std::io;
use std::num::NonZero;

use block_pool::{BlockPool, Diagnostics};
use tracing::Level;

/// An item that a game might allocate and release many times per frame.
#[derive(Debug)]
struct Item {
    x: i32,
    y: i32,
    speed: f64,
}

fn main() {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::TRACE)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("no other subscriber has been installed");

    // Up to 2 blocks of 8 items each.
    let mut pool = BlockPool::<Item>::builder()
        .chunks_per_block(NonZero::new(8).unwrap())
        .max_blocks(NonZero::new(2).unwrap())
        .diagnostics(Diagnostics::Verbose)
        .build();

    // The 9th allocation creates the second block.
    let mut items = (0..10)
        .map(|_| {
            pool.allocate(Item {
                x: 0,
                y: 0,
                speed: 0.0,
            })
            .expect("10 items fit into 2 blocks of 8")
        })
        .collect::<Vec<_>>();

    let first = items.first().expect("we allocated 10 items");
    *pool.get_mut(first) = Item {
        x: 10,
        y: 10,
        speed: 0.5,
    };

    let item = pool.get(first);
    eprintln!(
        "Item ({}, {}, {}): {:p}",
        item.x,
        item.y,
        item.speed,
        first.ptr()
    );

    println!(
        "Pool holds {} items in {} blocks, with room for {} more",
        pool.len(),
        pool.block_count(),
        pool.max_capacity().saturating_sub(pool.len())
    );

    // Release in reverse order of allocation.
    while let Some(item) = items.pop() {
        pool.deallocate(item);
    }

    // Dropping the pool releases both blocks.
}
