#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A bounded pool of fixed-size chunks that hands out storage for objects of one type,
//! growing in whole blocks and recycling released chunks through an intrusive free list.
//!
//! This crate provides [`BlockPool`], which is meant for hot loops with a high churn of
//! same-sized objects (entities in a game, particles in a simulation, ...) where the cost and
//! fragmentation of a heap allocation per object are undesirable.
//!
//! # Key Features
//!
//! - **Constant-time allocation and release**: both are a single free list operation
//! - **Block-wise growth**: memory is obtained from the system one block of chunks at a time,
//!   only when every existing chunk is in use
//! - **Bounded capacity**: the pool never creates more than a configured number of blocks and
//!   reports exhaustion as a recoverable [`Error::Exhausted`]
//! - **Owning handles**: [`Chunk<T>`] handles are consumed on release, so a chunk cannot be
//!   released twice, and using a handle with the wrong pool is detected
//! - **Pool-mediated access**: values are reached through [`BlockPool::get()`] and
//!   [`BlockPool::get_mut()`], so no value can be reached once its pool is gone
//! - **Stable addresses**: values never move while allocated
//! - **Configurable diagnostics**: per-pool [`Diagnostics`] emit `tracing` events
//!
//! Memory is only returned to the system when the pool is dropped. Released chunks are never
//! merged or compacted; they simply go back on the free list.
//!
//! # Examples
//!
//! ```rust
//! use std::num::NonZero;
//!
//! use block_pool::BlockPool;
//!
//! struct Particle {
//!     x: f32,
//!     y: f32,
//! }
//!
//! // Up to 2 blocks of 8 particles each.
//! let mut pool = BlockPool::<Particle>::new(NonZero::new(8).unwrap(), NonZero::new(2).unwrap());
//!
//! let particle = pool.allocate(Particle { x: 0.0, y: 0.0 }).unwrap();
//! pool.get_mut(&particle).x += 1.5;
//! assert_eq!(pool.get(&particle).x, 1.5);
//!
//! pool.deallocate(particle);
//! ```
//!
//! Handling exhaustion:
//!
//! ```rust
//! use std::num::NonZero;
//!
//! use block_pool::{BlockPool, Error};
//!
//! let mut pool = BlockPool::<u32>::new(NonZero::new(2).unwrap(), NonZero::new(1).unwrap());
//!
//! let a = pool.allocate(1).unwrap();
//! let b = pool.allocate(2).unwrap();
//!
//! match pool.allocate(3) {
//!     Err(Error::Exhausted { .. }) => println!("pool is full, try again later"),
//!     other => panic!("unexpected result: {other:?}"),
//! }
//!
//! pool.deallocate(a);
//! pool.deallocate(b);
//! ```

mod block;
mod builder;
mod chunk;
mod diagnostics;
mod drop_policy;
mod error;
mod pool;

pub(crate) use block::*;
pub use builder::*;
pub use chunk::*;
pub use diagnostics::*;
pub use drop_policy::*;
pub use error::*;
pub use pool::*;
