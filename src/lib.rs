#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg, doc_cfg_hide))]
#![cfg_attr(docsrs, deny(missing_docs))]
#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![allow(unused_unsafe)]
//! An unbounded lock-free single-producer, single-consumer (SPSC) FIFO
//! queue that recycles its nodes.
//!
//! The queue is a singly-linked list of heap-allocated nodes, plus a
//! producer-owned cache of nodes the consumer has already drained. Because
//! popped nodes flow back to the producer for reuse, a queue whose consumer
//! keeps up with its producer reaches a steady state in which [`push`] never
//! allocates and [`pop`] never deallocates, all without locks, spinning, or
//! a fixed capacity.
//!
//! # Usage
//!
//! An [`SpscQueue`] is [`split`] into a [`Producer`] and a [`Consumer`]
//! half. Each half may be sent to its own thread; neither half can be
//! cloned, so a second producer or consumer is a compile error rather than a
//! data race.
//!
//! ```
//! use reflux::SpscQueue;
//!
//! let (mut tx, mut rx) = SpscQueue::<i32>::new().split();
//!
//! std::thread::spawn(move || {
//!     for i in 0..4 {
//!         tx.push(i).expect("the global allocator should not fail");
//!     }
//! });
//!
//! let mut next = 0;
//! while next < 4 {
//!     if let Some(i) = rx.pop() {
//!         assert_eq!(i, next);
//!         next += 1;
//!     } else {
//!         // The queue never blocks; waiting is the caller's business.
//!         std::thread::yield_now();
//!     }
//! }
//! ```
//!
//! # Allocators
//!
//! Nodes are allocated through the [`mem::Alloc`] trait, defaulting to the
//! global allocator ([`mem::Heap`]). A queue can be built over a custom
//! allocator with [`SpscQueue::try_new_in`]; allocation failure surfaces as
//! an error from the producer-side operations rather than a panic.
//!
//! # Feature flags
//!
//! - `std` (default): implements [`std::error::Error`] for this crate's
//!   error types. The queue itself only requires `core` and `alloc`.
//! - `no-cache-pad`: disables cache-line padding of the queue's contended
//!   fields, for targets with no data cache.
//!
//! [`push`]: Producer::push
//! [`pop`]: Consumer::pop
//! [`split`]: SpscQueue::split
extern crate alloc;
#[cfg(test)]
extern crate std;

#[macro_use]
pub(crate) mod util;

pub mod mem;
pub mod spsc_queue;

#[doc(inline)]
pub use spsc_queue::{Consumer, Producer, SpscQueue};

pub(crate) mod loom;
