//! A thread-safe, key-addressable memoization cache.
//!
//! The central type is [`Cache`]. It guarantees exactly-once construction per
//! key under arbitrary concurrency: the first caller of
//! [`get_or_create`](Cache::get_or_create) for an absent key runs the
//! caller-supplied factory, and every concurrent caller for the same key
//! blocks until that one build resolves and then observes the identical
//! outcome. Builds for distinct keys proceed fully in parallel.
//!
//! Eviction is purely caller-driven via [`remove`](Cache::remove) and
//! [`clear`](Cache::clear); an optional disposer runs exactly once per
//! evicted entry. Successful and failed builds are observable through
//! synchronous [`Created`](Cache::on_created) and
//! [`Failed`](Cache::on_failed) events.

#![warn(missing_docs)]

mod cache;
mod event;

pub use cache::*;
pub use event::Subscription;
