//! Consistent hashing ring for deterministic job placement.
//!
//! This crate implements a consistent hash ring that maps job names to member
//! identifiers. Every process that builds a ring from the same member list
//! computes the same owner for every job, without talking to its peers.
//!
//! The ring uses virtual nodes (vnodes): each member gets `replicas` positions
//! on the ring, determined by `hash(replica_index ++ member)`. More vnodes per
//! member = more uniform distribution, and adding or removing one member only
//! moves the keys that land in its territory.

mod hasher;
mod ring;

pub use hasher::RingHasher;
pub use ring::{HashRing, Reassignment};
