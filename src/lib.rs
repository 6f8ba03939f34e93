//! # flight-consensus
//!
//! A layered toolkit of distributed-systems abstractions for replicated,
//! crash-tolerant decision making among a small, statically known set of
//! peer processes running on a single host and talking over local datagram
//! sockets: a Perfect Link, a Perfect Failure Detector, Best-Effort and
//! Eager Reliable Broadcast, Hierarchical Consensus, Hierarchical Leader
//! Election, and a Majority Voting coordinator built on top of all of the
//! above.
//!
//! Every abstraction instance owns exactly one worker task draining its own
//! serial event queue (see [`runtime`]); abstractions compose by
//! registering on or subscribing to one another, never by sharing mutable
//! state directly.
//!
//! This crate provides the CORE abstractions only. Wiring several peer
//! processes together into an actual flight-control application — deciding
//! what to vote on and what to do with a delivered value — is the job of an
//! external collaborator; see `bin/main.rs` for a minimal demo harness.

pub mod beb;
pub mod cli;
pub mod config;
pub mod consensus;
pub mod election;
pub mod erb;
pub mod errors;
pub mod link;
pub mod logging;
pub mod peer;
pub mod pfd;
pub mod runtime;
pub mod voting;
