//! Cirrus Node - target and proxy daemon
//!
//! One binary, two roles. A target keeps the local object cache and
//! serves `/v1/files`; a proxy maintains the cluster map and accepts
//! target registrations. Both roles host their service loop alongside
//! the stats and signal runners under one supervisor group.

pub mod http;
pub mod proxy;
pub mod runners;
pub mod target;
