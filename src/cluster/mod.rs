// SPDX-License-Identifier: MIT
//! Cluster fan-out: the driver contract for horizontal scale-out and
//! the router built on top of it that resolves "send to this identity" into
//! either a local delivery or a cross-node publish.
//!
//! Only an in-memory adapter ships here — no concrete broker driver (Redis
//! Streams, NATS, Kafka) is part of this crate. A production deployment
//! supplies its own [`adapter::EventAdapter`] implementation.

pub mod adapter;
pub mod router;
