//! Tollgate - admission control and task routing
//!
//! Throttles callers of guarded operations with fixed-window limits whose
//! counters live in process memory or in Redis, so replicas of a service
//! share one budget per caller. When the counter store is unreachable the
//! limiter admits the request rather than failing it.
//!
//! The [`routing`] module classifies asynchronous tasks onto broker queues.

pub mod config;
pub mod error;
pub mod grpc;
pub mod identity;
pub mod ratelimit;
pub mod routing;
