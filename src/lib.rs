//! `carrot-courier` binds RabbitMQ queues to typed message handlers, built on top of
//! [`lapin`].
//!
//! Every delivery is deserialized into the request type of its handler, dispatched to a
//! service resolved from your service provider and then acknowledged according to the
//! outcome. RPC consumers send the response back to the `reply_to` address of the request.
//! The trace context travels with every message, in both directions.
//!
//! [`Consumer::builder`](crate::consumers::Consumer::builder) and
//! [`Publisher::builder`](crate::publishers::Publisher::builder) are the best starting points.
//! [`ConsumerGroup`](crate::consumers::ConsumerGroup) manages the lifecycle of a set of
//! consumers.

pub mod consumers;
pub mod publishers;
pub mod serialization;
pub mod services;
pub mod telemetry;
pub mod transport;

pub mod amqp;
pub mod pool;
