//! Pooling for [`lapin::Channel`]s and [`lapin::Connection`]s, built on [`deadpool`].
//!
//! Broken channels are disposed of and recreated on demand, while connections are
//! shared across channels to limit overhead.
//! [`LapinTransport`](crate::transport::LapinTransport) hands out channels from a [`ChannelPool`].
//!
//! ```rust
//! use carrot_courier::amqp::configuration::RabbitMqSettings;
//! use carrot_courier::amqp::ConnectionFactory;
//! use carrot_courier::pool::channel_pool;
//!
//! fn example() -> anyhow::Result<()> {
//!     let factory = ConnectionFactory::new_from_config(&RabbitMqSettings::default())?;
//!     // At most 2 connections, shared by at most 16 channels.
//!     let pool = channel_pool(factory, 2, 16, false)?;
//!     # drop(pool);
//!     Ok(())
//! }
//! ```

mod channel;
mod connection;
mod error;

pub use channel::{ChannelManager, ChannelPool};
pub use connection::ConnectionPool;
pub use error::Error;

use crate::amqp::ConnectionFactory;

/// Build a [`ChannelPool`] backed by its own [`ConnectionPool`].
///
/// `publisher_confirms` toggles publisher confirmations on every channel of the pool.
pub fn channel_pool(
    connection_factory: ConnectionFactory,
    max_connections: usize,
    max_channels: usize,
    publisher_confirms: bool,
) -> Result<ChannelPool, anyhow::Error> {
    let connection_pool = ConnectionPool::builder(connection_factory)
        .max_size(max_connections)
        .build()?;
    let mut manager = ChannelManager::new(connection_pool);
    if !publisher_confirms {
        manager = manager.without_publisher_confirmations();
    }
    Ok(ChannelPool::builder(manager).max_size(max_channels).build()?)
}
