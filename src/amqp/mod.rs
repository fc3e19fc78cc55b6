//! Helpers for connecting to a RabbitMq broker and working with AMQP properties.

pub mod configuration;
pub mod convenience;
mod factory;
pub use convenience::BasicPropertiesExt;
pub use factory::ConnectionFactory;
pub use lapin::{Channel, Connection};

pub use lapin::{options, types, BasicProperties};
