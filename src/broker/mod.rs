//! Broker plumbing: sessions, retrying connects, senders and consumers.

pub mod amqp;
pub mod connection;
pub mod consumer;
pub mod memory;
pub mod message;
pub mod sender;
pub mod transport;

pub use connection::{
    ConnectParams, ConnectionManager, ConnectionState, MIN_RETRY_PAUSE, Opener, RetryPolicy,
    RetryingOpener,
};
pub use consumer::{AsyncConsumer, BulkConsumer, MessageFilter, Subscription};
pub use message::{Delivery, HeaderValue, Headers, MESSAGE_TYPE, MSG_TYPE, Message};
pub use sender::MessageSender;
pub use transport::{DeliveryReceiver, Fetched, Transport};
