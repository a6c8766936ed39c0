//! Client side of the message bus: transports, routing and request/response.

pub mod client;
pub mod memory;
pub mod message;
pub mod pattern;
pub mod request;
pub mod router;
pub mod stomp;
pub mod transport;

pub use client::{BusClient, BusClientBuilder, BusError, BusResult};
pub use memory::{InMemoryBroker, Login, MemoryTransport};
pub use message::{Headers, Message, Payload, REPLY_TO};
pub use pattern::TopicPattern;
pub use router::{Callback, RouterError, RouterResult, TopicRouter};
pub use stomp::StompTransport;
pub use transport::{
    Credentials, MessageHandler, MessageTransport, MockMessageTransport, SubscriptionHandle,
    TransportError, TransportRegistry, TransportResult,
};
