//! brisk-redis: a Redis bridge engine for the pub/sub bus.
//!
//! RESP codec, a reconnecting subscription connection, and a strict
//! one-in-flight command FIFO.  Attach the engine to a bus to mirror its
//! subscription set onto a Redis server; make it the default engine to
//! route publishes through the server (the echo on the subscription
//! connection is what delivers them back, cluster-wide).

mod engine;
mod error;
mod resp;

use std::sync::Arc;

use brisk_pubsub::Bus;

pub use engine::{RedisEngine, RedisSettings, ReplyCallback};
pub use error::RedisError;
pub use resp::{RespArg, RespCodec, RespValue, encode_command};

/// Create, attach, and install the engine as the bus's default in one step.
pub fn activate(bus: &Bus, settings: RedisSettings) -> Arc<RedisEngine> {
    let engine = RedisEngine::create(bus.clone(), settings);
    let as_engine: Arc<dyn brisk_pubsub::Engine> = engine.clone();
    bus.attach(as_engine.clone());
    bus.set_default_engine(Some(as_engine));
    engine
}
