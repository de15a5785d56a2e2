//! Backend side of the decoupled streaming protocol
//!
//! A backend receives one request and answers it with any number of
//! responses, produced lazily and terminated by exactly one final item.

pub mod producer;
pub mod producers;
pub mod responder;
pub mod server;

pub use producer::{ChunkProducer, ProducerFactory};
pub use producers::{
    ByteChunkFactory, ByteChunkProducer, FrameSequenceFactory, FrameSequenceProducer,
    SpooledFactory, SpooledProducer, DEFAULT_FRAMES_PER_SEQUENCE,
};
pub use responder::{CancelFlag, DecoupledResponder, ResponseSender};
pub use server::{BackendServer, ServerHandle};
