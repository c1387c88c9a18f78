//! Streaming audio engine: format readers, codec decoding, gapless trimming and device output
//! wired together as a three-stage threaded pipeline.
//!
//! Hosts create an [`Engine`] with an [`output::OutputBackend`], open [`source::ByteSource`]s
//! on it and consume [`event::Event`]s until every stream reported its end.

pub mod config;
pub mod decoder;
pub mod engine;
pub mod event;
pub mod interrupt;
pub mod output;
pub mod packet;
pub mod queue;
pub mod reader;
pub mod source;
pub mod status;

pub use config::EngineConfig;
pub use engine::Engine;
pub use event::{ConfigureEvent, ControlEvent, Event};
pub use interrupt::Interrupt;
