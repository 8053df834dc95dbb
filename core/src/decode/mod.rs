//! Decoding: format selection, frame compositing, scaling and the worker pool that runs it all
//! off the main thread.

pub mod codec;
pub mod composite;
pub mod pool;
pub mod resize;
pub mod task;

pub use codec::{DecoderKind, ImageMetadata, RawFrame};
pub use composite::{Blend, Disposal, FrameCompositor};
pub use pool::{DecodePool, Schedule};
pub use task::{DecodeKey, DecodeOutcome, DecodeTask, DecodeTelemetry, DecodedSummary};
