//! Wire boundary of the calibration service.
//!
//! Everything that crosses the broker is a length-delimited protobuf frame;
//! this crate owns the message structs, the framing helpers and the decoding
//! of raw input tensors into shaped sample batches. Nothing in here touches
//! the broker or the database.

pub mod error;
pub mod format;
pub mod tensor;
pub mod wire;

pub use error::CodecError;
pub use format::InputsFormat;
pub use tensor::Tensor;
pub use wire::{InputsBatch, PairedBatch, PredictionList, PredictionsBatch, decode_frame, encode_frame};
