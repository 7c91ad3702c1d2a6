//! Protobuf message structs for the three payloads this service exchanges.
//!
//! The `.proto` contracts are owned by the producing services; these structs
//! mirror them field-for-field via prost derives, so no codegen step is
//! needed. Frames on the broker are length-delimited.

use prost::Message;

use crate::error::CodecError;

/// Labeled input batch, consumed from `{session_id}_inputs_cal_queue`.
#[derive(Clone, PartialEq, Message)]
pub struct InputsBatch {
    #[prost(int32, tag = "1")]
    pub batch_index: i32,
    /// Flat little-endian f32 tensor data; shape comes from the session's
    /// `inputs_format`.
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
    #[prost(int32, repeated, tag = "3")]
    pub labels: Vec<i32>,
    #[prost(bool, tag = "4")]
    pub is_last_batch: bool,
}

/// One sample's class-probability vector.
#[derive(Clone, PartialEq, Message)]
pub struct PredictionList {
    #[prost(float, repeated, tag = "1")]
    pub values: Vec<f32>,
}

/// Predicted-probability batch, consumed from `{session_id}_outputs_cal_queue`.
#[derive(Clone, PartialEq, Message)]
pub struct PredictionsBatch {
    #[prost(int32, tag = "1")]
    pub batch_index: i32,
    #[prost(message, repeated, tag = "2")]
    pub pred: Vec<PredictionList>,
    #[prost(bool, tag = "3")]
    pub eof: bool,
}

/// Fully-paired batch, published to the observability exchange once both
/// halves of a `batch_index` have arrived.
#[derive(Clone, PartialEq, Message)]
pub struct PairedBatch {
    #[prost(int32, tag = "1")]
    pub batch_index: i32,
    #[prost(string, tag = "2")]
    pub user_id: String,
    #[prost(string, tag = "3")]
    pub session_id: String,
    #[prost(bytes = "vec", tag = "4")]
    pub data: Vec<u8>,
    #[prost(int32, repeated, tag = "5")]
    pub labels: Vec<i32>,
    #[prost(message, repeated, tag = "6")]
    pub pred: Vec<PredictionList>,
}

/// Encode a message as a length-delimited frame, ready for publishing.
pub fn encode_frame<M: Message>(msg: &M) -> Vec<u8> {
    msg.encode_length_delimited_to_vec()
}

/// Decode a length-delimited frame as consumed from the broker.
pub fn decode_frame<M: Message + Default>(frame: &[u8]) -> Result<M, CodecError> {
    Ok(M::decode_length_delimited(frame)?)
}
