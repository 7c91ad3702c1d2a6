use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("invalid inputs format '{0}'")]
    InvalidFormat(String),

    #[error("payload of {0} bytes is not a whole number of f32 elements")]
    MisalignedPayload(usize),

    #[error(
        "data size incompatible with expected format: \
         {elements_per_sample} elements per sample, {total_elements} total, \
         remainder {remainder}"
    )]
    ShapeMismatch {
        elements_per_sample: usize,
        total_elements: usize,
        remainder: usize,
    },

    #[error("malformed protobuf frame: {0}")]
    Frame(#[from] prost::DecodeError),
}
