use crate::error::CodecError;
use crate::format::InputsFormat;

/// A decoded batch of input samples: flat f32 storage plus the full shape
/// `(n_samples, *sample_shape)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Vec<usize>,
}

impl Tensor {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        Self { data, shape }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn num_samples(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Flat little-endian f32 serialization, the inverse of [`decode_batch`].
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() * 4);
        for v in &self.data {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }
}

/// Decode an opaque payload into a shaped sample batch.
///
/// The payload is interpreted as a flat little-endian f32 array. The element
/// count must be a whole multiple of the per-sample size declared by
/// `format`; the result has shape `(n, *format.shape)`. Rank-4 batches whose
/// trailing dim looks like a channel axis (1 or 3) and whose first spatial
/// dim is not 1 are transposed from HWC-last to CHW-first.
pub fn decode_batch(payload: &[u8], format: &InputsFormat) -> Result<Tensor, CodecError> {
    if payload.len() % 4 != 0 {
        return Err(CodecError::MisalignedPayload(payload.len()));
    }

    let mut data = Vec::with_capacity(payload.len() / 4);
    for chunk in payload.chunks_exact(4) {
        data.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }

    let sample_size = format.sample_size();
    let total = data.len();
    if sample_size == 0 || total % sample_size != 0 {
        return Err(CodecError::ShapeMismatch {
            elements_per_sample: sample_size,
            total_elements: total,
            remainder: if sample_size == 0 { total } else { total % sample_size },
        });
    }

    let n = total / sample_size;
    let mut shape = Vec::with_capacity(format.shape.len() + 1);
    shape.push(n);
    shape.extend_from_slice(&format.shape);

    let tensor = Tensor::new(data, shape);
    Ok(maybe_channels_first(tensor))
}

/// Transpose NHWC to NCHW when the layout heuristics say the last axis is a
/// channel axis. Batches already channels-first (H == 1 marker) and batches
/// of rank != 4 pass through untouched.
fn maybe_channels_first(t: Tensor) -> Tensor {
    if t.shape.len() != 4 {
        return t;
    }
    let (n, h, w, c) = (t.shape[0], t.shape[1], t.shape[2], t.shape[3]);
    if !(c == 1 || c == 3) || h == 1 {
        return t;
    }

    let mut out = vec![0.0f32; t.data.len()];
    for ni in 0..n {
        for hi in 0..h {
            for wi in 0..w {
                for ci in 0..c {
                    let src = ((ni * h + hi) * w + wi) * c + ci;
                    let dst = ((ni * c + ci) * h + hi) * w + wi;
                    out[dst] = t.data[src];
                }
            }
        }
    }

    Tensor::new(out, vec![n, c, h, w])
}
