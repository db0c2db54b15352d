use crate::models::WaveformMeta;

/// Turns a decoded waveform into the opaque payload bytes stored in a
/// waveform table, and back.
///
/// The cache never looks inside the payload. A codec that changes its byte
/// layout must be paired with a bump of the store's current version so older
/// rows read as stale instead of being mis-decoded.
pub trait WaveformCodec {
    type Waveform;

    fn encode(&self, waveform: &Self::Waveform) -> Vec<u8>;

    /// `None` means the payload is unusable; the row is then dropped.
    fn decode(&self, meta: &WaveformMeta, payload: &[u8]) -> Option<Self::Waveform>;
}
