//! Rotation Frame Protocol
//!
//! Wire layout of the frames streamed to the peer, plus the decoding side
//! used by the reference monitor.

use crate::domain::orientation::RotationMatrix;
use crate::infrastructure::link::error::FrameError;
use tracing::{debug, trace};

/// Tag byte identifying a rotation-matrix frame
pub const ROTATION_FRAME_TAG: u8 = b'M';

/// Number of matrix elements in a frame
pub const MATRIX_ELEMENTS: usize = 16;

/// Total frame size: tag + 16 little-endian f32
pub const ROTATION_FRAME_LEN: usize = 1 + MATRIX_ELEMENTS * 4;

/// Encode a rotation matrix into its 65-byte wire frame
///
/// # Frame Structure (65 bytes)
///
/// ```text
/// [0]     : 'M' (0x4D)
/// [1-64]  : 16 x f32 little-endian, row-major 4x4 matrix
/// ```
pub fn encode_rotation_frame(matrix: &RotationMatrix) -> [u8; ROTATION_FRAME_LEN] {
    let mut frame = [0u8; ROTATION_FRAME_LEN];
    frame[0] = ROTATION_FRAME_TAG;
    for (i, value) in matrix.as_array().iter().enumerate() {
        let offset = 1 + i * 4;
        frame[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
    frame
}

/// Parse one complete frame
pub fn parse_rotation_frame(bytes: &[u8]) -> Result<RotationMatrix, FrameError> {
    if bytes.len() != ROTATION_FRAME_LEN {
        return Err(FrameError::InvalidLength {
            expected: ROTATION_FRAME_LEN,
            actual: bytes.len(),
        });
    }
    if bytes[0] != ROTATION_FRAME_TAG {
        return Err(FrameError::UnknownTag(bytes[0]));
    }

    let mut values = [0f32; MATRIX_ELEMENTS];
    for (value, chunk) in values.iter_mut().zip(bytes[1..].chunks_exact(4)) {
        *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(RotationMatrix(values))
}

/// Reassembles frames from reads that may split or merge them.
///
/// Bytes that cannot start a frame are dropped and counted so the stream can
/// resynchronise on the next tag.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    pending: Vec<u8>,
    skipped: usize,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of inbound bytes, returning every frame it completes in
    /// arrival order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<RotationMatrix> {
        self.pending.extend_from_slice(bytes);

        let mut frames = Vec::new();
        let mut start = 0;
        while start < self.pending.len() {
            if self.pending[start] != ROTATION_FRAME_TAG {
                start += 1;
                self.skipped += 1;
                continue;
            }
            let end = start + ROTATION_FRAME_LEN;
            if end > self.pending.len() {
                break;
            }
            match parse_rotation_frame(&self.pending[start..end]) {
                Ok(matrix) => frames.push(matrix),
                Err(e) => debug!("Dropping malformed frame: {}", e),
            }
            start = end;
        }
        self.pending.drain(..start);

        #[cfg(debug_assertions)]
        trace!(
            "Assembler: {} frames, {} bytes pending",
            frames.len(),
            self.pending.len()
        );

        frames
    }

    /// Bytes that were discarded while looking for a frame tag
    pub fn skipped_bytes(&self) -> usize {
        self.skipped
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }
}
