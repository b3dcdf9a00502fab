//! Audio framing and PCM conversion.
//!
//! The client streams mono PCM float32 at 16 kHz in chunks of arbitrary
//! length; everything downstream works on fixed 20 ms frames. The
//! [`FrameAssembler`] does the reframing, carrying any partial tail over to
//! the next chunk.

/// Input sample rate expected from the client.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Frame length in samples: 20 ms at 16 kHz.
pub const FRAME_SAMPLES: usize = 320;

/// One fixed-size frame of microphone audio.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Mono PCM samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Monotonic sequence number within the connection.
    pub seq: u64,
}

/// Reassembles arbitrary-length PCM chunks into fixed frames.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    pending: Vec<f32>,
    next_seq: u64,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw little-endian float32 bytes, returning all complete frames.
    ///
    /// A trailing partial sample (len not divisible by 4) is dropped; a
    /// trailing partial frame is buffered until more audio arrives.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<AudioFrame> {
        self.pending.extend(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        );
        self.drain_frames()
    }

    /// Feed already-decoded samples.
    pub fn push_samples(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);
        self.drain_frames()
    }

    fn drain_frames(&mut self) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        while self.pending.len() >= FRAME_SAMPLES {
            let samples: Vec<f32> = self.pending.drain(..FRAME_SAMPLES).collect();
            frames.push(AudioFrame {
                samples,
                seq: self.next_seq,
            });
            self.next_seq += 1;
        }
        frames
    }

    /// Samples buffered but not yet forming a full frame.
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }
}

/// Convert float samples to 16-bit PCM little-endian bytes.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Convert float samples to i16 values.
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
        .collect()
}
