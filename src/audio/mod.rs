pub mod opus_mixer;

use std::sync::Arc;

pub use opus_mixer::OpusMixer;

/// Output format of the mixer: 48 kHz, 16-bit, stereo, 20 ms frames.
pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: usize = 2;
pub const FRAME_SIZE_MS: usize = 20;
pub const SAMPLES_PER_FRAME: usize = SAMPLE_RATE as usize * FRAME_SIZE_MS * CHANNELS / 1000;
/// Bytes produced by one fully mixed frame (960 samples * 2 channels * 2 bytes).
pub const FRAME_BYTES: usize = SAMPLES_PER_FRAME * 2;

/// Real-time mixer combining per-speaker opus streams into a single PCM
/// stream. Thread-safe: one task writes packets while another reads mixes.
pub trait Mixer: Send + Sync {
    /// Decodes and queues one opus packet for the given speaker. Packets for
    /// unknown speakers allocate a decoder on first sight. Invalid packets
    /// are dropped.
    fn write_opus_packet(&self, user_id: &str, opus: &[u8]);

    /// Mixes the next queued frame of every speaker into `buf` (signed
    /// 16-bit LE, saturated addition) and returns the number of bytes
    /// written. Returns 0 when no speaker has a queued frame.
    fn read_mixed_pcm(&self, buf: &mut [u8]) -> usize;

    /// Discards all decoders and queued frames. Subsequent writes and reads
    /// are no-ops.
    fn close(&self);
}

/// Constructor used by the session manager so tests can substitute mixers.
pub type MixerFactory = Arc<dyn Fn() -> Arc<dyn Mixer> + Send + Sync>;
