use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use audiopus::coder::Decoder;
use audiopus::{Channels, SampleRate};
use tracing::debug;

use super::{Mixer, CHANNELS, SAMPLES_PER_FRAME};

/// Per-speaker opus decoding with FIFO frame queues and saturated mixing.
///
/// Every speaker gets a dedicated decoder (opus decoders are stateful) and a
/// queue holding decoded frames. Each `read_mixed_pcm` consumes at most one
/// frame per speaker.
pub struct OpusMixer {
    inner: Mutex<MixerState>,
}

struct MixerState {
    decoders: HashMap<String, Decoder>,
    queues: HashMap<String, VecDeque<Vec<i16>>>,
    closed: bool,
}

impl OpusMixer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MixerState {
                decoders: HashMap::new(),
                queues: HashMap::new(),
                closed: false,
            }),
        }
    }
}

impl Default for OpusMixer {
    fn default() -> Self {
        Self::new()
    }
}

impl Mixer for OpusMixer {
    fn write_opus_packet(&self, user_id: &str, opus: &[u8]) {
        if opus.is_empty() {
            return;
        }
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if guard.closed {
            return;
        }
        let MixerState {
            decoders, queues, ..
        } = &mut *guard;

        let dec = match decoders.entry(user_id.to_string()) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                match Decoder::new(SampleRate::Hz48000, Channels::Stereo) {
                    Ok(dec) => {
                        queues.insert(user_id.to_string(), VecDeque::new());
                        entry.insert(dec)
                    }
                    Err(err) => {
                        debug!(user_id, error = %err, "failed to allocate opus decoder");
                        return;
                    }
                }
            }
        };

        let mut pcm = vec![0i16; SAMPLES_PER_FRAME];
        let decoded = match dec.decode(Some(opus), &mut pcm, false) {
            Ok(samples_per_channel) => samples_per_channel,
            Err(err) => {
                debug!(user_id, error = %err, "failed to decode opus packet");
                return;
            }
        };
        if decoded == 0 {
            return;
        }

        let total_samples = (decoded * CHANNELS).min(SAMPLES_PER_FRAME);
        pcm.truncate(total_samples);
        if let Some(queue) = queues.get_mut(user_id) {
            queue.push_back(pcm);
        }
    }

    fn read_mixed_pcm(&self, buf: &mut [u8]) -> usize {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return 0;
        }
        if !state.queues.values().any(|q| !q.is_empty()) {
            return 0;
        }

        let mut mixed = [0i32; SAMPLES_PER_FRAME];
        for queue in state.queues.values_mut() {
            let Some(frame) = queue.pop_front() else {
                continue;
            };
            for (slot, sample) in mixed.iter_mut().zip(frame.iter()) {
                *slot += *sample as i32;
            }
        }

        let to_write = (buf.len() / 2).min(SAMPLES_PER_FRAME);
        for (i, slot) in mixed.iter().take(to_write).enumerate() {
            let sample = (*slot).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            buf[i * 2..i * 2 + 2].copy_from_slice(&sample.to_le_bytes());
        }
        to_write * 2
    }

    fn close(&self) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        state.decoders.clear();
        state.queues.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::FRAME_BYTES;
    use audiopus::coder::Encoder;
    use audiopus::Application;

    fn encode_silence_frame() -> Vec<u8> {
        let mut encoder = Encoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Voip)
            .expect("encoder");
        let pcm = vec![0i16; SAMPLES_PER_FRAME];
        let mut out = vec![0u8; 4000];
        let n = encoder.encode(&pcm, &mut out).expect("encode");
        out.truncate(n);
        out
    }

    #[test]
    fn read_returns_zero_when_no_frames_queued() {
        let mixer = OpusMixer::new();
        let mut buf = [0u8; FRAME_BYTES];
        assert_eq!(mixer.read_mixed_pcm(&mut buf), 0);
    }

    #[test]
    fn empty_and_garbage_packets_are_dropped() {
        let mixer = OpusMixer::new();
        mixer.write_opus_packet("u1", &[]);
        // Code-3 packet with a zero frame count is invalid per RFC 6716.
        mixer.write_opus_packet("u1", &[0xff, 0x00]);

        let mut buf = [0u8; FRAME_BYTES];
        assert_eq!(mixer.read_mixed_pcm(&mut buf), 0);
    }

    #[test]
    fn valid_packet_produces_one_full_frame() {
        let mixer = OpusMixer::new();
        mixer.write_opus_packet("u1", &encode_silence_frame());

        let mut buf = [0u8; FRAME_BYTES];
        assert_eq!(mixer.read_mixed_pcm(&mut buf), FRAME_BYTES);
        // The queue held exactly one frame.
        assert_eq!(mixer.read_mixed_pcm(&mut buf), 0);
    }

    #[test]
    fn frames_are_consumed_in_fifo_order_one_per_read() {
        let mixer = OpusMixer::new();
        let packet = encode_silence_frame();
        mixer.write_opus_packet("u1", &packet);
        mixer.write_opus_packet("u1", &packet);

        let mut buf = [0u8; FRAME_BYTES];
        assert_eq!(mixer.read_mixed_pcm(&mut buf), FRAME_BYTES);
        assert_eq!(mixer.read_mixed_pcm(&mut buf), FRAME_BYTES);
        assert_eq!(mixer.read_mixed_pcm(&mut buf), 0);
    }

    #[test]
    fn multiple_speakers_mix_into_a_single_frame() {
        let mixer = OpusMixer::new();
        let packet = encode_silence_frame();
        mixer.write_opus_packet("u1", &packet);
        mixer.write_opus_packet("u2", &packet);

        let mut buf = [0u8; FRAME_BYTES];
        assert_eq!(mixer.read_mixed_pcm(&mut buf), FRAME_BYTES);
        assert_eq!(mixer.read_mixed_pcm(&mut buf), 0);
    }

    #[test]
    fn short_read_buffer_caps_bytes_written() {
        let mixer = OpusMixer::new();
        mixer.write_opus_packet("u1", &encode_silence_frame());

        let mut buf = [0u8; 100];
        assert_eq!(mixer.read_mixed_pcm(&mut buf), 100);
    }

    #[test]
    fn close_discards_state_and_ignores_later_io() {
        let mixer = OpusMixer::new();
        mixer.write_opus_packet("u1", &encode_silence_frame());
        mixer.close();

        let mut buf = [0u8; FRAME_BYTES];
        assert_eq!(mixer.read_mixed_pcm(&mut buf), 0);
        mixer.write_opus_packet("u1", &encode_silence_frame());
        assert_eq!(mixer.read_mixed_pcm(&mut buf), 0);
    }
}
