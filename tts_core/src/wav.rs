use std::io::Cursor;

use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;

use crate::format::CanonicalFormat;

pub const HEADER_LEN: usize = 44;

/// RIFF and data sizes are unknown up front for a live stream; players treat
/// these values as "read until end of stream".
const STREAMING_RIFF_SIZE: u32 = 0xFFFF_FFFF - 8;
const STREAMING_DATA_SIZE: u32 = 0xFFFF_FFFF;

/// 44-byte canonical WAV header for a stream of unknown length.
pub fn streaming_header(format: &CanonicalFormat) -> Bytes {
    Bytes::from(header(format, STREAMING_RIFF_SIZE, STREAMING_DATA_SIZE).to_vec())
}

fn header(format: &CanonicalFormat, riff_size: u32, data_size: u32) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0..4].copy_from_slice(b"RIFF");
    out[4..8].copy_from_slice(&riff_size.to_le_bytes());
    out[8..12].copy_from_slice(b"WAVE");

    out[12..16].copy_from_slice(b"fmt ");
    out[16..20].copy_from_slice(&16u32.to_le_bytes());
    out[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM
    out[22..24].copy_from_slice(&format.channels.to_le_bytes());
    out[24..28].copy_from_slice(&format.sample_rate.to_le_bytes());
    out[28..32].copy_from_slice(&format.byte_rate().to_le_bytes());
    out[32..34].copy_from_slice(&format.block_align().to_le_bytes());
    out[34..36].copy_from_slice(&format.bits_per_sample.to_le_bytes());

    out[36..40].copy_from_slice(b"data");
    out[40..44].copy_from_slice(&data_size.to_le_bytes());
    out
}

/// Wraps complete canonical PCM in a finite WAV container.
pub fn encode_wav(pcm: &[u8], format: &CanonicalFormat) -> anyhow::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: format.bits_per_sample,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(HEADER_LEN + pcm.len()));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| anyhow::anyhow!("Failed to create WAV writer: {}", e))?;
        let mut samples = writer.get_i16_writer(pcm.len() as u32 / 2);
        for pair in pcm.chunks_exact(2) {
            samples.write_sample(i16::from_le_bytes([pair[0], pair[1]]));
        }
        samples
            .flush()
            .map_err(|e| anyhow::anyhow!("Failed to write WAV samples: {}", e))?;
        writer
            .finalize()
            .map_err(|e| anyhow::anyhow!("Failed to finalize WAV: {}", e))?;
    }
    Ok(cursor.into_inner())
}

pub fn encode_wav_base64(pcm: &[u8], format: &CanonicalFormat) -> anyhow::Result<String> {
    Ok(general_purpose::STANDARD.encode(encode_wav(pcm, format)?))
}

/// Zeroed PCM lasting `duration_ms`, whole frames only.
pub fn silence(duration_ms: u64, format: &CanonicalFormat) -> Bytes {
    let frames = format.sample_rate as u64 * duration_ms / 1000;
    Bytes::from(vec![0u8; frames as usize * format.block_align() as usize])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_header_layout() {
        let fmt = CanonicalFormat::default();
        let h = streaming_header(&fmt);
        assert_eq!(h.len(), HEADER_LEN);
        assert_eq!(&h[0..4], b"RIFF");
        assert_eq!(&h[4..8], &(0xFFFF_FFFFu32 - 8).to_le_bytes());
        assert_eq!(&h[8..16], b"WAVEfmt ");
        assert_eq!(u16::from_le_bytes([h[22], h[23]]), 2);
        assert_eq!(u32::from_le_bytes([h[24], h[25], h[26], h[27]]), 22050);
        assert_eq!(u32::from_le_bytes([h[28], h[29], h[30], h[31]]), 22050 * 4);
        assert_eq!(u16::from_le_bytes([h[32], h[33]]), 4);
        assert_eq!(u16::from_le_bytes([h[34], h[35]]), 16);
        assert_eq!(&h[36..40], b"data");
        assert_eq!(&h[40..44], &[0xFF; 4]);
    }

    #[test]
    fn test_encode_wav_readable_by_hound() {
        let fmt = CanonicalFormat::default();
        let pcm: Vec<u8> = [1i16, -1, 300, -300]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let wav = encode_wav(&pcm, &fmt).unwrap();
        assert_eq!(wav.len(), HEADER_LEN + pcm.len());

        let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().channels, 2);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![1, -1, 300, -300]);
    }

    #[test]
    fn test_encode_wav_base64_decodes() {
        let fmt = CanonicalFormat::default();
        let encoded = encode_wav_base64(&[0, 0, 0, 0], &fmt).unwrap();
        let decoded = general_purpose::STANDARD.decode(encoded).unwrap();
        assert_eq!(&decoded[0..4], b"RIFF");
    }

    #[test]
    fn test_silence_is_frame_aligned() {
        let fmt = CanonicalFormat::default();
        let s = silence(100, &fmt);
        assert_eq!(s.len(), 2205 * 4);
        assert!(s.iter().all(|b| *b == 0));
        assert!(silence(0, &fmt).is_empty());
    }
}
