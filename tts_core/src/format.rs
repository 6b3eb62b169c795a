//! Conversion of backend output into the one format every session emits.

use async_stream::try_stream;
use bytes::Bytes;
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TtsError};
use crate::process::{run_filter, CommandSpec};
use crate::session::SynthesisContext;
use crate::{into_audio_stream, AudioByteStream};

/// Signed 16-bit little-endian interleaved PCM at a fixed rate and channel
/// count. Defaults to 22050 Hz stereo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl Default for CanonicalFormat {
    fn default() -> Self {
        Self::stereo(22050)
    }
}

impl CanonicalFormat {
    pub fn stereo(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 2,
            bits_per_sample: 16,
        }
    }

    pub fn block_align(&self) -> u16 {
        self.channels * (self.bits_per_sample / 8)
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.block_align() as u32
    }
}

/// What a backend produces before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceFormat {
    /// Raw signed 16-bit little-endian PCM.
    Pcm { sample_rate: u32, channels: u16 },
    /// A RIFF/WAVE container, possibly with unknown sizes.
    Wav,
    Mp3,
}

impl SourceFormat {
    fn decoder_input_args(&self) -> Vec<String> {
        match self {
            Self::Pcm {
                sample_rate,
                channels,
            } => vec![
                "-f".into(),
                "s16le".into(),
                "-ar".into(),
                sample_rate.to_string(),
                "-ac".into(),
                channels.to_string(),
            ],
            Self::Wav => vec!["-f".into(), "wav".into()],
            Self::Mp3 => vec!["-f".into(), "mp3".into()],
        }
    }
}

/// External decoder used for compressed or non-canonical input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub program: String,
    /// Replaces the generated argument list entirely when set.
    #[serde(default)]
    pub args: Option<Vec<String>>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            args: None,
        }
    }
}

impl DecoderConfig {
    pub fn custom<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: Some(args.into_iter().map(Into::into).collect()),
        }
    }

    pub fn command(&self, source: SourceFormat, format: &CanonicalFormat) -> CommandSpec {
        if let Some(args) = &self.args {
            return CommandSpec::new(self.program.clone(), args.clone());
        }
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
        args.extend(source.decoder_input_args());
        args.extend(
            [
                "-i",
                "pipe:0",
                "-f",
                "s16le",
                "-acodec",
                "pcm_s16le",
                "-ar",
            ]
            .map(String::from),
        );
        args.push(format.sample_rate.to_string());
        args.push("-ac".into());
        args.push(format.channels.to_string());
        args.push("pipe:1".into());
        CommandSpec::new(self.program.clone(), args)
    }
}

/// Duplicates each 16-bit mono sample into left and right.
///
/// Chunk boundaries may split a sample; the dangling byte is carried into the
/// next call.
#[derive(Debug, Default)]
pub struct Upmixer {
    carry: Option<u8>,
}

impl Upmixer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity((input.len() + 1) * 2);
        let mut rest = input;
        if let Some(lo) = self.carry.take() {
            match rest.split_first() {
                Some((&hi, tail)) => {
                    out.extend_from_slice(&[lo, hi, lo, hi]);
                    rest = tail;
                }
                None => {
                    self.carry = Some(lo);
                    return out;
                }
            }
        }
        let mut samples = rest.chunks_exact(2);
        for s in &mut samples {
            out.extend_from_slice(&[s[0], s[1], s[0], s[1]]);
        }
        if let [odd] = samples.remainder() {
            self.carry = Some(*odd);
        }
        out
    }

    /// Bytes held back waiting for the rest of a sample.
    pub fn pending(&self) -> usize {
        usize::from(self.carry.is_some())
    }
}

/// Re-chunks a byte stream so every emitted chunk holds whole frames.
#[derive(Debug)]
pub struct FrameAligner {
    frame: usize,
    carry: Vec<u8>,
}

impl FrameAligner {
    pub fn new(frame: usize) -> Self {
        Self {
            frame: frame.max(1),
            carry: Vec::new(),
        }
    }

    pub fn push(&mut self, input: &[u8]) -> Vec<u8> {
        self.carry.extend_from_slice(input);
        let whole = self.carry.len() - self.carry.len() % self.frame;
        let rest = self.carry.split_off(whole);
        std::mem::replace(&mut self.carry, rest)
    }

    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}

/// Layout of the PCM payload inside a WAV stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavLayout {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

const MAX_WAV_HEADER: usize = 64 * 1024;

/// Incremental RIFF/WAVE parser that finds the start of the data chunk.
///
/// Declared sizes are ignored; streamed WAV (espeak-ng, ffmpeg on a pipe)
/// carries placeholder lengths.
#[derive(Debug, Default)]
pub struct WavDemuxer {
    buffer: Vec<u8>,
}

impl WavDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds header bytes. Once the data chunk is reached, returns the layout
    /// and whatever payload bytes arrived with the header.
    pub fn push(&mut self, input: &[u8]) -> Result<Option<(WavLayout, Vec<u8>)>> {
        self.buffer.extend_from_slice(input);
        let buf = &self.buffer;
        if buf.len() < 12 {
            return Ok(None);
        }
        if &buf[0..4] != b"RIFF" || &buf[8..12] != b"WAVE" {
            return Err(TtsError::UnsupportedFormat("missing RIFF/WAVE magic".into()));
        }

        let mut layout = None;
        let mut pos = 12;
        while buf.len() >= pos + 8 {
            let id = &buf[pos..pos + 4];
            let size = le_u32(&buf[pos + 4..pos + 8]) as usize;
            let body = pos + 8;
            if id == b"data" {
                let layout = layout.ok_or_else(|| {
                    TtsError::UnsupportedFormat("data chunk before fmt chunk".into())
                })?;
                let payload = buf[body..].to_vec();
                self.buffer.clear();
                return Ok(Some((layout, payload)));
            }
            if buf.len() < body + size {
                break;
            }
            if id == b"fmt " {
                layout = Some(parse_fmt(&buf[body..body + size])?);
            }
            pos = body + size + size % 2;
        }

        if self.buffer.len() > MAX_WAV_HEADER {
            return Err(TtsError::UnsupportedFormat("WAV header too large".into()));
        }
        Ok(None)
    }
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn parse_fmt(chunk: &[u8]) -> Result<WavLayout> {
    if chunk.len() < 16 {
        return Err(TtsError::UnsupportedFormat("short fmt chunk".into()));
    }
    let tag = u16::from_le_bytes([chunk[0], chunk[1]]);
    let layout = WavLayout {
        channels: u16::from_le_bytes([chunk[2], chunk[3]]),
        sample_rate: le_u32(&chunk[4..8]),
        bits_per_sample: u16::from_le_bytes([chunk[14], chunk[15]]),
    };
    // 0xFFFE is WAVE_FORMAT_EXTENSIBLE, which ffmpeg writes for plain PCM too
    if (tag != 1 && tag != 0xFFFE) || layout.bits_per_sample != 16 || layout.channels == 0 {
        return Err(TtsError::UnsupportedFormat(format!(
            "WAV format tag {tag} with {} bits",
            layout.bits_per_sample
        )));
    }
    Ok(layout)
}

enum Plan {
    Passthrough,
    Upmix,
    Demux,
    Transcode,
}

/// Turns any backend output into canonical PCM.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    format: CanonicalFormat,
    decoder: DecoderConfig,
}

impl Normalizer {
    pub fn new(format: CanonicalFormat, decoder: DecoderConfig) -> Self {
        Self { format, decoder }
    }

    pub fn format(&self) -> &CanonicalFormat {
        &self.format
    }

    pub fn decoder(&self) -> &DecoderConfig {
        &self.decoder
    }

    fn plan(&self, source: SourceFormat) -> Plan {
        match source {
            SourceFormat::Pcm {
                sample_rate,
                channels,
            } if sample_rate == self.format.sample_rate => {
                if channels == self.format.channels {
                    Plan::Passthrough
                } else if channels == 1 && self.format.channels == 2 {
                    Plan::Upmix
                } else {
                    Plan::Transcode
                }
            }
            SourceFormat::Pcm { .. } | SourceFormat::Mp3 => Plan::Transcode,
            SourceFormat::Wav => Plan::Demux,
        }
    }

    /// Streams `raw` as canonical PCM. Every chunk holds whole frames; a
    /// dangling partial frame at the end of the input is dropped.
    pub fn normalize(
        &self,
        raw: AudioByteStream,
        source: SourceFormat,
        ctx: &SynthesisContext,
    ) -> AudioByteStream {
        match self.plan(source) {
            Plan::Passthrough => align(raw, self.format.block_align() as usize),
            Plan::Upmix => upmix(raw),
            Plan::Demux => self.demux(raw, ctx.clone()),
            Plan::Transcode => self.transcode(raw, source, ctx.clone()),
        }
    }

    fn demux(&self, mut raw: AudioByteStream, ctx: SynthesisContext) -> AudioByteStream {
        let normalizer = self.clone();
        into_audio_stream(try_stream! {
            let mut demuxer = WavDemuxer::new();
            let (layout, payload) = loop {
                let Some(chunk) = raw.next().await else {
                    Err::<(), _>(TtsError::UnsupportedFormat("WAV stream ended before its data chunk".into()))?;
                    return;
                };
                if let Some(found) = demuxer.push(&chunk?)? {
                    break found;
                }
            };
            debug!(?layout, "parsed WAV header");

            let first: Result<Bytes> = Ok(Bytes::from(payload));
            let rest = into_audio_stream(stream::once(async move { first }).chain(raw));
            let pcm = SourceFormat::Pcm {
                sample_rate: layout.sample_rate,
                channels: layout.channels,
            };
            let mut inner = normalizer.normalize(rest, pcm, &ctx);
            while let Some(chunk) = inner.next().await {
                yield chunk?;
            }
        })
    }

    fn transcode(
        &self,
        raw: AudioByteStream,
        source: SourceFormat,
        ctx: SynthesisContext,
    ) -> AudioByteStream {
        let spec = self.decoder.command(source, &self.format);
        let decoded = run_filter(spec, raw, ctx);
        let decoded = into_audio_stream(decoded.map(|r| r.map_err(TtsError::into_transcode)));
        align(decoded, self.format.block_align() as usize)
    }
}

fn upmix(mut raw: AudioByteStream) -> AudioByteStream {
    into_audio_stream(try_stream! {
        let mut upmixer = Upmixer::new();
        while let Some(chunk) = raw.next().await {
            let out = upmixer.push(&chunk?);
            if !out.is_empty() {
                yield Bytes::from(out);
            }
        }
        if upmixer.pending() > 0 {
            debug!("dropped dangling byte of a mono sample");
        }
    })
}

fn align(mut raw: AudioByteStream, frame: usize) -> AudioByteStream {
    into_audio_stream(try_stream! {
        let mut aligner = FrameAligner::new(frame);
        while let Some(chunk) = raw.next().await {
            let out = aligner.push(&chunk?);
            if !out.is_empty() {
                yield Bytes::from(out);
            }
        }
        if aligner.pending() > 0 {
            debug!(bytes = aligner.pending(), "dropped partial frame");
        }
    })
}
