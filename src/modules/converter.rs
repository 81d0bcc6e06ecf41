//! Encode, decode and convert between the supported audio formats.
//!
//! | Format | Container | Bit depth | Lossy |
//! |--------|-----------|-----------|-------|
//! | `wav_pcm16` | RIFF/WAVE | 16 | quantizes |
//! | `wav_pcm24` | RIFF/WAVE | 24 | quantizes |
//! | `wav_float32` | RIFF/WAVE | 32 | no |
//! | `raw_pcm16` | headerless LE | 16 | quantizes |
//! | `raw_f32` | headerless LE | 32 | no |
//!
//! Integer formats scale by `2^(bits-1) - 1` in both directions, so a value
//! survives a round trip within half a quantization step.  Raw formats carry
//! no header; the sample rate and channel count travel in [`EncodedAudio`].

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use super::{AudioModule, ModuleContext, ModuleError, ModuleName};
use crate::audio::dsp;

const NAME: ModuleName = ModuleName::FormatConverter;

// ---------------------------------------------------------------------------
// AudioFormat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    RawF32,
    RawPcm16,
    WavPcm16,
    WavPcm24,
    WavFloat32,
}

impl AudioFormat {
    pub const ALL: [AudioFormat; 5] = [
        AudioFormat::WavPcm16,
        AudioFormat::WavPcm24,
        AudioFormat::WavFloat32,
        AudioFormat::RawPcm16,
        AudioFormat::RawF32,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RawF32 => "raw_f32",
            Self::RawPcm16 => "raw_pcm16",
            Self::WavPcm16 => "wav_pcm16",
            Self::WavPcm24 => "wav_pcm24",
            Self::WavFloat32 => "wav_float32",
        }
    }

    pub fn bit_depth(self) -> u16 {
        match self {
            Self::RawPcm16 | Self::WavPcm16 => 16,
            Self::WavPcm24 => 24,
            Self::RawF32 | Self::WavFloat32 => 32,
        }
    }

    pub fn is_wav(self) -> bool {
        matches!(self, Self::WavPcm16 | Self::WavPcm24 | Self::WavFloat32)
    }

    /// Integer formats lose precision below one quantization step.
    pub fn is_lossy(self) -> bool {
        matches!(self, Self::RawPcm16 | Self::WavPcm16 | Self::WavPcm24)
    }

    pub fn extension(self) -> &'static str {
        if self.is_wav() {
            "wav"
        } else {
            "raw"
        }
    }

    pub fn info(self) -> FormatInfo {
        FormatInfo {
            format: self,
            extension: self.extension(),
            bit_depth: self.bit_depth(),
            lossy: self.is_lossy(),
        }
    }

    fn int_scale(self) -> f32 {
        ((1_i64 << (self.bit_depth() - 1)) - 1) as f32
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioFormat {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| ConversionError::UnknownFormat(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatInfo {
    pub format: AudioFormat,
    pub extension: &'static str,
    pub bit_depth: u16,
    pub lossy: bool,
}

// ---------------------------------------------------------------------------
// ConversionError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConversionError {
    #[error("unknown audio format `{0}`")]
    UnknownFormat(String),

    #[error("no audio to convert")]
    Empty,

    #[error("invalid stream parameters: {0}")]
    InvalidParameters(String),

    #[error("{len} bytes is not a whole number of {width}-byte samples")]
    Truncated { len: usize, width: usize },

    #[error("WAV error: {0}")]
    Wav(String),
}

impl From<hound::Error> for ConversionError {
    fn from(e: hound::Error) -> Self {
        Self::Wav(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Encoded bytes plus the stream parameters needed to decode them.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedAudio {
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub channels: u16,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Target of a conversion; `None` keeps the source value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionRequest {
    pub format: AudioFormat,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub channels: Option<u16>,
}

impl ConversionRequest {
    pub fn to(format: AudioFormat) -> Self {
        Self {
            format,
            sample_rate: None,
            channels: None,
        }
    }
}

// ---------------------------------------------------------------------------
// FormatConverter
// ---------------------------------------------------------------------------

pub struct FormatConverter {
    ctx: ModuleContext,
    conversions: AtomicU64,
    initialized: bool,
}

impl FormatConverter {
    pub fn new(ctx: ModuleContext) -> Self {
        Self {
            ctx,
            conversions: AtomicU64::new(0),
            initialized: false,
        }
    }

    pub fn supported_formats(&self) -> Vec<FormatInfo> {
        AudioFormat::ALL.into_iter().map(AudioFormat::info).collect()
    }

    pub fn encode(
        &self,
        samples: &[f32],
        sample_rate: u32,
        channels: u16,
        format: AudioFormat,
    ) -> Result<EncodedAudio, ConversionError> {
        check_params(samples.len(), sample_rate, channels)?;
        let bytes = match format {
            AudioFormat::RawF32 => samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
            AudioFormat::RawPcm16 => {
                let scale = format.int_scale();
                samples
                    .iter()
                    .flat_map(|&s| (quantize(s, scale) as i16).to_le_bytes())
                    .collect()
            }
            AudioFormat::WavPcm16 | AudioFormat::WavPcm24 | AudioFormat::WavFloat32 => {
                encode_wav(samples, sample_rate, channels, format)?
            }
        };
        Ok(EncodedAudio {
            format,
            sample_rate,
            channels,
            bytes,
        })
    }

    pub fn decode(&self, audio: &EncodedAudio) -> Result<DecodedAudio, ConversionError> {
        if audio.bytes.is_empty() {
            return Err(ConversionError::Empty);
        }
        match audio.format {
            AudioFormat::RawF32 => {
                let samples = raw_chunks(&audio.bytes, 4)?
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect::<Vec<_>>();
                finish_raw(samples, audio)
            }
            AudioFormat::RawPcm16 => {
                let scale = audio.format.int_scale();
                let samples = raw_chunks(&audio.bytes, 2)?
                    .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / scale)
                    .map(|s| s.clamp(-1.0, 1.0))
                    .collect::<Vec<_>>();
                finish_raw(samples, audio)
            }
            AudioFormat::WavPcm16 | AudioFormat::WavPcm24 | AudioFormat::WavFloat32 => decode_wav(&audio.bytes),
        }
    }

    /// Decode `audio`, remix / resample as requested and encode again.
    pub fn convert(&self, audio: &EncodedAudio, request: &ConversionRequest) -> Result<EncodedAudio, ConversionError> {
        let decoded = self.decode(audio)?;
        let channels = request.channels.unwrap_or(decoded.channels);
        let sample_rate = request.sample_rate.unwrap_or(decoded.sample_rate);
        check_params(decoded.samples.len(), sample_rate, channels)?;

        let remixed = dsp::remix(&decoded.samples, decoded.channels, channels);
        let resampled = dsp::resample_linear(&remixed, channels, decoded.sample_rate, sample_rate);
        let encoded = self.encode(&resampled, sample_rate, channels, request.format)?;

        self.conversions.fetch_add(1, Ordering::Relaxed);
        debug!(
            "convert: {} {}Hz/{}ch -> {} {}Hz/{}ch ({} bytes)",
            audio.format,
            decoded.sample_rate,
            decoded.channels,
            request.format,
            sample_rate,
            channels,
            encoded.bytes.len()
        );
        Ok(encoded)
    }
}

fn check_params(len: usize, sample_rate: u32, channels: u16) -> Result<(), ConversionError> {
    if len == 0 {
        return Err(ConversionError::Empty);
    }
    if sample_rate == 0 || channels == 0 {
        return Err(ConversionError::InvalidParameters(format!(
            "{sample_rate} Hz, {channels} channels"
        )));
    }
    if len % channels as usize != 0 {
        return Err(ConversionError::InvalidParameters(format!(
            "{len} samples do not divide into {channels} channels"
        )));
    }
    Ok(())
}

fn quantize(sample: f32, scale: f32) -> i32 {
    (sample.clamp(-1.0, 1.0) * scale).round() as i32
}

fn raw_chunks(bytes: &[u8], width: usize) -> Result<std::slice::ChunksExact<'_, u8>, ConversionError> {
    if bytes.len() % width != 0 {
        return Err(ConversionError::Truncated {
            len: bytes.len(),
            width,
        });
    }
    Ok(bytes.chunks_exact(width))
}

fn finish_raw(samples: Vec<f32>, audio: &EncodedAudio) -> Result<DecodedAudio, ConversionError> {
    check_params(samples.len(), audio.sample_rate, audio.channels)?;
    Ok(DecodedAudio {
        samples,
        sample_rate: audio.sample_rate,
        channels: audio.channels,
    })
}

fn encode_wav(samples: &[f32], sample_rate: u32, channels: u16, format: AudioFormat) -> Result<Vec<u8>, ConversionError> {
    let float = format == AudioFormat::WavFloat32;
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: format.bit_depth(),
        sample_format: if float {
            hound::SampleFormat::Float
        } else {
            hound::SampleFormat::Int
        },
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        if float {
            for &s in samples {
                writer.write_sample(s)?;
            }
        } else {
            let scale = format.int_scale();
            for &s in samples {
                let q = quantize(s, scale);
                if format == AudioFormat::WavPcm16 {
                    writer.write_sample(q as i16)?;
                } else {
                    writer.write_sample(q)?;
                }
            }
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio, ConversionError> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let samples = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let scale = ((1_i64 << (spec.bits_per_sample.max(1) - 1)) - 1).max(1) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| (v as f32 / scale).clamp(-1.0, 1.0)))
                .collect::<Result<Vec<_>, _>>()?
        }
    };
    check_params(samples.len(), spec.sample_rate, spec.channels)?;
    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

#[async_trait]
impl AudioModule for FormatConverter {
    fn name(&self) -> ModuleName {
        NAME
    }

    async fn initialize(&mut self) -> Result<(), ModuleError> {
        self.initialized = true;
        Ok(())
    }

    fn reset(&mut self) {
        self.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn describe(&self) -> Value {
        json!({
            "formats": AudioFormat::ALL.iter().map(|f| f.as_str()).collect::<Vec<_>>(),
            "conversions": self.conversions.load(Ordering::Relaxed),
            "exportSampleRate": self.ctx.config.sample_rate,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::test_context;

    fn converter() -> FormatConverter {
        FormatConverter::new(test_context())
    }

    fn stereo_tone(frames: usize) -> Vec<f32> {
        (0..frames)
            .flat_map(|i| {
                let s = 0.6 * (i as f32 * 0.03).sin();
                [s, -s * 0.5]
            })
            .collect()
    }

    fn assert_close(a: &[f32], b: &[f32], tolerance: f32) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() <= tolerance, "{x} vs {y}");
        }
    }

    #[test]
    fn lists_all_formats_with_metadata() {
        let formats = converter().supported_formats();
        assert_eq!(formats.len(), 5);
        let pcm24 = formats.iter().find(|f| f.format == AudioFormat::WavPcm24).unwrap();
        assert_eq!(pcm24.bit_depth, 24);
        assert!(pcm24.lossy);
        assert!(!AudioFormat::WavFloat32.is_lossy());
    }

    #[test]
    fn parses_format_names() {
        assert_eq!("wav_pcm16".parse::<AudioFormat>().unwrap(), AudioFormat::WavPcm16);
        assert_eq!(
            "mp3".parse::<AudioFormat>().unwrap_err(),
            ConversionError::UnknownFormat("mp3".into())
        );
    }

    #[test]
    fn lossless_formats_are_exact() {
        let conv = converter();
        let source = stereo_tone(500);
        for format in [AudioFormat::RawF32, AudioFormat::WavFloat32] {
            let encoded = conv.encode(&source, 48_000, 2, format).unwrap();
            let decoded = conv.decode(&encoded).unwrap();
            assert_eq!(decoded.samples, source, "{format}");
            assert_eq!(decoded.channels, 2);
        }
    }

    #[test]
    fn wav_to_raw_to_wav_keeps_count_and_layout() {
        let conv = converter();
        let source = stereo_tone(1_000);
        let a = conv.encode(&source, 44_100, 2, AudioFormat::WavPcm16).unwrap();
        let b = conv.convert(&a, &ConversionRequest::to(AudioFormat::RawF32)).unwrap();
        let back = conv.convert(&b, &ConversionRequest::to(AudioFormat::WavPcm16)).unwrap();

        let original = conv.decode(&a).unwrap();
        let round_trip = conv.decode(&back).unwrap();
        assert_eq!(round_trip.channels, 2);
        assert_eq!(round_trip.sample_rate, 44_100);
        assert_close(&round_trip.samples, &original.samples, 0.5 / 32_767.0);
        assert_close(&round_trip.samples, &source, 1.0 / 32_767.0);
    }

    #[test]
    fn pcm24_quantization_tolerance() {
        let conv = converter();
        let source = stereo_tone(200);
        let encoded = conv.encode(&source, 48_000, 2, AudioFormat::WavPcm24).unwrap();
        let raw = conv.convert(&encoded, &ConversionRequest::to(AudioFormat::RawPcm16)).unwrap();
        let back = conv.decode(&raw).unwrap();
        assert_close(&back.samples, &source, 1.0 / 32_767.0);
    }

    #[test]
    fn convert_remixes_and_resamples() {
        let conv = converter();
        let source = stereo_tone(480);
        let encoded = conv.encode(&source, 48_000, 2, AudioFormat::RawF32).unwrap();
        let request = ConversionRequest {
            format: AudioFormat::WavPcm16,
            sample_rate: Some(16_000),
            channels: Some(1),
        };
        let out = conv.decode(&conv.convert(&encoded, &request).unwrap()).unwrap();
        assert_eq!(out.channels, 1);
        assert_eq!(out.sample_rate, 16_000);
        assert_eq!(out.samples.len(), 160);
    }

    #[test]
    fn rejects_bad_input() {
        let conv = converter();
        assert_eq!(conv.encode(&[], 48_000, 1, AudioFormat::RawF32).unwrap_err(), ConversionError::Empty);
        assert!(matches!(
            conv.encode(&[0.1; 3], 48_000, 2, AudioFormat::RawF32),
            Err(ConversionError::InvalidParameters(_))
        ));
        let truncated = EncodedAudio {
            format: AudioFormat::RawPcm16,
            sample_rate: 48_000,
            channels: 1,
            bytes: vec![0; 3],
        };
        assert_eq!(
            conv.decode(&truncated).unwrap_err(),
            ConversionError::Truncated { len: 3, width: 2 }
        );
        let garbage = EncodedAudio {
            format: AudioFormat::WavPcm16,
            bytes: b"not a wav file".to_vec(),
            ..truncated
        };
        assert!(matches!(conv.decode(&garbage), Err(ConversionError::Wav(_))));
    }
}
