// Configuration for the server, read from the environment

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use llm_core::LlmConfig;
use tracing::{info, warn};
use tts_core::{CanonicalFormat, DecoderConfig, Normalizer, PipelineConfig, VoiceMap};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub rate_limit_per_minute: u32,
    pub request_timeout_secs: u64,
    pub cors_allowed_origins: Option<Vec<String>>,
    pub llm: LlmConfig,
    pub voice_map_path: PathBuf,
    pub piper_data: PathBuf,
    pub remote_tts_url: Option<String>,
    pub decoder_program: String,
    pub sample_rate: u32,
    pub queue_depth: usize,
    pub synth_lookahead: usize,
    pub warmup_ms: u64,
    pub audio_chunk_bytes: usize,
    pub shutdown_grace_ms: u64,
    pub upstream_timeout_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8085,
            rate_limit_per_minute: 60,
            request_timeout_secs: 60,
            cors_allowed_origins: None,
            llm: LlmConfig::default(),
            voice_map_path: PathBuf::from("voices.json"),
            piper_data: PathBuf::from("models"),
            remote_tts_url: None,
            decoder_program: "ffmpeg".to_string(),
            sample_rate: 22050,
            queue_depth: 8,
            synth_lookahead: 1,
            warmup_ms: 0,
            audio_chunk_bytes: 4096,
            shutdown_grace_ms: 2000,
            upstream_timeout_secs: None,
        }
    }
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .ok()
            .map(|origins| {
                origins
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            });

        Self {
            port: parsed("PORT", defaults.port),
            rate_limit_per_minute: parsed("RATE_LIMIT_PER_MINUTE", defaults.rate_limit_per_minute),
            request_timeout_secs: parsed("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
            cors_allowed_origins,
            llm: LlmConfig::from_env(),
            voice_map_path: std::env::var("VOICE_MAP")
                .map(PathBuf::from)
                .unwrap_or(defaults.voice_map_path),
            piper_data: std::env::var("PIPER_DATA")
                .map(PathBuf::from)
                .unwrap_or(defaults.piper_data),
            remote_tts_url: std::env::var("REMOTE_TTS_URL").ok().filter(|u| !u.trim().is_empty()),
            decoder_program: std::env::var("FFMPEG_BIN").unwrap_or(defaults.decoder_program),
            sample_rate: parsed("SAMPLE_RATE", defaults.sample_rate),
            queue_depth: parsed("QUEUE_DEPTH", defaults.queue_depth),
            synth_lookahead: parsed("SYNTH_LOOKAHEAD", defaults.synth_lookahead),
            warmup_ms: parsed("WARMUP_MS", defaults.warmup_ms),
            audio_chunk_bytes: parsed("AUDIO_CHUNK_BYTES", defaults.audio_chunk_bytes),
            shutdown_grace_ms: parsed("SHUTDOWN_GRACE_MS", defaults.shutdown_grace_ms),
            upstream_timeout_secs: std::env::var("UPSTREAM_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn canonical_format(&self) -> CanonicalFormat {
        CanonicalFormat::stereo(self.sample_rate)
    }

    pub fn normalizer(&self) -> Normalizer {
        let decoder = DecoderConfig {
            program: self.decoder_program.clone(),
            ..DecoderConfig::default()
        };
        Normalizer::new(self.canonical_format(), decoder)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            queue_depth: self.queue_depth.max(1),
            synthesis_lookahead: self.synth_lookahead,
            warmup: Duration::from_millis(self.warmup_ms),
            upstream_timeout: self.upstream_timeout_secs.map(Duration::from_secs),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            chunk_bytes: self.audio_chunk_bytes.max(4),
        }
    }

    /// Voice map from `voice_map_path`, or the built-in map when the file
    /// does not exist. A file that exists but does not parse is an error.
    pub fn load_voice_map(&self) -> anyhow::Result<VoiceMap> {
        if self.voice_map_path.exists() {
            let map = VoiceMap::from_file(&self.voice_map_path)
                .with_context(|| "loading VOICE_MAP".to_string())?;
            info!(path = %self.voice_map_path.display(), "loaded voice map");
            return Ok(map);
        }
        warn!(
            path = %self.voice_map_path.display(),
            "voice map not found, using built-in routes"
        );
        Ok(VoiceMap::builtin(&self.piper_data, self.remote_tts_url.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_config_from_fields() {
        let config = ServerConfig {
            queue_depth: 0,
            warmup_ms: 250,
            upstream_timeout_secs: Some(30),
            ..ServerConfig::default()
        };
        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.queue_depth, 1);
        assert_eq!(pipeline.warmup, Duration::from_millis(250));
        assert_eq!(pipeline.upstream_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.canonical_format().channels, 2);
    }

    #[test]
    fn test_missing_voice_map_uses_builtin() {
        let config = ServerConfig {
            voice_map_path: PathBuf::from("/nonexistent/voices.json"),
            ..ServerConfig::default()
        };
        let map = config.load_voice_map().unwrap();
        assert_eq!(map.default_language, "en");
        assert!(map.languages.contains_key("te"));
    }
}
