//! The voice map: which backend speaks which language, and what to try when
//! it fails.
//!
//! ```json
//! {
//!   "default_language": "en",
//!   "last_resort": "espeak",
//!   "backends": {
//!     "piper-en": { "kind": "piper", "model": "piper-data/en_US-lessac-medium.onnx" },
//!     "edge-hi":  { "kind": "remote", "url": "http://localhost:5050/tts", "voice": "hi-IN-MadhurNeural" },
//!     "espeak":   { "kind": "espeak" }
//!   },
//!   "languages": {
//!     "en": { "backend": "piper-en" },
//!     "hi": { "backend": "edge-hi", "fallback": ["piper-en"] }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TtsError};

fn default_piper() -> String {
    "piper".to_string()
}

fn default_espeak() -> String {
    "espeak-ng".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendSpec {
    Piper {
        #[serde(default = "default_piper")]
        program: String,
        model: PathBuf,
        #[serde(default)]
        speaker: Option<i64>,
        #[serde(default)]
        speed: Option<f32>,
        #[serde(default)]
        sample_rate: Option<u32>,
    },
    Remote {
        url: String,
        voice: String,
        /// Name of an environment variable holding a bearer token.
        #[serde(default)]
        api_key_env: Option<String>,
    },
    Espeak {
        #[serde(default = "default_espeak")]
        program: String,
        #[serde(default)]
        voice: Option<String>,
        #[serde(default)]
        words_per_minute: Option<u32>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageRoute {
    pub backend: String,
    #[serde(default)]
    pub fallback: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceMap {
    pub default_language: String,
    #[serde(default)]
    pub last_resort: Option<String>,
    pub backends: BTreeMap<String, BackendSpec>,
    pub languages: BTreeMap<String, LanguageRoute>,
}

impl VoiceMap {
    pub fn from_file<P: AsRef<Path>>(p: P) -> anyhow::Result<Self> {
        let path = p.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading voice map {}", path.display()))?;
        let map: VoiceMap = serde_json::from_str(&data)
            .with_context(|| format!("parsing voice map {}", path.display()))?;
        map.validate()?;
        Ok(map)
    }

    /// English, Hindi and Telugu on local piper models, with hi/te moved to a
    /// remote service when one is configured. Piper English backs up both,
    /// and espeak-ng is the last resort.
    pub fn builtin(piper_data: &Path, remote_url: Option<&str>) -> Self {
        let piper = |model: &str| BackendSpec::Piper {
            program: default_piper(),
            model: piper_data.join(model),
            speaker: None,
            speed: Some(1.1),
            sample_rate: None,
        };

        let mut backends = BTreeMap::new();
        backends.insert("piper-en".to_string(), piper("en_US-lessac-medium.onnx"));
        backends.insert("piper-hi".to_string(), piper("hi_IN-pratham-medium.onnx"));
        backends.insert("piper-te".to_string(), piper("te_IN-maya-medium.onnx"));
        backends.insert(
            "espeak".to_string(),
            BackendSpec::Espeak {
                program: default_espeak(),
                voice: None,
                words_per_minute: None,
            },
        );

        let mut languages = BTreeMap::new();
        languages.insert("en".to_string(), route("piper-en", &[]));
        match remote_url {
            Some(url) => {
                for (lang, voice) in [("hi", "hi-IN-MadhurNeural"), ("te", "te-IN-MohanNeural")] {
                    let name = format!("remote-{lang}");
                    backends.insert(
                        name.clone(),
                        BackendSpec::Remote {
                            url: url.to_string(),
                            voice: voice.to_string(),
                            api_key_env: None,
                        },
                    );
                    let local = format!("piper-{lang}");
                    languages.insert(lang.to_string(), route(&name, &[local.as_str(), "piper-en"]));
                }
            }
            None => {
                languages.insert("hi".to_string(), route("piper-hi", &["piper-en"]));
                languages.insert("te".to_string(), route("piper-te", &["piper-en"]));
            }
        }

        Self {
            default_language: "en".to_string(),
            last_resort: Some("espeak".to_string()),
            backends,
            languages,
        }
    }

    /// Every referenced backend must exist and the default language must have
    /// a route.
    pub fn validate(&self) -> Result<()> {
        if !self.languages.contains_key(&self.default_language) {
            return Err(TtsError::Config(format!(
                "default language '{}' has no route",
                self.default_language
            )));
        }
        let referenced = self
            .languages
            .values()
            .flat_map(|r| std::iter::once(&r.backend).chain(r.fallback.iter()))
            .chain(self.last_resort.iter());
        for name in referenced {
            if !self.backends.contains_key(name) {
                return Err(TtsError::Config(format!("unknown backend '{name}'")));
            }
        }
        Ok(())
    }
}

fn route(backend: &str, fallback: &[&str]) -> LanguageRoute {
    LanguageRoute {
        backend: backend.to_string(),
        fallback: fallback.iter().map(|s| s.to_string()).collect(),
    }
}
