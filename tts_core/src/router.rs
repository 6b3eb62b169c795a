//! Language routing over the configured speech backends.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_stream::stream;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::backend::{EspeakBackend, PiperBackend, RemoteBackend, SpeechBackend, SynthesisRequest};
use crate::error::{Result, TtsError};
use crate::format::Normalizer;
use crate::session::SynthesisContext;
use crate::voices::{BackendSpec, LanguageRoute, VoiceMap};

/// Picks backends per language and voices sentences with fallback.
pub struct BackendRouter {
    backends: HashMap<String, Arc<dyn SpeechBackend>>,
    routes: BTreeMap<String, LanguageRoute>,
    default_language: String,
    default_route: LanguageRoute,
    last_resort: Option<String>,
    normalizer: Normalizer,
}

impl std::fmt::Debug for BackendRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRouter")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .field("routes", &self.routes)
            .field("default_language", &self.default_language)
            .field("last_resort", &self.last_resort)
            .finish()
    }
}

impl BackendRouter {
    pub fn builder(default_language: impl Into<String>) -> RouterBuilder {
        RouterBuilder {
            default_language: default_language.into(),
            backends: HashMap::new(),
            routes: BTreeMap::new(),
            last_resort: None,
            normalizer: Normalizer::default(),
        }
    }

    pub fn from_voice_map(
        map: &VoiceMap,
        normalizer: Normalizer,
        client: reqwest::Client,
    ) -> Result<Self> {
        map.validate()?;
        let mut builder = Self::builder(map.default_language.clone()).normalizer(normalizer);
        for (name, spec) in &map.backends {
            builder = builder.backend(build_backend(name, spec, &client));
        }
        for (language, route) in &map.languages {
            builder.routes.insert(language.clone(), route.clone());
        }
        if let Some(name) = &map.last_resort {
            builder = builder.last_resort(name.clone());
        }
        builder.build()
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn default_language(&self) -> &str {
        &self.default_language
    }

    /// Languages with an explicit route.
    pub fn languages(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }

    pub fn route(&self, language: &str) -> Option<&LanguageRoute> {
        self.routes.get(language)
    }

    /// Primary backend for `language`. Unknown languages use the default
    /// language's route.
    pub fn select(&self, language: &str) -> Arc<dyn SpeechBackend> {
        let route = self.effective_route(language);
        self.backends[&route.backend].clone()
    }

    /// Backends to try for `language`, in order and without repeats: its
    /// route, then the default language's route, then the last resort.
    pub fn candidates(&self, language: &str) -> Vec<Arc<dyn SpeechBackend>> {
        let primary = self.effective_route(language);
        let ordered = route_names(primary)
            .chain(route_names(&self.default_route))
            .chain(self.last_resort.iter());

        let mut names: Vec<&String> = Vec::new();
        for name in ordered {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
            .into_iter()
            .filter_map(|n| self.backends.get(n).cloned())
            .collect()
    }

    fn effective_route(&self, language: &str) -> &LanguageRoute {
        self.routes.get(language).unwrap_or(&self.default_route)
    }

    /// Voices one sentence as canonical PCM.
    ///
    /// Backends are tried in [`candidates`](Self::candidates) order. A backend
    /// that fails before emitting any audio hands over to the next one; a
    /// failure after audio went out truncates the sentence instead, since the
    /// listener has already heard part of it. When every backend fails the
    /// stream is empty. The stream never yields an error.
    pub fn speak(
        &self,
        request: SynthesisRequest,
        ctx: SynthesisContext,
    ) -> BoxStream<'static, Bytes> {
        let candidates = self.candidates(&request.language);
        let normalizer = self.normalizer.clone();

        let spoken = stream! {
            let mut delivered = false;
            for (attempt, backend) in candidates.into_iter().enumerate() {
                if ctx.cancel.is_cancelled() {
                    return;
                }
                if attempt > 0 {
                    ctx.stats.record_fallback();
                    debug!(sentence = request.index, backend = backend.name(), "falling back");
                }

                let raw = match backend.synthesize(&request, &ctx).await {
                    Ok(raw) => raw,
                    Err(TtsError::Cancelled) => return,
                    Err(e) => {
                        warn!(sentence = request.index, backend = backend.name(), error = %e, "backend failed to start");
                        continue;
                    }
                };

                let mut audio = normalizer.normalize(raw, backend.source_format(), &ctx);
                let mut failure = None;
                while let Some(chunk) = audio.next().await {
                    match chunk {
                        Ok(chunk) if chunk.is_empty() => {}
                        Ok(chunk) => {
                            delivered = true;
                            yield chunk;
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }

                match failure {
                    None => return,
                    Some(TtsError::Cancelled) => return,
                    Some(e) if delivered => {
                        warn!(sentence = request.index, backend = backend.name(), error = %e, "sentence truncated");
                        ctx.stats.record_failed_sentence();
                        return;
                    }
                    Some(e) => {
                        warn!(sentence = request.index, backend = backend.name(), error = %e, "backend failed");
                    }
                }
            }
            if !delivered {
                warn!(sentence = request.index, "no backend produced audio, sentence skipped");
                ctx.stats.record_failed_sentence();
            }
        };
        spoken.boxed()
    }
}

fn route_names(route: &LanguageRoute) -> impl Iterator<Item = &String> {
    std::iter::once(&route.backend).chain(route.fallback.iter())
}

fn build_backend(
    name: &str,
    spec: &BackendSpec,
    client: &reqwest::Client,
) -> Arc<dyn SpeechBackend> {
    match spec {
        BackendSpec::Piper {
            program,
            model,
            speaker,
            speed,
            sample_rate,
        } => Arc::new(
            PiperBackend::new(name, program.clone(), model.clone(), *sample_rate)
                .with_speaker(*speaker)
                .with_speed(*speed),
        ),
        BackendSpec::Remote {
            url,
            voice,
            api_key_env,
        } => Arc::new(
            RemoteBackend::new(name, client.clone(), url.clone(), voice.clone())
                .with_api_key(api_key_env.as_ref().and_then(|k| std::env::var(k).ok())),
        ),
        BackendSpec::Espeak {
            program,
            voice,
            words_per_minute,
        } => Arc::new(
            EspeakBackend::new(name, program.clone())
                .with_voice(voice.clone())
                .with_words_per_minute(*words_per_minute),
        ),
    }
}

pub struct RouterBuilder {
    default_language: String,
    backends: HashMap<String, Arc<dyn SpeechBackend>>,
    routes: BTreeMap<String, LanguageRoute>,
    last_resort: Option<String>,
    normalizer: Normalizer,
}

impl RouterBuilder {
    pub fn backend(mut self, backend: Arc<dyn SpeechBackend>) -> Self {
        self.backends.insert(backend.name().to_string(), backend);
        self
    }

    pub fn route(mut self, language: impl Into<String>, backend: &str, fallback: &[&str]) -> Self {
        self.routes.insert(
            language.into(),
            LanguageRoute {
                backend: backend.to_string(),
                fallback: fallback.iter().map(|s| s.to_string()).collect(),
            },
        );
        self
    }

    pub fn last_resort(mut self, backend: impl Into<String>) -> Self {
        self.last_resort = Some(backend.into());
        self
    }

    pub fn normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn build(self) -> Result<BackendRouter> {
        let default_route = self.routes.get(&self.default_language).cloned().ok_or_else(|| {
            TtsError::Config(format!(
                "default language '{}' has no route",
                self.default_language
            ))
        })?;
        let referenced = self
            .routes
            .values()
            .flat_map(route_names)
            .chain(self.last_resort.iter());
        for name in referenced {
            if !self.backends.contains_key(name) {
                return Err(TtsError::Config(format!("unknown backend '{name}'")));
            }
        }
        Ok(BackendRouter {
            backends: self.backends,
            routes: self.routes,
            default_language: self.default_language,
            default_route,
            last_resort: self.last_resort,
            normalizer: self.normalizer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::VoiceParams;
    use crate::format::SourceFormat;
    use crate::{into_audio_stream, AudioByteStream};
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behavior {
        Speak(Vec<u8>),
        FailToStart,
        FailAfter(Vec<u8>),
    }

    struct Fake {
        name: &'static str,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl Fake {
        fn new(name: &'static str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                name,
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SpeechBackend for Fake {
        fn name(&self) -> &str {
            self.name
        }

        fn source_format(&self) -> SourceFormat {
            SourceFormat::Pcm {
                sample_rate: 22050,
                channels: 2,
            }
        }

        async fn synthesize(
            &self,
            _: &SynthesisRequest,
            _: &SynthesisContext,
        ) -> Result<AudioByteStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Speak(pcm) => {
                    let items: Vec<Result<Bytes>> = vec![Ok(Bytes::from(pcm.clone()))];
                    Ok(into_audio_stream(stream::iter(items)))
                }
                Behavior::FailToStart => Err(TtsError::unavailable(self.name, "offline")),
                Behavior::FailAfter(pcm) => {
                    let items: Vec<Result<Bytes>> = vec![
                        Ok(Bytes::from(pcm.clone())),
                        Err(TtsError::TranscodeFailure("corrupt frame".into())),
                    ];
                    Ok(into_audio_stream(stream::iter(items)))
                }
            }
        }
    }

    fn request(language: &str) -> SynthesisRequest {
        SynthesisRequest {
            index: 0,
            text: "Hello world.".into(),
            language: language.into(),
            voice: VoiceParams::default(),
        }
    }

    fn names(backends: &[Arc<dyn SpeechBackend>]) -> Vec<String> {
        backends.iter().map(|b| b.name().to_string()).collect()
    }

    async fn collect(s: BoxStream<'static, Bytes>) -> Vec<u8> {
        s.fold(Vec::new(), |mut acc, b| async move {
            acc.extend_from_slice(&b);
            acc
        })
        .await
    }

    #[test]
    fn test_candidates_order_and_dedup() {
        let router = BackendRouter::builder("en")
            .backend(Fake::new("piper-en", Behavior::Speak(vec![])))
            .backend(Fake::new("edge-hi", Behavior::Speak(vec![])))
            .backend(Fake::new("espeak", Behavior::Speak(vec![])))
            .route("en", "piper-en", &["espeak"])
            .route("hi", "edge-hi", &["piper-en"])
            .last_resort("espeak")
            .build()
            .unwrap();

        assert_eq!(names(&router.candidates("hi")), vec!["edge-hi", "piper-en", "espeak"]);
        assert_eq!(names(&router.candidates("en")), vec!["piper-en", "espeak"]);
        assert_eq!(router.select("x").name(), "piper-en");
        assert_eq!(router.languages(), vec!["en", "hi"]);
    }

    #[test]
    fn test_build_rejects_missing_default_route() {
        let result = BackendRouter::builder("en")
            .backend(Fake::new("edge-hi", Behavior::Speak(vec![])))
            .route("hi", "edge-hi", &[])
            .build();
        assert!(matches!(result, Err(TtsError::Config(_))));
    }

    #[tokio::test]
    async fn test_falls_back_when_primary_cannot_start() {
        let primary = Fake::new("remote", Behavior::FailToStart);
        let router = BackendRouter::builder("en")
            .backend(primary.clone())
            .backend(Fake::new("local", Behavior::Speak(vec![1, 2, 3, 4])))
            .route("en", "remote", &["local"])
            .build()
            .unwrap();
        let ctx = SynthesisContext::detached(4096);

        let audio = collect(router.speak(request("en"), ctx.clone())).await;
        assert_eq!(audio, vec![1, 2, 3, 4]);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.stats.snapshot().fallbacks, 1);
    }

    #[tokio::test]
    async fn test_failure_after_audio_truncates() {
        let backup = Fake::new("backup", Behavior::Speak(vec![9, 9, 9, 9]));
        let router = BackendRouter::builder("en")
            .backend(Fake::new("flaky", Behavior::FailAfter(vec![1, 2, 3, 4])))
            .backend(backup.clone())
            .route("en", "flaky", &["backup"])
            .build()
            .unwrap();
        let ctx = SynthesisContext::detached(4096);

        let audio = collect(router.speak(request("en"), ctx.clone())).await;
        assert_eq!(audio, vec![1, 2, 3, 4]);
        assert_eq!(backup.calls.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.stats.snapshot().failed_sentences, 1);
    }

    #[tokio::test]
    async fn test_all_backends_failing_yields_nothing() {
        let router = BackendRouter::builder("en")
            .backend(Fake::new("a", Behavior::FailToStart))
            .backend(Fake::new("b", Behavior::FailAfter(vec![])))
            .route("en", "a", &[])
            .last_resort("b")
            .build()
            .unwrap();
        let ctx = SynthesisContext::detached(4096);

        let audio = collect(router.speak(request("fr"), ctx.clone())).await;
        assert!(audio.is_empty());
        let stats = ctx.stats.snapshot();
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.failed_sentences, 1);
    }

    #[test]
    fn test_from_voice_map() {
        let map = VoiceMap::builtin(std::path::Path::new("piper-data"), None);
        let router =
            BackendRouter::from_voice_map(&map, Normalizer::default(), reqwest::Client::new())
                .unwrap();
        assert_eq!(names(&router.candidates("te")), vec!["piper-te", "piper-en", "espeak"]);
        assert_eq!(router.default_language(), "en");
    }
}
