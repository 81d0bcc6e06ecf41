//! Catalog of reference "master calls".
//!
//! The catalog is indexed from a [`CallSource`] during initialization and is
//! independent of the live pipeline.  Two sources ship with the crate:
//!
//! * [`InMemoryCallSource`]: calls held in memory (the default, seeded with
//!   a few synthesized calls).
//! * [`WavDirectorySource`]: every `*.wav` file in a directory, decoded with
//!   `hound`; the file stem is the call id.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use super::{AudioModule, ModuleContext, ModuleError, ModuleName};
use crate::events::topics;

const NAME: ModuleName = ModuleName::CallLibraryManager;

// ---------------------------------------------------------------------------
// LibraryError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LibraryError {
    #[error("master call `{0}` not found")]
    NotFound(String),

    #[error("call library has not been indexed yet")]
    NotIndexed,

    #[error("call library I/O error: {0}")]
    Io(String),

    #[error("could not decode master call `{id}`: {reason}")]
    Decode { id: String, reason: String },
}

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInfo {
    pub id: String,
    pub name: String,
    pub species: Option<String>,
    pub duration_secs: f32,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone)]
pub struct MasterCall {
    pub info: CallInfo,
    /// Interleaved samples.
    pub samples: Vec<f32>,
}

impl MasterCall {
    pub fn new(id: &str, name: &str, species: Option<&str>, samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        let frames = samples.len() / channels.max(1) as usize;
        Self {
            info: CallInfo {
                id: id.to_string(),
                name: name.to_string(),
                species: species.map(str::to_string),
                duration_secs: frames as f32 / sample_rate.max(1) as f32,
                sample_rate,
                channels,
            },
            samples,
        }
    }
}

// ---------------------------------------------------------------------------
// CallSource
// ---------------------------------------------------------------------------

/// Where master calls come from.  `index` and `fetch` may block.
pub trait CallSource: Send + Sync {
    fn describe(&self) -> String;

    fn index(&self) -> Result<Vec<CallInfo>, LibraryError>;

    fn fetch(&self, id: &str) -> Result<MasterCall, LibraryError>;
}

// Compile-time assertion: Box<dyn CallSource> must be constructible.
const _: fn() = || {
    fn _assert_object_safe(_: Box<dyn CallSource>) {}
};

// ---------------------------------------------------------------------------
// InMemoryCallSource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct InMemoryCallSource {
    calls: BTreeMap<String, MasterCall>,
}

impl InMemoryCallSource {
    pub fn new(calls: impl IntoIterator<Item = MasterCall>) -> Self {
        Self {
            calls: calls.into_iter().map(|c| (c.info.id.clone(), c)).collect(),
        }
    }

    /// A small synthesized starter catalog.
    pub fn starter_catalog() -> Self {
        const SR: u32 = 48_000;
        let sweep = |from: f32, to: f32, secs: f32| -> Vec<f32> {
            let len = (SR as f32 * secs) as usize;
            let mut phase = 0.0_f32;
            (0..len)
                .map(|i| {
                    let t = i as f32 / len as f32;
                    let freq = from + (to - from) * t;
                    phase += 2.0 * std::f32::consts::PI * freq / SR as f32;
                    let envelope = (std::f32::consts::PI * t).sin();
                    0.6 * envelope * phase.sin()
                })
                .collect()
        };
        Self::new([
            MasterCall::new("elk-bugle", "Bull elk bugle", Some("elk"), sweep(700.0, 1_800.0, 1.5), SR, 1),
            MasterCall::new("turkey-yelp", "Hen turkey yelp", Some("turkey"), sweep(900.0, 1_100.0, 0.4), SR, 1),
            MasterCall::new("deer-grunt", "Buck grunt", Some("whitetail"), sweep(120.0, 90.0, 0.6), SR, 1),
        ])
    }
}

impl CallSource for InMemoryCallSource {
    fn describe(&self) -> String {
        format!("in-memory ({} calls)", self.calls.len())
    }

    fn index(&self) -> Result<Vec<CallInfo>, LibraryError> {
        Ok(self.calls.values().map(|c| c.info.clone()).collect())
    }

    fn fetch(&self, id: &str) -> Result<MasterCall, LibraryError> {
        self.calls
            .get(id)
            .cloned()
            .ok_or_else(|| LibraryError::NotFound(id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// WavDirectorySource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WavDirectorySource {
    dir: PathBuf,
}

impl WavDirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.wav"))
    }

    fn info_for(path: &Path) -> Result<CallInfo, LibraryError> {
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let reader = hound::WavReader::open(path).map_err(|e| LibraryError::Decode {
            id: id.clone(),
            reason: e.to_string(),
        })?;
        let spec = reader.spec();
        let duration_secs = reader.duration() as f32 / spec.sample_rate.max(1) as f32;
        // "elk_bugle-2" → species "elk"
        let species = id.split_once('_').map(|(s, _)| s.to_string());
        Ok(CallInfo {
            name: id.replace(['_', '-'], " "),
            id,
            species,
            duration_secs,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        })
    }
}

impl CallSource for WavDirectorySource {
    fn describe(&self) -> String {
        format!("wav directory {}", self.dir.display())
    }

    fn index(&self) -> Result<Vec<CallInfo>, LibraryError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            LibraryError::Io(format!("cannot read {}: {e}", self.dir.display()))
        })?;
        let mut calls = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| LibraryError::Io(e.to_string()))?.path();
            let is_wav = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("wav"));
            if !is_wav {
                continue;
            }
            match Self::info_for(&path) {
                Ok(info) => calls.push(info),
                Err(e) => warn!("library: skipping {}: {e}", path.display()),
            }
        }
        calls.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(calls)
    }

    fn fetch(&self, id: &str) -> Result<MasterCall, LibraryError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(LibraryError::NotFound(id.to_string()));
        }
        let decode_err = |e: hound::Error| LibraryError::Decode {
            id: id.to_string(),
            reason: e.to_string(),
        };
        let info = Self::info_for(&path)?;
        let mut reader = hound::WavReader::open(&path).map_err(decode_err)?;
        let spec = reader.spec();
        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<Result<_, _>>()
                .map_err(decode_err)?,
            hound::SampleFormat::Int => {
                let scale = (1_i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()
                    .map_err(decode_err)?
            }
        };
        Ok(MasterCall { info, samples })
    }
}

// ---------------------------------------------------------------------------
// CallLibraryManager
// ---------------------------------------------------------------------------

pub struct CallLibraryManager {
    ctx: ModuleContext,
    source: Arc<dyn CallSource>,
    catalog: Option<BTreeMap<String, CallInfo>>,
    loaded: Option<MasterCall>,
}

impl CallLibraryManager {
    /// Use `source`, or the configured directory / starter catalog when `None`.
    pub fn new(ctx: ModuleContext, source: Option<Box<dyn CallSource>>) -> Self {
        let source: Arc<dyn CallSource> = match source {
            Some(source) => Arc::from(source),
            None => match &ctx.config.library.directory {
                Some(dir) => Arc::new(WavDirectorySource::new(dir)),
                None => Arc::new(InMemoryCallSource::starter_catalog()),
            },
        };
        Self {
            ctx,
            source,
            catalog: None,
            loaded: None,
        }
    }

    /// Indexed calls, ordered by id.
    pub fn catalog(&self) -> Result<Vec<CallInfo>, LibraryError> {
        self.catalog
            .as_ref()
            .map(|c| c.values().cloned().collect())
            .ok_or(LibraryError::NotIndexed)
    }

    /// Fetch `id` and make it the current master call.
    pub fn load(&mut self, id: &str) -> Result<&MasterCall, LibraryError> {
        let catalog = self.catalog.as_ref().ok_or(LibraryError::NotIndexed)?;
        if !catalog.contains_key(id) {
            return Err(LibraryError::NotFound(id.to_string()));
        }
        let call = self.source.fetch(id)?;
        info!(
            "library: loaded `{id}` ({:.2}s @ {} Hz)",
            call.info.duration_secs, call.info.sample_rate
        );
        self.ctx.publish(
            NAME,
            topics::MASTER_CALL_LOADED,
            json!({ "id": id, "durationSecs": call.info.duration_secs }),
        );
        Ok(self.loaded.insert(call))
    }

    pub fn current(&self) -> Option<&MasterCall> {
        self.loaded.as_ref()
    }
}

#[async_trait]
impl AudioModule for CallLibraryManager {
    fn name(&self) -> ModuleName {
        NAME
    }

    async fn initialize(&mut self) -> Result<(), ModuleError> {
        if self.catalog.is_some() {
            return Ok(());
        }
        let source = Arc::clone(&self.source);
        let indexed = tokio::task::spawn_blocking(move || source.index())
            .await
            .map_err(|e| ModuleError::critical(NAME, format!("indexing task failed: {e}")))?
            .map_err(|e| ModuleError::critical(NAME, e.to_string()))?;
        info!(
            "library: indexed {} calls from {}",
            indexed.len(),
            self.source.describe()
        );
        self.catalog = Some(indexed.into_iter().map(|c| (c.id.clone(), c)).collect());
        Ok(())
    }

    fn reset(&mut self) {
        self.catalog = None;
        self.loaded = None;
    }

    fn is_initialized(&self) -> bool {
        self.catalog.is_some()
    }

    fn describe(&self) -> Value {
        json!({
            "source": self.source.describe(),
            "calls": self.catalog.as_ref().map(BTreeMap::len),
            "loaded": self.loaded.as_ref().map(|c| c.info.id.clone()),
        })
    }
}

// ---------------------------------------------------------------------------
// FlakySource  (test-only)
// ---------------------------------------------------------------------------

/// Fails the first `failures` index calls, then behaves like the starter
/// catalog.
#[cfg(test)]
pub struct FlakySource {
    failures: std::sync::atomic::AtomicUsize,
    inner: InMemoryCallSource,
}

#[cfg(test)]
impl FlakySource {
    pub fn new(failures: usize) -> Self {
        Self {
            failures: std::sync::atomic::AtomicUsize::new(failures),
            inner: InMemoryCallSource::starter_catalog(),
        }
    }
}

#[cfg(test)]
impl CallSource for FlakySource {
    fn describe(&self) -> String {
        "flaky".into()
    }

    fn index(&self) -> Result<Vec<CallInfo>, LibraryError> {
        use std::sync::atomic::Ordering;
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(LibraryError::Io("storage offline".into()));
        }
        self.inner.index()
    }

    fn fetch(&self, id: &str) -> Result<MasterCall, LibraryError> {
        self.inner.fetch(id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::test_context;
    use tempfile::tempdir;

    fn write_wav(path: &Path, samples: &[i16], sample_rate: u32, channels: u16) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[tokio::test]
    async fn starter_catalog_is_indexed_on_initialize() {
        let mut library = CallLibraryManager::new(test_context(), None);
        assert_eq!(library.catalog().unwrap_err(), LibraryError::NotIndexed);
        library.initialize().await.unwrap();
        let ids: Vec<String> = library.catalog().unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["deer-grunt", "elk-bugle", "turkey-yelp"]);
    }

    #[tokio::test]
    async fn load_sets_current_and_publishes() {
        let ctx = test_context();
        let loaded = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&loaded);
        ctx.bus.subscribe(topics::MASTER_CALL_LOADED, move |e| {
            sink.lock().unwrap().push(e.payload["id"].as_str().unwrap().to_string())
        });

        let mut library = CallLibraryManager::new(ctx, None);
        library.initialize().await.unwrap();
        let call = library.load("elk-bugle").unwrap();
        assert!((call.info.duration_secs - 1.5).abs() < 1e-3);
        assert_eq!(library.current().unwrap().info.id, "elk-bugle");
        assert_eq!(*loaded.lock().unwrap(), vec!["elk-bugle".to_string()]);

        assert_eq!(
            library.load("moose-call").unwrap_err(),
            LibraryError::NotFound("moose-call".into())
        );
    }

    #[tokio::test]
    async fn flaky_source_fails_then_recovers() {
        let mut library = CallLibraryManager::new(test_context(), Some(Box::new(FlakySource::new(1))));
        let err = library.initialize().await.unwrap_err();
        assert!(err.critical);
        assert!(!library.is_initialized());
        library.initialize().await.unwrap();
        assert_eq!(library.catalog().unwrap().len(), 3);
    }

    #[test]
    fn wav_directory_indexes_and_decodes() {
        let dir = tempdir().unwrap();
        write_wav(&dir.path().join("elk_bugle.wav"), &[0, 16_384, -16_384, 0], 8_000, 2);
        std::fs::write(dir.path().join("notes.txt"), "not audio").unwrap();

        let source = WavDirectorySource::new(dir.path());
        let index = source.index().unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].id, "elk_bugle");
        assert_eq!(index[0].species.as_deref(), Some("elk"));
        assert_eq!(index[0].channels, 2);

        let call = source.fetch("elk_bugle").unwrap();
        assert_eq!(call.samples.len(), 4);
        assert!((call.samples[1] - 0.5).abs() < 1e-6);
        assert!(matches!(source.fetch("missing"), Err(LibraryError::NotFound(_))));
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let source = WavDirectorySource::new("/definitely/not/here");
        assert!(matches!(source.index(), Err(LibraryError::Io(_))));
    }
}
