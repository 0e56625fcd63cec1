//! Shared fixtures for the pipeline integration tests.
//!
//! Every harness gets its own temporary SQLite file and an in-memory source
//! reader, so registered bytes are also what the worker reads back.

#![allow(dead_code)]

use async_trait::async_trait;
use lantern::capability::{
    Assessment, CapabilityError, MemorySourceReader, ProposalClient, SourceReader, Translator,
};
use lantern::dedup::SourceInput;
use lantern::model::{Passage, RegisterOutcome, Source};
use lantern::store::passages;
use lantern::{Capabilities, CurationApi, OpenStore, PipelineConfig, SqliteStore};
use std::sync::Arc;
use tempfile::TempDir;

pub const RITE: &str = "At dawn the priest shall pour a libation of milk and honey upon the stone of the threshold, \
    invoking the guardian of the house by name three times. Then a circle of ash is drawn around the hearth \
    so that no harm may cross it during the night, and an offering of bread is left for the spirits.";

pub const HARVEST: &str = "When the last sheaf is cut the women braid it into a figure of the grain mother and carry it \
    singing to the threshing floor. The figure is hung above the door until the spring sowing, when it is \
    burned and its ashes are scattered over the first furrow as a blessing for the coming harvest.";

pub struct Harness {
    pub api: CurationApi,
    pub store: Arc<SqliteStore>,
    pub reader: Arc<MemorySourceReader>,
    _dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(PipelineConfig::default(), |c| c)
    }

    pub fn with(config: PipelineConfig, capabilities: impl FnOnce(Capabilities) -> Capabilities) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("lantern.db")).unwrap());
        let reader = Arc::new(MemorySourceReader::new());
        let shared: Arc<dyn SourceReader> = reader.clone();
        let caps = capabilities(Capabilities::heuristic(shared));
        Self {
            api: CurationApi::new(store.clone(), caps, config),
            store,
            reader,
            _dir: dir,
        }
    }

    /// Register text under a locator and make its bytes readable by the worker.
    pub async fn register(&self, locator: &str, text: &str) -> (RegisterOutcome, Source) {
        self.reader.insert(locator, text);
        let registration = self
            .api
            .register_source(&SourceInput::new(locator, "txt", text), "curator")
            .await
            .unwrap();
        (registration.outcome, registration.source)
    }

    /// Register, enqueue and process one source until the queues are empty.
    pub async fn ingest(&self, locator: &str, text: &str) -> Source {
        let (_, source) = self.register(locator, text).await;
        self.api.enqueue_job(source.source_id.as_str(), None, "curator").unwrap();
        self.api.worker().run_until_idle().await.unwrap();
        source
    }

    pub fn passages(&self, source: &Source) -> Vec<Passage> {
        self.store
            .read(|c| passages::passages_for_source(c, &source.source_id))
            .unwrap()
    }
}

/// Translator that reports the same assessment for every passage.
pub struct FixedTranslator(pub Assessment);

impl FixedTranslator {
    pub fn untranslated(ratio: f64) -> Self {
        Self(Assessment {
            translated_text: RITE.to_string(),
            detected_language: "lat".to_string(),
            confidence: 0.7,
            untranslated_ratio: ratio,
        })
    }
}

#[async_trait]
impl Translator for FixedTranslator {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn assess(&self, _text: &str) -> Result<Assessment, CapabilityError> {
        Ok(self.0.clone())
    }
}

/// Proposal client that is never reachable.
pub struct OfflineProposer;

#[async_trait]
impl ProposalClient for OfflineProposer {
    fn model_name(&self) -> &str {
        "offline"
    }

    async fn propose(&self, _request: &lantern::capability::ProposalRequest) -> Result<String, CapabilityError> {
        Err(CapabilityError::Unavailable("offline".into()))
    }

    async fn repair(
        &self,
        _request: &lantern::capability::ProposalRequest,
        _raw: &str,
        _error: &str,
    ) -> Result<String, CapabilityError> {
        Err(CapabilityError::Unavailable("offline".into()))
    }
}
