//! Shared harness: an uploader wired to the in-memory cloud.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use nimbus_core::config::NimbusConfig;
use nimbus_core::types::{NodeId, ShareId, UploadId, UploadSource, UploadState};
use nimbus_crypto::{AddressKey, KdfParams, LocalEncryptionResource, SignersKit, KEY_SIZE};
use nimbus_chunks::BlockPlanner;
use nimbus_upload::memory::CloudCall;
use nimbus_upload::{
    CloudServices, DraftStore, FileUploader, LocalFile, MemoryCloud, SegmentedFileDraftImporter,
};

pub const BLOCK: u64 = 4096;

pub fn fast_kdf() -> KdfParams {
    KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}

pub fn signer() -> SignersKit {
    SignersKit {
        address_id: "addr-main".into(),
        email: "alice@example.com".into(),
        address_key: AddressKey::from_bytes([9u8; KEY_SIZE]),
    }
}

pub fn test_config() -> NimbusConfig {
    let mut config = NimbusConfig::default();
    config.uploader.max_block_size = BLOCK;
    config.uploader.retry_backoff_ms = 1;
    config.network.request_timeout_secs = 5;
    config.network.block_timeout_secs = 5;
    config.network.circuit_breaker_cooldown_secs = 1;
    config
}

/// Deterministic, non-repeating-per-block content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ (i / 4096) as u8).collect()
}

pub fn memory_file(name: &str, bytes: Vec<u8>) -> LocalFile {
    LocalFile {
        source: UploadSource::Memory { bytes },
        name: name.into(),
        mime_type: "application/octet-stream".into(),
        modification_time: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
        thumbnail: None,
    }
}

pub struct Harness {
    pub cloud: Arc<MemoryCloud>,
    pub store: Arc<DraftStore>,
    pub resource: Arc<LocalEncryptionResource>,
    pub uploader: FileUploader,
    pub importer: SegmentedFileDraftImporter,
    pub signer: SignersKit,
    pub share: ShareId,
    pub parent: NodeId,
    pub config: NimbusConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: NimbusConfig) -> Self {
        Self::with_store(config, Arc::new(DraftStore::in_memory()))
    }

    pub fn with_store(config: NimbusConfig, store: Arc<DraftStore>) -> Self {
        let cloud = Arc::new(MemoryCloud::new().unwrap());
        Self::with_parts(config, store, cloud)
    }

    pub fn with_parts(config: NimbusConfig, store: Arc<DraftStore>, cloud: Arc<MemoryCloud>) -> Self {
        let resource = Arc::new(LocalEncryptionResource::new(fast_kdf()));
        let uploader = FileUploader::new(
            store.clone(),
            CloudServices::from_backend(cloud.clone()),
            resource.clone(),
            signer(),
            &config,
        )
        .unwrap();
        let importer = SegmentedFileDraftImporter::new(
            store.clone(),
            resource.clone(),
            BlockPlanner::new(config.uploader.max_block_size).unwrap(),
            config.importer.batch_size,
            "client-test",
        );
        Self {
            cloud,
            store,
            resource,
            uploader,
            importer,
            signer: signer(),
            share: ShareId::from("share-main"),
            parent: NodeId::from("folder-root"),
            config,
        }
    }

    pub async fn import(&self, file: LocalFile) -> UploadId {
        let outcome = self
            .importer
            .import(vec![file], &self.share, &self.parent, &self.signer)
            .await
            .unwrap();
        assert!(outcome.failed.is_empty(), "import failed: {:?}", outcome.failed);
        outcome.succeeded[0]
    }

    pub async fn import_bytes(&self, name: &str, bytes: Vec<u8>) -> UploadId {
        self.import(memory_file(name, bytes)).await
    }

    pub fn state(&self, id: UploadId) -> UploadState {
        self.store.state(id).unwrap()
    }

    pub fn puts_started(&self, slot: &str) -> usize {
        self.cloud
            .count(|c| matches!(c, CloudCall::PutStarted { slot: s, .. } if s == slot))
    }
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
