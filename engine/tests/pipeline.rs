use async_trait::async_trait;
use bytes::Bytes;
use shardvault_backends::{AlwaysOnline, Backend, ConnectivityProbe, MemoryBackend};
use shardvault_core::chunker::SourceFile;
use shardvault_core::config::{DestinationConfig, ErrorCorrectionConfig};
use shardvault_core::{
    BlockHash, Error, FormatTag, Identity, MemoryRepository, MetadataRepository, Shutdown,
    VaultConfig,
};
use shardvault_engine::{BlockVault, RestoreTarget, UploadOutcome, UploadRequest};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    config: VaultConfig,
    backends: HashMap<String, Arc<MemoryBackend>>,
    repo: Arc<MemoryRepository>,
    identity: Arc<Identity>,
}

impl Harness {
    fn new(destinations: &[(&str, DestinationConfig)]) -> Self {
        let mut config = VaultConfig::default();
        config.workers = 4;
        config.retry.initial_backoff_ms = 1;
        config.retry.max_backoff_ms = 5;
        config.connectivity.poll_interval_ms = 5;
        let mut backends = HashMap::new();
        for (id, destination) in destinations {
            config.destinations.insert(id.to_string(), destination.clone());
            backends.insert(id.to_string(), Arc::new(MemoryBackend::new()));
        }
        Self {
            config,
            backends,
            repo: Arc::new(MemoryRepository::new()),
            identity: Arc::new(Identity::generate().unwrap()),
        }
    }

    fn vault(&self) -> BlockVault {
        self.vault_with(Arc::clone(&self.identity), Shutdown::new(), Arc::new(AlwaysOnline))
    }

    fn vault_with(
        &self,
        identity: Arc<Identity>,
        shutdown: Shutdown,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> BlockVault {
        let backends = self
            .backends
            .iter()
            .map(|(id, b)| (id.clone(), Arc::clone(b) as Arc<dyn Backend>))
            .collect();
        BlockVault::new(
            self.config.clone(),
            backends,
            Arc::clone(&self.repo) as Arc<dyn MetadataRepository>,
            identity,
            shutdown,
            probe,
        )
        .unwrap()
    }

    fn backend(&self, id: &str) -> &MemoryBackend {
        &self.backends[id]
    }
}

fn erasure_coded(data: usize, parity: usize) -> DestinationConfig {
    DestinationConfig {
        error_correction: ErrorCorrectionConfig::reed_solomon(data, parity),
        ..DestinationConfig::default()
    }
}

fn plain() -> DestinationConfig {
    DestinationConfig::default()
}

fn pattern(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i * 31 % 251) as u8).collect::<Vec<u8>>())
}

fn request(data: &Bytes, destinations: &[&str]) -> UploadRequest {
    UploadRequest {
        hash: BlockHash::from_data(data),
        format: FormatTag::Raw,
        plaintext: data.clone(),
        destinations: destinations.iter().map(|d| d.to_string()).collect(),
    }
}

#[tokio::test]
async fn test_erasure_coded_block_survives_lost_parts() {
    let harness = Harness::new(&[("offsite", erasure_coded(8, 3))]);
    let vault = harness.vault();
    let data = pattern(10_000);

    let outcome = vault.upload(request(&data, &["offsite"])).await;
    assert_eq!(
        outcome,
        UploadOutcome::Stored {
            uploaded: vec!["offsite".to_string()]
        }
    );

    let hash = BlockHash::from_data(&data);
    let block = harness.repo.block_by_hash(&hash).await.unwrap().unwrap();
    let record = block.record_for("offsite").unwrap();
    assert_eq!(record.part_keys.len(), 11);
    assert_eq!(harness.backend("offsite").object_count().await, 11);

    for index in [0, 4, 9] {
        assert!(harness.backend("offsite").remove(&record.part_keys[index]).await);
    }
    let restored = vault.download_block(&hash).await.unwrap();
    assert_eq!(restored.payload, data);

    assert!(harness.backend("offsite").remove(&record.part_keys[1]).await);
    let result = vault.download_block(&hash).await;
    assert!(matches!(
        result,
        Err(Error::InsufficientShards { available: 7, required: 8 })
    ));
}

#[tokio::test]
async fn test_corrupt_parts_are_treated_as_missing() {
    let harness = Harness::new(&[("offsite", erasure_coded(4, 2))]);
    let vault = harness.vault();
    let data = pattern(4_096);
    assert!(vault.upload(request(&data, &["offsite"])).await.is_success());

    let hash = BlockHash::from_data(&data);
    let block = harness.repo.block_by_hash(&hash).await.unwrap().unwrap();
    let keys = &block.storage[0].part_keys;
    assert!(harness.backend("offsite").corrupt(&keys[0]).await);
    assert!(harness.backend("offsite").corrupt(&keys[3]).await);

    let restored = vault.download_block(&hash).await.unwrap();
    assert_eq!(restored.payload, data);
    assert_eq!(vault.download_stats().corrupt_parts, 2);
}

#[tokio::test]
async fn test_duplicate_upload_is_not_repeated() {
    let harness = Harness::new(&[("offsite", erasure_coded(4, 2))]);
    let vault = harness.vault();
    let data = pattern(2_000);

    assert!(matches!(
        vault.upload(request(&data, &["offsite"])).await,
        UploadOutcome::Stored { .. }
    ));
    let uploads = harness.backend("offsite").upload_count();

    assert_eq!(
        vault.upload(request(&data, &["offsite"])).await,
        UploadOutcome::AlreadyStored
    );
    assert_eq!(harness.backend("offsite").upload_count(), uploads);
    assert_eq!(harness.repo.insert_count(), 1);
    assert_eq!(harness.repo.block_count().await, 1);
}

#[tokio::test]
async fn test_only_missing_destinations_are_uploaded() {
    let harness = Harness::new(&[("a", plain()), ("b", erasure_coded(3, 1))]);
    let vault = harness.vault();
    let data = pattern(5_000);

    assert!(vault.upload(request(&data, &["a"])).await.is_success());
    let a_uploads = harness.backend("a").upload_count();
    assert_eq!(harness.backend("b").upload_count(), 0);

    let outcome = vault.upload(request(&data, &["a", "b"])).await;
    assert_eq!(
        outcome,
        UploadOutcome::Stored {
            uploaded: vec!["b".to_string()]
        }
    );
    assert_eq!(harness.backend("a").upload_count(), a_uploads);
    assert_eq!(harness.backend("b").upload_count(), 4);

    let block = harness
        .repo
        .block_by_hash(&BlockHash::from_data(&data))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(block.destinations(), vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn test_existing_records_survive_later_uploads() {
    let mut harness = Harness::new(&[("a", plain()), ("b", plain()), ("c", erasure_coded(2, 1))]);
    let data = pattern(2_500);
    let hash = BlockHash::from_data(&data);
    assert!(harness.vault().upload(request(&data, &["a", "b"])).await.is_success());
    let created = harness.repo.block_by_hash(&hash).await.unwrap().unwrap().created;

    // "b" is no longer configured but its stored copy stays on record.
    harness.config.destinations.remove("b");
    let outcome = harness.vault().upload(request(&data, &["a", "c"])).await;
    assert_eq!(
        outcome,
        UploadOutcome::Stored {
            uploaded: vec!["c".to_string()]
        }
    );

    let block = harness.repo.block_by_hash(&hash).await.unwrap().unwrap();
    assert_eq!(
        block.destinations(),
        vec!["a".to_string(), "b".to_string(), "c".to_string()]
    );
    assert_eq!(block.created, created);
}

#[tokio::test]
async fn test_stale_record_is_replaced() {
    let mut harness = Harness::new(&[("a", plain()), ("b", plain())]);
    let data = pattern(1_200);
    let hash = BlockHash::from_data(&data);
    assert!(harness.vault().upload(request(&data, &["a", "b"])).await.is_success());
    let created = harness.repo.block_by_hash(&hash).await.unwrap().unwrap().created;

    if let Some(destination) = harness.config.destinations.get_mut("a") {
        destination.encryption = "none".to_string();
    }
    let vault = harness.vault();
    let outcome = vault.upload(request(&data, &["a"])).await;
    assert_eq!(
        outcome,
        UploadOutcome::Stored {
            uploaded: vec!["a".to_string()]
        }
    );

    let block = harness.repo.block_by_hash(&hash).await.unwrap().unwrap();
    assert_eq!(block.storage.len(), 2);
    assert_eq!(block.record_for("a").unwrap().encryption, "none");
    assert_eq!(block.record_for("b").unwrap().encryption, "xchacha20-poly1305");
    assert_eq!(block.created, created);
    assert_eq!(vault.download_block(&hash).await.unwrap().payload, data);
}

#[tokio::test]
async fn test_every_algorithm_pair_roundtrips() {
    let encryptions = [
        ("none", false),
        ("xchacha20-poly1305", true),
        ("xchacha20-poly1305", false),
    ];
    let corrections = [ErrorCorrectionConfig::default(), ErrorCorrectionConfig::reed_solomon(4, 2)];

    for (encryption, stable) in encryptions {
        for correction in &corrections {
            let destination = DestinationConfig {
                encryption: encryption.to_string(),
                stable_encryption: Some(stable),
                error_correction: correction.clone(),
                ..DestinationConfig::default()
            };
            let mut harness = Harness::new(&[("dest", destination)]);
            harness.config.max_part_size = 1_000;
            let vault = harness.vault();
            let data = pattern(5_000);
            let hash = BlockHash::from_data(&data);

            assert!(
                vault.upload(request(&data, &["dest"])).await.is_success(),
                "{encryption}/{} upload failed",
                correction.algorithm
            );
            let block = harness.repo.block_by_hash(&hash).await.unwrap().unwrap();
            let record = block.record_for("dest").unwrap();
            assert_eq!(record.encryption, encryption);
            assert_eq!(record.error_correction, correction.algorithm);
            if correction.algorithm == "none" {
                assert!(record.part_keys.len() >= 5, "payload was not split into parts");
            } else {
                assert_eq!(record.part_keys.len(), 6);
            }

            let restored = vault.download_block(&hash).await.unwrap();
            assert_eq!(
                restored.payload, data,
                "{encryption}/{} did not roundtrip",
                correction.algorithm
            );
        }
    }
}

#[tokio::test]
async fn test_foreign_format_block_is_reencoded() {
    let harness = Harness::new(&[("a", plain())]);
    let vault = harness.vault();
    let data = pattern(1_000);
    assert!(vault.upload(request(&data, &["a"])).await.is_success());

    let mut compressed = request(&data, &["a"]);
    compressed.format = FormatTag::Compressed;
    assert!(matches!(
        vault.upload(compressed).await,
        UploadOutcome::Stored { .. }
    ));
    let block = harness
        .repo
        .block_by_hash(&BlockHash::from_data(&data))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(block.format, FormatTag::Compressed);
    assert_eq!(block.storage.len(), 1);
    assert_eq!(harness.repo.insert_count(), 2);
}

#[tokio::test]
async fn test_each_share_can_decrypt_independently() {
    let mut harness = Harness::new(&[("offsite", erasure_coded(4, 2))]);
    let alice = Arc::new(Identity::generate().unwrap());
    let bob = Arc::new(Identity::generate().unwrap());
    let outsider = Arc::new(Identity::generate().unwrap());
    harness.config.share_keys = vec![alice.public().encode(), bob.public().encode()];

    let data = pattern(3_000);
    assert!(harness.vault().upload(request(&data, &["offsite"])).await.is_success());
    let hash = BlockHash::from_data(&data);

    for identity in [Arc::clone(&harness.identity), alice, bob] {
        let vault = harness.vault_with(identity, Shutdown::new(), Arc::new(AlwaysOnline));
        assert_eq!(vault.download_block(&hash).await.unwrap().payload, data);
    }

    let vault = harness.vault_with(outsider, Shutdown::new(), Arc::new(AlwaysOnline));
    assert!(matches!(
        vault.download_block(&hash).await,
        Err(Error::DecryptionFailed(_))
    ));
}

#[tokio::test]
async fn test_falls_back_to_next_storage_record() {
    let harness = Harness::new(&[("a", plain()), ("b", plain())]);
    let vault = harness.vault();
    let data = pattern(8_192);
    assert!(vault.upload(request(&data, &["a", "b"])).await.is_success());

    for key in harness.backend("a").keys().await {
        harness.backend("a").corrupt(&key).await;
    }
    let restored = vault.download_block(&BlockHash::from_data(&data)).await.unwrap();
    assert_eq!(restored.payload, data);
    assert_eq!(vault.download_stats().fallbacks, 1);
}

#[tokio::test]
async fn test_stable_encryption_matches_across_destinations() {
    let mut harness = Harness::new(&[("a", erasure_coded(2, 1)), ("b", erasure_coded(2, 1))]);
    harness.config.stable_encryption = true;
    let vault = harness.vault();
    let data = pattern(1_500);
    assert!(vault.upload(request(&data, &["a", "b"])).await.is_success());

    let block = harness
        .repo
        .block_by_hash(&BlockHash::from_data(&data))
        .await
        .unwrap()
        .unwrap();
    for index in 0..3 {
        let a = harness
            .backend("a")
            .download(&block.record_for("a").unwrap().part_keys[index])
            .await
            .unwrap();
        let b = harness
            .backend("b")
            .download(&block.record_for("b").unwrap().part_keys[index])
            .await
            .unwrap();
        assert_eq!(a, b);
    }
}

#[tokio::test]
async fn test_failed_part_fails_the_block() {
    let harness = Harness::new(&[("a", plain()), ("b", plain())]);
    let vault = harness.vault();
    harness.backend("b").set_offline(true);

    let data = pattern(1_000);
    let outcome = vault.upload(request(&data, &["a", "b"])).await;
    match outcome {
        UploadOutcome::Failed { reached, required, .. } => {
            assert_eq!(reached, 1);
            assert_eq!(required, 2);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(harness.repo.insert_count(), 0);
}

#[tokio::test]
async fn test_unknown_destination_reports_failure() {
    let harness = Harness::new(&[("a", plain())]);
    let outcome = harness.vault().upload(request(&pattern(10), &["nowhere"])).await;
    assert!(!outcome.is_success());
}

struct FlagProbe(Arc<AtomicBool>);

#[async_trait]
impl ConnectivityProbe for FlagProbe {
    async fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn test_upload_waits_out_connectivity_loss() {
    let harness = Harness::new(&[("a", plain())]);
    let online = Arc::new(AtomicBool::new(false));
    let vault = harness.vault_with(
        Arc::clone(&harness.identity),
        Shutdown::new(),
        Arc::new(FlagProbe(Arc::clone(&online))),
    );
    harness.backend("a").set_offline(true);

    let backends = Arc::clone(&harness.backends["a"]);
    let flag = Arc::clone(&online);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        backends.set_offline(false);
        flag.store(true, Ordering::SeqCst);
    });

    let data = pattern(700);
    assert!(vault.upload(request(&data, &["a"])).await.is_success());
    assert_eq!(vault.download_block(&BlockHash::from_data(&data)).await.unwrap().payload, data);
}

#[tokio::test]
async fn test_shutdown_abandons_work() {
    let harness = Harness::new(&[("a", plain())]);
    let shutdown = Shutdown::new();
    let vault = harness.vault_with(Arc::clone(&harness.identity), shutdown.clone(), Arc::new(AlwaysOnline));
    let data = pattern(700);
    assert!(vault.upload(request(&data, &["a"])).await.is_success());

    shutdown.request();
    assert!(!vault.upload(request(&pattern(900), &["a"])).await.is_success());
    assert!(matches!(
        vault.download_block(&BlockHash::from_data(&data)).await,
        Err(Error::ShutdownRequested)
    ));
    assert_eq!(harness.repo.insert_count(), 1);
}

fn source(path: &str, data: Vec<u8>) -> SourceFile {
    SourceFile {
        path: PathBuf::from(path),
        modified: 1_700_000_000_000,
        data: Bytes::from(data),
    }
}

fn small_assignment(harness: &mut Harness) {
    let assignment = &mut harness.config.assignment;
    assignment.raw_threshold = 32 * 1024;
    assignment.raw_chunk_size = 4 * 1024;
    assignment.compressed_avg_chunk = 1024;
    assignment.small_file_limit = 512;
    assignment.archive_target_size = 1024;
    assignment.chain_threshold = 4;
}

#[tokio::test]
async fn test_files_roundtrip_through_every_block_format() {
    let mut harness = Harness::new(&[("offsite", erasure_coded(4, 2))]);
    small_assignment(&mut harness);
    let vault = harness.vault();

    let files = vec![
        ("tiny.txt", b"hello".to_vec()),
        ("small.bin", pattern(400).to_vec()),
        ("medium.txt", b"lorem ipsum dolor sit amet ".repeat(300)),
        ("large.bin", pattern(40 * 1024).to_vec()),
        ("empty", Vec::new()),
    ];
    let sources = files.iter().map(|(p, d)| source(p, d.clone())).collect();
    let backed_up = vault.backup_files(sources, &["offsite".to_string()]).await.unwrap();
    for file in &backed_up {
        harness.repo.add_file(file.clone()).await;
    }

    let formats: Vec<FormatTag> = harness.repo.blocks().await.iter().map(|b| b.format).collect();
    for format in [FormatTag::Raw, FormatTag::Compressed, FormatTag::Archived, FormatTag::Chain] {
        assert!(formats.contains(&format), "no {format} block produced");
    }

    let out = TempDir::new().unwrap();
    for (file, (name, data)) in backed_up.iter().zip(&files) {
        let target = out.path().join(name);
        vault
            .restore_file(file, &RestoreTarget::File(target.clone()))
            .await
            .unwrap();
        assert_eq!(&tokio::fs::read(&target).await.unwrap(), data);
        vault.restore_file(file, &RestoreTarget::Null).await.unwrap();
    }
    assert!(vault.progress().is_empty());

    // A second backup of the same content produces no new blocks.
    let uploads = harness.backend("offsite").upload_count();
    let sources = files.iter().map(|(p, d)| source(p, d.clone())).collect();
    vault.backup_files(sources, &["offsite".to_string()]).await.unwrap();
    assert_eq!(harness.backend("offsite").upload_count(), uploads);
}

async fn mtime_millis(path: &std::path::Path) -> i64 {
    let modified = tokio::fs::metadata(path).await.unwrap().modified().unwrap();
    chrono::DateTime::<chrono::Utc>::from(modified).timestamp_millis()
}

#[tokio::test]
async fn test_compare_against_local_files() {
    let harness = Harness::new(&[("a", plain())]);
    let vault = harness.vault();
    let dir = TempDir::new().unwrap();
    let local = dir.path().join("report.txt");
    let data = b"quarterly numbers: 1 2 3 4 5 6 7 8 9".to_vec();
    tokio::fs::write(&local, &data).await.unwrap();

    let mut backed_up = vault
        .backup_files(vec![source("report.txt", data.clone())], &["a".to_string()])
        .await
        .unwrap();
    let mut file = backed_up.remove(0);
    file.modified = mtime_millis(&local).await;

    vault
        .restore_file(&file, &RestoreTarget::Compare(local.clone()))
        .await
        .unwrap();

    let mut edited = data.clone();
    edited[12] = b'X';
    tokio::fs::write(&local, &edited).await.unwrap();
    file.modified = mtime_millis(&local).await;
    let result = vault.restore_file(&file, &RestoreTarget::Compare(local.clone())).await;
    assert!(matches!(result, Err(Error::CompareMismatch { offset: 12, .. })));

    // The same difference is expected once the recorded time no longer matches.
    file.modified -= 60_000;
    vault
        .restore_file(&file, &RestoreTarget::Compare(local))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_restore_uses_next_location() {
    let harness = Harness::new(&[("a", plain())]);
    let vault = harness.vault();
    let data = pattern(300).to_vec();
    let mut backed_up = vault
        .backup_files(vec![source("notes", data.clone())], &["a".to_string()])
        .await
        .unwrap();
    let mut file = backed_up.remove(0);

    let mut broken = file.locations[0].clone();
    broken.ranges[0].part.block_hash = BlockHash::from_data(b"never stored");
    file.locations.insert(0, broken);

    let dir = TempDir::new().unwrap();
    let target = dir.path().join("notes");
    vault
        .restore_file(&file, &RestoreTarget::File(target.clone()))
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&target).await.unwrap(), data);

    file.locations.truncate(1);
    let result = vault.restore_file(&file, &RestoreTarget::Null).await;
    assert!(matches!(result, Err(Error::RestoreFailed { .. })));
}
