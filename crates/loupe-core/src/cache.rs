use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::fsio::write_atomic;
use crate::hashing::sha256_hex;
use crate::symbols::SymbolTree;

/// Bumped whenever the record layout or the content-hash algorithm
/// (SHA-256 since version 1) changes. Old records read as misses.
pub const SCHEMA_VERSION: u32 = 1;

const RECORD_EXT: &str = "symbols";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub file_path: PathBuf,
    pub content_hash: String,
    pub ls_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    schema_version: u32,
    file_path: PathBuf,
    content_hash: String,
    ls_id: String,
    produced_at: u64,
    symbols: SymbolTree,
}

/// Content-addressed store of per-file symbol trees, one record file per
/// `(file_path, content_hash, ls_id)` key. Strictly an optimization:
/// losing the directory only costs re-indexing.
#[derive(Debug, Clone)]
pub struct SymbolCache {
    dir: PathBuf,
}

impl SymbolCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Conventional location under a project root.
    pub fn for_project(root: &Path) -> Self {
        Self::new(root.join(".loupe").join("cache"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Absence, unreadable records and schema drift all read as a miss.
    pub async fn get(&self, key: &CacheKey) -> Option<SymbolTree> {
        let path = self.record_path(key);
        let bytes = tokio::fs::read(&path).await.ok()?;
        let envelope: Envelope = match serde_json::from_slice(&bytes) {
            Ok(e) => e,
            Err(err) => {
                debug!("discarding unreadable cache record {path:?}: {err}");
                return None;
            }
        };
        if envelope.schema_version != SCHEMA_VERSION {
            debug!(
                "cache schema mismatch for {path:?}: {} != {SCHEMA_VERSION}",
                envelope.schema_version
            );
            return None;
        }
        Some(envelope.symbols)
    }

    /// Atomic write; racing writers for the same key are safe and the last
    /// one wins.
    pub async fn put(&self, key: &CacheKey, symbols: &SymbolTree) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create cache dir {:?}", self.dir))?;

        let envelope = Envelope {
            schema_version: SCHEMA_VERSION,
            file_path: key.file_path.clone(),
            content_hash: key.content_hash.clone(),
            ls_id: key.ls_id.clone(),
            produced_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            symbols: symbols.clone(),
        };
        let bytes = serde_json::to_vec(&envelope).context("failed to serialize cache record")?;
        write_atomic(&self.record_path(key), &bytes).await
    }

    /// Drop every record for `file_path`, whatever its hash or server.
    /// Used after edits, deletes and renames.
    pub async fn evict(&self, file_path: &Path) -> Result<()> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(_) => return Ok(()),
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(e)) => e,
                Ok(None) => break,
                Err(err) => {
                    warn!("cache eviction stopped early: {err}");
                    break;
                }
            };
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Ok(bytes) = tokio::fs::read(&path).await else {
                continue;
            };
            let Ok(envelope) = serde_json::from_slice::<Envelope>(&bytes) else {
                // Unreadable records are dead weight either way.
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            };
            if envelope.file_path == file_path {
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
        Ok(())
    }

    fn record_path(&self, key: &CacheKey) -> PathBuf {
        let mut material = Vec::new();
        material.extend_from_slice(key.file_path.to_string_lossy().as_bytes());
        material.push(0);
        material.extend_from_slice(key.content_hash.as_bytes());
        material.push(0);
        material.extend_from_slice(key.ls_id.as_bytes());
        self.dir
            .join(format!("{}.{RECORD_EXT}", sha256_hex(&material)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::{Position, Range, SymbolKind};
    use tempfile::tempdir;

    fn sample_tree() -> SymbolTree {
        let mut tree = SymbolTree::new();
        let class = tree.push(
            "Calc",
            SymbolKind::Class,
            Range::new(Position::new(0, 0), Position::new(3, 0)),
            Range::new(Position::new(0, 6), Position::new(0, 10)),
            None,
        );
        tree.push(
            "add",
            SymbolKind::Method,
            Range::new(Position::new(1, 4), Position::new(1, 40)),
            Range::new(Position::new(1, 8), Position::new(1, 11)),
            Some(class),
        );
        tree
    }

    fn key(path: &str, hash: &str) -> CacheKey {
        CacheKey {
            file_path: PathBuf::from(path),
            content_hash: hash.to_string(),
            ls_id: "pyright".to_string(),
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let cache = SymbolCache::new(dir.path());
        let tree = sample_tree();

        let k = key("/p/a.py", "h1");
        cache.put(&k, &tree).await.unwrap();
        assert_eq!(cache.get(&k).await, Some(tree));
    }

    #[tokio::test]
    async fn distinct_keys_do_not_collide() {
        let dir = tempdir().unwrap();
        let cache = SymbolCache::new(dir.path());
        let tree = sample_tree();

        cache.put(&key("/p/a.py", "h1"), &tree).await.unwrap();
        assert!(cache.get(&key("/p/a.py", "h2")).await.is_none());
        assert!(cache.get(&key("/p/b.py", "h1")).await.is_none());

        let other_server = CacheKey {
            ls_id: "jedi".to_string(),
            ..key("/p/a.py", "h1")
        };
        assert!(cache.get(&other_server).await.is_none());
    }

    #[tokio::test]
    async fn schema_mismatch_reads_as_miss() {
        let dir = tempdir().unwrap();
        let cache = SymbolCache::new(dir.path());
        let k = key("/p/a.py", "h1");
        cache.put(&k, &sample_tree()).await.unwrap();

        // Rewrite the record claiming a future schema.
        let record = cache.record_path(&k);
        let mut value: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(&record).await.unwrap()).unwrap();
        value["schema_version"] = serde_json::json!(99);
        tokio::fs::write(&record, serde_json::to_vec(&value).unwrap())
            .await
            .unwrap();

        assert!(cache.get(&k).await.is_none());
    }

    #[tokio::test]
    async fn corrupt_record_reads_as_miss() {
        let dir = tempdir().unwrap();
        let cache = SymbolCache::new(dir.path());
        let k = key("/p/a.py", "h1");
        cache.put(&k, &sample_tree()).await.unwrap();
        tokio::fs::write(cache.record_path(&k), b"{not json")
            .await
            .unwrap();
        assert!(cache.get(&k).await.is_none());
    }

    #[tokio::test]
    async fn evict_removes_all_hashes_for_a_path() {
        let dir = tempdir().unwrap();
        let cache = SymbolCache::new(dir.path());
        let tree = sample_tree();

        cache.put(&key("/p/a.py", "h1"), &tree).await.unwrap();
        cache.put(&key("/p/a.py", "h2"), &tree).await.unwrap();
        cache.put(&key("/p/b.py", "h1"), &tree).await.unwrap();

        cache.evict(&PathBuf::from("/p/a.py")).await.unwrap();

        assert!(cache.get(&key("/p/a.py", "h1")).await.is_none());
        assert!(cache.get(&key("/p/a.py", "h2")).await.is_none());
        assert!(cache.get(&key("/p/b.py", "h1")).await.is_some());
    }

    #[tokio::test]
    async fn last_writer_wins_for_same_key() {
        let dir = tempdir().unwrap();
        let cache = SymbolCache::new(dir.path());
        let k = key("/p/a.py", "h1");

        let mut first = SymbolTree::new();
        first.push(
            "old",
            SymbolKind::Function,
            Range::new(Position::new(0, 0), Position::new(1, 0)),
            Range::new(Position::new(0, 4), Position::new(0, 7)),
            None,
        );
        cache.put(&k, &first).await.unwrap();
        let second = sample_tree();
        cache.put(&k, &second).await.unwrap();

        assert_eq!(cache.get(&k).await, Some(second));
    }
}
