// Copyright 2024 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! On-disk store
//!
//! Layout under the cache directory:
//! - `content/<algorithm>/<aa>/<bb>/<rest of hex digest>`: bodies, named by their strongest hash
//! - `index/<aa>/<bb>/<rest of hex key hash>`: one append-only bucket file per key hash
//! - `tmp/`: in-progress writes, moved into `content/` once verified
//!
//! Directories are created on first write, so a bad cache path only surfaces when something is
//! actually stored.
//!
//! Every change to a bucket, appends included, holds the lock of its key. A compaction can then
//! rewrite the bucket without losing rows appended while it was planning.

use super::*;
use crate::index::{decode_all_frames, decode_frames, encode_frame};
use crate::integrity::Hash;
use crate::key::{hash_key, hex2str};
use crate::lock::KeyLocks;

use bytes::BytesMut;
use log::{debug, trace};
use stash_error::{Error, ErrorType::*, OrErr};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const CONTENT_DIR: &str = "content";
const INDEX_DIR: &str = "index";
const TMP_DIR: &str = "tmp";
const READ_CHUNK: usize = 64 * 1024;
/// Files in `tmp/` older than this are leftovers of writers that never finished
const STALE_TMP: Duration = Duration::from_secs(3600);

fn sharded(base: PathBuf, hex: &str) -> PathBuf {
    if hex.len() < 5 {
        return base.join(hex);
    }
    base.join(&hex[..2]).join(&hex[2..4]).join(&hex[4..])
}

fn storage_err(context: String, e: std::io::Error) -> Box<Error> {
    let etype = if e.kind() == ErrorKind::NotFound {
        NotFound
    } else {
        StorageError
    };
    Error::because(etype, context, e).into_store()
}

/// Content-addressed store in a directory
pub struct DiskStore {
    root: PathBuf,
    location: String,
    last_temp_id: AtomicU64,
    locks: Arc<KeyLocks>,
}

impl DiskStore {
    /// Create a store rooted at `root`
    ///
    /// Nothing is created on disk until the first write. Stale leftovers in `tmp/` are removed.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        let root = root.into();
        let store = DiskStore {
            location: root.display().to_string(),
            root,
            last_temp_id: AtomicU64::new(0),
            locks: Arc::new(KeyLocks::new()),
        };
        store.sweep_tmp(STALE_TMP);
        store
    }

    /// Remove the files of `tmp/` last modified more than `older_than` ago. Returns how many.
    ///
    /// Writers of another process sharing the directory may still own younger files.
    pub fn sweep_tmp(&self, older_than: Duration) -> usize {
        let dir = self.root.join(TMP_DIR);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return 0;
        };
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let stale = entry
                .metadata()
                .ok()
                .filter(|m| m.is_file())
                .and_then(|m| m.modified().ok())
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age >= older_than);
            if stale && std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("removed {removed} stale files from {}", dir.display());
        }
        removed
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the body of `integrity` lives
    pub fn content_path(&self, integrity: &Integrity) -> Result<PathBuf> {
        self.hash_path(integrity.strongest())
    }

    fn hash_path(&self, hash: &Hash) -> Result<PathBuf> {
        let hex = hash.to_hex()?;
        Ok(sharded(
            self.root.join(CONTENT_DIR).join(hash.algorithm.as_str()),
            &hex,
        ))
    }

    fn bucket_path(&self, key: &str) -> PathBuf {
        sharded(self.root.join(INDEX_DIR), &hex2str(&hash_key(key)))
    }

    fn tmp_path(&self) -> PathBuf {
        let id = self.last_temp_id.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or_default();
        self.root
            .join(TMP_DIR)
            .join(format!("{}-{nanos:08x}-{id}", std::process::id()))
    }

    async fn read_bucket(&self, key: &str) -> Result<Vec<IndexEntry>> {
        let path = self.bucket_path(key);
        match fs::read(&path).await {
            Ok(buf) => Ok(decode_frames(&buf, key)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(vec![]),
            Err(e) => Err(storage_err(
                format!("failed to read index {}", path.display()),
                e,
            )),
        }
    }

    /// Replace the bucket of `key` with exactly `rows`, other keys sharing the bucket included
    async fn rewrite_bucket(&self, key: &str, rows: &[IndexEntry]) -> Result<()> {
        let path = self.bucket_path(key);
        let existing = match fs::read(&path).await {
            Ok(buf) => buf,
            Err(e) if e.kind() == ErrorKind::NotFound => vec![],
            Err(e) => {
                return Err(storage_err(
                    format!("failed to read index {}", path.display()),
                    e,
                ))
            }
        };
        let mut buf = vec![];
        // rows of other keys colliding into this bucket stay as they are
        let others = decode_all_frames(&existing)
            .into_iter()
            .filter(|e| e.key != key);
        for row in others.chain(rows.iter().cloned()) {
            buf.extend(encode_frame(&row)?);
        }
        if buf.is_empty() {
            return match fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(storage_err(
                    format!("failed to remove index {}", path.display()),
                    e,
                )),
            };
        }
        let tmp = self.tmp_path();
        create_parent(&tmp).await?;
        fs::write(&tmp, &buf)
            .await
            .map_err(|e| storage_err(format!("failed to write {}", tmp.display()), e))?;
        create_parent(&path).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(storage_err(
                format!("failed to replace index {}", path.display()),
                e,
            ));
        }
        Ok(())
    }
}

async fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| storage_err(format!("failed to create {}", parent.display()), e))?;
    }
    Ok(())
}

struct DiskReader {
    file: File,
}

#[async_trait]
impl HandleRead for DiskReader {
    async fn read_body(&mut self) -> Result<Option<Bytes>> {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let n = self
            .file
            .read_buf(&mut buf)
            .await
            .or_err(StorageError, "failed to read content")
            .map_err(|e| e.into_store())?;
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some(buf.freeze()))
        }
    }
}

struct DiskWriter {
    key: String,
    opts: PutOpts,
    hasher: IntegrityHasher,
    file: Option<File>,
    tmp: PathBuf,
    store_root: PathBuf,
    bucket: PathBuf,
    locks: Arc<KeyLocks>,
    committed: bool,
}

#[async_trait]
impl HandleWrite for DiskWriter {
    async fn write_body(&mut self, data: Bytes) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Error::e_explain(InternalError, "write after finish");
        };
        self.hasher.update(&data);
        file.write_all(&data)
            .await
            .map_err(|e| storage_err(format!("failed to write {}", self.tmp.display()), e))
    }

    async fn finish(mut self: Box<Self>) -> Result<Written> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| storage_err(format!("failed to flush {}", self.tmp.display()), e))?;
        }
        let hasher = std::mem::replace(&mut self.hasher, IntegrityHasher::new(&[]));
        let (integrity, size) = hasher.finish();
        if let Some(expected) = self.opts.integrity.as_ref() {
            if integrity.matches(expected).is_none() {
                return Err(Error::explain(
                    IntegrityError,
                    format!("wanted {expected} but got {integrity}"),
                )
                .into_store());
            }
        }
        if let Some(expected) = self.opts.size {
            if expected != size {
                return Err(Error::explain(
                    IntegrityError,
                    format!("wanted {expected} bytes but got {size}"),
                )
                .into_store());
            }
        }

        let hash = integrity.strongest();
        let target = sharded(
            self.store_root.join(CONTENT_DIR).join(hash.algorithm.as_str()),
            &hash.to_hex()?,
        );
        create_parent(&target).await?;
        // same content may already be there, the rename just replaces it
        fs::rename(&self.tmp, &target)
            .await
            .map_err(|e| storage_err(format!("failed to move content to {}", target.display()), e))?;
        self.committed = true;
        trace!("content {hash} stored at {}", target.display());

        let entry = IndexEntry::content(
            &self.key,
            integrity.clone(),
            size,
            std::mem::take(&mut self.opts.metadata),
        );
        let _guard = self.locks.lock(&self.key).await;
        append_frame(&self.bucket, &entry).await?;
        Ok(Written { integrity, size })
    }
}

impl Drop for DiskWriter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let tmp = std::mem::take(&mut self.tmp);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = fs::remove_file(&tmp).await {
                        trace!("failed to remove {}: {e}", tmp.display());
                    }
                });
            }
            // no runtime to hand it to
            Err(_) => {
                let _ = std::fs::remove_file(&tmp);
            }
        }
    }
}

async fn append_frame(bucket: &Path, entry: &IndexEntry) -> Result<()> {
    let frame = encode_frame(entry)?;
    create_parent(bucket).await?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(bucket)
        .await
        .map_err(|e| storage_err(format!("failed to open index {}", bucket.display()), e))?;
    // one write per frame so concurrent appenders don't interleave
    file.write_all(&frame)
        .await
        .map_err(|e| storage_err(format!("failed to append to {}", bucket.display()), e))?;
    file.flush()
        .await
        .map_err(|e| storage_err(format!("failed to flush {}", bucket.display()), e))
}

#[async_trait]
impl ContentStore for DiskStore {
    fn location(&self) -> &str {
        &self.location
    }

    async fn put_stream(&self, key: &str, opts: PutOpts) -> Result<ContentWriter> {
        let tmp = self.tmp_path();
        create_parent(&tmp).await?;
        let file = File::create(&tmp)
            .await
            .map_err(|e| storage_err(format!("failed to create {}", tmp.display()), e))?;
        debug!("writing {key} through {}", tmp.display());
        Ok(Box::new(DiskWriter {
            key: key.to_string(),
            hasher: IntegrityHasher::new(&opts.hash_algorithms()),
            opts,
            file: Some(file),
            tmp,
            store_root: self.root.clone(),
            bucket: self.bucket_path(key),
            locks: self.locks.clone(),
            committed: false,
        }))
    }

    async fn get_stream(&self, integrity: &Integrity) -> Result<ContentReader> {
        let path = self.content_path(integrity)?;
        let file = File::open(&path)
            .await
            .map_err(|e| storage_err(format!("failed to open {}", path.display()), e))?;
        Ok(Box::new(VerifiedReader::new(
            DiskReader { file },
            integrity.clone(),
        )))
    }

    async fn has_content(&self, integrity: &Integrity) -> Result<bool> {
        let path = self.content_path(integrity)?;
        match fs::metadata(&path).await {
            Ok(m) => Ok(m.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(storage_err(format!("failed to stat {}", path.display()), e)),
        }
    }

    async fn remove_content(&self, integrity: &Integrity) -> Result<bool> {
        let path = self.content_path(integrity)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(storage_err(format!("failed to remove {}", path.display()), e)),
        }
    }

    async fn index_insert(&self, entry: IndexEntry) -> Result<()> {
        let _guard = self.locks.lock(&entry.key).await;
        append_frame(&self.bucket_path(&entry.key), &entry).await
    }

    async fn index_query(&self, key: &str) -> Result<Vec<IndexEntry>> {
        self.read_bucket(key).await
    }

    async fn index_compact(&self, key: &str, opts: &CompactOpts<'_>) -> Result<Vec<IndexEntry>> {
        let _guard = self.locks.lock(key).await;
        let entries = self.read_bucket(key).await?;
        let Some(kept) = plan_compaction(self, &entries, opts).await? else {
            return Ok(entries);
        };
        if kept.len() == entries.len() {
            return Ok(kept);
        }
        // appends to this key wait for the guard, the bucket is still `entries`
        self.rewrite_bucket(key, &kept).await?;
        debug!("compacted {key}: {} rows -> {}", entries.len(), kept.len());
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(meta: &[u8]) -> PutOpts {
        PutOpts {
            metadata: meta.to_vec(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_put_get_query() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path());
        assert!(store.index_query("k").await.unwrap().is_empty());

        let written = store
            .put("k", Bytes::from_static(b"hello, world!"), opts(b"m"))
            .await
            .unwrap();
        assert!(store.content_path(&written.integrity).unwrap().is_file());

        let rows = store.index_query("k").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].size, 13);

        let mut reader = store.get_stream(&written.integrity).await.unwrap();
        let mut body = vec![];
        while let Some(chunk) = reader.read_body().await.unwrap() {
            body.extend_from_slice(&chunk);
        }
        assert_eq!(body, b"hello, world!");

        // survives a new instance
        let again = DiskStore::new(dir.path());
        assert_eq!(again.index_query("k").await.unwrap(), rows);
    }

    #[tokio::test]
    async fn test_dropped_writer_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path());
        let mut writer = store.put_stream("k", opts(b"m")).await.unwrap();
        writer.write_body(Bytes::from_static(b"partial")).await.unwrap();
        drop(writer);
        assert!(store.index_query("k").await.unwrap().is_empty());
        // the partial file is removed in the background
        let tmp_files = || std::fs::read_dir(dir.path().join(TMP_DIR)).unwrap().count();
        for _ in 0..100 {
            if tmp_files() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(tmp_files(), 0);
    }

    #[tokio::test]
    async fn test_stale_tmp_swept() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join(TMP_DIR);
        std::fs::create_dir_all(&tmp).unwrap();
        std::fs::write(tmp.join("1-0-0"), b"left over").unwrap();

        // too young to be anyone's leftover
        let store = DiskStore::new(dir.path());
        assert!(tmp.join("1-0-0").exists());

        assert_eq!(store.sweep_tmp(Duration::ZERO), 1);
        assert!(!tmp.join("1-0-0").exists());
        assert_eq!(store.sweep_tmp(Duration::ZERO), 0);

        // no tmp dir at all
        let missing = DiskStore::new(dir.path().join("nothing"));
        assert_eq!(missing.sweep_tmp(Duration::ZERO), 0);
    }

    #[tokio::test]
    async fn test_append_waits_for_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DiskStore::new(dir.path()));
        store
            .put("k", Bytes::from_static(b"1"), opts(b"a"))
            .await
            .unwrap();

        // hold the key like a compaction between its read and its rewrite
        let guard = store.locks.lock("k").await;
        let rows = store.read_bucket("k").await.unwrap();
        let insert = tokio::spawn({
            let store = store.clone();
            async move { store.index_insert(IndexEntry::deletion("k")).await }
        });
        let put = tokio::spawn({
            let store = store.clone();
            async move {
                store
                    .put("k", Bytes::from_static(b"2"), opts(b"b"))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.index_query("k").await.unwrap(), rows);
        store.rewrite_bucket("k", &rows).await.unwrap();
        drop(guard);

        insert.await.unwrap().unwrap();
        put.await.unwrap().unwrap();
        let rows = store.index_query("k").await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows.iter().filter(|r| r.is_deletion()).count(), 1);
    }

    #[tokio::test]
    async fn test_corruption_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path());
        let written = store
            .put("k", Bytes::from_static(b"hello"), opts(b"m"))
            .await
            .unwrap();
        let path = store.content_path(&written.integrity).unwrap();
        std::fs::write(&path, b"jello").unwrap();

        let mut reader = store.get_stream(&written.integrity).await.unwrap();
        assert!(reader.read_body().await.unwrap().is_some());
        let e = reader.read_body().await.unwrap_err();
        assert_eq!(e.code(), Some("EINTEGRITY"));

        std::fs::remove_file(&path).unwrap();
        let e = store.get_stream(&written.integrity).await.err().unwrap();
        assert_eq!(e.code(), Some("ENOENT"));
    }

    #[tokio::test]
    async fn test_cache_path_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"").unwrap();
        let store = DiskStore::new(&file);

        let e = store
            .put("k", Bytes::from_static(b"hello"), opts(b"m"))
            .await
            .unwrap_err();
        assert_eq!(e.code(), Some("ENOTDIR"));
    }

    #[tokio::test]
    async fn test_compact_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path());
        for (body, meta) in [(b"1", b"a"), (b"2", b"b"), (b"3", b"a")] {
            store
                .put("k", Bytes::copy_from_slice(body), opts(meta))
                .await
                .unwrap();
        }
        let same = |a: &IndexEntry, b: &IndexEntry| a.metadata == b.metadata;
        let copts = CompactOpts {
            matches: &same,
            validate: None,
        };
        let kept = store.index_compact("k", &copts).await.unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(store.index_query("k").await.unwrap(), kept);
        // idempotent
        assert_eq!(store.index_compact("k", &copts).await.unwrap(), kept);

        store.index_insert(IndexEntry::deletion("k")).await.unwrap();
        assert!(live_entries(&store.index_query("k").await.unwrap()).is_empty());
        assert!(store.index_compact("k", &copts).await.unwrap().is_empty());
        assert!(!store.bucket_path("k").exists());
    }
}
