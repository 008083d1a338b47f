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

//! Response bodies and the movement of their bytes between network, caller and store
//!
//! A [Body] has exactly one producer: the network, or a stored content. Bodies that are being
//! cached write to the store as the caller reads them, so a body that is never read never
//! writes anything. Every body settles its [Integrity] and size once it reaches its end, see
//! [Settled].

use crate::key::CacheKey;
use crate::transport::{empty_body, BodyStream};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use log::{debug, trace, warn};
use stash_error::{Error, ErrorType::*, Result};
use stash_store::{
    Algorithm, ContentReader, ContentStore, ContentWriter, IndexEntry, Integrity,
    IntegrityChecker, IntegrityHasher, PutOpts, Written,
};
use std::sync::Arc;
use tokio::sync::watch;

/// Bodies with a known length below this many bytes are buffered before being stored
pub const DEFAULT_BUFFER_THRESHOLD: u64 = 5 * 1024 * 1024;

/// How a body moves to or from the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// Collected in memory, then written or handed over in one piece
    Buffer,
    /// Chunk by chunk
    Stream,
}

impl PipelineMode {
    /// Buffer when the length is known and below `threshold`
    pub fn choose(content_length: Option<u64>, threshold: u64) -> Self {
        match content_length {
            Some(len) if len < threshold => PipelineMode::Buffer,
            _ => PipelineMode::Stream,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineMode::Buffer => "buffer",
            PipelineMode::Stream => "stream",
        }
    }
}

/// A value that is set at most once and can be observed any time after
///
/// Observers that show up after the value was set still see it. If the setting side goes away
/// without setting it, e.g. because the body failed, observers see `None`.
#[derive(Debug, Clone)]
pub struct Settled<T> {
    rx: watch::Receiver<Option<T>>,
}

/// The setting side of a [Settled]
#[derive(Debug)]
pub struct Settler<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Settled<T> {
    pub fn channel() -> (Settler<T>, Settled<T>) {
        let (tx, rx) = watch::channel(None);
        (Settler { tx }, Settled { rx })
    }

    /// A value that is already settled
    pub fn ready(value: T) -> Self {
        let (_tx, rx) = watch::channel(Some(value));
        Settled { rx }
    }

    /// The value if it is settled by now
    pub fn get(&self) -> Option<T> {
        self.rx.borrow().clone()
    }

    /// Wait for the value to settle
    pub async fn wait(&self) -> Option<T> {
        let mut rx = self.rx.clone();
        let settled = rx.wait_for(Option::is_some).await.map(|v| v.clone());
        match settled {
            Ok(v) => v,
            // the settler is gone, whatever it left is final
            Err(_) => rx.borrow().clone(),
        }
    }
}

impl<T> Settler<T> {
    pub fn settle(self, value: T) {
        self.tx.send_replace(Some(value));
    }
}

enum Chunk {
    Data(Bytes),
    End(Integrity, u64),
}

/// A network body handed to the caller without being stored
struct Passthrough {
    stream: BodyStream,
    hasher: IntegrityHasher,
    checker: Option<IntegrityChecker>,
}

impl Passthrough {
    async fn read(&mut self) -> Result<Chunk> {
        match self.stream.next().await {
            Some(data) => {
                let data = data?;
                self.hasher.update(&data);
                if let Some(checker) = self.checker.as_mut() {
                    checker.update(&data);
                }
                Ok(Chunk::Data(data))
            }
            None => {
                if let Some(checker) = self.checker.take() {
                    checker.finish()?;
                }
                let hasher = std::mem::replace(&mut self.hasher, IntegrityHasher::new(&[]));
                let (integrity, size) = hasher.finish();
                Ok(Chunk::End(integrity, size))
            }
        }
    }
}

enum WriteState {
    Idle,
    Streaming(ContentWriter),
    // buffered body written, its bytes not handed out yet
    Flushed(Option<Bytes>, Written),
    Done,
}

/// A network body written to the store as the caller reads it
struct Tee {
    stream: BodyStream,
    store: Arc<dyn ContentStore>,
    key: CacheKey,
    opts: PutOpts,
    mode: PipelineMode,
    state: WriteState,
}

impl Tee {
    async fn read(&mut self) -> Result<Chunk> {
        loop {
            match &mut self.state {
                WriteState::Idle => match self.mode {
                    PipelineMode::Buffer => {
                        let mut buf = BytesMut::new();
                        while let Some(data) = self.stream.next().await {
                            buf.extend_from_slice(&data?);
                        }
                        let data = buf.freeze();
                        let written = self
                            .store
                            .put(self.key.as_str(), data.clone(), self.opts.clone())
                            .await?;
                        debug!("buffered {} bytes into {}", written.size, self.key);
                        self.state = WriteState::Flushed(Some(data), written);
                    }
                    PipelineMode::Stream => {
                        let writer = self
                            .store
                            .put_stream(self.key.as_str(), self.opts.clone())
                            .await?;
                        trace!("streaming {} into the store", self.key);
                        self.state = WriteState::Streaming(writer);
                    }
                },
                WriteState::Streaming(writer) => match self.stream.next().await {
                    Some(data) => {
                        let data = data?;
                        writer.write_body(data.clone()).await?;
                        return Ok(Chunk::Data(data));
                    }
                    None => {
                        let WriteState::Streaming(writer) =
                            std::mem::replace(&mut self.state, WriteState::Done)
                        else {
                            return Error::e_explain(InternalError, "write state changed");
                        };
                        let written = writer.finish().await?;
                        debug!("streamed {} bytes into {}", written.size, self.key);
                        return Ok(Chunk::End(written.integrity, written.size));
                    }
                },
                WriteState::Flushed(data, written) => {
                    if let Some(data) = data.take().filter(|d| !d.is_empty()) {
                        return Ok(Chunk::Data(data));
                    }
                    let end = Chunk::End(written.integrity.clone(), written.size);
                    self.state = WriteState::Done;
                    return Ok(end);
                }
                WriteState::Done => {
                    return Error::e_explain(InternalError, "body read after its end");
                }
            }
        }
    }
}

/// A stored body read back for the caller
///
/// Any failure to read it invalidates the key so the next lookup misses, content that fails
/// its integrity check is removed as well.
struct Replay {
    store: Arc<dyn ContentStore>,
    key: CacheKey,
    integrity: Integrity,
    mode: PipelineMode,
    reader: Option<ContentReader>,
    size: u64,
}

impl Replay {
    async fn read(&mut self) -> Result<Chunk> {
        match self.read_inner().await {
            Ok(chunk) => Ok(chunk),
            Err(e) => {
                self.heal(&e).await;
                Err(e)
            }
        }
    }

    async fn read_inner(&mut self) -> Result<Chunk> {
        if self.reader.is_none() {
            self.reader = Some(self.store.get_stream(&self.integrity).await?);
        }
        let Some(reader) = self.reader.as_mut() else {
            return Error::e_explain(InternalError, "no content reader");
        };
        let next = match self.mode {
            PipelineMode::Stream => reader.read_body().await?,
            PipelineMode::Buffer => {
                let mut buf = BytesMut::new();
                while let Some(data) = reader.read_body().await? {
                    buf.extend_from_slice(&data);
                }
                self.mode = PipelineMode::Stream;
                Some(buf.freeze()).filter(|b| !b.is_empty())
            }
        };
        match next {
            Some(data) => {
                self.size += data.len() as u64;
                Ok(Chunk::Data(data))
            }
            None => Ok(Chunk::End(self.integrity.clone(), self.size)),
        }
    }

    async fn heal(&self, e: &Error) {
        warn!(
            "failed to read stored body of {}, invalidating: {e}",
            self.key
        );
        if let Err(err) = self
            .store
            .index_insert(IndexEntry::deletion(self.key.as_str()))
            .await
        {
            warn!("failed to invalidate {}: {err}", self.key);
        }
        if e.etype() == &IntegrityError {
            if let Err(err) = self.store.remove_content(&self.integrity).await {
                warn!("failed to remove corrupt content of {}: {err}", self.key);
            }
        }
    }
}

enum Source {
    Passthrough(Passthrough),
    Tee(Box<Tee>),
    Replay(Box<Replay>),
    Done,
}

/// A response body
///
/// Errors of the producer, of the store and integrity mismatches are returned by
/// [Body::read_body]. After the end, or after an error, the body only returns `None`.
pub struct Body {
    source: Source,
    mode: Option<PipelineMode>,
    integrity: Settled<Integrity>,
    size: Settled<u64>,
    settlers: Option<(Settler<Integrity>, Settler<u64>)>,
}

impl Body {
    fn with_source(source: Source, mode: Option<PipelineMode>) -> Self {
        let (integrity_tx, integrity) = Settled::channel();
        let (size_tx, size) = Settled::channel();
        Body {
            source,
            mode,
            integrity,
            size,
            settlers: Some((integrity_tx, size_tx)),
        }
    }

    /// A network body that is not stored
    ///
    /// With `expected`, the end of the body fails with `EINTEGRITY` unless it matches.
    pub fn passthrough(
        stream: BodyStream,
        algorithms: &[Algorithm],
        expected: Option<Integrity>,
    ) -> Self {
        let source = Source::Passthrough(Passthrough {
            stream,
            hasher: IntegrityHasher::new(algorithms),
            checker: expected.map(IntegrityChecker::new),
        });
        Self::with_source(source, None)
    }

    /// A body with no bytes
    pub fn empty() -> Self {
        Self::passthrough(empty_body(), &[], None)
    }

    /// A network body stored under `key` as it is read
    ///
    /// `opts` carry the index metadata and, if any, the integrity the content has to match for
    /// the write to commit.
    pub fn tee(
        stream: BodyStream,
        store: Arc<dyn ContentStore>,
        key: CacheKey,
        opts: PutOpts,
        mode: PipelineMode,
    ) -> Self {
        let source = Source::Tee(Box::new(Tee {
            stream,
            store,
            key,
            opts,
            mode,
            state: WriteState::Idle,
        }));
        Self::with_source(source, Some(mode))
    }

    /// The stored content with `integrity`, read back for `key`
    pub fn replay(
        store: Arc<dyn ContentStore>,
        key: CacheKey,
        integrity: Integrity,
        mode: PipelineMode,
    ) -> Self {
        let source = Source::Replay(Box::new(Replay {
            store,
            key,
            integrity,
            mode,
            reader: None,
            size: 0,
        }));
        Self::with_source(source, Some(mode))
    }

    /// An empty body standing for stored content that is not read, as for `HEAD`
    pub fn settled_empty(integrity: Integrity, size: u64) -> Self {
        Body {
            source: Source::Done,
            mode: None,
            integrity: Settled::ready(integrity),
            size: Settled::ready(size),
            settlers: None,
        }
    }

    /// How the body moves through the store, `None` when it does not
    pub fn mode(&self) -> Option<PipelineMode> {
        self.mode
    }

    /// The integrity of the whole body, settled at its end
    pub fn integrity(&self) -> Settled<Integrity> {
        self.integrity.clone()
    }

    /// The length of the whole body, settled at its end
    pub fn size(&self) -> Settled<u64> {
        self.size.clone()
    }

    /// Read the next chunk, `None` at the end
    pub async fn read_body(&mut self) -> Result<Option<Bytes>> {
        let res = match &mut self.source {
            Source::Passthrough(s) => s.read().await,
            Source::Tee(s) => s.read().await,
            Source::Replay(s) => s.read().await,
            Source::Done => return Ok(None),
        };
        match res {
            Ok(Chunk::Data(data)) => Ok(Some(data)),
            Ok(Chunk::End(integrity, size)) => {
                self.source = Source::Done;
                if let Some((integrity_tx, size_tx)) = self.settlers.take() {
                    integrity_tx.settle(integrity);
                    size_tx.settle(size);
                }
                Ok(None)
            }
            Err(e) => {
                self.source = Source::Done;
                self.settlers = None;
                Err(e)
            }
        }
    }

    /// Read the rest of the body
    pub async fn bytes(&mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(data) = self.read_body().await? {
            buf.extend_from_slice(&data);
        }
        Ok(buf.freeze())
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Body")
            .field("mode", &self.mode)
            .field("integrity", &self.integrity.get())
            .field("size", &self.size.get())
            .finish_non_exhaustive()
    }
}

/// Read the stored content with `integrity` to its end, return its size
///
/// Fails with `ENOENT` when it is missing and `EINTEGRITY` when it is corrupt.
pub async fn verify_stored(store: &dyn ContentStore, integrity: &Integrity) -> Result<u64> {
    let mut reader = store.get_stream(integrity).await?;
    let mut size = 0;
    while let Some(data) = reader.read_body().await? {
        size += data.len() as u64;
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::chunked_body;
    use stash_store::MemStore;
    use url::Url;

    const CONTENT: &[u8] = b"foobarbazbuzz";

    fn key() -> CacheKey {
        CacheKey::for_url(&Url::parse("https://registry.test/pkg").unwrap())
    }

    fn body() -> BodyStream {
        chunked_body(vec![
            Bytes::from_static(b"foobar"),
            Bytes::from_static(b"bazbuzz"),
        ])
    }

    fn put_opts() -> PutOpts {
        PutOpts {
            metadata: b"meta".to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_choose_mode() {
        assert_eq!(PipelineMode::choose(Some(10), 100), PipelineMode::Buffer);
        assert_eq!(PipelineMode::choose(Some(100), 100), PipelineMode::Stream);
        assert_eq!(PipelineMode::choose(None, 100), PipelineMode::Stream);
        assert_eq!(PipelineMode::Buffer.as_str(), "buffer");
    }

    #[tokio::test]
    async fn test_settled_replays_to_late_observers() {
        let (tx, settled) = Settled::channel();
        assert_eq!(settled.get(), None);
        let early = settled.clone();
        let waiter = tokio::spawn(async move { early.wait().await });
        tx.settle(13u64);
        assert_eq!(waiter.await.unwrap(), Some(13));
        // observers after the fact see the same value
        assert_eq!(settled.wait().await, Some(13));
        assert_eq!(settled.clone().get(), Some(13));

        let (tx, settled) = Settled::<u64>::channel();
        drop(tx);
        assert_eq!(settled.wait().await, None);
    }

    #[tokio::test]
    async fn test_passthrough_settles_at_end() {
        let mut body = Body::passthrough(body(), &[Algorithm::Sha512], None);
        assert_eq!(body.mode(), None);
        let integrity = body.integrity();
        assert_eq!(integrity.get(), None);
        assert_eq!(body.bytes().await.unwrap(), CONTENT);
        assert_eq!(
            integrity.wait().await,
            Some(Integrity::from_bytes(CONTENT, &[Algorithm::Sha512]))
        );
        assert_eq!(body.size().wait().await, Some(CONTENT.len() as u64));
        assert!(body.read_body().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_passthrough_expected_integrity() {
        let good = Integrity::from_bytes(CONTENT, &[Algorithm::Sha256]);
        let mut body = Body::passthrough(body(), &[], Some(good));
        assert_eq!(body.bytes().await.unwrap(), CONTENT);

        let bad = Integrity::from_bytes(b"other", &[Algorithm::Sha512]);
        let mut body = Body::passthrough(self::body(), &[], Some(bad));
        let err = body.bytes().await.unwrap_err();
        assert_eq!(err.code(), Some("EINTEGRITY"));
        // failed bodies never settle
        assert_eq!(body.integrity().wait().await, None);
    }

    #[tokio::test]
    async fn test_tee_writes_on_consume() {
        for mode in [PipelineMode::Buffer, PipelineMode::Stream] {
            let store = Arc::new(MemStore::new());
            let mut body = Body::tee(body(), store.clone(), key(), put_opts(), mode);
            assert_eq!(body.mode(), Some(mode));
            assert!(store.index_query(key().as_str()).await.unwrap().is_empty());

            assert_eq!(body.bytes().await.unwrap(), CONTENT);
            let rows = store.index_query(key().as_str()).await.unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].metadata.as_deref(), Some(&b"meta"[..]));
            let integrity = body.integrity().wait().await.unwrap();
            assert_eq!(rows[0].integrity.as_ref(), Some(&integrity));
            assert_eq!(
                verify_stored(&*store, &integrity).await.unwrap(),
                CONTENT.len() as u64
            );
        }
    }

    #[tokio::test]
    async fn test_tee_unread_writes_nothing() {
        let store = Arc::new(MemStore::new());
        let mut body = Body::tee(body(), store.clone(), key(), put_opts(), PipelineMode::Stream);
        assert_eq!(
            body.read_body().await.unwrap().unwrap(),
            Bytes::from_static(b"foobar")
        );
        assert_eq!(store.in_flight(), 1);
        drop(body);
        assert_eq!(store.in_flight(), 0);
        assert!(store.index_query(key().as_str()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tee_expected_integrity_mismatch() {
        let store = Arc::new(MemStore::new());
        let opts = PutOpts {
            integrity: Some(Integrity::from_bytes(b"other", &[])),
            ..put_opts()
        };
        let mut body = Body::tee(body(), store.clone(), key(), opts, PipelineMode::Buffer);
        assert_eq!(body.bytes().await.unwrap_err().code(), Some("EINTEGRITY"));
        assert!(store.index_query(key().as_str()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replay_and_heal() {
        let store = Arc::new(MemStore::new());
        let written = store
            .put(key().as_str(), Bytes::from_static(CONTENT), put_opts())
            .await
            .unwrap();

        let mut body = Body::replay(
            store.clone(),
            key(),
            written.integrity.clone(),
            PipelineMode::Buffer,
        );
        assert_eq!(body.read_body().await.unwrap().unwrap(), CONTENT);
        assert!(body.read_body().await.unwrap().is_none());
        assert_eq!(body.size().wait().await, Some(CONTENT.len() as u64));

        store.overwrite_content(&written.integrity, Bytes::from_static(b"garbage"));
        let mut body = Body::replay(
            store.clone(),
            key(),
            written.integrity.clone(),
            PipelineMode::Stream,
        );
        assert_eq!(body.bytes().await.unwrap_err().code(), Some("EINTEGRITY"));
        let rows = store.index_query(key().as_str()).await.unwrap();
        assert!(rows.last().unwrap().is_deletion());
        assert!(!store.has_content(&written.integrity).await.unwrap());

        let mut body = Body::replay(store.clone(), key(), written.integrity, PipelineMode::Stream);
        assert_eq!(body.bytes().await.unwrap_err().code(), Some("ENOENT"));
    }

    #[tokio::test]
    async fn test_settled_empty() {
        let integrity = Integrity::from_bytes(CONTENT, &[]);
        let mut body = Body::settled_empty(integrity.clone(), 13);
        assert!(body.read_body().await.unwrap().is_none());
        assert_eq!(body.integrity().get(), Some(integrity));
        assert_eq!(body.size().get(), Some(13));
    }
}
