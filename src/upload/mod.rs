//! Collaborative upload buffer.
//!
//! A host message opens an [`UploadSession`]; any number of contributors
//! then add files to it concurrently until the session is taken, cleared,
//! or expires. The session lifetime is fixed when it is opened: appends are
//! committed with the TTL preserved, so activity never extends it.
//!
//! # Contribution protocol
//!
//! [`UploadBuffer::contribute`] runs entirely under the session key's
//! [`KeyedMutex`]:
//!
//! 1. snapshot the session (gone: [`ContributionOutcome::SessionClosed`]);
//! 2. check the media kind ([`ContributionOutcome::KindMismatch`]);
//! 3. resolve the file link, the slow step, while holding the key;
//! 4. re-read the session and compare its file list with the snapshot,
//!    position by position. Any difference means the session expired,
//!    was replaced, or was written outside the lock during the wait:
//!    [`ContributionOutcome::Conflict`], nothing appended;
//! 5. append and commit with the TTL preserved.
//!
//! Resolver failures are returned as `Err` to that contributor only; the
//! key is released on every path.

pub mod resolver;
pub mod retry;

pub use resolver::{CachingLinkResolver, LinkCacheConfig, LinkResolver};
pub use retry::{RetryConfig, RetryingLinkResolver};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::Result;
use crate::lock::KeyedMutex;
use crate::store::{KeyedTtlStore, SetOptions, StoreConfig};
use crate::telemetry;

/// Kind of media a session collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Document,
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Document => "document",
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved file in a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub display_name: String,
    pub remote_link: String,
}

/// Files collected for one host message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub owner_id: i64,
    pub host_message_id: i64,
    /// Tool the files are collected for (e.g. "merge_pdf").
    pub tool_kind: String,
    pub media_kind: MediaKind,
    pub files: Vec<FileDescriptor>,
}

impl UploadSession {
    /// An empty session.
    pub fn new(
        owner_id: i64,
        host_message_id: i64,
        tool_kind: impl Into<String>,
        media_kind: MediaKind,
    ) -> Self {
        Self {
            owner_id,
            host_message_id,
            tool_kind: tool_kind.into(),
            media_kind,
            files: Vec::new(),
        }
    }

    /// Buffer key of this session.
    pub fn key(&self) -> String {
        session_key(self.owner_id, self.host_message_id)
    }
}

/// Buffer key for a host message.
pub fn session_key(owner_id: i64, host_message_id: i64) -> String {
    format!("upload:{owner_id}:{host_message_id}")
}

/// An incoming file, before its link is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contribution {
    pub file_id: String,
    pub display_name: String,
    pub media_kind: MediaKind,
}

impl Contribution {
    pub fn new(
        file_id: impl Into<String>,
        display_name: impl Into<String>,
        media_kind: MediaKind,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            display_name: display_name.into(),
            media_kind,
        }
    }
}

/// What happened to a contribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContributionOutcome {
    /// Appended at `position` (0-based) in the session's file list.
    Appended { position: usize },
    /// No live session for the key.
    SessionClosed,
    /// The file's kind differs from the session's.
    KindMismatch {
        expected: MediaKind,
        actual: MediaKind,
    },
    /// The session already holds `max_files` files.
    SessionFull { max_files: usize },
    /// The session changed during link resolution; the file was dropped.
    Conflict,
}

impl ContributionOutcome {
    fn label(&self) -> &'static str {
        match self {
            ContributionOutcome::Appended { .. } => "appended",
            ContributionOutcome::SessionClosed => "session_closed",
            ContributionOutcome::KindMismatch { .. } => "kind_mismatch",
            ContributionOutcome::SessionFull { .. } => "session_full",
            ContributionOutcome::Conflict => "conflict",
        }
    }
}

/// Configuration for an [`UploadBuffer`].
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Lifetime of a session from the moment it is opened. Default: 24h.
    pub session_ttl: Duration,
    /// Maximum concurrently open sessions. Default: 1,000.
    pub max_sessions: usize,
    /// Maximum files per session. Default: 20.
    pub max_files: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(24 * 3600),
            max_sessions: 1_000,
            max_files: 20,
        }
    }
}

impl UploadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn max_sessions(mut self, n: usize) -> Self {
        self.max_sessions = n;
        self
    }

    pub fn max_files(mut self, n: usize) -> Self {
        self.max_files = n;
        self
    }

    /// Store configuration backing the buffer.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new()
            .max_entries(self.max_sessions)
            .ttl(self.session_ttl)
    }
}

/// Sessions of files collected from concurrent contributors.
pub struct UploadBuffer {
    sessions: Arc<KeyedTtlStore<UploadSession>>,
    locks: KeyedMutex,
    resolver: Arc<dyn LinkResolver>,
    config: UploadConfig,
}

impl UploadBuffer {
    pub fn new(config: UploadConfig, resolver: Arc<dyn LinkResolver>) -> Self {
        let sessions = Arc::new(KeyedTtlStore::new(config.store_config()));
        Self::with_store(sessions, config, resolver)
    }

    /// Build over an existing session store, e.g. one shared with other
    /// components.
    pub fn with_store(
        sessions: Arc<KeyedTtlStore<UploadSession>>,
        config: UploadConfig,
        resolver: Arc<dyn LinkResolver>,
    ) -> Self {
        Self {
            sessions,
            locks: KeyedMutex::new(),
            resolver,
            config,
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Start (or restart) a session. Returns its key.
    ///
    /// The session lives for `session_ttl` from now regardless of later
    /// activity.
    pub async fn open(&self, session: UploadSession) -> String {
        let key = session.key();
        let ttl = self.config.session_ttl;
        self.locks
            .with_lock(&key, || async {
                info!(
                    key = %key,
                    tool = %session.tool_kind,
                    media = %session.media_kind,
                    "upload session opened"
                );
                self.sessions.set(key.clone(), session, SetOptions::new().ttl(ttl));
            })
            .await;
        key
    }

    /// Add a contribution to the session at `key`.
    pub async fn contribute(
        &self,
        key: &str,
        contribution: Contribution,
    ) -> Result<ContributionOutcome> {
        let outcome = self
            .locks
            .with_lock(key, || self.contribute_locked(key, contribution))
            .await?;
        metrics::counter!(telemetry::UPLOAD_CONTRIBUTIONS_TOTAL, "outcome" => outcome.label())
            .increment(1);
        Ok(outcome)
    }

    async fn contribute_locked(
        &self,
        key: &str,
        contribution: Contribution,
    ) -> Result<ContributionOutcome> {
        let Some(snapshot) = self.sessions.get(key) else {
            debug!(key, "contribution to closed session");
            return Ok(ContributionOutcome::SessionClosed);
        };
        if snapshot.media_kind != contribution.media_kind {
            return Ok(ContributionOutcome::KindMismatch {
                expected: snapshot.media_kind,
                actual: contribution.media_kind,
            });
        }
        if snapshot.files.len() >= self.config.max_files {
            return Ok(ContributionOutcome::SessionFull {
                max_files: self.config.max_files,
            });
        }

        let remote_link = self.resolver.resolve(&contribution.file_id).await?;

        let current = match self.sessions.get(key) {
            Some(current) if current.files == snapshot.files => current,
            _ => {
                info!(
                    key,
                    file_id = %contribution.file_id,
                    "upload session changed during link resolution, dropping file"
                );
                return Ok(ContributionOutcome::Conflict);
            }
        };

        let mut updated = current;
        updated.files.push(FileDescriptor {
            display_name: contribution.display_name,
            remote_link,
        });
        let position = updated.files.len() - 1;
        self.sessions
            .set(key, updated, SetOptions::new().preserve_ttl());
        debug!(key, position, "file appended to upload session");
        Ok(ContributionOutcome::Appended { position })
    }

    /// Current state of a session, without taking its lock.
    pub fn snapshot(&self, key: &str) -> Option<UploadSession> {
        self.sessions.get(key)
    }

    /// End a session and return what it collected.
    ///
    /// Waits for in-flight contributions to the same key first.
    pub async fn take(&self, key: &str) -> Option<UploadSession> {
        self.locks
            .with_lock(key, || async {
                let session = self.sessions.get(key)?;
                self.sessions.delete(key);
                Some(session)
            })
            .await
    }

    /// Discard a session. Returns whether a live one existed.
    pub async fn clear(&self, key: &str) -> bool {
        self.locks
            .with_lock(key, || async { self.sessions.delete(key) })
            .await
    }

    /// Time left before the session at `key` expires.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        self.sessions.remaining_ttl(key)
    }

    /// Number of stored sessions (including expired, unpurged ones).
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Whether a contribution or other operation holds `key`.
    pub fn is_busy(&self, key: &str) -> bool {
        self.locks.is_locked(key)
    }
}
