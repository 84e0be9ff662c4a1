//! The content store: threads and posts persisted through a [`KvStore`],
//! mirrored in memory for reads.
//!
//! Locking:
//! - id allocation runs under one async mutex (read, increment, persist);
//! - mutations of a thread (appending replies, pinning, deleting) run under
//!   that thread's own async mutex;
//! - the mirror sits behind a sync `RwLock` that is never held across an
//!   `.await`.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use chrono::Utc;
use dashmap::DashMap;
use domains::{
    keys, CleanContent, DomainError, FeedItem, KvStore, KvStoreExt, OrphanReport, Post,
    RawSubmission, Result, Statistics, StoreError, SystemRecord, Thread, ThreadDetail,
};
use once_cell::sync::OnceCell;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::sanitize::{clean_signature_request, sanitize};
use super::signature::derive_tag;

/// Default number of live threads a board may hold before pruning kicks in.
pub const DEFAULT_MAX_THREADS: usize = 150;

/// Static configuration of a [`ContentStore`].
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub boards: Vec<String>,
    pub max_threads_per_board: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            boards: vec!["b".into(), "cyb".into(), "meta".into()],
            max_threads_per_board: DEFAULT_MAX_THREADS,
        }
    }
}

#[derive(Debug, Default)]
struct Mirror {
    threads: BTreeMap<u64, Thread>,
    posts: BTreeMap<u64, Post>,
}

pub struct ContentStore {
    store: Arc<dyn KvStore>,
    boards: Vec<String>,
    max_threads: usize,
    /// Serializes id allocation.
    sequencer: Mutex<()>,
    /// Highest id handed out so far.
    latest_id: AtomicU64,
    salt: OnceCell<String>,
    mirror: RwLock<Mirror>,
    thread_locks: DashMap<u64, Arc<Mutex<()>>>,
    moderators: RwLock<HashSet<String>>,
    pruner: OnceCell<mpsc::UnboundedSender<String>>,
    pruned: AtomicU64,
}

impl ContentStore {
    pub fn new(store: Arc<dyn KvStore>, settings: StoreSettings) -> Self {
        Self {
            store,
            boards: settings.boards,
            max_threads: settings.max_threads_per_board,
            sequencer: Mutex::new(()),
            latest_id: AtomicU64::new(0),
            salt: OnceCell::new(),
            mirror: RwLock::new(Mirror::default()),
            thread_locks: DashMap::new(),
            moderators: RwLock::new(HashSet::new()),
            pruner: OnceCell::new(),
            pruned: AtomicU64::new(0),
        }
    }

    pub fn boards(&self) -> &[String] {
        &self.boards
    }

    pub fn has_board(&self, board: &str) -> bool {
        self.boards.iter().any(|b| b == board)
    }

    pub fn backend(&self) -> Arc<dyn KvStore> {
        Arc::clone(&self.store)
    }

    // ── Startup ─────────────────────────────────────────────────────────────

    /// Loads the system record, creating it with a fresh salt on first run.
    pub async fn init_system(&self) -> Result<SystemRecord> {
        let _seq = self.sequencer.lock().await;
        let record = match self.store.get_as::<SystemRecord>(keys::SYSTEM).await? {
            Some(record) => record,
            None => {
                let record = SystemRecord { post_count: 0, salt: generate_salt() };
                self.store.set_as(keys::SYSTEM, &record).await?;
                info!("initialized new system record");
                record
            }
        };
        if self.salt.set(record.salt.clone()).is_err() {
            debug!("system salt already cached");
        }
        self.latest_id.fetch_max(record.post_count, Ordering::SeqCst);
        Ok(record)
    }

    /// Rebuilds the in-memory mirror from every `thread-*` and `post-*`
    /// record in the backing store. Returns `(threads, posts)` loaded.
    pub async fn reload(&self) -> Result<(usize, usize)> {
        let mut threads = BTreeMap::new();
        let mut posts = BTreeMap::new();

        for key in self.store.list_keys().await? {
            if let Some(id) = keys::parse_thread(&key) {
                if let Some(thread) = self.store.get_as::<Thread>(&key).await? {
                    threads.insert(id, thread);
                }
            } else if let Some(id) = keys::parse_post(&key) {
                if let Some(post) = self.store.get_as::<Post>(&key).await? {
                    posts.insert(id, post);
                }
            }
        }

        let loaded = (threads.len(), posts.len());
        if let Some(max_id) = threads.keys().chain(posts.keys()).max() {
            self.latest_id.fetch_max(*max_id, Ordering::SeqCst);
        }
        *self.write_mirror() = Mirror { threads, posts };
        info!(threads = loaded.0, posts = loaded.1, "content mirror loaded");
        Ok(loaded)
    }

    /// Lists posts that are not reachable from their parent thread.
    pub fn consistency_sweep(&self) -> Vec<OrphanReport> {
        let mirror = self.read_mirror();
        let orphans: Vec<OrphanReport> = mirror
            .posts
            .values()
            .filter_map(|post| {
                let parent = mirror.threads.get(&post.thread_id);
                let linked = parent.is_some_and(|t| t.reply_ids.contains(&post.id));
                (!linked).then(|| OrphanReport {
                    post_id: post.id,
                    thread_id: post.thread_id,
                    thread_exists: parent.is_some(),
                })
            })
            .collect();
        for orphan in &orphans {
            warn!(
                post_id = orphan.post_id,
                thread_id = orphan.thread_id,
                thread_exists = orphan.thread_exists,
                "orphaned post"
            );
        }
        orphans
    }

    pub fn set_moderators<I>(&self, tags: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut moderators = self.moderators.write().unwrap_or_else(PoisonError::into_inner);
        *moderators = tags.into_iter().collect();
        info!(count = moderators.len(), "moderator list updated");
    }

    pub fn moderators(&self) -> BTreeSet<String> {
        self.moderators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    // ── Ids ─────────────────────────────────────────────────────────────────

    /// Hands out the next id from the persisted counter.
    ///
    /// Ids are unique and strictly increasing across threads and posts. An id
    /// whose record never gets written is skipped, not reused.
    pub async fn allocate_id(&self) -> Result<u64> {
        Ok(self.allocate().await?.post_count)
    }

    async fn allocate(&self) -> Result<SystemRecord> {
        let _seq = self.sequencer.lock().await;
        let mut record: SystemRecord = self
            .store
            .get_as(keys::SYSTEM)
            .await?
            .ok_or_else(|| StoreError::Backend("system record missing".into()))?;
        record.post_count += 1;
        self.store.set_as(keys::SYSTEM, &record).await?;
        self.latest_id.fetch_max(record.post_count, Ordering::SeqCst);
        Ok(record)
    }

    // ── Writes ──────────────────────────────────────────────────────────────

    /// Creates a thread on `board` and schedules a prune of that board.
    pub async fn create_thread(&self, board: &str, raw: &RawSubmission) -> Result<u64> {
        if !self.has_board(board) {
            return Err(DomainError::UnknownBoard(board.to_string()));
        }
        let content = sanitize(raw)?;
        let system = self.allocate().await?;
        let id = system.post_count;

        let CleanContent { subject, email, body, signature_request } = content;
        let thread = Thread {
            id,
            board: board.to_string(),
            subject,
            email,
            body,
            signature_tag: signature_request.map(|r| derive_tag(&r, &system.salt)),
            created_at: Utc::now(),
            pinned: false,
            reply_ids: Vec::new(),
        };

        self.store.set_as(&keys::thread(id), &thread).await?;
        self.write_mirror().threads.insert(id, thread);
        info!(thread_id = id, board, "thread created");

        self.request_prune(board);
        Ok(id)
    }

    /// Creates a reply and appends its id to the parent thread.
    pub async fn create_post(&self, thread_id: u64, raw: &RawSubmission) -> Result<u64> {
        let board = self
            .read_mirror()
            .threads
            .get(&thread_id)
            .map(|t| t.board.clone())
            .ok_or_else(|| DomainError::thread_not_found(thread_id))?;
        let content = sanitize(raw)?;
        let system = self.allocate().await?;
        let id = system.post_count;

        let post = Post {
            id,
            thread_id,
            board,
            email: content.email,
            body: content.body,
            signature_tag: content.signature_request.map(|r| derive_tag(&r, &system.salt)),
            created_at: Utc::now(),
        };
        self.store.set_as(&keys::post(id), &post).await?;

        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().await;

        let parent = self.read_mirror().threads.get(&thread_id).cloned();
        let Some(mut parent) = parent else {
            // The thread was deleted while the reply was being written.
            self.store.remove(&keys::post(id)).await?;
            return Err(DomainError::thread_not_found(thread_id));
        };

        parent.reply_ids.push(id);
        if let Err(source) = self.store.set_as(&keys::thread(thread_id), &parent).await {
            error!(post_id = id, thread_id, error = %source, "reply stored but thread not updated");
            self.write_mirror().posts.insert(id, post);
            return Err(DomainError::OrphanedLink { post_id: id, thread_id, source });
        }

        {
            let mut mirror = self.write_mirror();
            mirror.posts.insert(id, post);
            mirror.threads.insert(thread_id, parent);
        }
        info!(post_id = id, thread_id, "reply created");
        Ok(id)
    }

    /// Pins a thread. Idempotent.
    pub async fn pin(&self, thread_id: u64, signature: &str) -> Result<()> {
        let tag = self.authorize_moderator(signature)?;

        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().await;

        let thread = self.read_mirror().threads.get(&thread_id).cloned();
        let mut thread = thread.ok_or_else(|| DomainError::thread_not_found(thread_id))?;
        if thread.pinned {
            return Ok(());
        }
        thread.pinned = true;
        self.store.set_as(&keys::thread(thread_id), &thread).await?;
        self.write_mirror().threads.insert(thread_id, thread);
        info!(thread_id, moderator = %tag, "thread pinned");
        Ok(())
    }

    /// Deletes a thread and every reply. The signature must belong to a
    /// moderator and match the thread's own tag.
    pub async fn delete_thread(&self, thread_id: u64, signature: &str) -> Result<()> {
        let tag = self.authorize_moderator(signature)?;
        self.authorize_thread_owner(thread_id, &tag)?;

        if !self.remove_thread_cascade(thread_id, |_| true).await? {
            return Err(DomainError::thread_not_found(thread_id));
        }
        info!(thread_id, moderator = %tag, "thread deleted");
        Ok(())
    }

    /// Deletes one reply and unlinks it from its thread.
    pub async fn delete_post(&self, thread_id: u64, post_id: u64, signature: &str) -> Result<()> {
        let tag = self.authorize_moderator(signature)?;
        self.authorize_thread_owner(thread_id, &tag)?;

        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().await;

        let (thread, post_known) = {
            let mirror = self.read_mirror();
            let thread = mirror.threads.get(&thread_id).cloned();
            let post_known = mirror.posts.get(&post_id).is_some_and(|p| p.thread_id == thread_id);
            (thread, post_known)
        };
        let mut thread = thread.ok_or_else(|| DomainError::thread_not_found(thread_id))?;
        if !post_known && !thread.reply_ids.contains(&post_id) {
            return Err(DomainError::post_not_found(post_id));
        }

        self.store.remove(&keys::post(post_id)).await?;
        self.write_mirror().posts.remove(&post_id);

        thread.reply_ids.retain(|id| *id != post_id);
        self.store.set_as(&keys::thread(thread_id), &thread).await?;
        self.write_mirror().threads.insert(thread_id, thread);
        info!(thread_id, post_id, moderator = %tag, "reply deleted");
        Ok(())
    }

    /// Removes a thread, its replies and any orphan pointing at it.
    ///
    /// Replies go first so that a failure part-way leaves the thread record
    /// in place and the call can simply be repeated. `eligible` is checked
    /// against the thread as seen under its lock. Returns `false` when the
    /// thread was already gone or is no longer eligible.
    async fn remove_thread_cascade(&self, thread_id: u64, eligible: impl Fn(&Thread) -> bool) -> Result<bool> {
        let lock = self.thread_lock(thread_id);
        let guard = lock.lock().await;

        let (thread, reply_ids) = {
            let mirror = self.read_mirror();
            let Some(thread) = mirror.threads.get(&thread_id).cloned() else {
                return Ok(false);
            };
            if !eligible(&thread) {
                return Ok(false);
            }
            let mut ids: BTreeSet<u64> = thread.reply_ids.iter().copied().collect();
            ids.extend(
                mirror
                    .posts
                    .values()
                    .filter(|p| p.thread_id == thread_id)
                    .map(|p| p.id),
            );
            (thread, ids)
        };

        for post_id in reply_ids {
            self.store.remove(&keys::post(post_id)).await?;
            self.write_mirror().posts.remove(&post_id);
        }
        self.store.remove(&keys::thread(thread_id)).await?;
        self.write_mirror().threads.remove(&thread_id);

        drop(guard);
        self.thread_locks.remove(&thread_id);
        debug!(thread_id, board = %thread.board, replies = thread.reply_ids.len(), "thread removed");
        Ok(true)
    }

    // ── Pruning ─────────────────────────────────────────────────────────────

    /// Removes the least recently active unpinned thread of `board` once the
    /// board holds `max_threads_per_board` live threads. Returns the removed
    /// thread id, if any.
    pub async fn prune(&self, board: &str) -> Result<Option<u64>> {
        let victim = {
            let mirror = self.read_mirror();
            let live: Vec<&Thread> = mirror.threads.values().filter(|t| t.board == board).collect();
            if live.len() <= 1 || live.len() < self.max_threads {
                return Ok(None);
            }
            live.into_iter()
                .filter(|t| !t.pinned)
                .min_by_key(|t| {
                    let activity = t.last_activity(|id| mirror.posts.get(&id).map(|p| p.created_at));
                    (activity, t.id)
                })
                .map(|t| (t.id, t.reply_ids.len()))
        };

        let Some((victim, replies)) = victim else {
            debug!(board, "every thread is pinned; nothing to prune");
            return Ok(None);
        };
        // A pin or a reply may have landed between selection and the lock.
        let unchanged = |t: &Thread| !t.pinned && t.reply_ids.len() == replies;
        if self.remove_thread_cascade(victim, unchanged).await? {
            self.pruned.fetch_add(1, Ordering::Relaxed);
            info!(board, thread_id = victim, "pruned thread");
            Ok(Some(victim))
        } else {
            debug!(board, thread_id = victim, "prune candidate changed; skipped");
            Ok(None)
        }
    }

    /// Starts the background task that prunes boards after thread creation.
    ///
    /// Prune requests are processed one at a time. The task holds only a weak
    /// reference and stops once the store is dropped.
    pub fn start_pruner(self: &Arc<Self>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        if self.pruner.set(tx).is_err() {
            warn!("pruner already running");
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(board) = rx.recv().await {
                let Some(store) = weak.upgrade() else { break };
                if let Err(e) = store.prune(&board).await {
                    error!(board = %board, error = %e, "prune failed");
                }
            }
            debug!("pruner stopped");
        })
    }

    fn request_prune(&self, board: &str) {
        match self.pruner.get() {
            Some(tx) => {
                if tx.send(board.to_string()).is_err() {
                    warn!(board, "pruner is gone; skipping prune");
                }
            }
            None => debug!(board, "no pruner running"),
        }
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    /// Walks ids downward from the newest, yielding up to `limit` live
    /// threads or posts. Ids whose records are gone are skipped.
    pub fn recent_feed(&self, limit: usize) -> RecentFeed<'_> {
        RecentFeed {
            store: self,
            next_id: self.latest_id.load(Ordering::SeqCst),
            remaining: limit,
        }
    }

    /// Threads of a board in ascending creation order.
    pub fn board_feed(&self, board: &str) -> Result<Vec<Thread>> {
        if !self.has_board(board) {
            return Err(DomainError::UnknownBoard(board.to_string()));
        }
        let mut threads: Vec<Thread> = self
            .read_mirror()
            .threads
            .values()
            .filter(|t| t.board == board)
            .cloned()
            .collect();
        threads.sort_by_key(|t| (t.created_at, t.id));
        Ok(threads)
    }

    pub fn thread(&self, thread_id: u64) -> Option<Thread> {
        self.read_mirror().threads.get(&thread_id).cloned()
    }

    pub fn post(&self, post_id: u64) -> Option<Post> {
        self.read_mirror().posts.get(&post_id).cloned()
    }

    /// A thread with its replies in `reply_ids` order.
    pub fn thread_detail(&self, thread_id: u64) -> Result<ThreadDetail> {
        let mirror = self.read_mirror();
        let op = mirror
            .threads
            .get(&thread_id)
            .cloned()
            .ok_or_else(|| DomainError::thread_not_found(thread_id))?;
        let replies = op
            .reply_ids
            .iter()
            .filter_map(|id| mirror.posts.get(id).cloned())
            .collect();
        Ok(ThreadDetail { op, replies })
    }

    pub fn statistics(&self) -> Statistics {
        Statistics {
            post_count: self.latest_id.load(Ordering::SeqCst),
            threads: self.read_mirror().threads.len(),
        }
    }

    /// Threads removed by pruning since startup.
    pub fn pruned_total(&self) -> u64 {
        self.pruned.load(Ordering::Relaxed)
    }

    /// Number of live threads per board, for metrics.
    pub fn threads_per_board(&self) -> BTreeMap<String, usize> {
        let mirror = self.read_mirror();
        let mut counts: BTreeMap<String, usize> =
            self.boards.iter().map(|b| (b.clone(), 0)).collect();
        for thread in mirror.threads.values() {
            *counts.entry(thread.board.clone()).or_default() += 1;
        }
        counts
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn authorize_moderator(&self, signature: &str) -> Result<String> {
        let request = clean_signature_request(signature)?
            .ok_or_else(|| DomainError::Unauthorized("signature required".into()))?;
        let salt = self
            .salt
            .get()
            .ok_or_else(|| StoreError::Backend("system record not initialized".into()))?;
        let tag = derive_tag(&request, salt);

        let allowed = self
            .moderators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&tag);
        if !allowed {
            warn!(tag = %tag, "moderation attempt by non-moderator");
            return Err(DomainError::Unauthorized("not a moderator".into()));
        }
        Ok(tag)
    }

    fn authorize_thread_owner(&self, thread_id: u64, tag: &str) -> Result<()> {
        let thread_tag = self
            .read_mirror()
            .threads
            .get(&thread_id)
            .map(|t| t.signature_tag.clone())
            .ok_or_else(|| DomainError::thread_not_found(thread_id))?;
        if thread_tag.as_deref() != Some(tag) {
            warn!(thread_id, tag = %tag, "signature does not match thread");
            return Err(DomainError::Unauthorized("signature does not match thread".into()));
        }
        Ok(())
    }

    fn thread_lock(&self, thread_id: u64) -> Arc<Mutex<()>> {
        self.thread_locks
            .entry(thread_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn read_mirror(&self) -> RwLockReadGuard<'_, Mirror> {
        self.mirror.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_mirror(&self) -> RwLockWriteGuard<'_, Mirror> {
        self.mirror.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn generate_salt() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// Lazy iterator returned by [`ContentStore::recent_feed`].
pub struct RecentFeed<'a> {
    store: &'a ContentStore,
    next_id: u64,
    remaining: usize,
}

impl Iterator for RecentFeed<'_> {
    type Item = FeedItem;

    fn next(&mut self) -> Option<FeedItem> {
        while self.remaining > 0 && self.next_id > 0 {
            let id = self.next_id;
            self.next_id -= 1;
            let item = {
                let mirror = self.store.read_mirror();
                mirror
                    .posts
                    .get(&id)
                    .cloned()
                    .map(FeedItem::Post)
                    .or_else(|| mirror.threads.get(&id).cloned().map(FeedItem::Thread))
            };
            if let Some(item) = item {
                self.remaining -= 1;
                return Some(item);
            }
        }
        None
    }
}
