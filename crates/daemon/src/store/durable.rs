// Generic CRUD store with crash-safe persistence.
//
// The in-memory cache is the read path; every mutation persists the whole
// index (exclusive flock, temp file, fsync, rename) while holding the cache
// write lock, so mutations are totally ordered within the process and the
// cache never reflects a write that failed to reach disk. Listeners run
// after the lock is released but still in commit order: each commit bumps
// the revision by one and waits for the previous revision's listeners.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tracing::{debug, info_span, warn, Span};
use workloop_common::error::{StoreError, ValidationError};
use workloop_common::event::ChangeEvent;
use workloop_common::record::{new_id, Record};

use super::hash::ContentHash;
use super::index::{IndexFile, LoadedIndex};
use crate::watcher::reconcile::diff;

/// Observer invoked after every committed change.
///
/// Runs on the mutating thread after the cache lock is released, one
/// commit at a time in revision order. A listener may read the store but
/// must hand writes to a new task; an inline write waits on its own turn.
pub type ChangeListener<R> = Arc<dyn Fn(&ChangeEvent<R>) + Send + Sync>;

/// Ordered copy of the cache and the revision it reflects.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<R> {
    pub records: Vec<R>,
    pub revision: u64,
}

/// Result of folding an on-disk index into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Absorb {
    /// The cache changed; this many events were delivered.
    Applied(usize),
    /// Disk and cache already agreed.
    Unchanged,
    /// A local write landed after the disk read began; nothing applied.
    Stale,
}

struct Cache<R> {
    records: Vec<R>,
    revision: u64,
    digest: Option<ContentHash>,
}

pub struct DurableStore<R: Record> {
    index: IndexFile,
    cache: RwLock<Cache<R>>,
    write_generation: AtomicU64,
    listeners: Mutex<Vec<ChangeListener<R>>>,
    /// Last revision whose listeners have finished.
    delivered: Mutex<u64>,
    turn: Condvar,
    span: Span,
}

impl<R: Record> DurableStore<R> {
    /// Open the store for `data_dir`, loading the index under a shared lock
    /// so a fresh process starts from what is actually on disk.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let index = IndexFile::for_record::<R>(data_dir);
        let loaded: LoadedIndex<R> = index.read()?;
        let span = info_span!("durable_store", entity = R::ENTITY);
        debug!(parent: &span, records = loaded.records.len(), path = %index.path().display(), "index loaded");

        Ok(Self {
            index,
            cache: RwLock::new(Cache { records: loaded.records, revision: 0, digest: loaded.digest }),
            write_generation: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
            delivered: Mutex::new(0),
            turn: Condvar::new(),
            span,
        })
    }

    /// Replace the span this store logs under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn index(&self) -> &IndexFile {
        &self.index
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Ordered copy of every record.
    pub fn list(&self) -> Vec<R> {
        let mut records = self.read_cache().records.clone();
        R::order(&mut records);
        records
    }

    pub fn get(&self, id: &str) -> Option<R> {
        self.read_cache().records.iter().find(|r| r.id() == id).cloned()
    }

    pub fn snapshot(&self) -> Snapshot<R> {
        self.snapshot_with(|snapshot| snapshot)
    }

    /// Run `f` on a snapshot while holding the cache read lock, so no
    /// change can commit between the snapshot and whatever `f` registers.
    pub fn snapshot_with<T>(&self, f: impl FnOnce(Snapshot<R>) -> T) -> T {
        let cache = self.read_cache();
        let mut records = cache.records.clone();
        R::order(&mut records);
        f(Snapshot { records, revision: cache.revision })
    }

    pub fn write_generation(&self) -> u64 {
        self.write_generation.load(Ordering::SeqCst)
    }

    pub fn revision(&self) -> u64 {
        self.read_cache().revision
    }

    /// Digest of the index bytes the cache currently mirrors.
    pub fn last_digest(&self) -> Option<ContentHash> {
        self.read_cache().digest.clone()
    }

    // ── Writes ─────────────────────────────────────────────────────

    pub fn create(&self, draft: R::Draft) -> Result<R, StoreError> {
        self.create_checked(new_id(), draft, |_, _| Ok(()))
    }

    /// Create with a caller-chosen ID. Fails if the ID is taken.
    pub fn create_with_id(&self, id: impl Into<String>, draft: R::Draft) -> Result<R, StoreError> {
        self.create_checked(id.into(), draft, |_, _| Ok(()))
    }

    /// Create, letting `prepare` inspect the committed records and adjust
    /// the new one before validation. Runs under the write lock.
    pub fn create_checked<F>(&self, id: String, draft: R::Draft, prepare: F) -> Result<R, StoreError>
    where
        F: FnOnce(&[R], &mut R) -> Result<(), StoreError>,
    {
        let event = {
            let mut cache = self.write_cache();
            if cache.records.iter().any(|r| r.id() == id) {
                return Err(ValidationError::Invalid {
                    field: "id",
                    reason: format!("`{id}` already exists"),
                }
                .into());
            }

            let mut record = R::from_draft(id, Utc::now(), draft);
            prepare(&cache.records, &mut record)?;
            record.validate()?;

            cache.records.push(record.clone());
            if let Err(error) = self.persist(&mut cache) {
                cache.records.pop();
                warn!(parent: &self.span, id = record.id(), %error, "create rolled back");
                return Err(error);
            }
            debug!(parent: &self.span, id = record.id(), "record created");
            ChangeEvent::created(record, cache.revision)
        };

        self.notify(event.revision, std::slice::from_ref(&event));
        Ok(event.record)
    }

    /// Patch a record. Unset patch fields are left unchanged.
    pub fn update(&self, id: &str, patch: R::Patch) -> Result<R, StoreError> {
        self.update_checked(id, patch, |_, _| Ok(()))
    }

    /// Update, letting `check` veto the patched value against the other
    /// committed records. Runs under the write lock.
    pub fn update_checked<F>(&self, id: &str, patch: R::Patch, check: F) -> Result<R, StoreError>
    where
        F: FnOnce(&[R], &R) -> Result<(), StoreError>,
    {
        let event = {
            let mut cache = self.write_cache();
            let pos = position(&cache.records, id)
                .ok_or_else(|| StoreError::not_found(R::ENTITY, id))?;

            let previous = cache.records[pos].clone();
            let mut next = previous.clone();
            next.apply_patch(patch)?;
            check(&cache.records, &next)?;
            next.validate()?;
            next.touch(Utc::now());

            cache.records[pos] = next.clone();
            if let Err(error) = self.persist(&mut cache) {
                cache.records[pos] = previous;
                warn!(parent: &self.span, id, %error, "update rolled back");
                return Err(error);
            }
            debug!(parent: &self.span, id, "record updated");
            ChangeEvent::updated(previous, next, cache.revision)
        };

        self.notify(event.revision, std::slice::from_ref(&event));
        Ok(event.record)
    }

    /// Remove a record, returning its last value.
    pub fn delete(&self, id: &str) -> Result<R, StoreError> {
        let event = {
            let mut cache = self.write_cache();
            let pos = position(&cache.records, id)
                .ok_or_else(|| StoreError::not_found(R::ENTITY, id))?;

            let removed = cache.records.remove(pos);
            if let Err(error) = self.persist(&mut cache) {
                cache.records.insert(pos, removed);
                warn!(parent: &self.span, id, %error, "delete rolled back");
                return Err(error);
            }
            debug!(parent: &self.span, id, "record deleted");
            ChangeEvent::deleted(removed, cache.revision)
        };

        self.notify(event.revision, std::slice::from_ref(&event));
        Ok(event.record)
    }

    pub fn add_on_change_listener(&self, listener: ChangeListener<R>) {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).push(listener);
    }

    // ── Reconciliation ─────────────────────────────────────────────

    /// Fold records read from disk into the cache, emitting a synthesized
    /// event per difference.
    ///
    /// `generation_before` is the write generation observed before the disk
    /// read started. If a local persist happened since, the read may predate
    /// it and is discarded.
    pub fn absorb(&self, loaded: LoadedIndex<R>, generation_before: u64) -> Absorb {
        let (revision, events) = {
            let mut cache = self.write_cache();
            if self.write_generation() != generation_before {
                return Absorb::Stale;
            }

            let events = diff(&cache.records, &loaded.records, cache.revision + 1);
            cache.records = loaded.records;
            cache.digest = loaded.digest;
            if events.is_empty() {
                return Absorb::Unchanged;
            }
            cache.revision += 1;
            (cache.revision, events)
        };

        debug!(parent: &self.span, events = events.len(), "absorbed external changes");
        self.notify(revision, &events);
        Absorb::Applied(events.len())
    }

    // ── Internals ──────────────────────────────────────────────────

    fn persist(&self, cache: &mut RwLockWriteGuard<'_, Cache<R>>) -> Result<(), StoreError> {
        let digest = self.index.write(&cache.records)?;
        cache.digest = Some(digest);
        cache.revision += 1;
        self.write_generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Call every listener for the commit that produced `revision`, after
    /// the listeners of every earlier revision have returned.
    fn notify(&self, revision: u64, events: &[ChangeEvent<R>]) {
        let mut delivered = self.delivered.lock().unwrap_or_else(PoisonError::into_inner);
        while *delivered + 1 < revision {
            delivered = self.turn.wait(delivered).unwrap_or_else(PoisonError::into_inner);
        }
        drop(delivered);
        let _turn = Turn { store: self, revision };

        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner).clone();
        for event in events {
            for listener in &listeners {
                listener(event);
            }
        }
    }

    fn read_cache(&self) -> RwLockReadGuard<'_, Cache<R>> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, Cache<R>> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Passes the turn to the next revision, even if a listener panics.
struct Turn<'a, R: Record> {
    store: &'a DurableStore<R>,
    revision: u64,
}

impl<R: Record> Drop for Turn<'_, R> {
    fn drop(&mut self) {
        let mut delivered = self.store.delivered.lock().unwrap_or_else(PoisonError::into_inner);
        *delivered = (*delivered).max(self.revision);
        self.store.turn.notify_all();
    }
}

fn position<R: Record>(records: &[R], id: &str) -> Option<usize> {
    records.iter().position(|r| r.id() == id)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::fs;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    use tempfile::tempdir;
    use workloop_common::event::ChangeOperation;
    use workloop_common::types::{AgentRole, AgentRoleDraft, AgentRolePatch};

    use super::*;

    fn draft(name: &str) -> AgentRoleDraft {
        AgentRoleDraft { name: name.into(), prompt: format!("You are {name}.") }
    }

    fn recorded(store: &DurableStore<AgentRole>) -> Arc<Mutex<Vec<ChangeEvent<AgentRole>>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.add_on_change_listener(Arc::new(move |event: &ChangeEvent<AgentRole>| {
            sink.lock().unwrap().push(event.clone());
        }));
        seen
    }

    /// Make the next persist fail by putting a directory where the index goes.
    fn block_index(store: &DurableStore<AgentRole>) {
        let path = store.index().path().to_path_buf();
        let _ = fs::remove_file(&path);
        fs::create_dir_all(path.join("blocker")).unwrap();
    }

    // ── CRUD ───────────────────────────────────────────────────────

    #[test]
    fn create_assigns_id_and_timestamps() {
        let tmp = tempdir().unwrap();
        let store = DurableStore::<AgentRole>::open(tmp.path()).unwrap();

        let role = store.create(draft("planner")).expect("create should succeed");
        assert!(!role.id.is_empty());
        assert_eq!(role.created_at, role.updated_at);
        assert_eq!(store.get(&role.id), Some(role.clone()));
        assert_eq!(store.write_generation(), 1);
    }

    #[test]
    fn get_missing_returns_none() {
        let tmp = tempdir().unwrap();
        let store = DurableStore::<AgentRole>::open(tmp.path()).unwrap();
        assert!(store.get("nope").is_none());
    }

    #[test]
    fn reopen_yields_identical_list() {
        let tmp = tempdir().unwrap();
        let expected = {
            let store = DurableStore::<AgentRole>::open(tmp.path()).unwrap();
            let a = store.create(draft("a")).unwrap();
            let b = store.create(draft("b")).unwrap();
            store.create(draft("c")).unwrap();
            store
                .update(&a.id, AgentRolePatch { prompt: Some("new".into()), ..Default::default() })
                .unwrap();
            store.delete(&b.id).unwrap();
            store.list()
        };

        let reopened = DurableStore::<AgentRole>::open(tmp.path()).unwrap();
        assert_eq!(reopened.list(), expected);
    }

    #[test]
    fn concurrent_creates_keep_every_record() {
        let tmp = tempdir().unwrap();
        let store = Arc::new(DurableStore::<AgentRole>::open(tmp.path()).unwrap());

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || store.create(draft(&format!("role-{i}"))).unwrap())
            })
            .collect();
        let created: Vec<AgentRole> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let ids: HashSet<String> = created.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids.len(), 20);
        assert_eq!(store.list().len(), 20);

        let reopened = DurableStore::<AgentRole>::open(tmp.path()).unwrap();
        assert_eq!(reopened.list().len(), 20, "no write should be lost on disk");
    }

    #[test]
    fn single_field_update_leaves_other_fields() {
        let tmp = tempdir().unwrap();
        let store = DurableStore::<AgentRole>::open(tmp.path()).unwrap();
        let role = store.create(draft("old")).unwrap();

        let updated = store
            .update(&role.id, AgentRolePatch { name: Some("X".into()), ..Default::default() })
            .unwrap();
        assert_eq!(updated.name, "X");
        assert_eq!(updated.prompt, role.prompt);
        assert_eq!(updated.created_at, role.created_at);
        assert!(updated.updated_at >= role.updated_at);
    }

    #[test]
    fn create_with_empty_name_is_rejected() {
        let tmp = tempdir().unwrap();
        let store = DurableStore::<AgentRole>::open(tmp.path()).unwrap();
        let seen = recorded(&store);

        let err = store.create(draft("")).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert!(store.list().is_empty());
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(store.write_generation(), 0);
    }

    #[test]
    fn update_to_empty_name_is_rejected() {
        let tmp = tempdir().unwrap();
        let store = DurableStore::<AgentRole>::open(tmp.path()).unwrap();
        let role = store.create(draft("keep")).unwrap();

        let err = store
            .update(&role.id, AgentRolePatch { name: Some(String::new()), ..Default::default() })
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(store.get(&role.id), Some(role));
    }

    #[test]
    fn update_and_delete_missing_are_not_found() {
        let tmp = tempdir().unwrap();
        let store = DurableStore::<AgentRole>::open(tmp.path()).unwrap();
        assert!(store.update("ghost", AgentRolePatch::default()).unwrap_err().is_not_found());
        assert!(store.delete("ghost").unwrap_err().is_not_found());
    }

    #[test]
    fn duplicate_explicit_id_is_rejected() {
        let tmp = tempdir().unwrap();
        let store = DurableStore::<AgentRole>::open(tmp.path()).unwrap();
        store.create_with_id("fixed", draft("one")).unwrap();
        let err = store.create_with_id("fixed", draft("two")).unwrap_err();
        assert!(matches!(err, StoreError::Validation(ValidationError::Invalid { field: "id", .. })));
        assert_eq!(store.list().len(), 1);
    }

    // ── Rollback ───────────────────────────────────────────────────

    #[test]
    fn failed_persist_rolls_back_create_without_notifying() {
        let tmp = tempdir().unwrap();
        let store = DurableStore::<AgentRole>::open(tmp.path()).unwrap();
        let seen = recorded(&store);
        block_index(&store);

        let err = store.create(draft("doomed")).unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert!(store.list().is_empty());
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(store.write_generation(), 0);
    }

    #[test]
    fn failed_persist_restores_previous_value_on_update() {
        let tmp = tempdir().unwrap();
        let store = DurableStore::<AgentRole>::open(tmp.path()).unwrap();
        let role = store.create(draft("stable")).unwrap();
        block_index(&store);

        store
            .update(&role.id, AgentRolePatch { name: Some("changed".into()), ..Default::default() })
            .unwrap_err();
        assert_eq!(store.get(&role.id), Some(role));
    }

    #[test]
    fn failed_persist_reinserts_deleted_record_in_place() {
        let tmp = tempdir().unwrap();
        let store = DurableStore::<AgentRole>::open(tmp.path()).unwrap();
        store.create(draft("a")).unwrap();
        let b = store.create(draft("b")).unwrap();
        store.create(draft("c")).unwrap();
        let before = store.list();
        block_index(&store);

        store.delete(&b.id).unwrap_err();
        assert_eq!(store.list(), before);
    }

    // ── Listeners ──────────────────────────────────────────────────

    #[test]
    fn listeners_see_each_operation_with_increasing_revisions() {
        let tmp = tempdir().unwrap();
        let store = DurableStore::<AgentRole>::open(tmp.path()).unwrap();
        let seen = recorded(&store);

        let role = store.create(draft("a")).unwrap();
        store.update(&role.id, AgentRolePatch { name: Some("b".into()), ..Default::default() }).unwrap();
        store.delete(&role.id).unwrap();

        let seen = seen.lock().unwrap();
        let ops: Vec<ChangeOperation> = seen.iter().map(|e| e.operation).collect();
        assert_eq!(ops, vec![ChangeOperation::Create, ChangeOperation::Update, ChangeOperation::Delete]);
        assert_eq!(seen[1].previous.as_ref().map(|p| p.name.as_str()), Some("a"));
        let revisions: Vec<u64> = seen.iter().map(|e| e.revision).collect();
        assert_eq!(revisions, vec![1, 2, 3]);
    }

    #[test]
    fn listener_runs_outside_the_cache_lock() {
        let tmp = tempdir().unwrap();
        let store = Arc::new(DurableStore::<AgentRole>::open(tmp.path()).unwrap());
        let observed = Arc::new(AtomicUsize::new(0));

        let reader = store.clone();
        let count = observed.clone();
        store.add_on_change_listener(Arc::new(move |_event: &ChangeEvent<AgentRole>| {
            // Would deadlock if invoked under the write lock.
            count.store(reader.list().len(), Ordering::SeqCst);
        }));

        store.create(draft("a")).unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn slow_listener_keeps_commit_order_across_threads() {
        let tmp = tempdir().unwrap();
        let store = Arc::new(DurableStore::<AgentRole>::open(tmp.path()).unwrap());
        let role = store.create(draft("start")).unwrap();

        let stalled = Arc::new(AtomicBool::new(false));
        let first_call = stalled.clone();
        store.add_on_change_listener(Arc::new(move |_event: &ChangeEvent<AgentRole>| {
            if !first_call.swap(true, Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(200));
            }
        }));
        let seen = recorded(&store);

        let rename = |name: &'static str| {
            let store = store.clone();
            let id = role.id.clone();
            std::thread::spawn(move || {
                store.update(&id, AgentRolePatch { name: Some(name.into()), ..Default::default() }).unwrap();
            })
        };
        let first = rename("first");
        std::thread::sleep(Duration::from_millis(50));
        let second = rename("second");
        first.join().unwrap();
        second.join().unwrap();

        let seen = seen.lock().unwrap();
        let names: Vec<&str> = seen.iter().map(|e| e.record.name.as_str()).collect();
        let revisions: Vec<u64> = seen.iter().map(|e| e.revision).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(revisions, vec![2, 3]);
        assert_eq!(store.get(&role.id).unwrap().name, "second");
    }

    // ── Absorb ─────────────────────────────────────────────────────

    #[test]
    fn absorb_applies_external_records_and_emits_diff() {
        let tmp = tempdir().unwrap();
        let store = DurableStore::<AgentRole>::open(tmp.path()).unwrap();
        let kept = store.create(draft("kept")).unwrap();
        let seen = recorded(&store);

        let other = DurableStore::<AgentRole>::open(tmp.path()).unwrap();
        let added = other.create(draft("added")).unwrap();

        let generation = store.write_generation();
        let loaded = store.index().read::<AgentRole>().unwrap();
        assert_eq!(store.absorb(loaded, generation), Absorb::Applied(1));

        assert_eq!(store.list(), vec![kept, added.clone()]);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].operation, ChangeOperation::Create);
        assert_eq!(seen[0].record, added);
        assert_eq!(store.last_digest(), other.last_digest());
    }

    #[test]
    fn absorb_of_identical_state_is_unchanged() {
        let tmp = tempdir().unwrap();
        let store = DurableStore::<AgentRole>::open(tmp.path()).unwrap();
        store.create(draft("a")).unwrap();
        let seen = recorded(&store);

        let generation = store.write_generation();
        let loaded = store.index().read::<AgentRole>().unwrap();
        assert_eq!(store.absorb(loaded, generation), Absorb::Unchanged);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn absorb_discards_reads_that_raced_a_local_write() {
        let tmp = tempdir().unwrap();
        let store = DurableStore::<AgentRole>::open(tmp.path()).unwrap();

        let generation = store.write_generation();
        let stale = store.index().read::<AgentRole>().unwrap();
        let local = store.create(draft("local")).unwrap();

        assert_eq!(store.absorb(stale, generation), Absorb::Stale);
        assert_eq!(store.list(), vec![local]);
    }
}
