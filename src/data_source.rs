//! Data source core: owns the retained snapshot and serializes applies
//!
//! `apply` validates on the caller's thread and enqueues. A dedicated worker
//! thread dequeues in FIFO order, diffs against the retained snapshot, hands
//! the script to the adapter and only then publishes the new snapshot.
//! Readers always observe a whole snapshot, never a half-applied one.
use crate::config::DataSourceConfig;
use crate::diff_engine::DiffEngine;
use crate::errors::{DataSourceError, PresentationError, SnapshotError, SnapshotSide};
use crate::presentation::PresentationAdapter;
use crate::snapshot::{Item, ItemKind, Snapshot, SnapshotIndex};
use crate::types::{IndexPath, ItemId, SectionId};
use log::{debug, info, warn};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceState {
    Idle,
    Applying,
}

type SelectionPredicate = Box<dyn Fn(&Item) -> bool + Send + Sync>;

/// A validated snapshot with its lookups.
struct Retained {
    snapshot: Arc<Snapshot>,
    index: SnapshotIndex,
}

struct Job {
    snapshot: Arc<Snapshot>,
    index: SnapshotIndex,
    animated: bool,
}

struct Queue {
    pending: usize,
    applying: bool,
    stopped: bool,
    latest: Arc<Snapshot>,
}

struct Shared {
    retained: RwLock<Arc<Retained>>,
    queue: Mutex<Queue>,
    idle: Condvar,
}

impl Shared {
    fn wait_idle(&self) -> Result<(), DataSourceError> {
        let mut queue = lock(&self.queue);
        while queue.pending > 0 {
            if queue.stopped {
                return Err(DataSourceError::WorkerStopped);
            }
            queue = self.idle.wait(queue).unwrap_or_else(PoisonError::into_inner);
        }
        Ok(())
    }
}

/// Marks the queue stopped and wakes waiters however the worker exits.
struct WorkerExit<'a>(&'a Shared);

impl Drop for WorkerExit<'_> {
    fn drop(&mut self) {
        let mut queue = lock(&self.0.queue);
        queue.stopped = true;
        queue.applying = false;
        self.0.idle.notify_all();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct DataSource {
    shared: Arc<Shared>,
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
    selectable: SelectionPredicate,
}

impl DataSource {
    pub fn new<A>(adapter: A) -> Result<Self, DataSourceError>
    where
        A: PresentationAdapter + 'static,
    {
        Self::with_config(adapter, DataSourceConfig::default())
    }

    pub fn with_config<A>(adapter: A, config: DataSourceConfig) -> Result<Self, DataSourceError>
    where
        A: PresentationAdapter + 'static,
    {
        let empty = Arc::new(Snapshot::default());
        let shared = Arc::new(Shared {
            retained: RwLock::new(Arc::new(Retained {
                snapshot: Arc::clone(&empty),
                index: SnapshotIndex::default(),
            })),
            queue: Mutex::new(Queue {
                pending: 0,
                applying: false,
                stopped: false,
                latest: empty,
            }),
            idle: Condvar::new(),
        });

        let (sender, receiver) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(config.worker_name.clone())
            .spawn(move || run_worker(worker_shared, receiver, adapter, config))?;
        let worker_id = worker.thread().id();

        Ok(DataSource {
            shared,
            sender: Some(sender),
            worker: Some(worker),
            worker_id,
            selectable: Box::new(|item: &Item| item.kind() != ItemKind::Header),
        })
    }

    /// Replaces the default "headers are not selectable" rule.
    pub fn with_selection_predicate(mut self, predicate: impl Fn(&Item) -> bool + Send + Sync + 'static) -> Self {
        self.selectable = Box::new(predicate);
        self
    }

    /// Validates and enqueues `snapshot`. Returns once it is queued; the
    /// diff and presentation happen on the worker, strictly in submission
    /// order.
    pub fn apply(&self, snapshot: Snapshot, animated: bool) -> Result<(), DataSourceError> {
        self.ensure_not_worker()?;
        let mut queue = lock(&self.shared.queue);
        self.enqueue_locked(&mut queue, snapshot, animated)
    }

    /// Replaces the rows of one section of the most recently submitted
    /// snapshot, keeping every other section as it is, and enqueues the
    /// result.
    pub fn apply_section(
        &self,
        items: Vec<Item>,
        to_section: impl Into<SectionId>,
        animated: bool,
    ) -> Result<(), DataSourceError> {
        self.ensure_not_worker()?;
        let section_id = to_section.into();
        let mut queue = lock(&self.shared.queue);
        let current = queue
            .latest
            .item_identifiers_in_section(&section_id)
            .ok_or_else(|| SnapshotError::UnknownSection(section_id.clone()))?;
        let mut builder = queue.latest.to_builder()?;
        builder.delete_items(current)?.append_items(items, section_id)?;
        self.enqueue_locked(&mut queue, builder.build(), animated)
    }

    /// Deletes items from the most recently submitted snapshot and enqueues
    /// the result.
    pub fn delete_items<I, S>(&self, ids: I, animated: bool) -> Result<(), DataSourceError>
    where
        I: IntoIterator<Item = S>,
        S: Into<ItemId>,
    {
        self.ensure_not_worker()?;
        let mut queue = lock(&self.shared.queue);
        let mut builder = queue.latest.to_builder()?;
        builder.delete_items(ids)?;
        self.enqueue_locked(&mut queue, builder.build(), animated)
    }

    /// Reading `latest` and sending happen under one hold of the queue
    /// lock, so derived snapshots never start from a stale submission.
    fn enqueue_locked(&self, queue: &mut Queue, snapshot: Snapshot, animated: bool) -> Result<(), DataSourceError> {
        let index = snapshot
            .validate()
            .map_err(|e| SnapshotError::invalid(SnapshotSide::New, e))?;
        let snapshot = Arc::new(snapshot);
        let sender = self.sender.as_ref().ok_or(DataSourceError::WorkerStopped)?;
        sender
            .send(Job {
                snapshot: Arc::clone(&snapshot),
                index,
                animated,
            })
            .map_err(|_| DataSourceError::WorkerStopped)?;
        queue.pending += 1;
        queue.latest = snapshot;
        debug!("DataSource: enqueued apply, pending={} animated={}", queue.pending, animated);
        Ok(())
    }

    pub fn current_snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.retained().snapshot)
    }

    pub fn identifier_at(&self, path: IndexPath) -> Option<ItemId> {
        self.retained().snapshot.item_at(path).map(|item| item.id().clone())
    }

    pub fn position_of(&self, id: &ItemId) -> Option<IndexPath> {
        self.retained().index.position_of(id)
    }

    pub fn section_identifier_at(&self, index: usize) -> Option<SectionId> {
        self.retained().index.section_at(index).cloned()
    }

    pub fn index_of_section(&self, id: &SectionId) -> Option<usize> {
        self.retained().index.section_index(id)
    }

    /// Unknown identifiers are never selectable.
    pub fn is_selectable(&self, id: &ItemId) -> bool {
        let retained = self.retained();
        retained
            .index
            .position_of(id)
            .and_then(|path| retained.snapshot.item_at(path))
            .is_some_and(|item| (self.selectable)(item))
    }

    pub fn state(&self) -> DataSourceState {
        if lock(&self.shared.queue).applying {
            DataSourceState::Applying
        } else {
            DataSourceState::Idle
        }
    }

    /// Applies that are queued or running.
    pub fn pending(&self) -> usize {
        lock(&self.shared.queue).pending
    }

    /// Blocks until every apply submitted so far has run.
    pub fn wait_until_idle(&self) -> Result<(), DataSourceError> {
        self.ensure_not_worker()?;
        self.shared.wait_idle()
    }

    fn retained(&self) -> Arc<Retained> {
        Arc::clone(&self.shared.retained.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn ensure_not_worker(&self) -> Result<(), DataSourceError> {
        if thread::current().id() == self.worker_id {
            return Err(DataSourceError::Reentrant);
        }
        Ok(())
    }
}

impl Drop for DataSource {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued and exit.
        self.sender.take();
        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("DataSource: apply worker panicked");
            }
        }
    }
}

fn run_worker<A: PresentationAdapter>(
    shared: Arc<Shared>,
    receiver: Receiver<Job>,
    mut adapter: A,
    config: DataSourceConfig,
) {
    info!("DataSource: apply worker '{}' started", config.worker_name);
    let _exit = WorkerExit(&*shared);
    for job in receiver {
        lock(&shared.queue).applying = true;

        let current = Arc::clone(&shared.retained.read().unwrap_or_else(PoisonError::into_inner));
        let script = DiffEngine::new(&current.snapshot, &current.index, &job.snapshot, &job.index).reconcile();
        if config.log_edit_scripts {
            debug!("DataSource: edit script {:?}", script);
        }

        let presented = panic::catch_unwind(AssertUnwindSafe(|| {
            adapter.present_edit_script(&script, job.animated)
        }))
        .unwrap_or_else(|_| Err(PresentationError::new("adapter panicked")));

        match presented {
            Ok(()) => {
                let retained = Arc::new(Retained {
                    snapshot: job.snapshot,
                    index: job.index,
                });
                *shared.retained.write().unwrap_or_else(PoisonError::into_inner) = retained;
            }
            Err(e) => warn!("DataSource: {}; keeping previous snapshot", e),
        }

        let mut queue = lock(&shared.queue);
        queue.applying = false;
        queue.pending = queue.pending.saturating_sub(1);
        if queue.pending == 0 {
            shared.idle.notify_all();
        }
    }
    info!("DataSource: apply worker '{}' stopped", config.worker_name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff_engine::diff;
    use crate::presentation::{Presented, RecordingAdapter};
    use crate::snapshot::Section;
    use crate::types::{Edit, EditScript};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::{Barrier, OnceLock, Weak};
    use std::time::{Duration, Instant};

    fn city(name: &str, population: u64) -> Item {
        Item::leaf(name, json!({ "name": name, "population": population }))
    }

    fn illinois(items: Vec<Item>) -> Snapshot {
        Snapshot::from_sections(vec![Section::new("Illinois").with_items(items)]).unwrap()
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Blocks every presentation until the test releases it.
    struct Gated {
        release: Receiver<()>,
        inner: RecordingAdapter,
    }

    impl PresentationAdapter for Gated {
        fn present_edit_script(&mut self, script: &EditScript, animated: bool) -> Result<(), PresentationError> {
            self.release
                .recv()
                .map_err(|_| PresentationError::new("gate closed"))?;
            self.inner.present_edit_script(script, animated)
        }
    }

    #[test]
    fn apply_publishes_snapshot_and_lookups() {
        let recorder = RecordingAdapter::new();
        let source = DataSource::new(recorder.clone()).unwrap();
        let snapshot = illinois(vec![city("Chicago", 2710000), city("Springfield", 115888)]);

        source.apply(snapshot.clone(), false).unwrap();
        source.wait_until_idle().unwrap();

        assert_eq!(*source.current_snapshot(), snapshot);
        assert_eq!(source.identifier_at(IndexPath::new(0, 1)), Some(ItemId::from("Springfield")));
        assert_eq!(source.identifier_at(IndexPath::new(0, 9)), None);
        assert_eq!(source.position_of(&"Chicago".into()), Some(IndexPath::new(0, 0)));
        assert_eq!(source.position_of(&"Peoria".into()), None);
        assert_eq!(source.section_identifier_at(0), Some(SectionId::from("Illinois")));
        assert_eq!(source.section_identifier_at(1), None);
        assert_eq!(recorder.len(), 1);
    }

    #[test]
    fn reapplying_same_snapshot_presents_empty_script() {
        let recorder = RecordingAdapter::new();
        let source = DataSource::new(recorder.clone()).unwrap();
        let snapshot = illinois(vec![city("Chicago", 2710000)]);
        source.apply(snapshot.clone(), true).unwrap();
        source.apply(snapshot, true).unwrap();
        source.wait_until_idle().unwrap();

        let presented = recorder.presented();
        assert_eq!(presented.len(), 2);
        assert!(presented[1].script.is_empty());
    }

    #[test]
    fn queued_applies_run_in_submission_order() {
        let recorder = RecordingAdapter::new();
        let (release, gate) = mpsc::channel();
        let source = DataSource::new(Gated {
            release: gate,
            inner: recorder.clone(),
        })
        .unwrap();

        let s1 = illinois(vec![city("Chicago", 2710000)]);
        let s2 = illinois(vec![city("Chicago", 2710000), city("Springfield", 115888)]);
        let s3 = illinois(vec![city("Springfield", 115888), city("Chicago", 2710000), city("Champaign", 87636)]);

        source.apply(s1.clone(), true).unwrap();
        wait_for(|| source.state() == DataSourceState::Applying);
        source.apply(s2.clone(), true).unwrap();
        source.apply(s3.clone(), false).unwrap();

        assert_eq!(source.pending(), 3);
        assert_eq!(source.current_snapshot().number_of_items(), 0);

        for _ in 0..3 {
            release.send(()).unwrap();
        }
        source.wait_until_idle().unwrap();

        assert_eq!(source.state(), DataSourceState::Idle);
        assert_eq!(*source.current_snapshot(), s3);
        assert_eq!(
            recorder.presented(),
            vec![
                Presented { script: diff(&Snapshot::default(), &s1).unwrap(), animated: true },
                Presented { script: diff(&s1, &s2).unwrap(), animated: true },
                Presented { script: diff(&s2, &s3).unwrap(), animated: false },
            ]
        );
    }

    #[test]
    fn invalid_snapshot_is_rejected_before_enqueue() {
        let source = DataSource::new(RecordingAdapter::new()).unwrap();
        let broken: Snapshot = serde_json::from_value(json!({
            "sections": [{ "id": "Illinois", "items": [
                { "kind": "leaf", "id": "Chicago" },
                { "kind": "leaf", "id": "Chicago" }
            ]}]
        }))
        .unwrap();
        let err = source.apply(broken, false).unwrap_err();
        assert!(matches!(
            err,
            DataSourceError::Snapshot(SnapshotError::InvalidSnapshot { which: SnapshotSide::New, .. })
        ));
        assert_eq!(source.pending(), 0);
    }

    #[test]
    fn adapter_failure_keeps_previous_snapshot() {
        let mut calls = 0;
        let adapter = move |_: &EditScript, _: bool| -> Result<(), PresentationError> {
            calls += 1;
            if calls == 1 {
                Err(PresentationError::new("render failed"))
            } else {
                Ok(())
            }
        };
        let source = DataSource::new(adapter).unwrap();
        let snapshot = illinois(vec![city("Chicago", 2710000)]);

        source.apply(snapshot.clone(), false).unwrap();
        source.wait_until_idle().unwrap();
        assert_eq!(source.current_snapshot().number_of_sections(), 0);

        source.apply(snapshot.clone(), false).unwrap();
        source.wait_until_idle().unwrap();
        assert_eq!(*source.current_snapshot(), snapshot);
    }

    #[test]
    fn adapter_panic_is_contained() {
        let adapter = |script: &EditScript, _: bool| -> Result<(), PresentationError> {
            if script.len() > 1 {
                panic!("render exploded");
            }
            Ok(())
        };
        let source = DataSource::new(adapter).unwrap();
        source.apply(illinois(vec![city("Chicago", 1)]), false).unwrap();
        source.wait_until_idle().unwrap();
        assert_eq!(source.current_snapshot().number_of_sections(), 0);

        source.apply(Snapshot::default(), false).unwrap();
        source.wait_until_idle().unwrap();
        assert_eq!(source.state(), DataSourceState::Idle);
    }

    #[test]
    fn headers_are_not_selectable_by_default() {
        let source = DataSource::new(RecordingAdapter::new()).unwrap();
        let snapshot = illinois(vec![Item::header_with_children(
            "Cities of Illinois",
            json!("Cities of Illinois"),
            vec![city("Chicago", 2710000)],
        )]);
        source.apply(snapshot, false).unwrap();
        source.wait_until_idle().unwrap();

        assert!(!source.is_selectable(&"Cities of Illinois".into()));
        assert!(source.is_selectable(&"Chicago".into()));
        assert!(!source.is_selectable(&"Peoria".into()));
        assert_eq!(source.position_of(&"Chicago".into()), Some(IndexPath::nested(0, 0, 0)));
    }

    #[test]
    fn custom_selection_predicate() {
        let source = DataSource::new(RecordingAdapter::new())
            .unwrap()
            .with_selection_predicate(|item| item.content()["population"].as_u64().unwrap_or(0) > 1_000_000);
        source
            .apply(illinois(vec![city("Chicago", 2710000), city("Springfield", 115888)]), false)
            .unwrap();
        source.wait_until_idle().unwrap();
        assert!(source.is_selectable(&"Chicago".into()));
        assert!(!source.is_selectable(&"Springfield".into()));
    }

    #[test]
    fn delete_items_edits_latest_submission() {
        let recorder = RecordingAdapter::new();
        let source = DataSource::new(recorder.clone()).unwrap();
        source
            .apply(illinois(vec![city("Chicago", 2710000), city("Springfield", 115888)]), false)
            .unwrap();
        source.delete_items(["Chicago"], true).unwrap();
        source.wait_until_idle().unwrap();

        assert_eq!(source.current_snapshot().item_identifiers(), vec![ItemId::from("Springfield")]);
        assert!(matches!(
            source.delete_items(["Chicago"], true),
            Err(DataSourceError::Snapshot(SnapshotError::UnknownItem(_)))
        ));
    }

    #[test]
    fn waiting_from_the_adapter_is_reentrant() {
        let handle: Arc<OnceLock<Weak<DataSource>>> = Arc::new(OnceLock::new());
        let (report, outcome) = mpsc::channel();
        let adapter_handle = Arc::clone(&handle);
        let adapter = move |_: &EditScript, _: bool| -> Result<(), PresentationError> {
            if let Some(source) = adapter_handle.get().and_then(Weak::upgrade) {
                let _ = report.send(matches!(source.wait_until_idle(), Err(DataSourceError::Reentrant)));
            }
            Ok(())
        };
        let source = Arc::new(DataSource::new(adapter).unwrap());
        let _ = handle.set(Arc::downgrade(&source));

        source.apply(Snapshot::default(), false).unwrap();
        assert!(outcome.recv_timeout(Duration::from_secs(5)).unwrap());
        source.wait_until_idle().unwrap();
    }

    #[test]
    fn named_worker_from_config() {
        let (report, names) = mpsc::channel();
        let adapter = move |_: &EditScript, _: bool| -> Result<(), PresentationError> {
            let _ = report.send(thread::current().name().map(str::to_string));
            Ok(())
        };
        let config = DataSourceConfig {
            worker_name: "cities-apply".to_string(),
            log_edit_scripts: true,
        };
        let source = DataSource::with_config(adapter, config).unwrap();
        source.apply(Snapshot::default(), false).unwrap();
        assert_eq!(
            names.recv_timeout(Duration::from_secs(5)).unwrap().as_deref(),
            Some("cities-apply")
        );
    }

    #[test]
    fn concurrent_deletes_keep_both_removals() {
        for _ in 0..100 {
            let source = DataSource::new(|_: &EditScript, _: bool| -> Result<(), PresentationError> { Ok(()) }).unwrap();
            source
                .apply(illinois(vec![city("Chicago", 2710000), city("Springfield", 115888), city("Peoria", 113150)]), false)
                .unwrap();
            let barrier = Barrier::new(2);
            thread::scope(|scope| {
                for name in ["Chicago", "Springfield"] {
                    let (source, barrier) = (&source, &barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        source.delete_items([name], false).unwrap();
                    });
                }
            });
            source.wait_until_idle().unwrap();
            assert_eq!(source.current_snapshot().item_identifiers(), vec![ItemId::from("Peoria")]);
        }
    }

    #[test]
    fn apply_section_replaces_only_that_section() {
        let recorder = RecordingAdapter::new();
        let source = DataSource::new(recorder.clone()).unwrap();
        let snapshot = Snapshot::from_sections(vec![
            Section::new("Illinois").with_items(vec![city("Chicago", 2710000), city("Springfield", 115888)]),
            Section::new("Missouri").with_items(vec![city("St. Louis", 319294)]),
        ])
        .unwrap();
        source.apply(snapshot, false).unwrap();

        let outline = vec![
            Item::header_with_children("Chicagoland", json!({ "title": "Chicagoland" }), vec![city("Chicago", 2710000)]),
            city("Springfield", 115888),
        ];
        source.apply_section(outline, "Illinois", true).unwrap();
        source.wait_until_idle().unwrap();

        let presented = recorder.presented();
        assert_eq!(presented.len(), 2);
        assert_eq!(
            presented[1].script,
            EditScript {
                sections: Vec::new(),
                items: vec![
                    Edit::Insert { at: IndexPath::new(0, 0), id: ItemId::from("Chicagoland") },
                    Edit::Move {
                        from: IndexPath::new(0, 0),
                        to: IndexPath::nested(0, 0, 0),
                        id: ItemId::from("Chicago"),
                    },
                ],
            }
        );
        let current = source.current_snapshot();
        assert_eq!(
            current.item_identifiers_in_section(&SectionId::from("Missouri")),
            Some(vec![ItemId::from("St. Louis")])
        );
        assert_eq!(source.position_of(&ItemId::from("Chicago")), Some(IndexPath::nested(0, 0, 0)));
        assert!(matches!(
            source.apply_section(Vec::new(), "Kansas", false),
            Err(DataSourceError::Snapshot(SnapshotError::UnknownSection(_)))
        ));
        assert!(matches!(
            source.apply_section(vec![city("St. Louis", 319294)], "Illinois", false),
            Err(DataSourceError::Snapshot(SnapshotError::DuplicateIdentifier { .. }))
        ));
    }

    #[test]
    fn worker_exit_wakes_waiters() {
        let shared = Arc::new(Shared {
            retained: RwLock::new(Arc::new(Retained {
                snapshot: Arc::new(Snapshot::default()),
                index: SnapshotIndex::default(),
            })),
            queue: Mutex::new(Queue {
                pending: 1,
                applying: true,
                stopped: false,
                latest: Arc::new(Snapshot::default()),
            }),
            idle: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || {
            let _exit = WorkerExit(&*worker_shared);
            thread::sleep(Duration::from_millis(50));
            panic!("diff failed");
        });

        assert!(matches!(shared.wait_idle(), Err(DataSourceError::WorkerStopped)));
        assert!(worker.join().is_err());
        assert!(!lock(&shared.queue).applying);
    }
}
