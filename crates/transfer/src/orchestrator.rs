//! Runs transfers with bounded concurrency.
//!
//! Descriptors are admitted in submission order while fewer than the
//! configured number are in flight; the rest wait in a FIFO queue. Every
//! submitted descriptor reaches exactly one terminal state, observable
//! through its [`TransferHandle`].

use crate::descriptor::{DownloadDescriptor, Direction, TransferDescriptor, TransferTicket, UploadDescriptor, Variant};
use crate::error::{ErrorKind, Result};
use crate::progress::{Progress, ProgressTracker};
use crate::relay::{ByteStream, FetchRequest, Relay};
use crate::state::TransferState;
use async_stream::stream;
use derive_more::Display;
use exn::ResultExt;
use futures::TryStreamExt;
use futures::future::join_all;
use mirage_policy::{CompressionPolicy, resolve};
use mirage_storage::error::ErrorKind as StorageErrorKind;
use mirage_storage::{Claim, Compactor, ContentCache, FileHash};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

pub const DEFAULT_PARALLEL: usize = 4;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("#{_0}")]
pub struct TransferId(u64);

/// Orchestrator-wide notifications, for status display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Admitted { id: TransferId, hash: FileHash, direction: Direction },
    Finished { id: TransferId, hash: FileHash, state: TransferState },
}

/// Caller's view of a submitted transfer.
pub struct TransferHandle {
    id: TransferId,
    descriptor: Arc<TransferDescriptor>,
    state: watch::Receiver<TransferState>,
    progress: watch::Receiver<Progress>,
}

impl TransferHandle {
    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn descriptor(&self) -> &TransferDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> TransferState {
        *self.state.borrow()
    }

    pub fn progress(&self) -> Progress {
        *self.progress.borrow()
    }

    /// Receiver notified on every state change.
    pub fn state_changes(&self) -> watch::Receiver<TransferState> {
        self.state.clone()
    }

    /// Receiver notified on every progress change.
    pub fn progress_changes(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    /// Wait for the terminal state.
    ///
    /// A transfer abandoned before finishing, e.g. by the runtime shutting
    /// down, reports [`Cancelled`](TransferState::Cancelled).
    pub async fn wait(&self) -> TransferState {
        let mut state = self.state.clone();
        if let Ok(terminal) = state.wait_for(TransferState::is_terminal).await {
            return *terminal;
        }
        let last = *state.borrow();
        match last.is_terminal() {
            true => last,
            false => TransferState::Cancelled,
        }
    }
}

struct Job {
    id: TransferId,
    descriptor: Arc<TransferDescriptor>,
    cancel: CancellationToken,
    state: watch::Sender<TransferState>,
    progress: ProgressTracker,
}

impl Job {
    fn transition(&self, next: TransferState) {
        let mut rejected = None;
        self.state.send_if_modified(|state| match state.advance(next) {
            Ok(()) => true,
            Err(e) => {
                rejected = Some(e);
                false
            },
        });
        if let Some(e) = rejected {
            tracing::debug!(id = %self.id, error = %e, "Ignoring state change");
        }
    }
}

#[derive(Default)]
struct Scheduler {
    queue: VecDeque<Job>,
    active: HashMap<TransferId, CancellationToken>,
    closed: bool,
}

struct Inner {
    cache: Arc<ContentCache>,
    relay: Arc<dyn Relay>,
    compactor: Option<Compactor>,
    parallel: usize,
    chunk_size: usize,
    scheduler: Mutex<Scheduler>,
    shutdown: CancellationToken,
    events: broadcast::Sender<TransferEvent>,
    next_id: AtomicU64,
}

pub struct OrchestratorBuilder {
    cache: Arc<ContentCache>,
    relay: Arc<dyn Relay>,
    compactor: Option<Compactor>,
    parallel: usize,
    chunk_size: usize,
}

impl OrchestratorBuilder {
    /// Maximum number of transfers in flight. Zero is treated as one.
    pub fn parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    /// Read size for uploads.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Compact completed downloads in the background.
    pub fn compactor(mut self, compactor: Compactor) -> Self {
        self.compactor = Some(compactor);
        self
    }

    pub fn build(self) -> Orchestrator {
        if self.parallel == 0 {
            tracing::warn!("Transfer limit of zero would never admit anything; using one");
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Orchestrator {
            inner: Arc::new(Inner {
                cache: self.cache,
                relay: self.relay,
                compactor: self.compactor,
                parallel: self.parallel.max(1),
                chunk_size: self.chunk_size.max(1),
                scheduler: Mutex::default(),
                shutdown: CancellationToken::new(),
                events,
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

/// Owns the pool of transfers. Cheap to clone; clones share the pool.
///
/// Must be used from within a Tokio runtime: admitted transfers run as
/// spawned tasks.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder(cache: Arc<ContentCache>, relay: Arc<dyn Relay>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            cache,
            relay,
            compactor: None,
            parallel: DEFAULT_PARALLEL,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.inner.cache
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    /// Number of transfers in flight.
    pub fn active(&self) -> usize {
        self.inner.lock().active.len()
    }

    /// Number of transfers waiting for a slot.
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Turn a batch of tickets into download descriptors.
    ///
    /// The variant is chosen once per hash; repeated tickets for a hash are
    /// dropped.
    pub async fn plan(
        &self,
        tickets: impl IntoIterator<Item = TransferTicket>,
        policy: CompressionPolicy,
    ) -> Result<Vec<DownloadDescriptor>> {
        let mut seen = HashSet::new();
        let mut planned = Vec::new();
        for ticket in tickets {
            if !seen.insert(ticket.hash) {
                continue;
            }
            let cached = self.inner.cache.has_source(&ticket.hash).await.or_raise(|| ErrorKind::Cache)?;
            let decision = resolve(ticket.hash, policy, cached);
            planned.push(DownloadDescriptor::from_ticket(ticket, decision));
        }
        Ok(planned)
    }

    pub fn submit(&self, descriptor: impl Into<TransferDescriptor>) -> TransferHandle {
        let descriptor = Arc::new(descriptor.into());
        let id = TransferId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = match &*descriptor {
            TransferDescriptor::Upload(upload) => upload.cancellation().clone(),
            TransferDescriptor::Download(_) => self.inner.shutdown.child_token(),
        };
        let (state, state_rx) = watch::channel(TransferState::Queued);
        let (progress, progress_rx) = ProgressTracker::new(descriptor.total());
        let handle = TransferHandle { id, descriptor: Arc::clone(&descriptor), state: state_rx, progress: progress_rx };
        let job = Job { id, descriptor, cancel: cancel.clone(), state, progress };
        let watched = handle.state_changes();

        let rejected = {
            let mut scheduler = self.inner.lock();
            match scheduler.closed {
                true => Some(job),
                false => {
                    scheduler.queue.push_back(job);
                    None
                },
            }
        };
        match rejected {
            Some(job) => self.inner.settle(&job, TransferState::Cancelled),
            None => {
                self.inner.watch_queued(id, cancel, watched);
                self.inner.pump();
            },
        }
        handle
    }

    /// Wait for every handle's terminal state, in the order given.
    pub async fn await_all(&self, handles: &[TransferHandle]) -> Vec<(TransferId, TransferState)> {
        join_all(handles.iter().map(|handle| async move { (handle.id, handle.wait().await) })).await
    }

    /// Cancel one transfer. Returns `false` if it already finished.
    pub fn cancel(&self, id: TransferId) -> bool {
        if let Some(token) = self.inner.lock().active.get(&id) {
            token.cancel();
            return true;
        }
        self.inner.cancel_queued(id)
    }

    /// Cancel everything: in-flight transfers stop, queued ones are cancelled
    /// without starting, and later submissions are cancelled immediately.
    pub fn cancel_all(&self) {
        // Close admission before waking running tasks, so a slot they free
        // can't be handed to a queued job.
        let drained: Vec<Job> = {
            let mut scheduler = self.inner.lock();
            scheduler.closed = true;
            scheduler.queue.drain(..).collect()
        };
        self.inner.shutdown.cancel();
        tracing::info!(queued = drained.len(), "Cancelling all transfers");
        for job in drained {
            self.inner.settle(&job, TransferState::Cancelled);
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Scheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Finish a job that never ran.
    fn settle(&self, job: &Job, state: TransferState) {
        job.transition(state);
        self.finished(job);
    }

    fn finished(&self, job: &Job) {
        let state = *job.state.borrow();
        _ = self.events.send(TransferEvent::Finished { id: job.id, hash: *job.descriptor.hash(), state });
    }

    /// Remove a job still waiting for a slot and mark it cancelled.
    fn cancel_queued(&self, id: TransferId) -> bool {
        let queued = {
            let mut scheduler = self.lock();
            let position = scheduler.queue.iter().position(|job| job.id == id);
            position.and_then(|position| scheduler.queue.remove(position))
        };
        match queued {
            Some(job) => {
                self.settle(&job, TransferState::Cancelled);
                true
            },
            None => false,
        }
    }

    /// Settle a queued job as soon as its token fires, without waiting for
    /// it to reach the head of the queue.
    fn watch_queued(
        self: &Arc<Self>,
        id: TransferId,
        cancel: CancellationToken,
        mut state: watch::Receiver<TransferState>,
    ) {
        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            let left_queue = async move {
                _ = state.wait_for(|state| *state != TransferState::Queued).await;
            };
            tokio::select! {
                () = cancel.cancelled() => {},
                () = left_queue => return,
            }
            if let Some(inner) = inner.upgrade() {
                inner.cancel_queued(id);
            }
        });
    }

    /// Admit queued jobs while there's room.
    fn pump(self: &Arc<Self>) {
        let mut admitted = Vec::new();
        let mut settled = Vec::new();
        {
            let mut scheduler = self.lock();
            if scheduler.closed || self.shutdown.is_cancelled() {
                settled.extend(scheduler.queue.drain(..).map(|job| (job, TransferState::Cancelled)));
            }
            while scheduler.active.len() < self.parallel {
                let Some(job) = scheduler.queue.pop_front() else {
                    break;
                };
                if job.cancel.is_cancelled() {
                    settled.push((job, TransferState::Cancelled));
                    continue;
                }
                if let Some(reason) = job.descriptor.skip_reason() {
                    settled.push((job, TransferState::Skipped(reason)));
                    continue;
                }
                scheduler.active.insert(job.id, job.cancel.clone());
                job.transition(TransferState::InProgress);
                admitted.push(job);
            }
        }

        for (job, state) in settled {
            tracing::debug!(id = %job.id, hash = %job.descriptor.hash(), %state, "Not admitted");
            self.settle(&job, state);
        }
        for job in admitted {
            _ = self.events.send(TransferEvent::Admitted {
                id: job.id,
                hash: *job.descriptor.hash(),
                direction: job.descriptor.direction(),
            });
            tokio::spawn(Arc::clone(self).run(job));
        }
    }

    #[instrument(skip_all, fields(id = %job.id, hash = %job.descriptor.hash(), direction = %job.descriptor.direction()))]
    async fn run(self: Arc<Self>, job: Job) {
        let outcome = tokio::select! {
            biased;
            () = job.cancel.cancelled() => Err(exn::Exn::from(ErrorKind::Cancelled)),
            () = self.shutdown.cancelled() => Err(exn::Exn::from(ErrorKind::Cancelled)),
            result = self.execute(&job) => result,
        };
        let terminal = match &outcome {
            Ok(()) => TransferState::Completed,
            Err(err) => {
                let state = TransferState::from(&**err);
                match state {
                    TransferState::Cancelled => tracing::debug!("Transfer cancelled"),
                    _ => tracing::warn!(error = ?err, "Transfer failed"),
                }
                state
            },
        };

        {
            let mut scheduler = self.lock();
            scheduler.active.remove(&job.id);
            job.transition(terminal);
        }
        self.finished(&job);
        self.pump();
    }

    async fn execute(&self, job: &Job) -> Result<()> {
        match &*job.descriptor {
            TransferDescriptor::Download(download) => self.download(download, &job.progress).await,
            TransferDescriptor::Upload(upload) => self.upload(upload, &job.progress).await,
        }
    }

    async fn download(&self, download: &DownloadDescriptor, progress: &ProgressTracker) -> Result<()> {
        let claim = match self.cache.claim(&download.expected).await.or_raise(|| ErrorKind::Cache)? {
            Claim::Present(_) => {
                tracing::debug!("Already cached");
                progress.complete();
                return self.record_alternate(download).await;
            },
            Claim::Vacant(claim) => claim,
        };
        let mut staged = claim.stage().or_raise(|| ErrorKind::Cache)?;

        let mut stream = self.relay.fetch(&FetchRequest::from(download)).await?;
        while let Some(chunk) = stream.try_next().await? {
            progress.advance(chunk.len() as u64)?;
            staged.write(&chunk).await.or_raise(|| ErrorKind::Cache)?;
        }
        let received = staged.written();
        if received < download.size {
            exn::bail!(ErrorKind::Truncated { received, advertised: download.size });
        }
        staged.commit().await.map_err(|err| {
            let kind = match &*err {
                StorageErrorKind::IntegrityMismatch { expected, actual } => {
                    ErrorKind::IntegrityMismatch { expected: *expected, actual: *actual }
                },
                _ => ErrorKind::Cache,
            };
            err.raise(kind)
        })?;

        self.record_alternate(download).await?;
        if let Some(compactor) = &self.compactor {
            compactor.schedule(download.expected);
        }
        Ok(())
    }

    async fn record_alternate(&self, download: &DownloadDescriptor) -> Result<()> {
        if download.variant == Variant::Alternate {
            self.cache.link_alternate(&download.hash, &download.expected).await.or_raise(|| ErrorKind::Cache)?;
        }
        Ok(())
    }

    async fn upload(&self, upload: &UploadDescriptor, progress: &ProgressTracker) -> Result<()> {
        let path = upload.path().to_path_buf();
        let metadata = fs::metadata(&path).await.or_raise(|| ErrorKind::LocalFile(path.clone()))?;
        let total = metadata.len();
        upload.set_total(total);
        progress.set_total(total);

        let data = read_chunks(path, self.chunk_size, progress.clone());
        self.relay.push(&upload.hash, upload.variant, data).await?;
        let sent = progress.current().transferred;
        if sent < total {
            exn::bail!(ErrorKind::Truncated { received: sent, advertised: total });
        }
        Ok(())
    }
}

/// Stream a local file in chunks, counting each chunk as sent when the relay
/// takes it.
fn read_chunks(path: PathBuf, chunk_size: usize, progress: ProgressTracker) -> ByteStream {
    Box::pin(stream! {
        let mut file = match fs::File::open(&path).await.or_raise(|| ErrorKind::LocalFile(path.clone())) {
            Ok(file) => file,
            Err(e) => {
                yield Err(e);
                return;
            },
        };
        let mut buffer = vec![0; chunk_size];
        loop {
            let read = match file.read(&mut buffer).await.or_raise(|| ErrorKind::LocalFile(path.clone())) {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) => {
                    yield Err(e);
                    break;
                },
            };
            // The file grew since it was measured.
            if let Err(e) = progress.advance(read as u64) {
                yield Err(e);
                break;
            }
            yield Ok(buffer[..read].to_vec());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureClass;
    use crate::relay::MockRelay;
    use crate::state::SkipReason;
    use mirage_compress::Compression;
    use mirage_storage::{Compaction, Located, SkipReason as CompactSkip};

    struct Fixture {
        _dir: tempfile::TempDir,
        cache: Arc<ContentCache>,
        relay: Arc<MockRelay>,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let cache = Arc::new(ContentCache::open(dir.path()).await.unwrap());
            Self { _dir: dir, cache, relay: Arc::new(MockRelay::default().with_chunk_size(1024)) }
        }

        fn orchestrator(&self, parallel: usize) -> Orchestrator {
            Orchestrator::builder(Arc::clone(&self.cache), self.relay.clone()).parallel(parallel).build()
        }
    }

    fn texture(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add((i / 32) as u8)).collect()
    }

    fn download(hash: FileHash, size: usize) -> DownloadDescriptor {
        DownloadDescriptor::from_ticket(
            TransferTicket::available(hash, size as u64),
            mirage_policy::Decision::FetchSource,
        )
    }

    async fn wait_until(handle: &TransferHandle, state: TransferState) {
        let mut changes = handle.state_changes();
        changes.wait_for(|current| *current == state).await.unwrap();
    }

    #[tokio::test]
    async fn test_download_completes_into_cache() {
        let fixture = Fixture::new().await;
        let data = texture(1, 10_000);
        let hash = fixture.relay.serve(data.clone()).await;
        let orchestrator = fixture.orchestrator(2);

        let handle = orchestrator.submit(download(hash, data.len()));
        assert_eq!(handle.wait().await, TransferState::Completed);
        assert_eq!(handle.progress().transferred, data.len() as u64);
        assert_eq!(fixture.cache.read(&hash).await.unwrap(), data);
        assert_eq!(orchestrator.active(), 0);
    }

    #[tokio::test]
    async fn test_limit_queues_in_submission_order() {
        let fixture = Fixture::new().await;
        let mut gates = Vec::new();
        let mut handles = Vec::new();
        let orchestrator = fixture.orchestrator(2);
        for seed in 0..3 {
            let data = texture(seed, 2048);
            let (hash, gate) = fixture.relay.serve_gated(data.clone()).await;
            gates.push(gate);
            handles.push(orchestrator.submit(download(hash, data.len())));
        }

        assert_eq!(handles[0].state(), TransferState::InProgress);
        assert_eq!(handles[1].state(), TransferState::InProgress);
        assert_eq!(handles[2].state(), TransferState::Queued);
        assert_eq!((orchestrator.active(), orchestrator.queued()), (2, 1));

        gates[1].open();
        assert_eq!(handles[1].wait().await, TransferState::Completed);
        wait_until(&handles[2], TransferState::InProgress).await;
        assert_eq!(handles[0].state(), TransferState::InProgress);

        gates[0].open();
        gates[2].open();
        let states = orchestrator.await_all(&handles).await;
        assert!(states.iter().all(|(_, state)| *state == TransferState::Completed));
        assert_eq!(states.iter().map(|(id, _)| *id).collect::<Vec<_>>(), handles.iter().map(|h| h.id()).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_cancel_all_cancels_running_and_queued() {
        let fixture = Fixture::new().await;
        let orchestrator = fixture.orchestrator(1);
        let mut events = orchestrator.subscribe();
        let running_data = texture(1, 4096);
        let (running_hash, _gate) = fixture.relay.serve_gated(running_data.clone()).await;
        let queued_data = texture(2, 4096);
        let queued_hash = fixture.relay.serve(queued_data.clone()).await;

        let running = orchestrator.submit(download(running_hash, running_data.len()));
        let queued = orchestrator.submit(download(queued_hash, queued_data.len()));
        assert_eq!(running.state(), TransferState::InProgress);
        assert_eq!(queued.state(), TransferState::Queued);

        orchestrator.cancel_all();
        assert_eq!(queued.state(), TransferState::Cancelled);
        assert_eq!(running.wait().await, TransferState::Cancelled);
        assert!(!fixture.cache.exists(&running_hash).await.unwrap());
        assert!(!fixture.cache.exists(&queued_hash).await.unwrap());

        let late = orchestrator.submit(download(queued_hash, queued_data.len()));
        assert_eq!(late.state(), TransferState::Cancelled);

        let mut admitted = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TransferEvent::Admitted { id, .. } = event {
                admitted.push(id);
            }
        }
        assert_eq!(admitted, vec![running.id()], "queued transfer must never start");
    }

    #[tokio::test]
    async fn test_cancel_single() {
        let fixture = Fixture::new().await;
        let orchestrator = fixture.orchestrator(1);
        let (first_hash, first_gate) = fixture.relay.serve_gated(texture(1, 100)).await;
        let second_hash = fixture.relay.serve(texture(2, 100)).await;
        let first = orchestrator.submit(download(first_hash, 100));
        let second = orchestrator.submit(download(second_hash, 100));

        assert!(orchestrator.cancel(second.id()));
        assert_eq!(second.state(), TransferState::Cancelled);
        assert!(orchestrator.cancel(first.id()));
        assert_eq!(first.wait().await, TransferState::Cancelled);
        assert!(!orchestrator.cancel(first.id()));
        drop(first_gate);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_all_never_admits_queued_under_contention() {
        for round in 0..100u8 {
            let fixture = Fixture::new().await;
            let orchestrator = fixture.orchestrator(1);
            let mut events = orchestrator.subscribe();
            let (running_hash, _gate) = fixture.relay.serve_gated(texture(round, 512)).await;
            let queued_hash = fixture.relay.serve(texture(round.wrapping_add(1), 600)).await;
            let running = orchestrator.submit(download(running_hash, 512));
            let queued = orchestrator.submit(download(queued_hash, 600));

            orchestrator.cancel_all();
            assert_eq!(running.wait().await, TransferState::Cancelled);
            assert_eq!(queued.wait().await, TransferState::Cancelled);
            while let Ok(event) = events.try_recv() {
                if let TransferEvent::Admitted { id, .. } = event {
                    assert_ne!(id, queued.id(), "round {round}: queued transfer started after cancel_all");
                }
            }
        }
    }

    #[tokio::test]
    async fn test_cancelling_parent_settles_queued_upload() {
        let fixture = Fixture::new().await;
        let orchestrator = fixture.orchestrator(1);
        let (hash, _gate) = fixture.relay.serve_gated(texture(1, 100)).await;
        let running = orchestrator.submit(download(hash, 100));

        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"outfit").unwrap();
        let parent = CancellationToken::new();
        let upload = orchestrator.submit(UploadDescriptor::new(
            FileHash::digest(b"outfit"),
            Variant::Source,
            file.path(),
            &parent,
        ));
        assert_eq!(upload.state(), TransferState::Queued);

        parent.cancel();
        let state = tokio::time::timeout(std::time::Duration::from_secs(5), upload.wait()).await.unwrap();
        assert_eq!(state, TransferState::Cancelled);
        assert_eq!(orchestrator.queued(), 0);
        assert_eq!(running.state(), TransferState::InProgress);
        assert!(fixture.relay.pushed(&FileHash::digest(b"outfit")).await.is_none());
    }

    #[test]
    fn test_abandoned_transfer_reports_cancelled() {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let (fixture, orchestrator, handle, gate) = runtime.block_on(async {
            let fixture = Fixture::new().await;
            let orchestrator = fixture.orchestrator(1);
            let (hash, gate) = fixture.relay.serve_gated(texture(1, 100)).await;
            let handle = orchestrator.submit(download(hash, 100));
            (fixture, orchestrator, handle, gate)
        });
        assert_eq!(handle.state(), TransferState::InProgress);

        // Dropping the runtime drops the running task along with its state.
        drop(runtime);
        assert_eq!(futures::executor::block_on(handle.wait()), TransferState::Cancelled);
        drop((fixture, orchestrator, gate));
    }

    #[rstest::rstest]
    #[case(false, false, 100, SkipReason::NotOnServer)]
    #[case(true, true, 100, SkipReason::Forbidden)]
    #[case(true, false, 0, SkipReason::Empty)]
    #[tokio::test]
    async fn test_ineligible_download_is_skipped(
        #[case] exists: bool,
        #[case] forbidden: bool,
        #[case] size: u64,
        #[case] reason: SkipReason,
    ) {
        let fixture = Fixture::new().await;
        let orchestrator = fixture.orchestrator(1);
        let hash = fixture.relay.serve(texture(1, 100)).await;
        let ticket = TransferTicket { exists, forbidden, size, ..TransferTicket::available(hash, 100) };
        let handle = orchestrator.submit(DownloadDescriptor::from_ticket(ticket, mirage_policy::Decision::FetchSource));
        assert_eq!(handle.wait().await, TransferState::Skipped(reason));
        assert_eq!(fixture.relay.fetch_count(), 0);
        assert_eq!(orchestrator.active(), 0);
    }

    #[tokio::test]
    async fn test_skipped_does_not_use_a_slot() {
        let fixture = Fixture::new().await;
        let orchestrator = fixture.orchestrator(1);
        let (hash, gate) = fixture.relay.serve_gated(texture(1, 100)).await;
        let running = orchestrator.submit(download(hash, 100));
        let missing = TransferTicket { exists: false, ..TransferTicket::available(FileHash::digest(b"gone"), 5) };
        let skipped = orchestrator.submit(DownloadDescriptor::from_ticket(missing, mirage_policy::Decision::FetchSource));
        let other_hash = fixture.relay.serve(texture(2, 100)).await;
        let other = orchestrator.submit(download(other_hash, 100));

        gate.open();
        assert_eq!(running.wait().await, TransferState::Completed);
        assert_eq!(skipped.wait().await, TransferState::Skipped(SkipReason::NotOnServer));
        assert_eq!(other.wait().await, TransferState::Completed);
    }

    #[tokio::test]
    async fn test_integrity_mismatch_fails() {
        let fixture = Fixture::new().await;
        let promised = FileHash::digest(b"what the ticket says");
        let delivered = texture(9, 3000);
        fixture.relay.serve_as(promised, delivered.clone()).await;
        let orchestrator = fixture.orchestrator(1);

        let handle = orchestrator.submit(download(promised, delivered.len()));
        assert_eq!(handle.wait().await, TransferState::Failed(FailureClass::IntegrityMismatch));
        assert!(!fixture.cache.exists(&promised).await.unwrap());
    }

    #[tokio::test]
    async fn test_network_failures() {
        let fixture = Fixture::new().await;
        let orchestrator = fixture.orchestrator(4);
        let data = texture(3, 5000);
        let reset = fixture.relay.serve_failing(data.clone(), 2).await;
        let oversized = fixture.relay.serve(texture(4, 5000)).await;
        let truncated = fixture.relay.serve(texture(5, 5000)).await;
        let missing = FileHash::digest(b"not on relay");

        let handles = [
            orchestrator.submit(download(reset, data.len())),
            orchestrator.submit(download(oversized, 4000)),
            orchestrator.submit(download(truncated, 6000)),
            orchestrator.submit(download(missing, 10)),
        ];
        let states: Vec<_> = orchestrator.await_all(&handles).await.into_iter().map(|(_, state)| state).collect();
        assert_eq!(
            states,
            vec![
                TransferState::Failed(FailureClass::Network),
                TransferState::Failed(FailureClass::Network),
                TransferState::Failed(FailureClass::Network),
                TransferState::Failed(FailureClass::NotFoundOnServer),
            ]
        );
        assert!(handles[1].progress().transferred <= 4000);
        for hash in [reset, oversized, truncated] {
            assert!(!fixture.cache.exists(&hash).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_duplicate_downloads_fetch_once() {
        let fixture = Fixture::new().await;
        let orchestrator = fixture.orchestrator(2);
        let data = texture(6, 8192);
        let (hash, gate) = fixture.relay.serve_gated(data.clone()).await;
        let first = orchestrator.submit(download(hash, data.len()));
        let second = orchestrator.submit(download(hash, data.len()));

        gate.open();
        assert_eq!(first.wait().await, TransferState::Completed);
        assert_eq!(second.wait().await, TransferState::Completed);
        assert_eq!(fixture.relay.fetch_count(), 1);
        assert_eq!(second.progress().transferred, data.len() as u64);
    }

    #[tokio::test]
    async fn test_already_cached_completes_without_fetch() {
        let fixture = Fixture::new().await;
        let data = texture(7, 1000);
        let hash = FileHash::digest(&data);
        fixture.cache.write(&hash, &data).await.unwrap();
        let orchestrator = fixture.orchestrator(1);

        let handle = orchestrator.submit(download(hash, data.len()));
        assert_eq!(handle.wait().await, TransferState::Completed);
        assert_eq!(fixture.relay.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_plan_and_alternates() {
        let fixture = Fixture::new().await;
        let orchestrator = fixture.orchestrator(2);
        let source = texture(8, 4000);
        let source_hash = FileHash::digest(&source);
        let alternate = texture(9, 1000);
        let alternate_hash = fixture.relay.serve(alternate.clone()).await;
        let ticket = TransferTicket::available(source_hash, source.len() as u64)
            .with_alternate(alternate_hash, alternate.len() as u64);

        let plan = orchestrator
            .plan([ticket.clone(), ticket.clone()], CompressionPolicy::CompressedNewDownloads)
            .await
            .unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].variant, Variant::Alternate);

        let handle = orchestrator.submit(plan[0].clone());
        assert_eq!(handle.wait().await, TransferState::Completed);
        assert_eq!(fixture.cache.locate(&source_hash).await.unwrap(), Located::Alternate(alternate_hash));

        fixture.cache.write(&source_hash, &source).await.unwrap();
        let plan = orchestrator.plan([ticket], CompressionPolicy::CompressedNewDownloads).await.unwrap();
        assert_eq!(plan[0].variant, Variant::Source);
    }

    #[tokio::test]
    async fn test_completed_download_is_compacted() {
        let fixture = Fixture::new().await;
        let compactor = Compactor::new(Arc::clone(&fixture.cache), Compression::Gzip).with_min_size(0);
        let orchestrator = Orchestrator::builder(Arc::clone(&fixture.cache), fixture.relay.clone())
            .compactor(compactor.clone())
            .build();
        let data = vec![0u8; 64 * 1024];
        let hash = fixture.relay.serve(data.clone()).await;

        assert_eq!(orchestrator.submit(download(hash, data.len())).wait().await, TransferState::Completed);
        // Serializes behind the scheduled compaction.
        let compaction = compactor.compact(&hash).await.unwrap();
        assert!(matches!(
            compaction,
            Compaction::Compacted { .. } | Compaction::Skipped(CompactSkip::AlreadyCompacted)
        ));
        assert!(fixture.cache.stat(&hash).await.unwrap().is_compacted());
        assert_eq!(fixture.cache.read(&hash).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_upload() {
        let fixture = Fixture::new().await;
        let orchestrator = Orchestrator::builder(Arc::clone(&fixture.cache), fixture.relay.clone())
            .chunk_size(1000)
            .build();
        let data = texture(10, 3500);
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), &data).unwrap();
        let hash = FileHash::digest(&data);

        let upload = UploadDescriptor::new(hash, Variant::Source, file.path(), &CancellationToken::new());
        let handle = orchestrator.submit(upload);
        assert_eq!(handle.wait().await, TransferState::Completed);
        assert_eq!(handle.descriptor().total(), Some(data.len() as u64));
        assert_eq!(handle.progress().transferred, data.len() as u64);
        assert_eq!(fixture.relay.pushed(&hash).await, Some((Variant::Source, data)));
    }

    #[tokio::test]
    async fn test_upload_missing_file_fails() {
        let fixture = Fixture::new().await;
        let orchestrator = fixture.orchestrator(1);
        let upload =
            UploadDescriptor::new(FileHash::digest(b"x"), Variant::Source, "/nonexistent/x", &CancellationToken::new());
        assert_eq!(orchestrator.submit(upload).wait().await, TransferState::Failed(FailureClass::Local));
    }

    #[tokio::test]
    async fn test_upload_skip_and_linked_cancellation() {
        let fixture = Fixture::new().await;
        let orchestrator = fixture.orchestrator(2);
        let push_gate = fixture.relay.gate_pushes().await;
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"appearance").unwrap();
        let hash = FileHash::digest(b"appearance");

        let (first_parent, second_parent) = (CancellationToken::new(), CancellationToken::new());
        let first = orchestrator.submit(UploadDescriptor::new(hash, Variant::Source, file.path(), &first_parent));
        let second = orchestrator.submit(UploadDescriptor::new(hash, Variant::Source, file.path(), &second_parent));
        let skipped = UploadDescriptor::new(hash, Variant::Source, file.path(), &CancellationToken::new());
        skipped.skip();
        let skipped = orchestrator.submit(skipped);

        assert_eq!(first.state(), TransferState::InProgress);
        assert_eq!(second.state(), TransferState::InProgress);
        first_parent.cancel();
        assert_eq!(first.wait().await, TransferState::Cancelled);
        assert!(!second_parent.is_cancelled());

        push_gate.open();
        assert_eq!(second.wait().await, TransferState::Completed);
        assert_eq!(skipped.wait().await, TransferState::Skipped(SkipReason::Requested));
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let fixture = Fixture::new().await;
        let orchestrator = fixture.orchestrator(1);
        let data = texture(11, 20 * 1024);
        let hash = fixture.relay.serve(data.clone()).await;
        let handle = orchestrator.submit(download(hash, data.len()));

        let mut progress = handle.progress_changes();
        let mut last = 0;
        // Ends once the transfer finishes and drops its sender.
        while progress.changed().await.is_ok() {
            let current = progress.borrow_and_update().transferred;
            assert!(current >= last && current <= data.len() as u64);
            last = current;
        }
        assert_eq!(handle.wait().await, TransferState::Completed);
        assert_eq!(handle.progress().transferred, data.len() as u64);
    }
}
