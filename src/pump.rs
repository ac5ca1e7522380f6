//! The link pump: one [`Link`] owns its destinations, the single-flight
//! transaction engine and three cooperating tasks.
//!
//! - the **I/O task** drains the outbound queue and transmits on the
//!   destination a request's routing word selects;
//! - the **receive task** polls every destination, completing register
//!   transactions and forwarding bulk data to the inbound queue
//!   (drop-on-full, never blocking the poll loop);
//! - the **data task** drains the inbound queue into the configured sinks:
//!   shared-memory ring, UDP forward, file append, user callback.
//!
//! Lifecycle is `Closed -> Opening -> Open -> Closing -> Closed`; tasks run
//! only in `Open` and exit cooperatively, so `close()` may block for up to
//! one loop-iteration timeout per task.

use std::{
    io::Write,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    dest::{Destination, RxFrame, TransportError, set::DestinationSet},
    engine::{EngineConfig, LinkError, Transaction, TransactionEngine, TxRequest},
    protocol::{Routing, TxKind},
    queue::BoundedQueue,
    register::{Command, DataRecord, RecordKind},
    shm::SharedRing,
    stats::{LinkStats, LinkStatsSnapshot},
};

/// Lifecycle of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Closed = 0,
    Opening = 1,
    Open = 2,
    Closing = 3,
}

impl LinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Opening,
            2 => Self::Open,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Callback sink invoked with every record the data task delivers.
pub type DataCallback = Arc<dyn Fn(&DataRecord) + Send + Sync>;

struct FileSinkConfig {
    path: PathBuf,
    /// Segment size before rolling to `<path>.N`; 0 keeps one file.
    max_bytes: u64,
}

/// Builder for a [`Link`].
pub struct LinkBuilder {
    dests: Vec<Arc<dyn Destination>>,
    max_frame: usize,
    timeout: Duration,
    attempts: u32,
    poll_interval: Duration,
    data_queue_depth: usize,
    outbound_depth: usize,
    data_task: bool,
    ring: Option<Arc<SharedRing>>,
    forward: Option<(String, u16)>,
    file: Option<FileSinkConfig>,
    callback: Option<DataCallback>,
}

impl LinkBuilder {
    /// Appends a destination; its position becomes the index the routing
    /// word selects it by.
    #[must_use]
    pub fn destination(mut self, dest: Arc<dyn Destination>) -> Self {
        self.dests.push(dest);
        self
    }

    /// Largest frame either direction will carry, in bytes.
    ///
    /// Default: 8192.
    #[must_use]
    pub fn max_frame(mut self, bytes: usize) -> Self {
        self.max_frame = bytes;
        self
    }

    /// Default response timeout for register and command transactions.
    ///
    /// Default: 250 ms, at microsecond granularity.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attempts per transaction before a timeout or status error is
    /// surfaced to the caller.
    ///
    /// Default: 5.
    #[must_use]
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Receive-poll and idle-wait interval for the pump tasks.
    ///
    /// Default: 1 ms.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Capacity of the inbound bulk-data queue. A full queue drops new
    /// records rather than stalling the receive task.
    ///
    /// Default: 512 records.
    #[must_use]
    pub fn data_queue_depth(mut self, depth: usize) -> Self {
        self.data_queue_depth = depth;
        self
    }

    /// Runs the pump without a data task; the caller drains the inbound
    /// queue via [`Link::poll_data`] instead.
    #[must_use]
    pub fn without_data_task(mut self) -> Self {
        self.data_task = false;
        self
    }

    /// Publishes every data record into a shared-memory ring for external
    /// monitor processes.
    #[must_use]
    pub fn ring(mut self, ring: SharedRing) -> Self {
        self.ring = Some(Arc::new(ring));
        self
    }

    /// Forwards every data record to a UDP peer: one datagram carrying the
    /// flag word, one carrying the payload.
    #[must_use]
    pub fn forward(mut self, host: impl Into<String>, port: u16) -> Self {
        self.forward = Some((host.into(), port));
        self
    }

    /// Appends every data record to a file, rolling to `<path>.N` segments
    /// once a segment exceeds `max_bytes` (0 keeps a single file).
    #[must_use]
    pub fn file(mut self, path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        self.file = Some(FileSinkConfig {
            path: path.into(),
            max_bytes,
        });
        self
    }

    /// Invokes `callback` with every record the data task delivers.
    #[must_use]
    pub fn on_data(mut self, callback: impl Fn(&DataRecord) + Send + Sync + 'static) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Link {
        let dests = Arc::new(DestinationSet::new(self.dests));
        let stats = Arc::new(LinkStats::default());
        let outbound = Arc::new(BoundedQueue::new(self.outbound_depth));
        let data_queue = Arc::new(BoundedQueue::new(self.data_queue_depth));

        let engine = TransactionEngine::new(
            dests.clone(),
            outbound.clone(),
            stats.clone(),
            EngineConfig {
                timeout: self.timeout,
                attempts: self.attempts,
                max_frame: self.max_frame,
            },
        );

        Link {
            inner: Arc::new(LinkInner {
                dests,
                engine,
                outbound,
                data_queue,
                stats,
                state: AtomicU8::new(LinkState::Closed as u8),
                max_frame: self.max_frame,
                poll_interval: self.poll_interval,
                data_task: self.data_task,
                ring: self.ring,
                forward: self.forward,
                file: self.file,
                callback: self.callback,
                run_command: Mutex::new(None),
            }),
            token: Mutex::new(CancellationToken::new()),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }
}

struct LinkInner {
    dests: Arc<DestinationSet>,
    engine: TransactionEngine,
    outbound: Arc<BoundedQueue<TxRequest>>,
    data_queue: Arc<BoundedQueue<DataRecord>>,
    stats: Arc<LinkStats>,
    state: AtomicU8,
    max_frame: usize,
    poll_interval: Duration,
    data_task: bool,
    ring: Option<Arc<SharedRing>>,
    forward: Option<(String, u16)>,
    file: Option<FileSinkConfig>,
    callback: Option<DataCallback>,
    /// Preset command fired by `queue_run_command`.
    run_command: Mutex<Option<(Command, Routing)>>,
}

/// A transport-agnostic control/data link.
///
/// Build with [`Link::builder`], then [`open`](Link::open) to start the
/// pump. All methods take `&self`; the single-flight engine serializes
/// concurrent `execute` callers internally.
pub struct Link {
    inner: Arc<LinkInner>,
    token: Mutex<CancellationToken>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Link {
    pub fn builder() -> LinkBuilder {
        LinkBuilder {
            dests: Vec::new(),
            max_frame: 8192,
            timeout: Duration::from_millis(250),
            attempts: 5,
            poll_interval: Duration::from_millis(1),
            data_queue_depth: 512,
            outbound_depth: 8,
            data_task: true,
            ring: None,
            forward: None,
            file: None,
            callback: None,
        }
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: LinkState, to: LinkState) -> Result<(), LinkError> {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| LinkError::NotOpen)
    }

    /// Opens every destination, then starts the pump tasks. Fails without
    /// side effects if any destination refuses to open.
    pub async fn open(&self) -> Result<(), LinkError> {
        self.transition(LinkState::Closed, LinkState::Opening)?;

        if let Err(e) = self.inner.dests.open_all(self.inner.max_frame).await {
            self.inner
                .state
                .store(LinkState::Closed as u8, Ordering::Release);
            return Err(e.into());
        }

        let file_sink = match &self.inner.file {
            Some(config) => match FileSink::open(config) {
                Ok(sink) => Some(sink),
                Err(e) => {
                    self.inner.dests.close_all().await;
                    self.inner
                        .state
                        .store(LinkState::Closed as u8, Ordering::Release);
                    return Err(LinkError::Transport(e.into()));
                }
            },
            None => None,
        };

        let forward_sink = match &self.inner.forward {
            Some((host, port)) => match open_forward(host, *port).await {
                Ok(socket) => Some(socket),
                Err(e) => {
                    self.inner.dests.close_all().await;
                    self.inner
                        .state
                        .store(LinkState::Closed as u8, Ordering::Release);
                    return Err(LinkError::Transport(e.into()));
                }
            },
            None => None,
        };

        let token = CancellationToken::new();
        *self.token.lock().expect("token lock") = token.clone();

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(io_task(self.inner.clone(), token.clone())));
        tasks.push(tokio::spawn(rx_task(self.inner.clone(), token.clone())));
        if self.inner.data_task {
            tasks.push(tokio::spawn(data_task(
                self.inner.clone(),
                token.clone(),
                file_sink,
                forward_sink,
            )));
        }
        drop(tasks);

        self.inner
            .state
            .store(LinkState::Open as u8, Ordering::Release);
        tracing::debug!(dests = self.inner.dests.len(), "link open");
        Ok(())
    }

    /// Signals the pump tasks to exit, joins them, then closes every
    /// destination. Join-before-close keeps a task from touching a closed
    /// endpoint.
    pub async fn close(&self) {
        if self.transition(LinkState::Open, LinkState::Closing).is_err() {
            return;
        }

        self.token.lock().expect("token lock").cancel();
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }
        self.inner.dests.close_all().await;

        self.inner
            .state
            .store(LinkState::Closed as u8, Ordering::Release);
        tracing::debug!("link closed");
    }

    /// Runs one transaction through the single-flight engine.
    pub async fn execute(&self, tx: Transaction<'_>) -> Result<(), LinkError> {
        if self.state() != LinkState::Open {
            return Err(LinkError::NotOpen);
        }
        self.inner.engine.execute(tx).await
    }

    /// Fire-and-forget enqueue; completion is never reported.
    pub async fn execute_async(&self, tx: Transaction<'_>) -> Result<(), LinkError> {
        if self.state() != LinkState::Open {
            return Err(LinkError::NotOpen);
        }
        self.inner.engine.execute_async(tx).await
    }

    /// Presets the command fired by [`queue_run_command`](Self::queue_run_command).
    pub fn set_run_command(&self, command: Command, routing: Routing) {
        *self.inner.run_command.lock().expect("run command lock") = Some((command, routing));
    }

    /// Fires the preset run command without waiting. A no-op when no run
    /// command is set.
    pub async fn queue_run_command(&self) -> Result<(), LinkError> {
        let preset = self.inner.run_command.lock().expect("run command lock").clone();
        match preset {
            Some((command, routing)) => {
                self.execute_async(Transaction::command(&command, routing)).await
            }
            None => Ok(()),
        }
    }

    /// Injects a marker record (config/status/run boundaries) into the
    /// data path; it reaches every sink in order with the raw data.
    pub fn publish_marker(&self, kind: RecordKind, payload: impl Into<Bytes>) {
        let record = DataRecord::marker(kind, payload.into());
        if self.inner.data_queue.try_push(record).is_err() {
            LinkStats::bump(&self.inner.stats.queue_drops);
            tracing::warn!("inbound queue full, marker record dropped");
        }
    }

    /// Drains one record from the inbound queue when the pump runs without
    /// a data task. Returns `None` immediately if a data task owns the
    /// queue.
    pub async fn poll_data(&self, wait: Duration) -> Option<DataRecord> {
        if self.inner.data_task {
            tracing::warn!("poll_data ignored: the data task owns the inbound queue");
            return None;
        }
        self.inner.data_queue.pop(wait).await
    }

    /// Adjusts the default transaction timeout at runtime.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.engine.set_timeout(timeout);
    }

    /// Disables transaction timeouts (bring-up aid; waits become
    /// effectively unbounded).
    pub fn disable_timeouts(&self, disable: bool) {
        self.inner.engine.disable_timeouts(disable);
    }

    /// Monotonic count of requests accepted by the engine.
    pub fn request_count(&self) -> u32 {
        self.inner.engine.request_count()
    }

    /// Monotonic count of completed transactions.
    pub fn response_count(&self) -> u32 {
        self.inner.engine.response_count()
    }

    pub fn stats(&self) -> LinkStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn clear_counters(&self) {
        self.inner.stats.clear();
    }
}

/// How long a task sleeps in one iteration before re-checking for
/// cancellation; bounds the cooperative shutdown latency.
const TASK_WAIT: Duration = Duration::from_millis(100);

async fn io_task(inner: Arc<LinkInner>, token: CancellationToken) {
    loop {
        let request = tokio::select! {
            _ = token.cancelled() => break,
            req = inner.outbound.pop(TASK_WAIT) => req,
        };
        let Some(request) = request else { continue };

        let kind = request.frame.kind();
        match inner.dests.transmit(request.frame).await {
            Ok(result) => {
                if let Some(reply) = result.reply {
                    // A synchronous destination slipped through the inline
                    // bypass; complete it like any other reply.
                    inner.engine.complete_register(reply);
                } else if request.tracked && matches!(kind, TxKind::Command | TxKind::Data) {
                    inner.engine.complete_sent();
                }
            }
            Err(e) => {
                LinkStats::bump(&inner.stats.errors);
                tracing::warn!(?kind, error = %e, "transmit failed");
                if request.tracked {
                    inner.engine.complete_fault(e);
                }
            }
        }
    }
}

async fn rx_task(inner: Arc<LinkInner>, token: CancellationToken) {
    loop {
        if token.is_cancelled() {
            break;
        }

        let produced = inner
            .dests
            .sweep(|index, result| match result {
                Ok(RxFrame::Data { source: _, payload }) => {
                    if inner.data_queue.try_push(DataRecord::raw(payload)).is_err() {
                        LinkStats::bump(&inner.stats.queue_drops);
                        tracing::debug!(index, "inbound queue full, data record dropped");
                    }
                }
                Ok(RxFrame::Register(reply)) => {
                    inner.engine.complete_register(reply);
                }
                Err(TransportError::Malformed(e)) => {
                    LinkStats::bump(&inner.stats.errors);
                    tracing::debug!(index, error = %e, "malformed frame discarded");
                }
                Err(e) => {
                    LinkStats::bump(&inner.stats.errors);
                    tracing::warn!(index, error = %e, "receive failed");
                }
            })
            .await;

        if produced == 0 {
            // Nothing pending on any destination; poll again shortly.
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(inner.poll_interval) => {}
            }
        }
    }
}

async fn data_task(
    inner: Arc<LinkInner>,
    token: CancellationToken,
    mut file: Option<FileSink>,
    forward: Option<tokio::net::UdpSocket>,
) {
    let mut last_report = std::time::Instant::now();

    loop {
        let record = tokio::select! {
            _ = token.cancelled() => break,
            rec = inner.data_queue.pop(TASK_WAIT) => rec,
        };
        let Some(record) = record else { continue };

        LinkStats::bump(&inner.stats.data_rx);

        // Once-a-second status while data is flowing.
        if last_report.elapsed() >= Duration::from_secs(1) {
            last_report = std::time::Instant::now();
            tracing::debug!(
                received = inner.stats.data_rx.load(Ordering::Relaxed),
                depth = inner.data_queue.len(),
                dropped = inner.data_queue.dropped(),
                "data path status"
            );
        }

        if let Some(callback) = &inner.callback {
            callback(&record);
        }

        if let Some(ring) = &inner.ring {
            if !ring.publish(record.kind, &record.payload) {
                LinkStats::bump(&inner.stats.ring_drops);
            }
        }

        if let Some(socket) = &forward {
            let flag = ((record.kind as u32) << 28) | (record.payload.len() as u32 & 0x0FFF_FFFF);
            // Flag word first, payload second, matching the file layout.
            if socket.send(&flag.to_ne_bytes()).await.is_err()
                || socket.send(&record.payload).await.is_err()
            {
                LinkStats::bump(&inner.stats.errors);
            }
        }

        if let Some(sink) = &mut file {
            match sink.append(&record) {
                Ok(()) => LinkStats::bump(&inner.stats.file_records),
                Err(e) => {
                    LinkStats::bump(&inner.stats.errors);
                    tracing::warn!(error = %e, "file sink append failed");
                }
            }
        }
    }
}

async fn open_forward(host: &str, port: u16) -> std::io::Result<tokio::net::UdpSocket> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect((host, port)).await?;
    Ok(socket)
}

/// Append-only record sink with optional size-based segment rollover.
struct FileSink {
    path: PathBuf,
    max_bytes: u64,
    file: std::fs::File,
    written: u64,
    segment: u32,
}

impl FileSink {
    fn open(config: &FileSinkConfig) -> std::io::Result<Self> {
        let (segment, path) = if config.max_bytes > 0 {
            (1, segment_path(&config.path, 1))
        } else {
            (0, config.path.clone())
        };
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        tracing::debug!(path = %path.display(), "data file open");
        Ok(Self {
            path: config.path.clone(),
            max_bytes: config.max_bytes,
            file,
            written: 0,
            segment,
        })
    }

    fn append(&mut self, record: &DataRecord) -> std::io::Result<()> {
        self.roll_if_needed()?;

        let flag = ((record.kind as u32) << 28) | (record.payload.len() as u32 & 0x0FFF_FFFF);
        self.file.write_all(&flag.to_ne_bytes())?;
        self.file.write_all(&record.payload)?;
        self.written += 4 + record.payload.len() as u64;
        Ok(())
    }

    fn roll_if_needed(&mut self) -> std::io::Result<()> {
        if self.max_bytes == 0 || self.written <= self.max_bytes {
            return Ok(());
        }

        self.file.flush()?;
        self.segment += 1;
        let path = segment_path(&self.path, self.segment);
        self.file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        self.written = 0;
        tracing::debug!(path = %path.display(), "rolled data file segment");
        Ok(())
    }
}

fn segment_path(path: &std::path::Path, segment: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{segment}"));
    PathBuf::from(name)
}
