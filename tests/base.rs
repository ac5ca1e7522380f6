use std::{
    collections::VecDeque,
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use reglink::{
    DataSourceSet, Link, LinkError, MappedDest, PacketDest, PacketMeta, PacketPort, RecordKind,
    Register, Routing, SharedRing, SharedRingReader, SourceKey, Span, Transaction, Word,
};

const WRITE_FLAG: Word = 1 << 30;

/// In-memory device behind a packet port.
///
/// `responsive` devices answer every register request with an
/// address-derived payload; silent ones swallow everything. The port also
/// checks the single-flight contract: a second request arriving while one
/// is unanswered is a violation.
#[derive(Default)]
struct StubDevice {
    responsive: bool,
    inbound: Mutex<VecDeque<(Vec<Word>, PacketMeta)>>,
    outstanding: AtomicBool,
    violations: AtomicUsize,
    sends: AtomicUsize,
}

impl StubDevice {
    fn responsive() -> Self {
        Self {
            responsive: true,
            ..Default::default()
        }
    }

    fn silent() -> Self {
        Self::default()
    }

    fn seed_data(&self, lane: u8, vc: u8, words: Vec<Word>) {
        self.inbound.lock().unwrap().push_back((
            words,
            PacketMeta {
                lane,
                vc,
                ..Default::default()
            },
        ));
    }
}

fn reply_for(words: &[Word]) -> Vec<Word> {
    let context = words[0];
    let op = words[1];
    if op & WRITE_FLAG != 0 {
        // Write acknowledge: echo the op word, no payload beyond one pad.
        vec![context, op, 0, 0]
    } else {
        let address = (op & (WRITE_FLAG - 1)) << 2;
        let count = words[2] as usize + 1;
        let mut reply = vec![context, op];
        reply.extend((0..count as Word).map(|i| address + i + 1));
        reply.push(0);
        reply
    }
}

impl PacketPort for StubDevice {
    fn open(&self, _max_frame: usize) -> io::Result<()> {
        Ok(())
    }

    fn close(&self) {}

    fn send(&self, words: &[Word], lane: u8, vc: u8) -> io::Result<usize> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if self.outstanding.swap(true, Ordering::SeqCst) {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }

        if self.responsive {
            self.inbound.lock().unwrap().push_back((
                reply_for(words),
                PacketMeta {
                    lane,
                    vc,
                    ..Default::default()
                },
            ));
        }
        Ok(words.len())
    }

    fn recv(&self, _max_words: usize) -> io::Result<Option<(Vec<Word>, PacketMeta)>> {
        let frame = self.inbound.lock().unwrap().pop_front();
        if frame.is_some() {
            self.outstanding.store(false, Ordering::SeqCst);
        }
        Ok(frame)
    }
}

fn packet_routing() -> Routing {
    Routing::packet(0, (0, 0), (0, 1), (1, 2))
}

async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mapped_memory_write_read_back() {
    let link = Link::builder()
        .destination(Arc::new(MappedDest::anonymous([Span::new(0x0, 0x1000)])))
        .build();
    link.open().await.unwrap();

    let mut reg = Register::new("scratch", 0x10, 1);
    reg.set(0xDEAD_BEEF, 0, 0xFFFF_FFFF);
    assert!(reg.stale());

    link.execute(Transaction::write(&mut reg, Routing::default()))
        .await
        .unwrap();
    assert!(!reg.stale());

    // Clobber the shadow, then read the device back into it.
    reg.set(0, 0, 0xFFFF_FFFF);
    link.execute(Transaction::read(&mut reg, Routing::default()))
        .await
        .unwrap();
    assert_eq!(reg.data()[0], 0xDEAD_BEEF);
    assert!(!reg.stale());
    assert_eq!(reg.status(), 0);

    link.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn packet_read_completes_with_device_payload() {
    let link = Link::builder()
        .destination(Arc::new(PacketDest::new(
            StubDevice::responsive(),
            DataSourceSet::new([SourceKey::packet(1, 2)]),
        )))
        .build();
    link.open().await.unwrap();

    let mut reg = Register::new("adc", 0x40, 4);
    reg.set_data(&[0; 4]);
    link.execute(Transaction::read(&mut reg, packet_routing()))
        .await
        .unwrap();

    // The stub replies with address-derived words.
    assert_eq!(reg.data(), &[0x41, 0x42, 0x43, 0x44]);
    assert!(!reg.stale());

    link.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_executes_are_single_flight() {
    const CALLERS: usize = 8;

    let dest = Arc::new(PacketDest::new(
        StubDevice::responsive(),
        DataSourceSet::default(),
    ));
    let link = Arc::new(Link::builder().destination(dest.clone()).build());
    link.open().await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..CALLERS {
        let link = link.clone();
        tasks.push(tokio::spawn(async move {
            let address = 0x100 * (i as u32 + 1);
            let mut reg = Register::new("r", address, 2);
            link.execute(Transaction::read(&mut reg, packet_routing()))
                .await
                .unwrap();
            // Each caller must see its own device's payload, never a
            // neighbor's response.
            assert_eq!(reg.data(), &[address + 1, address + 2]);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let port = dest.port();
    assert_eq!(port.sends.load(Ordering::SeqCst), CALLERS);
    assert_eq!(port.violations.load(Ordering::SeqCst), 0);

    link.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeout_is_deterministic_against_silent_device() {
    const TIMEOUT: Duration = Duration::from_millis(50);

    let link = Link::builder()
        .destination(Arc::new(PacketDest::new(
            StubDevice::silent(),
            DataSourceSet::default(),
        )))
        .attempts(1)
        .build();
    link.open().await.unwrap();

    let mut reg = Register::new("dead", 0x40, 1);
    let start = Instant::now();
    let err = link
        .execute(Transaction::read(&mut reg, packet_routing()).timeout(TIMEOUT))
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, LinkError::TransactionTimeout { attempts: 1 }));
    assert!(elapsed >= TIMEOUT, "returned before the deadline: {elapsed:?}");
    assert!(
        elapsed < TIMEOUT + Duration::from_millis(250),
        "late well past the deadline: {elapsed:?}"
    );

    // The engine is idle again: a subsequent transaction is not blocked.
    let err = link
        .execute(Transaction::read(&mut reg, packet_routing()).timeout(TIMEOUT))
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::TransactionTimeout { .. }));

    link.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn data_frames_fan_out_to_ring_and_callback() {
    let dir = tempfile::tempdir().unwrap();
    let ring_path = dir.path().join("monitor");
    let ring = SharedRing::create(&ring_path, 16, 256).unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let dest = Arc::new(PacketDest::new(
        StubDevice::responsive(),
        DataSourceSet::new([SourceKey::packet(1, 2)]),
    ));

    let link = Link::builder()
        .destination(dest.clone())
        .ring(ring)
        .on_data({
            let seen = seen.clone();
            move |record| {
                assert_eq!(record.kind, RecordKind::Raw);
                seen.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build();
    link.open().await.unwrap();

    for i in 0..4u32 {
        dest.port().seed_data(1, 2, vec![i, i + 1, i + 2, i + 3]);
    }

    assert!(wait_until(Duration::from_secs(2), || seen.load(Ordering::SeqCst) == 4).await);
    assert!(wait_until(Duration::from_secs(2), || link.stats().data_rx == 4).await);

    // An external monitor process: attach by name, read what is live.
    let mut reader = SharedRingReader::attach(&ring_path).unwrap();
    let record = reader.try_read().expect("ring record");
    assert_eq!(record.kind(), Some(RecordKind::Raw));
    assert_eq!(record.payload.len(), 16);

    link.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn marker_records_flow_through_the_data_path() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let link = Link::builder()
        .destination(Arc::new(MappedDest::anonymous([Span::new(0x0, 0x100)])))
        .on_data({
            let seen = seen.clone();
            move |record| seen.lock().unwrap().push(record.kind)
        })
        .build();
    link.open().await.unwrap();

    link.publish_marker(RecordKind::RunStart, "<run/>");
    link.publish_marker(RecordKind::Config, "<config/>");

    assert!(wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() == 2).await);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![RecordKind::RunStart, RecordKind::Config]
    );

    link.close().await;
}

/// Port whose transmit path is broken outright.
struct BrokenPort;

impl PacketPort for BrokenPort {
    fn open(&self, _max_frame: usize) -> io::Result<()> {
        Ok(())
    }

    fn close(&self) {}

    fn send(&self, _words: &[Word], _lane: u8, _vc: u8) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "device detached"))
    }

    fn recv(&self, _max_words: usize) -> io::Result<Option<(Vec<Word>, PacketMeta)>> {
        Ok(None)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transmit_failure_propagates_without_waiting_for_timeout() {
    let link = Link::builder()
        .destination(Arc::new(PacketDest::new(BrokenPort, DataSourceSet::default())))
        .timeout(Duration::from_secs(5))
        .build();
    link.open().await.unwrap();

    let mut reg = Register::new("gone", 0x40, 1);
    let start = Instant::now();
    let err = link
        .execute(Transaction::read(&mut reg, packet_routing()))
        .await
        .unwrap_err();

    assert!(matches!(err, LinkError::Transport(_)));
    // Fails on the transmit error itself, far inside the 5 s window.
    assert!(start.elapsed() < Duration::from_secs(1));

    link.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unsolicited_register_frames_are_counted_not_applied() {
    let dest = Arc::new(PacketDest::new(
        StubDevice::silent(),
        DataSourceSet::default(),
    ));
    let link = Link::builder().destination(dest.clone()).build();
    link.open().await.unwrap();

    // A register-class frame with no outstanding transaction.
    dest.port().seed_data(0, 0, vec![0x99, 0x40 >> 2, 0xAB, 0]);

    assert!(wait_until(Duration::from_secs(2), || link.stats().unexpected == 1).await);
    assert_eq!(link.stats().reg_rx, 0);

    link.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn poll_data_drains_queue_when_data_task_is_disabled() {
    let dest = Arc::new(PacketDest::new(
        StubDevice::silent(),
        DataSourceSet::new([SourceKey::packet(1, 2)]),
    ));
    let link = Link::builder()
        .destination(dest.clone())
        .without_data_task()
        .build();
    link.open().await.unwrap();

    dest.port().seed_data(1, 2, vec![0xA, 0xB, 0xC, 0xD]);

    let record = link
        .poll_data(Duration::from_millis(500))
        .await
        .expect("queued data record");
    assert_eq!(record.kind, RecordKind::Raw);
    assert_eq!(record.payload.len(), 16);

    // The preset run command fires without waiting for any response.
    link.set_run_command(reglink::Command::new("run", 0x55), packet_routing());
    link.queue_run_command().await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        dest.port().sends.load(Ordering::SeqCst) == 1
    })
    .await);

    link.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn command_strobe_completes_on_transmit() {
    let dest = Arc::new(PacketDest::new(
        StubDevice::silent(),
        DataSourceSet::default(),
    ));
    let link = Link::builder().destination(dest.clone()).build();
    link.open().await.unwrap();

    // Commands complete on transmit; no device response is needed.
    let cmd = reglink::Command::new("trigger", 0x2A);
    link.execute(Transaction::command(&cmd, packet_routing()))
        .await
        .unwrap();
    assert_eq!(dest.port().sends.load(Ordering::SeqCst), 1);

    link.close().await;
}
