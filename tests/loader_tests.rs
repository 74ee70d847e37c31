use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use image::RgbaImage;
use image_loader::config::QueueOrder;
use image_loader::processing::downsample::Downsampler;
use image_loader::{
    Configuration, DecodedImage, ImageLoader, ImageView, LoadError, LoadOutcome, RequestStatus,
    RequiredSize, SourceKind, TargetHandle, ViewBounds,
};

/// Decoder stand-in. Keys starting with `hold` wait for a release, keys starting with
/// `fail` error out, everything else decodes to a `len(key) x 1` image.
struct FakeDecoder {
    calls: Arc<Mutex<Vec<String>>>,
    started: Sender<String>,
    release: Receiver<()>,
    active: AtomicUsize,
    max_active: Arc<AtomicUsize>,
    delay: Duration,
}

impl Downsampler for FakeDecoder {
    fn decode_file(&self, path: &Path, _size: RequiredSize) -> Result<DecodedImage, LoadError> {
        let key = path.to_string_lossy().into_owned();
        self.calls.lock().unwrap().push(key.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let _ = self.started.send(key.clone());

        if key.starts_with("hold") {
            let _ = self.release.recv_timeout(Duration::from_secs(10));
        } else if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if key.starts_with("fail") {
            return Err(LoadError::Decode(format!("{key}: broken")));
        }
        Ok(DecodedImage::new(RgbaImage::new(key.len() as u32, 1)))
    }

    fn decode_bytes(&self, _bytes: &[u8], _size: RequiredSize) -> Result<DecodedImage, LoadError> {
        Err(LoadError::Decode("no remote sources here".into()))
    }
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Option<DecodedImage>>>>);

impl Recorder {
    fn widths(&self) -> Vec<Option<u32>> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .map(|i| i.as_ref().map(DecodedImage::width))
            .collect()
    }
}

impl ImageView for Recorder {
    fn bounds(&self) -> ViewBounds {
        ViewBounds::measured(100, 100)
    }

    fn show(&self, image: Option<&DecodedImage>) {
        self.0.lock().unwrap().push(image.cloned());
    }
}

struct Harness {
    loader: ImageLoader,
    display: JoinHandle<()>,
    calls: Arc<Mutex<Vec<String>>>,
    started: Receiver<String>,
    release: Sender<()>,
    max_active: Arc<AtomicUsize>,
    _cache: tempfile::TempDir,
}

impl Harness {
    fn new(workers: usize, order: QueueOrder) -> Self {
        Self::with_delay(workers, order, Duration::ZERO)
    }

    fn with_delay(workers: usize, order: QueueOrder, delay: Duration) -> Self {
        let cache = tempfile::tempdir().unwrap();
        let mut config = Configuration::default();
        config.worker_count = workers;
        config.queue_order = order;
        config.disk_cache.dir = Some(cache.path().to_path_buf());

        let calls = Arc::new(Mutex::new(Vec::new()));
        let max_active = Arc::new(AtomicUsize::new(0));
        let (started_tx, started) = unbounded();
        let (release, release_rx) = unbounded();
        let decoder = FakeDecoder {
            calls: Arc::clone(&calls),
            started: started_tx,
            release: release_rx,
            active: AtomicUsize::new(0),
            max_active: Arc::clone(&max_active),
            delay,
        };

        let (loader, pump) = ImageLoader::builder(&config)
            .downsampler(decoder)
            .memory_capacity(1 << 20)
            .start()
            .unwrap();
        let display = std::thread::spawn(move || pump.run());

        Self {
            loader,
            display,
            calls,
            started,
            release,
            max_active,
            _cache: cache,
        }
    }

    fn target() -> (TargetHandle, Recorder) {
        let recorder = Recorder::default();
        (TargetHandle::new(recorder.clone()), recorder)
    }

    fn wait_started(&self, key: &str) {
        loop {
            let started = self
                .started
                .recv_timeout(Duration::from_secs(5))
                .expect("decode never started");
            if started == key {
                return;
            }
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn finish(self) {
        self.loader.shutdown().await;
        drop(self.loader);
        self.display.join().unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lifo_runs_most_recent_request_first() {
    let h = Harness::new(1, QueueOrder::Lifo);
    let (blocker, _) = Harness::target();
    let first = h
        .loader
        .request_load_with_completion("hold", &blocker, SourceKind::Local);
    h.wait_started("hold");

    let mut pending = Vec::new();
    for key in ["t1", "t2", "t3"] {
        let (target, _) = Harness::target();
        pending.push(h.loader.request_load_with_completion(key, &target, SourceKind::Local));
    }
    h.release.send(()).unwrap();

    assert!(matches!(first.await, LoadOutcome::Shown(_)));
    for completion in pending {
        assert!(matches!(completion.await, LoadOutcome::Shown(_)));
    }
    assert_eq!(h.calls(), vec!["hold", "t3", "t2", "t1"]);
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fifo_runs_in_arrival_order() {
    let h = Harness::new(1, QueueOrder::Fifo);
    let (blocker, _) = Harness::target();
    let first = h
        .loader
        .request_load_with_completion("hold", &blocker, SourceKind::Local);
    h.wait_started("hold");

    let mut pending = Vec::new();
    for key in ["t1", "t2", "t3"] {
        let (target, _) = Harness::target();
        pending.push(h.loader.request_load_with_completion(key, &target, SourceKind::Local));
    }
    h.release.send(()).unwrap();

    first.await;
    for completion in pending {
        completion.await;
    }
    assert_eq!(h.calls(), vec!["hold", "t1", "t2", "t3"]);
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn never_runs_more_pipelines_than_workers() {
    let h = Harness::with_delay(3, QueueOrder::Lifo, Duration::from_millis(20));
    let mut pending = Vec::new();
    for i in 0..12 {
        let (target, _) = Harness::target();
        pending.push(h.loader.request_load_with_completion(
            format!("img-{i}"),
            &target,
            SourceKind::Local,
        ));
    }
    for completion in pending {
        assert!(matches!(completion.await, LoadOutcome::Shown(_)));
    }

    let stats = h.loader.stats();
    assert!(stats.peak_running <= 3);
    assert!(stats.peak_running >= 1);
    assert!(h.max_active.load(Ordering::SeqCst) <= 3);
    assert_eq!(stats.running, 0);
    assert_eq!(stats.completed, 12);
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn memory_hit_delivers_cached_image_without_enqueueing() {
    let h = Harness::new(1, QueueOrder::Lifo);
    let (first_target, _) = Harness::target();
    let LoadOutcome::Shown(loaded) = h
        .loader
        .request_load_with_completion("cat", &first_target, SourceKind::Local)
        .await
    else {
        panic!("first load should show an image");
    };
    assert_eq!(h.loader.stats().enqueued, 1);

    let (second_target, recorder) = Harness::target();
    let status = h
        .loader
        .request_load("cat", &second_target, SourceKind::Local);
    assert_eq!(status, RequestStatus::MemoryHit);

    let outcome = h
        .loader
        .request_load_with_completion("cat", &second_target, SourceKind::Local)
        .await;
    assert!(outcome.image().unwrap().same_as(&loaded));
    assert!(recorder.0.lock().unwrap()[0].as_ref().unwrap().same_as(&loaded));

    assert_eq!(h.loader.stats().enqueued, 1);
    assert_eq!(h.calls(), vec!["cat"]);
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reassigned_target_drops_the_older_result() {
    let h = Harness::new(1, QueueOrder::Lifo);
    let (target, recorder) = Harness::target();

    let a = h
        .loader
        .request_load_with_completion("hold-a", &target, SourceKind::Local);
    h.wait_started("hold-a");
    let b = h
        .loader
        .request_load_with_completion("bb", &target, SourceKind::Local);
    h.release.send(()).unwrap();

    assert!(a.await.is_stale());
    assert!(matches!(b.await, LoadOutcome::Shown(_)));
    // Only "bb" (width 2) reached the view.
    assert_eq!(recorder.widths(), vec![Some(2)]);
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_requests_share_one_task() {
    let h = Harness::new(1, QueueOrder::Lifo);
    let (blocker, _) = Harness::target();
    let first = h
        .loader
        .request_load_with_completion("hold", &blocker, SourceKind::Local);
    h.wait_started("hold");

    let (left, left_view) = Harness::target();
    let (right, right_view) = Harness::target();
    assert_eq!(
        h.loader.request_load("dup", &left, SourceKind::Local),
        RequestStatus::Enqueued
    );
    assert_eq!(
        h.loader.request_load("dup", &right, SourceKind::Local),
        RequestStatus::Coalesced
    );
    let again = h
        .loader
        .request_load_with_completion("dup", &left, SourceKind::Local);
    let right_done = h
        .loader
        .request_load_with_completion("dup", &right, SourceKind::Local);
    h.release.send(()).unwrap();

    first.await;
    assert!(matches!(again.await, LoadOutcome::Shown(_)));
    assert!(matches!(right_done.await, LoadOutcome::Shown(_)));
    assert_eq!(h.calls(), vec!["hold", "dup"]);
    // One delivery per target, however often it asked.
    assert_eq!(left_view.widths(), vec![Some(3)]);
    assert_eq!(right_view.widths(), vec![Some(3)]);
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_load_clears_target_and_is_not_retried() {
    let h = Harness::new(1, QueueOrder::Lifo);
    let (target, recorder) = Harness::target();

    let outcome = h
        .loader
        .request_load_with_completion("fail-1", &target, SourceKind::Local)
        .await;
    assert!(matches!(outcome, LoadOutcome::Cleared));
    assert_eq!(recorder.widths(), vec![None]);

    let stats = h.loader.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.enqueued, 1);
    assert_eq!(h.calls(), vec!["fail-1"]);
    assert!(h.loader.memory_cache().is_empty());

    // A new request is a new attempt.
    let outcome = h
        .loader
        .request_load_with_completion("fail-1", &target, SourceKind::Local)
        .await;
    assert!(matches!(outcome, LoadOutcome::Cleared));
    assert_eq!(h.calls().len(), 2);
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_abandons_queued_work() {
    let h = Harness::new(1, QueueOrder::Lifo);
    let loader = Arc::new(h.loader);
    let (blocker, _) = Harness::target();
    let running = loader.request_load_with_completion("hold", &blocker, SourceKind::Local);
    h.started.recv_timeout(Duration::from_secs(5)).unwrap();

    let (target, _) = Harness::target();
    let queued = loader.request_load_with_completion("queued", &target, SourceKind::Local);

    let stopping = tokio::spawn({
        let loader = Arc::clone(&loader);
        async move { loader.shutdown().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.release.send(()).unwrap();
    stopping.await.unwrap();

    assert!(matches!(queued.await, LoadOutcome::Abandoned));
    assert!(matches!(running.await, LoadOutcome::Shown(_)));
    assert_eq!(
        loader.request_load("late", &target, SourceKind::Local),
        RequestStatus::Rejected
    );
    assert_eq!(*h.calls.lock().unwrap(), vec!["hold"]);

    drop(loader);
    h.display.join().unwrap();
}
