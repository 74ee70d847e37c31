//! The loader consumers talk to.
//!
//! An [`ImageLoader`] is built once per session from a [`Configuration`] and owned by the
//! caller; there is no global instance. Building it also yields the [`DeliveryPump`] the
//! display thread must drive for results to reach their targets.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::cache::disk::DiskCache;
use crate::cache::memory::MemoryCache;
use crate::config::{Configuration, QueueOrder};
use crate::events::{LoadOutcome, LoadTask, RequestKey, SourceKind};
use crate::fetch::{ContentFetcher, HttpFetcher};
use crate::processing::downsample::{Downsampler, ScaledDecoder};
use crate::processing::layout::SizeResolver;
use crate::target::TargetHandle;
use crate::tasks::dispatcher::{self, Completion, Delivery, DeliveryPump, Dispatcher};
use crate::tasks::pipeline::Pipeline;
use crate::tasks::scheduler::{Scheduler, SchedulerStats, Submission};

/// What happened to a request at the moment it was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Served from the memory cache; the delivery is already on its way.
    MemoryHit,
    /// A new task was queued.
    Enqueued,
    /// Joined a task already queued or running for the same key.
    Coalesced,
    /// The loader is shut down; nothing will be delivered.
    Rejected,
}

impl From<Submission> for RequestStatus {
    fn from(submission: Submission) -> Self {
        match submission {
            Submission::Enqueued => Self::Enqueued,
            Submission::Coalesced => Self::Coalesced,
            Submission::Rejected => Self::Rejected,
        }
    }
}

pub struct ImageLoaderBuilder {
    config: Configuration,
    fetcher: Option<Arc<dyn ContentFetcher>>,
    decoder: Option<Arc<dyn Downsampler>>,
    memory_capacity: Option<u64>,
    runtime: Option<Handle>,
}

impl ImageLoaderBuilder {
    /// Replace the HTTP fetcher.
    pub fn fetcher(mut self, fetcher: impl ContentFetcher) -> Self {
        let fetcher: Arc<dyn ContentFetcher> = Arc::new(fetcher);
        self.fetcher = Some(fetcher);
        self
    }

    /// Replace the default decoder.
    pub fn downsampler(mut self, decoder: impl Downsampler) -> Self {
        let decoder: Arc<dyn Downsampler> = Arc::new(decoder);
        self.decoder = Some(decoder);
        self
    }

    /// Fix the memory cache budget instead of deriving it from available memory.
    pub fn memory_capacity(mut self, bytes: u64) -> Self {
        self.memory_capacity = Some(bytes);
        self
    }

    /// Runtime the workers are spawned on. Defaults to the current one.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn start(self) -> Result<(ImageLoader, DeliveryPump)> {
        let config = self.config;
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().context("image loader needs a tokio runtime")?,
        };

        let capacity = self
            .memory_capacity
            .unwrap_or_else(|| config.memory_cache.capacity());
        let memory = Arc::new(MemoryCache::new(capacity));

        let private_dir = config.disk_cache.private_dir();
        let disk = DiskCache::open(private_dir.clone(), config.disk_cache.external_dir.clone())
            .with_context(|| format!("failed to open disk cache at {}", private_dir.display()))?;
        let disk = Arc::new(disk);

        let fetcher: Arc<dyn ContentFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(
                HttpFetcher::new(&config.fetch).context("failed to build HTTP client")?,
            ),
        };
        let decoder: Arc<dyn Downsampler> = match self.decoder {
            Some(decoder) => decoder,
            None => Arc::new(ScaledDecoder),
        };

        let pipeline = Pipeline::new(
            Arc::clone(&memory),
            Arc::clone(&disk),
            fetcher,
            decoder,
            config.disk_cache.enabled,
        );
        let (dispatcher, pump) = dispatcher::channel();
        let scheduler = Scheduler::start(
            &runtime,
            config.worker_count,
            config.queue_order,
            pipeline,
            dispatcher.clone(),
        );

        info!(
            memory_capacity = capacity,
            disk_cache = config.disk_cache.enabled,
            "image loader ready"
        );
        let loader = ImageLoader {
            memory,
            disk,
            resolver: SizeResolver::new(config.display),
            scheduler,
            dispatcher,
        };
        Ok((loader, pump))
    }
}

pub struct ImageLoader {
    memory: Arc<MemoryCache>,
    disk: Arc<DiskCache>,
    resolver: SizeResolver,
    scheduler: Scheduler,
    dispatcher: Dispatcher,
}

impl ImageLoader {
    pub fn builder(config: &Configuration) -> ImageLoaderBuilder {
        ImageLoaderBuilder {
            config: config.clone(),
            fetcher: None,
            decoder: None,
            memory_capacity: None,
            runtime: None,
        }
    }

    /// Ask for `key` to be shown on `target`.
    ///
    /// The target is marked as expecting `key` right away, so results of anything it asked
    /// for earlier are dropped on arrival. Returns without waiting for the load.
    pub fn request_load(
        &self,
        key: impl Into<RequestKey>,
        target: &TargetHandle,
        source: SourceKind,
    ) -> RequestStatus {
        self.request(key.into(), target, source, None)
    }

    /// Like [`request_load`](Self::request_load), also returning a [`Completion`] that
    /// resolves once the result reached the display context, applied or not.
    pub fn request_load_with_completion(
        &self,
        key: impl Into<RequestKey>,
        target: &TargetHandle,
        source: SourceKind,
    ) -> Completion {
        let (tx, completion) = Completion::channel();
        self.request(key.into(), target, source, Some(tx));
        completion
    }

    fn request(
        &self,
        key: RequestKey,
        target: &TargetHandle,
        source: SourceKind,
        completion: Option<oneshot::Sender<LoadOutcome>>,
    ) -> RequestStatus {
        target.expect(key.clone());

        if let Some(image) = self.memory.get(&key) {
            debug!(%key, target = target.id(), "memory cache hit");
            self.dispatcher.deliver(Delivery {
                key,
                target: target.clone(),
                image: Some(image),
                completions: completion.into_iter().collect(),
            });
            return RequestStatus::MemoryHit;
        }

        let task = LoadTask {
            size: self.resolver.resolve(&target.bounds()),
            key,
            source,
        };
        self.scheduler
            .submit(task, target.clone(), completion)
            .into()
    }

    pub fn memory_cache(&self) -> &MemoryCache {
        &self.memory
    }

    pub fn disk_cache(&self) -> &DiskCache {
        &self.disk
    }

    pub fn queue_order(&self) -> QueueOrder {
        self.scheduler.order()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Drop queued work and wait for running loads to finish. Later requests are rejected.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}
