//! Background render queue and dispatcher.
//!
//! - Bounded worker pool draining a FIFO of render requests
//! - Callers enqueue and read slot state; they never block on decode or I/O
//! - Each request runs entirely inside its slot's render lock
//! - Completion and relocation notifications flow over an event channel

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use flume::{Receiver, Sender};
use image::DynamicImage;
use tracing::{debug, error, trace, warn};

use crate::cache::DecodedImageCache;
use crate::compose;
use crate::config::RenderConfig;
use crate::error::LoadError;
use crate::model::{GroupNode, Node, NodeEvent, PictureNode};
use crate::policy::{self, Decision, PreviewProbe, ReconcileInputs};
use crate::scaler;
use crate::slot::{Slot, SlotImage, SlotRef};

/// Maximum number of worker threads.
const MAX_WORKERS: usize = 4;

/// A request to render one slot's preview. Immutable once enqueued; the
/// ticket identifies the request generation for the slot.
pub struct RenderRequest {
    slot: SlotRef,
    force: bool,
    ticket: u64,
}

struct WorkerContext {
    config: Arc<RenderConfig>,
    events: Sender<NodeEvent>,
    oom_notified: Arc<AtomicBool>,
}

/// Worker queue for preview rendering.
pub struct RenderQueue {
    request_tx: Sender<RenderRequest>,
    event_rx: Receiver<NodeEvent>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    active_workers: Arc<AtomicUsize>,
    cache: DecodedImageCache,
    config: Arc<RenderConfig>,
}

impl RenderQueue {
    /// Start workers with a fresh decoded-image cache sized per `config`.
    pub fn new(config: RenderConfig) -> Self {
        let cache = DecodedImageCache::new(config.decoded_cache_bytes);
        Self::with_cache(config, cache)
    }

    /// Start workers sharing an existing decoded-image cache.
    pub fn with_cache(config: RenderConfig, cache: DecodedImageCache) -> Self {
        let config = Arc::new(config);
        let num_workers = config.workers.clamp(1, MAX_WORKERS);

        let (request_tx, request_rx) = flume::bounded::<RenderRequest>(config.queue_capacity.max(1));
        let (event_tx, event_rx) = flume::unbounded();

        let shutdown = Arc::new(AtomicBool::new(false));
        let active_workers = Arc::new(AtomicUsize::new(0));
        let oom_notified = Arc::new(AtomicBool::new(false));

        let mut worker_handles = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let rx = request_rx.clone();
            let shutdown = Arc::clone(&shutdown);
            let active = Arc::clone(&active_workers);
            let ctx = WorkerContext {
                config: Arc::clone(&config),
                events: event_tx.clone(),
                oom_notified: Arc::clone(&oom_notified),
            };

            let handle = thread::Builder::new()
                .name(format!("thumb-worker-{}", worker_id))
                .spawn(move || {
                    worker_loop(worker_id, rx, shutdown, active, ctx);
                })
                .expect("Failed to spawn render worker");
            worker_handles.push(handle);
        }

        debug!(num_workers, "Started render queue");

        Self {
            request_tx,
            event_rx,
            workers: worker_handles,
            shutdown,
            active_workers,
            cache,
            config,
        }
    }

    /// Create a slot bound to `node`, wired to this queue's decoded cache.
    pub fn make_slot(&self, node: Node) -> SlotRef {
        Slot::new(
            Some(node),
            self.config.preview_size,
            self.cache.clone(),
            self.config.decode_budget_bytes,
        )
    }

    /// Enqueue a render for `slot`.
    ///
    /// Supersedes any older in-flight request for the same slot: the epoch
    /// bump makes the older ticket stale and a load for a different source
    /// is aborted. Returns false when the slot has no node or the queue is
    /// full.
    pub fn enqueue(&self, slot: &SlotRef, force: bool) -> bool {
        let node = match slot.node() {
            Some(node) => node,
            None => {
                warn!("Enqueue on a slot with no node, marking broken");
                let ticket = slot.begin_request();
                slot.commit(ticket, SlotImage::Broken);
                return false;
            }
        };

        // snapshot for rollback: a rejected request must not discard what
        // the slot was showing before
        let previous = slot.image();
        let ticket = slot.begin_request();

        // coalescing: an older load for a different source must not keep
        // running once this request targets the slot
        match &node {
            Node::Picture(pic) => {
                slot.loader().stop_unless(pic.highres());
            }
            Node::Group(_) => slot.loader().stop(),
        }

        slot.commit(ticket, SlotImage::Loading);

        let request = RenderRequest {
            slot: Arc::clone(slot),
            force,
            ticket,
        };
        match self.request_tx.try_send(request) {
            Ok(()) => true,
            Err(flume::TrySendError::Full(request)) => {
                warn!("Render queue full, dropping request");
                request.slot.commit(ticket, previous);
                false
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                error!("Render queue disconnected");
                false
            }
        }
    }

    /// Drain pending events (non-blocking).
    pub fn poll_events(&self) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// A receiver handle for consumers that want to block on events.
    pub fn events(&self) -> Receiver<NodeEvent> {
        self.event_rx.clone()
    }

    /// The shared decoded-image cache.
    pub fn cache(&self) -> &DecodedImageCache {
        &self.cache
    }

    pub fn active_worker_count(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    pub fn is_busy(&self) -> bool {
        !self.request_tx.is_empty() || self.active_worker_count() > 0
    }

    /// Stop workers and wait for them to exit.
    pub fn shutdown(&mut self) {
        debug!("Shutting down render queue");
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        debug!("Render queue shutdown complete");
    }
}

impl Drop for RenderQueue {
    fn drop(&mut self) {
        if !self.shutdown.load(Ordering::Relaxed) {
            self.shutdown();
        }
    }
}

fn worker_loop(
    worker_id: usize,
    rx: Receiver<RenderRequest>,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    ctx: WorkerContext,
) {
    debug!(worker_id, "Render worker started");

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match rx.recv_timeout(ctx.config.poll_interval) {
            Ok(request) => {
                active.fetch_add(1, Ordering::Relaxed);
                process_request(&request, &ctx);
                active.fetch_sub(1, Ordering::Relaxed);
            }
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(worker_id, "Render worker stopped");
}

/// Run one request start to finish while holding the slot's render lock.
fn process_request(request: &RenderRequest, ctx: &WorkerContext) {
    let slot = &request.slot;
    let _gate = slot.render_lock();

    if !slot.is_current(request.ticket) {
        trace!("Skipping superseded request");
        return;
    }

    let node = match slot.node() {
        Some(node) => node,
        None => {
            slot.commit(request.ticket, SlotImage::Broken);
            return;
        }
    };

    match &node {
        Node::Picture(pic) => process_picture(slot, &node, pic, request, ctx),
        Node::Group(group) => process_group(slot, &node, group, request, ctx),
    }
}

fn process_picture(
    slot: &SlotRef,
    node: &Node,
    pic: &Arc<PictureNode>,
    request: &RenderRequest,
    ctx: &WorkerContext,
) {
    let config = &ctx.config;

    // a node without a preview location gets one assigned up front so the
    // write-back after rendering has a target
    if config.keep_previews_on_disk && pic.lowres().is_none() {
        assign_fresh_preview_path(node, pic.highres().to_path_buf(), ctx);
    }

    let preview_path = pic.lowres();
    let preview = preview_path.as_deref().and_then(PreviewProbe::probe);
    let source_modified = std::fs::metadata(pic.highres()).and_then(|m| m.modified());

    let source_modified = match source_modified {
        Ok(modified) => modified,
        Err(e) => {
            // the source is unreadable: any readable preview beats a broken
            // marker, recency and size notwithstanding
            debug!(highres = ?pic.highres(), error = %e, "Source unreadable, falling back to preview");
            match preview_path.as_deref().and_then(|p| image::open(p).ok()) {
                Some(image) => {
                    slot.commit(request.ticket, SlotImage::Ready(Arc::new(image)));
                }
                None => {
                    slot.commit(request.ticket, SlotImage::Broken);
                }
            }
            return;
        }
    };

    let decision = policy::reconcile(&ReconcileInputs {
        force: request.force,
        keep_previews_on_disk: config.keep_previews_on_disk,
        preview,
        source_modified: Some(source_modified),
        desired_size: slot.desired_size(),
        dont_enlarge_small_images: config.dont_enlarge_small_images,
        now: SystemTime::now(),
    });

    if decision == Decision::Reuse {
        if let Some(path) = preview_path.as_deref() {
            if let Ok(image) = image::open(path) {
                trace!(?path, "Reusing existing preview");
                slot.commit(request.ticket, SlotImage::Ready(Arc::new(image)));
                return;
            }
        }
        // unreadable after all, regenerate below
    }

    render_picture(slot, node, pic, request, ctx);
}

/// Decode the highres source, scale it, persist it and update the slot.
fn render_picture(
    slot: &SlotRef,
    node: &Node,
    pic: &Arc<PictureNode>,
    request: &RenderRequest,
    ctx: &WorkerContext,
) {
    let config = &ctx.config;

    let decoded = match slot.loader().load(pic.highres(), pic.rotation(), None) {
        Ok(decoded) => decoded,
        Err(LoadError::Cancelled) => {
            // a newer request owns the slot now; it will set the state
            trace!(highres = ?pic.highres(), "Render cancelled");
            return;
        }
        Err(e @ LoadError::OutOfMemory { .. }) => {
            warn!(highres = ?pic.highres(), error = %e, "Decode exceeded memory budget");
            notify_oom_once(ctx);
            slot.commit(request.ticket, SlotImage::Broken);
            return;
        }
        Err(e) => {
            warn!(highres = ?pic.highres(), error = %e, "Failed to load source");
            match pic.lowres().and_then(|p| image::open(p).ok()) {
                Some(image) => {
                    slot.commit(request.ticket, SlotImage::Ready(Arc::new(image)));
                }
                None => {
                    slot.commit(request.ticket, SlotImage::Broken);
                }
            }
            return;
        }
    };

    let scaled = scaler::scale_to_fit(
        decoded.image(),
        slot.desired_size(),
        config.scale_mode,
        config.dont_enlarge_small_images,
    );

    if !slot.is_current(request.ticket) {
        trace!("Render superseded after scale, discarding");
        return;
    }

    if config.keep_previews_on_disk {
        persist_preview(node, pic.highres().to_path_buf(), &scaled, ctx);
    }

    slot.commit(request.ticket, SlotImage::Ready(Arc::new(scaled)));
}

fn process_group(
    slot: &SlotRef,
    node: &Node,
    group: &Arc<GroupNode>,
    request: &RenderRequest,
    ctx: &WorkerContext,
) {
    let config = &ctx.config;

    if config.keep_previews_on_disk && group.lowres().is_none() {
        assign_fresh_preview_path(node, PathBuf::from("group"), ctx);
    }

    let preview_path = group.lowres();
    let preview = preview_path.as_deref().and_then(PreviewProbe::probe);

    // groups have no single source file, so staleness is skipped and only
    // readability and size decide reuse; the collage is persisted at the
    // template's size, so that is the size the preview is checked against
    let decision = policy::reconcile(&ReconcileInputs {
        force: request.force,
        keep_previews_on_disk: config.keep_previews_on_disk,
        preview,
        source_modified: None,
        desired_size: compose::collage_size(&config.collage),
        dont_enlarge_small_images: config.dont_enlarge_small_images,
        now: SystemTime::now(),
    });

    if decision == Decision::Reuse {
        if let Some(path) = preview_path.as_deref() {
            if let Ok(image) = image::open(path) {
                trace!(?path, "Reusing existing group preview");
                slot.commit(request.ticket, SlotImage::Ready(Arc::new(image)));
                return;
            }
        }
    }

    match compose::compose(group, config, slot.loader()) {
        Ok(collage) => {
            if !slot.is_current(request.ticket) {
                trace!("Group render superseded, discarding");
                return;
            }
            if config.keep_previews_on_disk {
                persist_preview(node, PathBuf::from("group"), &collage, ctx);
            }
            slot.commit(request.ticket, SlotImage::Ready(Arc::new(collage)));
        }
        Err(e) => {
            warn!(error = %e, "Failed to compose group preview");
            slot.commit(request.ticket, SlotImage::Broken);
        }
    }
}

/// Write the preview to the node's location; on failure reassign a fresh
/// path and retry once. A second failure skips persistence, the in-memory
/// result still reaches the slot.
fn persist_preview(node: &Node, source_hint: PathBuf, image: &DynamicImage, ctx: &WorkerContext) {
    let config = &ctx.config;
    let path = match node.lowres() {
        Some(path) => path,
        None => assign_fresh_preview_path(node, source_hint.clone(), ctx),
    };

    match scaler::write_jpeg(image, &path, config.jpeg_quality) {
        Ok(()) => {
            let _ = ctx.events.send(NodeEvent::PreviewChanged(node.clone()));
        }
        Err(e) => {
            warn!(?path, error = %e, "Preview not writable, reassigning location");
            let fresh = assign_fresh_preview_path(node, source_hint, ctx);
            match scaler::write_jpeg(image, &fresh, config.jpeg_quality) {
                Ok(()) => {
                    let _ = ctx.events.send(NodeEvent::PreviewChanged(node.clone()));
                }
                Err(e) => {
                    warn!(?fresh, error = %e, "Preview still not writable, skipping persistence");
                }
            }
        }
    }
}

fn assign_fresh_preview_path(node: &Node, source_hint: PathBuf, ctx: &WorkerContext) -> PathBuf {
    let path = ctx.config.fresh_preview_path(&source_hint);
    node.set_lowres(path.clone());
    let _ = ctx.events.send(NodeEvent::PreviewRelocated {
        node: node.clone(),
        path: path.clone(),
    });
    path
}

/// The out-of-memory notice is user visible and raised at most once per
/// queue lifetime; subsequent requests keep being served.
fn notify_oom_once(ctx: &WorkerContext) {
    if !ctx.oom_notified.swap(true, Ordering::SeqCst) {
        error!("A decode exceeded the memory budget; decoded-image cache cleared");
        let _ = ctx.events.send(NodeEvent::OutOfMemory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(dir: &std::path::Path) -> RenderConfig {
        let mut config = RenderConfig::with_preview_dir(dir.to_path_buf());
        config.workers = 1;
        config.poll_interval = Duration::from_millis(10);
        config.preview_size = (100, 100);
        config
    }

    fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..500 {
            if predicate() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached within timeout");
    }

    #[test]
    fn test_enqueue_without_node_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let queue = RenderQueue::new(test_config(dir.path()));
        let slot = Slot::new(
            None,
            (100, 100),
            queue.cache().clone(),
            64 * 1024 * 1024,
        );
        assert!(!queue.enqueue(&slot, false));
        assert!(slot.image().is_broken());
    }

    #[test]
    fn test_missing_source_and_preview_ends_broken() {
        let dir = tempfile::tempdir().unwrap();
        let queue = RenderQueue::new(test_config(dir.path()));
        let node = Node::picture(PictureNode::new(dir.path().join("missing.png")));
        let slot = queue.make_slot(node);
        assert!(queue.enqueue(&slot, false));
        wait_for(|| slot.image().is_broken());
    }

    #[test]
    fn test_full_queue_keeps_previous_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.queue_capacity = 1;
        let queue = RenderQueue::new(config);

        // park the lone worker on a slot whose render gate we hold
        let blocker = queue.make_slot(Node::picture(PictureNode::new(dir.path().join("a.png"))));
        let gate = blocker.render_lock();
        assert!(queue.enqueue(&blocker, false));
        wait_for(|| queue.active_worker_count() == 1);

        // fill the one-deep queue behind the parked worker
        let filler = queue.make_slot(Node::picture(PictureNode::new(dir.path().join("b.png"))));
        assert!(queue.enqueue(&filler, false));

        // a slot already showing a result keeps it when its request is
        // rejected, instead of being cleared to empty
        let shown = queue.make_slot(Node::picture(PictureNode::new(dir.path().join("c.png"))));
        let ticket = shown.begin_request();
        shown.commit(ticket, SlotImage::Ready(Arc::new(DynamicImage::new_rgba8(8, 8))));
        assert!(!queue.enqueue(&shown, false));
        assert!(shown.image().is_ready());

        drop(gate);
    }

    #[test]
    fn test_unreadable_source_falls_back_to_preview() {
        let dir = tempfile::tempdir().unwrap();
        let preview_path = dir.path().join("preview.jpg");
        image::RgbImage::new(100, 100).save(&preview_path).unwrap();

        let queue = RenderQueue::new(test_config(dir.path()));
        let node = Node::picture(
            PictureNode::new(dir.path().join("missing.png")).with_lowres(&preview_path),
        );
        let slot = queue.make_slot(node);
        queue.enqueue(&slot, false);
        wait_for(|| slot.image().is_ready());
    }
}
