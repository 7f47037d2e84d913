//! The observable holder for one node's currently displayed preview.
//!
//! A slot is owned by the view layer and handed to the pipeline by
//! reference. Workers hold the slot's render gate for the whole duration of
//! a request, so consumers only ever observe empty, loading, ready or
//! broken states, never a half-written image. Every enqueue bumps the
//! slot's epoch; a render holding a stale ticket must not commit, which is
//! what keeps a late first result from overwriting a newer second one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use image::{DynamicImage, GenericImageView};
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::trace;

use crate::cache::DecodedImageCache;
use crate::loader::SourceLoader;
use crate::model::Node;

/// What a slot currently shows.
#[derive(Clone, Default)]
pub enum SlotImage {
    /// Nothing rendered yet.
    #[default]
    Empty,
    /// A request is queued or in flight; views show a loading placeholder.
    Loading,
    /// A rendered preview.
    Ready(Arc<DynamicImage>),
    /// The source could not be rendered; views show a broken-image marker.
    Broken,
}

impl SlotImage {
    pub fn is_ready(&self) -> bool {
        matches!(self, SlotImage::Ready(_))
    }

    pub fn is_broken(&self) -> bool {
        matches!(self, SlotImage::Broken)
    }
}

impl std::fmt::Debug for SlotImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotImage::Empty => write!(f, "Empty"),
            SlotImage::Loading => write!(f, "Loading"),
            SlotImage::Ready(img) => write!(f, "Ready({}x{})", img.width(), img.height()),
            SlotImage::Broken => write!(f, "Broken"),
        }
    }
}

/// Callback invoked on every visible state transition.
pub type SlotObserver = Box<dyn Fn(&SlotImage) + Send + Sync>;

/// Shared handle to a slot.
pub type SlotRef = Arc<Slot>;

pub struct Slot {
    state: RwLock<SlotImage>,
    node: RwLock<Option<Node>>,
    desired_size: (u32, u32),
    render_gate: Mutex<()>,
    epoch: AtomicU64,
    loader: SourceLoader,
    observers: Mutex<Vec<SlotObserver>>,
}

impl Slot {
    /// Create a slot bound to `node`. The loader shares the process-wide
    /// decoded cache but tracks its own in-flight load so coalescing stays
    /// per slot.
    pub fn new(
        node: Option<Node>,
        desired_size: (u32, u32),
        cache: DecodedImageCache,
        decode_budget_bytes: u64,
    ) -> SlotRef {
        Arc::new(Self {
            state: RwLock::new(SlotImage::Empty),
            node: RwLock::new(node),
            desired_size,
            render_gate: Mutex::new(()),
            epoch: AtomicU64::new(0),
            loader: SourceLoader::new(cache, decode_budget_bytes),
            observers: Mutex::new(Vec::new()),
        })
    }

    pub fn image(&self) -> SlotImage {
        self.state.read().clone()
    }

    pub fn node(&self) -> Option<Node> {
        self.node.read().clone()
    }

    /// Point the slot at a different node. The epoch bump invalidates any
    /// render still in flight for the previous node.
    pub fn set_node(&self, node: Option<Node>) {
        *self.node.write() = node;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.loader.stop();
    }

    pub fn desired_size(&self) -> (u32, u32) {
        self.desired_size
    }

    /// The loader bound to this slot's in-flight work.
    pub fn loader(&self) -> &SourceLoader {
        &self.loader
    }

    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&SlotImage) + Send + Sync + 'static,
    {
        self.observers.lock().push(Box::new(observer));
    }

    /// Start a new request generation and return its ticket.
    pub fn begin_request(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Whether a ticket still represents the newest request for this slot.
    pub fn is_current(&self, ticket: u64) -> bool {
        self.current_epoch() == ticket
    }

    /// Exclusive access for the full duration of one render.
    pub fn render_lock(&self) -> MutexGuard<'_, ()> {
        self.render_gate.lock()
    }

    /// Write the slot state if `ticket` is still current. Returns whether
    /// the write happened; a superseded result is dropped silently.
    ///
    /// The ticket is checked under the state lock so the check and the
    /// write are one atomic step; a commit that passes the check cannot be
    /// preempted by a newer request between checking and writing.
    pub fn commit(&self, ticket: u64, image: SlotImage) -> bool {
        {
            let mut state = self.state.write();
            if !self.is_current(ticket) {
                trace!(ticket, epoch = self.current_epoch(), "Dropping stale slot commit");
                return false;
            }
            *state = image.clone();
        }
        // no lock is held while observers run, they may read the slot back
        for observer in self.observers.lock().iter() {
            observer(&image);
        }
        true
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("state", &*self.state.read())
            .field("desired_size", &self.desired_size)
            .field("epoch", &self.current_epoch())
            .finish()
    }
}
