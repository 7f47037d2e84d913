//! Picture and group nodes as seen from the pipeline.
//!
//! These are owned by the collection/tree layer; the pipeline reads the
//! source location and rotation and only ever writes the preview location,
//! and then only when a write target had to be reassigned. That mutation is
//! mirrored as a [`NodeEvent::PreviewRelocated`] message so collection-save
//! logic can synchronize instead of discovering a changed field.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

/// A single source picture: where the full-resolution file lives, where its
/// preview lives (if anywhere yet), and the rotation applied after decode.
#[derive(Debug)]
pub struct PictureNode {
    highres: PathBuf,
    rotation: f64,
    lowres: RwLock<Option<PathBuf>>,
}

impl PictureNode {
    pub fn new(highres: impl Into<PathBuf>) -> Self {
        Self {
            highres: highres.into(),
            rotation: 0.0,
            lowres: RwLock::new(None),
        }
    }

    /// Degrees 0-360, applied post-decode.
    pub fn with_rotation(mut self, degrees: f64) -> Self {
        self.rotation = degrees;
        self
    }

    pub fn with_lowres(self, lowres: impl Into<PathBuf>) -> Self {
        *self.lowres.write() = Some(lowres.into());
        self
    }

    pub fn highres(&self) -> &Path {
        &self.highres
    }

    pub fn rotation(&self) -> f64 {
        self.rotation
    }

    pub fn lowres(&self) -> Option<PathBuf> {
        self.lowres.read().clone()
    }

    pub fn set_lowres(&self, path: PathBuf) {
        *self.lowres.write() = Some(path);
    }
}

/// A container node. Only its direct picture children are sampled when a
/// collage preview is composed.
#[derive(Debug, Default)]
pub struct GroupNode {
    lowres: RwLock<Option<PathBuf>>,
    children: RwLock<Vec<Node>>,
}

impl GroupNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lowres(self, lowres: impl Into<PathBuf>) -> Self {
        *self.lowres.write() = Some(lowres.into());
        self
    }

    pub fn lowres(&self) -> Option<PathBuf> {
        self.lowres.read().clone()
    }

    pub fn set_lowres(&self, path: PathBuf) {
        *self.lowres.write() = Some(path);
    }

    pub fn add_child(&self, child: Node) {
        self.children.write().push(child);
    }

    /// Snapshot of the direct children in order.
    pub fn children(&self) -> Vec<Node> {
        self.children.read().clone()
    }

    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }
}

/// A node in the collection tree, cheap to clone and share with workers.
#[derive(Debug, Clone)]
pub enum Node {
    Picture(Arc<PictureNode>),
    Group(Arc<GroupNode>),
}

impl Node {
    pub fn picture(node: PictureNode) -> Self {
        Node::Picture(Arc::new(node))
    }

    pub fn group(node: GroupNode) -> Self {
        Node::Group(Arc::new(node))
    }

    pub fn as_picture(&self) -> Option<&Arc<PictureNode>> {
        match self {
            Node::Picture(p) => Some(p),
            Node::Group(_) => None,
        }
    }

    pub fn as_group(&self) -> Option<&Arc<GroupNode>> {
        match self {
            Node::Group(g) => Some(g),
            Node::Picture(_) => None,
        }
    }

    /// The node's current preview location, if any.
    pub fn lowres(&self) -> Option<PathBuf> {
        match self {
            Node::Picture(p) => p.lowres(),
            Node::Group(g) => g.lowres(),
        }
    }

    pub fn set_lowres(&self, path: PathBuf) {
        match self {
            Node::Picture(p) => p.set_lowres(path),
            Node::Group(g) => g.set_lowres(path),
        }
    }

    /// Pointer identity, used to correlate events with tree nodes.
    pub fn ptr_eq(&self, other: &Node) -> bool {
        match (self, other) {
            (Node::Picture(a), Node::Picture(b)) => Arc::ptr_eq(a, b),
            (Node::Group(a), Node::Group(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Notifications the pipeline emits towards the tree/UI model.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The node's preview file changed on disk; views should refresh.
    PreviewChanged(Node),
    /// The node's preview location was reassigned. Collection-save logic
    /// must persist the new location.
    PreviewRelocated { node: Node, path: PathBuf },
    /// A decode exceeded the memory budget; raised at most once per queue.
    OutOfMemory,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_picture_lowres_reassignment() {
        let pic = PictureNode::new("/pics/a.jpg").with_lowres("/thumbs/a.jpg");
        assert_eq!(pic.lowres(), Some(PathBuf::from("/thumbs/a.jpg")));
        pic.set_lowres(PathBuf::from("/thumbs/b.jpg"));
        assert_eq!(pic.lowres(), Some(PathBuf::from("/thumbs/b.jpg")));
    }

    #[test]
    fn test_group_children_order() {
        let group = GroupNode::new();
        group.add_child(Node::picture(PictureNode::new("/pics/1.jpg")));
        group.add_child(Node::group(GroupNode::new()));
        group.add_child(Node::picture(PictureNode::new("/pics/2.jpg")));

        let children = group.children();
        assert_eq!(children.len(), 3);
        assert!(children[0].as_picture().is_some());
        assert!(children[1].as_group().is_some());
        assert_eq!(
            children[2].as_picture().unwrap().highres(),
            Path::new("/pics/2.jpg")
        );
    }

    #[test]
    fn test_node_ptr_eq() {
        let a = Node::picture(PictureNode::new("/pics/a.jpg"));
        let b = a.clone();
        let c = Node::picture(PictureNode::new("/pics/a.jpg"));
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
    }
}
