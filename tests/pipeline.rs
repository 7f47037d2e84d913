//! End-to-end pipeline tests: real files in a temp directory, a real worker
//! thread, and assertions on slot state, disk write-back and events.

use std::path::{Path, PathBuf};
use std::time::Duration;

use image::{GenericImageView, Rgb};
use thumbkit::{GroupNode, Node, NodeEvent, PictureNode, RenderConfig, RenderQueue, SlotImage};

fn write_png(dir: &Path, name: &str, w: u32, h: u32, color: [u8; 3]) -> PathBuf {
    let path = dir.join(name);
    image::RgbImage::from_pixel(w, h, Rgb(color))
        .save(&path)
        .unwrap();
    path
}

fn test_config(dir: &Path) -> RenderConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let mut config = RenderConfig::with_preview_dir(dir.join("previews"));
    config.workers = 1;
    config.poll_interval = Duration::from_millis(10);
    config.preview_size = (100, 100);
    config
}

fn wait_until<F: Fn() -> bool>(predicate: F) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached within timeout");
}

#[test]
fn picture_render_writes_preview_and_notifies() {
    let dir = tempfile::tempdir().unwrap();
    let highres = write_png(dir.path(), "source.png", 400, 300, [200, 40, 40]);

    let queue = RenderQueue::new(test_config(dir.path()));
    let pic = PictureNode::new(&highres);
    let node = Node::picture(pic);
    let slot = queue.make_slot(node.clone());

    assert!(queue.enqueue(&slot, false));
    wait_until(|| slot.image().is_ready());

    // a fresh preview location was assigned and written
    let preview_path = node.lowres().expect("preview location assigned");
    assert!(preview_path.exists());
    let preview = image::open(&preview_path).unwrap();
    assert_eq!(preview.dimensions(), (100, 75));

    let events = queue.poll_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, NodeEvent::PreviewRelocated { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, NodeEvent::PreviewChanged(_))));
}

#[test]
fn second_request_reuses_preview_without_decoding() {
    let dir = tempfile::tempdir().unwrap();
    let highres = write_png(dir.path(), "source.png", 400, 300, [30, 160, 80]);

    let node = Node::picture(PictureNode::new(&highres));

    // first render produces the preview file
    {
        let queue = RenderQueue::new(test_config(dir.path()));
        let slot = queue.make_slot(node.clone());
        queue.enqueue(&slot, false);
        wait_until(|| slot.image().is_ready());
    }
    let preview_path = node.lowres().unwrap();
    let first_bytes = std::fs::read(&preview_path).unwrap();

    // a fresh queue has an empty decoded cache; reuse must keep it empty
    let queue = RenderQueue::new(test_config(dir.path()));
    let slot = queue.make_slot(node.clone());
    queue.enqueue(&slot, false);
    wait_until(|| slot.image().is_ready());

    assert!(queue.cache().is_empty(), "reuse must not decode the source");
    assert_eq!(std::fs::read(&preview_path).unwrap(), first_bytes);
}

#[test]
fn force_flag_regenerates_despite_current_preview() {
    let dir = tempfile::tempdir().unwrap();
    let highres = write_png(dir.path(), "source.png", 400, 300, [30, 60, 200]);

    let node = Node::picture(PictureNode::new(&highres));
    {
        let queue = RenderQueue::new(test_config(dir.path()));
        let slot = queue.make_slot(node.clone());
        queue.enqueue(&slot, false);
        wait_until(|| slot.image().is_ready());
    }

    let queue = RenderQueue::new(test_config(dir.path()));
    let slot = queue.make_slot(node.clone());
    queue.enqueue(&slot, true);
    wait_until(|| slot.image().is_ready());

    // the forced render decoded the highres source again
    assert_eq!(queue.cache().len(), 1);
}

#[test]
fn in_memory_mode_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let highres = write_png(dir.path(), "source.png", 400, 300, [120, 120, 20]);

    let mut config = test_config(dir.path());
    config.keep_previews_on_disk = false;
    let queue = RenderQueue::new(config);

    let node = Node::picture(PictureNode::new(&highres));
    let slot = queue.make_slot(node.clone());
    queue.enqueue(&slot, false);
    wait_until(|| slot.image().is_ready());

    assert_eq!(node.lowres(), None);
    assert!(!dir.path().join("previews").exists());
    assert!(queue.poll_events().is_empty());
}

#[test]
fn broken_marker_when_nothing_is_readable() {
    let dir = tempfile::tempdir().unwrap();
    let queue = RenderQueue::new(test_config(dir.path()));
    let node = Node::picture(PictureNode::new(dir.path().join("gone.png")));
    let slot = queue.make_slot(node);

    queue.enqueue(&slot, false);
    wait_until(|| slot.image().is_broken());
}

#[test]
fn retargeted_slot_shows_the_newer_source() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_png(dir.path(), "first.png", 400, 300, [250, 0, 0]);
    let second = write_png(dir.path(), "second.png", 300, 400, [0, 0, 250]);

    let queue = RenderQueue::new(test_config(dir.path()));
    let slot = queue.make_slot(Node::picture(PictureNode::new(&first)));
    queue.enqueue(&slot, false);

    // re-target immediately; the first render must not win
    slot.set_node(Some(Node::picture(PictureNode::new(&second))));
    queue.enqueue(&slot, false);

    wait_until(|| slot.image().is_ready());
    wait_until(|| !queue.is_busy());
    match slot.image() {
        SlotImage::Ready(img) => assert_eq!(img.dimensions(), (75, 100)),
        other => panic!("unexpected slot state {:?}", other),
    }
}

#[test]
fn second_group_request_reuses_collage() {
    let dir = tempfile::tempdir().unwrap();
    let group = GroupNode::new();
    for i in 0u8..2 {
        let path = write_png(dir.path(), &format!("g{}.png", i), 200, 150, [60, 60 + i, 90]);
        group.add_child(Node::picture(PictureNode::new(path)));
    }
    let node = Node::group(group);

    // the preview box is much smaller than the collage template, which must
    // not defeat reuse: the collage is persisted at template size
    let queue = RenderQueue::new(test_config(dir.path()));
    let slot = queue.make_slot(node.clone());
    queue.enqueue(&slot, false);
    wait_until(|| slot.image().is_ready());
    assert!(queue
        .poll_events()
        .iter()
        .any(|e| matches!(e, NodeEvent::PreviewChanged(_))));

    let slot = queue.make_slot(node.clone());
    queue.enqueue(&slot, false);
    wait_until(|| slot.image().is_ready());

    // the existing collage was reused, nothing was rewritten
    assert!(queue
        .poll_events()
        .iter()
        .all(|e| !matches!(e, NodeEvent::PreviewChanged(_))));
}

#[test]
fn group_collage_renders_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let group = GroupNode::new();
    for i in 0u8..3 {
        let path = write_png(dir.path(), &format!("c{}.png", i), 200, 150, [40 * i, 80, 120]);
        group.add_child(Node::picture(PictureNode::new(path)));
    }
    // a nested group must be skipped silently
    group.add_child(Node::group(GroupNode::new()));
    let node = Node::group(group);

    let config = test_config(dir.path());
    let template_size = config.collage.template_size;
    let queue = RenderQueue::new(config);
    let slot = queue.make_slot(node.clone());

    queue.enqueue(&slot, false);
    wait_until(|| slot.image().is_ready());

    let preview_path = node.lowres().expect("group preview location assigned");
    let preview = image::open(&preview_path).unwrap();
    assert_eq!(preview.dimensions(), template_size);
}
