//! Integration tests for the device-independent parts of the renderer.

use std::fs;
use std::path::PathBuf;

use room_viewer_vk::config::Config;
use room_viewer_vk::image::{mip_extents, mip_levels};
use room_viewer_vk::mesh::Mesh;
use room_viewer_vk::scene::Scene;
use room_viewer_vk::sync::{FrameScheduler, ImagesInFlight};
use room_viewer_vk::MAX_FRAMES_IN_FLIGHT;

const SQUARE_OBJ: &str = "\
v 0.0 0.0 0.0
v 1.0 0.0 0.0
v 1.0 1.0 0.0
v 0.0 1.0 0.0
vt 0.0 0.0
vt 1.0 0.0
vt 1.0 1.0
vt 0.0 1.0
f 1/1 2/2 3/3
f 3/3 4/4 1/1
";

fn write_temp(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("{}-{}", std::process::id(), name));
    fs::write(&path, contents).expect("Failed to write temp file");
    path
}

#[test]
fn test_obj_shared_corners_are_indexed() {
    let path = write_temp("square.obj", SQUARE_OBJ);
    let mesh = Mesh::from_obj(&path).expect("Failed to load OBJ");
    fs::remove_file(&path).ok();

    assert_eq!(mesh.vertices.len(), 4, "Square should have four unique corners");
    assert_eq!(mesh.indices, vec![0, 1, 2, 2, 3, 0]);

    // V is flipped to match the image origin.
    assert_eq!(mesh.vertices[0].tex_coord, [0.0, 1.0]);
    assert_eq!(mesh.vertices[2].tex_coord, [1.0, 0.0]);
}

#[test]
fn test_missing_obj_is_an_error() {
    assert!(Mesh::from_obj("does/not/exist.obj").is_err());
}

#[test]
fn test_obj_without_faces_is_an_error() {
    let path = write_temp("points.obj", "v 0.0 0.0 0.0\nv 1.0 0.0 0.0\n");
    let result = Mesh::from_obj(&path);
    fs::remove_file(&path).ok();

    assert!(result.is_err(), "A model with no faces cannot be drawn");
}

#[test]
fn test_mip_chain_for_texture() {
    let levels = mip_levels(512, 300);
    let extents = mip_extents(512, 300);

    assert_eq!(levels, 10);
    assert_eq!(extents.len(), levels as usize);
    assert_eq!(extents.first(), Some(&(512, 300)));
    assert_eq!(extents.last(), Some(&(1, 1)));
    for pair in extents.windows(2) {
        let ((w0, h0), (w1, h1)) = (pair[0], pair[1]);
        assert_eq!(w1, (w0 / 2).max(1));
        assert_eq!(h1, (h0 / 2).max(1));
    }
}

#[test]
fn test_fence_slot_follows_frame_count() {
    // Image indices as a mailbox presentation engine might hand them out.
    let acquired = [0usize, 1, 2, 1, 0, 2, 2, 0, 1, 0];
    let mut scheduler = FrameScheduler::new(MAX_FRAMES_IN_FLIGHT);
    let mut images = ImagesInFlight::new(3);

    for (frame, image) in acquired.iter().enumerate() {
        let slot = scheduler.slot();
        assert_eq!(slot, frame % MAX_FRAMES_IN_FLIGHT);

        if let Some(owner) = images.claim(*image, slot) {
            assert_ne!(owner, slot);
        }
        assert_eq!(images.owner(*image), Some(slot));

        scheduler.advance();
    }
    assert_eq!(scheduler.frame_count(), acquired.len() as u64);
}

#[test]
fn test_config_file_and_scene_selection() {
    let path = write_temp(
        "config.toml",
        r#"
        [window]
        title = "Depth Test"

        [graphics]
        multisampling = false
        "#,
    );
    let config = Config::load_from_path(&path).expect("Failed to load config");
    fs::remove_file(&path).ok();

    assert_eq!(config.window.title, "Depth Test");
    assert!(!config.graphics.multisampling);

    let scene = Scene::from_args(["--quads"]).unwrap();
    let mesh = scene.load_mesh(&config.assets).unwrap();
    assert_eq!(mesh.vertices.len(), 8);
}
