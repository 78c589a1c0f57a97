use crack_vision::ingest::save_png;
use crack_vision::{
    AlignmentControl, CapabilityLoader, ControllerConfig, EngineConfig, Frame, ImageLocator, SessionController,
    SessionOutput, SessionStatus,
};
use image::{GrayImage, Luma};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;

/// Overlapping flat rectangles: plenty of corners for the detector.
fn wall_texture(seed: u64) -> GrayImage {
    wall_texture_sized(seed, WIDTH, HEIGHT)
}

/// Same rectangle sizes at any canvas size, with the count scaled to the area.
fn wall_texture_sized(seed: u64, width: u32, height: u32) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut img = GrayImage::from_pixel(width, height, Luma([128]));
    let count = 80 * (width * height) / (WIDTH * HEIGHT);
    for _ in 0..count {
        let w = rng.gen_range(10..WIDTH / 4);
        let h = rng.gen_range(10..HEIGHT / 4);
        let x0 = rng.gen_range(0..width - w);
        let y0 = rng.gen_range(0..height - h);
        let v: u8 = rng.r#gen();
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                img.put_pixel(x, y, Luma([v]));
            }
        }
    }
    img
}

fn to_frame(gray: &GrayImage) -> Frame {
    Frame::from(image::DynamicImage::ImageLuma8(gray.clone()).to_rgba8())
}

fn write(dir: &Path, name: &str, gray: &GrayImage) -> PathBuf {
    let path = dir.join(name);
    save_png(&to_frame(gray), &path).expect("write test image");
    path
}

type Results = mpsc::UnboundedReceiver<Option<SessionOutput>>;

fn controller() -> (SessionController, Results) {
    controller_with(Arc::new(CapabilityLoader::with_config(EngineConfig {
        threads: 2,
        pattern_seed: 7,
    })))
}

fn controller_with(loader: Arc<CapabilityLoader>) -> (SessionController, Results) {
    let (tx, rx) = mpsc::unbounded_channel();
    let controller = SessionController::new(Handle::current(), loader, ControllerConfig::default(), move |out| {
        let _ = tx.send(out);
    });
    (controller, rx)
}

#[tokio::test]
async fn same_wall_at_two_paths_shows_little_change() {
    let dir = tempfile::tempdir().expect("tempdir");
    let texture = wall_texture(1);
    let reference = write(dir.path(), "before.png", &texture);
    let current = write(dir.path(), "after.png", &texture);
    let (controller, mut results) = controller();

    controller.set_inputs(reference, current);
    assert!(controller.is_busy());

    match results.recv().await.expect("answered") {
        Some(SessionOutput::Overlay(overlay)) => {
            assert_eq!(overlay.frame.dimensions(), (WIDTH, HEIGHT));
            assert!(overlay.changed_pixels * 20 < (WIDTH * HEIGHT) as usize);
        }
        other => panic!("expected an overlay, got {other:?}"),
    }
    assert_eq!(controller.status(), SessionStatus::Complete);
    assert!(!controller.is_busy());
}

#[tokio::test]
async fn new_crack_is_highlighted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let texture = wall_texture(2);
    let mut cracked = texture.clone();
    for y in 120..126 {
        for x in 40..280 {
            let v = texture.get_pixel(x, y)[0];
            cracked.put_pixel(x, y, Luma([if v < 128 { 255 } else { 0 }]));
        }
    }
    let reference = write(dir.path(), "before.png", &texture);
    let current = write(dir.path(), "after.png", &cracked);
    let (controller, mut results) = controller();

    controller.set_inputs(reference, current);
    match results.recv().await.expect("answered") {
        Some(SessionOutput::Overlay(overlay)) => {
            assert!(overlay.changed_pixels >= 1000, "changed {}", overlay.changed_pixels);
            assert!(overlay.frame.pixel(160, 123)[2] >= 128);
        }
        other => panic!("expected an overlay, got {other:?}"),
    }
}

#[tokio::test]
async fn replacing_inputs_answers_the_old_session_with_none_first() {
    let dir = tempfile::tempdir().expect("tempdir");
    let reference = write(dir.path(), "a.png", &wall_texture(3));
    let current = write(dir.path(), "b.png", &wall_texture(4));
    let (controller, mut results) = controller();

    controller.set_inputs(reference.clone(), current);
    controller.set_inputs(reference.clone(), reference.clone());

    assert_eq!(results.recv().await.expect("first"), None);
    assert_eq!(
        results.recv().await.expect("second"),
        Some(SessionOutput::Reference(ImageLocator::from(reference)))
    );
    assert_eq!(controller.status(), SessionStatus::Complete);
}

#[tokio::test]
async fn superseding_while_aligning_answers_none_then_replacement() {
    let dir = tempfile::tempdir().expect("tempdir");
    let wide = wall_texture_sized(8, 1200, 900);
    let slow_reference = write(dir.path(), "wide_a.png", &wide);
    let slow_current = write(dir.path(), "wide_b.png", &wide);
    let texture = wall_texture(10);
    let reference = write(dir.path(), "before.png", &texture);
    let current = write(dir.path(), "after.png", &texture);
    let (controller, mut results) = controller_with(Arc::new(CapabilityLoader::with_config(EngineConfig {
        threads: 1,
        pattern_seed: 7,
    })));

    controller.set_inputs(slow_reference, slow_current);
    let mut polls = 0;
    loop {
        match controller.status() {
            SessionStatus::Aligning => break,
            SessionStatus::LoadingImages => {}
            other => panic!("left loading without being seen aligning: {other}"),
        }
        polls += 1;
        assert!(polls < 3000, "never reached aligning");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    controller.set_inputs(reference, current);
    assert_eq!(results.recv().await.expect("first"), None);
    match results.recv().await.expect("second") {
        Some(SessionOutput::Overlay(overlay)) => assert_eq!(overlay.frame.dimensions(), (WIDTH, HEIGHT)),
        other => panic!("expected the replacement's overlay, got {other:?}"),
    }

    // The superseded context has released the engine by now; its answer must stay unsent.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(results.try_recv().is_err());
    assert_eq!(controller.status(), SessionStatus::Complete);
    assert!(!controller.is_busy());
}

#[tokio::test]
async fn session_waits_in_loading_until_the_engine_is_ready() {
    let dir = tempfile::tempdir().expect("tempdir");
    let texture = wall_texture(11);
    let reference = write(dir.path(), "before.png", &texture);
    let current = write(dir.path(), "after.png", &texture);
    let (go_tx, go_rx) = std::sync::mpsc::channel::<()>();
    let go_rx = Mutex::new(go_rx);
    let loader = Arc::new(CapabilityLoader::new(move || {
        let _ = go_rx.lock().map(|rx| rx.recv());
        crack_vision::VisionEngine::build(&EngineConfig {
            threads: 2,
            pattern_seed: 7,
        })
    }));
    let (controller, mut results) = controller_with(loader.clone());

    controller.set_inputs(reference, current);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(controller.status(), SessionStatus::LoadingImages);
    assert!(controller.is_busy());
    assert!(!loader.is_ready());
    assert!(results.try_recv().is_err());

    go_tx.send(()).expect("loader waiting");
    match results.recv().await.expect("answered") {
        Some(SessionOutput::Overlay(overlay)) => assert!(overlay.changed_pixels * 20 < (WIDTH * HEIGHT) as usize),
        other => panic!("expected an overlay, got {other:?}"),
    }
    assert!(loader.is_ready());
    assert_eq!(controller.status(), SessionStatus::Complete);
}

#[tokio::test]
async fn featureless_photos_report_insufficient_matches() {
    let dir = tempfile::tempdir().expect("tempdir");
    let reference = write(dir.path(), "flat_a.png", &GrayImage::from_pixel(200, 150, Luma([90])));
    let current = write(dir.path(), "flat_b.png", &GrayImage::from_pixel(200, 150, Luma([95])));
    let (controller, mut results) = controller();

    controller.set_inputs(reference, current);
    assert_eq!(results.recv().await.expect("answered"), None);
    let status = controller.status().to_string();
    assert!(status.starts_with("error: alignment failed (insufficient-matches)"), "{status}");
}

#[tokio::test]
async fn missing_file_reports_load_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let reference = write(dir.path(), "a.png", &wall_texture(5));
    let (controller, mut results) = controller();

    controller.set_inputs(reference, dir.path().join("missing.png"));
    assert_eq!(results.recv().await.expect("answered"), None);
    assert!(controller.status().to_string().starts_with("error: failed to read"));
}

#[tokio::test]
async fn control_surface_is_object_safe() {
    let (controller, mut results) = controller();
    let control: &dyn AlignmentControl = &controller;
    control.abort();
    assert_eq!(control.status(), SessionStatus::Idle);
    assert!(!control.is_busy());
    assert!(results.try_recv().is_err());
}
