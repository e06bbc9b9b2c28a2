mod common;
pub use common::*;

use std::sync::Arc;

use lightbox::dataset::{Payload, ReadOptions};
use lightbox::process::Export;
use lightbox::project::{DataKind, DataProject};
use lightbox::tiled::Block;

fn raw_opts() -> ReadOptions {
    ReadOptions {
        export: Export::Raw,
        resize: false,
        log: false,
        percentiles: (0.0, 100.0),
        downsample: false,
    }
}

fn first_value(payload: &Payload) -> f32 {
    match payload {
        Payload::Raw(Block::F32(a)) => *a.iter().next().unwrap(),
        other => panic!("expected a raw f32 block, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn read_order_matches_input_across_sources() {
    test_log();

    let client = Arc::new(
        MockTiledClient::new()
            .with_node("a", gradient_block(0.0, 3, 4, 4))
            .with_node("b", gradient_block(1000.0, 4, 4, 4)),
    );
    let project = tiled_project(client, &[("a", 3), ("b", 4)]);

    // Interleaved and unsorted on purpose.
    let indices = [5usize, 0, 3, 1, 6, 2];
    let (payloads, uris) = project.read(&indices, &raw_opts()).await.unwrap();

    assert_eq!(payloads.len(), indices.len());
    for (k, &g) in indices.iter().enumerate() {
        let expected = if g < 3 {
            (g * 16) as f32
        } else {
            1000.0 + ((g - 3) * 16) as f32
        };
        let payload = payloads[k].as_ref().expect("payload present");
        assert_eq!(first_value(payload), expected, "slot {} (global {})", k, g);
    }

    assert_eq!(
        uris[1].as_deref(),
        Some("http://tiled.test/api/v1/array/full/a?slice=0")
    );
    assert_eq!(
        uris[0].as_deref(),
        Some("http://tiled.test/api/v1/array/full/b?slice=2")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_source_blanks_only_its_slots() {
    test_log();

    let client = Arc::new(
        MockTiledClient::new()
            .with_node("a", gradient_block(0.0, 3, 4, 4))
            .with_node("b", gradient_block(1000.0, 4, 4, 4))
            .failing("b"),
    );
    let project = tiled_project(client, &[("a", 3), ("b", 4)]);

    let indices = [0usize, 4, 1, 5];
    let (payloads, uris) = project.read(&indices, &raw_opts()).await.unwrap();

    assert!(payloads[0].is_some());
    assert!(payloads[2].is_some());
    assert!(payloads[1].is_none(), "failed source must not fill slots");
    assert!(payloads[3].is_none());
    assert!(uris[1].is_none());
    assert_eq!(first_value(payloads[2].as_ref().unwrap()), 16.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn out_of_range_index_fails_the_whole_read() {
    test_log();

    let client = Arc::new(MockTiledClient::new().with_node("a", gradient_block(0.0, 3, 4, 4)));
    let project = tiled_project(client, &[("a", 3)]);

    assert!(project.read(&[0, 3], &raw_opts()).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn file_project_reads_as_jpeg_data_uris() {
    test_log();

    let dir = image_dir(&["b.png", "a.png", "c.png"]);
    let root = dir.path().to_string_lossy().to_string();

    let mut project = DataProject::new(DataKind::File, &root, None);
    project.datasets = project.browse("*.png", &[]).await.unwrap();
    assert_eq!(project.total(), 3);

    let (payloads, uris) = project
        .read(&[2, 0], &ReadOptions::default())
        .await
        .unwrap();

    // Listing is sorted, so global 0 is a.png and global 2 is c.png.
    assert!(uris[0].as_deref().unwrap().ends_with("c.png"));
    assert!(uris[1].as_deref().unwrap().ends_with("a.png"));
    for payload in &payloads {
        let encoded = payload
            .as_ref()
            .and_then(|p| p.as_encoded())
            .expect("encoded payload");
        assert!(encoded.starts_with("data:image/jpeg;base64,"));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn undecodable_file_blanks_its_source() {
    test_log();

    let dir = image_dir(&["a.png"]);
    std::fs::write(dir.path().join("broken.png"), b"not an image").unwrap();
    let root = dir.path().to_string_lossy().to_string();

    let mut project = DataProject::new(DataKind::File, &root, None);
    project.datasets = project.browse("*.png", &[]).await.unwrap();
    assert_eq!(project.total(), 2);

    let (payloads, _) = project
        .read(&[0, 1], &ReadOptions::default())
        .await
        .unwrap();

    // The decode failure belongs to the directory source as a whole; both
    // slots come back empty rather than the call erroring out.
    assert!(payloads.iter().all(|p| p.is_none()));
}

#[tokio::test(flavor = "multi_thread")]
async fn downsample_strides_only_the_trailing_spatial_axes() {
    test_log();

    let client = Arc::new(MockTiledClient::new().with_node("a", gradient_block(0.0, 2, 40, 40)));
    let project = tiled_project(client, &[("a", 2)]);

    let mut opts = raw_opts();
    opts.downsample = true;
    let (payloads, _) = project.read(&[0, 1], &opts).await.unwrap();

    for payload in &payloads {
        let block = payload.as_ref().unwrap().as_raw().unwrap();
        // 40 / stride 10 on both spatial axes.
        assert_eq!(block.shape(), &[4, 4]);
    }

    // Every 10th sample survives: value encodes (element, row, col).
    match payloads[0].as_ref().unwrap().as_raw().unwrap() {
        Block::F32(a) => {
            assert_eq!(a[[0, 0]], 0.0);
            assert_eq!(a[[0, 1]], 10.0);
            assert_eq!(a[[1, 0]], 400.0);
        }
        other => panic!("expected f32 block, got {:?}", other),
    }
    match payloads[1].as_ref().unwrap().as_raw().unwrap() {
        Block::F32(a) => assert_eq!(a[[0, 0]], 1600.0),
        other => panic!("expected f32 block, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn downsample_leaves_the_channel_axis_alone() {
    test_log();

    let block = Block::F32(ndarray::ArrayD::zeros(ndarray::IxDyn(&[2, 3, 40, 40])));
    let client = Arc::new(MockTiledClient::new().with_node("a", block));
    let project = tiled_project(client, &[("a", 2)]);

    let mut opts = raw_opts();
    opts.downsample = true;
    let (payloads, _) = project.read(&[1], &opts).await.unwrap();

    let block = payloads[0].as_ref().unwrap().as_raw().unwrap();
    assert_eq!(block.shape(), &[3, 4, 4]);
}

#[tokio::test(flavor = "multi_thread")]
async fn tiled_browse_expands_containers_and_counts() {
    test_log();

    let client = Arc::new(
        MockTiledClient::new()
            .with_node("run1/recon", gradient_block(0.0, 5, 4, 4))
            .with_node("run2/recon", gradient_block(0.0, 2, 4, 4)),
    );
    let project = DataProject::new(DataKind::Tiled, MOCK_URI, None).with_client(client);

    let datasets = project
        .browse("", &["run1".to_string(), "run2".to_string()])
        .await
        .unwrap();

    assert_eq!(datasets.len(), 2);
    assert_eq!(datasets[0].uri(), "run1/recon");
    assert_eq!(datasets[0].cumulative_data_count(), 5);
    assert_eq!(datasets[1].uri(), "run2/recon");
    assert_eq!(datasets[1].cumulative_data_count(), 7);
}
