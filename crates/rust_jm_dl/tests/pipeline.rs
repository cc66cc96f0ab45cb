//! Runs whole jobs against a mock api: metadata, download, decode, zip.

use rust_jm_dl::api::client::ApiClient;
use rust_jm_dl::api::crypto::encrypt_text;
use rust_jm_dl::config::{self, Config, OutputFormat};
use rust_jm_dl::errors::{JmError, TargetKind};
use rust_jm_dl::pipeline::Pipeline;
use rust_jm_dl::queue::JobPayload;
use rust_jm_dl::scramble::split_count;

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

use httpmock::prelude::*;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage, imageops};
use zip::ZipArchive;

const TS: i64 = 1_700_000_000_000;
const ALBUM: u64 = 300_000;
const THRESHOLD: u64 = 220_980;

fn envelope(json: &serde_json::Value) -> String {
    let data = encrypt_text(
        &json.to_string(),
        &TS.to_string(),
        &config::Client::default().data_secret,
    );
    format!(r#"{{"code":200,"data":"{data}"}}"#)
}

fn original(seed: u8) -> RgbImage {
    RgbImage::from_fn(4, 50, |x, y| Rgb([y as u8, seed, x as u8]))
}

/// Shuffles bands the way the site does before serving an image.
fn scramble(src: &RgbImage, n: u32) -> RgbImage {
    let (width, height) = src.dimensions();
    let (strip, rem) = (height / n, height % n);
    let mut out = RgbImage::new(width, height);

    for i in 0..n {
        let source_top = height - strip * (i + 1) - rem;
        let (dest_top, h) = if i == 0 { (0, strip + rem) } else { (strip * i + rem, strip) };
        let band = imageops::crop_imm(src, 0, dest_top, width, h).to_image();
        imageops::replace(&mut out, &band, 0, i64::from(source_top));
    }

    out
}

fn png(img: RgbImage) -> Vec<u8> {
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

fn pipeline(server: &MockServer, root: &Path) -> Pipeline {
    let mut cfg = Config::default();
    cfg.client.api_hosts = vec![server.base_url()];
    cfg.client.image_hosts = vec![server.base_url()];
    cfg.client.directory_urls = vec![];
    cfg.client.max_retries = 1;
    cfg.output.root = root.to_path_buf();
    cfg.output.format = OutputFormat::Zip;
    cfg.output.keep_cache = true;

    let api = ApiClient::new(&cfg.client).unwrap().with_clock(|| TS);
    Pipeline::with_api(api, cfg)
}

#[tokio::test]
async fn album_to_zip_then_rerun_from_cache() {
    let server = MockServer::start_async().await;

    let album = server
        .mock_async(|when, then| {
            when.method(POST).path("/album").query_param("id", ALBUM.to_string());
            then.status(200).body(envelope(&serde_json::json!({
                "id": ALBUM,
                "name": "Demo: Album",
                "series": [],
                "author": ["someone"],
            })));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/chapter").query_param("id", ALBUM.to_string());
            then.status(200).body(envelope(&serde_json::json!({
                "id": ALBUM.to_string(),
                "name": "Demo",
                "images": ["00001.png", "00002.png"],
            })));
        })
        .await;
    let threshold = server
        .mock_async(|when, then| {
            when.path("/chapter_view_template");
            then.status(200)
                .body(format!("<script>var scramble_id = {THRESHOLD};</script>"));
        })
        .await;

    let mut image_mocks = Vec::new();
    for (name, seed) in [("00001", 1u8), ("00002", 2u8)] {
        let strips = split_count(ALBUM, THRESHOLD, name);
        assert!(strips >= 2);

        let body = png(scramble(&original(seed), strips));
        image_mocks.push(
            server
                .mock_async(|when, then| {
                    when.method(GET).path(format!("/media/photos/{ALBUM}/{name}.png"));
                    then.status(200).body(body);
                })
                .await,
        );
    }

    let tmp = tempfile::tempdir().unwrap();
    let p = pipeline(&server, tmp.path());
    let job = JobPayload::new(TargetKind::Album, ALBUM.to_string(), "it");

    let delivery = p.run(&job).await.unwrap();
    let base = tmp.path().join("album/300000");
    assert_eq!(delivery.files.len(), 1);
    assert_eq!(delivery.files[0].parent(), Some(base.as_path()));

    let mut archive = ZipArchive::new(File::open(&delivery.files[0]).unwrap()).unwrap();
    let mut names: Vec<_> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["00001.png", "00002.png"]);

    for (name, seed) in [("00001.png", 1u8), ("00002.png", 2u8)] {
        let mut bytes = Vec::new();
        archive.by_name(name).unwrap().read_to_end(&mut bytes).unwrap();
        let restored = image::load_from_memory(&bytes).unwrap().to_rgb8();
        assert_eq!(restored, original(seed), "{name} wasn't restored");
    }

    // everything is cached now: metadata again, but no images and no threshold
    p.run(&job).await.unwrap();

    assert_eq!(album.hits_async().await, 2);
    assert_eq!(threshold.hits_async().await, 1);
    for m in &image_mocks {
        assert_eq!(m.hits_async().await, 1);
    }
}

#[tokio::test]
async fn unknown_album_is_not_found() {
    let server = MockServer::start_async().await;

    // an id the api doesn't know decrypts to nothing usable
    server
        .mock_async(|when, then| {
            when.path("/album");
            then.status(200).body(envelope(&serde_json::json!({ "name": null })));
        })
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let err = pipeline(&server, tmp.path())
        .run(&JobPayload::new(TargetKind::Album, "1", "it"))
        .await
        .unwrap_err();

    assert!(matches!(err, JmError::NotExist { kind: TargetKind::Album, .. }));
    assert_eq!(err.user_message(), "album 1 does not exist");
}

#[tokio::test]
async fn summary_skips_chapters() {
    let server = MockServer::start_async().await;

    server
        .mock_async(|when, then| {
            when.path("/album");
            then.status(200).body(envelope(&serde_json::json!({
                "id": "5",
                "name": "Five",
                "series": [
                    { "id": "6", "name": "a", "sort": "1" },
                    { "id": "7", "name": "b", "sort": "2" },
                ],
                "author": ["x", "y"],
                "actors": ["z"],
                "likes": "1.2K",
                "total_views": "300",
            })));
        })
        .await;
    let chapters = server
        .mock_async(|when, then| {
            when.path("/chapter");
            then.status(500);
        })
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let s = pipeline(&server, tmp.path()).album_summary(5).await.unwrap();

    assert_eq!(s.name, "Five");
    assert_eq!(s.chapter_count, 2);
    assert_eq!(s.authors, vec!["x", "y"]);
    assert_eq!(s.characters, vec!["z"]);
    assert_eq!(s.views, 300);
    assert_eq!(chapters.hits_async().await, 0);
}
