//! Test server with in-memory backends, plus a local image origin.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode as AxumStatus;
use axum::routing::get;
use axum::Router;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use metrics_exporter_prometheus::PrometheusBuilder;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use image_jobs::app_state::AppState;
use image_jobs::db::MemoryJobStore;
use image_jobs::services::download::ImageDownloader;
use image_jobs::services::processor::Processor;
use image_jobs::services::queue::MemoryJobQueue;
use image_jobs::services::storage::MemoryBlobStore;
use image_jobs::services::transform::TransformOptions;
use image_jobs::worker::{PoolConfig, WorkerPool};

pub const BUCKET: &str = "test-bucket";
pub const PUBLIC_URL: &str = "https://storage.googleapis.com";

/// A running API server backed by in-memory store, queue and blob store.
pub struct TestApp {
    pub addr: SocketAddr,
    pub client: Client,
    pub store: Arc<MemoryJobStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub blobs: Arc<MemoryBlobStore>,
    pub pool: Option<WorkerPool>,
}

impl TestApp {
    /// API only; submitted jobs stay queued.
    pub async fn spawn() -> Self {
        Self::start(false).await
    }

    /// API plus an in-process worker pool.
    pub async fn spawn_with_worker() -> Self {
        Self::start(true).await
    }

    async fn start(with_worker: bool) -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryJobQueue::default());
        let blobs = Arc::new(MemoryBlobStore::new(BUCKET, PUBLIC_URL));

        let pool = with_worker.then(|| {
            let processor = Processor::new(
                store.clone(),
                blobs.clone(),
                ImageDownloader::new(Duration::from_secs(5)).unwrap(),
                TransformOptions::default(),
            );
            WorkerPool::start(queue.clone(), Arc::new(processor), worker_config())
        });

        let metrics = PrometheusBuilder::new().build_recorder().handle();
        let app = image_jobs::router(
            AppState::new(store.clone(), queue.clone()),
            Arc::new(metrics),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        Self {
            addr,
            client: Client::new(),
            store,
            queue,
            blobs,
            pool,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// POST /api/jobs with the given image URL.
    pub async fn submit(&self, image_url: &str) -> (Value, StatusCode) {
        self.submit_body(json!({ "imageUrl": image_url })).await
    }

    pub async fn submit_body(&self, body: Value) -> (Value, StatusCode) {
        let resp = self
            .client
            .post(self.url("/api/jobs"))
            .json(&body)
            .send()
            .await
            .expect("submit request failed");
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(json!(null));
        (body, status)
    }

    pub async fn get(&self, path: &str) -> (Value, StatusCode) {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .expect("get request failed");
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(json!(null));
        (body, status)
    }

    /// Poll the job until `done` accepts it or ten seconds pass.
    pub async fn wait_for(&self, job_id: &str, done: impl Fn(&Value) -> bool) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let (body, status) = self.get(&format!("/api/jobs/{job_id}")).await;
            assert_eq!(status, StatusCode::OK, "job lookup failed: {body}");
            if done(&body) {
                return body;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {job_id} never reached the expected state: {body}"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn shutdown(self) {
        if let Some(pool) = self.pool {
            pool.close().await;
        }
    }
}

pub fn worker_config() -> PoolConfig {
    PoolConfig {
        concurrency: 3,
        poll_interval: Duration::from_millis(20),
        ..PoolConfig::default()
    }
}

pub fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128u8])
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut std::io::Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

/// Serves `/photo.png` (1600×900) and 404 for everything else.
/// Returns the base URL.
pub async fn image_origin() -> String {
    let png = sample_png(1600, 900);
    let app = Router::new()
        .route(
            "/photo.png",
            get(move || {
                let png = png.clone();
                async move { ([("content-type", "image/png")], png) }
            }),
        )
        .fallback(|| async { AxumStatus::NOT_FOUND });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}")
}
