mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use image::GenericImageView;
use reqwest::StatusCode;

use common::{image_origin, TestApp, BUCKET};
use image_jobs::db::JobStore;
use image_jobs::models::job::JobStatus;
use image_jobs::services::download::ImageDownloader;
use image_jobs::services::processor::Processor;
use image_jobs::services::queue::{EnqueueOutcome, JobQueue, QueuedJob};
use image_jobs::services::transform::TransformOptions;
use image_jobs::worker::{PoolEvent, WorkerPool};

#[tokio::test]
async fn submit_returns_pending_job() {
    let app = TestApp::spawn().await;

    let (body, status) = app.submit("https://example.com/photo.png").await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["status"], "pending");
    assert_eq!(body["message"], "Job created successfully");

    let job_id = body["jobId"].as_str().unwrap();
    assert!(uuid::Uuid::parse_str(job_id).is_ok());
    assert!(app.queue.contains(job_id).await);

    let (job, status) = app.get(&format!("/api/jobs/{job_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["jobId"], job_id);
    assert_eq!(job["imageUrl"], "https://example.com/photo.png");
    assert_eq!(job["status"], "pending");
    assert_eq!(job["progress"], 0);
    assert!(job.get("resultUrl").is_none());
    assert!(job.get("error").is_none());
}

#[tokio::test]
async fn invalid_submissions_are_rejected() {
    let app = TestApp::spawn().await;

    let (body, status) = app.submit("not-a-url").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    assert!(body["timestamp"].is_string());

    let (body, status) = app
        .submit_body(serde_json::json!({ "url": "https://example.com/a.png" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    assert!(app.store.is_empty().await);
}

#[tokio::test]
async fn lookups_validate_and_report_missing_jobs() {
    let app = TestApp::spawn().await;

    let (body, status) = app.get("/api/jobs/not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let missing = uuid::Uuid::new_v4();
    let (body, status) = app.get(&format!("/api/jobs/{missing}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "JOB_NOT_FOUND");
}

#[tokio::test]
async fn concurrent_submissions_get_distinct_ids_and_paginate() {
    let app = TestApp::spawn().await;

    let submissions = (0..100).map(|i| {
        let app = &app;
        async move { app.submit(&format!("https://example.com/{i}.png")).await }
    });
    let results = join_all(submissions).await;

    let ids: HashSet<String> = results
        .iter()
        .map(|(body, status)| {
            assert_eq!(*status, StatusCode::CREATED, "{body}");
            body["jobId"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(ids.len(), 100);
    assert_eq!(app.store.len().await, 100);
    assert_eq!(app.queue.counts().await.unwrap().waiting, 100);

    let (body, status) = app.get("/api/jobs?page=3&limit=10").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 10);
    assert_eq!(
        body["pagination"],
        serde_json::json!({
            "page": 3,
            "limit": 10,
            "total": 100,
            "totalPages": 10,
            "hasNextPage": true,
            "hasPrevPage": true
        })
    );

    let (body, _) = app.get("/api/jobs").await;
    assert_eq!(body["pagination"]["page"], 1);
    assert_eq!(body["pagination"]["limit"], 20);
    assert_eq!(body["pagination"]["hasPrevPage"], false);
}

#[tokio::test]
async fn list_rejects_out_of_range_paging() {
    let app = TestApp::spawn().await;

    for query in ["page=0", "limit=0", "limit=101", "page=abc"] {
        let (body, status) = app.get(&format!("/api/jobs?{query}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{query}: {body}");
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }
}

#[tokio::test]
async fn queue_outage_marks_job_failed() {
    let app = TestApp::spawn().await;
    app.queue.close().await;

    let (body, status) = app.submit("https://example.com/photo.png").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "QUEUE_UNAVAILABLE");

    let (list, _) = app.get("/api/jobs").await;
    let job = &list["data"][0];
    assert_eq!(job["status"], "failed");
    assert!(job["error"]
        .as_str()
        .unwrap()
        .starts_with("Failed to enqueue job"));
}

#[tokio::test]
async fn health_reports_component_status() {
    let app = TestApp::spawn().await;

    let (body, status) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["checks"]["database"]["status"], "ok");
    assert_eq!(body["checks"]["queue"]["status"], "ok");

    app.queue.close().await;
    let (body, status) = app.get("/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["checks"]["queue"]["status"], "error");
}

#[tokio::test]
async fn metrics_endpoint_serves_text() {
    let app = TestApp::spawn().await;
    let resp = app.client.get(app.url("/metrics")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn submitted_job_is_processed_end_to_end() {
    let origin = image_origin().await;
    let app = TestApp::spawn_with_worker().await;

    let (body, status) = app.submit(&format!("{origin}/photo.png")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "pending");
    let job_id = body["jobId"].as_str().unwrap().to_string();

    let job = app
        .wait_for(&job_id, |job| job["status"] == "completed")
        .await;
    assert_eq!(job["progress"], 100);
    assert_eq!(job["step"], "complete");
    assert!(job.get("error").is_none());

    let result_url = job["resultUrl"].as_str().unwrap();
    assert!(result_url.contains(BUCKET));
    assert!(result_url.ends_with(&format!("processed/{job_id}.jpg")));

    let progress: Vec<u8> = app
        .store
        .updates(&job_id)
        .await
        .iter()
        .map(|u| u.progress)
        .collect();
    assert_eq!(progress, vec![25, 50, 75, 100]);

    let artifact = app.blobs.get(&format!("processed/{job_id}.jpg")).await.unwrap();
    assert!(artifact.public);
    let decoded = image::load_from_memory(&artifact.data).unwrap();
    assert_eq!(decoded.width(), 1200);
    assert_eq!(decoded.height(), 675);

    app.shutdown().await;
}

#[tokio::test]
async fn missing_source_ends_failed() {
    let origin = image_origin().await;
    let app = TestApp::spawn_with_worker().await;

    let (body, _) = app.submit(&format!("{origin}/missing.png")).await;
    let job_id = body["jobId"].as_str().unwrap().to_string();

    let job = app.wait_for(&job_id, |job| job["status"] == "failed").await;
    assert_eq!(job["progress"], 0);
    assert!(job.get("resultUrl").is_none());
    assert!(job["error"]
        .as_str()
        .unwrap()
        .starts_with("Failed to download image"));
    assert!(app.blobs.is_empty().await);

    app.shutdown().await;
}

#[tokio::test]
async fn duplicate_enqueue_runs_once() {
    let origin = image_origin().await;
    let app = TestApp::spawn().await;

    let job = QueuedJob {
        job_id: uuid::Uuid::new_v4().to_string(),
        image_url: format!("{origin}/photo.png"),
    };
    app.store.create(&job.job_id, &job.image_url).await.unwrap();
    assert_eq!(app.queue.enqueue(&job).await.unwrap(), EnqueueOutcome::Added);
    assert_eq!(app.queue.enqueue(&job).await.unwrap(), EnqueueOutcome::Duplicate);

    let processor = Processor::new(
        app.store.clone(),
        app.blobs.clone(),
        ImageDownloader::new(Duration::from_secs(5)).unwrap(),
        TransformOptions::default(),
    );
    let pool = WorkerPool::start(app.queue.clone(), Arc::new(processor), common::worker_config());
    let mut events = pool.subscribe();

    match tokio::time::timeout(Duration::from_secs(10), events.recv()).await {
        Ok(Ok(PoolEvent::Completed { job_id, .. })) => assert_eq!(job_id, job.job_id),
        other => panic!("expected completion, got {other:?}"),
    }

    // Give a second execution the chance to show up if one was scheduled.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(app.blobs.len().await, 1);

    let completions = app
        .store
        .updates(&job.job_id)
        .await
        .iter()
        .filter(|u| u.status == JobStatus::Completed)
        .count();
    assert_eq!(completions, 1);

    pool.close().await;
}
