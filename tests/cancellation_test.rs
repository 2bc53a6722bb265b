#![cfg(target_os = "linux")]

use cluster_backend::config::AnalysisConfig;
use cluster_backend::models::{IncomingFile, UploadRequest};
use cluster_backend::services::engine::ProcessEngine;
use cluster_backend::services::orchestrator::AnalysisService;
use cluster_backend::services::staging::LocalStagingStore;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};

/// Client that sends the first rows and then goes quiet
struct StalledBody {
    first: Option<&'static [u8]>,
}

impl AsyncRead for StalledBody {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.first.take() {
            Some(bytes) => {
                buf.put_slice(bytes);
                Poll::Ready(Ok(()))
            }
            None => Poll::Pending,
        }
    }
}

/// Dead or reaped-pending (zombie) both count as gone
fn process_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z"),
        Err(_) => false,
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn upload() -> UploadRequest<'static> {
    UploadRequest::with_file(IncomingFile {
        original_filename: Some("friends.csv".to_string()),
        content_type: Some("text/csv".to_string()),
        declared_size: None,
        body: Box::new(std::io::Cursor::new(
            b"name,teamwork_preference\nAlice,8\n".to_vec(),
        )),
    })
}

fn staged_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

#[tokio::test]
async fn test_abandoned_request_kills_engine_and_releases_file() {
    let dir = tempfile::tempdir().unwrap();
    let uploads = dir.path().join("uploads");
    std::fs::create_dir_all(&uploads).unwrap();
    let pid_file = dir.path().join("engine.pid");

    let script = dir.path().join("engine.sh");
    std::fs::write(
        &script,
        format!("echo $$ > '{}'\nexec sleep 30\n", pid_file.display()),
    )
    .unwrap();

    let config = AnalysisConfig {
        upload_dir: uploads.clone(),
        engine_program: "sh".to_string(),
        engine_args: vec![script.to_string_lossy().into_owned()],
        engine_timeout_secs: 60,
        ..AnalysisConfig::default()
    };
    let store = Arc::new(LocalStagingStore::new(&uploads, 1024 * 1024));
    let engine = Arc::new(ProcessEngine::from_config(&config));
    let service = Arc::new(AnalysisService::new(store, engine, &config));

    let task = {
        let service = service.clone();
        tokio::spawn(async move { service.analyze(upload()).await })
    };

    assert!(
        wait_until(|| std::fs::read_to_string(&pid_file).is_ok_and(|s| s.ends_with('\n'))).await,
        "engine never started"
    );
    let pid: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(process_alive(pid));
    assert_eq!(staged_count(&uploads), 1);

    // Client went away
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    assert!(wait_until(|| !process_alive(pid)).await, "engine still running");
    assert!(
        wait_until(|| staged_count(&uploads) == 0).await,
        "staged file left behind"
    );
}

#[tokio::test]
async fn test_timed_out_engine_is_terminated() {
    let dir = tempfile::tempdir().unwrap();
    let uploads = dir.path().join("uploads");
    std::fs::create_dir_all(&uploads).unwrap();
    let pid_file = dir.path().join("engine.pid");

    let script = dir.path().join("engine.sh");
    std::fs::write(
        &script,
        format!("echo $$ > '{}'\nexec sleep 30\n", pid_file.display()),
    )
    .unwrap();

    let config = AnalysisConfig {
        upload_dir: uploads.clone(),
        engine_program: "sh".to_string(),
        engine_args: vec![script.to_string_lossy().into_owned()],
        engine_timeout_secs: 1,
        ..AnalysisConfig::default()
    };
    let store = Arc::new(LocalStagingStore::new(&uploads, 1024 * 1024));
    let engine = Arc::new(ProcessEngine::from_config(&config));
    let service = AnalysisService::new(store, engine, &config);

    let err = service.analyze(upload()).await.unwrap_err();
    assert_eq!(err.code(), "ENGINE_TIMEOUT");

    let pid: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(!process_alive(pid));
    assert_eq!(staged_count(&uploads), 0);
}

#[tokio::test]
async fn test_abandoned_upload_leaves_no_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    let uploads = dir.path().join("uploads");
    std::fs::create_dir_all(&uploads).unwrap();

    let config = AnalysisConfig {
        upload_dir: uploads.clone(),
        engine_program: "/nonexistent/python".to_string(),
        ..AnalysisConfig::default()
    };
    let store = Arc::new(LocalStagingStore::new(&uploads, 1024 * 1024));
    let engine = Arc::new(ProcessEngine::from_config(&config));
    let service = Arc::new(AnalysisService::new(store, engine, &config));

    let task = {
        let service = service.clone();
        tokio::spawn(async move {
            let request = UploadRequest::with_file(IncomingFile {
                original_filename: Some("friends.csv".to_string()),
                content_type: Some("text/csv".to_string()),
                declared_size: None,
                body: Box::new(StalledBody {
                    first: Some(b"name\nAlice\n"),
                }),
            });
            service.analyze(request).await
        })
    };

    assert!(
        wait_until(|| staged_count(&uploads) == 1).await,
        "upload never reached staging"
    );

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    assert!(
        wait_until(|| staged_count(&uploads) == 0).await,
        "partial upload left behind"
    );
}
