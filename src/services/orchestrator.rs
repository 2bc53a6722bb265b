use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::Instrument;

use crate::config::AnalysisConfig;
use crate::models::{ClusterResult, UploadRequest};
use crate::services::decoder::{self, DecodeError};
use crate::services::engine::{AnalysisEngine, EngineError};
use crate::services::staging::{StagedFile, StagingError, StagingLease, StagingStore};
use crate::utils::validation::{DatasetPolicy, Rejection, validate_dataset};

/// Pipeline position of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Received,
    Validating,
    Staging,
    Invoking,
    Decoding,
    Responding,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Received => "received",
            PipelineStage::Validating => "validating",
            PipelineStage::Staging => "staging",
            PipelineStage::Invoking => "invoking",
            PipelineStage::Decoding => "decoding",
            PipelineStage::Responding => "responding",
        };
        f.write_str(name)
    }
}

/// Who is responsible for a failed analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Input,
    Storage,
    Engine,
    Contract,
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Input(#[from] Rejection),

    #[error(transparent)]
    Storage(StagingError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Contract(#[from] DecodeError),
}

impl From<StagingError> for AnalysisError {
    fn from(e: StagingError) -> Self {
        match e {
            // Oversized bodies are the caller's problem, not the disk's
            StagingError::TooLarge { max } => AnalysisError::Input(Rejection::FileTooLarge {
                size: max.saturating_add(1),
                max,
            }),
            // So is a body stream that broke off mid-upload
            StagingError::Upload { source } => {
                AnalysisError::Input(Rejection::IncompleteUpload(source.to_string()))
            }
            other => AnalysisError::Storage(other),
        }
    }
}

impl AnalysisError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AnalysisError::Input(_) => ErrorClass::Input,
            AnalysisError::Storage(_) => ErrorClass::Storage,
            AnalysisError::Engine(_) => ErrorClass::Engine,
            AnalysisError::Contract(_) => ErrorClass::Contract,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AnalysisError::Input(rejection) => rejection.code(),
            AnalysisError::Storage(_) => "STAGING_IO_ERROR",
            AnalysisError::Engine(EngineError::Launch { .. }) => "ENGINE_LAUNCH_ERROR",
            AnalysisError::Engine(EngineError::Timeout(_)) => "ENGINE_TIMEOUT",
            AnalysisError::Engine(EngineError::Crashed { .. }) => "ENGINE_CRASHED",
            AnalysisError::Engine(EngineError::OutputOverflow { .. }) => "ENGINE_OUTPUT_OVERFLOW",
            AnalysisError::Engine(EngineError::Io(_)) => "ENGINE_IO_ERROR",
            AnalysisError::Contract(_) => "MALFORMED_OUTPUT",
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.class() == ErrorClass::Input
    }
}

/// Runs validate → stage → invoke → decode for one upload at a time per call.
/// Calls are independent and may run concurrently.
pub struct AnalysisService {
    store: Arc<dyn StagingStore>,
    engine: Arc<dyn AnalysisEngine>,
    policy: DatasetPolicy,
    timeout: Duration,
}

impl AnalysisService {
    pub fn new(
        store: Arc<dyn StagingStore>,
        engine: Arc<dyn AnalysisEngine>,
        config: &AnalysisConfig,
    ) -> Self {
        Self {
            store,
            engine,
            policy: DatasetPolicy::from(config),
            timeout: config.engine_timeout(),
        }
    }

    pub fn engine(&self) -> &Arc<dyn AnalysisEngine> {
        &self.engine
    }

    pub async fn analyze(&self, request: UploadRequest<'_>) -> Result<ClusterResult, AnalysisError> {
        let mut stage = PipelineStage::Received;
        let span = tracing::info_span!("analysis", staged_id = tracing::field::Empty);

        let outcome = self
            .run(request, &mut stage)
            .instrument(span.clone())
            .await;

        span.in_scope(|| match &outcome {
            Ok(result) => tracing::info!(
                clusters = result.clusters.len(),
                members = result.member_count(),
                "Analysis completed"
            ),
            Err(e) if e.is_client_error() => {
                tracing::warn!(stage = %stage, code = e.code(), "Upload rejected: {}", e)
            }
            Err(e) => tracing::error!(stage = %stage, code = e.code(), "Analysis failed: {}", e),
        });
        outcome
    }

    async fn run(
        &self,
        request: UploadRequest<'_>,
        stage: &mut PipelineStage,
    ) -> Result<ClusterResult, AnalysisError> {
        *stage = PipelineStage::Validating;
        let accepted = validate_dataset(&request, &self.policy)?;
        let Some(file) = request.file else {
            return Err(Rejection::NoFileProvided.into());
        };

        *stage = PipelineStage::Staging;
        let staged = self.store.stage(file.body, &accepted.filename).await?;
        tracing::Span::current().record("staged_id", staged.id.as_str());
        tracing::info!(
            filename = %accepted.filename,
            size = staged.size,
            sha256 = %staged.sha256,
            "Dataset staged"
        );

        // Released on every path out of here, success included
        let lease = StagingLease::new(self.store.clone(), staged);
        let outcome = self.invoke_and_decode(lease.file(), stage).await;
        lease.release().await;

        if outcome.is_ok() {
            *stage = PipelineStage::Responding;
        }
        outcome
    }

    async fn invoke_and_decode(
        &self,
        staged: &StagedFile,
        stage: &mut PipelineStage,
    ) -> Result<ClusterResult, AnalysisError> {
        *stage = PipelineStage::Invoking;
        let invocation = self.engine.invoke(staged, self.timeout).await?;

        *stage = PipelineStage::Decoding;
        decoder::decode(&invocation.stdout).map_err(|e| {
            tracing::error!(
                pid = ?invocation.pid,
                "Engine output rejected ({}): {}",
                e.reason,
                e.raw_excerpt(512)
            );
            AnalysisError::from(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IncomingFile;
    use crate::services::engine::AnalysisInvocation;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncRead;

    #[derive(Default)]
    struct CountingStore {
        staged: AtomicUsize,
        released: Mutex<Vec<String>>,
        fail_stage: bool,
    }

    #[async_trait]
    impl StagingStore for CountingStore {
        async fn stage<'a>(
            &self,
            _reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
            original_filename: &str,
        ) -> Result<StagedFile, StagingError> {
            if self.fail_stage {
                return Err(StagingError::Io {
                    path: PathBuf::from("/full"),
                    source: std::io::Error::other("disk full"),
                });
            }
            let n = self.staged.fetch_add(1, Ordering::SeqCst);
            Ok(StagedFile {
                id: format!("staged-{}", n),
                path: PathBuf::from(format!("/staging/{}", original_filename)),
                original_extension: "csv".to_string(),
                size: 0,
                sha256: String::new(),
            })
        }

        async fn release(&self, staged: &StagedFile) -> Result<(), StagingError> {
            self.released.lock().unwrap().push(staged.id.clone());
            Ok(())
        }
    }

    enum Script {
        Stdout(&'static str),
        Fail(fn() -> EngineError),
    }

    struct ScriptedEngine {
        script: Script,
        calls: AtomicUsize,
    }

    impl ScriptedEngine {
        fn new(script: Script) -> Self {
            Self {
                script,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AnalysisEngine for ScriptedEngine {
        async fn invoke(
            &self,
            _staged: &StagedFile,
            _timeout: Duration,
        ) -> Result<AnalysisInvocation, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                Script::Stdout(out) => Ok(AnalysisInvocation {
                    pid: None,
                    stdout: out.as_bytes().to_vec(),
                    stderr: Vec::new(),
                    status: success_status(),
                    elapsed: Duration::ZERO,
                }),
                Script::Fail(make) => Err(make()),
            }
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    #[cfg(unix)]
    fn success_status() -> std::process::ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(0)
    }

    #[cfg(windows)]
    fn success_status() -> std::process::ExitStatus {
        use std::os::windows::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(0)
    }

    fn csv_upload() -> UploadRequest<'static> {
        UploadRequest::with_file(IncomingFile {
            original_filename: Some("friends.csv".to_string()),
            content_type: Some("text/csv".to_string()),
            declared_size: None,
            body: Box::new(std::io::Cursor::new(b"name\nAlice\n".to_vec())),
        })
    }

    fn service(store: Arc<CountingStore>, engine: Arc<ScriptedEngine>) -> AnalysisService {
        AnalysisService::new(store, engine, &AnalysisConfig::default())
    }

    #[tokio::test]
    async fn test_success_releases_once() {
        let store = Arc::new(CountingStore::default());
        let engine = Arc::new(ScriptedEngine::new(Script::Stdout(
            r#"{"clusters":[{"name":["Alice","Charlie"]},{"name":["Bob"]}]}"#,
        )));

        let result = service(store.clone(), engine).analyze(csv_upload()).await.unwrap();

        assert_eq!(result.cluster_sizes(), vec![2, 1]);
        assert_eq!(*store.released.lock().unwrap(), vec!["staged-0"]);
    }

    #[tokio::test]
    async fn test_every_engine_failure_releases_once() {
        let failures: Vec<fn() -> EngineError> = vec![
            || EngineError::Timeout(Duration::from_secs(1)),
            || EngineError::Crashed {
                exit_code: Some(0),
                stderr: "warning: low sample size".to_string(),
            },
            || EngineError::Launch {
                program: "python".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            },
            || EngineError::Io(std::io::Error::other("pipe closed")),
            || EngineError::OutputOverflow {
                stream: "stdout",
                limit: 1024,
            },
        ];

        for make in failures {
            let store = Arc::new(CountingStore::default());
            let engine = Arc::new(ScriptedEngine::new(Script::Fail(make)));
            let err = service(store.clone(), engine)
                .analyze(csv_upload())
                .await
                .unwrap_err();
            assert_eq!(err.class(), ErrorClass::Engine);
            assert_eq!(store.released.lock().unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_malformed_output_releases_once() {
        let store = Arc::new(CountingStore::default());
        let engine = Arc::new(ScriptedEngine::new(Script::Stdout(r#"{"clusters":[{"na"#)));

        let err = service(store.clone(), engine).analyze(csv_upload()).await.unwrap_err();

        assert_eq!(err.code(), "MALFORMED_OUTPUT");
        assert_eq!(err.class(), ErrorClass::Contract);
        assert_eq!(store.released.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_skips_staging_and_engine() {
        let store = Arc::new(CountingStore::default());
        let engine = Arc::new(ScriptedEngine::new(Script::Stdout("{}")));

        let err = service(store.clone(), engine.clone())
            .analyze(UploadRequest::empty())
            .await
            .unwrap_err();

        assert!(matches!(err, AnalysisError::Input(Rejection::NoFileProvided)));
        assert!(err.is_client_error());
        assert_eq!(store.staged.load(Ordering::SeqCst), 0);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
        assert!(store.released.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_staging_failure_never_invokes_engine() {
        let store = Arc::new(CountingStore {
            fail_stage: true,
            ..CountingStore::default()
        });
        let engine = Arc::new(ScriptedEngine::new(Script::Stdout("{}")));

        let err = service(store.clone(), engine.clone())
            .analyze(csv_upload())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "STAGING_IO_ERROR");
        assert_eq!(err.class(), ErrorClass::Storage);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
        assert!(store.released.lock().unwrap().is_empty());
    }

    #[test]
    fn test_too_large_is_input_error() {
        let err = AnalysisError::from(StagingError::TooLarge { max: 10 });
        assert_eq!(err.code(), "FILE_TOO_LARGE");
        assert!(err.is_client_error());
    }

    #[test]
    fn test_interrupted_upload_is_input_error() {
        let err = AnalysisError::from(StagingError::Upload {
            source: std::io::Error::other("incomplete field data"),
        });
        assert_eq!(err.code(), "INCOMPLETE_UPLOAD");
        assert_eq!(err.class(), ErrorClass::Input);
    }
}
