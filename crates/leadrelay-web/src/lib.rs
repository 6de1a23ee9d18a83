//! HTTP trigger: `GET /` runs one pipeline invocation.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use leadrelay_core::RunOutcome;
use leadrelay_sync::Pipeline;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "leadrelay-web";

pub const DEFAULT_PORT: u16 = 8080;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(trigger_handler))
        .with_state(state)
}

pub fn port_from_env() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening for pipeline triggers");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
}

async fn trigger_handler(State(state): State<AppState>) -> Response {
    info!("received pipeline trigger");
    match state.pipeline.run_once().await {
        Ok(outcome) => (StatusCode::OK, success_message(&outcome)).into_response(),
        Err(err) => server_error(err),
    }
}

pub fn success_message(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Completed { file_name, summary } => format!(
            "Script executed successfully. Processed {file_name}: {} uploaded, {} failed.",
            summary.success_count, summary.failure_count
        ),
        RunOutcome::Skipped {
            reason,
            file_name: Some(file_name),
        } => format!("Script executed successfully. Skipped {file_name}: {reason}."),
        RunOutcome::Skipped {
            reason,
            file_name: None,
        } => format!("Script executed successfully. Nothing to do: {reason}."),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "pipeline run failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use leadrelay_adapters::{SourceError, SourceLocator};
    use leadrelay_core::{DispatchResult, ExportFile, NormalizedLead, SourceOrigin};
    use leadrelay_storage::{LedgerError, LocalLedger, ProcessedLedger};
    use leadrelay_sync::{
        BatchUploader, LeadDispatcher, Normalizer, NormalizerSettings, PhoneMode, UploadSettings,
    };
    use tower::ServiceExt;

    use super::*;

    struct OneFile;

    #[async_trait]
    impl SourceLocator for OneFile {
        fn describe(&self) -> String {
            "one file".into()
        }

        async fn fetch_latest(&self) -> Result<Option<ExportFile>, SourceError> {
            Ok(Some(ExportFile {
                name: "KWF-D2D-KWFexport-20240101.csv".into(),
                modified_at: None,
                origin: SourceOrigin::LocalDir {
                    path: "/drop/KWF-D2D-KWFexport-20240101.csv".into(),
                },
                content: b"Voornaam;Telefoonnr Prive1\nJan;612345678\nPiet;687654321\n".to_vec(),
            }))
        }
    }

    struct AcceptAll;

    #[async_trait]
    impl LeadDispatcher for AcceptAll {
        async fn dispatch(&self, lead: NormalizedLead) -> anyhow::Result<DispatchResult> {
            Ok(DispatchResult::accepted(lead))
        }
    }

    struct BrokenLedger;

    #[async_trait]
    impl ProcessedLedger for BrokenLedger {
        async fn exists(&self, _file_name: &str) -> Result<bool, LedgerError> {
            Err(LedgerError::InvalidUrl("bucket=s3cret-bucket".into()))
        }

        async fn record(&self, _file_name: &str) -> Result<(), LedgerError> {
            Ok(())
        }
    }

    fn pipeline(ledger: Arc<dyn ProcessedLedger>) -> Pipeline {
        let normalizer = Normalizer::new(
            NormalizerSettings {
                phone_field: "TelefoonnrPrive1".into(),
                phone_width: 10,
                phone_placeholder: "0000000000".into(),
                phone_mode: PhoneMode::ZeroPadded,
                contract_amount_field: "OvereenkomstBedragPerPeriode".into(),
                legacy_amount_field: "Oudbedragcustom".into(),
                opt_in_fields: vec![],
            },
            BTreeSet::from(["Voornaam".to_string()]),
            BTreeMap::new(),
        );
        let uploader = BatchUploader::new(
            Arc::new(AcceptAll),
            UploadSettings {
                chunk_size: 20,
                max_workers: 4,
                chunk_pause: Duration::ZERO,
            },
        );
        Pipeline::new(Arc::new(OneFile), ledger, normalizer, uploader, b';')
    }

    async fn get_root(app: Router) -> (StatusCode, String) {
        let resp = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn trigger_runs_pipeline_and_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(LocalLedger::new(dir.path(), "processed/"));
        let state = AppState::new(pipeline(ledger.clone()));

        let (status, text) = get_root(app(state.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("Script executed successfully."));
        assert!(text.contains("KWF-D2D-KWFexport-20240101.csv"));
        assert!(text.contains("2 uploaded, 0 failed"));

        let (status, text) = get_root(app(state)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("already processed"));
    }

    #[tokio::test]
    async fn pipeline_failure_maps_to_500_without_details() {
        let state = AppState::new(pipeline(Arc::new(BrokenLedger)));

        let (status, text) = get_root(app(state)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(text, "Internal Server Error");
    }

    #[tokio::test]
    async fn only_get_is_routed() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(pipeline(Arc::new(LocalLedger::new(dir.path(), "p/"))));
        let resp = app(state)
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn skip_message_mentions_reason() {
        let text = success_message(&RunOutcome::Skipped {
            reason: leadrelay_core::SkipReason::NoFileFound,
            file_name: None,
        });
        assert_eq!(text, "Script executed successfully. Nothing to do: no export file found.");
    }
}
