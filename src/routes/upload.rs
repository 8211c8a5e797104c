use crate::{
    inference_service::{Classification, ClassifyError, ProcessingError},
    pages::{Notice, Pages},
    server::SharedState,
};
use axum::{
    body::Bytes,
    extract::{multipart::MultipartRejection, Multipart, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
};
use std::time::Instant;
use tracing::instrument;

const ROUTE: &str = "/upload";

struct Upload {
    filename: String,
    bytes: Bytes,
}

impl ClassifyError {
    fn outcome(&self) -> &'static str {
        match self {
            ClassifyError::MissingUpload => "missing_upload",
            ClassifyError::ModelUnavailable => "model_unavailable",
            ClassifyError::Processing(_) => "processing_error",
        }
    }

    /// Whether the image pipeline ran before this error was raised.
    fn reached_pipeline(&self) -> bool {
        matches!(self, ClassifyError::Processing(_))
    }
}

#[instrument(skip(state, multipart))]
pub async fn upload_image(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    state.metrics.record_request(ROUTE);
    let start = Instant::now();

    let result = match read_upload(multipart).await {
        Ok(upload) => {
            state
                .inference_service
                .classify(&upload.filename, upload.bytes)
                .await
        }
        Err(e) => Err(e),
    };

    let elapsed_ms = start.elapsed().as_millis() as u64;
    match &result {
        Ok(classification) => {
            state.metrics.record_classification("success");
            state.metrics.record_prediction_duration(elapsed_ms, "success");
            tracing::info!(
                "Classified upload as class {}",
                classification.class_index
            );
        }
        Err(e) => {
            state.metrics.record_classification(e.outcome());
            if e.reached_pipeline() {
                state
                    .metrics
                    .record_prediction_duration(elapsed_ms, e.outcome());
            }
        }
    }

    match result {
        Ok(classification) => result_response(&state.pages, &classification),
        Err(e) => error_response(&state.pages, e),
    }
}

fn result_response(pages: &Pages, classification: &Classification) -> Response {
    match pages.result(classification) {
        Ok(page) => Html(page).into_response(),
        Err(e) => e.into_response(),
    }
}

fn error_response(pages: &Pages, error: ClassifyError) -> Response {
    match error {
        ClassifyError::MissingUpload => Redirect::to("/").into_response(),
        ClassifyError::ModelUnavailable => match pages.index(Some(Notice::ModelUnavailable)) {
            Ok(page) => (StatusCode::SERVICE_UNAVAILABLE, Html(page)).into_response(),
            Err(e) => e.into_response(),
        },
        ClassifyError::Processing(e) => {
            tracing::error!("Error processing the image: {}", e);
            Redirect::to(&format!("/?error={}", Notice::Processing.as_str())).into_response()
        }
    }
}

async fn read_upload(
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Upload, ClassifyError> {
    let mut multipart = multipart.map_err(|e| {
        tracing::debug!("Rejected non-multipart upload: {}", e);
        ClassifyError::MissingUpload
    })?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ProcessingError::Multipart(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ProcessingError::Multipart(e.to_string()))?;

        return Ok(Upload { filename, bytes });
    }

    Err(ClassifyError::MissingUpload)
}
