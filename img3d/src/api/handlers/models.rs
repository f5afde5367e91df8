use axum::{
    Json,
    extract::{Multipart, State},
};
use tracing::{debug, info, instrument};

use crate::{
    AppState,
    api::models::conversions::{ModelForm, SaveModelResponse},
    errors::{Error, Result},
};

use super::read_file;

/// Store a model edited in the browser viewer.
#[utoipa::path(
    post,
    path = "/api/save-model",
    tag = "models",
    summary = "Save edited model",
    description = "Stores an edited GLB under the output root and returns the URL it can be downloaded from.",
    request_body(content = ModelForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Model saved", body = SaveModelResponse),
        (status = 400, description = "No model uploaded, or the upload was empty", body = crate::errors::ErrorResponse),
        (status = 413, description = "Upload exceeds the configured size limit", body = crate::errors::ErrorResponse),
        (status = 500, description = "Model could not be written", body = crate::errors::ErrorResponse),
    )
)]
#[instrument(skip_all)]
pub async fn save_model(State(state): State<AppState>, mut multipart: Multipart) -> Result<Json<SaveModelResponse>> {
    let mut model = None;
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "model" => model = Some(read_file(field).await?),
            other => debug!(field = other, "Ignoring unknown multipart field"),
        }
    }
    let model = model.ok_or_else(|| Error::BadRequest {
        message: "No file uploaded".to_string(),
    })?;

    let url = state
        .orchestrator
        .storage()
        .save_edited_model(&model)
        .await
        .map_err(|e| Error::Internal {
            operation: format!("save edited model: {e}"),
        })?;

    info!(url = %url, size = model.len(), "Saved edited model");
    Ok(Json(SaveModelResponse { success: true, url }))
}
