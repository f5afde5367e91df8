use axum::{
    Json,
    extract::{Multipart, State},
    http::StatusCode,
};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::{
    AppState,
    api::models::conversions::{ImageForm, ValidationResponse},
    errors::{Error, Result},
};

use super::read_image;

/// Check an image with the external validator before converting it.
#[utoipa::path(
    post,
    path = "/api/validate-image",
    tag = "conversion",
    summary = "Validate image",
    description = "Runs the external validator over an uploaded image. The validator's JSON verdict is returned as-is, with status 200 when it accepts the image and 400 when it rejects it.",
    request_body(content = ImageForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Image accepted", body = ValidationResponse),
        (status = 400, description = "Image rejected, or no file was uploaded", body = ValidationResponse),
        (status = 429, description = "No slot became free in time", body = crate::errors::ErrorResponse),
        (status = 500, description = "Validator could not be run or printed no verdict", body = crate::errors::ErrorResponse),
        (status = 504, description = "Validator exceeded its deadline", body = crate::errors::ErrorResponse),
    )
)]
#[instrument(skip_all)]
pub async fn validate_image(State(state): State<AppState>, mut multipart: Multipart) -> Result<(StatusCode, Json<Value>)> {
    let mut image = None;
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" | "image" => image = Some(read_image(field).await?),
            other => debug!(field = other, "Ignoring unknown multipart field"),
        }
    }
    let image = image.ok_or_else(|| Error::BadRequest {
        message: "File is required".to_string(),
    })?;

    let _permit = state.limiters.acquire_conversion().await?;
    let verdict = state.orchestrator.validate_image(image).await?;

    let status = if verdict.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    Ok((status, Json(Value::Object(verdict.body))))
}
