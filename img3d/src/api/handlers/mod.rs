pub mod convert;
pub mod files;
pub mod models;
pub mod validate;

use axum::extract::multipart::Field;
use bytes::Bytes;

use crate::{
    conversion::SourceImage,
    errors::{Error, Result},
    types::sanitize_file_name,
};

/// Read an uploaded image field, requiring a usable file name and a non-empty body.
pub(crate) async fn read_image(field: Field<'_>) -> Result<SourceImage> {
    let raw_name = field.file_name().map(str::to_string).ok_or_else(|| Error::BadRequest {
        message: "Uploaded file must have a file name".to_string(),
    })?;
    let file_name = sanitize_file_name(&raw_name).ok_or_else(|| Error::BadRequest {
        message: format!("Invalid file name: {raw_name}"),
    })?;

    let bytes = read_file(field).await?;

    tracing::debug!(file_name = %file_name, size = bytes.len(), "Received image upload");
    Ok(SourceImage { file_name, bytes })
}

/// Read a file field in full, rejecting empty uploads.
pub(crate) async fn read_file(field: Field<'_>) -> Result<Bytes> {
    let bytes = field.bytes().await?;
    if bytes.is_empty() {
        return Err(Error::BadRequest {
            message: "Uploaded file is empty".to_string(),
        });
    }
    Ok(bytes)
}
