use axum::{
    Json,
    extract::{Multipart, State},
};
use tracing::{debug, info, instrument};

use crate::{
    AppState,
    api::models::conversions::{ConvertForm, ConvertResponse},
    conversion::{ConversionRequest, SourceImage},
    errors::{Error, Result},
    types::{BaseName, OutfitType},
};

use super::read_image;

/// Image extensions dropped from an explicit `fileName` before it is used as a base name.
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp", "gif"];

/// Fields collected from the multipart body, in whatever order they arrive.
#[derive(Debug, Default)]
struct ConvertFields {
    image: Option<SourceImage>,
    file_name: Option<String>,
    is_outfit: Option<String>,
    outfit_type: Option<String>,
}

impl ConvertFields {
    fn into_request(self) -> Result<ConversionRequest> {
        let source = self.image.ok_or_else(|| Error::BadRequest {
            message: "An image file is required (field `file` or `image`)".to_string(),
        })?;

        let base_name = match self.file_name.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(name) => parse_base_name(name)?,
            None => BaseName::from_file_name(&source.file_name).map_err(|e| Error::BadRequest { message: e.to_string() })?,
        };

        let is_outfit = match self.is_outfit.as_deref().map(str::trim) {
            None | Some("") => false,
            Some(flag) if flag.eq_ignore_ascii_case("true") => true,
            Some(flag) if flag.eq_ignore_ascii_case("false") => false,
            Some(flag) => {
                return Err(Error::BadRequest {
                    message: format!("isOutfit must be \"true\" or \"false\", got {flag:?}"),
                });
            }
        };

        let outfit = if is_outfit {
            let raw = self.outfit_type.as_deref().ok_or_else(|| Error::BadRequest {
                message: "outfitType is required when isOutfit is true".to_string(),
            })?;
            Some(raw.parse::<OutfitType>().map_err(|e| Error::BadRequest { message: e.to_string() })?)
        } else {
            None
        };

        Ok(ConversionRequest { source, base_name, outfit })
    }
}

/// Parse a caller-chosen base name, tolerating a trailing image extension.
fn parse_base_name(raw: &str) -> Result<BaseName> {
    let stem = match raw.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)) => stem,
        _ => raw,
    };
    BaseName::parse(stem).map_err(|e| Error::BadRequest {
        message: format!("Invalid fileName: {e}"),
    })
}

#[utoipa::path(
    post,
    path = "/api/convert",
    tag = "conversion",
    summary = "Convert image to 3D",
    description = "Runs the external converter over an uploaded image and returns URLs for the generated GLB, FBX, USDZ and preview files.

Outfit conversions (`isOutfit=true`) additionally produce a Roblox-ready FBX, returned as both `fbx` and `fbx_roblox`.",
    request_body(content = ConvertForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Conversion succeeded and every artifact exists", body = ConvertResponse),
        (status = 400, description = "Invalid form, or the converter rejected the image", body = crate::errors::ErrorResponse),
        (status = 413, description = "Upload exceeds the configured size limit", body = crate::errors::ErrorResponse),
        (status = 429, description = "No conversion slot became free in time", body = crate::errors::ErrorResponse),
        (status = 500, description = "Converter failed, printed no result, or left artifacts missing", body = crate::errors::ErrorResponse),
        (status = 504, description = "Converter exceeded its deadline", body = crate::errors::ErrorResponse),
    )
)]
#[instrument(skip_all)]
pub async fn convert_image(State(state): State<AppState>, mut multipart: Multipart) -> Result<Json<ConvertResponse>> {
    let mut fields = ConvertFields::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" | "image" => fields.image = Some(read_image(field).await?),
            "fileName" => fields.file_name = Some(field.text().await?),
            "isOutfit" => fields.is_outfit = Some(field.text().await?),
            "outfitType" => fields.outfit_type = Some(field.text().await?),
            other => debug!(field = other, "Ignoring unknown multipart field"),
        }
    }

    let request = fields.into_request()?;
    info!(
        file_name = %request.source.file_name,
        size = request.source.bytes.len(),
        base_name = %request.base_name,
        outfit = ?request.outfit,
        "Starting conversion"
    );

    let _permit = state.limiters.acquire_conversion().await?;
    let outcome = state.orchestrator.convert(request).await?;

    Ok(Json(ConvertResponse {
        success: true,
        message: outcome.result.message().unwrap_or("Conversion completed successfully").to_string(),
        outputs: outcome.outputs,
    }))
}
