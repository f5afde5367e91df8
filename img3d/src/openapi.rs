//! OpenAPI documentation for the HTTP API.
//!
//! Served as JSON at `/api/openapi.json` and rendered with Scalar at `/api/docs`.

use utoipa::OpenApi;

use crate::{
    api::{handlers, models::conversions},
    conversion::{ArtifactKind, ArtifactSet},
    errors::ErrorResponse,
    types::OutfitType,
};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "img3d",
        description = "Turns 2D images into 3D model assets (GLB, FBX, USDZ and a preview PNG) by driving an external conversion executable."
    ),
    paths(
        handlers::convert::convert_image,
        handlers::validate::validate_image,
        handlers::models::save_model,
        handlers::files::serve_output_file,
        handlers::files::serve_upload,
    ),
    components(schemas(
        conversions::ConvertForm,
        conversions::OutfitFlag,
        conversions::ImageForm,
        conversions::ModelForm,
        conversions::ConvertResponse,
        conversions::SaveModelResponse,
        conversions::ValidationResponse,
        ArtifactSet,
        ArtifactKind,
        OutfitType,
        ErrorResponse,
    )),
    tags(
        (name = "conversion", description = "Image validation and image-to-3D conversion"),
        (name = "models", description = "Edited model storage"),
        (name = "files", description = "Artifact and upload downloads"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_lists_every_endpoint() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&str> = doc.paths.paths.keys().map(String::as_str).collect();

        for expected in [
            "/api/convert",
            "/api/validate-image",
            "/api/save-model",
            "/api/files/{path}",
            "/api/uploads/{path}",
        ] {
            assert!(paths.contains(&expected), "missing {expected} in {paths:?}");
        }
    }

    #[test]
    fn test_convert_form_matches_wire_format() {
        let doc = serde_json::to_value(ApiDoc::openapi()).unwrap();
        let schemas = &doc["components"]["schemas"];

        assert_eq!(schemas["OutfitFlag"]["enum"], serde_json::json!(["true", "false"]));
        let properties = &schemas["ConvertForm"]["properties"];
        for field in ["file", "image", "fileName", "isOutfit", "outfitType"] {
            assert!(properties.get(field).is_some(), "ConvertForm is missing {field}");
        }
    }
}
