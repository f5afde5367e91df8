//! Request and response bodies for the conversion endpoints.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::{conversion::ArtifactSet, types::OutfitType};

/// Multipart form accepted by `POST /api/convert`.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConvertForm {
    /// Source image. Exactly one of `file` or `image` is required.
    #[schema(value_type = Option<String>, format = Binary)]
    pub file: Option<Vec<u8>>,
    /// Alternative field name for the source image
    #[schema(value_type = Option<String>, format = Binary)]
    pub image: Option<Vec<u8>>,
    /// Base name for every artifact; defaults to the uploaded file's stem
    pub file_name: Option<String>,
    /// Roblox outfit conversion. Sent as text; an empty or absent value means `false`.
    pub is_outfit: Option<OutfitFlag>,
    /// Required when `isOutfit` is true
    pub outfit_type: Option<OutfitType>,
}

/// Text value of the `isOutfit` form field, matched case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OutfitFlag {
    True,
    False,
}

/// Multipart form carrying a single image in the `file` field.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ImageForm {
    #[schema(value_type = String, format = Binary)]
    pub file: Vec<u8>,
}

/// Multipart form carrying an edited GLB model in the `model` field.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ModelForm {
    #[schema(value_type = String, format = Binary)]
    pub model: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConvertResponse {
    pub success: bool,
    pub message: String,
    /// Download URL for each generated artifact
    pub outputs: ArtifactSet,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SaveModelResponse {
    pub success: bool,
    pub url: String,
}

/// Verdict printed by the validator, returned as-is.
///
/// Only `success` is guaranteed. Any other fields the validator prints are passed through too.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ValidationResponse {
    pub success: bool,
    pub message: Option<String>,
    pub error: Option<String>,
    pub details: Option<Value>,
}
