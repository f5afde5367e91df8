//! Expected conversion artifacts and their on-disk verification.

use serde::{Deserialize, Serialize};
use std::path::Path;
use utoipa::ToSchema;

use crate::types::BaseName;

/// Format of a single conversion artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Glb,
    Fbx,
    FbxRoblox,
    Usdz,
    Preview,
}

/// One value per artifact kind: filenames on disk, or URLs in a response.
///
/// `fbx_roblox` only exists for outfit conversions, where it and `fbx` both name the
/// Roblox-processed `<base>_processed.fbx`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ArtifactSet {
    pub glb: String,
    pub fbx: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fbx_roblox: Option<String>,
    pub usdz: String,
    pub preview: String,
}

impl ArtifactSet {
    /// Filenames the converter must produce for `base`.
    pub fn expected(base: &BaseName, is_outfit: bool) -> Self {
        let fbx = if is_outfit {
            format!("{base}_processed.fbx")
        } else {
            format!("{base}.fbx")
        };
        Self {
            glb: format!("{base}.glb"),
            fbx_roblox: is_outfit.then(|| fbx.clone()),
            fbx,
            usdz: format!("{base}.usdz"),
            preview: format!("{base}_preview.png"),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArtifactKind, &str)> {
        [
            (ArtifactKind::Glb, Some(self.glb.as_str())),
            (ArtifactKind::Fbx, Some(self.fbx.as_str())),
            (ArtifactKind::FbxRoblox, self.fbx_roblox.as_deref()),
            (ArtifactKind::Usdz, Some(self.usdz.as_str())),
            (ArtifactKind::Preview, Some(self.preview.as_str())),
        ]
        .into_iter()
        .filter_map(|(kind, value)| value.map(|v| (kind, v)))
    }

    #[cfg(test)]
    pub fn get(&self, kind: ArtifactKind) -> Option<&str> {
        self.iter().find(|(k, _)| *k == kind).map(|(_, v)| v)
    }

    pub fn map(&self, f: impl Fn(&str) -> String) -> Self {
        Self {
            glb: f(&self.glb),
            fbx: f(&self.fbx),
            fbx_roblox: self.fbx_roblox.as_deref().map(&f),
            usdz: f(&self.usdz),
            preview: f(&self.preview),
        }
    }

    /// Distinct filenames, in declaration order.
    pub fn file_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for (_, name) in self.iter() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Filenames that are absent from `dir`, are not regular files, or are empty.
    pub async fn missing_in(&self, dir: &Path) -> Vec<String> {
        let mut missing = Vec::new();
        for name in self.file_names() {
            let present = match tokio::fs::metadata(dir.join(name)).await {
                Ok(meta) => meta.is_file() && meta.len() > 0,
                Err(_) => false,
            };
            if !present {
                missing.push(name.to_string());
            }
        }
        missing
    }
}
