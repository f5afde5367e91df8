//! Common identifiers and validated name types shared across the service.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

/// Identifier of a single conversion job. Scopes both the upload and output directories.
pub type JobId = Uuid;

/// Why a string was rejected as a path segment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid name {value:?}: {reason}")]
pub struct InvalidName {
    pub value: String,
    pub reason: &'static str,
}

/// Check that `segment` is a single, non-traversing path component.
pub fn validate_segment(segment: &str) -> Result<(), &'static str> {
    if segment.is_empty() {
        return Err("must not be empty");
    }
    if segment == "." || segment == ".." {
        return Err("must not be a relative directory reference");
    }
    if segment.contains(['/', '\\', '\0']) {
        return Err("must not contain path separators or NUL bytes");
    }
    Ok(())
}

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// Reduce a client-supplied filename to a safe single component.
///
/// Only the final path component is kept and every character outside `[A-Za-z0-9._-]` is replaced
/// with `_`. Returns `None` when nothing usable remains.
pub fn sanitize_file_name(raw: &str) -> Option<String> {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    let cleaned: String = last.chars().map(|c| if is_safe_char(c) { c } else { '_' }).collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() || validate_segment(cleaned).is_err() {
        return None;
    }
    Some(cleaned.to_string())
}

/// Filename stem every artifact of a conversion is derived from.
///
/// Invariants: non-empty, at most [`BaseName::MAX_LEN`] bytes, only `[A-Za-z0-9._-]`, no leading dot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, ToSchema)]
#[serde(transparent)]
pub struct BaseName(String);

impl BaseName {
    pub const MAX_LEN: usize = 200;

    /// Strictly validate a caller-provided base name.
    pub fn parse(raw: &str) -> Result<Self, InvalidName> {
        let invalid = |reason| InvalidName {
            value: raw.to_string(),
            reason,
        };

        validate_segment(raw).map_err(invalid)?;
        if raw.len() > Self::MAX_LEN {
            return Err(invalid("is too long"));
        }
        if raw.starts_with('.') {
            return Err(invalid("must not start with a dot"));
        }
        if !raw.chars().all(is_safe_char) {
            return Err(invalid("may only contain letters, digits, '.', '-' and '_'"));
        }
        Ok(Self(raw.to_string()))
    }

    /// Derive a base name from an uploaded filename: sanitized, extension stripped.
    pub fn from_file_name(file_name: &str) -> Result<Self, InvalidName> {
        let sanitized = sanitize_file_name(file_name).ok_or_else(|| InvalidName {
            value: file_name.to_string(),
            reason: "does not contain a usable file name",
        })?;
        let stem = match sanitized.rsplit_once('.') {
            Some((stem, _ext)) if !stem.is_empty() => stem,
            _ => sanitized.as_str(),
        };
        let truncated: String = stem.chars().take(Self::MAX_LEN).collect();
        Self::parse(&truncated)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of Roblox accessory an outfit conversion targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OutfitType {
    Clothes,
    Hats,
    Shoes,
}

impl OutfitType {
    pub fn as_str(self) -> &'static str {
        match self {
            OutfitType::Clothes => "clothes",
            OutfitType::Hats => "hats",
            OutfitType::Shoes => "shoes",
        }
    }
}

impl fmt::Display for OutfitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutfitType {
    type Err = InvalidName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clothes" => Ok(OutfitType::Clothes),
            "hats" => Ok(OutfitType::Hats),
            "shoes" => Ok(OutfitType::Shoes),
            _ => Err(InvalidName {
                value: s.to_string(),
                reason: "expected one of clothes, hats, shoes",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_rejects_traversal() {
        assert!(validate_segment("..").is_err());
        assert!(validate_segment(".").is_err());
        assert!(validate_segment("").is_err());
        assert!(validate_segment("a/b").is_err());
        assert!(validate_segment("a\\b").is_err());
        assert!(validate_segment("shirt.glb").is_ok());
    }

    #[test]
    fn test_base_name_parse() {
        assert_eq!(BaseName::parse("shirt").unwrap().as_str(), "shirt");
        assert_eq!(BaseName::parse("my-vase_2.v1").unwrap().as_str(), "my-vase_2.v1");

        assert!(BaseName::parse("../etc").is_err());
        assert!(BaseName::parse(".hidden").is_err());
        assert!(BaseName::parse("with space").is_err());
        assert!(BaseName::parse("").is_err());
        assert!(BaseName::parse(&"a".repeat(BaseName::MAX_LEN + 1)).is_err());
    }

    #[test]
    fn test_base_name_from_file_name() {
        assert_eq!(BaseName::from_file_name("shirt.png").unwrap().as_str(), "shirt");
        assert_eq!(BaseName::from_file_name("vase").unwrap().as_str(), "vase");
        assert_eq!(BaseName::from_file_name("my shirt.final.jpg").unwrap().as_str(), "my_shirt.final");
        assert_eq!(BaseName::from_file_name("C:\\Users\\me\\hat.png").unwrap().as_str(), "hat");
        assert!(BaseName::from_file_name("..").is_err());
        assert!(BaseName::from_file_name("").is_err());
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("shirt.png").as_deref(), Some("shirt.png"));
        assert_eq!(sanitize_file_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_file_name("my photo (1).jpg").as_deref(), Some("my_photo__1_.jpg"));
        assert_eq!(sanitize_file_name(".env").as_deref(), Some("env"));
        assert_eq!(sanitize_file_name("dir/"), None);
        assert_eq!(sanitize_file_name("..."), None);
    }

    #[test]
    fn test_outfit_type_round_trip() {
        assert_eq!("clothes".parse::<OutfitType>().unwrap(), OutfitType::Clothes);
        assert_eq!(" Hats ".parse::<OutfitType>().unwrap(), OutfitType::Hats);
        assert_eq!(OutfitType::Shoes.to_string(), "shoes");
        assert!("gloves".parse::<OutfitType>().is_err());

        let json = serde_json::to_string(&OutfitType::Clothes).unwrap();
        assert_eq!(json, "\"clothes\"");
    }
}
