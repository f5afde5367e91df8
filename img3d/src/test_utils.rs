//! Shared fixtures for tests: throwaway storage roots and fake external executables.
//!
//! Fake executables are `/bin/sh` scripts, so tests that run them are unix-only.

use std::{path::Path, time::Duration};

use axum_test::{TestServer, multipart::Part};

use crate::{
    Application,
    config::{Config, ExecutableConfig},
};

/// Converter that writes every artifact for the requested mode and reports success.
///
/// It also records `<is_outfit> <outfit_type> upload-present|upload-missing` in `<base>.args`.
pub const SUCCESS_CONVERTER: &str = r#"input="$1"
base="$2"
outfit="$3"
kind="$4"
echo "Starting conversion of $input"
echo '{"type": "progress", "stage": "processing", "progress": 50, "message": "Generating mesh"}'
if [ -f "$input" ]; then seen=upload-present; else seen=upload-missing; fi
echo "$outfit $kind $seen" > "$base.args"
if [ "$outfit" = "true" ]; then fbx="${base}_processed.fbx"; else fbx="$base.fbx"; fi
printf 'glTF' > "$base.glb"
printf 'FBX' > "$fbx"
printf 'USDZ' > "$base.usdz"
printf 'PNG' > "${base}_preview.png"
echo '{"success": true, "message": "Conversion completed successfully"}'
"#;

/// Validator that accepts every image.
pub const ACCEPTING_VALIDATOR: &str = r#"echo "Validating $1" >&2
echo '{"success": true, "message": "Image is valid", "dimensions": [1024, 1024]}'
"#;

/// Write `body` to `dir/name` and return a config that runs it with `/bin/sh`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> ExecutableConfig {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    ExecutableConfig {
        program: "/bin/sh".to_string(),
        args: vec![path.to_string_lossy().into_owned()],
        timeout: Duration::from_secs(30),
        working_dir: None,
    }
}

/// Default config rooted in `root`, with the fake converter and validator installed.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.storage.uploads_dir = root.join("uploads");
    config.storage.output_dir = root.join("output");
    config.converter = write_script(root, "convert.sh", SUCCESS_CONVERTER);
    config.validator = write_script(root, "validate.sh", ACCEPTING_VALIDATOR);
    config
}

pub async fn test_server(config: Config) -> TestServer {
    Application::new(config).await.unwrap().into_test_server()
}

/// A small PNG upload part.
pub fn png_part(file_name: &str) -> Part {
    Part::bytes(b"\x89PNG\r\n\x1a\nfake image data".to_vec())
        .file_name(file_name)
        .mime_type("image/png")
}
