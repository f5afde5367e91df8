//! Image-to-3D conversion pipeline.
//!
//! A conversion runs `upload → spawn → collect → parse → verify` for one request:
//!
//! 1. The uploaded image is written to `<uploads>/<job_id>/<file_name>` and an empty
//!    `<output>/<job_id>/` is created for the artifacts.
//! 2. The configured converter runs as `[...args, input_path, output_base, is_outfit, outfit_type]`
//!    where `output_base` is `<output>/<job_id>/<base_name>`.
//! 3. Once it exits the upload is deleted, whatever the outcome.
//! 4. The final stdout line is parsed as the result (see [`output`]) and judged in a fixed order:
//!    unparsable output, then a non-zero exit, then `success: false`.
//! 5. Every artifact in the expected [`ArtifactSet`] must exist and be non-empty before the
//!    request succeeds.
//!
//! Failures never retry. Artifacts from failed runs stay where the converter left them.

pub mod artifacts;
pub mod output;
pub mod process;

use std::{
    ffi::OsStr,
    io,
    time::{Duration, Instant},
};

use bytes::Bytes;
use thiserror::Error;
use tracing::{Span, info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    storage::Storage,
    types::{BaseName, JobId, OutfitType},
};

pub use artifacts::{ArtifactKind, ArtifactSet};
pub use output::{OutputError, ScriptResult};
pub use process::{ProcessError, ProcessOutput, ProcessRunner};

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("failed to store upload: {0}")]
    Upload(#[source] io::Error),

    #[error("failed to start `{program}`: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("failed to collect process output: {0}")]
    Io(#[source] io::Error),

    #[error("process timed out after {}", humantime::format_duration(*.after))]
    Timeout { after: Duration },

    #[error("process exited with {status}")]
    Process {
        status: String,
        /// `error` field of the result line, when the process printed one
        message: Option<String>,
        stderr: String,
    },

    #[error("unusable process output: {reason}")]
    OutputParse {
        #[source]
        reason: OutputError,
        stdout: String,
        stderr: String,
    },

    #[error("image rejected: {message}")]
    Validation { message: String, details: Option<String> },

    #[error("missing artifacts: {}", .missing.join(", "))]
    ArtifactMissing { missing: Vec<String> },
}

impl ConversionError {
    /// Stable label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ConversionError::Upload(_) => "upload_failure",
            ConversionError::Spawn { .. } => "spawn_failure",
            ConversionError::Io(_) => "io_failure",
            ConversionError::Timeout { .. } => "timeout",
            ConversionError::Process { .. } => "process_failure",
            ConversionError::OutputParse { .. } => "output_parse_failure",
            ConversionError::Validation { .. } => "validation_failure",
            ConversionError::ArtifactMissing { .. } => "artifact_missing",
        }
    }
}

impl From<ProcessError> for ConversionError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Spawn { program, source } => ConversionError::Spawn { program, source },
            ProcessError::Timeout { timeout, .. } => ConversionError::Timeout { after: timeout },
            ProcessError::Io { source, .. } => ConversionError::Io(source),
        }
    }
}

/// An uploaded image, already reduced to a safe file name.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub file_name: String,
    pub bytes: Bytes,
}

#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub source: SourceImage,
    pub base_name: BaseName,
    /// Set for Roblox outfit conversions
    pub outfit: Option<OutfitType>,
}

impl ConversionRequest {
    pub fn is_outfit(&self) -> bool {
        self.outfit.is_some()
    }
}

/// A finished, verified conversion.
#[derive(Debug, Clone)]
pub struct ConversionOutcome {
    pub job_id: JobId,
    /// Public URLs of every artifact
    pub outputs: ArtifactSet,
    pub result: ScriptResult,
    pub elapsed: Duration,
}

/// Drives the external converter and validator against job-scoped directories.
#[derive(Debug)]
pub struct Orchestrator {
    storage: Storage,
    converter: ProcessRunner,
    validator: ProcessRunner,
}

impl Orchestrator {
    pub fn new(storage: Storage, config: &Config) -> Self {
        Self {
            storage,
            converter: ProcessRunner::new(&config.converter),
            validator: ProcessRunner::new(&config.validator),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Convert one image into the full artifact set.
    pub async fn convert(&self, request: ConversionRequest) -> Result<ConversionOutcome, ConversionError> {
        let job_id = Uuid::new_v4();
        let started = Instant::now();

        let result = self.run_conversion(job_id, &request).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(err) => err.kind(),
        };
        metrics::counter!("img3d_conversions_total", "outcome" => outcome).increment(1);
        metrics::histogram!("img3d_conversion_duration_seconds", "outcome" => outcome).record(started.elapsed().as_secs_f64());

        result
    }

    #[instrument(
        skip_all,
        fields(
            job_id = %job_id,
            base_name = %request.base_name,
            outfit = request.outfit.map(OutfitType::as_str).unwrap_or("none"),
            stage = "uploading",
        )
    )]
    async fn run_conversion(&self, job_id: JobId, request: &ConversionRequest) -> Result<ConversionOutcome, ConversionError> {
        let span = Span::current();

        // The output dir is only created once the upload is staged
        let mut upload = self
            .storage
            .stage_upload(job_id, &request.source.file_name, &request.source.bytes)
            .await
            .map_err(ConversionError::Upload)?;
        let output_dir = self.storage.create_output_dir(job_id).await.map_err(ConversionError::Upload)?;

        let output_base = output_dir.join(request.base_name.as_str());
        let is_outfit = if request.is_outfit() { "true" } else { "false" };
        let outfit_type = request.outfit.map(OutfitType::as_str).unwrap_or("none");

        span.record("stage", "spawned");
        let run = self
            .converter
            .run([
                upload.path().as_os_str(),
                output_base.as_os_str(),
                OsStr::new(is_outfit),
                OsStr::new(outfit_type),
            ])
            .await;
        upload.remove().await;

        let output = run.inspect_err(|err| {
            let stage = match err {
                ProcessError::Spawn { .. } => "spawn_failed",
                ProcessError::Timeout { .. } => "timed_out",
                ProcessError::Io { .. } => "collect_failed",
            };
            span.record("stage", stage);
        })?;
        span.record("stage", "exited");

        let result = interpret(&output).inspect_err(|err| {
            span.record("stage", err.kind());
        })?;
        span.record("stage", "parsed");

        let expected = ArtifactSet::expected(&request.base_name, request.is_outfit());
        let missing = expected.missing_in(&output_dir).await;
        if !missing.is_empty() {
            span.record("stage", "artifact_missing");
            warn!(missing = ?missing, "Converter reported success but artifacts are missing");
            return Err(ConversionError::ArtifactMissing { missing });
        }
        span.record("stage", "verified");

        let outputs = expected.map(|name| self.storage.output_url(job_id, name));
        info!(elapsed_ms = output.elapsed.as_millis() as u64, "Conversion completed");

        Ok(ConversionOutcome {
            job_id,
            outputs,
            result,
            elapsed: output.elapsed,
        })
    }

    /// Run the validator over an image and return its verdict.
    ///
    /// The verdict is returned whatever its `success` value and exit status: the validator exits
    /// non-zero when it rejects an image, so only a missing or malformed result line is an error.
    #[instrument(skip_all, fields(job_id = tracing::field::Empty, file_name = %source.file_name))]
    pub async fn validate_image(&self, source: SourceImage) -> Result<ScriptResult, ConversionError> {
        let job_id = Uuid::new_v4();
        Span::current().record("job_id", tracing::field::display(job_id));

        let mut upload = self
            .storage
            .stage_upload(job_id, &source.file_name, &source.bytes)
            .await
            .map_err(ConversionError::Upload)?;
        let run = self.validator.run([upload.path()]).await;
        upload.remove().await;
        let output = run?;

        let result = output::extract_result(&output.stdout).map_err(|reason| ConversionError::OutputParse {
            reason,
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
        })?;

        info!(success = result.success, status = %output.status, "Image validated");
        Ok(result)
    }
}

/// Judge a finished converter run: parse failure, then exit status, then the reported verdict.
fn interpret(output: &ProcessOutput) -> Result<ScriptResult, ConversionError> {
    let result = output::extract_result(&output.stdout).map_err(|reason| ConversionError::OutputParse {
        reason,
        stdout: output.stdout.clone(),
        stderr: output.stderr.clone(),
    })?;

    if !output.status.success() {
        return Err(ConversionError::Process {
            status: output.status.to_string(),
            message: result.error().map(str::to_string),
            stderr: output.stderr.clone(),
        });
    }

    if !result.success {
        return Err(ConversionError::Validation {
            message: result.reason().unwrap_or("Image was rejected by the converter").to_string(),
            details: result.details(),
        });
    }

    Ok(result)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_utils::{SUCCESS_CONVERTER, test_config, write_script};
    use std::{os::unix::process::ExitStatusExt, path::Path, process::ExitStatus};

    fn finished(code: i32, stdout: &str, stderr: &str) -> ProcessOutput {
        ProcessOutput {
            status: ExitStatus::from_raw(code << 8),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            elapsed: Duration::from_millis(5),
        }
    }

    fn request(file_name: &str, base: &str, outfit: Option<OutfitType>) -> ConversionRequest {
        ConversionRequest {
            source: SourceImage {
                file_name: file_name.to_string(),
                bytes: Bytes::from_static(b"\x89PNG fake image"),
            },
            base_name: BaseName::parse(base).unwrap(),
            outfit,
        }
    }

    fn orchestrator(root: &Path, converter: &str) -> Orchestrator {
        let mut config = test_config(root);
        config.converter = write_script(root, "convert.sh", converter);
        Orchestrator::new(Storage::new(&config.storage), &config)
    }

    fn job_dirs(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
    }

    #[test]
    fn test_interpret_success() {
        let result = interpret(&finished(0, "log\n{\"success\": true, \"message\": \"done\"}\n", "")).unwrap();
        assert_eq!(result.message(), Some("done"));
    }

    #[test]
    fn test_interpret_unparsable_output_wins_over_exit_code() {
        let err = interpret(&finished(1, "Traceback...\n", "ImportError: no module named bpy\n")).unwrap_err();
        match err {
            ConversionError::OutputParse { stdout, stderr, .. } => {
                assert_eq!(stdout, "Traceback...\n");
                assert!(stderr.contains("ImportError"));
            }
            other => panic!("expected OutputParse, got {other:?}"),
        }

        let err = interpret(&finished(0, "Conversion complete!\n", "")).unwrap_err();
        assert!(matches!(err, ConversionError::OutputParse { .. }));
    }

    #[test]
    fn test_interpret_non_zero_exit() {
        let err = interpret(&finished(2, "{\"success\": false, \"error\": \"Blender crashed\"}", "Segmentation fault\n")).unwrap_err();
        match err {
            ConversionError::Process { message, stderr, .. } => {
                assert_eq!(message.as_deref(), Some("Blender crashed"));
                assert_eq!(stderr, "Segmentation fault\n");
            }
            other => panic!("expected Process, got {other:?}"),
        }
    }

    #[test]
    fn test_interpret_rejection() {
        let err = interpret(&finished(
            0,
            "{\"success\": false, \"message\": \"Image resolution (64x64) is too low\", \"details\": \"min 256x256\"}",
            "",
        ))
        .unwrap_err();
        match err {
            ConversionError::Validation { message, details } => {
                assert_eq!(message, "Image resolution (64x64) is too low");
                assert_eq!(details.as_deref(), Some("min 256x256"));
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_outfit_conversion() {
        let root = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(root.path(), SUCCESS_CONVERTER);

        let outcome = orchestrator
            .convert(request("shirt.png", "shirt", Some(OutfitType::Clothes)))
            .await
            .unwrap();

        let job = outcome.job_id;
        assert_eq!(outcome.outputs.glb, format!("/api/files/{job}/shirt.glb"));
        assert_eq!(outcome.outputs.fbx, format!("/api/files/{job}/shirt_processed.fbx"));
        assert_eq!(outcome.outputs.fbx_roblox.as_deref(), Some(outcome.outputs.fbx.as_str()));
        assert_eq!(outcome.outputs.usdz, format!("/api/files/{job}/shirt.usdz"));
        assert_eq!(outcome.outputs.preview, format!("/api/files/{job}/shirt_preview.png"));

        // The converter saw the real upload and the outfit arguments
        let job_dir = orchestrator.storage().output_dir().join(job.to_string());
        let args = std::fs::read_to_string(job_dir.join("shirt.args")).unwrap();
        assert_eq!(args.trim(), "true clothes upload-present");
    }

    #[tokio::test]
    async fn test_plain_conversion_and_upload_cleanup() {
        let root = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(root.path(), SUCCESS_CONVERTER);

        let outcome = orchestrator.convert(request("vase.png", "vase", None)).await.unwrap();

        assert!(outcome.outputs.fbx.ends_with("/vase.fbx"));
        assert_eq!(outcome.outputs.fbx_roblox, None);
        let job_dir = orchestrator.storage().output_dir().join(outcome.job_id.to_string());
        assert_eq!(std::fs::read_to_string(job_dir.join("vase.args")).unwrap().trim(), "false none upload-present");

        assert_eq!(job_dirs(orchestrator.storage().uploads_dir()), 0);
    }

    #[tokio::test]
    async fn test_rejected_upload_leaves_no_job_dirs() {
        let root = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(root.path(), SUCCESS_CONVERTER);
        orchestrator.storage().ensure_dirs().await.unwrap();

        let err = orchestrator.convert(request("..", "vase", None)).await.unwrap_err();

        assert!(matches!(err, ConversionError::Upload(_)));
        assert_eq!(job_dirs(orchestrator.storage().output_dir()), 0);
        assert_eq!(job_dirs(orchestrator.storage().uploads_dir()), 0);
    }

    #[tokio::test]
    async fn test_same_base_name_runs_do_not_collide() {
        let root = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(root.path(), SUCCESS_CONVERTER);

        let (a, b) = tokio::join!(
            orchestrator.convert(request("vase.png", "vase", None)),
            orchestrator.convert(request("vase.png", "vase", None)),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.job_id, b.job_id);
        assert_ne!(a.outputs.glb, b.outputs.glb);
    }

    #[tokio::test]
    async fn test_non_zero_exit_keeps_stderr() {
        let root = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(
            root.path(),
            r#"echo "Error: CUDA out of memory" >&2
echo '{"success": false, "error": "Conversion failed"}'
exit 1
"#,
        );

        let err = orchestrator.convert(request("vase.png", "vase", None)).await.unwrap_err();

        match err {
            ConversionError::Process { stderr, .. } => assert!(stderr.contains("CUDA out of memory")),
            other => panic!("expected Process, got {other:?}"),
        }
        assert_eq!(job_dirs(orchestrator.storage().uploads_dir()), 0);
    }

    #[tokio::test]
    async fn test_missing_json_is_parse_failure() {
        let root = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(root.path(), "echo 'Conversion complete!'\n");

        let err = orchestrator.convert(request("vase.png", "vase", None)).await.unwrap_err();
        assert_eq!(err.kind(), "output_parse_failure");
    }

    #[tokio::test]
    async fn test_rejected_image() {
        let root = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(
            root.path(),
            r#"echo '{"success": false, "message": "No object detected in image"}'"#,
        );

        let err = orchestrator.convert(request("blank.png", "blank", None)).await.unwrap_err();
        assert!(matches!(err, ConversionError::Validation { ref message, .. } if message == "No object detected in image"));
    }

    #[tokio::test]
    async fn test_missing_artifact_lists_exact_names() {
        let root = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(
            root.path(),
            r#"printf glb > "$2.glb"
printf fbx > "$2_processed.fbx"
echo '{"success": true}'
"#,
        );

        let err = orchestrator
            .convert(request("hat.png", "hat", Some(OutfitType::Hats)))
            .await
            .unwrap_err();

        match err {
            ConversionError::ArtifactMissing { missing } => {
                assert_eq!(missing, vec!["hat.usdz".to_string(), "hat_preview.png".to_string()]);
            }
            other => panic!("expected ArtifactMissing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let root = tempfile::tempdir().unwrap();
        let mut config = test_config(root.path());
        config.converter = write_script(root.path(), "slow.sh", "sleep 30\n");
        config.converter.timeout = Duration::from_millis(200);
        let orchestrator = Orchestrator::new(Storage::new(&config.storage), &config);

        let err = orchestrator.convert(request("vase.png", "vase", None)).await.unwrap_err();

        assert!(matches!(err, ConversionError::Timeout { after } if after == Duration::from_millis(200)));
        assert_eq!(job_dirs(orchestrator.storage().uploads_dir()), 0);
    }

    #[tokio::test]
    async fn test_validate_image_returns_verdict() {
        let root = tempfile::tempdir().unwrap();
        let mut config = test_config(root.path());
        config.validator = write_script(
            root.path(),
            "validate.sh",
            r#"echo '{"success": false, "message": "Image is too blurry", "details": {"blur_score": 12.5}}'
exit 1
"#,
        );
        let orchestrator = Orchestrator::new(Storage::new(&config.storage), &config);

        let verdict = orchestrator
            .validate_image(SourceImage {
                file_name: "blurry.jpg".to_string(),
                bytes: Bytes::from_static(b"jpg"),
            })
            .await
            .unwrap();

        assert!(!verdict.success);
        assert_eq!(verdict.message(), Some("Image is too blurry"));
        assert_eq!(job_dirs(orchestrator.storage().uploads_dir()), 0);
    }
}
