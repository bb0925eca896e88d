//! MP3 audio extraction through ffmpeg.
//!
//! [`Mp3Encoder`] implements [`mf_core::Encoder`]: it validates the source,
//! probes its duration, checks that the output filesystem has room, runs
//! ffmpeg with `-progress pipe:1` and forwards elapsed milliseconds to the
//! caller's progress callback.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use mf_core::{EncodeError, EncodeOutput, EncodeRequest, Encoder, ProgressFn};

use crate::command::ToolCommand;
use crate::disk;
use crate::probe::{FfprobeProber, ProbeSummary};
use crate::tools::ToolRegistry;

/// Container extensions the encoder expects; others are accepted with a warning.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "m4v", "mov", "avi", "mkv"];

/// Default hard limit for a single ffmpeg run.
const DEFAULT_ENCODE_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct Mp3Encoder {
    ffmpeg: PathBuf,
    prober: Option<FfprobeProber>,
    timeout: Duration,
}

impl Mp3Encoder {
    pub fn new(ffmpeg: PathBuf, ffprobe: Option<PathBuf>) -> Self {
        Self {
            ffmpeg,
            prober: ffprobe.map(FfprobeProber::new),
            timeout: DEFAULT_ENCODE_TIMEOUT,
        }
    }

    /// Build from discovered tools. ffmpeg is required; without ffprobe the
    /// encoder runs with no duration, audio check or disk-space check.
    pub fn from_registry(registry: &ToolRegistry) -> mf_core::Result<Self> {
        let ffmpeg = registry.require("ffmpeg")?.to_path_buf();
        let ffprobe = registry.get("ffprobe").map(Path::to_path_buf);
        if ffprobe.is_none() {
            tracing::warn!("ffprobe not found; progress and disk-space checks are disabled");
        }
        Ok(Self::new(ffmpeg, ffprobe))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn inspect(&self, input: &Path) -> Result<Option<ProbeSummary>, EncodeError> {
        let meta = tokio::fs::metadata(input)
            .await
            .map_err(|_| EncodeError::InvalidInput(format!("File not found: {}", input.display())))?;
        if !meta.is_file() {
            return Err(EncodeError::InvalidInput(format!(
                "Not a file: {}",
                input.display()
            )));
        }

        let ext = input
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            tracing::warn!("Unexpected file extension: {}", input.display());
        }

        let Some(prober) = &self.prober else {
            return Ok(None);
        };
        match prober.probe(input).await {
            Ok(summary) if !summary.has_audio => Err(EncodeError::InvalidInput(format!(
                "No audio stream found in: {}",
                display_name(input)
            ))),
            Ok(summary) => Ok(Some(summary)),
            Err(e) => {
                tracing::warn!("Could not inspect {}: {e}", display_name(input));
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Encoder for Mp3Encoder {
    async fn encode(
        &self,
        request: &EncodeRequest,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<EncodeOutput, EncodeError> {
        let input = &request.input;
        let output = &request.output;
        let name = display_name(input);

        let kbps = mf_core::parse_bitrate_kbps(&request.options.bitrate)
            .map_err(|e| EncodeError::InvalidInput(e.to_string()))?;
        if let Some(rate) = request.options.sample_rate {
            mf_core::validate_sample_rate(rate)
                .map_err(|e| EncodeError::InvalidInput(e.to_string()))?;
        }

        let summary = self.inspect(input).await?;
        let duration = summary.and_then(|s| s.duration);

        let out_dir = output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(out_dir).await.map_err(|e| {
            EncodeError::ConversionFailure(format!(
                "cannot create output directory {}: {e}",
                out_dir.display()
            ))
        })?;

        if let Some(duration) = duration {
            let required = disk::required_bytes(disk::estimate_output_bytes(kbps, duration));
            if !disk::has_space_for(out_dir, required) {
                let mb = required as f64 / (1024.0 * 1024.0);
                return Err(EncodeError::InsufficientSpace(format!(
                    "{mb:.1}MB required for {name}"
                )));
            }
        }

        let mut cmd = ToolCommand::new(self.ffmpeg.clone());
        cmd.timeout(self.timeout);
        cmd.args(build_ffmpeg_args(request));

        tracing::info!(input = %name, output = %output.display(), "Extracting audio");

        let total_ms = duration.map(|d| d.as_millis() as u64);
        let mut last_ms = 0u64;
        let run = cmd
            .execute_with_line_callback(|line| {
                let Some(total) = total_ms.filter(|t| *t > 0) else {
                    return;
                };
                if line.trim() == "progress=end" {
                    on_progress(total, total);
                } else if let Some(ms) = parse_progress_ms(line) {
                    let ms = ms.min(total);
                    if ms >= last_ms {
                        last_ms = ms;
                        on_progress(ms, total);
                    }
                }
            })
            .await;

        match run {
            Ok(_) => {}
            Err(mf_core::Error::ToolTimeout { after, .. }) => {
                return Err(EncodeError::Timeout(format!(
                    "Conversion of {name} timed out after {}s",
                    after.as_secs()
                )));
            }
            Err(e) => {
                tracing::error!(input = %name, "ffmpeg failed: {e}");
                return Err(EncodeError::ConversionFailure(format!(
                    "Conversion failed for {name}"
                )));
            }
        }

        let output_size = tokio::fs::metadata(output)
            .await
            .map(|m| m.len())
            .map_err(|_| {
                EncodeError::ConversionFailure(format!(
                    "Output file was not created: {}",
                    output.display()
                ))
            })?;

        tracing::info!(
            output = %output.display(),
            size_mb = output_size as f64 / (1024.0 * 1024.0),
            "Audio extracted"
        );

        Ok(EncodeOutput {
            output_path: output.clone(),
            output_size,
        })
    }
}

/// ffmpeg arguments for one extraction.
pub fn build_ffmpeg_args(request: &EncodeRequest) -> Vec<String> {
    let opts = &request.options;
    let mut args: Vec<String> = vec![
        "-i".into(),
        request.input.to_string_lossy().into_owned(),
        "-vn".into(),
        "-acodec".into(),
        "libmp3lame".into(),
        "-b:a".into(),
        opts.bitrate.clone(),
        "-q:a".into(),
        "0".into(),
    ];
    if let Some(rate) = opts.sample_rate {
        args.extend(["-ar".into(), rate.to_string()]);
    }
    args.extend([
        "-progress".into(),
        "pipe:1".into(),
        "-stats_period".into(),
        "0.5".into(),
    ]);
    if opts.preserve_metadata {
        args.extend(["-map_metadata".into(), "0".into()]);
    }
    args.extend(["-y".into(), request.output.to_string_lossy().into_owned()]);
    args
}

/// Elapsed output time in milliseconds from an ffmpeg `-progress` line.
///
/// Both `out_time_us` and `out_time_ms` carry microseconds.
pub fn parse_progress_ms(line: &str) -> Option<u64> {
    let line = line.trim();
    let value = line
        .strip_prefix("out_time_us=")
        .or_else(|| line.strip_prefix("out_time_ms="))?;
    value.trim().parse::<u64>().ok().map(|us| us / 1000)
}

/// `<stem>.mp3` inside `output_dir`, or next to the input when no directory
/// is given.
pub fn output_path_for(input: &Path, output_dir: Option<&Path>) -> PathBuf {
    let stem = input.file_stem().unwrap_or(input.as_os_str());
    let mut file = PathBuf::from(stem);
    file.set_extension("mp3");
    match output_dir {
        Some(dir) => dir.join(file),
        None => input.with_file_name(file),
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mf_core::EncodingOptions;

    fn request(options: EncodingOptions) -> EncodeRequest {
        EncodeRequest::new("/in/clip.mp4", "/out/clip.mp3", options)
    }

    #[test]
    fn default_args() {
        let args = build_ffmpeg_args(&request(EncodingOptions::default()));
        let joined = args.join(" ");
        assert_eq!(
            joined,
            "-i /in/clip.mp4 -vn -acodec libmp3lame -b:a 320k -q:a 0 \
             -progress pipe:1 -stats_period 0.5 -map_metadata 0 -y /out/clip.mp3"
        );
    }

    #[test]
    fn sample_rate_and_no_metadata() {
        let args = build_ffmpeg_args(&request(EncodingOptions {
            bitrate: "192k".into(),
            sample_rate: Some(44100),
            preserve_metadata: false,
        }));
        let joined = args.join(" ");
        assert!(joined.contains("-b:a 192k"));
        assert!(joined.contains("-ar 44100"));
        assert!(!joined.contains("-map_metadata"));
    }

    #[test]
    fn progress_lines() {
        assert_eq!(parse_progress_ms("out_time_us=1500000"), Some(1500));
        assert_eq!(parse_progress_ms("out_time_ms=2000000"), Some(2000));
        assert_eq!(parse_progress_ms("out_time_us=N/A"), None);
        assert_eq!(parse_progress_ms("out_time=00:00:01.500000"), None);
        assert_eq!(parse_progress_ms("progress=continue"), None);
    }

    #[test]
    fn output_naming() {
        assert_eq!(
            output_path_for(Path::new("/videos/talk.MP4"), None),
            PathBuf::from("/videos/talk.mp3")
        );
        assert_eq!(
            output_path_for(Path::new("/videos/talk.mkv"), Some(Path::new("/audio"))),
            PathBuf::from("/audio/talk.mp3")
        );
    }

    #[tokio::test]
    async fn missing_input_is_invalid() {
        let encoder = Mp3Encoder::new(PathBuf::from("ffmpeg"), None);
        let req = request(EncodingOptions::default());
        let err = encoder.encode(&req, &mut |_, _| {}).await.unwrap_err();
        assert!(matches!(err, EncodeError::InvalidInput(ref m) if m.contains("File not found")));
    }

    #[tokio::test]
    async fn directory_input_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = Mp3Encoder::new(PathBuf::from("ffmpeg"), None);
        let req = EncodeRequest::new(dir.path(), dir.path().join("x.mp3"), EncodingOptions::default());
        let err = encoder.encode(&req, &mut |_, _| {}).await.unwrap_err();
        assert!(matches!(err, EncodeError::InvalidInput(ref m) if m.contains("Not a file")));
    }

    #[tokio::test]
    async fn bad_bitrate_is_invalid() {
        let encoder = Mp3Encoder::new(PathBuf::from("ffmpeg"), None);
        let req = request(EncodingOptions {
            bitrate: "9000k".into(),
            ..EncodingOptions::default()
        });
        let err = encoder.encode(&req, &mut |_, _| {}).await.unwrap_err();
        assert!(matches!(err, EncodeError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn failing_tool_is_conversion_failure() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("clip.mp4");
        std::fs::write(&input, b"not really a video").unwrap();
        let encoder = Mp3Encoder::new(PathBuf::from("nonexistent_ffmpeg_xyz"), None);
        let req = EncodeRequest::new(&input, dir.path().join("out/clip.mp3"), EncodingOptions::default());
        let err = encoder.encode(&req, &mut |_, _| {}).await.unwrap_err();
        assert_eq!(err, EncodeError::ConversionFailure("Conversion failed for clip.mp4".into()));
        assert!(dir.path().join("out").is_dir());
    }
}
