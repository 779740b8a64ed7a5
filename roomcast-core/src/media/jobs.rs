//! Asynchronous media tool jobs (remux / re-encode / extract) against an
//! in-process queue. Jobs never touch room state directly; a completed
//! extract lands in the manifest store, which `tracks_for` merges on the
//! next read.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::manifest::{ExternalTrackRecord, ManifestStore};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Audio,
    Subtitle,
}

/// What the operator asked for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "preset", rename_all = "camelCase")]
pub enum JobRequest {
    /// Copy all streams into a new container.
    #[serde(rename_all = "camelCase")]
    Remux { container: String },
    /// Decode, optionally scale, and re-encode.
    #[serde(rename_all = "camelCase")]
    Reencode {
        video_codec: String,
        #[serde(default)]
        bitrate_kbps: Option<u32>,
        #[serde(default)]
        scale_height: Option<u32>,
    },
    /// Pull one stream out into a sidecar file.
    #[serde(rename_all = "camelCase")]
    Extract {
        stream: StreamKind,
        stream_index: u32,
        #[serde(default)]
        language: Option<String>,
    },
}

impl JobRequest {
    fn kind(&self) -> &'static str {
        match self {
            Self::Remux { .. } => "remux",
            Self::Reencode { .. } => "re-encode",
            Self::Extract { .. } => "extract",
        }
    }

    /// Reject request fields that could escape the output directory or
    /// smuggle separators into an output filename.
    fn validate(&self) -> Result<()> {
        match self {
            Self::Remux { container } => validate_name_component(container, "container"),
            Self::Reencode { video_codec, .. } => {
                validate_name_component(video_codec, "video codec")
            }
            Self::Extract { language, .. } => match language {
                Some(lang) => validate_name_component(lang, "language"),
                None => Ok(()),
            },
        }
    }
}

/// A single filename component: short, ASCII alphanumeric with `-`/`_`,
/// never a path.
fn validate_name_component(value: &str, what: &str) -> Result<()> {
    if value.is_empty()
        || value.len() > 32
        || !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Validation(format!("Invalid {what}: {value}")));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaJob {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub filename: String,
    pub status: JobStatus,
    pub progress: u8,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// In-process job queue. Partial outputs of failed or cancelled jobs are
/// intentionally left on disk for the operator.
pub struct JobQueue {
    media_dir: PathBuf,
    output_dir: PathBuf,
    manifests: ManifestStore,
    jobs: DashMap<String, MediaJob>,
    cancels: DashMap<String, CancellationToken>,
}

impl JobQueue {
    #[must_use]
    pub fn new(media_dir: PathBuf, output_dir: PathBuf, manifests: ManifestStore) -> Self {
        Self {
            media_dir,
            output_dir,
            manifests,
            jobs: DashMap::new(),
            cancels: DashMap::new(),
        }
    }

    /// Enqueue a job and start it immediately.
    pub fn submit(self: &Arc<Self>, filename: String, request: JobRequest) -> Result<MediaJob> {
        request.validate()?;
        let input = self.media_dir.join(&filename);
        if !input.exists() {
            return Err(Error::NotFound(format!("No such media file: {filename}")));
        }

        let job = MediaJob {
            id: nanoid!(10),
            kind: request.kind().to_string(),
            filename: filename.clone(),
            status: JobStatus::Pending,
            progress: 0,
            start_time: Utc::now(),
            duration: None,
            error: None,
        };
        let token = CancellationToken::new();
        self.jobs.insert(job.id.clone(), job.clone());
        self.cancels.insert(job.id.clone(), token.clone());

        let queue = Arc::clone(self);
        let job_id = job.id.clone();
        tokio::spawn(async move {
            queue.run_job(&job_id, &filename, request, token).await;
        });

        Ok(job)
    }

    /// Mark a job cancelled and kill its subprocess where feasible.
    pub fn cancel(&self, id: &str) -> bool {
        if let Some(token) = self.cancels.get(id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn list(&self) -> Vec<MediaJob> {
        let mut jobs: Vec<MediaJob> = self.jobs.iter().map(|e| e.value().clone()).collect();
        jobs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        jobs
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<MediaJob> {
        self.jobs.get(id).map(|e| e.value().clone())
    }

    fn update<F: FnOnce(&mut MediaJob)>(&self, id: &str, apply: F) {
        if let Some(mut job) = self.jobs.get_mut(id) {
            apply(job.value_mut());
        }
    }

    async fn run_job(
        &self,
        id: &str,
        filename: &str,
        request: JobRequest,
        token: CancellationToken,
    ) {
        let started = std::time::Instant::now();
        self.update(id, |j| {
            j.status = JobStatus::Running;
            j.progress = 5;
        });

        let result = self.execute(id, filename, &request, &token).await;
        let elapsed = started.elapsed().as_secs_f64();

        if token.is_cancelled() {
            self.update(id, |j| {
                j.status = JobStatus::Cancelled;
                j.duration = Some(elapsed);
            });
            info!(job = id, file = filename, "Media job cancelled");
            return;
        }

        match result {
            Ok(()) => {
                self.update(id, |j| {
                    j.status = JobStatus::Completed;
                    j.progress = 100;
                    j.duration = Some(elapsed);
                });
                info!(job = id, file = filename, elapsed, "Media job completed");
            }
            Err(e) => {
                self.update(id, |j| {
                    j.status = JobStatus::Failed;
                    j.duration = Some(elapsed);
                    j.error = Some(e.to_string());
                });
                warn!(job = id, file = filename, error = %e, "Media job failed");
            }
        }
        self.cancels.remove(id);
    }

    async fn execute(
        &self,
        id: &str,
        filename: &str,
        request: &JobRequest,
        token: &CancellationToken,
    ) -> Result<()> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let input = self.media_dir.join(filename);
        let stem = Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(filename)
            .to_string();

        let (args, output_path) = match request {
            JobRequest::Remux { container } => {
                let out = self.output_dir.join(format!("{stem}.{container}"));
                (
                    vec![
                        "-map".to_string(),
                        "0".to_string(),
                        "-c".to_string(),
                        "copy".to_string(),
                    ],
                    out,
                )
            }
            JobRequest::Reencode {
                video_codec,
                bitrate_kbps,
                scale_height,
            } => {
                let out = self.output_dir.join(format!("{stem}.reencoded.mp4"));
                let mut args = Vec::new();
                if let Some(height) = scale_height {
                    args.push("-vf".to_string());
                    args.push(format!("scale=-2:{height}"));
                }
                args.push("-c:v".to_string());
                args.push(video_codec.clone());
                if let Some(kbps) = bitrate_kbps {
                    args.push("-b:v".to_string());
                    args.push(format!("{kbps}k"));
                }
                args.push("-c:a".to_string());
                args.push("aac".to_string());
                (args, out)
            }
            JobRequest::Extract {
                stream,
                stream_index,
                language,
            } => {
                let lang = language.as_deref().unwrap_or("und");
                let (selector, ext, codec_args) = match stream {
                    StreamKind::Subtitle => ("s", "vtt", vec![]),
                    StreamKind::Audio => (
                        "a",
                        "m4a",
                        vec!["-c:a".to_string(), "aac".to_string()],
                    ),
                };
                let out = self.output_dir.join(format!("{stem}.{lang}.{ext}"));
                let mut args = vec![
                    "-map".to_string(),
                    format!("0:{selector}:{stream_index}"),
                ];
                args.extend(codec_args);
                (args, out)
            }
        };

        self.update(id, |j| j.progress = 25);
        self.run_ffmpeg(&input, &args, &output_path, token).await?;
        self.update(id, |j| j.progress = 90);

        if let JobRequest::Extract {
            stream, language, ..
        } = request
        {
            if output_path.extension().and_then(|e| e.to_str()) == Some("vtt") {
                let raw = tokio::fs::read_to_string(&output_path).await?;
                tokio::fs::write(&output_path, dedupe_vtt_cues(&raw)).await?;
            }
            let url_name = output_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            self.manifests
                .add_external_track(
                    filename,
                    ExternalTrackRecord {
                        track_type: match stream {
                            StreamKind::Audio => "audio".to_string(),
                            StreamKind::Subtitle => "subtitle".to_string(),
                        },
                        lang: language.clone(),
                        title: None,
                        path: output_path.clone(),
                        url: format!("/tracks/{url_name}"),
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn run_ffmpeg(
        &self,
        input: &Path,
        args: &[String],
        output: &Path,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut child = tokio::process::Command::new("ffmpeg")
            .arg("-y")
            .arg("-i")
            .arg(input)
            .args(args)
            .arg(output)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Internal(format!("ffmpeg unavailable: {e}")))?;

        tokio::select! {
            () = token.cancelled() => {
                let _ = child.kill().await;
                // Partial output stays on disk for the operator.
                Ok(())
            }
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    Ok(())
                } else {
                    Err(Error::Internal(format!(
                        "ffmpeg exited with {}",
                        status.code().map_or("signal".to_string(), |c| c.to_string())
                    )))
                }
            }
        }
    }
}

/// Strip artefactual cues from an extracted VTT: empty payloads and exact
/// consecutive duplicates, both common in extractions of image-based subs
/// run through OCR or of padded broadcast captions.
#[must_use]
pub fn dedupe_vtt_cues(raw: &str) -> String {
    let mut blocks = raw.split("\n\n");
    let header = blocks.next().unwrap_or("WEBVTT").trim_end();

    let mut out = vec![header.to_string()];
    let mut last_payload: Option<String> = None;

    for block in blocks {
        let trimmed = block.trim();
        if trimmed.is_empty() {
            continue;
        }
        let payload: String = trimmed
            .lines()
            .skip_while(|line| !line.contains("-->"))
            .skip(1)
            .collect::<Vec<_>>()
            .join("\n");
        if payload.trim().is_empty() {
            continue;
        }
        if last_payload.as_deref() == Some(payload.as_str()) {
            continue;
        }
        last_payload = Some(payload);
        out.push(trimmed.to_string());
    }

    let mut result = out.join("\n\n");
    result.push('\n');
    result
}

/// Parse `ffmpeg -encoders` output into the encoder name list the admin UI
/// offers for re-encode presets.
pub async fn list_encoders() -> Result<Vec<String>> {
    let output = tokio::process::Command::new("ffmpeg")
        .args(["-hide_banner", "-encoders"])
        .output()
        .await
        .map_err(|e| Error::Internal(format!("ffmpeg unavailable: {e}")))?;

    let text = String::from_utf8_lossy(&output.stdout);
    Ok(parse_encoder_list(&text))
}

fn parse_encoder_list(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim_start();
            // Encoder rows look like "V....D libx264    H.264 ...".
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            if !(flags.starts_with('V') || flags.starts_with('A')) || flags.contains('=') {
                return None;
            }
            parts.next().map(String::from)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vtt_dedupe_drops_empty_and_duplicate_cues() {
        let raw = "WEBVTT\n\n\
            00:00:01.000 --> 00:00:02.000\nHello\n\n\
            00:00:02.000 --> 00:00:03.000\nHello\n\n\
            00:00:03.000 --> 00:00:04.000\n\n\n\
            00:00:04.000 --> 00:00:05.000\nWorld\n";
        let cleaned = dedupe_vtt_cues(raw);
        assert_eq!(cleaned.matches("Hello").count(), 1);
        assert!(cleaned.contains("World"));
        assert!(!cleaned.contains("00:00:03.000"));
        assert!(cleaned.starts_with("WEBVTT"));
    }

    #[test]
    fn vtt_dedupe_keeps_repeats_with_gap() {
        let raw = "WEBVTT\n\n\
            00:00:01.000 --> 00:00:02.000\nHello\n\n\
            00:00:02.000 --> 00:00:03.000\nOther\n\n\
            00:00:03.000 --> 00:00:04.000\nHello\n";
        let cleaned = dedupe_vtt_cues(raw);
        assert_eq!(cleaned.matches("Hello").count(), 2);
    }

    #[test]
    fn encoder_list_parses_video_and_audio_rows() {
        let text = "Encoders:\n V..... = Video\n ------\n \
                    V....D libx264              H.264 / AVC\n \
                    A....D aac                  AAC (Advanced Audio Coding)\n \
                    S..... srt                  SubRip subtitle\n";
        let encoders = parse_encoder_list(text);
        assert!(encoders.contains(&"libx264".to_string()));
        assert!(encoders.contains(&"aac".to_string()));
        assert!(!encoders.iter().any(|e| e == "srt"));
    }

    #[tokio::test]
    async fn submitting_for_missing_file_fails() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let queue = Arc::new(JobQueue::new(
            dir.path().join("media"),
            dir.path().join("out"),
            ManifestStore::new(dir.path().join("manifests")),
        ));
        let err = queue
            .submit(
                "ghost.mkv".to_string(),
                JobRequest::Remux {
                    container: "mp4".to_string(),
                },
            )
            .expect_err("missing input");
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn traversal_in_request_fields_is_rejected() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let media_dir = dir.path().join("media");
        tokio::fs::create_dir_all(&media_dir).await.expect("mkdir");
        tokio::fs::write(media_dir.join("movie.mkv"), b"x")
            .await
            .expect("write");

        let queue = Arc::new(JobQueue::new(
            media_dir,
            dir.path().join("out"),
            ManifestStore::new(dir.path().join("manifests")),
        ));

        let bad_requests = [
            JobRequest::Remux {
                container: "../../etc/foo".to_string(),
            },
            JobRequest::Remux {
                container: "mp4/evil".to_string(),
            },
            JobRequest::Extract {
                stream: StreamKind::Subtitle,
                stream_index: 0,
                language: Some("..\\eng".to_string()),
            },
            JobRequest::Reencode {
                video_codec: "libx264; rm -rf".to_string(),
                bitrate_kbps: None,
                scale_height: None,
            },
        ];
        for request in bad_requests {
            let err = queue
                .submit("movie.mkv".to_string(), request)
                .expect_err("traversal rejected");
            assert!(matches!(err, Error::Validation(_)));
        }

        assert!(JobRequest::Remux {
            container: "mp4".to_string()
        }
        .validate()
        .is_ok());
        assert!(JobRequest::Extract {
            stream: StreamKind::Subtitle,
            stream_index: 0,
            language: Some("pt-BR".to_string()),
        }
        .validate()
        .is_ok());
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_false() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let queue = JobQueue::new(
            dir.path().join("media"),
            dir.path().join("out"),
            ManifestStore::new(dir.path().join("manifests")),
        );
        assert!(!queue.cancel("nope"));
    }
}
