use std::{io, process::Stdio, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{io::AsyncWriteExt, process::Command, sync::Semaphore, time::Instant};
use tracing::{debug, instrument};

use super::{normalize, Classifier, ClassifierError, LabelScore, Prediction, PredictionSource};
use crate::config::{ClassifierConfig, PayloadInput};
use crate::images::ImagePayload;

/// Linux rejects any single argv string longer than 32 pages (`MAX_ARG_STRLEN`),
/// counting the trailing NUL.
pub const MAX_ARG_PAYLOAD: usize = 32 * 4096 - 1;

/// Whether base64 of an image up to `max_image_bytes` fits in one argument.
pub fn arg_payload_fits(max_image_bytes: usize) -> bool {
    (max_image_bytes + 2) / 3 * 4 <= MAX_ARG_PAYLOAD
}

/// Runs the prediction script once per image.
///
/// The script prints one JSON object on stdout, either a prediction
/// (`predicted_disease`, `confidence`, `all_predictions`) or `{"error": ...}`.
pub struct SubprocessClassifier {
    program: String,
    args: Vec<String>,
    input: PayloadInput,
    timeout: Duration,
    permits: Semaphore,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScriptOutput {
    Failure {
        error: String,
    },
    Success {
        #[serde(alias = "predicted_class")]
        predicted_disease: String,
        confidence: f64,
        #[serde(default)]
        all_predictions: Vec<LabelScore>,
    },
}

impl SubprocessClassifier {
    pub fn new(cfg: &ClassifierConfig) -> Self {
        Self {
            program: cfg.program.clone(),
            args: cfg.args.clone(),
            input: cfg.input,
            timeout: cfg.timeout,
            permits: Semaphore::new(cfg.max_concurrency.max(1)),
        }
    }

    async fn run(&self, payload: &str) -> Result<std::process::Output, ClassifierError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match self.input {
            PayloadInput::Arg => {
                if payload.len() > MAX_ARG_PAYLOAD {
                    return Err(ClassifierError::ArgTooLong {
                        len: payload.len(),
                        limit: MAX_ARG_PAYLOAD,
                    });
                }
                cmd.arg(payload).stdin(Stdio::null());
            }
            PayloadInput::Stdin => {
                cmd.stdin(Stdio::piped());
            }
        }

        let mut child = cmd.spawn().map_err(ClassifierError::Spawn)?;
        let stdin = child.stdin.take();
        let write = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(payload.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, io::Error>(())
        };

        // Dropping the child on timeout kills it.
        let (written, output) = tokio::time::timeout(self.timeout, async move {
            tokio::join!(write, child.wait_with_output())
        })
        .await
        .map_err(|_| ClassifierError::Timeout(self.timeout))?;

        let output = output.map_err(ClassifierError::Io)?;
        if let Err(e) = written {
            // A script that exits early closes its stdin; let the exit status speak.
            debug!(error = %e, "writing classifier stdin failed");
        }
        Ok(output)
    }
}

#[async_trait]
impl Classifier for SubprocessClassifier {
    #[instrument(skip_all, fields(program = %self.program, bytes = image.bytes.len()))]
    async fn classify(&self, image: &ImagePayload) -> Result<Prediction, ClassifierError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ClassifierError::Io(io::Error::new(io::ErrorKind::Other, e)))?;

        let started = Instant::now();
        let output = self.run(&image.base64).await?;
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            status = ?output.status.code(),
            "classifier process finished"
        );

        if !output.status.success() {
            return Err(ClassifierError::ExitStatus {
                code: output.status.code(),
                stderr: failure_detail(&output),
            });
        }
        parse_output(&output.stdout)
    }

    fn describe(&self) -> String {
        format!("subprocess:{} {}", self.program, self.args.join(" "))
            .trim_end()
            .to_string()
    }
}

/// First few lines of stderr, or of stdout when stderr is empty.
fn failure_detail(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let text = if stderr.trim().is_empty() {
        stdout.trim()
    } else {
        stderr.trim()
    };
    text.lines().take(5).collect::<Vec<_>>().join("\n")
}

fn parse_output(stdout: &[u8]) -> Result<Prediction, ClassifierError> {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ClassifierError::MalformedOutput("empty output".into()));
    }

    let parsed = serde_json::from_str::<ScriptOutput>(trimmed)
        .or_else(|e| {
            // Libraries sometimes print warnings before the result line.
            match trimmed.lines().map(str::trim).filter(|l| !l.is_empty()).last() {
                Some(line) if line != trimmed => serde_json::from_str(line),
                _ => Err(e),
            }
        })
        .map_err(|e| ClassifierError::MalformedOutput(e.to_string()))?;

    match parsed {
        ScriptOutput::Failure { error } => Err(ClassifierError::Reported(error)),
        ScriptOutput::Success {
            predicted_disease,
            confidence,
            all_predictions,
        } => normalize(
            predicted_disease,
            confidence,
            all_predictions,
            PredictionSource::Model,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_limit_covers_small_images_only() {
        assert!(arg_payload_fits(64 * 1024));
        assert!(!arg_payload_fits(10 * 1024 * 1024));
    }

    #[test]
    fn parses_percent_output_from_script() {
        let out = br#"{"predicted_disease":"babesia","confidence":91.5,"all_predictions":[{"disease":"babesia","confidence":91.5},{"disease":"monocyte","confidence":8.5}]}"#;
        let p = parse_output(out).unwrap();
        assert_eq!(p.label, "babesia");
        assert_eq!(p.source, PredictionSource::Model);
        assert!((p.confidence - 0.915).abs() < 1e-9);
        assert!((p.all_predictions[1].confidence - 0.085).abs() < 1e-9);
    }

    #[test]
    fn parses_last_line_after_noise() {
        let out = b"UserWarning: something\n{\"predicted_class\":\"monocyte\",\"confidence\":0.6}\n";
        let p = parse_output(out).unwrap();
        assert_eq!(p.label, "monocyte");
        assert_eq!(p.all_predictions.len(), 1);
    }

    #[test]
    fn error_object_is_reported() {
        let err = parse_output(br#"{"error":"Failed to load model"}"#).unwrap_err();
        assert!(matches!(err, ClassifierError::Reported(m) if m == "Failed to load model"));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            parse_output(b"not json at all"),
            Err(ClassifierError::MalformedOutput(_))
        ));
        assert!(matches!(
            parse_output(b"   \n"),
            Err(ClassifierError::MalformedOutput(_))
        ));
    }

    #[cfg(unix)]
    mod process {
        use super::*;

        fn sh(script: &str, input: PayloadInput, timeout: Duration) -> SubprocessClassifier {
            SubprocessClassifier::new(&ClassifierConfig {
                program: "sh".into(),
                args: vec!["-c".into(), script.into(), "sh".into()],
                input,
                timeout,
                ..ClassifierConfig::default()
            })
        }

        #[tokio::test]
        async fn payload_arrives_as_argument() {
            let c = sh(
                r#"[ -n "$1" ] && echo '{"predicted_disease":"leishmania","confidence":0.8}'"#,
                PayloadInput::Arg,
                Duration::from_secs(10),
            );
            let p = c.classify(&ImagePayload::sample_png()).await.unwrap();
            assert_eq!(p.label, "leishmania");
            assert_eq!(p.confidence, 0.8);
        }

        #[tokio::test]
        async fn payload_arrives_on_stdin() {
            let c = sh(
                r#"read -r img; [ -n "$img" ] && echo '{"predicted_disease":"trypanosome","confidence":55}'"#,
                PayloadInput::Stdin,
                Duration::from_secs(10),
            );
            let p = c.classify(&ImagePayload::sample_png()).await.unwrap();
            assert_eq!(p.label, "trypanosome");
            assert!((p.confidence - 0.55).abs() < 1e-9);
        }

        #[tokio::test]
        async fn non_zero_exit_carries_stderr() {
            let c = sh("echo boom >&2; exit 3", PayloadInput::Arg, Duration::from_secs(10));
            let err = c.classify(&ImagePayload::sample_png()).await.unwrap_err();
            match err {
                ClassifierError::ExitStatus { code, stderr } => {
                    assert_eq!(code, Some(3));
                    assert_eq!(stderr, "boom");
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        #[tokio::test]
        async fn slow_process_times_out() {
            let c = sh("sleep 5", PayloadInput::Arg, Duration::from_millis(100));
            let err = c.classify(&ImagePayload::sample_png()).await.unwrap_err();
            assert!(matches!(err, ClassifierError::Timeout(_)));
        }

        #[tokio::test]
        async fn large_image_is_refused_as_argument() {
            let c = sh(
                r#"echo '{"predicted_disease":"babesia","confidence":0.9}'"#,
                PayloadInput::Arg,
                Duration::from_secs(10),
            );
            let image = ImagePayload::sample_png_padded(256 * 1024);
            let err = c.classify(&image).await.unwrap_err();
            match err {
                ClassifierError::ArgTooLong { len, limit } => {
                    assert_eq!(len, image.base64.len());
                    assert_eq!(limit, MAX_ARG_PAYLOAD);
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        #[tokio::test]
        async fn large_image_streams_over_stdin() {
            let c = sh(
                r#"n=$(wc -c); [ $n -gt 262144 ] && echo '{"predicted_disease":"babesia","confidence":0.9}'"#,
                PayloadInput::Stdin,
                Duration::from_secs(10),
            );
            let p = c
                .classify(&ImagePayload::sample_png_padded(256 * 1024))
                .await
                .unwrap();
            assert_eq!(p.label, "babesia");
        }

        #[tokio::test]
        async fn missing_program_fails_to_spawn() {
            let c = SubprocessClassifier::new(&ClassifierConfig {
                program: "/nonexistent/bloodsmear-predict".into(),
                args: vec![],
                ..ClassifierConfig::default()
            });
            let err = c.classify(&ImagePayload::sample_png()).await.unwrap_err();
            assert!(matches!(err, ClassifierError::Spawn(_)));
        }
    }
}
