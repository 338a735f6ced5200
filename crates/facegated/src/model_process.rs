//! Face model running as an external program.
//!
//! Protocol: the program is invoked as `<cmd> [args...] <mode>` where mode is
//! `embed` or `analyze`. The image arrives PNG-encoded on stdin. The program
//! prints one JSON object on stdout:
//!
//! - `{"embedding": [f32, ...], "model_version": "..."}` for `embed`
//! - `{"attributes": {"age": .., "gender": .., "emotion": .., ...}}` for `analyze`
//! - `{"error": "no_face"}` or `{"error": "<message>"}` on failure

use facegate_core::{
    AttributeAnalyzer, DetectionError, Embedding, EmbeddingExtractor, FaceAttributes, ImageInput,
};
use serde::Deserialize;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const NO_FACE: &str = "no_face";
const STDERR_TAIL: usize = 512;

#[derive(Debug, Default, Deserialize)]
struct ModelReply {
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    attributes: Option<FaceAttributes>,
    #[serde(default)]
    error: Option<String>,
}

/// Spawns the configured model program once per call.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandExtractor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    fn run(&self, mode: &str, image: &ImageInput) -> Result<ModelReply, DetectionError> {
        let png = image
            .to_png()
            .map_err(|e| DetectionError::ExtractionFailed(e.to_string()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(mode)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                DetectionError::ExtractionFailed(format!(
                    "failed to start face model {}: {e}",
                    self.program.display()
                ))
            })?;

        // Pipes are drained on helper threads so a chatty model cannot
        // deadlock against a full pipe buffer.
        let stdin = child.stdin.take();
        let writer = thread::spawn(move || -> std::io::Result<()> {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&png)?;
            }
            Ok(())
        });
        let stdout_reader = drain(child.stdout.take());
        let stderr_reader = drain(child.stderr.take());

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    tracing::warn!(mode, timeout = ?self.timeout, "face model timed out; killed");
                    return Err(DetectionError::ExtractionFailed(format!(
                        "face model timed out after {:?}",
                        self.timeout
                    )));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    let _ = child.kill();
                    return Err(DetectionError::ExtractionFailed(format!(
                        "failed to wait for face model: {e}"
                    )));
                }
            }
        };

        if let Ok(Err(e)) = writer.join() {
            // Models may legitimately stop reading early (e.g. bail on a bad header).
            tracing::debug!(error = %e, "face model did not consume full image");
        }
        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        let reply = parse_reply(&stdout);
        if !status.success() {
            // A structured error on stdout wins over the bare exit status.
            if let Ok(reply @ ModelReply { error: Some(_), .. }) = reply {
                return Ok(reply);
            }
            let tail = tail_lossy(&stderr, STDERR_TAIL);
            tracing::warn!(mode, %status, stderr = %tail, "face model failed");
            return Err(DetectionError::ExtractionFailed(format!(
                "face model exited with {status}"
            )));
        }
        reply
    }
}

impl EmbeddingExtractor for CommandExtractor {
    fn extract(&mut self, image: &ImageInput) -> Result<Embedding, DetectionError> {
        let reply = self.run("embed", image)?;
        embedding_from_reply(reply)
    }
}

impl AttributeAnalyzer for CommandExtractor {
    fn analyze(&mut self, image: &ImageInput) -> Result<FaceAttributes, DetectionError> {
        let reply = self.run("analyze", image)?;
        attributes_from_reply(reply)
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn tail_lossy(bytes: &[u8], max: usize) -> String {
    let start = bytes.len().saturating_sub(max);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

fn parse_reply(stdout: &[u8]) -> Result<ModelReply, DetectionError> {
    serde_json::from_slice(stdout).map_err(|e| {
        DetectionError::ExtractionFailed(format!("face model returned invalid JSON: {e}"))
    })
}

fn reply_error(error: String) -> DetectionError {
    if error == NO_FACE {
        DetectionError::NoFaceDetected
    } else {
        DetectionError::ExtractionFailed(error)
    }
}

fn embedding_from_reply(reply: ModelReply) -> Result<Embedding, DetectionError> {
    if let Some(error) = reply.error {
        return Err(reply_error(error));
    }
    let values = reply.embedding.ok_or_else(|| {
        DetectionError::ExtractionFailed("face model reply has no embedding".into())
    })?;
    if values.is_empty() {
        return Err(DetectionError::ExtractionFailed(
            "face model returned an empty embedding".into(),
        ));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DetectionError::ExtractionFailed(
            "face model returned non-finite embedding values".into(),
        ));
    }
    Ok(Embedding {
        values,
        model_version: reply.model_version,
    })
}

fn attributes_from_reply(reply: ModelReply) -> Result<FaceAttributes, DetectionError> {
    if let Some(error) = reply.error {
        return Err(reply_error(error));
    }
    reply.attributes.ok_or_else(|| {
        DetectionError::ExtractionFailed("face model reply has no attributes".into())
    })
}
