//! Embedding extraction seam.
//!
//! Face detection and encoding are delegated to an external capability: given
//! an image, produce zero or more embeddings with bounding boxes. The core only
//! depends on the [`FaceExtractor`] trait.

use crate::types::Probe;
use image::{GrayImage, ImageFormat};
use std::io::{Cursor, Write};
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("failed to launch extractor `{program}`: {source}")]
    Launch {
        program: String,
        source: std::io::Error,
    },
    #[error("extractor exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("malformed extractor output: {0}")]
    MalformedOutput(#[from] serde_json::Error),
    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("extractor i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Produces probes (embedding + optional region) for every face in an image.
///
/// An empty result is valid: the image simply contained no detectable face.
pub trait FaceExtractor {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<Probe>, ExtractorError>;
}

impl<E: FaceExtractor + ?Sized> FaceExtractor for Box<E> {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<Probe>, ExtractorError> {
        (**self).detect(image)
    }
}

impl<E: FaceExtractor + ?Sized> FaceExtractor for &mut E {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<Probe>, ExtractorError> {
        (**self).detect(image)
    }
}

/// Runs a helper program once per image.
///
/// The image is written to the helper's stdin as PNG. The helper prints a JSON
/// array on stdout:
///
/// ```text
/// [{"embedding": [0.01, -0.12, ...], "box": {"x": 10, "y": 20, "width": 64, "height": 64}}]
/// ```
pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
}

impl CommandExtractor {
    /// Build from a shell-style command line, split on whitespace.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl FaceExtractor for CommandExtractor {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<Probe>, ExtractorError> {
        let mut png = Vec::new();
        image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExtractorError::Launch {
                program: self.program.clone(),
                source,
            })?;

        // Stdin is written from a scoped thread; the child is always reaped.
        let stdin = child.stdin.take();
        let (written, output) = std::thread::scope(|scope| {
            let writer = scope.spawn(move || match stdin {
                Some(mut stdin) => stdin.write_all(&png),
                None => Ok(()),
            });
            let output = child.wait_with_output();
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")));
            (written, output)
        });

        let output = output?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(ExtractorError::Failed {
                status: output.status.to_string(),
                stderr,
            });
        }
        if let Err(err) = written {
            return Err(ExtractorError::Failed {
                status: output.status.to_string(),
                stderr: format!("helper did not read the image: {err}"),
            });
        }

        parse_probes(&output.stdout)
    }
}

/// Parse the helper's JSON output. Blank output means no faces.
pub fn parse_probes(stdout: &[u8]) -> Result<Vec<Probe>, ExtractorError> {
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_slice(stdout)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_command_line_splits_args() {
        let ex = CommandExtractor::from_command_line("python3 extract.py --model hog").unwrap();
        assert_eq!(ex.program(), "python3");
        assert_eq!(ex.args, vec!["extract.py", "--model", "hog"]);
    }

    #[test]
    fn test_from_command_line_empty() {
        assert!(CommandExtractor::from_command_line("   ").is_none());
    }

    #[test]
    fn test_parse_probes_multiple_faces() {
        let out = br#"[
            {"embedding": [0.1, 0.2]},
            {"embedding": [0.3, 0.4], "box": {"x": 0, "y": 0, "width": 8, "height": 8}}
        ]"#;
        let probes = parse_probes(out).unwrap();
        assert_eq!(probes.len(), 2);
        assert!(probes[0].region.is_none());
        assert!(probes[1].region.is_some());
    }

    #[test]
    fn test_parse_probes_blank_is_empty() {
        assert!(parse_probes(b"\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_probes_malformed() {
        assert!(matches!(
            parse_probes(b"not json"),
            Err(ExtractorError::MalformedOutput(_))
        ));
    }

    #[test]
    fn test_missing_program_is_launch_error() {
        let mut ex = CommandExtractor::from_command_line("/nonexistent/rollcall-extract").unwrap();
        let img = GrayImage::new(4, 4);
        assert!(matches!(ex.detect(&img), Err(ExtractorError::Launch { .. })));
    }

    #[test]
    fn test_failing_helper_reports_stderr() {
        let mut ex =
            CommandExtractor::from_command_line("ls /nonexistent/rollcall-dataset").unwrap();
        let img = GrayImage::new(4, 4);
        match ex.detect(&img) {
            Err(ExtractorError::Failed { stderr, .. }) => {
                assert!(stderr.contains("rollcall-dataset"), "stderr was {stderr:?}");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn test_helper_that_ignores_stdin_is_failed_not_io() {
        // Noise does not compress, so the PNG is far larger than a pipe buffer.
        let mut s: u32 = 7;
        let img = GrayImage::from_fn(1500, 1500, |_, _| {
            s = s.wrapping_mul(1664525).wrapping_add(1013904223);
            image::Luma([(s >> 24) as u8])
        });
        let mut ex = CommandExtractor::from_command_line("true").unwrap();
        assert!(matches!(ex.detect(&img), Err(ExtractorError::Failed { .. })));
    }

    #[test]
    fn test_false_helper_is_failed() {
        let mut ex = CommandExtractor::from_command_line("false").unwrap();
        let img = GrayImage::new(4, 4);
        assert!(matches!(ex.detect(&img), Err(ExtractorError::Failed { .. })));
    }
}
