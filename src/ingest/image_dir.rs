#![cfg(feature = "ingest-images")]
//! Still-image replay source.
//!
//! Replays a local directory of images (sorted by file name) as RGB24 frames,
//! which is how recorded scenes are fed through the pipeline without a camera.
//! Files that fail to decode are skipped with a warning.

use std::path::{Path, PathBuf};
use std::time::Instant;

use super::{FrameSource, SourceConfig, SourceStats};
use crate::error::PipelineError;
use crate::frame::{Frame, PixelFormat};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

pub struct ImageDirSource {
    config: SourceConfig,
    dir: PathBuf,
    files: Vec<PathBuf>,
    position: usize,
    connected: bool,
    sequence: u64,
    connects: u64,
    next_due: Option<Instant>,
    last_error: Option<String>,
}

impl ImageDirSource {
    pub fn new(config: SourceConfig) -> Result<Self, PipelineError> {
        let raw = config.uri.strip_prefix("file://").unwrap_or(&config.uri);
        if raw.trim().is_empty() || raw.contains("://") {
            return Err(PipelineError::Stage {
                stage: "source",
                reason: format!("image replay only supports local paths, got {:?}", raw),
            });
        }
        Ok(Self {
            dir: PathBuf::from(raw),
            config,
            files: Vec::new(),
            position: 0,
            connected: false,
            sequence: 0,
            connects: 0,
            next_due: None,
            last_error: None,
        })
    }

    fn scan(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && has_image_extension(path))
            .collect();
        files.sort();
        Ok(files)
    }

    fn pace(&mut self) {
        if !self.config.realtime {
            return;
        }
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        self.next_due = Some(due.max(now) + self.config.frame_interval());
    }

    /// Next file index to decode, honouring looping.
    fn advance(&mut self) -> Option<usize> {
        if self.position >= self.files.len() {
            if !self.config.looping || self.files.is_empty() {
                return None;
            }
            self.position = 0;
        }
        let index = self.position;
        self.position += 1;
        Some(index)
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

impl FrameSource for ImageDirSource {
    fn name(&self) -> &str {
        &self.config.uri
    }

    fn connect(&mut self) -> Result<(), PipelineError> {
        let files = Self::scan(&self.dir).map_err(|err| {
            let message = format!("read image directory {}: {}", self.dir.display(), err);
            self.last_error = Some(message.clone());
            PipelineError::CaptureUnavailable(message)
        })?;
        if files.is_empty() {
            let message = format!("no images in {}", self.dir.display());
            self.last_error = Some(message.clone());
            return Err(PipelineError::CaptureUnavailable(message));
        }
        self.files = files;
        self.position = self.position.min(self.files.len());
        self.connected = true;
        self.connects += 1;
        self.next_due = None;
        self.last_error = None;
        log::info!(
            "ImageDirSource: connected to {} ({} images)",
            self.dir.display(),
            self.files.len()
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        if !self.connected {
            return Err(PipelineError::CaptureUnavailable(format!(
                "{} is not connected",
                self.dir.display()
            )));
        }
        if let Some(limit) = self.config.max_frames {
            if self.sequence >= limit {
                return Ok(None);
            }
        }

        // At most one full pass over the directory looking for a decodable file.
        for _ in 0..self.files.len() {
            let Some(index) = self.advance() else {
                return Ok(None);
            };
            let path = &self.files[index];
            let decoded = match image::open(path) {
                Ok(decoded) => decoded.into_rgb8(),
                Err(err) => {
                    log::warn!("ImageDirSource: skipping {}: {}", path.display(), err);
                    continue;
                }
            };
            let (width, height) = decoded.dimensions();
            self.pace();
            self.sequence += 1;
            return Ok(Some(Frame::new(
                decoded.into_raw(),
                width,
                height,
                PixelFormat::Rgb24,
                self.sequence,
            )));
        }

        let message = format!("no decodable images in {}", self.dir.display());
        self.last_error = Some(message.clone());
        Err(PipelineError::CaptureUnavailable(message))
    }

    fn disconnect(&mut self) {
        if self.connected {
            log::info!("ImageDirSource: disconnected from {}", self.dir.display());
        }
        self.connected = false;
    }

    fn is_healthy(&self) -> bool {
        self.connected && self.last_error.is_none()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.sequence,
            connects: self.connects,
            last_error: self.last_error.clone(),
        }
    }
}
