//! Work items fed to the scheduler

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Image sent alongside the prompt (page image)
///
/// Only the path is held; the bytes are read when an attempt builds its
/// request, so a task list never holds image data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub path: PathBuf,
}

impl Attachment {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name, for logs
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Read the current file content
    pub async fn load(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }
}

/// Request content for one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub prompt: String,
    pub attachment: Option<Attachment>,
}

impl Payload {
    /// Text-only payload
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            attachment: None,
        }
    }

    /// Prompt plus an image attachment
    pub fn with_attachment(prompt: impl Into<String>, attachment: Attachment) -> Self {
        Self {
            prompt: prompt.into(),
            attachment: Some(attachment),
        }
    }
}

/// One unit of work
///
/// Identity is `id`. The payload is shared and never mutated, so cloning a
/// task for a retry or a spawned attempt is cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub payload: Arc<Payload>,
}

impl Task {
    pub fn new(id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            payload: Arc::new(payload),
        }
    }
}
