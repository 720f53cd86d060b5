//! Task sources
//!
//! A [`TaskSource`] is the static, ordered task list handed to the
//! scheduler. Directory scanners build one from page images or markdown
//! files; ids are file stems, made unique with a numeric suffix.

use crate::error::ScanError;
use crate::models::{Attachment, Payload, Task};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Image extensions picked up by [`TaskSource::scan_images`]
pub const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

/// Markdown extensions picked up by [`TaskSource::scan_markdown`]
pub const MARKDOWN_EXTENSIONS: [&str; 1] = ["md"];

/// Placeholder replaced by the file content in markdown prompt templates
pub const CONTENT_PLACEHOLDER: &str = "{content}";

pub const DEFAULT_IMAGE_PROMPT: &str = "Analyze this document page and extract every rule, \
requirement and numeric limit it states. Respond with a single JSON object and nothing else.";

pub const DEFAULT_MARKDOWN_PROMPT: &str = "Extract every rule, requirement and numeric limit \
stated in the text below. Respond with a single JSON array of rule objects and nothing else. \
Use decimal numbers, not fractions.\n\n{content}";

/// Static ordered list of tasks
#[derive(Debug, Clone, Default)]
pub struct TaskSource {
    tasks: Vec<Task>,
}

impl TaskSource {
    /// Wrap an explicit task list; duplicate ids get a numeric suffix
    pub fn from_tasks(tasks: Vec<Task>) -> Self {
        let mut seen = HashSet::new();
        let tasks = tasks
            .into_iter()
            .map(|task| {
                let id = unique_id(&task.id, &mut seen);
                Task {
                    id,
                    payload: task.payload,
                }
            })
            .collect();
        Self { tasks }
    }

    /// One task per image: `prompt` plus the image path as attachment
    ///
    /// Image bytes are not read here; each attempt loads its own file.
    pub fn scan_images(dir: &Path, prompt: &str) -> Result<Self, ScanError> {
        let files = scan_files(dir, &IMAGE_EXTENSIONS)?;
        let mut seen = HashSet::new();
        let tasks: Vec<Task> = files
            .into_iter()
            .map(|path| {
                let id = unique_id(&file_stem(&path), &mut seen);
                Task::new(id, Payload::with_attachment(prompt, Attachment::new(path)))
            })
            .collect();

        tracing::info!(dir = %dir.display(), tasks = tasks.len(), "Scanned image tasks");
        Ok(Self { tasks })
    }

    /// One task per markdown file
    ///
    /// The file content replaces `{content}` in `prompt_template`, or is
    /// appended after a blank line when the template has no placeholder.
    pub fn scan_markdown(dir: &Path, prompt_template: &str) -> Result<Self, ScanError> {
        let files = scan_files(dir, &MARKDOWN_EXTENSIONS)?;
        let mut seen = HashSet::new();
        let mut tasks = Vec::with_capacity(files.len());

        for path in files {
            let content = std::fs::read_to_string(&path).map_err(|source| ScanError::Read {
                path: path.clone(),
                source,
            })?;
            let id = unique_id(&file_stem(&path), &mut seen);
            tasks.push(Task::new(id, Payload::text(render_prompt(prompt_template, &content))));
        }

        tracing::info!(dir = %dir.display(), tasks = tasks.len(), "Scanned markdown tasks");
        Ok(Self { tasks })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn into_tasks(self) -> Vec<Task> {
        self.tasks
    }
}

fn render_prompt(template: &str, content: &str) -> String {
    if template.contains(CONTENT_PLACEHOLDER) {
        template.replace(CONTENT_PLACEHOLDER, content)
    } else {
        format!("{}\n\n{}", template, content)
    }
}

/// Files under `dir` with one of `extensions` (case-insensitive), sorted
fn scan_files(dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>, ScanError> {
    if !dir.exists() {
        return Err(ScanError::NotFound(dir.to_path_buf()));
    }
    if !dir.is_dir() {
        return Err(ScanError::NotADirectory(dir.to_path_buf()));
    }

    let walker = WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e));

    let mut files = Vec::new();
    for entry in walker {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_file() && has_extension(entry.path(), extensions) {
                    files.push(entry.into_path());
                }
            }
            Err(e) => {
                // Unreadable entries are skipped, not fatal
                tracing::warn!("Error accessing entry: {}", e);
            }
        }
    }

    files.sort();
    Ok(files)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| extensions.contains(&ext.as_str()))
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "task".to_string())
}

/// `base`, or `base_2`, `base_3`, ... if already taken
fn unique_id(base: &str, seen: &mut HashSet<String>) -> String {
    if seen.insert(base.to_string()) {
        return base.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}_{}", base, n);
        if seen.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_scan_images_filters_sorts_and_skips_hidden() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("page_002.PNG"), b"png-2").unwrap();
        fs::write(dir.path().join("page_001.jpg"), b"jpg-1").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        fs::write(dir.path().join(".page_000.png"), b"hidden").unwrap();
        fs::create_dir(dir.path().join(".cache")).unwrap();
        fs::write(dir.path().join(".cache").join("page_009.png"), b"hidden").unwrap();

        let source = TaskSource::scan_images(dir.path(), "Analyze").unwrap();
        let ids: Vec<&str> = source.tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["page_001", "page_002"]);

        let payload = &source.tasks()[0].payload;
        assert_eq!(payload.prompt, "Analyze");
        let attachment = payload.attachment.as_ref().unwrap();
        assert_eq!(attachment.path(), dir.path().join("page_001.jpg"));
        assert_eq!(attachment.file_name(), "page_001.jpg");
    }

    #[tokio::test]
    async fn test_scan_images_defers_reading_bytes() {
        let dir = TempDir::new().unwrap();
        let page = dir.path().join("page_001.png");
        fs::write(&page, b"before").unwrap();

        let source = TaskSource::scan_images(dir.path(), "Analyze").unwrap();
        fs::write(&page, b"after the scan").unwrap();

        let attachment = source.tasks()[0].payload.attachment.clone().unwrap();
        assert_eq!(attachment.load().await.unwrap(), b"after the scan");

        fs::remove_file(&page).unwrap();
        assert!(attachment.load().await.is_err());
    }

    #[test]
    fn test_scan_markdown_renders_prompt() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("chapter_1.md"), "# Setbacks\nFront: 20 ft").unwrap();

        let source = TaskSource::scan_markdown(dir.path(), "Rules:\n{content}\nEnd").unwrap();
        assert_eq!(source.len(), 1);
        assert_eq!(
            source.tasks()[0].payload.prompt,
            "Rules:\n# Setbacks\nFront: 20 ft\nEnd"
        );

        let appended = TaskSource::scan_markdown(dir.path(), "Extract").unwrap();
        assert_eq!(
            appended.tasks()[0].payload.prompt,
            "Extract\n\n# Setbacks\nFront: 20 ft"
        );
    }

    #[test]
    fn test_colliding_stems_get_suffix() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("a")).unwrap();
        fs::create_dir(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("a").join("page.png"), b"1").unwrap();
        fs::write(dir.path().join("b").join("page.png"), b"2").unwrap();
        fs::write(dir.path().join("page.webp"), b"3").unwrap();

        let source = TaskSource::scan_images(dir.path(), "p").unwrap();
        let ids: Vec<&str> = source.tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["page", "page_2", "page_3"]);
    }

    #[test]
    fn test_missing_and_non_directory_inputs() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            TaskSource::scan_images(&dir.path().join("nope"), "p"),
            Err(ScanError::NotFound(_))
        ));

        let file = dir.path().join("file.md");
        fs::write(&file, "x").unwrap();
        assert!(matches!(
            TaskSource::scan_markdown(&file, "p"),
            Err(ScanError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_from_tasks_dedupes_ids() {
        let source = TaskSource::from_tasks(vec![
            Task::new("t", Payload::text("a")),
            Task::new("t", Payload::text("b")),
        ]);
        assert_eq!(source.tasks()[1].id, "t_2");
        assert!(!source.is_empty());
    }
}
