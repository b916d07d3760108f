//! Rendering of final answers into downloadable documents
//!
//! [`FileRenderer`] writes Markdown, Word and PDF documents into the generated-files
//! directory. Markdown is stored verbatim. Word and PDF documents get a title, a generation
//! timestamp and one paragraph per line of the answer, with `#`-prefixed lines set as
//! headings. Plain text has no document form and is reported as
//! [`RenderError::Unsupported`].

use async_trait::async_trait;
use chrono::Utc;
use docx_rs::{Docx, Paragraph, Run};
use printpdf::{BuiltinFont, IndirectFontRef, Mm, PdfDocument};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Route under which generated files are served.
pub const FILES_ROUTE: &str = "/api/files";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Markdown,
    Docx,
    Pdf,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Text => "text",
            OutputFormat::Markdown => "markdown",
            OutputFormat::Docx => "docx",
            OutputFormat::Pdf => "pdf",
        }
    }

    /// Whether the answer should be turned into a document at all.
    pub fn wants_file(&self) -> bool {
        !matches!(self, OutputFormat::Text)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Text => "txt",
            OutputFormat::Markdown => "md",
            OutputFormat::Docx => "docx",
            OutputFormat::Pdf => "pdf",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Text => "text/plain",
            OutputFormat::Markdown => "text/markdown",
            OutputFormat::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            OutputFormat::Pdf => "application/pdf",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// MIME type for a file served from the generated-files directory, by extension.
pub fn mime_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("pdf") => OutputFormat::Pdf.mime_type(),
        Some("docx") => OutputFormat::Docx.mime_type(),
        Some("md") => OutputFormat::Markdown.mime_type(),
        _ => "application/octet-stream",
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("output format '{0}' is not supported")]
    Unsupported(OutputFormat),
    #[error("failed to encode {format} document: {message}")]
    Encode {
        format: OutputFormat,
        message: String,
    },
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Heading of every generated Word or PDF document.
const DOCUMENT_TITLE: &str = "AI Generated Document";

/// One line of a generated document.
#[derive(Debug, Clone, PartialEq)]
enum Block {
    Title(String),
    Heading(String),
    Paragraph(String),
    Blank,
}

fn blocks(text: &str, generated_at: &str) -> Vec<Block> {
    let mut blocks = vec![
        Block::Title(DOCUMENT_TITLE.to_string()),
        Block::Paragraph(format!("Generated at: {generated_at}")),
        Block::Blank,
    ];
    for line in text.lines().map(str::trim) {
        let block = if line.is_empty() {
            Block::Blank
        } else if let Some(heading) = ["### ", "## ", "# "]
            .iter()
            .find_map(|prefix| line.strip_prefix(prefix))
        {
            Block::Heading(heading.trim().to_string())
        } else {
            Block::Paragraph(line.to_string())
        };
        blocks.push(block);
    }
    blocks
}

fn encode_error(format: OutputFormat, error: impl fmt::Display) -> RenderError {
    RenderError::Encode {
        format,
        message: error.to_string(),
    }
}

/// Word document: sizes are in half-points.
fn docx_bytes(blocks: &[Block]) -> Result<Vec<u8>, RenderError> {
    let docx = blocks.iter().fold(Docx::new(), |docx, block| {
        let run = match block {
            Block::Title(text) => Run::new().add_text(text).bold().size(36),
            Block::Heading(text) => Run::new().add_text(text).bold().size(28),
            Block::Paragraph(text) => Run::new().add_text(text).size(22),
            Block::Blank => Run::new(),
        };
        docx.add_paragraph(Paragraph::new().add_run(run))
    });

    let mut buffer = Cursor::new(Vec::new());
    docx.build()
        .pack(&mut buffer)
        .map_err(|e| encode_error(OutputFormat::Docx, e))?;
    Ok(buffer.into_inner())
}

// US letter, one inch margins
const PAGE_WIDTH_MM: f32 = 215.9;
const PAGE_HEIGHT_MM: f32 = 279.4;
const MARGIN_MM: f32 = 25.4;
const PT_TO_MM: f32 = 0.3528;
const WRAP_COLUMNS: usize = 90;

/// Greedy word wrap; words longer than a line are split.
fn wrap(text: &str, columns: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while word.len() > columns {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            lines.push(word.drain(..columns).collect());
        }
        let word: String = word.into_iter().collect();
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > columns {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

fn pdf_bytes(blocks: &[Block]) -> Result<Vec<u8>, RenderError> {
    let (doc, page, layer) = PdfDocument::new(
        DOCUMENT_TITLE,
        Mm(PAGE_WIDTH_MM),
        Mm(PAGE_HEIGHT_MM),
        "content",
    );
    let regular = doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(|e| encode_error(OutputFormat::Pdf, e))?;
    let bold = doc
        .add_builtin_font(BuiltinFont::HelveticaBold)
        .map_err(|e| encode_error(OutputFormat::Pdf, e))?;

    let mut layer = doc.get_page(page).get_layer(layer);
    let mut y = PAGE_HEIGHT_MM - MARGIN_MM;
    for block in blocks {
        let (text, size, font): (&str, f32, &IndirectFontRef) = match block {
            Block::Title(text) => (text.as_str(), 18.0, &bold),
            Block::Heading(text) => (text.as_str(), 14.0, &bold),
            Block::Paragraph(text) => (text.as_str(), 11.0, &regular),
            Block::Blank => {
                y -= 6.0 * PT_TO_MM;
                continue;
            }
        };
        let line_height = size * 1.4 * PT_TO_MM;
        for line in wrap(text, WRAP_COLUMNS) {
            if y - line_height < MARGIN_MM {
                let (page, next) = doc.add_page(Mm(PAGE_WIDTH_MM), Mm(PAGE_HEIGHT_MM), "content");
                layer = doc.get_page(page).get_layer(next);
                y = PAGE_HEIGHT_MM - MARGIN_MM;
            }
            y -= line_height;
            layer.use_text(line, size, Mm(MARGIN_MM), Mm(y), font);
        }
    }

    doc.save_to_bytes().map_err(|e| encode_error(OutputFormat::Pdf, e))
}

/// A document produced from an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedFile {
    pub filename: String,
    pub path: PathBuf,
    pub mime_type: String,
}

impl RenderedFile {
    /// Download URL relative to this service.
    pub fn url(&self) -> String {
        format!("{FILES_ROUTE}/{}", self.filename)
    }
}

#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, text: &str, format: OutputFormat) -> Result<RenderedFile, RenderError>;
}

/// Writes rendered documents into a directory on disk.
#[derive(Debug, Clone)]
pub struct FileRenderer {
    output_dir: PathBuf,
}

impl FileRenderer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn next_filename(format: OutputFormat) -> String {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("ai_response_{timestamp}_{}.{}", &id[..8], format.extension())
    }
}

#[async_trait]
impl Renderer for FileRenderer {
    async fn render(&self, text: &str, format: OutputFormat) -> Result<RenderedFile, RenderError> {
        let generated_at = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let bytes = match format {
            OutputFormat::Markdown => text.as_bytes().to_vec(),
            OutputFormat::Docx => docx_bytes(&blocks(text, &generated_at))?,
            OutputFormat::Pdf => pdf_bytes(&blocks(text, &generated_at))?,
            OutputFormat::Text => {
                debug!(format = %format, "No document form for output format");
                return Err(RenderError::Unsupported(format));
            }
        };

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| RenderError::Io {
                path: self.output_dir.clone(),
                source,
            })?;

        let filename = Self::next_filename(format);
        let path = self.output_dir.join(&filename);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|source| RenderError::Io {
                path: path.clone(),
                source,
            })?;

        info!(filename = %filename, format = %format, bytes = bytes.len(), "Rendered answer");
        Ok(RenderedFile {
            filename,
            path,
            mime_type: format.mime_type().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_markdown_is_written_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = FileRenderer::new(dir.path());

        let file = renderer
            .render("# Title\n\nbody", OutputFormat::Markdown)
            .await
            .unwrap();

        assert!(file.filename.starts_with("ai_response_"));
        assert!(file.filename.ends_with(".md"));
        assert_eq!(file.mime_type, "text/markdown");
        assert_eq!(file.url(), format!("/api/files/{}", file.filename));
        let written = tokio::fs::read_to_string(&file.path).await.unwrap();
        assert_eq!(written, "# Title\n\nbody");
    }

    #[tokio::test]
    async fn test_plain_text_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = FileRenderer::new(dir.path());

        let result = renderer.render("text", OutputFormat::Text).await;
        assert!(matches!(result, Err(RenderError::Unsupported(OutputFormat::Text))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_docx_is_a_word_package() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = FileRenderer::new(dir.path());

        let file = renderer
            .render("# Report\n\nFirst line\nSecond line", OutputFormat::Docx)
            .await
            .unwrap();

        assert!(file.filename.ends_with(".docx"));
        assert_eq!(
            file.mime_type,
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        );
        assert_eq!(mime_for_filename(&file.filename), file.mime_type);
        let bytes = std::fs::read(&file.path).unwrap();
        // Word documents are zip archives
        assert_eq!(&bytes[..2], b"PK");
    }

    #[tokio::test]
    async fn test_pdf_is_written_across_pages() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = FileRenderer::new(dir.path());
        let long_answer = (0..200)
            .map(|i| format!("Line {i} of a long answer"))
            .collect::<Vec<_>>()
            .join("\n");

        let file = renderer.render(&long_answer, OutputFormat::Pdf).await.unwrap();

        assert!(file.filename.ends_with(".pdf"));
        assert_eq!(file.mime_type, "application/pdf");
        let bytes = std::fs::read(&file.path).unwrap();
        assert!(bytes.starts_with(b"%PDF"));
    }

    #[test]
    fn test_blocks_follow_the_answer_lines() {
        let blocks = blocks("# Title\n\n## Part\nbody  ", "2024-01-01 00:00:00");
        assert_eq!(
            blocks,
            vec![
                Block::Title(DOCUMENT_TITLE.into()),
                Block::Paragraph("Generated at: 2024-01-01 00:00:00".into()),
                Block::Blank,
                Block::Heading("Title".into()),
                Block::Blank,
                Block::Heading("Part".into()),
                Block::Paragraph("body".into()),
            ]
        );
    }

    #[test]
    fn test_wrap() {
        assert_eq!(wrap("aaa bbb ccc", 7), vec!["aaa bbb", "ccc"]);
        assert_eq!(wrap("abcdefghij", 4), vec!["abcd", "efgh", "ij"]);
        assert!(wrap("   ", 10).is_empty());
    }

    #[test]
    fn test_output_format_parsing() {
        let format: OutputFormat = serde_json::from_str("\"markdown\"").unwrap();
        assert_eq!(format, OutputFormat::Markdown);
        assert!(format.wants_file());
        assert!(!OutputFormat::default().wants_file());
        assert!(serde_json::from_str::<OutputFormat>("\"html\"").is_err());
    }

    #[test]
    fn test_mime_for_filename() {
        assert_eq!(mime_for_filename("a.PDF"), "application/pdf");
        assert_eq!(mime_for_filename("a.md"), "text/markdown");
        assert_eq!(mime_for_filename("noext"), "application/octet-stream");
    }
}
