//! Exactly-once completion of a relayed exchange
//!
//! Whatever way a stream ends, the [`Finalizer`] stores the assistant answer under the local
//! conversation id, optionally renders it into a document, and hands back the frames that
//! precede `done`. Every step is allowed to fail on its own; failures are logged and the
//! exchange still completes.

use super::frames::{ClientFrame, FileBlock};
use crate::render::{OutputFormat, Renderer};
use crate::store::{ChatStore, NewGeneratedFile, Role};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How the upstream side of the exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Turn end, done sentinel, or the stream closing normally.
    Completed,
    /// Gateway error event, dropped connection, timeout, or client disconnect.
    Failed,
}

/// What the finalizer did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    /// Id of the stored assistant message, if one was stored.
    pub message_id: Option<String>,
    pub file: Option<FileBlock>,
    /// Frames to write before `done`, in order.
    pub frames: Vec<ClientFrame>,
}

pub struct Finalizer {
    store: Arc<dyn ChatStore>,
    renderer: Arc<dyn Renderer>,
    conversation_id: String,
    output_format: OutputFormat,
    finalized: bool,
}

impl Finalizer {
    pub fn new(
        store: Arc<dyn ChatStore>,
        renderer: Arc<dyn Renderer>,
        conversation_id: impl Into<String>,
        output_format: OutputFormat,
    ) -> Self {
        Self {
            store,
            renderer,
            conversation_id: conversation_id.into(),
            output_format,
            finalized: false,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Run the completion steps. Only the first call does anything; later calls return `None`.
    pub async fn finalize(
        &mut self,
        text: &str,
        upstream_conversation_id: &str,
        termination: Termination,
    ) -> Option<Completion> {
        if self.finalized {
            debug!(conversation_id = %self.conversation_id, "Finalizer already ran");
            return None;
        }
        self.finalized = true;

        let mut completion = Completion::default();

        if !text.is_empty() {
            match self
                .store
                .add_message(&self.conversation_id, Role::Assistant, text)
                .await
            {
                Ok(id) => {
                    info!(conversation_id = %self.conversation_id, message_id = %id, "Stored assistant answer");
                    completion.message_id = Some(id);
                }
                Err(e) => {
                    error!(conversation_id = %self.conversation_id, error = %e, "Failed to store assistant answer");
                }
            }
        }

        if termination == Termination::Failed {
            return Some(completion);
        }

        if self.output_format.wants_file() && !text.trim().is_empty() {
            if let Some(file) = self
                .generate_file(text, completion.message_id.as_deref(), upstream_conversation_id)
                .await
            {
                completion.frames.push(ClientFrame::File(file.clone()));
                completion.file = Some(file);
            }
        }

        completion.frames.push(ClientFrame::Conversation {
            conversation_id: self.conversation_id.clone(),
            upstream_conversation_id: upstream_conversation_id.to_string(),
        });

        Some(completion)
    }

    async fn generate_file(
        &self,
        text: &str,
        message_id: Option<&str>,
        upstream_conversation_id: &str,
    ) -> Option<FileBlock> {
        let rendered = match self.renderer.render(text, self.output_format).await {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(format = %self.output_format, error = %e, "File generation failed");
                return None;
            }
        };

        match message_id {
            Some(message_id) => {
                let file_path = rendered.path.to_string_lossy();
                let record = NewGeneratedFile {
                    message_id,
                    filename: &rendered.filename,
                    file_path: &file_path,
                    mime_type: &rendered.mime_type,
                    format: self.output_format.as_str(),
                };
                if let Err(e) = self.store.add_generated_file(record).await {
                    error!(filename = %rendered.filename, error = %e, "Failed to store generated file");
                }
            }
            None => warn!(
                filename = %rendered.filename,
                "Generated file has no stored message to attach to"
            ),
        }

        Some(FileBlock {
            url: rendered.url(),
            filename: rendered.filename,
            mime_type: rendered.mime_type,
            conversation_id: upstream_conversation_id.to_string(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::render::{RenderError, RenderedFile};
    use crate::store::{
        Conversation, CopyStat, InMemoryStore, Message, StoreError, StoreStats, Visibility,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store whose every write fails.
    #[derive(Debug, Default)]
    pub(crate) struct FailingStore {
        pub(crate) attempts: AtomicUsize,
    }

    fn backend_down() -> StoreError {
        StoreError::Backend("database is down".into())
    }

    #[async_trait]
    impl ChatStore for FailingStore {
        async fn create_conversation(
            &self,
            _title: &str,
            _model: &str,
            _owner: Option<&str>,
        ) -> Result<String, StoreError> {
            Err(backend_down())
        }
        async fn get_conversation(&self, _id: &str) -> Result<Option<Conversation>, StoreError> {
            Err(backend_down())
        }
        async fn list_conversations(
            &self,
            _visibility: Visibility<'_>,
            _limit: usize,
            _offset: usize,
        ) -> Result<Vec<Conversation>, StoreError> {
            Err(backend_down())
        }
        async fn update_conversation_title(&self, _id: &str, _title: &str) -> Result<bool, StoreError> {
            Err(backend_down())
        }
        async fn delete_conversation(&self, _id: &str) -> Result<bool, StoreError> {
            Err(backend_down())
        }
        async fn add_message(
            &self,
            _conversation_id: &str,
            _role: Role,
            _content: &str,
        ) -> Result<String, StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(backend_down())
        }
        async fn message_conversation(&self, _message_id: &str) -> Result<Option<String>, StoreError> {
            Err(backend_down())
        }
        async fn get_messages(&self, _conversation_id: &str) -> Result<Vec<Message>, StoreError> {
            Err(backend_down())
        }
        async fn add_attachment(
            &self,
            _message_id: &str,
            _filename: &str,
            _file_path: &str,
            _mime_type: &str,
        ) -> Result<String, StoreError> {
            Err(backend_down())
        }
        async fn add_generated_file(&self, _file: NewGeneratedFile<'_>) -> Result<String, StoreError> {
            Err(backend_down())
        }
        async fn record_copy(&self, _message_id: &str) -> Result<Option<CopyStat>, StoreError> {
            Err(backend_down())
        }
        async fn copy_stat(&self, _message_id: &str) -> Result<Option<CopyStat>, StoreError> {
            Err(backend_down())
        }
        async fn stats(&self) -> Result<StoreStats, StoreError> {
            Err(backend_down())
        }
    }

    /// Renderer that always fails.
    pub(crate) struct BrokenRenderer;

    #[async_trait]
    impl Renderer for BrokenRenderer {
        async fn render(&self, _text: &str, _format: OutputFormat) -> Result<RenderedFile, RenderError> {
            Err(RenderError::Unsupported(OutputFormat::Pdf))
        }
    }

    async fn store_with_conversation() -> (Arc<InMemoryStore>, String) {
        let store = Arc::new(InMemoryStore::new());
        let id = store.create_conversation("t", "m", None).await.unwrap();
        (store, id)
    }

    fn renderer(dir: &tempfile::TempDir) -> Arc<dyn Renderer> {
        Arc::new(crate::render::FileRenderer::new(dir.path()))
    }

    #[tokio::test]
    async fn test_success_stores_answer_and_reports_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let (store, id) = store_with_conversation().await;
        let mut finalizer = Finalizer::new(store.clone(), renderer(&dir), &id, OutputFormat::Text);

        let completion = finalizer
            .finalize("Hello", "up1", Termination::Completed)
            .await
            .unwrap();

        assert!(completion.message_id.is_some());
        assert_eq!(completion.file, None);
        assert_eq!(
            completion.frames,
            vec![ClientFrame::Conversation {
                conversation_id: id.clone(),
                upstream_conversation_id: "up1".into(),
            }]
        );
        let messages = store.get_messages(&id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].content, "Hello");
    }

    #[tokio::test]
    async fn test_runs_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let (store, id) = store_with_conversation().await;
        let mut finalizer = Finalizer::new(store.clone(), renderer(&dir), &id, OutputFormat::Markdown);

        assert!(finalizer.finalize("Hello", &id, Termination::Completed).await.is_some());
        assert!(finalizer.finalize("Hello", &id, Termination::Failed).await.is_none());
        assert!(finalizer.is_finalized());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.messages, 1);
        assert_eq!(stats.generated_files, 1);
    }

    #[tokio::test]
    async fn test_markdown_output_links_generated_file() {
        let dir = tempfile::tempdir().unwrap();
        let (store, id) = store_with_conversation().await;
        let mut finalizer = Finalizer::new(store.clone(), renderer(&dir), &id, OutputFormat::Markdown);

        let completion = finalizer
            .finalize("# Report", "up1", Termination::Completed)
            .await
            .unwrap();

        let file = completion.file.clone().unwrap();
        assert!(file.filename.ends_with(".md"));
        assert_eq!(file.mime_type, "text/markdown");
        assert_eq!(file.conversation_id, "up1");
        assert!(matches!(completion.frames[0], ClientFrame::File(_)));
        assert!(matches!(completion.frames[1], ClientFrame::Conversation { .. }));

        let messages = store.get_messages(&id).await.unwrap();
        assert_eq!(messages[0].generated_files.len(), 1);
        assert_eq!(messages[0].generated_files[0].filename, file.filename);
    }

    #[tokio::test]
    async fn test_failure_path_keeps_partial_answer_without_frames() {
        let dir = tempfile::tempdir().unwrap();
        let (store, id) = store_with_conversation().await;
        let mut finalizer = Finalizer::new(store.clone(), renderer(&dir), &id, OutputFormat::Markdown);

        let completion = finalizer
            .finalize("partial", &id, Termination::Failed)
            .await
            .unwrap();

        assert!(completion.message_id.is_some());
        assert!(completion.frames.is_empty());
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.messages, 1);
        assert_eq!(stats.generated_files, 0);
    }

    #[tokio::test]
    async fn test_empty_answer_is_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let (store, id) = store_with_conversation().await;
        let mut finalizer = Finalizer::new(store.clone(), renderer(&dir), &id, OutputFormat::Markdown);

        let completion = finalizer
            .finalize("", &id, Termination::Completed)
            .await
            .unwrap();

        assert_eq!(completion.message_id, None);
        assert_eq!(completion.file, None);
        assert_eq!(completion.frames.len(), 1);
        assert_eq!(store.stats().await.unwrap().messages, 0);
    }

    #[tokio::test]
    async fn test_store_failure_does_not_stop_completion() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FailingStore::default());
        let mut finalizer = Finalizer::new(store.clone(), renderer(&dir), "local", OutputFormat::Markdown);

        let completion = finalizer
            .finalize("Hello", "up1", Termination::Completed)
            .await
            .unwrap();

        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(completion.message_id, None);
        // The document is still produced and announced
        assert!(completion.file.is_some());
        assert!(matches!(completion.frames.last(), Some(ClientFrame::Conversation { .. })));
    }

    #[tokio::test]
    async fn test_render_failure_omits_file_frame() {
        let (store, id) = store_with_conversation().await;
        let mut finalizer =
            Finalizer::new(store.clone(), Arc::new(BrokenRenderer), &id, OutputFormat::Pdf);

        let completion = finalizer
            .finalize("Hello", "up1", Termination::Completed)
            .await
            .unwrap();

        assert!(completion.message_id.is_some());
        assert_eq!(completion.file, None);
        assert_eq!(completion.frames.len(), 1);
        assert!(matches!(completion.frames[0], ClientFrame::Conversation { .. }));
    }
}
