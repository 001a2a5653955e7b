//! Built-in tools

use std::sync::Arc;

use agent_core::{
    error::Result,
    rag::{dedup_documents, EmbeddingsProvider, VectorStore},
    tool::{ParameterSchema, Tool, ToolCall, ToolResult, ToolSchema},
};
use async_trait::async_trait;
use chrono::{FixedOffset, Utc};

/// Current date and time, optionally shifted to a UTC offset
pub struct DateTimeTool;

#[async_trait]
impl Tool for DateTimeTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "current_datetime".into(),
            description: "Get the current date and time (RFC 3339).".into(),
            parameters: vec![ParameterSchema::optional(
                "utc_offset_hours",
                "integer",
                "Offset from UTC in whole hours, e.g. 2 or -5",
            )],
        }
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult> {
        let hours = call
            .inputs
            .get("utc_offset_hours")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        let Some(offset) = i32::try_from(hours)
            .ok()
            .and_then(|h| h.checked_mul(3600))
            .and_then(FixedOffset::east_opt)
        else {
            return Ok(ToolResult::failure(
                "current_datetime",
                format!("Invalid UTC offset: {} hours", hours),
            ));
        };

        let now = Utc::now().with_timezone(&offset);
        Ok(ToolResult::success("current_datetime", now.to_rfc3339())
            .with_data(serde_json::json!({ "timestamp": now.timestamp() })))
    }
}

/// Lets the model query the document store directly
pub struct KnowledgeSearchTool {
    embeddings: Arc<dyn EmbeddingsProvider>,
    store: Arc<dyn VectorStore>,
    k: usize,
}

impl KnowledgeSearchTool {
    pub fn new(embeddings: Arc<dyn EmbeddingsProvider>, store: Arc<dyn VectorStore>, k: usize) -> Self {
        Self { embeddings, store, k }
    }
}

#[async_trait]
impl Tool for KnowledgeSearchTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "search_knowledge".into(),
            description: "Search the document store for passages relevant to a query.".into(),
            parameters: vec![ParameterSchema::required("query", "string", "What to look for")],
        }
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult> {
        let query = call.input_str("query").unwrap_or_default();

        let embedding = self.embeddings.embed_text(query).await?;
        let documents = dedup_documents(self.store.similarity_search(&embedding, self.k).await?);

        if documents.is_empty() {
            return Ok(ToolResult::success("search_knowledge", "No matching documents."));
        }

        let output = documents
            .iter()
            .enumerate()
            .map(|(i, d)| format!("[{}] {}", i + 1, d.content))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ToolResult::success("search_knowledge", output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::rag::{Document, MemoryVectorStore};
    use agent_core::tool::ToolRegistry;

    struct AxisEmbeddings;

    #[async_trait]
    impl EmbeddingsProvider for AxisEmbeddings {
        async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
            Ok(if text.contains("rust") { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
        }
    }

    #[tokio::test]
    async fn test_datetime_offset() {
        let registry = ToolRegistry::new();
        registry.register(DateTimeTool).unwrap();

        let call = ToolCall::parse("1", "current_datetime", r#"{"utc_offset_hours":2}"#).unwrap();
        let result = registry.execute(&call).await;
        assert!(result.success);
        assert!(result.output.ends_with("+02:00"));

        let call = ToolCall::parse("2", "current_datetime", r#"{"utc_offset_hours":99}"#).unwrap();
        assert!(!registry.execute(&call).await.success);
    }

    #[tokio::test]
    async fn test_knowledge_search() {
        let store = Arc::new(MemoryVectorStore::new());
        store
            .add_documents(vec![
                Document::new("rust ownership").with_embedding(vec![1.0, 0.0]),
                Document::new("python gil").with_embedding(vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let tool = KnowledgeSearchTool::new(Arc::new(AxisEmbeddings), store, 1);
        let call = ToolCall::parse("1", "search_knowledge", r#"{"query":"rust borrowck"}"#).unwrap();
        let result = tool.execute(&call).await.unwrap();
        assert_eq!(result.output, "[1] rust ownership");
    }
}
