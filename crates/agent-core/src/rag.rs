//! Retrieval-Augmented Generation
//!
//! Embeds the question, retrieves similar documents, folds them into the
//! system instruction and hands the question to the agent.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AgentError, Result};
use crate::events::AgentEvent;
use crate::message::Message;
use crate::reasoning::Agent;

/// Default instruction template; `{context}` receives the documents
pub const DEFAULT_INSTRUCTIONS: &str = "Use the following pieces of context to answer the question of the user. If you don't know the answer, just say that you don't know, don't try to make up an answer.\n\n{context}.";

/// Placeholder substituted with retrieved context
pub const CONTEXT_PLACEHOLDER: &str = "{context}";

/// A retrievable piece of text
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,

    #[serde(default)]
    pub embedding: Vec<f32>,

    /// Hex SHA-256 of `content`
    pub hash: String,

    /// Similarity score, set by the vector store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            hash: content_hash(&content),
            content,
            embedding: Vec::new(),
            score: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }
}

/// Hex SHA-256 of `content`
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Turns text into vectors
#[async_trait]
pub trait EmbeddingsProvider: Send + Sync {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>>;

    /// Fill in the document's embedding
    async fn embed_document(&self, mut document: Document) -> Result<Document> {
        document.embedding = self.embed_text(&document.content).await?;
        Ok(document)
    }
}

/// Similarity search over embedded documents
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn add_document(&self, document: Document) -> Result<()>;

    async fn add_documents(&self, documents: Vec<Document>) -> Result<()> {
        for document in documents {
            self.add_document(document).await?;
        }
        Ok(())
    }

    /// Up to `k` documents, most relevant first
    async fn similarity_search(&self, embedding: &[f32], k: usize) -> Result<Vec<Document>>;
}

/// In-memory vector store using cosine similarity (for development/testing)
#[derive(Default)]
pub struct MemoryVectorStore {
    documents: RwLock<Vec<Document>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn add_document(&self, document: Document) -> Result<()> {
        if document.embedding.is_empty() {
            return Err(AgentError::VectorStore(
                "document has no embedding".into(),
            ));
        }
        self.documents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(document);
        Ok(())
    }

    async fn similarity_search(&self, embedding: &[f32], k: usize) -> Result<Vec<Document>> {
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);

        let mut scored: Vec<Document> = documents
            .iter()
            .filter(|d| d.embedding.len() == embedding.len())
            .map(|d| {
                let mut doc = d.clone();
                doc.score = Some(cosine_similarity(&d.embedding, embedding));
                doc
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .unwrap_or_default()
                .total_cmp(&a.score.unwrap_or_default())
        });
        scored.truncate(k);
        Ok(scored)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Drop documents whose hash was already seen, keeping rank order
pub fn dedup_documents(documents: Vec<Document>) -> Vec<Document> {
    let mut seen = HashSet::new();
    documents
        .into_iter()
        .filter(|d| seen.insert(d.hash.clone()))
        .collect()
}

/// Space-joined content of the first `k` documents, each followed by a space
pub fn build_context(documents: &[Document], k: usize) -> String {
    documents.iter().take(k).fold(String::new(), |mut context, d| {
        context.push_str(&d.content);
        context.push(' ');
        context
    })
}

/// RAG pipeline on top of an [`Agent`]
pub struct Rag {
    agent: Arc<Agent>,
    embeddings: Arc<dyn EmbeddingsProvider>,
    store: Arc<dyn VectorStore>,
    template: RwLock<String>,
}

impl Rag {
    pub fn new(
        agent: Arc<Agent>,
        embeddings: Arc<dyn EmbeddingsProvider>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            agent,
            embeddings,
            store,
            template: RwLock::new(DEFAULT_INSTRUCTIONS.to_string()),
        }
    }

    /// Use a custom instruction template
    pub fn with_template(self, template: impl Into<String>) -> Self {
        *self.template.write().unwrap_or_else(PoisonError::into_inner) = template.into();
        self
    }

    pub fn template(&self) -> String {
        self.template.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    pub fn vector_store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Embed and store a document
    pub async fn add_document(&self, document: Document) -> Result<()> {
        let document = self.embeddings.embed_document(document).await?;
        self.store.add_document(document).await
    }

    /// Embed the question and fetch up to `k` unique documents
    pub async fn search_documents(&self, question: &str, k: usize) -> Result<Vec<Document>> {
        let embedding = self.embeddings.embed_text(question).await?;
        let documents = self.store.similarity_search(&embedding, k).await?;
        Ok(dedup_documents(documents))
    }

    /// Render the template with the documents and install it as the
    /// agent's instruction; returns `(old, new)`
    pub fn set_system_message(&self, documents: &[Document], k: usize) -> (Option<String>, String) {
        let instructions = self
            .template()
            .replace(CONTEXT_PLACEHOLDER, &build_context(documents, k));
        let old = self.agent.set_instructions(instructions.clone());
        (old, instructions)
    }

    /// Answer `question` with retrieved context
    pub async fn answer(&self, question: Message, k: usize) -> Result<Message> {
        let events = self.agent.events();

        events.notify(AgentEvent::AnswerStart {
            question: question.clone(),
        });

        events.notify(AgentEvent::SearchStart {
            question: question.clone(),
        });
        let documents = self.search_documents(&question.content, k).await?;
        tracing::debug!(documents = documents.len(), k, "Retrieved context documents");
        events.notify(AgentEvent::SearchResult {
            question: question.clone(),
            documents: documents.clone(),
        });

        events.notify(AgentEvent::InstructionsChanging {
            old: self.agent.instructions(),
        });
        let (old, new) = self.set_system_message(&documents, k);
        events.notify(AgentEvent::InstructionsChanged {
            old,
            new: new.clone(),
        });

        let answer = self.agent.chat_with_instructions(question, Some(new)).await?;

        events.notify(AgentEvent::AnswerStop {
            answer: answer.clone(),
        });
        Ok(answer)
    }
}
