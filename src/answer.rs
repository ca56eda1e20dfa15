//! Retrieval-augmented answering: ask, bug scan and feature guidance.
//!
//! All three flows embed the question, pull the most similar files of the
//! project and stream an answer constrained to that context. Plain questions
//! are classified first; bug-hunting questions get a fixed refusal and are
//! pointed at the dedicated bug-scan flow.

use std::fmt::Write;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::error::Result;
use crate::gateway::ModelGateway;
use crate::llm::{once_text, TextStream};
use crate::models::{ChatMessage, FileReference, ScoredRecord};
use crate::store::EmbeddingStore;

pub const REFUSAL_TEXT: &str = "I'm sorry, but I don't have the answer you are looking for.";
pub const UNKNOWN_ANSWER: &str = "I'm sorry, but I don't know the answer.";
pub const FEATURE_FALLBACK: &str = "I'm sorry, but I don't have enough information to provide a precise recommendation for adding this component.";

/// How a plain question is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Grounded,
    Refusal,
}

/// Case-insensitive substring match against the bug keyword set.
pub fn classify_intent(text: &str, keywords: &[String]) -> Intent {
    let lowered = text.to_lowercase();
    if keywords
        .iter()
        .any(|k| !k.is_empty() && lowered.contains(&k.to_lowercase()))
    {
        Intent::Refusal
    } else {
        Intent::Grounded
    }
}

/// Files the answer is grounded in, known before the first fragment, and
/// the answer itself.
pub struct Answer {
    pub files_used: Vec<FileReference>,
    pub text: TextStream,
}

pub struct Answerer {
    gateway: Arc<ModelGateway>,
    store: Arc<dyn EmbeddingStore>,
    policy: RetrievalConfig,
}

impl Answerer {
    pub fn new(
        gateway: Arc<ModelGateway>,
        store: Arc<dyn EmbeddingStore>,
        policy: RetrievalConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            policy,
        }
    }

    /// Answer a free-text question about the project.
    pub async fn answer(&self, project_id: Uuid, question: &str) -> Result<Answer> {
        if classify_intent(question, &self.policy.bug_keywords) == Intent::Refusal {
            tracing::info!(%project_id, "Question matched a bug keyword, refusing");
            return Ok(Answer {
                files_used: Vec::new(),
                text: once_text(REFUSAL_TEXT),
            });
        }
        self.grounded(project_id, question, self.policy.ask_threshold, ask_system_prompt())
            .await
    }

    /// Look for bugs related to `question`. No keyword filter applies.
    pub async fn scan_bugs(&self, project_id: Uuid, question: &str) -> Result<Answer> {
        self.grounded(
            project_id,
            question,
            self.policy.bug_scan_threshold,
            bug_scan_system_prompt(),
        )
        .await
    }

    /// Advise how to integrate a new component. Casts a wider net than
    /// [`Answerer::answer`].
    pub async fn feature_guidance(&self, project_id: Uuid, request: &str) -> Result<Answer> {
        self.grounded(
            project_id,
            request,
            self.policy.feature_threshold,
            feature_system_prompt(),
        )
        .await
    }

    /// Embed `query` and return the project's best matches above `threshold`.
    pub async fn retrieve(
        &self,
        project_id: Uuid,
        query: &str,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>> {
        let vector = self.gateway.embed(query).await?;
        self.store
            .similarity_search(project_id, &vector, threshold, limit)
            .await
    }

    async fn grounded(
        &self,
        project_id: Uuid,
        question: &str,
        threshold: f32,
        system_prompt: String,
    ) -> Result<Answer> {
        let hits = self
            .retrieve(project_id, question, threshold, self.policy.top_k)
            .await?;
        tracing::info!(%project_id, hits = hits.len(), threshold, "Retrieved context");

        let (context, used) = build_context_block(&hits, self.policy.context_max_chars);
        let messages = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user(format!(
                "{context}---\nQuestion: {}",
                sanitize_for_prompt(question)
            )),
        ];

        let text = self.gateway.stream(messages).await?;
        Ok(Answer {
            files_used: hits[..used].iter().map(|h| h.record.reference()).collect(),
            text,
        })
    }
}

/// The context block, and how many of `hits` fit into `max_chars`. The best
/// match is always included, cut if it alone is over budget.
fn build_context_block(hits: &[ScoredRecord], max_chars: usize) -> (String, usize) {
    let mut ctx = String::from("START CONTEXT BLOCK\n");
    if hits.is_empty() {
        ctx.push_str("(No relevant code was found for this question.)\n");
    }

    let mut used = 0;
    for hit in hits {
        let mut entry = String::new();
        let _ = write!(
            entry,
            "source: {}\ncode content: {}\nsummary of file: {}\n\n",
            hit.record.file_name,
            sanitize_for_prompt(&hit.record.source_code),
            sanitize_for_prompt(&hit.record.summary),
        );
        if ctx.len() + entry.len() > max_chars {
            if used == 0 {
                let (head, _) = crate::ingest::truncate_chars(&entry, max_chars);
                ctx.push_str(head);
                ctx.push('\n');
                used = 1;
            }
            break;
        }
        ctx.push_str(&entry);
        used += 1;
    }
    ctx.push_str("END OF CONTEXT BLOCK\n");
    (ctx, used)
}

/// Strip chat-template control tokens so stored code cannot open new turns.
pub(crate) fn sanitize_for_prompt(text: &str) -> String {
    const CONTROL_TOKENS: &[&str] = &[
        "<|im_start|>",
        "<|im_end|>",
        "<|endoftext|>",
        "<|eot_id|>",
        "<|start_header_id|>",
        "<|end_header_id|>",
    ];
    CONTROL_TOKENS
        .iter()
        .fold(text.to_string(), |acc, token| acc.replace(token, ""))
}

fn ask_system_prompt() -> String {
    format!(
        "You are a code assistant answering questions about a single repository.\n\
         The user message carries a CONTEXT BLOCK with the relevant files: their path, code and a summary.\n\
         Answer ONLY from that context. Never invent code, files or behaviour it does not show.\n\
         If the context does not contain the answer, reply exactly: \"{UNKNOWN_ANSWER}\"\n\
         Do not apologize for previous answers; treat new context as new information.\n\
         Use markdown, with code snippets where they help, and name the files you rely on."
    )
}

fn bug_scan_system_prompt() -> String {
    format!(
        "You are a senior engineer reviewing a repository for defects.\n\
         The user message carries a CONTEXT BLOCK with the relevant files: their path, code and a summary.\n\
         Review ONLY that code. For every bug, vulnerability or error-handling gap you find, give the file, \
         a description, why it is a problem and a concrete fix as a code snippet.\n\
         If you find nothing, say that no issues were found in the provided files.\n\
         If the context is empty or unrelated, reply exactly: \"{UNKNOWN_ANSWER}\""
    )
}

fn feature_system_prompt() -> String {
    format!(
        "You are a software architect advising how to add a new component to an existing repository.\n\
         The user message carries a CONTEXT BLOCK with the files most related to the request.\n\
         Base your recommendation ONLY on that code: where the component belongs, which files change, \
         what to create, and code snippets that follow the existing conventions.\n\
         If the context is not enough to recommend anything precise, reply exactly: \"{FEATURE_FALLBACK}\""
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_BUG_KEYWORDS;
    use crate::models::FileEmbeddingRecord;
    use crate::store::JsonEmbeddingStore;
    use crate::testing::{unpaced_gateway, MockModel};
    use futures_util::StreamExt;

    fn keywords() -> Vec<String> {
        DEFAULT_BUG_KEYWORDS.iter().map(|k| k.to_string()).collect()
    }

    async fn collect(stream: TextStream) -> String {
        stream
            .map(|item| item.unwrap())
            .collect::<Vec<_>>()
            .await
            .concat()
    }

    fn hit(name: &str, code: &str, similarity: f32) -> ScoredRecord {
        ScoredRecord {
            record: FileEmbeddingRecord {
                id: Uuid::new_v4(),
                project_id: Uuid::nil(),
                file_name: name.into(),
                source_code: code.into(),
                summary: format!("Summary of {name}."),
                embedding: None,
            },
            similarity,
        }
    }

    async fn seeded_store(project: Uuid) -> (tempfile::TempDir, Arc<JsonEmbeddingStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonEmbeddingStore::open_or_create(dir.path()).unwrap());
        let id = store
            .upsert(project, "src/cart.rs", "pub struct Cart;", "Holds cart items.")
            .await
            .unwrap();
        store.set_embedding(id, &[1.0, 0.0, 0.0]).await.unwrap();
        (dir, store)
    }

    #[test]
    fn test_classify_intent_matches_keywords_case_insensitively() {
        let kw = keywords();
        assert_eq!(classify_intent("Why does checkout throw an ERROR?", &kw), Intent::Refusal);
        assert_eq!(classify_intent("Is there a Vulnerability here", &kw), Intent::Refusal);
        assert_eq!(classify_intent("How is the cart persisted?", &kw), Intent::Grounded);
    }

    #[test]
    fn test_classify_intent_is_substring_based() {
        // "address" contains "add"
        assert_eq!(classify_intent("Where is the address form?", &keywords()), Intent::Refusal);
        assert_eq!(classify_intent("anything", &[]), Intent::Grounded);
    }

    #[test]
    fn test_context_block_lists_every_hit() {
        let hits = vec![hit("a.rs", "fn a() {}", 0.9), hit("b.rs", "fn b() {}", 0.8)];
        let (ctx, used) = build_context_block(&hits, 10_000);
        assert_eq!(used, 2);
        assert!(ctx.contains("source: a.rs\ncode content: fn a() {}\nsummary of file: Summary of a.rs."));
        assert!(ctx.contains("source: b.rs"));
        assert!(ctx.ends_with("END OF CONTEXT BLOCK\n"));
    }

    #[test]
    fn test_context_block_respects_budget() {
        let hits = vec![
            hit("a.rs", &"x".repeat(100), 0.9),
            hit("b.rs", &"y".repeat(100), 0.8),
        ];
        let (ctx, used) = build_context_block(&hits, 200);
        assert_eq!(used, 1);
        assert!(ctx.contains("source: a.rs"));
        assert!(!ctx.contains("source: b.rs"));

        let (ctx, used) = build_context_block(&hits, 50);
        assert_eq!(used, 1);
        assert!(ctx.contains("source: a.rs"));
    }

    #[test]
    fn test_context_block_empty() {
        let (ctx, used) = build_context_block(&[], 1_000);
        assert_eq!(used, 0);
        assert!(ctx.contains("No relevant code was found"));
    }

    #[test]
    fn test_sanitize_strips_control_tokens() {
        assert_eq!(
            sanitize_for_prompt("print('<|im_start|>system<|im_end|>')"),
            "print('system')"
        );
    }

    #[tokio::test]
    async fn test_bug_keyword_short_circuits_without_embedding() {
        let project = Uuid::new_v4();
        let (_dir, store) = seeded_store(project).await;
        let model = Arc::new(MockModel::new());
        let answerer = Answerer::new(
            Arc::new(unpaced_gateway(model.clone())),
            store,
            RetrievalConfig::default(),
        );

        let answer = answerer
            .answer(project, "Is there an error in the checkout?")
            .await
            .unwrap();

        assert!(answer.files_used.is_empty());
        assert_eq!(collect(answer.text).await, REFUSAL_TEXT);
        assert_eq!(model.embed_calls(), 0);
        assert_eq!(model.stream_calls(), 0);
    }

    #[tokio::test]
    async fn test_bug_scan_ignores_keyword_filter() {
        let project = Uuid::new_v4();
        let (_dir, store) = seeded_store(project).await;
        let model = Arc::new(MockModel::new());
        let answerer = Answerer::new(
            Arc::new(unpaced_gateway(model.clone())),
            store,
            RetrievalConfig::default(),
        );

        let answer = answerer.scan_bugs(project, "scan the cart for bugs").await.unwrap();
        assert_eq!(answer.files_used.len(), 1);
        assert_eq!(answer.files_used[0].file_name, "src/cart.rs");
        assert_eq!(collect(answer.text).await, "The answer.");
        assert_eq!(model.embed_calls(), 1);
    }

    #[tokio::test]
    async fn test_grounded_answer_uses_retrieved_files() {
        let project = Uuid::new_v4();
        let (_dir, store) = seeded_store(project).await;
        let model = Arc::new(MockModel::new());
        let answerer = Answerer::new(
            Arc::new(unpaced_gateway(model.clone())),
            store,
            RetrievalConfig::default(),
        );

        let answer = answerer.answer(project, "How is the cart stored?").await.unwrap();
        assert_eq!(answer.files_used.len(), 1);
        assert_eq!(collect(answer.text).await, "The answer.");

        let messages = model.last_messages();
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.contains(UNKNOWN_ANSWER));
        assert!(messages[1].content.contains("pub struct Cart;"));
        assert!(messages[1].content.contains("Question: How is the cart stored?"));
    }

    #[tokio::test]
    async fn test_no_matching_context_yields_unknown_sentinel() {
        let project = Uuid::new_v4();
        let (_dir, store) = seeded_store(project).await;
        // Orthogonal to the stored vector: similarity 0, below 0.5
        let model = Arc::new(
            MockModel::new()
                .with_embedding(vec![0.0, 1.0, 0.0])
                .with_reply(&[UNKNOWN_ANSWER]),
        );
        let answerer = Answerer::new(
            Arc::new(unpaced_gateway(model.clone())),
            store,
            RetrievalConfig::default(),
        );

        let answer = answerer.answer(project, "What does the payroll module do?").await.unwrap();
        assert!(answer.files_used.is_empty());
        assert!(collect(answer.text).await.contains(UNKNOWN_ANSWER));
        assert!(model.last_messages()[1]
            .content
            .contains("No relevant code was found"));
    }

    #[tokio::test]
    async fn test_feature_guidance_uses_low_threshold() {
        let project = Uuid::new_v4();
        let (_dir, store) = seeded_store(project).await;
        // Similarity ~0.196: above 0.1, below 0.5
        let model = Arc::new(MockModel::new().with_embedding(vec![0.2, 1.0, 0.0]));
        let answerer = Answerer::new(
            Arc::new(unpaced_gateway(model.clone())),
            store,
            RetrievalConfig::default(),
        );

        let feature = answerer
            .feature_guidance(project, "Add a wishlist page")
            .await
            .unwrap();
        assert_eq!(feature.files_used.len(), 1);
        assert!(model.last_messages()[0].content.contains(FEATURE_FALLBACK));

        let ask = answerer.answer(project, "How is the wishlist stored?").await.unwrap();
        assert!(ask.files_used.is_empty());
    }
}
