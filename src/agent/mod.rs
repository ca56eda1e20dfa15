//! Agentic answering for "add a feature" requests.
//!
//! The model plans, picks tools, reads their results and loops, at most
//! `max_steps` tool-executing steps. After that it is asked once more with no
//! tools on offer, and that answer is streamed as it is generated. The run
//! produces two streams: the text (step commentary, then the answer), and a
//! growing list of the files the agent has read or found.

pub mod tools;
pub mod web_search;

use std::pin::Pin;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::gateway::ModelGateway;
use crate::llm::tools::{AgentMessage, ToolCallingModel};
use crate::llm::TextStream;
use crate::models::FileReference;
use crate::store::EmbeddingStore;

use self::tools::{is_skipped, tool_specs, Toolbox};
use self::web_search::WebSearch;

/// Emitted when the model still has nothing to say after the last step.
pub const STEP_LIMIT_NOTICE: &str = "I reached the maximum number of research steps before finishing. \
     Try a more specific request, or ask again to continue from what was gathered.";

const FILE_TREE_PROMPT_CHARS: usize = 2000;
const CHANNEL_CAPACITY: usize = 16;

/// Snapshots of the reference list, each a superset of the previous one.
pub type ReferenceStream = Pin<Box<dyn Stream<Item = Result<Vec<FileReference>>> + Send>>;

pub struct AgentRun {
    pub text: TextStream,
    pub references: ReferenceStream,
}

#[derive(Clone)]
pub struct Agent {
    model: Arc<dyn ToolCallingModel>,
    gateway: Arc<ModelGateway>,
    store: Arc<dyn EmbeddingStore>,
    web: Arc<dyn WebSearch>,
    max_steps: usize,
    search_threshold: f32,
}

impl Agent {
    pub fn new(
        model: Arc<dyn ToolCallingModel>,
        gateway: Arc<ModelGateway>,
        store: Arc<dyn EmbeddingStore>,
        web: Arc<dyn WebSearch>,
        max_steps: usize,
        search_threshold: f32,
    ) -> Self {
        Self {
            model,
            gateway,
            store,
            web,
            max_steps,
            search_threshold,
        }
    }

    /// Start a run in the background and hand back its two streams.
    ///
    /// Dropping the text stream stops the run before its next model call.
    pub fn run(&self, project_id: Uuid, request: String) -> AgentRun {
        let (text_tx, text_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (refs_tx, refs_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let agent = self.clone();

        tokio::spawn(async move {
            if let Err(e) = agent.drive(project_id, &request, &text_tx, &refs_tx).await {
                tracing::error!(%project_id, "Agent run failed: {e}");
                let _ = refs_tx.send(Err(Error::Stream(e.to_string()))).await;
                let _ = text_tx.send(Err(e)).await;
            }
        });

        AgentRun {
            text: Box::pin(ReceiverStream::new(text_rx)),
            references: Box::pin(ReceiverStream::new(refs_rx)),
        }
    }

    async fn drive(
        &self,
        project_id: Uuid,
        request: &str,
        text_tx: &mpsc::Sender<Result<String>>,
        refs_tx: &mpsc::Sender<Result<Vec<FileReference>>>,
    ) -> Result<()> {
        let tree = self.file_tree_outline(project_id).await?;
        let mut messages = vec![
            AgentMessage::System(system_prompt(&tree)),
            AgentMessage::User(request.to_string()),
        ];
        let specs = tool_specs();
        let mut toolbox = Toolbox::new(
            project_id,
            self.gateway.clone(),
            self.store.clone(),
            self.web.clone(),
            self.search_threshold,
        );

        let mut steps = 0;
        while steps < self.max_steps {
            if text_tx.is_closed() {
                tracing::info!(%project_id, "Agent output dropped, stopping");
                return Ok(());
            }

            let turn = self.model.complete(&messages, &specs).await?;
            let content = turn.content.filter(|t| !t.trim().is_empty());

            if turn.tool_calls.is_empty() {
                match content {
                    Some(text) => {
                        self.finish(project_id, steps, &toolbox);
                        let _ = text_tx.send(Ok(text)).await;
                        return Ok(());
                    }
                    None => break,
                }
            }

            steps += 1;
            let names: Vec<&str> = turn.tool_calls.iter().map(|c| c.name.as_str()).collect();
            tracing::info!(%project_id, step = steps, tools = ?names, "Agent step");

            if let Some(text) = &content {
                if text_tx.send(Ok(text.clone())).await.is_err() {
                    return Ok(());
                }
            }
            messages.push(AgentMessage::Assistant {
                content,
                tool_calls: turn.tool_calls.clone(),
            });
            for call in &turn.tool_calls {
                let outcome = toolbox.execute(call).await;
                messages.push(AgentMessage::Tool {
                    call_id: call.id.clone(),
                    content: outcome.content.to_string(),
                });
                if outcome.publish_references {
                    let _ = refs_tx.send(Ok(toolbox.references().to_vec())).await;
                }
            }
        }

        if text_tx.is_closed() {
            return Ok(());
        }
        // Out of steps, or the model went quiet with tools on offer: one last
        // tool-less turn, forwarded fragment by fragment.
        let mut answer = self.model.stream_text(&messages).await?;
        let mut answered = false;
        while let Some(fragment) = answer.next().await {
            let fragment = fragment?;
            if fragment.is_empty() {
                continue;
            }
            answered |= !fragment.trim().is_empty();
            if text_tx.send(Ok(fragment)).await.is_err() {
                return Ok(());
            }
        }
        if !answered {
            let _ = text_tx.send(Ok(STEP_LIMIT_NOTICE.to_string())).await;
        }
        self.finish(project_id, steps, &toolbox);
        Ok(())
    }

    fn finish(&self, project_id: Uuid, steps: usize, toolbox: &Toolbox) {
        tracing::info!(
            %project_id,
            steps,
            references = toolbox.references().len(),
            "Agent finished"
        );
    }

    /// Newline-separated file names for the system prompt, skip list applied.
    async fn file_tree_outline(&self, project_id: Uuid) -> Result<String> {
        let names = self.store.list_file_names(project_id, None).await?;
        let tree = names
            .into_iter()
            .filter(|n| !is_skipped(n))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(crate::ingest::truncate_chars(&tree, FILE_TREE_PROMPT_CHARS).0.to_string())
    }
}

fn system_prompt(file_tree: &str) -> String {
    format!(
        "You are a Senior Software Architect helping a developer add a feature to their repository.\n\
         \n\
         Repository files:\n{file_tree}\n\
         \n\
         MANDATORY STEPS before answering:\n\
         1. Use search_codebase to find code related to the request.\n\
         2. Use read_file on the most relevant files to see their actual code.\n\
         3. Use get_file_tree when you need to know where new files belong.\n\
         4. Use web_search only for library documentation or best practices not visible in the code.\n\
         If a tool fails, try another name or query, or continue without it.\n\
         \n\
         Then answer in markdown with exactly these sections:\n\
         1. Overview: what the feature needs and how it fits the existing architecture.\n\
         2. Files to modify: each path, what changes and why.\n\
         3. New files: each path and its purpose.\n\
         4. Implementation: code that follows the conventions you observed.\n\
         5. Dependencies: packages to add, if any.\n\
         6. Integration: how the new code is wired into the existing code.\n\
         7. Testing: how to verify the feature.\n\
         Ground every recommendation in files you actually read."
    )
}
