//! Session / Intake Classifier (spec §4.12): routes a free-form `/chat`
//! message to one of five intents before the rest of the orchestrator gets
//! involved. Fast path is a keyword/regex matcher; anything it can't place
//! confidently falls back to an `LlmClient` in structured-output mode.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::clients::{ClientError, LlmClient, LlmCompletionRequest};
use crate::webhook::{extract_request_id, WebhookDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    TaskSubmission,
    StatusQuery,
    ApprovalDecision,
    Clarification,
    GeneralQuery,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedMessage {
    pub intent: Intent,
    /// Populated for `StatusQuery` / `ApprovalDecision` when the message
    /// names a task or request id directly.
    pub referenced_id: Option<Uuid>,
    pub decision: Option<WebhookDecisionLabel>,
    /// `true` when the fast path placed this confidently; `false` means the
    /// LLM fallback was used (or attempted).
    pub fast_path: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookDecisionLabel {
    Approve,
    Reject,
}

impl From<WebhookDecision> for WebhookDecisionLabel {
    fn from(d: WebhookDecision) -> Self {
        match d {
            WebhookDecision::Approve => Self::Approve,
            WebhookDecision::Reject => Self::Reject,
        }
    }
}

/// Turn history for one `session_id`, capped so a long-running chat doesn't
/// grow the prompt budget unbounded.
#[derive(Debug, Clone, Default)]
struct SessionState {
    turns: Vec<(String, Intent)>,
}

const MAX_TURNS_KEPT: usize = 20;
const FALLBACK_PROMPT_BUDGET_TOKENS: u32 = 256;

fn uuid_pattern() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
            .expect("valid regex")
    })
}

fn status_keywords() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(status|progress|how'?s|where is)\b").expect("valid regex"))
}

fn approval_keywords() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(approve|reject|decline|sign off|greenlight)\b").expect("valid regex"))
}

fn task_submission_keywords() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(please|can you|build|implement|fix|add|create|deploy|refactor)\b").expect("valid regex")
    })
}

fn clarification_keywords() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(what do you mean|clarify|i meant|actually|correction)\b").expect("valid regex"))
}

/// Keyword fast path. Returns `None` when no pattern matches confidently
/// enough to skip the LLM fallback.
fn classify_fast(message: &str) -> Option<ClassifiedMessage> {
    if approval_keywords().is_match(message) || extract_request_id(message).is_some() {
        let decision = if message.to_lowercase().contains("reject")
            || message.to_lowercase().contains("decline")
        {
            Some(WebhookDecisionLabel::Reject)
        } else if approval_keywords().is_match(message) {
            Some(WebhookDecisionLabel::Approve)
        } else {
            None
        };
        return Some(ClassifiedMessage {
            intent: Intent::ApprovalDecision,
            referenced_id: extract_request_id(message),
            decision,
            fast_path: true,
        });
    }

    if status_keywords().is_match(message) {
        return Some(ClassifiedMessage {
            intent: Intent::StatusQuery,
            referenced_id: uuid_pattern().find(message).and_then(|m| Uuid::parse_str(m.as_str()).ok()),
            decision: None,
            fast_path: true,
        });
    }

    if clarification_keywords().is_match(message) {
        return Some(ClassifiedMessage {
            intent: Intent::Clarification,
            referenced_id: None,
            decision: None,
            fast_path: true,
        });
    }

    if task_submission_keywords().is_match(message) {
        return Some(ClassifiedMessage {
            intent: Intent::TaskSubmission,
            referenced_id: None,
            decision: None,
            fast_path: true,
        });
    }

    None
}

fn intent_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "intent": {
                "type": "string",
                "enum": ["task_submission", "status_query", "approval_decision", "clarification", "general_query"]
            }
        },
        "required": ["intent"]
    })
}

fn parse_intent_label(label: &str) -> Intent {
    match label {
        "task_submission" => Intent::TaskSubmission,
        "status_query" => Intent::StatusQuery,
        "approval_decision" => Intent::ApprovalDecision,
        "clarification" => Intent::Clarification,
        _ => Intent::GeneralQuery,
    }
}

pub struct IntakeClassifier {
    llm: Arc<dyn LlmClient>,
    sessions: RwLock<HashMap<String, SessionState>>,
}

impl IntakeClassifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Classifies one chat turn, recording it against `session_id`'s
    /// history. Falls back to the LLM only when the keyword pass is
    /// inconclusive; a fallback failure degrades to `GeneralQuery` rather
    /// than erroring the whole request.
    pub async fn classify(&self, session_id: &str, message: &str) -> ClassifiedMessage {
        let classified = match classify_fast(message) {
            Some(c) => c,
            None => self.classify_with_llm(message).await,
        };

        let mut sessions = self.sessions.write().await;
        let entry = sessions.entry(session_id.to_string()).or_default();
        entry.turns.push((message.to_string(), classified.intent));
        if entry.turns.len() > MAX_TURNS_KEPT {
            entry.turns.remove(0);
        }

        classified
    }

    async fn classify_with_llm(&self, message: &str) -> ClassifiedMessage {
        let request = LlmCompletionRequest {
            prompt: format!(
                "Classify the intent of this message into exactly one of: \
                 task_submission, status_query, approval_decision, clarification, general_query.\n\nMessage: {message}"
            ),
            max_tokens: FALLBACK_PROMPT_BUDGET_TOKENS,
            structured_output_schema: Some(intent_schema()),
        };

        let result: Result<Intent, ClientError> = self.llm.complete(request).await.map(|r| {
            r.structured
                .as_ref()
                .and_then(|s| s.get("intent"))
                .and_then(Value::as_str)
                .map(parse_intent_label)
                .unwrap_or(Intent::GeneralQuery)
        });

        ClassifiedMessage {
            intent: result.unwrap_or(Intent::GeneralQuery),
            referenced_id: extract_request_id(message)
                .or_else(|| uuid_pattern().find(message).and_then(|m| Uuid::parse_str(m.as_str()).ok())),
            decision: None,
            fast_path: false,
        }
    }
}
