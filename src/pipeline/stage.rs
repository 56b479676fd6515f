use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::GenerationFlowConfig;
use crate::error::EngineError;
use crate::generation::{GenerationClient, GenerationRequest, GenerationUsage};
use crate::models::{ArticleContent, DraftContent, FormatRules, GameRecord};
use crate::pipeline::retry::{AttemptError, RetryFailure, RetryPolicy};

/// The three pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum StageKind {
    FormatAnalysis,
    ContentGeneration,
    FormatValidation,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl StageKind {
    pub fn all() -> [StageKind; 3] {
        [
            StageKind::FormatAnalysis,
            StageKind::ContentGeneration,
            StageKind::FormatValidation,
        ]
    }

    pub fn first() -> StageKind {
        StageKind::FormatAnalysis
    }

    pub fn next(self) -> Option<StageKind> {
        match self {
            StageKind::FormatAnalysis => Some(StageKind::ContentGeneration),
            StageKind::ContentGeneration => Some(StageKind::FormatValidation),
            StageKind::FormatValidation => None,
        }
    }

    /// 0-based index used for progress bookkeeping.
    pub fn index(self) -> usize {
        match self {
            StageKind::FormatAnalysis => 0,
            StageKind::ContentGeneration => 1,
            StageKind::FormatValidation => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::FormatAnalysis => "formatAnalysis",
            StageKind::ContentGeneration => "contentGeneration",
            StageKind::FormatValidation => "formatValidation",
        }
    }
}

/// Accumulated outputs of completed stages, feeding later stages.
#[derive(Debug, Clone, Default)]
pub struct StagePartials {
    pub format_rules: Option<FormatRules>,
    pub draft: Option<DraftContent>,
}

/// Stage-specific payload produced by one successful stage execution.
#[derive(Debug, Clone)]
pub enum StageOutput {
    Rules(FormatRules),
    Draft(DraftContent),
    Article(ArticleContent),
}

/// Output of one `StageExecutor::execute` invocation.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub output: StageOutput,
    pub usage: GenerationUsage,
}

/// Runs one pipeline stage for one item: builds the stage request from
/// prior outputs, invokes the generation API exactly once, validates the
/// response shape and classifies failures. Retries belong to the caller.
pub struct StageExecutor {
    client: Arc<dyn GenerationClient>,
}

impl StageExecutor {
    pub fn new(client: Arc<dyn GenerationClient>) -> Self {
        Self { client }
    }

    /// Execute one stage attempt. `shape_mismatch_seen` spans the attempts
    /// of one stage run: the first malformed response is retryable, a
    /// recurrence is fatal so systemic prompt bugs are not masked.
    pub async fn execute(
        &self,
        stage: StageKind,
        record: &GameRecord,
        partials: &StagePartials,
        config: &GenerationFlowConfig,
        shape_mismatch_seen: &AtomicBool,
    ) -> Result<StageResult, AttemptError> {
        let request = build_stage_request(stage, record, partials, config)?;
        debug!("Executing stage {} for item {}", stage, record.id);

        let response = self.client.invoke(request).await.map_err(|err| {
            let message = err.to_string();
            if err.is_retryable() {
                AttemptError::Retryable(EngineError::RetryableStage(message))
            } else {
                AttemptError::Fatal(EngineError::FatalStage(message))
            }
        })?;

        match validate_stage_response(stage, &response.content) {
            Ok(output) => Ok(StageResult {
                output,
                usage: response.usage,
            }),
            Err(reason) => {
                let message = format!(
                    "Stage {} returned a malformed response for item {}: {}",
                    stage, record.id, reason
                );
                if shape_mismatch_seen.swap(true, Ordering::SeqCst) {
                    Err(AttemptError::Fatal(EngineError::FatalStage(message)))
                } else {
                    Err(AttemptError::Retryable(EngineError::RetryableStage(message)))
                }
            }
        }
    }
}

/// Combines the executor with the retry policy: one call drives a full
/// stage run for one item, backoff and timeouts included.
pub struct StageRunner {
    executor: StageExecutor,
    policy: RetryPolicy,
}

impl StageRunner {
    pub fn new(client: Arc<dyn GenerationClient>, policy: RetryPolicy) -> Self {
        Self {
            executor: StageExecutor::new(client),
            policy,
        }
    }

    pub async fn run_stage(
        &self,
        stage: StageKind,
        record: &GameRecord,
        partials: &StagePartials,
        config: &GenerationFlowConfig,
    ) -> Result<(StageResult, u32), RetryFailure> {
        let shape_mismatch_seen = AtomicBool::new(false);
        let label = format!("stage {} (item {})", stage, record.id);
        self.policy
            .run(&label, |_attempt| {
                self.executor
                    .execute(stage, record, partials, config, &shape_mismatch_seen)
            })
            .await
    }
}

fn build_stage_request(
    stage: StageKind,
    record: &GameRecord,
    partials: &StagePartials,
    config: &GenerationFlowConfig,
) -> Result<GenerationRequest, AttemptError> {
    let system_prompt = build_system_prompt(stage, config);
    let user_prompt = build_user_prompt(stage, record, partials, config)?;
    Ok(GenerationRequest {
        system_prompt,
        user_prompt,
        temperature: match stage {
            StageKind::FormatAnalysis | StageKind::FormatValidation => 0.2,
            StageKind::ContentGeneration => 0.7,
        },
        max_tokens: match stage {
            StageKind::FormatAnalysis => 1_024,
            StageKind::ContentGeneration | StageKind::FormatValidation => 4_096,
        },
        request_tag: format!("{}:{}", record.id, stage.as_str()),
    })
}

fn build_system_prompt(stage: StageKind, config: &GenerationFlowConfig) -> String {
    let base = match stage {
        StageKind::FormatAnalysis => {
            "You are an editorial analyst. Derive article format rules from the \
             supplied game record. Respond with a single JSON object: \
             { \"outline\": [string], \"headingStyle\": string, \
             \"requiredSections\": [string], \"notes\": string|null }."
        }
        StageKind::ContentGeneration => {
            "You are a sports journalist writing an SEO-optimized article. Follow \
             the supplied format rules exactly. Respond with a single JSON object: \
             { \"title\": string, \"body\": string, \"metaDescription\": string|null }."
        }
        StageKind::FormatValidation => {
            "You are an editor. Correct the supplied draft so it satisfies the \
             format rules, then score it. Respond with a single JSON object: \
             { \"title\": string, \"body\": string, \"metaDescription\": string|null, \
             \"quality\": { \"wordCount\": number, \"keywordCoverage\": number, \
             \"readabilityScore\": number } }."
        }
    };
    format!(
        "{}\nTone: {}. Target length: {} words.",
        base, config.content.tone, config.content.target_word_count
    )
}

fn build_user_prompt(
    stage: StageKind,
    record: &GameRecord,
    partials: &StagePartials,
    config: &GenerationFlowConfig,
) -> Result<String, AttemptError> {
    let mut sections: Vec<String> = Vec::new();
    sections.push(format!("Game: {}", record.title));
    sections.push(format!(
        "Game record:\n{}",
        serde_json::to_string_pretty(&record.payload)
            .map_err(|e| AttemptError::Fatal(EngineError::Serialization(e.to_string())))?
    ));

    if !config.content.seo_keywords.is_empty() {
        sections.push(format!(
            "Target keywords: {}",
            config.content.seo_keywords.join(", ")
        ));
    }
    if config.structured_data.emit_schema_org {
        let article_type = config
            .structured_data
            .article_type
            .as_deref()
            .unwrap_or("NewsArticle");
        sections.push(format!(
            "The article will be published with Schema.org markup of type {}; \
             keep the headline and description compatible.",
            article_type
        ));
    }

    match stage {
        StageKind::FormatAnalysis => {}
        StageKind::ContentGeneration => {
            let rules = partials.format_rules.as_ref().ok_or_else(|| {
                AttemptError::Fatal(EngineError::InternalScheduling(format!(
                    "Content generation dispatched without format rules for item {}",
                    record.id
                )))
            })?;
            sections.push(format!(
                "Format rules:\n{}",
                serde_json::to_string_pretty(rules)
                    .map_err(|e| AttemptError::Fatal(EngineError::Serialization(e.to_string())))?
            ));
        }
        StageKind::FormatValidation => {
            let draft = partials.draft.as_ref().ok_or_else(|| {
                AttemptError::Fatal(EngineError::InternalScheduling(format!(
                    "Format validation dispatched without draft content for item {}",
                    record.id
                )))
            })?;
            if let Some(rules) = partials.format_rules.as_ref() {
                sections.push(format!(
                    "Format rules:\n{}",
                    serde_json::to_string_pretty(rules).map_err(|e| {
                        AttemptError::Fatal(EngineError::Serialization(e.to_string()))
                    })?
                ));
            }
            sections.push(format!(
                "Draft:\n{}",
                serde_json::to_string_pretty(draft)
                    .map_err(|e| AttemptError::Fatal(EngineError::Serialization(e.to_string())))?
            ));
        }
    }

    Ok(sections.join("\n\n"))
}

/// Strip a Markdown code fence if the model wrapped its JSON in one.
fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

/// Validate a raw model response against the stage's expected shape.
fn validate_stage_response(stage: StageKind, content: &str) -> Result<StageOutput, String> {
    let body = strip_code_fences(content);
    if body.is_empty() {
        return Err("empty response".to_string());
    }

    match stage {
        StageKind::FormatAnalysis => {
            let rules: FormatRules =
                serde_json::from_str(body).map_err(|e| format!("expected format rules: {}", e))?;
            if rules.outline.is_empty() {
                return Err("format rules contained an empty outline".to_string());
            }
            Ok(StageOutput::Rules(rules))
        }
        StageKind::ContentGeneration => {
            let draft: DraftContent =
                serde_json::from_str(body).map_err(|e| format!("expected draft content: {}", e))?;
            if draft.title.trim().is_empty() || draft.body.trim().is_empty() {
                return Err("draft title and body must be non-empty".to_string());
            }
            Ok(StageOutput::Draft(draft))
        }
        StageKind::FormatValidation => {
            let article: ArticleContent =
                serde_json::from_str(body).map_err(|e| format!("expected final article: {}", e))?;
            if article.title.trim().is_empty() || article.body.trim().is_empty() {
                return Err("article title and body must be non-empty".to_string());
            }
            Ok(StageOutput::Article(article))
        }
    }
}
