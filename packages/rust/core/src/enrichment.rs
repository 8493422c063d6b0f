//! Title enrichment with per-model retries and ordered model fallback.
//!
//! [`Enricher::enrich`] never fails: a record either comes back with a title
//! and status `success`, or with status `failed` and no title.
//! [`Enricher::try_enrich`] is the same walk, except that a fatal failure (a
//! rejected API key) is returned instead of being folded into the record,
//! so the run can stop. The retry and
//! fallback walk is an explicit [`FallbackState`] machine advanced by a
//! bounded loop, and the wait between attempts comes from [`RetryPolicy`].

use std::sync::Arc;
use std::time::Duration;

use tgkb_openrouter::{CompletionClient, EnrichmentFailure};
use tgkb_shared::{EnrichmentSettings, PostRecord};
use tracing::{debug, error, info, instrument, warn};

use crate::cancel::CancellationToken;

/// Longest title kept from a completion, in chars.
pub const MAX_TITLE_CHARS: usize = 120;

/// Characters stripped from both ends of a returned title.
const QUOTE_CHARS: &[char] = &['"', '\'', '«', '»', '“', '”', '`'];

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Per-attempt timeout and backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts_per_model: u32,
    pub attempt_timeout: Duration,
    pub backoff_base: Duration,
    pub rate_limit_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&EnrichmentSettings> for RetryPolicy {
    fn from(settings: &EnrichmentSettings) -> Self {
        Self {
            attempts_per_model: settings.attempts_per_model.max(1),
            attempt_timeout: settings.attempt_timeout(),
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
            rate_limit_backoff: Duration::from_millis(settings.rate_limit_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Wait before the attempt that follows `failure`.
    ///
    /// `attempt` is the 1-based number of the failed attempt on its model.
    /// Rate limits wait at least `rate_limit_backoff` (or the server's
    /// `Retry-After`, if longer); other failures back off exponentially.
    /// Every delay is capped at `max_backoff`.
    pub fn delay_after(&self, failure: &EnrichmentFailure, attempt: u32) -> Duration {
        let delay = if failure.is_rate_limited() {
            failure
                .retry_after()
                .unwrap_or_default()
                .max(self.rate_limit_backoff)
        } else {
            let factor = 1u32
                .checked_shl(attempt.saturating_sub(1))
                .unwrap_or(u32::MAX);
            self.backoff_base.saturating_mul(factor)
        };
        delay.min(self.max_backoff)
    }
}

// ---------------------------------------------------------------------------
// Fallback state machine
// ---------------------------------------------------------------------------

/// Position in the model fallback walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackState {
    /// `model` indexes the candidate list; `attempt` is 1-based per model.
    Trying { model: usize, attempt: u32 },
    Exhausted,
}

impl FallbackState {
    pub fn start(models: usize) -> Self {
        if models == 0 {
            Self::Exhausted
        } else {
            Self::Trying {
                model: 0,
                attempt: 1,
            }
        }
    }

    /// State after a failed attempt.
    pub fn advance(self, models: usize, attempts_per_model: u32) -> Self {
        match self {
            Self::Trying { model, attempt } if attempt < attempts_per_model => Self::Trying {
                model,
                attempt: attempt + 1,
            },
            Self::Trying { model, .. } if model + 1 < models => Self::Trying {
                model: model + 1,
                attempt: 1,
            },
            _ => Self::Exhausted,
        }
    }
}

// ---------------------------------------------------------------------------
// Enricher
// ---------------------------------------------------------------------------

/// Titles records through a [`CompletionClient`] with retry and fallback.
#[derive(Clone)]
pub struct Enricher {
    client: Arc<dyn CompletionClient>,
    models: Vec<String>,
    policy: RetryPolicy,
    min_text_chars: usize,
    max_prompt_chars: usize,
}

impl std::fmt::Debug for Enricher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enricher")
            .field("models", &self.models)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Enricher {
    /// `models` is the candidate list in fallback order (primary first).
    pub fn new(
        client: Arc<dyn CompletionClient>,
        models: Vec<String>,
        settings: &EnrichmentSettings,
    ) -> Self {
        let models = models
            .into_iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        Self {
            client,
            models,
            policy: RetryPolicy::from(settings),
            min_text_chars: settings.min_text_chars,
            max_prompt_chars: settings.max_prompt_chars,
        }
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    /// Title one record. Always returns the record in a terminal status.
    pub async fn enrich(&self, record: PostRecord) -> PostRecord {
        let fallback = record.clone();
        match self.try_enrich(record).await {
            Ok(enriched) => enriched,
            Err(_) => fallback.into_failed(),
        }
    }

    /// Title one record, returning `Err` only for a fatal failure.
    /// Record-local failures come back as a `failed` record.
    #[instrument(skip_all, fields(source = %record.source, row = record.row))]
    pub async fn try_enrich(&self, record: PostRecord) -> Result<PostRecord, EnrichmentFailure> {
        let text = record.text.trim();

        if text.is_empty() {
            debug!("blank text, nothing to title");
            return Ok(record.into_failed());
        }
        if text.chars().count() < self.min_text_chars {
            let title = text.to_string();
            debug!("short text used as its own title");
            return Ok(record.with_title(title));
        }

        match self.generate_title(text).await {
            Ok(title) => Ok(record.with_title(title)),
            Err(failure) if failure.is_fatal() => {
                error!(kind = failure.kind(), error = %failure, "enrichment aborted");
                Err(failure)
            }
            Err(failure) => {
                warn!(kind = failure.kind(), error = %failure, "enrichment failed");
                Ok(record.into_failed())
            }
        }
    }

    /// Like [`Enricher::try_enrich`], but gives up as soon as `token` fires.
    /// Returns `Ok(None)` when cancelled; the caller keeps the original record.
    pub async fn enrich_cancellable(
        &self,
        record: &PostRecord,
        token: &CancellationToken,
    ) -> Result<Option<PostRecord>, EnrichmentFailure> {
        if token.is_cancelled() {
            return Ok(None);
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => Ok(None),
            enriched = self.try_enrich(record.clone()) => enriched.map(Some),
        }
    }

    /// Walk the candidate models until one returns a usable title.
    /// A fatal failure ends the walk at once, with no retry or fallback.
    pub async fn generate_title(&self, text: &str) -> Result<String, EnrichmentFailure> {
        let prompt = build_prompt(text, self.max_prompt_chars);
        let model_count = self.models.len();
        let mut state = FallbackState::start(model_count);
        let mut attempts = 0u32;
        let mut last: Option<EnrichmentFailure> = None;

        while let FallbackState::Trying { model, attempt } = state {
            let name = &self.models[model];
            attempts += 1;

            let outcome = match tokio::time::timeout(
                self.policy.attempt_timeout,
                self.client.complete(name, &prompt),
            )
            .await
            {
                Ok(response) => response.and_then(|raw| clean_title(&raw)),
                Err(_) => Err(EnrichmentFailure::Timeout(self.policy.attempt_timeout)),
            };

            let failure = match outcome {
                Ok(title) => {
                    debug!(model = %name, attempt, "title generated");
                    return Ok(title);
                }
                Err(failure) => failure,
            };

            if failure.is_fatal() {
                return Err(failure);
            }

            warn!(
                model = %name,
                attempt,
                kind = failure.kind(),
                error = %failure,
                "title attempt failed"
            );

            let next = state.advance(model_count, self.policy.attempts_per_model);
            if let FallbackState::Trying { model: next_model, .. } = next {
                if next_model != model {
                    info!(from = %name, to = %self.models[next_model], "falling back to next model");
                }
                let delay = self.policy.delay_after(&failure, attempt);
                if !delay.is_zero() {
                    debug!(delay_ms = delay.as_millis() as u64, "backing off");
                    tokio::time::sleep(delay).await;
                }
            }

            last = Some(failure);
            state = next;
        }

        Err(EnrichmentFailure::AllModelsExhausted {
            models: model_count,
            attempts,
            last: Box::new(
                last.unwrap_or_else(|| EnrichmentFailure::Transport("no models configured".into())),
            ),
        })
    }
}

// ---------------------------------------------------------------------------
// Prompt and response handling
// ---------------------------------------------------------------------------

/// Title prompt for a post, with the text cut to `max_chars` characters.
pub fn build_prompt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    let body = match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    };

    format!(
        "Write a short, informative title for this Telegram channel post. \
         Use the language of the post, capture its essence, and keep it under 60 characters. \
         Reply with the title only.\n\nPost:\n{body}\n\nTitle:"
    )
}

/// Reduce a raw completion to a single clean title line.
pub fn clean_title(raw: &str) -> Result<String, EnrichmentFailure> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let line = line.strip_prefix("Title:").unwrap_or(line);
    let title = line.trim().trim_matches(QUOTE_CHARS).trim();

    if title.is_empty() {
        return Err(EnrichmentFailure::MalformedResponse(
            "completion contained no title".into(),
        ));
    }

    Ok(match title.char_indices().nth(MAX_TITLE_CHARS) {
        Some((idx, _)) => title[..idx].trim_end().to_string(),
        None => title.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tgkb_shared::EnrichmentStatus;

    /// Behavior of one scripted model.
    #[derive(Clone)]
    enum Script {
        Reply(&'static str),
        Fail(EnrichmentFailure),
        Hang,
    }

    /// Mock client answering per model and counting calls.
    struct ScriptedClient {
        scripts: HashMap<&'static str, Script>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(scripts: impl IntoIterator<Item = (&'static str, Script)>) -> Arc<Self> {
            Arc::new(Self {
                scripts: scripts.into_iter().collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls_to(&self, model: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|m| *m == model).count()
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn complete(&self, model: &str, _prompt: &str) -> Result<String, EnrichmentFailure> {
            self.calls.lock().unwrap().push(model.to_string());
            match self.scripts.get(model).cloned() {
                Some(Script::Reply(text)) => Ok(text.to_string()),
                Some(Script::Fail(failure)) => Err(failure),
                Some(Script::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok("too late".into())
                }
                None => Err(EnrichmentFailure::Http {
                    status: 404,
                    body: "unknown model".into(),
                }),
            }
        }
    }

    fn settings() -> EnrichmentSettings {
        EnrichmentSettings {
            attempts_per_model: 3,
            attempt_timeout_secs: 30,
            backoff_base_ms: 1_000,
            rate_limit_backoff_ms: 10_000,
            max_backoff_ms: 60_000,
            ..EnrichmentSettings::default()
        }
    }

    fn enricher(client: Arc<ScriptedClient>, models: &[&str]) -> Enricher {
        Enricher::new(
            client,
            models.iter().map(|m| m.to_string()).collect(),
            &settings(),
        )
    }

    fn record(text: &str) -> PostRecord {
        PostRecord::new("chan", 1, "2024-01-01 10:00:00", text, None)
    }

    const LONG_TEXT: &str = "Rust 2024 edition stabilizes async closures and more.";

    #[tokio::test(start_paused = true)]
    async fn primary_times_out_then_fallback_succeeds() {
        let client = ScriptedClient::new([
            ("primary", Script::Hang),
            ("fallback", Script::Reply("Rust 2024 ships")),
        ]);
        let enricher = enricher(client.clone(), &["primary", "fallback"]);

        let out = enricher.enrich(record(LONG_TEXT)).await;

        assert_eq!(out.enrichment_status, EnrichmentStatus::Success);
        assert_eq!(out.title.as_deref(), Some("Rust 2024 ships"));
        assert_eq!(client.calls_to("primary"), 3);
        assert_eq!(client.calls_to("fallback"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn all_models_failing_marks_record_failed() {
        let client = ScriptedClient::new([
            ("a", Script::Fail(EnrichmentFailure::Transport("reset".into()))),
            ("b", Script::Fail(EnrichmentFailure::MalformedResponse("empty".into()))),
        ]);
        let enricher = enricher(client.clone(), &["a", "b"]);

        let out = enricher.enrich(record(LONG_TEXT)).await;

        assert_eq!(out.enrichment_status, EnrichmentStatus::Failed);
        assert!(out.title.is_none());
        assert_eq!(client.calls_to("a"), 3);
        assert_eq!(client.calls_to("b"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempt_count_and_last_failure() {
        let client = ScriptedClient::new([("a", Script::Fail(EnrichmentFailure::Transport("x".into())))]);
        let enricher = enricher(client, &["a"]);

        let err = enricher.generate_title(LONG_TEXT).await.unwrap_err();
        match err {
            EnrichmentFailure::AllModelsExhausted {
                models,
                attempts,
                last,
            } => {
                assert_eq!(models, 1);
                assert_eq!(attempts, 3);
                assert_eq!(*last, EnrichmentFailure::Transport("x".into()));
            }
            other => panic!("unexpected failure: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits_longer_without_switching_model() {
        let client = ScriptedClient::new([(
            "a",
            Script::Fail(EnrichmentFailure::RateLimited {
                retry_after: Some(Duration::from_secs(20)),
            }),
        )]);
        let enricher = enricher(client.clone(), &["a"]);

        let started = tokio::time::Instant::now();
        let _ = enricher.generate_title(LONG_TEXT).await;

        assert_eq!(client.calls_to("a"), 3);
        // Two waits of max(20s, 10s); none after the final attempt.
        assert_eq!(started.elapsed(), Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_key_stops_without_retry_or_fallback() {
        let rejected = EnrichmentFailure::Unauthorized {
            status: 401,
            body: "invalid key".into(),
        };
        let client = ScriptedClient::new([
            ("a", Script::Fail(rejected.clone())),
            ("b", Script::Reply("never reached")),
        ]);
        let enricher = enricher(client.clone(), &["a", "b"]);

        let err = enricher.try_enrich(record(LONG_TEXT)).await.unwrap_err();
        assert_eq!(err, rejected);
        assert_eq!(client.calls_to("a"), 1);
        assert_eq!(client.calls_to("b"), 0);

        // The infallible entry point still folds it into the record.
        let out = enricher.enrich(record(LONG_TEXT)).await;
        assert_eq!(out.enrichment_status, EnrichmentStatus::Failed);
    }

    #[tokio::test]
    async fn short_and_blank_text_skip_the_network() {
        let client = ScriptedClient::new([("a", Script::Reply("unused"))]);
        let enricher = enricher(client.clone(), &["a"]);

        let short = enricher.enrich(record("  Hi all ")).await;
        assert_eq!(short.enrichment_status, EnrichmentStatus::Success);
        assert_eq!(short.title.as_deref(), Some("Hi all"));

        let blank = enricher.enrich(record("   ")).await;
        assert_eq!(blank.enrichment_status, EnrichmentStatus::Failed);

        assert_eq!(client.calls_to("a"), 0);
    }

    #[tokio::test]
    async fn cancelled_token_returns_none() {
        let client = ScriptedClient::new([("a", Script::Reply("Title"))]);
        let enricher = enricher(client.clone(), &["a"]);
        let token = CancellationToken::new();
        token.cancel();

        let out = enricher.enrich_cancellable(&record(LONG_TEXT), &token).await;
        assert_eq!(out, Ok(None));
        assert_eq!(client.calls_to("a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_abandons_in_flight_attempt() {
        let client = ScriptedClient::new([("a", Script::Hang)]);
        let enricher = enricher(client, &["a"]);
        let token = CancellationToken::new();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                token.cancel();
            })
        };

        let out = enricher.enrich_cancellable(&record(LONG_TEXT), &token).await;
        assert_eq!(out, Ok(None));
        canceller.await.unwrap();
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::from(&settings());
        let transport = EnrichmentFailure::Transport("x".into());
        assert_eq!(policy.delay_after(&transport, 1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(&transport, 2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(&transport, 3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(&transport, 40), Duration::from_secs(60));
    }

    #[test]
    fn rate_limit_backoff_uses_floor_and_retry_after() {
        let policy = RetryPolicy::from(&settings());
        let no_hint = EnrichmentFailure::RateLimited { retry_after: None };
        assert_eq!(policy.delay_after(&no_hint, 1), Duration::from_secs(10));

        let short_hint = EnrichmentFailure::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(policy.delay_after(&short_hint, 1), Duration::from_secs(10));

        let huge_hint = EnrichmentFailure::RateLimited {
            retry_after: Some(Duration::from_secs(600)),
        };
        assert_eq!(policy.delay_after(&huge_hint, 1), Duration::from_secs(60));
    }

    #[test]
    fn fallback_state_walks_models_in_order() {
        let mut state = FallbackState::start(2);
        let mut seen = Vec::new();
        while let FallbackState::Trying { model, attempt } = state {
            seen.push((model, attempt));
            state = state.advance(2, 2);
        }
        assert_eq!(seen, vec![(0, 1), (0, 2), (1, 1), (1, 2)]);
        assert_eq!(FallbackState::start(0), FallbackState::Exhausted);
    }

    #[test]
    fn clean_title_strips_quotes_and_extra_lines() {
        assert_eq!(clean_title("\n  \"Rust 2024 ships\"\nextra").unwrap(), "Rust 2024 ships");
        assert_eq!(clean_title("«Новый релиз»").unwrap(), "Новый релиз");
        assert_eq!(clean_title("Title: Hello").unwrap(), "Hello");
        assert!(clean_title("  \"\"  ").is_err());

        let long = "x".repeat(500);
        assert_eq!(clean_title(&long).unwrap().chars().count(), MAX_TITLE_CHARS);
    }

    #[test]
    fn prompt_truncates_on_char_boundary() {
        let text = "й".repeat(50);
        let prompt = build_prompt(&text, 10);
        assert!(prompt.contains(&format!("{}...", "й".repeat(10))));
        assert!(!prompt.contains(&"й".repeat(11)));
    }
}
