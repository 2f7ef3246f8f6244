//! Typed failure taxonomy for the ingestion pipeline.
//!
//! The queue controller routes work items on failure classification: terminal
//! failures complete the item with an error status, retryable failures send
//! it back to pending with an incremented attempt counter. Every error here
//! answers [`Disposition`] so the controller never has to guess.

use thiserror::Error;

/// How the controller should route a failed work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Record the failure and complete the item; retrying cannot help.
    Terminal,
    /// Requeue the item after a delay, up to the attempt budget.
    Retryable,
}

/// Failures raised by the transcript and web fetchers.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The uploader disabled captions; nothing to ingest.
    #[error("transcript unavailable for {0}")]
    TranscriptUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// The provider throttled us; the controller pauses the source.
    #[error("rate limited by source")]
    RateLimited,

    #[error("network error: {0}")]
    Network(String),

    /// The response came back but could not be interpreted.
    #[error("unexpected response shape: {0}")]
    Malformed(String),
}

impl FetchError {
    pub fn disposition(&self) -> Disposition {
        match self {
            FetchError::RateLimited | FetchError::Network(_) => Disposition::Retryable,
            FetchError::TranscriptUnavailable(_)
            | FetchError::NotFound(_)
            | FetchError::Forbidden(_)
            | FetchError::Unavailable(_)
            | FetchError::Malformed(_) => Disposition::Terminal,
        }
    }
}

/// Failures raised by the append-only archive store.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The `(content_id, source)` pair already exists and overwrite was not
    /// requested.
    #[error("source record already written for {content_id}")]
    AlreadyWritten { content_id: String },

    #[error("archive record not found: {0}")]
    NotFound(String),

    #[error("archive record corrupt, discarding: {0}")]
    Corrupt(String),

    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures raised by the chat-completion client.
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("missing API key: set {0}")]
    MissingApiKey(&'static str),

    /// Non-retryable provider rejection (4xx other than 429).
    #[error("LLM provider error {status}: {body}")]
    Provider { status: u16, body: String },

    /// Retries exhausted on 429/5xx/connection errors.
    #[error("transient LLM provider error: {0}")]
    Transient(String),

    #[error("malformed LLM response: {0}")]
    Malformed(String),
}

impl LlmError {
    pub fn disposition(&self) -> Disposition {
        match self {
            LlmError::Transient(_) => Disposition::Retryable,
            LlmError::MissingApiKey(_) | LlmError::Provider { .. } | LlmError::Malformed(_) => {
                Disposition::Terminal
            }
        }
    }
}

/// Failures raised by the two-phase tag normalizer.
#[derive(Error, Debug)]
pub enum NormalizeError {
    /// The model kept emitting unparseable JSON past the attempt budget.
    #[error("malformed LLM output after {attempts} attempts: {detail}")]
    Malformed { attempts: u32, detail: String },

    /// No active vocabulary exists; Phase 2 cannot run.
    #[error("no active vocabulary version; run `curator vocab seed` first")]
    VocabularyMissing,

    #[error(transparent)]
    Llm(#[from] LlmError),
}

impl NormalizeError {
    pub fn disposition(&self) -> Disposition {
        match self {
            NormalizeError::Llm(e) => e.disposition(),
            NormalizeError::Malformed { .. } | NormalizeError::VocabularyMissing => {
                Disposition::Terminal
            }
        }
    }
}

/// Classify an orchestration-level error for queue routing.
///
/// Downcasts through the typed taxonomy; anything unrecognized (I/O, SQLite,
/// embedding transport) is treated as retryable — the attempt budget bounds
/// the damage, and the archive makes retries cheap.
pub fn classify(err: &anyhow::Error) -> Disposition {
    if let Some(e) = err.downcast_ref::<FetchError>() {
        return e.disposition();
    }
    if let Some(e) = err.downcast_ref::<NormalizeError>() {
        return e.disposition();
    }
    if let Some(e) = err.downcast_ref::<LlmError>() {
        return e.disposition();
    }
    if let Some(e) = err.downcast_ref::<ArchiveError>() {
        return match e {
            ArchiveError::AlreadyWritten { .. } | ArchiveError::NotFound(_) => {
                Disposition::Terminal
            }
            _ => Disposition::Retryable,
        };
    }
    Disposition::Retryable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_dispositions() {
        assert_eq!(
            FetchError::TranscriptUnavailable("x".into()).disposition(),
            Disposition::Terminal
        );
        assert_eq!(FetchError::RateLimited.disposition(), Disposition::Retryable);
        assert_eq!(
            FetchError::Network("reset".into()).disposition(),
            Disposition::Retryable
        );
        assert_eq!(
            FetchError::Forbidden("x".into()).disposition(),
            Disposition::Terminal
        );
    }

    #[test]
    fn test_classify_downcasts() {
        let err = anyhow::Error::new(FetchError::RateLimited);
        assert_eq!(classify(&err), Disposition::Retryable);

        let err = anyhow::Error::new(NormalizeError::VocabularyMissing);
        assert_eq!(classify(&err), Disposition::Terminal);

        let err = anyhow::anyhow!("something unrecognized");
        assert_eq!(classify(&err), Disposition::Retryable);
    }
}
