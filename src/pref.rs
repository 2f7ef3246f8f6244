//! Preference score over stored user feedback.
//!
//! `pref_score` turns an item's user context into a value in `[0, 1]`:
//!
//! ```text
//! pref = 0.5·rating + 0.3·recency + 0.2·applied
//! ```
//!
//! - **rating** — the 0–5 user rating scaled to `[0, 1]`; unrated items
//!   score a neutral 0.5.
//! - **recency** — exponential decay of ingestion age with a 180-day
//!   half-life.
//! - **applied** — 1 when the item has been pulled into at least one
//!   project, 0 otherwise.
//!
//! The ranker treats this as a pluggable function: swap it out and the
//! mode weights keep working unchanged.

use chrono::{DateTime, Utc};

/// Age in days at which the recency term halves.
const RECENCY_HALF_LIFE_DAYS: f64 = 180.0;

pub fn pref_score(
    rating: Option<f64>,
    created_at_epoch: i64,
    projects: &[String],
    now: DateTime<Utc>,
) -> f64 {
    let rating_part = rating.map(|r| (r / 5.0).clamp(0.0, 1.0)).unwrap_or(0.5);

    let age_days = ((now.timestamp() - created_at_epoch).max(0) as f64) / 86_400.0;
    let recency_part = 0.5f64.powf(age_days / RECENCY_HALF_LIFE_DAYS);

    let applied_part = if projects.is_empty() { 0.0 } else { 1.0 };

    0.5 * rating_part + 0.3 * recency_part + 0.2 * applied_part
}
