//! Persona vectors.
//!
//! A persona is a named 1024-dim vector in the same space as content global
//! embeddings, built as the rating-weighted mean of the items assigned to it.
//! Updates are incremental (online weighted mean), so adding one labeled item
//! never requires recomputing the whole persona.
//!
//! Cold start is an offline bootstrap: k-means over the existing global
//! embeddings with k chosen by silhouette score (accept at ≥ 0.3), clusters
//! presented for human labeling. It reuses the same embedding space, so
//! materialized clusters are ordinary personas.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, vec_to_blob};

/// Minimum silhouette score at which a bootstrap clustering is acceptable.
pub const SILHOUETTE_ACCEPT: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct Persona {
    pub label: String,
    pub description: String,
    pub vector: Vec<f32>,
    /// Total assignment weight folded into the mean so far.
    pub weight_sum: f64,
}

// ============ Vector math ============

/// Weighted mean of embedding vectors. Returns empty for no input or zero
/// total weight.
pub fn weighted_mean(items: &[(&[f32], f64)]) -> Vec<f32> {
    let total: f64 = items.iter().map(|(_, w)| w).sum();
    if items.is_empty() || total <= 0.0 {
        return Vec::new();
    }
    let dim = items[0].0.len();
    let mut out = vec![0.0f64; dim];
    for (vector, weight) in items {
        for (o, x) in out.iter_mut().zip(vector.iter()) {
            *o += *x as f64 * weight;
        }
    }
    out.into_iter().map(|x| (x / total) as f32).collect()
}

/// Fold one new weighted observation into a running weighted mean.
pub fn online_update(mean: &mut Vec<f32>, weight_sum: &mut f64, x: &[f32], weight: f64) {
    if weight <= 0.0 {
        return;
    }
    if mean.is_empty() || *weight_sum <= 0.0 {
        *mean = x.to_vec();
        *weight_sum = weight;
        return;
    }
    let new_sum = *weight_sum + weight;
    let factor = (weight / new_sum) as f32;
    for (m, xi) in mean.iter_mut().zip(x.iter()) {
        *m += factor * (xi - *m);
    }
    *weight_sum = new_sum;
}

// ============ Storage ============

pub async fn upsert_persona(pool: &SqlitePool, persona: &Persona) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO personas (label, description, vector, dim, weight_sum, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(label) DO UPDATE SET
            description = excluded.description,
            vector = excluded.vector,
            dim = excluded.dim,
            weight_sum = excluded.weight_sum,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&persona.label)
    .bind(&persona.description)
    .bind(vec_to_blob(&persona.vector))
    .bind(persona.vector.len() as i64)
    .bind(persona.weight_sum)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn load_personas(pool: &SqlitePool) -> Result<Vec<Persona>> {
    let rows = sqlx::query("SELECT label, description, vector, weight_sum FROM personas ORDER BY label")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("vector");
            Persona {
                label: row.get("label"),
                description: row.get("description"),
                vector: blob_to_vec(&blob),
                weight_sum: row.get("weight_sum"),
            }
        })
        .collect())
}

pub async fn load_persona(pool: &SqlitePool, label: &str) -> Result<Option<Persona>> {
    Ok(load_personas(pool)
        .await?
        .into_iter()
        .find(|p| p.label == label))
}

/// Softly assign a content item to a persona.
///
/// Weights per content item must sum to ≤ 1 across personas.
pub async fn assign(
    pool: &SqlitePool,
    content_id: &str,
    label: &str,
    weight: f64,
) -> Result<()> {
    if !(0.0..=1.0).contains(&weight) {
        bail!("assignment weight must be in [0, 1], got {}", weight);
    }
    let existing: f64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(weight), 0.0) FROM persona_assignments WHERE content_id = ? AND label != ?",
    )
    .bind(content_id)
    .bind(label)
    .fetch_one(pool)
    .await?;
    if existing + weight > 1.0 + 1e-9 {
        bail!(
            "assignment weights for {} would exceed 1 (existing {}, adding {})",
            content_id,
            existing,
            weight
        );
    }

    sqlx::query(
        r#"
        INSERT INTO persona_assignments (content_id, label, weight)
        VALUES (?, ?, ?)
        ON CONFLICT(content_id, label) DO UPDATE SET weight = excluded.weight
        "#,
    )
    .bind(content_id)
    .bind(label)
    .bind(weight)
    .execute(pool)
    .await?;
    Ok(())
}

/// `(content_id, weight)` pairs assigned to a persona.
pub async fn assignments_for(pool: &SqlitePool, label: &str) -> Result<Vec<(String, f64)>> {
    let rows = sqlx::query(
        "SELECT content_id, weight FROM persona_assignments WHERE label = ? ORDER BY content_id",
    )
    .bind(label)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get("content_id"), row.get("weight")))
        .collect())
}

/// Rebuild a persona from its assignments and the content embeddings.
///
/// Each member contributes `assignment_weight × rating/5` (rating defaults
/// to full weight when absent).
pub async fn build_persona(
    pool: &SqlitePool,
    index: &dyn crate::vector_store::VectorIndex,
    label: &str,
    description: &str,
) -> Result<Persona> {
    let members = assignments_for(pool, label).await?;
    if members.is_empty() {
        bail!("persona '{}' has no assigned content", label);
    }

    let ids: Vec<String> = members.iter().map(|(id, _)| id.clone()).collect();
    let records = index.fetch_content(&ids).await?;

    let mut weighted: Vec<(&[f32], f64)> = Vec::new();
    let mut weight_sum = 0.0;
    for record in &records {
        let assignment = members
            .iter()
            .find(|(id, _)| id == &record.id)
            .map(|(_, w)| *w)
            .unwrap_or(0.0);
        let rating_factor = record.rating.map(|r| (r / 5.0).clamp(0.0, 1.0)).unwrap_or(1.0);
        let weight = assignment * rating_factor;
        if weight > 0.0 {
            weighted.push((&record.embedding, weight));
            weight_sum += weight;
        }
    }
    if weighted.is_empty() {
        bail!("persona '{}' members have no usable embeddings", label);
    }

    let persona = Persona {
        label: label.to_string(),
        description: description.to_string(),
        vector: weighted_mean(&weighted),
        weight_sum,
    };
    upsert_persona(pool, &persona).await?;
    Ok(persona)
}

/// Fold one newly labeled item into a stored persona without a rebuild.
pub async fn update_persona(
    pool: &SqlitePool,
    label: &str,
    embedding: &[f32],
    weight: f64,
) -> Result<Persona> {
    let mut persona = load_persona(pool, label)
        .await?
        .unwrap_or_else(|| Persona {
            label: label.to_string(),
            description: String::new(),
            vector: Vec::new(),
            weight_sum: 0.0,
        });
    online_update(&mut persona.vector, &mut persona.weight_sum, embedding, weight);
    upsert_persona(pool, &persona).await?;
    Ok(persona)
}

// ============ Bootstrap clustering ============

fn euclidean(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = (*x - *y) as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// Deterministic k-means: farthest-point initialization, fixed iteration
/// budget. Returns the cluster assignment per input vector.
pub fn kmeans(vectors: &[Vec<f32>], k: usize, max_iters: usize) -> Vec<usize> {
    if vectors.is_empty() || k == 0 {
        return Vec::new();
    }
    let k = k.min(vectors.len());

    // Farthest-point init: start at 0, then repeatedly take the point
    // farthest from its nearest chosen centroid.
    let mut centroids: Vec<Vec<f32>> = vec![vectors[0].clone()];
    while centroids.len() < k {
        let (farthest, _) = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let nearest = centroids
                    .iter()
                    .map(|c| euclidean(v, c))
                    .fold(f64::INFINITY, f64::min);
                (i, nearest)
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .unwrap_or((0, 0.0));
        centroids.push(vectors[farthest].clone());
    }

    let mut assignment = vec![0usize; vectors.len()];
    for _ in 0..max_iters {
        let mut changed = false;
        for (i, v) in vectors.iter().enumerate() {
            let best = centroids
                .iter()
                .enumerate()
                .min_by(|a, b| {
                    euclidean(v, a.1)
                        .partial_cmp(&euclidean(v, b.1))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(c, _)| c)
                .unwrap_or(0);
            if assignment[i] != best {
                assignment[i] = best;
                changed = true;
            }
        }

        for (c, centroid) in centroids.iter_mut().enumerate() {
            let members: Vec<(&[f32], f64)> = vectors
                .iter()
                .enumerate()
                .filter(|(i, _)| assignment[*i] == c)
                .map(|(_, v)| (v.as_slice(), 1.0))
                .collect();
            if !members.is_empty() {
                *centroid = weighted_mean(&members);
            }
        }

        if !changed {
            break;
        }
    }

    assignment
}

/// Mean silhouette coefficient of a clustering, in `[-1, 1]`.
pub fn silhouette_score(vectors: &[Vec<f32>], assignment: &[usize], k: usize) -> f64 {
    if vectors.len() < 2 || k < 2 {
        return 0.0;
    }

    let mut total = 0.0;
    for (i, v) in vectors.iter().enumerate() {
        let own = assignment[i];
        let mut dist_sums = vec![0.0f64; k];
        let mut counts = vec![0usize; k];
        for (j, u) in vectors.iter().enumerate() {
            if i == j {
                continue;
            }
            dist_sums[assignment[j]] += euclidean(v, u);
            counts[assignment[j]] += 1;
        }

        if counts[own] == 0 {
            continue;
        }
        let a = dist_sums[own] / counts[own] as f64;
        let b = (0..k)
            .filter(|&c| c != own && counts[c] > 0)
            .map(|c| dist_sums[c] / counts[c] as f64)
            .fold(f64::INFINITY, f64::min);
        if !b.is_finite() {
            continue;
        }
        total += (b - a) / a.max(b);
    }

    total / vectors.len() as f64
}

/// Try each k in the range, return `(k, silhouette, assignment)` of the best.
pub fn choose_k(
    vectors: &[Vec<f32>],
    k_min: usize,
    k_max: usize,
) -> Option<(usize, f64, Vec<usize>)> {
    let k_max = k_max.min(vectors.len());
    let mut best: Option<(usize, f64, Vec<usize>)> = None;
    for k in k_min.max(2)..=k_max {
        let assignment = kmeans(vectors, k, 50);
        let score = silhouette_score(vectors, &assignment, k);
        if best.as_ref().map(|(_, s, _)| score > *s).unwrap_or(true) {
            best = Some((k, score, assignment));
        }
    }
    best
}

/// Offline cold-start bootstrap: cluster the corpus's global embeddings,
/// print the clusters for review, and materialize the ones the operator
/// labeled as personas.
///
/// `labels` maps cluster index → persona label. With no labels this is a
/// dry run that only reports the clustering.
pub async fn run_bootstrap(
    pool: &SqlitePool,
    index: &dyn crate::vector_store::VectorIndex,
    k_min: usize,
    k_max: usize,
    labels: &std::collections::HashMap<usize, String>,
) -> Result<()> {
    let content = index.list_content().await?;
    if content.len() < 4 {
        bail!(
            "bootstrap needs at least 4 indexed items, found {}",
            content.len()
        );
    }

    let vectors: Vec<Vec<f32>> = content.iter().map(|c| c.embedding.clone()).collect();
    let Some((k, score, assignment)) = choose_k(&vectors, k_min, k_max) else {
        bail!("clustering produced no result");
    };

    println!("bootstrap clustering");
    println!("  items: {}", content.len());
    println!("  chosen k: {}", k);
    println!(
        "  silhouette: {:.3} ({})",
        score,
        if score >= SILHOUETTE_ACCEPT {
            "acceptable"
        } else {
            "below acceptance threshold"
        }
    );

    for cluster in 0..k {
        let members: Vec<&crate::models::ContentRecord> = content
            .iter()
            .zip(assignment.iter())
            .filter(|(_, a)| **a == cluster)
            .map(|(c, _)| c)
            .collect();
        println!("  cluster {}: {} items", cluster, members.len());
        for member in members.iter().take(3) {
            println!("    - {}", member.title);
        }
    }

    for (cluster, label) in labels {
        let members: Vec<(&crate::models::ContentRecord, f64)> = content
            .iter()
            .zip(assignment.iter())
            .filter(|(_, a)| *a == cluster)
            .map(|(c, _)| {
                let weight = c.rating.map(|r| (r / 5.0).clamp(0.0, 1.0)).unwrap_or(1.0);
                (c, weight)
            })
            .collect();
        if members.is_empty() {
            println!("  cluster {} is empty, not materializing '{}'", cluster, label);
            continue;
        }

        let weighted: Vec<(&[f32], f64)> = members
            .iter()
            .map(|(c, w)| (c.embedding.as_slice(), *w))
            .collect();
        let persona = Persona {
            label: label.clone(),
            description: format!("bootstrapped from cluster {}", cluster),
            vector: weighted_mean(&weighted),
            weight_sum: members.iter().map(|(_, w)| w).sum(),
        };
        upsert_persona(pool, &persona).await?;
        for (record, weight) in &members {
            assign(pool, &record.id, label, (*weight).min(1.0)).await?;
        }
        println!(
            "  materialized persona '{}' from cluster {} ({} items)",
            label,
            cluster,
            members.len()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_mean() {
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        let mean = weighted_mean(&[(&a, 3.0), (&b, 1.0)]);
        assert!((mean[0] - 0.75).abs() < 1e-6);
        assert!((mean[1] - 0.25).abs() < 1e-6);
        assert!(weighted_mean(&[]).is_empty());
    }

    #[test]
    fn test_online_update_matches_batch_mean() {
        let observations: Vec<(Vec<f32>, f64)> = vec![
            (vec![1.0, 0.0], 2.0),
            (vec![0.0, 1.0], 1.0),
            (vec![1.0, 1.0], 3.0),
        ];

        let batch_inputs: Vec<(&[f32], f64)> = observations
            .iter()
            .map(|(v, w)| (v.as_slice(), *w))
            .collect();
        let batch = weighted_mean(&batch_inputs);

        let mut mean = Vec::new();
        let mut weight_sum = 0.0;
        for (v, w) in &observations {
            online_update(&mut mean, &mut weight_sum, v, *w);
        }

        for (a, b) in batch.iter().zip(mean.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
        assert!((weight_sum - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_kmeans_separates_two_blobs() {
        let mut vectors = Vec::new();
        for i in 0..5 {
            vectors.push(vec![10.0 + i as f32 * 0.1, 10.0]);
        }
        for i in 0..5 {
            vectors.push(vec![-10.0 - i as f32 * 0.1, -10.0]);
        }

        let assignment = kmeans(&vectors, 2, 50);
        let first = assignment[0];
        assert!(assignment[..5].iter().all(|&c| c == first));
        assert!(assignment[5..].iter().all(|&c| c != first));

        let score = silhouette_score(&vectors, &assignment, 2);
        assert!(score > 0.8, "expected clean separation, got {}", score);
    }

    #[test]
    fn test_choose_k_prefers_true_cluster_count() {
        let mut vectors = Vec::new();
        for center in [[0.0f32, 0.0], [20.0, 0.0], [0.0, 20.0]] {
            for i in 0..4 {
                vectors.push(vec![center[0] + i as f32 * 0.2, center[1] + i as f32 * 0.1]);
            }
        }
        let (k, score, _) = choose_k(&vectors, 2, 5).unwrap();
        assert_eq!(k, 3);
        assert!(score >= SILHOUETTE_ACCEPT);
    }

    async fn pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_persona_storage_roundtrip() {
        let pool = pool().await;
        let persona = Persona {
            label: "woodworking".into(),
            description: "Hand tools and joinery".into(),
            vector: vec![0.5, -0.25, 0.125],
            weight_sum: 4.0,
        };
        upsert_persona(&pool, &persona).await.unwrap();

        let loaded = load_persona(&pool, "woodworking").await.unwrap().unwrap();
        assert_eq!(loaded.vector, persona.vector);
        assert_eq!(loaded.weight_sum, 4.0);
    }

    #[tokio::test]
    async fn test_assignment_weights_capped() {
        let pool = pool().await;
        assign(&pool, "youtube:A", "alpha", 0.7).await.unwrap();
        assign(&pool, "youtube:A", "beta", 0.3).await.unwrap();
        // A third assignment would push the sum over 1.
        assert!(assign(&pool, "youtube:A", "gamma", 0.2).await.is_err());
        // Updating an existing assignment is fine.
        assign(&pool, "youtube:A", "beta", 0.2).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_persona_online() {
        let pool = pool().await;
        update_persona(&pool, "ai-infra", &[1.0, 0.0], 1.0)
            .await
            .unwrap();
        let updated = update_persona(&pool, "ai-infra", &[0.0, 1.0], 1.0)
            .await
            .unwrap();
        assert!((updated.vector[0] - 0.5).abs() < 1e-6);
        assert!((updated.vector[1] - 0.5).abs() < 1e-6);
        assert!((updated.weight_sum - 2.0).abs() < 1e-9);
    }
}
