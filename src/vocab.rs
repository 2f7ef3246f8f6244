//! Versioned controlled vocabulary.
//!
//! Canonical tag forms live in immutable version snapshots
//! (`<archive_root>/vocabulary/v1.json`, `v2.json`, …) with an `active`
//! pointer file naming the version ingestion normalizes against. A version is
//! written once and never mutated; evolution happens only through
//! [`VocabStore::consolidate`], which applies reviewed merge/rename/addition
//! proposals and produces the next version.
//!
//! Ingestion is read-only here, with one exception: canonical forms invented
//! by Phase-2 normalization are appended to a tentative log, where they wait
//! for the next consolidation run to promote or discard them.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::archive::{Archive, ArchiveFilter};
use crate::models::StructuredMetadata;

/// One canonical form with its bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocabEntry {
    pub canonical: String,
    #[serde(default)]
    pub description: String,
    /// How many corpus items carried this tag when last counted.
    #[serde(default)]
    pub frequency: u64,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Version in which this canonical form first appeared.
    pub first_seen: String,
}

/// An immutable vocabulary snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocabulary {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<VocabEntry>,
}

impl Vocabulary {
    /// Case-insensitive lookup across canonical forms and aliases.
    pub fn canonical_of(&self, raw: &str) -> Option<&str> {
        let needle = raw.trim().to_lowercase();
        for entry in &self.entries {
            if entry.canonical.to_lowercase() == needle {
                return Some(&entry.canonical);
            }
            if entry.aliases.iter().any(|a| a.to_lowercase() == needle) {
                return Some(&entry.canonical);
            }
        }
        None
    }

    pub fn contains(&self, canonical: &str) -> bool {
        self.canonical_of(canonical).is_some()
    }

    /// Most frequent canonical forms, ties broken alphabetically.
    pub fn top_canonicals(&self, n: usize) -> Vec<&str> {
        let mut sorted: Vec<&VocabEntry> = self.entries.iter().collect();
        sorted.sort_by(|a, b| {
            b.frequency
                .cmp(&a.frequency)
                .then_with(|| a.canonical.cmp(&b.canonical))
        });
        sorted.into_iter().take(n).map(|e| e.canonical.as_str()).collect()
    }

    /// Enforce uniqueness invariants: canonical forms are unique, and no
    /// alias collides with another entry's canonical form.
    pub fn validate(&self) -> Result<()> {
        let mut canonicals = BTreeMap::new();
        for entry in &self.entries {
            let key = entry.canonical.to_lowercase();
            if canonicals.insert(key.clone(), &entry.canonical).is_some() {
                bail!("duplicate canonical form: {}", entry.canonical);
            }
        }
        for entry in &self.entries {
            for alias in &entry.aliases {
                let key = alias.to_lowercase();
                if key != entry.canonical.to_lowercase() && canonicals.contains_key(&key) {
                    bail!(
                        "alias '{}' of '{}' collides with another canonical form",
                        alias,
                        entry.canonical
                    );
                }
            }
        }
        Ok(())
    }
}

/// Reviewed evolution proposals applied by [`VocabStore::consolidate`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Proposals {
    #[serde(default)]
    pub merges: Vec<MergeProposal>,
    #[serde(default)]
    pub renames: Vec<RenameProposal>,
    #[serde(default)]
    pub additions: Vec<AdditionProposal>,
}

/// Fold the `from` entries into `into`; their forms become aliases.
#[derive(Debug, Clone, Deserialize)]
pub struct MergeProposal {
    pub into: String,
    pub from: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenameProposal {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdditionProposal {
    pub canonical: String,
    #[serde(default)]
    pub description: String,
}

/// A Phase-2-invented canonical form awaiting consolidation review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TentativeTag {
    pub count: u64,
    pub first_seen_at: DateTime<Utc>,
}

/// `v1` → `v2`.
pub fn next_version(version: &str) -> Result<String> {
    let n: u64 = version
        .strip_prefix('v')
        .and_then(|s| s.parse().ok())
        .with_context(|| format!("unparseable vocabulary version: {}", version))?;
    Ok(format!("v{}", n + 1))
}

/// Filesystem-backed store of vocabulary versions.
#[derive(Debug, Clone)]
pub struct VocabStore {
    dir: PathBuf,
}

impl VocabStore {
    /// Vocabulary lives under the archive root, versioned beside the data
    /// it describes.
    pub fn new(archive_root: impl AsRef<Path>) -> Self {
        Self {
            dir: archive_root.as_ref().join("vocabulary"),
        }
    }

    pub fn active_version(&self) -> Result<Option<String>> {
        let path = self.dir.join("active");
        if !path.is_file() {
            return Ok(None);
        }
        let version = std::fs::read_to_string(path)?.trim().to_string();
        if version.is_empty() {
            return Ok(None);
        }
        Ok(Some(version))
    }

    pub fn set_active(&self, version: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let tmp = self.dir.join(format!("active.tmp-{}", std::process::id()));
        std::fs::write(&tmp, version)?;
        std::fs::rename(tmp, self.dir.join("active"))?;
        Ok(())
    }

    pub fn load(&self, version: &str) -> Result<Vocabulary> {
        let path = self.dir.join(format!("{}.json", version));
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("vocabulary version {} not found", version))?;
        let vocab: Vocabulary = serde_json::from_str(&content)?;
        Ok(vocab)
    }

    pub fn load_active(&self) -> Result<Option<Vocabulary>> {
        match self.active_version()? {
            Some(version) => Ok(Some(self.load(&version)?)),
            None => Ok(None),
        }
    }

    pub fn list_versions(&self) -> Result<Vec<String>> {
        let mut versions = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                if let Some(name) = entry.path().file_stem().and_then(|s| s.to_str()) {
                    if name.starts_with('v') && name[1..].parse::<u64>().is_ok() {
                        versions.push(name.to_string());
                    }
                }
            }
        }
        versions.sort_by_key(|v| v[1..].parse::<u64>().unwrap_or(0));
        Ok(versions)
    }

    /// Write a new version snapshot. Versions are immutable: writing an
    /// existing version is an error.
    pub fn save(&self, vocab: &Vocabulary) -> Result<()> {
        vocab.validate()?;
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}.json", vocab.version));
        if path.exists() {
            bail!("vocabulary version {} already exists", vocab.version);
        }
        let tmp = self.dir.join(format!(
            "{}.json.tmp-{}",
            vocab.version,
            std::process::id()
        ));
        std::fs::write(&tmp, serde_json::to_string_pretty(vocab)?)?;
        std::fs::rename(tmp, path)?;
        Ok(())
    }

    /// Seed `v1` by counting raw tags across archived Phase-1 outputs.
    ///
    /// The `top_k` most frequent raw tags (lowercased) become the initial
    /// canonical forms. Does not set the active pointer.
    pub fn seed_from_corpus(&self, archive: &Archive, top_k: usize) -> Result<Vocabulary> {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();

        for content_id in archive.iterate(ArchiveFilter::default()) {
            let value = match archive.read_latest(&content_id, "structured_metadata")? {
                Some(v) => v,
                None => continue,
            };
            let metadata: StructuredMetadata = match serde_json::from_value(value) {
                Ok(m) => m,
                Err(_) => continue,
            };
            for tag in metadata.vocabulary_tags() {
                let tag = tag.trim().to_lowercase();
                if !tag.is_empty() {
                    *counts.entry(tag).or_insert(0) += 1;
                }
            }
        }

        let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(top_k);

        let vocab = Vocabulary {
            version: "v1".to_string(),
            created_at: Utc::now(),
            entries: ranked
                .into_iter()
                .map(|(canonical, frequency)| VocabEntry {
                    canonical,
                    description: String::new(),
                    frequency,
                    aliases: Vec::new(),
                    first_seen: "v1".to_string(),
                })
                .collect(),
        };
        self.save(&vocab)?;
        Ok(vocab)
    }

    /// Apply reviewed proposals to the current version, producing the next.
    ///
    /// The old version is untouched; the new one is a strict
    /// superset-or-rename of it. Does not move the active pointer — callers
    /// decide when to cut over.
    pub fn consolidate(&self, current: &Vocabulary, proposals: &Proposals) -> Result<Vocabulary> {
        let version = next_version(&current.version)?;
        let mut entries = current.entries.clone();

        for rename in &proposals.renames {
            let entry = entries
                .iter_mut()
                .find(|e| e.canonical.eq_ignore_ascii_case(&rename.from))
                .with_context(|| format!("rename source not in vocabulary: {}", rename.from))?;
            let old = std::mem::replace(&mut entry.canonical, rename.to.clone());
            if !entry.aliases.iter().any(|a| a.eq_ignore_ascii_case(&old)) {
                entry.aliases.push(old);
            }
        }

        for merge in &proposals.merges {
            let mut absorbed: Vec<VocabEntry> = Vec::new();
            for from in &merge.from {
                let idx = entries
                    .iter()
                    .position(|e| e.canonical.eq_ignore_ascii_case(from))
                    .with_context(|| format!("merge source not in vocabulary: {}", from))?;
                absorbed.push(entries.remove(idx));
            }
            let target = entries
                .iter_mut()
                .find(|e| e.canonical.eq_ignore_ascii_case(&merge.into))
                .with_context(|| format!("merge target not in vocabulary: {}", merge.into))?;
            for entry in absorbed {
                target.frequency += entry.frequency;
                target.aliases.push(entry.canonical);
                target.aliases.extend(entry.aliases);
            }
        }

        for addition in &proposals.additions {
            if entries
                .iter()
                .any(|e| e.canonical.eq_ignore_ascii_case(&addition.canonical))
            {
                continue;
            }
            entries.push(VocabEntry {
                canonical: addition.canonical.clone(),
                description: addition.description.clone(),
                frequency: 0,
                aliases: Vec::new(),
                first_seen: version.clone(),
            });
        }

        let vocab = Vocabulary {
            version,
            created_at: Utc::now(),
            entries,
        };
        self.save(&vocab)?;
        Ok(vocab)
    }

    /// Record Phase-2-invented canonical forms for the next consolidation.
    pub fn record_tentative(&self, tags: &[String]) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let mut tentative = self.load_tentative()?;
        let now = Utc::now();
        for tag in tags {
            let tag = tag.trim().to_lowercase();
            if tag.is_empty() {
                continue;
            }
            tentative
                .entry(tag)
                .and_modify(|t| t.count += 1)
                .or_insert(TentativeTag {
                    count: 1,
                    first_seen_at: now,
                });
        }
        std::fs::create_dir_all(&self.dir)?;
        let tmp = self
            .dir
            .join(format!("tentative.json.tmp-{}", std::process::id()));
        std::fs::write(&tmp, serde_json::to_string_pretty(&tentative)?)?;
        std::fs::rename(tmp, self.dir.join("tentative.json"))?;
        Ok(())
    }

    pub fn load_tentative(&self) -> Result<BTreeMap<String, TentativeTag>> {
        let path = self.dir.join("tentative.json");
        if !path.is_file() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content).unwrap_or_default())
    }
}
