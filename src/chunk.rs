//! Transcript and web-page chunkers.
//!
//! Two strategies, selected by content kind:
//!
//! - **Transcript (time + token hybrid)** — accumulate caption segments,
//!   flushing when the token budget reaches the target band, when adding a
//!   segment would cross the hard cap, or when the silence gap between
//!   segments exceeds the pause threshold. An optional tail of the previous
//!   chunk is repeated at the next head.
//! - **Web (structure-aware hybrid)** — respect heading and code-block
//!   boundaries, merge small adjacent blocks, split oversized blocks on
//!   paragraph/line boundaries.
//!
//! Every chunk records character offsets into the source text (the
//! space-joined transcript, or the linearized page); transcript chunks also
//! record start/end timestamps in seconds. Indices are dense from 0.

use crate::config::{TranscriptChunkerConfig, WebChunkerConfig};
use crate::embedding::approx_tokens;
use crate::models::{BlockKind, StructuredDocument, TranscriptSegment};

/// A chunk of source text with locators, before embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub index: i64,
    pub text: String,
    pub start_char: usize,
    pub end_char: usize,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
}

/// The canonical flat form of a transcript: segment texts joined by spaces.
pub fn join_transcript(segments: &[TranscriptSegment]) -> String {
    segments
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a transcript into time+token hybrid chunks.
pub fn chunk_transcript(
    segments: &[TranscriptSegment],
    cfg: &TranscriptChunkerConfig,
) -> Vec<TextChunk> {
    if segments.is_empty() {
        return Vec::new();
    }

    // Character span of each segment within the space-joined transcript.
    let mut offsets = Vec::with_capacity(segments.len());
    let mut pos = 0usize;
    for (i, seg) in segments.iter().enumerate() {
        if i > 0 {
            pos += 1;
        }
        let start = pos;
        pos += seg.text.len();
        offsets.push((start, pos));
    }

    let mut chunks: Vec<TextChunk> = Vec::new();
    let mut buf: Vec<usize> = Vec::new();
    let mut buf_tokens = 0usize;
    let mut overlap: Vec<usize> = Vec::new();

    let emit = |chunks: &mut Vec<TextChunk>, overlap: &[usize], buf: &[usize]| {
        let indices: Vec<usize> = overlap.iter().chain(buf.iter()).copied().collect();
        let first = indices[0];
        let last = indices[indices.len() - 1];
        let text = indices
            .iter()
            .map(|&i| segments[i].text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        chunks.push(TextChunk {
            index: chunks.len() as i64,
            text,
            start_char: offsets[first].0,
            end_char: offsets[last].1,
            start_time: Some(segments[first].start),
            end_time: Some(segments[last].end()),
        });
    };

    for (i, seg) in segments.iter().enumerate() {
        let seg_tokens = approx_tokens(&seg.text);

        if let Some(&last_idx) = buf.last() {
            let gap = seg.start - segments[last_idx].end();
            let over_target = buf_tokens >= cfg.target_tokens;
            let would_cross_cap = buf_tokens + seg_tokens > cfg.hard_cap_tokens;
            if over_target || would_cross_cap || gap > cfg.pause_seconds {
                emit(&mut chunks, &overlap, &buf);
                let keep = cfg.overlap_segments.min(buf.len());
                overlap = buf[buf.len() - keep..].to_vec();
                buf.clear();
                buf_tokens = 0;
            }
        }

        buf.push(i);
        buf_tokens += seg_tokens;
    }

    if !buf.is_empty() {
        emit(&mut chunks, &overlap, &buf);
    }

    chunks
}

/// Split a structure-parsed web page into chunks.
///
/// Offsets index into [`crate::fetch_web::linearize`]'s output for the same
/// document, and chunk text is sliced from it, so concatenating the chunks
/// reconstructs the linearized page exactly.
pub fn chunk_web(doc: &StructuredDocument, cfg: &WebChunkerConfig) -> Vec<TextChunk> {
    let linearized = crate::fetch_web::linearize(doc);

    // Units are blocks, except oversized blocks which are pre-split. Each
    // unit keeps its span within the linearized text; chunk text is sliced
    // from that text so offsets are exact by construction.
    struct Unit {
        text: String,
        start: usize,
        end: usize,
        is_heading: bool,
    }

    let max_chars = cfg.hard_cap_tokens * crate::embedding::CHARS_PER_TOKEN;
    let mut units: Vec<Unit> = Vec::new();
    let mut pos = 0usize;

    for (i, block) in doc.blocks.iter().enumerate() {
        if i > 0 {
            pos += 2;
        }
        let start = pos;
        pos += block.text.len();

        if block.text.len() > max_chars {
            // Oversized block: split along line then word boundaries.
            let mut offset = 0usize;
            let mut remaining = block.text.as_str();
            while !remaining.is_empty() {
                let split_at = if remaining.len() <= max_chars {
                    remaining.len()
                } else {
                    let cap = crate::embedding::floor_char_boundary(remaining, max_chars);
                    remaining[..cap]
                        .rfind('\n')
                        .or_else(|| remaining[..cap].rfind(' '))
                        .map(|p| p + 1)
                        .filter(|&p| p > 0)
                        .unwrap_or(cap)
                };
                units.push(Unit {
                    text: remaining[..split_at].to_string(),
                    start: start + offset,
                    end: start + offset + split_at,
                    is_heading: false,
                });
                offset += split_at;
                remaining = &remaining[split_at..];
            }
        } else {
            units.push(Unit {
                text: block.text.clone(),
                start,
                end: pos,
                is_heading: matches!(block.kind, BlockKind::Heading(_)),
            });
        }
    }

    let mut chunks: Vec<TextChunk> = Vec::new();
    let mut buf: Vec<usize> = Vec::new();
    let mut buf_tokens = 0usize;

    let emit = |chunks: &mut Vec<TextChunk>, buf: &[usize], units: &[Unit]| {
        let start = units[buf[0]].start;
        let end = units[buf[buf.len() - 1]].end;
        chunks.push(TextChunk {
            index: chunks.len() as i64,
            text: linearized[start..end].to_string(),
            start_char: start,
            end_char: end,
            start_time: None,
            end_time: None,
        });
    };

    for (i, unit) in units.iter().enumerate() {
        let unit_tokens = approx_tokens(&unit.text);

        if !buf.is_empty() {
            let over_target = buf_tokens + unit_tokens > cfg.target_tokens;
            // Headings prefer to open a chunk once the buffer has substance.
            let heading_break = unit.is_heading && buf_tokens >= cfg.target_tokens / 2;
            if over_target || heading_break {
                emit(&mut chunks, &buf, &units);
                buf.clear();
                buf_tokens = 0;
            }
        }

        buf.push(i);
        buf_tokens += unit_tokens;
    }

    if !buf.is_empty() {
        emit(&mut chunks, &buf, &units);
    }

    // Guarantee at least one chunk for a non-empty document.
    if chunks.is_empty() && !doc.blocks.is_empty() {
        let end = linearized.len();
        chunks.push(TextChunk {
            index: 0,
            text: linearized.clone(),
            start_char: 0,
            end_char: end,
            start_time: None,
            end_time: None,
        });
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocBlock;

    fn seg(start: f64, duration: f64, text: &str) -> TranscriptSegment {
        TranscriptSegment {
            start,
            duration,
            text: text.to_string(),
        }
    }

    fn transcript_cfg(target: usize, pause: f64, overlap: usize) -> TranscriptChunkerConfig {
        TranscriptChunkerConfig {
            target_tokens: target,
            hard_cap_tokens: target * 2,
            pause_seconds: pause,
            overlap_segments: overlap,
        }
    }

    #[test]
    fn test_short_transcript_single_chunk() {
        let segments = vec![seg(0.0, 2.0, "hello there"), seg(2.0, 2.0, "general kenobi")];
        let chunks = chunk_transcript(&segments, &transcript_cfg(2500, 9.0, 1));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "hello there general kenobi");
        assert_eq!(chunks[0].start_time, Some(0.0));
        assert_eq!(chunks[0].end_time, Some(4.0));
    }

    #[test]
    fn test_empty_transcript() {
        let chunks = chunk_transcript(&[], &transcript_cfg(2500, 9.0, 1));
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_pause_forces_boundary() {
        let segments = vec![
            seg(0.0, 2.0, "before the pause"),
            seg(2.0, 2.0, "still before"),
            // 20-second silence
            seg(24.0, 2.0, "after the pause"),
        ];
        let chunks = chunk_transcript(&segments, &transcript_cfg(2500, 9.0, 0));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "before the pause still before");
        assert_eq!(chunks[1].text, "after the pause");
        assert_eq!(chunks[1].start_time, Some(24.0));
    }

    #[test]
    fn test_token_budget_forces_boundary() {
        // 40 chars per segment ≈ 10 tokens; target of 20 flushes every 2–3.
        let segments: Vec<TranscriptSegment> = (0..6)
            .map(|i| seg(i as f64 * 2.0, 2.0, &"word ".repeat(8).trim().to_string()))
            .collect();
        let chunks = chunk_transcript(&segments, &transcript_cfg(20, 9.0, 0));
        assert!(chunks.len() >= 2);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i as i64);
        }
    }

    #[test]
    fn test_offsets_slice_joined_transcript() {
        let segments = vec![
            seg(0.0, 2.0, "alpha beta"),
            seg(2.0, 2.0, "gamma"),
            seg(30.0, 2.0, "delta epsilon"),
        ];
        let joined = join_transcript(&segments);
        let chunks = chunk_transcript(&segments, &transcript_cfg(2500, 9.0, 0));
        assert_eq!(chunks.len(), 2);
        for c in &chunks {
            assert_eq!(&joined[c.start_char..c.end_char], c.text);
        }
    }

    #[test]
    fn test_no_overlap_reconstructs_source() {
        let segments: Vec<TranscriptSegment> =
            (0..10).map(|i| seg(i as f64 * 20.0, 2.0, "some words here")).collect();
        let chunks = chunk_transcript(&segments, &transcript_cfg(5, 9.0, 0));
        let rebuilt = chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(rebuilt, join_transcript(&segments));
    }

    #[test]
    fn test_overlap_repeats_tail_segment() {
        let segments = vec![
            seg(0.0, 2.0, "one"),
            seg(2.0, 2.0, "two"),
            seg(30.0, 2.0, "three"),
        ];
        let chunks = chunk_transcript(&segments, &transcript_cfg(2500, 9.0, 1));
        assert_eq!(chunks.len(), 2);
        // Second chunk starts with the last segment of the first.
        assert_eq!(chunks[1].text, "two three");
        assert_eq!(chunks[1].start_time, Some(2.0));
    }

    #[test]
    fn test_indices_dense_from_zero() {
        let segments: Vec<TranscriptSegment> =
            (0..30).map(|i| seg(i as f64 * 20.0, 2.0, "words and words")).collect();
        let chunks = chunk_transcript(&segments, &transcript_cfg(4, 9.0, 1));
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i as i64);
        }
    }

    fn web_cfg(target: usize) -> WebChunkerConfig {
        WebChunkerConfig {
            target_tokens: target,
            hard_cap_tokens: target * 4,
        }
    }

    fn doc(blocks: Vec<DocBlock>) -> StructuredDocument {
        StructuredDocument {
            title: Some("T".into()),
            blocks,
        }
    }

    fn para(text: &str) -> DocBlock {
        DocBlock {
            kind: BlockKind::Paragraph,
            text: text.to_string(),
        }
    }

    fn heading(level: u8, text: &str) -> DocBlock {
        DocBlock {
            kind: BlockKind::Heading(level),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_web_small_page_single_chunk() {
        let d = doc(vec![heading(1, "Title"), para("Short intro."), para("More text.")]);
        let chunks = chunk_web(&d, &web_cfg(1500));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Title\n\nShort intro.\n\nMore text.");
    }

    #[test]
    fn test_web_offsets_slice_linearized() {
        let d = doc(vec![
            heading(1, "Title"),
            para(&"alpha ".repeat(30).trim().to_string()),
            heading(2, "Section"),
            para(&"beta ".repeat(30).trim().to_string()),
        ]);
        let linearized = crate::fetch_web::linearize(&d);
        let chunks = chunk_web(&d, &web_cfg(20));
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert_eq!(&linearized[c.start_char..c.end_char], c.text);
        }
    }

    #[test]
    fn test_web_heading_opens_chunk() {
        let body = "text ".repeat(40).trim().to_string(); // ~50 tokens
        let d = doc(vec![
            para(&body),
            heading(2, "Next section"),
            para(&body),
        ]);
        let chunks = chunk_web(&d, &web_cfg(80));
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].text.starts_with("Next section"));
    }

    #[test]
    fn test_web_oversized_paragraph_split() {
        let huge = "sentence words here ".repeat(600).trim().to_string();
        let d = doc(vec![para(&huge)]);
        let cfg = WebChunkerConfig {
            target_tokens: 100,
            hard_cap_tokens: 200,
        };
        let chunks = chunk_web(&d, &cfg);
        assert!(chunks.len() > 1);
        let max_chars = cfg.hard_cap_tokens * crate::embedding::CHARS_PER_TOKEN;
        for c in &chunks {
            assert!(c.text.len() <= max_chars);
        }
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i as i64);
        }
    }

    #[test]
    fn test_web_empty_document() {
        let chunks = chunk_web(&doc(vec![]), &web_cfg(1500));
        assert!(chunks.is_empty());
    }
}
