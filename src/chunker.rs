//! Header-aware semantic Markdown chunking (SPEC_FULL.md §4.1). The Python
//! source this was distilled from (`core/preprocessing/markdown_preprocessor.py`)
//! had its body filtered out of the retrieved pack; only its `__init__.py`
//! export surface (`Chunk`, `HeaderMark`, `YAMLFrontmatter`,
//! `extract_frontmatter`, `extract_header_marks`, `protect_code_blocks`,
//! `restore_code_blocks`, `semantic_chunk`) survived, which is reproduced
//! here as the module's public names. The phase-by-phase algorithm is
//! implemented directly from the specification. Regex/static-pattern style
//! follows `indexer.rs::extract_symbols`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

pub const DEFAULT_MIN_SIZE: usize = 200;
pub const DEFAULT_MAX_SIZE: usize = 1500;
pub const DEFAULT_CHUNK_LEVEL: u8 = 2;

/// A document may claim to have chunks well beyond what any reasonable
/// Markdown file should produce; the Syncer and VectorStore adapter rely on
/// this cap to keep `delete_chunks_by_prefix`'s safe upper bound meaningful
/// (SPEC_FULL.md §9 open-question resolution).
pub const MAX_CHUNKS_PER_FILE: usize = 500;

static HEADER_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(#{1,6})[ \t]+(.+)$").unwrap());
static FENCE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(`{3,}|~{3,})[^\n]*$").unwrap());
static FRONTMATTER_LIST_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-\s*(.+)$").unwrap());
static FRONTMATTER_KV: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z0-9_.\- ]+):\s*(.*)$").unwrap());

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct YamlFrontmatter {
    pub tags: Vec<String>,
    pub create_date: Option<String>,
    pub extra: std::collections::BTreeMap<String, String>,
}

impl YamlFrontmatter {
    fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.create_date.is_none() && self.extra.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeaderMark {
    pub position: usize,
    pub end_position: usize,
    pub level: u8,
    pub title: String,
    pub path: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub source: String,
    pub relative_path: String,
    pub folder_path: String,
    pub header_path: Option<String>,
    pub headers: Vec<String>,
    pub level: Option<u8>,
    pub extra_metadata: std::collections::BTreeMap<String, String>,
    pub frontmatter: Option<YamlFrontmatter>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkerError {
    #[error("malformed frontmatter: no closing '---' fence found within 64 KiB")]
    MalformedFrontmatter,
}

/// Extract a leading `---\n...\n---\n` YAML frontmatter block. Returns the
/// parsed frontmatter (possibly empty) and the remaining body. Only fails
/// (by signalling the caller to treat the whole file as body) when an
/// opening fence has no closing fence within the first 64 KiB, per
/// SPEC_FULL.md §4.1 phase 1.
pub fn extract_frontmatter(text: &str) -> (YamlFrontmatter, String) {
    const SCAN_LIMIT: usize = 64 * 1024;

    if !text.starts_with("---") {
        return (YamlFrontmatter::default(), text.to_string());
    }
    let mut lines = text.split_inclusive('\n');
    let first = lines.next().unwrap_or("");
    if first.trim_end() != "---" {
        return (YamlFrontmatter::default(), text.to_string());
    }

    let mut consumed = first.len();
    let mut body_start = None;
    let mut yaml_lines: Vec<&str> = Vec::new();

    for line in lines {
        consumed += line.len();
        if consumed > SCAN_LIMIT {
            break;
        }
        if line.trim_end() == "---" {
            body_start = Some(consumed);
            break;
        }
        yaml_lines.push(line.trim_end_matches('\n'));
    }

    let Some(start) = body_start else {
        // No closing fence within the scan limit: MalformedFrontmatter's
        // documented fallback is to treat the whole file as body.
        tracing::warn!("frontmatter opened with '---' but never closed; treating file as body");
        return (YamlFrontmatter::default(), text.to_string());
    };

    let mut fm = YamlFrontmatter::default();
    for line in yaml_lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(caps) = FRONTMATTER_LIST_ITEM.captures(trimmed) {
            fm.tags.push(caps[1].trim().to_string());
        } else if let Some(caps) = FRONTMATTER_KV.captures(trimmed) {
            let key = caps[1].trim().to_lowercase();
            let value = caps[2].trim().trim_matches('"').to_string();
            if key == "create" {
                fm.create_date = Some(value);
            } else {
                fm.extra.insert(key, value);
            }
        }
    }

    (fm, text[start..].to_string())
}

/// Replace each fenced code block with a placeholder, returning the
/// placeholder-substituted text and the original block bodies (including
/// fences) in order, so `restore_code_blocks` can splice them back in.
/// Fence matching requires the closing fence to use the same character and
/// at least as many repeats as the opening fence, which also supports
/// fences nested inside a wider outer fence.
pub fn protect_code_blocks(text: &str) -> (String, Vec<String>) {
    let mut blocks = Vec::new();
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    loop {
        let Some(m) = FENCE_LINE.find(rest) else {
            out.push_str(rest);
            break;
        };
        let fence_text = &rest[m.start()..m.end()];
        let fence_char = fence_text.chars().next().unwrap();
        let fence_len = fence_text.chars().take_while(|&c| c == fence_char).count();

        out.push_str(&rest[..m.start()]);

        let after_open = &rest[m.end()..];
        let closing_needle_owner: String = std::iter::repeat(fence_char).take(fence_len).collect();
        let close_re_candidate = format!(r"(?m)^{}[ \t]*$", regex::escape(&closing_needle_owner));
        let close_re = Regex::new(&close_re_candidate).unwrap();

        if let Some(close_m) = close_re.find(after_open) {
            let block_body = &after_open[..close_m.end()];
            let full_block = format!("{fence_text}{block_body}");
            let idx = blocks.len();
            blocks.push(full_block);
            out.push_str(&format!("__CODE_BLOCK_{idx}__"));
            rest = &after_open[close_m.end()..];
        } else {
            // No closing fence found: treat the remainder as one unterminated block.
            let idx = blocks.len();
            blocks.push(format!("{fence_text}{after_open}"));
            out.push_str(&format!("__CODE_BLOCK_{idx}__"));
            rest = "";
        }

        if rest.is_empty() {
            break;
        }
    }

    (out, blocks)
}

pub fn restore_code_blocks(text: &str, blocks: &[String]) -> String {
    let mut out = text.to_string();
    for (idx, block) in blocks.iter().enumerate() {
        out = out.replace(&format!("__CODE_BLOCK_{idx}__"), block);
    }
    out
}

/// Scan for `^(#{1,6})\s+(.+)$` headers, maintaining a six-slot breadcrumb
/// stack: setting level L clears slots `L..6` and sets slot `L-1`.
pub fn extract_header_marks(text: &str) -> Vec<HeaderMark> {
    let mut stack: [Option<String>; 6] = Default::default();
    let mut marks = Vec::new();

    for caps in HEADER_LINE.captures_iter(text) {
        let whole = caps.get(0).unwrap();
        let level = caps[1].len() as u8;
        let title = caps[2].trim().to_string();

        for slot in stack.iter_mut().skip((level - 1) as usize) {
            *slot = None;
        }
        stack[(level - 1) as usize] = Some(title.clone());

        let path: Vec<String> = stack.iter().filter_map(|s| s.clone()).collect();

        marks.push(HeaderMark {
            position: whole.start(),
            end_position: whole.end(),
            level,
            title,
            path,
        });
    }

    marks
}

struct PendingChunk {
    headers: Vec<String>,
    header_path: String,
    level: u8,
    text: String,
}

/// Split `text` into `Chunk`s per SPEC_FULL.md §4.1. `source` is the file
/// name used in metadata; `relative_path`/`folder_path` identify the file
/// within the vault.
pub fn semantic_chunk(
    text: &str,
    source: &str,
    relative_path: &str,
    folder_path: &str,
    min_size: usize,
    max_size: usize,
    chunk_level: u8,
    extra_metadata: std::collections::BTreeMap<String, String>,
) -> Vec<Chunk> {
    let (frontmatter, body) = extract_frontmatter(text);
    let (protected, code_blocks) = protect_code_blocks(&body);
    let marks = extract_header_marks(&protected);

    let frontmatter_opt = if frontmatter.is_empty() {
        None
    } else {
        Some(frontmatter)
    };

    if marks.is_empty() {
        let restored = restore_code_blocks(&protected, &code_blocks);
        let trimmed = restored.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        return vec![Chunk {
            text: trimmed.to_string(),
            metadata: ChunkMetadata {
                source: source.to_string(),
                relative_path: relative_path.to_string(),
                folder_path: folder_path.to_string(),
                header_path: None,
                headers: Vec::new(),
                level: None,
                extra_metadata,
                frontmatter: frontmatter_opt,
            },
        }];
    }

    let mut sections: Vec<(HeaderMark, String)> = Vec::with_capacity(marks.len());
    for (i, mark) in marks.iter().enumerate() {
        let end = marks.get(i + 1).map(|m| m.position).unwrap_or(protected.len());
        let raw = &protected[mark.position..end];
        let restored = restore_code_blocks(raw, &code_blocks);
        let body_only = restored
            .trim_start_matches(|c: char| c != '\n')
            .trim_start_matches('\n')
            .to_string();
        let trimmed = body_only.trim();
        if trimmed.is_empty() || trimmed == mark.title {
            continue;
        }
        sections.push((mark.clone(), restored));
    }

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut pending: Option<PendingChunk> = None;

    let flush = |pending: PendingChunk, chunks: &mut Vec<Chunk>| {
        let header_path = if pending.header_path.is_empty() {
            None
        } else {
            Some(pending.header_path.clone())
        };
        if pending.text.len() > max_size {
            for piece in split_into_paragraph_bounded_pieces(&pending.text, max_size) {
                chunks.push(Chunk {
                    text: piece,
                    metadata: ChunkMetadata {
                        source: source.to_string(),
                        relative_path: relative_path.to_string(),
                        folder_path: folder_path.to_string(),
                        header_path: header_path.clone(),
                        headers: pending.headers.clone(),
                        level: Some(pending.level),
                        extra_metadata: extra_metadata.clone(),
                        frontmatter: frontmatter_opt.clone(),
                    },
                });
            }
        } else {
            chunks.push(Chunk {
                text: pending.text,
                metadata: ChunkMetadata {
                    source: source.to_string(),
                    relative_path: relative_path.to_string(),
                    folder_path: folder_path.to_string(),
                    header_path,
                    headers: pending.headers,
                    level: Some(pending.level),
                    extra_metadata: extra_metadata.clone(),
                    frontmatter: frontmatter_opt.clone(),
                },
            });
        }
    };

    for (mark, section_text) in sections {
        if mark.level <= chunk_level {
            if let Some(p) = pending.take() {
                flush(p, &mut chunks);
            }
            pending = Some(PendingChunk {
                headers: mark.path.clone(),
                header_path: join_header_path(&mark.path),
                level: mark.level,
                text: section_text.trim().to_string(),
            });
        } else if let Some(p) = pending.as_mut() {
            if !p.text.is_empty() {
                p.text.push_str("\n\n");
            }
            p.text.push_str(section_text.trim());
            p.headers = mark.path.clone();
            p.header_path = join_header_path(&mark.path);
        } else {
            // A sub-header with no enclosing chunk-level header yet: open
            // one anyway so its content isn't dropped.
            pending = Some(PendingChunk {
                headers: mark.path.clone(),
                header_path: join_header_path(&mark.path),
                level: mark.level,
                text: section_text.trim().to_string(),
            });
        }
    }

    if let Some(last) = pending.take() {
        // Only absorb a short trailing fragment into a previous chunk that's
        // already a genuine, adequately-sized chunk. Two small sibling
        // sections (neither reaching min_size) stay distinct chunks instead
        // of collapsing into one.
        let can_merge = last.text.len() < min_size
            && chunks
                .last()
                .is_some_and(|prev| prev.text.len() >= min_size && prev.text.len() + 2 + last.text.len() <= max_size);
        if can_merge {
            let prev = chunks.last_mut().expect("can_merge implies chunks is non-empty");
            prev.text.push_str("\n\n");
            prev.text.push_str(&last.text);
        } else {
            flush(last, &mut chunks);
        }
    }

    chunks.truncate(MAX_CHUNKS_PER_FILE);
    chunks
}

fn join_header_path(path: &[String]) -> String {
    path.iter()
        .enumerate()
        .map(|(i, title)| format!("{} {}", "#".repeat(i + 1), title))
        .collect::<Vec<_>>()
        .join(" > ")
}

/// Greedily pack blank-line-separated paragraphs into pieces no larger than
/// `max_size`. A single paragraph larger than `max_size` (e.g. one
/// containing a huge protected code block) is emitted standalone, which is
/// the documented exception to the chunk-size-bound invariant.
fn split_into_paragraph_bounded_pieces(text: &str, max_size: usize) -> Vec<String> {
    let paragraphs: Vec<&str> = text.split("\n\n").collect();
    let mut pieces = Vec::new();
    let mut current = String::new();

    for para in paragraphs {
        let candidate_len = if current.is_empty() {
            para.len()
        } else {
            current.len() + 2 + para.len()
        };
        if candidate_len > max_size && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }
        if current.is_empty() {
            current.push_str(para);
        } else {
            current.push_str("\n\n");
            current.push_str(para);
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn chunk(text: &str) -> Vec<Chunk> {
        semantic_chunk(
            text,
            "a.md",
            "notes/a.md",
            "notes",
            DEFAULT_MIN_SIZE,
            DEFAULT_MAX_SIZE,
            DEFAULT_CHUNK_LEVEL,
            BTreeMap::new(),
        )
    }

    #[test]
    fn two_top_level_sections_become_two_chunks() {
        let text = "## X\ntext\n## Y\ntext2\n";
        let chunks = chunk(text);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].metadata.headers, vec!["X".to_string()]);
        assert_eq!(chunks[1].metadata.headers, vec!["Y".to_string()]);
    }

    #[test]
    fn no_headers_emits_single_chunk() {
        let chunks = chunk("just a plain paragraph with no headers at all.\n");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].metadata.headers.is_empty());
    }

    #[test]
    fn code_blocks_are_never_split() {
        let text = "## Code\nhere is some code:\n```rust\nfn main() {\n    // a\n}\n```\nmore text\n";
        let chunks = chunk(text);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("```rust"));
        assert!(chunks[0].text.contains("```\n") || chunks[0].text.trim_end().ends_with("```"));
    }

    #[test]
    fn frontmatter_tags_and_create_date_are_parsed() {
        let text = "---\ntags:\n- alpha\n- beta\ncreate: 2024-01-01\n---\n## H\nbody\n";
        let (fm, body) = extract_frontmatter(text);
        assert_eq!(fm.tags, vec!["alpha".to_string(), "beta".to_string()]);
        assert_eq!(fm.create_date, Some("2024-01-01".to_string()));
        assert!(body.trim_start().starts_with("## H"));
    }

    #[test]
    fn header_breadcrumb_is_prefix_consistent() {
        let text = "# A\nintro\n## B\nb text\n### C\nc text\n## D\nd text\n";
        let marks = extract_header_marks(text);
        assert_eq!(marks[0].path, vec!["A".to_string()]);
        assert_eq!(marks[1].path, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(
            marks[2].path,
            vec!["A".to_string(), "B".to_string(), "C".to_string()]
        );
        assert_eq!(marks[3].path, vec!["A".to_string(), "D".to_string()]);
    }

    #[test]
    fn short_tail_chunk_merges_into_previous() {
        let text = format!(
            "## First\n{}\n## Second\ntiny\n",
            "word ".repeat(60)
        );
        let chunks = chunk(&text);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("tiny"));
    }

    #[test]
    fn oversized_section_splits_by_paragraph() {
        let para = "x".repeat(900);
        let text = format!("## Big\n{para}\n\n{para}\n\n{para}\n");
        let chunks = chunk(&text);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(c.text.len() <= DEFAULT_MAX_SIZE || c.text.len() == para.len());
        }
    }
}
