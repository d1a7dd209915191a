//! Markdown chunking.
//!
//! Text is scanned line by line into typed blocks (heading, paragraph,
//! list, code, quote), each tagged with the most recent heading. Blocks
//! are then packed into chunks no longer than the configured limit:
//! a heading always opens a new chunk, and a block that cannot fit on its
//! own is split at the last whitespace at or before the limit.

use serde::{Deserialize, Serialize};

/// Separator placed between blocks packed into the same chunk.
const BLOCK_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Heading,
    Paragraph,
    List,
    Code,
    Quote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub kind: ChunkKind,
    pub content: String,
    pub heading_context: Option<String>,
    /// Byte offset of the chunk's first block in the source text.
    pub start_offset: usize,
}

#[derive(Debug, Clone)]
struct Block {
    kind: ChunkKind,
    lines: Vec<String>,
    heading_context: Option<String>,
    start_offset: usize,
}

impl Block {
    fn new(kind: ChunkKind, line: &str, heading_context: Option<String>, start_offset: usize) -> Self {
        Self {
            kind,
            lines: vec![line.to_string()],
            heading_context,
            start_offset,
        }
    }

    fn content(&self) -> String {
        self.lines.join("\n")
    }
}

#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size_limit: usize,
}

impl Chunker {
    pub fn new(chunk_size_limit: usize) -> Self {
        Self {
            chunk_size_limit: chunk_size_limit.max(1),
        }
    }

    /// Split a markdown document into ordered chunks.
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        let blocks = parse_blocks(text);
        self.pack(blocks)
    }

    fn pack(&self, blocks: Vec<Block>) -> Vec<Chunk> {
        let limit = self.chunk_size_limit;
        let mut chunks = Vec::new();
        let mut current: Option<Chunk> = None;
        let mut current_size = 0usize;

        for block in blocks {
            let content = block.content();
            let block_size = char_len(&content);

            if block.kind != ChunkKind::Heading {
                if let Some(chunk) = current.as_mut() {
                    let joined = current_size + char_len(BLOCK_SEPARATOR) + block_size;
                    if joined <= limit {
                        chunk.content.push_str(BLOCK_SEPARATOR);
                        chunk.content.push_str(&content);
                        current_size = joined;
                        continue;
                    }
                }
            }

            // Heading, first block, or overflow: start over.
            if let Some(done) = current.take() {
                chunks.push(done);
            }

            if block_size <= limit {
                current = Some(Chunk {
                    kind: block.kind,
                    content,
                    heading_context: block.heading_context,
                    start_offset: block.start_offset,
                });
                current_size = block_size;
                continue;
            }

            let mut pieces = split_at_whitespace(&content, limit);
            let remainder = pieces.pop();
            for (piece, offset) in pieces {
                chunks.push(Chunk {
                    kind: block.kind,
                    content: piece,
                    heading_context: block.heading_context.clone(),
                    start_offset: block.start_offset + offset,
                });
            }
            if let Some((piece, offset)) = remainder {
                current_size = char_len(&piece);
                current = Some(Chunk {
                    kind: block.kind,
                    content: piece,
                    heading_context: block.heading_context,
                    start_offset: block.start_offset + offset,
                });
            }
        }

        if let Some(done) = current {
            chunks.push(done);
        }
        chunks
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(500)
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// ATX heading level, or 0. `#tag` lines are not headings.
fn heading_level(line: &str) -> usize {
    let level = line.chars().take_while(|c| *c == '#').count();
    match line[level..].chars().next() {
        None => level,
        Some(c) if c.is_whitespace() => level,
        _ => 0,
    }
}

fn is_list_item(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("- ") || trimmed.starts_with("* ") || trimmed == "-" || trimmed == "*"
}

fn heading_text(line: &str) -> String {
    line.trim_start_matches('#').trim().to_string()
}

/// Scan the document into typed blocks, preserving order.
fn parse_blocks(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut current: Option<Block> = None;
    let mut heading: Option<String> = None;
    let mut in_code = false;
    let mut offset = 0usize;

    for raw in text.split_inclusive('\n') {
        let line_offset = offset;
        offset += raw.len();
        let line = raw.trim_end_matches(['\n', '\r']);

        if in_code {
            if let Some(block) = current.as_mut() {
                block.lines.push(line.to_string());
            }
            if line.trim_start().starts_with("```") {
                in_code = false;
                blocks.extend(current.take());
            }
            continue;
        }

        if line.trim().is_empty() {
            blocks.extend(current.take());
            continue;
        }

        if line.starts_with("```") {
            blocks.extend(current.take());
            current = Some(Block::new(ChunkKind::Code, line, heading.clone(), line_offset));
            in_code = true;
            continue;
        }

        if heading_level(line) > 0 {
            blocks.extend(current.take());
            let title = heading_text(line);
            heading = (!title.is_empty()).then_some(title);
            blocks.push(Block::new(ChunkKind::Heading, line, heading.clone(), line_offset));
            continue;
        }

        let kind = if is_list_item(line) {
            ChunkKind::List
        } else if line.trim_start().starts_with('>') {
            ChunkKind::Quote
        } else {
            ChunkKind::Paragraph
        };

        match current.as_mut() {
            // List items and quote lines continue a block of their own kind;
            // plain lines continue whatever block is open.
            Some(block) if block.kind == kind || kind == ChunkKind::Paragraph => {
                block.lines.push(line.to_string());
            }
            _ => {
                blocks.extend(current.take());
                current = Some(Block::new(kind, line, heading.clone(), line_offset));
            }
        }
    }

    blocks.extend(current);
    blocks
}

/// Split `text` into pieces of at most `limit` characters, breaking at the
/// last whitespace at or before the limit. A run without whitespace longer
/// than the limit is kept whole. Returns each piece with its byte offset
/// into `text`.
fn split_at_whitespace(text: &str, limit: usize) -> Vec<(String, usize)> {
    let mut pieces = Vec::new();
    let mut start = skip_whitespace(text, 0);

    while start < text.len() {
        let rest = &text[start..];
        if char_len(rest) <= limit {
            pieces.push((rest.trim_end().to_string(), start));
            break;
        }

        // Byte index of the char right after the first `limit` chars.
        let boundary = rest
            .char_indices()
            .nth(limit)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());

        // Whitespace at char index `limit` itself is a clean break too.
        let cut = rest[..boundary]
            .char_indices()
            .chain(rest[boundary..].char_indices().take(1).map(|(i, c)| (i + boundary, c)))
            .filter(|(i, c)| *i > 0 && c.is_whitespace())
            .map(|(i, _)| i)
            .last()
            .or_else(|| {
                // Unsplittable token: emit it whole.
                rest[boundary..]
                    .char_indices()
                    .find(|(_, c)| c.is_whitespace())
                    .map(|(i, _)| i + boundary)
            })
            .unwrap_or(rest.len());

        let piece = rest[..cut].trim_end();
        if !piece.is_empty() {
            pieces.push((piece.to_string(), start));
        }
        start = skip_whitespace(text, start + cut);
    }

    pieces
}

fn skip_whitespace(text: &str, from: usize) -> usize {
    text[from..]
        .char_indices()
        .find(|(_, c)| !c.is_whitespace())
        .map(|(i, _)| from + i)
        .unwrap_or(text.len())
}
