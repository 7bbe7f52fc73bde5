//! Splits extracted resume text into overlapping, semantically coherent
//! chunks. Boundaries prefer natural breaks (blank-line paragraphs) over
//! fixed-width cuts; only paragraphs that exceed the bound are word-split.

/// Upper bound on chunk size, in characters.
pub const MAX_CHUNK_CHARS: usize = 1200;

/// Tail of the previous chunk carried into the next one, so content near a
/// boundary stays retrievable from either side.
pub const CHUNK_OVERLAP_CHARS: usize = 200;

pub fn chunk_text(text: &str) -> Vec<String> {
    chunk_text_with(text, MAX_CHUNK_CHARS, CHUNK_OVERLAP_CHARS)
}

fn chunk_text_with(text: &str, max_chars: usize, overlap_chars: usize) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n");
    let pieces: Vec<String> = normalized
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .flat_map(|p| split_long_paragraph(p, max_chars))
        .collect();

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for piece in pieces {
        if !current.is_empty() && char_len(&current) + char_len(&piece) + 2 > max_chars {
            let overlap = overlap_suffix(&current, overlap_chars).to_string();
            chunks.push(std::mem::take(&mut current));
            // Seed the next chunk with the overlap only when it leaves room
            // for the piece itself.
            if !overlap.is_empty() && char_len(&overlap) + char_len(&piece) + 2 <= max_chars {
                current = overlap;
            }
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(&piece);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Word-splits a paragraph that alone exceeds the chunk bound.
fn split_long_paragraph(paragraph: &str, max_chars: usize) -> Vec<String> {
    if char_len(paragraph) <= max_chars {
        return vec![paragraph.to_string()];
    }
    let mut out = Vec::new();
    let mut current = String::new();
    for word in paragraph.split_whitespace() {
        if !current.is_empty() && char_len(&current) + char_len(word) + 1 > max_chars {
            out.push(std::mem::take(&mut current));
        }
        if char_len(word) > max_chars {
            // A single oversized token gets hard-cut on char boundaries.
            let chars: Vec<char> = word.chars().collect();
            for piece in chars.chunks(max_chars) {
                out.push(piece.iter().collect());
            }
            continue;
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// The last `max_chars` characters of a chunk, snapped forward to a
/// whitespace boundary so the overlap starts on a whole word.
fn overlap_suffix(chunk: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    let total = char_len(chunk);
    if total <= max_chars {
        return chunk;
    }
    let start = chunk
        .char_indices()
        .nth(total - max_chars)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let tail = &chunk[start..];
    match tail.find(char::is_whitespace) {
        Some(i) => tail[i..].trim_start(),
        None => tail,
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}
