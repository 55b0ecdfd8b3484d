//! Fixed-size text splitting with overlap.

/// Split `text` into pieces of at most `max_chars` characters, preferring to
/// break on whitespace, with `overlap_chars` repeated between neighbours.
pub fn split_text(text: &str, max_chars: usize, overlap_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.trim().chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    let max_chars = max_chars.max(1);
    if chars.len() <= max_chars {
        return vec![chars.iter().collect()];
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    loop {
        let mut end = (start + max_chars).min(chars.len());
        if end < chars.len() {
            // Break at the last whitespace in the second half of the window
            let floor = start + max_chars / 2;
            if let Some(pos) = (floor..end).rev().find(|&i| chars[i].is_whitespace()) {
                end = pos;
            }
        }

        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }

        if end >= chars.len() {
            break;
        }
        start = end.saturating_sub(overlap_chars).max(start + 1);
    }
    pieces
}

/// The last `n` characters of `text`, trimmed to start at a word boundary.
pub(crate) fn overlap_tail(text: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    let count = text.chars().count();
    if count <= n {
        return text.trim();
    }
    let byte_start = text
        .char_indices()
        .nth(count - n)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let tail = &text[byte_start..];
    match tail.find(char::is_whitespace) {
        Some(ws) => tail[ws..].trim(),
        None => tail.trim(),
    }
}
