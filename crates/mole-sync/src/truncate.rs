//! Tool output truncation.
//!
//! `pg_restore -v` can print megabytes of progress to stderr, and the line
//! that explains the failure comes last. Run messages keep a short head (what
//! was attempted) and a long tail.

/// Maximum characters of tool output kept in a run message.
pub const MAX_MESSAGE_CHARS: usize = 4_000;

/// Truncate `output` to at most `max_chars` characters, dropping the middle.
///
/// A quarter of the budget goes to the head and the rest to the tail. Cuts
/// land on character boundaries.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_owned();
    }

    let head_chars = max_chars / 4;
    let tail_chars = max_chars - head_chars;
    let head = &output[..byte_offset(output, head_chars)];
    let tail = &output[byte_offset(output, total - tail_chars)..];

    format!("{head}\n... [{} chars omitted] ...\n{tail}", total - max_chars)
}

/// Byte index of the `n`th character, or the end of `s`.
fn byte_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map_or(s.len(), |(i, _)| i)
}
