//! Compact output rendering helpers for CLI surfaces.
//!
//! Keeps captured subprocess output bounded while making every cut visible.

/// Collapse newlines/extra whitespace and bound length for terminal display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

/// Decode captured bytes, keeping at most `max_bytes` of the head.
///
/// `dropped` counts bytes that were never buffered by the reader. Any cut
/// appends an explicit marker naming how much was lost.
pub fn truncate_output(bytes: &[u8], max_bytes: usize, dropped: usize) -> String {
    let (kept, cut_here) = if bytes.len() > max_bytes {
        (&bytes[..max_bytes], bytes.len() - max_bytes)
    } else {
        (bytes, 0)
    };
    let mut text = String::from_utf8_lossy(kept).into_owned();
    let total_cut = cut_here + dropped;
    if total_cut > 0 {
        if !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!("[... truncated {} bytes ...]", total_cut));
    }
    text
}

/// Indent every line of a block for nesting under a report heading.
pub fn indent_block(text: &str, prefix: &str) -> String {
    text.lines()
        .map(|l| format!("{}{}", prefix, l))
        .collect::<Vec<_>>()
        .join("\n")
}
