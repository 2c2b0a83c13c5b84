//! Format a parse result for display (dump text). One line per node, indented by depth.

use crate::abt::{AbtNode, AbtRoot};

/// Render the whole tree as `[start..end) name` lines, two spaces per level.
pub fn render(root: &AbtRoot) -> String {
    let mut lines = Vec::new();
    for node in &root.children {
        push_node(&mut lines, node, 0, None);
    }
    lines.join("\n")
}

/// Like [`render`], with a hex preview of the bytes each leaf covers.
pub fn render_with_bytes(root: &AbtRoot, data: &[u8]) -> String {
    let mut lines = Vec::new();
    for node in &root.children {
        push_node(&mut lines, node, 0, Some(data));
    }
    lines.join("\n")
}

/// Errors block for the end of a dump; empty when the parse was clean.
pub fn render_errors(root: &AbtRoot) -> String {
    if root.errors.is_empty() {
        return String::new();
    }
    let mut lines = vec![format!("{} error(s):", root.errors.len())];
    lines.extend(root.errors.iter().map(|e| format!("  {}", e)));
    lines.join("\n")
}

fn push_node(lines: &mut Vec<String>, node: &AbtNode, depth: usize, data: Option<&[u8]>) {
    let pad = "  ".repeat(depth);
    let mut line = format!("{}[{}..{}) {}", pad, node.start, node.end, node.name);
    if let (Some(data), true) = (data, node.children.is_empty()) {
        let preview = hex_string(covered(data, node));
        if !preview.is_empty() {
            line.push_str(&format!("  hex({})", preview));
        }
    }
    lines.push(line);
    for child in &node.children {
        push_node(lines, child, depth + 1, data);
    }
}

/// Bytes touched by the node, clamped to the buffer and capped for display.
fn covered<'a>(data: &'a [u8], node: &AbtNode) -> &'a [u8] {
    const PREVIEW_BYTES: i64 = 16;
    let len = data.len() as i64;
    let lo = node.start.byte().clamp(0, len);
    let hi = node.end.ceil_byte().clamp(lo, len).min(lo + PREVIEW_BYTES);
    &data[lo as usize..hi as usize]
}

fn hex_string(b: &[u8]) -> String {
    b.iter().map(|x| format!("{:02x}", x)).collect::<Vec<_>>().join(" ")
}
