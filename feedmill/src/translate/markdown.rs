/*!
Structure-preserving segmentation for markdown translation: heading
markers, list bullets, blockquote prefixes, code (fenced and inline) and
link targets are kept verbatim; only the textual runs go to the provider.
*/

/// One segment of the input. `Keep` passes through untranslated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Keep(String),
    Translate(String),
}

/// Split markdown into keep/translate segments, line by line.
pub fn segment(input: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut in_code_fence = false;

    for (i, line) in input.lines().enumerate() {
        if i > 0 {
            push_keep(&mut segments, "\n");
        }

        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_code_fence = !in_code_fence;
            push_keep(&mut segments, line);
            continue;
        }
        if in_code_fence {
            push_keep(&mut segments, line);
            continue;
        }

        let (prefix, rest) = split_block_prefix(line);
        if !prefix.is_empty() {
            push_keep(&mut segments, prefix);
        }
        segment_inline(rest, &mut segments);
    }

    segments
}

/// Reassemble segments after the translate segments were replaced.
pub fn reassemble(segments: &[Segment]) -> String {
    let mut out = String::new();
    for seg in segments {
        match seg {
            Segment::Keep(s) | Segment::Translate(s) => out.push_str(s),
        }
    }
    out
}

/// Block-level prefix: heading markers, list bullets, ordered-list numbers,
/// blockquote markers, leading indentation.
fn split_block_prefix(line: &str) -> (&str, &str) {
    let bytes = line.as_bytes();
    let mut i = 0;

    // Leading whitespace
    while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b'\t') {
        i += 1;
    }
    // Blockquote markers, possibly nested
    while i < bytes.len() && bytes[i] == b'>' {
        i += 1;
        while i < bytes.len() && bytes[i] == b' ' {
            i += 1;
        }
    }
    // Heading markers
    if i < bytes.len() && bytes[i] == b'#' {
        while i < bytes.len() && bytes[i] == b'#' {
            i += 1;
        }
        while i < bytes.len() && bytes[i] == b' ' {
            i += 1;
        }
        return line.split_at(i);
    }
    // Unordered list bullet
    if i + 1 < bytes.len() && matches!(bytes[i], b'-' | b'*' | b'+') && bytes[i + 1] == b' ' {
        return line.split_at(i + 2);
    }
    // Ordered list number
    let digits_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i > digits_start && i + 1 < bytes.len() && (bytes[i] == b'.' || bytes[i] == b')') && bytes[i + 1] == b' ' {
        return line.split_at(i + 2);
    }

    line.split_at(digits_start.min(line.len()))
}

/// Inline pass: keep code spans and link/image targets, translate the rest.
fn segment_inline(text: &str, segments: &mut Vec<Segment>) {
    let chars: Vec<char> = text.chars().collect();
    let mut run = String::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        match ch {
            '`' => {
                // Code span: keep through the closing backtick.
                if let Some(end) = find_char(&chars, i + 1, '`') {
                    flush_translate(segments, &mut run);
                    let span: String = chars[i..=end].iter().collect();
                    push_keep(segments, &span);
                    i = end + 1;
                    continue;
                }
                run.push(ch);
                i += 1;
            }
            '[' => {
                // Link: translate the label, keep the target.
                if let Some((label_end, target_end)) = parse_link(&chars, i) {
                    flush_translate(segments, &mut run);
                    push_keep(segments, "[");
                    let label: String = chars[i + 1..label_end].iter().collect();
                    if !label.trim().is_empty() {
                        segments.push(Segment::Translate(label));
                    }
                    let target: String = chars[label_end..=target_end].iter().collect();
                    push_keep(segments, &target);
                    i = target_end + 1;
                    continue;
                }
                run.push(ch);
                i += 1;
            }
            _ => {
                run.push(ch);
                i += 1;
            }
        }
    }
    flush_translate(segments, &mut run);
}

fn parse_link(chars: &[char], start: usize) -> Option<(usize, usize)> {
    let label_end = find_char(chars, start + 1, ']')?;
    if label_end + 1 >= chars.len() || chars[label_end + 1] != '(' {
        return None;
    }
    let target_end = find_char(chars, label_end + 2, ')')?;
    Some((label_end, target_end))
}

fn find_char(chars: &[char], from: usize, needle: char) -> Option<usize> {
    chars[from..].iter().position(|c| *c == needle).map(|p| p + from)
}

fn flush_translate(segments: &mut Vec<Segment>, run: &mut String) {
    if !run.is_empty() {
        if run.trim().is_empty() {
            segments.push(Segment::Keep(std::mem::take(run)));
        } else {
            segments.push(Segment::Translate(std::mem::take(run)));
        }
    }
}

fn push_keep(segments: &mut Vec<Segment>, s: &str) {
    if s.is_empty() {
        return;
    }
    if let Some(Segment::Keep(last)) = segments.last_mut() {
        last.push_str(s);
        return;
    }
    segments.push(Segment::Keep(s.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translated(input: &str) -> String {
        // Fake provider: upper-cases each translate run.
        let mut segs = segment(input);
        for seg in &mut segs {
            if let Segment::Translate(text) = seg {
                *text = text.to_uppercase();
            }
        }
        reassemble(&segs)
    }

    #[test]
    fn heading_and_list_markers_survive() {
        let input = "# Title here\n- first item\n2. second item";
        assert_eq!(translated(input), "# TITLE HERE\n- FIRST ITEM\n2. SECOND ITEM");
    }

    #[test]
    fn code_is_untouched() {
        let input = "Use `cargo build` here\n```\nlet x = 1;\n```\ndone";
        let out = translated(input);
        assert!(out.contains("`cargo build`"));
        assert!(out.contains("let x = 1;"));
        assert!(out.contains("DONE"));
    }

    #[test]
    fn link_targets_survive_labels_translate() {
        let input = "See [the docs](https://example.com/docs) now";
        let out = translated(input);
        assert!(out.contains("[THE DOCS](https://example.com/docs)"));
        assert!(out.starts_with("SEE "));
    }

    #[test]
    fn blockquotes_keep_their_marker() {
        assert_eq!(translated("> quoted text"), "> QUOTED TEXT");
    }

    #[test]
    fn reassemble_is_identity_without_translation() {
        let input = "# A\n\n- b `c` [d](e)\n> f";
        assert_eq!(reassemble(&segment(input)), input);
    }
}
