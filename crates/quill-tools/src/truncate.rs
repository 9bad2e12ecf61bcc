// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use crate::tool::OutputCategory;

const CHARS_PER_TOKEN: usize = 4;

/// Clip an oversized tool result to fit the per-result token cap.
///
/// Returns `content` unchanged when it fits (or when `cap_tokens` is 0,
/// which disables clipping).  Otherwise the [`OutputCategory`] decides how
/// the byte budget is split between a leading and a trailing window, both
/// snapped to line boundaries, with an explicit elision note standing in
/// for the removed middle so the model knows more output exists.
pub fn clip_output(content: &str, category: OutputCategory, cap_tokens: usize) -> String {
    if cap_tokens == 0 {
        return content.to_string();
    }
    let budget = cap_tokens.saturating_mul(CHARS_PER_TOKEN);
    if content.len() <= budget {
        return content.to_string();
    }

    let (lead, trail) = window_split(category, budget);
    let head = prefix_window(content, lead);
    let mut tail = suffix_window(content, trail);
    if head.len() + tail.len() >= content.len() {
        tail = "";
    }

    let cut = &content[head.len()..content.len() - tail.len()];
    let note = elision_note(category, cut);
    if tail.is_empty() {
        format!("{head}\n{note}")
    } else {
        format!("{head}\n{note}\n{tail}")
    }
}

/// How each category divides the byte budget between the two windows.
fn window_split(category: OutputCategory, budget: usize) -> (usize, usize) {
    match category {
        // Command context up front, a smaller window for the final result.
        OutputCategory::HeadTail => (budget * 2 / 3, budget / 3),
        OutputCategory::FileContent => (budget / 2, budget / 2),
        // Ranked output: everything goes to the front.
        OutputCategory::MatchList | OutputCategory::Generic => (budget, 0),
    }
}

/// Largest prefix within `max` bytes, preferring to end at a newline.
fn prefix_window(content: &str, max: usize) -> &str {
    if max == 0 {
        return "";
    }
    if content.len() <= max {
        return content;
    }
    let hard = floor_boundary(content, max);
    match content[..hard].rfind('\n') {
        Some(pos) => &content[..pos],
        None => &content[..hard],
    }
}

/// Largest suffix within `max` bytes, starting just after a newline so the
/// window never opens mid-line.
fn suffix_window(content: &str, max: usize) -> &str {
    if max == 0 {
        return "";
    }
    let from = ceil_boundary(content, content.len().saturating_sub(max));
    match content[from..].find('\n') {
        Some(pos) => &content[from + pos + 1..],
        None => &content[from..],
    }
}

fn floor_boundary(s: &str, mut idx: usize) -> usize {
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

fn elision_note(category: OutputCategory, cut: &str) -> String {
    let lines = cut.lines().count();
    let bytes = cut.len();
    let hint = match category {
        OutputCategory::MatchList => "; narrow the search to see later matches",
        OutputCategory::FileContent => "; fetch a smaller range for the rest",
        OutputCategory::HeadTail | OutputCategory::Generic => "",
    };
    format!("<elided {lines} lines, {bytes} bytes{hint}>")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered_lines(n: usize) -> String {
        (0..n).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n")
    }

    #[test]
    fn content_under_cap_is_unchanged() {
        let s = "short output";
        assert_eq!(clip_output(s, OutputCategory::Generic, 100), s);
    }

    #[test]
    fn zero_cap_disables_clipping() {
        let s = numbered_lines(5_000);
        assert_eq!(clip_output(&s, OutputCategory::Generic, 0), s);
    }

    #[test]
    fn generic_keeps_the_front_and_notes_the_cut() {
        let s = numbered_lines(5_000);
        let out = clip_output(&s, OutputCategory::Generic, 100);
        assert!(out.len() < s.len());
        assert!(out.starts_with("line 0"));
        assert!(out.ends_with('>'));
        assert!(out.contains("<elided"));
    }

    #[test]
    fn head_tail_keeps_both_ends() {
        let s = numbered_lines(5_000);
        let out = clip_output(&s, OutputCategory::HeadTail, 200);
        assert!(out.starts_with("line 0"));
        assert!(out.ends_with("line 4999"));
        assert!(out.contains("<elided"));
    }

    #[test]
    fn match_list_drops_the_tail_with_a_hint() {
        let s = numbered_lines(5_000);
        let out = clip_output(&s, OutputCategory::MatchList, 100);
        assert!(out.starts_with("line 0"));
        assert!(!out.contains("line 4999"));
        assert!(out.contains("narrow the search"));
    }

    #[test]
    fn file_content_splits_budget_between_head_and_tail() {
        let s = numbered_lines(5_000);
        let out = clip_output(&s, OutputCategory::FileContent, 200);
        assert!(out.starts_with("line 0"));
        assert!(out.ends_with("line 4999"));
        assert!(out.contains("fetch a smaller range"));
    }

    #[test]
    fn windows_snap_to_line_boundaries() {
        let s = numbered_lines(2_000);
        let out = clip_output(&s, OutputCategory::FileContent, 100);
        // Every surviving line must be one of the original lines, intact.
        for line in out.lines().filter(|l| !l.starts_with('<')) {
            assert!(
                line.starts_with("line ") && line[5..].parse::<usize>().is_ok(),
                "window opened mid-line: {line:?}"
            );
        }
    }

    #[test]
    fn multibyte_content_never_splits_a_character() {
        let s = "héllo wörld ".repeat(4_000);
        let out = clip_output(&s, OutputCategory::Generic, 100);
        assert!(out.chars().count() > 0); // would panic on a bad boundary
    }

    #[test]
    fn single_long_line_is_cut_at_a_char_boundary() {
        let s = "x".repeat(10_000);
        let out = clip_output(&s, OutputCategory::Generic, 100);
        assert!(out.len() < s.len());
        assert!(out.contains("<elided 1 lines"));
    }
}
