/// Unified-hunk parsing, best-effort application, and inversion.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("malformed hunk header: {0}")]
    MalformedHeader(String),

    #[error("patch line outside any hunk: {0}")]
    StrayLine(String),
}

/// One parsed hunk. Line payloads keep their trailing newline; the final
/// line of a file without one is stored without it (signalled in the patch
/// text by the `\ No newline at end of file` marker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: u64,
    pub old_count: u64,
    pub new_start: u64,
    pub new_count: u64,
    pub lines: Vec<HunkLine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

impl Hunk {
    /// Lines the hunk expects to find in the document.
    fn old_side(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }

    /// Lines the hunk produces.
    fn new_side(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Add(s) => Some(s.as_str()),
                HunkLine::Remove(_) => None,
            })
            .collect()
    }
}

/// Outcome of [`apply_patch`]: `ok` iff every hunk placed cleanly; `result`
/// is the best-effort document either way.
#[derive(Debug, Clone)]
pub struct PatchOutcome {
    pub result: String,
    pub ok: bool,
    pub hunks_total: usize,
    pub hunks_applied: usize,
}

fn parse_range(spec: &str) -> Option<(u64, u64)> {
    match spec.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((spec.parse().ok()?, 1)),
    }
}

fn parse_header(line: &str) -> Option<(u64, u64, u64, u64)> {
    // @@ -a,b +c,d @@
    let inner = line.strip_prefix("@@ -")?;
    let (old_spec, rest) = inner.split_once(' ')?;
    let new_spec = rest.strip_prefix('+')?;
    let new_spec = new_spec.split_once(' ').map(|(s, _)| s).unwrap_or(new_spec);
    let (old_start, old_count) = parse_range(old_spec)?;
    let (new_start, new_count) = parse_range(new_spec)?;
    Some((old_start, old_count, new_start, new_count))
}

/// Parse patch text into hunks. File headers (`---`/`+++`) are tolerated and
/// skipped; anything else outside a hunk is an error.
pub fn parse_patch(patch: &str) -> Result<Vec<Hunk>, PatchError> {
    let mut hunks: Vec<Hunk> = Vec::new();

    for raw in patch.split('\n') {
        if raw.starts_with("@@") {
            let (old_start, old_count, new_start, new_count) =
                parse_header(raw).ok_or_else(|| PatchError::MalformedHeader(raw.to_string()))?;
            hunks.push(Hunk {
                old_start,
                old_count,
                new_start,
                new_count,
                lines: Vec::new(),
            });
            continue;
        }

        if raw.is_empty() {
            continue;
        }
        // File headers appear before the first hunk, if at all.
        if hunks.is_empty() && (raw.starts_with("---") || raw.starts_with("+++")) {
            continue;
        }

        let Some(hunk) = hunks.last_mut() else {
            return Err(PatchError::StrayLine(raw.to_string()));
        };

        match raw.as_bytes()[0] {
            b' ' => hunk.lines.push(HunkLine::Context(format!("{}\n", &raw[1..]))),
            b'-' => hunk.lines.push(HunkLine::Remove(format!("{}\n", &raw[1..]))),
            b'+' => hunk.lines.push(HunkLine::Add(format!("{}\n", &raw[1..]))),
            b'\\' => {
                // "\ No newline at end of file": the previous line has none.
                if let Some(last) = hunk.lines.last_mut() {
                    let s = match last {
                        HunkLine::Context(s) | HunkLine::Remove(s) | HunkLine::Add(s) => s,
                    };
                    if s.ends_with('\n') {
                        s.pop();
                    }
                }
            }
            _ => return Err(PatchError::StrayLine(raw.to_string())),
        }
    }

    Ok(hunks)
}

fn split_lines(doc: &str) -> Vec<&str> {
    doc.split_inclusive('\n').collect()
}

fn matches_at(lines: &[&str], pos: usize, old_side: &[&str]) -> bool {
    pos + old_side.len() <= lines.len()
        && lines[pos..pos + old_side.len()]
            .iter()
            .zip(old_side)
            .all(|(a, b)| a == b)
}

/// Place `old_side` at the expected index, or at the nearest index where it
/// matches. Pure insertions (empty old side) always place at the clamped
/// expected index.
fn find_position(lines: &[&str], old_side: &[&str], expected: i64) -> Option<usize> {
    if old_side.is_empty() {
        return Some(expected.clamp(0, lines.len() as i64) as usize);
    }
    let last = lines.len().saturating_sub(old_side.len()) as i64;
    let expected = expected.clamp(0, last.max(0));

    if matches_at(lines, expected as usize, old_side) {
        return Some(expected as usize);
    }
    for delta in 1..=last.max(0) {
        for candidate in [expected - delta, expected + delta] {
            if candidate >= 0 && candidate <= last && matches_at(lines, candidate as usize, old_side)
            {
                return Some(candidate as usize);
            }
        }
    }
    None
}

/// Apply a patch hunk by hunk. A hunk that cannot be placed is skipped and
/// `ok` comes back false; the remaining hunks still apply.
pub fn apply_patch(patch: &str, doc: &str) -> PatchOutcome {
    let hunks = match parse_patch(patch) {
        Ok(hunks) => hunks,
        Err(_) => {
            return PatchOutcome {
                result: doc.to_string(),
                ok: false,
                hunks_total: 0,
                hunks_applied: 0,
            }
        }
    };

    if hunks.is_empty() {
        return PatchOutcome {
            result: doc.to_string(),
            ok: true,
            hunks_total: 0,
            hunks_applied: 0,
        };
    }

    let mut lines: Vec<String> = split_lines(doc).into_iter().map(String::from).collect();
    let mut drift: i64 = 0;
    let mut applied = 0usize;

    for hunk in &hunks {
        let old_side = hunk.old_side();
        let new_side = hunk.new_side();

        // Header positions are 1-based; a zero-count old range names the
        // line *before* the insertion point.
        let expected = if hunk.old_count == 0 {
            hunk.old_start as i64 + drift
        } else {
            hunk.old_start as i64 - 1 + drift
        };

        let borrowed: Vec<&str> = lines.iter().map(String::as_str).collect();
        if let Some(pos) = find_position(&borrowed, &old_side, expected) {
            let replacement: Vec<String> = new_side.iter().map(|s| s.to_string()).collect();
            lines.splice(pos..pos + old_side.len(), replacement);
            drift += new_side.len() as i64 - old_side.len() as i64;
            applied += 1;
        }
    }

    PatchOutcome {
        result: lines.concat(),
        ok: applied == hunks.len(),
        hunks_total: hunks.len(),
        hunks_applied: applied,
    }
}

fn fmt_range(start: u64, count: u64) -> String {
    if count == 1 {
        start.to_string()
    } else {
        format!("{start},{count}")
    }
}

fn render_line(out: &mut String, sign: char, content: &str) {
    out.push(sign);
    out.push_str(content);
    if !content.ends_with('\n') {
        out.push('\n');
        out.push_str("\\ No newline at end of file\n");
    }
}

/// True inverse: swaps old/new ranges and flips additions with removals, so
/// applying the inverse to the patched text restores the original.
pub fn invert_patch(patch: &str) -> Result<String, PatchError> {
    let hunks = parse_patch(patch)?;
    let mut out = String::new();

    for hunk in &hunks {
        out.push_str(&format!(
            "@@ -{} +{} @@\n",
            fmt_range(hunk.new_start, hunk.new_count),
            fmt_range(hunk.old_start, hunk.old_count),
        ));
        for line in &hunk.lines {
            match line {
                HunkLine::Context(s) => render_line(&mut out, ' ', s),
                HunkLine::Remove(s) => render_line(&mut out, '+', s),
                HunkLine::Add(s) => render_line(&mut out, '-', s),
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATCH: &str = "@@ -1,3 +1,3 @@\n line1\n-line2\n+LINE2\n line3\n";

    #[test]
    fn parses_header_and_lines() {
        let hunks = parse_patch(PATCH).unwrap();
        assert_eq!(hunks.len(), 1);
        let h = &hunks[0];
        assert_eq!((h.old_start, h.old_count, h.new_start, h.new_count), (1, 3, 1, 3));
        assert_eq!(h.lines.len(), 4);
        assert_eq!(h.old_side(), vec!["line1\n", "line2\n", "line3\n"]);
        assert_eq!(h.new_side(), vec!["line1\n", "LINE2\n", "line3\n"]);
    }

    #[test]
    fn applies_simple_replace() {
        let outcome = apply_patch(PATCH, "line1\nline2\nline3\n");
        assert!(outcome.ok);
        assert_eq!(outcome.result, "line1\nLINE2\nline3\n");
        assert_eq!(outcome.hunks_applied, 1);
    }

    #[test]
    fn applies_at_shifted_offset() {
        // Two extra lines prepended; the hunk still matches further down.
        let doc = "extra0\nextra1\nline1\nline2\nline3\n";
        let outcome = apply_patch(PATCH, doc);
        assert!(outcome.ok);
        assert_eq!(outcome.result, "extra0\nextra1\nline1\nLINE2\nline3\n");
    }

    #[test]
    fn unplaceable_hunk_is_skipped() {
        let outcome = apply_patch(PATCH, "completely\ndifferent\ncontent\n");
        assert!(!outcome.ok);
        assert_eq!(outcome.hunks_applied, 0);
        assert_eq!(outcome.result, "completely\ndifferent\ncontent\n");
    }

    #[test]
    fn partial_apply_keeps_good_hunks() {
        let patch = "@@ -1,1 +1,1 @@\n-a\n+A\n@@ -5,1 +5,1 @@\n-e\n+E\n";
        // Second hunk's target line was changed out from under the patch.
        let doc = "a\nb\nc\nd\nX\n";
        let outcome = apply_patch(patch, doc);
        assert!(!outcome.ok);
        assert_eq!(outcome.hunks_applied, 1);
        assert_eq!(outcome.result, "A\nb\nc\nd\nX\n");
    }

    #[test]
    fn pure_insertion_into_empty_doc() {
        let patch = "@@ -0,0 +1,2 @@\n+first\n+second\n";
        let outcome = apply_patch(patch, "");
        assert!(outcome.ok);
        assert_eq!(outcome.result, "first\nsecond\n");
    }

    #[test]
    fn missing_newline_marker_round_trips() {
        let patch = "@@ -1,2 +1,2 @@\n line1\n-line2\n+line2!\n\\ No newline at end of file\n";
        let outcome = apply_patch(patch, "line1\nline2\n");
        assert!(outcome.ok);
        assert_eq!(outcome.result, "line1\nline2!");
    }

    #[test]
    fn empty_patch_is_clean_noop() {
        let outcome = apply_patch("", "anything\n");
        assert!(outcome.ok);
        assert_eq!(outcome.result, "anything\n");
        assert_eq!(outcome.hunks_total, 0);
    }

    #[test]
    fn invert_swaps_ranges_and_signs() {
        let inverse = invert_patch(PATCH).unwrap();
        let outcome = apply_patch(&inverse, "line1\nLINE2\nline3\n");
        assert!(outcome.ok);
        assert_eq!(outcome.result, "line1\nline2\nline3\n");
    }

    #[test]
    fn invert_handles_insertions_and_deletions() {
        let patch = "@@ -2,1 +2,3 @@\n ctx\n+added1\n+added2\n";
        let inverse = invert_patch(patch).unwrap();
        let outcome = apply_patch(&inverse, "top\nctx\nadded1\nadded2\n");
        assert!(outcome.ok);
        assert_eq!(outcome.result, "top\nctx\n");
    }

    #[test]
    fn malformed_header_is_an_error() {
        assert!(parse_patch("@@ nonsense @@\n").is_err());
    }

    #[test]
    fn removed_lines_starting_with_dashes_are_not_headers() {
        let patch = "@@ -1,2 +1,1 @@\n ctx\n--- a toml comment\n";
        let outcome = apply_patch(patch, "ctx\n-- a toml comment\n");
        assert!(outcome.ok);
        assert_eq!(outcome.result, "ctx\n");
    }
}
