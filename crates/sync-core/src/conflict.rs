/// Decides whether two patches against the same file can both land.
///
/// Overlap is judged purely on new-side line ranges scraped from hunk
/// headers; the relay never merges content.
use serde::{Deserialize, Serialize};

/// Closed-inclusive range of new-side lines touched by a hunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: u64,
    pub end: u64,
}

impl LineRange {
    /// A zero-hunk patch claims the whole file.
    pub fn whole_file() -> Self {
        Self {
            start: 0,
            end: u64::MAX,
        }
    }

    pub fn intersects(&self, other: &LineRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Extract `{start=c, end=c+d-1}` from every `@@ -a,b +c,d @@` header.
/// `d` defaults to 1 when absent. Malformed headers are skipped.
pub fn new_side_ranges(patch: &str) -> Vec<LineRange> {
    let mut ranges = Vec::new();

    for line in patch.lines() {
        if !line.starts_with("@@") {
            continue;
        }
        let Some(plus) = line.find('+') else {
            continue;
        };
        let rest = &line[plus + 1..];
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != ',')
            .unwrap_or(rest.len());
        let range_spec = &rest[..digits_end];

        let (start, count) = match range_spec.split_once(',') {
            Some((s, c)) => (s.parse::<u64>().ok(), c.parse::<u64>().ok()),
            None => (range_spec.parse::<u64>().ok(), Some(1)),
        };

        if let (Some(start), Some(count)) = (start, count) {
            ranges.push(LineRange {
                start,
                end: start + count.saturating_sub(1),
            });
        }
    }

    ranges
}

/// True when any new-side range of `a` intersects any of `b`.
/// A patch without hunks counts as touching every line.
pub fn patches_overlap(a: &str, b: &str) -> bool {
    let mut ranges_a = new_side_ranges(a);
    let mut ranges_b = new_side_ranges(b);

    if ranges_a.is_empty() {
        ranges_a.push(LineRange::whole_file());
    }
    if ranges_b.is_empty() {
        ranges_b.push(LineRange::whole_file());
    }

    ranges_a
        .iter()
        .any(|ra| ranges_b.iter().any(|rb| ra.intersects(rb)))
}

/// `<base>.conflict-<ts>.<ext>`, ext defaulting to `ts`.
pub fn conflict_file_name(file: &str, timestamp_ms: i64) -> String {
    let (dir, name) = match file.rfind('/') {
        Some(i) => (&file[..=i], &file[i + 1..]),
        None => ("", file),
    };
    let (base, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i + 1..]),
        _ => (name, "ts"),
    };
    format!("{dir}{base}.conflict-{timestamp_ms}.{ext}")
}
