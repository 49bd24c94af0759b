/// Text patches and content fingerprints.
///
/// Patches are unified-format hunks. Generation rides on `similar`;
/// application and inversion are implemented here so that partially
/// applicable patches degrade per hunk instead of failing whole.
use sha2::{Digest, Sha256};
use similar::TextDiff;

mod patch;
pub use patch::{apply_patch, invert_patch, parse_patch, Hunk, HunkLine, PatchError, PatchOutcome};

/// Produce a unified patch transforming `old` into `new`.
/// Empty when the texts are identical.
pub fn make_patch(old: &str, new: &str) -> String {
    let diff = TextDiff::from_lines(old, new);
    diff.unified_diff().context_radius(3).to_string()
}

/// First 64 bits of SHA-256 over the UTF-8 bytes, as 16 lowercase hex chars.
/// Opaque version identifier; not a security boundary.
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// Filters no-op saves.
pub fn has_changed(a: &str, b: &str) -> bool {
    fingerprint(a) != fingerprint(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_truncated_sha256() {
        assert_eq!(fingerprint(""), "e3b0c44298fc1c14");
        assert_eq!(fingerprint("hello"), "2cf24dba5fb0a30e");
    }

    #[test]
    fn fingerprint_is_16_hex() {
        let h = fingerprint("some text\n");
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }

    #[test]
    fn has_changed_detects_difference() {
        assert!(!has_changed("a\n", "a\n"));
        assert!(has_changed("a\n", "b\n"));
    }

    #[test]
    fn identical_texts_produce_empty_patch() {
        assert_eq!(make_patch("x\ny\n", "x\ny\n"), "");
    }

    #[test]
    fn patch_round_trip_restores_fingerprint() {
        let a = "line1\nline2\nline3\nline4\nline5\n";
        let b = "line1\nline2 changed\nline3\nline4\nline5\nline6\n";

        let patch = make_patch(a, b);
        let outcome = apply_patch(&patch, a);
        assert!(outcome.ok);
        assert_eq!(fingerprint(&outcome.result), fingerprint(b));
    }

    #[test]
    fn round_trip_without_trailing_newline() {
        let a = "alpha\nbeta";
        let b = "alpha\nbeta\ngamma";

        let patch = make_patch(a, b);
        let outcome = apply_patch(&patch, a);
        assert!(outcome.ok);
        assert_eq!(outcome.result, b);
    }

    #[test]
    fn round_trip_multi_hunk() {
        let a: String = (1..=40).map(|i| format!("line{i}\n")).collect();
        let mut lines: Vec<String> = (1..=40).map(|i| format!("line{i}\n")).collect();
        lines[2] = "changed top\n".to_string();
        lines[35] = "changed bottom\n".to_string();
        let b: String = lines.concat();

        let patch = make_patch(&a, &b);
        assert!(patch.matches("@@").count() >= 4, "expected two hunks: {patch}");

        let outcome = apply_patch(&patch, &a);
        assert!(outcome.ok);
        assert_eq!(outcome.result, b);
    }

    #[test]
    fn inverse_patch_undoes_change() {
        let a = "one\ntwo\nthree\n";
        let b = "one\nTWO\nthree\nfour\n";

        let patch = make_patch(a, b);
        let inverse = invert_patch(&patch).unwrap();
        let outcome = apply_patch(&inverse, b);
        assert!(outcome.ok);
        assert_eq!(outcome.result, a);
    }
}
