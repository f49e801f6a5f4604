use std::collections::HashSet;

/// Default minimum score for a fuzzy catalog match.
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.8;

/// Jaccard similarity between two (title, artist) pairs.
///
/// Each side is reduced to the set of lowercase whitespace-separated tokens of
/// `"{title} {artist}"`. Returns 0.0 when either side has no tokens.
pub fn similarity(a: (&str, &str), b: (&str, &str)) -> f64 {
    let left = token_set(a);
    let right = token_set(b);

    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let intersection = left.intersection(&right).count();
    let union = left.union(&right).count();

    intersection as f64 / union as f64
}

fn token_set((title, artist): (&str, &str)) -> HashSet<String> {
    title
        .split_whitespace()
        .chain(artist.split_whitespace())
        .map(str::to_lowercase)
        .collect()
}

/// Whether a catalog track is worth scoring against the given needles.
///
/// True when the title contains `title` or the artist contains `artist`,
/// folding case with the same Unicode rules the scorer uses. Blank or absent
/// needles never match.
pub fn is_candidate((title, artist): (&str, &str), needle_title: Option<&str>, needle_artist: Option<&str>) -> bool {
    let contains = |hay: &str, needle: Option<&str>| {
        needle
            .filter(|n| !n.is_empty())
            .is_some_and(|n| hay.to_lowercase().contains(&n.to_lowercase()))
    };
    contains(title, needle_title) || contains(artist, needle_artist)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_folds_unicode_case() {
        assert!(is_candidate(("Été", "Björk"), Some("ÉTÉ"), None));
        assert!(is_candidate(("Été", "Björk"), None, Some("BJÖRK")));
        assert!(is_candidate(("Midnight Drive", "Jay Rock"), Some("drive"), None));
        assert!(!is_candidate(("Midnight Drive", "Jay Rock"), Some(""), Some("")));
        assert!(!is_candidate(("Midnight Drive", "Jay Rock"), None, None));
        assert!(!is_candidate(("Midnight Drive", "Jay Rock"), Some("Dawn"), Some("Kendrick")));
    }

    #[test]
    fn test_identical_is_one() {
        let a = ("Midnight Drive", "Jay Rock");
        assert!((similarity(a, a) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_case_and_spacing_ignored() {
        let sim = similarity(("MIDNIGHT   DRIVE", "jay rock"), ("Midnight Drive", "Jay Rock"));
        assert!((sim - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_side_is_zero() {
        assert_eq!(similarity(("", ""), ("Song", "Artist")), 0.0);
        assert_eq!(similarity(("Song", "Artist"), ("  ", "\t")), 0.0);
        assert_eq!(similarity(("", ""), ("", "")), 0.0);
    }

    #[test]
    fn test_symmetric() {
        let pairs = [
            (("Midnight Drive", "Jay Rock"), ("Midnight Drive (Remix)", "Jay Rock")),
            (("Vice City", "Jay Rock"), ("Vice", "City Rock Jay")),
            (("Song A", "Artist X"), ("Song B", "Artist Y")),
        ];
        for (a, b) in pairs {
            assert_eq!(similarity(a, b), similarity(b, a));
        }
    }

    #[test]
    fn test_remix_sits_on_threshold() {
        // {midnight, drive, jay, rock} vs {midnight, drive, (remix), jay, rock}
        let sim = similarity(("Midnight Drive", "Jay Rock"), ("Midnight Drive (Remix)", "Jay Rock"));
        assert_eq!(sim, 4.0 / 5.0);
        assert!(sim >= DEFAULT_FUZZY_THRESHOLD);
    }

    #[test]
    fn test_duplicate_tokens_counted_once() {
        let sim = similarity(("la la la", "band"), ("la", "band"));
        assert!((sim - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_disjoint_is_zero() {
        assert_eq!(similarity(("Unknown Song", "Nobody"), ("Vice City", "Jay Rock")), 0.0);
    }
}
