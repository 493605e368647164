//! "Did you mean" suggestions for mistyped server and tool names

/// Largest edit distance that still produces a suggestion
pub const MAX_SUGGESTION_DISTANCE: usize = 3;

/// Case-insensitive Levenshtein distance over Unicode scalar values.
///
/// Fills the full `(len1 + 1) x (len2 + 1)` table.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    let (m, n) = (a.len(), b.len());

    let mut table = vec![vec![0usize; n + 1]; m + 1];
    for (i, row) in table.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=n {
        table[0][j] = j;
    }

    for i in 1..=m {
        for j in 1..=n {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            table[i][j] = (table[i - 1][j] + 1)
                .min(table[i][j - 1] + 1)
                .min(table[i - 1][j - 1] + cost);
        }
    }

    table[m][n]
}

/// Closest candidate to `target`, if it lies within [`MAX_SUGGESTION_DISTANCE`].
///
/// Ties on distance go to the lexicographically smaller name.
pub fn suggest<'a, I>(target: &str, candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut ranked: Vec<(usize, &str)> = candidates
        .into_iter()
        .map(|c| (levenshtein(target, c), c))
        .collect();
    ranked.sort();

    ranked
        .into_iter()
        .next()
        .filter(|(distance, _)| *distance <= MAX_SUGGESTION_DISTANCE)
        .map(|(_, name)| name)
}

/// Render the optional " Did you mean ...?" tail of a diagnostic.
pub fn did_you_mean(suggestion: Option<&str>) -> String {
    match suggestion {
        Some(name) => format!(" Did you mean '{}'?", name),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein_identities() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", ""), 3);
        for word in ["read", "write_file", "ünïcödé", "a.b.c"] {
            assert_eq!(levenshtein(word, word), 0);
        }
    }

    #[test]
    fn test_levenshtein_is_symmetric() {
        let pairs = [("read", "reed"), ("list_dir", "ls"), ("git", "fs"), ("héllo", "hello")];
        for (a, b) in pairs {
            assert_eq!(levenshtein(a, b), levenshtein(b, a), "{a} vs {b}");
        }
    }

    #[test]
    fn test_levenshtein_ignores_case() {
        assert_eq!(levenshtein("ReadFile", "readfile"), 0);
    }

    #[test]
    fn test_levenshtein_counts_scalar_values() {
        assert_eq!(levenshtein("café", "cafe"), 1);
    }

    #[test]
    fn test_suggest_picks_closest_within_limit() {
        let tools = ["read", "write", "list_directory"];
        assert_eq!(suggest("raed", tools), Some("read"));
        assert_eq!(suggest("wirte", tools), Some("write"));
        assert_eq!(suggest("completely_different", tools), None);
    }

    #[test]
    fn test_suggest_tie_breaks_by_name() {
        assert_eq!(suggest("bat", ["cat", "at", "hat"]), Some("at"));
        assert_eq!(suggest("xy", ["xb", "xa"]), Some("xa"));
    }

    #[test]
    fn test_suggest_empty_candidates() {
        assert_eq!(suggest("fs", std::iter::empty()), None);
        assert_eq!(did_you_mean(None), "");
        assert_eq!(did_you_mean(Some("fs")), " Did you mean 'fs'?");
    }
}
