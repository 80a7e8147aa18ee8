//! Token-level dissimilarity between proposal bodies.
//!
//! Δ drives revision pricing: `RevisionCost = round(ProposalSelfStake × Δ)`.
//! The measure is the token-level diff ratio
//! `changed_tokens / max(len(old), len(new))`, computed from the longest
//! common subsequence over whitespace tokens. Properties relied on by the
//! revision path:
//!
//! - Δ(x, x) = 0
//! - Δ(x, y) = 1 when the texts share no common token subsequence
//! - deterministic, and symmetric in its inputs

/// Dissimilarity in [0, 1] between two texts.
pub fn dissimilarity(old: &str, new: &str) -> f64 {
    let old_tokens: Vec<&str> = old.split_whitespace().collect();
    let new_tokens: Vec<&str> = new.split_whitespace().collect();

    let longest = old_tokens.len().max(new_tokens.len());
    if longest == 0 {
        return 0.0;
    }

    let common = lcs_len(&old_tokens, &new_tokens);
    (longest - common) as f64 / longest as f64
}

/// Longest common subsequence length, single-row DP.
fn lcs_len(a: &[&str], b: &[&str]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut row = vec![0usize; b.len() + 1];
    for &ta in a {
        let mut diag = 0;
        for (j, &tb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = if ta == tb {
                diag + 1
            } else {
                above.max(row[j])
            };
            diag = above;
        }
    }
    row[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_is_zero() {
        assert_eq!(dissimilarity("expand the harbor", "expand the harbor"), 0.0);
    }

    #[test]
    fn test_disjoint_is_one() {
        assert_eq!(dissimilarity("alpha beta", "gamma delta epsilon"), 1.0);
    }

    #[test]
    fn test_empty_both_is_zero() {
        assert_eq!(dissimilarity("", ""), 0.0);
    }

    #[test]
    fn test_empty_versus_text_is_one() {
        assert_eq!(dissimilarity("", "some new text"), 1.0);
        assert_eq!(dissimilarity("some old text", ""), 1.0);
    }

    #[test]
    fn test_partial_change_ratio() {
        // 4 of 5 tokens survive: delta = 1/5
        let d = dissimilarity("a b c d e", "a b c d x");
        assert!((d - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_symmetric() {
        let x = "one two three four";
        let y = "one five three six seven";
        assert_eq!(dissimilarity(x, y), dissimilarity(y, x));
    }

    #[test]
    fn test_reorder_is_not_full_change() {
        // Shared tokens in a different order keep a common subsequence
        let d = dissimilarity("a b", "b a");
        assert!(d < 1.0);
        assert!((d - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_growth_counts_against_longer_text() {
        // 2 common tokens, new text has 4: delta = (4 - 2) / 4
        let d = dissimilarity("a b", "a b c d");
        assert!((d - 0.5).abs() < 1e-12);
    }
}
