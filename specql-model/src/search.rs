//! Fuzzy name matching for lookup diagnostics

use strsim::levenshtein;

/// Default edit distance used when suggesting entity, field and action names.
pub const DEFAULT_MAX_DISTANCE: usize = 3;

/// A fuzzy match suggestion with candidate name and edit distance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suggestion {
    pub candidate: String,
    pub distance: usize,
}

/// Suggest similar names from a list of candidates using fuzzy matching.
///
/// Returns candidates sorted by edit distance (closest first), ties broken by
/// name so the order never depends on the caller's iteration order.
/// Exact matches are excluded. Case-insensitive matches get distance 0,
/// substring matches get distance 1, and Levenshtein matches use their
/// actual edit distance.
pub fn suggest_similar(name: &str, candidates: &[&str], max_distance: usize) -> Vec<Suggestion> {
    let name_lower = name.to_lowercase();
    let mut suggestions: Vec<Suggestion> = candidates
        .iter()
        .filter_map(|&candidate| {
            if candidate == name {
                return None;
            }
            let candidate_lower = candidate.to_lowercase();
            if candidate_lower == name_lower {
                return Some(Suggestion {
                    candidate: candidate.to_string(),
                    distance: 0,
                });
            }
            if !name_lower.is_empty()
                && (candidate_lower.contains(&name_lower) || name_lower.contains(&candidate_lower))
            {
                return Some(Suggestion {
                    candidate: candidate.to_string(),
                    distance: 1,
                });
            }
            let dist = levenshtein(name, candidate);
            (dist <= max_distance).then(|| Suggestion {
                candidate: candidate.to_string(),
                distance: dist,
            })
        })
        .collect();
    suggestions.sort_by(|a, b| {
        a.distance
            .cmp(&b.distance)
            .then_with(|| a.candidate.cmp(&b.candidate))
    });
    suggestions.dedup_by(|a, b| a.candidate == b.candidate);
    suggestions
}

/// Candidate names only, closest first.
pub fn suggestion_names(name: &str, candidates: &[&str]) -> Vec<String> {
    suggest_similar(name, candidates, DEFAULT_MAX_DISTANCE)
        .into_iter()
        .map(|s| s.candidate)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fuzzy_suggestions() {
        let candidates = ["email", "phone", "company"];
        let suggestions = suggest_similar("emial", &candidates, 3);
        assert!(!suggestions.is_empty());
        assert_eq!(suggestions[0].candidate, "email");
    }

    #[test]
    fn test_fuzzy_case_insensitive() {
        let candidates = ["Contact", "Company"];
        let suggestions = suggest_similar("contact", &candidates, 3);
        assert_eq!(suggestions[0].candidate, "Contact");
        assert_eq!(suggestions[0].distance, 0);
    }

    #[test]
    fn test_fuzzy_no_exact_match() {
        let candidates = ["status"];
        let suggestions = suggest_similar("status", &candidates, 3);
        assert!(suggestions.is_empty(), "exact matches should be excluded");
    }

    #[test]
    fn test_fuzzy_substring() {
        let candidates = ["qualify_lead", "close"];
        let suggestions = suggest_similar("qualify", &candidates, 3);
        assert_eq!(suggestions[0].candidate, "qualify_lead");
    }

    #[test]
    fn test_closest_candidate_first() {
        let candidates = ["stage", "state"];
        let names = suggestion_names("stat", &candidates);
        assert_eq!(names, vec!["state".to_string(), "stage".to_string()]);
    }
}
