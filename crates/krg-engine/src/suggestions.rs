//! Fuzzy "did you mean" hints for compile errors
//!
//! Uses Levenshtein distance to point at the closest declared resource id or
//! schema field when a reference names something that does not exist.

/// Maximum Levenshtein distance to consider for suggestions
const MAX_SUGGESTION_DISTANCE: usize = 3;

/// Suggestion with its distance to the input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suggestion {
    pub text: String,
    /// Levenshtein distance (lower = better match)
    pub distance: usize,
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    strsim::levenshtein(a, b)
}

/// Closest candidates, best first
pub fn find_closest_matches(input: &str, candidates: &[&str], max_results: usize) -> Vec<Suggestion> {
    let mut suggestions: Vec<Suggestion> = candidates
        .iter()
        .filter_map(|&candidate| {
            let distance = levenshtein(input, candidate);
            (distance <= MAX_SUGGESTION_DISTANCE && distance > 0).then(|| Suggestion {
                text: candidate.to_string(),
                distance,
            })
        })
        .collect();

    // Stable sort keeps declaration order among equal distances
    suggestions.sort_by_key(|s| s.distance);
    suggestions.truncate(max_results);
    suggestions
}

/// Hint for a reference to an undeclared resource
pub fn suggest_resource(target: &str, declared: &[&str]) -> Option<String> {
    let matches = find_closest_matches(target, declared, 2);
    if !matches.is_empty() {
        let names: Vec<String> = matches.iter().map(|s| format!("`{}`", s.text)).collect();
        return Some(format!("Did you mean {}?", names.join(" or ")));
    }
    if declared.is_empty() {
        None
    } else {
        Some(format!("Declared resources: {}", declared.join(", ")))
    }
}

/// Hint for a reference to a schema field that does not exist
pub fn suggest_field(parent: &str, attempted: &str, available: &[&str]) -> Option<String> {
    if available.is_empty() {
        return None;
    }
    let matches = find_closest_matches(attempted, available, 3);
    if !matches.is_empty() {
        let names: Vec<String> = matches
            .iter()
            .map(|s| format!("`{}.{}`", parent, s.text))
            .collect();
        Some(format!(
            "Did you mean {}? Available: {}",
            names.join(" or "),
            available.join(", ")
        ))
    } else {
        Some(format!(
            "Field `{}` is not declared in `{}`. Available fields: {}",
            attempted,
            parent,
            available.join(", ")
        ))
    }
}
