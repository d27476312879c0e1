//! Subject wildcard matching and stream subject-set normalisation.
//!
//! `*` matches exactly one token; `>` matches one-or-more trailing tokens and
//! may only appear as the final token of a filter.

pub fn tokens(subject: &str) -> Vec<&str> {
    subject.split('.').collect()
}

/// Does `subject` match `filter`, where `filter` may use `*`/`>` wildcards?
pub fn matches(filter: &str, subject: &str) -> bool {
    let filter_tokens = tokens(filter);
    let subject_tokens = tokens(subject);
    match_tokens(&filter_tokens, &subject_tokens)
}

fn match_tokens(filter: &[&str], subject: &[&str]) -> bool {
    match filter.first() {
        None => subject.is_empty(),
        Some(&">") => !subject.is_empty(),
        Some(&"*") => {
            !subject.is_empty() && match_tokens(&filter[1..], &subject[1..])
        }
        Some(&token) => {
            !subject.is_empty() && subject[0] == token && match_tokens(&filter[1..], &subject[1..])
        }
    }
}

/// Does `covering` (e.g. `"tspi.>"`) subsume `candidate` by token-prefix match?
fn covers(covering: &str, candidate: &str) -> bool {
    if !covering.ends_with(".>") {
        return false;
    }
    let prefix = &covering[..covering.len() - 2];
    candidate == prefix || candidate.starts_with(&format!("{prefix}."))
}

/// Drops any subject in `subjects` that is covered by a sibling `<prefix>.>`
/// entry in the same list. The result is always a subset of the input and
/// preserves the input's relative order.
pub fn normalise_subjects(subjects: &[String]) -> Vec<String> {
    subjects
        .iter()
        .filter(|candidate| {
            !subjects
                .iter()
                .any(|other| other != *candidate && covers(other, candidate))
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_token_wildcard() {
        assert!(matches("tspi.*.501", "tspi.geocentric.501"));
        assert!(!matches("tspi.*.501", "tspi.geocentric.502"));
        assert!(!matches("tspi.*.501", "tspi.a.b.501"));
    }

    #[test]
    fn trailing_wildcard() {
        assert!(matches("tspi.>", "tspi.geocentric.501"));
        assert!(matches("tspi.>", "tspi.cmd.display.units"));
        assert!(!matches("tspi.>", "tags.broadcast"));
    }

    #[test]
    fn normalisation_is_subset_and_drops_covered() {
        let subjects = vec![
            "tspi.>".to_string(),
            "tspi.geocentric.501".to_string(),
            "tags.broadcast".to_string(),
        ];
        let normalised = normalise_subjects(&subjects);
        assert_eq!(normalised, vec!["tspi.>".to_string(), "tags.broadcast".to_string()]);
        for subject in &normalised {
            assert!(subjects.contains(subject));
        }
    }

    #[test]
    fn normalisation_is_noop_without_a_covering_sibling() {
        let subjects = vec!["tspi.geocentric.501".to_string(), "tags.broadcast".to_string()];
        assert_eq!(normalise_subjects(&subjects), subjects);
    }
}
