//! Anchored regex matching for channel model filters. Patterns are treated
//! as full-string matches; inline modifier groups (`(?i)` etc.) at the
//! start of the pattern keep working because the pattern is wrapped in a
//! non-capturing group before anchoring.

use regex::Regex;

/// Full-string match: equivalent to `^(?:pattern)$`.
pub fn match_string(pattern: &str, value: &str) -> Result<bool, regex::Error> {
    let anchored = format!("^(?:{pattern})$");
    Ok(Regex::new(&anchored)?.is_match(value))
}

/// Items fully matching `pattern`. An empty pattern selects nothing.
pub fn filter<'a, I>(items: I, pattern: &str) -> Result<Vec<String>, regex::Error>
where
    I: IntoIterator<Item = &'a str>,
{
    if pattern.is_empty() {
        return Ok(Vec::new());
    }
    let anchored = format!("^(?:{pattern})$");
    let regex = Regex::new(&anchored)?;
    Ok(items
        .into_iter()
        .filter(|item| regex.is_match(item))
        .map(str::to_owned)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_match_only() {
        assert!(match_string("gpt-4.*", "gpt-4o-mini").unwrap());
        assert!(!match_string("gpt-4", "gpt-4o-mini").unwrap());
        assert!(!match_string("4o", "gpt-4o-mini").unwrap());
    }

    #[test]
    fn test_modifier_groups_preserved() {
        assert!(match_string("(?i)CLAUDE-.*", "claude-sonnet-4-0").unwrap());
    }

    #[test]
    fn test_filter_empty_pattern_returns_empty() {
        let items = ["gpt-4o", "claude-3-5-haiku"];
        assert_eq!(filter(items, "").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_filter_matches() {
        let items = ["gpt-4o", "gpt-4o-mini", "o3-mini"];
        assert_eq!(
            filter(items, "gpt-4o.*").unwrap(),
            vec!["gpt-4o".to_owned(), "gpt-4o-mini".to_owned()]
        );
    }

    #[test]
    fn test_invalid_pattern_errors() {
        assert!(match_string("(unclosed", "x").is_err());
    }
}
