//! Glob-style key patterns.

/// Match `key` against a glob pattern.
///
/// Supports:
/// - `*` matches zero or more characters
/// - `?` matches exactly one character
/// - `\\*` and `\\?` match the literal character
pub fn glob_match(key: &str, pattern: &str) -> bool {
    let mut chars = key.chars().peekable();
    let mut pattern_chars = pattern.chars().peekable();
    match_recursive(&mut chars, &mut pattern_chars)
}

fn match_recursive(
    chars: &mut std::iter::Peekable<std::str::Chars>,
    pattern: &mut std::iter::Peekable<std::str::Chars>,
) -> bool {
    loop {
        match (pattern.peek().copied(), chars.peek().copied()) {
            (None, None) => return true,
            (None, Some(_)) => return false,
            (Some('*'), _) => {
                pattern.next();
                if pattern.peek().is_none() {
                    return true;
                }
                loop {
                    let mut pattern_clone = pattern.clone();
                    let mut chars_clone = chars.clone();
                    if match_recursive(&mut chars_clone, &mut pattern_clone) {
                        return true;
                    }
                    if chars.next().is_none() {
                        return false;
                    }
                }
            }
            (Some('?'), Some(_)) => {
                pattern.next();
                chars.next();
            }
            (Some('?'), None) => return false,
            (Some('\\'), _) => {
                pattern.next();
                match (pattern.peek().copied(), chars.peek().copied()) {
                    (Some(p), Some(c)) if p == c => {
                        pattern.next();
                        chars.next();
                    }
                    _ => return false,
                }
            }
            (Some(p), Some(c)) => {
                if p != c {
                    return false;
                }
                pattern.next();
                chars.next();
            }
            (Some(_), None) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_matches_any_suffix() {
        assert!(glob_match("multiorm:query:products:ab12", "multiorm:query:products:*"));
        assert!(!glob_match("multiorm:query:orders:ab12", "multiorm:query:products:*"));
        assert!(glob_match("anything", "*"));
        assert!(glob_match("", "*"));
    }

    #[test]
    fn test_star_in_the_middle() {
        assert!(glob_match("user:42:profile", "user:*:profile"));
        assert!(!glob_match("user:42:settings", "user:*:profile"));
    }

    #[test]
    fn test_question_mark() {
        assert!(glob_match("k1", "k?"));
        assert!(!glob_match("k12", "k?"));
        assert!(!glob_match("k", "k?"));
    }

    #[test]
    fn test_escaped_wildcards() {
        assert!(glob_match("a*b", "a\\*b"));
        assert!(!glob_match("axb", "a\\*b"));
    }

    #[test]
    fn test_exact_match() {
        assert!(glob_match("session", "session"));
        assert!(!glob_match("sessions", "session"));
    }
}
