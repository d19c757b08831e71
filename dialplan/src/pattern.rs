//! Extension pattern matching.
//!
//! A pattern without a leading `_` is a literal. A `_` pattern is scanned one
//! character class at a time:
//!
//! - `X` any digit, `Z` 1-9, `N` 2-9
//! - `[a-c7]` explicit set with ranges
//! - `.` one or more remaining characters, stretchable
//! - `!` zero or more remaining characters, possible
//! - space and `-` are ignored on both sides
//! - anything else matches itself, ignoring case

use strum_macros::Display;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MatchGrade {
    /// Destination and pattern end together.
    Exact,
    /// The pattern is used up but destination characters remain.
    Overlength,
    /// The destination is a proper prefix of what the pattern wants.
    Incomplete,
    /// Hit a `.`, the destination matches and may keep growing.
    Stretchable,
    /// Hit a `!`, the destination matches now and may keep growing.
    Possible,
    Failure,
}

/// What the resolver is trying to find out about a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MatchAction {
    Exists,
    CanMatch,
    MatchMore,
    FindLabel,
    Exec,
}

impl MatchAction {
    pub fn accepts(&self, grade: MatchGrade) -> bool {
        use MatchGrade::*;
        match self {
            MatchAction::Exists | MatchAction::Exec | MatchAction::FindLabel => {
                matches!(grade, Exact | Stretchable | Possible)
            }
            MatchAction::CanMatch => {
                matches!(grade, Exact | Stretchable | Possible | Incomplete)
            }
            MatchAction::MatchMore => {
                matches!(grade, Stretchable | Incomplete | Possible)
            }
        }
    }

    /// `!` hits are only taken for match-more when nothing better turns up.
    pub fn defers(&self, grade: MatchGrade) -> bool {
        *self == MatchAction::MatchMore && grade == MatchGrade::Possible
    }
}

pub fn is_pattern(pattern: &str) -> bool {
    pattern.starts_with('_')
}

pub fn match_extension(destination: &str, pattern: &str) -> MatchGrade {
    match pattern.strip_prefix('_') {
        Some(pattern) => match_pattern(destination, pattern),
        None => match_literal(destination, pattern),
    }
}

/// Whether `destination` matches `pattern` outright, the test used for
/// caller id filters and ignore patterns.
pub fn matches(destination: &str, pattern: &str) -> bool {
    MatchAction::Exists.accepts(match_extension(destination, pattern))
}

fn match_literal(destination: &str, pattern: &str) -> MatchGrade {
    let mut dst = destination.chars();
    let mut pat = pattern.chars();
    loop {
        match (dst.next(), pat.next()) {
            (None, None) => return MatchGrade::Exact,
            (None, Some(_)) => return MatchGrade::Incomplete,
            (Some(_), None) => return MatchGrade::Overlength,
            (Some(d), Some(p)) if d == p => continue,
            _ => return MatchGrade::Failure,
        }
    }
}

fn is_ignored(c: char) -> bool {
    c == ' ' || c == '-'
}

fn match_pattern(destination: &str, pattern: &str) -> MatchGrade {
    let dst: Vec<char> = destination.chars().collect();
    let pat: Vec<char> = pattern.chars().collect();
    let (mut d, mut p) = (0, 0);

    loop {
        while d < dst.len() && is_ignored(dst[d]) {
            d += 1;
        }
        while p < pat.len() && is_ignored(pat[p]) {
            p += 1;
        }

        if p >= pat.len() {
            return if d >= dst.len() {
                MatchGrade::Exact
            } else {
                MatchGrade::Overlength
            };
        }

        let class = pat[p].to_ascii_uppercase();
        if d >= dst.len() {
            return if class == '!' {
                MatchGrade::Possible
            } else {
                MatchGrade::Incomplete
            };
        }

        let c = dst[d];
        match class {
            '.' => return MatchGrade::Stretchable,
            '!' => return MatchGrade::Possible,
            'X' if c.is_ascii_digit() => {}
            'Z' if ('1'..='9').contains(&c) => {}
            'N' if ('2'..='9').contains(&c) => {}
            'X' | 'Z' | 'N' => return MatchGrade::Failure,
            '[' => {
                let Some(close) = pat[p..].iter().position(|&ch| ch == ']') else {
                    warn!("wrong usage of [] in extension pattern _{pattern}");
                    return MatchGrade::Failure;
                };
                let set = &pat[p + 1..p + close];
                if !set_contains(set, c) {
                    return MatchGrade::Failure;
                }
                p += close;
            }
            _ => {
                if !c.eq_ignore_ascii_case(&pat[p]) {
                    return MatchGrade::Failure;
                }
            }
        }
        d += 1;
        p += 1;
    }
}

fn set_contains(set: &[char], c: char) -> bool {
    let mut i = 0;
    while i < set.len() {
        if i + 2 < set.len() && set[i + 1] == '-' {
            if set[i] <= c && c <= set[i + 2] {
                return true;
            }
            i += 3;
        } else {
            if set[i] == c {
                return true;
            }
            i += 1;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use MatchGrade::*;

    #[test]
    fn literal_grades() {
        assert_eq!(Exact, match_extension("555", "555"));
        assert_eq!(Incomplete, match_extension("55", "555"));
        assert_eq!(Overlength, match_extension("5551", "555"));
        assert_eq!(Failure, match_extension("556", "555"));
        assert_eq!(Exact, match_extension("s", "s"));
    }

    #[test]
    fn digit_classes() {
        assert_eq!(Exact, match_extension("123", "_XXX"));
        assert_eq!(Incomplete, match_extension("12", "_XXX"));
        assert_eq!(Overlength, match_extension("1234", "_XXX"));
        assert_eq!(Failure, match_extension("12a", "_XXX"));
        assert_eq!(Exact, match_extension("123", "_ZXX"));
        assert_eq!(Failure, match_extension("023", "_ZXX"));
        assert_eq!(Failure, match_extension("123", "_NXX"));
        assert_eq!(Exact, match_extension("223", "_nxx"));
    }

    #[test]
    fn stretchable_and_possible() {
        assert_eq!(Stretchable, match_extension("91", "_9."));
        assert_eq!(Stretchable, match_extension("9123456", "_9."));
        assert_eq!(Incomplete, match_extension("9", "_9."));
        assert_eq!(Possible, match_extension("9", "_9!"));
        assert_eq!(Possible, match_extension("912", "_9!"));
        assert_eq!(Failure, match_extension("81", "_9."));
    }

    #[test]
    fn sets_and_ranges() {
        assert_eq!(Exact, match_extension("15", "_1[2-57]"));
        assert_eq!(Exact, match_extension("17", "_1[2-57]"));
        assert_eq!(Failure, match_extension("16", "_1[2-57]"));
        assert_eq!(Failure, match_extension("12", "_1[2-5"));
    }

    #[test]
    fn ignores_separators_and_case() {
        assert_eq!(Exact, match_extension("555-1234", "_555XXXX"));
        assert_eq!(Exact, match_extension("5551234", "_555-XXXX"));
        assert_eq!(Exact, match_extension("abc", "_ABC"));
    }

    #[test]
    fn action_acceptance() {
        assert!(MatchAction::Exists.accepts(Exact));
        assert!(!MatchAction::Exists.accepts(Incomplete));
        assert!(MatchAction::CanMatch.accepts(Incomplete));
        assert!(!MatchAction::CanMatch.accepts(Overlength));
        assert!(!MatchAction::MatchMore.accepts(Exact));
        assert!(MatchAction::MatchMore.accepts(Stretchable));
        assert!(MatchAction::MatchMore.defers(Possible));
        assert!(!MatchAction::Exists.defers(Possible));
    }

    #[test]
    fn plain_match() {
        assert!(matches("5551234", "_555XXXX"));
        assert!(!matches("555", "_555XXXX"));
    }
}
