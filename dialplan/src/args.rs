/// Splits application data into arguments on `,` or `|`.
///
/// Delimiters inside double quotes or parentheses are kept. Quotes are
/// stripped, a backslash keeps the next character literally.
pub fn split_args(data: &str) -> Vec<String> {
    if data.is_empty() {
        return Vec::new();
    }

    let mut args = Vec::new();
    let mut current = String::new();
    let mut parens = 0usize;
    let mut quoted = false;
    let mut chars = data.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => quoted = !quoted,
            '(' if !quoted => {
                parens += 1;
                current.push(c);
            }
            ')' if !quoted => {
                parens = parens.saturating_sub(1);
                current.push(c);
            }
            ',' | '|' if !quoted && parens == 0 => {
                args.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    args.push(current);
    args
}

/// Truthiness of a substituted condition: empty is false, a number is
/// true when non-zero, any other text is true.
pub fn check_condition(condition: &str) -> bool {
    let condition = condition.trim();
    if condition.is_empty() {
        return false;
    }
    match condition.parse::<f64>() {
        Ok(value) => value != 0.0,
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_both_delimiters() {
        assert_eq!(vec!["a", "b", "c"], split_args("a,b|c"));
        assert_eq!(vec!["", "x"], split_args(",x"));
        assert!(split_args("").is_empty());
    }

    #[test]
    fn keeps_nested_and_quoted() {
        assert_eq!(
            vec!["FOO(a,b)=1", "g"],
            split_args("FOO(a,b)=1,g")
        );
        assert_eq!(vec!["a,b", "c"], split_args("\"a,b\",c"));
        assert_eq!(vec!["a,b"], split_args("a\\,b"));
    }

    #[test]
    fn conditions() {
        assert!(!check_condition(""));
        assert!(!check_condition("0"));
        assert!(!check_condition(" 0.0 "));
        assert!(check_condition("1"));
        assert!(check_condition("yes"));
    }
}
