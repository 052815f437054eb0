//! Regular-expression patterns shared by `$regex`, `$regexMatch` and the
//! engine-side `aero_regexp` function, so every tier matches identically.

use regex::{Regex, RegexBuilder};

/// Compiles `pattern` with option letters `i`, `m`, `s`, `x`
pub fn compile_pattern(pattern: &str, options: &str) -> Result<Regex, String> {
    let mut builder = RegexBuilder::new(pattern);
    for option in options.chars() {
        match option {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            other => return Err(format!("unknown regex option '{}'", other)),
        };
    }
    builder.build().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options() {
        let re = compile_pattern("^abc", "i").unwrap();
        assert!(re.is_match("ABCdef"));

        let re = compile_pattern("^b", "m").unwrap();
        assert!(re.is_match("a\nb"));
    }

    #[test]
    fn test_bad_option_rejected() {
        assert!(compile_pattern("a", "q").is_err());
        assert!(compile_pattern("(", "").is_err());
    }
}
