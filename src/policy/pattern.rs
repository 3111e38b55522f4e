//! Anchored glob matching for permission rules.
//!
//! Supports exactly two constructs: literal characters and `*` (any run,
//! including empty). Matching is anchored at both ends. Rules stay
//! conservative and predictable; this is deliberately not a regex engine.

/// Match `input` against `pattern`, anchored.
pub fn glob_match(pattern: &str, input: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = input.chars().collect();
    match_from(&pat, &text)
}

fn match_from(pat: &[char], text: &[char]) -> bool {
    match pat.first() {
        None => text.is_empty(),
        Some('*') => {
            // Collapse consecutive stars, then try every split point.
            let rest = &pat[1..];
            if rest.is_empty() {
                return true;
            }
            (0..=text.len()).any(|i| match_from(rest, &text[i..]))
        }
        Some(&c) => match text.first() {
            Some(&t) if t == c => match_from(&pat[1..], &text[1..]),
            _ => false,
        },
    }
}
