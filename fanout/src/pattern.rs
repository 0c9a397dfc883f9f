/// Channel pattern with Redis `PSUBSCRIBE` glob semantics:
/// `*` any run, `?` any single byte, `[...]` a class (`^` negates, `a-z` ranges)
/// and `\` escapes the next byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPattern(String);

impl ChannelPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, channel: &str) -> bool {
        glob_match(self.0.as_bytes(), channel.as_bytes())
    }
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    // Position of the last `*` and the text index it currently absorbs up to.
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    backtrack = Some((p, t));
                    p += 1;
                    continue;
                }
                b'?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                b'[' => match match_class(pattern, p, text[t]) {
                    Some((true, next)) => {
                        p = next;
                        t += 1;
                        continue;
                    }
                    Some((false, _)) => {}
                    // Unterminated class: treat `[` literally.
                    None if text[t] == b'[' => {
                        p += 1;
                        t += 1;
                        continue;
                    }
                    None => {}
                },
                b'\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == text[t] {
                        p += 2;
                        t += 1;
                        continue;
                    }
                }
                literal => {
                    if literal == text[t] {
                        p += 1;
                        t += 1;
                        continue;
                    }
                }
            }
        }

        match backtrack {
            Some((star, absorbed)) => {
                p = star + 1;
                t = absorbed + 1;
                backtrack = Some((star, absorbed + 1));
            }
            None => return false,
        }
    }

    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

/// Evaluates the class starting at `pattern[start] == b'['` against `c`.
/// Returns whether it matched and the index just past the closing `]`.
fn match_class(pattern: &[u8], start: usize, c: u8) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = pattern.get(i) == Some(&b'^');
    if negate {
        i += 1;
    }

    let mut matched = false;
    loop {
        match *pattern.get(i)? {
            b']' => break,
            b'\\' if i + 1 < pattern.len() => {
                matched |= pattern[i + 1] == c;
                i += 2;
            }
            lo if i + 2 < pattern.len() && pattern[i + 1] == b'-' && pattern[i + 2] != b']' => {
                let hi = pattern[i + 2];
                let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
                matched |= (lo..=hi).contains(&c);
                i += 3;
            }
            other => {
                matched |= other == c;
                i += 1;
            }
        }
    }

    Some((matched != negate, i + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, channel: &str) -> bool {
        ChannelPattern::new(pattern).matches(channel)
    }

    #[test]
    fn star_matches_any_suffix() {
        assert!(matches("fanout:*", "fanout:org-42"));
        assert!(matches("fanout:*", "fanout:"));
        assert!(!matches("fanout:*", "audit:org-42"));
        assert!(matches("*", "anything"));
    }

    #[test]
    fn star_backtracks() {
        assert!(matches("fanout:*.42", "fanout:org.x.42"));
        assert!(!matches("fanout:*.42", "fanout:org.x.43"));
        assert!(matches("a*b*c", "aXXbYYbZc"));
    }

    #[test]
    fn question_mark_matches_one_byte() {
        assert!(matches("org-?", "org-7"));
        assert!(!matches("org-?", "org-42"));
    }

    #[test]
    fn classes_ranges_and_negation() {
        assert!(matches("org-[0-9]", "org-4"));
        assert!(!matches("org-[0-9]", "org-x"));
        assert!(matches("org-[^0-9]", "org-x"));
        assert!(matches("user.[ab]*", "user.bob"));
        assert!(!matches("user.[ab]*", "user.carol"));
    }

    #[test]
    fn escapes_and_literals() {
        assert!(matches(r"fanout:\*", "fanout:*"));
        assert!(!matches(r"fanout:\*", "fanout:org"));
        assert!(matches("fanout:[", "fanout:["));
        assert!(matches("fanout:org-42", "fanout:org-42"));
        assert!(!matches("fanout:org-42", "fanout:org-420"));
    }
}
