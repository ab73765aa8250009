//! Shell-like word splitting with `%`-escape expansion.
//!
//! Used in two places: tokenizing the first line of an inbound SMS into a
//! verb and arguments, and expanding an external command's argument template
//! (where `%P`, `%1`, `%2-4` and friends are substituted before exec).
//!
//! Grammar:
//! - whitespace separates words; single and double quotes delimit quoted
//!   runs (the delimiter is stripped, the other quote kind is literal)
//! - backslash escapes the usual single-character controls
//!   (`\a \b \f \n \r \t \v`); any other escaped character is itself
//! - `%NAME` or `%{NAME}` invokes the expander outside single quotes;
//!   `%%` is a literal percent; an expander returning `None` adds nothing
//! - without an expander, `%` is an ordinary character

use std::iter::Peekable;
use std::str::Chars;

/// Split `input` into words with no `%`-expansion.
pub fn split(input: &str) -> Vec<String> {
    tokenize(input, None)
}

/// Split `input`, passing each `%`-escape name through `expander`.
pub fn expand<F>(input: &str, mut expander: F) -> Vec<String>
where
    F: FnMut(&str) -> Option<String>,
{
    let handler: &mut dyn FnMut(&str) -> Option<String> = &mut expander;
    tokenize(input, Some(handler))
}

/// Parser state for one pass over the input. Words are pulled one at a time
/// so quoting state never leaks between calls.
struct Splitter<'a, 'f> {
    chars: Peekable<Chars<'a>>,
    expander: Option<&'f mut dyn FnMut(&str) -> Option<String>>,
}

fn tokenize(
    input: &str,
    expander: Option<&mut dyn FnMut(&str) -> Option<String>>,
) -> Vec<String> {
    let mut sp = Splitter {
        chars: input.chars().peekable(),
        expander,
    };
    let mut words = Vec::new();
    while let Some(word) = sp.next_word() {
        words.push(word);
    }
    words
}

impl Splitter<'_, '_> {
    fn next_word(&mut self) -> Option<String> {
        while matches!(self.chars.peek(), Some(c) if c.is_whitespace()) {
            self.chars.next();
        }
        self.chars.peek()?;

        let mut word = String::new();
        let mut delim: Option<char> = None;

        while let Some(&c) = self.chars.peek() {
            if delim.is_none() && c.is_whitespace() {
                break;
            }
            self.chars.next();
            match c {
                '"' | '\'' => match delim {
                    None => delim = Some(c),
                    Some(d) if d == c => delim = None,
                    Some(_) => word.push(c),
                },
                '\\' => match self.chars.next() {
                    Some('a') => word.push('\u{07}'),
                    Some('b') => word.push('\u{08}'),
                    Some('f') => word.push('\u{0C}'),
                    Some('n') => word.push('\n'),
                    Some('r') => word.push('\r'),
                    Some('t') => word.push('\t'),
                    Some('v') => word.push('\u{0B}'),
                    Some(other) => word.push(other),
                    None => {}
                },
                '%' if self.expander.is_some() && delim != Some('\'') => {
                    match self.chars.next() {
                        Some('%') => word.push('%'),
                        Some('{') => {
                            let mut name = String::new();
                            for c in self.chars.by_ref() {
                                if c == '}' {
                                    break;
                                }
                                name.push(c);
                            }
                            self.append_expansion(&name, &mut word);
                        }
                        Some(c) => {
                            self.append_expansion(&c.to_string(), &mut word);
                        }
                        None => {}
                    }
                }
                other => word.push(other),
            }
        }

        Some(word)
    }

    fn append_expansion(&mut self, name: &str, word: &mut String) {
        if let Some(expander) = self.expander.as_deref_mut() {
            if let Some(value) = expander(name) {
                word.push_str(&value);
            }
        }
    }
}

/// The tail of a line after its first `n` whitespace-separated fields,
/// trimmed. `None` when the line has no such tail.
pub fn rest_after(line: &str, n: usize) -> Option<&str> {
    let mut rest = line;
    for _ in 0..n {
        rest = rest.trim_start();
        let end = rest.find(char::is_whitespace)?;
        rest = &rest[end..];
    }
    let rest = rest.trim();
    (!rest.is_empty()).then_some(rest)
}

/// Join `words[start..]` with single spaces, stopping after index `stop`
/// when given. Returns `None` when `start` is past the end.
pub fn join_words(words: &[String], start: usize, stop: Option<usize>) -> Option<String> {
    if start >= words.len() {
        return None;
    }
    let end = match stop {
        Some(stop) if stop < words.len() => stop + 1,
        _ => words.len(),
    };
    if end <= start {
        return Some(String::new());
    }
    Some(words[start..end].join(" "))
}
