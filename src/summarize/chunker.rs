//! Line-aligned text splitting.

/// Lazy iterator over line-aligned chunks of at most `max_chars` characters.
///
/// Each chunk ends at the last newline inside the window (the newline itself
/// is consumed); when the window has no newline the text is cut at the
/// limit. Newlines at a chunk start are skipped, so chunks are never empty.
pub struct Chunks<'a> {
    rest: &'a str,
    max_chars: usize,
}

pub fn chunks(text: &str, max_chars: usize) -> Chunks<'_> {
    Chunks {
        rest: text,
        max_chars: max_chars.max(1),
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        // Blank lines at a chunk start carry nothing.
        self.rest = self.rest.trim_start_matches('\n');
        if self.rest.is_empty() {
            return None;
        }

        // Byte offset just past the window; None means the rest fits.
        let Some((window_end, _)) = self.rest.char_indices().nth(self.max_chars) else {
            let chunk = self.rest;
            self.rest = "";
            return Some(chunk);
        };

        // A newline right at the window edge still counts as "at or before".
        let edge = usize::from(self.rest[window_end..].starts_with('\n'));
        let chunk = match self.rest[..window_end + edge].rfind('\n') {
            Some(nl) => {
                let chunk = &self.rest[..nl];
                self.rest = &self.rest[nl + 1..];
                chunk
            }
            None => {
                let chunk = &self.rest[..window_end];
                self.rest = &self.rest[window_end..];
                chunk
            }
        };
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        let out: Vec<&str> = chunks("hello\nworld", 100).collect();
        assert_eq!(out, vec!["hello\nworld"]);
    }

    #[test]
    fn splits_on_last_newline_in_window() {
        let text = "aaaa\nbbbb\ncccc";
        let out: Vec<&str> = chunks(text, 10).collect();
        assert_eq!(out, vec!["aaaa\nbbbb", "cccc"]);
    }

    #[test]
    fn newline_exactly_at_limit_is_used() {
        let out: Vec<&str> = chunks("abcd\nefgh", 4).collect();
        assert_eq!(out, vec!["abcd", "efgh"]);
    }

    #[test]
    fn hard_cut_without_newline() {
        let out: Vec<&str> = chunks("abcdefghij", 4).collect();
        assert_eq!(out, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn multibyte_chars_counted_as_chars() {
        let out: Vec<&str> = chunks("가나다라마바", 4).collect();
        assert_eq!(out, vec!["가나다라", "마바"]);
    }

    #[test]
    fn leading_newlines_never_yield_empty_chunks() {
        let out: Vec<&str> = chunks("\n\nabc\n\ndef", 3).collect();
        assert!(out.iter().all(|c| !c.is_empty()), "{out:?}");
        assert_eq!(out, vec!["abc", "def"]);
    }

    #[test]
    fn empty_text_has_no_chunks() {
        assert_eq!(chunks("", 10).count(), 0);
    }
}
