//! Whitespace tokenization that keeps single-quoted runs atomic.
//!
//! sclang prints device names inside single quotes and those names may
//! contain spaces, so a plain `split_whitespace` would tear them apart.
//! No escaping of embedded quotes is supported; an unterminated quote
//! swallows the rest of the line.

/// Split `input` into tokens. A maximal single-quoted run is one token
/// (quotes retained); any other maximal run of non-whitespace, non-quote
/// characters is one token.
pub fn tokenize(input: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut iter = input.char_indices().peekable();

    while let Some(&(start, c)) = iter.peek() {
        if c.is_whitespace() {
            iter.next();
            continue;
        }
        if c == '\'' {
            iter.next();
            let mut end = input.len();
            for (i, ch) in iter.by_ref() {
                if ch == '\'' {
                    end = i + ch.len_utf8();
                    break;
                }
            }
            tokens.push(&input[start..end]);
        } else {
            let mut end = input.len();
            while let Some(&(i, ch)) = iter.peek() {
                if ch.is_whitespace() || ch == '\'' {
                    end = i;
                    break;
                }
                iter.next();
            }
            tokens.push(&input[start..end]);
        }
    }

    tokens
}
