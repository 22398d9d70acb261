use tantivy::tokenizer::{Token, TokenStream, Tokenizer};

/// Name the note tokenizer is registered under in every opened index
pub const NOTE_TOKENIZER: &str = "note";

/// Splits on anything that is not alphanumeric and lowercases what is left.
/// CJK text has no word separators, so each CJK character becomes a token
/// together with a bigram of it and the following CJK character.
#[derive(Clone, Default)]
pub struct NoteTokenizer;

#[derive(Debug, Clone, PartialEq)]
pub struct TokenData {
    pub text: String,
    pub offset_from: usize,
    pub offset_to: usize,
}

/// Terms of `text` in position order, exactly as the index sees them
pub fn tokenize(text: &str) -> Vec<TokenData> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some((start, ch)) = chars.next() {
        if is_cjk_char(ch) {
            let end = start + ch.len_utf8();
            tokens.push(TokenData {
                text: ch.to_lowercase().collect(),
                offset_from: start,
                offset_to: end,
            });
            if let Some(&(_, next)) = chars.peek() {
                if is_cjk_char(next) {
                    let mut bigram: String = ch.to_lowercase().collect();
                    bigram.extend(next.to_lowercase());
                    tokens.push(TokenData {
                        text: bigram,
                        offset_from: start,
                        offset_to: end + next.len_utf8(),
                    });
                }
            }
        } else if ch.is_alphanumeric() {
            let mut end = start + ch.len_utf8();
            let mut word: String = ch.to_lowercase().collect();
            while let Some(&(idx, next)) = chars.peek() {
                if !next.is_alphanumeric() || is_cjk_char(next) {
                    break;
                }
                word.extend(next.to_lowercase());
                end = idx + next.len_utf8();
                chars.next();
            }
            tokens.push(TokenData {
                text: word,
                offset_from: start,
                offset_to: end,
            });
        }
    }

    tokens
}

fn is_cjk_char(c: char) -> bool {
    let cp = c as u32;
    // CJK Unified Ideographs
    (0x4E00..=0x9FFF).contains(&cp)
    // Hangul Syllables
    || (0xAC00..=0xD7AF).contains(&cp)
    // Hangul Jamo
    || (0x1100..=0x11FF).contains(&cp)
    // Hangul Compatibility Jamo
    || (0x3130..=0x318F).contains(&cp)
    // Katakana
    || (0x30A0..=0x30FF).contains(&cp)
    // Hiragana
    || (0x3040..=0x309F).contains(&cp)
    // CJK Extension A
    || (0x3400..=0x4DBF).contains(&cp)
    // CJK Extension B
    || (0x20000..=0x2A6DF).contains(&cp)
}

impl Tokenizer for NoteTokenizer {
    type TokenStream<'a> = NoteTokenStream;

    fn token_stream<'a>(&'a mut self, text: &'a str) -> Self::TokenStream<'a> {
        NoteTokenStream {
            tokens: tokenize(text),
            index: 0,
            token: Token::default(),
        }
    }
}

pub struct NoteTokenStream {
    tokens: Vec<TokenData>,
    index: usize,
    token: Token,
}

impl TokenStream for NoteTokenStream {
    fn advance(&mut self) -> bool {
        let Some(data) = self.tokens.get(self.index) else {
            return false;
        };
        self.token = Token {
            offset_from: data.offset_from,
            offset_to: data.offset_to,
            position: self.index,
            text: data.text.clone(),
            position_length: 1,
        };
        self.index += 1;
        true
    }

    fn token(&self) -> &Token {
        &self.token
    }

    fn token_mut(&mut self) -> &mut Token {
        &mut self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms(text: &str) -> Vec<String> {
        tokenize(text).into_iter().map(|t| t.text).collect()
    }

    #[test]
    fn test_case_folding_and_delimiters() {
        assert_eq!(terms("Hello, World! foo-bar_baz 42"), vec!["hello", "world", "foo", "bar", "baz", "42"]);
        assert!(terms("  ...  ").is_empty());
    }

    #[test]
    fn test_offsets_point_into_source() {
        let text = "Über alles";
        for token in tokenize(text) {
            assert_eq!(text[token.offset_from..token.offset_to].to_lowercase(), token.text);
        }
    }

    #[test]
    fn test_cjk_unigrams_and_bigrams() {
        assert_eq!(terms("한글abc"), vec!["한", "한글", "글", "abc"]);
    }

    #[test]
    fn test_token_stream_positions() {
        let mut tokenizer = NoteTokenizer;
        let mut stream = tokenizer.token_stream("alpha beta");
        let mut seen = Vec::new();
        while stream.advance() {
            seen.push((stream.token().text.clone(), stream.token().position));
        }
        assert_eq!(seen, vec![("alpha".to_string(), 0), ("beta".to_string(), 1)]);
    }
}
