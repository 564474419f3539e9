/// Incremental framing of an XMPP byte stream.
///
/// An XMPP stream is not a well-formed document: the root
/// `<stream:stream>` element stays open for the lifetime of the
/// connection while children are appended. This tokenizer is a small
/// character-level state machine that consumes decoded UTF-8 and emits
/// the stream header once, then one complete fragment per top-level
/// child, then the end-of-stream marker when the root closes.
///
/// It holds a single fragment buffer which is handed out (and reset)
/// on every emission.
use anyhow::{anyhow, Result};

/// What the tokenizer hands to the stream driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamToken {
    /// The raw `<stream:stream ...>` opening tag, emitted exactly once.
    Header(String),
    /// One complete top-level child of the stream, verbatim.
    Fragment(String),
    /// The matching `</stream:stream>` close: depth returned to zero.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// 0: before any markup, whitespace only.
    Prolog,
    /// 1: consumed `<` at document start.
    PrologLt,
    /// 2: inside `<?xml ...?>`.
    PrologPi,
    /// 3: inside the `<stream:stream ...>` opening tag.
    Header,
    /// 4: inside a quoted attribute value of the stream header.
    HeaderQuote,
    /// 5: at depth 1, between top-level children.
    Idle,
    /// 6: consumed `<` at depth 1, next char decides child vs footer.
    ChildOpen,
    /// 7: inside a top-level child, outside any tag.
    Fragment,
    /// 8: inside a tag of the current child.
    FragmentTag,
    /// 9: inside `</stream:stream`, waiting for `>`.
    Footer,
}

pub struct Tokenizer {
    state: State,
    /// Bytes of a UTF-8 sequence split across reads.
    carry: Vec<u8>,
    header: String,
    fragment: String,
    /// Open elements including the stream root; >= 1 while the stream
    /// is open.
    depth: usize,
    header_quote: char,
    /// Quote character when inside an attribute value of a fragment tag.
    tag_quote: Option<char>,
    /// Current fragment tag started with `</`.
    tag_closing: bool,
    /// Last significant char in the current tag was `/`.
    tag_slash: bool,
    /// First char after `<` of a fragment tag not yet seen.
    tag_first: bool,
    closed: bool,
}

impl Tokenizer {
    pub fn new() -> Self {
        Self {
            state: State::Prolog,
            carry: Vec::new(),
            header: String::new(),
            fragment: String::new(),
            depth: 0,
            header_quote: '\'',
            tag_quote: None,
            tag_closing: false,
            tag_slash: false,
            tag_first: false,
            closed: false,
        }
    }

    /// Current element nesting depth (the stream root counts as 1).
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Feeds raw bytes from the transport. Returns the tokens completed
    /// by this chunk, in stream order.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<StreamToken>> {
        let mut tokens = Vec::new();
        if self.closed {
            return Ok(tokens);
        }

        // Reassemble codepoints split across reads.
        let owned;
        let data: &[u8] = if self.carry.is_empty() {
            bytes
        } else {
            let mut joined = std::mem::take(&mut self.carry);
            joined.extend_from_slice(bytes);
            owned = joined;
            &owned
        };

        let (text, rest): (&str, &[u8]) = match std::str::from_utf8(data) {
            Ok(text) => (text, &[]),
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                // Safe: validated up to `valid`.
                let text = unsafe { std::str::from_utf8_unchecked(&data[..valid]) };
                (text, &data[valid..])
            }
            Err(e) => return Err(anyhow!("invalid UTF-8 on stream: {e}")),
        };

        for c in text.chars() {
            if let Some(token) = self.step(c)? {
                tokens.push(token);
                if self.closed {
                    break;
                }
            }
        }
        self.carry = rest.to_vec();
        Ok(tokens)
    }

    fn step(&mut self, c: char) -> Result<Option<StreamToken>> {
        match self.state {
            State::Prolog => {
                if c == '<' {
                    self.state = State::PrologLt;
                } else if !c.is_whitespace() {
                    return Err(anyhow!("unexpected character {c:?} before stream header"));
                }
            }
            State::PrologLt => {
                if c == '?' {
                    self.state = State::PrologPi;
                } else if c == '!' || c == '/' || c == '>' {
                    return Err(anyhow!("malformed stream header"));
                } else {
                    self.header.push('<');
                    self.header.push(c);
                    self.state = State::Header;
                }
            }
            State::PrologPi => {
                if c == '>' {
                    self.state = State::Prolog;
                }
            }
            State::Header => {
                self.header.push(c);
                match c {
                    '>' => {
                        self.depth = 1;
                        self.state = State::Idle;
                        return Ok(Some(StreamToken::Header(std::mem::take(
                            &mut self.header,
                        ))));
                    }
                    '\'' | '"' => {
                        self.header_quote = c;
                        self.state = State::HeaderQuote;
                    }
                    _ => {}
                }
            }
            State::HeaderQuote => {
                self.header.push(c);
                if c == self.header_quote {
                    self.state = State::Header;
                }
            }
            State::Idle => {
                if c == '<' {
                    self.state = State::ChildOpen;
                } else if !c.is_whitespace() {
                    return Err(anyhow!("text at stream level: {c:?}"));
                }
                // Whitespace between children (keep-alive pings) is dropped.
            }
            State::ChildOpen => {
                if c == '/' {
                    self.state = State::Footer;
                } else if c == '!' || c == '?' {
                    return Err(anyhow!("restricted XML at stream level"));
                } else {
                    self.fragment.push('<');
                    self.fragment.push(c);
                    self.tag_closing = false;
                    self.tag_slash = false;
                    self.tag_first = false;
                    self.tag_quote = None;
                    self.state = State::FragmentTag;
                }
            }
            State::Fragment => {
                self.fragment.push(c);
                if c == '<' {
                    self.tag_closing = false;
                    self.tag_slash = false;
                    self.tag_first = true;
                    self.tag_quote = None;
                    self.state = State::FragmentTag;
                }
            }
            State::FragmentTag => {
                self.fragment.push(c);
                if self.tag_first {
                    self.tag_first = false;
                    if c == '/' {
                        self.tag_closing = true;
                        return Ok(None);
                    }
                }
                if let Some(q) = self.tag_quote {
                    if c == q {
                        self.tag_quote = None;
                    }
                    return Ok(None);
                }
                match c {
                    '\'' | '"' => {
                        self.tag_quote = Some(c);
                    }
                    '/' => self.tag_slash = true,
                    '>' => {
                        if self.tag_closing {
                            self.depth -= 1;
                        } else if !self.tag_slash {
                            self.depth += 1;
                        }
                        // Self-closing leaves the depth unchanged; at the
                        // top level that completes the child on its own.
                        if self.depth == 1 {
                            self.state = State::Idle;
                            return Ok(Some(StreamToken::Fragment(std::mem::take(
                                &mut self.fragment,
                            ))));
                        }
                        self.state = State::Fragment;
                    }
                    _ => self.tag_slash = false,
                }
            }
            State::Footer => {
                if c == '>' {
                    self.depth = 0;
                    self.closed = true;
                    return Ok(Some(StreamToken::End));
                }
            }
        }
        Ok(None)
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "<stream:stream from='example.org' id='X' version='1.0' \
         xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>";

    fn push_all(tok: &mut Tokenizer, input: &str) -> Vec<StreamToken> {
        tok.push(input.as_bytes()).unwrap()
    }

    #[test]
    fn test_header_emitted_once() {
        let mut tok = Tokenizer::new();
        let tokens = push_all(&mut tok, &format!("<?xml version='1.0'?>{HEADER}"));
        assert_eq!(tokens, vec![StreamToken::Header(HEADER.to_string())]);
        assert_eq!(tok.depth(), 1);
    }

    #[test]
    fn test_fragment_per_child_in_order() {
        let mut tok = Tokenizer::new();
        let tokens = push_all(
            &mut tok,
            &format!(
                "{HEADER}<iq type='get' id='1'><ping/></iq>\
                 <message to='a@b'><body>hi</body></message>"
            ),
        );
        assert_eq!(
            tokens,
            vec![
                StreamToken::Header(HEADER.to_string()),
                StreamToken::Fragment("<iq type='get' id='1'><ping/></iq>".to_string()),
                StreamToken::Fragment(
                    "<message to='a@b'><body>hi</body></message>".to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_self_closing_top_level_child() {
        let mut tok = Tokenizer::new();
        let tokens = push_all(&mut tok, &format!("{HEADER}<presence/>"));
        assert_eq!(tokens[1], StreamToken::Fragment("<presence/>".to_string()));
        assert_eq!(tok.depth(), 1);
    }

    #[test]
    fn test_split_across_arbitrary_chunks() {
        let input = format!("{HEADER}<iq id='2'><query xmlns='jabber:iq:roster'/></iq>");
        for chunk in [1usize, 2, 3, 7] {
            let mut tok = Tokenizer::new();
            let mut tokens = Vec::new();
            for piece in input.as_bytes().chunks(chunk) {
                tokens.extend(tok.push(piece).unwrap());
            }
            assert_eq!(tokens.len(), 2, "chunk size {chunk}");
            assert_eq!(
                tokens[1],
                StreamToken::Fragment(
                    "<iq id='2'><query xmlns='jabber:iq:roster'/></iq>".to_string()
                )
            );
        }
    }

    #[test]
    fn test_multibyte_utf8_split_across_reads() {
        let mut tok = Tokenizer::new();
        let body = format!("{HEADER}<message><body>héllo</body></message>");
        let bytes = body.as_bytes();
        // Split in the middle of the two-byte 'é'.
        let split = body.find('é').unwrap() + 1;
        let mut tokens = tok.push(&bytes[..split]).unwrap();
        tokens.extend(tok.push(&bytes[split..]).unwrap());
        assert_eq!(
            tokens[1],
            StreamToken::Fragment("<message><body>héllo</body></message>".to_string())
        );
    }

    #[test]
    fn test_whitespace_keepalive_ignored() {
        let mut tok = Tokenizer::new();
        let tokens = push_all(&mut tok, &format!("{HEADER} \n <presence/>"));
        assert_eq!(tokens.len(), 2);
    }

    #[test]
    fn test_text_at_stream_level_is_violation() {
        let mut tok = Tokenizer::new();
        push_all(&mut tok, HEADER);
        assert!(tok.push(b"garbage").is_err());
    }

    #[test]
    fn test_footer_ends_stream() {
        let mut tok = Tokenizer::new();
        let tokens = push_all(&mut tok, &format!("{HEADER}<presence/></stream:stream>"));
        assert_eq!(tokens.last(), Some(&StreamToken::End));
        assert_eq!(tok.depth(), 0);
    }

    #[test]
    fn test_bytes_after_footer_ignored() {
        let mut tok = Tokenizer::new();
        push_all(&mut tok, &format!("{HEADER}</stream:stream>"));
        assert!(tok.push(b"<iq/>").unwrap().is_empty());
    }

    #[test]
    fn test_gt_inside_attribute_value() {
        let mut tok = Tokenizer::new();
        let tokens = push_all(
            &mut tok,
            &format!("{HEADER}<message subject='a>b'><body>x</body></message>"),
        );
        assert_eq!(
            tokens[1],
            StreamToken::Fragment("<message subject='a>b'><body>x</body></message>".to_string())
        );
    }

    #[test]
    fn test_nested_same_name_children() {
        let mut tok = Tokenizer::new();
        let tokens = push_all(
            &mut tok,
            &format!("{HEADER}<iq><x><x/></x><x>t</x></iq>"),
        );
        assert_eq!(
            tokens[1],
            StreamToken::Fragment("<iq><x><x/></x><x>t</x></iq>".to_string())
        );
    }

    #[test]
    fn test_whitespace_inside_fragment_preserved() {
        let mut tok = Tokenizer::new();
        let tokens = push_all(
            &mut tok,
            &format!("{HEADER}<message><body> a  b </body></message>"),
        );
        assert_eq!(
            tokens[1],
            StreamToken::Fragment("<message><body> a  b </body></message>".to_string())
        );
    }

    #[test]
    fn test_header_attribute_with_gt() {
        let mut tok = Tokenizer::new();
        let header = "<stream:stream from='a>b' version='1.0'>";
        let tokens = push_all(&mut tok, header);
        assert_eq!(tokens, vec![StreamToken::Header(header.to_string())]);
    }

    #[test]
    fn test_comment_at_stream_level_rejected() {
        let mut tok = Tokenizer::new();
        push_all(&mut tok, HEADER);
        assert!(tok.push(b"<!-- hi -->").is_err());
    }
}
