/// Incremental line splitter for streaming bodies.
///
/// Bytes arrive in arbitrary chunks; lines are yielded only once their
/// terminator (`\n` or `\r\n`) has been seen, so multi-byte characters and
/// CRLF pairs split across chunks are handled correctly.
#[derive(Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Yield whatever is buffered as a final, unterminated line.
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_across_chunks() {
        let mut decoder = LineDecoder::new();
        assert_eq!(decoder.decode(b"foo"), Vec::<String>::new());
        assert_eq!(decoder.decode(b" bar\nbaz"), vec!["foo bar"]);
        assert_eq!(decoder.flush(), Some("baz".to_owned()));
        assert_eq!(decoder.flush(), None);
    }

    #[test]
    fn test_crlf_split_across_chunks() {
        let mut decoder = LineDecoder::new();
        assert_eq!(decoder.decode(b"foo\r"), Vec::<String>::new());
        assert_eq!(decoder.decode(b"\nbar\r\n"), vec!["foo", "bar"]);
    }

    #[test]
    fn test_empty_lines_preserved() {
        let mut decoder = LineDecoder::new();
        assert_eq!(decoder.decode(b"a\n\nb\n"), vec!["a", "", "b"]);
    }

    #[test]
    fn test_multibyte_character_split_across_chunks() {
        let mut decoder = LineDecoder::new();
        let bytes = "известни\n".as_bytes();
        assert_eq!(decoder.decode(&bytes[..3]), Vec::<String>::new());
        assert_eq!(decoder.decode(&bytes[3..]), vec!["известни"]);
    }
}
