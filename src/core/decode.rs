//! Purpose: Incremental decoder for a top-level JSON object arriving in chunks.
//! Exports: `ObjectDecoder`.
//! Role: Consumer half of the pipeline; yields (key, EntityRecord) pairs one at a time.
//! Invariants: Memory held is one chunk plus the raw bytes of the value being decoded.
//! Invariants: The first error is terminal; afterwards `next_entry` returns `Ok(None)`.
//! Invariants: I/O failures keep their `ReadFailure` kind; they are never reported as decode errors.
//! Invariants: A `null` entity value decodes as an empty record; other non-objects are rejected.
use serde_json::Value;

use super::batch::EntityRecord;
use super::conduit::ChunkSource;
use super::error::{Error, ErrorKind, Stage};
use crate::json::parse;

struct ByteSource<S> {
    source: S,
    chunk: Vec<u8>,
    pos: usize,
    offset: u64,
    exhausted: bool,
}

impl<S: ChunkSource> ByteSource<S> {
    fn new(source: S) -> Self {
        Self {
            source,
            chunk: Vec::new(),
            pos: 0,
            offset: 0,
            exhausted: false,
        }
    }

    fn peek(&mut self) -> Result<Option<u8>, Error> {
        while self.pos >= self.chunk.len() {
            if self.exhausted {
                return Ok(None);
            }
            match self.source.next_chunk()? {
                Some(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                None => {
                    self.exhausted = true;
                    self.chunk = Vec::new();
                    self.pos = 0;
                }
            }
        }
        Ok(Some(self.chunk[self.pos]))
    }

    // Only valid right after `peek` returned a byte.
    fn bump(&mut self) {
        self.pos += 1;
        self.offset += 1;
    }

    fn next(&mut self) -> Result<Option<u8>, Error> {
        let byte = self.peek()?;
        if byte.is_some() {
            self.bump();
        }
        Ok(byte)
    }

    fn skip_whitespace(&mut self) -> Result<Option<u8>, Error> {
        loop {
            match self.peek()? {
                Some(b' ' | b'\t' | b'\n' | b'\r') => self.bump(),
                other => return Ok(other),
            }
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Unopened,
    FirstEntry,
    NextEntry,
    Done,
}

pub struct ObjectDecoder<S> {
    src: ByteSource<S>,
    state: State,
}

impl<S: ChunkSource> ObjectDecoder<S> {
    pub fn new(source: S) -> Self {
        Self {
            src: ByteSource::new(source),
            state: State::Unopened,
        }
    }

    /// Consumes the opening `{` of the document.
    pub fn open(&mut self) -> Result<(), Error> {
        if self.state != State::Unopened {
            return Ok(());
        }
        let result = match self.src.skip_whitespace() {
            Ok(Some(b'{')) => {
                self.src.bump();
                self.state = State::FirstEntry;
                return Ok(());
            }
            Ok(Some(byte)) => Err(Error::new(ErrorKind::MalformedTopLevel)
                .with_stage(Stage::Decode)
                .with_message(format!(
                    "document must start with '{{', found {}",
                    describe_byte(byte)
                ))
                .with_offset(self.src.offset)),
            Ok(None) => Err(Error::new(ErrorKind::MalformedTopLevel)
                .with_stage(Stage::Decode)
                .with_message("document is empty")
                .with_offset(self.src.offset)),
            Err(err) => Err(err),
        };
        self.state = State::Done;
        result
    }

    /// Bytes consumed from the stream so far.
    pub fn offset(&self) -> u64 {
        self.src.offset
    }

    pub fn next_entry(&mut self) -> Result<Option<(String, EntityRecord)>, Error> {
        match self.state {
            State::Done => return Ok(None),
            State::Unopened => self.open()?,
            State::FirstEntry | State::NextEntry => {}
        }
        let result = self.advance();
        if !matches!(result, Ok(Some(_))) {
            self.state = State::Done;
        }
        result
    }

    fn advance(&mut self) -> Result<Option<(String, EntityRecord)>, Error> {
        let first = self.state == State::FirstEntry;
        match self.src.skip_whitespace()? {
            Some(b'}') => {
                self.src.bump();
                self.finish()?;
                return Ok(None);
            }
            Some(b',') if !first => self.src.bump(),
            Some(_) if first => {}
            Some(byte) => {
                return Err(self.decode_error(format!(
                    "expected ',' or '}}' after entry, found {}",
                    describe_byte(byte)
                )));
            }
            None => return Err(self.eof_error("top-level object is not closed")),
        }

        let key = self.read_key()?;
        match self.src.skip_whitespace()? {
            Some(b':') => self.src.bump(),
            Some(byte) => {
                return Err(self
                    .decode_error(format!("expected ':' after key, found {}", describe_byte(byte)))
                    .with_key(key));
            }
            None => return Err(self.eof_error("missing value").with_key(key)),
        }
        let record = self.read_record(&key)?;
        self.state = State::NextEntry;
        Ok(Some((key, record)))
    }

    fn read_key(&mut self) -> Result<String, Error> {
        let start = self.src.offset;
        match self.src.skip_whitespace()? {
            Some(b'"') => {}
            Some(byte) => {
                return Err(Error::new(ErrorKind::NonStringKey)
                    .with_stage(Stage::Decode)
                    .with_message(format!(
                        "object key must be a string, found {}",
                        describe_byte(byte)
                    ))
                    .with_offset(self.src.offset));
            }
            None => return Err(self.eof_error("expected an object key")),
        }
        let mut raw = Vec::new();
        self.scan_string(&mut raw)?;
        parse::from_slice::<String>(&raw).map_err(|err| {
            Error::new(ErrorKind::NonStringKey)
                .with_stage(Stage::Decode)
                .with_message(format!(
                    "object key is not a valid JSON string: {}",
                    parse::snippet(&raw)
                ))
                .with_offset(start)
                .with_source(err)
        })
    }

    fn read_record(&mut self, key: &str) -> Result<EntityRecord, Error> {
        self.src.skip_whitespace()?;
        let start = self.src.offset;
        let mut raw = Vec::new();
        self.scan_value(&mut raw).map_err(|err| err.with_key(key))?;

        let value: Value = parse::from_slice(&raw).map_err(|err| {
            let category = parse::categorize_error(&err);
            Error::new(ErrorKind::ValueDecodeFailure)
                .with_stage(Stage::Decode)
                .with_message(format!(
                    "invalid value ({}): {}",
                    category.label(),
                    parse::snippet(&raw)
                ))
                .with_key(key)
                .with_offset(start)
                .with_source(err)
        })?;
        match value {
            Value::Object(map) => Ok(EntityRecord::from(map)),
            Value::Null => Ok(EntityRecord::new()),
            other => Err(Error::new(ErrorKind::ValueDecodeFailure)
                .with_stage(Stage::Decode)
                .with_message(format!(
                    "entity value must be an object, found {}",
                    parse::value_kind(&other)
                ))
                .with_key(key)
                .with_offset(start)),
        }
    }

    fn scan_value(&mut self, out: &mut Vec<u8>) -> Result<(), Error> {
        match self.src.peek()? {
            Some(b'"') => self.scan_string(out),
            Some(b'{' | b'[') => self.scan_container(out),
            Some(_) => self.scan_scalar(out),
            None => Err(self.eof_error("missing value")),
        }
    }

    fn scan_string(&mut self, out: &mut Vec<u8>) -> Result<(), Error> {
        // Opening quote.
        if let Some(byte) = self.src.next()? {
            out.push(byte);
        }
        loop {
            let Some(byte) = self.src.next()? else {
                return Err(self.eof_error("unterminated string"));
            };
            out.push(byte);
            match byte {
                b'\\' => {
                    let Some(escaped) = self.src.next()? else {
                        return Err(self.eof_error("unterminated string"));
                    };
                    out.push(escaped);
                }
                b'"' => return Ok(()),
                _ => {}
            }
        }
    }

    fn scan_container(&mut self, out: &mut Vec<u8>) -> Result<(), Error> {
        let mut depth = 0usize;
        loop {
            let Some(byte) = self.src.peek()? else {
                return Err(self.eof_error("value is truncated"));
            };
            match byte {
                b'"' => {
                    self.scan_string(out)?;
                    continue;
                }
                b'{' | b'[' => depth += 1,
                b'}' | b']' => depth = depth.saturating_sub(1),
                _ => {}
            }
            out.push(byte);
            self.src.bump();
            if depth == 0 {
                return Ok(());
            }
        }
    }

    fn scan_scalar(&mut self, out: &mut Vec<u8>) -> Result<(), Error> {
        while let Some(byte) = self.src.peek()? {
            if is_delimiter(byte) {
                break;
            }
            out.push(byte);
            self.src.bump();
        }
        if out.is_empty() {
            let found = match self.src.peek()? {
                Some(byte) => describe_byte(byte),
                None => "end of input".to_string(),
            };
            return Err(self.decode_error(format!("expected a value, found {found}")));
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        match self.src.skip_whitespace()? {
            None => Ok(()),
            Some(byte) => Err(self.decode_error(format!(
                "unexpected data after top-level object: {}",
                describe_byte(byte)
            ))),
        }
    }

    fn decode_error(&self, message: String) -> Error {
        Error::new(ErrorKind::ValueDecodeFailure)
            .with_stage(Stage::Decode)
            .with_message(message)
            .with_offset(self.src.offset)
    }

    fn eof_error(&self, what: &str) -> Error {
        self.decode_error(format!("unexpected end of input: {what}"))
    }
}

fn is_delimiter(byte: u8) -> bool {
    matches!(
        byte,
        b',' | b'}' | b']' | b':' | b'{' | b'[' | b'"' | b' ' | b'\t' | b'\n' | b'\r'
    )
}

fn describe_byte(byte: u8) -> String {
    if byte.is_ascii_graphic() {
        format!("'{}'", byte as char)
    } else {
        format!("byte 0x{byte:02x}")
    }
}

#[cfg(test)]
mod tests {
    use super::ObjectDecoder;
    use crate::core::batch::EntityRecord;
    use crate::core::conduit::ChunkSource;
    use crate::core::error::{Error, ErrorKind, Stage};
    use serde_json::json;
    use std::collections::VecDeque;

    struct Chunks {
        chunks: VecDeque<Vec<u8>>,
        fail_at_end: bool,
    }

    impl ChunkSource for Chunks {
        fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, Error> {
            match self.chunks.pop_front() {
                Some(chunk) => Ok(Some(chunk)),
                None if self.fail_at_end => Err(Error::new(ErrorKind::ReadFailure)
                    .with_stage(Stage::Relay)
                    .with_message("failed to read input stream")),
                None => Ok(None),
            }
        }
    }

    fn split(input: &str, size: usize) -> Chunks {
        Chunks {
            chunks: input
                .as_bytes()
                .chunks(size)
                .map(|chunk| chunk.to_vec())
                .collect(),
            fail_at_end: false,
        }
    }

    fn decoder(input: &str) -> ObjectDecoder<Chunks> {
        ObjectDecoder::new(split(input, 1024))
    }

    fn collect(input: &str, size: usize) -> Result<Vec<(String, EntityRecord)>, Error> {
        let mut decoder = ObjectDecoder::new(split(input, size));
        let mut entries = Vec::new();
        while let Some(entry) = decoder.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }

    fn first_error(input: &str) -> Error {
        collect(input, 1024).expect_err("decode error")
    }

    #[test]
    fn decodes_entries_split_at_every_byte() {
        let input = r#" { "A" : {"x":"a,}\"b","n":-1.5e3} ,
            "B":{"y":[1,{"z":[]}],"t":true,"u":null} } "#;
        for size in [1, 2, 3, 7, 1024] {
            let entries = collect(input, size).expect("decode");
            assert_eq!(entries.len(), 2, "chunk size {size}");
            assert_eq!(entries[0].0, "A");
            assert_eq!(entries[0].1.get("x"), Some(&json!("a,}\"b")));
            assert_eq!(entries[0].1.get("n"), Some(&json!(-1500.0)));
            assert_eq!(entries[1].0, "B");
            assert_eq!(entries[1].1.get("y"), Some(&json!([1, {"z": []}])));
            assert_eq!(entries[1].1.get("u"), Some(&json!(null)));
        }
    }

    #[test]
    fn empty_object_has_no_entries() {
        assert!(collect("{}", 1).expect("decode").is_empty());
        assert!(collect(" \n{ \t}\n", 1).expect("decode").is_empty());
    }

    #[test]
    fn escaped_keys_are_unescaped() {
        let entries = collect(r#"{"A\u0042":{},"c\"d":{}}"#, 3).expect("decode");
        assert_eq!(entries[0].0, "AB");
        assert_eq!(entries[1].0, "c\"d");
    }

    #[test]
    fn duplicate_keys_are_yielded_in_order() {
        let entries = collect(r#"{"A":{"v":1},"A":{"v":2}}"#, 4).expect("decode");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].1.get("v"), Some(&json!(2)));
    }

    #[test]
    fn open_rejects_non_object_documents() {
        for input in ["[1,2]", "\"PORT\"", "", "   ", "\u{feff}{}"] {
            let mut decoder = decoder(input);
            let err = decoder.open().expect_err("malformed");
            assert_eq!(err.kind(), ErrorKind::MalformedTopLevel, "input {input:?}");
            assert_eq!(err.stage(), Some(Stage::Decode));
            assert_eq!(decoder.next_entry().expect("done"), None);
        }
    }

    #[test]
    fn next_entry_opens_lazily() {
        let mut decoder = decoder("7");
        let err = decoder.next_entry().expect_err("malformed");
        assert_eq!(err.kind(), ErrorKind::MalformedTopLevel);
    }

    #[test]
    fn non_string_keys_are_rejected() {
        for input in [r#"{1:{}}"#, r#"{true:{}}"#, r#"{"A":{},}"#, r#"{,"A":{}}"#] {
            let err = first_error(input);
            assert_eq!(err.kind(), ErrorKind::NonStringKey, "input {input}");
        }
    }

    #[test]
    fn invalid_key_escape_is_a_non_string_key() {
        let err = first_error(r#"{"A\q":{}}"#);
        assert_eq!(err.kind(), ErrorKind::NonStringKey);
        assert_eq!(err.offset(), Some(1));
    }

    #[test]
    fn truncated_document_is_a_value_decode_failure() {
        for input in [r#"{"A":1"#, r#"{"A":{"x":1}"#, r#"{"A":{"x":"#, r#"{"A""#, r#"{"A":"#] {
            let err = first_error(input);
            assert_eq!(err.kind(), ErrorKind::ValueDecodeFailure, "input {input}");
        }
    }

    #[test]
    fn non_object_values_are_rejected_with_key() {
        let err = first_error(r#"{"A":{},"B":[1,2]}"#);
        assert_eq!(err.kind(), ErrorKind::ValueDecodeFailure);
        assert_eq!(err.key(), Some("B"));
        assert!(err.message().unwrap().contains("found array"));

        let err = first_error(r#"{"A":7}"#);
        assert!(err.message().unwrap().contains("found number"));
    }

    #[test]
    fn null_value_is_an_empty_record() {
        let entries = collect(r#"{"A":null,"B":{"x":1}}"#, 3).expect("decode");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "A");
        assert!(entries[0].1.is_empty());
        assert_eq!(entries[1].1.get("x"), Some(&json!(1)));
    }

    #[test]
    fn malformed_values_are_rejected() {
        for input in [
            r#"{"A":{"x":tru}}"#,
            r#"{"A":{"x":1,}}"#,
            r#"{"A":{"x":[1}]}"#,
            r#"{"A":}"#,
            r#"{"A" {}}"#,
            r#"{"A":{} "B":{}}"#,
        ] {
            let err = first_error(input);
            assert_eq!(err.kind(), ErrorKind::ValueDecodeFailure, "input {input}");
            assert_eq!(err.stage(), Some(Stage::Decode));
        }
    }

    #[test]
    fn decode_failure_message_names_category() {
        let err = first_error(r#"{"A":{"x":tru}}"#);
        let message = err.message().expect("message");
        assert!(message.starts_with("invalid value (syntax)"), "{message}");
        assert_eq!(err.offset(), Some(5));
    }

    #[test]
    fn trailing_data_is_rejected() {
        let err = first_error("{} x");
        assert_eq!(err.kind(), ErrorKind::ValueDecodeFailure);
        assert!(collect("{}\n\n", 1).is_ok());
    }

    #[test]
    fn read_failure_keeps_its_kind() {
        let mut source = split(r#"{"A":{"x":1},"B":{"#, 5);
        source.fail_at_end = true;
        let mut decoder = ObjectDecoder::new(source);
        let (key, _) = decoder.next_entry().expect("first").expect("entry");
        assert_eq!(key, "A");
        let err = decoder.next_entry().expect_err("read failure");
        assert_eq!(err.kind(), ErrorKind::ReadFailure);
        assert_eq!(err.stage(), Some(Stage::Relay));
        assert_eq!(decoder.next_entry().expect("terminal"), None);
    }

    #[test]
    fn errors_are_terminal() {
        let mut decoder = decoder(r#"{"A":5,"B":{}}"#);
        assert!(decoder.next_entry().is_err());
        assert_eq!(decoder.next_entry().expect("done"), None);
    }
}
