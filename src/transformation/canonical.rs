//! Canonical JSON serialization
//!
//! Keys sorted, two-space indent, `": "` after keys, everything outside
//! printable ASCII escaped as `\uXXXX`, one trailing newline.
//! Every instance must agree on this layout for transformation checksums
//! to match.

use serde::Serialize;
use serde_json::ser::{Formatter, PrettyFormatter};
use serde_json::Value;
use std::io::{self, Write};

/// Pretty formatter that escapes everything outside printable ASCII
struct AsciiFormatter<'a> {
    inner: PrettyFormatter<'a>,
}

impl<'a> AsciiFormatter<'a> {
    fn new() -> Self {
        Self {
            inner: PrettyFormatter::with_indent(b"  "),
        }
    }
}

impl Formatter for AsciiFormatter<'_> {
    fn write_string_fragment<W: ?Sized + Write>(
        &mut self,
        writer: &mut W,
        fragment: &str,
    ) -> io::Result<()> {
        let mut start = 0;
        for (i, ch) in fragment.char_indices() {
            if (' '..='~').contains(&ch) {
                continue;
            }
            writer.write_all(&fragment.as_bytes()[start..i])?;
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                write!(writer, "\\u{:04x}", unit)?;
            }
            start = i + ch.len_utf8();
        }
        writer.write_all(&fragment.as_bytes()[start..])
    }

    fn begin_array<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.begin_array(writer)
    }

    fn end_array<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_array(writer)
    }

    fn begin_array_value<W: ?Sized + Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        self.inner.begin_array_value(writer, first)
    }

    fn end_array_value<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_array_value(writer)
    }

    fn begin_object<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.begin_object(writer)
    }

    fn end_object<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_object(writer)
    }

    fn begin_object_key<W: ?Sized + Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        self.inner.begin_object_key(writer, first)
    }

    fn begin_object_value<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.begin_object_value(writer)
    }

    fn end_object_value<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_object_value(writer)
    }
}

/// Serialize a JSON value canonically, with a trailing newline
///
/// Object keys come out sorted because `serde_json::Map` is ordered.
pub fn to_canonical_bytes(value: &Value) -> serde_json::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, AsciiFormatter::new());
    value.serialize(&mut ser)?;
    out.push(b'\n');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn matches_canonical_layout() {
        let value = json!({"b": [1, null], "a": {"y": true, "x": "s"}, "c": [], "d": {}});
        let out = String::from_utf8(to_canonical_bytes(&value).unwrap()).unwrap();
        let expected = "{\n  \"a\": {\n    \"x\": \"s\",\n    \"y\": true\n  },\n  \"b\": [\n    1,\n    null\n  ],\n  \"c\": [],\n  \"d\": {}\n}\n";
        assert_eq!(out, expected);
    }

    #[test]
    fn escapes_non_ascii() {
        let value = json!({"k": "caf\u{e9} \u{1F600}\u{7f}"});
        let out = String::from_utf8(to_canonical_bytes(&value).unwrap()).unwrap();
        assert_eq!(out, "{\n  \"k\": \"caf\\u00e9 \\ud83d\\ude00\\u007f\"\n}\n");
    }

    #[test]
    fn control_characters_escaped_once() {
        let value = json!(["a\nb\"c"]);
        let out = String::from_utf8(to_canonical_bytes(&value).unwrap()).unwrap();
        assert_eq!(out, "[\n  \"a\\nb\\\"c\"\n]\n");
    }
}
