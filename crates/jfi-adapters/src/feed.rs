//! RSS 2.0 / RDF / Atom document parsing into loosely-typed records.

use std::collections::BTreeMap;

use jfi_core::RawRecord;
use quick_xml::escape::{resolve_predefined_entity, unescape};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed xml at byte {position}: {source}")]
    Xml {
        position: u64,
        #[source]
        source: quick_xml::Error,
    },
    #[error("document root `{0}` is not a syndication feed")]
    NotAFeed(String),
    #[error("document is empty")]
    Empty,
}

const FEED_ROOTS: [&str; 3] = ["rss", "feed", "rdf:RDF"];
const ENTRY_ELEMENTS: [&str; 2] = ["item", "entry"];

#[derive(Debug, Default)]
struct FieldFrame {
    name: String,
    text: String,
    attrs: Map<String, JsonValue>,
}

impl FieldFrame {
    fn open(start: &BytesStart<'_>) -> Self {
        Self {
            name: qualified_name(start),
            text: String::new(),
            attrs: attributes(start),
        }
    }

    fn into_value(self) -> (String, JsonValue) {
        let text = self.text.trim().to_string();
        if self.attrs.is_empty() {
            return (self.name, JsonValue::String(text));
        }
        let mut attrs = self.attrs;
        if !text.is_empty() {
            attrs.insert("#text".to_string(), JsonValue::String(text));
        }
        (self.name, JsonValue::Object(attrs))
    }
}

fn qualified_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.name().as_ref()).into_owned()
}

fn local_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.local_name().as_ref()).into_owned()
}

fn attributes(start: &BytesStart<'_>) -> Map<String, JsonValue> {
    start
        .attributes()
        .flatten()
        .filter(|attr| !attr.key.as_ref().starts_with(b"xmlns"))
        .map(|attr| {
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let raw = String::from_utf8_lossy(&attr.value).into_owned();
            let value = unescape(&raw).map(|v| v.into_owned()).unwrap_or(raw);
            (key, JsonValue::String(value))
        })
        .collect()
}

fn push_field(fields: &mut BTreeMap<String, JsonValue>, name: String, value: JsonValue) {
    match fields.get_mut(&name) {
        None => {
            fields.insert(name, value);
        }
        Some(JsonValue::Array(values)) => values.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = JsonValue::Array(vec![first, value]);
        }
    }
}

/// Parses every `<item>` (RSS/RDF) or `<entry>` (Atom) into a [`RawRecord`]
/// stamped with `source`. Child element names are kept qualified
/// (`dc:creator`, `job_listing:company`); repeated children collapse into an
/// array and attribute-carrying children become objects.
pub fn parse_feed_document(source: &str, xml: &str) -> Result<Vec<RawRecord>, ParseError> {
    // Text is not trimmed per event: entity references split text nodes.
    let mut reader = Reader::from_str(xml);

    let mut records = Vec::new();
    let mut depth = 0usize;
    let mut saw_root = false;
    // Depth of the open entry element, if any.
    let mut entry_depth: Option<usize> = None;
    let mut current: Option<RawRecord> = None;
    let mut frame: Option<FieldFrame> = None;

    loop {
        let event = reader.read_event().map_err(|source| ParseError::Xml {
            position: reader.buffer_position() as u64,
            source,
        })?;

        match event {
            Event::Start(ref e) => {
                depth += 1;
                if !saw_root {
                    let root = qualified_name(e);
                    if !FEED_ROOTS.contains(&root.as_str()) {
                        return Err(ParseError::NotAFeed(root));
                    }
                    saw_root = true;
                    continue;
                }
                match entry_depth {
                    None if ENTRY_ELEMENTS.contains(&local_name(e).as_str()) => {
                        entry_depth = Some(depth);
                        current = Some(RawRecord::new(source));
                    }
                    Some(d) if depth == d + 1 => frame = Some(FieldFrame::open(e)),
                    // Nested markup inside a field contributes its text only.
                    _ => {}
                }
            }
            Event::Empty(ref e) => {
                if !saw_root {
                    let root = qualified_name(e);
                    if !FEED_ROOTS.contains(&root.as_str()) {
                        return Err(ParseError::NotAFeed(root));
                    }
                    saw_root = true;
                    continue;
                }
                if let (Some(d), Some(record)) = (entry_depth, current.as_mut()) {
                    if depth == d {
                        let (name, value) = FieldFrame::open(e).into_value();
                        push_field(&mut record.fields, name, value);
                    }
                }
            }
            Event::End(_) => {
                match entry_depth {
                    Some(d) if depth == d + 1 => {
                        if let (Some(done), Some(record)) = (frame.take(), current.as_mut()) {
                            let (name, value) = done.into_value();
                            push_field(&mut record.fields, name, value);
                        }
                    }
                    Some(d) if depth == d => {
                        entry_depth = None;
                        if let Some(record) = current.take() {
                            records.push(record);
                        }
                    }
                    _ => {}
                }
                depth = depth.saturating_sub(1);
            }
            Event::Text(e) => {
                if let Some(frame) = frame.as_mut() {
                    let raw = String::from_utf8_lossy(&e).into_owned();
                    let text = unescape(&raw).map(|v| v.into_owned()).unwrap_or(raw);
                    frame.text.push_str(&text);
                }
            }
            Event::CData(e) => {
                if let Some(frame) = frame.as_mut() {
                    frame.text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Event::GeneralRef(e) => {
                if let Some(frame) = frame.as_mut() {
                    if let Ok(Some(ch)) = e.resolve_char_ref() {
                        frame.text.push(ch);
                    } else {
                        let name = String::from_utf8_lossy(&e).into_owned();
                        if let Some(resolved) = resolve_predefined_entity(&name) {
                            frame.text.push_str(resolved);
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(ParseError::Empty);
    }
    Ok(records)
}
