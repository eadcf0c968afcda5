//! Line parsers for tracked source files
use serde::de::DeserializeOwned;
use std::marker::PhantomData;

/// Turns one line of a tracked file into a record.
///
/// `Ok(None)` means the line is valid but carries nothing to import;
/// `Err` marks it malformed. The tracker skips and counts malformed lines.
pub trait RecordParser {
    type Item;

    fn parse_line(&self, line: &str) -> anyhow::Result<Option<Self::Item>>;
}

/// One JSON document per line, deserialized straight into `T`
#[derive(Debug)]
pub struct JsonLinesParser<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonLinesParser<T> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> Default for JsonLinesParser<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonLinesParser<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> RecordParser for JsonLinesParser<T> {
    type Item = T;

    fn parse_line(&self, line: &str) -> anyhow::Result<Option<T>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(line)?))
    }
}
