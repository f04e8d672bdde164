//! Text wire format spoken by the agent.
//!
//! Response bodies are newline-delimited and made of four primitives:
//!
//! - sized string: `<length>\n<value>\n`, length in UTF-16 code units
//! - string array: `<count>\n` followed by `count` plain lines
//! - line: one raw newline-terminated line
//! - number: a line holding a decimal integer or the literal `null`
//!
//! Decoding never fails hard. Malformed headers and short bodies produce
//! `None` so that callers can keep whatever was decoded so far.
//!
//! Requests carry their parameters in the query string, see [`QueryParams`].

use super::model::{
    ActionHistoryRecord, ActionOutcome, CatalogEntry, CatalogPage, HybridInfo, SearchResult,
};

fn trim_cr(line: &str) -> &str {
    line.strip_suffix('\r').unwrap_or(line)
}

fn parse_number(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw == "null" {
        return None;
    }
    raw.parse().ok()
}

/// Cursor over an agent response body.
#[derive(Debug, Clone, Copy)]
pub struct BodyReader<'a> {
    rest: &'a str,
}

impl<'a> BodyReader<'a> {
    pub fn new(body: &'a str) -> Self {
        Self { rest: body }
    }

    /// Text not consumed yet.
    pub fn remaining(&self) -> &'a str {
        self.rest
    }

    /// True once only whitespace is left.
    pub fn is_exhausted(&self) -> bool {
        self.rest.trim().is_empty()
    }

    fn split_line(&self) -> Option<(&'a str, &'a str)> {
        if self.rest.is_empty() {
            return None;
        }
        Some(self.rest.split_once('\n').unwrap_or((self.rest, "")))
    }

    /// Reads a sized string.
    ///
    /// A header that is not a valid count leaves the cursor untouched. A body
    /// shorter than announced consumes everything and yields `None`.
    pub fn read_sized_string(&mut self) -> Option<&'a str> {
        let (header, after) = self.split_line()?;
        let len: usize = header.trim().parse().ok()?;

        let end = if len == 0 {
            0
        } else {
            // A surrogate pair cut in half by the count is kept whole.
            let mut units = 0;
            let end = after.char_indices().find_map(|(offset, ch)| {
                units += ch.len_utf16();
                (units >= len).then_some(offset + ch.len_utf8())
            });
            let Some(end) = end else {
                self.rest = "";
                return None;
            };
            end
        };

        let (value, tail) = after.split_at(end);
        self.rest = tail.strip_prefix('\n').unwrap_or(tail);
        Some(value)
    }

    /// Reads a counted array of plain lines.
    pub fn read_string_array(&mut self) -> Option<Vec<String>> {
        let (header, mut after) = self.split_line()?;
        let count: usize = header.trim().parse().ok()?;

        let mut items = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            if after.is_empty() {
                self.rest = "";
                return None;
            }
            let (line, next) = after.split_once('\n').unwrap_or((after, ""));
            items.push(trim_cr(line).to_string());
            after = next;
        }
        self.rest = after;
        Some(items)
    }

    pub fn read_line(&mut self) -> Option<&'a str> {
        let (line, after) = self.split_line()?;
        self.rest = after;
        Some(trim_cr(line))
    }

    /// Reads a number line; `null` and non-numeric content are `None`.
    pub fn read_number(&mut self) -> Option<i64> {
        self.read_line().and_then(parse_number)
    }

    /// Reads a `true`/`false` line. Anything but `true` is `false`.
    pub fn read_flag(&mut self) -> bool {
        self.read_line() == Some("true")
    }

    pub fn read_hybrid_info(&mut self) -> HybridInfo {
        let version_name = self.read_sized_string().unwrap_or_default().to_string();
        let for_uninstall = self.read_flag();
        let install_date = self.read_number();
        let release_date = self.read_number();
        let description = self.read_sized_string().map(str::to_string);
        HybridInfo {
            version_name,
            for_uninstall,
            install_date,
            release_date,
            description,
        }
    }

    /// Reads one product record. The cursor always moves past the record;
    /// `None` means none of its three leading strings could be read.
    pub fn read_search_result(&mut self) -> Option<SearchResult> {
        let product_name = self.read_sized_string();
        let current_version = self.read_sized_string();
        let install_path = self.read_sized_string();
        let readable =
            product_name.is_some() || current_version.is_some() || install_path.is_some();
        let features = self.read_string_array().unwrap_or_default();
        let hybrid_count = self.read_number().unwrap_or(0).max(0);

        let mut hybrids = Vec::new();
        for _ in 0..hybrid_count {
            if self.is_exhausted() {
                break;
            }
            hybrids.push(self.read_hybrid_info());
        }

        readable.then(|| SearchResult {
            product_name: product_name.unwrap_or_default().to_string(),
            current_version: current_version.unwrap_or_default().to_string(),
            install_path: install_path.unwrap_or_default().to_string(),
            features,
            hybrids,
        })
    }

    pub fn read_catalog_entry(&mut self) -> CatalogEntry {
        let release_date = self.read_number();
        let product_name = self.read_sized_string().unwrap_or_default().to_string();
        let version = self.read_sized_string().unwrap_or_default().to_string();
        let description = self.read_sized_string().unwrap_or_default().to_string();
        let download_file_name = self.read_sized_string().unwrap_or_default().to_string();
        CatalogEntry {
            product_name,
            version,
            description,
            download_file_name,
            release_date,
        }
    }

    /// Reads records until the body is exhausted or stops making progress.
    fn read_records<T>(&mut self, mut read: impl FnMut(&mut Self) -> Option<T>) -> Vec<T> {
        let mut records = Vec::new();
        while !self.is_exhausted() {
            let before = self.rest.len();
            let record = read(self);
            if self.rest.len() == before {
                break;
            }
            records.extend(record);
        }
        records
    }
}

/// Decodes a `search_results` body.
pub fn decode_search_results(body: &str) -> Vec<SearchResult> {
    BodyReader::new(body).read_records(BodyReader::read_search_result)
}

/// Decodes a `fetch_catalog` body: a leading page count, then entries.
pub fn decode_catalog_page(body: &str) -> CatalogPage {
    let mut reader = BodyReader::new(body);
    let page_count = reader.read_number();
    let entries = reader.read_records(|reader| Some(reader.read_catalog_entry()));
    CatalogPage {
        page_count,
        entries,
    }
}

/// Parses one `name;timestamp;prev;target;f1,f2;downgrade;status` line.
pub fn parse_history_line(line: &str) -> Option<ActionHistoryRecord> {
    let fields: Vec<&str> = trim_cr(line).split(';').collect();
    let [name, date, previous, target, features, downgrade, status] = fields.as_slice() else {
        return None;
    };

    Some(ActionHistoryRecord {
        product_name: (*name).to_string(),
        action_date: parse_number(date),
        previous_version: (*previous).to_string(),
        target_version: (*target).to_string(),
        features: features
            .split(',')
            .filter(|feature| !feature.is_empty())
            .map(str::to_string)
            .collect(),
        downgrade: *downgrade == "true",
        status: parse_number(status)
            .and_then(|code| i32::try_from(code).ok())
            .map(ActionOutcome::from_code),
    })
}

/// Parses one `index=outcomeCode` line of an `action_results` body.
pub fn parse_action_result_line(line: &str) -> Option<(usize, i32)> {
    let (index, code) = trim_cr(line).split_once('=')?;
    if code.contains('=') {
        return None;
    }
    Some((index.trim().parse().ok()?, code.trim().parse().ok()?))
}

/// Builds bodies in the agent's format. Mirror of [`BodyReader`].
#[derive(Debug, Default)]
pub struct BodyWriter {
    buf: String,
}

impl BodyWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sized_string(&mut self, value: &str) -> &mut Self {
        self.buf.push_str(&value.encode_utf16().count().to_string());
        self.buf.push('\n');
        self.buf.push_str(value);
        self.buf.push('\n');
        self
    }

    pub fn string_array<S: AsRef<str>>(&mut self, items: &[S]) -> &mut Self {
        self.line(&items.len().to_string());
        for item in items {
            self.line(item.as_ref());
        }
        self
    }

    pub fn line(&mut self, line: &str) -> &mut Self {
        self.buf.push_str(line);
        self.buf.push('\n');
        self
    }

    pub fn number(&mut self, value: Option<i64>) -> &mut Self {
        match value {
            Some(value) => self.line(&value.to_string()),
            None => self.line("null"),
        }
    }

    pub fn flag(&mut self, value: bool) -> &mut Self {
        self.line(if value { "true" } else { "false" })
    }

    pub fn hybrid_info(&mut self, info: &HybridInfo) -> &mut Self {
        self.sized_string(&info.version_name)
            .flag(info.for_uninstall)
            .number(info.install_date)
            .number(info.release_date)
            .sized_string(info.description.as_deref().unwrap_or_default())
    }

    pub fn search_result(&mut self, result: &SearchResult) -> &mut Self {
        self.sized_string(&result.product_name)
            .sized_string(&result.current_version)
            .sized_string(&result.install_path)
            .string_array(&result.features)
            .number(i64::try_from(result.hybrids.len()).ok());
        for hybrid in &result.hybrids {
            self.hybrid_info(hybrid);
        }
        self
    }

    pub fn catalog_entry(&mut self, entry: &CatalogEntry) -> &mut Self {
        self.number(entry.release_date)
            .sized_string(&entry.product_name)
            .sized_string(&entry.version)
            .sized_string(&entry.description)
            .sized_string(&entry.download_file_name)
    }

    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.buf)
    }
}

/// Ordered query parameters of one agent request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(&'static str, String)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &'static str, value: impl Into<String>) {
        self.pairs.push((name, value.into()));
    }

    /// Adds the parameter only when a value is present.
    pub fn push_opt(&mut self, name: &'static str, value: Option<impl Into<String>>) {
        if let Some(value) = value {
            self.push(name, value);
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.pairs.iter().map(|(key, value)| (*key, value.as_str()))
    }

    /// Renders `?a=1&b=2` with every component percent-encoded, or an empty
    /// string when there are no parameters.
    pub fn to_query_string(&self) -> String {
        let mut out = String::new();
        for (position, (name, value)) in self.pairs.iter().enumerate() {
            out.push(if position == 0 { '?' } else { '&' });
            out.push_str(&urlencoding::encode(name));
            out.push('=');
            out.push_str(&urlencoding::encode(value));
        }
        out
    }
}
