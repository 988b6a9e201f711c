//! An ordered, case-insensitive header multimap.
//!
//! Names are lowercased at insert so lookups are byte comparisons and the
//! HTTP/2-style canonical form is free.  Insertion order is preserved, which
//! keeps response serialization deterministic and lets serialize→parse
//! round-trip the header list.

use bytes::Bytes;

#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(Bytes, Bytes)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        HeaderMap {
            entries: Vec::new(),
        }
    }

    fn lower(name: &[u8]) -> Bytes {
        if name.iter().any(u8::is_ascii_uppercase) {
            Bytes::from(name.to_ascii_lowercase())
        } else {
            Bytes::copy_from_slice(name)
        }
    }

    /// Append a value; repeated names accumulate.
    pub fn append(&mut self, name: &[u8], value: impl Into<Bytes>) {
        self.entries.push((Self::lower(name), value.into()));
    }

    /// Replace every value under `name` with a single one.
    pub fn set(&mut self, name: &[u8], value: impl Into<Bytes>) {
        let lowered = Self::lower(name);
        self.entries.retain(|(n, _)| *n != lowered);
        self.entries.push((lowered, value.into()));
    }

    /// First value under `name` (lookups take any case).
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        let lowered = Self::lower(name.as_bytes());
        self.entries.iter().find(|(n, _)| *n == lowered).map(|(_, v)| v)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a Bytes> {
        let lowered = Self::lower(name.as_bytes());
        self.entries
            .iter()
            .filter(move |(n, _)| *n == lowered)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) {
        let lowered = Self::lower(name.as_bytes());
        self.entries.retain(|(n, _)| *n != lowered);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(name, value)` pairs in insertion order, names lowercased.
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Bytes)> {
        self.entries.iter().map(|(n, v)| (n, v))
    }

    /// Serialize as wire lines with canonical `Word-Word` casing.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            let start = out.len();
            out.extend_from_slice(name);
            canonicalize(&mut out[start..]);
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
    }
}

/// Uppercase the first letter of each dash-separated token in place.
fn canonicalize(name: &mut [u8]) {
    let mut upper_next = true;
    for byte in name.iter_mut() {
        if upper_next {
            byte.make_ascii_uppercase();
        }
        upper_next = *byte == b'-';
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_are_case_insensitive() {
        let mut map = HeaderMap::new();
        map.append(b"Content-Type", Bytes::from_static(b"text/plain"));
        assert_eq!(map.get_str("content-type"), Some("text/plain"));
        assert_eq!(map.get_str("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn repeated_names_accumulate_and_set_replaces() {
        let mut map = HeaderMap::new();
        map.append(b"set-cookie", Bytes::from_static(b"a=1"));
        map.append(b"set-cookie", Bytes::from_static(b"b=2"));
        assert_eq!(map.get_all("set-cookie").count(), 2);

        map.set(b"set-cookie", Bytes::from_static(b"c=3"));
        let all: Vec<_> = map.get_all("set-cookie").collect();
        assert_eq!(all.len(), 1);
        assert_eq!(&all[0][..], b"c=3");
    }

    #[test]
    fn serialization_preserves_order_with_canonical_casing() {
        let mut map = HeaderMap::new();
        map.append(b"x-first", Bytes::from_static(b"1"));
        map.append(b"content-length", Bytes::from_static(b"2"));
        map.append(b"etag", Bytes::from_static(b"\"abc\""));

        let mut out = Vec::new();
        map.write_to(&mut out);
        assert_eq!(
            out,
            b"X-First: 1\r\nContent-Length: 2\r\nEtag: \"abc\"\r\n"
        );
    }
}
