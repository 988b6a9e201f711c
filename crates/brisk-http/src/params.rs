//! Request parameter values.
//!
//! Query strings, urlencoded bodies and JSON bodies all land in one
//! recursive value tree owned by the request.  Names using the `a[b]` /
//! `a[]` convention nest; everything else stays a flat string.

use std::collections::BTreeMap;

/// A parsed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(i) => Some(*i),
            ParamValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        match self {
            ParamValue::Map(map) => map.get(key),
            _ => None,
        }
    }
}

/// Percent-decode; `+` becomes a space when `form` is set (query/form data),
/// stays literal otherwise (paths).
pub fn percent_decode(input: &[u8], form: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'%' => {
                match (hex_val(input.get(i + 1)), hex_val(input.get(i + 2))) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' if form => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

fn hex_val(b: Option<&u8>) -> Option<u8> {
    match b? {
        b @ b'0'..=b'9' => Some(b - b'0'),
        b @ b'a'..=b'f' => Some(b - b'a' + 10),
        b @ b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Parse a query string (or urlencoded body) into a parameter map.
pub fn parse_query(input: &[u8]) -> BTreeMap<String, ParamValue> {
    let mut root = BTreeMap::new();
    for pair in input.split(|&b| b == b'&') {
        if pair.is_empty() {
            continue;
        }
        let (name, value) = match pair.iter().position(|&b| b == b'=') {
            Some(idx) => (&pair[..idx], &pair[idx + 1..]),
            None => (pair, &b""[..]),
        };
        let name = String::from_utf8_lossy(&percent_decode(name, true)).into_owned();
        let value = String::from_utf8_lossy(&percent_decode(value, true)).into_owned();
        insert_nested(&mut root, &name, ParamValue::String(value));
    }
    root
}

/// Insert `name` into the tree, splitting `a[b][c]` / `a[]` segments.
fn insert_nested(root: &mut BTreeMap<String, ParamValue>, name: &str, value: ParamValue) {
    let Some(open) = name.find('[') else {
        root.insert(name.to_owned(), value);
        return;
    };
    let (head, rest) = name.split_at(open);
    let Some(segments) = parse_segments(rest) else {
        // Unbalanced brackets: treat the whole thing as a flat name.
        root.insert(name.to_owned(), value);
        return;
    };

    let node = root
        .entry(head.to_owned())
        .or_insert_with(|| ParamValue::Map(BTreeMap::new()));
    insert_at(node, &segments, value);
}

fn insert_at(node: &mut ParamValue, segments: &[Segment<'_>], value: ParamValue) {
    let Some((segment, rest)) = segments.split_first() else {
        *node = value;
        return;
    };
    match segment {
        Segment::Append => {
            if !matches!(node, ParamValue::List(_)) {
                *node = ParamValue::List(Vec::new());
            }
            let ParamValue::List(list) = node else {
                unreachable!()
            };
            if rest.is_empty() {
                list.push(value);
            } else {
                list.push(ParamValue::Map(BTreeMap::new()));
                let child = list.last_mut().expect("just pushed");
                insert_at(child, rest, value);
            }
        }
        Segment::Key(key) => {
            if !matches!(node, ParamValue::Map(_)) {
                *node = ParamValue::Map(BTreeMap::new());
            }
            let ParamValue::Map(map) = node else {
                unreachable!()
            };
            let child = map
                .entry((*key).to_owned())
                .or_insert_with(|| ParamValue::Map(BTreeMap::new()));
            insert_at(child, rest, value);
        }
    }
}

enum Segment<'a> {
    Key(&'a str),
    Append,
}

fn parse_segments(mut rest: &str) -> Option<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return None;
        }
        let close = rest.find(']')?;
        let inner = &rest[1..close];
        segments.push(if inner.is_empty() {
            Segment::Append
        } else {
            Segment::Key(inner)
        });
        rest = &rest[close + 1..];
    }
    Some(segments)
}

/// Convert a JSON body into the same tree the query parser produces.
pub fn from_json(value: serde_json::Value) -> ParamValue {
    match value {
        serde_json::Value::Null => ParamValue::Null,
        serde_json::Value::Bool(b) => ParamValue::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ParamValue::Int(i)
            } else {
                ParamValue::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => ParamValue::String(s),
        serde_json::Value::Array(items) => {
            ParamValue::List(items.into_iter().map(from_json).collect())
        }
        serde_json::Value::Object(map) => ParamValue::Map(
            map.into_iter().map(|(k, v)| (k, from_json(v))).collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_decoding_handles_escapes_and_plus() {
        assert_eq!(percent_decode(b"a%20b", false), b"a b");
        assert_eq!(percent_decode(b"a+b", true), b"a b");
        assert_eq!(percent_decode(b"a+b", false), b"a+b");
        // Truncated escapes pass through.
        assert_eq!(percent_decode(b"100%", false), b"100%");
        assert_eq!(percent_decode(b"%zz", false), b"%zz");
    }

    #[test]
    fn flat_pairs_parse_to_strings() {
        let params = parse_query(b"name=alice&age=30&flag");
        assert_eq!(params["name"].as_str(), Some("alice"));
        assert_eq!(params["age"].as_str(), Some("30"));
        assert_eq!(params["flag"].as_str(), Some(""));
    }

    #[test]
    fn bracket_names_nest() {
        let params = parse_query(b"user[name]=bob&user[tags][]=a&user[tags][]=b");
        let user = &params["user"];
        assert_eq!(user.get("name").and_then(ParamValue::as_str), Some("bob"));
        match user.get("tags") {
            Some(ParamValue::List(tags)) => {
                assert_eq!(tags.len(), 2);
                assert_eq!(tags[0].as_str(), Some("a"));
            }
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn json_bodies_map_to_the_same_tree() {
        let value: serde_json::Value =
            serde_json::from_str(r#"{"n": 3, "f": 1.5, "ok": true, "items": [null, "x"]}"#)
                .unwrap();
        let tree = from_json(value);
        assert_eq!(tree.get("n"), Some(&ParamValue::Int(3)));
        assert_eq!(tree.get("f"), Some(&ParamValue::Float(1.5)));
        assert_eq!(tree.get("ok"), Some(&ParamValue::Bool(true)));
        match tree.get("items") {
            Some(ParamValue::List(items)) => {
                assert_eq!(items[0], ParamValue::Null);
                assert_eq!(items[1].as_str(), Some("x"));
            }
            other => panic!("expected list, got {other:?}"),
        }
    }
}
