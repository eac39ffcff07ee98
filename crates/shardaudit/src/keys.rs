//! Well-known keyspaces and key arithmetic.
//!
//! The shard directory lives under `\xff/keyServers/`, replica registrations
//! under `\xff/serverList/`, and cluster configuration under `\xff/conf/`.
//! Directory ranges are stored as a range map: a row at `prefix + k` means its
//! value applies from `k` up to the next row's key.

use crate::model::{KeyValue, Uid};

/// Opaque ordered byte-sequence key. Total order is lexicographic.
pub type Key = Vec<u8>;

/// Half-open key range `[begin, end)`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KeyRange {
    pub begin: Key,
    pub end: Key,
}

impl KeyRange {
    pub fn new(begin: impl Into<Key>, end: impl Into<Key>) -> Self {
        Self {
            begin: begin.into(),
            end: end.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.begin.as_slice() && key < self.end.as_slice()
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", printable(&self.begin), printable(&self.end))
    }
}

/// Prefix of the shard-to-team directory.
pub const KEY_SERVERS_PREFIX: &[u8] = b"\xff/keyServers/";
/// Prefix of the replica registration directory.
pub const SERVER_LIST_PREFIX: &[u8] = b"\xff/serverList/";
/// Prefix of the cluster configuration keyspace.
pub const CONFIG_PREFIX: &[u8] = b"\xff/conf/";

/// The user keyspace; system keys live above `\xff`.
pub fn all_keys() -> KeyRange {
    KeyRange::new(b"".to_vec(), b"\xff".to_vec())
}

/// The raw span of the shard directory keyspace.
pub fn key_servers_keys() -> KeyRange {
    KeyRange::new(KEY_SERVERS_PREFIX.to_vec(), prefix_end(KEY_SERVERS_PREFIX))
}

/// The raw span of the configuration keyspace.
pub fn config_keys() -> KeyRange {
    KeyRange::new(CONFIG_PREFIX.to_vec(), prefix_end(CONFIG_PREFIX))
}

/// Directory key for one key-space boundary.
pub fn key_servers_key_for(key: &[u8]) -> Key {
    with_prefix(KEY_SERVERS_PREFIX, key)
}

/// Directory key for one replica registration.
pub fn server_list_key_for(id: Uid) -> Key {
    let mut out = SERVER_LIST_PREFIX.to_vec();
    out.extend_from_slice(id.to_string().as_bytes());
    out
}

pub fn with_prefix(prefix: &[u8], key: &[u8]) -> Key {
    let mut out = Vec::with_capacity(prefix.len() + key.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(key);
    out
}

pub fn strip_prefix<'a>(prefix: &[u8], key: &'a [u8]) -> Option<&'a [u8]> {
    key.strip_prefix(prefix)
}

/// First key strictly greater than every key with this prefix.
///
/// Increments the rightmost byte below 0xff and truncates the rest; an
/// all-0xff prefix has no such key.
pub fn prefix_end(prefix: &[u8]) -> Key {
    let mut out = prefix.to_vec();
    while let Some(last) = out.last().copied() {
        if last < 0xff {
            *out.last_mut().unwrap() = last + 1;
            return out;
        }
        out.pop();
    }
    // An unbounded prefix maps to the top of the keyspace.
    vec![0xff; prefix.len().max(1)]
}

/// First key strictly greater than `key`.
pub fn key_after(key: &[u8]) -> Key {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.extend_from_slice(key);
    out.push(0x00);
    out
}

/// Render a key for diagnostics, escaping non-printable bytes as `\xNN`.
pub fn printable(key: &[u8]) -> String {
    let mut out = String::with_capacity(key.len());
    for &b in key {
        if (0x20..0x7f).contains(&b) && b != b'\\' {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\x{b:02x}"));
        }
    }
    out
}

/// Reconstruct range-map rows for `range` from one paginated raw read.
///
/// The first result row is pinned to `range.begin` with the value of the first
/// raw row; raw rows strictly inside the span are passed through with the map
/// prefix stripped; when the read is complete a terminating row at `range.end`
/// carries the value of the last raw row.
pub fn krm_decode_ranges(
    map_prefix: &[u8],
    range: &KeyRange,
    data: &[KeyValue],
    more: bool,
) -> Vec<KeyValue> {
    let prefixed_begin = with_prefix(map_prefix, &range.begin);
    let prefixed_end = with_prefix(map_prefix, &range.end);

    let begin_value = data
        .first()
        .filter(|kv| kv.key.starts_with(map_prefix))
        .map(|kv| kv.value.clone())
        .unwrap_or_default();
    let end_value = data
        .last()
        .filter(|kv| kv.key.starts_with(map_prefix))
        .map(|kv| kv.value.clone())
        .unwrap_or_default();

    let mut complete = !more;
    let mut result = vec![KeyValue {
        key: range.begin.clone(),
        value: begin_value,
    }];

    for kv in data {
        if kv.key > prefixed_begin && kv.key < prefixed_end {
            let key = strip_prefix(map_prefix, &kv.key)
                .expect("range-map row outside its prefix")
                .to_vec();
            result.push(KeyValue {
                key,
                value: kv.value.clone(),
            });
        } else if kv.key >= prefixed_end {
            complete = true;
        }
    }

    if complete {
        result.push(KeyValue {
            key: range.end.clone(),
            value: end_value,
        });
    }

    result
}

/// Encode boundary-aligned range-map rows into raw directory rows.
///
/// `rows` must start at `range.begin` and end with the terminating row at
/// `range.end`.
pub fn krm_encode_ranges(map_prefix: &[u8], range: &KeyRange, rows: &[KeyValue]) -> Vec<KeyValue> {
    assert!(rows.len() >= 2, "range map needs begin and end boundaries");
    assert_eq!(rows[0].key, range.begin);
    assert_eq!(rows[rows.len() - 1].key, range.end);

    rows.iter()
        .map(|kv| KeyValue {
            key: with_prefix(map_prefix, &kv.key),
            value: kv.value.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn kv(key: &[u8], value: &[u8]) -> KeyValue {
        KeyValue {
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    #[test]
    fn prefix_end_increments_last_byte() {
        assert_eq!(prefix_end(b"abc"), b"abd".to_vec());
        assert_eq!(prefix_end(b"a\xff"), b"b".to_vec());
        assert_eq!(prefix_end(KEY_SERVERS_PREFIX).last(), Some(&b'0'));
    }

    #[test]
    fn key_after_sorts_immediately_after() {
        let k = b"shard".to_vec();
        let after = key_after(&k);
        assert!(after > k);
        assert!(after < b"shard\x01".to_vec());
    }

    #[test]
    fn decode_pins_boundaries_and_strips_prefix() {
        let range = KeyRange::new(b"".to_vec(), b"\xff".to_vec());
        let raw = vec![
            kv(&with_prefix(KEY_SERVERS_PREFIX, b""), b"t0"),
            kv(&with_prefix(KEY_SERVERS_PREFIX, b"m"), b"t1"),
            kv(&with_prefix(KEY_SERVERS_PREFIX, b"\xff"), b""),
        ];
        let rows = krm_decode_ranges(KEY_SERVERS_PREFIX, &range, &raw, false);
        assert_eq!(
            rows,
            vec![kv(b"", b"t0"), kv(b"m", b"t1"), kv(b"\xff", b"")]
        );
    }

    #[test]
    fn decode_partial_page_omits_terminator() {
        let range = KeyRange::new(b"".to_vec(), b"\xff".to_vec());
        let raw = vec![
            kv(&with_prefix(KEY_SERVERS_PREFIX, b""), b"t0"),
            kv(&with_prefix(KEY_SERVERS_PREFIX, b"g"), b"t1"),
        ];
        let rows = krm_decode_ranges(KEY_SERVERS_PREFIX, &range, &raw, true);
        assert_eq!(rows, vec![kv(b"", b"t0"), kv(b"g", b"t1")]);
    }

    #[test]
    fn decode_treats_row_at_end_as_completion() {
        // A raw row at or past the span end finishes the map even when the
        // storage reply claimed more data.
        let range = KeyRange::new(b"a".to_vec(), b"m".to_vec());
        let raw = vec![
            kv(&with_prefix(KEY_SERVERS_PREFIX, b"a"), b"t0"),
            kv(&with_prefix(KEY_SERVERS_PREFIX, b"m"), b"t9"),
        ];
        let rows = krm_decode_ranges(KEY_SERVERS_PREFIX, &range, &raw, true);
        assert_eq!(rows, vec![kv(b"a", b"t0"), kv(b"m", b"t9")]);
    }

    proptest! {
        #[test]
        fn encode_decode_round_trips(
            boundaries in proptest::collection::btree_set(
                proptest::collection::vec(0u8..0xff, 1..6),
                1..8,
            ),
            values in proptest::collection::vec(".{0,8}", 10),
        ) {
            let range = all_keys();
            let mut rows = vec![kv(b"", values[0].as_bytes())];
            for (i, b) in boundaries.iter().enumerate() {
                rows.push(kv(b, values[(i + 1) % values.len()].as_bytes()));
            }
            rows.push(kv(b"\xff", b""));

            let raw = krm_encode_ranges(KEY_SERVERS_PREFIX, &range, &rows);
            let decoded = krm_decode_ranges(KEY_SERVERS_PREFIX, &range, &raw, false);
            prop_assert_eq!(decoded, rows);
        }
    }
}
