use crate::model::ResourcePath;
use crate::util::assert::fail;

// Segment boundaries must sort before every other byte so that prefix scans
// over "foo" never pick up "foobar". 0x01 is reserved as the escape byte and
// 0x00/0x01 inside segments are escaped behind it.
const ESCAPE: u8 = 0x01;
const ENCODED_SEPARATOR: u8 = 0x01;
const ENCODED_NUL: u8 = 0x10;
const ENCODED_ESCAPE: u8 = 0x11;

/// Encodes a resource path for use as a storage key. Separators go between
/// segments and once at the end, so every encoded path is a strict prefix of
/// its descendants' encodings.
pub fn encode_resource_path(path: &ResourcePath) -> Vec<u8> {
    let mut out = Vec::new();
    for segment in path.segments() {
        if !out.is_empty() {
            write_separator(&mut out);
        }
        write_segment(segment, &mut out);
    }
    write_separator(&mut out);
    out
}

/// Decodes a storage key produced by [`encode_resource_path`]. Malformed
/// input can only come from corrupted storage, which is an invariant fault.
pub fn decode_resource_path(encoded: &[u8]) -> ResourcePath {
    if encoded.is_empty() {
        fail("Invalid empty encoded resource path");
    }
    let mut segments = Vec::new();
    let mut current = Vec::new();
    let mut saw_segment = false;
    let mut bytes = encoded.iter().peekable();
    while let Some(&byte) = bytes.next() {
        if byte != ESCAPE {
            current.push(byte);
            continue;
        }
        match bytes.next() {
            Some(&ENCODED_SEPARATOR) => {
                let segment = std::mem::take(&mut current);
                // The trailing separator after the final segment closes an
                // empty buffer unless the path itself is empty.
                if !segment.is_empty() || !saw_segment {
                    match String::from_utf8(segment) {
                        Ok(segment) if !segment.is_empty() => {
                            segments.push(segment);
                            saw_segment = true;
                        }
                        Ok(_) => {}
                        Err(_) => fail("Invalid UTF-8 in encoded resource path"),
                    }
                }
                saw_segment = true;
            }
            Some(&ENCODED_NUL) => current.push(0x00),
            Some(&ENCODED_ESCAPE) => current.push(ESCAPE),
            _ => fail("Invalid escape sequence in encoded resource path"),
        }
    }
    if !current.is_empty() {
        fail("Encoded resource path is missing its trailing separator");
    }
    ResourcePath::from_segments(segments)
}

/// The key immediately after every path having `path` as a prefix; used as
/// the exclusive end of prefix range scans.
pub fn prefix_successor(encoded_prefix: &[u8]) -> Vec<u8> {
    // The trailing separator is 0x01 0x01; bumping the last byte to 0x02
    // produces a key greater than every continuation of the prefix.
    let mut successor = encoded_prefix.to_vec();
    match successor.last_mut() {
        Some(last) => *last += 1,
        None => fail("Cannot take the successor of an empty encoded path"),
    }
    successor
}

fn write_segment(segment: &str, out: &mut Vec<u8>) {
    for &byte in segment.as_bytes() {
        match byte {
            0x00 => out.extend_from_slice(&[ESCAPE, ENCODED_NUL]),
            ESCAPE => out.extend_from_slice(&[ESCAPE, ENCODED_ESCAPE]),
            _ => out.push(byte),
        }
    }
}

fn write_separator(out: &mut Vec<u8>) {
    out.extend_from_slice(&[ESCAPE, ENCODED_SEPARATOR]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> ResourcePath {
        ResourcePath::from_string(s).unwrap()
    }

    fn round_trip(p: &ResourcePath) {
        assert_eq!(&decode_resource_path(&encode_resource_path(p)), p);
    }

    #[test]
    fn round_trips_plain_paths() {
        round_trip(&path(""));
        round_trip(&path("coll"));
        round_trip(&path("coll/doc"));
        round_trip(&path("coll/doc/sub/child"));
    }

    #[test]
    fn round_trips_segments_with_reserved_bytes() {
        round_trip(&ResourcePath::from_segments(["a\u{0001}b"]));
        round_trip(&ResourcePath::from_segments(["kitchen\u{0001}\u{0001}sink"]));
    }

    #[test]
    fn encoding_preserves_path_ordering() {
        let paths = [
            path(""),
            path("a"),
            path("a/b"),
            path("a/b/c"),
            path("ab"),
            path("b"),
            path("foo"),
            path("foo/doc"),
            path("foobar"),
        ];
        for pair in paths.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(
                encode_resource_path(&pair[0]) < encode_resource_path(&pair[1]),
                "encoding must preserve order of {} and {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn prefix_scans_cannot_leak_into_sibling_collections() {
        let foo = encode_resource_path(&path("foo"));
        let foo_doc = encode_resource_path(&path("foo/doc"));
        let foobar = encode_resource_path(&path("foobar"));
        let end = prefix_successor(&foo);
        assert!(foo < foo_doc && foo_doc < end);
        assert!(foobar > end);
    }
}
