//! Utility functions to handle the path part of an URL and the
//! slash-separated paths of the gateway namespace.
//!
use std::error::Error;

use http::StatusCode;
use percent_encoding::{self as pct, AsciiSet, NON_ALPHANUMERIC};

use crate::DavError;

// Encode all non-unreserved characters, except '/'.
// See RFC3986, and https://en.wikipedia.org/wiki/Percent-encoding .
const ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Error returned when parsing a request path.
#[derive(Debug)]
pub enum ParseError {
    /// cannot parse
    InvalidPath,
    /// too many dotdots
    ForbiddenPath,
}

impl Error for ParseError {}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<ParseError> for DavError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::InvalidPath => DavError::InvalidPath,
            ParseError::ForbiddenPath => DavError::Status(StatusCode::FORBIDDEN),
        }
    }
}

// a decoded segment can contain any value except '/' or '\0'
fn valid_segment(src: &[u8]) -> Result<(), ParseError> {
    let mut p = pct::percent_decode(src);
    if p.any(|x| x == 0 || x == b'/') {
        return Err(ParseError::InvalidPath);
    }
    Ok(())
}

/// Percent-encode a path, leaving the slashes alone.
pub fn encode_path(src: &str) -> String {
    pct::utf8_percent_encode(src, ENCODE_SET).to_string()
}

// make request path safe:
// - raw path before decoding can contain only printable ascii
// - make sure path is absolute
// - remove query part (everything after ?)
// - merge consecutive slashes
// - process . and ..
// - decode percent encoded bytes, fail on invalid encodings.
// - do not allow NUL or '/' in segments.
// A trailing slash is dropped.
pub(crate) fn normalize_path(rp: &str) -> Result<String, ParseError> {
    let rp = rp.as_bytes();
    if rp.iter().any(|&x| !(32..=126).contains(&x)) {
        return Err(ParseError::InvalidPath);
    }

    // don't allow fragments. query part gets deleted.
    let mut rawpath = rp;
    if let Some(pos) = rawpath.iter().position(|&x| x == b'?' || x == b'#') {
        if rawpath[pos] == b'#' {
            return Err(ParseError::InvalidPath);
        }
        rawpath = &rawpath[..pos];
    }

    if rawpath.is_empty() || rawpath[0] != b'/' {
        return Err(ParseError::InvalidPath);
    }

    let mut v: Vec<&[u8]> = Vec::new();
    for segment in rawpath.split(|c| *c == b'/') {
        match segment {
            b"." | b"" => {}
            b".." => {
                if v.is_empty() {
                    return Err(ParseError::ForbiddenPath);
                }
                v.pop();
            }
            s => {
                valid_segment(s)?;
                v.push(s);
            }
        }
    }
    let mut out = Vec::new();
    for s in &v {
        out.push(b'/');
        out.extend(pct::percent_decode(s));
    }
    if out.is_empty() {
        out.push(b'/');
    }
    String::from_utf8(out).map_err(|_| ParseError::InvalidPath)
}

/// Lexical cleanup of a slash separated path: merge slashes, resolve
/// `.` and `..`, drop the trailing slash. The result of cleaning an
/// absolute path is absolute.
pub fn clean(p: &str) -> String {
    let rooted = p.starts_with('/');
    let mut v: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if v.last().map(|s| *s != "..").unwrap_or(false) {
                    v.pop();
                } else if !rooted {
                    v.push("..");
                }
            }
            s => v.push(s),
        }
    }
    let joined = v.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Join and clean.
pub fn join(a: &str, b: &str) -> String {
    if a.is_empty() {
        return clean(b);
    }
    clean(&format!("{}/{}", a, b))
}

/// Split off the first segment of a path.
///
/// `/a/b/c` yields `("a", "/b/c")`, `/a` yields `("a", "/")`.
pub fn shift_path(p: &str) -> (String, String) {
    let p = clean(&format!("/{}", p));
    let rest = &p[1..];
    match rest.find('/') {
        Some(i) => (rest[..i].to_string(), rest[i..].to_string()),
        None => (rest.to_string(), "/".to_string()),
    }
}

/// Last element of a path.
pub fn basename(p: &str) -> &str {
    let p = p.trim_end_matches('/');
    match p.rfind('/') {
        Some(i) => &p[i + 1..],
        None => p,
    }
}

/// Everything but the last element of a path.
pub fn dirname(p: &str) -> String {
    let p = p.trim_end_matches('/');
    match p.rfind('/') {
        Some(0) => "/".to_string(),
        Some(i) => p[..i].to_string(),
        None => ".".to_string(),
    }
}

/// Is `child` equal to `parent` or below it.
pub fn is_subpath(parent: &str, child: &str) -> bool {
    let parent = parent.trim_end_matches('/');
    child == parent || child.starts_with(&format!("{}/", parent))
}

/// Guess a mime type from a file name.
pub(crate) fn mime_type(name: &str) -> &'static str {
    mime_guess::from_path(name)
        .first_raw()
        .unwrap_or("application/octet-stream")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize() {
        assert_eq!(normalize_path("/a//b/./c/").unwrap(), "/a/b/c");
        assert_eq!(normalize_path("/a/b/../c?x=y").unwrap(), "/a/c");
        assert_eq!(normalize_path("/h%C3%A9llo%20w").unwrap(), "/héllo w");
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert!(matches!(normalize_path("/.."), Err(ParseError::ForbiddenPath)));
        assert!(matches!(normalize_path("/a#b"), Err(ParseError::InvalidPath)));
        assert!(matches!(normalize_path("/a%2Fb"), Err(ParseError::InvalidPath)));
        assert!(matches!(normalize_path("a/b"), Err(ParseError::InvalidPath)));
    }

    #[test]
    fn shift() {
        assert_eq!(shift_path("/a/b/c"), ("a".to_string(), "/b/c".to_string()));
        assert_eq!(shift_path("/a"), ("a".to_string(), "/".to_string()));
        assert_eq!(shift_path("/"), ("".to_string(), "/".to_string()));
        assert_eq!(shift_path("a//b/"), ("a".to_string(), "/b".to_string()));
    }

    #[test]
    fn join_and_names() {
        assert_eq!(join("/users/alice", "/x/y"), "/users/alice/x/y");
        assert_eq!(join("/users/alice", "/"), "/users/alice");
        assert_eq!(join(".", "/x"), "x");
        assert_eq!(clean("./a/../b"), "b");
        assert_eq!(basename("/a/b/"), "b");
        assert_eq!(dirname("/a/b"), "/a");
        assert_eq!(dirname("/a"), "/");
        assert!(is_subpath("/a/b", "/a/b/c"));
        assert!(is_subpath("/a/b/", "/a/b"));
        assert!(!is_subpath("/a/b", "/a/bc"));
    }

    #[test]
    fn encode() {
        assert_eq!(encode_path("/a b/ü#?"), "/a%20b/%C3%BC%23%3F");
        assert_eq!(encode_path("/x-y_z.~"), "/x-y_z.~");
    }
}
