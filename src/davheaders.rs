use std::str::FromStr;

use headers::Header;
use http::header::{HeaderName, HeaderValue};

use crate::gateway::ResourceInfo;

pub static DEPTH: HeaderName = HeaderName::from_static("depth");
pub static TIMEOUT: HeaderName = HeaderName::from_static("timeout");
pub static OVERWRITE: HeaderName = HeaderName::from_static("overwrite");
pub static DESTINATION: HeaderName = HeaderName::from_static("destination");
pub static SOURCE: HeaderName = HeaderName::from_static("source");
pub static ETAG: HeaderName = HeaderName::from_static("etag");
pub static IF: HeaderName = HeaderName::from_static("if");
pub static UPLOAD_LENGTH: HeaderName = HeaderName::from_static("upload-length");
pub static UPLOAD_OFFSET: HeaderName = HeaderName::from_static("upload-offset");
pub static UPLOAD_CHECKSUM: HeaderName = HeaderName::from_static("upload-checksum");
pub static UPLOAD_METADATA: HeaderName = HeaderName::from_static("upload-metadata");
pub static OC_CHECKSUM: HeaderName = HeaderName::from_static("oc-checksum");
pub static X_EXPECTED_ENTITY_LENGTH: HeaderName =
    HeaderName::from_static("x-expected-entity-length");

/// Header carrying the data-plane transfer token.
pub const X_REVA_TRANSFER: &str = "x-reva-transfer";
pub const OC_FILEID: &str = "oc-fileid";
pub const OC_ETAG: &str = "oc-etag";
pub const OC_PERM: &str = "oc-perm";
pub const OC_MTIME: &str = "oc-mtime";
pub const TUS_RESUMABLE: &str = "tus-resumable";
pub const TUS_VERSION: &str = "tus-version";
pub const TUS_EXTENSION: &str = "tus-extension";
pub const TUS_CHECKSUM_ALGORITHM: &str = "tus-checksum-algorithm";
pub const UPLOAD_EXPIRES: &str = "upload-expires";
pub const PREFER: &str = "prefer";
pub const PREFERENCE_APPLIED: &str = "preference-applied";
pub const TRANSFER_HEADER_AUTHORIZATION: &str = "transferheaderauthorization";

// helper.
fn one<'i, I>(values: &mut I) -> Result<&'i HeaderValue, headers::Error>
where
    I: Iterator<Item = &'i HeaderValue>,
{
    let v = values.next().ok_or_else(invalid)?;
    if values.next().is_some() {
        Err(invalid())
    } else {
        Ok(v)
    }
}

// helper
fn invalid() -> headers::Error {
    headers::Error::invalid()
}

// helper
fn map_invalid(_e: impl std::error::Error) -> headers::Error {
    headers::Error::invalid()
}

// helper, for values we build ourselves.
fn header_value(s: &str) -> HeaderValue {
    HeaderValue::from_str(s).unwrap_or_else(|_| HeaderValue::from_static(""))
}

macro_rules! header {
    ($tname:ident, $hname:ident, $sname:expr) => {
        pub static $hname: HeaderName = HeaderName::from_static($sname);

        #[derive(Debug, Clone, PartialEq)]
        pub struct $tname(pub String);

        impl Header for $tname {
            fn name() -> &'static HeaderName {
                &$hname
            }

            fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
            where
                I: Iterator<Item = &'i HeaderValue>,
            {
                one(values)?
                    .to_str()
                    .map(|x| $tname(x.to_owned()))
                    .map_err(map_invalid)
            }

            fn encode<E>(&self, values: &mut E)
            where
                E: Extend<HeaderValue>,
            {
                values.extend(std::iter::once(header_value(&self.0)))
            }
        }
    };
}

// Numeric headers. A value that does not parse is an error, so
// `typed_try_get` tells an invalid header from an absent one.
macro_rules! header_u64 {
    ($tname:ident, $hname:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq)]
        pub struct $tname(pub u64);

        impl Header for $tname {
            fn name() -> &'static HeaderName {
                &$hname
            }

            fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
            where
                I: Iterator<Item = &'i HeaderValue>,
            {
                let s = one(values)?.to_str().map_err(map_invalid)?;
                s.trim().parse::<u64>().map($tname).map_err(map_invalid)
            }

            fn encode<E>(&self, values: &mut E)
            where
                E: Extend<HeaderValue>,
            {
                values.extend(std::iter::once(HeaderValue::from(self.0)))
            }
        }
    };
}

header!(ContentType, CONTENT_TYPE, "content-type");
header!(LockToken, LOCK_TOKEN, "lock-token");
header!(IfMatch, IF_MATCH, "if-match");
header!(OcMtime, OC_MTIME_HDR, "oc-mtime");
header!(TusResumable, TUS_RESUMABLE_HDR, "tus-resumable");
header!(Prefer, PREFER_HDR, "prefer");
header_u64!(UploadLength, UPLOAD_LENGTH);
header_u64!(UploadOffset, UPLOAD_OFFSET);
header_u64!(XExpectedEntityLength, X_EXPECTED_ENTITY_LENGTH);

impl LockToken {
    /// The token without the angle brackets of a Coded-URL.
    pub fn token(&self) -> &str {
        let t = self.0.trim();
        if t.len() > 2 && t.starts_with('<') && t.ends_with('>') {
            &t[1..t.len() - 1]
        } else {
            t
        }
    }
}

impl Prefer {
    pub fn return_minimal(&self) -> bool {
        self.0
            .split(',')
            .any(|p| p.trim().eq_ignore_ascii_case("return=minimal"))
    }
}

/// Depth: header.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

impl Header for Depth {
    fn name() -> &'static HeaderName {
        &DEPTH
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = one(values)?;
        match value.as_bytes() {
            b"0" => Ok(Depth::Zero),
            b"1" => Ok(Depth::One),
            b"infinity" | b"Infinity" => Ok(Depth::Infinity),
            _ => Err(invalid()),
        }
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = match *self {
            Depth::Zero => "0",
            Depth::One => "1",
            Depth::Infinity => "infinity",
        };
        values.extend(std::iter::once(HeaderValue::from_static(value)));
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DavTimeout {
    Seconds(u32),
    Infinite,
}

/// Timeout: header. Only the first value is used; an empty value
/// means infinite.
#[derive(Debug, Clone, PartialEq)]
pub struct Timeout(pub DavTimeout);

impl Header for Timeout {
    fn name() -> &'static HeaderName {
        &TIMEOUT
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = one(values)?.to_str().map_err(map_invalid)?;
        let word = value.split(',').next().unwrap_or("").trim();
        let t = match word {
            "" | "Infinite" => DavTimeout::Infinite,
            _ => {
                let num = word.strip_prefix("Second-").ok_or_else(invalid)?;
                if !num.starts_with(|c: char| c.is_ascii_digit()) {
                    return Err(invalid());
                }
                DavTimeout::Seconds(num.parse::<u32>().map_err(map_invalid)?)
            }
        };
        Ok(Timeout(t))
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = match self.0 {
            DavTimeout::Seconds(n) => format!("Second-{}", n),
            DavTimeout::Infinite => "Infinite".to_string(),
        };
        values.extend(std::iter::once(header_value(&value)));
    }
}

/// Destination: header. Keeps the host of absolute URLs, so that
/// third-party push copies can tell a remote destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    pub origin: Option<String>,
    pub path: String,
}

fn decode_url(s: &str) -> Result<Destination, headers::Error> {
    let strip = |p: &str| p.split(['?', '#']).next().unwrap_or("").to_string();
    if s.starts_with('/') {
        return Ok(Destination {
            origin: None,
            path: strip(s),
        });
    }
    let rest = s
        .strip_prefix("http://")
        .or_else(|| s.strip_prefix("https://"))
        .ok_or_else(invalid)?;
    let idx = rest.find('/').ok_or_else(invalid)?;
    let origin_len = s.len() - rest.len() + idx;
    let path = strip(&s[origin_len..]);
    if path.is_empty() {
        return Err(invalid());
    }
    Ok(Destination {
        origin: Some(s[..origin_len].to_string()),
        path,
    })
}

impl Header for Destination {
    fn name() -> &'static HeaderName {
        &DESTINATION
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let s = one(values)?.to_str().map_err(map_invalid)?;
        decode_url(s.trim())
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let v = format!("{}{}", self.origin.as_deref().unwrap_or(""), self.path);
        values.extend(std::iter::once(header_value(&v)));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Overwrite(pub bool);

impl Header for Overwrite {
    fn name() -> &'static HeaderName {
        &OVERWRITE
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let line = one(values)?;
        match line.as_bytes() {
            b"F" => Ok(Overwrite(false)),
            b"T" => Ok(Overwrite(true)),
            _ => Err(invalid()),
        }
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = match self.0 {
            true => "T",
            false => "F",
        };
        values.extend(std::iter::once(HeaderValue::from_static(value)));
    }
}

/// Source: header of a third-party pull copy. Must be absolute.
#[derive(Debug, Clone, PartialEq)]
pub struct Source(pub url::Url);

impl Header for Source {
    fn name() -> &'static HeaderName {
        &SOURCE
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let s = one(values)?.to_str().map_err(map_invalid)?;
        url::Url::parse(s.trim()).map(Source).map_err(map_invalid)
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        values.extend(std::iter::once(header_value(self.0.as_str())));
    }
}

/// Entity tag inside an `If` header condition.
#[derive(Debug, Clone)]
pub struct ETag {
    tag: String,
    weak: bool,
}

impl FromStr for ETag {
    type Err = headers::Error;

    fn from_str(t: &str) -> Result<Self, Self::Err> {
        let (weak, s) = match t.strip_prefix("W/") {
            Some(s) => (true, s),
            None => (false, t),
        };
        let quoted = s.len() >= 2 && s.starts_with('"') && s.ends_with('"');
        if !quoted || s[1..s.len() - 1].contains('"') {
            return Err(invalid());
        }
        Ok(ETag {
            tag: t.to_owned(),
            weak,
        })
    }
}

// weak tags never match.
impl PartialEq for ETag {
    fn eq(&self, other: &Self) -> bool {
        !self.weak && !other.weak && self.tag == other.tag
    }
}

/// A checksum supplied by the client, normalized to lowercase algorithm.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientChecksum {
    pub algorithm: String,
    pub sum: String,
}

impl ClientChecksum {
    /// `"<alg> <sum>"` as forwarded to the gateway.
    pub fn normalized(&self) -> String {
        format!("{} {}", self.algorithm, self.sum)
    }
}

// `<alg><sep><hexsum>`
fn decode_checksum(s: &str, sep: char) -> Result<ClientChecksum, headers::Error> {
    let (alg, sum) = s.trim().split_once(sep).ok_or_else(invalid)?;
    let alg_ok = !alg.is_empty() && alg.chars().all(|c| c.is_ascii_alphanumeric());
    let sum_ok = !sum.is_empty() && sum.chars().all(|c| c.is_ascii_hexdigit());
    if !alg_ok || !sum_ok {
        return Err(invalid());
    }
    Ok(ClientChecksum {
        algorithm: alg.to_lowercase(),
        sum: sum.to_string(),
    })
}

/// Upload-Checksum: `<alg> <sum>`.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadChecksum(pub ClientChecksum);

/// OC-Checksum: `<alg>:<sum>`.
#[derive(Debug, Clone, PartialEq)]
pub struct OcChecksum(pub ClientChecksum);

impl Header for UploadChecksum {
    fn name() -> &'static HeaderName {
        &UPLOAD_CHECKSUM
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let s = one(values)?.to_str().map_err(map_invalid)?;
        decode_checksum(s, ' ').map(UploadChecksum)
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        values.extend(std::iter::once(header_value(&self.0.normalized())));
    }
}

impl Header for OcChecksum {
    fn name() -> &'static HeaderName {
        &OC_CHECKSUM
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let s = one(values)?.to_str().map_err(map_invalid)?;
        decode_checksum(s, ':').map(OcChecksum)
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let v = format!("{}:{}", self.0.algorithm, self.0.sum);
        values.extend(std::iter::once(header_value(&v)));
    }
}

/// Upload-Metadata: comma separated `key base64value` pairs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UploadMetadata(pub Vec<(String, String)>);

impl UploadMetadata {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl Header for UploadMetadata {
    fn name() -> &'static HeaderName {
        &UPLOAD_METADATA
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        use base64::Engine;
        let s = one(values)?.to_str().map_err(map_invalid)?;
        let mut v = Vec::new();
        for pair in s.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, value) = match pair.split_once(' ') {
                Some((k, val)) => (k, val.trim()),
                None => (pair, ""),
            };
            let value = base64::engine::general_purpose::STANDARD
                .decode(value)
                .map_err(map_invalid)?;
            let value = String::from_utf8(value).map_err(map_invalid)?;
            v.push((key.to_string(), value));
        }
        Ok(UploadMetadata(v))
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        use base64::Engine;
        let v = self
            .0
            .iter()
            .map(|(k, val)| {
                format!(
                    "{} {}",
                    k,
                    base64::engine::general_purpose::STANDARD.encode(val)
                )
            })
            .collect::<Vec<_>>()
            .join(",");
        values.extend(std::iter::once(header_value(&v)));
    }
}

// The "If" header contains IfLists, of which the results are ORed.
#[derive(Debug, Clone, PartialEq)]
pub struct If(pub Vec<IfList>);

// An IfList contains Conditions, of which the results are ANDed.
#[derive(Debug, Clone, PartialEq)]
pub struct IfList {
    pub resource_tag: Option<url::Url>,
    pub conditions: Vec<IfCondition>,
}

// helpers.
impl IfList {
    fn new() -> IfList {
        IfList {
            resource_tag: None,
            conditions: Vec::new(),
        }
    }
    fn add(&mut self, not: bool, item: IfItem) {
        self.conditions.push(IfCondition { not, item });
    }
}

// Single Condition is [NOT] State-Token | ETag
#[derive(Debug, Clone, PartialEq)]
pub struct IfCondition {
    pub not: bool,
    pub item: IfItem,
}
#[derive(Debug, Clone, PartialEq)]
pub enum IfItem {
    StateToken(String),
    ETag(ETag),
}

impl If {
    /// All state tokens that are not negated.
    pub fn lock_tokens(&self) -> Vec<&str> {
        self.0
            .iter()
            .flat_map(|l| l.conditions.iter())
            .filter(|c| !c.not)
            .filter_map(|c| match c.item {
                IfItem::StateToken(ref t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    /// The lock token to forward to the gateway.
    pub fn lock_token(&self) -> Option<String> {
        self.lock_tokens().first().map(|t| t.to_string())
    }
}

// Below stuff is for the parser state.
#[derive(Debug, Clone, PartialEq)]
enum IfToken {
    ListOpen,
    ListClose,
    Not,
    Word(String),
    Pointy(String),
    ETag(ETag),
    End,
}

#[derive(Debug, Clone, PartialEq)]
enum IfState {
    Start,
    RTag,
    List,
    Not,
    Bad,
}

// helpers.
fn is_whitespace(c: u8) -> bool {
    b" \t\r\n".iter().any(|&x| x == c)
}
fn is_special(c: u8) -> bool {
    b"<>()[]".iter().any(|&x| x == c)
}

fn trim_left(mut out: &'_ [u8]) -> &'_ [u8] {
    while !out.is_empty() && is_whitespace(out[0]) {
        out = &out[1..];
    }
    out
}

// parse one token.
fn scan_until(buf: &[u8], c: u8) -> Result<(&[u8], &[u8]), headers::Error> {
    let mut i = 1;
    let mut quote = false;
    while i < buf.len() && (quote || buf[i] != c) {
        if is_whitespace(buf[i]) {
            return Err(invalid());
        }
        if buf[i] == b'"' {
            quote = !quote;
        }
        i += 1
    }
    if i >= buf.len() {
        return Err(invalid());
    }
    Ok((&buf[1..i], &buf[i + 1..]))
}

// scan one word.
fn scan_word(buf: &[u8]) -> Result<(&[u8], &[u8]), headers::Error> {
    for (i, &c) in buf.iter().enumerate() {
        if is_whitespace(c) || is_special(c) || c < 32 {
            if i == 0 {
                return Err(invalid());
            }
            return Ok((&buf[..i], &buf[i..]));
        }
    }
    Ok((buf, b""))
}

// get next token.
fn get_token(buf: &'_ [u8]) -> Result<(IfToken, &'_ [u8]), headers::Error> {
    let buf = trim_left(buf);
    if buf.is_empty() {
        return Ok((IfToken::End, buf));
    }
    match buf[0] {
        b'(' => Ok((IfToken::ListOpen, &buf[1..])),
        b')' => Ok((IfToken::ListClose, &buf[1..])),
        b'N' if buf.starts_with(b"Not") => Ok((IfToken::Not, &buf[3..])),
        b'<' => {
            let (tok, rest) = scan_until(buf, b'>')?;
            let s = String::from_utf8(tok.to_vec()).map_err(map_invalid)?;
            Ok((IfToken::Pointy(s), rest))
        }
        b'[' => {
            let (tok, rest) = scan_until(buf, b']')?;
            let s = std::str::from_utf8(tok).map_err(map_invalid)?;
            Ok((IfToken::ETag(ETag::from_str(s)?), rest))
        }
        _ => {
            let (tok, rest) = scan_word(buf)?;
            if tok == b"Not" {
                Ok((IfToken::Not, rest))
            } else {
                let s = String::from_utf8(tok.to_vec()).map_err(map_invalid)?;
                Ok((IfToken::Word(s), rest))
            }
        }
    }
}

impl Header for If {
    fn name() -> &'static HeaderName {
        &IF
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        // one big state machine.
        let mut if_lists = If(Vec::new());
        let mut cur_list = IfList::new();

        let mut state = IfState::Start;
        let mut input = one(values)?.as_bytes();

        loop {
            let (tok, rest) = get_token(input)?;
            input = rest;
            state = match state {
                IfState::Start => match tok {
                    IfToken::ListOpen => IfState::List,
                    IfToken::Pointy(url) => {
                        let u = url::Url::parse(&url).map_err(map_invalid)?;
                        cur_list.resource_tag = Some(u);
                        IfState::RTag
                    }
                    IfToken::End => {
                        if !if_lists.0.is_empty() {
                            break;
                        }
                        IfState::Bad
                    }
                    _ => IfState::Bad,
                },
                IfState::RTag => match tok {
                    IfToken::ListOpen => IfState::List,
                    _ => IfState::Bad,
                },
                IfState::List | IfState::Not => {
                    let not = state == IfState::Not;
                    match tok {
                        IfToken::Not => {
                            if not {
                                IfState::Bad
                            } else {
                                IfState::Not
                            }
                        }
                        IfToken::Pointy(stok) | IfToken::Word(stok) => {
                            // no URI parser here, a state token needs
                            // at least one ':'.
                            if !stok.contains(':') {
                                IfState::Bad
                            } else {
                                cur_list.add(not, IfItem::StateToken(stok));
                                IfState::List
                            }
                        }
                        IfToken::ETag(etag) => {
                            cur_list.add(not, IfItem::ETag(etag));
                            IfState::List
                        }
                        IfToken::ListClose => {
                            if cur_list.conditions.is_empty() {
                                IfState::Bad
                            } else {
                                if_lists.0.push(cur_list);
                                cur_list = IfList::new();
                                IfState::Start
                            }
                        }
                        _ => IfState::Bad,
                    }
                }
                IfState::Bad => return Err(invalid()),
            };
        }
        Ok(if_lists)
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = "[If header]";
        values.extend(std::iter::once(HeaderValue::from_static(value)));
    }
}

/// ETag, OC-ETag, OC-FileId and Last-Modified of a resource.
pub(crate) fn insert_info_headers(h: &mut http::HeaderMap, info: &ResourceInfo) {
    if !info.etag.is_empty() {
        let etag = header_value(&info.quoted_etag());
        h.insert(ETAG.clone(), etag.clone());
        h.insert(OC_ETAG, etag);
    }
    if !info.id.opaque_id.is_empty() {
        h.insert(OC_FILEID, header_value(&info.id.to_string()));
    }
    if let Some(mtime) = info.mtime {
        h.insert(
            http::header::LAST_MODIFIED,
            header_value(&crate::util::systemtime_to_httpdate(mtime)),
        );
    }
}
