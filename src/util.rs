use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use http::method::InvalidMethod;

use crate::DavResult;
use crate::errors::DavError;

/// HTTP Methods supported by DavHandler.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[repr(u32)]
pub enum DavMethod {
    Head = 0x0001,
    Get = 0x0002,
    Put = 0x0004,
    Patch = 0x0008,
    Options = 0x0010,
    PropFind = 0x0020,
    PropPatch = 0x0040,
    MkCol = 0x0080,
    Copy = 0x0100,
    Move = 0x0200,
    Delete = 0x0400,
    Lock = 0x0800,
    Unlock = 0x1000,
    Post = 0x2000,
    Report = 0x4000,
}

const ALL_METHODS: [DavMethod; 15] = [
    DavMethod::Options,
    DavMethod::Get,
    DavMethod::Head,
    DavMethod::Post,
    DavMethod::Put,
    DavMethod::Patch,
    DavMethod::Delete,
    DavMethod::PropFind,
    DavMethod::PropPatch,
    DavMethod::MkCol,
    DavMethod::Copy,
    DavMethod::Move,
    DavMethod::Lock,
    DavMethod::Unlock,
    DavMethod::Report,
];

impl DavMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DavMethod::Head => "HEAD",
            DavMethod::Get => "GET",
            DavMethod::Put => "PUT",
            DavMethod::Patch => "PATCH",
            DavMethod::Options => "OPTIONS",
            DavMethod::PropFind => "PROPFIND",
            DavMethod::PropPatch => "PROPPATCH",
            DavMethod::MkCol => "MKCOL",
            DavMethod::Copy => "COPY",
            DavMethod::Move => "MOVE",
            DavMethod::Delete => "DELETE",
            DavMethod::Lock => "LOCK",
            DavMethod::Unlock => "UNLOCK",
            DavMethod::Post => "POST",
            DavMethod::Report => "REPORT",
        }
    }
}

// translate method into our own enum that has webdav methods as well.
pub(crate) fn dav_method(m: &http::Method) -> DavResult<DavMethod> {
    let m = match *m {
        http::Method::HEAD => DavMethod::Head,
        http::Method::GET => DavMethod::Get,
        http::Method::PUT => DavMethod::Put,
        http::Method::PATCH => DavMethod::Patch,
        http::Method::POST => DavMethod::Post,
        http::Method::DELETE => DavMethod::Delete,
        http::Method::OPTIONS => DavMethod::Options,
        _ => match m.as_str() {
            "PROPFIND" => DavMethod::PropFind,
            "PROPPATCH" => DavMethod::PropPatch,
            "MKCOL" => DavMethod::MkCol,
            "COPY" => DavMethod::Copy,
            "MOVE" => DavMethod::Move,
            "LOCK" => DavMethod::Lock,
            "UNLOCK" => DavMethod::Unlock,
            "REPORT" => DavMethod::Report,
            _ => {
                return Err(DavError::UnknownDavMethod);
            }
        },
    };
    Ok(m)
}

// for external use.
impl std::convert::TryFrom<&http::Method> for DavMethod {
    type Error = InvalidMethod;

    fn try_from(value: &http::Method) -> Result<Self, Self::Error> {
        dav_method(value).map_err(|_| {
            // A trick to get at the value of http::method::InvalidMethod.
            http::method::Method::from_bytes(b"").unwrap_err()
        })
    }
}

/// A set of [`DavMethod`]s.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DavMethodSet(u32);

impl DavMethodSet {
    /// New set, all methods.
    pub fn all() -> DavMethodSet {
        DavMethodSet(0xffffffff)
    }

    /// New empty set.
    pub fn none() -> DavMethodSet {
        DavMethodSet(0)
    }

    /// Add a method.
    pub fn add(&mut self, m: DavMethod) -> &Self {
        self.0 |= m as u32;
        self
    }

    /// Check if a method is in the set.
    pub fn contains(&self, m: DavMethod) -> bool {
        self.0 & (m as u32) > 0
    }

    /// Comma separated method names, as used in `Allow`.
    pub fn to_header_value(&self) -> String {
        ALL_METHODS
            .iter()
            .filter(|m| self.contains(**m))
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromIterator<DavMethod> for DavMethodSet {
    fn from_iter<I: IntoIterator<Item = DavMethod>>(iter: I) -> Self {
        let mut set = DavMethodSet::none();
        for m in iter {
            set.add(m);
        }
        set
    }
}

/// RFC 1123 date, as used in `Last-Modified` and `d:getlastmodified`.
pub(crate) fn systemtime_to_httpdate(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub(crate) fn systemtime_to_unix(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

pub(crate) fn unix_to_systemtime(secs: u64) -> SystemTime {
    UNIX_EPOCH + std::time::Duration::from_secs(secs)
}

/// Rules for names of new files and folders.
#[derive(Debug, Clone, PartialEq)]
pub struct NameValidation {
    pub invalid_chars: Vec<String>,
    pub max_length: usize,
}

impl Default for NameValidation {
    fn default() -> Self {
        NameValidation {
            invalid_chars: vec!["\x0c".into(), "\r".into(), "\n".into(), "\\".into()],
            max_length: 255,
        }
    }
}

impl NameValidation {
    /// Check a single path element, returns the reason it was refused.
    pub fn check(&self, name: &str) -> Result<(), String> {
        let name = name.trim_matches('/');
        if name.is_empty() {
            return Err("must not be empty".to_string());
        }
        if name == "." || name == ".." {
            return Err("must not be '.' or '..'".to_string());
        }
        if name.chars().count() > self.max_length {
            return Err(format!("must be shorter than {}", self.max_length));
        }
        for c in &self.invalid_chars {
            if !c.is_empty() && name.contains(c.as_str()) {
                return Err(format!("must not contain {:?}", c));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc1123() {
        let t = unix_to_systemtime(784111777);
        assert_eq!(systemtime_to_httpdate(t), "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(systemtime_to_unix(t), 784111777);
    }

    #[test]
    fn test_methods() {
        let m = http::Method::from_bytes(b"REPORT").unwrap();
        assert_eq!(dav_method(&m).unwrap(), DavMethod::Report);
        let m = http::Method::from_bytes(b"BREW").unwrap();
        assert!(dav_method(&m).is_err());

        let set: DavMethodSet = [DavMethod::Get, DavMethod::Options, DavMethod::PropFind]
            .into_iter()
            .collect();
        assert_eq!(set.to_header_value(), "OPTIONS, GET, PROPFIND");
        assert!(!set.contains(DavMethod::Put));
    }

    #[test]
    fn test_name_validation() {
        let v = NameValidation::default();
        assert!(v.check("report.pdf").is_ok());
        assert!(v.check("").is_err());
        assert!(v.check("..").is_err());
        assert!(v.check("a\\b").is_err());
        assert!(v.check("a\nb").is_err());
        assert!(v.check(&"x".repeat(256)).is_err());
        assert!(v.check(&"x".repeat(255)).is_ok());
    }
}
