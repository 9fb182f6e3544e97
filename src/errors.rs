use std::error::Error;
use std::io::{self, ErrorKind};

use http::StatusCode;
use xml::escape::escape_str_pcdata;

use crate::gateway::{Code, GwError};
use crate::locks::LockError;
use crate::transfer::TransferError;

pub(crate) type DavResult<T> = Result<T, DavError>;

#[derive(Debug)]
pub(crate) enum DavError {
    XmlReadError,  // error reading/parsing xml
    XmlParseError, // error interpreting xml
    InvalidPath,   // error parsing path
    UnknownDavMethod,
    Status(StatusCode),
    // status with a message for the error body, and an optional header name.
    Message {
        status: StatusCode,
        message: String,
        header: Option<&'static str>,
    },
    Gateway(GwError),
    Transfer(TransferError),
    Lock(LockError),
    Cancelled,
    IoError(io::Error),
    XmlReaderError(xml::reader::Error),
    XmlWriterError(xml::writer::Error),
}

impl DavError {
    pub(crate) fn msg(status: StatusCode, message: impl Into<String>) -> DavError {
        DavError::Message {
            status,
            message: message.into(),
            header: None,
        }
    }

    pub(crate) fn with_header(
        status: StatusCode,
        message: impl Into<String>,
        header: &'static str,
    ) -> DavError {
        DavError::Message {
            status,
            message: message.into(),
            header: Some(header),
        }
    }
}

impl Error for DavError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DavError::Gateway(e) => Some(e),
            DavError::Transfer(e) => Some(e),
            DavError::Lock(e) => Some(e),
            DavError::IoError(e) => Some(e),
            DavError::XmlReaderError(e) => Some(e),
            DavError::XmlWriterError(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for DavError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DavError::XmlReaderError(_) => write!(f, "XML parse error"),
            DavError::XmlWriterError(_) => write!(f, "XML generate error"),
            DavError::IoError(_) => write!(f, "I/O error"),
            DavError::Message { message, .. } => write!(f, "{}", message),
            DavError::Gateway(e) => write!(f, "{}", e),
            DavError::Transfer(e) => write!(f, "{}", e),
            DavError::Lock(e) => write!(f, "{}", e),
            DavError::Cancelled => write!(f, "copy cancelled after partial completion"),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl From<DavError> for io::Error {
    fn from(e: DavError) -> Self {
        io::Error::other(e)
    }
}

impl From<io::Error> for DavError {
    fn from(e: io::Error) -> Self {
        DavError::IoError(e)
    }
}

impl From<StatusCode> for DavError {
    fn from(e: StatusCode) -> Self {
        DavError::Status(e)
    }
}

impl From<GwError> for DavError {
    fn from(e: GwError) -> Self {
        DavError::Gateway(e)
    }
}

impl From<TransferError> for DavError {
    fn from(e: TransferError) -> Self {
        DavError::Transfer(e)
    }
}

impl From<LockError> for DavError {
    fn from(e: LockError) -> Self {
        DavError::Lock(e)
    }
}

impl From<xml::reader::Error> for DavError {
    fn from(e: xml::reader::Error) -> Self {
        DavError::XmlReaderError(e)
    }
}

impl From<xml::writer::Error> for DavError {
    fn from(e: xml::writer::Error) -> Self {
        DavError::XmlWriterError(e)
    }
}

/// Map a gateway status code to an HTTP status.
pub(crate) fn code_to_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::Aborted => StatusCode::PRECONDITION_FAILED,
        Code::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        Code::AlreadyExists => StatusCode::PRECONDITION_FAILED,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::Locked => StatusCode::LOCKED,
        Code::InsufficientStorage => StatusCode::INSUFFICIENT_STORAGE,
    }
}

fn gwerror_to_status(e: &GwError) -> StatusCode {
    match e {
        GwError::Status(s) => code_to_status(s.code),
        GwError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        GwError::NotSupported(_) => StatusCode::FORBIDDEN,
    }
}

fn ioerror_to_status(ioerror: &io::Error) -> StatusCode {
    match ioerror.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

impl DavError {
    pub(crate) fn statuscode(&self) -> StatusCode {
        match self {
            DavError::XmlReadError => StatusCode::BAD_REQUEST,
            DavError::XmlParseError => StatusCode::BAD_REQUEST,
            DavError::InvalidPath => StatusCode::BAD_REQUEST,
            DavError::UnknownDavMethod => StatusCode::NOT_IMPLEMENTED,
            DavError::Status(e) => *e,
            DavError::Message { status, .. } => *status,
            DavError::Gateway(e) => gwerror_to_status(e),
            DavError::Transfer(e) => e.statuscode(),
            DavError::Lock(e) => e.statuscode(),
            DavError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
            DavError::IoError(e) => ioerror_to_status(e),
            DavError::XmlReaderError(_) => StatusCode::BAD_REQUEST,
            DavError::XmlWriterError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn must_close(&self) -> bool {
        matches!(
            self,
            DavError::XmlReadError
                | DavError::UnknownDavMethod
                | DavError::IoError(_)
        )
    }

    /// Message for the error body.
    pub(crate) fn message(&self) -> String {
        match self {
            DavError::Message { message, .. } => message.clone(),
            DavError::Gateway(GwError::Status(s)) => s.message.clone(),
            DavError::Gateway(e) => e.to_string(),
            DavError::Transfer(e) => e.to_string(),
            DavError::Lock(e) => e.to_string(),
            DavError::Cancelled => self.to_string(),
            DavError::Status(s) => {
                s.canonical_reason().unwrap_or("").to_string()
            }
            _ => self.to_string(),
        }
    }

    pub(crate) fn header(&self) -> Option<&'static str> {
        match self {
            DavError::Message { header, .. } => *header,
            _ => None,
        }
    }
}

fn sabre_exception(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "Sabre\\DAV\\Exception\\BadRequest",
        StatusCode::UNAUTHORIZED => "Sabre\\DAV\\Exception\\NotAuthenticated",
        StatusCode::FORBIDDEN => "Sabre\\DAV\\Exception\\Forbidden",
        StatusCode::NOT_FOUND => "Sabre\\DAV\\Exception\\NotFound",
        StatusCode::METHOD_NOT_ALLOWED => "Sabre\\DAV\\Exception\\MethodNotAllowed",
        StatusCode::CONFLICT => "Sabre\\DAV\\Exception\\Conflict",
        StatusCode::PRECONDITION_FAILED => "Sabre\\DAV\\Exception\\PreconditionFailed",
        StatusCode::UNSUPPORTED_MEDIA_TYPE => "Sabre\\DAV\\Exception\\UnsupportedMediaType",
        StatusCode::LOCKED => "Sabre\\DAV\\Exception\\Locked",
        StatusCode::NOT_IMPLEMENTED => "Sabre\\DAV\\Exception\\NotImplemented",
        StatusCode::INSUFFICIENT_STORAGE => "Sabre\\DAV\\Exception\\InsufficientStorage",
        _ => "Sabre\\DAV\\Exception\\ServiceUnavailable",
    }
}

/// The WebDAV XML error document.
pub(crate) fn error_body(status: StatusCode, message: &str, header: Option<&str>) -> String {
    let mut s = String::from(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    s.push_str(r#"<d:error xmlns:d="DAV:" xmlns:s="http://sabredav.org/ns">"#);
    s.push_str("<s:exception>");
    s.push_str(sabre_exception(status));
    s.push_str("</s:exception><s:message>");
    s.push_str(&escape_str_pcdata(message));
    s.push_str("</s:message>");
    if let Some(h) = header {
        s.push_str("<s:header>");
        s.push_str(&escape_str_pcdata(h));
        s.push_str("</s:header>");
    }
    s.push_str("</d:error>");
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_codes() {
        let e: DavError = GwError::new(Code::NotFound, "gone").into();
        assert_eq!(e.statuscode(), StatusCode::NOT_FOUND);
        assert_eq!(e.message(), "gone");
        let e: DavError = GwError::new(Code::Aborted, "etag").into();
        assert_eq!(e.statuscode(), StatusCode::PRECONDITION_FAILED);
        let e: DavError = GwError::Transport("down".into()).into();
        assert_eq!(e.statuscode(), StatusCode::INTERNAL_SERVER_ERROR);
        let e: DavError = GwError::NotSupported("no key".into()).into();
        assert_eq!(e.statuscode(), StatusCode::FORBIDDEN);
        assert_eq!(code_to_status(Code::Locked), StatusCode::LOCKED);
        assert_eq!(
            code_to_status(Code::InsufficientStorage),
            StatusCode::INSUFFICIENT_STORAGE
        );
    }

    #[test]
    fn xml_body() {
        let b = error_body(StatusCode::NOT_FOUND, "a <b>", Some("Destination"));
        assert!(b.contains("<s:exception>Sabre\\DAV\\Exception\\NotFound</s:exception>"));
        assert!(b.contains("<s:message>a &lt;b&gt;</s:message>"));
        assert!(b.contains("<s:header>Destination</s:header>"));
    }
}
