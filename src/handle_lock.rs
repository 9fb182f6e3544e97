use std::io::Cursor;
use std::time::Duration;

use headers::HeaderMapExt;
use http::StatusCode as SC;
use http::{HeaderValue, Request, Response};
use xml::escape::escape_str_pcdata;
use xmltree::Element;

use crate::body::Body;
use crate::davheaders::{self, DavTimeout};
use crate::errors::DavError;
use crate::locks::{LockDetails, LockManager};
use crate::router::RouteContext;
use crate::xmltree_ext::{ElementExt, NS_DAV_URI};
use crate::DavResult;

// Decoded lockinfo element.
#[derive(Debug, Default)]
struct LockInfo {
    shared: bool,
    owner_xml: String,
}

fn parse_lockinfo(xmldata: &[u8]) -> DavResult<LockInfo> {
    let tree = Element::parse2(Cursor::new(xmldata))?;
    if !tree.is(NS_DAV_URI, "lockinfo") {
        return Err(DavError::XmlParseError);
    }

    let mut shared: Option<bool> = None;
    let mut locktype = false;
    let mut owner_xml = String::new();
    for elem in tree.child_elems() {
        match elem.name.as_str() {
            "lockscope" => match elem.child_elems().next().map(|e| e.name.as_str()) {
                Some("exclusive") => shared = Some(false),
                Some("shared") => shared = Some(true),
                _ => return Err(DavError::XmlParseError),
            },
            "locktype" => match elem.child_elems().next().map(|e| e.name.as_str()) {
                Some("write") => locktype = true,
                _ => return Err(DavError::XmlParseError),
            },
            "owner" => owner_xml = elem.inner_xml()?,
            _ => return Err(DavError::XmlParseError),
        }
    }

    // sanity check.
    let shared = match shared {
        Some(s) if locktype => s,
        _ => return Err(DavError::XmlParseError),
    };
    Ok(LockInfo { shared, owner_xml })
}

// None is infinite.
fn get_timeout(req: &Request<()>) -> DavResult<Option<Duration>> {
    match req.headers().typed_try_get::<davheaders::Timeout>() {
        Ok(Some(davheaders::Timeout(DavTimeout::Seconds(n)))) => {
            Ok(Some(Duration::from_secs(n as u64)))
        }
        Ok(Some(davheaders::Timeout(DavTimeout::Infinite))) | Ok(None) => Ok(None),
        Err(_) => Err(DavError::msg(SC::BAD_REQUEST, "invalid timeout")),
    }
}

fn lock_body(details: &LockDetails) -> String {
    let depth = if details.depth_zero { "0" } else { "infinity" };
    let timeout = match details.timeout {
        Some(d) => format!("Second-{}", d.as_secs()),
        None => "Infinite".to_string(),
    };
    let mut s = String::from(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    s.push_str(r#"<d:prop xmlns:d="DAV:"><d:lockdiscovery><d:activelock>"#);
    s.push_str("<d:locktype><d:write/></d:locktype>");
    s.push_str("<d:lockscope><d:exclusive/></d:lockscope>");
    s.push_str(&format!("<d:depth>{}</d:depth>", depth));
    if !details.owner_xml.is_empty() {
        s.push_str(&format!("<d:owner>{}</d:owner>", details.owner_xml));
    }
    s.push_str(&format!("<d:timeout>{}</d:timeout>", timeout));
    s.push_str(&format!(
        "<d:locktoken><d:href>{}</d:href></d:locktoken>",
        escape_str_pcdata(&details.token)
    ));
    s.push_str(&format!(
        "<d:lockroot><d:href>{}</d:href></d:lockroot>",
        escape_str_pcdata(&details.root)
    ));
    s.push_str("</d:activelock></d:lockdiscovery></d:prop>");
    s
}

impl crate::DavInner {
    pub(crate) async fn handle_lock(
        &self,
        ctx: &RouteContext,
        req: &Request<()>,
        body: Body,
    ) -> DavResult<Response<Body>> {
        let xmldata = self.read_request(body, 65536).await?;
        let timeout = get_timeout(req)?;
        let gw = self.gw()?;
        let target = ctx.target(gw).await?;
        let lm = LockManager::new(gw, &ctx.session);

        // lock refresh?
        if xmldata.iter().all(|b| b.is_ascii_whitespace()) {
            let tokens = req
                .headers()
                .typed_get::<davheaders::If>()
                .map(|i| i.lock_tokens().iter().map(|t| t.to_string()).collect::<Vec<_>>())
                .unwrap_or_default();
            if tokens.len() != 1 {
                return Err(DavError::msg(SC::BAD_REQUEST, "invalid lock token"));
            }
            let details = lm.refresh(&target, &tokens[0], timeout).await?;
            return lock_response(&details, SC::OK);
        }

        // Values other than 0 or infinity must not be used with the
        // Depth header on a LOCK method.
        let depth_zero = match req.headers().typed_try_get::<davheaders::Depth>() {
            Ok(Some(davheaders::Depth::Infinity)) | Ok(None) => false,
            Ok(Some(davheaders::Depth::Zero)) => true,
            _ => return Err(DavError::msg(SC::BAD_REQUEST, "invalid depth")),
        };

        let info = match parse_lockinfo(&xmldata) {
            Ok(info) => info,
            Err(_) => return Err(DavError::msg(SC::BAD_REQUEST, "invalid lock info")),
        };
        if info.shared {
            return Err(DavError::msg(SC::NOT_IMPLEMENTED, "shared locks are not supported"));
        }

        let mut details = LockDetails {
            owner_xml: info.owner_xml,
            user: ctx.session.user_id().cloned(),
            root: ctx.href(&ctx.path, false),
            depth_zero,
            timeout,
            ..LockDetails::default()
        };
        let guard = lm.create(&target, &mut details).await?;
        debug!("handle_lock: {} locked with {}", target, details.token);

        let res = lock_response(&details, SC::OK)?;
        guard.commit();
        Ok(res)
    }

    pub(crate) async fn handle_unlock(
        &self,
        ctx: &RouteContext,
        req: &Request<()>,
        _body: Body,
    ) -> DavResult<Response<Body>> {
        // Must have Lock-Token header
        let t = req
            .headers()
            .typed_get::<davheaders::LockToken>()
            .ok_or_else(|| DavError::msg(SC::BAD_REQUEST, "missing Lock-Token header"))?;
        let token = t.token();
        if token.is_empty() {
            return Err(DavError::msg(SC::BAD_REQUEST, "missing Lock-Token header"));
        }

        let gw = self.gw()?;
        let target = ctx.target(gw).await?;
        LockManager::new(gw, &ctx.session)
            .unlock(&target, token)
            .await?;

        let mut res = Response::new(Body::empty());
        *res.status_mut() = SC::NO_CONTENT;
        Ok(res)
    }
}

fn lock_response(details: &LockDetails, status: SC) -> DavResult<Response<Body>> {
    let mut res = Response::new(Body::from(lock_body(details)));
    if !details.token.is_empty() {
        let lt = HeaderValue::from_str(&format!("<{}>", details.token))
            .map_err(|_| DavError::Status(SC::INTERNAL_SERVER_ERROR))?;
        res.headers_mut().insert("Lock-Token", lt);
    }
    res.headers_mut().insert(
        "Content-Type",
        HeaderValue::from_static("application/xml; charset=utf-8"),
    );
    *res.status_mut() = status;
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lockinfo() {
        let xml = r#"<?xml version="1.0"?>
            <d:lockinfo xmlns:d="DAV:">
              <d:lockscope><d:exclusive/></d:lockscope>
              <d:locktype><d:write/></d:locktype>
              <d:owner><d:href>mailto:alice@example.com</d:href></d:owner>
            </d:lockinfo>"#;
        let li = parse_lockinfo(xml.as_bytes()).unwrap();
        assert!(!li.shared);
        assert!(li.owner_xml.contains("mailto:alice@example.com"));

        let xml = r#"<d:lockinfo xmlns:d="DAV:"><d:lockscope><d:shared/></d:lockscope>
            <d:locktype><d:write/></d:locktype></d:lockinfo>"#;
        assert!(parse_lockinfo(xml.as_bytes()).unwrap().shared);

        let xml = r#"<d:lockinfo xmlns:d="DAV:"><d:lockscope><d:exclusive/></d:lockscope></d:lockinfo>"#;
        assert!(parse_lockinfo(xml.as_bytes()).is_err());
    }

    #[test]
    fn body() {
        let d = LockDetails {
            token: "urn:uuid:1".to_string(),
            root: "/remote.php/dav/files/alice/a.txt".to_string(),
            timeout: Some(Duration::from_secs(300)),
            ..LockDetails::default()
        };
        let b = lock_body(&d);
        assert!(b.contains("<d:depth>infinity</d:depth>"));
        assert!(b.contains("<d:timeout>Second-300</d:timeout>"));
        assert!(b.contains("<d:locktoken><d:href>urn:uuid:1</d:href></d:locktoken>"));
        assert!(!b.contains("<d:owner>"));
    }
}
