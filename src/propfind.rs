//! PROPFIND/PROPPATCH request bodies, and the multistatus writer.
use std::io::Cursor;
use std::time::SystemTime;

use http::{Response, StatusCode};
use xml::writer::EventWriter;
use xml::writer::XmlEvent as XmlWEvent;
use xmltree::Element;

use crate::body::Body;
use crate::davheaders::{PREFER, PREFERENCE_APPLIED};
use crate::gateway::{Lock, LockType};
use crate::xmltree_ext::*;
use crate::{DavError, DavResult};

/// Name of a property.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PropName {
    pub ns: String,
    pub name: String,
}

impl PropName {
    pub(crate) fn new(ns: &str, name: &str) -> PropName {
        PropName {
            ns: ns.to_string(),
            name: name.to_string(),
        }
    }

    pub(crate) fn dav(name: &str) -> PropName {
        PropName::new(NS_DAV_URI, name)
    }

    pub(crate) fn oc(name: &str) -> PropName {
        PropName::new(NS_OWNCLOUD_URI, name)
    }

    pub(crate) fn is(&self, ns: &str, name: &str) -> bool {
        self.ns == ns && self.name == name
    }

    /// Key under which a dead property is kept in the arbitrary metadata.
    pub(crate) fn metadata_key(&self) -> String {
        format!("{}/{}", self.ns, self.name)
    }

    fn prefix(&self) -> Option<&'static str> {
        match self.ns.as_str() {
            NS_DAV_URI => Some("d"),
            NS_SABRE_URI => Some("s"),
            NS_OWNCLOUD_URI => Some("oc"),
            _ => None,
        }
    }

    fn from_element(e: &Element) -> PropName {
        PropName {
            ns: e.namespace.clone().unwrap_or_default(),
            name: e.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PropContent {
    Empty,
    Text(String),
    Children(Vec<PropValue>),
}

/// A property with its value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PropValue {
    pub name: PropName,
    pub content: PropContent,
}

impl PropValue {
    pub(crate) fn text(name: PropName, text: impl Into<String>) -> PropValue {
        PropValue {
            name,
            content: PropContent::Text(text.into()),
        }
    }

    pub(crate) fn empty(name: PropName) -> PropValue {
        PropValue {
            name,
            content: PropContent::Empty,
        }
    }

    pub(crate) fn children(name: PropName, children: Vec<PropValue>) -> PropValue {
        PropValue {
            name,
            content: PropContent::Children(children),
        }
    }

    /// Value as stored in the arbitrary metadata.
    pub(crate) fn value(&self) -> String {
        match self.content {
            PropContent::Text(ref t) => t.clone(),
            _ => String::new(),
        }
    }

    fn write<W: std::io::Write>(&self, em: &mut EventWriter<W>) -> DavResult<()> {
        match self.name.prefix() {
            Some(pfx) => {
                let qname = format!("{}:{}", pfx, self.name.name);
                em.write(XmlWEvent::start_element(qname.as_str()))?;
            }
            None if self.name.ns.is_empty() => {
                em.write(XmlWEvent::start_element(self.name.name.as_str()))?;
            }
            None => {
                em.write(
                    XmlWEvent::start_element(self.name.name.as_str()).default_ns(self.name.ns.as_str()),
                )?;
            }
        }
        match self.content {
            PropContent::Empty => {}
            PropContent::Text(ref t) => {
                if !t.is_empty() {
                    em.write(XmlWEvent::characters(t))?;
                }
            }
            PropContent::Children(ref v) => {
                for c in v {
                    c.write(em)?;
                }
            }
        }
        em.write(XmlWEvent::end_element())?;
        Ok(())
    }
}

/// What a PROPFIND asks for.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PropfindRequest {
    /// All properties, plus the ones in `include`.
    Allprop(Vec<PropName>),
    Propname,
    Prop(Vec<PropName>),
}

/// Parse a PROPFIND body. An empty body is an allprop request.
pub(crate) fn parse_propfind(body: &[u8]) -> DavResult<PropfindRequest> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(PropfindRequest::Allprop(Vec::new()));
    }
    let root = Element::parse2(Cursor::new(body))?;
    if !root.is(NS_DAV_URI, "propfind") {
        return Err(DavError::XmlParseError);
    }

    let mut allprop = false;
    let mut propname = false;
    let mut prop: Option<Vec<PropName>> = None;
    let mut include: Option<Vec<PropName>> = None;
    for e in root.child_elems() {
        if e.namespace.as_deref() != Some(NS_DAV_URI) {
            continue;
        }
        match e.name.as_str() {
            "allprop" => allprop = true,
            "propname" => propname = true,
            "prop" => prop = Some(e.child_elems().map(PropName::from_element).collect()),
            "include" => include = Some(e.child_elems().map(PropName::from_element).collect()),
            _ => {}
        }
    }

    match (allprop, propname, prop, include) {
        (true, false, None, inc) => Ok(PropfindRequest::Allprop(inc.unwrap_or_default())),
        (false, true, None, None) => Ok(PropfindRequest::Propname),
        // <prop/> without children asks for everything.
        (false, false, Some(p), None) if p.is_empty() => Ok(PropfindRequest::Allprop(Vec::new())),
        (false, false, Some(p), None) => Ok(PropfindRequest::Prop(p)),
        _ => Err(DavError::msg(StatusCode::BAD_REQUEST, "invalid propfind request")),
    }
}

/// One `set` or `remove` block of a PROPPATCH.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Proppatch {
    pub remove: bool,
    pub props: Vec<PropValue>,
}

/// Parse a PROPPATCH body. Blocks are returned in document order.
pub(crate) fn parse_proppatch(body: &[u8]) -> DavResult<Vec<Proppatch>> {
    let root = Element::parse2(Cursor::new(body))?;
    if !root.is(NS_DAV_URI, "propertyupdate") {
        return Err(DavError::XmlParseError);
    }
    let mut patches = Vec::new();
    for op in root.child_elems() {
        let remove = if op.is(NS_DAV_URI, "set") {
            false
        } else if op.is(NS_DAV_URI, "remove") {
            true
        } else {
            continue;
        };
        let mut props = Vec::new();
        for prop in op.child_elems().filter(|e| e.is(NS_DAV_URI, "prop")) {
            for p in prop.child_elems() {
                if remove && p.has_children() {
                    return Err(DavError::msg(
                        StatusCode::BAD_REQUEST,
                        "remove must not carry a value",
                    ));
                }
                let content = if p.child_elems().next().is_some() {
                    PropContent::Text(p.inner_xml()?)
                } else {
                    PropContent::Text(p.text_content())
                };
                props.push(PropValue {
                    name: PropName::from_element(p),
                    content,
                });
            }
        }
        if props.is_empty() {
            return Err(DavError::msg(StatusCode::BAD_REQUEST, "empty proppatch block"));
        }
        patches.push(Proppatch { remove, props });
    }
    if patches.is_empty() {
        return Err(DavError::msg(StatusCode::BAD_REQUEST, "empty propertyupdate"));
    }
    Ok(patches)
}

/// What a REPORT asks for.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Report {
    /// `oc:filter-files`, only the favorite rule is known.
    FilterFiles {
        props: PropfindRequest,
        favorites: bool,
    },
    SearchFiles,
}

pub(crate) fn parse_report(body: &[u8]) -> DavResult<Report> {
    let root = Element::parse2(Cursor::new(body))?;
    if root.is(NS_OWNCLOUD_URI, "search-files") {
        return Ok(Report::SearchFiles);
    }
    if !root.is(NS_OWNCLOUD_URI, "filter-files") {
        return Err(DavError::msg(StatusCode::BAD_REQUEST, "unsupported report"));
    }
    let mut props = PropfindRequest::Allprop(Vec::new());
    let mut favorites = false;
    for e in root.child_elems() {
        if e.is(NS_DAV_URI, "prop") {
            let names: Vec<PropName> = e.child_elems().map(PropName::from_element).collect();
            if !names.is_empty() {
                props = PropfindRequest::Prop(names);
            }
        } else if e.is(NS_OWNCLOUD_URI, "filter-rules") {
            favorites = e
                .child_elems()
                .any(|r| r.is(NS_OWNCLOUD_URI, "favorite") && r.text_content() == "1");
        }
    }
    Ok(Report::FilterFiles { props, favorites })
}

/// A status with the properties it applies to.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PropStat {
    pub status: StatusCode,
    pub props: Vec<PropValue>,
}

/// Sorts properties into a found and a not found propstat.
#[derive(Debug, Default)]
pub(crate) struct PropStatSet {
    pub ok: Vec<PropValue>,
    pub not_found: Vec<PropValue>,
}

impl PropStatSet {
    pub(crate) fn found(&mut self, p: PropValue) {
        self.ok.push(p);
    }

    pub(crate) fn missing(&mut self, name: PropName) {
        self.not_found.push(PropValue::empty(name));
    }

    pub(crate) fn into_propstats(self) -> Vec<PropStat> {
        vec![
            PropStat {
                status: StatusCode::OK,
                props: self.ok,
            },
            PropStat {
                status: StatusCode::NOT_FOUND,
                props: self.not_found,
            },
        ]
    }
}

/// Writes a `d:multistatus` document.
pub(crate) struct MultiStatus {
    emitter: EventWriter<Vec<u8>>,
    minimal: bool,
}

impl MultiStatus {
    /// With `minimal` set, 404 propstats are left out.
    pub(crate) fn new(minimal: bool) -> DavResult<MultiStatus> {
        let mut emitter = emitter(Vec::new())?;
        emitter.write(
            XmlWEvent::start_element("d:multistatus")
                .ns("d", NS_DAV_URI)
                .ns("s", NS_SABRE_URI)
                .ns("oc", NS_OWNCLOUD_URI),
        )?;
        Ok(MultiStatus { emitter, minimal })
    }

    pub(crate) fn response(&mut self, href: &str, propstats: Vec<PropStat>) -> DavResult<()> {
        let em = &mut self.emitter;
        em.write(XmlWEvent::start_element("d:response"))?;
        write_elem(em, "d:href", href)?;
        for ps in propstats {
            if ps.props.is_empty() || (self.minimal && ps.status == StatusCode::NOT_FOUND) {
                continue;
            }
            em.write(XmlWEvent::start_element("d:propstat"))?;
            em.write(XmlWEvent::start_element("d:prop"))?;
            for p in &ps.props {
                p.write(em)?;
            }
            em.write(XmlWEvent::end_element())?;
            write_elem(em, "d:status", &format!("HTTP/1.1 {}", ps.status))?;
            em.write(XmlWEvent::end_element())?;
        }
        em.write(XmlWEvent::end_element())?;
        Ok(())
    }

    pub(crate) fn close(mut self) -> DavResult<Vec<u8>> {
        self.emitter.write(XmlWEvent::end_element())?;
        Ok(self.emitter.into_inner())
    }
}

/// 207 response around a multistatus body.
pub(crate) fn multistatus_response(body: Vec<u8>, minimal: bool) -> DavResult<Response<Body>> {
    let mut builder = Response::builder()
        .status(StatusCode::MULTI_STATUS)
        .header("DAV", "1, 3, extended-mkcol")
        .header("Content-Type", "application/xml; charset=utf-8")
        .header("Vary", PREFER);
    if minimal {
        builder = builder.header(PREFERENCE_APPLIED, "return=minimal");
    }
    builder
        .body(Body::from(body))
        .map_err(|_| DavError::Status(StatusCode::INTERNAL_SERVER_ERROR))
}

/// `d:lockdiscovery` for a lock held on the backend.
pub(crate) fn lockdiscovery(lock: &Lock, now: SystemTime) -> PropValue {
    let mut al = Vec::new();
    al.push(PropValue::children(
        PropName::dav("locktype"),
        vec![PropValue::empty(PropName::dav("write"))],
    ));
    let scope = match lock.lock_type {
        LockType::Shared => "shared",
        LockType::Exclusive | LockType::Write => "exclusive",
    };
    al.push(PropValue::children(
        PropName::dav("lockscope"),
        vec![PropValue::empty(PropName::dav(scope))],
    ));
    al.push(PropValue::text(PropName::dav("depth"), "Infinity"));
    if lock.user.is_some() || !lock.app_name.is_empty() {
        let mut owner = String::new();
        if let Some(ref u) = lock.user {
            owner.push_str(&format!("{}@{}", u.opaque_id, u.idp));
        }
        if !lock.app_name.is_empty() {
            if lock.user.is_some() {
                owner.push_str(" via ");
            }
            owner.push_str(&lock.app_name);
        }
        al.push(PropValue::text(PropName::dav("owner"), owner));
    }
    let timeout = match lock.expiration {
        Some(exp) => match exp.duration_since(now) {
            Ok(d) => format!("Second-{}", d.as_secs()),
            Err(_) => "Second-0".to_string(),
        },
        None => "Infinity".to_string(),
    };
    al.push(PropValue::text(PropName::dav("timeout"), timeout));
    if !lock.lock_id.is_empty() {
        al.push(PropValue::children(
            PropName::dav("locktoken"),
            vec![PropValue::text(PropName::dav("href"), lock.lock_id.clone())],
        ));
    }
    PropValue::children(
        PropName::dav("lockdiscovery"),
        vec![PropValue::children(PropName::dav("activelock"), al)],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn propfind_bodies() {
        assert_eq!(parse_propfind(b"").unwrap(), PropfindRequest::Allprop(vec![]));

        let b = br#"<d:propfind xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
            <d:prop><d:getetag/><oc:fileid/><x:foo xmlns:x="urn:x"/></d:prop></d:propfind>"#;
        match parse_propfind(b).unwrap() {
            PropfindRequest::Prop(v) => {
                assert_eq!(v.len(), 3);
                assert!(v[0].is(NS_DAV_URI, "getetag"));
                assert!(v[1].is(NS_OWNCLOUD_URI, "fileid"));
                assert!(v[2].is("urn:x", "foo"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let b = br#"<d:propfind xmlns:d="DAV:"><d:prop/></d:propfind>"#;
        assert_eq!(parse_propfind(b).unwrap(), PropfindRequest::Allprop(vec![]));

        let b = br#"<d:propfind xmlns:d="DAV:"><d:propname/></d:propfind>"#;
        assert_eq!(parse_propfind(b).unwrap(), PropfindRequest::Propname);

        let b = br#"<d:propfind xmlns:d="DAV:"><d:allprop/><d:prop><d:getetag/></d:prop></d:propfind>"#;
        assert!(parse_propfind(b).is_err());
        let b = br#"<d:propfind xmlns:d="DAV:"><d:include><d:getetag/></d:include></d:propfind>"#;
        assert!(parse_propfind(b).is_err());
        assert!(parse_propfind(b"<d:propfind").is_err());
    }

    #[test]
    fn proppatch_bodies() {
        let b = br#"<d:propertyupdate xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
            <d:set><d:prop><oc:favorite>1</oc:favorite></d:prop></d:set>
            <d:remove><d:prop><oc:tag/></d:prop></d:remove>
            </d:propertyupdate>"#;
        let p = parse_proppatch(b).unwrap();
        assert_eq!(p.len(), 2);
        assert!(!p[0].remove);
        assert_eq!(p[0].props[0].value(), "1");
        assert_eq!(p[0].props[0].name.metadata_key(), "http://owncloud.org/ns/favorite");
        assert!(p[1].remove);

        let b = br#"<d:propertyupdate xmlns:d="DAV:">
            <d:remove><d:prop><d:x>value</d:x></d:prop></d:remove></d:propertyupdate>"#;
        assert!(parse_proppatch(b).is_err());
    }

    #[test]
    fn report_bodies() {
        let b = br#"<oc:filter-files xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
            <d:prop><oc:fileid/></d:prop>
            <oc:filter-rules><oc:favorite>1</oc:favorite></oc:filter-rules></oc:filter-files>"#;
        match parse_report(b).unwrap() {
            Report::FilterFiles { props, favorites } => {
                assert!(favorites);
                assert_eq!(props, PropfindRequest::Prop(vec![PropName::oc("fileid")]));
            }
            r => panic!("unexpected {:?}", r),
        }
        let b = br#"<oc:search-files xmlns:oc="http://owncloud.org/ns"/>"#;
        assert_eq!(parse_report(b).unwrap(), Report::SearchFiles);
        assert!(parse_report(br#"<d:foo xmlns:d="DAV:"/>"#).is_err());
    }

    #[test]
    fn multistatus() {
        let mut ms = MultiStatus::new(true).unwrap();
        let mut set = PropStatSet::default();
        set.found(PropValue::text(PropName::dav("getetag"), "\"abc\""));
        set.found(PropValue::children(
            PropName::dav("resourcetype"),
            vec![PropValue::empty(PropName::dav("collection"))],
        ));
        set.found(PropValue::text(PropName::new("urn:x", "foo"), "bar"));
        set.missing(PropName::oc("size"));
        ms.response("/remote.php/webdav/a%20b/", set.into_propstats())
            .unwrap();
        let s = String::from_utf8(ms.close().unwrap()).unwrap();
        assert!(s.contains(r#"xmlns:oc="http://owncloud.org/ns""#));
        assert!(s.contains("<d:href>/remote.php/webdav/a%20b/</d:href>"));
        assert!(s.contains("<d:collection"));
        assert!(s.contains(r#"xmlns="urn:x""#));
        assert!(s.contains("HTTP/1.1 200 OK"));
        // minimal: no 404 propstat.
        assert!(!s.contains("404"));
        assert!(!s.contains("oc:size"));
    }

    #[test]
    fn lock_discovery() {
        let now = SystemTime::now();
        let lock = Lock {
            lock_id: "urn:uuid:1".to_string(),
            lock_type: LockType::Exclusive,
            user: Some(crate::gateway::UserId::new("idp", "alice")),
            app_name: String::new(),
            expiration: Some(now + Duration::from_secs(60)),
        };
        let mut ms = MultiStatus::new(false).unwrap();
        ms.response(
            "/x",
            vec![PropStat {
                status: StatusCode::OK,
                props: vec![lockdiscovery(&lock, now)],
            }],
        )
        .unwrap();
        let s = String::from_utf8(ms.close().unwrap()).unwrap();
        assert!(s.contains("<d:timeout>Second-60</d:timeout>"));
        assert!(s.contains("<d:owner>alice@idp</d:owner>"));
        assert!(s.contains("urn:uuid:1"));
    }
}
