//! Parsed SOAP view over an XML message body.
//!
//! The view records byte offsets of the envelope structure the gateway cares
//! about (header, security header blocks, first body payload element) so
//! that header rewrites can be applied to the original text without
//! re-serializing the rest of the document.
//!
//! Edits never mutate a [`SoapDocument`]; they return the rewritten document
//! text, which the caller feeds back into `Message::initialize`. That in turn
//! drops this view so the next access parses the new body.

use std::ops::Range;

use quick_xml::NsReader;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};

use super::MessageError;

pub const SOAP11_ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const SOAP12_ENVELOPE_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const WSSE_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";

/// SOAP protocol version, by envelope namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoapVersion {
    Soap11,
    Soap12,
}

impl SoapVersion {
    fn from_namespace(ns: &[u8]) -> Option<Self> {
        match ns {
            n if n == SOAP11_ENVELOPE_NS.as_bytes() => Some(Self::Soap11),
            n if n == SOAP12_ENVELOPE_NS.as_bytes() => Some(Self::Soap12),
            _ => None,
        }
    }

    pub fn namespace(self) -> &'static str {
        match self {
            Self::Soap11 => SOAP11_ENVELOPE_NS,
            Self::Soap12 => SOAP12_ENVELOPE_NS,
        }
    }
}

/// One `Security` header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityBlock {
    /// `actor` (SOAP 1.1) or `role` (SOAP 1.2); `None` for the default block.
    pub actor: Option<String>,
    pub must_understand: bool,
    qname: String,
    attributes: Vec<(String, String)>,
    span: Range<usize>,
    start_tag: Range<usize>,
    /// Offset of the closing tag; `None` for a self-closing element.
    content_end: Option<usize>,
}

impl SecurityBlock {
    fn is_addressing_attr(key: &str) -> bool {
        let local = key.rsplit(':').next().unwrap_or(key);
        matches!(local, "actor" | "role" | "mustUnderstand")
    }
}

#[derive(Debug, Clone)]
struct HeaderLayout {
    /// Span of a self-closing `<Header/>`, or the content range otherwise.
    empty_tag: Option<Range<usize>>,
    content_end: usize,
    blocks: Vec<SecurityBlock>,
}

#[derive(Debug, Clone)]
struct EnvelopeLayout {
    version: SoapVersion,
    prefix: Option<String>,
    start_tag_end: usize,
    header: Option<HeaderLayout>,
    payload: Option<(String, bool)>,
}

/// Parsed view of an XML body, with SOAP structure when present.
#[derive(Debug, Clone)]
pub struct SoapDocument {
    source: String,
    root: String,
    envelope: Option<EnvelopeLayout>,
}

fn malformed(err: impl std::fmt::Display) -> MessageError {
    MessageError::Xml {
        details: err.to_string(),
    }
}

fn bound_ns<'a>(resolved: &ResolveResult<'a>) -> Option<&'a [u8]> {
    match resolved {
        ResolveResult::Bound(Namespace(ns)) => Some(*ns),
        _ => None,
    }
}

fn is_security_ns(ns: Option<&[u8]>) -> bool {
    ns.map(|n| {
        let n = String::from_utf8_lossy(n);
        n.contains("secext") || n.contains("/wss/")
    })
    .unwrap_or(false)
}

fn read_attributes(start: &BytesStart<'_>) -> Result<Vec<(String, String)>, MessageError> {
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(malformed)?;
        attrs.push((
            String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            String::from_utf8_lossy(&attr.value).into_owned(),
        ));
    }
    Ok(attrs)
}

fn attr_by_local<'a>(attrs: &'a [(String, String)], local: &str) -> Option<&'a str> {
    attrs.iter().find_map(|(k, v)| {
        let k_local = k.rsplit(':').next().unwrap_or(k);
        (k_local == local).then_some(v.as_str())
    })
}

impl SoapDocument {
    /// Parse `bytes` as XML and locate the SOAP structure.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Xml`] when the body is not well-formed XML or
    /// not UTF-8.
    pub fn parse(bytes: &[u8]) -> Result<Self, MessageError> {
        let source = std::str::from_utf8(bytes).map_err(malformed)?.to_string();
        let (root, envelope) = scan(&source)?;
        let root = root.ok_or_else(|| malformed("document has no root element"))?;
        Ok(Self {
            source,
            root,
            envelope,
        })
    }

    /// Local name of the document element.
    pub fn root_name(&self) -> &str {
        &self.root
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_soap(&self) -> bool {
        self.envelope.is_some()
    }

    pub fn version(&self) -> Option<SoapVersion> {
        self.envelope.as_ref().map(|e| e.version)
    }

    /// Local name of the first element inside `Body`.
    pub fn payload_name(&self) -> Option<&str> {
        self.envelope
            .as_ref()
            .and_then(|e| e.payload.as_ref())
            .map(|(name, _)| name.as_str())
    }

    /// True when the body's first element is a SOAP `Fault`.
    pub fn is_fault(&self) -> bool {
        self.envelope
            .as_ref()
            .and_then(|e| e.payload.as_ref())
            .is_some_and(|(_, fault)| *fault)
    }

    /// Security header blocks in document order.
    pub fn security_blocks(&self) -> &[SecurityBlock] {
        self.envelope
            .as_ref()
            .and_then(|e| e.header.as_ref())
            .map(|h| h.blocks.as_slice())
            .unwrap_or(&[])
    }

    /// Index of the block addressed to `actor` (`None` = default block).
    pub fn find_security_block(&self, actor: Option<&str>) -> Option<usize> {
        self.security_blocks()
            .iter()
            .position(|b| b.actor.as_deref() == actor)
    }

    /// Document text with block `index` removed.
    pub fn without_security_block(&self, index: usize) -> Option<String> {
        let block = self.security_blocks().get(index)?;
        Some(splice(&self.source, block.span.clone(), ""))
    }

    /// Document text with the actor/role and mustUnderstand attributes of
    /// block `index` removed. Other attributes are kept verbatim.
    pub fn with_block_unaddressed(&self, index: usize) -> Option<String> {
        let block = self.security_blocks().get(index)?;
        let mut tag = format!("<{}", block.qname);
        for (key, value) in &block.attributes {
            if SecurityBlock::is_addressing_attr(key) {
                continue;
            }
            tag.push_str(&format!(" {}=\"{}\"", key, value.replace('"', "&quot;")));
        }
        tag.push_str(if block.content_end.is_some() { ">" } else { "/>" });
        Some(splice(&self.source, block.start_tag.clone(), &tag))
    }

    /// Document text with `fragment` appended inside the default security
    /// block, creating the `Header` and `Security` elements when absent.
    ///
    /// Returns `None` when the document is not a SOAP envelope.
    pub fn with_default_security_content(&self, fragment: &str) -> Option<String> {
        let env = self.envelope.as_ref()?;
        let wrapped = format!("<wsse:Security xmlns:wsse=\"{WSSE_NS}\">{fragment}</wsse:Security>");

        if let Some(index) = self.find_security_block(None) {
            let block = &self.security_blocks()[index];
            return Some(match block.content_end {
                Some(end) => splice(&self.source, end..end, fragment),
                None => splice(&self.source, block.span.clone(), &wrapped),
            });
        }

        let header_qname = match &env.prefix {
            Some(p) => format!("{p}:Header"),
            None => "Header".to_string(),
        };
        Some(match &env.header {
            Some(HeaderLayout {
                empty_tag: Some(span),
                ..
            }) => splice(
                &self.source,
                span.clone(),
                &format!("<{header_qname}>{wrapped}</{header_qname}>"),
            ),
            Some(header) => splice(
                &self.source,
                header.content_end..header.content_end,
                &wrapped,
            ),
            None => splice(
                &self.source,
                env.start_tag_end..env.start_tag_end,
                &format!("<{header_qname}>{wrapped}</{header_qname}>"),
            ),
        })
    }
}

fn scan(source: &str) -> Result<(Option<String>, Option<EnvelopeLayout>), MessageError> {
    let mut reader = NsReader::from_str(source);
    let mut root: Option<String> = None;
    let mut envelope: Option<EnvelopeLayout> = None;
    let mut stack: Vec<String> = Vec::new();
    let mut open_block: Option<SecurityBlock> = None;
    let mut header_open = false;

    loop {
        let before = reader.buffer_position() as usize;
        let (ns, event) = {
            let (resolved, event) = reader.read_resolved_event().map_err(malformed)?;
            (bound_ns(&resolved).map(<[u8]>::to_vec), event)
        };
        let after = reader.buffer_position() as usize;
        let ns = ns.as_deref();

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let self_closing = matches!(event, Event::Empty(_));
                let local = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                let depth = stack.len();
                let env_ns = envelope.as_ref().map(|env| env.version.namespace().as_bytes());
                let parent = stack.last().map(String::as_str);

                if depth == 0 {
                    root = Some(local.clone());
                    if local == "Envelope" {
                        if let Some(version) = ns.and_then(SoapVersion::from_namespace) {
                            envelope = Some(EnvelopeLayout {
                                version,
                                prefix: e
                                    .name()
                                    .prefix()
                                    .map(|p| String::from_utf8_lossy(p.as_ref()).into_owned()),
                                start_tag_end: after,
                                header: None,
                                payload: None,
                            });
                        }
                    }
                } else if let Some(env_ns) = env_ns {
                    if depth == 1 && local == "Header" && ns == Some(env_ns) {
                        if self_closing {
                            if let Some(env) = envelope.as_mut() {
                                env.header = Some(HeaderLayout {
                                    empty_tag: Some(before..after),
                                    content_end: after,
                                    blocks: Vec::new(),
                                });
                            }
                        } else {
                            header_open = true;
                        }
                    } else if depth == 2
                        && header_open
                        && parent == Some("Header")
                        && local == "Security"
                        && is_security_ns(ns)
                    {
                        let attributes = read_attributes(e)?;
                        let actor = attr_by_local(&attributes, "actor")
                            .or_else(|| attr_by_local(&attributes, "role"))
                            .map(str::to_string);
                        let must_understand = matches!(
                            attr_by_local(&attributes, "mustUnderstand"),
                            Some("1") | Some("true")
                        );
                        let block = SecurityBlock {
                            actor,
                            must_understand,
                            qname: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                            attributes,
                            span: before..after,
                            start_tag: before..after,
                            content_end: None,
                        };
                        if self_closing {
                            push_block(&mut envelope, block);
                        } else {
                            open_block = Some(block);
                        }
                    } else if depth == 2 && parent == Some("Body") {
                        if let Some(env) = envelope.as_mut() {
                            if env.payload.is_none() {
                                let fault = local == "Fault" && ns == Some(env_ns);
                                env.payload = Some((local.clone(), fault));
                            }
                        }
                    }
                }

                if !self_closing {
                    stack.push(local);
                }
            }
            Event::End(_) => {
                let closed = stack.pop();
                let depth = stack.len();
                if depth == 2 && closed.as_deref() == Some("Security") {
                    if let Some(mut block) = open_block.take() {
                        block.content_end = Some(before);
                        block.span = block.span.start..after;
                        push_block(&mut envelope, block);
                    }
                } else if depth == 1 && header_open && closed.as_deref() == Some("Header") {
                    header_open = false;
                    if let Some(env) = envelope.as_mut() {
                        env.header
                            .get_or_insert(HeaderLayout {
                                empty_tag: None,
                                content_end: before,
                                blocks: Vec::new(),
                            })
                            .content_end = before;
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(malformed("unexpected end of document"));
    }
    Ok((root, envelope))
}

fn push_block(envelope: &mut Option<EnvelopeLayout>, block: SecurityBlock) {
    if let Some(env) = envelope.as_mut() {
        env.header
            .get_or_insert(HeaderLayout {
                empty_tag: None,
                content_end: block.span.end,
                blocks: Vec::new(),
            })
            .blocks
            .push(block);
    }
}

fn splice(source: &str, range: Range<usize>, replacement: &str) -> String {
    let mut out = String::with_capacity(source.len() + replacement.len());
    out.push_str(&source[..range.start]);
    out.push_str(replacement);
    out.push_str(&source[range.end..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_HEADERS: &str = concat!(
        r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/" "#,
        r#"xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd">"#,
        r#"<soap:Header>"#,
        r#"<wsse:Security soap:mustUnderstand="1"><tok>local</tok></wsse:Security>"#,
        r#"<wsse:Security soap:actor="backend"><tok>remote</tok></wsse:Security>"#,
        r#"</soap:Header>"#,
        r#"<soap:Body><m:order xmlns:m="urn:orders"/></soap:Body>"#,
        r#"</soap:Envelope>"#
    );

    #[test]
    fn locates_security_blocks() {
        let doc = SoapDocument::parse(TWO_HEADERS.as_bytes()).unwrap();
        assert!(doc.is_soap());
        assert_eq!(doc.version(), Some(SoapVersion::Soap11));
        assert_eq!(doc.payload_name(), Some("order"));
        assert!(!doc.is_fault());

        let blocks = doc.security_blocks();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].actor, None);
        assert!(blocks[0].must_understand);
        assert_eq!(blocks[1].actor.as_deref(), Some("backend"));
    }

    #[test]
    fn removes_a_block() {
        let doc = SoapDocument::parse(TWO_HEADERS.as_bytes()).unwrap();
        let out = doc.without_security_block(0).unwrap();
        assert!(!out.contains("local"));
        assert!(out.contains("remote"));
        let reparsed = SoapDocument::parse(out.as_bytes()).unwrap();
        assert_eq!(reparsed.security_blocks().len(), 1);
    }

    #[test]
    fn strips_addressing_attributes() {
        let doc = SoapDocument::parse(TWO_HEADERS.as_bytes()).unwrap();
        let out = doc.with_block_unaddressed(1).unwrap();
        let reparsed = SoapDocument::parse(out.as_bytes()).unwrap();
        let blocks = reparsed.security_blocks();
        assert_eq!(blocks[1].actor, None);
        assert!(!blocks[1].must_understand);
    }

    #[test]
    fn detects_fault() {
        let fault = concat!(
            r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">"#,
            r#"<s:Body><s:Fault><faultcode>s:Server</faultcode></s:Fault></s:Body></s:Envelope>"#
        );
        let doc = SoapDocument::parse(fault.as_bytes()).unwrap();
        assert!(doc.is_fault());
    }

    #[test]
    fn inserts_header_when_missing() {
        let bare = concat!(
            r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope">"#,
            r#"<s:Body><ping/></s:Body></s:Envelope>"#
        );
        let doc = SoapDocument::parse(bare.as_bytes()).unwrap();
        let out = doc.with_default_security_content("<token/>").unwrap();
        let reparsed = SoapDocument::parse(out.as_bytes()).unwrap();
        assert_eq!(reparsed.security_blocks().len(), 1);
        assert!(out.contains("<s:Header><wsse:Security"));
    }

    #[test]
    fn appends_into_existing_default_block() {
        let doc = SoapDocument::parse(TWO_HEADERS.as_bytes()).unwrap();
        let out = doc.with_default_security_content("<assertion/>").unwrap();
        assert!(out.contains("<tok>local</tok><assertion/></wsse:Security>"));
    }

    #[test]
    fn plain_xml_is_not_soap() {
        let doc = SoapDocument::parse(b"<order id=\"1\"/>").unwrap();
        assert!(!doc.is_soap());
        assert_eq!(doc.root_name(), "order");
        assert!(doc.with_default_security_content("<x/>").is_none());
    }

    #[test]
    fn rejects_malformed() {
        assert!(SoapDocument::parse(b"<a><b></a>").is_err());
        assert!(SoapDocument::parse(b"").is_err());
    }
}
