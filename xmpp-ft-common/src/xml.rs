//! XML codec for file-transfer IQs
//!
//! Stanzas are parsed with `quick-xml` into a small owned element tree and
//! then mapped onto the typed model in [`crate::stanza`]. Encoding goes the
//! other way. Namespaces are tracked through default `xmlns` declarations
//! only, which is how XMPP servers deliver stanzas in practice.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};

use crate::stanza::{
    BytestreamQuery, DataForm, ErrorCondition, ErrorType, FileDescription, FormField, FormKind,
    IbbClose, IbbData, IbbOpen, Iq, IqPayload, IqType, Range, Si, SiCondition, StanzaError,
    StreamhostEntry,
};
use crate::{Jid, NS_BYTESTREAM, NS_CLIENT, NS_DATA, NS_FEATURE, NS_FILE, NS_IBB, NS_SI, NS_STANZAS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input is not well-formed XML
    Xml(String),
    /// Input contained no element
    Empty,
    /// Top-level element is not an `<iq/>`
    NotAnIq(String),
    MissingAttribute(&'static str),
    InvalidAttribute { name: &'static str, value: String },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Xml(e) => write!(f, "malformed XML: {e}"),
            Self::Empty => f.write_str("no element in input"),
            Self::NotAnIq(name) => write!(f, "expected <iq/>, got <{name}/>"),
            Self::MissingAttribute(name) => write!(f, "missing attribute '{name}'"),
            Self::InvalidAttribute { name, value } => {
                write!(f, "invalid value '{value}' for attribute '{name}'")
            }
        }
    }
}

impl std::error::Error for CodecError {}

fn xml_error(e: impl fmt::Display) -> CodecError {
    CodecError::Xml(e.to_string())
}

// =============================================================================
// Element tree
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    pub name: String,
    pub namespace: Option<String>,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    #[must_use]
    pub fn new(name: &str, namespace: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn attr(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.attrs.push((key.to_string(), value.to_string()));
        self
    }

    #[must_use]
    pub fn opt_attr<T: fmt::Display>(self, key: &str, value: Option<T>) -> Self {
        match value {
            Some(value) => self.attr(key, value),
            None => self,
        }
    }

    #[must_use]
    pub fn child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    #[must_use]
    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn owned_attr(&self, key: &str) -> Option<String> {
        self.get_attr(key).map(str::to_string)
    }

    /// First child with the given name and namespace
    #[must_use]
    pub fn find(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.children
            .iter()
            .find(|c| c.name == name && c.namespace.as_deref() == Some(namespace))
    }

    pub fn find_all<'a>(
        &'a self,
        name: &'a str,
        namespace: &'a str,
    ) -> impl Iterator<Item = &'a Element> + 'a {
        self.children
            .iter()
            .filter(move |c| c.name == name && c.namespace.as_deref() == Some(namespace))
    }

    /// Parse a single XML fragment
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Xml` for malformed input and `CodecError::Empty`
    /// if no element was found.
    pub fn parse(xml: &str) -> Result<Element, CodecError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let element = start_element(&e, stack.last())?;
                    stack.push(element);
                }
                Ok(Event::Empty(e)) => {
                    let element = start_element(&e, stack.last())?;
                    attach(&mut stack, &mut root, element);
                }
                Ok(Event::End(_)) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| CodecError::Xml("unbalanced end tag".to_string()))?;
                    attach(&mut stack, &mut root, element);
                }
                Ok(Event::Text(t)) => {
                    let text = t.unescape().map_err(xml_error)?;
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&text);
                    }
                }
                Ok(Event::CData(c)) => {
                    let bytes = c.into_inner();
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&String::from_utf8_lossy(&bytes));
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(xml_error(e)),
            }
        }

        if !stack.is_empty() {
            return Err(CodecError::Xml("unclosed element".to_string()));
        }
        root.ok_or(CodecError::Empty)
    }

    /// Serialize, declaring a namespace only where it changes
    #[must_use]
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write(&mut out, None);
        out
    }

    fn write(&self, out: &mut String, parent_ns: Option<&str>) {
        out.push('<');
        out.push_str(&self.name);
        if let Some(ns) = self.namespace.as_deref()
            && Some(ns) != parent_ns
        {
            push_attr(out, "xmlns", ns);
        }
        for (key, value) in &self.attrs {
            push_attr(out, key, value);
        }
        if self.children.is_empty() && self.text.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&escape(self.text.as_str()));
        for child in &self.children {
            child.write(out, self.namespace.as_deref());
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

fn push_attr(out: &mut String, key: &str, value: &str) {
    out.push(' ');
    out.push_str(key);
    out.push_str("='");
    out.push_str(&escape(value));
    out.push('\'');
}

fn start_element(e: &BytesStart<'_>, parent: Option<&Element>) -> Result<Element, CodecError> {
    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
    let mut namespace = parent.and_then(|p| p.namespace.clone());
    let mut attrs = Vec::new();

    for attr in e.attributes() {
        let attr = attr.map_err(xml_error)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(xml_error)?.into_owned();
        if key == "xmlns" {
            namespace = Some(value);
        } else if !key.starts_with("xmlns:") {
            attrs.push((key, value));
        }
    }

    Ok(Element {
        name,
        namespace,
        attrs,
        children: Vec::new(),
        text: String::new(),
    })
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
    } else if root.is_none() {
        *root = Some(element);
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode a serialized `<iq/>`
///
/// # Errors
///
/// Returns a `CodecError` if the input is not a well-formed IQ.
pub fn decode_iq(xml: &str) -> Result<Iq, CodecError> {
    iq_from_element(&Element::parse(xml)?)
}

/// Map a parsed element onto the typed IQ model
///
/// # Errors
///
/// Returns a `CodecError` if the element is not a well-formed IQ.
pub fn iq_from_element(el: &Element) -> Result<Iq, CodecError> {
    if el.name != "iq" {
        return Err(CodecError::NotAnIq(el.name.clone()));
    }
    let type_attr = el
        .get_attr("type")
        .ok_or(CodecError::MissingAttribute("type"))?;
    let kind = IqType::parse(type_attr).ok_or_else(|| CodecError::InvalidAttribute {
        name: "type",
        value: type_attr.to_string(),
    })?;
    let id = el
        .owned_attr("id")
        .ok_or(CodecError::MissingAttribute("id"))?;
    let from = parse_jid_attr(el, "from")?;
    let to = parse_jid_attr(el, "to")?;

    let payload = if kind == IqType::Error {
        match el.children.iter().find(|c| c.name == "error") {
            Some(error) => IqPayload::Error(decode_error(error)),
            None => el.children.first().map_or(IqPayload::Empty, decode_payload),
        }
    } else {
        el.children.first().map_or(IqPayload::Empty, decode_payload)
    };

    Ok(Iq {
        id,
        from,
        to,
        kind,
        payload,
    })
}

fn parse_jid_attr(el: &Element, name: &'static str) -> Result<Option<Jid>, CodecError> {
    match el.get_attr(name) {
        None => Ok(None),
        Some(value) => Jid::parse(value)
            .map(Some)
            .map_err(|_| CodecError::InvalidAttribute {
                name,
                value: value.to_string(),
            }),
    }
}

fn decode_payload(el: &Element) -> IqPayload {
    match (el.name.as_str(), el.namespace.as_deref()) {
        ("si", Some(NS_SI)) => IqPayload::Si(decode_si(el)),
        ("query", Some(NS_BYTESTREAM)) => IqPayload::Bytestream(decode_bytestream(el)),
        ("open", Some(NS_IBB)) => IqPayload::IbbOpen(IbbOpen {
            sid: el.owned_attr("sid"),
            block_size: el.owned_attr("block-size"),
            stanza: el.owned_attr("stanza"),
        }),
        ("data", Some(NS_IBB)) => {
            let cleaned: String = el.text.chars().filter(|c| !c.is_whitespace()).collect();
            IqPayload::IbbData(IbbData {
                sid: el.owned_attr("sid"),
                seq: el.owned_attr("seq"),
                data: STANDARD.decode(cleaned.as_bytes()).ok(),
            })
        }
        ("close", Some(NS_IBB)) => IqPayload::IbbClose(IbbClose {
            sid: el.owned_attr("sid"),
        }),
        ("error", _) => IqPayload::Error(decode_error(el)),
        _ => IqPayload::Unknown {
            name: el.name.clone(),
            namespace: el.namespace.clone(),
        },
    }
}

fn decode_si(el: &Element) -> Si {
    Si {
        id: el.owned_attr("id"),
        profile: el.owned_attr("profile"),
        mime_type: el.owned_attr("mime-type"),
        file: el.find("file", NS_FILE).map(decode_file),
        feature: el
            .find("feature", NS_FEATURE)
            .and_then(|f| f.find("x", NS_DATA))
            .map(decode_form),
    }
}

fn decode_file(el: &Element) -> FileDescription {
    FileDescription {
        name: el.owned_attr("name"),
        size: el.get_attr("size").and_then(|s| s.trim().parse().ok()),
        hash: el.owned_attr("hash"),
        date: el.owned_attr("date"),
        desc: el.find("desc", NS_FILE).map(|d| d.text.clone()),
        range: el.find("range", NS_FILE).map(|r| Range {
            offset: r.get_attr("offset").and_then(|s| s.trim().parse().ok()),
            length: r.get_attr("length").and_then(|s| s.trim().parse().ok()),
        }),
    }
}

fn decode_form(el: &Element) -> DataForm {
    let kind = el
        .get_attr("type")
        .and_then(FormKind::parse)
        .unwrap_or(FormKind::Form);
    let fields = el
        .find_all("field", NS_DATA)
        .map(|field| FormField {
            var: field.owned_attr("var").unwrap_or_default(),
            field_type: field.owned_attr("type"),
            options: field
                .find_all("option", NS_DATA)
                .filter_map(|opt| opt.find("value", NS_DATA))
                .map(|v| v.text.clone())
                .collect(),
            values: field
                .find_all("value", NS_DATA)
                .map(|v| v.text.clone())
                .collect(),
        })
        .collect();
    DataForm { kind, fields }
}

fn decode_bytestream(el: &Element) -> BytestreamQuery {
    BytestreamQuery {
        sid: el.owned_attr("sid"),
        streamhosts: el
            .find_all("streamhost", NS_BYTESTREAM)
            .map(|sh| StreamhostEntry {
                jid: sh.owned_attr("jid"),
                host: sh.owned_attr("host"),
                port: sh.owned_attr("port"),
            })
            .collect(),
        streamhost_used: el
            .find("streamhost-used", NS_BYTESTREAM)
            .and_then(|used| used.owned_attr("jid")),
        activate: el
            .find("activate", NS_BYTESTREAM)
            .map(|a| a.text.trim().to_string())
            .filter(|s| !s.is_empty()),
    }
}

fn decode_error(el: &Element) -> StanzaError {
    let error_type = el
        .get_attr("type")
        .and_then(ErrorType::parse)
        .unwrap_or(ErrorType::Cancel);
    let condition = el
        .children
        .iter()
        .find(|c| c.namespace.as_deref() == Some(NS_STANZAS) && c.name != "text")
        .map_or_else(
            || ErrorCondition::Other("undefined-condition".to_string()),
            |c| ErrorCondition::parse(&c.name),
        );
    let si_condition = el
        .children
        .iter()
        .filter(|c| c.namespace.as_deref() == Some(NS_SI))
        .find_map(|c| SiCondition::parse(&c.name));
    StanzaError {
        error_type,
        condition,
        si_condition,
        code: el.get_attr("code").and_then(|c| c.parse().ok()),
        text: el.find("text", NS_STANZAS).map(|t| t.text.clone()),
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Serialize an IQ to a string
#[must_use]
pub fn encode_iq(iq: &Iq) -> String {
    iq_to_element(iq).to_xml()
}

#[must_use]
pub fn iq_to_element(iq: &Iq) -> Element {
    let mut el = Element::new("iq", Some(NS_CLIENT))
        .attr("type", iq.kind)
        .attr("id", &iq.id)
        .opt_attr("from", iq.from.as_ref())
        .opt_attr("to", iq.to.as_ref());
    if let Some(payload) = encode_payload(&iq.payload) {
        el = el.child(payload);
    }
    el
}

fn encode_payload(payload: &IqPayload) -> Option<Element> {
    match payload {
        IqPayload::Si(si) => Some(encode_si(si)),
        IqPayload::Bytestream(query) => Some(encode_bytestream(query)),
        IqPayload::IbbOpen(open) => Some(
            Element::new("open", Some(NS_IBB))
                .opt_attr("sid", open.sid.as_ref())
                .opt_attr("block-size", open.block_size.as_ref())
                .opt_attr("stanza", open.stanza.as_ref()),
        ),
        IqPayload::IbbData(data) => Some(
            Element::new("data", Some(NS_IBB))
                .opt_attr("sid", data.sid.as_ref())
                .opt_attr("seq", data.seq.as_ref())
                .with_text(
                    data.data
                        .as_ref()
                        .map(|bytes| STANDARD.encode(bytes))
                        .unwrap_or_default(),
                ),
        ),
        IqPayload::IbbClose(close) => {
            Some(Element::new("close", Some(NS_IBB)).opt_attr("sid", close.sid.as_ref()))
        }
        IqPayload::Error(error) => Some(encode_error(error)),
        IqPayload::Empty => None,
        IqPayload::Unknown { name, namespace } => Some(Element::new(name, namespace.as_deref())),
    }
}

fn encode_si(si: &Si) -> Element {
    let mut el = Element::new("si", Some(NS_SI))
        .opt_attr("id", si.id.as_ref())
        .opt_attr("profile", si.profile.as_ref())
        .opt_attr("mime-type", si.mime_type.as_ref());
    if let Some(file) = &si.file {
        el = el.child(encode_file(file));
    }
    if let Some(form) = &si.feature {
        el = el.child(Element::new("feature", Some(NS_FEATURE)).child(encode_form(form)));
    }
    el
}

fn encode_file(file: &FileDescription) -> Element {
    let mut el = Element::new("file", Some(NS_FILE))
        .opt_attr("name", file.name.as_ref())
        .opt_attr("size", file.size)
        .opt_attr("hash", file.hash.as_ref())
        .opt_attr("date", file.date.as_ref());
    if let Some(desc) = &file.desc {
        el = el.child(Element::new("desc", Some(NS_FILE)).with_text(desc.clone()));
    }
    if let Some(range) = &file.range {
        el = el.child(
            Element::new("range", Some(NS_FILE))
                .opt_attr("offset", range.offset)
                .opt_attr("length", range.length),
        );
    }
    el
}

fn encode_form(form: &DataForm) -> Element {
    let mut el = Element::new("x", Some(NS_DATA)).attr("type", form.kind.as_str());
    for field in &form.fields {
        let mut f = Element::new("field", Some(NS_DATA))
            .attr("var", &field.var)
            .opt_attr("type", field.field_type.as_ref());
        for option in &field.options {
            f = f.child(
                Element::new("option", Some(NS_DATA))
                    .child(Element::new("value", Some(NS_DATA)).with_text(option.clone())),
            );
        }
        for value in &field.values {
            f = f.child(Element::new("value", Some(NS_DATA)).with_text(value.clone()));
        }
        el = el.child(f);
    }
    el
}

fn encode_bytestream(query: &BytestreamQuery) -> Element {
    let mut el = Element::new("query", Some(NS_BYTESTREAM)).opt_attr("sid", query.sid.as_ref());
    for host in &query.streamhosts {
        el = el.child(
            Element::new("streamhost", Some(NS_BYTESTREAM))
                .opt_attr("jid", host.jid.as_ref())
                .opt_attr("host", host.host.as_ref())
                .opt_attr("port", host.port.as_ref()),
        );
    }
    if let Some(jid) = &query.streamhost_used {
        el = el.child(Element::new("streamhost-used", Some(NS_BYTESTREAM)).attr("jid", jid));
    }
    if let Some(target) = &query.activate {
        el = el.child(Element::new("activate", Some(NS_BYTESTREAM)).with_text(target.clone()));
    }
    el
}

fn encode_error(error: &StanzaError) -> Element {
    let mut el = Element::new("error", Some(NS_CLIENT))
        .attr("type", error.error_type.as_str())
        .opt_attr("code", error.code);
    el = el.child(Element::new(error.condition.as_str(), Some(NS_STANZAS)));
    if let Some(si) = error.si_condition {
        el = el.child(Element::new(si.as_str(), Some(NS_SI)));
    }
    if let Some(text) = &error.text {
        el = el.child(Element::new("text", Some(NS_STANZAS)).with_text(text.clone()));
    }
    el
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::STREAM_METHOD_FIELD;

    const OFFER: &str = "<iq xmlns='jabber:client' type='set' id='s5b_4f2a' \
        from='alice@example.com/home' to='bob@example.com/work'>\
        <si xmlns='http://jabber.org/protocol/si' id='s5b_4f2a' mime-type='text/plain' \
            profile='http://jabber.org/protocol/si/profile/file-transfer'>\
          <file xmlns='http://jabber.org/protocol/si/profile/file-transfer' \
                name='notes &amp; todo.txt' size='1022'>\
            <desc>Weekly notes</desc>\
            <range/>\
          </file>\
          <feature xmlns='http://jabber.org/protocol/feature-neg'>\
            <x xmlns='jabber:x:data' type='form'>\
              <field var='stream-method' type='list-single'>\
                <option><value>http://jabber.org/protocol/bytestreams</value></option>\
                <option><value>http://jabber.org/protocol/ibb</value></option>\
              </field>\
            </x>\
          </feature>\
        </si>\
        </iq>";

    #[test]
    fn test_decode_offer() {
        let iq = decode_iq(OFFER).unwrap();
        assert_eq!(iq.kind, IqType::Set);
        assert_eq!(iq.id, "s5b_4f2a");
        assert_eq!(iq.from.unwrap().to_string(), "alice@example.com/home");

        let IqPayload::Si(si) = iq.payload else {
            panic!("expected SI payload");
        };
        assert_eq!(si.profile.as_deref(), Some(NS_FILE));
        assert_eq!(si.mime_type.as_deref(), Some("text/plain"));
        let file = si.file.clone().unwrap();
        assert_eq!(file.name.as_deref(), Some("notes & todo.txt"));
        assert_eq!(file.size, Some(1022));
        assert_eq!(file.desc.as_deref(), Some("Weekly notes"));
        assert_eq!(file.range, Some(Range::default()));
        assert_eq!(si.stream_methods(), vec![NS_BYTESTREAM, NS_IBB]);
    }

    #[test]
    fn test_offer_survives_reencoding() {
        let iq = decode_iq(OFFER).unwrap();
        let again = decode_iq(&encode_iq(&iq)).unwrap();
        assert_eq!(again, iq);
    }

    #[test]
    fn test_encode_answer() {
        let si = Si {
            file: Some(FileDescription {
                range: Some(Range {
                    offset: Some(512),
                    length: None,
                }),
                ..Default::default()
            }),
            feature: Some(DataForm::submit(STREAM_METHOD_FIELD, NS_IBB)),
            ..Default::default()
        };
        let iq = Iq::new(IqType::Result, "s5b_4f2a", None, IqPayload::Si(si));
        let xml = encode_iq(&iq);
        assert!(xml.contains("<x xmlns='jabber:x:data' type='submit'>"));
        assert!(xml.contains("<range offset='512'/>"));
        assert!(xml.contains("<value>http://jabber.org/protocol/ibb</value>"));
        assert!(!xml.contains("to="));
    }

    #[test]
    fn test_decode_streamhosts() {
        let xml = "<iq type='set' id='id_abc' from='alice@example.com/home'>\
            <query xmlns='http://jabber.org/protocol/bytestreams' sid='abc'>\
              <streamhost jid='alice@example.com/home' host='192.168.1.5' port='28011'/>\
              <streamhost jid='proxy.example.com' host='203.0.113.7' port='7777'/>\
              <streamhost host='10.0.0.1'/>\
            </query></iq>";
        let iq = decode_iq(xml).unwrap();
        let IqPayload::Bytestream(query) = iq.payload else {
            panic!("expected bytestream query");
        };
        assert_eq!(query.sid.as_deref(), Some("abc"));
        assert_eq!(query.streamhosts.len(), 3);
        assert_eq!(query.streamhosts[1].host.as_deref(), Some("203.0.113.7"));
        assert_eq!(query.streamhosts[1].port.as_deref(), Some("7777"));
        assert_eq!(query.streamhosts[2].jid, None);
    }

    #[test]
    fn test_decode_streamhost_used_and_activate() {
        let used = decode_iq(
            "<iq type='result' id='id_abc'>\
             <query xmlns='http://jabber.org/protocol/bytestreams'>\
             <streamhost-used jid='proxy.example.com'/></query></iq>",
        )
        .unwrap();
        let IqPayload::Bytestream(query) = used.payload else {
            panic!("expected bytestream query");
        };
        assert_eq!(query.streamhost_used.as_deref(), Some("proxy.example.com"));

        let activate = Iq::new(
            IqType::Set,
            "au_abc",
            Some(Jid::parse("proxy.example.com").unwrap()),
            IqPayload::Bytestream(BytestreamQuery {
                sid: Some("abc".into()),
                activate: Some("bob@example.com/work".into()),
                ..Default::default()
            }),
        );
        let xml = encode_iq(&activate);
        assert!(xml.contains("<activate>bob@example.com/work</activate>"));
    }

    #[test]
    fn test_decode_error_with_si_condition() {
        let xml = "<iq type='error' id='s5b_1' from='bob@example.com/work'>\
            <error code='400' type='cancel'>\
              <bad-request xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
              <no-valid-streams xmlns='http://jabber.org/protocol/si'/>\
            </error></iq>";
        let iq = decode_iq(xml).unwrap();
        let IqPayload::Error(error) = iq.payload else {
            panic!("expected error payload");
        };
        assert_eq!(error.error_type, ErrorType::Cancel);
        assert_eq!(error.condition, ErrorCondition::BadRequest);
        assert_eq!(error.si_condition, Some(SiCondition::NoValidStreams));
        assert_eq!(error.code, Some(400));
        assert_eq!(error.text, None);
    }

    #[test]
    fn test_error_encoding() {
        let error = StanzaError::new(ErrorType::Cancel, ErrorCondition::Forbidden)
            .with_code(403)
            .with_text("Offer Declined");
        let iq = Iq::new(IqType::Error, "x", None, IqPayload::Error(error.clone()));
        let back = decode_iq(&encode_iq(&iq)).unwrap();
        assert_eq!(back.payload, IqPayload::Error(error));
    }

    #[test]
    fn test_ibb_data() {
        let iq = decode_iq(
            "<iq type='set' id='ibb1'>\
             <data xmlns='http://jabber.org/protocol/ibb' sid='i1' seq='0'>aGVs\nbG8=</data></iq>",
        )
        .unwrap();
        assert_eq!(
            iq.payload,
            IqPayload::IbbData(IbbData {
                sid: Some("i1".into()),
                seq: Some("0".into()),
                data: Some(b"hello".to_vec()),
            })
        );

        let garbled = decode_iq(
            "<iq type='set' id='ibb2'>\
             <data xmlns='http://jabber.org/protocol/ibb' sid='i1' seq='1'>!!notbase64</data></iq>",
        )
        .unwrap();
        let IqPayload::IbbData(data) = garbled.payload else {
            panic!("expected IBB data");
        };
        assert_eq!(data.data, None);
    }

    #[test]
    fn test_unknown_and_empty_payloads() {
        let iq =
            decode_iq("<iq type='get' id='v1'><query xmlns='jabber:iq:version'/></iq>").unwrap();
        assert_eq!(
            iq.payload,
            IqPayload::Unknown {
                name: "query".into(),
                namespace: Some("jabber:iq:version".into()),
            }
        );
        let iq = decode_iq("<iq type='result' id='v2'/>").unwrap();
        assert_eq!(iq.payload, IqPayload::Empty);
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            decode_iq("<message id='1'/>"),
            Err(CodecError::NotAnIq("message".into()))
        );
        assert_eq!(
            decode_iq("<iq id='1'/>"),
            Err(CodecError::MissingAttribute("type"))
        );
        assert_eq!(
            decode_iq("<iq type='set'/>"),
            Err(CodecError::MissingAttribute("id"))
        );
        assert!(matches!(
            decode_iq("<iq type='poke' id='1'/>"),
            Err(CodecError::InvalidAttribute { name: "type", .. })
        ));
        assert!(matches!(
            decode_iq("<iq type='set' id='1' from='@bad'/>"),
            Err(CodecError::InvalidAttribute { name: "from", .. })
        ));
        assert!(matches!(decode_iq("<iq type='set' id='1'>"), Err(CodecError::Xml(_))));
        assert_eq!(decode_iq(""), Err(CodecError::Empty));
    }

    #[test]
    fn test_escaping() {
        let el = Element::new("desc", None).attr("note", "it's <b>").with_text("a & b");
        assert_eq!(
            el.to_xml(),
            "<desc note='it&apos;s &lt;b&gt;'>a &amp; b</desc>"
        );
        let back = Element::parse(&el.to_xml()).unwrap();
        assert_eq!(back.get_attr("note"), Some("it's <b>"));
        assert_eq!(back.text, "a & b");
    }
}
