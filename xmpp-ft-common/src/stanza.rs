//! Typed IQ stanzas for file-transfer negotiation
//!
//! Only the payloads the negotiation core reads or writes are modelled:
//! stream initiation offers and answers, SOCKS5 bytestream queries, IBB
//! open/data/close and stanza errors. Anything else decodes to
//! [`IqPayload::Unknown`] so the caller can report it as unhandled.
//!
//! Attribute values a peer controls and which need validation (IBB
//! `block-size` and `seq`, streamhost ports) are kept as received; the
//! component that consumes them decides what is malformed.

use std::fmt;

use crate::Jid;

// =============================================================================
// IQ envelope
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Result => "result",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "get" => Some(Self::Get),
            "set" => Some(Self::Set),
            "result" => Some(Self::Result),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for IqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Iq {
    pub id: String,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub kind: IqType,
    pub payload: IqPayload,
}

impl Iq {
    #[must_use]
    pub fn new(kind: IqType, id: impl Into<String>, to: Option<Jid>, payload: IqPayload) -> Self {
        Self {
            id: id.into(),
            from: None,
            to,
            kind,
            payload,
        }
    }

    /// Build a reply addressed back to the sender, reusing the id
    #[must_use]
    pub fn reply(&self, kind: IqType, payload: IqPayload) -> Self {
        Self {
            id: self.id.clone(),
            from: self.to.clone(),
            to: self.from.clone(),
            kind,
            payload,
        }
    }

    /// Empty `result` reply
    #[must_use]
    pub fn ack(&self) -> Self {
        self.reply(IqType::Result, IqPayload::Empty)
    }

    /// `error` reply carrying the given error
    #[must_use]
    pub fn error_reply(&self, error: StanzaError) -> Self {
        self.reply(IqType::Error, IqPayload::Error(error))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IqPayload {
    Si(Si),
    Bytestream(BytestreamQuery),
    IbbOpen(IbbOpen),
    IbbData(IbbData),
    IbbClose(IbbClose),
    Error(StanzaError),
    Empty,
    Unknown { name: String, namespace: Option<String> },
}

// =============================================================================
// Stream initiation
// =============================================================================

/// `<si/>` element, used both for offers (set) and answers (result)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Si {
    pub id: Option<String>,
    pub profile: Option<String>,
    pub mime_type: Option<String>,
    pub file: Option<FileDescription>,
    pub feature: Option<DataForm>,
}

impl Si {
    /// Values of the `stream-method` field, options for offers and
    /// submitted values for answers
    #[must_use]
    pub fn stream_methods(&self) -> Vec<String> {
        self.feature
            .as_ref()
            .and_then(|form| form.field(crate::STREAM_METHOD_FIELD))
            .map(|field| {
                if field.options.is_empty() {
                    field.values.clone()
                } else {
                    field.options.clone()
                }
            })
            .unwrap_or_default()
    }
}

/// `<file/>` element of the file-transfer profile
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileDescription {
    pub name: Option<String>,
    pub size: Option<u64>,
    pub hash: Option<String>,
    pub date: Option<String>,
    pub desc: Option<String>,
    pub range: Option<Range>,
}

/// `<range/>` element; an empty range means "I support ranged transfers"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Range {
    pub offset: Option<u64>,
    pub length: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormKind {
    Form,
    Submit,
}

impl FormKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Form => "form",
            Self::Submit => "submit",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "form" => Some(Self::Form),
            "submit" => Some(Self::Submit),
            _ => None,
        }
    }
}

/// Data form inside `<feature/>`
#[derive(Debug, Clone, PartialEq)]
pub struct DataForm {
    pub kind: FormKind,
    pub fields: Vec<FormField>,
}

impl DataForm {
    /// Offer form with a single `list-single` field
    #[must_use]
    pub fn list_single(var: &str, options: &[&str]) -> Self {
        Self {
            kind: FormKind::Form,
            fields: vec![FormField {
                var: var.to_string(),
                field_type: Some("list-single".to_string()),
                options: options.iter().map(|s| (*s).to_string()).collect(),
                values: Vec::new(),
            }],
        }
    }

    /// Submitted form with one chosen value
    #[must_use]
    pub fn submit(var: &str, value: &str) -> Self {
        Self {
            kind: FormKind::Submit,
            fields: vec![FormField {
                var: var.to_string(),
                field_type: None,
                options: Vec::new(),
                values: vec![value.to_string()],
            }],
        }
    }

    #[must_use]
    pub fn field(&self, var: &str) -> Option<&FormField> {
        self.fields.iter().find(|f| f.var == var)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormField {
    pub var: String,
    pub field_type: Option<String>,
    pub options: Vec<String>,
    pub values: Vec<String>,
}

// =============================================================================
// SOCKS5 bytestreams
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BytestreamQuery {
    pub sid: Option<String>,
    pub streamhosts: Vec<StreamhostEntry>,
    pub streamhost_used: Option<String>,
    pub activate: Option<String>,
}

/// `<streamhost/>` as sent on the wire
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamhostEntry {
    pub jid: Option<String>,
    pub host: Option<String>,
    pub port: Option<String>,
}

impl StreamhostEntry {
    #[must_use]
    pub fn new(jid: &Jid, host: &str, port: u16) -> Self {
        Self {
            jid: Some(jid.to_string()),
            host: Some(host.to_string()),
            port: Some(port.to_string()),
        }
    }
}

// =============================================================================
// In-band bytestreams
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IbbOpen {
    pub sid: Option<String>,
    pub block_size: Option<String>,
    pub stanza: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IbbData {
    pub sid: Option<String>,
    pub seq: Option<String>,
    /// Decoded payload, `None` if the element text was not valid base64
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IbbClose {
    pub sid: Option<String>,
}

// =============================================================================
// Stanza errors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Cancel,
    Continue,
    Modify,
    Auth,
    Wait,
}

impl ErrorType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cancel => "cancel",
            Self::Continue => "continue",
            Self::Modify => "modify",
            Self::Auth => "auth",
            Self::Wait => "wait",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cancel" => Some(Self::Cancel),
            "continue" => Some(Self::Continue),
            "modify" => Some(Self::Modify),
            "auth" => Some(Self::Auth),
            "wait" => Some(Self::Wait),
            _ => None,
        }
    }
}

/// Defined conditions used by file transfers; everything else is kept verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCondition {
    BadRequest,
    Forbidden,
    ItemNotFound,
    NotAcceptable,
    NotAllowed,
    ServiceUnavailable,
    UnexpectedRequest,
    Other(String),
}

impl ErrorCondition {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Forbidden => "forbidden",
            Self::ItemNotFound => "item-not-found",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::ServiceUnavailable => "service-unavailable",
            Self::UnexpectedRequest => "unexpected-request",
            Self::Other(name) => name,
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "bad-request" => Self::BadRequest,
            "forbidden" => Self::Forbidden,
            "item-not-found" => Self::ItemNotFound,
            "not-acceptable" => Self::NotAcceptable,
            "not-allowed" => Self::NotAllowed,
            "service-unavailable" => Self::ServiceUnavailable,
            "unexpected-request" => Self::UnexpectedRequest,
            other => Self::Other(other.to_string()),
        }
    }
}

/// SI specific application conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiCondition {
    NoValidStreams,
    BadProfile,
}

impl SiCondition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoValidStreams => "no-valid-streams",
            Self::BadProfile => "bad-profile",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "no-valid-streams" => Some(Self::NoValidStreams),
            "bad-profile" => Some(Self::BadProfile),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StanzaError {
    pub error_type: ErrorType,
    pub condition: ErrorCondition,
    pub si_condition: Option<SiCondition>,
    /// Legacy numeric code
    pub code: Option<u16>,
    pub text: Option<String>,
}

impl StanzaError {
    #[must_use]
    pub fn new(error_type: ErrorType, condition: ErrorCondition) -> Self {
        Self {
            error_type,
            condition,
            si_condition: None,
            code: None,
            text: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    #[must_use]
    pub fn with_si_condition(mut self, condition: SiCondition) -> Self {
        self.si_condition = Some(condition);
        self
    }

    /// Best available human readable description
    #[must_use]
    pub fn describe(&self) -> String {
        match &self.text {
            Some(text) => text.clone(),
            None => self.condition.as_str().to_string(),
        }
    }
}
