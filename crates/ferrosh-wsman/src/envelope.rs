use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use uuid::Uuid;

use crate::WsmanError;
use crate::duration::Iso8601Duration;

pub(crate) const NS_SOAP: &str = "http://www.w3.org/2003/05/soap-envelope";
pub(crate) const NS_ADDRESSING: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
pub(crate) const NS_WSMAN: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
pub(crate) const NS_WSMAN_MS: &str = "http://schemas.microsoft.com/wbem/wsman/1/wsman.xsd";
pub(crate) const NS_SHELL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";
pub(crate) const NS_ENUMERATION: &str = "http://schemas.xmlsoap.org/ws/2004/09/enumeration";

const ANONYMOUS_ADDRESS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

/// The MS-WSMV actions this client issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Delete,
    Command,
    Send,
    Receive,
    Signal,
    Disconnect,
    Reconnect,
    Enumerate,
}

impl Action {
    pub fn uri(self) -> &'static str {
        match self {
            Self::Create => "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create",
            Self::Delete => "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete",
            Self::Command => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command",
            Self::Send => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Send",
            Self::Receive => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive",
            Self::Signal => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal",
            Self::Disconnect => {
                "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Disconnect"
            }
            Self::Reconnect => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Reconnect",
            Self::Enumerate => "http://schemas.xmlsoap.org/ws/2004/09/enumeration/Enumerate",
        }
    }
}

/// Ordered selector list rendered into `<w:SelectorSet>`.
#[derive(Debug, Clone, Default)]
pub struct SelectorSet(pub Vec<(String, String)>);

impl SelectorSet {
    pub fn shell_id(id: Uuid) -> Self {
        Self(vec![(
            "ShellId".to_owned(),
            id.as_hyphenated().to_string().to_uppercase(),
        )])
    }
}

/// Ordered option list rendered into `<w:OptionSet>`.
#[derive(Debug, Clone, Default)]
pub struct OptionSet(pub Vec<(String, String, bool)>);

impl OptionSet {
    pub fn add(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push((name.into(), value.into(), false));
        self
    }

    pub fn add_must_comply(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push((name.into(), value.into(), true));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Connection-scoped WSMan settings; every envelope for one pool is built
/// through the same instance so SessionId and sizing stay coherent.
#[derive(Debug, Clone, typed_builder::TypedBuilder)]
pub struct WsMan {
    #[builder(setter(into))]
    pub to: String,
    /// In bytes; WinRM's default configuration allows 500 KiB.
    #[builder(default = 512_000)]
    pub max_envelope_size: usize,
    #[builder(default = Iso8601Duration::from_secs(60))]
    pub operation_timeout: Iso8601Duration,
    #[builder(default = String::from("en-US"), setter(into))]
    pub locale: String,
    #[builder(default = String::from("en-US"), setter(into))]
    pub data_locale: String,
    #[builder(default = Uuid::new_v4())]
    pub session_id: Uuid,
}

pub(crate) fn write_text_element<W: std::io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    attrs: &[(&str, &str)],
    text: &str,
) -> Result<(), quick_xml::Error> {
    let mut start = BytesStart::new(name);
    for (key, value) in attrs {
        start.push_attribute((*key, *value));
    }
    writer.write_event(Event::Start(start))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

pub(crate) fn write_empty_element<W: std::io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    attrs: &[(&str, &str)],
) -> Result<(), quick_xml::Error> {
    let mut start = BytesStart::new(name);
    for (key, value) in attrs {
        start.push_attribute((*key, *value));
    }
    writer.write_event(Event::Empty(start))?;
    Ok(())
}

impl WsMan {
    /// Render one complete request envelope. The body is written by the
    /// caller through `write_body`; an empty closure yields `<s:Body />`.
    pub fn envelope<F>(
        &self,
        action: Action,
        resource_uri: &str,
        selectors: Option<&SelectorSet>,
        options: Option<&OptionSet>,
        operation_timeout: Option<Iso8601Duration>,
        write_body: F,
    ) -> Result<String, WsmanError>
    where
        F: FnOnce(&mut Writer<Vec<u8>>) -> Result<(), quick_xml::Error>,
    {
        let mut writer = Writer::new(Vec::new());
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut envelope = BytesStart::new("s:Envelope");
        for (prefix, uri) in [
            ("xmlns:s", NS_SOAP),
            ("xmlns:a", NS_ADDRESSING),
            ("xmlns:w", NS_WSMAN),
            ("xmlns:p", NS_WSMAN_MS),
            ("xmlns:rsp", NS_SHELL),
            ("xmlns:n", NS_ENUMERATION),
        ] {
            envelope.push_attribute((prefix, uri));
        }
        writer.write_event(Event::Start(envelope))?;

        self.write_header(
            &mut writer,
            action,
            resource_uri,
            selectors,
            options,
            operation_timeout,
        )?;

        writer.write_event(Event::Start(BytesStart::new("s:Body")))?;
        write_body(&mut writer)?;
        writer.write_event(Event::End(BytesEnd::new("s:Body")))?;

        writer.write_event(Event::End(BytesEnd::new("s:Envelope")))?;

        let bytes = writer.into_inner();
        String::from_utf8(bytes)
            .map_err(|e| WsmanError::protocol(format!("envelope is not UTF-8: {e}")))
    }

    fn write_header(
        &self,
        writer: &mut Writer<Vec<u8>>,
        action: Action,
        resource_uri: &str,
        selectors: Option<&SelectorSet>,
        options: Option<&OptionSet>,
        operation_timeout: Option<Iso8601Duration>,
    ) -> Result<(), quick_xml::Error> {
        let must = ("s:mustUnderstand", "true");
        let must_not = ("s:mustUnderstand", "false");

        writer.write_event(Event::Start(BytesStart::new("s:Header")))?;

        write_text_element(writer, "a:Action", &[must], action.uri())?;
        write_text_element(writer, "a:To", &[], &self.to)?;
        write_text_element(writer, "w:ResourceURI", &[must], resource_uri)?;

        let message_id = format!(
            "uuid:{}",
            Uuid::new_v4().as_hyphenated().to_string().to_uppercase()
        );
        write_text_element(writer, "a:MessageID", &[], &message_id)?;

        writer.write_event(Event::Start(BytesStart::new("a:ReplyTo")))?;
        write_text_element(writer, "a:Address", &[must], ANONYMOUS_ADDRESS)?;
        writer.write_event(Event::End(BytesEnd::new("a:ReplyTo")))?;

        write_text_element(
            writer,
            "w:MaxEnvelopeSize",
            &[must],
            &self.max_envelope_size.to_string(),
        )?;
        write_text_element(
            writer,
            "w:Locale",
            &[("xml:lang", self.locale.as_str()), must_not],
            "",
        )?;
        write_text_element(
            writer,
            "p:DataLocale",
            &[("xml:lang", self.data_locale.as_str()), must_not],
            "",
        )?;

        let session_id = format!(
            "uuid:{}",
            self.session_id.as_hyphenated().to_string().to_uppercase()
        );
        write_text_element(writer, "p:SessionId", &[must_not], &session_id)?;

        let operation_id = format!(
            "uuid:{}",
            Uuid::new_v4().as_hyphenated().to_string().to_uppercase()
        );
        write_text_element(writer, "p:OperationID", &[must_not], &operation_id)?;
        write_text_element(writer, "p:SequenceId", &[must_not], "1")?;

        let timeout = operation_timeout.unwrap_or(self.operation_timeout);
        write_text_element(writer, "w:OperationTimeout", &[], &timeout.to_string())?;

        if let Some(selectors) = selectors
            && !selectors.0.is_empty()
        {
            writer.write_event(Event::Start(BytesStart::new("w:SelectorSet")))?;
            for (name, value) in &selectors.0 {
                write_text_element(writer, "w:Selector", &[("Name", name.as_str())], value)?;
            }
            writer.write_event(Event::End(BytesEnd::new("w:SelectorSet")))?;
        }

        if let Some(options) = options
            && !options.is_empty()
        {
            writer.write_event(Event::Start(BytesStart::new("w:OptionSet")))?;
            for (name, value, must_comply) in &options.0 {
                let attrs: Vec<(&str, &str)> = if *must_comply {
                    vec![("Name", name.as_str()), ("MustComply", "true")]
                } else {
                    vec![("Name", name.as_str())]
                };
                write_text_element(writer, "w:Option", &attrs, value)?;
            }
            writer.write_event(Event::End(BytesEnd::new("w:OptionSet")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("s:Header")))?;
        Ok(())
    }
}
