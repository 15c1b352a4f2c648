use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use tracing::debug;
use uuid::Uuid;

use crate::WsmanError;
use crate::duration::Iso8601Duration;
use crate::envelope::{
    Action, OptionSet, SelectorSet, WsMan, write_empty_element, write_text_element,
};

/// Signal codes understood by the PowerShell shell resource.
pub const SIGNAL_TERMINATE: &str = "powershell/signal/terminate";
pub const SIGNAL_CTRL_C: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/ctrl_c";

const SHELL_RESOURCE_BASE: &str = "http://schemas.microsoft.com/powershell/";
const ENUMERATE_RESOURCE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";

fn uuid_upper(id: Uuid) -> String {
    id.as_hyphenated().to_string().to_uppercase()
}

/// The WSMan shell backing one runspace pool: resource addressing and the
/// request builders for every shell-lifecycle action.
///
/// `shell_id` is chosen client-side and confirmed by the Create response;
/// all later actions select on it.
#[derive(Debug, Clone, typed_builder::TypedBuilder)]
pub struct ShellRemote {
    #[builder(default = Uuid::new_v4())]
    pub shell_id: Uuid,
    #[builder(default = String::from("Microsoft.PowerShell"), setter(into))]
    pub configuration_name: String,
    #[builder(default, setter(strip_option))]
    pub idle_timeout: Option<Iso8601Duration>,
}

impl ShellRemote {
    pub fn resource_uri(&self) -> String {
        format!("{SHELL_RESOURCE_BASE}{}", self.configuration_name)
    }

    /// Create the shell. `creation_xml_b64` carries the first PSRP fragment
    /// batch (SESSION_CAPABILITY + INIT_RUNSPACEPOOL) so the pool opens in
    /// one round-trip.
    pub fn create(
        &self,
        wsman: &WsMan,
        protocol_version: &str,
        creation_xml_b64: &str,
    ) -> Result<String, WsmanError> {
        debug!(shell_id = %self.shell_id, "building shell Create request");

        let options = OptionSet::default()
            .add_must_comply("protocolversion", protocol_version);

        let shell_id = uuid_upper(self.shell_id);
        let idle_timeout = self.idle_timeout;
        wsman.envelope(
            Action::Create,
            &self.resource_uri(),
            None,
            Some(&options),
            None,
            move |writer| {
                let mut shell = BytesStart::new("rsp:Shell");
                shell.push_attribute(("ShellId", shell_id.as_str()));
                writer.write_event(Event::Start(shell))?;

                write_text_element(writer, "rsp:InputStreams", &[], "stdin pr")?;
                write_text_element(writer, "rsp:OutputStreams", &[], "stdout")?;
                if let Some(timeout) = idle_timeout {
                    write_text_element(writer, "rsp:IdleTimeOut", &[], &timeout.to_string())?;
                }

                let mut creation = BytesStart::new("creationXml");
                creation.push_attribute(("xmlns", "http://schemas.microsoft.com/powershell"));
                writer.write_event(Event::Start(creation))?;
                writer.write_event(Event::Text(BytesText::new(creation_xml_b64)))?;
                writer.write_event(Event::End(BytesEnd::new("creationXml")))?;

                writer.write_event(Event::End(BytesEnd::new("rsp:Shell")))?;
                Ok(())
            },
        )
    }

    /// Start a pipeline: `<rsp:CommandLine>` with an empty command and the
    /// CREATE_PIPELINE fragments as base64 arguments.
    pub fn command(
        &self,
        wsman: &WsMan,
        command_id: Uuid,
        fragments_b64: &[String],
    ) -> Result<String, WsmanError> {
        debug!(shell_id = %self.shell_id, command_id = %command_id, "building Command request");

        let selectors = SelectorSet::shell_id(self.shell_id);
        let options = OptionSet::default()
            .add("WINRS_SKIP_CMD_SHELL", "FALSE");

        let command_id = uuid_upper(command_id);
        wsman.envelope(
            Action::Command,
            &self.resource_uri(),
            Some(&selectors),
            Some(&options),
            None,
            move |writer| {
                let mut command_line = BytesStart::new("rsp:CommandLine");
                command_line.push_attribute(("CommandId", command_id.as_str()));
                writer.write_event(Event::Start(command_line))?;

                write_empty_element(writer, "rsp:Command", &[])?;
                for fragment in fragments_b64 {
                    write_text_element(writer, "rsp:Arguments", &[], fragment)?;
                }

                writer.write_event(Event::End(BytesEnd::new("rsp:CommandLine")))?;
                Ok(())
            },
        )
    }

    /// Send data to a shell stream. Pool-level PSRP traffic goes to `stdin`;
    /// pipeline input is promoted onto the `pr` stream.
    pub fn send(
        &self,
        wsman: &WsMan,
        stream: &str,
        command_id: Option<Uuid>,
        data_b64: &str,
    ) -> Result<String, WsmanError> {
        debug!(
            shell_id = %self.shell_id,
            stream,
            command_id = ?command_id,
            "building Send request"
        );

        let selectors = SelectorSet::shell_id(self.shell_id);
        wsman.envelope(
            Action::Send,
            &self.resource_uri(),
            Some(&selectors),
            None,
            None,
            move |writer| {
                writer.write_event(Event::Start(BytesStart::new("rsp:Send")))?;

                let mut stream_elem = BytesStart::new("rsp:Stream");
                stream_elem.push_attribute(("Name", stream));
                let command_id = command_id.map(uuid_upper);
                if let Some(id) = &command_id {
                    stream_elem.push_attribute(("CommandId", id.as_str()));
                }
                writer.write_event(Event::Start(stream_elem))?;
                writer.write_event(Event::Text(BytesText::new(data_b64)))?;
                writer.write_event(Event::End(BytesEnd::new("rsp:Stream")))?;

                writer.write_event(Event::End(BytesEnd::new("rsp:Send")))?;
                Ok(())
            },
        )
    }

    /// Long-poll for output. The per-request timeout is what turns this into
    /// the dispatch loop's keepalive.
    pub fn receive(
        &self,
        wsman: &WsMan,
        command_id: Option<Uuid>,
        sequence_id: u64,
        operation_timeout: Option<Iso8601Duration>,
    ) -> Result<String, WsmanError> {
        let selectors = SelectorSet::shell_id(self.shell_id);
        let options = OptionSet::default().add("WSMAN_CMDSHELL_OPTION_KEEPALIVE", "TRUE");

        wsman.envelope(
            Action::Receive,
            &self.resource_uri(),
            Some(&selectors),
            Some(&options),
            operation_timeout,
            move |writer| {
                let mut receive = BytesStart::new("rsp:Receive");
                let sequence = sequence_id.to_string();
                receive.push_attribute(("SequenceId", sequence.as_str()));
                writer.write_event(Event::Start(receive))?;

                let mut desired = BytesStart::new("rsp:DesiredStream");
                let command_id = command_id.map(uuid_upper);
                if let Some(id) = &command_id {
                    desired.push_attribute(("CommandId", id.as_str()));
                }
                writer.write_event(Event::Start(desired))?;
                writer.write_event(Event::Text(BytesText::new("stdout")))?;
                writer.write_event(Event::End(BytesEnd::new("rsp:DesiredStream")))?;

                writer.write_event(Event::End(BytesEnd::new("rsp:Receive")))?;
                Ok(())
            },
        )
    }

    /// Signal a command, usually with [`SIGNAL_TERMINATE`].
    pub fn signal(
        &self,
        wsman: &WsMan,
        command_id: Uuid,
        code: &str,
    ) -> Result<String, WsmanError> {
        debug!(shell_id = %self.shell_id, command_id = %command_id, code, "building Signal request");

        let selectors = SelectorSet::shell_id(self.shell_id);
        let command_id = uuid_upper(command_id);
        wsman.envelope(
            Action::Signal,
            &self.resource_uri(),
            Some(&selectors),
            None,
            None,
            move |writer| {
                let mut signal = BytesStart::new("rsp:Signal");
                signal.push_attribute(("CommandId", command_id.as_str()));
                writer.write_event(Event::Start(signal))?;
                write_text_element(writer, "rsp:Code", &[], code)?;
                writer.write_event(Event::End(BytesEnd::new("rsp:Signal")))?;
                Ok(())
            },
        )
    }

    pub fn delete(&self, wsman: &WsMan) -> Result<String, WsmanError> {
        debug!(shell_id = %self.shell_id, "building Delete request");

        let selectors = SelectorSet::shell_id(self.shell_id);
        wsman.envelope(
            Action::Delete,
            &self.resource_uri(),
            Some(&selectors),
            None,
            None,
            |_| Ok(()),
        )
    }

    /// Detach from the shell, leaving pipelines running server-side.
    pub fn disconnect(
        &self,
        wsman: &WsMan,
        idle_timeout: Option<Iso8601Duration>,
    ) -> Result<String, WsmanError> {
        debug!(shell_id = %self.shell_id, "building Disconnect request");

        let selectors = SelectorSet::shell_id(self.shell_id);
        wsman.envelope(
            Action::Disconnect,
            &self.resource_uri(),
            Some(&selectors),
            None,
            None,
            move |writer| {
                writer.write_event(Event::Start(BytesStart::new("rsp:Disconnect")))?;
                if let Some(timeout) = idle_timeout {
                    write_text_element(writer, "rsp:IdleTimeOut", &[], &timeout.to_string())?;
                }
                write_text_element(writer, "rsp:BufferMode", &[], "Block")?;
                writer.write_event(Event::End(BytesEnd::new("rsp:Disconnect")))?;
                Ok(())
            },
        )
    }

    pub fn reconnect(&self, wsman: &WsMan) -> Result<String, WsmanError> {
        debug!(shell_id = %self.shell_id, "building Reconnect request");

        let selectors = SelectorSet::shell_id(self.shell_id);
        wsman.envelope(
            Action::Reconnect,
            &self.resource_uri(),
            Some(&selectors),
            None,
            None,
            |writer| write_empty_element(writer, "rsp:Reconnect", &[]),
        )
    }

    /// Enumerate shells on the endpoint (used to find disconnected
    /// sessions). This targets the generic shell resource, not a specific
    /// configuration.
    pub fn enumerate(wsman: &WsMan) -> Result<String, WsmanError> {
        wsman.envelope(
            Action::Enumerate,
            ENUMERATE_RESOURCE,
            None,
            None,
            None,
            |writer| {
                writer.write_event(Event::Start(BytesStart::new("n:Enumerate")))?;
                write_empty_element(writer, "w:OptimizeEnumeration", &[])?;
                write_text_element(writer, "w:MaxElements", &[], "32000")?;
                writer.write_event(Event::End(BytesEnd::new("n:Enumerate")))?;
                Ok(())
            },
        )
    }
}
