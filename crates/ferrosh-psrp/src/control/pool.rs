use uuid::Uuid;

use crate::clixml::{self, RefIds};
use crate::{Destination, MessageType, PsrpError, PsrpMessage};

/// Version triple advertised in SESSION_CAPABILITY.
#[derive(Debug, Clone, typed_builder::TypedBuilder)]
pub struct SessionCapability {
    #[builder(default = String::from("2.3"))]
    pub protocol_version: String,
    #[builder(default = String::from("2.0"))]
    pub ps_version: String,
    #[builder(default = String::from("1.1.0.1"))]
    pub serialization_version: String,
}

impl Default for SessionCapability {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SessionCapability {
    pub fn to_clixml(&self) -> String {
        format!(
            r#"<Obj RefId="0"><MS><Version N="protocolversion">{}</Version><Version N="PSVersion">{}</Version><Version N="SerializationVersion">{}</Version></MS></Obj>"#,
            clixml::escape(&self.protocol_version),
            clixml::escape(&self.ps_version),
            clixml::escape(&self.serialization_version),
        )
    }

    pub fn to_message(&self, rpid: Uuid) -> PsrpMessage {
        PsrpMessage::new(
            Destination::Server,
            MessageType::SessionCapability,
            rpid,
            None,
            self.to_clixml().into_bytes(),
        )
    }
}

/// The server's SESSION_CAPABILITY announcement.
#[derive(Debug, Clone)]
pub struct SessionCapabilityMsg {
    pub protocol_version: String,
    pub ps_version: String,
    pub serialization_version: String,
}

impl SessionCapabilityMsg {
    pub fn from_clixml(payload: &str) -> Result<Self, PsrpError> {
        let doc = clixml::parse_document(payload)?;
        let root = doc.root_element();

        let field = |name: &str| {
            clixml::named_text(root, name)
                .ok_or_else(|| PsrpError::Payload(format!("SessionCapability missing {name}")))
        };

        Ok(Self {
            protocol_version: field("protocolversion")?,
            ps_version: field("PSVersion")?,
            serialization_version: field("SerializationVersion")?,
        })
    }
}

/// INIT_RUNSPACEPOOL: pool sizing plus the null host block.
#[derive(Debug, Clone, typed_builder::TypedBuilder)]
pub struct InitRunspacePool {
    #[builder(default = 1)]
    pub min_runspaces: i32,
    #[builder(default = 1)]
    pub max_runspaces: i32,
}

impl InitRunspacePool {
    pub fn to_clixml(&self) -> String {
        let mut ref_ids = RefIds::default();
        let _root = ref_ids.next();

        let thread_options = clixml::enum_object(
            "PSThreadOptions",
            "System.Management.Automation.Runspaces.PSThreadOptions",
            "Default",
            0,
            &mut ref_ids,
        );
        let apartment_state = clixml::enum_object(
            "ApartmentState",
            "System.Threading.ApartmentState",
            "Unknown",
            2,
            &mut ref_ids,
        );
        let host_info = clixml::null_host_info("HostInfo", &mut ref_ids);

        format!(
            r#"<Obj RefId="0"><MS><I32 N="MinRunspaces">{min}</I32><I32 N="MaxRunspaces">{max}</I32>{thread_options}{apartment_state}{host_info}<Nil N="ApplicationArguments" /></MS></Obj>"#,
            min = self.min_runspaces,
            max = self.max_runspaces,
        )
    }

    pub fn to_message(&self, rpid: Uuid) -> PsrpMessage {
        PsrpMessage::new(
            Destination::Server,
            MessageType::InitRunspacePool,
            rpid,
            None,
            self.to_clixml().into_bytes(),
        )
    }
}

/// CONNECT_RUNSPACEPOOL, sent when re-attaching to a disconnected shell.
#[derive(Debug, Clone)]
pub struct ConnectRunspacePool {
    pub min_runspaces: i32,
    pub max_runspaces: i32,
}

impl ConnectRunspacePool {
    pub fn to_clixml(&self) -> String {
        format!(
            r#"<Obj RefId="0"><MS><I32 N="MinRunspaces">{}</I32><I32 N="MaxRunspaces">{}</I32></MS></Obj>"#,
            self.min_runspaces, self.max_runspaces,
        )
    }

    pub fn to_message(&self, rpid: Uuid) -> PsrpMessage {
        PsrpMessage::new(
            Destination::Server,
            MessageType::ConnectRunspacePool,
            rpid,
            None,
            self.to_clixml().into_bytes(),
        )
    }
}

/// SET_MAX_RUNSPACES / SET_MIN_RUNSPACES carry the new bound plus a call id
/// the server echoes in its RUNSPACE_AVAILABILITY answer.
#[derive(Debug, Clone)]
pub struct SetMaxRunspaces {
    pub max_runspaces: i32,
    pub call_id: i64,
}

impl SetMaxRunspaces {
    pub fn to_clixml(&self) -> String {
        format!(
            r#"<Obj RefId="0"><MS><I32 N="MaxRunspaces">{}</I32><I64 N="ci">{}</I64></MS></Obj>"#,
            self.max_runspaces, self.call_id,
        )
    }

    pub fn to_message(&self, rpid: Uuid) -> PsrpMessage {
        PsrpMessage::new(
            Destination::Server,
            MessageType::SetMaxRunspaces,
            rpid,
            None,
            self.to_clixml().into_bytes(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct SetMinRunspaces {
    pub min_runspaces: i32,
    pub call_id: i64,
}

impl SetMinRunspaces {
    pub fn to_clixml(&self) -> String {
        format!(
            r#"<Obj RefId="0"><MS><I32 N="MinRunspaces">{}</I32><I64 N="ci">{}</I64></MS></Obj>"#,
            self.min_runspaces, self.call_id,
        )
    }

    pub fn to_message(&self, rpid: Uuid) -> PsrpMessage {
        PsrpMessage::new(
            Destination::Server,
            MessageType::SetMinRunspaces,
            rpid,
            None,
            self.to_clixml().into_bytes(),
        )
    }
}

/// GET_AVAILABLE_RUNSPACES doubles as the pool keepalive ping; the server
/// answers with RUNSPACE_AVAILABILITY.
#[derive(Debug, Clone)]
pub struct GetAvailableRunspaces {
    pub call_id: i64,
}

impl GetAvailableRunspaces {
    pub fn to_clixml(&self) -> String {
        format!(
            r#"<Obj RefId="0"><MS><I64 N="ci">{}</I64></MS></Obj>"#,
            self.call_id,
        )
    }

    pub fn to_message(&self, rpid: Uuid) -> PsrpMessage {
        PsrpMessage::new(
            Destination::Server,
            MessageType::GetAvailableRunspaces,
            rpid,
            None,
            self.to_clixml().into_bytes(),
        )
    }
}

/// One PIPELINE_INPUT record. Only string records are supported; richer
/// input shapes belong in the script text.
#[derive(Debug, Clone)]
pub struct PipelineInput {
    value: String,
}

impl PipelineInput {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    pub fn to_clixml(&self) -> String {
        format!("<S>{}</S>", clixml::escape(&self.value))
    }

    pub fn to_message(&self, rpid: Uuid, pid: Uuid) -> PsrpMessage {
        PsrpMessage::new(
            Destination::Server,
            MessageType::PipelineInput,
            rpid,
            Some(pid),
            self.to_clixml().into_bytes(),
        )
    }
}

/// END_OF_PIPELINE_INPUT has an empty payload; its arrival is the signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndOfPipelineInput;

impl EndOfPipelineInput {
    pub fn to_message(rpid: Uuid, pid: Uuid) -> PsrpMessage {
        PsrpMessage::new(
            Destination::Server,
            MessageType::EndOfPipelineInput,
            rpid,
            Some(pid),
            Vec::new(),
        )
    }
}

/// APPLICATION_PRIVATE_DATA is opaque to the client; we keep the raw CLIXML
/// for callers that want to inspect it.
#[derive(Debug, Clone)]
pub struct ApplicationPrivateDataMsg {
    pub raw: String,
}

impl ApplicationPrivateDataMsg {
    pub fn from_clixml(payload: &str) -> Result<Self, PsrpError> {
        // Validate it parses; store verbatim.
        clixml::parse_document(payload)?;
        Ok(Self {
            raw: payload.to_owned(),
        })
    }
}
