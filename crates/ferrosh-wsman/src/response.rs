use base64::Engine;
use roxmltree::{Document, Node};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::WsmanError;
use crate::fault::WsmanFault;

/// One decoded `<rsp:Stream>` chunk from a Receive response.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub name: String,
    pub command_id: Option<Uuid>,
    pub bytes: Vec<u8>,
}

/// Command progress reported alongside Receive streams.
#[derive(Debug, Clone)]
pub struct CommandState {
    pub command_id: Uuid,
    pub state_uri: String,
    pub exit_code: Option<i32>,
}

impl CommandState {
    pub fn is_done(&self) -> bool {
        self.state_uri.ends_with("/Done")
    }
}

/// A shell discovered by Enumerate.
#[derive(Debug, Clone)]
pub struct EnumeratedShell {
    pub shell_id: Uuid,
    pub state: Option<String>,
    pub name: Option<String>,
}

/// The classified body of a response envelope.
#[derive(Debug, Clone)]
pub enum ResponseBody {
    Created {
        shell_id: Uuid,
    },
    CommandStarted {
        command_id: Uuid,
    },
    Received {
        streams: Vec<StreamChunk>,
        command_state: Option<CommandState>,
    },
    Sent,
    Signaled,
    Deleted,
    Disconnected,
    Reconnected,
    Enumerated {
        shells: Vec<EnumeratedShell>,
    },
    /// A response this client has no specific handling for; kept so callers
    /// can log it.
    Other(String),
}

#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub relates_to: Option<String>,
    pub body: ResponseBody,
}

/// Parse one SOAP response. A fault envelope surfaces as
/// [`WsmanError::Fault`]; callers check `is_operation_timeout` before
/// treating it as fatal.
pub fn parse_response(xml: &str) -> Result<ResponseEnvelope, WsmanError> {
    let doc = Document::parse(xml)?;
    let root = doc.root_element();

    let body = root
        .children()
        .find(|n| n.is_element() && n.tag_name().name() == "Body")
        .ok_or_else(|| WsmanError::protocol("response envelope has no Body"))?;

    let relates_to = root
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "RelatesTo")
        .and_then(|n| n.text().map(str::to_owned));

    if let Some(fault) = body
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "Fault")
    {
        let fault = WsmanFault::from_fault_node(fault);
        debug!(%fault, "response envelope is a fault");
        return Err(WsmanError::Fault(Box::new(fault)));
    }

    Ok(ResponseEnvelope {
        relates_to,
        body: classify_body(body)?,
    })
}

fn classify_body(body: Node<'_, '_>) -> Result<ResponseBody, WsmanError> {
    let first = body
        .children()
        .find(|n| n.is_element())
        .map(|n| n.tag_name().name().to_owned())
        .unwrap_or_default();

    match first.as_str() {
        // Delete (and some Signal) responses have an empty body.
        "" => Ok(ResponseBody::Deleted),
        "ResourceCreated" | "Shell" => parse_create(body),
        "CommandResponse" => parse_command(body),
        "ReceiveResponse" => parse_receive(body),
        "SendResponse" => Ok(ResponseBody::Sent),
        "SignalResponse" => Ok(ResponseBody::Signaled),
        "DisconnectResponse" => Ok(ResponseBody::Disconnected),
        "ReconnectResponse" => Ok(ResponseBody::Reconnected),
        "EnumerateResponse" => parse_enumerate(body),
        other => Ok(ResponseBody::Other(other.to_owned())),
    }
}

fn parse_uuid(text: &str) -> Result<Uuid, WsmanError> {
    Uuid::parse_str(text.trim().trim_start_matches("uuid:"))
        .map_err(|e| WsmanError::protocol(format!("bad GUID {text:?}: {e}")))
}

fn parse_create(body: Node<'_, '_>) -> Result<ResponseBody, WsmanError> {
    // Prefer the selector echoed in ResourceCreated; fall back to the
    // Shell element's ShellId.
    let selector = body
        .descendants()
        .find(|n| {
            n.is_element()
                && n.tag_name().name() == "Selector"
                && n.attribute("Name") == Some("ShellId")
        })
        .and_then(|n| n.text());

    let shell_id_text = match selector {
        Some(text) => Some(text.to_owned()),
        None => body
            .descendants()
            .find(|n| n.is_element() && n.tag_name().name() == "ShellId")
            .and_then(|n| n.text().map(str::to_owned)),
    }
    .ok_or_else(|| WsmanError::protocol("Create response carries no ShellId"))?;

    Ok(ResponseBody::Created {
        shell_id: parse_uuid(&shell_id_text)?,
    })
}

fn parse_command(body: Node<'_, '_>) -> Result<ResponseBody, WsmanError> {
    let command_id = body
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "CommandId")
        .and_then(|n| n.text())
        .ok_or_else(|| WsmanError::protocol("Command response carries no CommandId"))?;

    Ok(ResponseBody::CommandStarted {
        command_id: parse_uuid(command_id)?,
    })
}

fn parse_receive(body: Node<'_, '_>) -> Result<ResponseBody, WsmanError> {
    let mut streams = Vec::new();
    let mut command_state = None;

    for node in body.descendants().filter(Node::is_element) {
        match node.tag_name().name() {
            "Stream" => {
                let name = node.attribute("Name").unwrap_or("stdout").to_owned();
                let command_id = node
                    .attribute("CommandId")
                    .map(parse_uuid)
                    .transpose()?;
                let bytes = match node.text() {
                    Some(text) => {
                        base64::engine::general_purpose::STANDARD.decode(text.trim())?
                    }
                    None => Vec::new(),
                };
                trace!(
                    stream = %name,
                    command_id = ?command_id,
                    len = bytes.len(),
                    "decoded receive stream chunk"
                );
                streams.push(StreamChunk {
                    name,
                    command_id,
                    bytes,
                });
            }
            "CommandState" => {
                let command_id = node
                    .attribute("CommandId")
                    .map(parse_uuid)
                    .transpose()?
                    .ok_or_else(|| {
                        WsmanError::protocol("CommandState without CommandId attribute")
                    })?;
                let state_uri = node.attribute("State").unwrap_or_default().to_owned();
                let exit_code = node
                    .descendants()
                    .find(|n| n.is_element() && n.tag_name().name() == "ExitCode")
                    .and_then(|n| n.text())
                    .and_then(|t| t.trim().parse().ok());
                command_state = Some(CommandState {
                    command_id,
                    state_uri,
                    exit_code,
                });
            }
            _ => {}
        }
    }

    Ok(ResponseBody::Received {
        streams,
        command_state,
    })
}

fn parse_enumerate(body: Node<'_, '_>) -> Result<ResponseBody, WsmanError> {
    let mut shells = Vec::new();

    for shell in body
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "Shell")
    {
        let text_of = |tag: &str| {
            shell
                .descendants()
                .find(|n| n.is_element() && n.tag_name().name() == tag)
                .and_then(|n| n.text().map(str::to_owned))
        };

        let Some(shell_id) = text_of("ShellId") else {
            continue;
        };
        shells.push(EnumeratedShell {
            shell_id: parse_uuid(&shell_id)?,
            state: text_of("State"),
            name: text_of("Name"),
        });
    }

    Ok(ResponseBody::Enumerated { shells })
}
