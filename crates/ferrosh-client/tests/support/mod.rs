//! Test doubles: a minimal HTTP/1.1 listener and a scripted WSMan/PSRP
//! endpoint good enough to drive the client through open/execute/close,
//! long-poll reassembly, and disconnect/reconnect.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use ferrosh_psrp::{Defragmenter, Destination, Fragmenter, MessageType, PsrpMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

pub const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";

#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ParsedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// SOAP Action URI suffix ("Create", "Receive", ...).
    pub fn action(&self) -> String {
        let body = self.body_str();
        let Ok(doc) = roxmltree::Document::parse(&body) else {
            return String::new();
        };
        doc.descendants()
            .find(|n| n.is_element() && n.tag_name().name() == "Action")
            .and_then(|n| n.text())
            .and_then(|uri| uri.rsplit('/').next())
            .unwrap_or_default()
            .to_owned()
    }
}

pub async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<ParsedRequest>> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = find(&buffer, b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let header_text = String::from_utf8_lossy(&buffer[..header_end]).into_owned();
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().unwrap_or_default().to_owned();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| {
            line.split_once(':')
                .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
        })
        .collect();

    let content_length: usize = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0);

    let mut body = buffer[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Some(ParsedRequest {
        request_line,
        headers,
        body,
    }))
}

pub async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    extra_headers: &[(&str, &str)],
    body: &[u8],
) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        401 => "Unauthorized",
        500 => "Internal Server Error",
        _ => "Other",
    };
    let mut response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n",
        body.len()
    );
    for (key, value) in extra_headers {
        response.push_str(&format!("{key}: {value}\r\n"));
    }
    response.push_str("\r\n");

    stream.write_all(response.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// ---------------------------------------------------------------------------
// Scripted WSMan endpoint
// ---------------------------------------------------------------------------

const SOAP_NS: &str = concat!(
    r#"xmlns:s="http://www.w3.org/2003/05/soap-envelope" "#,
    r#"xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing" "#,
    r#"xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" "#,
    r#"xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell" "#,
    r#"xmlns:x="http://schemas.xmlsoap.org/ws/2004/09/transfer" "#,
    r#"xmlns:n="http://schemas.xmlsoap.org/ws/2004/09/enumeration""#,
);

pub fn soap_envelope(body: &str) -> String {
    format!("<s:Envelope {SOAP_NS}><s:Header/><s:Body>{body}</s:Body></s:Envelope>")
}

pub fn operation_timeout_fault() -> String {
    soap_envelope(concat!(
        r#"<s:Fault><s:Code><s:Value>s:Receiver</s:Value>"#,
        r#"<s:Subcode><s:Value>w:TimedOut</s:Value></s:Subcode></s:Code>"#,
        r#"<s:Reason><s:Text xml:lang="en-US">The operation timed out</s:Text></s:Reason>"#,
        r#"<s:Detail><f:WSManFault xmlns:f="http://schemas.microsoft.com/wbem/wsman/1/wsmanfault" Code="2150858793">"#,
        r#"<f:Message>Timed out.</f:Message></f:WSManFault></s:Detail></s:Fault>"#,
    ))
}

fn uuid_upper(id: Uuid) -> String {
    id.as_hyphenated().to_string().to_uppercase()
}

/// One queued stdout chunk.
#[derive(Debug, Clone)]
struct QueuedChunk {
    command_id: Option<Uuid>,
    bytes: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct SimOptions {
    /// Deliver at most this many chunks per Receive response (0 = all).
    pub max_chunks_per_receive: usize,
    /// Split each pool message's fragment bytes in half, delivering the
    /// halves as separate chunks.
    pub split_fragment_bytes: bool,
    /// Park pipeline output until after a Reconnect (disconnect recovery).
    pub hold_pipeline_output_until_reconnect: bool,
}

/// The scripted endpoint state machine. Shared behind a mutex between
/// connection handlers.
pub struct WsmanSim {
    pub options: SimOptions,
    pub outputs: Vec<String>,
    shell_id: Option<Uuid>,
    rpid: Option<Uuid>,
    fragmenter: Fragmenter,
    defragmenter: Defragmenter,
    queue: VecDeque<QueuedChunk>,
    held: VecDeque<QueuedChunk>,
    done_commands: VecDeque<Uuid>,
    held_done: VecDeque<Uuid>,
    disconnected: bool,
    pub requests_seen: Vec<String>,
}

impl WsmanSim {
    pub fn new(outputs: Vec<String>, options: SimOptions) -> Self {
        Self {
            options,
            outputs,
            shell_id: None,
            rpid: None,
            fragmenter: Fragmenter::new(16 * 1024),
            defragmenter: Defragmenter::new(),
            queue: VecDeque::new(),
            held: VecDeque::new(),
            done_commands: VecDeque::new(),
            held_done: VecDeque::new(),
            disconnected: false,
            requests_seen: Vec::new(),
        }
    }

    fn queue_message(&mut self, message: &PsrpMessage, command_id: Option<Uuid>, held: bool) {
        let mut bytes = Vec::new();
        for fragment in self.fragmenter.fragment(message) {
            bytes.extend_from_slice(&fragment.pack());
        }

        let chunks: Vec<Vec<u8>> = if self.options.split_fragment_bytes && bytes.len() > 2 {
            let mid = bytes.len() / 2;
            vec![bytes[..mid].to_vec(), bytes[mid..].to_vec()]
        } else {
            vec![bytes]
        };

        let target = if held { &mut self.held } else { &mut self.queue };
        for bytes in chunks {
            target.push_back(QueuedChunk { command_id, bytes });
        }
    }

    fn pool_message(&self, message_type: MessageType, payload: &str) -> PsrpMessage {
        PsrpMessage::new(
            Destination::Client,
            message_type,
            self.rpid.unwrap_or_default(),
            None,
            payload.as_bytes().to_vec(),
        )
    }

    fn pipeline_message(
        &self,
        message_type: MessageType,
        pid: Uuid,
        payload: &str,
    ) -> PsrpMessage {
        PsrpMessage::new(
            Destination::Client,
            message_type,
            self.rpid.unwrap_or_default(),
            Some(pid),
            payload.as_bytes().to_vec(),
        )
    }

    /// Handle one request; `None` means "no data yet, ask again" (a parked
    /// Receive).
    pub fn handle(&mut self, request: &ParsedRequest) -> Option<(u16, String)> {
        let action = request.action();
        self.requests_seen.push(action.clone());
        let body = request.body_str();

        match action.as_str() {
            "Create" => Some(self.handle_create(&body)),
            "Command" => Some(self.handle_command(&body)),
            "Receive" => self.try_receive(),
            "Send" => Some((200, soap_envelope("<rsp:SendResponse/>"))),
            "Signal" => Some(self.handle_signal(&body)),
            "Delete" => Some((200, soap_envelope(""))),
            "Disconnect" => {
                self.disconnected = true;
                Some((200, soap_envelope("<rsp:DisconnectResponse/>")))
            }
            "Reconnect" => {
                self.disconnected = false;
                // Release anything parked across the disconnect.
                while let Some(chunk) = self.held.pop_front() {
                    self.queue.push_back(chunk);
                }
                while let Some(id) = self.held_done.pop_front() {
                    self.done_commands.push_back(id);
                }
                Some((200, soap_envelope("<rsp:ReconnectResponse/>")))
            }
            "Enumerate" => {
                let items = self.shell_id.map_or_else(String::new, |id| {
                    format!(
                        concat!(
                            r#"<rsp:Shell><rsp:ShellId>{id}</rsp:ShellId>"#,
                            r#"<rsp:State>{state}</rsp:State></rsp:Shell>"#,
                        ),
                        id = uuid_upper(id),
                        state = if self.disconnected {
                            "Disconnected"
                        } else {
                            "Connected"
                        },
                    )
                });
                Some((
                    200,
                    soap_envelope(&format!(
                        "<n:EnumerateResponse><w:Items>{items}</w:Items></n:EnumerateResponse>"
                    )),
                ))
            }
            other => Some((
                500,
                soap_envelope(&format!(
                    "<s:Fault><s:Reason><s:Text>unknown action {other}</s:Text></s:Reason></s:Fault>"
                )),
            )),
        }
    }

    fn handle_create(&mut self, body: &str) -> (u16, String) {
        let doc = roxmltree::Document::parse(body).expect("create request XML");

        let shell_id = doc
            .descendants()
            .find(|n| n.tag_name().name() == "Shell")
            .and_then(|n| n.attribute("ShellId"))
            .and_then(|id| Uuid::parse_str(id).ok())
            .unwrap_or_else(Uuid::new_v4);
        self.shell_id = Some(shell_id);

        // Decode the negotiation batch to learn the client's pool id.
        let creation_b64 = doc
            .descendants()
            .find(|n| n.tag_name().name() == "creationXml")
            .and_then(|n| n.text())
            .expect("creationXml present");
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(creation_b64.trim())
            .expect("creationXml is base64");
        let messages = self.defragmenter.feed(&bytes).expect("valid fragments");
        assert!(
            messages
                .iter()
                .any(|m| m.message_type == MessageType::SessionCapability),
            "negotiation batch carries SESSION_CAPABILITY"
        );
        assert!(
            messages
                .iter()
                .any(|m| m.message_type == MessageType::InitRunspacePool),
            "negotiation batch carries INIT_RUNSPACEPOOL"
        );
        self.rpid = messages.first().map(|m| m.rpid);

        // Server side of the negotiation.
        let capability = self.pool_message(
            MessageType::SessionCapability,
            r#"<Obj RefId="0"><MS><Version N="protocolversion">2.3</Version><Version N="PSVersion">5.1</Version><Version N="SerializationVersion">1.1.0.1</Version></MS></Obj>"#,
        );
        let private_data = self.pool_message(
            MessageType::ApplicationPrivateData,
            r#"<Obj RefId="0"><MS><Obj N="ApplicationPrivateData" RefId="1"><DCT /></Obj></MS></Obj>"#,
        );
        let opened = self.pool_message(
            MessageType::RunspacePoolState,
            r#"<Obj RefId="0"><MS><I32 N="RunspaceState">2</I32></MS></Obj>"#,
        );
        self.queue_message(&capability, None, false);
        self.queue_message(&private_data, None, false);
        self.queue_message(&opened, None, false);

        let response = soap_envelope(&format!(
            concat!(
                r#"<x:ResourceCreated><a:Address>anonymous</a:Address>"#,
                r#"<a:ReferenceParameters><w:SelectorSet>"#,
                r#"<w:Selector Name="ShellId">{id}</w:Selector>"#,
                r#"</w:SelectorSet></a:ReferenceParameters></x:ResourceCreated>"#,
            ),
            id = uuid_upper(shell_id),
        ));
        (200, response)
    }

    fn handle_command(&mut self, body: &str) -> (u16, String) {
        let doc = roxmltree::Document::parse(body).expect("command request XML");
        let command_id = doc
            .descendants()
            .find(|n| n.tag_name().name() == "CommandLine")
            .and_then(|n| n.attribute("CommandId"))
            .and_then(|id| Uuid::parse_str(id).ok())
            .expect("CommandId on CommandLine");

        // The arguments must defragment into a CREATE_PIPELINE message.
        let mut defragmenter = Defragmenter::new();
        let mut messages = Vec::new();
        for arguments in doc
            .descendants()
            .filter(|n| n.tag_name().name() == "Arguments")
        {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(arguments.text().unwrap_or_default().trim())
                .expect("arguments are base64");
            messages.extend(defragmenter.feed(&bytes).expect("valid fragments"));
        }
        assert!(
            messages
                .iter()
                .any(|m| m.message_type == MessageType::CreatePipeline),
            "command carries CREATE_PIPELINE"
        );

        let held = self.options.hold_pipeline_output_until_reconnect;
        for output in self.outputs.clone() {
            let message = self.pipeline_message(
                MessageType::PipelineOutput,
                command_id,
                &format!("<S>{output}</S>"),
            );
            self.queue_message(&message, Some(command_id), held);
        }
        let completed = self.pipeline_message(
            MessageType::PipelineState,
            command_id,
            r#"<Obj RefId="0"><MS><I32 N="PipelineState">4</I32></MS></Obj>"#,
        );
        self.queue_message(&completed, Some(command_id), held);
        if held {
            self.held_done.push_back(command_id);
        } else {
            self.done_commands.push_back(command_id);
        }

        let response = soap_envelope(&format!(
            "<rsp:CommandResponse><rsp:CommandId>{}</rsp:CommandId></rsp:CommandResponse>",
            uuid_upper(command_id),
        ));
        (200, response)
    }

    fn handle_signal(&mut self, body: &str) -> (u16, String) {
        let doc = roxmltree::Document::parse(body).expect("signal request XML");
        let command_id = doc
            .descendants()
            .find(|n| n.tag_name().name() == "Signal")
            .and_then(|n| n.attribute("CommandId"))
            .and_then(|id| Uuid::parse_str(id).ok());

        if let Some(command_id) = command_id {
            let stopped = self.pipeline_message(
                MessageType::PipelineState,
                command_id,
                r#"<Obj RefId="0"><MS><I32 N="PipelineState">3</I32></MS></Obj>"#,
            );
            self.queue_message(&stopped, Some(command_id), false);
        }

        (200, soap_envelope("<rsp:SignalResponse/>"))
    }

    fn try_receive(&mut self) -> Option<(u16, String)> {
        if self.queue.is_empty() && self.done_commands.is_empty() {
            return None;
        }

        let take = if self.options.max_chunks_per_receive == 0 {
            self.queue.len()
        } else {
            self.options.max_chunks_per_receive
        };

        let mut streams = String::new();
        for _ in 0..take {
            let Some(chunk) = self.queue.pop_front() else {
                break;
            };
            let encoded = base64::engine::general_purpose::STANDARD.encode(&chunk.bytes);
            match chunk.command_id {
                Some(id) => streams.push_str(&format!(
                    r#"<rsp:Stream Name="stdout" CommandId="{}">{encoded}</rsp:Stream>"#,
                    uuid_upper(id),
                )),
                None => streams.push_str(&format!(
                    r#"<rsp:Stream Name="stdout">{encoded}</rsp:Stream>"#
                )),
            }
        }

        // Attach CommandState Done once a finished pipeline's chunks have
        // all been delivered.
        let mut command_state = String::new();
        if self.queue.is_empty()
            && let Some(done) = self.done_commands.pop_front()
        {
            command_state = format!(
                concat!(
                    r#"<rsp:CommandState CommandId="{id}" "#,
                    r#"State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done">"#,
                    r#"<rsp:ExitCode>0</rsp:ExitCode></rsp:CommandState>"#,
                ),
                id = uuid_upper(done),
            );
        }

        Some((
            200,
            soap_envelope(&format!(
                "<rsp:ReceiveResponse>{streams}{command_state}</rsp:ReceiveResponse>"
            )),
        ))
    }
}

/// A canned response for the scripted (non-simulating) server.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub status: u16,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ScriptedResponse {
    pub fn soap(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: SOAP_CONTENT_TYPE.to_owned(),
            headers: Vec::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_owned(), value.into()));
        self
    }
}

/// Serve a fixed response script in order (across connections) and record
/// every request for assertions.
pub async fn start_scripted(
    responses: Vec<ScriptedResponse>,
) -> (SocketAddr, Arc<Mutex<Vec<ParsedRequest>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let seen: Arc<Mutex<Vec<ParsedRequest>>> = Arc::new(Mutex::new(Vec::new()));
    let script = Arc::new(Mutex::new(VecDeque::from(responses)));

    let seen_for_task = Arc::clone(&seen);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let seen = Arc::clone(&seen_for_task);
            let script = Arc::clone(&script);
            tokio::spawn(async move {
                while let Ok(Some(request)) = read_request(&mut stream).await {
                    seen.lock().unwrap().push(request);
                    let Some(response) = script.lock().unwrap().pop_front() else {
                        return;
                    };
                    let headers: Vec<(&str, &str)> = response
                        .headers
                        .iter()
                        .map(|(k, v)| (k.as_str(), v.as_str()))
                        .collect();
                    if write_response(
                        &mut stream,
                        response.status,
                        &response.content_type,
                        &headers,
                        &response.body,
                    )
                    .await
                    .is_err()
                    {
                        return;
                    }
                }
            });
        }
    });

    (addr, seen)
}

/// Run the sim on an ephemeral port. Parked Receives poll the sim every few
/// milliseconds and fall back to an OperationTimeout fault.
pub async fn start_sim(sim: Arc<Mutex<WsmanSim>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let sim = Arc::clone(&sim);
            tokio::spawn(async move {
                while let Ok(Some(request)) = read_request(&mut stream).await {
                    let action = request.action();
                    let response = if action == "Receive" {
                        let mut waited = Duration::ZERO;
                        loop {
                            let ready = sim.lock().unwrap().handle(&request);
                            if let Some(response) = ready {
                                break response;
                            }
                            if waited >= Duration::from_secs(2) {
                                break (500, operation_timeout_fault());
                            }
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            waited += Duration::from_millis(10);
                        }
                    } else {
                        sim.lock()
                            .unwrap()
                            .handle(&request)
                            .unwrap_or((500, operation_timeout_fault()))
                    };

                    let (status, body) = response;
                    if write_response(
                        &mut stream,
                        status,
                        SOAP_CONTENT_TYPE,
                        &[],
                        body.as_bytes(),
                    )
                    .await
                    .is_err()
                    {
                        return;
                    }
                }
            });
        }
    });

    addr
}
