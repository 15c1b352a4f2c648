use std::collections::HashMap;

use base64::Engine;
use ferrosh_psrp::{
    ApplicationPrivateDataMsg, ConnectRunspacePool, Defragmenter, EndOfPipelineInput,
    ErrorRecordMsg, Fragmenter, GetAvailableRunspaces, HostCallMsg, InformationRecordMsg,
    InitRunspacePool, MessageType, PipelineInvocation, PipelineStateMsg, PoolStateMsg,
    PoolStateValue, ProgressRecordMsg, PsrpMessage, SessionCapability, SessionCapabilityMsg,
    SetMaxRunspaces, stream_text,
};
use ferrosh_wsman::{Iso8601Duration, ShellRemote, WsMan};
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::host::HostHandler;
use crate::pipeline::{PipelineEntry, PipelineStreams, StreamRecord};
use crate::{Error, Result};

pub(crate) const PROTOCOL_VERSION: &str = "2.3";

/// Pool lifecycle. Transitions are monotonic except the
/// Opened ↔ Disconnected pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    BeforeOpen,
    Opening,
    NegotiationSent,
    Opened,
    Disconnected,
    Closing,
    Closed,
    Broken,
}

impl PoolState {
    fn rank(self) -> u8 {
        match self {
            Self::BeforeOpen => 0,
            Self::Opening => 1,
            Self::NegotiationSent => 2,
            Self::Opened | Self::Disconnected => 3,
            Self::Closing => 4,
            Self::Closed => 5,
            Self::Broken => 6,
        }
    }

    pub fn is_open(self) -> bool {
        self == Self::Opened
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Broken)
    }
}

/// An outbound SOAP document the dispatch loop must POST on behalf of the
/// pool (host responses, key exchanges, input promotion).
#[derive(Debug)]
pub(crate) struct OutboundSoap(pub String);

/// The PSRP pool state machine. All mutation happens on the dispatch task;
/// this type never does I/O itself, it only renders requests and digests
/// responses.
pub(crate) struct RunspacePool {
    pub id: Uuid,
    pub state: PoolState,
    pub shell: ShellRemote,
    pub wsman: WsMan,
    pub pipelines: HashMap<Uuid, PipelineEntry>,
    pub server_capability: Option<SessionCapabilityMsg>,
    pub application_private_data: Option<String>,
    pub pool_error: Option<String>,
    min_runspaces: usize,
    max_runspaces: usize,
    fragmenter: Fragmenter,
    defragmenter: Defragmenter,
    host: Box<dyn HostHandler>,
    receive_sequence: u64,
    next_call_id: i64,
    receive_timeout: Iso8601Duration,
}

impl std::fmt::Debug for RunspacePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunspacePool")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("shell_id", &self.shell.shell_id)
            .field("pipelines", &self.pipelines.len())
            .finish_non_exhaustive()
    }
}

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

impl RunspacePool {
    pub(crate) fn new(
        wsman: WsMan,
        shell: ShellRemote,
        min_runspaces: usize,
        max_runspaces: usize,
        max_envelope_size: usize,
        receive_timeout: Iso8601Duration,
        host: Box<dyn HostHandler>,
    ) -> Self {
        // Fragments ride base64 inside the SOAP body; leave room for the
        // envelope and the 4/3 expansion.
        let max_fragment_size = (max_envelope_size.saturating_sub(2048)) * 3 / 4;

        Self {
            id: Uuid::new_v4(),
            state: PoolState::BeforeOpen,
            shell,
            wsman,
            pipelines: HashMap::new(),
            server_capability: None,
            application_private_data: None,
            pool_error: None,
            min_runspaces,
            max_runspaces,
            fragmenter: Fragmenter::new(max_fragment_size),
            defragmenter: Defragmenter::new(),
            host,
            receive_sequence: 0,
            next_call_id: 1,
            receive_timeout,
        }
    }

    /// Enforce monotonic transitions (Opened ↔ Disconnected excepted).
    pub(crate) fn set_state(&mut self, next: PoolState) -> Result<()> {
        let allowed = match (self.state, next) {
            (PoolState::Opened, PoolState::Disconnected)
            | (PoolState::Disconnected, PoolState::Opened) => true,
            (current, next) => next.rank() >= current.rank(),
        };
        if !allowed {
            return Err(Error::PsrpState(format!(
                "illegal pool transition {:?} -> {next:?}",
                self.state
            )));
        }
        if self.state != next {
            info!(from = ?self.state, to = ?next, "pool state transition");
            self.state = next;
        }
        Ok(())
    }

    fn next_call_id(&mut self) -> i64 {
        let id = self.next_call_id;
        self.next_call_id += 1;
        id
    }

    /// The Create envelope carrying SESSION_CAPABILITY + INIT_RUNSPACEPOOL
    /// as one creationXml batch, so the pool opens in a single round-trip.
    #[instrument(skip(self))]
    pub(crate) fn open_request(&mut self) -> Result<String> {
        if self.state != PoolState::BeforeOpen {
            return Err(Error::PsrpState(
                "pool must be in BeforeOpen to open".into(),
            ));
        }
        self.set_state(PoolState::Opening)?;

        let capability = SessionCapability::default().to_message(self.id);
        let init = InitRunspacePool::builder()
            .min_runspaces(self.min_runspaces as i32)
            .max_runspaces(self.max_runspaces as i32)
            .build()
            .to_message(self.id);

        let groups = self.fragmenter.fragment_batch(&[&capability, &init]);
        debug_assert_eq!(groups.len(), 1, "negotiation batch must fit one request");
        let creation_xml = groups
            .first()
            .map(|bytes| b64(bytes))
            .ok_or_else(|| Error::protocol("empty negotiation batch"))?;

        let xml = self
            .shell
            .create(&self.wsman, PROTOCOL_VERSION, &creation_xml)?;

        self.set_state(PoolState::NegotiationSent)?;
        Ok(xml)
    }

    pub(crate) fn reconnect_request(&self) -> Result<String> {
        Ok(self.shell.reconnect(&self.wsman)?)
    }

    /// CONNECT_RUNSPACEPOOL, posted right after a successful Reconnect so
    /// the server re-binds this client to the pool.
    pub(crate) fn connect_runspace_pool_request(&mut self) -> Result<String> {
        let message = ConnectRunspacePool {
            min_runspaces: self.min_runspaces as i32,
            max_runspaces: self.max_runspaces as i32,
        }
        .to_message(self.id);
        let data = self.pack_single(&message)?;
        Ok(self.shell.send(&self.wsman, "stdin", None, &data)?)
    }

    pub(crate) fn disconnect_request(&self) -> Result<String> {
        Ok(self.shell.disconnect(&self.wsman, self.shell.idle_timeout)?)
    }

    pub(crate) fn delete_request(&self) -> Result<String> {
        Ok(self.shell.delete(&self.wsman)?)
    }

    /// Long-poll Receive for the shell; the dispatch loop re-issues this on
    /// every OperationTimeout fault.
    pub(crate) fn receive_request(&mut self) -> Result<String> {
        self.receive_sequence += 1;
        Ok(self.shell.receive(
            &self.wsman,
            None,
            self.receive_sequence,
            Some(self.receive_timeout),
        )?)
    }

    /// CREATE_PIPELINE via the Command action; the chosen pipeline id is the
    /// CommandId the server echoes back.
    #[instrument(skip(self, invocation))]
    pub(crate) fn command_request(
        &mut self,
        pipeline_id: Uuid,
        invocation: &PipelineInvocation,
    ) -> Result<String> {
        if self.state != PoolState::Opened {
            return Err(Error::PsrpState(format!(
                "cannot start a pipeline while the pool is {:?}",
                self.state
            )));
        }
        if self.pipelines.contains_key(&pipeline_id) {
            return Err(Error::PsrpState("pipeline id already in use".into()));
        }

        let message = invocation.to_message(self.id, pipeline_id);
        let fragments: Vec<String> = self
            .fragmenter
            .fragment(&message)
            .iter()
            .map(|fragment| b64(&fragment.pack()))
            .collect();

        Ok(self.shell.command(&self.wsman, pipeline_id, &fragments)?)
    }

    pub(crate) fn register_pipeline(&mut self, pipeline_id: Uuid) -> PipelineStreams {
        let (entry, streams) = PipelineEntry::new(pipeline_id);
        self.pipelines.insert(pipeline_id, entry);
        streams
    }

    pub(crate) fn signal_request(&self, pipeline_id: Uuid) -> Result<String> {
        Ok(self.shell.signal(
            &self.wsman,
            pipeline_id,
            ferrosh_wsman::SIGNAL_TERMINATE,
        )?)
    }

    /// Promote one pipeline input record onto the `pr` stream, optionally
    /// closing input with END_OF_PIPELINE_INPUT.
    pub(crate) fn input_requests(
        &mut self,
        pipeline_id: Uuid,
        record: Option<&str>,
        end: bool,
    ) -> Result<Vec<String>> {
        if !self.pipelines.contains_key(&pipeline_id) {
            return Err(Error::PsrpState("no such pipeline for input".into()));
        }

        let mut out = Vec::new();
        if let Some(record) = record {
            let message = ferrosh_psrp::PipelineInput::string(record).to_message(self.id, pipeline_id);
            let data = self.pack_single(&message)?;
            out.push(self.shell.send(&self.wsman, "pr", Some(pipeline_id), &data)?);
        }
        if end {
            let message = EndOfPipelineInput::to_message(self.id, pipeline_id);
            let data = self.pack_single(&message)?;
            out.push(self.shell.send(&self.wsman, "pr", Some(pipeline_id), &data)?);
        }
        Ok(out)
    }

    pub(crate) fn set_max_runspaces_request(&mut self, max: usize) -> Result<String> {
        let call_id = self.next_call_id();
        let message = SetMaxRunspaces {
            max_runspaces: max as i32,
            call_id,
        }
        .to_message(self.id);
        self.max_runspaces = max;
        let data = self.pack_single(&message)?;
        Ok(self.shell.send(&self.wsman, "stdin", None, &data)?)
    }

    /// Keepalive ping: GET_AVAILABLE_RUNSPACES answered by
    /// RUNSPACE_AVAILABILITY.
    pub(crate) fn keepalive_request(&mut self) -> Result<String> {
        let call_id = self.next_call_id();
        let message = GetAvailableRunspaces { call_id }.to_message(self.id);
        let data = self.pack_single(&message)?;
        Ok(self.shell.send(&self.wsman, "stdin", None, &data)?)
    }

    fn pack_single(&mut self, message: &PsrpMessage) -> Result<String> {
        let fragments = self.fragmenter.fragment(message);
        let mut bytes = Vec::new();
        for fragment in fragments {
            bytes.extend_from_slice(&fragment.pack());
        }
        Ok(b64(&bytes))
    }

    /// Digest the stream chunks of one Receive response: defragment, route
    /// every completed message, and surface any replies the router wants
    /// posted (host responses).
    pub(crate) fn digest_streams(
        &mut self,
        streams: &[ferrosh_wsman::StreamChunk],
    ) -> Result<Vec<OutboundSoap>> {
        let mut replies = Vec::new();

        for chunk in streams {
            if chunk.bytes.is_empty() {
                continue;
            }
            trace!(
                stream = %chunk.name,
                command_id = ?chunk.command_id,
                len = chunk.bytes.len(),
                "defragmenting stream chunk"
            );
            for message in self.defragmenter.feed(&chunk.bytes)? {
                replies.extend(self.route_message(&message)?);
            }
        }

        Ok(replies)
    }

    /// Record the exit code a CommandState carries. Runs before the
    /// response's fragments are routed so a terminal PIPELINE_STATE in the
    /// same envelope finishes with the code attached.
    pub(crate) fn record_exit_code(&mut self, state: &ferrosh_wsman::CommandState) {
        if let Some(entry) = self.pipelines.get_mut(&state.command_id) {
            entry.exit_code = state.exit_code;
        }
    }

    /// Apply a CommandState report after routing. A `Done` for a pipeline
    /// that never sent its terminal PIPELINE_STATE (signal races,
    /// disconnects) falls back to Completed.
    pub(crate) fn apply_command_state(&mut self, state: &ferrosh_wsman::CommandState) {
        if let Some(entry) = self.pipelines.get_mut(&state.command_id) {
            if state.is_done() && !entry.is_terminal() {
                debug!(
                    pipeline_id = %state.command_id,
                    "command done without terminal pipeline state; completing"
                );
                entry.finish(ferrosh_psrp::PipelineStateValue::Completed, None);
            }
            if state.is_done() {
                self.pipelines.remove(&state.command_id);
            }
        }
    }

    /// Route one reassembled PSRP message to the pool or its pipeline.
    #[instrument(skip(self, message), fields(message_type = ?message.message_type, pid = ?message.pid))]
    fn route_message(&mut self, message: &PsrpMessage) -> Result<Vec<OutboundSoap>> {
        let mut replies = Vec::new();

        match message.message_type {
            MessageType::SessionCapability => {
                let capability = SessionCapabilityMsg::from_clixml(message.data_as_str()?)?;
                debug!(
                    protocol_version = %capability.protocol_version,
                    ps_version = %capability.ps_version,
                    "server session capability"
                );
                self.server_capability = Some(capability);
            }
            MessageType::ApplicationPrivateData => {
                let data = ApplicationPrivateDataMsg::from_clixml(message.data_as_str()?)?;
                self.application_private_data = Some(data.raw);
            }
            MessageType::RunspacePoolState => {
                let state = PoolStateMsg::from_clixml(message.data_as_str()?)?;
                self.apply_pool_state(&state)?;
            }
            MessageType::RunspaceAvailability => {
                trace!("runspace availability report (keepalive answer)");
            }
            MessageType::PipelineState => {
                let state = PipelineStateMsg::from_clixml(message.data_as_str()?)?;
                let pid = self.require_pid(message)?;
                self.apply_pipeline_state(pid, &state);
            }
            MessageType::PipelineOutput => {
                let text = stream_text(message.data_as_str()?)?;
                let pid = self.require_pid(message)?;
                self.push_record(pid, StreamRecord::Output(text));
            }
            MessageType::ErrorRecord => {
                let record = ErrorRecordMsg::from_clixml(message.data_as_str()?)?;
                let pid = self.require_pid(message)?;
                self.push_record(pid, StreamRecord::Error(record));
            }
            MessageType::WarningRecord => {
                let text = stream_text(message.data_as_str()?)?;
                let pid = self.require_pid(message)?;
                self.push_record(pid, StreamRecord::Warning(text));
            }
            MessageType::VerboseRecord => {
                let text = stream_text(message.data_as_str()?)?;
                let pid = self.require_pid(message)?;
                self.push_record(pid, StreamRecord::Verbose(text));
            }
            MessageType::DebugRecord => {
                let text = stream_text(message.data_as_str()?)?;
                let pid = self.require_pid(message)?;
                self.push_record(pid, StreamRecord::Debug(text));
            }
            MessageType::InformationRecord => {
                let record = InformationRecordMsg::from_clixml(message.data_as_str()?)?;
                let pid = self.require_pid(message)?;
                self.push_record(pid, StreamRecord::Information(record));
            }
            MessageType::ProgressRecord => {
                let record = ProgressRecordMsg::from_clixml(message.data_as_str()?)?;
                let pid = self.require_pid(message)?;
                self.push_record(pid, StreamRecord::Progress(record));
            }
            MessageType::PipelineHostCall => {
                let call = HostCallMsg::from_clixml(message.data_as_str()?)?;
                let pid = self.require_pid(message)?;
                if let Some(response) = self.host.handle(&call) {
                    let reply = response.to_pipeline_message(self.id, pid);
                    let data = self.pack_single(&reply)?;
                    let xml = self.shell.send(&self.wsman, "stdin", Some(pid), &data)?;
                    replies.push(OutboundSoap(xml));
                }
            }
            MessageType::RunspacePoolHostCall => {
                let call = HostCallMsg::from_clixml(message.data_as_str()?)?;
                if let Some(response) = self.host.handle(&call) {
                    let reply = response.to_pool_message(self.id);
                    let data = self.pack_single(&reply)?;
                    let xml = self.shell.send(&self.wsman, "stdin", None, &data)?;
                    replies.push(OutboundSoap(xml));
                }
            }
            other => {
                // Key exchange and the other server-initiated flows this
                // client does not participate in are logged, not fatal.
                warn!(message_type = ?other, "ignoring unhandled PSRP message");
            }
        }

        Ok(replies)
    }

    fn require_pid(&self, message: &PsrpMessage) -> Result<Uuid> {
        message.pid.ok_or_else(|| {
            Error::PsrpState(format!(
                "{:?} arrived without a pipeline id",
                message.message_type
            ))
        })
    }

    fn push_record(&mut self, pid: Uuid, record: StreamRecord) {
        match self.pipelines.get_mut(&pid) {
            Some(entry) => entry.push(record),
            None => warn!(pipeline_id = %pid, "record for unknown pipeline dropped"),
        }
    }

    fn apply_pool_state(&mut self, state: &PoolStateMsg) -> Result<()> {
        match state.state {
            PoolStateValue::Opened => self.set_state(PoolState::Opened),
            PoolStateValue::Broken => {
                self.pool_error = state.error_message.clone();
                self.set_state(PoolState::Broken)
            }
            PoolStateValue::Closed => self.set_state(PoolState::Closed),
            PoolStateValue::Disconnected => self.set_state(PoolState::Disconnected),
            other => {
                trace!(state = ?other, "intermediate pool state from server");
                Ok(())
            }
        }
    }

    fn apply_pipeline_state(&mut self, pid: Uuid, state: &PipelineStateMsg) {
        let Some(entry) = self.pipelines.get_mut(&pid) else {
            warn!(pipeline_id = %pid, "state for unknown pipeline");
            return;
        };

        debug!(pipeline_id = %pid, state = ?state.state, "pipeline state transition");
        if state.state.is_terminal() {
            entry.finish(state.state, state.exception_message.clone());
            self.pipelines.remove(&pid);
        } else {
            entry.state = state.state;
        }
    }

    /// Fail every live pipeline and mark the pool broken; used by the
    /// dispatch loop on fatal transport/auth/framing errors.
    pub(crate) fn break_pool(&mut self, reason: &str) {
        warn!(reason, "pool is broken");
        self.pool_error = Some(reason.to_owned());
        for (_, mut entry) in self.pipelines.drain() {
            entry.finish(
                ferrosh_psrp::PipelineStateValue::Failed,
                Some(reason.to_owned()),
            );
        }
        self.state = PoolState::Broken;
    }
}
