//! The per-pool dispatch task: one long-poll Receive in flight at all
//! times, command work items applied in between, and every piece of pool
//! and pipeline state written from exactly one place.

use std::time::Duration;

use ferrosh_psrp::PipelineInvocation;
use ferrosh_wsman::{ResponseBody, parse_response};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::auth::AuthChannel;
use crate::pipeline::PipelineStreams;
use crate::runspace_pool::{OutboundSoap, PoolState, RunspacePool};
use crate::{Error, Result};

/// Work items posted to the dispatch loop. Every mutation of pool state
/// goes through one of these.
#[derive(Debug)]
pub(crate) enum PoolCommand {
    RunPipeline {
        invocation: PipelineInvocation,
        reply: oneshot::Sender<Result<PipelineStreams>>,
    },
    SendInput {
        pipeline: Uuid,
        record: Option<String>,
        end: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        pipeline: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    SetMaxRunspaces {
        max: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<PoolSnapshot>,
    },
}

/// Observable pool state for the facade.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub state: PoolState,
    pub shell_id: Uuid,
    pub pool_id: Uuid,
    pub live_pipelines: Vec<Uuid>,
    pub error: Option<String>,
}

/// How the driver brings its pool up.
#[derive(Debug, Clone, Copy)]
pub(crate) enum OpenMode {
    /// Create a fresh shell and negotiate the pool.
    Create,
    /// Re-attach to a disconnected shell.
    Reconnect,
}

pub(crate) struct PoolDriver {
    pool: RunspacePool,
    /// Channel for Command/Send/Signal/Delete; serialized by this task.
    ops: AuthChannel,
    /// Channel dedicated to the long-poll Receive; absent while a poll is
    /// in flight.
    receive_channel: Option<AuthChannel>,
    cmd_rx: mpsc::Receiver<PoolCommand>,
    recv_tx: mpsc::Sender<(AuthChannel, Result<String>)>,
    recv_rx: mpsc::Receiver<(AuthChannel, Result<String>)>,
    open_notify: Option<oneshot::Sender<Result<PoolSnapshot>>>,
    keepalive: Option<Duration>,
    shutdown: CancellationToken,
}

impl PoolDriver {
    pub(crate) fn new(
        pool: RunspacePool,
        ops: AuthChannel,
        receive_channel: AuthChannel,
        cmd_rx: mpsc::Receiver<PoolCommand>,
        open_notify: oneshot::Sender<Result<PoolSnapshot>>,
        keepalive: Option<Duration>,
        shutdown: CancellationToken,
    ) -> Self {
        let (recv_tx, recv_rx) = mpsc::channel(1);
        Self {
            pool,
            ops,
            receive_channel: Some(receive_channel),
            cmd_rx,
            recv_tx,
            recv_rx,
            open_notify: Some(open_notify),
            keepalive,
            shutdown,
        }
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            state: self.pool.state,
            shell_id: self.pool.shell.shell_id,
            pool_id: self.pool.id,
            live_pipelines: self.pool.pipelines.keys().copied().collect(),
            error: self.pool.pool_error.clone(),
        }
    }

    /// Entry point: bring the pool up, then run the dispatch loop until
    /// closed or broken beyond use.
    #[instrument(skip(self), fields(pool_id = %self.pool.id))]
    pub(crate) async fn run(mut self, mode: OpenMode) {
        if let Err(e) = self.open(mode).await {
            warn!(error = %e, "pool open failed");
            self.pool.break_pool(&e.to_string());
            self.notify_open(Err(e));
            // Keep serving snapshots/commands so callers see Broken rather
            // than a dead channel.
        }

        let keepalive_period = self.keepalive.unwrap_or(Duration::from_secs(3600));
        let mut keepalive = tokio::time::interval(keepalive_period);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.reset();

        loop {
            self.maybe_start_receive();

            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    if self.pool.state == PoolState::Disconnected {
                        // A disconnected shell is deliberately left alive
                        // server-side for reconnection.
                        debug!("shutdown after disconnect; leaving shell in place");
                        return;
                    }
                    debug!("shutdown requested; closing pool");
                    let _ = self.close_pool().await;
                    return;
                }

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None => {
                            debug!("command channel closed; closing pool");
                            let _ = self.close_pool().await;
                            return;
                        }
                        Some(PoolCommand::Close { reply }) => {
                            let result = self.close_pool().await;
                            let _ = reply.send(result);
                            return;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }

                maybe = self.recv_rx.recv() => {
                    if let Some((channel, result)) = maybe {
                        self.receive_channel = Some(channel);
                        self.handle_receive_result(result).await;
                    }
                }

                _ = keepalive.tick(), if self.keepalive.is_some() => {
                    self.send_keepalive().await;
                }
            }

            if self.pool.state.is_terminal() && self.open_notify.is_none() {
                // Stay alive only to answer queued commands; drain fast.
                while let Ok(cmd) = self.cmd_rx.try_recv() {
                    self.reject_command(cmd);
                }
                if self.pool.state == PoolState::Closed {
                    return;
                }
            }
        }
    }

    async fn open(&mut self, mode: OpenMode) -> Result<()> {
        match mode {
            OpenMode::Create => {
                let xml = self.pool.open_request()?;
                let response = self.ops.send_soap(&xml).await?;
                match parse_response(&response).map_err(Error::from)?.body {
                    ResponseBody::Created { shell_id } => {
                        debug!(%shell_id, "shell created");
                        self.pool.shell.shell_id = shell_id;
                    }
                    other => {
                        return Err(Error::protocol(format!(
                            "unexpected Create response: {other:?}"
                        )));
                    }
                }
                // RUNSPACEPOOL_STATE=Opened arrives on the receive loop.
                Ok(())
            }
            OpenMode::Reconnect => {
                let xml = self.pool.reconnect_request()?;
                let response = self.ops.send_soap(&xml).await?;
                match parse_response(&response).map_err(Error::from)?.body {
                    ResponseBody::Reconnected | ResponseBody::Other(_) => {
                        // Re-bind this client to the pool.
                        let connect = self.pool.connect_runspace_pool_request()?;
                        let response = self.ops.send_soap(&connect).await?;
                        parse_response(&response).map_err(Error::from)?;

                        self.pool.set_state(PoolState::Opened)?;
                        self.notify_open(Ok(self.snapshot()));
                        Ok(())
                    }
                    other => Err(Error::protocol(format!(
                        "unexpected Reconnect response: {other:?}"
                    ))),
                }
            }
        }
    }

    fn maybe_start_receive(&mut self) {
        if !matches!(
            self.pool.state,
            PoolState::NegotiationSent | PoolState::Opened
        ) {
            return;
        }
        let Some(mut channel) = self.receive_channel.take() else {
            return; // already polling
        };

        let xml = match self.pool.receive_request() {
            Ok(xml) => xml,
            Err(e) => {
                warn!(error = %e, "building Receive failed");
                self.receive_channel = Some(channel);
                return;
            }
        };

        let tx = self.recv_tx.clone();
        tokio::spawn(async move {
            let result = channel.send_soap(&xml).await;
            let _ = tx.send((channel, result)).await;
        });
    }

    async fn handle_receive_result(&mut self, result: Result<String>) {
        match result {
            Ok(soap) => match parse_response(&soap).map_err(Error::from) {
                Ok(envelope) => {
                    if let ResponseBody::Received {
                        streams,
                        command_state,
                    } = envelope.body
                    {
                        if let Some(state) = &command_state {
                            self.pool.record_exit_code(state);
                        }
                        match self.pool.digest_streams(&streams) {
                            Ok(replies) => self.post_replies(replies).await,
                            Err(e) => {
                                // Framing errors are fatal for the pool.
                                self.fail_pool(&e);
                                return;
                            }
                        }
                        if let Some(state) = command_state {
                            self.pool.apply_command_state(&state);
                        }
                    }
                    self.check_open_progress();
                }
                Err(e) => self.handle_receive_error(e),
            },
            Err(e) => self.handle_receive_error(e),
        }
    }

    fn handle_receive_error(&mut self, error: Error) {
        match &error {
            Error::WsmanFault {
                operation_timeout: true,
                ..
            } => {
                // Benign keepalive expiry; the loop re-issues Receive.
                debug!("receive operation timeout; re-polling");
            }
            _ if matches!(
                self.pool.state,
                PoolState::Disconnected | PoolState::Closing | PoolState::Closed
            ) =>
            {
                debug!(error = %error, "receive error after detach; ignored");
            }
            _ => self.fail_pool(&error),
        }
    }

    fn fail_pool(&mut self, error: &Error) {
        self.pool.break_pool(&error.to_string());
        self.notify_open(Err(Error::PsrpState(format!(
            "pool broke during open: {error}"
        ))));
    }

    fn check_open_progress(&mut self) {
        match self.pool.state {
            PoolState::Opened => {
                let snapshot = self.snapshot();
                self.notify_open(Ok(snapshot));
            }
            PoolState::Broken => {
                let reason = self
                    .pool
                    .pool_error
                    .clone()
                    .unwrap_or_else(|| "pool negotiation failed".to_owned());
                self.notify_open(Err(Error::PsrpState(reason)));
            }
            _ => {}
        }
    }

    fn notify_open(&mut self, result: Result<PoolSnapshot>) {
        if let Some(notify) = self.open_notify.take() {
            let _ = notify.send(result);
        }
    }

    async fn post_replies(&mut self, replies: Vec<OutboundSoap>) {
        for OutboundSoap(xml) in replies {
            match self.ops.send_soap(&xml).await {
                Ok(response) => {
                    if let Err(e) = parse_response(&response) {
                        warn!(error = %e, "host response post rejected");
                    }
                }
                Err(e) => warn!(error = %e, "posting host response failed"),
            }
        }
    }

    async fn handle_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::RunPipeline { invocation, reply } => {
                let result = self.start_pipeline(&invocation).await;
                let _ = reply.send(result);
            }
            PoolCommand::SendInput {
                pipeline,
                record,
                end,
                reply,
            } => {
                let result = self.send_input(pipeline, record.as_deref(), end).await;
                let _ = reply.send(result);
            }
            PoolCommand::Stop { pipeline, reply } => {
                let result = self.stop_pipeline(pipeline).await;
                let _ = reply.send(result);
            }
            PoolCommand::SetMaxRunspaces { max, reply } => {
                let result = self.post_pool_soap(|pool| pool.set_max_runspaces_request(max)).await;
                let _ = reply.send(result);
            }
            PoolCommand::Disconnect { reply } => {
                let result = self.disconnect_pool().await;
                let _ = reply.send(result);
            }
            PoolCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            PoolCommand::Close { .. } => unreachable!("Close is handled by the loop"),
        }
    }

    fn reject_command(&mut self, command: PoolCommand) {
        let message = format!("pool is {:?}", self.pool.state);
        match command {
            PoolCommand::RunPipeline { reply, .. } => {
                let _ = reply.send(Err(Error::PsrpState(message)));
            }
            PoolCommand::SendInput { reply, .. }
            | PoolCommand::Stop { reply, .. }
            | PoolCommand::SetMaxRunspaces { reply, .. }
            | PoolCommand::Disconnect { reply }
            | PoolCommand::Close { reply } => {
                let _ = reply.send(Err(Error::PsrpState(message)));
            }
            PoolCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn start_pipeline(
        &mut self,
        invocation: &PipelineInvocation,
    ) -> Result<PipelineStreams> {
        let pipeline_id = Uuid::new_v4();
        let xml = self.pool.command_request(pipeline_id, invocation)?;
        let response = self.ops.send_soap(&xml).await?;

        match parse_response(&response).map_err(Error::from)?.body {
            ResponseBody::CommandStarted { command_id } => {
                if command_id != pipeline_id {
                    debug!(
                        requested = %pipeline_id,
                        granted = %command_id,
                        "server assigned a different command id"
                    );
                }
                let streams = self.pool.register_pipeline(command_id);
                if let Some(entry) = self.pool.pipelines.get_mut(&command_id) {
                    entry.state = ferrosh_psrp::PipelineStateValue::Running;
                }
                info!(pipeline_id = %command_id, "pipeline started");
                Ok(streams)
            }
            other => Err(Error::protocol(format!(
                "unexpected Command response: {other:?}"
            ))),
        }
    }

    async fn send_input(
        &mut self,
        pipeline: Uuid,
        record: Option<&str>,
        end: bool,
    ) -> Result<()> {
        let requests = self.pool.input_requests(pipeline, record, end)?;
        for xml in requests {
            let response = self.ops.send_soap(&xml).await?;
            parse_response(&response).map_err(Error::from)?;
        }
        Ok(())
    }

    async fn stop_pipeline(&mut self, pipeline: Uuid) -> Result<()> {
        if !self.pool.pipelines.contains_key(&pipeline) {
            return Ok(()); // already finished
        }

        let xml = self.pool.signal_request(pipeline)?;
        let response = self.ops.send_soap(&xml).await?;
        parse_response(&response).map_err(Error::from)?;

        if let Some(mut entry) = self.pool.pipelines.remove(&pipeline) {
            entry.finish(ferrosh_psrp::PipelineStateValue::Stopped, None);
        }
        info!(pipeline_id = %pipeline, "pipeline stopped");
        Ok(())
    }

    async fn post_pool_soap<F>(&mut self, build: F) -> Result<()>
    where
        F: FnOnce(&mut RunspacePool) -> Result<String>,
    {
        let xml = build(&mut self.pool)?;
        let response = self.ops.send_soap(&xml).await?;
        parse_response(&response).map_err(Error::from)?;
        Ok(())
    }

    async fn disconnect_pool(&mut self) -> Result<()> {
        if self.pool.state != PoolState::Opened {
            return Err(Error::PsrpState(format!(
                "cannot disconnect a pool in state {:?}",
                self.pool.state
            )));
        }
        let xml = self.pool.disconnect_request()?;
        let response = self.ops.send_soap(&xml).await?;
        parse_response(&response).map_err(Error::from)?;
        self.pool.set_state(PoolState::Disconnected)?;
        info!("pool disconnected; pipelines keep running server-side");
        Ok(())
    }

    async fn close_pool(&mut self) -> Result<()> {
        if matches!(self.pool.state, PoolState::Closed | PoolState::Broken) {
            return Ok(());
        }
        self.pool.set_state(PoolState::Closing)?;

        let xml = self.pool.delete_request()?;
        let result = async {
            let response = self.ops.send_soap(&xml).await?;
            parse_response(&response).map_err(Error::from)?;
            Ok(())
        }
        .await;

        // Whatever the server said, the local pool is done.
        for (_, mut entry) in self.pool.pipelines.drain() {
            entry.finish(ferrosh_psrp::PipelineStateValue::Stopped, None);
        }
        self.pool.set_state(PoolState::Closed)?;
        info!("pool closed");
        result
    }

    async fn send_keepalive(&mut self) {
        if self.pool.state != PoolState::Opened {
            return;
        }
        if let Err(e) = self.post_pool_soap(RunspacePool::keepalive_request).await {
            warn!(error = %e, "keepalive ping failed");
        }
    }
}
