//! The stable public surface: connect, execute (buffered, streaming,
//! fire-and-forget), disconnect/reconnect, session persistence, and the
//! file-copy conveniences — with MaxRunspaces admission, a retry policy
//! around execute, and a circuit breaker.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use base64::Engine;
use ferrosh_psrp::{PipelineCommand, PipelineInvocation};
use ferrosh_wsman::{Iso8601Duration, ResponseBody, ShellRemote, WsMan, parse_response};
use tokio::sync::{Mutex, Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::auth::AuthChannel;
use crate::config::{AuthConfig, ClientConfig, Endpoint};
use crate::dispatch::{OpenMode, PoolCommand, PoolDriver, PoolSnapshot};
use crate::host::NullHost;
use crate::pipeline::{ExecutionResult, PipelineHandle, PipelineStreams};
use crate::retry::CircuitBreaker;
use crate::runspace_pool::RunspacePool;
use crate::session::SessionState;
use crate::transport::Transport;
use crate::{Error, Result};

struct PoolHandle {
    cmd_tx: mpsc::Sender<PoolCommand>,
    driver: JoinHandle<()>,
    shutdown: CancellationToken,
    shell_id: Uuid,
    pool_id: Uuid,
}

impl PoolHandle {
    async fn command<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> PoolCommand,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| Error::PsrpState("pool dispatch task is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::PsrpState("pool dispatch task dropped the reply".into()))?
    }

    async fn snapshot(&self) -> Result<PoolSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(PoolCommand::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| Error::PsrpState("pool dispatch task is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::PsrpState("pool dispatch task dropped the reply".into()))
    }
}

/// A PSRP client for one endpoint. One client owns at most one runspace
/// pool; `execute` calls multiplex onto it up to `max_runspaces` at a time.
pub struct Client {
    endpoint: Endpoint,
    auth: AuthConfig,
    config: ClientConfig,
    pool: Option<PoolHandle>,
    admission: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    breaker: CircuitBreaker,
    detached: Mutex<HashMap<Uuid, PipelineStreams>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.endpoint.url())
            .field("connected", &self.pool.is_some())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(endpoint: Endpoint, auth: AuthConfig, config: ClientConfig) -> Result<Self> {
        auth.validate()?;
        config.validate()?;

        Ok(Self {
            admission: Arc::new(Semaphore::new(config.max_runspaces)),
            queued: Arc::new(AtomicUsize::new(0)),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            endpoint,
            auth,
            config,
            pool: None,
            detached: Mutex::new(HashMap::new()),
        })
    }

    fn wsman(&self) -> WsMan {
        WsMan::builder()
            .to(self.endpoint.url())
            .max_envelope_size(self.config.max_envelope_size)
            .operation_timeout(Iso8601Duration::from(self.config.operation_timeout))
            .build()
    }

    fn channel(&self) -> Result<AuthChannel> {
        let transport = Transport::new(self.endpoint.clone(), self.config.tls.clone());
        AuthChannel::new(transport, &self.auth)
    }

    fn build_pool(&self, shell_id: Option<Uuid>, pool_id: Option<Uuid>) -> RunspacePool {
        let shell = ShellRemote::builder()
            .configuration_name(self.endpoint.configuration_name().to_owned());
        let shell = match (shell_id, self.config.idle_timeout) {
            (Some(id), Some(idle)) => shell
                .shell_id(id)
                .idle_timeout(Iso8601Duration::from(idle))
                .build(),
            (Some(id), None) => shell.shell_id(id).build(),
            (None, Some(idle)) => shell.idle_timeout(Iso8601Duration::from(idle)).build(),
            (None, None) => shell.build(),
        };

        let mut pool = RunspacePool::new(
            self.wsman(),
            shell,
            self.config.min_runspaces,
            self.config.max_runspaces,
            self.config.max_envelope_size,
            Iso8601Duration::from(self.config.receive_timeout),
            Box::new(NullHost),
        );
        if let Some(pool_id) = pool_id {
            pool.id = pool_id;
        }
        pool
    }

    async fn spawn_pool(
        &mut self,
        pool: RunspacePool,
        mode: OpenMode,
    ) -> Result<PoolSnapshot> {
        let ops = self.channel()?;
        let receive = self.channel()?;

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (open_tx, open_rx) = oneshot::channel();
        let shutdown = CancellationToken::new();

        let driver = PoolDriver::new(
            pool,
            ops,
            receive,
            cmd_rx,
            open_tx,
            self.config.keepalive,
            shutdown.clone(),
        );
        let driver = tokio::spawn(driver.run(mode));

        let snapshot = match tokio::time::timeout(self.config.operation_timeout, open_rx).await {
            Err(_) => {
                shutdown.cancel();
                return Err(Error::Timeout);
            }
            Ok(Err(_)) => {
                shutdown.cancel();
                return Err(Error::PsrpState("pool task died during open".into()));
            }
            Ok(Ok(result)) => result?,
        };

        info!(
            shell_id = %snapshot.shell_id,
            pool_id = %snapshot.pool_id,
            "runspace pool is open"
        );

        self.pool = Some(PoolHandle {
            cmd_tx,
            driver,
            shutdown,
            shell_id: snapshot.shell_id,
            pool_id: snapshot.pool_id,
        });
        Ok(snapshot)
    }

    /// Open the runspace pool (shell Create + PSRP negotiation in one
    /// round-trip, then wait for RUNSPACEPOOL_STATE=Opened).
    #[instrument(skip(self), fields(endpoint = %self.endpoint.url()))]
    pub async fn connect(&mut self) -> Result<PoolSnapshot> {
        if self.pool.is_some() {
            return Err(Error::PsrpState("client is already connected".into()));
        }
        let pool = self.build_pool(None, None);
        self.spawn_pool(pool, OpenMode::Create).await
    }

    /// Authenticate and verify the WSMan endpoint without opening a pool
    /// (shell enumeration round-trip).
    pub async fn connect_wsman_only(&mut self) -> Result<()> {
        let mut channel = self.channel()?;
        let xml = ShellRemote::enumerate(&self.wsman())?;
        let response = channel.send_soap(&xml).await?;
        parse_response(&response).map_err(Error::from)?;
        info!("WSMan endpoint reachable and authenticated");
        Ok(())
    }

    fn pool(&self) -> Result<&PoolHandle> {
        self.pool
            .as_ref()
            .ok_or_else(|| Error::PsrpState("client is not connected".into()))
    }

    /// Acquire an admission permit, queueing up to `max_queue` waiters.
    async fn admit(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        if let Ok(permit) = Arc::clone(&self.admission).try_acquire_owned() {
            return Ok(permit);
        }

        if self.queued.fetch_add(1, Ordering::SeqCst) >= self.config.max_queue {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Overloaded);
        }

        let permit = Arc::clone(&self.admission).acquire_owned().await;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        permit.map_err(|_| Error::PsrpState("admission semaphore closed".into()))
    }

    async fn start_pipeline(&self, invocation: PipelineInvocation) -> Result<PipelineStreams> {
        let permit = self.admit().await?;
        let mut streams = self
            .pool()?
            .command(|reply| PoolCommand::RunPipeline { invocation, reply })
            .await?;
        streams.permit = Some(permit);
        Ok(streams)
    }

    /// Run a script and buffer every stream until the terminal state.
    /// Wrapped by the retry policy and the circuit breaker; only transient
    /// error kinds are re-attempted.
    #[instrument(skip(self, script))]
    pub async fn execute(&self, script: &str) -> Result<ExecutionResult> {
        self.breaker.check()?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self.execute_once(script).await;
            match result {
                Ok(result) => {
                    self.breaker.record_success();
                    return Ok(result);
                }
                Err(error) => {
                    self.breaker.record_failure();
                    if self.config.retry.should_retry(attempt, &error) {
                        let delay = self.config.retry.delay(attempt);
                        warn!(
                            attempt,
                            error = %error,
                            delay_ms = delay.as_millis() as u64,
                            "execute failed; retrying"
                        );
                        tokio::time::sleep(delay).await;
                        self.breaker.check()?;
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }

    async fn execute_once(&self, script: &str) -> Result<ExecutionResult> {
        let streams = self
            .start_pipeline(PipelineInvocation::for_script(script))
            .await?;
        streams.collect().await
    }

    /// Run a script and hand back live stream channels plus `wait()`.
    pub async fn execute_stream(&self, script: &str) -> Result<PipelineStreams> {
        self.start_pipeline(PipelineInvocation::for_script(script))
            .await
    }

    /// Start a pipeline and return immediately; collect later with
    /// [`Client::wait_pipeline`] or abort with [`Client::stop`].
    pub async fn execute_async(&self, script: &str) -> Result<PipelineHandle> {
        let streams = self
            .start_pipeline(PipelineInvocation::for_script(script))
            .await?;
        let handle = streams.handle;
        self.detached.lock().await.insert(handle.id(), streams);
        Ok(handle)
    }

    /// Collect the buffered result of a pipeline started with
    /// [`Client::execute_async`].
    pub async fn wait_pipeline(&self, handle: PipelineHandle) -> Result<ExecutionResult> {
        let streams = self
            .detached
            .lock()
            .await
            .remove(&handle.id())
            .ok_or_else(|| Error::PsrpState("unknown pipeline handle".into()))?;
        streams.collect().await
    }

    /// Run a script, cancelling (Signal terminate) if the token fires.
    pub async fn execute_with_cancel(
        &self,
        script: &str,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let streams = self
            .start_pipeline(PipelineInvocation::for_script(script))
            .await?;
        let handle = streams.handle;

        tokio::select! {
            result = streams.collect() => result,
            () = cancel.cancelled() => {
                debug!(pipeline_id = %handle.id(), "cancellation requested; signalling");
                let _ = self.stop(handle).await;
                Err(Error::Canceled)
            }
        }
    }

    /// Run a script with an overall deadline; on expiry the pipeline is
    /// signalled and `Timeout` returned.
    pub async fn execute_with_timeout(
        &self,
        script: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        let cancel = CancellationToken::new();
        let guard = cancel.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            guard.cancel();
        });
        let result = self.execute_with_cancel(script, cancel).await;
        timer.abort();
        match result {
            Err(Error::Canceled) => Err(Error::Timeout),
            other => other,
        }
    }

    /// Feed one input record to a running pipeline.
    pub async fn send_input(&self, handle: PipelineHandle, record: &str) -> Result<()> {
        self.pool()?
            .command(|reply| PoolCommand::SendInput {
                pipeline: handle.id(),
                record: Some(record.to_owned()),
                end: false,
                reply,
            })
            .await
    }

    /// Close the input stream (END_OF_PIPELINE_INPUT).
    pub async fn end_input(&self, handle: PipelineHandle) -> Result<()> {
        self.pool()?
            .command(|reply| PoolCommand::SendInput {
                pipeline: handle.id(),
                record: None,
                end: true,
                reply,
            })
            .await
    }

    /// Signal a pipeline to terminate and await its Stopped state.
    pub async fn stop(&self, handle: PipelineHandle) -> Result<()> {
        self.pool()?
            .command(|reply| PoolCommand::Stop {
                pipeline: handle.id(),
                reply,
            })
            .await
    }

    /// Raise or lower the server-side runspace cap.
    pub async fn set_max_runspaces(&self, max: usize) -> Result<()> {
        if max == 0 {
            return Err(Error::config("max runspaces must be at least 1"));
        }
        self.pool()?
            .command(|reply| PoolCommand::SetMaxRunspaces { max, reply })
            .await
    }

    /// Current pool state, health, and identifiers.
    pub async fn state(&self) -> Result<PoolSnapshot> {
        self.pool()?.snapshot().await
    }

    /// Detach from the shell, leaving pipelines running server-side. The
    /// client stays usable for `reconnect`.
    #[instrument(skip(self))]
    pub async fn disconnect(&mut self) -> Result<SessionState> {
        let state = self.session_state().await?;
        self.pool()?
            .command(|reply| PoolCommand::Disconnect { reply })
            .await?;

        // The driver keeps the disconnected pool; tear down our side so a
        // fresh reconnect builds clean channels.
        if let Some(handle) = self.pool.take() {
            handle.shutdown.cancel();
            handle.driver.abort();
        }
        Ok(state)
    }

    /// Re-attach to a disconnected shell on this endpoint.
    #[instrument(skip(self))]
    pub async fn reconnect(&mut self, shell_id: Uuid) -> Result<PoolSnapshot> {
        if self.pool.is_some() {
            return Err(Error::PsrpState("client is already connected".into()));
        }
        let pool = self.build_pool(Some(shell_id), None);
        self.spawn_pool(pool, OpenMode::Reconnect).await
    }

    /// Re-attach using persisted session state (same process or a new one).
    /// Pipelines recorded in the state are re-registered so output produced
    /// while disconnected can be recovered with [`Client::wait_pipeline`].
    pub async fn reconnect_session(&mut self, state: &SessionState) -> Result<PoolSnapshot> {
        if self.pool.is_some() {
            return Err(Error::PsrpState("client is already connected".into()));
        }
        self.endpoint = state.endpoint.to_endpoint()?;
        let mut pool = self.build_pool(Some(state.shell_id), Some(state.pool_id));

        let mut recovered = Vec::new();
        for pipeline_id in &state.pipeline_ids {
            recovered.push(pool.register_pipeline(*pipeline_id));
        }

        let snapshot = self.spawn_pool(pool, OpenMode::Reconnect).await?;

        let mut detached = self.detached.lock().await;
        for streams in recovered {
            detached.insert(streams.handle.id(), streams);
        }
        drop(detached);

        Ok(snapshot)
    }

    /// Enumerate shells on the endpoint that are disconnected and could be
    /// reconnected.
    pub async fn list_disconnected(&self) -> Result<Vec<Uuid>> {
        let mut channel = self.channel()?;
        let xml = ShellRemote::enumerate(&self.wsman())?;
        let response = channel.send_soap(&xml).await?;

        match parse_response(&response).map_err(Error::from)?.body {
            ResponseBody::Enumerated { shells } => Ok(shells
                .into_iter()
                .filter(|shell| {
                    shell
                        .state
                        .as_deref()
                        .is_some_and(|state| state.ends_with("Disconnected"))
                })
                .map(|shell| shell.shell_id)
                .collect()),
            other => Err(Error::protocol(format!(
                "unexpected Enumerate response: {other:?}"
            ))),
        }
    }

    /// Delete a (disconnected) shell without reconnecting to it.
    pub async fn remove_disconnected(&self, shell_id: Uuid) -> Result<()> {
        let mut channel = self.channel()?;
        let shell = ShellRemote::builder()
            .shell_id(shell_id)
            .configuration_name(self.endpoint.configuration_name().to_owned())
            .build();
        let xml = shell.delete(&self.wsman())?;
        let response = channel.send_soap(&xml).await?;
        parse_response(&response).map_err(Error::from)?;
        Ok(())
    }

    /// Close the pool (Delete shell) and release everything.
    #[instrument(skip(self))]
    pub async fn close(&mut self) -> Result<()> {
        let Some(handle) = self.pool.take() else {
            return Ok(());
        };
        let result = handle
            .command(|reply| PoolCommand::Close { reply })
            .await;
        handle.shutdown.cancel();
        // The driver exits on Close; abort is a no-op then.
        handle.driver.abort();
        self.detached.lock().await.clear();
        result
    }

    async fn session_state(&self) -> Result<SessionState> {
        let handle = self.pool()?;
        let snapshot = handle.snapshot().await?;
        Ok(SessionState {
            endpoint: (&self.endpoint).into(),
            auth_kind: self.auth.scheme.as_str().to_owned(),
            shell_id: handle.shell_id,
            pool_id: handle.pool_id,
            pipeline_ids: snapshot.live_pipelines,
            output_paths: HashMap::new(),
        })
    }

    /// Persist the session for a later `reconnect_session` (owner-only
    /// file).
    pub async fn save_state(&self, path: &Path) -> Result<()> {
        self.session_state().await?.save(path)
    }

    /// Load persisted session state.
    pub fn load_state(path: &Path) -> Result<SessionState> {
        SessionState::load(path)
    }

    /// Copy a local file to the remote host in base64 chunks over pipeline
    /// executions.
    #[instrument(skip(self), fields(local = %local.display(), remote))]
    pub async fn copy_file(&self, local: &Path, remote: &str) -> Result<()> {
        const CHUNK: usize = 48 * 1024;

        let bytes = std::fs::read(local)?;
        let remote = quote_pwsh(remote);

        let setup = format!(
            "if (Test-Path -LiteralPath '{remote}') {{ Remove-Item -LiteralPath '{remote}' -Force }}"
        );
        self.execute_raw(&setup).await?;

        for chunk in bytes.chunks(CHUNK) {
            let encoded = base64::engine::general_purpose::STANDARD.encode(chunk);
            let script = format!(
                "$fs = [System.IO.File]::Open('{remote}', [System.IO.FileMode]::Append); \
                 $b = [System.Convert]::FromBase64String('{encoded}'); \
                 $fs.Write($b, 0, $b.Length); $fs.Close()"
            );
            self.execute_raw(&script).await?;
        }

        info!(bytes = bytes.len(), "file copied to remote host");
        Ok(())
    }

    /// Fetch a remote file into a local path, base64 over pipeline output.
    #[instrument(skip(self), fields(remote, local = %local.display()))]
    pub async fn fetch_file(&self, remote: &str, local: &Path) -> Result<()> {
        let remote = quote_pwsh(remote);
        let script = format!(
            "[System.Convert]::ToBase64String([System.IO.File]::ReadAllBytes('{remote}'))"
        );
        let result = self.execute_raw(&script).await?;

        let encoded: String = result.output.concat();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::protocol(format!("remote file payload is not base64: {e}")))?;

        std::fs::write(local, &bytes)?;
        info!(bytes = bytes.len(), "file fetched from remote host");
        Ok(())
    }

    /// Execute without the Out-String projection, so single-object outputs
    /// (like one base64 string) arrive unwrapped.
    async fn execute_raw(&self, script: &str) -> Result<ExecutionResult> {
        let invocation = PipelineInvocation::builder()
            .commands(vec![PipelineCommand::script(script)])
            .build();
        let streams = self.start_pipeline(invocation).await?;
        streams.collect().await
    }
}

/// Escape for interpolation inside a PowerShell single-quoted literal.
fn quote_pwsh(value: &str) -> String {
    value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_quote_escaping() {
        assert_eq!(quote_pwsh("C:\\temp\\a.txt"), "C:\\temp\\a.txt");
        assert_eq!(quote_pwsh("it's"), "it''s");
    }
}
