use ferrosh_psrp::{
    ErrorRecordMsg, InformationRecordMsg, PipelineStateValue, ProgressRecordMsg,
};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::{Error, Result};

/// Lightweight, copyable identifier for a pipeline; all operations go
/// through the owning pool with this handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle {
    pub(crate) id: Uuid,
}

impl PipelineHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// A record demultiplexed off the pipeline's streams, tagged by stream.
#[derive(Debug, Clone)]
pub enum StreamRecord {
    Output(String),
    Error(ErrorRecordMsg),
    Warning(String),
    Verbose(String),
    Debug(String),
    Information(InformationRecordMsg),
    Progress(ProgressRecordMsg),
}

/// Terminal summary of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub state: PipelineStateValue,
    pub had_errors: bool,
    pub exception_message: Option<String>,
    pub error_records: Vec<ErrorRecordMsg>,
    pub exit_code: Option<i32>,
}

impl PipelineOutcome {
    /// A `Failed` terminal state becomes the `Pipeline` error; `Stopped`
    /// and `Completed` are success from the transport's point of view.
    pub fn into_result(self) -> Result<Self> {
        if self.state == PipelineStateValue::Failed {
            Err(Error::Pipeline {
                message: self
                    .exception_message
                    .clone()
                    .unwrap_or_else(|| "pipeline failed".to_owned()),
                records: self.error_records,
            })
        } else {
            Ok(self)
        }
    }
}

/// The channel ends handed to a streaming caller. Senders close when the
/// terminal PIPELINE_STATE arrives, so iteration simply ends.
#[derive(Debug)]
pub struct PipelineStreams {
    pub handle: PipelineHandle,
    pub records: mpsc::UnboundedReceiver<StreamRecord>,
    pub(crate) done: oneshot::Receiver<PipelineOutcome>,
    /// Admission permit held until the caller is done with this pipeline.
    pub(crate) permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl PipelineStreams {
    /// Block until the terminal state. Remaining records are dropped;
    /// callers that want them drain `records` first.
    pub async fn wait(self) -> Result<PipelineOutcome> {
        drop(self.records);
        self.done
            .await
            .map_err(|_| Error::PsrpState("pipeline dropped without a terminal state".into()))
    }

    /// Drain every stream into a buffered [`ExecutionResult`], returning
    /// when the terminal state arrives.
    pub async fn collect(mut self) -> Result<ExecutionResult> {
        let mut result = ExecutionResult::default();

        while let Some(record) = self.records.recv().await {
            match record {
                StreamRecord::Output(text) => result.output.push(text),
                StreamRecord::Error(record) => result.errors.push(record),
                StreamRecord::Warning(text) => result.warnings.push(text),
                StreamRecord::Verbose(text) => result.verbose.push(text),
                StreamRecord::Debug(text) => result.debug.push(text),
                StreamRecord::Information(record) => result.information.push(record),
                StreamRecord::Progress(record) => result.progress.push(record),
            }
        }

        let outcome = self
            .done
            .await
            .map_err(|_| Error::PsrpState("pipeline dropped without a terminal state".into()))?;

        result.state = outcome.state;
        result.had_errors = outcome.had_errors || !result.errors.is_empty();
        result.exit_code = outcome.exit_code;
        result.exception_message = outcome.exception_message.clone();

        if outcome.state == PipelineStateValue::Failed {
            // Terminal failure still hands back the streams collected so
            // far, via the error's records.
            let mut records = outcome.error_records;
            if records.is_empty() {
                records = result.errors.clone();
            }
            return Err(Error::Pipeline {
                message: outcome
                    .exception_message
                    .unwrap_or_else(|| "pipeline failed".to_owned()),
                records,
            });
        }

        Ok(result)
    }
}

/// Everything a buffered `execute` returns. `had_errors` distinguishes
/// non-terminating stream errors from a terminal failure (which surfaces as
/// `Error::Pipeline` instead).
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub output: Vec<String>,
    pub errors: Vec<ErrorRecordMsg>,
    pub warnings: Vec<String>,
    pub verbose: Vec<String>,
    pub debug: Vec<String>,
    pub information: Vec<InformationRecordMsg>,
    pub progress: Vec<ProgressRecordMsg>,
    pub state: PipelineStateValue,
    pub had_errors: bool,
    pub exit_code: Option<i32>,
    pub exception_message: Option<String>,
}

/// Dispatch-loop-owned side of a live pipeline.
#[derive(Debug)]
pub(crate) struct PipelineEntry {
    pub(crate) state: PipelineStateValue,
    pub(crate) records_tx: mpsc::UnboundedSender<StreamRecord>,
    pub(crate) done_tx: Option<oneshot::Sender<PipelineOutcome>>,
    pub(crate) had_errors: bool,
    pub(crate) error_records: Vec<ErrorRecordMsg>,
    pub(crate) exit_code: Option<i32>,
}

impl PipelineEntry {
    pub(crate) fn new(id: Uuid) -> (Self, PipelineStreams) {
        let (records_tx, records_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        let entry = Self {
            state: PipelineStateValue::NotStarted,
            records_tx,
            done_tx: Some(done_tx),
            had_errors: false,
            error_records: Vec::new(),
            exit_code: None,
        };
        let streams = PipelineStreams {
            handle: PipelineHandle { id },
            records: records_rx,
            done: done_rx,
            permit: None,
        };
        (entry, streams)
    }

    pub(crate) fn push(&mut self, record: StreamRecord) {
        if let StreamRecord::Error(error) = &record {
            self.had_errors = true;
            self.error_records.push(error.clone());
        }
        // A receiver that went away just means the caller stopped
        // listening; records are dropped silently.
        let _ = self.records_tx.send(record);
    }

    /// Deliver the terminal state exactly once; the records channel closes
    /// with the entry.
    pub(crate) fn finish(&mut self, state: PipelineStateValue, exception_message: Option<String>) {
        self.state = state;
        if let Some(done_tx) = self.done_tx.take() {
            let _ = done_tx.send(PipelineOutcome {
                state,
                had_errors: self.had_errors,
                exception_message,
                error_records: std::mem::take(&mut self.error_records),
                exit_code: self.exit_code,
            });
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
