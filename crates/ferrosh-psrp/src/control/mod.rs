//! Control-plane payload builders and readers.
//!
//! Outbound messages render literal CLIXML; inbound readers extract only the
//! fields the pool and pipeline state machines act on, leaving the rest of
//! the server's object graph untouched.

mod create_pipeline;
mod host_call;
mod pool;
mod records;
mod state;

pub use create_pipeline::{CommandParameter, ParameterValue, PipelineCommand, PipelineInvocation};
pub use host_call::{HostCallMsg, HostResponse};
pub use pool::{
    ApplicationPrivateDataMsg, ConnectRunspacePool, EndOfPipelineInput, GetAvailableRunspaces,
    InitRunspacePool, PipelineInput, SessionCapability, SessionCapabilityMsg, SetMaxRunspaces,
    SetMinRunspaces,
};
pub use records::{ErrorRecordMsg, InformationRecordMsg, ProgressRecordMsg, stream_text};
pub use state::{PipelineStateMsg, PipelineStateValue, PoolStateMsg, PoolStateValue};
