use crate::clixml;
use crate::PsrpError;

/// RunspacePoolState values from MS-PSRP 2.2.3.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStateValue {
    BeforeOpen,
    Opening,
    Opened,
    Closed,
    Closing,
    Broken,
    NegotiationSent,
    NegotiationSucceeded,
    Connecting,
    Disconnected,
}

impl TryFrom<i32> for PoolStateValue {
    type Error = PsrpError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        let state = match value {
            0 => Self::BeforeOpen,
            1 => Self::Opening,
            2 => Self::Opened,
            3 => Self::Closed,
            4 => Self::Closing,
            5 => Self::Broken,
            6 => Self::NegotiationSent,
            7 => Self::NegotiationSucceeded,
            8 => Self::Connecting,
            9 => Self::Disconnected,
            other => {
                return Err(PsrpError::Payload(format!(
                    "unknown RunspacePoolState value: {other}"
                )));
            }
        };
        Ok(state)
    }
}

/// A RUNSPACEPOOL_STATE message, optionally carrying the error that broke
/// the pool.
#[derive(Debug, Clone)]
pub struct PoolStateMsg {
    pub state: PoolStateValue,
    pub error_message: Option<String>,
}

impl PoolStateMsg {
    pub fn from_clixml(payload: &str) -> Result<Self, PsrpError> {
        let doc = clixml::parse_document(payload)?;
        let root = doc.root_element();

        let state = PoolStateValue::try_from(clixml::named_i32(root, "RunspaceState")?)?;
        let error_message = clixml::find_named(root, "ExceptionAsErrorRecord")
            .and_then(|node| {
                node.descendants()
                    .find(|n| n.is_element() && n.has_tag_name("ToString"))
            })
            .and_then(|n| n.text().map(str::to_owned));

        Ok(Self {
            state,
            error_message,
        })
    }
}

/// PSInvocationState values from MS-PSRP 2.2.3.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineStateValue {
    #[default]
    NotStarted,
    Running,
    Stopping,
    Stopped,
    Completed,
    Failed,
    Disconnected,
}

impl PipelineStateValue {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Failed)
    }
}

impl TryFrom<i32> for PipelineStateValue {
    type Error = PsrpError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        let state = match value {
            0 => Self::NotStarted,
            1 => Self::Running,
            2 => Self::Stopping,
            3 => Self::Stopped,
            4 => Self::Completed,
            5 => Self::Failed,
            6 => Self::Disconnected,
            other => {
                return Err(PsrpError::Payload(format!(
                    "unknown PipelineState value: {other}"
                )));
            }
        };
        Ok(state)
    }
}

/// A PIPELINE_STATE message; `Failed` arrives with the terminating
/// exception's error record attached.
#[derive(Debug, Clone)]
pub struct PipelineStateMsg {
    pub state: PipelineStateValue,
    pub exception_message: Option<String>,
}

impl PipelineStateMsg {
    pub fn from_clixml(payload: &str) -> Result<Self, PsrpError> {
        let doc = clixml::parse_document(payload)?;
        let root = doc.root_element();

        let state = PipelineStateValue::try_from(clixml::named_i32(root, "PipelineState")?)?;
        let exception_message = clixml::find_named(root, "ExceptionAsErrorRecord")
            .and_then(|node| {
                node.descendants()
                    .find(|n| n.is_element() && n.has_tag_name("ToString"))
            })
            .and_then(|n| n.text().map(str::to_owned));

        Ok(Self {
            state,
            exception_message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_state_opened_parses() {
        let msg = PoolStateMsg::from_clixml(
            r#"<Obj RefId="0"><MS><I32 N="RunspaceState">2</I32></MS></Obj>"#,
        )
        .expect("parse");
        assert_eq!(msg.state, PoolStateValue::Opened);
        assert!(msg.error_message.is_none());
    }

    #[test]
    fn broken_pool_state_carries_error_text() {
        let msg = PoolStateMsg::from_clixml(
            r#"<Obj RefId="0"><MS><I32 N="RunspaceState">5</I32><Obj N="ExceptionAsErrorRecord" RefId="1"><ToString>access denied</ToString></Obj></MS></Obj>"#,
        )
        .expect("parse");
        assert_eq!(msg.state, PoolStateValue::Broken);
        assert_eq!(msg.error_message.as_deref(), Some("access denied"));
    }

    #[test]
    fn pipeline_state_failed_with_exception() {
        let msg = PipelineStateMsg::from_clixml(
            r#"<Obj RefId="0"><MS><I32 N="PipelineState">5</I32><Obj N="ExceptionAsErrorRecord" RefId="1"><ToString>boom</ToString></Obj></MS></Obj>"#,
        )
        .expect("parse");
        assert_eq!(msg.state, PipelineStateValue::Failed);
        assert!(msg.state.is_terminal());
        assert_eq!(msg.exception_message.as_deref(), Some("boom"));
    }

    #[test]
    fn unknown_state_value_is_an_error() {
        let err = PipelineStateMsg::from_clixml(
            r#"<Obj RefId="0"><MS><I32 N="PipelineState">42</I32></MS></Obj>"#,
        )
        .unwrap_err();
        assert!(matches!(err, PsrpError::Payload(_)));
    }
}
