use ferrosh_psrp::{HostCallMsg, HostResponse};
use tracing::debug;

/// Answers server-initiated host calls. This client hosts no interactive
/// UI, so the default policy returns null results for every method that
/// demands an answer and swallows void notifications.
pub trait HostHandler: Send {
    fn handle(&mut self, call: &HostCallMsg) -> Option<HostResponse>;
}

/// The default host: null for everything.
#[derive(Debug, Default)]
pub struct NullHost;

impl HostHandler for NullHost {
    fn handle(&mut self, call: &HostCallMsg) -> Option<HostResponse> {
        debug!(
            call_id = call.call_id,
            method = %call.method_name,
            expects_response = call.expects_response(),
            "host call received"
        );
        call.expects_response().then(|| HostResponse::null_for(call))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demanding_methods_get_a_null_answer() {
        let call = HostCallMsg {
            call_id: 7,
            method_id: 11, // ReadLine
            method_name: "ReadLine".into(),
        };
        let response = NullHost.handle(&call).expect("response");
        assert_eq!(response.call_id, 7);
        assert!(response.to_clixml().contains(r#"<Nil N="mr" />"#));
    }

    #[test]
    fn void_notifications_are_swallowed() {
        let call = HostCallMsg {
            call_id: 8,
            method_id: 2, // SetShouldExit
            method_name: "SetShouldExit".into(),
        };
        assert!(NullHost.handle(&call).is_none());
    }
}
