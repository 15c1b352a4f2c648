use uuid::Uuid;

use crate::clixml::{self, RefIds};
use crate::{Destination, MessageType, PsrpError, PsrpMessage};

/// An inbound PIPELINE_HOST_CALL / RUNSPACEPOOL_HOST_CALL: the call id the
/// response must echo, plus the remote host method being invoked.
#[derive(Debug, Clone)]
pub struct HostCallMsg {
    pub call_id: i64,
    pub method_id: i32,
    pub method_name: String,
}

impl HostCallMsg {
    pub fn from_clixml(payload: &str) -> Result<Self, PsrpError> {
        let doc = clixml::parse_document(payload)?;
        let root = doc.root_element();

        let call_id = clixml::named_i64(root, "ci")?;

        let mi = clixml::find_named(root, "mi")
            .ok_or_else(|| PsrpError::Payload("host call missing method identifier".into()))?;
        let method_name = mi
            .descendants()
            .find(|n| n.is_element() && n.has_tag_name("ToString"))
            .and_then(|n| n.text())
            .unwrap_or_default()
            .to_owned();
        let method_id = mi
            .descendants()
            .find(|n| n.is_element() && n.has_tag_name("I32"))
            .and_then(|n| n.text())
            .and_then(|t| t.trim().parse().ok())
            .ok_or_else(|| PsrpError::Payload("host call missing method id".into()))?;

        Ok(Self {
            call_id,
            method_id,
            method_name,
        })
    }

    /// Methods whose absence of a real host makes a null answer safe; void
    /// methods get no response at all.
    pub fn expects_response(&self) -> bool {
        // MS-PSRP: method ids below 11 are void host notifications
        // (SetShouldExit, EnterNestedPrompt, progress/verbose writes, ...).
        self.method_id >= 11
    }
}

/// The null answer this client gives to any host call that demands a
/// response: the call id, the method identity, and a nil return value.
#[derive(Debug, Clone)]
pub struct HostResponse {
    pub call_id: i64,
    pub method_id: i32,
    pub method_name: String,
}

impl HostResponse {
    pub fn null_for(call: &HostCallMsg) -> Self {
        Self {
            call_id: call.call_id,
            method_id: call.method_id,
            method_name: call.method_name.clone(),
        }
    }

    pub fn to_clixml(&self) -> String {
        let mut ref_ids = RefIds::default();
        let _root = ref_ids.next();
        let mi = clixml::enum_object(
            "mi",
            "System.Management.Automation.Remoting.RemoteHostMethodId",
            &self.method_name,
            self.method_id,
            &mut ref_ids,
        );
        format!(
            r#"<Obj RefId="0"><MS><Nil N="mr" />{mi}<I64 N="ci">{ci}</I64></MS></Obj>"#,
            ci = self.call_id,
        )
    }

    pub fn to_pipeline_message(&self, rpid: Uuid, pid: Uuid) -> PsrpMessage {
        PsrpMessage::new(
            Destination::Server,
            MessageType::PipelineHostResponse,
            rpid,
            Some(pid),
            self.to_clixml().into_bytes(),
        )
    }

    pub fn to_pool_message(&self, rpid: Uuid) -> PsrpMessage {
        PsrpMessage::new(
            Destination::Server,
            MessageType::RunspacePoolHostResponse,
            rpid,
            None,
            self.to_clixml().into_bytes(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const READ_LINE_CALL: &str = concat!(
        r#"<Obj RefId="0"><MS><I64 N="ci">1</I64>"#,
        r#"<Obj N="mi" RefId="1"><TN RefId="0">"#,
        r#"<T>System.Management.Automation.Remoting.RemoteHostMethodId</T>"#,
        r#"<T>System.Enum</T><T>System.ValueType</T><T>System.Object</T></TN>"#,
        r#"<ToString>ReadLine</ToString><I32>11</I32></Obj>"#,
        r#"<Obj N="mp" RefId="2"><LST /></Obj></MS></Obj>"#,
    );

    #[test]
    fn host_call_fields_parse() {
        let call = HostCallMsg::from_clixml(READ_LINE_CALL).expect("parse");
        assert_eq!(call.call_id, 1);
        assert_eq!(call.method_id, 11);
        assert_eq!(call.method_name, "ReadLine");
        assert!(call.expects_response());
    }

    #[test]
    fn void_methods_do_not_expect_a_response() {
        let call = HostCallMsg {
            call_id: 2,
            method_id: 5, // WriteErrorLine, a void notification
            method_name: "WriteErrorLine".into(),
        };
        assert!(!call.expects_response());
    }

    #[test]
    fn null_response_round_trips_identity() {
        let call = HostCallMsg::from_clixml(READ_LINE_CALL).expect("parse");
        let response = HostResponse::null_for(&call);
        let xml = response.to_clixml();

        assert!(xml.contains(r#"<Nil N="mr" />"#));
        assert!(xml.contains(r#"<I64 N="ci">1</I64>"#));
        assert!(xml.contains("<ToString>ReadLine</ToString>"));
        roxmltree::Document::parse(&xml).expect("well-formed");
    }
}
