use std::fmt;

use roxmltree::Node;

/// WSMAN fault code for an expired OperationTimeout — the one fault the
/// receive loop treats as benign.
pub const WSMAN_FAULT_OPERATION_TIMEOUT: u64 = 2_150_858_793;

/// A parsed `<s:Fault>`: SOAP code/subcode/reason plus the WSMAN-specific
/// fault code and detail message when present.
#[derive(Debug, Clone)]
pub struct WsmanFault {
    pub code: Option<String>,
    pub subcode: Option<String>,
    pub reason: Option<String>,
    pub wsman_fault_code: Option<u64>,
    pub detail: Option<String>,
}

impl WsmanFault {
    /// An OperationTimeout fault means "nothing to deliver yet"; the caller
    /// re-issues the Receive instead of failing the pool.
    pub fn is_operation_timeout(&self) -> bool {
        self.wsman_fault_code == Some(WSMAN_FAULT_OPERATION_TIMEOUT)
            || self
                .subcode
                .as_deref()
                .is_some_and(|s| s.ends_with("TimedOut"))
    }

    /// The shell no longer exists server-side (deleted or idle-expired).
    pub fn is_shell_gone(&self) -> bool {
        self.subcode
            .as_deref()
            .is_some_and(|s| s.ends_with("InvalidSelectors"))
            || self
                .detail
                .as_deref()
                .is_some_and(|d| d.contains("cannot find the shell"))
    }

    pub(crate) fn from_fault_node(fault: Node<'_, '_>) -> Self {
        let mut code = None;
        let mut subcode = None;
        let mut reason = None;
        let mut wsman_fault_code = None;
        let mut detail = None;

        for node in fault.descendants().filter(Node::is_element) {
            match node.tag_name().name() {
                "Value" => {
                    let text = node.text().map(str::trim).unwrap_or_default().to_owned();
                    let in_subcode = node
                        .ancestors()
                        .any(|a| a.tag_name().name() == "Subcode");
                    if in_subcode {
                        subcode.get_or_insert(text);
                    } else {
                        code.get_or_insert(text);
                    }
                }
                "Text" => {
                    reason.get_or_insert_with(|| {
                        node.text().map(str::trim).unwrap_or_default().to_owned()
                    });
                }
                "WSManFault" => {
                    wsman_fault_code = node
                        .attribute("Code")
                        .and_then(|c| c.trim().parse::<u64>().ok());
                }
                "Message" => {
                    // Nested provider faults repeat Message; keep the first.
                    if detail.is_none() {
                        detail = node
                            .text()
                            .map(str::trim)
                            .filter(|t| !t.is_empty())
                            .map(str::to_owned);
                    }
                }
                _ => {}
            }
        }

        Self {
            code,
            subcode,
            reason,
            wsman_fault_code,
            detail,
        }
    }
}

impl fmt::Display for WsmanFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "code={} subcode={}",
            self.code.as_deref().unwrap_or("-"),
            self.subcode.as_deref().unwrap_or("-"),
        )?;
        if let Some(code) = self.wsman_fault_code {
            write!(f, " wsmanfault=0x{code:08x}")?;
        }
        if let Some(reason) = &self.reason {
            write!(f, " reason={reason}")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, " detail={detail}")?;
        }
        Ok(())
    }
}
