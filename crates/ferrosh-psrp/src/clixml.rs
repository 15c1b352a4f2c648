//! Small helpers shared by the control-payload builders and readers.
//!
//! Builders emit CLIXML as literal templates (the server ignores RefId
//! reference semantics for these messages, but ids are still kept unique).
//! Readers walk `roxmltree` documents and only extract the fields the pool
//! state machine needs.

use roxmltree::{Document, Node};

use crate::PsrpError;

/// Escape a string for use as XML text or attribute content.
pub(crate) fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Monotonic RefId source for one payload.
#[derive(Debug, Default)]
pub(crate) struct RefIds {
    next: u32,
}

impl RefIds {
    pub(crate) fn next(&mut self) -> u32 {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Find the first descendant element carrying `N="name"`.
pub(crate) fn find_named<'a, 'input>(
    node: Node<'a, 'input>,
    name: &str,
) -> Option<Node<'a, 'input>> {
    node.descendants()
        .find(|n| n.is_element() && n.attribute("N") == Some(name))
}

/// Text content of the first descendant element carrying `N="name"`.
pub(crate) fn named_text(node: Node<'_, '_>, name: &str) -> Option<String> {
    find_named(node, name).and_then(|n| n.text().map(str::to_owned))
}

/// Parse the `<I32 N="name">` style integer a reader expects to be present.
pub(crate) fn named_i32(node: Node<'_, '_>, name: &str) -> Result<i32, PsrpError> {
    let text = named_text(node, name)
        .ok_or_else(|| PsrpError::Payload(format!("missing element N=\"{name}\"")))?;
    text.trim()
        .parse()
        .map_err(|e| PsrpError::Payload(format!("bad integer for N=\"{name}\": {e}")))
}

pub(crate) fn named_i64(node: Node<'_, '_>, name: &str) -> Result<i64, PsrpError> {
    let text = named_text(node, name)
        .ok_or_else(|| PsrpError::Payload(format!("missing element N=\"{name}\"")))?;
    text.trim()
        .parse()
        .map_err(|e| PsrpError::Payload(format!("bad integer for N=\"{name}\": {e}")))
}

pub(crate) fn parse_document(payload: &str) -> Result<Document<'_>, PsrpError> {
    Document::parse(payload).map_err(PsrpError::Xml)
}

/// The CLIXML `HostInfo` block for a client with no interactive host.
/// All four null flags set; the server falls back to its own defaults.
pub(crate) fn null_host_info(name: &str, ref_ids: &mut RefIds) -> String {
    format!(
        r#"<Obj N="{name}" RefId="{id}"><MS><B N="_isHostNull">true</B><B N="_isHostUINull">true</B><B N="_isHostRawUINull">true</B><B N="_useRunspaceHost">true</B></MS></Obj>"#,
        name = name,
        id = ref_ids.next()
    )
}

/// An enum-shaped CLIXML object (`<TN>` chain + ToString + I32 value).
pub(crate) fn enum_object(
    name: &str,
    type_name: &str,
    to_string: &str,
    value: i32,
    ref_ids: &mut RefIds,
) -> String {
    format!(
        r#"<Obj N="{name}" RefId="{id}"><TN RefId="{tn}"><T>{type_name}</T><T>System.Enum</T><T>System.ValueType</T><T>System.Object</T></TN><ToString>{to_string}</ToString><I32>{value}</I32></Obj>"#,
        id = ref_ids.next(),
        tn = ref_ids.next(),
    )
}
