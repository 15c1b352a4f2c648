use roxmltree::Node;

use crate::clixml;
use crate::PsrpError;

/// Extract the display text of a stream payload: a bare `<S>` primitive, or
/// the `<ToString>` projection of a complex object, or for WARNING/VERBOSE/
/// DEBUG records the `Message` property.
pub fn stream_text(payload: &str) -> Result<String, PsrpError> {
    let doc = clixml::parse_document(payload)?;
    let root = doc.root_element();

    if root.has_tag_name("S") {
        return Ok(root.text().unwrap_or_default().to_owned());
    }

    if let Some(text) = first_tag_text(root, "ToString") {
        return Ok(text);
    }
    if let Some(text) = clixml::named_text(root, "Message") {
        return Ok(text);
    }
    // Nothing presentable; fall back to any text node at all.
    Ok(root
        .descendants()
        .find_map(|n| n.text().map(str::trim).filter(|t| !t.is_empty()))
        .unwrap_or_default()
        .to_owned())
}

fn first_tag_text(node: Node<'_, '_>, tag: &str) -> Option<String> {
    node.descendants()
        .find(|n| n.is_element() && n.has_tag_name(tag))
        .and_then(|n| n.text().map(str::to_owned))
}

/// The fields of an ERROR_RECORD a caller can act on; the raw CLIXML is kept
/// for anything deeper.
#[derive(Debug, Clone)]
pub struct ErrorRecordMsg {
    pub message: String,
    pub fully_qualified_error_id: Option<String>,
    pub category_message: Option<String>,
    pub raw: String,
}

impl ErrorRecordMsg {
    pub fn from_clixml(payload: &str) -> Result<Self, PsrpError> {
        let doc = clixml::parse_document(payload)?;
        let root = doc.root_element();

        let message = first_tag_text(root, "ToString")
            .or_else(|| clixml::named_text(root, "Exception_Message"))
            .or_else(|| clixml::named_text(root, "Message"))
            .unwrap_or_default();

        Ok(Self {
            message,
            fully_qualified_error_id: clixml::named_text(root, "FullyQualifiedErrorId"),
            category_message: clixml::named_text(root, "ErrorCategory_Message"),
            raw: payload.to_owned(),
        })
    }
}

/// PROGRESS_RECORD: activity description plus completion percentage.
#[derive(Debug, Clone)]
pub struct ProgressRecordMsg {
    pub activity: String,
    pub status_description: Option<String>,
    pub percent_complete: Option<i32>,
}

impl ProgressRecordMsg {
    pub fn from_clixml(payload: &str) -> Result<Self, PsrpError> {
        let doc = clixml::parse_document(payload)?;
        let root = doc.root_element();

        Ok(Self {
            activity: clixml::named_text(root, "Activity").unwrap_or_default(),
            status_description: clixml::named_text(root, "StatusDescription"),
            percent_complete: clixml::named_text(root, "PercentComplete")
                .and_then(|t| t.trim().parse().ok()),
        })
    }
}

/// INFORMATION_RECORD: the message data plus its source.
#[derive(Debug, Clone)]
pub struct InformationRecordMsg {
    pub message: String,
    pub source: Option<String>,
}

impl InformationRecordMsg {
    pub fn from_clixml(payload: &str) -> Result<Self, PsrpError> {
        let doc = clixml::parse_document(payload)?;
        let root = doc.root_element();

        let message = clixml::find_named(root, "MessageData")
            .and_then(|n| {
                n.descendants()
                    .find_map(|d| d.text().map(str::trim).filter(|t| !t.is_empty()))
                    .map(str::to_owned)
            })
            .or_else(|| first_tag_text(root, "ToString"))
            .unwrap_or_default();

        Ok(Self {
            message,
            source: clixml::named_text(root, "Source"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_string_output_extracts() {
        assert_eq!(stream_text("<S>hello world</S>").unwrap(), "hello world");
    }

    #[test]
    fn object_output_uses_to_string() {
        let xml = r#"<Obj RefId="0"><TN RefId="0"><T>System.IO.FileInfo</T></TN><ToString>file.txt</ToString></Obj>"#;
        assert_eq!(stream_text(xml).unwrap(), "file.txt");
    }

    #[test]
    fn warning_record_uses_message_property() {
        let xml = r#"<Obj RefId="0"><MS><S N="Message">careful now</S></MS></Obj>"#;
        assert_eq!(stream_text(xml).unwrap(), "careful now");
    }

    #[test]
    fn error_record_extracts_identity_fields() {
        let xml = concat!(
            r#"<Obj RefId="0"><ToString>The term 'nope' is not recognized</ToString><MS>"#,
            r#"<S N="FullyQualifiedErrorId">CommandNotFoundException</S>"#,
            r#"<S N="ErrorCategory_Message">ObjectNotFound: (nope:String)</S>"#,
            r#"</MS></Obj>"#,
        );
        let record = ErrorRecordMsg::from_clixml(xml).expect("parse");
        assert!(record.message.contains("not recognized"));
        assert_eq!(
            record.fully_qualified_error_id.as_deref(),
            Some("CommandNotFoundException")
        );
        assert!(record.raw.contains("FullyQualifiedErrorId"));
    }

    #[test]
    fn progress_record_parses_percentage() {
        let xml = concat!(
            r#"<Obj RefId="0"><MS><S N="Activity">Copying</S>"#,
            r#"<S N="StatusDescription">half way</S><I32 N="PercentComplete">50</I32></MS></Obj>"#,
        );
        let record = ProgressRecordMsg::from_clixml(xml).expect("parse");
        assert_eq!(record.activity, "Copying");
        assert_eq!(record.percent_complete, Some(50));
    }

    #[test]
    fn information_record_prefers_message_data() {
        let xml = concat!(
            r#"<Obj RefId="0"><MS><Obj N="MessageData" RefId="1"><S>info text</S></Obj>"#,
            r#"<S N="Source">Write-Information</S></MS></Obj>"#,
        );
        let record = InformationRecordMsg::from_clixml(xml).expect("parse");
        assert_eq!(record.message, "info text");
        assert_eq!(record.source.as_deref(), Some("Write-Information"));
    }
}
