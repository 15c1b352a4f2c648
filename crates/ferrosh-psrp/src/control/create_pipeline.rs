use uuid::Uuid;

use crate::clixml::{self, RefIds};
use crate::{Destination, MessageType, PsrpMessage};

/// A value passed to a command parameter. Only the primitive shapes a remote
/// invocation realistically needs; anything richer belongs in the script
/// text itself.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    String(String),
    Bool(bool),
    Int(i32),
    /// A switch parameter present without an argument.
    Switch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandParameter {
    /// `None` for positional arguments.
    pub name: Option<String>,
    pub value: ParameterValue,
}

impl CommandParameter {
    pub fn named(name: impl Into<String>, value: ParameterValue) -> Self {
        Self {
            name: Some(name.into()),
            value,
        }
    }

    pub fn positional(value: ParameterValue) -> Self {
        Self { name: None, value }
    }

    pub fn switch(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            value: ParameterValue::Switch,
        }
    }

    fn to_clixml(&self, ref_ids: &mut RefIds) -> String {
        let name = match &self.name {
            Some(n) => format!("<S N=\"N\">{}</S>", clixml::escape(n)),
            None => "<Nil N=\"N\" />".to_owned(),
        };
        let value = match &self.value {
            ParameterValue::String(s) => format!("<S N=\"V\">{}</S>", clixml::escape(s)),
            ParameterValue::Bool(b) => format!("<B N=\"V\">{b}</B>"),
            ParameterValue::Int(i) => format!("<I32 N=\"V\">{i}</I32>"),
            ParameterValue::Switch => "<B N=\"V\">true</B>".to_owned(),
        };
        format!(
            r#"<Obj RefId="{id}"><MS>{name}{value}</MS></Obj>"#,
            id = ref_ids.next(),
        )
    }
}

/// One element of the command pipeline inside CREATE_PIPELINE.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineCommand {
    pub command_text: String,
    pub is_script: bool,
    pub use_local_scope: Option<bool>,
    pub parameters: Vec<CommandParameter>,
}

impl PipelineCommand {
    pub fn script(text: impl Into<String>) -> Self {
        Self {
            command_text: text.into(),
            is_script: true,
            use_local_scope: None,
            parameters: Vec::new(),
        }
    }

    pub fn command(name: impl Into<String>) -> Self {
        Self {
            command_text: name.into(),
            is_script: false,
            use_local_scope: None,
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, parameter: CommandParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// `Out-String -Stream`, appended so every output object arrives as a
    /// plain string line.
    pub fn out_string_stream() -> Self {
        Self::command("Out-String").with_parameter(CommandParameter::switch("Stream"))
    }

    fn to_clixml(&self, ref_ids: &mut RefIds) -> String {
        let merge = |name: &str, ref_ids: &mut RefIds| {
            clixml::enum_object(
                name,
                "System.Management.Automation.Runspaces.PipelineResultTypes",
                "None",
                0,
                ref_ids,
            )
        };

        let args = if self.parameters.is_empty() {
            format!(
                r#"<Obj N="Args" RefId="{id}"><TNRef RefId="0" /><LST /></Obj>"#,
                id = ref_ids.next()
            )
        } else {
            let items: String = self
                .parameters
                .iter()
                .map(|p| p.to_clixml(ref_ids))
                .collect();
            format!(
                r#"<Obj N="Args" RefId="{id}"><TNRef RefId="0" /><LST>{items}</LST></Obj>"#,
                id = ref_ids.next()
            )
        };

        let local_scope = match self.use_local_scope {
            Some(value) => format!("<B N=\"UseLocalScope\">{value}</B>"),
            None => "<Nil N=\"UseLocalScope\" />".to_owned(),
        };

        format!(
            r#"<Obj RefId="{id}"><MS><S N="Cmd">{cmd}</S><B N="IsScript">{is_script}</B>{local_scope}{merge_my}{merge_to}{merge_previous}{merge_error}{args}</MS></Obj>"#,
            id = ref_ids.next(),
            cmd = clixml::escape(&self.command_text),
            is_script = self.is_script,
            merge_my = merge("MergeMyResult", ref_ids),
            merge_to = merge("MergeToResult", ref_ids),
            merge_previous = merge("MergePreviousResults", ref_ids),
            merge_error = merge("MergeError", ref_ids),
        )
    }
}

/// The CREATE_PIPELINE message body: a PowerShell object plus invocation
/// settings.
#[derive(Debug, Clone, typed_builder::TypedBuilder)]
pub struct PipelineInvocation {
    pub commands: Vec<PipelineCommand>,
    #[builder(default = true)]
    pub no_input: bool,
    #[builder(default = true)]
    pub add_to_history: bool,
    #[builder(default = false)]
    pub is_nested: bool,
    /// RemoteStreamOptions: 15 = add invocation info to all records.
    #[builder(default = 15)]
    pub remote_stream_options: i32,
}

impl PipelineInvocation {
    pub fn for_script(script: impl Into<String>) -> Self {
        Self::builder()
            .commands(vec![
                PipelineCommand::script(script),
                PipelineCommand::out_string_stream(),
            ])
            .build()
    }

    pub fn to_clixml(&self) -> String {
        let mut ref_ids = RefIds::default();
        let _root = ref_ids.next();

        let cmds: String = self
            .commands
            .iter()
            .map(|c| c.to_clixml(&mut ref_ids))
            .collect();

        let cmds_list = format!(
            r#"<Obj N="Cmds" RefId="{id}"><TN RefId="0"><T>System.Collections.Generic.List`1[[System.Management.Automation.PSObject, System.Management.Automation, Version=1.0.0.0, Culture=neutral, PublicKeyToken=31bf3856ad364e35]]</T><T>System.Object</T></TN><LST>{cmds}</LST></Obj>"#,
            id = ref_ids.next(),
        );

        let powershell = format!(
            r#"<Obj N="PowerShell" RefId="{id}"><MS>{cmds_list}<B N="IsNested">{is_nested}</B><Nil N="History" /><B N="RedirectShellErrorOutputPipe">true</B></MS></Obj>"#,
            id = ref_ids.next(),
            is_nested = self.is_nested,
        );

        let apartment_state = clixml::enum_object(
            "ApartmentState",
            "System.Threading.ApartmentState",
            "Unknown",
            2,
            &mut ref_ids,
        );
        let stream_options = clixml::enum_object(
            "RemoteStreamOptions",
            "System.Management.Automation.RemoteStreamOptions",
            "AddInvocationInfo",
            self.remote_stream_options,
            &mut ref_ids,
        );
        let host_info = clixml::null_host_info("HostInfo", &mut ref_ids);

        format!(
            r#"<Obj RefId="0"><MS><B N="NoInput">{no_input}</B>{apartment_state}{stream_options}<B N="AddToHistory">{add_to_history}</B>{host_info}{powershell}<B N="IsNested">{is_nested}</B></MS></Obj>"#,
            no_input = self.no_input,
            add_to_history = self.add_to_history,
            is_nested = self.is_nested,
        )
    }

    pub fn to_message(&self, rpid: Uuid, pid: Uuid) -> PsrpMessage {
        PsrpMessage::new(
            Destination::Server,
            MessageType::CreatePipeline,
            rpid,
            Some(pid),
            self.to_clixml().into_bytes(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_invocation_renders_well_formed_clixml() {
        let invocation = PipelineInvocation::for_script("Write-Output 'hi'");
        let xml = invocation.to_clixml();

        let doc = roxmltree::Document::parse(&xml).expect("well-formed");
        assert_eq!(
            clixml::named_text(doc.root_element(), "Cmd").as_deref(),
            Some("Write-Output 'hi'")
        );
        assert!(xml.contains(r#"<B N="NoInput">true</B>"#));
        assert!(xml.contains(r#"<S N="Cmd">Out-String</S>"#));
    }

    #[test]
    fn named_and_positional_parameters_render() {
        let command = PipelineCommand::command("Get-Item")
            .with_parameter(CommandParameter::named(
                "Path",
                ParameterValue::String("C:\\temp".into()),
            ))
            .with_parameter(CommandParameter::positional(ParameterValue::Int(3)));
        let invocation = PipelineInvocation::builder().commands(vec![command]).build();
        let xml = invocation.to_clixml();

        assert!(xml.contains(r#"<S N="N">Path</S>"#));
        assert!(xml.contains(r#"<S N="V">C:\temp</S>"#));
        assert!(xml.contains(r#"<Nil N="N" />"#));
        assert!(xml.contains(r#"<I32 N="V">3</I32>"#));
        roxmltree::Document::parse(&xml).expect("well-formed");
    }

    #[test]
    fn script_text_is_escaped() {
        let invocation = PipelineInvocation::for_script(r#"Write-Output "<&>""#);
        let xml = invocation.to_clixml();
        assert!(xml.contains("&lt;&amp;&gt;"));
        roxmltree::Document::parse(&xml).expect("well-formed");
    }

    #[test]
    fn message_is_pipeline_scoped() {
        let rpid = Uuid::new_v4();
        let pid = Uuid::new_v4();
        let message = PipelineInvocation::for_script("1").to_message(rpid, pid);
        assert_eq!(message.message_type, MessageType::CreatePipeline);
        assert_eq!(message.pid, Some(pid));
    }
}
