use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use uuid::Uuid;

use crate::PsrpError;

/// Routing direction of a PSRP message (MS-PSRP 2.2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Client,
    Server,
}

impl Destination {
    pub fn value(self) -> u32 {
        match self {
            Self::Client => 0x0000_0001,
            Self::Server => 0x0000_0002,
        }
    }
}

impl TryFrom<u32> for Destination {
    type Error = PsrpError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x0000_0001 => Ok(Self::Client),
            0x0000_0002 => Ok(Self::Server),
            other => Err(PsrpError::InvalidMessage(format!(
                "unknown destination: 0x{other:08x}"
            ))),
        }
    }
}

/// Full MS-PSRP message type registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    SessionCapability,
    InitRunspacePool,
    PublicKey,
    EncryptedSessionKey,
    PublicKeyRequest,
    ConnectRunspacePool,
    RunspacePoolInitData,
    ResetRunspaceState,
    SetMaxRunspaces,
    SetMinRunspaces,
    RunspaceAvailability,
    RunspacePoolState,
    CreatePipeline,
    GetAvailableRunspaces,
    UserEvent,
    ApplicationPrivateData,
    GetCommandMetadata,
    RunspacePoolHostCall,
    RunspacePoolHostResponse,
    PipelineInput,
    EndOfPipelineInput,
    PipelineOutput,
    ErrorRecord,
    PipelineState,
    DebugRecord,
    VerboseRecord,
    WarningRecord,
    ProgressRecord,
    InformationRecord,
    PipelineHostCall,
    PipelineHostResponse,
}

impl MessageType {
    pub fn value(self) -> u32 {
        match self {
            Self::SessionCapability => 0x0001_0002,
            Self::InitRunspacePool => 0x0001_0004,
            Self::PublicKey => 0x0001_0005,
            Self::EncryptedSessionKey => 0x0001_0006,
            Self::PublicKeyRequest => 0x0001_0007,
            Self::ConnectRunspacePool => 0x0001_0008,
            Self::RunspacePoolInitData => 0x0002_100B,
            Self::ResetRunspaceState => 0x0002_100C,
            Self::SetMaxRunspaces => 0x0002_1002,
            Self::SetMinRunspaces => 0x0002_1003,
            Self::RunspaceAvailability => 0x0002_1004,
            Self::RunspacePoolState => 0x0002_1005,
            Self::CreatePipeline => 0x0002_1006,
            Self::GetAvailableRunspaces => 0x0002_1007,
            Self::UserEvent => 0x0002_1008,
            Self::ApplicationPrivateData => 0x0002_1009,
            Self::GetCommandMetadata => 0x0002_100A,
            Self::RunspacePoolHostCall => 0x0002_1100,
            Self::RunspacePoolHostResponse => 0x0002_1101,
            Self::PipelineInput => 0x0004_1002,
            Self::EndOfPipelineInput => 0x0004_1003,
            Self::PipelineOutput => 0x0004_1004,
            Self::ErrorRecord => 0x0004_1005,
            Self::PipelineState => 0x0004_1006,
            Self::DebugRecord => 0x0004_1007,
            Self::VerboseRecord => 0x0004_1008,
            Self::WarningRecord => 0x0004_1009,
            Self::ProgressRecord => 0x0004_1010,
            Self::InformationRecord => 0x0004_1011,
            Self::PipelineHostCall => 0x0004_1100,
            Self::PipelineHostResponse => 0x0004_1101,
        }
    }

    /// Message types addressed to a pipeline rather than the pool.
    pub fn is_pipeline_scoped(self) -> bool {
        matches!(
            self,
            Self::CreatePipeline
                | Self::PipelineInput
                | Self::EndOfPipelineInput
                | Self::PipelineOutput
                | Self::ErrorRecord
                | Self::PipelineState
                | Self::DebugRecord
                | Self::VerboseRecord
                | Self::WarningRecord
                | Self::ProgressRecord
                | Self::InformationRecord
                | Self::PipelineHostCall
                | Self::PipelineHostResponse
        )
    }
}

impl TryFrom<u32> for MessageType {
    type Error = PsrpError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        let message_type = match value {
            0x0001_0002 => Self::SessionCapability,
            0x0001_0004 => Self::InitRunspacePool,
            0x0001_0005 => Self::PublicKey,
            0x0001_0006 => Self::EncryptedSessionKey,
            0x0001_0007 => Self::PublicKeyRequest,
            0x0001_0008 => Self::ConnectRunspacePool,
            0x0002_100B => Self::RunspacePoolInitData,
            0x0002_100C => Self::ResetRunspaceState,
            0x0002_1002 => Self::SetMaxRunspaces,
            0x0002_1003 => Self::SetMinRunspaces,
            0x0002_1004 => Self::RunspaceAvailability,
            0x0002_1005 => Self::RunspacePoolState,
            0x0002_1006 => Self::CreatePipeline,
            0x0002_1007 => Self::GetAvailableRunspaces,
            0x0002_1008 => Self::UserEvent,
            0x0002_1009 => Self::ApplicationPrivateData,
            0x0002_100A => Self::GetCommandMetadata,
            0x0002_1100 => Self::RunspacePoolHostCall,
            0x0002_1101 => Self::RunspacePoolHostResponse,
            0x0004_1002 => Self::PipelineInput,
            0x0004_1003 => Self::EndOfPipelineInput,
            0x0004_1004 => Self::PipelineOutput,
            0x0004_1005 => Self::ErrorRecord,
            0x0004_1006 => Self::PipelineState,
            0x0004_1007 => Self::DebugRecord,
            0x0004_1008 => Self::VerboseRecord,
            0x0004_1009 => Self::WarningRecord,
            0x0004_1010 => Self::ProgressRecord,
            0x0004_1011 => Self::InformationRecord,
            0x0004_1100 => Self::PipelineHostCall,
            0x0004_1101 => Self::PipelineHostResponse,
            other => return Err(PsrpError::UnknownMessageType(other)),
        };
        Ok(message_type)
    }
}

/// One PSRP message: a 40-byte header followed by the (opaque) CLIXML data.
///
/// RPID and PID are encoded as Windows GUIDs, i.e. the first three fields
/// little-endian. A nil PID marks a pool-scoped message.
#[derive(Debug, Clone)]
pub struct PsrpMessage {
    pub destination: Destination,
    pub message_type: MessageType,
    pub rpid: Uuid,
    pub pid: Option<Uuid>,
    pub data: Vec<u8>,
}

impl PsrpMessage {
    pub const HEADER_LEN: usize = 40;

    pub fn new(
        destination: Destination,
        message_type: MessageType,
        rpid: Uuid,
        pid: Option<Uuid>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            destination,
            message_type,
            rpid,
            pid,
            data,
        }
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(Self::HEADER_LEN + self.data.len());

        // Infallible: Vec writes cannot fail.
        let _ = buffer.write_u32::<LittleEndian>(self.destination.value());
        let _ = buffer.write_u32::<LittleEndian>(self.message_type.value());
        buffer.extend_from_slice(&self.rpid.to_bytes_le());
        buffer.extend_from_slice(&self.pid.unwrap_or(Uuid::nil()).to_bytes_le());
        buffer.extend_from_slice(&self.data);

        buffer
    }

    pub fn parse(data: &[u8]) -> Result<Self, PsrpError> {
        if data.len() < Self::HEADER_LEN {
            return Err(PsrpError::InvalidMessage(format!(
                "message too short: {} bytes, need at least {}",
                data.len(),
                Self::HEADER_LEN
            )));
        }

        let mut cursor = Cursor::new(data);
        let destination = Destination::try_from(cursor.read_u32::<LittleEndian>()?)?;
        let message_type = MessageType::try_from(cursor.read_u32::<LittleEndian>()?)?;

        let mut rpid = [0u8; 16];
        cursor.read_exact(&mut rpid)?;
        let mut pid = [0u8; 16];
        cursor.read_exact(&mut pid)?;

        let pid = Uuid::from_bytes_le(pid);

        Ok(Self {
            destination,
            message_type,
            rpid: Uuid::from_bytes_le(rpid),
            pid: if pid.is_nil() { None } else { Some(pid) },
            data: data[Self::HEADER_LEN..].to_vec(),
        })
    }

    /// The message data as UTF-8, skipping a BOM if the server sent one.
    pub fn data_as_str(&self) -> Result<&str, PsrpError> {
        let data = self
            .data
            .strip_prefix(&[0xEF, 0xBB, 0xBF])
            .unwrap_or(&self.data);
        std::str::from_utf8(data)
            .map_err(|e| PsrpError::InvalidMessage(format!("payload is not UTF-8: {e}")))
    }
}
