//! CAN frames and the NMT/heartbeat messages built on them
use core::str::FromStr;

use snafu::Snafu;

/// A CAN arbitration identifier
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CanId {
    /// A 29-bit extended identifier
    Extended(u32),
    /// An 11-bit standard identifier
    Std(u16),
}

impl CanId {
    /// Create an extended ID
    pub const fn extended(id: u32) -> CanId {
        CanId::Extended(id)
    }

    /// Create a standard ID
    pub const fn std(id: u16) -> CanId {
        CanId::Std(id)
    }

    /// Get the numeric value of the ID
    pub fn raw(&self) -> u32 {
        match self {
            CanId::Extended(id) => *id,
            CanId::Std(id) => *id as u32,
        }
    }

    /// Returns true if this is an extended ID
    pub fn is_extended(&self) -> bool {
        match self {
            CanId::Extended(_) => true,
            CanId::Std(_) => false,
        }
    }

    /// The 7-bit node ID portion of a standard CANopen identifier
    pub fn node_id(&self) -> u8 {
        (self.raw() & 0x7F) as u8
    }

    /// The function code portion (multiple of 0x80) of a standard CANopen identifier
    pub fn function_code(&self) -> u32 {
        self.raw() & 0x780
    }
}

impl core::fmt::Display for CanId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CanId::Extended(id) => write!(f, "{id:08X}x"),
            CanId::Std(id) => write!(f, "{id:03X}"),
        }
    }
}

/// The maximum number of payload bytes in a classic CAN frame
pub const MAX_DATA_LENGTH: usize = 8;

/// A classic CAN data frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanMessage {
    /// Payload buffer. Only the first `dlc` bytes are valid.
    pub data: [u8; MAX_DATA_LENGTH],
    /// Number of valid bytes in `data`
    pub dlc: u8,
    /// Arbitration ID
    pub id: CanId,
}

impl Default for CanMessage {
    fn default() -> Self {
        Self {
            data: [0; MAX_DATA_LENGTH],
            dlc: 0,
            id: CanId::Std(0),
        }
    }
}

impl CanMessage {
    /// Create a new message
    ///
    /// Payloads longer than 8 bytes are truncated to the first 8 bytes.
    pub fn new(id: CanId, data: &[u8]) -> Self {
        let dlc = data.len().min(MAX_DATA_LENGTH);
        let mut buf = [0u8; MAX_DATA_LENGTH];
        buf[0..dlc].copy_from_slice(&data[0..dlc]);

        Self {
            id,
            dlc: dlc as u8,
            data: buf,
        }
    }

    /// Get the arbitration ID
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Get the valid payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data[0..self.dlc as usize]
    }
}

/// ID used for NMT commands
pub const NMT_CMD_ID: CanId = CanId::Std(0);
/// Base ID for heartbeat messages (node ID is added)
pub const HEARTBEAT_ID: u16 = 0x700;
/// The default base ID for sending SDO requests (server node ID is added)
pub const SDO_REQ_BASE: u16 = 0x600;
/// The default base ID for sending SDO responses (server node ID is added)
pub const SDO_RESP_BASE: u16 = 0x580;

/// NMT command specifier, the first byte of an NMT command message
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommandSpecifier {
    /// Enter operational state
    Start = 1,
    /// Enter stopped state
    Stop = 2,
    /// Enter sleep state
    Sleep = 80,
    /// Enter standby state
    Standby = 96,
    /// Enter pre-operational state
    EnterPreOp = 128,
    /// Reset the application
    ResetApp = 129,
    /// Reset communications
    ResetComm = 130,
}

impl NmtCommandSpecifier {
    /// Parse a command specifier from its byte value
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            1 => Ok(Self::Start),
            2 => Ok(Self::Stop),
            80 => Ok(Self::Sleep),
            96 => Ok(Self::Standby),
            128 => Ok(Self::EnterPreOp),
            129 => Ok(Self::ResetApp),
            130 => Ok(Self::ResetComm),
            _ => Err(MessageError::InvalidField),
        }
    }

    /// The state a node is expected to report after executing this command
    ///
    /// Both reset commands lead back through initialisation.
    pub fn resulting_state(&self) -> NmtState {
        match self {
            Self::Start => NmtState::Operational,
            Self::Stop => NmtState::Stopped,
            Self::Sleep => NmtState::Sleep,
            Self::Standby => NmtState::Standby,
            Self::EnterPreOp => NmtState::PreOperational,
            Self::ResetApp | Self::ResetComm => NmtState::Initialising,
        }
    }
}

/// Error returned when parsing an unrecognized NMT command name
#[derive(Clone, Debug, PartialEq, Eq, Snafu)]
#[snafu(display("Invalid NMT command: '{command}'"))]
pub struct InvalidNmtCommandError {
    /// The string which failed to parse
    pub command: String,
}

impl FromStr for NmtCommandSpecifier {
    type Err = InvalidNmtCommandError;

    /// Parse one of the textual command names
    ///
    /// Accepted names are OPERATIONAL, STOPPED, SLEEP, STANDBY, PRE-OPERATIONAL, INITIALISING,
    /// RESET and RESET COMMUNICATION.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPERATIONAL" => Ok(Self::Start),
            "STOPPED" => Ok(Self::Stop),
            "SLEEP" => Ok(Self::Sleep),
            "STANDBY" => Ok(Self::Standby),
            "PRE-OPERATIONAL" => Ok(Self::EnterPreOp),
            "INITIALISING" | "RESET" => Ok(Self::ResetApp),
            "RESET COMMUNICATION" => Ok(Self::ResetComm),
            _ => InvalidNmtCommandSnafu { command: s }.fail(),
        }
    }
}

/// An NMT command addressed to one node, or to all nodes when `node` is 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmtCommand {
    /// The command
    pub cs: NmtCommandSpecifier,
    /// The addressed node
    pub node: u8,
}

impl TryFrom<CanMessage> for NmtCommand {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let payload = msg.data();
        if msg.id() != NMT_CMD_ID {
            Err(MessageError::UnexpectedId {
                cob_id: msg.id(),
                expected: NMT_CMD_ID,
            })
        } else if payload.len() >= 2 {
            let cs = NmtCommandSpecifier::from_byte(payload[0])?;
            let node = payload[1];
            Ok(NmtCommand { cs, node })
        } else {
            Err(MessageError::MessageTooShort)
        }
    }
}

impl From<NmtCommand> for CanMessage {
    fn from(cmd: NmtCommand) -> Self {
        CanMessage::new(NMT_CMD_ID, &[cmd.cs as u8, cmd.node])
    }
}

/// The NMT state of a node, as reported in its heartbeat
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtState {
    /// Bootup; reported once when a node finishes initialisation
    #[default]
    Initialising = 0,
    /// Stopped
    Stopped = 4,
    /// Operational
    Operational = 5,
    /// Sleep
    Sleep = 80,
    /// Standby
    Standby = 96,
    /// Pre-operational
    PreOperational = 127,
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            NmtState::Initialising => "INITIALISING",
            NmtState::Stopped => "STOPPED",
            NmtState::Operational => "OPERATIONAL",
            NmtState::Sleep => "SLEEP",
            NmtState::Standby => "STANDBY",
            NmtState::PreOperational => "PRE-OPERATIONAL",
        };
        write!(f, "{s}")
    }
}

/// Error returned when a byte is not a valid NMT state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidNmtStateError(pub u8);

impl TryFrom<u8> for NmtState {
    type Error = InvalidNmtStateError;

    /// Attempt to convert a u8 to an NmtState enum
    ///
    /// Fails with InvalidNmtStateError if value is not a valid state
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use NmtState::*;
        match value {
            x if x == Initialising as u8 => Ok(Initialising),
            x if x == Stopped as u8 => Ok(Stopped),
            x if x == Operational as u8 => Ok(Operational),
            x if x == Sleep as u8 => Ok(Sleep),
            x if x == Standby as u8 => Ok(Standby),
            x if x == PreOperational as u8 => Ok(PreOperational),
            _ => Err(InvalidNmtStateError(value)),
        }
    }
}

/// A heartbeat message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// The node sending the heartbeat
    pub node: u8,
    /// Node guarding toggle bit
    pub toggle: bool,
    /// The reported state
    pub state: NmtState,
}

impl Heartbeat {
    /// The arbitration ID used for heartbeats from `node`
    pub fn cob_id(node: u8) -> CanId {
        CanId::Std(HEARTBEAT_ID | node as u16)
    }
}

impl From<Heartbeat> for CanMessage {
    fn from(value: Heartbeat) -> Self {
        let mut state = value.state as u8;
        if value.toggle {
            state |= 1 << 7;
        }
        CanMessage::new(Heartbeat::cob_id(value.node), &[state])
    }
}

impl TryFrom<CanMessage> for Heartbeat {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let cob_id = msg.id();
        if cob_id.is_extended() || cob_id.function_code() != HEARTBEAT_ID as u32 {
            return UnrecognizedIdSnafu { cob_id }.fail();
        }
        let payload = msg.data();
        if payload.is_empty() {
            return MessageTooShortSnafu.fail();
        }
        let toggle = (payload[0] & (1 << 7)) != 0;
        let state: NmtState = (payload[0] & 0x7f)
            .try_into()
            .map_err(|e: InvalidNmtStateError| MessageError::InvalidNmtState { value: e.0 })?;
        Ok(Heartbeat {
            node: cob_id.node_id(),
            toggle,
            state,
        })
    }
}

/// Errors decoding a CAN message into a CANopen message
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum MessageError {
    /// The payload was shorter than the message requires
    MessageTooShort,
    /// The message ID was not the expected value
    #[snafu(display("Unexpected message ID found: {cob_id:?}, expected: {expected:?}"))]
    UnexpectedId {
        /// The ID found
        cob_id: CanId,
        /// The ID expected
        expected: CanId,
    },
    /// A field held a value outside its allowed set
    InvalidField,
    /// The ID does not belong to a known service
    UnrecognizedId {
        /// The ID found
        cob_id: CanId,
    },
    /// The NMT state integer in the message is not a valid NMT state
    InvalidNmtState {
        /// The invalid state value
        value: u8,
    },
}
