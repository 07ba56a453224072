//! SDO protocol messages
//!
//! The first byte of every SDO frame is a command byte. Bits 5-7 hold the command specifier, which
//! distinguishes the kind of request (client command specifier) or response (server command
//! specifier). The remaining bits are flags whose meaning depends on the command.
use crate::messages::{CanId, CanMessage};

/// Raw command byte values and flag masks
pub mod command {
    /// Client: initiate upload
    pub const REQUEST_UPLOAD: u8 = 2 << 5;
    /// Server: initiate upload response
    pub const RESPONSE_UPLOAD: u8 = 2 << 5;
    /// Client: initiate download
    pub const REQUEST_DOWNLOAD: u8 = 1 << 5;
    /// Server: initiate download response
    pub const RESPONSE_DOWNLOAD: u8 = 3 << 5;
    /// Client: upload segment request
    pub const REQUEST_SEGMENT_UPLOAD: u8 = 3 << 5;
    /// Server: upload segment response
    pub const RESPONSE_SEGMENT_UPLOAD: u8 = 0;
    /// Client: download segment request
    pub const REQUEST_SEGMENT_DOWNLOAD: u8 = 0;
    /// Server: download segment response
    pub const RESPONSE_SEGMENT_DOWNLOAD: u8 = 1 << 5;
    /// Either side: abort transfer
    pub const ABORT: u8 = 4 << 5;

    /// Mask selecting the command specifier bits
    pub const SPECIFIER_MASK: u8 = 0xE0;
    /// Expedited flag (initiate messages)
    pub const EXPEDITED: u8 = 0x2;
    /// Size specified flag (initiate messages)
    pub const SIZE_SPECIFIED: u8 = 0x1;
    /// Toggle bit (segment messages)
    pub const TOGGLE_BIT: u8 = 0x10;
    /// No more data flag (segment messages)
    pub const NO_MORE_DATA: u8 = 0x1;
}

/// Specifies the possible server command specifier (SCS) values in SDO response packets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerCommand {
    /// Upload segment response
    SegmentUpload = 0,
    /// Download segment response
    SegmentDownload = 1,
    /// Initiate upload response
    Upload = 2,
    /// Acknowledge a download command
    Download = 3,
    /// Abort transfer
    Abort = 4,
}

impl TryFrom<u8> for ServerCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ServerCommand::*;
        match value {
            0 => Ok(SegmentUpload),
            1 => Ok(SegmentDownload),
            2 => Ok(Upload),
            3 => Ok(Download),
            4 => Ok(Abort),
            _ => Err(()),
        }
    }
}

/// Specifies the possible client command specifier (CCS) values in SDO request packets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientCommand {
    /// Download segment
    DownloadSegment = 0,
    /// Initiate download
    InitiateDownload = 1,
    /// Initiate upload
    InitiateUpload = 2,
    /// Request an upload segment
    ReqUploadSegment = 3,
    /// Abort transfer
    Abort = 4,
}

impl TryFrom<u8> for ClientCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ClientCommand::*;
        match value {
            0 => Ok(DownloadSegment),
            1 => Ok(InitiateDownload),
            2 => Ok(InitiateUpload),
            3 => Ok(ReqUploadSegment),
            4 => Ok(Abort),
            _ => Err(()),
        }
    }
}

/// SDO abort codes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    SdoTimeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the dictionary
    NoSuchObject = 0x0602_0000,
    /// Data type does not match, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// General error
    GeneralError = 0x0800_0000,
}

impl AbortCode {
    /// Look up a known abort code from its raw value
    pub fn from_raw(value: u32) -> Option<Self> {
        use AbortCode::*;
        [
            ToggleNotAlternated,
            SdoTimeout,
            InvalidCommandSpecifier,
            OutOfMemory,
            UnsupportedAccess,
            WriteOnly,
            ReadOnly,
            NoSuchObject,
            DataTypeMismatch,
            NoSuchSubIndex,
            GeneralError,
        ]
        .into_iter()
        .find(|code| *code as u32 == value)
    }
}

/// An SDO request, sent from client to server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoRequest {
    /// Begin a download
    InitiateDownload {
        /// Number of unused bytes in data
        n: u8,
        /// Expedited
        e: bool,
        /// Size valid
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Value on expedited, size when e=0 and s=1
        data: [u8; 4],
    },
    /// A segment of a segmented download
    DownloadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// When set, indicates there are no more segments to be sent
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Begin an upload
    InitiateUpload {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
    },
    /// Request the next upload segment
    ReqUploadSegment {
        /// Toggle flag
        t: bool,
    },
    /// Abort the transfer
    Abort {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Reason for the abort
        abort_code: u32,
    },
}

impl SdoRequest {
    /// Create an abort message
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        SdoRequest::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// Create an expedited download message
    ///
    /// `data` must be at most 4 bytes. An empty payload is sent without a size indication.
    pub fn expedited_download(index: u16, sub: u8, data: &[u8]) -> Self {
        let len = data.len().min(4);
        let mut msg_data = [0; 4];
        msg_data[0..len].copy_from_slice(&data[0..len]);

        SdoRequest::InitiateDownload {
            n: if len == 0 { 0 } else { (4 - len) as u8 },
            e: true,
            s: len != 0,
            index,
            sub,
            data: msg_data,
        }
    }

    /// Create an initiate upload message
    pub fn initiate_upload(index: u16, sub: u8) -> Self {
        SdoRequest::InitiateUpload { index, sub }
    }

    /// Create an upload segment request
    pub fn upload_segment_request(toggle: bool) -> Self {
        SdoRequest::ReqUploadSegment { t: toggle }
    }

    /// Encode the 8 byte payload
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0; 8];

        match self {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = command::REQUEST_DOWNLOAD
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | s as u8;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoRequest::DownloadSegment { t, n, c, data } => {
                payload[0] = command::REQUEST_SEGMENT_DOWNLOAD
                    | (t as u8) << 4
                    | (n & 7) << 1
                    | (c as u8);
                payload[1..8].copy_from_slice(&data);
            }
            SdoRequest::InitiateUpload { index, sub } => {
                payload[0] = command::REQUEST_UPLOAD;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoRequest::ReqUploadSegment { t } => {
                payload[0] = command::REQUEST_SEGMENT_UPLOAD | (t as u8) << 4;
            }
            SdoRequest::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = command::ABORT;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }
        payload
    }

    /// Encode as a CAN message with the given ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}

impl TryFrom<&[u8]> for SdoRequest {
    type Error = ();

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(());
        }
        let ccs: ClientCommand = (value[0] >> 5).try_into()?;
        let index = u16::from_le_bytes([value[1], value[2]]);
        let sub = value[3];

        match ccs {
            ClientCommand::DownloadSegment => {
                let mut data = [0; 7];
                data.copy_from_slice(&value[1..8]);
                Ok(SdoRequest::DownloadSegment {
                    t: (value[0] & command::TOGGLE_BIT) != 0,
                    n: (value[0] >> 1) & 0x7,
                    c: (value[0] & command::NO_MORE_DATA) != 0,
                    data,
                })
            }
            ClientCommand::InitiateDownload => {
                let mut data = [0; 4];
                data.copy_from_slice(&value[4..8]);
                Ok(SdoRequest::InitiateDownload {
                    n: (value[0] >> 2) & 0x3,
                    e: (value[0] & command::EXPEDITED) != 0,
                    s: (value[0] & command::SIZE_SPECIFIED) != 0,
                    index,
                    sub,
                    data,
                })
            }
            ClientCommand::InitiateUpload => Ok(SdoRequest::InitiateUpload { index, sub }),
            ClientCommand::ReqUploadSegment => Ok(SdoRequest::ReqUploadSegment {
                t: (value[0] & command::TOGGLE_BIT) != 0,
            }),
            ClientCommand::Abort => Ok(SdoRequest::Abort {
                index,
                sub,
                abort_code: u32::from_le_bytes([value[4], value[5], value[6], value[7]]),
            }),
        }
    }
}

/// An SDO response, sent from server to client
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SdoResponse {
    /// Response to an initiate upload
    ConfirmUpload {
        /// Number of unused bytes in data
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Value if e=1, or size if s=1
        data: [u8; 4],
    },
    /// One segment of a segmented upload
    UploadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// No more data follows
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Response to an initiate download
    ConfirmDownload {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
    },
    /// Response to a download segment
    ConfirmDownloadSegment {
        /// Toggle flag
        t: bool,
    },
    /// The server aborted the transfer
    Abort {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Reason for the abort
        abort_code: u32,
    },
}

impl TryFrom<CanMessage> for SdoResponse {
    type Error = ();

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        if msg.dlc == 0 {
            return Err(());
        }
        // The data buffer is always 8 bytes; short frames read as zero padded
        let raw = msg.data;
        let command: ServerCommand = (raw[0] >> 5).try_into()?;
        let index = u16::from_le_bytes([raw[1], raw[2]]);
        let sub = raw[3];
        match command {
            ServerCommand::SegmentUpload => {
                let mut data = [0; 7];
                data.copy_from_slice(&raw[1..8]);
                Ok(SdoResponse::UploadSegment {
                    t: (raw[0] & command::TOGGLE_BIT) != 0,
                    n: (raw[0] >> 1) & 7,
                    c: (raw[0] & command::NO_MORE_DATA) != 0,
                    data,
                })
            }
            ServerCommand::SegmentDownload => Ok(SdoResponse::ConfirmDownloadSegment {
                t: (raw[0] & command::TOGGLE_BIT) != 0,
            }),
            ServerCommand::Upload => {
                let mut data = [0; 4];
                data.copy_from_slice(&raw[4..8]);
                Ok(SdoResponse::ConfirmUpload {
                    n: (raw[0] >> 2) & 0x3,
                    e: (raw[0] & command::EXPEDITED) != 0,
                    s: (raw[0] & command::SIZE_SPECIFIED) != 0,
                    index,
                    sub,
                    data,
                })
            }
            ServerCommand::Download => Ok(SdoResponse::ConfirmDownload { index, sub }),
            ServerCommand::Abort => Ok(SdoResponse::Abort {
                index,
                sub,
                abort_code: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            }),
        }
    }
}

impl SdoResponse {
    /// Create an expedited upload response carrying up to 4 bytes
    pub fn expedited_upload(index: u16, sub: u8, data: &[u8]) -> SdoResponse {
        let len = data.len().min(4);
        let mut msg_data = [0; 4];
        msg_data[0..len].copy_from_slice(&data[0..len]);

        SdoResponse::ConfirmUpload {
            index,
            sub,
            e: true,
            s: true,
            n: (4 - len) as u8,
            data: msg_data,
        }
    }

    /// Create a response starting a segmented upload of `size` bytes
    pub fn upload_acknowledge(index: u16, sub: u8, size: u32) -> SdoResponse {
        SdoResponse::ConfirmUpload {
            n: 0,
            e: false,
            s: true,
            index,
            sub,
            data: size.to_le_bytes(),
        }
    }

    /// Create an upload segment carrying up to 7 bytes
    pub fn upload_segment(t: bool, c: bool, data: &[u8]) -> SdoResponse {
        let len = data.len().min(7);
        let mut buf = [0; 7];
        buf[0..len].copy_from_slice(&data[0..len]);
        SdoResponse::UploadSegment {
            t,
            n: (7 - len) as u8,
            c,
            data: buf,
        }
    }

    /// Create a download acknowledgement
    pub fn download_acknowledge(index: u16, sub: u8) -> SdoResponse {
        SdoResponse::ConfirmDownload { index, sub }
    }

    /// Create an abort response
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> SdoResponse {
        SdoResponse::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// Encode the 8 byte payload
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0; 8];

        match self {
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = command::RESPONSE_UPLOAD
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | (s as u8);
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoResponse::ConfirmDownload { index, sub } => {
                payload[0] = command::RESPONSE_DOWNLOAD;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoResponse::UploadSegment { t, n, c, data } => {
                payload[0] = command::RESPONSE_SEGMENT_UPLOAD
                    | (t as u8) << 4
                    | (n & 7) << 1
                    | c as u8;
                payload[1..8].copy_from_slice(&data);
            }
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = command::ABORT;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
            SdoResponse::ConfirmDownloadSegment { t } => {
                payload[0] = command::RESPONSE_SEGMENT_DOWNLOAD | (t as u8) << 4;
            }
        }
        payload
    }

    /// Encode as a CAN message with the given ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}
