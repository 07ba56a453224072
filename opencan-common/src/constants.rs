//! Standard object indices and PDO parameter values

/// Object indices for standard objects
pub mod object_ids {
    /// The Device Type object index
    pub const DEVICE_TYPE: u16 = 0x1000;
    /// First RPDO communication parameter object
    pub const RPDO_COMM_BASE: u16 = 0x1400;
    /// First RPDO mapping parameter object
    pub const RPDO_MAP_BASE: u16 = 0x1600;
    /// First TPDO communication parameter object
    pub const TPDO_COMM_BASE: u16 = 0x1800;
    /// First TPDO mapping parameter object
    pub const TPDO_MAP_BASE: u16 = 0x1A00;
}

/// Special values used to access standard objects
pub mod values {
    /// Number of PDO slots scanned in each direction
    pub const PDO_SLOTS: u16 = 32;
    /// PDO COB-ID bit indicating the PDO is not valid
    pub const PDO_COB_ID_INVALID: u32 = 1 << 31;
    /// PDO COB-ID bit indicating remote requests are not allowed
    pub const PDO_RTR_NOT_ALLOWED: u32 = 1 << 30;
    /// PDO COB-ID bit indicating a 29-bit identifier
    pub const PDO_EXTENDED_ID: u32 = 1 << 29;
}
