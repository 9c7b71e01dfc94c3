//! Opcodes and sub-commands
//!
//! The subset of the EV3 firmware's byte codes used by [`super::Brick`].

/// No operation
pub const NOP: u8 = 0x01;
/// System information
pub const INFO: u8 = 0x7C;
/// Read from the UI subsystem
pub const UI_READ: u8 = 0x81;
/// Write to the UI subsystem
pub const UI_WRITE: u8 = 0x82;
/// File and folder operations
pub const FILE: u8 = 0xC0;
/// File name operations
pub const FILENAME: u8 = 0xC6;
/// Read communication settings
pub const COM_GET: u8 = 0xD3;

/// Sub-commands of [`UI_READ`]
pub mod ui_read {
    /// Battery voltage (float)
    pub const GET_VBATT: u8 = 0x01;
    /// Battery current (float)
    pub const GET_IBATT: u8 = 0x02;
    /// OS version string
    pub const GET_OS_VERS: u8 = 0x03;
    /// Hardware version string
    pub const GET_HW_VERS: u8 = 0x09;
    /// Firmware version string
    pub const GET_FW_VERS: u8 = 0x0A;
    /// Battery level in percent
    pub const GET_LBATT: u8 = 0x12;
}

/// Sub-commands of [`UI_WRITE`]
pub mod ui_write {
    /// Button backlight
    pub const LED: u8 = 0x1B;
}

/// Sub-commands of [`INFO`]
pub mod info {
    /// Sound volume in percent
    pub const SET_VOLUME: u8 = 0x06;
}

/// Sub-commands of [`FILE`]
pub mod file {
    /// Count subfolders
    pub const GET_FOLDERS: u8 = 0x0D;
    /// Name of the n-th subfolder
    pub const GET_SUBFOLDER_NAME: u8 = 0x0F;
}

/// Sub-commands of [`FILENAME`]
pub mod filename {
    /// Whether a path exists
    pub const EXIST: u8 = 0x10;
    /// File count and total size of a path
    pub const TOTALSIZE: u8 = 0x13;
}

/// Sub-commands of [`COM_GET`]
pub mod com_get {
    /// Brick name string
    pub const GET_BRICKNAME: u8 = 0x0D;
}
