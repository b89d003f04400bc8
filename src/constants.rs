use libc::c_int;

// constants stolen from C headers
pub(crate) const AF_CAN: c_int = 29;
pub(crate) const PF_CAN: c_int = 29;
pub(crate) const CAN_RAW: c_int = 1;
pub(crate) const SOL_CAN_BASE: c_int = 100;
pub(crate) const SOL_CAN_RAW: c_int = SOL_CAN_BASE + CAN_RAW;
pub(crate) const CAN_RAW_FILTER: c_int = 1;
pub(crate) const CAN_RAW_ERR_FILTER: c_int = 2;

/// if set, indicate 29 bit extended format
pub const EFF_FLAG: u32 = 0x80000000;

/// remote transmission request flag
pub const RTR_FLAG: u32 = 0x40000000;

/// error flag
pub const ERR_FLAG: u32 = 0x20000000;

/// valid bits in standard frame id
pub const SFF_MASK: u32 = 0x0000_07ff;

/// valid bits in extended frame id
pub const EFF_MASK: u32 = 0x1fff_ffff;

/// valid bits in error frame
pub const ERR_MASK: u32 = 0x1fff_ffff;
