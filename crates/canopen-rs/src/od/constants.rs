//! Central repository for the reserved Object Dictionary indices CANopen
//! defines, using a `IDX_`/`SUB_` naming convention.

// --- 0x0002 - 0x0008: static data-type exemplars ---
pub const IDX_TYPE_INTEGER8: u16 = 0x0002;
pub const IDX_TYPE_INTEGER16: u16 = 0x0003;
pub const IDX_TYPE_INTEGER32: u16 = 0x0004;
pub const IDX_TYPE_UNSIGNED8: u16 = 0x0005;
pub const IDX_TYPE_UNSIGNED16: u16 = 0x0006;
pub const IDX_TYPE_UNSIGNED32: u16 = 0x0007;
pub const IDX_TYPE_REAL32: u16 = 0x0008;

// --- 0x1000 - 0x1FFF: Communication Profile Area ---
pub const IDX_DEVICE_TYPE: u16 = 0x1000;
pub const IDX_ERROR_REGISTER: u16 = 0x1001;
pub const IDX_DEVICE_NAME: u16 = 0x1008;
pub const IDX_CONSUMER_HEARTBEAT_TIME: u16 = 0x1016;
pub const IDX_PRODUCER_HEARTBEAT_TIME: u16 = 0x1017;

pub const IDX_SDO_SERVER_PARAM_START: u16 = 0x1200;
pub const IDX_SDO_CLIENT_PARAM_START: u16 = 0x1280;

pub const IDX_RPDO_COMM_PARAM_START: u16 = 0x1400;
pub const IDX_RPDO_MAPPING_PARAM_START: u16 = 0x1600;
pub const IDX_TPDO_COMM_PARAM_START: u16 = 0x1800;
pub const IDX_TPDO_MAPPING_PARAM_START: u16 = 0x1A00;

/// Sub-index layout shared by `0x1200+i` (SDO server) and `0x1280+i`
/// (SDO client) parameter records.
pub const SUB_SDO_RX_COBID: u8 = 1;
pub const SUB_SDO_TX_COBID: u8 = 2;
pub const SUB_SDO_REMOTE_NODE: u8 = 3;

/// Sub-index layout of a PDO communication parameter record.
pub const SUB_PDO_COBID: u8 = 1;
pub const SUB_PDO_TRANSMISSION_TYPE: u8 = 2;
pub const SUB_PDO_INHIBIT_TIME: u8 = 3;
pub const SUB_PDO_EVENT_TIMER: u8 = 5;

/// `addTPDO`/`addRPDO` maximum mapped objects per PDO.
pub const MAX_MAPPINGS: usize = 8;

/// `autoInsert` scans this range for a free slot.
pub const AUTO_INSERT_RANGE_START: u16 = 0x3500;
pub const AUTO_INSERT_RANGE_END: u16 = 0x4000;

/// Minimum payload length (bytes) at which the SDO client uses block
/// mode instead of segmented transfer.
pub const BLOCK_MODE_THRESHOLD: usize = 100;

/// Fixed block size this implementation advertises/expects.
pub const BLOCK_SIZE: u8 = 127;
