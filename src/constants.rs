// can be 8, 16, 32, 64 or 512
#[cfg(feature = "highspeed-usb")]
pub const PACKET_SIZE: usize = 512;
#[cfg(not(feature = "highspeed-usb"))]
pub const PACKET_SIZE: usize = 64;

/// CCID message header: type, length (LE32), slot, seq, three message-specific bytes.
pub const CCID_HEADER_LEN: usize = 10;

/// Maximum information field size: the largest APDU payload a message may declare.
pub const MAX_IFSD: usize = 1024;

/// One complete CCID message, header included.
pub const MAX_MSG_LENGTH: usize = MAX_IFSD + CCID_HEADER_LEN;

pub const CLASS_CCID: u8 = 0x0B;
pub const SUBCLASS_NONE: u8 = 0x0;
pub const TRANSFER_MODE_BULK: u8 = 0x0;

pub const FUNCTIONAL_INTERFACE: u8 = 0x21;

pub const NUM_SLOTS: u8 = 1;
pub const MAX_BUSY_SLOTS: u8 = 1;

/// Answer To Reset reported on power-on: direct convention, T=1.
pub const ATR: [u8; 4] = [0x3B, 0x80, 0x01, 0x81];

// NB: all numbers are little-endian

pub const CLOCK_FREQUENCY_KHZ: [u8; 4] = 4000u32.to_le_bytes();
pub const MAX_CLOCK_FREQUENCY_KHZ: [u8; 4] = 5000u32.to_le_bytes();
pub const DATA_RATE_BPS: [u8; 4] = 9600u32.to_le_bytes();
pub const MAX_DATA_RATE_BPS: [u8; 4] = 625_000u32.to_le_bytes();
pub const MAX_IFSD_LE: [u8; 4] = (MAX_IFSD as u32).to_le_bytes();
pub const MAX_MSG_LENGTH_LE: [u8; 4] = (MAX_MSG_LENGTH as u32).to_le_bytes();

// auto parameter negotiation, auto activation, auto voltage, auto clock,
// auto baud, TPDU exchanges, short & extended APDU level exchange
pub const FEATURES_LE: [u8; 4] = 0x0004_007Eu32.to_le_bytes();

// cf. Sec. 5.1 in: https://www.usb.org/sites/default/files/DWG_Smart-Card_CCID_Rev110.pdf
pub const FUNCTIONAL_INTERFACE_DESCRIPTOR: [u8; 52] = [
    // bcdCCID rev1.10
    0x10, 0x01,
    // bMaxSlotIndex
    NUM_SLOTS - 1,
    // bVoltageSupport (5.0V + 3.0V + 1.8V)
    0x07,
    // dwProtocols: T=0 + T=1
    0x03, 0x00, 0x00, 0x00,
    // dwDefaultClock (4 MHz)
    CLOCK_FREQUENCY_KHZ[0],
    CLOCK_FREQUENCY_KHZ[1],
    CLOCK_FREQUENCY_KHZ[2],
    CLOCK_FREQUENCY_KHZ[3],
    // dwMaximumClock (5 MHz)
    MAX_CLOCK_FREQUENCY_KHZ[0],
    MAX_CLOCK_FREQUENCY_KHZ[1],
    MAX_CLOCK_FREQUENCY_KHZ[2],
    MAX_CLOCK_FREQUENCY_KHZ[3],
    // bNumClockSupported
    0x00,
    // dwDataRate (9600 bps)
    DATA_RATE_BPS[0],
    DATA_RATE_BPS[1],
    DATA_RATE_BPS[2],
    DATA_RATE_BPS[3],
    // dwMaxDataRate (625 kbps)
    MAX_DATA_RATE_BPS[0],
    MAX_DATA_RATE_BPS[1],
    MAX_DATA_RATE_BPS[2],
    MAX_DATA_RATE_BPS[3],
    // bNumDataRatesSupported
    0x00,
    // dwMaxIFSD (1024)
    MAX_IFSD_LE[0],
    MAX_IFSD_LE[1],
    MAX_IFSD_LE[2],
    MAX_IFSD_LE[3],
    // dwSyncProtocols: none
    0x00, 0x00, 0x00, 0x00,
    // dwMechanical: no special characteristics
    0x00, 0x00, 0x00, 0x00,
    // dwFeatures
    FEATURES_LE[0],
    FEATURES_LE[1],
    FEATURES_LE[2],
    FEATURES_LE[3],
    // dwMaxCCIDMsgLen (1034)
    MAX_MSG_LENGTH_LE[0],
    MAX_MSG_LENGTH_LE[1],
    MAX_MSG_LENGTH_LE[2],
    MAX_MSG_LENGTH_LE[3],
    // bClassGetResponse ("echo")
    0xFF,
    // bClassEnvelope ("echo")
    0xFF,
    // wlcdLayout (none)
    0x00, 0x00,
    // bPinSupport (none)
    0x00,
    // bMaxCCIDBusySlots
    MAX_BUSY_SLOTS,
];
