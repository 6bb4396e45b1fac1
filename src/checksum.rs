use crc::{Algorithm, Crc};

pub const CRC_8: Algorithm<u8> = crc::CRC_8_SMBUS;

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8);

/// Check value over a byte-exact prefix of an entry record.
pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}
