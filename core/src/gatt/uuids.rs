//! Short-form UUID helpers
//!
//! Bluetooth SIG assigned numbers are usually written as 16-bit ("180D") or
//! 32-bit values that live inside the Bluetooth base UUID
//! `0000xxxx-0000-1000-8000-00805f9b34fb`.

use crate::BleError;
use uuid::Uuid;

/// Bluetooth base UUID (all assigned-number bits zero)
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805F9B34FB;

const SHORT_MASK: u128 = 0xFFFF_FFFF << 96;

/// Expand a 16- or 32-bit assigned number into a full 128-bit UUID
pub fn from_short(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Parse a 4-digit, 8-digit or full hyphenated UUID string
pub fn parse_uuid(input: &str) -> Result<Uuid, BleError> {
    let trimmed = input.trim();
    let invalid = || BleError::InvalidInput(format!("invalid UUID '{}'", input));

    match trimmed.len() {
        4 | 8 if trimmed.chars().all(|c| c.is_ascii_hexdigit()) => {
            u32::from_str_radix(trimmed, 16)
                .map(from_short)
                .map_err(|_| invalid())
        }
        _ => Uuid::parse_str(trimmed).map_err(|_| invalid()),
    }
}

/// Render a UUID in its shortest form: 4 hex digits for 16-bit assigned
/// numbers, 8 for 32-bit ones, hyphenated otherwise.
pub fn short_uuid_string(uuid: &Uuid) -> String {
    let value = uuid.as_u128();
    if value & !SHORT_MASK != BLUETOOTH_BASE_UUID {
        return uuid.hyphenated().to_string();
    }

    let short = (value >> 96) as u32;
    if short <= u16::MAX as u32 {
        format!("{:04x}", short)
    } else {
        format!("{:08x}", short)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_expand_heart_rate_service() {
        let uuid = parse_uuid("180D").expect("valid short uuid");
        assert_eq!(
            uuid.hyphenated().to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_parse_full_uuid() {
        let uuid = parse_uuid("6E400001-B5A3-F393-E0A9-E50E24DCCA9E").expect("valid uuid");
        assert_eq!(short_uuid_string(&uuid), "6e400001-b5a3-f393-e0a9-e50e24dcca9e");
    }

    #[test]
    fn test_parse_32_bit() {
        let uuid = parse_uuid("0001180d").expect("valid 32-bit uuid");
        assert_eq!(short_uuid_string(&uuid), "0001180d");
    }

    #[test]
    fn test_shorten_base_uuid() {
        let uuid = Uuid::parse_str("00002a37-0000-1000-8000-00805f9b34fb").expect("valid");
        assert_eq!(short_uuid_string(&uuid), "2a37");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(parse_uuid("xyz1"), Err(BleError::InvalidInput(_))));
        assert!(matches!(parse_uuid("12345"), Err(BleError::InvalidInput(_))));
        assert!(matches!(parse_uuid(""), Err(BleError::InvalidInput(_))));
    }

    #[test]
    fn test_rejects_signed_short_form() {
        assert!(matches!(parse_uuid("+18D"), Err(BleError::InvalidInput(_))));
        assert!(matches!(parse_uuid("+000180D"), Err(BleError::InvalidInput(_))));
    }

    proptest! {
        #[test]
        fn short_form_is_stable(short in any::<u16>()) {
            let uuid = from_short(short as u32);
            let rendered = short_uuid_string(&uuid);
            prop_assert_eq!(rendered.len(), 4);
            prop_assert_eq!(parse_uuid(&rendered).unwrap(), uuid);
        }
    }
}
