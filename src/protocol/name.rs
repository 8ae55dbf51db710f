//! # Parameter Names
//!
//! Names are case-insensitive identity keys. On the wire they occupy a
//! fixed 16-byte field, NUL-padded and not necessarily NUL-terminated.

/// Maximum parameter name length on the wire
pub const PARAM_NAME_LEN: usize = 16;

/// Canonicalize a parameter name
///
/// Trims surrounding whitespace and NULs, uppercases and truncates to
/// [`PARAM_NAME_LEN`] characters. Every cache and wire path goes through
/// this function so the same parameter can never be stored under two keys.
///
/// # Examples
///
/// ```
/// use param_sync::protocol::normalize_name;
///
/// assert_eq!(normalize_name(" angle_max "), "ANGLE_MAX");
/// assert_eq!(normalize_name("compass_orient_long_name"), "COMPASS_ORIENT_L");
/// ```
pub fn normalize_name(name: &str) -> String {
    name.trim_matches(|c: char| c.is_whitespace() || c == '\0')
        .chars()
        .take(PARAM_NAME_LEN)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Does an echoed name identify the same parameter as a requested one?
///
/// Both sides are normalized first, so a name longer than the wire field
/// matches the truncated form the device echoes back.
pub fn names_match(requested: &str, echoed: &str) -> bool {
    normalize_name(requested) == normalize_name(echoed)
}

/// Encode a name into the 16-byte wire field
pub fn encode_param_id(name: &str) -> [u8; PARAM_NAME_LEN] {
    let mut id = [0u8; PARAM_NAME_LEN];
    let normalized = normalize_name(name);
    let bytes = normalized.as_bytes();
    let len = bytes.len().min(PARAM_NAME_LEN);
    id[..len].copy_from_slice(&bytes[..len]);
    id
}

/// Decode the 16-byte wire field into a normalized name
///
/// Reads up to the first NUL; a full 16-byte name has no terminator.
pub fn decode_param_id(id: &[u8; PARAM_NAME_LEN]) -> String {
    let end = id.iter().position(|&b| b == 0).unwrap_or(PARAM_NAME_LEN);
    normalize_name(&String::from_utf8_lossy(&id[..end]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_trims_and_uppercases() {
        assert_eq!(normalize_name("angle_max "), "ANGLE_MAX");
        assert_eq!(normalize_name("\tRc1_Min\0\0"), "RC1_MIN");
    }

    #[test]
    fn test_normalize_truncates_to_wire_length() {
        let long = "serial1_protocol_extra";
        let normalized = normalize_name(long);
        assert_eq!(normalized.len(), PARAM_NAME_LEN);
        assert_eq!(normalized, "SERIAL1_PROTOCOL");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize_name(" batt_monitor ");
        assert_eq!(normalize_name(&once), once);
    }

    #[test]
    fn test_names_match_truncated_echo() {
        assert!(names_match("angle_max", "ANGLE_MAX"));
        assert!(names_match("SERIAL1_PROTOCOL_EXTRA", "SERIAL1_PROTOCOL"));
        assert!(!names_match("ANGLE_MAX", "ANGLE_MIN"));
    }

    #[test]
    fn test_wire_id_padding() {
        let id = encode_param_id("frame_class");
        assert_eq!(&id[..11], b"FRAME_CLASS");
        assert!(id[11..].iter().all(|&b| b == 0));
        assert_eq!(decode_param_id(&id), "FRAME_CLASS");
    }

    #[test]
    fn test_wire_id_full_length_has_no_terminator() {
        let id = encode_param_id("COMPASS_ORIENT_LONG");
        assert!(id.iter().all(|&b| b != 0));
        assert_eq!(decode_param_id(&id), "COMPASS_ORIENT_L");
    }
}
