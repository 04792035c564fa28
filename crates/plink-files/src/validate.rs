//! Node name rules shared by every mutation path.

use crate::error::FsError;
use plink_protocol::GCODE_EXTENSIONS;

pub const MAX_NAME_BYTES: usize = 255;

/// Characters that may never appear in a node name. The virtual separator is
/// among them; hidden-ness (leading `.`) is a property, not a violation.
pub const FORBIDDEN_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|', '\0'];

pub fn validate_name(name: &str) -> Result<(), FsError> {
    if name.is_empty() {
        return Err(FsError::NameInvalid {
            name: name.to_string(),
            reason: "empty",
        });
    }
    if name.len() > MAX_NAME_BYTES {
        return Err(FsError::NameInvalid {
            name: name.to_string(),
            reason: "longer than 255 bytes",
        });
    }
    if name.chars().any(|c| FORBIDDEN_CHARS.contains(&c)) {
        return Err(FsError::NameInvalid {
            name: name.to_string(),
            reason: "forbidden character",
        });
    }
    Ok(())
}

/// Leading dot marks the node hidden; hidden nodes are walked internally but
/// never emitted.
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

pub fn is_gcode(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    GCODE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Split a virtual absolute path into segments, dropping empty ones.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_forbidden_names() {
        for bad in ["", "a/b", "a\\b", "a:b", "p*q", "wh?t", "\"x\"", "<y>", "a|b", "nul\0"] {
            assert!(validate_name(bad).is_err(), "{bad:?} should be invalid");
        }
        assert!(validate_name(&"x".repeat(256)).is_err());
        assert!(validate_name(&"x".repeat(255)).is_ok());
    }

    #[test]
    fn hidden_and_gcode_detection() {
        assert!(is_hidden(".secret.gcode"));
        assert!(!is_hidden("visible.gcode"));
        assert!(is_gcode("A.GCO"));
        assert!(is_gcode("b.gcode"));
        assert!(!is_gcode("c.txt"));
    }

    #[test]
    fn path_splitting() {
        assert_eq!(split_path("/usb/sub/file.gcode"), vec!["usb", "sub", "file.gcode"]);
        assert_eq!(split_path("/"), Vec::<&str>::new());
    }
}
