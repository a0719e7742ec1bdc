//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "files"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Validation and capture of operator-supplied bot files."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};

use crate::errors::ControlError;
use crate::state::{FileSlot, UploadedFile};

/// Validate raw bytes for a slot and build the file value stored locally and
/// remotely. Bytes must decode as UTF-8 text.
pub fn capture(
    slot: &str,
    name: &str,
    bytes: Vec<u8>,
    at: DateTime<Utc>,
) -> Result<(FileSlot, UploadedFile), ControlError> {
    let slot: FileSlot = slot.parse()?;
    let name = name.trim();
    if name.is_empty() {
        return Err(ControlError::PreconditionFailed(
            "file name must not be empty".to_string(),
        ));
    }
    let size_bytes = bytes.len() as u64;
    let content = String::from_utf8(bytes).map_err(|err| {
        ControlError::PreconditionFailed(format!(
            "{name} is not UTF-8 text (invalid byte at offset {})",
            err.utf8_error().valid_up_to()
        ))
    })?;
    Ok((
        slot,
        UploadedFile {
            name: name.to_string(),
            content,
            size_bytes,
            captured_at: at,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_text_with_byte_size() {
        let (slot, file) = capture("primary", "bot.py", "print('hé')".into(), Utc::now()).unwrap();
        assert_eq!(slot, FileSlot::Primary);
        assert_eq!(file.name, "bot.py");
        assert_eq!(file.size_bytes, 12);
        assert_eq!(file.content, "print('hé')");
    }

    #[test]
    fn empty_file_is_accepted() {
        let (_, file) = capture("dependencies", "requirements.txt", Vec::new(), Utc::now()).unwrap();
        assert_eq!(file.size_bytes, 0);
        assert!(file.content.is_empty());
    }

    #[test]
    fn rejects_unknown_slot_blank_name_and_binary() {
        let now = Utc::now();
        assert!(matches!(
            capture("avatar", "a.png", vec![1], now),
            Err(ControlError::PreconditionFailed(_))
        ));
        assert!(matches!(
            capture("primary", "  ", vec![b'a'], now),
            Err(ControlError::PreconditionFailed(_))
        ));
        let err = capture("primary", "bot.py", vec![b'o', b'k', 0xff], now).unwrap_err();
        assert!(err.detail().contains("offset 2"));
    }
}
