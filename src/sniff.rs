//! Input-container sniffing: classify a staged input by its leading bytes.
//!
//! The engine's exit codes are blunt. When it rejects a file, the single
//! most useful extra signal for the caller is whether the bytes on disk
//! even look like the container the declared format implies. Two cases
//! dominate real traffic:
//!
//! * an OOXML file (docx/xlsx/pptx) whose bytes form an OLE2 compound
//!   document instead of a ZIP archive — that is how password-protected
//!   OOXML is stored, so the file is almost certainly encrypted;
//! * a file whose bytes match no container at all — truncated upload,
//!   wrong file, junk.
//!
//! The verdict rides along inside [`crate::error::ConvertError::Engine`]
//! and never changes the control flow: the engine error stands either way.

use crate::format::DocumentFormat;
use serde::Serialize;

/// ZIP local-file header, the container of OOXML and OpenDocument files.
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

/// OLE2 compound-file header, the container of legacy Office binaries and
/// of encrypted OOXML.
const OLE2_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// Heuristic verdict over a staged input's leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCondition {
    /// Bytes are consistent with the declared format (or the format is
    /// text-like and anything goes).
    Unremarkable,
    /// Container mismatch that strongly suggests password protection.
    LikelyEncrypted,
    /// Bytes match no container the declared format could live in.
    LikelyCorrupted,
}

/// Classify `prefix` (the first bytes of the staged input) against the
/// container `declared` implies. `prefix` need not be long; 8 bytes are
/// enough for every rule here.
pub fn file_condition(prefix: &[u8], declared: DocumentFormat) -> FileCondition {
    if prefix.is_empty() {
        return FileCondition::LikelyCorrupted;
    }

    let is_zip = prefix.starts_with(&ZIP_MAGIC);
    let is_ole2 = prefix.starts_with(&OLE2_MAGIC);

    match declared {
        // Modern zipped formats. OLE2 here means encrypted OOXML.
        DocumentFormat::Docx
        | DocumentFormat::Xlsx
        | DocumentFormat::Pptx
        | DocumentFormat::Odt
        | DocumentFormat::Ods
        | DocumentFormat::Odp => {
            if is_zip {
                FileCondition::Unremarkable
            } else if is_ole2 {
                FileCondition::LikelyEncrypted
            } else {
                FileCondition::LikelyCorrupted
            }
        }
        // Legacy binaries live in OLE2; encryption is internal to the
        // container so it cannot be told apart from the outside.
        DocumentFormat::Doc | DocumentFormat::Xls | DocumentFormat::Ppt => {
            if is_ole2 {
                FileCondition::Unremarkable
            } else {
                FileCondition::LikelyCorrupted
            }
        }
        DocumentFormat::Rtf => {
            if prefix.starts_with(b"{\\rtf") {
                FileCondition::Unremarkable
            } else {
                FileCondition::LikelyCorrupted
            }
        }
        // Text-like formats have no container to check.
        DocumentFormat::Txt | DocumentFormat::Csv | DocumentFormat::Html => {
            FileCondition::Unremarkable
        }
        // PDF is never a source; sniffing one means the caller is confused,
        // not that the file is damaged.
        DocumentFormat::Pdf => {
            if prefix.starts_with(b"%PDF-") {
                FileCondition::Unremarkable
            } else {
                FileCondition::LikelyCorrupted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ole2_bytes_under_ooxml_name_look_encrypted() {
        let mut prefix = OLE2_MAGIC.to_vec();
        prefix.extend_from_slice(&[0u8; 24]);
        assert_eq!(
            file_condition(&prefix, DocumentFormat::Docx),
            FileCondition::LikelyEncrypted
        );
        assert_eq!(
            file_condition(&prefix, DocumentFormat::Xlsx),
            FileCondition::LikelyEncrypted
        );
    }

    #[test]
    fn zip_bytes_under_ooxml_name_are_fine() {
        assert_eq!(
            file_condition(b"PK\x03\x04rest-of-archive", DocumentFormat::Pptx),
            FileCondition::Unremarkable
        );
    }

    #[test]
    fn garbage_is_corrupted() {
        assert_eq!(
            file_condition(b"\x00\x01\x02\x03", DocumentFormat::Docx),
            FileCondition::LikelyCorrupted
        );
        assert_eq!(
            file_condition(b"", DocumentFormat::Txt),
            FileCondition::LikelyCorrupted
        );
    }

    #[test]
    fn legacy_binaries_accept_ole2() {
        assert_eq!(
            file_condition(&OLE2_MAGIC, DocumentFormat::Doc),
            FileCondition::Unremarkable
        );
        assert_eq!(
            file_condition(b"PK\x03\x04", DocumentFormat::Doc),
            FileCondition::LikelyCorrupted
        );
    }

    #[test]
    fn verdict_serialises_snake_case() {
        assert_eq!(
            serde_json::to_string(&FileCondition::LikelyEncrypted).unwrap(),
            "\"likely_encrypted\""
        );
    }

    #[test]
    fn text_formats_are_never_flagged() {
        assert_eq!(
            file_condition(b"\xFF\xFEbinary-ish", DocumentFormat::Csv),
            FileCondition::Unremarkable
        );
    }
}
