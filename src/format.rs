//! Document formats, the supported conversion matrix, and engine codes.
//!
//! The engine addresses target formats by numeric code, not by name, so
//! every format carries the code the task config must embed (the PDF code
//! 513 is the one visible in every fixed-target deployment of the engine;
//! the rest follow the same family-banded numbering: word-processing
//! formats from 65, presentations from 129, spreadsheets from 257).
//!
//! ## The conversion matrix
//!
//! The matrix is deliberately a closed rule, not a table: any format may
//! convert within its own family (docx → odt, xlsx → csv), any family may
//! be flattened to PDF, and PDF is never accepted as a source. Keeping the
//! rule closed means adding a format to a family automatically wires up
//! all its legal pairs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A document format the conversion engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    // Word-processing family
    Docx,
    Doc,
    Odt,
    Rtf,
    Txt,
    Html,
    // Spreadsheet family
    Xlsx,
    Xls,
    Ods,
    Csv,
    // Presentation family
    Pptx,
    Ppt,
    Odp,
    // Fixed-layout (target only)
    Pdf,
}

/// Coarse grouping used by the conversion matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatFamily {
    Word,
    Spreadsheet,
    Presentation,
    Fixed,
}

impl DocumentFormat {
    /// Every format in declaration order. Used by the CLI help text and by
    /// the validation tests to sweep the full matrix.
    pub const ALL: [DocumentFormat; 14] = [
        DocumentFormat::Docx,
        DocumentFormat::Doc,
        DocumentFormat::Odt,
        DocumentFormat::Rtf,
        DocumentFormat::Txt,
        DocumentFormat::Html,
        DocumentFormat::Xlsx,
        DocumentFormat::Xls,
        DocumentFormat::Ods,
        DocumentFormat::Csv,
        DocumentFormat::Pptx,
        DocumentFormat::Ppt,
        DocumentFormat::Odp,
        DocumentFormat::Pdf,
    ];

    /// Numeric format code embedded in the engine task config.
    pub fn engine_code(self) -> u32 {
        match self {
            DocumentFormat::Docx => 65,
            DocumentFormat::Doc => 66,
            DocumentFormat::Odt => 67,
            DocumentFormat::Rtf => 68,
            DocumentFormat::Txt => 69,
            DocumentFormat::Html => 70,
            DocumentFormat::Pptx => 129,
            DocumentFormat::Ppt => 130,
            DocumentFormat::Odp => 131,
            DocumentFormat::Xlsx => 257,
            DocumentFormat::Xls => 258,
            DocumentFormat::Ods => 259,
            DocumentFormat::Csv => 260,
            DocumentFormat::Pdf => 513,
        }
    }

    /// Canonical file extension (lowercase, no dot).
    pub fn extension(self) -> &'static str {
        match self {
            DocumentFormat::Docx => "docx",
            DocumentFormat::Doc => "doc",
            DocumentFormat::Odt => "odt",
            DocumentFormat::Rtf => "rtf",
            DocumentFormat::Txt => "txt",
            DocumentFormat::Html => "html",
            DocumentFormat::Xlsx => "xlsx",
            DocumentFormat::Xls => "xls",
            DocumentFormat::Ods => "ods",
            DocumentFormat::Csv => "csv",
            DocumentFormat::Pptx => "pptx",
            DocumentFormat::Ppt => "ppt",
            DocumentFormat::Odp => "odp",
            DocumentFormat::Pdf => "pdf",
        }
    }

    /// MIME content type reported on the output artifact.
    pub fn content_type(self) -> &'static str {
        match self {
            DocumentFormat::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            DocumentFormat::Doc => "application/msword",
            DocumentFormat::Odt => "application/vnd.oasis.opendocument.text",
            DocumentFormat::Rtf => "application/rtf",
            DocumentFormat::Txt => "text/plain",
            DocumentFormat::Html => "text/html",
            DocumentFormat::Xlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
            DocumentFormat::Xls => "application/vnd.ms-excel",
            DocumentFormat::Ods => "application/vnd.oasis.opendocument.spreadsheet",
            DocumentFormat::Csv => "text/csv",
            DocumentFormat::Pptx => {
                "application/vnd.openxmlformats-officedocument.presentationml.presentation"
            }
            DocumentFormat::Ppt => "application/vnd.ms-powerpoint",
            DocumentFormat::Odp => "application/vnd.oasis.opendocument.presentation",
            DocumentFormat::Pdf => "application/pdf",
        }
    }

    pub fn family(self) -> FormatFamily {
        match self {
            DocumentFormat::Docx
            | DocumentFormat::Doc
            | DocumentFormat::Odt
            | DocumentFormat::Rtf
            | DocumentFormat::Txt
            | DocumentFormat::Html => FormatFamily::Word,
            DocumentFormat::Xlsx
            | DocumentFormat::Xls
            | DocumentFormat::Ods
            | DocumentFormat::Csv => FormatFamily::Spreadsheet,
            DocumentFormat::Pptx | DocumentFormat::Ppt | DocumentFormat::Odp => {
                FormatFamily::Presentation
            }
            DocumentFormat::Pdf => FormatFamily::Fixed,
        }
    }

    /// Whether the engine supports converting `self` into `target`.
    ///
    /// PDF is a sink: everything flattens to it, nothing comes back out.
    pub fn can_convert_to(self, target: DocumentFormat) -> bool {
        if self == DocumentFormat::Pdf {
            return false;
        }
        target == DocumentFormat::Pdf || self.family() == target.family()
    }

    /// Look up a format from a file extension (case-insensitive, no dot).
    pub fn from_extension(ext: &str) -> Option<DocumentFormat> {
        let ext = ext.to_ascii_lowercase();
        // "htm" is the only alias worth carrying.
        if ext == "htm" {
            return Some(DocumentFormat::Html);
        }
        DocumentFormat::ALL
            .into_iter()
            .find(|f| f.extension() == ext)
    }

    /// Best-effort inference from leading file bytes.
    ///
    /// Magic bytes identify containers, not office formats: a ZIP header
    /// could be docx, xlsx or pptx alike, so ZIP and OLE2 deliberately
    /// return `None` here and inference falls back to the extension. Only
    /// self-describing formats (PDF, RTF, plain text) are identified.
    pub fn from_magic(prefix: &[u8]) -> Option<DocumentFormat> {
        if prefix.starts_with(b"%PDF-") {
            return Some(DocumentFormat::Pdf);
        }
        if prefix.starts_with(b"{\\rtf") {
            return Some(DocumentFormat::Rtf);
        }
        if !prefix.is_empty()
            && std::str::from_utf8(prefix).is_ok_and(|s| {
                s.chars()
                    .all(|c| !c.is_control() || c == '\n' || c == '\r' || c == '\t')
            })
        {
            return Some(DocumentFormat::Txt);
        }
        None
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for DocumentFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DocumentFormat::from_extension(s.trim_start_matches('.'))
            .ok_or_else(|| format!("unknown document format '{s}'"))
    }
}
