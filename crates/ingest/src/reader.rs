use std::io::{Cursor, Read};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

static PARAGRAPH_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</w:p>|<w:br\s*/>|<w:cr\s*/>").expect("valid regex"));
static TAB: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<w:tab\s*/>").expect("valid regex"));
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Txt,
    Md,
    Docx,
    Pdf,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Txt => "txt",
            FileType::Md => "md",
            FileType::Docx => "docx",
            FileType::Pdf => "pdf",
        }
    }
}

impl FromStr for FileType {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ext = s.trim().trim_start_matches('.').to_lowercase();
        match ext.as_str() {
            "txt" | "text" => Ok(FileType::Txt),
            "md" | "markdown" => Ok(FileType::Md),
            "docx" => Ok(FileType::Docx),
            "pdf" => Ok(FileType::Pdf),
            _ => Err(IngestError::UnsupportedFormat(ext)),
        }
    }
}

pub struct FileReader;

impl FileReader {
    /// Convert raw file bytes into plain text
    pub fn extract_text(bytes: &[u8], file_type: FileType) -> Result<String, IngestError> {
        match file_type {
            FileType::Txt | FileType::Md => std::str::from_utf8(bytes)
                .map(str::to_string)
                .map_err(|e| IngestError::corrupt(file_type.as_str(), e)),
            FileType::Docx => Self::read_docx(bytes),
            FileType::Pdf => pdf_extract::extract_text_from_mem(bytes)
                .map_err(|e| IngestError::corrupt("pdf", e)),
        }
    }

    fn read_docx(bytes: &[u8]) -> Result<String, IngestError> {
        let mut archive =
            zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| IngestError::corrupt("docx", e))?;

        let mut xml = String::new();
        archive
            .by_name("word/document.xml")
            .map_err(|e| IngestError::corrupt("docx", e))?
            .read_to_string(&mut xml)
            .map_err(|e| IngestError::corrupt("docx", e))?;

        Ok(docx_xml_to_text(&xml))
    }
}

/// Flatten WordprocessingML into one line per paragraph
fn docx_xml_to_text(xml: &str) -> String {
    let text = PARAGRAPH_END.replace_all(xml, "\n");
    let text = TAB.replace_all(&text, "\t");
    let text = TAG.replace_all(&text, "");

    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_docx(document_xml: &str) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("word/document.xml", options).unwrap();
            writer.write_all(document_xml.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn test_file_type_parsing() {
        assert_eq!("TXT".parse::<FileType>().unwrap(), FileType::Txt);
        assert_eq!(".docx".parse::<FileType>().unwrap(), FileType::Docx);
        assert!(matches!(
            "xlsx".parse::<FileType>(),
            Err(IngestError::UnsupportedFormat(ext)) if ext == "xlsx"
        ));
    }

    #[test]
    fn test_plain_text() {
        let text = FileReader::extract_text("NVIDIA acquired Mellanox.".as_bytes(), FileType::Txt).unwrap();
        assert_eq!(text, "NVIDIA acquired Mellanox.");
    }

    #[test]
    fn test_invalid_utf8_is_corrupt() {
        let err = FileReader::extract_text(&[0xff, 0xfe, 0x00], FileType::Md).unwrap_err();
        assert!(matches!(err, IngestError::CorruptFile { .. }));
    }

    #[test]
    fn test_docx_paragraphs() {
        let xml = r#"<w:document><w:body><w:p><w:r><w:t>Alex Thompson founded</w:t></w:r><w:r><w:t xml:space="preserve"> Genesis Bank.</w:t></w:r></w:p><w:p><w:r><w:t>R&amp;D &lt;team&gt;</w:t></w:r></w:p></w:body></w:document>"#;
        let text = FileReader::extract_text(&build_docx(xml), FileType::Docx).unwrap();
        assert_eq!(text, "Alex Thompson founded Genesis Bank.\nR&D <team>\n");
    }

    #[test]
    fn test_garbage_docx_is_corrupt() {
        let err = FileReader::extract_text(b"not a zip", FileType::Docx).unwrap_err();
        assert!(matches!(err, IngestError::CorruptFile { ref file_type, .. } if file_type == "docx"));
    }

    #[test]
    fn test_garbage_pdf_is_corrupt() {
        let err = FileReader::extract_text(b"not a pdf", FileType::Pdf).unwrap_err();
        assert!(matches!(err, IngestError::CorruptFile { .. }));
    }
}
