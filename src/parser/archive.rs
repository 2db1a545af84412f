//! Archive expansion and text decoding ahead of table scanning.

use crate::dirlisting::FileKind;
use crate::error::{Error, Result};
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use std::io::{Cursor, Read};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Upper bound on the buffer reserved up front from a member's declared size.
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub(crate) struct ArchiveMember {
    pub name: String,
    pub bytes: Vec<u8>,
}

pub(crate) fn is_zip(bytes: &[u8]) -> bool {
    bytes.starts_with(ZIP_MAGIC)
}

/// Expands a zip archive, descending into nested archives.
pub(crate) fn expand_zip(bytes: &[u8]) -> Result<Vec<ArchiveMember>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut members = Vec::new();

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }

        let name = file.name().to_string();
        match FileKind::from_filename(&name) {
            FileKind::Ignorable => {
                log::debug!("Skipping archive member {}", name);
            }
            kind => {
                let mut contents = Vec::with_capacity(file.size().min(MAX_PREALLOCATION) as usize);
                file.read_to_end(&mut contents)?;
                log::debug!("Extracted {} ({} bytes)", name, contents.len());

                if kind == FileKind::Archive || is_zip(&contents) {
                    members.extend(expand_zip(&contents)?);
                } else {
                    members.push(ArchiveMember { name, bytes: contents });
                }
            }
        }
    }

    Ok(members)
}

/// Decodes with the declared encoding label, or UTF-8 falling back to Windows-1252.
pub(crate) fn decode_text(bytes: &[u8], label: Option<&str>) -> Result<String> {
    if let Some(label) = label {
        let encoding = Encoding::for_label(label.trim().as_bytes())
            .ok_or_else(|| Error::Parse(format!("unknown text encoding {}", label)))?;
        let (text, _) = encoding.decode_with_bom_removal(bytes);
        return Ok(text.into_owned());
    }

    match UTF_8.decode_with_bom_removal(bytes) {
        (text, false) => Ok(text.into_owned()),
        (_, true) => {
            log::debug!("Input is not UTF-8, decoding as windows-1252");
            let (text, _, _) = WINDOWS_1252.decode(bytes);
            Ok(text.into_owned())
        }
    }
}

pub fn is_known_encoding(label: &str) -> bool {
    Encoding::for_label(label.trim().as_bytes()).is_some()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    pub(crate) fn zip_of(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents) in files {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn expands_nested_archives_and_skips_noise() {
        let inner = zip_of(&[("PUBLIC_DISPATCHIS_1.CSV", &b"C,inner"[..])]);
        let outer = zip_of(&[
            ("PUBLIC_DISPATCHIS_0.CSV", &b"C,outer"[..]),
            ("PUBLIC_DISPATCHIS_1.zip", inner.as_slice()),
            ("readme.html", &b"<html></html>"[..]),
        ]);

        assert!(is_zip(&outer));
        let members = expand_zip(&outer).unwrap();
        let names: Vec<_> = members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["PUBLIC_DISPATCHIS_0.CSV", "PUBLIC_DISPATCHIS_1.CSV"]);
        assert_eq!(members[1].bytes, b"C,inner".to_vec());
    }

    #[test]
    fn declared_member_size_is_not_trusted() {
        let mut bytes = zip_of(&[("PUBLIC_DISPATCHIS_0.CSV", &b"C,x"[..])]);
        // overwrite the uncompressed size in the central directory entry
        let central = bytes
            .windows(4)
            .position(|w| w == b"PK\x01\x02")
            .unwrap();
        bytes[central + 24..central + 28].copy_from_slice(&0xFFFF_FFF0u32.to_le_bytes());

        let members = expand_zip(&bytes).unwrap();
        assert_eq!(members[0].bytes, b"C,x".to_vec());
    }

    #[test]
    fn corrupt_archive_is_an_archive_error() {
        let err = expand_zip(b"PK\x03\x04 definitely not a zip").unwrap_err();
        assert!(err.is_file_level());
    }

    #[test]
    fn decodes_utf8_with_bom_and_falls_back_to_windows_1252() {
        assert_eq!(decode_text(b"\xEF\xBB\xBFC,ok", None).unwrap(), "C,ok");
        // 0xB0 is the degree sign in windows-1252 and invalid UTF-8
        assert_eq!(decode_text(b"C,25\xB0C", None).unwrap(), "C,25\u{b0}C");
        assert_eq!(decode_text(b"C,\xE9", Some("latin1")).unwrap(), "C,\u{e9}");
        assert!(decode_text(b"C", Some("no-such-encoding")).is_err());
    }
}
