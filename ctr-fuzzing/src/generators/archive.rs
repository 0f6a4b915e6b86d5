// ctr-fuzzing/src/generators/archive.rs
//! Valid tar streams built from fuzz input

use tar::{Builder, EntryType, Header};

use crate::constants::MAX_ARCHIVE_ENTRIES;
use crate::error::InputError;
use crate::generators::FuzzConsumer;

/// Build a tar archive: an entry count byte, then a name and body per entry
pub fn archive_from(input: &mut FuzzConsumer<'_>) -> Result<Vec<u8>, InputError> {
    let entries = input.next_byte()? % MAX_ARCHIVE_ENTRIES;
    let mut builder = Builder::new(Vec::new());

    for index in 0..entries {
        let name = entry_name(&input.next_string()?, index);
        let body = input.next_bytes()?;

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, &name, body)
            .map_err(|err| InputError::Malformed(format!("archive entry {name}: {err}")))?;
    }

    builder
        .into_inner()
        .map_err(|err| InputError::Malformed(format!("archive trailer: {err}")))
}

/// Reduce a fuzzed name to a relative path tar will accept
fn entry_name(raw: &str, index: u8) -> String {
    let cleaned: Vec<String> = raw
        .replace('\0', "_")
        .split('/')
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .map(str::to_string)
        .collect();

    if cleaned.is_empty() {
        format!("entry-{index}")
    } else {
        cleaned.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn entry(name: &str, body: &[u8]) -> Vec<u8> {
        let mut bytes = vec![name.len() as u8];
        bytes.extend_from_slice(name.as_bytes());
        bytes.extend_from_slice(&(body.len() as u16).to_le_bytes());
        bytes.extend_from_slice(body);
        bytes
    }

    #[test]
    fn test_archive_entries_are_readable() {
        let mut bytes = vec![2];
        bytes.extend(entry("manifest.json", b"[]"));
        bytes.extend(entry("/../layer/../blob", b"payload"));

        let archive = FuzzConsumer::new(&bytes).next_archive().unwrap();
        let mut reader = tar::Archive::new(archive.as_slice());
        let mut seen = Vec::new();
        for file in reader.entries().unwrap() {
            let mut file = file.unwrap();
            let path = file.path().unwrap().to_string_lossy().into_owned();
            let mut body = String::new();
            file.read_to_string(&mut body).unwrap();
            seen.push((path, body));
        }

        assert_eq!(
            seen,
            vec![
                ("manifest.json".to_string(), "[]".to_string()),
                ("layer/blob".to_string(), "payload".to_string()),
            ]
        );
    }

    #[test]
    fn test_zero_entries_is_an_empty_archive() {
        let archive = FuzzConsumer::new(&[MAX_ARCHIVE_ENTRIES]).next_archive().unwrap();
        let mut reader = tar::Archive::new(archive.as_slice());
        assert_eq!(reader.entries().unwrap().count(), 0);
    }

    #[test]
    fn test_truncated_entry_is_exhaustion() {
        let bytes = [1, 4, b'n', b'a'];
        let result = FuzzConsumer::new(&bytes).next_archive();
        assert!(matches!(result, Err(InputError::Exhausted(_))));
    }

    #[test]
    fn test_entry_name_fallback() {
        assert_eq!(entry_name("", 3), "entry-3");
        assert_eq!(entry_name("/..//.", 0), "entry-0");
        assert_eq!(entry_name("a\0b/c", 0), "a_b/c");
    }
}
