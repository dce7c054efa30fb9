//! Per-installation key derivation for `group_info.db`.
//!
//! The client derives the SQLCipher passphrase from the login's installation
//! identifier and eight seed bytes stored at offset 46 of the container
//! header. The seed takes part in hashing as *escaped text*, the way a byte
//! string literal prints (`\x00`, `\\`, `\n`, printable ASCII as-is), not as
//! raw bytes. Any deviation in that rendering yields a different key.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use md5::{Digest, Md5};

use crate::error::PipelineError;

/// Bytes read from the start of the raw file.
pub const KEY_HEADER_LEN: usize = 54;

/// Trailing bytes of the header used as the seed.
pub const SEED_LEN: usize = 8;

/// Suffix the client hashes with the installation id to name its db directory.
const DB_DIR_SALT: &str = "nt_kernel";

/// Lowercase hex MD5 of a UTF-8 string.
pub fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Render seed bytes as the body of an escaped byte-string literal.
///
/// Quote selection follows the literal printer: single quotes unless the
/// bytes contain `'` and no `"`. Only the chosen quote is escaped.
pub fn seed_string(bytes: &[u8]) -> String {
    let quote = if bytes.contains(&b'\'') && !bytes.contains(&b'"') {
        b'"'
    } else {
        b'\''
    };

    let mut out = String::with_capacity(bytes.len() * 4);
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            b if b == quote => {
                out.push('\\');
                out.push(b as char);
            }
            b'\t' => out.push_str("\\t"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out
}

/// Key for an installation id and an already-extracted seed.
pub fn derive_key_from_seed(installation_id: &str, seed: &[u8]) -> String {
    let id_hash = md5_hex(installation_id);
    md5_hex(&format!("{}{}", id_hash, seed_string(seed)))
}

/// Read the 54-byte header of `raw_file_path` and derive the decryption key.
pub fn derive_key(installation_id: &str, raw_file_path: &Path) -> Result<String, PipelineError> {
    let mut file = File::open(raw_file_path)
        .map_err(|e| PipelineError::source_io(raw_file_path, "cannot open raw file", e))?;

    let mut header = Vec::with_capacity(KEY_HEADER_LEN);
    file.by_ref()
        .take(KEY_HEADER_LEN as u64)
        .read_to_end(&mut header)
        .map_err(|e| PipelineError::source_io(raw_file_path, "cannot read raw file header", e))?;

    if header.len() < KEY_HEADER_LEN {
        return Err(PipelineError::source_file(
            raw_file_path,
            format!(
                "header is {} bytes, key derivation needs {}",
                header.len(),
                KEY_HEADER_LEN
            ),
        ));
    }

    let seed = &header[KEY_HEADER_LEN - SEED_LEN..];
    let key = derive_key_from_seed(installation_id, seed);
    log::debug!("Derived key for {}", raw_file_path.display());
    Ok(key)
}

/// Name of the directory the client stores this installation's databases in
/// (`nt_qq_<md5(md5(id) + "nt_kernel")>`).
pub fn source_db_dir_name(installation_id: &str) -> String {
    format!(
        "nt_qq_{}",
        md5_hex(&format!("{}{}", md5_hex(installation_id), DB_DIR_SALT))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_hex_known_vector() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_seed_string_printable() {
        assert_eq!(seed_string(b"abcdefgh"), "abcdefgh");
    }

    #[test]
    fn test_seed_string_control_and_high_bytes() {
        assert_eq!(
            seed_string(b"\x00\x01\x7f\x80\xff\t\n\r"),
            "\\x00\\x01\\x7f\\x80\\xff\\t\\n\\r"
        );
    }

    #[test]
    fn test_seed_string_quote_selection() {
        // single quote only: printed inside double quotes, left unescaped
        assert_eq!(seed_string(b"it's ok!"), "it's ok!");
        // double quote only: printed inside single quotes, left unescaped
        assert_eq!(seed_string(b"say \"hi\""), "say \"hi\"");
        // both: single quotes win and get escaped
        assert_eq!(seed_string(b"'\"\\\\ab'"), "\\'\"\\\\\\\\ab\\'");
    }

    #[test]
    fn test_seed_string_backslash_is_not_a_hex_escape() {
        assert_eq!(seed_string(b"\\x41AB\xab\x1f~ "), "\\\\x41AB\\xab\\x1f~ ");
    }

    #[test]
    fn test_derive_key_matches_captured_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("group_info.db");
        let mut header: Vec<u8> = (0u8..46).collect();
        header.extend_from_slice(&[0x1b, 0x02, b'\'', b'q', 0x90, b'Z', b'\\', 0x00]);
        header.extend_from_slice(&[0xAA; 2000]);
        std::fs::write(&path, &header).unwrap();

        assert_eq!(seed_string(&header[46..54]), "\\x1b\\x02'q\\x90Z\\\\\\x00");
        let key = derive_key("u_abc123", &path).unwrap();
        assert_eq!(key, "7ac717e365783d90e4663ab6d8c16b45");
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        let a = derive_key_from_seed("u_abc123", b"abcdefgh");
        let b = derive_key_from_seed("u_abc123", b"abcdefgh");
        assert_eq!(a, b);
        assert_eq!(a, "233e8de288993b0fae1368364385e612");
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_derive_key_rejects_short_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.db");
        std::fs::write(&path, [0u8; 53]).unwrap();

        let err = derive_key("u_abc123", &path).unwrap_err();
        assert!(matches!(err, PipelineError::SourceFile { .. }));
    }

    #[test]
    fn test_derive_key_missing_file() {
        let err = derive_key("u", Path::new("/nonexistent/group_info.db")).unwrap_err();
        assert!(matches!(err, PipelineError::SourceFile { source: Some(_), .. }));
    }

    #[test]
    fn test_source_db_dir_name() {
        assert_eq!(
            source_db_dir_name("u_abc123"),
            "nt_qq_fef779582074c1bb702000c546fc193b"
        );
    }
}
