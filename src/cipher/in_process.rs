//! Decryption through the SQLCipher engine linked into this binary.

use std::path::Path;

use rusqlite::{Connection, OpenFlags};

use super::{BackendError, CipherParams, DecryptBackend};

pub struct InProcessBackend;

impl DecryptBackend for InProcessBackend {
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn export(
        &self,
        input: &Path,
        plaintext: &Path,
        key: &str,
        params: &CipherParams,
    ) -> Result<(), BackendError> {
        // ATTACH inherits these flags, so CREATE is needed for the export
        // file. The input's existence is checked by `Decryptor::decrypt`.
        let conn = Connection::open_with_flags(
            input,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.execute_batch(&params.key_pragmas(key))?;

        // Fails fast with "file is not a database" on a wrong key
        conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))?;

        let plaintext = plaintext.to_string_lossy().to_string();
        conn.execute("ATTACH DATABASE ?1 AS plaintext KEY ''", [plaintext])?;
        conn.query_row("SELECT sqlcipher_export('plaintext')", [], |_| Ok(()))?;
        conn.execute_batch("DETACH DATABASE plaintext;")?;
        Ok(())
    }
}
