//! Removal of the client's 1024-byte container header.
//!
//! The client prepends its own header to the SQLCipher file; the cipher pages
//! start right after it.

use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::path::Path;

use crate::error::PipelineError;

pub const CONTAINER_HEADER_LEN: u64 = 1024;

/// Copy `source[1024..]` into `dest`, returning the number of bytes written.
///
/// Inputs shorter than the header are rejected and `dest` is left untouched.
pub fn strip_header(source: &Path, dest: &Path) -> Result<u64, PipelineError> {
    let mut input = File::open(source)
        .map_err(|e| PipelineError::source_io(source, "cannot open file to strip", e))?;

    let len = input
        .metadata()
        .map_err(|e| PipelineError::source_io(source, "cannot stat file to strip", e))?
        .len();
    if len < CONTAINER_HEADER_LEN {
        return Err(PipelineError::source_file(
            source,
            format!(
                "file is {} bytes, shorter than the {}-byte container header",
                len, CONTAINER_HEADER_LEN
            ),
        ));
    }

    input
        .seek(SeekFrom::Start(CONTAINER_HEADER_LEN))
        .map_err(|e| PipelineError::source_io(source, "cannot seek past container header", e))?;

    let mut output = File::create(dest)
        .map_err(|e| PipelineError::source_io(dest, "cannot create stripped file", e))?;
    let written = io::copy(&mut input, &mut output)
        .map_err(|e| PipelineError::source_io(dest, "cannot write stripped file", e))?;

    log::info!(
        "Stripped {}-byte header: {} -> {} ({} bytes)",
        CONTAINER_HEADER_LEN,
        source.display(),
        dest.display(),
        written
    );
    Ok(written)
}
