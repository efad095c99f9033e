//! Transport envelopes around a feed document: zip archives and gzip.

use flate2::read::GzDecoder;
use std::borrow::Cow;
use std::io::{Cursor, Read};
use tracing::debug;
use zip::ZipArchive;

use super::FeedFormat;
use crate::error::DecodeError;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
/// Upper bound on what a zip header can make us reserve up front.
const MAX_PREALLOCATED_ENTRY: u64 = 64 << 20;

pub fn is_zip(payload: &[u8]) -> bool {
    payload.starts_with(ZIP_MAGIC)
}

pub fn is_gzip(payload: &[u8]) -> bool {
    payload.starts_with(GZIP_MAGIC)
}

/// Strips gzip and zip wrapping, returning the inner document and the
/// format refined by the archive entry's extension.
pub fn open(payload: &[u8], format: FeedFormat) -> Result<(Cow<'_, [u8]>, FeedFormat), DecodeError> {
    let payload: Cow<'_, [u8]> = if is_gzip(payload) {
        let mut inflated = Vec::new();
        GzDecoder::new(payload).read_to_end(&mut inflated)?;
        debug!(compressed = payload.len(), inflated = inflated.len(), "Gunzipped payload");
        Cow::Owned(inflated)
    } else {
        Cow::Borrowed(payload)
    };

    if !is_zip(&payload) {
        return Ok((payload, format));
    }

    let (entry, refined) = extract_entry(&payload, format)?;
    Ok((Cow::Owned(entry), refined))
}

/// Declared sizes come from the archive itself and are not trusted.
fn initial_capacity(declared: u64) -> usize {
    usize::try_from(declared.min(MAX_PREALLOCATED_ENTRY)).unwrap_or(0)
}

fn extract_entry(archive: &[u8], format: FeedFormat) -> Result<(Vec<u8>, FeedFormat), DecodeError> {
    let mut archive = ZipArchive::new(Cursor::new(archive))?;
    let expected = format.family().archive_extensions();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_ascii_lowercase();
        let Some(extension) = expected.iter().find(|ext| name.ends_with(*ext)) else {
            continue;
        };

        let mut buf = Vec::with_capacity(initial_capacity(entry.size()));
        entry.read_to_end(&mut buf)?;
        let refined = format.refine(extension);
        debug!(entry = %name, bytes = buf.len(), format = ?refined, "Extracted zip entry");
        return Ok((buf, refined));
    }

    Err(DecodeError::NoMatchingEntry { expected })
}
