//! Block payload formats and the extractors that recover a file slice from a
//! decoded payload.

use crate::types::{BlockHash, FormatTag};
use crate::{Error, Result};
use bytes::Bytes;
use std::io::{Read, Write};

/// Prefix holding the byte length of an archive's entry table.
const ARCHIVE_HEADER_LEN: usize = 4;

pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut result = Vec::new();
    decoder
        .read_to_end(&mut result)
        .map_err(|e| Error::Other(format!("zlib payload is corrupt: {e}")))?;
    Ok(result)
}

/// Accumulates small files into a single archived payload.
///
/// Layout: a little-endian `u32` giving the size of the bincode-encoded entry
/// length table, the table itself, then every entry back to back.
#[derive(Debug, Default)]
pub struct ArchiveBuilder {
    lengths: Vec<u64>,
    data: Vec<u8>,
}

impl ArchiveBuilder {
    /// Appends an entry and returns its index within the archive.
    pub fn push(&mut self, entry: &[u8]) -> u32 {
        self.lengths.push(entry.len() as u64);
        self.data.extend_from_slice(entry);
        (self.lengths.len() - 1) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    pub fn is_full(&self, target_size: usize) -> bool {
        self.data.len() >= target_size
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        let table = bincode::serialize(&self.lengths).map_err(|e| Error::Other(e.to_string()))?;
        let mut payload = Vec::with_capacity(ARCHIVE_HEADER_LEN + table.len() + self.data.len());
        payload.extend_from_slice(&(table.len() as u32).to_le_bytes());
        payload.extend_from_slice(&table);
        payload.extend_from_slice(&self.data);
        Ok(payload)
    }
}

fn archive_entry(payload: &[u8], index: u32) -> Result<&[u8]> {
    if payload.len() < ARCHIVE_HEADER_LEN {
        return Err(Error::Other("archive payload is truncated".to_string()));
    }
    let mut header = [0u8; ARCHIVE_HEADER_LEN];
    header.copy_from_slice(&payload[..ARCHIVE_HEADER_LEN]);
    let table_len = u32::from_le_bytes(header) as usize;
    let table_end = ARCHIVE_HEADER_LEN
        .checked_add(table_len)
        .filter(|end| *end <= payload.len())
        .ok_or_else(|| Error::Other("archive entry table extends beyond payload".to_string()))?;
    let lengths: Vec<u64> = bincode::deserialize(&payload[ARCHIVE_HEADER_LEN..table_end])
        .map_err(|e| Error::Other(format!("archive entry table is corrupt: {e}")))?;

    let index = index as usize;
    if index >= lengths.len() {
        return Err(Error::Other(format!(
            "archive has {} entries, entry {} requested",
            lengths.len(),
            index
        )));
    }
    let start = table_end as u64 + lengths[..index].iter().sum::<u64>();
    let end = start + lengths[index];
    if end > payload.len() as u64 {
        return Err(Error::Other("archive entry extends beyond payload".to_string()));
    }
    Ok(&payload[start as usize..end as usize])
}

pub fn encode_chain(hashes: &[BlockHash]) -> Result<Vec<u8>> {
    bincode::serialize(hashes).map_err(|e| Error::Other(e.to_string()))
}

pub fn decode_chain(payload: &[u8]) -> Result<Vec<BlockHash>> {
    bincode::deserialize(payload).map_err(|e| Error::Other(format!("chain payload is corrupt: {e}")))
}

/// Returns the slice of file content that `index` names inside a decoded
/// payload. Chain payloads must be expanded by the caller.
pub fn extract(format: FormatTag, payload: Bytes, index: u32) -> Result<Bytes> {
    match format {
        FormatTag::Raw | FormatTag::Compressed if index != 0 => Err(Error::Other(format!(
            "{} block has a single slice, index {} requested",
            format, index
        ))),
        FormatTag::Raw => Ok(payload),
        FormatTag::Compressed => Ok(Bytes::from(decompress(&payload)?)),
        FormatTag::Archived => {
            let entry = archive_entry(&payload, index)?;
            Ok(payload.slice_ref(entry))
        }
        FormatTag::Chain => Err(Error::Other(
            "chain blocks are expanded, not extracted".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressed_extract() {
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbb".repeat(20);
        let payload = compress(&data).unwrap();
        assert!(payload.len() < data.len());
        let out = extract(FormatTag::Compressed, Bytes::from(payload), 0).unwrap();
        assert_eq!(&out[..], &data[..]);
    }

    #[test]
    fn test_archive_entries() {
        let mut builder = ArchiveBuilder::default();
        assert!(builder.is_empty());
        assert_eq!(builder.push(b"first"), 0);
        assert_eq!(builder.push(b""), 1);
        assert_eq!(builder.push(b"third entry"), 2);
        assert!(builder.is_full(16));
        let payload = Bytes::from(builder.finish().unwrap());

        assert_eq!(&extract(FormatTag::Archived, payload.clone(), 0).unwrap()[..], b"first");
        assert!(extract(FormatTag::Archived, payload.clone(), 1).unwrap().is_empty());
        assert_eq!(
            &extract(FormatTag::Archived, payload.clone(), 2).unwrap()[..],
            b"third entry"
        );
        assert!(extract(FormatTag::Archived, payload, 3).is_err());
    }

    #[test]
    fn test_truncated_archive() {
        let mut builder = ArchiveBuilder::default();
        builder.push(b"0123456789");
        let payload = builder.finish().unwrap();
        let truncated = Bytes::copy_from_slice(&payload[..payload.len() - 3]);
        assert!(extract(FormatTag::Archived, truncated, 0).is_err());
    }

    #[test]
    fn test_chain_roundtrip() {
        let hashes = vec![BlockHash::from_data(b"a"), BlockHash::from_data(b"b")];
        let payload = encode_chain(&hashes).unwrap();
        assert_eq!(decode_chain(&payload).unwrap(), hashes);
        assert!(extract(FormatTag::Chain, Bytes::from(payload), 0).is_err());
    }

    #[test]
    fn test_raw_rejects_nonzero_index() {
        assert!(extract(FormatTag::Raw, Bytes::from_static(b"x"), 1).is_err());
    }
}
