//! Default wire codec: dictionary entries, buffer extents, varint records.
//!
//! Stream grammar, all integers little-endian:
//!
//! ```text
//! stream  := (dict | extent)*
//! dict    := 0x01 id:u32 level:u8 line:u32 n_params:u8
//!            file_len:u16 fmt_len:u16 params[n] file[] fmt[]
//! extent  := 0x02 buffer_id:u32 wrap:u8 data_len:u32 record*
//! record  := varint(site_id) varint(timestamp) varint(payload_len) payload[]
//! ```
//!
//! An extent groups consecutive records from one staging buffer; `wrap`
//! marks the first extent of a new scan pass so decoders can rebuild
//! cross-buffer ordering epochs. `data_len` is patched when the extent
//! closes.

use crate::encode::{Encoder, OutputBuffer};
use crate::level::LogLevel;
use crate::record::RecordHeader;
use crate::runtime::registry::{ParamKind, SiteEntry};

use zerocopy::FromBytes;

const TAG_DICTIONARY: u8 = 0x01;
const TAG_EXTENT: u8 = 0x02;

const DICT_HEADER_SIZE: usize = 15;
const EXTENT_HEADER_SIZE: usize = 10;
/// Offset of `data_len` within an extent header.
const EXTENT_LEN_OFFSET: usize = 6;

pub(crate) fn varint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

pub(crate) fn put_varint(out: &mut [u8], mut v: u64) -> usize {
    let mut n = 0;
    while v >= 0x80 {
        out[n] = (v as u8) | 0x80;
        v >>= 7;
        n += 1;
    }
    out[n] = v as u8;
    n + 1
}

pub(crate) fn read_varint(src: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in src.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

struct OpenExtent {
    header_at: usize,
    buffer_id: u32,
}

/// Default [`Encoder`]: owns the current output region and a cursor into it.
pub struct WireEncoder {
    buf: OutputBuffer,
    len: usize,
    open: Option<OpenExtent>,
}

impl WireEncoder {
    pub fn new(buf: OutputBuffer) -> Self {
        Self {
            buf,
            len: 0,
            open: None,
        }
    }

    pub fn into_buffer(mut self) -> OutputBuffer {
        self.close_extent();
        self.buf
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf.as_mut_slice()[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    fn put_varint(&mut self, v: u64) {
        let n = put_varint(&mut self.buf.as_mut_slice()[self.len..], v);
        self.len += n;
    }

    fn close_extent(&mut self) {
        if let Some(ext) = self.open.take() {
            let data_len = (self.len - ext.header_at - EXTENT_HEADER_SIZE) as u32;
            let at = ext.header_at + EXTENT_LEN_OFFSET;
            self.buf.as_mut_slice()[at..at + 4].copy_from_slice(&data_len.to_le_bytes());
        }
    }

    fn open_extent(&mut self, buffer_id: u32, wrap: bool) {
        self.close_extent();
        let header_at = self.len;
        self.put(&[TAG_EXTENT]);
        self.put(&buffer_id.to_le_bytes());
        self.put(&[u8::from(wrap)]);
        self.put(&0u32.to_le_bytes());
        self.open = Some(OpenExtent {
            header_at,
            buffer_id,
        });
    }
}

impl Encoder for WireEncoder {
    fn encode_log_msgs(
        &mut self,
        src: &[u8],
        buffer_id: u32,
        new_pass: bool,
        dictionary: &[SiteEntry],
        logs_processed: &mut u64,
    ) -> usize {
        let mut consumed = 0;
        let mut force_new_extent = new_pass;

        while consumed < src.len() {
            let rest = &src[consumed..];
            let Ok((header, _)) = RecordHeader::read_from_prefix(rest) else {
                break;
            };
            let record_len = RecordHeader::SIZE + header.payload_len as usize;
            if rest.len() < record_len {
                break;
            }
            // Records referencing a site that has not been persisted yet
            // wait for the next dictionary pass.
            if header.site_id as usize >= dictionary.len() {
                break;
            }
            let payload = &rest[RecordHeader::SIZE..record_len];

            let needs_extent = force_new_extent
                || !matches!(&self.open, Some(ext) if ext.buffer_id == buffer_id);
            let extent_cost = if needs_extent { EXTENT_HEADER_SIZE } else { 0 };
            let body = varint_len(u64::from(header.site_id))
                + varint_len(header.timestamp)
                + varint_len(u64::from(header.payload_len))
                + payload.len();
            if self.len + extent_cost + body > self.buf.capacity() {
                break;
            }

            if needs_extent {
                self.open_extent(buffer_id, force_new_extent);
            }
            self.put_varint(u64::from(header.site_id));
            self.put_varint(header.timestamp);
            self.put_varint(u64::from(header.payload_len));
            self.put(payload);

            *logs_processed += 1;
            consumed += record_len;
            force_new_extent = false;
        }

        consumed
    }

    fn encode_new_dictionary_entries(&mut self, next_index: &mut usize, entries: &[SiteEntry]) {
        if *next_index < entries.len() {
            self.close_extent();
        }
        while *next_index < entries.len() {
            let entry = &entries[*next_index];
            let site = entry.site;
            let size =
                DICT_HEADER_SIZE + entry.params.len() + site.file.len() + site.format.len();
            if self.len + size > self.buf.capacity() {
                break;
            }

            self.put(&[TAG_DICTIONARY]);
            self.put(&(*next_index as u32).to_le_bytes());
            self.put(&[site.level as u8]);
            self.put(&site.line.to_le_bytes());
            self.put(&[entry.params.len() as u8]);
            self.put(&(site.file.len() as u16).to_le_bytes());
            self.put(&(site.format.len() as u16).to_le_bytes());
            for &kind in entry.params.iter() {
                self.put(&[kind as u8]);
            }
            self.put(site.file.as_bytes());
            self.put(site.format.as_bytes());

            *next_index += 1;
        }
    }

    fn encoded_bytes(&self) -> usize {
        self.len
    }

    fn swap_buffer(&mut self, next: OutputBuffer) -> OutputBuffer {
        self.close_extent();
        self.len = 0;
        core::mem::replace(&mut self.buf, next)
    }
}

/// One dictionary entry read back from a stream.
#[derive(Debug, Clone)]
pub struct DecodedSite {
    pub id: u32,
    pub level: LogLevel,
    pub line: u32,
    pub file: String,
    pub format: String,
    pub params: Vec<ParamKind>,
}

/// One record read back from a stream, tagged with its extent's origin.
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    pub buffer_id: u32,
    pub new_pass: bool,
    pub site_id: u32,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    Truncated,
    BadTag(u8),
    BadParamKind(u8),
}

fn take<'a>(src: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], DecodeError> {
    if *pos + n > src.len() {
        return Err(DecodeError::Truncated);
    }
    let out = &src[*pos..*pos + n];
    *pos += n;
    Ok(out)
}

fn take_varint(src: &[u8], pos: &mut usize) -> Result<u64, DecodeError> {
    let (value, n) = read_varint(&src[*pos..]).ok_or(DecodeError::Truncated)?;
    *pos += n;
    Ok(value)
}

/// Parses a full stream. Trailing zero bytes are accepted as sector padding.
pub fn decode_stream(src: &[u8]) -> Result<(Vec<DecodedSite>, Vec<DecodedRecord>), DecodeError> {
    let mut sites = Vec::new();
    let mut records = Vec::new();
    let mut pos = 0;

    while pos < src.len() {
        match src[pos] {
            0 => {
                // Direct-I/O padding runs to the next sector boundary.
                pos += 1;
            }
            TAG_DICTIONARY => {
                pos += 1;
                let id = u32::from_le_bytes(take(src, &mut pos, 4)?.try_into().unwrap());
                let level = LogLevel::from_u8(take(src, &mut pos, 1)?[0]);
                let line = u32::from_le_bytes(take(src, &mut pos, 4)?.try_into().unwrap());
                let n_params = take(src, &mut pos, 1)?[0] as usize;
                let file_len = u16::from_le_bytes(take(src, &mut pos, 2)?.try_into().unwrap());
                let fmt_len = u16::from_le_bytes(take(src, &mut pos, 2)?.try_into().unwrap());
                let mut params = Vec::with_capacity(n_params);
                for &raw in take(src, &mut pos, n_params)? {
                    params.push(ParamKind::from_u8(raw).ok_or(DecodeError::BadParamKind(raw))?);
                }
                let file = String::from_utf8_lossy(take(src, &mut pos, file_len as usize)?)
                    .into_owned();
                let format = String::from_utf8_lossy(take(src, &mut pos, fmt_len as usize)?)
                    .into_owned();
                sites.push(DecodedSite {
                    id,
                    level,
                    line,
                    file,
                    format,
                    params,
                });
            }
            TAG_EXTENT => {
                pos += 1;
                let buffer_id = u32::from_le_bytes(take(src, &mut pos, 4)?.try_into().unwrap());
                let new_pass = take(src, &mut pos, 1)?[0] != 0;
                let data_len =
                    u32::from_le_bytes(take(src, &mut pos, 4)?.try_into().unwrap()) as usize;
                let data = take(src, &mut pos, data_len)?;
                let mut at = 0;
                while at < data.len() {
                    let site_id = take_varint(data, &mut at)? as u32;
                    let timestamp = take_varint(data, &mut at)?;
                    let payload_len = take_varint(data, &mut at)? as usize;
                    let payload = take(data, &mut at, payload_len)?.to_vec();
                    records.push(DecodedRecord {
                        buffer_id,
                        new_pass,
                        site_id,
                        timestamp,
                        payload,
                    });
                }
            }
            tag => return Err(DecodeError::BadTag(tag)),
        }
    }

    Ok((sites, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::registry::CallSite;
    use std::sync::Arc;
    use zerocopy::IntoBytes;

    static SITE: CallSite = CallSite::new(LogLevel::Notice, "svc/main.rs", 42, "count {}");

    fn entry() -> SiteEntry {
        SiteEntry {
            site: &SITE,
            params: Arc::from([ParamKind::Unsigned].as_slice()),
        }
    }

    fn staged_record(site_id: u32, timestamp: u64, payload: &[u8]) -> Vec<u8> {
        let header = RecordHeader {
            site_id,
            payload_len: payload.len() as u32,
            timestamp,
        };
        let mut out = header.as_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_varint_roundtrip() {
        let mut buf = [0u8; 10];
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let n = put_varint(&mut buf, v);
            assert_eq!(n, varint_len(v));
            assert_eq!(read_varint(&buf[..n]), Some((v, n)));
        }
    }

    #[test]
    fn test_records_roundtrip() {
        let mut enc = WireEncoder::new(OutputBuffer::alloc(4096).unwrap());
        let dict = vec![entry()];
        let mut next = 0;
        enc.encode_new_dictionary_entries(&mut next, &dict);
        assert_eq!(next, 1);

        let mut staged = Vec::new();
        for i in 0..3u64 {
            staged.extend_from_slice(&staged_record(0, 1000 + i, &i.to_le_bytes()));
        }
        let mut processed = 0;
        let consumed = enc.encode_log_msgs(&staged, 7, true, &dict, &mut processed);
        assert_eq!(consumed, staged.len());
        assert_eq!(processed, 3);

        let n = enc.encoded_bytes();
        let buf = enc.into_buffer();
        let (sites, records) = decode_stream(&buf.as_slice()[..n]).unwrap();

        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].format, "count {}");
        assert_eq!(sites[0].params, vec![ParamKind::Unsigned]);
        assert_eq!(records.len(), 3);
        assert!(records[0].new_pass);
        for (i, rec) in records.iter().enumerate() {
            assert_eq!(rec.buffer_id, 7);
            assert_eq!(rec.timestamp, 1000 + i as u64);
            assert_eq!(rec.payload, (i as u64).to_le_bytes());
        }
    }

    #[test]
    fn test_partial_trailing_record_left_for_next_call() {
        let mut enc = WireEncoder::new(OutputBuffer::alloc(4096).unwrap());
        let dict = vec![entry()];
        let full = staged_record(0, 1, &[9u8; 8]);
        let mut staged = full.clone();
        staged.extend_from_slice(&full[..10]); // second record cut mid-header

        let mut processed = 0;
        let consumed = enc.encode_log_msgs(&staged, 0, false, &dict, &mut processed);
        assert_eq!(consumed, full.len());
        assert_eq!(processed, 1);
    }

    #[test]
    fn test_full_output_returns_zero() {
        let mut enc = WireEncoder::new(OutputBuffer::alloc(16).unwrap());
        let dict = vec![entry()];
        let staged = staged_record(0, 1, &[0u8; 32]);
        let mut processed = 0;
        assert_eq!(enc.encode_log_msgs(&staged, 0, false, &dict, &mut processed), 0);
        assert_eq!(processed, 0);
        assert_eq!(enc.encoded_bytes(), 0);
    }

    #[test]
    fn test_unpersisted_site_defers_record() {
        let mut enc = WireEncoder::new(OutputBuffer::alloc(4096).unwrap());
        let staged = staged_record(3, 1, &[1, 2, 3]);
        let mut processed = 0;
        // Dictionary knows nothing yet.
        assert_eq!(enc.encode_log_msgs(&staged, 0, false, &[], &mut processed), 0);
        assert_eq!(processed, 0);
    }

    #[test]
    fn test_extents_split_per_buffer_and_pass() {
        let mut enc = WireEncoder::new(OutputBuffer::alloc(4096).unwrap());
        let dict = vec![entry()];
        let mut processed = 0;

        let a = staged_record(0, 1, b"a");
        let b = staged_record(0, 2, b"b");
        enc.encode_log_msgs(&a, 1, false, &dict, &mut processed);
        enc.encode_log_msgs(&b, 2, false, &dict, &mut processed);
        // Same buffer again, but on a fresh scan pass.
        enc.encode_log_msgs(&b, 2, true, &dict, &mut processed);

        let n = enc.encoded_bytes();
        let buf = enc.into_buffer();
        let (_, records) = decode_stream(&buf.as_slice()[..n]).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].buffer_id, 1);
        assert_eq!(records[1].buffer_id, 2);
        assert!(!records[1].new_pass);
        assert!(records[2].new_pass);
    }

    #[test]
    fn test_trailing_padding_ignored() {
        let mut enc = WireEncoder::new(OutputBuffer::alloc(4096).unwrap());
        let dict = vec![entry()];
        let mut processed = 0;
        enc.encode_log_msgs(&staged_record(0, 5, b"x"), 0, false, &dict, &mut processed);

        let n = enc.encoded_bytes();
        let buf = enc.into_buffer();
        let mut stream = buf.as_slice()[..n].to_vec();
        stream.extend_from_slice(&[0u8; 37]);
        let (_, records) = decode_stream(&stream).unwrap();
        assert_eq!(records.len(), 1);
    }
}
