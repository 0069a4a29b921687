//! Binary encoding of FTGS streams.
//!
//! Layout:
//!
//! ```text
//! header : magic u32 | version u8 | flags u8 | num_stats | num_groups
//!          | field_count | (kind u8 | name_len | name)*
//! record : field_index + 1 | term | group_count | (group_delta | stat*)*
//! footer : 0 | crc32 u32
//! ```
//!
//! Unsigned numbers are varints, terms and stats are zigzag varints, string
//! terms are length-prefixed bytes. The checksum covers every byte before it.
//! The layout is an internal contract between spill writers and readers and
//! between nodes running the same build.

use std::io::{self, Read, Write};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{FtgsError, Result};
use crate::ftgs::iterator::{FtgsIterator, closed_error};
use crate::ftgs::types::{FieldKind, FieldSpec, FtgsRecord, GroupStats, Term};
use crate::util::varint;

const MAGIC: u32 = 0x5347_5446; // "FTGS"
const VERSION: u8 = 1;
const FLAG_SORTED: u8 = 0x01;
const END_TAG: u64 = 0;
const MAX_STATS: usize = 1 << 12;
/// Upper bound on buffer space reserved ahead of a length read from the stream.
const PREALLOC_LIMIT: u64 = 1 << 16;

/// Stream-level metadata written ahead of the records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub fields: Arc<[FieldSpec]>,
    pub num_stats: usize,
    pub num_groups: u32,
    pub sorted: bool,
}

impl StreamHeader {
    /// Header describing `iterator`.
    pub fn of<I: FtgsIterator + ?Sized>(iterator: &I) -> Self {
        StreamHeader {
            fields: iterator.fields().into(),
            num_stats: iterator.num_stats(),
            num_groups: iterator.num_groups(),
            sorted: iterator.is_sorted(),
        }
    }
}

/// Writes an FTGS stream.
pub struct FtgsStreamWriter<W: Write> {
    writer: W,
    header: StreamHeader,
    hasher: crc32fast::Hasher,
    position: u64,
    scratch: Vec<u8>,
}

impl<W: Write> FtgsStreamWriter<W> {
    /// Create a writer and emit the header.
    pub fn new(writer: W, header: StreamHeader) -> Result<Self> {
        let mut this = FtgsStreamWriter {
            writer,
            header,
            hasher: crc32fast::Hasher::new(),
            position: 0,
            scratch: Vec::with_capacity(256),
        };

        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(MAGIC)?;
        buf.write_u8(VERSION)?;
        buf.write_u8(if this.header.sorted { FLAG_SORTED } else { 0 })?;
        varint::write_u64(&mut buf, this.header.num_stats as u64)?;
        varint::write_u64(&mut buf, this.header.num_groups as u64)?;
        varint::write_u64(&mut buf, this.header.fields.len() as u64)?;
        for field in this.header.fields.iter() {
            buf.write_u8(match field.kind {
                FieldKind::Int => 0,
                FieldKind::Str => 1,
            })?;
            varint::write_u64(&mut buf, field.name.len() as u64)?;
            buf.write_all(field.name.as_bytes())?;
        }
        this.emit(&buf)?;
        Ok(this)
    }

    /// Bytes written so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Encode one record; returns the number of bytes it took.
    pub fn write_record(&mut self, record: &FtgsRecord) -> Result<u64> {
        let kind = self
            .header
            .fields
            .get(record.field)
            .map(|f| f.kind)
            .ok_or_else(|| FtgsError::codec(format!("field index {} out of range", record.field)))?;
        if record.groups.num_stats() != self.header.num_stats {
            return Err(FtgsError::codec(format!(
                "record has {} stats, stream declares {}",
                record.groups.num_stats(),
                self.header.num_stats
            )));
        }

        let mut buf = std::mem::take(&mut self.scratch);
        buf.clear();
        varint::write_u64(&mut buf, record.field as u64 + 1)?;
        match (&record.term, kind) {
            (Term::Int(v), FieldKind::Int) => {
                varint::write_i64(&mut buf, *v)?;
            }
            (Term::Str(bytes), FieldKind::Str) => {
                varint::write_u64(&mut buf, bytes.len() as u64)?;
                buf.extend_from_slice(bytes);
            }
            (term, kind) => {
                return Err(FtgsError::codec(format!(
                    "term {term} does not match field kind {kind:?}"
                )));
            }
        }
        varint::write_u64(&mut buf, record.groups.len() as u64)?;
        let mut previous = 0u32;
        for (group, stats) in record.groups.iter() {
            varint::write_u64(&mut buf, (group - previous) as u64)?;
            previous = group;
            for &stat in stats {
                varint::write_i64(&mut buf, stat)?;
            }
        }

        let written = buf.len() as u64;
        let result = self.emit(&buf);
        self.scratch = buf;
        result.map(|_| written)
    }

    /// Write the footer and hand back the inner writer.
    pub fn finish(mut self) -> Result<(W, u64)> {
        let mut buf = Vec::with_capacity(1);
        varint::write_u64(&mut buf, END_TAG)?;
        self.emit(&buf)?;
        let crc = self.hasher.clone().finalize();
        self.writer.write_u32::<LittleEndian>(crc)?;
        self.position += 4;
        self.writer.flush()?;
        Ok((self.writer, self.position))
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.hasher.update(bytes);
        self.position += bytes.len() as u64;
        Ok(())
    }
}

/// Encode every remaining record of `iterator` into `writer` and close the
/// iterator. Returns the encoded size.
pub fn encode_stream<I, W>(iterator: &mut I, writer: W) -> Result<u64>
where
    I: FtgsIterator + ?Sized,
    W: Write,
{
    let result = (|| {
        let mut out = FtgsStreamWriter::new(writer, StreamHeader::of(iterator))?;
        while let Some(record) = iterator.next_record()? {
            out.write_record(&record)?;
        }
        out.finish().map(|(_, size)| size)
    })();
    iterator.close();
    result
}

struct Checksummed<R> {
    inner: R,
    hasher: crc32fast::Hasher,
}

impl<R: Read> Read for Checksummed<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Read a length-prefixed byte string, growing the buffer only as bytes arrive.
fn read_bytes<R: Read>(reader: &mut R, len: u64) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(len.min(PREALLOC_LIMIT) as usize);
    reader.by_ref().take(len).read_to_end(&mut bytes)?;
    if (bytes.len() as u64) < len {
        return Err(FtgsError::codec(format!(
            "truncated stream: expected {len} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Decodes an FTGS stream lazily, verifying the checksum at the end.
pub struct FtgsStreamReader<R: Read> {
    reader: Checksummed<R>,
    header: StreamHeader,
    finished: bool,
}

impl<R: Read> FtgsStreamReader<R> {
    /// Read and validate the header.
    pub fn new(reader: R) -> Result<Self> {
        let mut reader = Checksummed {
            inner: reader,
            hasher: crc32fast::Hasher::new(),
        };

        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(FtgsError::codec(format!("bad magic {magic:#010x}")));
        }
        let version = reader.read_u8()?;
        if version != VERSION {
            return Err(FtgsError::codec(format!("unsupported version {version}")));
        }
        let flags = reader.read_u8()?;
        let num_stats = varint::read_u64(&mut reader)? as usize;
        if num_stats > MAX_STATS {
            return Err(FtgsError::codec(format!("stat count {num_stats} exceeds {MAX_STATS}")));
        }
        let num_groups = u32::try_from(varint::read_u64(&mut reader)?)
            .map_err(|_| FtgsError::codec("group count overflows u32"))?;
        let field_count = varint::read_u64(&mut reader)? as usize;
        let mut fields = Vec::with_capacity(field_count.min(1024));
        for _ in 0..field_count {
            let kind = match reader.read_u8()? {
                0 => FieldKind::Int,
                1 => FieldKind::Str,
                other => return Err(FtgsError::codec(format!("unknown field kind {other}"))),
            };
            let len = varint::read_u64(&mut reader)?;
            let name = String::from_utf8(read_bytes(&mut reader, len)?)
                .map_err(|_| FtgsError::codec("field name is not UTF-8"))?;
            fields.push(FieldSpec { name, kind });
        }

        Ok(FtgsStreamReader {
            reader,
            header: StreamHeader {
                fields: fields.into(),
                num_stats,
                num_groups,
                sorted: flags & FLAG_SORTED != 0,
            },
            finished: false,
        })
    }

    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    /// Decode the next record.
    pub fn read_record(&mut self) -> Result<Option<FtgsRecord>> {
        if self.finished {
            return Ok(None);
        }

        let tag = varint::read_u64(&mut self.reader)?;
        if tag == END_TAG {
            let expected = self.reader.hasher.clone().finalize();
            let actual = self.reader.inner.read_u32::<LittleEndian>()?;
            self.finished = true;
            if expected != actual {
                return Err(FtgsError::codec(format!(
                    "checksum mismatch: computed {expected:#010x}, stored {actual:#010x}"
                )));
            }
            return Ok(None);
        }

        let field = (tag - 1) as usize;
        let kind = self
            .header
            .fields
            .get(field)
            .map(|f| f.kind)
            .ok_or_else(|| FtgsError::codec(format!("field index {field} out of range")))?;
        let term = match kind {
            FieldKind::Int => Term::Int(varint::read_i64(&mut self.reader)?),
            FieldKind::Str => {
                let len = varint::read_u64(&mut self.reader)?;
                Term::Str(read_bytes(&mut self.reader, len)?)
            }
        };

        let num_stats = self.header.num_stats;
        let count = varint::read_u64(&mut self.reader)? as usize;
        let mut groups = GroupStats::with_capacity(num_stats, count.min(1 << 10));
        let mut stats = vec![0i64; num_stats];
        let mut group = 0u32;
        for _ in 0..count {
            let delta = u32::try_from(varint::read_u64(&mut self.reader)?)
                .map_err(|_| FtgsError::codec("group delta overflows u32"))?;
            group = group
                .checked_add(delta)
                .ok_or_else(|| FtgsError::codec("group id overflows u32"))?;
            for stat in stats.iter_mut() {
                *stat = varint::read_i64(&mut self.reader)?;
            }
            groups.push(group, &stats);
        }

        Ok(Some(FtgsRecord::new(field, term, groups)))
    }
}

/// An [`FtgsIterator`] reading an encoded stream from any byte source.
pub struct StreamFtgsIterator<R: Read + Send> {
    reader: Option<FtgsStreamReader<R>>,
    header: StreamHeader,
}

impl<R: Read + Send> StreamFtgsIterator<R> {
    pub fn new(reader: R) -> Result<Self> {
        let reader = FtgsStreamReader::new(reader)?;
        let header = reader.header().clone();
        Ok(StreamFtgsIterator {
            reader: Some(reader),
            header,
        })
    }
}

impl<R: Read + Send> FtgsIterator for StreamFtgsIterator<R> {
    fn fields(&self) -> &[FieldSpec] {
        &self.header.fields
    }

    fn num_stats(&self) -> usize {
        self.header.num_stats
    }

    fn num_groups(&self) -> u32 {
        self.header.num_groups
    }

    fn is_sorted(&self) -> bool {
        self.header.sorted
    }

    fn next_record(&mut self) -> Result<Option<FtgsRecord>> {
        match self.reader.as_mut() {
            Some(reader) => reader.read_record(),
            None => Err(closed_error("StreamFtgsIterator")),
        }
    }

    fn close(&mut self) {
        self.reader = None;
    }

    fn is_closed(&self) -> bool {
        self.reader.is_none()
    }
}
