//! CAR v1 framing.
//!
//! ```text
//! [varint len][DAG-CBOR {roots: [cid], version: 1}]
//! [varint len][cid bytes][block bytes]
//! [varint len][cid bytes][block bytes]
//! ...
//! ```
//!
//! Shards are written and read through this module. Offsets reported by
//! [`CarWriter::push`] and [`CarReader::next_section`] point at the start of
//! a section's varint prefix, so a single block can later be read back from
//! `offset..` without parsing the rest of the file.

use std::collections::BTreeMap;
use std::io::Cursor;

use civpds_types::{cbor, Cid, Ipld};
use integer_encoding::VarInt;

use crate::block::Block;
use crate::error::{StoreError, StoreResult};

/// Maximum size of one section (header or block).
pub const MAX_SECTION: usize = 4 * 1024 * 1024;

/// A CAR v1 header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarHeader {
    pub roots: Vec<Cid>,
}

impl CarHeader {
    pub fn new(roots: Vec<Cid>) -> Self {
        Self { roots }
    }

    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        let mut map = BTreeMap::new();
        map.insert(
            "roots".to_string(),
            Ipld::List(self.roots.iter().copied().map(Ipld::Link).collect()),
        );
        map.insert("version".to_string(), Ipld::Integer(1));
        Ok(cbor::encode(&Ipld::Map(map))?)
    }

    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        let value = cbor::decode(bytes)?;
        let map = cbor::as_map(&value, "car header")?;
        let version = cbor::get_int(map, "version", "car header")?;
        if version != 1 {
            return Err(StoreError::InvalidCar(format!(
                "only CAR version 1 is supported, got {version}"
            )));
        }
        let roots = cbor::get_list(map, "roots", "car header")?
            .iter()
            .map(|r| match r {
                Ipld::Link(cid) => Ok(*cid),
                _ => Err(StoreError::InvalidCar("root is not a link".into())),
            })
            .collect::<StoreResult<Vec<_>>>()?;
        if roots.is_empty() {
            return Err(StoreError::InvalidCar("empty CAR file".into()));
        }
        Ok(Self { roots })
    }

    /// The first root.
    pub fn root(&self) -> Option<Cid> {
        self.roots.first().copied()
    }
}

/// Accumulates a CAR file in memory.
pub struct CarWriter {
    buf: Vec<u8>,
    data_start: usize,
}

impl CarWriter {
    /// Start a CAR with the given roots.
    pub fn new(roots: Vec<Cid>) -> StoreResult<Self> {
        let header = CarHeader::new(roots).encode()?;
        let mut buf = Vec::with_capacity(header.len() + 1024);
        write_section(&mut buf, &[&header]);
        let data_start = buf.len();
        Ok(Self { buf, data_start })
    }

    /// Append a block, returning the offset of its section.
    pub fn push(&mut self, cid: &Cid, data: &[u8]) -> usize {
        let offset = self.buf.len();
        let cid_bytes = cid.to_bytes();
        write_section(&mut self.buf, &[&cid_bytes, data]);
        offset
    }

    /// Append a block that is already framed as a CAR section (as copied
    /// verbatim out of another CAR).
    pub fn push_raw_section(&mut self, section: &[u8]) -> usize {
        let offset = self.buf.len();
        self.buf.extend_from_slice(section);
        offset
    }

    /// Byte offset just past the header.
    pub fn data_start(&self) -> usize {
        self.data_start
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == self.data_start
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

fn write_section(buf: &mut Vec<u8>, parts: &[&[u8]]) {
    let len: usize = parts.iter().map(|p| p.len()).sum();
    buf.extend_from_slice(&(len as u64).encode_var_vec());
    for part in parts {
        buf.extend_from_slice(part);
    }
}

/// One block section read from a CAR.
#[derive(Debug, Clone, Copy)]
pub struct Section<'a> {
    /// Offset of the section's varint prefix.
    pub offset: usize,
    /// Total section length including the prefix.
    pub len: usize,
    pub cid: Cid,
    pub data: &'a [u8],
}

impl Section<'_> {
    pub fn to_block(&self) -> Block {
        Block::new(self.cid, self.data.to_vec())
    }
}

/// Reads a CAR file held in memory.
pub struct CarReader<'a> {
    bytes: &'a [u8],
    header: CarHeader,
    pos: usize,
    data_start: usize,
}

impl<'a> CarReader<'a> {
    /// Parse the header of `bytes`.
    pub fn new(bytes: &'a [u8]) -> StoreResult<Self> {
        let (header_bytes, next) = read_ld(bytes, 0)?
            .ok_or_else(|| StoreError::InvalidCar("missing header".into()))?;
        let header = CarHeader::decode(header_bytes)?;
        Ok(Self {
            bytes,
            header,
            pos: next,
            data_start: next,
        })
    }

    pub fn header(&self) -> &CarHeader {
        &self.header
    }

    /// Byte offset just past the header.
    pub fn data_start(&self) -> usize {
        self.data_start
    }

    /// Read the next block section, or `None` at end of input.
    pub fn next_section(&mut self) -> StoreResult<Option<Section<'a>>> {
        let offset = self.pos;
        match read_section_at(self.bytes, offset)? {
            Some(section) => {
                self.pos = offset + section.len;
                Ok(Some(section))
            }
            None => Ok(None),
        }
    }

    /// Read every block, verifying each CID.
    pub fn blocks(mut self) -> StoreResult<Vec<Block>> {
        let mut out = Vec::new();
        while let Some(section) = self.next_section()? {
            out.push(Block::verified(section.cid, section.data.to_vec())?);
        }
        Ok(out)
    }
}

/// Parse a full CAR, returning its header and verified blocks.
pub fn read_car(bytes: &[u8]) -> StoreResult<(CarHeader, Vec<Block>)> {
    let reader = CarReader::new(bytes)?;
    let header = reader.header().clone();
    Ok((header, reader.blocks()?))
}

/// Serialize `blocks` as a CAR with a single root.
pub fn write_car(root: Cid, blocks: &[Block]) -> StoreResult<Vec<u8>> {
    let mut writer = CarWriter::new(vec![root])?;
    for block in blocks {
        writer.push(&block.cid, &block.data);
    }
    Ok(writer.finish())
}

/// Read one block section starting at `offset` of `bytes`.
pub fn read_section_at(bytes: &[u8], offset: usize) -> StoreResult<Option<Section<'_>>> {
    let Some((body, next)) = read_ld(bytes, offset)? else {
        return Ok(None);
    };
    let mut cursor = Cursor::new(body);
    let cid = Cid::read_bytes(&mut cursor)
        .map_err(|e| StoreError::InvalidCar(format!("bad cid at offset {offset}: {e}")))?;
    let pos = cursor.position() as usize;
    Ok(Some(Section {
        offset,
        len: next - offset,
        cid,
        data: &body[pos..],
    }))
}

/// Read a length-delimited section at `offset`, returning its body and the
/// offset of the next section. Section offsets are what the shard index
/// records per block, so single blocks can be read back without a scan.
fn read_ld(bytes: &[u8], offset: usize) -> StoreResult<Option<(&[u8], usize)>> {
    if offset >= bytes.len() {
        return Ok(None);
    }
    let (len, prefix) = u64::decode_var(&bytes[offset..])
        .ok_or_else(|| StoreError::InvalidCar(format!("bad varint at offset {offset}")))?;
    let len = len as usize;
    if len > MAX_SECTION {
        return Err(StoreError::SectionTooLarge(len));
    }
    let start = offset + prefix;
    let end = start
        .checked_add(len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| StoreError::InvalidCar(format!("truncated section at offset {offset}")))?;
    Ok(Some((&bytes[start..end], end)))
}
