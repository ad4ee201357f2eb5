use bytes::Bytes;
use civpds_types::cbor::{self, DAG_CBOR};
use civpds_types::{Cid, Ipld};

use crate::error::{StoreError, StoreResult};

/// An immutable content-addressed block.
#[derive(Clone, PartialEq, Eq)]
pub struct Block {
    pub cid: Cid,
    pub data: Bytes,
}

impl Block {
    /// Wrap bytes that are already known to hash to `cid`.
    pub fn new(cid: Cid, data: impl Into<Bytes>) -> Self {
        Self {
            cid,
            data: data.into(),
        }
    }

    /// Wrap bytes after checking they hash to `cid`.
    pub fn verified(cid: Cid, data: impl Into<Bytes>) -> StoreResult<Self> {
        let data = data.into();
        if !cbor::verify_cid(&cid, &data) {
            let actual = cbor::cid_for(cid.codec(), &data);
            return Err(StoreError::CidMismatch {
                expected: cid,
                actual,
            });
        }
        Ok(Self { cid, data })
    }

    /// Encode an IPLD value as a DAG-CBOR block.
    pub fn encode(value: &Ipld) -> StoreResult<Self> {
        let (cid, bytes) = cbor::encode_block(value)?;
        Ok(Self::new(cid, bytes))
    }

    /// Decode this block's DAG-CBOR payload.
    pub fn decode(&self) -> StoreResult<Ipld> {
        Ok(cbor::decode(&self.data)?)
    }

    /// Links contained in this block. Raw blocks have none.
    pub fn links(&self) -> StoreResult<Vec<Cid>> {
        links_of(&self.cid, &self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("cid", &self.cid.to_string())
            .field("len", &self.data.len())
            .finish()
    }
}

/// Links contained in the block `data` identified by `cid`.
pub fn links_of(cid: &Cid, data: &[u8]) -> StoreResult<Vec<Cid>> {
    if cid.codec() != DAG_CBOR {
        return Ok(Vec::new());
    }
    let value = cbor::decode(data)?;
    let mut out = Vec::new();
    cbor::links(&value, &mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn encode_produces_dag_cbor_cid() {
        let block = Block::encode(&Ipld::String("hi".into())).unwrap();
        assert_eq!(block.cid.codec(), DAG_CBOR);
        assert!(Block::verified(block.cid, block.data.clone()).is_ok());
    }

    #[test]
    fn verified_rejects_wrong_bytes() {
        let block = Block::encode(&Ipld::Integer(1)).unwrap();
        let err = Block::verified(block.cid, Bytes::from_static(b"nope")).unwrap_err();
        assert!(matches!(err, StoreError::CidMismatch { .. }));
    }

    #[test]
    fn raw_blocks_have_no_links() {
        let cid = cbor::cid_for(cbor::RAW, b"blob");
        assert!(links_of(&cid, b"blob").unwrap().is_empty());
    }

    #[test]
    fn links_are_extracted() {
        let child = Block::encode(&Ipld::Integer(7)).unwrap();
        let parent = Block::encode(&Ipld::Map(BTreeMap::from([(
            "c".to_string(),
            Ipld::Link(child.cid),
        )])))
        .unwrap();
        assert_eq!(parent.links().unwrap(), vec![child.cid]);
    }
}
