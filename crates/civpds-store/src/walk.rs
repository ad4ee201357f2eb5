use std::collections::{HashSet, VecDeque};

use civpds_types::cbor::RAW;
use civpds_types::Cid;

use crate::block::{links_of, Block};
use crate::error::{StoreError, StoreResult};
use crate::traits::BlockStore;

/// Collect every block reachable from `root`, breadth first.
///
/// Raw-codec links are skipped. A missing block is an error unless
/// `allow_missing` is set, in which case the walk continues past it.
pub async fn collect_reachable(
    store: &dyn BlockStore,
    root: &Cid,
    allow_missing: bool,
) -> StoreResult<Vec<Block>> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([*root]);
    let mut out = Vec::new();

    while let Some(cid) = queue.pop_front() {
        if cid.codec() == RAW || !seen.insert(cid) {
            continue;
        }
        let data = match store.get(&cid).await {
            Ok(data) => data,
            Err(StoreError::NotFound(_)) if allow_missing => continue,
            Err(e) => return Err(e),
        };
        for link in links_of(&cid, &data)? {
            if !seen.contains(&link) {
                queue.push_back(link);
            }
        }
        out.push(Block::new(cid, data));
    }
    Ok(out)
}
