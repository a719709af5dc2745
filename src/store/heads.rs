/// Persisted chain heads
use super::{keys, Store, WriteBatch};
use crate::errors::TxmResult;
use crate::types::{Head, H256};

impl Store {
    /// Persist the header fields of `head` (ancestry is not stored)
    pub fn save_head(&self, head: &Head) -> TxmResult<()> {
        self.put_record(&keys::head(&head.hash), &head.detached())
    }

    pub fn get_head(&self, hash: &H256) -> TxmResult<Option<Head>> {
        self.get_record(&keys::head(hash))
    }

    pub fn heads(&self) -> TxmResult<Vec<Head>> {
        self.scan_records(keys::HEAD_PREFIX)
    }

    pub fn highest_head(&self) -> TxmResult<Option<Head>> {
        Ok(self.heads()?.into_iter().max_by_key(|head| head.number))
    }

    /// Delete heads numbered below `min_number`
    pub fn trim_old_heads(&self, min_number: u64) -> TxmResult<usize> {
        let mut batch = WriteBatch::new();
        for head in self.heads()? {
            if head.number < min_number {
                batch.delete(keys::head(&head.hash));
            }
        }
        let trimmed = batch.len();
        self.write(batch)?;
        Ok(trimmed)
    }

    /// Chain ending at `hash`, following stored parents up to `depth` heads
    pub fn chain(&self, hash: &H256, depth: u64) -> TxmResult<Option<Head>> {
        let mut headers = Vec::new();
        let mut next = Some(*hash);
        while let Some(hash) = next {
            if headers.len() as u64 >= depth {
                break;
            }
            match self.get_head(&hash)? {
                Some(head) => {
                    next = if head.number == 0 { None } else { Some(head.parent_hash) };
                    headers.push(head);
                }
                None => break,
            }
        }
        Ok(Head::link(headers))
    }
}
