//! Page verification hook.
//!
//! The pool calls this on every block loaded from disk, before handing any
//! page back to a caller. A no-op default keeps the common path free of
//! any checksum format opinion; callers that store page checksums plug in
//! their own `PageVerifier`.

use crate::bufferpool::error::{BufferPoolError, Result};
use crate::bufferpool::types::{FileBlockId, PAGES_PER_BLOCK, PAGE_SIZE};

pub trait PageVerifier: Send + Sync {
    /// Verify one page's bytes (`PAGE_SIZE` long) within `block`. Return
    /// `Err(BufferPoolError::CorruptPage(..))` to fail the load.
    fn verify(&self, block: FileBlockId, page_in_block: u8, data: &[u8]) -> Result<()>;
}

/// Accepts every page unconditionally.
pub struct NoopVerifier;

impl PageVerifier for NoopVerifier {
    fn verify(&self, _block: FileBlockId, _page_in_block: u8, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Rejects a fixed, configurable set of (block, page) pairs. Used to drive
/// the corrupt-page scenario in integration tests without depending on a
/// real checksum format.
pub struct DenylistVerifier {
    denied: std::collections::HashSet<(FileBlockId, u8)>,
}

impl DenylistVerifier {
    pub fn new(denied: impl IntoIterator<Item = (FileBlockId, u8)>) -> Self {
        Self {
            denied: denied.into_iter().collect(),
        }
    }
}

impl PageVerifier for DenylistVerifier {
    fn verify(&self, block: FileBlockId, page_in_block: u8, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        if self.denied.contains(&(block, page_in_block)) {
            let page_id = block * PAGES_PER_BLOCK as u32 + page_in_block as u32;
            return Err(BufferPoolError::CorruptPage(page_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_verifier_always_passes() {
        let v = NoopVerifier;
        assert!(v.verify(0, 0, &[0u8; PAGE_SIZE]).is_ok());
    }

    #[test]
    fn denylist_verifier_rejects_listed_pages() {
        let v = DenylistVerifier::new([(2, 3)]);
        assert!(v.verify(2, 3, &[0u8; PAGE_SIZE]).is_err());
        assert!(v.verify(2, 4, &[0u8; PAGE_SIZE]).is_ok());
    }
}
