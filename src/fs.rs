//! The inode boundary.
//!
//! The memory manager depends on the filesystem only through the [`Inode`]
//! capability: a byte-level read plus the slot tying an inode to its unique
//! VM object. The edge pair is deliberately asymmetric: the VM object holds
//! a strong handle to its inode, the inode holds only a weak back-reference
//! that is cleared when the object dies.

use alloc::sync::{Arc, Weak};
use spin::Mutex;
use thiserror::Error;

use crate::vm::vm_object::VmObject;

/// Errors surfaced by inode reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    /// The underlying device failed mid-read.
    #[error("i/o error")]
    Io,
}

/// Filesystem capability consumed by demand paging.
pub trait Inode: Send + Sync {
    /// Read up to `length` bytes at `offset` into `dest`, returning how
    /// many bytes were read. A short read near end-of-file is not an
    /// error; the caller zero-pads.
    fn read_bytes(&self, offset: u32, length: usize, dest: &mut [u8]) -> Result<usize, FsError>;

    /// The slot tying this inode to its VM object.
    fn vmo_slot(&self) -> &VmoBackRef;
}

/// The inode side of the inode <-> VM object edge pair.
#[derive(Default)]
pub struct VmoBackRef {
    slot: Mutex<Option<Weak<VmObject>>>,
}

impl VmoBackRef {
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// The live VM object for this inode, if one exists.
    pub fn upgrade(&self) -> Option<Arc<VmObject>> {
        self.slot.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set(&self, vmo: &Arc<VmObject>) {
        *self.slot.lock() = Some(Arc::downgrade(vmo));
    }

    /// Clear the slot if it still refers to `vmo`. The object may already
    /// be mid-drop, so this compares identity rather than upgrading.
    pub(crate) fn clear_if(&self, vmo: *const VmObject) {
        let mut slot = self.slot.lock();
        if slot
            .as_ref()
            .is_some_and(|weak| core::ptr::eq(weak.as_ptr(), vmo))
        {
            *slot = None;
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use alloc::vec::Vec;

    /// Inode stub serving reads from a fixed byte image.
    pub(crate) struct StubInode {
        data: Vec<u8>,
        slot: VmoBackRef,
    }

    impl StubInode {
        pub(crate) fn new(data: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                data,
                slot: VmoBackRef::new(),
            })
        }
    }

    impl Inode for StubInode {
        fn read_bytes(
            &self,
            offset: u32,
            length: usize,
            dest: &mut [u8],
        ) -> Result<usize, FsError> {
            let offset = offset as usize;
            if offset >= self.data.len() {
                return Ok(0);
            }
            let count = length.min(self.data.len() - offset);
            dest[..count].copy_from_slice(&self.data[offset..offset + count]);
            Ok(count)
        }

        fn vmo_slot(&self) -> &VmoBackRef {
            &self.slot
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::StubInode;
    use super::*;
    use alloc::vec;

    #[test]
    fn test_stub_reads() {
        let inode = StubInode::new(vec![7u8; 100]);
        let mut buffer = [0u8; 64];
        assert_eq!(inode.read_bytes(90, 64, &mut buffer), Ok(10));
        assert_eq!(&buffer[..10], &[7u8; 10]);
        assert_eq!(inode.read_bytes(100, 64, &mut buffer), Ok(0));
    }
}
