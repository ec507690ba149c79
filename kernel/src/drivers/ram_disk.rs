use crate::block::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::{BlockError, Result};
use alloc::{vec, vec::Vec};

/// A block device backed by kernel memory. Contents start zeroed and are lost
/// when the device is dropped.
pub struct RamDisk {
    data: Vec<u8>,
}

impl RamDisk {
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            data: vec![0; sectors as usize * BLOCK_SECTOR_SIZE],
        }
    }

    fn range(&self, sector: BlockSector, len: usize) -> Result<core::ops::Range<usize>> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        if start + len > self.data.len() {
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(start..start + len)
    }
}

impl BlockOp for RamDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<()> {
        let range = self.range(sector, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<()> {
        let range = self.range(sector, buf.len())?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }
}
