use shm_transport::env::env_get;
use shm_transport::{release_mask, DescPoolConfig, FifoLayout, HugetlbMode};

use crate::error::{MmError, MmResult};

/// Tunables of a FIFO interface.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MmIfaceConfig {
    /// Number of slots in the receive FIFO; a power of two.
    pub fifo_size: usize,
    /// Bytes per slot, header included.
    pub fifo_elem_size: usize,
    /// Fraction of the FIFO consumed before the tail is published, in `[0, 1)`.
    pub release_fifo_factor: f64,
    pub hugetlb_mode: HugetlbMode,
    /// Receive descriptor pool.
    pub mp: DescPoolConfig,
}

impl Default for MmIfaceConfig {
    fn default() -> Self {
        Self {
            fifo_size: 64,
            fifo_elem_size: 256,
            release_fifo_factor: 0.5,
            hugetlb_mode: HugetlbMode::Try,
            mp: DescPoolConfig::default(),
        }
    }
}

impl MmIfaceConfig {
    /// Defaults overridden by `SHM_FIFO_SIZE`, `SHM_FIFO_ELEM_SIZE`,
    /// `SHM_FIFO_RELEASE_FACTOR`, `SHM_HUGETLB_MODE`, `SHM_RX_SEG_SIZE` and
    /// `SHM_RX_MAX_BUFS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            fifo_size: env_get("SHM_FIFO_SIZE", defaults.fifo_size),
            fifo_elem_size: env_get("SHM_FIFO_ELEM_SIZE", defaults.fifo_elem_size),
            release_fifo_factor: env_get("SHM_FIFO_RELEASE_FACTOR", defaults.release_fifo_factor),
            hugetlb_mode: env_get("SHM_HUGETLB_MODE", defaults.hugetlb_mode),
            mp: DescPoolConfig {
                seg_size: env_get("SHM_RX_SEG_SIZE", defaults.mp.seg_size),
                max_bufs: env_get("SHM_RX_MAX_BUFS", defaults.mp.max_bufs),
            },
        }
    }

    /// Checks the FIFO geometry, the release factor and the descriptor size.
    pub fn validate(&self) -> MmResult<()> {
        self.fifo_layout()?;
        self.release_mask()?;
        if self.mp.max_bufs == 0 {
            return Err(MmError::InvalidConfig("receive descriptor pool is empty"));
        }
        if self.mp.seg_size < self.fifo_elem_size - shm_transport::FIFO_ELEM_HEADER_SIZE {
            return Err(MmError::InvalidConfig(
                "receive descriptor is smaller than a fifo slot payload",
            ));
        }
        Ok(())
    }

    pub(crate) fn fifo_layout(&self) -> MmResult<FifoLayout> {
        Ok(FifoLayout::new(self.fifo_size, self.fifo_elem_size)?)
    }

    pub(crate) fn release_mask(&self) -> MmResult<u64> {
        Ok(release_mask(
            self.fifo_size as u64,
            self.release_fifo_factor,
        )?)
    }
}
