//! Helpers shared by the host controller drivers: register access, DMA memory, polling
//! timeouts and logger setup.

pub mod dma;
pub mod io;
pub mod logger;
pub mod timeout;

/// The granularity the controller uses for scratchpad buffers and page-aligned DMA.
pub const PAGE_SIZE: usize = 4096;
