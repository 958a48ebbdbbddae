//! Narrow interface to the host controller hardware
//!
//! The protocol engine in [`crate::sdio`] only talks to the controller
//! through [`SdioHost`], so it can be exercised against real silicon or a
//! software fake. Register access, pin muxing and clock-tree setup all live
//! behind the implementation.

use crate::registers::HostStatus;

/// How much response a command expects on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseLength {
    None,
    /// 48-bit response.
    Short,
    /// 136-bit response.
    Long,
}

/// What the command engine must check on the returned response.
#[derive(Debug, Clone, Copy)]
pub struct ResponseConfig {
    pub length: ResponseLength,
    /// The response carries a CRC the controller validates.
    pub check_crc: bool,
    /// The response echoes the command index back.
    pub check_index: bool,
    /// The card may hold the bus busy after responding.
    pub busy: bool,
}

impl ResponseConfig {
    pub const NONE: Self = Self {
        length: ResponseLength::None,
        check_crc: false,
        check_index: false,
        busy: false,
    };
    pub const R1: Self = Self {
        length: ResponseLength::Short,
        check_crc: true,
        check_index: true,
        busy: false,
    };
    pub const R1B: Self = Self {
        length: ResponseLength::Short,
        check_crc: true,
        check_index: true,
        busy: true,
    };
    pub const R2: Self = Self {
        length: ResponseLength::Long,
        check_crc: true,
        check_index: false,
        busy: false,
    };
    pub const R3: Self = Self {
        length: ResponseLength::Short,
        check_crc: false,
        check_index: false,
        busy: false,
    };
    pub const R6: Self = Self::R1;
    pub const R7: Self = Self::R1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    ToCard,
    FromCard,
}

/// One block-data transfer on the data path.
#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub direction: TransferDirection,
    /// log2 of the block size; always 9 for 512-byte sectors.
    pub block_size_log2: u8,
    /// Total length in bytes.
    pub length: u32,
    /// Hardware data timeout, in bus clock cycles.
    pub timeout: u32,
}

/// Memory-side access width for a DMA stream. The peripheral side always
/// moves full words; only the memory side degrades for unaligned buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaWidth {
    Word,
    Byte,
}

/// Host clock rates the driver switches between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockRate {
    /// Negotiation-safe rate, ~400 kHz class.
    Identification,
    /// Full operating rate, ~24 MHz class.
    Operational,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusWidth {
    One,
    Four,
}

/// Capabilities the protocol engine needs from the host controller.
pub trait SdioHost {
    /// Push a command with its argument onto the command path. Completion
    /// is observed through [`SdioHost::status`].
    fn issue_command(&mut self, index: u8, argument: u32, length: ResponseLength);

    /// Snapshot of the latched status flags.
    fn status(&mut self) -> HostStatus;

    /// Acknowledge and clear all latched status flags. Idempotent.
    fn clear_flags(&mut self);

    /// First 32 bits of the most recent response.
    fn short_response(&mut self) -> u32;

    /// Command index the card claims to be responding to.
    fn responding_command(&mut self) -> u8;

    /// Arm the data path for one transfer. For card-to-host transfers this
    /// must happen before the command that starts the card pushing data.
    fn configure_data_path(&mut self, config: &TransferConfig);

    /// Configure and start a memory-to-FIFO DMA stream. The peripheral
    /// paces the transfer; no burst count is programmed.
    fn start_dma_write(&mut self, source: &[u8], width: DmaWidth);

    /// Disable the DMA stream. Must be safe with no stream running.
    fn stop_dma(&mut self);

    /// Pop one word from the receive FIFO.
    fn read_fifo_word(&mut self) -> u32;

    fn set_clock_rate(&mut self, rate: ClockRate);

    fn set_bus_width(&mut self, width: BusWidth);
}

/// Fire-and-forget fault reporting collaborator. Advisory only; the driver
/// never changes behavior based on it.
pub trait DiagnosticSink {
    fn report(&mut self, tag: &str);
}

/// Sink that drops every report.
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn report(&mut self, _tag: &str) {}
}
