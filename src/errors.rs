//! Fault taxonomy for the SDIO driver

use snafu::prelude::*;

/// Bring-up steps that can abort the sequence. The interface check and the
/// clock speed-up never fail the bring-up, so they have no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringupStep {
    /// CMD0, card reset. Failing here means no card answered at all.
    Reset,
    /// The ACMD41 negotiation loop.
    OperatingConditions,
    /// CMD2, all-send-CID.
    Identification,
    /// CMD3, relative address assignment.
    AddressAssignment,
    /// CMD7, card selection.
    Selection,
    /// CMD16, fixed 512-byte block length.
    BlockLength,
    /// ACMD6, four-line bus upgrade.
    BusWidth,
}

#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// A polling budget ran out before the hardware reported completion.
    #[snafu(display("polling budget exhausted"))]
    Timeout,
    /// The controller latched a CRC, timeout, underrun, overrun or
    /// start-bit flag.
    #[snafu(display("physical-layer fault reported by the controller"))]
    PhysicalLayer,
    /// The response came back tagged with the wrong command index.
    #[snafu(display("response is to the wrong command"))]
    IndexMismatch,
    /// A type-1 status word carried error bits.
    #[snafu(display("card reported an error status"))]
    CardError,
    /// The card was not in the state the protocol step requires.
    #[snafu(display("card is not in the expected state"))]
    UnexpectedCardState,
    #[snafu(display("bring-up failed at {step:?}"))]
    BringupFailed { step: BringupStep },
    /// The sector number is not addressable on a byte-addressed card.
    #[snafu(display("sector number out of range for this card"))]
    AddressOutOfRange,
    /// The card pushed more data than the block holds.
    #[snafu(display("too much data received"))]
    Overrun,
    /// The block ended before all of its data arrived.
    #[snafu(display("block ended with data missing"))]
    ShortTransfer,
    /// No card session; run bring-up first.
    #[snafu(display("card has not been initialized"))]
    Uninitialized,
}
