//! Decoding for the controller status register and card response words

use bitflags::bitflags;

bitflags! {
    /// Physical-layer status flags latched by the host controller.
    ///
    /// The flags stay latched until [`crate::host::SdioHost::clear_flags`]
    /// acknowledges them, so a snapshot taken at a completion point can
    /// still be inspected after the acknowledge.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostStatus: u32 {
        /// Response CRC check failed.
        const CMD_CRC_FAIL = 1 << 0;
        /// Data CRC check failed.
        const DATA_CRC_FAIL = 1 << 1;
        /// No response arrived within the hardware command timeout.
        const CMD_TIMEOUT = 1 << 2;
        /// The data transfer hit the hardware data timeout.
        const DATA_TIMEOUT = 1 << 3;
        /// The transmit FIFO ran dry mid-transfer.
        const TX_UNDERRUN = 1 << 4;
        /// The receive FIFO overflowed.
        const RX_OVERRUN = 1 << 5;
        /// Command response received, CRC passed.
        const CMD_RESPONSE_END = 1 << 6;
        /// Command sent; terminal for commands expecting no response.
        const CMD_SENT = 1 << 7;
        /// The whole data transfer finished.
        const DATA_END = 1 << 8;
        /// Start bit missing on a data line.
        const START_BIT_ERROR = 1 << 9;
        /// One data block finished.
        const DATA_BLOCK_END = 1 << 10;
        /// At least one word is waiting in the receive FIFO.
        const RX_FIFO_AVAILABLE = 1 << 21;
    }
}

impl HostStatus {
    /// Every flag that signals a physical-layer fault on the bus.
    pub const DATA_LINK_FAULTS: Self = Self::CMD_CRC_FAIL
        .union(Self::DATA_CRC_FAIL)
        .union(Self::CMD_TIMEOUT)
        .union(Self::DATA_TIMEOUT)
        .union(Self::TX_UNDERRUN)
        .union(Self::RX_OVERRUN)
        .union(Self::START_BIT_ERROR);

    /// Returns true if any physical-layer fault flag is set.
    pub fn is_data_link_fault(&self) -> bool {
        self.intersects(Self::DATA_LINK_FAULTS)
    }

    /// Flags that end the wait for command completion. Sending alone
    /// completes a command that expects no response.
    pub fn command_completion(no_response: bool) -> Self {
        let mut mask = Self::CMD_CRC_FAIL
            .union(Self::CMD_RESPONSE_END)
            .union(Self::CMD_TIMEOUT);

        if no_response {
            mask = mask.union(Self::CMD_SENT);
        }

        mask
    }
}

/// Card status word carried by a type-1 response.
#[derive(Debug, Clone, Copy)]
pub struct CardStatus(pub u32);

impl CardStatus {
    // OUT_OF_RANGE down to AKE_SEQ_ERROR, per the card status layout in the
    // physical layer spec. CARD_IS_LOCKED and the state bits are not errors.
    const ERROR_MASK: u32 = 0b1111_1101_1111_1001__1000_0000_0000_1000;

    /// CURRENT_STATE value while the card is in the identification state.
    pub const STATE_IDENT: u32 = 2;

    /// Returns true if any error bit is set in the status word.
    pub fn any_error(&self) -> bool {
        self.0 & Self::ERROR_MASK != 0
    }

    /// Returns true if the READY_FOR_DATA bit is set.
    pub fn ready_for_data(&self) -> bool {
        self.0 & (1 << 8) != 0
    }
}

/// Operating conditions register carried by a type-3 response.
#[derive(Debug, Clone, Copy)]
pub struct SdOcr(pub u32);

impl SdOcr {
    /// 3.2-3.3V supply window bit.
    pub const VOLTAGE_320_330: u32 = 1 << 20;
    /// Card capacity status; set on block-addressed cards.
    pub const CCS: u32 = 1 << 30;
    /// Power-up done bit; clear while the card is still busy.
    pub const POWER_UP_DONE: u32 = 1 << 31;

    /// Returns true while the card is still powering up.
    pub fn is_busy(&self) -> bool {
        self.0 & Self::POWER_UP_DONE == 0
    }

    /// Returns true if the CCS bit is set.
    pub fn high_capacity(&self) -> bool {
        self.0 & Self::CCS != 0
    }
}
