//! Code used to bring up an SD card and run sector transfers against it

use crate::errors::{BringupStep, Fault};
use crate::host::{
    BusWidth, ClockRate, DiagnosticSink, DmaWidth, ResponseConfig, ResponseLength, SdioHost,
    TransferConfig, TransferDirection,
};
use crate::registers::{CardStatus, HostStatus, SdOcr};
use log::{debug, warn};

/// Block length for all SD transfers, in bytes
pub const SD_BLOCK_LEN: usize = 512;

/// log2 of the block length, as the data path wants it
pub const SD_BLOCK_LEN_LOG2: u8 = 9;

/// Words in one block
const WORDS_PER_BLOCK: u32 = (SD_BLOCK_LEN / 4) as u32;

/// Iteration budget for a single command completion wait. Iterations of the
/// status spin stand in for elapsed time so the budget tracks the bus clock,
/// not a wall clock.
pub const SD_CMD_POLL_BUDGET: u32 = 1_500_000;

/// Iteration budget for the not-busy wait before a data transfer. Each
/// iteration is a full CMD13 round trip.
pub const SD_READY_POLL_BUDGET: u32 = 100_000;

/// Rounds of ACMD41 before giving up on a card that stays busy
pub const SD_OP_COND_TRIES: u32 = 10_000;

/// Hardware data timeout, in bus clock cycles; about a second at full rate
pub const SD_DATA_TIMEOUT_CYCLES: u32 = 50_000_000;

/// CMD8 argument: 3.3V supply range plus the 0xDA check pattern
pub const SD_IF_COND_ARG: u32 = 0x1DA;

/// Largest sector a byte-addressed card can reach with a 32-bit argument
pub const SD_MAX_BYTE_ADDRESSED_SECTOR: u32 = 0x7f_ffff;

/// Commands the driver issues, with their arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdCmd {
    /// CMD0: GO_IDLE_STATE, no response.
    GoIdleState,
    /// CMD2: ALL_SEND_CID, broadcast identification. R2.
    AllSendCid,
    /// CMD3: SEND_RELATIVE_ADDR, asks the card to publish an RCA. R6.
    SendRelativeAddr,
    /// CMD7: SELECT_CARD, selects the card with the given RCA. R1b.
    SelectCard(u16),
    /// CMD8: SEND_IF_COND, voltage range and check pattern. R7.
    SendIfCond(u32),
    /// CMD12: STOP_TRANSMISSION. R1b.
    StopTransmission,
    /// CMD13: SEND_STATUS, addressed to the given RCA. R1.
    SendStatus(u16),
    /// CMD16: SET_BLOCKLEN. R1.
    SetBlockLen(u32),
    /// CMD17: READ_SINGLE_BLOCK at the given data address. R1.
    ReadSingleBlock(u32),
    /// CMD24: WRITE_BLOCK at the given data address. R1.
    WriteBlock(u32),
    /// CMD25: WRITE_MULTIPLE_BLOCK at the given data address. R1.
    WriteMultipleBlock(u32),
    /// CMD55: APP_CMD, addressed to the given RCA. Sent automatically
    /// before every ACMD. R1.
    AppCmd(u16),
    /// ACMD6: SET_BUS_WIDTH. R1.
    SetBusWidth(BusWidth),
    /// ACMD23: SET_WR_BLK_ERASE_COUNT, pre-declares a multi-block write. R1.
    SetWrBlkEraseCount(u16),
    /// ACMD41: SD_SEND_OP_COND with the full argument word. R3.
    SdSendOpCond(u32),
}

impl SdCmd {
    /// Six-bit command index
    pub fn index(&self) -> u8 {
        match self {
            Self::GoIdleState => 0,
            Self::AllSendCid => 2,
            Self::SendRelativeAddr => 3,
            Self::SetBusWidth(_) => 6,
            Self::SelectCard(_) => 7,
            Self::SendIfCond(_) => 8,
            Self::StopTransmission => 12,
            Self::SendStatus(_) => 13,
            Self::SetBlockLen(_) => 16,
            Self::ReadSingleBlock(_) => 17,
            Self::SetWrBlkEraseCount(_) => 23,
            Self::WriteBlock(_) => 24,
            Self::WriteMultipleBlock(_) => 25,
            Self::AppCmd(_) => 55,
            Self::SdSendOpCond(_) => 41,
        }
    }

    /// 32-bit argument that goes on the wire with the command
    pub fn argument(&self) -> u32 {
        match self {
            Self::GoIdleState
            | Self::AllSendCid
            | Self::SendRelativeAddr
            | Self::StopTransmission => 0,
            // RCA-addressed commands carry the address in the top half.
            Self::SelectCard(rca) | Self::SendStatus(rca) | Self::AppCmd(rca) => {
                u32::from(*rca) << 16
            }
            Self::SendIfCond(arg)
            | Self::SetBlockLen(arg)
            | Self::ReadSingleBlock(arg)
            | Self::WriteBlock(arg)
            | Self::WriteMultipleBlock(arg)
            | Self::SdSendOpCond(arg) => *arg,
            Self::SetWrBlkEraseCount(blocks) => u32::from(*blocks),
            Self::SetBusWidth(BusWidth::One) => 0,
            Self::SetBusWidth(BusWidth::Four) => 0b10,
        }
    }

    /// What the command engine expects back
    pub fn response(&self) -> ResponseConfig {
        match self {
            Self::GoIdleState => ResponseConfig::NONE,
            Self::AllSendCid => ResponseConfig::R2,
            Self::SendRelativeAddr => ResponseConfig::R6,
            Self::SelectCard(_) | Self::StopTransmission => ResponseConfig::R1B,
            Self::SendIfCond(_) => ResponseConfig::R7,
            Self::SdSendOpCond(_) => ResponseConfig::R3,
            Self::SendStatus(_)
            | Self::SetBlockLen(_)
            | Self::ReadSingleBlock(_)
            | Self::WriteBlock(_)
            | Self::WriteMultipleBlock(_)
            | Self::AppCmd(_)
            | Self::SetBusWidth(_)
            | Self::SetWrBlkEraseCount(_) => ResponseConfig::R1,
        }
    }

    /// Returns true if the command needs an APP_CMD prefix
    pub fn is_acmd(&self) -> bool {
        matches!(
            self,
            Self::SetBusWidth(_) | Self::SetWrBlkEraseCount(_) | Self::SdSendOpCond(_)
        )
    }
}

/// Outcome of a type-1 command whose status word carried no error bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CardReady {
    Ready,
    /// Ok, but not ready for data.
    NotReady,
}

/// Per-card state established by bring-up
#[derive(Debug, Clone, Copy)]
struct Session {
    /// Relative card address assigned during bring-up
    rca: u16,
    /// Block-addressed card; sector numbers go on the wire unscaled
    high_capacity: bool,
}

#[derive(Debug, Clone, Copy)]
enum SessionState {
    Uninitialized,
    Ready(Session),
    Failed(BringupStep),
}

/// Spin on `probe` until it yields a value, for at most `budget` iterations.
/// The iteration count is the timeout; there is no wall clock involved.
fn poll_until<T>(budget: u32, mut probe: impl FnMut() -> Option<T>) -> Result<T, Fault> {
    for _ in 0..budget {
        if let Some(value) = probe() {
            return Ok(value);
        }
    }

    Err(Fault::Timeout)
}

fn aligned_for_words(buffer: &[u8]) -> bool {
    (buffer.as_ptr() as usize) & 3 == 0 && buffer.len() & 3 == 0
}

/// Turn a sector number into the protocol data address. Byte-addressed
/// cards scale by the block length and top out at [`SD_MAX_BYTE_ADDRESSED_SECTOR`].
fn translate_sector(session: &Session, sector_number: u32) -> Result<u32, Fault> {
    if session.high_capacity {
        return Ok(sector_number);
    }

    if sector_number > SD_MAX_BYTE_ADDRESSED_SECTOR {
        return Err(Fault::AddressOutOfRange);
    }

    Ok(sector_number * SD_BLOCK_LEN as u32)
}

/// SDIO SD card driver
///
/// Owns the command/response handshake, the bring-up state machine and the
/// sector data paths. One card session per driver instance; callers running
/// from multiple contexts must serialize around the whole driver.
pub struct Sdio<H: SdioHost, D: DiagnosticSink> {
    host: H,
    diag: D,
    session: SessionState,
}

impl<H: SdioHost, D: DiagnosticSink> Sdio<H, D> {
    /// Create a driver over an already pin-muxed and clocked controller
    pub fn new(host: H, diag: D) -> Self {
        Self {
            host,
            diag,
            session: SessionState::Uninitialized,
        }
    }

    /// Returns true if bring-up negotiated a block-addressed card
    pub fn high_capacity(&self) -> bool {
        matches!(self.session, SessionState::Ready(session) if session.high_capacity)
    }

    /// The relative card address, once bring-up has assigned one
    pub fn rca(&self) -> Option<u16> {
        match self.session {
            SessionState::Ready(session) => Some(session.rca),
            _ => None,
        }
    }

    /// Release the hardware and the diagnostic sink
    pub fn free(self) -> (H, D) {
        (self.host, self.diag)
    }

    /// Issue one command and wait for the controller to report completion.
    ///
    /// ACMDs get their APP_CMD prefix here, addressed to the session RCA
    /// (zero before address assignment, which is what ACMD41 needs).
    fn send_command(&mut self, cmd: SdCmd) -> Result<(), Fault> {
        if cmd.is_acmd() {
            let rca = match self.session {
                SessionState::Ready(session) => session.rca,
                _ => 0,
            };

            // "Not ready for data" from CMD55 does not block the ACMD.
            self.command_type1(SdCmd::AppCmd(rca))?;
        }

        let response = cmd.response();

        self.host
            .issue_command(cmd.index(), cmd.argument(), response.length);

        let completion =
            HostStatus::command_completion(response.length == ResponseLength::None);

        let status = poll_until(SD_CMD_POLL_BUDGET, || {
            let status = self.host.status();
            status.intersects(completion).then_some(status)
        })?;

        // Acknowledge everything; the snapshot keeps what was latched.
        self.host.clear_flags();

        let mut latched = status;

        // Cards legitimately send no or garbled CRC on unsigned responses,
        // so the stale flag must not count against them.
        if !response.check_crc {
            latched.remove(HostStatus::CMD_CRC_FAIL);
        }

        if latched.is_data_link_fault() {
            return Err(Fault::PhysicalLayer);
        }

        if response.check_index && self.host.responding_command() != cmd.index() {
            return Err(Fault::IndexMismatch);
        }

        Ok(())
    }

    /// Send a type-1 command and decode its card status word
    fn command_type1(&mut self, cmd: SdCmd) -> Result<CardReady, Fault> {
        self.send_command(cmd)?;

        let status = CardStatus(self.host.short_response());

        if status.any_error() {
            return Err(Fault::CardError);
        }

        if status.ready_for_data() {
            Ok(CardReady::Ready)
        } else {
            Ok(CardReady::NotReady)
        }
    }

    /// CMD8: a card that echoes the check pattern can negotiate the
    /// extended (high-capacity capable) protocol
    fn interface_check(&mut self) -> Result<(), Fault> {
        self.send_command(SdCmd::SendIfCond(SD_IF_COND_ARG))?;

        let echo = self.host.short_response();

        if echo & 0xfff != SD_IF_COND_ARG {
            return Err(Fault::UnexpectedCardState);
        }

        Ok(())
    }

    /// ACMD41 rounds until the card leaves its power-up busy state
    fn negotiate_operating_conditions(
        &mut self,
        request_high_capacity: bool,
    ) -> Result<SdOcr, Fault> {
        let mut arg = SdOcr::VOLTAGE_320_330;

        if request_high_capacity {
            arg |= SdOcr::CCS;
        }

        // The busy bit stays clear in the request; only the card sets it.
        for _ in 0..SD_OP_COND_TRIES {
            self.send_command(SdCmd::SdSendOpCond(arg))?;

            let ocr = SdOcr(self.host.short_response());

            if !ocr.is_busy() {
                return Ok(ocr);
            }
        }

        Err(Fault::Timeout)
    }

    /// CMD3: pull the published RCA out of the type-6 response
    fn assign_address(&mut self) -> Result<u16, Fault> {
        self.send_command(SdCmd::SendRelativeAddr)?;

        let response = self.host.short_response();

        // The low half is a reduced card status. The card must still be in
        // the identification state with no error bits raised.
        if response & 0xfe00 != CardStatus::STATE_IDENT << 9 {
            return Err(Fault::UnexpectedCardState);
        }

        Ok((response >> 16) as u16)
    }

    /// Poll CMD13 until the card is error-free and ready for data
    fn wait_until_ready(&mut self, rca: u16) -> Result<(), Fault> {
        for _ in 0..SD_READY_POLL_BUDGET {
            match self.command_type1(SdCmd::SendStatus(rca)) {
                Ok(CardReady::Ready) => return Ok(()),
                // Still programming, or still clearing an error from the
                // previous operation; keep polling.
                Ok(CardReady::NotReady) | Err(Fault::CardError) => {}
                Err(fault) => return Err(fault),
            }
        }

        Err(Fault::Timeout)
    }

    fn fail_bringup(&mut self, step: BringupStep, fault: Fault) -> Fault {
        warn!("bring-up failed at {:?}: {}", step, fault);

        self.session = SessionState::Failed(step);

        Fault::BringupFailed { step }
    }

    /// Run the bring-up sequence from power-on to a selected, addressable
    /// card and populate the session.
    ///
    /// Precondition: host clock and pin configuration already performed.
    /// Reconfigures the host clock divider, and the bus width when
    /// `wide_bus` is requested. Four-line support is mandatory in the card
    /// standard, so the request is not probed first.
    pub fn init(&mut self, wide_bus: bool) -> Result<(), Fault> {
        self.session = SessionState::Uninitialized;
        self.host.set_clock_rate(ClockRate::Identification);

        // CMD0: if nothing answers, there is no card to talk to.
        if let Err(fault) = self.send_command(SdCmd::GoIdleState) {
            return Err(self.fail_bringup(BringupStep::Reset, fault));
        }

        // CMD8: a legacy card fails this outright, which only costs it
        // high-capacity addressing.
        let extended = self.interface_check().is_ok();

        if extended {
            debug!("interface check passed, card can negotiate high capacity");
        }

        let ocr = match self.negotiate_operating_conditions(extended) {
            Ok(ocr) => ocr,
            Err(fault) => {
                return Err(self.fail_bringup(BringupStep::OperatingConditions, fault));
            }
        };

        // The card only honors the capacity request when it understood
        // CMD8, so CCS alone is not trusted.
        let high_capacity = extended && ocr.high_capacity();

        debug!("operating conditions settled, ocr = {:#010x}", ocr.0);

        // CMD2 moves the card into identification; the CID itself is not
        // interpreted here.
        if let Err(fault) = self.send_command(SdCmd::AllSendCid) {
            return Err(self.fail_bringup(BringupStep::Identification, fault));
        }

        let rca = match self.assign_address() {
            Ok(rca) => rca,
            Err(fault) => {
                return Err(self.fail_bringup(BringupStep::AddressAssignment, fault));
            }
        };

        debug!("assigned rca {:#06x}", rca);

        self.session = SessionState::Ready(Session { rca, high_capacity });

        // Negotiation is done; crank the bus up to the operating rate.
        self.host.set_clock_rate(ClockRate::Operational);

        // CMD7: "ok but not ready for data" is tolerated here.
        if let Err(fault) = self.command_type1(SdCmd::SelectCard(rca)) {
            return Err(self.fail_bringup(BringupStep::Selection, fault));
        }

        match self.command_type1(SdCmd::SetBlockLen(SD_BLOCK_LEN as u32)) {
            Ok(CardReady::Ready) => {}
            Ok(CardReady::NotReady) => {
                self.diag.report("BLKLEN");
                return Err(self.fail_bringup(BringupStep::BlockLength, Fault::UnexpectedCardState));
            }
            Err(fault) => {
                self.diag.report("BLKLEN");
                return Err(self.fail_bringup(BringupStep::BlockLength, fault));
            }
        }

        if wide_bus {
            if let Err(fault) = self.command_type1(SdCmd::SetBusWidth(BusWidth::Four)) {
                return Err(self.fail_bringup(BringupStep::BusWidth, fault));
            }

            self.host.set_bus_width(BusWidth::Four);
        }

        debug!("bring-up complete, high_capacity = {}", high_capacity);

        Ok(())
    }

    fn ready_session(&self) -> Result<Session, Fault> {
        match self.session {
            SessionState::Ready(session) => Ok(session),
            SessionState::Uninitialized => Err(Fault::Uninitialized),
            SessionState::Failed(step) => Err(Fault::BringupFailed { step }),
        }
    }

    /// Issue a type-1 command that must leave the card ready for data
    fn expect_ready(&mut self, cmd: SdCmd, tag: &str) -> Result<(), Fault> {
        match self.command_type1(cmd) {
            Ok(CardReady::Ready) => Ok(()),
            Ok(CardReady::NotReady) => {
                self.diag.report(tag);
                Err(Fault::UnexpectedCardState)
            }
            Err(fault) => {
                self.diag.report(tag);
                Err(fault)
            }
        }
    }

    /// Write `block_count` sectors starting at `sector_number`.
    ///
    /// `data` must hold at least `block_count * 512` bytes. The buffer does
    /// not need word alignment; unaligned buffers stream through a
    /// byte-granular DMA access pattern instead.
    pub fn write(&mut self, data: &[u8], sector_number: u32, block_count: u16) -> Result<(), Fault> {
        let session = self.ready_session()?;
        let address = translate_sector(&session, sector_number)?;

        let length = usize::from(block_count) * SD_BLOCK_LEN;
        let payload = &data[..length];

        self.wait_until_ready(session.rca)?;

        if block_count == 1 {
            self.expect_ready(SdCmd::WriteBlock(address), "WRCMD")?;
        } else {
            self.expect_ready(SdCmd::SetWrBlkEraseCount(block_count), "BLKCNT")?;
            self.expect_ready(SdCmd::WriteMultipleBlock(address), "WRMULTI")?;
        }

        let width = if aligned_for_words(payload) {
            DmaWidth::Word
        } else {
            DmaWidth::Byte
        };

        self.host.start_dma_write(payload, width);

        self.host.configure_data_path(&TransferConfig {
            direction: TransferDirection::ToCard,
            block_size_log2: SD_BLOCK_LEN_LOG2,
            length: length as u32,
            timeout: SD_DATA_TIMEOUT_CYCLES,
        });

        let result = loop {
            let status = self.host.status();

            if status.is_data_link_fault() {
                if status.contains(HostStatus::DATA_TIMEOUT) {
                    self.diag.report("DTM");
                } else if status.contains(HostStatus::CMD_TIMEOUT) {
                    self.diag.report("CTM");
                } else if status.contains(HostStatus::DATA_CRC_FAIL) {
                    self.diag.report("DCRCFAIL");
                } else {
                    self.diag.report("WFLAG");
                }

                warn!("sector write failed, status {:?}", status);

                break Err(Fault::PhysicalLayer);
            }

            if status.contains(HostStatus::DATA_END) {
                break Ok(());
            }
        };

        // The next operation needs a clean data path no matter how this
        // one went.
        self.host.stop_dma();
        self.host.clear_flags();

        if result.is_err() || block_count > 1 {
            // Best effort; the fault already in hand is the interesting one.
            let _ = self.command_type1(SdCmd::StopTransmission);
        }

        result
    }

    /// Read one sector into `data`, which must hold at least 512 bytes
    pub fn read(&mut self, data: &mut [u8], sector_number: u32) -> Result<(), Fault> {
        let session = self.ready_session()?;
        let address = translate_sector(&session, sector_number)?;

        self.wait_until_ready(session.rca)?;

        // The receive path must be armed before the card starts pushing.
        self.host.configure_data_path(&TransferConfig {
            direction: TransferDirection::FromCard,
            block_size_log2: SD_BLOCK_LEN_LOG2,
            length: SD_BLOCK_LEN as u32,
            timeout: SD_DATA_TIMEOUT_CYCLES,
        });

        // "Not ready for data" is tolerated; the transfer is already cued.
        if let Err(fault) = self.command_type1(SdCmd::ReadSingleBlock(address)) {
            self.diag.report("CMDFAIL");
            self.host.clear_flags();
            return Err(fault);
        }

        let mut remaining = WORDS_PER_BLOCK;
        let mut offset = 0usize;

        let result = loop {
            let status = self.host.status();

            if status.is_data_link_fault() {
                self.diag.report("FLAG");
                break Err(Fault::PhysicalLayer);
            }

            if status.contains(HostStatus::RX_FIFO_AVAILABLE) {
                if remaining == 0 {
                    self.diag.report("TOOMUCH");
                    break Err(Fault::Overrun);
                }

                remaining -= 1;

                // Little-endian unpack, a byte at a time, so the
                // destination does not need alignment.
                let word = self.host.read_fifo_word();
                data[offset..offset + 4].copy_from_slice(&word.to_le_bytes());
                offset += 4;
            } else if status.contains(HostStatus::DATA_BLOCK_END) {
                if remaining == 0 {
                    break Ok(());
                }

                // Finished before all the data arrived?
                self.diag.report("MISSING");
                break Err(Fault::ShortTransfer);
            }
        };

        self.host.clear_flags();

        if result.is_err() {
            let _ = self.command_type1(SdCmd::StopTransmission);
            self.diag.report("FAIL");
            warn!("sector read of {} failed: {:?}", sector_number, result);
        }

        result
    }
}
