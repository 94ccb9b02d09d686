//! Floppy disk controller U8272 (NEC uPD765 compatible).
//!
//! # Register interface
//!
//! - **Main Status Register** (read-only)
//! - **Data Register** (read/write)
//! - **Terminal count** and **reset** lines, mapped to pseudo ports by the
//!   host system
//!
//! # State machine
//!
//! Idle → Command (CPU writes parameter bytes) → Execution (polled byte
//! transfer, non-DMA) → Result (CPU reads status bytes) → Idle.
//!
//! Commands execute instantly; the CPU polls the status register, so no
//! rotational timing is modelled. The drives are reached through a
//! [`DriveSelector`] passed into every access.

use crate::disk::{DriveSelector, FloppyDiskDrive, SectorId};

const CMD_SPECIFY: u8 = 0x03;
const CMD_SENSE_DRIVE: u8 = 0x04;
const CMD_WRITE_DATA: u8 = 0x05;
const CMD_READ_DATA: u8 = 0x06;
const CMD_RECALIBRATE: u8 = 0x07;
const CMD_SENSE_INTERRUPT: u8 = 0x08;
const CMD_READ_ID: u8 = 0x0A;
const CMD_FORMAT_TRACK: u8 = 0x0D;
const CMD_SEEK: u8 = 0x0F;

pub const MSR_RQM: u8 = 0x80;
pub const MSR_DIO: u8 = 0x40;
pub const MSR_EXM: u8 = 0x20;
pub const MSR_CB: u8 = 0x10;

const ST0_ABNORMAL: u8 = 0x40;
const ST0_INVALID: u8 = 0x80;
const ST0_SEEK_END: u8 = 0x20;
const ST0_NOT_READY: u8 = 0x08;

const ST1_END_OF_CYLINDER: u8 = 0x80;
const ST1_NO_DATA: u8 = 0x04;
const ST1_NOT_WRITABLE: u8 = 0x02;
const ST1_MISSING_AM: u8 = 0x01;

const ST3_WRITE_PROTECTED: u8 = 0x40;
const ST3_READY: u8 = 0x20;
const ST3_TRACK0: u8 = 0x10;
const ST3_TWO_SIDE: u8 = 0x08;

/// Steps a recalibrate issues before giving up.
const RECALIBRATE_STEPS: usize = 77;

/// Total command length including the command byte.
fn command_length(cmd: u8) -> usize {
    match cmd & 0x1F {
        CMD_SPECIFY => 3,
        CMD_SENSE_DRIVE => 2,
        CMD_WRITE_DATA | CMD_READ_DATA => 9,
        CMD_RECALIBRATE => 2,
        CMD_SENSE_INTERRUPT => 1,
        CMD_READ_ID => 2,
        CMD_FORMAT_TRACK => 6,
        CMD_SEEK => 3,
        _ => 1,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdcPhase {
    Idle,
    Command,
    Execution,
    Result,
}

/// Transfer in progress during the execution phase.
#[derive(Debug, Clone, PartialEq)]
enum Transfer {
    None,
    Read,
    Write,
    /// Collects 4 ID bytes per sector.
    Format { sectors: usize, filler: u8 },
}

/// Parameters of a READ DATA / WRITE DATA command.
#[derive(Debug, Clone, Copy, Default)]
struct RwParams {
    drive: usize,
    head: usize,
    multi_track: bool,
    c: u8,
    h: u8,
    r: u8,
    n: u8,
    eot: u8,
    dtl: u8,
}

impl RwParams {
    fn transfer_len(&self) -> usize {
        if self.n == 0 {
            self.dtl as usize
        } else {
            128usize << (self.n.min(7) as usize)
        }
    }
}

pub struct Fdc8272 {
    phase: FdcPhase,
    command: Vec<u8>,
    command_len: usize,
    transfer: Transfer,
    params: RwParams,
    /// Data being transferred in the execution phase.
    buf: Vec<u8>,
    buf_pos: usize,
    result: Vec<u8>,
    result_pos: usize,
    /// Present cylinder number per drive.
    pcn: [u8; 4],
    /// Pending seek results, reported by SENSE INTERRUPT STATUS.
    seek_status: Vec<u8>,
    interrupt: bool,
    /// Rotates through the IDs of a track for READ ID.
    id_index: usize,
}

impl Fdc8272 {
    pub fn new() -> Self {
        Self {
            phase: FdcPhase::Idle,
            command: Vec::with_capacity(9),
            command_len: 0,
            transfer: Transfer::None,
            params: RwParams::default(),
            buf: Vec::new(),
            buf_pos: 0,
            result: Vec::new(),
            result_pos: 0,
            pcn: [0; 4],
            seek_status: Vec::new(),
            interrupt: false,
            id_index: 0,
        }
    }

    /// Hardware reset: aborts any command. Drives keep their head position.
    pub fn reset(&mut self) {
        self.phase = FdcPhase::Idle;
        self.command.clear();
        self.transfer = Transfer::None;
        self.buf.clear();
        self.buf_pos = 0;
        self.result.clear();
        self.result_pos = 0;
        self.seek_status.clear();
        self.interrupt = false;
    }

    pub fn phase(&self) -> FdcPhase {
        self.phase
    }

    pub fn interrupt_pending(&self) -> bool {
        self.interrupt
    }

    pub fn read_main_status(&self) -> u8 {
        match self.phase {
            FdcPhase::Idle => MSR_RQM,
            FdcPhase::Command => MSR_RQM | MSR_CB,
            FdcPhase::Execution => match self.transfer {
                Transfer::Read => MSR_RQM | MSR_DIO | MSR_EXM | MSR_CB,
                _ => MSR_RQM | MSR_EXM | MSR_CB,
            },
            FdcPhase::Result => MSR_RQM | MSR_DIO | MSR_CB,
        }
    }

    pub fn read_data(&mut self, sel: &mut dyn DriveSelector) -> u8 {
        match self.phase {
            FdcPhase::Execution if self.transfer == Transfer::Read => {
                let value = self.buf.get(self.buf_pos).copied().unwrap_or(0xFF);
                self.buf_pos += 1;
                if self.buf_pos >= self.buf.len() {
                    self.next_read_sector(sel);
                }
                value
            }
            FdcPhase::Result => {
                let value = self.result.get(self.result_pos).copied().unwrap_or(0xFF);
                self.result_pos += 1;
                if self.result_pos >= self.result.len() {
                    self.phase = FdcPhase::Idle;
                    self.result.clear();
                    self.result_pos = 0;
                }
                value
            }
            _ => 0xFF,
        }
    }

    pub fn write_data(&mut self, sel: &mut dyn DriveSelector, value: u8) {
        match self.phase {
            FdcPhase::Idle => {
                self.command.clear();
                self.command.push(value);
                self.command_len = command_length(value);
                if self.command_len <= 1 {
                    self.execute_command(sel);
                } else {
                    self.phase = FdcPhase::Command;
                }
            }
            FdcPhase::Command => {
                self.command.push(value);
                if self.command.len() >= self.command_len {
                    self.execute_command(sel);
                }
            }
            FdcPhase::Execution => match self.transfer {
                Transfer::Write => {
                    if self.buf_pos < self.buf.len() {
                        self.buf[self.buf_pos] = value;
                        self.buf_pos += 1;
                    }
                    if self.buf_pos >= self.buf.len() {
                        self.finish_write_sector(sel);
                    }
                }
                Transfer::Format { sectors, filler } => {
                    self.buf.push(value);
                    if self.buf.len() >= sectors * 4 {
                        self.finish_format(sel, filler);
                    }
                }
                _ => {}
            },
            FdcPhase::Result => {}
        }
    }

    /// Terminal count: ends a multi-sector transfer after the current byte.
    pub fn terminal_count(&mut self, sel: &mut dyn DriveSelector) {
        if self.phase != FdcPhase::Execution {
            return;
        }
        match self.transfer {
            Transfer::Read => {
                let p = self.params;
                let r = if self.buf_pos > 0 { p.r.wrapping_add(1) } else { p.r };
                self.set_rw_result(p.drive, p.head, 0, 0, r);
            }
            Transfer::Write => {
                // an interrupted sector is completed with zeros
                if self.buf_pos > 0 {
                    self.buf[self.buf_pos..].fill(0);
                    if !self.store_sector(sel) {
                        return;
                    }
                }
                let p = self.params;
                let r = if self.buf_pos > 0 { p.r.wrapping_add(1) } else { p.r };
                self.set_rw_result(p.drive, p.head, 0, 0, r);
            }
            _ => {}
        }
    }

    fn execute_command(&mut self, sel: &mut dyn DriveSelector) {
        let cmd = self.command[0];
        log::trace!("FDC command {:02X?}", self.command);
        match cmd & 0x1F {
            CMD_SPECIFY => self.phase = FdcPhase::Idle,
            CMD_SENSE_DRIVE => self.exec_sense_drive(sel),
            CMD_RECALIBRATE => self.exec_seek(sel, None),
            CMD_SEEK => {
                let ncn = self.command[2];
                self.exec_seek(sel, Some(ncn));
            }
            CMD_SENSE_INTERRUPT => self.exec_sense_interrupt(),
            CMD_READ_DATA => self.exec_read_data(sel),
            CMD_WRITE_DATA => self.exec_write_data(sel),
            CMD_READ_ID => self.exec_read_id(sel),
            CMD_FORMAT_TRACK => self.exec_format(sel),
            _ => self.set_result(vec![ST0_INVALID]),
        }
    }

    fn set_result(&mut self, result: Vec<u8>) {
        self.transfer = Transfer::None;
        self.result = result;
        self.result_pos = 0;
        self.phase = FdcPhase::Result;
    }

    fn unit_head(&self) -> (usize, usize) {
        let b = self.command.get(1).copied().unwrap_or(0);
        ((b & 0x03) as usize, ((b >> 2) & 0x01) as usize)
    }

    fn st0_base(drive: usize, head: usize) -> u8 {
        (drive as u8) | ((head as u8) << 2)
    }

    fn set_rw_result(&mut self, drive: usize, head: usize, st0: u8, st1: u8, r: u8) {
        let p = self.params;
        self.interrupt = true;
        self.set_result(vec![
            Self::st0_base(drive, head) | st0,
            st1,
            0,
            p.c,
            p.h,
            r,
            p.n,
        ]);
    }

    fn fail(&mut self, st0: u8, st1: u8) {
        let p = self.params;
        self.set_rw_result(p.drive, p.head, ST0_ABNORMAL | st0, st1, p.r);
    }

    fn exec_sense_drive(&mut self, sel: &mut dyn DriveSelector) {
        let (drive, head) = self.unit_head();
        let mut st3 = Self::st0_base(drive, head);
        if let Some(d) = sel.floppy_disk_drive(drive) {
            if d.is_ready() {
                st3 |= ST3_READY;
                if d.disk().is_some_and(|disk| disk.sides() > 1) {
                    st3 |= ST3_TWO_SIDE;
                }
            }
            if d.is_read_only() {
                st3 |= ST3_WRITE_PROTECTED;
            }
            if d.is_track0() {
                st3 |= ST3_TRACK0;
            }
        }
        self.set_result(vec![st3]);
    }

    fn exec_seek(&mut self, sel: &mut dyn DriveSelector, target: Option<u8>) {
        let (drive, _) = self.unit_head();
        let mut st0 = ST0_SEEK_END | drive as u8;
        match sel.floppy_disk_drive(drive) {
            Some(d) => match target {
                Some(ncn) => {
                    let pcn = self.pcn[drive];
                    let outward = ncn < pcn;
                    for _ in 0..pcn.abs_diff(ncn) {
                        d.seek_step(outward);
                    }
                    self.pcn[drive] = ncn;
                }
                None => {
                    for _ in 0..RECALIBRATE_STEPS {
                        if d.is_track0() {
                            break;
                        }
                        d.seek_step(true);
                    }
                    if !d.is_track0() {
                        st0 |= ST0_ABNORMAL;
                    }
                    self.pcn[drive] = 0;
                }
            },
            None => st0 |= ST0_ABNORMAL | ST0_NOT_READY,
        }
        self.seek_status.push(st0);
        self.interrupt = true;
        self.phase = FdcPhase::Idle;
    }

    fn exec_sense_interrupt(&mut self) {
        if self.seek_status.is_empty() {
            self.set_result(vec![ST0_INVALID]);
        } else {
            let st0 = self.seek_status.remove(0);
            let pcn = self.pcn[(st0 & 0x03) as usize];
            self.set_result(vec![st0, pcn]);
        }
        self.interrupt = !self.seek_status.is_empty();
    }

    fn rw_params(&self) -> RwParams {
        let (drive, head) = self.unit_head();
        let c = &self.command;
        RwParams {
            drive,
            head,
            multi_track: c[0] & 0x80 != 0,
            c: c[2],
            h: c[3],
            r: c[4],
            n: c[5],
            eot: c[6],
            dtl: c[8],
        }
    }

    fn ready_drive<'a>(
        sel: &'a mut dyn DriveSelector,
        drive: usize,
    ) -> Option<&'a mut FloppyDiskDrive> {
        sel.floppy_disk_drive(drive).filter(|d| d.is_ready())
    }

    fn sector_id(&self) -> SectorId {
        let p = &self.params;
        SectorId::new(p.c, p.h, p.r, p.n)
    }

    fn exec_read_data(&mut self, sel: &mut dyn DriveSelector) {
        self.params = self.rw_params();
        self.load_read_sector(sel);
    }

    /// Fill the transfer buffer with the sector addressed by the parameters.
    fn load_read_sector(&mut self, sel: &mut dyn DriveSelector) {
        let p = self.params;
        let id = self.sector_id();
        let Some(drive) = Self::ready_drive(sel, p.drive) else {
            self.fail(ST0_NOT_READY, 0);
            return;
        };
        let data = match drive.find_sector(p.head, id) {
            Some(s) if !s.error => {
                let mut data = s.data.to_vec();
                data.resize(p.transfer_len(), 0);
                data
            }
            Some(_) => {
                self.fail(0, ST1_NO_DATA | ST1_MISSING_AM);
                return;
            }
            None => {
                self.fail(0, ST1_NO_DATA);
                return;
            }
        };
        self.buf = data;
        self.buf_pos = 0;
        self.transfer = Transfer::Read;
        self.phase = FdcPhase::Execution;
    }

    /// Advance R after a transferred sector; ends at EOT.
    fn advance_sector(&mut self) -> bool {
        if self.params.r >= self.params.eot {
            if self.params.multi_track && self.params.head == 0 {
                self.params.head = 1;
                self.params.h = 1;
                self.params.r = 1;
                return true;
            }
            return false;
        }
        self.params.r += 1;
        true
    }

    fn next_read_sector(&mut self, sel: &mut dyn DriveSelector) {
        if self.advance_sector() {
            self.load_read_sector(sel);
        } else {
            let p = self.params;
            self.set_rw_result(p.drive, p.head, ST0_ABNORMAL, ST1_END_OF_CYLINDER, p.r);
        }
    }

    fn exec_write_data(&mut self, sel: &mut dyn DriveSelector) {
        self.params = self.rw_params();
        self.prepare_write_sector(sel);
    }

    fn prepare_write_sector(&mut self, sel: &mut dyn DriveSelector) {
        let p = self.params;
        let id = self.sector_id();
        let Some(drive) = Self::ready_drive(sel, p.drive) else {
            self.fail(ST0_NOT_READY, 0);
            return;
        };
        if drive.is_read_only() {
            self.fail(0, ST1_NOT_WRITABLE);
            return;
        }
        if drive.find_sector(p.head, id).is_none() {
            self.fail(0, ST1_NO_DATA);
            return;
        }
        self.buf = vec![0; p.transfer_len()];
        self.buf_pos = 0;
        self.transfer = Transfer::Write;
        self.phase = FdcPhase::Execution;
    }

    /// Write the buffer to the current sector; on failure the result phase is entered.
    fn store_sector(&mut self, sel: &mut dyn DriveSelector) -> bool {
        let p = self.params;
        let id = self.sector_id();
        let Some(drive) = Self::ready_drive(sel, p.drive) else {
            self.fail(ST0_NOT_READY, 0);
            return false;
        };
        let Some(key) = drive.find_sector(p.head, id).map(|s| s.key()) else {
            self.fail(0, ST1_NO_DATA);
            return false;
        };
        if !drive.write_sector(key, &self.buf, false) {
            self.fail(0, ST1_NOT_WRITABLE);
            return false;
        }
        true
    }

    fn finish_write_sector(&mut self, sel: &mut dyn DriveSelector) {
        if !self.store_sector(sel) {
            return;
        }
        if self.advance_sector() {
            self.prepare_write_sector(sel);
        } else {
            let p = self.params;
            self.set_rw_result(p.drive, p.head, ST0_ABNORMAL, ST1_END_OF_CYLINDER, p.r);
        }
    }

    fn exec_read_id(&mut self, sel: &mut dyn DriveSelector) {
        let (drive, head) = self.unit_head();
        self.params = RwParams {
            drive,
            head,
            ..RwParams::default()
        };
        let Some(d) = Self::ready_drive(sel, drive) else {
            self.fail(ST0_NOT_READY, 0);
            return;
        };
        let count = d.sector_count(head);
        if count == 0 {
            self.fail(0, ST1_MISSING_AM);
            return;
        }
        let index = self.id_index % count;
        self.id_index = self.id_index.wrapping_add(1);
        match d.sector_by_index(head, index).map(|s| s.id) {
            Some(id) => {
                self.interrupt = true;
                self.set_result(vec![
                    Self::st0_base(drive, head),
                    0,
                    0,
                    id.cyl,
                    id.head,
                    id.sector,
                    id.size_code,
                ]);
            }
            None => self.fail(0, ST1_MISSING_AM),
        }
    }

    fn exec_format(&mut self, sel: &mut dyn DriveSelector) {
        let (drive, head) = self.unit_head();
        let n = self.command[2];
        let sectors = self.command[3] as usize;
        let filler = self.command[5];
        self.params = RwParams {
            drive,
            head,
            n,
            ..RwParams::default()
        };
        let Some(d) = Self::ready_drive(sel, drive) else {
            self.fail(ST0_NOT_READY, 0);
            return;
        };
        if d.is_read_only() {
            self.fail(0, ST1_NOT_WRITABLE);
            return;
        }
        if sectors == 0 {
            self.set_rw_result(drive, head, 0, 0, 0);
            return;
        }
        self.buf.clear();
        self.transfer = Transfer::Format { sectors, filler };
        self.phase = FdcPhase::Execution;
    }

    fn finish_format(&mut self, sel: &mut dyn DriveSelector, filler: u8) {
        let p = self.params;
        let ids: Vec<SectorId> = self
            .buf
            .chunks_exact(4)
            .map(|b| SectorId::new(b[0], b[1], b[2], b[3]))
            .collect();
        let data = vec![filler; 128usize << (p.n.min(7) as usize)];
        let ok = Self::ready_drive(sel, p.drive)
            .is_some_and(|d| d.format_track(p.head, &ids, &data));
        if ok {
            self.set_rw_result(p.drive, p.head, 0, 0, 0);
        } else {
            self.fail(0, ST1_NOT_WRITABLE);
        }
    }
}

impl Default for Fdc8272 {
    fn default() -> Self {
        Self::new()
    }
}
