//! UBX protocol glue over the `ublox` crate
//!
//! Incoming frames are checked and decoded by [`ublox::Parser`]; the driver
//! keeps plain copies of the fields it uses so a solution outlives the
//! receive buffer. Configuration messages come from the crate's builders
//! except CFG-PRT for the DDC port and CFG-CFG, which it has no builder for.

use alloc::vec::Vec;

use log::debug;
use ublox::{
    AlignmentToReferenceTime, CfgMsgAllPortsBuilder, CfgNav5Builder, CfgNav5Params, CfgRate,
    CfgRateBuilder, CfgNav5DynModel, NavDop, NavHpPosLlh, NavPvt, PacketRef, Parser, ParserError,
    UbxPacketRequest,
};

pub const SYNC_1: u8 = 0xB5;
pub const SYNC_2: u8 = 0x62;

pub const CLASS_NAV: u8 = 0x01;
pub const CLASS_ACK: u8 = 0x05;
pub const CLASS_CFG: u8 = 0x06;

pub const NAV_DOP: u8 = 0x04;
pub const NAV_PVT: u8 = 0x07;
pub const NAV_HPPOSLLH: u8 = 0x14;
pub const ACK_NAK: u8 = 0x00;
pub const ACK_ACK: u8 = 0x01;
pub const CFG_PRT: u8 = 0x00;
pub const CFG_MSG: u8 = 0x01;
pub const CFG_RATE: u8 = 0x08;
pub const CFG_CFG: u8 = 0x09;
pub const CFG_NAV5: u8 = 0x24;

/// Newest NAV-PVT, copied out of the parser's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PvtSolution {
    pub itow_ms: u32,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    /// bit0 validDate, bit1 validTime, bit2 fullyResolved
    pub valid: u8,
    pub nano: i32,
    pub fix_type: u8,
    /// bit0 gnssFixOK
    pub flags: u8,
    /// bit6 confirmedDate, bit7 confirmedTime
    pub flags2: u8,
    pub num_sv: u8,
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub height_msl_m: f64,
    pub h_acc_mm: u32,
    pub v_acc_mm: u32,
}

impl PvtSolution {
    pub fn date_valid(&self) -> bool {
        self.valid & 0x01 != 0
    }

    pub fn time_valid(&self) -> bool {
        self.valid & 0x02 != 0
    }

    pub fn fully_resolved(&self) -> bool {
        self.valid & 0x04 != 0
    }

    pub fn fix_ok(&self) -> bool {
        self.flags & 0x01 != 0
    }

    pub fn confirmed_date(&self) -> bool {
        self.flags2 & 0x40 != 0
    }

    pub fn confirmed_time(&self) -> bool {
        self.flags2 & 0x80 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DopSolution {
    pub itow_ms: u32,
    pub pdop: f32,
    pub hdop: f32,
}

/// NAV-HPPOSLLH position with the 1e-9 degree components folded in.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HpPosition {
    pub itow_ms: u32,
    pub latitude_deg: f64,
    pub longitude_deg: f64,
}

/// A decoded message the driver cares about.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UbxEvent {
    Pvt(PvtSolution),
    Dop(DopSolution),
    HpPosition(HpPosition),
    Ack { class: u8, id: u8, acked: bool },
    /// CFG-RATE poll answer: measurement rate in ms and navigation rate.
    Rate(u16, u16),
}

impl UbxEvent {
    fn from_packet(packet: PacketRef<'_>) -> Option<Self> {
        let event = match packet {
            PacketRef::NavPvt(pvt) => UbxEvent::Pvt(PvtSolution {
                itow_ms: pvt.itow(),
                year: pvt.year(),
                month: pvt.month(),
                day: pvt.day(),
                hour: pvt.hour(),
                minute: pvt.min(),
                second: pvt.sec(),
                valid: pvt.valid(),
                nano: pvt.nanosecond(),
                fix_type: pvt.fix_type() as u8,
                flags: pvt.flags().bits(),
                flags2: pvt.flags2().bits(),
                num_sv: pvt.num_satellites(),
                latitude_deg: pvt.lat_degrees(),
                longitude_deg: pvt.lon_degrees(),
                height_msl_m: pvt.height_msl(),
                h_acc_mm: pvt.horiz_accuracy(),
                v_acc_mm: pvt.vert_accuracy(),
            }),
            PacketRef::NavDop(dop) => UbxEvent::Dop(DopSolution {
                itow_ms: dop.itow(),
                pdop: dop.position_dop(),
                hdop: dop.horizontal_dop(),
            }),
            PacketRef::NavHpPosLlh(hp) => UbxEvent::HpPosition(HpPosition {
                itow_ms: hp.itow(),
                latitude_deg: hp.lat_degrees() + hp.lat_hp_degrees(),
                longitude_deg: hp.lon_degrees() + hp.lon_hp_degrees(),
            }),
            PacketRef::AckAck(ack) => UbxEvent::Ack {
                class: ack.class(),
                id: ack.msg_id(),
                acked: true,
            },
            PacketRef::AckNak(nak) => UbxEvent::Ack {
                class: nak.class(),
                id: nak.msg_id(),
                acked: false,
            },
            PacketRef::CfgRate(rate) => UbxEvent::Rate(rate.measure_rate_ms(), rate.nav_rate()),
            _ => return None,
        };
        Some(event)
    }
}

/// Streaming decoder. Bytes between frames (NMEA, DDC idle 0xFF) are skipped.
#[derive(Default)]
pub struct UbxDecoder {
    parser: Parser<Vec<u8>>,
    checksum_errors: u32,
}

impl UbxDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checksum_errors(&self) -> u32 {
        self.checksum_errors
    }

    /// Feed received bytes; `sink` sees every complete message we use.
    pub fn feed(&mut self, bytes: &[u8], mut sink: impl FnMut(UbxEvent)) {
        let mut packets = self.parser.consume(bytes);
        while let Some(result) = packets.next() {
            match result {
                Ok(packet) => {
                    if let Some(event) = UbxEvent::from_packet(packet) {
                        sink(event);
                    }
                }
                Err(ParserError::InvalidChecksum { .. }) => self.checksum_errors += 1,
                Err(e) => debug!("u-blox: dropped frame: {:?}", e),
            }
        }
    }
}

/// 8-bit Fletcher checksum over `bytes`.
pub fn checksum(bytes: &[u8]) -> (u8, u8) {
    bytes.iter().fold((0u8, 0u8), |(a, b), &byte| {
        let a = a.wrapping_add(byte);
        (a, b.wrapping_add(a))
    })
}

/// Frame a payload for the messages the `ublox` crate does not build.
pub fn frame(class: u8, id: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(&[SYNC_1, SYNC_2, class, id]);
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    let (ck_a, ck_b) = checksum(&frame[2..]);
    frame.push(ck_a);
    frame.push(ck_b);
    frame
}

/// CFG-PRT for the DDC (I2C) port: UBX in and out only, NMEA off.
pub fn cfg_prt_ddc(address: u8) -> Vec<u8> {
    let mut p = [0u8; 20];
    let mode = u32::from(address) << 1;
    p[4..8].copy_from_slice(&mode.to_le_bytes());
    p[12..14].copy_from_slice(&0x0001u16.to_le_bytes());
    p[14..16].copy_from_slice(&0x0001u16.to_le_bytes());
    frame(CLASS_CFG, CFG_PRT, &p)
}

/// CFG-CFG that clears saved configuration and reloads defaults.
pub fn cfg_cfg_factory_reset() -> Vec<u8> {
    let mut p = [0u8; 12];
    p[0..4].copy_from_slice(&0x0000_FFFFu32.to_le_bytes());
    p[8..12].copy_from_slice(&0x0000_FFFFu32.to_le_bytes());
    frame(CLASS_CFG, CFG_CFG, &p)
}

/// CFG-MSG enabling one output per navigation solution on the DDC port only.
pub fn cfg_msg_ddc(id: u8) -> Vec<u8> {
    const DDC_ONLY: [u8; 6] = [1, 0, 0, 0, 0, 0];
    let frame = match id {
        NAV_PVT => CfgMsgAllPortsBuilder::set_rate_for::<NavPvt>(DDC_ONLY).into_packet_bytes(),
        NAV_DOP => CfgMsgAllPortsBuilder::set_rate_for::<NavDop>(DDC_ONLY).into_packet_bytes(),
        _ => CfgMsgAllPortsBuilder::set_rate_for::<NavHpPosLlh>(DDC_ONLY).into_packet_bytes(),
    };
    frame.to_vec()
}

/// CFG-RATE, aligned to GPS time.
pub fn cfg_rate(measurement_rate_ms: u16, navigation_rate: u16) -> Vec<u8> {
    CfgRateBuilder {
        measure_rate_ms: measurement_rate_ms,
        nav_rate: navigation_rate,
        time_ref: AlignmentToReferenceTime::Gps,
    }
    .into_packet_bytes()
    .to_vec()
}

pub fn cfg_rate_poll() -> Vec<u8> {
    UbxPacketRequest::request_for::<CfgRate>()
        .into_packet_bytes()
        .to_vec()
}

/// CFG-NAV5 applying only the dynamic model, set to portable.
pub fn cfg_nav5_portable() -> Vec<u8> {
    CfgNav5Builder {
        mask: CfgNav5Params::DYN,
        dyn_model: CfgNav5DynModel::Portable,
        ..CfgNav5Builder::default()
    }
    .into_packet_bytes()
    .to_vec()
}
