use alloc::collections::{BTreeMap, BTreeSet, VecDeque};

use super::bus::SimDevice;
use super::round_f64;
use crate::gnss::ubx;
use crate::time::DateTime;

const REG_BYTES_AVAILABLE: u8 = 0xFD;
const REG_DATA_STREAM: u8 = 0xFF;

const NAV_PVT_LEN: usize = 92;
const NAV_DOP_LEN: usize = 18;
const NAV_HPPOSLLH_LEN: usize = 36;

/// One navigation epoch to publish from [`SimUblox`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimFix {
    /// `None` publishes the epoch with date and time flagged invalid.
    pub utc: Option<DateTime>,
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub altitude_m: f64,
    pub satellites: u8,
    pub hdop: f32,
    /// Raw UBX fix type (0 none, 2 2D, 3 3D, 5 time only).
    pub fix_type: u8,
}

impl SimFix {
    /// A healthy 3D fix with nine satellites and HDOP 0.9.
    pub fn at(utc: DateTime, latitude_deg: f64, longitude_deg: f64) -> Self {
        Self {
            utc: Some(utc),
            latitude_deg,
            longitude_deg,
            altitude_m: 12.5,
            satellites: 9,
            hdop: 0.9,
            fix_type: 3,
        }
    }

    fn has_position(&self) -> bool {
        (2..=4).contains(&self.fix_type)
    }

    fn h_dop(&self) -> u16 {
        round_f64(f64::from(self.hdop) * 100.0) as u16
    }

    fn p_dop(&self) -> u16 {
        round_f64(f64::from(self.hdop) * 150.0) as u16
    }

    /// NAV-PVT payload for this epoch.
    pub fn nav_pvt(&self, itow_ms: u32) -> [u8; NAV_PVT_LEN] {
        let utc = self.utc.unwrap_or_default();
        let (lat, _) = split_hp(self.latitude_deg);
        let (lon, _) = split_hp(self.longitude_deg);
        let h_msl_mm = round_f64(self.altitude_m * 1000.0) as i32;

        let mut p = [0u8; NAV_PVT_LEN];
        p[0..4].copy_from_slice(&itow_ms.to_le_bytes());
        p[4..6].copy_from_slice(&utc.year.to_le_bytes());
        p[6] = utc.month;
        p[7] = utc.day;
        p[8] = utc.hour;
        p[9] = utc.minute;
        p[10] = utc.second;
        // validDate | validTime | fullyResolved
        p[11] = if self.utc.is_some() { 0x07 } else { 0x00 };
        p[20] = self.fix_type;
        p[21] = u8::from(self.has_position());
        // confirmedAvai | confirmedDate | confirmedTime
        p[22] = if self.utc.is_some() { 0xE0 } else { 0x00 };
        p[23] = self.satellites;
        p[24..28].copy_from_slice(&lon.to_le_bytes());
        p[28..32].copy_from_slice(&lat.to_le_bytes());
        p[32..36].copy_from_slice(&h_msl_mm.to_le_bytes());
        p[36..40].copy_from_slice(&h_msl_mm.to_le_bytes());
        p[40..44].copy_from_slice(&1_800u32.to_le_bytes());
        p[44..48].copy_from_slice(&2_400u32.to_le_bytes());
        p[76..78].copy_from_slice(&self.p_dop().to_le_bytes());
        p
    }

    /// NAV-DOP payload for this epoch.
    pub fn nav_dop(&self, itow_ms: u32) -> [u8; NAV_DOP_LEN] {
        let (h_dop, p_dop) = (self.h_dop(), self.p_dop());
        let mut p = [0u8; NAV_DOP_LEN];
        p[0..4].copy_from_slice(&itow_ms.to_le_bytes());
        for (at, dop) in [(4, p_dop), (6, p_dop), (8, h_dop), (10, h_dop), (12, h_dop)] {
            p[at..at + 2].copy_from_slice(&dop.to_le_bytes());
        }
        p
    }

    /// NAV-HPPOSLLH payload for this epoch.
    pub fn nav_hpposllh(&self, itow_ms: u32) -> [u8; NAV_HPPOSLLH_LEN] {
        let (lat, lat_hp) = split_hp(self.latitude_deg);
        let (lon, lon_hp) = split_hp(self.longitude_deg);
        let h_msl_mm = round_f64(self.altitude_m * 1000.0) as i32;

        let mut p = [0u8; NAV_HPPOSLLH_LEN];
        p[3] = u8::from(!self.has_position());
        p[4..8].copy_from_slice(&itow_ms.to_le_bytes());
        p[8..12].copy_from_slice(&lon.to_le_bytes());
        p[12..16].copy_from_slice(&lat.to_le_bytes());
        p[16..20].copy_from_slice(&h_msl_mm.to_le_bytes());
        p[20..24].copy_from_slice(&h_msl_mm.to_le_bytes());
        p[24] = lon_hp as u8;
        p[25] = lat_hp as u8;
        p[28..32].copy_from_slice(&18_000u32.to_le_bytes());
        p[32..36].copy_from_slice(&24_000u32.to_le_bytes());
        p
    }
}

/// Split degrees into the 1e-7 base value and the 1e-9 high-precision part.
fn split_hp(deg: f64) -> (i32, i8) {
    let nano = round_f64(deg * 1e9);
    ((nano / 100) as i32, (nano % 100) as i8)
}

/// `(class, id, payload)` of one whole frame with a good checksum.
fn unframe(bytes: &[u8]) -> Option<(u8, u8, &[u8])> {
    let [ubx::SYNC_1, ubx::SYNC_2, class, id, len_lo, len_hi, rest @ ..] = bytes else {
        return None;
    };
    let len = usize::from(u16::from_le_bytes([*len_lo, *len_hi]));
    if rest.len() < len + 2 {
        return None;
    }
    let (ck_a, ck_b) = ubx::checksum(&bytes[2..6 + len]);
    (rest[len] == ck_a && rest[len + 1] == ck_b).then_some((*class, *id, &rest[..len]))
}

/// u-blox receiver model on the DDC port. Accepts UBX configuration,
/// answers with ACK/NAK, and streams whatever epochs the test publishes.
pub struct SimUblox {
    pointer: u8,
    outbound: VecDeque<u8>,
    ubx_only: bool,
    enabled: BTreeSet<(u8, u8)>,
    rate: (u16, u16),
    dynamic_model: Option<u8>,
    config_counts: BTreeMap<u8, u32>,
    rejected: BTreeSet<u8>,
    itow_ms: u32,
}

impl Default for SimUblox {
    fn default() -> Self {
        Self::new()
    }
}

impl SimUblox {
    pub fn new() -> Self {
        Self {
            pointer: REG_DATA_STREAM,
            outbound: VecDeque::new(),
            ubx_only: false,
            enabled: BTreeSet::new(),
            rate: (1000, 1),
            dynamic_model: None,
            config_counts: BTreeMap::new(),
            rejected: BTreeSet::new(),
            itow_ms: 0,
        }
    }

    pub fn ubx_only(&self) -> bool {
        self.ubx_only
    }

    pub fn message_enabled(&self, class: u8, id: u8) -> bool {
        self.enabled.contains(&(class, id))
    }

    pub fn dynamic_model(&self) -> Option<u8> {
        self.dynamic_model
    }

    pub fn rate(&self) -> (u16, u16) {
        self.rate
    }

    /// How many CFG messages with this id were applied (or rejected).
    pub fn config_count(&self, id: u8) -> u32 {
        self.config_counts.get(&id).copied().unwrap_or(0)
    }

    /// NAK every future CFG message with this id.
    pub fn reject(&mut self, id: u8) {
        self.rejected.insert(id);
    }

    pub fn pending_bytes(&self) -> usize {
        self.outbound.len()
    }

    /// Queue one epoch: NAV-DOP, NAV-PVT and NAV-HPPOSLLH, each only if enabled.
    pub fn publish_fix(&mut self, fix: &SimFix) {
        self.itow_ms = self.itow_ms.wrapping_add(1000);
        let itow = self.itow_ms;

        if self.message_enabled(ubx::CLASS_NAV, ubx::NAV_DOP) {
            self.enqueue(ubx::CLASS_NAV, ubx::NAV_DOP, &fix.nav_dop(itow));
        }
        if self.message_enabled(ubx::CLASS_NAV, ubx::NAV_PVT) {
            self.enqueue(ubx::CLASS_NAV, ubx::NAV_PVT, &fix.nav_pvt(itow));
        }
        if self.message_enabled(ubx::CLASS_NAV, ubx::NAV_HPPOSLLH) {
            self.enqueue(ubx::CLASS_NAV, ubx::NAV_HPPOSLLH, &fix.nav_hpposllh(itow));
        }
    }

    /// Queue raw bytes, e.g. NMEA noise or a corrupted frame.
    pub fn inject_raw(&mut self, bytes: &[u8]) {
        self.outbound.extend(bytes.iter().copied());
    }

    fn enqueue(&mut self, class: u8, id: u8, payload: &[u8]) {
        self.outbound.extend(ubx::frame(class, id, payload));
    }

    fn ack(&mut self, id: u8, acked: bool) {
        let ack = if acked { ubx::ACK_ACK } else { ubx::ACK_NAK };
        self.enqueue(ubx::CLASS_ACK, ack, &[ubx::CLASS_CFG, id]);
    }

    fn handle(&mut self, class: u8, id: u8, p: &[u8]) {
        if class != ubx::CLASS_CFG {
            return;
        }

        if id == ubx::CFG_RATE && p.is_empty() {
            let (meas, nav) = self.rate;
            let mut answer = [0u8; 6];
            answer[0..2].copy_from_slice(&meas.to_le_bytes());
            answer[2..4].copy_from_slice(&nav.to_le_bytes());
            // aligned to GPS time
            answer[4] = 1;
            self.enqueue(ubx::CLASS_CFG, ubx::CFG_RATE, &answer);
            self.ack(ubx::CFG_RATE, true);
            return;
        }

        *self.config_counts.entry(id).or_insert(0) += 1;
        if self.rejected.contains(&id) {
            self.ack(id, false);
            return;
        }

        match id {
            ubx::CFG_PRT if p.len() >= 16 => {
                let in_proto = u16::from_le_bytes([p[12], p[13]]);
                let out_proto = u16::from_le_bytes([p[14], p[15]]);
                self.ubx_only = in_proto == 0x0001 && out_proto == 0x0001;
            }
            // Single-port form carries one rate, the all-ports form starts
            // with the DDC port's.
            ubx::CFG_MSG if p.len() >= 3 => {
                if p[2] > 0 {
                    self.enabled.insert((p[0], p[1]));
                } else {
                    self.enabled.remove(&(p[0], p[1]));
                }
            }
            ubx::CFG_RATE if p.len() >= 4 => {
                self.rate = (
                    u16::from_le_bytes([p[0], p[1]]),
                    u16::from_le_bytes([p[2], p[3]]),
                );
            }
            ubx::CFG_NAV5 if p.len() >= 3 => {
                if p[0] & 0x01 != 0 {
                    self.dynamic_model = Some(p[2]);
                }
            }
            ubx::CFG_CFG => {
                self.ubx_only = false;
                self.enabled.clear();
                self.rate = (1000, 1);
                self.dynamic_model = None;
            }
            _ => {}
        }
        self.ack(id, true);
    }
}

impl SimDevice for SimUblox {
    /// The driver writes each frame in a single transaction.
    fn write(&mut self, data: &[u8]) -> bool {
        match data.len() {
            0 => {}
            1 => self.pointer = data[0],
            _ => {
                if let Some((class, id, payload)) = unframe(data) {
                    self.handle(class, id, payload);
                }
            }
        }
        true
    }

    fn read(&mut self, buf: &mut [u8]) -> bool {
        match self.pointer {
            REG_BYTES_AVAILABLE => {
                let available = self.outbound.len().min(usize::from(u16::MAX)) as u64;
                super::put_be(buf, available);
            }
            _ => {
                for b in buf.iter_mut() {
                    *b = self.outbound.pop_front().unwrap_or(0xFF);
                }
            }
        }
        true
    }
}
