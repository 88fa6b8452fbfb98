//! Sample records and their on-card encodings
//!
//! A [`SampleRecord`] is composed once per power tick and never modified
//! afterwards. It is written as one CSV row of the data log; valid fixes
//! also produce a compact line for the satellite fix log.

use core::fmt::Write;

use heapless::String;

use crate::gnss::{FixType, GnssData};
use crate::sensors::PowerReading;
use crate::time::{DateTime, TimeZone};

pub const CSV_HEADER: &str = "Timestamp_24H,System_Millis_ms,GNSS_Valid,Latitude_deg,Longitude_deg,Altitude_m,Satellites_Used,HDOP,Fix_Type,Solar_Voltage_V,Solar_Current_mA,Solar_Power_mW,Battery_Voltage_V,Battery_Current_mA,Battery_Power_mW,Load_Voltage_V,Load_Current_mA,Load_Power_mW,GNSS_Power_Est_mW,System_Efficiency_pct";

pub const MAX_ROW_LEN: usize = 320;
pub type CsvRow = String<MAX_ROW_LEN>;

/// `lat_e7,lon_e7,YYMMDD,HHMMSS` plus LF.
pub const MAX_FIX_LINE_LEN: usize = 48;
pub type FixLine = String<MAX_FIX_LINE_LEN>;

/// Where a timestamp's wall-clock fields came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampSource {
    Rtc,
    Gnss,
    #[default]
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    /// Local wall-clock time; `None` when neither clock could be read.
    pub local: Option<DateTime>,
    pub timezone: TimeZone,
    pub source: TimestampSource,
    /// Monotonic tick at capture. Used for all interval math.
    pub monotonic_ms: u32,
}

impl Timestamp {
    pub fn unavailable(monotonic_ms: u32, timezone: TimeZone) -> Self {
        Self {
            local: None,
            timezone,
            source: TimestampSource::Unavailable,
            monotonic_ms,
        }
    }

    pub fn tz_quarter_hours(&self) -> i8 {
        self.timezone.quarter_hours()
    }
}

/// GNSS fields of a record, present only when the receiver was read on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GnssSample {
    pub fix_type: FixType,
    pub satellites_used: u8,
    pub hdop: f32,
    /// Present only for a fix that passed validation.
    pub position: Option<FixPosition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FixPosition {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub altitude_m: f32,
}

impl GnssSample {
    pub fn from_data(data: &GnssData) -> Self {
        let position = data
            .position
            .filter(|_| data.validation_passed)
            .map(|p| FixPosition {
                latitude_deg: p.latitude_deg,
                longitude_deg: p.longitude_deg,
                altitude_m: p.altitude_m,
            });
        Self {
            fix_type: data.fix_type,
            satellites_used: data.satellites_used,
            hdop: data.hdop,
            position,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.position.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SampleRecord {
    pub timestamp: Timestamp,
    pub gnss: Option<GnssSample>,
    pub solar: PowerReading,
    pub battery: PowerReading,
    pub load: PowerReading,
    pub gnss_power_mw: f32,
    pub efficiency_pct: f32,
}

impl SampleRecord {
    pub fn gnss_valid(&self) -> bool {
        self.gnss.is_some_and(|g| g.is_valid())
    }

    /// One CSV row in [`CSV_HEADER`] order, LF-terminated. Position fields are
    /// empty without a valid fix; all six GNSS fields are empty when the
    /// receiver was not read on this tick.
    pub fn to_csv_row(&self) -> Result<CsvRow, core::fmt::Error> {
        let mut row = CsvRow::new();

        match self.timestamp.local {
            Some(t) => write!(row, "{}", t)?,
            None => row.push_str("0000-00-00 00:00:00").map_err(|_| core::fmt::Error)?,
        }
        write!(
            row,
            ",{},{}",
            self.timestamp.monotonic_ms,
            u8::from(self.gnss_valid())
        )?;

        match self.gnss.and_then(|g| g.position) {
            Some(p) => write!(
                row,
                ",{:.7},{:.7},{:.2}",
                p.latitude_deg, p.longitude_deg, p.altitude_m
            )?,
            None => row.push_str(",,,").map_err(|_| core::fmt::Error)?,
        }
        match self.gnss {
            Some(g) => write!(
                row,
                ",{},{:.2},{}",
                g.satellites_used,
                g.hdop,
                g.fix_type.code()
            )?,
            None => row.push_str(",,,").map_err(|_| core::fmt::Error)?,
        }

        for reading in [&self.solar, &self.battery, &self.load] {
            write!(
                row,
                ",{:.4},{:.2},{:.2}",
                reading.bus_voltage_v, reading.current_ma, reading.power_mw
            )?;
        }
        writeln!(row, ",{:.2},{:.1}", self.gnss_power_mw, self.efficiency_pct)?;
        Ok(row)
    }
}

fn round_e7(deg: f64) -> i32 {
    let scaled = deg * 1e7;
    if scaled >= 0.0 {
        (scaled + 0.5) as i32
    } else {
        (scaled - 0.5) as i32
    }
}

/// Compact fix-log line from a validated fix with valid UTC time, e.g.
/// `297604501,-953698204,250301,023000`.
pub fn fix_log_line(data: &GnssData) -> Option<FixLine> {
    if !data.validation_passed {
        return None;
    }
    let position = data.position?;
    let utc = data.time.filter(|t| t.is_valid())?.utc;

    let mut line = FixLine::new();
    writeln!(
        line,
        "{},{},{:02}{:02}{:02},{:02}{:02}{:02}",
        round_e7(position.latitude_deg),
        round_e7(position.longitude_deg),
        utc.year % 100,
        utc.month,
        utc.day,
        utc.hour,
        utc.minute,
        utc.second
    )
    .ok()?;
    Some(line)
}

/// Load power attributed to the receiver: load above the no-GNSS baseline, never negative.
pub fn gnss_power_estimate_mw(load_power_mw: f32, baseline_mw: Option<f32>) -> f32 {
    match baseline_mw {
        Some(baseline) if load_power_mw > baseline => load_power_mw - baseline,
        _ => 0.0,
    }
}

/// `100 * load / solar`, zero without solar input.
pub fn efficiency_pct(load_power_mw: f32, solar_power_mw: f32) -> f32 {
    if solar_power_mw > 0.0 {
        100.0 * load_power_mw / solar_power_mw
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gnss::{GnssTime, Position};

    fn reading(v: f32, ma: f32, mw: f32) -> PowerReading {
        PowerReading {
            bus_voltage_v: v,
            current_ma: ma,
            power_mw: mw,
        }
    }

    fn valid_data() -> GnssData {
        GnssData {
            monotonic_ms: 0,
            fix_type: FixType::Fix3D,
            satellites_used: 9,
            hdop: 0.9,
            pdop: 1.4,
            fix_ok: true,
            position: Some(Position {
                latitude_deg: 29.760_450_1,
                longitude_deg: -95.369_820_4,
                altitude_m: 12.5,
                ..Default::default()
            }),
            time: Some(GnssTime {
                utc: DateTime::new(2025, 3, 1, 2, 30, 0),
                date_valid: true,
                time_valid: true,
                ..Default::default()
            }),
            validation_passed: true,
        }
    }

    #[test]
    fn test_header_field_count() {
        assert_eq!(CSV_HEADER.split(',').count(), 20);
        assert!(!CSV_HEADER.contains(' '));
    }

    #[test]
    fn test_row_with_fix() {
        let record = SampleRecord {
            timestamp: Timestamp {
                local: Some(DateTime::new(2025, 2, 28, 20, 30, 0)),
                timezone: TimeZone::Cst,
                source: TimestampSource::Gnss,
                monotonic_ms: 123_456,
            },
            gnss: Some(GnssSample::from_data(&valid_data())),
            solar: reading(8.0, 250.0, 2000.0),
            battery: reading(3.7, -12.5, 46.25),
            load: reading(5.0, 100.0, 500.0),
            gnss_power_mw: 120.0,
            efficiency_pct: 25.0,
        };
        let row = record.to_csv_row().unwrap();
        assert_eq!(
            row.as_str(),
            "2025-02-28 20:30:00,123456,1,29.7604501,-95.3698204,12.50,9,0.90,3,\
             8.0000,250.00,2000.00,3.7000,-12.50,46.25,5.0000,100.00,500.00,120.00,25.0\n"
        );
        assert_eq!(row.split(',').count(), 20);
    }

    #[test]
    fn test_row_without_gnss_or_clock() {
        let record = SampleRecord {
            timestamp: Timestamp::unavailable(42, TimeZone::Cdt),
            ..Default::default()
        };
        let row = record.to_csv_row().unwrap();
        assert_eq!(
            row.as_str(),
            "0000-00-00 00:00:00,42,0,,,,,,,0.0000,0.00,0.00,0.0000,0.00,0.00,0.0000,0.00,0.00,0.00,0.0\n"
        );
    }

    #[test]
    fn test_rejected_fix_keeps_quality_fields() {
        let mut data = valid_data();
        data.validation_passed = false;
        let record = SampleRecord {
            gnss: Some(GnssSample::from_data(&data)),
            ..Default::default()
        };
        assert!(!record.gnss_valid());
        let row = record.to_csv_row().unwrap();
        assert!(row.starts_with("0000-00-00 00:00:00,0,0,,,,9,0.90,3,"), "{row}");
    }

    #[test]
    fn test_fix_log_line() {
        let line = fix_log_line(&valid_data()).unwrap();
        assert_eq!(line.as_str(), "297604501,-953698204,250301,023000\n");

        let mut rejected = valid_data();
        rejected.validation_passed = false;
        assert!(fix_log_line(&rejected).is_none());

        let mut no_time = valid_data();
        no_time.time = None;
        assert!(fix_log_line(&no_time).is_none());
    }

    #[test]
    fn test_derived_fields() {
        assert_eq!(efficiency_pct(500.0, 2000.0), 25.0);
        assert_eq!(efficiency_pct(500.0, 0.0), 0.0);
        assert_eq!(efficiency_pct(500.0, -1.0), 0.0);
        assert_eq!(gnss_power_estimate_mw(620.0, Some(500.0)), 120.0);
        assert_eq!(gnss_power_estimate_mw(480.0, Some(500.0)), 0.0);
        assert_eq!(gnss_power_estimate_mw(620.0, None), 0.0);
    }
}
