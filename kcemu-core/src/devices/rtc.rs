//! Real time clock (RTC 72421 style, 16 nibble registers).
//!
//! | Reg | Content        | Reg | Content         |
//! |-----|----------------|-----|-----------------|
//! | 0   | seconds, ones  | 8   | month, ones     |
//! | 1   | seconds, tens  | 9   | month, tens     |
//! | 2   | minutes, ones  | 10  | year, ones      |
//! | 3   | minutes, tens  | 11  | year, tens      |
//! | 4   | hours, ones    | 12  | weekday (0=Sun) |
//! | 5   | hours, tens    | 13  | control D       |
//! | 6   | day, ones      | 14  | control E       |
//! | 7   | day, tens      | 15  | control F       |
//!
//! The time follows the host clock. Writing a time register shifts an
//! offset against the host clock; the control registers are plain storage.

use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DateTime {
    year: i64,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
}

/// Days since 1970-01-01 to civil date.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = y.div_euclid(400);
    let yoe = y.rem_euclid(400);
    let m = m as i64;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + d as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

impl DateTime {
    fn from_unix(secs: i64) -> Self {
        let days = secs.div_euclid(86_400);
        let rem = secs.rem_euclid(86_400);
        let (year, month, day) = civil_from_days(days);
        Self {
            year,
            month,
            day,
            hour: (rem / 3600) as u32,
            minute: (rem / 60 % 60) as u32,
            second: (rem % 60) as u32,
        }
    }

    fn to_unix(self) -> i64 {
        days_from_civil(self.year, self.month, self.day) * 86_400
            + self.hour as i64 * 3600
            + self.minute as i64 * 60
            + self.second as i64
    }

    fn weekday(self) -> u32 {
        // 1970-01-01 was a Thursday
        (days_from_civil(self.year, self.month, self.day) + 4).rem_euclid(7) as u32
    }
}

fn host_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct Rtc72421 {
    /// Seconds added to the host clock.
    offset: i64,
    control: [u8; 3],
    /// Fixed time for tests instead of the host clock.
    frozen: Option<i64>,
}

impl Default for Rtc72421 {
    fn default() -> Self {
        Self::new()
    }
}

impl Rtc72421 {
    pub fn new() -> Self {
        Self {
            offset: 0,
            control: [0, 0, 0x04],
            frozen: None,
        }
    }

    /// Clock standing still at a Unix time.
    pub fn frozen_at(secs: i64) -> Self {
        Self {
            frozen: Some(secs),
            ..Self::new()
        }
    }

    fn now(&self) -> DateTime {
        DateTime::from_unix(self.frozen.unwrap_or_else(host_seconds) + self.offset)
    }

    pub fn read(&self, port: u16) -> u8 {
        let t = self.now();
        let yy = t.year.rem_euclid(100) as u32;
        let v = match port & 0x0F {
            0 => t.second % 10,
            1 => t.second / 10,
            2 => t.minute % 10,
            3 => t.minute / 10,
            4 => t.hour % 10,
            5 => t.hour / 10,
            6 => t.day % 10,
            7 => t.day / 10,
            8 => t.month % 10,
            9 => t.month / 10,
            10 => yy % 10,
            11 => yy / 10,
            12 => t.weekday(),
            r => self.control[(r - 13) as usize] as u32,
        };
        (v as u8 & 0x0F) | 0xF0
    }

    pub fn write(&mut self, port: u16, value: u8) {
        let reg = port & 0x0F;
        let v = (value & 0x0F) as u32;
        if reg >= 13 {
            self.control[(reg - 13) as usize] = value & 0x0F;
            return;
        }
        let mut t = self.now();
        let set_digit = |field: u32, tens: bool| {
            if tens {
                field % 10 + v * 10
            } else {
                field / 10 * 10 + v
            }
        };
        match reg {
            0 | 1 => t.second = set_digit(t.second, reg == 1).min(59),
            2 | 3 => t.minute = set_digit(t.minute, reg == 3).min(59),
            4 | 5 => t.hour = set_digit(t.hour, reg == 5).min(23),
            6 | 7 => t.day = set_digit(t.day, reg == 7).clamp(1, 31),
            8 | 9 => t.month = set_digit(t.month, reg == 9).clamp(1, 12),
            10 | 11 => {
                let yy = set_digit(t.year.rem_euclid(100) as u32, reg == 11);
                t.year = t.year - t.year.rem_euclid(100) + yy as i64;
            }
            // weekday follows from the date
            _ => return,
        }
        let base = self.frozen.unwrap_or_else(host_seconds);
        self.offset = t.to_unix() - base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-02-29 13:45:07, a Thursday
    const T: i64 = 1_709_214_307;

    fn digits(rtc: &Rtc72421) -> Vec<u8> {
        (0..13).map(|r| rtc.read(r) & 0x0F).collect()
    }

    #[test]
    fn test_civil_conversion() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(days_from_civil(2000, 3, 1), 11_017);
        let t = DateTime::from_unix(T);
        assert_eq!((t.year, t.month, t.day), (2024, 2, 29));
        assert_eq!(t.to_unix(), T);
    }

    #[test]
    fn test_read_registers() {
        let rtc = Rtc72421::frozen_at(T);
        assert_eq!(digits(&rtc), vec![7, 0, 5, 4, 3, 1, 9, 2, 2, 0, 4, 2, 4]);
        assert_eq!(rtc.read(0x7F), 0xF4);
    }

    #[test]
    fn test_write_shifts_time() {
        let mut rtc = Rtc72421::frozen_at(T);
        rtc.write(0x75, 0); // hour tens
        rtc.write(0x74, 8);
        assert_eq!(rtc.read(5) & 0x0F, 0);
        assert_eq!(rtc.read(4) & 0x0F, 8);
        assert_eq!(rtc.read(2) & 0x0F, 5);
        rtc.write(0x7D, 0x01);
        assert_eq!(rtc.read(0x7D), 0xF1);
    }
}
