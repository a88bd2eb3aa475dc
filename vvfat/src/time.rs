use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone, Timelike};
use std::time::SystemTime;

/// Packs a local timestamp into the FAT time format:
/// bits 15..11 hour, 10..5 minute, 4..0 seconds/2.
pub fn fat_time(t: &DateTime<Local>) -> u16 {
    return ((t.second() / 2) | (t.minute() << 5) | (t.hour() << 11)) as u16;
}

/// Packs a local timestamp into the FAT date format:
/// bits 15..9 year-1980, 8..5 month, 4..0 day.
pub fn fat_date(t: &DateTime<Local>) -> u16 {
    let year = t.year() as u32;

    return (t.day() | (t.month() << 5) | ((year.saturating_sub(1980)) << 9)) as u16;
}

/// Converts a host timestamp to `(date, time)` in FAT format.
pub fn fat_datetime(st: SystemTime) -> (u16, u16) {
    let local: DateTime<Local> = DateTime::from(st);

    return (fat_date(&local), fat_time(&local));
}

/// Reverses `fat_date`/`fat_time`. Returns `None` for field values that do
/// not name a real calendar time.
pub fn system_time_from_fat(date: u16, time: u16) -> Option<SystemTime> {
    let year = ((date >> 9) as i32) + 1980;
    let month = ((date >> 5) & 0x0f) as u32;
    let day = (date & 0x1f) as u32;
    let hour = (time >> 11) as u32;
    let minute = ((time >> 5) & 0x3f) as u32;
    let second = ((time & 0x1f) as u32) * 2;

    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)?;
    let local = Local.from_local_datetime(&naive).earliest()?;

    return Some(SystemTime::from(local));
}
