use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Datelike, Duration, FixedOffset, TimeZone, Timelike, Weekday};
use serde::{Deserialize, Serialize};

use crate::{error::ScheduleError, types::ZoneId};

pub const MIN_TARGET_F: f32 = 40.0;
pub const MAX_TARGET_F: f32 = 90.0;
const MINUTES_PER_DAY: u16 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl DayOfWeek {
    pub const ALL: [DayOfWeek; 7] = [
        Self::Mon,
        Self::Tue,
        Self::Wed,
        Self::Thu,
        Self::Fri,
        Self::Sat,
        Self::Sun,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::Mon => 0,
            Self::Tue => 1,
            Self::Wed => 2,
            Self::Thu => 3,
            Self::Fri => 4,
            Self::Sat => 5,
            Self::Sun => 6,
        }
    }

    pub fn from_index(index: usize) -> Self {
        match index % 7 {
            0 => Self::Mon,
            1 => Self::Tue,
            2 => Self::Wed,
            3 => Self::Thu,
            4 => Self::Fri,
            5 => Self::Sat,
            _ => Self::Sun,
        }
    }

    pub fn from_chrono(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => Self::Mon,
            Weekday::Tue => Self::Tue,
            Weekday::Wed => Self::Wed,
            Weekday::Thu => Self::Thu,
            Weekday::Fri => Self::Fri,
            Weekday::Sat => Self::Sat,
            Weekday::Sun => Self::Sun,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mon => "MON",
            Self::Tue => "TUE",
            Self::Wed => "WED",
            Self::Thu => "THU",
            Self::Fri => "FRI",
            Self::Sat => "SAT",
            Self::Sun => "SUN",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|day| day.as_str().eq_ignore_ascii_case(raw))
    }

    pub fn previous(self) -> Self {
        Self::from_index(self.index() + 6)
    }

    pub fn next(self) -> Self {
        Self::from_index(self.index() + 1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleEntry {
    pub room: String,
    pub day: DayOfWeek,
    #[serde(rename = "startMinutes")]
    pub start_minutes: u16,
    #[serde(rename = "targetTemp")]
    pub target_temp_f: f32,
}

impl ScheduleEntry {
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.start_minutes >= MINUTES_PER_DAY {
            return Err(self.invalid(format!("start minute {} is past midnight", self.start_minutes)));
        }
        if !self.target_temp_f.is_finite()
            || !(MIN_TARGET_F..=MAX_TARGET_F).contains(&self.target_temp_f)
        {
            return Err(self.invalid(format!("target {} out of range", self.target_temp_f)));
        }
        Ok(())
    }

    fn invalid(&self, reason: String) -> ScheduleError {
        ScheduleError::InvalidEntry {
            room: self.room.clone(),
            reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeeklySchedule {
    pub id: i64,
    pub user: i64,
    pub zone: ZoneId,
    pub name: String,
    pub active: bool,
    pub entries: Vec<ScheduleEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NextTarget {
    pub at: DateTime<FixedOffset>,
    pub target_temp_f: f32,
}

impl WeeklySchedule {
    pub fn normalize(&mut self) -> Result<(), ScheduleError> {
        for entry in &self.entries {
            entry.validate()?;
        }
        self.entries.sort_by(|a, b| {
            (a.room.as_str(), a.day.index(), a.start_minutes).cmp(&(
                b.room.as_str(),
                b.day.index(),
                b.start_minutes,
            ))
        });
        self.validate_week()
    }

    pub fn validate_week(&self) -> Result<(), ScheduleError> {
        for room in self.rooms() {
            for day in DayOfWeek::ALL {
                if self.day_entries(room, day).is_empty() {
                    return Err(ScheduleError::MissingDay {
                        room: room.to_string(),
                        day,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn rooms(&self) -> BTreeSet<&str> {
        self.entries.iter().map(|entry| entry.room.as_str()).collect()
    }

    fn day_entries(&self, room: &str, day: DayOfWeek) -> Vec<&ScheduleEntry> {
        let mut entries: Vec<&ScheduleEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.room == room && entry.day == day)
            .collect();
        entries.sort_by_key(|entry| entry.start_minutes);
        entries
    }

    fn required_day_entries(
        &self,
        room: &str,
        day: DayOfWeek,
    ) -> Result<Vec<&ScheduleEntry>, ScheduleError> {
        let entries = self.day_entries(room, day);
        if entries.is_empty() {
            return Err(ScheduleError::MissingDay {
                room: room.to_string(),
                day,
            });
        }
        Ok(entries)
    }

    pub fn current_targets(
        &self,
        now: DateTime<FixedOffset>,
    ) -> Result<BTreeMap<String, f32>, ScheduleError> {
        let day = DayOfWeek::from_chrono(now.weekday());
        let current_minutes = minutes_of_day(now);

        let mut targets = BTreeMap::new();
        for room in self.rooms() {
            let today = self.required_day_entries(room, day)?;

            // Last entry of today that has started; before the first one, yesterday's last entry holds.
            let active = match today
                .iter()
                .rev()
                .find(|entry| entry.start_minutes <= current_minutes)
            {
                Some(entry) => *entry,
                None => {
                    let yesterday = self.required_day_entries(room, day.previous())?;
                    yesterday[yesterday.len() - 1]
                }
            };

            targets.insert(room.to_string(), active.target_temp_f);
        }

        Ok(targets)
    }

    pub fn next_targets(
        &self,
        now: DateTime<FixedOffset>,
    ) -> Result<BTreeMap<String, NextTarget>, ScheduleError> {
        let day = DayOfWeek::from_chrono(now.weekday());
        let current_minutes = minutes_of_day(now);

        let mut targets = BTreeMap::new();
        for room in self.rooms() {
            let today = self.required_day_entries(room, day)?;

            let (day_offset, entry) = match today
                .iter()
                .find(|entry| entry.start_minutes > current_minutes)
            {
                Some(entry) => (0, *entry),
                None => {
                    let tomorrow = self.required_day_entries(room, day.next())?;
                    (1, tomorrow[0])
                }
            };

            let date = now.date_naive() + Duration::days(day_offset);
            let hour = u32::from(entry.start_minutes / 60);
            let minute = u32::from(entry.start_minutes % 60);
            let at = date
                .and_hms_opt(hour, minute, 0)
                .and_then(|naive| now.offset().from_local_datetime(&naive).single())
                .ok_or_else(|| ScheduleError::InvalidEntry {
                    room: room.to_string(),
                    reason: format!("start minute {} has no local time", entry.start_minutes),
                })?;

            targets.insert(
                room.to_string(),
                NextTarget {
                    at,
                    target_temp_f: entry.target_temp_f,
                },
            );
        }

        Ok(targets)
    }
}

fn minutes_of_day(now: DateTime<FixedOffset>) -> u16 {
    (now.hour() * 60 + now.minute()) as u16
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution<'a> {
    pub schedule: &'a WeeklySchedule,
    pub ambiguity: Option<ScheduleError>,
}

pub fn resolve_active(
    user: i64,
    zone: ZoneId,
    schedules: &[WeeklySchedule],
) -> Result<Resolution<'_>, ScheduleError> {
    let mut active: Vec<&WeeklySchedule> = schedules
        .iter()
        .filter(|schedule| schedule.user == user && schedule.zone == zone && schedule.active)
        .collect();
    active.sort_by_key(|schedule| schedule.id);

    let Some(first) = active.first() else {
        return Err(ScheduleError::NotFound { user, zone });
    };

    let ambiguity = (active.len() > 1).then(|| ScheduleError::Ambiguous {
        user,
        zone,
        count: active.len(),
    });

    Ok(Resolution {
        schedule: first,
        ambiguity,
    })
}
