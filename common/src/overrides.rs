use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::OverrideError,
    types::{PendingMessage, ZoneId},
};

pub const OVERRIDE_MESSAGE_TYPE: &str = "temperature override";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverridePayload {
    pub target: BTreeMap<String, serde_json::Value>,
    pub expiration: String,
    pub zone: ZoneId,
}

impl OverridePayload {
    pub fn new(zone: ZoneId, targets: &BTreeMap<String, f32>, expiration: DateTime<Utc>) -> Self {
        Self {
            target: targets
                .iter()
                .map(|(room, temp)| (room.clone(), serde_json::Value::from(f64::from(*temp))))
                .collect(),
            expiration: expiration.to_rfc3339(),
            zone,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    pub zone: ZoneId,
    pub targets: BTreeMap<String, f32>,
    pub expiration: DateTime<Utc>,
    pub created: DateTime<Utc>,
}

impl Override {
    pub fn parse(message: &PendingMessage, local_offset: FixedOffset) -> Result<Self, OverrideError> {
        let malformed = |reason: String| OverrideError::Malformed {
            id: message.id,
            reason,
        };

        let payload: OverridePayload =
            serde_json::from_str(&message.json).map_err(|err| malformed(err.to_string()))?;

        if payload.zone != message.zone {
            return Err(malformed(format!(
                "payload zone {} does not match message zone {}",
                payload.zone, message.zone
            )));
        }
        if payload.target.is_empty() {
            return Err(malformed("empty target map".to_string()));
        }

        let mut targets = BTreeMap::new();
        for (room, value) in &payload.target {
            let Some(temp) = value.as_f64().filter(|temp| temp.is_finite()) else {
                return Err(malformed(format!("non-numeric target for `{room}`: {value}")));
            };
            targets.insert(room.clone(), temp as f32);
        }

        let expiration = parse_expiration(&payload.expiration, local_offset)
            .ok_or_else(|| malformed(format!("unparseable expiration `{}`", payload.expiration)))?;

        Ok(Self {
            zone: payload.zone,
            targets,
            expiration,
            created: message.record_time,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiration
    }
}

fn parse_expiration(raw: &str, local_offset: FixedOffset) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    local_offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollOutcome {
    pub targets: Option<BTreeMap<String, f32>>,
    // Every message up to and including this creation time has been read and must be marked consumed.
    pub consumed_through: Option<DateTime<Utc>>,
    pub rejected: Vec<OverrideError>,
    pub applied: bool,
    pub expired: bool,
}

#[derive(Debug, Clone)]
pub struct OverrideQueue {
    zone: ZoneId,
    active: Option<Override>,
}

impl OverrideQueue {
    pub fn new(zone: ZoneId) -> Self {
        Self { zone, active: None }
    }

    pub fn zone(&self) -> ZoneId {
        self.zone
    }

    pub fn active(&self) -> Option<&Override> {
        self.active.as_ref()
    }

    pub fn poll(
        &mut self,
        pending: &[PendingMessage],
        now: DateTime<Utc>,
        local_offset: FixedOffset,
    ) -> PollOutcome {
        let mut outcome = PollOutcome::default();

        let mut messages: Vec<&PendingMessage> = pending
            .iter()
            .filter(|message| message.zone == self.zone)
            .collect();
        messages.sort_by_key(|message| (message.record_time, message.id));

        // Only the newest message counts; a malformed one leaves nothing to apply.
        let mut newest: Option<Override> = None;
        for message in messages {
            outcome.consumed_through = Some(message.record_time);
            newest = match Override::parse(message, local_offset) {
                Ok(parsed) => Some(parsed),
                Err(err) => {
                    outcome.rejected.push(err);
                    None
                }
            };
        }

        if let Some(candidate) = newest {
            let supersedes = self
                .active
                .as_ref()
                .map(|current| candidate.created >= current.created)
                .unwrap_or(true);
            if supersedes {
                self.active = Some(candidate);
                outcome.applied = true;
            }
        }

        if self
            .active
            .as_ref()
            .is_some_and(|active| active.is_expired(now))
        {
            self.active = None;
            outcome.expired = true;
        }

        outcome.targets = self.active.as_ref().map(|active| active.targets.clone());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    use super::*;

    fn utc(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, hour, minute, 0).unwrap()
    }

    fn offset() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn message(id: i64, created: DateTime<Utc>, json: &str) -> PendingMessage {
        PendingMessage {
            id,
            user: 1,
            zone: 1,
            json: json.to_string(),
            record_time: created,
        }
    }

    fn valid(id: i64, created: DateTime<Utc>, temp: f32, expiration: DateTime<Utc>) -> PendingMessage {
        let targets = BTreeMap::from([("Living Room".to_string(), temp)]);
        let json = serde_json::to_string(&OverridePayload::new(1, &targets, expiration)).unwrap();
        message(id, created, &json)
    }

    #[test]
    fn newest_message_wins_and_all_are_consumed() {
        let mut queue = OverrideQueue::new(1);
        let pending = vec![
            valid(2, utc(10, 5), 72.0, utc(12, 0)),
            valid(1, utc(10, 0), 65.0, utc(12, 0)),
        ];

        let outcome = queue.poll(&pending, utc(10, 10), offset());

        assert!(outcome.applied);
        assert_eq!(outcome.consumed_through, Some(utc(10, 5)));
        assert_eq!(outcome.targets.unwrap()["Living Room"], 72.0);
    }

    #[test]
    fn polling_without_new_messages_is_idempotent() {
        let mut queue = OverrideQueue::new(1);
        let first = queue.poll(&[valid(1, utc(10, 0), 70.0, utc(11, 0))], utc(10, 1), offset());
        let second = queue.poll(&[], utc(10, 2), offset());
        let third = queue.poll(&[], utc(10, 3), offset());

        assert_eq!(first.targets, second.targets);
        assert_eq!(second.targets, third.targets);
        assert!(!second.applied);
    }

    #[test]
    fn expires_lazily_at_expiration_instant() {
        let mut queue = OverrideQueue::new(1);
        queue.poll(&[valid(1, utc(10, 0), 70.0, utc(11, 0))], utc(10, 0), offset());

        let before = queue.poll(&[], utc(11, 0) - Duration::seconds(1), offset());
        assert!(before.targets.is_some());

        let at = queue.poll(&[], utc(11, 0), offset());
        assert!(at.expired);
        assert_eq!(at.targets, None);
        assert!(queue.active().is_none());
    }

    #[test]
    fn malformed_messages_are_rejected_not_coerced() {
        let mut queue = OverrideQueue::new(1);
        let pending = vec![
            message(1, utc(9, 0), r#"{"target":{"Den":"70"},"expiration":"2026-01-05T12:00:00","zone":1}"#),
            message(2, utc(9, 1), r#"{"target":{"Den":70},"expiration":"tomorrow","zone":1}"#),
            message(3, utc(9, 2), r#"{"target":{"Den":70},"expiration":"2026-01-05T12:00:00","zone":2}"#),
            message(4, utc(9, 3), "not json"),
        ];

        let outcome = queue.poll(&pending, utc(9, 30), offset());

        assert_eq!(outcome.rejected.len(), 4);
        assert_eq!(outcome.targets, None);
        assert_eq!(outcome.consumed_through, Some(utc(9, 3)));
    }

    #[test]
    fn naive_expiration_uses_local_offset() {
        let pacific = FixedOffset::west_opt(8 * 3600).unwrap();
        let parsed = Override::parse(
            &message(1, utc(9, 0), r#"{"target":{"Den":70.5},"expiration":"2026-01-05T04:00:00.250","zone":1}"#),
            pacific,
        )
        .unwrap();

        assert_eq!(parsed.expiration, utc(12, 0) + Duration::milliseconds(250));
        assert_eq!(parsed.targets["Den"], 70.5);
    }

    #[test]
    fn malformed_newest_message_hides_older_valid_one() {
        let mut queue = OverrideQueue::new(1);
        let pending = vec![
            valid(1, utc(10, 0), 72.0, utc(12, 0)),
            message(2, utc(10, 5), r#"{"target":{"Den":70},"expiration":"soon","zone":1}"#),
        ];

        let outcome = queue.poll(&pending, utc(10, 10), offset());

        assert!(!outcome.applied);
        assert_eq!(outcome.targets, None);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.consumed_through, Some(utc(10, 5)));
    }

    #[test]
    fn older_message_does_not_replace_newer_active_override() {
        let mut queue = OverrideQueue::new(1);
        queue.poll(&[valid(5, utc(10, 0), 74.0, utc(12, 0))], utc(10, 0), offset());

        let outcome = queue.poll(&[valid(4, utc(9, 0), 60.0, utc(12, 0))], utc(10, 1), offset());

        assert!(!outcome.applied);
        assert_eq!(outcome.targets.unwrap()["Living Room"], 74.0);
    }
}
