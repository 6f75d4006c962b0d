/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Result as RusqliteResult;
use serde_derive::*;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Typesafe way to manage millisecond wall-clock timestamps, so they can't be
/// accidentally mixed up with the integer version counters that travel next
/// to them in the version columns.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Default,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        SystemTime::now().into()
    }

    /// Returns None if `other` is later than `self` (Duration may not
    /// represent negative timespans in rust).
    #[inline]
    pub fn duration_since(self, other: Timestamp) -> Option<Duration> {
        SystemTime::from(self).duration_since(other.into()).ok()
    }

    #[inline]
    pub fn checked_sub(self, d: Duration) -> Option<Timestamp> {
        SystemTime::from(self).checked_sub(d).map(Timestamp::from)
    }

    #[inline]
    pub fn checked_add(self, d: Duration) -> Option<Timestamp> {
        SystemTime::from(self).checked_add(d).map(Timestamp::from)
    }

    /// Offset by a signed number of milliseconds, saturating at zero. Used to
    /// apply a measured clock skew to a client-supplied timestamp.
    pub fn offset_ms(self, delta: i64) -> Timestamp {
        if delta >= 0 {
            Timestamp(self.0.saturating_add(delta as u64))
        } else {
            Timestamp(self.0.saturating_sub(delta.unsigned_abs()))
        }
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    pub fn as_millis_i64(self) -> i64 {
        self.0 as i64
    }
}

impl From<Timestamp> for u64 {
    #[inline]
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl From<SystemTime> for Timestamp {
    #[inline]
    fn from(st: SystemTime) -> Self {
        let d = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Timestamp(d.as_secs() * 1000 + u64::from(d.subsec_nanos()) / 1_000_000)
    }
}

impl From<Timestamp> for SystemTime {
    #[inline]
    fn from(ts: Timestamp) -> Self {
        UNIX_EPOCH + Duration::from_millis(ts.into())
    }
}

impl From<u64> for Timestamp {
    #[inline]
    fn from(ts: u64) -> Self {
        Timestamp(ts)
    }
}

impl TryFrom<i64> for Timestamp {
    type Error = std::num::TryFromIntError;
    #[inline]
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Ok(Timestamp(u64::try_from(value).unwrap_or(0)))
    }
}

impl fmt::Display for Timestamp {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToSql for Timestamp {
    fn to_sql(&self) -> RusqliteResult<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0 as i64)) // hope we don't get a timestamp larger than i64::MAX!
    }
}

impl FromSql for Timestamp {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_i64().and_then(|v| {
            if v >= 0 {
                Ok(Timestamp(v as u64))
            } else {
                Err(FromSqlError::OutOfRange(v))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_from_system_time() {
        let ts = Timestamp::now();
        assert!(ts.0 > 0);
        let rt: Timestamp = SystemTime::from(ts).into();
        assert_eq!(ts, rt);
    }

    #[test]
    fn test_offset_ms() {
        let ts = Timestamp(10_000);
        assert_eq!(ts.offset_ms(500), Timestamp(10_500));
        assert_eq!(ts.offset_ms(-500), Timestamp(9_500));
        assert_eq!(Timestamp(100).offset_ms(-500), Timestamp(0));
    }

    #[test]
    fn test_sql_roundtrip() {
        let db = rusqlite::Connection::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE t (ts INTEGER)").unwrap();
        let ts = Timestamp(1_234_567);
        db.execute("INSERT INTO t (ts) VALUES (?)", [&ts]).unwrap();
        let got: Timestamp = db
            .query_row("SELECT ts FROM t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(ts, got);
    }
}
