use time::{
    format_description::well_known::Rfc3339, macros::format_description, Date, Duration, OffsetDateTime,
    PrimitiveDateTime, UtcOffset,
};

pub const TZ_OFFSET_MINUTES_MIN: i32 = -14 * 60;
pub const TZ_OFFSET_MINUTES_MAX: i32 = 14 * 60;

/// Storage form: UTC, fixed millisecond precision, so lexical order matches time order.
pub fn storage_ts(t: OffsetDateTime) -> String {
    shift(t, UtcOffset::UTC)
        .and_then(|utc| {
            utc.format(format_description!(
                "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
            ))
            .ok()
        })
        .unwrap_or_default()
}

/// RFC 3339, normalized to UTC. `None` when the UTC instant is not representable.
pub fn parse_ts(raw: &str) -> Option<OffsetDateTime> {
    let t = OffsetDateTime::parse(raw.trim(), &Rfc3339).ok()?;
    shift(t, UtcOffset::UTC).map(|p| p.assume_utc())
}

/// Wall-clock time of `t` in `tz`, or `None` past the calendar bounds.
fn shift(t: OffsetDateTime, tz: UtcOffset) -> Option<PrimitiveDateTime> {
    let delta = i64::from(tz.whole_seconds()) - i64::from(t.offset().whole_seconds());
    PrimitiveDateTime::new(t.date(), t.time()).checked_add(Duration::seconds(delta))
}

pub fn normalize_tz_offset_minutes(v: Option<i32>) -> i32 {
    v.unwrap_or(0)
        .clamp(TZ_OFFSET_MINUTES_MIN, TZ_OFFSET_MINUTES_MAX)
}

pub fn tz_offset_from_minutes(minutes: i32) -> UtcOffset {
    UtcOffset::from_whole_seconds(minutes.saturating_mul(60)).unwrap_or(UtcOffset::UTC)
}

/// YYYY-MM-DD.
pub fn parse_date(date: &str) -> Option<Date> {
    let parts: Vec<&str> = date.trim().split('-').collect();
    if parts.len() != 3 {
        return None;
    }
    let y: i32 = parts[0].parse().ok()?;
    let m: u8 = parts[1].parse().ok()?;
    let d: u8 = parts[2].parse().ok()?;
    let month = time::Month::try_from(m).ok()?;
    Date::from_calendar_date(y, month, d).ok()
}

/// Calendar day of `t` as seen from `tz`. Saturates at `Date::MIN`/`Date::MAX`.
pub fn local_date(t: OffsetDateTime, tz: UtcOffset) -> Date {
    match shift(t, tz) {
        Some(local) => local.date(),
        None if tz.whole_seconds() < t.offset().whole_seconds() => Date::MIN,
        None => Date::MAX,
    }
}

/// Midnight of `date` in `tz`, expressed in UTC. `None` when that instant falls
/// outside the representable range.
pub fn day_start_utc(date: Date, tz: UtcOffset) -> Option<OffsetDateTime> {
    date.midnight()
        .checked_sub(Duration::seconds(i64::from(tz.whole_seconds())))
        .map(PrimitiveDateTime::assume_utc)
}

/// Serde adapter for `OffsetDateTime` as RFC 3339 text.
pub mod rfc3339 {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::{format_description::well_known::Rfc3339, OffsetDateTime};

    pub fn serialize<S: Serializer>(t: &OffsetDateTime, s: S) -> Result<S::Ok, S::Error> {
        let v = t.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
        s.serialize_str(&v)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        OffsetDateTime::parse(&raw, &Rfc3339).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::Serializer;
        use time::OffsetDateTime;

        pub fn serialize<S: Serializer>(t: &Option<OffsetDateTime>, s: S) -> Result<S::Ok, S::Error> {
            match t {
                Some(t) => super::serialize(t, s),
                None => s.serialize_none(),
            }
        }
    }
}
