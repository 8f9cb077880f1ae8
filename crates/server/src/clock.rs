//! Wall-clock helpers. All timestamps on the wire are RFC 3339 UTC with
//! millisecond precision, e.g. `2024-01-15T12:30:45.123Z`.

use chrono::{SecondsFormat, Utc};

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
