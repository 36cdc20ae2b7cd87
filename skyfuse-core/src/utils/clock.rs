/// Wall-clock time as epoch milliseconds.
///
/// Delayed-set due times are wall-clock so they survive restarts and are
/// comparable across processes sharing one database.
pub fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
