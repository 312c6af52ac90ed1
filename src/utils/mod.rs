/// Current wall-clock time as Unix milliseconds.
///
/// All domain timestamps (created_at, expires_at, last_active_at) use
/// this resolution; keeping clock access in one place makes it easy to
/// audit.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
