pub trait TimeSource {
    // Nanoseconds since the unix epoch, stamped on points sent without a time
    fn current_time_nanos(&self) -> i64;
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn current_time_nanos(&self) -> i64 {
        let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
        i64::try_from(nanos).unwrap_or(i64::MAX)
    }
}

#[derive(Clone)]
pub struct FixedTime {
    pub nanos: i64,
}

impl TimeSource for FixedTime {
    fn current_time_nanos(&self) -> i64 {
        self.nanos
    }
}
