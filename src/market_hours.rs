// =============================================================================
// Market-Hours Oracle — NSE equity-derivatives session gate
// =============================================================================
//
// The orchestrator consults this module before every cycle. The regular NSE
// session runs 09:15–15:30 IST, Monday through Friday. Exchange holidays are
// not modelled here; a closed-day cycle simply collects an empty expiry
// catalogue and aborts at resolve.
// =============================================================================

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, TimeZone, Utc, Weekday};

/// IST offset (+05:30).
fn ist() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 30 * 60).expect("static offset")
}

fn session_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 15, 0).expect("static time")
}

fn session_close() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 30, 0).expect("static time")
}

fn is_trading_day(weekday: Weekday) -> bool {
    !matches!(weekday, Weekday::Sat | Weekday::Sun)
}

/// Whether the regular session is open at `now`.
pub fn is_open_at(now: DateTime<Utc>) -> bool {
    let local = now.with_timezone(&ist());
    if !is_trading_day(local.weekday()) {
        return false;
    }
    let t = local.time();
    t >= session_open() && t <= session_close()
}

/// Whether the regular session is open right now.
pub fn is_open() -> bool {
    is_open_at(Utc::now())
}

/// The next session open at or after `now`. Used for skip-cycle logging.
pub fn next_open_after(now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&ist());
    let mut day = local.date_naive();

    // Same-day open still ahead of us.
    if is_trading_day(local.weekday()) && local.time() < session_open() {
        let open = day.and_time(session_open());
        return ist()
            .from_local_datetime(&open)
            .single()
            .expect("unambiguous IST time")
            .with_timezone(&Utc);
    }

    loop {
        day = day.succ_opt().expect("date within range");
        if is_trading_day(day.weekday()) {
            let open = day.and_time(session_open());
            return ist()
                .from_local_datetime(&open)
                .single()
                .expect("unambiguous IST time")
                .with_timezone(&Utc);
        }
    }
}

/// Seconds until the next session open, rounded down. 0 when already open.
pub fn seconds_to_open(now: DateTime<Utc>) -> i64 {
    if is_open_at(now) {
        return 0;
    }
    (next_open_after(now) - now).num_seconds().max(0)
}

/// Upcoming Thursdays from `from`, used when the provider fabricates
/// near-expiries out of an instrument universe with no expiry catalogue.
pub fn near_thursdays(from: chrono::NaiveDate, count: usize) -> Vec<chrono::NaiveDate> {
    let mut out = Vec::with_capacity(count);
    let mut day = from;
    while out.len() < count {
        if day.weekday() == Weekday::Thu && day >= from {
            out.push(day);
        }
        day = day.succ_opt().expect("date within range");
    }
    out
}
