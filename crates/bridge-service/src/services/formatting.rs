//! Text and link formatting for DingTalk content.

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use chrono_tz::Asia::Shanghai;
use chrono_tz::Tz;

/// Time zone used for rendered times and calendar entries.
pub const DISPLAY_TIME_ZONE: &str = "Asia/Shanghai";

fn utc(epoch_secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(epoch_secs, 0).unwrap_or_default()
}

fn local(epoch_secs: i64) -> DateTime<Tz> {
    utc(epoch_secs).with_timezone(&Shanghai)
}

/// `2024年03月05日14:00 - 15:30`, repeating the date when the range spans days.
pub fn format_time_range(start_secs: i64, end_secs: i64) -> String {
    let start = local(start_secs);
    let end = local(end_secs);

    let date_format = "%Y年%m月%d日";
    if start.date_naive() == end.date_naive() {
        format!(
            "{}{} - {}",
            start.format(date_format),
            start.format("%H:%M"),
            end.format("%H:%M")
        )
    } else {
        format!(
            "{}{} - {}{}",
            start.format(date_format),
            start.format("%H:%M"),
            end.format(date_format),
            end.format("%H:%M")
        )
    }
}

/// Epoch seconds as ISO-8601 UTC with millisecond precision.
pub fn iso_utc(epoch_secs: i64) -> String {
    utc(epoch_secs).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Day of month of `epoch_secs` in the display time zone.
pub fn local_day_of_month(epoch_secs: i64) -> u32 {
    local(epoch_secs).day()
}

/// Builds links that open the bridge's H5 app inside DingTalk.
#[derive(Debug, Clone)]
pub struct AppLinkBuilder {
    agent_id: String,
    corp_id: String,
}

impl AppLinkBuilder {
    pub fn new(agent_id: impl Into<String>, corp_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            corp_id: corp_id.into(),
        }
    }

    /// Link opening the H5 app at `path` (percent-encoded into the link).
    pub fn h5_link(&self, path: &str) -> String {
        format!(
            "https://applink.dingtalk.com/page/h5_app_open?appId={}&corpId={}&appType=2&path={}",
            self.agent_id,
            self.corp_id,
            urlencoding::encode(path)
        )
    }

    /// Link to the meeting page for a meeting code.
    pub fn meeting_link(&self, meeting_code: &str) -> String {
        self.h5_link(&format!("?meetingCode={meeting_code}"))
    }
}
