//! Outbound text formatting: attribution footers and daily headers

use chrono::{DateTime, TimeZone};
use std::fmt::Display;
use tracing::debug;

use crate::types::SourceMessage;

/// Append the attribution footer to processed content.
pub fn format_outbound(content: &str, message: &SourceMessage) -> String {
    let mut out = String::new();

    out.push_str(content.trim_end());
    out.push_str("\n\n");
    out.push_str("from: via ");
    out.push_str(&message.source_link());

    debug!("Formatted outbound message ({} chars)", out.len());
    out
}

/// Header placed above a daily summary: tag plus a human-readable date,
/// e.g. `#dailysummary 07 Dec`.
pub fn daily_header<Tz>(now: &DateTime<Tz>, label: &str, message_count: usize) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let mut header = String::new();

    header.push_str("#dailysummary ");
    header.push_str(&now.format("%d %b").to_string());
    header.push('\n');
    header.push_str(&format!("**{}** | {} messages analyzed\n\n", label, message_count));

    header
}

/// Notice sent to a destination that saw nothing in the past day.
pub fn no_activity_notice<Tz>(now: &DateTime<Tz>, label: &str) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let mut notice = String::new();

    notice.push_str(&format!("**Daily Summary - {}**\n", label));
    notice.push_str(&format!("{} | Past 24 Hours\n\n", now.format("%Y-%m-%d")));
    notice.push_str("**No Activity**\n\n");
    notice.push_str("No messages were forwarded here over the past 24 hours.\n\n");
    notice.push_str("#dailysummary");

    notice
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use chrono::Utc;

    #[test]
    fn test_format_outbound_with_link() -> Result<()> {
        let msg = SourceMessage::builder("BWEnews", "telegram_-1001279597711")
            .text("原文")
            .url("https://t.me/c/1279597711/42")
            .build()?;

        let out = format_outbound("Translated headline\n", &msg);
        assert_eq!(
            out,
            "Translated headline\n\nfrom: via [BWEnews](https://t.me/c/1279597711/42)"
        );
        Ok(())
    }

    #[test]
    fn test_format_outbound_without_link() -> Result<()> {
        let msg = SourceMessage::builder("Trending API", "api_trending").text("x").build()?;
        let out = format_outbound("Body", &msg);
        assert!(out.ends_with("from: via Trending API"));
        Ok(())
    }

    #[test]
    fn test_daily_header() {
        let now = Utc.with_ymd_and_hms(2024, 12, 7, 9, 0, 0).unwrap();
        let header = daily_header(&now, "@cryptonotifs", 12);
        assert!(header.starts_with("#dailysummary 07 Dec\n"));
        assert!(header.contains("**@cryptonotifs** | 12 messages analyzed"));
    }

    #[test]
    fn test_no_activity_notice() {
        let now = Utc.with_ymd_and_hms(2024, 12, 7, 9, 0, 0).unwrap();
        let notice = no_activity_notice(&now, "Equities");
        assert!(notice.contains("2024-12-07"));
        assert!(notice.contains("No Activity"));
        assert!(notice.ends_with("#dailysummary"));
    }
}
