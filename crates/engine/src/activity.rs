use anyhow::Result;
use chrono::{Duration, Local, LocalResult, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use tablevault_core::model::NewActivityLogEntry;
use tablevault_core::{ActivityFilter, ActivityLogEntry, ActivityStats};
use tracing::warn;

use crate::Engine;

/// CSV export stops after this many rows.
const CSV_EXPORT_CAP: i64 = 10_000;

#[derive(Debug, Clone, Serialize)]
pub struct ActivityPage {
    pub entries: Vec<ActivityLogEntry>,
    pub total: i64,
    pub has_more: bool,
}

impl Engine {
    /// Append one audit record. Never fails the calling operation: a store
    /// error is logged and reported only through the returned flag.
    pub async fn log_activity(&self, entry: NewActivityLogEntry) -> bool {
        let entry = entry.into_entry();
        match self.store.insert_activity(&entry).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    activity_type = entry.activity_type.as_str(),
                    error = %e,
                    "failed to append activity log entry"
                );
                false
            }
        }
    }

    pub async fn get_activity_logs(&self, filter: ActivityFilter) -> Result<ActivityPage> {
        let (entries, total) = self.store.query_activity(&filter).await?;
        let has_more = filter.offset.max(0) + (entries.len() as i64) < total;
        Ok(ActivityPage {
            entries,
            total,
            has_more,
        })
    }

    /// Aggregate counters; "today" means the local calendar day.
    pub async fn get_activity_stats(&self) -> Result<ActivityStats> {
        let (day_start, day_end) = local_day_bounds();
        self.store.activity_stats(day_start, day_end).await
    }

    /// Render the filtered set as CSV, capped at 10,000 rows. Fields with
    /// embedded delimiters or quotes are quoted with doubled quotes.
    pub async fn export_activity_csv(&self, mut filter: ActivityFilter) -> Result<String> {
        filter.limit = CSV_EXPORT_CAP;
        let (entries, _) = self.store.query_activity(&filter).await?;

        let mut out = String::from(
            "created_at,activity_type,status,actor,backup_id,backup_name,details,ip_address,user_agent\n",
        );
        for entry in &entries {
            let row = [
                entry.created_at.to_rfc3339(),
                entry.activity_type.as_str().to_owned(),
                entry.status.as_str().to_owned(),
                entry.actor.clone(),
                entry
                    .backup_id
                    .map(|id| id.to_string())
                    .unwrap_or_default(),
                entry.backup_name.clone().unwrap_or_default(),
                if entry.details.is_null() {
                    String::new()
                } else {
                    entry.details.to_string()
                },
                entry.ip_address.clone().unwrap_or_default(),
                entry.user_agent.clone().unwrap_or_default(),
            ];
            let rendered: Vec<String> = row.iter().map(|f| csv_field(f)).collect();
            out.push_str(&rendered.join(","));
            out.push('\n');
        }
        Ok(out)
    }
}

fn csv_field(raw: &str) -> String {
    if raw.contains(',') || raw.contains('"') || raw.contains('\n') || raw.contains('\r') {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_owned()
    }
}

/// UTC bounds of the current local calendar day.
fn local_day_bounds() -> (chrono::DateTime<Utc>, chrono::DateTime<Utc>) {
    let now = Local::now();
    let midnight = now.date_naive().and_time(NaiveTime::MIN);
    let day_start = match Local.from_local_datetime(&midnight) {
        LocalResult::Single(t) => t.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        // A skipped midnight (DST edge): fall back to 24h before now.
        LocalResult::None => now.with_timezone(&Utc) - Duration::hours(24),
    };
    (day_start, day_start + Duration::days(1))
}
