use chrono::{Datelike, Days, NaiveDate, NaiveDateTime};

pub fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let next_month = if month == 12 { 1 } else { month + 1 };
    let next_year = if month == 12 { year + 1 } else { year };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.checked_sub_days(Days::new(1))
}

/// Same calendar day one year earlier. Feb 29 maps to Feb 28 so quarter ends stay aligned.
pub fn same_day_prior_year(date: NaiveDate) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(date.year() - 1, date.month(), date.day())
        .or_else(|| last_day_of_month(date.year() - 1, date.month()))
}

/// Fiscal quarter (calendar-aligned) ending in the month of `date`.
pub fn quarter_of(date: NaiveDate) -> u32 {
    (date.month() - 1) / 3 + 1
}

/// `Q1 2025` for 2025-03-31.
pub fn quarter_label(date: NaiveDate) -> String {
    format!("Q{} {}", quarter_of(date), date.year())
}

/// Run timestamp as used in lineage file names: `20250314_093000`.
pub fn format_run_timestamp(timestamp: NaiveDateTime) -> String {
    timestamp.format("%Y%m%d_%H%M%S").to_string()
}
