pub fn build_host() -> &'static str {
    option_env!("CAMSRVD_BUILD_HOST").unwrap_or("unknown")
}

pub fn build_time_raw() -> &'static str {
    option_env!("CAMSRVD_BUILD_TIME").unwrap_or("unknown")
}

pub fn build_time_pretty() -> String {
    format_build_time_pretty(build_time_raw())
}

/// Render the `epoch:<secs>` stamp written by build.rs as a UTC timestamp.
pub fn format_build_time_pretty(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(epoch) = raw.strip_prefix("epoch:")
        && let Ok(secs) = epoch.trim().parse::<i64>()
        && let Some(dt) = chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0)
    {
        return dt.format("%Y-%m-%d %H:%M:%S").to_string();
    }
    raw.to_string()
}

pub fn banner() -> String {
    format!(
        "camsrvd {} (built on {} at {})",
        env!("CARGO_PKG_VERSION"),
        build_host(),
        build_time_pretty()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_stamp_renders_as_utc() {
        assert_eq!(format_build_time_pretty("epoch:0"), "1970-01-01 00:00:00");
        assert_eq!(
            format_build_time_pretty(" epoch:1700000000 "),
            "2023-11-14 22:13:20"
        );
    }

    #[test]
    fn unknown_stamp_passes_through() {
        assert_eq!(format_build_time_pretty("unknown"), "unknown");
        assert_eq!(format_build_time_pretty("epoch:soon"), "epoch:soon");
    }
}
