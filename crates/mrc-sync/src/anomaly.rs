use mrc_core::AlertSignal;

/// Flags a year whose scraped count collapsed to zero or below half the prior count.
pub fn check_anomaly(year_key: &str, previous: usize, current: usize) -> Option<AlertSignal> {
    if previous == 0 || (current != 0 && current >= previous / 2) {
        return None;
    }
    Some(AlertSignal {
        year_key: year_key.to_string(),
        previous_count: previous,
        current_count: current,
        message: format!(
            "Only {current} movies scraped for {year_key} (was {previous}). Page format may have changed."
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_scrape_after_full_one_alerts() {
        let signal = check_anomaly("2025", 10, 0).unwrap();
        assert_eq!(signal.year_key, "2025");
        assert_eq!((signal.previous_count, signal.current_count), (10, 0));
        assert_eq!(
            signal.message,
            "Only 0 movies scraped for 2025 (was 10). Page format may have changed."
        );
    }

    #[test]
    fn threshold_is_half_the_previous_count() {
        assert!(check_anomaly("2025", 10, 6).is_none());
        assert!(check_anomaly("2025", 10, 5).is_none());
        assert!(check_anomaly("2025", 10, 4).is_some());
        assert!(check_anomaly("2025", 3, 1).is_none());
        assert!(check_anomaly("2025", 1, 0).is_some());
    }

    #[test]
    fn no_history_never_alerts() {
        assert!(check_anomaly("2026", 0, 0).is_none());
        assert!(check_anomaly("2026", 0, 12).is_none());
    }
}
