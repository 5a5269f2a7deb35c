//! Priority classification of due monitors

use crate::models::{MonitorStatus, Priority};

/// Classify a monitor. Rules are checked in order; the first match wins.
pub fn classify_priority(status: MonitorStatus, interval_minutes: i32) -> Priority {
    if status.is_failure() || interval_minutes <= 1 {
        Priority::Critical
    } else if interval_minutes <= 5 {
        Priority::High
    } else if interval_minutes >= 30 && status == MonitorStatus::Up {
        Priority::Low
    } else {
        Priority::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(MonitorStatus::Down, 60, Priority::Critical)]
    #[case(MonitorStatus::Timeout, 15, Priority::Critical)]
    #[case(MonitorStatus::Up, 1, Priority::Critical)]
    #[case(MonitorStatus::Up, 5, Priority::High)]
    #[case(MonitorStatus::Pending, 2, Priority::High)]
    #[case(MonitorStatus::Up, 30, Priority::Low)]
    #[case(MonitorStatus::Up, 120, Priority::Low)]
    #[case(MonitorStatus::Pending, 30, Priority::Normal)]
    #[case(MonitorStatus::Unknown, 60, Priority::Normal)]
    #[case(MonitorStatus::Up, 10, Priority::Normal)]
    fn test_classify_priority(
        #[case] status: MonitorStatus,
        #[case] interval: i32,
        #[case] expected: Priority,
    ) {
        assert_eq!(classify_priority(status, interval), expected);
    }

    #[test]
    fn test_failure_outranks_long_interval() {
        assert!(classify_priority(MonitorStatus::Down, 1440).is_expedited());
        assert!(!classify_priority(MonitorStatus::Up, 1440).is_expedited());
    }
}
