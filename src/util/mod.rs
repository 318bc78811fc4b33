use std::time::Duration;

/// Computes the symmetric difference of two sorted string slices.
/// Returns `(removed, added)`: elements only in `old` and only in `new`.
pub fn sorted_diff(old: &[String], new: &[String]) -> (Vec<String>, Vec<String>) {
    let mut removed = Vec::new();
    let mut added = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < old.len() && j < new.len() {
        match old[i].cmp(&new[j]) {
            std::cmp::Ordering::Less => {
                removed.push(old[i].clone());
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                added.push(new[j].clone());
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    removed.extend_from_slice(&old[i..]);
    added.extend_from_slice(&new[j..]);
    (removed, added)
}

/// Formats a duration the way it appears in room notices, e.g. "1h 30m".
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    if total == 0 {
        return "0s".to_string();
    }
    let days = total / 86400;
    let hours = (total % 86400) / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{}d", days));
    }
    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if minutes > 0 {
        parts.push(format!("{}m", minutes));
    }
    if seconds > 0 {
        parts.push(format!("{}s", seconds));
    }
    parts.join(" ")
}

pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();

    if let Some(rest) = s.strip_suffix('d') {
        let days: u64 = rest.parse()?;
        Ok(Duration::from_secs(days * 86400))
    } else if let Some(rest) = s.strip_suffix('h') {
        let hours: u64 = rest.parse()?;
        Ok(Duration::from_secs(hours * 3600))
    } else if let Some(rest) = s.strip_suffix('m') {
        let mins: u64 = rest.parse()?;
        Ok(Duration::from_secs(mins * 60))
    } else if let Some(rest) = s.strip_suffix('s') {
        let secs: u64 = rest.parse()?;
        Ok(Duration::from_secs(secs))
    } else {
        let secs: u64 = s.parse()?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_sorted_diff() {
        let old = strs(&["@a:x", "@b:x", "@d:x"]);
        let new = strs(&["@b:x", "@c:x", "@d:x", "@e:x"]);
        let (removed, added) = sorted_diff(&old, &new);
        assert_eq!(removed, strs(&["@a:x"]));
        assert_eq!(added, strs(&["@c:x", "@e:x"]));
    }

    #[test]
    fn test_sorted_diff_disjoint_outputs() {
        let old = strs(&["@a:x", "@b:x"]);
        let new = strs(&["@b:x", "@c:x"]);
        let (removed, added) = sorted_diff(&old, &new);
        for r in &removed {
            assert!(!added.contains(r));
        }
    }

    #[test]
    fn test_sorted_diff_empty() {
        let (removed, added) = sorted_diff(&[], &[]);
        assert!(removed.is_empty());
        assert!(added.is_empty());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(format_duration(Duration::from_secs(86400 + 7200)), "1d 2h");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("42").unwrap(), Duration::from_secs(42));
        assert!(parse_duration("xyz").is_err());
    }
}
