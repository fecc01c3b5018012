//! Parser for the free-text body of Overpass's `/api/status` endpoint.

use overpass_error::ClientError;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// A parsed `/api/status` snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Maximum concurrent queries allowed for this client IP. `None` means
    /// unlimited.
    pub slots: Option<u32>,
    /// Currently open slots. `None` iff `slots` is `None`.
    pub free_slots: Option<u32>,
    /// Seconds until the next slot is available for this IP; `0` if one is
    /// free now.
    pub cooldown_secs: u64,
    /// Announced backend identifier when the public URL is a load balancer.
    pub endpoint: Option<String>,
    /// Count of running queries for this IP, as reported.
    pub nb_running_queries: u32,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slots {
            Some(slots) => write!(
                f,
                "Status(slots={}/{slots}, cooldown={}s)",
                self.free_slots.unwrap_or(0),
                self.cooldown_secs
            ),
            None => write!(f, "Status(slots=∞, cooldown={}s)", self.cooldown_secs),
        }
    }
}

static RATE_LIMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Rate limit:\s*(\d+)").expect("valid regex"));
static FREE_SLOTS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+slots? available now").expect("valid regex"));
static COOLDOWN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Slot available after:.*?,\s*in\s*(-?\d+)\s*seconds").expect("valid regex"));
static ENDPOINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Announced endpoint:\s*(\S+)").expect("valid regex"));
static RUNNING_QUERY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\d+\t\d+\t\d+\t\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z").expect("valid regex")
});

/// Parses the body of a `GET /api/status` response.
///
/// Any failure to find the mandatory `Rate limit:` field is reported as a
/// [`ClientError::ResponseError`]; the raw body is attached so operators can
/// spot API changes (see the malformed-body logging note in the crate's
/// design doc).
pub fn parse_status(body: &str) -> Result<Status, ClientError> {
    let slots = match RATE_LIMIT_RE.captures(body) {
        Some(caps) => {
            let n: u32 = caps[1].parse().map_err(|_| malformed(body, "rate limit is not an integer"))?;
            if n == 0 {
                None
            } else {
                Some(n)
            }
        }
        None => {
            #[cfg(feature = "tracing")]
            tracing::warn!(body, "status body missing 'Rate limit:' field");
            return Err(malformed(body, "missing 'Rate limit:' field"));
        }
    };

    let cooldowns: Vec<i64> = COOLDOWN_RE
        .captures_iter(body)
        .filter_map(|caps| caps[1].parse::<i64>().ok())
        .collect();

    let free_slots = match FREE_SLOTS_RE.captures(body) {
        Some(caps) => caps[1].parse::<u32>().ok(),
        None => slots.map(|s| s.saturating_sub(cooldowns.len() as u32)),
    };

    let cooldown_secs = match (slots, free_slots) {
        (None, _) => 0,
        (Some(_), Some(free)) if free > 0 => 0,
        _ => cooldowns.iter().copied().min().unwrap_or(0).max(0) as u64,
    };

    let endpoint = ENDPOINT_RE.captures(body).and_then(|caps| {
        let raw = caps[1].trim();
        if raw.eq_ignore_ascii_case("none") {
            None
        } else {
            Some(raw.to_string())
        }
    });

    let nb_running_queries = RUNNING_QUERY_RE.find_iter(body).count() as u32;

    if let Some(slots) = slots {
        if let Some(free) = free_slots {
            if free > slots {
                return Err(malformed(body, "free_slots exceeds slots"));
            }
        }
    }

    Ok(Status {
        slots,
        free_slots,
        cooldown_secs,
        endpoint,
        nb_running_queries,
    })
}

fn malformed(body: &str, message: &str) -> ClientError {
    ClientError::ResponseError {
        status: None,
        body: body.to_string(),
        message: format!("malformed status body: {message}"),
        query_kwargs: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unlimited_slots() {
        let body = "Rate limit: 0\n";
        let status = parse_status(body).unwrap();
        assert_eq!(status.slots, None);
        assert_eq!(status.free_slots, None);
        assert_eq!(status.cooldown_secs, 0);
    }

    #[test]
    fn parses_free_slot_available_now() {
        let body = "Rate limit: 2\n2 slots available now.\n";
        let status = parse_status(body).unwrap();
        assert_eq!(status.slots, Some(2));
        assert_eq!(status.free_slots, Some(2));
        assert_eq!(status.cooldown_secs, 0);
    }

    #[test]
    fn derives_free_slots_from_cooldown_entries() {
        let body = "Rate limit: 2\nSlot available after: 2024-01-01T00:00:00Z, in 5 seconds.\n";
        let status = parse_status(body).unwrap();
        assert_eq!(status.slots, Some(2));
        assert_eq!(status.free_slots, Some(1));
        assert_eq!(status.cooldown_secs, 5);
    }

    #[test]
    fn parses_announced_endpoint() {
        let body = "Rate limit: 2\n2 slots available now.\nAnnounced endpoint: gall.openstreetmap.de\n";
        let status = parse_status(body).unwrap();
        assert_eq!(status.endpoint.as_deref(), Some("gall.openstreetmap.de"));
    }

    #[test]
    fn announced_endpoint_none_literal_is_none() {
        let body = "Rate limit: 2\n2 slots available now.\nAnnounced endpoint: none\n";
        let status = parse_status(body).unwrap();
        assert_eq!(status.endpoint, None);
    }

    #[test]
    fn counts_running_queries() {
        let body = "Rate limit: 2\n2 slots available now.\nCurrently running queries (pid, space limit, time limit, start time):\n123\t0\t0\t2024-01-01T00:00:00Z\n456\t0\t0\t2024-01-01T00:00:01Z\n";
        let status = parse_status(body).unwrap();
        assert_eq!(status.nb_running_queries, 2);
    }

    #[test]
    fn display_unlimited_slots() {
        let status = parse_status("Rate limit: 0\n").unwrap();
        assert_eq!(status.to_string(), "Status(slots=∞, cooldown=0s)");
    }

    #[test]
    fn display_limited_slots() {
        let status = parse_status("Rate limit: 2\n2 slots available now.\n").unwrap();
        assert_eq!(status.to_string(), "Status(slots=2/2, cooldown=0s)");
    }

    #[test]
    fn missing_rate_limit_is_malformed() {
        let err = parse_status("garbage").unwrap_err();
        assert!(matches!(err, ClientError::ResponseError { .. }));
    }
}
