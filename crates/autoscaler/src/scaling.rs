//! Scaling decisions as pure functions over gateway load reports.

use std::collections::HashMap;

pub const SCALE_UP_THRESHOLD: f64 = 1500.0;
pub const SCALE_DOWN_THRESHOLD: f64 = 100.0;
pub const MAX_GATEWAYS: usize = 10;

/// The permanent floor gateway, never scaled away.
pub const FLOOR_GATEWAY: &str = "gateway-01";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleAction {
    None,
    Up { gateway_id: String },
    Down { gateway_id: String },
}

/// `true` for directly-run gateway containers (`gateway-NN`).  Excludes
/// compose-managed names like `5ggateway-gateway-01-1`.
pub fn is_gateway_container(name: &str) -> bool {
    match name.strip_prefix("gateway-") {
        Some(rest) => !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

pub fn gateway_number(gateway_id: &str) -> Option<u32> {
    gateway_id.strip_prefix("gateway-")?.parse().ok()
}

pub fn format_gateway_id(num: u32) -> String {
    format!("gateway-{num:02}")
}

/// Highest numeric suffix among the reporting gateways, defaulting to 1.
pub fn highest_gateway_number<'a, I>(ids: I) -> u32
where
    I: IntoIterator<Item = &'a String>,
{
    ids.into_iter()
        .filter_map(|id| gateway_number(id))
        .max()
        .unwrap_or(1)
}

/// One decision per tick.  Scale-up and scale-down are mutually exclusive;
/// cooldown gating happens in the caller.
pub fn decide(rates: &HashMap<String, u64>) -> ScaleAction {
    let count = rates.len();
    if count == 0 {
        return ScaleAction::None;
    }

    let total: u64 = rates.values().sum();
    let avg = total as f64 / count as f64;
    let top = highest_gateway_number(rates.keys());

    if avg > SCALE_UP_THRESHOLD && count < MAX_GATEWAYS {
        ScaleAction::Up {
            gateway_id: format_gateway_id(top + 1),
        }
    } else if avg < SCALE_DOWN_THRESHOLD && count > 1 && top > 1 {
        ScaleAction::Down {
            gateway_id: format_gateway_id(top),
        }
    } else {
        ScaleAction::None
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn rates(entries: &[(&str, u64)]) -> HashMap<String, u64> {
        entries
            .iter()
            .map(|(id, rate)| (id.to_string(), *rate))
            .collect()
    }

    // -- container name filtering -------------------------------------------

    #[test]
    fn accepts_plain_gateway_names() {
        assert!(is_gateway_container("gateway-01"));
        assert!(is_gateway_container("gateway-10"));
    }

    #[test]
    fn rejects_compose_managed_names() {
        assert!(!is_gateway_container("5ggateway-gateway-01-1"));
        assert!(!is_gateway_container("gateway-01-1"));
    }

    #[test]
    fn rejects_unrelated_names() {
        assert!(!is_gateway_container("cloud-api"));
        assert!(!is_gateway_container("gateway-"));
        assert!(!is_gateway_container("gateway-extra"));
    }

    // -- numbering ----------------------------------------------------------

    #[test]
    fn gateway_number_parses_suffix() {
        assert_eq!(gateway_number("gateway-03"), Some(3));
        assert_eq!(gateway_number("gateway-10"), Some(10));
        assert_eq!(gateway_number("cloud-api"), None);
    }

    #[test]
    fn format_pads_to_two_digits() {
        assert_eq!(format_gateway_id(3), "gateway-03");
        assert_eq!(format_gateway_id(10), "gateway-10");
    }

    #[test]
    fn highest_number_defaults_to_one() {
        assert_eq!(highest_gateway_number(&rates(&[]).into_keys().collect::<Vec<_>>()), 1);
    }

    // -- decisions ----------------------------------------------------------

    #[test]
    fn scales_up_above_threshold() {
        // avg = 1800 > 1500, so the next gateway after the highest starts.
        let action = decide(&rates(&[("gateway-01", 2000), ("gateway-02", 1600)]));
        assert_eq!(
            action,
            ScaleAction::Up {
                gateway_id: "gateway-03".to_string()
            }
        );
    }

    #[test]
    fn no_scale_up_at_max_fleet() {
        let mut fleet = Vec::new();
        for n in 1..=MAX_GATEWAYS {
            fleet.push((format_gateway_id(n as u32), 5000u64));
        }
        let fleet: HashMap<String, u64> = fleet.into_iter().collect();
        assert_eq!(decide(&fleet), ScaleAction::None);
    }

    #[test]
    fn scales_down_below_threshold() {
        let action = decide(&rates(&[("gateway-01", 10), ("gateway-02", 20)]));
        assert_eq!(
            action,
            ScaleAction::Down {
                gateway_id: "gateway-02".to_string()
            }
        );
    }

    #[test]
    fn floor_gateway_is_never_stopped() {
        // Only the floor gateway left with a near-zero rate: count > 1 fails.
        assert_eq!(decide(&rates(&[("gateway-01", 5)])), ScaleAction::None);

        // Scale-down always targets the highest-numbered gateway, which by
        // the top > 1 gate can never be the floor.
        match decide(&rates(&[("gateway-01", 0), ("gateway-04", 0)])) {
            ScaleAction::Down { gateway_id } => assert_eq!(gateway_id, "gateway-04"),
            other => panic!("expected scale down, got {other:?}"),
        }
    }

    #[test]
    fn mid_band_rate_does_nothing() {
        let action = decide(&rates(&[("gateway-01", 800), ("gateway-02", 700)]));
        assert_eq!(action, ScaleAction::None);
    }

    #[test]
    fn empty_report_does_nothing() {
        assert_eq!(decide(&HashMap::new()), ScaleAction::None);
    }
}
