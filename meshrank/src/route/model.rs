//! Emission/transition scoring model (`spec.md` §4.5).

use super::geo::haversine_km;
use crate::config::GeoscoreWeights;

#[derive(Clone, Debug)]
pub struct Candidate {
    pub pub_key: String,
    pub name: Option<String>,
    pub gps: Option<(f64, f64)>,
    pub last_seen_ms: Option<i64>,
}

pub fn sigma(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// staleness(lastSeenMs): 0 within 24h, -1 within 7d, -3 beyond; -2 if
/// unknown.
fn staleness(last_seen_ms: Option<i64>, now_ms: i64) -> f64 {
    const DAY_MS: i64 = 24 * 3_600_000;
    const WEEK_MS: i64 = 7 * DAY_MS;
    match last_seen_ms {
        None => -2.0,
        Some(seen) => {
            let age = now_ms.saturating_sub(seen);
            if age <= DAY_MS {
                0.0
            } else if age <= WEEK_MS {
                -1.0
            } else {
                -3.0
            }
        }
    }
}

/// Emission for candidate `c` at any position:
/// `-log(1 + d_km/10) * Wobs + staleness(c.lastSeenMs) * Wrel`.
pub fn emission_score(
    candidate: &Candidate,
    observer_home: Option<(f64, f64)>,
    now_ms: i64,
    weights: &GeoscoreWeights,
) -> f64 {
    let distance_term = match (observer_home, candidate.gps) {
        (Some(home), Some(gps)) => {
            let d_km = haversine_km(home, gps);
            -(1.0 + d_km / 10.0).ln() * weights.w_obs
        }
        _ => 0.0,
    };
    let staleness_term = staleness(candidate.last_seen_ms, now_ms) * weights.w_rel;
    distance_term + staleness_term
}

/// Piecewise distance penalty `P(d)` (`spec.md` §4.5).
fn distance_penalty(d_km: f64) -> f64 {
    if d_km <= 100.0 {
        -d_km * 0.01
    } else if d_km <= 260.0 {
        -(1.0 + (d_km - 100.0) * 0.02)
    } else {
        -(4.0 + (d_km - 260.0) * 0.06)
    }
}

/// Transition from `prev` to `cand` separated by distance `d` (`None` when
/// either endpoint lacks GPS, which scores a flat -50 penalty).
pub fn transition_score(d_km: Option<f64>, edge_count: u32, weights: &GeoscoreWeights) -> f64 {
    let dist_term = match d_km {
        Some(d) => distance_penalty(d) * weights.w_dist,
        None => -50.0 * weights.w_dist,
    };
    let edge_term = weights.w_edge * (1.0 + edge_count as f64).ln();
    dist_term + edge_term
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_candidate_has_zero_staleness_penalty() {
        let w = GeoscoreWeights::default();
        let c = Candidate {
            pub_key: "X".to_string(),
            name: None,
            gps: None,
            last_seen_ms: Some(1_000),
        };
        let score = emission_score(&c, None, 1_000 + 60_000, &w);
        assert!((score - 0.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_last_seen_penalized_more_than_stale() {
        let w = GeoscoreWeights::default();
        let unknown = Candidate {
            pub_key: "X".to_string(),
            name: None,
            gps: None,
            last_seen_ms: None,
        };
        let stale = Candidate {
            pub_key: "Y".to_string(),
            name: None,
            gps: None,
            last_seen_ms: Some(0),
        };
        let now = 10 * 24 * 3_600_000;
        let score_unknown = emission_score(&unknown, None, now, &w);
        let score_stale = emission_score(&stale, None, now, &w);
        assert!(score_unknown < score_stale);
    }

    #[test]
    fn missing_gps_endpoint_penalizes_transition_heavily() {
        let w = GeoscoreWeights::default();
        assert_eq!(
            transition_score(None, 0, &w),
            -50.0 * w.w_dist + w.w_edge * 1f64.ln()
        );
    }

    #[test]
    fn short_hop_scores_better_than_long_hop() {
        let w = GeoscoreWeights::default();
        let short = transition_score(Some(5.0), 0, &w);
        let long = transition_score(Some(2000.0), 0, &w);
        assert!(short > long);
    }
}
