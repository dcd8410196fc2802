//! Viterbi route-inference decoder (`spec.md` §4.5). Reconstructs the most
//! likely sequence of relaying public keys from the single-byte path
//! tokens attached to a forwarded frame.

use super::geo::haversine_km;
use super::model::{emission_score, sigma, transition_score, Candidate};
use crate::config::GeoscoreWeights;
use serde::Serialize;

const MAX_CANDIDATES_PER_TOKEN: usize = 25;
const DIAGNOSTIC_TOP_N: usize = 5;

#[derive(Clone, Debug, Serialize)]
pub struct TokenDiagnostic {
    pub token: String,
    pub top_candidates: Vec<(String, f64)>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RouteDiagnostics {
    pub per_token: Vec<TokenDiagnostic>,
    pub zero_candidate_tokens: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RouteResult {
    pub ts_ms: i64,
    pub observer_id: String,
    pub path: Vec<String>,
    pub inferred_pub: Vec<Option<String>>,
    pub hop_confidence: Vec<f64>,
    pub route_confidence: f64,
    pub unresolved: bool,
    pub teleport_max_km: Option<f64>,
    pub diagnostics: RouteDiagnostics,
}

/// `(tokens, observerId, ts, observerHome?, candidatesByToken, edgePrior) ->
/// RouteResult | None`. Returns `None` for an empty token list (`spec.md`
/// §4.5 edge cases).
pub fn infer_route<F, E>(
    tokens: &[String],
    observer_id: &str,
    ts_ms: i64,
    now_ms: i64,
    observer_home: Option<(f64, f64)>,
    mut candidates_by_token: F,
    edge_prior: E,
    weights: &GeoscoreWeights,
) -> Option<RouteResult>
where
    F: FnMut(&str) -> Vec<Candidate>,
    E: Fn(&str, &str) -> u32,
{
    if tokens.is_empty() {
        return None;
    }

    let mut per_position: Vec<Vec<(Candidate, f64)>> = Vec::with_capacity(tokens.len());
    let mut zero_candidate_tokens = Vec::new();
    for token in tokens {
        let raw_candidates = candidates_by_token(token);
        let mut scored: Vec<(Candidate, f64)> = raw_candidates
            .into_iter()
            .map(|c| {
                let e = emission_score(&c, observer_home, now_ms, weights);
                (c, e)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(MAX_CANDIDATES_PER_TOKEN);
        if scored.is_empty() {
            zero_candidate_tokens.push(token.clone());
        }
        per_position.push(scored);
    }

    let diagnostics = build_diagnostics(tokens, &per_position, &zero_candidate_tokens);

    if !zero_candidate_tokens.is_empty() {
        return Some(RouteResult {
            ts_ms,
            observer_id: observer_id.to_string(),
            path: tokens.to_vec(),
            inferred_pub: vec![None; tokens.len()],
            hop_confidence: vec![0.0; tokens.len()],
            route_confidence: 0.0,
            unresolved: true,
            teleport_max_km: None,
            diagnostics,
        });
    }

    let n = per_position.len();
    // dp[pos][i] = best cumulative score ending at candidate i of position pos
    let mut dp: Vec<Vec<f64>> = Vec::with_capacity(n);
    let mut backptr: Vec<Vec<Option<usize>>> = Vec::with_capacity(n);

    dp.push(per_position[0].iter().map(|(_, e)| *e).collect());
    backptr.push(vec![None; per_position[0].len()]);

    for pos in 1..n {
        let mut scores = Vec::with_capacity(per_position[pos].len());
        let mut backs = Vec::with_capacity(per_position[pos].len());
        for (cand, emission) in &per_position[pos] {
            let mut best = f64::NEG_INFINITY;
            let mut best_idx = 0usize;
            for (prev_idx, (prev_cand, _)) in per_position[pos - 1].iter().enumerate() {
                let d = match (prev_cand.gps, cand.gps) {
                    (Some(p), Some(c)) => Some(haversine_km(p, c)),
                    _ => None,
                };
                let edge_count = edge_prior(&prev_cand.pub_key, &cand.pub_key);
                let trans = transition_score(d, edge_count, weights);
                let total = dp[pos - 1][prev_idx] + trans;
                if total > best {
                    best = total;
                    best_idx = prev_idx;
                }
            }
            scores.push(best + emission);
            backs.push(Some(best_idx));
        }
        dp.push(scores);
        backptr.push(backs);
    }

    let last = n - 1;
    let mut order: Vec<usize> = (0..dp[last].len()).collect();
    order.sort_by(|&a, &b| dp[last][b].partial_cmp(&dp[last][a]).unwrap_or(std::cmp::Ordering::Equal));
    let best_idx = order[0];
    let best_total = dp[last][best_idx];
    let second_total = order.get(1).map(|&i| dp[last][i]).unwrap_or(f64::NEG_INFINITY);
    let route_confidence = sigma(best_total - second_total);

    let mut path_idx = vec![0usize; n];
    path_idx[last] = best_idx;
    for pos in (1..n).rev() {
        path_idx[pos - 1] = backptr[pos][path_idx[pos]].unwrap_or(0);
    }

    let mut hop_confidence = Vec::with_capacity(n);
    for row in &dp {
        let mut vals = row.clone();
        vals.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        let best = vals[0];
        let second = vals.get(1).copied().unwrap_or(f64::NEG_INFINITY);
        hop_confidence.push(sigma(best - second));
    }

    let inferred_pub: Vec<Option<String>> = path_idx
        .iter()
        .enumerate()
        .map(|(pos, &idx)| Some(per_position[pos][idx].0.pub_key.clone()))
        .collect();

    let mut teleport_max = 0.0f64;
    for pos in 1..n {
        let prev = &per_position[pos - 1][path_idx[pos - 1]].0;
        let cur = &per_position[pos][path_idx[pos]].0;
        if let (Some(p), Some(c)) = (prev.gps, cur.gps) {
            let d = haversine_km(p, c);
            if d > teleport_max {
                teleport_max = d;
            }
        }
    }

    let unresolved = route_confidence < weights.route_conf_threshold
        || hop_confidence.iter().any(|&c| c < weights.hop_conf_threshold);

    Some(RouteResult {
        ts_ms,
        observer_id: observer_id.to_string(),
        path: tokens.to_vec(),
        inferred_pub,
        hop_confidence,
        route_confidence,
        unresolved,
        teleport_max_km: if n > 1 { Some(teleport_max) } else { None },
        diagnostics,
    })
}

fn build_diagnostics(
    tokens: &[String],
    per_position: &[Vec<(Candidate, f64)>],
    zero_candidate_tokens: &[String],
) -> RouteDiagnostics {
    let per_token = tokens
        .iter()
        .zip(per_position.iter())
        .map(|(token, scored)| TokenDiagnostic {
            token: token.clone(),
            top_candidates: scored
                .iter()
                .take(DIAGNOSTIC_TOP_N)
                .map(|(c, e)| (c.pub_key.clone(), *e))
                .collect(),
        })
        .collect();
    RouteDiagnostics {
        per_token,
        zero_candidate_tokens: zero_candidate_tokens.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(pub_key: &str, gps: Option<(f64, f64)>) -> Candidate {
        Candidate {
            pub_key: pub_key.to_string(),
            name: None,
            gps,
            last_seen_ms: Some(1_000),
        }
    }

    #[test]
    fn resolves_two_hop_route_with_nearby_candidates() {
        let weights = GeoscoreWeights::default();
        let x = cand("X", Some((53.4, -2.2)));
        let y = cand("Y", Some((53.5, -2.1)));
        let z = cand("Z", Some((53.6, -2.0)));
        let result = infer_route(
            &["11".to_string(), "A3".to_string()],
            "obs-1",
            5_000,
            6_000,
            Some((53.7, -1.9)),
            |token| {
                if token == "11" {
                    vec![x.clone(), y.clone()]
                } else {
                    vec![z.clone()]
                }
            },
            |_, _| 0,
            &weights,
        )
        .unwrap();
        assert!(!result.unresolved);
        assert!(result.inferred_pub.iter().all(|p| p.is_some()));
        assert!(result.route_confidence > 0.65);
        assert!(result.teleport_max_km.unwrap() < 30.0);
    }

    #[test]
    fn unresolved_when_token_has_zero_candidates() {
        let weights = GeoscoreWeights::default();
        let result = infer_route(
            &["FF".to_string()],
            "obs-1",
            1_000,
            1_000,
            None,
            |_| Vec::new(),
            |_, _| 0,
            &weights,
        )
        .unwrap();
        assert!(result.unresolved);
        assert_eq!(result.inferred_pub, vec![None]);
        assert_eq!(result.hop_confidence, vec![0.0]);
        assert!(result
            .diagnostics
            .zero_candidate_tokens
            .contains(&"FF".to_string()));
    }

    #[test]
    fn empty_token_list_returns_none() {
        let weights = GeoscoreWeights::default();
        let result = infer_route(&[], "obs-1", 1_000, 1_000, None, |_| Vec::new(), |_, _| 0, &weights);
        assert!(result.is_none());
    }

    #[test]
    fn single_token_equivalent_to_argmax_emission() {
        let weights = GeoscoreWeights::default();
        let near = cand("NEAR", Some((53.4, -2.2)));
        let far = cand("FAR", Some((10.0, 10.0)));
        let result = infer_route(
            &["11".to_string()],
            "obs-1",
            1_000,
            1_000,
            Some((53.4, -2.2)),
            |_| vec![far.clone(), near.clone()],
            |_, _| 0,
            &weights,
        )
        .unwrap();
        assert_eq!(result.inferred_pub[0].as_deref(), Some("NEAR"));
    }

    #[test]
    fn implausible_teleport_lowers_confidence_and_marks_unresolved() {
        let weights = GeoscoreWeights::default();
        let a = cand("A", Some((0.0, 0.0)));
        let b = cand("B", Some((18.0, 0.0))); // ~2000km away
        let result = infer_route(
            &["11".to_string(), "A3".to_string()],
            "obs-1",
            1_000,
            1_000,
            None,
            |token| if token == "11" { vec![a.clone()] } else { vec![b.clone()] },
            |_, _| 0,
            &weights,
        )
        .unwrap();
        assert!(result.teleport_max_km.unwrap() > 1900.0);
        assert!(result.unresolved);
    }

    #[test]
    fn candidate_list_truncated_to_top_25() {
        let weights = GeoscoreWeights::default();
        let many: Vec<Candidate> = (0..40)
            .map(|i| cand(&format!("C{i}"), Some((53.0 + i as f64 * 0.001, -2.0))))
            .collect();
        let result = infer_route(
            &["11".to_string()],
            "obs-1",
            1_000,
            1_000,
            Some((53.0, -2.0)),
            move |_| many.clone(),
            |_, _| 0,
            &weights,
        )
        .unwrap();
        assert!(result.diagnostics.per_token[0].top_candidates.len() <= 5);
    }
}
