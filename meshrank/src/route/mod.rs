//! Route inference engine (`spec.md` §4.5).

pub mod geo;
pub mod model;
pub mod scorer;
pub mod viterbi;

pub use model::Candidate;
pub use scorer::score_pending_messages;
pub use viterbi::{infer_route, RouteDiagnostics, RouteResult, TokenDiagnostic};
