//! Typed configuration loaded once at startup from the environment
//! variables listed in `spec.md` §6. Parsing happens here, centrally,
//! instead of scattered `std::env::var` calls at each use site — the one
//! exception the teacher makes (`PORT`) is folded in as `query_port`.

use crate::error::MeshrankError;

#[derive(Clone, Debug)]
pub struct GeoscoreWeights {
    pub w_obs: f64,
    pub w_rel: f64,
    pub w_dist: f64,
    pub w_edge: f64,
    pub route_conf_threshold: f64,
    pub hop_conf_threshold: f64,
}

impl Default for GeoscoreWeights {
    fn default() -> Self {
        Self {
            w_obs: 1.0,
            w_rel: 1.0,
            w_dist: 0.3,
            w_edge: 0.15,
            route_conf_threshold: 0.65,
            hop_conf_threshold: 0.60,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mqtt_url: String,
    pub mqtt_topic: String,
    pub mqtt_user: Option<String>,
    pub mqtt_pass: Option<String>,
    pub mqtt_reconnect_secs: u64,
    pub db_path: String,
    pub archive_path: String,
    pub keyfile_path: Option<String>,
    pub keyfile_poll_secs: u64,
    pub route_scorer_interval_secs: u64,
    pub metrics_flush_interval_secs: u64,
    pub query_port: u16,
    pub geoscore: GeoscoreWeights,
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Loads configuration from the environment. Fails fast
    /// (configuration-fatal, per `spec.md` §7) when a required variable is
    /// missing, since there is no sane default for where to connect.
    pub fn from_env() -> Result<Self, MeshrankError> {
        let mqtt_url = env_str("MESHRANK_MQTT_URL")
            .ok_or_else(|| MeshrankError::Fatal("MESHRANK_MQTT_URL is required".into()))?;
        let mqtt_topic = env_str("MESHRANK_MQTT_TOPIC")
            .unwrap_or_else(|| "meshrank/observers/+/packets".to_string());
        let db_path = env_str("MESHRANK_DB_PATH").unwrap_or_else(|| "meshrank.db".to_string());

        let geoscore = GeoscoreWeights {
            w_obs: env_parsed("GEOSCORE_OBS_WEIGHT", GeoscoreWeights::default().w_obs),
            w_rel: env_parsed("GEOSCORE_REL_WEIGHT", GeoscoreWeights::default().w_rel),
            w_dist: env_parsed("GEOSCORE_DIST_WEIGHT", GeoscoreWeights::default().w_dist),
            w_edge: env_parsed("GEOSCORE_EDGE_WEIGHT", GeoscoreWeights::default().w_edge),
            route_conf_threshold: env_parsed(
                "GEOSCORE_ROUTE_CONF",
                GeoscoreWeights::default().route_conf_threshold,
            ),
            hop_conf_threshold: env_parsed(
                "GEOSCORE_HOP_CONF",
                GeoscoreWeights::default().hop_conf_threshold,
            ),
        };

        Ok(Self {
            mqtt_url,
            mqtt_topic,
            mqtt_user: env_str("MESHRANK_MQTT_USER"),
            mqtt_pass: env_str("MESHRANK_MQTT_PASS"),
            mqtt_reconnect_secs: env_parsed("MESHRANK_MQTT_RECONNECT_SECS", 5),
            db_path,
            archive_path: env_str("MESHRANK_ARCHIVE_PATH")
                .unwrap_or_else(|| "meshrank_observer_reports.ndjson".to_string()),
            keyfile_path: env_str("MESHRANK_KEYFILE_PATH"),
            keyfile_poll_secs: env_parsed("MESHRANK_KEYFILE_POLL_SECS", 10),
            route_scorer_interval_secs: env_parsed("MESHRANK_ROUTE_SCORER_INTERVAL_SECS", 15),
            metrics_flush_interval_secs: env_parsed("MESHRANK_METRICS_FLUSH_INTERVAL_SECS", 30),
            query_port: env_parsed("PORT", 8080),
            geoscore,
        })
    }
}
