use crate::error::{PipelineError, Result};
use crate::feed::FeedParams;
use crate::record::{parse_feed_date, BoundingBox, FilterPredicates};
use envconfig::Envconfig;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time;

/// Ingestion bridge tuning, read from `FEED_*` environment variables
#[derive(Envconfig, Clone, Debug)]
pub struct BridgeConfig {
    #[envconfig(from = "FEED_QUEUE_CAPACITY", default = "100")]
    pub queue_capacity: usize,

    #[envconfig(from = "FEED_RECONNECT_BACKOFF_MS", default = "60000")]
    pub reconnect_backoff: EnvMsDuration,

    #[envconfig(from = "FEED_ENQUEUE_TIMEOUT_MS", default = "30000")]
    pub enqueue_timeout: EnvMsDuration,

    #[envconfig(from = "FEED_HIGH_WATERMARK", default = "80")]
    pub high_watermark: u32,

    #[envconfig(from = "FEED_LOW_WATERMARK", default = "40")]
    pub low_watermark: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            reconnect_backoff: EnvMsDuration(time::Duration::from_secs(60)),
            enqueue_timeout: EnvMsDuration(time::Duration::from_secs(30)),
            high_watermark: 80,
            low_watermark: 40,
        }
    }
}

/// Where and how to reach the feed
#[derive(Envconfig, Clone, Debug)]
pub struct FeedConfig {
    #[envconfig(
        from = "FEED_SAMPLE_URL",
        default = "https://stream.twitter.com/1.1/statuses/sample.json"
    )]
    pub sample_url: String,

    #[envconfig(
        from = "FEED_FILTER_URL",
        default = "https://stream.twitter.com/1.1/statuses/filter.json"
    )]
    pub filter_url: String,

    #[envconfig(from = "FEED_TOKEN")]
    pub token: Option<String>,

    #[envconfig(from = "FEED_CONNECT_TIMEOUT_MS", default = "3050")]
    pub connect_timeout: EnvMsDuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// One named filter: matching terms plus the file template its records are
/// grouped into
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterSpec {
    pub name: String,
    #[serde(default)]
    pub follow: Vec<u64>,
    #[serde(default)]
    pub track: Vec<String>,
    /// `sw_lon,sw_lat,ne_lon,ne_lat`
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub language: Vec<String>,
    /// Feed date format, e.g. `Fri Apr 13 00:00:00 +0000 2012`
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub split_template: String,
}

impl FilterSpec {
    pub fn predicates(&self) -> Result<FilterPredicates> {
        let locations = self
            .locations
            .iter()
            .map(|l| l.parse::<BoundingBox>())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let date = |d: &Option<String>| d.as_deref().map(parse_feed_date).transpose();

        Ok(FilterPredicates {
            follow: self.follow.iter().copied().collect(),
            track: self.track.iter().cloned().collect(),
            locations,
            language: self.language.iter().cloned().collect::<BTreeSet<_>>(),
            start_date: date(&self.start_date)?,
            end_date: date(&self.end_date)?,
        })
    }
}

/// The YAML filter file used by `filter` and `feed://filter`:
///
/// ```yaml
/// dustbin_template: dustbin/%Y-%m-%d.gz
/// filters:
///   - name: pinkpop
///     track: [pinkpop, pp12]
///     locations: ["4.7,52.3,5.0,52.4"]
///     split_template: pinkpop/%Y-%m-%d-%H.gz
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default)]
    pub dustbin_template: Option<String>,
    pub filters: Vec<FilterSpec>,
}

impl FilterConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| PipelineError::ConfigError(e.to_string()))?;
        if config.filters.is_empty() {
            return Err(PipelineError::ConfigError("no filters defined".into()));
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_yaml(&fs::read_to_string(path)?)
    }

    /// A blank dustbin template means no dustbin
    pub fn dustbin_template(&self) -> Option<&str> {
        self.dustbin_template
            .as_deref()
            .filter(|t| !t.trim().is_empty())
    }

    /// The union of all filters' terms
    pub fn global_filter(&self) -> Result<FilterPredicates> {
        let mut union = FilterPredicates::default();
        for filter in &self.filters {
            union = union | filter.predicates()?;
        }
        Ok(union)
    }

    pub fn feed_params(&self) -> Result<FeedParams> {
        Ok(FeedParams::from(&self.global_filter()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const YAML: &str = r#"
dustbin_template: "  "
filters:
  - name: pinkpop
    track: [pinkpop, pp12]
    language: [en]
    start_date: "Sun Apr 01 00:00:00 +0000 2012"
    split_template: "pinkpop/%Y-%m-%d.gz"
  - name: groningen
    follow: [10868922]
    locations: ["6.4,53.1,6.7,53.3"]
    split_template: "groningen/%Y-%m-%d.gz"
"#;

    #[test]
    fn test_bridge_config_defaults() {
        let config = BridgeConfig::init_from_hashmap(&HashMap::new()).unwrap();
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.reconnect_backoff.0, time::Duration::from_secs(60));
        assert_eq!(config.enqueue_timeout, BridgeConfig::default().enqueue_timeout);
        assert_eq!((config.high_watermark, config.low_watermark), (80, 40));
    }

    #[test]
    fn test_feed_config_from_env_map() {
        let env = HashMap::from([
            ("FEED_TOKEN".to_string(), "secret".to_string()),
            ("FEED_CONNECT_TIMEOUT_MS".to_string(), "500".to_string()),
        ]);
        let config = FeedConfig::init_from_hashmap(&env).unwrap();
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.connect_timeout.0, time::Duration::from_millis(500));
        assert!(config.filter_url.ends_with("filter.json"));
    }

    #[test]
    fn test_ms_duration_parse() {
        assert_eq!(
            "1500".parse::<EnvMsDuration>(),
            Ok(EnvMsDuration(time::Duration::from_millis(1500)))
        );
        assert_eq!("soon".parse::<EnvMsDuration>(), Err(ParseEnvMsDurationError));
    }

    #[test]
    fn test_filter_config() {
        let config = FilterConfig::from_yaml(YAML).unwrap();
        assert_eq!(config.filters.len(), 2);
        assert_eq!(config.dustbin_template(), None);

        let pinkpop = config.filters[0].predicates().unwrap();
        assert!(pinkpop.start_date.is_some());
        assert_eq!(pinkpop.language, BTreeSet::from(["en".to_string()]));

        let global = config.global_filter().unwrap();
        assert_eq!(global.track.len(), 2);
        assert_eq!(global.follow, BTreeSet::from([10868922]));
        assert_eq!(global.locations.len(), 1);
        assert_eq!(global.start_date, None);

        let params = config.feed_params().unwrap();
        assert_eq!(params.follow, vec![10868922]);
    }

    #[test]
    fn test_filter_config_errors() {
        assert!(FilterConfig::from_yaml("filters: []").is_err());
        assert!(FilterConfig::from_yaml("filters: [{name: x}]").is_err());

        let bad_box = "filters: [{name: x, locations: ['1,2,3'], split_template: 'x.gz'}]";
        let config = FilterConfig::from_yaml(bad_box).unwrap();
        assert!(config.global_filter().is_err());
    }
}
