use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use twilight_model::gateway::payload::outgoing::update_presence::UpdatePresencePayload;
use twilight_model::gateway::presence::{Activity, ActivityType, MinimalActivity, Status};
use twilight_model::gateway::Intents;

use crate::error::ConfigError;
use crate::event::EventKind;
use crate::gateway::{BackoffConfig, IdentifyOptions, SessionConfig, ShardInfo};
use crate::log::TracingSink;

pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceMode {
    Online,
    Busy,
    Idle,
    Invisible,
}

impl PresenceMode {
    pub fn status(self) -> Status {
        match self {
            PresenceMode::Online => Status::Online,
            PresenceMode::Busy => Status::DoNotDisturb,
            PresenceMode::Idle => Status::Idle,
            PresenceMode::Invisible => Status::Invisible,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BackoffSettings {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            max_ms: 60_000,
            jitter: 0.5,
        }
    }
}

impl BackoffSettings {
    pub fn to_config(&self) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(self.base_ms),
            max: Duration::from_millis(self.max_ms),
            jitter: self.jitter,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub missed_ack_threshold: u32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            missed_ack_threshold: 2,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct Client {
    pub token: String,
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    pub shard_count: u32,
    /// Indices run by this process; all of them when absent.
    pub shards: Option<Vec<u32>>,
    #[serde(default)]
    pub intents: u64,
    pub presence: Option<PresenceMode>,
    pub status: Option<String>,
    #[serde(default)]
    pub backoff: BackoffSettings,
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
}

fn default_gateway_url() -> String {
    DEFAULT_GATEWAY_URL.to_string()
}

impl Client {
    pub fn shard_indices(&self) -> Vec<u32> {
        match &self.shards {
            Some(shards) => shards.clone(),
            None => (0..self.shard_count).collect(),
        }
    }

    pub fn identify_options(&self) -> Vec<IdentifyOptions> {
        let token: Arc<str> = Arc::from(self.token.as_str());
        let intents = Intents::from_bits_truncate(self.intents);
        let presence = self.presence_payload();

        self.shard_indices()
            .into_iter()
            .map(|index| {
                let options = IdentifyOptions::new(ShardInfo::new(index, self.shard_count), Arc::clone(&token))
                    .intents(intents);
                match &presence {
                    Some(presence) => options.presence(presence.clone()),
                    None => options,
                }
            })
            .collect()
    }

    pub fn session_config(&self, name: &str) -> SessionConfig {
        SessionConfig {
            gateway_name: Arc::from(name),
            gateway_url: self.gateway_url.clone(),
            backoff: self.backoff.to_config(),
            missed_ack_threshold: self.heartbeat.missed_ack_threshold,
        }
    }

    fn presence_payload(&self) -> Option<UpdatePresencePayload> {
        if self.presence.is_none() && self.status.is_none() {
            return None;
        }

        let activities = self
            .status
            .iter()
            .map(|text| {
                Activity::from(MinimalActivity {
                    kind: ActivityType::Custom,
                    name: text.clone(),
                    url: None,
                })
            })
            .collect();

        Some(UpdatePresencePayload {
            activities,
            afk: false,
            since: None,
            status: self.presence.unwrap_or(PresenceMode::Online).status(),
        })
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid = |reason: String| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(format!("client {name}: {reason}")))
        };

        if self.shard_count == 0 {
            return invalid("shard_count must be at least 1".to_string());
        }

        let mut seen = HashSet::new();
        for index in self.shard_indices() {
            if index >= self.shard_count {
                return invalid(format!("shard {index} is out of range for {} shards", self.shard_count));
            }
            if !seen.insert(index) {
                return invalid(format!("shard {index} is listed twice"));
            }
        }

        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return invalid(format!("backoff jitter {} is outside [0, 1]", self.backoff.jitter));
        }
        if self.backoff.base_ms > self.backoff.max_ms {
            return invalid("backoff base_ms is greater than max_ms".to_string());
        }
        if self.heartbeat.missed_ack_threshold == 0 {
            return invalid("heartbeat missed_ack_threshold must be at least 1".to_string());
        }

        Ok(())
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Dispatch {
    pub capacity: usize,
    pub worker_threads: usize,
}

impl Default for Dispatch {
    fn default() -> Self {
        Self {
            capacity: crate::dispatch::DEFAULT_CAPACITY,
            worker_threads: 2,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Logging {
    pub filter: String,
    pub event_kinds: Option<Vec<String>>,
    pub shards: Option<Vec<u32>>,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            event_kinds: None,
            shards: None,
        }
    }
}

impl Logging {
    /// Event log sink narrowed to the configured kinds and shards.
    pub fn sink(&self) -> TracingSink {
        let mut sink = TracingSink::new();
        if let Some(kinds) = &self.event_kinds {
            sink = sink.only_kinds(kinds.iter().filter_map(|kind| kind.parse::<EventKind>().ok()));
        }
        if let Some(shards) = &self.shards {
            sink = sink.only_shards(shards.iter().copied());
        }
        sink
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub clients: BTreeMap<String, Client>,
    #[serde(default)]
    pub dispatch: Dispatch,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    pub fn read(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Config::load(&contents)
    }

    pub fn load(config_contents: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(config_contents)?;

        for (client_name, client) in config.clients.iter() {
            client.validate(client_name)?;
        }

        if config.dispatch.capacity == 0 {
            return Err(ConfigError::Invalid("dispatch capacity must be at least 1".to_string()));
        }
        if config.dispatch.worker_threads == 0 {
            return Err(ConfigError::Invalid("dispatch worker_threads must be at least 1".to_string()));
        }

        if let Some(kinds) = &config.logging.event_kinds {
            for kind in kinds {
                kind.parse::<EventKind>()
                    .map_err(|err| ConfigError::Invalid(format!("logging: {err}")))?;
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [clients.alpha]
        token = "secret"
        shard_count = 4
        shards = [1, 3]
        intents = 513
        presence = "busy"
        status = "proxying"

        [clients.alpha.backoff]
        base_ms = 250
        max_ms = 4000
        jitter = 0.25

        [clients.alpha.heartbeat]
        missed_ack_threshold = 3

        [clients.beta]
        token = "other"
        shard_count = 1

        [dispatch]
        capacity = 64
        worker_threads = 4

        [logging]
        filter = "debug"
        event_kinds = ["message_create", "READY"]
        shards = [1]
    "#;

    fn invalid(contents: &str) -> String {
        match Config::load(contents) {
            Err(ConfigError::Invalid(reason)) => reason,
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn loads_full_config() {
        let config = Config::load(FULL).unwrap();
        let alpha = &config.clients["alpha"];

        assert_eq!(alpha.shard_indices(), vec![1, 3]);
        assert_eq!(alpha.presence, Some(PresenceMode::Busy));
        assert_eq!(
            alpha.backoff.to_config(),
            BackoffConfig {
                base: Duration::from_millis(250),
                max: Duration::from_secs(4),
                jitter: 0.25,
            }
        );
        assert_eq!(config.dispatch.capacity, 64);
        assert_eq!(config.dispatch.worker_threads, 4);
        assert_eq!(config.logging.filter, "debug");

        let session = alpha.session_config("alpha");
        assert_eq!(&*session.gateway_name, "alpha");
        assert_eq!(session.gateway_url, DEFAULT_GATEWAY_URL);
        assert_eq!(session.missed_ack_threshold, 3);
    }

    #[test]
    fn defaults_apply() {
        let config = Config::load(
            r#"
            [clients.beta]
            token = "other"
            shard_count = 2
            "#,
        )
        .unwrap();
        let beta = &config.clients["beta"];

        assert_eq!(beta.shard_indices(), vec![0, 1]);
        assert_eq!(beta.backoff.to_config(), BackoffConfig::default());
        assert_eq!(beta.heartbeat.missed_ack_threshold, 2);
        assert_eq!(config.dispatch.capacity, 1024);
        assert_eq!(config.logging.filter, "info");
        assert!(beta.identify_options()[0].initial_presence().is_none());
    }

    #[test]
    fn identify_options_per_shard() {
        let config = Config::load(FULL).unwrap();
        let options = config.clients["alpha"].identify_options();

        assert_eq!(options.len(), 2);
        assert_eq!(options[1].shard(), ShardInfo::new(3, 4));
        assert_eq!(options[1].token(), "secret");
        assert_eq!(options[1].intent_bits().bits(), 513);

        let presence = options[0].initial_presence().unwrap();
        assert_eq!(presence.status, Status::DoNotDisturb);
        assert_eq!(presence.activities.len(), 1);
        assert_eq!(presence.activities[0].name, "proxying");
    }

    #[test]
    fn presence_modes_map_to_statuses() {
        assert_eq!(PresenceMode::Online.status(), Status::Online);
        assert_eq!(PresenceMode::Idle.status(), Status::Idle);
        assert_eq!(PresenceMode::Invisible.status(), Status::Invisible);
    }

    #[test]
    fn rejects_bad_shards() {
        let zero = invalid("[clients.a]\ntoken = \"t\"\nshard_count = 0\n");
        assert!(zero.contains("shard_count"), "{zero}");

        let range = invalid("[clients.a]\ntoken = \"t\"\nshard_count = 2\nshards = [2]\n");
        assert!(range.contains("out of range"), "{range}");

        let twice = invalid("[clients.a]\ntoken = \"t\"\nshard_count = 2\nshards = [1, 1]\n");
        assert!(twice.contains("listed twice"), "{twice}");
    }

    #[test]
    fn rejects_bad_backoff() {
        let jitter = invalid("[clients.a]\ntoken = \"t\"\nshard_count = 1\n[clients.a.backoff]\njitter = 1.5\n");
        assert!(jitter.contains("jitter"), "{jitter}");

        let order = invalid("[clients.a]\ntoken = \"t\"\nshard_count = 1\n[clients.a.backoff]\nbase_ms = 10\nmax_ms = 5\n");
        assert!(order.contains("base_ms"), "{order}");
    }

    #[test]
    fn rejects_bad_dispatch_and_logging() {
        assert!(invalid("[dispatch]\ncapacity = 0\n").contains("capacity"));
        assert!(invalid("[logging]\nevent_kinds = [\"NOPE\"]\n").contains("NOPE"));
    }

    #[test]
    fn surfaces_parse_errors() {
        assert!(matches!(Config::load("clients = 3"), Err(ConfigError::Parse(_))));
        assert!(matches!(Config::read("/nonexistent/shardlink.toml"), Err(ConfigError::Io(_))));
    }
}
