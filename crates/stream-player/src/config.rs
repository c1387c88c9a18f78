use std::time::Duration;

use audio_engine::EngineConfig;
use audio_engine::source::HttpSourceConfig;

#[derive(Clone, Debug)]
pub struct PlayConfig {
    pub inputs: Vec<String>,
    pub device: Option<String>,
    pub engine: EngineConfig,
    pub connect_timeout_secs: u64,
    pub max_redirects: usize,
}

#[derive(Clone, Debug)]
pub struct ProbeConfig {
    pub input: String,
    pub engine: EngineConfig,
    pub connect_timeout_secs: u64,
}

pub fn http_config(connect_timeout_secs: u64) -> HttpSourceConfig {
    HttpSourceConfig {
        connect_timeout: Duration::from_secs(connect_timeout_secs.max(1)),
    }
}
