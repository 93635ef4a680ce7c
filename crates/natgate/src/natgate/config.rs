use std::{
    collections::HashSet,
    fs,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::natgate::{
    net,
    tunnel::{
        auth::StaticAgent,
        client::ClientOptions,
        flows::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE},
        protocol::{ListenProto, Token},
        transport::parse_transport,
    },
};

pub const CONFIG_ENV: &str = "NATGATE_CONFIG";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(&p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("natgate.toml"));
        }
        return Ok(p);
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["natgate.toml", "natgate.yaml", "natgate.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no natgate.* found in {}", dir.display())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    if cfg!(target_os = "linux") {
        return Ok(PathBuf::from("/etc/natgate/natgate.toml"));
    }
    let proj = ProjectDirs::from("dev", "natgate", "natgate").context("config: resolve user config dir")?;
    Ok(proj.config_dir().join("natgate.toml"))
}

/// Writes the default template to `path` unless something already exists there.
/// Returns whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn config_ext(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match config_ext(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match config_ext(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?,
        other => anyhow::bail!("config: unsupported config extension {other:?}"),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    /// Prometheus scrape listener. Disabled when unset.
    pub metrics_addr: Option<SocketAddr>,
    pub controller: Option<ControllerConfig>,
    pub agent: Option<AgentConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "json" => Ok(LogFormat::Json),
            "text" => Ok(LogFormat::Text),
            other => anyhow::bail!("config: unknown logging.format {other:?} (expected text|json)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// `stderr`, `stdout`, `discard` or a file path.
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Json,
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub listen_addr: String,
    pub transport: String,
    pub bind_ip: IpAddr,
    pub initial_chunk_size: usize,
    pub udp_idle_timeout: Option<Duration>,
    pub agents: Vec<StaticAgent>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub servers: Vec<String>,
    pub transport: String,
    pub token: Token,
    pub tcp_target: Option<String>,
    pub udp_target: Option<String>,
    pub dial_timeout: Duration,
    pub auth_timeout: Duration,
    pub auth_retry_delay: Duration,
    pub auth_max_attempts: u32,
    pub heartbeat_interval: Duration,
    pub dead_after: Option<Duration>,
    pub initial_chunk_size: usize,
}

impl AgentConfig {
    pub fn client_options(&self) -> ClientOptions {
        let mut o = ClientOptions::new(self.servers.clone(), self.token);
        o.transport = self.transport.clone();
        o.dial_timeout = self.dial_timeout;
        o.auth_timeout = self.auth_timeout;
        o.auth_retry_delay = self.auth_retry_delay;
        o.auth_max_attempts = self.auth_max_attempts;
        o.heartbeat_interval = self.heartbeat_interval;
        o.dead_after = self.dead_after;
        o.initial_chunk_size = self.initial_chunk_size;
        o
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    logging: Option<FileLogging>,
    #[serde(default)]
    metrics_addr: String,
    controller: Option<FileController>,
    agent: Option<FileAgent>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileController {
    listen_addr: String,
    transport: Option<String>,
    #[serde(default)]
    bind_ip: String,
    initial_chunk_size: Option<usize>,
    #[serde(default)]
    udp_idle_timeout_ms: u64,
    #[serde(default)]
    agents: Vec<FileAgentEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileAgentEntry {
    token: String,
    #[serde(default)]
    proto: String,
    #[serde(default)]
    tcp_port: u16,
    #[serde(default)]
    udp_port: u16,
    #[serde(default)]
    blocked: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileAgent {
    servers: StringOrVec,
    transport: Option<String>,
    token: String,
    tcp_target: Option<String>,
    udp_target: Option<String>,
    dial_timeout_ms: Option<u64>,
    auth_timeout_ms: Option<u64>,
    auth_retry_ms: Option<u64>,
    auth_max_attempts: Option<u32>,
    heartbeat_ms: Option<u64>,
    #[serde(default)]
    dead_after_ms: u64,
    initial_chunk_size: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum StringOrVec {
    One(String),
    Many(Vec<String>),
}

impl StringOrVec {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrVec::One(s) => vec![s],
            StringOrVec::Many(v) => v,
        }
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn millis_or(v: Option<u64>, default_ms: u64) -> Duration {
    Duration::from_millis(v.filter(|&ms| ms > 0).unwrap_or(default_ms))
}

fn optional_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn chunk_size(v: Option<usize>, field: &str) -> anyhow::Result<usize> {
    match v {
        None | Some(0) => Ok(DEFAULT_CHUNK_SIZE),
        Some(n) if (MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&n) => Ok(n),
        Some(n) => anyhow::bail!("config: {field} = {n} is outside {MIN_CHUNK_SIZE}..={MAX_CHUNK_SIZE}"),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut logging = LoggingConfig::default();
        if let Some(l) = fc.logging {
            if let Some(level) = non_empty(l.level) {
                logging.level = level.to_ascii_lowercase();
            }
            if let Some(format) = l.format {
                logging.format = format.parse()?;
            }
            if let Some(output) = non_empty(l.output) {
                logging.output = output;
            }
            logging.add_source = l.add_source;
        }

        let metrics_addr = match fc.metrics_addr.trim() {
            "" => None,
            raw => Some(
                net::normalize_bind_addr(raw)
                    .parse::<SocketAddr>()
                    .with_context(|| format!("config: invalid metrics_addr {raw:?}"))?,
            ),
        };

        let controller = fc.controller.map(controller_from_file).transpose()?;
        let agent = fc.agent.map(agent_from_file).transpose()?;

        if controller.is_none() && agent.is_none() {
            anyhow::bail!("config: nothing to run (set [controller] and/or [agent])");
        }

        Ok(Config {
            logging,
            metrics_addr,
            controller,
            agent,
        })
    }
}

fn controller_from_file(fc: FileController) -> anyhow::Result<ControllerConfig> {
    let listen_addr = net::normalize_bind_addr(&fc.listen_addr).into_owned();
    if listen_addr.is_empty() {
        anyhow::bail!("config: controller.listen_addr is required");
    }
    let transport = parse_transport(fc.transport.as_deref().unwrap_or(""))?;
    let bind_ip = net::parse_bind_ip(&fc.bind_ip)
        .with_context(|| format!("config: invalid controller.bind_ip {:?}", fc.bind_ip))?;

    let mut seen = HashSet::new();
    let mut agents = Vec::with_capacity(fc.agents.len());
    for (i, a) in fc.agents.into_iter().enumerate() {
        let token: Token = a
            .token
            .parse()
            .with_context(|| format!("config: controller.agents[{i}].token"))?;
        if !seen.insert(token) {
            anyhow::bail!("config: controller.agents[{i}] repeats token {token}");
        }
        let proto: ListenProto = a
            .proto
            .parse()
            .with_context(|| format!("config: controller.agents[{i}].proto"))?;
        let blocked = a
            .blocked
            .iter()
            .map(|s| {
                s.trim()
                    .parse::<IpAddr>()
                    .with_context(|| format!("config: controller.agents[{i}].blocked entry {s:?}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        agents.push(StaticAgent {
            token,
            proto,
            tcp_port: a.tcp_port,
            udp_port: a.udp_port,
            blocked,
        });
    }

    Ok(ControllerConfig {
        listen_addr,
        transport,
        bind_ip,
        initial_chunk_size: chunk_size(fc.initial_chunk_size, "controller.initial_chunk_size")?,
        udp_idle_timeout: optional_millis(fc.udp_idle_timeout_ms),
        agents,
    })
}

fn agent_from_file(fa: FileAgent) -> anyhow::Result<AgentConfig> {
    let servers: Vec<String> = fa
        .servers
        .into_vec()
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if servers.is_empty() {
        anyhow::bail!("config: agent.servers must list at least one controller");
    }
    let token: Token = fa.token.parse().context("config: agent.token")?;
    let tcp_target = non_empty(fa.tcp_target);
    let udp_target = non_empty(fa.udp_target);
    if tcp_target.is_none() && udp_target.is_none() {
        anyhow::bail!("config: agent needs tcp_target and/or udp_target");
    }

    Ok(AgentConfig {
        servers,
        transport: parse_transport(fa.transport.as_deref().unwrap_or(""))?,
        token,
        tcp_target,
        udp_target,
        dial_timeout: millis_or(fa.dial_timeout_ms, 5_000),
        auth_timeout: millis_or(fa.auth_timeout_ms, 5_000),
        auth_retry_delay: millis_or(fa.auth_retry_ms, 3_000),
        auth_max_attempts: fa.auth_max_attempts.filter(|&n| n > 0).unwrap_or(25),
        heartbeat_interval: millis_or(fa.heartbeat_ms, 5_000),
        dead_after: optional_millis(fa.dead_after_ms),
        initial_chunk_size: chunk_size(fa.initial_chunk_size, "agent.initial_chunk_size")?,
    })
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# natgate configuration (auto-generated)
#
# This file was created because natgate could not find a configuration file at the
# resolved config path. It starts a controller that waits for agents; add entries to
# [[controller.agents]] to let them in.

# metrics_addr = ":9100"

[logging]
level = "info"
format = "json"   # json | text
output = "stderr" # stderr | stdout | discard | /path/to/file
add_source = false

[controller]
listen_addr = ":7000"
transport = "udp" # udp | tcp
bind_ip = ""
udp_idle_timeout_ms = 0

# [[controller.agents]]
# token = "000000000000000000000000000000000000"
# proto = "both" # tcp | udp | both
# tcp_port = 0   # 0 picks a free port
# udp_port = 0
# blocked = []

# [agent]
# servers = ["controller.example.com:7000"]
# transport = "udp"
# token = "000000000000000000000000000000000000"
# tcp_target = "127.0.0.1:25565"
# udp_target = "127.0.0.1:19132"
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# natgate configuration (auto-generated)
#
# This file was created because natgate could not find a configuration file at the
# resolved config path. It starts a controller that waits for agents; add entries to
# controller.agents to let them in.

# metrics_addr: ":9100"

logging:
  level: info
  format: json
  output: stderr
  add_source: false

controller:
  listen_addr: ":7000"
  transport: udp
  bind_ip: ""
  udp_idle_timeout_ms: 0
  agents: []
  # - token: "000000000000000000000000000000000000"
  #   proto: both
  #   tcp_port: 0
  #   udp_port: 0
  #   blocked: []

# agent:
#   servers: ["controller.example.com:7000"]
#   transport: udp
#   token: "000000000000000000000000000000000000"
#   tcp_target: "127.0.0.1:25565"
#   udp_target: "127.0.0.1:19132"
"#;
