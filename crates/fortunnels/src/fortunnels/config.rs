use std::{
    io::Read,
    sync::OnceLock,
    time::Duration,
};

use clap::Parser;
use thiserror::Error;
use url::Url;

const PROTO_HTTP: &str = "http";
const PROTO_HTTPS: &str = "https";
const PROTO_TCP: &str = "tcp";
const PROTO_UDP: &str = "udp";

const MAX_SECRET_BYTES: usize = 64 * 1024;

static DEFAULT_SERVER_URL: OnceLock<String> = OnceLock::new();

/// Override the compiled-in default server URL. Must be called before any
/// argument parsing or network I/O; later calls are ignored.
pub fn set_default_server_url(value: &str) {
    let v = value.trim();
    if !v.is_empty() {
        let _ = DEFAULT_SERVER_URL.set(v.to_string());
    }
}

pub fn default_server_url() -> &'static str {
    DEFAULT_SERVER_URL
        .get()
        .map(String::as_str)
        .unwrap_or("https://fortunnels.ru")
}

#[derive(Debug, Parser)]
#[command(
    name = "fortunnels",
    version,
    about = "ForTunnels client - expose a local TCP/UDP/HTTP service through a public relay"
)]
pub struct Cli {
    /// Login for server authentication
    #[arg(long)]
    pub login: Option<String>,

    /// Password for server authentication
    #[arg(long = "pass")]
    pub password: Option<String>,

    /// Bearer JWT to authorize API calls
    #[arg(long)]
    pub token: Option<String>,

    /// Read password from file
    #[arg(long = "pass-file")]
    pub password_file: Option<String>,

    /// Read bearer token from file
    #[arg(long = "token-file")]
    pub token_file: Option<String>,

    /// Read password from stdin
    #[arg(long = "pass-stdin")]
    pub password_stdin: bool,

    /// Read bearer token from stdin
    #[arg(long = "token-stdin")]
    pub token_stdin: bool,

    /// Server URL
    #[arg(long, env = "FORTUNNELS_SERVER_URL")]
    pub server: Option<String>,

    /// Allow non-local HTTP server URL (unsafe)
    #[arg(long = "allow-insecure-http")]
    pub allow_insecure_http: bool,

    /// Target address to tunnel
    #[arg(long = "local")]
    pub target_addr: Option<String>,

    /// Protocol (http, https, tcp, udp)
    #[arg(long)]
    pub protocol: Option<String>,

    /// Data-plane transport (ws|quic|dtls)
    #[arg(long = "dp", default_value = "ws")]
    pub data_plane: String,

    /// User ID
    #[arg(long = "user", default_value = "default")]
    pub user_id: String,

    /// Destination for TCP test (server-side)
    #[arg(long, default_value = "localhost:3333")]
    pub dst: String,

    /// Number of parallel streams for TCP test
    #[arg(long, default_value_t = 1)]
    pub parallel: usize,

    /// Local TCP listen address (e.g. :4000) for client TCP mode
    #[arg(long)]
    pub listen: Option<String>,

    /// Initial reconnect backoff seconds
    #[arg(long = "backoff-initial", default_value_t = 1)]
    pub backoff_initial_secs: u64,

    /// Max reconnect backoff seconds
    #[arg(long = "backoff-max", default_value_t = 30)]
    pub backoff_max_secs: u64,

    /// Local UDP listen address (e.g. :5353) for client UDP mode
    #[arg(long = "udp-listen")]
    pub udp_listen: Option<String>,

    /// Destination UDP address on server side (e.g. 127.0.0.1:53)
    #[arg(long = "udp-dst")]
    pub udp_dst: Option<String>,

    /// WebSocket ping interval
    #[arg(long = "ping-interval", value_parser = humantime::parse_duration, default_value = "30s")]
    pub ping_interval: Duration,

    /// WebSocket ping write deadline
    #[arg(long = "ping-timeout", value_parser = humantime::parse_duration, default_value = "10s")]
    pub ping_timeout: Duration,

    /// Multiplexer keepalive interval
    #[arg(long = "mux-keepalive-interval", value_parser = humantime::parse_duration, default_value = "25s")]
    pub mux_keepalive_interval: Duration,

    /// Multiplexer keepalive timeout
    #[arg(long = "mux-keepalive-timeout", value_parser = humantime::parse_duration, default_value = "60s")]
    pub mux_keepalive_timeout: Duration,

    /// HTTP poll interval after WS subscription (fallback monitoring)
    #[arg(long = "watch-interval", value_parser = humantime::parse_duration, default_value = "10s")]
    pub watch_interval: Duration,

    /// Watch tunnel updates over WebSocket (runs until closed)
    #[arg(long)]
    pub watch: bool,

    /// Enable client-side stream encryption (PSK)
    #[arg(long)]
    pub encrypt: bool,

    /// Pre-shared key for encryption
    #[arg(long)]
    pub psk: Option<String>,

    /// Read PSK from file
    #[arg(long = "psk-file")]
    pub psk_file: Option<String>,

    /// Read PSK from stdin
    #[arg(long = "psk-stdin")]
    pub psk_stdin: bool,

    /// Precomputed data-plane auth token (hex)
    #[arg(long = "dp-auth-token")]
    pub dp_auth_token: Option<String>,

    /// Secret for computing data-plane auth token (HMAC-SHA256 over tunnel_id)
    #[arg(long = "dp-auth-secret")]
    pub dp_auth_secret: Option<String>,

    /// Read data-plane auth token from file
    #[arg(long = "dp-auth-token-file")]
    pub dp_auth_token_file: Option<String>,

    /// Read data-plane auth secret from file
    #[arg(long = "dp-auth-secret-file")]
    pub dp_auth_secret_file: Option<String>,

    /// Read data-plane auth token from stdin
    #[arg(long = "dp-auth-token-stdin")]
    pub dp_auth_token_stdin: bool,

    /// Read data-plane auth secret from stdin
    #[arg(long = "dp-auth-secret-stdin")]
    pub dp_auth_secret_stdin: bool,

    /// Log level (trace|debug|info|warn|error)
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Log format (text|json)
    #[arg(long = "log-format", default_value = "text")]
    pub log_format: String,

    /// Log output (stderr|stdout|discard|<path>)
    #[arg(long = "log-output", default_value = "stderr")]
    pub log_output: String,

    /// Include source file and line number in log records
    #[arg(long = "log-source")]
    pub log_source: bool,

    /// Optional positional shorthand: [PROTOCOL] PORT|HOST:PORT
    #[arg(value_name = "ARGS")]
    pub args: Vec<String>,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ConfigError {
    pub message: String,
    pub hint: String,
}

impl ConfigError {
    fn new(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: hint.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

/// Timing knobs shared by the data-plane components.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub mux_keepalive_interval: Duration,
    pub mux_keepalive_timeout: Duration,
    pub watch_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct EncryptionSettings {
    pub enabled: bool,
    pub psk: String,
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub login: String,
    pub password: String,
    pub token: String,
    pub server_url: String,
    pub target_addr: String,
    pub protocol: String,
    pub data_plane: String,
    pub user_id: String,
    pub dst: String,
    pub parallel: usize,
    pub listen: String,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub udp_listen: String,
    pub udp_dst: String,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub mux_keepalive_interval: Duration,
    pub mux_keepalive_timeout: Duration,
    pub watch_interval: Duration,
    pub watch_ws: bool,
    pub encrypt: bool,
    pub psk: String,
    pub dp_auth_token: String,
    pub dp_auth_secret: String,
    pub allow_insecure_http: bool,
    pub logging: LoggingConfig,

    pub server_flag_provided: bool,
    pub token_flag_provided: bool,
    pub password_flag_provided: bool,
    pub psk_flag_provided: bool,
    pub dp_auth_token_flag_provided: bool,
    pub dp_auth_secret_flag_provided: bool,
}

impl Config {
    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            ping_interval: self.ping_interval,
            ping_timeout: self.ping_timeout,
            mux_keepalive_interval: self.mux_keepalive_interval,
            mux_keepalive_timeout: self.mux_keepalive_timeout,
            watch_interval: self.watch_interval,
        }
    }

    pub fn encryption_settings(&self) -> EncryptionSettings {
        EncryptionSettings {
            enabled: self.encrypt,
            psk: self.psk.clone(),
        }
    }
}

/// Resolve the parsed CLI into a `Config`: positional shorthand, secret
/// sources (env < file < stdin < flag) and defaults.
pub fn resolve(cli: Cli) -> Result<Config, ConfigError> {
    ensure_single_stdin_source(&cli)?;

    let server_flag_provided = cli.server.is_some();
    let protocol_provided = cli.protocol.is_some();
    let target_provided = cli.target_addr.is_some();

    let mut protocol = cli
        .protocol
        .unwrap_or_else(|| PROTO_HTTP.to_string())
        .trim()
        .to_ascii_lowercase();
    let mut target_addr = cli
        .target_addr
        .unwrap_or_else(|| "localhost:3000".to_string());

    apply_positionals(
        &cli.args,
        &mut protocol,
        protocol_provided,
        &mut target_addr,
        target_provided,
    );

    let token_flag_provided = cli.token.as_deref().is_some_and(non_blank);
    let password_flag_provided = cli.password.as_deref().is_some_and(non_blank);
    let psk_flag_provided = cli.psk.as_deref().is_some_and(non_blank);
    let dp_auth_token_flag_provided = cli.dp_auth_token.as_deref().is_some_and(non_blank);
    let dp_auth_secret_flag_provided = cli.dp_auth_secret.as_deref().is_some_and(non_blank);

    let token = resolve_secret(
        "token",
        cli.token,
        cli.token_file.as_deref(),
        cli.token_stdin,
        "FORTUNNELS_TOKEN",
    )?;
    let password = resolve_secret(
        "pass",
        cli.password,
        cli.password_file.as_deref(),
        cli.password_stdin,
        "FORTUNNELS_PASSWORD",
    )?;
    let psk = resolve_secret(
        "psk",
        cli.psk,
        cli.psk_file.as_deref(),
        cli.psk_stdin,
        "FORTUNNELS_PSK",
    )?;
    let dp_auth_token = resolve_secret(
        "dp-auth-token",
        cli.dp_auth_token,
        cli.dp_auth_token_file.as_deref(),
        cli.dp_auth_token_stdin,
        "FORTUNNELS_DP_AUTH_TOKEN",
    )?;
    let dp_auth_secret = resolve_secret(
        "dp-auth-secret",
        cli.dp_auth_secret,
        cli.dp_auth_secret_file.as_deref(),
        cli.dp_auth_secret_stdin,
        "FORTUNNELS_DP_AUTH_SECRET",
    )?;

    let watch_interval = cli.watch_interval.max(Duration::from_secs(1));

    Ok(Config {
        login: cli.login.unwrap_or_default(),
        password,
        token,
        server_url: cli
            .server
            .unwrap_or_else(|| default_server_url().to_string()),
        target_addr,
        protocol,
        data_plane: cli.data_plane.trim().to_ascii_lowercase(),
        user_id: cli.user_id,
        dst: cli.dst,
        parallel: cli.parallel,
        listen: cli.listen.unwrap_or_default(),
        backoff_initial: Duration::from_secs(cli.backoff_initial_secs),
        backoff_max: Duration::from_secs(cli.backoff_max_secs),
        udp_listen: cli.udp_listen.unwrap_or_default(),
        udp_dst: cli.udp_dst.unwrap_or_default(),
        ping_interval: cli.ping_interval,
        ping_timeout: cli.ping_timeout,
        mux_keepalive_interval: cli.mux_keepalive_interval,
        mux_keepalive_timeout: cli.mux_keepalive_timeout,
        watch_interval,
        watch_ws: cli.watch,
        encrypt: cli.encrypt,
        psk,
        dp_auth_token,
        dp_auth_secret,
        allow_insecure_http: cli.allow_insecure_http,
        logging: LoggingConfig {
            level: cli.log_level,
            format: cli.log_format,
            output: cli.log_output,
            add_source: cli.log_source,
        },
        server_flag_provided,
        token_flag_provided,
        password_flag_provided,
        psk_flag_provided,
        dp_auth_token_flag_provided,
        dp_auth_secret_flag_provided,
    })
}

/// Validate the resolved configuration. Errors here are fatal at startup
/// (exit code 2); warnings about secrets on the command line go to stderr.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    validate_protocol(&cfg.protocol)?;
    validate_data_plane(&cfg.data_plane)?;
    validate_server_url(cfg)?;
    if matches!(cfg.protocol.as_str(), PROTO_HTTP | PROTO_HTTPS | PROTO_TCP) {
        validate_target_address(&cfg.target_addr)?;
    }
    if cfg.protocol == PROTO_TCP && cfg.parallel == 0 {
        return Err(ConfigError::new(
            "invalid parallel count",
            "use --parallel 1 or more",
        ));
    }
    if cfg.backoff_initial.is_zero()
        || cfg.backoff_max.is_zero()
        || cfg.backoff_max < cfg.backoff_initial
    {
        return Err(ConfigError::new(
            "invalid backoff values",
            "ensure --backoff-initial > 0 and --backoff-max >= --backoff-initial",
        ));
    }
    if cfg.encrypt {
        let psk = cfg.psk.trim();
        if psk.is_empty() {
            return Err(ConfigError::new(
                "empty PSK",
                "provide a non-empty --psk when using --encrypt",
            ));
        }
        if psk.len() < 32 {
            return Err(ConfigError::new(
                "PSK is too short",
                "use at least 32 characters for --psk",
            ));
        }
    }
    if cfg.protocol == PROTO_TCP && !cfg.listen.is_empty() {
        let normalized = normalize_bind_addr(&cfg.listen);
        if !looks_like_host_port(&normalized) {
            return Err(ConfigError::new(
                "invalid listen address",
                "example: --listen :4000 or --listen 127.0.0.1:4000",
            ));
        }
    }
    if cfg.protocol == PROTO_UDP && (cfg.udp_listen.is_empty() || cfg.udp_dst.is_empty()) {
        return Err(ConfigError::new(
            "for UDP mode, both --udp-listen and --udp-dst are required",
            "example: --udp-listen :5353 --udp-dst 127.0.0.1:53",
        ));
    }

    warn_on_sensitive_flag_usage(cfg);
    Ok(())
}

fn validate_protocol(protocol: &str) -> Result<(), ConfigError> {
    match protocol {
        PROTO_HTTP | PROTO_HTTPS | PROTO_TCP | PROTO_UDP => Ok(()),
        other => Err(ConfigError::new(
            format!("unsupported protocol: {other}"),
            "supported: http, https, tcp, udp",
        )),
    }
}

fn validate_data_plane(dp: &str) -> Result<(), ConfigError> {
    match dp {
        "ws" | "quic" | "dtls" => Ok(()),
        other => Err(ConfigError::new(
            format!("unsupported data-plane transport: {other}"),
            "supported: ws, quic, dtls",
        )),
    }
}

fn validate_server_url(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.server_flag_provided
        && !cfg.server_url.starts_with("http://")
        && !cfg.server_url.starts_with("https://")
    {
        return Err(ConfigError::new(
            "missing protocol in --server (use http:// or https://)",
            "example: --server http://127.0.0.1:8080",
        ));
    }
    let parsed = Url::parse(&cfg.server_url).map_err(|_| {
        ConfigError::new("invalid server URL", "try: --server http://127.0.0.1:8080")
    })?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ConfigError::new(
            "invalid server URL",
            "try: --server http://127.0.0.1:8080",
        ));
    }
    if parsed.scheme() == "http"
        && !cfg.allow_insecure_http
        && !is_local_server_host(parsed.host_str().unwrap_or_default())
    {
        return Err(ConfigError::new(
            "insecure HTTP server URL is blocked",
            "use https:// or pass --allow-insecure-http for non-local HTTP",
        ));
    }
    Ok(())
}

fn validate_target_address(addr: &str) -> Result<(), ConfigError> {
    if addr.is_empty() || !looks_like_host_port(addr) {
        return Err(ConfigError::new(
            "invalid target address",
            "expected format host:port, e.g. 127.0.0.1:8000",
        ));
    }
    let port = addr.rsplit(':').next().unwrap_or_default();
    match port.parse::<u32>() {
        Ok(p) if (1..=65535).contains(&p) => Ok(()),
        _ => Err(ConfigError::new("invalid port", "valid range: 1-65535")),
    }
}

fn warn_on_sensitive_flag_usage(cfg: &Config) {
    let entries = [
        ("--token", cfg.token_flag_provided),
        ("--pass", cfg.password_flag_provided),
        ("--psk", cfg.psk_flag_provided),
        ("--dp-auth-token", cfg.dp_auth_token_flag_provided),
        ("--dp-auth-secret", cfg.dp_auth_secret_flag_provided),
    ];
    for (label, used) in entries {
        if used {
            eprintln!("warning: {label} was provided via CLI and may be visible in process listings");
        }
    }
}

fn ensure_single_stdin_source(cli: &Cli) -> Result<(), ConfigError> {
    let stdin_flags: Vec<&str> = [
        ("token", cli.token_stdin),
        ("pass", cli.password_stdin),
        ("psk", cli.psk_stdin),
        ("dp-auth-token", cli.dp_auth_token_stdin),
        ("dp-auth-secret", cli.dp_auth_secret_stdin),
    ]
    .into_iter()
    .filter_map(|(label, used)| used.then_some(label))
    .collect();

    if stdin_flags.len() > 1 {
        return Err(ConfigError::new(
            format!(
                "only one --*-stdin option can be used at a time: {}",
                stdin_flags.join(", ")
            ),
            "",
        ));
    }
    Ok(())
}

fn resolve_secret(
    label: &str,
    flag_value: Option<String>,
    file: Option<&str>,
    from_stdin: bool,
    env_var: &str,
) -> Result<String, ConfigError> {
    if let Some(v) = flag_value {
        if !v.is_empty() {
            return Ok(v);
        }
    }
    if let Some(path) = file {
        if !path.is_empty() {
            return read_secret_file(path)
                .map_err(|e| ConfigError::new(format!("read {label} from file: {e}"), ""));
        }
    }
    if from_stdin {
        return read_secret_stdin(label)
            .map_err(|e| ConfigError::new(e, ""));
    }
    Ok(env_trimmed(env_var))
}

fn read_secret_file(path: &str) -> Result<String, String> {
    let data = std::fs::read(path).map_err(|e| e.to_string())?;
    let secret = String::from_utf8_lossy(&data).trim().to_string();
    if secret.is_empty() {
        return Err("secret file is empty".into());
    }
    if secret.len() > MAX_SECRET_BYTES {
        return Err("secret file is too large".into());
    }
    Ok(secret)
}

fn read_secret_stdin(label: &str) -> Result<String, String> {
    let mut data = Vec::new();
    std::io::stdin()
        .lock()
        .take((MAX_SECRET_BYTES + 1) as u64)
        .read_to_end(&mut data)
        .map_err(|e| format!("read {label} from stdin: {e}"))?;
    if data.len() > MAX_SECRET_BYTES {
        return Err(format!("{label} from stdin is too large"));
    }
    let secret = String::from_utf8_lossy(&data).trim().to_string();
    if secret.is_empty() {
        return Err(format!("{label} from stdin is empty"));
    }
    Ok(secret)
}

fn env_trimmed(name: &str) -> String {
    std::env::var(name)
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

fn apply_positionals(
    args: &[String],
    protocol: &mut String,
    protocol_provided: bool,
    target_addr: &mut String,
    target_provided: bool,
) {
    match args {
        [] => {}
        [single] => {
            if let Some(port) = parse_port(single) {
                set_if_missing(protocol, protocol_provided, PROTO_HTTP);
                set_if_missing(target_addr, target_provided, &format!("127.0.0.1:{port}"));
            } else if looks_like_host_port(single) {
                set_if_missing(protocol, protocol_provided, PROTO_HTTP);
                set_if_missing(target_addr, target_provided, single);
            }
        }
        [proto_arg, addr_arg, ..] => {
            let p = proto_arg.to_ascii_lowercase();
            if !matches!(p.as_str(), PROTO_HTTP | PROTO_HTTPS | PROTO_TCP | PROTO_UDP) {
                return;
            }
            set_if_missing(protocol, protocol_provided, &p);
            if let Some(port) = parse_port(addr_arg) {
                set_if_missing(target_addr, target_provided, &format!("127.0.0.1:{port}"));
            } else if looks_like_host_port(addr_arg) {
                set_if_missing(target_addr, target_provided, addr_arg);
            }
        }
    }
}

fn set_if_missing(value: &mut String, provided: bool, new_value: &str) {
    if !provided {
        *value = new_value.to_string();
    }
}

fn non_blank(s: &str) -> bool {
    !s.trim().is_empty()
}

/// Expand the `":PORT"` listen shorthand into a bindable address. Tokio's
/// bind APIs want an explicit host, so a bare port binds all interfaces.
/// Anything that is not a bare numeric port passes through for the bind
/// call to judge.
pub fn normalize_bind_addr(addr: &str) -> String {
    let addr = addr.trim();
    match addr.strip_prefix(':') {
        Some(port) if parse_port(port).is_some() => format!("0.0.0.0:{port}"),
        _ => addr.to_string(),
    }
}

/// Parse a bare port, accepting forms like `8000` or `:8000`.
pub fn parse_port(s: &str) -> Option<&str> {
    let s = s.strip_prefix(':').unwrap_or(s);
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(s)
}

/// Check whether a string looks like `host:port` with a numeric port.
pub fn looks_like_host_port(s: &str) -> bool {
    let Some(i) = s.rfind(':') else {
        return false;
    };
    if i == 0 {
        return false;
    }
    let (host, port) = (&s[..i], &s[i + 1..]);
    !host.is_empty() && parse_port(port).is_some()
}

fn is_local_server_host(host: &str) -> bool {
    let h = host.trim_start_matches('[');
    let h = h.split(']').next().unwrap_or(h);
    matches!(h.to_ascii_lowercase().as_str(), "localhost" | "127.0.0.1" | "::1")
}
