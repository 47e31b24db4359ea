const TRANSFER_LOG: &str = "TRANSFER_LOG";

/// Log level override from the environment
pub fn get_log_level() -> Option<String> {
    let level_from_env = std::env::var(TRANSFER_LOG);
    level_from_env.ok().filter(|level| !level.trim().is_empty())
}

const TRANSFER_HOSTNAME: &str = "TRANSFER_HOSTNAME";

const DEFAULT_HOSTNAME: &str = "localhost";

/// Name this instance reports in heartbeats and as the default statsd endpoint
pub fn get_hostname() -> String {
    std::env::var(TRANSFER_HOSTNAME)
        .or_else(|_| std::env::var("HOSTNAME"))
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_HOSTNAME.to_string())
}
