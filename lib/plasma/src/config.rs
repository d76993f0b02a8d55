use serde_derive::{Deserialize, Serialize};

/// Runtime tunables. All limits from the CLI surface land here; the rest
/// are internal knobs with conservative defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Request-line limit in bytes. Exceeding it yields 414.
    pub max_line_len: usize,
    /// Total header block limit in bytes. Exceeding it yields 431.
    pub max_header_size: usize,
    /// Maximum number of request headers. Exceeding it yields 431.
    pub max_headers: usize,
    /// Request body limit in bytes. Exceeding it yields 413.
    pub max_body_size: usize,
    /// Bodies larger than this spill from memory to an unlinked temp file.
    pub body_spill_threshold: usize,
    /// HTTP keep-alive timeout in seconds (0..=255, 0 disables).
    pub keep_alive_timeout: u8,
    /// Connections older than this are not kept alive after a response.
    pub max_conn_age_secs: u64,
    /// WebSocket / SSE idle interval in seconds. Idle WebSocket connections
    /// are pinged; SSE connections receive a keep-alive comment.
    pub ws_timeout: u8,
    /// Largest WebSocket message accepted or sent.
    pub ws_max_msg_size: usize,
    /// Per-subscription pending message cap.
    pub sub_queue_limit: usize,
    /// Grace window for draining writes on graceful shutdown.
    pub shutdown_grace_secs: u64,
    /// Per-connection read accumulator size.
    pub read_buf_size: usize,
    /// Bytes written per connection per reactor tick.
    pub write_budget: usize,
    /// Deferred tasks drained per reactor tick.
    pub task_budget: usize,
    /// Worker threads for application callbacks. 0 runs callbacks inline on
    /// the reactor thread.
    pub threads: usize,
    /// Pending task cap for the worker pool; admission blocks beyond it.
    pub worker_queue_limit: usize,
    /// Log completed requests at info level.
    pub log_http: bool,
    /// Value of the default `server` response header.
    pub server_name: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_line_len: 8 * 1024,
            max_header_size: 32 * 1024,
            max_headers: 128,
            max_body_size: 128 * 1024 * 1024,
            body_spill_threshold: 128 * 1024,
            keep_alive_timeout: 40,
            max_conn_age_secs: 300,
            ws_timeout: 40,
            ws_max_msg_size: 256 * 1024,
            sub_queue_limit: 64,
            shutdown_grace_secs: 8,
            read_buf_size: 64 * 1024,
            write_budget: 512 * 1024,
            task_budget: 1024,
            threads: 0,
            worker_queue_limit: 1024,
            log_http: false,
            server_name: "plasma".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.max_line_len, 8192);
        assert_eq!(cfg.max_header_size, 32768);
        assert!(cfg.body_spill_threshold <= cfg.max_body_size);
        assert!(cfg.keep_alive_timeout > 0);
    }

    #[test]
    fn test_roundtrips_through_json() {
        let cfg = Config::default();
        let text = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(back.max_headers, cfg.max_headers);
        assert_eq!(back.server_name, cfg.server_name);
    }
}
