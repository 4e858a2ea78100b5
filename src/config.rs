/// Configuration applied by `TcpServer` to its listener and accepted
/// connections.
#[derive(Clone)]
pub struct Config {
    /// TCP listen backlog.
    pub backlog: i32,
    /// Enable TCP_NODELAY on accepted connections.
    pub tcp_nodelay: bool,
    /// Close connections idle for this many seconds. Must be within the
    /// time wheel's range (1..60). None disables idle collection.
    pub idle_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backlog: 1024,
            tcp_nodelay: true,
            idle_timeout_secs: None,
        }
    }
}
