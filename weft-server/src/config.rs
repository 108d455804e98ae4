//! Server configuration, environment-driven.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "weft-server", about = "Stateless real-time collaboration relay")]
pub struct ServerConfig {
    /// Listen port.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Bind host.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Deployment environment tag.
    #[arg(long, env = "NODE_ENV", default_value = "development")]
    pub node_env: String,

    /// Allowed CORS origins (comma-separated). Empty list = permissive.
    #[arg(long, env = "CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// This server's own DID — the audience every capability token must
    /// name. Advertised to clients in the handshake frame.
    #[arg(long, env = "SERVER_DID")]
    pub server_did: String,

    /// SQLite path for the durable store. Use ":memory:" for tests.
    #[arg(long, env = "DB_PATH", default_value = "weft.db")]
    pub db_path: String,

    /// JSON-RPC endpoint of the on-chain collaborator registry.
    #[arg(long, env = "RPC_URL", default_value = "http://127.0.0.1:8545")]
    pub rpc_url: String,

    /// Tokio worker thread count. 0 = runtime default.
    #[arg(long, env = "WEB_CONCURRENCY", default_value_t = 0)]
    pub web_concurrency: usize,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// A config suitable for tests: ephemeral port, in-memory store.
    pub fn for_tests(server_did: &str) -> Self {
        Self {
            port: 0,
            host: "127.0.0.1".to_string(),
            node_env: "test".to_string(),
            cors_origins: Vec::new(),
            server_did: server_did.to_string(),
            db_path: ":memory:".to_string(),
            rpc_url: "http://127.0.0.1:0".to_string(),
            web_concurrency: 0,
        }
    }
}
