use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // JSON logs in production (WEFT_LOG_JSON=1), human-readable otherwise.
    let json_logs = std::env::var("WEFT_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("weft_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = weft_server::config::ServerConfig::parse();
    tracing::info!(
        addr = %config.listen_addr(),
        env = %config.node_env,
        "starting collaboration relay"
    );

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if config.web_concurrency > 0 {
        runtime.worker_threads(config.web_concurrency);
    }
    runtime.build()?.block_on(async move {
        let server = weft_server::server::Server::new(config);
        server.run().await
    })
}
