mod natgate;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "natgate", version, about = "natgate - reverse NAT tunnel for TCP and UDP services")]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses NATGATE_CONFIG; then auto-detects natgate.toml > natgate.yaml > natgate.yml from CWD; then falls back to the OS default path (Linux: /etc/natgate/natgate.toml; others: user config dir).
    #[arg(long, env = "NATGATE_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    natgate::run(cli.config).await
}
