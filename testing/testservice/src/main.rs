mod service;

use std::sync::Arc;

use clap::Parser;
use zrpc_core::zmq;
use zrpc_core::{CborSerializer, Serializer, Service, ServiceConfig};

#[derive(Parser, Debug)]
#[command(
    name = "testservice",
    about = "Demo RPC service for zrpc verification"
)]
struct Cli {
    /// Endpoint URL to bind (port 0 picks an ephemeral port)
    #[arg(short = 'u', long = "url", default_value = "tcp://127.0.0.1:0")]
    url: String,

    /// Use the CBOR serializer instead of JSON
    #[arg(long = "cbor")]
    cbor: bool,

    /// Suppress request logging
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if !cli.quiet {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info,zrpc_core=debug".into()),
            )
            .init();
    }

    let serializer = cli
        .cbor
        .then(|| Arc::new(CborSerializer) as Arc<dyn Serializer>);

    let service = Service::new(
        zmq::Context::new(),
        ServiceConfig {
            serializer,
            service_id: None,
        },
    );
    service::register_all(&service)?;

    let url = service.bind(&cli.url).await?;
    println!("Listening on {url}");

    service.serve().await?;
    Ok(())
}
