use tracing::{Instrument, trace_span};
use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use pgsession::Result;

mod connection;
mod query;
mod transaction;
mod copy;
mod replication;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::Registry::default()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    connection::main().instrument(trace_span!("connection")).await?;
    query::main().instrument(trace_span!("query")).await?;
    transaction::main().instrument(trace_span!("transaction")).await?;
    copy::main().instrument(trace_span!("copy")).await?;

    // needs `wal_level = logical` and an existing slot
    if let Ok(slot) = std::env::var("REPLICATION_SLOT") {
        replication::main(&slot).instrument(trace_span!("replication")).await?;
    }

    Ok(())
}
