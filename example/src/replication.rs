use pgsession::{Client, Config, Lsn, ReplicationOptions, Result};

pub async fn main(slot: &str) -> Result<()> {
    let client = Client::connect(Config::from_env().replication(true)).await?;

    let mut records = client
        .start_replication_channel(slot, Lsn::ZERO, None, ReplicationOptions::new().align_lsn(true))
        .await?;

    for _ in 0..10 {
        let Some(record) = records.recv().await else {
            break;
        };
        tracing::info!("{} {}..{}: {} bytes", slot, record.start, record.end, record.data.len());
        client.standby_status_update(record.end, record.end).await?;
    }

    let state = client.replication_state().await?;
    tracing::info!("received {}, flushed {}", state.received, state.flushed);

    client.stop_replication().await?;
    client.close().await?;
    Ok(())
}
