use std::env::var;
use pgsession::{AsyncMessage, Client, Config, Result};
use tokio::sync::mpsc;

pub async fn main() -> Result<()> {
    let client = Client::connect(Config::parse(&var("DATABASE_URL").unwrap())?).await?;
    client.simple_query("SELECT 1").await?;
    client.close().await?;

    let client = Client::connect_env().await?;
    client.simple_query("SELECT 1").await?;
    drop(client);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = Client::connect(Config::from_env().async_receiver(tx)).await?;
    client.simple_query("LISTEN example; NOTIFY example, 'hello'").await?;
    client.simple_query("DO $$ BEGIN RAISE NOTICE 'from do block'; END $$").await?;

    let mut seen = 0;
    while seen < 2 {
        match rx.recv().await {
            Some(AsyncMessage::Notification { channel, payload, .. }) => {
                tracing::info!("notification on {channel}: {payload}");
                seen += 1;
            },
            Some(AsyncMessage::Notice(notice)) => {
                tracing::info!("notice: {}", notice.message());
                seen += 1;
            },
            Some(other) => tracing::info!("{other:?}"),
            None => break,
        }
    }

    if let Some(token) = client.cancel_token() {
        // nothing is running, the server ignores it
        token.cancel().await?;
    }
    client.close().await?;

    Ok(())
}
