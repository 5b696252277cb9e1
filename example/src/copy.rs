use std::time::Duration;
use pgsession::{Client, CopyFormat, Result, Value, postgres::oid};

pub async fn main() -> Result<()> {
    let client = Client::connect_env().await?;
    client.simple_query("CREATE TEMP TABLE metric(id int, name text)").await?;

    client.copy_from_stdin("COPY metric(id, name) FROM STDIN", CopyFormat::Text).await?;
    client.copy_send_data("1\tcpu\n2\tmemory\n").await?;
    assert_eq!(client.copy_done().await?, 2);

    client
        .copy_from_stdin("COPY metric(id, name) FROM STDIN BINARY", CopyFormat::Binary(vec![oid::INT4, oid::TEXT]))
        .await?;
    let rows = (3..1000).map(|i| vec![Value::Int4(i), format!("metric {i}").into()]).collect();
    client.copy_send_rows(rows, Duration::from_secs(5)).await?;
    assert_eq!(client.copy_done().await?, 997);

    client.copy_from_stdin("COPY metric(id) FROM STDIN", CopyFormat::Text).await?;
    client.copy_send_data("not a number\n").await?;
    // the server error may arrive at any later command
    if let Err(err) = client.copy_done().await {
        tracing::info!("copy aborted: {err}");
    }

    client.close().await?;
    Ok(())
}
