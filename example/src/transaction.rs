use pgsession::{Client, Error, Outcome, Result, TransactionOptions, Value};

pub async fn main() -> Result<()> {
    let client = Client::connect_env().await?;
    client.simple_query("CREATE TEMP TABLE account(id int, balance int)").await?;

    let outcome = client
        .with_transaction(TransactionOptions::new().ensure_committed(true), |tx| async move {
            tx.equery("INSERT INTO account VALUES ($1, $2)", &[Value::Int4(1), Value::Int4(100)]).await?;
            Ok::<_, Error>(())
        })
        .await?;
    assert!(outcome.is_committed());

    let outcome = client
        .with_transaction(TransactionOptions::new().reraise(false), |tx| async move {
            tx.equery("UPDATE account SET balance = balance / $1", &[Value::Int4(0)]).await?;
            Ok::<_, Error>(())
        })
        .await?;
    if let Outcome::RolledBack(err) = outcome {
        tracing::info!("rolled back: {err}");
    }

    let tx = client.begin("ISOLATION LEVEL SERIALIZABLE").await?;
    tx.simple_query("UPDATE account SET balance = balance - 10").await?;
    tx.commit().await?;

    {
        let tx = client.begin("").await?;
        tx.simple_query("DELETE FROM account").await?;
        // dropped, rolled back
    }

    let balance = client.equery("SELECT balance FROM account", &[]).await?;
    assert_eq!(balance.rows[0].try_get::<_, i32>(0)?, 90);

    client.close().await?;
    Ok(())
}
