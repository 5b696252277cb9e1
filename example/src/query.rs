use pgsession::{Client, Result, SqlExt, Value};

pub async fn main() -> Result<()> {
    let client = Client::connect_env().await?;

    client.simple_query("CREATE TEMP TABLE post(id int, name text, meta jsonb)").await?;

    let result = client.equery("SELECT 420, $1::text", &["Foo".into()]).await?;
    assert_eq!(result.rows[0].try_get::<_, i32>(0)?, 420);
    assert_eq!(result.rows[0].try_get::<_, String>(1)?, "Foo");

    // cached by its sql, parsed once
    let insert = client.prepare("INSERT INTO post(id, name, meta) VALUES ($1, $2, $3)").await?;
    let params = (0..14)
        .map(|i| vec![Value::Int4(i), format!("post {i}").into(), Value::Json(serde_json::json!({ "i": i }))])
        .collect();
    let (_, batches) = client.execute_batch(&insert, params).await?;
    assert_eq!(batches.iter().map(|b| b.rows_affected()).sum::<u64>(), 14);

    let count = client.prepared_query(&insert, &[Value::Int4(14), Value::Null, Value::Null]).await?;
    assert_eq!(count.rows_affected(), 1);

    // not worth caching
    let select = client.prepare("SELECT id, name FROM post WHERE id < $1 ORDER BY id".once()).await?;
    client.bind(&select, "page", &[Value::Int4(10)]).await?;
    loop {
        let page = client.execute(&select, "page", 4).await?;
        tracing::info!("page of {}", page.rows.len());
        if !page.suspended {
            break;
        }
    }
    client.close_portal("page").await?;
    client.sync().await?;

    if let Err(err) = client.equery("SELECT foo", &[]).await {
        tracing::info!("expected error: {err}");
    }
    assert_eq!(client.equery("SELECT 1", &[]).await?.rows.len(), 1);

    client.close().await?;
    Ok(())
}
