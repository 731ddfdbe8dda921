use std::{future::Future, io::Write, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use color_eyre::Result;
use datakeys_core::{DataKey, DataKeyStore, DataKeyStoreError};
use serde::Serialize;

use crate::{cli::KeyCommand, config, storage};

/// Execute a key subcommand against the configured store.
pub async fn handle(cmd: KeyCommand, config: &config::Config) -> Result<()> {
    let store = storage::store_from_config(config)?;
    let output = capture(&store, cmd, config.operation_timeout()).await?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&output)?;
    stdout.flush()?;
    Ok(())
}

/// Run a key subcommand and collect what it prints, so stdout is only locked once
/// the store calls are done.
pub async fn capture<S: DataKeyStore>(
    store: &S,
    cmd: KeyCommand,
    limit: Duration,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    run(store, cmd, limit, &mut out).await?;
    Ok(out)
}

/// Bound a store call by `limit`. Expiry drops the call, which interrupts its statement.
pub async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, DataKeyStoreError>>,
) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => Ok(result?),
        Err(_) => color_eyre::eyre::bail!("store call timed out after {limit:?}"),
    }
}

pub async fn run<S: DataKeyStore>(
    store: &S,
    cmd: KeyCommand,
    limit: Duration,
    out: &mut impl Write,
) -> Result<()> {
    match cmd {
        KeyCommand::List { json } => {
            let keys = bounded(limit, store.get_all()).await?;
            if json {
                let views: Vec<_> = keys.iter().map(DataKeyView::from).collect();
                serde_json::to_writer_pretty(&mut *out, &views)?;
                writeln!(out)?;
                return Ok(());
            }
            if keys.is_empty() {
                writeln!(out, "No data keys stored.")?;
                return Ok(());
            }
            for key in &keys {
                writeln!(out, "{}", summary_line(key))?;
            }
        }
        KeyCommand::Get { name } => {
            let key = bounded(limit, store.get_by_name(&name)).await?;
            writeln!(out, "{}", summary_line(&key))?;
            writeln!(out, "    data: {}", STANDARD.encode(&key.encrypted_data))?;
        }
        KeyCommand::Create(args) => {
            let data = STANDARD
                .decode(args.data.trim())
                .map_err(|e| color_eyre::eyre::eyre!("--data is not valid base64: {e}"))?;
            let key = DataKey::new(args.name, args.provider, data);
            let name = key.name.clone();
            bounded(limit, store.create(key, None)).await?;
            writeln!(out, "Created data key {name}")?;
        }
        KeyCommand::Delete { name } => {
            bounded(limit, store.delete(&name)).await?;
            writeln!(out, "Deleted data key {name}")?;
        }
    }

    Ok(())
}

fn summary_line(key: &DataKey) -> String {
    format!(
        "{} [{}] provider={} created={}",
        key.name,
        if key.active { "active" } else { "inactive" },
        key.provider,
        key.created.to_rfc3339()
    )
}

/// JSON shape for `key list --json`; key material is base64-encoded.
#[derive(Debug, Serialize)]
struct DataKeyView<'a> {
    name: &'a str,
    active: bool,
    provider: &'a str,
    encrypted_data: String,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

impl<'a> From<&'a DataKey> for DataKeyView<'a> {
    fn from(key: &'a DataKey) -> Self {
        Self {
            name: &key.name,
            active: key.active,
            provider: &key.provider,
            encrypted_data: STANDARD.encode(&key.encrypted_data),
            created: key.created,
            updated: key.updated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::CreateArgs;
    use datakeys_core::InMemoryDataKeyStore;

    const LIMIT: Duration = Duration::from_secs(5);

    async fn run_to_string<S: DataKeyStore>(store: &S, cmd: KeyCommand) -> Result<String> {
        let out = capture(store, cmd, LIMIT).await?;
        Ok(String::from_utf8(out).expect("utf8 output"))
    }

    fn create(name: &str, data: &str) -> KeyCommand {
        KeyCommand::Create(CreateArgs {
            name: name.into(),
            provider: "p1".into(),
            data: data.into(),
        })
    }

    #[tokio::test]
    async fn create_then_get_decodes_base64() {
        let store = InMemoryDataKeyStore::new();
        let output = run_to_string(&store, create("k1", "AQI=")).await.expect("create");
        assert_eq!(output, "Created data key k1\n");

        let stored = store.get_by_name("k1").await.expect("stored");
        assert_eq!(stored.encrypted_data, vec![0x01, 0x02]);

        let output = run_to_string(&store, KeyCommand::Get { name: "k1".into() })
            .await
            .expect("get");
        assert!(output.starts_with("k1 [active] provider=p1"));
        assert!(output.contains("data: AQI="));
    }

    #[tokio::test]
    async fn create_rejects_bad_base64() {
        let store = InMemoryDataKeyStore::new();
        run_to_string(&store, create("k1", "not base64!"))
            .await
            .expect_err("invalid data");
        assert!(store.get_all().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn get_missing_key_fails() {
        let store = InMemoryDataKeyStore::new();
        let err = run_to_string(&store, KeyCommand::Get { name: "k1".into() })
            .await
            .expect_err("missing key");
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn list_as_json_encodes_data() {
        let store = InMemoryDataKeyStore::new();
        run_to_string(&store, create("k1", "AQI=")).await.expect("create");

        let output = run_to_string(&store, KeyCommand::List { json: true })
            .await
            .expect("list");
        let parsed: serde_json::Value = serde_json::from_str(&output).expect("json");
        assert_eq!(parsed[0]["name"], "k1");
        assert_eq!(parsed[0]["encrypted_data"], "AQI=");
        assert_eq!(parsed[0]["active"], true);
    }

    #[tokio::test]
    async fn list_empty_store_prints_hint() {
        let store = InMemoryDataKeyStore::new();
        let output = run_to_string(&store, KeyCommand::List { json: false })
            .await
            .expect("list");
        assert_eq!(output, "No data keys stored.\n");
    }

    #[tokio::test]
    async fn delete_against_sqlite_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = storage::test_store(dir.path());
        run_to_string(&store, create("k1", "AQI=")).await.expect("create");
        run_to_string(&store, KeyCommand::Delete { name: "k1".into() })
            .await
            .expect("delete");
        run_to_string(&store, KeyCommand::Delete { name: "k1".into() })
            .await
            .expect("delete again");

        assert!(store.get_all().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn capture_propagates_store_errors() {
        let store = InMemoryDataKeyStore::new();
        let err = capture(&store, KeyCommand::Get { name: "k1".into() }, LIMIT)
            .await
            .expect_err("missing key");
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn bounded_reports_timeout() {
        let never = std::future::pending::<Result<(), DataKeyStoreError>>();
        let err = bounded(Duration::from_millis(10), never)
            .await
            .expect_err("should time out");
        assert!(err.to_string().contains("timed out"));
    }
}
