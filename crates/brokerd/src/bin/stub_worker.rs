//! Scriptable stdio worker used by the end-to-end pipeline tests.
//!
//! `stub_worker remote <total>` serves `RPCFetchCVEs` over a synthetic data set of
//! `<total>` items; `stub_worker local` serves `RPCSaveCVEByID` and accepts everything.
//! Logs go to stderr — stdout belongs to the message protocol.

use broker_core::WorkerRuntime;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut argv = std::env::args().skip(1);
    let role = argv.next().unwrap_or_else(|| "remote".to_string());
    let total: u64 = argv.next().and_then(|raw| raw.parse().ok()).unwrap_or(0);

    let mut runtime = WorkerRuntime::new(role.clone());
    match role.as_str() {
        "remote" => {
            runtime.handle("RPCFetchCVEs", move |params| async move {
                let start = params["start_index"].as_u64().unwrap_or(0);
                let per_page = params["results_per_page"].as_u64().unwrap_or(0);
                let end = std::cmp::min(start.saturating_add(per_page), total);
                let cves: Vec<_> = (start..end)
                    .map(|i| json!({"id": format!("CVE-2024-{i:04}")}))
                    .collect();
                Ok(json!({"cves": cves, "total_results": total}))
            });
        }
        "local" => {
            runtime.handle("RPCSaveCVEByID", |params| async move {
                let id = params["cve"]["id"].as_str().unwrap_or("").to_string();
                if id.is_empty() {
                    return Err("missing cve.id".to_string());
                }
                Ok(json!({"saved": id}))
            });
        }
        other => anyhow::bail!("unknown role `{other}` (expected `remote` or `local`)"),
    }

    runtime.run().await?;
    Ok(())
}
