//! Reviewer API server command: `hitl serve`.

use anyhow::Result;

use hitl_control::api::{self, ServerConfig};
use hitl_control::runtime;

pub async fn cmd_serve(port: u16, host: &str, cors: bool) -> Result<()> {
    let runtime = runtime::global()?;
    api::start_server(
        runtime.store.clone(),
        ServerConfig {
            port,
            host: host.to_string(),
            permissive_cors: cors,
        },
    )
    .await
}
