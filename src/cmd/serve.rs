//! API server command — `leadboard serve`.

use std::path::{Path, PathBuf};

use anyhow::Result;

use leadboard::config::CrmConfig;
use leadboard::crm::server::{ServerConfig, start_server};

pub async fn cmd_serve(
    config_dir: &Path,
    port: Option<u16>,
    host: Option<String>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    let mut crm = CrmConfig::resolve(config_dir)?;
    if let Some(port) = port {
        crm.server.port = port;
    }
    if let Some(db_path) = db_path {
        crm.server.db_path = db_path;
    }

    start_server(ServerConfig {
        crm,
        dev_mode: dev,
        host,
    })
    .await
}
