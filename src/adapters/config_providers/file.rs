use std::path::{Path, PathBuf};

use async_trait::async_trait;
use eyre::{Context, Result};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{
    config::{loader::load_config, models::GatewayConfig},
    ports::config_provider::ConfigProvider,
};

/// Loads the gateway configuration from a local file and signals edits to it.
pub struct FileConfigProvider {
    path: PathBuf,
    // Dropping the watcher stops notifications.
    _watcher: notify::RecommendedWatcher,
    update_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (tx, rx) = mpsc::channel(1);

        let config_filename = path
            .file_name()
            .ok_or_else(|| eyre::eyre!("Invalid config path: {}", path.display()))?
            .to_owned();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        let relevant = event.kind.is_modify()
                            || event.kind.is_create()
                            || event.kind.is_remove();
                        if relevant
                            && event
                                .paths
                                .iter()
                                .any(|p| p.file_name() == Some(&config_filename))
                        {
                            tracing::debug!("Config file changed: {:?}", event.kind);
                            // A pending signal already covers this change.
                            let _ = tx.try_send(());
                        }
                    }
                    Err(e) => tracing::error!("File watch error: {:?}", e),
                }
            })
            .wrap_err("Failed to create config file watcher")?;

        let watch_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .wrap_err_with(|| format!("Failed to watch config directory {}", watch_dir.display()))?;

        Ok(Self {
            path,
            _watcher: watcher,
            update_rx: std::sync::Mutex::new(Some(rx)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn load_config(&self) -> Result<GatewayConfig> {
        let path_str = self
            .path
            .to_str()
            .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", self.path.display()))?;
        load_config(path_str).await
    }

    fn watch(&self) -> mpsc::Receiver<()> {
        take_receiver(&self.update_rx)
    }
}

/// Hand out the change receiver once; later callers get a closed channel.
pub(crate) fn take_receiver(slot: &std::sync::Mutex<Option<mpsc::Receiver<()>>>) -> mpsc::Receiver<()> {
    let taken = match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    taken.unwrap_or_else(|| {
        tracing::warn!("Config watch requested more than once");
        mpsc::channel(1).1
    })
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Write};

    use tempfile::tempdir;
    use tokio::time::{Duration, sleep};

    use super::*;

    fn config_with_route(path: &str) -> String {
        format!(
            r#"
listen_addr = "127.0.0.1:9999"

[services.customers]
instances = ["http://127.0.0.1:8080"]

[[routes]]
id = "customers"
path = "{path}"
uri = "lb://customers"
"#
        )
    }

    #[tokio::test]
    async fn test_file_config_provider() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("rampart.toml");
        File::create(&file_path)?.write_all(config_with_route("/customers").as_bytes())?;

        let provider = FileConfigProvider::new(&file_path)?;
        let config = provider.load_config().await?;
        assert_eq!(config.routes[0].path, "/customers");

        let mut rx = provider.watch();
        sleep(Duration::from_millis(100)).await;
        File::create(&file_path)?.write_all(config_with_route("/people/**").as_bytes())?;

        let notification = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(
            matches!(notification, Ok(Some(()))),
            "Timed out waiting for config update"
        );

        let config = provider.load_config().await?;
        assert_eq!(config.routes[0].path, "/people/**");
        Ok(())
    }

    #[tokio::test]
    async fn test_second_watch_is_closed() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("rampart.toml");
        File::create(&file_path)?.write_all(config_with_route("/customers").as_bytes())?;

        let provider = FileConfigProvider::new(&file_path)?;
        let _first = provider.watch();
        let mut second = provider.watch();
        assert!(second.recv().await.is_none());
        Ok(())
    }
}
