//! Proxy configuration rendering and application.
//!
//! The rendered artifact carries two upstream blocks (one per pool) plus one
//! local proxy server block per active backend. Application is atomic: the
//! text is validated, written to a temp file and renamed into place, then
//! published to the shared store, then the reload command runs. A validation
//! failure aborts before anything touches the filesystem.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use upstreamd_common::config::NginxSettings;
use upstreamd_common::error::{ControlError, Result};
use upstreamd_common::model::{Pool, WeightAllocation};
use upstreamd_store::SharedState;

/// Upper bound on the reload command's runtime.
const RELOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Renders the dual-upstream configuration text.
///
/// `generated_at` is threaded in rather than sampled so the same inputs
/// always render byte-identical output.
pub fn render_dual_upstream(
    incoming: &[WeightAllocation],
    outgoing: &[WeightAllocation],
    generated_at: DateTime<Utc>,
) -> String {
    let active_incoming: Vec<&WeightAllocation> =
        incoming.iter().filter(|a| a.is_active()).collect();
    let active_outgoing: Vec<&WeightAllocation> =
        outgoing.iter().filter(|a| a.is_active()).collect();

    let mut config = String::new();
    config.push_str("# ============================================\n");
    config.push_str("# DUAL UPSTREAM CONFIGURATION\n");
    config.push_str(&format!("# Generated at: {}\n", generated_at.to_rfc3339()));
    config.push_str(&format!("# Incoming servers: {}\n", active_incoming.len()));
    config.push_str(&format!("# Outgoing servers: {}\n", active_outgoing.len()));
    config.push_str("# ============================================\n\n");

    render_pool(&mut config, Pool::Incoming, &active_incoming);
    render_pool(&mut config, Pool::Outgoing, &active_outgoing);

    config
}

fn render_pool(config: &mut String, pool: Pool, active: &[&WeightAllocation]) {
    let name = pool.upstream_name();
    if active.is_empty() {
        config.push_str(&format!("# {name} - Placeholder (no active servers)\n"));
        config.push_str(&format!("upstream {name} {{\n"));
        config.push_str("    server 127.0.0.1:65535;  # dummy fallback\n");
        config.push_str("}\n\n");
        return;
    }

    config.push_str(&format!("# {name} - Weighted Round-Robin\n"));
    config.push_str(&format!("upstream {name} {{\n"));
    let mut port = pool.base_proxy_port();
    for allocation in active {
        config.push_str(&format!(
            "    server 127.0.0.1:{port} weight={};  # {} ({}%)\n",
            allocation.weight, allocation.server_id, allocation.weight
        ));
        port += 1;
    }
    config.push_str("}\n\n");

    let mut port = pool.base_proxy_port();
    for allocation in active {
        let hostname = extract_hostname(&allocation.address);
        let path = extract_path(&allocation.address);

        config.push_str(&format!(
            "# Proxy for {} (Weight: {}%)\n",
            allocation.server_id, allocation.weight
        ));
        config.push_str("server {\n");
        config.push_str(&format!("    listen 127.0.0.1:{port};\n"));
        config.push_str(&format!("    server_name {};\n", allocation.server_id));
        config.push_str("\n    location / {\n");
        config.push_str(&format!("        proxy_pass https://{hostname}{path};\n"));
        config.push_str("\n        # Headers\n");
        config.push_str(&format!("        proxy_set_header Host {hostname};\n"));
        config.push_str("        proxy_set_header X-Real-IP $remote_addr;\n");
        config.push_str("        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n");
        config.push_str("        proxy_set_header X-Forwarded-Proto $scheme;\n");
        config.push_str("\n        # Timeouts\n");
        config.push_str("        proxy_connect_timeout 30s;\n");
        config.push_str("        proxy_send_timeout 30s;\n");
        config.push_str("        proxy_read_timeout 30s;\n");
        config.push_str("\n        proxy_redirect off;\n");
        config.push_str("        proxy_buffering on;\n");
        config.push_str("    }\n");
        config.push_str("}\n\n");

        port += 1;
    }
}

fn extract_hostname(address: &str) -> &str {
    match address.find('/') {
        Some(index) => &address[..index],
        None => address,
    }
}

fn extract_path(address: &str) -> String {
    match address.find('/') {
        Some(index) => {
            let path = &address[index..];
            if path.ends_with('/') {
                path.to_string()
            } else {
                format!("{path}/")
            }
        }
        None => "/".to_string(),
    }
}

/// Structural validation of a rendered artifact.
pub fn validate_config(config: &str) -> Result<()> {
    if config.trim().is_empty() {
        return Err(ControlError::Render("generated config is empty".into()));
    }
    let open = config.matches('{').count();
    let close = config.matches('}').count();
    if open != close {
        return Err(ControlError::Render(format!(
            "mismatched braces: {open} open, {close} close"
        )));
    }
    let has_incoming = config.contains("upstream upstream_incoming");
    let has_outgoing = config.contains("upstream upstream_outgoing");
    if !has_incoming && !has_outgoing {
        return Err(ControlError::Render(
            "config missing both upstream directives".into(),
        ));
    }
    Ok(())
}

struct MaterializerState {
    /// The artifact currently applied to the local proxy.
    current: Option<String>,
    /// Stamp of the last successfully applied artifact.
    last_applied: Option<DateTime<Utc>>,
}

/// Writes validated configs to disk and drives the proxy reload.
pub struct NginxMaterializer {
    settings: NginxSettings,
    shared: Arc<SharedState>,
    state: Mutex<MaterializerState>,
}

impl NginxMaterializer {
    pub fn new(settings: NginxSettings, shared: Arc<SharedState>) -> Self {
        Self {
            settings,
            shared,
            state: Mutex::new(MaterializerState {
                current: None,
                last_applied: None,
            }),
        }
    }

    /// Renders both pools, applies locally and publishes to the shared
    /// store so sibling instances can adopt the artifact.
    pub async fn publish(
        &self,
        incoming: &[WeightAllocation],
        outgoing: &[WeightAllocation],
    ) -> Result<()> {
        let stamp = Utc::now();
        let config = render_dual_upstream(incoming, outgoing, stamp);
        validate_config(&config)?;

        self.write_config(&config).await?;
        self.shared.put_proxy_config(&config).await;
        self.finish_apply(config, stamp).await
    }

    /// Applies an already rendered artifact (the drift reconciler's path);
    /// nothing is written back to the shared store.
    pub async fn apply(&self, config: &str, stamp: DateTime<Utc>) -> Result<()> {
        validate_config(config)?;
        self.write_config(config).await?;
        self.finish_apply(config.to_string(), stamp).await
    }

    async fn finish_apply(&self, config: String, stamp: DateTime<Utc>) -> Result<()> {
        match self.reload().await {
            Ok(()) => {
                let mut state = self.state.lock().await;
                state.current = Some(config);
                state.last_applied = Some(stamp);
                info!("proxy configuration updated and reloaded");
                Ok(())
            }
            Err(e) => {
                // The file stays on disk for an external watcher; only the
                // in-memory artifact keeps its previous value.
                error!(error = %e, "proxy reload failed, keeping prior artifact");
                Err(e)
            }
        }
    }

    pub async fn current(&self) -> Option<String> {
        self.state.lock().await.current.clone()
    }

    pub async fn last_applied(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.last_applied
    }

    /// Marks an artifact as applied without touching disk. Used when the
    /// shared store already matches what is running locally.
    pub async fn note_applied(&self, config: String, stamp: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.current = Some(config);
        state.last_applied = Some(stamp);
    }

    async fn write_config(&self, config: &str) -> Result<()> {
        let path = PathBuf::from(self.settings.config_path());
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        if self.settings.backup_enabled && tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let backup = backup_path(&path, Utc::now());
            if let Err(e) = tokio::fs::copy(&path, &backup).await {
                warn!(error = %e, "failed to back up prior config");
            } else {
                debug!(backup = %backup.display(), "backed up prior config");
            }
        }

        // Temp file + rename keeps partial writes invisible to any watcher
        // on the target path.
        let tmp = path.with_extension("conf.tmp");
        tokio::fs::write(&tmp, config).await?;
        tokio::fs::rename(&tmp, &path).await?;
        info!(path = %path.display(), bytes = config.len(), "wrote proxy config");
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        let mut parts = self.settings.reload_command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| ControlError::Reload("empty reload command".into()))?;
        let mut command = tokio::process::Command::new(program);
        command.args(parts);

        let status = tokio::time::timeout(RELOAD_TIMEOUT, async {
            command
                .status()
                .await
                .map_err(|e| ControlError::Reload(format!("{program}: {e}")))
        })
        .await
        .map_err(|_| ControlError::Reload(format!("{program}: timed out")))??;

        if status.success() {
            debug!(command = %self.settings.reload_command, "proxy reloaded");
            Ok(())
        } else {
            Err(ControlError::Reload(format!(
                "{program} exited with {status}"
            )))
        }
    }
}

fn backup_path(path: &Path, stamp: DateTime<Utc>) -> PathBuf {
    let mut backup = path.as_os_str().to_owned();
    backup.push(format!(".backup-{}", stamp.format("%Y%m%d%H%M%S")));
    PathBuf::from(backup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use upstreamd_common::config::{KeyLayout, TtlSettings};
    use upstreamd_store::MemoryStore;

    fn allocation(id: &str, address: &str, weight: u32) -> WeightAllocation {
        WeightAllocation::new(id, address, weight, 0.9, "test")
    }

    fn fixed_stamp() -> DateTime<Utc> {
        "2025-06-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_render_contains_both_upstreams() {
        let incoming = vec![allocation("in1", "a.example.com", 100)];
        let outgoing = vec![
            allocation("out1", "b.example.com", 60),
            allocation("out2", "c.example.com", 40),
        ];
        let config = render_dual_upstream(&incoming, &outgoing, fixed_stamp());

        assert!(config.contains("upstream upstream_incoming {"));
        assert!(config.contains("upstream upstream_outgoing {"));
        assert!(config.contains("server 127.0.0.1:8081 weight=100;  # in1 (100%)"));
        assert!(config.contains("server 127.0.0.1:9081 weight=60;  # out1 (60%)"));
        assert!(config.contains("server 127.0.0.1:9082 weight=40;  # out2 (40%)"));
        assert!(config.contains("proxy_pass https://b.example.com/;"));
        assert!(config.contains("proxy_connect_timeout 30s;"));
        validate_config(&config).unwrap();
    }

    #[test]
    fn test_render_ports_are_sequential_over_active_only() {
        let outgoing = vec![
            allocation("a", "a.example.com", 50),
            allocation("b", "b.example.com", 0),
            allocation("c", "c.example.com", 50),
        ];
        let config = render_dual_upstream(&[], &outgoing, fixed_stamp());
        // The inactive server consumes no port.
        assert!(config.contains("server 127.0.0.1:9081 weight=50;  # a"));
        assert!(config.contains("server 127.0.0.1:9082 weight=50;  # c"));
        assert!(!config.contains("# b ("));
    }

    #[test]
    fn test_render_empty_pool_gets_placeholder() {
        let outgoing = vec![allocation("out1", "b.example.com", 100)];
        let config = render_dual_upstream(&[], &outgoing, fixed_stamp());
        assert!(config.contains("upstream upstream_incoming {\n    server 127.0.0.1:65535;"));
        validate_config(&config).unwrap();
    }

    #[test]
    fn test_render_both_empty_still_parses() {
        let config = render_dual_upstream(&[], &[], fixed_stamp());
        assert!(config.contains("upstream upstream_incoming"));
        assert!(config.contains("upstream upstream_outgoing"));
        assert_eq!(config.matches("127.0.0.1:65535").count(), 2);
        validate_config(&config).unwrap();
    }

    #[test]
    fn test_render_is_deterministic() {
        let outgoing = vec![allocation("out1", "b.example.com/api", 100)];
        let first = render_dual_upstream(&[], &outgoing, fixed_stamp());
        let second = render_dual_upstream(&[], &outgoing, fixed_stamp());
        assert_eq!(first, second);
    }

    #[test]
    fn test_address_path_handling() {
        let outgoing = vec![allocation("out1", "b.example.com/api/v2", 100)];
        let config = render_dual_upstream(&[], &outgoing, fixed_stamp());
        assert!(config.contains("proxy_pass https://b.example.com/api/v2/;"));
        assert!(config.contains("proxy_set_header Host b.example.com;"));
    }

    #[test]
    fn test_render_parse_reemit_is_byte_identical() {
        // Tokenize a rendered config back into allocations and re-render it
        // with the embedded timestamp; the output must match byte for byte.
        let incoming = vec![allocation("in1", "a.example.com/api", 100)];
        let outgoing = vec![
            allocation("out1", "b.example.com", 60),
            allocation("out2", "c.example.com/v2", 40),
        ];
        let original = render_dual_upstream(&incoming, &outgoing, fixed_stamp());

        let generated_at: DateTime<Utc> = original
            .lines()
            .find_map(|line| line.strip_prefix("# Generated at: "))
            .unwrap()
            .parse()
            .unwrap();

        // port -> proxy_pass target, from the proxy server blocks.
        let mut targets = std::collections::HashMap::new();
        let mut listen_port = None;
        for line in original.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("listen 127.0.0.1:") {
                listen_port = Some(rest.trim_end_matches(';').to_string());
            }
            if let Some(rest) = line.strip_prefix("proxy_pass https://") {
                let target = rest.trim_end_matches(';').to_string();
                targets.insert(listen_port.clone().unwrap(), target);
            }
        }

        // Upstream entries, in order of appearance per pool.
        let mut pools: Vec<Vec<WeightAllocation>> = Vec::new();
        for line in original.lines() {
            if line.starts_with("upstream ") {
                pools.push(Vec::new());
            }
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix("server 127.0.0.1:") {
                if !rest.contains("weight=") {
                    continue;
                }
                let port = rest.split(' ').next().unwrap().to_string();
                let weight: u32 = rest
                    .split("weight=")
                    .nth(1)
                    .unwrap()
                    .split(';')
                    .next()
                    .unwrap()
                    .parse()
                    .unwrap();
                let id = rest.split("# ").nth(1).unwrap().split(" (").next().unwrap();
                let address = targets[&port].clone();
                pools.last_mut().unwrap().push(allocation(id, &address, weight));
            }
        }

        assert_eq!(pools.len(), 2);
        let reemitted = render_dual_upstream(&pools[0], &pools[1], generated_at);
        assert_eq!(reemitted, original);
    }

    #[test]
    fn test_validate_rejects_empty() {
        assert!(validate_config("").is_err());
        assert!(validate_config("   \n").is_err());
    }

    #[test]
    fn test_validate_rejects_unbalanced_braces() {
        assert!(validate_config("upstream upstream_incoming { server x;").is_err());
    }

    #[test]
    fn test_validate_rejects_missing_upstreams() {
        assert!(validate_config("server { listen 80; }").is_err());
    }

    #[test]
    fn test_validate_brace_count_matches_render() {
        let config = render_dual_upstream(
            &[allocation("in1", "a.example.com", 100)],
            &[allocation("out1", "b.example.com", 100)],
            fixed_stamp(),
        );
        assert_eq!(config.matches('{').count(), config.matches('}').count());
    }

    fn materializer(dir: &TempDir, reload: &str) -> NginxMaterializer {
        let settings = NginxSettings {
            config_dir: dir.path().to_str().unwrap().to_string(),
            config_file: "upstream.conf".to_string(),
            reload_command: reload.to_string(),
            backup_enabled: false,
        };
        let shared = Arc::new(SharedState::new(
            Arc::new(MemoryStore::new()),
            KeyLayout::default(),
            TtlSettings::default(),
            "test",
        ));
        NginxMaterializer::new(settings, shared)
    }

    #[tokio::test]
    async fn test_publish_writes_file_and_shared_state() {
        let dir = TempDir::new().unwrap();
        let materializer = materializer(&dir, "true");
        let outgoing = vec![allocation("out1", "b.example.com", 100)];

        materializer.publish(&[], &outgoing).await.unwrap();

        let written = std::fs::read_to_string(dir.path().join("upstream.conf")).unwrap();
        assert!(written.contains("upstream upstream_outgoing"));
        assert_eq!(materializer.current().await.unwrap(), written);
        assert!(materializer.last_applied().await.is_some());
        assert_eq!(materializer.shared.get_proxy_config().await.unwrap(), written);
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_file_but_not_artifact() {
        let dir = TempDir::new().unwrap();
        let materializer = materializer(&dir, "false");
        let outgoing = vec![allocation("out1", "b.example.com", 100)];

        let result = materializer.publish(&[], &outgoing).await;
        assert!(matches!(result, Err(ControlError::Reload(_))));
        // The file stays for an external watcher to pick up.
        assert!(dir.path().join("upstream.conf").exists());
        // The in-memory artifact keeps its prior (absent) value.
        assert!(materializer.current().await.is_none());
    }

    #[tokio::test]
    async fn test_apply_does_not_republish() {
        let dir = TempDir::new().unwrap();
        let materializer = materializer(&dir, "true");
        let config = render_dual_upstream(
            &[],
            &[allocation("out1", "b.example.com", 100)],
            fixed_stamp(),
        );

        materializer.apply(&config, fixed_stamp()).await.unwrap();

        assert_eq!(materializer.current().await.unwrap(), config);
        assert_eq!(materializer.last_applied().await, Some(fixed_stamp()));
        assert!(materializer.shared.get_proxy_config().await.is_none());
    }

    #[tokio::test]
    async fn test_apply_rejects_invalid_config_before_write() {
        let dir = TempDir::new().unwrap();
        let materializer = materializer(&dir, "true");
        let result = materializer.apply("not a config {", fixed_stamp()).await;
        assert!(matches!(result, Err(ControlError::Render(_))));
        assert!(!dir.path().join("upstream.conf").exists());
    }
}
