use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::Endpoint;
use crate::{Error, Result};

/// Persisted endpoint description (credentials are NOT persisted, only the
/// auth kind so the caller knows what to supply on reconnect).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub configuration_name: String,
}

impl SessionEndpoint {
    pub fn to_endpoint(&self) -> Result<Endpoint> {
        Ok(Endpoint::new(self.host.clone(), self.port, self.tls)?
            .with_configuration_name(self.configuration_name.clone()))
    }
}

impl From<&Endpoint> for SessionEndpoint {
    fn from(endpoint: &Endpoint) -> Self {
        Self {
            host: endpoint.host().to_owned(),
            port: endpoint.port(),
            tls: endpoint.tls(),
            configuration_name: endpoint.configuration_name().to_owned(),
        }
    }
}

/// Everything needed to reconnect to a disconnected shell from a new
/// process: shell/pool identity, outstanding pipelines, and optional
/// per-pipeline output recovery paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub endpoint: SessionEndpoint,
    pub auth_kind: String,
    pub shell_id: Uuid,
    pub pool_id: Uuid,
    #[serde(default)]
    pub pipeline_ids: Vec<Uuid>,
    #[serde(default)]
    pub output_paths: HashMap<Uuid, String>,
}

impl SessionState {
    /// Write as JSON with owner-only permissions.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::protocol(format!("serialize session state: {e}")))?;

        write_owner_only(path, json.as_bytes())?;
        debug!(path = %path.display(), shell_id = %self.shell_id, "session state saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| Error::protocol(format!("parse session state: {e}")))
    }
}

#[cfg(unix)]
fn write_owner_only(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_owner_only(path: &Path, contents: &[u8]) -> Result<()> {
    // Windows ACLs default to the owner for files under the profile.
    std::fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionState {
        let mut output_paths = HashMap::new();
        let pipeline = Uuid::new_v4();
        output_paths.insert(pipeline, "/tmp/out.log".to_owned());
        SessionState {
            endpoint: SessionEndpoint {
                host: "srv01".into(),
                port: 5986,
                tls: true,
                configuration_name: "Microsoft.PowerShell".into(),
            },
            auth_kind: "Negotiate".into(),
            shell_id: Uuid::new_v4(),
            pool_id: Uuid::new_v4(),
            pipeline_ids: vec![pipeline],
            output_paths,
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("ferrosh-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("session.json");

        let state = sample();
        state.save(&path).expect("save");

        let loaded = SessionState::load(&path).expect("load");
        assert_eq!(loaded.shell_id, state.shell_id);
        assert_eq!(loaded.pool_id, state.pool_id);
        assert_eq!(loaded.pipeline_ids, state.pipeline_ids);
        assert_eq!(loaded.endpoint.host, "srv01");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("ferrosh-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("session.json");

        sample().save(&path).expect("save");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn endpoint_round_trips() {
        let state = sample();
        let endpoint = state.endpoint.to_endpoint().expect("endpoint");
        assert_eq!(endpoint.url(), "https://srv01:5986/wsman");
    }
}
