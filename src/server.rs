//! Orchestrator process lifecycle: project scaffolding, the pid file, the
//! SIGHUP reload nudge between the CLI and a running server, and the
//! self-update triggered by `POST /reload`.

use std::sync::Arc;

use rand::RngCore;
use rand::rngs::OsRng;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::orchestrator::Orchestrator;

const ENV_TEMPLATE: &str = "\
PORT=9999
CLOUDY_MAX_MEMORY=32mb
CLOUDY_DOCKER_REGISTRY=cloudy
CLOUDY_DOMAIN=local
CLOUDY_DEFAULT_IMAGE=
CLOUDY_GITHUB_HTTP_AUTH=
";

/// Scaffolds a new cloudy environment: the state directories, a random
/// operator secret and a starter `.env`. Existing files are left alone.
pub fn init_project(config: &Config) -> Result<()> {
    for dir in [
        config.storage_dir(),
        config.nginx_dir(),
        config.data_dir(),
        config.images_dir(),
    ] {
        std::fs::create_dir_all(&dir).map_err(|e| Error::File(dir.clone(), e))?;
    }

    let key_file = config.key_file();
    if !key_file.exists() {
        let mut entropy = [0u8; 128];
        OsRng.fill_bytes(&mut entropy);
        std::fs::write(&key_file, hex::encode(entropy))
            .map_err(|e| Error::File(key_file.clone(), e))?;
    }

    let env_file = config.home.join(".env");
    if !env_file.exists() {
        std::fs::write(&env_file, ENV_TEMPLATE).map_err(|e| Error::File(env_file.clone(), e))?;
    }

    log::info!("Project created at {:?}", config.home);
    Ok(())
}

pub fn write_pid_file(config: &Config) -> Result<()> {
    let path = config.pid_file();
    std::fs::write(&path, std::process::id().to_string()).map_err(|e| Error::File(path, e))
}

pub fn remove_pid_file(config: &Config) {
    let _ = std::fs::remove_file(config.pid_file());
}

/// Best-effort nudge from the CLI to a running server after a local
/// mutation: the server re-reads its stores on SIGHUP. No server, no
/// problem.
pub fn nudge_server(config: &Config) {
    let pid = match std::fs::read_to_string(config.pid_file()) {
        Ok(pid) => pid,
        Err(_) => {
            log::debug!("No pid file, skipping server reload");
            return;
        }
    };
    let pid: i32 = match pid.trim().parse() {
        Ok(pid) => pid,
        Err(err) => {
            log::warn!("Unreadable pid file: {err}");
            return;
        }
    };

    if let Err(err) = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid),
        nix::sys::signal::Signal::SIGHUP,
    ) {
        log::debug!("Could not signal server process {pid}: {err}");
    }
}

/// Installs the server-side SIGHUP handler: another process changed the
/// backing files, so drop the in-memory view of both stores.
pub fn handle_reload_signals(orchestrator: Arc<Orchestrator>) {
    tokio::spawn(async move {
        let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(hangup) => hangup,
            Err(err) => {
                log::error!("Unable to listen for SIGHUP: {err}");
                return;
            }
        };

        while hangup.recv().await.is_some() {
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Reloading]);
            orchestrator.registry.reload();
            orchestrator.keys.reload();
            log::info!("Reloaded registry and key store from disk");
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);
        }
    });
}

/// Pulls the orchestrator's own repository, rebuilds the binary and exits
/// so the supervisor restarts it. Any failing step aborts the update and
/// leaves the current process running.
pub async fn self_update() {
    let steps: [(&str, &[&str]); 2] = [
        ("git", &["pull", "--rebase"]),
        ("cargo", &["build", "--release"]),
    ];

    for (program, args) in steps {
        log::info!("Running {program} {}", args.join(" "));
        match tokio::process::Command::new(program).args(args).output().await {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                log::error!(
                    "{program} failed with {}:\n{}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                );
                return;
            }
            Err(err) => {
                log::error!("Failed to invoke {program}: {err}");
                return;
            }
        }
    }

    log::info!("Update complete, exiting for restart");
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
    std::process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config(home: PathBuf) -> Config {
        Config {
            port: 9999,
            max_memory: "32mb".to_string(),
            docker_registry: "cloudy".to_string(),
            domain: "local".to_string(),
            github_http_auth: None,
            default_image: String::new(),
            home,
        }
    }

    #[test]
    fn init_scaffolds_directories_and_secret() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path().to_path_buf());

        init_project(&config).unwrap();

        assert!(config.storage_dir().is_dir());
        assert!(config.nginx_dir().is_dir());
        assert!(config.data_dir().is_dir());
        assert!(config.images_dir().is_dir());

        let key = std::fs::read_to_string(config.key_file()).unwrap();
        assert_eq!(key.len(), 256);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn init_preserves_an_existing_secret() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path().to_path_buf());

        init_project(&config).unwrap();
        let first = std::fs::read_to_string(config.key_file()).unwrap();
        init_project(&config).unwrap();
        let second = std::fs::read_to_string(config.key_file()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn pid_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path().to_path_buf());

        write_pid_file(&config).unwrap();
        let pid = std::fs::read_to_string(config.pid_file()).unwrap();
        assert_eq!(pid, std::process::id().to_string());

        remove_pid_file(&config);
        assert!(!config.pid_file().exists());
    }
}
