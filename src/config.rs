use std::env;
use std::path::PathBuf;

/// Environment-driven settings, read once at startup and passed into the
/// orchestrator explicitly. `.env` is loaded by `main` before this runs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control-plane listen port.
    pub port: u16,
    /// Hard memory ceiling applied to every service container (e.g. "32mb").
    pub max_memory: String,
    /// Prefix for service image names.
    pub docker_registry: String,
    /// Domain suffix for services that declare no domain of their own.
    pub domain: String,
    /// Optional `user:token` credential for descriptor fetches.
    pub github_http_auth: Option<String>,
    /// Service type used when a repository declares none.
    pub default_image: String,
    /// Directory holding storage/, nginx/, data/ and images/.
    pub home: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(9999),
            max_memory: env::var("CLOUDY_MAX_MEMORY").unwrap_or_else(|_| "32mb".to_string()),
            docker_registry: env::var("CLOUDY_DOCKER_REGISTRY")
                .unwrap_or_else(|_| "cloudy".to_string()),
            domain: env::var("CLOUDY_DOMAIN").unwrap_or_else(|_| "local".to_string()),
            github_http_auth: env::var("CLOUDY_GITHUB_HTTP_AUTH")
                .ok()
                .filter(|v| !v.is_empty()),
            default_image: env::var("CLOUDY_DEFAULT_IMAGE").unwrap_or_default(),
            home: env::var("CLOUDY_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.home.join("storage")
    }

    pub fn nginx_dir(&self) -> PathBuf {
        self.home.join("nginx")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.home.join("data")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.home.join("images")
    }

    pub fn key_file(&self) -> PathBuf {
        self.home.join(".key")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.home.join("cloudy.pid")
    }
}
