use std::path::PathBuf;

/// Default worker pool size. Local accelerators rarely fit two models.
const DEFAULT_MAX_CONCURRENT_JOBS: usize = 1;

/// Default root for the database and project files.
const DEFAULT_DATA_DIR: &str = "./data";

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Number of worker tasks in the pool (always at least 1).
    pub max_concurrent_jobs: usize,
    pub data_dir: PathBuf,
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Root directory for per-project asset folders.
    pub projects_dir: PathBuf,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default                 |
    /// |-------------------------------|-------------------------|
    /// | `CLIPPER_MAX_CONCURRENT_JOBS` | `1`                     |
    /// | `CLIPPER_DATA_DIR`            | `./data`                |
    /// | `CLIPPER_DB_PATH`             | `<data_dir>/app.db`     |
    /// | `CLIPPER_PROJECTS_DIR`        | `<data_dir>/projects`   |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let max_concurrent_jobs =
            parse_concurrency(lookup("CLIPPER_MAX_CONCURRENT_JOBS").as_deref());

        let data_dir = lookup("CLIPPER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

        let db_path = lookup("CLIPPER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("app.db"));

        let projects_dir = lookup("CLIPPER_PROJECTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("projects"));

        Self {
            max_concurrent_jobs,
            data_dir,
            db_path,
            projects_dir,
        }
    }

    /// Same defaults as [`from_env`](Self::from_env) with a fixed pool size.
    pub fn with_concurrency(max_concurrent_jobs: usize) -> Self {
        Self {
            max_concurrent_jobs: max_concurrent_jobs.max(1),
            ..Self::default()
        }
    }

    /// SQLite connection URL for [`clipper_db::create_pool`].
    pub fn database_url(&self) -> String {
        format!("sqlite://{}", self.db_path.display())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parse_concurrency(raw: Option<&str>) -> usize {
    let Some(raw) = raw else {
        return DEFAULT_MAX_CONCURRENT_JOBS;
    };
    match raw.trim().parse::<i64>() {
        Ok(n) if n >= 1 => n as usize,
        Ok(n) => {
            tracing::warn!(value = n, "CLIPPER_MAX_CONCURRENT_JOBS below 1; using 1");
            1
        }
        Err(_) => {
            tracing::warn!(
                value = raw,
                default = DEFAULT_MAX_CONCURRENT_JOBS,
                "CLIPPER_MAX_CONCURRENT_JOBS is not an integer; using default",
            );
            DEFAULT_MAX_CONCURRENT_JOBS
        }
    }
}
