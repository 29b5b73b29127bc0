use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    /// Engine configuration file; engine defaults apply when unset
    pub engine_config: Option<PathBuf>,
    pub log_level: String,
}

impl HarnessConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(std::env::var("VSA_DATA_DIR").unwrap_or_else(|_| "./data".into()));

        Self {
            db_path: std::env::var("VSA_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("vsa-harness.db")),
            data_dir,
            engine_config: std::env::var("VSA_ENGINE_CONFIG").ok().map(PathBuf::from),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
        }
    }
}
