use std::path::PathBuf;
use std::time::Duration;

/// Executables of the external tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSettings {
    /// Single-node imager
    pub imager: String,
    /// MPI-enabled imager used for multi-node runs
    pub imager_mp: String,
    /// Calibrator; also merges sub-band inputs
    pub calibrator: String,
    /// MPI launcher
    pub mpirun: String,
    /// Container runtime, used only when a container image is set
    pub container_runtime: String,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            imager: "wsclean".to_string(),
            imager_mp: "wsclean-mp".to_string(),
            calibrator: "DP3".to_string(),
            mpirun: "mpirun".to_string(),
            container_runtime: "singularity".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub tools: ToolSettings,
    /// Run every tool inside this container image
    pub container_image: Option<PathBuf>,
    /// How long a cancelled tool gets between SIGTERM and SIGKILL
    pub termination_grace: Duration,
}

impl PipelineSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = ToolSettings::default();
        Ok(Self {
            tools: ToolSettings {
                imager: env_str("SELFCAL_IMAGER", &defaults.imager),
                imager_mp: env_str("SELFCAL_IMAGER_MP", &defaults.imager_mp),
                calibrator: env_str("SELFCAL_CALIBRATOR", &defaults.calibrator),
                mpirun: env_str("SELFCAL_MPIRUN", &defaults.mpirun),
                container_runtime: env_str("SELFCAL_CONTAINER_RUNTIME", &defaults.container_runtime),
            },
            container_image: std::env::var("SELFCAL_CONTAINER_IMAGE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            termination_grace: Duration::from_secs(env_parse(
                "SELFCAL_TERMINATION_GRACE_SECS",
                10,
            )?),
        })
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            tools: ToolSettings::default(),
            container_image: None,
            termination_grace: Duration::from_secs(10),
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}
