use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use frame_bus::{BoxStyle, Color, PipelineConfig};
use serde::{Deserialize, Serialize};

pub const CONFIG_ENV: &str = "LITE_DETECT_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "lite-detect.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputSettings {
    /// Raw frames of a fixed geometry, back to back
    File {
        path: String,
        width: u32,
        height: u32,
        #[serde(default = "default_format")]
        format: String,
    },
    TestPattern {
        width: u32,
        height: u32,
        /// 0 = endless
        frames: u64,
    },
}

fn default_format() -> String {
    "nv12".to_string()
}

impl Default for InputSettings {
    fn default() -> Self {
        InputSettings::TestPattern {
            width: 640,
            height: 480,
            frames: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api_addr: String,
    pub log_level: String,
    pub workers: usize,
    pub fps: u32,
    /// Give up on a missing frame after this long; unset waits forever.
    pub stall_timeout_ms: Option<u64>,
    /// Detection box style. Only drawn when a detector is installed through
    /// `PipeConfigBuilder::detector`; the stock binary runs without one.
    pub box_color: [u8; 3],
    pub box_thickness: i32,
    pub fps_overlay: bool,
    /// Pace the source at `fps` instead of reading as fast as possible.
    pub realtime: bool,
    pub input: InputSettings,
    /// Where annotated frames are written as raw video, if anywhere.
    pub output_path: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_addr: "0.0.0.0:8080".to_string(),
            log_level: "info".to_string(),
            workers: 2,
            fps: 30,
            stall_timeout_ms: None,
            box_color: [255, 100, 100],
            box_thickness: 2,
            fps_overlay: true,
            realtime: true,
            input: InputSettings::default(),
            output_path: None,
        }
    }
}

impl AppConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: AppConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("parse config {}", path.display()))
    }

    /// First CLI argument, then `LITE_DETECT_CONFIG`, then `lite-detect.json`
    /// in the working directory. Defaults when none of them exists.
    pub fn load() -> anyhow::Result<Self> {
        if let Some(path) = std::env::args().nth(1) {
            return Self::from_file(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::from_file(path);
        }
        if Path::new(DEFAULT_CONFIG_FILE).exists() {
            return Self::from_file(DEFAULT_CONFIG_FILE);
        }
        Ok(Self::default())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.fps == 0 {
            anyhow::bail!("fps must be at least 1");
        }
        Ok(())
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let [r, g, b] = self.box_color;
        PipelineConfig {
            workers: self.workers,
            fps: self.fps,
            stall_timeout: self.stall_timeout_ms.map(Duration::from_millis),
            box_style: BoxStyle {
                color: Color::rgb(r, g, b),
                thickness: self.box_thickness,
            },
        }
    }
}

pub fn config() -> &'static AppConfig {
    static CONFIG: LazyLock<AppConfig> = LazyLock::new(|| {
        AppConfig::load().unwrap_or_else(|e| {
            eprintln!("Error loading config: {:#}", e);
            std::process::exit(1);
        })
    });
    &CONFIG
}
