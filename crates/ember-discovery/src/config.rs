use std::{collections::HashMap, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Deserializer};

/// Launch-request arguments consumed by the discovery core.
///
/// This mirrors the IDE-side launch configuration (camelCase on the wire);
/// fields the adapter does not consume (source maps, trace options, ...) are
/// ignored rather than rejected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchConfig {
    /// Host application to spawn. Required whenever `useWebView` is set.
    pub runtime_executable: Option<String>,
    pub runtime_args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,

    /// Page to debug, highest-precedence first: `file`, `url`, `urlFilter`.
    pub file: Option<PathBuf>,
    pub url: Option<String>,
    pub url_filter: Option<String>,

    /// Remote debugging port. 0 requests dynamic discovery: the host picks a
    /// port and reports it through the notification channel.
    pub port: u16,
    pub address: Option<String>,
    /// Attach timeout in milliseconds.
    pub timeout: Option<u64>,
    pub user_data_dir: Option<PathBuf>,

    pub use_web_view: UseWebView,
    pub no_debug: bool,
}

impl LaunchConfig {
    /// URL (or URL pattern) the target filter matches candidates against.
    pub fn target_url(&self) -> Option<String> {
        if let Some(file) = &self.file {
            return Some(path_to_file_url(file));
        }
        self.url.clone().or_else(|| self.url_filter.clone())
    }

    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or("127.0.0.1")
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout.unwrap_or(10_000))
    }
}

/// The `useWebView` launch flag: absent/`false`, `true` (fixed-port WebView
/// debugging), or `"advanced"` (dynamic discovery through the notification
/// channel). The IDE sends either a boolean or the string, so this
/// deserializes from both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UseWebView {
    #[default]
    Disabled,
    Simple,
    Advanced,
}

impl<'de> Deserialize<'de> for UseWebView {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Mode(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Flag(false) => Ok(Self::Disabled),
            Raw::Flag(true) => Ok(Self::Simple),
            Raw::Mode(mode) if mode.eq_ignore_ascii_case("advanced") => Ok(Self::Advanced),
            Raw::Mode(mode) => Err(serde::de::Error::custom(format!(
                "invalid useWebView value {mode:?}; expected a boolean or \"advanced\""
            ))),
        }
    }
}

fn path_to_file_url(path: &Path) -> String {
    let path = path.to_string_lossy().replace('\\', "/");
    if path.starts_with('/') {
        format!("file://{path}")
    } else {
        format!("file:///{path}")
    }
}
