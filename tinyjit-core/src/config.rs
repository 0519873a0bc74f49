use std::{env, path::PathBuf, time::Duration};

use crate::{bail, Result};

/// Compiler used when neither `TINYJIT_CC` nor `CC` is set.
pub const DEFAULT_COMPILER: &str = "cc";
/// How long a single kernel build may take.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings for building and loading native kernels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitConfig {
    /// C compiler executable.
    pub compiler: String,
    /// Flags appended after the built-in `-shared -fPIC -O3`.
    pub extra_flags: Vec<String>,
    /// Directory holding generated sources and shared modules.
    pub cache_dir: PathBuf,
    /// The compiler is killed once this elapses.
    pub timeout: Duration,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            compiler: DEFAULT_COMPILER.to_string(),
            extra_flags: Vec::new(),
            cache_dir: default_cache_dir(),
            timeout: DEFAULT_BUILD_TIMEOUT,
        }
    }
}

impl JitConfig {
    /// Defaults overridden by the environment:
    /// - `TINYJIT_CC`, then `CC`: compiler
    /// - `TINYJIT_CFLAGS`: extra flags, whitespace separated
    /// - `TINYJIT_CACHE_DIR`: artifact directory
    /// - `TINYJIT_BUILD_TIMEOUT_SECS`: compiler timeout in seconds
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(cc) = non_empty_var("TINYJIT_CC").or_else(|| non_empty_var("CC")) {
            cfg.compiler = cc;
        }
        if let Some(flags) = non_empty_var("TINYJIT_CFLAGS") {
            cfg.extra_flags = flags.split_whitespace().map(str::to_string).collect();
        }
        if let Some(dir) = non_empty_var("TINYJIT_CACHE_DIR") {
            cfg.cache_dir = PathBuf::from(dir);
        }
        if let Some(secs) = non_empty_var("TINYJIT_BUILD_TIMEOUT_SECS") {
            cfg.timeout = parse_timeout(&secs)?;
        }
        Ok(cfg)
    }

    pub fn with_compiler(mut self, compiler: impl Into<String>) -> Self {
        self.compiler = compiler.into();
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.extra_flags.push(flag.into());
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_timeout(value: &str) -> Result<Duration> {
    match value.trim().parse::<u64>() {
        Ok(0) => bail!("TINYJIT_BUILD_TIMEOUT_SECS must be positive"),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(err) => bail!("invalid TINYJIT_BUILD_TIMEOUT_SECS `{value}`: {err}"),
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(env::temp_dir)
        .join("tinyjit")
        .join("kernels")
}
