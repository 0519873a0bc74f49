use std::{
    fs::{self, File},
    path::Path,
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{config::JitConfig, Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub fn lib_ext() -> &'static str {
    if cfg!(target_os = "macos") {
        ".dylib"
    } else if cfg!(target_os = "windows") {
        ".dll"
    } else {
        ".so"
    }
}

fn command(cfg: &JitConfig, src: &Path, out: &Path) -> Command {
    let mut cmd = Command::new(&cfg.compiler);
    if cfg!(target_os = "macos") {
        cmd.arg("-dynamiclib");
    } else {
        cmd.arg("-shared").arg("-fPIC");
    }
    cmd.arg("-O3");
    cmd.args(&cfg.extra_flags);
    cmd.arg("-o").arg(out).arg(src);
    if !cfg!(target_os = "windows") {
        cmd.arg("-lm");
    }
    cmd
}

/// Compile `src` into a shared module at `out`, waiting at most `cfg.timeout`.
pub fn compile_shared(cfg: &JitConfig, src: &Path, out: &Path) -> Result<()> {
    let build_failure = |stderr: String| {
        Error::BuildFailure {
            compiler: cfg.compiler.clone(),
            source_path: src.to_path_buf(),
            stderr,
        }
        .bt()
    };

    // Compiler diagnostics go to a file so a chatty compiler cannot fill a pipe.
    let log_path = out.with_extension("log");
    let log = File::create(&log_path)?;
    let mut cmd = command(cfg, src, out);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(log));
    debug!(?cmd, "invoking compiler");

    let mut child = cmd
        .spawn()
        .map_err(|err| build_failure(format!("failed to spawn compiler: {err}")))?;

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(err) => {
                warn!(%err, src = %src.display(), "lost track of compiler, killing it");
                reap(&mut child, &log_path);
                return Err(err.into());
            }
        }
        if started.elapsed() >= cfg.timeout {
            warn!(timeout = ?cfg.timeout, src = %src.display(), "compiler timed out, killing it");
            reap(&mut child, &log_path);
            return Err(Error::BuildTimeout {
                compiler: cfg.compiler.clone(),
                source_path: src.to_path_buf(),
                timeout: cfg.timeout,
            }
            .bt());
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stderr = fs::read_to_string(&log_path).unwrap_or_default();
    let _ = fs::remove_file(&log_path);
    if !status.success() {
        let stderr = if stderr.trim().is_empty() {
            format!("exited with {status}")
        } else {
            stderr
        };
        return Err(build_failure(stderr));
    }
    debug!(elapsed = ?started.elapsed(), out = %out.display(), "compiler finished");
    Ok(())
}

/// Kill and wait for a compiler that will not be waited on again.
fn reap(child: &mut Child, log_path: &Path) {
    let _ = child.kill();
    let _ = child.wait();
    let _ = fs::remove_file(log_path);
}
