//! Tracing setup shared by both binaries.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::Level;

/// Install the global subscriber. Logs go to the given file, or to
/// standard output when none is configured.
pub fn init(log_file: Option<&str>, level: Level) -> anyhow::Result<()> {
    match log_file {
        Some(path) => {
            let file = create_log_file(Path::new(path))?;
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_max_level(level).init();
        }
    }
    Ok(())
}

fn create_log_file(path: &Path) -> anyhow::Result<File> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create log directory {}", dir.display()))?;
        }
    }
    File::create(path).with_context(|| format!("create log file {}", path.display()))
}
