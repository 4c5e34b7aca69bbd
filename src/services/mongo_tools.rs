use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// mongodump/mongorestore invocation. Every call is bounded by a timeout;
/// on expiry the child process is killed and the operation fails, so a
/// hung tool can never wedge the backup or restore gate.

/// The oplog lives in the `local` database, which requires admin auth
/// when credentials are in play.
pub fn ensure_auth_source(url: &str) -> String {
    if url.contains("authSource=") {
        return url.to_string();
    }
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{}{}authSource=admin", url, sep)
}

pub async fn dump_full(
    mongo_url: &str,
    archive_path: &Path,
    timeout: Duration,
) -> anyhow::Result<()> {
    let args = vec![
        format!("--uri={}", mongo_url),
        format!("--archive={}", archive_path.display()),
        "--gzip".to_string(),
    ];
    run_tool("mongodump", &args, timeout, false).await?;
    Ok(())
}

pub async fn dump_oplog_slice(
    mongo_url: &str,
    archive_path: &Path,
    query: &str,
    timeout: Duration,
) -> anyhow::Result<String> {
    let args = vec![
        format!("--uri={}", ensure_auth_source(mongo_url)),
        "--db=local".to_string(),
        "--collection=oplog.rs".to_string(),
        format!("--query={}", query),
        format!("--archive={}", archive_path.display()),
        "--gzip".to_string(),
    ];
    // Stderr is returned: mongodump reports the dumped document count
    // there and the caller uses it to detect an empty slice.
    run_tool("mongodump", &args, timeout, false).await
}

/// Full restore. Destructive: `--drop` replaces target collections.
pub async fn restore_full(
    mongo_url: &str,
    archive_path: &Path,
    timeout: Duration,
) -> anyhow::Result<()> {
    let args = vec![
        format!("--uri={}", mongo_url),
        format!("--archive={}", archive_path.display()),
        "--gzip".to_string(),
        "--drop".to_string(),
    ];
    run_tool("mongorestore", &args, timeout, false).await?;
    Ok(())
}

/// Stage an oplog archive into `<scratch_db>.oplog`. A non-zero exit is
/// tolerated here: mongorestore reports an error for zero-document
/// archives, and the caller checks the staged collection afterwards.
pub async fn restore_oplog_to_scratch(
    mongo_url: &str,
    archive_path: &Path,
    scratch_db: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    let args = vec![
        format!("--uri={}", mongo_url),
        format!("--archive={}", archive_path.display()),
        "--gzip".to_string(),
        "--nsFrom=local.oplog.rs".to_string(),
        format!("--nsTo={}.oplog", scratch_db),
    ];
    run_tool("mongorestore", &args, timeout, true).await?;
    Ok(())
}

async fn run_tool(
    program: &str,
    args: &[String],
    timeout: Duration,
    allow_nonzero_exit: bool,
) -> anyhow::Result<String> {
    tracing::debug!(program, ?args, "Spawning MongoDB tool");

    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to spawn {}: {}. Make sure MongoDB database tools are installed.",
                program,
                e
            )
        })?;

    let stderr_pipe = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(mut pipe) = stderr_pipe {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    });

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(res) => res?,
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            anyhow::bail!(
                "{} timed out after {}s and was killed",
                program,
                timeout.as_secs()
            );
        }
    };

    let stderr = stderr_task.await.unwrap_or_default();

    if !status.success() && !allow_nonzero_exit {
        anyhow::bail!(
            "{} failed ({}): {}",
            program,
            status,
            stderr.trim().chars().take(2000).collect::<String>()
        );
    }
    if !status.success() {
        tracing::warn!(program, %status, "Tool exited non-zero (tolerated)");
    }
    Ok(stderr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_source_appended_when_missing() {
        assert_eq!(
            ensure_auth_source("mongodb://localhost:27017"),
            "mongodb://localhost:27017?authSource=admin"
        );
        assert_eq!(
            ensure_auth_source("mongodb://localhost:27017/?replicaSet=rs0"),
            "mongodb://localhost:27017/?replicaSet=rs0&authSource=admin"
        );
        assert_eq!(
            ensure_auth_source("mongodb://u:p@h/?authSource=admin"),
            "mongodb://u:p@h/?authSource=admin"
        );
    }
}
