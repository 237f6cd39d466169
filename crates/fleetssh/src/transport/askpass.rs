use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::process::Command;

const PASSWORD_ENV: &str = "FLEETSSH_PASSWORD";
const ASKPASS_SCRIPT: &str = "#!/bin/sh\nprintf '%s\\n' \"$FLEETSSH_PASSWORD\"\n";

/// Makes `ssh` read the password from our environment instead of a terminal.
pub(super) fn apply_askpass_env(cmd: &mut Command, script: &Path, password: &str) {
    cmd.env(PASSWORD_ENV, password)
        .env("SSH_ASKPASS", script)
        .env("SSH_ASKPASS_REQUIRE", "force")
        .env("DISPLAY", ":0");
}

/// Writes the helper script into `dir` once and returns its path.
pub(super) fn ensure_askpass_script(dir: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join("ssh-askpass.sh");
    let current = std::fs::read(&path).ok();
    if current.as_deref() != Some(ASKPASS_SCRIPT.as_bytes()) {
        std::fs::write(&path, ASKPASS_SCRIPT)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path)?.permissions();
        perms.set_mode(0o700);
        std::fs::set_permissions(&path, perms)?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_is_written_once_and_executable() {
        let dir = std::env::temp_dir().join(format!("fleetssh-askpass-{}", std::process::id()));
        let first = ensure_askpass_script(&dir).expect("write script");
        let second = ensure_askpass_script(&dir).expect("reuse script");
        assert_eq!(first, second);
        let contents = std::fs::read_to_string(&first).expect("read script");
        assert!(contents.contains(PASSWORD_ENV));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&first).expect("stat").permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
        let _ = std::fs::remove_dir_all(&dir);
    }
}
