use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use muster_types::PkgInfo;

use crate::platform::{EmbeddedScriptRunner, PlatformError};

/// Hard ceiling on any embedded script or installer subprocess.
pub const OVERALL_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Token in `installer_environment` values replaced with the current
/// graphical-session user.
const CONSOLE_USER_TOKEN: &str = "CURRENT_CONSOLE_USER";

/// Builds the sanitized environment handed to installer and script
/// children: a root-equivalent USER/HOME plus the item's explicit
/// `installer_environment` keys.
pub fn sanitized_env(
    console_user: Option<&str>,
    extra: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("USER".to_string(), "root".to_string());
    env.insert(
        "HOME".to_string(),
        if cfg!(windows) { r"C:\Users\Default" } else { "/var/root" }.to_string(),
    );
    env.insert(
        "PATH".to_string(),
        "/usr/bin:/bin:/usr/sbin:/sbin".to_string(),
    );
    for (key, value) in extra {
        let value = if value.contains(CONSOLE_USER_TOKEN) {
            value.replace(CONSOLE_USER_TOKEN, console_user.unwrap_or(""))
        } else {
            value.clone()
        };
        env.insert(key.clone(), value);
    }
    env
}

/// Runs item-embedded scripts out of a temp file with the exec bit set and
/// the sanitized environment.
pub struct ScriptHost {
    console_user: Option<String>,
}

impl ScriptHost {
    pub fn new(console_user: Option<String>) -> ScriptHost {
        ScriptHost { console_user }
    }
}

impl EmbeddedScriptRunner for ScriptHost {
    #[cfg(unix)]
    fn run_script(
        &self,
        label: &str,
        content: &str,
        item: &PkgInfo,
    ) -> Result<i32, PlatformError> {
        use std::os::unix::fs::PermissionsExt;

        let mut script = tempfile::Builder::new()
            .prefix(&format!("{}.", label))
            .tempfile()?;
        script.write_all(content.as_bytes())?;
        script.flush()?;
        let path = script.path().to_path_buf();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;

        let env = sanitized_env(self.console_user.as_deref(), &item.installer_environment);
        let mut stderr_capture = tempfile::tempfile()?;

        let mut command = if content.starts_with("#!") {
            Command::new(&path)
        } else {
            let mut c = Command::new("/bin/sh");
            c.arg(&path);
            c
        };
        let mut child = command
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr_capture.try_clone()?)
            .spawn()?;

        let deadline = Instant::now() + OVERALL_TIMEOUT;
        let code = loop {
            match child.try_wait()? {
                Some(status) => break status.code().unwrap_or(-1),
                None if Instant::now() > deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(PlatformError::Tool {
                        code: -1,
                        stderr: format!("{} for {} timed out", label, item.name),
                    });
                }
                None => std::thread::sleep(Duration::from_millis(100)),
            }
        };

        if code != 0 {
            let mut stderr = String::new();
            let _ = stderr_capture.seek(SeekFrom::Start(0));
            let _ = stderr_capture.read_to_string(&mut stderr);
            log::info!(
                "{} for {} exited {}: {}",
                label,
                item.name,
                code,
                stderr.trim()
            );
        }
        Ok(code)
    }

    #[cfg(not(unix))]
    fn run_script(
        &self,
        _label: &str,
        _content: &str,
        _item: &PkgInfo,
    ) -> Result<i32, PlatformError> {
        Err(PlatformError::Unsupported("embedded scripts"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitized_env_substitutes_console_user() {
        let mut extra = BTreeMap::new();
        extra.insert("TARGET_USER".to_string(), "CURRENT_CONSOLE_USER".to_string());
        extra.insert("MODE".to_string(), "silent".to_string());

        let env = sanitized_env(Some("jdoe"), &extra);
        assert_eq!(env["USER"], "root");
        assert_eq!(env["TARGET_USER"], "jdoe");
        assert_eq!(env["MODE"], "silent");

        let env = sanitized_env(None, &extra);
        assert_eq!(env["TARGET_USER"], "");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_script_exit_codes() {
        let host = ScriptHost::new(None);
        let mut item = PkgInfo::default();
        item.name = "Probe".into();

        assert_eq!(
            host.run_script("installcheck_script", "#!/bin/sh\nexit 0\n", &item)
                .unwrap(),
            0
        );
        assert_eq!(
            host.run_script("installcheck_script", "exit 3", &item).unwrap(),
            3
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_script_sees_installer_environment() {
        let host = ScriptHost::new(Some("jdoe".into()));
        let mut item = PkgInfo::default();
        item.name = "EnvCheck".into();
        item.installer_environment
            .insert("WHO".to_string(), "CURRENT_CONSOLE_USER".to_string());

        let code = host
            .run_script(
                "installcheck_script",
                "#!/bin/sh\ntest \"$WHO\" = jdoe && test \"$USER\" = root\n",
                &item,
            )
            .unwrap();
        assert_eq!(code, 0);
    }
}
