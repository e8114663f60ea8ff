//! Privilege dropping (§10.5): bind the privileged port first, then give up
//! root. Runs after [`crate::dispatcher::Dispatcher::bind`] and before the
//! server loop starts accepting datagrams.

use nix::sys::stat::{umask, Mode};
use nix::unistd::{setgid, setuid, Gid, Group, Uid, User};
use tracing::warn;

use crate::config::PrivilegeConfig;
use crate::error::{Result, TftpError};

/// Drop to the configured user/group and apply the configured umask. A
/// no-op for any field left empty, so a config with no `privilege` section
/// runs unchanged (e.g. already unprivileged, or intentionally root).
///
/// Per §6: `user`/`group` only take effect when the process euid is 0. A
/// misconfigured (unknown) user or group is still reported as an error
/// regardless of euid — that is a config mistake worth surfacing — but the
/// actual `setuid`/`setgid` calls are skipped when not running as root,
/// since there would be nothing to drop from and the calls would merely
/// fail with EPERM.
pub fn drop_privileges(config: &PrivilegeConfig) -> Result<()> {
    let running_as_root = Uid::effective().is_root();
    let wants_drop = !config.user.is_empty() || !config.group.is_empty();
    if wants_drop && !running_as_root {
        warn!("user/group configured but process is not running as root; skipping privilege drop");
    }

    if !config.group.is_empty() {
        let group = Group::from_name(&config.group)
            .map_err(|e| TftpError::Tftp(format!("group lookup failed: {e}")))?
            .ok_or_else(|| TftpError::Tftp(format!("unknown group '{}'", config.group)))?;
        if running_as_root {
            set_gid(group.gid)?;
        }
    }

    if !config.user.is_empty() {
        let user = User::from_name(&config.user)
            .map_err(|e| TftpError::Tftp(format!("user lookup failed: {e}")))?
            .ok_or_else(|| TftpError::Tftp(format!("unknown user '{}'", config.user)))?;
        if running_as_root {
            set_uid(user.uid)?;
        }
    }

    apply_umask(config)
}

fn apply_umask(config: &PrivilegeConfig) -> Result<()> {
    if !config.umask.is_empty() {
        let bits = u32::from_str_radix(&config.umask, 8)
            .map_err(|_| TftpError::Tftp(format!("umask '{}' is not valid octal", config.umask)))?;
        let mode = Mode::from_bits_truncate(bits);
        umask(mode);
    }

    Ok(())
}

fn set_gid(gid: Gid) -> Result<()> {
    setgid(gid).map_err(|e| TftpError::Tftp(format!("setgid failed: {e}")))
}

fn set_uid(uid: Uid) -> Result<()> {
    setuid(uid).map_err(|e| TftpError::Tftp(format!("setuid failed: {e}")))
}
