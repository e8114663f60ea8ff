//! Filename sandboxing (§4.2): resolve a client-supplied, possibly templated
//! filename to a canonical path guaranteed to lie under the configured root.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::error::{Result, TftpError};

/// Bounds the `{datetime:FMT}` substitution loop: a deliberate DoS guard
/// against templates that expand to new template markers (§9).
const MAX_DATETIME_EXPANSIONS: usize = 10;

/// Resolve `filename` against `template`, then join onto `root` and verify
/// containment.
///
/// `root` must already be canonicalized by the caller (done once at startup,
/// §6). Read and write paths pass different `template` values.
pub fn resolve(
    root: &Path,
    template: &str,
    filename: &str,
    remote_ip: IpAddr,
    remote_port: u16,
) -> Result<PathBuf> {
    let filename = filename.trim_start_matches('/');
    let expanded = expand_template(template, filename, remote_ip, remote_port);
    let target = root.join(expanded.trim_start_matches('/'));

    reject_symlink(&target)?;

    let canonical_root = root
        .canonicalize()
        .map_err(|_| TftpError::Tftp("root directory error".to_string()))?;

    if let Ok(canonical) = target.canonicalize() {
        ensure_contains(&canonical_root, &canonical)?;
        return Ok(canonical);
    }

    // Target doesn't exist yet (the common WRQ case): canonicalize the
    // nearest existing ancestor instead and check containment on that.
    let mut ancestor = target.parent();
    while let Some(dir) = ancestor {
        if let Ok(canonical_dir) = dir.canonicalize() {
            ensure_contains(&canonical_root, &canonical_dir)?;
            return Ok(target);
        }
        ancestor = dir.parent();
    }

    Err(TftpError::PathEscapesRoot(target.display().to_string()))
}

fn reject_symlink(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Err(TftpError::PathEscapesRoot(format!(
            "{} is a symlink",
            path.display()
        ))),
        _ => Ok(()),
    }
}

/// `Path::starts_with` compares path *components*, not raw strings, so this
/// is already separator-aware: `/srv/tftpmalicious` does not start with
/// `/srv/tftp` because their second components differ. This is what §9
/// requires implementers not get wrong with a naive string prefix check.
fn ensure_contains(root: &Path, candidate: &Path) -> Result<()> {
    if candidate.starts_with(root) {
        Ok(())
    } else {
        Err(TftpError::PathEscapesRoot(candidate.display().to_string()))
    }
}

fn expand_template(template: &str, filename: &str, remote_ip: IpAddr, remote_port: u16) -> String {
    let mut result = expand_datetime(template);
    result = result.replace("{filename}", filename);
    result = result.replace("{remote_ip}", &remote_ip.to_string());
    result = result.replace("{remote_port}", &remote_port.to_string());
    result
}

fn expand_datetime(template: &str) -> String {
    let mut result = template.to_string();
    for _ in 0..MAX_DATETIME_EXPANSIONS {
        let Some(start) = result.find("{datetime:") else {
            break;
        };
        let Some(end_rel) = result[start..].find('}') else {
            break;
        };
        let end = start + end_rel;
        let fmt = &result[start + "{datetime:".len()..end];
        let formatted = Local::now().format(fmt).to_string();
        result.replace_range(start..=end, &formatted);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn temp_dir(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("snow_owl_tftp_path_test_{}_{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn client() -> (IpAddr, u16) {
        (IpAddr::V4(Ipv4Addr::new(192, 168, 1, 42)), 6969)
    }

    #[test]
    fn resolves_simple_filename() {
        let root = temp_dir("simple");
        std::fs::write(root.join("hello.txt"), b"abc").unwrap();
        let (ip, port) = client();
        let resolved = resolve(&root, "{filename}", "hello.txt", ip, port).unwrap();
        assert_eq!(resolved, root.canonicalize().unwrap().join("hello.txt"));
    }

    #[test]
    fn strips_leading_slash() {
        let root = temp_dir("leading-slash");
        std::fs::write(root.join("hello.txt"), b"abc").unwrap();
        let (ip, port) = client();
        let resolved = resolve(&root, "{filename}", "/hello.txt", ip, port).unwrap();
        assert_eq!(resolved, root.canonicalize().unwrap().join("hello.txt"));
    }

    #[test]
    fn rejects_dotdot_traversal() {
        let root = temp_dir("traversal");
        let (ip, port) = client();
        let err = resolve(&root, "{filename}", "../etc/passwd", ip, port).unwrap_err();
        assert!(matches!(err, TftpError::PathEscapesRoot(_)));
    }

    #[test]
    fn rejects_escape_via_existing_sibling_with_similar_prefix() {
        // root = <tmp>/sandbox, sibling = <tmp>/sandbox-evil: naive string
        // prefix check on "sandbox" would incorrectly allow this.
        let base = temp_dir("prefix-base");
        let root = base.join("sandbox");
        let sibling = base.join("sandbox-evil");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&sibling).unwrap();
        std::fs::write(sibling.join("secret.txt"), b"nope").unwrap();

        let (ip, port) = client();
        let err = resolve(&root, "{filename}", "../sandbox-evil/secret.txt", ip, port).unwrap_err();
        assert!(matches!(err, TftpError::PathEscapesRoot(_)));
    }

    #[test]
    fn allows_new_file_under_nonexistent_ancestor_within_root() {
        let root = temp_dir("new-write");
        let (ip, port) = client();
        let resolved = resolve(&root, "{filename}", "new-upload.bin", ip, port).unwrap();
        assert_eq!(resolved, root.join("new-upload.bin"));
    }

    #[test]
    fn substitutes_remote_ip_and_port() {
        let base = temp_dir("per-client");
        let (ip, port) = client();
        std::fs::create_dir_all(base.join("192.168.1.42")).unwrap();
        let resolved = resolve(
            &base,
            "{remote_ip}/{filename}",
            "report.bin",
            ip,
            port,
        )
        .unwrap();
        assert_eq!(resolved, base.join("192.168.1.42").join("report.bin"));
        let _ = port;
    }

    #[test]
    fn expands_datetime_with_bounded_iterations() {
        let template = "{datetime:%Y}/{filename}";
        let expanded = expand_datetime(template);
        assert!(!expanded.contains("{datetime:"));
        let year = Local::now().format("%Y").to_string();
        assert_eq!(expanded, format!("{year}/{{filename}}"));
    }

    #[test]
    fn rejects_symlink_targets() {
        #[cfg(unix)]
        {
            let root = temp_dir("symlink");
            let real = root.join("real.txt");
            std::fs::write(&real, b"data").unwrap();
            let link = root.join("link.txt");
            std::os::unix::fs::symlink(&real, &link).unwrap();
            let (ip, port) = client();
            let err = resolve(&root, "{filename}", "link.txt", ip, port).unwrap_err();
            assert!(matches!(err, TftpError::PathEscapesRoot(_)));
        }
    }
}
