//! Preparing a work directory for cross-compiling kernel modules against a COS kernel.
//!
//! The toolchain and kernel headers are unpacked into the work directory itself and everything the
//! installer needs from the environment is collected into a [`ToolchainEnv`] that is handed to the
//! child process. Nothing here touches the environment of the running process.

use super::command::{run_and_log, CommandError};
use super::BuildError;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const TOOLCHAIN_BIN_DIR: &str = "bin";
const SYSROOT_DIR: &str = "usr/x86_64-cros-linux-gnu";
const KERNEL_HEADERS_DIR: &str = "usr/src";
const KERNEL_HEADERS_PREFIX: &str = "linux-headers-";
const LINKER_NAME: &str = "ld";
const LINKER_TARGET: &str = "x86_64-cros-linux-gnu-ld";
const EXECUTABLE_MODE: u32 = 0o755;

/// Unpacks a (possibly compressed) tarball into `dest_dir`.
pub async fn extract(
    archive: &Path,
    dest_dir: &Path,
    cancel: &CancellationToken,
) -> Result<(), BuildError> {
    info!(archive = %archive.display(), "Unpacking archive");

    let mut command = Command::new("tar");
    command.arg("xf").arg(archive).arg("-C").arg(dest_dir);

    run_and_log(command, cancel).await.map_err(|e| match e {
        CommandError::Cancelled(_) => BuildError::Cancelled,
        e => BuildError::Toolchain(format!(
            "could not extract '{}'; {e}",
            archive.display()
        )),
    })?;

    debug!(archive = %archive.display(), "Done unpacking archive");
    Ok(())
}

/// Parses `KEY=VALUE` lines. Surrounding single or double quotes are stripped from values and
/// blank lines are ignored.
pub fn parse_env_file(content: &str) -> Result<BTreeMap<String, String>, BuildError> {
    let mut vars = BTreeMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(BuildError::Toolchain(format!(
                "unrecognized toolchain env line '{line}'"
            )));
        };

        vars.insert(
            key.to_string(),
            value.trim_matches(&['"', '\''][..]).to_string(),
        );
    }

    Ok(vars)
}

/// Points `<bin dir>/ld` at the COS cross linker, replacing whatever is there.
pub fn force_symlink_linker(bin_dir: &Path) -> Result<PathBuf, BuildError> {
    let link = bin_dir.join(LINKER_NAME);
    let io_err = |source: std::io::Error| BuildError::Io {
        path: link.clone(),
        source,
    };

    std::fs::create_dir_all(bin_dir).map_err(|source| BuildError::Io {
        path: bin_dir.to_path_buf(),
        source,
    })?;

    if link.symlink_metadata().is_ok() {
        std::fs::remove_file(&link).map_err(io_err)?;
    }

    std::os::unix::fs::symlink(LINKER_TARGET, &link).map_err(io_err)?;
    Ok(link)
}

/// Writes an executable named after the compiler into `work_dir` that runs the real compiler from
/// `<work_dir>/bin` without `-Werror=strict-prototypes`. The kernel build always passes that flag
/// and newer clang releases reject code the NVIDIA kernel interface still contains.
pub fn write_cc_wrapper(work_dir: &Path, cc: &str) -> Result<PathBuf, BuildError> {
    if cc.is_empty() || cc.contains('/') || cc.contains(char::is_whitespace) {
        return Err(BuildError::Toolchain(format!(
            "CC must be a bare compiler name; found '{cc}'"
        )));
    }

    let path = work_dir.join(cc);
    let script = cc_wrapper_script(&work_dir.join(TOOLCHAIN_BIN_DIR).join(cc));

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(EXECUTABLE_MODE)
        .open(&path)
        .map_err(|source| BuildError::Io {
            path: path.clone(),
            source,
        })?;

    file.write_all(script.as_bytes())
        .map_err(|source| BuildError::Io {
            path: path.clone(),
            source,
        })?;

    debug!(wrapper = %path.display(), "Created CC wrapper");
    Ok(path)
}

fn cc_wrapper_script(compiler: &Path) -> String {
    format!(
        r#"#!/bin/bash
for arg; do
  shift
  if [[ "${{arg}}" == "-Werror=strict-prototypes" ]]; then continue; fi
  set -- "$@" "${{arg}}"
done
exec "{}" "$@"
"#,
        compiler.display()
    )
}

/// The single `usr/src/linux-headers-*` directory unpacked from the kernel headers tarball.
pub fn kernel_source_dir(work_dir: &Path) -> Result<PathBuf, BuildError> {
    let headers_root = work_dir.join(KERNEL_HEADERS_DIR);

    let entries = std::fs::read_dir(&headers_root).map_err(|e| {
        BuildError::Toolchain(format!(
            "no kernel headers found at '{}'; {e}",
            headers_root.display()
        ))
    })?;

    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with(KERNEL_HEADERS_PREFIX)
        })
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();

    if candidates.len() != 1 {
        candidates.sort();
        return Err(BuildError::Toolchain(format!(
            "expected exactly one kernel headers directory under '{}'; found {candidates:?}",
            headers_root.display()
        )));
    }

    Ok(candidates.remove(0))
}

/// Environment handed to the NVIDIA installer for one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainEnv {
    vars: BTreeMap<String, OsString>,
}

impl ToolchainEnv {
    /// Derives the installer environment for a work directory that already contains the unpacked
    /// toolchain, and installs the linker symlink and CC wrapper the installer relies on.
    ///
    /// `inherited_path` is the `PATH` the work directory entries are prepended to.
    pub fn prepare(
        work_dir: &Path,
        env_file: &Path,
        inherited_path: Option<OsString>,
    ) -> Result<Self, BuildError> {
        let content = std::fs::read_to_string(env_file).map_err(|source| BuildError::Io {
            path: env_file.to_path_buf(),
            source,
        })?;

        let parsed = parse_env_file(&content)?;

        let cc = parsed
            .get("CC")
            .ok_or_else(|| BuildError::Toolchain("toolchain env does not set CC".into()))?;

        let bin_dir = work_dir.join(TOOLCHAIN_BIN_DIR);
        force_symlink_linker(&bin_dir)?;
        write_cc_wrapper(work_dir, cc)?;

        let mut paths = vec![work_dir.to_path_buf(), bin_dir];
        if let Some(inherited) = &inherited_path {
            paths.extend(std::env::split_paths(inherited));
        }
        let path = std::env::join_paths(paths)
            .map_err(|e| BuildError::Toolchain(format!("could not build PATH; {e}")))?;

        let mut vars: BTreeMap<String, OsString> = parsed
            .into_iter()
            .map(|(key, value)| (key, OsString::from(value)))
            .collect();
        vars.insert("PATH".into(), path);
        vars.insert(
            "SYSROOT".into(),
            work_dir.join(SYSROOT_DIR).into_os_string(),
        );

        for (key, value) in &vars {
            debug!(key, value = %value.to_string_lossy(), "Installer environment");
        }

        Ok(Self { vars })
    }

    pub fn vars(&self) -> &BTreeMap<String, OsString> {
        &self.vars
    }

    pub fn get(&self, key: &str) -> Option<&OsString> {
        self.vars.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::os::unix::fs::PermissionsExt;

    #[rstest]
    #[case::plain("CC=x86_64-cros-linux-gnu-clang", "CC", "x86_64-cros-linux-gnu-clang")]
    #[case::double_quoted("CC=\"x86_64-cros-linux-gnu-clang\"", "CC", "x86_64-cros-linux-gnu-clang")]
    #[case::single_quoted("CXX='x86_64-cros-linux-gnu-clang++'", "CXX", "x86_64-cros-linux-gnu-clang++")]
    #[case::value_with_equals("CFLAGS=-O2 -DX=1", "CFLAGS", "-O2 -DX=1")]
    #[case::surrounding_space("  LD=x86_64-cros-linux-gnu-ld  ", "LD", "x86_64-cros-linux-gnu-ld")]
    fn test_parse_env_file(#[case] content: &str, #[case] key: &str, #[case] value: &str) {
        let vars = parse_env_file(content).unwrap();
        assert_eq!(vars.get(key).map(String::as_str), Some(value));
    }

    #[test]
    fn parse_env_file_skips_blank_lines() {
        let vars = parse_env_file("CC=clang\n\n   \nCXX=clang++\n").unwrap();
        assert_eq!(vars.len(), 2);
    }

    #[test]
    fn parse_env_file_rejects_malformed_line() {
        let err = parse_env_file("CC=clang\nnot an assignment\n").unwrap_err();
        assert!(matches!(err, BuildError::Toolchain(_)));
    }

    #[test]
    fn symlink_can_be_forced_twice() {
        let dir = tempfile::tempdir().unwrap();
        let bin_dir = dir.path().join("bin");

        force_symlink_linker(&bin_dir).unwrap();
        let link = force_symlink_linker(&bin_dir).unwrap();

        assert_eq!(
            std::fs::read_link(link).unwrap(),
            PathBuf::from("x86_64-cros-linux-gnu-ld")
        );
    }

    #[test]
    fn cc_wrapper_is_executable_and_drops_flag() {
        let dir = tempfile::tempdir().unwrap();

        let wrapper = write_cc_wrapper(dir.path(), "x86_64-cros-linux-gnu-clang").unwrap();

        assert_eq!(wrapper, dir.path().join("x86_64-cros-linux-gnu-clang"));
        let mode = std::fs::metadata(&wrapper).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);

        let script = std::fs::read_to_string(&wrapper).unwrap();
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("-Werror=strict-prototypes"));
        assert!(script.ends_with(&format!(
            "exec \"{}\" \"$@\"\n",
            dir.path().join("bin/x86_64-cros-linux-gnu-clang").display()
        )));
    }

    #[rstest]
    #[case::path("/usr/bin/clang")]
    #[case::with_args("clang -m64")]
    #[case::empty("")]
    fn cc_wrapper_rejects_non_bare_names(#[case] cc: &str) {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            write_cc_wrapper(dir.path(), cc).unwrap_err(),
            BuildError::Toolchain(_)
        ));
    }

    #[rstest]
    #[case::none(&[], false)]
    #[case::one(&["linux-headers-5.15.55-34.m101"], true)]
    #[case::two(&["linux-headers-5.15.55-34.m101", "linux-headers-5.10.133-43.r97"], false)]
    fn test_kernel_source_dir(#[case] dirs: &[&str], #[case] found: bool) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("usr/src/unrelated")).unwrap();
        for name in dirs {
            std::fs::create_dir_all(dir.path().join("usr/src").join(name)).unwrap();
        }

        let result = kernel_source_dir(dir.path());

        if found {
            assert_eq!(
                result.unwrap(),
                dir.path().join("usr/src/linux-headers-5.15.55-34.m101")
            );
        } else {
            assert!(matches!(result.unwrap_err(), BuildError::Toolchain(_)));
        }
    }

    #[test]
    fn prepare_builds_record_local_env() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("toolchain_env");
        std::fs::write(
            &env_file,
            "CC=\"x86_64-cros-linux-gnu-clang\"\nCXX=\"x86_64-cros-linux-gnu-clang++\"\n",
        )
        .unwrap();

        let env = ToolchainEnv::prepare(
            dir.path(),
            &env_file,
            Some(OsString::from("/usr/local/bin:/usr/bin")),
        )
        .unwrap();

        let path: Vec<PathBuf> = std::env::split_paths(env.get("PATH").unwrap()).collect();
        assert_eq!(
            path,
            vec![
                dir.path().to_path_buf(),
                dir.path().join("bin"),
                PathBuf::from("/usr/local/bin"),
                PathBuf::from("/usr/bin"),
            ]
        );
        assert_eq!(
            env.get("SYSROOT").unwrap(),
            dir.path().join("usr/x86_64-cros-linux-gnu").as_os_str()
        );
        assert_eq!(
            env.get("CC").unwrap(),
            &OsString::from("x86_64-cros-linux-gnu-clang")
        );
        assert!(dir.path().join("x86_64-cros-linux-gnu-clang").exists());
        assert!(dir.path().join("bin/ld").symlink_metadata().is_ok());
    }

    #[test]
    fn prepare_requires_cc() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("toolchain_env");
        std::fs::write(&env_file, "CXX=x86_64-cros-linux-gnu-clang++\n").unwrap();

        let err = ToolchainEnv::prepare(dir.path(), &env_file, None).unwrap_err();
        assert!(matches!(err, BuildError::Toolchain(_)));
    }

    #[tokio::test]
    async fn extract_unpacks_into_dir() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("usr/src/linux-headers-5.15.55-34.m101")).unwrap();
        let archive = src.path().join("kernel-headers.tgz");
        let status = std::process::Command::new("tar")
            .arg("czf")
            .arg(&archive)
            .arg("-C")
            .arg(src.path())
            .arg("usr")
            .status()
            .unwrap();
        assert!(status.success());

        let dest = tempfile::tempdir().unwrap();
        extract(&archive, dest.path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            kernel_source_dir(dest.path()).unwrap(),
            dest.path().join("usr/src/linux-headers-5.15.55-34.m101")
        );
    }

    #[tokio::test]
    async fn extract_reports_bad_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("toolchain.tar.xz");
        std::fs::write(&archive, "definitely not a tarball").unwrap();

        let err = extract(&archive, dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Toolchain(_)));
    }
}
