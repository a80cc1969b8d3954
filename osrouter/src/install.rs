//! Installing `osrouterd` as an rc.d service.
//!
//! Install copies the running executable into place, writes the rc.d
//! script, enables it in rc.conf and starts it. Uninstall reverses each
//! step and tolerates pieces that are already gone.

use crate::command::{argv, display_argv, CommandError, CommandRunner};
use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("{0} subcommand takes no arguments")]
    Usage(&'static str),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("{0}; try running osrouterd with sudo")]
    NotRoot(Box<InstallError>),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> InstallError + '_ {
    move |source| InstallError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Where the service lives on disk.
#[derive(Debug, Clone)]
pub struct InstallPaths {
    /// rc.d variable name, also the rc.conf key.
    pub service: String,
    pub rc_script: PathBuf,
    pub rc_conf: PathBuf,
    pub target_bin: PathBuf,
    /// Binary to install; the running executable when unset.
    pub source_bin: Option<PathBuf>,
    pub config_path: PathBuf,
    pub state_dir: PathBuf,
    pub run_dir: PathBuf,
}

impl InstallPaths {
    /// `<run_dir>/<service>.pid`, written by `osrouterd run`.
    pub fn pidfile(&self) -> PathBuf {
        self.run_dir.join(format!("{}.pid", self.service))
    }
}

impl Default for InstallPaths {
    fn default() -> Self {
        Self {
            service: "osrouterd".into(),
            rc_script: "/etc/rc.d/osrouterd".into(),
            rc_conf: "/etc/rc.conf".into(),
            target_bin: "/usr/sbin/osrouterd".into(),
            source_bin: None,
            config_path: "/etc/osrouter/config.toml".into(),
            state_dir: "/var/lib/osrouter".into(),
            run_dir: "/var/run/osrouter".into(),
        }
    }
}

/// The rc.d script for `paths`.
pub fn rc_script(paths: &InstallPaths) -> String {
    format!(
        r#"#!/bin/sh
#
# PROVIDE: {service}
# REQUIRE: NETWORKING
# KEYWORD: shutdown

. /etc/rc.subr

name="{service}"
rcvar=${{name}}
command="{bin}"
command_args="--config {config} run --pidfile {pidfile} &"
pidfile="{pidfile}"
start_precmd="{service}_prestart"
stop_postcmd="{service}_poststop"

{service}_prestart()
{{
	mkdir -p {state_dir}
	mkdir -p {run_dir}
	chmod 700 {state_dir}
	chmod 755 {run_dir}

	${{command}} --config {config} cleanup 2>/dev/null || true
}}

{service}_poststop()
{{
	${{command}} --config {config} cleanup 2>/dev/null || true
}}

load_rc_config $name
run_rc_command "$1"
"#,
        service = paths.service,
        bin = paths.target_bin.display(),
        config = paths.config_path.display(),
        state_dir = paths.state_dir.display(),
        run_dir = paths.run_dir.display(),
        pidfile = paths.pidfile().display(),
    )
}

/// Appends `line` to an rc.conf style file unless an identical line exists.
pub fn add_rc_conf_line(path: &Path, line: &str) -> io::Result<()> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err),
    };

    if content.lines().any(|l| l.trim() == line) {
        debug!(file = %path.display(), line, "already present");
        return Ok(());
    }

    let mut updated = content;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(line);
    updated.push('\n');
    fs::write(path, updated)
}

/// Drops every line whose trimmed content starts with `<key>=`.
///
/// Whether the file ended in a newline is preserved. A missing file is
/// left missing.
pub fn remove_rc_conf_key(path: &Path, key: &str) -> io::Result<()> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };

    let prefix = format!("{key}=");
    let kept: Vec<&str> = content
        .lines()
        .filter(|line| !line.trim().starts_with(&prefix))
        .collect();

    let mut updated = kept.join("\n");
    if content.ends_with('\n') {
        updated.push('\n');
    }
    fs::write(path, updated)
}

/// The daemon's pid, written on creation and removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &Path) -> Result<Self, InstallError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        fs::write(path, format!("{}\n", std::process::id())).map_err(io_err(path))?;
        debug!(file = %path.display(), "wrote pidfile");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            debug!(file = %self.path.display(), "pidfile not removed: {err}");
        }
    }
}

fn same_file(a: &Path, b: &Path) -> io::Result<bool> {
    let ma = fs::metadata(a)?;
    match fs::metadata(b) {
        Ok(mb) => Ok(ma.dev() == mb.dev() && ma.ino() == mb.ino()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Copies `src` to `dst` through a temporary file so `dst` is replaced
/// atomically with an executable.
fn copy_binary(src: &Path, dst: &Path) -> Result<(), InstallError> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let mut tmp = dst.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::copy(src, &tmp).map_err(io_err(&tmp))?;
    fs::set_permissions(&tmp, fs::Permissions::from_mode(0o755)).map_err(io_err(&tmp))?;
    fs::rename(&tmp, dst).map_err(io_err(dst))?;
    Ok(())
}

fn create_dir(path: &Path, mode: u32) -> Result<(), InstallError> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .map_err(io_err(path))
}

fn hint_root(err: InstallError) -> InstallError {
    if nix::unistd::Uid::effective().is_root() {
        err
    } else {
        InstallError::NotRoot(Box::new(err))
    }
}

/// Installs, enables and starts the service.
pub async fn install_system_daemon<R>(
    runner: &R,
    paths: &InstallPaths,
    args: &[String],
) -> Result<(), InstallError>
where
    R: CommandRunner + ?Sized,
{
    if !args.is_empty() {
        return Err(InstallError::Usage("install"));
    }
    install_inner(runner, paths).await.map_err(hint_root)
}

async fn install_inner<R>(runner: &R, paths: &InstallPaths) -> Result<(), InstallError>
where
    R: CommandRunner + ?Sized,
{
    if let Err(err) = uninstall_inner(runner, paths).await {
        debug!("pre-install cleanup: {err}");
    }

    let exe = match &paths.source_bin {
        Some(path) => path.clone(),
        None => std::env::current_exe().map_err(io_err(Path::new("current executable")))?,
    };
    if !same_file(&exe, &paths.target_bin).map_err(io_err(&exe))? {
        info!(from = %exe.display(), to = %paths.target_bin.display(), "copying binary");
        copy_binary(&exe, &paths.target_bin)?;
    }

    create_dir(&paths.state_dir, 0o700)?;
    create_dir(&paths.run_dir, 0o755)?;

    if let Some(parent) = paths.rc_script.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    fs::write(&paths.rc_script, rc_script(paths)).map_err(io_err(&paths.rc_script))?;
    fs::set_permissions(&paths.rc_script, fs::Permissions::from_mode(0o755))
        .map_err(io_err(&paths.rc_script))?;

    add_rc_conf_line(&paths.rc_conf, &format!("{}=YES", paths.service))
        .map_err(io_err(&paths.rc_conf))?;

    let script = paths.rc_script.to_string_lossy();
    let start = argv(&[&*script, "start"]);
    info!(command = %display_argv(&start), "starting service");
    runner.run(&start).await?;
    Ok(())
}

/// Stops, disables and removes the service. Returns the first failure.
pub async fn uninstall_system_daemon<R>(
    runner: &R,
    paths: &InstallPaths,
    args: &[String],
) -> Result<(), InstallError>
where
    R: CommandRunner + ?Sized,
{
    if !args.is_empty() {
        return Err(InstallError::Usage("uninstall"));
    }
    uninstall_inner(runner, paths).await
}

async fn uninstall_inner<R>(runner: &R, paths: &InstallPaths) -> Result<(), InstallError>
where
    R: CommandRunner + ?Sized,
{
    let mut first: Option<InstallError> = None;

    if paths.rc_script.exists() {
        let script = paths.rc_script.to_string_lossy();
        let stop = argv(&[&*script, "stop"]);
        if let Err(err) = runner.run(&stop).await {
            // Not running is fine.
            debug!("stop: {err}");
        }
    }

    if let Err(err) = remove_rc_conf_key(&paths.rc_conf, &paths.service) {
        warn!(file = %paths.rc_conf.display(), "failed to disable service: {err}");
        first.get_or_insert(InstallError::Io {
            path: paths.rc_conf.clone(),
            source: err,
        });
    }

    match fs::remove_file(&paths.rc_script) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => {
            first.get_or_insert(InstallError::Io {
                path: paths.rc_script.clone(),
                source: err,
            });
        }
        _ => {}
    }

    match first {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
