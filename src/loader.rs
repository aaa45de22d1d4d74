//! # Config Loader
//!
//! Reads the in-repo configuration from a checked-out working tree. Two
//! layouts are supported, and the directory form wins when both exist:
//!
//! 1. **Directory form**: every `.yaml`/`.yml` file below `.prow/`, visited
//!    recursively in lexicographic path order and merged in that order.
//!    Files matched by `.prowignore` at the tree root are skipped.
//! 2. **Single-file form**: `.prow.yaml` at the tree root.
//!
//! Having neither is not an error; the result is an empty config.
//!
//! `.prowignore` uses gitignore syntax, but a file is only skipped when the
//! matcher reports it (or one of its parent directories) as ignored. A `!`
//! rule that matches the file directly keeps it; a `!` rule cannot re-include
//! a file below an ignored directory.

use std::fs;
use std::io;
use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use log::debug;
use walkdir::WalkDir;

use crate::config::{self, InRepoConfig};
use crate::error::{Error, Result, ResultExt};
use crate::git::RepoOpts;

/// Single-file configuration at the repository root
pub const CONFIG_FILE_NAME: &str = ".prow.yaml";

/// Directory of configuration fragments at the repository root
pub const CONFIG_DIR_NAME: &str = ".prow";

/// Ignore file consulted when scanning `CONFIG_DIR_NAME`
pub const IGNORE_FILE_NAME: &str = ".prowignore";

/// Options for working trees that only need the in-repo config.
///
/// Both paths are listed: older git versions do not materialize top-level
/// files in a sparse checkout on their own.
pub fn repo_opts() -> RepoOpts {
    RepoOpts {
        sparse_checkout_dirs: vec![CONFIG_DIR_NAME.to_string(), CONFIG_FILE_NAME.to_string()],
        share_objects_with_source_repo: true,
    }
}

/// Parses the in-repo config of the tree rooted at `dir`. No checkout or
/// defaulting happens here.
///
/// `strict` rejects fields outside the schema. Verification tooling uses it;
/// the serving path does not.
pub fn read_config(dir: &Path, strict: bool) -> Result<InRepoConfig> {
    let config_dir = dir.join(CONFIG_DIR_NAME);
    debug!("Attempting to read config files under {}", config_dir.display());

    match fs::metadata(&config_dir) {
        Ok(meta) if meta.is_dir() => {
            return read_config_dir(dir, &config_dir, strict).with_context(|| {
                format!("failed to read contents of directory {CONFIG_DIR_NAME:?}")
            });
        }
        Ok(_) => debug!("{} is not a directory, ignoring it", config_dir.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(Error::Io(e))
                .with_context(|| format!("reading {}", config_dir.display()));
        }
    }

    let config_file = dir.join(CONFIG_FILE_NAME);
    debug!("Attempting to read {}", config_file.display());
    match read_file(&config_file)? {
        Some(content) => parse_file(&config_file, &content, strict),
        None => Ok(InRepoConfig::default()),
    }
}

/// Reads one config file, `None` if it does not exist. Content that is not
/// UTF-8 is a parse failure of that file.
fn read_file(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => Err(Error::ConfigParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        }),
        Err(e) => Err(Error::Io(e))
            .with_context(|| format!("failed to read {}", path.display())),
    }
}

fn read_config_dir(root: &Path, config_dir: &Path, strict: bool) -> Result<InRepoConfig> {
    let ignore = load_ignore(root)?;
    let mut config = InRepoConfig::default();

    for entry in WalkDir::new(config_dir).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_dir() || !is_yaml(entry.path()) {
            continue;
        }
        let path = entry.path();
        if is_ignored(&ignore, root, path) {
            debug!("Skipping {} matched by {}", path.display(), IGNORE_FILE_NAME);
            continue;
        }

        debug!("Reading YAML file {}", path.display());
        match read_file(path)? {
            Some(content) => config.merge(parse_file(path, &content, strict)?),
            None => debug!("{} disappeared while reading, skipping it", path.display()),
        }
    }

    Ok(config)
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Builds the matcher for `<root>/.prowignore`. A missing file ignores nothing.
fn load_ignore(root: &Path) -> Result<Gitignore> {
    let path = root.join(IGNORE_FILE_NAME);
    if !path.is_file() {
        return Ok(Gitignore::empty());
    }
    let mut builder = GitignoreBuilder::new(root);
    if let Some(err) = builder.add(&path) {
        return Err(err.into());
    }
    Ok(builder.build()?)
}

fn is_ignored(ignore: &Gitignore, root: &Path, path: &Path) -> bool {
    match path.strip_prefix(root) {
        Ok(relative) => ignore
            .matched_path_or_any_parents(relative, false)
            .is_ignore(),
        Err(_) => false,
    }
}

fn parse_file(path: &Path, content: &str, strict: bool) -> Result<InRepoConfig> {
    config::parse(content, strict).map_err(|err| match err {
        Error::UnknownFields { fields, .. } => Error::UnknownFields {
            path: path.to_path_buf(),
            fields,
        },
        Error::Yaml(e) => Error::ConfigParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        },
        other => Error::ConfigParse {
            path: path.to_path_buf(),
            message: other.to_string(),
        },
    })
}

/// Reports whether any of the changed files (repository relative paths)
/// could be in-repo config.
///
/// May report false positives: `.prowignore` is not consulted. Never reports
/// false negatives, so it is safe for skipping config loads on changes that
/// cannot affect jobs.
pub fn contains_config_path<S: AsRef<str>>(files: &[S]) -> bool {
    let dir_prefix = format!("{CONFIG_DIR_NAME}/");
    files
        .iter()
        .map(AsRef::as_ref)
        .any(|file| file == CONFIG_FILE_NAME || file.starts_with(&dir_prefix))
}
