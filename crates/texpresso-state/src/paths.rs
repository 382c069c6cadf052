//! Inclusion-path resolution and on-disk stat/read helpers.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use texpresso_error::{EngineError, Result};
use texpresso_types::{FsStat, StatTime};

use crate::filesystem::normalize_path;

/// Ordered list of directories searched when a worker opens a relative
/// name.
///
/// Absolute names and names written with a `./` prefix opt out of the
/// search: they are tried exactly as given.
#[derive(Debug, Clone, Default)]
pub struct SearchPath {
    dirs: Vec<PathBuf>,
}

impl SearchPath {
    #[must_use]
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// Parse the worker-facing representation: directories separated by
    /// NUL bytes. Empty components are ignored.
    #[must_use]
    pub fn from_nul_separated(list: &str) -> Self {
        Self {
            dirs: list
                .split('\0')
                .filter(|d| !d.is_empty())
                .map(PathBuf::from)
                .collect(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Resolve `name` to the first candidate that stats successfully.
    ///
    /// The name as given is always tried first; directory expansion only
    /// applies to plain relative names.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<(PathBuf, FsStat)> {
        let direct = Path::new(normalize_path(name));
        if let Some(st) = stat_path(direct) {
            return Some((direct.to_owned(), st));
        }
        if name.starts_with('/') || name.starts_with("./") {
            return None;
        }
        for dir in &self.dirs {
            let candidate = dir.join(name);
            if let Some(st) = stat_path(&candidate) {
                return Some((candidate, st));
            }
        }
        None
    }
}

/// Stat a path into the fields used for change detection. `None` when
/// the file does not exist or cannot be statted.
#[must_use]
pub fn stat_path(path: &Path) -> Option<FsStat> {
    let md = std::fs::metadata(path).ok()?;
    Some(FsStat {
        dev: md.dev(),
        ino: md.ino(),
        mode: md.mode(),
        nlink: md.nlink(),
        uid: md.uid(),
        gid: md.gid(),
        rdev: md.rdev(),
        size: md.size(),
        mtime: StatTime {
            sec: md.mtime(),
            nsec: md.mtime_nsec(),
        },
        ctime: StatTime {
            sec: md.ctime(),
            nsec: md.ctime_nsec(),
        },
    })
}

/// Read a file into memory for the VFS cache.
///
/// # Errors
/// [`EngineError::FileRead`] with the offending path.
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| EngineError::FileRead {
        path: path.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn resolves_through_directories_in_order() {
        let dir_a = tempfile::tempdir().expect("tempdir");
        let dir_b = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir_b.path().join("only-b.sty"), b"b").expect("write");
        std::fs::write(dir_a.path().join("both.sty"), b"a").expect("write");
        std::fs::write(dir_b.path().join("both.sty"), b"b").expect("write");

        let sp = SearchPath::new(vec![dir_a.path().to_owned(), dir_b.path().to_owned()]);

        let (p, _) = sp.resolve("only-b.sty").expect("resolve");
        assert_eq!(p, dir_b.path().join("only-b.sty"));

        let (p, st) = sp.resolve("both.sty").expect("resolve");
        assert_eq!(p, dir_a.path().join("both.sty"));
        assert!(st.is_set());

        assert!(sp.resolve("missing.sty").is_none());
    }

    #[test]
    fn absolute_and_dot_names_skip_the_search() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("f.tex"), b"x").expect("write");
        let sp = SearchPath::new(vec![dir.path().to_owned()]);

        // Plain relative name: found through the search path.
        assert!(sp.resolve("f.tex").is_some());
        // `./` opts out: not found in the cwd.
        assert!(sp.resolve("./f.tex").is_none());
        // Absolute name resolves without the search path.
        let abs = dir.path().join("f.tex");
        assert!(sp.resolve(abs.to_str().expect("utf8")).is_some());
    }

    #[test]
    fn from_nul_separated_skips_empty_components() {
        let sp = SearchPath::from_nul_separated("/a\0\0/b\0");
        assert_eq!(sp.dirs, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }

    #[test]
    fn stat_detects_content_changes() {
        let mut f = tempfile::NamedTempFile::new().expect("tempfile");
        f.write_all(b"one").expect("write");
        f.flush().expect("flush");
        let st1 = stat_path(f.path()).expect("stat");
        f.write_all(b" two").expect("write");
        f.flush().expect("flush");
        let st2 = stat_path(f.path()).expect("stat");
        assert!(!st1.same(&st2));
    }
}
