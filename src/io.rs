use std::fmt::Display;
use std::fs;
use std::time::Instant;

use camino::Utf8Path;
use console::Style;

use crate::error::ClearError;

const ANSI_BLUE: Style = Style::new().blue();

pub fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Empty the output directory, creating it if missing.
///
/// The directory itself is kept, so watchers subscribed to it (the dev
/// server's reload watcher) survive a clean.
pub fn clear_dist(dist: &Utf8Path) -> Result<(), ClearError> {
    let s = Instant::now();

    fs::create_dir_all(dist) //
        .map_err(ClearError::Create)?;

    for entry in fs::read_dir(dist).map_err(ClearError::Remove)? {
        let entry = entry.map_err(ClearError::Remove)?;
        let path = entry.path();

        if entry.file_type().map_err(ClearError::Remove)?.is_dir() {
            fs::remove_dir_all(&path) //
                .map_err(ClearError::Remove)?;
        } else {
            fs::remove_file(&path) //
                .map_err(ClearError::Remove)?;
        }
    }

    tracing::info!("cleaned {} {}", dist, as_overhead(s));

    Ok(())
}

/// Write a file, creating parent directories as needed.
pub fn write_file(path: &Utf8Path, data: impl AsRef<[u8]>) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn clear_removes_previous_output() {
        let (_guard, root) = tempdir();
        let dist = root.join("build");
        write_file(&dist.join("css/old.css"), "a{}").unwrap();

        clear_dist(&dist).unwrap();

        assert!(dist.is_dir());
        assert_eq!(fs::read_dir(&dist).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn clear_keeps_the_directory_itself() {
        use std::os::unix::fs::MetadataExt;

        let (_guard, root) = tempdir();
        let dist = root.join("build");
        write_file(&dist.join("index.html"), "<p>old</p>").unwrap();
        write_file(&dist.join("js/app.js"), "let a;").unwrap();
        let before = fs::metadata(&dist).unwrap().ino();

        clear_dist(&dist).unwrap();

        assert_eq!(fs::metadata(&dist).unwrap().ino(), before);
        assert_eq!(fs::read_dir(&dist).unwrap().count(), 0);
    }

    #[test]
    fn clear_creates_missing_output() {
        let (_guard, root) = tempdir();
        let dist = root.join("nested/build");
        clear_dist(&dist).unwrap();
        assert!(dist.is_dir());
    }
}
