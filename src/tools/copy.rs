use std::fs;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::config::AssetGroup;
use crate::task::is_reserved;

/// Copies every file matched by `group` into `output`, mirroring paths
/// relative to the group's base. Files which would land inside one of the
/// `reserved` subtrees are left out. Returns the number of files copied.
pub fn copy_group(
    group: &AssetGroup,
    output: &Utf8Path,
    reserved: &[Utf8PathBuf],
) -> anyhow::Result<usize> {
    let mut files = Vec::new();
    for pattern in group.globs() {
        for path in glob::glob(&pattern).with_context(|| format!("bad glob '{pattern}'"))? {
            let path = Utf8PathBuf::try_from(path?)?;
            if path.is_file() {
                files.push(path);
            }
        }
    }

    files.sort();
    files.dedup();

    let mut copies = Vec::with_capacity(files.len());
    for path in files {
        let rel = group.dest.join(path.strip_prefix(&group.base)?);
        if is_reserved(reserved, &rel) {
            tracing::warn!(group = %group.name, "not copying {path}, {rel} belongs to another task");
            continue;
        }
        copies.push((path, output.join(rel)));
    }

    let target = output.join(&group.dest);
    let count = copies.len();

    copies
        .into_par_iter()
        .map(|(path, dest)| -> anyhow::Result<()> {
            if let Some(dir) = dest.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::copy(&path, &dest).with_context(|| format!("copying {path} to {dest}"))?;
            Ok(())
        })
        .collect::<anyhow::Result<()>>()?;

    tracing::debug!(group = %group.name, "copied {count} files to {target}");

    Ok(count)
}
