use anyhow::Context;
use std::path::Path;

/// Makes sure `dir` exists and holds no earlier results.
pub fn prepare_output_dir(dir: &Path) -> anyhow::Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create output directory {}", dir.display()))?;
        return Ok(());
    }
    if !dir.is_dir() {
        anyhow::bail!("output path {} is not a directory", dir.display());
    }
    let mut entries = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read output directory {}", dir.display()))?;
    if entries.next().is_some() {
        anyhow::bail!(
            "output directory {} is not empty; refusing to overwrite results",
            dir.display()
        );
    }
    Ok(())
}
