use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};

pub fn is_las_file(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|ex| ex == "las" || ex == "LAS")
        .unwrap_or_default()
}

/**
 * Returns all LAS files from the given file path or directory path, sorted by path. Directories are not
 * traversed recursively! A directory without LAS files yields an empty list, errors while listing it are
 * returned
 */
pub fn get_all_las_files<P: AsRef<Path>>(path: P) -> Result<Vec<PathBuf>> {
    let input_path = path.as_ref();
    if !input_path.exists() {
        return Err(anyhow!(
            "Input path {} does not exist!",
            input_path.display()
        ));
    }

    if input_path.is_file() {
        if !is_las_file(input_path) {
            return Err(anyhow!("Input file {} is no LAS file!", input_path.display()));
        }
        return Ok(vec![input_path.into()]);
    }

    if input_path.is_dir() {
        let mut files = vec![];
        for entry in walkdir::WalkDir::new(input_path).max_depth(1) {
            let entry =
                entry.with_context(|| format!("Could not list directory {}", input_path.display()))?;
            if entry.file_type().is_file() && is_las_file(entry.path()) {
                files.push(entry.into_path());
            }
        }
        files.sort();
        return Ok(files);
    }

    Err(anyhow!(
        "Input path {} is neither file nor directory!",
        input_path.display()
    ))
}

/// Name of the scene stored in the given file, which is the file name without extension
pub fn scene_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_las_file() {
        assert!(is_las_file(Path::new("scans/DEBY_LOD2_4959323.las")));
        assert!(is_las_file(Path::new("scans/DEBY_LOD2_4959323.LAS")));
        assert!(!is_las_file(Path::new("scans/DEBY_LOD2_4959323.laz")));
        assert!(!is_las_file(Path::new("scans/README")));
    }

    #[test]
    fn test_scene_name_strips_extension() {
        assert_eq!(
            scene_name(Path::new("/data/cc_o_DEBY_LOD2_4959323.las")),
            "cc_o_DEBY_LOD2_4959323"
        );
    }

    #[test]
    fn test_missing_input_path_is_an_error() {
        assert!(get_all_las_files("/this/path/does/not/exist").is_err());
    }

    fn scratch_dir(name: &str) -> Result<PathBuf> {
        let dir = std::env::temp_dir().join("readers_files_tests").join(name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    #[test]
    fn test_directory_listing() -> Result<()> {
        let dir = scratch_dir("listing")?;
        assert!(get_all_las_files(&dir)?.is_empty());

        std::fs::write(dir.join("b.las"), b"")?;
        std::fs::write(dir.join("a.LAS"), b"")?;
        std::fs::write(dir.join("notes.txt"), b"")?;
        std::fs::create_dir(dir.join("nested"))?;
        std::fs::write(dir.join("nested").join("c.las"), b"")?;
        let files = get_all_las_files(&dir)?;
        std::fs::remove_dir_all(&dir)?;

        assert_eq!(files, vec![dir.join("a.LAS"), dir.join("b.las")]);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_directory_is_an_error() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = scratch_dir("unreadable")?;
        std::fs::write(dir.join("scan.las"), b"")?;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o000))?;
        // Privileged users can list the directory anyway
        let listable = std::fs::read_dir(&dir).is_ok();
        let result = get_all_las_files(&dir);
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755))?;
        std::fs::remove_dir_all(&dir)?;

        if !listable {
            assert!(result.is_err());
        }
        Ok(())
    }
}
